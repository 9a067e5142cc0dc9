use clap::Parser;
use log::error;
use std::path::PathBuf;

use pagereel::{CaptureStrategy, PipelineConfig, Viewport};

/// Capture a running web page into a looping GIF preview.
#[derive(Debug, Parser)]
#[command(name = "pagereel", version, about)]
struct Cli {
    /// Target page URL.
    #[arg(long, env = "PAGEREEL_URL")]
    url: Option<String>,

    /// How to drive the page while capturing.
    #[arg(long, value_enum, default_value = "section")]
    strategy: CaptureStrategy,

    /// Final GIF path.
    #[arg(long, default_value = "preview.gif")]
    output: PathBuf,

    /// Directory for intermediate artifacts.
    #[arg(long, default_value = "capture")]
    work_dir: PathBuf,

    /// Viewport size as WIDTHxHEIGHT.
    #[arg(long, default_value = "1280x720")]
    viewport: Viewport,

    /// Device scale factor; higher values sharpen the capture.
    #[arg(long, default_value_t = 2.0)]
    dpr: f64,

    /// Launch the browser with a visible window.
    #[arg(long)]
    headful: bool,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let cfg = PipelineConfig {
        url: PipelineConfig::resolve_url(cli.url),
        strategy: cli.strategy,
        viewport: cli.viewport.with_device_scale_factor(cli.dpr),
        work_dir: cli.work_dir,
        output: cli.output,
        headful: cli.headful,
    };

    if let Err(e) = pagereel::run(&cfg).await {
        error!("{e:?}");
        std::process::exit(1);
    }
}
