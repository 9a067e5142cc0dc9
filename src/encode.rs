use anyhow::{Context, Result, anyhow};
use log::{debug, info};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Frame rate of the final animation.
const GIF_FPS: u32 = 10;
/// Output width; height follows the source aspect ratio.
const GIF_WIDTH: u32 = 640;

/// What the encoder reads: a raw capture video, or a numbered frame
/// sequence matching `frame_%03d.png` in a directory.
#[derive(Debug, Clone)]
pub(crate) enum EncodeInput {
    Video(PathBuf),
    FrameSequence(PathBuf),
}

impl EncodeInput {
    fn input_args(&self) -> Vec<String> {
        match self {
            EncodeInput::Video(path) => {
                vec!["-i".into(), path.display().to_string()]
            }
            EncodeInput::FrameSequence(dir) => vec![
                "-framerate".into(),
                GIF_FPS.to_string(),
                "-i".into(),
                dir.join("frame_%03d.png").display().to_string(),
            ],
        }
    }
}

/// A single ffmpeg invocation built as an argument array.
///
/// Paths go in as discrete arguments, never interpolated into a shell
/// string, so they cannot be re-tokenized or injected into.
#[derive(Debug)]
pub(crate) struct FfmpegJob {
    args: Vec<String>,
}

impl FfmpegJob {
    fn new(args: Vec<String>) -> Self {
        Self { args }
    }

    #[cfg(test)]
    pub(crate) fn args(&self) -> &[String] {
        &self.args
    }

    /// Runs the job to completion. Nonzero exit is an error.
    pub(crate) fn run(&self) -> Result<()> {
        debug!("ffmpeg {}", self.args.join(" "));
        let status = Command::new("ffmpeg")
            .args(&self.args)
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .status()
            .context("Failed to run ffmpeg")?;
        if !status.success() {
            return Err(anyhow!("ffmpeg exited with status {status}"));
        }
        Ok(())
    }
}

/// Verifies the external encoder is available before any capture work.
pub(crate) fn ensure_ffmpeg() -> Result<()> {
    find_encoder(std::env::var_os("PATH")).map(|_| ())
}

fn find_encoder(path_var: Option<std::ffi::OsString>) -> Result<PathBuf> {
    let cwd = std::env::current_dir().context("No working directory")?;
    which::which_in("ffmpeg", path_var, cwd).map_err(|_| {
        anyhow!(
            "ffmpeg not found on PATH. The preview encoder requires it; \
             install it with your package manager (e.g. `apt install ffmpeg` \
             or `brew install ffmpeg`)."
        )
    })
}

/// Shared sampling/scaling filter for both passes.
fn base_filter() -> String {
    format!("fps={GIF_FPS},scale={GIF_WIDTH}:-1:flags=lanczos")
}

/// First pass: derive the optimal color palette from the capture.
pub(crate) fn palette_job(input: &EncodeInput, palette: &Path) -> FfmpegJob {
    let mut args: Vec<String> = vec!["-y".into(), "-loglevel".into(), "error".into()];
    args.extend(input.input_args());
    args.extend([
        "-vf".into(),
        format!("{},palettegen", base_filter()),
        palette.display().to_string(),
    ]);
    FfmpegJob::new(args)
}

/// Second pass: encode the looping GIF against the generated palette.
pub(crate) fn gif_job(input: &EncodeInput, palette: &Path, output: &Path) -> FfmpegJob {
    let mut args: Vec<String> = vec!["-y".into(), "-loglevel".into(), "error".into()];
    args.extend(input.input_args());
    args.extend([
        "-i".into(),
        palette.display().to_string(),
        "-filter_complex".into(),
        format!("{}[x];[x][1:v]paletteuse", base_filter()),
        "-loop".into(),
        "0".into(),
        output.display().to_string(),
    ]);
    FfmpegJob::new(args)
}

/// Runs both encoder passes in order.
pub(crate) fn encode_gif(input: &EncodeInput, palette: &Path, output: &Path) -> Result<()> {
    info!("Generating palette");
    palette_job(input, palette)
        .run()
        .context("Palette generation failed")?;

    info!("Encoding {}", output.display());
    gif_job(input, palette, output)
        .run()
        .context("GIF encoding failed")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video_input() -> EncodeInput {
        EncodeInput::Video(PathBuf::from("capture/raw.mp4"))
    }

    #[test]
    fn palette_pass_samples_scales_and_overwrites() {
        let job = palette_job(&video_input(), Path::new("capture/palette.png"));
        let args = job.args();
        assert_eq!(args[0], "-y");
        assert!(args.contains(&"capture/raw.mp4".to_string()));
        let vf = args[args.iter().position(|a| a == "-vf").unwrap() + 1].clone();
        assert!(vf.contains("palettegen"));
        assert!(vf.contains("fps=10"));
        assert!(vf.contains("scale=640:-1:flags=lanczos"));
        assert_eq!(args.last().unwrap(), "capture/palette.png");
    }

    #[test]
    fn gif_pass_composites_palette_and_loops_forever() {
        let job = gif_job(
            &video_input(),
            Path::new("capture/palette.png"),
            Path::new("preview.gif"),
        );
        let args = job.args();
        assert_eq!(args[0], "-y");
        let fc = args[args.iter().position(|a| a == "-filter_complex").unwrap() + 1].clone();
        assert!(fc.contains("paletteuse"));
        let loop_val = &args[args.iter().position(|a| a == "-loop").unwrap() + 1];
        assert_eq!(loop_val, "0");
        assert_eq!(args.last().unwrap(), "preview.gif");
    }

    #[test]
    fn frame_sequence_input_uses_numbered_glob() {
        let input = EncodeInput::FrameSequence(PathBuf::from("capture/frames"));
        let args = input.input_args();
        assert!(
            args.iter()
                .any(|a| a.ends_with("frame_%03d.png") && a.contains("frames"))
        );
        assert!(args.contains(&"-framerate".to_string()));
    }

    #[test]
    fn missing_encoder_fails_with_an_actionable_message() {
        // An empty search path guarantees the probe finds nothing,
        // whatever is installed on the machine running the tests.
        let err = find_encoder(Some(std::ffi::OsString::new())).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("ffmpeg"));
        assert!(msg.contains("install"));
    }

    #[test]
    fn paths_stay_single_arguments() {
        let input = EncodeInput::Video(PathBuf::from("dir with spaces/raw capture.mp4"));
        let job = palette_job(&input, Path::new("palette.png"));
        assert!(
            job.args()
                .contains(&"dir with spaces/raw capture.mp4".to_string())
        );
    }
}
