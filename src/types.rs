use clap::ValueEnum;
use std::path::PathBuf;

/// Fallback target when neither `--url` nor `PAGEREEL_URL` is set.
pub const DEFAULT_URL: &str = "http://localhost:3000";

/// Viewport configuration applied to the captured page.
#[derive(Debug, Clone)]
pub struct Viewport {
    /// Viewport width in CSS pixels.
    pub width: u32,
    /// Viewport height in CSS pixels.
    pub height: u32,
    /// Device scale factor (DPR). Higher values produce sharper captures.
    pub device_scale_factor: f64,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            device_scale_factor: 2.0,
        }
    }
}

impl Viewport {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            ..Default::default()
        }
    }

    pub fn with_device_scale_factor(mut self, factor: f64) -> Self {
        self.device_scale_factor = factor;
        self
    }

    /// Physical pixel dimensions of the capture surface.
    pub fn device_size(&self) -> (u32, u32) {
        (
            (self.width as f64 * self.device_scale_factor) as u32,
            (self.height as f64 * self.device_scale_factor) as u32,
        )
    }
}

impl std::str::FromStr for Viewport {
    type Err = String;

    /// Parses a `WIDTHxHEIGHT` specification such as `1280x720`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("expected WIDTHxHEIGHT, got '{s}'"))?;
        let width: u32 = w.trim().parse().map_err(|_| format!("invalid width '{w}'"))?;
        let height: u32 = h
            .trim()
            .parse()
            .map_err(|_| format!("invalid height '{h}'"))?;
        if width == 0 || height == 0 {
            return Err("viewport dimensions must be non-zero".to_string());
        }
        Ok(Viewport::new(width, height))
    }
}

/// How the page is driven while the capture runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum CaptureStrategy {
    /// Visit each page section in order, waiting for its reveal and
    /// typing-effect markers before advancing. Records a screencast video.
    #[default]
    Section,
    /// One smooth scroll from top to bottom over a fixed duration.
    /// Records a screencast video.
    Scroll,
    /// Step through fixed scroll offsets, screenshotting the viewport at
    /// each step into a numbered frame sequence.
    Frames,
}

impl CaptureStrategy {
    /// Whether this strategy records a raw video (as opposed to still frames).
    pub fn records_video(&self) -> bool {
        !matches!(self, CaptureStrategy::Frames)
    }
}

/// Full configuration for one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Target page URL.
    pub url: String,
    pub strategy: CaptureStrategy,
    pub viewport: Viewport,
    /// Directory holding intermediate artifacts (raw video, palette, frames).
    pub work_dir: PathBuf,
    /// Final animated GIF path. The only artifact that survives a run.
    pub output: PathBuf,
    /// Launch the browser with a visible window.
    pub headful: bool,
}

impl PipelineConfig {
    /// Resolves the target URL from an explicit value falling back to the
    /// literal default.
    pub fn resolve_url(explicit: Option<String>) -> String {
        explicit
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| DEFAULT_URL.to_string())
    }

    pub fn raw_video_path(&self) -> PathBuf {
        self.work_dir.join("raw.mp4")
    }

    pub fn palette_path(&self) -> PathBuf {
        self.work_dir.join("palette.png")
    }

    pub fn frames_dir(&self) -> PathBuf {
        self.work_dir.join("frames")
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            strategy: CaptureStrategy::default(),
            viewport: Viewport::default(),
            work_dir: PathBuf::from("capture"),
            output: PathBuf::from("preview.gif"),
            headful: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_falls_back_to_default() {
        assert_eq!(PipelineConfig::resolve_url(None), DEFAULT_URL);
        assert_eq!(PipelineConfig::resolve_url(Some(String::new())), DEFAULT_URL);
        assert_eq!(
            PipelineConfig::resolve_url(Some("https://site.test".into())),
            "https://site.test"
        );
    }

    #[test]
    fn intermediates_live_under_work_dir() {
        let cfg = PipelineConfig::default();
        assert!(cfg.raw_video_path().starts_with(&cfg.work_dir));
        assert!(cfg.palette_path().starts_with(&cfg.work_dir));
        assert!(cfg.frames_dir().starts_with(&cfg.work_dir));
        assert!(!cfg.output.starts_with(&cfg.work_dir));
    }

    #[test]
    fn device_size_applies_scale_factor() {
        let vp = Viewport::new(1280, 720).with_device_scale_factor(2.0);
        assert_eq!(vp.device_size(), (2560, 1440));
    }

    #[test]
    fn viewport_parses_width_by_height() {
        let vp: Viewport = "1920x1080".parse().unwrap();
        assert_eq!((vp.width, vp.height), (1920, 1080));
        let vp: Viewport = "800X600".parse().unwrap();
        assert_eq!((vp.width, vp.height), (800, 600));
    }

    #[test]
    fn viewport_rejects_malformed_specs() {
        assert!("1280".parse::<Viewport>().is_err());
        assert!("x720".parse::<Viewport>().is_err());
        assert!("wide x tall".parse::<Viewport>().is_err());
        assert!("0x720".parse::<Viewport>().is_err());
    }

    #[test]
    fn only_frames_strategy_skips_video() {
        assert!(CaptureStrategy::Section.records_video());
        assert!(CaptureStrategy::Scroll.records_video());
        assert!(!CaptureStrategy::Frames.records_video());
    }
}
