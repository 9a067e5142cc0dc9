use anyhow::{Context, Result, bail};
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time;

use crate::browser::Browser;
use crate::capture;
use crate::encode::{self, EncodeInput};
use crate::recorder::Recorder;
use crate::types::{CaptureStrategy, PipelineConfig};

const NAV_TIMEOUT: Duration = Duration::from_secs(30);
/// Settle time for entrance animations after the page goes idle.
const ENTRANCE_SETTLE: Duration = Duration::from_millis(2000);
/// Settle time after the synthetic pointer move unlocks gated playback.
const POINTER_SETTLE: Duration = Duration::from_millis(1000);
/// Grace period for the recorder's file to land on disk after close.
const FLUSH_GRACE: Duration = Duration::from_millis(500);

const VIDEO_EXTENSIONS: [&str; 3] = ["mp4", "webm", "mov"];

/// Tracks every intermediate artifact a run produces and deletes them all
/// exactly once, on success or failure. Absent files are not errors.
/// The `Drop` impl is the backstop for early unwinds.
pub(crate) struct ArtifactSet {
    raw_videos: Vec<PathBuf>,
    palette: Option<PathBuf>,
    frames_dir: Option<PathBuf>,
    cleaned: bool,
}

impl ArtifactSet {
    pub(crate) fn new() -> Self {
        Self {
            raw_videos: Vec::new(),
            palette: None,
            frames_dir: None,
            cleaned: false,
        }
    }

    pub(crate) fn add_raw_video(&mut self, path: PathBuf) {
        self.raw_videos.push(path);
    }

    pub(crate) fn set_palette(&mut self, path: PathBuf) {
        self.palette = Some(path);
    }

    /// Registers the frames directory for cleanup. Must be called before
    /// the frame driver starts so frames written by a capture that aborts
    /// partway are still swept.
    pub(crate) fn track_frames_dir(&mut self, dir: PathBuf) {
        self.frames_dir = Some(dir);
    }

    pub(crate) fn cleanup(&mut self) {
        if self.cleaned {
            return;
        }
        self.cleaned = true;
        self.remove_all();
    }

    fn remove_all(&self) {
        for path in &self.raw_videos {
            let _ = std::fs::remove_file(path);
        }
        if let Some(palette) = &self.palette {
            let _ = std::fs::remove_file(palette);
        }
        if let Some(dir) = &self.frames_dir {
            if let Ok(entries) = std::fs::read_dir(dir) {
                for entry in entries.flatten() {
                    let path = entry.path();
                    if is_frame_file(&path) {
                        let _ = std::fs::remove_file(path);
                    }
                }
            }
            // Only goes through if the directory emptied out.
            let _ = std::fs::remove_dir(dir);
        }
    }
}

fn is_frame_file(path: &Path) -> bool {
    path.extension().is_some_and(|e| e == "png")
        && path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("frame_"))
}

impl Drop for ArtifactSet {
    fn drop(&mut self) {
        if !self.cleaned {
            self.remove_all();
        }
    }
}

/// Runs the whole pipeline once: probe, capture, encode, clean up.
///
/// The encoder probe comes first so a missing dependency fails before any
/// browser work is spent. Cleanup runs on every exit path.
pub async fn run(cfg: &PipelineConfig) -> Result<()> {
    encode::ensure_ffmpeg()?;

    std::fs::create_dir_all(&cfg.work_dir)
        .with_context(|| format!("Failed to create {}", cfg.work_dir.display()))?;

    let mut artifacts = ArtifactSet::new();
    let result = capture_and_encode(cfg, &mut artifacts).await;
    artifacts.cleanup();
    result
}

async fn capture_and_encode(cfg: &PipelineConfig, artifacts: &mut ArtifactSet) -> Result<()> {
    info!("Launching browser");
    let browser = if cfg.headful {
        Browser::new_with_head(&cfg.viewport).await?
    } else {
        Browser::new(&cfg.viewport).await?
    };

    let captured = drive_page(cfg, &browser, artifacts).await;

    // The browser closes on both paths; for video modes this is also what
    // lets the recorder's output settle on disk.
    if let Err(e) = browser.close().await {
        warn!("Failed to close browser: {e:?}");
    }

    let input = finalize_assets(cfg, captured?, artifacts).await?;

    artifacts.set_palette(cfg.palette_path());
    encode::encode_gif(&input, &cfg.palette_path(), &cfg.output)?;

    info!("Preview written to {}", cfg.output.display());
    Ok(())
}

/// Bootstraps the tab, waits for readiness and runs the configured driver.
async fn drive_page(
    cfg: &PipelineConfig,
    browser: &Browser,
    artifacts: &mut ArtifactSet,
) -> Result<EncodeInput> {
    let tab = browser.new_tab().await?;
    tab.set_viewport(&cfg.viewport).await?;

    info!("Navigating to {}", cfg.url);
    tab.goto_idle(&cfg.url, NAV_TIMEOUT).await?;
    time::sleep(ENTRANCE_SETTLE).await;

    // Nudge the pointer into the page to satisfy interaction gating.
    tab.move_mouse(
        cfg.viewport.width as f64 / 2.0,
        cfg.viewport.height as f64 / 3.0,
    )
    .await?;
    time::sleep(POINTER_SETTLE).await;

    let input = match cfg.strategy {
        CaptureStrategy::Frames => {
            let frames_dir = cfg.frames_dir();
            // Registered up front: frames written before a mid-capture
            // failure must not outlive the run.
            artifacts.track_frames_dir(frames_dir.clone());
            capture::run_frames_driver(&tab, &frames_dir).await?;
            EncodeInput::FrameSequence(frames_dir)
        }
        strategy => {
            let (dev_w, dev_h) = cfg.viewport.device_size();
            let raw = cfg.raw_video_path();
            artifacts.add_raw_video(raw.clone());

            let recorder = Recorder::start(&tab, dev_w, dev_h, &raw).await?;
            let driven = match strategy {
                CaptureStrategy::Section => capture::run_section_driver(&tab).await,
                _ => capture::run_scroll_driver(&tab).await,
            };
            let stopped = recorder.stop(&tab).await;
            driven?;
            stopped?;

            EncodeInput::Video(raw)
        }
    };

    if let Err(e) = tab.close().await {
        warn!("Failed to close tab: {e:?}");
    }

    Ok(input)
}

/// Confirms the raw capture exists before encoding starts.
///
/// For video modes the expected path is checked after a flush grace delay;
/// if it is missing, the work dir is scanned for anything with a video
/// extension and the first match is adopted. No asset at all is fatal.
async fn finalize_assets(
    cfg: &PipelineConfig,
    input: EncodeInput,
    artifacts: &mut ArtifactSet,
) -> Result<EncodeInput> {
    match input {
        EncodeInput::Video(expected) => {
            time::sleep(FLUSH_GRACE).await;
            if expected.exists() {
                return Ok(EncodeInput::Video(expected));
            }
            warn!(
                "Expected raw video {} missing, scanning {}",
                expected.display(),
                cfg.work_dir.display()
            );
            if let Some(found) = scan_for_video(&cfg.work_dir)? {
                info!("Adopting {}", found.display());
                artifacts.add_raw_video(found.clone());
                return Ok(EncodeInput::Video(found));
            }
            bail!("Raw capture asset not produced");
        }
        EncodeInput::FrameSequence(dir) => {
            if !dir.join(capture::frame_filename(0)).exists() {
                bail!("Raw capture asset not produced");
            }
            Ok(EncodeInput::FrameSequence(dir))
        }
    }
}

fn scan_for_video(dir: &Path) -> Result<Option<PathBuf>> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if let Some(ext) = path.extension().and_then(|e| e.to_str())
            && VIDEO_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str())
        {
            return Ok(Some(path));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        std::fs::write(path, b"x").unwrap();
    }

    #[test]
    fn cleanup_removes_all_intermediates() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("raw.mp4");
        let palette = dir.path().join("palette.png");
        let frames_dir = dir.path().join("frames");
        std::fs::create_dir(&frames_dir).unwrap();
        let frame = frames_dir.join("frame_000.png");
        touch(&raw);
        touch(&palette);
        touch(&frame);

        let mut artifacts = ArtifactSet::new();
        artifacts.add_raw_video(raw.clone());
        artifacts.set_palette(palette.clone());
        artifacts.track_frames_dir(frames_dir.clone());
        artifacts.cleanup();

        assert!(!raw.exists());
        assert!(!palette.exists());
        assert!(!frame.exists());
        assert!(!frames_dir.exists());
    }

    #[test]
    fn cleanup_sweeps_frames_written_before_a_capture_abort() {
        let dir = tempfile::tempdir().unwrap();
        let frames_dir = dir.path().join("frames");
        std::fs::create_dir(&frames_dir).unwrap();

        // Mirror the frame driver's order of operations: the directory is
        // registered first, then frames land one by one until a failure
        // stops the capture partway through.
        let mut artifacts = ArtifactSet::new();
        artifacts.track_frames_dir(frames_dir.clone());
        for i in 0..3 {
            touch(&frames_dir.join(crate::capture::frame_filename(i)));
        }

        artifacts.cleanup();
        for i in 0..3 {
            assert!(!frames_dir.join(crate::capture::frame_filename(i)).exists());
        }
        assert!(!frames_dir.exists());
    }

    #[test]
    fn frame_sweep_spares_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let frames_dir = dir.path().join("frames");
        std::fs::create_dir(&frames_dir).unwrap();
        let foreign = frames_dir.join("notes.txt");
        touch(&foreign);
        touch(&frames_dir.join("frame_000.png"));

        let mut artifacts = ArtifactSet::new();
        artifacts.track_frames_dir(frames_dir.clone());
        artifacts.cleanup();

        assert!(foreign.exists());
        // The directory stays because it never emptied out.
        assert!(frames_dir.exists());
    }

    #[test]
    fn cleanup_tolerates_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut artifacts = ArtifactSet::new();
        artifacts.add_raw_video(dir.path().join("never-written.mp4"));
        artifacts.set_palette(dir.path().join("no-palette.png"));
        artifacts.cleanup();
        artifacts.cleanup(); // second call is a no-op
    }

    #[test]
    fn drop_is_a_cleanup_backstop() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("raw.mp4");
        touch(&raw);
        {
            let mut artifacts = ArtifactSet::new();
            artifacts.add_raw_video(raw.clone());
            // Dropped without an explicit cleanup, as on an early unwind.
        }
        assert!(!raw.exists());
    }

    #[test]
    fn cleanup_leaves_unrelated_files_alone() {
        let dir = tempfile::tempdir().unwrap();
        let keep = dir.path().join("preview.gif");
        let raw = dir.path().join("raw.mp4");
        touch(&keep);
        touch(&raw);

        let mut artifacts = ArtifactSet::new();
        artifacts.add_raw_video(raw.clone());
        artifacts.cleanup();

        assert!(keep.exists());
        assert!(!raw.exists());
    }

    #[test]
    fn scan_finds_first_video_extension() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("palette.png"));
        assert!(scan_for_video(dir.path()).unwrap().is_none());

        touch(&dir.path().join("capture.webm"));
        let found = scan_for_video(dir.path()).unwrap().unwrap();
        assert_eq!(found.extension().unwrap(), "webm");
    }
}
