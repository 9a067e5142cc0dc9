use anyhow::{Context, Result, anyhow};
use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use log::{debug, warn};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::tab::Tab;
use crate::transport::Transport;

/// Frame rate the raw capture video is stamped with.
const RAW_VIDEO_FPS: u32 = 15;

/// Records a tab's screencast into a raw video file.
///
/// Screencast frames arrive as base64 PNGs on the CDP event stream and are
/// piped straight into an ffmpeg child encoding the raw intermediate video.
/// Each frame must be acked or Chrome stops delivering more.
pub(crate) struct Recorder {
    child: Child,
    writer: JoinHandle<Result<u64>>,
    out_path: PathBuf,
}

impl Recorder {
    /// Starts the screencast and the encoding child.
    ///
    /// `width`/`height` bound the screencast frames so every frame arrives
    /// at the same dimensions the encoder was told to expect.
    pub(crate) async fn start(tab: &Tab, width: u32, height: u32, out_path: &Path) -> Result<Self> {
        let args: Vec<String> = vec![
            "-y".into(),
            "-loglevel".into(),
            "error".into(),
            "-f".into(),
            "image2pipe".into(),
            "-framerate".into(),
            RAW_VIDEO_FPS.to_string(),
            "-c:v".into(),
            "png".into(),
            "-i".into(),
            "pipe:0".into(),
            "-vf".into(),
            format!("scale={width}:{height}"),
            "-c:v".into(),
            "libx264".into(),
            "-pix_fmt".into(),
            "yuv420p".into(),
        ];
        let mut child = Command::new("ffmpeg")
            .args(&args)
            .arg(out_path)
            .kill_on_drop(true)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .context("Failed to spawn ffmpeg for screencast recording")?;

        let mut stdin = child.stdin.take().context("No stdin on ffmpeg child")?;

        let mut frames = tab.transport().subscribe_event("Page.screencastFrame").await?;

        tab.send_cmd(
            "Page.startScreencast",
            json!({
                "format": "png",
                "everyNthFrame": 1,
                "maxWidth": width,
                "maxHeight": height,
            }),
        )
        .await?;

        let transport: Arc<Transport> = tab.transport();
        let session_id = tab.session_id().to_string();

        let writer = tokio::spawn(async move {
            let mut count: u64 = 0;
            while let Some(params) = frames.recv().await {
                // Ack first so Chrome keeps streaming while we encode.
                if let Some(ack) = params["sessionId"].as_i64() {
                    let _ = transport
                        .send_to_session(
                            &session_id,
                            "Page.screencastFrameAck",
                            json!({ "sessionId": ack }),
                        )
                        .await;
                }

                let Some(data) = params["data"].as_str() else {
                    continue;
                };
                let bytes = BASE64_STANDARD
                    .decode(data)
                    .context("Invalid screencast frame payload")?;
                stdin
                    .write_all(&bytes)
                    .await
                    .context("Failed to write frame to ffmpeg stdin")?;
                count += 1;
            }
            stdin.shutdown().await.ok();
            drop(stdin);
            Ok(count)
        });

        Ok(Self {
            child,
            writer,
            out_path: out_path.to_path_buf(),
        })
    }

    /// Stops the screencast, flushes the encoder and returns the video path.
    pub(crate) async fn stop(mut self, tab: &Tab) -> Result<PathBuf> {
        tab.send_cmd("Page.stopScreencast", json!({})).await?;
        // Closing the subscription ends the writer loop and ffmpeg's stdin.
        tab.transport().unsubscribe_event("Page.screencastFrame").await;

        let frames = self
            .writer
            .await
            .context("Screencast writer task panicked")??;
        debug!("Screencast delivered {frames} frames");
        if frames == 0 {
            warn!("Screencast produced no frames; the raw video will be missing");
        }

        let status = self
            .child
            .wait()
            .await
            .context("Failed to wait for ffmpeg recorder")?;
        if !status.success() {
            return Err(anyhow!("ffmpeg recorder exited with status {status}"));
        }

        Ok(self.out_path)
    }
}
