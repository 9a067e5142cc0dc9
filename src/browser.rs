mod browser_config;
mod temp_dir;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use std::io::{BufRead, BufReader};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::browser::browser_config::BrowserConfig;
use crate::browser::temp_dir::ScratchDir;
use crate::tab::Tab;
use crate::transport::Transport;
use crate::types::Viewport;

/// Holds the browser process and its profile directory.
/// Kills the process and removes the profile on drop.
struct BrowserProcess {
    child: Child,
    _temp: ScratchDir,
}

impl Drop for BrowserProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        // `_temp` drops afterwards, deleting the profile directory.
    }
}

/// A running browser instance reachable over CDP.
pub struct Browser {
    transport: Arc<Transport>,
    process: Mutex<Option<BrowserProcess>>,
}

impl Browser {
    /// Launches a headless browser instance.
    pub async fn new(viewport: &Viewport) -> Result<Self> {
        Self::launch(viewport, true).await
    }

    /// Launches a browser instance with a visible window.
    pub async fn new_with_head(viewport: &Viewport) -> Result<Self> {
        Self::launch(viewport, false).await
    }

    async fn launch(viewport: &Viewport, headless: bool) -> Result<Self> {
        let config = BrowserConfig::new(viewport, headless)?;

        #[cfg(windows)]
        let mut cmd = {
            use std::os::windows::process::CommandExt;
            let mut c = Command::new(&config.executable_path);
            c.creation_flags(0x08000000); // CREATE_NO_WINDOW
            c
        };
        #[cfg(not(windows))]
        let mut cmd = Command::new(&config.executable_path);

        let mut child = cmd
            .args(config.get_browser_args())
            .stderr(Stdio::piped())
            .spawn()
            .context("Failed to spawn browser process")?;
        let stderr = child.stderr.take().context("No stderr from browser")?;
        let ws_url = Self::wait_for_ws(stderr).await?;

        Ok(Self {
            transport: Arc::new(Transport::new(&ws_url).await?),
            process: Mutex::new(Some(BrowserProcess {
                child,
                _temp: config.temp_dir,
            })),
        })
    }

    /// Reads browser stderr lines to extract the DevTools WebSocket URL.
    async fn wait_for_ws(stderr: std::process::ChildStderr) -> Result<String> {
        let reader = BufReader::new(stderr);
        let re = Regex::new(r"listening on (.*/devtools/browser/.*)$")?;
        tokio::task::spawn_blocking(move || {
            for line in reader.lines() {
                let l = line?;
                if let Some(cap) = re.captures(&l) {
                    return Ok(cap[1].to_string());
                }
            }
            Err(anyhow!("DevTools WebSocket URL not found in browser stderr"))
        })
        .await?
    }

    /// Opens a new blank tab.
    pub async fn new_tab(&self) -> Result<Tab> {
        Tab::new(self.transport.clone()).await
    }

    /// Closes the browser process and releases its resources.
    pub async fn close(&self) -> Result<()> {
        self.transport.shutdown().await;
        let mut lock = self.process.lock().await;
        // Taking the process triggers kill, wait and profile removal on drop.
        drop(lock.take());
        Ok(())
    }
}
