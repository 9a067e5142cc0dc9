use anyhow::{Context, Result, anyhow};
use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;

use crate::transport::{Transport, TransportResponse, next_id};
use crate::types::Viewport;

/// A CDP browser tab (target) session.
pub struct Tab {
    transport: Arc<Transport>,
    session_id: String,
    target_id: String,
}

impl Tab {
    /// Creates a new blank tab and attaches to it.
    pub(crate) async fn new(transport: Arc<Transport>) -> Result<Self> {
        let TransportResponse::Response(res_create) = transport
            .send(json!({ "id": next_id(), "method": "Target.createTarget", "params": { "url": "about:blank" } }))
            .await? else { return Err(anyhow!("Invalid response type")); };

        let target_id = res_create.result["targetId"]
            .as_str()
            .context("No targetId")?
            .to_string();

        let TransportResponse::Response(res_attach) = transport
            .send(json!({ "id": next_id(), "method": "Target.attachToTarget", "params": { "targetId": target_id } }))
            .await? else { return Err(anyhow!("Invalid response type")); };

        let session_id = res_attach.result["sessionId"]
            .as_str()
            .context("No sessionId")?
            .to_string();

        Ok(Self {
            transport,
            session_id,
            target_id,
        })
    }

    pub(crate) async fn send_cmd(&self, method: &str, params: Value) -> Result<Value> {
        self.transport
            .send_to_session(&self.session_id, method, params)
            .await
    }

    pub(crate) fn transport(&self) -> Arc<Transport> {
        self.transport.clone()
    }

    pub(crate) fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Applies a fixed viewport and pixel-density override to the page.
    pub async fn set_viewport(&self, viewport: &Viewport) -> Result<&Self> {
        self.send_cmd(
            "Emulation.setDeviceMetricsOverride",
            json!({
                "width": viewport.width,
                "height": viewport.height,
                "deviceScaleFactor": viewport.device_scale_factor,
                "mobile": false,
            }),
        )
        .await?;
        Ok(self)
    }

    /// Navigates to `url` and waits for the page to reach network idle,
    /// bounded by `timeout`. A timeout here is a fatal navigation error.
    pub async fn goto_idle(&self, url: &str, timeout: Duration) -> Result<&Self> {
        self.send_cmd("Page.enable", json!({})).await?;
        self.send_cmd("Page.setLifecycleEventsEnabled", json!({ "enabled": true }))
            .await?;

        // Subscribe before navigating so the idle event cannot be missed.
        let mut events = self.transport.subscribe_event("Page.lifecycleEvent").await?;

        let navigate = self
            .send_cmd("Page.navigate", json!({ "url": url }))
            .await?;
        if let Some(err) = navigate["result"]["errorText"].as_str() {
            self.transport.unsubscribe_event("Page.lifecycleEvent").await;
            return Err(anyhow!("Navigation to {url} failed: {err}"));
        }

        // Lifecycle events for the about:blank document can already be
        // queued; only an idle event for this navigation's loader counts.
        let loader_id = navigate["result"]["loaderId"].as_str().map(str::to_string);

        let wait = async {
            while let Some(params) = events.recv().await {
                if lifecycle_reached(&params, "networkIdle", loader_id.as_deref()) {
                    return Ok(());
                }
            }
            Err(anyhow!("Lifecycle event channel closed"))
        };

        let result = time::timeout(timeout, wait)
            .await
            .map_err(|_| anyhow!("Timed out waiting for network idle on {url}"));
        self.transport.unsubscribe_event("Page.lifecycleEvent").await;
        result??;

        Ok(self)
    }

    /// Evaluates a JS expression in the page and returns its value.
    pub async fn evaluate(&self, expression: &str) -> Result<Value> {
        let result = self
            .send_cmd(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": true
                }),
            )
            .await?;
        Ok(result["result"]["result"]["value"].clone())
    }

    /// Evaluates a JS expression expected to produce a number.
    pub async fn evaluate_f64(&self, expression: &str) -> Result<f64> {
        self.evaluate(expression)
            .await?
            .as_f64()
            .with_context(|| format!("Expression did not yield a number: {expression}"))
    }

    /// Evaluates a JS expression expected to produce a boolean.
    pub async fn evaluate_bool(&self, expression: &str) -> Result<bool> {
        Ok(self.evaluate(expression).await?.as_bool().unwrap_or(false))
    }

    /// Dispatches a synthetic mouse move into the page. Used to satisfy
    /// interaction gating (autoplay and the like) on the captured page.
    pub async fn move_mouse(&self, x: f64, y: f64) -> Result<&Self> {
        self.send_cmd(
            "Input.dispatchMouseEvent",
            json!({ "type": "mouseMoved", "x": x, "y": y }),
        )
        .await?;
        Ok(self)
    }

    /// Scrolls the window to a vertical offset, smoothly or instantly.
    pub async fn scroll_to(&self, y: f64, smooth: bool) -> Result<&Self> {
        let behavior = if smooth { "smooth" } else { "auto" };
        self.evaluate(&format!(
            "window.scrollTo({{ top: {y}, behavior: '{behavior}' }})"
        ))
        .await?;
        Ok(self)
    }

    /// Total scrollable distance: document height minus one viewport.
    pub async fn max_scroll(&self) -> Result<f64> {
        let d = self
            .evaluate_f64(
                "Math.max(0, document.documentElement.scrollHeight - window.innerHeight)",
            )
            .await?;
        Ok(d)
    }

    /// Captures a viewport-only PNG screenshot and returns the decoded bytes.
    pub async fn screenshot_viewport(&self) -> Result<Vec<u8>> {
        let result = self
            .send_cmd(
                "Page.captureScreenshot",
                json!({
                    "format": "png",
                    "fromSurface": true,
                    "captureBeyondViewport": false,
                }),
            )
            .await?;

        let data = result["result"]["data"]
            .as_str()
            .context("No image data received")?;
        Ok(BASE64_STANDARD.decode(data)?)
    }

    /// Closes the target tab. Issued at the browser level since the
    /// session dies with the target.
    pub async fn close(&self) -> Result<()> {
        self.transport
            .send(json!({
                "id": next_id(),
                "method": "Target.closeTarget",
                "params": { "targetId": self.target_id }
            }))
            .await?;
        Ok(())
    }
}

/// True when a lifecycle event has the given name and belongs to the
/// navigation identified by `loader_id` (any loader when unknown).
fn lifecycle_reached(params: &Value, name: &str, loader_id: Option<&str>) -> bool {
    if params["name"] != name {
        return false;
    }
    match loader_id {
        Some(id) => params["loaderId"].as_str() == Some(id),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_idle_events_from_an_earlier_loader_are_ignored() {
        let stale = json!({ "name": "networkIdle", "loaderId": "blank-doc" });
        assert!(!lifecycle_reached(&stale, "networkIdle", Some("nav-1")));
    }

    #[test]
    fn idle_event_for_the_current_loader_is_accepted() {
        let event = json!({ "name": "networkIdle", "loaderId": "nav-1" });
        assert!(lifecycle_reached(&event, "networkIdle", Some("nav-1")));
    }

    #[test]
    fn other_lifecycle_names_never_match() {
        let event = json!({ "name": "load", "loaderId": "nav-1" });
        assert!(!lifecycle_reached(&event, "networkIdle", Some("nav-1")));
    }

    #[test]
    fn unknown_loader_accepts_any_idle_event() {
        let event = json!({ "name": "networkIdle", "loaderId": "whatever" });
        assert!(lifecycle_reached(&event, "networkIdle", None));
    }
}
