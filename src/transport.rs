use anyhow::{Result, anyhow};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

/// Global atomic ID counter for generating unique CDP message IDs.
static GLOBAL_ID_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Returns a unique incremental ID for request messages.
pub(crate) fn next_id() -> usize {
    GLOBAL_ID_COUNTER.fetch_add(1, Ordering::SeqCst) + 1
}

/// Messages sent to the transport actor.
#[derive(Debug)]
enum TransportMessage {
    /// A request command with a response sender.
    Request(Value, oneshot::Sender<Result<TransportResponse>>),
    /// Listener for session-wrapped responses with the given inner ID.
    ListenTargetMessage(u64, oneshot::Sender<Result<TransportResponse>>),
    /// Persistent subscription to an unsolicited CDP event by method name.
    SubscribeEvent(String, mpsc::Sender<Value>),
    /// Drops the subscription for the given method, closing its channel.
    UnsubscribeEvent(String),
    /// Command to shut down the transport.
    Shutdown,
}

/// Responses produced by the transport actor.
#[derive(Debug)]
pub(crate) enum TransportResponse {
    Response(Response),
    Target(TargetMessage),
}

/// A generic CDP response correlated by ID. Exactly one of `result` and
/// `error` is populated; the other deserializes to null.
#[derive(Debug, Deserialize)]
pub(crate) struct Response {
    pub(crate) id: u64,
    #[serde(default)]
    pub(crate) result: Value,
    #[serde(default)]
    pub(crate) error: Value,
}

/// A `Target.receivedMessageFromTarget` notification.
#[derive(Debug)]
pub(crate) struct TargetMessage {
    pub(crate) params: Value,
}

/// Turns a correlated response into the caller's outcome, surfacing
/// protocol errors rather than swallowing them.
fn response_outcome(response: Response) -> Result<TransportResponse> {
    if response.error.is_null() {
        Ok(TransportResponse::Response(response))
    } else {
        Err(anyhow!("CDP error: {}", response.error))
    }
}

/// Internal transport actor managing WebSocket communication,
/// request-response correlation and event dispatch.
struct TransportActor {
    pending_requests: HashMap<u64, oneshot::Sender<Result<TransportResponse>>>,
    event_subscribers: HashMap<String, mpsc::Sender<Value>>,
    ws_sink: SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>,
    command_rx: mpsc::Receiver<TransportMessage>,
}

impl TransportActor {
    async fn run(mut self, mut ws_stream: SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>) {
        loop {
            tokio::select! {
                Some(msg) = ws_stream.next() => {
                    match msg {
                        Ok(Message::Text(text)) => self.handle_incoming(&text),
                        Err(_) => break,
                        _ => {}
                    }
                }
                Some(msg) = self.command_rx.recv() => {
                    match msg {
                        TransportMessage::Request(cmd, tx) => {
                            if let Some(id) = cmd["id"].as_u64()
                                && let Ok(text) = serde_json::to_string(&cmd) {
                                    if self.ws_sink.send(Message::Text(text)).await.is_ok() {
                                        self.pending_requests.insert(id, tx);
                                    } else {
                                        let _ = tx.send(Err(anyhow!("WebSocket send failed")));
                                    }
                                }
                        }
                        TransportMessage::ListenTargetMessage(id, tx) => {
                            self.pending_requests.insert(id, tx);
                        }
                        TransportMessage::SubscribeEvent(method, tx) => {
                            self.event_subscribers.insert(method, tx);
                        }
                        TransportMessage::UnsubscribeEvent(method) => {
                            self.event_subscribers.remove(&method);
                        }
                        TransportMessage::Shutdown => {
                            let _ = self.ws_sink.send(Message::Text(json!({
                                "id": next_id(),
                                "method": "Browser.close",
                                "params": {}
                            }).to_string())).await;
                            let _ = self.ws_sink.close().await;
                            break;
                        }
                    }
                }
                else => break,
            }
        }
    }

    /// Routes one incoming WebSocket text frame.
    ///
    /// Three shapes arrive on the browser connection: direct responses
    /// (`{id, result}`), session-wrapped messages inside
    /// `Target.receivedMessageFromTarget` (themselves either responses with
    /// an inner `id` or events with a `method`), and browser-level events.
    fn handle_incoming(&mut self, text: &str) {
        if let Ok(response) = serde_json::from_str::<Response>(text) {
            if let Some(sender) = self.pending_requests.remove(&response.id) {
                let _ = sender.send(response_outcome(response));
            }
            return;
        }

        let Ok(envelope) = serde_json::from_str::<Value>(text) else {
            return;
        };

        if envelope["method"] == "Target.receivedMessageFromTarget" {
            let Some(inner_str) = envelope["params"]["message"].as_str() else {
                return;
            };
            let Ok(inner) = serde_json::from_str::<Value>(inner_str) else {
                return;
            };
            if let Some(id) = inner["id"].as_u64() {
                if let Some(sender) = self.pending_requests.remove(&id) {
                    let _ = sender.send(Ok(TransportResponse::Target(TargetMessage {
                        params: envelope["params"].clone(),
                    })));
                }
            } else if let Some(method) = inner["method"].as_str() {
                self.dispatch_event(method, inner["params"].clone());
            }
        } else if let Some(method) = envelope["method"].as_str() {
            self.dispatch_event(method, envelope["params"].clone());
        }
    }

    fn dispatch_event(&mut self, method: &str, params: Value) {
        if let Some(tx) = self.event_subscribers.get(method) {
            // A lagging subscriber loses events rather than stalling the socket.
            if tx.try_send(params).is_err() && tx.is_closed() {
                self.event_subscribers.remove(method);
            }
        }
    }
}

/// Asynchronous transport interface to the Chrome DevTools Protocol over WebSocket.
#[derive(Debug)]
pub(crate) struct Transport {
    tx: mpsc::Sender<TransportMessage>,
}

impl Transport {
    /// Creates a new transport connected to the specified WebSocket URL.
    pub(crate) async fn new(ws_url: &str) -> Result<Self> {
        let (ws_stream, _) = connect_async(ws_url).await?;
        let (ws_sink, ws_stream) = ws_stream.split();
        let (tx, rx) = mpsc::channel(100);

        tokio::spawn(async move {
            let actor = TransportActor {
                pending_requests: HashMap::new(),
                event_subscribers: HashMap::new(),
                ws_sink,
                command_rx: rx,
            };
            actor.run(ws_stream).await;
        });

        Ok(Self { tx })
    }

    /// Sends a browser-level command and awaits its response.
    pub(crate) async fn send(&self, command: Value) -> Result<TransportResponse> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(TransportMessage::Request(command, tx))
            .await
            .map_err(|_| anyhow!("Transport actor dropped"))?;
        time::timeout(Duration::from_secs(10), rx)
            .await
            .map_err(|_| anyhow!("Timeout waiting for response"))?
            .map_err(|_| anyhow!("Response channel closed"))?
    }

    /// Sends a command into an attached session and awaits the
    /// session-wrapped response with the matching inner ID.
    pub(crate) async fn send_to_session(
        &self,
        session_id: &str,
        method: &str,
        params: Value,
    ) -> Result<Value> {
        let msg_id = next_id();
        let msg = json!({ "id": msg_id, "method": method, "params": params }).to_string();

        let send_fut = self.send(json!({
            "id": next_id(),
            "method": "Target.sendMessageToTarget",
            "params": { "sessionId": session_id, "message": msg }
        }));
        let recv_fut = self.get_target_msg(msg_id);

        let (_, target_msg) = futures_util::try_join!(send_fut, recv_fut)?;

        match target_msg {
            TransportResponse::Target(res) => {
                let str_msg = res.params["message"]
                    .as_str()
                    .ok_or_else(|| anyhow!("Invalid target message format"))?;
                let parsed: Value = serde_json::from_str(str_msg)?;
                if !parsed["error"].is_null() {
                    return Err(anyhow!("CDP error from {method}: {}", parsed["error"]));
                }
                Ok(parsed)
            }
            other => Err(anyhow!("Unexpected response: {:?}", other)),
        }
    }

    /// Waits for a specific session-wrapped response by inner message ID.
    async fn get_target_msg(&self, msg_id: usize) -> Result<TransportResponse> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(TransportMessage::ListenTargetMessage(msg_id as u64, tx))
            .await
            .map_err(|_| anyhow!("Transport actor dropped"))?;
        time::timeout(Duration::from_secs(10), rx)
            .await
            .map_err(|_| anyhow!("Timeout waiting for target message"))?
            .map_err(|_| anyhow!("Response channel closed"))?
    }

    /// Subscribes to an unsolicited CDP event stream by method name.
    ///
    /// One subscriber per method; a second subscription replaces the first.
    /// Call [`Transport::unsubscribe_event`] to close the stream.
    pub(crate) async fn subscribe_event(&self, method: &str) -> Result<mpsc::Receiver<Value>> {
        let (tx, rx) = mpsc::channel(64);
        self.tx
            .send(TransportMessage::SubscribeEvent(method.to_string(), tx))
            .await
            .map_err(|_| anyhow!("Transport actor dropped"))?;
        Ok(rx)
    }

    /// Drops the subscription for the given event, closing its channel.
    pub(crate) async fn unsubscribe_event(&self, method: &str) {
        let _ = self
            .tx
            .send(TransportMessage::UnsubscribeEvent(method.to_string()))
            .await;
    }

    /// Initiates a graceful shutdown of the transport.
    pub(crate) async fn shutdown(&self) {
        let _ = self.tx.send(TransportMessage::Shutdown).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_increasing() {
        let a = next_id();
        let b = next_id();
        assert!(b > a);
    }

    #[test]
    fn error_responses_surface_the_protocol_error() {
        let response: Response = serde_json::from_str(
            r#"{"id":7,"error":{"code":-32601,"message":"'Page.frobnicate' wasn't found"}}"#,
        )
        .unwrap();
        let err = response_outcome(response).unwrap_err();
        assert!(err.to_string().contains("wasn't found"));
    }

    #[test]
    fn ok_responses_pass_through() {
        let response: Response =
            serde_json::from_str(r#"{"id":8,"result":{"targetId":"abc"}}"#).unwrap();
        match response_outcome(response).unwrap() {
            TransportResponse::Response(r) => {
                assert_eq!(r.id, 8);
                assert_eq!(r.result["targetId"], "abc");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
