//! Websocket client for the hosted change feed.
//!
//! Speaks Phoenix channel framing (`{topic, event, payload, ref}`), joins the
//! `messages` table topic and republishes row changes as [`ChangeEvent`]s.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{broadcast, Mutex as TokioMutex};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsFrame};
use tracing::{debug, error, info, warn};

use crate::error::{ChatError, Result};
use crate::models::Message;
use crate::store::{ChangeEvent, ChangeKind, CHANGE_FEED_CAPACITY};

pub const MESSAGES_TOPIC: &str = "realtime:public:messages";
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);
const RECONNECT_DELAY: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Frame {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChangeData {
    #[serde(rename = "type")]
    kind: ChangeKind,
    #[serde(default)]
    record: Option<Message>,
}

impl Frame {
    pub fn join(access_token: &str, reference: u64) -> Self {
        Self {
            topic: MESSAGES_TOPIC.to_string(),
            event: "phx_join".to_string(),
            payload: json!({
                "config": {
                    "broadcast": { "self": false },
                    "presence": { "key": "" },
                    "postgres_changes": [
                        { "event": "*", "schema": "public", "table": "messages" }
                    ]
                },
                "access_token": access_token,
            }),
            reference: Some(reference.to_string()),
        }
    }

    pub fn heartbeat(reference: u64) -> Self {
        Self {
            topic: "phoenix".to_string(),
            event: "heartbeat".to_string(),
            payload: json!({}),
            reference: Some(reference.to_string()),
        }
    }

    pub fn leave(reference: u64) -> Self {
        Self {
            topic: MESSAGES_TOPIC.to_string(),
            event: "phx_leave".to_string(),
            payload: json!({}),
            reference: Some(reference.to_string()),
        }
    }

    /// Decode a `postgres_changes` frame; other frames yield `None`.
    pub fn change_event(&self) -> Result<Option<ChangeEvent>> {
        if self.event != "postgres_changes" {
            return Ok(None);
        }
        let data = self
            .payload
            .get("data")
            .cloned()
            .ok_or_else(|| ChatError::Realtime("Change frame without data".to_string()))?;
        let data: ChangeData = serde_json::from_value(data)?;
        let record = match data.kind {
            ChangeKind::Delete => None,
            _ => data.record,
        };
        Ok(Some(ChangeEvent {
            kind: data.kind,
            record,
        }))
    }

    /// Join or heartbeat reply carrying an error status.
    fn reply_error(&self) -> Option<String> {
        if self.event != "phx_reply" {
            return None;
        }
        match self.payload.get("status").and_then(Value::as_str) {
            Some("ok") | None => None,
            Some(_) => Some(self.payload.get("response").map(Value::to_string).unwrap_or_default()),
        }
    }
}

pub fn decode_frame(text: &str) -> Result<Frame> {
    Ok(serde_json::from_str(text)?)
}

pub struct RealtimeClient {
    url: String,
    access_token: String,
    changes: broadcast::Sender<ChangeEvent>,
    connected: Arc<TokioMutex<bool>>,
    /// Shutdown signal broadcaster
    shutdown_tx: broadcast::Sender<()>,
}

impl RealtimeClient {
    pub fn new(url: impl Into<String>, access_token: impl Into<String>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            url: url.into(),
            access_token: access_token.into(),
            changes,
            connected: Arc::new(TokioMutex::new(false)),
            shutdown_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }

    pub async fn is_connected(&self) -> bool {
        *self.connected.lock().await
    }

    /// Spawn the connection loop. It reconnects until [`shutdown`](Self::shutdown).
    pub fn connect(&self) {
        let url = self.url.clone();
        let access_token = self.access_token.clone();
        let changes = self.changes.clone();
        let connected = self.connected.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut reference: u64 = 0;
            loop {
                if shutdown_rx.try_recv().is_ok() {
                    info!("Shutdown signal received, stopping reconnection");
                    break;
                }

                debug!("Connecting to realtime service");
                match connect_async(url.as_str()).await {
                    Ok((ws_stream, _)) => {
                        info!("Connected to realtime service");
                        *connected.lock().await = true;
                        let (mut ws_write, mut ws_read) = ws_stream.split();

                        reference += 1;
                        let join = serde_json::to_string(&Frame::join(&access_token, reference));
                        let sent = match join {
                            Ok(text) => ws_write.send(WsFrame::Text(text.into())).await.is_ok(),
                            Err(e) => {
                                error!(error = %e, "Failed to encode join frame");
                                false
                            }
                        };

                        let mut should_reconnect = true;
                        if sent {
                            let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
                            heartbeat.tick().await;

                            loop {
                                tokio::select! {
                                    _ = shutdown_rx.recv() => {
                                        info!("Shutdown signal received, leaving channel");
                                        reference += 1;
                                        if let Ok(text) = serde_json::to_string(&Frame::leave(reference)) {
                                            let _ = ws_write.send(WsFrame::Text(text.into())).await;
                                        }
                                        if let Err(e) = ws_write.send(WsFrame::Close(None)).await {
                                            warn!(error = %e, "Failed to send close frame");
                                        }
                                        should_reconnect = false;
                                        break;
                                    }
                                    _ = heartbeat.tick() => {
                                        reference += 1;
                                        let Ok(text) = serde_json::to_string(&Frame::heartbeat(reference)) else {
                                            continue;
                                        };
                                        if ws_write.send(WsFrame::Text(text.into())).await.is_err() {
                                            error!("Failed to send heartbeat");
                                            break;
                                        }
                                    }
                                    msg = ws_read.next() => {
                                        match msg {
                                            Some(Ok(WsFrame::Text(text))) => handle_text(&text, &changes),
                                            Some(Ok(WsFrame::Close(_))) | None => {
                                                info!("Realtime service closed connection");
                                                break;
                                            }
                                            Some(Err(e)) => {
                                                error!(error = %e, "WebSocket error");
                                                break;
                                            }
                                            _ => {}
                                        }
                                    }
                                }
                            }
                        } else {
                            error!("Failed to join change feed");
                        }

                        *connected.lock().await = false;
                        info!("Disconnected from realtime service");
                        if !should_reconnect {
                            break;
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to connect to realtime service");
                    }
                }

                debug!("Reconnecting in {} seconds", RECONNECT_DELAY.as_secs());
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                }
            }
        });
    }

    pub fn shutdown(&self) {
        info!("Initiating realtime shutdown");
        let _ = self.shutdown_tx.send(());
    }
}

fn handle_text(text: &str, changes: &broadcast::Sender<ChangeEvent>) {
    let frame = match decode_frame(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "Ignoring undecodable frame");
            return;
        }
    };

    if let Some(reason) = frame.reply_error() {
        warn!(topic = %frame.topic, reason = %reason, "Realtime request rejected");
        return;
    }

    match frame.change_event() {
        Ok(Some(event)) => {
            debug!(kind = ?event.kind, "Change received");
            let _ = changes.send(event);
        }
        Ok(None) => {}
        Err(e) => warn!(error = %e, "Ignoring malformed change"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_frame_shape() {
        let frame = Frame::join("token-1", 1);
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["topic"], MESSAGES_TOPIC);
        assert_eq!(json["event"], "phx_join");
        assert_eq!(json["ref"], "1");
        assert_eq!(json["payload"]["access_token"], "token-1");
        assert_eq!(json["payload"]["config"]["postgres_changes"][0]["table"], "messages");
        assert_eq!(json["payload"]["config"]["postgres_changes"][0]["event"], "*");
    }

    #[test]
    fn test_decode_insert() {
        let text = r#"{
            "topic": "realtime:public:messages",
            "event": "postgres_changes",
            "ref": null,
            "payload": {
                "ids": [1],
                "data": {
                    "type": "INSERT",
                    "schema": "public",
                    "table": "messages",
                    "commit_timestamp": "2024-05-01T10:15:00Z",
                    "record": {
                        "id": "m1",
                        "content": "hi",
                        "sender_id": "u1",
                        "receiver_id": "u2",
                        "group_id": null,
                        "created_at": "2024-05-01T10:15:00+00:00",
                        "status": "sent",
                        "message_type": "text",
                        "read_by": null,
                        "delivered_to": null,
                        "is_deleted": false,
                        "deleted_for": null
                    }
                }
            }
        }"#;
        let event = decode_frame(text).unwrap().change_event().unwrap().unwrap();
        assert_eq!(event.kind, ChangeKind::Insert);
        let record = event.record.unwrap();
        assert_eq!(record.id, "m1");
        assert_eq!(record.receiver_id.as_deref(), Some("u2"));
    }

    #[test]
    fn test_decode_delete_has_no_record() {
        let text = r#"{
            "topic": "realtime:public:messages",
            "event": "postgres_changes",
            "payload": {"data": {"type": "DELETE", "old_record": {"id": "m1"}}}
        }"#;
        let event = decode_frame(text).unwrap().change_event().unwrap().unwrap();
        assert_eq!(event.kind, ChangeKind::Delete);
        assert!(event.record.is_none());
    }

    #[test]
    fn test_other_frames_are_ignored() {
        let reply = r#"{"topic":"phoenix","event":"phx_reply","payload":{"status":"ok","response":{}},"ref":"2"}"#;
        let frame = decode_frame(reply).unwrap();
        assert!(frame.change_event().unwrap().is_none());
        assert!(frame.reply_error().is_none());

        let rejected = r#"{"topic":"realtime:public:messages","event":"phx_reply","payload":{"status":"error","response":{"reason":"unauthorized"}},"ref":"1"}"#;
        assert!(decode_frame(rejected).unwrap().reply_error().is_some());
    }

    #[tokio::test]
    async fn test_changes_are_republished() {
        let (tx, mut rx) = broadcast::channel(4);
        handle_text("not json", &tx);
        handle_text(
            r#"{"topic":"realtime:public:messages","event":"postgres_changes","payload":{"data":{"type":"DELETE"}}}"#,
            &tx,
        );
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, ChangeKind::Delete);
    }
}
