//! **Avatar sink**: the persistent duplex channel to the avatar controller.
//!
//! Outbound: narration text as `ChatbotSendMessage`. Inbound: `ChatbotSpeechStarted` /
//! `ChatbotSpeechEnded` notifications, which are folded into [`SpeechState`].
//! A dropped connection marks speech as ended and is re-established on the next
//! `ensure_connected`, so callers never see the reconnect.

use crate::error::{VoiceError, VoiceResult};
use crate::speech::SpeechState;
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type AvatarWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
type AvatarWriter = SplitSink<AvatarWs, Message>;
type AvatarReader = SplitStream<AvatarWs>;

const SEND_ACTION: &str = "ChatbotSendMessage";
const SPEECH_STARTED: &str = "ChatbotSpeechStarted";
const SPEECH_ENDED: &str = "ChatbotSpeechEnded";

/// Output channel for narration. Implementations report speech progress into a
/// [`SpeechState`] they were constructed with.
#[async_trait]
pub trait AvatarSink: Send + Sync {
    /// Make sure a connection exists, establishing one if needed. Bounded by a timeout.
    async fn ensure_connected(&self) -> VoiceResult<()>;

    /// Hand one narration message to the avatar.
    async fn send(&self, text: &str) -> VoiceResult<()>;
}

/// Speech notification decoded from an inbound avatar message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechSignal {
    Started,
    Ended,
}

/// Decode an inbound avatar message. The signal name is carried in `action` or `event`.
pub fn parse_signal(raw: &str) -> Option<SpeechSignal> {
    let value: serde_json::Value = serde_json::from_str(raw).ok()?;
    let name = value
        .get("action")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .or_else(|| value.get("event").and_then(|v| v.as_str()))?;
    match name {
        SPEECH_STARTED => Some(SpeechSignal::Started),
        SPEECH_ENDED => Some(SpeechSignal::Ended),
        _ => None,
    }
}

fn send_payload(text: &str) -> serde_json::Value {
    let id = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    serde_json::json!({
        "action": SEND_ACTION,
        "id": id.to_string(),
        "message": text,
        "priority": 1,
    })
}

/// Websocket avatar sink (ChatPal protocol).
pub struct WsAvatarSink {
    uri: String,
    handshake_timeout: Duration,
    speech: SpeechState,
    writer: Arc<Mutex<Option<AvatarWriter>>>,
    generation: Arc<AtomicU64>,
}

impl WsAvatarSink {
    pub fn new(uri: impl Into<String>, handshake_timeout: Duration, speech: SpeechState) -> Self {
        Self {
            uri: uri.into(),
            handshake_timeout,
            speech,
            writer: Arc::new(Mutex::new(None)),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// `ws://{host}:{port}`
    pub fn for_host(host: &str, port: u16, handshake_timeout: Duration, speech: SpeechState) -> Self {
        Self::new(format!("ws://{}:{}", host, port), handshake_timeout, speech)
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    fn spawn_reader(&self, reader: AvatarReader, generation: u64) {
        let speech = self.speech.clone();
        let writer = Arc::clone(&self.writer);
        let current = Arc::clone(&self.generation);
        tokio::spawn(async move {
            read_signals(reader, &speech).await;
            // Only tear down the connection this reader belongs to.
            if current.load(Ordering::SeqCst) == generation {
                writer.lock().await.take();
            }
            speech.mark_ended();
        });
    }
}

async fn read_signals(mut reader: AvatarReader, speech: &SpeechState) {
    while let Some(next) = reader.next().await {
        let text = match next {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                warn!(error = %e, "Avatar connection read error");
                break;
            }
        };
        match parse_signal(&text) {
            Some(SpeechSignal::Started) => speech.mark_started(),
            Some(SpeechSignal::Ended) => speech.mark_ended(),
            None => info!("Avatar ← {}", text),
        }
    }
    warn!("Avatar connection closed");
}

#[async_trait]
impl AvatarSink for WsAvatarSink {
    async fn ensure_connected(&self) -> VoiceResult<()> {
        let mut writer = self.writer.lock().await;
        if writer.is_some() {
            return Ok(());
        }

        let connect = tokio_tungstenite::connect_async(self.uri.as_str());
        let (ws, _response) = tokio::time::timeout(self.handshake_timeout, connect)
            .await
            .map_err(|_| VoiceError::SinkTimeout(self.handshake_timeout.as_millis() as u64))?
            .map_err(|e| VoiceError::SinkConnect(e.to_string()))?;

        let (write, read) = ws.split();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *writer = Some(write);
        self.spawn_reader(read, generation);
        info!(uri = %self.uri, "🔌 Connected to avatar");
        Ok(())
    }

    async fn send(&self, text: &str) -> VoiceResult<()> {
        let mut writer = self.writer.lock().await;
        let Some(sink) = writer.as_mut() else {
            return Err(VoiceError::NotConnected);
        };
        let payload = send_payload(text);
        debug!(message = %text, "Avatar SEND");
        if let Err(e) = sink.send(Message::Text(payload.to_string())).await {
            writer.take();
            return Err(VoiceError::SinkSend(e.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_action_field() {
        assert_eq!(
            parse_signal(r#"{"action":"ChatbotSpeechStarted"}"#),
            Some(SpeechSignal::Started)
        );
        assert_eq!(
            parse_signal(r#"{"action":"ChatbotSpeechEnded","id":"1"}"#),
            Some(SpeechSignal::Ended)
        );
    }

    #[test]
    fn falls_back_to_event_field() {
        assert_eq!(
            parse_signal(r#"{"action":"","event":"ChatbotSpeechEnded"}"#),
            Some(SpeechSignal::Ended)
        );
        assert_eq!(
            parse_signal(r#"{"event":"ChatbotSpeechStarted"}"#),
            Some(SpeechSignal::Started)
        );
    }

    #[test]
    fn ignores_other_messages() {
        assert_eq!(parse_signal(r#"{"action":"ChatbotSendMessage"}"#), None);
        assert_eq!(parse_signal("not json"), None);
        assert_eq!(parse_signal(r#"{"id":"7"}"#), None);
    }

    #[test]
    fn payload_shape() {
        let payload = send_payload("hallo zusammen");
        assert_eq!(payload["action"], SEND_ACTION);
        assert_eq!(payload["message"], "hallo zusammen");
        assert_eq!(payload["priority"], 1);
        assert!(payload["id"].as_str().is_some());
    }

    #[tokio::test]
    async fn send_without_connection_fails() {
        let sink = WsAvatarSink::for_host("localhost", 9, Duration::from_millis(200), SpeechState::new());
        assert!(matches!(sink.send("hi").await, Err(VoiceError::NotConnected)));
        assert_eq!(sink.uri(), "ws://localhost:9");
    }
}
