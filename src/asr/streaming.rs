//! Streaming ASR provider connection.
//!
//! One persistent bidirectional WebSocket per handle. The protocol is the
//! common streaming-recognizer shape: a JSON configuration message on
//! open, raw PCM binary frames upstream, JSON transcript events
//! downstream, and an application-level keep-alive while the connection
//! is idle.
//!
//! ## Lifecycle
//!
//! 1. **Connect** — open the WebSocket, send the configuration frame.
//! 2. **Stream** — binary PCM up, transcript events down.
//! 3. **Keep-alive** — a JSON keep-alive every 15 s so the provider does
//!    not reap quiet connections.
//! 4. **Close** — graceful close frame, or provider-initiated close.
//!
//! Timeout-classified provider errors are reported as
//! [`StreamEvent::Timeout`] so the supervisor can recreate the connection
//! without the caller noticing; hard close codes (1006, 1011) surface as
//! [`StreamEvent::Fatal`] and select the REST fallback.

use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::error::{Error, Result};
use crate::language::Language;

use super::Transcript;

/// Close codes the provider uses for unrecoverable protocol failures.
const FATAL_CLOSE_CODES: [u16; 2] = [1006, 1011];

/// Event emitted by a streaming connection.
#[derive(Debug)]
pub enum StreamEvent {
    /// Normalized transcript (partial or final).
    Transcript(Transcript),
    /// Provider-classified stream timeout; reconnect transparently.
    Timeout,
    /// Unrecoverable failure; switch this handle to the REST fallback.
    Fatal(String),
    /// Graceful close from the provider.
    Closed,
}

// ── Outbound provider messages ────────────────────────────────────

/// Configuration frame sent first on every connection.
#[derive(Debug, Serialize)]
struct ConfigMessage<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    language: &'a str,
    model: &'static str,
    #[serde(rename = "sampleRate")]
    sample_rate: u32,
    encoding: &'static str,
    #[serde(rename = "interimResults")]
    interim_results: bool,
}

fn build_config_message(language: Language) -> ConfigMessage<'static> {
    ConfigMessage {
        kind: "config",
        language: language.tag(),
        model: "general",
        sample_rate: 16_000,
        encoding: "linear16",
        interim_results: true,
    }
}

/// Application-level keep-alive frame.
#[derive(Debug, Serialize)]
struct KeepAliveMessage {
    #[serde(rename = "type")]
    kind: &'static str,
}

const KEEPALIVE_JSON: KeepAliveMessage = KeepAliveMessage { kind: "keep-alive" };

// ── Inbound event parsing ─────────────────────────────────────────

/// Parse one provider JSON frame into stream events. Transcript frames
/// are normalized into the provider-agnostic [`Transcript`] shape here;
/// nothing provider-specific crosses this boundary.
pub(super) fn parse_provider_event(json_text: &str, language: Language) -> Vec<StreamEvent> {
    let value: serde_json::Value = match serde_json::from_str(json_text) {
        Ok(v) => v,
        Err(e) => {
            return vec![StreamEvent::Fatal(format!(
                "unparseable provider frame: {e}"
            ))]
        }
    };

    let mut events = Vec::new();
    match value.get("type").and_then(|v| v.as_str()) {
        Some("transcript") => {
            let text = value
                .get("text")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            if !text.is_empty() {
                events.push(StreamEvent::Transcript(Transcript {
                    text: text.to_string(),
                    confidence: value
                        .get("confidence")
                        .and_then(serde_json::Value::as_f64)
                        .unwrap_or(0.0),
                    language,
                    is_final: value
                        .get("isFinal")
                        .and_then(serde_json::Value::as_bool)
                        .unwrap_or(false),
                    timestamp: Instant::now(),
                }));
            }
        }
        Some("error") => {
            let code = value
                .get("code")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            let message = value
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown provider error");
            if is_timeout_code(code, message) {
                events.push(StreamEvent::Timeout);
            } else {
                events.push(StreamEvent::Fatal(format!("{code}: {message}")));
            }
        }
        Some("keep-alive") | Some("metadata") => {}
        _ => {
            // Unknown frame types are ignored; providers add fields freely.
        }
    }
    events
}

/// Provider timeout classification: the documented timeout code plus a
/// defensive substring match on the message.
fn is_timeout_code(code: &str, message: &str) -> bool {
    code.eq_ignore_ascii_case("NET-0001")
        || code.to_ascii_lowercase().contains("timeout")
        || message.to_ascii_lowercase().contains("timeout")
}

// ── Connection ────────────────────────────────────────────────────

/// A live streaming-recognizer connection.
///
/// Frames go out via [`send_frame`], events come back on the receiver
/// returned by [`connect`]. The keep-alive task runs for the life of the
/// connection and stops when the socket closes.
pub struct StreamingConn {
    frame_tx: mpsc::Sender<Outbound>,
    pub events: mpsc::Receiver<StreamEvent>,
}

#[derive(Debug)]
enum Outbound {
    Audio(Vec<u8>),
    Close,
}

impl StreamingConn {
    /// Open a connection and send the configuration frame.
    pub async fn connect(
        ws_url: &str,
        api_key: &str,
        language: Language,
        keepalive: Duration,
    ) -> Result<Self> {
        let url = format!("{ws_url}?language={}", language.tag());
        let mut request = url.clone();
        // Providers accept the key as a query parameter on WebSocket
        // connections where headers are awkward for browser clients; the
        // server-side client sends it the same way.
        if !api_key.is_empty() {
            request = format!("{url}&key={api_key}");
        }

        let (mut ws_stream, _response) = tokio_tungstenite::connect_async(&request)
            .await
            .map_err(|e| Error::Transcription(format!("stream open failed: {e}")))?;

        let config = build_config_message(language);
        let config_json = serde_json::to_string(&config)?;
        ws_stream
            .send(WsMessage::Text(config_json))
            .await
            .map_err(|e| Error::Transcription(format!("config send failed: {e}")))?;

        let (ws_sender, ws_receiver) = ws_stream.split();
        let (frame_tx, frame_rx) = mpsc::channel::<Outbound>(256);
        let (event_tx, event_rx) = mpsc::channel::<StreamEvent>(256);

        tokio::spawn(outbound_loop(frame_rx, ws_sender, keepalive));
        tokio::spawn(inbound_loop(ws_receiver, event_tx, language));

        Ok(Self {
            frame_tx,
            events: event_rx,
        })
    }

    /// Queue a PCM frame for the provider.
    pub async fn send_frame(&self, pcm: Vec<u8>) -> Result<()> {
        self.frame_tx
            .send(Outbound::Audio(pcm))
            .await
            .map_err(|_| Error::Transcription("stream writer gone".into()))
    }

    /// Graceful close.
    pub async fn close(&self) {
        let _ = self.frame_tx.send(Outbound::Close).await;
    }
}

type WsSink = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    WsMessage,
>;
type WsSource = futures_util::stream::SplitStream<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
>;

/// Writer half: audio frames out, keep-alives while idle.
async fn outbound_loop(mut frame_rx: mpsc::Receiver<Outbound>, mut sink: WsSink, keepalive: Duration) {
    let mut tick = tokio::time::interval(keepalive);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tick.reset();
    loop {
        tokio::select! {
            msg = frame_rx.recv() => {
                match msg {
                    Some(Outbound::Audio(pcm)) => {
                        if sink.send(WsMessage::Binary(pcm)).await.is_err() {
                            break;
                        }
                        tick.reset();
                    }
                    Some(Outbound::Close) | None => {
                        let _ = sink.send(WsMessage::Close(None)).await;
                        break;
                    }
                }
            }
            _ = tick.tick() => {
                let json = match serde_json::to_string(&KEEPALIVE_JSON) {
                    Ok(j) => j,
                    Err(_) => continue,
                };
                if sink.send(WsMessage::Text(json)).await.is_err() {
                    break;
                }
            }
        }
    }
    tracing::debug!("ASR stream writer stopped");
}

/// Reader half: provider frames in, normalized events out.
async fn inbound_loop(
    mut source: WsSource,
    event_tx: mpsc::Sender<StreamEvent>,
    language: Language,
) {
    while let Some(msg_result) = source.next().await {
        match msg_result {
            Ok(WsMessage::Text(text)) => {
                for event in parse_provider_event(&text, language) {
                    if event_tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
            Ok(WsMessage::Close(frame)) => {
                let fatal = frame.as_ref().is_some_and(|f| {
                    FATAL_CLOSE_CODES.contains(&u16::from(f.code))
                });
                let event = if fatal {
                    let code = frame
                        .map(|f| u16::from(f.code))
                        .unwrap_or_default();
                    StreamEvent::Fatal(format!("provider closed with code {code}"))
                } else {
                    StreamEvent::Closed
                };
                let _ = event_tx.send(event).await;
                break;
            }
            Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Binary(_) | WsMessage::Frame(_)) => {}
            Err(tokio_tungstenite::tungstenite::Error::Protocol(_)) => {
                let _ = event_tx
                    .send(StreamEvent::Fatal("protocol violation on stream".into()))
                    .await;
                break;
            }
            Err(e) => {
                // Transport-level failures reconnect like timeouts; the
                // stream may have died on an idle NAT or LB rotation.
                tracing::warn!(error = %e, "ASR stream read error, treating as timeout");
                let _ = event_tx.send(StreamEvent::Timeout).await;
                break;
            }
        }
    }
    tracing::debug!("ASR stream reader stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_message_shape() {
        let config = build_config_message(Language::Tr);
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"type\":\"config\""));
        assert!(json.contains("\"language\":\"tr\""));
        assert!(json.contains("\"sampleRate\":16000"));
        assert!(json.contains("linear16"));
    }

    #[test]
    fn parse_partial_transcript() {
        let json = r#"{"type":"transcript","text":"hello","confidence":0.42,"isFinal":false}"#;
        let events = parse_provider_event(json, Language::En);
        assert_eq!(events.len(), 1);
        let StreamEvent::Transcript(t) = &events[0] else {
            panic!("expected Transcript");
        };
        assert_eq!(t.text, "hello");
        assert!(!t.is_final);
        assert!((t.confidence - 0.42).abs() < 1e-9);
        assert_eq!(t.language, Language::En);
    }

    #[test]
    fn parse_final_transcript() {
        let json = r#"{"type":"transcript","text":"hello, how are you","confidence":0.92,"isFinal":true}"#;
        let events = parse_provider_event(json, Language::En);
        let StreamEvent::Transcript(t) = &events[0] else {
            panic!("expected Transcript");
        };
        assert!(t.is_final);
    }

    #[test]
    fn empty_transcript_is_ignored() {
        let json = r#"{"type":"transcript","text":"","isFinal":false}"#;
        assert!(parse_provider_event(json, Language::En).is_empty());
    }

    #[test]
    fn timeout_error_classified() {
        let json = r#"{"type":"error","code":"NET-0001","message":"stream idle"}"#;
        let events = parse_provider_event(json, Language::En);
        assert!(matches!(events[0], StreamEvent::Timeout));

        let json = r#"{"type":"error","code":"E42","message":"read timeout exceeded"}"#;
        let events = parse_provider_event(json, Language::En);
        assert!(matches!(events[0], StreamEvent::Timeout));
    }

    #[test]
    fn other_errors_are_fatal() {
        let json = r#"{"type":"error","code":"AUTH-0002","message":"bad key"}"#;
        let events = parse_provider_event(json, Language::En);
        let StreamEvent::Fatal(message) = &events[0] else {
            panic!("expected Fatal");
        };
        assert!(message.contains("AUTH-0002"));
    }

    #[test]
    fn garbage_frame_is_fatal() {
        let events = parse_provider_event("not json", Language::En);
        assert!(matches!(events[0], StreamEvent::Fatal(_)));
    }

    #[test]
    fn metadata_frames_are_ignored() {
        let json = r#"{"type":"metadata","requestId":"r-1"}"#;
        assert!(parse_provider_event(json, Language::En).is_empty());
    }

    #[test]
    fn fatal_close_codes_cover_abnormal_and_internal() {
        assert!(FATAL_CLOSE_CODES.contains(&1006));
        assert!(FATAL_CLOSE_CODES.contains(&1011));
    }
}
