//! WebSocket message schema for the translation relay.
//!
//! Defines the JSON message types exchanged between a browser client and
//! the relay during a live two-party session.
//!
//! ## Protocol
//!
//! ```text
//! Client A ──WebSocket──▸ relay ◂──WebSocket── Client B
//!     ◂── events ────────────┴──────── events ──▸
//! ```
//!
//! All control messages are JSON text frames tagged by `type`. Microphone
//! audio may arrive either as raw binary frames (16 kHz mono PCM16LE) or
//! base64 inside a `streaming-audio` message; synthesized audio is always
//! delivered base64-encoded inside `synthesized-audio`.

use serde::{Deserialize, Serialize};

use crate::pipeline::emotion::EmotionSummary;

// ── Client → Server messages ──────────────────────────────────────

/// Messages sent from a client to the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Join the pairing queue (or reconnect to an existing participant).
    #[serde(rename = "join-session")]
    JoinSession {
        /// Free-form role label ("doctor", "patient", "agent", …).
        role: String,
        /// BCP-47-ish source language tag.
        language: String,
        /// Opaque voice id understood by the synthesis provider.
        #[serde(rename = "voiceId")]
        voice_id: String,
    },

    /// Microphone audio chunk, base64 PCM16LE. Binary WebSocket frames
    /// carry the same payload without the JSON envelope.
    #[serde(rename = "streaming-audio")]
    StreamingAudio {
        /// Base64-encoded 16 kHz mono PCM16LE samples.
        audio: String,
    },

    /// Reply to a server heartbeat ping.
    #[serde(rename = "heartbeat-pong")]
    HeartbeatPong,
}

// ── Server → Client messages ──────────────────────────────────────

/// Which side of the conversation produced an utterance, from the
/// perspective of the receiving client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Speaker {
    #[serde(rename = "self")]
    SelfSide,
    #[serde(rename = "partner")]
    Partner,
}

/// Messages sent from the relay to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// The join was accepted and a session record exists.
    #[serde(rename = "session-joined")]
    SessionJoined {
        #[serde(rename = "sessionId")]
        session_id: String,
    },

    /// The joiner is alone; the session stays pending.
    #[serde(rename = "waiting-for-partner")]
    WaitingForPartner {
        #[serde(rename = "sessionId")]
        session_id: String,
    },

    /// Both participants are present; delivered to both sides.
    #[serde(rename = "session-ready")]
    SessionReady {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "partnerLanguage")]
        partner_language: String,
        #[serde(rename = "partnerRole")]
        partner_role: String,
    },

    /// Rolling transcript of the receiving client's own speech.
    #[serde(rename = "live-transcription")]
    LiveTranscription {
        text: String,
        #[serde(rename = "isPartial")]
        is_partial: bool,
        confidence: f64,
        language: String,
    },

    /// A translated utterance; sent to both sides with the appropriate
    /// `speaker` tag.
    #[serde(rename = "live-translation")]
    LiveTranslation {
        #[serde(rename = "originalText")]
        original_text: String,
        #[serde(rename = "translatedText")]
        translated_text: String,
        #[serde(rename = "sourceLanguage")]
        source_language: String,
        #[serde(rename = "targetLanguage")]
        target_language: String,
        confidence: f64,
        speaker: Speaker,
        #[serde(skip_serializing_if = "Option::is_none")]
        emotion: Option<EmotionSummary>,
    },

    /// Synthesized speech for the receiving client to play. Routed only
    /// to the partner of the speaking participant.
    #[serde(rename = "synthesized-audio")]
    SynthesizedAudio {
        /// Base64-encoded audio bytes (provider-native codec).
        audio: String,
        #[serde(rename = "targetLanguage")]
        target_language: String,
        #[serde(rename = "isFinal")]
        is_final: bool,
    },

    /// Per-utterance latency breakdown, sent to the speaker.
    #[serde(rename = "latency-stats")]
    LatencyStats {
        #[serde(rename = "transcriptionMs")]
        transcription_ms: u64,
        #[serde(rename = "translationMs")]
        translation_ms: u64,
        #[serde(rename = "totalMs")]
        total_ms: u64,
    },

    /// Transcription failed for the receiving client's own audio.
    #[serde(rename = "transcription-error")]
    TranscriptionError { message: String },

    /// Translation failed for one utterance; the next is attempted fresh.
    #[serde(rename = "pipeline-error")]
    PipelineError { message: String },

    /// Synthesis failed for one utterance.
    #[serde(rename = "synthesis-error")]
    SynthesisError { message: String },

    /// The other participant left; the receiver has been requeued.
    #[serde(rename = "partner-disconnected")]
    PartnerDisconnected {
        #[serde(rename = "sessionId")]
        session_id: String,
    },

    /// Heartbeat ping; clients answer with `heartbeat-pong`.
    #[serde(rename = "ping")]
    Ping,

    /// Validation or protocol error; the transport stays open.
    #[serde(rename = "error")]
    Error { code: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_message_roundtrip() {
        let json = r#"{"type":"join-session","role":"doctor","language":"tr","voiceId":"v_tr"}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        match &msg {
            ClientMessage::JoinSession {
                role,
                language,
                voice_id,
            } => {
                assert_eq!(role, "doctor");
                assert_eq!(language, "tr");
                assert_eq!(voice_id, "v_tr");
            }
            other => panic!("wrong variant: {other:?}"),
        }
        let out = serde_json::to_string(&msg).unwrap();
        assert!(out.contains("join-session"));
        assert!(out.contains("voiceId"));
    }

    #[test]
    fn speaker_tags_serialize_as_self_and_partner() {
        assert_eq!(
            serde_json::to_string(&Speaker::SelfSide).unwrap(),
            "\"self\""
        );
        assert_eq!(
            serde_json::to_string(&Speaker::Partner).unwrap(),
            "\"partner\""
        );
    }

    #[test]
    fn translation_message_skips_absent_emotion() {
        let msg = ServerMessage::LiveTranslation {
            original_text: "hello".into(),
            translated_text: "merhaba".into(),
            source_language: "en".into(),
            target_language: "tr".into(),
            confidence: 0.92,
            speaker: Speaker::SelfSide,
            emotion: None,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("live-translation"));
        assert!(json.contains("translatedText"));
        assert!(!json.contains("emotion"));
    }

    #[test]
    fn synthesized_audio_carries_finality() {
        let msg = ServerMessage::SynthesizedAudio {
            audio: "AAAA".into(),
            target_language: "tr".into(),
            is_final: true,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("synthesized-audio"));
        assert!(json.contains("isFinal"));
    }

    #[test]
    fn heartbeat_pong_parses() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"heartbeat-pong"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::HeartbeatPong));
    }
}
