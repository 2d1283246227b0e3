//! voicebridge — real-time bidirectional voice-to-voice translation relay.
//!
//! Pairs two speakers of different languages into a session. Each
//! participant streams microphone PCM over a WebSocket; the relay runs
//! it through streaming speech recognition, decides when a transcript is
//! a complete-enough utterance, translates it, and streams synthesized
//! speech in the partner's language back to the partner — with
//! sub-second added latency and a natural conversational cadence.
//!
//! ## Layout
//!
//! - [`transport`] — WebSocket endpoint, message framing, heartbeat
//! - [`session`] — session registry and pairing queues
//! - [`pipeline`] — per-participant orchestration, utterance gate,
//!   emotion analysis, rolling audio buffer
//! - [`asr`] — provider-multiplexed speech recognition client
//! - [`mt`] — machine-translation client
//! - [`tts`] — synthesis client with the deduplication cache
//! - [`reaper`] — background idle sweeper
//! - [`config`] / [`error`] / [`language`] — shared plumbing

pub mod asr;
pub mod config;
pub mod error;
pub mod language;
pub mod mt;
pub mod pipeline;
pub mod reaper;
pub mod session;
pub mod transport;
pub mod tts;

pub use config::Config;
pub use error::{Error, Result};
pub use language::Language;
