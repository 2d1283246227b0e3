//! Configuration surface for the relay.
//!
//! Every recognized option is enumerated here with its default. The binary
//! fills a [`Config`] from CLI flags and environment variables; tests build
//! one with `Config::default()` and tweak fields directly.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use crate::asr::AsrProviderKind;
use crate::language::Language;

/// Top-level configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the WebSocket endpoint listens on.
    pub listen: SocketAddr,
    /// Server-initiated heartbeat ping interval. A participant that misses
    /// one full interval without any message is force-disconnected.
    pub heartbeat_interval: Duration,
    /// Cadence of the background sweeper.
    pub reaper_interval: Duration,
    /// Idle thresholds enforced by the sweeper.
    pub idle: IdleConfig,
    /// Utterance-gate thresholds.
    pub gate: GateConfig,
    /// ASR provider endpoints, credentials and routing.
    pub asr: AsrConfig,
    /// Machine-translation provider settings.
    pub mt: MtConfig,
    /// Synthesis provider settings.
    pub tts: TtsConfig,
}

/// Idle thresholds for the background sweeper.
#[derive(Debug, Clone)]
pub struct IdleConfig {
    /// ASR handles idle longer than this are closed.
    pub asr_handle: Duration,
    /// TTS streams idle longer than this are reaped.
    pub tts_stream: Duration,
    /// Active sessions where both participants have been silent this long
    /// are ended.
    pub session: Duration,
    /// Pending sessions older than this are dropped.
    pub pending_session: Duration,
    /// Ended sessions remain discoverable for this grace window.
    pub ended_grace: Duration,
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            asr_handle: Duration::from_secs(30),
            tts_stream: Duration::from_secs(300),
            session: Duration::from_secs(180),
            pending_session: Duration::from_secs(1800),
            ended_grace: Duration::from_secs(30),
        }
    }
}

/// Thresholds driving the utterance gate's decision policy.
#[derive(Debug, Clone)]
pub struct GateConfig {
    /// Confidence floor for immediate firing paths.
    pub min_confidence_threshold: f64,
    /// Word floor for normal processing; shorter candidates take the
    /// short-message timer.
    pub min_words_for_processing: usize,
    /// Character floor for normal processing, alongside the word floor.
    pub min_characters_for_processing: usize,
    /// Single-shot timer for candidates under either length floor.
    pub short_message_timeout: Duration,
    /// Adaptive timer tier for near-complete candidates (score ≥ 0.6).
    pub conversational_pause_threshold: Duration,
    /// Adaptive timer tier for middling candidates; also seeds the
    /// profile's learned pause average.
    pub sentence_completion_threshold: Duration,
    /// Adaptive timer tier for weak candidates (score ≤ 0.3).
    pub thought_completion_threshold: Duration,
    /// Hard upper bound for any adaptive timer.
    pub emergency_timeout: Duration,
    /// Extra domain-term keywords merged into the per-language defaults.
    pub domain_terms: Vec<String>,
    /// Extra urgency keywords merged into the per-language defaults.
    pub urgency_terms: Vec<String>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            min_confidence_threshold: 0.8,
            min_words_for_processing: 3,
            min_characters_for_processing: 15,
            short_message_timeout: Duration::from_millis(3000),
            conversational_pause_threshold: Duration::from_millis(750),
            sentence_completion_threshold: Duration::from_millis(1200),
            thought_completion_threshold: Duration::from_millis(2000),
            emergency_timeout: Duration::from_millis(4000),
            domain_terms: Vec::new(),
            urgency_terms: Vec::new(),
        }
    }
}

/// ASR provider endpoints and routing.
#[derive(Debug, Clone)]
pub struct AsrConfig {
    /// Primary streaming provider WebSocket URL.
    pub primary_ws_url: String,
    /// Primary provider API key.
    pub primary_api_key: String,
    /// Primary provider REST recognize URL (chunked fallback).
    pub primary_rest_url: String,
    /// Secondary streaming provider WebSocket URL (empty = disabled).
    pub secondary_ws_url: String,
    /// Secondary provider API key.
    pub secondary_api_key: String,
    /// Batch provider multipart upload URL (empty = disabled).
    pub batch_url: String,
    /// Batch provider API key.
    pub batch_api_key: String,
    /// Application-level keep-alive cadence on streaming connections.
    pub keepalive_interval: Duration,
    /// Per-language provider preference order. Languages not listed use
    /// [`AsrConfig::default_order`].
    pub routing: HashMap<Language, Vec<AsrProviderKind>>,
}

impl AsrConfig {
    /// Provider order for languages without an explicit routing entry.
    pub fn default_order() -> Vec<AsrProviderKind> {
        vec![
            AsrProviderKind::StreamingPrimary,
            AsrProviderKind::StreamingSecondary,
            AsrProviderKind::RestChunked,
        ]
    }

    /// Resolve the provider order for a language.
    pub fn order_for(&self, language: Language) -> Vec<AsrProviderKind> {
        self.routing
            .get(&language)
            .cloned()
            .unwrap_or_else(Self::default_order)
    }
}

impl Default for AsrConfig {
    fn default() -> Self {
        // Languages the streaming providers transcribe poorly go through
        // the batch provider first.
        let mut routing = HashMap::new();
        for lang in [Language::Th, Language::Vi] {
            routing.insert(
                lang,
                vec![AsrProviderKind::Batch, AsrProviderKind::RestChunked],
            );
        }
        Self {
            primary_ws_url: "wss://api.deepgram.com/v1/listen".into(),
            primary_api_key: String::new(),
            primary_rest_url: "https://api.deepgram.com/v1/listen".into(),
            secondary_ws_url: String::new(),
            secondary_api_key: String::new(),
            batch_url: "https://api.openai.com/v1/audio/transcriptions".into(),
            batch_api_key: String::new(),
            keepalive_interval: Duration::from_secs(15),
            routing,
        }
    }
}

/// Machine-translation provider settings.
#[derive(Debug, Clone)]
pub struct MtConfig {
    /// Translation endpoint URL.
    pub base_url: String,
    /// API key.
    pub api_key: String,
    /// Hard timeout for a single translation request.
    pub timeout: Duration,
}

impl Default for MtConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api-free.deepl.com/v2/translate".into(),
            api_key: String::new(),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Synthesis provider settings.
#[derive(Debug, Clone)]
pub struct TtsConfig {
    /// Synthesis endpoint base URL; the voice id is appended per request.
    pub base_url: String,
    /// API key.
    pub api_key: String,
    /// Total attempts when the provider rate-limits (first try included).
    pub retry_budget: u32,
    /// Exact-key cache hit window.
    pub cache_exact_window: Duration,
    /// Near-hit window ignoring the emotion bucket.
    pub cache_near_window: Duration,
    /// Maximum cache entry retention.
    pub cache_max_age: Duration,
    /// Hard timeout for a synthesis request including retries.
    pub timeout: Duration,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.elevenlabs.io/v1/text-to-speech".into(),
            api_key: String::new(),
            retry_budget: 3,
            cache_exact_window: Duration::from_secs(5),
            cache_near_window: Duration::from_secs(3),
            cache_max_age: Duration::from_secs(10),
            timeout: Duration::from_secs(15),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8090".parse().expect("static addr"),
            heartbeat_interval: Duration::from_secs(30),
            reaper_interval: Duration::from_secs(60),
            idle: IdleConfig::default(),
            gate: GateConfig::default(),
            asr: AsrConfig::default(),
            mt: MtConfig::default(),
            tts: TtsConfig::default(),
        }
    }
}

impl Config {
    /// Apply environment-variable overrides for provider credentials and
    /// endpoints. CLI flags (handled in the binary) win over these.
    pub fn apply_env(&mut self) {
        let overrides: [(&str, &mut String); 8] = [
            ("VOICEBRIDGE_ASR_WS_URL", &mut self.asr.primary_ws_url),
            ("VOICEBRIDGE_ASR_API_KEY", &mut self.asr.primary_api_key),
            ("VOICEBRIDGE_ASR_REST_URL", &mut self.asr.primary_rest_url),
            ("VOICEBRIDGE_ASR2_WS_URL", &mut self.asr.secondary_ws_url),
            ("VOICEBRIDGE_ASR2_API_KEY", &mut self.asr.secondary_api_key),
            ("VOICEBRIDGE_BATCH_API_KEY", &mut self.asr.batch_api_key),
            ("VOICEBRIDGE_MT_API_KEY", &mut self.mt.api_key),
            ("VOICEBRIDGE_TTS_API_KEY", &mut self.tts.api_key),
        ];
        for (var, slot) in overrides {
            if let Ok(value) = std::env::var(var) {
                if !value.trim().is_empty() {
                    *slot = value;
                }
            }
        }
        if let Ok(addr) = std::env::var("VOICEBRIDGE_LISTEN") {
            if let Ok(parsed) = addr.parse() {
                self.listen = parsed;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.reaper_interval, Duration::from_secs(60));
        assert_eq!(config.idle.asr_handle, Duration::from_secs(30));
        assert_eq!(config.idle.tts_stream, Duration::from_secs(300));
        assert_eq!(config.idle.session, Duration::from_secs(180));
        assert_eq!(config.idle.pending_session, Duration::from_secs(1800));
        assert!((config.gate.min_confidence_threshold - 0.8).abs() < f64::EPSILON);
        assert_eq!(config.gate.min_words_for_processing, 3);
        assert_eq!(config.gate.min_characters_for_processing, 15);
        assert_eq!(config.gate.short_message_timeout, Duration::from_millis(3000));
        assert_eq!(config.gate.emergency_timeout, Duration::from_millis(4000));
        assert_eq!(config.tts.retry_budget, 3);
        assert_eq!(config.mt.timeout, Duration::from_secs(10));
    }

    #[test]
    fn routing_falls_back_to_default_order() {
        let asr = AsrConfig::default();
        let order = asr.order_for(Language::En);
        assert_eq!(order[0], AsrProviderKind::StreamingPrimary);
        // Poorly-served languages route to batch first.
        let order = asr.order_for(Language::Th);
        assert_eq!(order[0], AsrProviderKind::Batch);
    }
}
