//! Streaming speech-synthesis client.
//!
//! Wraps the synthesis provider's streaming REST endpoint with:
//!
//! - a time-bounded deduplication cache keyed by (voice, normalized
//!   text, target language, emotion bucket) — rapid-fire identical
//!   requests replay the cached bytes instead of hitting the provider;
//! - exponential backoff on provider rate limiting (1 s base, doubling,
//!   three attempts total);
//! - emotion-derived or language-default voice settings;
//! - a minimum text length for partial synthesis so the relay never
//!   speaks sentence fragments.
//!
//! Audio flows back as an event stream consumed by the orchestrator;
//! dropping the receiver cancels the in-flight stream. Streams with no
//! activity for five minutes are reaped by the background sweeper.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::mpsc;

use crate::config::TtsConfig;
use crate::error::{Error, Result};
use crate::language::Language;
use crate::pipeline::emotion::{EmotionalProfile, VoiceSettings};
use crate::pipeline::gate::normalize;

/// Minimum partial-call text size; finals are sent unconditionally.
const MIN_PARTIAL_CHARS: usize = 20;
const MIN_PARTIAL_WORDS: usize = 4;

/// Rate-limit backoff base delay.
const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Event on a synthesis stream.
#[derive(Debug)]
pub enum SynthesisEvent {
    /// One audio chunk from the provider (or the whole cached payload).
    Audio(Vec<u8>),
    /// Stream finished cleanly.
    Complete,
    /// Stream died mid-flight.
    Failed(Error),
}

/// Receiver side of one synthesis call.
pub struct SynthesisStream {
    pub events: mpsc::Receiver<SynthesisEvent>,
}

// ── Cache ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    voice_id: String,
    normalized_text: String,
    language: Language,
    emotion_bucket: String,
}

#[derive(Debug)]
struct CacheEntry {
    audio: Vec<u8>,
    created_at: Instant,
}

struct ActiveStream {
    last_activity: Arc<Mutex<Instant>>,
    task: tokio::task::JoinHandle<()>,
}

// ── Client ────────────────────────────────────────────────────────

/// Synthesis client, shared process-wide; the cache spans sessions.
pub struct Synthesizer {
    http: reqwest::Client,
    config: TtsConfig,
    cache: Arc<Mutex<HashMap<CacheKey, CacheEntry>>>,
    active: Mutex<HashMap<u64, ActiveStream>>,
    next_stream_id: AtomicU64,
}

impl Synthesizer {
    pub fn new(config: TtsConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            cache: Arc::new(Mutex::new(HashMap::new())),
            active: Mutex::new(HashMap::new()),
            next_stream_id: AtomicU64::new(0),
        }
    }

    /// Synthesize `text` in `voice_id` for `language`. Returns `None`
    /// when a partial call is below the minimum length (nothing is sent
    /// to the provider); otherwise a stream of audio events.
    pub async fn synthesize(
        &self,
        voice_id: &str,
        text: &str,
        language: Language,
        emotion: Option<&EmotionalProfile>,
        is_final: bool,
    ) -> Result<Option<SynthesisStream>> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        if !is_final
            && (trimmed.len() < MIN_PARTIAL_CHARS
                || trimmed.split_whitespace().count() < MIN_PARTIAL_WORDS)
        {
            tracing::debug!(text_len = trimmed.len(), "Partial too short to speak, skipping");
            return Ok(None);
        }

        let key = CacheKey {
            voice_id: voice_id.to_string(),
            normalized_text: normalize(trimmed),
            language,
            emotion_bucket: emotion
                .map(EmotionalProfile::bucket)
                .unwrap_or_else(|| "neutral".to_string()),
        };

        if let Some(audio) = self.cache_lookup(&key) {
            tracing::debug!(voice_id, "Synthesis cache hit");
            let (tx, rx) = mpsc::channel(2);
            let _ = tx.send(SynthesisEvent::Audio(audio)).await;
            let _ = tx.send(SynthesisEvent::Complete).await;
            return Ok(Some(SynthesisStream { events: rx }));
        }

        let settings = emotion
            .map(|e| e.voice_settings.clone())
            .unwrap_or_else(|| VoiceSettings::language_default(language));

        // Obtain the response headers (with rate-limit retries) before
        // returning the stream, so status failures surface as errors.
        let response = tokio::time::timeout(
            self.config.timeout,
            self.request_with_backoff(voice_id, trimmed, language, &settings),
        )
        .await
        .map_err(|_| Error::Synthesis("synthesis timed out".into()))??;

        let (tx, rx) = mpsc::channel::<SynthesisEvent>(32);
        let last_activity = Arc::new(Mutex::new(Instant::now()));
        let stream_id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);

        let task = tokio::spawn(pump_body(
            response,
            tx,
            key,
            Arc::clone(&last_activity),
            self.cache_handle(),
        ));
        self.active.lock().insert(
            stream_id,
            ActiveStream {
                last_activity,
                task,
            },
        );

        Ok(Some(SynthesisStream { events: rx }))
    }

    async fn request_with_backoff(
        &self,
        voice_id: &str,
        text: &str,
        language: Language,
        settings: &VoiceSettings,
    ) -> Result<reqwest::Response> {
        let url = format!("{}/{}/stream", self.config.base_url, voice_id);
        let body = serde_json::json!({
            "text": text,
            "model_id": "eleven_multilingual_v2",
            "language_code": language.tag(),
            "voice_settings": settings,
        });

        let mut attempt = 0;
        loop {
            let response = self
                .http
                .post(&url)
                .header("xi-api-key", &self.config.api_key)
                .json(&body)
                .send()
                .await?;

            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }
            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                attempt += 1;
                if attempt >= self.config.retry_budget {
                    return Err(Error::SynthesisRateLimited { attempts: attempt });
                }
                let jitter = rand::rng().random_range(0..250);
                let delay = BACKOFF_BASE * 2u32.pow(attempt - 1) + Duration::from_millis(jitter);
                tracing::warn!(attempt, delay_ms = delay.as_millis() as u64, "Synthesis rate limited, backing off");
                tokio::time::sleep(delay).await;
                continue;
            }
            let detail = response.text().await.unwrap_or_default();
            return Err(Error::Synthesis(format!(
                "provider returned {status}: {detail}"
            )));
        }
    }

    // ── Cache internals ───────────────────────────────────────────

    fn cache_handle(&self) -> CacheWriter {
        CacheWriter {
            cache: Arc::clone(&self.cache),
            max_age: self.config.cache_max_age,
        }
    }

    /// Exact hit inside the exact window, or a near hit (same voice,
    /// text and language, any emotion bucket) inside the near window.
    fn cache_lookup(&self, key: &CacheKey) -> Option<Vec<u8>> {
        let now = Instant::now();
        let mut cache = self.cache.lock();
        let max_age = self.config.cache_max_age;
        cache.retain(|_, entry| now.duration_since(entry.created_at) <= max_age);

        if let Some(entry) = cache.get(key) {
            if now.duration_since(entry.created_at) <= self.config.cache_exact_window {
                return Some(entry.audio.clone());
            }
        }
        cache
            .iter()
            .find(|(k, entry)| {
                k.voice_id == key.voice_id
                    && k.normalized_text == key.normalized_text
                    && k.language == key.language
                    && now.duration_since(entry.created_at) <= self.config.cache_near_window
            })
            .map(|(_, entry)| entry.audio.clone())
    }

    /// Abort streams idle beyond `max_idle` and drop finished entries.
    pub fn sweep_idle(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let mut active = self.active.lock();
        let before = active.len();
        active.retain(|_, stream| {
            if stream.task.is_finished() {
                return false;
            }
            if now.duration_since(*stream.last_activity.lock()) > max_idle {
                stream.task.abort();
                return false;
            }
            true
        });
        before - active.len()
    }

    /// Drop cache entries past the maximum retention.
    pub fn sweep_cache(&self) {
        let now = Instant::now();
        let max_age = self.config.cache_max_age;
        self.cache
            .lock()
            .retain(|_, entry| now.duration_since(entry.created_at) <= max_age);
    }

    pub fn active_stream_count(&self) -> usize {
        self.active.lock().len()
    }
}

/// Writer handle given to the body-pump task.
struct CacheWriter {
    cache: Arc<Mutex<HashMap<CacheKey, CacheEntry>>>,
    max_age: Duration,
}

impl CacheWriter {
    /// Insert a finished synthesis; eviction runs on insert.
    fn insert(&self, key: CacheKey, audio: Vec<u8>) {
        let now = Instant::now();
        let mut cache = self.cache.lock();
        cache.retain(|_, entry| now.duration_since(entry.created_at) <= self.max_age);
        cache.insert(
            key,
            CacheEntry {
                audio,
                created_at: now,
            },
        );
    }
}

/// Read the provider body, forwarding chunks and caching the whole
/// payload on clean completion.
async fn pump_body(
    response: reqwest::Response,
    tx: mpsc::Sender<SynthesisEvent>,
    key: CacheKey,
    last_activity: Arc<Mutex<Instant>>,
    cache: CacheWriter,
) {
    let mut stream = response.bytes_stream();
    let mut full = Vec::new();
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => {
                *last_activity.lock() = Instant::now();
                full.extend_from_slice(&bytes);
                if tx.send(SynthesisEvent::Audio(bytes.to_vec())).await.is_err() {
                    // Receiver dropped: the utterance was cancelled.
                    return;
                }
            }
            Err(e) => {
                let _ = tx
                    .send(SynthesisEvent::Failed(Error::Synthesis(format!(
                        "stream read failed: {e}"
                    ))))
                    .await;
                return;
            }
        }
    }
    if !full.is_empty() {
        cache.insert(key, full);
    }
    let _ = tx.send(SynthesisEvent::Complete).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synthesizer() -> Synthesizer {
        Synthesizer::new(TtsConfig::default())
    }

    #[tokio::test]
    async fn empty_text_is_skipped() {
        let tts = synthesizer();
        let out = tts
            .synthesize("v1", "   ", Language::En, None, true)
            .await
            .unwrap();
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn short_partial_is_skipped() {
        let tts = synthesizer();
        let out = tts
            .synthesize("v1", "hello there", Language::En, None, false)
            .await
            .unwrap();
        assert!(out.is_none(), "short partials must not reach the provider");
    }

    #[tokio::test]
    async fn cache_hit_replays_identical_bytes() {
        let tts = synthesizer();
        let key = CacheKey {
            voice_id: "v1".into(),
            normalized_text: normalize("Thank you."),
            language: Language::Tr,
            emotion_bucket: "neutral".into(),
        };
        tts.cache_handle().insert(key, vec![1, 2, 3, 4]);

        let mut stream = tts
            .synthesize("v1", "thank you", Language::Tr, None, true)
            .await
            .unwrap()
            .expect("cache hit yields a stream");
        let SynthesisEvent::Audio(bytes) = stream.events.recv().await.unwrap() else {
            panic!("expected audio");
        };
        assert_eq!(bytes, vec![1, 2, 3, 4]);
        assert!(matches!(
            stream.events.recv().await.unwrap(),
            SynthesisEvent::Complete
        ));
    }

    #[tokio::test]
    async fn near_hit_ignores_emotion_bucket() {
        let tts = synthesizer();
        let key = CacheKey {
            voice_id: "v1".into(),
            normalized_text: normalize("thank you"),
            language: Language::Tr,
            emotion_bucket: "excited-high".into(),
        };
        tts.cache_handle().insert(key, vec![9, 9]);

        // Same text, different (default) bucket: near hit inside 3 s.
        let out = tts
            .synthesize("v1", "thank you", Language::Tr, None, true)
            .await
            .unwrap();
        assert!(out.is_some());
    }

    #[tokio::test]
    async fn different_voice_misses_cache() {
        let mut config = TtsConfig::default();
        // Point at a dead endpoint so a miss fails fast instead of
        // reaching a live provider.
        config.base_url = "http://127.0.0.1:9/v1/text-to-speech".into();
        config.timeout = Duration::from_millis(500);
        let tts = Synthesizer::new(config);
        let key = CacheKey {
            voice_id: "v1".into(),
            normalized_text: normalize("thank you"),
            language: Language::Tr,
            emotion_bucket: "neutral".into(),
        };
        tts.cache_handle().insert(key, vec![1]);

        let result = tts
            .synthesize("v2", "thank you", Language::Tr, None, true)
            .await;
        assert!(result.is_err(), "different voice must not reuse cache");
    }

    #[test]
    fn cache_eviction_on_insert() {
        let tts = synthesizer();
        let writer = CacheWriter {
            cache: Arc::clone(&tts.cache),
            max_age: Duration::ZERO,
        };
        let old_key = CacheKey {
            voice_id: "v1".into(),
            normalized_text: "old".into(),
            language: Language::En,
            emotion_bucket: "neutral".into(),
        };
        writer.insert(old_key.clone(), vec![1]);
        // Zero retention: the next insert evicts the previous entry.
        let new_key = CacheKey {
            voice_id: "v1".into(),
            normalized_text: "new".into(),
            language: Language::En,
            emotion_bucket: "neutral".into(),
        };
        writer.insert(new_key, vec![2]);
        assert!(tts.cache_lookup(&old_key).is_none());
    }

    #[test]
    fn sweep_cache_respects_max_age() {
        let tts = synthesizer();
        let key = CacheKey {
            voice_id: "v1".into(),
            normalized_text: "fresh".into(),
            language: Language::En,
            emotion_bucket: "neutral".into(),
        };
        tts.cache_handle().insert(key.clone(), vec![1]);
        tts.sweep_cache();
        assert!(tts.cache_lookup(&key).is_some(), "fresh entries survive");
    }

    #[test]
    fn sweep_idle_with_no_streams_is_zero() {
        let tts = synthesizer();
        assert_eq!(tts.sweep_idle(Duration::from_secs(300)), 0);
        assert_eq!(tts.active_stream_count(), 0);
    }
}
