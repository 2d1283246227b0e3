//! Provider-multiplexed speech recognition client.
//!
//! Offers one uniform contract to the pipeline: [`AsrClient::open`]
//! yields a handle plus two channels (transcripts and failures);
//! [`AsrHandle::submit_frame`] feeds PCM; [`AsrHandle::close`] releases
//! the stream. Behind the handle a supervisor task owns the actual
//! provider connection and hides every provider difference:
//!
//! - providers are tried in the configured per-language order
//!   (streaming primary → streaming secondary → batch → REST-chunked);
//! - stream timeouts recreate the connection transparently, preserving
//!   the handle from the caller's point of view;
//! - non-recoverable stream failures (close codes 1006/1011, protocol
//!   errors, failure to open) switch the handle to the REST-chunked
//!   fallback without the caller noticing;
//! - every provider result is normalized into [`Transcript`] before it
//!   reaches the pipeline.
//!
//! Handles idle longer than the configured threshold are closed by the
//! background sweeper via [`AsrClient::sweep_idle`].

pub mod rest;
pub mod streaming;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::AsrConfig;
use crate::error::{Error, Result};
use crate::language::Language;

use rest::{BatchRecognizer, ChunkedRecognizer};
use streaming::{StreamEvent, StreamingConn};

// ── Public types ──────────────────────────────────────────────────

/// Provider variants behind the uniform interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AsrProviderKind {
    StreamingPrimary,
    StreamingSecondary,
    Batch,
    RestChunked,
}

/// Normalized recognition result. The pipeline never sees
/// provider-specific fields.
#[derive(Debug, Clone)]
pub struct Transcript {
    pub text: String,
    pub confidence: f64,
    pub language: Language,
    pub is_final: bool,
    pub timestamp: Instant,
}

/// Failure reported on a handle's error channel. Non-fatal failures are
/// surfaced to the speaker but the handle keeps working; a fatal failure
/// means every provider is exhausted and the handle is dead.
#[derive(Debug)]
pub struct AsrFailure {
    pub message: String,
    pub fatal: bool,
}

/// Caller-facing stream bundle returned by [`AsrClient::open`].
#[derive(Debug)]
pub struct AsrStream {
    pub handle: AsrHandle,
    pub transcripts: mpsc::Receiver<Transcript>,
    pub failures: mpsc::Receiver<AsrFailure>,
}

/// Handle for one participant's recognition stream. Identity is stable
/// across internal reconnections and provider fallbacks.
#[derive(Clone, Debug)]
pub struct AsrHandle {
    participant_id: String,
    cmd_tx: mpsc::Sender<SupervisorCmd>,
    last_activity: Arc<Mutex<Instant>>,
}

impl AsrHandle {
    /// Submit one PCM frame. Fails only when the handle is dead (all
    /// providers exhausted or the handle was closed).
    pub async fn submit_frame(&self, pcm: Vec<u8>) -> Result<()> {
        *self.last_activity.lock() = Instant::now();
        self.cmd_tx
            .send(SupervisorCmd::Frame(pcm))
            .await
            .map_err(|_| Error::Transcription("recognition stream closed".into()))
    }

    /// Release the stream; the provider connection gets a graceful close.
    pub async fn close(&self) {
        let _ = self.cmd_tx.send(SupervisorCmd::Close).await;
    }

    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }
}

#[derive(Debug)]
enum SupervisorCmd {
    Frame(Vec<u8>),
    Close,
}

// ── Client ────────────────────────────────────────────────────────

struct HandleEntry {
    cmd_tx: mpsc::Sender<SupervisorCmd>,
    last_activity: Arc<Mutex<Instant>>,
}

/// Multiplexing ASR client, shared across all participants.
pub struct AsrClient {
    config: AsrConfig,
    http: reqwest::Client,
    handles: Mutex<HashMap<String, HandleEntry>>,
}

impl AsrClient {
    pub fn new(config: AsrConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// True when the provider kind is usable with the current config.
    fn available(&self, kind: AsrProviderKind) -> bool {
        match kind {
            AsrProviderKind::StreamingPrimary => !self.config.primary_ws_url.is_empty(),
            AsrProviderKind::StreamingSecondary => !self.config.secondary_ws_url.is_empty(),
            AsrProviderKind::Batch => !self.config.batch_url.is_empty(),
            AsrProviderKind::RestChunked => !self.config.primary_rest_url.is_empty(),
        }
    }

    /// Open a recognition stream for a participant. The provider order
    /// comes from the per-language routing table.
    pub fn open(&self, participant_id: &str, language: Language) -> Result<AsrStream> {
        let order: Vec<AsrProviderKind> = self
            .config
            .order_for(language)
            .into_iter()
            .filter(|kind| self.available(*kind))
            .collect();
        if order.is_empty() {
            return Err(Error::ProvidersExhausted {
                language: language.tag().to_string(),
            });
        }

        let (cmd_tx, cmd_rx) = mpsc::channel::<SupervisorCmd>(512);
        let (transcript_tx, transcripts) = mpsc::channel::<Transcript>(256);
        let (failure_tx, failures) = mpsc::channel::<AsrFailure>(16);
        let last_activity = Arc::new(Mutex::new(Instant::now()));

        let supervisor = Supervisor {
            participant_id: participant_id.to_string(),
            language,
            order,
            config: self.config.clone(),
            http: self.http.clone(),
            transcript_tx,
            failure_tx,
        };
        tokio::spawn(supervisor.run(cmd_rx));

        self.handles.lock().insert(
            participant_id.to_string(),
            HandleEntry {
                cmd_tx: cmd_tx.clone(),
                last_activity: Arc::clone(&last_activity),
            },
        );

        Ok(AsrStream {
            handle: AsrHandle {
                participant_id: participant_id.to_string(),
                cmd_tx,
                last_activity,
            },
            transcripts,
            failures,
        })
    }

    /// Close and forget a participant's handle.
    pub async fn close(&self, participant_id: &str) {
        let entry = self.handles.lock().remove(participant_id);
        if let Some(entry) = entry {
            let _ = entry.cmd_tx.send(SupervisorCmd::Close).await;
        }
    }

    /// Close handles whose last activity is older than `max_idle`.
    /// Returns the affected participant ids.
    pub async fn sweep_idle(&self, max_idle: Duration) -> Vec<String> {
        let now = Instant::now();
        let stale: Vec<(String, mpsc::Sender<SupervisorCmd>)> = {
            let mut handles = self.handles.lock();
            let ids: Vec<String> = handles
                .iter()
                .filter(|(_, e)| {
                    now.duration_since(*e.last_activity.lock()) > max_idle
                        || e.cmd_tx.is_closed()
                })
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| handles.remove(&id).map(|e| (id, e.cmd_tx)))
                .collect()
        };
        let mut closed = Vec::with_capacity(stale.len());
        for (id, cmd_tx) in stale {
            let _ = cmd_tx.send(SupervisorCmd::Close).await;
            closed.push(id);
        }
        closed
    }

    pub fn open_handle_count(&self) -> usize {
        self.handles.lock().len()
    }
}

// ── Supervisor ────────────────────────────────────────────────────

/// Active backend owned by a supervisor.
enum Backend {
    Streaming {
        conn: StreamingConn,
        kind: AsrProviderKind,
    },
    Chunked(ChunkedRecognizer),
    Batch(BatchRecognizer),
}

/// What the event loop decided to do next.
enum Action {
    Continue,
    Recreate,
    Fallback(String),
    Stop,
}

struct Supervisor {
    participant_id: String,
    language: Language,
    order: Vec<AsrProviderKind>,
    config: AsrConfig,
    http: reqwest::Client,
    transcript_tx: mpsc::Sender<Transcript>,
    failure_tx: mpsc::Sender<AsrFailure>,
}

impl Supervisor {
    async fn run(self, mut cmd_rx: mpsc::Receiver<SupervisorCmd>) {
        let mut backend = match self.open_first_available().await {
            Some(backend) => backend,
            None => {
                let _ = self
                    .failure_tx
                    .send(AsrFailure {
                        message: format!(
                            "no recognition provider available for {}",
                            self.language.tag()
                        ),
                        fatal: true,
                    })
                    .await;
                return;
            }
        };

        loop {
            let action = match &mut backend {
                Backend::Streaming { conn, kind } => {
                    tokio::select! {
                        cmd = cmd_rx.recv() => match cmd {
                            Some(SupervisorCmd::Frame(pcm)) => {
                                if conn.send_frame(pcm).await.is_err() {
                                    // Writer died under us; the reader will
                                    // usually report why, but don't wait.
                                    Action::Recreate
                                } else {
                                    Action::Continue
                                }
                            }
                            Some(SupervisorCmd::Close) | None => {
                                conn.close().await;
                                Action::Stop
                            }
                        },
                        event = conn.events.recv() => match event {
                            Some(StreamEvent::Transcript(t)) => {
                                if self.transcript_tx.send(t).await.is_err() {
                                    Action::Stop
                                } else {
                                    Action::Continue
                                }
                            }
                            Some(StreamEvent::Timeout) => {
                                tracing::info!(
                                    participant_id = %self.participant_id,
                                    provider = ?kind,
                                    "Stream timeout, recreating transparently"
                                );
                                Action::Recreate
                            }
                            Some(StreamEvent::Fatal(message)) => Action::Fallback(message),
                            Some(StreamEvent::Closed) | None => {
                                Action::Fallback("stream closed by provider".into())
                            }
                        },
                    }
                }
                Backend::Chunked(rec) => match cmd_rx.recv().await {
                    Some(SupervisorCmd::Frame(pcm)) => {
                        if rec.push_frame(&pcm) {
                            self.deliver_flush(rec.flush().await).await;
                        }
                        Action::Continue
                    }
                    Some(SupervisorCmd::Close) | None => Action::Stop,
                },
                Backend::Batch(rec) => match cmd_rx.recv().await {
                    Some(SupervisorCmd::Frame(pcm)) => {
                        if rec.push_frame(&pcm) {
                            self.deliver_flush(rec.flush().await).await;
                        }
                        Action::Continue
                    }
                    Some(SupervisorCmd::Close) | None => Action::Stop,
                },
            };

            match action {
                Action::Continue => {}
                Action::Stop => break,
                Action::Recreate => {
                    let kind = match &backend {
                        Backend::Streaming { kind, .. } => *kind,
                        _ => AsrProviderKind::StreamingPrimary,
                    };
                    match self.open_streaming(kind).await {
                        Some(conn) => backend = Backend::Streaming { conn, kind },
                        None => {
                            if !self.switch_to_fallback(&mut backend, "reconnect failed").await {
                                break;
                            }
                        }
                    }
                }
                Action::Fallback(reason) => {
                    if !self.switch_to_fallback(&mut backend, &reason).await {
                        break;
                    }
                }
            }
        }

        tracing::debug!(participant_id = %self.participant_id, "ASR supervisor stopped");
    }

    async fn deliver_flush(&self, result: Result<Option<Transcript>>) {
        match result {
            Ok(Some(t)) => {
                let _ = self.transcript_tx.send(t).await;
            }
            Ok(None) => {}
            Err(e) => {
                let _ = self
                    .failure_tx
                    .send(AsrFailure {
                        message: e.to_string(),
                        fatal: false,
                    })
                    .await;
            }
        }
    }

    /// Switch the handle to the REST-chunked fallback. Returns false when
    /// the fallback is unavailable too (handle is then dead).
    async fn switch_to_fallback(&self, backend: &mut Backend, reason: &str) -> bool {
        if self.config.primary_rest_url.is_empty() {
            let _ = self
                .failure_tx
                .send(AsrFailure {
                    message: format!("recognition providers exhausted: {reason}"),
                    fatal: true,
                })
                .await;
            return false;
        }
        tracing::warn!(
            participant_id = %self.participant_id,
            reason,
            "Switching to REST-chunked recognition fallback"
        );
        *backend = Backend::Chunked(ChunkedRecognizer::new(
            self.http.clone(),
            &self.config.primary_rest_url,
            &self.config.primary_api_key,
            self.language,
        ));
        true
    }

    async fn open_streaming(&self, kind: AsrProviderKind) -> Option<StreamingConn> {
        let (url, key) = match kind {
            AsrProviderKind::StreamingPrimary => {
                (&self.config.primary_ws_url, &self.config.primary_api_key)
            }
            AsrProviderKind::StreamingSecondary => (
                &self.config.secondary_ws_url,
                &self.config.secondary_api_key,
            ),
            _ => return None,
        };
        if url.is_empty() {
            return None;
        }
        match StreamingConn::connect(url, key, self.language, self.config.keepalive_interval).await
        {
            Ok(conn) => Some(conn),
            Err(e) => {
                tracing::warn!(
                    participant_id = %self.participant_id,
                    provider = ?kind,
                    error = %e,
                    "Streaming provider open failed"
                );
                None
            }
        }
    }

    /// Walk the provider order and return the first backend that opens.
    async fn open_first_available(&self) -> Option<Backend> {
        for kind in &self.order {
            match kind {
                AsrProviderKind::StreamingPrimary | AsrProviderKind::StreamingSecondary => {
                    if let Some(conn) = self.open_streaming(*kind).await {
                        return Some(Backend::Streaming { conn, kind: *kind });
                    }
                }
                AsrProviderKind::Batch => {
                    if !self.config.batch_url.is_empty() {
                        return Some(Backend::Batch(BatchRecognizer::new(
                            self.http.clone(),
                            &self.config.batch_url,
                            &self.config.batch_api_key,
                            self.language,
                        )));
                    }
                }
                AsrProviderKind::RestChunked => {
                    if !self.config.primary_rest_url.is_empty() {
                        return Some(Backend::Chunked(ChunkedRecognizer::new(
                            self.http.clone(),
                            &self.config.primary_rest_url,
                            &self.config.primary_api_key,
                            self.language,
                        )));
                    }
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_config() -> AsrConfig {
        // No streaming endpoints: handles come up on the REST-chunked
        // backend, which performs no IO until its buffer fills.
        AsrConfig {
            primary_ws_url: String::new(),
            secondary_ws_url: String::new(),
            batch_url: String::new(),
            primary_rest_url: "http://localhost:9/v1/listen".into(),
            ..AsrConfig::default()
        }
    }

    #[test]
    fn open_fails_with_no_providers() {
        let config = AsrConfig {
            primary_ws_url: String::new(),
            secondary_ws_url: String::new(),
            batch_url: String::new(),
            primary_rest_url: String::new(),
            ..AsrConfig::default()
        };
        let client = AsrClient::new(config);
        let err = client.open("p1", Language::En).unwrap_err();
        assert!(matches!(err, Error::ProvidersExhausted { .. }));
    }

    #[tokio::test]
    async fn open_registers_handle() {
        let client = AsrClient::new(offline_config());
        let stream = client.open("p1", Language::En).unwrap();
        assert_eq!(client.open_handle_count(), 1);
        assert_eq!(stream.handle.participant_id(), "p1");
        client.close("p1").await;
        assert_eq!(client.open_handle_count(), 0);
    }

    #[tokio::test]
    async fn frames_buffer_without_io_below_threshold() {
        let client = AsrClient::new(offline_config());
        let stream = client.open("p1", Language::En).unwrap();
        // Well below the 2 s flush threshold: no request is attempted,
        // submission succeeds.
        stream.handle.submit_frame(vec![0u8; 3200]).await.unwrap();
        stream.handle.submit_frame(vec![0u8; 3200]).await.unwrap();
        client.close("p1").await;
    }

    #[tokio::test]
    async fn sweep_closes_idle_handles() {
        let client = AsrClient::new(offline_config());
        let stream = client.open("p1", Language::En).unwrap();
        let closed = client.sweep_idle(Duration::ZERO).await;
        assert_eq!(closed, vec!["p1".to_string()]);
        assert_eq!(client.open_handle_count(), 0);
        // The handle eventually refuses frames once the supervisor drains
        // the close command.
        let mut refused = false;
        for _ in 0..50 {
            if stream.handle.submit_frame(vec![0u8; 320]).await.is_err() {
                refused = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(refused, "closed handle must stop accepting frames");
    }

    #[tokio::test]
    async fn sweep_keeps_active_handles() {
        let client = AsrClient::new(offline_config());
        let stream = client.open("p1", Language::En).unwrap();
        stream.handle.submit_frame(vec![0u8; 320]).await.unwrap();
        let closed = client.sweep_idle(Duration::from_secs(30)).await;
        assert!(closed.is_empty());
        assert_eq!(client.open_handle_count(), 1);
    }

    #[test]
    fn routing_order_filters_unavailable_providers() {
        let client = AsrClient::new(offline_config());
        assert!(!client.available(AsrProviderKind::StreamingPrimary));
        assert!(!client.available(AsrProviderKind::Batch));
        assert!(client.available(AsrProviderKind::RestChunked));
    }
}
