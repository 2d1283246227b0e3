//! Per-participant translation pipeline.
//!
//! Ties together:
//! - the ASR client for streaming recognition of the participant's audio
//! - the [`gate::UtteranceGate`] deciding when a transcript is worth
//!   translating
//! - the MT and TTS clients for translation and synthesis
//! - the session registry for partner lookup and outbound delivery
//!
//! ## Architecture
//!
//! ```text
//! mic frames ─▸ runtime task ─▸ ASR stream ─▸ transcripts ─▸ gate
//!                   │                                         │
//!                   │                                   UtteranceReady
//!                   │                                         ▼
//!                   │                               utterance worker
//!                   │                          MT ─▸ emotion ─▸ TTS
//!                   ▼                                         │
//!             rolling buffer          partner ◂── synthesized audio
//! ```
//!
//! Each participant gets one runtime task (owning the gate, the rolling
//! audio buffer and the gate timer) and one utterance worker task. The
//! worker serializes translation and emission, so a participant's
//! translations always reach the transports in fire order. Nothing here
//! owns participants: every delivery is a registry lookup by id.

pub mod audio;
pub mod emotion;
pub mod gate;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::asr::{AsrClient, AsrStream};
use crate::config::GateConfig;
use crate::error::Result;
use crate::mt::Translator;
use crate::session::{ParticipantInfo, SessionRegistry};
use crate::transport::messages::{ServerMessage, Speaker};
use crate::tts::{SynthesisEvent, Synthesizer};

use audio::RollingAudioBuffer;
use gate::{GateDecision, Utterance, UtteranceGate};

/// Command fed to a participant's runtime task.
#[derive(Debug)]
pub enum PipelineCommand {
    /// One validated PCM frame from the transport.
    Audio(Vec<u8>),
    /// Tear the runtime down (disconnect or reaper).
    Shutdown,
}

struct RuntimeHandle {
    cmd_tx: mpsc::Sender<PipelineCommand>,
    task: tokio::task::JoinHandle<()>,
}

/// Owner of all per-participant pipeline runtimes.
pub struct PipelineManager {
    registry: Arc<SessionRegistry>,
    asr: Arc<AsrClient>,
    translator: Arc<Translator>,
    synthesizer: Arc<Synthesizer>,
    gate_config: GateConfig,
    runtimes: Mutex<HashMap<String, RuntimeHandle>>,
}

impl PipelineManager {
    pub fn new(
        registry: Arc<SessionRegistry>,
        asr: Arc<AsrClient>,
        translator: Arc<Translator>,
        synthesizer: Arc<Synthesizer>,
        gate_config: GateConfig,
    ) -> Self {
        Self {
            registry,
            asr,
            translator,
            synthesizer,
            gate_config,
            runtimes: Mutex::new(HashMap::new()),
        }
    }

    /// Start pipelines for both participants of a newly active session.
    pub fn start_session(&self, a: &ParticipantInfo, b: &ParticipantInfo) {
        for info in [a, b] {
            if let Err(e) = self.start_participant(info) {
                tracing::error!(
                    participant_id = %info.id,
                    error = %e,
                    "Failed to start pipeline"
                );
            }
        }
    }

    /// Start one participant's runtime. Reconnects reuse the existing
    /// runtime, so starting an already-running participant is a no-op.
    pub fn start_participant(&self, info: &ParticipantInfo) -> Result<()> {
        {
            let runtimes = self.runtimes.lock();
            if runtimes.contains_key(&info.id) {
                return Ok(());
            }
        }
        let asr_stream = self.asr.open(&info.id, info.language)?;
        let (cmd_tx, cmd_rx) = mpsc::channel::<PipelineCommand>(512);

        let runtime = ParticipantRuntime {
            info: info.clone(),
            registry: Arc::clone(&self.registry),
            translator: Arc::clone(&self.translator),
            synthesizer: Arc::clone(&self.synthesizer),
            gate: UtteranceGate::new(
                self.gate_config.clone(),
                info.language,
                &info.role,
                &info.id,
            ),
            buffer: RollingAudioBuffer::new(),
        };
        let task = tokio::spawn(runtime.run(cmd_rx, asr_stream));

        self.runtimes
            .lock()
            .insert(info.id.clone(), RuntimeHandle { cmd_tx, task });
        tracing::info!(participant_id = %info.id, language = info.language.tag(), "Pipeline started");
        Ok(())
    }

    /// Route a validated audio frame into a participant's runtime.
    pub fn submit_audio(&self, participant_id: &str, frame: Vec<u8>) {
        let cmd_tx = {
            let runtimes = self.runtimes.lock();
            runtimes.get(participant_id).map(|h| h.cmd_tx.clone())
        };
        match cmd_tx {
            Some(tx) => {
                if tx.try_send(PipelineCommand::Audio(frame)).is_err() {
                    tracing::warn!(participant_id, "Pipeline busy, dropping audio frame");
                }
            }
            None => {
                tracing::warn!(participant_id, "Audio frame without an active pipeline");
            }
        }
    }

    pub fn has_runtime(&self, participant_id: &str) -> bool {
        self.runtimes.lock().contains_key(participant_id)
    }

    /// Tear down one participant's runtime: close its ASR handle, cancel
    /// the gate timer and any in-flight synthesis.
    pub async fn teardown(&self, participant_id: &str) {
        let handle = self.runtimes.lock().remove(participant_id);
        if let Some(handle) = handle {
            if handle.cmd_tx.try_send(PipelineCommand::Shutdown).is_err() {
                // Runtime is wedged or already gone; force it.
                handle.task.abort();
            }
        }
        self.asr.close(participant_id).await;
        tracing::info!(participant_id, "Pipeline torn down");
    }
}

// ── Per-participant runtime ───────────────────────────────────────

/// Work item handed to the utterance worker: the fired utterance plus a
/// snapshot of the rolling audio buffer for emotion analysis.
struct UtteranceJob {
    utterance: Utterance,
    audio_snapshot: Vec<u8>,
}

struct ParticipantRuntime {
    info: ParticipantInfo,
    registry: Arc<SessionRegistry>,
    translator: Arc<Translator>,
    synthesizer: Arc<Synthesizer>,
    gate: UtteranceGate,
    buffer: RollingAudioBuffer,
}

impl ParticipantRuntime {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<PipelineCommand>, asr: AsrStream) {
        let AsrStream {
            handle: asr_handle,
            mut transcripts,
            mut failures,
        } = asr;

        // The worker serializes MT → emission so translations leave in
        // fire order for this participant.
        let (job_tx, job_rx) = mpsc::channel::<UtteranceJob>(32);
        let worker_ctx = WorkerCtx {
            info: self.info.clone(),
            registry: Arc::clone(&self.registry),
            translator: Arc::clone(&self.translator),
            synthesizer: Arc::clone(&self.synthesizer),
        };
        let worker = tokio::spawn(utterance_worker(worker_ctx, job_rx));

        let gate_timer = tokio::time::sleep(Duration::from_secs(3600));
        tokio::pin!(gate_timer);
        let mut timer_armed = false;
        let mut asr_alive = true;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(PipelineCommand::Audio(frame)) => {
                        self.buffer.push(frame.clone());
                        self.registry.touch_activity(&self.info.id);
                        if let Some(partner) = self.registry.find_partner(&self.info.id) {
                            self.registry.touch_activity(&partner.id);
                        }
                        if asr_alive {
                            if let Err(e) = asr_handle.submit_frame(frame).await {
                                tracing::warn!(
                                    participant_id = %self.info.id,
                                    error = %e,
                                    "Audio submission failed"
                                );
                                self.emit_self(ServerMessage::TranscriptionError {
                                    message: "speech recognition unavailable".into(),
                                })
                                .await;
                                asr_alive = false;
                            }
                        }
                    }
                    Some(PipelineCommand::Shutdown) | None => break,
                },

                transcript = transcripts.recv(), if asr_alive => match transcript {
                    Some(t) => {
                        self.emit_self(ServerMessage::LiveTranscription {
                            text: t.text.clone(),
                            is_partial: !t.is_final,
                            confidence: t.confidence,
                            language: t.language.tag().to_string(),
                        })
                        .await;

                        let decision = if t.is_final {
                            self.gate.consider_final(&t.text, t.confidence)
                        } else {
                            self.gate.consider_partial(&t.text, t.confidence)
                        };
                        match decision {
                            GateDecision::Fire(utterance) => {
                                timer_armed = false;
                                self.dispatch(&job_tx, utterance).await;
                            }
                            GateDecision::Arm(delay) => {
                                gate_timer
                                    .as_mut()
                                    .reset(tokio::time::Instant::now() + delay);
                                timer_armed = true;
                            }
                            GateDecision::Accumulate => {
                                // New candidate supersedes any armed timer.
                                timer_armed = false;
                            }
                            GateDecision::Drop => {}
                        }
                    }
                    None => {
                        // Drain any failure the supervisor reported right
                        // before it went away.
                        while let Ok(failure) = failures.try_recv() {
                            self.registry.record_error(&self.info.id);
                            self.emit_self(ServerMessage::TranscriptionError {
                                message: failure.message,
                            })
                            .await;
                        }
                        tracing::debug!(participant_id = %self.info.id, "ASR stream ended");
                        asr_alive = false;
                    }
                },

                failure = failures.recv(), if asr_alive => {
                    if let Some(failure) = failure {
                        self.registry.record_error(&self.info.id);
                        self.emit_self(ServerMessage::TranscriptionError {
                            message: failure.message,
                        })
                        .await;
                        if failure.fatal {
                            // Every provider is gone; the session becomes
                            // one-way until this participant reconnects.
                            asr_alive = false;
                        }
                    }
                },

                _ = &mut gate_timer, if timer_armed => {
                    timer_armed = false;
                    if let Some(utterance) = self.gate.fire_pending() {
                        self.dispatch(&job_tx, utterance).await;
                    }
                }
            }
        }

        // Teardown: release the provider stream, cancel in-flight work,
        // drop buffers.
        asr_handle.close().await;
        worker.abort();
        self.buffer.clear();
        tracing::debug!(participant_id = %self.info.id, "Runtime stopped");
    }

    async fn dispatch(&self, job_tx: &mpsc::Sender<UtteranceJob>, utterance: Utterance) {
        let job = UtteranceJob {
            utterance,
            audio_snapshot: self.buffer.snapshot(),
        };
        if job_tx.send(job).await.is_err() {
            tracing::warn!(participant_id = %self.info.id, "Utterance worker gone");
        }
    }

    async fn emit_self(&self, message: ServerMessage) {
        send_to(&self.registry, &self.info.id, message).await;
    }
}

// ── Utterance worker ──────────────────────────────────────────────

struct WorkerCtx {
    info: ParticipantInfo,
    registry: Arc<SessionRegistry>,
    translator: Arc<Translator>,
    synthesizer: Arc<Synthesizer>,
}

/// Processes fired utterances strictly in order: translate, analyze
/// emotion, emit translations, synthesize for the partner.
async fn utterance_worker(ctx: WorkerCtx, mut jobs: mpsc::Receiver<UtteranceJob>) {
    while let Some(job) = jobs.recv().await {
        process_utterance(&ctx, job).await;
    }
}

async fn process_utterance(ctx: &WorkerCtx, job: UtteranceJob) {
    let utterance = job.utterance;
    let transcription_ms = utterance.timestamp.elapsed().as_millis() as u64;

    // No partner, no work: the session is pending or already over.
    let Some(partner) = ctx.registry.find_partner(&ctx.info.id) else {
        tracing::debug!(
            participant_id = %ctx.info.id,
            "Utterance dropped: no active partner"
        );
        return;
    };

    // Emotion analysis is pure computation over the rolling buffer, so
    // it runs before the translation round-trip rather than after; thin
    // input yields the neutral profile, never an error.
    let profile = emotion::analyze(&job.audio_snapshot, &utterance.text, utterance.language);

    let mt_started = Instant::now();
    let translation = match ctx
        .translator
        .translate(&utterance.text, utterance.language, partner.language)
        .await
    {
        Ok(t) => t,
        Err(e) => {
            tracing::warn!(
                participant_id = %ctx.info.id,
                error = %e,
                "Translation failed"
            );
            ctx.registry.record_error(&ctx.info.id);
            send_to(
                &ctx.registry,
                &ctx.info.id,
                ServerMessage::PipelineError {
                    message: e.to_string(),
                },
            )
            .await;
            return;
        }
    };
    let translation_ms = mt_started.elapsed().as_millis() as u64;

    let translation_msg = |speaker: Speaker| ServerMessage::LiveTranslation {
        original_text: utterance.text.clone(),
        translated_text: translation.translated_text.clone(),
        source_language: utterance.language.tag().to_string(),
        target_language: partner.language.tag().to_string(),
        confidence: utterance.confidence.min(translation.confidence),
        speaker,
        emotion: Some(profile.summary()),
    };
    send_to(&ctx.registry, &ctx.info.id, translation_msg(Speaker::SelfSide)).await;
    send_to(&ctx.registry, &partner.id, translation_msg(Speaker::Partner)).await;

    // Synthesis: the partner's voice, the partner's language. Audio goes
    // to the partner only, never back to the speaker.
    match ctx
        .synthesizer
        .synthesize(
            &partner.voice_id,
            &translation.translated_text,
            partner.language,
            Some(&profile),
            true,
        )
        .await
    {
        Ok(Some(mut stream)) => {
            let target_language = partner.language.tag().to_string();
            let mut held: Option<Vec<u8>> = None;
            while let Some(event) = stream.events.recv().await {
                match event {
                    SynthesisEvent::Audio(chunk) => {
                        if let Some(previous) = held.replace(chunk) {
                            send_to(
                                &ctx.registry,
                                &partner.id,
                                ServerMessage::SynthesizedAudio {
                                    audio: base64::engine::general_purpose::STANDARD
                                        .encode(previous),
                                    target_language: target_language.clone(),
                                    is_final: false,
                                },
                            )
                            .await;
                        }
                    }
                    SynthesisEvent::Complete => {
                        if let Some(previous) = held.take() {
                            send_to(
                                &ctx.registry,
                                &partner.id,
                                ServerMessage::SynthesizedAudio {
                                    audio: base64::engine::general_purpose::STANDARD
                                        .encode(previous),
                                    target_language: target_language.clone(),
                                    is_final: true,
                                },
                            )
                            .await;
                        }
                        break;
                    }
                    SynthesisEvent::Failed(e) => {
                        ctx.registry.record_error(&ctx.info.id);
                        send_to(
                            &ctx.registry,
                            &ctx.info.id,
                            ServerMessage::SynthesisError {
                                message: e.to_string(),
                            },
                        )
                        .await;
                        break;
                    }
                }
            }
        }
        Ok(None) => {
            // Below the partial-length floor; nothing to speak.
        }
        Err(e) => {
            tracing::warn!(
                participant_id = %ctx.info.id,
                error = %e,
                "Synthesis failed"
            );
            ctx.registry.record_error(&ctx.info.id);
            send_to(
                &ctx.registry,
                &ctx.info.id,
                ServerMessage::SynthesisError {
                    message: e.to_string(),
                },
            )
            .await;
        }
    }

    let total_ms = utterance.timestamp.elapsed().as_millis() as u64;
    ctx.registry.record_translation(&ctx.info.id, total_ms);
    send_to(
        &ctx.registry,
        &ctx.info.id,
        ServerMessage::LatencyStats {
            transcription_ms,
            translation_ms,
            total_ms,
        },
    )
    .await;
}

/// Deliver a message through the registry's outbound handle. Lookups are
/// weak by design: a participant that vanished mid-utterance just drops
/// the message.
async fn send_to(registry: &SessionRegistry, participant_id: &str, message: ServerMessage) {
    if let Some(outbound) = registry.outbound(participant_id) {
        if outbound.send(message).await.is_err() {
            tracing::debug!(participant_id, "Outbound channel closed, message dropped");
        }
    }
}
