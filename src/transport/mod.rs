//! Client-facing WebSocket transport and session control.
//!
//! One WebSocket connection per participant. Control messages are JSON
//! text frames ([`messages::ClientMessage`]); microphone audio arrives
//! as binary frames or base64 inside `streaming-audio`. Every connection
//! gets a single writer task fed by an mpsc channel, so messages to one
//! transport are strictly ordered no matter which pipeline task produced
//! them.
//!
//! The server pings each connection on the heartbeat interval; a
//! connection that stays silent for one full interval is force-closed.
//! On close the participant is removed from the registry, its pipeline
//! is torn down, and a paired partner is notified and requeued.

pub mod messages;

use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use base64::Engine;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::language::Language;
use crate::pipeline::{audio, PipelineManager};
use crate::session::{JoinOutcome, SessionRegistry};

use messages::{ClientMessage, ServerMessage};

/// Shared state behind the router.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub pipelines: Arc<PipelineManager>,
    pub config: Arc<Config>,
}

/// Build the service router: the WebSocket endpoint plus a health probe.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(healthz))
        .layer(cors)
        .with_state(state)
}

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    let (active_sessions, waiting) = state.registry.counts();
    Json(serde_json::json!({
        "status": "ok",
        "activeSessions": active_sessions,
        "waitingParticipants": waiting,
    }))
}

async fn ws_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

// ── Join validation ───────────────────────────────────────────────

/// Validate a join payload. The transport stays open on failure; the
/// client gets one typed error message.
fn validate_join(role: &str, language: &str, voice_id: &str) -> Result<Language> {
    if role.trim().is_empty() {
        return Err(Error::Validation("role must not be empty".into()));
    }
    if voice_id.trim().is_empty() {
        return Err(Error::Validation("voiceId must not be empty".into()));
    }
    Language::parse(language)
}

// ── Connection lifecycle ──────────────────────────────────────────

async fn handle_connection(socket: WebSocket, state: AppState) {
    let (ws_sender, mut ws_receiver) = socket.split();

    // Single-writer discipline: everything outbound goes through one
    // channel drained by one task.
    let (out_tx, out_rx) = mpsc::channel::<ServerMessage>(256);
    let writer = tokio::spawn(writer_loop(ws_sender, out_rx));

    let heartbeat_interval = state.config.heartbeat_interval;
    let mut heartbeat = tokio::time::interval(heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    heartbeat.reset();

    let mut participant_id: Option<String> = None;
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                let Some(Ok(msg)) = msg else { break };
                last_seen = Instant::now();
                match msg {
                    Message::Text(text) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(ClientMessage::JoinSession { role, language, voice_id }) => {
                                handle_join(
                                    &state,
                                    &out_tx,
                                    &mut participant_id,
                                    &role,
                                    &language,
                                    &voice_id,
                                )
                                .await;
                            }
                            Ok(ClientMessage::StreamingAudio { audio }) => {
                                match base64::engine::general_purpose::STANDARD.decode(&audio) {
                                    Ok(frame) => {
                                        handle_audio(&state, participant_id.as_deref(), frame);
                                    }
                                    Err(e) => {
                                        tracing::warn!(error = %e, "Undecodable streaming-audio payload");
                                    }
                                }
                            }
                            Ok(ClientMessage::HeartbeatPong) => {
                                // last_seen already refreshed above.
                            }
                            Err(e) => {
                                let _ = out_tx
                                    .send(ServerMessage::Error {
                                        code: "bad-message".into(),
                                        message: format!("unrecognized message: {e}"),
                                    })
                                    .await;
                            }
                        }
                    }
                    Message::Binary(data) => {
                        handle_audio(&state, participant_id.as_deref(), data.to_vec());
                    }
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => {}
                }
            }

            _ = heartbeat.tick() => {
                if last_seen.elapsed() > heartbeat_interval {
                    tracing::info!(
                        participant_id = participant_id.as_deref().unwrap_or("-"),
                        "Heartbeat missed, force-disconnecting"
                    );
                    break;
                }
                if out_tx.send(ServerMessage::Ping).await.is_err() {
                    break;
                }
            }
        }
    }

    // Teardown: registry removal, pipeline shutdown, partner requeue.
    if let Some(pid) = participant_id {
        let outcome = state.registry.remove_user(&pid);
        state.pipelines.teardown(&pid).await;
        if let Some((partner, pending_session)) = outcome.requeued_partner {
            tracing::info!(
                participant_id = %pid,
                partner_id = %partner.id,
                "Partner requeued after disconnect"
            );
            // The partner's pipeline keeps running; with no active
            // session its utterances are dropped until it pairs again.
            if let Some(outbound) = state.registry.outbound(&partner.id) {
                let _ = outbound
                    .send(ServerMessage::PartnerDisconnected {
                        session_id: pending_session,
                    })
                    .await;
            }
        }
        tracing::info!(participant_id = %pid, "Participant disconnected");
    }
    writer.abort();
}

/// Drain the outbound channel into the socket, serializing every message
/// as a JSON text frame.
async fn writer_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::Receiver<ServerMessage>,
) {
    while let Some(message) = out_rx.recv().await {
        let json = match serde_json::to_string(&message) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize outbound message");
                continue;
            }
        };
        if sink.send(Message::Text(json.into())).await.is_err() {
            break;
        }
    }
}

async fn handle_join(
    state: &AppState,
    out_tx: &mpsc::Sender<ServerMessage>,
    participant_id: &mut Option<String>,
    role: &str,
    language: &str,
    voice_id: &str,
) {
    if participant_id.is_some() {
        let _ = out_tx
            .send(ServerMessage::Error {
                code: "already-joined".into(),
                message: "this connection already has a participant".into(),
            })
            .await;
        return;
    }

    let language = match validate_join(role, language, voice_id) {
        Ok(language) => language,
        Err(e) => {
            let _ = out_tx
                .send(ServerMessage::Error {
                    code: "validation".into(),
                    message: e.to_string(),
                })
                .await;
            return;
        }
    };

    match state
        .registry
        .add_user(role, language, voice_id, out_tx.clone())
    {
        JoinOutcome::Waiting {
            participant,
            session_id,
        } => {
            *participant_id = Some(participant.id.clone());
            let _ = out_tx
                .send(ServerMessage::WaitingForPartner { session_id })
                .await;
        }
        JoinOutcome::Paired {
            session_id,
            participant,
            partner,
        } => {
            *participant_id = Some(participant.id.clone());
            let _ = out_tx
                .send(ServerMessage::SessionJoined {
                    session_id: session_id.clone(),
                })
                .await;
            // Both sides learn each other's language and role.
            let _ = out_tx
                .send(ServerMessage::SessionReady {
                    session_id: session_id.clone(),
                    partner_language: partner.language.tag().to_string(),
                    partner_role: partner.role.clone(),
                })
                .await;
            if let Some(partner_outbound) = state.registry.outbound(&partner.id) {
                let _ = partner_outbound
                    .send(ServerMessage::SessionReady {
                        session_id,
                        partner_language: participant.language.tag().to_string(),
                        partner_role: participant.role.clone(),
                    })
                    .await;
            }
            state.pipelines.start_session(&participant, &partner);
        }
        JoinOutcome::Reconnected {
            participant,
            session_id,
            session_active,
        } => {
            *participant_id = Some(participant.id.clone());
            let _ = out_tx
                .send(ServerMessage::SessionJoined { session_id })
                .await;
            if session_active {
                // The pipeline survived; make sure it is actually there
                // (it is, unless the server restarted mid-session).
                if let Err(e) = state.pipelines.start_participant(&participant) {
                    tracing::error!(
                        participant_id = %participant.id,
                        error = %e,
                        "Pipeline restart on reconnect failed"
                    );
                }
            }
        }
    }
}

/// Route one audio frame into the pipeline. Frames without an active
/// session are ignored with a warning; malformed frames are dropped.
fn handle_audio(state: &AppState, participant_id: Option<&str>, frame: Vec<u8>) {
    let Some(pid) = participant_id else {
        tracing::warn!("Audio frame before join, ignoring");
        return;
    };
    if let Err(reason) = audio::validate_frame(&frame) {
        tracing::warn!(participant_id = pid, reason, "Dropping malformed audio frame");
        return;
    }
    if state.registry.find_partner(pid).is_none() {
        tracing::warn!(participant_id = pid, "Audio frame outside an active session, ignoring");
        return;
    }
    state.pipelines.submit_audio(pid, frame);
}
