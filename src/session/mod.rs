//! Session registry and pairing engine.
//!
//! Owns every [`Session`] and [`Participant`]. Two ordered waiting lists
//! (one per role slot) implement first-come-first-served matching: a
//! joiner is paired with the first opposite-slot waiter speaking a
//! different language, otherwise enqueued and left in a pending session.
//!
//! All mutation happens under one short-held lock; callers clone outbound
//! senders out of the registry and perform sends outside the critical
//! section. Pipeline tasks reference participants only by id through this
//! registry, never by direct ownership.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::language::Language;
use crate::transport::messages::ServerMessage;

/// Outbound handle for one participant's transport. Replaced in place on
/// reconnect; the single writer task on the other end keeps per-transport
/// message order.
pub type Outbound = mpsc::Sender<ServerMessage>;

// ── Participants ──────────────────────────────────────────────────

/// Which waiting list a role label maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleSlot {
    A,
    B,
}

/// One speaker's endpoint in a session.
#[derive(Debug)]
pub struct Participant {
    pub id: String,
    pub role: String,
    pub slot: RoleSlot,
    pub language: Language,
    pub voice_id: String,
    pub outbound: Outbound,
    pub joined_at: Instant,
    pub last_activity: Instant,
    /// Session this participant belongs to. Always set; a lone joiner
    /// holds a pending session.
    pub session_id: String,
}

/// Immutable snapshot handed to pipeline tasks.
#[derive(Debug, Clone)]
pub struct ParticipantInfo {
    pub id: String,
    pub role: String,
    pub language: Language,
    pub voice_id: String,
}

impl From<&Participant> for ParticipantInfo {
    fn from(p: &Participant) -> Self {
        Self {
            id: p.id.clone(),
            role: p.role.clone(),
            language: p.language,
            voice_id: p.voice_id.clone(),
        }
    }
}

// ── Sessions ──────────────────────────────────────────────────────

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Pending,
    Active,
    Ended,
}

/// Rolling per-session statistics.
#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    pub message_count: u64,
    pub translation_count: u64,
    pub error_count: u64,
    pub cumulative_latency_ms: u64,
    pub avg_latency_ms: f64,
}

impl SessionStats {
    /// Record one completed translation with its end-to-end latency.
    pub fn record_translation(&mut self, latency_ms: u64) {
        self.translation_count += 1;
        self.cumulative_latency_ms += latency_ms;
        self.avg_latency_ms = self.cumulative_latency_ms as f64 / self.translation_count as f64;
    }
}

/// A two-participant binding with distinct source languages.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub status: SessionStatus,
    pub created_at: Instant,
    pub ended_at: Option<Instant>,
    /// Participant ids; a pending session holds exactly one.
    pub participants: Vec<String>,
    pub stats: SessionStats,
}

// ── Join / remove outcomes ────────────────────────────────────────

/// Result of [`SessionRegistry::add_user`].
#[derive(Debug)]
pub enum JoinOutcome {
    /// No compatible waiter; the joiner sits in a pending session.
    Waiting {
        participant: ParticipantInfo,
        session_id: String,
    },
    /// Matched with a waiter; the session is now active.
    Paired {
        session_id: String,
        participant: ParticipantInfo,
        partner: ParticipantInfo,
    },
    /// An existing participant with the same (role, language, voice)
    /// triple had its transport swapped in place.
    Reconnected {
        participant: ParticipantInfo,
        session_id: String,
        session_active: bool,
    },
}

/// Result of [`SessionRegistry::remove_user`].
#[derive(Debug, Default)]
pub struct RemoveOutcome {
    /// The removed participant, if it existed.
    pub removed: Option<ParticipantInfo>,
    /// Partner that was moved back to its waiting list, with its new
    /// pending session id. The caller notifies it.
    pub requeued_partner: Option<(ParticipantInfo, String)>,
    /// Session that transitioned to Ended.
    pub ended_session: Option<String>,
}

/// Result of a periodic sweep; the caller tears down pipelines and sends
/// notifications for everything listed.
#[derive(Debug, Default)]
pub struct SweepOutcome {
    /// Participants dropped because their session idled out or their
    /// pending wait expired.
    pub dropped: Vec<ParticipantInfo>,
    /// Sessions that transitioned to Ended this sweep.
    pub ended_sessions: Vec<String>,
}

// ── Registry ──────────────────────────────────────────────────────

#[derive(Default)]
struct RegistryInner {
    participants: HashMap<String, Participant>,
    sessions: HashMap<String, Session>,
    waiting_a: VecDeque<String>,
    waiting_b: VecDeque<String>,
}

/// Process-wide owner of sessions, participants and waiting lists.
pub struct SessionRegistry {
    inner: Mutex<RegistryInner>,
    /// Role labels mapping to slot A; everything else is slot B.
    a_roles: Vec<String>,
    ended_grace: Duration,
    session_idle: Duration,
    pending_max_age: Duration,
}

impl SessionRegistry {
    pub fn new(ended_grace: Duration, session_idle: Duration, pending_max_age: Duration) -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            a_roles: vec!["doctor".into(), "agent".into()],
            ended_grace,
            session_idle,
            pending_max_age,
        }
    }

    fn slot_for(&self, role: &str) -> RoleSlot {
        if self.a_roles.iter().any(|r| r.eq_ignore_ascii_case(role)) {
            RoleSlot::A
        } else {
            RoleSlot::B
        }
    }

    /// Add a participant, applying the matching policy:
    /// 1. reconnect check by (role, language, voice) triple;
    /// 2. first different-language waiter in the opposite-slot list;
    /// 3. otherwise enqueue into the own-slot list with a pending session.
    pub fn add_user(
        &self,
        role: &str,
        language: Language,
        voice_id: &str,
        outbound: Outbound,
    ) -> JoinOutcome {
        let slot = self.slot_for(role);
        let now = Instant::now();
        let mut inner = self.inner.lock();

        // Reconnect: swap the transport handle in place, preserving the
        // session and the pipeline runtime.
        let existing = inner.participants.values().find(|p| {
            p.role == role && p.language == language && p.voice_id == voice_id
        });
        if let Some(p) = existing {
            let pid = p.id.clone();
            let session_id = p.session_id.clone();
            let info = ParticipantInfo::from(p);
            let active = inner
                .sessions
                .get(&session_id)
                .is_some_and(|s| s.status == SessionStatus::Active);
            if let Some(p) = inner.participants.get_mut(&pid) {
                p.outbound = outbound;
                p.last_activity = now;
            }
            tracing::info!(
                participant_id = %pid,
                session_id = %session_id,
                "Transport swapped on reconnect"
            );
            return JoinOutcome::Reconnected {
                participant: info,
                session_id,
                session_active: active,
            };
        }

        let id = Uuid::new_v4().to_string();

        // Scan the opposite waiting list for the first waiter whose
        // language differs. Lists are FIFO so ties resolve by enqueue time.
        let opposite = match slot {
            RoleSlot::A => &inner.waiting_b,
            RoleSlot::B => &inner.waiting_a,
        };
        let match_idx = opposite.iter().position(|waiter_id| {
            inner
                .participants
                .get(waiter_id)
                .is_some_and(|w| w.language != language)
        });
        let matched = match_idx.and_then(|idx| {
            let opposite = match slot {
                RoleSlot::A => &mut inner.waiting_b,
                RoleSlot::B => &mut inner.waiting_a,
            };
            opposite.remove(idx)
        });

        if let Some(partner_id) = matched {
            // Promote the waiter's pending session to active.
            let session_id = inner
                .participants
                .get(&partner_id)
                .map(|p| p.session_id.clone())
                .expect("waiting participant has a session");
            let participant = Participant {
                id: id.clone(),
                role: role.to_string(),
                slot,
                language,
                voice_id: voice_id.to_string(),
                outbound,
                joined_at: now,
                last_activity: now,
                session_id: session_id.clone(),
            };
            let info = ParticipantInfo::from(&participant);
            let partner_info = inner
                .participants
                .get(&partner_id)
                .map(ParticipantInfo::from)
                .expect("partner exists");
            inner.participants.insert(id, participant);
            let session = inner
                .sessions
                .get_mut(&session_id)
                .expect("pending session exists");
            session.participants.push(info.id.clone());
            session.status = SessionStatus::Active;
            tracing::info!(
                session_id = %session_id,
                a = %partner_info.id,
                b = %info.id,
                "Session active"
            );
            JoinOutcome::Paired {
                session_id,
                participant: info,
                partner: partner_info,
            }
        } else {
            // No match: pending session + own-slot queue.
            let session_id = Uuid::new_v4().to_string();
            let participant = Participant {
                id: id.clone(),
                role: role.to_string(),
                slot,
                language,
                voice_id: voice_id.to_string(),
                outbound,
                joined_at: now,
                last_activity: now,
                session_id: session_id.clone(),
            };
            let info = ParticipantInfo::from(&participant);
            inner.participants.insert(id.clone(), participant);
            inner.sessions.insert(
                session_id.clone(),
                Session {
                    id: session_id.clone(),
                    status: SessionStatus::Pending,
                    created_at: now,
                    ended_at: None,
                    participants: vec![id.clone()],
                    stats: SessionStats::default(),
                },
            );
            match slot {
                RoleSlot::A => inner.waiting_a.push_back(id),
                RoleSlot::B => inner.waiting_b.push_back(id),
            }
            JoinOutcome::Waiting {
                participant: info,
                session_id,
            }
        }
    }

    /// Remove a participant. If it was in an active session, the partner
    /// is moved back to its waiting list under a fresh pending session and
    /// the old session is marked Ended (discoverable for the grace window).
    pub fn remove_user(&self, participant_id: &str) -> RemoveOutcome {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let Some(participant) = inner.participants.remove(participant_id) else {
            return RemoveOutcome::default();
        };
        inner.waiting_a.retain(|id| id != participant_id);
        inner.waiting_b.retain(|id| id != participant_id);

        let mut outcome = RemoveOutcome {
            removed: Some(ParticipantInfo::from(&participant)),
            ..Default::default()
        };

        let session_id = participant.session_id.clone();
        let (was_active, partner_id) = match inner.sessions.get_mut(&session_id) {
            Some(session) => {
                let was_active = session.status == SessionStatus::Active;
                session.status = SessionStatus::Ended;
                session.ended_at = Some(now);
                let partner = session
                    .participants
                    .iter()
                    .find(|id| id.as_str() != participant_id)
                    .cloned();
                (was_active, partner)
            }
            None => (false, None),
        };
        outcome.ended_session = Some(session_id);

        if was_active {
            if let Some(partner_id) = partner_id {
                if let Some(partner) = inner.participants.get(&partner_id) {
                    let slot = partner.slot;
                    let info = ParticipantInfo::from(partner);
                    // Fresh pending session for the requeued partner.
                    let pending_id = Uuid::new_v4().to_string();
                    inner.sessions.insert(
                        pending_id.clone(),
                        Session {
                            id: pending_id.clone(),
                            status: SessionStatus::Pending,
                            created_at: now,
                            ended_at: None,
                            participants: vec![partner_id.clone()],
                            stats: SessionStats::default(),
                        },
                    );
                    if let Some(partner) = inner.participants.get_mut(&partner_id) {
                        partner.session_id = pending_id.clone();
                    }
                    match slot {
                        RoleSlot::A => inner.waiting_a.push_back(partner_id),
                        RoleSlot::B => inner.waiting_b.push_back(partner_id),
                    }
                    outcome.requeued_partner = Some((info, pending_id));
                }
            }
        }
        outcome
    }

    /// Partner of a participant in its active session.
    pub fn find_partner(&self, participant_id: &str) -> Option<ParticipantInfo> {
        let inner = self.inner.lock();
        let participant = inner.participants.get(participant_id)?;
        let session = inner.sessions.get(&participant.session_id)?;
        if session.status != SessionStatus::Active {
            return None;
        }
        session
            .participants
            .iter()
            .find(|id| id.as_str() != participant_id)
            .and_then(|id| inner.participants.get(id))
            .map(ParticipantInfo::from)
    }

    /// Clone the outbound sender for a participant.
    pub fn outbound(&self, participant_id: &str) -> Option<Outbound> {
        let inner = self.inner.lock();
        inner
            .participants
            .get(participant_id)
            .map(|p| p.outbound.clone())
    }

    /// Session status lookup (Ended sessions stay visible for the grace
    /// window).
    pub fn session_status(&self, session_id: &str) -> Option<SessionStatus> {
        self.inner.lock().sessions.get(session_id).map(|s| s.status)
    }

    /// Refresh a participant's activity timestamp, and its partner's
    /// session visibility. Also bumps the session message counter.
    pub fn touch_activity(&self, participant_id: &str) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let Some(session_id) = inner
            .participants
            .get_mut(participant_id)
            .map(|p| {
                p.last_activity = now;
                p.session_id.clone()
            })
        else {
            return;
        };
        if let Some(session) = inner.sessions.get_mut(&session_id) {
            session.stats.message_count += 1;
        }
    }

    /// Record a completed translation for the participant's session.
    pub fn record_translation(&self, participant_id: &str, latency_ms: u64) {
        let mut inner = self.inner.lock();
        let Some(session_id) = inner
            .participants
            .get(participant_id)
            .map(|p| p.session_id.clone())
        else {
            return;
        };
        if let Some(session) = inner.sessions.get_mut(&session_id) {
            session.stats.record_translation(latency_ms);
        }
    }

    /// Record a pipeline error against the participant's session.
    pub fn record_error(&self, participant_id: &str) {
        let mut inner = self.inner.lock();
        let Some(session_id) = inner
            .participants
            .get(participant_id)
            .map(|p| p.session_id.clone())
        else {
            return;
        };
        if let Some(session) = inner.sessions.get_mut(&session_id) {
            session.stats.error_count += 1;
        }
    }

    /// Periodic sweep: drop idle active sessions, expired pending
    /// sessions, and garbage-collect ended sessions past the grace window.
    pub fn sweep(&self) -> SweepOutcome {
        let now = Instant::now();
        let mut outcome = SweepOutcome::default();
        let mut inner = self.inner.lock();

        // Idle active sessions: both participants silent for too long.
        let mut to_end: Vec<String> = Vec::new();
        for session in inner.sessions.values() {
            match session.status {
                SessionStatus::Active => {
                    let all_idle = session.participants.iter().all(|id| {
                        inner
                            .participants
                            .get(id)
                            .is_some_and(|p| now.duration_since(p.last_activity) > self.session_idle)
                    });
                    if all_idle {
                        to_end.push(session.id.clone());
                    }
                }
                SessionStatus::Pending => {
                    if now.duration_since(session.created_at) > self.pending_max_age {
                        to_end.push(session.id.clone());
                    }
                }
                SessionStatus::Ended => {}
            }
        }
        for session_id in to_end {
            let Some(session) = inner.sessions.get_mut(&session_id) else {
                continue;
            };
            session.status = SessionStatus::Ended;
            session.ended_at = Some(now);
            let member_ids = session.participants.clone();
            outcome.ended_sessions.push(session_id);
            for id in member_ids {
                if let Some(p) = inner.participants.remove(&id) {
                    outcome.dropped.push(ParticipantInfo::from(&p));
                }
                inner.waiting_a.retain(|w| w != &id);
                inner.waiting_b.retain(|w| w != &id);
            }
        }

        // GC ended sessions past the grace window.
        let grace = self.ended_grace;
        inner.sessions.retain(|_, s| match (s.status, s.ended_at) {
            (SessionStatus::Ended, Some(at)) => now.duration_since(at) <= grace,
            _ => true,
        });

        outcome
    }

    /// Counts for the health endpoint: (active sessions, waiting
    /// participants).
    pub fn counts(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        let active = inner
            .sessions
            .values()
            .filter(|s| s.status == SessionStatus::Active)
            .count();
        (active, inner.waiting_a.len() + inner.waiting_b.len())
    }
}
