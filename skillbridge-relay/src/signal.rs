//! Call/screen-share coordination.
//!
//! The relay is blind to WebRTC: offers, answers, and ICE candidates are
//! opaque payloads forwarded to the rest of the room, fire-and-forget.
//! The only server-side state is a per-room phase tag
//! (`idle → offering → established`) kept so that disconnect cleanup
//! knows to synthesize a `screen-stop` for the counterpart. The tag is
//! never used to validate client behavior: candidates are relayed in any
//! phase, and an answer without a preceding offer is still forwarded.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Externally visible negotiation phase of a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    /// No share or call in progress.
    Idle,
    /// An offer has been relayed; waiting for the answer.
    Offering,
    /// Offer and answer have both been relayed.
    Established,
}

/// Tagged state of one in-progress negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallState {
    Offering { originator: Uuid },
    Established { originator: Uuid, answerer: Uuid },
}

impl CallState {
    fn is_party(&self, conn_id: Uuid) -> bool {
        match *self {
            CallState::Offering { originator } => originator == conn_id,
            CallState::Established { originator, answerer } => {
                originator == conn_id || answerer == conn_id
            }
        }
    }
}

struct CallSession {
    state: CallState,
    candidates_relayed: u64,
    started_at: Instant,
}

/// Summary of a finished negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSummary {
    pub phase: NegotiationPhase,
    pub candidates_relayed: u64,
    pub duration: Duration,
}

/// Tracks at most one negotiation per room.
///
/// All methods are teardown bookkeeping around the relay's pass-through;
/// none of them gates whether a signaling event is forwarded.
pub struct CallCoordinator {
    sessions: RwLock<HashMap<Uuid, CallSession>>,
}

impl CallCoordinator {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// A connection relayed an offer. A fresh offer replaces any
    /// negotiation already recorded for the room.
    pub async fn offer_opened(&self, room_id: Uuid, originator: Uuid) {
        let mut sessions = self.sessions.write().await;
        sessions.insert(
            room_id,
            CallSession {
                state: CallState::Offering { originator },
                candidates_relayed: 0,
                started_at: Instant::now(),
            },
        );
    }

    /// A connection relayed an answer. Moves `offering → established`;
    /// an answer with no recorded offer is left untracked.
    pub async fn answer_received(&self, room_id: Uuid, answerer: Uuid) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(&room_id) {
            if let CallState::Offering { originator } = session.state {
                session.state = CallState::Established { originator, answerer };
            }
        }
    }

    /// An ICE candidate was relayed. Counted in any phase.
    pub async fn candidate_relayed(&self, room_id: Uuid) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(&room_id) {
            session.candidates_relayed += 1;
        }
    }

    /// Explicit `screen-stop`: tear down the room's negotiation.
    pub async fn ended(&self, room_id: Uuid) -> Option<CallSummary> {
        let mut sessions = self.sessions.write().await;
        sessions.remove(&room_id).map(|s| CallSummary {
            phase: match s.state {
                CallState::Offering { .. } => NegotiationPhase::Offering,
                CallState::Established { .. } => NegotiationPhase::Established,
            },
            candidates_relayed: s.candidates_relayed,
            duration: s.started_at.elapsed(),
        })
    }

    /// A connection went away. Returns `true` when it was party to the
    /// room's negotiation, in which case the negotiation is torn down and
    /// the caller owes the counterpart a synthesized `screen-stop`.
    pub async fn connection_dropped(&self, room_id: Uuid, conn_id: Uuid) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(&room_id) {
            Some(session) if session.state.is_party(conn_id) => {
                sessions.remove(&room_id);
                true
            }
            _ => false,
        }
    }

    pub async fn phase(&self, room_id: Uuid) -> NegotiationPhase {
        let sessions = self.sessions.read().await;
        match sessions.get(&room_id).map(|s| s.state) {
            None => NegotiationPhase::Idle,
            Some(CallState::Offering { .. }) => NegotiationPhase::Offering,
            Some(CallState::Established { .. }) => NegotiationPhase::Established,
        }
    }

    pub async fn active_calls(&self) -> usize {
        self.sessions.read().await.len()
    }
}

impl Default for CallCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
