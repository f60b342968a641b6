//! Client-side presence: the room roster and the typing indicator.
//!
//! The relay forwards typing events best-effort and never persists
//! them, so a lost `stop-typing` must not leave the indicator stuck:
//! the remote flag expires on its own after [`TYPING_TIMEOUT`].
//! Outgoing typing events are throttled so a fast typist doesn't emit
//! one per keystroke.
//!
//! ```text
//! keystroke ──► PresenceTracker::note_local_input()
//!                   │  (throttled: one event per interval)
//!                   ▼
//!              ClientEvent::Typing ──► relay ──► counterpart
//!                                                   │
//!                                                   ▼
//!                               PresenceTracker::observe() ── expiry sweep
//! ```

use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::client::ChatEvent;
use crate::protocol::ParticipantRole;

/// How long the remote typing indicator stays lit without a refresh.
pub const TYPING_TIMEOUT: Duration = Duration::from_secs(2);

/// Minimum interval between outgoing typing events.
pub const TYPING_SEND_INTERVAL: Duration = Duration::from_secs(1);

/// A participant currently present in the room.
#[derive(Debug, Clone)]
pub struct RosterEntry {
    pub user_id: Uuid,
    pub name: String,
    pub role: ParticipantRole,
    pub joined_at: Instant,
}

/// Tracks who is in the room and whether the other side is typing.
///
/// Fed from the client's [`ChatEvent`] stream; owns no I/O. The caller
/// emits `typing`/`stop-typing` when the tracker says to.
pub struct PresenceTracker {
    local_user_id: Uuid,
    /// Remote participants, keyed by user id.
    peers: HashMap<Uuid, RosterEntry>,
    /// When the counterpart last signalled typing.
    remote_typing_since: Option<Instant>,
    /// Rate limiter: last time we emitted a typing event.
    last_typing_sent: Instant,
    typing_send_interval: Duration,
    typing_timeout: Duration,
}

impl PresenceTracker {
    pub fn new(local_user_id: Uuid) -> Self {
        Self {
            local_user_id,
            peers: HashMap::new(),
            remote_typing_since: None,
            // allow an immediate first emission
            last_typing_sent: Instant::now() - TYPING_SEND_INTERVAL,
            typing_send_interval: TYPING_SEND_INTERVAL,
            typing_timeout: TYPING_TIMEOUT,
        }
    }

    /// Create with custom intervals (for testing).
    pub fn with_intervals(
        local_user_id: Uuid,
        send_interval: Duration,
        timeout: Duration,
    ) -> Self {
        let mut tracker = Self::new(local_user_id);
        tracker.last_typing_sent = Instant::now() - send_interval;
        tracker.typing_send_interval = send_interval;
        tracker.typing_timeout = timeout;
        tracker
    }

    /// Feed one event from the client stream.
    pub fn observe(&mut self, event: &ChatEvent) {
        match event {
            ChatEvent::PeerJoined { user_id, name, role } => {
                if *user_id == self.local_user_id {
                    return;
                }
                self.peers.insert(
                    *user_id,
                    RosterEntry {
                        user_id: *user_id,
                        name: name.clone(),
                        role: *role,
                        joined_at: Instant::now(),
                    },
                );
            }

            ChatEvent::PeerLeft { user_id } => {
                self.peers.remove(user_id);
                // The departed side can't be typing anymore
                self.remote_typing_since = None;
            }

            ChatEvent::PeerTyping => {
                self.remote_typing_since = Some(Instant::now());
            }

            ChatEvent::PeerStoppedTyping => {
                self.remote_typing_since = None;
            }

            // A delivered message supersedes its typing indicator
            ChatEvent::MessageReceived(_) => {
                self.remote_typing_since = None;
            }

            ChatEvent::Disconnected => {
                self.peers.clear();
                self.remote_typing_since = None;
            }

            _ => {}
        }
    }

    /// Called on every local keystroke. Returns `true` when a `typing`
    /// event should actually be emitted (throttled).
    pub fn note_local_input(&mut self) -> bool {
        if self.last_typing_sent.elapsed() < self.typing_send_interval {
            return false;
        }
        self.last_typing_sent = Instant::now();
        true
    }

    /// Whether a `stop-typing` is due, given the time of the last local
    /// keystroke.
    pub fn local_stop_due(&self, last_input: Instant) -> bool {
        last_input.elapsed() >= self.typing_timeout
    }

    /// Whether the counterpart's typing indicator should be shown.
    ///
    /// Expires on its own — a dropped `stop-typing` never wedges the UI.
    pub fn remote_typing(&self) -> bool {
        match self.remote_typing_since {
            Some(since) => since.elapsed() < self.typing_timeout,
            None => false,
        }
    }

    /// Clear an expired typing flag. Returns `true` when the indicator
    /// was lit and has just gone stale.
    pub fn sweep_typing(&mut self) -> bool {
        match self.remote_typing_since {
            Some(since) if since.elapsed() >= self.typing_timeout => {
                self.remote_typing_since = None;
                true
            }
            _ => false,
        }
    }

    /// Remote participants currently in the room.
    pub fn roster(&self) -> Vec<&RosterEntry> {
        self.peers.values().collect()
    }

    pub fn peer(&self, user_id: &Uuid) -> Option<&RosterEntry> {
        self.peers.get(user_id)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn local_user_id(&self) -> Uuid {
        self.local_user_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn joined(user_id: Uuid, name: &str, role: ParticipantRole) -> ChatEvent {
        ChatEvent::PeerJoined {
            user_id,
            name: name.to_owned(),
            role,
        }
    }

    #[test]
    fn test_roster_join_leave() {
        let mut tracker = PresenceTracker::new(Uuid::new_v4());
        let mentor = Uuid::new_v4();

        tracker.observe(&joined(mentor, "Aiko", ParticipantRole::Mentor));
        assert_eq!(tracker.peer_count(), 1);
        assert_eq!(tracker.peer(&mentor).map(|p| p.name.as_str()), Some("Aiko"));

        tracker.observe(&ChatEvent::PeerLeft { user_id: mentor });
        assert_eq!(tracker.peer_count(), 0);
    }

    #[test]
    fn test_own_join_is_ignored() {
        let me = Uuid::new_v4();
        let mut tracker = PresenceTracker::new(me);
        tracker.observe(&joined(me, "Kenji", ParticipantRole::Learner));
        assert_eq!(tracker.peer_count(), 0);
    }

    #[test]
    fn test_typing_set_and_cleared() {
        let mut tracker = PresenceTracker::new(Uuid::new_v4());
        assert!(!tracker.remote_typing());

        tracker.observe(&ChatEvent::PeerTyping);
        assert!(tracker.remote_typing());

        tracker.observe(&ChatEvent::PeerStoppedTyping);
        assert!(!tracker.remote_typing());
    }

    #[test]
    fn test_typing_cleared_by_message_arrival() {
        let mut tracker = PresenceTracker::new(Uuid::new_v4());
        tracker.observe(&ChatEvent::PeerTyping);

        let message = crate::protocol::Message::local_preview(
            Uuid::new_v4(),
            Uuid::new_v4(),
            crate::protocol::MessageKind::Text,
            "done typing",
        );
        tracker.observe(&ChatEvent::MessageReceived(message));
        assert!(!tracker.remote_typing());
    }

    #[test]
    fn test_typing_expires_without_stop() {
        let mut tracker = PresenceTracker::with_intervals(
            Uuid::new_v4(),
            Duration::from_millis(1),
            Duration::from_millis(10),
        );

        tracker.observe(&ChatEvent::PeerTyping);
        assert!(tracker.remote_typing());

        // The stop-typing event was lost; the indicator still clears
        thread::sleep(Duration::from_millis(15));
        assert!(!tracker.remote_typing());
        assert!(tracker.sweep_typing());
        assert!(!tracker.sweep_typing());
    }

    #[test]
    fn test_outgoing_typing_throttled() {
        let mut tracker = PresenceTracker::with_intervals(
            Uuid::new_v4(),
            Duration::from_millis(20),
            Duration::from_secs(2),
        );

        assert!(tracker.note_local_input());
        // Immediately after, further keystrokes are throttled
        assert!(!tracker.note_local_input());
        assert!(!tracker.note_local_input());

        thread::sleep(Duration::from_millis(25));
        assert!(tracker.note_local_input());
    }

    #[test]
    fn test_local_stop_due() {
        let tracker = PresenceTracker::with_intervals(
            Uuid::new_v4(),
            Duration::from_millis(1),
            Duration::from_millis(10),
        );

        let last_input = Instant::now();
        assert!(!tracker.local_stop_due(last_input));
        thread::sleep(Duration::from_millis(15));
        assert!(tracker.local_stop_due(last_input));
    }

    #[test]
    fn test_disconnect_clears_everything() {
        let mut tracker = PresenceTracker::new(Uuid::new_v4());
        tracker.observe(&joined(Uuid::new_v4(), "Aiko", ParticipantRole::Mentor));
        tracker.observe(&ChatEvent::PeerTyping);

        tracker.observe(&ChatEvent::Disconnected);
        assert_eq!(tracker.peer_count(), 0);
        assert!(!tracker.remote_typing());
    }
}
