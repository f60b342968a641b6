//! Room registry: fan-out to N-1 connections with backpressure.
//!
//! Each room gets one tokio broadcast channel; every member connection
//! holds an independent receiver that buffers up to `capacity` frames.
//! Frames are encoded once and shared as `Arc<String>` — a receiver that
//! falls more than `capacity` frames behind starts dropping (lagging).
//!
//! Frames carry the originating connection id so receivers can filter
//! out their own traffic: the relay never echoes an event back to the
//! connection that sent it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{ParticipantRole, ProtocolError, ServerEvent};

/// A connection's identity inside a room.
#[derive(Debug, Clone, PartialEq)]
pub struct Participant {
    /// Transport endpoint id, assigned at accept time.
    pub conn_id: Uuid,
    /// Authenticated user identity bound at join time.
    pub user_id: Uuid,
    pub name: String,
    pub role: ParticipantRole,
}

/// One pre-encoded frame travelling through a room channel.
#[derive(Debug, Clone)]
pub struct Outbound {
    /// Connection that caused the frame; receivers skip their own.
    pub origin: Uuid,
    pub frame: Arc<String>,
}

impl Outbound {
    /// Whether this frame should be delivered to `conn_id`.
    pub fn is_for(&self, conn_id: Uuid) -> bool {
        self.origin != conn_id
    }
}

/// Statistics for monitoring a room channel.
#[derive(Debug, Clone, Default)]
pub struct ChannelStats {
    pub frames_sent: u64,
    pub active_members: usize,
}

/// Membership set and broadcast channel for a single room.
pub struct RoomChannel {
    sender: broadcast::Sender<Outbound>,

    /// Connections currently in this room, keyed by connection id.
    members: RwLock<HashMap<Uuid, Participant>>,

    /// Frames buffered per receiver before lagging sets in.
    capacity: usize,

    /// Lock-free send counter.
    frames_sent: AtomicU64,
}

impl RoomChannel {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            members: RwLock::new(HashMap::new()),
            capacity,
            frames_sent: AtomicU64::new(0),
        }
    }

    /// Record a connection as a member and hand it a receiver.
    pub async fn add_member(&self, participant: Participant) -> broadcast::Receiver<Outbound> {
        let mut members = self.members.write().await;
        members.insert(participant.conn_id, participant);
        self.sender.subscribe()
    }

    /// Remove a connection from the membership set.
    ///
    /// The connection's receiver stays subscribed until dropped; removal
    /// only affects membership accounting and empty-room cleanup.
    pub async fn remove_member(&self, conn_id: &Uuid) -> Option<Participant> {
        let mut members = self.members.write().await;
        members.remove(conn_id)
    }

    /// Encode an event once and fan it out to all subscribed receivers.
    ///
    /// Returns the number of receivers the frame reached. Receivers
    /// filter on `origin`, so the count includes the sender's own.
    pub fn publish(&self, origin: Uuid, event: &ServerEvent) -> Result<usize, ProtocolError> {
        let frame = Arc::new(event.encode()?);
        Ok(self.publish_raw(origin, frame))
    }

    /// Fan out a pre-encoded frame (zero-copy fast path).
    pub fn publish_raw(&self, origin: Uuid, frame: Arc<String>) -> usize {
        let count = self.sender.send(Outbound { origin, frame }).unwrap_or(0);
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn members(&self) -> Vec<Participant> {
        self.members.read().await.values().cloned().collect()
    }

    pub async fn has_member(&self, conn_id: &Uuid) -> bool {
        self.members.read().await.contains_key(conn_id)
    }

    pub async fn stats(&self) -> ChannelStats {
        let members = self.members.read().await;
        ChannelStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            active_members: members.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Subscribe without membership (monitoring, tests).
    pub fn subscribe(&self) -> broadcast::Receiver<Outbound> {
        self.sender.subscribe()
    }
}

/// Room registry: maps room ids to their channels.
///
/// Owned by the server and handed around explicitly — there is no
/// process-wide singleton. Rooms are created implicitly by the first
/// join and removed once their last member leaves.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<Uuid, Arc<RoomChannel>>>,
    default_capacity: usize,
}

impl RoomRegistry {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Get or create the channel for a room.
    pub async fn get_or_create(&self, room_id: Uuid) -> Arc<RoomChannel> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(&room_id) {
                return room.clone();
            }
        }

        // Slow path: write lock to create
        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(&room_id) {
            return room.clone();
        }

        let room = Arc::new(RoomChannel::new(self.default_capacity));
        rooms.insert(room_id, room.clone());
        room
    }

    /// Look up a room without creating it.
    pub async fn get(&self, room_id: &Uuid) -> Option<Arc<RoomChannel>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    /// Remove a room if it has no members left.
    pub async fn remove_if_empty(&self, room_id: &Uuid) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(room_id) {
            if room.member_count().await == 0 {
                rooms.remove(room_id);
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<Uuid> {
        self.rooms.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageKind;
    use crate::protocol::Message;

    fn participant(name: &str, role: ParticipantRole) -> Participant {
        Participant {
            conn_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            name: name.to_owned(),
            role,
        }
    }

    #[tokio::test]
    async fn test_add_remove_member() {
        let channel = RoomChannel::new(16);
        let alice = participant("Alice", ParticipantRole::Learner);
        let conn = alice.conn_id;

        let _rx = channel.add_member(alice).await;
        assert_eq!(channel.member_count().await, 1);
        assert!(channel.has_member(&conn).await);

        let removed = channel.remove_member(&conn).await;
        assert_eq!(removed.map(|p| p.conn_id), Some(conn));
        assert_eq!(channel.member_count().await, 0);
    }

    #[tokio::test]
    async fn test_fan_out_reaches_everyone_but_sender() {
        let channel = RoomChannel::new(16);
        let room_id = Uuid::new_v4();

        let alice = participant("Alice", ParticipantRole::Learner);
        let bob = participant("Bob", ParticipantRole::Mentor);
        let (a_conn, b_conn) = (alice.conn_id, bob.conn_id);

        let mut a_rx = channel.add_member(alice).await;
        let mut b_rx = channel.add_member(bob).await;

        let stored = Message {
            id: Uuid::new_v4(),
            room_id,
            sender_id: Uuid::new_v4(),
            kind: MessageKind::Text,
            content: "hi".to_owned(),
            created_at: 1,
        };
        let reached = channel
            .publish(a_conn, &ServerEvent::ReceiveMessage { message: stored })
            .unwrap();
        assert_eq!(reached, 2);

        // Bob's receiver delivers the frame
        let out = b_rx.recv().await.unwrap();
        assert!(out.is_for(b_conn));
        assert!(out.frame.contains(r#""content":"hi""#));

        // Alice's receiver sees her own frame and filters it out
        let out = a_rx.recv().await.unwrap();
        assert!(!out.is_for(a_conn));
    }

    #[tokio::test]
    async fn test_publish_raw_shares_one_encoding() {
        let channel = RoomChannel::new(16);
        let alice = participant("Alice", ParticipantRole::Learner);
        let mut rx = channel.add_member(alice).await;

        let frame = Arc::new(r#"{"event":"typing","roomId":"x"}"#.to_owned());
        let count = channel.publish_raw(Uuid::new_v4(), frame.clone());
        assert_eq!(count, 1);

        let out = rx.recv().await.unwrap();
        assert!(Arc::ptr_eq(&out.frame, &frame));
    }

    #[tokio::test]
    async fn test_channel_stats() {
        let channel = RoomChannel::new(16);
        let alice = participant("Alice", ParticipantRole::Learner);
        let origin = alice.conn_id;
        let _rx = channel.add_member(alice).await;

        let event = ServerEvent::Typing { room_id: Uuid::new_v4() };
        channel.publish(origin, &event).unwrap();
        channel.publish(origin, &event).unwrap();

        let stats = channel.stats().await;
        assert_eq!(stats.frames_sent, 2);
        assert_eq!(stats.active_members, 1);
    }

    #[tokio::test]
    async fn test_registry_get_or_create_idempotent() {
        let registry = RoomRegistry::new(16);
        let room_id = Uuid::new_v4();

        let first = registry.get_or_create(room_id).await;
        let second = registry.get_or_create(room_id).await;

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_registry_isolates_rooms() {
        let registry = RoomRegistry::new(16);

        let r1 = Uuid::new_v4();
        let r2 = Uuid::new_v4();
        let room1 = registry.get_or_create(r1).await;
        let _room2 = registry.get_or_create(r2).await;

        let alice = participant("Alice", ParticipantRole::Learner);
        let origin = alice.conn_id;
        let _rx = room1.add_member(alice).await;

        // Subscriber on room2 sees nothing from room1
        let room2 = registry.get(&r2).await.unwrap();
        let mut rx2 = room2.subscribe();
        room1
            .publish(origin, &ServerEvent::Typing { room_id: r1 })
            .unwrap();
        assert!(rx2.try_recv().is_err());

        assert_eq!(registry.room_count().await, 2);
        let rooms = registry.active_rooms().await;
        assert!(rooms.contains(&r1) && rooms.contains(&r2));
    }

    #[tokio::test]
    async fn test_registry_removes_only_empty_rooms() {
        let registry = RoomRegistry::new(16);
        let room_id = Uuid::new_v4();

        let room = registry.get_or_create(room_id).await;
        let alice = participant("Alice", ParticipantRole::Learner);
        let conn = alice.conn_id;
        let _rx = room.add_member(alice).await;

        assert!(!registry.remove_if_empty(&room_id).await);
        assert_eq!(registry.room_count().await, 1);

        room.remove_member(&conn).await;
        assert!(registry.remove_if_empty(&room_id).await);
        assert_eq!(registry.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_room_lookup() {
        let registry = RoomRegistry::new(16);
        assert!(registry.get(&Uuid::new_v4()).await.is_none());
        assert!(!registry.remove_if_empty(&Uuid::new_v4()).await);
    }
}
