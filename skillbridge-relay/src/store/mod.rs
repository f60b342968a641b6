//! Persistence gateway for rooms and the append-only message log.
//!
//! ```text
//! ┌─────────────┐    append/history    ┌──────────────────┐
//! │ RelayServer │ ───────────────────► │  MessageStore    │
//! │ (in-memory) │                      │  (trait object)  │
//! └─────────────┘                      └────────┬─────────┘
//!                                               │
//!                              ┌────────────────┴───────────────┐
//!                              ▼                                ▼
//!                   ┌────────────────────┐          ┌────────────────────┐
//!                   │ MemoryMessageStore │          │ RocksMessageStore  │
//!                   │ (tests, default)   │          │ CF "rooms"         │
//!                   └────────────────────┘          │ CF "messages"      │
//!                                                   │ CF "metadata"      │
//!                                                   └────────────────────┘
//! ```
//!
//! The log is append-only: messages are never updated or deleted, and
//! `history` replays a room in insertion order (ascending creation
//! time), stable under repeated queries.

pub mod memory;
pub mod rocks;

pub use memory::MemoryMessageStore;
pub use rocks::{RocksMessageStore, StoreConfig};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::{Message, MessageKind};

/// A chat room, one-to-one with a confirmed mentorship session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomRecord {
    pub room_id: Uuid,
    /// The accepted session this room was provisioned for.
    pub session_id: Uuid,
    pub learner_id: Uuid,
    pub mentor_id: Uuid,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// Backend failure (database, lock)
    DatabaseError(String),
    /// Room not found
    NotFound(Uuid),
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Compression error
    CompressionError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(id) => write!(f, "Room not found: {id}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Durable store for rooms and chat messages.
///
/// Injected into the server as `Arc<dyn MessageStore>` so a different
/// backing store can be swapped in without touching relay logic.
/// Methods are synchronous; callers hold no locks across them.
pub trait MessageStore: Send + Sync {
    /// Idempotent get-or-create: at most one room ever exists per
    /// underlying session. Repeat calls return the original record.
    fn ensure_room(
        &self,
        session_id: Uuid,
        learner_id: Uuid,
        mentor_id: Uuid,
    ) -> Result<RoomRecord, StoreError>;

    /// Append one message; returns the persisted record with the
    /// server-assigned id and creation timestamp.
    fn append(
        &self,
        room_id: Uuid,
        sender_id: Uuid,
        kind: MessageKind,
        content: &str,
    ) -> Result<Message, StoreError>;

    /// Full history of a room, ascending by creation time. A room with
    /// no messages (including one never written to) yields an empty
    /// vec, not an error.
    fn history(&self, room_id: Uuid) -> Result<Vec<Message>, StoreError>;

    /// Number of messages persisted for a room.
    fn message_count(&self, room_id: Uuid) -> Result<u64, StoreError>;
}
