//! In-memory message store.
//!
//! Backs the server when no storage path is configured, and every test
//! that doesn't need durability. Same ordering contract as the RocksDB
//! store: append order is replay order.

use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::protocol::{unix_millis, Message, MessageKind};

use super::{MessageStore, RoomRecord, StoreError};

#[derive(Default)]
pub struct MemoryMessageStore {
    /// Rooms keyed by the session they were provisioned for.
    rooms: Mutex<HashMap<Uuid, RoomRecord>>,
    /// Message log per room, in insertion order.
    messages: Mutex<HashMap<Uuid, Vec<Message>>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn room_count(&self) -> usize {
        lock_recover(&self.rooms).len()
    }
}

/// Poisoning only happens if a writer panicked mid-operation; the maps
/// are still structurally valid, so recover the guard and keep serving.
fn lock_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MessageStore for MemoryMessageStore {
    fn ensure_room(
        &self,
        session_id: Uuid,
        learner_id: Uuid,
        mentor_id: Uuid,
    ) -> Result<RoomRecord, StoreError> {
        let mut rooms = lock_recover(&self.rooms);
        let record = rooms.entry(session_id).or_insert_with(|| RoomRecord {
            room_id: Uuid::new_v4(),
            session_id,
            learner_id,
            mentor_id,
            created_at: unix_millis(),
        });
        Ok(record.clone())
    }

    fn append(
        &self,
        room_id: Uuid,
        sender_id: Uuid,
        kind: MessageKind,
        content: &str,
    ) -> Result<Message, StoreError> {
        let message = Message {
            id: Uuid::new_v4(),
            room_id,
            sender_id,
            kind,
            content: content.to_owned(),
            created_at: unix_millis(),
        };

        let mut messages = lock_recover(&self.messages);
        messages.entry(room_id).or_default().push(message.clone());
        Ok(message)
    }

    fn history(&self, room_id: Uuid) -> Result<Vec<Message>, StoreError> {
        let messages = lock_recover(&self.messages);
        Ok(messages.get(&room_id).cloned().unwrap_or_default())
    }

    fn message_count(&self, room_id: Uuid) -> Result<u64, StoreError> {
        let messages = lock_recover(&self.messages);
        Ok(messages.get(&room_id).map_or(0, |m| m.len() as u64))
    }
}
