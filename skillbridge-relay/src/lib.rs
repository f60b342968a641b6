//! # skillbridge-relay — Real-time chat & signaling relay for SkillBridge
//!
//! Connects a learner and a mentor in a per-session chat room with
//! persisted history, typing indicators, and blind WebRTC signaling for
//! screen sharing and calls.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ RelayClient │ ◄─────────────────► │ RelayServer │
//! │ (per user)  │     JSON events     │ (central)   │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐
//! │ Presence    │                     │ RoomChannel │
//! │ (typing,    │                     │ (fan-out,   │
//! │  roster)    │                     │  N-1 peers) │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                    ┌───────┴───────┐
//!                                    │ MessageStore  │
//!                                    │ (append-only  │
//!                                    │  history log) │
//!                                    └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire events (closed tagged unions per direction)
//! - [`registry`] — Room membership and broadcast fan-out
//! - [`signal`] — Call/screen-share teardown coordination
//! - [`store`] — Persistence gateway (RocksDB or in-memory)
//! - [`server`] — The relay server
//! - [`client`] — The relay client
//! - [`presence`] — Client-side typing indicator and roster
//!
//! ## Guarantees
//!
//! - A message sent by one connection reaches every other connection in
//!   its room, never the sender (the client echoes optimistically).
//! - Per-room history replays in insertion order and is stable across
//!   repeated reads.
//! - Typing and signaling events are ephemeral: best-effort, unordered
//!   relative to chat, never persisted.
//! - A mid-call disconnect delivers a `screen-stop` to the counterpart
//!   in the same cleanup pass — no indefinite hang.

pub mod protocol;
pub mod registry;
pub mod signal;
pub mod store;
pub mod server;
pub mod client;
pub mod presence;

// Re-exports for convenience
pub use protocol::{
    ClientEvent, FileRef, Message, MessageKind, ParticipantRole, ProtocolError, ServerEvent,
    FILE_REF_DELIMITER,
};
pub use registry::{ChannelStats, Outbound, Participant, RoomChannel, RoomRegistry};
pub use signal::{CallCoordinator, CallSummary, NegotiationPhase};
pub use store::{
    MemoryMessageStore, MessageStore, RocksMessageStore, RoomRecord, StoreConfig, StoreError,
};
pub use server::{RelayServer, ServerConfig, ServerStats};
pub use client::{ChatEvent, ConnectionState, Outbox, RelayClient};
pub use presence::{PresenceTracker, RosterEntry, TYPING_SEND_INTERVAL, TYPING_TIMEOUT};
