//! WebSocket relay server with room-based event routing.
//!
//! Architecture:
//! ```text
//! Learner ──┐
//!            ├── Room (room_id) ── RoomChannel (fan-out)
//! Mentor  ──┘                         │
//!                                     ├── MessageStore
//!                                     │     ├── rooms
//!                                     │     └── message log
//!                                     │
//!                                     └── CallCoordinator
//!                                           (screen/call teardown tag)
//! ```
//!
//! Each connection runs in its own task: inbound frames are decoded at
//! the boundary (non-conforming ones are dropped and logged), chat
//! messages are persisted before they fan out, typing and WebRTC
//! signaling pass straight through. A connection belongs to at most one
//! room; joining another room leaves the previous one first.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use uuid::Uuid;

use crate::protocol::{ClientEvent, ServerEvent};
use crate::registry::{Participant, RoomChannel, RoomRegistry};
use crate::signal::CallCoordinator;
use crate::store::{MemoryMessageStore, MessageStore, RocksMessageStore, StoreConfig};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum connections per room — two participants plus slack for
    /// reconnects and extra tabs
    pub max_members_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_members_per_room: 8,
            broadcast_capacity: 256,
            storage_path: None,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_events: u64,
    pub total_bytes: u64,
    pub events_dropped: u64,
    pub messages_persisted: u64,
    pub history_fetches: u64,
    pub signals_relayed: u64,
    pub active_rooms: usize,
}

/// The connection's current room, if it has joined one.
struct Membership {
    room_id: Uuid,
    channel: Arc<RoomChannel>,
}

/// The relay server.
pub struct RelayServer {
    config: ServerConfig,
    /// Room registry: room_id → membership + fan-out channel
    registry: Arc<RoomRegistry>,
    /// Per-room call/screen-share teardown state
    calls: Arc<CallCoordinator>,
    /// Persistence gateway
    store: Arc<dyn MessageStore>,
    /// Server-wide statistics
    stats: Arc<RwLock<ServerStats>>,
}

impl RelayServer {
    /// Create a new relay server with the given configuration.
    ///
    /// Opens the RocksDB message store when a storage path is
    /// configured, otherwise runs on the in-memory store.
    pub fn new(config: ServerConfig) -> Self {
        let store: Arc<dyn MessageStore> = match &config.storage_path {
            Some(path) => {
                let store_config = StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                };
                Arc::new(
                    RocksMessageStore::open(store_config)
                        .expect("Failed to open message store"),
                )
            }
            None => Arc::new(MemoryMessageStore::new()),
        };
        Self::with_store(config, store)
    }

    /// Create with an injected persistence gateway.
    pub fn with_store(config: ServerConfig, store: Arc<dyn MessageStore>) -> Self {
        let registry = Arc::new(RoomRegistry::new(config.broadcast_capacity));
        Self {
            registry,
            calls: Arc::new(CallCoordinator::new()),
            store,
            stats: Arc::new(RwLock::new(ServerStats::default())),
            config,
        }
    }

    /// Create with default configuration (in-memory, no persistence).
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Create with persistence enabled at the given path.
    pub fn with_storage(bind_addr: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        let config = ServerConfig {
            bind_addr: bind_addr.into(),
            storage_path: Some(path.into()),
            ..ServerConfig::default()
        };
        Self::new(config)
    }

    /// Start listening for WebSocket connections.
    ///
    /// This runs the server event loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let registry = self.registry.clone();
            let calls = self.calls.clone();
            let store = self.store.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, registry, calls, store, stats, config)
                        .await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: Arc<RoomRegistry>,
        calls: Arc<CallCoordinator>,
        store: Arc<dyn MessageStore>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let conn_id = Uuid::new_v4();
        log::info!("WebSocket connection {conn_id} established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // State for this connection
        let mut membership: Option<Membership> = None;
        let mut room_rx: Option<tokio::sync::broadcast::Receiver<crate::registry::Outbound>> = None;

        loop {
            tokio::select! {
                // Incoming WebSocket frame
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(WsMessage::Text(text))) => {
                            let event = match ClientEvent::decode(text.as_str()) {
                                Ok(event) => event,
                                Err(e) => {
                                    log::warn!("Dropping malformed frame from {conn_id}: {e}");
                                    stats.write().await.events_dropped += 1;
                                    continue;
                                }
                            };

                            {
                                let mut s = stats.write().await;
                                s.total_events += 1;
                                s.total_bytes += text.len() as u64;
                            }

                            match event {
                                ClientEvent::JoinRoom { room_id, user_id, name, role } => {
                                    // Single-room membership: leave the
                                    // previous room before joining another
                                    if let Some(prev) = membership.take() {
                                        room_rx = None;
                                        depart_room(&prev, conn_id, &registry, &calls).await;
                                    }

                                    let channel = registry.get_or_create(room_id).await;
                                    if channel.member_count().await >= config.max_members_per_room {
                                        log::warn!(
                                            "Join refused for {conn_id}: room {room_id} is full"
                                        );
                                        let refusal = ServerEvent::JoinRejected {
                                            room_id,
                                            reason: "room is full".to_owned(),
                                        };
                                        ws_sender.send(WsMessage::Text(refusal.encode()?.into())).await?;
                                        continue;
                                    }

                                    let participant = Participant {
                                        conn_id,
                                        user_id,
                                        name: name.clone(),
                                        role,
                                    };
                                    let rx = channel.add_member(participant).await;
                                    room_rx = Some(rx);

                                    let _ = channel.publish(
                                        conn_id,
                                        &ServerEvent::PeerJoined { room_id, user_id, name: name.clone(), role },
                                    );

                                    // History goes to the joining connection
                                    // only; a store failure degrades to an
                                    // empty, flagged history — the join holds
                                    let history = match store.history(room_id) {
                                        Ok(messages) => {
                                            ServerEvent::ChatHistory { messages, unavailable: false }
                                        }
                                        Err(e) => {
                                            log::error!("History fetch failed for room {room_id}: {e}");
                                            ServerEvent::ChatHistory {
                                                messages: Vec::new(),
                                                unavailable: true,
                                            }
                                        }
                                    };
                                    ws_sender.send(WsMessage::Text(history.encode()?.into())).await?;

                                    membership = Some(Membership { room_id, channel });

                                    let room_count = registry.room_count().await;
                                    {
                                        let mut s = stats.write().await;
                                        s.history_fetches += 1;
                                        s.active_rooms = room_count;
                                    }

                                    log::info!("{name} ({user_id}) joined room {room_id} as {conn_id}");
                                }

                                ClientEvent::SendMessage { room_id, user_id, kind, message } => {
                                    let Some(m) = membership_for(&membership, room_id, conn_id) else {
                                        stats.write().await.events_dropped += 1;
                                        continue;
                                    };

                                    match store.append(room_id, user_id, kind, &message) {
                                        Ok(stored) => {
                                            stats.write().await.messages_persisted += 1;
                                            // Fan out to the room minus the
                                            // sender — no relay echo
                                            let _ = m.channel.publish(
                                                conn_id,
                                                &ServerEvent::ReceiveMessage { message: stored },
                                            );
                                        }
                                        Err(e) => {
                                            log::error!("Append failed for room {room_id}: {e}");
                                            let rejected = ServerEvent::MessageRejected {
                                                room_id,
                                                reason: e.to_string(),
                                            };
                                            ws_sender
                                                .send(WsMessage::Text(rejected.encode()?.into()))
                                                .await?;
                                        }
                                    }
                                }

                                ClientEvent::Typing { room_id } => {
                                    if let Some(m) = membership_for(&membership, room_id, conn_id) {
                                        let _ = m.channel.publish(conn_id, &ServerEvent::Typing { room_id });
                                    }
                                }

                                ClientEvent::StopTyping { room_id } => {
                                    if let Some(m) = membership_for(&membership, room_id, conn_id) {
                                        let _ = m.channel.publish(conn_id, &ServerEvent::StopTyping { room_id });
                                    }
                                }

                                ClientEvent::ScreenOffer { room_id, offer } => {
                                    if let Some(m) = membership_for(&membership, room_id, conn_id) {
                                        calls.offer_opened(room_id, conn_id).await;
                                        let _ = m.channel.publish(
                                            conn_id,
                                            &ServerEvent::ScreenOffer { room_id, offer },
                                        );
                                        stats.write().await.signals_relayed += 1;
                                    }
                                }

                                ClientEvent::ScreenAnswer { room_id, answer } => {
                                    if let Some(m) = membership_for(&membership, room_id, conn_id) {
                                        calls.answer_received(room_id, conn_id).await;
                                        let _ = m.channel.publish(
                                            conn_id,
                                            &ServerEvent::ScreenAnswer { room_id, answer },
                                        );
                                        stats.write().await.signals_relayed += 1;
                                    }
                                }

                                ClientEvent::IceCandidate { room_id, candidate } => {
                                    // Relayed unconditionally, whatever the
                                    // negotiation phase
                                    if let Some(m) = membership_for(&membership, room_id, conn_id) {
                                        calls.candidate_relayed(room_id).await;
                                        let _ = m.channel.publish(
                                            conn_id,
                                            &ServerEvent::IceCandidate { room_id, candidate },
                                        );
                                        stats.write().await.signals_relayed += 1;
                                    }
                                }

                                ClientEvent::ScreenStop { room_id } => {
                                    if let Some(m) = membership_for(&membership, room_id, conn_id) {
                                        if let Some(summary) = calls.ended(room_id).await {
                                            log::info!(
                                                "Share ended in room {room_id} after {:?} ({} candidates)",
                                                summary.duration,
                                                summary.candidates_relayed
                                            );
                                        }
                                        let _ = m.channel.publish(conn_id, &ServerEvent::ScreenStop { room_id });
                                        stats.write().await.signals_relayed += 1;
                                    }
                                }
                            }
                        }

                        Some(Ok(WsMessage::Close(_))) | None => {
                            log::info!("Connection {conn_id} closed from {addr}");
                            break;
                        }

                        Some(Ok(WsMessage::Ping(data))) => {
                            ws_sender.send(WsMessage::Pong(data)).await?;
                        }

                        Some(Ok(WsMessage::Binary(_))) => {
                            log::debug!("Ignoring binary frame from {conn_id}");
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Outgoing room broadcast
                out = async {
                    if let Some(ref mut rx) = room_rx {
                        rx.recv().await
                    } else {
                        // Not in a room yet — wait forever
                        std::future::pending().await
                    }
                } => {
                    match out {
                        Ok(out) => {
                            // Don't echo back to the originator
                            if !out.is_for(conn_id) {
                                continue;
                            }
                            ws_sender.send(WsMessage::Text(out.frame.as_str().into())).await?;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Connection {conn_id} lagged by {n} frames");
                        }
                        Err(_) => break,
                    }
                }
            }
        }

        // Cleanup: prune membership, tear down any in-flight negotiation
        if let Some(m) = membership {
            depart_room(&m, conn_id, &registry, &calls).await;
        }

        let room_count = registry.room_count().await;
        {
            let mut s = stats.write().await;
            s.active_connections -= 1;
            s.active_rooms = room_count;
        }

        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Get the room registry.
    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    /// Get the call coordinator.
    pub fn calls(&self) -> &Arc<CallCoordinator> {
        &self.calls
    }

    /// Get the persistence gateway.
    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }
}

/// Resolve the membership a room-scoped event must match.
///
/// Events naming a room the connection has not joined are dropped — the
/// relay never routes on a client-supplied room id alone.
fn membership_for<'a>(
    membership: &'a Option<Membership>,
    room_id: Uuid,
    conn_id: Uuid,
) -> Option<&'a Membership> {
    match membership {
        Some(m) if m.room_id == room_id => Some(m),
        Some(m) => {
            log::warn!(
                "Dropping event from {conn_id} for room {room_id} (member of {})",
                m.room_id
            );
            None
        }
        None => {
            log::warn!("Dropping event from {conn_id} for room {room_id} (not joined)");
            None
        }
    }
}

/// Leave a room: negotiation teardown, membership pruning, peer-left
/// broadcast, empty-room removal. Runs on disconnect and on
/// leave-on-join.
async fn depart_room(
    membership: &Membership,
    conn_id: Uuid,
    registry: &RoomRegistry,
    calls: &CallCoordinator,
) {
    let room_id = membership.room_id;

    // The counterpart learns about a mid-call disconnect in the same
    // cleanup pass as the disconnect itself
    if calls.connection_dropped(room_id, conn_id).await {
        let _ = membership
            .channel
            .publish(conn_id, &ServerEvent::ScreenStop { room_id });
    }

    if let Some(left) = membership.channel.remove_member(&conn_id).await {
        let _ = membership.channel.publish(
            conn_id,
            &ServerEvent::PeerLeft { room_id, user_id: left.user_id },
        );
    }

    if registry.remove_if_empty(&room_id).await {
        log::info!("Room {room_id} removed (empty)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ParticipantRole;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.max_members_per_room, 8);
        assert_eq!(config.broadcast_capacity, 256);
        assert!(config.storage_path.is_none());
    }

    #[test]
    fn test_server_creation() {
        let server = RelayServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
    }

    #[test]
    fn test_server_custom_config() {
        let config = ServerConfig {
            bind_addr: "0.0.0.0:8080".to_string(),
            max_members_per_room: 2,
            broadcast_capacity: 512,
            storage_path: None,
        };
        let server = RelayServer::new(config);
        assert_eq!(server.bind_addr(), "0.0.0.0:8080");
    }

    #[test]
    fn test_server_with_storage() {
        let dir = tempfile::tempdir().unwrap();
        let server = RelayServer::with_storage("127.0.0.1:0", dir.path().join("db"));
        assert!(server.store().history(Uuid::new_v4()).unwrap().is_empty());
    }

    #[test]
    fn test_server_with_injected_store() {
        let store = Arc::new(MemoryMessageStore::new());
        let server = RelayServer::with_store(ServerConfig::default(), store.clone());

        let room = Uuid::new_v4();
        store
            .append(room, Uuid::new_v4(), crate::protocol::MessageKind::Text, "seeded")
            .unwrap();
        assert_eq!(server.store().history(room).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = RelayServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_events, 0);
        assert_eq!(stats.messages_persisted, 0);
        assert_eq!(stats.active_rooms, 0);
    }

    #[tokio::test]
    async fn test_depart_room_mid_call_signals_counterpart() {
        let registry = RoomRegistry::new(16);
        let calls = CallCoordinator::new();
        let room_id = Uuid::new_v4();

        let channel = registry.get_or_create(room_id).await;
        let learner = Participant {
            conn_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            name: "Kenji".to_owned(),
            role: ParticipantRole::Learner,
        };
        let mentor = Participant {
            conn_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            name: "Aiko".to_owned(),
            role: ParticipantRole::Mentor,
        };
        let (l_conn, l_user) = (learner.conn_id, learner.user_id);
        let m_conn = mentor.conn_id;

        let _l_rx = channel.add_member(learner).await;
        let mut m_rx = channel.add_member(mentor).await;

        // Learner is sharing their screen with the mentor
        calls.offer_opened(room_id, l_conn).await;
        calls.answer_received(room_id, m_conn).await;

        // Learner disconnects mid-call
        let membership = Membership { room_id, channel: channel.clone() };
        depart_room(&membership, l_conn, &registry, &calls).await;

        // Mentor sees the teardown, then the departure
        let stop = m_rx.recv().await.unwrap();
        assert!(stop.is_for(m_conn));
        assert!(stop.frame.contains(r#""event":"screen-stop""#));

        let left = m_rx.recv().await.unwrap();
        assert!(left.frame.contains(r#""event":"peer-left""#));
        assert!(left.frame.contains(&l_user.to_string()));

        // Negotiation is gone; mentor still holds the room open
        assert_eq!(calls.active_calls().await, 0);
        assert_eq!(channel.member_count().await, 1);
        assert_eq!(registry.room_count().await, 1);

        // Mentor leaves too — room is removed
        let membership = Membership { room_id, channel };
        depart_room(&membership, m_conn, &registry, &calls).await;
        assert_eq!(registry.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_depart_room_without_call_or_membership() {
        let registry = RoomRegistry::new(16);
        let calls = CallCoordinator::new();
        let room_id = Uuid::new_v4();
        let channel = registry.get_or_create(room_id).await;

        // A connection that never finished joining departs harmlessly
        let membership = Membership { room_id, channel };
        depart_room(&membership, Uuid::new_v4(), &registry, &calls).await;
        assert_eq!(registry.room_count().await, 0);
    }
}
