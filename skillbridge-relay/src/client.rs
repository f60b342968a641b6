//! WebSocket client for connecting to the relay server.
//!
//! Provides:
//! - Connection lifecycle (connect, join, disconnect)
//! - Message send with an outbox for disconnected sends
//! - Typing indicator and WebRTC signaling emission
//! - A [`ChatEvent`] stream for the UI layer
//!
//! Typing indicators and WebRTC signaling are fire-and-forget: while
//! disconnected they are silently dropped, never queued. Chat messages
//! are queued in the outbox and replayed on the next connect.

use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use futures_util::StreamExt;
use serde_json::Value;
use uuid::Uuid;

use crate::protocol::{
    ClientEvent, FileRef, Message, MessageKind, ParticipantRole, ProtocolError, ServerEvent,
};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events surfaced to the application.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    /// Connection established and the room joined
    Connected,
    /// Connection lost
    Disconnected,
    /// Room history, delivered once after joining
    History {
        messages: Vec<Message>,
        /// The persistence gateway was unreachable; treat as "history
        /// unavailable", not as an empty room
        unavailable: bool,
    },
    /// A message from another participant
    MessageReceived(Message),
    /// The other side started typing
    PeerTyping,
    /// The other side stopped typing
    PeerStoppedTyping,
    /// Another connection entered the room
    PeerJoined {
        user_id: Uuid,
        name: String,
        role: ParticipantRole,
    },
    /// A connection left the room
    PeerLeft { user_id: Uuid },
    /// WebRTC negotiation payloads, opaque to this layer
    OfferReceived(Value),
    AnswerReceived(Value),
    CandidateReceived(Value),
    /// The share/call ended (explicitly or through the peer's disconnect)
    ShareStopped,
    /// The server could not persist our message
    MessageRejected { reason: String },
    /// The server refused our join
    JoinRejected { reason: String },
}

/// Queued chat message awaiting reconnection.
#[derive(Debug, Clone)]
struct QueuedMessage {
    kind: MessageKind,
    content: String,
}

/// Outbox for messages composed while disconnected.
///
/// Drained in order on reconnection; bounded so a long outage cannot
/// grow memory without limit.
pub struct Outbox {
    queue: VecDeque<QueuedMessage>,
    max_size: usize,
}

impl Outbox {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(256)),
            max_size,
        }
    }

    /// Queue a message for later replay. Returns false when full.
    fn enqueue(&mut self, kind: MessageKind, content: String) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(QueuedMessage { kind, content });
        true
    }

    fn drain(&mut self) -> Vec<QueuedMessage> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|m| m.content.len()).sum()
    }
}

/// The relay client.
///
/// Manages one WebSocket connection to the relay server, joined to one
/// room, emitting [`ChatEvent`]s for the UI to render.
pub struct RelayClient {
    /// Our identity
    user_id: Uuid,
    name: String,
    role: ParticipantRole,

    /// Room we're chatting in
    room_id: Uuid,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Outbox for disconnected sends
    outbox: Arc<Mutex<Outbox>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<String>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<ChatEvent>>,

    /// Event sender (held by connection tasks)
    event_tx: mpsc::Sender<ChatEvent>,

    /// Server URL
    server_url: String,
}

impl RelayClient {
    /// Create a new relay client for one room.
    pub fn new(
        user_id: Uuid,
        name: impl Into<String>,
        role: ParticipantRole,
        room_id: Uuid,
        server_url: impl Into<String>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            user_id,
            name: name.into(),
            role,
            room_id,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outbox: Arc::new(Mutex::new(Outbox::new(1_000))),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            server_url: server_url.into(),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ChatEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server and join the room.
    ///
    /// Spawns background tasks for reading/writing WebSocket frames.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_result = tokio_tungstenite::connect_async(&self.server_url).await;

        match ws_result {
            Ok((ws_stream, _)) => {
                let (ws_writer, mut ws_reader) = ws_stream.split();

                // Outgoing frame channel
                let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
                self.outgoing_tx = Some(out_tx);

                // Writer task: forward outgoing channel to WebSocket
                let ws_writer = Arc::new(Mutex::new(ws_writer));
                let writer = ws_writer.clone();
                tokio::spawn(async move {
                    while let Some(frame) = out_rx.recv().await {
                        let mut w = writer.lock().await;
                        use futures_util::SinkExt;
                        if w.send(tokio_tungstenite::tungstenite::Message::Text(frame.into()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                });

                // Join the room
                let join = ClientEvent::JoinRoom {
                    room_id: self.room_id,
                    user_id: self.user_id,
                    name: self.name.clone(),
                    role: self.role,
                };
                self.send_event(&join).await?;

                *self.state.write().await = ConnectionState::Connected;
                let _ = self.event_tx.send(ChatEvent::Connected).await;

                // Replay outbox
                {
                    let mut outbox = self.outbox.lock().await;
                    let queued = outbox.drain();
                    if !queued.is_empty() {
                        log::info!("Replaying {} queued messages", queued.len());
                        for item in queued {
                            let event = ClientEvent::SendMessage {
                                room_id: self.room_id,
                                user_id: self.user_id,
                                kind: item.kind,
                                message: item.content,
                            };
                            if let Ok(encoded) = event.encode() {
                                if let Some(ref tx) = self.outgoing_tx {
                                    let _ = tx.send(encoded).await;
                                }
                            }
                        }
                    }
                }

                // Reader task: map server frames to chat events
                let event_tx = self.event_tx.clone();
                let state = self.state.clone();
                tokio::spawn(async move {
                    while let Some(msg) = ws_reader.next().await {
                        match msg {
                            Ok(tokio_tungstenite::tungstenite::Message::Text(text)) => {
                                let server_event = match ServerEvent::decode(text.as_str()) {
                                    Ok(event) => event,
                                    Err(e) => {
                                        log::warn!("Dropping malformed server frame: {e}");
                                        continue;
                                    }
                                };
                                if let Some(event) = map_server_event(server_event) {
                                    let _ = event_tx.send(event).await;
                                }
                            }
                            Ok(tokio_tungstenite::tungstenite::Message::Close(_)) | Err(_) => {
                                break;
                            }
                            _ => {}
                        }
                    }

                    // Connection lost
                    *state.write().await = ConnectionState::Disconnected;
                    let _ = event_tx.send(ChatEvent::Disconnected).await;
                });

                Ok(())
            }
            Err(_e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                Err(ProtocolError::ConnectionClosed)
            }
        }
    }

    /// Send a chat message.
    ///
    /// While disconnected, the message is queued in the outbox and
    /// replayed on the next connect.
    pub async fn send_message(
        &self,
        kind: MessageKind,
        content: impl Into<String>,
    ) -> Result<(), ProtocolError> {
        let content = content.into();
        if content.trim().is_empty() {
            return Err(ProtocolError::EmptyContent);
        }

        let state = *self.state.read().await;
        if state != ConnectionState::Connected {
            let mut outbox = self.outbox.lock().await;
            if !outbox.enqueue(kind, content) {
                return Err(ProtocolError::ConnectionClosed);
            }
            return Ok(());
        }

        let event = ClientEvent::SendMessage {
            room_id: self.room_id,
            user_id: self.user_id,
            kind,
            message: content,
        };
        self.send_event(&event).await
    }

    /// Send a file or image message using the `filename::url` convention.
    pub async fn send_file(
        &self,
        kind: MessageKind,
        file: &FileRef,
    ) -> Result<(), ProtocolError> {
        let content = FileRef::compose(&file.name, &file.url)?;
        self.send_message(kind, content).await
    }

    /// Emit a typing indicator. Silently dropped while disconnected.
    pub async fn send_typing(&self) -> Result<(), ProtocolError> {
        self.send_ephemeral(&ClientEvent::Typing { room_id: self.room_id })
            .await
    }

    /// Emit a stop-typing indicator. Silently dropped while disconnected.
    pub async fn send_stop_typing(&self) -> Result<(), ProtocolError> {
        self.send_ephemeral(&ClientEvent::StopTyping { room_id: self.room_id })
            .await
    }

    /// Relay a WebRTC offer. Fire-and-forget.
    pub async fn send_offer(&self, offer: Value) -> Result<(), ProtocolError> {
        self.send_ephemeral(&ClientEvent::ScreenOffer { room_id: self.room_id, offer })
            .await
    }

    /// Relay a WebRTC answer. Fire-and-forget.
    pub async fn send_answer(&self, answer: Value) -> Result<(), ProtocolError> {
        self.send_ephemeral(&ClientEvent::ScreenAnswer { room_id: self.room_id, answer })
            .await
    }

    /// Relay an ICE candidate. Fire-and-forget.
    pub async fn send_candidate(&self, candidate: Value) -> Result<(), ProtocolError> {
        self.send_ephemeral(&ClientEvent::IceCandidate { room_id: self.room_id, candidate })
            .await
    }

    /// Signal the end of a share/call.
    pub async fn send_screen_stop(&self) -> Result<(), ProtocolError> {
        self.send_ephemeral(&ClientEvent::ScreenStop { room_id: self.room_id })
            .await
    }

    /// Build the optimistic local echo for a message being sent.
    pub fn preview(&self, kind: MessageKind, content: impl Into<String>) -> Message {
        Message::local_preview(self.room_id, self.user_id, kind, content)
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> ParticipantRole {
        self.role
    }

    pub fn room_id(&self) -> Uuid {
        self.room_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Number of messages waiting in the outbox.
    pub async fn outbox_len(&self) -> usize {
        self.outbox.lock().await.len()
    }

    /// Encode and hand a frame to the writer task.
    async fn send_event(&self, event: &ClientEvent) -> Result<(), ProtocolError> {
        let encoded = event.encode()?;
        if let Some(ref tx) = self.outgoing_tx {
            tx.send(encoded)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed)?;
        }
        Ok(())
    }

    /// Best-effort send: dropped without error while disconnected.
    async fn send_ephemeral(&self, event: &ClientEvent) -> Result<(), ProtocolError> {
        let state = *self.state.read().await;
        if state != ConnectionState::Connected {
            return Ok(());
        }
        self.send_event(event).await
    }
}

/// Translate a server frame into an application event.
fn map_server_event(event: ServerEvent) -> Option<ChatEvent> {
    match event {
        ServerEvent::ChatHistory { messages, unavailable } => {
            Some(ChatEvent::History { messages, unavailable })
        }
        ServerEvent::ReceiveMessage { message } => Some(ChatEvent::MessageReceived(message)),
        ServerEvent::Typing { .. } => Some(ChatEvent::PeerTyping),
        ServerEvent::StopTyping { .. } => Some(ChatEvent::PeerStoppedTyping),
        ServerEvent::ScreenOffer { offer, .. } => Some(ChatEvent::OfferReceived(offer)),
        ServerEvent::ScreenAnswer { answer, .. } => Some(ChatEvent::AnswerReceived(answer)),
        ServerEvent::IceCandidate { candidate, .. } => Some(ChatEvent::CandidateReceived(candidate)),
        ServerEvent::ScreenStop { .. } => Some(ChatEvent::ShareStopped),
        ServerEvent::PeerJoined { user_id, name, role, .. } => {
            Some(ChatEvent::PeerJoined { user_id, name, role })
        }
        ServerEvent::PeerLeft { user_id, .. } => Some(ChatEvent::PeerLeft { user_id }),
        ServerEvent::MessageRejected { reason, .. } => {
            Some(ChatEvent::MessageRejected { reason })
        }
        ServerEvent::JoinRejected { reason, .. } => Some(ChatEvent::JoinRejected { reason }),
    }
}
