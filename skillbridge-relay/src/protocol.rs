//! JSON wire protocol for the chat/signaling relay.
//!
//! Every frame is a JSON object discriminated by an `"event"` field
//! (kebab-case), payload fields in camelCase:
//! ```text
//! {"event":"send-message","roomId":"…","userId":"…","message":"hi"}
//! ```
//!
//! The event surface is a closed, tagged union per direction: anything
//! that does not decode into [`ClientEvent`] is dropped at the transport
//! boundary and never reaches the relay.
//!
//! WebRTC negotiation payloads (`offer`, `answer`, `candidate`) are
//! carried as raw JSON values — the relay forwards them untouched and
//! never inspects their structure.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::SystemTime;
use uuid::Uuid;

/// Delimiter of the `filename::url` composite used for file and image
/// messages. The first segment is the display name, the second the
/// durable upload URL; the display name must not contain the delimiter.
pub const FILE_REF_DELIMITER: &str = "::";

/// Milliseconds since the Unix epoch.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// What a message carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Plain text
    #[default]
    Text,
    /// `filename::url` file reference
    File,
    /// `filename::url` image reference
    Image,
}

/// Which side of the mentorship a participant is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    Learner,
    Mentor,
}

/// An immutable chat message record.
///
/// `id` and `created_at` are server-assigned at persistence time;
/// history replay is ordered ascending by `created_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub room_id: Uuid,
    pub sender_id: Uuid,
    pub kind: MessageKind,
    pub content: String,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
}

impl Message {
    /// Build a client-local preview of a message that has not been
    /// persisted yet.
    ///
    /// The relay never echoes a message back to its sender; the sender's
    /// UI renders this preview optimistically and the server-assigned
    /// record only ever reaches the other participants.
    pub fn local_preview(room_id: Uuid, sender_id: Uuid, kind: MessageKind, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            room_id,
            sender_id,
            kind,
            content: content.into(),
            created_at: unix_millis(),
        }
    }
}

/// A parsed `filename::url` file reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRef {
    pub name: String,
    pub url: String,
}

impl FileRef {
    /// Split a message content string into display name and URL.
    pub fn parse(content: &str) -> Result<Self, ProtocolError> {
        let (name, url) = content
            .split_once(FILE_REF_DELIMITER)
            .ok_or_else(|| ProtocolError::InvalidFileRef(content.to_owned()))?;
        if name.is_empty() || url.is_empty() {
            return Err(ProtocolError::InvalidFileRef(content.to_owned()));
        }
        Ok(Self {
            name: name.to_owned(),
            url: url.to_owned(),
        })
    }

    /// Compose the wire form. Fails if the display name would collide
    /// with the delimiter.
    pub fn compose(name: &str, url: &str) -> Result<String, ProtocolError> {
        if name.is_empty() || url.is_empty() || name.contains(FILE_REF_DELIMITER) {
            return Err(ProtocolError::InvalidFileRef(format!("{name}{FILE_REF_DELIMITER}{url}")));
        }
        Ok(format!("{name}{FILE_REF_DELIMITER}{url}"))
    }

    /// Whether a content string looks like a file reference.
    pub fn is_file_ref(content: &str) -> bool {
        content.contains(FILE_REF_DELIMITER)
    }
}

/// Events a client sends to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// Enter a room; triggers a `chat-history` push to this connection.
    #[serde(rename_all = "camelCase")]
    JoinRoom {
        room_id: Uuid,
        user_id: Uuid,
        name: String,
        role: ParticipantRole,
    },
    /// Persist a message and fan it out to the rest of the room.
    #[serde(rename_all = "camelCase")]
    SendMessage {
        room_id: Uuid,
        user_id: Uuid,
        #[serde(default)]
        kind: MessageKind,
        message: String,
    },
    /// Typing indicator — relayed, never persisted.
    #[serde(rename_all = "camelCase")]
    Typing { room_id: Uuid },
    #[serde(rename_all = "camelCase")]
    StopTyping { room_id: Uuid },
    /// WebRTC negotiation — opaque to the relay.
    #[serde(rename_all = "camelCase")]
    ScreenOffer { room_id: Uuid, offer: Value },
    #[serde(rename_all = "camelCase")]
    ScreenAnswer { room_id: Uuid, answer: Value },
    #[serde(rename_all = "camelCase")]
    IceCandidate { room_id: Uuid, candidate: Value },
    /// Explicit end of a screen share or call.
    #[serde(rename_all = "camelCase")]
    ScreenStop { room_id: Uuid },
}

impl ClientEvent {
    /// Decode and validate one inbound frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let event: Self = serde_json::from_str(text)
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        event.validate()?;
        Ok(event)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// The room an event is addressed to.
    pub fn room_id(&self) -> Uuid {
        match self {
            ClientEvent::JoinRoom { room_id, .. }
            | ClientEvent::SendMessage { room_id, .. }
            | ClientEvent::Typing { room_id }
            | ClientEvent::StopTyping { room_id }
            | ClientEvent::ScreenOffer { room_id, .. }
            | ClientEvent::ScreenAnswer { room_id, .. }
            | ClientEvent::IceCandidate { room_id, .. }
            | ClientEvent::ScreenStop { room_id } => *room_id,
        }
    }

    fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            ClientEvent::SendMessage { message, .. } if message.trim().is_empty() => {
                Err(ProtocolError::EmptyContent)
            }
            _ => Ok(()),
        }
    }
}

/// Events the relay sends to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// Full room history, delivered once to the joining connection only.
    /// `unavailable` is set when the persistence gateway could not be
    /// reached; the join itself still succeeded.
    #[serde(rename_all = "camelCase")]
    ChatHistory {
        messages: Vec<Message>,
        #[serde(default, skip_serializing_if = "is_false")]
        unavailable: bool,
    },
    /// A persisted message, fanned out to the room minus the sender.
    #[serde(rename_all = "camelCase")]
    ReceiveMessage { message: Message },
    #[serde(rename_all = "camelCase")]
    Typing { room_id: Uuid },
    #[serde(rename_all = "camelCase")]
    StopTyping { room_id: Uuid },
    #[serde(rename_all = "camelCase")]
    ScreenOffer { room_id: Uuid, offer: Value },
    #[serde(rename_all = "camelCase")]
    ScreenAnswer { room_id: Uuid, answer: Value },
    #[serde(rename_all = "camelCase")]
    IceCandidate { room_id: Uuid, candidate: Value },
    /// End of share/call — client-sent or synthesized on a party's
    /// disconnect.
    #[serde(rename_all = "camelCase")]
    ScreenStop { room_id: Uuid },
    #[serde(rename_all = "camelCase")]
    PeerJoined {
        room_id: Uuid,
        user_id: Uuid,
        name: String,
        role: ParticipantRole,
    },
    #[serde(rename_all = "camelCase")]
    PeerLeft { room_id: Uuid, user_id: Uuid },
    /// Persistence failed for a send; reported to the originator only.
    #[serde(rename_all = "camelCase")]
    MessageRejected { room_id: Uuid, reason: String },
    /// Join refused (room at capacity); reported to the originator only.
    #[serde(rename_all = "camelCase")]
    JoinRejected { room_id: Uuid, reason: String },
}

impl ServerEvent {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    /// `send-message` with a blank body.
    EmptyContent,
    /// Malformed `filename::url` composite.
    InvalidFileRef(String),
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::EmptyContent => write!(f, "Empty message content"),
            Self::InvalidFileRef(raw) => write!(f, "Invalid file reference: {raw}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}
