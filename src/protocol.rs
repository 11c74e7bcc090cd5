//! Wire events exchanged over the chat socket.
//!
//! Every frame is a JSON text frame shaped `{ "event": <name>, "data": <payload> }`.
//! Connect and disconnect are WebSocket lifecycle, not frames.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

/// Opaque per-connection identifier (UUID v4 string).
pub type ConnectionId = String;

/// Author used for peer copies when the payload carries none.
pub const ANONYMOUS_AUTHOR: &str = "Anonymous";

// ---------------------------------------------------------------------------
// Envelopes
// ---------------------------------------------------------------------------

/// Client → server frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    JoinRoom(String),
    SendMessage(SendMessage),
}

/// Server → client frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    Welcome(Welcome),
    ReceiveMessage(ChatMessage),
    Error(ErrorPayload),
}

impl ClientEvent {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl ServerEvent {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        ServerEvent::Error(ErrorPayload { code: code.to_string(), message: message.into() })
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Payload of `send_message`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessage {
    pub message: String,
    /// Base64 image, optionally as a `data:<mime>;base64,` URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
}

impl SendMessage {
    pub fn text(message: impl Into<String>) -> Self {
        Self { message: message.into(), ..Self::default() }
    }

    /// Room name with surrounding whitespace removed; blank counts as none.
    pub fn room_name(&self) -> Option<&str> {
        self.room.as_deref().map(str::trim).filter(|r| !r.is_empty())
    }

    pub fn is_blank(&self) -> bool {
        self.message.trim().is_empty() && self.image.is_none()
    }
}

/// Payload of `receive_message`. Immutable once emitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub author: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    /// RFC 3339 UTC, stamped by whoever created the message.
    pub time: String,
}

impl ChatMessage {
    /// Build the relayed copy of an inbound payload under the given author.
    pub fn relayed(payload: &SendMessage, author: &str, time: &str) -> Self {
        Self {
            author: author.to_string(),
            message: payload.message.clone(),
            image: payload.image.clone(),
            room: payload.room_name().map(str::to_string),
            time: time.to_string(),
        }
    }

    /// HH:MM portion of the timestamp, for display.
    pub fn short_time(&self) -> &str {
        self.time.get(11..16).unwrap_or(&self.time)
    }
}

/// Payload of `welcome`, sent once right after the socket opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Welcome {
    pub connection_id: ConnectionId,
    pub broadcast_policy: BroadcastPolicy,
    /// Author label the AI replies with; absent when AI mode is off.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_author: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Broadcast scope
// ---------------------------------------------------------------------------

/// Who receives a relayed message. Fixed at configuration time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BroadcastPolicy {
    #[default]
    RoomExcludingSender,
    RoomIncludingSender,
    SenderOnly,
}

impl std::fmt::Display for BroadcastPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BroadcastPolicy::RoomExcludingSender => write!(f, "room-excluding-sender"),
            BroadcastPolicy::RoomIncludingSender => write!(f, "room-including-sender"),
            BroadcastPolicy::SenderOnly => write!(f, "sender-only"),
        }
    }
}

/// Concrete recipients of one emission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    Sender,
    Room { name: String, include_sender: bool },
}

impl Audience {
    pub fn includes_sender(&self) -> bool {
        match self {
            Audience::Sender => true,
            Audience::Room { include_sender, .. } => *include_sender,
        }
    }
}

impl BroadcastPolicy {
    /// Audience for the relayed copy of a user message.
    ///
    /// A message without a room is a private exchange with the server and is
    /// echoed to its sender only.
    pub fn audience_for(self, room: Option<&str>) -> Audience {
        match (room, self) {
            (None, _) | (Some(_), BroadcastPolicy::SenderOnly) => Audience::Sender,
            (Some(name), BroadcastPolicy::RoomExcludingSender) => {
                Audience::Room { name: name.to_string(), include_sender: false }
            }
            (Some(name), BroadcastPolicy::RoomIncludingSender) => {
                Audience::Room { name: name.to_string(), include_sender: true }
            }
        }
    }

    /// Audience for the AI reply to a user message: the same scope, always
    /// including the requester.
    pub fn reply_audience_for(self, room: Option<&str>) -> Audience {
        match (room, self) {
            (None, _) | (Some(_), BroadcastPolicy::SenderOnly) => Audience::Sender,
            (Some(name), _) => Audience::Room { name: name.to_string(), include_sender: true },
        }
    }

    /// Whether the server sends the sender its own message back.
    pub fn echoes_to_sender(self, room: Option<&str>) -> bool {
        self.audience_for(room).includes_sender()
    }
}

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// Current instant in UTC as RFC 3339 (e.g. "2025-11-02T12:34:56Z").
pub fn now_timestamp() -> String {
    OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default()
}
