//! Wire envelope and JSON codec.
//!
//! ARCHITECTURE
//! ============
//! Every frame on the wire — one line on the TCP transport, one text
//! message on the WebSocket — is a single JSON `Envelope`. The connection
//! loop decodes it, the dispatcher routes on `kind`, and replies flow back
//! as envelopes through the same codec.
//!
//! DESIGN
//! ======
//! - `content` is structured JSON, never JSON-in-a-string. Handlers pull a
//!   typed payload out of it exactly once via [`Envelope::payload`].
//! - Unknown `type` strings decode into [`MessageKind::Unknown`] so the
//!   dispatcher can answer "unhandled" instead of dropping the frame.
//! - Decode failure is a value, not a panic; the caller logs and ignores.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

// =============================================================================
// TYPES
// =============================================================================

/// Closed enumeration of wire message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    Text,
    Image,
    File,
    Join,
    Leave,
    ExitRoom,
    CreateRoom,
    ListRooms,
    ListRoomUsers,
    Register,
    Login,
    Logout,
    AuthSuccess,
    AuthFailure,
    UuidAuth,
    UuidAuthSuccess,
    UuidAuthFailure,
    PrivateChat,
    FriendRequest,
    FriendRequestResponse,
    RequestHistory,
    HistoryResponse,
    RequestLatestTimestamp,
    LatestTimestamp,
    RecallMessage,
    RecallNotice,
    SetRoomAdmin,
    RemoveRoomAdmin,
    UpdateRoomSettings,
    RoomMembersChanged,
    ServiceConfig,
    System,
    /// Catch-all for message types this server does not know.
    #[serde(other)]
    Unknown,
}

/// One frame on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default)]
    pub content: Value,
    /// Milliseconds since the Unix epoch.
    #[serde(default = "now_ms")]
    pub time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_nsfw: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iv: Option<String>,
}

// =============================================================================
// PAYLOADS
// =============================================================================

/// TEXT / IMAGE / FILE content: a conversation target plus the body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatPayload {
    pub conversation_id: i64,
    pub content: String,
}

/// PRIVATE_CHAT content: recipient username plus the body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrivateChatPayload {
    pub to: String,
    pub content: String,
}

/// JOIN / LEAVE / EXIT_ROOM content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomPayload {
    pub room: String,
}

/// CREATE_ROOM content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRoomPayload {
    pub name: String,
    #[serde(default = "default_true")]
    pub is_public: bool,
}

/// REGISTER / LOGIN content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsPayload {
    pub username: String,
    pub password: String,
}

/// UUID_AUTH content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPayload {
    pub token: String,
}

/// REQUEST_HISTORY content. A valid positive `since` selects since-mode,
/// otherwise the last `limit` messages are returned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryPayload {
    pub conversation_id: i64,
    #[serde(default)]
    pub since: Option<i64>,
    #[serde(default)]
    pub limit: Option<i64>,
}

/// REQUEST_LATEST_TIMESTAMP content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationPayload {
    pub conversation_id: i64,
}

/// RECALL_MESSAGE content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecallPayload {
    pub message_id: i64,
}

/// UPDATE_ROOM_SETTINGS content. Absent fields are left unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomSettingsPayload {
    pub room: String,
    #[serde(default)]
    pub allow_temp_chats: Option<bool>,
    #[serde(default)]
    pub is_public: Option<bool>,
}

/// SET_ROOM_ADMIN / REMOVE_ROOM_ADMIN content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomAdminPayload {
    pub room: String,
    pub username: String,
}

/// FRIEND_REQUEST content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FriendRequestPayload {
    pub to: String,
}

/// FRIEND_REQUEST_RESPONSE content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FriendResponsePayload {
    pub request_id: i64,
    pub accept: bool,
}

// =============================================================================
// CONSTRUCTORS
// =============================================================================

/// Current time as milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

fn default_true() -> bool {
    true
}

impl Envelope {
    /// Create an envelope with structured content.
    pub fn new(kind: MessageKind, content: Value) -> Self {
        Self {
            kind,
            from: None,
            content,
            time: now_ms(),
            conversation_id: None,
            is_nsfw: None,
            iv: None,
        }
    }

    /// Server-originated SYSTEM message with a plain-text body.
    pub fn system(text: impl Into<String>) -> Self {
        Self::new(MessageKind::System, Value::String(text.into())).with_from("server")
    }

    /// AUTH_FAILURE with a reason the client can show.
    pub fn auth_failure(reason: impl Into<String>) -> Self {
        Self::new(MessageKind::AuthFailure, Value::String(reason.into())).with_from("server")
    }

    /// UUID_AUTH_FAILURE with a reason the client can show.
    pub fn uuid_auth_failure(reason: impl Into<String>) -> Self {
        Self::new(MessageKind::UuidAuthFailure, Value::String(reason.into())).with_from("server")
    }

    #[must_use]
    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    #[must_use]
    pub fn with_conversation(mut self, conversation_id: i64) -> Self {
        self.conversation_id = Some(conversation_id);
        self
    }

    #[must_use]
    pub fn with_time(mut self, time: i64) -> Self {
        self.time = time;
        self
    }

    /// Extract the typed payload carried in `content`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Payload`] when the content does not match the
    /// expected shape; the dispatcher reports this back as a SYSTEM frame.
    pub fn payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, CodecError> {
        serde_json::from_value(self.content.clone()).map_err(CodecError::Payload)
    }

    /// Plain-text content, if the frame carries a bare string.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        self.content.as_str()
    }
}

// =============================================================================
// CODEC
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("empty frame")]
    Empty,
    #[error("malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("malformed payload: {0}")]
    Payload(#[source] serde_json::Error),
    #[error("frame failed to serialize: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Decode one text frame into an envelope.
///
/// # Errors
///
/// Returns [`CodecError::Empty`] for blank input and
/// [`CodecError::Malformed`] for anything that is not a valid envelope.
/// Never panics: the caller treats failure as "log and ignore".
pub fn decode(text: &str) -> Result<Envelope, CodecError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(CodecError::Empty);
    }
    serde_json::from_str(trimmed).map_err(CodecError::Malformed)
}

/// Encode an envelope into one text frame.
///
/// The result is re-checked to be well-formed JSON before it is handed to
/// a transport; a frame that cannot be emitted cleanly is never sent.
///
/// # Errors
///
/// Returns [`CodecError::Encode`] if serialization or the well-formedness
/// check fails.
pub fn encode(envelope: &Envelope) -> Result<String, CodecError> {
    let text = serde_json::to_string(envelope).map_err(CodecError::Encode)?;
    serde_json::from_str::<Value>(&text).map_err(CodecError::Encode)?;
    Ok(text)
}

#[cfg(test)]
#[path = "message_test.rs"]
mod tests;
