//! Chat record models shared by the requirements portal sync engine.
//!
//! Records cross the backend boundary as JSON rows; timestamps travel as epoch
//! milliseconds and the general conversation is a `null` `requirement_id`.

pub mod events;

pub use events::{RawRow, StreamEvent, Table};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of a portal user (admin or client).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a requirement; each requirement owns one conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequirementId(pub Uuid);

impl RequirementId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequirementId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttachmentId(pub Uuid);

impl AttachmentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AttachmentId {
    fn default() -> Self {
        Self::new()
    }
}

/// A logical conversation: one requirement's chat or the shared general channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "Option<Uuid>", into = "Option<Uuid>")]
pub enum ConversationKey {
    General,
    Requirement(RequirementId),
}

impl ConversationKey {
    pub fn requirement(id: RequirementId) -> Self {
        Self::Requirement(id)
    }

    /// Column value for `requirement_id`; `None` is the general sentinel.
    pub fn requirement_id(&self) -> Option<Uuid> {
        match self {
            Self::General => None,
            Self::Requirement(id) => Some(id.0),
        }
    }

    pub fn is_general(&self) -> bool {
        matches!(self, Self::General)
    }
}

impl From<Option<Uuid>> for ConversationKey {
    fn from(value: Option<Uuid>) -> Self {
        match value {
            Some(id) => Self::Requirement(RequirementId(id)),
            None => Self::General,
        }
    }
}

impl From<ConversationKey> for Option<Uuid> {
    fn from(key: ConversationKey) -> Self {
        key.requirement_id()
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::General => f.write_str("general"),
            Self::Requirement(id) => write!(f, "{}", id.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Client,
}

/// The signed-in user the engine is working for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewer {
    pub id: UserId,
    pub role: Role,
}

impl Viewer {
    pub fn new(id: UserId, role: Role) -> Self {
        Self { id, role }
    }
}

/// A file attached to a chat message. May be delivered after its parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: AttachmentId,
    pub message_id: MessageId,
    pub file_name: String,
    pub file_url: String,
    pub file_type: String,
    pub file_size: u64,
    pub uploaded_by: UserId,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

/// A chat message. Immutable once created apart from its attachment list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    #[serde(rename = "requirement_id")]
    pub conversation: ConversationKey,
    pub sender_id: UserId,
    pub sender_role: Role,
    pub body: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing)]
    pub attachments: Vec<Attachment>,
}

impl Message {
    /// Ordering key; the id breaks same-millisecond ties.
    pub fn sort_key(&self) -> (DateTime<Utc>, MessageId) {
        (self.created_at, self.id)
    }

    /// True when the message should count as unread for `viewer`.
    pub fn is_from_other_party(&self, viewer: &Viewer) -> bool {
        self.sender_role != viewer.role && self.sender_id != viewer.id
    }

    /// Appends an attachment unless one with the same id is already present.
    pub fn attach(&mut self, attachment: Attachment) -> bool {
        if self.attachments.iter().any(|a| a.id == attachment.id) {
            return false;
        }
        self.attachments.push(attachment);
        true
    }
}

/// Durable per-reader marker of how far a conversation has been read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadCursor {
    pub reader_id: UserId,
    #[serde(rename = "requirement_id")]
    pub conversation: ConversationKey,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_read_at: DateTime<Utc>,
}

/// One row of the unread-count remote procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadEntry {
    #[serde(rename = "requirement_id")]
    pub conversation: ConversationKey,
    pub count: u32,
    /// Newest message time the count already covers, when the backend reports it.
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub as_of: Option<DateTime<Utc>>,
}

/// Health of one logical conversation subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

/// Messaging-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    #[error("malformed {table} row: {reason}")]
    Decode { table: Table, reason: String },
}

pub type Result<T> = std::result::Result<T, MessagingError>;
