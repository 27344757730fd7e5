//! Typed change-stream events decoded from raw inserted rows.

use crate::{Attachment, Message, MessagingError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Tables the chat core reads, writes, or listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Messages,
    Attachments,
    ReadCursors,
}

impl Table {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Messages => "chat_messages",
            Self::Attachments => "chat_attachments",
            Self::ReadCursors => "chat_read_cursors",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An inserted row as pushed by the backend feed, before decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRow {
    pub table: Table,
    pub record: serde_json::Value,
}

impl RawRow {
    pub fn new(table: Table, record: serde_json::Value) -> Self {
        Self { table, record }
    }
}

/// A server-pushed insert, decoded once at the feed boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum StreamEvent {
    Message(Message),
    Attachment(Attachment),
}

impl StreamEvent {
    pub fn decode(row: RawRow) -> Result<Self> {
        let table = row.table;
        let malformed = |err: serde_json::Error| MessagingError::Decode {
            table,
            reason: err.to_string(),
        };
        match table {
            Table::Messages => serde_json::from_value(row.record)
                .map(Self::Message)
                .map_err(malformed),
            Table::Attachments => serde_json::from_value(row.record)
                .map(Self::Attachment)
                .map_err(malformed),
            Table::ReadCursors => Err(MessagingError::Decode {
                table,
                reason: "read cursors are not streamed".into(),
            }),
        }
    }

    /// Stable identity used for delivery dedup.
    pub fn dedup_key(&self) -> String {
        match self {
            Self::Message(message) => format!("message:{}", message.id.0),
            Self::Attachment(attachment) => format!("attachment:{}", attachment.id.0),
        }
    }
}
