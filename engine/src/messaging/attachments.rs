//! Outgoing file validation and the buffer for attachments that beat their parent.

use crate::error::{EngineError, Result};
use reqchat_messaging::{Attachment, AttachmentId, ConversationKey, MessageId};
use std::collections::{HashMap, HashSet};
use std::fmt;

const MAX_ATTACHMENT_BYTES: u64 = 10 * 1024 * 1024;

const ALLOWED_TYPES: &[&str] = &[
    "image/*",
    "application/pdf",
    "text/plain",
    "text/csv",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/vnd.ms-excel",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "application/zip",
];

/// Which files may be attached to a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentPolicy {
    pub max_bytes: u64,
    /// MIME types; a trailing `/*` admits a whole family.
    pub allowed_types: Vec<String>,
}

impl AttachmentPolicy {
    pub fn allows_type(&self, content_type: &str) -> bool {
        let content_type = content_type.trim().to_ascii_lowercase();
        self.allowed_types.iter().any(|allowed| match allowed.strip_suffix("/*") {
            Some(family) => content_type
                .split_once('/')
                .map_or(false, |(kind, sub)| kind == family && !sub.is_empty()),
            None => *allowed == content_type,
        })
    }

    /// Checked before any network call.
    pub fn validate(&self, file: &OutgoingFile) -> Result<()> {
        if file.bytes.is_empty() {
            return Err(EngineError::Validation(format!("{} is empty", file.file_name)));
        }
        if file.size() > self.max_bytes {
            return Err(EngineError::Validation(format!(
                "{} is {} bytes, limit is {}",
                file.file_name,
                file.size(),
                self.max_bytes
            )));
        }
        if !self.allows_type(&file.content_type) {
            return Err(EngineError::Validation(format!(
                "{} has unsupported type {}",
                file.file_name, file.content_type
            )));
        }
        Ok(())
    }
}

impl Default for AttachmentPolicy {
    fn default() -> Self {
        Self {
            max_bytes: MAX_ATTACHMENT_BYTES,
            allowed_types: ALLOWED_TYPES.iter().map(|t| t.to_string()).collect(),
        }
    }
}

/// A file the user picked, not yet uploaded.
#[derive(Clone, PartialEq, Eq)]
pub struct OutgoingFile {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl OutgoingFile {
    pub fn new(
        file_name: impl Into<String>,
        content_type: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            content_type: content_type.into(),
            bytes,
        }
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

impl fmt::Debug for OutgoingFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutgoingFile")
            .field("file_name", &self.file_name)
            .field("content_type", &self.content_type)
            .field("size", &self.bytes.len())
            .finish()
    }
}

/// Blob path `{conversation}/{message_id}/{epoch_ms}_{file_name}`.
pub fn storage_path(
    conversation: ConversationKey,
    message_id: MessageId,
    epoch_ms: i64,
    file_name: &str,
) -> String {
    let file_name: String = file_name
        .chars()
        .map(|c| if matches!(c, '/' | '\\') { '_' } else { c })
        .collect();
    format!("{conversation}/{message_id}/{epoch_ms}_{file_name}")
}

/// A file that did not make it onto a sent message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("attachment {file_name} was not added: {reason}")]
pub struct AttachmentWarning {
    pub file_name: String,
    pub reason: String,
}

/// Attachments whose parent message has not been seen yet, keyed by parent.
#[derive(Debug, Default)]
pub struct PendingAttachments {
    by_parent: HashMap<MessageId, Vec<Attachment>>,
    ids: HashSet<AttachmentId>,
}

impl PendingAttachments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Holds an orphan; returns false if this attachment is already held.
    pub fn buffer(&mut self, attachment: Attachment) -> bool {
        if !self.ids.insert(attachment.id) {
            return false;
        }
        self.by_parent
            .entry(attachment.message_id)
            .or_default()
            .push(attachment);
        true
    }

    /// Releases everything waiting on `parent`.
    pub fn take(&mut self, parent: MessageId) -> Vec<Attachment> {
        let released = self.by_parent.remove(&parent).unwrap_or_default();
        for attachment in &released {
            self.ids.remove(&attachment.id);
        }
        released
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_parent.clear();
        self.ids.clear();
    }
}
