//! Message pipeline: history paging, live merges, and sends for one conversation.

use super::attachments::{
    storage_path, AttachmentPolicy, AttachmentWarning, OutgoingFile, PendingAttachments,
};
use super::timeline::Timeline;
use crate::backend::{Backend, BlobStore, Filter, OrderBy, Query, RecordStore};
use crate::error::{EngineError, Result};
use chrono::Utc;
use reqchat_messaging::{Attachment, ConversationKey, Message, StreamEvent, Table, Viewer};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

/// Message to send, with files to attach after the body is stored.
#[derive(Debug, Clone, Default)]
pub struct OutgoingMessage {
    pub body: String,
    pub files: Vec<OutgoingFile>,
}

impl OutgoingMessage {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            files: Vec::new(),
        }
    }

    pub fn with_file(mut self, file: OutgoingFile) -> Self {
        self.files.push(file);
        self
    }
}

/// Result of a send: the stored message plus any files that failed.
#[derive(Debug, Clone)]
pub struct SendReport {
    pub message: Message,
    pub warnings: Vec<AttachmentWarning>,
}

impl SendReport {
    pub fn is_complete(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// One page of history, oldest first.
#[derive(Debug, Clone)]
pub struct HistoryPage {
    pub messages: Vec<Message>,
    pub has_more: bool,
}

#[derive(Debug, Default)]
struct ViewState {
    timeline: Timeline,
    pending: PendingAttachments,
}

/// Owns the rendered timeline of one conversation.
pub struct MessagePipeline {
    conversation: ConversationKey,
    viewer: Viewer,
    records: Arc<dyn RecordStore>,
    blobs: Arc<dyn BlobStore>,
    policy: AttachmentPolicy,
    state: RwLock<ViewState>,
    open: AtomicBool,
    version: watch::Sender<u64>,
}

impl MessagePipeline {
    pub fn new(
        conversation: ConversationKey,
        viewer: Viewer,
        backend: &Backend,
        policy: AttachmentPolicy,
    ) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            conversation,
            viewer,
            records: Arc::clone(&backend.records),
            blobs: Arc::clone(&backend.blobs),
            policy,
            state: RwLock::new(ViewState::default()),
            open: AtomicBool::new(true),
            version,
        }
    }

    pub fn conversation(&self) -> ConversationKey {
        self.conversation
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Loads `limit` messages starting `offset` back from the newest and
    /// merges them. A page that lands after [`close`](Self::close) is dropped.
    pub async fn load_history(&self, offset: usize, limit: usize) -> Result<HistoryPage> {
        let query = Query::new(Table::Messages)
            .filter(Filter::conversation(self.conversation))
            .order_by(OrderBy::desc("created_at"))
            .order_by(OrderBy::desc("id"))
            .range(offset..offset.saturating_add(limit).saturating_add(1));
        let mut rows = self.records.select(query).await.map_err(EngineError::fetch)?;

        let has_more = rows.len() > limit;
        rows.truncate(limit);
        let mut messages: Vec<Message> = rows.into_iter().filter_map(decode_row).collect();
        messages.reverse();

        if !messages.is_empty() {
            let parents = messages.iter().map(|m| json!(m.id)).collect();
            let query = Query::new(Table::Attachments)
                .filter(Filter::In("message_id", parents))
                .order_by(OrderBy::asc("created_at"));
            let attachments = self.records.select(query).await.map_err(EngineError::fetch)?;
            for attachment in attachments.into_iter().filter_map(decode_row::<Attachment>) {
                if let Some(parent) = messages.iter_mut().find(|m| m.id == attachment.message_id) {
                    parent.attach(attachment);
                }
            }
        }

        let mut changed = false;
        {
            let mut guard = self.state.write().await;
            if !self.is_open() {
                debug!(conversation = %self.conversation, "discarding page for closed view");
                return Ok(HistoryPage { messages, has_more });
            }
            let state = &mut *guard;
            for message in &messages {
                changed |= merge_message(state, message.clone());
            }
        }
        if changed {
            self.bump();
        }
        debug!(
            conversation = %self.conversation,
            offset,
            count = messages.len(),
            has_more,
            "history page loaded"
        );
        Ok(HistoryPage { messages, has_more })
    }

    /// Applies a pushed insert. Safe to call any number of times per event.
    pub async fn apply_stream_event(&self, event: StreamEvent) -> bool {
        if !self.is_open() {
            return false;
        }
        let changed = {
            let mut guard = self.state.write().await;
            if !self.is_open() {
                return false;
            }
            let state = &mut *guard;
            match event {
                StreamEvent::Message(message) if message.conversation != self.conversation => {
                    debug!(
                        conversation = %self.conversation,
                        other = %message.conversation,
                        "ignoring message for another conversation"
                    );
                    false
                }
                StreamEvent::Message(message) => merge_message(state, message),
                StreamEvent::Attachment(attachment) => {
                    match state.timeline.attach(attachment.clone()) {
                        Some(added) => added,
                        None => {
                            debug!(
                                message = %attachment.message_id,
                                "buffering attachment until its message arrives"
                            );
                            state.pending.buffer(attachment);
                            false
                        }
                    }
                }
            }
        };
        if changed {
            self.bump();
        }
        changed
    }

    /// Stores the body, shows it right away, then uploads files one by one.
    ///
    /// Files are validated before anything touches the network. Once the
    /// body is stored, a failing file only produces a warning.
    pub async fn send(&self, outgoing: OutgoingMessage) -> Result<SendReport> {
        if outgoing.body.trim().is_empty() && outgoing.files.is_empty() {
            return Err(EngineError::Validation("message is empty".into()));
        }
        for file in &outgoing.files {
            self.policy.validate(file)?;
        }

        let record = json!({
            "requirement_id": self.conversation.requirement_id(),
            "sender_id": self.viewer.id,
            "sender_role": self.viewer.role,
            "body": outgoing.body,
        });
        let stored = self
            .records
            .insert(Table::Messages, record)
            .await
            .map_err(EngineError::write)?;
        let mut message: Message = serde_json::from_value(stored).map_err(EngineError::write)?;
        info!(
            conversation = %self.conversation,
            message = %message.id,
            files = outgoing.files.len(),
            "message sent"
        );

        self.apply_stream_event(StreamEvent::Message(message.clone())).await;

        let mut warnings = Vec::new();
        for file in outgoing.files {
            match self.upload(&message, file).await {
                Ok(attachment) => {
                    message.attach(attachment.clone());
                    self.apply_stream_event(StreamEvent::Attachment(attachment)).await;
                }
                Err(warning) => {
                    warn!(message = %message.id, %warning, "attachment failed");
                    warnings.push(warning);
                }
            }
        }
        Ok(SendReport { message, warnings })
    }

    async fn upload(
        &self,
        message: &Message,
        file: OutgoingFile,
    ) -> std::result::Result<Attachment, AttachmentWarning> {
        let OutgoingFile {
            file_name,
            content_type,
            bytes,
        } = file;
        let warning = |reason: String| AttachmentWarning {
            file_name: file_name.clone(),
            reason,
        };

        let size = bytes.len() as u64;
        let uploaded_at = Utc::now().timestamp_millis();
        let path = storage_path(self.conversation, message.id, uploaded_at, &file_name);
        let url = self
            .blobs
            .upload(&path, bytes)
            .await
            .map_err(|e| warning(e.to_string()))?;

        let record = json!({
            "message_id": message.id,
            "file_name": file_name,
            "file_url": url,
            "file_type": content_type,
            "file_size": size,
            "uploaded_by": self.viewer.id,
        });
        let stored = self
            .records
            .insert(Table::Attachments, record)
            .await
            .map_err(|e| warning(e.to_string()))?;
        serde_json::from_value(stored).map_err(|e| warning(e.to_string()))
    }

    /// Stops accepting updates and drops buffered attachments.
    pub async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.state.write().await.pending.clear();
        debug!(conversation = %self.conversation, "pipeline closed");
    }

    pub async fn snapshot(&self) -> Vec<Message> {
        self.state.read().await.timeline.messages().to_vec()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.timeline.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn pending_attachments(&self) -> usize {
        self.state.read().await.pending.len()
    }

    /// Bumped on every visible change.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    fn bump(&self) {
        self.version.send_modify(|version| *version += 1);
    }
}

impl std::fmt::Debug for MessagePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagePipeline")
            .field("conversation", &self.conversation)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

fn merge_message(state: &mut ViewState, message: Message) -> bool {
    let id = message.id;
    let mut changed = state.timeline.insert(message).changed();
    for attachment in state.pending.take(id) {
        changed |= state.timeline.attach(attachment).unwrap_or(false);
    }
    changed
}

fn decode_row<T: serde::de::DeserializeOwned>(row: Value) -> Option<T> {
    match serde_json::from_value(row) {
        Ok(decoded) => Some(decoded),
        Err(err) => {
            warn!(%err, "skipping undecodable row");
            None
        }
    }
}
