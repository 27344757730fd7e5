//! Message pipeline: paged history, live stream merges, and sends with attachments.

mod attachments;
mod pipeline;
mod timeline;

pub use attachments::{
    storage_path, AttachmentPolicy, AttachmentWarning, OutgoingFile, PendingAttachments,
};
pub use pipeline::{HistoryPage, MessagePipeline, OutgoingMessage, SendReport};
pub use timeline::{Merge, Timeline};
