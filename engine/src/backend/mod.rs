//! Contracts of the managed backend the sync core talks to.
//!
//! Records are plain JSON rows so any hosted store can sit behind
//! [`RecordStore`]; the core decodes them into typed models itself.

pub mod memory;

pub use memory::MemoryBackend;

use async_trait::async_trait;
use futures::stream::BoxStream;
use reqchat_messaging::{ConversationKey, RawRow, Table, UnreadEntry, UserId, Viewer};
use serde_json::Value;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    /// The caller has no connectivity at all; retrying will not help.
    #[error("backend unreachable: {0}")]
    Offline(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("unexpected response: {0}")]
    Decode(String),
}

impl BackendError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Row predicate understood by the record store and the change feed.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    All,
    Eq(&'static str, Value),
    IsNull(&'static str),
    In(&'static str, Vec<Value>),
    And(Vec<Filter>),
}

impl Filter {
    /// Rows of one conversation; the general channel is `requirement_id IS NULL`.
    pub fn conversation(key: ConversationKey) -> Self {
        match key.requirement_id() {
            Some(id) => Self::Eq("requirement_id", Value::String(id.to_string())),
            None => Self::IsNull("requirement_id"),
        }
    }

    pub fn matches(&self, row: &Value) -> bool {
        match self {
            Self::All => true,
            Self::Eq(column, expected) => row.get(*column) == Some(expected),
            Self::IsNull(column) => row.get(*column).map_or(true, Value::is_null),
            Self::In(column, options) => row
                .get(*column)
                .map_or(false, |value| options.contains(value)),
            Self::And(filters) => filters.iter().all(|f| f.matches(row)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderBy {
    pub column: &'static str,
    pub ascending: bool,
}

impl OrderBy {
    pub fn asc(column: &'static str) -> Self {
        Self {
            column,
            ascending: true,
        }
    }

    pub fn desc(column: &'static str) -> Self {
        Self {
            column,
            ascending: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Query {
    pub table: Table,
    pub filter: Filter,
    pub order: Vec<OrderBy>,
    pub range: Option<Range<usize>>,
}

impl Query {
    pub fn new(table: Table) -> Self {
        Self {
            table,
            filter: Filter::All,
            order: Vec::new(),
            range: None,
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order.push(order);
        self
    }

    pub fn range(mut self, range: Range<usize>) -> Self {
        self.range = Some(range);
        self
    }
}

/// Something pushed by an insert feed.
#[derive(Debug, Clone)]
pub enum FeedSignal {
    Insert(RawRow),
    /// The transport reported a fault; the feed should be considered dead.
    Error(String),
}

/// Shared flag the backend flips when a feed's transport dies.
#[derive(Debug, Clone)]
pub struct Liveness(Arc<AtomicBool>);

impl Liveness {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_alive(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn kill(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

/// A push subscription to inserted rows.
pub struct InsertFeed {
    pub events: BoxStream<'static, FeedSignal>,
    pub liveness: Liveness,
}

impl std::fmt::Debug for InsertFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InsertFeed")
            .field("alive", &self.liveness.is_alive())
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Inserts a row and returns it as stored, server defaults filled in.
    async fn insert(&self, table: Table, record: Value) -> BackendResult<Value>;
    async fn select(&self, query: Query) -> BackendResult<Vec<Value>>;
}

#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe_to_inserts(
        &self,
        tables: &[Table],
        filter: Filter,
    ) -> BackendResult<InsertFeed>;
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload(&self, path: &str, bytes: Vec<u8>) -> BackendResult<String>;
    fn public_url(&self, path: &str) -> String;
}

/// Remote procedures backing unread accounting.
#[async_trait]
pub trait ReadReceipts: Send + Sync {
    /// One entry per conversation the viewer participates in, zero counts
    /// included. `as_of` marks the newest insert each count reflects.
    async fn get_unread_counts(&self, viewer: &Viewer) -> BackendResult<Vec<UnreadEntry>>;
    /// Creates or advances the viewer's read cursor to the backend's "now".
    async fn mark_read(&self, viewer: UserId, conversation: ConversationKey) -> BackendResult<()>;
}

pub trait Identity: Send + Sync {
    fn current_user(&self) -> Option<Viewer>;
}

/// Handles to every collaborator, as handed to the engine.
#[derive(Clone)]
pub struct Backend {
    pub records: Arc<dyn RecordStore>,
    pub feed: Arc<dyn ChangeFeed>,
    pub blobs: Arc<dyn BlobStore>,
    pub receipts: Arc<dyn ReadReceipts>,
    pub identity: Arc<dyn Identity>,
}

impl Backend {
    /// Wires every contract to one object implementing all of them.
    pub fn from_shared<B>(backend: Arc<B>) -> Self
    where
        B: RecordStore + ChangeFeed + BlobStore + ReadReceipts + Identity + 'static,
    {
        Self {
            records: backend.clone(),
            feed: backend.clone(),
            blobs: backend.clone(),
            receipts: backend.clone(),
            identity: backend,
        }
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend").finish_non_exhaustive()
    }
}
