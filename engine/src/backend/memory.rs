//! In-process implementation of every backend contract.
//!
//! Behaves like the hosted backend closely enough for embedding and tests:
//! server-assigned ids and strictly increasing millisecond timestamps, insert
//! fan-out to matching feeds, read cursors, and the unread-count procedure.
//! Fault switches simulate outages and failed writes.

use super::{
    BackendError, BackendResult, BlobStore, ChangeFeed, FeedSignal, Filter, Identity, InsertFeed,
    Liveness, OrderBy, Query, ReadReceipts, RecordStore,
};
use async_trait::async_trait;
use chrono::Utc;
use futures::channel::mpsc;
use futures::StreamExt;
use reqchat_messaging::{
    ConversationKey, Message, RawRow, ReadCursor, Role, Table, UnreadEntry, UserId, Viewer,
};
use serde_json::{json, Value};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;
use uuid::Uuid;

const BLOB_URL_PREFIX: &str = "memory://chat-attachments/";

struct FeedEntry {
    tables: Vec<Table>,
    filter: Filter,
    tx: mpsc::UnboundedSender<FeedSignal>,
    liveness: Liveness,
}

#[derive(Default)]
struct Faults {
    failing_inserts: HashMap<Table, usize>,
    fail_selects: bool,
    fail_uploads: bool,
    fail_mark_read: bool,
    fail_unread_counts: bool,
    offline: bool,
    feeds_unavailable: bool,
}

#[derive(Default)]
struct State {
    tables: HashMap<Table, Vec<Value>>,
    feeds: Vec<FeedEntry>,
    /// Stalled feeds: never written to, kept open until their reader goes away.
    parked: Vec<mpsc::UnboundedSender<FeedSignal>>,
    blobs: HashMap<String, Vec<u8>>,
    owners: HashMap<ConversationKey, UserId>,
    current_user: Option<Viewer>,
    last_ms: i64,
    feed_subscriptions: usize,
    faults: Faults,
}

impl State {
    fn next_timestamp_ms(&mut self) -> i64 {
        let now = Utc::now().timestamp_millis();
        self.last_ms = now.max(self.last_ms + 1);
        self.last_ms
    }

    fn rows(&self, table: Table) -> &[Value] {
        self.tables.get(&table).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Attachment rows carry no conversation column; borrow the parent's.
    fn routable_row(&self, table: Table, row: &Value) -> Value {
        if table != Table::Attachments {
            return row.clone();
        }
        let parent = row.get("message_id").and_then(|message_id| {
            self.rows(Table::Messages)
                .iter()
                .find(|message| message.get("id") == Some(message_id))
        });
        let mut routed = row.clone();
        if let (Some(parent), Some(object)) = (parent, routed.as_object_mut()) {
            let requirement = parent.get("requirement_id").cloned().unwrap_or(Value::Null);
            object.insert("requirement_id".into(), requirement);
        }
        routed
    }

    fn dispatch(&mut self, table: Table, row: &Value) {
        let routed = self.routable_row(table, row);
        self.parked.retain(|tx| !tx.is_closed());
        self.feeds.retain(|feed| {
            if !feed.liveness.is_alive() || feed.tx.is_closed() {
                return false;
            }
            if !feed.tables.contains(&table) || !feed.filter.matches(&routed) {
                return true;
            }
            feed.tx
                .unbounded_send(FeedSignal::Insert(RawRow::new(table, row.clone())))
                .is_ok()
        });
    }

    fn cursor(&self, reader: UserId, conversation: ConversationKey) -> Option<i64> {
        let reader = json!(reader.0);
        let requirement = json!(conversation.requirement_id());
        self.rows(Table::ReadCursors)
            .iter()
            .find(|row| {
                row.get("reader_id") == Some(&reader)
                    && row.get("requirement_id") == Some(&requirement)
            })
            .and_then(|row| row.get("last_read_at"))
            .and_then(Value::as_i64)
    }

    fn participates(&self, viewer: &Viewer, conversation: ConversationKey) -> bool {
        match (viewer.role, conversation) {
            (Role::Admin, _) | (_, ConversationKey::General) => true,
            (Role::Client, key) => self.owners.get(&key) == Some(&viewer.id),
        }
    }
}

/// An in-memory backend implementing every collaborator contract.
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<State>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_current_user(&self, viewer: Option<Viewer>) {
        self.state().current_user = viewer;
    }

    /// Records the client who owns a requirement's conversation.
    pub fn register_requirement(&self, conversation: ConversationKey, owner: UserId) {
        self.state().owners.insert(conversation, owner);
    }

    /// Inserts a message as `sender`, the way another participant's client would.
    pub fn post_message(
        &self,
        sender: Viewer,
        conversation: ConversationKey,
        body: &str,
    ) -> BackendResult<Message> {
        let record = json!({
            "requirement_id": conversation.requirement_id(),
            "sender_id": sender.id,
            "sender_role": sender.role,
            "body": body,
        });
        let stored = self.insert_row(Table::Messages, record)?;
        serde_json::from_value(stored).map_err(|e| BackendError::Decode(e.to_string()))
    }

    /// Number of feeds ever opened; used to verify subscription sharing.
    pub fn feed_subscriptions(&self) -> usize {
        self.state().feed_subscriptions
    }

    pub fn live_feeds(&self) -> usize {
        self.state()
            .feeds
            .iter()
            .filter(|feed| feed.liveness.is_alive() && !feed.tx.is_closed())
            .count()
    }

    /// Kills every open feed; consumers see their streams end.
    pub fn drop_feeds(&self) {
        let mut state = self.state();
        for feed in state.feeds.drain(..) {
            feed.liveness.kill();
            let _ = feed
                .tx
                .unbounded_send(FeedSignal::Error("connection reset".into()));
        }
        debug!("memory backend dropped all feeds");
    }

    /// Marks feeds dead without ending their streams, like a half-open socket.
    pub fn stall_feeds(&self) {
        let mut state = self.state();
        let stalled: Vec<_> = state.feeds.drain(..).collect();
        for feed in stalled {
            feed.liveness.kill();
            state.parked.push(feed.tx);
        }
    }

    /// When set, new feed subscriptions fail with a retryable error.
    pub fn set_feeds_available(&self, available: bool) {
        self.state().faults.feeds_unavailable = !available;
    }

    /// When set, every feed subscription fails with a non-retryable error.
    pub fn set_offline(&self, offline: bool) {
        self.state().faults.offline = offline;
    }

    pub fn fail_next_inserts(&self, table: Table, count: usize) {
        self.state().faults.failing_inserts.insert(table, count);
    }

    pub fn fail_selects(&self, fail: bool) {
        self.state().faults.fail_selects = fail;
    }

    pub fn fail_uploads(&self, fail: bool) {
        self.state().faults.fail_uploads = fail;
    }

    pub fn fail_mark_read(&self, fail: bool) {
        self.state().faults.fail_mark_read = fail;
    }

    pub fn fail_unread_counts(&self, fail: bool) {
        self.state().faults.fail_unread_counts = fail;
    }

    pub fn read_cursor(&self, reader: UserId, conversation: ConversationKey) -> Option<ReadCursor> {
        let state = self.state();
        let last_read_at = state.cursor(reader, conversation)?;
        Some(ReadCursor {
            reader_id: reader,
            conversation,
            last_read_at: chrono::DateTime::from_timestamp_millis(last_read_at)?,
        })
    }

    pub fn rows(&self, table: Table) -> Vec<Value> {
        self.state().rows(table).to_vec()
    }

    pub fn blob(&self, path: &str) -> Option<Vec<u8>> {
        self.state().blobs.get(path).cloned()
    }

    fn insert_row(&self, table: Table, record: Value) -> BackendResult<Value> {
        let mut state = self.state();
        if let Some(remaining) = state.faults.failing_inserts.get_mut(&table) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(BackendError::Unavailable(format!("insert into {table} failed")));
            }
        }

        let Value::Object(mut object) = record else {
            return Err(BackendError::Rejected(format!("{table} rows must be objects")));
        };
        if !object.contains_key("id") {
            object.insert("id".into(), json!(Uuid::new_v4()));
        }
        if !object.contains_key("created_at") {
            let now = state.next_timestamp_ms();
            object.insert("created_at".into(), json!(now));
        }
        let row = Value::Object(object);

        state.tables.entry(table).or_default().push(row.clone());
        state.dispatch(table, &row);
        Ok(row)
    }
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("MemoryBackend")
            .field("feeds", &state.feeds.len())
            .field("feed_subscriptions", &state.feed_subscriptions)
            .finish_non_exhaustive()
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(a)), Some(Value::Number(b))) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(a)), Some(Value::String(b))) => a.cmp(b),
        (None | Some(Value::Null), None | Some(Value::Null)) => Ordering::Equal,
        (None | Some(Value::Null), _) => Ordering::Less,
        (_, None | Some(Value::Null)) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

fn sort_rows(rows: &mut [Value], order: &[OrderBy]) {
    rows.sort_by(|a, b| {
        order
            .iter()
            .map(|o| {
                let ord = compare_values(a.get(o.column), b.get(o.column));
                if o.ascending {
                    ord
                } else {
                    ord.reverse()
                }
            })
            .find(|ord| ord.is_ne())
            .unwrap_or(Ordering::Equal)
    });
}

#[async_trait]
impl RecordStore for MemoryBackend {
    async fn insert(&self, table: Table, record: Value) -> BackendResult<Value> {
        self.insert_row(table, record)
    }

    async fn select(&self, query: Query) -> BackendResult<Vec<Value>> {
        let state = self.state();
        if state.faults.fail_selects {
            return Err(BackendError::Unavailable(format!("select from {} failed", query.table)));
        }
        let mut rows: Vec<Value> = state
            .rows(query.table)
            .iter()
            .filter(|row| query.filter.matches(row))
            .cloned()
            .collect();
        sort_rows(&mut rows, &query.order);

        if let Some(range) = query.range {
            let start = range.start.min(rows.len());
            let end = range.end.min(rows.len()).max(start);
            rows = rows.drain(start..end).collect();
        }
        Ok(rows)
    }
}

#[async_trait]
impl ChangeFeed for MemoryBackend {
    async fn subscribe_to_inserts(
        &self,
        tables: &[Table],
        filter: Filter,
    ) -> BackendResult<InsertFeed> {
        let mut state = self.state();
        if state.faults.offline {
            return Err(BackendError::Offline("no network".into()));
        }
        if state.faults.feeds_unavailable {
            return Err(BackendError::Unavailable("realtime service unavailable".into()));
        }

        let (tx, rx) = mpsc::unbounded();
        let liveness = Liveness::new();
        state.feeds.push(FeedEntry {
            tables: tables.to_vec(),
            filter,
            tx,
            liveness: liveness.clone(),
        });
        state.feed_subscriptions += 1;

        Ok(InsertFeed {
            events: rx.boxed(),
            liveness,
        })
    }
}

#[async_trait]
impl BlobStore for MemoryBackend {
    async fn upload(&self, path: &str, bytes: Vec<u8>) -> BackendResult<String> {
        let mut state = self.state();
        if state.faults.fail_uploads {
            return Err(BackendError::Unavailable(format!("upload of {path} failed")));
        }
        state.blobs.insert(path.to_string(), bytes);
        Ok(self.public_url(path))
    }

    fn public_url(&self, path: &str) -> String {
        format!("{BLOB_URL_PREFIX}{path}")
    }
}

#[async_trait]
impl ReadReceipts for MemoryBackend {
    async fn get_unread_counts(&self, viewer: &Viewer) -> BackendResult<Vec<UnreadEntry>> {
        let state = self.state();
        if state.faults.fail_unread_counts {
            return Err(BackendError::Unavailable("unread counts unavailable".into()));
        }

        let messages: Vec<Message> = state
            .rows(Table::Messages)
            .iter()
            .map(|row| serde_json::from_value(row.clone()))
            .collect::<Result<_, _>>()
            .map_err(|e| BackendError::Decode(e.to_string()))?;

        let as_of = chrono::DateTime::from_timestamp_millis(state.last_ms);
        let mut conversations: BTreeSet<ConversationKey> = state.owners.keys().copied().collect();
        conversations.insert(ConversationKey::General);
        conversations.extend(messages.iter().map(|m| m.conversation));

        let entries = conversations
            .into_iter()
            .filter(|key| state.participates(viewer, *key))
            .map(|key| {
                let cursor = state.cursor(viewer.id, key);
                let count = messages
                    .iter()
                    .filter(|m| m.conversation == key && m.is_from_other_party(viewer))
                    .filter(|m| cursor.map_or(true, |c| m.created_at.timestamp_millis() > c))
                    .count();
                UnreadEntry {
                    conversation: key,
                    count: count as u32,
                    as_of,
                }
            })
            .collect();
        Ok(entries)
    }

    async fn mark_read(&self, viewer: UserId, conversation: ConversationKey) -> BackendResult<()> {
        let mut state = self.state();
        if state.faults.fail_mark_read {
            return Err(BackendError::Unavailable("mark_read failed".into()));
        }
        let now = state.next_timestamp_ms();
        let reader = json!(viewer.0);
        let requirement = json!(conversation.requirement_id());
        let cursors = state.tables.entry(Table::ReadCursors).or_default();
        match cursors.iter_mut().find(|row| {
            row.get("reader_id") == Some(&reader) && row.get("requirement_id") == Some(&requirement)
        }) {
            Some(row) => row["last_read_at"] = json!(now),
            None => cursors.push(json!({
                "reader_id": reader,
                "requirement_id": requirement,
                "last_read_at": now,
            })),
        }
        Ok(())
    }
}

impl Identity for MemoryBackend {
    fn current_user(&self) -> Option<Viewer> {
        self.state().current_user
    }
}
