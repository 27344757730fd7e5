//! Per-conversation unread counts for the signed-in viewer.
//!
//! Counts are seeded from the backend's unread procedure and then advanced by
//! live stream events. Any reconnect re-seeds, since events inserted while a
//! stream was down are never replayed. Events that arrive while a seed is in
//! flight are held and replayed against the seed's `as_of` watermark, so a
//! message is neither lost nor counted twice when the two race.

use crate::backend::ReadReceipts;
use crate::error::{EngineError, Result};
use crate::realtime::{ChannelEvent, ConnectionManager, Subscription};
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use reqchat_messaging::{
    ConnectionState, ConversationKey, Message, MessageId, StreamEvent, UnreadEntry, Viewer,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackerPhase {
    #[default]
    Uninitialized,
    Loading,
    Ready,
}

/// What presentation code renders: counts plus the derived "new" flag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnreadSnapshot {
    pub phase: TrackerPhase,
    pub counts: BTreeMap<ConversationKey, u32>,
    pub has_new_message: bool,
}

impl UnreadSnapshot {
    pub fn count(&self, key: ConversationKey) -> u32 {
        self.counts.get(&key).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u32 {
        self.counts.values().sum()
    }
}

#[derive(Debug, Clone, Copy)]
struct Sighting {
    conversation: ConversationKey,
    id: MessageId,
    created_at: DateTime<Utc>,
}

impl From<&Message> for Sighting {
    fn from(message: &Message) -> Self {
        Self {
            conversation: message.conversation,
            id: message.id,
            created_at: message.created_at,
        }
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    phase: TrackerPhase,
    counts: BTreeMap<ConversationKey, u32>,
    /// Ids already counted since the last seed.
    counted: HashSet<MessageId>,
    /// Per conversation, the newest insert the last seed already counted.
    seeded_through: HashMap<ConversationKey, DateTime<Utc>>,
    seeds_in_flight: usize,
    /// Qualifying messages seen while a seed was in flight.
    held: Vec<Sighting>,
    /// Conversations with a read-cursor write in flight.
    marking: HashMap<ConversationKey, usize>,
    statuses: HashMap<ConversationKey, ConnectionState>,
    /// Conversations whose stream dropped since they were last live.
    stale: HashSet<ConversationKey>,
}

impl TrackerState {
    fn count_once(&mut self, sighting: Sighting) -> bool {
        let covered = self
            .seeded_through
            .get(&sighting.conversation)
            .is_some_and(|through| sighting.created_at <= *through);
        if covered || !self.counted.insert(sighting.id) {
            return false;
        }
        *self.counts.entry(sighting.conversation).or_default() += 1;
        true
    }

    fn observe(&mut self, sighting: Sighting) {
        if self.seeds_in_flight > 0 {
            self.held.push(sighting);
        }
        if self.phase == TrackerPhase::Ready && self.count_once(sighting) {
            debug!(
                conversation = %sighting.conversation,
                message = %sighting.id,
                "unread count incremented"
            );
        }
    }

    fn finish_seed(&mut self, entries: Option<&[UnreadEntry]>) {
        self.seeds_in_flight = self.seeds_in_flight.saturating_sub(1);
        if let Some(entries) = entries {
            self.reseed(entries);
        }
        if self.seeds_in_flight == 0 {
            self.held.clear();
        }
    }

    fn reseed(&mut self, entries: &[UnreadEntry]) {
        self.counts = entries.iter().map(|e| (e.conversation, e.count)).collect();
        self.seeded_through = entries
            .iter()
            .filter_map(|e| Some((e.conversation, e.as_of?)))
            .collect();
        self.counted.clear();
        for key in self.marking.keys() {
            self.counts.insert(*key, 0);
        }

        // Without a watermark the seed is trusted as is.
        let held = std::mem::take(&mut self.held);
        for sighting in &held {
            if self.seeded_through.contains_key(&sighting.conversation) {
                self.count_once(*sighting);
            }
        }
        self.held = held;
    }

    fn begin_marking(&mut self, key: ConversationKey) -> u32 {
        *self.marking.entry(key).or_default() += 1;
        self.counts.insert(key, 0).unwrap_or(0)
    }

    fn finish_marking(&mut self, key: ConversationKey) {
        if let Some(pending) = self.marking.get_mut(&key) {
            *pending -= 1;
            if *pending == 0 {
                self.marking.remove(&key);
            }
        }
    }

    fn snapshot(&self) -> UnreadSnapshot {
        UnreadSnapshot {
            phase: self.phase,
            counts: self.counts.clone(),
            has_new_message: self.counts.values().any(|count| *count > 0),
        }
    }
}

#[derive(Debug, Default)]
struct Session {
    shutdown: Option<watch::Sender<()>>,
    pumps: Vec<JoinHandle<()>>,
    watched: BTreeSet<ConversationKey>,
}

struct TrackerInner {
    viewer: Viewer,
    receipts: Arc<dyn ReadReceipts>,
    manager: ConnectionManager,
    state: Mutex<TrackerState>,
    session: Mutex<Session>,
    snapshot: watch::Sender<UnreadSnapshot>,
}

fn listed(entries: &[UnreadEntry]) -> BTreeSet<ConversationKey> {
    let mut keys: BTreeSet<_> = entries.iter().map(|e| e.conversation).collect();
    keys.insert(ConversationKey::General);
    keys
}

impl TrackerInner {
    fn state(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The only place tracker state changes; republishes the snapshot.
    fn update<R>(&self, apply: impl FnOnce(&mut TrackerState) -> R) -> R {
        let mut state = self.state();
        let out = apply(&mut state);
        let snapshot = state.snapshot();
        self.snapshot.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            *current = snapshot;
            true
        });
        out
    }

    /// One call to the unread procedure, reconciled with anything held meanwhile.
    async fn seed(&self) -> Result<Vec<UnreadEntry>> {
        self.update(|state| state.seeds_in_flight += 1);
        let fetched = self
            .receipts
            .get_unread_counts(&self.viewer)
            .await
            .map_err(EngineError::fetch);
        self.update(|state| state.finish_seed(fetched.as_deref().ok()));
        fetched
    }

    fn on_message(&self, key: ConversationKey, message: &Message) {
        if message.conversation != key || !message.is_from_other_party(&self.viewer) {
            return;
        }
        self.update(|state| {
            if state.statuses.get(&key) == Some(&ConnectionState::Connected) {
                state.observe(Sighting::from(message));
            }
        });
    }

    /// Records a status; true when a dropped stream just came back.
    fn on_status(&self, key: ConversationKey, status: ConnectionState) -> bool {
        self.update(|state| {
            state.statuses.insert(key, status);
            match status {
                ConnectionState::Disconnected | ConnectionState::Error => {
                    state.stale.insert(key);
                    false
                }
                ConnectionState::Connected => {
                    state.stale.remove(&key) && state.phase == TrackerPhase::Ready
                }
                ConnectionState::Connecting => false,
            }
        })
    }

    /// Re-seeds every count and starts tracking conversations that appeared
    /// since the last seed, including ones whose subscription failed before.
    async fn resync(self: &Arc<Self>) -> Result<()> {
        let resumed = self.update(|state| {
            let ready = state.phase == TrackerPhase::Ready;
            if ready {
                state.phase = TrackerPhase::Loading;
            }
            ready
        });
        let outcome = self.reseed_and_watch().await;
        if resumed {
            self.update(|state| {
                if state.phase == TrackerPhase::Loading {
                    state.phase = TrackerPhase::Ready;
                }
            });
        }
        outcome
    }

    async fn reseed_and_watch(self: &Arc<Self>) -> Result<()> {
        let entries = self.seed().await?;
        let added = self.watch_all(listed(&entries)).await;
        if added > 0 {
            // Inserts that raced the new subscriptions.
            if let Err(err) = self.seed().await {
                warn!(%err, "unread reseed after new subscriptions failed");
            }
        }
        info!(conversations = entries.len(), added, "unread counts resynced");
        Ok(())
    }

    async fn pump(
        self: Arc<Self>,
        mut subscription: Subscription,
        mut shutdown: watch::Receiver<()>,
    ) {
        let key = subscription.conversation();
        loop {
            tokio::select! {
                event = subscription.recv() => match event {
                    Some(ChannelEvent::Event(StreamEvent::Message(message))) => {
                        self.on_message(key, &message);
                    }
                    Some(ChannelEvent::Event(StreamEvent::Attachment(_))) => {}
                    Some(ChannelEvent::Status(status)) => {
                        if self.on_status(key, status) {
                            let inner = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(err) = inner.resync().await {
                                    warn!(%err, "unread resync after reconnect failed");
                                }
                            });
                        }
                    }
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        self.manager.unsubscribe(subscription);
    }

    /// Subscribes every key not yet watched; returns how many were added.
    async fn watch_all(self: &Arc<Self>, keys: BTreeSet<ConversationKey>) -> usize {
        let Some(stopped) = self.session().shutdown.as_ref().map(watch::Sender::subscribe) else {
            return 0;
        };
        let mut added = 0;
        for key in keys {
            if self.watch(key, stopped.clone()).await {
                added += 1;
            }
        }
        added
    }

    // Boxed: a pump may resync, which may start more pumps.
    fn watch(
        self: &Arc<Self>,
        key: ConversationKey,
        shutdown: watch::Receiver<()>,
    ) -> BoxFuture<'static, bool> {
        let inner = Arc::clone(self);
        async move {
            if !inner.session().watched.insert(key) {
                return false;
            }
            match inner.manager.subscribe(key).await {
                Ok(subscription) => {
                    inner.update(|state| {
                        state.statuses.insert(key, subscription.state());
                    });
                    let pump = tokio::spawn(Arc::clone(&inner).pump(subscription, shutdown));
                    inner.session().pumps.push(pump);
                    true
                }
                Err(err) => {
                    warn!(conversation = %key, %err, "no live stream for unread tracking yet");
                    inner.session().watched.remove(&key);
                    false
                }
            }
        }
        .boxed()
    }
}

/// Unread counts for one viewer. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct UnreadTracker {
    inner: Arc<TrackerInner>,
}

impl UnreadTracker {
    pub fn new(
        viewer: Viewer,
        receipts: Arc<dyn ReadReceipts>,
        manager: ConnectionManager,
    ) -> Self {
        let (snapshot, _) = watch::channel(UnreadSnapshot::default());
        Self {
            inner: Arc::new(TrackerInner {
                viewer,
                receipts,
                manager,
                state: Mutex::new(TrackerState::default()),
                session: Mutex::new(Session::default()),
                snapshot,
            }),
        }
    }

    pub fn viewer(&self) -> Viewer {
        self.inner.viewer
    }

    pub fn phase(&self) -> TrackerPhase {
        self.inner.state().phase
    }

    /// Seeds counts, subscribes to every listed conversation plus the general
    /// channel, then seeds again so inserts that raced the subscriptions count.
    pub async fn start(&self) -> Result<()> {
        let proceed = self.inner.update(|state| {
            if state.phase != TrackerPhase::Uninitialized {
                return false;
            }
            state.phase = TrackerPhase::Loading;
            true
        });
        if !proceed {
            return Ok(());
        }

        let entries = match self.inner.seed().await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(%err, "unread seed failed");
                self.inner.update(|state| state.phase = TrackerPhase::Uninitialized);
                return Err(err);
            }
        };

        let (shutdown, _) = watch::channel(());
        self.inner.session().shutdown = Some(shutdown);
        self.inner.watch_all(listed(&entries)).await;

        if let Err(err) = self.inner.seed().await {
            warn!(%err, "unread reseed failed, keeping first seed");
        }
        self.inner.update(|state| state.phase = TrackerPhase::Ready);
        info!(
            viewer = %self.inner.viewer.id,
            conversations = self.inner.session().watched.len(),
            total = self.total(),
            "unread tracker ready"
        );
        Ok(())
    }

    /// Zeroes the count at once, then writes the read cursor. A failed write
    /// restores the previous count on top of anything counted meanwhile.
    pub async fn mark_as_read(&self, key: ConversationKey) -> Result<()> {
        let prior = self.inner.update(|state| state.begin_marking(key));

        match self.inner.receipts.mark_read(self.inner.viewer.id, key).await {
            Ok(()) => {
                self.inner.update(|state| state.finish_marking(key));
                debug!(conversation = %key, cleared = prior, "marked as read");
                Ok(())
            }
            Err(err) => {
                warn!(conversation = %key, %err, "mark as read failed, restoring count");
                self.inner.update(|state| {
                    state.finish_marking(key);
                    *state.counts.entry(key).or_default() += prior;
                });
                Err(EngineError::write(err))
            }
        }
    }

    /// Replaces every count with a fresh seed and picks up new conversations.
    pub async fn resync(&self) -> Result<()> {
        self.inner.resync().await
    }

    /// Resyncs every `period` until the tracker is dropped.
    pub fn spawn_refresh(&self, period: Duration) -> JoinHandle<()> {
        let weak: Weak<TrackerInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if inner.state().phase != TrackerPhase::Ready {
                    continue;
                }
                if let Err(err) = inner.resync().await {
                    warn!(%err, "periodic unread refresh failed");
                }
            }
        })
    }

    /// Unsubscribes everything and forgets all counts.
    pub async fn stop(&self) {
        let (shutdown, pumps) = {
            let mut session = self.inner.session();
            session.watched.clear();
            (session.shutdown.take(), std::mem::take(&mut session.pumps))
        };
        drop(shutdown);
        for pump in pumps {
            let _ = pump.await;
        }
        self.inner.update(|state| *state = TrackerState::default());
        debug!(viewer = %self.inner.viewer.id, "unread tracker stopped");
    }

    pub fn count(&self, key: ConversationKey) -> u32 {
        self.inner.state().counts.get(&key).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u32 {
        self.inner.state().counts.values().sum()
    }

    pub fn has_new_message(&self) -> bool {
        self.inner.snapshot.borrow().has_new_message
    }

    pub fn snapshot(&self) -> UnreadSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    pub fn changes(&self) -> watch::Receiver<UnreadSnapshot> {
        self.inner.snapshot.subscribe()
    }

    pub fn conversations(&self) -> Vec<ConversationKey> {
        self.inner.session().watched.iter().copied().collect()
    }
}

impl std::fmt::Debug for UnreadTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnreadTracker")
            .field("viewer", &self.inner.viewer)
            .field("phase", &self.phase())
            .field("total", &self.total())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::config::EngineConfig;
    use crate::realtime::backoff::tests::RecordingTimer;
    use reqchat_messaging::{RequirementId, Role, UserId};

    struct Fixture {
        backend: Arc<MemoryBackend>,
        manager: ConnectionManager,
        tracker: UnreadTracker,
        client: Viewer,
        key: ConversationKey,
    }

    fn fixture() -> Fixture {
        let backend = Arc::new(MemoryBackend::new());
        let config = EngineConfig::default().with_teardown_grace(Duration::ZERO);
        let timer = Arc::new(RecordingTimer::default());
        let manager = ConnectionManager::with_timer(backend.clone(), &config, timer);
        let admin = Viewer::new(UserId::new(), Role::Admin);
        let client = Viewer::new(UserId::new(), Role::Client);
        let key = ConversationKey::Requirement(RequirementId::new());
        backend.register_requirement(key, client.id);
        let tracker = UnreadTracker::new(admin, backend.clone(), manager.clone());
        Fixture {
            backend,
            manager,
            tracker,
            client,
            key,
        }
    }

    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    async fn wait_for_count(tracker: &UnreadTracker, key: ConversationKey, expected: u32) {
        let mut changes = tracker.changes();
        let reached = changes.wait_for(|s| s.count(key) == expected);
        tokio::time::timeout(Duration::from_secs(5), reached)
            .await
            .expect("count never reached")
            .expect("tracker dropped");
    }

    #[tokio::test]
    async fn seeds_and_subscribes_to_every_conversation() {
        let f = fixture();
        f.backend.post_message(f.client, f.key, "before start").unwrap();

        f.tracker.start().await.unwrap();

        assert_eq!(f.tracker.phase(), TrackerPhase::Ready);
        assert_eq!(f.tracker.count(f.key), 1);
        assert!(f.tracker.has_new_message());
        assert_eq!(f.manager.listener_count(f.key), 1);
        assert_eq!(f.manager.listener_count(ConversationKey::General), 1);
    }

    #[tokio::test]
    async fn only_other_party_messages_count() {
        let f = fixture();
        f.tracker.start().await.unwrap();

        f.backend.post_message(f.tracker.viewer(), f.key, "my own").unwrap();
        let colleague = Viewer::new(UserId::new(), Role::Admin);
        f.backend.post_message(colleague, f.key, "another admin").unwrap();
        settle().await;
        assert_eq!(f.tracker.count(f.key), 0);

        f.backend.post_message(f.client, f.key, "question").unwrap();
        wait_for_count(&f.tracker, f.key, 1).await;
        assert_eq!(f.tracker.total(), 1);
    }

    #[tokio::test]
    async fn a_message_is_counted_once_per_seed() {
        let f = fixture();
        f.tracker.start().await.unwrap();
        let message = f.backend.post_message(f.client, f.key, "hello").unwrap();
        wait_for_count(&f.tracker, f.key, 1).await;

        f.tracker.inner.on_message(f.key, &message);
        assert_eq!(f.tracker.count(f.key), 1);
    }

    #[tokio::test]
    async fn mark_as_read_zeroes_and_persists() {
        let f = fixture();
        f.backend.post_message(f.client, f.key, "one").unwrap();
        f.backend.post_message(f.client, f.key, "two").unwrap();
        f.tracker.start().await.unwrap();
        assert_eq!(f.tracker.count(f.key), 2);

        f.tracker.mark_as_read(f.key).await.unwrap();
        assert_eq!(f.tracker.count(f.key), 0);
        assert!(!f.tracker.has_new_message());
        assert!(f.backend.read_cursor(f.tracker.viewer().id, f.key).is_some());

        f.tracker.resync().await.unwrap();
        assert_eq!(f.tracker.count(f.key), 0);
    }

    #[tokio::test]
    async fn failed_mark_as_read_rolls_back() {
        let f = fixture();
        f.backend.post_message(f.client, f.key, "unread").unwrap();
        f.tracker.start().await.unwrap();
        f.backend.fail_mark_read(true);

        let err = f.tracker.mark_as_read(f.key).await.unwrap_err();
        assert!(matches!(err, EngineError::Write(_)));
        assert_eq!(f.tracker.count(f.key), 1);
        assert!(f.tracker.has_new_message());
    }

    #[tokio::test]
    async fn failed_seed_leaves_tracker_uninitialized() {
        let f = fixture();
        f.backend.fail_unread_counts(true);

        let err = f.tracker.start().await.unwrap_err();
        assert!(matches!(err, EngineError::Fetch(_)));
        assert_eq!(f.tracker.phase(), TrackerPhase::Uninitialized);

        f.backend.fail_unread_counts(false);
        f.tracker.start().await.unwrap();
        assert_eq!(f.tracker.phase(), TrackerPhase::Ready);
    }

    #[tokio::test]
    async fn reconnect_counts_messages_missed_while_down() {
        let f = fixture();
        f.backend.post_message(f.client, f.key, "seen live").unwrap();
        f.tracker.start().await.unwrap();
        assert_eq!(f.tracker.count(f.key), 1);

        f.backend.set_feeds_available(false);
        f.backend.drop_feeds();
        settle().await;
        assert_eq!(f.manager.state(f.key), Some(ConnectionState::Error));

        for i in 0..3 {
            f.backend.post_message(f.client, f.key, &format!("missed {i}")).unwrap();
        }
        f.backend.set_feeds_available(true);
        f.manager.reconnect(f.key).await.unwrap();

        wait_for_count(&f.tracker, f.key, 4).await;
        settle().await;
        assert_eq!(f.tracker.count(f.key), 4);
    }

    #[tokio::test]
    async fn stop_releases_subscriptions() {
        let f = fixture();
        f.tracker.start().await.unwrap();
        f.tracker.stop().await;

        assert_eq!(f.tracker.phase(), TrackerPhase::Uninitialized);
        assert_eq!(f.manager.listener_count(f.key), 0);
        assert_eq!(f.manager.state(f.key), None);
        assert!(f.tracker.conversations().is_empty());
    }

    #[test]
    fn held_messages_count_only_past_the_seed_watermark() {
        let key = ConversationKey::Requirement(RequirementId::new());
        let seeded_at = Utc::now();
        let sighting = |created_at| Sighting {
            conversation: key,
            id: MessageId::new(),
            created_at,
        };
        let mut state = TrackerState {
            phase: TrackerPhase::Ready,
            seeds_in_flight: 1,
            ..TrackerState::default()
        };

        state.observe(sighting(seeded_at));
        state.observe(sighting(seeded_at + chrono::Duration::milliseconds(5)));
        assert_eq!(state.counts[&key], 2);

        let entry = UnreadEntry {
            conversation: key,
            count: 1,
            as_of: Some(seeded_at),
        };
        state.finish_seed(Some(&[entry]));
        assert_eq!(state.counts[&key], 2);
        assert!(state.held.is_empty());

        state.observe(sighting(seeded_at - chrono::Duration::milliseconds(5)));
        assert_eq!(state.counts[&key], 2);
    }

    #[test]
    fn reseed_keeps_conversations_being_marked_at_zero() {
        let key = ConversationKey::Requirement(RequirementId::new());
        let mut state = TrackerState::default();
        state.counts.insert(key, 3);

        assert_eq!(state.begin_marking(key), 3);
        state.reseed(&[UnreadEntry {
            conversation: key,
            count: 3,
            as_of: None,
        }]);
        assert_eq!(state.counts[&key], 0);

        state.finish_marking(key);
        assert!(state.marking.is_empty());
    }

    #[tokio::test]
    async fn resync_tracks_conversations_created_after_start() {
        let f = fixture();
        f.tracker.start().await.unwrap();

        let fresh = ConversationKey::Requirement(RequirementId::new());
        f.backend.register_requirement(fresh, f.client.id);
        f.backend.post_message(f.client, fresh, "new requirement").unwrap();
        settle().await;
        assert_eq!(f.tracker.count(fresh), 0);

        f.tracker.resync().await.unwrap();
        assert_eq!(f.tracker.count(fresh), 1);
        assert_eq!(f.manager.listener_count(fresh), 1);
        assert!(f.tracker.conversations().contains(&fresh));

        f.backend.post_message(f.client, fresh, "follow up").unwrap();
        wait_for_count(&f.tracker, fresh, 2).await;
        assert_eq!(f.tracker.phase(), TrackerPhase::Ready);
    }

    #[tokio::test]
    async fn failed_subscriptions_are_retried_by_the_next_resync() {
        let f = fixture();
        f.backend.set_offline(true);
        f.tracker.start().await.unwrap();
        assert_eq!(f.tracker.phase(), TrackerPhase::Ready);
        assert!(f.tracker.conversations().is_empty());

        f.backend.set_offline(false);
        f.tracker.resync().await.unwrap();
        assert_eq!(f.manager.listener_count(f.key), 1);

        f.backend.post_message(f.client, f.key, "now live").unwrap();
        wait_for_count(&f.tracker, f.key, 1).await;
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_refresh_discovers_new_conversations() {
        let f = fixture();
        f.tracker.start().await.unwrap();
        let refresh = f.tracker.spawn_refresh(Duration::from_secs(30));

        let fresh = ConversationKey::Requirement(RequirementId::new());
        f.backend.register_requirement(fresh, f.client.id);
        f.backend.post_message(f.client, fresh, "while signed in").unwrap();

        tokio::time::sleep(Duration::from_secs(31)).await;
        wait_for_count(&f.tracker, fresh, 1).await;
        assert_eq!(f.manager.listener_count(fresh), 1);
        refresh.abort();
    }
}
