//! Pool of change streams, one per conversation, shared by every local listener.

use super::backoff::{retry_with_backoff, BackoffPolicy, Timer, TokioTimer};
use super::stream::{ChangeStreamClient, StreamClosed};
use crate::backend::{BackendError, ChangeFeed, Liveness};
use crate::cache::{Clock, MessageCache, SystemClock};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use reqchat_messaging::{ConnectionState, ConversationKey, StreamEvent};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

pub type ListenerId = u64;

/// What a listener receives: stream inserts and status transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Event(StreamEvent),
    Status(ConnectionState),
}

/// A registered listener on one conversation's stream.
#[derive(Debug)]
pub struct Subscription {
    id: ListenerId,
    conversation: ConversationKey,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    status: watch::Receiver<ConnectionState>,
}

impl Subscription {
    pub fn conversation(&self) -> ConversationKey {
        self.conversation
    }

    /// Next event; `None` once the underlying subscription is gone for good.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ChannelEvent> {
        self.events.try_recv().ok()
    }

    pub fn state(&self) -> ConnectionState {
        *self.status.borrow()
    }
}

#[derive(Debug, thiserror::Error)]
enum DialError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("subscription was replaced while connecting")]
    Superseded,
}

impl DialError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Backend(err) if err.is_retryable())
    }
}

enum Plan {
    Ready,
    Wait(watch::Receiver<ConnectionState>),
    Dial(u64),
}

struct Channel {
    state: ConnectionState,
    status: watch::Sender<ConnectionState>,
    listeners: HashMap<ListenerId, mpsc::UnboundedSender<ChannelEvent>>,
    generation: u64,
    liveness: Option<Liveness>,
    pump: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
    teardown: Option<JoinHandle<()>>,
}

impl Channel {
    fn new(generation: u64) -> Self {
        let (status, _) = watch::channel(ConnectionState::Connecting);
        Self {
            state: ConnectionState::Connecting,
            status,
            listeners: HashMap::new(),
            generation,
            liveness: None,
            pump: None,
            reconnect: None,
            teardown: None,
        }
    }

    /// Records a state change and tells every listener about it.
    fn transition(&mut self, key: ConversationKey, state: ConnectionState) {
        if self.state == state {
            return;
        }
        debug!(conversation = %key, from = ?self.state, to = ?state, "subscription state changed");
        self.state = state;
        self.status.send_replace(state);
        self.broadcast(ChannelEvent::Status(state));
    }

    fn broadcast(&mut self, event: ChannelEvent) {
        self.listeners.retain(|_, tx| tx.send(event.clone()).is_ok());
    }

    fn stop_tasks(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        if let Some(reconnect) = self.reconnect.take() {
            reconnect.abort();
        }
        self.liveness = None;
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.stop_tasks();
        if let Some(teardown) = self.teardown.take() {
            teardown.abort();
        }
    }
}

struct Inner {
    feed: Arc<dyn ChangeFeed>,
    timer: Arc<dyn Timer>,
    backoff: BackoffPolicy,
    grace: Duration,
    delivered: MessageCache<(ConversationKey, String), ()>,
    channels: Mutex<HashMap<ConversationKey, Channel>>,
    listener_ids: AtomicU64,
    generations: AtomicU64,
    streams_opened: AtomicUsize,
}

impl Inner {
    fn channels(&self) -> MutexGuard<'_, HashMap<ConversationKey, Channel>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn is_current(&self, key: ConversationKey, generation: u64) -> bool {
        self.channels()
            .get(&key)
            .map_or(false, |channel| channel.generation == generation)
    }

    async fn open_stream(
        &self,
        key: ConversationKey,
        generation: u64,
    ) -> std::result::Result<ChangeStreamClient, DialError> {
        let connect = |attempt: u32| async move {
            if !self.is_current(key, generation) {
                return Err(DialError::Superseded);
            }
            if attempt > 0 {
                debug!(conversation = %key, attempt, "redialing change stream");
            }
            let client = ChangeStreamClient::connect(self.feed.as_ref(), key).await?;
            self.streams_opened.fetch_add(1, Ordering::SeqCst);
            Ok(client)
        };
        retry_with_backoff(
            &self.backoff,
            self.timer.as_ref(),
            DialError::is_retryable,
            connect,
        )
        .await
    }

    /// Dials with backoff and installs the stream, or parks the channel in `Error`.
    async fn dial(self: &Arc<Self>, key: ConversationKey, generation: u64) -> Result<()> {
        match self.open_stream(key, generation).await {
            Ok(client) => {
                if self.install(key, generation, client) {
                    Ok(())
                } else {
                    Err(EngineError::Transport(format!(
                        "subscription for {key} was torn down while connecting"
                    )))
                }
            }
            Err(err) => {
                warn!(conversation = %key, error = %err, "change stream unavailable");
                let mut channels = self.channels();
                if let Some(channel) = channels.get_mut(&key) {
                    if channel.generation == generation {
                        channel.reconnect = None;
                        channel.transition(key, ConnectionState::Error);
                    }
                }
                Err(EngineError::transport(err))
            }
        }
    }

    fn install(
        self: &Arc<Self>,
        key: ConversationKey,
        generation: u64,
        client: ChangeStreamClient,
    ) -> bool {
        let mut channels = self.channels();
        let Some(channel) = channels.get_mut(&key) else {
            return false;
        };
        if channel.generation != generation {
            return false;
        }

        channel.liveness = Some(client.liveness());
        channel.reconnect = None;
        let inner = Arc::clone(self);
        channel.pump = Some(tokio::spawn(inner.pump(key, generation, client)));
        channel.transition(key, ConnectionState::Connected);
        info!(conversation = %key, listeners = channel.listeners.len(), "subscription connected");
        true
    }

    async fn pump(
        self: Arc<Self>,
        key: ConversationKey,
        generation: u64,
        mut client: ChangeStreamClient,
    ) {
        loop {
            match client.next_event().await {
                Ok(event) => {
                    if !self.deliver(key, generation, event) {
                        break;
                    }
                }
                Err(closed) => {
                    self.handle_drop(key, generation, closed);
                    break;
                }
            }
        }
    }

    /// Fans an event out once; returns false when this stream is obsolete.
    fn deliver(
        self: &Arc<Self>,
        key: ConversationKey,
        generation: u64,
        event: StreamEvent,
    ) -> bool {
        let dedup = (key, event.dedup_key());
        if self.delivered.has(&dedup) {
            debug!(conversation = %key, event = %dedup.1, "skipping already delivered event");
            return true;
        }
        self.delivered.set(dedup, ());

        let mut channels = self.channels();
        let Some(channel) = channels.get_mut(&key) else {
            return false;
        };
        if channel.generation != generation {
            return false;
        }
        let had_listeners = !channel.listeners.is_empty();
        channel.broadcast(ChannelEvent::Event(event));
        if had_listeners && channel.listeners.is_empty() {
            self.release_if_idle(&mut channels, key);
        }
        true
    }

    fn handle_drop(self: &Arc<Self>, key: ConversationKey, generation: u64, closed: StreamClosed) {
        let mut channels = self.channels();
        let Some(channel) = channels.get_mut(&key) else {
            return;
        };
        if channel.generation != generation || channel.state != ConnectionState::Connected {
            return;
        }
        warn!(conversation = %key, reason = %closed, "subscription dropped, reconnecting");
        channel.pump = None;
        channel.liveness = None;
        channel.transition(key, ConnectionState::Disconnected);

        if channel.listeners.is_empty() {
            channels.remove(&key);
            return;
        }
        let inner = Arc::clone(self);
        channel.reconnect = Some(tokio::spawn(async move {
            let _ = inner.dial(key, generation).await;
        }));
    }

    fn remove_listener(self: &Arc<Self>, key: ConversationKey, id: ListenerId) {
        let mut channels = self.channels();
        if let Some(channel) = channels.get_mut(&key) {
            channel.listeners.remove(&id);
        }
        self.release_if_idle(&mut channels, key);
    }

    fn release_if_idle(
        self: &Arc<Self>,
        channels: &mut HashMap<ConversationKey, Channel>,
        key: ConversationKey,
    ) {
        let Some(channel) = channels.get_mut(&key) else {
            return;
        };
        if !channel.listeners.is_empty() || channel.teardown.is_some() {
            return;
        }
        if self.grace.is_zero() || channel.state == ConnectionState::Error {
            channels.remove(&key);
            debug!(conversation = %key, "subscription torn down");
            return;
        }
        let inner = Arc::clone(self);
        channel.teardown = Some(tokio::spawn(inner.teardown_after_grace(key)));
    }

    async fn teardown_after_grace(self: Arc<Self>, key: ConversationKey) {
        self.timer.sleep(self.grace).await;
        let mut channels = self.channels();
        let idle = channels
            .get(&key)
            .map_or(false, |channel| channel.listeners.is_empty());
        if idle {
            if let Some(mut channel) = channels.remove(&key) {
                // Detach ourselves so dropping the channel does not abort this task.
                drop(channel.teardown.take());
            }
            debug!(conversation = %key, "idle subscription torn down after grace period");
        }
    }
}

async fn wait_for_outcome(
    mut status: watch::Receiver<ConnectionState>,
    key: ConversationKey,
) -> Result<()> {
    let outcome = status
        .wait_for(|state| matches!(state, ConnectionState::Connected | ConnectionState::Error))
        .await
        .map(|state| *state);
    match outcome {
        Ok(ConnectionState::Connected) => Ok(()),
        _ => Err(EngineError::Transport(format!("subscription for {key} failed"))),
    }
}

/// Owns every change stream in the process. Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(feed: Arc<dyn ChangeFeed>, config: &EngineConfig) -> Self {
        Self::with_timer(feed, config, Arc::new(TokioTimer))
    }

    pub fn with_timer(
        feed: Arc<dyn ChangeFeed>,
        config: &EngineConfig,
        timer: Arc<dyn Timer>,
    ) -> Self {
        Self::assemble(feed, config, timer, Arc::new(SystemClock))
    }

    fn assemble(
        feed: Arc<dyn ChangeFeed>,
        config: &EngineConfig,
        timer: Arc<dyn Timer>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                feed,
                timer,
                backoff: config.backoff,
                grace: config.teardown_grace,
                delivered: MessageCache::with_clock(config.cache_max_age, clock),
                channels: Mutex::new(HashMap::new()),
                listener_ids: AtomicU64::new(0),
                generations: AtomicU64::new(0),
                streams_opened: AtomicUsize::new(0),
            }),
        }
    }

    /// Registers a listener, dialing the conversation's stream if none is live.
    ///
    /// Resolves once the shared stream is connected; the new subscription's
    /// queue always starts with that `Connected` status, whether this call
    /// dialed, waited on another dial, or joined a live stream. If dialing
    /// exhausts its retries (or the caller is offline) the listener is dropped
    /// and a transport error returned.
    pub async fn subscribe(&self, key: ConversationKey) -> Result<Subscription> {
        let id = self.inner.listener_ids.fetch_add(1, Ordering::SeqCst);
        let (tx, events) = mpsc::unbounded_channel();

        let (plan, status) = {
            let mut channels = self.inner.channels();
            let mut fresh = false;
            let channel = channels.entry(key).or_insert_with(|| {
                fresh = true;
                Channel::new(self.inner.next_generation())
            });
            if let Some(teardown) = channel.teardown.take() {
                teardown.abort();
                debug!(conversation = %key, "reusing subscription inside grace period");
            }
            if !fresh && channel.state == ConnectionState::Connected {
                let _ = tx.send(ChannelEvent::Status(ConnectionState::Connected));
            }
            channel.listeners.insert(id, tx);

            let plan = if fresh {
                Plan::Dial(channel.generation)
            } else {
                match channel.state {
                    ConnectionState::Connected => Plan::Ready,
                    ConnectionState::Connecting | ConnectionState::Disconnected => {
                        Plan::Wait(channel.status.subscribe())
                    }
                    ConnectionState::Error => {
                        channel.stop_tasks();
                        channel.generation = self.inner.next_generation();
                        channel.transition(key, ConnectionState::Connecting);
                        Plan::Dial(channel.generation)
                    }
                }
            };
            (plan, channel.status.subscribe())
        };

        let outcome = match plan {
            Plan::Ready => Ok(()),
            Plan::Wait(status) => wait_for_outcome(status, key).await,
            Plan::Dial(generation) => self.inner.dial(key, generation).await,
        };

        match outcome {
            Ok(()) => {
                debug!(conversation = %key, listener = id, "listener subscribed");
                Ok(Subscription {
                    id,
                    conversation: key,
                    events,
                    status,
                })
            }
            Err(err) => {
                self.inner.remove_listener(key, id);
                Err(err)
            }
        }
    }

    /// Drops a listener; the stream itself goes after the grace period once idle.
    pub fn unsubscribe(&self, subscription: Subscription) {
        debug!(
            conversation = %subscription.conversation,
            listener = subscription.id,
            "listener unsubscribed"
        );
        self.inner.remove_listener(subscription.conversation, subscription.id);
    }

    /// Caller-initiated retry for a subscription parked in `Error`.
    pub async fn reconnect(&self, key: ConversationKey) -> Result<()> {
        let plan = {
            let mut channels = self.inner.channels();
            let Some(channel) = channels.get_mut(&key) else {
                return Err(EngineError::Transport(format!("no subscription for {key}")));
            };
            match channel.state {
                ConnectionState::Connected => Plan::Ready,
                ConnectionState::Connecting | ConnectionState::Disconnected => {
                    Plan::Wait(channel.status.subscribe())
                }
                ConnectionState::Error => {
                    channel.stop_tasks();
                    channel.generation = self.inner.next_generation();
                    channel.transition(key, ConnectionState::Connecting);
                    Plan::Dial(channel.generation)
                }
            }
        };

        match plan {
            Plan::Ready => Ok(()),
            Plan::Wait(status) => wait_for_outcome(status, key).await,
            Plan::Dial(generation) => {
                info!(conversation = %key, "manual reconnect requested");
                self.inner.dial(key, generation).await
            }
        }
    }

    /// One health pass: recreate every connected stream whose transport died
    /// and reclaim expired delivery dedup entries.
    pub fn check_health(&self) -> usize {
        let retained = self.inner.delivered.purge_expired();
        debug!(retained, "purged expired delivery records");

        let mut channels = self.inner.channels();
        let mut recreated = 0;
        for (key, channel) in channels.iter_mut() {
            let dead = channel.state == ConnectionState::Connected
                && channel.liveness.as_ref().map_or(true, |l| !l.is_alive());
            if !dead {
                continue;
            }
            warn!(conversation = %key, "health check found a dead stream, recreating");
            channel.stop_tasks();
            channel.generation = self.inner.next_generation();
            channel.transition(*key, ConnectionState::Disconnected);

            let inner = Arc::clone(&self.inner);
            let (key, generation) = (*key, channel.generation);
            channel.reconnect = Some(tokio::spawn(async move {
                let _ = inner.dial(key, generation).await;
            }));
            recreated += 1;
        }
        recreated
    }

    /// Runs [`check_health`](Self::check_health) every `period` until the pool is dropped.
    pub fn spawn_health_check(&self, period: Duration) -> JoinHandle<()> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; streams were just dialed.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let recreated = ConnectionManager { inner }.check_health();
                if recreated > 0 {
                    info!(recreated, "health check recreated dead streams");
                }
            }
        })
    }

    pub fn state(&self, key: ConversationKey) -> Option<ConnectionState> {
        self.inner.channels().get(&key).map(|channel| channel.state)
    }

    pub fn listener_count(&self, key: ConversationKey) -> usize {
        self.inner
            .channels()
            .get(&key)
            .map_or(0, |channel| channel.listeners.len())
    }

    pub fn conversations(&self) -> Vec<ConversationKey> {
        self.inner.channels().keys().copied().collect()
    }

    /// How many change streams have been opened over the pool's lifetime.
    pub fn streams_opened(&self) -> usize {
        self.inner.streams_opened.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("conversations", &self.conversations())
            .field("streams_opened", &self.streams_opened())
            .finish()
    }
}
