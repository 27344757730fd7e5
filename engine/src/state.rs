use crate::backend::Backend;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::messaging::{HistoryPage, MessagePipeline, OutgoingMessage, SendReport};
use crate::notifications::UnreadTracker;
use crate::realtime::{ChannelEvent, ConnectionManager, Subscription, Timer, TokioTimer};
use reqchat_messaging::{ConnectionState, ConversationKey, Viewer};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct SignedIn {
    viewer: Viewer,
    tracker: UnreadTracker,
    health: JoinHandle<()>,
    refresh: JoinHandle<()>,
}

/// Composition root handed to presentation code: one pool, one tracker.
pub struct ChatEngine {
    config: EngineConfig,
    backend: Backend,
    connections: ConnectionManager,
    session: RwLock<Option<SignedIn>>,
}

impl ChatEngine {
    pub fn new(config: EngineConfig, backend: Backend) -> Arc<Self> {
        Self::with_timer(config, backend, Arc::new(TokioTimer))
    }

    pub fn with_timer(config: EngineConfig, backend: Backend, timer: Arc<dyn Timer>) -> Arc<Self> {
        let connections = ConnectionManager::with_timer(Arc::clone(&backend.feed), &config, timer);
        Arc::new(Self {
            config,
            backend,
            connections,
            session: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub async fn viewer(&self) -> Option<Viewer> {
        self.session.read().await.as_ref().map(|s| s.viewer)
    }

    pub async fn tracker(&self) -> Option<UnreadTracker> {
        self.session.read().await.as_ref().map(|s| s.tracker.clone())
    }

    /// Starts unread tracking and health checks for the current user.
    pub async fn sign_in(&self) -> Result<Viewer> {
        let mut session = self.session.write().await;
        if let Some(active) = session.as_ref() {
            return Ok(active.viewer);
        }
        let viewer = self
            .backend
            .identity
            .current_user()
            .ok_or(EngineError::Unauthenticated)?;

        let receipts = Arc::clone(&self.backend.receipts);
        let tracker = UnreadTracker::new(viewer, receipts, self.connections.clone());
        tracker.start().await?;
        let health = self
            .connections
            .spawn_health_check(self.config.health_check_interval);
        let refresh = tracker.spawn_refresh(self.config.unread_refresh_interval);

        info!(viewer = %viewer.id, role = ?viewer.role, "signed in");
        *session = Some(SignedIn {
            viewer,
            tracker,
            health,
            refresh,
        });
        Ok(viewer)
    }

    pub async fn sign_out(&self) {
        let Some(active) = self.session.write().await.take() else {
            return;
        };
        active.health.abort();
        active.refresh.abort();
        active.tracker.stop().await;
        info!(viewer = %active.viewer.id, "signed out");
    }

    /// Subscribes, loads the newest page, and marks the conversation read.
    pub async fn open_conversation(&self, key: ConversationKey) -> Result<ConversationView> {
        let (viewer, tracker) = {
            let session = self.session.read().await;
            let active = session.as_ref().ok_or(EngineError::Unauthenticated)?;
            (active.viewer, active.tracker.clone())
        };

        let subscription = self.connections.subscribe(key).await?;
        let pipeline = Arc::new(MessagePipeline::new(
            key,
            viewer,
            &self.backend,
            self.config.attachments.clone(),
        ));
        let view = ConversationView::start(
            pipeline,
            self.connections.clone(),
            subscription,
            self.config.history_page_size,
        );

        if let Err(err) = view.load_older().await {
            view.close().await;
            return Err(err);
        }

        if tracker.count(key) > 0 {
            if let Err(err) = tracker.mark_as_read(key).await {
                warn!(conversation = %key, %err, "could not mark conversation read on open");
            }
        }
        debug!(conversation = %key, "conversation opened");
        Ok(view)
    }
}

impl std::fmt::Debug for ChatEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatEngine")
            .field("config", &self.config)
            .field("connections", &self.connections)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct Paging {
    next_offset: usize,
    has_more: bool,
}

/// An open conversation screen: live pipeline plus history paging.
#[derive(Debug)]
pub struct ConversationView {
    pipeline: Arc<MessagePipeline>,
    connections: ConnectionManager,
    paging: Mutex<Paging>,
    page_size: usize,
    shutdown: watch::Sender<()>,
    pump: JoinHandle<()>,
}

impl ConversationView {
    fn start(
        pipeline: Arc<MessagePipeline>,
        connections: ConnectionManager,
        subscription: Subscription,
        page_size: usize,
    ) -> Self {
        let (shutdown, stopped) = watch::channel(());
        let pump = tokio::spawn(pump_events(
            Arc::clone(&pipeline),
            connections.clone(),
            subscription,
            stopped,
        ));
        Self {
            pipeline,
            connections,
            paging: Mutex::new(Paging {
                next_offset: 0,
                has_more: true,
            }),
            page_size,
            shutdown,
            pump,
        }
    }

    pub fn pipeline(&self) -> &MessagePipeline {
        &self.pipeline
    }

    pub fn conversation(&self) -> ConversationKey {
        self.pipeline.conversation()
    }

    /// Loads the next page back in time; empty once history is exhausted.
    pub async fn load_older(&self) -> Result<HistoryPage> {
        let mut paging = self.paging.lock().await;
        if !paging.has_more {
            return Ok(HistoryPage {
                messages: Vec::new(),
                has_more: false,
            });
        }
        let page = self
            .pipeline
            .load_history(paging.next_offset, self.page_size)
            .await?;
        paging.next_offset += page.messages.len();
        paging.has_more = page.has_more;
        Ok(page)
    }

    pub async fn send(&self, outgoing: OutgoingMessage) -> Result<SendReport> {
        self.pipeline.send(outgoing).await
    }

    pub fn state(&self) -> ConnectionState {
        self.connections
            .state(self.conversation())
            .unwrap_or(ConnectionState::Disconnected)
    }

    /// Closes the pipeline and releases the subscription.
    pub async fn close(self) {
        self.pipeline.close().await;
        drop(self.shutdown);
        if let Err(err) = self.pump.await {
            warn!(%err, "conversation pump ended abnormally");
        }
    }
}

async fn pump_events(
    pipeline: Arc<MessagePipeline>,
    connections: ConnectionManager,
    mut subscription: Subscription,
    mut stopped: watch::Receiver<()>,
) {
    loop {
        tokio::select! {
            event = subscription.recv() => match event {
                Some(ChannelEvent::Event(event)) => {
                    pipeline.apply_stream_event(event).await;
                }
                Some(ChannelEvent::Status(state)) => {
                    let conversation = subscription.conversation();
                    debug!(%conversation, ?state, "conversation stream status");
                }
                None => break,
            },
            _ = stopped.changed() => break,
        }
    }
    connections.unsubscribe(subscription);
}
