use async_trait::async_trait;
use chrono::Utc;
use reqchat_contracts::{settle, wait_for_unread, InstantTimer, Portal};
use reqchat_engine::backend::{Backend, BackendResult, MemoryBackend, ReadReceipts};
use reqchat_engine::{ChatEngine, EngineError, OutgoingMessage, TrackerPhase};
use reqchat_messaging::{
    ConnectionState, ConversationKey, RequirementId, Role, UnreadEntry, UserId, Viewer,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Unread procedure whose response arrives well after the server computed it.
struct SlowReceipts {
    backend: Arc<MemoryBackend>,
    slow: AtomicBool,
    computed: Notify,
}

impl SlowReceipts {
    fn new(backend: Arc<MemoryBackend>) -> Self {
        Self {
            backend,
            slow: AtomicBool::new(false),
            computed: Notify::new(),
        }
    }
}

#[async_trait]
impl ReadReceipts for SlowReceipts {
    async fn get_unread_counts(&self, viewer: &Viewer) -> BackendResult<Vec<UnreadEntry>> {
        let counts = self.backend.get_unread_counts(viewer).await;
        if self.slow.load(Ordering::SeqCst) {
            self.computed.notify_one();
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        counts
    }

    async fn mark_read(&self, viewer: UserId, conversation: ConversationKey) -> BackendResult<()> {
        self.backend.mark_read(viewer, conversation).await
    }
}

#[tokio::test]
async fn read_conversation_stays_at_zero_until_the_other_side_writes() {
    let portal = Portal::new();
    let engine = portal.signed_in(portal.admin).await;
    let tracker = engine.tracker().await.unwrap();
    let key = portal.requirement;

    portal.backend.post_message(portal.client, key, "ping").unwrap();
    wait_for_unread(&tracker, key, 1).await;

    tracker.mark_as_read(key).await.unwrap();
    assert_eq!(tracker.count(key), 0);

    portal.backend.post_message(portal.admin, key, "my reply").unwrap();
    let colleague = Viewer::new(UserId::new(), Role::Admin);
    portal.backend.post_message(colleague, key, "colleague note").unwrap();
    settle().await;
    assert_eq!(tracker.count(key), 0);
    assert!(!tracker.has_new_message());

    portal.backend.post_message(portal.client, key, "pong").unwrap();
    wait_for_unread(&tracker, key, 1).await;
    assert!(tracker.has_new_message());
}

#[tokio::test]
async fn reconnect_counts_each_missed_message_exactly_once() {
    let portal = Portal::new();
    let engine = portal.signed_in(portal.admin).await;
    let tracker = engine.tracker().await.unwrap();
    let key = portal.requirement;

    portal.backend.post_message(portal.client, key, "live").unwrap();
    wait_for_unread(&tracker, key, 1).await;

    portal.backend.set_feeds_available(false);
    portal.backend.drop_feeds();
    settle().await;
    assert_eq!(engine.connections().state(key), Some(ConnectionState::Error));

    const MISSED: u32 = 4;
    for i in 0..MISSED {
        portal
            .backend
            .post_message(portal.client, key, &format!("while offline {i}"))
            .unwrap();
    }
    settle().await;
    assert_eq!(tracker.count(key), 1);

    portal.backend.set_feeds_available(true);
    engine.connections().reconnect(key).await.unwrap();
    wait_for_unread(&tracker, key, 1 + MISSED).await;

    settle().await;
    assert_eq!(tracker.count(key), 1 + MISSED);

    portal.backend.post_message(portal.client, key, "back online").unwrap();
    wait_for_unread(&tracker, key, 2 + MISSED).await;
}

#[tokio::test]
async fn failed_cursor_write_restores_the_badge() {
    let portal = Portal::new();
    let engine = portal.signed_in(portal.admin).await;
    let tracker = engine.tracker().await.unwrap();
    let key = portal.requirement;

    portal.backend.post_message(portal.client, key, "unread").unwrap();
    wait_for_unread(&tracker, key, 1).await;
    portal.backend.fail_mark_read(true);

    let err = tracker.mark_as_read(key).await.unwrap_err();
    assert!(matches!(err, EngineError::Write(_)));
    assert_eq!(tracker.count(key), 1);
}

#[tokio::test]
async fn sign_in_requires_a_seed() {
    let portal = Portal::new();
    portal.backend.fail_unread_counts(true);
    let engine = portal.engine_for(portal.admin);

    assert!(matches!(engine.sign_in().await, Err(EngineError::Fetch(_))));
    assert!(engine.tracker().await.is_none());

    portal.backend.fail_unread_counts(false);
    engine.sign_in().await.unwrap();
    let tracker = engine.tracker().await.unwrap();
    assert_eq!(tracker.phase(), TrackerPhase::Ready);

    engine.sign_out().await;
    assert!(engine.viewer().await.is_none());
    assert_eq!(engine.connections().listener_count(portal.requirement), 0);
}

#[tokio::test]
async fn client_and_admin_scenario() {
    let portal = Portal::new();
    let key = portal.requirement;
    let client = portal.signed_in(portal.client).await;
    let admin = portal.signed_in(portal.admin).await;
    let admin_unread = admin.tracker().await.unwrap();

    let client_view = client.open_conversation(key).await.unwrap();
    client_view.send(OutgoingMessage::text("hello")).await.unwrap();
    wait_for_unread(&admin_unread, key, 1).await;

    let opened_at = Utc::now();
    let admin_view = admin.open_conversation(key).await.unwrap();
    assert_eq!(admin_unread.count(key), 0);
    let cursor = portal
        .backend
        .read_cursor(portal.admin.id, key)
        .expect("read cursor written on open");
    let skew = (cursor.last_read_at - opened_at).num_seconds().abs();
    assert!(skew <= 5, "cursor {} far from {}", cursor.last_read_at, opened_at);

    let follow_up = client_view
        .send(OutgoingMessage::text("are you there?"))
        .await
        .unwrap();
    assert!(follow_up.message.created_at > cursor.last_read_at);
    wait_for_unread(&admin_unread, key, 1).await;

    settle().await;
    let seen: Vec<String> = admin_view
        .pipeline()
        .snapshot()
        .await
        .into_iter()
        .map(|m| m.body)
        .collect();
    assert_eq!(seen, ["hello", "are you there?"]);

    client_view.close().await;
    admin_view.close().await;
}

#[tokio::test]
async fn messages_inserted_while_a_resync_is_in_flight_still_count() {
    let portal = Portal::new();
    let key = portal.requirement;
    let receipts = Arc::new(SlowReceipts::new(portal.backend.clone()));
    let backend = Backend {
        receipts: receipts.clone(),
        ..portal.backend_for(portal.admin)
    };
    let engine = ChatEngine::with_timer(Portal::config(), backend, Arc::new(InstantTimer));
    engine.sign_in().await.unwrap();
    let tracker = engine.tracker().await.unwrap();

    receipts.slow.store(true, Ordering::SeqCst);
    let resync = tokio::spawn({
        let tracker = tracker.clone();
        async move { tracker.resync().await }
    });
    receipts.computed.notified().await;
    portal.backend.post_message(portal.client, key, "raced the seed").unwrap();
    resync.await.unwrap().unwrap();

    wait_for_unread(&tracker, key, 1).await;
    settle().await;
    assert_eq!(tracker.count(key), 1);
    assert_eq!(tracker.phase(), TrackerPhase::Ready);
}

#[tokio::test(start_paused = true)]
async fn conversations_created_after_sign_in_are_tracked() {
    let portal = Portal::new();
    let config = Portal::config().with_unread_refresh_interval(Duration::from_secs(1));
    let backend = portal.backend_for(portal.admin);
    let engine = ChatEngine::with_timer(config, backend, Arc::new(InstantTimer));
    engine.sign_in().await.unwrap();
    let tracker = engine.tracker().await.unwrap();

    let fresh = ConversationKey::Requirement(RequirementId::new());
    portal.backend.register_requirement(fresh, portal.client.id);
    portal.backend.post_message(portal.client, fresh, "new requirement").unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;
    wait_for_unread(&tracker, fresh, 1).await;
    assert!(tracker.conversations().contains(&fresh));

    portal.backend.post_message(portal.client, fresh, "follow up").unwrap();
    wait_for_unread(&tracker, fresh, 2).await;
    engine.sign_out().await;
}

#[tokio::test]
async fn opening_a_read_conversation_writes_no_cursor() {
    let portal = Portal::new();
    let key = portal.requirement;
    let engine = portal.signed_in(portal.admin).await;
    let tracker = engine.tracker().await.unwrap();

    portal.backend.post_message(portal.admin, key, "note to self").unwrap();
    settle().await;
    assert_eq!(tracker.count(key), 0);

    let view = engine.open_conversation(key).await.unwrap();
    assert_eq!(view.pipeline().len().await, 1);
    assert!(portal.backend.read_cursor(portal.admin.id, key).is_none());
    view.close().await;
}
