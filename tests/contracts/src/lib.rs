//! Shared fixtures for the contract tests: one in-memory portal, many viewers.

use async_trait::async_trait;
use reqchat_engine::backend::{Backend, Identity, MemoryBackend};
use reqchat_engine::realtime::Timer;
use reqchat_engine::{ChatEngine, EngineConfig, UnreadTracker};
use reqchat_messaging::{ConversationKey, RequirementId, Role, UserId, Viewer};
use std::sync::Arc;
use std::time::Duration;

/// Backoff waits that complete immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct InstantTimer;

#[async_trait]
impl Timer for InstantTimer {
    async fn sleep(&self, _duration: Duration) {
        tokio::task::yield_now().await;
    }
}

#[derive(Debug)]
struct FixedIdentity(Viewer);

impl Identity for FixedIdentity {
    fn current_user(&self) -> Option<Viewer> {
        Some(self.0)
    }
}

/// A backend with one requirement owned by `client` and one `admin`.
pub struct Portal {
    pub backend: Arc<MemoryBackend>,
    pub requirement: ConversationKey,
    pub client: Viewer,
    pub admin: Viewer,
}

impl Portal {
    pub fn new() -> Self {
        let backend = Arc::new(MemoryBackend::new());
        let client = Viewer::new(UserId::new(), Role::Client);
        let admin = Viewer::new(UserId::new(), Role::Admin);
        let requirement = ConversationKey::Requirement(RequirementId::new());
        backend.register_requirement(requirement, client.id);
        Self {
            backend,
            requirement,
            client,
            admin,
        }
    }

    pub fn config() -> EngineConfig {
        EngineConfig::default().with_teardown_grace(Duration::ZERO)
    }

    /// Backend handles as seen by `viewer`'s device.
    pub fn backend_for(&self, viewer: Viewer) -> Backend {
        Backend {
            identity: Arc::new(FixedIdentity(viewer)),
            ..Backend::from_shared(self.backend.clone())
        }
    }

    pub fn engine_for(&self, viewer: Viewer) -> Arc<ChatEngine> {
        ChatEngine::with_timer(Self::config(), self.backend_for(viewer), Arc::new(InstantTimer))
    }

    pub async fn signed_in(&self, viewer: Viewer) -> Arc<ChatEngine> {
        let engine = self.engine_for(viewer);
        engine.sign_in().await.expect("sign in");
        engine
    }
}

impl Default for Portal {
    fn default() -> Self {
        Self::new()
    }
}

/// Lets spawned pumps drain whatever is queued.
pub async fn settle() {
    for _ in 0..100 {
        tokio::task::yield_now().await;
    }
}

/// Waits until the tracker reports `expected` for `key`.
pub async fn wait_for_unread(tracker: &UnreadTracker, key: ConversationKey, expected: u32) {
    let mut changes = tracker.changes();
    let reached = tokio::time::timeout(
        Duration::from_secs(5),
        changes.wait_for(|snapshot| snapshot.count(key) == expected),
    )
    .await;
    assert!(
        matches!(reached, Ok(Ok(_))),
        "unread count for {key} never reached {expected}, now {}",
        tracker.count(key)
    );
}
