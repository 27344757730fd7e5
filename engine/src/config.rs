use crate::messaging::AttachmentPolicy;
use crate::realtime::BackoffPolicy;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Runtime configuration for the sync engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How often live subscriptions are checked for a dead transport.
    pub health_check_interval: Duration,
    /// How often unread counts are re-seeded and new conversations picked up.
    pub unread_refresh_interval: Duration,
    /// Reconnect schedule for dropped or failed subscriptions.
    pub backoff: BackoffPolicy,
    /// Delay before an unused subscription is torn down.
    pub teardown_grace: Duration,
    /// Max age of delivery dedup entries.
    pub cache_max_age: Duration,
    pub history_page_size: usize,
    pub attachments: AttachmentPolicy,
}

impl EngineConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let health_check_interval = env_parsed("REQCHAT_HEALTH_CHECK_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.health_check_interval);
        let unread_refresh_interval = env_parsed("REQCHAT_UNREAD_REFRESH_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.unread_refresh_interval);
        let base = env_parsed("REQCHAT_BACKOFF_BASE_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.backoff.base);
        let cap = env_parsed("REQCHAT_BACKOFF_CAP_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.backoff.cap);
        let max_attempts =
            env_parsed("REQCHAT_BACKOFF_MAX_ATTEMPTS")?.unwrap_or(defaults.backoff.max_attempts);
        let teardown_grace = env_parsed("REQCHAT_TEARDOWN_GRACE_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.teardown_grace);
        let cache_max_age = env_parsed("REQCHAT_CACHE_MAX_AGE_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.cache_max_age);
        let history_page_size =
            env_parsed("REQCHAT_HISTORY_PAGE_SIZE")?.unwrap_or(defaults.history_page_size);

        let mut attachments = defaults.attachments;
        if let Some(max_bytes) = env_parsed("REQCHAT_MAX_ATTACHMENT_BYTES")? {
            attachments.max_bytes = max_bytes;
        }

        anyhow::ensure!(history_page_size > 0, "REQCHAT_HISTORY_PAGE_SIZE must be positive");
        anyhow::ensure!(base <= cap, "backoff base delay exceeds its cap");
        anyhow::ensure!(
            !unread_refresh_interval.is_zero(),
            "REQCHAT_UNREAD_REFRESH_SECS must be positive"
        );

        Ok(Self {
            health_check_interval,
            unread_refresh_interval,
            backoff: BackoffPolicy {
                base,
                cap,
                max_attempts,
            },
            teardown_grace,
            cache_max_age,
            history_page_size,
            attachments,
        })
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_unread_refresh_interval(mut self, period: Duration) -> Self {
        self.unread_refresh_interval = period;
        self
    }

    pub fn with_teardown_grace(mut self, grace: Duration) -> Self {
        self.teardown_grace = grace;
        self
    }

    pub fn with_history_page_size(mut self, size: usize) -> Self {
        self.history_page_size = size;
        self
    }

    pub fn with_attachments(mut self, policy: AttachmentPolicy) -> Self {
        self.attachments = policy;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(30),
            unread_refresh_interval: Duration::from_secs(60),
            backoff: BackoffPolicy::default(),
            teardown_grace: Duration::from_secs(2),
            cache_max_age: Duration::from_secs(5 * 60),
            history_page_size: 20,
            attachments: AttachmentPolicy::default(),
        }
    }
}

fn env_parsed<T>(key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("invalid {key}={raw:?}: {e}")),
        Err(_) => Ok(None),
    }
}
