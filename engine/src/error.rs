/// Errors surfaced by the sync engine to presentation code.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Subscription setup or drop that outlived the retry budget.
    #[error("transport error: {0}")]
    Transport(String),
    /// A send or mark-as-read write failed; optimistic state was rolled back.
    #[error("write failed: {0}")]
    Write(String),
    /// History or unread-seed read failed; retry is an explicit user action.
    #[error("fetch failed: {0}")]
    Fetch(String),
    /// Rejected before any network call.
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("no signed-in user")]
    Unauthenticated,
}

impl EngineError {
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }

    pub fn write(err: impl std::fmt::Display) -> Self {
        Self::Write(err.to_string())
    }

    pub fn fetch(err: impl std::fmt::Display) -> Self {
        Self::Fetch(err.to_string())
    }

    /// Whether offering the user a retry makes sense.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Validation(_) | Self::Unauthenticated)
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
