pub mod backend;
pub mod cache;
pub mod config;
pub mod error;
pub mod messaging;
pub mod notifications;
pub mod realtime;
pub mod state;

pub use backend::{Backend, MemoryBackend};
pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use messaging::{MessagePipeline, OutgoingFile, OutgoingMessage, SendReport};
pub use notifications::{TrackerPhase, UnreadSnapshot, UnreadTracker};
pub use realtime::{ChannelEvent, ConnectionManager, Subscription};
pub use state::{ChatEngine, ConversationView};

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
