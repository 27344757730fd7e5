//! Live delivery: one shared change stream per conversation, with reconnects.

pub mod backoff;
pub mod manager;
pub mod stream;

pub use backoff::{retry_with_backoff, BackoffPolicy, Timer, TokioTimer};
pub use manager::{ChannelEvent, ConnectionManager, ListenerId, Subscription};
pub use stream::{ChangeStreamClient, StreamClosed};
