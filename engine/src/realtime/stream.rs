use crate::backend::{BackendResult, ChangeFeed, FeedSignal, Filter, Liveness};
use futures::stream::BoxStream;
use futures::StreamExt;
use reqchat_messaging::{ConversationKey, StreamEvent, Table};
use tracing::{debug, warn};

const STREAMED_TABLES: [Table; 2] = [Table::Messages, Table::Attachments];

/// Why a change stream stopped producing events.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamClosed {
    #[error("feed ended")]
    Ended,
    #[error("feed failed: {0}")]
    Failed(String),
}

/// One push subscription to inserts for a single conversation.
pub struct ChangeStreamClient {
    conversation: ConversationKey,
    events: BoxStream<'static, FeedSignal>,
    liveness: Liveness,
}

impl ChangeStreamClient {
    pub async fn connect(
        feed: &dyn ChangeFeed,
        conversation: ConversationKey,
    ) -> BackendResult<Self> {
        let insert_feed = feed
            .subscribe_to_inserts(&STREAMED_TABLES, Filter::conversation(conversation))
            .await?;
        debug!(%conversation, "change stream opened");
        Ok(Self {
            conversation,
            events: insert_feed.events,
            liveness: insert_feed.liveness,
        })
    }

    pub fn conversation(&self) -> ConversationKey {
        self.conversation
    }

    /// Handle for probing transport health while the stream is being read.
    pub fn liveness(&self) -> Liveness {
        self.liveness.clone()
    }

    /// Next decoded event. Malformed rows are logged and skipped.
    pub async fn next_event(&mut self) -> Result<StreamEvent, StreamClosed> {
        loop {
            match self.events.next().await {
                Some(FeedSignal::Insert(row)) => match StreamEvent::decode(row) {
                    Ok(event) => return Ok(event),
                    Err(err) => {
                        warn!(conversation = %self.conversation, %err, "dropping undecodable row");
                    }
                },
                Some(FeedSignal::Error(reason)) => {
                    self.liveness.kill();
                    return Err(StreamClosed::Failed(reason));
                }
                None => {
                    self.liveness.kill();
                    return Err(StreamClosed::Ended);
                }
            }
        }
    }
}

impl std::fmt::Debug for ChangeStreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeStreamClient")
            .field("conversation", &self.conversation)
            .field("alive", &self.liveness.is_alive())
            .finish()
    }
}
