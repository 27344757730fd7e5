//! Chronological, id-unique list of messages for one conversation.

use chrono::{DateTime, Utc};
use reqchat_messaging::{Attachment, Message, MessageId};
use std::collections::HashMap;

type SortKey = (DateTime<Utc>, MessageId);

/// Outcome of merging a record into the timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Merge {
    Inserted,
    Updated,
    Unchanged,
}

impl Merge {
    pub fn changed(self) -> bool {
        self != Merge::Unchanged
    }
}

/// Messages ordered by `(created_at, id)`; every id appears at most once.
#[derive(Debug, Clone, Default)]
pub struct Timeline {
    messages: Vec<Message>,
    keys: HashMap<MessageId, SortKey>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge-by-id. A known id is updated in place (attachments unioned);
    /// a new one is placed by sort key, appending when it sorts last.
    pub fn insert(&mut self, message: Message) -> Merge {
        let Some(index) = self.index_of(message.id) else {
            self.place(message);
            return Merge::Inserted;
        };

        let previous = &self.messages[index];
        let mut merged = message;
        let incoming = std::mem::replace(&mut merged.attachments, previous.attachments.clone());
        for attachment in incoming {
            merged.attach(attachment);
        }
        if merged == *previous {
            return Merge::Unchanged;
        }

        if merged.sort_key() == previous.sort_key() {
            self.messages[index] = merged;
        } else {
            self.messages.remove(index);
            self.place(merged);
        }
        Merge::Updated
    }

    /// Attaches to a present parent. `None` when the parent is unknown,
    /// otherwise whether the attachment was new.
    pub fn attach(&mut self, attachment: Attachment) -> Option<bool> {
        let index = self.index_of(attachment.message_id)?;
        Some(self.messages[index].attach(attachment))
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.keys.contains_key(&id)
    }

    pub fn get(&self, id: MessageId) -> Option<&Message> {
        self.index_of(id).map(|index| &self.messages[index])
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.keys.clear();
    }

    fn index_of(&self, id: MessageId) -> Option<usize> {
        let key = self.keys.get(&id)?;
        self.messages
            .binary_search_by(|message| message.sort_key().cmp(key))
            .ok()
    }

    fn place(&mut self, message: Message) {
        let key = message.sort_key();
        let index = match self.messages.last() {
            Some(last) if last.sort_key() > key => {
                self.messages.partition_point(|m| m.sort_key() < key)
            }
            _ => self.messages.len(),
        };
        self.keys.insert(message.id, key);
        self.messages.insert(index, message);
    }
}
