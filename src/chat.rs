use std::collections::{HashSet, VecDeque};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    #[serde(default, rename = "sentAtIso", skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<String>,
}

impl ChatMessage {
    pub fn new(text: impl Into<String>, sender_id: Option<&str>, sent_at: Option<&str>) -> Self {
        Self {
            text: text.into(),
            sender_id: sender_id.map(str::to_string),
            sent_at: sent_at.map(str::to_string),
        }
    }

    fn dedup_key(&self) -> DedupKey {
        (self.text.clone(), self.sender_id.clone(), self.sent_at.clone())
    }
}

type DedupKey = (String, Option<String>, Option<String>);

/// Drops chat messages the hub delivers twice, typically when buffered
/// events are replayed after a reconnect. Only the most recent `capacity`
/// messages are remembered.
pub struct EventDeduplicator {
    capacity: usize,
    order: VecDeque<DedupKey>,
    seen: HashSet<DedupKey>,
}

impl EventDeduplicator {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
        }
    }

    /// Returns `false` if an identical `(text, sender, sent_at)` triple is
    /// still in the window, otherwise records it and returns `true`.
    pub fn admit(&mut self, message: &ChatMessage) -> bool {
        let key = message.dedup_key();
        if self.seen.contains(&key) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(key.clone());
        self.order.push_back(key);
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.seen.clear();
    }
}
