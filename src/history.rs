//! Per-channel message history with bounded retention
//!
//! Each channel keeps a ring buffer of its most recent messages. When a
//! buffer is full the oldest message is evicted.

use crate::ordering::{sort_messages, MessageOrder};
use crate::types::{Channel, HistoryQuery, Message};
use std::collections::{HashMap, VecDeque};

/// Default number of messages retained per channel
pub const DEFAULT_HISTORY_CAPACITY: usize = 500;

/// In-memory history, one ring buffer per channel
#[derive(Debug)]
pub struct HistoryLog {
    channels: HashMap<Channel, VecDeque<Message>>,
    /// Per-channel capacity; 0 means unbounded
    capacity: usize,
}

impl HistoryLog {
    /// Create a history log holding `capacity` messages per channel
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: HashMap::new(),
            capacity,
        }
    }

    /// Get the per-channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a message to its channel, evicting the oldest if full
    pub fn push(&mut self, message: Message) {
        let buffer = self.channels.entry(message.channel).or_default();
        buffer.push_back(message);

        if self.capacity > 0 {
            while buffer.len() > self.capacity {
                if let Some(evicted) = buffer.pop_front() {
                    tracing::debug!(
                        message_id = %evicted.id,
                        channel = %evicted.channel,
                        "History entry evicted"
                    );
                }
            }
        }
    }

    /// Append unless a message with the same id is already held
    ///
    /// Returns whether the message was stored.
    pub fn push_unique(&mut self, message: Message) -> bool {
        if self.contains(message.channel, &message.id) {
            return false;
        }
        self.push(message);
        true
    }

    /// Whether `channel` still holds a message with this id
    pub fn contains(&self, channel: Channel, id: &str) -> bool {
        self.channels
            .get(&channel)
            .map_or(false, |buffer| buffer.iter().any(|m| m.id == id))
    }

    /// Number of messages held on `channel`
    pub fn len(&self, channel: Channel) -> usize {
        self.channels.get(&channel).map_or(0, VecDeque::len)
    }

    /// Total messages across all channels
    pub fn total(&self) -> usize {
        self.channels.values().map(VecDeque::len).sum()
    }

    /// Whether no channel holds any message
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Filtered, newest-first view
    ///
    /// With a recipient set, keeps messages addressed to that recipient or
    /// sent on the broadcast channel.
    pub fn query(&self, query: &HistoryQuery) -> Vec<Message> {
        let mut result: Vec<Message> = Vec::new();

        // Channel::ALL order keeps the concatenation deterministic for ties.
        for channel in query.channel.channels() {
            let Some(buffer) = self.channels.get(&channel) else {
                continue;
            };
            result.extend(
                buffer
                    .iter()
                    .filter(|m| match query.recipient_id.as_deref() {
                        Some(recipient) => {
                            m.recipient_id.as_deref() == Some(recipient)
                                || m.channel == Channel::Broadcast
                        }
                        None => true,
                    })
                    .cloned(),
            );
        }

        sort_messages(&mut result, MessageOrder::Newest);

        if let Some(limit) = query.limit {
            result.truncate(limit);
        }
        result
    }

    /// Drop every recorded message
    pub fn clear(&mut self) {
        self.channels.clear();
    }
}

impl Default for HistoryLog {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}
