//! Read-side ordering policy
//!
//! History is stored in insertion order and never exposed raw. Every read
//! path sorts through `sort_messages`, so the bus and its adapters share a
//! single definition of "newest" and "most important".

use crate::types::Message;
use std::cmp::Ordering;

/// How a list of messages is presented
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MessageOrder {
    /// Timestamp descending; equal timestamps keep later insertions first
    #[default]
    Newest,
    /// Priority descending (missing = 0), then `Newest`
    PriorityThenNewest,
}

/// Sort `messages`, assumed to be in insertion order, by `order`
pub fn sort_messages(messages: &mut Vec<Message>, order: MessageOrder) {
    // Reverse first so the stable sort leaves later insertions ahead on ties.
    messages.reverse();
    match order {
        MessageOrder::Newest => messages.sort_by(newest_first),
        MessageOrder::PriorityThenNewest => messages.sort_by(|a, b| {
            b.priority
                .unwrap_or(0)
                .cmp(&a.priority.unwrap_or(0))
                .then_with(|| newest_first(a, b))
        }),
    }
}

fn newest_first(a: &Message, b: &Message) -> Ordering {
    b.timestamp.cmp(&a.timestamp)
}
