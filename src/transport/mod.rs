//! Transport trait: the realtime channel the bus publishes through
//!
//! A transport moves messages between bus instances (browser tabs, processes,
//! hosts). The bus subscribes one topic per channel and relies on the
//! transport echoing every published message back to every subscriber of
//! the topic, including the publisher's own subscription.

use crate::error::Result;
use crate::types::Message;
use async_trait::async_trait;

pub mod memory;
pub mod nats;

/// Core trait for realtime transports
///
/// Implementations handle the wire details of publish and subscribe. The
/// `MessageBus` owns one transport and treats it as opaque.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a subscription to `topic`
    ///
    /// Messages published after this returns must be delivered to it.
    async fn subscribe(&self, topic: &str) -> Result<Box<dyn TransportSubscription>>;

    /// Publish a message to every current subscriber of `topic`
    ///
    /// Fire-and-forget: success means the transport accepted the message,
    /// not that anyone received it.
    async fn publish(&self, topic: &str, message: &Message) -> Result<()>;

    /// Transport name (e.g., "memory", "nats")
    fn name(&self) -> &str;

    /// Health check, returns true if the transport is usable
    async fn health(&self) -> Result<bool> {
        Ok(true)
    }
}

/// Async stream of messages for one topic
#[async_trait]
pub trait TransportSubscription: Send {
    /// Receive the next message; `None` once the subscription is closed
    async fn next(&mut self) -> Result<Option<Message>>;

    /// Topic this subscription reads
    fn topic(&self) -> &str;
}
