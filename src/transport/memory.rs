//! In-memory transport for tests and single-process use
//!
//! Each topic is a `tokio::sync::broadcast` channel. Clones share topics, so
//! two buses built over clones of one `MemoryTransport` see each other's
//! messages the way two browser tabs share a realtime channel.

use super::{Transport, TransportSubscription};
use crate::error::{BusError, Result};
use crate::types::Message;
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

/// Memory transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryTransportConfig {
    /// Buffered messages per topic before slow subscribers start lagging
    pub capacity: usize,
}

impl Default for MemoryTransportConfig {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

/// Broadcast-channel transport
#[derive(Clone)]
pub struct MemoryTransport {
    config: MemoryTransportConfig,
    topics: Arc<RwLock<HashMap<String, broadcast::Sender<Message>>>>,
    published: Arc<AtomicU64>,
}

impl MemoryTransport {
    /// Create a memory transport
    pub fn new(config: MemoryTransportConfig) -> Result<Self> {
        if config.capacity == 0 {
            return Err(BusError::Config(
                "Memory transport capacity must be >= 1".to_string(),
            ));
        }
        Ok(Self {
            config,
            topics: Arc::new(RwLock::new(HashMap::new())),
            published: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Total messages accepted by `publish`
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Live subscribers on `topic`
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .ok()
            .and_then(|topics| topics.get(topic).map(broadcast::Sender::receiver_count))
            .unwrap_or(0)
    }

    fn sender(&self, topic: &str) -> Result<broadcast::Sender<Message>> {
        if let Some(tx) = self
            .topics
            .read()
            .map_err(|e| BusError::State(format!("Transport lock poisoned: {}", e)))?
            .get(topic)
        {
            return Ok(tx.clone());
        }

        let mut topics = self
            .topics
            .write()
            .map_err(|e| BusError::State(format!("Transport lock poisoned: {}", e)))?;
        let tx = topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.config.capacity).0);
        Ok(tx.clone())
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self {
            config: MemoryTransportConfig::default(),
            topics: Arc::new(RwLock::new(HashMap::new())),
            published: Arc::new(AtomicU64::new(0)),
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn subscribe(&self, topic: &str) -> Result<Box<dyn TransportSubscription>> {
        let rx = self.sender(topic)?.subscribe();
        tracing::debug!(topic = %topic, "Memory subscription opened");
        Ok(Box::new(MemorySubscription {
            topic: topic.to_string(),
            stream: BroadcastStream::new(rx),
        }))
    }

    async fn publish(&self, topic: &str, message: &Message) -> Result<()> {
        let tx = self.sender(topic)?;
        self.published.fetch_add(1, Ordering::Relaxed);

        // No receivers is not a failure for a fire-and-forget transport
        if tx.send(message.clone()).is_err() {
            tracing::debug!(topic = %topic, message_id = %message.id, "No subscribers on topic");
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Subscription to one memory topic
pub struct MemorySubscription {
    topic: String,
    stream: BroadcastStream<Message>,
}

#[async_trait]
impl TransportSubscription for MemorySubscription {
    async fn next(&mut self) -> Result<Option<Message>> {
        loop {
            match self.stream.next().await {
                Some(Ok(message)) => return Ok(Some(message)),
                Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                    tracing::warn!(
                        topic = %self.topic,
                        skipped,
                        "Memory subscriber lagged, messages dropped"
                    );
                }
                None => return Ok(None),
            }
        }
    }

    fn topic(&self) -> &str {
        &self.topic
    }
}
