//! NATS transport
//!
//! Uses core NATS pub/sub (no JetStream). Each bus topic maps to a NATS
//! subject of the same name and carries the message as JSON.

use super::{Transport, TransportSubscription};
use crate::error::{BusError, Result};
use crate::types::Message;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// NATS connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NatsTransportConfig {
    /// Server URL
    pub url: String,

    /// Client connection name shown by the server
    pub name: String,

    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,
}

impl Default for NatsTransportConfig {
    fn default() -> Self {
        Self {
            url: "nats://127.0.0.1:4222".to_string(),
            name: "agent-bus".to_string(),
            connect_timeout_secs: 5,
        }
    }
}

/// Core NATS transport
pub struct NatsTransport {
    client: async_nats::Client,
    config: NatsTransportConfig,
}

impl NatsTransport {
    /// Connect to the NATS server
    pub async fn connect(config: NatsTransportConfig) -> Result<Self> {
        let client = async_nats::ConnectOptions::new()
            .name(config.name.clone())
            .connection_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(config.url.as_str())
            .await
            .map_err(|e| BusError::Connection(format!("{}: {}", config.url, e)))?;

        tracing::info!(url = %config.url, "Connected to NATS");

        Ok(Self { client, config })
    }

    /// Get the connection configuration
    pub fn config(&self) -> &NatsTransportConfig {
        &self.config
    }

    /// Get the underlying NATS client for advanced usage
    pub fn client(&self) -> &async_nats::Client {
        &self.client
    }
}

#[async_trait]
impl Transport for NatsTransport {
    async fn subscribe(&self, topic: &str) -> Result<Box<dyn TransportSubscription>> {
        let subscriber = self
            .client
            .subscribe(topic.to_string())
            .await
            .map_err(|e| BusError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;

        tracing::info!(topic = %topic, "NATS subscription created");

        Ok(Box::new(NatsSubscription {
            topic: topic.to_string(),
            subscriber,
        }))
    }

    async fn publish(&self, topic: &str, message: &Message) -> Result<()> {
        let payload = serde_json::to_vec(message)?;

        self.client
            .publish(topic.to_string(), Bytes::from(payload))
            .await
            .map_err(|e| BusError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;

        tracing::debug!(message_id = %message.id, topic = %topic, "Message sent to NATS");
        Ok(())
    }

    fn name(&self) -> &str {
        "nats"
    }

    async fn health(&self) -> Result<bool> {
        Ok(matches!(
            self.client.connection_state(),
            async_nats::connection::State::Connected
        ))
    }
}

/// Subscription to one NATS subject
pub struct NatsSubscription {
    topic: String,
    subscriber: async_nats::Subscriber,
}

#[async_trait]
impl TransportSubscription for NatsSubscription {
    async fn next(&mut self) -> Result<Option<Message>> {
        while let Some(raw) = self.subscriber.next().await {
            match serde_json::from_slice::<Message>(&raw.payload) {
                Ok(message) => return Ok(Some(message)),
                Err(e) => {
                    tracing::warn!(
                        topic = %self.topic,
                        error = %e,
                        "Skipping undecodable message"
                    );
                }
            }
        }
        Ok(None)
    }

    fn topic(&self) -> &str {
        &self.topic
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NatsTransportConfig::default();
        assert_eq!(config.url, "nats://127.0.0.1:4222");
        assert_eq!(config.connect_timeout_secs, 5);
    }

    #[test]
    fn test_config_serialization() {
        let config = NatsTransportConfig {
            url: "nats://bus.internal:4222".to_string(),
            name: "dashboard".to_string(),
            connect_timeout_secs: 2,
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"connectTimeoutSecs\":2"));

        let parsed: NatsTransportConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.name, "dashboard");
    }
}
