//! Core message types for the agent bus
//!
//! All types use camelCase JSON serialization for wire compatibility.

use crate::metadata::MessageMetadata;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default transport topic prefix (`agent-broadcast`, `agent-direct`, ...)
pub const DEFAULT_TOPIC_PREFIX: &str = "agent-";

/// Priority assigned when a sender does not pick one
pub const DEFAULT_PRIORITY: u32 = 3;

/// Role assigned when a sender does not declare one
pub const UNKNOWN_ROLE: &str = "Unknown";

/// Routing category a message is tagged with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Direct,
    Broadcast,
    Priority,
}

impl Channel {
    /// Every channel a message can be sent on
    pub const ALL: [Channel; 3] = [Channel::Direct, Channel::Broadcast, Channel::Priority];

    /// Wire name of the channel
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Direct => "direct",
            Channel::Broadcast => "broadcast",
            Channel::Priority => "priority",
        }
    }

    /// Transport topic for this channel
    pub fn topic(&self, prefix: &str) -> String {
        format!("{}{}", prefix, self.as_str())
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Channel selector for queries and listeners
///
/// `All` is only meaningful when reading; sending always names a `Channel`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelFilter {
    #[default]
    All,
    #[serde(untagged)]
    Only(Channel),
}

impl ChannelFilter {
    /// Whether the filter admits `channel`
    pub fn matches(&self, channel: Channel) -> bool {
        match self {
            ChannelFilter::All => true,
            ChannelFilter::Only(c) => *c == channel,
        }
    }

    /// Channels this filter can match
    pub fn channels(&self) -> Vec<Channel> {
        match self {
            ChannelFilter::All => Channel::ALL.to_vec(),
            ChannelFilter::Only(c) => vec![*c],
        }
    }
}

impl From<Channel> for ChannelFilter {
    fn from(channel: Channel) -> Self {
        ChannelFilter::Only(channel)
    }
}

/// A single message on the bus
///
/// Immutable once sent: fields are public for reading but nothing on the bus
/// hands out mutable access to a stored message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Unique message identifier (msg-<unix-ms>-<suffix>)
    pub id: String,

    pub sender_id: String,

    #[serde(default = "default_role")]
    pub sender_role: String,

    /// Absent for broadcast-eligible messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<String>,

    pub content: String,

    pub channel: Channel,

    /// Informal scale (1-10 observed); messages from older senders may omit it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,

    /// Unix timestamp in milliseconds
    pub timestamp: u64,
}

fn default_role() -> String {
    UNKNOWN_ROLE.to_string()
}

impl Message {
    /// Creation time as a UTC datetime, for display
    pub fn sent_at(&self) -> chrono::DateTime<chrono::Utc> {
        chrono::DateTime::from_timestamp_millis(self.timestamp as i64).unwrap_or_default()
    }

    /// Whether `recipient` may see this message (unaddressed or addressed to it)
    pub fn is_visible_to(&self, recipient: &str) -> bool {
        self.recipient_id.as_deref().map_or(true, |r| r == recipient)
    }
}

/// Arguments for sending a message
///
/// Defaults: channel `Broadcast`, priority 3, role "Unknown", no recipient.
#[derive(Debug, Clone)]
pub struct MessageDraft {
    pub sender_id: String,
    pub sender_role: String,
    pub recipient_id: Option<String>,
    pub content: String,
    pub channel: Channel,
    pub priority: u32,
    pub metadata: Option<MessageMetadata>,
}

impl MessageDraft {
    /// Start a draft from a sender and content
    pub fn new(sender_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            sender_id: sender_id.into(),
            sender_role: UNKNOWN_ROLE.to_string(),
            recipient_id: None,
            content: content.into(),
            channel: Channel::Broadcast,
            priority: DEFAULT_PRIORITY,
            metadata: None,
        }
    }

    /// Set the sender role
    pub fn role(mut self, role: impl Into<String>) -> Self {
        self.sender_role = role.into();
        self
    }

    /// Set the recipient
    pub fn to(mut self, recipient_id: impl Into<String>) -> Self {
        self.recipient_id = Some(recipient_id.into());
        self
    }

    /// Set the channel
    pub fn channel(mut self, channel: Channel) -> Self {
        self.channel = channel;
        self
    }

    /// Set the priority
    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Attach metadata
    pub fn metadata(mut self, metadata: MessageMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Stamp id and timestamp
    pub fn into_message(self) -> Message {
        let timestamp = now_millis();
        Message {
            id: new_message_id(timestamp),
            sender_id: self.sender_id,
            sender_role: self.sender_role,
            recipient_id: self.recipient_id,
            content: self.content,
            channel: self.channel,
            priority: Some(self.priority),
            metadata: self.metadata,
            timestamp,
        }
    }
}

/// Listener filter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeOptions {
    #[serde(default)]
    pub channel: ChannelFilter,

    /// Drop messages explicitly addressed to someone else
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<String>,

    /// Minimum priority; messages without a priority always pass
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,
}

impl SubscribeOptions {
    /// Listen on one channel
    pub fn channel(channel: Channel) -> Self {
        Self {
            channel: ChannelFilter::Only(channel),
            ..Default::default()
        }
    }

    /// Listen for one recipient (plus broadcasts)
    pub fn recipient(recipient_id: impl Into<String>) -> Self {
        Self {
            recipient_id: Some(recipient_id.into()),
            ..Default::default()
        }
    }

    /// Only pass messages at or above `threshold`
    pub fn with_priority(mut self, threshold: u32) -> Self {
        self.priority = Some(threshold);
        self
    }

    /// Whether a message passes every filter
    pub fn matches(&self, message: &Message) -> bool {
        if !self.channel.matches(message.channel) {
            return false;
        }
        if let Some(ref recipient) = self.recipient_id {
            if !message.is_visible_to(recipient) {
                return false;
            }
        }
        match (self.priority, message.priority) {
            (Some(threshold), Some(p)) => p >= threshold,
            _ => true,
        }
    }
}

/// History query
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    #[serde(default)]
    pub channel: ChannelFilter,

    /// Keep messages addressed to this recipient or sent on `Broadcast`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl HistoryQuery {
    /// Query one channel, or `ChannelFilter::All`
    pub fn channel(channel: impl Into<ChannelFilter>) -> Self {
        Self {
            channel: channel.into(),
            ..Default::default()
        }
    }

    /// Keep messages for one recipient (plus broadcasts)
    pub fn recipient(mut self, recipient_id: impl Into<String>) -> Self {
        self.recipient_id = Some(recipient_id.into());
        self
    }

    /// Return at most `limit` messages
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Last known state of a channel's transport subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChannelStatus {
    /// Never subscribed
    Pending,
    Subscribed,
    /// Subscribe failed or the stream reported an error
    Errored,
    /// Stream ended or `cleanup` ran
    Closed,
}

fn new_message_id(timestamp: u64) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("msg-{}-{}", timestamp, &suffix[..8])
}

/// Current time in Unix milliseconds
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
