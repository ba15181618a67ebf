//! Per-agent inbox over the message bus
//!
//! An `AgentInbox` gives one consumer a live, deduplicated view of the
//! messages relevant to it, ordered by priority then recency, plus send
//! helpers bound to its identity.

use crate::bus::{ListenerHandle, MessageBus};
use crate::metadata::MessageMetadata;
use crate::ordering::{sort_messages, MessageOrder};
use crate::types::{Channel, ChannelFilter, HistoryQuery, Message, MessageDraft, SubscribeOptions};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;

/// Priority used by `send_priority_message`
pub const URGENT_PRIORITY: u32 = 10;

/// Default priority for `broadcast_message`
pub const BROADCAST_PRIORITY: u32 = 5;

/// Inbox identity and extra channels to follow
#[derive(Debug, Clone)]
pub struct InboxOptions {
    pub agent_id: String,
    pub agent_role: String,

    /// Channels followed in full, beyond messages addressed to this agent
    pub channels: Vec<Channel>,
}

impl InboxOptions {
    /// Create inbox options for an agent
    pub fn new(agent_id: impl Into<String>, agent_role: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_role: agent_role.into(),
            channels: Vec::new(),
        }
    }

    /// Also follow every message on `channel`
    pub fn follow(mut self, channel: Channel) -> Self {
        if !self.channels.contains(&channel) {
            self.channels.push(channel);
        }
        self
    }
}

/// Optional fields for `AgentInbox::send_message`
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub recipient_id: Option<String>,
    /// Defaults to `Direct` with a recipient, `Broadcast` without
    pub channel: Option<Channel>,
    pub priority: Option<u32>,
    pub metadata: Option<MessageMetadata>,
}

impl SendOptions {
    /// Options addressed to one recipient
    pub fn to(recipient_id: impl Into<String>) -> Self {
        Self {
            recipient_id: Some(recipient_id.into()),
            ..Default::default()
        }
    }
}

type SharedList = Arc<Mutex<Vec<Message>>>;

/// Live message view for one agent
pub struct AgentInbox {
    bus: MessageBus,
    options: InboxOptions,
    messages: SharedList,
    version: Arc<watch::Sender<u64>>,
    handles: Mutex<Vec<ListenerHandle>>,
}

impl AgentInbox {
    /// Start listening, then seed from history
    ///
    /// Listeners go first so a message published while channels are being
    /// subscribed is caught by either the seed or the listener; the id
    /// dedup absorbs the overlap.
    pub async fn attach(bus: &MessageBus, options: InboxOptions) -> Self {
        let messages: SharedList = Arc::new(Mutex::new(Vec::new()));
        let (version, _) = watch::channel(0u64);
        let version = Arc::new(version);

        let mut handles = Vec::with_capacity(options.channels.len() + 1);
        handles.push(
            bus.subscribe_to_messages(
                SubscribeOptions::recipient(options.agent_id.clone()),
                inserter(messages.clone(), version.clone()),
            )
            .await,
        );
        for channel in &options.channels {
            handles.push(
                bus.subscribe_to_messages(
                    SubscribeOptions::channel(*channel),
                    inserter(messages.clone(), version.clone()),
                )
                .await,
            );
        }

        let mut seed = bus.get_message_history(
            &HistoryQuery::channel(ChannelFilter::All).recipient(options.agent_id.clone()),
        );
        for channel in &options.channels {
            seed.extend(bus.get_message_history(&HistoryQuery::channel(*channel)));
        }
        if merge_seed(&mut lock(&messages), seed) {
            version.send_modify(|v| *v += 1);
        }

        tracing::debug!(
            agent = %options.agent_id,
            channels = ?options.channels,
            "Inbox attached"
        );

        Self {
            bus: bus.clone(),
            options,
            messages,
            version,
            handles: Mutex::new(handles),
        }
    }

    /// Get the agent id
    pub fn agent_id(&self) -> &str {
        &self.options.agent_id
    }

    /// Snapshot, highest priority first then newest
    pub fn messages(&self) -> Vec<Message> {
        lock(&self.messages).clone()
    }

    /// Number of messages in the inbox
    pub fn len(&self) -> usize {
        lock(&self.messages).len()
    }

    /// Whether the inbox is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Watch that ticks whenever the message list changes
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    /// Draft pre-filled with this agent's identity
    pub fn draft(&self, content: impl Into<String>) -> MessageDraft {
        MessageDraft::new(self.options.agent_id.clone(), content)
            .role(self.options.agent_role.clone())
    }

    /// Send with this agent's identity
    pub async fn send_message(&self, content: impl Into<String>, options: SendOptions) -> bool {
        let channel = options.channel.unwrap_or(if options.recipient_id.is_some() {
            Channel::Direct
        } else {
            Channel::Broadcast
        });

        let mut draft = self.draft(content).channel(channel);
        if let Some(recipient) = options.recipient_id {
            draft = draft.to(recipient);
        }
        if let Some(priority) = options.priority {
            draft = draft.priority(priority);
        }
        if let Some(metadata) = options.metadata {
            draft = draft.metadata(metadata);
        }
        self.bus.send_message(draft).await
    }

    /// Send at priority 10 on the priority channel
    pub async fn send_priority_message(
        &self,
        content: impl Into<String>,
        recipient_id: Option<&str>,
    ) -> bool {
        let mut draft = self
            .draft(content)
            .channel(Channel::Priority)
            .priority(URGENT_PRIORITY);
        if let Some(recipient) = recipient_id {
            draft = draft.to(recipient);
        }
        self.bus.send_message(draft).await
    }

    /// Send to everyone on the broadcast channel (priority 5 unless given)
    pub async fn broadcast_message(&self, content: impl Into<String>, priority: Option<u32>) -> bool {
        let draft = self
            .draft(content)
            .channel(Channel::Broadcast)
            .priority(priority.unwrap_or(BROADCAST_PRIORITY));
        self.bus.send_message(draft).await
    }

    /// Stop listening; the current list is kept. Safe to call repeatedly.
    pub fn detach(&self) {
        let handles: Vec<ListenerHandle> = lock(&self.handles).drain(..).collect();
        if handles.is_empty() {
            return;
        }
        for handle in &handles {
            handle.unsubscribe();
        }
        tracing::debug!(agent = %self.options.agent_id, "Inbox detached");
    }
}

impl Drop for AgentInbox {
    fn drop(&mut self) {
        self.detach();
    }
}

fn inserter(messages: SharedList, version: Arc<watch::Sender<u64>>) -> impl Fn(&Message) + Send + Sync {
    move |message| {
        if insert_message(&mut lock(&messages), message) {
            version.send_modify(|v| *v += 1);
        }
    }
}

/// Insert unless the id is already present, keeping priority-then-newest order
fn insert_message(list: &mut Vec<Message>, message: &Message) -> bool {
    if list.iter().any(|m| m.id == message.id) {
        return false;
    }
    // Back to oldest-first so the re-sort puts the newest arrival ahead on ties
    list.reverse();
    list.push(message.clone());
    sort_messages(list, MessageOrder::PriorityThenNewest);
    true
}

/// Merge history into a list that live deliveries may already have filled
///
/// History is older than anything delivered live, so it goes first in
/// insertion order before the single re-sort.
fn merge_seed(list: &mut Vec<Message>, seed: Vec<Message>) -> bool {
    let mut fresh: Vec<Message> = Vec::new();
    for message in seed {
        if !list.iter().chain(fresh.iter()).any(|m| m.id == message.id) {
            fresh.push(message);
        }
    }
    if fresh.is_empty() {
        return false;
    }

    // History reads newest-first
    fresh.reverse();
    fresh.sort_by_key(|m| m.timestamp);
    list.reverse();
    fresh.append(list);
    *list = fresh;
    sort_messages(list, MessageOrder::PriorityThenNewest);
    true
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
