//! Message bus built on a pluggable realtime transport
//!
//! `MessageBus` is the single shared point agents publish to and observe.
//! It keeps per-channel history and fans transport deliveries out to
//! registered listeners.
//!
//! Delivery has exactly one path: a listener is only ever invoked by the
//! pump task reading the transport subscription for a channel. Sending does
//! not call listeners directly, so each transport delivery reaches each
//! matching listener once, the sender's own listeners included.

use crate::error::{BusError, Result};
use crate::history::{HistoryLog, DEFAULT_HISTORY_CAPACITY};
use crate::transport::{Transport, TransportSubscription};
use crate::types::{
    Channel, ChannelStatus, HistoryQuery, Message, MessageDraft, SubscribeOptions,
    DEFAULT_TOPIC_PREFIX,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusConfig {
    /// Prefix for transport topics (`agent-` → `agent-broadcast`)
    pub topic_prefix: String,

    /// Messages retained per channel; 0 keeps everything
    pub history_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }
}

impl BusConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.topic_prefix.trim().is_empty() {
            return Err(BusError::Config("Topic prefix cannot be empty".to_string()));
        }
        Ok(())
    }

    /// Transport topic for a channel
    pub fn topic(&self, channel: Channel) -> String {
        channel.topic(&self.topic_prefix)
    }
}

type Callback = Arc<dyn Fn(&Message) + Send + Sync>;

struct Listener {
    id: u64,
    options: SubscribeOptions,
    callback: Callback,
}

/// State shared between the bus handle and its pump tasks
struct Shared {
    listeners: RwLock<Vec<Listener>>,
    history: RwLock<HistoryLog>,
    statuses: RwLock<HashMap<Channel, ChannelStatus>>,
    awaiting_echo: RwLock<EchoGuard>,
}

/// Ids published here whose transport echo has not arrived yet
///
/// Holds at most `capacity` ids; the oldest is forgotten first, so an echo
/// that never arrives cannot pin its id. A capacity of 0 disables tracking,
/// which is only used with unbounded history where nothing is evicted.
struct EchoGuard {
    order: VecDeque<String>,
    ids: HashSet<String>,
    capacity: usize,
}

impl EchoGuard {
    /// Sized so every id still in history stays tracked
    fn for_history(history_capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            ids: HashSet::new(),
            capacity: history_capacity.saturating_mul(Channel::ALL.len()),
        }
    }

    fn insert(&mut self, id: &str) {
        if self.capacity == 0 || !self.ids.insert(id.to_string()) {
            return;
        }
        self.order.push_back(id.to_string());
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    fn remove(&mut self, id: &str) -> bool {
        if !self.ids.remove(id) {
            return false;
        }
        self.order.retain(|pending| pending != id);
        true
    }

    fn len(&self) -> usize {
        self.ids.len()
    }

    fn clear(&mut self) {
        self.order.clear();
        self.ids.clear();
    }
}

impl Shared {
    fn set_status(&self, channel: Channel, status: ChannelStatus) {
        write(&self.statuses).insert(channel, status);
    }

    fn record(&self, message: &Message) -> bool {
        write(&self.history).push_unique(message.clone())
    }

    /// Record a transport delivery and hand it to matching listeners
    ///
    /// Echoes of local sends are not recorded again: `publish` already did,
    /// and the original may have been evicted since.
    fn deliver(&self, message: &Message) {
        let local = write(&self.awaiting_echo).remove(&message.id);
        if !local && self.record(message) {
            tracing::debug!(
                message_id = %message.id,
                sender = %message.sender_id,
                "Remote message recorded"
            );
        }

        // Callbacks run outside the lock so they may (un)subscribe
        let callbacks: Vec<(u64, Callback)> = read(&self.listeners)
            .iter()
            .filter(|l| l.options.matches(message))
            .map(|l| (l.id, l.callback.clone()))
            .collect();

        for (id, callback) in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(message))).is_err() {
                tracing::error!(
                    listener = id,
                    message_id = %message.id,
                    "Listener panicked during delivery"
                );
            }
        }
    }

    fn remove_listener(&self, id: u64) -> bool {
        let mut listeners = write(&self.listeners);
        let before = listeners.len();
        listeners.retain(|l| l.id != id);
        listeners.len() != before
    }
}

struct Inner {
    transport: Box<dyn Transport>,
    config: BusConfig,
    shared: Arc<Shared>,
    pumps: Mutex<HashMap<Channel, JoinHandle<()>>>,
    next_listener_id: AtomicU64,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for (_, pump) in self.pumps.get_mut().drain() {
            pump.abort();
        }
    }
}

/// Shared message bus
///
/// Cheap to clone; clones share listeners, history and transport
/// subscriptions. Construct one per application root and pass it down.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<Inner>,
}

impl MessageBus {
    /// Create a bus and subscribe the broadcast channel
    ///
    /// A failed broadcast subscription is logged and leaves
    /// `is_connected()` false; it does not fail construction.
    pub async fn connect(transport: impl Transport + 'static, config: BusConfig) -> Result<Self> {
        config.validate()?;

        let shared = Arc::new(Shared {
            listeners: RwLock::new(Vec::new()),
            history: RwLock::new(HistoryLog::new(config.history_capacity)),
            statuses: RwLock::new(
                Channel::ALL
                    .iter()
                    .map(|c| (*c, ChannelStatus::Pending))
                    .collect(),
            ),
            awaiting_echo: RwLock::new(EchoGuard::for_history(config.history_capacity)),
        });

        let bus = Self {
            inner: Arc::new(Inner {
                transport: Box::new(transport),
                config,
                shared,
                pumps: Mutex::new(HashMap::new()),
                next_listener_id: AtomicU64::new(1),
            }),
        };

        if let Err(e) = bus.ensure_channel(Channel::Broadcast).await {
            tracing::warn!(error = %e, "Broadcast channel unavailable, bus is disconnected");
        }

        tracing::info!(
            transport = %bus.transport_name(),
            history_capacity = bus.inner.config.history_capacity,
            "Message bus ready"
        );
        Ok(bus)
    }

    /// Get the transport name
    pub fn transport_name(&self) -> &str {
        self.inner.transport.name()
    }

    /// Get the bus configuration
    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// Publish a message and record it in history
    ///
    /// Lazily subscribes the target channel first so the transport echo
    /// reaches local listeners.
    pub async fn publish(&self, draft: MessageDraft) -> Result<Message> {
        let message = draft.into_message();
        let topic = self.inner.config.topic(message.channel);

        self.ensure_channel(message.channel).await?;

        let shared = &self.inner.shared;
        write(&shared.awaiting_echo).insert(&message.id);
        if let Err(e) = self.inner.transport.publish(&topic, &message).await {
            write(&shared.awaiting_echo).remove(&message.id);
            return Err(e);
        }
        shared.record(&message);

        tracing::debug!(
            message_id = %message.id,
            topic = %topic,
            sender = %message.sender_id,
            recipient = ?message.recipient_id,
            priority = ?message.priority,
            "Message published"
        );

        Ok(message)
    }

    /// Publish, reporting only success or failure
    ///
    /// The cause of a failure is logged and discarded.
    pub async fn send_message(&self, draft: MessageDraft) -> bool {
        match self.publish(draft).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to send message");
                false
            }
        }
    }

    /// Register a filtered listener
    ///
    /// Subscribes every transport channel the filter can match. A channel
    /// that fails to subscribe is logged; the listener is registered anyway
    /// and receives from the channels that are up.
    pub async fn subscribe_to_messages<F>(
        &self,
        options: SubscribeOptions,
        callback: F,
    ) -> ListenerHandle
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        for channel in options.channel.channels() {
            if let Err(e) = self.ensure_channel(channel).await {
                tracing::warn!(channel = %channel, error = %e, "Listener channel unavailable");
            }
        }

        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(
            listener = id,
            channel = ?options.channel,
            recipient = ?options.recipient_id,
            priority = ?options.priority,
            "Listener registered"
        );

        write(&self.inner.shared.listeners).push(Listener {
            id,
            options,
            callback: Arc::new(callback),
        });

        ListenerHandle {
            id,
            shared: Arc::downgrade(&self.inner.shared),
        }
    }

    /// Newest-first history view
    pub fn get_message_history(&self, query: &HistoryQuery) -> Vec<Message> {
        read(&self.inner.shared.history).query(query)
    }

    /// Whether the broadcast channel is currently subscribed
    pub fn is_connected(&self) -> bool {
        self.channel_status(Channel::Broadcast) == ChannelStatus::Subscribed
    }

    /// Last known subscription status of `channel`
    pub fn channel_status(&self, channel: Channel) -> ChannelStatus {
        read(&self.inner.shared.statuses)
            .get(&channel)
            .copied()
            .unwrap_or(ChannelStatus::Pending)
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        read(&self.inner.shared.listeners).len()
    }

    /// Drop every transport subscription and listener
    ///
    /// History is kept. A later send or subscribe re-opens channels lazily.
    pub async fn cleanup(&self) {
        let mut pumps = self.inner.pumps.lock().await;
        for (channel, pump) in pumps.drain() {
            pump.abort();
            self.inner.shared.set_status(channel, ChannelStatus::Closed);
        }
        write(&self.inner.shared.listeners).clear();
        write(&self.inner.shared.awaiting_echo).clear();

        tracing::info!("Message bus cleaned up");
    }

    /// Health check delegated to the transport
    pub async fn health(&self) -> Result<bool> {
        self.inner.transport.health().await
    }

    /// Make sure a pump is reading `channel`'s topic
    async fn ensure_channel(&self, channel: Channel) -> Result<()> {
        let mut pumps = self.inner.pumps.lock().await;

        if let Some(pump) = pumps.get(&channel) {
            if !pump.is_finished() {
                return Ok(());
            }
        }

        let topic = self.inner.config.topic(channel);
        let subscription = match self.inner.transport.subscribe(&topic).await {
            Ok(sub) => sub,
            Err(e) => {
                self.inner.shared.set_status(channel, ChannelStatus::Errored);
                return Err(BusError::Subscribe {
                    topic,
                    reason: e.to_string(),
                });
            }
        };

        self.inner.shared.set_status(channel, ChannelStatus::Subscribed);
        let shared = self.inner.shared.clone();
        pumps.insert(channel, tokio::spawn(pump(channel, subscription, shared)));

        tracing::info!(channel = %channel, topic = %topic, "Channel subscribed");
        Ok(())
    }
}

async fn pump(channel: Channel, mut subscription: Box<dyn TransportSubscription>, shared: Arc<Shared>) {
    loop {
        match subscription.next().await {
            Ok(Some(message)) => shared.deliver(&message),
            Ok(None) => {
                tracing::info!(topic = %subscription.topic(), "Transport subscription closed");
                shared.set_status(channel, ChannelStatus::Closed);
                break;
            }
            Err(e) => {
                tracing::warn!(
                    topic = %subscription.topic(),
                    error = %e,
                    "Transport subscription failed"
                );
                shared.set_status(channel, ChannelStatus::Errored);
                break;
            }
        }
    }
}

/// Handle for removing a listener
///
/// Dropping the handle leaves the listener registered; call `unsubscribe`.
pub struct ListenerHandle {
    id: u64,
    shared: Weak<Shared>,
}

impl ListenerHandle {
    /// Get the listener id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remove this listener; later calls are no-ops
    pub fn unsubscribe(&self) {
        if let Some(shared) = self.shared.upgrade() {
            if shared.remove_listener(self.id) {
                tracing::debug!(listener = self.id, "Listener removed");
            }
        }
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::{MemoryTransport, MemoryTransportConfig};
    use crate::types::ChannelFilter;
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn test_bus() -> MessageBus {
        MessageBus::connect(MemoryTransport::default(), BusConfig::default())
            .await
            .unwrap()
    }

    async fn collect(
        bus: &MessageBus,
        options: SubscribeOptions,
    ) -> (ListenerHandle, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = bus
            .subscribe_to_messages(options, move |m| {
                let _ = tx.send(m.clone());
            })
            .await;
        (handle, rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for delivery")
            .expect("listener channel closed")
    }

    async fn assert_silent(rx: &mut mpsc::UnboundedReceiver<Message>) {
        let got = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(got.is_err(), "unexpected delivery: {:?}", got);
    }

    #[tokio::test]
    async fn test_connect_subscribes_broadcast() {
        let bus = test_bus().await;
        assert!(bus.is_connected());
        assert_eq!(bus.channel_status(Channel::Broadcast), ChannelStatus::Subscribed);
        assert_eq!(bus.channel_status(Channel::Direct), ChannelStatus::Pending);
        assert_eq!(bus.transport_name(), "memory");
    }

    #[tokio::test]
    async fn test_empty_prefix_rejected() {
        let config = BusConfig {
            topic_prefix: " ".to_string(),
            ..Default::default()
        };
        let result = MessageBus::connect(MemoryTransport::default(), config).await;
        assert!(matches!(result, Err(BusError::Config(_))));
    }

    #[tokio::test]
    async fn test_send_then_history() {
        let bus = test_bus().await;
        let sent = bus
            .send_message(
                MessageDraft::new("research-agent", "hello")
                    .channel(Channel::Broadcast)
                    .priority(3),
            )
            .await;
        assert!(sent);

        let history = bus.get_message_history(&HistoryQuery::channel(Channel::Broadcast).limit(1));
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "hello");
    }

    #[tokio::test]
    async fn test_send_lazily_subscribes_channel() {
        let bus = test_bus().await;
        assert_eq!(bus.channel_status(Channel::Priority), ChannelStatus::Pending);

        bus.publish(MessageDraft::new("a", "urgent").channel(Channel::Priority))
            .await
            .unwrap();
        assert_eq!(bus.channel_status(Channel::Priority), ChannelStatus::Subscribed);
    }

    #[tokio::test]
    async fn test_sender_receives_echo_once() {
        let bus = test_bus().await;
        let (_handle, mut rx) = collect(&bus, SubscribeOptions::default()).await;

        let msg = bus
            .publish(MessageDraft::new("a", "ping").to("b").channel(Channel::Direct))
            .await
            .unwrap();

        assert_eq!(next(&mut rx).await.id, msg.id);
        assert_silent(&mut rx).await;
    }

    #[tokio::test]
    async fn test_echo_does_not_duplicate_history() {
        let bus = test_bus().await;
        let (_handle, mut rx) = collect(&bus, SubscribeOptions::default()).await;

        bus.publish(MessageDraft::new("a", "once")).await.unwrap();
        next(&mut rx).await;

        assert_eq!(bus.get_message_history(&HistoryQuery::default()).len(), 1);
    }

    #[tokio::test]
    async fn test_channel_filter() {
        let bus = test_bus().await;
        let (_handle, mut rx) = collect(&bus, SubscribeOptions::channel(Channel::Priority)).await;

        bus.publish(MessageDraft::new("a", "general")).await.unwrap();
        bus.publish(MessageDraft::new("a", "urgent").channel(Channel::Priority))
            .await
            .unwrap();

        assert_eq!(next(&mut rx).await.content, "urgent");
        assert_silent(&mut rx).await;
    }

    #[tokio::test]
    async fn test_recipient_filter() {
        let bus = test_bus().await;
        let (_handle, mut rx) = collect(&bus, SubscribeOptions::recipient("alice")).await;

        bus.publish(MessageDraft::new("x", "for bob").to("bob").channel(Channel::Direct))
            .await
            .unwrap();
        bus.publish(MessageDraft::new("x", "for alice").to("alice").channel(Channel::Direct))
            .await
            .unwrap();

        assert_eq!(next(&mut rx).await.content, "for alice");
        assert_silent(&mut rx).await;

        bus.publish(MessageDraft::new("x", "for everyone")).await.unwrap();
        assert_eq!(next(&mut rx).await.content, "for everyone");
    }

    #[tokio::test]
    async fn test_priority_threshold() {
        let bus = test_bus().await;
        let (_handle, mut rx) =
            collect(&bus, SubscribeOptions::default().with_priority(5)).await;

        bus.publish(MessageDraft::new("x", "low").priority(2)).await.unwrap();
        bus.publish(MessageDraft::new("x", "high").priority(8)).await.unwrap();

        assert_eq!(next(&mut rx).await.content, "high");
        assert_silent(&mut rx).await;
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent_and_targeted() {
        let bus = test_bus().await;
        let (first, mut first_rx) = collect(&bus, SubscribeOptions::default()).await;
        let (_second, mut second_rx) = collect(&bus, SubscribeOptions::default()).await;
        assert_eq!(bus.listener_count(), 2);

        first.unsubscribe();
        first.unsubscribe();
        assert_eq!(bus.listener_count(), 1);

        bus.publish(MessageDraft::new("x", "after")).await.unwrap();
        assert_eq!(next(&mut second_rx).await.content, "after");
        assert_silent(&mut first_rx).await;
    }

    #[tokio::test]
    async fn test_panicking_listener_does_not_stop_pump() {
        let bus = test_bus().await;
        let _bad = bus
            .subscribe_to_messages(SubscribeOptions::default(), |_| panic!("listener bug"))
            .await;
        let (_good, mut rx) = collect(&bus, SubscribeOptions::default()).await;

        bus.publish(MessageDraft::new("x", "one")).await.unwrap();
        bus.publish(MessageDraft::new("x", "two")).await.unwrap();

        assert_eq!(next(&mut rx).await.content, "one");
        assert_eq!(next(&mut rx).await.content, "two");
    }

    #[tokio::test]
    async fn test_listener_may_unsubscribe_itself() {
        let bus = test_bus().await;
        let slot: Arc<std::sync::Mutex<Option<ListenerHandle>>> = Arc::default();
        let slot_cb = slot.clone();
        let handle = bus
            .subscribe_to_messages(SubscribeOptions::default(), move |_| {
                if let Some(h) = slot_cb.lock().unwrap().as_ref() {
                    h.unsubscribe();
                }
            })
            .await;
        *slot.lock().unwrap() = Some(handle);
        let (_probe, mut rx) = collect(&bus, SubscribeOptions::default()).await;

        bus.publish(MessageDraft::new("x", "bye")).await.unwrap();
        next(&mut rx).await;
        assert_eq!(bus.listener_count(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_clears_listeners_and_closes_channels() {
        let bus = test_bus().await;
        let (_handle, _rx) = collect(&bus, SubscribeOptions::channel(Channel::Direct)).await;
        bus.publish(MessageDraft::new("x", "kept")).await.unwrap();

        bus.cleanup().await;

        assert_eq!(bus.listener_count(), 0);
        assert!(!bus.is_connected());
        assert_eq!(bus.channel_status(Channel::Direct), ChannelStatus::Closed);
        assert_eq!(bus.get_message_history(&HistoryQuery::default()).len(), 1);

        // Channels reopen on demand
        bus.publish(MessageDraft::new("x", "again")).await.unwrap();
        assert!(bus.is_connected());
    }

    #[tokio::test]
    async fn test_history_recipient_query() {
        let bus = test_bus().await;
        bus.publish(MessageDraft::new("x", "d-alice").to("alice").channel(Channel::Direct))
            .await
            .unwrap();
        bus.publish(MessageDraft::new("x", "d-bob").to("bob").channel(Channel::Direct))
            .await
            .unwrap();
        bus.publish(MessageDraft::new("x", "all")).await.unwrap();

        let seen = bus.get_message_history(
            &HistoryQuery::channel(ChannelFilter::All).recipient("alice"),
        );
        let contents: Vec<&str> = seen.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents.len(), 2);
        assert!(contents.contains(&"d-alice"));
        assert!(contents.contains(&"all"));
    }

    #[tokio::test]
    async fn test_history_capacity_from_config() {
        let config = BusConfig {
            history_capacity: 2,
            ..Default::default()
        };
        let bus = MessageBus::connect(MemoryTransport::default(), config)
            .await
            .unwrap();
        let (_handle, mut rx) = collect(&bus, SubscribeOptions::default()).await;
        for i in 0..5 {
            bus.publish(MessageDraft::new("x", format!("m{}", i))).await.unwrap();
        }
        for _ in 0..5 {
            next(&mut rx).await;
        }

        // Late echoes must not resurrect evicted messages
        let history = bus.get_message_history(&HistoryQuery::default());
        let contents: Vec<&str> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m4", "m3"]);
    }

    #[tokio::test]
    async fn test_lost_echoes_do_not_accumulate() {
        // A one-slot transport buffer makes the pump lag and drop echoes
        let transport = MemoryTransport::new(MemoryTransportConfig { capacity: 1 }).unwrap();
        let config = BusConfig {
            history_capacity: 4,
            ..Default::default()
        };
        let bus = MessageBus::connect(transport, config).await.unwrap();

        for i in 0..50 {
            bus.publish(MessageDraft::new("x", format!("m{}", i))).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        let pending = read(&bus.inner.shared.awaiting_echo).len();
        assert!(pending <= 4 * Channel::ALL.len(), "{} ids still awaiting echo", pending);
        assert_eq!(bus.get_message_history(&HistoryQuery::default()).len(), 4);
    }

    #[test]
    fn test_echo_guard_forgets_oldest() {
        let mut guard = EchoGuard::for_history(1);
        for id in ["a", "b", "c", "d"] {
            guard.insert(id);
        }
        assert_eq!(guard.len(), 3);
        assert!(!guard.remove("a"));
        assert!(guard.remove("d"));
        assert!(!guard.remove("d"));

        let mut disabled = EchoGuard::for_history(0);
        disabled.insert("a");
        assert_eq!(disabled.len(), 0);
    }
}
