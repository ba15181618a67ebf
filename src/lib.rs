//! # agent-bus
//!
//! Message bus for cooperating agents inside one application, with
//! pluggable realtime transports for reaching other instances.
//!
//! ## Overview
//!
//! Agents (UI panels, simulated personas, services) exchange short text
//! messages over three channels: `direct`, `broadcast` and `priority`.
//! Listeners filter by channel, recipient and minimum priority. Every
//! message is kept in a bounded per-channel history for late readers.
//!
//! ## Quick Start
//!
//! ```rust
//! use agent_bus::{BusConfig, Channel, HistoryQuery, MessageBus, MessageDraft};
//! use agent_bus::transport::memory::MemoryTransport;
//!
//! # async fn example() -> agent_bus::Result<()> {
//! let bus = MessageBus::connect(MemoryTransport::default(), BusConfig::default()).await?;
//!
//! bus.send_message(
//!     MessageDraft::new("research-agent", "hello")
//!         .channel(Channel::Broadcast)
//!         .priority(3),
//! )
//! .await;
//!
//! let latest = bus.get_message_history(&HistoryQuery::channel(Channel::Broadcast).limit(1));
//! assert_eq!(latest[0].content, "hello");
//! # Ok(())
//! # }
//! ```
//!
//! ## Transports
//!
//! - **memory**: broadcast channels; clones share topics (tests, one process)
//! - **nats**: core NATS subjects for delivery across processes
//!
//! ## Architecture
//!
//! - **Transport** trait: the realtime channel the bus publishes through
//! - **MessageBus**: history, listener fan-out, connection status
//! - **AgentInbox**: per-agent deduplicated, priority-ordered view
//! - **ToolAccess / ToolBridge**: permission-gated simulated tools
//! - **StateStore**: persisted client settings with safe fallback

pub mod bus;
pub mod error;
pub mod history;
pub mod inbox;
pub mod metadata;
pub mod ordering;
pub mod state;
pub mod tools;
pub mod transport;
pub mod types;

// Re-export core types
pub use bus::{BusConfig, ListenerHandle, MessageBus};
pub use error::{BusError, Result};
pub use history::{HistoryLog, DEFAULT_HISTORY_CAPACITY};
pub use inbox::{AgentInbox, InboxOptions, SendOptions};
pub use metadata::{BehaviorProfile, MessageMetadata, ToolDescriptor, ToolPermissions};
pub use ordering::{sort_messages, MessageOrder};
pub use state::{load_or_default, ClientState, CustomModel, FileStateStore, MemoryStateStore, StateStore};
pub use tools::{
    ApiToolResponse, BridgeState, ToolAccess, ToolAccessConfig, ToolBridge, ToolNotice,
    ToolResult, API_BRIDGE_ID,
};
pub use transport::{Transport, TransportSubscription};
pub use types::{
    Channel, ChannelFilter, ChannelStatus, HistoryQuery, Message, MessageDraft,
    SubscribeOptions,
};

// Re-export transports for convenience
pub use transport::memory::{MemoryTransport, MemoryTransportConfig};
pub use transport::nats::{NatsTransport, NatsTransportConfig};
