//! Tool access gating
//!
//! A `ToolBridge` announces which simulated external tools are usable by
//! broadcasting `available-tools` metadata. Each consumer's `ToolAccess`
//! tracks the latest announcement and gates API calls, file downloads and
//! terminal commands on it.
//!
//! Every allowed operation is simulated: an audit message goes to the
//! bridge, then a fixed delay elapses, then a canned result is returned.
//! Nothing is executed, fetched or written.

use crate::bus::{ListenerHandle, MessageBus};
use crate::error::{BusError, Result};
use crate::metadata::{MessageMetadata, ToolDescriptor, ToolPermissions};
use crate::types::{Channel, HistoryQuery, Message, MessageDraft, SubscribeOptions};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Recipient id for audit messages
pub const API_BRIDGE_ID: &str = "api-bridge";

/// Command fragments that are never run
pub const DEFAULT_RESTRICTED_FRAGMENTS: &[&str] = &[
    "sudo",
    "rm -rf",
    "mkfs",
    "dd if=",
    "shutdown",
    "reboot",
    "chmod 777",
    ":(){",
    "> /dev/sd",
];

/// Tool access configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolAccessConfig {
    /// Artificial latency of every simulated operation, in milliseconds
    pub simulated_latency_ms: u64,

    /// Lower-case substrings that block a terminal command
    pub restricted_fragments: Vec<String>,

    /// Where audit messages are sent
    pub audit_recipient: String,

    /// Ask the bridge to re-announce its tools on attach
    pub query_on_attach: bool,
}

impl Default for ToolAccessConfig {
    fn default() -> Self {
        Self {
            simulated_latency_ms: 1000,
            restricted_fragments: DEFAULT_RESTRICTED_FRAGMENTS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            audit_recipient: API_BRIDGE_ID.to_string(),
            query_on_attach: true,
        }
    }
}

impl ToolAccessConfig {
    /// Simulated latency as a duration
    pub fn simulated_latency(&self) -> Duration {
        Duration::from_millis(self.simulated_latency_ms)
    }

    /// First restricted fragment contained in `command_line`, if any
    pub fn restricted_fragment(&self, command_line: &str) -> Option<&str> {
        let lower = command_line.to_lowercase();
        self.restricted_fragments
            .iter()
            .map(String::as_str)
            .find(|fragment| lower.contains(&fragment.to_lowercase()))
    }
}

/// What a consumer currently knows about the bridge
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum BridgeState {
    #[default]
    Inactive,
    Active {
        tools: Vec<ToolDescriptor>,
        permissions: ToolPermissions,
    },
}

/// User-facing notification about tool access
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolNotice {
    BridgeActivated { tool_count: usize },
    BridgeRevoked { reason: Option<String> },
    Denied { operation: String, reason: String },
}

/// Outcome of a download or terminal command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    /// Successful result
    pub fn ok(output: serde_json::Value) -> Self {
        Self {
            success: true,
            output: Some(output),
            error: None,
        }
    }

    /// Failed result
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
        }
    }
}

/// Simulated response of an API tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiToolResponse {
    pub success: bool,
    pub tool_id: String,
    pub request_id: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Default)]
struct TrackedState {
    state: BridgeState,
    /// Timestamp of the message that produced `state`
    updated_at: u64,
}

/// Per-consumer view of tool availability
pub struct ToolAccess {
    bus: MessageBus,
    agent_id: String,
    config: ToolAccessConfig,
    state: Arc<RwLock<TrackedState>>,
    notices: broadcast::Sender<ToolNotice>,
    pending: Arc<AtomicUsize>,
    handle: Mutex<Option<ListenerHandle>>,
}

impl ToolAccess {
    /// Start tracking bridge announcements for `agent_id`
    ///
    /// The latest announcement already in history is applied, then the
    /// bridge is asked to re-announce so a consumer that attaches after the
    /// bridge went live does not stay inactive.
    pub async fn attach(
        bus: &MessageBus,
        agent_id: impl Into<String>,
        config: ToolAccessConfig,
    ) -> Self {
        let agent_id = agent_id.into();
        let state = Arc::new(RwLock::new(TrackedState::default()));
        let (notices, _) = broadcast::channel(32);

        let listener_state = state.clone();
        let listener_notices = notices.clone();
        let handle = bus
            .subscribe_to_messages(SubscribeOptions::recipient(agent_id.clone()), move |message| {
                apply_announcement(&listener_state, &listener_notices, message);
            })
            .await;

        let latest = bus
            .get_message_history(&HistoryQuery::default().recipient(agent_id.clone()))
            .into_iter()
            .find(|m| m.metadata.as_ref().map_or(false, MessageMetadata::is_tool_state));
        if let Some(message) = latest {
            apply_announcement(&state, &notices, &message);
        }

        let access = Self {
            bus: bus.clone(),
            agent_id,
            config,
            state,
            notices,
            pending: Arc::new(AtomicUsize::new(0)),
            handle: Mutex::new(Some(handle)),
        };

        if access.config.query_on_attach {
            access.request_tools().await;
        }
        access
    }

    /// Ask any live bridge to re-announce its tools
    pub async fn request_tools(&self) -> bool {
        let draft = MessageDraft::new(self.agent_id.clone(), "Requesting available tools")
            .channel(Channel::Broadcast)
            .metadata(MessageMetadata::ToolQuery {
                requester_id: self.agent_id.clone(),
            });
        self.bus.send_message(draft).await
    }

    /// Get the current bridge state
    pub fn state(&self) -> BridgeState {
        read(&self.state).state.clone()
    }

    /// Whether a bridge has announced tools
    pub fn is_tool_bridge_active(&self) -> bool {
        matches!(read(&self.state).state, BridgeState::Active { .. })
    }

    /// Get the announced tools
    pub fn available_tools(&self) -> Vec<ToolDescriptor> {
        match &read(&self.state).state {
            BridgeState::Active { tools, .. } => tools.clone(),
            BridgeState::Inactive => Vec::new(),
        }
    }

    /// Get the announced permissions
    pub fn permissions(&self) -> ToolPermissions {
        match &read(&self.state).state {
            BridgeState::Active { permissions, .. } => *permissions,
            BridgeState::Inactive => ToolPermissions::default(),
        }
    }

    /// Whether `tool_id` was announced
    pub fn is_tool_available(&self, tool_id: &str) -> bool {
        match &read(&self.state).state {
            BridgeState::Active { tools, .. } => tools.iter().any(|t| t.id == tool_id),
            BridgeState::Inactive => false,
        }
    }

    /// Notifications for the user (denials, activation changes)
    pub fn notices(&self) -> broadcast::Receiver<ToolNotice> {
        self.notices.subscribe()
    }

    /// Simulated operations currently waiting out their latency
    pub fn pending_operations(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Call a simulated external API through the bridge
    pub async fn use_api_tool(
        &self,
        tool_id: &str,
        params: serde_json::Value,
    ) -> Result<ApiToolResponse> {
        if !self.is_tool_bridge_active() {
            self.deny("api", &BusError::ToolBridgeInactive);
            return Err(BusError::ToolBridgeInactive);
        }
        if !self.is_tool_available(tool_id) {
            let err = BusError::ToolUnavailable(tool_id.to_string());
            self.deny("api", &err);
            return Err(err);
        }

        self.audit(
            format!("Using API tool: {}", tool_id),
            MessageMetadata::ToolUsage {
                tool_id: tool_id.to_string(),
                params: params.clone(),
            },
        )
        .await;
        self.simulate_latency().await;

        Ok(ApiToolResponse {
            success: true,
            tool_id: tool_id.to_string(),
            request_id: uuid::Uuid::new_v4().to_string(),
            data: serde_json::json!({
                "message": format!("Simulated response from {}", tool_id),
                "params": params,
            }),
        })
    }

    /// Simulate downloading `url`
    pub async fn download_file(&self, url: &str, filename: Option<&str>) -> ToolResult {
        if let Err(e) = self.check_permission("download", |p| p.file_download, "file download") {
            return ToolResult::failure(e.to_string());
        }

        let filename = filename
            .map(str::to_string)
            .or_else(|| {
                url.rsplit('/')
                    .next()
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| "download".to_string());

        self.audit(
            format!("Downloading file: {}", url),
            MessageMetadata::FileDownload {
                url: url.to_string(),
                filename: Some(filename.clone()),
            },
        )
        .await;
        self.simulate_latency().await;

        ToolResult::ok(serde_json::json!({
            "url": url,
            "filename": filename,
            "message": format!("Simulated download of {}", filename),
        }))
    }

    /// Simulate running a terminal command
    ///
    /// Restricted commands fail before any audit or delay.
    pub async fn run_terminal_command(&self, command: &str, args: &[&str]) -> ToolResult {
        if let Err(e) = self.check_permission("terminal", |p| p.terminal_access, "terminal access") {
            return ToolResult::failure(e.to_string());
        }

        let command_line = std::iter::once(command)
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ");

        if let Some(fragment) = self.config.restricted_fragment(&command_line) {
            let err = BusError::RestrictedCommand(fragment.to_string());
            self.deny("terminal", &err);
            return ToolResult::failure(err.to_string());
        }

        self.audit(
            format!("Running command: {}", command_line),
            MessageMetadata::TerminalCommand {
                command: command.to_string(),
                args: args.iter().map(|a| a.to_string()).collect(),
            },
        )
        .await;
        self.simulate_latency().await;

        ToolResult::ok(serde_json::json!({
            "command": command_line,
            "stdout": format!("Simulated output of `{}`", command_line),
            "exitCode": 0,
        }))
    }

    /// Stop tracking announcements. Safe to call repeatedly.
    pub fn detach(&self) {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.unsubscribe();
            tracing::debug!(agent = %self.agent_id, "Tool access detached");
        }
    }

    fn check_permission(
        &self,
        operation: &str,
        granted: impl Fn(&ToolPermissions) -> bool,
        label: &str,
    ) -> Result<()> {
        let err = match &read(&self.state).state {
            BridgeState::Inactive => Some(BusError::ToolBridgeInactive),
            BridgeState::Active { permissions, .. } if !granted(permissions) => {
                Some(BusError::PermissionDenied(format!("{} not granted", label)))
            }
            BridgeState::Active { .. } => None,
        };
        match err {
            Some(err) => {
                self.deny(operation, &err);
                Err(err)
            }
            None => Ok(()),
        }
    }

    fn deny(&self, operation: &str, err: &BusError) {
        tracing::warn!(
            agent = %self.agent_id,
            operation,
            reason = %err,
            "Tool operation denied"
        );
        let _ = self.notices.send(ToolNotice::Denied {
            operation: operation.to_string(),
            reason: err.to_string(),
        });
    }

    async fn audit(&self, content: String, metadata: MessageMetadata) {
        let draft = MessageDraft::new(self.agent_id.clone(), content)
            .to(self.config.audit_recipient.clone())
            .channel(Channel::Direct)
            .metadata(metadata);
        if !self.bus.send_message(draft).await {
            tracing::warn!(agent = %self.agent_id, "Audit message not delivered");
        }
    }

    async fn simulate_latency(&self) {
        let _guard = PendingGuard::new(&self.pending);
        tokio::time::sleep(self.config.simulated_latency()).await;
    }
}

impl Drop for ToolAccess {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Counts an operation as pending until dropped, including on cancellation
struct PendingGuard<'a>(&'a AtomicUsize);

impl<'a> PendingGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Last-write-wins transition on `available-tools` / `tool-access-revoked`
fn apply_announcement(
    state: &RwLock<TrackedState>,
    notices: &broadcast::Sender<ToolNotice>,
    message: &Message,
) {
    let next = match &message.metadata {
        Some(MessageMetadata::AvailableTools { tools, permissions }) => BridgeState::Active {
            tools: tools.clone(),
            permissions: *permissions,
        },
        Some(MessageMetadata::ToolAccessRevoked { .. }) => BridgeState::Inactive,
        _ => return,
    };

    {
        let mut tracked = state.write().unwrap_or_else(PoisonError::into_inner);
        if message.timestamp < tracked.updated_at {
            tracing::debug!(message_id = %message.id, "Ignoring stale tool announcement");
            return;
        }
        tracked.updated_at = message.timestamp;
        if tracked.state == next {
            tracing::debug!(message_id = %message.id, "Tool announcement unchanged");
            return;
        }
        tracked.state = next;
    }

    let notice = match &message.metadata {
        Some(MessageMetadata::AvailableTools { tools, .. }) => {
            tracing::info!(bridge = %message.sender_id, tools = tools.len(), "Tool bridge active");
            ToolNotice::BridgeActivated {
                tool_count: tools.len(),
            }
        }
        Some(MessageMetadata::ToolAccessRevoked { reason }) => {
            tracing::info!(bridge = %message.sender_id, reason = ?reason, "Tool access revoked");
            ToolNotice::BridgeRevoked {
                reason: reason.clone(),
            }
        }
        _ => return,
    };
    let _ = notices.send(notice);
}

fn read(state: &RwLock<TrackedState>) -> std::sync::RwLockReadGuard<'_, TrackedState> {
    state.read().unwrap_or_else(PoisonError::into_inner)
}

/// The component that grants tools to consumers
pub struct ToolBridge {
    bus: MessageBus,
    bridge_id: String,
    current: Arc<RwLock<Option<(Vec<ToolDescriptor>, ToolPermissions)>>>,
    responder: Mutex<Option<(ListenerHandle, JoinHandle<()>)>>,
}

impl ToolBridge {
    /// Create a bridge publishing as `bridge_id`
    pub fn new(bus: &MessageBus, bridge_id: impl Into<String>) -> Self {
        Self {
            bus: bus.clone(),
            bridge_id: bridge_id.into(),
            current: Arc::new(RwLock::new(None)),
            responder: Mutex::new(None),
        }
    }

    /// Get the bridge id
    pub fn bridge_id(&self) -> &str {
        &self.bridge_id
    }

    /// Whether tools are currently granted
    pub fn is_active(&self) -> bool {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Grant `tools` and broadcast the announcement
    pub async fn activate(
        &self,
        tools: Vec<ToolDescriptor>,
        permissions: ToolPermissions,
    ) -> Result<Message> {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) =
            Some((tools.clone(), permissions));
        tracing::info!(bridge = %self.bridge_id, tools = tools.len(), "Activating tool bridge");
        announce(&self.bus, &self.bridge_id, tools, permissions).await
    }

    /// Withdraw all tools and broadcast the revocation
    pub async fn revoke(&self, reason: Option<String>) -> Result<Message> {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = None;
        tracing::info!(bridge = %self.bridge_id, reason = ?reason, "Revoking tool access");

        let draft = MessageDraft::new(self.bridge_id.clone(), "Tool access revoked")
            .role("Bridge")
            .channel(Channel::Broadcast)
            .priority(5)
            .metadata(MessageMetadata::ToolAccessRevoked { reason });
        self.bus.publish(draft).await
    }

    /// Answer `tool-query` messages with the current announcement
    ///
    /// Does nothing if already answering.
    pub async fn start_answering_queries(&self) {
        if self
            .responder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
        {
            return;
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let handle = self
            .bus
            .subscribe_to_messages(SubscribeOptions::channel(Channel::Broadcast), move |message| {
                if let Some(MessageMetadata::ToolQuery { requester_id }) = &message.metadata {
                    let _ = tx.send(requester_id.clone());
                }
            })
            .await;

        let bus = self.bus.clone();
        let bridge_id = self.bridge_id.clone();
        let current = self.current.clone();
        let task = tokio::spawn(async move {
            while let Some(requester) = rx.recv().await {
                let snapshot = current
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                let Some((tools, permissions)) = snapshot else {
                    tracing::debug!(requester = %requester, "Tool query ignored, bridge inactive");
                    continue;
                };
                tracing::debug!(requester = %requester, "Answering tool query");
                if let Err(e) = announce(&bus, &bridge_id, tools, permissions).await {
                    tracing::warn!(error = %e, "Failed to answer tool query");
                }
            }
        });

        let mut responder = self.responder.lock().unwrap_or_else(PoisonError::into_inner);
        if responder.is_some() {
            // Lost a race with a concurrent call
            handle.unsubscribe();
            task.abort();
        } else {
            *responder = Some((handle, task));
        }
    }

    /// Stop answering queries
    pub fn stop(&self) {
        let responder = self
            .responder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some((handle, task)) = responder {
            handle.unsubscribe();
            task.abort();
        }
    }
}

impl Drop for ToolBridge {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn announce(
    bus: &MessageBus,
    bridge_id: &str,
    tools: Vec<ToolDescriptor>,
    permissions: ToolPermissions,
) -> Result<Message> {
    let draft = MessageDraft::new(bridge_id, format!("{} tools available", tools.len()))
        .role("Bridge")
        .channel(Channel::Broadcast)
        .priority(5)
        .metadata(MessageMetadata::AvailableTools { tools, permissions });
    bus.publish(draft).await
}
