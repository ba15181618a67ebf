//! Persisted client state
//!
//! Small JSON blobs a dashboard keeps between sessions: which credentials
//! are configured, agent behavior profiles, and user-defined models. A blob
//! that cannot be read or parsed is replaced by built-in defaults.

use crate::error::{BusError, Result};
use crate::metadata::{BehaviorProfile, MessageMetadata};
use crate::types::Message;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// A model definition added by the user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomModel {
    pub id: String,
    pub name: String,
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_window: Option<u32>,
}

/// Everything persisted on the client
///
/// Fields missing from a saved blob take their built-in defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientState {
    /// Provider name → whether a credential is configured
    pub credentials: HashMap<String, bool>,

    /// Agent id → behavior profile
    pub behavior_profiles: HashMap<String, BehaviorProfile>,

    pub custom_models: Vec<CustomModel>,
}

impl Default for ClientState {
    fn default() -> Self {
        let credentials = ["openai", "anthropic", "github"]
            .iter()
            .map(|p| (p.to_string(), false))
            .collect();

        let mut behavior_profiles = HashMap::new();
        behavior_profiles.insert(
            "default".to_string(),
            BehaviorProfile {
                name: "balanced".to_string(),
                traits: [("creativity", 0.5), ("caution", 0.5)]
                    .iter()
                    .map(|(k, v)| (k.to_string(), *v))
                    .collect(),
                temperature: Some(0.7),
            },
        );

        Self {
            credentials,
            behavior_profiles,
            custom_models: Vec::new(),
        }
    }
}

impl ClientState {
    /// Store the profile carried by a `behavior_update` message
    ///
    /// Returns whether the message carried one.
    pub fn apply_behavior_update(&mut self, message: &Message) -> bool {
        match &message.metadata {
            Some(MessageMetadata::BehaviorUpdate { agent_id, profile }) => {
                self.behavior_profiles
                    .insert(agent_id.clone(), profile.clone());
                true
            }
            _ => false,
        }
    }

    /// Whether a credential is configured for `provider`
    pub fn has_credential(&self, provider: &str) -> bool {
        self.credentials.get(provider).copied().unwrap_or(false)
    }
}

/// Trait for persisting client state
pub trait StateStore: Send + Sync {
    fn save(&self, state: &ClientState) -> Result<()>;

    /// Load saved state; `Ok(None)` when nothing was saved yet
    fn load(&self) -> Result<Option<ClientState>>;
}

/// Load saved state, falling back to defaults on any failure
pub fn load_or_default(store: &dyn StateStore) -> ClientState {
    match store.load() {
        Ok(Some(state)) => state,
        Ok(None) => ClientState::default(),
        Err(e) => {
            tracing::warn!(error = %e, "Saved client state unreadable, using defaults");
            ClientState::default()
        }
    }
}

/// JSON file-based state store
///
/// Atomic writes via temp file + rename to prevent corruption.
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    /// Create a new file state store
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the state file path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateStore for FileStateStore {
    fn save(&self, state: &ClientState) -> Result<()> {
        let json = serde_json::to_string_pretty(state)?;
        let tmp_path = self.path.with_extension("tmp");

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                BusError::State(format!(
                    "Failed to create state directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        std::fs::write(&tmp_path, json).map_err(|e| {
            BusError::State(format!(
                "Failed to write state file {}: {}",
                tmp_path.display(),
                e
            ))
        })?;

        std::fs::rename(&tmp_path, &self.path).map_err(|e| {
            BusError::State(format!(
                "Failed to rename state file {} → {}: {}",
                tmp_path.display(),
                self.path.display(),
                e
            ))
        })?;

        tracing::debug!(path = %self.path.display(), "Client state saved");
        Ok(())
    }

    fn load(&self) -> Result<Option<ClientState>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let json = std::fs::read_to_string(&self.path).map_err(|e| {
            BusError::State(format!(
                "Failed to read state file {}: {}",
                self.path.display(),
                e
            ))
        })?;

        let state: ClientState = serde_json::from_str(&json).map_err(|e| {
            BusError::State(format!(
                "Failed to parse state file {}: {}",
                self.path.display(),
                e
            ))
        })?;

        tracing::debug!(
            path = %self.path.display(),
            profiles = state.behavior_profiles.len(),
            "Client state loaded"
        );
        Ok(Some(state))
    }
}

/// In-memory state store for testing
#[derive(Default)]
pub struct MemoryStateStore {
    state: std::sync::RwLock<Option<ClientState>>,
}

impl StateStore for MemoryStateStore {
    fn save(&self, state: &ClientState) -> Result<()> {
        let mut slot = self
            .state
            .write()
            .map_err(|e| BusError::State(format!("Failed to acquire state lock: {}", e)))?;
        *slot = Some(state.clone());
        Ok(())
    }

    fn load(&self) -> Result<Option<ClientState>> {
        let slot = self
            .state
            .read()
            .map_err(|e| BusError::State(format!("Failed to acquire state lock: {}", e)))?;
        Ok(slot.clone())
    }
}
