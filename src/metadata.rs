//! Structured message metadata
//!
//! Consumers carry structured payloads (tool announcements, audit records,
//! behavior updates) inside a message. Each payload kind is a variant of
//! `MessageMetadata`, tagged on the wire by a `type` field.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Typed payload attached to a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MessageMetadata {
    /// A bridge declares which tools are usable and with which permissions
    AvailableTools {
        tools: Vec<ToolDescriptor>,
        #[serde(default)]
        permissions: ToolPermissions,
    },

    /// A bridge withdraws all tool access
    ToolAccessRevoked {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// A consumer asks the bridge to re-announce its current tools
    #[serde(rename_all = "camelCase")]
    ToolQuery { requester_id: String },

    /// Audit record of a simulated API call
    #[serde(rename_all = "camelCase")]
    ToolUsage {
        tool_id: String,
        #[serde(default)]
        params: serde_json::Value,
    },

    /// Audit record of a simulated file download
    FileDownload {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
    },

    /// Audit record of a simulated terminal command
    TerminalCommand {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },

    /// An agent's behavior profile changed
    #[serde(rename = "behavior_update", rename_all = "camelCase")]
    BehaviorUpdate {
        agent_id: String,
        profile: BehaviorProfile,
    },
}

impl MessageMetadata {
    /// Wire name of the `type` tag
    pub fn kind(&self) -> &'static str {
        match self {
            MessageMetadata::AvailableTools { .. } => "available-tools",
            MessageMetadata::ToolAccessRevoked { .. } => "tool-access-revoked",
            MessageMetadata::ToolQuery { .. } => "tool-query",
            MessageMetadata::ToolUsage { .. } => "tool-usage",
            MessageMetadata::FileDownload { .. } => "file-download",
            MessageMetadata::TerminalCommand { .. } => "terminal-command",
            MessageMetadata::BehaviorUpdate { .. } => "behavior_update",
        }
    }

    /// Whether this payload changes tool-bridge state
    pub fn is_tool_state(&self) -> bool {
        matches!(
            self,
            MessageMetadata::AvailableTools { .. } | MessageMetadata::ToolAccessRevoked { .. }
        )
    }
}

/// A tool a bridge makes available
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Stable tool identifier (e.g., "openai")
    pub id: String,

    /// Display name
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ToolDescriptor {
    /// Create a tool descriptor
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
        }
    }

    /// Set the description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Capabilities granted alongside the tool list
///
/// API tools are gated by tool id; downloads and terminal commands are
/// gated by these flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolPermissions {
    #[serde(default)]
    pub file_download: bool,

    #[serde(default)]
    pub terminal_access: bool,
}

impl ToolPermissions {
    /// Every permission granted
    pub fn all() -> Self {
        Self {
            file_download: true,
            terminal_access: true,
        }
    }
}

/// Persona settings shared between agents
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BehaviorProfile {
    pub name: String,

    /// Trait name → weight in 0.0..=1.0 (not validated)
    #[serde(default)]
    pub traits: HashMap<String, f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_available_tools_wire_format() {
        let meta = MessageMetadata::AvailableTools {
            tools: vec![ToolDescriptor::new("openai", "OpenAI")],
            permissions: ToolPermissions {
                file_download: true,
                terminal_access: false,
            },
        };

        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["type"], "available-tools");
        assert_eq!(json["tools"][0]["id"], "openai");
        assert_eq!(json["permissions"]["fileDownload"], true);
        assert_eq!(json["permissions"]["terminalAccess"], false);
    }

    #[test]
    fn test_permissions_default_when_missing() {
        let json = r#"{"type":"available-tools","tools":[{"id":"openai","name":"OpenAI"}]}"#;
        let meta: MessageMetadata = serde_json::from_str(json).unwrap();
        match meta {
            MessageMetadata::AvailableTools { tools, permissions } => {
                assert_eq!(tools.len(), 1);
                assert_eq!(permissions, ToolPermissions::default());
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn test_behavior_update_keeps_underscore_tag() {
        let meta = MessageMetadata::BehaviorUpdate {
            agent_id: "research-agent".to_string(),
            profile: BehaviorProfile {
                name: "cautious".to_string(),
                ..Default::default()
            },
        };
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["type"], "behavior_update");
        assert_eq!(json["agentId"], "research-agent");
        assert_eq!(meta.kind(), "behavior_update");
    }

    #[test]
    fn test_unknown_type_rejected() {
        let json = r#"{"type":"something-else","foo":1}"#;
        assert!(serde_json::from_str::<MessageMetadata>(json).is_err());
    }

    #[test]
    fn test_kind_matches_serialized_tag() {
        let samples = vec![
            MessageMetadata::ToolAccessRevoked { reason: None },
            MessageMetadata::ToolQuery {
                requester_id: "a".into(),
            },
            MessageMetadata::ToolUsage {
                tool_id: "openai".into(),
                params: serde_json::json!({}),
            },
            MessageMetadata::FileDownload {
                url: "https://example.com/a.csv".into(),
                filename: None,
            },
            MessageMetadata::TerminalCommand {
                command: "ls".into(),
                args: vec!["-la".into()],
            },
        ];

        for meta in samples {
            let json = serde_json::to_value(&meta).unwrap();
            assert_eq!(json["type"], meta.kind());
        }
    }

    #[test]
    fn test_is_tool_state() {
        assert!(MessageMetadata::ToolAccessRevoked { reason: None }.is_tool_state());
        assert!(!MessageMetadata::ToolQuery {
            requester_id: "a".into()
        }
        .is_tool_state());
    }
}
