//! Error types for agent-bus

use thiserror::Error;

/// Errors that can occur on the message bus and its adapters
#[derive(Debug, Error)]
pub enum BusError {
    /// Transport connection failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// Publish failure
    #[error("Failed to publish message to topic '{topic}': {reason}")]
    Publish {
        topic: String,
        reason: String,
    },

    /// Subscribe failure
    #[error("Failed to subscribe to topic '{topic}': {reason}")]
    Subscribe {
        topic: String,
        reason: String,
    },

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Shared state could not be read or written (lock poisoned, bad file)
    #[error("State error: {0}")]
    State(String),

    /// No bridge has announced available tools, or access was revoked
    #[error("Tool bridge is not active")]
    ToolBridgeInactive,

    /// The bridge is active but did not grant this tool
    #[error("Tool '{0}' is not available")]
    ToolUnavailable(String),

    /// The bridge is active but withheld a permission
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Terminal command matched the restricted fragment list
    #[error("Command is restricted: contains '{0}'")]
    RestrictedCommand(String),
}

/// Result type alias for bus operations
pub type Result<T> = std::result::Result<T, BusError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_errors_mention_cause() {
        assert!(BusError::ToolBridgeInactive.to_string().contains("not active"));
        assert!(BusError::RestrictedCommand("sudo".into())
            .to_string()
            .contains("restricted"));
        assert_eq!(
            BusError::ToolUnavailable("openai".into()).to_string(),
            "Tool 'openai' is not available"
        );
    }

    #[test]
    fn test_serialization_error_from() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let bus_err: BusError = err.into();
        assert!(matches!(bus_err, BusError::Serialization(_)));
    }
}
