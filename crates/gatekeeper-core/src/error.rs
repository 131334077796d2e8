use thiserror::Error;

/// Core error types for gatekeeper domain operations
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid usage key '{key}': {reason}")]
    InvalidUsageKey { key: String, reason: String },

    #[error("Invalid access type: {0}")]
    InvalidAccessType(String),

    #[error("Invalid cost mode: {0}")]
    InvalidCostMode(String),

    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl CoreError {
    /// Create a new InvalidUsageKey error
    pub fn invalid_usage_key(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUsageKey {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create a new Configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
