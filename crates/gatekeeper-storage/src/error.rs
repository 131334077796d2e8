//! Storage error types for the gatekeeper persistence layer.

use std::fmt;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The requested record was not found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of record that was looked up.
        entity: String,
        /// Lookup key, such as a name, a code or a numeric id.
        id: String,
    },

    /// A stored row could not be converted into a domain record.
    #[error("Invalid record: {message}")]
    InvalidRecord { message: String },

    /// Failed to connect to the storage backend.
    #[error("Connection error: {message}")]
    ConnectionError { message: String },

    /// An internal storage error occurred.
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl StorageError {
    #[must_use]
    pub fn not_found(entity: impl Into<String>, id: impl ToString) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    #[must_use]
    pub fn invalid_record(message: impl Into<String>) -> Self {
        Self::InvalidRecord {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn connection_error(message: impl Into<String>) -> Self {
        Self::ConnectionError {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns the error category for logging/monitoring purposes.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::InvalidRecord { .. } => ErrorCategory::Validation,
            Self::ConnectionError { .. } => ErrorCategory::Infrastructure,
            Self::Internal { .. } => ErrorCategory::Internal,
        }
    }
}

impl From<gatekeeper_core::CoreError> for StorageError {
    fn from(err: gatekeeper_core::CoreError) -> Self {
        Self::invalid_record(err.to_string())
    }
}

/// Categories of storage errors for logging and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    NotFound,
    Validation,
    Infrastructure,
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "not_found"),
            Self::Validation => write!(f, "validation"),
            Self::Infrastructure => write!(f, "infrastructure"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StorageError::not_found("organization", "Acme");
        assert_eq!(err.to_string(), "organization not found: Acme");

        let err = StorageError::not_found("subscription", 7);
        assert_eq!(err.to_string(), "subscription not found: 7");
    }

    #[test]
    fn test_error_category() {
        assert!(StorageError::not_found("endpoint", "E1").is_not_found());
        assert_eq!(
            StorageError::connection_error("refused").category(),
            ErrorCategory::Infrastructure
        );
        assert_eq!(
            StorageError::from(gatekeeper_core::CoreError::InvalidCostMode("x".into())).category(),
            ErrorCategory::Validation
        );
    }
}
