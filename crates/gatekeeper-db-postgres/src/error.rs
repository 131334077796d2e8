//! Error types for the PostgreSQL storage backend.

use gatekeeper_storage::StorageError;
use sqlx_core::error::Error as SqlxError;

/// PostgreSQL error code for undefined table (42P01).
pub const PG_UNDEFINED_TABLE: &str = "42P01";

/// Checks if a sqlx error has a specific PostgreSQL error code.
pub fn has_pg_error_code(err: &SqlxError, code: &str) -> bool {
    if let SqlxError::Database(db_err) = err {
        db_err.code().as_deref() == Some(code)
    } else {
        false
    }
}

/// Checks if a sqlx error is "undefined table" (42P01).
pub fn is_undefined_table(err: &SqlxError) -> bool {
    has_pg_error_code(err, PG_UNDEFINED_TABLE)
}

/// Errors specific to the PostgreSQL storage backend.
#[derive(Debug, thiserror::Error)]
pub enum PostgresError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx_core::error::Error),

    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl PostgresError {
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}

impl From<PostgresError> for StorageError {
    fn from(err: PostgresError) -> Self {
        match err {
            PostgresError::Database(e) => match e {
                SqlxError::PoolTimedOut | SqlxError::PoolClosed | SqlxError::Io(_) => {
                    StorageError::connection_error(e.to_string())
                }
                other if is_undefined_table(&other) => {
                    StorageError::internal(format!("schema missing: {other}"))
                }
                other => StorageError::internal(other.to_string()),
            },
            PostgresError::Config { message } => {
                StorageError::internal(format!("Configuration error: {message}"))
            }
        }
    }
}

/// Result type alias for PostgreSQL operations.
pub type Result<T> = std::result::Result<T, PostgresError>;

#[cfg(test)]
mod tests {
    use super::*;
    use gatekeeper_storage::ErrorCategory;

    #[test]
    fn test_pool_errors_are_infrastructure() {
        let err: StorageError = PostgresError::Database(SqlxError::PoolTimedOut).into();
        assert_eq!(err.category(), ErrorCategory::Infrastructure);

        let err: StorageError = PostgresError::Database(SqlxError::PoolClosed).into();
        assert_eq!(err.category(), ErrorCategory::Infrastructure);
    }

    #[test]
    fn test_config_error_is_internal() {
        let err: StorageError = PostgresError::config("missing url").into();
        assert_eq!(err.category(), ErrorCategory::Internal);
        assert!(err.to_string().contains("missing url"));
    }
}
