//! PostgreSQL storage backend for the API gatekeeper.
//!
//! Reads organizations, endpoints, subscriptions, permissions and pricing from
//! the administrative schema and writes usage summaries with an additive
//! upsert keyed by `(organization, subscription, endpoint, usage_end_date)`.
//!
//! # Example
//!
//! ```ignore
//! use gatekeeper_db_postgres::{PostgresConfig, connect};
//!
//! let storage = connect(&PostgresConfig::new("postgres://gk:gk@localhost/gatekeeper")).await?;
//! ```

pub mod config;
pub mod error;
pub mod pool;
pub mod storage;

pub use config::PostgresConfig;
pub use error::{PostgresError, Result};
pub use pool::{REQUIRED_TABLES, check_schema, create_pool, mask_password};
pub use storage::PostgresStorage;

/// Creates a pool, checks the schema and creates the usage index when
/// configured to.
pub async fn connect(config: &PostgresConfig) -> Result<PostgresStorage> {
    let pool = create_pool(config).await?;
    check_schema(&pool).await?;

    let storage = PostgresStorage::new(pool);
    if config.ensure_schema {
        storage.ensure_schema().await?;
    }
    Ok(storage)
}
