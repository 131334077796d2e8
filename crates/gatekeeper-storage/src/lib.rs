//! # gatekeeper-storage
//!
//! Persistence contract for the API gatekeeper.
//!
//! This crate defines the trait storage backends implement and the errors they
//! return. Implementations live in `gatekeeper-db-memory` and
//! `gatekeeper-db-postgres`.
//!
//! ## Example
//!
//! ```ignore
//! use gatekeeper_storage::{GatekeeperStorage, StorageError};
//!
//! async fn org_id(storage: &dyn GatekeeperStorage, name: &str) -> Result<i32, StorageError> {
//!     storage
//!         .get_organization_by_name(name)
//!         .await?
//!         .map(|org| org.id)
//!         .ok_or_else(|| StorageError::not_found("organization", name))
//! }
//! ```

mod error;
mod traits;

pub use error::{ErrorCategory, StorageError};
pub use traits::{GatekeeperStorage, fetch_all_endpoints};

/// Type alias for a storage result.
pub type StorageResult<T> = Result<T, StorageError>;

/// Type alias for a shared storage trait object.
pub type DynGatekeeperStorage = std::sync::Arc<dyn GatekeeperStorage>;
