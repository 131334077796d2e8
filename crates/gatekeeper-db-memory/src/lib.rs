//! In-memory storage backend for the API gatekeeper.
//!
//! This crate provides an implementation of the `GatekeeperStorage` trait from
//! `gatekeeper-storage` on top of `DashMap`. It is used by tests and by
//! single-node deployments without a database.
//!
//! # Example
//!
//! ```ignore
//! use gatekeeper_db_memory::InMemoryStorage;
//! use gatekeeper_core::Organization;
//!
//! let storage = InMemoryStorage::new();
//! storage.insert_organization(Organization { id: 1, name: "Acme".into() });
//! let org = storage.get_organization_by_name("Acme").await?;
//! ```

pub mod storage;

pub use gatekeeper_storage::{DynGatekeeperStorage, GatekeeperStorage, StorageError};
pub use storage::InMemoryStorage;

/// Creates a new shareable in-memory storage instance.
pub fn create_memory_storage() -> DynGatekeeperStorage {
    std::sync::Arc::new(InMemoryStorage::new())
}
