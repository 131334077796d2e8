//! Read-through cache with a process-local L1 in front of the shared L2.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use serde::{Serialize, de::DeserializeOwned};

use super::CacheError;
use super::shared::{SharedStore, glob_match};
use crate::metrics;

/// Upper bound on L1 entries per process.
const LOCAL_CAPACITY: u64 = 100_000;

/// Two-tier byte cache: L1 (moka, TTL-evicted) + L2 ([`SharedStore`]).
///
/// TTLs are fixed per tier at construction. Shared-tier failures degrade to a
/// miss on read and are logged on write; they never fail the caller.
pub struct TwoTierCache {
    local: Cache<String, Arc<Vec<u8>>>,
    shared: SharedStore,
    shared_ttl: Duration,
}

impl TwoTierCache {
    pub fn new(shared: SharedStore, local_ttl: Duration, shared_ttl: Duration) -> Self {
        Self {
            local: Cache::builder()
                .max_capacity(LOCAL_CAPACITY)
                .time_to_live(local_ttl)
                .build(),
            shared,
            shared_ttl,
        }
    }

    pub fn shared(&self) -> &SharedStore {
        &self.shared
    }

    /// Looks up `key` in L1, then L2. An L2 hit is promoted to L1.
    pub async fn get_raw(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        if let Some(data) = self.local.get(key).await {
            tracing::trace!(key, "cache hit (L1)");
            metrics::record_cache_hit("L1");
            return Some(data);
        }

        match self.shared.get(key).await {
            Ok(Some(data)) => {
                tracing::debug!(key, "cache hit (L2)");
                metrics::record_cache_hit("L2");
                let data = Arc::new(data);
                self.local.insert(key.to_string(), Arc::clone(&data)).await;
                Some(data)
            }
            Ok(None) => {
                metrics::record_cache_miss();
                None
            }
            Err(e) => {
                tracing::warn!(key, error = %e, "shared cache read failed, treating as miss");
                metrics::record_cache_miss();
                None
            }
        }
    }

    /// Writes `value` to both tiers.
    pub async fn set_raw(&self, key: &str, value: Vec<u8>) {
        let data = Arc::new(value);
        self.local.insert(key.to_string(), Arc::clone(&data)).await;

        if let Err(e) = self.shared.set(key, &data, self.shared_ttl).await {
            tracing::warn!(key, error = %e, "shared cache write failed");
        }
    }

    /// Removes `key` from both tiers.
    pub async fn invalidate(&self, key: &str) {
        self.local.invalidate(key).await;
        match self.shared.delete(&[key.to_string()]).await {
            Ok(_) => metrics::record_cache_invalidation(1),
            Err(e) => tracing::warn!(key, error = %e, "shared cache delete failed"),
        }
        tracing::debug!(key, "cache invalidated");
    }

    /// Removes every key matching a glob `pattern` from both tiers.
    ///
    /// Returns the number of shared-tier keys removed.
    pub async fn invalidate_matching(&self, pattern: &str) -> usize {
        let local_keys: Vec<Arc<String>> = self
            .local
            .iter()
            .filter(|(key, _)| glob_match(pattern, key))
            .map(|(key, _)| key)
            .collect();
        for key in local_keys {
            self.local.invalidate(key.as_str()).await;
        }

        let removed = match self.shared.delete_matching(pattern).await {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(pattern, error = %e, "shared cache pattern delete failed");
                0
            }
        };
        metrics::record_cache_invalidation(removed);
        tracing::debug!(pattern, removed, "cache pattern invalidated");
        removed
    }

    /// Drops every L1 entry. The shared tier is untouched.
    pub async fn clear_local(&self) -> usize {
        let count = self.local_len().await;
        self.local.invalidate_all();
        self.local.run_pending_tasks().await;
        metrics::set_cache_entries("L1", 0);
        count
    }

    /// Live L1 entries, after pending expirations have been applied.
    pub async fn local_len(&self) -> usize {
        self.local.run_pending_tasks().await;
        self.local.entry_count() as usize
    }
}

/// Serialize/deserialize pair bound to one value type.
pub struct Codec<T> {
    pub serialize: fn(&T) -> Result<Vec<u8>, String>,
    pub deserialize: fn(&[u8]) -> Result<T, String>,
}

impl<T> Clone for Codec<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Codec<T> {}

impl<T: Serialize + DeserializeOwned> Codec<T> {
    pub fn json() -> Self {
        Self {
            serialize: |v| serde_json::to_vec(v).map_err(|e| e.to_string()),
            deserialize: |b| serde_json::from_slice(b).map_err(|e| e.to_string()),
        }
    }

    pub fn msgpack() -> Self {
        Self {
            serialize: |v| rmp_serde::to_vec_named(v).map_err(|e| e.to_string()),
            deserialize: |b| rmp_serde::from_slice(b).map_err(|e| e.to_string()),
        }
    }
}

/// A view of a [`TwoTierCache`] that stores exactly one value type.
///
/// Every key handed to a `TypedCache` must belong to its namespace, so the
/// bytes under a key always decode to `T`.
pub struct TypedCache<T> {
    cache: Arc<TwoTierCache>,
    namespace: &'static str,
    codec: Codec<T>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for TypedCache<T> {
    fn clone(&self) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
            namespace: self.namespace,
            codec: self.codec,
            _marker: PhantomData,
        }
    }
}

impl<T> TypedCache<T> {
    pub fn new(cache: Arc<TwoTierCache>, namespace: &'static str, codec: Codec<T>) -> Self {
        Self {
            cache,
            namespace,
            codec,
            _marker: PhantomData,
        }
    }

    pub fn namespace(&self) -> &'static str {
        self.namespace
    }

    pub async fn get(&self, key: &str) -> Result<Option<T>, CacheError> {
        match self.cache.get_raw(key).await {
            Some(bytes) => self.decode(key, &bytes).await.map(Some),
            None => Ok(None),
        }
    }

    pub async fn set(&self, key: &str, value: &T) -> Result<(), CacheError> {
        let bytes = (self.codec.serialize)(value).map_err(CacheError::Codec)?;
        self.cache.set_raw(key, bytes).await;
        Ok(())
    }

    pub async fn invalidate(&self, key: &str) {
        self.cache.invalidate(key).await;
    }

    /// Cache-aside read.
    ///
    /// On a miss in both tiers `fallback` runs and its value is written to both
    /// tiers. Fallback errors are returned as-is and nothing is cached. There is
    /// no single-flight: concurrent misses may each run the fallback.
    pub async fn get_or_populate<F, Fut, E>(&self, key: &str, fallback: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CacheError>,
    {
        if let Some(value) = self.get(key).await? {
            return Ok(value);
        }

        metrics::record_cache_fallback(self.namespace);
        let value = fallback().await?;
        self.set(key, &value).await?;
        Ok(value)
    }

    async fn decode(&self, key: &str, bytes: &[u8]) -> Result<T, CacheError> {
        match (self.codec.deserialize)(bytes) {
            Ok(value) => Ok(value),
            Err(e) => {
                tracing::error!(key, namespace = self.namespace, error = %e, "malformed cached value");
                self.cache.invalidate(key).await;
                Err(CacheError::Codec(format!("{key}: {e}")))
            }
        }
    }
}
