//! Caching layers.
//!
//! - [`two_tier`]: TTL-evicted L1 in front of the shared tier, plus typed views
//! - [`shared`]: Redis or in-process shared tier, holding values and counters
//! - [`counter`]: batches usage increments before they reach the shared tier

pub mod counter;
pub mod shared;
pub mod two_tier;

pub use counter::CounterAggregator;
pub use shared::{CounterDelta, MemoryStore, SharedStore};
pub use two_tier::{Codec, TwoTierCache, TypedCache};

use crate::config::RedisConfig;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    #[error("codec error: {0}")]
    Codec(String),
}

/// Builds the shared tier from configuration.
///
/// Falls back to the in-process store when Redis is disabled or unreachable,
/// so a single instance keeps working without it.
pub async fn create_shared_store(config: &RedisConfig) -> SharedStore {
    if !config.enabled {
        tracing::info!("Redis disabled, using in-process shared store");
        return SharedStore::memory();
    }

    tracing::info!(url = %config.url, "Connecting to Redis");

    let timeout = Some(config.timeout());
    let mut redis_config = deadpool_redis::Config::from_url(&config.url);
    let pool_config = redis_config
        .pool
        .get_or_insert_with(|| deadpool_redis::PoolConfig::new(config.pool_size));
    pool_config.max_size = config.pool_size;
    pool_config.timeouts.wait = timeout;
    pool_config.timeouts.create = timeout;
    pool_config.timeouts.recycle = timeout;

    let pool = match redis_config.create_pool(Some(deadpool_redis::Runtime::Tokio1)) {
        Ok(pool) => pool,
        Err(e) => {
            tracing::warn!(
                error = %e,
                "Failed to create Redis pool. Falling back to in-process shared store."
            );
            return SharedStore::memory();
        }
    };

    match pool.get().await {
        Ok(_) => {
            tracing::info!("Connected to Redis");
            SharedStore::redis(pool)
        }
        Err(e) => {
            tracing::warn!(
                error = %e,
                "Failed to connect to Redis. Falling back to in-process shared store."
            );
            SharedStore::memory()
        }
    }
}
