//! Shared (L2) tier: Redis when available, an in-process map otherwise.
//!
//! Besides plain byte values this tier holds the additive usage counters, so it
//! exposes float increments and prefix snapshots in addition to get/set/delete.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use deadpool_redis::Pool;
use redis::AsyncCommands;

use super::CacheError;

const SCAN_COUNT: usize = 500;

/// One additive counter update.
#[derive(Debug, Clone, PartialEq)]
pub struct CounterDelta {
    pub key: String,
    pub delta: f64,
    pub ttl: Duration,
}

#[derive(Clone)]
pub enum SharedStore {
    /// Multi-instance: values and counters live in Redis
    Redis(Pool),
    /// Single-instance fallback
    Memory(Arc<MemoryStore>),
}

impl SharedStore {
    pub fn memory() -> Self {
        SharedStore::Memory(Arc::new(MemoryStore::default()))
    }

    pub fn redis(pool: Pool) -> Self {
        SharedStore::Redis(pool)
    }

    pub fn redis_pool(&self) -> Option<&Pool> {
        match self {
            SharedStore::Redis(pool) => Some(pool),
            SharedStore::Memory(_) => None,
        }
    }

    pub fn mode(&self) -> &'static str {
        match self {
            SharedStore::Redis(_) => "redis",
            SharedStore::Memory(_) => "memory",
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        match self {
            SharedStore::Memory(store) => Ok(store.get_bytes(key)),
            SharedStore::Redis(pool) => {
                let mut conn = pool.get().await?;
                Ok(conn.get::<_, Option<Vec<u8>>>(key).await?)
            }
        }
    }

    pub async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError> {
        match self {
            SharedStore::Memory(store) => {
                store.set_bytes(key, value.to_vec(), ttl);
                Ok(())
            }
            SharedStore::Redis(pool) => {
                let mut conn = pool.get().await?;
                conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
                    .await?;
                Ok(())
            }
        }
    }

    /// Deletes the given keys, returning how many existed.
    pub async fn delete(&self, keys: &[String]) -> Result<usize, CacheError> {
        if keys.is_empty() {
            return Ok(0);
        }
        match self {
            SharedStore::Memory(store) => Ok(keys.iter().filter(|k| store.remove(k)).count()),
            SharedStore::Redis(pool) => {
                let mut conn = pool.get().await?;
                Ok(conn.del::<_, usize>(keys).await?)
            }
        }
    }

    /// Deletes every key matching a glob `pattern`.
    pub async fn delete_matching(&self, pattern: &str) -> Result<usize, CacheError> {
        let keys = self.scan_keys(pattern).await?;
        self.delete(&keys).await
    }

    /// Keys matching a glob `pattern` (`*` and `?` wildcards).
    pub async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        match self {
            SharedStore::Memory(store) => Ok(store.keys_matching(pattern)),
            SharedStore::Redis(pool) => {
                let mut conn = pool.get().await?;
                let mut cursor: u64 = 0;
                let mut keys = Vec::new();
                loop {
                    let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(SCAN_COUNT)
                        .query_async(&mut conn)
                        .await?;
                    keys.extend(batch);
                    if next == 0 {
                        break;
                    }
                    cursor = next;
                }
                keys.sort();
                keys.dedup();
                Ok(keys)
            }
        }
    }

    /// Applies additive float increments, refreshing each key's expiry.
    ///
    /// Redis receives one pipeline of `INCRBYFLOAT` + `EXPIRE` pairs.
    pub async fn increment_many(&self, deltas: &[CounterDelta]) -> Result<(), CacheError> {
        if deltas.is_empty() {
            return Ok(());
        }
        match self {
            SharedStore::Memory(store) => {
                for d in deltas {
                    store.increment(&d.key, d.delta, d.ttl);
                }
                Ok(())
            }
            SharedStore::Redis(pool) => {
                let mut conn = pool.get().await?;
                let mut pipe = redis::pipe();
                for d in deltas {
                    pipe.cmd("INCRBYFLOAT")
                        .arg(&d.key)
                        .arg(d.delta)
                        .ignore()
                        .cmd("EXPIRE")
                        .arg(&d.key)
                        .arg(d.ttl.as_secs().max(1))
                        .ignore();
                }
                let _: () = pipe.query_async(&mut conn).await?;
                Ok(())
            }
        }
    }

    /// Current value of a counter; missing keys read as `None`.
    pub async fn get_number(&self, key: &str) -> Result<Option<f64>, CacheError> {
        match self {
            SharedStore::Memory(store) => Ok(store.get_number(key)),
            SharedStore::Redis(pool) => {
                let mut conn = pool.get().await?;
                let raw: Option<String> = conn.get(key).await?;
                raw.map(|v| parse_number(key, &v)).transpose()
            }
        }
    }

    /// Snapshot of every counter matching `pattern`.
    pub async fn scan_numbers(&self, pattern: &str) -> Result<Vec<(String, f64)>, CacheError> {
        match self {
            SharedStore::Memory(store) => Ok(store.numbers_matching(pattern)),
            SharedStore::Redis(pool) => {
                let keys = self.scan_keys(pattern).await?;
                if keys.is_empty() {
                    return Ok(Vec::new());
                }
                let mut conn = pool.get().await?;
                let values: Vec<Option<String>> =
                    redis::cmd("MGET").arg(&keys).query_async(&mut conn).await?;

                let mut out = Vec::with_capacity(keys.len());
                for (key, value) in keys.into_iter().zip(values) {
                    if let Some(raw) = value {
                        let number = parse_number(&key, &raw)?;
                        out.push((key, number));
                    }
                }
                Ok(out)
            }
        }
    }

    /// Round-trip check for health reporting.
    pub async fn ping(&self) -> bool {
        match self {
            SharedStore::Memory(_) => true,
            SharedStore::Redis(pool) => match pool.get().await {
                Ok(mut conn) => {
                    let pong: redis::RedisResult<String> =
                        redis::cmd("PING").query_async(&mut conn).await;
                    pong.is_ok()
                }
                Err(_) => false,
            },
        }
    }
}

fn parse_number(key: &str, raw: &str) -> Result<f64, CacheError> {
    raw.trim()
        .parse::<f64>()
        .map_err(|_| CacheError::Codec(format!("counter {key} holds non-numeric value {raw:?}")))
}

#[derive(Debug, Clone)]
enum MemoryValue {
    Bytes(Arc<Vec<u8>>),
    Number(f64),
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: MemoryValue,
    expires_at: Instant,
}

impl MemoryEntry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// In-process stand-in for the shared tier with per-entry expiry.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, MemoryEntry>,
}

impl MemoryStore {
    fn live(&self, key: &str) -> Option<MemoryValue> {
        let entry = self.entries.get(key)?;
        if entry.is_expired() {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        Some(entry.value.clone())
    }

    fn get_bytes(&self, key: &str) -> Option<Vec<u8>> {
        match self.live(key)? {
            MemoryValue::Bytes(b) => Some(b.as_ref().clone()),
            MemoryValue::Number(n) => Some(n.to_string().into_bytes()),
        }
    }

    fn get_number(&self, key: &str) -> Option<f64> {
        match self.live(key)? {
            MemoryValue::Number(n) => Some(n),
            MemoryValue::Bytes(_) => None,
        }
    }

    fn set_bytes(&self, key: &str, value: Vec<u8>, ttl: Duration) {
        self.entries.insert(
            key.to_string(),
            MemoryEntry {
                value: MemoryValue::Bytes(Arc::new(value)),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    fn increment(&self, key: &str, delta: f64, ttl: Duration) {
        let expires_at = Instant::now() + ttl;
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| MemoryEntry {
                value: MemoryValue::Number(0.0),
                expires_at,
            });
        let current = match (&entry.value, entry.is_expired()) {
            (MemoryValue::Number(n), false) => *n,
            _ => 0.0,
        };
        entry.value = MemoryValue::Number(current + delta);
        entry.expires_at = expires_at;
    }

    fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Drops every expired entry, returning how many were removed.
    ///
    /// Runs ahead of each scan, so the periodic usage flush keeps the map
    /// bounded even for keys that are never read again.
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired());
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn keys_matching(&self, pattern: &str) -> Vec<String> {
        self.purge_expired();
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| glob_match(pattern, e.key()))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        keys
    }

    fn numbers_matching(&self, pattern: &str) -> Vec<(String, f64)> {
        self.purge_expired();
        let mut out: Vec<(String, f64)> = self
            .entries
            .iter()
            .filter(|e| glob_match(pattern, e.key()))
            .filter_map(|e| match e.value {
                MemoryValue::Number(n) => Some((e.key().clone(), n)),
                MemoryValue::Bytes(_) => None,
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

/// Redis-style glob match supporting `*` (any run) and `?` (one char).
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}
