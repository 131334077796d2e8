//! Process-local batching of usage counter increments.
//!
//! Increments accumulate in memory per prefix and are pushed to the shared tier
//! either on a timer or as soon as one prefix collects `batch_size` distinct
//! keys. All pending maps sit behind one coarse mutex; if contention shows up,
//! sharding by prefix is the obvious next step.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use gatekeeper_core::CachePrefix;
use parking_lot::Mutex;
use tokio::sync::{Notify, watch};

use super::shared::{CounterDelta, SharedStore};
use crate::metrics;
use crate::task::BackgroundTask;

pub struct CounterAggregator {
    pending: Mutex<HashMap<CachePrefix, HashMap<String, f64>>>,
    shared: SharedStore,
    batch_size: usize,
    batch_full: Notify,
}

impl CounterAggregator {
    pub fn new(shared: SharedStore, batch_size: usize) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            shared,
            batch_size: batch_size.max(1),
            batch_full: Notify::new(),
        }
    }

    /// Adds `delta` to `key` (relative to `prefix`). Never touches the network.
    pub fn increment(&self, prefix: CachePrefix, key: impl Into<String>, delta: f64) {
        let (len, total) = {
            let mut pending = self.pending.lock();
            let entries = pending.entry(prefix).or_default();
            *entries.entry(key.into()).or_insert(0.0) += delta;
            let len = entries.len();
            (len, pending.values().map(HashMap::len).sum::<usize>())
        };
        metrics::set_counter_pending_keys(total);
        if len >= self.batch_size {
            self.batch_full.notify_one();
        }
    }

    /// Pending value for a key; `0.0` when nothing is buffered.
    pub fn pending_value(&self, prefix: CachePrefix, key: &str) -> f64 {
        self.pending
            .lock()
            .get(&prefix)
            .and_then(|entries| entries.get(key).copied())
            .unwrap_or(0.0)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().values().map(HashMap::len).sum()
    }

    /// Pushes every pending increment for `prefix` in one batch.
    ///
    /// The buffer is swapped out before the push. If the push fails those
    /// increments are dropped and the failure is logged and counted.
    pub async fn flush_now(&self, prefix: CachePrefix) -> usize {
        let drained = match self.pending.lock().remove(&prefix) {
            Some(entries) if !entries.is_empty() => entries,
            _ => return 0,
        };

        let ttl = prefix.counter_ttl();
        let deltas: Vec<CounterDelta> = drained
            .into_iter()
            .map(|(key, delta)| CounterDelta {
                key: prefix.key([key]),
                delta,
                ttl,
            })
            .collect();
        let count = deltas.len();

        match self.shared.increment_many(&deltas).await {
            Ok(()) => {
                tracing::debug!(prefix = %prefix, keys = count, "counters pushed");
                metrics::record_counter_push(count, true);
            }
            Err(e) => {
                tracing::warn!(prefix = %prefix, keys = count, error = %e, "counter push failed, increments lost");
                metrics::record_counter_push(count, false);
            }
        }
        metrics::set_counter_pending_keys(self.pending_len());
        count
    }

    pub async fn flush_all(&self) -> usize {
        let prefixes: Vec<CachePrefix> = self.pending.lock().keys().copied().collect();
        let mut pushed = 0;
        for prefix in prefixes {
            pushed += self.flush_now(prefix).await;
        }
        pushed
    }

    /// Spawns the flush loop: every `interval`, or earlier when a batch fills.
    pub fn start(self: Arc<Self>, interval: Duration) -> BackgroundTask {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let aggregator = self;

        let handle = tokio::spawn(async move {
            tracing::info!(interval_ms = interval.as_millis() as u64, "counter aggregator started");
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        aggregator.flush_all().await;
                    }
                    _ = aggregator.batch_full.notified() => {
                        aggregator.flush_all().await;
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            tracing::info!("counter aggregator shutting down");
                            break;
                        }
                    }
                }
            }
        });

        BackgroundTask::new("counter-aggregator", shutdown_tx, handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_increments_accumulate_until_flush() {
        let shared = SharedStore::memory();
        let agg = CounterAggregator::new(shared.clone(), 100);

        agg.increment(CachePrefix::Usage, "1:7:3:60:count", 1.0);
        agg.increment(CachePrefix::Usage, "1:7:3:60:count", 1.0);
        agg.increment(CachePrefix::Usage, "1:7:3:60:cost", 0.25);
        assert_eq!(agg.pending_value(CachePrefix::Usage, "1:7:3:60:count"), 2.0);
        assert_eq!(shared.get_number("usage:1:7:3:60:count").await.unwrap(), None);

        assert_eq!(agg.flush_now(CachePrefix::Usage).await, 2);
        assert_eq!(agg.pending_len(), 0);
        assert_eq!(shared.get_number("usage:1:7:3:60:count").await.unwrap(), Some(2.0));
        assert_eq!(shared.get_number("usage:1:7:3:60:cost").await.unwrap(), Some(0.25));
    }

    #[tokio::test]
    async fn test_flush_adds_to_existing_shared_value() {
        let shared = SharedStore::memory();
        let agg = CounterAggregator::new(shared.clone(), 100);

        agg.increment(CachePrefix::UsageTotal, "1:7:60:totalCost", 1.5);
        agg.flush_all().await;
        agg.increment(CachePrefix::UsageTotal, "1:7:60:totalCost", 2.0);
        agg.flush_all().await;

        assert_eq!(
            shared.get_number("usagetotal:1:7:60:totalCost").await.unwrap(),
            Some(3.5)
        );
    }

    #[tokio::test]
    async fn test_flush_of_empty_prefix_is_noop() {
        let agg = CounterAggregator::new(SharedStore::memory(), 10);
        assert_eq!(agg.flush_now(CachePrefix::Usage).await, 0);
        assert_eq!(agg.flush_all().await, 0);
    }

    #[tokio::test]
    async fn test_full_batch_triggers_early_flush() {
        let shared = SharedStore::memory();
        let agg = Arc::new(CounterAggregator::new(shared.clone(), 2));
        let task = Arc::clone(&agg).start(Duration::from_secs(3600));
        // Let the first immediate tick pass.
        tokio::time::sleep(Duration::from_millis(20)).await;

        agg.increment(CachePrefix::Usage, "a:count", 1.0);
        agg.increment(CachePrefix::Usage, "b:count", 1.0);

        let mut flushed = false;
        for _ in 0..50 {
            if shared.get_number("usage:b:count").await.unwrap() == Some(1.0) {
                flushed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        task.stop().await;
        assert!(flushed);
    }

    #[tokio::test]
    async fn test_stop_ends_loop() {
        let agg = Arc::new(CounterAggregator::new(SharedStore::memory(), 10));
        let task = Arc::clone(&agg).start(Duration::from_millis(10));
        assert_eq!(task.name(), "counter-aggregator");
        tokio::time::timeout(Duration::from_secs(1), task.stop())
            .await
            .unwrap();
    }
}
