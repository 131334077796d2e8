//! Periodic drain of shared-tier usage counters into durable summaries.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use gatekeeper_core::keys::split_counter_key;
use gatekeeper_core::{
    CachePrefix, UsageKey, UsageMetric, UsageSummary, now_unix, until_next_boundary,
};
use gatekeeper_storage::{DynGatekeeperStorage, StorageError};
use tokio::sync::watch;

use crate::cache::{CacheError, CounterDelta, SharedStore, TwoTierCache};
use crate::metrics;
use crate::task::BackgroundTask;

/// Below this a drained counter counts as empty.
const EPSILON: f64 = 1e-9;

/// Counter values of one logical usage id at snapshot time.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CounterSnapshot {
    pub count: f64,
    pub cost: f64,
}

impl CounterSnapshot {
    pub fn is_empty(&self) -> bool {
        self.count.abs() < EPSILON && self.cost.abs() < EPSILON
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub flushed: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Snapshot group: the counter values plus the full keys they were read from.
#[derive(Default)]
struct Group {
    snapshot: CounterSnapshot,
    keys: Vec<(String, f64)>,
}

pub struct UsageFlusher {
    cache: Arc<TwoTierCache>,
    shared: SharedStore,
    storage: DynGatekeeperStorage,
    interval: Duration,
}

impl UsageFlusher {
    pub fn new(
        cache: Arc<TwoTierCache>,
        storage: DynGatekeeperStorage,
        interval: Duration,
    ) -> Self {
        let shared = cache.shared().clone();
        Self {
            cache,
            shared,
            storage,
            interval,
        }
    }

    /// Hands every non-empty counter group under `prefix` to `handler`.
    ///
    /// Groups are keyed by the logical id (`org:sub:endpoint:bucket`). A group
    /// whose handler succeeds is reset by subtracting exactly the values that
    /// were read, so increments landing after the snapshot survive. A failed
    /// group keeps its counters and is retried on the next run.
    pub async fn sync_aggregated_to_db<F, Fut, E>(
        &self,
        prefix: CachePrefix,
        handler: F,
    ) -> Result<FlushReport, CacheError>
    where
        F: Fn(String, CounterSnapshot) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Display,
    {
        let numbers = self.shared.scan_numbers(&prefix.pattern()).await?;

        let mut groups: BTreeMap<String, Group> = BTreeMap::new();
        for (key, value) in numbers {
            let Some((id, metric)) = split_counter_key(prefix.as_str(), &key) else {
                tracing::warn!(key = %key, "skipping malformed counter key");
                continue;
            };
            let group = groups.entry(id.to_string()).or_default();
            match metric {
                "count" | "totalCount" => group.snapshot.count += value,
                "cost" | "totalCost" => group.snapshot.cost += value,
                other => {
                    tracing::warn!(key = %key, metric = other, "skipping unknown counter metric");
                    continue;
                }
            }
            group.keys.push((key, value));
        }

        let ttl = prefix.counter_ttl();
        let mut report = FlushReport::default();

        for (id, group) in groups {
            if group.snapshot.is_empty() {
                report.skipped += 1;
                continue;
            }

            if let Err(e) = handler(id.clone(), group.snapshot).await {
                tracing::warn!(prefix = %prefix, id = %id, error = %e, "usage flush failed, will retry");
                report.failed += 1;
                continue;
            }
            report.flushed += 1;

            let resets: Vec<CounterDelta> = group
                .keys
                .into_iter()
                .map(|(key, value)| CounterDelta {
                    key,
                    delta: -value,
                    ttl,
                })
                .collect();
            if let Err(e) = self.shared.increment_many(&resets).await {
                tracing::warn!(prefix = %prefix, id = %id, error = %e, "counter reset failed after durable write");
            }
        }

        metrics::record_flush(report.flushed, report.failed);
        if report.flushed > 0 || report.failed > 0 {
            tracing::info!(
                prefix = %prefix,
                flushed = report.flushed,
                failed = report.failed,
                skipped = report.skipped,
                "usage counters flushed"
            );
        }
        Ok(report)
    }

    /// Writes one usage summary row for a drained counter group, then settles
    /// the matching live totals.
    ///
    /// The row covers `(bucket - interval, bucket]`.
    pub async fn record_usage_summary(
        &self,
        id: &str,
        snapshot: CounterSnapshot,
    ) -> Result<(), StorageError> {
        let key = UsageKey::parse(id)?;
        let summary = UsageSummary {
            organization_id: key.organization_id,
            subscription_id: key.subscription_id,
            api_endpoint_id: key.endpoint_id,
            usage_start_date: key.bucket - self.interval.as_secs() as i64,
            usage_end_date: key.bucket,
            total_calls: snapshot.count.round() as i64,
            total_cost: snapshot.cost,
        };
        self.storage.create_api_usage_summary(&summary).await?;
        self.settle_live_totals(&key, snapshot).await;
        Ok(())
    }

    /// Moves spend that just became durable out of the live quota totals.
    ///
    /// Quota reads add the live totals on top of the durable sum, so drained
    /// amounts are subtracted here and the subscription's cached durable sum
    /// is dropped to be re-read with the new row included.
    async fn settle_live_totals(&self, key: &UsageKey, snapshot: CounterSnapshot) {
        let ttl = CachePrefix::UsageTotal.counter_ttl();
        let deltas = [
            CounterDelta {
                key: CachePrefix::UsageTotal.key([key.total_key(UsageMetric::TotalCount)]),
                delta: -snapshot.count,
                ttl,
            },
            CounterDelta {
                key: CachePrefix::UsageTotal.key([key.total_key(UsageMetric::TotalCost)]),
                delta: -snapshot.cost,
                ttl,
            },
        ];
        if let Err(e) = self.shared.increment_many(&deltas).await {
            tracing::warn!(id = %key, error = %e, "live total settlement failed");
        }

        let pattern = CachePrefix::Quota.key([
            key.organization_id.to_string(),
            key.subscription_id.to_string(),
            "*".to_string(),
        ]);
        self.cache.invalidate_matching(&pattern).await;
    }

    /// One full pass over the usage prefix into durable storage.
    pub async fn flush(&self) -> FlushReport {
        let result = self
            .sync_aggregated_to_db(CachePrefix::Usage, |id, snapshot| async move {
                self.record_usage_summary(&id, snapshot).await
            })
            .await;
        match result {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!(error = %e, "usage snapshot failed, will retry");
                FlushReport::default()
            }
        }
    }

    /// Spawns the periodic flush, aligned to interval boundaries.
    pub fn start(self: Arc<Self>) -> BackgroundTask {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let flusher = self;

        let handle = tokio::spawn(async move {
            let interval = flusher.interval.max(Duration::from_secs(1));
            let first = tokio::time::Instant::now() + until_next_boundary(now_unix(), interval);
            let mut ticker = tokio::time::interval_at(first, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tracing::info!(interval_secs = interval.as_secs(), "usage flush started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        flusher.flush().await;
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            tracing::info!("usage flush shutting down");
                            break;
                        }
                    }
                }
            }
        });

        BackgroundTask::new("usage-flush", shutdown_tx, handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use gatekeeper_db_memory::InMemoryStorage;

    fn flusher_over(shared: &SharedStore, storage: DynGatekeeperStorage) -> UsageFlusher {
        let cache = Arc::new(TwoTierCache::new(
            shared.clone(),
            Duration::from_secs(60),
            Duration::from_secs(600),
        ));
        UsageFlusher::new(cache, storage, Duration::from_secs(30))
    }

    async fn seed(shared: &SharedStore, key: &UsageKey, count: f64, cost: f64) {
        let ttl = CachePrefix::Usage.counter_ttl();
        shared
            .increment_many(&[
                CounterDelta {
                    key: CachePrefix::Usage.key([key.metric_key(UsageMetric::Count)]),
                    delta: count,
                    ttl,
                },
                CounterDelta {
                    key: CachePrefix::Usage.key([key.metric_key(UsageMetric::Cost)]),
                    delta: cost,
                    ttl,
                },
            ])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_flush_writes_summary_and_resets() {
        let shared = SharedStore::memory();
        let storage = Arc::new(InMemoryStorage::new());
        let flusher = flusher_over(&shared, storage.clone());

        let key = UsageKey::new(1, 7, 10, 1_700_000_010);
        seed(&shared, &key, 3.0, 7.5).await;

        let report = flusher.flush().await;
        assert_eq!(report.flushed, 1);

        let rows = storage.usage_summaries();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].total_calls, 3);
        assert_eq!(rows[0].total_cost, 7.5);
        assert_eq!(rows[0].usage_start_date, 1_699_999_980);
        assert_eq!(rows[0].usage_end_date, 1_700_000_010);

        // Drained counters read as zero and are skipped next time.
        let report = flusher.flush().await;
        assert_eq!(report.flushed, 0);
        assert_eq!(report.skipped, 1);
        assert_eq!(storage.usage_summaries().len(), 1);
    }

    #[tokio::test]
    async fn test_flush_settles_live_totals() {
        let shared = SharedStore::memory();
        let storage = Arc::new(InMemoryStorage::new());
        let flusher = flusher_over(&shared, storage.clone());

        let key = UsageKey::new(1, 7, 10, 120);
        seed(&shared, &key, 2.0, 5.0).await;
        let ttl = CachePrefix::UsageTotal.counter_ttl();
        let total_cost = CachePrefix::UsageTotal.key([key.total_key(UsageMetric::TotalCost)]);
        shared
            .increment_many(&[CounterDelta {
                key: total_cost.clone(),
                delta: 6.0,
                ttl,
            }])
            .await
            .unwrap();
        flusher
            .cache
            .set_raw("quota:1:7:120:totalCost", b"stale".to_vec())
            .await;

        assert_eq!(flusher.flush().await.flushed, 1);
        // Only the drained share leaves the live total.
        assert_eq!(shared.get_number(&total_cost).await.unwrap(), Some(1.0));
        assert!(flusher.cache.get_raw("quota:1:7:120:totalCost").await.is_none());
    }

    #[tokio::test]
    async fn test_failed_handler_keeps_counters() {
        let shared = SharedStore::memory();
        let storage = Arc::new(InMemoryStorage::new());
        let flusher = flusher_over(&shared, storage);
        let key = UsageKey::new(1, 7, 10, 60);
        seed(&shared, &key, 2.0, 5.0).await;

        let fail = AtomicBool::new(true);
        let report = flusher
            .sync_aggregated_to_db(CachePrefix::Usage, |_, _| {
                let fail = fail.load(Ordering::SeqCst);
                async move {
                    if fail {
                        Err("database unavailable")
                    } else {
                        Ok(())
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(report.failed, 1);

        let count_key = CachePrefix::Usage.key([key.metric_key(UsageMetric::Count)]);
        assert_eq!(shared.get_number(&count_key).await.unwrap(), Some(2.0));

        fail.store(false, Ordering::SeqCst);
        let seen = parking_lot::Mutex::new(None);
        let report = flusher
            .sync_aggregated_to_db(CachePrefix::Usage, |id, snapshot| {
                *seen.lock() = Some((id, snapshot));
                async { Ok::<(), String>(()) }
            })
            .await
            .unwrap();
        assert_eq!(report.flushed, 1);
        let (id, snapshot) = seen.into_inner().unwrap();
        assert_eq!(id, "1:7:10:60");
        assert_eq!(snapshot, CounterSnapshot { count: 2.0, cost: 5.0 });
        assert_eq!(shared.get_number(&count_key).await.unwrap(), Some(0.0));
    }

    #[tokio::test]
    async fn test_increments_after_snapshot_survive_reset() {
        let shared = SharedStore::memory();
        let storage = Arc::new(InMemoryStorage::new());
        let flusher = flusher_over(&shared, storage.clone());
        let key = UsageKey::new(1, 7, 10, 90);
        seed(&shared, &key, 1.0, 2.5).await;

        let late = shared.clone();
        let late_key = key;
        flusher
            .sync_aggregated_to_db(CachePrefix::Usage, |_, _| {
                let late = late.clone();
                async move {
                    seed(&late, &late_key, 1.0, 2.5).await;
                    Ok::<(), String>(())
                }
            })
            .await
            .unwrap();

        let cost_key = CachePrefix::Usage.key([key.metric_key(UsageMetric::Cost)]);
        assert_eq!(shared.get_number(&cost_key).await.unwrap(), Some(2.5));
    }

    #[tokio::test]
    async fn test_malformed_id_is_a_handler_failure() {
        let shared = SharedStore::memory();
        let storage = Arc::new(InMemoryStorage::new());
        let flusher = flusher_over(&shared, storage.clone());
        shared
            .increment_many(&[CounterDelta {
                key: "usage:garbage:count".to_string(),
                delta: 1.0,
                ttl: Duration::from_secs(60),
            }])
            .await
            .unwrap();

        let report = flusher.flush().await;
        assert_eq!(report.failed, 1);
        assert!(storage.usage_summaries().is_empty());
    }

    #[tokio::test]
    async fn test_periodic_task_stops() {
        let storage = Arc::new(InMemoryStorage::new());
        let flusher = Arc::new(flusher_over(&SharedStore::memory(), storage));
        let task = flusher.start();
        tokio::time::timeout(Duration::from_secs(1), task.stop())
            .await
            .unwrap();
    }
}
