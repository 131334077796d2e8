//! Prometheus metrics for the gatekeeper.
//!
//! Covers HTTP traffic, cache tiers, admission decisions, the counter
//! aggregator and the durable flush job.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;

/// Global Prometheus handle for rendering metrics.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metric names as constants for consistency.
pub mod names {
    // HTTP metrics
    pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";
    pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";

    // Cache metrics
    pub const CACHE_HITS_TOTAL: &str = "cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "cache_misses_total";
    pub const CACHE_FALLBACKS_TOTAL: &str = "cache_fallbacks_total";
    pub const CACHE_INVALIDATIONS_TOTAL: &str = "cache_invalidations_total";
    pub const CACHE_ENTRIES: &str = "cache_entries";

    // Gatekeeping metrics
    pub const DECISIONS_TOTAL: &str = "gatekeeper_decisions_total";
    pub const USAGE_RECORDED_TOTAL: &str = "gatekeeper_usage_recorded_total";

    // Counter aggregator metrics
    pub const COUNTER_PUSHES_TOTAL: &str = "gatekeeper_counter_pushes_total";
    pub const COUNTER_PUSH_FAILURES_TOTAL: &str = "gatekeeper_counter_push_failures_total";
    pub const COUNTER_PENDING_KEYS: &str = "gatekeeper_counter_pending_keys";

    // Durable flush metrics
    pub const FLUSHED_ROWS_TOTAL: &str = "gatekeeper_flushed_rows_total";
    pub const FLUSH_FAILURES_TOTAL: &str = "gatekeeper_flush_failures_total";

    // Change bus metrics
    pub const EVENTS_RECEIVED_TOTAL: &str = "gatekeeper_events_received_total";
}

/// Initialize the Prometheus metrics exporter.
///
/// Returns `true` if initialization succeeded, `false` if already initialized.
pub fn init_metrics() -> bool {
    if PROMETHEUS_HANDLE.get().is_some() {
        tracing::debug!("Prometheus metrics already initialized");
        return false;
    }

    // Pull-based: /metrics is served by our own router
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            if PROMETHEUS_HANDLE.set(handle).is_err() {
                tracing::warn!("Failed to store Prometheus handle (already set)");
                return false;
            }

            tracing::info!("Prometheus metrics initialized");
            true
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to install Prometheus recorder");
            false
        }
    }
}

/// Render all metrics in Prometheus text format.
///
/// Returns `None` if metrics were not initialized.
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|handle| handle.render())
}

// =============================================================================
// HTTP Metrics
// =============================================================================

/// Record an HTTP request. `route` is the matched endpoint code or a fixed
/// label, never a raw path, to keep label cardinality bounded.
pub fn record_http_request(method: &str, route: &str, status: u16, duration: Duration) {
    let status_class = match status {
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        500..=599 => "5xx",
        _ => "other",
    };

    counter!(
        names::HTTP_REQUESTS_TOTAL,
        "method" => method.to_string(),
        "route" => route.to_string(),
        "status_class" => status_class
    )
    .increment(1);

    histogram!(
        names::HTTP_REQUEST_DURATION_SECONDS,
        "method" => method.to_string(),
        "route" => route.to_string()
    )
    .record(duration.as_secs_f64());
}

// =============================================================================
// Cache Metrics
// =============================================================================

pub fn record_cache_hit(tier: &'static str) {
    counter!(names::CACHE_HITS_TOTAL, "tier" => tier).increment(1);
}

pub fn record_cache_miss() {
    counter!(names::CACHE_MISSES_TOTAL).increment(1);
}

pub fn record_cache_fallback(namespace: &'static str) {
    counter!(names::CACHE_FALLBACKS_TOTAL, "namespace" => namespace).increment(1);
}

pub fn record_cache_invalidation(count: usize) {
    counter!(names::CACHE_INVALIDATIONS_TOTAL).increment(count as u64);
}

pub fn set_cache_entries(tier: &'static str, count: usize) {
    gauge!(names::CACHE_ENTRIES, "tier" => tier).set(count as f64);
}

// =============================================================================
// Gatekeeping Metrics
// =============================================================================

/// Record an admission decision. `outcome` is `allowed`, `not_found`,
/// `unauthorized` or `internal`.
pub fn record_decision(outcome: &'static str) {
    counter!(names::DECISIONS_TOTAL, "outcome" => outcome).increment(1);
}

pub fn record_usage(metered: bool) {
    let kind = if metered { "metered" } else { "free" };
    counter!(names::USAGE_RECORDED_TOTAL, "kind" => kind).increment(1);
}

// =============================================================================
// Aggregator and Flush Metrics
// =============================================================================

pub fn record_counter_push(keys: usize, ok: bool) {
    if ok {
        counter!(names::COUNTER_PUSHES_TOTAL).increment(keys as u64);
    } else {
        counter!(names::COUNTER_PUSH_FAILURES_TOTAL).increment(keys as u64);
    }
}

pub fn set_counter_pending_keys(count: usize) {
    gauge!(names::COUNTER_PENDING_KEYS).set(count as f64);
}

pub fn record_flush(rows: usize, failures: usize) {
    counter!(names::FLUSHED_ROWS_TOTAL).increment(rows as u64);
    if failures > 0 {
        counter!(names::FLUSH_FAILURES_TOTAL).increment(failures as u64);
    }
}

pub fn record_event(topic: &str, ok: bool) {
    counter!(
        names::EVENTS_RECEIVED_TOTAL,
        "topic" => topic.to_string(),
        "result" => if ok { "ok" } else { "error" }
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder_is_noop() {
        record_cache_hit("L1");
        record_decision("allowed");
        record_flush(3, 1);
        record_http_request("GET", "E1", 200, Duration::from_millis(3));
    }

    #[test]
    fn test_init_metrics_is_idempotent() {
        init_metrics();
        assert!(!init_metrics());
    }
}
