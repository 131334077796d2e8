use gatekeeper_core::{ApiEndpoint, Organization, Subscription};
use serde::Serialize;

/// Result of a successful admission check.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationDecision {
    pub organization: Organization,
    pub endpoint: ApiEndpoint,
    pub subscription: Subscription,
    /// `None` when the subscription is unlimited.
    pub remaining: Option<f64>,
    pub unlimited: bool,
}

/// What `record_usage` charged for one call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct UsageRecord {
    pub price: f64,
    pub organization_id: i32,
    pub subscription_id: i32,
    pub endpoint_id: i32,
    pub bucket: i64,
    /// `false` for free and private endpoints, which never reach the counters.
    pub metered: bool,
}
