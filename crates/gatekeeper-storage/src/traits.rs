//! The persistence contract the gatekeeper consumes.
//!
//! Implementations own the durable copies of organizations, endpoints,
//! subscriptions, pricing and permission rows. The gatekeeper only reads them
//! (through its cache) and writes usage summaries.

use async_trait::async_trait;
use gatekeeper_core::{
    ApiEndpoint, Organization, Pricing, QuotaUsage, Subscription, UsageSummary,
};

use crate::error::StorageError;

/// Storage backend used by the gatekeeping pipeline.
///
/// Lookups return `Ok(None)` when the record does not exist; errors are
/// reserved for infrastructure failures. Implementations must be thread-safe.
#[async_trait]
pub trait GatekeeperStorage: Send + Sync {
    async fn get_organization_by_name(
        &self,
        name: &str,
    ) -> Result<Option<Organization>, StorageError>;

    /// Looks up an endpoint by its stable code.
    async fn get_api_endpoint_by_name(
        &self,
        code: &str,
    ) -> Result<Option<ApiEndpoint>, StorageError>;

    /// Subscription of `organization_id` that covers `endpoint_id`.
    ///
    /// Returns the most recent subscription even when it is inactive or
    /// expired; the caller decides whether it is usable.
    async fn get_active_subscription(
        &self,
        organization_id: i32,
        endpoint_id: i32,
    ) -> Result<Option<Subscription>, StorageError>;

    async fn check_org_permission(
        &self,
        organization_id: i32,
        resource_type_id: i32,
        permission_code: &str,
    ) -> Result<bool, StorageError>;

    /// Resolved price of `endpoint_id` under `subscription_id`.
    ///
    /// Custom per-subscription pricing takes precedence over the tier's base
    /// pricing.
    async fn get_pricing(
        &self,
        subscription_id: i32,
        endpoint_id: i32,
    ) -> Result<Option<Pricing>, StorageError>;

    /// Accumulated durable usage of a subscription across all endpoints.
    async fn get_quota_usage_by_subscription_id(
        &self,
        subscription_id: i32,
    ) -> Result<QuotaUsage, StorageError>;

    /// Adds a usage summary.
    ///
    /// Rows are keyed by `(organization, subscription, endpoint, usage_end_date)`;
    /// writing the same key twice adds the counts and costs together.
    async fn create_api_usage_summary(&self, summary: &UsageSummary) -> Result<(), StorageError>;

    /// One page of endpoints ordered by id.
    async fn list_api_endpoints(
        &self,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<ApiEndpoint>, StorageError>;
}

/// Pages through [`GatekeeperStorage::list_api_endpoints`] until a short page.
pub async fn fetch_all_endpoints(
    storage: &dyn GatekeeperStorage,
    page_size: i64,
) -> Result<Vec<ApiEndpoint>, StorageError> {
    let page_size = page_size.max(1);
    let mut offset = 0;
    let mut all = Vec::new();

    loop {
        let page = storage.list_api_endpoints(offset, page_size).await?;
        let len = page.len() as i64;
        all.extend(page);
        if len < page_size {
            break;
        }
        offset += len;
    }

    Ok(all)
}
