use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use gatekeeper_core::{
    ApiEndpoint, Organization, Pricing, QuotaUsage, Subscription, UsageSummary,
};
use gatekeeper_storage::{GatekeeperStorage, StorageError};

type UsageRowKey = (i32, i32, i32, i64);

/// In-memory gatekeeper storage backed by concurrent maps.
///
/// Subscriptions are indexed by the `(organization, endpoint)` pairs they
/// cover. Every trait read bumps [`InMemoryStorage::read_count`], which lets
/// callers observe whether a lookup reached storage or was served from cache.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    organizations: DashMap<String, Organization>,
    endpoints: DashMap<String, ApiEndpoint>,
    subscriptions: DashMap<(i32, i32), Subscription>,
    permissions: DashMap<(i32, i32, String), bool>,
    pricing: DashMap<(i32, i32), Pricing>,
    usage: DashMap<UsageRowKey, UsageSummary>,
    reads: AtomicU64,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_organization(&self, organization: Organization) {
        self.organizations
            .insert(organization.name.clone(), organization);
    }

    pub fn insert_endpoint(&self, endpoint: ApiEndpoint) {
        self.endpoints.insert(endpoint.code.clone(), endpoint);
    }

    pub fn remove_endpoint(&self, code: &str) -> Option<ApiEndpoint> {
        self.endpoints.remove(code).map(|(_, endpoint)| endpoint)
    }

    /// Registers `subscription` as covering each of `endpoint_ids`.
    pub fn insert_subscription(&self, subscription: Subscription, endpoint_ids: &[i32]) {
        for endpoint_id in endpoint_ids {
            self.subscriptions.insert(
                (subscription.organization_id, *endpoint_id),
                subscription.clone(),
            );
        }
    }

    /// Replaces every stored copy of the subscription with the same id.
    ///
    /// Returns the number of `(organization, endpoint)` entries updated.
    pub fn update_subscription(&self, subscription: Subscription) -> usize {
        let mut updated = 0;
        for mut entry in self.subscriptions.iter_mut() {
            if entry.id == subscription.id {
                *entry = subscription.clone();
                updated += 1;
            }
        }
        updated
    }

    pub fn set_permission(
        &self,
        organization_id: i32,
        resource_type_id: i32,
        permission_code: &str,
        granted: bool,
    ) {
        self.permissions.insert(
            (organization_id, resource_type_id, permission_code.to_string()),
            granted,
        );
    }

    pub fn set_pricing(&self, subscription_id: i32, endpoint_id: i32, pricing: Pricing) {
        self.pricing.insert((subscription_id, endpoint_id), pricing);
    }

    /// Snapshot of the stored usage summaries, ordered by key.
    pub fn usage_summaries(&self) -> Vec<UsageSummary> {
        let mut rows: Vec<(UsageRowKey, UsageSummary)> = self
            .usage
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        rows.sort_by_key(|(key, _)| *key);
        rows.into_iter().map(|(_, row)| row).collect()
    }

    /// Number of trait read calls served so far.
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    fn record_read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }
}

#[async_trait]
impl GatekeeperStorage for InMemoryStorage {
    async fn get_organization_by_name(
        &self,
        name: &str,
    ) -> Result<Option<Organization>, StorageError> {
        self.record_read();
        Ok(self.organizations.get(name).map(|org| org.clone()))
    }

    async fn get_api_endpoint_by_name(
        &self,
        code: &str,
    ) -> Result<Option<ApiEndpoint>, StorageError> {
        self.record_read();
        Ok(self.endpoints.get(code).map(|endpoint| endpoint.clone()))
    }

    async fn get_active_subscription(
        &self,
        organization_id: i32,
        endpoint_id: i32,
    ) -> Result<Option<Subscription>, StorageError> {
        self.record_read();
        Ok(self
            .subscriptions
            .get(&(organization_id, endpoint_id))
            .map(|sub| sub.clone()))
    }

    async fn check_org_permission(
        &self,
        organization_id: i32,
        resource_type_id: i32,
        permission_code: &str,
    ) -> Result<bool, StorageError> {
        self.record_read();
        Ok(self
            .permissions
            .get(&(organization_id, resource_type_id, permission_code.to_string()))
            .is_some_and(|granted| *granted))
    }

    async fn get_pricing(
        &self,
        subscription_id: i32,
        endpoint_id: i32,
    ) -> Result<Option<Pricing>, StorageError> {
        self.record_read();
        Ok(self
            .pricing
            .get(&(subscription_id, endpoint_id))
            .map(|pricing| *pricing))
    }

    async fn get_quota_usage_by_subscription_id(
        &self,
        subscription_id: i32,
    ) -> Result<QuotaUsage, StorageError> {
        self.record_read();
        let usage = self
            .usage
            .iter()
            .filter(|row| row.subscription_id == subscription_id)
            .fold(QuotaUsage::default(), |mut acc, row| {
                acc.total_calls += row.total_calls;
                acc.total_cost += row.total_cost;
                acc
            });
        Ok(usage)
    }

    async fn create_api_usage_summary(&self, summary: &UsageSummary) -> Result<(), StorageError> {
        let key = (
            summary.organization_id,
            summary.subscription_id,
            summary.api_endpoint_id,
            summary.usage_end_date,
        );
        self.usage
            .entry(key)
            .and_modify(|row| {
                row.total_calls += summary.total_calls;
                row.total_cost += summary.total_cost;
            })
            .or_insert_with(|| summary.clone());
        tracing::debug!(
            organization_id = summary.organization_id,
            subscription_id = summary.subscription_id,
            endpoint_id = summary.api_endpoint_id,
            usage_end_date = summary.usage_end_date,
            "usage summary stored"
        );
        Ok(())
    }

    async fn list_api_endpoints(
        &self,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<ApiEndpoint>, StorageError> {
        self.record_read();
        let mut endpoints: Vec<ApiEndpoint> =
            self.endpoints.iter().map(|e| e.value().clone()).collect();
        endpoints.sort_by_key(|e| e.id);
        Ok(endpoints
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }
}
