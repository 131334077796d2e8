//! The admission and metering pipeline.

use std::sync::Arc;
use std::time::Duration;

use gatekeeper_core::keys::{
    endpoint_key, organization_key, permission_key, pricing_key, quota_key, subscription_key,
};
use gatekeeper_core::{
    ApiEndpoint, CachePrefix, Organization, PermissionGrant, Pricing, QuotaUsage, Subscription,
    UsageKey, UsageMetric, next_interval_boundary, now_unix,
};
use gatekeeper_storage::DynGatekeeperStorage;

use super::error::{
    ENDPOINT_NOT_FOUND, GatekeeperError, NO_ACTIVE_SUBSCRIPTION, NO_MATCHING_ENDPOINT,
    ORGANIZATION_NOT_FOUND, PERMISSION_DENIED, QUOTA_EXCEEDED, SUBSCRIPTION_EXPIRED,
};
use super::model::{UsageRecord, ValidationDecision};
use crate::cache::{Codec, CounterAggregator, TwoTierCache, TypedCache};
use crate::matcher::Matcher;
use crate::metrics;

/// Entities resolved by steps 1-6 of the pipeline.
struct Resolved {
    organization: Organization,
    endpoint: ApiEndpoint,
    subscription: Subscription,
}

/// Typed views over the two-tier cache, one per key namespace.
#[derive(Clone)]
struct LookupCaches {
    organizations: TypedCache<Organization>,
    endpoints: TypedCache<ApiEndpoint>,
    permissions: TypedCache<PermissionGrant>,
    subscriptions: TypedCache<Subscription>,
    pricing: TypedCache<Pricing>,
    quota: TypedCache<QuotaUsage>,
}

impl LookupCaches {
    fn new(cache: &Arc<TwoTierCache>) -> Self {
        Self {
            organizations: TypedCache::new(
                Arc::clone(cache),
                CachePrefix::Organization.as_str(),
                Codec::json(),
            ),
            endpoints: TypedCache::new(
                Arc::clone(cache),
                CachePrefix::Endpoint.as_str(),
                Codec::msgpack(),
            ),
            permissions: TypedCache::new(
                Arc::clone(cache),
                CachePrefix::Permission.as_str(),
                Codec::json(),
            ),
            subscriptions: TypedCache::new(
                Arc::clone(cache),
                CachePrefix::Subscription.as_str(),
                Codec::json(),
            ),
            pricing: TypedCache::new(Arc::clone(cache), CachePrefix::Pricing.as_str(), Codec::json()),
            quota: TypedCache::new(Arc::clone(cache), CachePrefix::Quota.as_str(), Codec::msgpack()),
        }
    }
}

/// Decides whether a call may proceed and meters the calls that did.
pub struct GatekeepingService {
    matcher: Arc<Matcher>,
    storage: DynGatekeeperStorage,
    cache: Arc<TwoTierCache>,
    caches: LookupCaches,
    aggregator: Arc<CounterAggregator>,
    flush_interval: Duration,
}

impl GatekeepingService {
    pub fn new(
        matcher: Arc<Matcher>,
        storage: DynGatekeeperStorage,
        cache: Arc<TwoTierCache>,
        aggregator: Arc<CounterAggregator>,
        flush_interval: Duration,
    ) -> Self {
        let caches = LookupCaches::new(&cache);
        Self {
            matcher,
            storage,
            cache,
            caches,
            aggregator,
            flush_interval,
        }
    }

    pub fn matcher(&self) -> &Arc<Matcher> {
        &self.matcher
    }

    pub fn storage(&self) -> &DynGatekeeperStorage {
        &self.storage
    }

    pub fn cache(&self) -> &Arc<TwoTierCache> {
        &self.cache
    }

    pub fn aggregator(&self) -> &Arc<CounterAggregator> {
        &self.aggregator
    }

    pub fn flush_interval(&self) -> Duration {
        self.flush_interval
    }

    /// Bucket a call made now is accounted to.
    pub fn current_bucket(&self) -> i64 {
        next_interval_boundary(now_unix(), self.flush_interval)
    }

    /// Runs the full admission pipeline for one call.
    pub async fn validate_request(
        &self,
        method: &str,
        path: &str,
        org_name: &str,
    ) -> Result<ValidationDecision, GatekeeperError> {
        let result = self.validate_inner(method, path, org_name).await;
        match &result {
            Ok(decision) => {
                metrics::record_decision("allowed");
                tracing::debug!(
                    organization = %decision.organization.name,
                    endpoint = %decision.endpoint.code,
                    remaining = ?decision.remaining,
                    "request allowed"
                );
            }
            Err(e) => {
                metrics::record_decision(e.outcome());
                tracing::debug!(method, path, organization = org_name, reason = %e, "request rejected");
            }
        }
        result
    }

    async fn validate_inner(
        &self,
        method: &str,
        path: &str,
        org_name: &str,
    ) -> Result<ValidationDecision, GatekeeperError> {
        let Resolved {
            organization,
            endpoint,
            subscription,
        } = self.resolve(method, path, org_name).await?;

        let remaining = if subscription.is_unlimited() {
            None
        } else {
            let usage = self
                .quota_usage(organization.id, subscription.id, self.current_bucket())
                .await?;
            if usage >= subscription.api_limit as f64 {
                tracing::info!(
                    organization = %organization.name,
                    subscription = subscription.id,
                    usage,
                    limit = subscription.api_limit,
                    "quota exceeded"
                );
                return Err(GatekeeperError::unauthorized(QUOTA_EXCEEDED));
            }
            subscription.remaining(usage)
        };

        Ok(ValidationDecision {
            unlimited: remaining.is_none(),
            organization,
            endpoint,
            subscription,
            remaining,
        })
    }

    /// Prices one call and feeds the counters.
    ///
    /// Only paid endpoints are metered; anything else is recorded at price 0
    /// without touching the aggregator.
    pub async fn record_usage(
        &self,
        method: &str,
        path: &str,
        org_name: &str,
        call_units: f64,
    ) -> Result<UsageRecord, GatekeeperError> {
        let Resolved {
            organization,
            endpoint,
            subscription,
        } = self.resolve(method, path, org_name).await?;

        let bucket = self.current_bucket();
        let mut record = UsageRecord {
            price: 0.0,
            organization_id: organization.id,
            subscription_id: subscription.id,
            endpoint_id: endpoint.id,
            bucket,
            metered: false,
        };

        if !endpoint.access_type.is_metered() {
            metrics::record_usage(false);
            return Ok(record);
        }

        let pricing = self.pricing(subscription.id, endpoint.id).await?;
        let price = pricing.price_for(call_units);

        let key = UsageKey::new(organization.id, subscription.id, endpoint.id, bucket);
        self.aggregator
            .increment(CachePrefix::Usage, key.metric_key(UsageMetric::Count), 1.0);
        self.aggregator
            .increment(CachePrefix::Usage, key.metric_key(UsageMetric::Cost), price);
        self.aggregator.increment(
            CachePrefix::UsageTotal,
            key.total_key(UsageMetric::TotalCount),
            1.0,
        );
        self.aggregator.increment(
            CachePrefix::UsageTotal,
            key.total_key(UsageMetric::TotalCost),
            price,
        );

        metrics::record_usage(true);
        tracing::debug!(
            organization = %organization.name,
            endpoint = %endpoint.code,
            price,
            bucket,
            "usage recorded"
        );

        record.price = price;
        record.metered = true;
        Ok(record)
    }

    /// Steps 1-6: route, organization, endpoint, permission, subscription, expiry.
    async fn resolve(
        &self,
        method: &str,
        path: &str,
        org_name: &str,
    ) -> Result<Resolved, GatekeeperError> {
        let code = self
            .matcher
            .match_route(method, path)
            .ok_or_else(|| GatekeeperError::not_found(NO_MATCHING_ENDPOINT))?;

        let organization = self.organization(org_name).await?;
        let endpoint = self.endpoint(&code).await?;

        let grant = self
            .permission(
                organization.id,
                endpoint.resource_type_id,
                &endpoint.permission_code,
            )
            .await?;
        if !grant.granted {
            return Err(GatekeeperError::unauthorized(PERMISSION_DENIED));
        }

        let subscription = self
            .subscription(organization.id, endpoint.id)
            .await?
            .filter(|s| s.active)
            .ok_or_else(|| GatekeeperError::unauthorized(NO_ACTIVE_SUBSCRIPTION))?;

        if subscription.is_expired_at(now_unix()) {
            return Err(GatekeeperError::unauthorized(SUBSCRIPTION_EXPIRED));
        }

        Ok(Resolved {
            organization,
            endpoint,
            subscription,
        })
    }

    async fn organization(&self, name: &str) -> Result<Organization, GatekeeperError> {
        let storage = &self.storage;
        self.caches
            .organizations
            .get_or_populate(&organization_key(name), || async move {
                storage
                    .get_organization_by_name(name)
                    .await
                    .map_err(|e| GatekeeperError::storage("organization", e))?
                    .ok_or_else(|| GatekeeperError::not_found(ORGANIZATION_NOT_FOUND))
            })
            .await
    }

    async fn endpoint(&self, code: &str) -> Result<ApiEndpoint, GatekeeperError> {
        let storage = &self.storage;
        self.caches
            .endpoints
            .get_or_populate(&endpoint_key(code), || async move {
                storage
                    .get_api_endpoint_by_name(code)
                    .await
                    .map_err(|e| GatekeeperError::storage("endpoint", e))?
                    .ok_or_else(|| GatekeeperError::not_found(ENDPOINT_NOT_FOUND))
            })
            .await
    }

    async fn permission(
        &self,
        organization_id: i32,
        resource_type_id: i32,
        permission_code: &str,
    ) -> Result<PermissionGrant, GatekeeperError> {
        let storage = &self.storage;
        self.caches
            .permissions
            .get_or_populate(
                &permission_key(organization_id, resource_type_id, permission_code),
                || async move {
                    let granted = storage
                        .check_org_permission(organization_id, resource_type_id, permission_code)
                        .await
                        .map_err(|e| GatekeeperError::internal("permission", e))?;
                    Ok::<_, GatekeeperError>(PermissionGrant { granted })
                },
            )
            .await
    }

    /// Subscriptions are cached only when one exists, so a later grant is
    /// picked up without waiting for an invalidation.
    async fn subscription(
        &self,
        organization_id: i32,
        endpoint_id: i32,
    ) -> Result<Option<Subscription>, GatekeeperError> {
        let storage = &self.storage;
        let result = self
            .caches
            .subscriptions
            .get_or_populate(&subscription_key(organization_id, endpoint_id), || async move {
                storage
                    .get_active_subscription(organization_id, endpoint_id)
                    .await
                    .map_err(|e| GatekeeperError::internal("subscription", e))?
                    .ok_or_else(|| GatekeeperError::unauthorized(NO_ACTIVE_SUBSCRIPTION))
            })
            .await;

        match result {
            Ok(subscription) => Ok(Some(subscription)),
            Err(GatekeeperError::Unauthorized(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn pricing(
        &self,
        subscription_id: i32,
        endpoint_id: i32,
    ) -> Result<Pricing, GatekeeperError> {
        let storage = &self.storage;
        self.caches
            .pricing
            .get_or_populate(&pricing_key(subscription_id, endpoint_id), || async move {
                storage
                    .get_pricing(subscription_id, endpoint_id)
                    .await
                    .map_err(|e| GatekeeperError::internal("pricing", e))?
                    .ok_or_else(|| {
                        GatekeeperError::internal(
                            "pricing",
                            format!(
                                "no pricing for subscription {subscription_id} endpoint {endpoint_id}"
                            ),
                        )
                    })
            })
            .await
    }

    /// Durable cost-to-date plus the live total of the current bucket.
    ///
    /// The durable part is cached per bucket, so it is re-read at most once per
    /// flush interval. A shared-tier read failure counts the live part as zero.
    pub async fn quota_usage(
        &self,
        organization_id: i32,
        subscription_id: i32,
        bucket: i64,
    ) -> Result<f64, GatekeeperError> {
        let storage = &self.storage;
        let durable = self
            .caches
            .quota
            .get_or_populate(
                &quota_key(organization_id, subscription_id, bucket),
                || async move {
                    storage
                        .get_quota_usage_by_subscription_id(subscription_id)
                        .await
                        .map_err(|e| GatekeeperError::internal("quota", e))
                },
            )
            .await?;

        let live_key = CachePrefix::UsageTotal.key([UsageKey::new(
            organization_id,
            subscription_id,
            0,
            bucket,
        )
        .total_key(UsageMetric::TotalCost)]);
        let live = match self.cache.shared().get_number(&live_key).await {
            Ok(value) => value.unwrap_or(0.0),
            Err(e) => {
                tracing::warn!(key = %live_key, error = %e, "live usage read failed");
                0.0
            }
        };

        Ok(durable.total_cost + live)
    }
}
