//! Cache and counter key layout.
//!
//! Every key is a `:`-joined list of segments whose first segment is a
//! [`CachePrefix`]. Usage counters follow
//! `usage:{org}:{sub}:{endpoint}:{bucket}:{metric}`; running totals used for
//! quota reads follow `usagetotal:{org}:{sub}:{bucket}:{metric}`.

use std::fmt;
use std::time::Duration;

use crate::error::CoreError;

pub const SEPARATOR: char = ':';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CachePrefix {
    Organization,
    Endpoint,
    Permission,
    Subscription,
    Pricing,
    Quota,
    Usage,
    UsageTotal,
}

impl CachePrefix {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Organization => "organization",
            Self::Endpoint => "endpoint",
            Self::Permission => "permission",
            Self::Subscription => "subscription",
            Self::Pricing => "pricing",
            Self::Quota => "quota",
            Self::Usage => "usage",
            Self::UsageTotal => "usagetotal",
        }
    }

    /// Shared-tier lifetime of counter keys under this prefix.
    pub fn counter_ttl(&self) -> Duration {
        match self {
            Self::Usage => Duration::from_secs(5 * 60),
            Self::UsageTotal => Duration::from_secs(60 * 60),
            _ => Duration::from_secs(3600),
        }
    }

    /// Key with this prefix followed by the given segments.
    pub fn key<I, S>(&self, segments: I) -> String
    where
        I: IntoIterator<Item = S>,
        S: fmt::Display,
    {
        let mut key = self.as_str().to_string();
        for segment in segments {
            key.push(SEPARATOR);
            key.push_str(&segment.to_string());
        }
        key
    }

    /// Glob pattern covering every key under this prefix.
    pub fn pattern(&self) -> String {
        format!("{}{SEPARATOR}*", self.as_str())
    }
}

impl fmt::Display for CachePrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn organization_key(name: &str) -> String {
    CachePrefix::Organization.key([name])
}

pub fn endpoint_key(code: &str) -> String {
    CachePrefix::Endpoint.key([code])
}

pub fn permission_key(org_id: i32, resource_type_id: i32, permission_code: &str) -> String {
    CachePrefix::Permission.key([
        org_id.to_string(),
        resource_type_id.to_string(),
        permission_code.to_string(),
    ])
}

pub fn subscription_key(org_id: i32, endpoint_id: i32) -> String {
    CachePrefix::Subscription.key([org_id, endpoint_id])
}

pub fn pricing_key(subscription_id: i32, endpoint_id: i32) -> String {
    CachePrefix::Pricing.key([subscription_id, endpoint_id])
}

pub fn quota_key(org_id: i32, subscription_id: i32, bucket: i64) -> String {
    CachePrefix::Quota.key([
        org_id.to_string(),
        subscription_id.to_string(),
        bucket.to_string(),
        UsageMetric::TotalCost.as_str().to_string(),
    ])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UsageMetric {
    Count,
    Cost,
    TotalCount,
    TotalCost,
}

impl UsageMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::Cost => "cost",
            Self::TotalCount => "totalCount",
            Self::TotalCost => "totalCost",
        }
    }
}

impl fmt::Display for UsageMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Logical identity of a usage counter group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UsageKey {
    pub organization_id: i32,
    pub subscription_id: i32,
    pub endpoint_id: i32,
    pub bucket: i64,
}

impl UsageKey {
    pub fn new(organization_id: i32, subscription_id: i32, endpoint_id: i32, bucket: i64) -> Self {
        Self {
            organization_id,
            subscription_id,
            endpoint_id,
            bucket,
        }
    }

    /// `{org}:{sub}:{endpoint}:{bucket}`, without prefix or metric.
    pub fn id(&self) -> String {
        format!(
            "{}{SEPARATOR}{}{SEPARATOR}{}{SEPARATOR}{}",
            self.organization_id, self.subscription_id, self.endpoint_id, self.bucket
        )
    }

    /// Counter key relative to the usage prefix.
    pub fn metric_key(&self, metric: UsageMetric) -> String {
        format!("{}{SEPARATOR}{metric}", self.id())
    }

    /// Running-total key relative to the totals prefix: `{org}:{sub}:{bucket}:{metric}`.
    pub fn total_key(&self, metric: UsageMetric) -> String {
        format!(
            "{}{SEPARATOR}{}{SEPARATOR}{}{SEPARATOR}{metric}",
            self.organization_id, self.subscription_id, self.bucket
        )
    }

    /// Parse a logical id produced by [`UsageKey::id`].
    pub fn parse(id: &str) -> Result<Self, CoreError> {
        let parts: Vec<&str> = id.split(SEPARATOR).collect();
        if parts.len() != 4 {
            return Err(CoreError::invalid_usage_key(
                id,
                format!("expected 4 segments, found {}", parts.len()),
            ));
        }

        let int = |value: &str, field: &str| {
            value
                .parse::<i32>()
                .map_err(|_| CoreError::invalid_usage_key(id, format!("invalid {field}")))
        };

        let bucket = parts[3]
            .parse::<i64>()
            .map_err(|_| CoreError::invalid_usage_key(id, "invalid bucket"))?;

        Ok(Self {
            organization_id: int(parts[0], "organization id")?,
            subscription_id: int(parts[1], "subscription id")?,
            endpoint_id: int(parts[2], "endpoint id")?,
            bucket,
        })
    }
}

impl fmt::Display for UsageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id())
    }
}

/// Split `{prefix}:{id...}:{metric}` into `(id, metric)`.
///
/// Returns `None` when the key is not under `prefix` or has no metric segment.
pub fn split_counter_key<'a>(prefix: &str, key: &'a str) -> Option<(&'a str, &'a str)> {
    let rest = key.strip_prefix(prefix)?.strip_prefix(SEPARATOR)?;
    let (id, metric) = rest.rsplit_once(SEPARATOR)?;
    if id.is_empty() || metric.is_empty() {
        return None;
    }
    Some((id, metric))
}
