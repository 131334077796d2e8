//! Domain records resolved by the gatekeeper on every request.
//!
//! These are thin, serializable shapes: each cache namespace stores exactly one
//! of them, so a key always round-trips to the same type.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub id: i32,
    pub name: String,
}

/// How an endpoint is exposed. Only `Paid` endpoints are priced and metered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AccessType {
    #[default]
    Free,
    Paid,
    Private,
}

impl AccessType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Paid => "paid",
            Self::Private => "private",
        }
    }

    pub fn is_metered(&self) -> bool {
        matches!(self, Self::Paid)
    }
}

impl fmt::Display for AccessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccessType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "paid" => Ok(Self::Paid),
            "private" => Ok(Self::Private),
            other => Err(CoreError::InvalidAccessType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiEndpoint {
    pub id: i32,
    /// Stable identifier returned by the route matcher.
    pub code: String,
    pub method: String,
    pub path_template: String,
    pub resource_type_id: i32,
    pub permission_code: String,
    #[serde(default)]
    pub access_type: AccessType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: i32,
    pub organization_id: i32,
    /// Quota ceiling. Zero or negative means unlimited.
    pub api_limit: i64,
    /// Unix seconds. Zero means the subscription never expires.
    pub expiry_timestamp: i64,
    pub active: bool,
}

impl Subscription {
    pub fn is_unlimited(&self) -> bool {
        self.api_limit <= 0
    }

    pub fn is_expired_at(&self, now_unix: i64) -> bool {
        self.expiry_timestamp > 0 && now_unix > self.expiry_timestamp
    }

    /// Remaining quota for the given usage, clamped at zero.
    ///
    /// Returns `None` for unlimited subscriptions.
    pub fn remaining(&self, usage: f64) -> Option<f64> {
        if self.is_unlimited() {
            return None;
        }
        Some((self.api_limit as f64 - usage.max(0.0)).max(0.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CostMode {
    #[default]
    Fixed,
    Dynamic,
}

impl CostMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fixed => "fixed",
            Self::Dynamic => "dynamic",
        }
    }
}

impl fmt::Display for CostMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CostMode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "fixed" => Ok(Self::Fixed),
            "dynamic" => Ok(Self::Dynamic),
            other => Err(CoreError::InvalidCostMode(other.to_string())),
        }
    }
}

/// Resolved price of one call against a `(subscription, endpoint)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    pub cost_per_call: f64,
    #[serde(default)]
    pub cost_mode: CostMode,
}

impl Pricing {
    /// Final price for a call. `Dynamic` scales by the caller-supplied units,
    /// `Fixed` ignores them.
    pub fn price_for(&self, call_units: f64) -> f64 {
        match self.cost_mode {
            CostMode::Fixed => self.cost_per_call,
            CostMode::Dynamic => self.cost_per_call * call_units,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionGrant {
    pub granted: bool,
}

/// Accumulated durable usage of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct QuotaUsage {
    pub total_calls: i64,
    pub total_cost: f64,
}

/// One durable usage row per `(organization, subscription, endpoint, bucket)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub organization_id: i32,
    pub subscription_id: i32,
    pub api_endpoint_id: i32,
    pub usage_start_date: i64,
    pub usage_end_date: i64,
    pub total_calls: i64,
    pub total_cost: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscription(api_limit: i64, expiry: i64) -> Subscription {
        Subscription {
            id: 1,
            organization_id: 1,
            api_limit,
            expiry_timestamp: expiry,
            active: true,
        }
    }

    #[test]
    fn test_remaining_never_negative() {
        let sub = subscription(100, 0);
        assert_eq!(sub.remaining(0.0), Some(100.0));
        assert_eq!(sub.remaining(40.5), Some(59.5));
        assert_eq!(sub.remaining(100.0), Some(0.0));
        assert_eq!(sub.remaining(1_000.0), Some(0.0));
    }

    #[test]
    fn test_unlimited_subscription() {
        assert_eq!(subscription(0, 0).remaining(5_000.0), None);
        assert_eq!(subscription(-1, 0).remaining(5_000.0), None);
    }

    #[test]
    fn test_expiry() {
        let sub = subscription(0, 1_000);
        assert!(!sub.is_expired_at(999));
        assert!(!sub.is_expired_at(1_000));
        assert!(sub.is_expired_at(1_001));
        assert!(!subscription(0, 0).is_expired_at(i64::MAX));
    }

    #[test]
    fn test_pricing_modes() {
        let fixed = Pricing {
            cost_per_call: 2.5,
            cost_mode: CostMode::Fixed,
        };
        assert_eq!(fixed.price_for(4.0), 2.5);

        let dynamic = Pricing {
            cost_per_call: 2.5,
            cost_mode: CostMode::Dynamic,
        };
        assert_eq!(dynamic.price_for(4.0), 10.0);
        assert_eq!(dynamic.price_for(1.0), 2.5);
    }

    #[test]
    fn test_access_type_parse() {
        assert_eq!("PAID".parse::<AccessType>().unwrap(), AccessType::Paid);
        assert!("premium".parse::<AccessType>().is_err());
        assert!(AccessType::Paid.is_metered());
        assert!(!AccessType::Private.is_metered());
    }

    #[test]
    fn test_cost_mode_defaults_to_fixed() {
        assert_eq!("".parse::<CostMode>().unwrap(), CostMode::Fixed);
        let pricing: Pricing = serde_json::from_str(r#"{"cost_per_call": 1.0}"#).unwrap();
        assert_eq!(pricing.cost_mode, CostMode::Fixed);
    }
}
