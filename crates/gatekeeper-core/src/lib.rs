pub mod error;
pub mod events;
pub mod keys;
pub mod model;
pub mod time;

pub use error::{CoreError, Result};
pub use events::{
    ChangeEvent, EndpointCreatedEvent, EndpointDeletedEvent, OrgPermissionModifiedEvent,
    OrganizationModifiedEvent, PricingModifiedEvent, SubscriptionModifiedEvent, Topic,
};
pub use keys::{CachePrefix, UsageKey, UsageMetric};
pub use model::{
    AccessType, ApiEndpoint, CostMode, Organization, PermissionGrant, Pricing, QuotaUsage,
    Subscription, UsageSummary,
};
pub use time::{current_bucket, next_interval_boundary, now_unix, until_next_boundary};
