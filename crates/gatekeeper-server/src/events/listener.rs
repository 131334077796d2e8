//! Keeps the route table and caches in step with administrative changes.

use std::sync::Arc;

use gatekeeper_core::keys::{endpoint_key, organization_key};
use gatekeeper_core::{CachePrefix, ChangeEvent, Topic};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::ChangeBus;
use crate::cache::TwoTierCache;
use crate::matcher::{Matcher, Route};
use crate::metrics;

/// One cancellable task per topic.
pub struct InvalidationListener {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl InvalidationListener {
    /// Subscribes to every topic and spawns its handler loop.
    pub fn start(bus: &ChangeBus, cache: Arc<TwoTierCache>, matcher: Arc<Matcher>) -> Self {
        let token = CancellationToken::new();
        let handles = Topic::ALL
            .into_iter()
            .map(|topic| {
                let mut rx = bus.subscribe(topic, token.child_token());
                let token = token.child_token();
                let cache = Arc::clone(&cache);
                let matcher = Arc::clone(&matcher);

                tokio::spawn(async move {
                    tracing::debug!(topic = %topic, "listener started");
                    loop {
                        tokio::select! {
                            _ = token.cancelled() => break,
                            payload = rx.recv() => {
                                let Some(payload) = payload else { break };
                                match ChangeEvent::decode(topic, &payload) {
                                    Ok(event) => {
                                        apply_event(&cache, &matcher, &event).await;
                                        metrics::record_event(topic.as_str(), true);
                                    }
                                    Err(e) => {
                                        tracing::warn!(topic = %topic, error = %e, payload = %payload, "undecodable event skipped");
                                        metrics::record_event(topic.as_str(), false);
                                    }
                                }
                            }
                        }
                    }
                    tracing::debug!(topic = %topic, "listener stopped");
                })
            })
            .collect();

        tracing::info!(topics = Topic::ALL.len(), bus = bus.mode(), "invalidation listener started");
        Self { token, handles }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Cancels every topic task and waits for them to finish.
    pub async fn stop(self) {
        self.token.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "listener task ended abnormally");
            }
        }
        tracing::info!("invalidation listener stopped");
    }
}

/// Applies one event. Cache effects are always deletes, never updates.
pub async fn apply_event(cache: &TwoTierCache, matcher: &Matcher, event: &ChangeEvent) {
    match event {
        ChangeEvent::EndpointCreated(e) => {
            matcher.add(Route::new(&e.method, &e.path, e.code.clone()));
            cache.invalidate(&endpoint_key(&e.code)).await;
        }
        ChangeEvent::EndpointDeleted(e) => {
            matcher.remove_code(&e.code);
            cache.invalidate(&endpoint_key(&e.code)).await;
        }
        ChangeEvent::OrganizationModified(e) => {
            if e.name.is_empty() {
                cache.invalidate_matching(&CachePrefix::Organization.pattern()).await;
            } else {
                cache.invalidate(&organization_key(&e.name)).await;
            }
            cache
                .invalidate_matching(&format!("{}:{}:*", CachePrefix::Permission, e.id))
                .await;
            cache
                .invalidate_matching(&format!("{}:{}:*", CachePrefix::Subscription, e.id))
                .await;
        }
        ChangeEvent::SubscriptionModified(e) => {
            let subscriptions = match e.organization_id {
                Some(org) => format!("{}:{org}:*", CachePrefix::Subscription),
                None => CachePrefix::Subscription.pattern(),
            };
            cache.invalidate_matching(&subscriptions).await;
            cache
                .invalidate_matching(&format!("{}:{}:*", CachePrefix::Pricing, e.id))
                .await;
            cache
                .invalidate_matching(&format!("{}:*:{}:*", CachePrefix::Quota, e.id))
                .await;
        }
        ChangeEvent::PricingModified(e) => {
            let pattern = if e.kind.eq_ignore_ascii_case("custom") {
                format!("{}:{}:*", CachePrefix::Pricing, e.id)
            } else {
                // Tier pricing reaches every subscription on that tier.
                CachePrefix::Pricing.pattern()
            };
            cache.invalidate_matching(&pattern).await;
        }
        ChangeEvent::OrgPermissionModified(e) => {
            cache
                .invalidate_matching(&format!("{}:{}:*", CachePrefix::Permission, e.id))
                .await;
        }
    }
    tracing::debug!(topic = %event.topic(), "event applied");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use gatekeeper_core::{
        EndpointCreatedEvent, EndpointDeletedEvent, OrganizationModifiedEvent,
        PricingModifiedEvent, SubscriptionModifiedEvent,
    };

    use crate::cache::SharedStore;

    fn cache() -> Arc<TwoTierCache> {
        Arc::new(TwoTierCache::new(
            SharedStore::memory(),
            Duration::from_secs(60),
            Duration::from_secs(600),
        ))
    }

    async fn present(cache: &TwoTierCache, key: &str) -> bool {
        cache.get_raw(key).await.is_some()
    }

    #[tokio::test]
    async fn test_endpoint_lifecycle_updates_matcher() {
        let cache = cache();
        let matcher = Matcher::new();

        let created = ChangeEvent::EndpointCreated(EndpointCreatedEvent {
            code: "E9".into(),
            path: "/reports/:id".into(),
            method: "get".into(),
        });
        apply_event(&cache, &matcher, &created).await;
        assert_eq!(matcher.match_route("GET", "/reports/1").as_deref(), Some("E9"));

        cache.set_raw("endpoint:E9", b"{}".to_vec()).await;
        let deleted = ChangeEvent::EndpointDeleted(EndpointDeletedEvent { code: "E9".into() });
        apply_event(&cache, &matcher, &deleted).await;
        assert_eq!(matcher.match_route("GET", "/reports/1"), None);
        assert!(!present(&cache, "endpoint:E9").await);
    }

    #[tokio::test]
    async fn test_subscription_modified_invalidates_related_keys() {
        let cache = cache();
        let matcher = Matcher::new();
        for key in ["subscription:1:10", "subscription:2:10", "pricing:7:10", "pricing:8:10", "quota:1:7:60"] {
            cache.set_raw(key, b"{}".to_vec()).await;
        }

        let event = ChangeEvent::SubscriptionModified(SubscriptionModifiedEvent {
            id: 7,
            organization_id: Some(1),
        });
        apply_event(&cache, &matcher, &event).await;

        assert!(!present(&cache, "subscription:1:10").await);
        assert!(present(&cache, "subscription:2:10").await);
        assert!(!present(&cache, "pricing:7:10").await);
        assert!(present(&cache, "pricing:8:10").await);
        assert!(!present(&cache, "quota:1:7:60").await);
    }

    #[tokio::test]
    async fn test_organization_and_pricing_events() {
        let cache = cache();
        let matcher = Matcher::new();
        for key in ["organization:Acme", "permission:1:1:read", "pricing:3:1", "pricing:4:1"] {
            cache.set_raw(key, b"{}".to_vec()).await;
        }

        apply_event(
            &cache,
            &matcher,
            &ChangeEvent::OrganizationModified(OrganizationModifiedEvent {
                id: 1,
                name: "Acme".into(),
            }),
        )
        .await;
        assert!(!present(&cache, "organization:Acme").await);
        assert!(!present(&cache, "permission:1:1:read").await);

        apply_event(
            &cache,
            &matcher,
            &ChangeEvent::PricingModified(PricingModifiedEvent {
                id: 3,
                kind: "custom".into(),
            }),
        )
        .await;
        assert!(!present(&cache, "pricing:3:1").await);
        assert!(present(&cache, "pricing:4:1").await);

        apply_event(
            &cache,
            &matcher,
            &ChangeEvent::PricingModified(PricingModifiedEvent {
                id: 2,
                kind: "tier".into(),
            }),
        )
        .await;
        assert!(!present(&cache, "pricing:4:1").await);
    }

    #[tokio::test]
    async fn test_listener_survives_bad_payload() {
        let bus = ChangeBus::local();
        let cache = cache();
        let matcher = Arc::new(Matcher::new());
        let listener = InvalidationListener::start(&bus, Arc::clone(&cache), Arc::clone(&matcher));

        if let ChangeBus::Local(local) = &bus {
            local
                .sender(Topic::EndpointCreated)
                .send("not json".to_string())
                .unwrap();
        }
        bus.publish(&ChangeEvent::EndpointCreated(EndpointCreatedEvent {
            code: "E5".into(),
            path: "/e5".into(),
            method: "GET".into(),
        }))
        .await
        .unwrap();

        let mut routed = false;
        for _ in 0..50 {
            if matcher.match_route("GET", "/e5").is_some() {
                routed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        listener.stop().await;
        assert!(routed);
    }
}
