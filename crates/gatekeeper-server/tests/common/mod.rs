#![allow(dead_code)]

use std::sync::Arc;

use axum::Router;
use gatekeeper_core::{AccessType, ApiEndpoint, CostMode, Organization, Pricing, Subscription};
use gatekeeper_db_memory::InMemoryStorage;
use gatekeeper_server::{
    AppConfig, ChangeBus, GatekeeperMode, GatekeeperServer, ServerBuilder, SharedStore,
};
use tokio::task::JoinHandle;

pub const ORG: &str = "Acme";
pub const ORG_ID: i32 = 1;
pub const SUBSCRIPTION_ID: i32 = 7;

pub fn endpoint(id: i32, code: &str, template: &str, access_type: AccessType) -> ApiEndpoint {
    ApiEndpoint {
        id,
        code: code.into(),
        method: "GET".into(),
        path_template: template.into(),
        resource_type_id: 1,
        permission_code: "read".into(),
        access_type,
    }
}

pub fn subscription(api_limit: i64, expiry_timestamp: i64, active: bool) -> Subscription {
    Subscription {
        id: SUBSCRIPTION_ID,
        organization_id: ORG_ID,
        api_limit,
        expiry_timestamp,
        active,
    }
}

/// Acme with subscription 7 covering a paid `E1`, a free `E2`, a paid
/// `USER` (`/users/:id`) and a paid `FAIL` endpoint, at 2.5 per paid call.
pub fn seeded_storage(api_limit: i64) -> Arc<InMemoryStorage> {
    let storage = Arc::new(InMemoryStorage::new());
    storage.insert_organization(Organization {
        id: ORG_ID,
        name: ORG.into(),
    });
    storage.insert_endpoint(endpoint(10, "E1", "/e1", AccessType::Paid));
    storage.insert_endpoint(endpoint(11, "E2", "/e2", AccessType::Free));
    storage.insert_endpoint(endpoint(12, "USER", "/users/:id", AccessType::Paid));
    storage.insert_endpoint(endpoint(13, "FAIL", "/fail", AccessType::Paid));
    storage.set_permission(ORG_ID, 1, "read", true);
    storage.insert_subscription(subscription(api_limit, 0, true), &[10, 11, 12, 13]);
    for endpoint_id in [10, 12, 13] {
        storage.set_pricing(
            SUBSCRIPTION_ID,
            endpoint_id,
            Pricing {
                cost_per_call: 2.5,
                cost_mode: CostMode::Fixed,
            },
        );
    }
    storage
}

pub fn config(mode: GatekeeperMode, proxy_target: Option<String>) -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.gatekeeper.mode = mode;
    cfg.gatekeeper.proxy_target = proxy_target;
    cfg.gatekeeper.flush_interval_secs = 3600;
    cfg
}

pub async fn build_server(
    cfg: AppConfig,
    storage: Arc<InMemoryStorage>,
    bus: ChangeBus,
    downstream: Option<Router>,
) -> GatekeeperServer {
    let mut builder = ServerBuilder::new()
        .with_config(cfg)
        .with_storage(storage)
        .with_shared_store(SharedStore::memory())
        .with_bus(bus);
    if let Some(router) = downstream {
        builder = builder.with_downstream(router);
    }
    builder.build().await.expect("build server")
}

/// Serves `app` on an ephemeral port.
pub async fn serve(app: Router) -> (String, tokio::sync::oneshot::Sender<()>, JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0))
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();

    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = rx.await;
            })
            .await;
    });

    (format!("http://{addr}"), tx, server)
}
