mod common;

use axum::http::StatusCode;
use gatekeeper_core::CachePrefix;
use gatekeeper_server::{ChangeBus, GatekeeperMode};
use serde_json::Value;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::*;

async fn metered_calls(service: &gatekeeper_server::GatekeepingService) -> f64 {
    service.aggregator().flush_all().await;
    service
        .cache()
        .shared()
        .scan_numbers(&CachePrefix::Usage.pattern())
        .await
        .unwrap()
        .into_iter()
        .filter(|(k, _)| k.ends_with(":count"))
        .map(|(_, v)| v)
        .sum()
}

#[tokio::test]
async fn proxy_forwards_admitted_requests_and_meters_success() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/users/42"))
        .and(query_param("expand", "true"))
        .and(header("x-org-name", ORG))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-upstream", "yes")
                .set_body_json(serde_json::json!({ "id": 42 })),
        )
        .expect(1)
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/fail"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&upstream)
        .await;

    let storage = seeded_storage(100);
    let server = build_server(
        config(
            GatekeeperMode::Proxy,
            Some(format!("{}/api", upstream.uri())),
        ),
        storage,
        ChangeBus::local(),
        None,
    )
    .await;
    let service = server.state().service.clone();
    let (base, shutdown_tx, handle) = serve(server.router()).await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("{base}/users/42?expand=true"))
        .header("X-Org-Name", ORG)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["x-upstream"], "yes");
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["id"], 42);

    let resp = client
        .get(format!("{base}/fail"))
        .header("X-Org-Name", ORG)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

    assert_eq!(metered_calls(&service).await, 1.0);

    let _ = shutdown_tx.send(());
    let _ = handle.await;
    server.shutdown().await;
}

#[tokio::test]
async fn proxy_rejects_before_reaching_upstream() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&upstream)
        .await;

    let storage = seeded_storage(100);
    let server = build_server(
        config(GatekeeperMode::Proxy, Some(upstream.uri())),
        storage,
        ChangeBus::local(),
        None,
    )
    .await;
    let (base, shutdown_tx, handle) = serve(server.router()).await;
    let client = reqwest::Client::new();

    let resp = client.get(format!("{base}/e1")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = client
        .get(format!("{base}/nowhere"))
        .header("X-Org-Name", ORG)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = client
        .get(format!("{base}/gatekeeper/status"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let _ = shutdown_tx.send(());
    let _ = handle.await;
    server.shutdown().await;
    upstream.verify().await;
}

#[tokio::test]
async fn unreachable_upstream_is_bad_gateway() {
    let storage = seeded_storage(100);
    let server = build_server(
        config(
            GatekeeperMode::Proxy,
            Some("http://127.0.0.1:1".to_string()),
        ),
        storage,
        ChangeBus::local(),
        None,
    )
    .await;
    let service = server.state().service.clone();
    let (base, shutdown_tx, handle) = serve(server.router()).await;

    let resp = reqwest::Client::new()
        .get(format!("{base}/e1"))
        .header("X-Org-Name", ORG)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(metered_calls(&service).await, 0.0);

    let _ = shutdown_tx.send(());
    let _ = handle.await;
    server.shutdown().await;
}
