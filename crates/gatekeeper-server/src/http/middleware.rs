//! Gate middleware for the `middleware` and `proxy` deployment modes.

use std::time::Instant;

use axum::{
    body::Body,
    extract::{MatchedPath, State},
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::{header_call_units, org_name};
use crate::metrics;
use crate::server::AppState;

/// Validates before the inner service runs and records usage after it,
/// but only when the inner response is below 400.
///
/// Method and path come from the request line; the organization from
/// `X-Org-Name`.
pub async fn gate(State(state): State<AppState>, req: Request<Body>, next: Next) -> Response {
    let method = req.method().as_str().to_string();
    let path = req.uri().path().to_string();

    let org = match org_name(req.headers()) {
        Ok(org) => org,
        Err(e) => return e.into_response(),
    };
    let call_units = match header_call_units(req.headers()) {
        Ok(units) => units.unwrap_or(1.0),
        Err(e) => return e.into_response(),
    };

    if let Err(e) = state.service.validate_request(&method, &path, &org).await {
        return e.into_response();
    }

    let response = next.run(req).await;

    if response.status().as_u16() < 400 {
        if let Err(e) = state
            .service
            .record_usage(&method, &path, &org, call_units)
            .await
        {
            tracing::warn!(
                organization = %org,
                method = %method,
                path = %path,
                error = %e,
                "usage not recorded"
            );
        }
    }

    response
}

/// Records request count and latency, labelled by the matched route template.
pub async fn track_metrics(req: Request<Body>, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().as_str().to_string();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "fallback".to_string());

    let response = next.run(req).await;
    metrics::record_http_request(&method, &route, response.status().as_u16(), start.elapsed());
    response
}
