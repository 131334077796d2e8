//! Handlers for the `/gatekeeper` group and `/metrics`.

use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::{Value, json};

use super::{
    FORWARDED_METHOD_HEADER, FORWARDED_URI_HEADER, header_call_units, header_str, org_name,
};
use crate::gatekeeping::{GatekeeperError, ValidationDecision};
use crate::metrics;
use crate::server::AppState;

/// Optional JSON body of the explicit endpoints.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct TargetRequest {
    pub method: Option<String>,
    pub path: Option<String>,
    pub call_units: Option<f64>,
}

impl TargetRequest {
    fn from_body(body: &Bytes) -> Result<Self, GatekeeperError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        serde_json::from_slice(body)
            .map_err(|e| GatekeeperError::BadRequest(format!("invalid request body: {e}")))
    }

    /// Method and path of the call being checked. Forward-auth headers win
    /// over the body.
    fn target(&self, headers: &HeaderMap) -> Result<(String, String), GatekeeperError> {
        let method = header_str(headers, FORWARDED_METHOD_HEADER)
            .map(str::to_string)
            .or_else(|| self.method.clone())
            .ok_or_else(|| GatekeeperError::BadRequest("missing target method".into()))?;
        let uri = header_str(headers, FORWARDED_URI_HEADER)
            .map(str::to_string)
            .or_else(|| self.path.clone())
            .ok_or_else(|| GatekeeperError::BadRequest("missing target path".into()))?;
        let path = uri.split(['?', '#']).next().unwrap_or_default().to_string();
        Ok((method, path))
    }

    fn call_units(&self, headers: &HeaderMap) -> Result<f64, GatekeeperError> {
        if let Some(units) = header_call_units(headers)? {
            return Ok(units);
        }
        match self.call_units {
            Some(units) if units.is_finite() && units > 0.0 => Ok(units),
            Some(units) => Err(GatekeeperError::BadRequest(format!(
                "call units must be a positive number, got {units}"
            ))),
            None => Ok(1.0),
        }
    }
}

pub async fn status() -> Json<Value> {
    Json(json!({ "status": "OK" }))
}

/// `POST /gatekeeper/validate`
pub async fn validate(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ValidationDecision>, GatekeeperError> {
    let org = org_name(&headers)?;
    let request = TargetRequest::from_body(&body)?;
    let (method, path) = request.target(&headers)?;

    let decision = state.service.validate_request(&method, &path, &org).await?;
    Ok(Json(decision))
}

/// `POST /gatekeeper/recordUsage`
pub async fn record_usage(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, GatekeeperError> {
    let org = org_name(&headers)?;
    let request = TargetRequest::from_body(&body)?;
    let (method, path) = request.target(&headers)?;
    let call_units = request.call_units(&headers)?;

    let record = state
        .service
        .record_usage(&method, &path, &org, call_units)
        .await?;
    Ok(Json(json!({
        "price": record.price,
        "metered": record.metered,
        "bucket": record.bucket,
    })))
}

/// `POST /gatekeeper/flushCache` drops the process-local tier.
pub async fn flush_cache(State(state): State<AppState>) -> Json<Value> {
    let cleared = state.service.cache().clear_local().await;
    tracing::info!(cleared, "local cache flushed");
    Json(json!({
        "message": "Cache cleared successfully",
        "cleared": cleared,
    }))
}

/// `GET /metrics` in Prometheus text format.
pub async fn metrics_handler() -> Response {
    match metrics::render_metrics() {
        Some(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics not initialized").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_target_prefers_forwarded_headers() {
        let request = TargetRequest {
            method: Some("POST".into()),
            path: Some("/body".into()),
            call_units: None,
        };
        let mut headers = HeaderMap::new();
        assert_eq!(
            request.target(&headers).unwrap(),
            ("POST".to_string(), "/body".to_string())
        );

        headers.insert(FORWARDED_METHOD_HEADER, HeaderValue::from_static("GET"));
        headers.insert(FORWARDED_URI_HEADER, HeaderValue::from_static("/e1?page=2"));
        assert_eq!(
            request.target(&headers).unwrap(),
            ("GET".to_string(), "/e1".to_string())
        );
    }

    #[test]
    fn test_missing_target_is_bad_request() {
        let err = TargetRequest::default()
            .target(&HeaderMap::new())
            .unwrap_err();
        assert!(matches!(err, GatekeeperError::BadRequest(_)));
    }

    #[test]
    fn test_body_parsing() {
        assert!(TargetRequest::from_body(&Bytes::new()).unwrap().path.is_none());
        let parsed =
            TargetRequest::from_body(&Bytes::from_static(br#"{"path":"/e1","call_units":4}"#))
                .unwrap();
        assert_eq!(parsed.path.as_deref(), Some("/e1"));
        assert_eq!(parsed.call_units(&HeaderMap::new()).unwrap(), 4.0);
        assert!(TargetRequest::from_body(&Bytes::from_static(b"{")).is_err());
    }

    #[test]
    fn test_non_positive_body_units_rejected() {
        let request = TargetRequest {
            call_units: Some(0.0),
            ..Default::default()
        };
        assert!(request.call_units(&HeaderMap::new()).is_err());
    }
}
