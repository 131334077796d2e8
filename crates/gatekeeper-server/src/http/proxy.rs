//! Reverse proxy for the `proxy` deployment mode.

use std::time::Duration;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Request},
    response::Response,
};
use reqwest::Url;

use crate::gatekeeping::GatekeeperError;
use crate::server::AppState;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Forwards requests to a single upstream base URL.
pub struct ProxyClient {
    client: reqwest::Client,
    target: Url,
    body_limit: usize,
    timeout: Duration,
}

impl ProxyClient {
    pub fn new(target: &str, body_limit: usize) -> Result<Self, GatekeeperError> {
        let target = Url::parse(target.trim()).map_err(|e| {
            GatekeeperError::internal("proxy", format!("invalid proxy target {target:?}: {e}"))
        })?;
        if !matches!(target.scheme(), "http" | "https") {
            return Err(GatekeeperError::internal(
                "proxy",
                format!("unsupported proxy scheme {}", target.scheme()),
            ));
        }
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| GatekeeperError::internal("proxy", e))?;
        Ok(Self {
            client,
            target,
            body_limit,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn target(&self) -> &Url {
        &self.target
    }

    /// Upstream URL for an incoming path and query. The target's own path is
    /// kept as a prefix.
    pub fn upstream_url(&self, path: &str, query: Option<&str>) -> Url {
        let mut url = self.target.clone();
        let base = self.target.path().trim_end_matches('/');
        url.set_path(&format!("{base}{path}"));
        url.set_query(query);
        url
    }

    pub async fn forward(&self, request: Request<Body>) -> Result<Response, GatekeeperError> {
        let method = request.method().clone();
        let url = self.upstream_url(request.uri().path(), request.uri().query());

        let mut headers = HeaderMap::new();
        for (name, value) in request.headers() {
            if is_hop_by_hop_header(name.as_str()) {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }

        let body = axum::body::to_bytes(request.into_body(), self.body_limit)
            .await
            .map_err(|e| GatekeeperError::BadRequest(format!("failed to read request body: {e}")))?;

        tracing::debug!(method = %method, url = %url, "proxying request");

        let upstream = self
            .client
            .request(method, url)
            .headers(headers)
            .body(body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GatekeeperError::Upstream(format!(
                        "upstream timed out after {} seconds",
                        self.timeout.as_secs()
                    ))
                } else if e.is_connect() {
                    GatekeeperError::Upstream(format!("failed to connect to upstream: {e}"))
                } else {
                    GatekeeperError::Upstream(format!("upstream request failed: {e}"))
                }
            })?;

        let status = upstream.status();
        let mut builder = Response::builder().status(status);
        for (name, value) in upstream.headers() {
            if !is_hop_by_hop_header(name.as_str()) {
                builder = builder.header(name, value);
            }
        }

        let bytes = upstream
            .bytes()
            .await
            .map_err(|e| GatekeeperError::Upstream(format!("failed to read upstream body: {e}")))?;

        builder
            .body(Body::from(bytes))
            .map_err(|e| GatekeeperError::internal("proxy", e))
    }
}

/// Fallback handler: every admitted request is forwarded upstream.
pub async fn forward(
    State(state): State<AppState>,
    request: Request<Body>,
) -> Result<Response, GatekeeperError> {
    let proxy = state
        .proxy
        .as_ref()
        .ok_or_else(|| GatekeeperError::internal("proxy", "no proxy target configured"))?;
    proxy.forward(request).await
}

/// Hop-by-hop headers (RFC 7230 section 6.1) plus `Host`, which must match
/// the upstream.
fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
            | "host"
            | "content-length"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_hop_by_hop_header() {
        assert!(is_hop_by_hop_header("Connection"));
        assert!(is_hop_by_hop_header("Transfer-Encoding"));
        assert!(is_hop_by_hop_header("host"));
        assert!(!is_hop_by_hop_header("Content-Type"));
        assert!(!is_hop_by_hop_header("X-Org-Name"));
    }

    #[test]
    fn test_upstream_url_keeps_prefix_and_query() {
        let proxy = ProxyClient::new("http://upstream:9000/api/", 1024).unwrap();
        assert_eq!(
            proxy.upstream_url("/e1", Some("page=2")).as_str(),
            "http://upstream:9000/api/e1?page=2"
        );

        let proxy = ProxyClient::new("http://upstream:9000", 1024).unwrap();
        assert_eq!(
            proxy.upstream_url("/users/1", None).as_str(),
            "http://upstream:9000/users/1"
        );
    }

    #[test]
    fn test_invalid_target_rejected() {
        assert!(ProxyClient::new("not a url", 1024).is_err());
        assert!(ProxyClient::new("ftp://upstream", 1024).is_err());
    }
}
