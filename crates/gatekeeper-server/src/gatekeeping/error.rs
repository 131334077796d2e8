//! Decision errors and their HTTP mapping.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use gatekeeper_storage::StorageError;
use serde_json::json;

use crate::cache::CacheError;

pub const NO_MATCHING_ENDPOINT: &str = "no matching endpoint";
pub const ORGANIZATION_NOT_FOUND: &str = "organization not found";
pub const ENDPOINT_NOT_FOUND: &str = "endpoint not found";
pub const PERMISSION_DENIED: &str = "permission denied";
pub const NO_ACTIVE_SUBSCRIPTION: &str = "no active subscription";
pub const SUBSCRIPTION_EXPIRED: &str = "subscription expired";
pub const QUOTA_EXCEEDED: &str = "quota exceeded";

/// Outcome of a rejected or failed gatekeeping call.
#[derive(Debug, thiserror::Error)]
pub enum GatekeeperError {
    /// No route, organization or endpoint.
    #[error("{0}")]
    NotFound(String),

    /// Permission, subscription, expiry or quota check failed.
    #[error("{0}")]
    Unauthorized(String),

    /// The caller did not identify an organization.
    #[error("missing X-Org-Name header")]
    MissingOrganization,

    #[error("bad request: {0}")]
    BadRequest(String),

    /// The upstream in proxy mode could not be reached.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Storage, cache or codec failure. Logged in full, reported generically.
    #[error("internal error at {stage}: {message}")]
    Internal { stage: &'static str, message: String },
}

impl GatekeeperError {
    pub fn not_found(reason: impl Into<String>) -> Self {
        Self::NotFound(reason.into())
    }

    pub fn unauthorized(reason: impl Into<String>) -> Self {
        Self::Unauthorized(reason.into())
    }

    pub fn internal(stage: &'static str, source: impl std::fmt::Display) -> Self {
        Self::Internal {
            stage,
            message: source.to_string(),
        }
    }

    /// Maps a storage failure at `stage`. `NotFound` from storage stays a
    /// `NotFound` decision.
    pub fn storage(stage: &'static str, err: StorageError) -> Self {
        if err.is_not_found() {
            Self::NotFound(err.to_string())
        } else {
            Self::internal(stage, err)
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unauthorized(_) => StatusCode::FORBIDDEN,
            Self::MissingOrganization => StatusCode::UNAUTHORIZED,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not-found",
            Self::Unauthorized(_) => "forbidden",
            Self::MissingOrganization => "login",
            Self::BadRequest(_) => "invalid",
            Self::Upstream(_) => "upstream",
            Self::Internal { .. } => "exception",
        }
    }

    /// Label for decision metrics.
    pub fn outcome(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Unauthorized(_) | Self::MissingOrganization => "unauthorized",
            Self::BadRequest(_) => "bad_request",
            Self::Upstream(_) | Self::Internal { .. } => "internal",
        }
    }
}

impl From<CacheError> for GatekeeperError {
    fn from(err: CacheError) -> Self {
        Self::internal("cache", err)
    }
}

impl IntoResponse for GatekeeperError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match &self {
            Self::Internal { stage, message } => {
                tracing::error!(stage, error = %message, "gatekeeping failed");
                "internal server error".to_string()
            }
            other => other.to_string(),
        };

        let body = json!({
            "error": message,
            "code": self.code(),
        });

        (status, Json(body)).into_response()
    }
}
