//! HTTP surface: gatekeeper endpoints, the gate middleware and the upstream proxy.

pub mod middleware;
pub mod proxy;
pub mod routes;

use axum::http::HeaderMap;

use crate::gatekeeping::GatekeeperError;

/// Identifies the calling organization.
pub const ORG_HEADER: &str = "x-org-name";
/// Multiplier for dynamically priced endpoints.
pub const CALL_UNITS_HEADER: &str = "x-call-units";
/// Target method when `/gatekeeper/validate` is called by a forward-auth proxy.
pub const FORWARDED_METHOD_HEADER: &str = "x-forwarded-method";
/// Target URI when `/gatekeeper/validate` is called by a forward-auth proxy.
pub const FORWARDED_URI_HEADER: &str = "x-forwarded-uri";

pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// The `X-Org-Name` value; a missing or empty header is a 401.
pub fn org_name(headers: &HeaderMap) -> Result<String, GatekeeperError> {
    header_str(headers, ORG_HEADER)
        .map(str::to_string)
        .ok_or(GatekeeperError::MissingOrganization)
}

/// Validates a call-units value: finite and strictly positive.
pub fn parse_call_units(raw: &str) -> Result<f64, GatekeeperError> {
    match raw.trim().parse::<f64>() {
        Ok(units) if units.is_finite() && units > 0.0 => Ok(units),
        _ => Err(GatekeeperError::BadRequest(format!(
            "call units must be a positive number, got {raw:?}"
        ))),
    }
}

/// `X-Call-Units` if present, otherwise `None`.
pub fn header_call_units(headers: &HeaderMap) -> Result<Option<f64>, GatekeeperError> {
    header_str(headers, CALL_UNITS_HEADER)
        .map(parse_call_units)
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_org_name_required() {
        let mut headers = HeaderMap::new();
        assert!(matches!(
            org_name(&headers),
            Err(GatekeeperError::MissingOrganization)
        ));
        headers.insert(ORG_HEADER, HeaderValue::from_static("  "));
        assert!(org_name(&headers).is_err());
        headers.insert(ORG_HEADER, HeaderValue::from_static("Acme"));
        assert_eq!(org_name(&headers).unwrap(), "Acme");
    }

    #[test]
    fn test_call_units() {
        assert_eq!(parse_call_units("2.5").unwrap(), 2.5);
        assert!(parse_call_units("0").is_err());
        assert!(parse_call_units("-1").is_err());
        assert!(parse_call_units("NaN").is_err());
        assert!(parse_call_units("lots").is_err());

        let mut headers = HeaderMap::new();
        assert_eq!(header_call_units(&headers).unwrap(), None);
        headers.insert(CALL_UNITS_HEADER, HeaderValue::from_static("3"));
        assert_eq!(header_call_units(&headers).unwrap(), Some(3.0));
    }
}
