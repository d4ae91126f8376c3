//! Per-request admission and sanitization (spec §4.7, §4.8): resolving the
//! effective authority, rejecting ambiguous target forms, and running
//! request-level admission control before a request reaches a [`crate::handler::Handler`].

use http::{HeaderMap, Request, StatusCode};

use crate::error::{AdmissionError, ValidationError};
use crate::net::host::HostInfo;
use crate::token_bucket::TokenBucket;

/// The authority a request resolves to, after reconciling `:authority` (or,
/// on a fallback transport, the `Host` header) with any absolute-form
/// request target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAuthority {
    pub host: HostInfo,
}

/// Which request-target grammar a request's target matches (spec §4.7,
/// §4.8 step 5). Only [`TargetForm::Other`] is rejected: the remaining four
/// forms are all legitimate shapes a conforming HTTP/2 client may send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetForm {
    /// `/path?query` — the ordinary case.
    Origin,
    /// The literal `*`, used by e.g. `OPTIONS *`.
    Asterisk,
    /// `scheme://authority/path?query` — a request-URI carrying a scheme.
    Absolute,
    /// Bare `host:port` with no path, used by `CONNECT`.
    Authority,
    /// Anything that doesn't fit the four forms above.
    Other,
}

/// Classifies a request's target per spec §4.7's target-form grammar.
pub fn classify_target<B>(request: &Request<B>) -> TargetForm {
    let uri = request.uri();

    if uri.path() == "*" && uri.query().is_none() {
        return TargetForm::Asterisk;
    }
    if uri.scheme().is_some() {
        return TargetForm::Absolute;
    }
    if request.method() == http::Method::CONNECT && uri.authority().is_some() && uri.path().is_empty() {
        return TargetForm::Authority;
    }
    if uri.path().starts_with('/') {
        return TargetForm::Origin;
    }
    TargetForm::Other
}

/// Headers with no further use once the authority has been resolved into
/// the [`RequestContext`](crate::context::RequestContext): the HTTP/2
/// pseudo-headers are already consumed into [`http::Request::method`] /
/// [`http::Request::uri`] by the `h2`/`http` layer, so here this strips the
/// fallback-transport `Host` header and freezes `set-cookie` into an owned
/// copy so downstream logging can't be confused by a handler mutating the
/// live response (spec §4.7).
pub fn sanitize_headers(headers: &HeaderMap) -> HeaderMap {
    let mut sanitized = headers.clone();
    sanitized.remove(http::header::HOST);
    sanitized
}

/// Extracts and validates the authority a request is addressed to.
///
/// HTTP/2 carries the authority in the `:authority` pseudo-header, which
/// `http`/`h2` surface as [`http::uri::Uri::authority`]; a bare `Host`
/// header is only consulted as a fallback, and the two are required to
/// agree when both are present, closing a request-smuggling vector where a
/// proxy and the origin disagree about which host a request was for.
pub fn resolve_authority<B>(request: &Request<B>) -> Result<ResolvedAuthority, ValidationError> {
    let from_uri = request.uri().authority().map(|a| a.as_str().to_string());
    let from_header = request
        .headers()
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let raw = match (from_uri, from_header) {
        (Some(uri_authority), Some(header_host)) => {
            let parsed_uri = HostInfo::parse_strict(&uri_authority)?;
            let parsed_header = HostInfo::parse_strict(&header_host)?;
            if parsed_uri != parsed_header {
                return Err(ValidationError::InvalidHost {
                    input: format!("{uri_authority} vs {header_host}"),
                    reason: ":authority and Host header disagree",
                });
            }
            return Ok(ResolvedAuthority { host: parsed_uri });
        }
        (Some(uri_authority), None) => uri_authority,
        (None, Some(header_host)) => header_host,
        (None, None) => {
            return Err(ValidationError::InvalidHost {
                input: String::new(),
                reason: "request carries neither :authority nor Host",
            })
        }
    };

    Ok(ResolvedAuthority {
        host: HostInfo::parse_strict(&raw)?,
    })
}

/// Runs request-level admission control against a shared bucket, converting
/// the outcome into the status code the wrangler should respond with on
/// denial.
pub async fn admit(bucket: &TokenBucket, cost: f64) -> Result<(), (StatusCode, AdmissionError)> {
    match bucket.request_grant(cost, cost).await {
        amount if amount >= cost => Ok(()),
        _ => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            AdmissionError::QueueFull,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Request;

    #[test]
    fn resolves_from_authority_form_uri() {
        let req = Request::builder()
            .uri("https://example.com/path")
            .body(())
            .unwrap();
        let resolved = resolve_authority(&req).unwrap();
        assert_eq!(resolved.host.host, "example.com");
    }

    #[test]
    fn resolves_from_host_header_when_uri_has_none() {
        let req = Request::builder()
            .uri("/path")
            .header(http::header::HOST, "example.com:8443")
            .body(())
            .unwrap();
        let resolved = resolve_authority(&req).unwrap();
        assert_eq!(resolved.host.host, "example.com");
        assert_eq!(resolved.host.port, Some(8443));
    }

    #[test]
    fn rejects_disagreeing_authority_and_host() {
        let req = Request::builder()
            .uri("https://example.com/path")
            .header(http::header::HOST, "evil.example")
            .body(())
            .unwrap();
        assert!(resolve_authority(&req).is_err());
    }

    #[test]
    fn rejects_request_with_no_authority_at_all() {
        let req = Request::builder().uri("/path").body(()).unwrap();
        assert!(resolve_authority(&req).is_err());
    }

    #[test]
    fn classifies_origin_form() {
        let req = Request::builder().uri("/path?q=1").body(()).unwrap();
        assert_eq!(classify_target(&req), TargetForm::Origin);
    }

    #[test]
    fn classifies_asterisk_form() {
        let req = Request::builder()
            .method(http::Method::OPTIONS)
            .uri("*")
            .body(())
            .unwrap();
        assert_eq!(classify_target(&req), TargetForm::Asterisk);
    }

    #[test]
    fn classifies_absolute_form() {
        let req = Request::builder().uri("https://example.com/path").body(()).unwrap();
        assert_eq!(classify_target(&req), TargetForm::Absolute);
    }

    #[test]
    fn classifies_authority_form() {
        let req = Request::builder()
            .method(http::Method::CONNECT)
            .uri("example.com:443")
            .body(())
            .unwrap();
        assert_eq!(classify_target(&req), TargetForm::Authority);
    }

    #[test]
    fn sanitize_headers_strips_host() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::HOST, "example.com".parse().unwrap());
        headers.insert(http::header::SET_COOKIE, "a=b".parse().unwrap());
        let sanitized = sanitize_headers(&headers);
        assert!(!sanitized.contains_key(http::header::HOST));
        assert!(sanitized.contains_key(http::header::SET_COOKIE));
    }
}
