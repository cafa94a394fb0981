//! Error responses emitted on the proxy data path

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};

/// Boxed error type used throughout the data path
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Response body type produced by the proxy
pub type ProxyBody = BoxBody<Bytes, BoxError>;

/// Error codes surfaced in the `X-Proxy-Error` header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyErrorCode {
    /// Backend dial, TLS handshake, or response-header failure
    UpstreamFailed,
    /// The per-request or response-header deadline expired
    UpstreamTimeout,
}

impl ProxyErrorCode {
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::UpstreamFailed => "UPSTREAM_FAILED",
            ProxyErrorCode::UpstreamTimeout => "UPSTREAM_TIMEOUT",
        }
    }
}

/// Build the `502 Bad Gateway` response for an upstream failure: the
/// standard reason phrase as a plain-text body, plus the error-code header.
pub fn bad_gateway(code: ProxyErrorCode) -> Response<ProxyBody> {
    let reason = StatusCode::BAD_GATEWAY
        .canonical_reason()
        .unwrap_or("Bad Gateway");

    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .header("X-Proxy-Error", code.as_header_value())
        .body(full_body(reason))
        .expect("valid response with static headers")
}

/// A complete in-memory body with the data-path error type
pub fn full_body(text: impl Into<Bytes>) -> ProxyBody {
    Full::new(text.into())
        .map_err(|never| match never {})
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_gateway_response() {
        let response = bad_gateway(ProxyErrorCode::UpstreamFailed);
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "UPSTREAM_FAILED"
        );
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "text/plain; charset=utf-8"
        );
    }

    #[test]
    fn test_error_code_header_values() {
        assert_eq!(
            ProxyErrorCode::UpstreamTimeout.as_header_value(),
            "UPSTREAM_TIMEOUT"
        );
    }
}
