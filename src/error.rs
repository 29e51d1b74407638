//! Error codes and plaintext error responses produced by the gateway itself

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};

/// Header naming the gateway error on responses the gateway generates
pub const X_GATEWAY_ERROR: &str = "x-gateway-error";

/// Error codes for gateway errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayErrorCode {
    /// No routing table entry for the method and path
    RouteNotFound,
    /// Could not reach the service runtime
    UpstreamUnavailable,
    /// Service runtime did not answer within the configured timeout
    UpstreamTimeout,
    /// Internal gateway error
    InternalError,
}

impl GatewayErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayErrorCode::RouteNotFound => StatusCode::NOT_FOUND,
            GatewayErrorCode::UpstreamUnavailable => StatusCode::BAD_GATEWAY,
            GatewayErrorCode::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Gateway-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            GatewayErrorCode::RouteNotFound => "ROUTE_NOT_FOUND",
            GatewayErrorCode::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            GatewayErrorCode::UpstreamTimeout => "UPSTREAM_TIMEOUT",
            GatewayErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// Create a plaintext error response with X-Gateway-Error header
pub fn error_response(
    code: GatewayErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(code.status_code())
        .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .header(X_GATEWAY_ERROR, code.as_header_value())
        .body(
            Full::new(Bytes::from(message.into()))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response with StatusCode enum and static headers")
}

/// 404 for a request no endpoint accepts
pub fn route_not_found(method: &str, url: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    error_response(
        GatewayErrorCode::RouteNotFound,
        format!("Route {} {} not found", method, url),
    )
}
