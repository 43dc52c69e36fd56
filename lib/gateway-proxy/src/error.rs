//! Gateway error taxonomy and the JSON responder

use crate::auth::AuthError;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, ALLOW, CONTENT_TYPE, RETRY_AFTER};
use hyper::{Method, Response, StatusCode};
use serde::Serialize;
use std::sync::OnceLock;
use thiserror::Error;
use tracing::error;

pub(crate) const APPLICATION_JSON: &str = "application/json";

/// Stable machine-readable error codes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    RouteNotFound,
    MethodNotAllowed,
    AuthMissingToken,
    AuthInvalidToken,
    AuthInsufficientScope,
    BodyTooLarge,
    BadRequest,
    RateLimited,
    UpstreamUnavailable,
    BackendOverloaded,
    DeadlineExceeded,
    InternalError,
    Forbidden,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 13] = [
        ErrorCode::RouteNotFound,
        ErrorCode::MethodNotAllowed,
        ErrorCode::AuthMissingToken,
        ErrorCode::AuthInvalidToken,
        ErrorCode::AuthInsufficientScope,
        ErrorCode::BodyTooLarge,
        ErrorCode::BadRequest,
        ErrorCode::RateLimited,
        ErrorCode::UpstreamUnavailable,
        ErrorCode::BackendOverloaded,
        ErrorCode::DeadlineExceeded,
        ErrorCode::InternalError,
        ErrorCode::Forbidden,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::RouteNotFound => "GATEWAY_ROUTE_NOT_FOUND",
            ErrorCode::MethodNotAllowed => "GATEWAY_METHOD_NOT_ALLOWED",
            ErrorCode::AuthMissingToken => "GATEWAY_AUTH_MISSING_TOKEN",
            ErrorCode::AuthInvalidToken => "GATEWAY_AUTH_INVALID_TOKEN",
            ErrorCode::AuthInsufficientScope => "GATEWAY_AUTH_INSUFFICIENT_SCOPE",
            ErrorCode::BodyTooLarge => "GATEWAY_BODY_TOO_LARGE",
            ErrorCode::BadRequest => "GATEWAY_BAD_REQUEST",
            ErrorCode::RateLimited => "GATEWAY_RATE_LIMITED",
            ErrorCode::UpstreamUnavailable => "GATEWAY_UPSTREAM_UNAVAILABLE",
            ErrorCode::BackendOverloaded => "GATEWAY_BACKEND_OVERLOADED",
            ErrorCode::DeadlineExceeded => "GATEWAY_DEADLINE_EXCEEDED",
            ErrorCode::InternalError => "GATEWAY_INTERNAL_ERROR",
            ErrorCode::Forbidden => "GATEWAY_FORBIDDEN",
        }
    }

    pub fn status(self) -> StatusCode {
        match self {
            ErrorCode::RouteNotFound => StatusCode::NOT_FOUND,
            ErrorCode::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ErrorCode::AuthMissingToken | ErrorCode::AuthInvalidToken => StatusCode::UNAUTHORIZED,
            ErrorCode::AuthInsufficientScope | ErrorCode::Forbidden => StatusCode::FORBIDDEN,
            ErrorCode::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::UpstreamUnavailable => StatusCode::BAD_GATEWAY,
            ErrorCode::BackendOverloaded => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Serialized `{"error":…,"error_code":…,"message":` prefix, built once per process
    fn prefix(self) -> &'static [u8] {
        static PREFIXES: OnceLock<Vec<Vec<u8>>> = OnceLock::new();
        let prefixes = PREFIXES.get_or_init(|| ErrorCode::ALL.iter().map(|c| c.build_prefix()).collect());
        &prefixes[self as usize]
    }

    fn build_prefix(self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(96);
        buf.extend_from_slice(b"{\"error\":");
        push_json_str(&mut buf, self.status().canonical_reason().unwrap_or(""));
        buf.extend_from_slice(b",\"error_code\":");
        push_json_str(&mut buf, self.as_str());
        buf.extend_from_slice(b",\"message\":");
        buf
    }

    /// Render the response body for this code
    pub fn render(self, message: &str, request_id: Option<&str>) -> Bytes {
        let prefix = self.prefix();
        let mut buf = Vec::with_capacity(prefix.len() + message.len() + 64);
        buf.extend_from_slice(prefix);
        push_json_str(&mut buf, message);
        if let Some(id) = request_id {
            buf.extend_from_slice(b",\"request_id\":");
            push_json_str(&mut buf, id);
        }
        buf.push(b'}');
        Bytes::from(buf)
    }
}

/// Every failure the gateway answers on its own behalf
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("no matching route")]
    RouteNotFound,

    #[error("method not allowed")]
    MethodNotAllowed { method: Method, allow: String },

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("request body exceeds maximum allowed size")]
    BodyTooLarge,

    #[error("failed to read request body")]
    BodyRead,

    #[error("rate limit exceeded, retry later")]
    RateLimited { retry_after_secs: u64 },

    #[error("upstream service unavailable")]
    UpstreamUnavailable,

    #[error("circuit breaker open")]
    CircuitOpen,

    #[error("backend concurrency limit reached")]
    BackendOverloaded,

    #[error("request deadline exceeded")]
    DeadlineExceeded,

    #[error("an unexpected error occurred")]
    Internal,

    #[error("access denied")]
    Forbidden,
}

impl GatewayError {
    pub fn code(&self) -> ErrorCode {
        match self {
            GatewayError::RouteNotFound => ErrorCode::RouteNotFound,
            GatewayError::MethodNotAllowed { .. } => ErrorCode::MethodNotAllowed,
            GatewayError::Auth(AuthError::MissingToken) => ErrorCode::AuthMissingToken,
            GatewayError::Auth(AuthError::InvalidToken(_)) => ErrorCode::AuthInvalidToken,
            GatewayError::Auth(AuthError::InsufficientScope(_)) => ErrorCode::AuthInsufficientScope,
            GatewayError::BodyTooLarge => ErrorCode::BodyTooLarge,
            GatewayError::BodyRead => ErrorCode::BadRequest,
            GatewayError::RateLimited { .. } => ErrorCode::RateLimited,
            GatewayError::UpstreamUnavailable | GatewayError::CircuitOpen => ErrorCode::UpstreamUnavailable,
            GatewayError::BackendOverloaded => ErrorCode::BackendOverloaded,
            GatewayError::DeadlineExceeded => ErrorCode::DeadlineExceeded,
            GatewayError::Internal => ErrorCode::InternalError,
            GatewayError::Forbidden => ErrorCode::Forbidden,
        }
    }

    /// Build the taxonomy response, echoing the client's request id when given
    pub fn to_response(&self, request_id: Option<&str>) -> Response<Full<Bytes>> {
        let code = self.code();
        let mut response = Response::new(Full::new(code.render(&self.to_string(), request_id)));
        *response.status_mut() = code.status();
        let headers = response.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(APPLICATION_JSON));

        match self {
            GatewayError::MethodNotAllowed { allow, .. } => {
                if let Ok(value) = HeaderValue::from_str(allow) {
                    headers.insert(ALLOW, value);
                }
            }
            GatewayError::RateLimited { retry_after_secs } => {
                headers.insert(RETRY_AFTER, HeaderValue::from(*retry_after_secs));
            }
            _ => {}
        }
        response
    }
}

/// JSON response with the given status
pub fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => raw_json_response(status, Bytes::from(body)),
        Err(e) => {
            error!("Failed to serialize response body: {}", e);
            GatewayError::Internal.to_response(None)
        }
    }
}

/// JSON response from an already-serialized body
pub fn raw_json_response(status: StatusCode, body: Bytes) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(APPLICATION_JSON));
    response
}

/// Body-less response with the given status
pub fn empty_response(status: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}

/// Append `value` as a JSON string literal
fn push_json_str(buf: &mut Vec<u8>, value: &str) {
    if serde_json::to_writer(&mut *buf, value).is_err() {
        buf.extend_from_slice(b"\"\"");
    }
}
