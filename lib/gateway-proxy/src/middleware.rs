//! Request context and response hooks run around every request

use crate::auth::Claims;
use anyhow::Result;
use gateway_core::{CorsConfig, LogLevel, LoggingConfig, Route, UNMATCHED_LABEL};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_MAX_AGE, CONTENT_TYPE, ORIGIN, STRICT_TRANSPORT_SECURITY, VARY,
    X_CONTENT_TYPE_OPTIONS, X_FRAME_OPTIONS, X_XSS_PROTECTION,
};
use hyper::{Method, Request, Response};
use regex::Regex;
use std::borrow::Cow;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tracing::{debug, error, info, span, warn, Instrument, Level};
use uuid::Uuid;

pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

const HSTS_VALUE: &str = "max-age=31536000; includeSubDomains";

const TRUNCATED_MARKER: &str = "...[truncated]";

const SENSITIVE_FIELDS: &str = r#"(?i)("(?:password|secret|token|key|authorization)"\s*:\s*)"[^"]*""#;

/// Transport facts about the connection a request arrived on
#[derive(Clone, Copy, Debug)]
pub struct ConnectionInfo {
    pub peer: SocketAddr,
    pub is_tls: bool,
}

/// Whether a request went through the proxy pipeline or hit a gateway endpoint
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestKind {
    Pipeline,
    Internal,
}

/// Per-request state, owned by the task handling the request
#[derive(Clone, Debug)]
pub struct RequestContext {
    pub request_id: String,
    /// The id came from the client's `X-Request-Id` header
    pub client_supplied_id: bool,
    pub method: Method,
    pub path: String,
    pub client_ip: IpAddr,
    pub peer: SocketAddr,
    pub is_tls: bool,
    pub origin: Option<HeaderValue>,
    pub kind: RequestKind,
    pub route: Option<Arc<Route>>,
    /// Metrics label: matched prefix or `unmatched`
    pub route_label: String,
    pub claims: Option<Claims>,
    pub started: Instant,
    /// Captured for the access log when body logging is on
    pub request_body: Option<String>,
    pub response_body: Option<String>,
}

impl RequestContext {
    /// Build a context, echoing the client's request id or generating one
    pub fn from_request<B>(req: &Request<B>, conn: &ConnectionInfo, client_ip: IpAddr) -> Self {
        let (request_id, client_supplied_id) = match req.headers().get(&X_REQUEST_ID) {
            Some(value) => match value.to_str() {
                Ok(id) if !id.is_empty() => (id.to_string(), true),
                _ => {
                    let generated = Uuid::new_v4().to_string();
                    debug!(
                        request_id = %generated,
                        "Client X-Request-Id is empty or not visible ASCII, generated a new one"
                    );
                    (generated, false)
                }
            },
            None => (Uuid::new_v4().to_string(), false),
        };

        Self {
            request_id,
            client_supplied_id,
            method: req.method().clone(),
            path: req.uri().path().to_string(),
            client_ip,
            peer: conn.peer,
            is_tls: conn.is_tls,
            origin: req.headers().get(ORIGIN).cloned(),
            kind: RequestKind::Pipeline,
            route: None,
            route_label: UNMATCHED_LABEL.to_string(),
            claims: None,
            started: Instant::now(),
            request_body: None,
            response_body: None,
        }
    }

    /// Request id to embed in error bodies
    pub fn echoed_id(&self) -> Option<&str> {
        self.client_supplied_id.then_some(self.request_id.as_str())
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

/// Hooks invoked around request processing
#[async_trait::async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &'static str {
        "UnnamedMiddleware"
    }

    /// Called before the request is processed
    async fn on_request(&self, _context: &RequestContext) -> Result<()> {
        Ok(())
    }

    /// Called once the response is final; may add headers
    async fn on_response(&self, _context: &RequestContext, _response: &mut Response<Full<Bytes>>) -> Result<()> {
        Ok(())
    }
}

/// Chain of middleware to execute in order
pub struct MiddlewareChain {
    middleware: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self {
            middleware: Vec::new(),
        }
    }

    pub fn add<M: Middleware + 'static>(mut self, middleware: M) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    pub fn len(&self) -> usize {
        self.middleware.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middleware.is_empty()
    }

    pub async fn on_request(&self, context: &RequestContext) -> Result<()> {
        for mw in &self.middleware {
            let span = span!(Level::DEBUG, "middleware", name = mw.name());
            mw.on_request(context).instrument(span).await?;
        }
        Ok(())
    }

    /// Process the response through all middleware (in reverse order)
    pub async fn on_response(&self, context: &RequestContext, response: &mut Response<Full<Bytes>>) -> Result<()> {
        for mw in self.middleware.iter().rev() {
            let span = span!(Level::DEBUG, "middleware", name = mw.name());
            mw.on_response(context, response).instrument(span).await?;
        }
        Ok(())
    }
}

impl Default for MiddlewareChain {
    fn default() -> Self {
        Self::new()
    }
}

/// Puts the request id on every response
pub struct RequestIdMiddleware;

#[async_trait::async_trait]
impl Middleware for RequestIdMiddleware {
    fn name(&self) -> &'static str {
        "RequestIdMiddleware"
    }

    async fn on_response(&self, context: &RequestContext, response: &mut Response<Full<Bytes>>) -> Result<()> {
        let value = HeaderValue::from_str(&context.request_id)?;
        response.headers_mut().insert(X_REQUEST_ID, value);
        Ok(())
    }
}

pub struct SecurityHeadersMiddleware;

#[async_trait::async_trait]
impl Middleware for SecurityHeadersMiddleware {
    fn name(&self) -> &'static str {
        "SecurityHeadersMiddleware"
    }

    async fn on_response(&self, context: &RequestContext, response: &mut Response<Full<Bytes>>) -> Result<()> {
        let headers = response.headers_mut();
        headers.insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
        headers.insert(X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
        headers.insert(X_XSS_PROTECTION, HeaderValue::from_static("0"));
        if context.is_tls {
            headers.insert(STRICT_TRANSPORT_SECURITY, HeaderValue::from_static(HSTS_VALUE));
        }
        Ok(())
    }
}

/// Adds CORS headers for allowed cross-origin requests
pub struct CorsMiddleware {
    allowed_origins: Vec<String>,
    allow_any: bool,
    methods: HeaderValue,
    headers: HeaderValue,
    max_age: HeaderValue,
}

impl CorsMiddleware {
    pub fn new(config: &CorsConfig) -> Result<Self> {
        Ok(Self {
            allow_any: config.allowed_origins.iter().any(|o| o == "*"),
            allowed_origins: config.allowed_origins.clone(),
            methods: HeaderValue::from_str(&config.allowed_methods.join(", "))?,
            headers: HeaderValue::from_str(&config.allowed_headers.join(", "))?,
            max_age: HeaderValue::from(config.max_age_secs),
        })
    }

    fn allow_origin(&self, origin: &HeaderValue) -> Option<HeaderValue> {
        if self.allow_any {
            return Some(HeaderValue::from_static("*"));
        }
        let origin_str = origin.to_str().ok()?;
        self.allowed_origins
            .iter()
            .any(|o| o.eq_ignore_ascii_case(origin_str))
            .then(|| origin.clone())
    }
}

#[async_trait::async_trait]
impl Middleware for CorsMiddleware {
    fn name(&self) -> &'static str {
        "CorsMiddleware"
    }

    async fn on_response(&self, context: &RequestContext, response: &mut Response<Full<Bytes>>) -> Result<()> {
        let Some(origin) = &context.origin else {
            return Ok(());
        };
        let Some(allowed) = self.allow_origin(origin) else {
            debug!("CORS origin {:?} not allowed", origin);
            return Ok(());
        };

        let headers = response.headers_mut();
        if !self.allow_any {
            headers.append(VARY, HeaderValue::from_static("Origin"));
        }
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, allowed);
        headers.insert(ACCESS_CONTROL_ALLOW_METHODS, self.methods.clone());
        headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, self.headers.clone());
        headers.insert(ACCESS_CONTROL_MAX_AGE, self.max_age.clone());
        Ok(())
    }
}

/// Captures textual bodies for the access log, truncated and with secrets masked
#[derive(Clone, Copy, Debug)]
pub struct BodyLogger {
    max_bytes: usize,
}

impl BodyLogger {
    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }

    pub fn from_config(config: &LoggingConfig) -> Option<Self> {
        config.body_logging.then(|| Self::new(config.max_body_log_bytes))
    }

    /// Loggable form of `body`, or `None` for empty or binary content
    pub fn capture(&self, headers: &HeaderMap, body: &[u8]) -> Option<String> {
        if body.is_empty() || !is_textual(headers.get(CONTENT_TYPE)) {
            return None;
        }
        let cut = body.len().min(self.max_bytes);
        let mut text = String::from_utf8_lossy(&body[..cut]).into_owned();
        if body.len() > self.max_bytes {
            text.push_str(TRUNCATED_MARKER);
        }
        Some(redact_sensitive(&text).into_owned())
    }
}

/// JSON, XML, form and `text/*` bodies; a missing content type counts as text
fn is_textual(content_type: Option<&HeaderValue>) -> bool {
    let Some(value) = content_type else {
        return true;
    };
    let Ok(ct) = value.to_str() else {
        return false;
    };
    let ct = ct.to_ascii_lowercase();
    ct.contains("json") || ct.starts_with("text/") || ct.contains("xml") || ct.contains("form-urlencoded")
}

/// Mask the values of password, secret, token, key and authorization JSON fields
pub fn redact_sensitive(text: &str) -> Cow<'_, str> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    match PATTERN.get_or_init(|| Regex::new(SENSITIVE_FIELDS).ok()) {
        Some(re) => re.replace_all(text, r#"${1}"***""#),
        None => Cow::Borrowed("[redacted]"),
    }
}

/// One structured log line per request, at the matched route's level
pub struct AccessLogMiddleware;

#[async_trait::async_trait]
impl Middleware for AccessLogMiddleware {
    fn name(&self) -> &'static str {
        "AccessLogMiddleware"
    }

    async fn on_response(&self, context: &RequestContext, response: &mut Response<Full<Bytes>>) -> Result<()> {
        let level = match context.kind {
            RequestKind::Internal => LogLevel::Debug,
            RequestKind::Pipeline => context.route.as_ref().map_or(LogLevel::Info, |r| r.log_level),
        };

        macro_rules! access_log {
            ($mac:ident) => {
                $mac!(
                    method = %context.method,
                    path = %context.path,
                    status = response.status().as_u16(),
                    latency_ms = context.elapsed_ms(),
                    client_ip = %context.client_ip,
                    request_id = %context.request_id,
                    route = %context.route_label,
                    request_body = context.request_body.as_deref(),
                    response_body = context.response_body.as_deref(),
                    "request"
                )
            };
        }

        match level {
            LogLevel::Debug => access_log!(debug),
            LogLevel::Info => access_log!(info),
            LogLevel::Warn => access_log!(warn),
            LogLevel::Error => access_log!(error),
            LogLevel::None => {}
        }
        Ok(())
    }
}
