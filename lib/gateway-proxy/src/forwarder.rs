//! Backend forwarding with buffered responses and retry

use crate::circuit_breaker::BreakerPermit;
use crate::client_ip::X_FORWARDED_FOR;
use crate::metrics::MetricsCollector;
use crate::middleware::{RequestContext, X_REQUEST_ID};
use crate::policy::RetryPolicy;
use gateway_core::Route;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, HOST};
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::tokio::TokioExecutor;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::timeout as tokio_timeout;
use tracing::{debug, warn};

pub const X_GATEWAY_LATENCY: HeaderName = HeaderName::from_static("x-gateway-latency");

pub const DEFAULT_MAX_RESPONSE_BYTES: usize = 10 * 1024 * 1024;

/// Headers that describe a single hop and are never forwarded
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

#[derive(Error, Debug)]
pub enum AttemptError {
    #[error("connect error: {0}")]
    Connect(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("response body exceeds {0} bytes")]
    ResponseTooLarge(usize),

    #[error("backend returned {}", .0.status)]
    Status(BufferedResponse),
}

impl AttemptError {
    /// `status` label for `gateway_backend_errors_total`
    pub fn label(&self) -> String {
        match self {
            AttemptError::Connect(_) => "connect_error".to_string(),
            AttemptError::Timeout(_) => "timeout".to_string(),
            AttemptError::ResponseTooLarge(_) => "response_too_large".to_string(),
            AttemptError::Status(response) => response.status.as_str().to_string(),
        }
    }

    /// An oversized response would be just as large on the next attempt
    pub fn is_retryable(&self) -> bool {
        !matches!(self, AttemptError::ResponseTooLarge(_))
    }
}

#[derive(Error, Debug)]
pub enum ForwardError {
    #[error("backend scheme {0} is not supported")]
    UnsupportedScheme(String),

    #[error("invalid upstream request: {0}")]
    InvalidRequest(String),

    #[error("upstream unavailable after {attempts} attempt(s): {last}")]
    Exhausted { attempts: u32, last: AttemptError },
}

/// A request ready to be sent, possibly more than once
#[derive(Clone, Debug)]
pub struct UpstreamRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl UpstreamRequest {
    /// Rewrite an inbound request for `route`'s backend
    pub fn build(
        route: &Route,
        head: &Request<()>,
        body: Bytes,
        context: &RequestContext,
    ) -> Result<Self, ForwardError> {
        let backend = &route.backend;
        match backend.scheme_str() {
            Some("http") | None => {}
            Some(other) => return Err(ForwardError::UnsupportedScheme(other.to_string())),
        }
        let authority = backend
            .authority()
            .cloned()
            .ok_or_else(|| ForwardError::InvalidRequest("backend has no authority".to_string()))?;

        let base = backend.path().trim_end_matches('/');
        let path = route.upstream_path(head.uri().path());
        let mut path_and_query = String::with_capacity(base.len() + path.len() + 32);
        path_and_query.push_str(base);
        path_and_query.push_str(path);
        if let Some(query) = head.uri().query() {
            path_and_query.push('?');
            path_and_query.push_str(query);
        }

        let uri = Uri::builder()
            .scheme("http")
            .authority(authority)
            .path_and_query(path_and_query)
            .build()
            .map_err(|e| ForwardError::InvalidRequest(e.to_string()))?;

        let mut headers = head.headers().clone();
        strip_hop_by_hop(&mut headers);
        headers.remove(HOST);
        headers.remove(CONTENT_LENGTH);

        let request_id = HeaderValue::from_str(&context.request_id)
            .map_err(|e| ForwardError::InvalidRequest(e.to_string()))?;
        headers.insert(X_REQUEST_ID, request_id);

        let peer = context.peer.ip().to_canonical().to_string();
        let prior: Vec<&str> = head
            .headers()
            .get_all(&X_FORWARDED_FOR)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();
        let forwarded_for = if prior.is_empty() {
            peer
        } else {
            format!("{}, {}", prior.join(", "), peer)
        };
        let forwarded_for = HeaderValue::from_str(&forwarded_for)
            .map_err(|e| ForwardError::InvalidRequest(e.to_string()))?;
        headers.insert(X_FORWARDED_FOR, forwarded_for);

        for (name, value) in &route.headers {
            headers.insert(name.clone(), value.clone());
        }

        Ok(Self {
            method: head.method().clone(),
            uri,
            headers,
            body,
        })
    }

    fn to_request(&self) -> Request<Full<Bytes>> {
        let mut request = Request::new(Full::new(self.body.clone()));
        *request.method_mut() = self.method.clone();
        *request.uri_mut() = self.uri.clone();
        *request.headers_mut() = self.headers.clone();
        request
    }
}

/// A backend response read completely into memory
#[derive(Clone, Debug)]
pub struct BufferedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl BufferedResponse {
    /// Replay to the client, adding `X-Gateway-Latency`
    pub fn into_response(self, started: Instant) -> Response<Full<Bytes>> {
        let mut headers = self.headers;
        strip_hop_by_hop(&mut headers);
        headers.remove(CONTENT_LENGTH);
        if let Ok(latency) = HeaderValue::from_str(&format!("{:?}", started.elapsed())) {
            headers.insert(X_GATEWAY_LATENCY, latency);
        }

        let mut response = Response::new(Full::new(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = headers;
        response
    }
}

enum RetryState {
    Attempting { attempt: u32 },
    BufferedSuccess { response: BufferedResponse, latency: Duration },
    BufferedFailure { attempt: u32, error: AttemptError },
}

/// HTTP request forwarder for proxying requests to backend services
/// with connection pooling and timeout support.
pub struct RequestForwarder {
    client: Client<HttpConnector, Full<Bytes>>,
    retry: RetryPolicy,
    max_response_bytes: usize,
    metrics: MetricsCollector,
}

impl RequestForwarder {
    pub fn new(connect_timeout: Duration, retry: RetryPolicy, metrics: MetricsCollector) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(connect_timeout));
        connector.set_keepalive(Some(Duration::from_secs(30)));

        let client = Client::builder(TokioExecutor::new()).build::<_, Full<Bytes>>(connector);

        Self {
            client,
            retry,
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
            metrics,
        }
    }

    /// Cap on the buffered size of a backend response
    pub fn with_max_response_bytes(mut self, limit: usize) -> Self {
        self.max_response_bytes = limit;
        self
    }

    /// Send `request` until it succeeds, retries run out, or the circuit opens.
    ///
    /// The breaker learns one outcome per call: success, or the final failure.
    pub async fn forward(
        &self,
        route: &Route,
        permit: BreakerPermit<'_>,
        request: UpstreamRequest,
    ) -> Result<BufferedResponse, ForwardError> {
        let mut state = RetryState::Attempting { attempt: 0 };
        loop {
            state = match state {
                RetryState::Attempting { attempt } => {
                    let started = Instant::now();
                    match self.attempt(route, &request).await {
                        Ok(response) => RetryState::BufferedSuccess {
                            response,
                            latency: started.elapsed(),
                        },
                        Err(error) => {
                            self.metrics
                                .backend_errors_total
                                .with_label_values(&[route.path_prefix.as_str(), error.label().as_str()])
                                .inc();
                            RetryState::BufferedFailure { attempt, error }
                        }
                    }
                }
                RetryState::BufferedSuccess { response, latency } => {
                    permit.record_success(latency);
                    return Ok(response);
                }
                RetryState::BufferedFailure { attempt, error } => {
                    if attempt < route.retry_attempts && error.is_retryable() && !permit.breaker().is_open() {
                        let backoff = self.retry.backoff_duration(attempt);
                        warn!(
                            route = %route.path_prefix,
                            attempt = attempt + 1,
                            error = %error,
                            "backend attempt failed, retrying in {:?}",
                            backoff
                        );
                        self.metrics
                            .retries_total
                            .with_label_values(&[route.path_prefix.as_str()])
                            .inc();
                        tokio::time::sleep(backoff).await;
                        RetryState::Attempting { attempt: attempt + 1 }
                    } else {
                        permit.record_failure();
                        return Err(ForwardError::Exhausted {
                            attempts: attempt + 1,
                            last: error,
                        });
                    }
                }
            };
        }
    }

    /// One attempt; the whole response is read before returning
    async fn attempt(&self, route: &Route, request: &UpstreamRequest) -> Result<BufferedResponse, AttemptError> {
        debug!("Forwarding {} {} ({:?} timeout)", request.method, request.uri, route.timeout);

        let limit = self.max_response_bytes;
        let exchange = async {
            let response = self
                .client
                .request(request.to_request())
                .await
                .map_err(|e| AttemptError::Connect(e.to_string()))?;
            let (parts, body) = response.into_parts();
            let body = Limited::new(body, limit)
                .collect()
                .await
                .map_err(|e| {
                    if e.downcast_ref::<LengthLimitError>().is_some() {
                        AttemptError::ResponseTooLarge(limit)
                    } else {
                        AttemptError::Connect(e.to_string())
                    }
                })?
                .to_bytes();
            Ok(BufferedResponse {
                status: parts.status,
                headers: parts.headers,
                body,
            })
        };

        let response = match tokio_timeout(route.timeout, exchange).await {
            Ok(result) => result?,
            Err(_) => return Err(AttemptError::Timeout(route.timeout)),
        };

        debug!("Backend responded with {} ({} bytes)", response.status, response.body.len());
        if self.retry.is_failure(response.status) {
            return Err(AttemptError::Status(response));
        }
        Ok(response)
    }
}

/// Remove hop-by-hop headers, including any named by `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreaker;
    use crate::middleware::ConnectionInfo;
    use gateway_core::{CircuitBreakerConfig, RouteConfig};
    use hyper::body::Incoming;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper_util::rt::tokio::TokioIo;
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::net::TcpListener;

    /// Serve `handler` on an ephemeral port; the n-th request (0-based) is passed along
    pub(crate) async fn spawn_backend<F>(handler: F) -> (SocketAddr, Arc<AtomicUsize>)
    where
        F: Fn(usize, Request<Incoming>) -> Response<Full<Bytes>> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let hits = Arc::new(AtomicUsize::new(0));
        let handler = Arc::new(handler);
        let counter = hits.clone();

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let handler = handler.clone();
                let counter = counter.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let n = counter.fetch_add(1, Ordering::SeqCst);
                        let response = handler(n, req);
                        async move { Ok::<_, Infallible>(response) }
                    });
                    let _ = http1::Builder::new().serve_connection(TokioIo::new(stream), service).await;
                });
            }
        });

        (addr, hits)
    }

    /// JSON view of the request head as the backend saw it
    pub(crate) fn echo_head(req: &Request<Incoming>) -> Response<Full<Bytes>> {
        let header = |name: &str| req.headers().get(name).and_then(|v| v.to_str().ok());
        let body = serde_json::json!({
            "method": req.method().as_str(),
            "uri": req.uri().to_string(),
            "request_id": header("x-request-id"),
            "forwarded_for": header("x-forwarded-for"),
            "authorization": header("authorization"),
        });
        let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
        response
            .headers_mut()
            .insert(hyper::header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        response
    }

    fn status_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
        *response.status_mut() = status;
        response
    }

    fn route_for(addr: SocketAddr, retries: u32) -> Route {
        let mut config = RouteConfig::new("/api", &format!("http://{}", addr));
        config.retry_attempts = retries;
        config.timeout_ms = 2_000;
        Route::from_config(&config).expect("route")
    }

    fn context_for(req: &Request<()>) -> RequestContext {
        let conn = ConnectionInfo {
            peer: "192.0.2.10:51000".parse().expect("addr"),
            is_tls: false,
        };
        RequestContext::from_request(req, &conn, conn.peer.ip())
    }

    fn upstream(route: &Route, uri: &str) -> UpstreamRequest {
        let req = Request::builder().uri(uri).body(()).expect("request");
        let ctx = context_for(&req);
        UpstreamRequest::build(route, &req, Bytes::from_static(b"payload"), &ctx).expect("upstream")
    }

    fn forwarder(metrics: &MetricsCollector) -> RequestForwarder {
        let retry = RetryPolicy {
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
        };
        RequestForwarder::new(Duration::from_secs(1), retry, metrics.clone())
    }

    fn breaker(metrics: &MetricsCollector) -> CircuitBreaker {
        CircuitBreaker::new("/api", &CircuitBreakerConfig::default(), metrics.clone())
    }

    #[test]
    fn test_hop_by_hop_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, x-session-hop"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("x-session-hop", HeaderValue::from_static("1"));
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers.insert("authorization", HeaderValue::from_static("Bearer t"));

        strip_hop_by_hop(&mut headers);
        assert_eq!(headers.len(), 2);
        assert!(headers.contains_key("content-type"));
        assert!(headers.contains_key("authorization"));
    }

    #[test]
    fn test_upstream_request_rewrite() {
        let mut config = RouteConfig::new("/api", "http://users.internal:8080/base/");
        config.strip_prefix = true;
        config.headers.insert("X-Gateway".to_string(), "edge".to_string());
        let route = Route::from_config(&config).expect("route");

        let req = Request::builder()
            .uri("/api/users/7?expand=true")
            .header(HOST, "gateway.example.com")
            .header("X-Forwarded-For", "198.51.100.1")
            .header("Connection", "close")
            .body(())
            .expect("request");
        let ctx = context_for(&req);
        let upstream = UpstreamRequest::build(&route, &req, Bytes::new(), &ctx).expect("upstream");

        assert_eq!(upstream.uri.to_string(), "http://users.internal:8080/base/users/7?expand=true");
        assert!(upstream.headers.get(HOST).is_none());
        assert!(upstream.headers.get(CONNECTION).is_none());
        assert_eq!(upstream.headers[&X_FORWARDED_FOR], "198.51.100.1, 192.0.2.10");
        assert_eq!(upstream.headers[&X_REQUEST_ID], ctx.request_id.as_str());
        assert_eq!(upstream.headers["x-gateway"], "edge");
    }

    #[test]
    fn test_https_backend_refused() {
        let route = Route::from_config(&RouteConfig::new("/secure", "https://vault.internal")).expect("route");
        let req = Request::builder().uri("/secure/x").body(()).expect("request");
        let ctx = context_for(&req);
        assert!(matches!(
            UpstreamRequest::build(&route, &req, Bytes::new(), &ctx),
            Err(ForwardError::UnsupportedScheme(_))
        ));
    }

    #[tokio::test]
    async fn test_forward_success_buffers_response() {
        let (addr, hits) = spawn_backend(|_, _| {
            let mut response = status_response(StatusCode::CREATED, "created");
            response.headers_mut().insert("x-backend", HeaderValue::from_static("users"));
            response
        })
        .await;
        let metrics = MetricsCollector::new().expect("metrics");
        let route = route_for(addr, 0);
        let cb = breaker(&metrics);

        let response = forwarder(&metrics)
            .forward(&route, cb.acquire().expect("permit"), upstream(&route, "/api/items"))
            .await
            .expect("forwarded");
        assert_eq!(response.status, StatusCode::CREATED);
        assert_eq!(&response.body[..], b"created");
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let replayed = response.into_response(Instant::now());
        assert_eq!(replayed.headers()["x-backend"], "users");
        assert!(replayed.headers().contains_key(X_GATEWAY_LATENCY));
    }

    #[tokio::test]
    async fn test_retry_replays_only_final_response() {
        let (addr, hits) = spawn_backend(|n, _| {
            if n < 2 {
                status_response(StatusCode::SERVICE_UNAVAILABLE, "{\"partial\":")
            } else {
                status_response(StatusCode::OK, "{\"ok\":true}")
            }
        })
        .await;
        let metrics = MetricsCollector::new().expect("metrics");
        let route = route_for(addr, 2);
        let cb = breaker(&metrics);

        let response = forwarder(&metrics)
            .forward(&route, cb.acquire().expect("permit"), upstream(&route, "/api/items"))
            .await
            .expect("forwarded");
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(&response.body[..], b"{\"ok\":true}");
        assert_eq!(hits.load(Ordering::SeqCst), 3);

        let output = metrics.gather().expect("gather");
        assert!(output.contains("gateway_retries_total{route=\"/api\"} 2"));
        assert!(output.contains("gateway_backend_errors_total{route=\"/api\",status=\"503\"} 2"));
    }

    #[tokio::test]
    async fn test_exhausted_retries_record_one_breaker_failure() {
        let (addr, hits) = spawn_backend(|_, _| status_response(StatusCode::INTERNAL_SERVER_ERROR, "boom")).await;
        let metrics = MetricsCollector::new().expect("metrics");
        let route = route_for(addr, 1);
        let config = CircuitBreakerConfig {
            failure_threshold: 2,
            ..CircuitBreakerConfig::default()
        };
        let cb = CircuitBreaker::new("/api", &config, metrics.clone());
        let fwd = forwarder(&metrics);

        let err = fwd
            .forward(&route, cb.acquire().expect("permit"), upstream(&route, "/api/items"))
            .await
            .unwrap_err();
        assert!(matches!(err, ForwardError::Exhausted { attempts: 2, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(!cb.is_open());

        let _ = fwd
            .forward(&route, cb.acquire().expect("permit"), upstream(&route, "/api/items"))
            .await;
        assert!(cb.is_open());
    }

    #[tokio::test]
    async fn test_connect_error_labelled() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let metrics = MetricsCollector::new().expect("metrics");
        let route = route_for(addr, 0);
        let cb = breaker(&metrics);
        let err = forwarder(&metrics)
            .forward(&route, cb.acquire().expect("permit"), upstream(&route, "/api"))
            .await
            .unwrap_err();
        match err {
            ForwardError::Exhausted { last, .. } => assert_eq!(last.label(), "connect_error"),
            other => panic!("unexpected error {:?}", other),
        }
        let output = metrics.gather().expect("gather");
        assert!(output.contains("status=\"connect_error\""));
    }

    #[tokio::test]
    async fn test_attempt_timeout_then_retry_succeeds() {
        // the first connection is held without an answer, later ones are served
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let conns = Arc::new(AtomicUsize::new(0));
        let accepted = conns.clone();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                if accepted.fetch_add(1, Ordering::SeqCst) == 0 {
                    held.push(stream);
                    continue;
                }
                tokio::spawn(async move {
                    let service = service_fn(|_req: Request<Incoming>| async {
                        Ok::<_, Infallible>(status_response(StatusCode::OK, "recovered"))
                    });
                    let _ = http1::Builder::new().serve_connection(TokioIo::new(stream), service).await;
                });
            }
        });

        let mut config = RouteConfig::new("/api", &format!("http://{}", addr));
        config.retry_attempts = 1;
        config.timeout_ms = 200;
        let route = Route::from_config(&config).expect("route");
        let metrics = MetricsCollector::new().expect("metrics");
        let cb = breaker(&metrics);

        let response = forwarder(&metrics)
            .forward(&route, cb.acquire().expect("permit"), upstream(&route, "/api/slow"))
            .await
            .expect("second attempt answers");
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(&response.body[..], b"recovered");
        assert_eq!(conns.load(Ordering::SeqCst), 2);
        assert_eq!(cb.status(), crate::circuit_breaker::CircuitStatus::Closed);

        let output = metrics.gather().expect("gather");
        assert!(output.contains("gateway_retries_total{route=\"/api\"} 1"));
        assert!(output.contains("gateway_backend_errors_total{route=\"/api\",status=\"timeout\"} 1"));
    }

    #[tokio::test]
    async fn test_oversized_response_not_retried() {
        let (addr, hits) = spawn_backend(|_, _| {
            Response::new(Full::new(Bytes::from(vec![b'z'; 4096])))
        })
        .await;
        let metrics = MetricsCollector::new().expect("metrics");
        let route = route_for(addr, 2);
        let cb = breaker(&metrics);

        let err = forwarder(&metrics)
            .with_max_response_bytes(1024)
            .forward(&route, cb.acquire().expect("permit"), upstream(&route, "/api/export"))
            .await
            .unwrap_err();
        match err {
            ForwardError::Exhausted { attempts, last } => {
                assert_eq!(attempts, 1);
                assert_eq!(last.label(), "response_too_large");
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_body_resent_on_every_attempt() {
        let (addr, _) = spawn_backend(|n, req| {
            let declared = req
                .headers()
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("0")
                .to_string();
            if n == 0 {
                status_response(StatusCode::BAD_GATEWAY, "retry")
            } else {
                let mut response = Response::new(Full::new(Bytes::from(declared)));
                *response.status_mut() = StatusCode::OK;
                response
            }
        })
        .await;
        let metrics = MetricsCollector::new().expect("metrics");
        let route = route_for(addr, 1);
        let cb = breaker(&metrics);
        let upstream = UpstreamRequest {
            method: Method::POST,
            ..upstream(&route, "/api/ingest")
        };

        let response = forwarder(&metrics)
            .forward(&route, cb.acquire().expect("permit"), upstream)
            .await
            .expect("forwarded");
        assert_eq!(&response.body[..], b"7");
    }
}
