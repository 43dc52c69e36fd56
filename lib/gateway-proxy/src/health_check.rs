//! Liveness and cached readiness for backend endpoints

use crate::circuit_breaker::{BreakerRegistry, CircuitStatus};
use crate::error::{json_response, raw_json_response};
use futures::future::join_all;
use gateway_core::{Route, RouteTable};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time;
use tracing::{debug, warn};

/// Readiness check configuration
#[derive(Clone, Debug)]
pub struct HealthCheckConfig {
    /// Timeout for a single TCP dial
    pub timeout: Duration,
    /// How long an aggregated result is served from cache
    pub cache_ttl: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
            cache_ttl: Duration::from_secs(5),
        }
    }
}

#[derive(Serialize)]
struct Liveness {
    status: &'static str,
}

#[derive(Serialize)]
struct Readiness<'a> {
    status: &'static str,
    backends: BTreeMap<&'a str, &'static str>,
}

struct CachedReadiness {
    status: StatusCode,
    body: Bytes,
    at: Instant,
}

/// Answers `/health` and `/ready`
pub struct HealthChecker {
    config: HealthCheckConfig,
    routes: Arc<RouteTable>,
    breakers: Arc<BreakerRegistry>,
    cache: RwLock<Option<CachedReadiness>>,
    /// Held while backends are dialed so one caller refreshes the cache
    refresh: Mutex<()>,
}

impl HealthChecker {
    pub fn new(config: HealthCheckConfig, routes: Arc<RouteTable>, breakers: Arc<BreakerRegistry>) -> Self {
        Self {
            config,
            routes,
            breakers,
            cache: RwLock::new(None),
            refresh: Mutex::new(()),
        }
    }

    pub fn liveness(&self) -> Response<Full<Bytes>> {
        json_response(StatusCode::OK, &Liveness { status: "ok" })
    }

    fn cached(&self) -> Option<Response<Full<Bytes>>> {
        self.cache
            .read()
            .as_ref()
            .filter(|c| c.at.elapsed() < self.config.cache_ttl)
            .map(|c| raw_json_response(c.status, c.body.clone()))
    }

    pub async fn readiness(&self) -> Response<Full<Bytes>> {
        if let Some(response) = self.cached() {
            return response;
        }
        let _refresh = self.refresh.lock().await;
        if let Some(response) = self.cached() {
            return response;
        }

        let results = join_all(self.routes.routes().iter().map(|route| self.check_route(route))).await;

        let mut backends = BTreeMap::new();
        let mut ready = true;
        for (route, (status, ok)) in self.routes.routes().iter().zip(results) {
            backends.insert(route.path_prefix.as_str(), status);
            ready &= ok;
        }

        let (status, label) = if ready {
            (StatusCode::OK, "ready")
        } else {
            (StatusCode::SERVICE_UNAVAILABLE, "not ready")
        };
        let body = match serde_json::to_vec(&Readiness { status: label, backends }) {
            Ok(body) => Bytes::from(body),
            Err(e) => {
                warn!("Failed to serialize readiness: {}", e);
                return json_response(StatusCode::SERVICE_UNAVAILABLE, &Liveness { status: "not ready" });
            }
        };

        *self.cache.write() = Some(CachedReadiness {
            status,
            body: body.clone(),
            at: Instant::now(),
        });
        raw_json_response(status, body)
    }

    /// Status label and whether the route counts as available
    async fn check_route(&self, route: &Route) -> (&'static str, bool) {
        match self.breakers.status(&route.path_prefix) {
            CircuitStatus::Open => return ("circuit-open", false),
            CircuitStatus::HalfOpen => return ("circuit-half-open", true),
            CircuitStatus::Closed => {}
        }

        if self.check_endpoint(route).await {
            ("ok", true)
        } else {
            ("unreachable", false)
        }
    }

    /// Check if a backend accepts TCP connections
    pub async fn check_endpoint(&self, route: &Route) -> bool {
        let Some(host) = route.backend.host() else {
            return false;
        };
        let port = route
            .backend
            .port_u16()
            .unwrap_or(if route.backend.scheme_str() == Some("https") { 443 } else { 80 });
        let host = host.trim_start_matches('[').trim_end_matches(']');

        match time::timeout(self.config.timeout, tokio::net::TcpStream::connect((host, port))).await {
            Ok(Ok(_)) => {
                debug!("TCP connection to {}:{} succeeded", host, port);
                true
            }
            Ok(Err(e)) => {
                warn!(route = %route.path_prefix, backend = %route.backend, "backend unreachable: {}", e);
                false
            }
            Err(_) => {
                warn!(route = %route.path_prefix, backend = %route.backend, "backend health check timeout");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsCollector;
    use gateway_core::{CircuitBreakerConfig, RouteConfig};
    use http_body_util::BodyExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    async fn body_json(response: Response<Full<Bytes>>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.expect("body").to_bytes();
        serde_json::from_slice(&bytes).expect("json")
    }

    fn checker(backends: &[(&str, String)], threshold: u32) -> (HealthChecker, Arc<BreakerRegistry>) {
        let configs: Vec<_> = backends.iter().map(|(p, b)| RouteConfig::new(p, b)).collect();
        let routes = Arc::new(RouteTable::from_config(&configs).expect("routes"));
        let metrics = MetricsCollector::new().expect("metrics");
        let cb_config = CircuitBreakerConfig {
            failure_threshold: threshold,
            ..CircuitBreakerConfig::default()
        };
        let breakers = Arc::new(BreakerRegistry::new(&routes, &cb_config, &metrics));
        let config = HealthCheckConfig {
            timeout: Duration::from_millis(500),
            cache_ttl: Duration::from_secs(5),
        };
        (HealthChecker::new(config, routes, breakers.clone()), breakers)
    }

    async fn closed_port() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_liveness() {
        let (checker, _) = checker(&[("/a", "http://127.0.0.1:1".to_string())], 5);
        let response = checker.liveness();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, serde_json::json!({"status": "ok"}));
    }

    #[tokio::test]
    async fn test_ready_when_backends_accept() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (checker, _) = checker(&[("/a", format!("http://{}", addr))], 5);

        let response = checker.readiness().await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ready");
        assert_eq!(body["backends"]["/a"], "ok");
    }

    #[tokio::test]
    async fn test_not_ready_and_cached() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let up = format!("http://{}", listener.local_addr().expect("addr"));
        let down = closed_port().await;
        let (checker, _) = checker(&[("/up", up), ("/down", down)], 5);

        let response = checker.readiness().await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(response).await;
        assert_eq!(body["status"], "not ready");
        assert_eq!(body["backends"]["/down"], "unreachable");
        assert_eq!(body["backends"]["/up"], "ok");

        // served from cache even after the listener goes away
        drop(listener);
        let response = checker.readiness().await;
        assert_eq!(body_json(response).await["backends"]["/up"], "ok");
    }

    #[tokio::test]
    async fn test_concurrent_refresh_dials_once() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let dials = Arc::new(AtomicUsize::new(0));
        let counter = dials.clone();
        tokio::spawn(async move {
            while listener.accept().await.is_ok() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        let (checker, _) = checker(&[("/a", format!("http://{}", addr))], 5);

        let responses = join_all((0..8).map(|_| checker.readiness())).await;
        assert!(responses.iter().all(|r| r.status() == StatusCode::OK));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_open_circuit_reported_without_dial() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let (checker, breakers) = checker(&[("/a", format!("http://{}", listener.local_addr().expect("addr")))], 1);
        breakers.get("/a").expect("breaker").acquire().expect("permit").record_failure();

        let response = checker.readiness().await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_json(response).await["backends"]["/a"], "circuit-open");
    }
}
