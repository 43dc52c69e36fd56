//! Prometheus metrics for the gateway pipeline

use crate::middleware::{Middleware, RequestContext, RequestKind};
use anyhow::Result;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::Response;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;
use tracing::debug;

/// Fixed latency buckets, in seconds
pub const DURATION_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Metric families recorded by the gateway, backed by an owned registry
#[derive(Clone)]
pub struct MetricsCollector {
    /// Requests by route label, method and status
    pub requests_total: IntCounterVec,
    /// End-to-end pipeline latency by route label
    pub request_duration_seconds: HistogramVec,
    /// Pipeline requests currently in flight
    pub active_connections: IntGauge,
    pub rate_limit_hits_total: IntCounterVec,
    pub auth_failures_total: IntCounterVec,
    pub backend_errors_total: IntCounterVec,
    pub retries_total: IntCounterVec,
    pub circuit_breaker_state_changes_total: IntCounterVec,
    /// 0 closed, 1 open, 2 half-open
    pub circuit_breaker_state: IntGaugeVec,
    pub slow_calls_total: IntCounterVec,
    pub bulkhead_rejections_total: IntCounterVec,
    pub bulkhead_in_flight: IntGaugeVec,
    registry: Arc<Registry>,
}

impl MetricsCollector {
    /// Create a collector with a fresh registry
    pub fn new() -> Result<Self> {
        Self::with_registry(Registry::new())
    }

    /// Create a collector, registering every family in `registry`
    pub fn with_registry(registry: Registry) -> Result<Self> {
        let requests_total = IntCounterVec::new(
            Opts::new("gateway_requests_total", "Total requests handled by the gateway"),
            &["route", "method", "status"],
        )?;

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new("gateway_request_duration_seconds", "Request latency in seconds")
                .buckets(DURATION_BUCKETS.to_vec()),
            &["route"],
        )?;

        let active_connections = IntGauge::new(
            "gateway_active_connections",
            "Requests currently being processed",
        )?;

        let rate_limit_hits_total = IntCounterVec::new(
            Opts::new("gateway_rate_limit_hits_total", "Requests rejected by the rate limiter"),
            &["route"],
        )?;

        let auth_failures_total = IntCounterVec::new(
            Opts::new("gateway_auth_failures_total", "Authentication and authorization failures"),
            &["reason"],
        )?;

        let backend_errors_total = IntCounterVec::new(
            Opts::new("gateway_backend_errors_total", "Failed backend attempts"),
            &["route", "status"],
        )?;

        let retries_total = IntCounterVec::new(
            Opts::new("gateway_retries_total", "Backend retry attempts"),
            &["route"],
        )?;

        let circuit_breaker_state_changes_total = IntCounterVec::new(
            Opts::new(
                "gateway_circuit_breaker_state_changes_total",
                "Circuit breaker state transitions",
            ),
            &["route", "from", "to"],
        )?;

        let circuit_breaker_state = IntGaugeVec::new(
            Opts::new(
                "gateway_circuit_breaker_state",
                "Circuit breaker state (0 closed, 1 open, 2 half-open)",
            ),
            &["route"],
        )?;

        let slow_calls_total = IntCounterVec::new(
            Opts::new(
                "gateway_slow_calls_total",
                "Successful backend calls counted as breaker failures for exceeding the slow threshold",
            ),
            &["route"],
        )?;

        let bulkhead_rejections_total = IntCounterVec::new(
            Opts::new(
                "gateway_bulkhead_rejections_total",
                "Requests rejected by the per-route concurrency limit",
            ),
            &["route"],
        )?;

        let bulkhead_in_flight = IntGaugeVec::new(
            Opts::new("gateway_bulkhead_in_flight", "Requests holding a bulkhead slot"),
            &["route"],
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(request_duration_seconds.clone()))?;
        registry.register(Box::new(active_connections.clone()))?;
        registry.register(Box::new(rate_limit_hits_total.clone()))?;
        registry.register(Box::new(auth_failures_total.clone()))?;
        registry.register(Box::new(backend_errors_total.clone()))?;
        registry.register(Box::new(retries_total.clone()))?;
        registry.register(Box::new(circuit_breaker_state_changes_total.clone()))?;
        registry.register(Box::new(circuit_breaker_state.clone()))?;
        registry.register(Box::new(slow_calls_total.clone()))?;
        registry.register(Box::new(bulkhead_rejections_total.clone()))?;
        registry.register(Box::new(bulkhead_in_flight.clone()))?;

        Ok(Self {
            requests_total,
            request_duration_seconds,
            active_connections,
            rate_limit_hits_total,
            auth_failures_total,
            backend_errors_total,
            retries_total,
            circuit_breaker_state_changes_total,
            circuit_breaker_state,
            slow_calls_total,
            bulkhead_rejections_total,
            bulkhead_in_flight,
            registry: Arc::new(registry),
        })
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    /// Content type of [`gather`](Self::gather) output
    pub fn content_type(&self) -> String {
        TextEncoder::new().format_type().to_string()
    }

    /// Count a request as in flight until the guard drops
    pub fn track_in_flight(&self) -> InFlightGuard {
        self.active_connections.inc();
        InFlightGuard {
            gauge: self.active_connections.clone(),
        }
    }
}

/// Decrements `gateway_active_connections` on drop
pub struct InFlightGuard {
    gauge: IntGauge,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}

/// Records request count and latency once the response is final
pub struct MetricsMiddleware {
    pub collector: MetricsCollector,
}

impl MetricsMiddleware {
    pub fn new(collector: MetricsCollector) -> Self {
        Self { collector }
    }
}

#[async_trait::async_trait]
impl Middleware for MetricsMiddleware {
    fn name(&self) -> &'static str {
        "MetricsMiddleware"
    }

    async fn on_response(&self, context: &RequestContext, response: &mut Response<Full<Bytes>>) -> Result<()> {
        if context.kind != RequestKind::Pipeline {
            return Ok(());
        }

        let status = response.status();
        debug!("Recording metrics for {} {} -> {}", context.method, context.path, status);

        self.collector
            .requests_total
            .with_label_values(&[context.route_label.as_str(), context.method.as_str(), status.as_str()])
            .inc();
        self.collector
            .request_duration_seconds
            .with_label_values(&[context.route_label.as_str()])
            .observe(context.started.elapsed().as_secs_f64());

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::tests::context;
    use hyper::StatusCode;

    #[test]
    fn test_metrics_collector_creation() {
        let collector = MetricsCollector::new().expect("Failed to create collector");
        assert!(collector.gather().is_ok());
        assert!(collector.content_type().starts_with("text/plain"));
    }

    #[test]
    fn test_metrics_collector_clone_shares_registry() {
        let collector1 = MetricsCollector::new().expect("Failed to create collector");
        let collector2 = collector1.clone();
        collector2.retries_total.with_label_values(&["/api"]).inc();

        let metrics = collector1.gather().expect("Failed to gather metrics");
        assert!(metrics.contains("gateway_retries_total{route=\"/api\"} 1"));
    }

    #[test]
    fn test_in_flight_guard() {
        let collector = MetricsCollector::new().expect("Failed to create collector");
        {
            let _a = collector.track_in_flight();
            let _b = collector.track_in_flight();
            assert_eq!(collector.active_connections.get(), 2);
        }
        assert_eq!(collector.active_connections.get(), 0);
    }

    #[test]
    fn test_fixed_buckets_exported() {
        let collector = MetricsCollector::new().expect("Failed to create collector");
        collector
            .request_duration_seconds
            .with_label_values(&["/api"])
            .observe(0.02);
        let metrics = collector.gather().expect("Failed to gather metrics");
        assert!(metrics.contains("le=\"0.005\""));
        assert!(metrics.contains("le=\"10\""));
    }

    #[tokio::test]
    async fn test_metrics_middleware_records_pipeline_requests() {
        let collector = MetricsCollector::new().expect("Failed to create collector");
        let middleware = MetricsMiddleware::new(collector.clone());

        let mut ctx = context("/api/users/1");
        ctx.route_label = "/api/users".to_string();
        let mut response = Response::new(Full::new(Bytes::new()));
        *response.status_mut() = StatusCode::CREATED;
        middleware.on_response(&ctx, &mut response).await.expect("hook");

        let metrics = collector.gather().expect("Failed to gather metrics");
        assert!(metrics.contains(
            "gateway_requests_total{method=\"GET\",route=\"/api/users\",status=\"201\"} 1"
        ));
        assert!(metrics.contains("gateway_request_duration_seconds_count{route=\"/api/users\"} 1"));
    }

    #[tokio::test]
    async fn test_metrics_middleware_skips_internal_endpoints() {
        let collector = MetricsCollector::new().expect("Failed to create collector");
        let middleware = MetricsMiddleware::new(collector.clone());

        let mut ctx = context("/metrics");
        ctx.kind = RequestKind::Internal;
        let mut response = Response::new(Full::new(Bytes::new()));
        middleware.on_response(&ctx, &mut response).await.expect("hook");

        let metrics = collector.gather().expect("Failed to gather metrics");
        assert!(!metrics.contains("gateway_requests_total{"));
    }
}
