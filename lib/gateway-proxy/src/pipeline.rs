//! The request pipeline: gateway endpoints, then route, limit, auth, breaker, forward

use crate::admin::AdminApi;
use crate::auth::Authenticator;
use crate::bulkhead::BulkheadRegistry;
use crate::circuit_breaker::BreakerRegistry;
use crate::client_ip::ClientIpResolver;
use crate::error::{empty_response, GatewayError};
use crate::forwarder::{RequestForwarder, UpstreamRequest};
use crate::health_check::{HealthCheckConfig, HealthChecker};
use crate::metrics::{MetricsCollector, MetricsMiddleware};
use crate::middleware::{
    AccessLogMiddleware, BodyLogger, ConnectionInfo, CorsMiddleware, MiddlewareChain, RequestContext,
    RequestIdMiddleware, RequestKind, SecurityHeadersMiddleware,
};
use crate::policy::RetryPolicy;
use crate::rate_limit::{Decision, RateLimiter};
use anyhow::Result;
use arc_swap::ArcSwap;
use futures::FutureExt;
use gateway_core::{Config, RouteMatch, RouteTable};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Bytes};
use hyper::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Endpoints the gateway answers itself, outside the limiter
enum Endpoint<'a> {
    Health,
    Ready,
    Metrics,
    Admin(&'a AdminApi),
}

/// All request-handling services, built once from the configuration
pub struct Gateway {
    /// Current configuration, replaced by [`Gateway::reload`]
    config: ArcSwap<Config>,
    routes: Arc<RouteTable>,
    resolver: ClientIpResolver,
    limiter: Arc<RateLimiter>,
    auth: Authenticator,
    breakers: Arc<BreakerRegistry>,
    bulkheads: BulkheadRegistry,
    forwarder: RequestForwarder,
    metrics: MetricsCollector,
    health: HealthChecker,
    admin: Option<AdminApi>,
    chain: MiddlewareChain,
}

impl Gateway {
    pub fn new(config: Config) -> Result<Self> {
        Self::with_metrics(config, MetricsCollector::new()?)
    }

    /// Build the gateway around an existing metrics collector
    pub fn with_metrics(config: Config, metrics: MetricsCollector) -> Result<Self> {
        let routes = Arc::new(RouteTable::from_config(&config.routes)?);
        let resolver = ClientIpResolver::new(config.server.trusted_networks()?);
        let limiter = Arc::new(RateLimiter::new(&config.rate_limit));
        let auth = Authenticator::new(&config.auth);
        let breakers = Arc::new(BreakerRegistry::new(&routes, &config.circuit_breaker, &metrics));
        let bulkheads = BulkheadRegistry::new(&routes, config.circuit_breaker.max_concurrent, &metrics);
        let forwarder = RequestForwarder::new(CONNECT_TIMEOUT, RetryPolicy::default(), metrics.clone())
            .with_max_response_bytes(usize::try_from(config.server.max_response_bytes).unwrap_or(usize::MAX));
        let health = HealthChecker::new(HealthCheckConfig::default(), routes.clone(), breakers.clone());

        let admin = if config.admin.enabled {
            Some(AdminApi::new(&config, routes.clone(), breakers.clone(), limiter.clone())?)
        } else {
            None
        };

        let chain = MiddlewareChain::new()
            .add(RequestIdMiddleware)
            .add(SecurityHeadersMiddleware)
            .add(CorsMiddleware::new(&config.cors)?)
            .add(MetricsMiddleware::new(metrics.clone()))
            .add(AccessLogMiddleware);

        info!(
            "Gateway initialized with {} routes, auth {}, admin {}",
            routes.len(),
            if auth.is_enabled() { "enabled" } else { "disabled" },
            if admin.is_some() { "enabled" } else { "disabled" }
        );

        Ok(Self {
            config: ArcSwap::from_pointee(config),
            routes,
            resolver,
            limiter,
            auth,
            breakers,
            bulkheads,
            forwarder,
            metrics,
            health,
            admin,
            chain,
        })
    }

    pub fn config(&self) -> Arc<Config> {
        self.config.load_full()
    }

    /// Apply a freshly loaded configuration to the running gateway.
    ///
    /// Limiter and breaker thresholds, body limits, the global deadline, body logging and
    /// the admin config view change in place. Routes, auth, CORS, bulkhead sizes and the
    /// listener keep their startup values until restart.
    pub fn reload(&self, config: Config) -> Result<()> {
        let current = self.config.load_full();
        let prefixes = |c: &Config| c.routes.iter().map(|r| r.path_prefix.clone()).collect::<Vec<_>>();
        if prefixes(&current) != prefixes(&config) {
            warn!(
                old = current.routes.len(),
                new = config.routes.len(),
                "Route changes need a restart; keeping the current route table"
            );
        }
        if current.auth.enabled != config.auth.enabled {
            warn!(
                old = current.auth.enabled,
                new = config.auth.enabled,
                "auth.enabled changes need a restart"
            );
        }

        if let Some(admin) = &self.admin {
            admin.update_config(&config)?;
        }
        self.limiter.update_config(&config.rate_limit);
        self.breakers.update_config(&config.circuit_breaker);
        self.config.store(Arc::new(config));
        info!("Configuration reloaded");
        Ok(())
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Handle one request end to end. Never fails: every error becomes a taxonomy response.
    pub async fn handle<B>(&self, req: Request<B>, conn: ConnectionInfo) -> Response<Full<Bytes>>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let peer = conn.peer.ip();
        let client_ip = self.resolver.resolve(peer, req.headers());
        let mut ctx = RequestContext::from_request(&req, &conn, client_ip);
        if !ctx.is_tls && self.resolver.forwarded_https(peer, req.headers()) {
            ctx.is_tls = true;
        }

        if let Err(e) = self.chain.on_request(&ctx).await {
            warn!(request_id = %ctx.request_id, "Middleware rejected request: {:#}", e);
        }

        let mut response = match self.endpoint(&ctx.path) {
            Some(endpoint) => {
                ctx.kind = RequestKind::Internal;
                match endpoint {
                    Endpoint::Health => self.health.liveness(),
                    Endpoint::Ready => self.health.readiness().await,
                    Endpoint::Metrics => self.metrics_response(),
                    Endpoint::Admin(admin) => admin
                        .handle(&ctx.method, &ctx.path, req.uri().query(), peer)
                        .unwrap_or_else(|e| e.to_response(ctx.echoed_id())),
                }
            }
            None => self.run_pipeline(req, &mut ctx).await,
        };

        if let Err(e) = self.chain.on_response(&ctx, &mut response).await {
            warn!(request_id = %ctx.request_id, "Response middleware failed: {:#}", e);
        }
        response
    }

    fn endpoint(&self, path: &str) -> Option<Endpoint<'_>> {
        match path {
            "/health" => return Some(Endpoint::Health),
            "/ready" => return Some(Endpoint::Ready),
            _ => {}
        }
        let config = self.config.load();
        if config.metrics.enabled && path == config.metrics.path {
            return Some(Endpoint::Metrics);
        }
        match &self.admin {
            Some(admin) if AdminApi::is_admin_path(path) => Some(Endpoint::Admin(admin)),
            _ => None,
        }
    }

    /// Run the proxy pipeline under the global deadline, turning panics into 500s
    async fn run_pipeline<B>(&self, req: Request<B>, ctx: &mut RequestContext) -> Response<Full<Bytes>>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let _in_flight = self.metrics.track_in_flight();
        let outcome = AssertUnwindSafe(self.pipeline(req, ctx)).catch_unwind();

        let deadline = self.config.load().server.global_timeout();
        let result = match deadline {
            Some(deadline) => match tokio::time::timeout(deadline, outcome).await {
                Ok(result) => result,
                Err(_) => Ok(Err(GatewayError::DeadlineExceeded)),
            },
            None => outcome.await,
        };

        match result {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                debug!(request_id = %ctx.request_id, route = %ctx.route_label, "Request rejected: {}", e);
                e.to_response(ctx.echoed_id())
            }
            Err(_) => {
                error!(request_id = %ctx.request_id, path = %ctx.path, "Request handler panicked");
                GatewayError::Internal.to_response(ctx.echoed_id())
            }
        }
    }

    async fn pipeline<B>(&self, req: Request<B>, ctx: &mut RequestContext) -> Result<Response<Full<Bytes>>, GatewayError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let matched = self.routes.match_request(&ctx.path, &ctx.method);
        ctx.route_label = matched.label().to_string();
        ctx.route = matched.route().cloned();

        if ctx.method == Method::OPTIONS {
            return Ok(empty_response(StatusCode::NO_CONTENT));
        }

        if let Decision::Deny { retry_after_secs } = self.limiter.check(ctx.client_ip, ctx.route.as_deref()) {
            self.metrics
                .rate_limit_hits_total
                .with_label_values(&[ctx.route_label.as_str()])
                .inc();
            debug!(client_ip = %ctx.client_ip, route = %ctx.route_label, "Rate limit exceeded");
            return Err(GatewayError::RateLimited { retry_after_secs });
        }

        let route = match matched {
            RouteMatch::Matched(route) => route,
            RouteMatch::MethodNotAllowed(route) => {
                return Err(GatewayError::MethodNotAllowed {
                    method: ctx.method.clone(),
                    allow: route.allow_header(),
                })
            }
            RouteMatch::NotFound => return Err(GatewayError::RouteNotFound),
        };

        ctx.claims = self
            .auth
            .authenticate(&route, req.headers().get(AUTHORIZATION))
            .map_err(|e| {
                self.metrics.auth_failures_total.with_label_values(&[e.reason()]).inc();
                debug!(route = %route.path_prefix, reason = e.reason(), "Authentication failed: {}", e);
                e
            })?;

        let (max_body, body_logger) = {
            let config = self.config.load();
            (config.server.max_body_bytes, BodyLogger::from_config(&config.logging))
        };
        if declared_length(req.headers()).is_some_and(|len| len > max_body) {
            return Err(GatewayError::BodyTooLarge);
        }

        let _slot = self
            .bulkheads
            .try_acquire(&route.path_prefix)
            .map_err(|_| GatewayError::BackendOverloaded)?;
        let breaker = self.breakers.get(&route.path_prefix).ok_or(GatewayError::Internal)?;
        let permit = breaker.acquire().map_err(|_| GatewayError::CircuitOpen)?;

        let (parts, body) = req.into_parts();
        let limit = usize::try_from(max_body).unwrap_or(usize::MAX);
        let body = Limited::new(body, limit)
            .collect()
            .await
            .map_err(|e| {
                if e.downcast_ref::<LengthLimitError>().is_some() {
                    GatewayError::BodyTooLarge
                } else {
                    debug!("Failed to read request body: {}", e);
                    GatewayError::BodyRead
                }
            })?
            .to_bytes();

        if let Some(logger) = &body_logger {
            ctx.request_body = logger.capture(&parts.headers, &body);
        }

        let head = Request::from_parts(parts, ());
        let upstream = UpstreamRequest::build(&route, &head, body, ctx).map_err(|e| {
            warn!(route = %route.path_prefix, "Cannot forward request: {}", e);
            GatewayError::UpstreamUnavailable
        })?;

        match self.forwarder.forward(&route, permit, upstream).await {
            Ok(response) => {
                if let Some(logger) = &body_logger {
                    ctx.response_body = logger.capture(&response.headers, &response.body);
                }
                Ok(response.into_response(ctx.started))
            }
            Err(e) => {
                warn!(
                    route = %route.path_prefix,
                    request_id = %ctx.request_id,
                    "Forwarding failed: {}", e
                );
                Err(GatewayError::UpstreamUnavailable)
            }
        }
    }

    fn metrics_response(&self) -> Response<Full<Bytes>> {
        let text = match self.metrics.gather() {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to gather metrics: {:#}", e);
                return GatewayError::Internal.to_response(None);
            }
        };
        let mut response = Response::new(Full::new(Bytes::from(text)));
        if let Ok(content_type) = HeaderValue::from_str(&self.metrics.content_type()) {
            response.headers_mut().insert(CONTENT_TYPE, content_type);
        }
        response
    }
}

fn declared_length(headers: &HeaderMap) -> Option<u64> {
    headers.get(CONTENT_LENGTH)?.to_str().ok()?.trim().parse().ok()
}
