//! Read-only admin introspection API

use crate::circuit_breaker::BreakerRegistry;
use crate::error::{json_response, raw_json_response, GatewayError};
use crate::rate_limit::{LimiterEntry, RateLimiter};
use anyhow::{Context, Result};
use gateway_core::{Config, RouteTable};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Method, Response, StatusCode};
use ipnetwork::IpNetwork;
use parking_lot::RwLock;
use serde::Serialize;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::warn;

pub const ADMIN_PREFIX: &str = "/admin";

const DEFAULT_PAGE_SIZE: usize = 100;
const MAX_PAGE_SIZE: usize = 1000;

#[derive(Serialize)]
struct RouteStatus<'a> {
    path_prefix: &'a str,
    backend: &'a str,
    methods: &'a [String],
    auth_required: bool,
    timeout_ms: u64,
    retry_attempts: u32,
    circuit_breaker_state: &'static str,
}

#[derive(Serialize)]
struct RoutesBody<'a> {
    routes: Vec<RouteStatus<'a>>,
}

#[derive(Serialize)]
struct LimitersBody<'a> {
    entries: &'a [LimiterEntry],
    total: usize,
    page: usize,
    page_size: usize,
}

/// Requested page of `/admin/limiters`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Page {
    pub page: usize,
    pub page_size: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            page: 0,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl Page {
    /// Read `page` and `page_size`; anything unparseable keeps its default
    pub fn from_query(query: Option<&str>) -> Self {
        let mut page = Page::default();
        for pair in query.unwrap_or("").split('&') {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            match key {
                "page" => {
                    if let Ok(n) = value.trim().parse::<usize>() {
                        page.page = n;
                    }
                }
                "page_size" => match value.trim().parse::<usize>() {
                    Ok(n) if (1..=MAX_PAGE_SIZE).contains(&n) => page.page_size = n,
                    _ => {}
                },
                _ => {}
            }
        }
        page
    }

    fn slice<'a, T>(&self, items: &'a [T]) -> &'a [T] {
        let start = self.page.saturating_mul(self.page_size).min(items.len());
        let end = start.saturating_add(self.page_size).min(items.len());
        &items[start..end]
    }
}

pub struct AdminApi {
    routes: Arc<RouteTable>,
    breakers: Arc<BreakerRegistry>,
    limiter: Arc<RateLimiter>,
    allowlist: Vec<IpNetwork>,
    /// Redacted configuration, serialized at startup and on every reload
    config_body: RwLock<Bytes>,
}

fn redacted_body(config: &Config) -> Result<Bytes> {
    let body = serde_json::to_vec(&config.redacted()).context("Failed to serialize redacted config")?;
    Ok(Bytes::from(body))
}

impl AdminApi {
    pub fn new(
        config: &Config,
        routes: Arc<RouteTable>,
        breakers: Arc<BreakerRegistry>,
        limiter: Arc<RateLimiter>,
    ) -> Result<Self> {
        let allowlist = config.admin.allowed_networks()?;
        Ok(Self {
            routes,
            breakers,
            limiter,
            allowlist,
            config_body: RwLock::new(redacted_body(config)?),
        })
    }

    /// Serve `config` from `/admin/config` from now on
    pub fn update_config(&self, config: &Config) -> Result<()> {
        *self.config_body.write() = redacted_body(config)?;
        Ok(())
    }

    /// Path belongs to the admin surface
    pub fn is_admin_path(path: &str) -> bool {
        gateway_core::match_path(path, ADMIN_PREFIX)
    }

    pub fn is_allowed(&self, ip: IpAddr) -> bool {
        let ip = ip.to_canonical();
        self.allowlist.is_empty() || self.allowlist.iter().any(|net| net.contains(ip))
    }

    /// Answer an admin request. `peer` is the TCP peer, never a forwarded address.
    pub fn handle(
        &self,
        method: &Method,
        path: &str,
        query: Option<&str>,
        peer: IpAddr,
    ) -> Result<Response<Full<Bytes>>, GatewayError> {
        if method != Method::GET {
            return Err(GatewayError::MethodNotAllowed {
                method: method.clone(),
                allow: Method::GET.to_string(),
            });
        }
        if !self.is_allowed(peer) {
            warn!(client_ip = %peer, path, "admin access denied");
            return Err(GatewayError::Forbidden);
        }

        match path.trim_end_matches('/') {
            "/admin/routes" => Ok(self.routes_response()),
            "/admin/config" => Ok(raw_json_response(StatusCode::OK, self.config_body.read().clone())),
            "/admin/limiters" => Ok(self.limiters_response(Page::from_query(query))),
            _ => Err(GatewayError::RouteNotFound),
        }
    }

    fn routes_response(&self) -> Response<Full<Bytes>> {
        let routes = self
            .routes
            .routes()
            .iter()
            .map(|route| RouteStatus {
                path_prefix: &route.path_prefix,
                backend: &route.config.backend,
                methods: &route.config.methods,
                auth_required: route.auth_required,
                timeout_ms: route.config.timeout_ms,
                retry_attempts: route.retry_attempts,
                circuit_breaker_state: self.breakers.status(&route.path_prefix).as_str(),
            })
            .collect();
        json_response(StatusCode::OK, &RoutesBody { routes })
    }

    fn limiters_response(&self, page: Page) -> Response<Full<Bytes>> {
        let entries = self.limiter.snapshot();
        let body = LimitersBody {
            entries: page.slice(&entries),
            total: entries.len(),
            page: page.page,
            page_size: page.page_size,
        };
        json_response(StatusCode::OK, &body)
    }
}
