//! Route table for matching request paths to configured backends

use crate::config::{LogLevel, RateOverride, RouteConfig};
use crate::{CoreError, Result};
use hyper::header::{HeaderName, HeaderValue};
use hyper::{Method, Uri};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Metrics label used when no route matched
pub const UNMATCHED_LABEL: &str = "unmatched";

/// A resolved route, built once from its configuration
#[derive(Debug)]
pub struct Route {
    pub path_prefix: String,
    pub backend: Uri,
    /// Allowed methods; empty allows all
    pub methods: Vec<Method>,
    pub auth_required: bool,
    pub required_scopes: Vec<String>,
    pub strip_prefix: bool,
    pub retry_attempts: u32,
    pub timeout: Duration,
    pub log_level: LogLevel,
    pub headers: Vec<(HeaderName, HeaderValue)>,
    pub rate_override: Option<RateOverride>,
    /// Source configuration, kept for introspection
    pub config: RouteConfig,
}

impl Route {
    pub fn from_config(config: &RouteConfig) -> Result<Self> {
        let backend: Uri = config.backend.parse().map_err(|e| {
            CoreError::InvalidConfiguration(format!("invalid backend {:?}: {}", config.backend, e))
        })?;

        let methods = config
            .methods
            .iter()
            .map(|m| {
                Method::from_bytes(m.to_ascii_uppercase().as_bytes())
                    .map_err(|_| CoreError::InvalidConfiguration(format!("invalid method {:?}", m)))
            })
            .collect::<Result<Vec<_>>>()?;

        let headers = config
            .headers
            .iter()
            .map(|(name, value)| {
                let name = HeaderName::from_bytes(name.as_bytes())
                    .map_err(|_| CoreError::InvalidConfiguration(format!("invalid header name {:?}", name)))?;
                let value = HeaderValue::from_str(value)
                    .map_err(|_| CoreError::InvalidConfiguration(format!("invalid header value for {}", name)))?;
                Ok((name, value))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            path_prefix: config.path_prefix.clone(),
            backend,
            methods,
            auth_required: config.auth_required,
            required_scopes: config.required_scopes.clone(),
            strip_prefix: config.strip_prefix,
            retry_attempts: config.retry_attempts,
            timeout: config.timeout(),
            log_level: config.log_level,
            headers,
            rate_override: config.rate_override,
            config: config.clone(),
        })
    }

    /// Match HTTP method against allowed methods
    pub fn allows(&self, method: &Method) -> bool {
        self.methods.is_empty() || self.methods.contains(method)
    }

    /// Comma-separated list for the `Allow` header
    pub fn allow_header(&self) -> String {
        self.methods
            .iter()
            .map(Method::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Path sent to the backend, with the prefix removed when configured
    pub fn upstream_path<'a>(&self, path: &'a str) -> &'a str {
        if !self.strip_prefix {
            return path;
        }
        match path.strip_prefix(self.path_prefix.as_str()) {
            Some("") | None => "/",
            Some(rest) if rest.starts_with('/') => rest,
            // prefix configured with a trailing slash
            Some(_) => &path[self.path_prefix.len() - 1..],
        }
    }
}

/// Outcome of a single routing pass
#[derive(Debug, Clone)]
pub enum RouteMatch {
    Matched(Arc<Route>),
    MethodNotAllowed(Arc<Route>),
    NotFound,
}

impl RouteMatch {
    /// The route whose prefix matched, regardless of method
    pub fn route(&self) -> Option<&Arc<Route>> {
        match self {
            RouteMatch::Matched(route) | RouteMatch::MethodNotAllowed(route) => Some(route),
            RouteMatch::NotFound => None,
        }
    }

    /// Metrics label for this request
    pub fn label(&self) -> &str {
        self.route().map_or(UNMATCHED_LABEL, |r| r.path_prefix.as_str())
    }
}

/// Immutable set of routes, looked up by longest boundary-aware prefix
#[derive(Debug)]
pub struct RouteTable {
    /// Configuration order
    routes: Vec<Arc<Route>>,
    /// Longest prefix first
    lookup: Vec<Arc<Route>>,
}

impl RouteTable {
    pub fn from_config(configs: &[RouteConfig]) -> Result<Self> {
        let routes = configs
            .iter()
            .map(|c| Route::from_config(c).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;

        let mut lookup = routes.clone();
        lookup.sort_by(|a, b| b.path_prefix.len().cmp(&a.path_prefix.len()));

        debug!("Route table built with {} routes", routes.len());
        Ok(Self { routes, lookup })
    }

    /// Resolve a request in one pass
    pub fn match_request(&self, path: &str, method: &Method) -> RouteMatch {
        match self.lookup.iter().find(|r| match_path(path, &r.path_prefix)) {
            Some(route) if route.allows(method) => RouteMatch::Matched(route.clone()),
            Some(route) => RouteMatch::MethodNotAllowed(route.clone()),
            None => RouteMatch::NotFound,
        }
    }

    pub fn routes(&self) -> &[Arc<Route>] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Match a request path against a route prefix on segment boundaries
pub fn match_path(path: &str, prefix: &str) -> bool {
    if prefix.is_empty() || !path.starts_with(prefix) {
        return false;
    }
    if path.len() == prefix.len() || prefix.ends_with('/') {
        return true;
    }
    path.as_bytes()[prefix.len()] == b'/'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(prefixes: &[(&str, &[&str])]) -> RouteTable {
        let configs: Vec<RouteConfig> = prefixes
            .iter()
            .map(|(prefix, methods)| {
                let mut c = RouteConfig::new(prefix, "http://127.0.0.1:9000");
                c.methods = methods.iter().map(|m| m.to_string()).collect();
                c
            })
            .collect();
        RouteTable::from_config(&configs).expect("valid routes")
    }

    #[test]
    fn test_exact_path_match() {
        assert!(match_path("/api", "/api"));
        assert!(match_path("/api/", "/api"));
        assert!(match_path("/api/users/1", "/api"));
    }

    #[test]
    fn test_boundary_rejects_textual_prefix() {
        assert!(!match_path("/apiary", "/api"));
        assert!(!match_path("/api.evil.com", "/api"));
        assert!(!match_path("/api.evil.com/x", "/api"));
        assert!(!match_path("/ap", "/api"));
        assert!(!match_path("/anything", ""));
    }

    #[test]
    fn test_trailing_slash_prefix() {
        assert!(match_path("/static/app.js", "/static/"));
        assert!(match_path("/static/", "/static/"));
        assert!(!match_path("/static", "/static/"));
    }

    #[test]
    fn test_longest_prefix_wins() {
        let table = table(&[("/api", &[]), ("/api/users", &[])]);
        let m = table.match_request("/api/users/123", &Method::GET);
        assert_eq!(m.label(), "/api/users");
        let m = table.match_request("/api/orders", &Method::GET);
        assert_eq!(m.label(), "/api");
        let m = table.match_request("/api/usersettings", &Method::GET);
        assert_eq!(m.label(), "/api");
    }

    #[test]
    fn test_not_found_label() {
        let table = table(&[("/api", &[])]);
        let m = table.match_request("/apiary", &Method::GET);
        assert!(matches!(m, RouteMatch::NotFound));
        assert_eq!(m.label(), UNMATCHED_LABEL);
    }

    #[test]
    fn test_method_match() {
        let table = table(&[("/public", &["GET", "head"])]);
        assert!(matches!(
            table.match_request("/public/test", &Method::GET),
            RouteMatch::Matched(_)
        ));
        assert!(matches!(
            table.match_request("/public/test", &Method::HEAD),
            RouteMatch::Matched(_)
        ));
        let m = table.match_request("/public/test", &Method::DELETE);
        match m {
            RouteMatch::MethodNotAllowed(route) => assert_eq!(route.allow_header(), "GET, HEAD"),
            other => panic!("expected 405 match, got {:?}", other),
        }
    }

    #[test]
    fn test_method_match_empty() {
        let table = table(&[("/any", &[])]);
        for method in [Method::GET, Method::POST, Method::DELETE, Method::PATCH] {
            assert!(matches!(table.match_request("/any", &method), RouteMatch::Matched(_)));
        }
    }

    #[test]
    fn test_upstream_path_strip() {
        let mut config = RouteConfig::new("/api", "http://127.0.0.1:9000");
        config.strip_prefix = true;
        let route = Route::from_config(&config).expect("route");
        assert_eq!(route.upstream_path("/api/users/1"), "/users/1");
        assert_eq!(route.upstream_path("/api"), "/");

        let mut slashed = RouteConfig::new("/static/", "http://127.0.0.1:9000");
        slashed.strip_prefix = true;
        let route = Route::from_config(&slashed).expect("route");
        assert_eq!(route.upstream_path("/static/app.js"), "/app.js");

        config.strip_prefix = false;
        let route = Route::from_config(&config).expect("route");
        assert_eq!(route.upstream_path("/api/users/1"), "/api/users/1");
    }

    #[test]
    fn test_routes_keep_config_order() {
        let table = table(&[("/a", &[]), ("/a/b/c", &[]), ("/a/b", &[])]);
        let prefixes: Vec<_> = table.routes().iter().map(|r| r.path_prefix.as_str()).collect();
        assert_eq!(prefixes, vec!["/a", "/a/b/c", "/a/b"]);
        assert_eq!(table.len(), 3);
    }
}
