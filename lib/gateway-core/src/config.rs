//! Gateway configuration: YAML model, `${VAR}` expansion, defaults and validation

use crate::{CoreError, Result};
use hyper::header::{HeaderName, HeaderValue};
use hyper::{Method, Uri};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Replacement for secrets in redacted output
pub const REDACTED: &str = "***";

/// Top-level gateway configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub metrics: MetricsConfig,
    pub logging: LoggingConfig,
    pub rate_limit: RateLimitConfig,
    pub auth: AuthConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub cors: CorsConfig,
    pub admin: AdminConfig,
    pub routes: Vec<RouteConfig>,

    /// Non-fatal issues detected while loading
    #[serde(skip)]
    pub warnings: Vec<String>,
}

/// HTTP listener settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    /// Request body ceiling in bytes
    pub max_body_bytes: u64,
    /// Ceiling for a buffered backend response
    pub max_response_bytes: u64,
    /// Deadline for the whole pipeline; 0 disables it
    pub global_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
    /// CIDRs whose `X-Forwarded-For` header is trusted
    pub trusted_proxies: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            max_body_bytes: 1024 * 1024,
            max_response_bytes: 10 * 1024 * 1024,
            global_timeout_ms: 0,
            shutdown_timeout_ms: 10_000,
            trusted_proxies: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn global_timeout(&self) -> Option<Duration> {
        (self.global_timeout_ms > 0).then(|| Duration::from_millis(self.global_timeout_ms))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Parse the trusted proxy list. Validated at load time.
    pub fn trusted_networks(&self) -> Result<Vec<IpNetwork>> {
        parse_networks("server.trusted_proxies", &self.trusted_proxies)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "/metrics".to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Stdout,
    Stderr,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    pub level: String,
    pub format: LogFormat,
    pub output: LogOutput,
    /// Log textual request and proxied response bodies, redacted
    pub body_logging: bool,
    pub max_body_log_bytes: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
            output: LogOutput::Stdout,
            body_logging: false,
            max_body_log_bytes: 4096,
        }
    }
}

/// Global token-bucket settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub requests_per_second: f64,
    pub burst_size: u32,
    /// Idle buckets older than this are swept
    pub idle_ttl_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 100.0,
            burst_size: 50,
            idle_ttl_secs: 180,
        }
    }
}

/// Per-route replacement for the global bucket settings
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RateOverride {
    pub requests_per_second: f64,
    pub burst_size: u32,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub enabled: bool,
    pub jwt_secret: String,
    pub issuer: String,
    pub audience: String,
    /// Scopes required on every authenticated route
    pub scopes: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// A failure run older than this starts over
    pub failure_window_ms: u64,
    /// Cool-down before a half-open trial
    pub reset_timeout_ms: u64,
    /// Successful calls slower than this count as failures; 0 disables
    pub slow_threshold_ms: u64,
    /// Per-route cap on requests in flight to the backend; 0 disables
    pub max_concurrent: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window_ms: 10_000,
            reset_timeout_ms: 30_000,
            slow_threshold_ms: 0,
            max_concurrent: 0,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn failure_window(&self) -> Duration {
        Duration::from_millis(self.failure_window_ms)
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn slow_threshold(&self) -> Option<Duration> {
        (self.slow_threshold_ms > 0).then(|| Duration::from_millis(self.slow_threshold_ms))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
    pub max_age_secs: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["*".to_string()],
            allowed_methods: ["GET", "POST", "PUT", "DELETE", "OPTIONS", "PATCH"]
                .iter()
                .map(|m| m.to_string())
                .collect(),
            allowed_headers: ["Authorization", "Content-Type", "X-Request-Id"]
                .iter()
                .map(|h| h.to_string())
                .collect(),
            max_age_secs: 86_400,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub enabled: bool,
    /// CIDRs allowed to call `/admin/*`; empty allows everyone
    pub ip_allowlist: Vec<String>,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ip_allowlist: Vec::new(),
        }
    }
}

impl AdminConfig {
    pub fn allowed_networks(&self) -> Result<Vec<IpNetwork>> {
        parse_networks("admin.ip_allowlist", &self.ip_allowlist)
    }
}

/// Access-log level of a route
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    None,
}

/// A single proxied route
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RouteConfig {
    pub path_prefix: String,
    pub backend: String,
    /// Allowed methods; empty allows all
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub auth_required: bool,
    #[serde(default)]
    pub required_scopes: Vec<String>,
    #[serde(default)]
    pub strip_prefix: bool,
    #[serde(default)]
    pub retry_attempts: u32,
    #[serde(default = "default_route_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub log_level: LogLevel,
    /// Headers set on every forwarded request
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_override: Option<RateOverride>,
}

fn default_route_timeout_ms() -> u64 {
    30_000
}

impl RouteConfig {
    pub fn new(path_prefix: &str, backend: &str) -> Self {
        Self {
            path_prefix: path_prefix.to_string(),
            backend: backend.to_string(),
            methods: Vec::new(),
            auth_required: false,
            required_scopes: Vec::new(),
            strip_prefix: false,
            retry_attempts: 0,
            timeout_ms: default_route_timeout_ms(),
            log_level: LogLevel::Info,
            headers: BTreeMap::new(),
            rate_override: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Config {
    /// Read, expand, parse and validate a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| CoreError::ConfigRead {
            path: path.display().to_string(),
            source,
        })?;
        debug!("Loaded {} bytes of configuration from {}", raw.len(), path.display());
        Self::from_yaml_str(&raw)
    }

    /// Parse and validate configuration from YAML text
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let expanded = expand_env_vars(raw);
        let mut config: Config = serde_yaml::from_str(&expanded)?;
        config.validate()?;
        config.warnings = config.collect_warnings();
        Ok(config)
    }

    /// Check every invariant the runtime relies on
    pub fn validate(&self) -> Result<()> {
        let server = &self.server;
        if server.port == 0 {
            return invalid("server.port must be between 1 and 65535");
        }
        if server.max_body_bytes == 0 {
            return invalid("server.max_body_bytes must be positive");
        }
        if server.max_response_bytes == 0 {
            return invalid("server.max_response_bytes must be positive");
        }
        server.trusted_networks()?;

        if !self.metrics.path.starts_with('/') {
            return invalid("metrics.path must start with /");
        }
        if self.logging.body_logging && self.logging.max_body_log_bytes == 0 {
            return invalid("logging.max_body_log_bytes must be positive when body_logging is enabled");
        }

        let rl = &self.rate_limit;
        if !(rl.requests_per_second.is_finite() && rl.requests_per_second > 0.0) {
            return invalid("rate_limit.requests_per_second must be positive");
        }
        if rl.burst_size == 0 {
            return invalid("rate_limit.burst_size must be positive");
        }

        if self.auth.enabled {
            if self.auth.jwt_secret.is_empty() {
                return invalid("auth.jwt_secret is required when auth is enabled");
            }
            if self.auth.issuer.is_empty() {
                return invalid("auth.issuer is required when auth is enabled");
            }
            if self.auth.audience.is_empty() {
                return invalid("auth.audience is required when auth is enabled");
            }
        }

        let cb = &self.circuit_breaker;
        if cb.failure_threshold == 0 {
            return invalid("circuit_breaker.failure_threshold must be positive");
        }
        if cb.reset_timeout_ms == 0 {
            return invalid("circuit_breaker.reset_timeout_ms must be positive");
        }

        self.admin.allowed_networks()?;

        if self.routes.is_empty() {
            return invalid("at least one route must be configured");
        }

        let mut seen = HashSet::new();
        for (i, route) in self.routes.iter().enumerate() {
            validate_route(i, route)?;
            if !seen.insert(route.path_prefix.as_str()) {
                return invalid(format!("duplicate route path_prefix: {}", route.path_prefix));
            }
        }

        Ok(())
    }

    fn collect_warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.auth.enabled && self.auth.jwt_secret.contains("${") {
            warnings.push("auth.jwt_secret contains unresolved environment variable".to_string());
        }
        if !self.auth.enabled {
            for route in self.routes.iter().filter(|r| r.auth_required) {
                warnings.push(format!(
                    "route {} requires auth but auth is disabled; requests pass unauthenticated",
                    route.path_prefix
                ));
            }
        }
        warnings
    }

    /// Copy of the configuration that is safe to expose
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if !copy.auth.jwt_secret.is_empty() {
            copy.auth.jwt_secret = REDACTED.to_string();
        }
        copy
    }
}

fn validate_route(i: usize, route: &RouteConfig) -> Result<()> {
    if route.path_prefix.is_empty() {
        return invalid(format!("routes[{}].path_prefix is required", i));
    }
    if !route.path_prefix.starts_with('/') {
        return invalid(format!("routes[{}].path_prefix must start with /", i));
    }

    let uri: Uri = route
        .backend
        .parse()
        .map_err(|e| CoreError::InvalidConfiguration(format!("routes[{}].backend: invalid URL: {}", i, e)))?;
    match uri.scheme_str() {
        Some("http") | Some("https") => {}
        other => {
            return invalid(format!(
                "routes[{}].backend: scheme must be http or https, got {:?}",
                i,
                other.unwrap_or("")
            ))
        }
    }
    if uri.authority().is_none() {
        return invalid(format!("routes[{}].backend: host is required", i));
    }

    for method in &route.methods {
        if Method::from_bytes(method.to_ascii_uppercase().as_bytes()).is_err() {
            return invalid(format!("routes[{}].methods: invalid method {:?}", i, method));
        }
    }

    for (name, value) in &route.headers {
        if HeaderName::from_bytes(name.as_bytes()).is_err() || HeaderValue::from_str(value).is_err() {
            return invalid(format!("routes[{}].headers: invalid header {:?}", i, name));
        }
    }

    if let Some(over) = &route.rate_override {
        if !(over.requests_per_second.is_finite() && over.requests_per_second > 0.0) || over.burst_size == 0 {
            return invalid(format!("routes[{}].rate_override must have positive rate and burst", i));
        }
    }

    if route.timeout_ms == 0 {
        return invalid(format!("routes[{}].timeout_ms must be positive", i));
    }

    Ok(())
}

fn parse_networks(field: &str, entries: &[String]) -> Result<Vec<IpNetwork>> {
    entries
        .iter()
        .enumerate()
        .map(|(i, cidr)| {
            cidr.parse::<IpNetwork>().map_err(|e| {
                CoreError::InvalidConfiguration(format!("{}[{}]: invalid CIDR {:?}: {}", field, i, cidr, e))
            })
        })
        .collect()
}

fn invalid<T>(message: impl Into<String>) -> Result<T> {
    Err(CoreError::InvalidConfiguration(message.into()))
}

/// Replace `${NAME}` with the environment value; unknown names are left as-is
pub fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) if end > 0 => {
                let name = &after[..end];
                match std::env::var(name) {
                    Ok(value) => out.push_str(&value),
                    Err(_) => {
                        out.push_str("${");
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            _ => {
                out.push_str("${");
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}
