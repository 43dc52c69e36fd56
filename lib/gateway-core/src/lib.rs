//! Core configuration and routing for the API gateway
//!
//! This library provides:
//! - Gateway configuration model, YAML loading and validation
//! - The immutable route table with segment-boundary prefix matching

pub mod config;
pub mod error;
pub mod route;

pub use config::{
    AdminConfig, AuthConfig, CircuitBreakerConfig, Config, CorsConfig, LogFormat, LogLevel,
    LogOutput, LoggingConfig, MetricsConfig, RateLimitConfig, RateOverride, RouteConfig,
    ServerConfig,
};
pub use error::{CoreError, Result};
pub use route::{match_path, Route, RouteMatch, RouteTable, UNMATCHED_LABEL};
