//! Request pipeline for the API gateway
//!
//! This library provides:
//! - JWT authentication and per-client rate limiting
//! - Retrying, buffering backend forwarder with per-route circuit breakers and bulkheads
//! - The gateway error taxonomy, metrics and middleware hooks
//! - Readiness checks and the admin introspection API
pub mod admin;
pub mod auth;
pub mod bulkhead;
pub mod circuit_breaker;
pub mod client_ip;
pub mod error;
pub mod forwarder;
pub mod health_check;
pub mod metrics;
pub mod middleware;
pub mod pipeline;
pub mod policy;
pub mod rate_limit;

pub use admin::AdminApi;
pub use auth::{AuthError, Authenticator, Claims};
pub use bulkhead::{Bulkhead, BulkheadRegistry};
pub use circuit_breaker::{BreakerRegistry, CircuitBreaker, CircuitStatus};
pub use client_ip::ClientIpResolver;
pub use error::{ErrorCode, GatewayError};
pub use forwarder::{ForwardError, RequestForwarder, UpstreamRequest};
pub use health_check::{HealthCheckConfig, HealthChecker};
pub use metrics::{MetricsCollector, MetricsMiddleware};
pub use middleware::{BodyLogger, ConnectionInfo, Middleware, MiddlewareChain, RequestContext, X_REQUEST_ID};
pub use pipeline::Gateway;
pub use policy::RetryPolicy;
pub use rate_limit::{Decision, RateLimiter};
