//! Per-route circuit breaker

use crate::metrics::MetricsCollector;
use gateway_core::{CircuitBreakerConfig, RouteTable};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

/// Externally visible breaker state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitStatus {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitStatus::Closed => "closed",
            CircuitStatus::Open => "open",
            CircuitStatus::HalfOpen => "half-open",
        }
    }

    /// Value of the `gateway_circuit_breaker_state` gauge
    pub fn gauge_value(self) -> i64 {
        match self {
            CircuitStatus::Closed => 0,
            CircuitStatus::Open => 1,
            CircuitStatus::HalfOpen => 2,
        }
    }
}

#[derive(Debug)]
enum CircuitState {
    Closed {
        failures: u32,
        run_started: Option<Instant>,
    },
    Open {
        opened_at: Instant,
    },
    HalfOpen {
        trial_in_flight: bool,
    },
}

impl CircuitState {
    fn closed() -> Self {
        CircuitState::Closed {
            failures: 0,
            run_started: None,
        }
    }

    fn status(&self) -> CircuitStatus {
        match self {
            CircuitState::Closed { .. } => CircuitStatus::Closed,
            CircuitState::Open { .. } => CircuitStatus::Open,
            CircuitState::HalfOpen { .. } => CircuitStatus::HalfOpen,
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("circuit breaker open")]
pub struct CircuitOpenError;

/// Tunables swapped in place on reload; the state machine is kept
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct BreakerSettings {
    failure_threshold: u32,
    failure_window: Duration,
    reset_timeout: Duration,
    slow_threshold: Option<Duration>,
}

impl From<&CircuitBreakerConfig> for BreakerSettings {
    fn from(config: &CircuitBreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            failure_window: config.failure_window(),
            reset_timeout: config.reset_timeout(),
            slow_threshold: config.slow_threshold(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PermitKind {
    Normal,
    Trial,
}

/// Circuit breaker guarding one route's backend
pub struct CircuitBreaker {
    route: String,
    settings: RwLock<BreakerSettings>,
    state: Mutex<CircuitState>,
    metrics: MetricsCollector,
}

impl CircuitBreaker {
    pub fn new(route: &str, config: &CircuitBreakerConfig, metrics: MetricsCollector) -> Self {
        metrics
            .circuit_breaker_state
            .with_label_values(&[route])
            .set(CircuitStatus::Closed.gauge_value());
        Self {
            route: route.to_string(),
            settings: RwLock::new(BreakerSettings::from(config)),
            state: Mutex::new(CircuitState::closed()),
            metrics,
        }
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    pub fn status(&self) -> CircuitStatus {
        self.state.lock().status()
    }

    pub fn is_open(&self) -> bool {
        self.status() == CircuitStatus::Open
    }

    fn settings(&self) -> BreakerSettings {
        *self.settings.read()
    }

    /// Apply new thresholds without resetting the current state
    pub fn update_config(&self, config: &CircuitBreakerConfig) {
        let next = BreakerSettings::from(config);
        let mut settings = self.settings.write();
        if *settings != next {
            info!(
                route = %self.route,
                failure_threshold = next.failure_threshold,
                reset_timeout_ms = next.reset_timeout.as_millis() as u64,
                "circuit breaker config updated"
            );
            *settings = next;
        }
    }

    /// Ask to send a request to the backend
    pub fn acquire(&self) -> Result<BreakerPermit<'_>, CircuitOpenError> {
        self.acquire_at(Instant::now())
    }

    pub fn acquire_at(&self, now: Instant) -> Result<BreakerPermit<'_>, CircuitOpenError> {
        let reset_timeout = self.settings().reset_timeout;
        let mut state = self.state.lock();
        let kind = match &mut *state {
            CircuitState::Closed { .. } => PermitKind::Normal,
            CircuitState::Open { opened_at } => {
                if now.saturating_duration_since(*opened_at) < reset_timeout {
                    return Err(CircuitOpenError);
                }
                self.transition(&mut state, CircuitState::HalfOpen { trial_in_flight: true });
                PermitKind::Trial
            }
            CircuitState::HalfOpen { trial_in_flight } => {
                if *trial_in_flight {
                    return Err(CircuitOpenError);
                }
                *trial_in_flight = true;
                PermitKind::Trial
            }
        };
        Ok(BreakerPermit {
            breaker: self,
            kind,
            settled: false,
        })
    }

    fn on_success(&self, kind: PermitKind) {
        let mut state = self.state.lock();
        match (&mut *state, kind) {
            (CircuitState::Closed { failures, run_started }, _) => {
                *failures = 0;
                *run_started = None;
            }
            (CircuitState::HalfOpen { .. }, PermitKind::Trial) => {
                self.transition(&mut state, CircuitState::closed());
            }
            _ => {}
        }
    }

    fn on_failure(&self, kind: PermitKind, now: Instant) {
        let settings = self.settings();
        let mut state = self.state.lock();
        match (&mut *state, kind) {
            (CircuitState::Closed { failures, run_started }, _) => {
                let expired = run_started.map_or(true, |start| now.saturating_duration_since(start) > settings.failure_window);
                if expired {
                    *failures = 1;
                    *run_started = Some(now);
                } else {
                    *failures += 1;
                }
                debug!("Circuit breaker {}: {} consecutive failures", self.route, failures);
                if *failures >= settings.failure_threshold {
                    self.transition(&mut state, CircuitState::Open { opened_at: now });
                }
            }
            (CircuitState::HalfOpen { .. }, PermitKind::Trial) => {
                self.transition(&mut state, CircuitState::Open { opened_at: now });
            }
            _ => {}
        }
    }

    fn on_abandoned(&self) {
        let mut state = self.state.lock();
        if let CircuitState::HalfOpen { trial_in_flight } = &mut *state {
            *trial_in_flight = false;
        }
    }

    fn transition(&self, state: &mut CircuitState, next: CircuitState) {
        let from = state.status();
        let to = next.status();
        *state = next;
        if from != to {
            info!(route = %self.route, from = from.as_str(), to = to.as_str(), "circuit breaker state change");
            self.metrics
                .circuit_breaker_state_changes_total
                .with_label_values(&[self.route.as_str(), from.as_str(), to.as_str()])
                .inc();
            self.metrics
                .circuit_breaker_state
                .with_label_values(&[self.route.as_str()])
                .set(to.gauge_value());
        }
    }
}

/// Permission to call the backend; report the outcome exactly once.
///
/// A half-open trial permit dropped without an outcome frees the trial slot.
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    kind: PermitKind,
    settled: bool,
}

impl BreakerPermit<'_> {
    pub fn is_trial(&self) -> bool {
        self.kind == PermitKind::Trial
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        self.breaker
    }

    /// Report a successful call that took `latency`. Past the slow threshold it counts as a failure.
    pub fn record_success(mut self, latency: Duration) {
        self.settled = true;
        let breaker = self.breaker;
        match breaker.settings().slow_threshold {
            Some(limit) if latency > limit => {
                debug!(route = %breaker.route, "slow call after {:?} counted as failure", latency);
                breaker
                    .metrics
                    .slow_calls_total
                    .with_label_values(&[breaker.route.as_str()])
                    .inc();
                breaker.on_failure(self.kind, Instant::now());
            }
            _ => breaker.on_success(self.kind),
        }
    }

    pub fn record_failure(self) {
        self.record_failure_at(Instant::now());
    }

    pub fn record_failure_at(mut self, now: Instant) {
        self.settled = true;
        self.breaker.on_failure(self.kind, now);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.kind == PermitKind::Trial {
            self.breaker.on_abandoned();
        }
    }
}

/// One breaker per configured route, keyed by path prefix
pub struct BreakerRegistry {
    breakers: HashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(routes: &RouteTable, config: &CircuitBreakerConfig, metrics: &MetricsCollector) -> Self {
        let breakers = routes
            .routes()
            .iter()
            .map(|r| {
                let breaker = CircuitBreaker::new(&r.path_prefix, config, metrics.clone());
                (r.path_prefix.clone(), Arc::new(breaker))
            })
            .collect();
        Self { breakers }
    }

    pub fn get(&self, prefix: &str) -> Option<&Arc<CircuitBreaker>> {
        self.breakers.get(prefix)
    }

    pub fn status(&self, prefix: &str) -> CircuitStatus {
        self.get(prefix).map_or(CircuitStatus::Closed, |b| b.status())
    }

    pub fn update_config(&self, config: &CircuitBreakerConfig) {
        for breaker in self.breakers.values() {
            breaker.update_config(config);
        }
    }
}
