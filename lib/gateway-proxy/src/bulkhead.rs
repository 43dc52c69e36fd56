//! Per-route cap on requests in flight to a backend

use crate::metrics::MetricsCollector;
use gateway_core::RouteTable;
use prometheus::IntGauge;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::debug;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("bulkhead full")]
pub struct BulkheadFull;

/// Concurrency limiter for one route; never waits for a slot
pub struct Bulkhead {
    route: String,
    max_concurrent: usize,
    slots: Arc<Semaphore>,
    metrics: MetricsCollector,
    in_flight: IntGauge,
}

impl Bulkhead {
    pub fn new(route: &str, max_concurrent: usize, metrics: MetricsCollector) -> Self {
        let in_flight = metrics.bulkhead_in_flight.with_label_values(&[route]);
        in_flight.set(0);
        Self {
            route: route.to_string(),
            max_concurrent,
            slots: Arc::new(Semaphore::new(max_concurrent)),
            metrics,
            in_flight,
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn in_flight(&self) -> usize {
        self.max_concurrent - self.slots.available_permits()
    }

    /// Take a slot, or fail at once when all are held
    pub fn try_acquire(&self) -> Result<BulkheadPermit, BulkheadFull> {
        match self.slots.clone().try_acquire_owned() {
            Ok(permit) => {
                self.in_flight.inc();
                Ok(BulkheadPermit {
                    _permit: permit,
                    in_flight: self.in_flight.clone(),
                })
            }
            Err(TryAcquireError::NoPermits) | Err(TryAcquireError::Closed) => {
                debug!(route = %self.route, limit = self.max_concurrent, "bulkhead rejected request");
                self.metrics
                    .bulkhead_rejections_total
                    .with_label_values(&[self.route.as_str()])
                    .inc();
                Err(BulkheadFull)
            }
        }
    }
}

/// A held slot, released on drop
pub struct BulkheadPermit {
    _permit: OwnedSemaphorePermit,
    in_flight: IntGauge,
}

impl Drop for BulkheadPermit {
    fn drop(&mut self) {
        self.in_flight.dec();
    }
}

/// Bulkheads keyed by route prefix. Empty when `max_concurrent` is 0.
pub struct BulkheadRegistry {
    bulkheads: HashMap<String, Bulkhead>,
}

impl BulkheadRegistry {
    pub fn new(routes: &RouteTable, max_concurrent: u32, metrics: &MetricsCollector) -> Self {
        let bulkheads = if max_concurrent == 0 {
            HashMap::new()
        } else {
            routes
                .routes()
                .iter()
                .map(|r| {
                    let bulkhead = Bulkhead::new(&r.path_prefix, max_concurrent as usize, metrics.clone());
                    (r.path_prefix.clone(), bulkhead)
                })
                .collect()
        };
        Self { bulkheads }
    }

    pub fn is_enabled(&self) -> bool {
        !self.bulkheads.is_empty()
    }

    pub fn get(&self, prefix: &str) -> Option<&Bulkhead> {
        self.bulkheads.get(prefix)
    }

    /// Slot for the route, or `None` when the route has no bulkhead
    pub fn try_acquire(&self, prefix: &str) -> Result<Option<BulkheadPermit>, BulkheadFull> {
        self.get(prefix).map(Bulkhead::try_acquire).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_core::RouteConfig;

    #[test]
    fn test_rejects_past_limit_and_releases_on_drop() {
        let metrics = MetricsCollector::new().expect("metrics");
        let bulkhead = Bulkhead::new("/api", 2, metrics.clone());

        let a = bulkhead.try_acquire().expect("first slot");
        let _b = bulkhead.try_acquire().expect("second slot");
        assert_eq!(bulkhead.in_flight(), 2);
        assert_eq!(bulkhead.try_acquire().err(), Some(BulkheadFull));

        drop(a);
        assert_eq!(bulkhead.in_flight(), 1);
        assert!(bulkhead.try_acquire().is_ok());

        let output = metrics.gather().expect("gather");
        assert!(output.contains("gateway_bulkhead_rejections_total{route=\"/api\"} 1"));
        assert!(output.contains("gateway_bulkhead_in_flight{route=\"/api\"} 1"));
    }

    #[test]
    fn test_registry_disabled_at_zero() {
        let configs = vec![RouteConfig::new("/a", "http://127.0.0.1:1")];
        let table = RouteTable::from_config(&configs).expect("routes");
        let metrics = MetricsCollector::new().expect("metrics");

        let disabled = BulkheadRegistry::new(&table, 0, &metrics);
        assert!(!disabled.is_enabled());
        assert!(matches!(disabled.try_acquire("/a"), Ok(None)));

        let enabled = BulkheadRegistry::new(&table, 1, &metrics);
        let held = enabled.try_acquire("/a").expect("slot");
        assert!(held.is_some());
        assert!(enabled.try_acquire("/a").is_err());
        assert!(matches!(enabled.try_acquire("/missing"), Ok(None)));
    }
}
