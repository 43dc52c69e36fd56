//! Per-client token-bucket rate limiting

use dashmap::DashMap;
use gateway_core::{RateLimitConfig, Route};
use parking_lot::RwLock;
use serde::Serialize;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Bucket identity: client address, plus the route prefix when that route
/// overrides the global limits
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketKey {
    pub ip: IpAddr,
    pub route: Option<Arc<str>>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
    rate: f64,
    burst: u32,
}

impl Bucket {
    fn new(rate: f64, burst: u32, now: Instant) -> Self {
        Self {
            tokens: burst as f64,
            last_refill: now,
            last_seen: now,
            rate,
            burst,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst as f64);
        self.last_refill = now;
    }

    /// Adopt limits changed by a reload; time since the last refill earns at the new rate
    fn retune(&mut self, rate: f64, burst: u32) {
        if self.rate != rate || self.burst != burst {
            self.rate = rate;
            self.burst = burst;
        }
    }

    fn take(&mut self, now: Instant) -> Decision {
        self.refill(now);
        self.last_seen = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Decision::Allow
        } else {
            let wait = (1.0 - self.tokens) / self.rate;
            Decision::Deny {
                retry_after_secs: (wait.ceil() as u64).max(1),
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny { retry_after_secs: u64 },
}

/// Point-in-time view of one bucket
#[derive(Clone, Debug, Serialize)]
pub struct LimiterEntry {
    pub ip: String,
    /// Route prefix for override buckets, `null` for the global bucket
    pub route: Option<String>,
    pub rate: f64,
    pub burst: u32,
    pub tokens: f64,
    pub idle_ms: u64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct LimiterSettings {
    rate: f64,
    burst: u32,
    idle_ttl: Duration,
}

impl From<&RateLimitConfig> for LimiterSettings {
    fn from(config: &RateLimitConfig) -> Self {
        Self {
            rate: config.requests_per_second,
            burst: config.burst_size,
            idle_ttl: Duration::from_secs(config.idle_ttl_secs),
        }
    }
}

pub struct RateLimiter {
    buckets: DashMap<BucketKey, Bucket>,
    settings: RwLock<LimiterSettings>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            buckets: DashMap::new(),
            settings: RwLock::new(LimiterSettings::from(config)),
        }
    }

    /// Swap the global limits. Existing buckets pick them up on their next check.
    pub fn update_config(&self, config: &RateLimitConfig) {
        let next = LimiterSettings::from(config);
        let mut settings = self.settings.write();
        if *settings != next {
            info!(
                old_rps = settings.rate,
                new_rps = next.rate,
                old_burst = settings.burst,
                new_burst = next.burst,
                "rate limit config changed"
            );
            *settings = next;
        }
    }

    /// Take one token for `ip`, using the route's override when it has one
    pub fn check(&self, ip: IpAddr, route: Option<&Route>) -> Decision {
        self.check_at(ip, route, Instant::now())
    }

    pub fn check_at(&self, ip: IpAddr, route: Option<&Route>, now: Instant) -> Decision {
        let (key, rate, burst) = match route.and_then(|r| r.rate_override.map(|o| (r, o))) {
            Some((route, over)) => (
                BucketKey {
                    ip,
                    route: Some(Arc::from(route.path_prefix.as_str())),
                },
                over.requests_per_second,
                over.burst_size,
            ),
            None => {
                let settings = *self.settings.read();
                (BucketKey { ip, route: None }, settings.rate, settings.burst)
            }
        };

        let mut bucket = self
            .buckets
            .entry(key)
            .or_insert_with(|| Bucket::new(rate, burst, now));
        bucket.retune(rate, burst);
        bucket.take(now)
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// All buckets, sorted by key so pages are stable
    pub fn snapshot(&self) -> Vec<LimiterEntry> {
        self.snapshot_at(Instant::now())
    }

    pub fn snapshot_at(&self, now: Instant) -> Vec<LimiterEntry> {
        let mut rows: Vec<(BucketKey, LimiterEntry)> = self
            .buckets
            .iter()
            .map(|item| {
                let (key, bucket) = item.pair();
                let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
                let entry = LimiterEntry {
                    ip: key.ip.to_string(),
                    route: key.route.as_deref().map(str::to_string),
                    rate: bucket.rate,
                    burst: bucket.burst,
                    tokens: (bucket.tokens + elapsed * bucket.rate).min(bucket.burst as f64),
                    idle_ms: now.saturating_duration_since(bucket.last_seen).as_millis() as u64,
                };
                (key.clone(), entry)
            })
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows.into_iter().map(|(_, entry)| entry).collect()
    }

    /// Drop buckets idle for longer than the TTL, returning how many went
    pub fn sweep(&self, now: Instant) -> usize {
        let before = self.buckets.len();
        let ttl = self.settings.read().idle_ttl;
        self.buckets
            .retain(|_, bucket| now.saturating_duration_since(bucket.last_seen) <= ttl);
        before.saturating_sub(self.buckets.len())
    }

    /// Sweep periodically until the limiter is dropped
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let limiter = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(limiter) = limiter.upgrade() else {
                    break;
                };
                let evicted = limiter.sweep(Instant::now());
                if evicted > 0 {
                    debug!("Rate limiter swept {} idle buckets, {} remain", evicted, limiter.len());
                }
            }
        })
    }
}
