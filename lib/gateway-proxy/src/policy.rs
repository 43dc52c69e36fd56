//! Retry policy for backend attempts

use hyper::StatusCode;
use std::time::Duration;

/// Backoff between attempts on the same route
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Backoff before the first retry
    pub initial_backoff: Duration,
    /// Upper bound on any single backoff
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Whether a backend status counts as a failed attempt
    pub fn is_failure(&self, status: StatusCode) -> bool {
        status.is_server_error()
    }

    /// Calculate backoff duration for the given retry count
    pub fn backoff_duration(&self, retry_count: u32) -> Duration {
        let base = self.initial_backoff.as_millis() as u64;
        let exponential = 2u64.saturating_pow(retry_count);
        let backoff_ms = base
            .saturating_mul(exponential)
            .min(self.max_backoff.as_millis() as u64);
        Duration::from_millis(backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_failure_statuses() {
        let policy = RetryPolicy::default();
        assert!(policy.is_failure(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(policy.is_failure(StatusCode::BAD_GATEWAY));
        assert!(policy.is_failure(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!policy.is_failure(StatusCode::OK));
        assert!(!policy.is_failure(StatusCode::NOT_FOUND));
        assert!(!policy.is_failure(StatusCode::TOO_MANY_REQUESTS));
    }

    #[test]
    fn test_retry_policy_backoff() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_duration(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_duration(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_duration(2), Duration::from_millis(400));
    }

    #[test]
    fn test_retry_policy_backoff_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_duration(10), Duration::from_secs(2));
        assert_eq!(policy.backoff_duration(64), Duration::from_secs(2));
    }
}
