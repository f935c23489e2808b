use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// Outcome of one rate-limit tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    /// Exceeded; the caller should answer 429 with this `Retry-After`.
    Limited { retry_after_secs: u64 },
}

/// Sliding-window counter per `(remote_address, route_bucket)`. The bucket is
/// the matched route template, so `/admin/alerts/{id}` counts as one key no
/// matter the concrete id. State is per-instance only.
pub struct RateLimiter {
    max_events: u32,
    window: Duration,
    buckets: Mutex<HashMap<(String, String), VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(max_events: u32, window: Duration) -> Self {
        Self {
            max_events,
            window,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub async fn tick(&self, remote_address: &str, route_bucket: &str) -> RateDecision {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().await;
        let ring = buckets
            .entry((remote_address.to_string(), route_bucket.to_string()))
            .or_default();

        while ring.front().is_some_and(|t| now.duration_since(*t) >= self.window) {
            ring.pop_front();
        }

        if ring.len() >= self.max_events as usize {
            let oldest = *ring.front().expect("non-empty ring");
            let retry_after = self.window.saturating_sub(now.duration_since(oldest));
            return RateDecision::Limited {
                retry_after_secs: retry_after.as_secs().max(1),
            };
        }

        ring.push_back(now);
        RateDecision::Allowed
    }

    /// Drop rings that have gone fully idle. Run periodically from a
    /// background task; correctness does not depend on it.
    pub async fn sweep(&self) {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().await;
        buckets.retain(|_, ring| {
            ring.back()
                .is_some_and(|t| now.duration_since(*t) < self.window)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allows_up_to_the_limit() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        for _ in 0..3 {
            assert_eq!(limiter.tick("203.0.113.9", "/auth/login").await, RateDecision::Allowed);
        }
        assert!(matches!(
            limiter.tick("203.0.113.9", "/auth/login").await,
            RateDecision::Limited { .. }
        ));
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        assert_eq!(limiter.tick("203.0.113.9", "/auth/login").await, RateDecision::Allowed);
        // Different route bucket, same address
        assert_eq!(limiter.tick("203.0.113.9", "/tickets").await, RateDecision::Allowed);
        // Different address, same bucket
        assert_eq!(limiter.tick("198.51.100.4", "/auth/login").await, RateDecision::Allowed);
    }

    #[tokio::test]
    async fn window_expiry_frees_capacity() {
        let limiter = RateLimiter::new(1, Duration::from_millis(30));
        assert_eq!(limiter.tick("203.0.113.9", "/x").await, RateDecision::Allowed);
        assert!(matches!(
            limiter.tick("203.0.113.9", "/x").await,
            RateDecision::Limited { .. }
        ));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(limiter.tick("203.0.113.9", "/x").await, RateDecision::Allowed);
    }

    #[tokio::test]
    async fn retry_after_is_at_least_one_second() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        limiter.tick("203.0.113.9", "/x").await;
        match limiter.tick("203.0.113.9", "/x").await {
            RateDecision::Limited { retry_after_secs } => {
                assert!((1..=60).contains(&retry_after_secs));
            }
            RateDecision::Allowed => panic!("expected limit"),
        }
    }

    #[tokio::test]
    async fn sweep_drops_idle_rings() {
        let limiter = RateLimiter::new(5, Duration::from_millis(10));
        limiter.tick("203.0.113.9", "/x").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        limiter.sweep().await;
        assert!(limiter.buckets.lock().await.is_empty());
    }
}
