//! Fixed-window request quota tracking.
//!
//! One bucket per key, created lazily and recycled at window rollover,
//! never destroyed. Buckets live in a DashMap so increments are atomic per
//! key; there is no global lock and `check` never blocks on I/O.

use chrono::Utc;
use common::Identity;
use dashmap::DashMap;
use std::time::Duration;
use uuid::Uuid;

/// Rate-limit bucket key: identity id when authenticated, originating
/// address otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RateKey {
    Identity(Uuid),
    Address(String),
}

impl RateKey {
    /// Derive the key for a request: identity id when the caller is
    /// authenticated, else the originating address.
    pub fn derive(identity: Option<&Identity>, remote_addr: &str) -> Self {
        match identity {
            Some(identity) => RateKey::Identity(identity.id),
            None => RateKey::Address(remote_addr.to_string()),
        }
    }
}

/// Outcome of a quota check. Exceeding the quota is reported through
/// `exceeded`; short-circuiting the request is the caller's responsibility.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitStatus {
    /// Configured limit for this key's class.
    pub total: u32,
    /// Requests left in the current window, saturating at zero.
    pub remaining: u32,
    /// True once the count has crossed the limit.
    pub exceeded: bool,
    /// Epoch milliseconds at which the current window rolls over.
    pub next_reset: i64,
}

/// Rate limiter configuration.
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Per-window limit for authenticated identities.
    pub authenticated_limit: u32,
    /// Per-window limit for anonymous addresses.
    pub anonymous_limit: u32,
    /// Fixed window duration.
    pub window: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            authenticated_limit: 10_800,
            anonymous_limit: 3_600,
            window: Duration::from_secs(3_600),
        }
    }
}

#[derive(Debug)]
struct Bucket {
    window_start: i64,
    count: u32,
    limit: u32,
}

/// Per-key fixed-window quota tracker.
pub struct RateLimiter {
    buckets: DashMap<RateKey, Bucket>,
    config: RateLimiterConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            buckets: DashMap::new(),
            config,
        }
    }

    /// Record a request against `key` and report the resulting quota state.
    ///
    /// The count is capped at `limit + 1`: the request that crosses the
    /// limit is flagged, not silently dropped, and further requests cannot
    /// grow the count unboundedly.
    pub fn check(&self, key: &RateKey) -> RateLimitStatus {
        self.track(key, true)
    }

    /// Report the quota state for `key` without consuming any of it. Used
    /// for the connection greeting.
    pub fn peek(&self, key: &RateKey) -> RateLimitStatus {
        self.track(key, false)
    }

    fn track(&self, key: &RateKey, increment: bool) -> RateLimitStatus {
        let now = Utc::now().timestamp_millis();
        let window_ms = self.config.window.as_millis() as i64;
        let limit = match key {
            RateKey::Identity(_) => self.config.authenticated_limit,
            RateKey::Address(_) => self.config.anonymous_limit,
        };

        let mut bucket = self.buckets.entry(key.clone()).or_insert_with(|| Bucket {
            window_start: now,
            count: 0,
            limit,
        });

        if now - bucket.window_start >= window_ms {
            bucket.window_start = now;
            bucket.count = 0;
        }

        if increment && bucket.count <= bucket.limit {
            bucket.count += 1;
        }

        RateLimitStatus {
            total: bucket.limit,
            remaining: bucket.limit.saturating_sub(bucket.count),
            exceeded: bucket.count > bucket.limit,
            next_reset: bucket.window_start + window_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(limit: u32, window: Duration) -> RateLimiter {
        RateLimiter::new(RateLimiterConfig {
            authenticated_limit: limit,
            anonymous_limit: limit,
            window,
        })
    }

    #[test]
    fn counts_down_and_flags_the_crossing_request() {
        let limiter = limiter(5, Duration::from_secs(3600));
        let key = RateKey::Address("198.51.100.4".to_string());

        for expected_remaining in [4, 3, 2, 1, 0] {
            let status = limiter.check(&key);
            assert_eq!(status.remaining, expected_remaining);
            assert!(!status.exceeded);
        }

        let sixth = limiter.check(&key);
        assert!(sixth.exceeded);
        assert_eq!(sixth.remaining, 0);

        // The count is capped at limit + 1.
        let seventh = limiter.check(&key);
        assert!(seventh.exceeded);
        assert_eq!(seventh.remaining, 0);
    }

    #[test]
    fn window_rollover_recycles_the_bucket() {
        let limiter = limiter(2, Duration::from_millis(20));
        let key = RateKey::Address("198.51.100.5".to_string());

        limiter.check(&key);
        limiter.check(&key);
        assert!(limiter.check(&key).exceeded);

        std::thread::sleep(Duration::from_millis(30));

        let fresh = limiter.check(&key);
        assert!(!fresh.exceeded);
        assert_eq!(fresh.remaining, 1);
    }

    #[test]
    fn peek_does_not_consume_quota() {
        let limiter = limiter(5, Duration::from_secs(3600));
        let key = RateKey::Address("198.51.100.6".to_string());

        let peeked = limiter.peek(&key);
        assert_eq!(peeked.remaining, 5);
        assert!(!peeked.exceeded);

        let first = limiter.check(&key);
        assert_eq!(first.remaining, 4);
    }

    #[test]
    fn keys_are_independent() {
        let limiter = limiter(1, Duration::from_secs(3600));
        let a = RateKey::Address("a".to_string());
        let b = RateKey::Address("b".to_string());

        limiter.check(&a);
        assert!(limiter.check(&a).exceeded);
        assert!(!limiter.check(&b).exceeded);
    }

    #[test]
    fn identity_keys_use_the_authenticated_limit() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            authenticated_limit: 10,
            anonymous_limit: 2,
            window: Duration::from_secs(3600),
        });
        let identity = Identity {
            id: Uuid::new_v4(),
            display: "probe".to_string(),
        };
        let key = RateKey::derive(Some(&identity), "203.0.113.9");
        assert_eq!(limiter.check(&key).total, 10);

        let anon = RateKey::derive(None, "203.0.113.9");
        assert_eq!(limiter.check(&anon).total, 2);
    }
}
