//! Per-credential token bucket.
//!
//! The remote platform enforces quotas per access token, so buckets are keyed
//! by credential id and shared across all callers using that credential.
//! Buckets are created lazily on first use; state is in-memory only.

use dashmap::DashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: u64) -> Self {
        Self {
            tokens: capacity as f64,
            last_refill: Instant::now(),
        }
    }

    /// Try to consume one token. Refills at capacity/60 tokens per second.
    fn try_consume(&mut self, capacity: u64) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        let refill_rate = capacity as f64 / 60.0;
        self.tokens = (self.tokens + elapsed * refill_rate).min(capacity as f64);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Time until one full token has refilled.
    fn time_to_next_token(&self, capacity: u64) -> Duration {
        if self.tokens >= 1.0 {
            return Duration::ZERO;
        }
        let refill_rate = capacity as f64 / 60.0;
        Duration::from_secs_f64((1.0 - self.tokens) / refill_rate)
    }
}

/// Per-credential token bucket rate limiter.
pub struct RateLimiter {
    buckets: DashMap<Uuid, TokenBucket>,
    capacity_per_minute: u64,
}

impl RateLimiter {
    pub fn new(capacity_per_minute: u64) -> Self {
        Self {
            buckets: DashMap::new(),
            capacity_per_minute: capacity_per_minute.max(1),
        }
    }

    /// Check and consume one token for `credential_id`.
    pub fn check_and_consume(&self, credential_id: Uuid) -> bool {
        let mut bucket = self
            .buckets
            .entry(credential_id)
            .or_insert_with(|| TokenBucket::new(self.capacity_per_minute));
        bucket.try_consume(self.capacity_per_minute)
    }

    /// Suspend until a token is available, then consume it.
    pub async fn acquire(&self, credential_id: Uuid) {
        loop {
            let wait = {
                let mut bucket = self
                    .buckets
                    .entry(credential_id)
                    .or_insert_with(|| TokenBucket::new(self.capacity_per_minute));
                if bucket.try_consume(self.capacity_per_minute) {
                    return;
                }
                bucket.time_to_next_token(self.capacity_per_minute)
            };
            // Entry guard dropped before sleeping
            tokio::time::sleep(wait.max(Duration::from_millis(10))).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_bucket_allows_requests() {
        let limiter = RateLimiter::new(100);
        assert!(limiter.check_and_consume(Uuid::new_v4()));
    }

    #[test]
    fn empty_bucket_blocks() {
        let limiter = RateLimiter::new(1);
        let cred = Uuid::new_v4();
        assert!(limiter.check_and_consume(cred));
        assert!(!limiter.check_and_consume(cred));
    }

    #[test]
    fn buckets_are_independent_per_credential() {
        let limiter = RateLimiter::new(1);
        let cred_a = Uuid::new_v4();
        let cred_b = Uuid::new_v4();
        assert!(limiter.check_and_consume(cred_a));
        assert!(!limiter.check_and_consume(cred_a));
        assert!(limiter.check_and_consume(cred_b));
    }

    #[tokio::test]
    async fn acquire_waits_for_refill() {
        // 3600/minute = 60/second, so a drained bucket refills within ~17ms
        let limiter = RateLimiter::new(3600);
        let cred = Uuid::new_v4();
        while limiter.check_and_consume(cred) {}

        let start = Instant::now();
        limiter.acquire(cred).await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
