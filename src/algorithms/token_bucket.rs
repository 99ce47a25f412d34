// src/algorithms/token_bucket.rs

use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Instant;

use crate::algorithms::{idle_period, lock, secs, KeyedState, RateLimitAlgorithm, RateLimitDecision};
use crate::error::Result;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token Bucket rate limiting algorithm
///
/// The token bucket algorithm works by maintaining a "bucket" of tokens that are
/// replenished at a constant rate. Each request consumes a token, and if there
/// are no tokens available, the request is rejected. A new key starts full, and
/// a key whose bucket has refilled completely is forgotten by the idle sweep.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u64,
    /// Tokens per second
    refill_rate: f64,
    buckets: Mutex<KeyedState<Bucket>>,
}

impl TokenBucket {
    pub fn new(capacity: u64, refill_rate: f64) -> Self {
        Self {
            capacity,
            refill_rate,
            buckets: Mutex::new(KeyedState::new(idle_period(capacity, refill_rate))),
        }
    }

    /// Add the tokens earned since the last refill, never exceeding capacity
    fn refill(&self, bucket: &mut Bucket, now: Instant) {
        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_rate).min(self.capacity as f64);
        bucket.last_refill = now;
    }

    fn seconds_for(&self, tokens: f64) -> f64 {
        if self.refill_rate > 0.0 {
            tokens / self.refill_rate
        } else {
            f64::INFINITY
        }
    }

    fn decide(&self, bucket: &mut Bucket, consume: bool) -> RateLimitDecision {
        self.refill(bucket, Instant::now());

        if bucket.tokens >= 1.0 {
            if consume {
                bucket.tokens -= 1.0;
            }
            let until_full = self.seconds_for(self.capacity as f64 - bucket.tokens);
            RateLimitDecision::allowed(bucket.tokens.floor() as u64, self.capacity, secs(until_full))
        } else {
            let retry_after = secs(self.seconds_for(1.0 - bucket.tokens));
            RateLimitDecision::denied(self.capacity, retry_after, retry_after)
        }
    }

    /// A bucket that would be full by `now` behaves exactly like a new key
    fn is_idle(&self, bucket: &Bucket, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens + elapsed * self.refill_rate >= self.capacity as f64
    }

    fn full(&self) -> Bucket {
        Bucket {
            tokens: self.capacity as f64,
            last_refill: Instant::now(),
        }
    }
}

#[async_trait]
impl RateLimitAlgorithm for TokenBucket {
    async fn check_and_record(&self, key: &str) -> Result<RateLimitDecision> {
        let mut buckets = lock(&self.buckets);
        let bucket = buckets.entry(key, Instant::now(), |b, now| self.is_idle(b, now), || self.full());
        Ok(self.decide(bucket, true))
    }

    async fn peek(&self, key: &str) -> Result<RateLimitDecision> {
        let mut buckets = lock(&self.buckets);
        let mut bucket = buckets.get(key).copied().unwrap_or_else(|| self.full());
        let decision = self.decide(&mut bucket, false);
        if let Some(stored) = buckets.get_mut(key) {
            *stored = bucket;
        }
        Ok(decision)
    }

    async fn reset(&self, key: &str) -> Result<()> {
        lock(&self.buckets).remove(key);
        Ok(())
    }

    fn cleanup_idle(&self) -> usize {
        lock(&self.buckets).sweep(Instant::now(), |b, now| self.is_idle(b, now))
    }

    fn tracked_keys(&self) -> usize {
        lock(&self.buckets).len()
    }
}
