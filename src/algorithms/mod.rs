// src/algorithms/mod.rs
//! Per-key admission control.
//!
//! Every algorithm keeps its state in memory, local to this process, behind a
//! single mutex per limiter. A key whose state has drifted back to what a new key
//! would get is dropped by a sweep that runs at most once per idle period, so the
//! key space does not grow without bound. [`RateLimiter`] wraps an algorithm with
//! logging, events and conversion to [`ResilienceError::RateLimitExceeded`].

mod fixed_window;
mod leaky_bucket;
mod sliding_window;
mod token_bucket;

#[cfg(test)]
mod tests;

pub use fixed_window::FixedWindow;
pub use leaky_bucket::LeakyBucket;
pub use sliding_window::SlidingWindow;
pub use token_bucket::TokenBucket;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::{AlgorithmKind, RateLimitConfig};
use crate::error::{ResilienceError, Result};
use crate::events::{EventPublisher, EventType};

/// Outcome of a rate limit check
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitDecision {
    /// Whether the request was allowed
    pub allowed: bool,

    /// Requests left before the next denial
    pub remaining: u64,

    /// Total capacity of the rate limiter
    pub limit: u64,

    /// When the limiter will have capacity again
    pub reset_at: DateTime<Utc>,

    /// How long a denied caller should wait, zero when allowed
    #[serde(with = "crate::config::duration_serde")]
    pub retry_after: Duration,
}

impl RateLimitDecision {
    pub(crate) fn allowed(remaining: u64, limit: u64, reset_after: Duration) -> Self {
        Self {
            allowed: true,
            remaining,
            limit,
            reset_at: reset_at(reset_after),
            retry_after: Duration::ZERO,
        }
    }

    pub(crate) fn denied(limit: u64, retry_after: Duration, reset_after: Duration) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            limit,
            reset_at: reset_at(reset_after),
            retry_after,
        }
    }

    pub fn headers(&self) -> RateLimitHeaders {
        RateLimitHeaders {
            limit: self.limit,
            remaining: self.remaining,
            reset: self.reset_at.timestamp(),
        }
    }
}

/// Conventional rate limit response headers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitHeaders {
    pub limit: u64,
    pub remaining: u64,
    /// Unix seconds
    pub reset: i64,
}

impl RateLimitHeaders {
    pub fn to_pairs(&self) -> [(&'static str, String); 3] {
        [
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset.to_string()),
        ]
    }
}

/// Core trait that all rate limiting algorithms must implement
#[async_trait]
pub trait RateLimitAlgorithm: Send + Sync + Debug {
    /// Check the key and consume one unit of capacity if it is allowed
    async fn check_and_record(&self, key: &str) -> Result<RateLimitDecision>;

    /// Current state of the key without consuming anything
    async fn peek(&self, key: &str) -> Result<RateLimitDecision>;

    /// Forget everything about the key
    async fn reset(&self, key: &str) -> Result<()>;

    /// Drop every key whose state is indistinguishable from a new key's.
    /// Returns the number of keys removed.
    fn cleanup_idle(&self) -> usize;

    /// Keys currently holding state
    fn tracked_keys(&self) -> usize;
}

/// Instantiate the algorithm a config selects
pub fn build_algorithm(config: &RateLimitConfig) -> Arc<dyn RateLimitAlgorithm> {
    match config.algorithm {
        AlgorithmKind::TokenBucket => Arc::new(TokenBucket::new(config.capacity(), config.rate_per_second())),
        AlgorithmKind::SlidingWindow => Arc::new(SlidingWindow::new(config.limit, config.window)),
        AlgorithmKind::FixedWindow => Arc::new(FixedWindow::new(config.limit, config.window)),
        AlgorithmKind::LeakyBucket => Arc::new(LeakyBucket::new(config.capacity(), config.rate_per_second())),
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Per-key state plus the bookkeeping for sweeping idle keys
#[derive(Debug)]
pub(crate) struct KeyedState<T> {
    entries: HashMap<String, T>,
    /// Time after which an untouched key is certainly idle
    idle_after: Duration,
    last_sweep: Instant,
}

impl<T> KeyedState<T> {
    pub(crate) fn new(idle_after: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            idle_after,
            last_sweep: Instant::now(),
        }
    }

    pub(crate) fn get(&self, key: &str) -> Option<&T> {
        self.entries.get(key)
    }

    pub(crate) fn get_mut(&mut self, key: &str) -> Option<&mut T> {
        self.entries.get_mut(key)
    }

    pub(crate) fn remove(&mut self, key: &str) -> Option<T> {
        self.entries.remove(key)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// State for `key`, sweeping idle keys first when a full idle period has
    /// passed since the last sweep
    pub(crate) fn entry(
        &mut self,
        key: &str,
        now: Instant,
        is_idle: impl Fn(&T, Instant) -> bool,
        fresh: impl FnOnce() -> T,
    ) -> &mut T {
        if now.saturating_duration_since(self.last_sweep) >= self.idle_after {
            self.sweep(now, is_idle);
        }
        self.entries.entry(key.to_string()).or_insert_with(fresh)
    }

    pub(crate) fn sweep(&mut self, now: Instant, is_idle: impl Fn(&T, Instant) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, state| !is_idle(state, now));
        self.last_sweep = now;

        let removed = before - self.entries.len();
        if removed > 0 {
            debug!(removed, remaining = self.entries.len(), "Swept idle rate limit keys");
        }
        removed
    }
}

/// Time for a bucket draining or filling at `rate` per second to cover `units`.
/// A bucket that never moves is never swept on a timer.
pub(crate) fn idle_period(units: u64, rate: f64) -> Duration {
    let seconds = units as f64 / rate;
    if rate > 0.0 && seconds.is_finite() {
        Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX)
    } else {
        Duration::MAX
    }
}

fn reset_at(after: Duration) -> DateTime<Utc> {
    let after = chrono::Duration::from_std(after).unwrap_or_else(|_| chrono::Duration::zero());
    Utc::now() + after
}

/// Seconds as a `Duration`, saturating on nonsense input
pub(crate) fn secs(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::try_from_secs_f64(value).unwrap_or(Duration::MAX)
    } else {
        Duration::ZERO
    }
}

/// A named rate limiter that logs and publishes its denials
#[derive(Debug, Clone)]
pub struct RateLimiter {
    name: String,
    config: RateLimitConfig,
    algorithm: Arc<dyn RateLimitAlgorithm>,
    events: EventPublisher,
}

impl RateLimiter {
    pub fn new(name: impl Into<String>, config: RateLimitConfig) -> Self {
        let algorithm = build_algorithm(&config);
        Self {
            name: name.into(),
            config,
            algorithm,
            events: EventPublisher::noop(),
        }
    }

    /// Use a custom algorithm instead of the one the config names
    pub fn with_algorithm(mut self, algorithm: Arc<dyn RateLimitAlgorithm>) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn with_events(mut self, events: EventPublisher) -> Self {
        self.events = events;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Consume capacity for `key` and report the decision
    pub async fn allow(&self, key: &str) -> Result<RateLimitDecision> {
        let decision = self.algorithm.check_and_record(key).await?;

        crate::rate_limit_event!(
            key,
            decision.allowed,
            decision.remaining,
            decision.limit,
            decision.retry_after.as_millis() as u64
        );

        if !decision.allowed {
            let event = self
                .events
                .event(EventType::RateLimit, &self.name)
                .with_metadata("key", key)
                .with_metadata("allowed", false)
                .with_metadata("remaining", decision.remaining)
                .with_metadata("limit", decision.limit)
                .with_metadata("retry_after_ms", decision.retry_after.as_millis() as u64);
            self.events.publish(event);
        }

        Ok(decision)
    }

    /// Like [`allow`](Self::allow), with a denial turned into an error
    pub async fn check(&self, key: &str) -> Result<RateLimitDecision> {
        let decision = self.allow(key).await?;
        if decision.allowed {
            Ok(decision)
        } else {
            Err(ResilienceError::RateLimitExceeded {
                key: key.to_string(),
                limit: decision.limit,
                remaining: decision.remaining,
                retry_after: decision.retry_after,
            })
        }
    }

    pub async fn get_headers(&self, key: &str) -> Result<RateLimitHeaders> {
        Ok(self.algorithm.peek(key).await?.headers())
    }

    pub async fn reset(&self, key: &str) -> Result<()> {
        self.algorithm.reset(key).await
    }

    /// Drop idle per-key state now instead of waiting for the next sweep
    pub fn cleanup_idle(&self) -> usize {
        self.algorithm.cleanup_idle()
    }

    pub fn tracked_keys(&self) -> usize {
        self.algorithm.tracked_keys()
    }
}
