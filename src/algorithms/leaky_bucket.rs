// src/algorithms/leaky_bucket.rs

use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Instant;

use crate::algorithms::{idle_period, lock, secs, KeyedState, RateLimitAlgorithm, RateLimitDecision};
use crate::error::Result;

#[derive(Debug, Clone, Copy)]
struct Meter {
    level: f64,
    last_leak: Instant,
}

/// Leaky bucket as a meter: each request adds one unit, the bucket drains at a
/// constant rate, and a request that would overflow it is rejected.
///
/// Unlike the token bucket, a new key starts empty.
#[derive(Debug)]
pub struct LeakyBucket {
    capacity: u64,
    /// Units drained per second
    leak_rate: f64,
    meters: Mutex<KeyedState<Meter>>,
}

impl LeakyBucket {
    pub fn new(capacity: u64, leak_rate: f64) -> Self {
        Self {
            capacity,
            leak_rate,
            meters: Mutex::new(KeyedState::new(idle_period(capacity, leak_rate))),
        }
    }

    fn leak(&self, meter: &mut Meter, now: Instant) {
        let elapsed = now.saturating_duration_since(meter.last_leak).as_secs_f64();
        meter.level = (meter.level - elapsed * self.leak_rate).max(0.0);
        meter.last_leak = now;
    }

    fn drain_time(&self, units: f64) -> f64 {
        if self.leak_rate > 0.0 {
            units / self.leak_rate
        } else {
            f64::INFINITY
        }
    }

    fn decide(&self, meter: &mut Meter, consume: bool) -> RateLimitDecision {
        self.leak(meter, Instant::now());
        let capacity = self.capacity as f64;

        if meter.level + 1.0 <= capacity {
            if consume {
                meter.level += 1.0;
            }
            let remaining = (capacity - meter.level).floor() as u64;
            RateLimitDecision::allowed(remaining, self.capacity, secs(self.drain_time(meter.level)))
        } else {
            let retry_after = secs(self.drain_time(meter.level + 1.0 - capacity));
            RateLimitDecision::denied(self.capacity, retry_after, secs(self.drain_time(meter.level)))
        }
    }

    /// Drained meters are dropped by the idle sweep
    fn is_idle(&self, meter: &Meter, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(meter.last_leak).as_secs_f64();
        meter.level - elapsed * self.leak_rate <= 0.0
    }

    fn empty() -> Meter {
        Meter {
            level: 0.0,
            last_leak: Instant::now(),
        }
    }
}

#[async_trait]
impl RateLimitAlgorithm for LeakyBucket {
    async fn check_and_record(&self, key: &str) -> Result<RateLimitDecision> {
        let mut meters = lock(&self.meters);
        let meter = meters.entry(key, Instant::now(), |m, now| self.is_idle(m, now), Self::empty);
        Ok(self.decide(meter, true))
    }

    async fn peek(&self, key: &str) -> Result<RateLimitDecision> {
        let meters = lock(&self.meters);
        let mut meter = meters.get(key).copied().unwrap_or_else(Self::empty);
        Ok(self.decide(&mut meter, false))
    }

    async fn reset(&self, key: &str) -> Result<()> {
        lock(&self.meters).remove(key);
        Ok(())
    }

    fn cleanup_idle(&self) -> usize {
        lock(&self.meters).sweep(Instant::now(), |m, now| self.is_idle(m, now))
    }

    fn tracked_keys(&self) -> usize {
        lock(&self.meters).len()
    }
}
