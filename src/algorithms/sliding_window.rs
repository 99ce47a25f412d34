// src/algorithms/sliding_window.rs

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::algorithms::{lock, KeyedState, RateLimitAlgorithm, RateLimitDecision};
use crate::error::Result;

/// Sliding Window rate limiting algorithm
///
/// Keeps the timestamp of every admitted request and allows a new one while fewer
/// than `limit` of them fall inside the trailing window. Exact, at the cost of
/// one entry per admitted request.
#[derive(Debug)]
pub struct SlidingWindow {
    limit: u64,
    window: Duration,
    logs: Mutex<KeyedState<VecDeque<Instant>>>,
}

impl SlidingWindow {
    pub fn new(limit: u64, window: Duration) -> Self {
        Self {
            limit,
            window,
            logs: Mutex::new(KeyedState::new(window)),
        }
    }

    /// Drop timestamps that have left the window
    fn evict(&self, log: &mut VecDeque<Instant>, now: Instant) {
        while let Some(oldest) = log.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                log.pop_front();
            } else {
                break;
            }
        }
    }

    /// True once even the newest timestamp has left the window
    fn is_idle(&self, log: &VecDeque<Instant>, now: Instant) -> bool {
        log.back()
            .map_or(true, |newest| now.saturating_duration_since(*newest) >= self.window)
    }

    /// Time until the oldest entry leaves the window
    fn until_oldest_expires(&self, log: &VecDeque<Instant>, now: Instant) -> Duration {
        log.front()
            .map(|oldest| self.window.saturating_sub(now.saturating_duration_since(*oldest)))
            .unwrap_or(self.window)
    }

    fn decide(&self, log: &mut VecDeque<Instant>, consume: bool) -> RateLimitDecision {
        let now = Instant::now();
        self.evict(log, now);

        if (log.len() as u64) < self.limit {
            if consume {
                log.push_back(now);
            }
            let remaining = self.limit - log.len() as u64;
            RateLimitDecision::allowed(remaining, self.limit, self.until_oldest_expires(log, now))
        } else {
            let retry_after = self.until_oldest_expires(log, now);
            RateLimitDecision::denied(self.limit, retry_after, retry_after)
        }
    }
}

#[async_trait]
impl RateLimitAlgorithm for SlidingWindow {
    async fn check_and_record(&self, key: &str) -> Result<RateLimitDecision> {
        let mut logs = lock(&self.logs);
        let log = logs.entry(key, Instant::now(), |l, now| self.is_idle(l, now), VecDeque::new);
        Ok(self.decide(log, true))
    }

    async fn peek(&self, key: &str) -> Result<RateLimitDecision> {
        let mut logs = lock(&self.logs);
        match logs.get_mut(key) {
            Some(log) => Ok(self.decide(log, false)),
            None => Ok(self.decide(&mut VecDeque::new(), false)),
        }
    }

    async fn reset(&self, key: &str) -> Result<()> {
        lock(&self.logs).remove(key);
        Ok(())
    }

    fn cleanup_idle(&self) -> usize {
        lock(&self.logs).sweep(Instant::now(), |l, now| self.is_idle(l, now))
    }

    fn tracked_keys(&self) -> usize {
        lock(&self.logs).len()
    }
}
