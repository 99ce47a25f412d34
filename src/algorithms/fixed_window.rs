// src/algorithms/fixed_window.rs

use async_trait::async_trait;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::algorithms::{lock, KeyedState, RateLimitAlgorithm, RateLimitDecision};
use crate::error::Result;

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u64,
    started: Instant,
}

/// Fixed Window rate limiting algorithm
///
/// Counts requests in consecutive windows of fixed length. A key's first window
/// starts with its first request; the count drops to zero once the window has
/// fully elapsed, at which point the key can also be swept.
#[derive(Debug)]
pub struct FixedWindow {
    limit: u64,
    window: Duration,
    windows: Mutex<KeyedState<Window>>,
}

impl FixedWindow {
    pub fn new(limit: u64, window: Duration) -> Self {
        Self {
            limit,
            window,
            windows: Mutex::new(KeyedState::new(window)),
        }
    }

    fn decide(&self, window: &mut Window, consume: bool) -> RateLimitDecision {
        let now = Instant::now();
        if now.saturating_duration_since(window.started) >= self.window {
            window.count = 0;
            window.started = now;
        }
        let reset_after = self
            .window
            .saturating_sub(now.saturating_duration_since(window.started));

        if window.count < self.limit {
            if consume {
                window.count += 1;
            }
            RateLimitDecision::allowed(self.limit - window.count, self.limit, reset_after)
        } else {
            RateLimitDecision::denied(self.limit, reset_after, reset_after)
        }
    }

    fn is_idle(&self, window: &Window, now: Instant) -> bool {
        now.saturating_duration_since(window.started) >= self.window
    }

    fn fresh() -> Window {
        Window {
            count: 0,
            started: Instant::now(),
        }
    }
}

#[async_trait]
impl RateLimitAlgorithm for FixedWindow {
    async fn check_and_record(&self, key: &str) -> Result<RateLimitDecision> {
        let mut windows = lock(&self.windows);
        let window = windows.entry(key, Instant::now(), |w, now| self.is_idle(w, now), Self::fresh);
        Ok(self.decide(window, true))
    }

    async fn peek(&self, key: &str) -> Result<RateLimitDecision> {
        let windows = lock(&self.windows);
        let mut window = windows.get(key).copied().unwrap_or_else(Self::fresh);
        Ok(self.decide(&mut window, false))
    }

    async fn reset(&self, key: &str) -> Result<()> {
        lock(&self.windows).remove(key);
        Ok(())
    }

    fn cleanup_idle(&self) -> usize {
        lock(&self.windows).sweep(Instant::now(), |w, now| self.is_idle(w, now))
    }

    fn tracked_keys(&self) -> usize {
        lock(&self.windows).len()
    }
}
