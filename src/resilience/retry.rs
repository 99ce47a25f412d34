use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::{ResilienceError, Result};
use crate::events::{EventPublisher, EventType};
use crate::rand_source::{CryptoRandSource, RandSource};
use crate::resilience::CircuitBreaker;

/// Retries an operation with exponential backoff and jitter
#[derive(Debug, Clone)]
pub struct RetryHandler {
    service: String,
    config: RetryConfig,
    rand: Arc<dyn RandSource>,
    events: EventPublisher,
}

impl RetryHandler {
    /// Create a handler that draws jitter from the OS-seeded generator
    pub fn new(service: impl Into<String>, config: RetryConfig) -> Self {
        Self {
            service: service.into(),
            config,
            rand: Arc::new(CryptoRandSource::new()),
            events: EventPublisher::noop(),
        }
    }

    pub fn with_rand_source(mut self, rand: Arc<dyn RandSource>) -> Self {
        self.rand = rand;
        self
    }

    pub fn with_events(mut self, events: EventPublisher) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delay to wait after the given (1-based) failed attempt.
    ///
    /// `min(initial * multiplier^(attempt-1), max)` scaled into
    /// `[delay * (1 - jitter), delay]` by the random source.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.config.initial_delay.as_nanos() as f64 * self.config.multiplier.powi(exp);
        let capped = base.min(self.config.max_delay.as_nanos() as f64);

        let jitter = self.config.jitter.clamp(0.0, 1.0);
        let factor = 1.0 - jitter + jitter * self.rand.float64();

        let nanos = (capped * factor).round();
        if nanos.is_finite() && nanos >= 0.0 {
            Duration::from_nanos(nanos as u64)
        } else {
            self.config.max_delay
        }
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error, or
    /// `max_attempts` is used up.
    ///
    /// Non-retryable errors are returned unchanged. Exhaustion wraps the last
    /// error in [`ResilienceError::RetryExhausted`]. Cancelling `cancel` aborts the
    /// backoff sleep with [`ResilienceError::Cancelled`].
    pub async fn execute<F, Fut, T>(&self, cancel: &CancellationToken, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(ResilienceError::Cancelled);
            }
            attempt += 1;

            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !self.config.is_retryable(&err) {
                debug!(service = %self.service, attempt, error = %err, "Error is not retryable");
                self.publish_attempt(attempt, max_attempts, None, &err);
                return Err(err);
            }
            if attempt >= max_attempts {
                warn!(
                    service = %self.service,
                    attempts = attempt,
                    error = %err,
                    "Retry attempts exhausted"
                );
                self.publish_attempt(attempt, max_attempts, None, &err);
                return Err(ResilienceError::RetryExhausted {
                    service: self.service.clone(),
                    attempts: attempt,
                    source: Box::new(err),
                });
            }

            let delay = self.calculate_delay(attempt);
            debug!(
                service = %self.service,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying operation"
            );
            self.publish_attempt(attempt, max_attempts, Some(delay), &err);

            tokio::select! {
                _ = cancel.cancelled() => return Err(ResilienceError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Like [`execute`](Self::execute), with every attempt passing through
    /// `breaker`. An open circuit ends the loop at once, since
    /// [`ResilienceError::CircuitOpen`] is never retryable.
    ///
    /// The operation's future is created before admission and dropped unpolled
    /// when the breaker rejects it.
    pub async fn execute_with_circuit_breaker<F, Fut, T>(
        &self,
        cancel: &CancellationToken,
        breaker: &CircuitBreaker,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute(cancel, || {
            let attempt = operation();
            breaker.execute(move || attempt)
        })
        .await
    }

    /// One event per failed attempt. `delay` is the backoff before the next
    /// attempt, `None` when this failure ends the loop.
    fn publish_attempt(&self, attempt: u32, max_attempts: u32, delay: Option<Duration>, err: &ResilienceError) {
        let event = self
            .events
            .event(EventType::RetryAttempt, &self.service)
            .with_metadata("attempt", attempt)
            .with_metadata("max_attempts", max_attempts)
            .with_metadata("will_retry", delay.is_some())
            .with_metadata("delay_ms", delay.unwrap_or_default().as_millis() as u64)
            .with_metadata("error", err.to_string());
        self.events.publish(event);
    }
}
