use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{error, warn};

use crate::config::TimeoutConfig;
use crate::error::{ResilienceError, Result};
use crate::events::{EventPublisher, EventType};

/// A cancellation scope that expires at `deadline`.
///
/// The token is cancelled when the deadline passes, when the parent is cancelled,
/// or when the scope is dropped.
#[derive(Debug)]
pub struct TimeoutScope {
    token: CancellationToken,
    timeout: Duration,
    deadline: Instant,
    _guard: DropGuard,
}

impl TimeoutScope {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }
}

/// Enforces per-operation deadlines with cooperative cancellation
#[derive(Debug, Clone)]
pub struct TimeoutManager {
    service: String,
    config: TimeoutConfig,
    events: EventPublisher,
}

impl TimeoutManager {
    pub fn new(service: impl Into<String>, config: TimeoutConfig) -> Self {
        Self {
            service: service.into(),
            config,
            events: EventPublisher::noop(),
        }
    }

    pub fn with_events(mut self, events: EventPublisher) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &TimeoutConfig {
        &self.config
    }

    /// Per-operation override if present, else the default, capped by `max`
    pub fn get_timeout(&self, operation: &str) -> Duration {
        let timeout = self
            .config
            .per_operation
            .get(operation)
            .copied()
            .unwrap_or(self.config.default);
        match self.config.max {
            Some(max) => timeout.min(max),
            None => timeout,
        }
    }

    /// Child scope of `parent` that cancels itself after the operation's timeout.
    /// Must be called from within a tokio runtime.
    pub fn with_timeout(&self, parent: &CancellationToken, operation: &str) -> TimeoutScope {
        let timeout = self.get_timeout(operation);
        let token = parent.child_token();
        let deadline = Instant::now() + timeout;

        let timer = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = timer.cancelled() => {}
                _ = tokio::time::sleep_until(deadline) => timer.cancel(),
            }
        });

        TimeoutScope {
            _guard: token.clone().drop_guard(),
            token,
            timeout,
            deadline,
        }
    }

    /// Run `operation` on its own task and wait for it until the deadline.
    ///
    /// The task receives a child of `ctx` that is cancelled when the deadline
    /// passes. It is never aborted: an operation that ignores its token keeps
    /// running in the background after [`ResilienceError::Timeout`] is returned.
    pub async fn execute<F, Fut, T>(&self, ctx: &CancellationToken, operation: &str, f: F) -> Result<T>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        if ctx.is_cancelled() {
            return Err(ResilienceError::Cancelled);
        }

        let timeout = self.get_timeout(operation);
        let child = ctx.child_token();
        let mut handle = tokio::spawn(f(child.clone()));

        tokio::select! {
            biased;
            joined = &mut handle => match joined {
                Ok(result) => result,
                Err(join_err) if join_err.is_panic() => {
                    error!(service = %self.service, operation, "Timed operation panicked");
                    Err(ResilienceError::Internal(format!("operation {} panicked", operation)))
                }
                Err(_) => Err(ResilienceError::Cancelled),
            },
            _ = ctx.cancelled() => {
                child.cancel();
                Err(ResilienceError::Cancelled)
            }
            _ = tokio::time::sleep(timeout) => {
                child.cancel();
                self.publish_timeout(operation, timeout);
                Err(ResilienceError::Timeout {
                    operation: operation.to_string(),
                    timeout,
                })
            }
        }
    }

    fn publish_timeout(&self, operation: &str, timeout: Duration) {
        warn!(
            service = %self.service,
            operation,
            timeout_ms = timeout.as_millis() as u64,
            "Operation timed out"
        );

        let event = self
            .events
            .event(EventType::Timeout, &self.service)
            .with_metadata("operation", operation)
            .with_metadata("timeout_ms", timeout.as_millis() as u64);
        self.events.publish(event);
    }
}
