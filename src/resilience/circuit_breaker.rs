use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::CircuitBreakerConfig;
use crate::error::{ResilienceError, Result};
use crate::events::{EventPublisher, EventType};

/// The state of the circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed, requests flow normally
    Closed,
    /// Circuit is open, requests are failing and not being sent
    Open,
    /// Circuit is partially open, allowing a limited number of requests to test recovery
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a breaker, suitable for persisting or exporting.
///
/// `version` increases on every transition so external callers can detect
/// concurrent changes between two reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub service_name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub last_state_change: DateTime<Utc>,
    pub version: u64,
}

/// Lifetime counters of a breaker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CircuitBreakerMetrics {
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    /// Consecutive failures while closed
    failure_count: u32,
    /// Successes while half-open
    success_count: u32,
    opened_at: Option<Instant>,
    last_failure_time: Option<DateTime<Utc>>,
    last_state_change: DateTime<Utc>,
    version: u64,
    /// Probes currently running in half-open state
    probes_in_flight: u32,
    metrics: CircuitBreakerMetrics,
}

#[derive(Debug, Clone, Copy)]
struct Transition {
    from: CircuitState,
    to: CircuitState,
    failure_count: u32,
    success_count: u32,
    version: u64,
}

impl Inner {
    fn transition(&mut self, to: CircuitState) -> Transition {
        let from = self.state;
        let transition = Transition {
            from,
            to,
            failure_count: self.failure_count,
            success_count: self.success_count,
            version: self.version + 1,
        };

        self.state = to;
        self.version += 1;
        self.last_state_change = Utc::now();
        self.probes_in_flight = 0;
        match to {
            CircuitState::Open => {
                self.opened_at = Some(Instant::now());
                self.success_count = 0;
            }
            CircuitState::HalfOpen => {
                self.success_count = 0;
            }
            CircuitState::Closed => {
                self.opened_at = None;
                self.failure_count = 0;
                self.success_count = 0;
            }
        }
        transition
    }
}

/// Ticket handed out when a call is admitted.
///
/// Outcomes only count against the state the call was admitted under; a call that
/// finishes after the breaker moved on is ignored. Dropping a probe ticket frees
/// its half-open slot even if the operation future was abandoned.
struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    version: u64,
    probe: bool,
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if !self.probe {
            return;
        }
        let mut inner = self.breaker.lock();
        if inner.version == self.version && inner.probes_in_flight > 0 {
            inner.probes_in_flight -= 1;
        }
    }
}

/// Circuit breaker implementation
///
/// All state lives behind one mutex, so transitions are linearizable: two
/// concurrent outcomes can never double-count or lose an update. The mutex is
/// never held across an await point or while events are emitted.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    events: EventPublisher,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("inner", &*self.lock())
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_events(config, EventPublisher::noop())
    }

    /// Create a circuit breaker that publishes its transitions
    pub fn with_events(config: CircuitBreakerConfig, events: EventPublisher) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at: None,
                last_failure_time: None,
                last_state_change: Utc::now(),
                version: 0,
                probes_in_flight: 0,
                metrics: CircuitBreakerMetrics::default(),
            }),
            events,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Inner is always left consistent, so a poisoned lock is still usable
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Lazy Open -> HalfOpen transition once the open timeout has elapsed
    fn refresh(&self, inner: &mut Inner) -> Option<Transition> {
        if inner.state != CircuitState::Open {
            return None;
        }
        let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or(Duration::MAX);
        if elapsed >= self.config.open_timeout {
            Some(inner.transition(CircuitState::HalfOpen))
        } else {
            None
        }
    }

    fn remaining_open(&self, inner: &Inner) -> Duration {
        inner
            .opened_at
            .map(|t| self.config.open_timeout.saturating_sub(t.elapsed()))
            .unwrap_or_default()
    }

    fn publish(&self, transition: Transition) {
        crate::circuit_transition!(
            self.config.name,
            transition.from,
            transition.to,
            transition.failure_count,
            transition.success_count
        );
        if transition.to == CircuitState::Open {
            warn!(
                service = %self.config.name,
                failure_count = transition.failure_count,
                "Circuit breaker opened"
            );
        }

        let event = self
            .events
            .event(EventType::CircuitStateChange, &self.config.name)
            .with_metadata("previous_state", transition.from.as_str())
            .with_metadata("new_state", transition.to.as_str())
            .with_metadata("failure_count", transition.failure_count)
            .with_metadata("success_count", transition.success_count)
            .with_metadata("version", transition.version);
        self.events.publish(event);
    }

    fn admit(&self) -> Result<Admission<'_>> {
        let mut inner = self.lock();
        let transition = self.refresh(&mut inner);

        let outcome = match inner.state {
            CircuitState::Closed => Ok((inner.version, false)),
            CircuitState::Open => {
                inner.metrics.total_rejections += 1;
                Err(ResilienceError::CircuitOpen {
                    service: self.config.name.clone(),
                    reset_after: self.remaining_open(&inner),
                })
            }
            CircuitState::HalfOpen => {
                if inner.probes_in_flight < self.config.half_open_max_calls {
                    inner.probes_in_flight += 1;
                    Ok((inner.version, true))
                } else {
                    inner.metrics.total_rejections += 1;
                    debug!(
                        service = %self.config.name,
                        probes = inner.probes_in_flight,
                        "Half-open probe limit reached"
                    );
                    Err(ResilienceError::CircuitOpen {
                        service: self.config.name.clone(),
                        reset_after: Duration::ZERO,
                    })
                }
            }
        };
        drop(inner);

        if let Some(transition) = transition {
            self.publish(transition);
        }

        outcome.map(|(version, probe)| Admission {
            breaker: self,
            version,
            probe,
        })
    }

    /// Check if the circuit breaker would admit a request right now
    pub fn allow_request(&self) -> bool {
        let mut inner = self.lock();
        let transition = self.refresh(&mut inner);
        let allowed = match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => inner.probes_in_flight < self.config.half_open_max_calls,
        };
        drop(inner);

        if let Some(transition) = transition {
            self.publish(transition);
        }
        allowed
    }

    /// Run `operation` under breaker protection.
    ///
    /// An open circuit fails fast with [`ResilienceError::CircuitOpen`] and the
    /// operation is never invoked. Otherwise the operation's own result is returned
    /// unchanged after its outcome has been recorded. Caller cancellation is
    /// neither a success nor a failure of the dependency.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let admission = self.admit()?;
        let result = operation().await;

        match &result {
            Ok(_) => self.on_success(admission.version),
            Err(ResilienceError::Cancelled) => {}
            Err(_) => self.on_failure(admission.version),
        }
        drop(admission);

        result
    }

    fn on_success(&self, admitted_version: u64) {
        let mut inner = self.lock();
        inner.metrics.total_successes += 1;
        if inner.version != admitted_version {
            return;
        }
        let transition = Self::apply_success(&self.config, &mut inner);
        drop(inner);

        if let Some(transition) = transition {
            self.publish(transition);
        }
    }

    fn on_failure(&self, admitted_version: u64) {
        let mut inner = self.lock();
        inner.metrics.total_failures += 1;
        inner.last_failure_time = Some(Utc::now());
        if inner.version != admitted_version {
            return;
        }
        let transition = Self::apply_failure(&self.config, &mut inner);
        drop(inner);

        if let Some(transition) = transition {
            self.publish(transition);
        }
    }

    fn apply_success(config: &CircuitBreakerConfig, inner: &mut Inner) -> Option<Transition> {
        match inner.state {
            CircuitState::Closed => {
                // Reset failure count on success
                inner.failure_count = 0;
                None
            }
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= config.success_threshold {
                    Some(inner.transition(CircuitState::Closed))
                } else {
                    None
                }
            }
            CircuitState::Open => None,
        }
    }

    fn apply_failure(config: &CircuitBreakerConfig, inner: &mut Inner) -> Option<Transition> {
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= config.failure_threshold {
                    Some(inner.transition(CircuitState::Open))
                } else {
                    None
                }
            }
            // Any failure in half-open state opens the circuit again
            CircuitState::HalfOpen => Some(inner.transition(CircuitState::Open)),
            CircuitState::Open => None,
        }
    }

    /// Record a successful operation against the current state
    pub fn record_success(&self) {
        let mut inner = self.lock();
        let refreshed = self.refresh(&mut inner);
        inner.metrics.total_successes += 1;
        let transition = Self::apply_success(&self.config, &mut inner);
        drop(inner);

        for transition in [refreshed, transition].into_iter().flatten() {
            self.publish(transition);
        }
    }

    /// Record a failed operation against the current state
    pub fn record_failure(&self) {
        let mut inner = self.lock();
        let refreshed = self.refresh(&mut inner);
        inner.metrics.total_failures += 1;
        inner.last_failure_time = Some(Utc::now());
        let transition = Self::apply_failure(&self.config, &mut inner);
        drop(inner);

        for transition in [refreshed, transition].into_iter().flatten() {
            self.publish(transition);
        }
    }

    /// Force the circuit closed and clear its counters
    pub fn reset(&self) {
        let mut inner = self.lock();
        let transition = if inner.state != CircuitState::Closed {
            Some(inner.transition(CircuitState::Closed))
        } else {
            inner.failure_count = 0;
            inner.success_count = 0;
            None
        };
        drop(inner);

        if let Some(transition) = transition {
            self.publish(transition);
        }
    }

    /// Current state, applying the lazy half-open transition if it is due
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        let transition = self.refresh(&mut inner);
        let state = inner.state;
        drop(inner);

        if let Some(transition) = transition {
            self.publish(transition);
        }
        state
    }

    pub fn full_state(&self) -> CircuitBreakerState {
        let mut inner = self.lock();
        let transition = self.refresh(&mut inner);
        let snapshot = CircuitBreakerState {
            service_name: self.config.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_failure_time: inner.last_failure_time,
            last_state_change: inner.last_state_change,
            version: inner.version,
        };
        drop(inner);

        if let Some(transition) = transition {
            self.publish(transition);
        }
        snapshot
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        self.lock().metrics
    }
}
