// src/resilience/mod.rs
//! Protective wrappers around calls to downstream dependencies.
//!
//! Each component owns its own synchronisation and can be used on its own or
//! composed by [`crate::runtime::ResilienceRuntime`].

mod bulkhead;
mod circuit_breaker;
mod retry;
mod timeout;

#[cfg(test)]
mod tests;

pub use bulkhead::{Bulkhead, BulkheadManager, BulkheadMetrics, BulkheadPermit};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerMetrics, CircuitBreakerState, CircuitState};
pub use retry::RetryHandler;
pub use timeout::{TimeoutManager, TimeoutScope};
