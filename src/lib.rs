// library entry
pub mod algorithms;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod policy;
pub mod rand_source;
pub mod resilience;
pub mod runtime;

#[cfg(test)]
pub(crate) mod test_utils;

#[cfg(test)]
mod tests;

// Re-export key components for convenience
pub use algorithms::{RateLimitAlgorithm, RateLimitDecision, RateLimitHeaders, RateLimiter};
pub use config::{EngineConfig, ResiliencePolicy};
pub use error::{ErrorKind, ResilienceError, Result};
pub use events::{EventEmitter, EventPublisher, ResilienceEvent};
pub use logging::init as init_logging;
pub use policy::{PolicyEngine, PolicyEvent, PolicyEventType};
pub use runtime::ResilienceRuntime;
pub use tokio_util::sync::CancellationToken;
