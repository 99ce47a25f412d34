use std::sync::Once;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// Ensure initialization happens only once
static INIT: Once = Once::new();

/// Initialize the logging system with sensible defaults.
///
/// Log level can be set using the RUST_LOG environment variable.
/// Example: RUST_LOG=debug,resilience_engine=trace
pub fn init() {
    INIT.call_once(|| {
        // Default to 'info' level if not specified
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true) // Useful for debugging concurrency issues
                    .with_line_number(true),
            )
            .init();

        tracing::info!("Logging initialized");
    });
}

/// Same as [`init`] but emits one JSON object per line, for log shippers
pub fn init_json() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_current_span(false))
            .init();

        tracing::info!("JSON logging initialized");
    });
}

/// Macro for logging circuit breaker transitions
#[macro_export]
macro_rules! circuit_transition {
    ($service:expr, $from:expr, $to:expr, $failures:expr, $successes:expr) => {
        tracing::info!(
            service = %$service,
            from = %$from,
            to = %$to,
            failure_count = $failures,
            success_count = $successes,
            "Circuit breaker transition"
        )
    };
}

/// Macro for logging rate limiting decisions
#[macro_export]
macro_rules! rate_limit_event {
    ($key:expr, $allowed:expr, $remaining:expr, $limit:expr, $retry_after_ms:expr) => {
        tracing::debug!(
            key = %$key,
            allowed = $allowed,
            remaining = $remaining,
            limit = $limit,
            retry_after_ms = $retry_after_ms,
            "Rate limit check"
        )
    };
}
