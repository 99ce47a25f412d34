use dotenv::dotenv;
use resilience_engine::error::{ServiceError, ServiceErrorCode};
use resilience_engine::events::TracingEmitter;
use resilience_engine::logging;
use resilience_engine::{init_logging, CancellationToken, EngineConfig, EventPublisher, ResilienceRuntime};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

const DEMO_POLICIES: &str = r#"[
    {
        "name": "payments",
        "circuit_breaker": { "failure_threshold": 3, "success_threshold": 1, "open_timeout": 5000 },
        "retry": { "max_attempts": 3, "initial_delay": 50, "max_delay": 1000, "multiplier": 2.0, "jitter": 0.1 },
        "timeout": { "default": 500 },
        "rate_limit": { "algorithm": "token_bucket", "limit": 5, "window": 1000 },
        "bulkhead": { "max_concurrent": 4, "max_queue": 8, "queue_timeout": 100 }
    }
]"#;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    match std::env::var("RESILIENCE_LOG_FORMAT").as_deref() {
        Ok("json") => logging::init_json(),
        _ => init_logging(),
    }

    let config = EngineConfig::from_env()?;
    info!(service = %config.service_name, "Resilience engine starting up");

    let runtime = ResilienceRuntime::new(config, EventPublisher::new(Arc::new(TracingEmitter)));

    let policies = match std::env::args().nth(1) {
        Some(path) => {
            debug!(path = %path, "Loading policies from file");
            std::fs::read_to_string(path)?
        }
        None => DEMO_POLICIES.to_string(),
    };
    let loaded = runtime.engine().load_json(&policies)?;
    let names: Vec<String> = runtime.engine().list_policies().iter().map(|p| p.name.clone()).collect();
    info!(count = loaded, policies = ?names, "Policies loaded");

    // First attempt fails, the retry recovers it
    let calls = Arc::new(AtomicU32::new(0));
    let ctx = CancellationToken::new();
    for request in 0..3 {
        let calls = Arc::clone(&calls);
        let result = runtime
            .execute("payments", "charge", &ctx, move |_token| {
                let attempt = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        Err(ServiceError::new(ServiceErrorCode::Unavailable, "warming up").into())
                    } else {
                        Ok(format!("receipt-{}", attempt))
                    }
                }
            })
            .await;

        match result {
            Ok(receipt) => info!(request, receipt = %receipt, "Charge succeeded"),
            Err(e) => {
                let status = e.status();
                warn!(request, error = %e, http = status.http, grpc = status.grpc, "Charge failed");
            }
        }
    }

    let instances = runtime.instances("payments")?;
    if let Some(breaker) = &instances.circuit_breaker {
        info!(state = %breaker.state(), metrics = ?breaker.metrics(), "Circuit breaker");
    }
    info!(bulkheads = ?runtime.bulkheads().all_metrics(), "Bulkheads");

    Ok(())
}
