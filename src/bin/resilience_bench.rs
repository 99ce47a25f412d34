// src/bin/resilience_bench.rs

use indicatif::{ProgressBar, ProgressStyle};
use prettytable::{row, Table};
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use structopt::StructOpt;
use tokio::sync::{Barrier, Mutex};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use resilience_engine::config::{
    AlgorithmKind, BulkheadConfig, CircuitBreakerConfig, RateLimitConfig, ResiliencePolicy, RetryConfig,
    TimeoutConfig,
};
use resilience_engine::error::{ServiceError, ServiceErrorCode};
use resilience_engine::{CancellationToken, EngineConfig, EventPublisher, ResilienceRuntime};

const POLICY: &str = "bench";

#[derive(Debug, Clone, StructOpt)]
#[structopt(
    name = "resilience_bench",
    about = "Drives a resilience policy with a simulated flaky dependency"
)]
struct Opt {
    /// Number of concurrent workers
    #[structopt(short = "u", long, default_value = "20")]
    workers: usize,

    /// Calls made by each worker
    #[structopt(short = "r", long, default_value = "200")]
    requests_per_worker: usize,

    /// Probability that a simulated call fails with `unavailable`
    #[structopt(short, long, default_value = "0.2")]
    failure_rate: f64,

    /// Simulated call latency in milliseconds
    #[structopt(short, long, default_value = "2")]
    latency_ms: u64,

    /// Per-call timeout in milliseconds
    #[structopt(short, long, default_value = "50")]
    timeout_ms: u64,

    /// Retry attempts, 1 disables retrying
    #[structopt(long, default_value = "3")]
    max_attempts: u32,

    /// Consecutive failures that open the circuit
    #[structopt(long, default_value = "10")]
    failure_threshold: u32,

    /// Bulkhead slots
    #[structopt(long, default_value = "8")]
    max_concurrent: usize,

    /// Bulkhead wait queue
    #[structopt(long, default_value = "16")]
    max_queue: usize,

    /// Rate limit algorithm
    #[structopt(short, long, possible_values = &["token_bucket", "sliding_window", "fixed_window", "leaky_bucket", "none"], default_value = "none")]
    algorithm: String,

    /// Requests per second allowed per worker when rate limiting
    #[structopt(long, default_value = "500")]
    rate_limit: u64,

    /// Verbosity level
    #[structopt(short, long, parse(from_occurrences))]
    verbose: usize,
}

fn build_policy(opt: &Opt) -> Result<ResiliencePolicy, Box<dyn std::error::Error>> {
    let mut policy = ResiliencePolicy::new(POLICY)
        .with_circuit_breaker(CircuitBreakerConfig {
            failure_threshold: opt.failure_threshold,
            success_threshold: 2,
            open_timeout: Duration::from_millis(200),
            ..CircuitBreakerConfig::default()
        })
        .with_timeout(TimeoutConfig {
            default: Duration::from_millis(opt.timeout_ms),
            ..TimeoutConfig::default()
        })
        .with_bulkhead(BulkheadConfig {
            name: String::new(),
            max_concurrent: opt.max_concurrent,
            max_queue: opt.max_queue,
            queue_timeout: Duration::from_millis(opt.timeout_ms),
        });

    if opt.max_attempts > 1 {
        policy = policy.with_retry(RetryConfig {
            max_attempts: opt.max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(20),
            jitter: 0.2,
            ..RetryConfig::default()
        });
    }

    let algorithm = match opt.algorithm.as_str() {
        "token_bucket" => Some(AlgorithmKind::TokenBucket),
        "sliding_window" => Some(AlgorithmKind::SlidingWindow),
        "fixed_window" => Some(AlgorithmKind::FixedWindow),
        "leaky_bucket" => Some(AlgorithmKind::LeakyBucket),
        "none" => None,
        other => return Err(format!("Unknown algorithm: {}", other).into()),
    };
    if let Some(algorithm) = algorithm {
        policy = policy.with_rate_limit(RateLimitConfig {
            algorithm,
            limit: opt.rate_limit,
            window: Duration::from_secs(1),
            burst_size: 0,
            refill_rate: 0.0,
        });
    }

    policy.validate()?;
    Ok(policy)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    let opt = Opt::from_args();

    let log_level = match opt.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::new(format!(
            "resilience_bench={},resilience_engine={}",
            log_level, log_level
        )))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        ctrlc::set_handler(move || stop.store(true, Ordering::SeqCst))?;
    }

    let runtime = Arc::new(ResilienceRuntime::new(EngineConfig::from_env()?, EventPublisher::noop()));
    runtime.engine().update_policy(build_policy(&opt)?)?;
    info!(workers = opt.workers, requests = opt.requests_per_worker, "Starting benchmark");

    let total = (opt.workers * opt.requests_per_worker) as u64;
    let progress = ProgressBar::new(total);
    progress.set_style(
        ProgressStyle::with_template("{spinner} [{elapsed_precise}] {bar:40} {pos}/{len} {per_sec}")?
            .progress_chars("=> "),
    );

    let outcomes: Arc<Mutex<BTreeMap<String, u64>>> = Arc::new(Mutex::new(BTreeMap::new()));
    let latencies: Arc<Mutex<Vec<Duration>>> = Arc::new(Mutex::new(Vec::with_capacity(total as usize)));
    let barrier = Arc::new(Barrier::new(opt.workers));
    let started = Instant::now();

    let mut handles = Vec::with_capacity(opt.workers);
    for worker in 0..opt.workers {
        let runtime = Arc::clone(&runtime);
        let outcomes = Arc::clone(&outcomes);
        let latencies = Arc::clone(&latencies);
        let barrier = Arc::clone(&barrier);
        let progress = progress.clone();
        let stop = Arc::clone(&stop);
        let opt = opt.clone();

        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            let operation = format!("worker_{}", worker);
            let ctx = CancellationToken::new();

            for _ in 0..opt.requests_per_worker {
                if stop.load(Ordering::SeqCst) {
                    break;
                }

                let failure_rate = opt.failure_rate;
                let latency = Duration::from_millis(opt.latency_ms);
                let call_started = Instant::now();
                let result = runtime
                    .execute(POLICY, &operation, &ctx, move |token| async move {
                        tokio::select! {
                            _ = token.cancelled() => return Err(resilience_engine::ResilienceError::Cancelled),
                            _ = tokio::time::sleep(latency) => {}
                        }
                        if rand::rng().random::<f64>() < failure_rate {
                            Err(ServiceError::new(ServiceErrorCode::Unavailable, "simulated outage").into())
                        } else {
                            Ok(())
                        }
                    })
                    .await;
                let elapsed = call_started.elapsed();

                let label = match &result {
                    Ok(()) => "ok".to_string(),
                    Err(err) => format!("{:?}", err.kind()),
                };
                *outcomes.lock().await.entry(label).or_insert(0) += 1;
                latencies.lock().await.push(elapsed);
                progress.inc(1);
            }
        }));
    }

    for handle in futures::future::join_all(handles).await {
        if let Err(e) = handle {
            warn!("Worker failed: {}", e);
        }
    }
    progress.finish_and_clear();
    let elapsed = started.elapsed();

    if stop.load(Ordering::SeqCst) {
        println!("Interrupted, reporting partial results");
    }
    print_summary(&runtime, &*outcomes.lock().await, &mut latencies.lock().await, elapsed)?;
    Ok(())
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let index = ((sorted.len() - 1) as f64 * p).round() as usize;
    sorted[index.min(sorted.len() - 1)]
}

fn print_summary(
    runtime: &ResilienceRuntime,
    outcomes: &BTreeMap<String, u64>,
    latencies: &mut [Duration],
    elapsed: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    let completed: u64 = outcomes.values().sum();

    let mut table = Table::new();
    table.add_row(row!["Outcome", "Count", "Share"]);
    for (label, count) in outcomes {
        let share = 100.0 * *count as f64 / completed.max(1) as f64;
        table.add_row(row![label, count, format!("{:.1}%", share)]);
    }
    table.printstd();

    latencies.sort_unstable();
    let mut stats = Table::new();
    stats.add_row(row!["Metric", "Value"]);
    stats.add_row(row!["Calls", completed]);
    stats.add_row(row!["Wall time", format!("{:?}", elapsed)]);
    stats.add_row(row![
        "Throughput",
        format!("{:.0} calls/s", completed as f64 / elapsed.as_secs_f64().max(f64::EPSILON))
    ]);
    stats.add_row(row!["p50", format!("{:?}", percentile(latencies, 0.50))]);
    stats.add_row(row!["p99", format!("{:?}", percentile(latencies, 0.99))]);

    let instances = runtime.instances(POLICY)?;
    if let Some(breaker) = &instances.circuit_breaker {
        let metrics = breaker.metrics();
        stats.add_row(row!["Breaker state", breaker.state()]);
        stats.add_row(row!["Breaker rejections", metrics.total_rejections]);
    }
    if let Some(bulkhead) = &instances.bulkhead {
        let metrics = bulkhead.metrics();
        stats.add_row(row!["Bulkhead rejected", metrics.rejected_count]);
        stats.add_row(row!["Bulkhead completed", metrics.completed_count]);
    }
    stats.printstd();

    Ok(())
}
