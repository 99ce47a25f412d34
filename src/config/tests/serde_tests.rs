// src/config/tests/serde_tests.rs

use std::time::Duration;
use tokio_test::assert_err;

use crate::config::{
    AlgorithmKind, BulkheadConfig, CircuitBreakerConfig, EngineConfig, RateLimitConfig, ResiliencePolicy, RetryConfig,
    TimeoutConfig,
};
use crate::error::{ErrorKind, ServiceErrorCode};

fn full_policy() -> ResiliencePolicy {
    let mut timeout = TimeoutConfig::default();
    timeout.per_operation.insert("export".to_string(), Duration::from_secs(90));

    ResiliencePolicy::new("billing")
        .with_circuit_breaker(CircuitBreakerConfig::default())
        .with_retry(RetryConfig::default())
        .with_timeout(timeout)
        .with_rate_limit(RateLimitConfig {
            algorithm: AlgorithmKind::SlidingWindow,
            ..Default::default()
        })
        .with_bulkhead(BulkheadConfig::default())
}

#[test]
fn test_policy_json_round_trip() {
    let policy = full_policy();
    let json = policy.to_json().unwrap();
    let parsed = ResiliencePolicy::from_json(&json).unwrap();
    assert_eq!(parsed, policy);
}

#[test]
fn test_durations_serialise_as_millis() {
    let value: serde_json::Value = serde_json::from_str(&full_policy().to_json().unwrap()).unwrap();

    assert_eq!(value["circuit_breaker"]["open_timeout"], 30_000);
    assert_eq!(value["retry"]["initial_delay"], 100);
    assert_eq!(value["timeout"]["max"], 300_000);
    assert_eq!(value["timeout"]["per_operation"]["export"], 90_000);
    assert_eq!(value["rate_limit"]["algorithm"], "sliding_window");
    assert_eq!(value["retry"]["retryable_error_codes"][0], "timeout");
}

#[test]
fn test_sub_millisecond_durations_survive_round_trip() {
    let mut timeout = TimeoutConfig {
        default: Duration::from_micros(1_500),
        ..TimeoutConfig::default()
    };
    timeout.per_operation.insert("ping".to_string(), Duration::from_nanos(2_000_250));
    let policy = ResiliencePolicy::new("fast").with_timeout(timeout);
    policy.validate().unwrap();

    let json = policy.to_json().unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(value["timeout"]["default"], 1.5);

    let parsed = ResiliencePolicy::from_json(&json).unwrap();
    assert_eq!(parsed, policy);
    let parsed_timeout = parsed.timeout.unwrap();
    assert_eq!(parsed_timeout.default, Duration::from_micros(1_500));
    assert_eq!(parsed_timeout.per_operation["ping"], Duration::from_nanos(2_000_250));
}

#[test]
fn test_fractional_and_negative_millis_on_input() {
    let policy = ResiliencePolicy::from_json(
        r#"{"name": "p", "retry": {"max_attempts": 2, "initial_delay": 0.25, "max_delay": 10}}"#,
    )
    .unwrap();
    assert_eq!(policy.retry.unwrap().initial_delay, Duration::from_micros(250));

    assert_err!(ResiliencePolicy::from_json(
        r#"{"name": "p", "retry": {"max_attempts": 2, "initial_delay": -5, "max_delay": 10}}"#,
    ));
}

#[test]
fn test_absent_sections_stay_absent() {
    let json = ResiliencePolicy::new("minimal").to_json().unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();

    assert!(value.get("circuit_breaker").is_none());
    assert!(value.get("service_pattern").is_none());
    assert_eq!(value["version"], 0);
}

#[test]
fn test_field_defaults_apply_when_omitted() {
    let policy = ResiliencePolicy::from_json(
        r#"{
            "name": "p",
            "retry": {"max_attempts": 4, "initial_delay": 50, "max_delay": 1000},
            "rate_limit": {"limit": 10, "window": 1000}
        }"#,
    )
    .unwrap();

    let retry = policy.retry.unwrap();
    assert_eq!(retry.multiplier, 2.0);
    assert_eq!(retry.jitter, 0.0);
    assert!(retry.retryable_error_codes.contains(&ServiceErrorCode::Unavailable));
    assert_eq!(retry.retryable_error_codes.len(), 3);

    let rate_limit = policy.rate_limit.unwrap();
    assert_eq!(rate_limit.algorithm, AlgorithmKind::TokenBucket);
    assert_eq!(rate_limit.burst_size, 0);
}

#[test]
fn test_malformed_json_is_internal_error() {
    let err = ResiliencePolicy::from_json("{not json").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Internal);
}

#[test]
fn test_engine_config_from_env() {
    std::env::set_var("RESILIENCE_SERVICE_NAME", "edge-gateway");
    std::env::set_var("RESILIENCE_WATCH_CAPACITY", "64");
    std::env::set_var("RESILIENCE_BULKHEAD_MAX_CONCURRENT", "4");
    std::env::set_var("RESILIENCE_BULKHEAD_MAX_QUEUE", "0");
    std::env::set_var("RESILIENCE_BULKHEAD_QUEUE_TIMEOUT_MS", "250");

    let config = EngineConfig::from_env().unwrap();
    assert_eq!(config.service_name, "edge-gateway");
    assert_eq!(config.watch_capacity, 64);
    assert_eq!(config.default_bulkhead.max_concurrent, 4);
    assert_eq!(config.default_bulkhead.max_queue, 0);
    assert_eq!(config.default_bulkhead.queue_timeout, Duration::from_millis(250));

    std::env::set_var("RESILIENCE_WATCH_CAPACITY", "lots");
    assert_err!(EngineConfig::from_env());

    std::env::set_var("RESILIENCE_WATCH_CAPACITY", "64");
    std::env::set_var("RESILIENCE_BULKHEAD_MAX_CONCURRENT", "0");
    assert_err!(EngineConfig::from_env());

    for key in [
        "RESILIENCE_SERVICE_NAME",
        "RESILIENCE_WATCH_CAPACITY",
        "RESILIENCE_BULKHEAD_MAX_CONCURRENT",
        "RESILIENCE_BULKHEAD_MAX_QUEUE",
        "RESILIENCE_BULKHEAD_QUEUE_TIMEOUT_MS",
    ] {
        std::env::remove_var(key);
    }
    let defaults = EngineConfig::from_env().unwrap();
    assert_eq!(defaults.service_name, "resilience-engine");
    assert_eq!(defaults.watch_capacity, 1024);
}
