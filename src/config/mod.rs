// src/config/mod.rs

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use crate::error::{ResilienceError, Result, ServiceErrorCode};

#[cfg(test)]
mod tests;

/// Smallest duration a timeout policy may configure
pub const MIN_TIMEOUT: Duration = Duration::from_millis(1);

/// Largest duration a timeout policy may configure
pub const MAX_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Configuration for a circuit breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Name of the protected dependency
    #[serde(default)]
    pub name: String,

    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,

    /// Successes in half-open state required to close the circuit
    pub success_threshold: u32,

    /// Time spent open before probing
    #[serde(with = "duration_serde")]
    pub open_timeout: Duration,

    /// Concurrent probe calls admitted while half-open
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,
}

fn default_half_open_max_calls() -> u32 {
    3
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(30),
            half_open_max_calls: default_half_open_max_calls(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self, policy: &str) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(invalid(policy, "circuit_breaker.failure_threshold", "must be positive"));
        }
        if self.success_threshold == 0 {
            return Err(invalid(policy, "circuit_breaker.success_threshold", "must be positive"));
        }
        if self.open_timeout.is_zero() {
            return Err(invalid(policy, "circuit_breaker.open_timeout", "must be positive"));
        }
        if self.half_open_max_calls == 0 {
            return Err(invalid(policy, "circuit_breaker.half_open_max_calls", "must be positive"));
        }
        Ok(())
    }
}

/// Configuration for retry with exponential backoff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first call
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(with = "duration_serde")]
    pub initial_delay: Duration,

    /// Upper bound for any single delay
    #[serde(with = "duration_serde")]
    pub max_delay: Duration,

    /// Exponential growth factor
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Fraction of the delay that is randomised, 0.0 to 1.0
    #[serde(default)]
    pub jitter: f64,

    /// Error codes that trigger another attempt
    #[serde(default = "default_retryable_codes")]
    pub retryable_error_codes: BTreeSet<ServiceErrorCode>,
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_retryable_codes() -> BTreeSet<ServiceErrorCode> {
    ServiceErrorCode::RETRYABLE_BY_DEFAULT.into_iter().collect()
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: default_multiplier(),
            jitter: 0.1,
            retryable_error_codes: default_retryable_codes(),
        }
    }
}

impl RetryConfig {
    pub fn validate(&self, policy: &str) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(invalid(policy, "retry.max_attempts", "must be >= 1"));
        }
        if self.initial_delay.is_zero() {
            return Err(invalid(policy, "retry.initial_delay", "must be positive"));
        }
        if self.max_delay < self.initial_delay {
            return Err(invalid(policy, "retry.max_delay", "must be >= initial_delay"));
        }
        if !self.multiplier.is_finite() || self.multiplier <= 1.0 {
            return Err(invalid(policy, "retry.multiplier", "must be > 1.0"));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(invalid(policy, "retry.jitter", "must be in [0, 1]"));
        }
        Ok(())
    }

    /// Whether an error should trigger another attempt under this config.
    ///
    /// An empty code set falls back to the default retryable classification.
    pub fn is_retryable(&self, err: &ResilienceError) -> bool {
        match err.classification() {
            Some(code) if self.retryable_error_codes.is_empty() => code.is_retryable(),
            Some(code) => self.retryable_error_codes.contains(&code),
            None => false,
        }
    }
}

/// Configuration for a bulkhead partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkheadConfig {
    /// Partition name
    #[serde(default)]
    pub name: String,

    /// Slots that may run at once
    pub max_concurrent: usize,

    /// Callers that may wait for a slot
    #[serde(default)]
    pub max_queue: usize,

    /// How long a queued caller waits, zero means no wait
    #[serde(default, with = "duration_serde")]
    pub queue_timeout: Duration,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            max_concurrent: 10,
            max_queue: 100,
            queue_timeout: Duration::from_secs(5),
        }
    }
}

impl BulkheadConfig {
    pub fn validate(&self, policy: &str) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(invalid(policy, "bulkhead.max_concurrent", "must be positive"));
        }
        Ok(())
    }
}

/// Configuration for timeout enforcement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Timeout used when no per-operation override exists
    #[serde(with = "duration_serde")]
    pub default: Duration,

    /// Ceiling applied to every resolved timeout
    #[serde(default, with = "option_duration_serde", skip_serializing_if = "Option::is_none")]
    pub max: Option<Duration>,

    /// Per-operation overrides
    #[serde(default, with = "duration_map_serde")]
    pub per_operation: HashMap<String, Duration>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            default: Duration::from_secs(30),
            max: Some(MAX_TIMEOUT),
            per_operation: HashMap::new(),
        }
    }
}

impl TimeoutConfig {
    pub fn validate(&self, policy: &str) -> Result<()> {
        check_timeout_range(policy, "timeout.default", self.default)?;
        if let Some(max) = self.max {
            check_timeout_range(policy, "timeout.max", max)?;
            if self.default > max {
                return Err(invalid(policy, "timeout.default", "must not exceed timeout.max"));
            }
        }
        // Sorted so the reported field does not depend on map iteration order
        let mut operations: Vec<_> = self.per_operation.iter().collect();
        operations.sort_by(|a, b| a.0.cmp(b.0));
        for (operation, timeout) in operations {
            check_timeout_range(policy, &format!("timeout.per_operation.{}", operation), *timeout)?;
        }
        Ok(())
    }
}

fn check_timeout_range(policy: &str, field: &str, value: Duration) -> Result<()> {
    if value.is_zero() {
        return Err(invalid(policy, field, "must be positive"));
    }
    if value < MIN_TIMEOUT || value > MAX_TIMEOUT {
        return Err(invalid(
            policy,
            field,
            format!("must be within [{:?}, {:?}]", MIN_TIMEOUT, MAX_TIMEOUT),
        ));
    }
    Ok(())
}

/// Rate limiting algorithm selected by a policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlgorithmKind {
    TokenBucket,
    SlidingWindow,
    FixedWindow,
    LeakyBucket,
}

/// Configuration for a rate limiter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_algorithm")]
    pub algorithm: AlgorithmKind,

    /// Requests allowed per window
    pub limit: u64,

    /// Window duration
    #[serde(with = "duration_serde")]
    pub window: Duration,

    /// Bucket capacity for token and leaky buckets, zero means `limit`
    #[serde(default)]
    pub burst_size: u64,

    /// Tokens per second, zero means `limit / window`
    #[serde(default)]
    pub refill_rate: f64,
}

fn default_algorithm() -> AlgorithmKind {
    AlgorithmKind::TokenBucket
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            algorithm: default_algorithm(),
            limit: 100,
            window: Duration::from_secs(60),
            burst_size: 10,
            refill_rate: 0.0,
        }
    }
}

impl RateLimitConfig {
    pub fn validate(&self, policy: &str) -> Result<()> {
        if self.limit == 0 {
            return Err(invalid(policy, "rate_limit.limit", "must be positive"));
        }
        if self.window.is_zero() {
            return Err(invalid(policy, "rate_limit.window", "must be positive"));
        }
        if !self.refill_rate.is_finite() || self.refill_rate < 0.0 {
            return Err(invalid(policy, "rate_limit.refill_rate", "must be >= 0"));
        }
        Ok(())
    }

    /// Bucket capacity used by the bucket algorithms
    pub fn capacity(&self) -> u64 {
        if self.burst_size > 0 {
            self.burst_size
        } else {
            self.limit
        }
    }

    /// Refill (or leak) rate in units per second
    pub fn rate_per_second(&self) -> f64 {
        if self.refill_rate > 0.0 {
            self.refill_rate
        } else {
            self.limit as f64 / self.window.as_secs_f64()
        }
    }
}

/// A named, versioned bundle of protections. Absent sections are disabled.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResiliencePolicy {
    pub name: String,

    /// Assigned by the policy engine on every write
    #[serde(default)]
    pub version: u64,

    /// Service names this policy is meant for, informational only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_pattern: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreakerConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<TimeoutConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bulkhead: Option<BulkheadConfig>,
}

impl ResiliencePolicy {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(config);
        self
    }

    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        self.retry = Some(config);
        self
    }

    pub fn with_timeout(mut self, config: TimeoutConfig) -> Self {
        self.timeout = Some(config);
        self
    }

    pub fn with_rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit = Some(config);
        self
    }

    pub fn with_bulkhead(mut self, config: BulkheadConfig) -> Self {
        self.bulkhead = Some(config);
        self
    }

    /// Structural validation of every section that is present
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(invalid(&self.name, "name", "must not be empty"));
        }
        if let Some(cb) = &self.circuit_breaker {
            cb.validate(&self.name)?;
        }
        if let Some(retry) = &self.retry {
            retry.validate(&self.name)?;
        }
        if let Some(timeout) = &self.timeout {
            timeout.validate(&self.name)?;
        }
        if let Some(rate_limit) = &self.rate_limit {
            rate_limit.validate(&self.name)?;
        }
        if let Some(bulkhead) = &self.bulkhead {
            bulkhead.validate(&self.name)?;
        }
        Ok(())
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parses a JSON array of policies, the shape external loaders hand over
    pub fn list_from_json(json: &str) -> Result<Vec<Self>> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Engine-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Service name the runtime stamps on events from unnamed components
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Buffered policy events per watcher before it starts lagging
    #[serde(default = "default_watch_capacity")]
    pub watch_capacity: usize,

    /// Settings for bulkhead partitions that no policy describes
    #[serde(default)]
    pub default_bulkhead: BulkheadConfig,
}

fn default_service_name() -> String {
    "resilience-engine".to_string()
}

fn default_watch_capacity() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            watch_capacity: default_watch_capacity(),
            default_bulkhead: BulkheadConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Reads `RESILIENCE_*` variables, falling back to defaults for anything unset
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(name) = std::env::var("RESILIENCE_SERVICE_NAME") {
            config.service_name = name;
        }
        if let Some(capacity) = env_parse::<usize>("RESILIENCE_WATCH_CAPACITY")? {
            if capacity == 0 {
                return Err(ResilienceError::Internal(
                    "RESILIENCE_WATCH_CAPACITY must be positive".to_string(),
                ));
            }
            config.watch_capacity = capacity;
        }
        if let Some(max_concurrent) = env_parse::<usize>("RESILIENCE_BULKHEAD_MAX_CONCURRENT")? {
            config.default_bulkhead.max_concurrent = max_concurrent;
        }
        if let Some(max_queue) = env_parse::<usize>("RESILIENCE_BULKHEAD_MAX_QUEUE")? {
            config.default_bulkhead.max_queue = max_queue;
        }
        if let Some(millis) = env_parse::<u64>("RESILIENCE_BULKHEAD_QUEUE_TIMEOUT_MS")? {
            config.default_bulkhead.queue_timeout = Duration::from_millis(millis);
        }

        config.default_bulkhead.validate("engine")?;
        Ok(config)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ResilienceError::Internal(format!("{} has an invalid value: {}", key, raw))),
        Err(_) => Ok(None),
    }
}

fn invalid(policy: &str, field: &str, reason: impl Into<String>) -> ResilienceError {
    ResilienceError::invalid_policy(policy, field, reason)
}

// Helper module to serialize/deserialize Duration with serde.
//
// Durations travel as milliseconds: a whole number when exact, otherwise a
// fraction carrying the nanoseconds, so nothing a policy accepts is truncated.
pub(crate) mod duration_serde {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    const NANOS_PER_MILLI: u128 = 1_000_000;

    /// A duration on the wire
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct Millis(pub Duration);

    impl Serialize for Millis {
        fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            let nanos = self.0.as_nanos();
            if nanos % NANOS_PER_MILLI == 0 {
                serializer.serialize_u64((nanos / NANOS_PER_MILLI) as u64)
            } else {
                serializer.serialize_f64(nanos as f64 / NANOS_PER_MILLI as f64)
            }
        }
    }

    impl<'de> Deserialize<'de> for Millis {
        fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            let millis = f64::deserialize(deserializer)?;
            if !millis.is_finite() || millis < 0.0 {
                return Err(D::Error::custom(format!("invalid duration: {} ms", millis)));
            }
            let nanos = (millis * NANOS_PER_MILLI as f64).round();
            if nanos > u64::MAX as f64 {
                return Err(D::Error::custom(format!("duration too large: {} ms", millis)));
            }
            Ok(Millis(Duration::from_nanos(nanos as u64)))
        }
    }

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        Millis(*duration).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Millis::deserialize(deserializer)?.0)
    }
}

pub(crate) mod option_duration_serde {
    use super::duration_serde::Millis;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&Millis(*d)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<Millis>::deserialize(deserializer)?;
        Ok(millis.map(|m| m.0))
    }
}

pub(crate) mod duration_map_serde {
    use super::duration_serde::Millis;
    use serde::ser::SerializeMap;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::collections::HashMap;
    use std::time::Duration;

    pub fn serialize<S>(map: &HashMap<String, Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut entries: Vec<_> = map.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        let mut out = serializer.serialize_map(Some(entries.len()))?;
        for (key, value) in entries {
            out.serialize_entry(key, &Millis(*value))?;
        }
        out.end()
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<HashMap<String, Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = HashMap::<String, Millis>::deserialize(deserializer)?;
        Ok(raw.into_iter().map(|(key, millis)| (key, millis.0)).collect())
    }
}
