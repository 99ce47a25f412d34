// src/runtime.rs
//! Composition root tying policies to live protection instances.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::algorithms::RateLimiter;
use crate::config::{BulkheadConfig, CircuitBreakerConfig, EngineConfig, ResiliencePolicy};
use crate::error::Result;
use crate::events::EventPublisher;
use crate::policy::PolicyEngine;
use crate::rand_source::{CryptoRandSource, RandSource};
use crate::resilience::{Bulkhead, BulkheadManager, CircuitBreaker, RetryHandler, TimeoutManager};

/// Live instances built from one version of a policy
#[derive(Debug)]
pub struct PolicyInstances {
    pub version: u64,
    pub rate_limiter: Option<RateLimiter>,
    pub bulkhead: Option<Arc<Bulkhead>>,
    pub circuit_breaker: Option<Arc<CircuitBreaker>>,
    pub timeout: Option<TimeoutManager>,
    pub retry: Option<RetryHandler>,
}

/// Owns the policy engine and every protection instance derived from it.
///
/// Instances are cached per policy name and rebuilt when the policy version
/// changes. A component whose own section is unchanged keeps its state across
/// versions, so editing a retry policy does not reset a tripped breaker.
#[derive(Debug)]
pub struct ResilienceRuntime {
    config: EngineConfig,
    engine: Arc<PolicyEngine>,
    bulkheads: BulkheadManager,
    instances: RwLock<HashMap<String, Arc<PolicyInstances>>>,
    events: EventPublisher,
    rand: Arc<dyn RandSource>,
}

impl ResilienceRuntime {
    pub fn new(config: EngineConfig, events: EventPublisher) -> Self {
        let engine = Arc::new(PolicyEngine::new(&config));
        Self::with_engine(config, engine, events)
    }

    /// Share an existing policy engine
    pub fn with_engine(config: EngineConfig, engine: Arc<PolicyEngine>, events: EventPublisher) -> Self {
        let events = events.with_default_service(&config.service_name);
        let bulkheads = BulkheadManager::with_events(config.default_bulkhead.clone(), events.clone());
        Self {
            config,
            engine,
            bulkheads,
            instances: RwLock::new(HashMap::new()),
            events,
            rand: Arc::new(CryptoRandSource::new()),
        }
    }

    /// Jitter source for retry handlers built from now on
    pub fn with_rand_source(mut self, rand: Arc<dyn RandSource>) -> Self {
        self.rand = rand;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<PolicyEngine> {
        &self.engine
    }

    pub fn bulkheads(&self) -> &BulkheadManager {
        &self.bulkheads
    }

    pub fn events(&self) -> &EventPublisher {
        &self.events
    }

    /// Instances for the current version of `policy`, building them if needed
    pub fn instances(&self, policy: &str) -> Result<Arc<PolicyInstances>> {
        let current = match self.engine.get_policy(policy) {
            Ok(current) => current,
            Err(err) => {
                self.evict(policy);
                return Err(err);
            }
        };

        let previous = {
            let instances = self.instances.read().unwrap_or_else(|e| e.into_inner());
            match instances.get(policy) {
                Some(cached) if cached.version == current.version => return Ok(Arc::clone(cached)),
                cached => cached.cloned(),
            }
        };

        let mut instances = self.instances.write().unwrap_or_else(|e| e.into_inner());
        // Another caller may have rebuilt it between the two locks
        if let Some(cached) = instances.get(policy) {
            if cached.version == current.version {
                return Ok(Arc::clone(cached));
            }
        }

        let built = Arc::new(self.build(&current, previous.as_deref()));
        info!(policy, version = built.version, "Built resilience instances");
        instances.insert(policy.to_string(), Arc::clone(&built));
        Ok(built)
    }

    fn build(&self, policy: &ResiliencePolicy, previous: Option<&PolicyInstances>) -> PolicyInstances {
        let service = policy.name.as_str();

        let rate_limiter = policy.rate_limit.as_ref().map(|config| {
            match previous.and_then(|p| p.rate_limiter.as_ref()) {
                Some(existing) if existing.config() == config => existing.clone(),
                _ => RateLimiter::new(service, config.clone()).with_events(self.events.clone()),
            }
        });

        let bulkhead = policy.bulkhead.as_ref().map(|config| {
            let partition = if config.name.is_empty() { service } else { config.name.as_str() };
            let wanted = BulkheadConfig {
                name: partition.to_string(),
                ..config.clone()
            };
            // Reconfigured in place so slots held under the previous version stay counted
            self.bulkheads.reconfigure(partition, &wanted)
        });

        let circuit_breaker = policy.circuit_breaker.as_ref().map(|config| {
            let wanted = CircuitBreakerConfig {
                name: if config.name.is_empty() {
                    service.to_string()
                } else {
                    config.name.clone()
                },
                ..config.clone()
            };
            match previous.and_then(|p| p.circuit_breaker.as_ref()) {
                Some(existing) if existing.config() == &wanted => Arc::clone(existing),
                _ => Arc::new(CircuitBreaker::with_events(wanted, self.events.clone())),
            }
        });

        let timeout = policy
            .timeout
            .as_ref()
            .map(|config| TimeoutManager::new(service, config.clone()).with_events(self.events.clone()));

        let retry = policy.retry.as_ref().map(|config| {
            RetryHandler::new(service, config.clone())
                .with_rand_source(Arc::clone(&self.rand))
                .with_events(self.events.clone())
        });

        PolicyInstances {
            version: policy.version,
            rate_limiter,
            bulkhead,
            circuit_breaker,
            timeout,
            retry,
        }
    }

    /// Drop cached instances for `policy`. The bulkhead partition is left in the
    /// manager so permits in flight stay accounted for.
    pub fn evict(&self, policy: &str) {
        let removed = self
            .instances
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(policy);
        if removed.is_some() {
            debug!(policy, "Evicted resilience instances");
        }
    }

    /// Run `op` through every protection `policy` enables.
    ///
    /// Order: rate limit (keyed by `operation`), bulkhead, circuit breaker,
    /// timeout, then retry around the operation itself. The timeout bounds the
    /// whole retry loop, and the breaker records one outcome per call. `op`
    /// receives the token it should watch for cancellation.
    pub async fn execute<F, Fut, T>(&self, policy: &str, operation: &str, ctx: &CancellationToken, op: F) -> Result<T>
    where
        F: FnMut(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let instances = self.instances(policy)?;

        if let Some(limiter) = &instances.rate_limiter {
            limiter.check(operation).await?;
        }

        let permit = match &instances.bulkhead {
            Some(bulkhead) => Some(bulkhead.acquire(ctx).await?),
            None => None,
        };

        let guarded = Self::timed(&instances, operation, ctx, op);
        let result = match &instances.circuit_breaker {
            Some(breaker) => breaker.execute(|| guarded).await,
            None => guarded.await,
        };

        drop(permit);
        result
    }

    async fn timed<F, Fut, T>(instances: &PolicyInstances, operation: &str, ctx: &CancellationToken, op: F) -> Result<T>
    where
        F: FnMut(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let retry = instances.retry.clone();
        match &instances.timeout {
            Some(timeout) => {
                timeout
                    .execute(ctx, operation, move |scope| async move {
                        Self::retried(retry, &scope, op).await
                    })
                    .await
            }
            None => Self::retried(retry, ctx, op).await,
        }
    }

    async fn retried<F, Fut, T>(retry: Option<RetryHandler>, ctx: &CancellationToken, mut op: F) -> Result<T>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match retry {
            Some(retry) => retry.execute(ctx, || op(ctx.clone())).await,
            None => op(ctx.clone()).await,
        }
    }
}
