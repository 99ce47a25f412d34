use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BulkheadConfig;
use crate::error::{ResilienceError, Result};
use crate::events::{EventPublisher, EventType};

/// Point-in-time utilisation of a bulkhead partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BulkheadMetrics {
    pub active_count: usize,
    pub queued_count: usize,
    pub rejected_count: u64,
    pub completed_count: u64,
    pub max_concurrent: usize,
    pub max_queue: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Limits {
    max_concurrent: usize,
    max_queue: usize,
    queue_timeout: Duration,
}

impl Limits {
    fn from_config(config: &BulkheadConfig) -> Self {
        Self {
            max_concurrent: config.max_concurrent.max(1),
            max_queue: config.max_queue,
            queue_timeout: config.queue_timeout,
        }
    }
}

#[derive(Debug)]
struct Shared {
    name: String,
    limits: RwLock<Limits>,
    /// Always holds `max_concurrent + shrink_debt` permits in total
    semaphore: Arc<Semaphore>,
    /// Permits a shrink could not forget yet because they were in use.
    /// Returning permits pay it off before going back to the semaphore.
    shrink_debt: AtomicUsize,
    queued: AtomicUsize,
    rejected: AtomicU64,
    completed: AtomicU64,
    events: EventPublisher,
}

/// Semaphore of `max_concurrent` slots fronted by a bounded wait queue.
///
/// Queued callers are woken in whatever order the semaphore grants permits.
/// Limits can be changed in place with [`reconfigure`](Self::reconfigure); slots
/// held at that moment keep counting against the new limit.
#[derive(Debug, Clone)]
pub struct Bulkhead {
    shared: Arc<Shared>,
}

/// A held slot. Dropping it (or calling [`release`](Self::release)) frees the slot.
#[derive(Debug)]
pub struct BulkheadPermit {
    permit: Option<OwnedSemaphorePermit>,
    shared: Arc<Shared>,
}

impl BulkheadPermit {
    pub fn release(self) {}
}

impl Drop for BulkheadPermit {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            if self.shared.take_debt(1) == 1 {
                permit.forget();
            }
        }
        self.shared.completed.fetch_add(1, Ordering::Relaxed);
    }
}

impl Shared {
    fn limits(&self) -> RwLockReadGuard<'_, Limits> {
        self.limits.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Settle up to `wanted` units of shrink debt, returning how many were settled
    fn take_debt(&self, wanted: usize) -> usize {
        let mut current = self.shrink_debt.load(Ordering::Acquire);
        loop {
            let taken = current.min(wanted);
            if taken == 0 {
                return 0;
            }
            match self.shrink_debt.compare_exchange_weak(
                current,
                current - taken,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return taken,
                Err(actual) => current = actual,
            }
        }
    }
}

/// Occupies one queue position until dropped
struct QueueSlot<'a> {
    queued: &'a AtomicUsize,
}

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.queued.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Bulkhead {
    pub fn new(config: BulkheadConfig) -> Self {
        Self::with_events(config, EventPublisher::noop())
    }

    pub fn with_events(config: BulkheadConfig, events: EventPublisher) -> Self {
        let limits = Limits::from_config(&config);
        Self {
            shared: Arc::new(Shared {
                name: config.name,
                limits: RwLock::new(limits),
                semaphore: Arc::new(Semaphore::new(limits.max_concurrent)),
                shrink_debt: AtomicUsize::new(0),
                queued: AtomicUsize::new(0),
                rejected: AtomicU64::new(0),
                completed: AtomicU64::new(0),
                events,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Current limits as a config
    pub fn config(&self) -> BulkheadConfig {
        let limits = *self.shared.limits();
        BulkheadConfig {
            name: self.shared.name.clone(),
            max_concurrent: limits.max_concurrent,
            max_queue: limits.max_queue,
            queue_timeout: limits.queue_timeout,
        }
    }

    /// Apply new limits without replacing the semaphore.
    ///
    /// Growing adds permits at once. Shrinking forgets free permits and records
    /// the rest as debt, which slots in use pay off as they are released, so
    /// active slots never exceed the new `max_concurrent` once they drain.
    /// Callers already queued keep their place. The partition name is unchanged.
    pub fn reconfigure(&self, config: &BulkheadConfig) {
        let shared = &self.shared;
        let wanted = Limits::from_config(config);
        let mut limits = shared.limits.write().unwrap_or_else(|e| e.into_inner());
        if *limits == wanted {
            return;
        }

        let previous = limits.max_concurrent;
        if wanted.max_concurrent > previous {
            let grow = wanted.max_concurrent - previous;
            let settled = shared.take_debt(grow);
            if grow > settled {
                shared.semaphore.add_permits(grow - settled);
            }
        } else if wanted.max_concurrent < previous {
            let shrink = previous - wanted.max_concurrent;
            let forgotten = shared.semaphore.forget_permits(shrink);
            if shrink > forgotten {
                shared.shrink_debt.fetch_add(shrink - forgotten, Ordering::AcqRel);
            }
        }
        *limits = wanted;

        info!(
            partition = %shared.name,
            previous_max_concurrent = previous,
            max_concurrent = wanted.max_concurrent,
            max_queue = wanted.max_queue,
            "Reconfigured bulkhead partition"
        );
    }

    /// Acquire a slot.
    ///
    /// Takes a free slot immediately if there is one. Otherwise waits in the queue
    /// for at most `queue_timeout`; a full queue rejects without waiting at all.
    /// Cancelling `cancel` while queued returns [`ResilienceError::Cancelled`].
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<BulkheadPermit> {
        if cancel.is_cancelled() {
            return Err(ResilienceError::Cancelled);
        }

        let shared = &self.shared;
        if let Ok(permit) = shared.semaphore.clone().try_acquire_owned() {
            return Ok(self.permit(permit));
        }

        let limits = *shared.limits();
        let Some(slot) = self.enter_queue(limits.max_queue) else {
            return Err(self.reject("queue full"));
        };

        if limits.queue_timeout.is_zero() {
            drop(slot);
            return Err(self.reject("no queue wait configured"));
        }

        debug!(
            partition = %shared.name,
            queued = shared.queued.load(Ordering::Acquire),
            "Waiting for bulkhead slot"
        );

        let wait = tokio::time::timeout(limits.queue_timeout, shared.semaphore.clone().acquire_owned());
        let outcome = tokio::select! {
            _ = cancel.cancelled() => None,
            acquired = wait => Some(acquired),
        };
        drop(slot);

        match outcome {
            None => Err(ResilienceError::Cancelled),
            Some(Ok(Ok(permit))) => Ok(self.permit(permit)),
            Some(Ok(Err(_))) => Err(ResilienceError::Internal(format!(
                "bulkhead {} semaphore closed",
                shared.name
            ))),
            Some(Err(_elapsed)) => Err(self.reject("queue timeout")),
        }
    }

    /// Run `operation` while holding a slot
    pub async fn execute<F, Fut, T>(&self, cancel: &CancellationToken, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = self.acquire(cancel).await?;
        let result = operation().await;
        permit.release();
        result
    }

    pub fn metrics(&self) -> BulkheadMetrics {
        let shared = &self.shared;
        let limits = *shared.limits();
        let total = limits.max_concurrent + shared.shrink_debt.load(Ordering::Acquire);
        BulkheadMetrics {
            active_count: total.saturating_sub(shared.semaphore.available_permits()),
            queued_count: shared.queued.load(Ordering::Acquire),
            rejected_count: shared.rejected.load(Ordering::Relaxed),
            completed_count: shared.completed.load(Ordering::Relaxed),
            max_concurrent: limits.max_concurrent,
            max_queue: limits.max_queue,
        }
    }

    fn permit(&self, permit: OwnedSemaphorePermit) -> BulkheadPermit {
        BulkheadPermit {
            permit: Some(permit),
            shared: Arc::clone(&self.shared),
        }
    }

    fn enter_queue(&self, max_queue: usize) -> Option<QueueSlot<'_>> {
        let queued = &self.shared.queued;
        let mut current = queued.load(Ordering::Acquire);
        loop {
            if current >= max_queue {
                return None;
            }
            match queued.compare_exchange_weak(current, current + 1, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Some(QueueSlot { queued }),
                Err(actual) => current = actual,
            }
        }
    }

    fn reject(&self, reason: &str) -> ResilienceError {
        let shared = &self.shared;
        shared.rejected.fetch_add(1, Ordering::Relaxed);
        let metrics = self.metrics();

        warn!(
            partition = %shared.name,
            reason,
            active = metrics.active_count,
            queued = metrics.queued_count,
            "Bulkhead rejected call"
        );

        let event = shared
            .events
            .event(EventType::BulkheadRejection, &shared.name)
            .with_metadata("partition", shared.name.as_str())
            .with_metadata("reason", reason)
            .with_metadata("active_count", metrics.active_count)
            .with_metadata("queued_count", metrics.queued_count);
        shared.events.publish(event);

        ResilienceError::BulkheadFull {
            partition: shared.name.clone(),
            max_concurrent: metrics.max_concurrent,
            max_queue: metrics.max_queue,
        }
    }
}

/// Owns one independent [`Bulkhead`] per named partition
#[derive(Debug)]
pub struct BulkheadManager {
    default_config: BulkheadConfig,
    partitions: RwLock<HashMap<String, Arc<Bulkhead>>>,
    events: EventPublisher,
}

impl BulkheadManager {
    pub fn new(default_config: BulkheadConfig) -> Self {
        Self::with_events(default_config, EventPublisher::noop())
    }

    pub fn with_events(default_config: BulkheadConfig, events: EventPublisher) -> Self {
        Self {
            default_config,
            partitions: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Bulkhead for `partition`, created from the default config on first use
    pub fn get_bulkhead(&self, partition: &str) -> Arc<Bulkhead> {
        self.get_or_create(partition, || BulkheadConfig {
            name: partition.to_string(),
            ..self.default_config.clone()
        })
    }

    /// Bulkhead for `partition`, created from `config` if it does not exist yet
    pub fn get_or_create_with(&self, partition: &str, config: &BulkheadConfig) -> Arc<Bulkhead> {
        self.get_or_create(partition, || BulkheadConfig {
            name: partition.to_string(),
            ..config.clone()
        })
    }

    fn get_or_create(&self, partition: &str, config: impl FnOnce() -> BulkheadConfig) -> Arc<Bulkhead> {
        {
            let partitions = self.partitions.read().unwrap_or_else(|e| e.into_inner());
            if let Some(bulkhead) = partitions.get(partition) {
                return Arc::clone(bulkhead);
            }
        }

        let mut partitions = self.partitions.write().unwrap_or_else(|e| e.into_inner());
        // Another caller may have created it between the two locks
        if let Some(bulkhead) = partitions.get(partition) {
            return Arc::clone(bulkhead);
        }

        let config = config();
        info!(
            partition,
            max_concurrent = config.max_concurrent,
            max_queue = config.max_queue,
            "Creating bulkhead partition"
        );
        let bulkhead = Arc::new(Bulkhead::with_events(config, self.events.clone()));
        partitions.insert(partition.to_string(), Arc::clone(&bulkhead));
        bulkhead
    }

    /// Apply `config` to `partition`. An existing bulkhead is reconfigured in
    /// place, so slots held through it stay counted; otherwise one is created.
    pub fn reconfigure(&self, partition: &str, config: &BulkheadConfig) -> Arc<Bulkhead> {
        let bulkhead = self.get_or_create_with(partition, config);
        bulkhead.reconfigure(config);
        bulkhead
    }

    pub fn remove(&self, partition: &str) -> Option<Arc<Bulkhead>> {
        self.partitions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(partition)
    }

    pub fn all_metrics(&self) -> HashMap<String, BulkheadMetrics> {
        self.partitions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(name, bulkhead)| (name.clone(), bulkhead.metrics()))
            .collect()
    }
}
