// src/policy/mod.rs
//! Named, versioned resilience policies.
//!
//! Every write produces a new version and is announced to all watchers. Older
//! versions stay available for inspection and rollback, even after a delete.

#[cfg(test)]
mod tests;

use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, ResiliencePolicy};
use crate::error::{ResilienceError, Result};

/// What happened to a policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyEventType {
    Created,
    Updated,
    Deleted,
}

impl fmt::Display for PolicyEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PolicyEventType::Created => "created",
            PolicyEventType::Updated => "updated",
            PolicyEventType::Deleted => "deleted",
        };
        f.write_str(name)
    }
}

/// Change notification delivered to watchers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyEvent {
    #[serde(rename = "type")]
    pub event_type: PolicyEventType,
    pub policy_name: String,
    pub version: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct PolicyEntry {
    /// `None` once deleted
    current: Option<Arc<ResiliencePolicy>>,
    history: BTreeMap<u64, Arc<ResiliencePolicy>>,
}

impl PolicyEntry {
    fn latest_version(&self) -> u64 {
        self.history.keys().next_back().copied().unwrap_or(0)
    }
}

/// In-memory policy store with versioning and change broadcast.
///
/// Reads take a shared lock and never block each other; writes are serialised.
#[derive(Debug)]
pub struct PolicyEngine {
    policies: RwLock<HashMap<String, PolicyEntry>>,
    events: broadcast::Sender<PolicyEvent>,
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::new(&EngineConfig::default())
    }
}

impl PolicyEngine {
    pub fn new(config: &EngineConfig) -> Self {
        let (events, _) = broadcast::channel(config.watch_capacity.max(1));
        Self {
            policies: RwLock::new(HashMap::new()),
            events,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, PolicyEntry>> {
        self.policies.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, PolicyEntry>> {
        self.policies.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get_policy(&self, name: &str) -> Result<Arc<ResiliencePolicy>> {
        self.read()
            .get(name)
            .and_then(|entry| entry.current.clone())
            .ok_or_else(|| ResilienceError::PolicyNotFound(name.to_string()))
    }

    /// Validate and store `policy`, assigning it the next version number.
    ///
    /// A name seen for the first time gets version 1. A deleted name that is
    /// written again continues from its last version.
    pub fn update_policy(&self, policy: ResiliencePolicy) -> Result<Arc<ResiliencePolicy>> {
        self.validate(&policy)?;
        let mut policies = self.write();
        Ok(self.store(&mut policies, policy))
    }

    fn store(&self, policies: &mut HashMap<String, PolicyEntry>, mut policy: ResiliencePolicy) -> Arc<ResiliencePolicy> {
        let entry = policies.entry(policy.name.clone()).or_default();
        let event_type = if entry.current.is_some() {
            PolicyEventType::Updated
        } else {
            PolicyEventType::Created
        };

        policy.version = entry.latest_version() + 1;
        let policy = Arc::new(policy);
        entry.history.insert(policy.version, Arc::clone(&policy));
        entry.current = Some(Arc::clone(&policy));

        info!(policy = %policy.name, version = policy.version, event = %event_type, "Policy stored");
        self.publish(event_type, &policy.name, policy.version);
        policy
    }

    /// Remove the current version. History is kept.
    pub fn delete_policy(&self, name: &str) -> Result<()> {
        let mut policies = self.write();
        let removed = policies
            .get_mut(name)
            .and_then(|entry| entry.current.take())
            .ok_or_else(|| ResilienceError::PolicyNotFound(name.to_string()))?;

        info!(policy = %name, version = removed.version, "Policy deleted");
        self.publish(PolicyEventType::Deleted, name, removed.version);
        Ok(())
    }

    /// Current policies, sorted by name
    pub fn list_policies(&self) -> Vec<Arc<ResiliencePolicy>> {
        let mut list: Vec<_> = self
            .read()
            .values()
            .filter_map(|entry| entry.current.clone())
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    pub fn get_policy_version(&self, name: &str, version: u64) -> Result<Arc<ResiliencePolicy>> {
        self.read()
            .get(name)
            .and_then(|entry| entry.history.get(&version).cloned())
            .ok_or_else(|| ResilienceError::PolicyNotFound(format!("{}@v{}", name, version)))
    }

    /// Every stored version of `name`, oldest first
    pub fn list_policy_versions(&self, name: &str) -> Result<Vec<Arc<ResiliencePolicy>>> {
        self.read()
            .get(name)
            .map(|entry| entry.history.values().cloned().collect())
            .ok_or_else(|| ResilienceError::PolicyNotFound(name.to_string()))
    }

    /// Make the content of `version` current again, as a new version
    pub fn rollback_policy(&self, name: &str, version: u64) -> Result<Arc<ResiliencePolicy>> {
        let mut policies = self.write();
        let target = policies
            .get(name)
            .and_then(|entry| entry.history.get(&version).cloned())
            .ok_or_else(|| ResilienceError::PolicyNotFound(format!("{}@v{}", name, version)))?;

        info!(policy = %name, from_version = version, "Rolling back policy");
        Ok(self.store(&mut policies, (*target).clone()))
    }

    /// Structural validation of every section present on the policy
    pub fn validate(&self, policy: &ResiliencePolicy) -> Result<()> {
        policy.validate()
    }

    /// Store a batch of policies. Nothing is written unless every policy is valid.
    pub fn apply_policies(&self, policies: Vec<ResiliencePolicy>) -> Result<usize> {
        for policy in &policies {
            self.validate(policy)?;
        }

        let count = policies.len();
        let mut stored = self.write();
        for policy in policies {
            self.store(&mut stored, policy);
        }
        debug!(count, "Applied policy batch");
        Ok(count)
    }

    /// Parse a JSON array of policies and apply it as one batch
    pub fn load_json(&self, json: &str) -> Result<usize> {
        self.apply_policies(ResiliencePolicy::list_from_json(json)?)
    }

    /// Stream of policy changes made after this call, ending when `cancel` fires.
    ///
    /// Every watcher has its own buffer. A watcher that falls further behind than
    /// the configured capacity skips the oldest events.
    pub fn watch_policies(&self, cancel: CancellationToken) -> impl Stream<Item = PolicyEvent> + Send + 'static {
        let rx = self.events.subscribe();

        stream::unfold((rx, cancel), |(mut rx, cancel)| async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return None,
                    received = rx.recv() => match received {
                        Ok(event) => return Some((event, (rx, cancel))),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Policy watcher lagged, events dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    },
                }
            }
        })
    }

    fn publish(&self, event_type: PolicyEventType, name: &str, version: u64) {
        let event = PolicyEvent {
            event_type,
            policy_name: name.to_string(),
            version,
            timestamp: Utc::now(),
        };
        // No watchers is not an error
        let _ = self.events.send(event);
    }
}
