// src/events/mod.rs
//! Side-channel events describing what the protective layers did.
//!
//! Components never depend on a concrete transport. They hold an [`EventPublisher`],
//! which stamps correlation ids and forwards events to an optional [`EventEmitter`].
//! Without an emitter, publishing is a no-op.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

/// Kind of resilience event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    CircuitStateChange,
    BulkheadRejection,
    Timeout,
    RetryAttempt,
    RateLimit,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::CircuitStateChange => "circuit_state_change",
            EventType::BulkheadRejection => "bulkhead_rejection",
            EventType::Timeout => "timeout",
            EventType::RetryAttempt => "retry_attempt",
            EventType::RateLimit => "rate_limit",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single observation emitted by a component.
///
/// Ids are UUIDv7, so sorting by id sorts by creation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResilienceEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub service_name: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub correlation_id: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl ResilienceEvent {
    pub fn new(event_type: EventType, service_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            event_type,
            service_name: service_name.into(),
            timestamp: Utc::now(),
            correlation_id: String::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }

    pub fn metadata_u64(&self, key: &str) -> Option<u64> {
        self.metadata.get(key).and_then(|v| v.as_u64())
    }
}

/// Sink for resilience events. Emission is fire-and-forget.
pub trait EventEmitter: Send + Sync {
    fn emit(&self, event: ResilienceEvent);
}

/// Supplies the correlation id of the request being processed
pub type CorrelationIdFn = Arc<dyn Fn() -> String + Send + Sync>;

/// Handle components use to publish events
#[derive(Clone, Default)]
pub struct EventPublisher {
    emitter: Option<Arc<dyn EventEmitter>>,
    correlation: Option<CorrelationIdFn>,
    default_service: Option<Arc<str>>,
}

impl fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventPublisher")
            .field("emitter", &self.emitter.is_some())
            .field("correlation", &self.correlation.is_some())
            .field("default_service", &self.default_service)
            .finish()
    }
}

impl EventPublisher {
    /// A publisher that drops every event
    pub fn noop() -> Self {
        Self::default()
    }

    pub fn new(emitter: Arc<dyn EventEmitter>) -> Self {
        Self {
            emitter: Some(emitter),
            correlation: None,
            default_service: None,
        }
    }

    pub fn with_emitter(mut self, emitter: Arc<dyn EventEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    pub fn with_correlation_fn(mut self, correlation: CorrelationIdFn) -> Self {
        self.correlation = Some(correlation);
        self
    }

    /// Service name for events whose component has no name of its own
    pub fn with_default_service(mut self, service_name: &str) -> Self {
        self.default_service = (!service_name.is_empty()).then(|| Arc::from(service_name));
        self
    }

    /// Current correlation id, empty when no supplier is configured
    pub fn correlation_id(&self) -> String {
        self.correlation.as_ref().map(|f| f()).unwrap_or_default()
    }

    pub fn is_enabled(&self) -> bool {
        self.emitter.is_some()
    }

    /// Starts an event stamped with the current correlation id
    pub fn event(&self, event_type: EventType, service_name: &str) -> ResilienceEvent {
        let service_name = match &self.default_service {
            Some(fallback) if service_name.is_empty() => fallback.as_ref(),
            _ => service_name,
        };
        ResilienceEvent::new(event_type, service_name).with_correlation_id(self.correlation_id())
    }

    pub fn publish(&self, event: ResilienceEvent) {
        if let Some(emitter) = &self.emitter {
            emitter.emit(event);
        }
    }
}

/// Emitter that writes every event to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEmitter;

impl EventEmitter for TracingEmitter {
    fn emit(&self, event: ResilienceEvent) {
        let metadata = serde_json::to_string(&event.metadata).unwrap_or_default();
        info!(
            event_id = %event.id,
            event_type = %event.event_type,
            service = %event.service_name,
            correlation_id = %event.correlation_id,
            metadata = %metadata,
            "Resilience event"
        );
    }
}

/// Emitter that forwards events into an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelEmitter {
    tx: mpsc::UnboundedSender<ResilienceEvent>,
}

impl ChannelEmitter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ResilienceEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventEmitter for ChannelEmitter {
    fn emit(&self, event: ResilienceEvent) {
        if self.tx.send(event).is_err() {
            // Receiver is gone; the engine never blocks or retries on emission
            warn!("Dropping resilience event, receiver closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_ids_are_time_ordered() {
        let first = ResilienceEvent::new(EventType::Timeout, "svc");
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = ResilienceEvent::new(EventType::Timeout, "svc");

        assert_ne!(first.id, second.id);
        assert!(first.id < second.id, "v7 ids should sort by creation time");
    }

    #[test]
    fn test_publisher_without_emitter_is_noop() {
        let publisher = EventPublisher::noop();
        assert!(!publisher.is_enabled());
        assert_eq!(publisher.correlation_id(), "");

        // Must not panic
        publisher.publish(publisher.event(EventType::RateLimit, "svc"));
    }

    #[test]
    fn test_publisher_stamps_correlation_id() {
        let (emitter, mut rx) = ChannelEmitter::new();
        let publisher = EventPublisher::new(Arc::new(emitter))
            .with_correlation_fn(Arc::new(|| "req-42".to_string()));

        let event = publisher
            .event(EventType::RetryAttempt, "orders")
            .with_metadata("attempt", 2u64);
        publisher.publish(event);

        let received = rx.try_recv().unwrap();
        assert_eq!(received.correlation_id, "req-42");
        assert_eq!(received.event_type, EventType::RetryAttempt);
        assert_eq!(received.metadata_u64("attempt"), Some(2));
    }

    #[test]
    fn test_unnamed_events_take_default_service() {
        let publisher = EventPublisher::noop().with_default_service("checkout-api");

        assert_eq!(publisher.event(EventType::Timeout, "").service_name, "checkout-api");
        assert_eq!(publisher.event(EventType::Timeout, "payments").service_name, "payments");
        assert_eq!(EventPublisher::noop().event(EventType::Timeout, "").service_name, "");
    }

    #[test]
    fn test_event_serializes_type_field() {
        let event = ResilienceEvent::new(EventType::BulkheadRejection, "db");
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["type"], "bulkhead_rejection");
        assert_eq!(json["service_name"], "db");
    }

    #[test]
    fn test_channel_emitter_survives_closed_receiver() {
        let (emitter, rx) = ChannelEmitter::new();
        drop(rx);
        emitter.emit(ResilienceEvent::new(EventType::Timeout, "svc"));
    }
}
