// src/test_utils.rs

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{ResilienceError, ServiceError, ServiceErrorCode};
use crate::events::{EventEmitter, EventPublisher, EventType, ResilienceEvent};

/// Emitter that keeps every event for later assertions
#[derive(Debug, Default, Clone)]
pub struct RecordingEmitter {
    events: Arc<Mutex<Vec<ResilienceEvent>>>,
}

impl RecordingEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publisher wired to this emitter with a fixed correlation id
    pub fn publisher(&self) -> EventPublisher {
        EventPublisher::new(Arc::new(self.clone()))
            .with_correlation_fn(Arc::new(|| "test-correlation".to_string()))
    }

    pub fn events(&self) -> Vec<ResilienceEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn of_type(&self, event_type: EventType) -> Vec<ResilienceEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }
}

impl EventEmitter for RecordingEmitter {
    fn emit(&self, event: ResilienceEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Counts how many times an operation body actually ran
#[derive(Debug, Default, Clone)]
pub struct CallCounter {
    calls: Arc<AtomicUsize>,
}

impl CallCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hit(&self) -> usize {
        self.calls.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub fn unavailable() -> ResilienceError {
    ServiceError::new(ServiceErrorCode::Unavailable, "dependency down").into()
}

pub fn not_found() -> ResilienceError {
    ServiceError::new(ServiceErrorCode::NotFound, "no such record").into()
}
