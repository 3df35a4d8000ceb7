//! Profile event bus: trait for emitting domain events from the pipeline.
//!
//! The coordinator accepts an `Arc<dyn EventSink>` and emits an event after
//! each change commits, so downstream consumers never observe a change that
//! was rolled back.

use crate::types::{ProfileEvent, ProfileEventType};
use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

pub trait EventSink: Send + Sync {
    fn emit(&self, event: ProfileEvent);
}

/// No-op sink for deployments that don't consume profile events.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: ProfileEvent) {}
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: parking_lot::Mutex<Vec<ProfileEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProfileEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().len()
    }

    pub fn count_type(&self, event_type: ProfileEventType) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: ProfileEvent) {
        self.events.lock().push(event);
    }
}

pub fn make_event(
    event_type: ProfileEventType,
    customer_id: impl Into<String>,
    node_id: impl Into<String>,
    detail: serde_json::Value,
) -> ProfileEvent {
    ProfileEvent {
        event_id: Uuid::new_v4(),
        event_type,
        customer_id: customer_id.into(),
        detail,
        node_id: node_id.into(),
        timestamp: Utc::now(),
    }
}

pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_sink() {
        let sink = capture_sink();
        assert_eq!(sink.count(), 0);

        sink.emit(make_event(
            ProfileEventType::ProfileCreated,
            "cust-1",
            "node-01",
            serde_json::json!({}),
        ));
        sink.emit(make_event(
            ProfileEventType::SegmentsChanged,
            "cust-1",
            "node-01",
            serde_json::json!({ "segments": ["new"] }),
        ));

        assert_eq!(sink.count(), 2);
        assert_eq!(sink.count_type(ProfileEventType::ProfileCreated), 1);
        assert_eq!(sink.events()[1].detail["segments"][0], "new");

        sink.clear();
        assert_eq!(sink.count(), 0);
    }

    #[test]
    fn test_noop_sink() {
        let sink = noop_sink();
        sink.emit(make_event(
            ProfileEventType::ProfileErased,
            "cust-1",
            "node-01",
            serde_json::Value::Null,
        ));
    }
}
