//! Lifecycle feed of the chain engine.
//!
//! Every enrollment, send, branch, approval and terminal transition is handed
//! to an [`EventSink`] as a [`ChainEvent`]. The engine never waits on the
//! sink and never learns whether anyone consumed the event.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::types::{ChainEvent, ChainEventType};

pub trait EventSink: Send + Sync {
    fn emit(&self, event: ChainEvent);
}

/// Drops every event.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: ChainEvent) {}
}

pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

/// Writes each event as a structured log line under the `dripline::events`
/// target, so the feed can be filtered apart from operational logs.
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: ChainEvent) {
        tracing::info!(
            target: "dripline::events",
            event_type = ?event.event_type,
            process_id = %event.process_id,
            chain_id = %event.chain_id,
            subscriber_id = %event.subscriber_id,
            step = event.step.as_deref().unwrap_or(""),
            "Chain event"
        );
    }
}

/// Keeps events in memory, in emission order.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<ChainEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ChainEvent> {
        self.events.lock().clone()
    }

    pub fn count_type(&self, event_type: ChainEventType) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: ChainEvent) {
        self.events.lock().push(event);
    }
}

pub fn make_event(
    event_type: ChainEventType,
    process_id: Uuid,
    chain_id: impl Into<String>,
    subscriber_id: impl Into<String>,
    step: Option<String>,
) -> ChainEvent {
    ChainEvent {
        event_id: Uuid::new_v4(),
        event_type,
        process_id,
        chain_id: chain_id.into(),
        subscriber_id: subscriber_id.into(),
        step,
        node_id: "local".into(),
        details: serde_json::Value::Null,
        timestamp: Utc::now(),
    }
}
