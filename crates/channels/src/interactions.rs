//! In-memory interaction log: the event log the chain engine reads
//! engagement, conversions and unsubscribes from.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use dripline_core::delivery::EventLogReader;
use dripline_core::types::{InteractionEvent, InteractionKind};

/// Interaction history keyed by subscriber. Events are kept sorted by
/// `occurred_at`; re-delivered events (same `event_id`) are ignored.
#[derive(Default)]
pub struct InteractionLog {
    by_subscriber: DashMap<String, Vec<InteractionEvent>>,
    seen: DashMap<Uuid, ()>,
}

impl InteractionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Appends an event. Returns false when it was already recorded.
    pub fn record(&self, event: InteractionEvent) -> bool {
        if self.seen.insert(event.event_id, ()).is_some() {
            debug!(event_id = %event.event_id, "Duplicate interaction ignored");
            return false;
        }

        metrics::counter!(
            "interactions.recorded",
            "kind" => format!("{:?}", event.kind).to_lowercase()
        )
        .increment(1);

        let mut events = self
            .by_subscriber
            .entry(event.subscriber_id.clone())
            .or_default();
        let at = events.partition_point(|e| e.occurred_at <= event.occurred_at);
        events.insert(at, event);
        true
    }

    pub fn for_subscriber(&self, subscriber_id: &str) -> Vec<InteractionEvent> {
        self.by_subscriber
            .get(subscriber_id)
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// The newest `limit` events of a subscriber, newest first.
    pub fn recent(&self, subscriber_id: &str, limit: usize) -> Vec<InteractionEvent> {
        self.by_subscriber
            .get(subscriber_id)
            .map(|events| events.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    pub fn all(&self) -> Vec<InteractionEvent> {
        self.by_subscriber
            .iter()
            .flat_map(|r| r.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_subscriber.iter().map(|r| r.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventLogReader for InteractionLog {
    fn events_for(
        &self,
        subscriber_id: &str,
        since: Option<DateTime<Utc>>,
        kinds: &[InteractionKind],
    ) -> Vec<InteractionEvent> {
        let Some(events) = self.by_subscriber.get(subscriber_id) else {
            return Vec::new();
        };
        let start = since
            .map(|s| events.partition_point(|e| e.occurred_at < s))
            .unwrap_or(0);
        events[start..]
            .iter()
            .filter(|e| kinds.contains(&e.kind))
            .cloned()
            .collect()
    }
}
