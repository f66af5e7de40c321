//! Answers "did they engage" and "did they convert" from the event log.
//! Stateless; safe to call from any number of processes at once.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use dripline_core::delivery::EventLogReader;
use dripline_core::types::InteractionKind;

use crate::types::EngagementSignal;

#[derive(Clone)]
pub struct EngagementReader {
    log: Arc<dyn EventLogReader>,
}

impl EngagementReader {
    pub fn new(log: Arc<dyn EventLogReader>) -> Self {
        Self { log }
    }

    /// Signal from events strictly after `since` and no later than `until`.
    pub fn signal(
        &self,
        subscriber_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> EngagementSignal {
        let events = self.log.events_for(
            subscriber_id,
            Some(since),
            &[
                InteractionKind::Open,
                InteractionKind::Click,
                InteractionKind::Conversion,
            ],
        );

        events
            .iter()
            .filter(|e| e.occurred_at > since && e.occurred_at <= until)
            .fold(EngagementSignal::default(), |mut signal, e| {
                match e.kind {
                    InteractionKind::Open => signal.opened = true,
                    InteractionKind::Click => signal.clicked = true,
                    InteractionKind::Conversion => signal.converted = true,
                    _ => {}
                }
                signal
            })
    }

    pub fn has_unsubscribed(&self, subscriber_id: &str) -> bool {
        !self
            .log
            .events_for(subscriber_id, None, &[InteractionKind::Unsubscribe])
            .is_empty()
    }

    pub fn converted_since(&self, subscriber_id: &str, since: DateTime<Utc>) -> bool {
        self.log
            .events_for(subscriber_id, Some(since), &[InteractionKind::Conversion])
            .iter()
            .any(|e| e.occurred_at >= since)
    }
}
