//! Performs one checkpointed send per step identity.
//!
//! The checkpoint is the history entry keyed by `(process id, step name)`.
//! Once it exists the send is never repeated, no matter how many times the
//! same wake is delivered.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use dripline_core::delivery::{MessageBody, MessageSender, OutboundMessage};
use dripline_core::event_bus::{make_event, EventSink};
use dripline_core::types::ChainEventType;
use dripline_core::{ChainError, ChainResult, Clock};

use crate::engagement::EngagementReader;
use crate::store::{update_with_retry, ProcessStore};
use crate::types::{ChainProcess, HaltReason, HistoryAction, HistoryEntry, ProcessStatus};

/// Outcome of one checkpointed step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepResult {
    Sent {
        at: DateTime<Utc>,
        provider_message_id: String,
    },
    /// The provider refused the message. Recorded and treated as sent.
    Failed { at: DateTime<Utc>, error: String },
    /// The checkpoint already existed; nothing was sent.
    AlreadyRecorded(HistoryEntry),
    /// The subscriber is no longer eligible; nothing was sent.
    Halted(HaltReason),
}

impl StepResult {
    /// When the step's send settled, if it did.
    pub fn settled_at(&self) -> Option<DateTime<Utc>> {
        match self {
            StepResult::Sent { at, .. } | StepResult::Failed { at, .. } => Some(*at),
            StepResult::AlreadyRecorded(entry) => Some(entry.timestamp),
            StepResult::Halted(_) => None,
        }
    }
}

#[derive(Clone)]
pub struct StepExecutor {
    store: Arc<dyn ProcessStore>,
    sender: Arc<dyn MessageSender>,
    engagement: EngagementReader,
    clock: Arc<dyn Clock>,
    event_sink: Arc<dyn EventSink>,
    max_write_retries: u32,
}

impl StepExecutor {
    pub fn new(
        store: Arc<dyn ProcessStore>,
        sender: Arc<dyn MessageSender>,
        engagement: EngagementReader,
        clock: Arc<dyn Clock>,
        max_write_retries: u32,
    ) -> Self {
        Self {
            store,
            sender,
            engagement,
            clock,
            event_sink: dripline_core::event_bus::noop_sink(),
            max_write_retries,
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Sends `body` for `step_name` unless the checkpoint already exists or
    /// the subscriber is no longer eligible. `lease` is the caller's claim on
    /// the process; the checkpoint is only written while it still holds it.
    pub async fn execute(
        &self,
        process: &ChainProcess,
        step_name: &str,
        body: MessageBody,
        lease: Option<Uuid>,
    ) -> ChainResult<StepResult> {
        if let Some(entry) = process.checkpoint(step_name) {
            debug!(process_id = %process.id, step = step_name, "Checkpoint present, skipping send");
            return Ok(StepResult::AlreadyRecorded(entry.clone()));
        }

        let current = self.store.get_process(process.id)?;
        if let Some(entry) = current.checkpoint(step_name) {
            debug!(process_id = %process.id, step = step_name, "Checkpoint present in store, skipping send");
            self.event_sink.emit(make_event(
                ChainEventType::StepSkipped,
                current.id,
                current.chain_id.clone(),
                current.subscriber_id.clone(),
                Some(step_name.to_string()),
            ));
            return Ok(StepResult::AlreadyRecorded(entry.clone()));
        }

        if let Some(reason) = self.disqualification(&current) {
            info!(
                process_id = %current.id,
                step = step_name,
                reason = %reason,
                "Subscriber no longer eligible, not sending"
            );
            metrics::counter!("chains.steps_halted").increment(1);
            return Ok(StepResult::Halted(reason));
        }

        let message = OutboundMessage {
            subscriber_id: current.subscriber_id.clone(),
            to_email: current.subscriber_email.clone(),
            body: body.clone(),
            personalization: current.context.clone(),
            idempotency_key: format!("{}:{}", current.id, step_name),
        };

        let sent = self.sender.send(&message).await;
        let at = self.clock.now();
        let (entry, result) = match sent {
            Ok(receipt) => {
                metrics::counter!("chains.steps_sent").increment(1);
                let entry = HistoryEntry::new(step_name, HistoryAction::Sent, at).with_details(json!({
                    "body": body,
                    "provider_message_id": receipt.provider_message_id,
                }));
                (
                    entry,
                    StepResult::Sent {
                        at,
                        provider_message_id: receipt.provider_message_id,
                    },
                )
            }
            Err(error) => {
                warn!(
                    process_id = %current.id,
                    step = step_name,
                    error = %error,
                    "Delivery failed, continuing chain"
                );
                metrics::counter!("chains.delivery_failed").increment(1);
                let failure = ChainError::DeliveryFailed(error.clone());
                let entry = HistoryEntry::new(step_name, HistoryAction::DeliveryFailed, at)
                    .with_details(json!({ "body": body, "error": failure.to_string() }));
                (entry, StepResult::Failed { at, error })
            }
        };

        self.record_checkpoint(&current, step_name, entry, lease)?;

        let event_type = match &result {
            StepResult::Failed { .. } => ChainEventType::StepDeliveryFailed,
            _ => ChainEventType::StepSent,
        };
        self.event_sink.emit(make_event(
            event_type,
            current.id,
            current.chain_id.clone(),
            current.subscriber_id.clone(),
            Some(step_name.to_string()),
        ));

        Ok(result)
    }

    fn disqualification(&self, process: &ChainProcess) -> Option<HaltReason> {
        if process.status != ProcessStatus::Active {
            return Some(HaltReason::Inactive(process.status));
        }
        if self.engagement.has_unsubscribed(&process.subscriber_id) {
            return Some(HaltReason::Unsubscribed);
        }
        if self
            .engagement
            .converted_since(&process.subscriber_id, process.created_at)
        {
            return Some(HaltReason::Converted);
        }
        None
    }

    fn record_checkpoint(
        &self,
        process: &ChainProcess,
        step_name: &str,
        entry: HistoryEntry,
        lease: Option<Uuid>,
    ) -> ChainResult<()> {
        update_with_retry(self.store.as_ref(), process.id, self.max_write_retries, |p| {
            if let Some(token) = lease {
                if !p.holds_lease(token) {
                    return Err(ChainError::LeaseLost(p.id));
                }
            }
            if p.checkpoint(step_name).is_none() {
                p.record(entry.clone());
            }
            Ok(())
        })?;
        Ok(())
    }
}
