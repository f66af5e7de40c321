//! Contracts for the collaborators the chain engine drives but does not own:
//! message delivery, subscriber tagging, draft generation, operator decision
//! requests and the interaction event log.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{InteractionEvent, InteractionKind};

/// What to put in the message: a stored template or pre-rendered content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum MessageBody {
    Template(String),
    Content(String),
}

/// A single outbound message to one subscriber.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub subscriber_id: String,
    pub to_email: String,
    pub body: MessageBody,
    pub personalization: serde_json::Value,
    /// Checkpoint identity, forwarded so providers can dedupe on their side.
    pub idempotency_key: String,
}

/// Provider acknowledgement of an accepted message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub provider_message_id: String,
    pub accepted_at: DateTime<Utc>,
}

#[async_trait]
pub trait MessageSender: Send + Sync {
    /// Hand a message to the delivery provider. Errors are reported as plain
    /// strings; the engine records them and moves on.
    async fn send(&self, message: &OutboundMessage) -> Result<DeliveryReceipt, String>;
}

/// Adds or removes tags on a subscriber profile. Adding an existing tag is a
/// no-op, so callers may repeat calls freely.
#[async_trait]
pub trait TagWriter: Send + Sync {
    async fn add_tag(&self, subscriber_id: &str, tag: &str) -> anyhow::Result<()>;
    async fn remove_tag(&self, subscriber_id: &str, tag: &str) -> anyhow::Result<()>;
}

/// Produces a personalized message body for human review.
#[async_trait]
pub trait DraftGenerator: Send + Sync {
    async fn generate_draft(
        &self,
        subscriber_id: &str,
        instructions: &str,
        context: &serde_json::Value,
    ) -> anyhow::Result<String>;
}

/// Request sent to the operator surface asking for an approve/reject decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRequest {
    pub draft_id: Uuid,
    pub process_id: Uuid,
    pub chain_id: String,
    pub subscriber_id: String,
    pub content: String,
    pub respond_by: DateTime<Utc>,
}

#[async_trait]
pub trait DecisionNotifier: Send + Sync {
    async fn request_decision(&self, request: &DecisionRequest) -> anyhow::Result<()>;
}

/// Read-only view of a subscriber's interaction history.
pub trait EventLogReader: Send + Sync {
    /// Events for `subscriber_id` at or after `since` (all time when `None`)
    /// whose kind is in `kinds`, ordered by `occurred_at`.
    fn events_for(
        &self,
        subscriber_id: &str,
        since: Option<DateTime<Utc>>,
        kinds: &[InteractionKind],
    ) -> Vec<InteractionEvent>;
}
