use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of subscriber interaction recorded in the event log.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    Sent,
    Open,
    Click,
    Conversion,
    Unsubscribe,
}

impl InteractionKind {
    /// Opens and clicks count as engagement.
    pub fn is_engagement(&self) -> bool {
        matches!(self, InteractionKind::Open | InteractionKind::Click)
    }
}

/// One historical interaction of a subscriber (sent, open, click, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionEvent {
    pub event_id: Uuid,
    pub subscriber_id: String,
    pub kind: InteractionKind,
    pub occurred_at: DateTime<Utc>,
    /// Provider message id or chain checkpoint the interaction refers to.
    #[serde(default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl InteractionEvent {
    pub fn new(subscriber_id: impl Into<String>, kind: InteractionKind, occurred_at: DateTime<Utc>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            subscriber_id: subscriber_id.into(),
            kind,
            occurred_at,
            reference: None,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }
}

/// Chain lifecycle event emitted for downstream consumers (attribution,
/// dashboards). Never read back by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainEvent {
    pub event_id: Uuid,
    pub event_type: ChainEventType,
    pub process_id: Uuid,
    pub chain_id: String,
    pub subscriber_id: String,
    pub step: Option<String>,
    pub node_id: String,
    pub details: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChainEventType {
    ChainEnrolled,
    StepSent,
    StepDeliveryFailed,
    StepSkipped,
    EngagementEvaluated,
    ChainBranched,
    ChainPaused,
    ChainResumed,
    ChainCancelled,
    ChainHalted,
    ChainCompleted,
    ApprovalRequested,
    ApprovalResolved,
}
