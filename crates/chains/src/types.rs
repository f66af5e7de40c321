use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type ChainId = String;
pub type ProcessId = Uuid;
pub type DraftId = Uuid;

/// Longest wait or timeout a definition may carry: ten years.
pub const MAX_WAIT_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Whole-second duration, saturating at [`MAX_WAIT_SECS`].
pub fn wait_secs(secs: u64) -> Duration {
    i64::try_from(secs.min(MAX_WAIT_SECS))
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or_else(Duration::zero)
}

/// `at + wait`, pinned to the latest representable instant on overflow.
pub fn deadline_after(at: DateTime<Utc>, wait: Duration) -> DateTime<Utc> {
    at.checked_add_signed(wait).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// An immutable, reusable multi-step messaging sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainDefinition {
    pub id: ChainId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Trigger key whose enrollment events start this chain.
    pub trigger_event: String,
    pub steps: Vec<ChainStep>,
    #[serde(default)]
    pub branches: Vec<ChainBranch>,
    #[serde(default = "default_version")]
    pub version: u32,
}

fn default_version() -> u32 {
    1
}

impl ChainDefinition {
    /// Branches attached to the step at `position`, in declaration order.
    pub fn branches_at(&self, position: u32) -> Vec<&ChainBranch> {
        self.branches
            .iter()
            .filter(|b| b.position == position)
            .collect()
    }
}

/// A single send-and-wait unit within a chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainStep {
    pub position: u32,
    pub label: String,
    /// Template to send. For approval steps this is the safe fallback.
    pub template_key: String,
    #[serde(default)]
    pub wait_after_secs: Option<u64>,
    #[serde(default)]
    pub kind: StepKind,
}

impl ChainStep {
    /// Checkpoint identity of this step's send.
    pub fn checkpoint_key(&self) -> String {
        format!("{}:{}", self.position, self.label)
    }

    /// Checkpoint identity of one drip cycle.
    pub fn cycle_key(&self, cycle: u32) -> String {
        format!("{}#{}", self.checkpoint_key(), cycle)
    }

    pub fn wait_after(&self) -> Option<Duration> {
        self.wait_after_secs.map(wait_secs)
    }
}

/// The kind of work a step performs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum StepKind {
    #[default]
    Send,
    Drip(DripSchedule),
    Approval(ApprovalStep),
}

/// Repeating send whose spacing adapts to engagement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DripSchedule {
    /// Wait between sends while the subscriber keeps engaging (P0).
    pub initial_wait_secs: u64,
    /// Coarser wait once misses pile up (P1).
    pub escalated_wait_secs: u64,
    #[serde(default = "default_miss_threshold")]
    pub miss_threshold: u32,
    pub max_sends: u32,
}

fn default_miss_threshold() -> u32 {
    3
}

/// Human checkpoint: a generated draft goes out only if an operator approves it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalStep {
    pub instructions: String,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Conditional redirection evaluated after the step at `position` is sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainBranch {
    pub position: u32,
    pub label: String,
    pub condition: BranchCondition,
    pub action: BranchAction,
    /// Tag added to the subscriber when this branch is taken.
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchCondition {
    Converted,
    Clicked,
    Opened,
    Engaged,
    Ghosted,
    Always,
}

impl BranchCondition {
    /// Lower wins when several branches match the same signal.
    pub fn precedence(&self) -> u8 {
        match self {
            BranchCondition::Converted => 0,
            BranchCondition::Clicked => 1,
            BranchCondition::Opened => 2,
            BranchCondition::Engaged => 3,
            BranchCondition::Ghosted => 4,
            BranchCondition::Always => 5,
        }
    }

    pub fn matches(&self, signal: &EngagementSignal) -> bool {
        match self {
            BranchCondition::Converted => signal.converted,
            BranchCondition::Clicked => signal.clicked,
            BranchCondition::Opened => signal.opened,
            BranchCondition::Engaged => signal.engaged(),
            BranchCondition::Ghosted => !signal.engaged(),
            BranchCondition::Always => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum BranchAction {
    Advance,
    BranchTo { chain_id: ChainId },
    Halt { reason: String },
}

/// Lifecycle status of one enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Active,
    Paused,
    Cancelled,
    Completed,
}

impl ProcessStatus {
    /// Active and paused processes count against the one-per-chain limit.
    pub fn is_open(&self) -> bool {
        matches!(self, ProcessStatus::Active | ProcessStatus::Paused)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessStatus::Active => "active",
            ProcessStatus::Paused => "paused",
            ProcessStatus::Cancelled => "cancelled",
            ProcessStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a history entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
    ChainStarted,
    Sent,
    DeliveryFailed,
    EngagementEvaluated,
    Tagged,
    Advanced,
    Branched,
    ApprovalRequested,
    DecisionRequestFailed,
    DraftGenerationFailed,
    ApprovalResolved,
    Paused,
    Resumed,
    Cancelled,
    Halted,
    Completed,
}

impl HistoryAction {
    /// Sent and failed sends both settle a checkpoint.
    pub fn is_checkpoint(&self) -> bool {
        matches!(self, HistoryAction::Sent | HistoryAction::DeliveryFailed)
    }

    pub fn label(&self) -> &'static str {
        match self {
            HistoryAction::ChainStarted => "Chain Started",
            HistoryAction::Sent => "Sent",
            HistoryAction::DeliveryFailed => "Delivery Failed",
            HistoryAction::EngagementEvaluated => "Engagement Evaluated",
            HistoryAction::Tagged => "Tagged",
            HistoryAction::Advanced => "Advanced",
            HistoryAction::Branched => "Branched",
            HistoryAction::ApprovalRequested => "Approval Requested",
            HistoryAction::DecisionRequestFailed => "Decision Request Failed",
            HistoryAction::DraftGenerationFailed => "Draft Generation Failed",
            HistoryAction::ApprovalResolved => "Approval Resolved",
            HistoryAction::Paused => "Chain Paused",
            HistoryAction::Resumed => "Chain Resumed",
            HistoryAction::Cancelled => "Chain Cancelled",
            HistoryAction::Halted => "Chain Halted",
            HistoryAction::Completed => "Chain Completed",
        }
    }
}

/// One append-only audit record of a process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub step_name: String,
    pub action: HistoryAction,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub details: Option<serde_json::Value>,
}

impl HistoryEntry {
    pub fn new(step_name: impl Into<String>, action: HistoryAction, timestamp: DateTime<Utc>) -> Self {
        Self {
            step_name: step_name.into(),
            action,
            timestamp,
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Reads a boolean field out of `details`.
    pub fn flag(&self, key: &str) -> bool {
        self.details
            .as_ref()
            .and_then(|d| d.get(key))
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

/// Registration of interest in an external decision event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventWait {
    pub match_key: String,
    pub registered_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    /// Filled in when the matching event arrives.
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
}

/// Claim held by the worker currently driving a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub token: Uuid,
    pub expires_at: DateTime<Utc>,
}

/// One enrollment of one subscriber in one chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainProcess {
    pub id: ProcessId,
    pub chain_id: ChainId,
    pub subscriber_id: String,
    pub subscriber_email: String,
    pub status: ProcessStatus,
    pub current_step_index: usize,
    pub next_wake_at: Option<DateTime<Utc>>,
    pub history: Vec<HistoryEntry>,
    #[serde(default)]
    pub context: serde_json::Value,
    #[serde(default)]
    pub awaiting: Option<EventWait>,
    #[serde(default)]
    pub lease: Option<Lease>,
    /// Optimistic concurrency token, bumped by the store on every write.
    #[serde(default)]
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChainProcess {
    pub fn new(
        chain_id: impl Into<ChainId>,
        subscriber_id: impl Into<String>,
        context: &EnrollmentContext,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            chain_id: chain_id.into(),
            subscriber_id: subscriber_id.into(),
            subscriber_email: context.email.clone(),
            status: ProcessStatus::Active,
            current_step_index: 0,
            next_wake_at: None,
            history: Vec::new(),
            context: context.attributes.clone(),
            awaiting: None,
            lease: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn record(&mut self, entry: HistoryEntry) {
        self.updated_at = entry.timestamp;
        self.history.push(entry);
    }

    /// The settled checkpoint for `step_name`, if the send already happened.
    pub fn checkpoint(&self, step_name: &str) -> Option<&HistoryEntry> {
        self.history
            .iter()
            .find(|e| e.step_name == step_name && e.action.is_checkpoint())
    }

    pub fn last_entry(&self, step_name: &str, action: HistoryAction) -> Option<&HistoryEntry> {
        self.history
            .iter()
            .rev()
            .find(|e| e.step_name == step_name && e.action == action)
    }

    pub fn has_live_lease(&self, now: DateTime<Utc>) -> bool {
        self.lease.map(|l| l.expires_at > now).unwrap_or(false)
    }

    pub fn holds_lease(&self, token: Uuid) -> bool {
        self.lease.map(|l| l.token == token).unwrap_or(false)
    }

    pub fn enrollment_context(&self) -> EnrollmentContext {
        EnrollmentContext {
            email: self.subscriber_email.clone(),
            attributes: self.context.clone(),
        }
    }
}

/// Personalization carried from the trigger into every send.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnrollmentContext {
    pub email: String,
    #[serde(default)]
    pub attributes: serde_json::Value,
}

/// Why a process stopped before running out of steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "detail")]
pub enum HaltReason {
    Unsubscribed,
    Converted,
    Inactive(ProcessStatus),
    Policy(String),
}

impl HaltReason {
    /// Status the process ends in for this reason.
    pub fn terminal_status(&self) -> ProcessStatus {
        match self {
            HaltReason::Unsubscribed => ProcessStatus::Cancelled,
            HaltReason::Inactive(status) => *status,
            HaltReason::Converted | HaltReason::Policy(_) => ProcessStatus::Completed,
        }
    }
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HaltReason::Unsubscribed => f.write_str("unsubscribed"),
            HaltReason::Converted => f.write_str("converted"),
            HaltReason::Inactive(status) => write!(f, "process {}", status),
            HaltReason::Policy(reason) => f.write_str(reason),
        }
    }
}

/// A generated candidate message awaiting a human decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalDraft {
    pub id: DraftId,
    pub process_id: ProcessId,
    pub step_name: String,
    pub status: DraftStatus,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DraftStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl DraftStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DraftStatus::Pending => "pending",
            DraftStatus::Approved => "approved",
            DraftStatus::Rejected => "rejected",
            DraftStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for DraftStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator verdict on a draft.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approved,
    Rejected,
}

impl ApprovalDecision {
    pub fn as_status(&self) -> DraftStatus {
        match self {
            ApprovalDecision::Approved => DraftStatus::Approved,
            ApprovalDecision::Rejected => DraftStatus::Rejected,
        }
    }
}

/// Engagement observed in a window after a send. Derived, never stored on
/// its own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngagementSignal {
    pub opened: bool,
    pub clicked: bool,
    pub converted: bool,
}

impl EngagementSignal {
    pub fn engaged(&self) -> bool {
        self.opened || self.clicked
    }
}

/// Inbound enrollment event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollmentTrigger {
    pub trigger_key: String,
    pub subscriber_id: String,
    pub context: EnrollmentContext,
}

/// Inbound cancel event. Targets one chain, or every chain started by a
/// trigger key when `match_key` is set instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelTrigger {
    pub subscriber_id: String,
    #[serde(default)]
    pub chain_id: Option<ChainId>,
    #[serde(default)]
    pub match_key: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Per-chain process counts by status.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChainStats {
    pub chain_id: ChainId,
    pub total: u64,
    pub active: u64,
    pub paused: u64,
    pub completed: u64,
    pub cancelled: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_kind_defaults_to_send() {
        let step: ChainStep = serde_json::from_value(serde_json::json!({
            "position": 0,
            "label": "Welcome",
            "template_key": "welcome_email"
        }))
        .unwrap();
        assert!(matches!(step.kind, StepKind::Send));
        assert_eq!(step.checkpoint_key(), "0:Welcome");
        assert_eq!(step.cycle_key(2), "0:Welcome#2");
        assert!(step.wait_after().is_none());
    }

    #[test]
    fn test_huge_waits_saturate() {
        let step: ChainStep = serde_json::from_value(serde_json::json!({
            "position": 0,
            "label": "Forever",
            "template_key": "forever_email",
            "wait_after_secs": u64::MAX
        }))
        .unwrap();
        let wait = step.wait_after().unwrap();
        assert_eq!(wait, wait_secs(MAX_WAIT_SECS));

        let now = Utc::now();
        assert!(deadline_after(now, wait) > now);
        assert_eq!(
            deadline_after(DateTime::<Utc>::MAX_UTC, Duration::days(1)),
            DateTime::<Utc>::MAX_UTC
        );
    }

    #[test]
    fn test_drip_step_parses() {
        let step: ChainStep = serde_json::from_value(serde_json::json!({
            "position": 1,
            "label": "Newsletter",
            "template_key": "newsletter",
            "kind": {
                "type": "drip",
                "initial_wait_secs": 60,
                "escalated_wait_secs": 120,
                "max_sends": 4
            }
        }))
        .unwrap();
        match step.kind {
            StepKind::Drip(schedule) => {
                assert_eq!(schedule.miss_threshold, 3);
                assert_eq!(schedule.max_sends, 4);
            }
            other => panic!("Expected drip, got {:?}", other),
        }
    }

    #[test]
    fn test_clicked_and_opened_conditions() {
        let both = EngagementSignal {
            opened: true,
            clicked: true,
            converted: false,
        };
        assert!(BranchCondition::Clicked.matches(&both));
        assert!(BranchCondition::Opened.matches(&both));
        assert!(!BranchCondition::Ghosted.matches(&both));
        assert!(BranchCondition::Clicked.precedence() < BranchCondition::Opened.precedence());

        let none = EngagementSignal::default();
        assert!(BranchCondition::Ghosted.matches(&none));
        assert!(!BranchCondition::Engaged.matches(&none));
    }

    #[test]
    fn test_checkpoint_lookup_ignores_other_actions() {
        let now = Utc::now();
        let mut process = ChainProcess::new(
            "welcome-series",
            "sub-1",
            &EnrollmentContext {
                email: "a@example.com".into(),
                attributes: serde_json::json!({}),
            },
            now,
        );
        process.record(HistoryEntry::new("0:Welcome", HistoryAction::ApprovalRequested, now));
        assert!(process.checkpoint("0:Welcome").is_none());

        process.record(HistoryEntry::new("0:Welcome", HistoryAction::DeliveryFailed, now));
        assert!(process.checkpoint("0:Welcome").is_some());
        assert!(process.checkpoint("1:Tips").is_none());
    }

    #[test]
    fn test_halt_reason_terminal_status() {
        assert_eq!(HaltReason::Unsubscribed.terminal_status(), ProcessStatus::Cancelled);
        assert_eq!(HaltReason::Converted.terminal_status(), ProcessStatus::Completed);
        assert_eq!(
            HaltReason::Inactive(ProcessStatus::Cancelled).terminal_status(),
            ProcessStatus::Cancelled
        );
    }
}
