//! Human checkpoint with timeout fallback.
//!
//! The draft's status in the [`DraftStore`] is the single truth. It leaves
//! `pending` exactly once, through whichever of operator decision or timeout
//! expiry gets there first; the loser sees `DraftAlreadyResolved`.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use dripline_core::delivery::{DecisionNotifier, DecisionRequest, DraftGenerator};
use dripline_core::event_bus::{make_event, noop_sink, EventSink};
use dripline_core::types::ChainEventType;
use dripline_core::{ChainError, ChainResult, Clock};

use crate::scheduler::{TimerService, WaitResolution};
use crate::store::{update_with_retry, DraftStore, ProcessStore};
use crate::types::{
    ApprovalDecision, ApprovalDraft, ApprovalStep, ChainProcess, DraftId, DraftStatus,
    HistoryAction, HistoryEntry, ProcessId, deadline_after, wait_secs,
};

/// What opening an approval step produced.
#[derive(Debug, Clone, PartialEq)]
pub enum ApprovalOpened {
    Requested {
        draft_id: DraftId,
        deadline: DateTime<Utc>,
    },
    /// Generation failed; the draft exists already rejected.
    GenerationFailed { draft_id: DraftId },
}

/// Where a step's draft stands when the process wakes.
#[derive(Debug, Clone)]
pub enum Settlement {
    Waiting(DateTime<Utc>),
    Resolved(ApprovalDraft),
}

#[derive(Clone)]
pub struct ApprovalGate {
    drafts: Arc<dyn DraftStore>,
    store: Arc<dyn ProcessStore>,
    generator: Arc<dyn DraftGenerator>,
    notifier: Arc<dyn DecisionNotifier>,
    timers: TimerService,
    clock: Arc<dyn Clock>,
    event_sink: Arc<dyn EventSink>,
    default_timeout: Duration,
    max_write_retries: u32,
}

impl ApprovalGate {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        drafts: Arc<dyn DraftStore>,
        store: Arc<dyn ProcessStore>,
        generator: Arc<dyn DraftGenerator>,
        notifier: Arc<dyn DecisionNotifier>,
        timers: TimerService,
        clock: Arc<dyn Clock>,
        default_timeout_secs: u64,
        max_write_retries: u32,
    ) -> Self {
        Self {
            drafts,
            store,
            generator,
            notifier,
            timers,
            clock,
            event_sink: noop_sink(),
            default_timeout: wait_secs(default_timeout_secs),
            max_write_retries,
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    fn timeout_for(&self, step: &ApprovalStep) -> Duration {
        step.timeout_secs.map(wait_secs).unwrap_or(self.default_timeout)
    }

    /// Generates the draft for an approval step and either requests a
    /// decision on it or, if generation failed, records an immediate
    /// rejection so the fallback goes out.
    pub async fn open(
        &self,
        process: &ChainProcess,
        step_name: &str,
        step: &ApprovalStep,
        lease: Option<Uuid>,
    ) -> ChainResult<ApprovalOpened> {
        let generated = self
            .generator
            .generate_draft(&process.subscriber_id, &step.instructions, &process.context)
            .await;

        match generated {
            Ok(content) => {
                let (draft_id, deadline) = self
                    .request_approval(process, step_name, content, self.timeout_for(step), lease)
                    .await?;
                Ok(ApprovalOpened::Requested { draft_id, deadline })
            }
            Err(e) => {
                let draft_id =
                    self.record_generation_failure(process, step_name, &e.to_string(), lease)?;
                Ok(ApprovalOpened::GenerationFailed { draft_id })
            }
        }
    }

    /// Persists a pending draft, suspends the process on the draft id until
    /// decision or timeout, then asks the operator surface for a decision.
    /// The wait is in place before the request leaves, so a decision that
    /// arrives while the notifier is still running wakes the process.
    pub async fn request_approval(
        &self,
        process: &ChainProcess,
        step_name: &str,
        content: String,
        timeout: Duration,
        lease: Option<Uuid>,
    ) -> ChainResult<(DraftId, DateTime<Utc>)> {
        let now = self.clock.now();
        let draft = ApprovalDraft {
            id: Uuid::new_v4(),
            process_id: process.id,
            step_name: step_name.to_string(),
            status: DraftStatus::Pending,
            content,
            created_at: now,
            resolved_at: None,
        };
        self.drafts.insert_draft(draft.clone())?;

        let respond_by = deadline_after(now, timeout);
        let request = DecisionRequest {
            draft_id: draft.id,
            process_id: process.id,
            chain_id: process.chain_id.clone(),
            subscriber_id: process.subscriber_id.clone(),
            content: draft.content.clone(),
            respond_by,
        };
        let match_key = draft.id.to_string();
        let mut deadline = respond_by;
        update_with_retry(self.store.as_ref(), process.id, self.max_write_retries, |p| {
            check_lease(p, lease)?;
            p.record(
                HistoryEntry::new(step_name, HistoryAction::ApprovalRequested, now).with_details(json!({
                    "draft_id": draft.id,
                    "respond_by": respond_by,
                })),
            );
            deadline = TimerService::register_wait(p, &match_key, timeout, now);
            Ok(())
        })?;

        if let Err(e) = self.notifier.request_decision(&request).await {
            warn!(
                process_id = %process.id,
                draft_id = %draft.id,
                error = %e,
                "Decision request not delivered, waiting for timeout"
            );
            metrics::counter!("chains.decision_requests_failed").increment(1);
            let failed = HistoryEntry::new(step_name, HistoryAction::DecisionRequestFailed, now)
                .with_details(json!({ "draft_id": draft.id, "error": e.to_string() }));
            update_with_retry(self.store.as_ref(), process.id, self.max_write_retries, |p| {
                check_lease(p, lease)?;
                p.record(failed.clone());
                Ok(())
            })?;
        }

        info!(
            process_id = %process.id,
            draft_id = %draft.id,
            deadline = %deadline,
            "Approval requested"
        );
        metrics::counter!("chains.approvals_requested").increment(1);
        self.event_sink.emit(make_event(
            ChainEventType::ApprovalRequested,
            process.id,
            process.chain_id.clone(),
            process.subscriber_id.clone(),
            Some(step_name.to_string()),
        ));

        Ok((draft.id, deadline))
    }

    /// Records a failed generation as a draft that is rejected on creation.
    pub fn record_generation_failure(
        &self,
        process: &ChainProcess,
        step_name: &str,
        error: &str,
        lease: Option<Uuid>,
    ) -> ChainResult<DraftId> {
        let now = self.clock.now();
        let draft = ApprovalDraft {
            id: Uuid::new_v4(),
            process_id: process.id,
            step_name: step_name.to_string(),
            status: DraftStatus::Rejected,
            content: String::new(),
            created_at: now,
            resolved_at: Some(now),
        };
        self.drafts.insert_draft(draft.clone())?;

        let failure = ChainError::DraftGenerationFailed(error.to_string());
        update_with_retry(self.store.as_ref(), process.id, self.max_write_retries, |p| {
            check_lease(p, lease)?;
            p.record(
                HistoryEntry::new(step_name, HistoryAction::DraftGenerationFailed, now)
                    .with_details(json!({ "draft_id": draft.id, "error": failure.to_string() })),
            );
            Ok(())
        })?;

        warn!(
            process_id = %process.id,
            draft_id = %draft.id,
            error,
            "Draft generation failed, using fallback"
        );
        metrics::counter!("chains.draft_generation_failed").increment(1);
        Ok(draft.id)
    }

    pub fn get_draft(&self, draft_id: DraftId) -> ChainResult<ApprovalDraft> {
        self.drafts.get_draft(draft_id)
    }

    /// Applies an operator decision. Only a pending draft accepts one; the
    /// waiting process, if any, is made due immediately and returned.
    pub fn decide(
        &self,
        draft_id: DraftId,
        decision: ApprovalDecision,
    ) -> ChainResult<(ApprovalDraft, Option<ProcessId>)> {
        let draft = self
            .drafts
            .resolve_draft(draft_id, decision.as_status(), self.clock.now())?;

        let woken = self.timers.deliver_event(
            &draft_id.to_string(),
            json!({ "draft_id": draft_id, "decision": decision }),
        )?;

        info!(draft_id = %draft_id, status = %draft.status, "Approval decided");
        self.resolved(&draft);
        Ok((draft, woken))
    }

    /// Expires a draft that ran out of time. If a decision beat the timeout,
    /// that decision stands and its status is returned instead.
    pub fn expire(&self, draft_id: DraftId) -> ChainResult<DraftStatus> {
        match self
            .drafts
            .resolve_draft(draft_id, DraftStatus::Expired, self.clock.now())
        {
            Ok(draft) => {
                info!(draft_id = %draft_id, "Approval expired");
                self.resolved(&draft);
                Ok(DraftStatus::Expired)
            }
            Err(ChainError::DraftAlreadyResolved { .. }) => {
                Ok(self.drafts.get_draft(draft_id)?.status)
            }
            Err(e) => Err(e),
        }
    }

    /// The draft opened for `step_name`, if the step got that far.
    pub fn draft_for_step(process: &ChainProcess, step_name: &str) -> Option<DraftId> {
        process
            .history
            .iter()
            .rev()
            .filter(|e| e.step_name == step_name)
            .filter(|e| {
                matches!(
                    e.action,
                    HistoryAction::ApprovalRequested | HistoryAction::DraftGenerationFailed
                )
            })
            .find_map(|e| {
                e.details
                    .as_ref()
                    .and_then(|d| d.get("draft_id"))
                    .and_then(|v| v.as_str())
                    .and_then(|s| Uuid::parse_str(s).ok())
            })
    }

    /// The draft a suspended process is waiting on.
    pub fn awaited_draft(process: &ChainProcess) -> Option<DraftId> {
        process
            .awaiting
            .as_ref()
            .and_then(|w| Uuid::parse_str(&w.match_key).ok())
    }

    /// Decides where the step's draft stands now: still waiting, or resolved
    /// (expiring it first if the deadline passed without a decision).
    pub fn settle(&self, process: &ChainProcess, draft_id: DraftId) -> ChainResult<Settlement> {
        let draft = self.drafts.get_draft(draft_id)?;
        if draft.status != DraftStatus::Pending {
            return Ok(Settlement::Resolved(draft));
        }

        if let WaitResolution::Pending(deadline) = self.timers.resolve(process) {
            return Ok(Settlement::Waiting(deadline));
        }

        self.expire(draft_id)?;
        Ok(Settlement::Resolved(self.drafts.get_draft(draft_id)?))
    }

    fn resolved(&self, draft: &ApprovalDraft) {
        metrics::counter!("chains.approvals_resolved", "status" => draft.status.as_str()).increment(1);
        if let Ok(process) = self.store.get_process(draft.process_id) {
            self.event_sink.emit(make_event(
                ChainEventType::ApprovalResolved,
                process.id,
                process.chain_id,
                process.subscriber_id,
                Some(draft.step_name.clone()),
            ));
        }
    }
}

fn check_lease(process: &ChainProcess, lease: Option<Uuid>) -> ChainResult<()> {
    match lease {
        Some(token) if !process.holds_lease(token) => Err(ChainError::LeaseLost(process.id)),
        _ => Ok(()),
    }
}
