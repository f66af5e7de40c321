//! Drives each chain process from enrollment to a terminal status.
//!
//! `resume_step` is the only entry point that runs steps. It is safe to call
//! any number of times for the same wake: it claims the process with a lease,
//! reloads state, and skips every send whose checkpoint is already in the
//! history. Between steps the process is suspended by writing its next wake
//! time and returning; nothing waits in memory.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use dripline_core::delivery::{
    DecisionNotifier, DraftGenerator, EventLogReader, MessageBody, MessageSender, TagWriter,
};
use dripline_core::event_bus::{make_event, noop_sink, EventSink};
use dripline_core::types::ChainEventType;
use dripline_core::{AppConfig, ChainError, ChainResult, Clock};

use crate::approval::{ApprovalGate, ApprovalOpened, Settlement};
use crate::catalog::ChainCatalog;
use crate::engagement::EngagementReader;
use crate::executor::{StepExecutor, StepResult};
use crate::policy::{AdaptivePacing, BranchOutcome, BranchingPolicy, NextAction};
use crate::scheduler::{TimerService, WakeHandler};
use crate::state_machine::ProcessStateMachine;
use crate::store::{update_with_retry, DraftStore, ProcessStore};
use crate::types::{
    ApprovalDecision, ApprovalDraft, ApprovalStep, CancelTrigger, ChainDefinition, ChainId,
    ChainProcess, ChainStats, ChainStep, DraftStatus, DripSchedule, EnrollmentContext,
    EnrollmentTrigger, HaltReason, HistoryAction, HistoryEntry, Lease, ProcessId, ProcessStatus,
    StepKind, deadline_after, wait_secs,
};

/// What one `resume_step` call achieved.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum ResumeOutcome {
    /// Woken before its time; nothing ran.
    NotYetDue { wake_at: DateTime<Utc> },
    /// Another worker holds the process.
    Busy,
    /// Paused, cancelled or completed; nothing ran.
    Inactive { status: ProcessStatus },
    Suspended { until: DateTime<Utc> },
    AwaitingDecision { draft_id: Uuid, deadline: DateTime<Utc> },
    Branched { target: ChainId, enrolled: Option<ProcessId> },
    Halted { reason: HaltReason },
    Completed,
}

/// The external collaborators the engine drives.
#[derive(Clone)]
pub struct Collaborators {
    pub sender: Arc<dyn MessageSender>,
    pub event_log: Arc<dyn EventLogReader>,
    pub tags: Arc<dyn TagWriter>,
    pub drafts: Arc<dyn DraftGenerator>,
    pub notifier: Arc<dyn DecisionNotifier>,
}

/// Result of a lease-checked write during a step.
enum Commit {
    Saved(ChainProcess),
    Inactive(ProcessStatus),
}

/// What the loop in `drive` does after a step.
enum Flow {
    Continue(ChainProcess),
    Stop(ResumeOutcome),
}

#[derive(Clone)]
pub struct ChainOrchestrator {
    catalog: ChainCatalog,
    store: Arc<dyn ProcessStore>,
    executor: StepExecutor,
    timers: TimerService,
    gate: ApprovalGate,
    engagement: EngagementReader,
    tags: Arc<dyn TagWriter>,
    policy: BranchingPolicy,
    state_machine: ProcessStateMachine,
    clock: Arc<dyn Clock>,
    event_sink: Arc<dyn EventSink>,
    lease_duration: Duration,
    max_write_retries: u32,
}

impl std::fmt::Debug for ChainOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainOrchestrator")
            .field("catalog", &self.catalog)
            .field("lease_duration", &self.lease_duration)
            .finish()
    }
}

impl ChainOrchestrator {
    pub fn new<S>(
        catalog: ChainCatalog,
        store: Arc<S>,
        collaborators: Collaborators,
        clock: Arc<dyn Clock>,
        config: &AppConfig,
    ) -> Self
    where
        S: ProcessStore + DraftStore + 'static,
    {
        let retries = config.store.max_write_retries;
        let processes: Arc<dyn ProcessStore> = store.clone();
        let drafts: Arc<dyn DraftStore> = store;
        let engagement = EngagementReader::new(collaborators.event_log.clone());
        let timers = TimerService::new(processes.clone(), clock.clone(), retries);
        let executor = StepExecutor::new(
            processes.clone(),
            collaborators.sender.clone(),
            engagement.clone(),
            clock.clone(),
            retries,
        );
        let gate = ApprovalGate::new(
            drafts,
            processes.clone(),
            collaborators.drafts.clone(),
            collaborators.notifier.clone(),
            timers.clone(),
            clock.clone(),
            config.approval.timeout_secs,
            retries,
        );

        Self {
            catalog,
            store: processes,
            executor,
            timers,
            gate,
            engagement,
            tags: collaborators.tags,
            policy: BranchingPolicy::new(),
            state_machine: ProcessStateMachine::new(),
            clock,
            event_sink: noop_sink(),
            lease_duration: wait_secs(config.scheduler.lease_secs),
            max_write_retries: retries,
        }
    }

    /// Attach an event sink for chain lifecycle events.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.executor = self.executor.with_event_sink(sink.clone());
        self.gate = self.gate.with_event_sink(sink.clone());
        self.event_sink = sink;
        self
    }

    pub fn catalog(&self) -> &ChainCatalog {
        &self.catalog
    }

    pub fn timers(&self) -> &TimerService {
        &self.timers
    }

    pub fn store(&self) -> Arc<dyn ProcessStore> {
        self.store.clone()
    }

    fn emit(&self, event_type: ChainEventType, process: &ChainProcess, step: Option<String>) {
        self.event_sink.emit(make_event(
            event_type,
            process.id,
            process.chain_id.clone(),
            process.subscriber_id.clone(),
            step,
        ));
    }

    // ─── Enrollment ─────────────────────────────────────────────────────

    /// Starts `subscriber_id` on `chain_id`. Step 0 is due immediately.
    pub fn enroll(
        &self,
        chain_id: &str,
        subscriber_id: &str,
        context: &EnrollmentContext,
    ) -> ChainResult<ProcessId> {
        let definition = self
            .catalog
            .get(chain_id)
            .ok_or_else(|| ChainError::ChainNotFound(chain_id.to_string()))?;

        let now = self.clock.now();
        let mut process = ChainProcess::new(chain_id, subscriber_id, context, now);
        process.record(
            HistoryEntry::new("chain", HistoryAction::ChainStarted, now).with_details(json!({
                "chain_version": definition.version,
                "steps": definition.steps.len(),
            })),
        );
        TimerService::arm(&mut process, now);

        let saved = match self.store.insert_process(process) {
            Ok(saved) => saved,
            Err(e) => {
                if matches!(e, ChainError::DuplicateEnrollment { .. }) {
                    metrics::counter!("chains.duplicate_enrollments").increment(1);
                }
                return Err(e);
            }
        };

        info!(
            process_id = %saved.id,
            chain_id = %chain_id,
            subscriber_id = %subscriber_id,
            "Subscriber enrolled"
        );
        metrics::counter!("chains.enrollments").increment(1);
        self.emit(ChainEventType::ChainEnrolled, &saved, None);
        self.timers.nudge(now);
        Ok(saved.id)
    }

    /// Enrolls the subscriber in every chain started by the trigger key.
    /// Each chain's result is reported on its own.
    pub fn handle_enrollment_trigger(
        &self,
        trigger: &EnrollmentTrigger,
    ) -> Vec<(ChainId, ChainResult<ProcessId>)> {
        let chains = self.catalog.by_trigger(&trigger.trigger_key);
        if chains.is_empty() {
            debug!(trigger_key = %trigger.trigger_key, "No chain listens to trigger");
        }
        chains
            .iter()
            .map(|definition| {
                let result = self.enroll(&definition.id, &trigger.subscriber_id, &trigger.context);
                (definition.id.clone(), result)
            })
            .collect()
    }

    // ─── Commands ───────────────────────────────────────────────────────

    /// Marks the process cancelled. Pending timers observe the status on
    /// their next fire and do nothing; a pending draft is expired.
    pub fn cancel(&self, process_id: ProcessId, reason: Option<&str>) -> ChainResult<ChainProcess> {
        let now = self.clock.now();
        let saved = update_with_retry(self.store.as_ref(), process_id, self.max_write_retries, |p| {
            self.state_machine
                .validate(p.id, p.status, ProcessStatus::Cancelled)?;
            p.status = ProcessStatus::Cancelled;
            p.record(
                HistoryEntry::new("chain", HistoryAction::Cancelled, now)
                    .with_details(json!({ "reason": reason })),
            );
            Ok(())
        })?;

        if let Some(draft_id) = ApprovalGate::awaited_draft(&saved) {
            match self.gate.expire(draft_id) {
                Ok(status) => debug!(draft_id = %draft_id, %status, "Draft closed on cancel"),
                Err(e) => warn!(draft_id = %draft_id, error = %e, "Could not close draft on cancel"),
            }
        }

        info!(process_id = %process_id, reason = ?reason, "Process cancelled");
        metrics::counter!("chains.cancelled").increment(1);
        self.emit(ChainEventType::ChainCancelled, &saved, None);
        Ok(saved)
    }

    /// Cancels the subscriber's open processes named by the trigger: one
    /// chain by id, or every chain started by `match_key`.
    pub fn cancel_trigger(&self, trigger: &CancelTrigger) -> ChainResult<Vec<ProcessId>> {
        let chain_ids: Vec<ChainId> = match (&trigger.chain_id, &trigger.match_key) {
            (Some(chain_id), _) => vec![chain_id.clone()],
            (None, Some(match_key)) => self
                .catalog
                .by_trigger(match_key)
                .iter()
                .map(|d| d.id.clone())
                .collect(),
            (None, None) => {
                return Err(ChainError::Internal(anyhow::anyhow!(
                    "cancel trigger needs a chain id or a match key"
                )))
            }
        };

        let mut cancelled = Vec::new();
        for chain_id in chain_ids {
            let Some(open) = self.store.find_open(&trigger.subscriber_id, &chain_id) else {
                continue;
            };
            match self.cancel(open.id, trigger.reason.as_deref()) {
                Ok(process) => cancelled.push(process.id),
                Err(ChainError::InvalidTransition { .. }) => {
                    debug!(process_id = %open.id, "Process finished before cancel landed");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(cancelled)
    }

    /// Stops timer-driven execution; the stored wake time is kept.
    pub fn pause(&self, process_id: ProcessId) -> ChainResult<ChainProcess> {
        let now = self.clock.now();
        let saved = update_with_retry(self.store.as_ref(), process_id, self.max_write_retries, |p| {
            self.state_machine.validate(p.id, p.status, ProcessStatus::Paused)?;
            p.status = ProcessStatus::Paused;
            p.record(HistoryEntry::new("chain", HistoryAction::Paused, now));
            Ok(())
        })?;

        info!(process_id = %process_id, "Process paused");
        self.emit(ChainEventType::ChainPaused, &saved, None);
        Ok(saved)
    }

    /// Reactivates a paused process and re-arms it for the later of now and
    /// its stored wake time.
    pub fn resume(&self, process_id: ProcessId) -> ChainResult<ChainProcess> {
        let now = self.clock.now();
        let mut wake_at = now;
        update_with_retry(self.store.as_ref(), process_id, self.max_write_retries, |p| {
            self.state_machine.validate(p.id, p.status, ProcessStatus::Active)?;
            p.status = ProcessStatus::Active;
            wake_at = p.next_wake_at.map(|stored| stored.max(now)).unwrap_or(now);
            p.record(
                HistoryEntry::new("chain", HistoryAction::Resumed, now)
                    .with_details(json!({ "wake_at": wake_at })),
            );
            Ok(())
        })?;

        let saved = self.timers.schedule_at(process_id, wake_at)?;
        info!(process_id = %process_id, wake_at = %wake_at, "Process resumed");
        self.emit(ChainEventType::ChainResumed, &saved, None);
        Ok(saved)
    }

    /// Applies an operator decision and runs the waiting process right away.
    pub async fn decide(
        &self,
        draft_id: Uuid,
        decision: ApprovalDecision,
    ) -> ChainResult<ApprovalDraft> {
        let (draft, woken) = self.gate.decide(draft_id, decision)?;
        if let Some(process_id) = woken {
            match self.resume_step(process_id).await {
                Ok(outcome) => debug!(process_id = %process_id, ?outcome, "Resumed after decision"),
                Err(e) => warn!(process_id = %process_id, error = %e, "Resume after decision failed"),
            }
        }
        Ok(draft)
    }

    // ─── Queries ────────────────────────────────────────────────────────

    pub fn get_process(&self, process_id: ProcessId) -> ChainResult<ChainProcess> {
        self.store.get_process(process_id)
    }

    pub fn get_draft(&self, draft_id: Uuid) -> ChainResult<ApprovalDraft> {
        self.gate.get_draft(draft_id)
    }

    pub fn processes_for_subscriber(&self, subscriber_id: &str) -> Vec<ChainProcess> {
        self.store.list_for_subscriber(subscriber_id)
    }

    pub fn chain_stats(&self, chain_id: &str) -> ChainResult<ChainStats> {
        if self.catalog.get(chain_id).is_none() {
            return Err(ChainError::ChainNotFound(chain_id.to_string()));
        }
        let mut stats = ChainStats {
            chain_id: chain_id.to_string(),
            ..Default::default()
        };
        for process in self.store.list_for_chain(chain_id) {
            stats.total += 1;
            match process.status {
                ProcessStatus::Active => stats.active += 1,
                ProcessStatus::Paused => stats.paused += 1,
                ProcessStatus::Completed => stats.completed += 1,
                ProcessStatus::Cancelled => stats.cancelled += 1,
            }
        }
        Ok(stats)
    }

    // ─── Execution ──────────────────────────────────────────────────────

    /// Runs the process forward from its current step until it suspends or
    /// terminates.
    pub async fn resume_step(&self, process_id: ProcessId) -> ChainResult<ResumeOutcome> {
        let now = self.clock.now();
        let process = self.store.get_process(process_id)?;
        if process.status != ProcessStatus::Active {
            return Ok(ResumeOutcome::Inactive {
                status: process.status,
            });
        }
        if let Some(wake_at) = process.next_wake_at {
            if wake_at > now {
                debug!(process_id = %process_id, wake_at = %wake_at, "Woken early, ignoring");
                return Ok(ResumeOutcome::NotYetDue { wake_at });
            }
        }

        let token = Uuid::new_v4();
        let claimed = match self.claim(process_id, token, now)? {
            Ok(claimed) => claimed,
            Err(outcome) => return Ok(outcome),
        };

        let outcome = self.drive(claimed, token).await;
        if let Err(e) = self.release(process_id, token) {
            warn!(process_id = %process_id, error = %e, "Could not release process lease");
        }
        let outcome = outcome?;
        debug!(process_id = %process_id, ?outcome, "Resume finished");
        Ok(outcome)
    }

    /// Takes the worker lease through a version-checked write.
    fn claim(
        &self,
        process_id: ProcessId,
        token: Uuid,
        now: DateTime<Utc>,
    ) -> ChainResult<Result<ChainProcess, ResumeOutcome>> {
        let mut attempt = 0;
        loop {
            let mut process = self.store.get_process(process_id)?;
            if process.status != ProcessStatus::Active {
                return Ok(Err(ResumeOutcome::Inactive {
                    status: process.status,
                }));
            }
            if process.has_live_lease(now) {
                return Ok(Err(ResumeOutcome::Busy));
            }
            process.lease = Some(Lease {
                token,
                expires_at: deadline_after(now, self.lease_duration),
            });
            match self.store.update_process(&process) {
                Ok(saved) => return Ok(Ok(saved)),
                Err(e) if e.is_conflict() && attempt < self.max_write_retries => attempt += 1,
                Err(e) => return Err(e),
            }
        }
    }

    fn release(&self, process_id: ProcessId, token: Uuid) -> ChainResult<()> {
        if !self.store.get_process(process_id)?.holds_lease(token) {
            return Ok(());
        }
        update_with_retry(self.store.as_ref(), process_id, self.max_write_retries, |p| {
            if p.holds_lease(token) {
                p.lease = None;
            }
            Ok(())
        })?;
        Ok(())
    }

    /// Lease-checked write that only applies while the process is active.
    fn commit<F>(&self, process_id: ProcessId, token: Uuid, mut mutate: F) -> ChainResult<Commit>
    where
        F: FnMut(&mut ChainProcess),
    {
        let mut observed = ProcessStatus::Active;
        let written = update_with_retry(self.store.as_ref(), process_id, self.max_write_retries, |p| {
            if !p.holds_lease(token) {
                return Err(ChainError::LeaseLost(p.id));
            }
            if p.status != ProcessStatus::Active {
                observed = p.status;
                return Err(ChainError::InvalidTransition {
                    process_id: p.id,
                    from: p.status.to_string(),
                    to: ProcessStatus::Active.to_string(),
                });
            }
            mutate(p);
            Ok(())
        });
        match written {
            Ok(saved) => Ok(Commit::Saved(saved)),
            Err(ChainError::InvalidTransition { .. }) if observed != ProcessStatus::Active => {
                Ok(Commit::Inactive(observed))
            }
            Err(e) => Err(e),
        }
    }

    async fn drive(&self, mut process: ChainProcess, token: Uuid) -> ChainResult<ResumeOutcome> {
        loop {
            let Some(definition) = self.catalog.get(&process.chain_id) else {
                warn!(process_id = %process.id, chain_id = %process.chain_id, "Chain definition missing");
                return self.halt(
                    &process,
                    token,
                    "chain",
                    HaltReason::Policy("chain definition missing".to_string()),
                );
            };

            let Some(step) = definition.steps.get(process.current_step_index) else {
                return self.complete(&process, token);
            };

            let flow = match &step.kind {
                StepKind::Send => self.run_send(&process, &definition, step, token).await?,
                StepKind::Drip(schedule) => self.run_drip(&process, step, schedule, token).await?,
                StepKind::Approval(approval) => {
                    self.run_approval(&process, &definition, step, approval, token)
                        .await?
                }
            };

            match flow {
                Flow::Continue(next) => process = next,
                Flow::Stop(outcome) => return Ok(outcome),
            }
        }
    }

    async fn run_send(
        &self,
        process: &ChainProcess,
        definition: &ChainDefinition,
        step: &ChainStep,
        token: Uuid,
    ) -> ChainResult<Flow> {
        let key = step.checkpoint_key();
        let sent_at = match process.checkpoint(&key) {
            Some(entry) => entry.timestamp,
            None => {
                let body = MessageBody::Template(step.template_key.clone());
                match self.send(process, &key, body, token).await? {
                    Ok(at) => at,
                    Err(outcome) => return Ok(Flow::Stop(outcome)),
                }
            }
        };
        self.after_send(process.id, definition, step, &key, sent_at, token)
            .await
    }

    /// Executes one checkpointed send. A disqualified subscriber halts the
    /// process instead.
    async fn send(
        &self,
        process: &ChainProcess,
        key: &str,
        body: MessageBody,
        token: Uuid,
    ) -> ChainResult<Result<DateTime<Utc>, ResumeOutcome>> {
        let result = self.executor.execute(process, key, body, Some(token)).await?;
        match result {
            StepResult::Halted(reason) => Ok(Err(self.halt(process, token, key, reason)?)),
            other => Ok(Ok(other.settled_at().unwrap_or_else(|| self.clock.now()))),
        }
    }

    /// Waits out the step's `wait_after`, then evaluates its branches.
    async fn after_send(
        &self,
        process_id: ProcessId,
        definition: &ChainDefinition,
        step: &ChainStep,
        key: &str,
        sent_at: DateTime<Utc>,
        token: Uuid,
    ) -> ChainResult<Flow> {
        let now = self.clock.now();
        let until = match step.wait_after() {
            Some(wait) => {
                let due = deadline_after(sent_at, wait);
                if now < due {
                    return self.suspend(process_id, token, due);
                }
                due
            }
            None => now,
        };

        let process = self.store.get_process(process_id)?;
        let signal = self.engagement.signal(&process.subscriber_id, sent_at, until);
        let branches = definition.branches_at(step.position);
        let outcome = self.policy.decide(&branches, &signal);
        debug!(
            process_id = %process_id,
            step = key,
            ?signal,
            action = ?outcome.action,
            "Branches evaluated"
        );

        let details = json!({
            "signal": signal,
            "branch": outcome.branch,
            "tag": outcome.tag,
            "action": outcome.action.describe(),
        });
        self.apply(&process, key, outcome, details, token).await
    }

    async fn apply(
        &self,
        process: &ChainProcess,
        key: &str,
        outcome: BranchOutcome,
        details: serde_json::Value,
        token: Uuid,
    ) -> ChainResult<Flow> {
        let tag_entry = match &outcome.tag {
            Some(tag) => Some(self.tag(process, key, tag).await),
            None => None,
        };

        match outcome.action {
            NextAction::Advance => self.advance(process, key, tag_entry, details, token),
            NextAction::BranchTo(target) => self.branch(process, key, &target, tag_entry, details, token),
            NextAction::Halt(reason) => {
                if let Some(entry) = tag_entry {
                    if let Commit::Inactive(status) = self.commit(process.id, token, |p| p.record(entry.clone()))? {
                        return Ok(Flow::Stop(ResumeOutcome::Inactive { status }));
                    }
                }
                Ok(Flow::Stop(self.halt(process, token, key, reason)?))
            }
            // Only drip steps repeat; a branch never asks for it.
            NextAction::Repeat(_) => self.advance(process, key, tag_entry, details, token),
        }
    }

    /// Adds a tag and returns the history entry recording how it went.
    /// Tag failures never stop the chain.
    async fn tag(&self, process: &ChainProcess, key: &str, tag: &str) -> HistoryEntry {
        let error = match self.tags.add_tag(&process.subscriber_id, tag).await {
            Ok(()) => None,
            Err(e) => {
                warn!(
                    process_id = %process.id,
                    subscriber_id = %process.subscriber_id,
                    tag,
                    error = %e,
                    "Tag write failed"
                );
                Some(e.to_string())
            }
        };
        HistoryEntry::new(key, HistoryAction::Tagged, self.clock.now())
            .with_details(json!({ "tag": tag, "error": error }))
    }

    fn advance(
        &self,
        process: &ChainProcess,
        key: &str,
        tag_entry: Option<HistoryEntry>,
        details: serde_json::Value,
        token: Uuid,
    ) -> ChainResult<Flow> {
        let now = self.clock.now();
        let committed = self.commit(process.id, token, |p| {
            if let Some(entry) = &tag_entry {
                p.record(entry.clone());
            }
            p.record(HistoryEntry::new(key, HistoryAction::Advanced, now).with_details(details.clone()));
            p.current_step_index += 1;
            TimerService::arm(p, now);
        })?;
        Ok(match committed {
            Commit::Saved(saved) => Flow::Continue(saved),
            Commit::Inactive(status) => Flow::Stop(ResumeOutcome::Inactive { status }),
        })
    }

    /// Completes this process and enrolls the subscriber in `target`.
    fn branch(
        &self,
        process: &ChainProcess,
        key: &str,
        target: &str,
        tag_entry: Option<HistoryEntry>,
        details: serde_json::Value,
        token: Uuid,
    ) -> ChainResult<Flow> {
        let current = self.store.get_process(process.id)?;
        if current.status != ProcessStatus::Active {
            return Ok(Flow::Stop(ResumeOutcome::Inactive {
                status: current.status,
            }));
        }
        self.state_machine
            .validate(current.id, current.status, ProcessStatus::Completed)?;

        let enrollment = self.enroll(target, &current.subscriber_id, &current.enrollment_context());
        let (enrolled, enrollment_error) = match &enrollment {
            Ok(id) => (Some(*id), None),
            Err(e) => {
                warn!(
                    process_id = %current.id,
                    target = %target,
                    error = %e,
                    "Could not enroll into branch target"
                );
                (None, Some(e.to_string()))
            }
        };

        let now = self.clock.now();
        let mut details = details;
        if let Some(map) = details.as_object_mut() {
            map.insert("target".into(), json!(target));
            map.insert("enrolled_process_id".into(), json!(enrolled));
            map.insert("enrollment_error".into(), json!(enrollment_error));
        }
        let committed = self.commit(current.id, token, |p| {
            if let Some(entry) = &tag_entry {
                p.record(entry.clone());
            }
            p.record(HistoryEntry::new(key, HistoryAction::Branched, now).with_details(details.clone()));
            p.status = ProcessStatus::Completed;
            p.next_wake_at = None;
            p.awaiting = None;
            p.lease = None;
        })?;

        match committed {
            Commit::Saved(saved) => {
                info!(
                    process_id = %saved.id,
                    target = %target,
                    enrolled = ?enrolled,
                    "Process branched to another chain"
                );
                metrics::counter!("chains.branched").increment(1);
                self.emit(ChainEventType::ChainBranched, &saved, Some(key.to_string()));
                Ok(Flow::Stop(ResumeOutcome::Branched {
                    target: target.to_string(),
                    enrolled,
                }))
            }
            Commit::Inactive(status) => Ok(Flow::Stop(ResumeOutcome::Inactive { status })),
        }
    }

    async fn run_drip(
        &self,
        process: &ChainProcess,
        step: &ChainStep,
        schedule: &DripSchedule,
        token: Uuid,
    ) -> ChainResult<Flow> {
        let pacing = AdaptivePacing::for_step(step, schedule);
        let state = pacing.reconstruct(&process.history);
        let cycle_key = step.cycle_key(state.cycles_evaluated);

        let sent_at = match process.checkpoint(&cycle_key) {
            Some(entry) => entry.timestamp,
            None => {
                let body = MessageBody::Template(step.template_key.clone());
                match self.send(process, &cycle_key, body, token).await? {
                    Ok(at) => at,
                    Err(outcome) => return Ok(Flow::Stop(outcome)),
                }
            }
        };

        let due = deadline_after(sent_at, state.current_wait);
        if self.clock.now() < due {
            return self.suspend(process.id, token, due);
        }

        let current = self.store.get_process(process.id)?;
        let signal = self.engagement.signal(&current.subscriber_id, sent_at, due);
        let (next_state, action) = pacing.decide(&current.history, &signal);
        let now = self.clock.now();
        let key = step.checkpoint_key();

        info!(
            process_id = %process.id,
            cycle = state.cycles_evaluated,
            engaged = signal.engaged(),
            consecutive_misses = next_state.consecutive_misses,
            next_wait_secs = next_state.current_wait.num_seconds(),
            "Drip cycle evaluated"
        );
        let evaluation = HistoryEntry::new(&key, HistoryAction::EngagementEvaluated, now).with_details(json!({
            "cycle": state.cycles_evaluated,
            "engaged": signal.engaged(),
            "signal": signal,
            "consecutive_misses": next_state.consecutive_misses,
            "next_wait_secs": next_state.current_wait.num_seconds(),
            "action": action.describe(),
        }));

        let committed = self.commit(process.id, token, |p| {
            p.record(evaluation.clone());
            match &action {
                NextAction::Advance => {
                    p.record(HistoryEntry::new(&key, HistoryAction::Advanced, now));
                    p.current_step_index += 1;
                    TimerService::arm(p, now);
                }
                NextAction::Repeat(_) => TimerService::arm(p, now),
                NextAction::BranchTo(_) | NextAction::Halt(_) => {}
            }
        })?;
        let saved = match committed {
            Commit::Saved(saved) => saved,
            Commit::Inactive(status) => return Ok(Flow::Stop(ResumeOutcome::Inactive { status })),
        };
        self.emit(ChainEventType::EngagementEvaluated, &saved, Some(cycle_key));

        match action {
            NextAction::Halt(reason) => Ok(Flow::Stop(self.halt(&saved, token, &key, reason)?)),
            _ => Ok(Flow::Continue(saved)),
        }
    }

    async fn run_approval(
        &self,
        process: &ChainProcess,
        definition: &ChainDefinition,
        step: &ChainStep,
        approval: &ApprovalStep,
        token: Uuid,
    ) -> ChainResult<Flow> {
        let key = step.checkpoint_key();
        if let Some(entry) = process.checkpoint(&key) {
            return self
                .after_send(process.id, definition, step, &key, entry.timestamp, token)
                .await;
        }

        let draft_id = match ApprovalGate::draft_for_step(process, &key) {
            Some(draft_id) => draft_id,
            None => match self.gate.open(process, &key, approval, Some(token)).await? {
                ApprovalOpened::Requested { draft_id, .. }
                | ApprovalOpened::GenerationFailed { draft_id } => draft_id,
            },
        };

        // A decision may already have landed while the request was out.
        let current = self.store.get_process(process.id)?;
        let draft = match self.gate.settle(&current, draft_id)? {
            Settlement::Waiting(deadline) => {
                return Ok(Flow::Stop(ResumeOutcome::AwaitingDecision { draft_id, deadline }));
            }
            Settlement::Resolved(draft) => draft,
        };

        if current.last_entry(&key, HistoryAction::ApprovalResolved).is_none() {
            let now = self.clock.now();
            let resolution = HistoryEntry::new(&key, HistoryAction::ApprovalResolved, now)
                .with_details(json!({ "draft_id": draft.id, "status": draft.status }));
            if let Commit::Inactive(status) = self.commit(current.id, token, |p| {
                p.record(resolution.clone());
                p.awaiting = None;
            })? {
                return Ok(Flow::Stop(ResumeOutcome::Inactive { status }));
            }
        }

        let body = match draft.status {
            DraftStatus::Approved => MessageBody::Content(draft.content.clone()),
            _ => MessageBody::Template(step.template_key.clone()),
        };
        let current = self.store.get_process(process.id)?;
        let sent_at = match self.send(&current, &key, body, token).await? {
            Ok(at) => at,
            Err(outcome) => return Ok(Flow::Stop(outcome)),
        };
        self.after_send(process.id, definition, step, &key, sent_at, token)
            .await
    }

    fn suspend(&self, process_id: ProcessId, token: Uuid, until: DateTime<Utc>) -> ChainResult<Flow> {
        let committed = self.commit(process_id, token, |p| TimerService::arm(p, until))?;
        Ok(Flow::Stop(match committed {
            Commit::Saved(_) => {
                debug!(process_id = %process_id, until = %until, "Process suspended");
                ResumeOutcome::Suspended { until }
            }
            Commit::Inactive(status) => ResumeOutcome::Inactive { status },
        }))
    }

    /// Ends the process early with `reason` recorded in history.
    fn halt(
        &self,
        process: &ChainProcess,
        token: Uuid,
        key: &str,
        reason: HaltReason,
    ) -> ChainResult<ResumeOutcome> {
        if let HaltReason::Inactive(status) = reason {
            return Ok(ResumeOutcome::Inactive { status });
        }

        let terminal = reason.terminal_status();
        let now = self.clock.now();
        let mut rejected = None;
        let committed = self.commit(process.id, token, |p| {
            if let Err(e) = self.state_machine.validate(p.id, p.status, terminal) {
                rejected = Some(e);
                return;
            }
            p.record(
                HistoryEntry::new(key, HistoryAction::Halted, now)
                    .with_details(json!({ "reason": reason.clone() })),
            );
            p.status = terminal;
            p.next_wake_at = None;
            p.awaiting = None;
            p.lease = None;
        })?;
        if let Some(e) = rejected {
            return Err(e);
        }

        match committed {
            Commit::Saved(saved) => {
                info!(process_id = %saved.id, reason = %reason, status = %terminal, "Process halted");
                metrics::counter!("chains.halted").increment(1);
                self.emit(ChainEventType::ChainHalted, &saved, Some(key.to_string()));
                Ok(ResumeOutcome::Halted { reason })
            }
            Commit::Inactive(status) => Ok(ResumeOutcome::Inactive { status }),
        }
    }

    fn complete(&self, process: &ChainProcess, token: Uuid) -> ChainResult<ResumeOutcome> {
        let now = self.clock.now();
        let committed = self.commit(process.id, token, |p| {
            p.record(HistoryEntry::new("chain", HistoryAction::Completed, now));
            p.status = ProcessStatus::Completed;
            p.next_wake_at = None;
            p.lease = None;
        })?;

        match committed {
            Commit::Saved(saved) => {
                info!(process_id = %saved.id, chain_id = %saved.chain_id, "Process completed");
                metrics::counter!("chains.completed").increment(1);
                self.emit(ChainEventType::ChainCompleted, &saved, None);
                Ok(ResumeOutcome::Completed)
            }
            Commit::Inactive(status) => Ok(ResumeOutcome::Inactive { status }),
        }
    }
}

#[async_trait]
impl WakeHandler for ChainOrchestrator {
    async fn on_wake(&self, process_id: ProcessId) -> ChainResult<()> {
        let outcome = self.resume_step(process_id).await?;
        debug!(process_id = %process_id, ?outcome, "Wake handled");
        Ok(())
    }
}
