//! End-to-end chain engine scenarios against in-memory stores and a manual
//! clock. Every scenario drives `resume_step` the way the wake loop would.

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::{DateTime, Duration, Utc};
    use parking_lot::Mutex;

    use dripline_chains::policy::{engagement_branches, AdaptivePacing};
    use dripline_chains::types::{
        ApprovalDecision, ApprovalDraft, ApprovalStep, CancelTrigger, ChainDefinition,
        ChainProcess, ChainStep, DraftId, DraftStatus, DripSchedule, EnrollmentContext,
        EnrollmentTrigger, HaltReason, HistoryAction, Lease, ProcessId, ProcessStatus, StepKind,
    };
    use dripline_chains::{
        ChainCatalog, ChainOrchestrator, Collaborators, DraftStore, InMemoryStore, ProcessStore,
        ResumeOutcome, WakeLoop,
    };
    use dripline_core::config::SchedulerConfig;
    use dripline_core::delivery::{
        DecisionNotifier, DecisionRequest, DeliveryReceipt, DraftGenerator, EventLogReader,
        MessageBody, MessageSender, OutboundMessage, TagWriter,
    };
    use dripline_core::event_bus::CaptureSink;
    use dripline_core::types::{ChainEventType, InteractionEvent, InteractionKind};
    use dripline_core::{AppConfig, ChainError, Clock, ManualClock};

    // ─── Collaborator fakes ─────────────────────────────────────────────

    struct RecordingMailer {
        clock: Arc<ManualClock>,
        sent: Mutex<Vec<(DateTime<Utc>, OutboundMessage)>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl MessageSender for RecordingMailer {
        async fn send(&self, message: &OutboundMessage) -> Result<DeliveryReceipt, String> {
            self.sent.lock().push((self.clock.now(), message.clone()));
            if self.fail.load(Ordering::SeqCst) {
                return Err("mailbox unavailable".to_string());
            }
            Ok(DeliveryReceipt {
                provider_message_id: format!("msg-{}", self.sent.lock().len()),
                accepted_at: self.clock.now(),
            })
        }
    }

    #[derive(Default)]
    struct MemoryLog(Mutex<Vec<InteractionEvent>>);

    impl MemoryLog {
        fn push(&self, subscriber_id: &str, kind: InteractionKind, at: DateTime<Utc>) {
            self.0.lock().push(InteractionEvent::new(subscriber_id, kind, at));
        }
    }

    impl EventLogReader for MemoryLog {
        fn events_for(
            &self,
            subscriber_id: &str,
            since: Option<DateTime<Utc>>,
            kinds: &[InteractionKind],
        ) -> Vec<InteractionEvent> {
            let mut events: Vec<_> = self
                .0
                .lock()
                .iter()
                .filter(|e| e.subscriber_id == subscriber_id && kinds.contains(&e.kind))
                .filter(|e| since.map(|s| e.occurred_at >= s).unwrap_or(true))
                .cloned()
                .collect();
            events.sort_by_key(|e| e.occurred_at);
            events
        }
    }

    #[derive(Default)]
    struct MemoryTags(Mutex<Vec<(String, String)>>);

    #[async_trait]
    impl TagWriter for MemoryTags {
        async fn add_tag(&self, subscriber_id: &str, tag: &str) -> anyhow::Result<()> {
            self.0.lock().push((subscriber_id.to_string(), tag.to_string()));
            Ok(())
        }

        async fn remove_tag(&self, subscriber_id: &str, tag: &str) -> anyhow::Result<()> {
            self.0
                .lock()
                .retain(|(s, t)| !(s == subscriber_id && t == tag));
            Ok(())
        }
    }

    #[derive(Default)]
    struct Writer {
        fail: AtomicBool,
    }

    #[async_trait]
    impl DraftGenerator for Writer {
        async fn generate_draft(
            &self,
            subscriber_id: &str,
            _instructions: &str,
            _context: &serde_json::Value,
        ) -> anyhow::Result<String> {
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("generation quota exhausted");
            }
            Ok(format!("Dear {}, thank you for being with us.", subscriber_id))
        }
    }

    #[derive(Default)]
    struct Inbox(Mutex<Vec<DecisionRequest>>);

    #[async_trait]
    impl DecisionNotifier for Inbox {
        async fn request_decision(&self, request: &DecisionRequest) -> anyhow::Result<()> {
            self.0.lock().push(request.clone());
            Ok(())
        }
    }

    // ─── Harness ────────────────────────────────────────────────────────

    struct Harness {
        clock: Arc<ManualClock>,
        store: Arc<InMemoryStore>,
        mailer: Arc<RecordingMailer>,
        log: Arc<MemoryLog>,
        tags: Arc<MemoryTags>,
        writer: Arc<Writer>,
        inbox: Arc<Inbox>,
        sink: Arc<CaptureSink>,
        engine: ChainOrchestrator,
    }

    /// Operator who answers from inside the request call.
    #[derive(Default)]
    struct InstantApprover {
        engine: Mutex<Option<ChainOrchestrator>>,
        decided: Mutex<Vec<DraftStatus>>,
    }

    #[async_trait]
    impl DecisionNotifier for InstantApprover {
        async fn request_decision(&self, request: &DecisionRequest) -> anyhow::Result<()> {
            let engine = self.engine.lock().clone();
            if let Some(engine) = engine {
                let draft = engine
                    .decide(request.draft_id, ApprovalDecision::Approved)
                    .await?;
                self.decided.lock().push(draft.status);
            }
            Ok(())
        }
    }

    /// Store that refuses every write adding a send checkpoint while `contend`
    /// is set, as if another writer always got there first.
    struct ContendedStore {
        inner: Arc<InMemoryStore>,
        contend: AtomicBool,
    }

    impl ProcessStore for ContendedStore {
        fn insert_process(&self, process: ChainProcess) -> Result<ChainProcess, ChainError> {
            self.inner.insert_process(process)
        }

        fn get_process(&self, id: ProcessId) -> Result<ChainProcess, ChainError> {
            self.inner.get_process(id)
        }

        fn update_process(&self, process: &ChainProcess) -> Result<ChainProcess, ChainError> {
            let stored = self.inner.get_process(process.id)?;
            let adds_checkpoint = process.history[stored.history.len().min(process.history.len())..]
                .iter()
                .any(|e| e.action.is_checkpoint());
            if self.contend.load(Ordering::SeqCst) && adds_checkpoint {
                return Err(ChainError::StoreWriteConflict {
                    process_id: process.id,
                    expected: process.version,
                    found: stored.version + 1,
                });
            }
            self.inner.update_process(process)
        }

        fn find_open(&self, subscriber_id: &str, chain_id: &str) -> Option<ChainProcess> {
            self.inner.find_open(subscriber_id, chain_id)
        }

        fn list_for_subscriber(&self, subscriber_id: &str) -> Vec<ChainProcess> {
            self.inner.list_for_subscriber(subscriber_id)
        }

        fn list_for_chain(&self, chain_id: &str) -> Vec<ChainProcess> {
            self.inner.list_for_chain(chain_id)
        }

        fn due_processes(&self, now: DateTime<Utc>, limit: usize) -> Vec<ProcessId> {
            self.inner.due_processes(now, limit)
        }

        fn find_awaiting(&self, match_key: &str) -> Option<ProcessId> {
            self.inner.find_awaiting(match_key)
        }
    }

    impl DraftStore for ContendedStore {
        fn insert_draft(&self, draft: ApprovalDraft) -> Result<(), ChainError> {
            self.inner.insert_draft(draft)
        }

        fn get_draft(&self, id: DraftId) -> Result<ApprovalDraft, ChainError> {
            self.inner.get_draft(id)
        }

        fn resolve_draft(
            &self,
            id: DraftId,
            status: DraftStatus,
            at: DateTime<Utc>,
        ) -> Result<ApprovalDraft, ChainError> {
            self.inner.resolve_draft(id, status, at)
        }
    }

    impl Harness {
        fn new(chains: Vec<ChainDefinition>) -> Self {
            let store = Arc::new(InMemoryStore::new());
            Self::build(chains, store.clone(), store, None)
        }

        /// `store` is what the assertions read; `engine_store` is what the
        /// engine writes through.
        fn build<S>(
            chains: Vec<ChainDefinition>,
            store: Arc<InMemoryStore>,
            engine_store: Arc<S>,
            notifier: Option<Arc<dyn DecisionNotifier>>,
        ) -> Self
        where
            S: ProcessStore + DraftStore + 'static,
        {
            let clock = Arc::new(ManualClock::default());
            let mailer = Arc::new(RecordingMailer {
                clock: clock.clone(),
                sent: Mutex::new(Vec::new()),
                fail: AtomicBool::new(false),
            });
            let log = Arc::new(MemoryLog::default());
            let tags = Arc::new(MemoryTags::default());
            let writer = Arc::new(Writer::default());
            let inbox = Arc::new(Inbox::default());
            let sink = Arc::new(CaptureSink::new());

            let catalog = ChainCatalog::new();
            for chain in chains {
                catalog.register(chain).unwrap();
            }

            let notifier: Arc<dyn DecisionNotifier> = match notifier {
                Some(notifier) => notifier,
                None => inbox.clone(),
            };

            let engine = ChainOrchestrator::new(
                catalog,
                engine_store,
                Collaborators {
                    sender: mailer.clone(),
                    event_log: log.clone(),
                    tags: tags.clone(),
                    drafts: writer.clone(),
                    notifier,
                },
                clock.clone(),
                &AppConfig::default(),
            )
            .with_event_sink(sink.clone());

            Self {
                clock,
                store,
                mailer,
                log,
                tags,
                writer,
                inbox,
                sink,
                engine,
            }
        }

        fn enroll(&self, chain_id: &str, subscriber_id: &str) -> ProcessId {
            self.engine
                .enroll(chain_id, subscriber_id, &context(subscriber_id))
                .unwrap()
        }

        async fn resume(&self, id: ProcessId) -> ResumeOutcome {
            self.engine.resume_step(id).await.unwrap()
        }

        fn sends(&self) -> Vec<(DateTime<Utc>, OutboundMessage)> {
            self.mailer.sent.lock().clone()
        }

        fn sent_bodies(&self) -> Vec<MessageBody> {
            self.sends().into_iter().map(|(_, m)| m.body).collect()
        }

        fn advance(&self, by: Duration) -> DateTime<Utc> {
            self.clock.advance(by)
        }

        fn now(&self) -> DateTime<Utc> {
            self.clock.now()
        }
    }

    fn context(subscriber_id: &str) -> EnrollmentContext {
        EnrollmentContext {
            email: format!("{}@example.com", subscriber_id),
            attributes: serde_json::json!({ "first_name": "Ada" }),
        }
    }

    fn send_step(position: u32, label: &str, wait_days: Option<i64>) -> ChainStep {
        ChainStep {
            position,
            label: label.to_string(),
            template_key: format!("{}_email", label.to_lowercase().replace(' ', "_")),
            wait_after_secs: wait_days.map(|d| (d * 86_400) as u64),
            kind: StepKind::Send,
        }
    }

    fn chain(id: &str, trigger: &str, steps: Vec<ChainStep>) -> ChainDefinition {
        ChainDefinition {
            id: id.to_string(),
            name: id.to_string(),
            description: String::new(),
            trigger_event: trigger.to_string(),
            steps,
            branches: Vec::new(),
            version: 1,
        }
    }

    fn onboarding() -> ChainDefinition {
        chain(
            "onboarding",
            "subscriber.created",
            vec![
                send_step(0, "Welcome", Some(2)),
                send_step(1, "Tips", Some(3)),
                send_step(2, "Wrap Up", None),
            ],
        )
    }

    fn split_chain() -> Vec<ChainDefinition> {
        let mut split = chain(
            "split",
            "subscriber.created",
            vec![send_step(0, "Intro", Some(1)), send_step(1, "Deep Dive", None)],
        );
        split.branches = engagement_branches(0, "fallback");
        vec![
            split,
            chain("fallback", "subscriber.inactive", vec![send_step(0, "Nudge", Some(3))]),
        ]
    }

    fn drip_chain() -> ChainDefinition {
        chain(
            "newsletter",
            "newsletter.opt_in",
            vec![ChainStep {
                position: 0,
                label: "Issue".to_string(),
                template_key: "newsletter_issue".to_string(),
                wait_after_secs: None,
                kind: StepKind::Drip(DripSchedule {
                    initial_wait_secs: 3 * 86_400,
                    escalated_wait_secs: 7 * 86_400,
                    miss_threshold: 3,
                    max_sends: 10,
                }),
            }],
        )
    }

    fn approval_chain() -> ChainDefinition {
        chain(
            "vip",
            "subscriber.vip",
            vec![ChainStep {
                position: 0,
                label: "Personal Note".to_string(),
                template_key: "vip_fallback".to_string(),
                wait_after_secs: None,
                kind: StepKind::Approval(ApprovalStep {
                    instructions: "Thank them".to_string(),
                    timeout_secs: None,
                }),
            }],
        )
    }

    // ─── Enrollment ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_only_one_open_process_per_subscriber_and_chain() {
        let h = Harness::new(vec![onboarding()]);
        let first = h.enroll("onboarding", "sub-1");

        let err = h
            .engine
            .enroll("onboarding", "sub-1", &context("sub-1"))
            .unwrap_err();
        assert!(matches!(err, ChainError::DuplicateEnrollment { existing, .. } if existing == first));

        h.engine.pause(first).unwrap();
        assert!(h.engine.enroll("onboarding", "sub-1", &context("sub-1")).is_err());

        h.engine.cancel(first, Some("test")).unwrap();
        let second = h.enroll("onboarding", "sub-1");
        assert_ne!(first, second);
        assert_eq!(h.engine.chain_stats("onboarding").unwrap().total, 2);
    }

    #[tokio::test]
    async fn test_enrollment_trigger_fans_out_to_listening_chains() {
        let mut chains = split_chain();
        chains.push(onboarding());
        let h = Harness::new(chains);

        let results = h.engine.handle_enrollment_trigger(&EnrollmentTrigger {
            trigger_key: "subscriber.created".to_string(),
            subscriber_id: "sub-1".to_string(),
            context: context("sub-1"),
        });
        let chain_ids: Vec<_> = results.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(chain_ids, vec!["onboarding", "split"]);
        assert!(results.iter().all(|(_, r)| r.is_ok()));
        assert_eq!(h.sink.count_type(ChainEventType::ChainEnrolled), 2);

        let cancelled = h
            .engine
            .cancel_trigger(&CancelTrigger {
                subscriber_id: "sub-1".to_string(),
                chain_id: None,
                match_key: Some("subscriber.created".to_string()),
                reason: Some("unsubscribed from onboarding".to_string()),
            })
            .unwrap();
        assert_eq!(cancelled.len(), 2);
    }

    #[tokio::test]
    async fn test_zero_step_chain_completes_immediately() {
        let h = Harness::new(vec![chain("empty", "noop", Vec::new())]);
        let id = h.enroll("empty", "sub-1");

        assert_eq!(h.resume(id).await, ResumeOutcome::Completed);
        assert_eq!(h.store.get_process(id).unwrap().status, ProcessStatus::Completed);
        assert!(h.sends().is_empty());
    }

    // ─── Idempotency ────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_resume_twice_sends_once() {
        let h = Harness::new(vec![onboarding()]);
        let id = h.enroll("onboarding", "sub-1");

        let first = h.resume(id).await;
        assert_eq!(
            first,
            ResumeOutcome::Suspended {
                until: h.now() + Duration::days(2)
            }
        );
        let after_first = h.store.get_process(id).unwrap();

        let second = h.resume(id).await;
        assert!(matches!(second, ResumeOutcome::NotYetDue { .. }));
        let after_second = h.store.get_process(id).unwrap();

        assert_eq!(h.sends().len(), 1);
        assert_eq!(after_first.history, after_second.history);
        assert_eq!(after_first.current_step_index, after_second.current_step_index);
        assert_eq!(after_first.next_wake_at, after_second.next_wake_at);

        // Duplicate wakes once due: the step is evaluated once, the next send once.
        h.advance(Duration::days(2));
        let (a, b) = tokio::join!(h.engine.resume_step(id), h.engine.resume_step(id));
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(h.sends().len(), 2);
        let process = h.store.get_process(id).unwrap();
        assert_eq!(process.current_step_index, 1);
        assert!(process.checkpoint("1:Tips").is_some());
    }

    #[tokio::test]
    async fn test_leased_process_is_busy() {
        let h = Harness::new(vec![onboarding()]);
        let id = h.enroll("onboarding", "sub-1");

        let mut held = h.store.get_process(id).unwrap();
        held.lease = Some(Lease {
            token: uuid::Uuid::new_v4(),
            expires_at: h.now() + Duration::minutes(5),
        });
        h.store.update_process(&held).unwrap();

        assert_eq!(h.resume(id).await, ResumeOutcome::Busy);
        assert!(h.sends().is_empty());

        // An expired lease is taken over.
        h.advance(Duration::minutes(6));
        assert!(matches!(h.resume(id).await, ResumeOutcome::Suspended { .. }));
        assert_eq!(h.sends().len(), 1);
    }

    #[tokio::test]
    async fn test_unwritable_checkpoint_fails_the_step() {
        let store = Arc::new(InMemoryStore::new());
        let contended = Arc::new(ContendedStore {
            inner: store.clone(),
            contend: AtomicBool::new(true),
        });
        let h = Harness::build(vec![onboarding()], store, contended.clone(), None);
        let id = h.enroll("onboarding", "sub-1");

        let err = h.engine.resume_step(id).await.unwrap_err();
        assert!(matches!(err, ChainError::StoreWriteConflict { .. }));

        let process = h.store.get_process(id).unwrap();
        assert_eq!(process.current_step_index, 0);
        assert!(process.checkpoint("0:Welcome").is_none());
        assert!(process
            .history
            .iter()
            .all(|e| e.action != HistoryAction::Advanced));
        assert!(process.lease.is_none());
        assert_eq!(process.next_wake_at, Some(h.now()));

        contended.contend.store(false, Ordering::SeqCst);
        assert!(matches!(h.resume(id).await, ResumeOutcome::Suspended { .. }));
        let process = h.store.get_process(id).unwrap();
        assert!(process.checkpoint("0:Welcome").is_some());
    }

    #[tokio::test]
    async fn test_delivery_failure_is_recorded_and_chain_continues() {
        let h = Harness::new(vec![onboarding()]);
        h.mailer.fail.store(true, Ordering::SeqCst);
        let id = h.enroll("onboarding", "sub-1");

        assert!(matches!(h.resume(id).await, ResumeOutcome::Suspended { .. }));
        let process = h.store.get_process(id).unwrap();
        let entry = process.checkpoint("0:Welcome").unwrap();
        assert_eq!(entry.action, HistoryAction::DeliveryFailed);
        assert_eq!(h.sink.count_type(ChainEventType::StepDeliveryFailed), 1);

        h.mailer.fail.store(false, Ordering::SeqCst);
        h.advance(Duration::days(2));
        h.resume(id).await;
        // The failed step is not retried; the chain moved on.
        assert_eq!(h.sends().len(), 2);
        assert_eq!(h.store.get_process(id).unwrap().current_step_index, 1);
    }

    // ─── Cancellation, pause, halts ─────────────────────────────────────

    #[tokio::test]
    async fn test_cancel_then_timer_fire_never_sends() {
        let h = Harness::new(vec![onboarding()]);
        let id = h.enroll("onboarding", "sub-1");
        h.resume(id).await;

        h.advance(Duration::hours(3));
        let cancelled = h.engine.cancel(id, Some("requested by subscriber")).unwrap();
        let cancelled_at = cancelled
            .last_entry("chain", HistoryAction::Cancelled)
            .unwrap()
            .timestamp;

        h.advance(Duration::days(5));
        assert_eq!(
            h.resume(id).await,
            ResumeOutcome::Inactive {
                status: ProcessStatus::Cancelled
            }
        );

        let wake_loop = WakeLoop::new(
            h.store.clone(),
            h.engine.timers(),
            Arc::new(h.engine.clone()),
            &SchedulerConfig::default(),
        );
        assert_eq!(wake_loop.run_due_once().await, 0);

        assert_eq!(h.sends().len(), 1);
        assert!(h.sends().iter().all(|(at, _)| *at <= cancelled_at));
        assert!(h.engine.cancel(id, None).is_err());
    }

    #[tokio::test]
    async fn test_pause_keeps_position_and_resume_rearms() {
        let h = Harness::new(vec![onboarding()]);
        let id = h.enroll("onboarding", "sub-1");
        h.resume(id).await;
        let wake_at = h.store.get_process(id).unwrap().next_wake_at;

        let paused = h.engine.pause(id).unwrap();
        assert_eq!(paused.next_wake_at, wake_at);

        h.advance(Duration::days(3));
        assert_eq!(
            h.resume(id).await,
            ResumeOutcome::Inactive {
                status: ProcessStatus::Paused
            }
        );

        let resumed = h.engine.resume(id).unwrap();
        assert_eq!(resumed.next_wake_at, Some(h.now()));
        assert!(matches!(h.resume(id).await, ResumeOutcome::Suspended { .. }));

        let labels: Vec<_> = h
            .sent_bodies()
            .into_iter()
            .map(|b| match b {
                MessageBody::Template(t) | MessageBody::Content(t) => t,
            })
            .collect();
        assert_eq!(labels, vec!["welcome_email", "tips_email"]);
    }

    #[tokio::test]
    async fn test_conversion_halts_as_completed() {
        let h = Harness::new(vec![onboarding()]);
        let id = h.enroll("onboarding", "sub-1");
        h.resume(id).await;
        h.log
            .push("sub-1", InteractionKind::Conversion, h.now() + Duration::hours(6));

        h.advance(Duration::days(2));
        assert_eq!(
            h.resume(id).await,
            ResumeOutcome::Halted {
                reason: HaltReason::Converted
            }
        );
        let process = h.store.get_process(id).unwrap();
        assert_eq!(process.status, ProcessStatus::Completed);
        assert!(process.last_entry("1:Tips", HistoryAction::Halted).is_some());
        assert_eq!(h.sends().len(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_halts_as_cancelled() {
        let h = Harness::new(vec![onboarding()]);
        let id = h.enroll("onboarding", "sub-1");
        h.resume(id).await;
        h.log
            .push("sub-1", InteractionKind::Unsubscribe, h.now() + Duration::hours(1));

        h.advance(Duration::days(2));
        assert_eq!(
            h.resume(id).await,
            ResumeOutcome::Halted {
                reason: HaltReason::Unsubscribed
            }
        );
        assert_eq!(h.store.get_process(id).unwrap().status, ProcessStatus::Cancelled);
        assert_eq!(h.sink.count_type(ChainEventType::ChainHalted), 1);
    }

    // ─── Branching ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_click_and_open_take_the_clicked_branch() {
        let h = Harness::new(split_chain());
        let id = h.enroll("split", "sub-1");
        h.resume(id).await;

        let sent_at = h.now();
        h.log.push("sub-1", InteractionKind::Open, sent_at + Duration::hours(1));
        h.log.push("sub-1", InteractionKind::Click, sent_at + Duration::hours(2));

        h.advance(Duration::days(1));
        assert_eq!(h.resume(id).await, ResumeOutcome::Completed);

        let tags: Vec<_> = h.tags.0.lock().iter().map(|(_, t)| t.clone()).collect();
        assert_eq!(tags, vec!["high-interest"]);
        assert!(h.store.find_open("sub-1", "fallback").is_none());
        assert_eq!(h.sends().len(), 2);
    }

    #[tokio::test]
    async fn test_open_only_redirects_to_fallback() {
        let h = Harness::new(split_chain());
        let id = h.enroll("split", "sub-1");
        h.resume(id).await;
        h.log
            .push("sub-1", InteractionKind::Open, h.now() + Duration::hours(1));
        // Engagement after the window closes does not count.
        h.log
            .push("sub-1", InteractionKind::Click, h.now() + Duration::days(2));

        h.advance(Duration::days(1));
        let outcome = h.resume(id).await;
        let ResumeOutcome::Branched { target, enrolled } = outcome.clone() else {
            panic!("Expected a branch, got {:?}", outcome);
        };
        assert_eq!(target, "fallback");

        let old = h.store.get_process(id).unwrap();
        assert_eq!(old.status, ProcessStatus::Completed);
        assert!(old.last_entry("0:Intro", HistoryAction::Branched).is_some());

        let new = h.store.find_open("sub-1", "fallback").unwrap();
        assert_eq!(Some(new.id), enrolled);
        assert_eq!(new.subscriber_email, "sub-1@example.com");

        let tags: Vec<_> = h.tags.0.lock().iter().map(|(_, t)| t.clone()).collect();
        assert_eq!(tags, vec!["low-interest"]);
        assert_eq!(h.sink.count_type(ChainEventType::ChainBranched), 1);
    }

    #[tokio::test]
    async fn test_ghosted_redirects_without_tag() {
        let h = Harness::new(split_chain());
        let id = h.enroll("split", "sub-1");
        h.resume(id).await;

        h.advance(Duration::days(1));
        assert!(matches!(h.resume(id).await, ResumeOutcome::Branched { .. }));
        assert!(h.tags.0.lock().is_empty());
        assert!(h.store.find_open("sub-1", "fallback").is_some());
    }

    // ─── Pacing ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_pacing_escalates_on_fourth_cycle_and_resets() {
        let h = Harness::new(vec![drip_chain()]);
        let id = h.enroll("newsletter", "sub-1");

        let p0 = Duration::days(3);
        let p1 = Duration::days(7);

        assert_eq!(h.resume(id).await, ResumeOutcome::Suspended { until: h.now() + p0 });
        for _ in 0..2 {
            h.advance(p0);
            assert_eq!(h.resume(id).await, ResumeOutcome::Suspended { until: h.now() + p0 });
        }

        // Third consecutive miss: the fourth send waits P1.
        h.advance(p0);
        assert_eq!(h.resume(id).await, ResumeOutcome::Suspended { until: h.now() + p1 });
        assert_eq!(h.sends().len(), 4);

        // One engaged cycle resets to P0.
        h.log
            .push("sub-1", InteractionKind::Open, h.now() + Duration::days(1));
        h.advance(p1);
        assert_eq!(h.resume(id).await, ResumeOutcome::Suspended { until: h.now() + p0 });
        assert_eq!(h.sends().len(), 5);

        let process = h.store.get_process(id).unwrap();
        let evaluated: Vec<bool> = process
            .history
            .iter()
            .filter(|e| e.action == HistoryAction::EngagementEvaluated)
            .map(|e| e.flag("engaged"))
            .collect();
        assert_eq!(evaluated, vec![false, false, false, true]);
    }

    #[tokio::test]
    async fn test_pacing_reconstructs_identically_after_restart() {
        let h = Harness::new(vec![drip_chain()]);
        let id = h.enroll("newsletter", "sub-1");
        h.resume(id).await;
        for _ in 0..4 {
            let now = h.store.get_process(id).unwrap().next_wake_at.unwrap();
            h.clock.set(now);
            h.resume(id).await;
        }

        let definition = drip_chain();
        let step = &definition.steps[0];
        let StepKind::Drip(schedule) = &step.kind else {
            panic!("drip step expected");
        };
        let pacing = AdaptivePacing::for_step(step, schedule);

        let before = pacing.reconstruct(&h.store.get_process(id).unwrap().history);
        let restored = InMemoryStore::from_snapshot(h.store.snapshot());
        let after = pacing.reconstruct(&restored.get_process(id).unwrap().history);

        assert_eq!(before, after);
        assert_eq!(before.consecutive_misses, 4);
        assert_eq!(before.current_wait, Duration::days(7));
    }

    // ─── Approval ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_approved_draft_is_sent_once() {
        let h = Harness::new(vec![approval_chain()]);
        let id = h.enroll("vip", "sub-1");

        let outcome = h.resume(id).await;
        let ResumeOutcome::AwaitingDecision { draft_id, deadline } = outcome.clone() else {
            panic!("Expected approval wait, got {:?}", outcome);
        };
        assert_eq!(deadline, h.now() + Duration::hours(24));
        assert_eq!(h.inbox.0.lock().len(), 1);
        assert!(h.sends().is_empty());

        h.advance(Duration::hours(2));
        let draft = h.engine.decide(draft_id, ApprovalDecision::Approved).await.unwrap();
        assert_eq!(draft.status, DraftStatus::Approved);
        assert_eq!(
            h.sent_bodies(),
            vec![MessageBody::Content(
                "Dear sub-1, thank you for being with us.".to_string()
            )]
        );
        assert_eq!(h.store.get_process(id).unwrap().status, ProcessStatus::Completed);

        let again = h.engine.decide(draft_id, ApprovalDecision::Rejected).await;
        assert!(matches!(again, Err(ChainError::DraftAlreadyResolved { .. })));
        assert_eq!(h.store.get_draft(draft_id).unwrap().status, DraftStatus::Approved);
        assert_eq!(h.sends().len(), 1);
    }

    #[tokio::test]
    async fn test_decision_during_request_sends_without_waiting_for_timeout() {
        let approver = Arc::new(InstantApprover::default());
        let store = Arc::new(InMemoryStore::new());
        let h = Harness::build(vec![approval_chain()], store.clone(), store, Some(approver.clone()));
        *approver.engine.lock() = Some(h.engine.clone());
        let id = h.enroll("vip", "sub-1");

        assert_eq!(h.resume(id).await, ResumeOutcome::Completed);
        assert_eq!(*approver.decided.lock(), vec![DraftStatus::Approved]);
        assert_eq!(
            h.sent_bodies(),
            vec![MessageBody::Content(
                "Dear sub-1, thank you for being with us.".to_string()
            )]
        );

        let process = h.store.get_process(id).unwrap();
        assert_eq!(process.status, ProcessStatus::Completed);
        assert!(process.awaiting.is_none());
        assert!(process.lease.is_none());

        h.advance(Duration::hours(25));
        assert_eq!(h.resume(id).await, ResumeOutcome::Inactive { status: ProcessStatus::Completed });
        assert_eq!(h.sends().len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_sends_fallback_once_and_expires_draft() {
        let h = Harness::new(vec![approval_chain()]);
        let id = h.enroll("vip", "sub-1");
        let ResumeOutcome::AwaitingDecision { draft_id, .. } = h.resume(id).await else {
            panic!("Expected approval wait");
        };

        // Early wake while waiting does nothing.
        h.advance(Duration::hours(12));
        assert!(matches!(h.resume(id).await, ResumeOutcome::NotYetDue { .. }));

        h.advance(Duration::hours(13));
        assert_eq!(h.resume(id).await, ResumeOutcome::Completed);
        assert_eq!(h.store.get_draft(draft_id).unwrap().status, DraftStatus::Expired);
        assert_eq!(
            h.sent_bodies(),
            vec![MessageBody::Template("vip_fallback".to_string())]
        );

        // A late decision is rejected and sends nothing.
        assert!(h
            .engine
            .decide(draft_id, ApprovalDecision::Approved)
            .await
            .is_err());
        assert_eq!(h.resume(id).await, ResumeOutcome::Inactive { status: ProcessStatus::Completed });
        assert_eq!(h.sends().len(), 1);
    }

    #[tokio::test]
    async fn test_rejection_sends_fallback() {
        let h = Harness::new(vec![approval_chain()]);
        let id = h.enroll("vip", "sub-1");
        let ResumeOutcome::AwaitingDecision { draft_id, .. } = h.resume(id).await else {
            panic!("Expected approval wait");
        };

        h.engine
            .decide(draft_id, ApprovalDecision::Rejected)
            .await
            .unwrap();
        assert_eq!(
            h.sent_bodies(),
            vec![MessageBody::Template("vip_fallback".to_string())]
        );
        let process = h.store.get_process(id).unwrap();
        assert!(process.awaiting.is_none());
        assert!(process
            .last_entry("0:Personal Note", HistoryAction::ApprovalResolved)
            .is_some());
    }

    #[tokio::test]
    async fn test_generation_failure_falls_back_immediately() {
        let h = Harness::new(vec![approval_chain()]);
        h.writer.fail.store(true, Ordering::SeqCst);
        let id = h.enroll("vip", "sub-1");

        assert_eq!(h.resume(id).await, ResumeOutcome::Completed);
        assert_eq!(
            h.sent_bodies(),
            vec![MessageBody::Template("vip_fallback".to_string())]
        );
        assert!(h.inbox.0.lock().is_empty());

        let process = h.store.get_process(id).unwrap();
        assert!(process
            .last_entry("0:Personal Note", HistoryAction::DraftGenerationFailed)
            .is_some());
    }

    #[tokio::test]
    async fn test_cancel_expires_pending_draft() {
        let h = Harness::new(vec![approval_chain()]);
        let id = h.enroll("vip", "sub-1");
        let ResumeOutcome::AwaitingDecision { draft_id, .. } = h.resume(id).await else {
            panic!("Expected approval wait");
        };

        h.engine.cancel(id, None).unwrap();
        assert_eq!(h.store.get_draft(draft_id).unwrap().status, DraftStatus::Expired);
        assert!(h
            .engine
            .decide(draft_id, ApprovalDecision::Approved)
            .await
            .is_err());
        assert!(h.sends().is_empty());
    }

    // ─── Wake loop ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_wake_loop_drives_due_processes() {
        let h = Harness::new(vec![onboarding()]);
        let ids: Vec<_> = ["a", "b", "c"].iter().map(|s| h.enroll("onboarding", s)).collect();

        let wake_loop = WakeLoop::new(
            h.store.clone(),
            h.engine.timers(),
            Arc::new(h.engine.clone()),
            &SchedulerConfig::default(),
        );
        assert_eq!(wake_loop.run_due_once().await, 3);
        assert_eq!(h.sends().len(), 3);
        assert_eq!(wake_loop.run_due_once().await, 0);

        h.advance(Duration::days(2));
        assert_eq!(wake_loop.run_due_once().await, 3);
        for id in ids {
            assert_eq!(h.store.get_process(id).unwrap().current_step_index, 1);
        }
    }
}
