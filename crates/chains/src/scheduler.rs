//! Durable timers and external-event waits.
//!
//! A timer is nothing more than `next_wake_at` on the stored process; the
//! [`WakeLoop`] polls for due processes and hands them to a [`WakeHandler`].
//! Nothing parks a task for the length of a wait, and a timer that fires
//! early, late or twice is absorbed by the orchestrator's own checks.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use dripline_core::config::SchedulerConfig;
use dripline_core::{ChainResult, Clock};

use crate::store::{update_with_retry, ProcessStore};
use crate::types::{ChainProcess, EventWait, ProcessId, deadline_after};

/// How an event wait stands at the moment it is inspected.
#[derive(Debug, Clone, PartialEq)]
pub enum WaitResolution {
    NotWaiting,
    Event(Value),
    TimedOut,
    Pending(DateTime<Utc>),
}

/// Whatever runs a process when its wake time arrives.
#[async_trait]
pub trait WakeHandler: Send + Sync {
    async fn on_wake(&self, process_id: ProcessId) -> ChainResult<()>;
}

#[derive(Clone)]
pub struct TimerService {
    store: Arc<dyn ProcessStore>,
    clock: Arc<dyn Clock>,
    notify: Arc<Notify>,
    max_write_retries: u32,
}

impl TimerService {
    pub fn new(store: Arc<dyn ProcessStore>, clock: Arc<dyn Clock>, max_write_retries: u32) -> Self {
        Self {
            store,
            clock,
            notify: Arc::new(Notify::new()),
            max_write_retries,
        }
    }

    /// Signalled whenever something becomes due immediately.
    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    /// Sets the wake time on a copy the caller is about to write.
    pub fn arm(process: &mut ChainProcess, when: DateTime<Utc>) {
        process.next_wake_at = Some(when);
    }

    /// Registers an event wait on a copy the caller is about to write and
    /// arms the timeout. Returns the deadline.
    pub fn register_wait(
        process: &mut ChainProcess,
        match_key: &str,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let deadline = deadline_after(now, timeout);
        process.awaiting = Some(EventWait {
            match_key: match_key.to_string(),
            registered_at: now,
            deadline,
            payload: None,
        });
        Self::arm(process, deadline);
        deadline
    }

    /// Wakes the loop if `when` is already due.
    pub fn nudge(&self, when: DateTime<Utc>) {
        if when <= self.clock.now() {
            self.notify.notify_one();
        }
    }

    /// Persists `next_wake_at` for the process.
    pub fn schedule_at(&self, process_id: ProcessId, when: DateTime<Utc>) -> ChainResult<ChainProcess> {
        let saved = update_with_retry(self.store.as_ref(), process_id, self.max_write_retries, |p| {
            Self::arm(p, when);
            Ok(())
        })?;
        debug!(process_id = %process_id, wake_at = %when, "Wake scheduled");
        self.nudge(when);
        Ok(saved)
    }

    /// Persists interest in the event correlated by `match_key`. The process
    /// wakes on the event or at the returned deadline, whichever is first.
    pub fn wait_for_event(
        &self,
        process_id: ProcessId,
        match_key: &str,
        timeout: Duration,
    ) -> ChainResult<DateTime<Utc>> {
        let now = self.clock.now();
        let mut deadline = now;
        update_with_retry(self.store.as_ref(), process_id, self.max_write_retries, |p| {
            deadline = Self::register_wait(p, match_key, timeout, now);
            Ok(())
        })?;
        debug!(process_id = %process_id, match_key, deadline = %deadline, "Waiting for event");
        Ok(deadline)
    }

    /// Hands `payload` to the process waiting on `match_key` and makes it due
    /// now. Returns the woken process, or `None` when nobody was waiting or
    /// the wait already had its event.
    pub fn deliver_event(&self, match_key: &str, payload: Value) -> ChainResult<Option<ProcessId>> {
        let Some(process_id) = self.store.find_awaiting(match_key) else {
            debug!(match_key, "No process waiting for event");
            return Ok(None);
        };

        let now = self.clock.now();
        let mut delivered = false;
        update_with_retry(self.store.as_ref(), process_id, self.max_write_retries, |p| {
            delivered = false;
            if let Some(wait) = p.awaiting.as_mut() {
                if wait.match_key == match_key && wait.payload.is_none() {
                    wait.payload = Some(payload.clone());
                    delivered = true;
                }
            }
            if delivered {
                Self::arm(p, now);
            }
            Ok(())
        })?;

        if !delivered {
            return Ok(None);
        }
        self.notify.notify_one();
        Ok(Some(process_id))
    }

    pub fn resolve(&self, process: &ChainProcess) -> WaitResolution {
        let Some(wait) = &process.awaiting else {
            return WaitResolution::NotWaiting;
        };
        if let Some(payload) = &wait.payload {
            return WaitResolution::Event(payload.clone());
        }
        if self.clock.now() >= wait.deadline {
            WaitResolution::TimedOut
        } else {
            WaitResolution::Pending(wait.deadline)
        }
    }
}

/// Background poller that resumes due processes.
pub struct WakeLoop {
    store: Arc<dyn ProcessStore>,
    clock: Arc<dyn Clock>,
    handler: Arc<dyn WakeHandler>,
    notify: Arc<Notify>,
    poll_interval: std::time::Duration,
    batch_size: usize,
    permits: Arc<Semaphore>,
}

impl WakeLoop {
    pub fn new(
        store: Arc<dyn ProcessStore>,
        timers: &TimerService,
        handler: Arc<dyn WakeHandler>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            store,
            clock: timers.clock.clone(),
            handler,
            notify: timers.notifier(),
            poll_interval: std::time::Duration::from_millis(config.poll_interval_ms.max(1)),
            batch_size: config.batch_size.max(1),
            permits: Arc::new(Semaphore::new(config.max_concurrent_resumes.max(1))),
        }
    }

    /// Resumes one batch of due processes and waits for all of them.
    /// Returns how many were dispatched.
    pub async fn run_due_once(&self) -> usize {
        let due = self.store.due_processes(self.clock.now(), self.batch_size);
        if due.is_empty() {
            return 0;
        }

        let mut tasks = JoinSet::new();
        let mut dispatched = 0;
        for process_id in due {
            let permit = match self.permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let handler = self.handler.clone();
            tasks.spawn(async move {
                let _permit = permit;
                if let Err(e) = handler.on_wake(process_id).await {
                    warn!(process_id = %process_id, error = %e, "Resume failed");
                }
            });
            dispatched += 1;
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Resume task aborted");
            }
        }

        metrics::counter!("chains.wakes_dispatched").increment(dispatched as u64);
        debug!(dispatched, "Wake batch finished");
        dispatched
    }

    /// Polls until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_ms = self.poll_interval.as_millis() as u64,
            batch_size = self.batch_size,
            "Wake loop started"
        );
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.notify.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            self.run_due_once().await;
        }

        info!("Wake loop stopped");
    }
}
