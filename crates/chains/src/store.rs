//! Process and draft persistence.
//!
//! The engine only talks to [`ProcessStore`] and [`DraftStore`]. The
//! in-memory implementation here backs development and tests and can be
//! snapshotted to disk so enrollments survive a restart.
//! Production: replace with PostgreSQL (row version column) or similar.

use std::path::Path;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use dripline_core::{ChainError, ChainResult};

use crate::types::{ApprovalDraft, ChainProcess, DraftId, DraftStatus, ProcessId};

pub trait ProcessStore: Send + Sync {
    /// Persists a new process. Fails with `DuplicateEnrollment` while another
    /// active or paused process exists for the same subscriber and chain.
    fn insert_process(&self, process: ChainProcess) -> ChainResult<ChainProcess>;

    fn get_process(&self, id: ProcessId) -> ChainResult<ChainProcess>;

    /// Version-checked write. `process.version` must equal the stored version;
    /// the returned copy carries the bumped version.
    fn update_process(&self, process: &ChainProcess) -> ChainResult<ChainProcess>;

    fn find_open(&self, subscriber_id: &str, chain_id: &str) -> Option<ChainProcess>;

    fn list_for_subscriber(&self, subscriber_id: &str) -> Vec<ChainProcess>;

    fn list_for_chain(&self, chain_id: &str) -> Vec<ChainProcess>;

    /// Active processes whose wake time has passed and that no worker holds,
    /// oldest wake first.
    fn due_processes(&self, now: DateTime<Utc>, limit: usize) -> Vec<ProcessId>;

    /// The open process currently waiting on `match_key`.
    fn find_awaiting(&self, match_key: &str) -> Option<ProcessId>;

    fn has_checkpoint(&self, id: ProcessId, step_name: &str) -> ChainResult<bool> {
        Ok(self.get_process(id)?.checkpoint(step_name).is_some())
    }
}

pub trait DraftStore: Send + Sync {
    fn insert_draft(&self, draft: ApprovalDraft) -> ChainResult<()>;

    fn get_draft(&self, id: DraftId) -> ChainResult<ApprovalDraft>;

    /// Moves a pending draft to `status`. Any other starting status fails with
    /// `DraftAlreadyResolved`, so each draft resolves exactly once.
    fn resolve_draft(
        &self,
        id: DraftId,
        status: DraftStatus,
        at: DateTime<Utc>,
    ) -> ChainResult<ApprovalDraft>;
}

/// Read-modify-write against the latest stored copy, retried on version
/// conflicts. Exhausting the retries returns the conflict to the caller: the
/// write did not happen.
pub fn update_with_retry<F>(
    store: &dyn ProcessStore,
    id: ProcessId,
    max_retries: u32,
    mut mutate: F,
) -> ChainResult<ChainProcess>
where
    F: FnMut(&mut ChainProcess) -> ChainResult<()>,
{
    let mut attempt = 0;
    loop {
        let mut process = store.get_process(id)?;
        mutate(&mut process)?;
        match store.update_process(&process) {
            Ok(saved) => return Ok(saved),
            Err(err) if err.is_conflict() && attempt < max_retries => {
                attempt += 1;
                metrics::counter!("chains.store_conflicts").increment(1);
                debug!(process_id = %id, attempt, "Process write conflict, retrying");
            }
            Err(err) => return Err(err),
        }
    }
}

/// Serializable image of the whole store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub taken_at: Option<DateTime<Utc>>,
    pub processes: Vec<ChainProcess>,
    pub drafts: Vec<ApprovalDraft>,
}

/// Thread-safe in-memory store backed by DashMap.
#[derive(Default)]
pub struct InMemoryStore {
    processes: DashMap<ProcessId, ChainProcess>,
    /// (subscriber_id, chain_id) -> id of the open process.
    open_index: DashMap<(String, String), ProcessId>,
    drafts: DashMap<DraftId, ApprovalDraft>,
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore")
            .field("processes", &self.processes.len())
            .field("drafts", &self.drafts.len())
            .finish()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            taken_at: Some(Utc::now()),
            processes: self.processes.iter().map(|r| r.value().clone()).collect(),
            drafts: self.drafts.iter().map(|r| r.value().clone()).collect(),
        }
    }

    /// Rebuilds a store from a snapshot. Leases are dropped: whoever held
    /// them did not survive the restart.
    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        let store = Self::new();
        for mut process in snapshot.processes {
            process.lease = None;
            if process.status.is_open() {
                store.open_index.insert(
                    (process.subscriber_id.clone(), process.chain_id.clone()),
                    process.id,
                );
            }
            store.processes.insert(process.id, process);
        }
        for draft in snapshot.drafts {
            store.drafts.insert(draft.id, draft);
        }
        info!(
            processes = store.processes.len(),
            drafts = store.drafts.len(),
            "Store restored from snapshot"
        );
        store
    }

    /// Writes the snapshot next to `path` and renames it into place.
    pub fn save_to(&self, path: impl AsRef<Path>) -> ChainResult<()> {
        let path = path.as_ref();
        let tmp = path.with_extension("tmp");
        let bytes = serde_json::to_vec(&self.snapshot())?;
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, path)?;
        debug!(path = %path.display(), "Store snapshot written");
        Ok(())
    }

    /// Loads a snapshot file, or starts empty when none exists yet.
    pub fn load_from(path: impl AsRef<Path>) -> ChainResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!(path = %path.display(), "No snapshot found, starting empty");
            return Ok(Self::new());
        }
        let raw = std::fs::read(path)?;
        let snapshot: StoreSnapshot = serde_json::from_slice(&raw)?;
        Ok(Self::from_snapshot(snapshot))
    }

    pub fn process_count(&self) -> usize {
        self.processes.len()
    }
}

impl ProcessStore for InMemoryStore {
    fn insert_process(&self, mut process: ChainProcess) -> ChainResult<ChainProcess> {
        let key = (process.subscriber_id.clone(), process.chain_id.clone());
        process.version = 1;

        match self.open_index.entry(key) {
            Entry::Occupied(mut slot) => {
                let existing = *slot.get();
                let still_open = self
                    .processes
                    .get(&existing)
                    .map(|p| p.status.is_open())
                    .unwrap_or(false);
                if still_open {
                    return Err(ChainError::DuplicateEnrollment {
                        subscriber_id: process.subscriber_id,
                        chain_id: process.chain_id,
                        existing,
                    });
                }
                slot.insert(process.id);
                self.processes.insert(process.id, process.clone());
            }
            Entry::Vacant(slot) => {
                slot.insert(process.id);
                self.processes.insert(process.id, process.clone());
            }
        }

        Ok(process)
    }

    fn get_process(&self, id: ProcessId) -> ChainResult<ChainProcess> {
        self.processes
            .get(&id)
            .map(|r| r.value().clone())
            .ok_or(ChainError::ProcessNotFound(id))
    }

    fn update_process(&self, process: &ChainProcess) -> ChainResult<ChainProcess> {
        let saved = {
            let mut stored = self
                .processes
                .get_mut(&process.id)
                .ok_or(ChainError::ProcessNotFound(process.id))?;

            if stored.version != process.version {
                return Err(ChainError::StoreWriteConflict {
                    process_id: process.id,
                    expected: process.version,
                    found: stored.version,
                });
            }

            let kept = stored.history.len();
            if process.history.len() < kept || process.history[..kept] != stored.history[..] {
                return Err(ChainError::Internal(anyhow!(
                    "history of process {} is append-only",
                    process.id
                )));
            }

            let mut next = process.clone();
            next.version = stored.version + 1;
            *stored = next.clone();
            next
        };

        if !saved.status.is_open() {
            let key = (saved.subscriber_id.clone(), saved.chain_id.clone());
            self.open_index.remove_if(&key, |_, id| *id == saved.id);
        }

        Ok(saved)
    }

    fn find_open(&self, subscriber_id: &str, chain_id: &str) -> Option<ChainProcess> {
        let key = (subscriber_id.to_string(), chain_id.to_string());
        let id = *self.open_index.get(&key)?;
        self.processes
            .get(&id)
            .map(|r| r.value().clone())
            .filter(|p| p.status.is_open())
    }

    fn list_for_subscriber(&self, subscriber_id: &str) -> Vec<ChainProcess> {
        let mut processes: Vec<_> = self
            .processes
            .iter()
            .filter(|r| r.value().subscriber_id == subscriber_id)
            .map(|r| r.value().clone())
            .collect();
        processes.sort_by_key(|p| p.created_at);
        processes
    }

    fn list_for_chain(&self, chain_id: &str) -> Vec<ChainProcess> {
        self.processes
            .iter()
            .filter(|r| r.value().chain_id == chain_id)
            .map(|r| r.value().clone())
            .collect()
    }

    fn due_processes(&self, now: DateTime<Utc>, limit: usize) -> Vec<ProcessId> {
        let mut due: Vec<(DateTime<Utc>, ProcessId)> = self
            .processes
            .iter()
            .filter_map(|r| {
                let p = r.value();
                let wake = p.next_wake_at?;
                let ready = p.status == crate::types::ProcessStatus::Active
                    && wake <= now
                    && !p.has_live_lease(now);
                ready.then_some((wake, p.id))
            })
            .collect();
        due.sort();
        due.into_iter().take(limit).map(|(_, id)| id).collect()
    }

    fn find_awaiting(&self, match_key: &str) -> Option<ProcessId> {
        self.processes
            .iter()
            .find(|r| {
                let p = r.value();
                p.status.is_open()
                    && p.awaiting
                        .as_ref()
                        .map(|w| w.match_key == match_key)
                        .unwrap_or(false)
            })
            .map(|r| *r.key())
    }
}

impl DraftStore for InMemoryStore {
    fn insert_draft(&self, draft: ApprovalDraft) -> ChainResult<()> {
        self.drafts.insert(draft.id, draft);
        Ok(())
    }

    fn get_draft(&self, id: DraftId) -> ChainResult<ApprovalDraft> {
        self.drafts
            .get(&id)
            .map(|r| r.value().clone())
            .ok_or(ChainError::DraftNotFound(id))
    }

    fn resolve_draft(
        &self,
        id: DraftId,
        status: DraftStatus,
        at: DateTime<Utc>,
    ) -> ChainResult<ApprovalDraft> {
        let mut draft = self.drafts.get_mut(&id).ok_or(ChainError::DraftNotFound(id))?;
        if draft.status != DraftStatus::Pending {
            return Err(ChainError::DraftAlreadyResolved {
                draft_id: id,
                status: draft.status.to_string(),
            });
        }
        draft.status = status;
        draft.resolved_at = Some(at);
        Ok(draft.clone())
    }
}
