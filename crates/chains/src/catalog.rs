//! Chain definition store. Definitions are validated once on registration
//! and never mutated afterwards; a changed chain is registered under a new
//! id or version.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::info;

use dripline_core::{ChainError, ChainResult};

use crate::types::{BranchAction, ChainDefinition, ChainId, StepKind, MAX_WAIT_SECS};

#[derive(Clone, Default)]
pub struct ChainCatalog {
    chains: Arc<DashMap<ChainId, Arc<ChainDefinition>>>,
}

impl std::fmt::Debug for ChainCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainCatalog")
            .field("chains", &self.chains.len())
            .finish()
    }
}

impl ChainCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and stores a definition. Steps are kept ordered by position.
    /// An id that is already registered is rejected.
    pub fn register(&self, mut definition: ChainDefinition) -> ChainResult<ChainId> {
        validate(&definition)?;
        definition.steps.sort_by_key(|s| s.position);
        let id = definition.id.clone();
        match self.chains.entry(id.clone()) {
            Entry::Occupied(existing) => Err(ChainError::InvalidDefinition(format!(
                "{}: already registered at version {}",
                id,
                existing.get().version
            ))),
            Entry::Vacant(slot) => {
                info!(
                    chain_id = %id,
                    name = %definition.name,
                    steps = definition.steps.len(),
                    "Registering chain"
                );
                slot.insert(Arc::new(definition));
                Ok(id)
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<ChainDefinition>> {
        self.chains.get(id).map(|r| r.value().clone())
    }

    pub fn list(&self) -> Vec<Arc<ChainDefinition>> {
        let mut chains: Vec<_> = self.chains.iter().map(|r| r.value().clone()).collect();
        chains.sort_by(|a, b| a.id.cmp(&b.id));
        chains
    }

    /// Chains started by the given trigger key.
    pub fn by_trigger(&self, trigger_key: &str) -> Vec<Arc<ChainDefinition>> {
        let mut chains: Vec<_> = self
            .chains
            .iter()
            .filter(|r| r.value().trigger_event == trigger_key)
            .map(|r| r.value().clone())
            .collect();
        chains.sort_by(|a, b| a.id.cmp(&b.id));
        chains
    }

    /// Loads an array of definitions from a JSON file.
    pub fn load_file(&self, path: impl AsRef<Path>) -> ChainResult<usize> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let definitions: Vec<ChainDefinition> = serde_json::from_str(&raw)?;
        let count = definitions.len();
        for definition in definitions {
            self.register(definition)?;
        }
        info!(path = %path.as_ref().display(), count, "Loaded chain definitions");
        Ok(count)
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }
}

fn validate(definition: &ChainDefinition) -> ChainResult<()> {
    let invalid = |msg: String| Err(ChainError::InvalidDefinition(format!("{}: {}", definition.id, msg)));

    if definition.id.trim().is_empty() {
        return invalid("chain id must not be empty".into());
    }

    let mut positions = HashSet::new();
    for step in &definition.steps {
        if !positions.insert(step.position) {
            return invalid(format!("duplicate step position {}", step.position));
        }
        if step.wait_after_secs.is_some_and(|secs| secs > MAX_WAIT_SECS) {
            return invalid(format!("step '{}' waits longer than {}s", step.label, MAX_WAIT_SECS));
        }
        match &step.kind {
            StepKind::Drip(schedule) => {
                if schedule.initial_wait_secs.max(schedule.escalated_wait_secs) > MAX_WAIT_SECS {
                    return invalid(format!(
                        "drip step '{}' waits longer than {}s",
                        step.label, MAX_WAIT_SECS
                    ));
                }
                if schedule.max_sends == 0 {
                    return invalid(format!("drip step '{}' must send at least once", step.label));
                }
                if schedule.miss_threshold == 0 {
                    return invalid(format!("drip step '{}' needs a miss threshold", step.label));
                }
            }
            StepKind::Approval(approval) => {
                if approval.timeout_secs.is_some_and(|secs| secs > MAX_WAIT_SECS) {
                    return invalid(format!(
                        "approval step '{}' times out later than {}s",
                        step.label, MAX_WAIT_SECS
                    ));
                }
            }
            StepKind::Send => {}
        }
    }

    for branch in &definition.branches {
        if !positions.contains(&branch.position) {
            return invalid(format!(
                "branch '{}' refers to missing step position {}",
                branch.label, branch.position
            ));
        }
        if let BranchAction::BranchTo { chain_id } = &branch.action {
            if chain_id.trim().is_empty() {
                return invalid(format!("branch '{}' has an empty target chain", branch.label));
            }
            if *chain_id == definition.id {
                return invalid(format!("branch '{}' redirects into its own chain", branch.label));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ApprovalStep, BranchCondition, ChainBranch, ChainStep, DripSchedule};

    fn step(position: u32, label: &str) -> ChainStep {
        ChainStep {
            position,
            label: label.to_string(),
            template_key: format!("{}_email", label.to_lowercase()),
            wait_after_secs: None,
            kind: StepKind::Send,
        }
    }

    fn definition(steps: Vec<ChainStep>, branches: Vec<ChainBranch>) -> ChainDefinition {
        ChainDefinition {
            id: "test-chain".to_string(),
            name: "Test".to_string(),
            description: String::new(),
            trigger_event: "signup".to_string(),
            steps,
            branches,
            version: 1,
        }
    }

    #[test]
    fn test_register_sorts_steps() {
        let catalog = ChainCatalog::new();
        catalog
            .register(definition(vec![step(2, "Third"), step(0, "First"), step(1, "Second")], vec![]))
            .unwrap();

        let stored = catalog.get("test-chain").unwrap();
        let labels: Vec<_> = stored.steps.iter().map(|s| s.label.as_str()).collect();
        assert_eq!(labels, vec!["First", "Second", "Third"]);
        assert_eq!(catalog.by_trigger("signup").len(), 1);
        assert!(catalog.by_trigger("purchase").is_empty());
    }

    #[test]
    fn test_zero_step_chain_is_valid() {
        let catalog = ChainCatalog::new();
        assert!(catalog.register(definition(vec![], vec![])).is_ok());
    }

    #[test]
    fn test_duplicate_positions_rejected() {
        let catalog = ChainCatalog::new();
        let err = catalog
            .register(definition(vec![step(0, "A"), step(0, "B")], vec![]))
            .unwrap_err();
        assert!(matches!(err, ChainError::InvalidDefinition(_)));
        assert!(catalog.is_empty());
    }

    #[test]
    fn test_branch_on_missing_step_rejected() {
        let catalog = ChainCatalog::new();
        let branch = ChainBranch {
            position: 5,
            label: "clicked".into(),
            condition: BranchCondition::Clicked,
            action: BranchAction::Advance,
            tag: None,
            description: String::new(),
        };
        assert!(catalog
            .register(definition(vec![step(0, "A")], vec![branch]))
            .is_err());
    }

    #[test]
    fn test_out_of_range_waits_rejected() {
        let catalog = ChainCatalog::new();
        let mut waiting = step(0, "Welcome");
        waiting.wait_after_secs = Some(u64::MAX);
        let err = catalog
            .register(definition(vec![waiting], vec![]))
            .unwrap_err();
        assert!(matches!(err, ChainError::InvalidDefinition(_)));

        let mut drip = step(0, "Newsletter");
        drip.kind = StepKind::Drip(DripSchedule {
            initial_wait_secs: 3 * 86_400,
            escalated_wait_secs: MAX_WAIT_SECS + 1,
            miss_threshold: 3,
            max_sends: 10,
        });
        assert!(catalog.register(definition(vec![drip], vec![])).is_err());

        let mut approval = step(0, "Outreach");
        approval.kind = StepKind::Approval(ApprovalStep {
            instructions: "Say hello".into(),
            timeout_secs: Some(u64::MAX),
        });
        assert!(catalog.register(definition(vec![approval], vec![])).is_err());
        assert!(catalog.is_empty());

        let mut longest = step(0, "Welcome");
        longest.wait_after_secs = Some(MAX_WAIT_SECS);
        assert!(catalog.register(definition(vec![longest], vec![])).is_ok());
    }

    #[test]
    fn test_registered_chain_is_not_replaced() {
        let catalog = ChainCatalog::new();
        catalog.register(definition(vec![step(0, "A")], vec![])).unwrap();

        let mut changed = definition(vec![step(0, "B"), step(1, "C")], vec![]);
        changed.version = 2;
        let err = catalog.register(changed).unwrap_err();
        assert!(matches!(err, ChainError::InvalidDefinition(_)));

        let stored = catalog.get("test-chain").unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.steps.len(), 1);
        assert_eq!(stored.steps[0].label, "A");
    }
}
