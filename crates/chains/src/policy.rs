//! Branching and pacing decisions. Everything here is a pure function of
//! the definition, the process history and an engagement signal, so a
//! restarted engine reaches the same decisions from the same history.

use chrono::Duration;
use serde_json::json;

use crate::types::{
    BranchAction, BranchCondition, ChainBranch, ChainId, ChainStep, DripSchedule,
    EngagementSignal, HaltReason, HistoryAction, HistoryEntry, wait_secs,
};

/// What the orchestrator does once a step has been sent and evaluated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextAction {
    Advance,
    BranchTo(ChainId),
    Repeat(Duration),
    Halt(HaltReason),
}

impl NextAction {
    /// Compact form for history details.
    pub fn describe(&self) -> serde_json::Value {
        match self {
            NextAction::Advance => json!({ "type": "advance" }),
            NextAction::BranchTo(chain_id) => json!({ "type": "branch_to", "chain_id": chain_id }),
            NextAction::Repeat(wait) => json!({ "type": "repeat", "wait_secs": wait.num_seconds() }),
            NextAction::Halt(reason) => json!({ "type": "halt", "reason": reason.to_string() }),
        }
    }
}

/// Result of evaluating a step's branches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchOutcome {
    pub action: NextAction,
    pub tag: Option<String>,
    pub branch: Option<String>,
}

impl BranchOutcome {
    fn advance() -> Self {
        Self {
            action: NextAction::Advance,
            tag: None,
            branch: None,
        }
    }
}

/// Picks the branch to take after a step from the engagement signal.
#[derive(Debug, Clone, Default)]
pub struct BranchingPolicy;

impl BranchingPolicy {
    pub fn new() -> Self {
        Self
    }

    /// Chooses among `branches` by condition precedence, then declaration
    /// order. No branches, or none matching, means advance.
    pub fn decide(&self, branches: &[&ChainBranch], signal: &EngagementSignal) -> BranchOutcome {
        let chosen = branches
            .iter()
            .enumerate()
            .filter(|(_, b)| b.condition.matches(signal))
            .min_by_key(|(idx, b)| (b.condition.precedence(), *idx))
            .map(|(_, b)| *b);

        let Some(branch) = chosen else {
            return BranchOutcome::advance();
        };

        let action = match &branch.action {
            BranchAction::Advance => NextAction::Advance,
            BranchAction::BranchTo { chain_id } => NextAction::BranchTo(chain_id.clone()),
            BranchAction::Halt { reason } => NextAction::Halt(HaltReason::Policy(reason.clone())),
        };

        BranchOutcome {
            action,
            tag: branch.tag.clone(),
            branch: Some(branch.label.clone()),
        }
    }
}

/// The canonical engagement split: clickers continue down the success path
/// tagged high interest, openers are tagged low interest and redirected,
/// and subscribers who ghosted are redirected to the same fallback chain.
pub fn engagement_branches(position: u32, fallback_chain: &str) -> Vec<ChainBranch> {
    vec![
        ChainBranch {
            position,
            label: "clicked".to_string(),
            condition: BranchCondition::Clicked,
            action: BranchAction::Advance,
            tag: Some("high-interest".to_string()),
            description: "Clicked through, keep going".to_string(),
        },
        ChainBranch {
            position,
            label: "opened".to_string(),
            condition: BranchCondition::Opened,
            action: BranchAction::BranchTo {
                chain_id: fallback_chain.to_string(),
            },
            tag: Some("low-interest".to_string()),
            description: "Opened without clicking".to_string(),
        },
        ChainBranch {
            position,
            label: "ghosted".to_string(),
            condition: BranchCondition::Ghosted,
            action: BranchAction::BranchTo {
                chain_id: fallback_chain.to_string(),
            },
            tag: None,
            description: "No engagement at all".to_string(),
        },
    ]
}

/// Pacing derived from a drip step's evaluated cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingState {
    pub consecutive_misses: u32,
    pub current_wait: Duration,
    pub cycles_evaluated: u32,
}

/// Adaptive spacing for one drip step.
#[derive(Debug, Clone)]
pub struct AdaptivePacing {
    step_name: String,
    schedule: DripSchedule,
}

impl AdaptivePacing {
    pub fn for_step(step: &ChainStep, schedule: &DripSchedule) -> Self {
        Self {
            step_name: step.checkpoint_key(),
            schedule: schedule.clone(),
        }
    }

    fn initial_wait(&self) -> Duration {
        wait_secs(self.schedule.initial_wait_secs)
    }

    fn escalated_wait(&self) -> Duration {
        wait_secs(self.schedule.escalated_wait_secs)
    }

    /// Rebuilds the pacing state from this step's evaluation entries.
    pub fn reconstruct(&self, history: &[HistoryEntry]) -> PacingState {
        let evaluations = history.iter().filter(|e| {
            e.step_name == self.step_name && e.action == HistoryAction::EngagementEvaluated
        });
        let (misses, cycles) = evaluations.fold((0u32, 0u32), |(misses, cycles), entry| {
            let misses = if entry.flag("engaged") { 0 } else { misses + 1 };
            (misses, cycles + 1)
        });
        self.state(misses, cycles)
    }

    fn state(&self, consecutive_misses: u32, cycles_evaluated: u32) -> PacingState {
        let current_wait = if consecutive_misses >= self.schedule.miss_threshold {
            self.escalated_wait()
        } else {
            self.initial_wait()
        };
        PacingState {
            consecutive_misses,
            current_wait,
            cycles_evaluated,
        }
    }

    /// Folds a freshly observed cycle into the state reconstructed from
    /// `history` and decides what follows it.
    pub fn decide(
        &self,
        history: &[HistoryEntry],
        signal: &EngagementSignal,
    ) -> (PacingState, NextAction) {
        let before = self.reconstruct(history);
        let misses = if signal.engaged() {
            0
        } else {
            before.consecutive_misses + 1
        };
        let after = self.state(misses, before.cycles_evaluated + 1);

        let action = if signal.converted {
            NextAction::Halt(HaltReason::Converted)
        } else if after.cycles_evaluated >= self.schedule.max_sends {
            NextAction::Advance
        } else {
            NextAction::Repeat(after.current_wait)
        };
        (after, action)
    }
}
