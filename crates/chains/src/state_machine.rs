use serde::{Deserialize, Serialize};

use dripline_core::{ChainError, ChainResult};

use crate::types::{ProcessId, ProcessStatus};

/// Describes a single valid status transition for a chain process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: ProcessStatus,
    pub to: ProcessStatus,
    pub trigger: String,
}

/// Guards the process lifecycle by enforcing a finite set of valid
/// status transitions. Cancelled and completed are terminal.
#[derive(Debug, Clone)]
pub struct ProcessStateMachine {
    pub transitions: Vec<StateTransition>,
}

impl ProcessStateMachine {
    pub fn new() -> Self {
        let transitions = vec![
            // Active ->
            StateTransition {
                from: ProcessStatus::Active,
                to: ProcessStatus::Paused,
                trigger: "pause".to_string(),
            },
            StateTransition {
                from: ProcessStatus::Active,
                to: ProcessStatus::Cancelled,
                trigger: "cancel".to_string(),
            },
            StateTransition {
                from: ProcessStatus::Active,
                to: ProcessStatus::Completed,
                trigger: "chain_complete".to_string(),
            },
            // Paused ->
            StateTransition {
                from: ProcessStatus::Paused,
                to: ProcessStatus::Active,
                trigger: "resume".to_string(),
            },
            StateTransition {
                from: ProcessStatus::Paused,
                to: ProcessStatus::Cancelled,
                trigger: "cancel_while_paused".to_string(),
            },
        ];

        Self { transitions }
    }

    /// Returns `true` if the given transition is allowed.
    pub fn can_transition(&self, from: ProcessStatus, to: ProcessStatus) -> bool {
        self.transitions.iter().any(|t| t.from == from && t.to == to)
    }

    /// Checks a transition for `process_id`, naming both ends on failure.
    pub fn validate(
        &self,
        process_id: ProcessId,
        from: ProcessStatus,
        to: ProcessStatus,
    ) -> ChainResult<()> {
        if self.can_transition(from, to) {
            Ok(())
        } else {
            Err(ChainError::InvalidTransition {
                process_id,
                from: from.to_string(),
                to: to.to_string(),
            })
        }
    }
}

impl Default for ProcessStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
