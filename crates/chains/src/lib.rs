//! Chain engine: multi-step, time-delayed, engagement-branching message
//! sequences with durable resumption, checkpointed sends, adaptive pacing
//! and an operator approval gate.

pub mod approval;
pub mod catalog;
pub mod demo;
pub mod engagement;
pub mod executor;
pub mod orchestrator;
pub mod policy;
pub mod scheduler;
pub mod state_machine;
pub mod store;
pub mod types;

pub use approval::ApprovalGate;
pub use catalog::ChainCatalog;
pub use executor::{StepExecutor, StepResult};
pub use orchestrator::{ChainOrchestrator, Collaborators, ResumeOutcome};
pub use policy::{AdaptivePacing, BranchingPolicy, NextAction};
pub use scheduler::{TimerService, WakeHandler, WakeLoop};
pub use store::{DraftStore, InMemoryStore, ProcessStore};
