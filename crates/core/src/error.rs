use thiserror::Error;
use uuid::Uuid;

pub type ChainResult<T> = Result<T, ChainError>;

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("Subscriber {subscriber_id} already has an open process {existing} in chain {chain_id}")]
    DuplicateEnrollment {
        subscriber_id: String,
        chain_id: String,
        existing: Uuid,
    },

    #[error("Write conflict on process {process_id}: expected version {expected}, found {found}")]
    StoreWriteConflict {
        process_id: Uuid,
        expected: u64,
        found: u64,
    },

    #[error("Message delivery failed: {0}")]
    DeliveryFailed(String),

    #[error("Draft generation failed: {0}")]
    DraftGenerationFailed(String),

    #[error("Process {0} not found")]
    ProcessNotFound(Uuid),

    #[error("Draft {0} not found")]
    DraftNotFound(Uuid),

    #[error("Chain {0} not found")]
    ChainNotFound(String),

    #[error("Draft {draft_id} already resolved as {status}")]
    DraftAlreadyResolved { draft_id: Uuid, status: String },

    #[error("Invalid transition for process {process_id}: {from} -> {to}")]
    InvalidTransition {
        process_id: Uuid,
        from: String,
        to: String,
    },

    #[error("Lease on process {0} was lost to another worker")]
    LeaseLost(Uuid),

    #[error("Invalid chain definition: {0}")]
    InvalidDefinition(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ChainError {
    /// Write conflicts are the only errors a checkpoint writer retries.
    pub fn is_conflict(&self) -> bool {
        matches!(self, ChainError::StoreWriteConflict { .. })
    }
}
