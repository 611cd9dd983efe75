use crate::types::SimSeconds;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SimError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed configuration. Never retried.
    #[error("Invalid snapshot: {0}")]
    InvalidSnapshot(String),

    /// The scheduling loop can no longer make progress. The same snapshot
    /// reaches the same dead end on every attempt, so this is never retried.
    #[error("No progress possible at t={sim_seconds}s: {reason}")]
    NoProgress { sim_seconds: SimSeconds, reason: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Batch '{batch_id}' not found")]
    BatchNotFound { batch_id: String },

    #[error("Snapshot for batch '{batch_id}' not found")]
    SnapshotNotFound { batch_id: String },

    #[error("Run '{run_id}' not found")]
    RunNotFound { run_id: String },

    #[error("Event '{event_id}' not found in catalog")]
    EventNotFound { event_id: String },

    #[error("Work queue closed")]
    QueueClosed,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SimError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidSnapshot(message.into())
    }

    /// Configuration errors are permanent; everything else may succeed on retry.
    pub fn is_configuration_error(&self) -> bool {
        matches!(self, Self::InvalidSnapshot(_))
    }

    /// Errors that will repeat on every attempt of the same run.
    pub fn is_permanent(&self) -> bool {
        self.is_configuration_error() || matches!(self, Self::NoProgress { .. })
    }
}

pub type SimResult<T> = Result<T, SimError>;
