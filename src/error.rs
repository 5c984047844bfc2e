//! Error taxonomy shared by the store, scheduler, worker pool, and service.
//!
//! Each variant maps to one of the error kinds callers are expected to branch
//! on; the CLI prints `error: <kind>: <message>` and picks its exit code from
//! the variant alone.

use thiserror::Error;

/// Errors surfaced by the scheduling engine.
#[derive(Debug, Error)]
pub enum SchedError {
    /// Bad arguments: empty command, cpus < 1, unknown state filter, etc.
    #[error("{0}")]
    Validation(String),

    /// No job with the given id.
    #[error("job not found: {0}")]
    NotFound(String),

    /// A transition was attempted that the state DAG does not allow.
    #[error("{0}")]
    IllegalTransition(String),

    /// Durability or I/O failure in the store.
    #[error("store error: {0}")]
    Store(#[source] sqlx::Error),

    /// The subprocess for a job could not be launched.
    #[error("failed to spawn process: {0}")]
    ProcessSpawn(String),

    /// A job exceeded its timeout.
    #[error("job exceeded its timeout")]
    Timeout,

    /// A job was found running with no owning process at pool start.
    #[error("orphaned by restart")]
    Orphaned,
}

impl SchedError {
    /// The taxonomy name used in the CLI's `error: <kind>: <message>` format.
    pub fn kind_name(&self) -> &'static str {
        match self {
            SchedError::Validation(_) => "ValidationError",
            SchedError::NotFound(_) => "NotFound",
            SchedError::IllegalTransition(_) => "IllegalTransition",
            SchedError::Store(_) => "StoreError",
            SchedError::ProcessSpawn(_) => "ProcessSpawnError",
            SchedError::Timeout => "Timeout",
            SchedError::Orphaned => "Orphaned",
        }
    }
}

impl From<sqlx::Error> for SchedError {
    fn from(e: sqlx::Error) -> Self {
        SchedError::Store(e)
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SchedError>;
