//! Error type of the queue components and the `JobQueue` facade.

use pipeq_core::{DomainError, JobId, JobState, WorkerId};

use super::store::StoreError;
use crate::config::ConfigError;

#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    /// The submission failed validation.
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The worker no longer holds the lease (reclaimed or reassigned).
    #[error("lease on job {job_id} is no longer held by {worker}")]
    LeaseExpired { job_id: JobId, worker: WorkerId },

    #[error("job {job_id} is already {state}")]
    AlreadyTerminal { job_id: JobId, state: JobState },

    #[error("job {job_id} is {state}, not dead_letter")]
    NotDeadLettered { job_id: JobId, state: JobState },

    #[error("failed to spawn thread {name}: {reason}")]
    Spawn { name: String, reason: String },
}

impl QueueError {
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::Store(e) if e.is_transient())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, QueueError::Store(StoreError::NotFound(_)))
    }
}
