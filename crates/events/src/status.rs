//! Status/audit events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use pipeq_core::{Job, JobId, JobState, Lane, TenantId};

use crate::bus::EventBus;
use crate::in_memory_bus::InMemoryEventBus;

/// One committed state transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub job_id: JobId,
    pub tenant_id: TenantId,
    pub lane: Lane,
    pub from_state: JobState,
    pub to_state: JobState,
    pub attempt_count: u32,
    pub timestamp: DateTime<Utc>,
}

impl StatusEvent {
    /// Describe the transition that produced `job` (already in its new state).
    pub fn for_transition(job: &Job, from_state: JobState) -> Self {
        Self {
            job_id: job.id,
            tenant_id: job.tenant_id,
            lane: job.lane,
            from_state,
            to_state: job.state,
            attempt_count: job.attempt_count,
            timestamp: job.updated_at,
        }
    }
}

/// Receiver of status events.
///
/// Emission must not fail the transition that caused it, so sinks swallow
/// (and log) their own errors.
pub trait StatusSink: Send + Sync {
    fn emit(&self, event: StatusEvent);
}

impl StatusSink for InMemoryEventBus<StatusEvent> {
    fn emit(&self, event: StatusEvent) {
        let job_id = event.job_id;
        if let Err(err) = self.publish(event) {
            warn!(%job_id, error = ?err, "dropping status event");
        }
    }
}

/// Discards everything.
#[derive(Debug, Default, Copy, Clone)]
pub struct NullSink;

impl StatusSink for NullSink {
    fn emit(&self, _event: StatusEvent) {}
}
