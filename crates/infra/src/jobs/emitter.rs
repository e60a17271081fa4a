//! Status/Audit Emitter: commits a transition, then tells observers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use pipeq_core::{Job, JobId, JobState, Transition};
use pipeq_events::{StatusEvent, StatusSink};

use super::store::{Expected, JobStore, StoreError};

/// Wraps the store's compare-and-swap so every committed transition is
/// published exactly once, by the caller that won the swap.
#[derive(Clone)]
pub struct StatusEmitter {
    store: Arc<dyn JobStore>,
    sink: Arc<dyn StatusSink>,
}

impl StatusEmitter {
    pub fn new(store: Arc<dyn JobStore>, sink: Arc<dyn StatusSink>) -> Self {
        Self { store, sink }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn transition(
        &self,
        job_id: JobId,
        expected: &Expected,
        to: JobState,
        change: Transition,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        let job = self.store.transition(job_id, expected, to, change, now)?;
        debug!(
            %job_id,
            tenant_id = %job.tenant_id,
            lane = %job.lane,
            from = %expected.state,
            to = %to,
            attempt_count = job.attempt_count,
            "job transitioned"
        );
        self.sink.emit(StatusEvent::for_transition(&job, expected.state));
        Ok(job)
    }
}
