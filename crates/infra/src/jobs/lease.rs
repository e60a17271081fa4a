//! Lease Manager: time-bounded ownership of `processing` jobs.
//!
//! Delivery is at-least-once. A worker that stops renewing loses its job to
//! the sweeper once `lease_expires_at` passes, and the job runs again on
//! another worker. Handlers must therefore be idempotent (or key their side
//! effects on the job's idempotency key).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use pipeq_core::{Clock, Job, JobError, JobId, JobState, Lease, Transition, WorkerId};

use super::emitter::StatusEmitter;
use super::error::QueueError;
use super::store::{Expected, StoreError};

/// How a worker concluded its attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Completed,
    Failed(JobError),
    /// The handler honored a cancellation request.
    Canceled,
}

impl ReleaseOutcome {
    pub fn target_state(&self) -> JobState {
        match self {
            ReleaseOutcome::Completed => JobState::Completed,
            ReleaseOutcome::Failed(_) => JobState::Failed,
            ReleaseOutcome::Canceled => JobState::Canceled,
        }
    }
}

/// Lease state after a renewal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenewStatus {
    pub expires_at: DateTime<Utc>,
    /// Someone asked for this job to be canceled.
    pub cancel_requested: bool,
}

/// Jobs recovered by one reclaim pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    /// Returned to `pending` with attempts remaining.
    pub requeued: Vec<JobId>,
    /// Moved to `failed`; the Retry/DLQ Controller still has to decide them.
    pub exhausted: Vec<Job>,
    /// Canceled because cancellation was requested before the lease expired.
    pub canceled: Vec<JobId>,
}

impl ReclaimReport {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.exhausted.is_empty() && self.canceled.is_empty()
    }
}

pub struct LeaseManager {
    emitter: StatusEmitter,
    clock: Arc<dyn Clock>,
    lease_duration: Duration,
}

impl LeaseManager {
    pub fn new(emitter: StatusEmitter, clock: Arc<dyn Clock>, lease_duration: Duration) -> Self {
        Self {
            emitter,
            clock,
            lease_duration,
        }
    }

    pub fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    fn expiry(&self, now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
        now + chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
    }

    /// CAS `pending -> processing` under a lease owned by `worker`.
    pub fn claim(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        lease_duration: Duration,
    ) -> Result<Job, QueueError> {
        let now = self.clock.now();
        let lease = Lease {
            owner: worker.clone(),
            expires_at: self.expiry(now, lease_duration),
        };
        let job = self.emitter.transition(
            job_id,
            &Expected::state(JobState::Pending),
            JobState::Processing,
            Transition::claim(lease),
            now,
        )?;
        debug!(%job_id, %worker, lane = %job.lane, attempt = job.next_attempt(), "job claimed");
        Ok(job)
    }

    /// Extend the lease by `extension` from now.
    pub fn renew(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        extension: Duration,
    ) -> Result<RenewStatus, QueueError> {
        let now = self.clock.now();
        let job = self
            .emitter
            .store()
            .renew_lease(job_id, worker, self.expiry(now, extension), now)
            .map_err(|e| lease_error(e, job_id, worker))?;
        Ok(RenewStatus {
            expires_at: job.lease_expires_at().unwrap_or(now),
            cancel_requested: job.cancel_requested,
        })
    }

    /// Record the worker's outcome. Fails with `LeaseExpired` (changing
    /// nothing) when the lease was reclaimed or belongs to someone else.
    pub fn release(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        outcome: ReleaseOutcome,
    ) -> Result<Job, QueueError> {
        let now = self.clock.now();
        let to = outcome.target_state();
        let change = match outcome {
            ReleaseOutcome::Completed => Transition::complete(),
            ReleaseOutcome::Failed(error) => Transition::fail(error),
            ReleaseOutcome::Canceled => Transition::cancel_running(),
        };
        self.emitter
            .transition(job_id, &Expected::held_by(worker), to, change, now)
            .map_err(|e| lease_error(e, job_id, worker))
    }

    /// Recover `processing` jobs whose lease expired.
    ///
    /// Each recovery counts as a concluded attempt. Jobs with attempts left go
    /// back to `pending`; exhausted ones go to `failed`.
    pub fn reclaim_expired(&self, limit: usize) -> Result<ReclaimReport, QueueError> {
        let now = self.clock.now();
        let mut report = ReclaimReport::default();

        for job in self.emitter.store().expired_leases(now, limit)? {
            let owner = job.lease_owner().cloned();
            let expected = Expected::expired_lease(owner.as_ref(), now);
            let attempt = job.next_attempt();

            let result = if job.cancel_requested {
                self.emitter
                    .transition(
                        job.id,
                        &expected,
                        JobState::Canceled,
                        Transition::cancel_running(),
                        now,
                    )
                    .map(|j| report.canceled.push(j.id))
            } else if attempt >= job.max_attempts {
                let error = JobError::retryable(
                    format!("lease expired after attempt {attempt}"),
                    attempt,
                    now,
                );
                self.emitter
                    .transition(job.id, &expected, JobState::Failed, Transition::fail(error), now)
                    .map(|j| report.exhausted.push(j))
            } else {
                self.emitter
                    .transition(job.id, &expected, JobState::Pending, Transition::reclaim(), now)
                    .map(|j| report.requeued.push(j.id))
            };

            match result {
                Ok(()) => {
                    warn!(
                        job_id = %job.id,
                        tenant_id = %job.tenant_id,
                        worker = owner.as_ref().map(WorkerId::as_str).unwrap_or(""),
                        attempt,
                        "reclaimed expired lease"
                    );
                }
                // Released or renewed between the scan and the swap.
                Err(
                    StoreError::Conflict { .. }
                    | StoreError::LeaseLost { .. }
                    | StoreError::LeaseActive(_),
                ) => {}
                Err(e) => return Err(e.into()),
            }
        }

        if !report.is_empty() {
            info!(
                requeued = report.requeued.len(),
                exhausted = report.exhausted.len(),
                canceled = report.canceled.len(),
                "lease sweep finished"
            );
        }
        Ok(report)
    }
}

fn lease_error(err: StoreError, job_id: JobId, worker: &WorkerId) -> QueueError {
    match err {
        StoreError::LeaseLost { .. } | StoreError::Conflict { .. } => QueueError::LeaseExpired {
            job_id,
            worker: worker.clone(),
        },
        other => other.into(),
    }
}
