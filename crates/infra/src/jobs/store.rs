//! Job storage: the single source of truth for job status.
//!
//! Every state change goes through [`JobStore::transition`], a
//! compare-and-swap on the job's current state (and, for `processing` jobs,
//! its lease owner). A mismatch fails with `Conflict` or `LeaseLost`; nothing
//! is ever overwritten blindly.

use std::collections::{BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;

use pipeq_core::{
    DomainError, IdempotencyKey, Job, JobId, JobState, Lane, TenantId, Transition, WorkerId,
};

use super::idempotency::{IdempotencyIndex, InMemoryIdempotencyIndex, Reservation};

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job {job_id} is {actual}, expected {expected}")]
    Conflict {
        job_id: JobId,
        expected: JobState,
        actual: JobState,
    },
    #[error("job {job_id} is not leased to {worker}")]
    LeaseLost { job_id: JobId, worker: WorkerId },
    #[error("lease on job {0} has not expired")]
    LeaseActive(JobId),
    #[error("rejected transition: {0}")]
    InvalidTransition(#[from] DomainError),
    /// Transient backend failure; callers may retry.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// A stored row could not be decoded.
    #[error("corrupt job record: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Precondition of a compare-and-swap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expected {
    pub state: JobState,
    /// When set, the current lease must belong to this worker.
    pub owner: Option<WorkerId>,
    /// When set, the current lease must have expired by this instant.
    pub lease_expired_at: Option<DateTime<Utc>>,
}

impl Expected {
    pub fn state(state: JobState) -> Self {
        Self {
            state,
            owner: None,
            lease_expired_at: None,
        }
    }

    /// `processing` under a lease held by `owner`.
    pub fn held_by(owner: &WorkerId) -> Self {
        Self {
            owner: Some(owner.clone()),
            ..Self::state(JobState::Processing)
        }
    }

    /// `processing` under a lease that expired by `now`, still held by `owner`.
    pub fn expired_lease(owner: Option<&WorkerId>, now: DateTime<Utc>) -> Self {
        Self {
            owner: owner.cloned(),
            lease_expired_at: Some(now),
            ..Self::state(JobState::Processing)
        }
    }

    /// Check `job` against the precondition.
    pub fn check(&self, job: &Job) -> Result<(), StoreError> {
        if job.state != self.state {
            return Err(StoreError::Conflict {
                job_id: job.id,
                expected: self.state,
                actual: job.state,
            });
        }
        if let Some(owner) = &self.owner {
            if job.lease_owner() != Some(owner) {
                return Err(StoreError::LeaseLost {
                    job_id: job.id,
                    worker: owner.clone(),
                });
            }
        }
        if let Some(at) = self.lease_expired_at {
            if !job.lease.as_ref().is_some_and(|l| l.is_expired(at)) {
                return Err(StoreError::LeaseActive(job.id));
            }
        }
        Ok(())
    }
}

/// Result of an idempotent submit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Submission {
    pub job_id: JobId,
    /// `false` when the key already mapped to a job.
    pub created: bool,
}

/// Per-state job counts for one tenant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub retrying: usize,
    pub dead_letter: usize,
    pub canceled: usize,
}

impl JobStats {
    pub fn record(&mut self, state: JobState) {
        self.add(state, 1);
    }

    pub fn add(&mut self, state: JobState, count: usize) {
        let slot = match state {
            JobState::Pending => &mut self.pending,
            JobState::Processing => &mut self.processing,
            JobState::Completed => &mut self.completed,
            JobState::Failed => &mut self.failed,
            JobState::Retrying => &mut self.retrying,
            JobState::DeadLetter => &mut self.dead_letter,
            JobState::Canceled => &mut self.canceled,
        };
        *slot += count;
    }

    pub fn total(&self) -> usize {
        self.pending
            + self.processing
            + self.completed
            + self.failed
            + self.retrying
            + self.dead_letter
            + self.canceled
    }
}

/// Job store abstraction.
pub trait JobStore: Send + Sync {
    /// Insert a `pending` job unless its `(tenant_id, idempotency_key)` is
    /// already bound, in which case the bound job id is returned.
    fn submit(&self, job: Job) -> Result<Submission, StoreError>;

    fn get(&self, job_id: JobId) -> Result<Job, StoreError>;

    /// Compare-and-swap `expected -> to`, applying `change`.
    fn transition(
        &self,
        job_id: JobId,
        expected: &Expected,
        to: JobState,
        change: Transition,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError>;

    /// Push out the lease expiry of a `processing` job held by `owner`.
    fn renew_lease(
        &self,
        job_id: JobId,
        owner: &WorkerId,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError>;

    /// Flag a non-terminal job for cancellation. Terminal jobs are returned
    /// unchanged.
    fn request_cancel(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Job, StoreError>;

    /// Oldest-first `pending` jobs of `lane`, skipping `exclude` tenants.
    /// With `after`, the page starts strictly after that position.
    fn ready_in_lane(
        &self,
        lane: Lane,
        exclude: &[TenantId],
        after: Option<ReadyCursor>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError>;

    /// `processing` jobs whose lease expired at or before `now`.
    fn expired_leases(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, StoreError>;

    /// `retrying` jobs due at or before `now`.
    fn due_retries(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, StoreError>;

    /// `failed` jobs untouched since `cutoff`.
    fn stranded_failures(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError>;

    /// A tenant's jobs in creation order, optionally filtered by state.
    fn list_by_tenant(
        &self,
        tenant_id: TenantId,
        state: Option<JobState>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError>;

    fn stats(&self, tenant_id: TenantId) -> Result<JobStats, StoreError>;

    /// Drop idempotency entries of jobs that went terminal before `cutoff`.
    fn prune_idempotency(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;

    /// Unbind `key` if it still belongs to `job_id`.
    fn release_idempotency(
        &self,
        tenant_id: TenantId,
        key: &IdempotencyKey,
        job_id: JobId,
    ) -> Result<bool, StoreError>;
}

/// A position in a lane's dispatch order `(created_at, id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ReadyCursor {
    pub created_at: DateTime<Utc>,
    pub job_id: JobId,
}

impl ReadyCursor {
    pub fn at(job: &Job) -> Self {
        Self {
            created_at: job.created_at,
            job_id: job.id,
        }
    }
}

#[derive(Debug, Default)]
struct Tables {
    jobs: HashMap<JobId, Job>,
    /// Pending jobs per lane in dispatch order.
    ready: HashMap<Lane, BTreeSet<(DateTime<Utc>, JobId)>>,
}

impl Tables {
    fn mark_ready(&mut self, job: &Job) {
        self.ready
            .entry(job.lane)
            .or_default()
            .insert((job.created_at, job.id));
    }

    fn unmark_ready(&mut self, job: &Job) {
        if let Some(lane) = self.ready.get_mut(&job.lane) {
            lane.remove(&(job.created_at, job.id));
        }
    }
}

/// In-memory job store for tests, dev and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    tables: RwLock<Tables>,
    index: InMemoryIdempotencyIndex,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of stored jobs across all tenants.
    pub fn len(&self) -> usize {
        self.tables.read().map(|t| t.jobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn index(&self) -> &InMemoryIdempotencyIndex {
        &self.index
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, StoreError> {
        self.tables
            .read()
            .map_err(|_| StoreError::Unavailable("job table lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, StoreError> {
        self.tables
            .write()
            .map_err(|_| StoreError::Unavailable("job table lock poisoned".into()))
    }

    fn scan<P, K>(&self, limit: usize, keep: P, order: K) -> Result<Vec<Job>, StoreError>
    where
        P: Fn(&Job) -> bool,
        K: Fn(&Job) -> (DateTime<Utc>, JobId),
    {
        let tables = self.read()?;
        let mut found: Vec<&Job> = tables.jobs.values().filter(|j| keep(j)).collect();
        found.sort_by_key(|j| order(j));
        Ok(found.into_iter().take(limit).cloned().collect())
    }
}

impl JobStore for InMemoryJobStore {
    fn submit(&self, job: Job) -> Result<Submission, StoreError> {
        let mut tables = self.write()?;
        match self.index.reserve(job.tenant_id, &job.idempotency_key, job.id)? {
            Reservation::Existing(job_id) => Ok(Submission {
                job_id,
                created: false,
            }),
            Reservation::Reserved => {
                let job_id = job.id;
                tables.mark_ready(&job);
                tables.jobs.insert(job_id, job);
                Ok(Submission {
                    job_id,
                    created: true,
                })
            }
        }
    }

    fn get(&self, job_id: JobId) -> Result<Job, StoreError> {
        self.read()?
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or(StoreError::NotFound(job_id))
    }

    fn transition(
        &self,
        job_id: JobId,
        expected: &Expected,
        to: JobState,
        change: Transition,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        let mut tables = self.write()?;
        let job = tables
            .jobs
            .get_mut(&job_id)
            .ok_or(StoreError::NotFound(job_id))?;
        expected.check(job)?;
        job.apply_transition(to, change, now)?;
        let job = job.clone();

        if expected.state == JobState::Pending {
            tables.unmark_ready(&job);
        }
        if to == JobState::Pending {
            tables.mark_ready(&job);
        }
        if to.is_terminal() {
            self.index
                .mark_terminal(job.tenant_id, &job.idempotency_key, job.id, now)?;
        }
        Ok(job)
    }

    fn renew_lease(
        &self,
        job_id: JobId,
        owner: &WorkerId,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        let mut tables = self.write()?;
        let job = tables
            .jobs
            .get_mut(&job_id)
            .ok_or(StoreError::NotFound(job_id))?;
        Expected::held_by(owner).check(job)?;
        if let Some(lease) = job.lease.as_mut() {
            lease.expires_at = lease.expires_at.max(expires_at);
        }
        job.updated_at = now;
        Ok(job.clone())
    }

    fn request_cancel(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Job, StoreError> {
        let mut tables = self.write()?;
        let job = tables
            .jobs
            .get_mut(&job_id)
            .ok_or(StoreError::NotFound(job_id))?;
        if !job.state.is_terminal() && !job.cancel_requested {
            job.cancel_requested = true;
            job.updated_at = now;
        }
        Ok(job.clone())
    }

    fn ready_in_lane(
        &self,
        lane: Lane,
        exclude: &[TenantId],
        after: Option<ReadyCursor>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        let tables = self.read()?;
        let Some(ready) = tables.ready.get(&lane) else {
            return Ok(Vec::new());
        };
        let start = match after {
            Some(c) => Bound::Excluded((c.created_at, c.job_id)),
            None => Bound::Unbounded,
        };
        Ok(ready
            .range((start, Bound::Unbounded))
            .filter_map(|(_, id)| tables.jobs.get(id))
            .filter(|j| !exclude.contains(&j.tenant_id))
            .take(limit)
            .cloned()
            .collect())
    }

    fn expired_leases(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, StoreError> {
        self.scan(
            limit,
            |j| {
                j.state == JobState::Processing
                    && j.lease.as_ref().is_some_and(|l| l.is_expired(now))
            },
            |j| (j.lease_expires_at().unwrap_or(j.updated_at), j.id),
        )
    }

    fn due_retries(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, StoreError> {
        self.scan(
            limit,
            |j| j.state == JobState::Retrying && j.retry_at.is_some_and(|at| at <= now),
            |j| (j.retry_at.unwrap_or(j.updated_at), j.id),
        )
    }

    fn stranded_failures(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        self.scan(
            limit,
            |j| j.state == JobState::Failed && j.updated_at <= cutoff,
            |j| (j.updated_at, j.id),
        )
    }

    fn list_by_tenant(
        &self,
        tenant_id: TenantId,
        state: Option<JobState>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        self.scan(
            limit,
            |j| j.tenant_id == tenant_id && state.is_none_or(|s| j.state == s),
            |j| (j.created_at, j.id),
        )
    }

    fn stats(&self, tenant_id: TenantId) -> Result<JobStats, StoreError> {
        let tables = self.read()?;
        let mut stats = JobStats::default();
        for job in tables.jobs.values().filter(|j| j.tenant_id == tenant_id) {
            stats.record(job.state);
        }
        Ok(stats)
    }

    fn prune_idempotency(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let _tables = self.write()?;
        self.index.prune(cutoff)
    }

    fn release_idempotency(
        &self,
        tenant_id: TenantId,
        key: &IdempotencyKey,
        job_id: JobId,
    ) -> Result<bool, StoreError> {
        let _tables = self.write()?;
        self.index.release(tenant_id, key, job_id)
    }
}
