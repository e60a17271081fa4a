//! Idempotency Index: `(tenant_id, idempotency_key) -> job_id`.
//!
//! ## Retention
//!
//! An entry lives for as long as its job is non-terminal. Once the job
//! reaches a terminal state the entry is kept for a bounded retention window
//! (24h by default) and then pruned by the sweeper. An identical submission
//! inside the window returns the finished job; one after the window creates a
//! fresh job. The window bounds index growth at the cost of dedup that only
//! reaches back that far.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use pipeq_core::{IdempotencyKey, JobId, TenantId};

use super::store::StoreError;

/// Result of an insert-if-absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    Reserved,
    /// The key already belongs to this job.
    Existing(JobId),
}

/// Deduplication index keyed on `(tenant_id, idempotency_key)`.
pub trait IdempotencyIndex: Send + Sync {
    /// Atomically bind the key to `job_id` unless it is already bound.
    fn reserve(
        &self,
        tenant_id: TenantId,
        key: &IdempotencyKey,
        job_id: JobId,
    ) -> Result<Reservation, StoreError>;

    fn lookup(
        &self,
        tenant_id: TenantId,
        key: &IdempotencyKey,
    ) -> Result<Option<JobId>, StoreError>;

    /// Start the retention window of the entry owned by `job_id`.
    fn mark_terminal(
        &self,
        tenant_id: TenantId,
        key: &IdempotencyKey,
        job_id: JobId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Drop entries whose job went terminal before `cutoff`.
    fn prune(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;

    /// Drop the entry if it still belongs to `job_id`.
    fn release(
        &self,
        tenant_id: TenantId,
        key: &IdempotencyKey,
        job_id: JobId,
    ) -> Result<bool, StoreError>;
}

#[derive(Debug, Clone)]
struct Entry {
    job_id: JobId,
    terminal_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct InMemoryIdempotencyIndex {
    entries: Mutex<HashMap<(TenantId, IdempotencyKey), Entry>>,
}

impl InMemoryIdempotencyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entries(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<(TenantId, IdempotencyKey), Entry>>, StoreError>
    {
        self.entries
            .lock()
            .map_err(|_| StoreError::Unavailable("idempotency index lock poisoned".into()))
    }
}

impl IdempotencyIndex for InMemoryIdempotencyIndex {
    fn reserve(
        &self,
        tenant_id: TenantId,
        key: &IdempotencyKey,
        job_id: JobId,
    ) -> Result<Reservation, StoreError> {
        let mut entries = self.entries()?;
        match entries.get(&(tenant_id, key.clone())) {
            Some(entry) => Ok(Reservation::Existing(entry.job_id)),
            None => {
                entries.insert(
                    (tenant_id, key.clone()),
                    Entry {
                        job_id,
                        terminal_at: None,
                    },
                );
                Ok(Reservation::Reserved)
            }
        }
    }

    fn lookup(
        &self,
        tenant_id: TenantId,
        key: &IdempotencyKey,
    ) -> Result<Option<JobId>, StoreError> {
        Ok(self
            .entries()?
            .get(&(tenant_id, key.clone()))
            .map(|e| e.job_id))
    }

    fn mark_terminal(
        &self,
        tenant_id: TenantId,
        key: &IdempotencyKey,
        job_id: JobId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if let Some(entry) = self.entries()?.get_mut(&(tenant_id, key.clone())) {
            if entry.job_id == job_id && entry.terminal_at.is_none() {
                entry.terminal_at = Some(at);
            }
        }
        Ok(())
    }

    fn prune(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut entries = self.entries()?;
        let before = entries.len();
        entries.retain(|_, e| e.terminal_at.is_none_or(|at| at >= cutoff));
        Ok(before - entries.len())
    }

    fn release(
        &self,
        tenant_id: TenantId,
        key: &IdempotencyKey,
        job_id: JobId,
    ) -> Result<bool, StoreError> {
        let mut entries = self.entries()?;
        let slot = (tenant_id, key.clone());
        if entries.get(&slot).is_some_and(|e| e.job_id == job_id) {
            entries.remove(&slot);
            return Ok(true);
        }
        Ok(false)
    }
}
