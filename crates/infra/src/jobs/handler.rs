//! Handler registration and the context a handler runs with.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use pipeq_core::{
    ErrorClass, IdempotencyKey, Job, JobId, Lane, PayloadRef, TenantId, UserId, WorkerId,
};

use super::error::QueueError;
use super::lease::{LeaseManager, RenewStatus};

/// Successful handler outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    Completed,
    /// The handler observed the cancellation signal and stopped.
    Canceled,
}

/// A handler failure, classified by the handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{class:?}: {message}")]
pub struct HandlerError {
    pub class: ErrorClass,
    pub message: String,
}

impl HandlerError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Retryable,
            message: message.into(),
        }
    }

    /// Skips retry; the job is dead-lettered.
    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Terminal,
            message: message.into(),
        }
    }
}

/// Job handler function type.
pub type JobHandler =
    Arc<dyn Fn(&JobContext, &PayloadRef) -> Result<HandlerOutcome, HandlerError> + Send + Sync>;

/// Routes operation types to handlers.
///
/// Resolution order: exact name, then the longest matching `prefix.*`
/// pattern, then `*`.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, JobHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, pattern: impl Into<String>, handler: F)
    where
        F: Fn(&JobContext, &PayloadRef) -> Result<HandlerOutcome, HandlerError>
            + Send
            + Sync
            + 'static,
    {
        self.handlers.insert(pattern.into(), Arc::new(handler));
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn resolve(&self, operation: &str) -> Option<JobHandler> {
        if let Some(h) = self.handlers.get(operation) {
            return Some(Arc::clone(h));
        }

        // e.g. "ingest.*" matches "ingest.convert"
        let category = self
            .handlers
            .iter()
            .filter_map(|(pattern, h)| {
                let prefix = pattern.strip_suffix(".*")?;
                let rest = operation.strip_prefix(prefix)?;
                rest.starts_with('.').then_some((prefix.len(), h))
            })
            .max_by_key(|(len, _)| *len);
        if let Some((_, h)) = category {
            return Some(Arc::clone(h));
        }

        self.handlers.get("*").map(Arc::clone)
    }
}

/// Cooperative cancellation flag shared between the queue and a handler.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal(Arc<AtomicBool>);

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Signals of the jobs running in this process.
#[derive(Debug, Default)]
pub struct CancelSignals {
    running: Mutex<HashMap<JobId, CancelSignal>>,
}

impl CancelSignals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a job for the duration of its attempt.
    pub fn register(&self, job_id: JobId, signal: CancelSignal) {
        self.lock().insert(job_id, signal);
    }

    pub fn remove(&self, job_id: JobId) {
        self.lock().remove(&job_id);
    }

    /// Raise the signal of a locally running job. Returns `false` if the job
    /// is not running here.
    pub fn signal(&self, job_id: JobId) -> bool {
        match self.lock().get(&job_id) {
            Some(signal) => {
                signal.cancel();
                true
            }
            None => false,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, CancelSignal>> {
        // Plain inserts and removes; a poisoned map is still usable.
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// What a handler knows about the attempt it is running.
pub struct JobContext {
    pub job_id: JobId,
    pub tenant_id: TenantId,
    pub actor_id: UserId,
    pub lane: Lane,
    pub operation: String,
    pub idempotency_key: IdempotencyKey,
    /// 1-based attempt number.
    pub attempt: u32,
    pub max_attempts: u32,
    pub worker: WorkerId,
    signal: CancelSignal,
    leases: Arc<LeaseManager>,
}

impl JobContext {
    pub fn new(
        job: &Job,
        worker: WorkerId,
        signal: CancelSignal,
        leases: Arc<LeaseManager>,
    ) -> Self {
        Self {
            job_id: job.id,
            tenant_id: job.tenant_id,
            actor_id: job.actor_id,
            lane: job.lane,
            operation: job.operation.clone(),
            idempotency_key: job.idempotency_key.clone(),
            attempt: job.next_attempt(),
            max_attempts: job.max_attempts,
            worker,
            signal,
            leases,
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.signal.is_canceled()
    }

    /// Extend the lease. A cancellation requested elsewhere raises the
    /// signal.
    pub fn renew(&self, extension: Duration) -> Result<RenewStatus, QueueError> {
        let status = self.leases.renew(self.job_id, &self.worker, extension)?;
        if status.cancel_requested {
            self.signal.cancel();
        }
        Ok(status)
    }
}
