//! `JobQueue`: the producer-facing facade over the queue components.

use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use tracing::{debug, info};

use pipeq_core::{
    Clock, Job, JobId, JobState, NewJob, PayloadRef, SystemClock, TenantId, Transition, WorkerId,
};
use pipeq_events::{EventBus, InMemoryEventBus, StatusEvent, StatusSink, Subscription};

use super::dispatcher::{Dispatcher, DispatcherHandle, DispatchOutcome};
use super::emitter::StatusEmitter;
use super::error::QueueError;
use super::fairness::FairnessGate;
use super::handler::{CancelSignals, HandlerError, HandlerOutcome, HandlerRegistry, JobContext};
use super::lease::LeaseManager;
use super::retry::RetryController;
use super::store::{Expected, JobStats, JobStore, StoreError, Submission};
use super::sweeper::{Sweeper, SweeperHandle};
use crate::config::{PoolConfig, QueueConfig};

/// Attempts at cancelling a pending job before giving up on a racing claim.
const CANCEL_RETRIES: usize = 3;

/// What `cancel` achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The job was pending and is now `canceled`.
    Canceled,
    /// The job is running; its handler has been signaled.
    Signaled,
    /// The job is between attempts; it is canceled when its retry comes due.
    Deferred,
}

/// Components shared by the facade, the dispatchers and the sweeper.
pub(crate) struct QueueRuntime {
    pub(crate) config: QueueConfig,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) emitter: StatusEmitter,
    pub(crate) gate: FairnessGate,
    pub(crate) leases: Arc<LeaseManager>,
    pub(crate) retry: RetryController,
    pub(crate) handlers: RwLock<HandlerRegistry>,
    pub(crate) signals: CancelSignals,
}

impl QueueRuntime {
    pub(crate) fn store(&self) -> &Arc<dyn JobStore> {
        self.emitter.store()
    }
}

/// Tenant-scoped pipeline job queue.
///
/// ```ignore
/// let queue = JobQueue::new(Arc::new(InMemoryJobStore::new()), QueueConfig::default())?;
/// queue.register_handler("ingest.*", |ctx, payload| convert(ctx, payload));
/// let pools = queue.spawn_pools()?;
/// let sweeper = queue.spawn_sweeper()?;
/// let submission = queue.submit(new_job)?;
/// ```
pub struct JobQueue {
    runtime: Arc<QueueRuntime>,
    bus: Arc<InMemoryEventBus<StatusEvent>>,
    dispatcher: Dispatcher,
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>, config: QueueConfig) -> Result<Self, QueueError> {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn JobStore>,
        config: QueueConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, QueueError> {
        config.validate()?;

        let bus = Arc::new(InMemoryEventBus::new());
        let sink: Arc<dyn StatusSink> = bus.clone();
        let emitter = StatusEmitter::new(store, sink);
        let runtime = Arc::new(QueueRuntime {
            gate: FairnessGate::new(config.quotas.clone(), clock.clone()),
            leases: Arc::new(LeaseManager::new(
                emitter.clone(),
                clock.clone(),
                config.lease_duration,
            )),
            retry: RetryController::new(emitter.clone(), clock.clone(), config.retry.clone()),
            handlers: RwLock::new(HandlerRegistry::new()),
            signals: CancelSignals::new(),
            emitter,
            clock,
            config,
        });
        let dispatcher = Dispatcher::new(runtime.clone(), PoolConfig::all_lanes(1));

        Ok(Self {
            runtime,
            bus,
            dispatcher,
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.runtime.config
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        self.runtime.store()
    }

    pub fn leases(&self) -> &Arc<LeaseManager> {
        &self.runtime.leases
    }

    pub fn gate(&self) -> &FairnessGate {
        &self.runtime.gate
    }

    /// Idempotent submission: a second submit with the same
    /// `(tenant_id, idempotency_key)` returns the existing job.
    pub fn submit(&self, spec: NewJob) -> Result<Submission, QueueError> {
        spec.validate()?;
        let config = &self.runtime.config;
        let cost = spec
            .cost
            .unwrap_or_else(|| config.quotas.cost_for(&spec.operation));
        let job = Job::new(spec, config.default_max_attempts, cost, self.runtime.clock.now());
        let (tenant_id, lane) = (job.tenant_id, job.lane);

        let submission = self.store().submit(job)?;
        if submission.created {
            info!(job_id = %submission.job_id, %tenant_id, %lane, "job submitted");
        } else {
            debug!(job_id = %submission.job_id, %tenant_id, "duplicate submission");
        }
        Ok(submission)
    }

    pub fn get(&self, job_id: JobId) -> Result<Job, QueueError> {
        Ok(self.store().get(job_id)?)
    }

    /// Cancel a job.
    ///
    /// Pending jobs are canceled immediately and never claimed. Running jobs
    /// only get a cooperative signal; a handler that ignores it runs to
    /// completion. Retrying (or failed) jobs are canceled when their retry is
    /// promoted.
    pub fn cancel(&self, job_id: JobId) -> Result<CancelOutcome, QueueError> {
        let rt = &self.runtime;
        for _ in 0..CANCEL_RETRIES {
            let job = self.store().get(job_id)?;
            match job.state {
                JobState::Pending => {
                    let now = rt.clock.now();
                    match rt.emitter.transition(
                        job_id,
                        &Expected::state(JobState::Pending),
                        JobState::Canceled,
                        Transition::plain(),
                        now,
                    ) {
                        Ok(_) => {
                            info!(%job_id, tenant_id = %job.tenant_id, "pending job canceled");
                            return Ok(CancelOutcome::Canceled);
                        }
                        // Claimed in the meantime; look again.
                        Err(StoreError::Conflict { .. }) => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
                JobState::Processing => {
                    self.store().request_cancel(job_id, rt.clock.now())?;
                    let local = rt.signals.signal(job_id);
                    info!(%job_id, local, "cancellation signaled");
                    return Ok(CancelOutcome::Signaled);
                }
                JobState::Failed | JobState::Retrying => {
                    self.store().request_cancel(job_id, rt.clock.now())?;
                    info!(%job_id, state = %job.state, "cancellation deferred");
                    return Ok(CancelOutcome::Deferred);
                }
                state => return Err(QueueError::AlreadyTerminal { job_id, state }),
            }
        }

        // Still racing claims; leave a request the worker will see.
        self.store().request_cancel(job_id, rt.clock.now())?;
        rt.signals.signal(job_id);
        Ok(CancelOutcome::Signaled)
    }

    pub fn list_by_tenant(
        &self,
        tenant_id: TenantId,
        state: Option<JobState>,
        limit: usize,
    ) -> Result<Vec<Job>, QueueError> {
        Ok(self.store().list_by_tenant(tenant_id, state, limit)?)
    }

    pub fn list_dead_letters(
        &self,
        tenant_id: TenantId,
        limit: usize,
    ) -> Result<Vec<Job>, QueueError> {
        self.list_by_tenant(tenant_id, Some(JobState::DeadLetter), limit)
    }

    /// Operator resubmission of a dead-lettered job as a new job with a fresh
    /// attempt counter. The old job stays queryable.
    pub fn requeue_dead_letter(&self, job_id: JobId) -> Result<Submission, QueueError> {
        let job = self.store().get(job_id)?;
        if job.state != JobState::DeadLetter {
            return Err(QueueError::NotDeadLettered {
                job_id,
                state: job.state,
            });
        }

        self.store()
            .release_idempotency(job.tenant_id, &job.idempotency_key, job.id)?;
        let spec = NewJob::new(
            job.tenant_id,
            job.actor_id,
            job.lane,
            job.operation,
            job.idempotency_key,
            job.payload_ref,
        )
        .with_max_attempts(job.max_attempts)
        .with_cost(job.cost);

        let submission = self.submit(spec)?;
        info!(%job_id, new_job_id = %submission.job_id, "dead letter requeued");
        Ok(submission)
    }

    pub fn stats(&self, tenant_id: TenantId) -> Result<JobStats, QueueError> {
        Ok(self.store().stats(tenant_id)?)
    }

    /// Status events for every transition committed after this call.
    pub fn subscribe(&self) -> Subscription<StatusEvent> {
        self.bus.subscribe()
    }

    /// Register a handler for an operation type, a `prefix.*` pattern or `*`.
    pub fn register_handler<F>(&self, pattern: impl Into<String>, handler: F)
    where
        F: Fn(&JobContext, &PayloadRef) -> Result<HandlerOutcome, HandlerError>
            + Send
            + Sync
            + 'static,
    {
        self.runtime
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register(pattern, handler);
    }

    /// Run one dispatch tick over all lanes on the calling thread.
    pub fn dispatch_once(&self, worker: &WorkerId) -> Result<DispatchOutcome, QueueError> {
        self.dispatcher.dispatch_once(worker)
    }

    /// A dispatcher for `pool`, for callers that drive ticks themselves.
    pub fn dispatcher(&self, pool: PoolConfig) -> Dispatcher {
        Dispatcher::new(self.runtime.clone(), pool)
    }

    pub fn spawn_dispatcher(&self, pool: PoolConfig) -> Result<DispatcherHandle, QueueError> {
        self.dispatcher(pool).spawn()
    }

    /// Start every configured pool.
    pub fn spawn_pools(&self) -> Result<Vec<DispatcherHandle>, QueueError> {
        let pools = self.runtime.config.pools.clone();
        let mut handles = Vec::with_capacity(pools.len());
        for pool in pools {
            match self.spawn_dispatcher(pool) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    handles.into_iter().for_each(DispatcherHandle::shutdown);
                    return Err(e);
                }
            }
        }
        Ok(handles)
    }

    pub fn sweeper(&self) -> Sweeper {
        Sweeper::new(self.runtime.clone())
    }

    pub fn spawn_sweeper(&self) -> Result<SweeperHandle, QueueError> {
        self.sweeper().spawn()
    }
}
