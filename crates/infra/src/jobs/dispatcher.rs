//! Dispatcher / worker pool.
//!
//! Each worker repeatedly plans a lane order, claims the oldest admissible
//! `pending` job, runs its handler and reports the outcome. Workers share no
//! lock beyond the store's compare-and-swap, so several pools (and several
//! hosts) can drain one store.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use pipeq_core::{Job, JobError, JobId, JobState, Lane, TenantId, UserId, WorkerId};

use super::error::QueueError;
use super::fairness::Admission;
use super::handler::{CancelSignal, HandlerOutcome, JobContext};
use super::lanes::{LaneScheduler, SlotPlan};
use super::lease::ReleaseOutcome;
use super::queue::QueueRuntime;
use super::retry::RetryDecision;
use super::store::{ReadyCursor, StoreError};
use crate::config::PoolConfig;

/// Result of one dispatch tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A job ran; `state` is where it settled after the attempt.
    Ran {
        job_id: JobId,
        lane: Lane,
        state: JobState,
    },
    /// The attempt finished after its lease was reclaimed; nothing recorded.
    LeaseLost { job_id: JobId },
    /// No admissible job. `throttled` counts Fairness Gate refusals this tick.
    Idle { throttled: usize },
}

/// Dispatcher runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherStats {
    pub dispatched: u64,
    pub completed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub canceled: u64,
    pub lease_lost: u64,
    pub throttled: u64,
    pub store_errors: u64,
    pub running: usize,
    pub uptime_secs: u64,
}

/// Handle to control a running pool.
#[derive(Debug)]
pub struct DispatcherHandle {
    pool: String,
    shutdown: Vec<mpsc::Sender<()>>,
    joins: Vec<thread::JoinHandle<()>>,
    stats: Arc<Mutex<DispatcherStats>>,
    started: Instant,
}

impl DispatcherHandle {
    pub fn pool(&self) -> &str {
        &self.pool
    }

    pub fn workers(&self) -> usize {
        self.joins.len()
    }

    /// Request graceful shutdown and wait for every worker to finish its
    /// current job.
    pub fn shutdown(mut self) {
        for tx in self.shutdown.drain(..) {
            let _ = tx.send(());
        }
        for join in self.joins.drain(..) {
            let _ = join.join();
        }
        info!(pool = %self.pool, "dispatcher stopped");
    }

    pub fn stats(&self) -> DispatcherStats {
        let mut stats = self
            .stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }
}

/// Drains the lanes of one pool.
pub struct Dispatcher {
    pool: PoolConfig,
    scheduler: LaneScheduler,
    runtime: Arc<QueueRuntime>,
    stats: Arc<Mutex<DispatcherStats>>,
}

impl Dispatcher {
    pub(crate) fn new(runtime: Arc<QueueRuntime>, pool: PoolConfig) -> Self {
        let scheduler = LaneScheduler::new(&pool.lanes, runtime.config.fairness_window);
        Self {
            pool,
            scheduler,
            runtime,
            stats: Arc::new(Mutex::new(DispatcherStats::default())),
        }
    }

    pub fn pool(&self) -> &PoolConfig {
        &self.pool
    }

    pub fn scheduler(&self) -> &LaneScheduler {
        &self.scheduler
    }

    pub fn stats(&self) -> DispatcherStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn update_stats(&self, f: impl FnOnce(&mut DispatcherStats)) {
        f(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }

    /// Claim and run at most one job as `worker`.
    pub fn dispatch_once(&self, worker: &WorkerId) -> Result<DispatchOutcome, QueueError> {
        let result = self.claim_next(worker).and_then(|claimed| match claimed {
            Claimed::Job(job, signal) => self.run(job, signal, worker),
            Claimed::Nothing { throttled } => Ok(DispatchOutcome::Idle { throttled }),
        });

        self.update_stats(|s| match &result {
            Ok(DispatchOutcome::Idle { throttled }) => s.throttled += *throttled as u64,
            Ok(DispatchOutcome::LeaseLost { .. }) => s.lease_lost += 1,
            Ok(DispatchOutcome::Ran { state, .. }) => match state {
                JobState::Completed => s.completed += 1,
                JobState::Retrying => s.retried += 1,
                JobState::DeadLetter => s.dead_lettered += 1,
                JobState::Canceled => s.canceled += 1,
                _ => {}
            },
            Err(e) if e.is_transient() => s.store_errors += 1,
            Err(_) => {}
        });
        result
    }

    fn claim_next(&self, worker: &WorkerId) -> Result<Claimed, QueueError> {
        let rt = &self.runtime;
        let plan = self.scheduler.plan();
        let mut throttled = 0;

        let page = rt.config.dispatch_batch_size;

        for &lane in &plan.order {
            // Pages through the whole lane. Tenants with an empty bucket are
            // excluded from later pages; throttled users are skipped in place.
            let mut blocked: Vec<TenantId> = Vec::new();
            let mut blocked_users: Vec<(TenantId, UserId)> = Vec::new();
            let mut after: Option<ReadyCursor> = None;
            loop {
                let batch = rt.store().ready_in_lane(lane, &blocked, after, page)?;
                let Some(last) = batch.last() else {
                    break;
                };
                after = Some(ReadyCursor::at(last));
                let exhausted = batch.len() < page;

                for job in batch {
                    if blocked.contains(&job.tenant_id)
                        || blocked_users.contains(&(job.tenant_id, job.actor_id))
                    {
                        continue;
                    }
                    match rt.gate.admit(job.tenant_id, job.actor_id, job.cost) {
                        Admission::Admitted => {}
                        Admission::TenantThrottled => {
                            throttled += 1;
                            blocked.push(job.tenant_id);
                            continue;
                        }
                        Admission::UserThrottled => {
                            throttled += 1;
                            blocked_users.push((job.tenant_id, job.actor_id));
                            continue;
                        }
                    }
                    if let Some(claimed) = self.try_claim(&job, worker, &plan)? {
                        return Ok(claimed);
                    }
                }

                if exhausted {
                    break;
                }
            }
        }

        Ok(Claimed::Nothing { throttled })
    }

    /// Claim one admitted candidate; `None` when another worker won it.
    fn try_claim(
        &self,
        job: &Job,
        worker: &WorkerId,
        plan: &SlotPlan,
    ) -> Result<Option<Claimed>, QueueError> {
        let rt = &self.runtime;
        // Registered before the claim so a cancel racing it still lands.
        let signal = CancelSignal::new();
        rt.signals.register(job.id, signal.clone());

        match rt.leases.claim(job.id, worker, rt.config.lease_duration) {
            Ok(claimed) => {
                self.scheduler.commit(plan);
                if claimed.cancel_requested {
                    signal.cancel();
                }
                Ok(Some(Claimed::Job(claimed, signal)))
            }
            Err(err) => {
                rt.signals.remove(job.id);
                rt.gate.refund(job.tenant_id, job.actor_id, job.cost);
                match err {
                    QueueError::Store(
                        StoreError::Conflict { .. } | StoreError::NotFound(_),
                    ) => {
                        debug!(job_id = %job.id, %worker, "lost claim race");
                        Ok(None)
                    }
                    other => Err(other),
                }
            }
        }
    }

    fn run(
        &self,
        job: Job,
        signal: CancelSignal,
        worker: &WorkerId,
    ) -> Result<DispatchOutcome, QueueError> {
        let rt = &self.runtime;
        let (job_id, lane) = (job.id, job.lane);
        let attempt = job.next_attempt();
        self.update_stats(|s| {
            s.dispatched += 1;
            s.running += 1;
        });

        let handler = rt
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .resolve(&job.operation);

        let outcome = match handler {
            None => {
                warn!(%job_id, operation = %job.operation, "no handler registered");
                ReleaseOutcome::Failed(JobError::terminal(
                    format!("no handler registered for {}", job.operation),
                    attempt,
                    rt.clock.now(),
                ))
            }
            Some(handler) => {
                debug!(
                    %job_id,
                    %worker,
                    %lane,
                    attempt,
                    operation = %job.operation,
                    "running handler"
                );
                let ctx = JobContext::new(&job, worker.clone(), signal, rt.leases.clone());
                let result =
                    panic::catch_unwind(AssertUnwindSafe(|| handler(&ctx, &job.payload_ref)));
                let now = rt.clock.now();
                match result {
                    Ok(Ok(HandlerOutcome::Completed)) => ReleaseOutcome::Completed,
                    Ok(Ok(HandlerOutcome::Canceled)) => ReleaseOutcome::Canceled,
                    Ok(Err(e)) => ReleaseOutcome::Failed(JobError {
                        class: e.class,
                        message: e.message,
                        attempt,
                        occurred_at: now,
                    }),
                    Err(panic) => ReleaseOutcome::Failed(JobError::retryable(
                        format!("handler panicked: {}", panic_message(panic.as_ref())),
                        attempt,
                        now,
                    )),
                }
            }
        };
        rt.signals.remove(job_id);
        self.update_stats(|s| s.running = s.running.saturating_sub(1));

        match rt.leases.release(job_id, worker, outcome) {
            Ok(released) if released.state == JobState::Failed => {
                let state = match rt.retry.on_failed(&released)? {
                    RetryDecision::Retrying { .. } => JobState::Retrying,
                    RetryDecision::DeadLettered => JobState::DeadLetter,
                    RetryDecision::Superseded => JobState::Failed,
                };
                Ok(DispatchOutcome::Ran { job_id, lane, state })
            }
            Ok(released) => Ok(DispatchOutcome::Ran {
                job_id,
                lane,
                state: released.state,
            }),
            Err(QueueError::LeaseExpired { .. }) => {
                warn!(%job_id, %worker, "lease lost before release; outcome discarded");
                Ok(DispatchOutcome::LeaseLost { job_id })
            }
            Err(e) => Err(e),
        }
    }

    /// Start `pool.workers` worker threads.
    pub fn spawn(self) -> Result<DispatcherHandle, QueueError> {
        let dispatcher = Arc::new(self);
        let pool = dispatcher.pool.name.clone();
        let mut handle = DispatcherHandle {
            pool: pool.clone(),
            shutdown: Vec::new(),
            joins: Vec::new(),
            stats: dispatcher.stats.clone(),
            started: Instant::now(),
        };

        for i in 0..dispatcher.pool.workers {
            let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
            let suffix = Uuid::now_v7().simple().to_string();
            let worker = WorkerId::new(format!("{pool}-{i}-{}", &suffix[24..]));
            let name = format!("{pool}-{i}");
            let dispatcher = dispatcher.clone();

            let spawned = thread::Builder::new()
                .name(name.clone())
                .spawn(move || worker_loop(dispatcher, worker, shutdown_rx));
            match spawned {
                Ok(join) => {
                    handle.shutdown.push(shutdown_tx);
                    handle.joins.push(join);
                }
                Err(e) => {
                    handle.shutdown();
                    return Err(QueueError::Spawn {
                        name,
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(
            pool = %pool,
            workers = handle.workers(),
            lanes = ?dispatcher.pool.lanes,
            "dispatcher started"
        );
        Ok(handle)
    }
}

enum Claimed {
    Job(Job, CancelSignal),
    Nothing { throttled: usize },
}

fn worker_loop(dispatcher: Arc<Dispatcher>, worker: WorkerId, shutdown_rx: mpsc::Receiver<()>) {
    let config = &dispatcher.runtime.config;
    let mut failures: u32 = 0;
    debug!(%worker, "worker started");

    loop {
        if !matches!(shutdown_rx.try_recv(), Err(mpsc::TryRecvError::Empty)) {
            break;
        }

        let wait = match dispatcher.dispatch_once(&worker) {
            Ok(DispatchOutcome::Idle { .. }) => {
                failures = 0;
                config.poll_interval
            }
            Ok(_) => {
                failures = 0;
                continue;
            }
            Err(e) => {
                failures = failures.saturating_add(1);
                let delay = store_backoff(config.poll_interval, config.store_retry_max, failures);
                error!(
                    %worker,
                    error = %e,
                    failures,
                    retry_in_ms = delay.as_millis() as u64,
                    "dispatch failed"
                );
                delay
            }
        };

        match shutdown_rx.recv_timeout(wait) {
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    debug!(%worker, "worker stopped");
}

/// `base * 2^failures`, capped at `max`.
fn store_backoff(base: Duration, max: Duration, failures: u32) -> Duration {
    let factor = 1u32 << failures.min(16);
    base.max(Duration::from_millis(1))
        .saturating_mul(factor)
        .min(max)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_backoff_doubles_up_to_cap() {
        let base = Duration::from_millis(100);
        let cap = Duration::from_secs(2);
        assert_eq!(store_backoff(base, cap, 1), Duration::from_millis(200));
        assert_eq!(store_backoff(base, cap, 3), Duration::from_millis(800));
        assert_eq!(store_backoff(base, cap, 10), cap);
        assert_eq!(store_backoff(base, cap, u32::MAX), cap);
    }

    #[test]
    fn panic_payloads_become_messages() {
        let caught = panic::catch_unwind(|| panic!("boom {}", 7)).unwrap_err();
        assert_eq!(panic_message(caught.as_ref()), "boom 7");
        let caught = panic::catch_unwind(|| std::panic::panic_any(42u8)).unwrap_err();
        assert_eq!(panic_message(caught.as_ref()), "non-string panic payload");
    }
}
