//! Periodic maintenance: expired leases, due retries, stranded failures and
//! idempotency retention.

use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, error, info};

use super::error::QueueError;
use super::queue::QueueRuntime;
use super::retry::RetryDecision;

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Expired leases returned to `pending`.
    pub requeued: usize,
    /// Expired leases canceled on request.
    pub canceled: usize,
    /// Expired leases on their last attempt, handed to the retry decision.
    pub exhausted: usize,
    pub dead_lettered: usize,
    pub retried: usize,
    /// Due retries moved back to `pending`.
    pub promoted: usize,
    /// Due retries canceled on request.
    pub promoted_canceled: usize,
    /// `failed` jobs whose decision a crashed dispatcher never made.
    pub recovered: usize,
    /// Idempotency entries past retention.
    pub pruned: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub struct Sweeper {
    runtime: Arc<QueueRuntime>,
}

impl Sweeper {
    pub(crate) fn new(runtime: Arc<QueueRuntime>) -> Self {
        Self { runtime }
    }

    /// Run every maintenance phase once.
    pub fn sweep_once(&self) -> Result<SweepReport, QueueError> {
        let rt = &self.runtime;
        let batch = rt.config.sweep_batch_size;
        let mut report = SweepReport::default();

        let reclaimed = rt.leases.reclaim_expired(batch)?;
        report.requeued = reclaimed.requeued.len();
        report.canceled = reclaimed.canceled.len();
        report.exhausted = reclaimed.exhausted.len();
        for job in &reclaimed.exhausted {
            match rt.retry.on_failed(job)? {
                RetryDecision::DeadLettered => report.dead_lettered += 1,
                RetryDecision::Retrying { .. } => report.retried += 1,
                RetryDecision::Superseded => {}
            }
        }

        let promotion = rt.retry.promote_due(batch)?;
        report.promoted = promotion.promoted;
        report.promoted_canceled = promotion.canceled;

        report.recovered = rt
            .retry
            .recover_stranded(rt.config.effective_sweep_interval(), batch)?
            .len();

        let retention = chrono::Duration::from_std(rt.config.idempotency_retention)
            .unwrap_or(chrono::Duration::MAX);
        let cutoff = rt.clock.now() - retention;
        report.pruned = rt.store().prune_idempotency(cutoff)?;

        if report.is_empty() {
            debug!("sweep found nothing to do");
        } else {
            info!(
                requeued = report.requeued,
                canceled = report.canceled,
                dead_lettered = report.dead_lettered,
                promoted = report.promoted,
                recovered = report.recovered,
                pruned = report.pruned,
                "sweep finished"
            );
        }
        Ok(report)
    }

    /// Sweep every `effective_sweep_interval` on a background thread.
    pub fn spawn(self) -> Result<SweeperHandle, QueueError> {
        let interval = self.runtime.config.effective_sweep_interval();
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let name = "pipeq-sweeper".to_string();

        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                info!(interval_ms = interval.as_millis() as u64, "sweeper started");
                loop {
                    let started = Instant::now();
                    if let Err(e) = self.sweep_once() {
                        error!(error = %e, "sweep failed");
                    }
                    let wait = interval.saturating_sub(started.elapsed());
                    match shutdown_rx.recv_timeout(wait) {
                        Err(mpsc::RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    }
                }
                info!("sweeper stopped");
            })
            .map_err(|e| QueueError::Spawn {
                name,
                reason: e.to_string(),
            })?;

        Ok(SweeperHandle {
            shutdown: Some(shutdown_tx),
            join: Some(join),
        })
    }
}

/// Handle to stop a running sweeper.
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown: Option<mpsc::Sender<()>>,
    join: Option<thread::JoinHandle<()>>,
}

impl SweeperHandle {
    /// Stop after the current sweep and wait for the thread.
    pub fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}
