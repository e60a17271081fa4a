//! Retry policy and the Retry/DLQ Controller.
//!
//! A job that lands in `failed` is either scheduled for another attempt
//! (`failed -> retrying`, later `retrying -> pending`) or quarantined
//! (`failed -> dead_letter`). Dead letters are never reprocessed
//! automatically.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::RngExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use pipeq_core::{Clock, ErrorClass, Job, JobId, JobState, Transition};

use super::emitter::StatusEmitter;
use super::error::QueueError;
use super::store::{Expected, StoreError};
use crate::config::ConfigError;

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt-1)
    #[default]
    Exponential,
}

/// Retry backoff configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
    /// Jitter fraction (0.0-1.0) applied symmetrically around the delay
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(5 * 60),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with fixed delays.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.2,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retrying after `attempt` (1-indexed) failed.
    ///
    /// `jitter_sample` in `[-1, 1]` scales the jitter band; `0.0` yields the
    /// nominal delay. The result never exceeds `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32, jitter_sample: f64) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(62) as i32);
                base_ms * exp
            }
        }
        .min(max_ms);

        let sample = if jitter_sample.is_finite() {
            jitter_sample.clamp(-1.0, 1.0)
        } else {
            0.0
        };
        let jittered = delay_ms + delay_ms * self.jitter * sample;

        Duration::from_millis(jittered.clamp(0.0, max_ms) as u64)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::Invalid("retry jitter must be within [0, 1]".into()));
        }
        if self.max_delay < self.base_delay {
            return Err(ConfigError::Invalid(
                "retry max_delay must not be below base_delay".into(),
            ));
        }
        Ok(())
    }
}

/// What the controller did with a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retrying { retry_at: DateTime<Utc> },
    DeadLettered,
    /// Another actor moved the job first.
    Superseded,
}

/// Counts from one `promote_due` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PromotionReport {
    pub promoted: usize,
    pub canceled: usize,
}

/// Decides `retrying` vs `dead_letter` and returns due retries to `pending`.
pub struct RetryController {
    emitter: StatusEmitter,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
}

impl RetryController {
    pub fn new(emitter: StatusEmitter, clock: Arc<dyn Clock>, policy: RetryPolicy) -> Self {
        Self {
            emitter,
            clock,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run the retry decision for a job in `failed`.
    pub fn on_failed(&self, job: &Job) -> Result<RetryDecision, QueueError> {
        let now = self.clock.now();
        let retryable = job
            .last_error
            .as_ref()
            .is_some_and(|e| e.class == ErrorClass::Retryable);

        let result = if retryable && !job.attempts_exhausted() {
            let retry_at = if job.cancel_requested {
                // Promote immediately so the cancellation settles.
                now
            } else {
                let sample: f64 = rand::rng().random_range(-1.0..=1.0);
                let delay = self.policy.delay_for_attempt(job.attempt_count, sample);
                now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX)
            };
            self.emitter
                .transition(
                    job.id,
                    &Expected::state(JobState::Failed),
                    JobState::Retrying,
                    Transition::schedule_retry(retry_at),
                    now,
                )
                .map(|_| {
                    debug!(
                        job_id = %job.id,
                        tenant_id = %job.tenant_id,
                        attempt = job.attempt_count,
                        %retry_at,
                        "retry scheduled"
                    );
                    RetryDecision::Retrying { retry_at }
                })
        } else {
            self.emitter
                .transition(
                    job.id,
                    &Expected::state(JobState::Failed),
                    JobState::DeadLetter,
                    Transition::plain(),
                    now,
                )
                .map(|_| {
                    warn!(
                        job_id = %job.id,
                        tenant_id = %job.tenant_id,
                        operation = %job.operation,
                        attempts = job.attempt_count,
                        error = job.last_error.as_ref().map(|e| e.message.as_str()).unwrap_or(""),
                        "job dead-lettered"
                    );
                    RetryDecision::DeadLettered
                })
        };

        match result {
            Ok(decision) => Ok(decision),
            Err(StoreError::Conflict { .. }) => Ok(RetryDecision::Superseded),
            Err(e) => Err(e.into()),
        }
    }

    /// Move due `retrying` jobs back to `pending`; cancel those whose
    /// cancellation was requested meanwhile.
    pub fn promote_due(&self, limit: usize) -> Result<PromotionReport, QueueError> {
        let now = self.clock.now();
        let mut report = PromotionReport::default();

        for job in self.emitter.store().due_retries(now, limit)? {
            match self.promote(&job, now) {
                Ok(JobState::Canceled) => report.canceled += 1,
                Ok(_) => report.promoted += 1,
                Err(StoreError::Conflict { .. }) => {
                    debug!(job_id = %job.id, "retry promoted elsewhere");
                }
                Err(e) => return Err(e.into()),
            }
        }

        if report.promoted + report.canceled > 0 {
            info!(
                promoted = report.promoted,
                canceled = report.canceled,
                "promoted due retries"
            );
        }
        Ok(report)
    }

    fn promote(&self, job: &Job, now: DateTime<Utc>) -> Result<JobState, StoreError> {
        let pending = self.emitter.transition(
            job.id,
            &Expected::state(JobState::Retrying),
            JobState::Pending,
            Transition::plain(),
            now,
        )?;
        if !pending.cancel_requested {
            return Ok(JobState::Pending);
        }
        let canceled = self.emitter.transition(
            job.id,
            &Expected::state(JobState::Pending),
            JobState::Canceled,
            Transition::plain(),
            now,
        )?;
        Ok(canceled.state)
    }

    /// Re-run the decision for jobs left in `failed` longer than `grace`.
    ///
    /// A dispatcher that crashed between recording the outcome and deciding
    /// the retry leaves such jobs behind.
    pub fn recover_stranded(
        &self,
        grace: Duration,
        limit: usize,
    ) -> Result<Vec<JobId>, QueueError> {
        let now = self.clock.now();
        let cutoff = now - chrono::Duration::from_std(grace).unwrap_or(chrono::Duration::MAX);
        let mut recovered = Vec::new();

        for job in self.emitter.store().stranded_failures(cutoff, limit)? {
            if self.on_failed(&job)? != RetryDecision::Superseded {
                recovered.push(job.id);
            }
        }
        if !recovered.is_empty() {
            warn!(count = recovered.len(), "recovered stranded failed jobs");
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn no_jitter(strategy: BackoffStrategy) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            strategy,
            jitter: 0.0,
        }
    }

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = no_jitter(BackoffStrategy::Exponential);

        assert_eq!(policy.delay_for_attempt(1, 0.0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2, 0.0), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3, 0.0), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4, 0.0), Duration::from_millis(800));
        assert_eq!(policy.delay_for_attempt(40, 0.0), Duration::from_secs(10));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy::fixed(Duration::from_millis(500));

        assert_eq!(policy.delay_for_attempt(1, 0.0), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(3, 1.0), Duration::from_millis(500));
    }

    #[test]
    fn jitter_moves_within_band() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.delay_for_attempt(1, 0.0), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(1, 1.0), Duration::from_millis(2_400));
        assert_eq!(policy.delay_for_attempt(1, -1.0), Duration::from_millis(1_600));
    }

    #[test]
    fn jitter_outside_unit_interval_is_rejected() {
        assert!(RetryPolicy::default().with_jitter(1.5).validate().is_err());
        assert!(RetryPolicy::default().validate().is_ok());
    }

    proptest! {
        /// Property: every delay lies within the jitter band around the nominal
        /// exponential delay and never exceeds the cap.
        #[test]
        fn delay_stays_within_jitter_band_and_cap(
            attempt in 1u32..30,
            sample in -1.0f64..=1.0,
        ) {
            let policy = RetryPolicy::default();
            let nominal = policy
                .delay_for_attempt(attempt, 0.0)
                .as_millis() as f64;
            let delay = policy.delay_for_attempt(attempt, sample).as_millis() as f64;

            prop_assert!(delay <= policy.max_delay.as_millis() as f64);
            prop_assert!(delay >= nominal * (1.0 - policy.jitter) - 1.0);
            prop_assert!(delay <= nominal * (1.0 + policy.jitter) + 1.0);
        }
    }
}
