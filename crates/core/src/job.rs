//! The job record and its transition rules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DomainError, DomainResult};
use crate::id::{JobId, PayloadRef, TenantId, UserId, WorkerId};
use crate::lane::Lane;
use crate::state::JobState;

/// Namespace for idempotency keys derived with [`IdempotencyKey::derive`].
const IDEMPOTENCY_NAMESPACE: Uuid = Uuid::from_u128(0x6a1f_2c3e_9b44_4d7a_8e21_5f0c_93d7_1b62);

/// Deterministic dedup key for logically identical work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Use a producer-supplied key verbatim.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Derive a key from `(tenant_id, operation_type, content_fingerprint)`.
    ///
    /// Equal inputs always produce equal keys (UUIDv5), across processes and
    /// releases.
    pub fn derive(tenant_id: TenantId, operation: &str, fingerprint: &str) -> Self {
        let name = format!("{tenant_id}\u{1f}{operation}\u{1f}{fingerprint}");
        let digest = Uuid::new_v5(&IDEMPOTENCY_NAMESPACE, name.as_bytes());
        Self(format!("{operation}:{digest}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a handler classified its failure.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Retryable,
    Terminal,
}

impl ErrorClass {
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorClass::Retryable => "retryable",
            ErrorClass::Terminal => "terminal",
        }
    }
}

/// Structured failure reason recorded on a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub class: ErrorClass,
    pub message: String,
    /// The attempt (1-based) that produced this error.
    pub attempt: u32,
    pub occurred_at: DateTime<Utc>,
}

impl JobError {
    pub fn retryable(message: impl Into<String>, attempt: u32, at: DateTime<Utc>) -> Self {
        Self {
            class: ErrorClass::Retryable,
            message: message.into(),
            attempt,
            occurred_at: at,
        }
    }

    pub fn terminal(message: impl Into<String>, attempt: u32, at: DateTime<Utc>) -> Self {
        Self {
            class: ErrorClass::Terminal,
            message: message.into(),
            attempt,
            occurred_at: at,
        }
    }
}

/// Time-bounded ownership of a `processing` job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub owner: WorkerId,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// A validated job submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewJob {
    pub tenant_id: TenantId,
    pub actor_id: UserId,
    pub lane: Lane,
    pub operation: String,
    pub idempotency_key: IdempotencyKey,
    pub payload_ref: PayloadRef,
    /// `None` means "use the queue default".
    pub max_attempts: Option<u32>,
    /// `None` means "use the configured cost for `operation`".
    pub cost: Option<u32>,
}

impl NewJob {
    pub fn new(
        tenant_id: TenantId,
        actor_id: UserId,
        lane: Lane,
        operation: impl Into<String>,
        idempotency_key: IdempotencyKey,
        payload_ref: PayloadRef,
    ) -> Self {
        Self {
            tenant_id,
            actor_id,
            lane,
            operation: operation.into(),
            idempotency_key,
            payload_ref,
            max_attempts: None,
            cost: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_cost(mut self, cost: u32) -> Self {
        self.cost = Some(cost);
        self
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.operation.trim().is_empty() {
            return Err(DomainError::validation("operation must not be empty"));
        }
        if self.idempotency_key.as_str().is_empty() {
            return Err(DomainError::validation("idempotency key must not be empty"));
        }
        if self.payload_ref.as_str().is_empty() {
            return Err(DomainError::validation("payload_ref must not be empty"));
        }
        if self.max_attempts == Some(0) {
            return Err(DomainError::validation("max_attempts must be at least 1"));
        }
        if self.cost == Some(0) {
            return Err(DomainError::validation("cost must be at least 1"));
        }
        Ok(())
    }
}

/// Side data carried by a state transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transition {
    /// Lease to install; required when entering `processing`.
    pub lease: Option<Lease>,
    /// The current attempt ends with this transition.
    pub conclude_attempt: bool,
    /// Failure to record; required when entering `failed`.
    pub error: Option<JobError>,
    /// When a `retrying` job becomes due; required when entering `retrying`.
    pub retry_at: Option<DateTime<Utc>>,
}

impl Transition {
    pub fn claim(lease: Lease) -> Self {
        Self {
            lease: Some(lease),
            ..Self::default()
        }
    }

    pub fn complete() -> Self {
        Self {
            conclude_attempt: true,
            ..Self::default()
        }
    }

    pub fn fail(error: JobError) -> Self {
        Self {
            conclude_attempt: true,
            error: Some(error),
            ..Self::default()
        }
    }

    /// Lease reclaim with attempts remaining.
    pub fn reclaim() -> Self {
        Self {
            conclude_attempt: true,
            ..Self::default()
        }
    }

    /// Handler honored cancellation.
    pub fn cancel_running() -> Self {
        Self {
            conclude_attempt: true,
            ..Self::default()
        }
    }

    pub fn schedule_retry(at: DateTime<Utc>) -> Self {
        Self {
            retry_at: Some(at),
            ..Self::default()
        }
    }

    /// No side data (`retrying -> pending`, `failed -> dead_letter`, `pending -> canceled`).
    pub fn plain() -> Self {
        Self::default()
    }
}

/// A unit of work tracked by the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub tenant_id: TenantId,
    pub actor_id: UserId,
    pub lane: Lane,
    pub operation: String,
    pub idempotency_key: IdempotencyKey,
    pub payload_ref: PayloadRef,
    pub state: JobState,
    /// Attempts that have concluded (handler outcome or lease reclaim).
    pub attempt_count: u32,
    pub max_attempts: u32,
    /// Fairness Gate tokens charged per dispatch.
    pub cost: u32,
    pub lease: Option<Lease>,
    pub retry_at: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
    pub last_error: Option<JobError>,
    pub error_history: Vec<JobError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Materialize a submission as a `pending` job.
    pub fn new(spec: NewJob, max_attempts: u32, cost: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            tenant_id: spec.tenant_id,
            actor_id: spec.actor_id,
            lane: spec.lane,
            operation: spec.operation,
            idempotency_key: spec.idempotency_key,
            payload_ref: spec.payload_ref,
            state: JobState::Pending,
            attempt_count: 0,
            max_attempts: spec.max_attempts.unwrap_or(max_attempts).max(1),
            cost: spec.cost.unwrap_or(cost).max(1),
            lease: None,
            retry_at: None,
            cancel_requested: false,
            last_error: None,
            error_history: Vec::new(),
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// The attempt number a worker claiming this job now would run (1-based).
    pub fn next_attempt(&self) -> u32 {
        self.attempt_count + 1
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }

    pub fn lease_owner(&self) -> Option<&WorkerId> {
        self.lease.as_ref().map(|l| &l.owner)
    }

    pub fn lease_expires_at(&self) -> Option<DateTime<Utc>> {
        self.lease.as_ref().map(|l| l.expires_at)
    }

    /// Apply `self.state -> to` with its side data.
    ///
    /// The caller is responsible for the compare-and-swap on the current state;
    /// this enforces the graph and the per-job invariants. On error `self` is
    /// left untouched.
    pub fn apply_transition(
        &mut self,
        to: JobState,
        change: Transition,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        self.state.check_transition(to)?;

        let attempts = if change.conclude_attempt {
            self.attempt_count + 1
        } else {
            self.attempt_count
        };
        if attempts > self.max_attempts + 1 {
            return Err(DomainError::invariant(format!(
                "attempt_count {attempts} exceeds max_attempts {} + 1",
                self.max_attempts
            )));
        }
        if to == JobState::Pending && attempts >= self.max_attempts {
            return Err(DomainError::invariant(format!(
                "job {} has exhausted {attempts}/{} attempts and cannot return to pending",
                self.id, self.max_attempts
            )));
        }

        let lease = match (to, change.lease) {
            (JobState::Processing, Some(lease)) => Some(lease),
            (JobState::Processing, None) => {
                return Err(DomainError::invariant("processing requires a lease"));
            }
            (_, _) => None,
        };

        let retry_at = match (to, change.retry_at) {
            (JobState::Retrying, Some(at)) => Some(at),
            (JobState::Retrying, None) => {
                return Err(DomainError::invariant("retrying requires a retry_at"));
            }
            (_, _) => None,
        };

        let last_error = match to {
            JobState::Failed => match change.error {
                Some(error) => {
                    self.error_history.push(error.clone());
                    Some(error)
                }
                None => return Err(DomainError::invariant("failed requires an error")),
            },
            JobState::DeadLetter => self.last_error.take(),
            _ => None,
        };

        self.state = to;
        self.attempt_count = attempts;
        self.lease = lease;
        self.retry_at = retry_at;
        self.last_error = last_error;
        self.updated_at = now;
        if to.is_terminal() {
            self.completed_at = Some(now);
        }
        Ok(())
    }
}
