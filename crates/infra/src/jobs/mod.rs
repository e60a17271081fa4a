//! Tenant-scoped pipeline job queue.
//!
//! ## Components
//!
//! - `JobStore`: durable job state with compare-and-swap transitions
//!   (in-memory or Postgres)
//! - `IdempotencyIndex`: `(tenant_id, idempotency_key) -> job_id`
//! - `LaneScheduler` + `FairnessGate`: which lane and which tenant go next
//! - `LeaseManager`: claim, renew, release and reclaim of `processing` jobs
//! - `RetryController`: backoff, dead-lettering and promotion of due retries
//! - `Dispatcher`: worker pools running registered handlers
//! - `Sweeper`: periodic maintenance
//! - `JobQueue`: the facade wiring all of the above
//!
//! Every committed transition is published as a `StatusEvent`.

pub mod dispatcher;
pub mod emitter;
pub mod error;
pub mod fairness;
pub mod handler;
pub mod idempotency;
pub mod lanes;
pub mod lease;
pub mod postgres;
pub mod queue;
pub mod retry;
pub mod store;
pub mod sweeper;

pub use dispatcher::{DispatchOutcome, Dispatcher, DispatcherHandle, DispatcherStats};
pub use emitter::StatusEmitter;
pub use error::QueueError;
pub use fairness::{Admission, FairnessGate, TokenBucket};
pub use handler::{
    CancelSignal, CancelSignals, HandlerError, HandlerOutcome, HandlerRegistry, JobContext,
    JobHandler,
};
pub use idempotency::{IdempotencyIndex, InMemoryIdempotencyIndex, Reservation};
pub use lanes::{LaneScheduler, SlotPlan};
pub use lease::{LeaseManager, ReclaimReport, ReleaseOutcome, RenewStatus};
pub use postgres::PostgresJobStore;
pub use queue::{CancelOutcome, JobQueue};
pub use retry::{BackoffStrategy, PromotionReport, RetryController, RetryDecision, RetryPolicy};
pub use store::{
    Expected, InMemoryJobStore, JobStats, JobStore, ReadyCursor, StoreError, Submission,
};
pub use sweeper::{SweepReport, Sweeper, SweeperHandle};
