//! `pipeq-core`: domain foundation for the pipeline job queue.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, lanes, the job state machine and the job record itself.

pub mod clock;
pub mod error;
pub mod id;
pub mod job;
pub mod lane;
pub mod state;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{JobId, PayloadRef, TenantId, UserId, WorkerId};
pub use job::{ErrorClass, IdempotencyKey, Job, JobError, Lease, NewJob, Transition};
pub use lane::Lane;
pub use state::JobState;
