//! Infrastructure layer: job stores, dispatch, leases, retries and config.

pub mod config;
pub mod jobs;

#[cfg(test)]
mod integration_tests;

pub use config::{ConfigError, PoolConfig, QueueConfig, QuotaConfig, QuotaTier};
pub use jobs::{
    CancelOutcome, DispatchOutcome, HandlerError, HandlerOutcome, InMemoryJobStore, JobContext,
    JobQueue, JobStore, PostgresJobStore, QueueError, Submission,
};
