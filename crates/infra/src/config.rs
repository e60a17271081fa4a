//! Configuration loading and representation.
//!
//! `QueueConfig::default()` carries the production tuning; `from_env()`
//! overlays `PIPEQ_*` variables on top of it.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use pipeq_core::{Lane, TenantId};

use crate::jobs::retry::RetryPolicy;

/// Configuration error (malformed environment value or inconsistent settings).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}: {reason}")]
    Malformed {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Refill tier of a token bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuotaTier {
    /// Maximum burst, in tokens.
    pub capacity: u32,
    /// Tokens added per second.
    pub refill_per_sec: f64,
}

impl QuotaTier {
    pub const fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec,
        }
    }

    fn validate(&self, what: &str) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::Invalid(format!("{what}: capacity must be positive")));
        }
        if !(self.refill_per_sec.is_finite() && self.refill_per_sec > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "{what}: refill_per_sec must be positive"
            )));
        }
        Ok(())
    }
}

impl Default for QuotaTier {
    fn default() -> Self {
        Self::new(100, 50.0)
    }
}

/// Fairness Gate settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Tier for tenants without an explicit assignment.
    pub default_tier: QuotaTier,
    pub tenant_tiers: HashMap<TenantId, QuotaTier>,
    /// When set, every `(tenant, user)` pair gets its own bucket of this tier.
    pub per_user: Option<QuotaTier>,
    /// Token cost per operation type; unlisted operations cost 1.
    pub operation_costs: HashMap<String, u32>,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            default_tier: QuotaTier::default(),
            tenant_tiers: HashMap::new(),
            per_user: None,
            operation_costs: HashMap::new(),
        }
    }
}

impl QuotaConfig {
    pub fn tier_for(&self, tenant_id: TenantId) -> QuotaTier {
        self.tenant_tiers
            .get(&tenant_id)
            .copied()
            .unwrap_or(self.default_tier)
    }

    pub fn cost_for(&self, operation: &str) -> u32 {
        self.operation_costs.get(operation).copied().unwrap_or(1).max(1)
    }
}

/// A named set of workers draining a subset of lanes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub name: String,
    pub workers: usize,
    pub lanes: Vec<Lane>,
}

impl PoolConfig {
    pub fn new(name: impl Into<String>, workers: usize, lanes: impl Into<Vec<Lane>>) -> Self {
        Self {
            name: name.into(),
            workers,
            lanes: lanes.into(),
        }
    }

    /// One pool over every lane.
    pub fn all_lanes(workers: usize) -> Self {
        Self::new("default", workers, Lane::ALL)
    }
}

/// Queue tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub lease_duration: Duration,
    /// `None` sweeps every `lease_duration / 2`.
    pub sweep_interval: Option<Duration>,
    pub retry: RetryPolicy,
    /// At least one slot in every window is offered first to a lower lane.
    pub fairness_window: u32,
    /// How long a terminal job keeps its idempotency key reserved.
    pub idempotency_retention: Duration,
    pub default_max_attempts: u32,
    /// Idle wait between dispatch ticks.
    pub poll_interval: Duration,
    /// Cap of the backoff applied after store failures.
    pub store_retry_max: Duration,
    /// Pending candidates fetched per lane per store round trip.
    pub dispatch_batch_size: usize,
    /// Jobs handled per sweeper phase per tick.
    pub sweep_batch_size: usize,
    pub pools: Vec<PoolConfig>,
    pub quotas: QuotaConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(5 * 60),
            sweep_interval: None,
            retry: RetryPolicy::default(),
            fairness_window: 10,
            idempotency_retention: Duration::from_secs(24 * 60 * 60),
            default_max_attempts: 3,
            poll_interval: Duration::from_millis(100),
            store_retry_max: Duration::from_secs(30),
            dispatch_batch_size: 32,
            sweep_batch_size: 256,
            pools: vec![PoolConfig::all_lanes(4)],
            quotas: QuotaConfig::default(),
        }
    }
}

impl QueueConfig {
    /// Defaults overlaid with `PIPEQ_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overlaid with values from `lookup` (keyed by variable name).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(secs) = parse::<u64, _>(&lookup, "PIPEQ_LEASE_SECS")? {
            config.lease_duration = Duration::from_secs(secs);
        }
        if let Some(secs) = parse::<u64, _>(&lookup, "PIPEQ_SWEEP_SECS")? {
            config.sweep_interval = Some(Duration::from_secs(secs));
        }
        if let Some(ms) = parse::<u64, _>(&lookup, "PIPEQ_RETRY_BASE_MS")? {
            config.retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = parse::<u64, _>(&lookup, "PIPEQ_RETRY_MAX_SECS")? {
            config.retry.max_delay = Duration::from_secs(secs);
        }
        if let Some(jitter) = parse::<f64, _>(&lookup, "PIPEQ_RETRY_JITTER")? {
            config.retry.jitter = jitter;
        }
        if let Some(window) = parse::<u32, _>(&lookup, "PIPEQ_FAIRNESS_WINDOW")? {
            config.fairness_window = window;
        }
        if let Some(secs) = parse::<u64, _>(&lookup, "PIPEQ_IDEMPOTENCY_RETENTION_SECS")? {
            config.idempotency_retention = Duration::from_secs(secs);
        }
        if let Some(max) = parse::<u32, _>(&lookup, "PIPEQ_MAX_ATTEMPTS")? {
            config.default_max_attempts = max;
        }
        if let Some(workers) = parse::<usize, _>(&lookup, "PIPEQ_WORKERS")? {
            config.pools = vec![PoolConfig::all_lanes(workers)];
        }
        if let Some(ms) = parse::<u64, _>(&lookup, "PIPEQ_POLL_MS")? {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(capacity) = parse::<u32, _>(&lookup, "PIPEQ_TENANT_CAPACITY")? {
            config.quotas.default_tier.capacity = capacity;
        }
        if let Some(rate) = parse::<f64, _>(&lookup, "PIPEQ_TENANT_REFILL_PER_SEC")? {
            config.quotas.default_tier.refill_per_sec = rate;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn effective_sweep_interval(&self) -> Duration {
        self.sweep_interval.unwrap_or(self.lease_duration / 2)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lease_duration.is_zero() {
            return Err(ConfigError::Invalid("lease_duration must be positive".into()));
        }
        if self.effective_sweep_interval().is_zero() {
            return Err(ConfigError::Invalid("sweep_interval must be positive".into()));
        }
        if self.fairness_window == 0 {
            return Err(ConfigError::Invalid("fairness_window must be at least 1".into()));
        }
        if self.default_max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "default_max_attempts must be at least 1".into(),
            ));
        }
        if self.dispatch_batch_size == 0 || self.sweep_batch_size == 0 {
            return Err(ConfigError::Invalid("batch sizes must be positive".into()));
        }
        self.retry.validate()?;

        for pool in &self.pools {
            if pool.workers == 0 {
                return Err(ConfigError::Invalid(format!(
                    "pool {:?} must have at least one worker",
                    pool.name
                )));
            }
            if pool.lanes.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "pool {:?} must drain at least one lane",
                    pool.name
                )));
            }
        }

        self.quotas.default_tier.validate("default tier")?;
        for (tenant_id, tier) in &self.quotas.tenant_tiers {
            tier.validate(&format!("tier of tenant {tenant_id}"))?;
        }
        if let Some(tier) = &self.quotas.per_user {
            tier.validate("per-user tier")?;
        }
        if let Some((op, _)) = self.quotas.operation_costs.iter().find(|(_, c)| **c == 0) {
            return Err(ConfigError::Invalid(format!("cost of {op:?} must be positive")));
        }
        Ok(())
    }
}

fn parse<T, F>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(var) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<T>()
        .map(Some)
        .map_err(|e| ConfigError::Malformed {
            var,
            value: raw.clone(),
            reason: e.to_string(),
        })
}
