//! Fairness Gate: per-tenant and per-tenant-user token buckets.
//!
//! Buckets are lock-free. Balances are kept in milli-tokens on an
//! `AtomicI64`; refill is granted to whichever caller wins the CAS on the
//! refill timestamp, so concurrent admissions never mint tokens twice.
//! A throttled job stays `pending` and is simply skipped by the dispatcher.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use tracing::trace;

use pipeq_core::{Clock, TenantId, UserId};

use crate::config::{QuotaConfig, QuotaTier};

const MILLI: i64 = 1_000;

/// A token bucket with a fixed capacity and refill rate.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: i64,
    /// Milli-tokens per nanosecond.
    rate: f64,
    tokens: AtomicI64,
    /// Nanoseconds since the Unix epoch already converted into tokens.
    last_refill: AtomicI64,
}

impl TokenBucket {
    /// A full bucket.
    pub fn new(tier: QuotaTier, now: DateTime<Utc>) -> Self {
        let capacity = i64::from(tier.capacity.max(1)) * MILLI;
        Self {
            capacity,
            rate: tier.refill_per_sec.max(0.0) * MILLI as f64 / 1e9,
            tokens: AtomicI64::new(capacity),
            last_refill: AtomicI64::new(nanos(now)),
        }
    }

    pub fn capacity(&self) -> u32 {
        (self.capacity / MILLI) as u32
    }

    /// Whole tokens currently available (after refilling up to `now`).
    pub fn available(&self, now: DateTime<Utc>) -> u32 {
        self.refill(now);
        (self.tokens.load(Ordering::Acquire) / MILLI) as u32
    }

    /// Take `cost` tokens if the balance allows it.
    ///
    /// A cost above capacity is charged as a full bucket so it can still be
    /// admitted eventually.
    pub fn try_take(&self, cost: u32, now: DateTime<Utc>) -> bool {
        self.refill(now);
        let charge = self.charge(cost);
        self.tokens
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |t| {
                (t >= charge).then_some(t - charge)
            })
            .is_ok()
    }

    /// Return tokens taken by `try_take`.
    pub fn refund(&self, cost: u32) {
        let charge = self.charge(cost);
        let capacity = self.capacity;
        let _ = self
            .tokens
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |t| {
                Some((t + charge).min(capacity))
            });
    }

    fn charge(&self, cost: u32) -> i64 {
        (i64::from(cost) * MILLI).min(self.capacity)
    }

    fn refill(&self, now: DateTime<Utc>) {
        if self.rate <= 0.0 {
            return;
        }
        let now = nanos(now);
        loop {
            let last = self.last_refill.load(Ordering::Acquire);
            if now <= last {
                return;
            }
            let elapsed = now - last;
            let earned = (elapsed as f64 * self.rate) as i64;
            if earned <= 0 {
                return;
            }
            // Only advance by the time the whole milli-tokens account for, so
            // fractional progress carries over to the next refill.
            let accounted = ((earned as f64 / self.rate) as i64).clamp(1, elapsed);
            if self
                .last_refill
                .compare_exchange(last, last + accounted, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let capacity = self.capacity;
                let _ = self
                    .tokens
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |t| {
                        Some(t.saturating_add(earned).min(capacity))
                    });
                return;
            }
        }
    }
}

fn nanos(at: DateTime<Utc>) -> i64 {
    at.timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// Outcome of an admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    TenantThrottled,
    UserThrottled,
}

impl Admission {
    pub fn is_admitted(self) -> bool {
        self == Admission::Admitted
    }
}

/// Throttles admission per tenant and, when configured, per tenant+user.
pub struct FairnessGate {
    quotas: QuotaConfig,
    clock: Arc<dyn Clock>,
    tenants: RwLock<HashMap<TenantId, Arc<TokenBucket>>>,
    users: RwLock<HashMap<(TenantId, UserId), Arc<TokenBucket>>>,
}

impl FairnessGate {
    pub fn new(quotas: QuotaConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            quotas,
            clock,
            tenants: RwLock::new(HashMap::new()),
            users: RwLock::new(HashMap::new()),
        }
    }

    pub fn quotas(&self) -> &QuotaConfig {
        &self.quotas
    }

    pub fn try_admit(&self, tenant_id: TenantId, user_id: UserId, cost: u32) -> bool {
        self.admit(tenant_id, user_id, cost).is_admitted()
    }

    pub fn admit(&self, tenant_id: TenantId, user_id: UserId, cost: u32) -> Admission {
        let now = self.clock.now();
        let tenant = self.tenant_bucket(tenant_id, now);
        if !tenant.try_take(cost, now) {
            trace!(%tenant_id, cost, "tenant bucket empty");
            return Admission::TenantThrottled;
        }
        if let Some(user) = self.user_bucket(tenant_id, user_id, now) {
            if !user.try_take(cost, now) {
                tenant.refund(cost);
                trace!(%tenant_id, %user_id, cost, "user bucket empty");
                return Admission::UserThrottled;
            }
        }
        Admission::Admitted
    }

    /// Undo an admission whose claim did not go through.
    pub fn refund(&self, tenant_id: TenantId, user_id: UserId, cost: u32) {
        let now = self.clock.now();
        self.tenant_bucket(tenant_id, now).refund(cost);
        if let Some(user) = self.user_bucket(tenant_id, user_id, now) {
            user.refund(cost);
        }
    }

    /// Whole tokens left in a tenant's bucket.
    pub fn available(&self, tenant_id: TenantId) -> u32 {
        let now = self.clock.now();
        self.tenant_bucket(tenant_id, now).available(now)
    }

    fn tenant_bucket(&self, tenant_id: TenantId, now: DateTime<Utc>) -> Arc<TokenBucket> {
        bucket(&self.tenants, tenant_id, || {
            TokenBucket::new(self.quotas.tier_for(tenant_id), now)
        })
    }

    fn user_bucket(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Option<Arc<TokenBucket>> {
        let tier = self.quotas.per_user?;
        Some(bucket(&self.users, (tenant_id, user_id), || {
            TokenBucket::new(tier, now)
        }))
    }
}

fn bucket<K, F>(map: &RwLock<HashMap<K, Arc<TokenBucket>>>, key: K, make: F) -> Arc<TokenBucket>
where
    K: std::hash::Hash + Eq,
    F: FnOnce() -> TokenBucket,
{
    // Buckets are only ever inserted, so a poisoned map is still consistent.
    if let Some(found) = map.read().unwrap_or_else(PoisonError::into_inner).get(&key) {
        return Arc::clone(found);
    }
    let mut map = map.write().unwrap_or_else(PoisonError::into_inner);
    Arc::clone(map.entry(key).or_insert_with(|| Arc::new(make())))
}
