//! Postgres-backed job store.
//!
//! Each job is one row in `pipeq_jobs`. The columns the queue filters and
//! sorts on (`tenant_id`, `lane`, `state`, `lease_expires_at`, `retry_at`,
//! `created_at`, `updated_at`) are stored next to the full job record in a
//! `jsonb` column. The idempotency index is `pipeq_idempotency`, whose primary
//! key `(tenant_id, idempotency_key)` is what makes duplicate submissions
//! safe across processes.
//!
//! ## Compare-and-swap
//!
//! `transition` runs in a transaction: `SELECT ... FOR UPDATE` locks the row,
//! the precondition is checked against the locked record, and the new record
//! is written back. Concurrent claims of the same job serialize on the row
//! lock; the loser sees the winner's state and gets `Conflict`.
//!
//! ## Error Mapping
//!
//! | SQLx Error | StoreError |
//! |------------|------------|
//! | Database, check violation (`23514`) or invalid text (`22P02`) | `Corrupt` |
//! | Database (other, including `40001` / `40P01`) | `Unavailable` |
//! | Io, Tls, PoolTimedOut, PoolClosed, Protocol | `Unavailable` |
//! | ColumnDecode, Decode, ColumnNotFound | `Corrupt` |
//!
//! ## Sync bridge
//!
//! `JobStore` is synchronous. Calls are driven on the stored runtime handle
//! with `block_on`, so they must come from threads outside that runtime
//! (dispatcher and sweeper threads, or `spawn_blocking`).

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio::runtime::Handle;
use tracing::{debug, instrument};
use uuid::Uuid;

use pipeq_core::{IdempotencyKey, Job, JobId, JobState, Lane, TenantId, Transition, WorkerId};

use super::store::{Expected, JobStats, JobStore, ReadyCursor, StoreError, Submission};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS pipeq_jobs (
    id                UUID PRIMARY KEY,
    tenant_id         UUID NOT NULL,
    lane              TEXT NOT NULL,
    state             TEXT NOT NULL,
    lease_expires_at  TIMESTAMPTZ,
    retry_at          TIMESTAMPTZ,
    created_at        TIMESTAMPTZ NOT NULL,
    updated_at        TIMESTAMPTZ NOT NULL,
    record            JSONB NOT NULL,
    CONSTRAINT pipeq_jobs_lease_only_when_processing
        CHECK ((state = 'processing') = (lease_expires_at IS NOT NULL))
);

CREATE INDEX IF NOT EXISTS pipeq_jobs_ready
    ON pipeq_jobs (lane, created_at, id) WHERE state = 'pending';
CREATE INDEX IF NOT EXISTS pipeq_jobs_leases
    ON pipeq_jobs (lease_expires_at) WHERE state = 'processing';
CREATE INDEX IF NOT EXISTS pipeq_jobs_retries
    ON pipeq_jobs (retry_at) WHERE state = 'retrying';
CREATE INDEX IF NOT EXISTS pipeq_jobs_failed
    ON pipeq_jobs (updated_at) WHERE state = 'failed';
CREATE INDEX IF NOT EXISTS pipeq_jobs_tenant
    ON pipeq_jobs (tenant_id, created_at, id);

CREATE TABLE IF NOT EXISTS pipeq_idempotency (
    tenant_id        UUID NOT NULL,
    idempotency_key  TEXT NOT NULL,
    job_id           UUID NOT NULL,
    terminal_at      TIMESTAMPTZ,
    PRIMARY KEY (tenant_id, idempotency_key)
);

CREATE INDEX IF NOT EXISTS pipeq_idempotency_terminal
    ON pipeq_idempotency (terminal_at) WHERE terminal_at IS NOT NULL;
"#;

const JOB_COLUMNS: &str = "record";

/// Postgres job store.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
    handle: Handle,
}

impl PostgresJobStore {
    /// Wrap an existing pool. `handle` must belong to a runtime that outlives
    /// the store.
    pub fn new(pool: PgPool, handle: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            handle,
        }
    }

    /// Connect using the current runtime.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool, Handle::current()))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes if missing.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        debug!("job schema ready");
        Ok(())
    }

    fn block_on<F: Future>(&self, fut: F) -> F::Output {
        self.handle.block_on(fut)
    }

    async fn fetch_jobs(
        &self,
        operation: &'static str,
        query: sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<Vec<Job>, StoreError> {
        let rows = query
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        rows.iter().map(decode_job).collect()
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, tenant_id = %job.tenant_id), err)]
    async fn submit_async(&self, job: Job) -> Result<Submission, StoreError> {
        let mut tx = self.begin().await?;

        let reserved = sqlx::query(
            r#"
            INSERT INTO pipeq_idempotency (tenant_id, idempotency_key, job_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (tenant_id, idempotency_key) DO NOTHING
            RETURNING job_id
            "#,
        )
        .bind(*job.tenant_id.as_uuid())
        .bind(job.idempotency_key.as_str())
        .bind(*job.id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("reserve_idempotency", e))?;

        if reserved.is_none() {
            let existing = sqlx::query(
                "SELECT job_id FROM pipeq_idempotency \
                 WHERE tenant_id = $1 AND idempotency_key = $2",
            )
            .bind(*job.tenant_id.as_uuid())
            .bind(job.idempotency_key.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("lookup_idempotency", e))?;
            rollback(tx).await?;

            // Pruned between our insert attempt and the lookup.
            let row = existing.ok_or_else(|| {
                StoreError::Unavailable("idempotency entry vanished during submit".into())
            })?;
            let job_id: Uuid = row
                .try_get("job_id")
                .map_err(|e| map_sqlx_error("lookup_idempotency", e))?;
            return Ok(Submission {
                job_id: JobId::from_uuid(job_id),
                created: false,
            });
        }

        write_job(&mut tx, &job, true).await?;
        commit(tx).await?;
        Ok(Submission {
            job_id: job.id,
            created: true,
        })
    }

    #[instrument(skip(self, expected, change), fields(expected = %expected.state))]
    async fn transition_async(
        &self,
        job_id: JobId,
        expected: &Expected,
        to: JobState,
        change: Transition,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        let mut tx = self.begin().await?;
        let mut job = lock_job(&mut tx, job_id).await?;

        let applied = expected
            .check(&job)
            .and_then(|()| job.apply_transition(to, change, now).map_err(StoreError::from));
        if let Err(e) = applied {
            rollback(tx).await?;
            return Err(e);
        }

        write_job(&mut tx, &job, false).await?;
        if to.is_terminal() {
            sqlx::query(
                r#"
                UPDATE pipeq_idempotency SET terminal_at = $4
                WHERE tenant_id = $1 AND idempotency_key = $2 AND job_id = $3
                "#,
            )
            .bind(*job.tenant_id.as_uuid())
            .bind(job.idempotency_key.as_str())
            .bind(*job.id.as_uuid())
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("mark_terminal", e))?;
        }
        commit(tx).await?;
        Ok(job)
    }

    /// Lock, mutate and write back one job.
    async fn update_async<F>(
        &self,
        operation: &'static str,
        job_id: JobId,
        f: F,
    ) -> Result<Job, StoreError>
    where
        F: FnOnce(&mut Job) -> Result<bool, StoreError>,
    {
        let mut tx = self.begin().await?;
        let mut job = lock_job(&mut tx, job_id).await?;
        match f(&mut job) {
            Ok(true) => {
                write_job(&mut tx, &job, false).await?;
                commit(tx).await?;
            }
            Ok(false) => rollback(tx).await?,
            Err(e) => {
                rollback(tx).await?;
                return Err(e);
            }
        }
        debug!(%job_id, operation, "job updated");
        Ok(job)
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, StoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }
}

impl JobStore for PostgresJobStore {
    fn submit(&self, job: Job) -> Result<Submission, StoreError> {
        self.block_on(self.submit_async(job))
    }

    fn get(&self, job_id: JobId) -> Result<Job, StoreError> {
        self.block_on(async {
            let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM pipeq_jobs WHERE id = $1"))
                .bind(*job_id.as_uuid())
                .fetch_optional(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("get", e))?;
            row.as_ref()
                .map(decode_job)
                .unwrap_or(Err(StoreError::NotFound(job_id)))
        })
    }

    fn transition(
        &self,
        job_id: JobId,
        expected: &Expected,
        to: JobState,
        change: Transition,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        self.block_on(self.transition_async(job_id, expected, to, change, now))
    }

    fn renew_lease(
        &self,
        job_id: JobId,
        owner: &WorkerId,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        self.block_on(self.update_async("renew_lease", job_id, |job| {
            Expected::held_by(owner).check(job)?;
            if let Some(lease) = job.lease.as_mut() {
                lease.expires_at = lease.expires_at.max(expires_at);
            }
            job.updated_at = now;
            Ok(true)
        }))
    }

    fn request_cancel(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Job, StoreError> {
        self.block_on(self.update_async("request_cancel", job_id, |job| {
            if job.state.is_terminal() || job.cancel_requested {
                return Ok(false);
            }
            job.cancel_requested = true;
            job.updated_at = now;
            Ok(true)
        }))
    }

    fn ready_in_lane(
        &self,
        lane: Lane,
        exclude: &[TenantId],
        after: Option<ReadyCursor>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        let exclude: Vec<Uuid> = exclude.iter().map(|t| *t.as_uuid()).collect();
        // The cursor time is encoded the same way `created_at` was written,
        // so the row it came from compares equal and the id breaks the tie.
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS} FROM pipeq_jobs
            WHERE lane = $1 AND state = 'pending' AND NOT (tenant_id = ANY($2))
              AND ($3::timestamptz IS NULL OR (created_at, id) > ($3, $4))
            ORDER BY created_at, id
            LIMIT $5
            "#
        );
        self.block_on(self.fetch_jobs(
            "ready_in_lane",
            sqlx::query(&sql)
                .bind(lane.as_str())
                .bind(exclude)
                .bind(after.map(|c| c.created_at))
                .bind(after.map(|c| *c.job_id.as_uuid()))
                .bind(sql_limit(limit)),
        ))
    }

    fn expired_leases(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, StoreError> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS} FROM pipeq_jobs
            WHERE state = 'processing' AND lease_expires_at <= $1
            ORDER BY lease_expires_at, id
            LIMIT $2
            "#
        );
        self.block_on(self.fetch_jobs(
            "expired_leases",
            sqlx::query(&sql).bind(now).bind(sql_limit(limit)),
        ))
    }

    fn due_retries(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, StoreError> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS} FROM pipeq_jobs
            WHERE state = 'retrying' AND retry_at <= $1
            ORDER BY retry_at, id
            LIMIT $2
            "#
        );
        self.block_on(self.fetch_jobs(
            "due_retries",
            sqlx::query(&sql).bind(now).bind(sql_limit(limit)),
        ))
    }

    fn stranded_failures(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS} FROM pipeq_jobs
            WHERE state = 'failed' AND updated_at <= $1
            ORDER BY updated_at, id
            LIMIT $2
            "#
        );
        self.block_on(self.fetch_jobs(
            "stranded_failures",
            sqlx::query(&sql).bind(cutoff).bind(sql_limit(limit)),
        ))
    }

    fn list_by_tenant(
        &self,
        tenant_id: TenantId,
        state: Option<JobState>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS} FROM pipeq_jobs
            WHERE tenant_id = $1 AND ($2::TEXT IS NULL OR state = $2)
            ORDER BY created_at, id
            LIMIT $3
            "#
        );
        self.block_on(self.fetch_jobs(
            "list_by_tenant",
            sqlx::query(&sql)
                .bind(*tenant_id.as_uuid())
                .bind(state.map(JobState::as_str))
                .bind(sql_limit(limit)),
        ))
    }

    fn stats(&self, tenant_id: TenantId) -> Result<JobStats, StoreError> {
        self.block_on(async {
            let rows = sqlx::query(
                "SELECT state, COUNT(*) AS n FROM pipeq_jobs WHERE tenant_id = $1 GROUP BY state",
            )
            .bind(*tenant_id.as_uuid())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

            let mut stats = JobStats::default();
            for row in rows {
                let state: String = row.try_get("state").map_err(|e| map_sqlx_error("stats", e))?;
                let n: i64 = row.try_get("n").map_err(|e| map_sqlx_error("stats", e))?;
                let state: JobState = state
                    .parse()
                    .map_err(|e| StoreError::Corrupt(format!("{e}")))?;
                stats.add(state, usize::try_from(n).unwrap_or(0));
            }
            Ok(stats)
        })
    }

    fn prune_idempotency(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        self.block_on(async {
            let result = sqlx::query(
                "DELETE FROM pipeq_idempotency WHERE terminal_at IS NOT NULL AND terminal_at < $1",
            )
            .bind(cutoff)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("prune_idempotency", e))?;
            Ok(result.rows_affected() as usize)
        })
    }

    fn release_idempotency(
        &self,
        tenant_id: TenantId,
        key: &IdempotencyKey,
        job_id: JobId,
    ) -> Result<bool, StoreError> {
        self.block_on(async {
            let result = sqlx::query(
                r#"
                DELETE FROM pipeq_idempotency
                WHERE tenant_id = $1 AND idempotency_key = $2 AND job_id = $3
                "#,
            )
            .bind(*tenant_id.as_uuid())
            .bind(key.as_str())
            .bind(*job_id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("release_idempotency", e))?;
            Ok(result.rows_affected() > 0)
        })
    }
}

async fn lock_job(tx: &mut Transaction<'_, Postgres>, job_id: JobId) -> Result<Job, StoreError> {
    let row = sqlx::query(&format!(
        "SELECT {JOB_COLUMNS} FROM pipeq_jobs WHERE id = $1 FOR UPDATE"
    ))
    .bind(*job_id.as_uuid())
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("lock_job", e))?;
    match row {
        Some(row) => decode_job(&row),
        None => Err(StoreError::NotFound(job_id)),
    }
}

async fn write_job(
    tx: &mut Transaction<'_, Postgres>,
    job: &Job,
    insert: bool,
) -> Result<(), StoreError> {
    let record = serde_json::to_value(job)
        .map_err(|e| StoreError::Corrupt(format!("failed to encode job {}: {e}", job.id)))?;
    let sql = if insert {
        r#"
        INSERT INTO pipeq_jobs
            (id, tenant_id, lane, state, lease_expires_at, retry_at, created_at, updated_at, record)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#
    } else {
        r#"
        UPDATE pipeq_jobs SET
            tenant_id = $2, lane = $3, state = $4, lease_expires_at = $5,
            retry_at = $6, created_at = $7, updated_at = $8, record = $9
        WHERE id = $1
        "#
    };
    sqlx::query(sql)
        .bind(*job.id.as_uuid())
        .bind(*job.tenant_id.as_uuid())
        .bind(job.lane.as_str())
        .bind(job.state.as_str())
        .bind(job.lease_expires_at())
        .bind(job.retry_at)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(record)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error(if insert { "insert_job" } else { "update_job" }, e))?;
    Ok(())
}

async fn commit(tx: Transaction<'_, Postgres>) -> Result<(), StoreError> {
    tx.commit()
        .await
        .map_err(|e| map_sqlx_error("commit_transaction", e))
}

async fn rollback(tx: Transaction<'_, Postgres>) -> Result<(), StoreError> {
    tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))
}

fn decode_job(row: &PgRow) -> Result<Job, StoreError> {
    let record: serde_json::Value = row
        .try_get("record")
        .map_err(|e| map_sqlx_error("decode_job", e))?;
    serde_json::from_value(record)
        .map_err(|e| StoreError::Corrupt(format!("failed to decode job record: {e}")))
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // Check violation / malformed input: the record itself is bad.
                Some("23514") | Some("22P02") => StoreError::Corrupt(msg),
                _ => StoreError::Unavailable(msg),
            }
        }
        sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::ColumnNotFound(_) => {
            StoreError::Corrupt(format!("failed to decode row in {}: {}", operation, err))
        }
        sqlx::Error::PoolClosed => {
            StoreError::Unavailable(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::PoolTimedOut => {
            StoreError::Unavailable(format!("connection pool timed out in {}", operation))
        }
        _ => StoreError::Unavailable(format!("sqlx error in {}: {}", operation, err)),
    }
}
