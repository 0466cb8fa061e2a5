//! Postgres-backed job store.
//!
//! ## Claiming
//!
//! `claim_next` runs one short transaction:
//!
//! 1. `SELECT ... WHERE status = 'PENDING' AND run_at <= $now ORDER BY id
//!    LIMIT 1 FOR UPDATE SKIP LOCKED`
//! 2. `UPDATE` the locked row to `IN_PROGRESS`
//! 3. `COMMIT`
//!
//! Rows locked by another in-flight claim are skipped rather than waited on,
//! so concurrent workers fan out over distinct jobs.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (connection / resources / shutdown / serialization) | `08*`, `53*`, `57*`, `40*` | `Unavailable` |
//! | Database (other) | any other | `InvalidState` |
//! | Pool / IO / TLS / protocol | N/A | `Unavailable` |
//! | Decode / missing column | N/A | `Corrupt` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Row};
use tracing::{Span, debug, instrument};

use jobforge_core::{Job, JobId, JobStatus, NewJob};

use super::store::{JobStats, JobStore, JobStoreError};

macro_rules! job_columns {
    () => {
        "id, task_type, payload, status, created_at, updated_at, started_at, failed_at, \
         run_at, attempt_count, max_attempts, error_message, idempotency_key"
    };
}

/// Key for the advisory lock serializing concurrent schema bootstraps.
const SCHEMA_LOCK_KEY: i64 = 0x6a6f_6266_6f72_6765;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id              BIGSERIAL PRIMARY KEY,
        task_type       TEXT        NOT NULL,
        payload         JSONB       NOT NULL DEFAULT '{}'::jsonb,
        status          TEXT        NOT NULL DEFAULT 'PENDING',
        created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        started_at      TIMESTAMPTZ,
        failed_at       TIMESTAMPTZ,
        run_at          TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        attempt_count   INTEGER     NOT NULL DEFAULT 0,
        max_attempts    INTEGER     NOT NULL DEFAULT 3,
        error_message   TEXT,
        idempotency_key TEXT,
        CONSTRAINT jobs_status_check
            CHECK (status IN ('PENDING', 'IN_PROGRESS', 'SUCCEEDED', 'FAILED_PERMANENT')),
        CONSTRAINT jobs_attempts_check
            CHECK (attempt_count >= 0 AND max_attempts > 0 AND attempt_count <= max_attempts)
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS jobs_idempotency_key_idx
        ON jobs (idempotency_key)
        WHERE idempotency_key IS NOT NULL
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS jobs_claim_idx
        ON jobs (status, run_at, id)
    "#,
];

/// Postgres-backed job store.
///
/// `Send + Sync`; clones share the same connection pool.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the `jobs` table and its indexes if they do not exist.
    ///
    /// Safe to run from several processes at once: the DDL is serialized with
    /// a transaction-scoped advisory lock.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(SCHEMA_LOCK_KEY)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("schema_lock", e))?;

        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;
        debug!("job schema ready");
        Ok(())
    }

    async fn insert_row(
        &self,
        job: NewJob,
        now: DateTime<Utc>,
        skip_on_conflict: bool,
    ) -> Result<Option<Job>, JobStoreError> {
        let sql = if skip_on_conflict {
            concat!(
                "INSERT INTO jobs (task_type, payload, status, created_at, updated_at, run_at, ",
                "attempt_count, max_attempts, idempotency_key) ",
                "VALUES ($1, $2, 'PENDING', $3, $3, $4, 0, $5, $6) ",
                "ON CONFLICT (idempotency_key) WHERE idempotency_key IS NOT NULL DO NOTHING ",
                "RETURNING ",
                job_columns!()
            )
        } else {
            concat!(
                "INSERT INTO jobs (task_type, payload, status, created_at, updated_at, run_at, ",
                "attempt_count, max_attempts, idempotency_key) ",
                "VALUES ($1, $2, 'PENDING', $3, $3, $4, 0, $5, $6) ",
                "RETURNING ",
                job_columns!()
            )
        };

        let row = sqlx::query(sql)
            .bind(&job.task_type)
            .bind(&job.payload)
            .bind(now)
            .bind(job.run_at.unwrap_or(now))
            .bind(to_i32(job.max_attempts, "max_attempts")?)
            .bind(&job.idempotency_key)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("insert_job", e))?;

        row.map(|r| decode_job(&r)).transpose()
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(task_type = %job.task_type), err)]
    async fn insert(&self, job: NewJob, now: DateTime<Utc>) -> Result<Job, JobStoreError> {
        self.insert_row(job, now, false)
            .await?
            .ok_or_else(|| JobStoreError::Corrupt("insert returned no row".to_string()))
    }

    #[instrument(
        skip(self, job),
        fields(task_type = %job.task_type, idempotency_key = ?job.idempotency_key),
        err
    )]
    async fn insert_if_absent(
        &self,
        job: NewJob,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        match self.insert_row(job, now, true).await {
            Ok(row) => Ok(row),
            // A racing insert can still surface as a unique violation.
            Err(JobStoreError::Conflict(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(concat!("SELECT ", job_columns!(), " FROM jobs WHERE id = $1"))
            .bind(id.as_i64())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;

        row.map(|r| decode_job(&r)).transpose()
    }

    #[instrument(skip(self), err)]
    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(concat!(
            "SELECT ",
            job_columns!(),
            " FROM jobs WHERE idempotency_key = $1"
        ))
        .bind(key)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_by_idempotency_key", e))?;

        row.map(|r| decode_job(&r)).transpose()
    }

    #[instrument(skip(self), fields(job_id = tracing::field::Empty), err)]
    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let candidate = sqlx::query(concat!(
            "SELECT ",
            job_columns!(),
            " FROM jobs WHERE status = 'PENDING' AND run_at <= $1 ",
            "ORDER BY id ASC LIMIT 1 FOR UPDATE SKIP LOCKED"
        ))
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("select_claimable", e))?;

        let Some(row) = candidate else {
            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("commit", e))?;
            return Ok(None);
        };

        let mut job = decode_job(&row)?;
        job.mark_claimed(now)?;

        let row = sqlx::query(concat!(
            "UPDATE jobs SET status = 'IN_PROGRESS', started_at = $2, updated_at = $2 ",
            "WHERE id = $1 RETURNING ",
            job_columns!()
        ))
        .bind(job.id.as_i64())
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim_job", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;

        let claimed = decode_job(&row)?;
        Span::current().record("job_id", claimed.id.as_i64());
        Ok(Some(claimed))
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, status = %job.status), err)]
    async fn finalize(&self, job: &Job) -> Result<(), JobStoreError> {
        if job.status == JobStatus::InProgress {
            return Err(JobStoreError::InvalidState(format!(
                "job {} finalized while still IN_PROGRESS",
                job.id
            )));
        }

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = $2,
                attempt_count = $3,
                run_at = $4,
                error_message = $5,
                failed_at = $6,
                updated_at = $7
            WHERE id = $1
              AND status = 'IN_PROGRESS'
              AND started_at IS NOT DISTINCT FROM $8
            "#,
        )
        .bind(job.id.as_i64())
        .bind(job.status.as_str())
        .bind(to_i32(job.attempt_count, "attempt_count")?)
        .bind(job.run_at)
        .bind(&job.error_message)
        .bind(job.failed_at)
        .bind(job.updated_at)
        .bind(job.started_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("finalize_job", e))?;

        if result.rows_affected() == 1 {
            return Ok(());
        }
        match self.get(job.id).await? {
            Some(_) => Err(JobStoreError::LeaseLost(job.id)),
            None => Err(JobStoreError::NotFound(job.id)),
        }
    }

    #[instrument(skip(self), fields(reclaimed = tracing::field::Empty), err)]
    async fn reclaim_expired(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, JobStoreError> {
        let rows = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'PENDING', started_at = NULL, updated_at = $2
            WHERE status = 'IN_PROGRESS' AND started_at < $1
            RETURNING id
            "#,
        )
        .bind(cutoff)
        .bind(now)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reclaim_expired", e))?;

        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row
                .try_get("id")
                .map_err(|e| map_sqlx_error("reclaim_expired", e))?;
            ids.push(JobId::new(id));
        }
        ids.sort();
        Span::current().record("reclaimed", ids.len());
        Ok(ids)
    }

    #[instrument(skip(self), err)]
    async fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(concat!(
            "SELECT ",
            job_columns!(),
            " FROM jobs WHERE ($1::text IS NULL OR status = $1) ORDER BY id DESC LIMIT $2"
        ))
        .bind(status.map(|s| s.as_str()))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_jobs", e))?;

        rows.iter().map(decode_job).collect()
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM jobs GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("job_stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| map_sqlx_error("job_stats", e))?;
            let count: i64 = row
                .try_get("count")
                .map_err(|e| map_sqlx_error("job_stats", e))?;
            stats.add(status.parse()?, u64::try_from(count).unwrap_or(0));
        }
        Ok(stats)
    }
}

/// Map SQLx errors to `JobStoreError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => JobStoreError::Conflict(msg),
                Some(code)
                    if code.starts_with("08")
                        || code.starts_with("53")
                        || code.starts_with("57")
                        || code.starts_with("40") =>
                {
                    JobStoreError::Unavailable(msg)
                }
                _ => JobStoreError::InvalidState(msg),
            }
        }
        sqlx::Error::RowNotFound => {
            JobStoreError::Corrupt(format!("unexpected row not found in {}", operation))
        }
        sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::TypeNotFound { .. } => {
            JobStoreError::Corrupt(format!("failed to decode row in {}: {}", operation, err))
        }
        _ => JobStoreError::Unavailable(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn to_i32(value: u32, field: &str) -> Result<i32, JobStoreError> {
    i32::try_from(value)
        .map_err(|_| JobStoreError::InvalidState(format!("{field} out of range: {value}")))
}

fn decode_job(row: &sqlx::postgres::PgRow) -> Result<Job, JobStoreError> {
    let row = JobRow::from_row(row).map_err(|e| map_sqlx_error("decode_job", e))?;
    Job::try_from(row)
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: i64,
    task_type: String,
    payload: serde_json::Value,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
    run_at: DateTime<Utc>,
    attempt_count: i32,
    max_attempts: i32,
    error_message: Option<String>,
    idempotency_key: Option<String>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for JobRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            task_type: row.try_get("task_type")?,
            payload: row.try_get("payload")?,
            status: row.try_get("status")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            started_at: row.try_get("started_at")?,
            failed_at: row.try_get("failed_at")?,
            run_at: row.try_get("run_at")?,
            attempt_count: row.try_get("attempt_count")?,
            max_attempts: row.try_get("max_attempts")?,
            error_message: row.try_get("error_message")?,
            idempotency_key: row.try_get("idempotency_key")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let count = |v: i32, field: &str| {
            u32::try_from(v)
                .map_err(|_| JobStoreError::Corrupt(format!("job {}: negative {field}", row.id)))
        };
        Ok(Job {
            id: JobId::new(row.id),
            status: row.status.parse()?,
            attempt_count: count(row.attempt_count, "attempt_count")?,
            max_attempts: count(row.max_attempts, "max_attempts")?,
            task_type: row.task_type,
            payload: row.payload,
            created_at: row.created_at,
            updated_at: row.updated_at,
            started_at: row.started_at,
            failed_at: row.failed_at,
            run_at: row.run_at,
            error_message: row.error_message,
            idempotency_key: row.idempotency_key,
        })
    }
}
