//! Postgres-backed job store.
//!
//! Every mutating call runs in one transaction that locks the job row
//! (`SELECT ... FOR UPDATE`), applies the change in memory with the same state
//! machine as the in-memory backend, then writes the row and appends the log
//! entry before committing. Concurrent writers to one job queue on the row
//! lock; distinct jobs never block each other.
//!
//! ## Error Mapping
//!
//! | SQLx error | PostgreSQL code | JobStoreError |
//! |------------|-----------------|---------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` (create only) / `Storage` |
//! | Database (other) | any | `Storage` |
//! | PoolClosed, Io, other | N/A | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{debug, instrument};

use hopline_core::{
    Applied, Job, JobId, JobStatus, JobUpdate, Progress, Route, UpdateRequest,
};

use super::{ApplyOutcome, JobStats, JobStore, JobStoreError};

const MIGRATION: &str = include_str!("../../migrations/0001_job_lifecycle.sql");

const JOB_COLUMNS: &str = "id, status, route, payload, result, error, timeout_ms, deadline, \
     progress, cancel_requested, last_sequence, created_at, updated_at";

/// Apply the job lifecycle schema. Idempotent.
pub async fn migrate(pool: &PgPool) -> Result<(), JobStoreError> {
    sqlx::raw_sql(MIGRATION)
        .execute(pool)
        .await
        .map_err(|e| map_sqlx_error("migrate", e))?;
    Ok(())
}

/// Job store over the `jobs` and `job_updates` tables.
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

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, JobStoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }
}

async fn lock_job(
    tx: &mut Transaction<'static, Postgres>,
    job_id: &JobId,
) -> Result<Job, JobStoreError> {
    let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1 FOR UPDATE"))
        .bind(job_id.as_str())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("lock_job", e))?;
    match row {
        Some(row) => decode_job(&row),
        None => Err(JobStoreError::NotFound(job_id.clone())),
    }
}

async fn insert_update(
    tx: &mut Transaction<'static, Postgres>,
    update: &JobUpdate,
) -> Result<(), JobStoreError> {
    let progress = update.progress.as_ref().map(to_json).transpose()?;
    sqlx::query(
        r#"
        INSERT INTO job_updates (job_id, sequence, status, message, progress, result, error, recorded_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(update.job_id.as_str())
    .bind(to_i64(update.sequence))
    .bind(update.status.as_str())
    .bind(update.message.as_deref())
    .bind(progress)
    .bind(update.result.clone())
    .bind(update.error.as_deref())
    .bind(update.timestamp)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("insert_update", e))?;
    Ok(())
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    async fn create(&self, mut job: Job) -> Result<(Job, JobUpdate), JobStoreError> {
        let created = job.record_creation()?;
        let mut tx = self.begin().await?;

        sqlx::query(&format!(
            "INSERT INTO jobs ({JOB_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"
        ))
        .bind(job.id.as_str())
        .bind(job.status.as_str())
        .bind(to_json(&job.route)?)
        .bind(&job.payload)
        .bind(job.result.clone())
        .bind(job.error.as_deref())
        .bind(job.timeout_ms.map(to_i64))
        .bind(job.deadline)
        .bind(to_json(&job.progress)?)
        .bind(job.cancel_requested)
        .bind(to_i64(job.last_sequence))
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                JobStoreError::AlreadyExists(job.id.clone())
            } else {
                map_sqlx_error("insert_job", e)
            }
        })?;

        insert_update(&mut tx, &created).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok((job, created))
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn get(&self, job_id: &JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(job_id.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;
        row.as_ref().map(decode_job).transpose()
    }

    #[instrument(skip(self, request), fields(job_id = %job_id, status = ?request.status), err)]
    async fn apply_update(
        &self,
        job_id: &JobId,
        request: UpdateRequest,
    ) -> Result<ApplyOutcome, JobStoreError> {
        let mut tx = self.begin().await?;
        let mut job = lock_job(&mut tx, job_id).await?;

        let update = match job.apply(&request, Utc::now())? {
            Applied::AlreadyTerminal => {
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback", e))?;
                debug!(status = %job.status, "job already terminal; update ignored");
                return Ok(ApplyOutcome::AlreadyTerminal { job });
            }
            Applied::Appended(update) => update,
        };

        sqlx::query(
            r#"
            UPDATE jobs
            SET status = $2, result = $3, error = $4, progress = $5,
                last_sequence = $6, updated_at = $7
            WHERE id = $1
            "#,
        )
        .bind(job.id.as_str())
        .bind(job.status.as_str())
        .bind(job.result.clone())
        .bind(job.error.as_deref())
        .bind(to_json(&job.progress)?)
        .bind(to_i64(job.last_sequence))
        .bind(job.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("update_job", e))?;

        insert_update(&mut tx, &update).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(ApplyOutcome::Applied { job, update })
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn updates(&self, job_id: &JobId) -> Result<Vec<JobUpdate>, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT job_id, sequence, status, message, progress, result, error, recorded_at
            FROM job_updates
            WHERE job_id = $1
            ORDER BY sequence ASC
            "#,
        )
        .bind(job_id.as_str())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_updates", e))?;

        if rows.is_empty() && self.get(job_id).await?.is_none() {
            return Err(JobStoreError::NotFound(job_id.clone()));
        }

        rows.iter()
            .map(|row| {
                UpdateRow::from_row(row)
                    .map_err(|e| {
                        JobStoreError::Storage(format!("failed to deserialize update row: {e}"))
                    })
                    .and_then(UpdateRow::into_update)
            })
            .collect()
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn request_cancel(&self, job_id: &JobId) -> Result<Job, JobStoreError> {
        let mut tx = self.begin().await?;
        let mut job = lock_job(&mut tx, job_id).await?;

        if job.request_cancel(Utc::now()) {
            sqlx::query("UPDATE jobs SET cancel_requested = TRUE, updated_at = $2 WHERE id = $1")
                .bind(job.id.as_str())
                .bind(job.updated_at)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("request_cancel", e))?;
        }
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(job)
    }

    #[instrument(skip(self), err)]
    async fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE ($1::TEXT IS NULL OR status = $1) \
             ORDER BY created_at DESC, id ASC \
             LIMIT $2"
        ))
        .bind(status.map(JobStatus::as_str))
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
            stats.add(parse_status(&status), usize::try_from(count).unwrap_or(0));
        }
        Ok(stats)
    }
}

/// Stored statuses this build does not recognise degrade to `Unknown`.
fn parse_status(raw: &str) -> JobStatus {
    raw.parse().unwrap_or(JobStatus::Unknown)
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, JobStoreError> {
    serde_json::to_value(value)
        .map_err(|e| JobStoreError::Storage(format!("failed to encode column: {e}")))
}

fn from_json<T: serde::de::DeserializeOwned>(column: &str, value: Value) -> Result<T, JobStoreError> {
    serde_json::from_value(value)
        .map_err(|e| JobStoreError::Storage(format!("failed to decode column {column}: {e}")))
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => JobStoreError::Storage(format!(
            "database error in {operation}: {} (code {})",
            db_err.message(),
            db_err.code().as_deref().unwrap_or("none")
        )),
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        other => JobStoreError::Storage(format!("{operation} failed: {other}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

fn decode_job(row: &PgRow) -> Result<Job, JobStoreError> {
    JobRow::from_row(row)
        .map_err(|e| JobStoreError::Storage(format!("failed to deserialize job row: {e}")))?
        .into_job()
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: String,
    status: String,
    route: Value,
    payload: Value,
    result: Option<Value>,
    error: Option<String>,
    timeout_ms: Option<i64>,
    deadline: Option<DateTime<Utc>>,
    progress: Value,
    cancel_requested: bool,
    last_sequence: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            status: row.try_get("status")?,
            route: row.try_get("route")?,
            payload: row.try_get("payload")?,
            result: row.try_get("result")?,
            error: row.try_get("error")?,
            timeout_ms: row.try_get("timeout_ms")?,
            deadline: row.try_get("deadline")?,
            progress: row.try_get("progress")?,
            cancel_requested: row.try_get("cancel_requested")?,
            last_sequence: row.try_get("last_sequence")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl JobRow {
    fn into_job(self) -> Result<Job, JobStoreError> {
        let route: Route = from_json("route", self.route)?;
        let progress: Progress = from_json("progress", self.progress)?;
        Ok(Job {
            id: JobId::parse(self.id)?,
            status: parse_status(&self.status),
            route,
            payload: self.payload,
            result: self.result,
            error: self.error,
            timeout_ms: self.timeout_ms.map(to_u64),
            deadline: self.deadline,
            progress,
            cancel_requested: self.cancel_requested,
            last_sequence: to_u64(self.last_sequence),
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug)]
struct UpdateRow {
    job_id: String,
    sequence: i64,
    status: String,
    message: Option<String>,
    progress: Option<Value>,
    result: Option<Value>,
    error: Option<String>,
    recorded_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for UpdateRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(UpdateRow {
            job_id: row.try_get("job_id")?,
            sequence: row.try_get("sequence")?,
            status: row.try_get("status")?,
            message: row.try_get("message")?,
            progress: row.try_get("progress")?,
            result: row.try_get("result")?,
            error: row.try_get("error")?,
            recorded_at: row.try_get("recorded_at")?,
        })
    }
}

impl UpdateRow {
    fn into_update(self) -> Result<JobUpdate, JobStoreError> {
        let progress = self
            .progress
            .map(|value| from_json::<Progress>("progress", value))
            .transpose()?;
        Ok(JobUpdate {
            job_id: JobId::parse(self.job_id)?,
            sequence: to_u64(self.sequence),
            status: parse_status(&self.status),
            message: self.message,
            progress,
            result: self.result,
            error: self.error,
            timestamp: self.recorded_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrecognised_statuses_degrade_to_unknown() {
        assert_eq!(parse_status("running"), JobStatus::Running);
        assert_eq!(parse_status("Succeeded"), JobStatus::Succeeded);
        assert_eq!(parse_status("paused"), JobStatus::Unknown);
    }

    #[test]
    fn the_migration_creates_every_table() {
        for table in ["jobs", "job_updates", "job_audit_records"] {
            assert!(MIGRATION.contains(&format!("CREATE TABLE IF NOT EXISTS {table}")));
        }
    }
}
