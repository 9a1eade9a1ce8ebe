use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::instrument;

use hopline_core::JobId;

use super::{AuditError, AuditRecord, AuditStore};

/// Audit trail in `job_audit_records`; the full record is kept as JSONB.
#[derive(Debug, Clone)]
pub struct PostgresAuditStore {
    pool: Arc<PgPool>,
}

impl PostgresAuditStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl AuditStore for PostgresAuditStore {
    #[instrument(skip(self, record), fields(job_id = %record.job_id), err)]
    async fn record(&self, record: &AuditRecord) -> Result<String, AuditError> {
        let key = record.key();
        let body = serde_json::to_value(record)
            .map_err(|e| AuditError::Storage(format!("failed to encode audit record: {e}")))?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO job_audit_records (key, job_id, recorded_at, final_attempt, record)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (key) DO NOTHING
            "#,
        )
        .bind(&key)
        .bind(record.job_id.as_str())
        .bind(record.recorded_at)
        .bind(record.final_attempt)
        .bind(body)
        .execute(&*self.pool)
        .await
        .map_err(|e| AuditError::Storage(format!("insert_audit_record failed: {e}")))?;

        if inserted.rows_affected() == 0 {
            return Err(AuditError::AlreadyExists(key));
        }
        Ok(key)
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn for_job(&self, job_id: &JobId) -> Result<Vec<AuditRecord>, AuditError> {
        let rows = sqlx::query(
            "SELECT record FROM job_audit_records WHERE job_id = $1 ORDER BY recorded_at ASC, key ASC",
        )
        .bind(job_id.as_str())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| AuditError::Storage(format!("load_audit_records failed: {e}")))?;

        rows.iter()
            .map(|row| {
                let body: serde_json::Value = row
                    .try_get("record")
                    .map_err(|e| AuditError::Storage(format!("failed to read audit row: {e}")))?;
                serde_json::from_value(body)
                    .map_err(|e| AuditError::Storage(format!("failed to decode audit record: {e}")))
            })
            .collect()
    }
}
