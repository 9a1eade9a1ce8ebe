//! Write-once audit trail of failed attempts.
//!
//! The failure terminal handler writes one record per failure it processes,
//! retried or not. Records are keyed `{job_id}/{recorded_at}` with the
//! timestamp in RFC 3339 at microsecond precision, so a job's records sort
//! chronologically by key.

mod in_memory;
mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use hopline_core::{JobId, RetryAttempt};
use hopline_events::Severity;

pub use in_memory::InMemoryAuditStore;
pub use postgres::PostgresAuditStore;

#[derive(Debug, Clone, thiserror::Error)]
pub enum AuditError {
    #[error("audit record already exists: {0}")]
    AlreadyExists(String),
    #[error("audit storage error: {0}")]
    Storage(String),
}

/// One failed attempt as seen by the failure handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub job_id: JobId,
    pub recorded_at: DateTime<Utc>,
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// No retry follows this record; the job was marked Failed.
    pub final_attempt: bool,
    #[serde(default)]
    pub retry_history: Vec<RetryAttempt>,
    pub original_message: String,
}

impl AuditRecord {
    /// A record stamped now, truncated to the precision of the key.
    pub fn new(job_id: JobId, error: impl Into<String>, original_message: impl Into<String>) -> Self {
        Self {
            job_id,
            recorded_at: Utc::now().trunc_subsecs(6),
            error: error.into(),
            code: None,
            severity: None,
            stage: None,
            retry_count: 0,
            max_retries: 0,
            final_attempt: false,
            retry_history: Vec::new(),
            original_message: original_message.into(),
        }
    }

    pub fn key(&self) -> String {
        format!(
            "{}/{}",
            self.job_id,
            self.recorded_at.to_rfc3339_opts(SecondsFormat::Micros, true)
        )
    }

    /// Move the timestamp one microsecond forward (key collision).
    pub fn bump(&mut self) {
        self.recorded_at += chrono::Duration::microseconds(1);
    }
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Write a record once; returns its key.
    async fn record(&self, record: &AuditRecord) -> Result<String, AuditError>;

    /// A job's records, oldest first.
    async fn for_job(&self, job_id: &JobId) -> Result<Vec<AuditRecord>, AuditError>;
}

#[async_trait]
impl<S> AuditStore for Arc<S>
where
    S: AuditStore + ?Sized,
{
    async fn record(&self, record: &AuditRecord) -> Result<String, AuditError> {
        (**self).record(record).await
    }

    async fn for_job(&self, job_id: &JobId) -> Result<Vec<AuditRecord>, AuditError> {
        (**self).for_job(job_id).await
    }
}
