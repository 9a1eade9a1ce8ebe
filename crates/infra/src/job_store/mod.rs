//! Authoritative job storage.
//!
//! ## Contract (identical for every backend)
//!
//! - `create` fails with [`JobStoreError::AlreadyExists`] on a duplicate id and
//!   writes log entry #1.
//! - `apply_update` appends exactly one entry per accepted change; a terminal
//!   status performs the once-only terminal transition.
//! - Updates to an already-terminal job are a no-op reported as
//!   [`ApplyOutcome::AlreadyTerminal`], never an error.
//! - Concurrent updates to the same job are serialised around
//!   read-apply-append; distinct jobs do not contend.
//! - `updated_at` never decreases; the log is append-only.

mod in_memory;
mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use hopline_core::{DomainError, Job, JobId, JobStatus, JobUpdate, ProgressUpdate, UpdateRequest};

pub use in_memory::InMemoryJobStore;
pub use postgres::{migrate, PostgresJobStore};

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<DomainError> for JobStoreError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::InvalidTransition { from, to } => Self::InvalidTransition { from, to },
            other => Self::Validation(other.to_string()),
        }
    }
}

/// Result of an accepted update call.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// The job changed and `update` was appended to its log.
    Applied { job: Job, update: JobUpdate },
    /// The job was already terminal; nothing was written.
    AlreadyTerminal { job: Job },
}

impl ApplyOutcome {
    pub fn job(&self) -> &Job {
        match self {
            ApplyOutcome::Applied { job, .. } | ApplyOutcome::AlreadyTerminal { job } => job,
        }
    }

    pub fn update(&self) -> Option<&JobUpdate> {
        match self {
            ApplyOutcome::Applied { update, .. } => Some(update),
            ApplyOutcome::AlreadyTerminal { .. } => None,
        }
    }
}

/// Job counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub unknown: usize,
}

impl JobStats {
    pub fn add(&mut self, status: JobStatus, count: usize) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Running => self.running += count,
            JobStatus::Succeeded => self.succeeded += count,
            JobStatus::Failed => self.failed += count,
            JobStatus::Unknown => self.unknown += count,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.running + self.succeeded + self.failed + self.unknown
    }
}

/// Job store abstraction.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job and its creation entry.
    async fn create(&self, job: Job) -> Result<(Job, JobUpdate), JobStoreError>;

    /// Point read.
    async fn get(&self, job_id: &JobId) -> Result<Option<Job>, JobStoreError>;

    /// Apply a partial update (status, progress, or both).
    async fn apply_update(
        &self,
        job_id: &JobId,
        request: UpdateRequest,
    ) -> Result<ApplyOutcome, JobStoreError>;

    /// Progress-only update; the status only moves Pending -> Running.
    async fn apply_progress(
        &self,
        job_id: &JobId,
        progress: ProgressUpdate,
    ) -> Result<ApplyOutcome, JobStoreError> {
        self.apply_update(job_id, progress.into()).await
    }

    /// The job's update log, in sequence order.
    async fn updates(&self, job_id: &JobId) -> Result<Vec<JobUpdate>, JobStoreError>;

    /// Flag the job for cooperative cancellation (no-op on terminal jobs).
    async fn request_cancel(&self, job_id: &JobId) -> Result<Job, JobStoreError>;

    /// Most recent jobs first, optionally filtered by status.
    async fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    async fn stats(&self) -> Result<JobStats, JobStoreError>;
}

#[async_trait]
impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    async fn create(&self, job: Job) -> Result<(Job, JobUpdate), JobStoreError> {
        (**self).create(job).await
    }

    async fn get(&self, job_id: &JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(job_id).await
    }

    async fn apply_update(
        &self,
        job_id: &JobId,
        request: UpdateRequest,
    ) -> Result<ApplyOutcome, JobStoreError> {
        (**self).apply_update(job_id, request).await
    }

    async fn apply_progress(
        &self,
        job_id: &JobId,
        progress: ProgressUpdate,
    ) -> Result<ApplyOutcome, JobStoreError> {
        (**self).apply_progress(job_id, progress).await
    }

    async fn updates(&self, job_id: &JobId) -> Result<Vec<JobUpdate>, JobStoreError> {
        (**self).updates(job_id).await
    }

    async fn request_cancel(&self, job_id: &JobId) -> Result<Job, JobStoreError> {
        (**self).request_cancel(job_id).await
    }

    async fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        (**self).list(status, limit).await
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        (**self).stats().await
    }
}
