//! How routers reach the job lifecycle: final status, heartbeats, liveness.
//!
//! Two implementations: in-process over [`JobLifecycle`] (tests, single
//! process) and [`HttpStatusSink`] over the Job API (deployments).

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use tracing::debug;

use hopline_core::{FinalStatus, FinalizeOutcome, Heartbeat, JobId, Liveness};
use hopline_infra::{JobLifecycle, JobStore, JobStoreError};

#[derive(Debug, Clone, thiserror::Error)]
pub enum StatusError {
    /// Worth retrying: the status service could not be reached or failed.
    #[error("status service unavailable: {0}")]
    Unavailable(String),

    #[error("status update rejected: {0}")]
    Rejected(String),

    #[error("unknown job: {0}")]
    UnknownJob(JobId),
}

impl From<JobStoreError> for StatusError {
    fn from(value: JobStoreError) -> Self {
        match value {
            JobStoreError::NotFound(id) => StatusError::UnknownJob(id),
            JobStoreError::Storage(msg) => StatusError::Unavailable(msg),
            other => StatusError::Rejected(other.to_string()),
        }
    }
}

#[async_trait]
pub trait StatusSink: Send + Sync {
    /// Idempotent terminal write.
    async fn finalize(&self, job_id: &JobId, status: FinalStatus) -> Result<FinalizeOutcome, StatusError>;

    async fn heartbeat(&self, job_id: &JobId, heartbeat: &Heartbeat) -> Result<(), StatusError>;
}

/// Cooperative cancellation probe.
#[async_trait]
pub trait LivenessCheck: Send + Sync {
    async fn liveness(&self, job_id: &JobId) -> Result<Liveness, StatusError>;
}

#[async_trait]
impl<S: JobStore> StatusSink for JobLifecycle<S> {
    async fn finalize(&self, job_id: &JobId, status: FinalStatus) -> Result<FinalizeOutcome, StatusError> {
        Ok(JobLifecycle::finalize(self, job_id, status).await?)
    }

    async fn heartbeat(&self, job_id: &JobId, heartbeat: &Heartbeat) -> Result<(), StatusError> {
        self.ingest_heartbeat(job_id, heartbeat).await?;
        Ok(())
    }
}

#[async_trait]
impl<S: JobStore> LivenessCheck for JobLifecycle<S> {
    async fn liveness(&self, job_id: &JobId) -> Result<Liveness, StatusError> {
        Ok(JobLifecycle::liveness(self, job_id).await?)
    }
}

#[derive(Debug, Deserialize)]
struct FinalizeReply {
    outcome: FinalizeOutcome,
}

#[derive(Debug, Deserialize)]
struct LivenessReply {
    liveness: Liveness,
}

/// Status sink over the Job API.
#[derive(Debug, Clone)]
pub struct HttpStatusSink {
    client: reqwest::Client,
    base: Url,
}

impl HttpStatusSink {
    pub fn new(base_url: &str) -> Result<Self, StatusError> {
        let base = Url::parse(base_url)
            .map_err(|e| StatusError::Rejected(format!("invalid status url {base_url:?}: {e}")))?;
        Ok(Self {
            client: reqwest::Client::new(),
            base,
        })
    }

    fn job_url(&self, job_id: &JobId, action: &str) -> Result<Url, StatusError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| StatusError::Rejected(format!("status url {} cannot be a base", self.base)))?
            .pop_if_empty()
            .extend(["jobs", job_id.as_str(), action]);
        Ok(url)
    }

    async fn check(response: reqwest::Response, job_id: &JobId) -> Result<reqwest::Response, StatusError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::NOT_FOUND => StatusError::UnknownJob(job_id.clone()),
            s if s.is_server_error() => StatusError::Unavailable(format!("{s}: {body}")),
            s => StatusError::Rejected(format!("{s}: {body}")),
        })
    }
}

fn unreachable(err: reqwest::Error) -> StatusError {
    StatusError::Unavailable(err.to_string())
}

#[async_trait]
impl StatusSink for HttpStatusSink {
    async fn finalize(&self, job_id: &JobId, status: FinalStatus) -> Result<FinalizeOutcome, StatusError> {
        let response = self
            .client
            .post(self.job_url(job_id, "final")?)
            .json(&status)
            .send()
            .await
            .map_err(unreachable)?;
        let reply: FinalizeReply = Self::check(response, job_id)
            .await?
            .json()
            .await
            .map_err(|e| StatusError::Unavailable(format!("undecodable final-status reply: {e}")))?;
        Ok(reply.outcome)
    }

    async fn heartbeat(&self, job_id: &JobId, heartbeat: &Heartbeat) -> Result<(), StatusError> {
        let response = self
            .client
            .post(self.job_url(job_id, "heartbeat")?)
            .json(heartbeat)
            .send()
            .await
            .map_err(unreachable)?;
        Self::check(response, job_id).await?;
        debug!(job_id = %job_id, status = heartbeat.status.as_str(), "heartbeat sent");
        Ok(())
    }
}

#[async_trait]
impl LivenessCheck for HttpStatusSink {
    async fn liveness(&self, job_id: &JobId) -> Result<Liveness, StatusError> {
        let response = self
            .client
            .get(self.job_url(job_id, "liveness")?)
            .send()
            .await
            .map_err(unreachable)?;
        let reply: LivenessReply = Self::check(response, job_id)
            .await?
            .json()
            .await
            .map_err(|e| StatusError::Unavailable(format!("undecodable liveness reply: {e}")))?;
        Ok(reply.liveness)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_urls_escape_the_id() {
        let sink = HttpStatusSink::new("http://api:8080/").unwrap();
        let url = sink
            .job_url(&JobId::parse("batch 7").unwrap(), "final")
            .unwrap();
        assert_eq!(url.as_str(), "http://api:8080/jobs/batch%207/final");

        let nested = HttpStatusSink::new("http://api:8080/v1").unwrap();
        let url = nested.job_url(&JobId::parse("j1").unwrap(), "liveness").unwrap();
        assert_eq!(url.as_str(), "http://api:8080/v1/jobs/j1/liveness");
    }

    #[test]
    fn store_errors_map_to_status_errors() {
        let id = JobId::parse("j1").unwrap();
        assert!(matches!(
            StatusError::from(JobStoreError::NotFound(id)),
            StatusError::UnknownJob(_)
        ));
        assert!(matches!(
            StatusError::from(JobStoreError::Storage("down".into())),
            StatusError::Unavailable(_)
        ));
        assert!(matches!(
            StatusError::from(JobStoreError::Validation("bad".into())),
            StatusError::Rejected(_)
        ));
    }
}
