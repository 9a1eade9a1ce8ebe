use serde::{Deserialize, Serialize};
use serde_json::Value;

use hopline_core::{FinalizeOutcome, Job, JobId, JobStatus, JobUpdate, Liveness, RouteMetadata};

use crate::app::errors;

/// Hard ceiling on `GET /jobs?limit=`.
pub const MAX_LIST_LIMIT: usize = 500;
pub const DEFAULT_LIST_LIMIT: usize = 50;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    /// Caller-assigned id; a UUIDv7 is minted when absent.
    pub id: Option<String>,
    pub steps: Vec<String>,
    #[serde(default)]
    pub payload: Value,
    pub timeout_ms: Option<u64>,
    pub metadata: Option<RouteMetadata>,
    /// Create directly in Running.
    #[serde(default)]
    pub start: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct CreateJobResponse {
    pub job: Job,
    /// Queue the first hop was published to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enqueued: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UpdateResponse {
    pub applied: bool,
    pub job: Job,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update: Option<JobUpdate>,
}

#[derive(Debug, Serialize)]
pub struct FinalizeResponse {
    pub outcome: FinalizeOutcome,
}

#[derive(Debug, Serialize)]
pub struct LivenessResponse {
    pub job_id: JobId,
    pub liveness: Liveness,
}

#[derive(Debug, Serialize)]
pub struct JobListResponse {
    pub jobs: Vec<Job>,
    pub count: usize,
}

// -------------------------
// Mapping helpers
// -------------------------

pub fn parse_job_id(raw: &str) -> Result<JobId, axum::response::Response> {
    JobId::parse(raw).map_err(|e| errors::bad_request(e.to_string()))
}

impl ListJobsQuery {
    pub fn status_filter(&self) -> Result<Option<JobStatus>, axum::response::Response> {
        self.status
            .as_deref()
            .map(|s| s.parse::<JobStatus>().map_err(|e| errors::bad_request(e.to_string())))
            .transpose()
    }

    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT)
    }
}
