//! The job entity and its status state machine.
//!
//! ## Lifecycle
//!
//! ```text
//! Pending ──► Running ──► Succeeded
//!    │                 └─► Failed
//!    └──────────────────► (terminal directly)
//! ```
//!
//! - Terminal states are immutable: once Succeeded/Failed no field changes.
//! - `updated_at` never moves backwards; writes stamp `max(now, updated_at)`.
//! - `Unknown` is a degraded read state (an unrecognised stored status). It is
//!   never the target of an update.
//!
//! Every accepted change produces exactly one [`JobUpdate`] with the next
//! sequence number; both store backends persist that entry verbatim.

use core::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DomainError, DomainResult};
use crate::id::JobId;
use crate::route::Route;
use crate::update::{JobUpdate, ProgressPatch, UpdateRequest};

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[serde(alias = "Pending")]
    Pending,
    #[serde(alias = "Running")]
    Running,
    #[serde(alias = "Succeeded")]
    Succeeded,
    #[serde(alias = "Failed")]
    Failed,
    #[serde(alias = "Unknown")]
    Unknown,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Succeeded,
        JobStatus::Failed,
        JobStatus::Unknown,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }

    fn rank(self) -> Option<u8> {
        match self {
            JobStatus::Pending => Some(0),
            JobStatus::Running => Some(1),
            JobStatus::Succeeded | JobStatus::Failed => Some(2),
            JobStatus::Unknown => None,
        }
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// Staying in the same non-terminal status is allowed (progress entries).
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self.rank(), next.rank()) {
            (_, None) => false,
            (None, Some(_)) => next != JobStatus::Pending,
            (Some(from), Some(to)) => to >= from,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Unknown => "unknown",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| DomainError::validation(format!("unknown job status: {s}")))
    }
}

/// Progress display fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub percent: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    pub steps_completed: u32,
    pub total_steps: u32,
}

impl Progress {
    fn apply(&mut self, patch: &ProgressPatch) {
        if let Some(percent) = patch.percent {
            self.percent = percent;
        }
        if let Some(step) = &patch.current_step {
            self.current_step = Some(step.clone());
        }
        if let Some(done) = patch.steps_completed {
            self.steps_completed = done;
        }
        if let Some(total) = patch.total_steps {
            self.total_steps = total;
        }
    }
}

/// Result of a cooperative liveness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    Live,
    DeadlineExceeded,
    Cancelled,
    /// The job already reached a terminal state.
    Finished,
}

impl Liveness {
    pub fn is_live(self) -> bool {
        matches!(self, Liveness::Live)
    }
}

/// Effect of applying an update to a job.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    /// The job changed; this entry must be appended to the log.
    Appended(JobUpdate),
    /// The job was already terminal; nothing changed.
    AlreadyTerminal,
}

/// A pipeline job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    pub route: Route,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub progress: Progress,
    #[serde(default)]
    pub cancel_requested: bool,
    /// Sequence of the newest log entry (0 before creation is recorded).
    #[serde(default)]
    pub last_sequence: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// A pending job. The route's metadata receives the fallback job id.
    pub fn new(id: JobId, mut route: Route, payload: Value) -> Self {
        let now = Utc::now();
        route.metadata.set_job_id(&id);
        let total_steps = u32::try_from(route.total_steps()).unwrap_or(u32::MAX);
        Self {
            id,
            status: JobStatus::Pending,
            route,
            payload,
            result: None,
            error: None,
            timeout_ms: None,
            deadline: None,
            progress: Progress {
                total_steps,
                ..Progress::default()
            },
            cancel_requested: false,
            last_sequence: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the timeout budget; the deadline counts from `created_at`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self.deadline = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|d| self.created_at.checked_add_signed(d));
        self
    }

    /// Mark the job Running from the start.
    pub fn started(mut self) -> Self {
        self.status = JobStatus::Running;
        self
    }

    /// Record creation: the first log entry, carrying the initial status.
    pub fn record_creation(&mut self) -> DomainResult<JobUpdate> {
        if self.last_sequence != 0 {
            return Err(DomainError::validation(format!(
                "job {} already has {} log entries",
                self.id, self.last_sequence
            )));
        }
        if !matches!(self.status, JobStatus::Pending | JobStatus::Running) {
            return Err(DomainError::validation(format!(
                "jobs are created pending or running, not {}",
                self.status
            )));
        }
        self.last_sequence = 1;
        Ok(JobUpdate {
            job_id: self.id.clone(),
            sequence: 1,
            status: self.status,
            message: Some("job created".to_string()),
            progress: None,
            result: None,
            error: None,
            timestamp: self.created_at,
        })
    }

    /// Apply a partial update, returning the log entry it produces.
    pub fn apply(&mut self, request: &UpdateRequest, now: DateTime<Utc>) -> DomainResult<Applied> {
        if self.status.is_terminal() {
            return Ok(Applied::AlreadyTerminal);
        }
        request.validate()?;

        let target = match request.status {
            Some(JobStatus::Unknown) => {
                return Err(DomainError::InvalidTransition {
                    from: self.status,
                    to: JobStatus::Unknown,
                });
            }
            Some(status) => status,
            None if self.status == JobStatus::Pending && request.progress.is_some() => {
                JobStatus::Running
            }
            None => self.status,
        };
        if target != self.status && !self.status.can_transition_to(target) {
            return Err(DomainError::InvalidTransition {
                from: self.status,
                to: target,
            });
        }

        if let Some(patch) = &request.progress {
            self.progress.apply(patch);
        }
        match target {
            JobStatus::Succeeded => {
                self.result = Some(request.result.clone().unwrap_or(Value::Null));
                self.progress.percent = 100;
                self.progress.steps_completed = self.progress.total_steps;
            }
            JobStatus::Failed => {
                let error = request
                    .error
                    .clone()
                    .or_else(|| request.message.clone())
                    .unwrap_or_else(|| "job failed".to_string());
                self.error = Some(error);
            }
            _ => {}
        }

        let at = now.max(self.updated_at);
        self.status = target;
        self.updated_at = at;
        self.last_sequence += 1;

        Ok(Applied::Appended(JobUpdate {
            job_id: self.id.clone(),
            sequence: self.last_sequence,
            status: target,
            message: request.message.clone(),
            progress: (request.progress.is_some() || target.is_terminal())
                .then(|| self.progress.clone()),
            result: (target == JobStatus::Succeeded)
                .then(|| self.result.clone())
                .flatten(),
            error: (target == JobStatus::Failed)
                .then(|| self.error.clone())
                .flatten(),
            timestamp: at,
        }))
    }

    /// Flag the job for cooperative cancellation.
    ///
    /// Returns `false` when the job is terminal or already flagged.
    pub fn request_cancel(&mut self, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() || self.cancel_requested {
            return false;
        }
        self.cancel_requested = true;
        self.updated_at = now.max(self.updated_at);
        true
    }

    pub fn liveness(&self, now: DateTime<Utc>) -> Liveness {
        if self.status.is_terminal() {
            Liveness::Finished
        } else if self.cancel_requested {
            Liveness::Cancelled
        } else if self.deadline.is_some_and(|deadline| now >= deadline) {
            Liveness::DeadlineExceeded
        } else {
            Liveness::Live
        }
    }

    /// Time left before the deadline, if one is set.
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.deadline
            .map(|deadline| (deadline - now).to_std().unwrap_or(Duration::ZERO))
    }
}
