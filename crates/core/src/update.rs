//! Update log entries and the partial updates that produce them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DomainError, DomainResult};
use crate::id::JobId;
use crate::job::{JobStatus, Progress};

/// One immutable entry of a job's append-only update log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobUpdate {
    pub job_id: JobId,
    /// 1-based, gapless per job.
    pub sequence: u64,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<Progress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl JobUpdate {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Partial progress fields; `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps_completed: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_steps: Option<u32>,
}

impl ProgressPatch {
    pub fn is_empty(&self) -> bool {
        self.percent.is_none()
            && self.current_step.is_none()
            && self.steps_completed.is_none()
            && self.total_steps.is_none()
    }

    pub fn validate(&self) -> DomainResult<()> {
        if let Some(percent) = self.percent {
            if percent > 100 {
                return Err(DomainError::validation(format!(
                    "progress percent must be within 0..=100, got {percent}"
                )));
            }
        }
        Ok(())
    }
}

/// Partial update keyed by job id: status-only, progress-only, or combined.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<ProgressPatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UpdateRequest {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_progress(mut self, progress: ProgressPatch) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Reject field combinations the job model cannot hold.
    pub fn validate(&self) -> DomainResult<()> {
        if let Some(progress) = &self.progress {
            progress.validate()?;
        }
        if self.result.is_some() && self.status != Some(JobStatus::Succeeded) {
            return Err(DomainError::validation(
                "a result may only accompany a succeeded status",
            ));
        }
        if self.error.is_some() && self.status != Some(JobStatus::Failed) {
            return Err(DomainError::validation(
                "an error may only accompany a failed status",
            ));
        }
        Ok(())
    }
}

/// Progress-only update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    #[serde(flatten)]
    pub progress: ProgressPatch,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl From<ProgressUpdate> for UpdateRequest {
    fn from(value: ProgressUpdate) -> Self {
        Self {
            progress: Some(value.progress),
            message: value.message,
            ..Self::default()
        }
    }
}

/// Liveness signal emitted by a stage around its compute call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatStatus {
    PickedUp,
    Processing,
    Completed,
    Error,
}

impl HeartbeatStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HeartbeatStatus::PickedUp => "picked_up",
            HeartbeatStatus::Processing => "processing",
            HeartbeatStatus::Completed => "completed",
            HeartbeatStatus::Error => "error",
        }
    }
}

/// Ephemeral heartbeat. Never carries a terminal outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub stage: String,
    pub status: HeartbeatStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_steps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Heartbeat {
    pub fn new(stage: impl Into<String>, status: HeartbeatStatus) -> Self {
        Self {
            stage: stage.into(),
            status,
            step_index: None,
            total_steps: None,
            message: None,
        }
    }

    pub fn at_step(mut self, step_index: u32, total_steps: u32) -> Self {
        self.step_index = Some(step_index);
        self.total_steps = Some(total_steps);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Progress fields this heartbeat implies.
    pub fn to_progress(&self) -> ProgressUpdate {
        let mut progress = ProgressPatch {
            total_steps: self.total_steps,
            ..ProgressPatch::default()
        };
        match self.status {
            HeartbeatStatus::PickedUp => {
                progress.current_step = Some(self.stage.clone());
                progress.steps_completed = self.step_index;
            }
            HeartbeatStatus::Processing => {
                progress.current_step = Some(self.stage.clone());
            }
            HeartbeatStatus::Completed => {
                if let Some(index) = self.step_index {
                    let done = index.saturating_add(1);
                    progress.steps_completed = Some(done);
                    if let Some(total) = self.total_steps.filter(|t| *t > 0) {
                        let percent = (u64::from(done.min(total)) * 100) / u64::from(total);
                        progress.percent = Some(percent as u8);
                    }
                }
            }
            HeartbeatStatus::Error => {}
        }
        let message = self.message.clone().or_else(|| {
            Some(format!("stage {} {}", self.stage, self.status.as_str()))
        });
        ProgressUpdate { progress, message }
    }
}

/// Body of the final-status call made by terminal handlers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FinalStatus {
    #[serde(alias = "Succeeded")]
    Succeeded {
        #[serde(default)]
        result: Value,
    },
    #[serde(alias = "Failed")]
    Failed { error: String },
}

impl FinalStatus {
    pub fn status(&self) -> JobStatus {
        match self {
            FinalStatus::Succeeded { .. } => JobStatus::Succeeded,
            FinalStatus::Failed { .. } => JobStatus::Failed,
        }
    }
}

impl From<FinalStatus> for UpdateRequest {
    fn from(value: FinalStatus) -> Self {
        match value {
            FinalStatus::Succeeded { result } => Self {
                status: Some(JobStatus::Succeeded),
                result: Some(result),
                ..Self::default()
            },
            FinalStatus::Failed { error } => Self {
                status: Some(JobStatus::Failed),
                error: Some(error),
                ..Self::default()
            },
        }
    }
}

/// What a final-status call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalizeOutcome {
    Applied,
    /// The job was already terminal; nothing was written.
    AlreadyTerminal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn final_status_accepts_both_spellings() {
        let lower: FinalStatus =
            serde_json::from_value(json!({"status": "succeeded", "result": {"y": 3}})).unwrap();
        let pascal: FinalStatus =
            serde_json::from_value(json!({"status": "Succeeded", "result": {"y": 3}})).unwrap();
        assert_eq!(lower, pascal);

        let failed: FinalStatus =
            serde_json::from_value(json!({"status": "Failed", "error": "bad input"})).unwrap();
        assert_eq!(failed.status(), JobStatus::Failed);
        assert_eq!(
            serde_json::to_value(&failed).unwrap(),
            json!({"status": "failed", "error": "bad input"})
        );
    }

    #[test]
    fn final_status_converts_into_terminal_request() {
        let request: UpdateRequest = FinalStatus::Succeeded { result: json!({"y": 3}) }.into();
        assert_eq!(request.status, Some(JobStatus::Succeeded));
        assert_eq!(request.result, Some(json!({"y": 3})));
        request.validate().unwrap();
    }

    #[test]
    fn results_and_errors_require_matching_status() {
        let stray_result = UpdateRequest {
            result: Some(json!(1)),
            ..UpdateRequest::default()
        };
        assert!(stray_result.validate().is_err());

        let stray_error = UpdateRequest {
            status: Some(JobStatus::Running),
            error: Some("nope".into()),
            ..UpdateRequest::default()
        };
        assert!(stray_error.validate().is_err());

        let too_far = UpdateRequest::default().with_progress(ProgressPatch {
            percent: Some(101),
            ..ProgressPatch::default()
        });
        assert!(too_far.validate().is_err());
    }

    #[test]
    fn completed_heartbeat_reports_step_progress() {
        let hb = Heartbeat::new("infer", HeartbeatStatus::Completed).at_step(1, 2);
        let progress = hb.to_progress();
        assert_eq!(progress.progress.steps_completed, Some(2));
        assert_eq!(progress.progress.percent, Some(100));
        assert_eq!(progress.message.as_deref(), Some("stage infer completed"));

        let picked = Heartbeat::new("parse", HeartbeatStatus::PickedUp).at_step(0, 2);
        let progress = picked.to_progress();
        assert_eq!(progress.progress.current_step.as_deref(), Some("parse"));
        assert_eq!(progress.progress.steps_completed, Some(0));
        assert_eq!(progress.progress.percent, None);
    }

    #[test]
    fn progress_update_flattens_on_the_wire() {
        let update: ProgressUpdate =
            serde_json::from_value(json!({"percent": 40, "current_step": "infer"})).unwrap();
        assert_eq!(update.progress.percent, Some(40));
        let request: UpdateRequest = update.into();
        assert!(request.status.is_none());
        assert!(request.progress.is_some());
    }
}
