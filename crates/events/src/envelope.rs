use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use hopline_core::{DomainError, Job, JobId, Route};

/// Severity attached to a failed compute call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Recoverable,
    Fatal,
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error("failed to encode envelope: {0}")]
    Encode(String),

    #[error(transparent)]
    Domain(#[from] DomainError),
}

/// Unit of work in flight on a queue.
///
/// Notes:
/// - The job id lives at the top level **and** in `route.metadata.job_id`;
///   a hop may drop the former, so readers go through [`Envelope::job_id`].
/// - `payload` is opaque to the router; it is the previous stage's result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    pub route: Route,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
}

impl Envelope {
    pub fn new(job_id: JobId, mut route: Route, payload: Value) -> Self {
        route.metadata.set_job_id(&job_id);
        Self {
            job_id: Some(job_id),
            route,
            payload,
            deadline: None,
        }
    }

    /// First-hop envelope for a freshly created job.
    pub fn for_job(job: &Job) -> Self {
        let mut envelope = Self::new(job.id.clone(), job.route.clone(), job.payload.clone());
        envelope.deadline = job.deadline;
        envelope
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Job id from the top level, falling back to route metadata.
    pub fn job_id(&self) -> Option<JobId> {
        self.job_id
            .clone()
            .or_else(|| self.route.metadata.job_id())
    }

    pub fn decode(body: &str) -> Result<Self, EnvelopeError> {
        serde_json::from_str(body).map_err(|e| EnvelopeError::Malformed(e.to_string()))
    }

    pub fn encode(&self) -> Result<String, EnvelopeError> {
        serde_json::to_string(self).map_err(|e| EnvelopeError::Encode(e.to_string()))
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }

    /// Time left before the deadline, if one is set.
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.deadline
            .map(|deadline| (deadline - now).to_std().unwrap_or(Duration::ZERO))
    }

    /// Envelope for the next step carrying `payload`.
    ///
    /// Restores the top-level job id from metadata when an earlier hop lost it.
    pub fn forward(&self, payload: Value) -> Result<Envelope, EnvelopeError> {
        let route = self.route.advanced()?;
        Ok(Envelope {
            job_id: self.job_id(),
            route,
            payload,
            deadline: self.deadline,
        })
    }

    /// Envelope for the success terminal: same route, final payload.
    pub fn complete(&self, payload: Value) -> Envelope {
        Envelope {
            job_id: self.job_id(),
            route: self.route.clone(),
            payload,
            deadline: self.deadline,
        }
    }
}

/// Best-effort job id lookup on a body that may not decode as an [`Envelope`].
pub fn job_id_from_raw(body: &str) -> Option<JobId> {
    let value: Value = serde_json::from_str(body).ok()?;
    let top = value
        .get("job_id")
        .and_then(Value::as_str)
        .and_then(|s| JobId::parse(s).ok());
    top.or_else(|| {
        value
            .pointer("/route/metadata/job_id")
            .and_then(Value::as_str)
            .and_then(|s| JobId::parse(s).ok())
    })
}

/// Failure wrapper published to the failure-terminal queue.
///
/// `original_message` is the exact body the failing hop received, so the
/// retrier can replay it unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureEnvelope {
    pub error: String,
    pub original_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    /// Suggested delay before retrying, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
}

impl FailureEnvelope {
    pub fn new(error: impl Into<String>, original_message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            original_message: original_message.into(),
            retry_count: None,
            code: None,
            severity: None,
            retry_after: None,
            stage: None,
            failed_at: Some(Utc::now()),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    pub fn with_retry_after(mut self, retry_after: Option<f64>) -> Self {
        self.retry_after = retry_after;
        self
    }

    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    /// Carry a retry count; zero is left implicit.
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = (retry_count > 0).then_some(retry_count);
        self
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count.unwrap_or(0)
    }

    /// The endpoint's hint; hints too large for a `Duration` saturate.
    pub fn retry_after_duration(&self) -> Option<Duration> {
        self.retry_after
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .map(|secs| Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX))
    }

    pub fn original(&self) -> Result<Envelope, EnvelopeError> {
        Envelope::decode(&self.original_message)
    }

    pub fn job_id(&self) -> Option<JobId> {
        job_id_from_raw(&self.original_message)
    }

    pub fn decode(body: &str) -> Result<Self, EnvelopeError> {
        serde_json::from_str(body).map_err(|e| EnvelopeError::Malformed(e.to_string()))
    }

    pub fn encode(&self) -> Result<String, EnvelopeError> {
        serde_json::to_string(self).map_err(|e| EnvelopeError::Encode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn j1() -> JobId {
        JobId::parse("j1").unwrap()
    }

    #[test]
    fn wire_shape_matches_queue_contract() {
        let envelope = Envelope::new(j1(), Route::new(["parse", "infer"]), json!({"x": 1}));
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            value,
            json!({
                "job_id": "j1",
                "route": {"steps": ["parse", "infer"], "current": 0, "metadata": {"job_id": "j1"}},
                "payload": {"x": 1},
            })
        );
    }

    #[test]
    fn job_id_falls_back_to_route_metadata() {
        let body = json!({
            "route": {"steps": ["a"], "current": 0, "metadata": {"job_id": "j1"}},
            "payload": null,
        })
        .to_string();
        let envelope = Envelope::decode(&body).unwrap();
        assert_eq!(envelope.job_id, None);
        assert_eq!(envelope.job_id(), Some(j1()));
        assert_eq!(job_id_from_raw(&body), Some(j1()));
    }

    #[test]
    fn forward_advances_and_repairs_top_level_id() {
        let mut envelope = Envelope::new(j1(), Route::new(["parse", "infer"]), json!({"x": 1}));
        envelope.job_id = None;

        let next = envelope.forward(json!({"x": 2})).unwrap();
        assert_eq!(next.route.current, 1);
        assert_eq!(next.job_id, Some(j1()));
        assert_eq!(next.payload, json!({"x": 2}));
        assert!(next.forward(json!({})).is_err());
    }

    #[test]
    fn deadline_checks() {
        let now = Utc::now();
        let envelope = Envelope::new(j1(), Route::new(["a"]), json!(null))
            .with_deadline(now + chrono::Duration::seconds(5));
        assert!(!envelope.is_expired(now));
        assert!(envelope.is_expired(now + chrono::Duration::seconds(5)));
        assert_eq!(envelope.remaining(now + chrono::Duration::seconds(9)), Some(Duration::ZERO));
    }

    #[test]
    fn job_id_from_raw_tolerates_garbage() {
        assert_eq!(job_id_from_raw("not json"), None);
        assert_eq!(job_id_from_raw(r#"{"job_id": 7}"#), None);
        assert_eq!(
            job_id_from_raw(r#"{"job_id": "j1", "route": "broken"}"#),
            Some(j1())
        );
    }

    #[test]
    fn failure_wrapper_keeps_original_verbatim() {
        let original = Envelope::new(j1(), Route::new(["infer"]), json!({"x": 2}))
            .encode()
            .unwrap();
        let failure = FailureEnvelope::new("bad input", original.clone())
            .with_code("processing_error")
            .with_severity(Severity::Fatal)
            .with_retry_count(0);

        let decoded = FailureEnvelope::decode(&failure.encode().unwrap()).unwrap();
        assert_eq!(decoded.original_message, original);
        assert_eq!(decoded.retry_count, None);
        assert_eq!(decoded.retry_count(), 0);
        assert_eq!(decoded.job_id(), Some(j1()));
        assert_eq!(decoded.original().unwrap().payload, json!({"x": 2}));
    }

    #[test]
    fn minimal_failure_wrapper_decodes() {
        let decoded = FailureEnvelope::decode(
            r#"{"error": "boom", "original_message": "{}", "retry_count": 2, "retry_after": 30}"#,
        )
        .unwrap();
        assert_eq!(decoded.retry_count(), 2);
        assert_eq!(decoded.retry_after_duration(), Some(Duration::from_secs(30)));
        assert_eq!(decoded.job_id(), None);
    }

    #[test]
    fn oversized_or_invalid_retry_hints_never_panic() {
        let mut failure = FailureEnvelope::new("oom", "{}");
        failure.retry_after = Some(1e30);
        assert_eq!(failure.retry_after_duration(), Some(Duration::MAX));
        failure.retry_after = Some(f64::INFINITY);
        assert_eq!(failure.retry_after_duration(), None);
        failure.retry_after = Some(-1.0);
        assert_eq!(failure.retry_after_duration(), None);
    }
}
