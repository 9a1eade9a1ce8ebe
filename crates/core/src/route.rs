//! Pipeline routes and their metadata extension map.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DomainError, DomainResult};
use crate::id::JobId;

/// Metadata key holding the fallback copy of the job id.
pub const JOB_ID_KEY: &str = "job_id";

/// Metadata key holding how many times the envelope has been retried.
pub const RETRY_COUNT_KEY: &str = "retry_count";

/// Metadata key holding the errors of earlier attempts.
pub const RETRY_HISTORY_KEY: &str = "retry_history";

/// Open, forward-compatible context attached to a route.
///
/// Unknown keys are preserved verbatim; well-known keys have typed accessors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RouteMetadata(BTreeMap<String, Value>);

impl RouteMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_raw(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Decode an entry into `T`. `Ok(None)` when the key is absent.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> DomainResult<Option<T>> {
        match self.0.get(key) {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| DomainError::metadata(format!("{key}: {e}"))),
        }
    }

    pub fn insert<T: Serialize>(&mut self, key: impl Into<String>, value: T) -> DomainResult<()> {
        let key = key.into();
        let value = serde_json::to_value(value)
            .map_err(|e| DomainError::metadata(format!("{key}: {e}")))?;
        self.0.insert(key, value);
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Fallback job id. Invalid values are treated as absent.
    pub fn job_id(&self) -> Option<JobId> {
        self.0
            .get(JOB_ID_KEY)
            .and_then(Value::as_str)
            .and_then(|s| JobId::parse(s).ok())
    }

    pub fn set_job_id(&mut self, job_id: &JobId) {
        self.0
            .insert(JOB_ID_KEY.to_string(), Value::String(job_id.to_string()));
    }

    /// Retry count carried by a requeued envelope (0 when absent or invalid).
    pub fn retry_count(&self) -> u32 {
        self.0
            .get(RETRY_COUNT_KEY)
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(0)
    }

    pub fn set_retry_count(&mut self, count: u32) {
        self.0
            .insert(RETRY_COUNT_KEY.to_string(), Value::from(count));
    }

    /// Earlier failed attempts, oldest first. Undecodable history reads as empty.
    pub fn retry_history(&self) -> Vec<RetryAttempt> {
        self.get(RETRY_HISTORY_KEY).ok().flatten().unwrap_or_default()
    }

    pub fn push_retry_attempt(&mut self, attempt: RetryAttempt) -> DomainResult<()> {
        let mut history = self.retry_history();
        history.push(attempt);
        self.insert(RETRY_HISTORY_KEY, history)
    }
}

/// One failed attempt recorded on a retried route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryAttempt {
    pub attempt: u32,
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    pub failed_at: DateTime<Utc>,
}

/// Ordered stage list plus traversal cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub steps: Vec<String>,
    #[serde(default)]
    pub current: usize,
    #[serde(default)]
    pub metadata: RouteMetadata,
}

impl Route {
    /// A route positioned at its first step.
    pub fn new<I, S>(steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            steps: steps.into_iter().map(Into::into).collect(),
            current: 0,
            metadata: RouteMetadata::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: RouteMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn total_steps(&self) -> usize {
        self.steps.len()
    }

    /// Stage the cursor points at, if it is in range.
    pub fn current_step(&self) -> Option<&str> {
        self.steps.get(self.current).map(String::as_str)
    }

    pub fn is_last_step(&self) -> bool {
        !self.steps.is_empty() && self.current + 1 == self.steps.len()
    }

    /// Check that the cursor addresses an existing step.
    pub fn validate(&self) -> DomainResult<()> {
        if self.steps.is_empty() {
            return Err(DomainError::invalid_route("route has no steps"));
        }
        if self.current >= self.steps.len() {
            return Err(DomainError::invalid_route(format!(
                "cursor {} out of range for {} steps",
                self.current,
                self.steps.len()
            )));
        }
        Ok(())
    }

    /// The same route moved one step forward.
    pub fn advanced(&self) -> DomainResult<Route> {
        self.validate()?;
        if self.is_last_step() {
            return Err(DomainError::invalid_route(
                "route is already at its last step",
            ));
        }
        let mut next = self.clone();
        next.current += 1;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn advancing_walks_steps_in_order() {
        let route = Route::new(["A", "B", "C"]);
        assert_eq!(route.current_step(), Some("A"));
        assert!(!route.is_last_step());

        let route = route.advanced().unwrap();
        assert_eq!(route.current_step(), Some("B"));

        let route = route.advanced().unwrap();
        assert_eq!(route.current_step(), Some("C"));
        assert!(route.is_last_step());
        assert!(route.advanced().is_err());
    }

    #[test]
    fn empty_and_out_of_range_routes_fail_validation() {
        let empty = Route::new(Vec::<String>::new());
        assert!(matches!(empty.validate(), Err(DomainError::InvalidRoute(_))));
        assert!(!empty.is_last_step());

        let mut overrun = Route::new(["A"]);
        overrun.current = 1;
        assert!(overrun.validate().is_err());
        assert_eq!(overrun.current_step(), None);
    }

    #[test]
    fn wire_shape_defaults_cursor_and_metadata() {
        let route: Route = serde_json::from_value(json!({"steps": ["parse", "infer"]})).unwrap();
        assert_eq!(route.current, 0);
        assert!(route.metadata.is_empty());

        let encoded = serde_json::to_value(&route).unwrap();
        assert_eq!(encoded, json!({"steps": ["parse", "infer"], "current": 0, "metadata": {}}));
    }

    #[test]
    fn metadata_preserves_unknown_keys_and_types_known_ones() {
        let mut metadata: RouteMetadata = serde_json::from_value(json!({
            "job_id": "j1",
            "tenant": {"name": "acme"},
        }))
        .unwrap();

        assert_eq!(metadata.job_id(), Some(JobId::parse("j1").unwrap()));
        assert_eq!(metadata.retry_count(), 0);

        metadata.set_retry_count(2);
        assert_eq!(metadata.retry_count(), 2);

        #[derive(Deserialize)]
        struct Tenant {
            name: String,
        }
        let tenant: Tenant = metadata.get("tenant").unwrap().unwrap();
        assert_eq!(tenant.name, "acme");
        assert!(metadata.get::<u32>("tenant").is_err());
        assert_eq!(metadata.len(), 3);
    }

    #[test]
    fn invalid_fallback_job_id_reads_as_absent() {
        let metadata: RouteMetadata = serde_json::from_value(json!({"job_id": 42})).unwrap();
        assert_eq!(metadata.job_id(), None);
    }

    #[test]
    fn retry_history_accumulates() {
        let mut metadata = RouteMetadata::new();
        for attempt in 0..2 {
            metadata
                .push_retry_attempt(RetryAttempt {
                    attempt,
                    error: format!("boom {attempt}"),
                    code: Some("processing_error".into()),
                    stage: Some("infer".into()),
                    failed_at: Utc::now(),
                })
                .unwrap();
        }
        let history = metadata.retry_history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].error, "boom 1");
    }
}
