//! Strongly-typed identifiers used across the pipeline.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Longest accepted job id, in bytes.
pub const MAX_JOB_ID_LEN: usize = 256;

/// Identifier of a job.
///
/// Job ids are opaque strings: callers may assign their own (`"j1"`,
/// an upstream request id, ...) or let the system mint a UUIDv7. The id is
/// also the namespace of audit keys (`{job_id}/{timestamp}`), so `/` and
/// control characters are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobId(String);

impl JobId {
    /// Create a new system-assigned identifier (UUIDv7, time-ordered).
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Validate and wrap a caller-assigned identifier.
    pub fn parse(value: impl Into<String>) -> Result<Self, DomainError> {
        let value = value.into();
        if value.is_empty() {
            return Err(DomainError::invalid_id("job id must not be empty"));
        }
        if value.len() > MAX_JOB_ID_LEN {
            return Err(DomainError::invalid_id(format!(
                "job id exceeds {MAX_JOB_ID_LEN} bytes"
            )));
        }
        if value.chars().any(|c| c == '/' || c.is_control()) {
            return Err(DomainError::invalid_id(format!(
                "job id contains a reserved character: {value:?}"
            )));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for JobId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for JobId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for JobId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<JobId> for String {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_assigned_ids_are_unique() {
        assert_ne!(JobId::new(), JobId::new());
    }

    #[test]
    fn caller_assigned_ids_round_trip_through_json() {
        let id = JobId::parse("j1").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"j1\"");
        let back: JobId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn rejects_empty_and_reserved_characters() {
        assert!(JobId::parse("").is_err());
        assert!(JobId::parse("a/b").is_err());
        assert!(JobId::parse("line\nbreak").is_err());
        assert!(JobId::parse("x".repeat(MAX_JOB_ID_LEN + 1)).is_err());
        assert!(serde_json::from_str::<JobId>("\"a/b\"").is_err());
    }
}
