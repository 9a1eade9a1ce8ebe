//! Request/response schema of the compute endpoint.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use hopline_core::Route;
use hopline_events::Severity;

/// Machine-readable error codes.
pub mod codes {
    pub const OOM: &str = "oom_error";
    pub const CUDA_OOM: &str = "cuda_oom_error";
    pub const PROCESSING: &str = "processing_error";
    pub const INVALID_JSON: &str = "invalid_json";
    pub const CONNECTION: &str = "connection_error";
    pub const TIMEOUT: &str = "timeout_error";
    pub const PROTOCOL: &str = "protocol_error";
    pub const DEADLINE_EXCEEDED: &str = "deadline_exceeded";
    pub const CANCELLED: &str = "cancelled";
    pub const ROUTING: &str = "routing_error";
}

/// Severity assumed when the endpoint does not send one.
pub fn default_severity(code: &str) -> Severity {
    match code {
        codes::OOM | codes::CUDA_OOM | codes::TIMEOUT => Severity::Recoverable,
        _ => Severity::Fatal,
    }
}

/// Retry hint (seconds) assumed when the endpoint does not send one.
pub fn suggested_retry_after(code: &str) -> Option<f64> {
    match code {
        codes::OOM => Some(30.0),
        codes::CUDA_OOM => Some(60.0),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeRequest {
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<Route>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ComputeResponse {
    Ok {
        #[serde(default)]
        result: Value,
    },
    Error(ComputeFailure),
}

/// Structured error returned by (or synthesized for) a compute call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeFailure {
    /// Machine code, see [`codes`].
    pub error: String,
    #[serde(default)]
    pub message: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    /// Seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<f64>,
}

impl ComputeFailure {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: code.into(),
            message: message.into(),
            error_type: None,
            severity: None,
            retry_after: None,
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    pub fn effective_severity(&self) -> Severity {
        self.severity
            .unwrap_or_else(|| default_severity(&self.error))
    }

    pub fn effective_retry_after(&self) -> Option<f64> {
        self.retry_after
            .or_else(|| suggested_retry_after(&self.error))
    }

    /// Human text, falling back to the code.
    pub fn description(&self) -> &str {
        if self.message.is_empty() {
            &self.error
        } else {
            &self.message
        }
    }
}
