//! Queue naming for stages and the fixed terminal queues.

use serde::{Deserialize, Serialize};

pub const DEFAULT_QUEUE_PREFIX: &str = "hopline";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueNames {
    prefix: String,
}

impl QueueNames {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Input queue of a stage.
    pub fn stage(&self, stage: &str) -> String {
        format!("{}.{}", self.prefix, stage)
    }

    pub fn success(&self) -> String {
        format!("{}.terminal.success", self.prefix)
    }

    pub fn failure(&self) -> String {
        format!("{}.terminal.failure", self.prefix)
    }
}

impl Default for QueueNames {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_PREFIX)
    }
}
