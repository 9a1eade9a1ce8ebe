use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{error, info, warn};

use hopline_core::{FinalStatus, FinalizeOutcome};
use hopline_events::{job_id_from_raw, Delivery};

use crate::handler::{Disposition, HandlerError, MessageHandler};
use crate::status::{StatusError, StatusSink};

/// Marks jobs Succeeded with the payload of the last stage.
pub struct SuccessReporter {
    status: Arc<dyn StatusSink>,
}

impl SuccessReporter {
    pub fn new(status: Arc<dyn StatusSink>) -> Self {
        Self { status }
    }
}

#[async_trait]
impl MessageHandler for SuccessReporter {
    fn name(&self) -> &str {
        "success"
    }

    async fn handle(&self, delivery: &Delivery) -> Result<Disposition, HandlerError> {
        // Read the body loosely: only the job id and the payload matter here.
        let Some(job_id) = job_id_from_raw(&delivery.body) else {
            error!(id = %delivery.id, "success message without a job id; dropping");
            return Ok(Disposition::Terminate);
        };
        let result = serde_json::from_str::<Value>(&delivery.body)
            .ok()
            .and_then(|mut raw| raw.get_mut("payload").map(Value::take))
            .unwrap_or(Value::Null);

        match self
            .status
            .finalize(&job_id, FinalStatus::Succeeded { result })
            .await
        {
            Ok(FinalizeOutcome::Applied) => {
                info!(job_id = %job_id, "job succeeded");
                Ok(Disposition::Terminate)
            }
            Ok(FinalizeOutcome::AlreadyTerminal) => {
                info!(job_id = %job_id, "job already terminal; duplicate success ignored");
                Ok(Disposition::Terminate)
            }
            Err(StatusError::UnknownJob(_)) => {
                warn!(job_id = %job_id, "success for an unknown job; dropping");
                Ok(Disposition::Terminate)
            }
            Err(StatusError::Rejected(reason)) => {
                warn!(job_id = %job_id, reason = %reason, "success status rejected; dropping");
                Ok(Disposition::Terminate)
            }
            Err(e @ StatusError::Unavailable(_)) => Err(e.into()),
        }
    }
}
