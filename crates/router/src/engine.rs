//! Routing engine: one stage hop per delivery.
//!
//! For each envelope the engine calls the compute endpoint once and decides
//! the next hop:
//!
//! - success on the last step: the result goes to the success terminal;
//! - success elsewhere: the cursor advances and the result goes to the next
//!   stage's queue;
//! - any failure (error response, transport error, timeout): a
//!   [`FailureEnvelope`] with the exact original body goes to the failure
//!   terminal.
//!
//! Malformed envelopes are never dropped: they reach the failure terminal
//! with code `routing_error`. Compute errors are never retried here, and the
//! retry counter is copied, never modified.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use hopline_core::{Heartbeat, HeartbeatStatus, JobId, Liveness};
use hopline_events::{Delivery, Envelope, FailureEnvelope, QueueNames, Severity};

use crate::compute::{codes, ComputeEndpoint, ComputeError, ComputeFailure, ComputeRequest};
use crate::handler::{Disposition, HandlerError, MessageHandler};
use crate::status::{LivenessCheck, StatusSink};

/// Per-call timeout when the stage does not configure one.
pub const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(300);

/// Pre-compute verdict on a delivery.
enum Gate {
    Proceed,
    Fail(ComputeFailure),
    Finished,
}

pub struct StageRouter<C> {
    stage: String,
    compute: C,
    queues: QueueNames,
    default_timeout: Duration,
    liveness: Option<Arc<dyn LivenessCheck>>,
    status: Option<Arc<dyn StatusSink>>,
}

impl<C: ComputeEndpoint> StageRouter<C> {
    pub fn new(stage: impl Into<String>, compute: C, queues: QueueNames) -> Self {
        Self {
            stage: stage.into(),
            compute,
            queues,
            default_timeout: DEFAULT_STAGE_TIMEOUT,
            liveness: None,
            status: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_liveness(mut self, liveness: Arc<dyn LivenessCheck>) -> Self {
        self.liveness = Some(liveness);
        self
    }

    /// Emit best-effort heartbeats around each compute call.
    pub fn with_status(mut self, status: Arc<dyn StatusSink>) -> Self {
        self.status = Some(status);
        self
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub fn input_queue(&self) -> String {
        self.queues.stage(&self.stage)
    }

    fn to_failure_queue(
        &self,
        delivery: &Delivery,
        retry_count: u32,
        failure: &ComputeFailure,
    ) -> Result<Disposition, HandlerError> {
        let wrapper = FailureEnvelope::new(failure.description(), delivery.body.clone())
            .with_code(failure.error.clone())
            .with_severity(failure.effective_severity())
            .with_retry_after(failure.effective_retry_after())
            .with_stage(self.stage.clone())
            .with_retry_count(retry_count);
        Ok(Disposition::forward(self.queues.failure(), wrapper.encode()?))
    }

    fn routing_error(&self, delivery: &Delivery, reason: String) -> Result<Disposition, HandlerError> {
        warn!(stage = %self.stage, id = %delivery.id, reason = %reason, "routing error");
        let failure = ComputeFailure::new(codes::ROUTING, reason).with_severity(Severity::Fatal);
        self.to_failure_queue(delivery, 0, &failure)
    }

    async fn heartbeat(&self, job_id: &JobId, heartbeat: Heartbeat) {
        let Some(status) = &self.status else { return };
        if let Err(e) = status.heartbeat(job_id, &heartbeat).await {
            debug!(stage = %self.stage, job_id = %job_id, error = %e, "heartbeat not delivered");
        }
    }

    async fn gate(&self, job_id: &JobId, envelope: &Envelope) -> Gate {
        if envelope.is_expired(Utc::now()) {
            return Gate::Fail(ComputeError::DeadlineExceeded.to_failure());
        }
        let Some(check) = &self.liveness else {
            return Gate::Proceed;
        };
        match check.liveness(job_id).await {
            Ok(Liveness::Live) => Gate::Proceed,
            Ok(Liveness::Cancelled) => Gate::Fail(ComputeFailure::new(codes::CANCELLED, "job cancelled")),
            Ok(Liveness::DeadlineExceeded) => Gate::Fail(ComputeError::DeadlineExceeded.to_failure()),
            Ok(Liveness::Finished) => Gate::Finished,
            Err(e) => {
                debug!(stage = %self.stage, job_id = %job_id, error = %e, "liveness unknown; proceeding");
                Gate::Proceed
            }
        }
    }
}

#[async_trait]
impl<C: ComputeEndpoint> MessageHandler for StageRouter<C> {
    fn name(&self) -> &str {
        &self.stage
    }

    async fn handle(&self, delivery: &Delivery) -> Result<Disposition, HandlerError> {
        let envelope = match Envelope::decode(&delivery.body) {
            Ok(envelope) => envelope,
            Err(e) => return self.routing_error(delivery, e.to_string()),
        };
        if let Err(e) = envelope.route.validate() {
            return self.routing_error(delivery, e.to_string());
        }
        let Some(job_id) = envelope.job_id() else {
            return self.routing_error(delivery, "envelope carries no job id".to_string());
        };
        let step = envelope.route.current_step().unwrap_or_default().to_string();
        if step != self.stage {
            warn!(stage = %self.stage, step = %step, job_id = %job_id, "envelope addressed to another stage; processing anyway");
        }
        let retry_count = envelope.route.metadata.retry_count();

        match self.gate(&job_id, &envelope).await {
            Gate::Proceed => {}
            Gate::Fail(failure) => {
                info!(stage = %self.stage, job_id = %job_id, code = %failure.error, "job no longer live; skipping compute");
                return self.to_failure_queue(delivery, retry_count, &failure);
            }
            Gate::Finished => {
                info!(stage = %self.stage, job_id = %job_id, "job already finished; dropping stale hop");
                return Ok(Disposition::Terminate);
            }
        }

        let index = u32::try_from(envelope.route.current).unwrap_or(u32::MAX);
        let total = u32::try_from(envelope.route.total_steps()).unwrap_or(u32::MAX);
        self.heartbeat(&job_id, Heartbeat::new(&self.stage, HeartbeatStatus::PickedUp).at_step(index, total))
            .await;

        let timeout = envelope
            .remaining(Utc::now())
            .map_or(self.default_timeout, |left| left.min(self.default_timeout));
        let request = ComputeRequest {
            payload: envelope.payload.clone(),
            route: Some(envelope.route.clone()),
        };
        let outcome = match tokio::time::timeout(timeout, self.compute.call(&request)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ComputeError::Timeout(timeout)),
        };

        match outcome {
            Ok(result) => {
                self.heartbeat(&job_id, Heartbeat::new(&self.stage, HeartbeatStatus::Completed).at_step(index, total))
                    .await;
                if envelope.route.is_last_step() {
                    debug!(stage = %self.stage, job_id = %job_id, "last step done; reporting success");
                    let body = envelope.complete(result).encode()?;
                    Ok(Disposition::forward(self.queues.success(), body))
                } else {
                    let next = envelope.forward(result)?;
                    let next_stage = next.route.current_step().unwrap_or_default();
                    debug!(stage = %self.stage, job_id = %job_id, next = %next_stage, "forwarding to next stage");
                    Ok(Disposition::forward(self.queues.stage(next_stage), next.encode()?))
                }
            }
            Err(err) => {
                let failure = err.to_failure();
                warn!(
                    stage = %self.stage,
                    job_id = %job_id,
                    code = %failure.error,
                    error = %failure.description(),
                    retry_count,
                    "compute call failed"
                );
                self.heartbeat(
                    &job_id,
                    Heartbeat::new(&self.stage, HeartbeatStatus::Error)
                        .at_step(index, total)
                        .with_message(failure.description()),
                )
                .await;
                self.to_failure_queue(delivery, retry_count, &failure)
            }
        }
    }
}
