//! Failure terminal: bounded retry with exponential backoff, then Failed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error, info, warn};

use hopline_core::{FinalStatus, FinalizeOutcome, JobId, Liveness, RetryAttempt};
use hopline_events::{Delivery, Envelope, EnvelopeError, FailureEnvelope, QueueNames, Severity};
use hopline_infra::{AuditError, AuditRecord, AuditStore};

use crate::compute::codes;
use crate::handler::{Disposition, HandlerError, MessageHandler};
use crate::status::{LivenessCheck, StatusError, StatusSink};

/// Key collisions tolerated before an audit write gives up.
const MAX_AUDIT_KEY_BUMPS: u32 = 16;

/// Upper bound on any backoff, whatever the policy or hint says.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Option<Duration>,
    /// Stretch the backoff up to the endpoint's `retry_after` hint.
    pub honor_retry_after: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(5),
            max_delay: None,
            honor_retry_after: true,
        }
    }
}

impl RetryPolicy {
    /// `max(base · 2^retry_count, hint)`, capped by `max_delay` and
    /// [`MAX_RETRY_DELAY`].
    pub fn delay_for(&self, retry_count: u32, hint: Option<Duration>) -> Duration {
        let factor = 1u32.checked_shl(retry_count).unwrap_or(u32::MAX);
        let mut delay = self.base_delay.saturating_mul(factor);
        if self.honor_retry_after {
            if let Some(hint) = hint {
                delay = delay.max(hint);
            }
        }
        let cap = self.max_delay.unwrap_or(MAX_RETRY_DELAY).min(MAX_RETRY_DELAY);
        delay.min(cap)
    }
}

/// Retries failed hops of a job, or marks it Failed.
pub struct FailureRetrier {
    status: Arc<dyn StatusSink>,
    liveness: Option<Arc<dyn LivenessCheck>>,
    audit: Arc<dyn AuditStore>,
    queues: QueueNames,
    policy: RetryPolicy,
}

/// What the retrier does with one failure.
#[derive(Debug)]
enum Verdict {
    Retry(Envelope),
    GiveUp(String),
    /// The job is already terminal: audit only.
    Finished,
}

impl FailureRetrier {
    pub fn new(status: Arc<dyn StatusSink>, audit: Arc<dyn AuditStore>, queues: QueueNames) -> Self {
        Self {
            status,
            liveness: None,
            audit,
            queues,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_liveness(mut self, liveness: Arc<dyn LivenessCheck>) -> Self {
        self.liveness = Some(liveness);
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    async fn verdict(&self, job_id: &JobId, failure: &FailureEnvelope) -> Result<Verdict, HandlerError> {
        let original = match failure.original() {
            Ok(original) => original,
            Err(e) => return Ok(Verdict::GiveUp(format!("original envelope unreadable: {e}"))),
        };
        if original.route.validate().is_err() {
            return Ok(Verdict::GiveUp("original envelope has no current stage".into()));
        }
        if original.is_expired(Utc::now()) {
            return Ok(Verdict::GiveUp("deadline exceeded".into()));
        }
        if let Some(check) = &self.liveness {
            match check.liveness(job_id).await {
                Ok(Liveness::Live) => {}
                Ok(Liveness::Cancelled) => return Ok(Verdict::GiveUp("job cancelled".into())),
                Ok(Liveness::DeadlineExceeded) => return Ok(Verdict::GiveUp("deadline exceeded".into())),
                Ok(Liveness::Finished) => return Ok(Verdict::Finished),
                Err(StatusError::UnknownJob(_)) => return Ok(Verdict::GiveUp("unknown job".into())),
                Err(StatusError::Rejected(reason)) => {
                    debug!(job_id = %job_id, reason = %reason, "liveness rejected; assuming live");
                }
                Err(e @ StatusError::Unavailable(_)) => return Err(e.into()),
            }
        }
        if failure.retry_count() >= self.policy.max_retries {
            return Ok(Verdict::GiveUp(format!(
                "retry budget of {} exhausted",
                self.policy.max_retries
            )));
        }
        Ok(Verdict::Retry(original))
    }

    /// Write once, moving the timestamp past colliding keys.
    async fn write_audit(&self, mut record: AuditRecord) -> Result<String, AuditError> {
        let mut bumps = 0;
        loop {
            match self.audit.record(&record).await {
                Err(AuditError::AlreadyExists(key)) if bumps < MAX_AUDIT_KEY_BUMPS => {
                    debug!(key = %key, "audit key taken; bumping timestamp");
                    record.bump();
                    bumps += 1;
                }
                other => return other,
            }
        }
    }

    fn audit_record(&self, job_id: &JobId, failure: &FailureEnvelope, final_attempt: bool) -> AuditRecord {
        let retry_history = failure
            .original()
            .map(|original| original.route.metadata.retry_history())
            .unwrap_or_default();
        AuditRecord {
            code: failure.code.clone(),
            severity: failure.severity,
            stage: failure.stage.clone(),
            retry_count: failure.retry_count(),
            max_retries: self.policy.max_retries,
            final_attempt,
            retry_history,
            ..AuditRecord::new(job_id.clone(), failure.error.clone(), failure.original_message.clone())
        }
    }

    fn requeue(&self, failure: &FailureEnvelope, mut original: Envelope) -> Result<Disposition, HandlerError> {
        let retry_count = failure.retry_count();
        original.route.metadata.push_retry_attempt(RetryAttempt {
            attempt: retry_count + 1,
            error: failure.error.clone(),
            code: failure.code.clone(),
            stage: failure.stage.clone(),
            failed_at: failure.failed_at.unwrap_or_else(Utc::now),
        })
            .map_err(EnvelopeError::from)?;
        original.route.metadata.set_retry_count(retry_count + 1);

        let stage = original.route.current_step().unwrap_or_default();
        let queue = self.queues.stage(stage);
        let delay = self.policy.delay_for(retry_count, failure.retry_after_duration());
        Ok(Disposition::forward_after(queue, original.encode()?, delay))
    }

    async fn fail_job(&self, job_id: &JobId, error_text: &str) -> Result<Disposition, HandlerError> {
        let status = FinalStatus::Failed {
            error: error_text.to_string(),
        };
        match self.status.finalize(job_id, status).await {
            Ok(FinalizeOutcome::Applied) => {
                info!(job_id = %job_id, error = %error_text, "job failed");
            }
            Ok(FinalizeOutcome::AlreadyTerminal) => {
                info!(job_id = %job_id, "job already terminal; duplicate failure ignored");
            }
            Err(StatusError::UnknownJob(_)) => {
                warn!(job_id = %job_id, "failure for an unknown job; dropping");
            }
            Err(StatusError::Rejected(reason)) => {
                warn!(job_id = %job_id, reason = %reason, "failed status rejected; dropping");
            }
            Err(e @ StatusError::Unavailable(_)) => return Err(e.into()),
        }
        Ok(Disposition::Terminate)
    }
}

#[async_trait]
impl MessageHandler for FailureRetrier {
    fn name(&self) -> &str {
        "failure"
    }

    async fn handle(&self, delivery: &Delivery) -> Result<Disposition, HandlerError> {
        let failure = FailureEnvelope::decode(&delivery.body).unwrap_or_else(|_| {
            FailureEnvelope::new("message reached the failure queue without failure context", delivery.body.clone())
                .with_code(codes::ROUTING)
                .with_severity(Severity::Fatal)
        });
        let Some(job_id) = failure.job_id() else {
            error!(id = %delivery.id, error = %failure.error, "failure without a job id; dropping");
            return Ok(Disposition::Terminate);
        };

        match self.verdict(&job_id, &failure).await? {
            Verdict::Retry(original) => {
                let key = self.write_audit(self.audit_record(&job_id, &failure, false)).await?;
                let disposition = self.requeue(&failure, original)?;
                if let Disposition::Forward { queue, delay, .. } = &disposition {
                    info!(
                        job_id = %job_id,
                        queue = %queue,
                        retry_count = failure.retry_count() + 1,
                        delay_secs = delay.map_or(0.0, |d| d.as_secs_f64()),
                        audit_key = %key,
                        "retrying failed hop"
                    );
                }
                Ok(disposition)
            }
            Verdict::GiveUp(reason) => {
                let key = self.write_audit(self.audit_record(&job_id, &failure, true)).await?;
                debug!(job_id = %job_id, reason = %reason, audit_key = %key, "not retrying");
                self.fail_job(&job_id, &failure.error).await
            }
            Verdict::Finished => {
                let key = self.write_audit(self.audit_record(&job_id, &failure, true)).await?;
                info!(job_id = %job_id, audit_key = %key, "failure for a finished job; audited only");
                Ok(Disposition::Terminate)
            }
        }
    }
}
