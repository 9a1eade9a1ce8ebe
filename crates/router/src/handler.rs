//! Queue handler contract.

use std::time::Duration;

use async_trait::async_trait;

use hopline_events::{Delivery, EnvelopeError};
use hopline_infra::AuditError;

use crate::status::StatusError;

/// What to do with a delivery once its handler is done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Publish `body` to `queue` (after `delay`, if any), then ack.
    Forward {
        queue: String,
        body: String,
        delay: Option<Duration>,
    },
    /// Ack without publishing anything.
    Terminate,
}

impl Disposition {
    pub fn forward(queue: impl Into<String>, body: impl Into<String>) -> Self {
        Disposition::Forward {
            queue: queue.into(),
            body: body.into(),
            delay: None,
        }
    }

    pub fn forward_after(queue: impl Into<String>, body: impl Into<String>, delay: Duration) -> Self {
        Disposition::Forward {
            queue: queue.into(),
            body: body.into(),
            delay: Some(delay),
        }
    }
}

/// A handler failure: the delivery is released for redelivery, never acked.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error(transparent)]
    Status(#[from] StatusError),

    #[error(transparent)]
    Audit(#[from] AuditError),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    async fn handle(&self, delivery: &Delivery) -> Result<Disposition, HandlerError>;
}
