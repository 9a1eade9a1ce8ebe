//! Queue transport abstraction (mechanics only).
//!
//! A transport moves opaque message bodies between named queues with
//! **at-least-once** delivery:
//!
//! - A received message stays owned by the receiver until it is acked.
//! - A message that is never acked (crash, released, lost connection) is
//!   delivered again, possibly to another consumer.
//! - Consumers must therefore tolerate duplicates.
//!
//! Delayed publication is part of the contract so retries can be scheduled
//! by the broker instead of by a sleeping consumer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

/// A message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub queue: String,
    /// Transport-assigned id, used to ack or release.
    pub id: String,
    pub body: String,
    /// How many times this message has been handed out (1 on first delivery).
    pub delivery_count: u32,
}

impl Delivery {
    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Broker unreachable or connection dropped; worth retrying.
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    /// The broker rejected a command.
    #[error("transport command failed: {0}")]
    Command(String),

    /// The transport has been shut down.
    #[error("transport closed")]
    Closed,
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransportError::Closed)
    }
}

/// At-least-once queue transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Durably enqueue `body`. Returns once the broker confirmed the write.
    async fn publish(&self, queue: &str, body: &str) -> Result<(), TransportError>;

    /// Enqueue `body` so it becomes visible after `delay`.
    async fn publish_delayed(
        &self,
        queue: &str,
        body: &str,
        delay: Duration,
    ) -> Result<(), TransportError>;

    /// Receive up to `max` messages, waiting at most `wait` for the first one.
    async fn receive(
        &self,
        queue: &str,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<Delivery>, TransportError>;

    /// Settle a delivery; it will not be handed out again.
    async fn ack(&self, delivery: &Delivery) -> Result<(), TransportError>;

    /// Give a delivery back for redelivery.
    async fn release(&self, delivery: &Delivery) -> Result<(), TransportError>;
}

#[async_trait]
impl<T> Transport for Arc<T>
where
    T: Transport + ?Sized,
{
    async fn publish(&self, queue: &str, body: &str) -> Result<(), TransportError> {
        (**self).publish(queue, body).await
    }

    async fn publish_delayed(
        &self,
        queue: &str,
        body: &str,
        delay: Duration,
    ) -> Result<(), TransportError> {
        (**self).publish_delayed(queue, body, delay).await
    }

    async fn receive(
        &self,
        queue: &str,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<Delivery>, TransportError> {
        (**self).receive(queue, max, wait).await
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), TransportError> {
        (**self).ack(delivery).await
    }

    async fn release(&self, delivery: &Delivery) -> Result<(), TransportError> {
        (**self).release(delivery).await
    }
}
