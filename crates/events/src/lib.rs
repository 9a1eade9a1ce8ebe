//! `hopline-events`: what travels between pipeline components.
//!
//! - `envelope`: queue wire schema (envelopes, failure wrappers)
//! - `transport`: at-least-once queue contract + in-memory implementation
//! - `broadcast`: per-job live fan-out of update log entries

pub mod broadcast;
pub mod envelope;
pub mod in_memory_transport;
pub mod queues;
pub mod transport;

pub use broadcast::{JobStream, Subscription, UpdateBroadcaster, DEFAULT_SUBSCRIBER_BUFFER};
pub use envelope::{job_id_from_raw, Envelope, EnvelopeError, FailureEnvelope, Severity};
pub use in_memory_transport::InMemoryTransport;
pub use queues::QueueNames;
pub use transport::{Delivery, Transport, TransportError};
