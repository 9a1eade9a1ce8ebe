//! Terminal handlers: the last hop of every job.
//!
//! Both consume a fixed queue ([`QueueNames::success`] /
//! [`QueueNames::failure`]) and write the job's final status through a
//! [`StatusSink`]. Final-status writes are idempotent, so redeliveries are
//! harmless.
//!
//! [`QueueNames::success`]: hopline_events::QueueNames::success
//! [`QueueNames::failure`]: hopline_events::QueueNames::failure
//! [`StatusSink`]: crate::status::StatusSink

pub mod retry;
pub mod success;

pub use retry::{FailureRetrier, RetryPolicy};
pub use success::SuccessReporter;
