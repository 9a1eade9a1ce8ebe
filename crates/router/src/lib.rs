//! `hopline-router`: stage routers and terminal handlers.
//!
//! Every pipeline process is a [`consumer::QueueConsumer`] running one
//! [`handler::MessageHandler`]:
//!
//! - [`engine::StageRouter`] for a stage queue (one compute call per hop);
//! - [`terminal::SuccessReporter`] for the success terminal;
//! - [`terminal::FailureRetrier`] for the failure terminal.

pub mod compute;
pub mod config;
pub mod consumer;
pub mod engine;
pub mod handler;
pub mod status;
pub mod terminal;

pub use consumer::{ConsumerConfig, ConsumerHandle, ConsumerStats, QueueConsumer};
pub use engine::StageRouter;
pub use handler::{Disposition, HandlerError, MessageHandler};
pub use status::{HttpStatusSink, LivenessCheck, StatusError, StatusSink};
pub use terminal::{FailureRetrier, RetryPolicy, SuccessReporter};
