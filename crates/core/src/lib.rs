//! `hopline-core`: job model building blocks.
//!
//! This crate contains the **pure** pipeline model (no IO): identifiers, the
//! job entity and its state machine, routes, and update/heartbeat types.

pub mod error;
pub mod id;
pub mod job;
pub mod route;
pub mod update;

pub use error::{DomainError, DomainResult};
pub use id::JobId;
pub use job::{Applied, Job, JobStatus, Liveness, Progress};
pub use route::{RetryAttempt, Route, RouteMetadata};
pub use update::{
    FinalStatus, FinalizeOutcome, Heartbeat, HeartbeatStatus, JobUpdate, ProgressPatch,
    ProgressUpdate, UpdateRequest,
};
