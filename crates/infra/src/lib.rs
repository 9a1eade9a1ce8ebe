//! Infrastructure layer: job storage, lifecycle service, audit trail, brokers.

pub mod audit;
pub mod job_store;
pub mod lifecycle;
pub mod transport;

mod integration_tests;

pub use audit::{AuditError, AuditRecord, AuditStore, InMemoryAuditStore, PostgresAuditStore};
pub use job_store::{
    migrate, ApplyOutcome, InMemoryJobStore, JobStats, JobStore, JobStoreError, PostgresJobStore,
};
pub use lifecycle::JobLifecycle;
