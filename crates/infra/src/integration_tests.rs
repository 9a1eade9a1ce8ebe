//! Store contract tests shared by every backend.
//!
//! The in-memory backend always runs. The Postgres backend runs when
//! `DATABASE_URL` points at a reachable database (the schema is migrated
//! first; job ids are unique per run).

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use sqlx::postgres::PgPoolOptions;

    use hopline_core::{
        FinalStatus, FinalizeOutcome, Job, JobId, JobStatus, ProgressPatch, ProgressUpdate, Route,
        UpdateRequest,
    };
    use hopline_events::{UpdateBroadcaster, DEFAULT_SUBSCRIBER_BUFFER};

    use crate::audit::{AuditRecord, AuditStore, InMemoryAuditStore, PostgresAuditStore};
    use crate::job_store::{migrate, ApplyOutcome, InMemoryJobStore, JobStore, JobStoreError, PostgresJobStore};
    use crate::lifecycle::JobLifecycle;

    fn fresh_job() -> Job {
        Job::new(JobId::new(), Route::new(["parse", "infer"]), json!({"x": 1}))
    }

    async fn postgres_pool() -> Option<sqlx::PgPool> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(&url)
            .await
            .ok()?;
        migrate(&pool).await.ok()?;
        Some(pool)
    }

    async fn store_contract<S: JobStore>(store: S) {
        let (job, created) = store.create(fresh_job()).await.unwrap();
        assert_eq!(created.sequence, 1);
        assert!(matches!(
            store.create(job.clone()).await.unwrap_err(),
            JobStoreError::AlreadyExists(_)
        ));

        let progress = ProgressUpdate {
            progress: ProgressPatch {
                percent: Some(50),
                current_step: Some("parse".into()),
                ..ProgressPatch::default()
            },
            message: Some("halfway".into()),
        };
        let outcome = store.apply_progress(&job.id, progress).await.unwrap();
        assert_eq!(outcome.job().status, JobStatus::Running);

        let err = store
            .apply_update(&job.id, UpdateRequest::status(JobStatus::Pending))
            .await
            .unwrap_err();
        assert!(matches!(err, JobStoreError::InvalidTransition { .. }));

        let done: UpdateRequest = FinalStatus::Succeeded { result: json!({"y": 3}) }.into();
        let outcome = store.apply_update(&job.id, done.clone()).await.unwrap();
        assert!(matches!(outcome, ApplyOutcome::Applied { .. }));
        let again = store.apply_update(&job.id, done).await.unwrap();
        assert!(matches!(again, ApplyOutcome::AlreadyTerminal { .. }));

        let stored = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Succeeded);
        assert_eq!(stored.result, Some(json!({"y": 3})));
        assert_eq!(stored.progress.percent, 100);
        assert_eq!(stored.last_sequence, 3);

        let log = store.updates(&job.id).await.unwrap();
        let sequences: Vec<u64> = log.iter().map(|u| u.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        assert!(log.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        assert_eq!(log.last().map(|u| u.status), Some(JobStatus::Succeeded));

        let cancelled = store.request_cancel(&job.id).await.unwrap();
        assert!(!cancelled.cancel_requested, "terminal jobs are immutable");
    }

    async fn concurrent_finalize<S: JobStore + 'static>(store: S) {
        let lifecycle = Arc::new(JobLifecycle::new(
            store,
            Arc::new(UpdateBroadcaster::new(DEFAULT_SUBSCRIBER_BUFFER)),
        ));
        let job = lifecycle.create(fresh_job()).await.unwrap();

        let tasks: Vec<_> = (0..6)
            .map(|i| {
                let lifecycle = lifecycle.clone();
                let id = job.id.clone();
                tokio::spawn(async move {
                    lifecycle
                        .finalize(&id, FinalStatus::Failed { error: format!("attempt {i}") })
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut applied = 0;
        for task in tasks {
            if task.await.unwrap() == FinalizeOutcome::Applied {
                applied += 1;
            }
        }
        assert_eq!(applied, 1);
        let log = lifecycle.updates(&job.id).await.unwrap();
        assert_eq!(log.len(), 2);
    }

    async fn audit_contract<A: AuditStore>(audit: A) {
        let job_id = JobId::new();
        let mut first = AuditRecord::new(job_id.clone(), "bad input", "{}");
        first.retry_count = 0;
        first.max_retries = 3;
        let key = audit.record(&first).await.unwrap();
        assert!(key.starts_with(&format!("{job_id}/")));
        assert!(audit.record(&first).await.is_err());

        let mut last = first.clone();
        last.bump();
        last.retry_count = 3;
        last.final_attempt = true;
        audit.record(&last).await.unwrap();

        let records = audit.for_job(&job_id).await.unwrap();
        assert_eq!(records, vec![first, last]);
    }

    #[tokio::test]
    async fn in_memory_store_honours_the_contract() {
        store_contract(InMemoryJobStore::new()).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn in_memory_store_has_one_terminal_winner() {
        concurrent_finalize(InMemoryJobStore::new()).await;
    }

    #[tokio::test]
    async fn in_memory_audit_store_is_write_once() {
        audit_contract(InMemoryAuditStore::new()).await;
    }

    #[tokio::test]
    async fn postgres_store_honours_the_contract() {
        let Some(pool) = postgres_pool().await else {
            return;
        };
        store_contract(PostgresJobStore::new(pool)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn postgres_store_has_one_terminal_winner() {
        let Some(pool) = postgres_pool().await else {
            return;
        };
        concurrent_finalize(PostgresJobStore::new(pool)).await;
    }

    #[tokio::test]
    async fn postgres_audit_store_is_write_once() {
        let Some(pool) = postgres_pool().await else {
            return;
        };
        audit_contract(PostgresAuditStore::new(pool)).await;
    }
}
