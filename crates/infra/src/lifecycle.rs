//! Job lifecycle service: the single write path for job state.
//!
//! Wraps a [`JobStore`] and an [`UpdateBroadcaster`]. Writes to one job are
//! serialised by a per-job async mutex that also covers the broadcast, so live
//! subscribers observe entries in sequence order and only after they were
//! committed.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

use hopline_core::{
    FinalStatus, FinalizeOutcome, Heartbeat, Job, JobId, JobStatus, JobUpdate, Liveness,
    ProgressUpdate, UpdateRequest,
};
use hopline_events::{JobStream, UpdateBroadcaster};

use crate::job_store::{ApplyOutcome, JobStats, JobStore, JobStoreError};

pub struct JobLifecycle<S> {
    store: S,
    broadcaster: Arc<UpdateBroadcaster>,
    locks: Mutex<HashMap<JobId, Arc<AsyncMutex<()>>>>,
}

impl<S: JobStore> JobLifecycle<S> {
    pub fn new(store: S, broadcaster: Arc<UpdateBroadcaster>) -> Self {
        Self {
            store,
            broadcaster,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn broadcaster(&self) -> &Arc<UpdateBroadcaster> {
        &self.broadcaster
    }

    fn lock_for(&self, job_id: &JobId) -> Result<Arc<AsyncMutex<()>>, JobStoreError> {
        let mut locks = self.locks.lock().map_err(|_| poisoned())?;
        Ok(locks.entry(job_id.clone()).or_default().clone())
    }

    /// Drop the map entry once nobody else holds or waits on it.
    fn release(&self, job_id: &JobId, lock: &Arc<AsyncMutex<()>>) {
        if let Ok(mut locks) = self.locks.lock() {
            if Arc::strong_count(lock) <= 2 {
                locks.remove(job_id);
            }
        }
    }

    async fn serialized<T, F, Fut>(&self, job_id: &JobId, op: F) -> Result<T, JobStoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, JobStoreError>>,
    {
        let lock = self.lock_for(job_id)?;
        let result = {
            let _guard = lock.lock().await;
            op().await
        };
        self.release(job_id, &lock);
        result
    }

    fn broadcast(&self, update: &JobUpdate) {
        self.broadcaster.publish(update);
    }

    /// Persist a new job and broadcast its creation entry.
    pub async fn create(&self, job: Job) -> Result<Job, JobStoreError> {
        let job_id = job.id.clone();
        self.serialized(&job_id, || async move {
            let (job, created) = self.store.create(job).await?;
            self.broadcast(&created);
            info!(job_id = %job.id, status = %job.status, steps = job.route.total_steps(), "job created");
            Ok(job)
        })
        .await
    }

    pub async fn apply_update(
        &self,
        job_id: &JobId,
        request: UpdateRequest,
    ) -> Result<ApplyOutcome, JobStoreError> {
        self.serialized(job_id, || async move {
            let outcome = self.store.apply_update(job_id, request).await?;
            match &outcome {
                ApplyOutcome::Applied { update, .. } => {
                    self.broadcast(update);
                    if update.is_terminal() {
                        info!(job_id = %job_id, status = %update.status, "job reached terminal status");
                    }
                }
                ApplyOutcome::AlreadyTerminal { job } => {
                    debug!(job_id = %job_id, status = %job.status, "update for terminal job ignored");
                }
            }
            Ok(outcome)
        })
        .await
    }

    pub async fn apply_progress(
        &self,
        job_id: &JobId,
        progress: ProgressUpdate,
    ) -> Result<ApplyOutcome, JobStoreError> {
        self.apply_update(job_id, progress.into()).await
    }

    /// Terminal write from a terminal handler. A duplicate is a logged no-op.
    pub async fn finalize(
        &self,
        job_id: &JobId,
        status: FinalStatus,
    ) -> Result<FinalizeOutcome, JobStoreError> {
        match self.apply_update(job_id, status.into()).await? {
            ApplyOutcome::Applied { .. } => Ok(FinalizeOutcome::Applied),
            ApplyOutcome::AlreadyTerminal { job } => {
                info!(
                    job_id = %job_id,
                    status = %job.status,
                    "duplicate terminal status ignored"
                );
                Ok(FinalizeOutcome::AlreadyTerminal)
            }
        }
    }

    /// Record a stage heartbeat as a progress entry.
    pub async fn ingest_heartbeat(
        &self,
        job_id: &JobId,
        heartbeat: &Heartbeat,
    ) -> Result<ApplyOutcome, JobStoreError> {
        self.apply_progress(job_id, heartbeat.to_progress()).await
    }

    pub async fn request_cancel(&self, job_id: &JobId) -> Result<Job, JobStoreError> {
        self.serialized(job_id, || async move {
            let job = self.store.request_cancel(job_id).await?;
            info!(job_id = %job_id, cancel_requested = job.cancel_requested, "cancellation requested");
            Ok(job)
        })
        .await
    }

    pub async fn liveness(&self, job_id: &JobId) -> Result<Liveness, JobStoreError> {
        let job = self.require(job_id).await?;
        Ok(job.liveness(Utc::now()))
    }

    pub async fn get(&self, job_id: &JobId) -> Result<Option<Job>, JobStoreError> {
        self.store.get(job_id).await
    }

    pub async fn require(&self, job_id: &JobId) -> Result<Job, JobStoreError> {
        self.store
            .get(job_id)
            .await?
            .ok_or_else(|| JobStoreError::NotFound(job_id.clone()))
    }

    pub async fn updates(&self, job_id: &JobId) -> Result<Vec<JobUpdate>, JobStoreError> {
        self.store.updates(job_id).await
    }

    pub async fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        self.store.list(status, limit).await
    }

    pub async fn stats(&self) -> Result<JobStats, JobStoreError> {
        self.store.stats().await
    }

    /// Replay the stored log, then follow live updates until the terminal one.
    pub async fn stream(&self, job_id: &JobId) -> Result<JobStream, JobStoreError> {
        // Subscribe before reading history so nothing falls between the two.
        let live = self.broadcaster.subscribe(job_id);
        let history = self.store.updates(job_id).await?;
        Ok(JobStream::new(history, live))
    }
}

fn poisoned() -> JobStoreError {
    JobStoreError::Storage("lock poisoned".to_string())
}
