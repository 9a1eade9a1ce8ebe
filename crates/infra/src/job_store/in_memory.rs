//! In-memory job store.
//!
//! Each job lives behind its own mutex so read-apply-append is atomic per job
//! while distinct jobs never contend. The outer map lock is only held long
//! enough to look up or insert a record.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use chrono::Utc;

use hopline_core::{Applied, Job, JobId, JobStatus, JobUpdate, UpdateRequest};

use super::{ApplyOutcome, JobStats, JobStore, JobStoreError};

#[derive(Debug)]
struct JobRecord {
    job: Job,
    log: Vec<JobUpdate>,
}

type SharedRecord = Arc<Mutex<JobRecord>>;

/// Process-local job store (tests, single-process deployments).
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, SharedRecord>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, job_id: &JobId) -> Result<SharedRecord, JobStoreError> {
        let jobs = self.jobs.read().map_err(|_| poisoned())?;
        jobs.get(job_id)
            .cloned()
            .ok_or_else(|| JobStoreError::NotFound(job_id.clone()))
    }

    fn snapshot(&self) -> Result<Vec<Job>, JobStoreError> {
        let records: Vec<SharedRecord> = {
            let jobs = self.jobs.read().map_err(|_| poisoned())?;
            jobs.values().cloned().collect()
        };
        records
            .iter()
            .map(|record| {
                record
                    .lock()
                    .map(|guard| guard.job.clone())
                    .map_err(|_| poisoned())
            })
            .collect()
    }
}

fn poisoned() -> JobStoreError {
    JobStoreError::Storage("lock poisoned".to_string())
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, mut job: Job) -> Result<(Job, JobUpdate), JobStoreError> {
        let created = job.record_creation()?;
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        jobs.insert(
            job.id.clone(),
            Arc::new(Mutex::new(JobRecord {
                job: job.clone(),
                log: vec![created.clone()],
            })),
        );
        Ok((job, created))
    }

    async fn get(&self, job_id: &JobId) -> Result<Option<Job>, JobStoreError> {
        match self.record(job_id) {
            Ok(record) => {
                let guard = record.lock().map_err(|_| poisoned())?;
                Ok(Some(guard.job.clone()))
            }
            Err(JobStoreError::NotFound(_)) => Ok(None),
            Err(other) => Err(other),
        }
    }

    async fn apply_update(
        &self,
        job_id: &JobId,
        request: UpdateRequest,
    ) -> Result<ApplyOutcome, JobStoreError> {
        let record = self.record(job_id)?;
        let mut guard = record.lock().map_err(|_| poisoned())?;
        match guard.job.apply(&request, Utc::now())? {
            Applied::AlreadyTerminal => Ok(ApplyOutcome::AlreadyTerminal {
                job: guard.job.clone(),
            }),
            Applied::Appended(update) => {
                guard.log.push(update.clone());
                Ok(ApplyOutcome::Applied {
                    job: guard.job.clone(),
                    update,
                })
            }
        }
    }

    async fn updates(&self, job_id: &JobId) -> Result<Vec<JobUpdate>, JobStoreError> {
        let record = self.record(job_id)?;
        let guard = record.lock().map_err(|_| poisoned())?;
        Ok(guard.log.clone())
    }

    async fn request_cancel(&self, job_id: &JobId) -> Result<Job, JobStoreError> {
        let record = self.record(job_id)?;
        let mut guard = record.lock().map_err(|_| poisoned())?;
        guard.job.request_cancel(Utc::now());
        Ok(guard.job.clone())
    }

    async fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let mut jobs: Vec<Job> = self
            .snapshot()?
            .into_iter()
            .filter(|job| status.is_none_or(|wanted| job.status == wanted))
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let mut stats = JobStats::default();
        for job in self.snapshot()? {
            stats.add(job.status, 1);
        }
        Ok(stats)
    }
}
