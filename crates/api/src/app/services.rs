//! Infrastructure wiring behind the HTTP routes.

use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use hopline_core::Job;
use hopline_events::{Envelope, QueueNames, Transport, TransportError, UpdateBroadcaster};
use hopline_infra::transport::{RedisStreamsConfig, RedisStreamsTransport};
use hopline_infra::{InMemoryJobStore, JobLifecycle, JobStore, PostgresJobStore};

use crate::config::ApiConfig;

/// Job lifecycle over whichever store the process was configured with.
pub type Lifecycle = JobLifecycle<Arc<dyn JobStore>>;

/// Everything a request handler may touch.
pub struct AppServices {
    lifecycle: Arc<Lifecycle>,
    /// Absent: jobs are recorded but nothing is enqueued.
    transport: Option<Arc<dyn Transport>>,
    queues: QueueNames,
}

impl AppServices {
    pub fn new(lifecycle: Arc<Lifecycle>, transport: Option<Arc<dyn Transport>>, queues: QueueNames) -> Self {
        Self {
            lifecycle,
            transport,
            queues,
        }
    }

    /// In-memory store, no transport.
    pub fn in_memory() -> Self {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let lifecycle = JobLifecycle::new(store, Arc::new(UpdateBroadcaster::default()));
        Self::new(Arc::new(lifecycle), None, QueueNames::default())
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    pub fn queues(&self) -> &QueueNames {
        &self.queues
    }

    /// Publish the first hop of a freshly created job.
    ///
    /// Returns the queue it went to, or `None` without a transport.
    pub async fn enqueue_first_hop(&self, job: &Job) -> Result<Option<String>, EnqueueError> {
        let Some(transport) = &self.transport else {
            return Ok(None);
        };
        let first = job
            .route
            .current_step()
            .ok_or_else(|| EnqueueError::Route(format!("job {} has no current step", job.id)))?;
        let queue = self.queues.stage(first);
        let body = Envelope::for_job(job)
            .encode()
            .map_err(|e| EnqueueError::Route(e.to_string()))?;
        transport.publish(&queue, &body).await?;
        info!(job_id = %job.id, queue = %queue, "first hop enqueued");
        Ok(Some(queue))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("cannot build first hop: {0}")]
    Route(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Wire services from configuration (Postgres/Redis when configured).
pub async fn build_services(config: &ApiConfig) -> anyhow::Result<AppServices> {
    let store: Arc<dyn JobStore> = match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(url)
                .await
                .context("failed to connect to postgres")?;
            hopline_infra::migrate(&pool)
                .await
                .context("failed to run migrations")?;
            info!("using postgres job store");
            Arc::new(PostgresJobStore::new(pool))
        }
        None => Arc::new(InMemoryJobStore::new()),
    };

    let transport: Option<Arc<dyn Transport>> = match &config.redis_url {
        Some(url) => {
            let consumer = format!("api-{}", uuid::Uuid::now_v7());
            let transport = RedisStreamsTransport::connect(RedisStreamsConfig::new(url, consumer))
                .await
                .context("failed to connect to redis")?;
            Some(Arc::new(transport))
        }
        None => None,
    };

    let broadcaster = Arc::new(UpdateBroadcaster::new(config.subscriber_buffer));
    let lifecycle = Arc::new(JobLifecycle::new(store, broadcaster));
    Ok(AppServices::new(
        lifecycle,
        transport,
        QueueNames::new(config.queue_prefix.clone()),
    ))
}
