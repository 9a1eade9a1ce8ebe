use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use hopline_events::{QueueNames, Transport};
use hopline_infra::transport::{RedisStreamsConfig, RedisStreamsTransport};
use hopline_infra::{AuditStore, InMemoryAuditStore, PostgresAuditStore};
use hopline_router::compute::SocketComputeClient;
use hopline_router::config::{Role, RouterConfig};
use hopline_router::{
    ConsumerConfig, FailureRetrier, HttpStatusSink, MessageHandler, QueueConsumer, StageRouter,
    SuccessReporter,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hopline_observability::init();

    let config = RouterConfig::from_env().context("invalid router configuration")?;
    let queues = QueueNames::new(config.queue_prefix.clone());

    let consumer_name = config
        .consumer_name
        .clone()
        .unwrap_or_else(|| format!("router-{}", uuid::Uuid::now_v7()));
    let transport: Arc<dyn Transport> = Arc::new(
        RedisStreamsTransport::connect(RedisStreamsConfig::new(&config.redis_url, &consumer_name))
            .await
            .context("failed to connect to redis")?,
    );

    let status = match &config.status_url {
        Some(url) => Some(Arc::new(
            HttpStatusSink::new(url).context("invalid HOPLINE_STATUS_URL")?,
        )),
        None => None,
    };

    let (queue, handler): (String, Arc<dyn MessageHandler>) = match config.role {
        Role::Stage => {
            let stage = config
                .stage
                .clone()
                .context("stage settings missing for the stage role")?;
            let compute = SocketComputeClient::new(stage.endpoint.clone())
                .with_max_frame_bytes(stage.max_frame_bytes);
            let mut router =
                StageRouter::new(stage.name.clone(), compute, queues.clone()).with_timeout(stage.timeout);
            match &status {
                Some(sink) => {
                    router = router.with_liveness(sink.clone()).with_status(sink.clone());
                }
                None => warn!("HOPLINE_STATUS_URL not set; heartbeats and liveness checks disabled"),
            }
            let queue = router.input_queue();
            info!(stage = %stage.name, endpoint = %stage.endpoint, queue = %queue, "stage router configured");
            let handler: Arc<dyn MessageHandler> = Arc::new(router);
            (queue, handler)
        }
        Role::Success => {
            let sink = status.clone().context("HOPLINE_STATUS_URL is required")?;
            let handler: Arc<dyn MessageHandler> = Arc::new(SuccessReporter::new(sink));
            (queues.success(), handler)
        }
        Role::Failure => {
            let sink = status.clone().context("HOPLINE_STATUS_URL is required")?;
            let audit: Arc<dyn AuditStore> = match &config.database_url {
                Some(url) => {
                    let pool = PgPoolOptions::new()
                        .max_connections(5)
                        .connect(url)
                        .await
                        .context("failed to connect to postgres")?;
                    hopline_infra::migrate(&pool)
                        .await
                        .context("failed to run migrations")?;
                    Arc::new(PostgresAuditStore::new(pool))
                }
                None => {
                    warn!("DATABASE_URL not set; audit records are kept in memory only");
                    Arc::new(InMemoryAuditStore::new())
                }
            };
            let retrier = FailureRetrier::new(sink.clone(), audit, queues.clone())
                .with_liveness(sink)
                .with_policy(config.retry.clone());
            let policy = retrier.policy();
            info!(
                max_retries = policy.max_retries,
                base_delay_secs = policy.base_delay.as_secs_f64(),
                max_delay_secs = policy.max_delay.map(|d| d.as_secs_f64()),
                "failure retrier configured"
            );
            let handler: Arc<dyn MessageHandler> = Arc::new(retrier);
            (queues.failure(), handler)
        }
    };

    let consumer_config = ConsumerConfig::new(queue.clone()).with_concurrency(config.concurrency);
    let handle = QueueConsumer::new(transport, handler, consumer_config).spawn();
    info!(queue = %queue, consumer = %consumer_name, role = ?config.role, "router started");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!(queue = %queue, "shutting down");
    handle.shutdown().await;
    Ok(())
}
