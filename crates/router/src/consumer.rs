//! Queue consumer runtime.
//!
//! Receives from one queue and runs a [`MessageHandler`] per delivery, up to
//! `concurrency` at a time. A delivery is acked only after its forward publish
//! was confirmed; a handler error releases it for redelivery. Transport errors
//! are retried indefinitely with capped exponential backoff.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use hopline_events::{Delivery, Transport, TransportError};

use crate::handler::{Disposition, MessageHandler};

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub queue: String,
    /// Maximum in-flight deliveries.
    pub concurrency: usize,
    /// Longest a single receive waits for messages.
    pub receive_wait: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// Pause before releasing a delivery whose handler failed.
    pub release_delay: Duration,
}

impl ConsumerConfig {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            concurrency: 4,
            receive_wait: Duration::from_secs(1),
            backoff_initial: Duration::from_millis(100),
            backoff_max: Duration::from_secs(30),
            release_delay: Duration::from_secs(1),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_receive_wait(mut self, wait: Duration) -> Self {
        self.receive_wait = wait;
        self
    }

    pub fn with_release_delay(mut self, delay: Duration) -> Self {
        self.release_delay = delay;
        self
    }
}

/// Capped exponential backoff, reset on success.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Consumer runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStats {
    pub received: u64,
    pub forwarded: u64,
    pub terminated: u64,
    pub handler_errors: u64,
    pub transport_errors: u64,
    pub in_flight: usize,
}

type SharedStats = Arc<Mutex<ConsumerStats>>;

fn record(stats: &SharedStats, update: impl FnOnce(&mut ConsumerStats)) {
    if let Ok(mut stats) = stats.lock() {
        update(&mut stats);
    }
}

/// Handle to control a running consumer.
#[derive(Debug)]
pub struct ConsumerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
    stats: SharedStats,
}

impl ConsumerHandle {
    /// Stop receiving and wait for in-flight deliveries to settle.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            error!(error = %e, "consumer task ended abnormally");
        }
    }

    pub fn stats(&self) -> ConsumerStats {
        self.stats
            .lock()
            .map(|stats| stats.clone())
            .unwrap_or_default()
    }
}

pub struct QueueConsumer<T: ?Sized, H: ?Sized> {
    transport: Arc<T>,
    handler: Arc<H>,
    config: ConsumerConfig,
}

impl<T, H> QueueConsumer<T, H>
where
    T: Transport + ?Sized + 'static,
    H: MessageHandler + ?Sized + 'static,
{
    pub fn new(transport: Arc<T>, handler: Arc<H>, config: ConsumerConfig) -> Self {
        Self {
            transport,
            handler,
            config,
        }
    }

    pub fn spawn(self) -> ConsumerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = SharedStats::default();
        let join = tokio::spawn(consume_loop(self, shutdown_rx, stats.clone()));
        ConsumerHandle {
            shutdown: shutdown_tx,
            join,
            stats,
        }
    }
}

async fn consume_loop<T, H>(
    consumer: QueueConsumer<T, H>,
    mut shutdown: watch::Receiver<bool>,
    stats: SharedStats,
) where
    T: Transport + ?Sized + 'static,
    H: MessageHandler + ?Sized + 'static,
{
    let QueueConsumer {
        transport,
        handler,
        config,
    } = consumer;
    let config = Arc::new(config);
    let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));
    let mut tasks = JoinSet::new();
    let mut backoff = Backoff::new(config.backoff_initial, config.backoff_max);

    info!(queue = %config.queue, handler = handler.name(), concurrency = config.concurrency, "consumer started");

    loop {
        if *shutdown.borrow() {
            break;
        }
        while let Some(joined) = tasks.try_join_next() {
            log_abnormal_exit(&config.queue, joined);
        }

        // Wait for one free slot, then take every other free one.
        let first = tokio::select! {
            permit = permits.clone().acquire_owned() => permit,
            _ = shutdown.changed() => break,
        };
        let Ok(first) = first else { break };
        let mut held = vec![first];
        while let Ok(permit) = permits.clone().try_acquire_owned() {
            held.push(permit);
        }

        let received = tokio::select! {
            received = transport.receive(&config.queue, held.len(), config.receive_wait) => received,
            _ = shutdown.changed() => break,
        };

        match received {
            Ok(deliveries) => {
                backoff.reset();
                if deliveries.is_empty() {
                    continue;
                }
                record(&stats, |s| s.received += deliveries.len() as u64);
                for delivery in deliveries {
                    let permit = match held.pop() {
                        Some(permit) => permit,
                        None => match permits.clone().acquire_owned().await {
                            Ok(permit) => permit,
                            Err(_) => break,
                        },
                    };
                    let transport = transport.clone();
                    let handler = handler.clone();
                    let config = config.clone();
                    let stats = stats.clone();
                    let slot = InFlight::enter(stats.clone(), permit);
                    tasks.spawn(async move {
                        process(transport.as_ref(), handler.as_ref(), &config, &stats, delivery).await;
                        drop(slot);
                    });
                }
            }
            Err(TransportError::Closed) => {
                warn!(queue = %config.queue, "transport closed; consumer stopping");
                break;
            }
            Err(e) => {
                record(&stats, |s| s.transport_errors += 1);
                let delay = backoff.next_delay();
                warn!(queue = %config.queue, error = %e, delay_ms = delay.as_millis() as u64, "receive failed; backing off");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }
    }

    let pending = tasks.len();
    if pending > 0 {
        info!(queue = %config.queue, pending, "waiting for in-flight deliveries");
    }
    while let Some(joined) = tasks.join_next().await {
        log_abnormal_exit(&config.queue, joined);
    }
    info!(queue = %config.queue, "consumer stopped");
}

/// Holds a concurrency permit; decrements `in_flight` on drop, unwinding included.
struct InFlight {
    stats: SharedStats,
    _permit: OwnedSemaphorePermit,
}

impl InFlight {
    fn enter(stats: SharedStats, permit: OwnedSemaphorePermit) -> Self {
        record(&stats, |s| s.in_flight += 1);
        Self {
            stats,
            _permit: permit,
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        record(&self.stats, |s| s.in_flight = s.in_flight.saturating_sub(1));
    }
}

fn log_abnormal_exit(queue: &str, joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        error!(queue = %queue, error = %e, "delivery task ended abnormally; left unacked");
    }
}

async fn process<T, H>(
    transport: &T,
    handler: &H,
    config: &ConsumerConfig,
    stats: &SharedStats,
    delivery: Delivery,
) where
    T: Transport + ?Sized,
    H: MessageHandler + ?Sized,
{
    if delivery.is_redelivery() {
        debug!(queue = %delivery.queue, id = %delivery.id, count = delivery.delivery_count, "processing redelivery");
    }

    match handler.handle(&delivery).await {
        Ok(Disposition::Forward { queue, body, delay }) => {
            let published = with_retry(config, stats, "publish", || async {
                match delay {
                    Some(delay) => transport.publish_delayed(&queue, &body, delay).await,
                    None => transport.publish(&queue, &body).await,
                }
            })
            .await;
            if published.is_err() {
                return;
            }
            debug!(from = %delivery.queue, to = %queue, delay_ms = delay.map(|d| d.as_millis() as u64), "forwarded");
            if with_retry(config, stats, "ack", || transport.ack(&delivery)).await.is_ok() {
                record(stats, |s| s.forwarded += 1);
            }
        }
        Ok(Disposition::Terminate) => {
            if with_retry(config, stats, "ack", || transport.ack(&delivery)).await.is_ok() {
                record(stats, |s| s.terminated += 1);
            }
        }
        Err(e) => {
            record(stats, |s| s.handler_errors += 1);
            warn!(
                queue = %delivery.queue,
                id = %delivery.id,
                handler = handler.name(),
                error = %e,
                "handler failed; releasing delivery"
            );
            tokio::time::sleep(config.release_delay).await;
            if let Err(e) = with_retry(config, stats, "release", || transport.release(&delivery)).await {
                warn!(
                    queue = %delivery.queue,
                    id = %delivery.id,
                    error = %e,
                    "release failed; delivery stays pending until reclaimed"
                );
            }
        }
    }
}

/// Retry a transport operation until it succeeds or the transport closes.
async fn with_retry<F, Fut>(
    config: &ConsumerConfig,
    stats: &SharedStats,
    operation: &str,
    mut op: F,
) -> Result<(), TransportError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), TransportError>>,
{
    let mut backoff = Backoff::new(config.backoff_initial, config.backoff_max);
    loop {
        match op().await {
            Ok(()) => return Ok(()),
            Err(e) if !e.is_retryable() => {
                error!(queue = %config.queue, operation, error = %e, "transport closed; giving up");
                return Err(e);
            }
            Err(e) => {
                record(stats, |s| s.transport_errors += 1);
                let delay = backoff.next_delay();
                warn!(queue = %config.queue, operation, error = %e, delay_ms = delay.as_millis() as u64, "transport error; retrying");
                tokio::time::sleep(delay).await;
            }
        }
    }
}
