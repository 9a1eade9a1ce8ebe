//! In-memory queue transport for tests/dev.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::transport::{Delivery, Transport, TransportError};

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Delivery>,
    in_flight: HashMap<String, Delivery>,
    delayed: Vec<(Instant, Delivery)>,
}

/// Due time for delays too large to add to the clock.
fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86400 * 365 * 30)
}

impl QueueState {
    fn promote_due(&mut self, now: Instant) {
        let mut i = 0;
        while i < self.delayed.len() {
            if self.delayed[i].0 <= now {
                let (_, delivery) = self.delayed.swap_remove(i);
                self.ready.push_back(delivery);
            } else {
                i += 1;
            }
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.delayed.iter().map(|(due, _)| *due).min()
    }
}

/// In-memory at-least-once transport.
///
/// - Unacked deliveries can be pushed back with [`InMemoryTransport::requeue_in_flight`]
///   to simulate a consumer crash.
/// - Delayed messages become visible on the tokio clock, so paused-time tests
///   observe exact backoff delays.
/// - [`InMemoryTransport::fail_next_publishes`] simulates a broker outage.
#[derive(Debug, Default)]
pub struct InMemoryTransport {
    queues: Mutex<HashMap<String, QueueState>>,
    notify: Notify,
    next_id: AtomicU64,
    failing_publishes: AtomicU32,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, QueueState>>, TransportError> {
        self.queues
            .lock()
            .map_err(|_| TransportError::Unavailable("lock poisoned".to_string()))
    }

    fn new_delivery(&self, queue: &str, body: &str) -> Delivery {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        Delivery {
            queue: queue.to_string(),
            id: id.to_string(),
            body: body.to_string(),
            delivery_count: 0,
        }
    }

    fn check_outage(&self) -> Result<(), TransportError> {
        let failed = self
            .failing_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match failed {
            Ok(_) => Err(TransportError::Unavailable(
                "simulated broker outage".to_string(),
            )),
            Err(_) => Ok(()),
        }
    }

    /// Make the next `n` publish calls fail with [`TransportError::Unavailable`].
    pub fn fail_next_publishes(&self, n: u32) {
        self.failing_publishes.store(n, Ordering::SeqCst);
    }

    /// Return every unacked delivery of `queue` to the ready list.
    pub fn requeue_in_flight(&self, queue: &str) -> usize {
        let Ok(mut queues) = self.lock() else {
            return 0;
        };
        let Some(state) = queues.get_mut(queue) else {
            return 0;
        };
        let mut moved: Vec<Delivery> = state.in_flight.drain().map(|(_, d)| d).collect();
        moved.sort_by_key(|d| d.id.parse::<u64>().unwrap_or(u64::MAX));
        let count = moved.len();
        for delivery in moved.into_iter().rev() {
            state.ready.push_front(delivery);
        }
        drop(queues);
        self.notify.notify_waiters();
        count
    }

    /// Bodies waiting to be received, oldest first.
    pub fn peek(&self, queue: &str) -> Vec<String> {
        self.lock()
            .ok()
            .and_then(|queues| {
                queues
                    .get(queue)
                    .map(|state| state.ready.iter().map(|d| d.body.clone()).collect())
            })
            .unwrap_or_default()
    }

    pub fn ready_len(&self, queue: &str) -> usize {
        self.count(queue, |state| state.ready.len())
    }

    pub fn in_flight_len(&self, queue: &str) -> usize {
        self.count(queue, |state| state.in_flight.len())
    }

    pub fn delayed_len(&self, queue: &str) -> usize {
        self.count(queue, |state| state.delayed.len())
    }

    fn count(&self, queue: &str, f: impl Fn(&QueueState) -> usize) -> usize {
        self.lock()
            .ok()
            .and_then(|queues| queues.get(queue).map(&f))
            .unwrap_or(0)
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn publish(&self, queue: &str, body: &str) -> Result<(), TransportError> {
        self.check_outage()?;
        let delivery = self.new_delivery(queue, body);
        self.lock()?
            .entry(queue.to_string())
            .or_default()
            .ready
            .push_back(delivery);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn publish_delayed(
        &self,
        queue: &str,
        body: &str,
        delay: Duration,
    ) -> Result<(), TransportError> {
        if delay.is_zero() {
            return self.publish(queue, body).await;
        }
        self.check_outage()?;
        let delivery = self.new_delivery(queue, body);
        self.lock()?
            .entry(queue.to_string())
            .or_default()
            .delayed
            .push((Instant::now().checked_add(delay).unwrap_or_else(far_future), delivery));
        // Waiting receivers recompute their wake-up time.
        self.notify.notify_waiters();
        Ok(())
    }

    async fn receive(
        &self,
        queue: &str,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<Delivery>, TransportError> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_due = {
                let mut queues = self.lock()?;
                let state = queues.entry(queue.to_string()).or_default();
                state.promote_due(Instant::now());

                let mut batch = Vec::new();
                while batch.len() < max.max(1) {
                    let Some(mut delivery) = state.ready.pop_front() else {
                        break;
                    };
                    delivery.delivery_count += 1;
                    state.in_flight.insert(delivery.id.clone(), delivery.clone());
                    batch.push(delivery);
                }
                if !batch.is_empty() {
                    return Ok(batch);
                }
                state.next_due()
            };

            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            let wake_at = next_due.map_or(deadline, |due| due.min(deadline));
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), TransportError> {
        let mut queues = self.lock()?;
        let removed = queues
            .get_mut(&delivery.queue)
            .and_then(|state| state.in_flight.remove(&delivery.id));
        if removed.is_none() {
            debug!(queue = %delivery.queue, delivery_id = %delivery.id, "ack for unknown delivery ignored");
        }
        Ok(())
    }

    async fn release(&self, delivery: &Delivery) -> Result<(), TransportError> {
        {
            let mut queues = self.lock()?;
            let Some(state) = queues.get_mut(&delivery.queue) else {
                return Ok(());
            };
            if let Some(released) = state.in_flight.remove(&delivery.id) {
                state.ready.push_back(released);
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }
}
