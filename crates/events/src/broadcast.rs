//! Per-job fan-out of update log entries to live subscribers.
//!
//! ## Delivery model
//!
//! - Every subscriber owns a bounded channel. Publishing uses `try_send`, so a
//!   slow subscriber can never block the writer: when its buffer is full it is
//!   dropped and its stream ends.
//! - A terminal update closes every subscriber of that job.
//! - Replay is not the broadcaster's job: [`JobStream`] stitches the stored log
//!   (read *after* subscribing) in front of the live tail and skips sequences it
//!   has already yielded.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::Stream;
use tracing::{debug, warn};

use hopline_core::{JobId, JobUpdate};

/// Default per-subscriber buffer, in updates.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 64;

#[derive(Debug)]
struct Slot {
    id: u64,
    tx: mpsc::Sender<JobUpdate>,
}

#[derive(Debug, Default)]
struct Registry {
    subscribers: Mutex<HashMap<JobId, Vec<Slot>>>,
    next_id: AtomicU64,
}

impl Registry {
    fn remove(&self, job_id: &JobId, id: u64) {
        let Ok(mut subscribers) = self.subscribers.lock() else {
            return;
        };
        if let Some(slots) = subscribers.get_mut(job_id) {
            slots.retain(|slot| slot.id != id);
            if slots.is_empty() {
                subscribers.remove(job_id);
            }
        }
    }
}

/// Fan-out hub keyed by job id.
#[derive(Debug)]
pub struct UpdateBroadcaster {
    registry: Arc<Registry>,
    buffer: usize,
}

impl UpdateBroadcaster {
    pub fn new(buffer: usize) -> Self {
        Self {
            registry: Arc::new(Registry::default()),
            buffer: buffer.max(1),
        }
    }

    /// Attach a live subscriber to `job_id`.
    pub fn subscribe(&self, job_id: &JobId) -> Subscription {
        let (tx, rx) = mpsc::channel(self.buffer);
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);

        if let Ok(mut subscribers) = self.registry.subscribers.lock() {
            let slots = subscribers.entry(job_id.clone()).or_default();
            slots.retain(|slot| !slot.tx.is_closed());
            slots.push(Slot { id, tx });
        }

        Subscription {
            job_id: job_id.clone(),
            id,
            rx,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Deliver `update` to every subscriber of its job. Returns how many received it.
    pub fn publish(&self, update: &JobUpdate) -> usize {
        let Ok(mut subscribers) = self.registry.subscribers.lock() else {
            return 0;
        };
        let Some(slots) = subscribers.get_mut(&update.job_id) else {
            return 0;
        };

        let mut delivered = 0;
        slots.retain(|slot| match slot.tx.try_send(update.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!(
                    job_id = %update.job_id,
                    subscriber = slot.id,
                    "subscriber buffer full; disconnecting subscriber"
                );
                false
            }
            Err(TrySendError::Closed(_)) => false,
        });

        if update.is_terminal() || slots.is_empty() {
            // Dropping the senders ends every stream once it drains its buffer.
            subscribers.remove(&update.job_id);
        }
        debug!(job_id = %update.job_id, sequence = update.sequence, delivered, "update broadcast");
        delivered
    }

    pub fn subscriber_count(&self, job_id: &JobId) -> usize {
        self.registry
            .subscribers
            .lock()
            .map(|subscribers| {
                subscribers
                    .get(job_id)
                    .map(|slots| slots.iter().filter(|s| !s.tx.is_closed()).count())
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    }
}

impl Default for UpdateBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_BUFFER)
    }
}

/// Live tail of one job's updates. Detaches itself on drop.
#[derive(Debug)]
pub struct Subscription {
    job_id: JobId,
    id: u64,
    rx: mpsc::Receiver<JobUpdate>,
    registry: Weak<Registry>,
}

impl Subscription {
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.job_id, self.id);
        }
    }
}

/// Replay-then-tail stream of a job's updates, ending after the terminal one.
#[derive(Debug)]
pub struct JobStream {
    history: VecDeque<JobUpdate>,
    live: Option<Subscription>,
    last_sequence: u64,
    finished: bool,
}

impl JobStream {
    /// `history` must have been read after `live` was subscribed.
    pub fn new(mut history: Vec<JobUpdate>, live: Subscription) -> Self {
        history.sort_by_key(|u| u.sequence);
        Self {
            history: history.into(),
            live: Some(live),
            last_sequence: 0,
            finished: false,
        }
    }

    /// Next update, or `None` once the stream ended.
    pub async fn next_update(&mut self) -> Option<JobUpdate> {
        std::future::poll_fn(|cx| Pin::new(&mut *self).poll_next(cx)).await
    }

    fn emit(&mut self, update: JobUpdate) -> JobUpdate {
        self.last_sequence = self.last_sequence.max(update.sequence);
        if update.is_terminal() {
            self.finished = true;
            self.live = None;
        }
        update
    }
}

impl Stream for JobStream {
    type Item = JobUpdate;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<JobUpdate>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        while let Some(update) = this.history.pop_front() {
            if update.sequence > this.last_sequence {
                return Poll::Ready(Some(this.emit(update)));
            }
        }
        let Some(live) = this.live.as_mut() else {
            this.finished = true;
            return Poll::Ready(None);
        };
        loop {
            match live.rx.poll_recv(cx) {
                Poll::Ready(Some(update)) if update.sequence <= this.last_sequence => continue,
                Poll::Ready(Some(update)) => return Poll::Ready(Some(this.emit(update))),
                Poll::Ready(None) => {
                    this.finished = true;
                    this.live = None;
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use hopline_core::JobStatus;

    fn update(seq: u64, status: JobStatus) -> JobUpdate {
        JobUpdate {
            job_id: JobId::parse("j1").unwrap(),
            sequence: seq,
            status,
            message: None,
            progress: None,
            result: None,
            error: None,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn mid_stream_subscriber_gets_history_then_tail() {
        let hub = UpdateBroadcaster::default();
        let job = JobId::parse("j1").unwrap();

        let live = hub.subscribe(&job);
        let history = vec![update(1, JobStatus::Pending), update(2, JobStatus::Running)];
        let mut stream = JobStream::new(history, live);

        // Sequence 2 raced into both the history and the live tail.
        hub.publish(&update(2, JobStatus::Running));
        hub.publish(&update(3, JobStatus::Running));
        hub.publish(&update(4, JobStatus::Succeeded));

        let mut seen = Vec::new();
        while let Some(u) = stream.next_update().await {
            seen.push(u.sequence);
        }
        assert_eq!(seen, vec![1, 2, 3, 4]);
        assert_eq!(hub.subscriber_count(&job), 0);
    }

    #[tokio::test]
    async fn late_subscriber_replays_history_and_closes() {
        let hub = UpdateBroadcaster::default();
        let job = JobId::parse("j1").unwrap();
        let live = hub.subscribe(&job);
        let history = vec![
            update(1, JobStatus::Pending),
            update(2, JobStatus::Failed),
        ];
        let mut stream = JobStream::new(history, live);

        assert_eq!(stream.next_update().await.map(|u| u.sequence), Some(1));
        let last = stream.next_update().await.unwrap();
        assert!(last.is_terminal());
        assert!(stream.next_update().await.is_none());
        // The subscription was released when the stream finished.
        assert_eq!(hub.subscriber_count(&job), 0);
    }

    #[tokio::test]
    async fn slow_subscriber_is_dropped_without_blocking() {
        let hub = UpdateBroadcaster::new(2);
        let job = JobId::parse("j1").unwrap();
        let slow = hub.subscribe(&job);
        let mut fast = JobStream::new(Vec::new(), hub.subscribe(&job));

        assert_eq!(hub.publish(&update(1, JobStatus::Pending)), 2);
        assert_eq!(fast.next_update().await.map(|u| u.sequence), Some(1));
        assert_eq!(hub.publish(&update(2, JobStatus::Running)), 2);
        assert_eq!(fast.next_update().await.map(|u| u.sequence), Some(2));
        // `slow` never reads: its buffer of 2 is full now.
        assert_eq!(hub.publish(&update(3, JobStatus::Running)), 1);
        assert_eq!(hub.subscriber_count(&job), 1);

        let mut slow = JobStream::new(Vec::new(), slow);
        assert_eq!(slow.next_update().await.map(|u| u.sequence), Some(1));
        assert_eq!(slow.next_update().await.map(|u| u.sequence), Some(2));
        assert!(slow.next_update().await.is_none());
    }

    #[tokio::test]
    async fn terminal_update_closes_all_subscribers() {
        let hub = UpdateBroadcaster::default();
        let job = JobId::parse("j1").unwrap();
        let mut a = JobStream::new(Vec::new(), hub.subscribe(&job));
        let mut b = JobStream::new(Vec::new(), hub.subscribe(&job));

        hub.publish(&update(5, JobStatus::Succeeded));
        assert!(a.next_update().await.unwrap().is_terminal());
        assert!(b.next_update().await.unwrap().is_terminal());
        assert!(a.next_update().await.is_none());
        assert_eq!(hub.subscriber_count(&job), 0);
    }

    #[test]
    fn dropped_subscription_detaches() {
        let hub = UpdateBroadcaster::default();
        let job = JobId::parse("j1").unwrap();
        let sub = hub.subscribe(&job);
        assert_eq!(hub.subscriber_count(&job), 1);
        drop(sub);
        assert_eq!(hub.subscriber_count(&job), 0);
        assert_eq!(hub.publish(&update(1, JobStatus::Pending)), 0);
    }
}
