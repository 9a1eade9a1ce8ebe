//! Redis Streams transport (durable, at-least-once delivery).
//!
//! ## Layout
//!
//! - **Queue**: one stream per queue name; entries carry `body` and
//!   `deliveries` (how often the body was handed out before it was re-added).
//! - **Consumer group**: one per stream (same group name for every queue);
//!   each router process is a named consumer inside it.
//! - **Delayed messages**: a sorted set `{queue}:delayed` scored by due time
//!   (ms since epoch). Due members are moved into the stream atomically by a
//!   Lua script on every receive.
//!
//! ## Delivery
//!
//! - `ack` removes the entry (`XACK` + `XDEL`).
//! - `release` re-adds the body as a new entry and acks the old one.
//! - After a restart the consumer walks its own pending list once, paging by
//!   entry id so nothing it already handed out is read again; entries pending
//!   on a dead consumer for longer than `claim_idle` are taken over with
//!   `XAUTOCLAIM`.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{RedisError, Script, Value};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use hopline_events::{Delivery, Transport, TransportError};

const BODY_FIELD: &str = "body";
const DELIVERIES_FIELD: &str = "deliveries";

const PROMOTE_DUE: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
for _, member in ipairs(due) do
  if redis.call('ZREM', KEYS[1], member) == 1 then
    local sep = string.find(member, ':', 1, true)
    redis.call('XADD', KEYS[2], '*', 'body', string.sub(member, sep + 1), 'deliveries', '0')
  end
end
return #due
"#;

#[derive(Debug, thiserror::Error)]
pub enum RedisTransportError {
    #[error("Redis connection error: {0}")]
    Connection(String),

    #[error("Redis command error: {0}")]
    Command(String),

    #[error("malformed stream entry: {0}")]
    Decode(String),
}

impl From<RedisTransportError> for TransportError {
    fn from(value: RedisTransportError) -> Self {
        match value {
            RedisTransportError::Connection(msg) => TransportError::Unavailable(msg),
            other => TransportError::Command(other.to_string()),
        }
    }
}

fn command_error(command: &str, err: RedisError) -> RedisTransportError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
        RedisTransportError::Connection(format!("{command} failed: {err}"))
    } else {
        RedisTransportError::Command(format!("{command} failed: {err}"))
    }
}

/// Progress through this consumer's own pending entries, per queue.
///
/// Pending entries survive a restart; they are handed out exactly once, in id
/// order, before any new entry is read.
#[derive(Debug, Default)]
struct PendingCursor {
    queues: HashMap<String, PendingPosition>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PendingPosition {
    After(String),
    Done,
}

impl PendingCursor {
    /// The id to read pending entries after, or `None` once the walk is over.
    fn start(&self, queue: &str) -> Option<String> {
        match self.queues.get(queue) {
            None => Some("0".to_string()),
            Some(PendingPosition::After(id)) => Some(id.clone()),
            Some(PendingPosition::Done) => None,
        }
    }

    /// Record the last id of a page; an empty page ends the walk.
    fn advance(&mut self, queue: &str, last_id: Option<&str>) {
        let position = match last_id {
            Some(id) => PendingPosition::After(id.to_string()),
            None => PendingPosition::Done,
        };
        self.queues.insert(queue.to_string(), position);
    }
}

/// One `XREADGROUP` reply: live deliveries plus the last entry id seen,
/// deleted entries included.
struct ReadBatch {
    deliveries: Vec<Delivery>,
    last_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RedisStreamsConfig {
    pub url: String,
    pub group: String,
    pub consumer: String,
    /// Pending entries idle this long are reclaimed from their consumer.
    pub claim_idle: Duration,
    /// Upper bound for a single blocking read.
    pub max_block: Duration,
}

impl RedisStreamsConfig {
    pub fn new(url: impl Into<String>, consumer: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            group: "hopline".to_string(),
            consumer: consumer.into(),
            claim_idle: Duration::from_secs(600),
            max_block: Duration::from_secs(5),
        }
    }
}

pub struct RedisStreamsTransport {
    client: redis::Client,
    writer: ConnectionManager,
    /// Blocking reads get their own connection so they never stall writes.
    reader: AsyncMutex<Option<MultiplexedConnection>>,
    config: RedisStreamsConfig,
    groups: Mutex<HashSet<String>>,
    pending: Mutex<PendingCursor>,
    promote: Script,
}

impl RedisStreamsTransport {
    pub async fn connect(config: RedisStreamsConfig) -> Result<Self, RedisTransportError> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| RedisTransportError::Connection(e.to_string()))?;
        let writer = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| RedisTransportError::Connection(e.to_string()))?;

        Ok(Self {
            client,
            writer,
            reader: AsyncMutex::new(None),
            config,
            groups: Mutex::new(HashSet::new()),
            pending: Mutex::new(PendingCursor::default()),
            promote: Script::new(PROMOTE_DUE),
        })
    }

    fn delayed_key(queue: &str) -> String {
        format!("{queue}:delayed")
    }

    async fn reader(&self) -> Result<MultiplexedConnection, RedisTransportError> {
        let mut slot = self.reader.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| RedisTransportError::Connection(e.to_string()))?;
        *slot = Some(conn.clone());
        Ok(conn)
    }

    async fn reset_reader(&self) {
        *self.reader.lock().await = None;
    }

    /// Create the queue's consumer group once per process (idempotent).
    async fn ensure_group(&self, queue: &str) -> Result<(), RedisTransportError> {
        let known = self
            .groups
            .lock()
            .map(|groups| groups.contains(queue))
            .unwrap_or(false);
        if known {
            return Ok(());
        }

        let mut conn = self.writer.clone();
        let created: Result<Value, RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(queue)
            .arg(&self.config.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match created {
            Ok(_) => {}
            Err(e) if e.code() == Some("BUSYGROUP") => {}
            Err(e) => return Err(command_error("XGROUP CREATE", e)),
        }

        if let Ok(mut groups) = self.groups.lock() {
            groups.insert(queue.to_string());
        }
        Ok(())
    }

    async fn promote_due(&self, queue: &str, max: usize) -> Result<(), RedisTransportError> {
        let mut conn = self.writer.clone();
        let moved: i64 = self
            .promote
            .key(Self::delayed_key(queue))
            .key(queue)
            .arg(Utc::now().timestamp_millis())
            .arg(max)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| command_error("promote delayed", e))?;
        if moved > 0 {
            debug!(queue = %queue, moved, "delayed messages promoted");
        }
        Ok(())
    }

    async fn read_group(
        &self,
        queue: &str,
        start: &str,
        max: usize,
        block: Option<Duration>,
    ) -> Result<ReadBatch, RedisTransportError> {
        let mut conn = self.reader().await?;
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.config.group)
            .arg(&self.config.consumer)
            .arg("COUNT")
            .arg(max);
        if let Some(block) = block {
            cmd.arg("BLOCK").arg(block.as_millis().max(1) as u64);
        }
        cmd.arg("STREAMS").arg(queue).arg(start);

        let reply: Value = match cmd.query_async(&mut conn).await {
            Ok(reply) => reply,
            Err(e) => {
                self.reset_reader().await;
                return Err(command_error("XREADGROUP", e));
            }
        };

        // Own pending entries were handed out before; fresh ones were not.
        let redelivered = start != ">";
        let mut deliveries = Vec::new();
        let mut last_id = None;
        for stream in bulk(reply) {
            let mut parts = bulk(stream).into_iter();
            let _name = parts.next();
            for entry in parts.next().map(bulk).unwrap_or_default() {
                if let Some(id) = entry_id(&entry) {
                    last_id = Some(id);
                }
                match parse_entry(queue, entry, redelivered) {
                    Ok(Some(delivery)) => deliveries.push(delivery),
                    Ok(None) => {}
                    Err(e) => warn!(queue = %queue, error = %e, "skipping malformed stream entry"),
                }
            }
        }
        Ok(ReadBatch { deliveries, last_id })
    }

    fn pending_start(&self, queue: &str) -> Result<Option<String>, RedisTransportError> {
        self.pending
            .lock()
            .map(|cursor| cursor.start(queue))
            .map_err(|_| RedisTransportError::Command("pending cursor poisoned".to_string()))
    }

    async fn drain_own_pending(
        &self,
        queue: &str,
        max: usize,
    ) -> Result<Vec<Delivery>, RedisTransportError> {
        while let Some(start) = self.pending_start(queue)? {
            let batch = self.read_group(queue, &start, max, None).await?;
            if let Ok(mut cursor) = self.pending.lock() {
                cursor.advance(queue, batch.last_id.as_deref());
            }
            if !batch.deliveries.is_empty() {
                warn!(queue = %queue, count = batch.deliveries.len(), "re-delivering own pending entries");
                return Ok(batch.deliveries);
            }
        }
        Ok(Vec::new())
    }

    async fn reclaim_idle(
        &self,
        queue: &str,
        max: usize,
    ) -> Result<Vec<Delivery>, RedisTransportError> {
        let mut conn = self.writer.clone();
        let reply: Value = redis::cmd("XAUTOCLAIM")
            .arg(queue)
            .arg(&self.config.group)
            .arg(&self.config.consumer)
            .arg(self.config.claim_idle.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(max)
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("XAUTOCLAIM", e))?;

        let mut parts = bulk(reply).into_iter();
        let _cursor = parts.next();
        let mut claimed = Vec::new();
        for entry in parts.next().map(bulk).unwrap_or_default() {
            if let Ok(Some(delivery)) = parse_entry(queue, entry, true) {
                claimed.push(delivery);
            }
        }
        if !claimed.is_empty() {
            warn!(queue = %queue, count = claimed.len(), "reclaimed idle pending entries");
        }
        Ok(claimed)
    }

    async fn add(&self, queue: &str, body: &str, deliveries: u32) -> Result<(), RedisTransportError> {
        let mut conn = self.writer.clone();
        let _: String = redis::cmd("XADD")
            .arg(queue)
            .arg("*")
            .arg(BODY_FIELD)
            .arg(body)
            .arg(DELIVERIES_FIELD)
            .arg(deliveries)
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("XADD", e))?;
        Ok(())
    }

    async fn settle(&self, delivery: &Delivery) -> Result<(), RedisTransportError> {
        let mut conn = self.writer.clone();
        let _: Value = redis::pipe()
            .atomic()
            .cmd("XACK")
            .arg(&delivery.queue)
            .arg(&self.config.group)
            .arg(&delivery.id)
            .cmd("XDEL")
            .arg(&delivery.queue)
            .arg(&delivery.id)
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("XACK", e))?;
        Ok(())
    }
}

#[async_trait]
impl Transport for RedisStreamsTransport {
    #[instrument(skip(self, body), fields(queue = %queue), err)]
    async fn publish(&self, queue: &str, body: &str) -> Result<(), TransportError> {
        Ok(self.add(queue, body, 0).await?)
    }

    #[instrument(skip(self, body), fields(queue = %queue, delay_ms = delay.as_millis() as u64), err)]
    async fn publish_delayed(
        &self,
        queue: &str,
        body: &str,
        delay: Duration,
    ) -> Result<(), TransportError> {
        if delay.is_zero() {
            return self.publish(queue, body).await;
        }
        let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        let due = Utc::now().timestamp_millis().saturating_add(delay_ms);
        // The uuid prefix keeps identical bodies distinct inside the set.
        let member = format!("{}:{}", Uuid::now_v7(), body);
        let mut conn = self.writer.clone();
        let _: i64 = redis::cmd("ZADD")
            .arg(Self::delayed_key(queue))
            .arg(due)
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(|e| TransportError::from(command_error("ZADD", e)))?;
        Ok(())
    }

    async fn receive(
        &self,
        queue: &str,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<Delivery>, TransportError> {
        let max = max.max(1);
        self.ensure_group(queue).await?;
        self.promote_due(queue, max).await?;

        let pending = self.drain_own_pending(queue, max).await?;
        if !pending.is_empty() {
            return Ok(pending);
        }
        let claimed = self.reclaim_idle(queue, max).await?;
        if !claimed.is_empty() {
            return Ok(claimed);
        }

        let block = wait.min(self.config.max_block);
        let block = (!block.is_zero()).then_some(block);
        Ok(self.read_group(queue, ">", max, block).await?.deliveries)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), TransportError> {
        Ok(self.settle(delivery).await?)
    }

    async fn release(&self, delivery: &Delivery) -> Result<(), TransportError> {
        self.add(&delivery.queue, &delivery.body, delivery.delivery_count)
            .await?;
        Ok(self.settle(delivery).await?)
    }
}

fn bulk(value: Value) -> Vec<Value> {
    match value {
        Value::Bulk(items) => items,
        _ => Vec::new(),
    }
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::Data(data) => Some(String::from_utf8_lossy(data).into_owned()),
        Value::Status(s) => Some(s.clone()),
        _ => None,
    }
}

fn entry_id(entry: &Value) -> Option<String> {
    match entry {
        Value::Bulk(parts) => parts.first().and_then(text),
        _ => None,
    }
}

/// Entry format: `[id, [field, value, ...]]`. Deleted entries come back as nil.
fn parse_entry(
    queue: &str,
    entry: Value,
    redelivered: bool,
) -> Result<Option<Delivery>, RedisTransportError> {
    let parts = bulk(entry);
    if parts.len() < 2 {
        return Ok(None);
    }
    let id = text(&parts[0])
        .ok_or_else(|| RedisTransportError::Decode("entry id is not a string".to_string()))?;
    let Value::Bulk(fields) = &parts[1] else {
        return Ok(None);
    };

    let mut body = None;
    let mut deliveries = 0u32;
    for pair in fields.chunks(2) {
        let [key, value] = pair else { continue };
        match text(key).as_deref() {
            Some(BODY_FIELD) => body = text(value),
            Some(DELIVERIES_FIELD) => {
                deliveries = text(value).and_then(|v| v.parse().ok()).unwrap_or(0);
            }
            _ => {}
        }
    }
    let body = body.ok_or_else(|| RedisTransportError::Decode(format!("entry {id} has no body")))?;

    Ok(Some(Delivery {
        queue: queue.to_string(),
        id,
        body,
        delivery_count: deliveries + if redelivered { 2 } else { 1 },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(s: &str) -> Value {
        Value::Data(s.as_bytes().to_vec())
    }

    #[test]
    fn parses_a_stream_entry() {
        let entry = Value::Bulk(vec![
            data("1700000000000-0"),
            Value::Bulk(vec![data("body"), data("{\"x\":1}"), data("deliveries"), data("1")]),
        ]);

        let delivery = parse_entry("hopline.a", entry, false).unwrap().unwrap();
        assert_eq!(delivery.id, "1700000000000-0");
        assert_eq!(delivery.body, "{\"x\":1}");
        assert_eq!(delivery.delivery_count, 2);
    }

    #[test]
    fn deleted_entries_are_skipped() {
        let entry = Value::Bulk(vec![data("1-0"), Value::Nil]);
        assert!(parse_entry("q", entry, true).unwrap().is_none());
    }

    #[test]
    fn entries_without_a_body_are_rejected() {
        let entry = Value::Bulk(vec![data("1-0"), Value::Bulk(vec![data("other"), data("x")])]);
        assert!(matches!(
            parse_entry("q", entry, false),
            Err(RedisTransportError::Decode(_))
        ));
    }

    /// Pending entries after `start`, the way `XREADGROUP ... <id>` pages them.
    fn pending_page<'a>(pending: &'a [&'a str], start: &str, max: usize) -> Vec<&'a str> {
        let after = |id: &str| -> (u64, u64) {
            let (ms, seq) = id.split_once('-').unwrap_or((id, "0"));
            (ms.parse().unwrap(), seq.parse().unwrap())
        };
        pending
            .iter()
            .copied()
            .filter(|id| after(id) > after(start))
            .take(max)
            .collect()
    }

    #[test]
    fn restart_hands_out_each_pending_entry_once() {
        // Nothing is acked while the walk runs: handlers are still busy.
        let pending = ["1-0", "2-0", "3-0", "4-0", "5-0"];
        let mut cursor = PendingCursor::default();
        let mut handed_out = Vec::new();

        while let Some(start) = cursor.start("q") {
            let page = pending_page(&pending, &start, 2);
            cursor.advance("q", page.last().copied());
            handed_out.extend(page);
        }

        assert_eq!(handed_out, pending.to_vec());
        assert_eq!(cursor.start("q"), None);
    }

    #[test]
    fn pending_cursor_tracks_queues_independently() {
        let mut cursor = PendingCursor::default();
        assert_eq!(cursor.start("a").as_deref(), Some("0"));

        cursor.advance("a", Some("7-1"));
        assert_eq!(cursor.start("a").as_deref(), Some("7-1"));
        assert_eq!(cursor.start("b").as_deref(), Some("0"));

        cursor.advance("a", None);
        assert_eq!(cursor.start("a"), None);
        assert_eq!(cursor.start("b").as_deref(), Some("0"));
    }

    #[test]
    fn entry_ids_are_read_from_deleted_entries_too() {
        let deleted = Value::Bulk(vec![data("9-0"), Value::Nil]);
        assert_eq!(entry_id(&deleted).as_deref(), Some("9-0"));
        assert_eq!(entry_id(&Value::Nil), None);
    }

    #[tokio::test]
    async fn round_trip_against_a_live_server() {
        let Ok(url) = std::env::var("REDIS_URL") else {
            return;
        };
        let queue = format!("hopline-test.{}", Uuid::now_v7());
        let transport = RedisStreamsTransport::connect(RedisStreamsConfig::new(url, "test-consumer"))
            .await
            .unwrap();

        transport.publish(&queue, "one").await.unwrap();
        let got = transport
            .receive(&queue, 10, Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].body, "one");

        transport.release(&got[0]).await.unwrap();
        let again = transport
            .receive(&queue, 10, Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(again[0].body, "one");
        assert!(again[0].is_redelivery());
        transport.ack(&again[0]).await.unwrap();

        transport
            .publish_delayed(&queue, "later", Duration::from_millis(50))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        let later = transport
            .receive(&queue, 10, Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(later[0].body, "later");
        transport.ack(&later[0]).await.unwrap();
    }

    #[tokio::test]
    async fn restarted_consumer_replays_unacked_entries_once() {
        let Ok(url) = std::env::var("REDIS_URL") else {
            return;
        };
        let queue = format!("hopline-test.{}", Uuid::now_v7());
        let consumer = format!("restart-{}", Uuid::now_v7());

        let first = RedisStreamsTransport::connect(RedisStreamsConfig::new(url.clone(), consumer.clone()))
            .await
            .unwrap();
        first.publish(&queue, "a").await.unwrap();
        first.publish(&queue, "b").await.unwrap();
        let taken = first.receive(&queue, 10, Duration::from_millis(200)).await.unwrap();
        assert_eq!(taken.len(), 2);
        drop(first);

        let restarted = RedisStreamsTransport::connect(RedisStreamsConfig::new(url, consumer))
            .await
            .unwrap();
        let replayed = restarted.receive(&queue, 1, Duration::ZERO).await.unwrap();
        let replayed_more = restarted.receive(&queue, 1, Duration::ZERO).await.unwrap();
        let after = restarted.receive(&queue, 10, Duration::ZERO).await.unwrap();

        let bodies: Vec<_> = replayed.iter().chain(&replayed_more).map(|d| d.body.as_str()).collect();
        assert_eq!(bodies, vec!["a", "b"]);
        assert!(replayed.iter().all(Delivery::is_redelivery));
        assert!(after.is_empty());
    }
}
