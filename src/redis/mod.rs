//! Redis Streams transport (single version of `redis` via deadpool-redis)
//!
//! Peek-lock on a consumer group
//! -----------------------------
//! - A delivery is "locked" while its pending entry belongs to this consumer
//!   and has been idle for less than the lock duration.
//! - Expired locks are reclaimed with `XAUTOCLAIM`, which is the redelivery
//!   path and bumps the delivery counter.
//! - complete = `XACK`; abandon = reset idle past the lock so the entry is
//!   reclaimable at once; dead-letter = append to the DLQ stream, then `XACK`;
//!   renew = `XCLAIM` to self with `JUSTID`, which zeroes idle time.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use deadpool_redis::redis::{self, Value};
use deadpool_redis::{Config, Pool, Runtime};
use once_cell::sync::OnceCell;
use tracing::warn;

use crate::emit::dlq::{self, DeadLetterRecord};
use crate::errors::{ConsumerError, SettlementError};
use crate::ingest::{Delivery, Envelope, Settle, SettlementHandle, SettlementMode, Transport};
use crate::util::time::lock_expiry;

static REDIS_POOL: OnceCell<Pool> = OnceCell::new();

pub async fn init_redis_pool(redis_url: &str) -> Result<(), ConsumerError> {
    let cfg = Config::from_url(redis_url);
    let pool = cfg
        .create_pool(Some(Runtime::Tokio1))
        .map_err(|e| ConsumerError::Configuration(format!("redis pool: {e}")))?;
    REDIS_POOL
        .set(pool)
        .map_err(|_| ConsumerError::Configuration("redis pool already initialized".into()))?;
    Ok(())
}

pub fn pool() -> &'static Pool {
    REDIS_POOL.get().expect("pool not initialized")
}

/// One stream entry as read from `XREADGROUP` / `XAUTOCLAIM`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    /// `None` when the entry has no `payload` field.
    pub payload: Option<Bytes>,
}

/// Ownership and delivery counter of a pending entry (`XPENDING` detail).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: String,
    pub consumer: String,
    pub idle_ms: u64,
    pub delivery_count: u32,
}

#[derive(Clone)]
pub struct RedisStreamTransport {
    pool: Pool,
    stream: String,
    group: String,
    consumer: String,
    dead_letter_stream: String,
    lock: Duration,
    mode: SettlementMode,
    read_timeout_ms: usize,
}

impl RedisStreamTransport {
    pub fn new(pool: Pool, stream: &str, group: &str, consumer: &str, mode: SettlementMode) -> Self {
        Self {
            pool,
            stream: stream.to_string(),
            group: group.to_string(),
            consumer: consumer.to_string(),
            dead_letter_stream: format!("{stream}:dlq"),
            lock: Duration::from_secs(60),
            mode,
            read_timeout_ms: 5_000,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout_ms = timeout.as_millis() as usize;
        self
    }

    pub fn with_lock_duration(mut self, lock: Duration) -> Self {
        self.lock = lock;
        self
    }

    pub fn with_dead_letter_stream(mut self, stream: &str) -> Self {
        self.dead_letter_stream = stream.to_string();
        self
    }

    fn lock_ms(&self) -> u64 {
        self.lock.as_millis() as u64
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection, ConsumerError> {
        self.pool
            .get()
            .await
            .map_err(|e| ConsumerError::Transport(format!("redis pool: {e}")))
    }

    pub async fn ensure_stream_group(&self) -> Result<(), ConsumerError> {
        let mut conn = self.conn().await?;
        let r: Result<String, _> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream)
            .arg(&self.group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut *conn)
            .await;

        match r {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(ConsumerError::Transport(e.to_string())),
        }
    }

    pub async fn pop_batch(&self, count: usize) -> Result<Vec<StreamEntry>, ConsumerError> {
        let mut conn = self.conn().await?;

        // Ask for a typed Value to avoid cross-crate type mismatch
        let val: Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(count)
            .arg("BLOCK")
            .arg(self.read_timeout_ms)
            .arg("STREAMS")
            .arg(&self.stream)
            .arg(">")
            .query_async(&mut *conn)
            .await
            .map_err(|e| ConsumerError::Transport(e.to_string()))?;

        Ok(parse_stream_entries(val))
    }

    /// Claim entries whose lock (idle time) has expired, for redelivery.
    pub async fn autoclaim_idle_over(
        &self,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, ConsumerError> {
        let mut conn = self.conn().await?;
        let val: Value = redis::cmd("XAUTOCLAIM")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(min_idle.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut *conn)
            .await
            .map_err(|e| ConsumerError::Transport(e.to_string()))?;

        Ok(parse_xautoclaim_value(val))
    }

    pub async fn pending_entry(&self, id: &str) -> Result<Option<PendingEntry>, ConsumerError> {
        let mut conn = self.conn().await?;
        let val: Value = redis::cmd("XPENDING")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(id)
            .arg(id)
            .arg(1)
            .query_async(&mut *conn)
            .await
            .map_err(|e| ConsumerError::Transport(e.to_string()))?;

        Ok(parse_xpending_value(val).into_iter().next())
    }

    pub async fn ack(&self, id: &str) -> Result<i64, ConsumerError> {
        let mut conn = self.conn().await?;
        redis::cmd("XACK")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(id)
            .query_async::<_, i64>(&mut *conn)
            .await
            .map_err(|e| ConsumerError::Transport(e.to_string()))
    }

    /// `XCLAIM` to this consumer with the given idle time; returns claimed ids.
    async fn claim_with_idle(&self, id: &str, idle_ms: u64) -> Result<Vec<String>, ConsumerError> {
        let mut conn = self.conn().await?;
        let val: Value = redis::cmd("XCLAIM")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(0)
            .arg(id)
            .arg("IDLE")
            .arg(idle_ms)
            .arg("JUSTID")
            .query_async(&mut *conn)
            .await
            .map_err(|e| ConsumerError::Transport(e.to_string()))?;

        let Value::Bulk(ids) = val else {
            return Ok(Vec::new());
        };
        Ok(ids
            .into_iter()
            .filter_map(|v| match v {
                Value::Data(b) => Some(String::from_utf8_lossy(&b).to_string()),
                _ => None,
            })
            .collect())
    }

    /// Fails unless `id` is pending on this consumer with a live lock.
    async fn check_lock(&self, id: &str) -> Result<PendingEntry, SettlementError> {
        let entry = self
            .pending_entry(id)
            .await
            .map_err(|e| SettlementError::Transport(e.to_string()))?
            .ok_or_else(|| SettlementError::UnknownMessage(id.to_string()))?;
        if entry.consumer != self.consumer || entry.idle_ms >= self.lock_ms() {
            return Err(SettlementError::LockLost(id.to_string()));
        }
        Ok(entry)
    }

    fn envelope(&self, id: String, payload: Bytes, delivery_count: u32) -> Envelope {
        let delivery = Delivery::new(
            id.clone(),
            payload,
            delivery_count,
            lock_expiry(self.lock),
            self.mode,
        );
        match self.mode {
            SettlementMode::AutoComplete => Envelope::auto(delivery),
            SettlementMode::ManualComplete => {
                let port: Arc<dyn Settle> = Arc::new(self.clone());
                Envelope::manual(delivery, Some(SettlementHandle::new(id, port)))
            }
        }
    }

    /// Entries without a payload can never be processed; drop them.
    async fn discard_malformed(&self, id: &str) {
        warn!(message_id = %id, stream = %self.stream, "entry has no payload field; acknowledging");
        if let Err(e) = self.ack(id).await {
            warn!(error = %e, message_id = %id, "ack of malformed entry failed");
        }
    }
}

#[async_trait::async_trait]
impl Settle for RedisStreamTransport {
    async fn complete(&self, id: &str) -> Result<(), SettlementError> {
        self.check_lock(id).await?;
        let acked = self
            .ack(id)
            .await
            .map_err(|e| SettlementError::Transport(e.to_string()))?;
        if acked == 0 {
            return Err(SettlementError::UnknownMessage(id.to_string()));
        }
        Ok(())
    }

    async fn abandon(&self, id: &str) -> Result<(), SettlementError> {
        self.check_lock(id).await?;
        let claimed = self
            .claim_with_idle(id, self.lock_ms())
            .await
            .map_err(|e| SettlementError::Transport(e.to_string()))?;
        if claimed.is_empty() {
            return Err(SettlementError::UnknownMessage(id.to_string()));
        }
        Ok(())
    }

    async fn dead_letter(
        &self,
        id: &str,
        reason: &str,
        description: &str,
    ) -> Result<(), SettlementError> {
        let entry = self.check_lock(id).await?;
        let payload = self
            .read_payload(id)
            .await
            .map_err(|e| SettlementError::Transport(e.to_string()))?
            .unwrap_or_default();
        dlq::publish(
            &self.pool,
            &self.dead_letter_stream,
            &DeadLetterRecord {
                message_id: id,
                delivery_count: entry.delivery_count,
                reason,
                description,
                payload: &payload,
            },
        )
        .await
        .map_err(|e| SettlementError::Transport(e.to_string()))?;
        self.ack(id)
            .await
            .map_err(|e| SettlementError::Transport(e.to_string()))?;
        Ok(())
    }
}

impl RedisStreamTransport {
    async fn read_payload(&self, id: &str) -> Result<Option<Bytes>, ConsumerError> {
        let mut conn = self.conn().await?;
        let val: Value = redis::cmd("XRANGE")
            .arg(&self.stream)
            .arg(id)
            .arg(id)
            .query_async(&mut *conn)
            .await
            .map_err(|e| ConsumerError::Transport(e.to_string()))?;
        let Value::Bulk(items) = val else {
            return Ok(None);
        };
        Ok(items.iter().filter_map(parse_entry).next().and_then(|e| e.payload))
    }
}

#[async_trait::async_trait]
impl Transport for RedisStreamTransport {
    async fn receive(&self) -> Result<Option<Envelope>, ConsumerError> {
        for entry in self.autoclaim_idle_over(self.lock, 1).await? {
            let Some(payload) = entry.payload else {
                self.discard_malformed(&entry.id).await;
                continue;
            };
            let count = self
                .pending_entry(&entry.id)
                .await?
                .map(|p| p.delivery_count)
                .unwrap_or(2);
            return Ok(Some(self.envelope(entry.id, payload, count)));
        }

        for entry in self.pop_batch(1).await? {
            let Some(payload) = entry.payload else {
                self.discard_malformed(&entry.id).await;
                continue;
            };
            return Ok(Some(self.envelope(entry.id, payload, 1)));
        }
        Ok(None)
    }

    async fn renew_lock(&self, id: &str) -> Result<DateTime<Utc>, SettlementError> {
        self.check_lock(id).await?;
        let claimed = self
            .claim_with_idle(id, 0)
            .await
            .map_err(|e| SettlementError::Transport(e.to_string()))?;
        if claimed.is_empty() {
            return Err(SettlementError::UnknownMessage(id.to_string()));
        }
        Ok(lock_expiry(self.lock))
    }
}

/// Parse one `[id, [k1, v1, ...]]` entry.
fn parse_entry(m: &Value) -> Option<StreamEntry> {
    let Value::Bulk(pair) = m else { return None };
    if pair.len() != 2 {
        return None;
    }
    let id = match &pair[0] {
        Value::Data(b) => String::from_utf8_lossy(b).to_string(),
        _ => return None,
    };
    let Value::Bulk(kv) = &pair[1] else {
        return Some(StreamEntry { id, payload: None });
    };

    let mut payload: Option<Bytes> = None;
    let mut i = 0;
    while i + 1 < kv.len() {
        match (&kv[i], &kv[i + 1]) {
            (Value::Data(k), Value::Data(v)) if k == b"payload" => {
                payload = Some(Bytes::from(v.clone()));
                break;
            }
            _ => {}
        }
        i += 2;
    }
    Some(StreamEntry { id, payload })
}

/// Parse the `XREADGROUP` reply into stream entries.
/// We stay purely on the deadpool-redis `redis` crate to avoid type/version conflicts.
pub fn parse_stream_entries(val: Value) -> Vec<StreamEntry> {
    let mut out = Vec::new();

    // Expected shape:
    // Array[
    //   Array[ stream_name, Array[ Array[ id, Array[ k1, v1, ... ] ], ... ] ],
    //   ...
    // ]
    let Value::Bulk(streams) = val else { return out };

    for s in streams {
        let Value::Bulk(stream_pair) = s else { continue };
        if stream_pair.len() != 2 {
            continue;
        }
        let Value::Bulk(msgs) = &stream_pair[1] else { continue };
        out.extend(msgs.iter().filter_map(parse_entry));
    }

    out
}

/// Parse `XAUTOCLAIM`: `[cursor, [entries...], [deleted ids...]]`.
/// Entries deleted from the stream come back as nil and are skipped.
pub fn parse_xautoclaim_value(val: Value) -> Vec<StreamEntry> {
    let Value::Bulk(parts) = val else {
        return Vec::new();
    };
    match parts.get(1) {
        Some(Value::Bulk(entries)) => entries.iter().filter_map(parse_entry).collect(),
        _ => Vec::new(),
    }
}

/// Parse extended `XPENDING`: `[[id, consumer, idle_ms, delivery_count], ...]`.
pub fn parse_xpending_value(val: Value) -> Vec<PendingEntry> {
    let Value::Bulk(rows) = val else {
        return Vec::new();
    };
    rows.iter()
        .filter_map(|row| {
            let Value::Bulk(f) = row else { return None };
            match f.as_slice() {
                [Value::Data(id), Value::Data(consumer), Value::Int(idle), Value::Int(count)] => {
                    Some(PendingEntry {
                        id: String::from_utf8_lossy(id).to_string(),
                        consumer: String::from_utf8_lossy(consumer).to_string(),
                        idle_ms: (*idle).max(0) as u64,
                        delivery_count: u32::try_from(*count).unwrap_or(u32::MAX).max(1),
                    })
                }
                _ => None,
            }
        })
        .collect()
}
