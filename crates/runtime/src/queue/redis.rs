//! Redis-backed queue for production use.
//!
//! Layout under the configured key prefix:
//! - `tokens`      HASH  job_uuid -> serialized token record
//! - `delayed`     ZSET  member = job_uuid, score = due time (ms)
//! - `repeats`     HASH  job_uuid -> serialized repeat registration
//! - `processing`  HASH  job_uuid -> serialized in-flight lease
//! - `lock:{uuid}` STRING lease id with PX = lock duration
//!
//! Per-job mutual exclusion comes from the `SET NX PX` lock key; a worker
//! that stops renewing lets the key expire and the token is reclaimed as
//! stalled. Worker-side acks are buffered in-process while the store is
//! unreachable and drained after reconnect; interactive enqueues surface
//! `QueueUnavailable` once connection retries are exhausted.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use super::{
    check_not_past, retry_delay_ms, LeasedToken, QueueBackend, QueueError, QueueEvent, QueueToken,
    RepeatOptions,
};
use crate::config::QueueSettings;
use crate::planner;
use crate::types::JobUuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenRecord {
    token: QueueToken,
    attempt: u32,
    run_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RepeatRecord {
    token: QueueToken,
    options: RepeatOptions,
    next_fire: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProcessingRecord {
    lease_id: String,
    attempt: u32,
    scheduled_for: DateTime<Utc>,
}

/// Worker-side acks replayed after a reconnect.
#[derive(Debug, Clone)]
enum BufferedAck {
    Complete { lease: LeaseKey },
    Retry { lease: LeaseKey, reason: String },
}

#[derive(Debug, Clone)]
struct LeaseKey {
    token: QueueToken,
    lease_id: String,
    attempt: u32,
}

impl From<&LeasedToken> for LeaseKey {
    fn from(lease: &LeasedToken) -> Self {
        Self {
            token: lease.token.clone(),
            lease_id: lease.lease_id.clone(),
            attempt: lease.attempt,
        }
    }
}

/// Redis queue backend.
pub struct RedisQueue {
    settings: QueueSettings,
    client: Client,
    connection: RwLock<Option<ConnectionManager>>,
    offline: Mutex<VecDeque<BufferedAck>>,
    last_stall_sweep: Mutex<DateTime<Utc>>,
    events: broadcast::Sender<QueueEvent>,
}

impl RedisQueue {
    pub async fn connect(settings: QueueSettings) -> Result<Self, QueueError> {
        let client = Client::open(settings.redis_url.as_str())
            .map_err(|e| QueueError::Unavailable(format!("invalid redis URL: {e}")))?;
        let (events, _) = broadcast::channel(256);
        let queue = Self {
            settings,
            client,
            connection: RwLock::new(None),
            offline: Mutex::new(VecDeque::new()),
            last_stall_sweep: Mutex::new(Utc::now() - Duration::days(1)),
            events,
        };
        queue.ensure_connection().await?;
        Ok(queue)
    }

    async fn ensure_connection(&self) -> Result<ConnectionManager, QueueError> {
        {
            let guard = self.connection.read().await;
            if let Some(conn) = guard.as_ref() {
                return Ok(conn.clone());
            }
        }

        let mut guard = self.connection.write().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        let mut last_error = String::new();
        for attempt in 0..=self.settings.connect_retries {
            match self.client.get_tokio_connection_manager().await {
                Ok(conn) => {
                    if attempt > 0 {
                        tracing::info!("queue: reconnected to redis");
                    }
                    *guard = Some(conn.clone());
                    return Ok(conn);
                }
                Err(e) => {
                    last_error = e.to_string();
                    tracing::warn!(attempt, error = %last_error, "queue: redis connection failed");
                    tokio::time::sleep(std::time::Duration::from_millis(200 * (attempt as u64 + 1)))
                        .await;
                }
            }
        }
        Err(QueueError::Unavailable(last_error))
    }

    async fn drop_connection(&self) {
        *self.connection.write().await = None;
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.settings.key_prefix, suffix)
    }

    fn lock_key(&self, uuid: &JobUuid) -> String {
        self.key(&format!("lock:{uuid}"))
    }

    fn serialize<T: Serialize>(value: &T) -> Result<String, QueueError> {
        serde_json::to_string(value).map_err(|e| QueueError::Serialization(e.to_string()))
    }

    fn deserialize<T: for<'de> Deserialize<'de>>(data: &str) -> Result<T, QueueError> {
        serde_json::from_str(data).map_err(|e| QueueError::Serialization(e.to_string()))
    }

    fn backend_err(&self, context: &str, e: redis::RedisError) -> QueueError {
        QueueError::Backend(format!("{context}: {e}"))
    }

    async fn store_token(
        &self,
        conn: &mut ConnectionManager,
        record: &TokenRecord,
    ) -> Result<(), QueueError> {
        let uuid = record.token.job_uuid.to_string();
        let serialized = Self::serialize(record)?;
        let _: () = conn
            .hset(self.key("tokens"), &uuid, serialized)
            .await
            .map_err(|e| self.backend_err("store token", e))?;
        let _: () = conn
            .zadd(
                self.key("delayed"),
                &uuid,
                record.run_at.timestamp_millis() as f64,
            )
            .await
            .map_err(|e| self.backend_err("schedule token", e))?;
        Ok(())
    }

    /// Reclaim in-flight tokens whose lock expired without an ack.
    async fn reclaim_stalled(&self, conn: &mut ConnectionManager) -> Result<(), QueueError> {
        {
            let mut last = self.last_stall_sweep.lock();
            let now = Utc::now();
            if (now - *last).num_milliseconds() < self.settings.stalled_interval_ms as i64 {
                return Ok(());
            }
            *last = now;
        }

        let processing: std::collections::HashMap<String, String> = conn
            .hgetall(self.key("processing"))
            .await
            .map_err(|e| self.backend_err("read processing set", e))?;

        for (uuid, raw) in processing {
            let job_uuid = JobUuid::from_string(uuid.clone());
            let locked: bool = conn
                .exists(self.lock_key(&job_uuid))
                .await
                .map_err(|e| self.backend_err("probe lock", e))?;
            if locked {
                continue;
            }

            let record: ProcessingRecord = match Self::deserialize(&raw) {
                Ok(record) => record,
                Err(_) => {
                    let _: () = conn
                        .hdel(self.key("processing"), &uuid)
                        .await
                        .map_err(|e| self.backend_err("drop bad processing entry", e))?;
                    continue;
                }
            };

            tracing::warn!(job_uuid = %job_uuid, "queue: lock expired, redelivering token");
            let token: Option<String> = conn
                .hget(self.key("tokens"), &uuid)
                .await
                .map_err(|e| self.backend_err("read token", e))?;
            if let Some(raw_token) = token {
                let mut token_record: TokenRecord = Self::deserialize(&raw_token)?;
                token_record.attempt = record.attempt;
                token_record.run_at = Utc::now();
                self.store_token(conn, &token_record).await?;
            }
            let _: () = conn
                .hdel(self.key("processing"), &uuid)
                .await
                .map_err(|e| self.backend_err("clear processing entry", e))?;
            let _ = self.events.send(QueueEvent::Stalled(job_uuid));
        }
        Ok(())
    }

    /// Materialize due repeating registrations into delayed tokens.
    async fn materialize_repeats(&self, conn: &mut ConnectionManager) -> Result<(), QueueError> {
        let now = Utc::now();
        let repeats: std::collections::HashMap<String, String> = conn
            .hgetall(self.key("repeats"))
            .await
            .map_err(|e| self.backend_err("read repeats", e))?;

        for (uuid, raw) in repeats {
            let mut record: RepeatRecord = match Self::deserialize(&raw) {
                Ok(record) => record,
                Err(_) => {
                    let _: () = conn
                        .hdel(self.key("repeats"), &uuid)
                        .await
                        .map_err(|e| self.backend_err("drop bad repeat", e))?;
                    continue;
                }
            };
            if record.next_fire > now {
                continue;
            }

            let job_uuid = JobUuid::from_string(uuid.clone());
            // Previous fire still in flight or already queued: defer.
            let locked: bool = conn
                .exists(self.lock_key(&job_uuid))
                .await
                .map_err(|e| self.backend_err("probe lock", e))?;
            let queued: Option<f64> = conn
                .zscore(self.key("delayed"), &uuid)
                .await
                .map_err(|e| self.backend_err("probe delayed", e))?;
            if locked || queued.is_some() {
                continue;
            }

            let fire_at = record.next_fire;
            self.store_token(
                conn,
                &TokenRecord {
                    token: record.token.clone(),
                    attempt: 0,
                    run_at: fire_at,
                },
            )
            .await?;

            let next = planner::parse_cron(&record.options.cron_expression)
                .ok()
                .and_then(|schedule| schedule.after(&now).next())
                .filter(|next| {
                    record
                        .options
                        .end_date
                        .map(|end| *next <= end)
                        .unwrap_or(true)
                });
            match next {
                Some(next_fire) => {
                    record.next_fire = next_fire;
                    let serialized = Self::serialize(&record)?;
                    let _: () = conn
                        .hset(self.key("repeats"), &uuid, serialized)
                        .await
                        .map_err(|e| self.backend_err("advance repeat", e))?;
                }
                None => {
                    let _: () = conn
                        .hdel(self.key("repeats"), &uuid)
                        .await
                        .map_err(|e| self.backend_err("retire repeat", e))?;
                }
            }
        }
        Ok(())
    }

    async fn try_lock(
        &self,
        conn: &mut ConnectionManager,
        uuid: &JobUuid,
        lease_id: &str,
    ) -> Result<bool, QueueError> {
        let acquired: Option<String> = redis::cmd("SET")
            .arg(self.lock_key(uuid))
            .arg(lease_id)
            .arg("NX")
            .arg("PX")
            .arg(self.settings.lock_duration_ms)
            .query_async(conn)
            .await
            .map_err(|e| self.backend_err("acquire lock", e))?;
        Ok(acquired.is_some())
    }

    async fn release_lock(
        &self,
        conn: &mut ConnectionManager,
        uuid: &JobUuid,
        lease_id: &str,
    ) -> Result<(), QueueError> {
        let holder: Option<String> = conn
            .get(self.lock_key(uuid))
            .await
            .map_err(|e| self.backend_err("read lock", e))?;
        if holder.as_deref() == Some(lease_id) {
            let _: () = conn
                .del(self.lock_key(uuid))
                .await
                .map_err(|e| self.backend_err("release lock", e))?;
        }
        Ok(())
    }

    async fn ack_complete(
        &self,
        conn: &mut ConnectionManager,
        lease: &LeaseKey,
    ) -> Result<(), QueueError> {
        let uuid = lease.token.job_uuid.to_string();
        self.release_lock(conn, &lease.token.job_uuid, &lease.lease_id)
            .await?;
        let _: () = conn
            .hdel(self.key("processing"), &uuid)
            .await
            .map_err(|e| self.backend_err("clear processing entry", e))?;
        let _: () = conn
            .hdel(self.key("tokens"), &uuid)
            .await
            .map_err(|e| self.backend_err("clear token", e))?;
        let _ = self
            .events
            .send(QueueEvent::Completed(lease.token.job_uuid.clone()));
        Ok(())
    }

    async fn ack_retry(
        &self,
        conn: &mut ConnectionManager,
        lease: &LeaseKey,
        reason: &str,
    ) -> Result<(), QueueError> {
        let uuid = lease.token.job_uuid.to_string();
        let next_attempt = lease.attempt + 1;

        if next_attempt >= self.settings.attempts {
            tracing::warn!(
                job_uuid = %lease.token.job_uuid,
                attempts = next_attempt,
                reason,
                "queue: token exhausted its delivery attempts"
            );
            self.release_lock(conn, &lease.token.job_uuid, &lease.lease_id)
                .await?;
            let _: () = conn
                .hdel(self.key("processing"), &uuid)
                .await
                .map_err(|e| self.backend_err("clear processing entry", e))?;
            let _: () = conn
                .hdel(self.key("tokens"), &uuid)
                .await
                .map_err(|e| self.backend_err("clear token", e))?;
            let _ = self
                .events
                .send(QueueEvent::Failed(lease.token.job_uuid.clone()));
            return Ok(());
        }

        let delay = retry_delay_ms(self.settings.backoff_initial_ms, lease.attempt);
        let run_at = Utc::now() + Duration::milliseconds(delay as i64);
        self.store_token(
            conn,
            &TokenRecord {
                token: lease.token.clone(),
                attempt: next_attempt,
                run_at,
            },
        )
        .await?;
        self.release_lock(conn, &lease.token.job_uuid, &lease.lease_id)
            .await?;
        let _: () = conn
            .hdel(self.key("processing"), &uuid)
            .await
            .map_err(|e| self.backend_err("clear processing entry", e))?;
        tracing::debug!(
            job_uuid = %lease.token.job_uuid,
            attempt = next_attempt,
            delay_ms = delay,
            reason,
            "queue: token scheduled for retry"
        );
        Ok(())
    }

    /// Replay acks buffered while the store was unreachable.
    async fn drain_offline(&self, conn: &mut ConnectionManager) -> Result<(), QueueError> {
        loop {
            let next = self.offline.lock().pop_front();
            let Some(ack) = next else {
                return Ok(());
            };
            let result = match &ack {
                BufferedAck::Complete { lease } => self.ack_complete(conn, lease).await,
                BufferedAck::Retry { lease, reason } => self.ack_retry(conn, lease, reason).await,
            };
            if let Err(e) = result {
                self.offline.lock().push_front(ack);
                return Err(e);
            }
        }
    }

    fn buffer_ack(&self, ack: BufferedAck) {
        let mut offline = self.offline.lock();
        if offline.len() >= self.settings.offline_buffer_size {
            tracing::error!("queue: offline buffer full, dropping oldest ack");
            offline.pop_front();
        }
        offline.push_back(ack);
    }
}

#[async_trait]
impl QueueBackend for RedisQueue {
    async fn enqueue_delayed(
        &self,
        token: QueueToken,
        run_at: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        check_not_past(run_at, Utc::now())?;
        let mut conn = self.ensure_connection().await?;
        let result = self
            .store_token(
                &mut conn,
                &TokenRecord {
                    token,
                    attempt: 0,
                    run_at,
                },
            )
            .await;
        if result.is_err() {
            self.drop_connection().await;
        }
        result
    }

    async fn enqueue_repeating(
        &self,
        token: QueueToken,
        options: RepeatOptions,
    ) -> Result<(), QueueError> {
        let schedule = planner::parse_cron(&options.cron_expression)
            .map_err(|e| QueueError::Serialization(e.to_string()))?;
        let now = Utc::now();
        let from = now.max(options.start_date) - Duration::seconds(1);
        let Some(next_fire) = schedule.after(&from).next() else {
            return Err(QueueError::PastSchedule(format!(
                "no occurrence of {} after {}",
                options.cron_expression, from
            )));
        };
        if let Some(end) = options.end_date {
            if next_fire > end {
                return Err(QueueError::PastSchedule(format!(
                    "first occurrence {next_fire} is past the end date {end}"
                )));
            }
        }

        let uuid = token.job_uuid.to_string();
        let record = RepeatRecord {
            token,
            options,
            next_fire,
        };
        let serialized = Self::serialize(&record)?;
        let mut conn = self.ensure_connection().await?;
        let result: Result<(), QueueError> = conn
            .hset(self.key("repeats"), &uuid, serialized)
            .await
            .map_err(|e| self.backend_err("register repeat", e));
        if result.is_err() {
            self.drop_connection().await;
        }
        result
    }

    async fn cancel(&self, job_uuid: &JobUuid) -> Result<(), QueueError> {
        let mut conn = self.ensure_connection().await?;
        let uuid = job_uuid.to_string();
        let _: () = conn
            .zrem(self.key("delayed"), &uuid)
            .await
            .map_err(|e| self.backend_err("cancel delayed", e))?;
        let _: () = conn
            .hdel(self.key("tokens"), &uuid)
            .await
            .map_err(|e| self.backend_err("cancel token", e))?;
        let _: () = conn
            .hdel(self.key("repeats"), &uuid)
            .await
            .map_err(|e| self.backend_err("cancel repeat", e))?;
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<LeasedToken>, QueueError> {
        let mut conn = self.ensure_connection().await?;

        if let Err(e) = self.drain_offline(&mut conn).await {
            tracing::warn!(error = %e, "queue: failed to drain offline acks");
        }
        self.reclaim_stalled(&mut conn).await?;
        self.materialize_repeats(&mut conn).await?;

        let now_ms = Utc::now().timestamp_millis() as f64;
        let candidates: Vec<String> = conn
            .zrangebyscore_limit(self.key("delayed"), "-inf", now_ms, 0, 8)
            .await
            .map_err(|e| self.backend_err("scan delayed", e))?;

        for uuid in candidates {
            let job_uuid = JobUuid::from_string(uuid.clone());
            let lease_id = Uuid::new_v4().to_string();
            if !self.try_lock(&mut conn, &job_uuid, &lease_id).await? {
                continue;
            }

            // The lock is ours; claim the token. Another worker may have
            // consumed it between the scan and the lock.
            let removed: i64 = conn
                .zrem(self.key("delayed"), &uuid)
                .await
                .map_err(|e| self.backend_err("claim token", e))?;
            if removed == 0 {
                self.release_lock(&mut conn, &job_uuid, &lease_id).await?;
                continue;
            }

            let raw: Option<String> = conn
                .hget(self.key("tokens"), &uuid)
                .await
                .map_err(|e| self.backend_err("read token", e))?;
            let Some(raw) = raw else {
                self.release_lock(&mut conn, &job_uuid, &lease_id).await?;
                continue;
            };
            let record: TokenRecord = Self::deserialize(&raw)?;

            let processing = ProcessingRecord {
                lease_id: lease_id.clone(),
                attempt: record.attempt,
                scheduled_for: record.run_at,
            };
            let _: () = conn
                .hset(self.key("processing"), &uuid, Self::serialize(&processing)?)
                .await
                .map_err(|e| self.backend_err("track processing", e))?;

            return Ok(Some(LeasedToken {
                token: record.token,
                lease_id,
                attempt: record.attempt,
                scheduled_for: record.run_at,
                lease_expires_at: Utc::now()
                    + Duration::milliseconds(self.settings.lock_duration_ms as i64),
            }));
        }

        Ok(None)
    }

    async fn renew(&self, lease: &LeasedToken) -> Result<(), QueueError> {
        let mut conn = self.ensure_connection().await?;
        let holder: Option<String> = conn
            .get(self.lock_key(&lease.token.job_uuid))
            .await
            .map_err(|e| self.backend_err("read lock", e))?;
        if holder.as_deref() != Some(lease.lease_id.as_str()) {
            return Err(QueueError::Backend(format!(
                "lease {} no longer held",
                lease.lease_id
            )));
        }
        let _: () = conn
            .pexpire(
                self.lock_key(&lease.token.job_uuid),
                self.settings.lock_duration_ms as usize,
            )
            .await
            .map_err(|e| self.backend_err("extend lock", e))?;
        Ok(())
    }

    async fn complete(&self, lease: &LeasedToken) -> Result<(), QueueError> {
        let key = LeaseKey::from(lease);
        match self.ensure_connection().await {
            Ok(mut conn) => match self.ack_complete(&mut conn, &key).await {
                Ok(()) => Ok(()),
                Err(e) => {
                    tracing::warn!(error = %e, "queue: buffering completion ack");
                    self.drop_connection().await;
                    self.buffer_ack(BufferedAck::Complete { lease: key });
                    Ok(())
                }
            },
            Err(_) => {
                self.buffer_ack(BufferedAck::Complete { lease: key });
                Ok(())
            }
        }
    }

    async fn retry(&self, lease: &LeasedToken, reason: &str) -> Result<(), QueueError> {
        let key = LeaseKey::from(lease);
        match self.ensure_connection().await {
            Ok(mut conn) => match self.ack_retry(&mut conn, &key, reason).await {
                Ok(()) => Ok(()),
                Err(e) => {
                    tracing::warn!(error = %e, "queue: buffering retry ack");
                    self.drop_connection().await;
                    self.buffer_ack(BufferedAck::Retry {
                        lease: key,
                        reason: reason.to_string(),
                    });
                    Ok(())
                }
            },
            Err(_) => {
                self.buffer_ack(BufferedAck::Retry {
                    lease: key,
                    reason: reason.to_string(),
                });
                Ok(())
            }
        }
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.ensure_connection().await?;
        let delayed: u64 = conn
            .zcard(self.key("delayed"))
            .await
            .map_err(|e| self.backend_err("count delayed", e))?;
        let repeats: u64 = conn
            .hlen(self.key("repeats"))
            .await
            .map_err(|e| self.backend_err("count repeats", e))?;
        Ok(delayed + repeats)
    }

    async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.ensure_connection().await?;
        let response: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| self.backend_err("ping", e))?;
        if response == "PONG" {
            Ok(())
        } else {
            Err(QueueError::Backend(format!("unexpected ping reply: {response}")))
        }
    }

    fn events(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JobId;

    #[test]
    fn records_round_trip_through_json() {
        let record = TokenRecord {
            token: QueueToken {
                job_id: JobId(3),
                job_uuid: JobUuid::new(),
            },
            attempt: 2,
            run_at: Utc::now(),
        };
        let raw = RedisQueue::serialize(&record).unwrap();
        let back: TokenRecord = RedisQueue::deserialize(&raw).unwrap();
        assert_eq!(back.token, record.token);
        assert_eq!(back.attempt, 2);
    }

    #[test]
    fn repeat_record_round_trips() {
        let record = RepeatRecord {
            token: QueueToken {
                job_id: JobId(3),
                job_uuid: JobUuid::new(),
            },
            options: RepeatOptions {
                cron_expression: "30 14 * * *".to_string(),
                start_date: Utc::now(),
                end_date: None,
            },
            next_fire: Utc::now(),
        };
        let raw = RedisQueue::serialize(&record).unwrap();
        let back: RepeatRecord = RedisQueue::deserialize(&raw).unwrap();
        assert_eq!(back.options.cron_expression, "30 14 * * *");
    }
}
