//! Work queue adapter.
//!
//! Tokens are identified by their job's `job_uuid`: at most one live
//! delayed entry and one repeating registration exist per identity, and
//! enqueueing again replaces the previous entry. Per-token mutual
//! exclusion is provided by leases with a renewal interval; a lease that
//! is not renewed expires and its token is redelivered.

pub mod memory;
pub mod redis;

pub use memory::MemoryQueue;
pub use redis::RedisQueue;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::{JobId, JobUuid, QueueError};

/// Wire body of a queue token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueToken {
    pub job_id: JobId,
    pub job_uuid: JobUuid,
}

/// Registration options for a repeating token. The cron expression is the
/// job's UTC snapshot; the timezone is pinned to UTC by construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepeatOptions {
    pub cron_expression: String,
    pub start_date: DateTime<Utc>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
}

/// A dequeued token under lease. The lease must be renewed within the
/// configured interval or the token is considered stalled and redelivered.
#[derive(Debug, Clone)]
pub struct LeasedToken {
    pub token: QueueToken,
    pub lease_id: String,
    /// Zero-based delivery attempt of this token.
    pub attempt: u32,
    pub scheduled_for: DateTime<Utc>,
    pub lease_expires_at: DateTime<Utc>,
}

/// Advisory lifecycle events. Observers must not treat these as the
/// source of truth; the worker writes execution records directly.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    Completed(JobUuid),
    Failed(JobUuid),
    Stalled(JobUuid),
}

/// Queue backend contract shared by the memory and Redis adapters.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Enqueue a single delayed token. Fails with `PastSchedule` when the
    /// due time is already in the past. Replaces any live delayed entry
    /// with the same `job_uuid`.
    async fn enqueue_delayed(
        &self,
        token: QueueToken,
        run_at: DateTime<Utc>,
    ) -> Result<(), QueueError>;

    /// Register (or replace) a repeating token for the identity.
    async fn enqueue_repeating(
        &self,
        token: QueueToken,
        options: RepeatOptions,
    ) -> Result<(), QueueError>;

    /// Remove the delayed entry and any repeating registration bearing
    /// `job_uuid`. Idempotent. Does not interrupt an in-flight lease.
    async fn cancel(&self, job_uuid: &JobUuid) -> Result<(), QueueError>;

    /// Pull the next due token under a fresh lease, if any.
    async fn dequeue(&self) -> Result<Option<LeasedToken>, QueueError>;

    /// Extend the lease on an in-flight token.
    async fn renew(&self, lease: &LeasedToken) -> Result<(), QueueError>;

    /// Acknowledge a token; its lease is released.
    async fn complete(&self, lease: &LeasedToken) -> Result<(), QueueError>;

    /// Release a token for retry. Re-delivers with exponential backoff
    /// while attempts remain, otherwise drops it and emits `Failed`.
    async fn retry(&self, lease: &LeasedToken, reason: &str) -> Result<(), QueueError>;

    /// Number of live entries (delayed plus repeating).
    async fn depth(&self) -> Result<u64, QueueError>;

    /// Liveness probe of the backing store.
    async fn ping(&self) -> Result<(), QueueError>;

    /// Subscribe to advisory lifecycle events.
    fn events(&self) -> broadcast::Receiver<QueueEvent>;
}

/// Tolerance applied to the past-schedule check, absorbing clock skew
/// between planning and enqueueing.
pub(crate) const PAST_SCHEDULE_GRACE_MS: i64 = 1_000;

pub(crate) fn check_not_past(run_at: DateTime<Utc>, now: DateTime<Utc>) -> Result<(), QueueError> {
    if run_at < now - chrono::Duration::milliseconds(PAST_SCHEDULE_GRACE_MS) {
        return Err(QueueError::PastSchedule(run_at.to_rfc3339()));
    }
    Ok(())
}

/// Retry delay for a token on its next delivery attempt.
pub(crate) fn retry_delay_ms(backoff_initial_ms: u64, attempt: u32) -> u64 {
    backoff_initial_ms.saturating_mul(1u64 << attempt.min(16))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn past_schedule_check_has_grace() {
        let now = Utc::now();
        assert!(check_not_past(now, now).is_ok());
        assert!(check_not_past(now - chrono::Duration::milliseconds(500), now).is_ok());
        assert!(check_not_past(now - chrono::Duration::seconds(5), now).is_err());
        assert!(check_not_past(now + chrono::Duration::days(1), now).is_ok());
    }

    #[test]
    fn retry_delay_grows_exponentially() {
        assert_eq!(retry_delay_ms(5_000, 0), 5_000);
        assert_eq!(retry_delay_ms(5_000, 1), 10_000);
        assert_eq!(retry_delay_ms(5_000, 2), 20_000);
        // Shift is capped so large attempts do not overflow.
        assert!(retry_delay_ms(5_000, 60) >= retry_delay_ms(5_000, 16));
    }

    #[test]
    fn token_serializes_with_both_ids() {
        let token = QueueToken {
            job_id: JobId(7),
            job_uuid: JobUuid::new(),
        };
        let json = serde_json::to_value(&token).unwrap();
        assert_eq!(json["job_id"], 7);
        assert!(json["job_uuid"].is_string());
    }
}
