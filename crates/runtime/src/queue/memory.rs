//! In-memory queue backend for development and tests.
//!
//! Mirrors the Redis adapter's semantics: delayed min-heap, repeating
//! registrations, per-identity leases with expiry, retry with backoff.
//! Cancelled or replaced heap entries are detected by generation and
//! skipped on pop.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::{
    check_not_past, retry_delay_ms, LeasedToken, QueueBackend, QueueError, QueueEvent, QueueToken,
    RepeatOptions,
};
use crate::config::QueueSettings;
use crate::planner;
use crate::types::JobUuid;

#[derive(Debug, Clone)]
struct DelayedEntry {
    token: QueueToken,
    run_at: DateTime<Utc>,
    attempt: u32,
    generation: u64,
}

impl PartialEq for DelayedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.run_at == other.run_at && self.generation == other.generation
    }
}

impl Eq for DelayedEntry {}

impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert for earliest-first ordering.
        other.run_at.cmp(&self.run_at)
    }
}

#[derive(Debug, Clone)]
struct RepeatState {
    token: QueueToken,
    options: RepeatOptions,
    next_fire: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Lease {
    token: QueueToken,
    attempt: u32,
    scheduled_for: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

/// In-process queue backend.
pub struct MemoryQueue {
    settings: QueueSettings,
    delayed: Mutex<BinaryHeap<DelayedEntry>>,
    /// Live generation per delayed identity; heap entries with a stale
    /// generation are ghosts and get discarded on pop.
    live: DashMap<JobUuid, u64>,
    repeats: DashMap<JobUuid, RepeatState>,
    leases: DashMap<String, Lease>,
    leased: DashMap<JobUuid, String>,
    generation: Mutex<u64>,
    events: broadcast::Sender<QueueEvent>,
}

impl MemoryQueue {
    pub fn new(settings: QueueSettings) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            settings,
            delayed: Mutex::new(BinaryHeap::new()),
            live: DashMap::new(),
            repeats: DashMap::new(),
            leases: DashMap::new(),
            leased: DashMap::new(),
            generation: Mutex::new(0),
            events,
        }
    }

    fn next_generation(&self) -> u64 {
        let mut generation = self.generation.lock();
        *generation += 1;
        *generation
    }

    fn push_delayed(&self, token: QueueToken, run_at: DateTime<Utc>, attempt: u32) {
        let generation = self.next_generation();
        self.live.insert(token.job_uuid.clone(), generation);
        self.delayed.lock().push(DelayedEntry {
            token,
            run_at,
            attempt,
            generation,
        });
    }

    /// Reclaim tokens whose lease expired without completion.
    fn reclaim_stalled(&self, now: DateTime<Utc>) {
        let expired: Vec<(String, Lease)> = self
            .leases
            .iter()
            .filter(|entry| entry.value().expires_at <= now)
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        for (lease_id, lease) in expired {
            self.leases.remove(&lease_id);
            self.leased
                .remove_if(&lease.token.job_uuid, |_, id| *id == lease_id);
            let uuid = lease.token.job_uuid.clone();
            tracing::warn!(job_uuid = %uuid, "queue: lease expired, redelivering token");
            self.push_delayed(lease.token, now, lease.attempt);
            let _ = self.events.send(QueueEvent::Stalled(uuid));
        }
    }

    /// Materialize due repeating registrations into delayed entries.
    ///
    /// A registration whose previous fire is still leased is left alone;
    /// the next fire is scheduled only after the lock is released.
    fn materialize_repeats(&self, now: DateTime<Utc>) {
        let due: Vec<JobUuid> = self
            .repeats
            .iter()
            .filter(|entry| entry.value().next_fire <= now)
            .map(|entry| entry.key().clone())
            .collect();

        for uuid in due {
            if self.leased.contains_key(&uuid) || self.live.contains_key(&uuid) {
                continue;
            }
            let Some(mut state) = self.repeats.get_mut(&uuid) else {
                continue;
            };
            let fire_at = state.next_fire;
            let token = state.token.clone();
            let Ok(schedule) = planner::parse_cron(&state.options.cron_expression) else {
                tracing::error!(job_uuid = %uuid, "queue: repeat has unparsable expression, dropping");
                drop(state);
                self.repeats.remove(&uuid);
                continue;
            };
            match schedule.after(&now).next() {
                Some(next) if state.options.end_date.map(|end| next <= end).unwrap_or(true) => {
                    state.next_fire = next;
                    drop(state);
                }
                _ => {
                    // No further occurrence within bounds; this is the
                    // registration's final fire.
                    drop(state);
                    self.repeats.remove(&uuid);
                }
            }
            self.push_delayed(token, fire_at, 0);
        }
    }

    fn pop_due(&self, now: DateTime<Utc>) -> Option<DelayedEntry> {
        let mut heap = self.delayed.lock();
        let mut postponed = Vec::new();
        let result = loop {
            let Some(head) = heap.peek() else {
                break None;
            };
            if head.run_at > now {
                break None;
            }
            let entry = heap.pop().expect("peeked entry exists");
            // Ghost entries: replaced or cancelled identities.
            let current = self.live.get(&entry.token.job_uuid).map(|g| *g);
            if current != Some(entry.generation) {
                continue;
            }
            // A fire of this identity is still in flight; hold the entry
            // back until its lease is released.
            if self.leased.contains_key(&entry.token.job_uuid) {
                postponed.push(entry);
                continue;
            }
            self.live.remove(&entry.token.job_uuid);
            break Some(entry);
        };
        for entry in postponed {
            heap.push(entry);
        }
        result
    }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    async fn enqueue_delayed(
        &self,
        token: QueueToken,
        run_at: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        check_not_past(run_at, Utc::now())?;
        self.push_delayed(token, run_at, 0);
        Ok(())
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
        self.repeats.insert(
            token.job_uuid.clone(),
            RepeatState {
                token,
                options,
                next_fire,
            },
        );
        Ok(())
    }

    async fn cancel(&self, job_uuid: &JobUuid) -> Result<(), QueueError> {
        self.live.remove(job_uuid);
        self.repeats.remove(job_uuid);
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<LeasedToken>, QueueError> {
        let now = Utc::now();
        self.reclaim_stalled(now);
        self.materialize_repeats(now);

        let Some(entry) = self.pop_due(now) else {
            return Ok(None);
        };

        let lease_id = Uuid::new_v4().to_string();
        let expires_at = now + Duration::milliseconds(self.settings.lock_duration_ms as i64);
        self.leases.insert(
            lease_id.clone(),
            Lease {
                token: entry.token.clone(),
                attempt: entry.attempt,
                scheduled_for: entry.run_at,
                expires_at,
            },
        );
        self.leased
            .insert(entry.token.job_uuid.clone(), lease_id.clone());

        Ok(Some(LeasedToken {
            token: entry.token,
            lease_id,
            attempt: entry.attempt,
            scheduled_for: entry.run_at,
            lease_expires_at: expires_at,
        }))
    }

    async fn renew(&self, lease: &LeasedToken) -> Result<(), QueueError> {
        let Some(mut entry) = self.leases.get_mut(&lease.lease_id) else {
            return Err(QueueError::Backend(format!(
                "lease {} no longer held",
                lease.lease_id
            )));
        };
        entry.expires_at =
            Utc::now() + Duration::milliseconds(self.settings.lock_duration_ms as i64);
        Ok(())
    }

    async fn complete(&self, lease: &LeasedToken) -> Result<(), QueueError> {
        if self.leases.remove(&lease.lease_id).is_some() {
            self.leased
                .remove_if(&lease.token.job_uuid, |_, id| *id == lease.lease_id);
            let _ = self
                .events
                .send(QueueEvent::Completed(lease.token.job_uuid.clone()));
        }
        Ok(())
    }

    async fn retry(&self, lease: &LeasedToken, reason: &str) -> Result<(), QueueError> {
        if self.leases.remove(&lease.lease_id).is_none() {
            // Lease already expired and was reclaimed; nothing to do.
            return Ok(());
        }
        self.leased
            .remove_if(&lease.token.job_uuid, |_, id| *id == lease.lease_id);

        let next_attempt = lease.attempt + 1;
        if next_attempt >= self.settings.attempts {
            tracing::warn!(
                job_uuid = %lease.token.job_uuid,
                attempts = next_attempt,
                reason,
                "queue: token exhausted its delivery attempts"
            );
            let _ = self
                .events
                .send(QueueEvent::Failed(lease.token.job_uuid.clone()));
            return Ok(());
        }

        let delay = retry_delay_ms(self.settings.backoff_initial_ms, lease.attempt);
        let run_at = Utc::now() + Duration::milliseconds(delay as i64);
        tracing::debug!(
            job_uuid = %lease.token.job_uuid,
            attempt = next_attempt,
            delay_ms = delay,
            reason,
            "queue: token scheduled for retry"
        );
        self.push_delayed(lease.token.clone(), run_at, next_attempt);
        Ok(())
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        Ok((self.live.len() + self.repeats.len()) as u64)
    }

    async fn ping(&self) -> Result<(), QueueError> {
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JobId;

    fn fast_settings() -> QueueSettings {
        QueueSettings {
            attempts: 3,
            backoff_initial_ms: 10,
            lock_duration_ms: 30_000,
            lock_renewal_ms: 15_000,
            ..QueueSettings::default()
        }
    }

    fn token(id: i64) -> QueueToken {
        QueueToken {
            job_id: JobId(id),
            job_uuid: JobUuid::new(),
        }
    }

    #[tokio::test]
    async fn delayed_token_becomes_due() {
        let queue = MemoryQueue::new(fast_settings());
        let t = token(1);
        queue
            .enqueue_delayed(t.clone(), Utc::now() + Duration::milliseconds(50))
            .await
            .unwrap();

        assert!(queue.dequeue().await.unwrap().is_none());

        tokio::time::sleep(std::time::Duration::from_millis(80)).await;
        let lease = queue.dequeue().await.unwrap().expect("token is due");
        assert_eq!(lease.token, t);
        assert_eq!(lease.attempt, 0);
    }

    #[tokio::test]
    async fn rejects_past_schedule() {
        let queue = MemoryQueue::new(fast_settings());
        let result = queue
            .enqueue_delayed(token(1), Utc::now() - Duration::seconds(10))
            .await;
        assert!(matches!(result, Err(QueueError::PastSchedule(_))));
    }

    #[tokio::test]
    async fn enqueue_replaces_entry_with_same_identity() {
        let queue = MemoryQueue::new(fast_settings());
        let t = token(1);
        let now = Utc::now();
        queue.enqueue_delayed(t.clone(), now).await.unwrap();
        queue
            .enqueue_delayed(t.clone(), now + Duration::milliseconds(20))
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        // Only one live entry survives the replacement.
        let first = queue.dequeue().await.unwrap().expect("one token");
        queue.complete(&first).await.unwrap();
        assert!(queue.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancel_removes_delayed_and_repeating() {
        let queue = MemoryQueue::new(fast_settings());
        let t = token(1);
        queue.enqueue_delayed(t.clone(), Utc::now()).await.unwrap();
        queue
            .enqueue_repeating(
                t.clone(),
                RepeatOptions {
                    cron_expression: "* * * * *".to_string(),
                    start_date: Utc::now() - Duration::days(1),
                    end_date: None,
                },
            )
            .await
            .unwrap();

        queue.cancel(&t.job_uuid).await.unwrap();
        // Idempotent.
        queue.cancel(&t.job_uuid).await.unwrap();

        assert_eq!(queue.depth().await.unwrap(), 0);
        assert!(queue.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn repeat_materializes_when_due() {
        let queue = MemoryQueue::new(fast_settings());
        let t = token(1);
        queue
            .enqueue_repeating(
                t.clone(),
                RepeatOptions {
                    // Every minute; first fire forced due below.
                    cron_expression: "* * * * *".to_string(),
                    start_date: Utc::now() - Duration::days(1),
                    end_date: None,
                },
            )
            .await
            .unwrap();

        // Force the registration due.
        queue.repeats.get_mut(&t.job_uuid).unwrap().next_fire =
            Utc::now() - Duration::seconds(1);

        let lease = queue.dequeue().await.unwrap().expect("repeat fired");
        assert_eq!(lease.token, t);
        // Registration is still live for the next occurrence.
        assert!(queue.repeats.contains_key(&t.job_uuid));
    }

    #[tokio::test]
    async fn no_second_fire_while_lease_is_held() {
        let queue = MemoryQueue::new(fast_settings());
        let t = token(1);
        queue
            .enqueue_repeating(
                t.clone(),
                RepeatOptions {
                    cron_expression: "* * * * *".to_string(),
                    start_date: Utc::now() - Duration::days(1),
                    end_date: None,
                },
            )
            .await
            .unwrap();
        queue.repeats.get_mut(&t.job_uuid).unwrap().next_fire =
            Utc::now() - Duration::seconds(1);

        let lease = queue.dequeue().await.unwrap().expect("first fire");
        // Force the next occurrence due while the first is in flight.
        queue.repeats.get_mut(&t.job_uuid).unwrap().next_fire =
            Utc::now() - Duration::seconds(1);
        assert!(queue.dequeue().await.unwrap().is_none());

        queue.complete(&lease).await.unwrap();
        let second = queue.dequeue().await.unwrap();
        assert!(second.is_some());
    }

    #[tokio::test]
    async fn retry_backs_off_and_exhausts() {
        let queue = MemoryQueue::new(fast_settings());
        let mut events = queue.events();
        let t = token(1);
        queue.enqueue_delayed(t.clone(), Utc::now()).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let first = queue.dequeue().await.unwrap().expect("attempt 0");
        queue.retry(&first, "boom").await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        let second = queue.dequeue().await.unwrap().expect("attempt 1");
        assert_eq!(second.attempt, 1);
        queue.retry(&second, "boom").await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(60)).await;
        let third = queue.dequeue().await.unwrap().expect("attempt 2");
        assert_eq!(third.attempt, 2);
        // attempts = 3: this retry exhausts the token.
        queue.retry(&third, "boom").await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(120)).await;
        assert!(queue.dequeue().await.unwrap().is_none());
        // Failed event observed.
        let mut saw_failed = false;
        while let Ok(event) = events.try_recv() {
            if event == QueueEvent::Failed(t.job_uuid.clone()) {
                saw_failed = true;
            }
        }
        assert!(saw_failed);
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimed_as_stalled() {
        let settings = QueueSettings {
            lock_duration_ms: 20,
            lock_renewal_ms: 10,
            ..fast_settings()
        };
        let queue = MemoryQueue::new(settings);
        let mut events = queue.events();
        let t = token(1);
        queue.enqueue_delayed(t.clone(), Utc::now()).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let lease = queue.dequeue().await.unwrap().expect("leased");

        // Let the lease expire without completing.
        tokio::time::sleep(std::time::Duration::from_millis(40)).await;
        let redelivered = queue.dequeue().await.unwrap().expect("redelivered");
        assert_eq!(redelivered.token, t);
        assert_eq!(redelivered.attempt, lease.attempt);

        let mut saw_stalled = false;
        while let Ok(event) = events.try_recv() {
            if event == QueueEvent::Stalled(t.job_uuid.clone()) {
                saw_stalled = true;
            }
        }
        assert!(saw_stalled);

        // The original lease is dead; completing it is a no-op and the
        // redelivered lease still works.
        queue.complete(&lease).await.unwrap();
        queue.complete(&redelivered).await.unwrap();
    }

    #[tokio::test]
    async fn renew_extends_the_lease() {
        let settings = QueueSettings {
            lock_duration_ms: 60,
            lock_renewal_ms: 20,
            ..fast_settings()
        };
        let queue = MemoryQueue::new(settings);
        let t = token(1);
        queue.enqueue_delayed(t, Utc::now()).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let lease = queue.dequeue().await.unwrap().expect("leased");

        for _ in 0..3 {
            tokio::time::sleep(std::time::Duration::from_millis(30)).await;
            queue.renew(&lease).await.unwrap();
        }
        // Still held: no redelivery happened.
        assert!(queue.dequeue().await.unwrap().is_none());
        queue.complete(&lease).await.unwrap();
    }

    #[tokio::test]
    async fn repeat_with_exhausted_end_date_is_rejected() {
        let queue = MemoryQueue::new(fast_settings());
        let result = queue
            .enqueue_repeating(
                token(1),
                RepeatOptions {
                    cron_expression: "0 12 * * *".to_string(),
                    start_date: Utc::now() - Duration::days(30),
                    end_date: Some(Utc::now() - Duration::days(20)),
                },
            )
            .await;
        assert!(matches!(result, Err(QueueError::PastSchedule(_))));
    }
}
