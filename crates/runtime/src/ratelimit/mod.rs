//! Per-target-host rate limiting.
//!
//! Trackers are process-local: each worker process keeps its own view of
//! a host's request window and backoff state. When workers are scaled
//! horizontally this is best-effort; a shared store is a future
//! extension.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::collections::VecDeque;

use crate::config::RateLimitingSettings;
use crate::types::RateLimitInfo;

/// Trackers idle for this long are garbage-collected.
const TRACKER_IDLE_TTL_SECS: i64 = 600;

/// The trailing window over which requests are counted.
const WINDOW_SECS: i64 = 60;

/// Per-job rate-limit view, assembled by the caller from the job's knobs
/// and the global defaults.
#[derive(Debug, Clone)]
pub struct RateLimitPolicy {
    pub max_requests_per_minute: u32,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
}

/// Per-host tracker state.
#[derive(Debug)]
struct HostTracker {
    /// Request timestamps, pruned to the trailing 60 s.
    requests: VecDeque<DateTime<Utc>>,
    current_backoff_ms: u64,
    backoff_until: Option<DateTime<Utc>>,
    consecutive_hits: u32,
    last_seen: DateTime<Utc>,
}

impl HostTracker {
    fn new(min_backoff_ms: u64, now: DateTime<Utc>) -> Self {
        Self {
            requests: VecDeque::new(),
            current_backoff_ms: min_backoff_ms,
            backoff_until: None,
            consecutive_hits: 0,
            last_seen: now,
        }
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - Duration::seconds(WINDOW_SECS);
        while let Some(front) = self.requests.front() {
            if *front < cutoff {
                self.requests.pop_front();
            } else {
                break;
            }
        }
    }

    fn advance_backoff(&mut self, policy: &RateLimitPolicy, min_backoff_ms: u64, now: DateTime<Utc>) {
        let current = self.current_backoff_ms.max(min_backoff_ms);
        let next = (current as f64 * policy.backoff_multiplier) as u64;
        self.current_backoff_ms = next.min(policy.max_backoff_ms);
        self.backoff_until = Some(now + Duration::milliseconds(self.current_backoff_ms as i64));
        self.consecutive_hits += 1;
    }
}

/// Decides per host whether an outbound request may proceed, and digests
/// rate-limit signals from responses.
pub struct RateLimiter {
    settings: RateLimitingSettings,
    trackers: DashMap<String, HostTracker>,
    last_sweep: Mutex<DateTime<Utc>>,
}

impl RateLimiter {
    pub fn new(settings: RateLimitingSettings) -> Self {
        Self {
            settings,
            trackers: DashMap::new(),
            last_sweep: Mutex::new(Utc::now()),
        }
    }

    /// Extract the host component of a target URL.
    pub fn host_of(target_url: &str) -> String {
        url::Url::parse(target_url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()))
            .unwrap_or_else(|| target_url.to_string())
    }

    /// Effective RPM for a host: per-host override beats the job value.
    fn effective_rpm(&self, host: &str, policy: &RateLimitPolicy) -> u32 {
        self.settings
            .per_host
            .get(host)
            .copied()
            .unwrap_or(policy.max_requests_per_minute)
    }

    /// May a request to `target_url` proceed right now?
    ///
    /// Denials advance the host's exponential backoff.
    pub fn allow(&self, target_url: &str, policy: &RateLimitPolicy) -> bool {
        self.allow_at(target_url, policy, Utc::now())
    }

    fn allow_at(&self, target_url: &str, policy: &RateLimitPolicy, now: DateTime<Utc>) -> bool {
        self.sweep_idle(now);
        let host = Self::host_of(target_url);
        let rpm = self.effective_rpm(&host, policy);
        let min_backoff = self.settings.min_backoff_ms;

        let mut tracker = self
            .trackers
            .entry(host.clone())
            .or_insert_with(|| HostTracker::new(min_backoff, now));
        tracker.last_seen = now;
        tracker.prune(now);

        if let Some(until) = tracker.backoff_until {
            if now < until {
                tracker.advance_backoff(policy, min_backoff, now);
                tracing::debug!(host = %host, until = %until, "rate limiter: in backoff window");
                return false;
            }
        }

        if tracker.requests.len() >= rpm as usize {
            tracker.advance_backoff(policy, min_backoff, now);
            tracing::debug!(
                host = %host,
                window = tracker.requests.len(),
                rpm,
                "rate limiter: window exhausted"
            );
            return false;
        }

        true
    }

    /// Record a performed request and digest the response headers.
    ///
    /// Returns the parsed rate-limit info for the execution record.
    pub fn observe(&self, target_url: &str, headers: &HashMap<String, String>) -> RateLimitInfo {
        self.observe_at(target_url, headers, Utc::now())
    }

    fn observe_at(
        &self,
        target_url: &str,
        headers: &HashMap<String, String>,
        now: DateTime<Utc>,
    ) -> RateLimitInfo {
        let info = self.parse_headers(headers);
        let host = Self::host_of(target_url);
        let min_backoff = self.settings.min_backoff_ms;

        let mut tracker = self
            .trackers
            .entry(host)
            .or_insert_with(|| HostTracker::new(min_backoff, now));
        tracker.last_seen = now;
        tracker.requests.push_back(now);
        tracker.prune(now);

        match info.remaining {
            Some(0) => {
                self.apply_limit_hit(&mut tracker, &info, now);
            }
            Some(_) => {
                tracker.consecutive_hits = 0;
                tracker.current_backoff_ms = min_backoff;
                tracker.backoff_until = None;
            }
            None => {}
        }

        info
    }

    /// Digest an explicit 429 response.
    pub fn observe_429(
        &self,
        target_url: &str,
        retry_after: Option<u64>,
        reset: Option<u64>,
    ) -> RateLimitInfo {
        self.observe_429_at(target_url, retry_after, reset, Utc::now())
    }

    fn observe_429_at(
        &self,
        target_url: &str,
        retry_after: Option<u64>,
        reset: Option<u64>,
        now: DateTime<Utc>,
    ) -> RateLimitInfo {
        let info = RateLimitInfo {
            remaining: Some(0),
            reset,
            retry_after,
        };
        let host = Self::host_of(target_url);
        let min_backoff = self.settings.min_backoff_ms;
        let mut tracker = self
            .trackers
            .entry(host)
            .or_insert_with(|| HostTracker::new(min_backoff, now));
        tracker.last_seen = now;
        tracker.requests.push_back(now);
        self.apply_limit_hit(&mut tracker, &info, now);
        info
    }

    /// Limit-hit branch: honor `Retry-After`, else the reset epoch, else
    /// the exponential rule.
    fn apply_limit_hit(&self, tracker: &mut HostTracker, info: &RateLimitInfo, now: DateTime<Utc>) {
        tracker.consecutive_hits += 1;
        if let Some(retry_after) = info.retry_after {
            tracker.backoff_until = Some(now + Duration::seconds(retry_after as i64));
            tracker.current_backoff_ms = (retry_after * 1000).max(self.settings.min_backoff_ms);
        } else if let Some(reset) = info.reset {
            let reset_at = DateTime::<Utc>::from_timestamp(reset as i64, 0).unwrap_or(now);
            if reset_at > now {
                tracker.backoff_until = Some(reset_at);
            }
        } else {
            let current = tracker.current_backoff_ms.max(self.settings.min_backoff_ms);
            let next = (current as f64 * self.settings.backoff_multiplier) as u64;
            tracker.current_backoff_ms = next.min(self.settings.max_backoff_ms);
            tracker.backoff_until =
                Some(now + Duration::milliseconds(tracker.current_backoff_ms as i64));
        }
    }

    fn parse_headers(&self, headers: &HashMap<String, String>) -> RateLimitInfo {
        let names = &self.settings.header_names;
        let lookup = |candidates: &[String]| -> Option<u64> {
            for name in candidates {
                if let Some(value) = headers.get(name.as_str()) {
                    if let Ok(parsed) = value.trim().parse::<u64>() {
                        return Some(parsed);
                    }
                }
            }
            None
        };
        RateLimitInfo {
            remaining: lookup(&names.remaining),
            reset: lookup(&names.reset),
            retry_after: lookup(&names.retry_after),
        }
    }

    /// Drop trackers idle for longer than the TTL. Invoked opportunistically
    /// from `allow`.
    fn sweep_idle(&self, now: DateTime<Utc>) {
        {
            let mut last = self.last_sweep.lock();
            if (now - *last).num_seconds() < TRACKER_IDLE_TTL_SECS {
                return;
            }
            *last = now;
        }
        self.trackers
            .retain(|_, tracker| (now - tracker.last_seen).num_seconds() < TRACKER_IDLE_TTL_SECS);
    }

    /// Number of live trackers (for health metrics).
    pub fn tracker_count(&self) -> usize {
        self.trackers.len()
    }

    /// Backoff deadline for a host, if any.
    pub fn backoff_until(&self, host: &str) -> Option<DateTime<Utc>> {
        self.trackers.get(host).and_then(|t| t.backoff_until)
    }

    #[cfg(test)]
    fn consecutive_hits(&self, host: &str) -> u32 {
        self.trackers
            .get(host)
            .map(|t| t.consecutive_hits)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(rpm: u32) -> RateLimitPolicy {
        RateLimitPolicy {
            max_requests_per_minute: rpm,
            backoff_multiplier: 2.0,
            max_backoff_ms: 300_000,
        }
    }

    fn limiter() -> RateLimiter {
        RateLimiter::new(RateLimitingSettings::default())
    }

    const URL: &str = "https://svc.example/ping";

    #[test]
    fn extracts_host_from_url() {
        assert_eq!(RateLimiter::host_of(URL), "svc.example");
        assert_eq!(
            RateLimiter::host_of("https://api.other.example:8443/v1/x?y=1"),
            "api.other.example"
        );
    }

    #[test]
    fn denies_after_window_is_full() {
        let limiter = limiter();
        let policy = policy(3);
        let now = Utc::now();

        for _ in 0..3 {
            assert!(limiter.allow_at(URL, &policy, now));
            limiter.observe_at(URL, &HashMap::new(), now);
        }
        // Request N+1 within the same window is denied.
        assert!(!limiter.allow_at(URL, &policy, now));
    }

    #[test]
    fn window_slides_after_sixty_seconds() {
        let limiter = limiter();
        let policy = policy(2);
        let start = Utc::now();

        limiter.observe_at(URL, &HashMap::new(), start);
        limiter.observe_at(URL, &HashMap::new(), start);
        assert!(!limiter.allow_at(URL, &policy, start));

        // The denial advanced backoff; jump past both the window and the
        // backoff deadline.
        let later = start + Duration::seconds(WINDOW_SECS + 600);
        assert!(limiter.allow_at(URL, &policy, later));
    }

    #[test]
    fn denial_advances_exponential_backoff() {
        let limiter = limiter();
        let policy = policy(0);
        let now = Utc::now();

        assert!(!limiter.allow_at(URL, &policy, now));
        let first = limiter.backoff_until("svc.example").unwrap();
        assert!(!limiter.allow_at(URL, &policy, now));
        let second = limiter.backoff_until("svc.example").unwrap();
        assert!(second > first);
        assert_eq!(limiter.consecutive_hits("svc.example"), 2);
    }

    #[test]
    fn remaining_zero_with_retry_after_sets_deadline() {
        let limiter = limiter();
        let now = Utc::now();
        let mut headers = HashMap::new();
        headers.insert("x-ratelimit-remaining".to_string(), "0".to_string());
        headers.insert("retry-after".to_string(), "30".to_string());

        let info = limiter.observe_at(URL, &headers, now);
        assert_eq!(info.remaining, Some(0));
        assert_eq!(info.retry_after, Some(30));

        let until = limiter.backoff_until("svc.example").unwrap();
        assert!(until >= now + Duration::seconds(30));
        assert!(!limiter.allow_at(URL, &policy(100), now + Duration::seconds(10)));
        assert!(limiter.allow_at(
            URL,
            &policy(100),
            now + Duration::seconds(WINDOW_SECS + 31)
        ));
    }

    #[test]
    fn remaining_zero_without_retry_after_honors_reset() {
        let limiter = limiter();
        let now = Utc::now();
        let reset = (now + Duration::seconds(45)).timestamp() as u64;
        let mut headers = HashMap::new();
        headers.insert("x-ratelimit-remaining".to_string(), "0".to_string());
        headers.insert("x-ratelimit-reset".to_string(), reset.to_string());

        limiter.observe_at(URL, &headers, now);
        let until = limiter.backoff_until("svc.example").unwrap();
        assert_eq!(until.timestamp() as u64, reset);
    }

    #[test]
    fn positive_remaining_resets_hits_and_backoff() {
        let limiter = limiter();
        let now = Utc::now();
        limiter.observe_429_at(URL, None, None, now);
        assert!(limiter.consecutive_hits("svc.example") > 0);

        let mut headers = HashMap::new();
        headers.insert("x-ratelimit-remaining".to_string(), "10".to_string());
        limiter.observe_at(URL, &headers, now + Duration::seconds(5));

        assert_eq!(limiter.consecutive_hits("svc.example"), 0);
        assert!(limiter.backoff_until("svc.example").is_none());
    }

    #[test]
    fn explicit_429_with_retry_after() {
        let limiter = limiter();
        let now = Utc::now();
        let info = limiter.observe_429_at(URL, Some(30), None, now);
        assert_eq!(info.retry_after, Some(30));

        let until = limiter.backoff_until("svc.example").unwrap();
        assert!(until >= now + Duration::seconds(30));
    }

    #[test]
    fn per_host_override_beats_job_policy() {
        let mut settings = RateLimitingSettings::default();
        settings.per_host.insert("svc.example".to_string(), 1);
        let limiter = RateLimiter::new(settings);
        let now = Utc::now();

        // Job allows 100 RPM but the host override caps at 1.
        limiter.observe_at(URL, &HashMap::new(), now);
        assert!(!limiter.allow_at(URL, &policy(100), now));
    }

    #[test]
    fn hosts_are_tracked_independently() {
        let limiter = limiter();
        let policy = policy(1);
        let now = Utc::now();

        limiter.observe_at(URL, &HashMap::new(), now);
        assert!(!limiter.allow_at(URL, &policy, now));
        assert!(limiter.allow_at("https://other.example/x", &policy, now));
        assert_eq!(limiter.tracker_count(), 2);
    }
}
