//! Health monitoring: periodic probes of the queue backing store, the
//! persistence connection, and worker memory, plus rolling execution
//! counters.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Notify;

use crate::config::MonitoringSettings;
use crate::manager::JobStore;
use crate::queue::QueueBackend;
use crate::ratelimit::RateLimiter;

/// Rolling window of recent execution outcomes, fed by the worker.
pub struct ExecutionRecorder {
    window: usize,
    outcomes: RwLock<VecDeque<Outcome>>,
}

#[derive(Debug, Clone, Copy)]
struct Outcome {
    success: bool,
    duration_ms: u64,
}

impl ExecutionRecorder {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            outcomes: RwLock::new(VecDeque::new()),
        }
    }

    pub fn record(&self, success: bool, duration_ms: u64) {
        let mut outcomes = self.outcomes.write();
        if outcomes.len() >= self.window {
            outcomes.pop_front();
        }
        outcomes.push_back(Outcome {
            success,
            duration_ms,
        });
    }

    /// Fraction of failures in the window, 0.0 when empty.
    pub fn failure_rate(&self) -> f64 {
        let outcomes = self.outcomes.read();
        if outcomes.is_empty() {
            return 0.0;
        }
        let failures = outcomes.iter().filter(|o| !o.success).count();
        failures as f64 / outcomes.len() as f64
    }

    pub fn average_duration_ms(&self) -> f64 {
        let outcomes = self.outcomes.read();
        if outcomes.is_empty() {
            return 0.0;
        }
        let total: u64 = outcomes.iter().map(|o| o.duration_ms).sum();
        total as f64 / outcomes.len() as f64
    }

    pub fn sample_count(&self) -> usize {
        self.outcomes.read().len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// Outcome of a single probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn ok() -> Self {
        Self {
            ok: true,
            detail: None,
        }
    }

    fn failed(detail: String) -> Self {
        Self {
            ok: false,
            detail: Some(detail),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthMetrics {
    pub queue_depth: u64,
    pub failure_rate: f64,
    pub average_execution_ms: f64,
    pub memory_bytes: u64,
    pub rate_limit_trackers: usize,
    pub sampled_executions: usize,
}

/// Structured health document emitted by each probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub checks: HashMap<String, CheckResult>,
    pub metrics: HealthMetrics,
    pub timestamp: DateTime<Utc>,
}

/// Periodic health prober.
pub struct HealthMonitor {
    queue: Arc<dyn QueueBackend>,
    store: Arc<dyn JobStore>,
    limiter: Arc<RateLimiter>,
    recorder: Arc<ExecutionRecorder>,
    settings: MonitoringSettings,
    system: Mutex<sysinfo::System>,
    last_report: RwLock<Option<HealthReport>>,
}

impl HealthMonitor {
    pub fn new(
        queue: Arc<dyn QueueBackend>,
        store: Arc<dyn JobStore>,
        limiter: Arc<RateLimiter>,
        recorder: Arc<ExecutionRecorder>,
        settings: MonitoringSettings,
    ) -> Self {
        Self {
            queue,
            store,
            limiter,
            recorder,
            settings,
            system: Mutex::new(sysinfo::System::new()),
            last_report: RwLock::new(None),
        }
    }

    /// Run one probe round.
    pub async fn check(&self) -> HealthReport {
        let mut checks = HashMap::new();

        let queue_check = match self.queue.ping().await {
            Ok(()) => CheckResult::ok(),
            Err(e) => CheckResult::failed(e.to_string()),
        };
        let store_check = match self.store.ping().await {
            Ok(()) => CheckResult::ok(),
            Err(e) => CheckResult::failed(e.to_string()),
        };

        let queue_depth = self.queue.depth().await.unwrap_or(0);
        let memory_bytes = self.process_memory();
        let failure_rate = self.recorder.failure_rate();

        let depth_check = if queue_depth <= self.settings.max_queue_depth {
            CheckResult::ok()
        } else {
            CheckResult::failed(format!(
                "queue depth {queue_depth} exceeds {}",
                self.settings.max_queue_depth
            ))
        };
        let memory_check = if memory_bytes <= self.settings.max_memory_bytes {
            CheckResult::ok()
        } else {
            CheckResult::failed(format!(
                "worker memory {memory_bytes} exceeds {}",
                self.settings.max_memory_bytes
            ))
        };
        let failure_check = if failure_rate <= self.settings.max_failure_rate {
            CheckResult::ok()
        } else {
            CheckResult::failed(format!(
                "failure rate {failure_rate:.2} exceeds {:.2}",
                self.settings.max_failure_rate
            ))
        };

        checks.insert("queue".to_string(), queue_check);
        checks.insert("store".to_string(), store_check);
        checks.insert("queue_depth".to_string(), depth_check);
        checks.insert("memory".to_string(), memory_check);
        checks.insert("failure_rate".to_string(), failure_check);

        let status = if checks.values().all(|check| check.ok) {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };

        let report = HealthReport {
            status,
            checks,
            metrics: HealthMetrics {
                queue_depth,
                failure_rate,
                average_execution_ms: self.recorder.average_duration_ms(),
                memory_bytes,
                rate_limit_trackers: self.limiter.tracker_count(),
                sampled_executions: self.recorder.sample_count(),
            },
            timestamp: Utc::now(),
        };

        if report.status == HealthStatus::Unhealthy {
            let failing: Vec<&str> = report
                .checks
                .iter()
                .filter(|(_, check)| !check.ok)
                .map(|(name, _)| name.as_str())
                .collect();
            tracing::warn!(checks = ?failing, "health probe unhealthy");
        } else {
            tracing::debug!(queue_depth, "health probe ok");
        }

        *self.last_report.write() = Some(report.clone());
        report
    }

    /// Most recent probe result, if one has run.
    pub fn last_report(&self) -> Option<HealthReport> {
        self.last_report.read().clone()
    }

    /// Spawn the periodic probe loop.
    pub fn spawn(self: Arc<Self>, shutdown: Arc<Notify>) -> tokio::task::JoinHandle<()> {
        let interval = std::time::Duration::from_millis(self.settings.probe_interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.check().await;
                    }
                    _ = shutdown.notified() => {
                        tracing::info!("health monitor shutting down");
                        break;
                    }
                }
            }
        })
    }

    fn process_memory(&self) -> u64 {
        let mut system = self.system.lock();
        if let Ok(pid) = sysinfo::get_current_pid() {
            system.refresh_process(pid);
            if let Some(process) = system.process(pid) {
                return process.memory();
            }
        }
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DatabaseSettings, QueueSettings, RateLimitingSettings};
    use crate::manager::SqliteStore;
    use crate::queue::MemoryQueue;

    fn monitor() -> HealthMonitor {
        let queue = Arc::new(MemoryQueue::new(QueueSettings::default()));
        let store =
            Arc::new(SqliteStore::open_in_memory(&DatabaseSettings::default()).unwrap());
        let limiter = Arc::new(RateLimiter::new(RateLimitingSettings::default()));
        let recorder = Arc::new(ExecutionRecorder::new(100));
        HealthMonitor::new(queue, store, limiter, recorder, MonitoringSettings::default())
    }

    #[test]
    fn recorder_tracks_rolling_rates() {
        let recorder = ExecutionRecorder::new(4);
        assert_eq!(recorder.failure_rate(), 0.0);

        recorder.record(true, 100);
        recorder.record(false, 300);
        assert_eq!(recorder.failure_rate(), 0.5);
        assert_eq!(recorder.average_duration_ms(), 200.0);

        // Window evicts the oldest entries.
        for _ in 0..4 {
            recorder.record(true, 100);
        }
        assert_eq!(recorder.failure_rate(), 0.0);
        assert_eq!(recorder.sample_count(), 4);
    }

    #[tokio::test]
    async fn healthy_probe_with_live_backends() {
        let monitor = monitor();
        let report = monitor.check().await;
        assert_eq!(report.status, HealthStatus::Healthy);
        assert!(report.checks["queue"].ok);
        assert!(report.checks["store"].ok);
        assert!(monitor.last_report().is_some());
    }

    #[tokio::test]
    async fn high_failure_rate_flips_unhealthy() {
        let monitor = monitor();
        for _ in 0..10 {
            monitor.recorder.record(false, 50);
        }
        let report = monitor.check().await;
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert!(!report.checks["failure_rate"].ok);
        assert_eq!(report.metrics.failure_rate, 1.0);
    }

    #[tokio::test]
    async fn report_serializes_to_structured_document() {
        let monitor = monitor();
        let report = monitor.check().await;
        let json = serde_json::to_value(&report).unwrap();
        assert!(json["status"].is_string());
        assert!(json["checks"].is_object());
        assert!(json["metrics"]["queue_depth"].is_u64());
        assert!(json["timestamp"].is_string());
    }
}
