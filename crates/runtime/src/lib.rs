//! cronrelay-runtime
//!
//! Core of the cronrelay scheduling service: a multi-tenant, persistent
//! job scheduler that accepts one-time and recurring HTTP-callout jobs,
//! plans their firings in UTC, dispatches them through a shared work
//! queue, executes them with retries and rate-limit awareness, and
//! records every execution for audit.

pub mod config;
pub mod health;
pub mod manager;
pub mod planner;
pub mod queue;
pub mod ratelimit;
pub mod response;
pub mod types;
pub mod worker;

// Re-export commonly used types.
pub use config::{Config, QueueBackendKind};
pub use health::{ExecutionRecorder, HealthMonitor, HealthReport, HealthStatus};
pub use manager::{
    JobFilters, JobManager, JobSort, JobSortField, SortOrder, SqliteStore, Statistics,
    MAX_CONSECUTIVE_FAILURES,
};
pub use planner::TimePlanner;
pub use queue::{MemoryQueue, QueueBackend, QueueEvent, QueueToken, RedisQueue, RepeatOptions};
pub use ratelimit::{RateLimitPolicy, RateLimiter};
pub use response::{ExternalStorage, LocalStorage, ProcessedResponse, ResponseProcessor};
pub use types::{
    AccessContext, Envelope, Execution, ExecutionStatus, Job, JobId, JobRequest, JobStatus,
    JobUpdate, JobUuid, Page, Pagination, RuntimeError, Schedule, ScheduleRequest, ScheduleType,
};
pub use worker::{HttpExecutor, TargetExecutor, Worker};

use std::sync::Arc;
use tokio::sync::Notify;

/// A fully wired scheduling runtime: store, queue, manager, workers, and
/// health monitor sharing one shutdown signal.
pub struct Runtime {
    pub config: Config,
    pub manager: Arc<JobManager>,
    pub queue: Arc<dyn QueueBackend>,
    pub worker: Arc<Worker>,
    pub health: Arc<HealthMonitor>,
    pub shutdown: Arc<Notify>,
}

impl Runtime {
    /// Build the runtime from a validated configuration.
    pub async fn build(config: Config) -> Result<Self, RuntimeError> {
        config.validate()?;

        let store = Arc::new(SqliteStore::open(&config.database_path(), &config.database)?);

        let queue: Arc<dyn QueueBackend> = match config.queue.backend {
            QueueBackendKind::Memory => Arc::new(MemoryQueue::new(config.queue.clone())),
            QueueBackendKind::Redis => {
                Arc::new(RedisQueue::connect(config.queue.clone()).await?)
            }
        };

        let planner = TimePlanner::new(config.timezone.clone());
        let manager = Arc::new(JobManager::new(
            store.clone(),
            store.clone(),
            queue.clone(),
            planner,
            config.clone(),
        ));

        let limiter = Arc::new(RateLimiter::new(config.rate_limiting.clone()));
        let storage: Arc<dyn ExternalStorage> =
            Arc::new(LocalStorage::new(&config.response_handling.storage));
        let processor = Arc::new(ResponseProcessor::new(
            config.response_handling.clone(),
            Some(storage),
        ));
        let executor = Arc::new(
            HttpExecutor::new(config.http.clone())
                .map_err(|e| RuntimeError::Internal(e.to_string()))?,
        );
        let recorder = Arc::new(ExecutionRecorder::new(config.monitoring.metrics_window));
        let shutdown = Arc::new(Notify::new());

        let worker = Arc::new(Worker::new(
            queue.clone(),
            manager.clone(),
            limiter.clone(),
            processor,
            executor,
            recorder.clone(),
            config.worker.clone(),
            config.queue.clone(),
            shutdown.clone(),
        ));

        let health = Arc::new(HealthMonitor::new(
            queue.clone(),
            store,
            limiter,
            recorder,
            config.monitoring.clone(),
        ));

        Ok(Self {
            config,
            manager,
            queue,
            worker,
            health,
            shutdown,
        })
    }

    /// Start the worker loop, health probes, and the execution TTL sweep.
    pub fn start(&self) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();
        handles.push(tokio::spawn({
            let worker = self.worker.clone();
            async move { worker.run().await }
        }));
        handles.push(self.health.clone().spawn(self.shutdown.clone()));
        handles.push(self.spawn_cleanup());
        handles
    }

    fn spawn_cleanup(&self) -> tokio::task::JoinHandle<()> {
        let manager = self.manager.clone();
        let shutdown = self.shutdown.clone();
        let interval_ms = self.config.database.cleanup_interval_ms;
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_millis(interval_ms.max(1000)));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = manager.purge_expired_executions().await {
                            tracing::error!(error = %e, "execution TTL sweep failed");
                        }
                    }
                    _ = shutdown.notified() => break,
                }
            }
        })
    }

    /// Signal every component to stop.
    pub fn stop(&self) {
        self.shutdown.notify_waiters();
    }
}
