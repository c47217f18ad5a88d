//! Worker pipeline: pulls queue tokens and drives each fire through
//! rate-limit gate → execution open → HTTP call → response processing →
//! execution close → job advance.

pub mod executor;

pub use executor::{CallOutcome, ExecutorError, HttpExecutor, TargetExecutor};

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Notify, Semaphore};
use tokio::time::{interval, Duration};

use crate::config::{QueueSettings, WorkerSettings};
use crate::health::ExecutionRecorder;
use crate::manager::JobManager;
use crate::queue::{LeasedToken, QueueBackend};
use crate::ratelimit::{RateLimitPolicy, RateLimiter};
use crate::response::ResponseProcessor;
use crate::types::{
    ExecutionFailure, ExecutionStatus, Job, JobStatus, RateLimitInfo, ResponseSnapshot,
    RuntimeError,
};

/// How a processed token is acknowledged to the queue.
enum Ack {
    /// Consume the token; it will not be redelivered.
    Consume,
    /// Release for redelivery under the queue's retry policy.
    Retry(String),
}

/// A worker processing tokens from the shared queue.
pub struct Worker {
    queue: Arc<dyn QueueBackend>,
    manager: Arc<JobManager>,
    limiter: Arc<RateLimiter>,
    processor: Arc<ResponseProcessor>,
    executor: Arc<dyn TargetExecutor>,
    recorder: Arc<ExecutionRecorder>,
    worker_settings: WorkerSettings,
    queue_settings: QueueSettings,
    semaphore: Arc<Semaphore>,
    shutdown: Arc<Notify>,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<dyn QueueBackend>,
        manager: Arc<JobManager>,
        limiter: Arc<RateLimiter>,
        processor: Arc<ResponseProcessor>,
        executor: Arc<dyn TargetExecutor>,
        recorder: Arc<ExecutionRecorder>,
        worker_settings: WorkerSettings,
        queue_settings: QueueSettings,
        shutdown: Arc<Notify>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(worker_settings.concurrency.max(1)));
        Self {
            queue,
            manager,
            limiter,
            processor,
            executor,
            recorder,
            worker_settings,
            queue_settings,
            semaphore,
            shutdown,
        }
    }

    /// Run the fetch loop until shutdown, then drain in-flight work.
    pub async fn run(self: Arc<Self>) {
        tracing::info!(
            concurrency = self.worker_settings.concurrency,
            "worker started"
        );
        let mut poll = interval(Duration::from_millis(self.worker_settings.poll_interval_ms));

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    Self::fill_slots(&self).await;
                }
                _ = self.shutdown.notified() => {
                    tracing::info!("worker stopping: no new tokens will be pulled");
                    break;
                }
            }
        }

        // Wait for in-flight fires, then abandon; their leases expire and
        // the tokens are redelivered on restart.
        let drain = self
            .semaphore
            .acquire_many(self.worker_settings.concurrency as u32);
        match tokio::time::timeout(
            Duration::from_millis(self.worker_settings.shutdown_timeout_ms),
            drain,
        )
        .await
        {
            Ok(_) => tracing::info!("worker shutdown complete"),
            Err(_) => tracing::warn!("worker shutdown timed out; abandoning in-flight work"),
        }
    }

    /// Pull tokens while concurrency slots and due work are available.
    async fn fill_slots(this: &Arc<Self>) {
        loop {
            let Ok(permit) = this.semaphore.clone().try_acquire_owned() else {
                return;
            };
            match this.queue.dequeue().await {
                Ok(Some(lease)) => {
                    let worker = this.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        worker.process_lease(lease).await;
                    });
                }
                Ok(None) => return,
                Err(e) => {
                    tracing::error!(error = %e, "failed to dequeue token");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    return;
                }
            }
        }
    }

    /// Dequeue and process a single token inline. Returns whether a token
    /// was available.
    pub async fn process_next(&self) -> Result<bool, RuntimeError> {
        match self.queue.dequeue().await {
            Ok(Some(lease)) => {
                self.process_lease(lease).await;
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn process_lease(&self, lease: LeasedToken) {
        let renewal = self.spawn_renewal(&lease);
        let ack = self.attempt(&lease).await;
        renewal.abort();

        let result = match ack {
            Ack::Consume => self.queue.complete(&lease).await,
            Ack::Retry(reason) => self.queue.retry(&lease, &reason).await,
        };
        if let Err(e) = result {
            tracing::error!(
                job_uuid = %lease.token.job_uuid,
                error = %e,
                "failed to acknowledge token"
            );
        }
    }

    fn spawn_renewal(&self, lease: &LeasedToken) -> tokio::task::JoinHandle<()> {
        let queue = self.queue.clone();
        let lease = lease.clone();
        let renewal_ms = self.queue_settings.lock_renewal_ms;
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(renewal_ms.max(1)));
            ticker.tick().await; // first tick is immediate
            loop {
                ticker.tick().await;
                if let Err(e) = queue.renew(&lease).await {
                    tracing::debug!(
                        job_uuid = %lease.token.job_uuid,
                        error = %e,
                        "lease renewal failed"
                    );
                    break;
                }
            }
        })
    }

    /// One attempt of one token.
    async fn attempt(&self, lease: &LeasedToken) -> Ack {
        // Resolve; consume quietly when the job is gone or not active.
        let job = match self.manager.load_for_fire(lease.token.job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                tracing::info!(
                    job_id = %lease.token.job_id,
                    "token references a deleted job, consuming"
                );
                return Ack::Consume;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to resolve job for token");
                return Ack::Retry("job resolution failed".to_string());
            }
        };
        if job.status != JobStatus::Active {
            tracing::info!(
                job_id = %job.id,
                status = %job.status,
                "job is not active, consuming token"
            );
            return Ack::Consume;
        }

        // Gate.
        let policy = RateLimitPolicy {
            max_requests_per_minute: job.rate_limit.max_requests_per_minute,
            backoff_multiplier: job.rate_limit.backoff_multiplier,
            max_backoff_ms: job.rate_limit.max_backoff_ms,
        };
        if !self.limiter.allow(&job.target_api, &policy) {
            if let Err(e) = self
                .manager
                .record_rate_limit_denial(&job, lease.scheduled_for, lease.attempt + 1)
                .await
            {
                tracing::error!(error = %e, "failed to record rate-limit denial");
            }
            return Ack::Retry("rate limiter denied the request".to_string());
        }

        // Open the execution record.
        let execution = match self
            .manager
            .open_execution(&job, lease.scheduled_for, lease.attempt + 1)
            .await
        {
            Ok(execution) => execution,
            Err(e) => {
                tracing::error!(error = %e, "failed to open execution record");
                return Ack::Retry("execution open failed".to_string());
            }
        };

        let started = std::time::Instant::now();
        let call = self.executor.execute(&job).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match call {
            Ok(outcome) => {
                let info = self.limiter.observe(&job.target_api, &outcome.headers);
                let processed = match self.processor.process(&outcome.body, &job.response).await {
                    Ok(processed) => processed,
                    Err(e) => {
                        self.recorder.record(false, elapsed_ms);
                        return self
                            .close_failed(
                                job,
                                execution,
                                ExecutionStatus::Failed,
                                ExecutionFailure {
                                    message: format!("response processing failed: {e}"),
                                    code: Some("RESPONSE_PROCESSING".to_string()),
                                    retryable: false,
                                },
                                None,
                                None,
                            )
                            .await;
                    }
                };
                match self
                    .manager
                    .complete_fire(job, execution, outcome.status, outcome.headers, processed, info)
                    .await
                {
                    Ok(job) => {
                        self.recorder.record(true, elapsed_ms);
                        tracing::info!(
                            job_id = %job.id,
                            status = %job.status,
                            duration_ms = elapsed_ms,
                            "fire succeeded"
                        );
                        Ack::Consume
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "failed to persist successful fire");
                        Ack::Retry("persistence failed".to_string())
                    }
                }
            }
            Err(error) => {
                self.recorder.record(false, elapsed_ms);
                self.handle_call_error(job, execution, error).await
            }
        }
    }

    async fn handle_call_error(
        &self,
        job: Job,
        execution: crate::types::Execution,
        error: ExecutorError,
    ) -> Ack {
        match error {
            ExecutorError::Status {
                status: 429,
                headers,
                body,
            } => {
                let retry_after = parse_header_u64(&headers, "retry-after");
                let reset = parse_header_u64(&headers, "x-ratelimit-reset");
                let info = self
                    .limiter
                    .observe_429(&job.target_api, retry_after, reset);
                let snapshot = ResponseSnapshot {
                    status_code: Some(429),
                    headers,
                    data: body,
                    ..Default::default()
                };
                self.close_failed(
                    job,
                    execution,
                    ExecutionStatus::RateLimited,
                    ExecutionFailure {
                        message: "target returned 429".to_string(),
                        code: Some("RATE_LIMITED".to_string()),
                        retryable: true,
                    },
                    Some(info),
                    Some(snapshot),
                )
                .await
            }
            ExecutorError::Timeout(timeout_ms) => {
                self.close_failed(
                    job,
                    execution,
                    ExecutionStatus::Timeout,
                    ExecutionFailure {
                        message: format!("request timed out after {timeout_ms} ms"),
                        code: Some("TIMEOUT".to_string()),
                        retryable: true,
                    },
                    None,
                    None,
                )
                .await
            }
            ExecutorError::Network(message) => {
                self.close_failed(
                    job,
                    execution,
                    ExecutionStatus::Failed,
                    ExecutionFailure {
                        message,
                        code: Some("NETWORK".to_string()),
                        retryable: true,
                    },
                    None,
                    None,
                )
                .await
            }
            ExecutorError::Status {
                status,
                headers,
                body,
            } => {
                let retryable = status >= 500;
                let snapshot = ResponseSnapshot {
                    status_code: Some(status),
                    headers,
                    data: body,
                    ..Default::default()
                };
                self.close_failed(
                    job,
                    execution,
                    ExecutionStatus::Failed,
                    ExecutionFailure {
                        message: format!("target returned HTTP {status}"),
                        code: Some(format!("HTTP_{status}")),
                        retryable,
                    },
                    None,
                    Some(snapshot),
                )
                .await
            }
            ExecutorError::TooLarge(limit) => {
                self.close_failed(
                    job,
                    execution,
                    ExecutionStatus::Failed,
                    ExecutionFailure {
                        message: format!("response exceeded {limit} bytes"),
                        code: Some("RESPONSE_TOO_LARGE".to_string()),
                        retryable: false,
                    },
                    None,
                    None,
                )
                .await
            }
            ExecutorError::Build(message) => {
                self.close_failed(
                    job,
                    execution,
                    ExecutionStatus::Failed,
                    ExecutionFailure {
                        message,
                        code: Some("REQUEST_BUILD".to_string()),
                        retryable: false,
                    },
                    None,
                    None,
                )
                .await
            }
        }
    }

    async fn close_failed(
        &self,
        job: Job,
        execution: crate::types::Execution,
        status: ExecutionStatus,
        failure: ExecutionFailure,
        rate_limit_info: Option<RateLimitInfo>,
        response: Option<ResponseSnapshot>,
    ) -> Ack {
        let retryable = failure.retryable;
        let message = failure.message.clone();
        match self
            .manager
            .fail_fire(job, execution, status, failure, rate_limit_info, response)
            .await
        {
            Ok(job) => {
                tracing::warn!(
                    job_id = %job.id,
                    status = %status,
                    failures = job.consecutive_failures,
                    "fire failed: {message}"
                );
                if job.status == JobStatus::Failed {
                    // The failure cap was reached; further deliveries
                    // would short-circuit anyway.
                    return Ack::Consume;
                }
                if retryable {
                    Ack::Retry(message)
                } else {
                    Ack::Consume
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to persist failed fire");
                Ack::Retry("persistence failed".to_string())
            }
        }
    }
}

fn parse_header_u64(headers: &HashMap<String, String>, name: &str) -> Option<u64> {
    headers.get(name).and_then(|value| value.trim().parse().ok())
}
