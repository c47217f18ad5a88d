//! Job lifecycle manager.
//!
//! Authoritative over job and execution records. Every public operation
//! is tenant-scoped through an explicit `AccessContext`; a job belonging
//! to another org is indistinguishable from a missing one.

pub mod store;

pub use store::{
    ExecutionStore, JobFilters, JobSort, JobSortField, JobStore, SortOrder, SqliteStore,
};

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::Config;
use crate::planner::TimePlanner;
use crate::queue::{QueueBackend, QueueToken, RepeatOptions};
use crate::response::ProcessedResponse;
use crate::types::{
    AccessContext, Execution, ExecutionFailure, ExecutionStatus, Job, JobId, JobRequest,
    JobStatus, JobUpdate, Page, Pagination, RateLimitInfo, RateLimitSettings, RequestSnapshot,
    ResponseSettings, ResponseSnapshot, RuntimeError, Schedule,
};

/// Reaching this many consecutive failures forces `status = failed`.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Aggregate counters returned by `statistics`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Statistics {
    pub jobs_by_status: HashMap<String, u64>,
    pub executions_by_status: HashMap<String, u64>,
    pub executions_today: u64,
    /// Successful executions over all completed ones, 0.0..=1.0.
    pub success_rate: f64,
    pub average_duration_ms: f64,
}

/// The job lifecycle manager.
pub struct JobManager {
    jobs: Arc<dyn JobStore>,
    executions: Arc<dyn ExecutionStore>,
    queue: Arc<dyn QueueBackend>,
    planner: TimePlanner,
    config: Config,
}

impl JobManager {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        executions: Arc<dyn ExecutionStore>,
        queue: Arc<dyn QueueBackend>,
        planner: TimePlanner,
        config: Config,
    ) -> Self {
        Self {
            jobs,
            executions,
            queue,
            planner,
            config,
        }
    }

    // ── Public surface ────────────────────────────────────────────────

    /// Create a job: validate, suppress duplicates, plan, persist, enqueue.
    pub async fn create(
        &self,
        request: JobRequest,
        ctx: &AccessContext,
    ) -> Result<Job, RuntimeError> {
        self.validate_payload(&request.name, &request.prompt, &request.target_api)?;
        let timezone = if request.timezone.is_empty() {
            self.config.timezone.default.clone()
        } else {
            request.timezone.clone()
        };
        let schedule = self.planner.resolve_schedule(&request.schedule, &timezone)?;
        let fingerprint =
            Job::fingerprint(&ctx.org_id, &request.prompt, &request.target_api, &schedule);

        self.check_duplicates(ctx, request.idempotency_key.as_deref(), &fingerprint)
            .await?;

        let now = Utc::now();
        let next_run_at = self.planner.plan_first_fire(&schedule, &timezone, now)?;

        let defaults = &self.config.rate_limiting;
        let mut job = Job {
            id: JobId(0),
            job_uuid: Default::default(),
            idempotency_key: request.idempotency_key,
            org_id: ctx.org_id.clone(),
            project_id: ctx.project_id.clone(),
            created_by: ctx.user_id.clone(),
            name: request.name,
            prompt: request.prompt,
            target_api: request.target_api,
            headers: request.headers,
            skill_id: request.skill_id,
            metadata: request.metadata,
            schedule,
            user_timezone: timezone,
            status: JobStatus::Active,
            next_run_at: Some(next_run_at),
            last_run_at: None,
            execution_count: 0,
            consecutive_failures: 0,
            rate_limit: RateLimitSettings {
                max_requests_per_minute: request
                    .max_requests_per_minute
                    .unwrap_or(defaults.default_requests_per_minute),
                backoff_multiplier: defaults.backoff_multiplier,
                max_backoff_ms: defaults.max_backoff_ms,
                current_backoff_ms: 0,
                last_rate_limit_hit: None,
            },
            response: ResponseSettings {
                max_size_bytes: self.bounded_max_size(request.max_size_bytes)?,
                compress_response: request.compress_response.unwrap_or(true),
                store_full_response: request.store_full_response.unwrap_or(false),
            },
            job_fingerprint: fingerprint,
            created_at: now,
            updated_at: now,
        };

        job.id = self.jobs.insert_job(&job).await?;
        if let Err(e) = self.enqueue(&job).await {
            // Do not leave an orphaned record behind a failed enqueue.
            let _ = self.jobs.delete_job(job.id).await;
            return Err(e);
        }
        tracing::info!(
            job_id = %job.id,
            job_uuid = %job.job_uuid,
            org_id = %ctx.org_id,
            next_run_at = %next_run_at,
            "created job"
        );
        Ok(job)
    }

    pub async fn get(&self, id: JobId, ctx: &AccessContext) -> Result<Job, RuntimeError> {
        self.scoped(id, ctx).await
    }

    pub async fn list(
        &self,
        ctx: &AccessContext,
        filters: &JobFilters,
        page: &Page,
        sort: &JobSort,
    ) -> Result<(Vec<Job>, Pagination), RuntimeError> {
        let page = page.clamped();
        let (jobs, total) = self.jobs.list_jobs(&ctx.org_id, filters, &page, sort).await?;
        Ok((jobs, Pagination::new(&page, total)))
    }

    /// Patch a job. Payload fields apply directly; a schedule or timezone
    /// change revalidates, replans, and re-enqueues.
    pub async fn update(
        &self,
        id: JobId,
        ctx: &AccessContext,
        patch: JobUpdate,
    ) -> Result<Job, RuntimeError> {
        let mut job = self.scoped(id, ctx).await?;
        if job.status.is_terminal() {
            return Err(RuntimeError::InvalidTransition {
                from: job.status,
                action: "update".to_string(),
            });
        }

        let reschedule = patch.changes_schedule();
        if let Some(name) = &patch.name {
            job.name = name.clone();
        }
        if let Some(prompt) = &patch.prompt {
            job.prompt = prompt.clone();
        }
        if let Some(target_api) = &patch.target_api {
            job.target_api = target_api.clone();
        }
        self.validate_payload(&job.name, &job.prompt, &job.target_api)?;
        if let Some(headers) = patch.headers {
            job.headers = headers;
        }
        if let Some(skill_id) = patch.skill_id {
            job.skill_id = Some(skill_id);
        }
        if let Some(metadata) = patch.metadata {
            job.metadata = metadata;
        }
        if let Some(rpm) = patch.max_requests_per_minute {
            job.rate_limit.max_requests_per_minute = rpm;
        }
        if let Some(max_size) = patch.max_size_bytes {
            job.response.max_size_bytes = self.bounded_max_size(Some(max_size))?;
        }
        if let Some(compress) = patch.compress_response {
            job.response.compress_response = compress;
        }
        if let Some(store_full) = patch.store_full_response {
            job.response.store_full_response = store_full;
        }

        if reschedule {
            let timezone = patch.timezone.unwrap_or_else(|| job.user_timezone.clone());
            let schedule_request = match patch.schedule {
                Some(request) => request,
                None => return Err(RuntimeError::Validation(
                    "timezone change requires the schedule to be resubmitted".to_string(),
                )),
            };
            let schedule = self
                .planner
                .resolve_schedule(&schedule_request, &timezone)?;
            job.next_run_at =
                Some(self.planner.plan_first_fire(&schedule, &timezone, Utc::now())?);
            job.schedule = schedule;
            job.user_timezone = timezone;
        }
        job.job_fingerprint =
            Job::fingerprint(&job.org_id, &job.prompt, &job.target_api, &job.schedule);
        job.updated_at = Utc::now();
        self.jobs.update_job(&job).await?;

        if reschedule && job.status == JobStatus::Active {
            self.queue.cancel(&job.job_uuid).await?;
            self.enqueue(&job).await?;
        }
        Ok(job)
    }

    /// Remove a job, its queue entries, and its execution history.
    pub async fn delete(&self, id: JobId, ctx: &AccessContext) -> Result<(), RuntimeError> {
        let job = self.scoped(id, ctx).await?;
        self.queue.cancel(&job.job_uuid).await?;
        self.executions.delete_executions_for_job(job.id).await?;
        self.jobs.delete_job(job.id).await?;
        tracing::info!(job_id = %job.id, job_uuid = %job.job_uuid, "deleted job");
        Ok(())
    }

    pub async fn pause(&self, id: JobId, ctx: &AccessContext) -> Result<Job, RuntimeError> {
        let mut job = self.scoped(id, ctx).await?;
        if job.status != JobStatus::Active {
            return Err(RuntimeError::InvalidTransition {
                from: job.status,
                action: "pause".to_string(),
            });
        }
        self.queue.cancel(&job.job_uuid).await?;
        job.status = JobStatus::Paused;
        job.updated_at = Utc::now();
        self.jobs.update_job(&job).await?;
        tracing::info!(job_id = %job.id, "paused job");
        Ok(job)
    }

    pub async fn resume(&self, id: JobId, ctx: &AccessContext) -> Result<Job, RuntimeError> {
        let mut job = self.scoped(id, ctx).await?;
        if job.status != JobStatus::Paused {
            return Err(RuntimeError::InvalidTransition {
                from: job.status,
                action: "resume".to_string(),
            });
        }
        // For one-time schedules the original instant must still be
        // ahead; recurring schedules resume at the next occurrence.
        let next = self
            .planner
            .plan_first_fire(&job.schedule, &job.user_timezone, Utc::now())?;
        job.next_run_at = Some(next);
        job.status = JobStatus::Active;
        job.updated_at = Utc::now();
        self.jobs.update_job(&job).await?;
        self.enqueue(&job).await?;
        tracing::info!(job_id = %job.id, next_run_at = %next, "resumed job");
        Ok(job)
    }

    /// Bring a failed job back to life.
    pub async fn retry(&self, id: JobId, ctx: &AccessContext) -> Result<Job, RuntimeError> {
        let mut job = self.scoped(id, ctx).await?;
        if job.status != JobStatus::Failed {
            return Err(RuntimeError::InvalidTransition {
                from: job.status,
                action: "retry".to_string(),
            });
        }
        job.consecutive_failures = 0;
        job.status = JobStatus::Active;
        let now = Utc::now();
        match &job.schedule {
            Schedule::Once { .. } => {
                // Fire immediately rather than at the original instant.
                job.next_run_at = Some(now);
            }
            Schedule::Recurring { .. } => {
                job.next_run_at =
                    Some(self
                        .planner
                        .plan_first_fire(&job.schedule, &job.user_timezone, now)?);
            }
        }
        job.updated_at = now;
        self.jobs.update_job(&job).await?;

        match &job.schedule {
            Schedule::Once { .. } => {
                self.queue
                    .enqueue_delayed(self.token(&job), now)
                    .await?;
            }
            Schedule::Recurring { .. } => {
                self.enqueue(&job).await?;
            }
        }
        tracing::info!(job_id = %job.id, "retrying failed job");
        Ok(job)
    }

    /// Enqueue an immediate manual fire without disturbing the planned
    /// `next_run_at`. The resulting execution is recorded by the worker.
    pub async fn trigger_now(&self, id: JobId, ctx: &AccessContext) -> Result<(), RuntimeError> {
        let job = self.scoped(id, ctx).await?;
        self.queue
            .enqueue_delayed(self.token(&job), Utc::now())
            .await?;
        tracing::info!(job_id = %job.id, "manually triggered job");
        Ok(())
    }

    pub async fn history(
        &self,
        id: JobId,
        ctx: &AccessContext,
        page: &Page,
    ) -> Result<(Vec<Execution>, Pagination), RuntimeError> {
        let job = self.scoped(id, ctx).await?;
        let page = page.clamped();
        let (executions, total) = self.executions.list_executions(job.id, &page).await?;
        Ok((executions, Pagination::new(&page, total)))
    }

    pub async fn statistics(&self, ctx: &AccessContext) -> Result<Statistics, RuntimeError> {
        let jobs_by_status = self.jobs.count_jobs_by_status(&ctx.org_id).await?;
        let executions_by_status = self
            .executions
            .count_executions_by_status(&ctx.org_id)
            .await?;
        let executions_today = self.executions.executions_today(&ctx.org_id).await?;
        let average_duration_ms = self
            .executions
            .average_duration_ms(&ctx.org_id)
            .await?
            .unwrap_or(0.0);

        let successes = executions_by_status
            .get(&ExecutionStatus::Success)
            .copied()
            .unwrap_or(0);
        let finished: u64 = executions_by_status
            .iter()
            .filter(|(status, _)| **status != ExecutionStatus::Pending)
            .map(|(_, count)| count)
            .sum();
        let success_rate = if finished > 0 {
            successes as f64 / finished as f64
        } else {
            0.0
        };

        Ok(Statistics {
            jobs_by_status: jobs_by_status
                .into_iter()
                .map(|(status, count)| (status.to_string(), count))
                .collect(),
            executions_by_status: executions_by_status
                .into_iter()
                .map(|(status, count)| (status.to_string(), count))
                .collect(),
            executions_today,
            success_rate,
            average_duration_ms,
        })
    }

    pub async fn preview_next_runs(
        &self,
        id: JobId,
        ctx: &AccessContext,
        n: usize,
    ) -> Result<Vec<DateTime<Utc>>, RuntimeError> {
        let job = self.scoped(id, ctx).await?;
        match &job.schedule {
            Schedule::Once { date_time } => Ok(if *date_time > Utc::now() {
                vec![*date_time]
            } else {
                Vec::new()
            }),
            Schedule::Recurring {
                cron_expression,
                start_date,
                end_date,
                ..
            } => {
                let start_bound = self
                    .planner
                    .day_start_utc(*start_date, &job.user_timezone)?;
                Ok(self.planner.next_n_fires(
                    cron_expression,
                    n,
                    Utc::now().max(start_bound),
                    *end_date,
                    &job.user_timezone,
                )?)
            }
        }
    }

    // ── Bookkeeping callbacks ─────────────────────────────────────────

    /// Force a job into `completed` (used when the worker defers
    /// bookkeeping to the manager).
    pub async fn mark_completed(&self, id: JobId) -> Result<(), RuntimeError> {
        if let Some(mut job) = self.jobs.get_job(id).await? {
            job.status = JobStatus::Completed;
            job.next_run_at = None;
            job.updated_at = Utc::now();
            self.jobs.update_job(&job).await?;
        }
        Ok(())
    }

    /// Force a job into `failed`.
    pub async fn mark_failed(&self, id: JobId) -> Result<(), RuntimeError> {
        if let Some(mut job) = self.jobs.get_job(id).await? {
            job.status = JobStatus::Failed;
            job.updated_at = Utc::now();
            self.jobs.update_job(&job).await?;
            self.queue.cancel(&job.job_uuid).await?;
        }
        Ok(())
    }

    // ── Worker-facing surface ─────────────────────────────────────────

    /// Resolve a token's job for a fire attempt. `None` when the job is
    /// gone; the caller skips quietly when the status is not `active`.
    pub async fn load_for_fire(&self, id: JobId) -> Result<Option<Job>, RuntimeError> {
        Ok(self.jobs.get_job(id).await?)
    }

    /// Open a pending execution record for an attempt.
    pub async fn open_execution(
        &self,
        job: &Job,
        scheduled_for: DateTime<Utc>,
        attempts: u32,
    ) -> Result<Execution, RuntimeError> {
        let mut execution = Execution::open(
            job.id,
            job.job_uuid.clone(),
            job.org_id.clone(),
            scheduled_for,
            RequestSnapshot {
                prompt: job.prompt.clone(),
                target_api: job.target_api.clone(),
                headers: job.headers.clone(),
                timeout_ms: self.config.http.timeout_ms,
            },
            attempts,
        );
        execution.id = self.executions.insert_execution(&execution).await?;
        Ok(execution)
    }

    /// Record a rate-limiter gate denial as a `rate_limited` execution.
    pub async fn record_rate_limit_denial(
        &self,
        job: &Job,
        scheduled_for: DateTime<Utc>,
        attempts: u32,
    ) -> Result<(), RuntimeError> {
        let mut execution = self.open_execution(job, scheduled_for, attempts).await?;
        execution.error = Some(ExecutionFailure {
            message: "rate limit gate denied the request".to_string(),
            code: Some("RATE_LIMITED".to_string()),
            retryable: true,
        });
        execution.close(ExecutionStatus::RateLimited);
        self.executions.update_execution(&execution).await?;
        Ok(())
    }

    /// Close a successful fire and advance the job.
    pub async fn complete_fire(
        &self,
        mut job: Job,
        mut execution: Execution,
        status_code: u16,
        headers: HashMap<String, String>,
        processed: ProcessedResponse,
        rate_limit_info: RateLimitInfo,
    ) -> Result<Job, RuntimeError> {
        let data_size = processed.compressed_size.unwrap_or(processed.original_size);
        execution.response = Some(ResponseSnapshot {
            status_code: Some(status_code),
            headers,
            data: Some(processed.data),
            data_size,
            is_compressed: processed.is_compressed,
            is_truncated: processed.is_truncated,
            storage_location: processed.storage_location,
        });
        execution.rate_limit_info = Some(rate_limit_info);
        execution.close(ExecutionStatus::Success);

        let now = Utc::now();
        job.last_run_at = Some(now);
        job.execution_count += 1;
        job.consecutive_failures = 0;
        match &job.schedule {
            Schedule::Once { .. } => {
                job.status = JobStatus::Completed;
                job.next_run_at = None;
            }
            Schedule::Recurring {
                cron_expression,
                start_date,
                end_date,
                ..
            } => {
                let start_bound = self
                    .planner
                    .day_start_utc(*start_date, &job.user_timezone)?;
                match self.planner.next_fire(
                    cron_expression,
                    now.max(start_bound),
                    *end_date,
                    &job.user_timezone,
                ) {
                    Ok(next) => job.next_run_at = Some(next),
                    Err(crate::types::PlannerError::EndDateExceeded) => {
                        job.status = JobStatus::Completed;
                        job.next_run_at = None;
                        self.queue.cancel(&job.job_uuid).await?;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        job.updated_at = now;
        self.executions.record_fire_outcome(&job, &execution).await?;
        Ok(job)
    }

    /// Close a failed fire, advance failure bookkeeping, and apply the
    /// consecutive-failure cap.
    pub async fn fail_fire(
        &self,
        mut job: Job,
        mut execution: Execution,
        status: ExecutionStatus,
        failure: ExecutionFailure,
        rate_limit_info: Option<RateLimitInfo>,
        response: Option<ResponseSnapshot>,
    ) -> Result<Job, RuntimeError> {
        execution.error = Some(failure);
        execution.rate_limit_info = rate_limit_info;
        execution.response = response;
        execution.close(status);

        let now = Utc::now();
        job.last_run_at = Some(now);
        job.execution_count += 1;
        job.consecutive_failures += 1;
        if status == ExecutionStatus::RateLimited {
            job.rate_limit.last_rate_limit_hit = Some(now);
        }
        if job.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
            tracing::warn!(
                job_id = %job.id,
                failures = job.consecutive_failures,
                "job reached the consecutive-failure cap"
            );
            job.status = JobStatus::Failed;
            job.next_run_at = None;
            self.queue.cancel(&job.job_uuid).await?;
        }
        job.updated_at = now;
        self.executions.record_fire_outcome(&job, &execution).await?;
        Ok(job)
    }

    /// TTL sweep for the execution collection.
    pub async fn purge_expired_executions(&self) -> Result<u64, RuntimeError> {
        let cutoff =
            Utc::now() - Duration::days(self.config.database.execution_retention_days as i64);
        Ok(self.executions.purge_executions_before(cutoff).await?)
    }

    // ── Internals ─────────────────────────────────────────────────────

    async fn scoped(&self, id: JobId, ctx: &AccessContext) -> Result<Job, RuntimeError> {
        match self.jobs.get_job(id).await? {
            Some(job) if job.org_id == ctx.org_id => Ok(job),
            _ => Err(RuntimeError::NotFound(format!("job {id}"))),
        }
    }

    fn token(&self, job: &Job) -> QueueToken {
        QueueToken {
            job_id: job.id,
            job_uuid: job.job_uuid.clone(),
        }
    }

    async fn enqueue(&self, job: &Job) -> Result<(), RuntimeError> {
        match &job.schedule {
            Schedule::Once { .. } => {
                let next = job.next_run_at.ok_or_else(|| {
                    RuntimeError::Internal("one-time job without a planned fire".to_string())
                })?;
                self.queue.enqueue_delayed(self.token(job), next).await?;
            }
            Schedule::Recurring {
                cron_expression,
                start_date,
                end_date,
                ..
            } => {
                let options = RepeatOptions {
                    cron_expression: cron_expression.clone(),
                    start_date: self
                        .planner
                        .day_start_utc(*start_date, &job.user_timezone)?,
                    end_date: self.planner.end_bound(*end_date, &job.user_timezone)?,
                };
                self.queue
                    .enqueue_repeating(self.token(job), options)
                    .await?;
            }
        }
        Ok(())
    }

    fn bounded_max_size(&self, requested: Option<usize>) -> Result<usize, RuntimeError> {
        let size = requested.unwrap_or(self.config.response_handling.default_max_size_bytes);
        if !(1024..=50 * 1024 * 1024).contains(&size) {
            return Err(RuntimeError::Validation(format!(
                "max_size_bytes {size} must be within 1 KiB..=50 MiB"
            )));
        }
        Ok(size)
    }

    fn validate_payload(
        &self,
        name: &str,
        prompt: &str,
        target_api: &str,
    ) -> Result<(), RuntimeError> {
        if name.trim().is_empty() {
            return Err(RuntimeError::Validation("name must not be empty".to_string()));
        }
        if prompt.is_empty() || prompt.len() > self.config.security.max_prompt_length {
            return Err(RuntimeError::Validation(format!(
                "prompt length must be within 1..={}",
                self.config.security.max_prompt_length
            )));
        }

        let url = url::Url::parse(target_api)
            .map_err(|e| RuntimeError::Validation(format!("invalid target_api: {e}")))?;
        let security = &self.config.security;
        if !security
            .allowed_schemes
            .iter()
            .any(|scheme| scheme == url.scheme())
        {
            return Err(RuntimeError::Validation(format!(
                "target_api scheme {} is not allowed",
                url.scheme()
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| RuntimeError::Validation("target_api has no host".to_string()))?;
        if security
            .blocked_domains
            .iter()
            .any(|blocked| domain_matches(host, blocked))
        {
            return Err(RuntimeError::Validation(format!(
                "target domain {host} is blocked"
            )));
        }
        if !security.allowed_domains.is_empty()
            && !security
                .allowed_domains
                .iter()
                .any(|allowed| domain_matches(host, allowed))
        {
            return Err(RuntimeError::Validation(format!(
                "target domain {host} is not in the allow list"
            )));
        }
        Ok(())
    }

    async fn check_duplicates(
        &self,
        ctx: &AccessContext,
        idempotency_key: Option<&str>,
        fingerprint: &str,
    ) -> Result<(), RuntimeError> {
        let policy = &self.config.duplicate_prevention;
        if !policy.enabled {
            return Ok(());
        }
        if policy.check_idempotency_key {
            if let Some(key) = idempotency_key {
                if let Some(existing) = self.jobs.find_by_idempotency_key(&ctx.org_id, key).await? {
                    return Err(RuntimeError::Duplicate(format!(
                        "idempotency key already used by job {}",
                        existing.id
                    )));
                }
            }
        }
        if policy.check_fingerprint {
            let since = Utc::now() - Duration::minutes(policy.window_minutes as i64);
            if let Some(existing) = self
                .jobs
                .find_by_fingerprint_since(fingerprint, since)
                .await?
            {
                return Err(RuntimeError::Duplicate(format!(
                    "matching job {} created within the duplicate window",
                    existing.id
                )));
            }
        }
        Ok(())
    }
}

fn domain_matches(host: &str, pattern: &str) -> bool {
    host == pattern || host.ends_with(&format!(".{pattern}"))
}
