//! End-to-end scheduling flows over the public API: an in-memory queue,
//! an in-memory SQLite store, and a scripted target executor.

use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;

use cronrelay_runtime::config::{Config, QueueBackendKind};
use cronrelay_runtime::manager::SqliteStore;
use cronrelay_runtime::types::Frequency;
use cronrelay_runtime::worker::{CallOutcome, ExecutorError, TargetExecutor};
use cronrelay_runtime::{
    AccessContext, ExecutionRecorder, ExecutionStatus, Job, JobManager, JobRequest, JobStatus,
    MemoryQueue, Page, QueueBackend, RateLimiter, ResponseProcessor, RuntimeError, ScheduleRequest,
    TimePlanner, Worker,
};

struct ScriptedExecutor {
    results: Mutex<Vec<Result<CallOutcome, ExecutorError>>>,
}

impl ScriptedExecutor {
    fn new(results: Vec<Result<CallOutcome, ExecutorError>>) -> Self {
        Self {
            results: Mutex::new(results),
        }
    }

    fn ok() -> Result<CallOutcome, ExecutorError> {
        Ok(CallOutcome {
            status: 200,
            headers: HashMap::new(),
            body: serde_json::json!({"ok": true}),
        })
    }
}

#[async_trait]
impl TargetExecutor for ScriptedExecutor {
    async fn execute(&self, _job: &Job) -> Result<CallOutcome, ExecutorError> {
        let mut results = self.results.lock();
        if results.is_empty() {
            Self::ok()
        } else {
            results.remove(0)
        }
    }
}

struct Rig {
    manager: Arc<JobManager>,
    queue: Arc<MemoryQueue>,
    worker: Worker,
    limiter: Arc<RateLimiter>,
}

fn rig(results: Vec<Result<CallOutcome, ExecutorError>>) -> Rig {
    let mut config = Config::default();
    config.queue.backend = QueueBackendKind::Memory;
    config.queue.backoff_initial_ms = 5;

    let store = Arc::new(SqliteStore::open_in_memory(&config.database).unwrap());
    let queue = Arc::new(MemoryQueue::new(config.queue.clone()));
    let planner = TimePlanner::new(config.timezone.clone());
    let manager = Arc::new(JobManager::new(
        store.clone(),
        store,
        queue.clone(),
        planner,
        config.clone(),
    ));
    let limiter = Arc::new(RateLimiter::new(config.rate_limiting.clone()));
    let processor = Arc::new(ResponseProcessor::new(config.response_handling.clone(), None));
    let recorder = Arc::new(ExecutionRecorder::new(100));
    let worker = Worker::new(
        queue.clone(),
        manager.clone(),
        limiter.clone(),
        processor,
        Arc::new(ScriptedExecutor::new(results)),
        recorder,
        config.worker.clone(),
        config.queue.clone(),
        Arc::new(Notify::new()),
    );
    Rig {
        manager,
        queue,
        worker,
        limiter,
    }
}

fn ctx() -> AccessContext {
    AccessContext::new("org1", "user1")
}

fn once_request() -> JobRequest {
    JobRequest {
        name: "ping".to_string(),
        prompt: "p".to_string(),
        target_api: "https://svc.example/ping".to_string(),
        headers: HashMap::new(),
        skill_id: None,
        metadata: serde_json::Map::new(),
        schedule: ScheduleRequest::Once {
            date: NaiveDate::from_ymd_opt(2030, 1, 1).unwrap(),
            time: "12:00".to_string(),
        },
        timezone: "UTC".to_string(),
        idempotency_key: None,
        max_requests_per_minute: None,
        max_size_bytes: None,
        compress_response: None,
        store_full_response: None,
    }
}

fn daily_ny_request() -> JobRequest {
    JobRequest {
        name: "daily-report".to_string(),
        prompt: "report".to_string(),
        schedule: ScheduleRequest::Recurring {
            frequency: Frequency::Daily,
            time: "09:30".to_string(),
            start_date: NaiveDate::from_ymd_opt(2030, 3, 1).unwrap(),
            end_date: None,
            days_of_week: vec![],
            day_of_month: None,
        },
        timezone: "America/New_York".to_string(),
        ..once_request()
    }
}

async fn drive_one(rig: &Rig) {
    tokio::time::sleep(std::time::Duration::from_millis(15)).await;
    let mut processed = rig.worker.process_next().await.unwrap();
    for _ in 0..50 {
        if processed {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        processed = rig.worker.process_next().await.unwrap();
    }
    panic!("no token became due");
}

#[tokio::test]
async fn one_shot_plans_enqueues_fires_and_completes() {
    let rig = rig(vec![ScriptedExecutor::ok()]);
    let job = rig.manager.create(once_request(), &ctx()).await.unwrap();

    assert_eq!(job.status, JobStatus::Active);
    assert_eq!(
        job.next_run_at.unwrap(),
        Utc.with_ymd_and_hms(2030, 1, 1, 12, 0, 0).unwrap()
    );
    assert_eq!(rig.queue.depth().await.unwrap(), 1);

    // Fire manually rather than waiting for 2030.
    rig.manager.trigger_now(job.id, &ctx()).await.unwrap();
    drive_one(&rig).await;

    let fired = rig.manager.get(job.id, &ctx()).await.unwrap();
    assert_eq!(fired.status, JobStatus::Completed);
    assert_eq!(fired.execution_count, 1);

    let (history, pagination) = rig
        .manager
        .history(job.id, &ctx(), &Page::default())
        .await
        .unwrap();
    assert_eq!(pagination.total, 1);
    assert_eq!(history[0].status, ExecutionStatus::Success);
    let response = history[0].response.as_ref().unwrap();
    assert_eq!(response.status_code, Some(200));
}

#[tokio::test]
async fn duplicate_creation_within_window_is_rejected() {
    let rig = rig(vec![]);
    rig.manager.create(once_request(), &ctx()).await.unwrap();

    let err = rig.manager.create(once_request(), &ctx()).await.unwrap_err();
    assert!(matches!(err, RuntimeError::Duplicate(_)));
    assert_eq!(err.status_code(), 409);
}

#[tokio::test]
async fn recurring_fire_advances_to_next_occurrence() {
    let rig = rig(vec![ScriptedExecutor::ok()]);
    let job = rig.manager.create(daily_ny_request(), &ctx()).await.unwrap();
    assert_eq!(job.schedule.cron_expression(), Some("30 14 * * *"));

    rig.manager.trigger_now(job.id, &ctx()).await.unwrap();
    drive_one(&rig).await;

    let fired = rig.manager.get(job.id, &ctx()).await.unwrap();
    assert_eq!(fired.status, JobStatus::Active);
    assert_eq!(fired.execution_count, 1);
    assert_eq!(fired.consecutive_failures, 0);
    let next = fired.next_run_at.unwrap();
    assert!(next > Utc::now());
    // Next fire is at the snapshotted UTC time.
    assert_eq!(
        (chrono::Timelike::hour(&next), chrono::Timelike::minute(&next)),
        (14, 30)
    );
}

#[tokio::test]
async fn pause_empties_queue_and_resume_requeues() {
    let rig = rig(vec![]);
    let job = rig.manager.create(daily_ny_request(), &ctx()).await.unwrap();
    assert_eq!(rig.queue.depth().await.unwrap(), 1);

    rig.manager.pause(job.id, &ctx()).await.unwrap();
    assert_eq!(rig.queue.depth().await.unwrap(), 0);
    assert!(rig.queue.dequeue().await.unwrap().is_none());

    let resumed = rig.manager.resume(job.id, &ctx()).await.unwrap();
    assert_eq!(resumed.status, JobStatus::Active);
    assert_eq!(rig.queue.depth().await.unwrap(), 1);
    assert!(resumed.next_run_at.unwrap() > Utc::now());
}

#[tokio::test]
async fn rate_limited_target_sets_backoff_and_denies_host() {
    let mut headers = HashMap::new();
    headers.insert("retry-after".to_string(), "30".to_string());
    let rig = rig(vec![Err(ExecutorError::Status {
        status: 429,
        headers,
        body: None,
    })]);
    let job = rig.manager.create(once_request(), &ctx()).await.unwrap();

    rig.manager.trigger_now(job.id, &ctx()).await.unwrap();
    drive_one(&rig).await;

    let (history, _) = rig
        .manager
        .history(job.id, &ctx(), &Page::default())
        .await
        .unwrap();
    assert_eq!(history[0].status, ExecutionStatus::RateLimited);

    // The host is in backoff for at least the advertised Retry-After.
    let until = rig.limiter.backoff_until("svc.example").unwrap();
    assert!(until >= Utc::now() + chrono::Duration::seconds(25));
}

#[tokio::test]
async fn statistics_reflect_fired_executions() {
    let rig = rig(vec![ScriptedExecutor::ok()]);
    let job = rig.manager.create(once_request(), &ctx()).await.unwrap();
    rig.manager.trigger_now(job.id, &ctx()).await.unwrap();
    drive_one(&rig).await;

    let stats = rig.manager.statistics(&ctx()).await.unwrap();
    assert_eq!(stats.executions_today, 1);
    assert_eq!(stats.executions_by_status.get("success"), Some(&1));
    assert_eq!(stats.success_rate, 1.0);
    assert_eq!(stats.jobs_by_status.get("completed"), Some(&1));
}

#[tokio::test]
async fn preview_and_trigger_do_not_disturb_schedule() {
    let rig = rig(vec![ScriptedExecutor::ok()]);
    let job = rig.manager.create(daily_ny_request(), &ctx()).await.unwrap();
    let planned = job.next_run_at;

    let preview = rig
        .manager
        .preview_next_runs(job.id, &ctx(), 3)
        .await
        .unwrap();
    assert_eq!(preview.len(), 3);
    assert_eq!(Some(preview[0]), planned);

    rig.manager.trigger_now(job.id, &ctx()).await.unwrap();
    let loaded = rig.manager.get(job.id, &ctx()).await.unwrap();
    assert_eq!(loaded.next_run_at, planned);
}
