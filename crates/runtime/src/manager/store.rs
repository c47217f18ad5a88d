//! Persistent job and execution stores backed by SQLite.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::DatabaseSettings;
use crate::types::{
    Execution, ExecutionFailure, ExecutionId, ExecutionStatus, Job, JobId, JobStatus, JobUuid,
    Page, RateLimitInfo, RateLimitSettings, RequestSnapshot, ResponseSettings, ResponseSnapshot,
    Schedule, ScheduleType, StoreError,
};

/// Filters accepted by the job list query.
#[derive(Debug, Clone, Default)]
pub struct JobFilters {
    pub status: Option<JobStatus>,
    pub schedule_type: Option<ScheduleType>,
    pub project_id: Option<String>,
    /// Substring match on the job name.
    pub search: Option<String>,
    pub from_date: Option<DateTime<Utc>>,
    pub to_date: Option<DateTime<Utc>>,
}

/// Sortable job list columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobSortField {
    #[default]
    NextRunAt,
    CreatedAt,
    UpdatedAt,
    Name,
}

impl JobSortField {
    fn column(&self) -> &'static str {
        match self {
            JobSortField::NextRunAt => "next_run_at",
            JobSortField::CreatedAt => "created_at",
            JobSortField::UpdatedAt => "updated_at",
            JobSortField::Name => "name",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    fn keyword(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

/// Job list ordering; defaults to `next_run_at` ascending.
#[derive(Debug, Clone, Copy, Default)]
pub struct JobSort {
    pub field: JobSortField,
    pub order: SortOrder,
}

/// Durable job persistence.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert_job(&self, job: &Job) -> Result<JobId, StoreError>;
    async fn update_job(&self, job: &Job) -> Result<(), StoreError>;
    async fn get_job(&self, id: JobId) -> Result<Option<Job>, StoreError>;
    async fn get_job_by_uuid(&self, uuid: &JobUuid) -> Result<Option<Job>, StoreError>;
    async fn find_by_idempotency_key(
        &self,
        org_id: &str,
        key: &str,
    ) -> Result<Option<Job>, StoreError>;
    async fn find_by_fingerprint_since(
        &self,
        fingerprint: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError>;
    async fn list_jobs(
        &self,
        org_id: &str,
        filters: &JobFilters,
        page: &Page,
        sort: &JobSort,
    ) -> Result<(Vec<Job>, u64), StoreError>;
    async fn delete_job(&self, id: JobId) -> Result<bool, StoreError>;
    async fn count_jobs_by_status(&self, org_id: &str)
        -> Result<HashMap<JobStatus, u64>, StoreError>;
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Append-only execution persistence plus the transactional fire advance.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn insert_execution(&self, execution: &Execution) -> Result<ExecutionId, StoreError>;
    async fn update_execution(&self, execution: &Execution) -> Result<(), StoreError>;
    /// Persist the closed execution and the advanced job in one
    /// transaction, preserving the per-fire invariants.
    async fn record_fire_outcome(
        &self,
        job: &Job,
        execution: &Execution,
    ) -> Result<(), StoreError>;
    async fn list_executions(
        &self,
        job_id: JobId,
        page: &Page,
    ) -> Result<(Vec<Execution>, u64), StoreError>;
    async fn count_executions_by_status(
        &self,
        org_id: &str,
    ) -> Result<HashMap<ExecutionStatus, u64>, StoreError>;
    async fn executions_today(&self, org_id: &str) -> Result<u64, StoreError>;
    async fn average_duration_ms(&self, org_id: &str) -> Result<Option<f64>, StoreError>;
    async fn delete_executions_for_job(&self, job_id: JobId) -> Result<u64, StoreError>;
    /// TTL sweep: drop executions created before the cutoff.
    async fn purge_executions_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// SQLite-backed store implementing both persistence traits.
pub struct SqliteStore {
    conn: tokio::sync::Mutex<rusqlite::Connection>,
    jobs_table: String,
    executions_table: String,
}

impl SqliteStore {
    /// Open (or create) the store at the given path.
    pub fn open(
        path: &std::path::Path,
        settings: &DatabaseSettings,
    ) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Sqlite(format!("create dir: {e}")))?;
        }
        let conn = rusqlite::Connection::open(path)
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        Self::with_connection(conn, settings)
    }

    /// Open an in-memory store (useful for tests).
    pub fn open_in_memory(settings: &DatabaseSettings) -> Result<Self, StoreError> {
        let conn = rusqlite::Connection::open_in_memory()
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        Self::with_connection(conn, settings)
    }

    fn with_connection(
        conn: rusqlite::Connection,
        settings: &DatabaseSettings,
    ) -> Result<Self, StoreError> {
        // Create tables before wrapping in the Mutex.
        Self::init_schema(&conn, settings)?;
        Ok(Self {
            conn: tokio::sync::Mutex::new(conn),
            jobs_table: settings.jobs_table.clone(),
            executions_table: settings.executions_table.clone(),
        })
    }

    fn init_schema(
        conn: &rusqlite::Connection,
        settings: &DatabaseSettings,
    ) -> Result<(), StoreError> {
        let jobs = &settings.jobs_table;
        let executions = &settings.executions_table;
        let schema = format!(
            "CREATE TABLE IF NOT EXISTS {jobs} (
                id                   INTEGER PRIMARY KEY AUTOINCREMENT,
                job_uuid             TEXT NOT NULL UNIQUE,
                idempotency_key      TEXT,
                org_id               TEXT NOT NULL,
                project_id           TEXT,
                created_by           TEXT NOT NULL,
                name                 TEXT NOT NULL,
                prompt               TEXT NOT NULL,
                target_api           TEXT NOT NULL,
                headers_json         TEXT NOT NULL DEFAULT '{{}}',
                skill_id             TEXT,
                metadata_json        TEXT NOT NULL DEFAULT '{{}}',
                schedule_json        TEXT NOT NULL,
                schedule_type        TEXT NOT NULL,
                user_timezone        TEXT NOT NULL,
                status               TEXT NOT NULL DEFAULT 'active',
                next_run_at          TEXT,
                last_run_at          TEXT,
                execution_count      INTEGER NOT NULL DEFAULT 0,
                consecutive_failures INTEGER NOT NULL DEFAULT 0,
                rate_limit_json      TEXT NOT NULL,
                response_json        TEXT NOT NULL,
                job_fingerprint      TEXT NOT NULL,
                created_at           TEXT NOT NULL,
                updated_at           TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_{jobs}_org_status_next
                ON {jobs}(org_id, status, next_run_at);
            CREATE INDEX IF NOT EXISTS idx_{jobs}_uuid_org
                ON {jobs}(job_uuid, org_id);
            CREATE INDEX IF NOT EXISTS idx_{jobs}_fingerprint_created
                ON {jobs}(job_fingerprint, created_at);
            CREATE INDEX IF NOT EXISTS idx_{jobs}_active_next
                ON {jobs}(next_run_at) WHERE status = 'active';
            CREATE INDEX IF NOT EXISTS idx_{jobs}_org_created
                ON {jobs}(org_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_{jobs}_org_skill_status
                ON {jobs}(org_id, skill_id, status);
            CREATE INDEX IF NOT EXISTS idx_{jobs}_org_project_status
                ON {jobs}(org_id, project_id, status);

            CREATE TABLE IF NOT EXISTS {executions} (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                execution_uuid  TEXT NOT NULL UNIQUE,
                job_id          INTEGER NOT NULL,
                job_uuid        TEXT NOT NULL,
                org_id          TEXT NOT NULL,
                scheduled_for   TEXT NOT NULL,
                executed_at     TEXT NOT NULL,
                completed_at    TEXT,
                duration_ms     INTEGER,
                request_json    TEXT NOT NULL,
                response_json   TEXT,
                status          TEXT NOT NULL,
                attempts        INTEGER NOT NULL,
                error_json      TEXT,
                rate_limit_json TEXT,
                created_at      TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_{executions}_job_executed
                ON {executions}(job_id, executed_at DESC);
            CREATE INDEX IF NOT EXISTS idx_{executions}_org_status_executed
                ON {executions}(org_id, status, executed_at DESC);
            CREATE INDEX IF NOT EXISTS idx_{executions}_uuid_executed
                ON {executions}(job_uuid, executed_at DESC);
            CREATE INDEX IF NOT EXISTS idx_{executions}_created
                ON {executions}(created_at);"
        );
        conn.execute_batch(&schema)
            .map_err(|e| StoreError::Sqlite(e.to_string()))
    }
}

fn fmt_dt(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_dt(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Serialization(format!("bad timestamp {raw}: {e}")))
}

fn parse_opt_dt(raw: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    raw.map(|s| parse_dt(&s)).transpose()
}

fn from_json<T: for<'de> Deserialize<'de>>(raw: &str) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn to_json<T: Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Raw job row as read from SQLite, before parsing.
struct RawJob {
    id: i64,
    job_uuid: String,
    idempotency_key: Option<String>,
    org_id: String,
    project_id: Option<String>,
    created_by: String,
    name: String,
    prompt: String,
    target_api: String,
    headers_json: String,
    skill_id: Option<String>,
    metadata_json: String,
    schedule_json: String,
    user_timezone: String,
    status: String,
    next_run_at: Option<String>,
    last_run_at: Option<String>,
    execution_count: i64,
    consecutive_failures: i64,
    rate_limit_json: String,
    response_json: String,
    job_fingerprint: String,
    created_at: String,
    updated_at: String,
}

const JOB_COLUMNS: &str = "id, job_uuid, idempotency_key, org_id, project_id, created_by, \
     name, prompt, target_api, headers_json, skill_id, metadata_json, schedule_json, \
     user_timezone, status, next_run_at, last_run_at, execution_count, \
     consecutive_failures, rate_limit_json, response_json, job_fingerprint, created_at, \
     updated_at";

fn read_raw_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawJob> {
    Ok(RawJob {
        id: row.get(0)?,
        job_uuid: row.get(1)?,
        idempotency_key: row.get(2)?,
        org_id: row.get(3)?,
        project_id: row.get(4)?,
        created_by: row.get(5)?,
        name: row.get(6)?,
        prompt: row.get(7)?,
        target_api: row.get(8)?,
        headers_json: row.get(9)?,
        skill_id: row.get(10)?,
        metadata_json: row.get(11)?,
        schedule_json: row.get(12)?,
        user_timezone: row.get(13)?,
        status: row.get(14)?,
        next_run_at: row.get(15)?,
        last_run_at: row.get(16)?,
        execution_count: row.get(17)?,
        consecutive_failures: row.get(18)?,
        rate_limit_json: row.get(19)?,
        response_json: row.get(20)?,
        job_fingerprint: row.get(21)?,
        created_at: row.get(22)?,
        updated_at: row.get(23)?,
    })
}

fn parse_job(raw: RawJob) -> Result<Job, StoreError> {
    let schedule: Schedule = from_json(&raw.schedule_json)?;
    Ok(Job {
        id: JobId(raw.id),
        job_uuid: JobUuid::from_string(raw.job_uuid),
        idempotency_key: raw.idempotency_key,
        org_id: raw.org_id,
        project_id: raw.project_id,
        created_by: raw.created_by,
        name: raw.name,
        prompt: raw.prompt,
        target_api: raw.target_api,
        headers: from_json(&raw.headers_json)?,
        skill_id: raw.skill_id,
        metadata: from_json(&raw.metadata_json)?,
        schedule,
        user_timezone: raw.user_timezone,
        status: raw
            .status
            .parse()
            .map_err(|e: String| StoreError::Serialization(e))?,
        next_run_at: parse_opt_dt(raw.next_run_at)?,
        last_run_at: parse_opt_dt(raw.last_run_at)?,
        execution_count: raw.execution_count.max(0) as u64,
        consecutive_failures: raw.consecutive_failures.max(0) as u32,
        rate_limit: from_json::<RateLimitSettings>(&raw.rate_limit_json)?,
        response: from_json::<ResponseSettings>(&raw.response_json)?,
        job_fingerprint: raw.job_fingerprint,
        created_at: parse_dt(&raw.created_at)?,
        updated_at: parse_dt(&raw.updated_at)?,
    })
}

struct RawExecution {
    id: i64,
    execution_uuid: String,
    job_id: i64,
    job_uuid: String,
    org_id: String,
    scheduled_for: String,
    executed_at: String,
    completed_at: Option<String>,
    duration_ms: Option<i64>,
    request_json: String,
    response_json: Option<String>,
    status: String,
    attempts: i64,
    error_json: Option<String>,
    rate_limit_json: Option<String>,
    created_at: String,
}

const EXECUTION_COLUMNS: &str = "id, execution_uuid, job_id, job_uuid, org_id, scheduled_for, \
     executed_at, completed_at, duration_ms, request_json, response_json, status, attempts, \
     error_json, rate_limit_json, created_at";

fn read_raw_execution(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawExecution> {
    Ok(RawExecution {
        id: row.get(0)?,
        execution_uuid: row.get(1)?,
        job_id: row.get(2)?,
        job_uuid: row.get(3)?,
        org_id: row.get(4)?,
        scheduled_for: row.get(5)?,
        executed_at: row.get(6)?,
        completed_at: row.get(7)?,
        duration_ms: row.get(8)?,
        request_json: row.get(9)?,
        response_json: row.get(10)?,
        status: row.get(11)?,
        attempts: row.get(12)?,
        error_json: row.get(13)?,
        rate_limit_json: row.get(14)?,
        created_at: row.get(15)?,
    })
}

fn parse_execution(raw: RawExecution) -> Result<Execution, StoreError> {
    Ok(Execution {
        id: ExecutionId(raw.id),
        execution_uuid: raw.execution_uuid,
        job_id: JobId(raw.job_id),
        job_uuid: JobUuid::from_string(raw.job_uuid),
        org_id: raw.org_id,
        scheduled_for: parse_dt(&raw.scheduled_for)?,
        executed_at: parse_dt(&raw.executed_at)?,
        completed_at: parse_opt_dt(raw.completed_at)?,
        duration_ms: raw.duration_ms.map(|v| v.max(0) as u64),
        request: from_json::<RequestSnapshot>(&raw.request_json)?,
        response: raw
            .response_json
            .as_deref()
            .map(from_json::<ResponseSnapshot>)
            .transpose()?,
        status: raw
            .status
            .parse()
            .map_err(|e: String| StoreError::Serialization(e))?,
        attempts: raw.attempts.max(0) as u32,
        error: raw
            .error_json
            .as_deref()
            .map(from_json::<ExecutionFailure>)
            .transpose()?,
        rate_limit_info: raw
            .rate_limit_json
            .as_deref()
            .map(from_json::<RateLimitInfo>)
            .transpose()?,
        created_at: parse_dt(&raw.created_at)?,
    })
}

fn update_job_row(
    conn: &rusqlite::Connection,
    table: &str,
    job: &Job,
) -> Result<(), StoreError> {
    let sql = format!(
        "UPDATE {table} SET
            idempotency_key = ?1, project_id = ?2, name = ?3, prompt = ?4,
            target_api = ?5, headers_json = ?6, skill_id = ?7, metadata_json = ?8,
            schedule_json = ?9, schedule_type = ?10, user_timezone = ?11, status = ?12,
            next_run_at = ?13, last_run_at = ?14, execution_count = ?15,
            consecutive_failures = ?16, rate_limit_json = ?17, response_json = ?18,
            job_fingerprint = ?19, updated_at = ?20
         WHERE id = ?21"
    );
    let updated = conn
        .execute(
            &sql,
            rusqlite::params![
                job.idempotency_key,
                job.project_id,
                job.name,
                job.prompt,
                job.target_api,
                to_json(&job.headers)?,
                job.skill_id,
                to_json(&job.metadata)?,
                to_json(&job.schedule)?,
                job.schedule.schedule_type().to_string(),
                job.user_timezone,
                job.status.to_string(),
                job.next_run_at.map(|dt| fmt_dt(&dt)),
                job.last_run_at.map(|dt| fmt_dt(&dt)),
                job.execution_count as i64,
                job.consecutive_failures as i64,
                to_json(&job.rate_limit)?,
                to_json(&job.response)?,
                job.job_fingerprint,
                fmt_dt(&job.updated_at),
                job.id.0,
            ],
        )
        .map_err(|e| StoreError::Sqlite(e.to_string()))?;
    if updated == 0 {
        return Err(StoreError::NotFound(job.id.to_string()));
    }
    Ok(())
}

fn update_execution_row(
    conn: &rusqlite::Connection,
    table: &str,
    execution: &Execution,
) -> Result<(), StoreError> {
    let sql = format!(
        "UPDATE {table} SET
            completed_at = ?1, duration_ms = ?2, response_json = ?3, status = ?4,
            attempts = ?5, error_json = ?6, rate_limit_json = ?7
         WHERE id = ?8"
    );
    let updated = conn
        .execute(
            &sql,
            rusqlite::params![
                execution.completed_at.map(|dt| fmt_dt(&dt)),
                execution.duration_ms.map(|v| v as i64),
                execution
                    .response
                    .as_ref()
                    .map(to_json)
                    .transpose()?,
                execution.status.to_string(),
                execution.attempts as i64,
                execution.error.as_ref().map(to_json).transpose()?,
                execution
                    .rate_limit_info
                    .as_ref()
                    .map(to_json)
                    .transpose()?,
                execution.id.0,
            ],
        )
        .map_err(|e| StoreError::Sqlite(e.to_string()))?;
    if updated == 0 {
        return Err(StoreError::NotFound(execution.id.to_string()));
    }
    Ok(())
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn insert_job(&self, job: &Job) -> Result<JobId, StoreError> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "INSERT INTO {} (job_uuid, idempotency_key, org_id, project_id, created_by,
                name, prompt, target_api, headers_json, skill_id, metadata_json,
                schedule_json, schedule_type, user_timezone, status, next_run_at,
                last_run_at, execution_count, consecutive_failures, rate_limit_json,
                response_json, job_fingerprint, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22,?23,?24)",
            self.jobs_table
        );
        conn.execute(
            &sql,
            rusqlite::params![
                job.job_uuid.to_string(),
                job.idempotency_key,
                job.org_id,
                job.project_id,
                job.created_by,
                job.name,
                job.prompt,
                job.target_api,
                to_json(&job.headers)?,
                job.skill_id,
                to_json(&job.metadata)?,
                to_json(&job.schedule)?,
                job.schedule.schedule_type().to_string(),
                job.user_timezone,
                job.status.to_string(),
                job.next_run_at.map(|dt| fmt_dt(&dt)),
                job.last_run_at.map(|dt| fmt_dt(&dt)),
                job.execution_count as i64,
                job.consecutive_failures as i64,
                to_json(&job.rate_limit)?,
                to_json(&job.response)?,
                job.job_fingerprint,
                fmt_dt(&job.created_at),
                fmt_dt(&job.updated_at),
            ],
        )
        .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        Ok(JobId(conn.last_insert_rowid()))
    }

    async fn update_job(&self, job: &Job) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        update_job_row(&conn, &self.jobs_table, job)
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let conn = self.conn.lock().await;
        let sql = format!("SELECT {JOB_COLUMNS} FROM {} WHERE id = ?1", self.jobs_table);
        let raw = conn
            .query_row(&sql, rusqlite::params![id.0], read_raw_job)
            .optional()
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        raw.map(parse_job).transpose()
    }

    async fn get_job_by_uuid(&self, uuid: &JobUuid) -> Result<Option<Job>, StoreError> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM {} WHERE job_uuid = ?1",
            self.jobs_table
        );
        let raw = conn
            .query_row(&sql, rusqlite::params![uuid.to_string()], read_raw_job)
            .optional()
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        raw.map(parse_job).transpose()
    }

    async fn find_by_idempotency_key(
        &self,
        org_id: &str,
        key: &str,
    ) -> Result<Option<Job>, StoreError> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM {} WHERE org_id = ?1 AND idempotency_key = ?2 LIMIT 1",
            self.jobs_table
        );
        let raw = conn
            .query_row(&sql, rusqlite::params![org_id, key], read_raw_job)
            .optional()
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        raw.map(parse_job).transpose()
    }

    async fn find_by_fingerprint_since(
        &self,
        fingerprint: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM {} WHERE job_fingerprint = ?1 AND created_at >= ?2 LIMIT 1",
            self.jobs_table
        );
        let raw = conn
            .query_row(
                &sql,
                rusqlite::params![fingerprint, fmt_dt(&since)],
                read_raw_job,
            )
            .optional()
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        raw.map(parse_job).transpose()
    }

    async fn list_jobs(
        &self,
        org_id: &str,
        filters: &JobFilters,
        page: &Page,
        sort: &JobSort,
    ) -> Result<(Vec<Job>, u64), StoreError> {
        let mut clauses = vec!["org_id = ?".to_string()];
        let mut params: Vec<String> = vec![org_id.to_string()];

        if let Some(status) = filters.status {
            clauses.push("status = ?".to_string());
            params.push(status.to_string());
        }
        if let Some(schedule_type) = filters.schedule_type {
            clauses.push("schedule_type = ?".to_string());
            params.push(schedule_type.to_string());
        }
        if let Some(project_id) = &filters.project_id {
            clauses.push("project_id = ?".to_string());
            params.push(project_id.clone());
        }
        if let Some(search) = &filters.search {
            clauses.push("name LIKE ?".to_string());
            params.push(format!("%{search}%"));
        }
        if let Some(from) = filters.from_date {
            clauses.push("created_at >= ?".to_string());
            params.push(fmt_dt(&from));
        }
        if let Some(to) = filters.to_date {
            clauses.push("created_at <= ?".to_string());
            params.push(fmt_dt(&to));
        }

        let where_clause = clauses.join(" AND ");
        let page = page.clamped();
        let conn = self.conn.lock().await;

        let count_sql = format!(
            "SELECT COUNT(*) FROM {} WHERE {where_clause}",
            self.jobs_table
        );
        let total: i64 = conn
            .query_row(
                &count_sql,
                rusqlite::params_from_iter(params.iter()),
                |row| row.get(0),
            )
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;

        let list_sql = format!(
            "SELECT {JOB_COLUMNS} FROM {} WHERE {where_clause}
             ORDER BY {} {} LIMIT {} OFFSET {}",
            self.jobs_table,
            sort.field.column(),
            sort.order.keyword(),
            page.limit,
            page.offset()
        );
        let mut stmt = conn
            .prepare(&list_sql)
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(params.iter()), read_raw_job)
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;

        let mut jobs = Vec::new();
        for row in rows {
            let raw = row.map_err(|e| StoreError::Sqlite(e.to_string()))?;
            jobs.push(parse_job(raw)?);
        }
        Ok((jobs, total.max(0) as u64))
    }

    async fn delete_job(&self, id: JobId) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let sql = format!("DELETE FROM {} WHERE id = ?1", self.jobs_table);
        let deleted = conn
            .execute(&sql, rusqlite::params![id.0])
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        Ok(deleted > 0)
    }

    async fn count_jobs_by_status(
        &self,
        org_id: &str,
    ) -> Result<HashMap<JobStatus, u64>, StoreError> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT status, COUNT(*) FROM {} WHERE org_id = ?1 GROUP BY status",
            self.jobs_table
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        let rows = stmt
            .query_map(rusqlite::params![org_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;

        let mut counts = HashMap::new();
        for row in rows {
            let (status, count) = row.map_err(|e| StoreError::Sqlite(e.to_string()))?;
            let status: JobStatus = status
                .parse()
                .map_err(|e: String| StoreError::Serialization(e))?;
            counts.insert(status, count.max(0) as u64);
        }
        Ok(counts)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map(|_| ())
            .map_err(|e| StoreError::Sqlite(e.to_string()))
    }
}

#[async_trait]
impl ExecutionStore for SqliteStore {
    async fn insert_execution(&self, execution: &Execution) -> Result<ExecutionId, StoreError> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "INSERT INTO {} (execution_uuid, job_id, job_uuid, org_id, scheduled_for,
                executed_at, completed_at, duration_ms, request_json, response_json,
                status, attempts, error_json, rate_limit_json, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)",
            self.executions_table
        );
        conn.execute(
            &sql,
            rusqlite::params![
                execution.execution_uuid,
                execution.job_id.0,
                execution.job_uuid.to_string(),
                execution.org_id,
                fmt_dt(&execution.scheduled_for),
                fmt_dt(&execution.executed_at),
                execution.completed_at.map(|dt| fmt_dt(&dt)),
                execution.duration_ms.map(|v| v as i64),
                to_json(&execution.request)?,
                execution.response.as_ref().map(to_json).transpose()?,
                execution.status.to_string(),
                execution.attempts as i64,
                execution.error.as_ref().map(to_json).transpose()?,
                execution
                    .rate_limit_info
                    .as_ref()
                    .map(to_json)
                    .transpose()?,
                fmt_dt(&execution.created_at),
            ],
        )
        .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        Ok(ExecutionId(conn.last_insert_rowid()))
    }

    async fn update_execution(&self, execution: &Execution) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        update_execution_row(&conn, &self.executions_table, execution)
    }

    async fn record_fire_outcome(
        &self,
        job: &Job,
        execution: &Execution,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn
            .transaction()
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        update_execution_row(&tx, &self.executions_table, execution)?;
        update_job_row(&tx, &self.jobs_table, job)?;
        tx.commit().map_err(|e| StoreError::Sqlite(e.to_string()))
    }

    async fn list_executions(
        &self,
        job_id: JobId,
        page: &Page,
    ) -> Result<(Vec<Execution>, u64), StoreError> {
        let page = page.clamped();
        let conn = self.conn.lock().await;

        let count_sql = format!(
            "SELECT COUNT(*) FROM {} WHERE job_id = ?1",
            self.executions_table
        );
        let total: i64 = conn
            .query_row(&count_sql, rusqlite::params![job_id.0], |row| row.get(0))
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;

        let sql = format!(
            "SELECT {EXECUTION_COLUMNS} FROM {} WHERE job_id = ?1
             ORDER BY executed_at DESC LIMIT {} OFFSET {}",
            self.executions_table,
            page.limit,
            page.offset()
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        let rows = stmt
            .query_map(rusqlite::params![job_id.0], read_raw_execution)
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;

        let mut executions = Vec::new();
        for row in rows {
            let raw = row.map_err(|e| StoreError::Sqlite(e.to_string()))?;
            executions.push(parse_execution(raw)?);
        }
        Ok((executions, total.max(0) as u64))
    }

    async fn count_executions_by_status(
        &self,
        org_id: &str,
    ) -> Result<HashMap<ExecutionStatus, u64>, StoreError> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT status, COUNT(*) FROM {} WHERE org_id = ?1 GROUP BY status",
            self.executions_table
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        let rows = stmt
            .query_map(rusqlite::params![org_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;

        let mut counts = HashMap::new();
        for row in rows {
            let (status, count) = row.map_err(|e| StoreError::Sqlite(e.to_string()))?;
            let status: ExecutionStatus = status
                .parse()
                .map_err(|e: String| StoreError::Serialization(e))?;
            counts.insert(status, count.max(0) as u64);
        }
        Ok(counts)
    }

    async fn executions_today(&self, org_id: &str) -> Result<u64, StoreError> {
        let midnight = Utc::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|naive| DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
            .unwrap_or_else(Utc::now);
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE org_id = ?1 AND executed_at >= ?2",
            self.executions_table
        );
        let count: i64 = conn
            .query_row(
                &sql,
                rusqlite::params![org_id, fmt_dt(&midnight)],
                |row| row.get(0),
            )
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        Ok(count.max(0) as u64)
    }

    async fn average_duration_ms(&self, org_id: &str) -> Result<Option<f64>, StoreError> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT AVG(duration_ms) FROM {} WHERE org_id = ?1 AND duration_ms IS NOT NULL",
            self.executions_table
        );
        conn.query_row(&sql, rusqlite::params![org_id], |row| {
            row.get::<_, Option<f64>>(0)
        })
        .map_err(|e| StoreError::Sqlite(e.to_string()))
    }

    async fn delete_executions_for_job(&self, job_id: JobId) -> Result<u64, StoreError> {
        let conn = self.conn.lock().await;
        let sql = format!("DELETE FROM {} WHERE job_id = ?1", self.executions_table);
        let deleted = conn
            .execute(&sql, rusqlite::params![job_id.0])
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        Ok(deleted as u64)
    }

    async fn purge_executions_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let conn = self.conn.lock().await;
        let sql = format!("DELETE FROM {} WHERE created_at < ?1", self.executions_table);
        let deleted = conn
            .execute(&sql, rusqlite::params![fmt_dt(&cutoff)])
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        if deleted > 0 {
            tracing::info!(deleted, "purged expired execution records");
        }
        Ok(deleted as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Frequency, RequestSnapshot};
    use chrono::Duration;

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory(&DatabaseSettings::default()).unwrap()
    }

    fn sample_job(org: &str, name: &str) -> Job {
        let now = Utc::now();
        let schedule = Schedule::Recurring {
            frequency: Frequency::Daily,
            time: "09:30".to_string(),
            start_date: chrono::NaiveDate::from_ymd_opt(2030, 3, 1).unwrap(),
            end_date: None,
            days_of_week: vec![],
            day_of_month: None,
            cron_expression: "30 14 * * *".to_string(),
        };
        Job {
            id: JobId(0),
            job_uuid: JobUuid::new(),
            idempotency_key: None,
            org_id: org.to_string(),
            project_id: None,
            created_by: "user1".to_string(),
            name: name.to_string(),
            prompt: "p".to_string(),
            target_api: "https://svc.example/ping".to_string(),
            headers: HashMap::new(),
            skill_id: None,
            metadata: serde_json::Map::new(),
            job_fingerprint: Job::fingerprint(org, "p", "https://svc.example/ping", &schedule),
            schedule,
            user_timezone: "America/New_York".to_string(),
            status: JobStatus::Active,
            next_run_at: Some(now + Duration::hours(1)),
            last_run_at: None,
            execution_count: 0,
            consecutive_failures: 0,
            rate_limit: RateLimitSettings::default(),
            response: ResponseSettings::default(),
            created_at: now,
            updated_at: now,
        }
    }

    fn sample_execution(job: &Job) -> Execution {
        Execution::open(
            job.id,
            job.job_uuid.clone(),
            job.org_id.clone(),
            Utc::now(),
            RequestSnapshot {
                prompt: job.prompt.clone(),
                target_api: job.target_api.clone(),
                headers: HashMap::new(),
                timeout_ms: 30_000,
            },
            1,
        )
    }

    #[tokio::test]
    async fn job_round_trip() {
        let store = store();
        let mut job = sample_job("org1", "ping");
        job.id = store.insert_job(&job).await.unwrap();

        let loaded = store.get_job(job.id).await.unwrap().expect("job exists");
        assert_eq!(loaded.name, "ping");
        assert_eq!(loaded.org_id, "org1");
        assert_eq!(loaded.schedule, job.schedule);
        assert_eq!(loaded.status, JobStatus::Active);
        assert_eq!(loaded.user_timezone, "America/New_York");

        let by_uuid = store
            .get_job_by_uuid(&job.job_uuid)
            .await
            .unwrap()
            .expect("found by uuid");
        assert_eq!(by_uuid.id, job.id);
    }

    #[tokio::test]
    async fn update_job_persists_changes() {
        let store = store();
        let mut job = sample_job("org1", "ping");
        job.id = store.insert_job(&job).await.unwrap();

        job.status = JobStatus::Paused;
        job.consecutive_failures = 2;
        job.updated_at = Utc::now();
        store.update_job(&job).await.unwrap();

        let loaded = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Paused);
        assert_eq!(loaded.consecutive_failures, 2);
    }

    #[tokio::test]
    async fn update_missing_job_is_not_found() {
        let store = store();
        let mut job = sample_job("org1", "ping");
        job.id = JobId(999);
        assert!(matches!(
            store.update_job(&job).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn fingerprint_lookup_honors_window() {
        let store = store();
        let mut job = sample_job("org1", "ping");
        job.id = store.insert_job(&job).await.unwrap();

        let inside = store
            .find_by_fingerprint_since(&job.job_fingerprint, Utc::now() - Duration::minutes(5))
            .await
            .unwrap();
        assert!(inside.is_some());

        let outside = store
            .find_by_fingerprint_since(&job.job_fingerprint, Utc::now() + Duration::minutes(1))
            .await
            .unwrap();
        assert!(outside.is_none());
    }

    #[tokio::test]
    async fn idempotency_key_is_org_scoped() {
        let store = store();
        let mut job = sample_job("org1", "ping");
        job.idempotency_key = Some("key-1".to_string());
        job.id = store.insert_job(&job).await.unwrap();

        assert!(store
            .find_by_idempotency_key("org1", "key-1")
            .await
            .unwrap()
            .is_some());
        assert!(store
            .find_by_idempotency_key("org2", "key-1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn list_filters_and_paginates() {
        let store = store();
        for i in 0..5 {
            let mut job = sample_job("org1", &format!("job-{i}"));
            job.next_run_at = Some(Utc::now() + Duration::hours(i));
            job.id = store.insert_job(&job).await.unwrap();
        }
        let mut other = sample_job("org2", "other");
        other.id = store.insert_job(&other).await.unwrap();

        let (jobs, total) = store
            .list_jobs(
                "org1",
                &JobFilters::default(),
                &Page { page: 1, limit: 3 },
                &JobSort::default(),
            )
            .await
            .unwrap();
        assert_eq!(total, 5);
        assert_eq!(jobs.len(), 3);
        // Default sort: next_run_at ascending.
        assert!(jobs.windows(2).all(|w| w[0].next_run_at <= w[1].next_run_at));

        let (found, total) = store
            .list_jobs(
                "org1",
                &JobFilters {
                    search: Some("job-3".to_string()),
                    ..Default::default()
                },
                &Page::default(),
                &JobSort::default(),
            )
            .await
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(found[0].name, "job-3");
    }

    #[tokio::test]
    async fn delete_job_reports_existence() {
        let store = store();
        let mut job = sample_job("org1", "ping");
        job.id = store.insert_job(&job).await.unwrap();
        assert!(store.delete_job(job.id).await.unwrap());
        assert!(!store.delete_job(job.id).await.unwrap());
    }

    #[tokio::test]
    async fn execution_round_trip_and_history_order() {
        let store = store();
        let mut job = sample_job("org1", "ping");
        job.id = store.insert_job(&job).await.unwrap();

        let mut first = sample_execution(&job);
        first.executed_at = Utc::now() - Duration::minutes(2);
        first.id = store.insert_execution(&first).await.unwrap();

        let mut second = sample_execution(&job);
        second.id = store.insert_execution(&second).await.unwrap();

        let (history, total) = store
            .list_executions(job.id, &Page::default())
            .await
            .unwrap();
        assert_eq!(total, 2);
        // Newest first.
        assert_eq!(history[0].id, second.id);
        assert_eq!(history[1].id, first.id);
    }

    #[tokio::test]
    async fn record_fire_outcome_updates_both_rows() {
        let store = store();
        let mut job = sample_job("org1", "ping");
        job.id = store.insert_job(&job).await.unwrap();

        let mut execution = sample_execution(&job);
        execution.id = store.insert_execution(&execution).await.unwrap();
        execution.close(ExecutionStatus::Success);

        job.execution_count = 1;
        job.last_run_at = Some(Utc::now());
        job.updated_at = Utc::now();
        store.record_fire_outcome(&job, &execution).await.unwrap();

        let loaded_job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(loaded_job.execution_count, 1);
        let (history, _) = store
            .list_executions(job.id, &Page::default())
            .await
            .unwrap();
        assert_eq!(history[0].status, ExecutionStatus::Success);
        assert!(history[0].duration_ms.is_some());
    }

    #[tokio::test]
    async fn statistics_queries() {
        let store = store();
        let mut job = sample_job("org1", "ping");
        job.id = store.insert_job(&job).await.unwrap();

        let mut success = sample_execution(&job);
        success.id = store.insert_execution(&success).await.unwrap();
        success.close(ExecutionStatus::Success);
        store.update_execution(&success).await.unwrap();

        let mut failed = sample_execution(&job);
        failed.id = store.insert_execution(&failed).await.unwrap();
        failed.close(ExecutionStatus::Failed);
        store.update_execution(&failed).await.unwrap();

        let counts = store.count_executions_by_status("org1").await.unwrap();
        assert_eq!(counts.get(&ExecutionStatus::Success), Some(&1));
        assert_eq!(counts.get(&ExecutionStatus::Failed), Some(&1));

        assert_eq!(store.executions_today("org1").await.unwrap(), 2);
        assert!(store.average_duration_ms("org1").await.unwrap().is_some());
        assert_eq!(store.executions_today("org2").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn purge_drops_only_expired_executions() {
        let store = store();
        let mut job = sample_job("org1", "ping");
        job.id = store.insert_job(&job).await.unwrap();

        let mut old = sample_execution(&job);
        old.created_at = Utc::now() - Duration::days(40);
        old.id = store.insert_execution(&old).await.unwrap();

        let mut fresh = sample_execution(&job);
        fresh.id = store.insert_execution(&fresh).await.unwrap();

        let purged = store
            .purge_executions_before(Utc::now() - Duration::days(30))
            .await
            .unwrap();
        assert_eq!(purged, 1);

        let (history, total) = store
            .list_executions(job.id, &Page::default())
            .await
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(history[0].id, fresh.id);
    }

    #[tokio::test]
    async fn cascade_delete_for_job() {
        let store = store();
        let mut job = sample_job("org1", "ping");
        job.id = store.insert_job(&job).await.unwrap();
        for _ in 0..3 {
            let mut execution = sample_execution(&job);
            execution.id = store.insert_execution(&execution).await.unwrap();
        }
        assert_eq!(store.delete_executions_for_job(job.id).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn ping_succeeds() {
        assert!(store().ping().await.is_ok());
    }
}
