//! Job records and the request shapes that create them.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;

use super::{JobId, JobUuid};

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Job is live and will fire on schedule.
    #[default]
    Active,
    /// Job is paused; no tokens are queued until it is resumed.
    Paused,
    /// All planned fires are done (terminal).
    Completed,
    /// The consecutive-failure cap was reached (terminal until retried).
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Active => write!(f, "active"),
            JobStatus::Paused => write!(f, "paused"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(JobStatus::Active),
            "paused" => Ok(JobStatus::Paused),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Recurrence frequency for recurring schedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frequency::Daily => write!(f, "daily"),
            Frequency::Weekly => write!(f, "weekly"),
            Frequency::Monthly => write!(f, "monthly"),
        }
    }
}

/// Discriminant of the schedule sum type, useful for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    Once,
    Recurring,
}

impl fmt::Display for ScheduleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleType::Once => write!(f, "once"),
            ScheduleType::Recurring => write!(f, "recurring"),
        }
    }
}

/// A job's planned schedule. One-time schedules carry a resolved UTC
/// instant; recurring schedules carry the user-facing fields plus the
/// derived 5-field UTC cron expression snapshotted at plan time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "schedule_type", rename_all = "snake_case")]
pub enum Schedule {
    Once {
        date_time: DateTime<Utc>,
    },
    Recurring {
        frequency: Frequency,
        /// Local wall-clock `HH:MM` in the job's user timezone.
        time: String,
        start_date: NaiveDate,
        #[serde(default)]
        end_date: Option<NaiveDate>,
        /// Days 0 (Sunday) through 6 (Saturday); required for weekly.
        #[serde(default)]
        days_of_week: Vec<u8>,
        /// 1..=31; defaults to 1 for monthly.
        #[serde(default)]
        day_of_month: Option<u8>,
        /// Derived 5-field expression, minute and hour in UTC.
        cron_expression: String,
    },
}

impl Schedule {
    pub fn schedule_type(&self) -> ScheduleType {
        match self {
            Schedule::Once { .. } => ScheduleType::Once,
            Schedule::Recurring { .. } => ScheduleType::Recurring,
        }
    }

    pub fn cron_expression(&self) -> Option<&str> {
        match self {
            Schedule::Once { .. } => None,
            Schedule::Recurring {
                cron_expression, ..
            } => Some(cron_expression),
        }
    }

    pub fn end_date(&self) -> Option<NaiveDate> {
        match self {
            Schedule::Once { .. } => None,
            Schedule::Recurring { end_date, .. } => *end_date,
        }
    }
}

/// Per-job rate-limit knobs. `max_requests_per_minute` applies to the
/// job's target host unless a per-host override in the global config wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitSettings {
    pub max_requests_per_minute: u32,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
    #[serde(default)]
    pub current_backoff_ms: u64,
    #[serde(default)]
    pub last_rate_limit_hit: Option<DateTime<Utc>>,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            max_requests_per_minute: 60,
            backoff_multiplier: 2.0,
            max_backoff_ms: 300_000,
            current_backoff_ms: 0,
            last_rate_limit_hit: None,
        }
    }
}

/// Per-job response handling knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseSettings {
    /// Bound on the stored response payload, 1 KiB..=50 MiB.
    pub max_size_bytes: usize,
    pub compress_response: bool,
    pub store_full_response: bool,
}

impl Default for ResponseSettings {
    fn default() -> Self {
        Self {
            max_size_bytes: 10 * 1024 * 1024,
            compress_response: true,
            store_full_response: false,
        }
    }
}

/// The durable scheduling unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_uuid: JobUuid,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    pub org_id: String,
    #[serde(default)]
    pub project_id: Option<String>,
    pub created_by: String,
    pub name: String,
    pub prompt: String,
    pub target_api: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub skill_id: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub schedule: Schedule,
    /// IANA zone name, preserved for display. All stored times are UTC.
    pub user_timezone: String,
    pub status: JobStatus,
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub execution_count: u64,
    #[serde(default)]
    pub consecutive_failures: u32,
    pub rate_limit: RateLimitSettings,
    pub response: ResponseSettings,
    pub job_fingerprint: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// SHA-256 fingerprint over the identity-bearing fields, used for
    /// duplicate suppression within the configured window.
    pub fn fingerprint(
        org_id: &str,
        prompt: &str,
        target_api: &str,
        schedule: &Schedule,
    ) -> String {
        let serialized = serde_json::to_string(schedule).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(org_id.as_bytes());
        hasher.update(b"|");
        hasher.update(prompt.as_bytes());
        hasher.update(b"|");
        hasher.update(target_api.as_bytes());
        hasher.update(b"|");
        hasher.update(schedule.schedule_type().to_string().as_bytes());
        hasher.update(b"|");
        hasher.update(serialized.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Client-facing schedule shape, before planning resolves it into a
/// `Schedule`. One-time jobs supply a local date and `HH:MM` interpreted
/// in the request timezone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "schedule_type", rename_all = "snake_case")]
pub enum ScheduleRequest {
    Once {
        date: NaiveDate,
        time: String,
    },
    Recurring {
        frequency: Frequency,
        time: String,
        start_date: NaiveDate,
        #[serde(default)]
        end_date: Option<NaiveDate>,
        #[serde(default)]
        days_of_week: Vec<u8>,
        #[serde(default)]
        day_of_month: Option<u8>,
    },
}

impl ScheduleRequest {
    pub fn schedule_type(&self) -> ScheduleType {
        match self {
            ScheduleRequest::Once { .. } => ScheduleType::Once,
            ScheduleRequest::Recurring { .. } => ScheduleType::Recurring,
        }
    }
}

/// Request body for job creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub name: String,
    pub prompt: String,
    pub target_api: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub skill_id: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub schedule: ScheduleRequest,
    pub timezone: String,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub max_requests_per_minute: Option<u32>,
    #[serde(default)]
    pub max_size_bytes: Option<usize>,
    #[serde(default)]
    pub compress_response: Option<bool>,
    #[serde(default)]
    pub store_full_response: Option<bool>,
}

/// Patch shape for job updates. Payload fields are editable without
/// schedule revalidation; a schedule or timezone change triggers a replan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub target_api: Option<String>,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default)]
    pub skill_id: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    pub schedule: Option<ScheduleRequest>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub max_requests_per_minute: Option<u32>,
    #[serde(default)]
    pub max_size_bytes: Option<usize>,
    #[serde(default)]
    pub compress_response: Option<bool>,
    #[serde(default)]
    pub store_full_response: Option<bool>,
}

impl JobUpdate {
    pub fn changes_schedule(&self) -> bool {
        self.schedule.is_some() || self.timezone.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recurring_schedule() -> Schedule {
        Schedule::Recurring {
            frequency: Frequency::Daily,
            time: "09:30".to_string(),
            start_date: NaiveDate::from_ymd_opt(2030, 3, 1).unwrap(),
            end_date: None,
            days_of_week: vec![],
            day_of_month: None,
            cron_expression: "30 14 * * *".to_string(),
        }
    }

    #[test]
    fn status_roundtrip() {
        for status in [
            JobStatus::Active,
            JobStatus::Paused,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            let parsed: JobStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("bogus".parse::<JobStatus>().is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Active.is_terminal());
        assert!(!JobStatus::Paused.is_terminal());
    }

    #[test]
    fn schedule_serde_is_tagged() {
        let schedule = recurring_schedule();
        let json = serde_json::to_value(&schedule).unwrap();
        assert_eq!(json["schedule_type"], "recurring");
        let back: Schedule = serde_json::from_value(json).unwrap();
        assert_eq!(back, schedule);
    }

    #[test]
    fn fingerprint_is_stable_and_discriminates() {
        let schedule = recurring_schedule();
        let a = Job::fingerprint("org1", "p", "https://svc.example/ping", &schedule);
        let b = Job::fingerprint("org1", "p", "https://svc.example/ping", &schedule);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        let c = Job::fingerprint("org2", "p", "https://svc.example/ping", &schedule);
        assert_ne!(a, c);

        let d = Job::fingerprint("org1", "p2", "https://svc.example/ping", &schedule);
        assert_ne!(a, d);
    }

    #[test]
    fn update_detects_schedule_changes() {
        let patch = JobUpdate {
            prompt: Some("new".into()),
            ..Default::default()
        };
        assert!(!patch.changes_schedule());

        let patch = JobUpdate {
            timezone: Some("America/New_York".into()),
            ..Default::default()
        };
        assert!(patch.changes_schedule());
    }
}
