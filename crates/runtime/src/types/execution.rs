//! Execution audit records: one append-only record per fire attempt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use super::{JobId, JobUuid};

/// Surrogate id of an execution row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionId(pub i64);

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of a single fire attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Success,
    Failed,
    Timeout,
    RateLimited,
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionStatus::Pending => write!(f, "pending"),
            ExecutionStatus::Success => write!(f, "success"),
            ExecutionStatus::Failed => write!(f, "failed"),
            ExecutionStatus::Timeout => write!(f, "timeout"),
            ExecutionStatus::RateLimited => write!(f, "rate_limited"),
        }
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ExecutionStatus::Pending),
            "success" => Ok(ExecutionStatus::Success),
            "failed" => Ok(ExecutionStatus::Failed),
            "timeout" => Ok(ExecutionStatus::Timeout),
            "rate_limited" => Ok(ExecutionStatus::RateLimited),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// Snapshot of the outbound request as it was issued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSnapshot {
    pub prompt: String,
    pub target_api: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub timeout_ms: u64,
}

/// Snapshot of the target's response after processing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseSnapshot {
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub data_size: usize,
    #[serde(default)]
    pub is_compressed: bool,
    #[serde(default)]
    pub is_truncated: bool,
    #[serde(default)]
    pub storage_location: Option<String>,
}

/// Failure detail attached to non-success executions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionFailure {
    pub message: String,
    #[serde(default)]
    pub code: Option<String>,
    pub retryable: bool,
}

/// Rate-limit state observed from the target's response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitInfo {
    #[serde(default)]
    pub remaining: Option<u64>,
    /// Epoch seconds at which the window resets.
    #[serde(default)]
    pub reset: Option<u64>,
    /// `Retry-After` value in seconds.
    #[serde(default)]
    pub retry_after: Option<u64>,
}

/// Append-only audit record for one fire attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub execution_uuid: String,
    pub job_id: JobId,
    pub job_uuid: JobUuid,
    pub org_id: String,
    pub scheduled_for: DateTime<Utc>,
    pub executed_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// `completed_at − executed_at`, in milliseconds.
    #[serde(default)]
    pub duration_ms: Option<u64>,
    pub request: RequestSnapshot,
    #[serde(default)]
    pub response: Option<ResponseSnapshot>,
    pub status: ExecutionStatus,
    pub attempts: u32,
    #[serde(default)]
    pub error: Option<ExecutionFailure>,
    #[serde(default)]
    pub rate_limit_info: Option<RateLimitInfo>,
    pub created_at: DateTime<Utc>,
}

impl Execution {
    /// Open a new pending execution for a fire attempt.
    pub fn open(
        job_id: JobId,
        job_uuid: JobUuid,
        org_id: String,
        scheduled_for: DateTime<Utc>,
        request: RequestSnapshot,
        attempts: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ExecutionId(0),
            execution_uuid: Uuid::new_v4().to_string(),
            job_id,
            job_uuid,
            org_id,
            scheduled_for,
            executed_at: now,
            completed_at: None,
            duration_ms: None,
            request,
            response: None,
            status: ExecutionStatus::Pending,
            attempts,
            error: None,
            rate_limit_info: None,
            created_at: now,
        }
    }

    /// Close the record with an outcome, deriving the duration.
    pub fn close(&mut self, status: ExecutionStatus) {
        let now = Utc::now();
        self.completed_at = Some(now);
        self.duration_ms = Some((now - self.executed_at).num_milliseconds().max(0) as u64);
        self.status = status;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Execution {
        Execution::open(
            JobId(1),
            JobUuid::new(),
            "org1".to_string(),
            Utc::now(),
            RequestSnapshot {
                prompt: "p".into(),
                target_api: "https://svc.example/ping".into(),
                headers: HashMap::new(),
                timeout_ms: 30_000,
            },
            1,
        )
    }

    #[test]
    fn open_execution_is_pending() {
        let exec = sample();
        assert_eq!(exec.status, ExecutionStatus::Pending);
        assert!(exec.completed_at.is_none());
        assert_eq!(exec.attempts, 1);
    }

    #[test]
    fn close_derives_duration() {
        let mut exec = sample();
        exec.close(ExecutionStatus::Success);
        let completed = exec.completed_at.expect("completed_at set");
        assert!(exec.executed_at <= completed);
        assert_eq!(
            exec.duration_ms.unwrap(),
            (completed - exec.executed_at).num_milliseconds() as u64
        );
    }

    #[test]
    fn status_roundtrip() {
        for status in [
            ExecutionStatus::Pending,
            ExecutionStatus::Success,
            ExecutionStatus::Failed,
            ExecutionStatus::Timeout,
            ExecutionStatus::RateLimited,
        ] {
            let parsed: ExecutionStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }
}
