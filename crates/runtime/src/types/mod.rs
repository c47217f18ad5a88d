//! Shared types for the cron scheduling core.

pub mod error;
pub mod execution;
pub mod job;

pub use error::{ConfigError, PlannerError, QueueError, ResponseError, RuntimeError, StoreError};
pub use execution::{
    Execution, ExecutionFailure, ExecutionId, ExecutionStatus, RateLimitInfo, RequestSnapshot,
    ResponseSnapshot,
};
pub use job::{
    Frequency, Job, JobRequest, JobStatus, JobUpdate, RateLimitSettings, ResponseSettings,
    Schedule, ScheduleRequest, ScheduleType,
};

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Internal surrogate id of a job row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub i64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable, opaque job identity. Used as the queue-side deduplication key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobUuid(String);

impl JobUuid {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: String) -> Self {
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobUuid {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tenant identity threaded explicitly through the Job Manager API.
///
/// There is no ambient request context: callers resolve credentials at the
/// edge and pass the resulting scope here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessContext {
    pub org_id: String,
    pub user_id: String,
    #[serde(default)]
    pub project_id: Option<String>,
}

impl AccessContext {
    pub fn new(org_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            org_id: org_id.into(),
            user_id: user_id.into(),
            project_id: None,
        }
    }
}

/// Paging parameters for list queries. `limit` is clamped to 100.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Page {
    pub page: u32,
    pub limit: u32,
}

impl Default for Page {
    fn default() -> Self {
        Self { page: 1, limit: 20 }
    }
}

impl Page {
    pub fn clamped(self) -> Self {
        Self {
            page: self.page.max(1),
            limit: self.limit.clamp(1, 100),
        }
    }

    pub fn offset(&self) -> u32 {
        (self.page.max(1) - 1) * self.limit
    }
}

/// Pagination metadata returned alongside list results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
    pub total: u64,
    pub total_pages: u64,
}

impl Pagination {
    pub fn new(page: &Page, total: u64) -> Self {
        let limit = page.limit.max(1) as u64;
        Self {
            page: page.page,
            limit: page.limit,
            total,
            total_pages: total.div_ceil(limit),
        }
    }
}

/// Response envelope consumed verbatim by the HTTP controller layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pagination: Option<Pagination>,
}

impl<T> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            pagination: None,
        }
    }

    pub fn ok_paginated(data: T, pagination: Pagination) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            pagination: Some(pagination),
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
            pagination: None,
        }
    }
}
