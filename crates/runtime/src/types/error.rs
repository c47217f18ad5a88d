//! Error types for the scheduling core.

use thiserror::Error;

use super::JobStatus;

/// Top-level runtime error. Subsystem errors compose into this type so the
/// controller layer has a single surface to map onto HTTP status codes.
#[derive(Error, Debug, Clone)]
pub enum RuntimeError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("duplicate job: {0}")]
    Duplicate(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid transition: {action} is not allowed from status {from}")]
    InvalidTransition { from: JobStatus, action: String },

    #[error("schedule is in the past: {0}")]
    PastSchedule(String),

    #[error("end date exceeded")]
    EndDateExceeded,

    #[error("queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("rate limited for host {host}")]
    RateLimited { host: String },

    #[error("request timed out after {0} ms")]
    Timeout(u64),

    #[error("HTTP {status}: {message}")]
    Http {
        status: u16,
        retryable: bool,
        message: String,
    },

    #[error("compression failed: {0}")]
    CompressionFailure(String),

    #[error("decompression failed: {0}")]
    DecompressionError(String),

    #[error("external storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RuntimeError {
    /// HTTP status code for the controller layer.
    pub fn status_code(&self) -> u16 {
        match self {
            RuntimeError::Validation(_) | RuntimeError::PastSchedule(_) => 400,
            RuntimeError::EndDateExceeded => 400,
            RuntimeError::Duplicate(_) => 409,
            RuntimeError::NotFound(_) => 404,
            RuntimeError::InvalidTransition { .. } => 409,
            RuntimeError::QueueUnavailable(_) => 503,
            RuntimeError::RateLimited { .. } => 429,
            RuntimeError::Timeout(_) => 504,
            RuntimeError::Http { status, .. } => *status,
            RuntimeError::CompressionFailure(_)
            | RuntimeError::DecompressionError(_)
            | RuntimeError::StorageUnavailable(_)
            | RuntimeError::Store(_)
            | RuntimeError::Config(_)
            | RuntimeError::Internal(_) => 500,
        }
    }

    /// Whether the work that produced this error may be retried by the
    /// queue's retry policy.
    pub fn retryable(&self) -> bool {
        match self {
            RuntimeError::RateLimited { .. }
            | RuntimeError::Timeout(_)
            | RuntimeError::QueueUnavailable(_)
            | RuntimeError::StorageUnavailable(_) => true,
            RuntimeError::Http { retryable, .. } => *retryable,
            _ => false,
        }
    }
}

/// Configuration errors, raised during startup validation.
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("missing required configuration: {0}")]
    MissingRequired(String),

    #[error("invalid configuration value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("failed to read configuration file: {0}")]
    Io(String),

    #[error("failed to parse configuration: {0}")]
    Parse(String),
}

/// Schedule planning errors.
#[derive(Error, Debug, Clone)]
pub enum PlannerError {
    #[error("unrecognized timezone: {0}")]
    InvalidTimezone(String),

    #[error("invalid time of day (expected HH:MM): {0}")]
    InvalidTime(String),

    #[error("invalid cron expression: {0}")]
    InvalidCron(String),

    #[error("missing required schedule field: {0}")]
    MissingField(&'static str),

    #[error("schedule field out of range: {0}")]
    OutOfRange(String),

    #[error("scheduled instant is in the past: {0}")]
    PastSchedule(String),

    #[error("no occurrence before the schedule end date")]
    EndDateExceeded,
}

impl From<PlannerError> for RuntimeError {
    fn from(e: PlannerError) -> Self {
        match e {
            PlannerError::PastSchedule(s) => RuntimeError::PastSchedule(s),
            PlannerError::EndDateExceeded => RuntimeError::EndDateExceeded,
            other => RuntimeError::Validation(other.to_string()),
        }
    }
}

/// Queue adapter errors.
#[derive(Error, Debug, Clone)]
pub enum QueueError {
    #[error("queue backend unavailable: {0}")]
    Unavailable(String),

    #[error("token is scheduled in the past: {0}")]
    PastSchedule(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl From<QueueError> for RuntimeError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::PastSchedule(s) => RuntimeError::PastSchedule(s),
            QueueError::Unavailable(s) => RuntimeError::QueueUnavailable(s),
            other => RuntimeError::QueueUnavailable(other.to_string()),
        }
    }
}

/// Response processing errors.
#[derive(Error, Debug, Clone)]
pub enum ResponseError {
    #[error("compression failed: {0}")]
    Compression(String),

    #[error("decompression failed: {0}")]
    Decompression(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("external storage unavailable: {0}")]
    StorageUnavailable(String),
}

impl From<ResponseError> for RuntimeError {
    fn from(e: ResponseError) -> Self {
        match e {
            ResponseError::Decompression(s) => RuntimeError::DecompressionError(s),
            ResponseError::StorageUnavailable(s) => RuntimeError::StorageUnavailable(s),
            other => RuntimeError::CompressionFailure(other.to_string()),
        }
    }
}

/// Persistence errors.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("record not found: {0}")]
    NotFound(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_the_taxonomy() {
        assert_eq!(RuntimeError::Validation("x".into()).status_code(), 400);
        assert_eq!(RuntimeError::Duplicate("x".into()).status_code(), 409);
        assert_eq!(RuntimeError::NotFound("x".into()).status_code(), 404);
        assert_eq!(
            RuntimeError::InvalidTransition {
                from: JobStatus::Completed,
                action: "pause".into()
            }
            .status_code(),
            409
        );
        assert_eq!(RuntimeError::PastSchedule("x".into()).status_code(), 400);
        assert_eq!(
            RuntimeError::QueueUnavailable("down".into()).status_code(),
            503
        );
    }

    #[test]
    fn retryability_classification() {
        assert!(RuntimeError::Timeout(30_000).retryable());
        assert!(RuntimeError::Http {
            status: 503,
            retryable: true,
            message: "upstream".into()
        }
        .retryable());
        assert!(!RuntimeError::Http {
            status: 404,
            retryable: false,
            message: "missing".into()
        }
        .retryable());
        assert!(!RuntimeError::Validation("bad".into()).retryable());
    }

    #[test]
    fn planner_errors_map_to_runtime_kinds() {
        let e: RuntimeError = PlannerError::PastSchedule("t".into()).into();
        assert!(matches!(e, RuntimeError::PastSchedule(_)));
        let e: RuntimeError = PlannerError::InvalidTimezone("Mars/Olympus".into()).into();
        assert!(matches!(e, RuntimeError::Validation(_)));
    }
}
