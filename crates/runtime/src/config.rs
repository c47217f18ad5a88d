//! Configuration for the scheduling core.
//!
//! One `Config` value documents every tunable. It is loaded at startup
//! (defaults → optional TOML file → environment overrides), validated
//! once, and injected into components. No global singleton.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use crate::types::ConfigError;

/// Main configuration object.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub queue: QueueSettings,
    #[serde(default)]
    pub worker: WorkerSettings,
    #[serde(default)]
    pub http: HttpSettings,
    #[serde(default)]
    pub rate_limiting: RateLimitingSettings,
    #[serde(default)]
    pub response_handling: ResponseHandlingSettings,
    #[serde(default)]
    pub timezone: TimezoneSettings,
    #[serde(default)]
    pub duplicate_prevention: DuplicatePreventionSettings,
    #[serde(default)]
    pub monitoring: MonitoringSettings,
    #[serde(default)]
    pub security: SecuritySettings,
    #[serde(default)]
    pub database: DatabaseSettings,
}

/// Which queue backend to run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueueBackendKind {
    /// In-process queue for development and tests.
    Memory,
    /// Redis-backed shared queue for production.
    #[default]
    Redis,
}

/// Backing-store connection and retry policy for the work queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    pub backend: QueueBackendKind,
    pub redis_url: String,
    /// Optional sentinel endpoints for HA deployments.
    #[serde(default)]
    pub sentinels: Vec<String>,
    pub key_prefix: String,
    /// Delivery attempts per token before it is dropped as failed.
    pub attempts: u32,
    /// Initial retry backoff; doubles per attempt.
    pub backoff_initial_ms: u64,
    pub lock_duration_ms: u64,
    pub lock_renewal_ms: u64,
    /// How often stalled (expired-lock) tokens are reclaimed.
    pub stalled_interval_ms: u64,
    pub connect_retries: u32,
    /// Tokens buffered in-process while the backing store is unreachable.
    pub offline_buffer_size: usize,
    pub keep_completed: usize,
    pub keep_failed: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            backend: QueueBackendKind::Redis,
            redis_url: "redis://localhost:6379".to_string(),
            sentinels: Vec::new(),
            key_prefix: "cronrelay".to_string(),
            attempts: 3,
            backoff_initial_ms: 5_000,
            lock_duration_ms: 30_000,
            lock_renewal_ms: 15_000,
            stalled_interval_ms: 30_000,
            connect_retries: 3,
            offline_buffer_size: 1_000,
            keep_completed: 100,
            keep_failed: 500,
        }
    }
}

/// Worker pool behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    pub concurrency: usize,
    pub poll_interval_ms: u64,
    pub shutdown_timeout_ms: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: 5,
            poll_interval_ms: 500,
            shutdown_timeout_ms: 30_000,
        }
    }
}

/// Outbound HTTP behavior for target callouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpSettings {
    pub timeout_ms: u64,
    pub max_redirects: usize,
    pub max_response_size: usize,
    pub keep_alive: bool,
    /// Inner retries on network errors and 5xx responses.
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            max_redirects: 5,
            max_response_size: 50 * 1024 * 1024,
            keep_alive: true,
            retry_attempts: 2,
            retry_backoff_ms: 1_000,
        }
    }
}

/// Header names recognized when parsing rate-limit responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitHeaderNames {
    pub remaining: Vec<String>,
    pub reset: Vec<String>,
    pub retry_after: Vec<String>,
}

impl Default for RateLimitHeaderNames {
    fn default() -> Self {
        Self {
            remaining: vec![
                "x-ratelimit-remaining".to_string(),
                "x-rate-limit-remaining".to_string(),
            ],
            reset: vec![
                "x-ratelimit-reset".to_string(),
                "x-rate-limit-reset".to_string(),
            ],
            retry_after: vec!["retry-after".to_string()],
        }
    }
}

/// Rate limiter defaults and per-host overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingSettings {
    pub default_requests_per_minute: u32,
    pub backoff_multiplier: f64,
    pub min_backoff_ms: u64,
    pub max_backoff_ms: u64,
    #[serde(default)]
    pub header_names: RateLimitHeaderNames,
    /// Per-host RPM overrides, superseding per-job defaults.
    #[serde(default)]
    pub per_host: HashMap<String, u32>,
}

impl Default for RateLimitingSettings {
    fn default() -> Self {
        Self {
            default_requests_per_minute: 60,
            backoff_multiplier: 2.0,
            min_backoff_ms: 1_000,
            max_backoff_ms: 300_000,
            header_names: RateLimitHeaderNames::default(),
            per_host: HashMap::new(),
        }
    }
}

/// Compression algorithm for stored response payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CompressionAlgorithm {
    #[default]
    Gzip,
    Deflate,
}

/// External storage target for oversized payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageProvider {
    #[default]
    Local,
    S3,
    Azure,
}

impl StorageProvider {
    pub fn scheme(&self) -> &'static str {
        match self {
            StorageProvider::Local => "local",
            StorageProvider::S3 => "s3",
            StorageProvider::Azure => "azure",
        }
    }
}

/// External storage location settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalStorageSettings {
    pub provider: StorageProvider,
    /// Bucket (s3/azure) or root directory (local).
    pub location: String,
    pub key_prefix: String,
    pub ttl_days: u32,
}

impl Default for ExternalStorageSettings {
    fn default() -> Self {
        Self {
            provider: StorageProvider::Local,
            location: "./cronrelay-responses".to_string(),
            key_prefix: "responses".to_string(),
            ttl_days: 30,
        }
    }
}

/// Response compression, truncation, and offload behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseHandlingSettings {
    pub compression_threshold: usize,
    pub algorithm: CompressionAlgorithm,
    /// flate2 compression level, 0..=9.
    pub level: u32,
    pub default_max_size_bytes: usize,
    #[serde(default)]
    pub storage: ExternalStorageSettings,
}

impl Default for ResponseHandlingSettings {
    fn default() -> Self {
        Self {
            compression_threshold: 1024,
            algorithm: CompressionAlgorithm::Gzip,
            level: 6,
            default_max_size_bytes: 10 * 1024 * 1024,
            storage: ExternalStorageSettings::default(),
        }
    }
}

/// Timezone policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimezoneSettings {
    pub default: String,
    /// Empty list permits every IANA zone.
    #[serde(default)]
    pub allowed: Vec<String>,
}

impl Default for TimezoneSettings {
    fn default() -> Self {
        Self {
            default: "UTC".to_string(),
            allowed: Vec::new(),
        }
    }
}

/// Duplicate suppression policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicatePreventionSettings {
    pub enabled: bool,
    pub window_minutes: u32,
    pub check_fingerprint: bool,
    pub check_idempotency_key: bool,
}

impl Default for DuplicatePreventionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            window_minutes: 5,
            check_fingerprint: true,
            check_idempotency_key: true,
        }
    }
}

/// Health monitor cadence and alert thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringSettings {
    pub probe_interval_ms: u64,
    /// Fraction of failed executions in the rolling window that flips the
    /// report to unhealthy.
    pub max_failure_rate: f64,
    pub max_queue_depth: u64,
    pub max_memory_bytes: u64,
    /// Number of recent execution outcomes retained for rolling metrics.
    pub metrics_window: usize,
}

impl Default for MonitoringSettings {
    fn default() -> Self {
        Self {
            probe_interval_ms: 60_000,
            max_failure_rate: 0.5,
            max_queue_depth: 10_000,
            max_memory_bytes: 1024 * 1024 * 1024,
            metrics_window: 500,
        }
    }
}

/// Outbound security policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecuritySettings {
    pub max_prompt_length: usize,
    /// Empty list permits every domain not otherwise blocked.
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    #[serde(default)]
    pub blocked_domains: Vec<String>,
    pub allowed_schemes: Vec<String>,
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            max_prompt_length: 10_000,
            allowed_domains: Vec::new(),
            blocked_domains: Vec::new(),
            allowed_schemes: vec!["http".to_string(), "https".to_string()],
        }
    }
}

/// Persistence locations and retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// SQLite path; `None` uses the platform data dir.
    #[serde(default)]
    pub path: Option<PathBuf>,
    pub jobs_table: String,
    pub executions_table: String,
    pub cleanup_interval_ms: u64,
    pub execution_retention_days: u32,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: None,
            jobs_table: "cron_jobs".to_string(),
            executions_table: "cron_executions".to_string(),
            cleanup_interval_ms: 3_600_000,
            execution_retention_days: 30,
        }
    }
}

impl Config {
    /// Load configuration from environment variables over defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Load configuration from a TOML file, then apply env overrides.
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let mut config: Self =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.apply_env()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(url) = env::var("REDIS_URL") {
            self.queue.redis_url = url;
        }
        if let Ok(backend) = env::var("QUEUE_BACKEND") {
            self.queue.backend = match backend.as_str() {
                "memory" => QueueBackendKind::Memory,
                "redis" => QueueBackendKind::Redis,
                other => {
                    return Err(ConfigError::InvalidValue {
                        key: "QUEUE_BACKEND".to_string(),
                        reason: format!("unknown backend: {other}"),
                    })
                }
            };
        }
        if let Ok(prefix) = env::var("QUEUE_KEY_PREFIX") {
            self.queue.key_prefix = prefix;
        }
        parse_env_u32("QUEUE_ATTEMPTS", &mut self.queue.attempts)?;
        parse_env_u64("QUEUE_BACKOFF_INITIAL_MS", &mut self.queue.backoff_initial_ms)?;
        parse_env_u64("QUEUE_LOCK_DURATION_MS", &mut self.queue.lock_duration_ms)?;
        parse_env_u64("QUEUE_LOCK_RENEWAL_MS", &mut self.queue.lock_renewal_ms)?;

        parse_env_usize("WORKER_CONCURRENCY", &mut self.worker.concurrency)?;
        parse_env_u64("WORKER_POLL_INTERVAL_MS", &mut self.worker.poll_interval_ms)?;
        parse_env_u64(
            "WORKER_SHUTDOWN_TIMEOUT_MS",
            &mut self.worker.shutdown_timeout_ms,
        )?;

        parse_env_u64("HTTP_TIMEOUT_MS", &mut self.http.timeout_ms)?;
        parse_env_usize("HTTP_MAX_REDIRECTS", &mut self.http.max_redirects)?;
        parse_env_usize("HTTP_MAX_RESPONSE_SIZE", &mut self.http.max_response_size)?;
        parse_env_u32("HTTP_RETRY_ATTEMPTS", &mut self.http.retry_attempts)?;

        parse_env_u32(
            "RATE_LIMIT_DEFAULT_RPM",
            &mut self.rate_limiting.default_requests_per_minute,
        )?;
        parse_env_u64(
            "RATE_LIMIT_MIN_BACKOFF_MS",
            &mut self.rate_limiting.min_backoff_ms,
        )?;
        parse_env_u64(
            "RATE_LIMIT_MAX_BACKOFF_MS",
            &mut self.rate_limiting.max_backoff_ms,
        )?;

        parse_env_usize(
            "RESPONSE_COMPRESSION_THRESHOLD",
            &mut self.response_handling.compression_threshold,
        )?;
        parse_env_usize(
            "RESPONSE_DEFAULT_MAX_SIZE_BYTES",
            &mut self.response_handling.default_max_size_bytes,
        )?;
        if let Ok(location) = env::var("RESPONSE_STORAGE_LOCATION") {
            self.response_handling.storage.location = location;
        }

        if let Ok(tz) = env::var("DEFAULT_TIMEZONE") {
            self.timezone.default = tz;
        }

        if let Ok(enabled) = env::var("DUPLICATE_PREVENTION_ENABLED") {
            self.duplicate_prevention.enabled = enabled == "true" || enabled == "1";
        }
        parse_env_u32(
            "DUPLICATE_WINDOW_MINUTES",
            &mut self.duplicate_prevention.window_minutes,
        )?;

        parse_env_u64(
            "HEALTH_PROBE_INTERVAL_MS",
            &mut self.monitoring.probe_interval_ms,
        )?;

        parse_env_usize("MAX_PROMPT_LENGTH", &mut self.security.max_prompt_length)?;

        if let Ok(path) = env::var("DATABASE_PATH") {
            self.database.path = Some(PathBuf::from(path));
        }
        parse_env_u32(
            "EXECUTION_RETENTION_DAYS",
            &mut self.database.execution_retention_days,
        )?;

        Ok(())
    }

    /// Validate every tunable against its hard minimum. Called once at
    /// startup; components may assume a validated config thereafter.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.http.timeout_ms < 1_000 {
            return Err(ConfigError::InvalidValue {
                key: "http.timeout_ms".to_string(),
                reason: "must be at least 1000 ms".to_string(),
            });
        }
        if self.queue.attempts < 1 {
            return Err(ConfigError::InvalidValue {
                key: "queue.attempts".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.worker.concurrency < 1 {
            return Err(ConfigError::InvalidValue {
                key: "worker.concurrency".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.queue.lock_renewal_ms >= self.queue.lock_duration_ms {
            return Err(ConfigError::InvalidValue {
                key: "queue.lock_renewal_ms".to_string(),
                reason: "must be shorter than queue.lock_duration_ms".to_string(),
            });
        }
        if self.rate_limiting.backoff_multiplier < 1.0 {
            return Err(ConfigError::InvalidValue {
                key: "rate_limiting.backoff_multiplier".to_string(),
                reason: "must be >= 1.0".to_string(),
            });
        }
        if self.rate_limiting.min_backoff_ms > self.rate_limiting.max_backoff_ms {
            return Err(ConfigError::InvalidValue {
                key: "rate_limiting.min_backoff_ms".to_string(),
                reason: "must not exceed rate_limiting.max_backoff_ms".to_string(),
            });
        }
        let max_size = self.response_handling.default_max_size_bytes;
        if !(1024..=50 * 1024 * 1024).contains(&max_size) {
            return Err(ConfigError::InvalidValue {
                key: "response_handling.default_max_size_bytes".to_string(),
                reason: "must be within 1 KiB..=50 MiB".to_string(),
            });
        }
        if self.response_handling.level > 9 {
            return Err(ConfigError::InvalidValue {
                key: "response_handling.level".to_string(),
                reason: "must be within 0..=9".to_string(),
            });
        }
        if self.security.max_prompt_length == 0 {
            return Err(ConfigError::InvalidValue {
                key: "security.max_prompt_length".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        for scheme in &self.security.allowed_schemes {
            if scheme != "http" && scheme != "https" {
                return Err(ConfigError::InvalidValue {
                    key: "security.allowed_schemes".to_string(),
                    reason: format!("unsupported scheme: {scheme}"),
                });
            }
        }
        if self.timezone.default.parse::<chrono_tz::Tz>().is_err() {
            return Err(ConfigError::InvalidValue {
                key: "timezone.default".to_string(),
                reason: format!("unrecognized zone: {}", self.timezone.default),
            });
        }
        if self.database.execution_retention_days == 0 {
            return Err(ConfigError::InvalidValue {
                key: "database.execution_retention_days".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Resolved SQLite path: configured value or the platform data dir.
    pub fn database_path(&self) -> PathBuf {
        match &self.database.path {
            Some(path) => path.clone(),
            None => {
                let base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
                base.join("cronrelay").join("cronrelay.db")
            }
        }
    }
}

fn parse_env_u32(key: &str, target: &mut u32) -> Result<(), ConfigError> {
    if let Ok(value) = env::var(key) {
        *target = value.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            reason: format!("not a valid integer: {value}"),
        })?;
    }
    Ok(())
}

fn parse_env_u64(key: &str, target: &mut u64) -> Result<(), ConfigError> {
    if let Ok(value) = env::var(key) {
        *target = value.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            reason: format!("not a valid integer: {value}"),
        })?;
    }
    Ok(())
}

fn parse_env_usize(key: &str, target: &mut usize) -> Result<(), ConfigError> {
    if let Ok(value) = env::var(key) {
        *target = value.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            reason: format!("not a valid integer: {value}"),
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().expect("default config validates");
        assert_eq!(config.worker.concurrency, 5);
        assert_eq!(config.http.timeout_ms, 30_000);
        assert_eq!(config.duplicate_prevention.window_minutes, 5);
        assert_eq!(config.database.execution_retention_days, 30);
    }

    #[test]
    fn rejects_short_http_timeout() {
        let mut config = Config::default();
        config.http.timeout_ms = 500;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { key, .. }) if key == "http.timeout_ms"
        ));
    }

    #[test]
    fn rejects_zero_attempts_and_concurrency() {
        let mut config = Config::default();
        config.queue.attempts = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.worker.concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_max_size() {
        let mut config = Config::default();
        config.response_handling.default_max_size_bytes = 512;
        assert!(config.validate().is_err());

        config.response_handling.default_max_size_bytes = 51 * 1024 * 1024;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unknown_scheme() {
        let mut config = Config::default();
        config.security.allowed_schemes.push("ftp".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bogus_default_timezone() {
        let mut config = Config::default();
        config.timezone.default = "Mars/Olympus".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_renewal_longer_than_lock() {
        let mut config = Config::default();
        config.queue.lock_renewal_ms = config.queue.lock_duration_ms;
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_from_toml() {
        let toml_src = r#"
            [worker]
            concurrency = 8
            poll_interval_ms = 250
            shutdown_timeout_ms = 10000

            [http]
            timeout_ms = 5000
            max_redirects = 2
            max_response_size = 1048576
            keep_alive = true
            retry_attempts = 1
            retry_backoff_ms = 500
        "#;
        let config: Config = toml::from_str(toml_src).unwrap();
        assert_eq!(config.worker.concurrency, 8);
        assert_eq!(config.http.timeout_ms, 5_000);
        // Unspecified groups fall back to defaults.
        assert_eq!(config.queue.attempts, 3);
    }
}
