//! Outbound HTTP execution of job callouts.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

use crate::config::HttpSettings;
use crate::types::Job;

/// Headers the caller's map may not override.
const HEADER_JOB_ID: &str = "X-Cron-Job-Id";
const HEADER_SOURCE: &str = "X-Source";
const HEADER_ORIGINAL_USER: &str = "X-Original-User";
const HEADER_SKILL_ID: &str = "X-Skill-Id";
const SOURCE_VALUE: &str = "cron-scheduler";

const DEFAULT_MODEL: &str = "default";

/// Result of a completed (2xx) callout.
#[derive(Debug, Clone)]
pub struct CallOutcome {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Value,
}

/// Errors from a callout attempt, after inner retries.
#[derive(Error, Debug, Clone)]
pub enum ExecutorError {
    #[error("request timed out after {0} ms")]
    Timeout(u64),

    #[error("network error: {0}")]
    Network(String),

    #[error("HTTP {status}")]
    Status {
        status: u16,
        headers: HashMap<String, String>,
        body: Option<Value>,
    },

    #[error("response exceeded {0} bytes")]
    TooLarge(usize),

    #[error("failed to build request: {0}")]
    Build(String),
}

/// Capability seam for the worker pipeline; tests inject a stub.
#[async_trait]
pub trait TargetExecutor: Send + Sync {
    async fn execute(&self, job: &Job) -> Result<CallOutcome, ExecutorError>;
}

/// reqwest-backed executor with bounded inner retries on network errors
/// and 5xx responses. The configured timeout is hard: expiry is not
/// retried here, the queue's retry policy owns that.
pub struct HttpExecutor {
    client: reqwest::Client,
    settings: HttpSettings,
}

impl HttpExecutor {
    pub fn new(settings: HttpSettings) -> Result<Self, ExecutorError> {
        let mut builder = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(settings.timeout_ms))
            .redirect(reqwest::redirect::Policy::limited(settings.max_redirects));
        if !settings.keep_alive {
            builder = builder.pool_max_idle_per_host(0);
        }
        let client = builder
            .build()
            .map_err(|e| ExecutorError::Build(e.to_string()))?;
        Ok(Self { client, settings })
    }

    /// Assemble the outbound header map: the job's headers first, the
    /// identity defaults where absent, and the non-overridable pair last.
    pub fn build_headers(job: &Job) -> HashMap<String, String> {
        let mut headers = job.headers.clone();
        headers
            .entry(HEADER_ORIGINAL_USER.to_string())
            .or_insert_with(|| job.created_by.clone());
        headers
            .entry(HEADER_SKILL_ID.to_string())
            .or_insert_with(|| job.skill_id.clone().unwrap_or_default());
        headers.insert(HEADER_JOB_ID.to_string(), job.job_uuid.to_string());
        headers.insert(HEADER_SOURCE.to_string(), SOURCE_VALUE.to_string());
        headers
    }

    /// Assemble the POST body.
    pub fn build_body(job: &Job) -> Value {
        let project_id = job
            .metadata
            .get("projectId")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .or_else(|| job.project_id.clone());
        let model = job
            .metadata
            .get("model")
            .and_then(|v| v.as_str())
            .unwrap_or(DEFAULT_MODEL);

        let mut context = serde_json::Map::new();
        context.insert("jobId".to_string(), Value::from(job.id.0));
        context.insert("jobUuid".to_string(), Value::from(job.job_uuid.to_string()));
        context.insert("userId".to_string(), Value::from(job.created_by.clone()));
        context.insert("orgId".to_string(), Value::from(job.org_id.clone()));
        context.insert(
            "skillId".to_string(),
            job.skill_id.clone().map(Value::from).unwrap_or(Value::Null),
        );
        context.insert("isScheduledExecution".to_string(), Value::from(true));
        context.insert(
            "timezone".to_string(),
            Value::from(job.user_timezone.clone()),
        );
        // Passthrough metadata fields, without clobbering the fixed keys.
        for (key, value) in &job.metadata {
            context.entry(key.clone()).or_insert_with(|| value.clone());
        }

        serde_json::json!({
            "prompt": job.prompt,
            "projectId": project_id,
            "model": model,
            "context": Value::Object(context),
        })
    }

    fn header_map(response: &reqwest::Response) -> HashMap<String, String> {
        response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_ascii_lowercase(),
                    value.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect()
    }

    async fn read_body(
        &self,
        response: reqwest::Response,
        max_size: usize,
    ) -> Result<Value, ExecutorError> {
        if let Some(length) = response.content_length() {
            if length as usize > max_size {
                return Err(ExecutorError::TooLarge(max_size));
            }
        }
        let bytes = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                ExecutorError::Timeout(self.settings.timeout_ms)
            } else {
                ExecutorError::Network(e.to_string())
            }
        })?;
        if bytes.len() > max_size {
            return Err(ExecutorError::TooLarge(max_size));
        }
        match serde_json::from_slice(&bytes) {
            Ok(value) => Ok(value),
            Err(_) => Ok(Value::String(
                String::from_utf8_lossy(&bytes).into_owned(),
            )),
        }
    }
}

#[async_trait]
impl TargetExecutor for HttpExecutor {
    async fn execute(&self, job: &Job) -> Result<CallOutcome, ExecutorError> {
        let headers = Self::build_headers(job);
        let body = Self::build_body(job);

        let mut last_error = ExecutorError::Network("no attempt made".to_string());
        for attempt in 0..=self.settings.retry_attempts {
            if attempt > 0 {
                let delay = self.settings.retry_backoff_ms * (1 << (attempt - 1).min(8)) as u64;
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
            }

            let mut request = self.client.post(&job.target_api).json(&body);
            for (name, value) in &headers {
                request = request.header(name.as_str(), value.as_str());
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    let response_headers = Self::header_map(&response);
                    if status.is_success() {
                        let body = self
                            .read_body(response, self.settings.max_response_size)
                            .await?;
                        return Ok(CallOutcome {
                            status: status.as_u16(),
                            headers: response_headers,
                            body,
                        });
                    }

                    let parsed = response.json::<Value>().await.ok();
                    last_error = ExecutorError::Status {
                        status: status.as_u16(),
                        headers: response_headers,
                        body: parsed,
                    };
                    // 5xx is retried inside the executor; everything else
                    // is the caller's decision.
                    if !status.is_server_error() {
                        return Err(last_error);
                    }
                    tracing::debug!(
                        target = %job.target_api,
                        status = status.as_u16(),
                        attempt,
                        "callout returned server error"
                    );
                }
                Err(e) => {
                    if e.is_timeout() {
                        return Err(ExecutorError::Timeout(self.settings.timeout_ms));
                    }
                    last_error = ExecutorError::Network(e.to_string());
                    tracing::debug!(
                        target = %job.target_api,
                        attempt,
                        error = %last_error,
                        "callout network error"
                    );
                }
            }
        }

        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{JobId, JobStatus, JobUuid, RateLimitSettings, ResponseSettings, Schedule};
    use chrono::Utc;

    fn job() -> Job {
        let mut metadata = serde_json::Map::new();
        metadata.insert("model".to_string(), Value::from("fast-model"));
        metadata.insert("environment".to_string(), Value::from("staging"));
        let mut headers = HashMap::new();
        headers.insert("Authorization".to_string(), "Bearer abc".to_string());
        // Attempted override of a protected header.
        headers.insert(HEADER_SOURCE.to_string(), "evil".to_string());
        Job {
            id: JobId(42),
            job_uuid: JobUuid::new(),
            idempotency_key: None,
            org_id: "org1".to_string(),
            project_id: Some("proj1".to_string()),
            created_by: "user1".to_string(),
            name: "ping".to_string(),
            prompt: "p".to_string(),
            target_api: "https://svc.example/ping".to_string(),
            headers,
            skill_id: Some("skill9".to_string()),
            metadata,
            schedule: Schedule::Once {
                date_time: Utc::now(),
            },
            user_timezone: "UTC".to_string(),
            status: JobStatus::Active,
            next_run_at: None,
            last_run_at: None,
            execution_count: 0,
            consecutive_failures: 0,
            rate_limit: RateLimitSettings::default(),
            response: ResponseSettings::default(),
            job_fingerprint: "f".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn protected_headers_cannot_be_overridden() {
        let job = job();
        let headers = HttpExecutor::build_headers(&job);
        assert_eq!(headers[HEADER_SOURCE], SOURCE_VALUE);
        assert_eq!(headers[HEADER_JOB_ID], job.job_uuid.to_string());
        // Caller-supplied headers survive.
        assert_eq!(headers["Authorization"], "Bearer abc");
        // Identity defaults are filled in.
        assert_eq!(headers[HEADER_ORIGINAL_USER], "user1");
        assert_eq!(headers[HEADER_SKILL_ID], "skill9");
    }

    #[test]
    fn caller_may_override_identity_defaults() {
        let mut j = job();
        j.headers
            .insert(HEADER_ORIGINAL_USER.to_string(), "impersonal".to_string());
        let headers = HttpExecutor::build_headers(&j);
        assert_eq!(headers[HEADER_ORIGINAL_USER], "impersonal");
    }

    #[test]
    fn body_carries_context_and_metadata() {
        let job = job();
        let body = HttpExecutor::build_body(&job);
        assert_eq!(body["prompt"], "p");
        assert_eq!(body["projectId"], "proj1");
        assert_eq!(body["model"], "fast-model");
        let context = &body["context"];
        assert_eq!(context["jobId"], 42);
        assert_eq!(context["orgId"], "org1");
        assert_eq!(context["userId"], "user1");
        assert_eq!(context["skillId"], "skill9");
        assert_eq!(context["isScheduledExecution"], true);
        assert_eq!(context["timezone"], "UTC");
        // Passthrough metadata.
        assert_eq!(context["environment"], "staging");
        // Fixed keys are not clobbered by metadata.
        assert_eq!(context["jobUuid"], job.job_uuid.to_string());
    }

    #[test]
    fn body_model_falls_back_to_default() {
        let mut j = job();
        j.metadata.remove("model");
        let body = HttpExecutor::build_body(&j);
        assert_eq!(body["model"], DEFAULT_MODEL);
    }

    #[test]
    fn executor_builds_with_default_settings() {
        assert!(HttpExecutor::new(HttpSettings::default()).is_ok());
    }
}
