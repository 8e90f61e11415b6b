//! Task-service client: a thin, retrying facade over the remote queue.
//!
//! The scheduler and supervisor depend on the [`TaskService`] trait, not
//! the HTTP client, so tests can drive them with an in-process fake.
//! Transient transport failures and 5xx responses retry with bounded
//! exponential backoff; after exhaustion read operations degrade to an
//! empty result and write operations report `false`.

use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::validate::{self, ValidationError};

/// Default per-call timeout for remote requests.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Remote task status as reported by the task service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Idle,
    Working,
    Complete,
    #[serde(other)]
    Other,
}

/// State transitions the scheduler and supervisor push to the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateState {
    /// Requeue: return the task to the idle pool.
    Idle,
    Working,
    Completed,
    Failed,
}

impl UpdateState {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateState::Idle => "idle",
            UpdateState::Working => "working",
            UpdateState::Completed => "complete",
            UpdateState::Failed => "failed",
        }
    }
}

/// Deserialize a task id that may arrive as a JSON number or string.
fn de_id<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    match Value::deserialize(d)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {}",
            other
        ))),
    }
}

/// Same as [`de_id`] but tolerating `null` and absence.
fn de_opt_id<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    match Value::deserialize(d)? {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s)),
        Value::Number(n) => Ok(Some(n.to_string())),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {}",
            other
        ))),
    }
}

/// Transient view of a remote task. Never persisted locally.
#[derive(Debug, Clone, PartialEq, Deserialize, Default)]
pub struct Task {
    #[serde(alias = "task_id", deserialize_with = "de_id")]
    pub id: String,
    #[serde(default)]
    pub assigned_to: Option<String>,
    #[serde(default)]
    pub queue_name: Option<String>,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub recipe: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default, deserialize_with = "de_opt_id")]
    pub blocked_by_task_id: Option<String>,
    #[serde(default)]
    pub is_currently_blocked: bool,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("task service returned {status}: {body}")]
    Api { status: u16, body: String },
}

/// Bounded exponential backoff: base doubles per attempt up to a cap.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Delay to sleep before the given retry (attempt 1 is the first retry).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

/// Operations the scheduler and supervisor need from the task service.
///
/// Implementations absorb transient failures: reads return an empty list
/// (with a warning) and writes return `false` rather than erroring, so a
/// reconciliation pass can always proceed. Every operation is idempotent
/// at the caller level.
pub trait TaskService {
    /// Idle tasks already assigned to `agent`.
    fn list_idle_tasks(&self, agent: &str, limit: usize) -> Vec<Task>;

    /// Unassigned idle tasks waiting in `queue`.
    fn get_unassigned_in_queue(&self, queue: &str, limit: usize) -> Vec<Task>;

    /// Best-effort assignment of a task to an agent.
    fn assign(&self, task_id: &str, agent: &str) -> bool;

    /// Push a task lifecycle state with optional metadata.
    fn update_state(&self, task_id: &str, state: UpdateState, metadata: Value) -> bool;

    /// Advisory single-task fetch; `None` on miss or failure.
    fn get_task(&self, task_id: &str) -> Option<Task>;
}

/// HTTP+JSON implementation of [`TaskService`].
pub struct HttpTaskClient {
    http: reqwest::blocking::Client,
    endpoint: String,
    retry: RetryPolicy,
}

impl HttpTaskClient {
    pub fn new(endpoint: &str, timeout: Duration, retry: RetryPolicy) -> Result<Self, ClientError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            retry,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    /// Run a request with retry. Transport errors and 5xx retry with
    /// backoff; 4xx responses are API errors and do not.
    fn execute<F>(&self, build: F) -> Result<Value, ClientError>
    where
        F: Fn() -> reqwest::blocking::RequestBuilder,
    {
        let mut last_err = ClientError::Api {
            status: 0,
            body: "no attempts made".to_string(),
        };

        for attempt in 0..self.retry.max_attempts {
            if attempt > 0 {
                std::thread::sleep(self.retry.delay_for(attempt));
            }
            match build().send() {
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.text().unwrap_or_default();
                    if status.is_success() {
                        if body.trim().is_empty() {
                            return Ok(Value::Null);
                        }
                        return Ok(serde_json::from_str(&body).unwrap_or(Value::Null));
                    }
                    let err = ClientError::Api {
                        status: status.as_u16(),
                        body,
                    };
                    if status.is_server_error() {
                        debug!(attempt, %status, "task service 5xx, will retry");
                        last_err = err;
                    } else {
                        return Err(err);
                    }
                }
                Err(e) => {
                    debug!(attempt, error = %e, "task service request failed, will retry");
                    last_err = ClientError::Transport(e);
                }
            }
        }
        Err(last_err)
    }

    /// Accept either a bare array or `{"tasks": [...]}`.
    fn parse_tasks(value: Value) -> Vec<Task> {
        let items = match value {
            Value::Array(items) => items,
            Value::Object(mut map) => match map.remove("tasks") {
                Some(Value::Array(items)) => items,
                _ => return Vec::new(),
            },
            _ => return Vec::new(),
        };

        items
            .into_iter()
            .filter_map(|item| match serde_json::from_value::<Task>(item) {
                Ok(task) => Some(task),
                Err(e) => {
                    warn!(error = %e, "skipping unparseable task from service");
                    None
                }
            })
            .collect()
    }
}

impl TaskService for HttpTaskClient {
    fn list_idle_tasks(&self, agent: &str, limit: usize) -> Vec<Task> {
        if let Err(e) = validate::validate_agent_name(agent) {
            warn!(agent, error = %e, "refusing idle-task query for invalid agent");
            return Vec::new();
        }
        let url = self.url("/tasks");
        let limit = limit.to_string();
        let result = self.execute(|| {
            self.http.get(&url).query(&[
                ("assigned_to", agent),
                ("status", "idle"),
                ("limit", limit.as_str()),
            ])
        });
        match result {
            Ok(value) => Self::parse_tasks(value),
            Err(e) => {
                warn!(agent, error = %e, "failed to list idle tasks, treating as empty");
                Vec::new()
            }
        }
    }

    fn get_unassigned_in_queue(&self, queue: &str, limit: usize) -> Vec<Task> {
        if let Err(e) = validate::validate_agent_name(queue) {
            warn!(queue, error = %e, "refusing unassigned query for invalid queue");
            return Vec::new();
        }
        let url = self.url(&format!("/queues/{}/unassigned", queue));
        let limit_param = limit.to_string();
        let result = self.execute(|| {
            self.http
                .get(&url)
                .query(&[("limit", limit_param.as_str())])
        });
        match result {
            Ok(value) => {
                let mut tasks = Self::parse_tasks(value);
                tasks.truncate(limit);
                tasks
            }
            Err(e) => {
                warn!(queue, error = %e, "failed to query unassigned tasks, treating as empty");
                Vec::new()
            }
        }
    }

    fn assign(&self, task_id: &str, agent: &str) -> bool {
        if validate::validate_task_id(task_id).is_err()
            || validate::validate_agent_name(agent).is_err()
        {
            warn!(task_id, agent, "refusing assignment with invalid identifiers");
            return false;
        }
        let url = self.url(&format!("/tasks/{}/assign", task_id));
        let body = serde_json::json!({ "assigned_to": agent });
        match self.execute(|| self.http.post(&url).json(&body)) {
            Ok(_) => true,
            Err(e) => {
                warn!(task_id, agent, error = %e, "failed to assign task");
                false
            }
        }
    }

    fn update_state(&self, task_id: &str, state: UpdateState, metadata: Value) -> bool {
        if validate::validate_task_id(task_id).is_err() {
            warn!(task_id, "refusing state update with invalid task id");
            return false;
        }
        let url = self.url(&format!("/tasks/{}/state", task_id));
        let mut body = serde_json::Map::new();
        body.insert("status".to_string(), Value::String(state.as_str().to_string()));
        if let Value::Object(extra) = metadata {
            for (k, v) in extra {
                body.entry(k).or_insert(v);
            }
        }
        let body = Value::Object(body);
        match self.execute(|| self.http.post(&url).json(&body)) {
            Ok(_) => true,
            Err(e) => {
                warn!(task_id, state = state.as_str(), error = %e, "failed to update task state");
                false
            }
        }
    }

    fn get_task(&self, task_id: &str) -> Option<Task> {
        if validate::validate_task_id(task_id).is_err() {
            return None;
        }
        let url = self.url(&format!("/tasks/{}", task_id));
        match self.execute(|| self.http.get(&url)) {
            Ok(Value::Object(mut map)) => {
                let inner = map.remove("task").unwrap_or(Value::Object(map));
                serde_json::from_value(inner).ok()
            }
            Ok(_) => None,
            Err(e) => {
                debug!(task_id, error = %e, "advisory task fetch failed");
                None
            }
        }
    }
}
