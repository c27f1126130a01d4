//! Transport-agnostic API handlers.
//!
//! Each handler takes the authenticated caller and returns an
//! [`ApiResponse`] (status code plus JSON body) that an HTTP layer can
//! write out as is.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::core::action::{Action, Compose};
use crate::core::resource_pool::Spawn;
use crate::core::scheduler::Scheduler;
use crate::core::task::Task;
use crate::core::validator::Validator;
use crate::core::SchedulerError;
use crate::util::{clock, duration};

/// Authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    /// Owner name.
    pub name: String,
    /// May act on behalf of other owners.
    pub admin: bool,
}

impl Owner {
    /// Read `owner` (required string) and `admin` (optional bool) claims.
    pub fn from_claims(claims: &Map<String, Value>) -> Result<Self, SchedulerError> {
        let name = match claims.get("owner") {
            Some(Value::String(name)) if !name.is_empty() => name.clone(),
            Some(_) => return Err(SchedulerError::Unauthorized("owner claim must be a string".into())),
            None => return Err(SchedulerError::Unauthorized("owner claim is missing".into())),
        };
        let admin = match claims.get("admin") {
            None | Some(Value::Null) => false,
            Some(Value::Bool(admin)) => *admin,
            Some(_) => return Err(SchedulerError::Unauthorized("admin claim must be a boolean".into())),
        };
        Ok(Self { name, admin })
    }
}

/// Status code and JSON body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    /// HTTP status code.
    pub status: u16,
    /// JSON body, `null` when empty.
    pub body: Value,
}

impl ApiResponse {
    fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    fn empty(status: u16) -> Self {
        Self::new(status, Value::Null)
    }

    fn error(err: &SchedulerError) -> Self {
        let body = match err {
            SchedulerError::Validation(errors) => json!(errors),
            other => json!({ "error": other.to_string() }),
        };
        Self::new(err.http_status(), body)
    }

    fn json<T: Serialize>(status: u16, value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(body) => Self::new(status, body),
            Err(err) => Self::error(&SchedulerError::from(err)),
        }
    }
}

const fn one() -> u32 {
    1
}

const fn default_max_execution_time() -> Duration {
    Duration::from_secs(3600)
}

/// Submitted task: the public fields a caller may set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSubmission {
    /// Earliest start, now when absent.
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    /// Starvation bound.
    #[serde(default, with = "duration")]
    pub max_wait_time: Duration,
    /// Hard timeout.
    #[serde(default = "default_max_execution_time", with = "duration")]
    pub max_execution_time: Duration,
    /// CPU units.
    #[serde(default = "one")]
    pub cpu: u32,
    /// RAM units.
    #[serde(default = "one")]
    pub ram: u32,
    /// Retries after an error.
    #[serde(default)]
    pub retry: u32,
    /// Periodic interval.
    #[serde(default, with = "duration")]
    pub every: Duration,
    /// Cron expression.
    #[serde(default)]
    pub cron: Option<String>,
    /// Exported environment.
    #[serde(default)]
    pub environments: BTreeMap<String, String>,
    /// Labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// The work.
    pub action: Action,
}

/// Compose extension carrying the task fields of a YAML submission.
pub const BATCH_EXTENSION: &str = "x-batch";

impl TaskSubmission {
    /// Submission read from a compose YAML document. The task fields come
    /// from its [`BATCH_EXTENSION`] mapping, defaults when it is absent.
    pub fn from_compose_yaml(body: &[u8]) -> Result<Self, SchedulerError> {
        let compose = Compose::from_yaml(body)?;
        let mut fields = match compose.extensions.get(BATCH_EXTENSION) {
            None => Map::new(),
            Some(Value::Object(fields)) => fields.clone(),
            Some(other) => {
                return Err(SchedulerError::InvalidArgument(format!(
                    "{BATCH_EXTENSION} must be a mapping, got {other}"
                )))
            }
        };
        fields.insert("action".into(), serde_json::to_value(Action::Compose(compose))?);
        serde_json::from_value(Value::Object(fields))
            .map_err(|e| SchedulerError::InvalidArgument(format!("bad {BATCH_EXTENSION}: {e}")))
    }

    /// Submission read from a JSON task body.
    pub fn from_json(body: &[u8]) -> Result<Self, SchedulerError> {
        serde_json::from_slice(body)
            .map_err(|e| SchedulerError::InvalidArgument(format!("bad task body: {e}")))
    }

    /// Task owned by `owner`.
    pub fn into_task(self, owner: &str) -> Task {
        let mut task = Task::new(owner, self.action);
        task.start = self.start.unwrap_or_else(clock::now);
        task.max_wait_time = self.max_wait_time;
        task.max_execution_time = self.max_execution_time;
        task.cpu = self.cpu;
        task.ram = self.ram;
        task.retry = self.retry;
        task.every = self.every;
        task.cron = self.cron;
        task.environments = self.environments;
        task.labels = self.labels;
        task
    }
}

/// Encoding of a submitted task body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BodyFormat {
    /// A JSON [`TaskSubmission`].
    #[default]
    Json,
    /// A compose YAML document, task fields under [`BATCH_EXTENSION`].
    ComposeYaml,
}

impl BodyFormat {
    /// Format named by a `Content-Type` header; JSON unless it says YAML.
    pub fn from_content_type(content_type: &str) -> Self {
        let mime = content_type.split(';').next().unwrap_or_default().trim();
        match mime.to_ascii_lowercase().as_str() {
            "application/yaml" | "application/x-yaml" | "text/yaml" | "text/x-yaml" => Self::ComposeYaml,
            _ => Self::Json,
        }
    }

    fn parse(self, body: &[u8]) -> Result<TaskSubmission, SchedulerError> {
        match self {
            Self::Json => TaskSubmission::from_json(body),
            Self::ComposeYaml => TaskSubmission::from_compose_yaml(body),
        }
    }
}

/// Tasks visible to `caller`; only admins may filter on another owner.
pub fn list_schedules<S>(scheduler: &Scheduler<S>, caller: &Owner, owner: Option<&str>) -> ApiResponse
where
    S: Spawn + Send + Sync + 'static,
{
    let tasks = match (caller.admin, owner) {
        (false, Some(_)) => {
            return ApiResponse::error(&SchedulerError::Unauthorized(
                "only admins may filter by owner".into(),
            ))
        }
        (true, Some(owner)) => scheduler.filter(owner),
        (true, None) => scheduler.list(),
        (false, None) => scheduler.filter(&caller.name),
    };
    ApiResponse::json(200, &tasks)
}

/// One task, visible to its owner and to admins.
pub fn get_schedule<S>(scheduler: &Scheduler<S>, caller: &Owner, id: &str) -> ApiResponse
where
    S: Spawn + Send + Sync + 'static,
{
    let task = match parse_id(id).and_then(|id| scheduler.get_task(id)) {
        Ok(task) => task,
        Err(err) => return ApiResponse::error(&err),
    };
    if !caller.admin && task.owner != caller.name {
        return ApiResponse::error(&SchedulerError::Unauthorized("not your task".into()));
    }
    ApiResponse::json(200, &task)
}

/// Validate and admit a task body in `format`.
///
/// Only admins may submit on behalf of `owner`. Validation failures answer
/// 400 with the array of messages.
pub async fn submit_schedule<S>(
    scheduler: &Scheduler<S>,
    validator: &Validator,
    caller: &Owner,
    owner: Option<&str>,
    format: BodyFormat,
    body: &[u8],
) -> ApiResponse
where
    S: Spawn + Send + Sync + 'static,
{
    if owner.is_some() && !caller.admin {
        return ApiResponse::error(&SchedulerError::Unauthorized(
            "only admins may submit for another owner".into(),
        ));
    }
    let submission = match format.parse(body) {
        Ok(submission) => submission,
        Err(err) => return ApiResponse::error(&err),
    };
    let task = submission.into_task(owner.unwrap_or(&caller.name));
    if let Err(err) = validator.validate_task(&task) {
        tracing::info!(owner = %task.owner, error = %err, "task refused");
        return ApiResponse::error(&err);
    }
    match scheduler.add(task).await.and_then(|id| scheduler.get_task(id)) {
        Ok(task) => ApiResponse::json(201, &task),
        Err(err) => ApiResponse::error(&err),
    }
}

/// Cancel a task.
///
/// With `wait_for` the cancellation completes before answering 204;
/// otherwise it is spawned and the answer is 202.
pub async fn cancel_schedule<S>(
    scheduler: &Arc<Scheduler<S>>,
    caller: &Owner,
    id: &str,
    wait_for: bool,
) -> ApiResponse
where
    S: Spawn + Send + Sync + 'static,
{
    let task = match parse_id(id).and_then(|id| scheduler.get_task(id)) {
        Ok(task) => task,
        Err(err) => return ApiResponse::error(&err),
    };
    if !caller.admin && task.owner != caller.name {
        return ApiResponse::error(&SchedulerError::Unauthorized("not your task".into()));
    }
    let Some(id) = task.id else {
        return ApiResponse::error(&SchedulerError::Internal("stored task without id".into()));
    };
    if wait_for {
        return match scheduler.cancel(id).await {
            Ok(()) => ApiResponse::empty(204),
            Err(err) => ApiResponse::error(&err),
        };
    }
    let scheduler = Arc::clone(scheduler);
    tokio::spawn(async move {
        if let Err(err) = scheduler.cancel(id).await {
            tracing::error!(task = %id, error = %err, "background cancel failed");
        }
    });
    ApiResponse::empty(202)
}

/// Liveness probe.
pub fn health() -> ApiResponse {
    ApiResponse::new(200, json!({ "ok": true }))
}

fn parse_id(id: &str) -> Result<Uuid, SchedulerError> {
    Uuid::parse_str(id).map_err(|e| SchedulerError::InvalidArgument(format!("bad task id {id}: {e}")))
}
