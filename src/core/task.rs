//! Task record, lifecycle status and ordering helpers.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::action::{Action, RunRecord};
use crate::core::scope::TaskCancel;
use crate::core::SchedulerError;
use crate::util::{clock, duration, format_duration};

static LABEL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]+([.-][a-z0-9]+)*$").expect("label pattern compiles"));

/// Lifecycle status of a task.
///
/// `waiting → {running, canceled, error}`, `running → {done, error, canceled,
/// timeout}`; the last four are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "&'static str")]
pub enum Status {
    /// Admitted, not started yet.
    #[default]
    Waiting,
    /// Dispatched, holding resources.
    Running,
    /// Finished successfully.
    Done,
    /// Cancelled by a caller.
    Canceled,
    /// Failed, or starved past its maximum wait time.
    Error,
    /// Exceeded its maximum execution time.
    Timeout,
}

impl Status {
    /// Every status, in declaration order.
    pub const ALL: [Self; 6] = [
        Self::Waiting,
        Self::Running,
        Self::Done,
        Self::Canceled,
        Self::Error,
        Self::Timeout,
    ];

    /// Lowercase name used on the wire and in events.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Running => "running",
            Self::Done => "done",
            Self::Canceled => "canceled",
            Self::Error => "error",
            Self::Timeout => "timeout",
        }
    }

    /// Whether the status is absorbing.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Canceled | Self::Error | Self::Timeout)
    }

    /// Whether `self → next` is an edge of the lifecycle graph.
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Waiting, Self::Running | Self::Canceled | Self::Error)
                | (
                    Self::Running,
                    Self::Done | Self::Error | Self::Canceled | Self::Timeout
                )
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| SchedulerError::InvalidArgument(format!("not a known status: {s}")))
    }
}

impl TryFrom<String> for Status {
    type Error = SchedulerError;

    fn try_from(value: String) -> Result<Self, SchedulerError> {
        value.parse()
    }
}

impl From<Status> for &'static str {
    fn from(status: Status) -> Self {
        status.as_str()
    }
}

const fn one() -> u32 {
    1
}

const fn default_max_execution_time() -> Duration {
    Duration::from_secs(3600)
}

/// A scheduled unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Assigned by the scheduler at admission.
    #[serde(default)]
    pub id: Option<Uuid>,
    /// Submitter, used for filtering.
    #[serde(default)]
    pub owner: String,
    /// Earliest start.
    #[serde(default = "clock::now")]
    pub start: DateTime<Utc>,
    /// Starvation bound after `start`; zero disables it.
    #[serde(default, with = "duration")]
    pub max_wait_time: Duration,
    /// Hard timeout of the running phase.
    #[serde(default = "default_max_execution_time", with = "duration")]
    pub max_execution_time: Duration,
    /// CPU units requested.
    #[serde(default = "one")]
    pub cpu: u32,
    /// RAM units requested.
    #[serde(default = "one")]
    pub ram: u32,
    /// The work itself.
    #[serde(default)]
    pub action: Option<Action>,
    /// Lifecycle status.
    #[serde(default)]
    pub status: Status,
    /// Instant of the last status change.
    #[serde(default = "clock::now")]
    pub mtime: DateTime<Utc>,
    /// Remaining retries after an error.
    #[serde(default)]
    pub retry: u32,
    /// Periodic re-arming interval, exclusive with `cron`.
    #[serde(default, with = "duration")]
    pub every: Duration,
    /// Cron re-arming expression, exclusive with `every`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    /// Environment exported to the action.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environments: BTreeMap<String, String>,
    /// Free-form labels.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Last run of the action.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<RunRecord>,
    /// Message of the last failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Number of dispatches so far.
    #[serde(default)]
    pub attempts: u32,
    /// Installed by the scheduler while the task runs.
    #[serde(skip)]
    pub cancel: Option<TaskCancel>,
}

impl Default for Task {
    fn default() -> Self {
        let now = clock::now();
        Self {
            id: None,
            owner: String::new(),
            start: now,
            max_wait_time: Duration::ZERO,
            max_execution_time: default_max_execution_time(),
            cpu: 1,
            ram: 1,
            action: None,
            status: Status::Waiting,
            mtime: now,
            retry: 0,
            every: Duration::ZERO,
            cron: None,
            environments: BTreeMap::new(),
            labels: BTreeMap::new(),
            run: None,
            error: None,
            attempts: 0,
            cancel: None,
        }
    }
}

impl Task {
    /// New waiting task for `owner` running `action`.
    pub fn new(owner: impl Into<String>, action: Action) -> Self {
        Self {
            owner: owner.into(),
            action: Some(action),
            ..Self::default()
        }
    }

    /// Set the resource request.
    #[must_use]
    pub const fn with_resources(mut self, cpu: u32, ram: u32) -> Self {
        self.cpu = cpu;
        self.ram = ram;
        self
    }

    /// Set the maximum execution time.
    #[must_use]
    pub const fn with_max_execution_time(mut self, max: Duration) -> Self {
        self.max_execution_time = max;
        self
    }

    /// Set the earliest start.
    #[must_use]
    pub const fn with_start(mut self, start: DateTime<Utc>) -> Self {
        self.start = start;
        self
    }

    /// Set the retry budget.
    #[must_use]
    pub const fn with_retry(mut self, retry: u32) -> Self {
        self.retry = retry;
        self
    }

    /// Structural checks independent of the resource budget.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.owner.trim().is_empty() {
            return Err(SchedulerError::InvalidArgument("owner must not be empty".into()));
        }
        if !self.every.is_zero() && self.cron.is_some() {
            return Err(SchedulerError::InvalidArgument(
                "every and cron are mutually exclusive".into(),
            ));
        }
        if let Some(expression) = &self.cron {
            parse_cron(expression)?;
        }
        for (key, value) in &self.labels {
            if !LABEL_PATTERN.is_match(key) || !LABEL_PATTERN.is_match(value) {
                return Err(SchedulerError::InvalidArgument(format!(
                    "invalid label {key}={value}"
                )));
            }
        }
        Ok(())
    }

    /// Whether the task re-arms itself after a run.
    pub const fn has_cron(&self) -> bool {
        !self.every.is_zero() || self.cron.is_some()
    }

    /// Move `start` to the next periodic instant after `now`.
    ///
    /// An unparsable cron expression turns the task into an error.
    pub fn prepare_reschedule(&mut self, now: DateTime<Utc>) {
        if !self.every.is_zero() {
            self.start = clock::add(now, self.every);
        }
        if let Some(expression) = &self.cron {
            match parse_cron(expression).map(|schedule| schedule.after(&now).next()) {
                Ok(Some(next)) => self.start = next,
                Ok(None) => {
                    self.status = Status::Error;
                    self.error = Some(format!("cron `{expression}` has no next occurrence"));
                }
                Err(err) => {
                    tracing::error!(task = ?self.id, cron = %expression, error = %err, "invalid cron");
                    self.status = Status::Error;
                    self.error = Some(err.to_string());
                }
            }
        }
    }

    /// Variables exported to every run next to the task's own environment.
    pub fn predefined_env(&self, now: DateTime<Utc>) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("BATCH".to_string(), "true".to_string());
        env.insert("BATCH_STARTED_AT_DATE".to_string(), now.format("%Y/%m/%d").to_string());
        env.insert("BATCH_STARTED_AT_TIME".to_string(), now.format("%H:%M:%S").to_string());
        env.insert(
            "BATCH_TASK_ID".to_string(),
            self.id.map(|id| id.to_string()).unwrap_or_default(),
        );
        env.insert(
            "BATCH_RUNNER".to_string(),
            self.action
                .as_ref()
                .map(|a| a.registered_name().to_string())
                .unwrap_or_default(),
        );
        env.insert(
            "BATCH_MAX_EXECUTION_TIME".to_string(),
            format_duration(self.max_execution_time),
        );
        env
    }

    /// Environment handed to the action: the task's own plus predefined.
    pub fn run_environment(&self, now: DateTime<Utc>) -> BTreeMap<String, String> {
        let mut env = self.environments.clone();
        env.extend(self.predefined_env(now));
        env
    }

    /// Ordering scalar: cost times duration, smaller runs first.
    ///
    /// Cheap and short tasks come first; the product keeps integer
    /// arithmetic exact for every request.
    pub fn karma(&self) -> u128 {
        u128::from(self.cpu) * u128::from(self.ram) * self.max_execution_time.as_nanos()
    }
}

/// Compare by karma, smaller first.
pub fn by_karma(a: &Task, b: &Task) -> Ordering {
    a.karma().cmp(&b.karma())
}

/// Compare by start instant, earlier first.
pub fn by_start(a: &Task, b: &Task) -> Ordering {
    a.start.cmp(&b.start)
}

/// Parse a cron expression; 5-field forms get a leading seconds field.
pub fn parse_cron(expression: &str) -> Result<cron::Schedule, SchedulerError> {
    let fields = expression.split_whitespace().count();
    let normalized = if fields == 5 {
        format!("0 {expression}")
    } else {
        expression.to_string()
    };
    cron::Schedule::from_str(&normalized)
        .map_err(|e| SchedulerError::InvalidArgument(format!("invalid cron `{expression}`: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::action::Dummy;

    fn task(cpu: u32, ram: u32, secs: u64) -> Task {
        Task::new("alice", Action::Dummy(Dummy::new("t", Duration::ZERO)))
            .with_resources(cpu, ram)
            .with_max_execution_time(Duration::from_secs(secs))
    }

    #[test]
    fn status_names_round_trip() {
        for status in Status::ALL {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{status}\""));
            let back: Status = serde_json::from_str(&json).unwrap();
            assert_eq!(back, status);
        }
    }

    #[test]
    fn unknown_status_is_invalid_argument() {
        assert!(matches!(
            "finished".parse::<Status>(),
            Err(SchedulerError::InvalidArgument(_))
        ));
        assert!(serde_json::from_str::<Status>("\"finished\"").is_err());
        assert!(matches!(
            Status::try_from("finished".to_string()),
            Err(SchedulerError::InvalidArgument(_))
        ));
        assert_eq!(Status::try_from("error".to_string()).unwrap(), Status::Error);
    }

    #[test]
    fn transitions_follow_the_lifecycle() {
        assert!(Status::Waiting.can_transition_to(Status::Running));
        assert!(Status::Waiting.can_transition_to(Status::Canceled));
        assert!(!Status::Waiting.can_transition_to(Status::Done));
        assert!(Status::Running.can_transition_to(Status::Timeout));
        for terminal in [Status::Done, Status::Canceled, Status::Error, Status::Timeout] {
            assert!(terminal.is_terminal());
            for next in Status::ALL {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn karma_prefers_short_cheap_tasks() {
        let long = task(1, 1, 10);
        let short = task(1, 1, 1);
        let heavy = task(2, 4, 1);
        assert_eq!(by_karma(&short, &long), Ordering::Less);
        assert_eq!(by_karma(&short, &heavy), Ordering::Less);
        assert_eq!(by_karma(&short, &task(1, 1, 1)), Ordering::Equal);
    }

    #[test]
    fn json_round_trip_keeps_public_fields() {
        let mut t = task(2, 512, 30);
        t.id = Some(Uuid::new_v4());
        t.retry = 3;
        t.every = Duration::from_secs(60);
        t.max_wait_time = Duration::from_millis(1500);
        t.environments.insert("NAME".into(), "Bob".into());
        t.labels.insert("team".into(), "infra".into());
        t.status = Status::Timeout;

        let json = serde_json::to_value(&t).unwrap();
        let back: Task = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(serde_json::to_value(&back).unwrap(), json);
        assert_eq!(back.max_wait_time, Duration::from_millis(1500));
        assert_eq!(back.status, Status::Timeout);
    }

    #[test]
    fn durations_accept_nanoseconds() {
        let t: Task = serde_json::from_str(
            r#"{"owner":"bob","max_execution_time":3000000000,"action":{"dummy":{"wait":5}}}"#,
        )
        .unwrap();
        assert_eq!(t.max_execution_time, Duration::from_secs(3));
        assert_eq!(t.cpu, 1);
        assert_eq!(t.status, Status::Waiting);
    }

    #[test]
    fn validate_rejects_bad_fields() {
        let mut t = task(1, 1, 1);
        t.owner = String::new();
        assert!(t.validate().is_err());

        let mut t = task(1, 1, 1);
        t.every = Duration::from_secs(5);
        t.cron = Some("*/5 * * * *".into());
        assert!(t.validate().is_err());

        let mut t = task(1, 1, 1);
        t.labels.insert("Bad Key".into(), "x".into());
        assert!(t.validate().is_err());

        let mut t = task(1, 1, 1);
        t.cron = Some("*/5 * * * *".into());
        assert!(t.validate().is_ok());
    }

    #[test]
    fn reschedule_moves_start() {
        let now = clock::now();
        let mut t = task(1, 1, 1);
        t.every = Duration::from_secs(90);
        t.prepare_reschedule(now);
        assert_eq!(t.start, clock::add(now, Duration::from_secs(90)));

        let mut t = task(1, 1, 1);
        t.cron = Some("0 * * * *".into());
        t.prepare_reschedule(now);
        assert!(t.start > now);

        let mut t = task(1, 1, 1);
        t.cron = Some("not a cron".into());
        t.prepare_reschedule(now);
        assert_eq!(t.status, Status::Error);
    }

    #[test]
    fn predefined_env_names_the_runner() {
        let mut t = task(1, 1, 30);
        t.id = Some(Uuid::nil());
        t.environments.insert("NAME".into(), "Bob".into());
        let env = t.run_environment(clock::now());
        assert_eq!(env.get("BATCH_RUNNER").map(String::as_str), Some("dummy"));
        assert_eq!(env.get("BATCH_MAX_EXECUTION_TIME").map(String::as_str), Some("30s"));
        assert_eq!(env.get("NAME").map(String::as_str), Some("Bob"));
    }
}
