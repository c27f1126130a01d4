//! Polymorphic units of work and their running instances.
//!
//! An [`Action`] is stored inside a task and serialized as a single-key
//! object naming its kind, e.g. `{"compose": {...}}`. [`Action::up`]
//! materializes it in a working directory and returns a [`Run`] handle;
//! [`Action::reattach`] finds a run again from its [`RunRecord`] after a
//! restart.

pub mod compose;
pub mod dummy;
pub mod graph;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::scope::ExecScope;
use crate::core::task::Status;
use crate::core::SchedulerError;

pub use compose::{Compose, ComposeRun, ContainerState, VolumeMount};
pub use dummy::{Dummy, DummyProbe, DummyRun};
pub use graph::ServiceGraph;

/// Kind of an action, also the key of its serialized form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    /// Container composition.
    Compose,
    /// In-process sleep, for tests and dry runs.
    Dummy,
}

impl ActionKind {
    /// Registered name of the kind.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Compose => "compose",
            Self::Dummy => "dummy",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "compose" => Ok(Self::Compose),
            "dummy" => Ok(Self::Dummy),
            other => Err(SchedulerError::InvalidArgument(format!(
                "unknown action kind: {other}"
            ))),
        }
    }
}

/// Unit of work carried by a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Run a container composition.
    Compose(Compose),
    /// Sleep, then succeed or fail.
    Dummy(Dummy),
}

impl Action {
    /// Kind of this action.
    pub const fn kind(&self) -> ActionKind {
        match self {
            Self::Compose(_) => ActionKind::Compose,
            Self::Dummy(_) => ActionKind::Dummy,
        }
    }

    /// Stable name used to route to validators and recomposers.
    pub const fn registered_name(&self) -> &'static str {
        self.kind().as_str()
    }

    /// Structural check of the action's own fields.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        match self {
            Self::Compose(compose) => compose.validate(),
            Self::Dummy(dummy) => dummy.validate(),
        }
    }

    /// Find the run described by `record` again.
    pub async fn reattach(&self, record: &RunRecord) -> Recovered {
        match self {
            Self::Compose(compose) => compose.reattach(record).await,
            Self::Dummy(dummy) => dummy.reattach(record),
        }
    }

    /// Materialize the action in `workdir` and launch it.
    pub async fn up(
        &self,
        workdir: &Path,
        environments: &BTreeMap<String, String>,
    ) -> Result<Run, SchedulerError> {
        match self {
            Self::Compose(compose) => compose.up(workdir, environments).await.map(Run::Compose),
            Self::Dummy(dummy) => Ok(Run::Dummy(dummy.up(workdir, environments))),
        }
    }
}

/// Handle on a launched action.
#[derive(Debug)]
pub enum Run {
    /// Running composition.
    Compose(ComposeRun),
    /// Running sleep.
    Dummy(DummyRun),
}

impl Run {
    /// Wait for completion or for `scope` to end.
    ///
    /// A cancelled or expired scope tears the run down before returning
    /// [`Status::Canceled`] or [`Status::Timeout`].
    pub async fn wait(&mut self, scope: &ExecScope) -> Result<Status, SchedulerError> {
        match self {
            Self::Compose(run) => run.wait(scope).await,
            Self::Dummy(run) => run.wait(scope).await,
        }
    }

    /// Release external resources. Idempotent.
    pub async fn down(&mut self) -> Result<(), SchedulerError> {
        match self {
            Self::Compose(run) => run.down().await,
            Self::Dummy(run) => {
                run.down();
                Ok(())
            }
        }
    }

    /// Serializable view of the run.
    pub fn record(&self) -> RunRecord {
        match self {
            Self::Compose(run) => run.record(),
            Self::Dummy(run) => run.record(),
        }
    }
}

/// Outcome of looking a persisted run up again.
#[derive(Debug)]
pub enum Recovered {
    /// Still going; follow it.
    Running(Run),
    /// Finished with this exit code while nobody watched.
    Exited(i64),
    /// The engine gave up on it.
    Dead,
    /// Nothing left to find.
    Lost,
}

/// What a task remembers about its last run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Registered name of the action.
    pub runner: String,
    /// Container identifier, when there is one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Working directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Launch instant.
    pub start: DateTime<Utc>,
    /// Completion instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish: Option<DateTime<Utc>>,
    /// Exit code of the main process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    /// Still running at the time of the record.
    pub running: bool,
}
