//! Dummy action: sleeps for a while, then succeeds or fails.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::{Recovered, Run, RunRecord};
use crate::core::scope::{ExecScope, ScopeEnd};
use crate::core::task::Status;
use crate::core::SchedulerError;
use crate::util::clock;

/// Observes dummy runs from the outside.
#[derive(Debug, Clone, Default)]
pub struct DummyProbe {
    started: Arc<Mutex<Vec<String>>>,
    teardowns: Arc<AtomicUsize>,
}

impl DummyProbe {
    /// Empty probe.
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of the dummies launched so far, in launch order.
    pub fn started(&self) -> Vec<String> {
        self.started.lock().clone()
    }

    /// Number of teardowns performed.
    pub fn teardowns(&self) -> usize {
        self.teardowns.load(Ordering::Acquire)
    }
}

/// Sleep `wait` milliseconds, then report done, or error when `fail`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Dummy {
    /// Label recorded by the probe.
    #[serde(default)]
    pub name: String,
    /// Sleep length in milliseconds.
    #[serde(default)]
    pub wait: u64,
    /// Report an error instead of success.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub fail: bool,
    #[serde(skip)]
    probe: Option<DummyProbe>,
}

impl Dummy {
    /// Dummy sleeping for `wait`.
    pub fn new(name: impl Into<String>, wait: Duration) -> Self {
        Self {
            name: name.into(),
            wait: u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
            fail: false,
            probe: None,
        }
    }

    /// Make the run end in error.
    #[must_use]
    pub const fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    /// Attach a probe.
    #[must_use]
    pub fn with_probe(mut self, probe: &DummyProbe) -> Self {
        self.probe = Some(probe.clone());
        self
    }

    /// Always valid.
    #[allow(clippy::unused_self)]
    pub fn validate(&self) -> Result<(), SchedulerError> {
        Ok(())
    }

    /// Launch the sleep.
    pub fn up(&self, workdir: &Path, environments: &BTreeMap<String, String>) -> DummyRun {
        tracing::debug!(name = %self.name, workdir = %workdir.display(), env = environments.len(), "dummy up");
        if let Some(probe) = &self.probe {
            probe.started.lock().push(self.name.clone());
        }
        DummyRun {
            path: workdir.to_path_buf(),
            start: clock::now(),
            finish: None,
            until: Instant::now() + Duration::from_millis(self.wait),
            fail: self.fail,
            torn_down: false,
            probe: self.probe.clone(),
        }
    }
}

impl Dummy {
    /// Resume the sleep started at `record.start`, or report how it ended.
    pub fn reattach(&self, record: &RunRecord) -> Recovered {
        let Some(path) = record.path.clone() else {
            return Recovered::Lost;
        };
        let total = Duration::from_millis(self.wait);
        let elapsed = clock::since(record.start);
        if record.finish.is_some() || elapsed >= total {
            return Recovered::Exited(record.exit_code.unwrap_or_else(|| i64::from(self.fail)));
        }
        Recovered::Running(Run::Dummy(DummyRun {
            path,
            start: record.start,
            finish: None,
            until: Instant::now() + (total - elapsed),
            fail: self.fail,
            torn_down: false,
            probe: self.probe.clone(),
        }))
    }
}

/// Running dummy.
#[derive(Debug)]
pub struct DummyRun {
    path: PathBuf,
    start: DateTime<Utc>,
    finish: Option<DateTime<Utc>>,
    until: Instant,
    fail: bool,
    torn_down: bool,
    probe: Option<DummyProbe>,
}

impl DummyRun {
    /// Wait for the sleep to end or for `scope` to end.
    pub async fn wait(&mut self, scope: &ExecScope) -> Result<Status, SchedulerError> {
        let status = tokio::select! {
            biased;
            end = scope.ended() => {
                self.down();
                match end {
                    ScopeEnd::Canceled => Status::Canceled,
                    ScopeEnd::Timeout => Status::Timeout,
                }
            }
            () = tokio::time::sleep_until(self.until) => {
                if self.fail { Status::Error } else { Status::Done }
            }
        };
        self.finish = Some(clock::now());
        Ok(status)
    }

    /// Count one teardown, the first time only.
    pub fn down(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        if let Some(probe) = &self.probe {
            probe.teardowns.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Serializable view.
    pub fn record(&self) -> RunRecord {
        RunRecord {
            runner: "dummy".to_string(),
            id: None,
            path: Some(self.path.clone()),
            start: self.start,
            finish: self.finish,
            exit_code: self.finish.map(|_| i64::from(self.fail)),
            running: self.finish.is_none(),
        }
    }
}
