//! Drives an action from a task: working directory, recomposition, launch.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::core::action::{Recovered, Run};
use crate::core::recompose::Recomposator;
use crate::core::task::Task;
use crate::core::SchedulerError;
use crate::util::clock;

/// Launches the action of a task.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Prepare and launch `task`'s action.
    async fn up(&self, task: &Task) -> Result<Run, SchedulerError>;

    /// Find a task's persisted run again after a restart.
    async fn reattach(&self, task: &Task) -> Recovered;

    /// Root of the working directories.
    fn home(&self) -> &Path;
}

/// Runs every task in `home/<task id>`.
#[derive(Debug, Clone)]
pub struct WorkdirRunner {
    home: PathBuf,
    recomposator: Option<Arc<Recomposator>>,
}

impl WorkdirRunner {
    /// Runner rooted at `home`.
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            recomposator: None,
        }
    }

    /// Rewrite compositions for production before launching them.
    #[must_use]
    pub fn with_recomposator(mut self, recomposator: Arc<Recomposator>) -> Self {
        self.recomposator = Some(recomposator);
        self
    }

    async fn workdir(&self, task: &Task) -> Result<PathBuf, SchedulerError> {
        let id = task
            .id
            .ok_or_else(|| SchedulerError::InvalidArgument("task has no id".into()))?;
        tokio::fs::create_dir_all(&self.home).await?;
        let workdir = self.home.join(id.to_string());
        let mut builder = tokio::fs::DirBuilder::new();
        #[cfg(unix)]
        builder.mode(0o700);
        match builder.create(&workdir).await {
            Ok(()) => Ok(workdir),
            // A retried task reuses its directory.
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(workdir),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl Runner for WorkdirRunner {
    async fn up(&self, task: &Task) -> Result<Run, SchedulerError> {
        let action = task
            .action
            .as_ref()
            .ok_or_else(|| SchedulerError::InvalidArgument("task has no action".into()))?;
        action.validate()?;
        let workdir = self.workdir(task).await?;

        let (action, network) = match &self.recomposator {
            Some(recomposator) => {
                let recomposed = recomposator.recompose_action(action).await?;
                (recomposed.action, recomposed.network)
            }
            None => (action.clone(), None),
        };

        let environments = task.run_environment(clock::now());
        tracing::info!(
            task = ?task.id,
            runner = action.registered_name(),
            workdir = %workdir.display(),
            "launching action"
        );
        let launched = action.up(&workdir, &environments).await;
        match (launched, network) {
            (Ok(Run::Compose(mut run)), Some(network)) => {
                run.attach_network(network);
                Ok(Run::Compose(run))
            }
            (Ok(run), _) => Ok(run),
            (Err(err), network) => {
                if let (Some(recomposator), Some(network)) = (&self.recomposator, network) {
                    if let Err(e) = recomposator.release(&network).await {
                        tracing::warn!(network = %network, error = %e, "network release failed");
                    }
                }
                Err(err)
            }
        }
    }

    async fn reattach(&self, task: &Task) -> Recovered {
        match (&task.action, &task.run) {
            (Some(action), Some(record)) => action.reattach(record).await,
            _ => Recovered::Lost,
        }
    }

    fn home(&self) -> &Path {
        &self.home
    }
}
