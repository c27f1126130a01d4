//! Assemble a scheduler from [`SchedulerConfig`].

use std::sync::Arc;

use anyhow::{anyhow, Context};

use crate::config::SchedulerConfig;
use crate::core::orchestrator::{ensure_bin, Orchestrator};
use crate::core::recompose::{DockerInventory, Recomposator};
use crate::core::resource_pool::{Resources, Spawn};
use crate::core::runner::WorkdirRunner;
use crate::core::scheduler::Scheduler;
use crate::core::validator::{Validator, ValidatorRegistry};
use crate::core::AppResult;
use crate::infra::store::{FileStore, JsonStore};

/// Build a scheduler with a file store under `cfg.data_dir` and restore
/// its tasks.
///
/// The compose binary must be installed. The orchestrator binaries are
/// installed process-wide; a second build in the same process keeps the
/// first ones.
pub async fn build_scheduler<S>(cfg: &SchedulerConfig, spawner: S) -> AppResult<Arc<Scheduler<S>>>
where
    S: Spawn + Send + Sync + 'static,
{
    cfg.validate().map_err(|e| anyhow!("config invalid: {e}"))?;
    let compose = ensure_bin(&cfg.compose_bin).context("looking up the compose binary")?;
    tracing::debug!(compose = %compose.display(), "compose binary found");
    cfg.ensure_data_dirs()
        .with_context(|| format!("creating data directories under {}", cfg.data_dir.display()))?;

    if !Orchestrator::install(Orchestrator {
        compose_bin: cfg.compose_bin.clone(),
        docker_bin: cfg.docker_bin.clone(),
    }) {
        tracing::debug!("orchestrator already installed");
    }

    let mut runner = WorkdirRunner::new(cfg.workdir_root());
    if cfg.recompose {
        let inventory = Arc::new(DockerInventory::new(cfg.docker_bin.clone()));
        runner = runner.with_recomposator(Arc::new(Recomposator::new(inventory, cfg.project.clone())));
    }

    let store = FileStore::open(cfg.store_path())
        .with_context(|| format!("opening task store {}", cfg.store_path().display()))?;
    let scheduler = Arc::new(
        Scheduler::new(Resources::new(cfg.cpu, cfg.ram), Arc::new(runner), spawner)
            .with_store(JsonStore::new(Arc::new(store))),
    );
    let restored = scheduler.restore().await.context("restoring tasks")?;

    tracing::info!(
        cpu = cfg.cpu,
        ram = cfg.ram,
        data_dir = %cfg.data_dir.display(),
        recompose = cfg.recompose,
        restored,
        "scheduler built"
    );
    Ok(scheduler)
}

/// Build the task validator from `cfg.validators`.
pub fn build_validator(cfg: &SchedulerConfig) -> AppResult<Validator> {
    ValidatorRegistry::global()
        .build(&cfg.validators)
        .context("building validators")
}
