//! Compose action: a container composition driven by the compose CLI.
//!
//! Documents arrive as JSON inside task bodies or as the YAML files users
//! write for the compose CLI. `up` writes `docker-compose.yml` (JSON is
//! valid YAML) and `.env` into the
//! working directory, starts the project detached, and follows the main
//! service's container with `docker wait`.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::process::Command;

use super::graph::{depends_on, ServiceGraph};
use super::{Recovered, Run, RunRecord};
use crate::core::orchestrator::{ensure_bin, exec, Orchestrator};
use crate::core::scope::{ExecScope, ScopeEnd};
use crate::core::task::Status;
use crate::core::SchedulerError;
use crate::util::clock;

/// Host directory every bind mount is moved under.
pub const VOLUME_PREFIX: &str = "./volumes/";

/// Name of the composition file written into the working directory.
pub const COMPOSE_FILE: &str = "docker-compose.yml";

/// A composition document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Compose {
    /// Format version.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    /// Services, kept as raw documents.
    #[serde(default)]
    pub services: BTreeMap<String, Value>,
    /// Network definitions.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub networks: BTreeMap<String, Value>,
    /// Other top-level keys; only `x-*` extensions are valid.
    #[serde(flatten)]
    pub extensions: BTreeMap<String, Value>,
}

/// A parsed volume entry of a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    /// Host side; `None` for anonymous volumes.
    pub source: Option<String>,
    /// Container side.
    pub target: String,
    /// Trailing mode such as `ro`.
    pub mode: Option<String>,
}

impl VolumeMount {
    /// Parse `source:target[:mode]`, a bare anonymous target, or the long
    /// object syntax.
    pub fn from_value(value: &Value) -> Result<Self, String> {
        match value {
            Value::String(text) => Self::parse(text),
            Value::Object(map) => {
                let target = map
                    .get("target")
                    .and_then(Value::as_str)
                    .ok_or_else(|| format!("volume {value} has no target"))?;
                Ok(Self {
                    source: map.get("source").and_then(Value::as_str).map(str::to_string),
                    target: target.to_string(),
                    mode: map
                        .get("read_only")
                        .and_then(Value::as_bool)
                        .filter(|ro| *ro)
                        .map(|_| "ro".to_string()),
                })
            }
            other => Err(format!("wrong volume format: {other}")),
        }
    }

    /// Parse the short string syntax.
    pub fn parse(text: &str) -> Result<Self, String> {
        let parts: Vec<&str> = text.split(':').collect();
        match parts.as_slice() {
            [target] if !target.is_empty() => Ok(Self {
                source: None,
                target: (*target).to_string(),
                mode: None,
            }),
            [source, target] if !source.is_empty() && !target.is_empty() => Ok(Self {
                source: Some((*source).to_string()),
                target: (*target).to_string(),
                mode: None,
            }),
            [source, target, mode] if !source.is_empty() && !target.is_empty() => Ok(Self {
                source: Some((*source).to_string()),
                target: (*target).to_string(),
                mode: Some((*mode).to_string()),
            }),
            _ => Err(format!("wrong volume format: {text}")),
        }
    }

    /// Render back to the short syntax.
    pub fn to_short(&self) -> String {
        let mut out = String::new();
        if let Some(source) = &self.source {
            out.push_str(source);
            out.push(':');
        }
        out.push_str(&self.target);
        if let Some(mode) = &self.mode {
            out.push(':');
            out.push_str(mode);
        }
        out
    }
}

impl Compose {
    /// Parse a JSON composition document.
    pub fn from_json(bytes: &[u8]) -> Result<Self, SchedulerError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Parse a YAML composition document.
    pub fn from_yaml(bytes: &[u8]) -> Result<Self, SchedulerError> {
        serde_yaml::from_slice(bytes)
            .map_err(|e| SchedulerError::InvalidArgument(format!("bad composition: {e}")))
    }

    /// Parsed volumes of `service`, malformed entries as errors.
    pub fn volumes(&self, service: &str) -> Vec<Result<VolumeMount, String>> {
        match self.services.get(service).and_then(|s| s.get("volumes")) {
            None => Vec::new(),
            Some(Value::Array(items)) => items.iter().map(VolumeMount::from_value).collect(),
            Some(other) => vec![Err(format!("volumes of {service} must be a list, got {other}"))],
        }
    }

    /// Structural check: services are objects, volumes parse, dependencies
    /// exist and form no cycle, top-level extras are `x-*`.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        let mut errors = Vec::new();
        if self.services.is_empty() {
            errors.push("at least one service is required".to_string());
        }
        for key in self.extensions.keys() {
            if !key.starts_with("x-") {
                errors.push(format!("unsupported top-level key: {key}"));
            }
        }
        for (name, service) in &self.services {
            if !service.is_object() {
                errors.push(format!("service {name} must be an object"));
                continue;
            }
            for volume in self.volumes(name) {
                if let Err(e) = volume {
                    errors.push(format!("service {name}: {e}"));
                }
            }
            for dep in depends_on(service) {
                if !self.services.contains_key(dep) {
                    errors.push(format!("service {name} depends on unknown service {dep}"));
                }
            }
        }
        if !errors.is_empty() {
            return Err(SchedulerError::Validation(errors));
        }
        ServiceGraph::new(&self.services).weights().map(|_| ())
    }

    /// Move every bind mount under [`VOLUME_PREFIX`]. Idempotent.
    pub fn sanitize_volumes(&mut self) {
        for service in self.services.values_mut() {
            let Some(Value::Array(items)) = service.get_mut("volumes") else {
                continue;
            };
            for item in items.iter_mut() {
                match item {
                    Value::String(text) => {
                        if let Ok(mut mount) = VolumeMount::parse(text) {
                            if let Some(source) = mount.source.as_mut() {
                                *source = sanitized_source(source);
                            }
                            *text = mount.to_short();
                        }
                    }
                    Value::Object(map) => {
                        if let Some(Value::String(source)) = map.get_mut("source") {
                            *source = sanitized_source(source);
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    /// Name of the service whose container is followed.
    pub fn main_service(&self) -> Result<String, SchedulerError> {
        ServiceGraph::new(&self.services)
            .main_service()
            .map(str::to_string)
    }

    /// Launch with the process-wide orchestrator.
    pub async fn up(
        &self,
        workdir: &Path,
        environments: &BTreeMap<String, String>,
    ) -> Result<ComposeRun, SchedulerError> {
        self.up_with(Orchestrator::current(), workdir, environments).await
    }

    /// Launch with explicit orchestrator binaries.
    pub async fn up_with(
        &self,
        orchestrator: &Orchestrator,
        workdir: &Path,
        environments: &BTreeMap<String, String>,
    ) -> Result<ComposeRun, SchedulerError> {
        ensure_bin(&orchestrator.compose_bin)?;
        let main = self.main_service()?;

        let mut document = self.clone();
        document.sanitize_volumes();
        tokio::fs::write(workdir.join(COMPOSE_FILE), serde_json::to_vec_pretty(&document)?).await?;
        tokio::fs::write(workdir.join(".env"), render_env(environments)).await?;

        let compose = orchestrator.compose_bin.as_str();
        exec(compose, &["up", "--remove-orphans", "--detach"], Some(workdir)).await?;
        tracing::info!(workdir = %workdir.display(), main = %main, "composition is up");

        let mut run = ComposeRun {
            orchestrator: orchestrator.clone(),
            path: workdir.to_path_buf(),
            id: String::new(),
            main,
            start: clock::now(),
            finish: None,
            exit_code: None,
            torn_down: false,
            network: None,
        };
        match find_container(orchestrator, workdir, &run.main).await {
            Ok(id) => {
                run.id = id;
                Ok(run)
            }
            Err(err) => {
                if let Err(down) = run.down().await {
                    tracing::warn!(error = %down, "teardown after failed lookup");
                }
                Err(err)
            }
        }
    }
}

impl Compose {
    /// Find the run of `record` with the process-wide orchestrator.
    pub async fn reattach(&self, record: &RunRecord) -> Recovered {
        self.reattach_with(Orchestrator::current(), record).await
    }

    /// Find the container of `record` and map its engine state.
    ///
    /// An unknown container, or one the engine cannot describe, is lost.
    pub async fn reattach_with(
        &self,
        orchestrator: &Orchestrator,
        record: &RunRecord,
    ) -> Recovered {
        let (Some(id), Some(path)) = (&record.id, &record.path) else {
            return Recovered::Lost;
        };
        let run = ComposeRun {
            orchestrator: orchestrator.clone(),
            path: path.clone(),
            id: id.clone(),
            main: self.main_service().unwrap_or_default(),
            start: record.start,
            finish: None,
            exit_code: None,
            torn_down: false,
            network: None,
        };
        let state = match run.status().await {
            Ok(state) => state,
            Err(err) => {
                tracing::warn!(container = %id, error = %err, "container not found again");
                return Recovered::Lost;
            }
        };
        tracing::info!(container = %id, state = %state.status, exit_code = state.exit_code, "container found again");
        match state.status.as_str() {
            "running" | "restarting" | "paused" | "created" => Recovered::Running(Run::Compose(run)),
            "exited" => Recovered::Exited(state.exit_code),
            "dead" => Recovered::Dead,
            _ => Recovered::Lost,
        }
    }
}

fn sanitized_source(source: &str) -> String {
    if source.starts_with(VOLUME_PREFIX) {
        source.to_string()
    } else {
        format!("{VOLUME_PREFIX}{}", source.trim_start_matches("./"))
    }
}

async fn find_container(
    orchestrator: &Orchestrator,
    workdir: &Path,
    main: &str,
) -> Result<String, SchedulerError> {
    let out = exec(&orchestrator.compose_bin, &["ps", "-q", main], Some(workdir)).await?;
    let stdout = String::from_utf8_lossy(&out.stdout);
    let ids: Vec<&str> = stdout.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    match ids.as_slice() {
        [id] => Ok((*id).to_string()),
        _ => Err(SchedulerError::Internal(format!(
            "expected one container for service {main}, found {}",
            ids.len()
        ))),
    }
}

/// Render an `.env` file, quoting values that need it.
pub fn render_env(environments: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (key, value) in environments {
        let needs_quotes = value.is_empty()
            || value
                .chars()
                .any(|c| c.is_whitespace() || matches!(c, '#' | '"' | '\'' | '\\' | '$'));
        if needs_quotes {
            let escaped = value
                .replace('\\', "\\\\")
                .replace('"', "\\\"")
                .replace('\n', "\\n");
            let _ = writeln!(out, "{key}=\"{escaped}\"");
        } else {
            let _ = writeln!(out, "{key}={value}");
        }
    }
    out
}

/// State of a container as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerState {
    /// `running`, `exited`, ...
    pub status: String,
    /// Exit code, meaningful once exited.
    pub exit_code: i64,
}

/// Running composition.
#[derive(Debug)]
pub struct ComposeRun {
    orchestrator: Orchestrator,
    path: PathBuf,
    id: String,
    main: String,
    start: DateTime<Utc>,
    finish: Option<DateTime<Utc>>,
    exit_code: Option<i64>,
    torn_down: bool,
    network: Option<String>,
}

impl ComposeRun {
    /// Container id of the main service.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Main service name.
    pub fn main(&self) -> &str {
        &self.main
    }

    /// Remove `network` with the rest of the run on teardown.
    pub fn attach_network(&mut self, network: impl Into<String>) {
        self.network = Some(network.into());
    }

    /// Follow the main container until it exits or `scope` ends.
    pub async fn wait(&mut self, scope: &ExecScope) -> Result<Status, SchedulerError> {
        let waiter = Command::new(&self.orchestrator.docker_bin)
            .args(["wait", self.id.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SchedulerError::Internal(format!("docker wait failed to start: {e}")))?;

        let outcome = tokio::select! {
            biased;
            end = scope.ended() => Err(end),
            output = waiter.wait_with_output() => Ok(output),
        };

        match outcome {
            Err(end) => {
                tracing::info!(container = %self.id, ?end, "scope ended, tearing down");
                if let Err(err) = self.down().await {
                    tracing::warn!(container = %self.id, error = %err, "teardown failed");
                }
                self.finish = Some(clock::now());
                Ok(match end {
                    ScopeEnd::Canceled => Status::Canceled,
                    ScopeEnd::Timeout => Status::Timeout,
                })
            }
            Ok(output) => {
                let output = output?;
                self.finish = Some(clock::now());
                if !output.status.success() {
                    return Err(SchedulerError::Internal(format!(
                        "docker wait {}: {}",
                        self.id,
                        String::from_utf8_lossy(&output.stderr).trim()
                    )));
                }
                let code: i64 = String::from_utf8_lossy(&output.stdout)
                    .trim()
                    .parse()
                    .map_err(|e| SchedulerError::Internal(format!("unexpected docker wait output: {e}")))?;
                self.exit_code = Some(code);
                tracing::info!(container = %self.id, exit_code = code, "container exited");
                Ok(if code == 0 { Status::Done } else { Status::Error })
            }
        }
    }

    /// Tear the project down. Idempotent.
    pub async fn down(&mut self) -> Result<(), SchedulerError> {
        if self.torn_down {
            return Ok(());
        }
        exec(
            &self.orchestrator.compose_bin,
            &["down", "--remove-orphans"],
            Some(&self.path),
        )
        .await?;
        self.torn_down = true;
        if let Some(network) = self.network.take() {
            if let Err(err) = exec(&self.orchestrator.docker_bin, &["network", "rm", &network], None).await {
                tracing::warn!(network = %network, error = %err, "network removal failed");
            }
        }
        Ok(())
    }

    /// Ask the engine for the container state.
    pub async fn status(&self) -> Result<ContainerState, SchedulerError> {
        let out = exec(
            &self.orchestrator.docker_bin,
            &["inspect", "--format", "{{.State.Status}} {{.State.ExitCode}}", &self.id],
            None,
        )
        .await?;
        let stdout = String::from_utf8_lossy(&out.stdout);
        let mut fields = stdout.split_whitespace();
        match (fields.next(), fields.next().map(str::parse::<i64>)) {
            (Some(status), Some(Ok(exit_code))) => Ok(ContainerState {
                status: status.to_string(),
                exit_code,
            }),
            _ => Err(SchedulerError::Internal(format!(
                "unexpected docker inspect output: {}",
                stdout.trim()
            ))),
        }
    }

    /// Serializable view.
    pub fn record(&self) -> RunRecord {
        RunRecord {
            runner: "compose".to_string(),
            id: Some(self.id.clone()),
            path: Some(self.path.clone()),
            start: self.start,
            finish: self.finish,
            exit_code: self.exit_code,
            running: self.finish.is_none(),
        }
    }
}
