//! External container tooling: binary names and command execution.

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::sync::OnceLock;

use tokio::process::Command;

use crate::core::SchedulerError;

static CURRENT: OnceLock<Orchestrator> = OnceLock::new();

/// Names of the orchestration binaries invoked by compose actions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Orchestrator {
    /// Composition tool, `docker-compose` by default.
    pub compose_bin: String,
    /// Container engine CLI, `docker` by default.
    pub docker_bin: String,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self {
            compose_bin: "docker-compose".to_string(),
            docker_bin: "docker".to_string(),
        }
    }
}

impl Orchestrator {
    /// Install the process-wide binaries. Returns `false` if already set.
    pub fn install(orchestrator: Self) -> bool {
        CURRENT.set(orchestrator).is_ok()
    }

    /// Process-wide binaries, defaults when nothing was installed.
    pub fn current() -> &'static Self {
        CURRENT.get_or_init(Self::default)
    }
}

/// Resolve `bin` against `PATH`, or accept it as an existing path.
pub fn ensure_bin(bin: &str) -> Result<PathBuf, SchedulerError> {
    let candidate = Path::new(bin);
    if candidate.components().count() > 1 {
        return if candidate.is_file() {
            Ok(candidate.to_path_buf())
        } else {
            Err(SchedulerError::Internal(format!("{bin} not found")))
        };
    }
    std::env::var_os("PATH")
        .iter()
        .flat_map(std::env::split_paths)
        .map(|dir| dir.join(bin))
        .find(|path| path.is_file())
        .ok_or_else(|| SchedulerError::Internal(format!("{bin} not found in PATH")))
}

/// Run `program args...`, optionally in `cwd`, and require a zero exit.
pub async fn exec(program: &str, args: &[&str], cwd: Option<&Path>) -> Result<Output, SchedulerError> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }
    tracing::debug!(program, ?args, cwd = ?cwd, "exec");
    let output = command
        .output()
        .await
        .map_err(|e| SchedulerError::Internal(format!("{program} failed to start: {e}")))?;
    if output.status.success() {
        Ok(output)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(SchedulerError::Internal(format!(
            "{program} {} exited with {}: {}",
            args.join(" "),
            output.status,
            stderr.trim()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_binary_is_internal() {
        assert!(matches!(
            ensure_bin("definitely-not-a-real-binary-42"),
            Err(SchedulerError::Internal(_))
        ));
        assert!(ensure_bin("/nonexistent/dir/tool").is_err());
    }

    #[test]
    fn shell_is_on_path() {
        assert!(ensure_bin("sh").is_ok());
    }

    #[tokio::test]
    async fn exec_reports_failures() {
        let ok = exec("sh", &["-c", "echo hello"], None).await.unwrap();
        assert_eq!(String::from_utf8_lossy(&ok.stdout).trim(), "hello");

        let err = exec("sh", &["-c", "echo boom >&2; exit 3"], None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("boom"));
    }
}
