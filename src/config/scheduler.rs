//! Scheduler configuration: environment, JSON and on-disk layout.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::validator::{ValidatorRegistry, ValidatorsConfig};
use crate::util::{duration, parse_duration};

/// Default HTTP port.
pub const DEFAULT_PORT: u16 = 8042;
/// Default data directory.
pub const DEFAULT_DATA_DIR: &str = "/tmp/batch-scheduler";
/// Default RAM budget.
pub const DEFAULT_RAM: u32 = 8192;
/// Default flush age.
pub const DEFAULT_FLUSH_AGE: Duration = Duration::from_secs(24 * 3600);

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(DEFAULT_DATA_DIR)
}

fn default_cpu() -> u32 {
    u32::try_from(num_cpus::get()).unwrap_or(u32::MAX)
}

fn default_ram() -> u32 {
    DEFAULT_RAM
}

fn default_flush_age() -> Duration {
    DEFAULT_FLUSH_AGE
}

fn default_compose_bin() -> String {
    "docker-compose".to_string()
}

fn default_docker_bin() -> String {
    "docker".to_string()
}

fn default_project() -> String {
    "batch".to_string()
}

/// Root scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Key verifying caller tokens.
    pub auth_key: String,
    /// HTTP port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Root of every file the scheduler writes.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Scratch directory for validation; `<data_dir>/validator` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_tmp: Option<PathBuf>,
    /// CPU budget.
    #[serde(default = "default_cpu")]
    pub cpu: u32,
    /// RAM budget.
    #[serde(default = "default_ram")]
    pub ram: u32,
    /// Terminal tasks older than this are flushed.
    #[serde(default = "default_flush_age", with = "duration")]
    pub flush_age: Duration,
    /// Composition binary.
    #[serde(default = "default_compose_bin")]
    pub compose_bin: String,
    /// Container engine binary.
    #[serde(default = "default_docker_bin")]
    pub docker_bin: String,
    /// Project label stamped on recomposed services.
    #[serde(default = "default_project")]
    pub project: String,
    /// Give every composition a private network.
    #[serde(default)]
    pub recompose: bool,
    /// Validator rules per action kind.
    #[serde(default = "ValidatorRegistry::standard_config")]
    pub validators: ValidatorsConfig,
}

impl SchedulerConfig {
    /// Configuration with defaults and the given key.
    pub fn new(auth_key: impl Into<String>) -> Self {
        Self {
            auth_key: auth_key.into(),
            port: DEFAULT_PORT,
            data_dir: default_data_dir(),
            batch_tmp: None,
            cpu: default_cpu(),
            ram: DEFAULT_RAM,
            flush_age: DEFAULT_FLUSH_AGE,
            compose_bin: default_compose_bin(),
            docker_bin: default_docker_bin(),
            project: default_project(),
            recompose: false,
            validators: ValidatorRegistry::standard_config(),
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.auth_key.is_empty() {
            return Err("AUTH_KEY must be set".into());
        }
        if self.cpu == 0 {
            return Err("cpu must be greater than 0".into());
        }
        if self.ram == 0 {
            return Err("ram must be greater than 0".into());
        }
        if self.port == 0 {
            return Err("port must be greater than 0".into());
        }
        if self.project.is_empty() {
            return Err("project must not be empty".into());
        }
        if !self.data_dir.is_absolute() {
            return Err(format!("data_dir `{}` must be absolute", self.data_dir.display()));
        }
        ValidatorRegistry::global()
            .build(&self.validators)
            .map_err(|e| format!("validators invalid: {e}"))?;
        Ok(())
    }

    /// Parse configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read `.env` if present, then the process environment.
    pub fn from_env() -> Result<Self, String> {
        if let Err(err) = dotenvy::dotenv() {
            if !err.not_found() {
                return Err(format!(".env: {err}"));
            }
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from a variable lookup: `AUTH_KEY` (required), `PORT`,
    /// `DATA_DIR`, `BATCH_TMP`, `CPU`, `RAM`, `FLUSH_AGE`, `COMPOSE_BIN`,
    /// `DOCKER_BIN`, `PROJECT`, `RECOMPOSE`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let auth_key = get("AUTH_KEY").ok_or("AUTH_KEY must be set")?;
        let mut cfg = Self::new(auth_key);
        if let Some(port) = get("PORT") {
            cfg.port = port.trim().parse().map_err(|e| format!("PORT `{port}`: {e}"))?;
        }
        if let Some(dir) = get("DATA_DIR") {
            cfg.data_dir = PathBuf::from(dir);
        }
        cfg.batch_tmp = get("BATCH_TMP").map(PathBuf::from);
        if let Some(cpu) = get("CPU") {
            cfg.cpu = cpu.trim().parse().map_err(|e| format!("CPU `{cpu}`: {e}"))?;
        }
        if let Some(ram) = get("RAM") {
            cfg.ram = ram.trim().parse().map_err(|e| format!("RAM `{ram}`: {e}"))?;
        }
        if let Some(age) = get("FLUSH_AGE") {
            cfg.flush_age = parse_duration(age.trim()).map_err(|e| format!("FLUSH_AGE: {e}"))?;
        }
        if let Some(bin) = get("COMPOSE_BIN") {
            cfg.compose_bin = bin;
        }
        if let Some(bin) = get("DOCKER_BIN") {
            cfg.docker_bin = bin;
        }
        if let Some(project) = get("PROJECT") {
            cfg.project = project;
        }
        if let Some(flag) = get("RECOMPOSE") {
            cfg.recompose = matches!(flag.trim(), "1" | "true" | "yes" | "on");
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Scratch directory for validation.
    pub fn validator_dir(&self) -> PathBuf {
        self.batch_tmp
            .clone()
            .unwrap_or_else(|| self.data_dir.join("validator"))
    }

    /// Root of the task working directories.
    pub fn workdir_root(&self) -> PathBuf {
        self.data_dir.join("wd")
    }

    /// Directory of the task store.
    pub fn store_dir(&self) -> PathBuf {
        self.data_dir.join("store")
    }

    /// Task store file.
    pub fn store_path(&self) -> PathBuf {
        self.store_dir().join("tasks.jsonl")
    }

    /// Create the data directory layout.
    pub fn ensure_data_dirs(&self) -> std::io::Result<()> {
        for dir in [self.validator_dir(), self.workdir_root(), self.store_dir()] {
            create_private_dir(&dir)?;
        }
        Ok(())
    }
}

fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}
