use serde::Deserialize;
use std::path::PathBuf;

/// The TOML file structure for agent-crew.toml.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    pub general: Option<GeneralConfig>,
    pub timeouts: Option<TimeoutsConfig>,
    pub worker: Option<WorkerConfig>,
}

#[derive(Debug, Deserialize)]
pub struct GeneralConfig {
    pub data_dir: Option<String>,
    pub default_model: Option<String>,
    pub default_provider: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TimeoutsConfig {
    pub registration_ms: Option<u64>,
    pub shutdown_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct WorkerConfig {
    /// Worker executable; defaults to the running binary.
    pub program: Option<String>,
    /// Shell command run per task; unset means the echo executor.
    pub task_command: Option<String>,
}

/// Fully-resolved runtime configuration. All fields have values.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub default_model: String,
    pub default_provider: String,
    pub registration_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub worker_program: Option<PathBuf>,
    pub task_command: Option<String>,
}

/// Partial config used during merge. All fields are Option so that
/// missing fields don't override lower-priority values.
#[derive(Debug, Clone, Default)]
pub struct PartialConfig {
    pub data_dir: Option<PathBuf>,
    pub default_model: Option<String>,
    pub default_provider: Option<String>,
    pub registration_timeout_ms: Option<u64>,
    pub shutdown_timeout_ms: Option<u64>,
    pub worker_program: Option<PathBuf>,
    pub task_command: Option<String>,
}

impl ConfigFile {
    pub fn to_partial(&self) -> PartialConfig {
        let general = self.general.as_ref();
        let timeouts = self.timeouts.as_ref();
        let worker = self.worker.as_ref();
        PartialConfig {
            data_dir: general.and_then(|g| g.data_dir.as_ref()).map(PathBuf::from),
            default_model: general.and_then(|g| g.default_model.clone()),
            default_provider: general.and_then(|g| g.default_provider.clone()),
            registration_timeout_ms: timeouts.and_then(|t| t.registration_ms),
            shutdown_timeout_ms: timeouts.and_then(|t| t.shutdown_ms),
            worker_program: worker.and_then(|w| w.program.as_ref()).map(PathBuf::from),
            task_command: worker.and_then(|w| w.task_command.clone()),
        }
    }
}
