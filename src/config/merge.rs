use super::schema::{AppConfig, PartialConfig};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_MODEL: &str = "llama3.2";
pub const DEFAULT_PROVIDER: &str = "ollama";
pub const DEFAULT_REGISTRATION_TIMEOUT_MS: u64 = 15_000;
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 10_000;

impl PartialConfig {
    /// Merge self with a lower-priority fallback.
    /// Self's non-None values take precedence.
    pub fn with_fallback(self, fallback: PartialConfig) -> PartialConfig {
        PartialConfig {
            data_dir: self.data_dir.or(fallback.data_dir),
            default_model: self.default_model.or(fallback.default_model),
            default_provider: self.default_provider.or(fallback.default_provider),
            registration_timeout_ms: self
                .registration_timeout_ms
                .or(fallback.registration_timeout_ms),
            shutdown_timeout_ms: self.shutdown_timeout_ms.or(fallback.shutdown_timeout_ms),
            worker_program: self.worker_program.or(fallback.worker_program),
            task_command: self.task_command.or(fallback.task_command),
        }
    }

    /// Convert to AppConfig, filling any remaining gaps with defaults.
    pub fn finalize(self) -> AppConfig {
        let data_dir = self.data_dir.unwrap_or_else(default_data_dir);

        AppConfig {
            data_dir,
            default_model: self.default_model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            default_provider: self
                .default_provider
                .unwrap_or_else(|| DEFAULT_PROVIDER.to_string()),
            registration_timeout_ms: self
                .registration_timeout_ms
                .unwrap_or(DEFAULT_REGISTRATION_TIMEOUT_MS),
            shutdown_timeout_ms: self.shutdown_timeout_ms.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT_MS),
            worker_program: self.worker_program,
            task_command: self.task_command.filter(|c| !c.trim().is_empty()),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        PartialConfig::default().finalize()
    }
}

impl AppConfig {
    pub fn registration_timeout(&self) -> Duration {
        Duration::from_millis(self.registration_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn teams_dir(&self) -> PathBuf {
        self.data_dir.join("teams")
    }

    pub fn tasks_dir(&self) -> PathBuf {
        self.data_dir.join("tasks")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

/// Platform data dir (Linux: ~/.local/share/agent-crew), else `./.agent-crew`.
fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "agent-crew")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("./.agent-crew"))
}
