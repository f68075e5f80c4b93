pub mod merge;
pub mod schema;

pub use schema::*;

use crate::cli::{Cli, Commands};
use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// Name of the config file in the working and global config directories.
pub const CONFIG_FILE_NAME: &str = "agent-crew.toml";

/// Load configuration by merging global, local, and CLI sources.
/// Precedence: CLI > `--config` file (or ./agent-crew.toml) > global config > defaults.
///
/// Missing config files are handled gracefully (defaults apply).
pub fn load_config(cli: &Cli) -> AppConfig {
    // Layer 1: Global config (~/.config/agent-crew/agent-crew.toml or platform equivalent)
    let global = match global_config_path() {
        Some(path) => load_layer(&path),
        None => {
            tracing::debug!("Could not determine global config directory");
            PartialConfig::default()
        }
    };

    // Layer 2: Explicit or working-directory config
    let local_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));
    let local = load_layer(&local_path);

    // Layer 3: CLI args (converted to PartialConfig)
    cli_to_partial(cli)
        .with_fallback(local)
        .with_fallback(global)
        .finalize()
}

/// Load one layer, logging (and ignoring) anything unreadable.
fn load_layer(path: &Path) -> PartialConfig {
    match load_toml_file(path) {
        Ok(Some(partial)) => partial,
        Ok(None) => PartialConfig::default(),
        Err(e) => {
            tracing::warn!("Config layer ignored: {e}");
            PartialConfig::default()
        }
    }
}

/// Load and parse a TOML config file into a PartialConfig.
/// Returns `Ok(None)` when the file does not exist.
pub fn load_toml_file(path: &Path) -> Result<Option<PartialConfig>, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config file at {}, using defaults", path.display());
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };

    let file = toml::from_str::<ConfigFile>(&contents).map_err(|e| ConfigError::ParseError {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    tracing::info!("Loaded config from {}", path.display());
    Ok(Some(file.to_partial()))
}

/// Resolve the platform-specific global config path.
/// Linux: ~/.config/agent-crew/agent-crew.toml
/// macOS: ~/Library/Application Support/agent-crew/agent-crew.toml
fn global_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "agent-crew")
        .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
}

/// Convert CLI arguments to a PartialConfig for merging.
fn cli_to_partial(cli: &Cli) -> PartialConfig {
    let task_command = match &cli.command {
        Some(Commands::Run { task_command, .. }) => task_command.clone(),
        _ => None,
    };
    PartialConfig {
        data_dir: cli.data_dir.clone(),
        task_command,
        ..Default::default()
    }
}
