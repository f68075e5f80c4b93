use std::path::PathBuf;

use crate::orchestration::status::{AgentStatus, StatusInput};

/// Errors related to configuration loading and parsing.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config at {path}: {message}")]
    ParseError { path: PathBuf, message: String },
}

/// A worker failed to come up (or cannot be started at all).
///
/// Always names the agent so team-wide logs stay attributable.
#[derive(Debug, thiserror::Error)]
#[error("Failed to spawn agent '{agent}': {reason}")]
pub struct SpawnError {
    pub agent: String,
    pub reason: String,
}

impl SpawnError {
    pub fn new(agent: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            reason: reason.into(),
        }
    }
}

/// Errors raised by inbound envelope validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("message is not a JSON object")]
    NotAnObject,

    #[error("unsupported jsonrpc version: {0}")]
    BadVersion(String),

    #[error("missing or non-string method")]
    BadMethod,

    #[error("params for `{method}` must be an object")]
    BadParams { method: String },

    #[error("invalid payload for `{method}`: {message}")]
    BadPayload { method: String, message: String },

    #[error("not valid JSON: {0}")]
    NotJson(String),
}

/// Errors related to team and agent orchestration.
#[derive(Debug, thiserror::Error)]
pub enum TeamError {
    #[error("Invalid name `{0}`: only letters, digits, '_' and '-' are allowed")]
    InvalidName(String),

    #[error("Duplicate agent name `{agent}` in team `{team}`")]
    DuplicateAgent { team: String, agent: String },

    #[error("Team `{0}` is already active")]
    AlreadyActive(String),

    #[error("Team `{0}` already exists on disk")]
    AlreadyExists(String),

    #[error("Team `{0}` is not active")]
    NotActive(String),

    #[error("Agent `{agent}` not found in team `{team}`")]
    AgentNotFound { team: String, agent: String },

    #[error("Agent `{0}` has no running worker")]
    NotRunning(String),

    #[error("Agent `{agent}` cannot accept {input:?} while {status}")]
    InvalidTransition {
        agent: String,
        status: AgentStatus,
        input: StatusInput,
    },

    #[error("Team manager has been shut down")]
    ManagerClosed,

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid team record at {path}: {source}")]
    InvalidRecord {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize team `{team}`: {source}")]
    Serialize {
        team: String,
        #[source]
        source: serde_json::Error,
    },
}

impl TeamError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TeamError::Io {
            path: path.into(),
            source,
        }
    }
}
