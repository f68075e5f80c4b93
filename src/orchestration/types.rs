//! Type definitions for the team orchestration subsystem.
//!
//! These types form the shared vocabulary between the [`super::team_manager::TeamManager`],
//! each [`super::agent_process::AgentProcess`], the on-disk team record, and
//! external observers. Serialized shapes use camelCase keys to match the team
//! record format.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::status::AgentStatus;

/// Unique identifier for an agent, generated once at team creation.
///
/// UUID v4 strings: collision-free and readable in logs.
pub type AgentId = String;

/// Immutable identity of one agent within a team.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    pub name: String,
    pub agent_id: AgentId,
    pub agent_type: String,
    pub model: String,
    pub provider: String,
    pub role: String,
}

/// Read-only runtime view of an agent, returned by state queries.
///
/// This is a snapshot -- the owning `AgentProcess` may change after the clone
/// is returned.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentState {
    pub config: AgentConfig,
    pub status: AgentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_task_id: Option<String>,
}

/// Whether a team is live in the current manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TeamStatus {
    Active,
    Inactive,
}

impl fmt::Display for TeamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TeamStatus::Active => "active",
            TeamStatus::Inactive => "inactive",
        })
    }
}

/// Persisted identity of a team.
///
/// Stored at `<data_dir>/teams/<team_name>/config.json`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamConfig {
    pub team_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: TeamStatus,
    pub members: Vec<AgentConfig>,
    pub created_at: DateTime<Utc>,
}

/// Requested member of a new team. The agent id is assigned by the manager.
#[derive(Clone, Debug)]
pub struct AgentSpec {
    pub name: String,
    pub agent_type: String,
    pub model: String,
    pub provider: String,
    pub role: String,
}

impl AgentSpec {
    /// Spec with the general-purpose agent type and a `worker` role.
    pub fn new(name: impl Into<String>, model: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            agent_type: "general-purpose".to_string(),
            model: model.into(),
            provider: provider.into(),
            role: "worker".to_string(),
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    /// Parse a `name:model:role[:provider]` member string (CLI shorthand).
    pub fn parse(spec: &str, default_provider: &str) -> Result<Self, String> {
        let parts: Vec<&str> = spec.split(':').collect();
        match parts.as_slice() {
            [name, model, role] => Ok(AgentSpec::new(*name, *model, default_provider).with_role(*role)),
            [name, model, role, provider] => Ok(AgentSpec::new(*name, *model, *provider).with_role(*role)),
            _ => Err(format!(
                "invalid member `{spec}`: expected name:model:role[:provider]"
            )),
        }
    }
}

/// Options for [`super::team_manager::TeamManager::create_team`].
#[derive(Clone, Debug, Default)]
pub struct CreateTeamOptions {
    pub description: Option<String>,
    pub agents: Vec<AgentSpec>,
}
