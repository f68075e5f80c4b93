//! Top-level orchestrator for teams of worker agents.
//!
//! [`TeamManager`] owns every team that is live in this process. Each active
//! team is a named set of [`AgentProcess`] handles plus its team-scoped
//! collaborators (message bus, task store, plan approval). The on-disk team
//! record under `{data_dir}/teams/{team}/config.json` is the source of truth
//! for a team's identity; the in-memory map only says which teams are live.
//!
//! **Concurrency model:** the active-team map sits behind `Arc<Mutex<..>>`
//! and the lock is never held across an await. Team-wide operations
//! (`start_agents`, `delete_team`, `shutdown_all`) settle every constituent
//! operation with `join_all` and never short-circuit on the first failure.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex};

use chrono::Utc;
use futures::future::join_all;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::agent_process::{AgentProcess, ProcessSettings};
use super::collaborators::{
    CollaboratorFactory, LocalCollaborators, MessageBus, PlanApproval, TaskStore,
};
use super::events::{EventHub, TeamEvent};
use super::spawner::WorkerSpawner;
use super::types::{AgentConfig, AgentState, CreateTeamOptions, TeamConfig, TeamStatus};
use crate::config::AppConfig;
use crate::error::TeamError;

/// File name of the team record inside a team directory.
pub const TEAM_RECORD: &str = "config.json";

static NAME_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").unwrap());

/// Whether `name` is usable as a team or agent name (and path component).
pub fn is_valid_name(name: &str) -> bool {
    NAME_RE.is_match(name)
}

/// Live state of one team.
struct ActiveTeam {
    config: TeamConfig,
    agents: Vec<Arc<AgentProcess>>,
    bus: Arc<dyn MessageBus>,
    task_store: Arc<dyn TaskStore>,
    plan_approval: Arc<dyn PlanApproval>,
}

impl ActiveTeam {
    fn agent(&self, name: &str) -> Option<&Arc<AgentProcess>> {
        self.agents.iter().find(|a| a.config().name == name)
    }
}

/// Registry and lifecycle owner for all teams in this process.
///
/// Cheap to clone; clones share the same teams, event hub and shutdown state.
#[derive(Clone)]
pub struct TeamManager {
    teams: Arc<Mutex<HashMap<String, Arc<ActiveTeam>>>>,
    config: AppConfig,
    events: EventHub,
    spawner: Arc<dyn WorkerSpawner>,
    collaborators: Arc<dyn CollaboratorFactory>,
    closed: CancellationToken,
}

impl TeamManager {
    /// Create a manager using the local collaborator implementations.
    pub fn new(config: AppConfig, spawner: Arc<dyn WorkerSpawner>, events: EventHub) -> Self {
        Self {
            teams: Arc::new(Mutex::new(HashMap::new())),
            config,
            events,
            spawner,
            collaborators: Arc::new(LocalCollaborators),
            closed: CancellationToken::new(),
        }
    }

    /// Replace the collaborator factory used for teams created from now on.
    pub fn with_collaborators(mut self, collaborators: Arc<dyn CollaboratorFactory>) -> Self {
        self.collaborators = collaborators;
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn team_dir(&self, name: &str) -> PathBuf {
        self.config.teams_dir().join(name)
    }

    fn task_dir(&self, name: &str) -> PathBuf {
        self.config.tasks_dir().join(name)
    }

    fn worker_program(&self) -> Result<PathBuf, TeamError> {
        match &self.config.worker_program {
            Some(program) => Ok(program.clone()),
            None => std::env::current_exe().map_err(|e| TeamError::io("current executable", e)),
        }
    }

    /// Create a team, persist its record, and build its (unstarted) agents.
    ///
    /// Fails if the name is invalid, the team is already live, or a team
    /// directory of that name already exists on disk. The directory is
    /// created exclusively, so of two racing calls exactly one succeeds.
    pub async fn create_team(
        &self,
        name: &str,
        options: CreateTeamOptions,
    ) -> Result<TeamConfig, TeamError> {
        if self.is_closed() {
            return Err(TeamError::ManagerClosed);
        }
        if !is_valid_name(name) {
            return Err(TeamError::InvalidName(name.to_string()));
        }
        let mut seen = HashSet::new();
        for spec in &options.agents {
            if !is_valid_name(&spec.name) {
                return Err(TeamError::InvalidName(spec.name.clone()));
            }
            if !seen.insert(spec.name.as_str()) {
                return Err(TeamError::DuplicateAgent {
                    team: name.to_string(),
                    agent: spec.name.clone(),
                });
            }
        }
        if self.teams.lock().unwrap().contains_key(name) {
            return Err(TeamError::AlreadyActive(name.to_string()));
        }

        let program = self.worker_program()?;

        let teams_dir = self.config.teams_dir();
        tokio::fs::create_dir_all(&teams_dir)
            .await
            .map_err(|e| TeamError::io(&teams_dir, e))?;
        let team_dir = self.team_dir(name);
        match tokio::fs::create_dir(&team_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(TeamError::AlreadyExists(name.to_string()));
            }
            Err(e) => return Err(TeamError::io(&team_dir, e)),
        }

        match self.build_team(name, options, &team_dir, program).await {
            Ok(team) => {
                let config = team.config.clone();
                let members: Vec<String> = config.members.iter().map(|m| m.name.clone()).collect();
                self.teams.lock().unwrap().insert(name.to_string(), team);
                tracing::info!(team = %name, members = ?members, "Team created");
                self.events.emit(TeamEvent::TeamCreated {
                    team: name.to_string(),
                    members,
                });
                Ok(config)
            }
            Err(e) => {
                // Leave nothing behind that would block a retry.
                remove_dir_if_present(&team_dir).await.ok();
                remove_dir_if_present(&self.task_dir(name)).await.ok();
                Err(e)
            }
        }
    }

    async fn build_team(
        &self,
        name: &str,
        options: CreateTeamOptions,
        team_dir: &Path,
        program: PathBuf,
    ) -> Result<Arc<ActiveTeam>, TeamError> {
        let members: Vec<AgentConfig> = options
            .agents
            .into_iter()
            .map(|spec| AgentConfig {
                name: spec.name,
                agent_id: Uuid::new_v4().to_string(),
                agent_type: spec.agent_type,
                model: spec.model,
                provider: spec.provider,
                role: spec.role,
            })
            .collect();

        let config = TeamConfig {
            team_name: name.to_string(),
            description: options.description,
            status: TeamStatus::Active,
            members,
            created_at: Utc::now(),
        };

        let json = serde_json::to_string_pretty(&config).map_err(|source| TeamError::Serialize {
            team: name.to_string(),
            source,
        })?;
        let record = team_dir.join(TEAM_RECORD);
        tokio::fs::write(&record, json)
            .await
            .map_err(|e| TeamError::io(&record, e))?;

        let task_dir = self.task_dir(name);
        let bus = self.collaborators.message_bus(name);
        let task_store = self
            .collaborators
            .task_store(name, &task_dir)
            .map_err(|e| TeamError::io(&task_dir, e))?;
        let plan_approval = self.collaborators.plan_approval(name, bus.clone());

        let agents = config
            .members
            .iter()
            .map(|member| {
                bus.register_agent(&member.agent_id);
                Arc::new(AgentProcess::new(
                    name,
                    member.clone(),
                    ProcessSettings {
                        program: program.clone(),
                        registration_timeout: self.config.registration_timeout(),
                        shutdown_timeout: self.config.shutdown_timeout(),
                        socket_path: team_dir.join(format!("{}.sock", member.name)),
                    },
                    self.spawner.clone(),
                    self.events.clone(),
                    self.closed.clone(),
                ))
            })
            .collect();

        Ok(Arc::new(ActiveTeam {
            config,
            agents,
            bus,
            task_store,
            plan_approval,
        }))
    }

    /// Start every agent of an active team concurrently.
    ///
    /// Individual start failures are logged and do not fail the call; inspect
    /// agent states to find them.
    pub async fn start_agents(&self, name: &str) -> Result<(), TeamError> {
        let team = self
            .active(name)
            .ok_or_else(|| TeamError::NotActive(name.to_string()))?;

        let results = join_all(team.agents.iter().map(|agent| agent.start())).await;

        let mut failed = 0;
        for (agent, result) in team.agents.iter().zip(results) {
            if let Err(e) = result {
                failed += 1;
                tracing::warn!(team = %name, agent = %agent.config().name, error = %e, "Agent failed to start");
            }
        }
        tracing::info!(
            team = %name,
            started = team.agents.len() - failed,
            failed,
            "Team agents started"
        );
        Ok(())
    }

    /// Stop a team's agents (if live) and remove its on-disk state.
    ///
    /// Idempotent: unknown or already-deleted names succeed.
    pub async fn delete_team(&self, name: &str) -> Result<(), TeamError> {
        if !is_valid_name(name) {
            tracing::debug!(team = %name, "Ignoring delete of invalid team name");
            return Ok(());
        }

        let team = self.teams.lock().unwrap().remove(name);
        let was_active = team.is_some();
        if let Some(team) = team {
            join_all(
                team.agents
                    .iter()
                    .map(|agent| agent.stop_with_reason("team deleted")),
            )
            .await;
            team.bus.destroy();
            team.plan_approval.dispose();
            tracing::info!(team = %name, "Team agents stopped");
        }

        let team_dir = self.team_dir(name);
        let task_dir = self.task_dir(name);
        let removed_team = remove_dir_if_present(&team_dir)
            .await
            .map_err(|e| TeamError::io(&team_dir, e))?;
        let removed_tasks = remove_dir_if_present(&task_dir)
            .await
            .map_err(|e| TeamError::io(&task_dir, e))?;

        if was_active || removed_team || removed_tasks {
            tracing::info!(team = %name, was_active, "Team deleted");
            self.events.emit(TeamEvent::TeamDeleted {
                team: name.to_string(),
                was_active,
            });
        }
        Ok(())
    }

    /// Every readable team record on disk, oldest first.
    ///
    /// Unparseable records are skipped with a warning.
    pub async fn list_teams(&self) -> Result<Vec<TeamConfig>, TeamError> {
        let teams_dir = self.config.teams_dir();
        let mut entries = match tokio::fs::read_dir(&teams_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(TeamError::io(&teams_dir, e)),
        };

        let mut teams = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| TeamError::io(&teams_dir, e))?
        {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if !is_valid_name(&name) {
                continue;
            }
            match self.read_record(&name).await {
                Ok(Some(config)) => teams.push(config),
                Ok(None) => {}
                Err(e) => tracing::warn!(team = %name, error = %e, "Skipping unreadable team record"),
            }
        }
        teams.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.team_name.cmp(&b.team_name))
        });
        Ok(teams)
    }

    /// Read one team record from disk; `None` if it does not exist.
    pub async fn get_team(&self, name: &str) -> Result<Option<TeamConfig>, TeamError> {
        if !is_valid_name(name) {
            return Ok(None);
        }
        self.read_record(name).await
    }

    async fn read_record(&self, name: &str) -> Result<Option<TeamConfig>, TeamError> {
        let path = self.team_dir(name).join(TEAM_RECORD);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(TeamError::io(&path, e)),
        };
        let mut config: TeamConfig = serde_json::from_str(&contents)
            .map_err(|source| TeamError::InvalidRecord { path, source })?;
        config.status = if self.teams.lock().unwrap().contains_key(name) {
            TeamStatus::Active
        } else {
            TeamStatus::Inactive
        };
        Ok(Some(config))
    }

    fn active(&self, name: &str) -> Option<Arc<ActiveTeam>> {
        self.teams.lock().unwrap().get(name).cloned()
    }

    /// Names of the teams live in this manager, sorted.
    pub fn active_teams(&self) -> Vec<String> {
        let mut names: Vec<String> = self.teams.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    /// Agent states of an active team in member order; empty if inactive.
    pub fn get_agent_states(&self, team: &str) -> Vec<AgentState> {
        self.active(team)
            .map(|t| t.agents.iter().map(|a| a.state()).collect())
            .unwrap_or_default()
    }

    pub fn get_agent_state(&self, team: &str, agent: &str) -> Option<AgentState> {
        self.active(team)
            .and_then(|t| t.agent(agent).map(|a| a.state()))
    }

    /// Handle for talking to one agent of an active team.
    pub fn get_agent(&self, team: &str, agent: &str) -> Option<Arc<AgentProcess>> {
        self.active(team).and_then(|t| t.agent(agent).cloned())
    }

    /// All agent handles of an active team in member order.
    pub fn agents(&self, team: &str) -> Vec<Arc<AgentProcess>> {
        self.active(team)
            .map(|t| t.agents.clone())
            .unwrap_or_default()
    }

    /// Assign a task to one agent of an active team.
    pub fn assign_task(
        &self,
        team: &str,
        agent: &str,
        task_id: &str,
        subject: &str,
        description: &str,
    ) -> Result<u64, TeamError> {
        let process = self.get_agent(team, agent).ok_or_else(|| TeamError::AgentNotFound {
            team: team.to_string(),
            agent: agent.to_string(),
        })?;
        process.assign_task(task_id, subject, description)
    }

    pub fn get_message_bus(&self, team: &str) -> Option<Arc<dyn MessageBus>> {
        self.active(team).map(|t| t.bus.clone())
    }

    pub fn get_task_store(&self, team: &str) -> Option<Arc<dyn TaskStore>> {
        self.active(team).map(|t| t.task_store.clone())
    }

    pub fn get_plan_approval(&self, team: &str) -> Option<Arc<dyn PlanApproval>> {
        self.active(team).map(|t| t.plan_approval.clone())
    }

    /// Close the manager and delete every active team concurrently.
    ///
    /// After this, `create_team` fails and agent starts fail with a spawn error.
    pub async fn shutdown_all(&self) {
        self.closed.cancel();
        let names = self.active_teams();
        tracing::info!(teams = names.len(), "Shutting down all teams");

        let results = join_all(names.iter().map(|name| self.delete_team(name))).await;
        for (name, result) in names.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(team = %name, error = %e, "Failed to delete team during shutdown");
            }
        }
    }
}

/// Remove a directory tree, returning whether anything was there.
async fn remove_dir_if_present(path: &Path) -> io::Result<bool> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
