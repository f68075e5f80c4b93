//! Team-scoped collaborators consumed by the [`super::team_manager::TeamManager`].
//!
//! The manager only relies on the traits below. [`LocalCollaborators`] provides
//! the default implementations: an in-memory message bus, a directory-backed
//! task store, and a plan-approval gate bound to the team's bus.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message bus for one team.
pub trait MessageBus: Send + Sync {
    fn register_agent(&self, agent_id: &str);
    fn destroy(&self);
}

/// Lifecycle of a task held in a [`TaskStore`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// One persisted task.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub id: String,
    pub subject: String,
    pub description: String,
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Persistent task queue for one team.
pub trait TaskStore: Send + Sync {
    /// Directory holding this team's tasks.
    fn dir(&self) -> &Path;
    fn create(&self, subject: &str, description: &str) -> io::Result<TaskRecord>;
    fn get(&self, id: &str) -> io::Result<Option<TaskRecord>>;
    fn list(&self) -> io::Result<Vec<TaskRecord>>;
    fn update(&self, id: &str, state: TaskState, owner: Option<&str>) -> io::Result<TaskRecord>;
}

/// Plan-approval workflow bound to a team's message bus.
pub trait PlanApproval: Send + Sync {
    fn dispose(&self);
}

/// Builds the collaborators for a newly created team.
pub trait CollaboratorFactory: Send + Sync {
    fn message_bus(&self, team: &str) -> Arc<dyn MessageBus>;
    fn task_store(&self, team: &str, dir: &Path) -> io::Result<Arc<dyn TaskStore>>;
    fn plan_approval(&self, team: &str, bus: Arc<dyn MessageBus>) -> Arc<dyn PlanApproval>;
}

// ---------------------------------------------------------------------------
// Default implementations
// ---------------------------------------------------------------------------

/// In-memory bus that tracks registered agents.
#[derive(Default)]
pub struct LocalMessageBus {
    team: String,
    agents: Mutex<BTreeSet<String>>,
    destroyed: AtomicBool,
}

impl LocalMessageBus {
    pub fn new(team: impl Into<String>) -> Self {
        Self {
            team: team.into(),
            ..Default::default()
        }
    }

    pub fn agents(&self) -> Vec<String> {
        self.agents.lock().unwrap().iter().cloned().collect()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

impl MessageBus for LocalMessageBus {
    fn register_agent(&self, agent_id: &str) {
        if self.is_destroyed() {
            tracing::warn!(team = %self.team, agent_id, "register_agent on destroyed bus ignored");
            return;
        }
        self.agents.lock().unwrap().insert(agent_id.to_string());
    }

    fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        self.agents.lock().unwrap().clear();
        tracing::debug!(team = %self.team, "Message bus destroyed");
    }
}

/// Task store keeping one JSON file per task.
pub struct FileTaskStore {
    dir: PathBuf,
    // Serializes read-modify-write of task files.
    write_lock: Mutex<()>,
}

impl FileTaskStore {
    /// Open (creating if needed) the store at `dir`.
    pub fn open(dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            write_lock: Mutex::new(()),
        })
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn write(&self, record: &TaskRecord) -> io::Result<()> {
        let json = serde_json::to_string_pretty(record).map_err(io::Error::other)?;
        fs::write(self.path_for(&record.id), json)
    }
}

impl TaskStore for FileTaskStore {
    fn dir(&self) -> &Path {
        &self.dir
    }

    fn create(&self, subject: &str, description: &str) -> io::Result<TaskRecord> {
        let record = TaskRecord {
            id: Uuid::new_v4().to_string(),
            subject: subject.to_string(),
            description: description.to_string(),
            state: TaskState::Pending,
            owner: None,
            created_at: Utc::now(),
        };
        let _guard = self.write_lock.lock().unwrap();
        self.write(&record)?;
        Ok(record)
    }

    fn get(&self, id: &str) -> io::Result<Option<TaskRecord>> {
        match fs::read_to_string(self.path_for(id)) {
            Ok(contents) => serde_json::from_str(&contents)
                .map(Some)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn list(&self) -> io::Result<Vec<TaskRecord>> {
        let mut records = Vec::new();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(records),
            Err(e) => return Err(e),
        };
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            match fs::read_to_string(&path)
                .ok()
                .and_then(|s| serde_json::from_str::<TaskRecord>(&s).ok())
            {
                Some(record) => records.push(record),
                None => tracing::warn!(path = %path.display(), "Skipping unreadable task file"),
            }
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(records)
    }

    fn update(&self, id: &str, state: TaskState, owner: Option<&str>) -> io::Result<TaskRecord> {
        let _guard = self.write_lock.lock().unwrap();
        let mut record = self.get(id)?.ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("task {id} not found"))
        })?;
        record.state = state;
        if let Some(owner) = owner {
            record.owner = Some(owner.to_string());
        }
        self.write(&record)?;
        Ok(record)
    }
}

/// Plan-approval gate holding a reference to its team's bus.
pub struct PlanApprovalGate {
    team: String,
    bus: Arc<dyn MessageBus>,
    disposed: AtomicBool,
}

impl PlanApprovalGate {
    pub fn new(team: impl Into<String>, bus: Arc<dyn MessageBus>) -> Self {
        Self {
            team: team.into(),
            bus,
            disposed: AtomicBool::new(false),
        }
    }

    pub fn bus(&self) -> &Arc<dyn MessageBus> {
        &self.bus
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

impl PlanApproval for PlanApprovalGate {
    fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            tracing::debug!(team = %self.team, "Plan approval disposed");
        }
    }
}

/// Default factory: [`LocalMessageBus`], [`FileTaskStore`], [`PlanApprovalGate`].
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalCollaborators;

impl CollaboratorFactory for LocalCollaborators {
    fn message_bus(&self, team: &str) -> Arc<dyn MessageBus> {
        Arc::new(LocalMessageBus::new(team))
    }

    fn task_store(&self, _team: &str, dir: &Path) -> io::Result<Arc<dyn TaskStore>> {
        Ok(Arc::new(FileTaskStore::open(dir)?))
    }

    fn plan_approval(&self, team: &str, bus: Arc<dyn MessageBus>) -> Arc<dyn PlanApproval> {
        Arc::new(PlanApprovalGate::new(team, bus))
    }
}
