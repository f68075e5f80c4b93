//! Scripted workers for driving the coordinator without real processes.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_crew::config::AppConfig;
use agent_crew::orchestration::events::EventHub;
use agent_crew::orchestration::protocol::Envelope;
use agent_crew::orchestration::spawner::{
    SpawnSpec, SpawnedWorker, WorkerEvent, WorkerHandle, WorkerSpawner,
};
use agent_crew::orchestration::team_manager::TeamManager;
use agent_crew::orchestration::types::{AgentSpec, CreateTeamOptions};
use serde_json::{Value, json};
use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};

/// How a scripted worker reacts.
#[derive(Clone, Copy, Debug)]
pub struct Behavior {
    /// Send `agent.register` right after spawn.
    pub register: bool,
    /// Exit with code 0 when `hub.shutdown` arrives.
    pub exit_on_shutdown: bool,
}

impl Behavior {
    pub const COOPERATIVE: Behavior = Behavior {
        register: true,
        exit_on_shutdown: true,
    };
    pub const STUBBORN: Behavior = Behavior {
        register: true,
        exit_on_shutdown: false,
    };
    pub const SILENT: Behavior = Behavior {
        register: false,
        exit_on_shutdown: true,
    };
}

/// One scripted worker; the test plays its side of the channel.
pub struct FakeWorker {
    pub agent_id: String,
    behavior: Behavior,
    sent: Mutex<Vec<Envelope>>,
    killed: AtomicBool,
    events: Mutex<Option<UnboundedSender<WorkerEvent>>>,
}

impl FakeWorker {
    /// Deliver a raw JSON value as if the worker wrote it.
    pub fn push_json(&self, value: Value) {
        if let Some(tx) = self.events.lock().unwrap().as_ref() {
            let _ = tx.send(WorkerEvent::Message(value));
        }
    }

    pub fn task_update(&self, task_id: &str, status: &str) {
        self.push_json(json!({
            "jsonrpc": "2.0",
            "method": "agent.taskUpdate",
            "params": {"agentId": self.agent_id, "taskId": task_id, "status": status}
        }));
    }

    /// Simulate the process exiting on its own.
    pub fn exit(&self, code: Option<i32>) {
        if let Some(tx) = self.events.lock().unwrap().take() {
            let _ = tx.send(WorkerEvent::Exited(code));
        }
    }

    pub fn methods(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.method.clone())
            .collect()
    }

    pub fn sent(&self) -> Vec<Envelope> {
        self.sent.lock().unwrap().clone()
    }

    pub fn was_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}

impl WorkerHandle for FakeWorker {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn is_connected(&self) -> bool {
        self.events.lock().unwrap().is_some()
    }

    fn send(&self, envelope: &Envelope) -> io::Result<()> {
        if !self.is_connected() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "worker gone"));
        }
        self.sent.lock().unwrap().push(envelope.clone());
        if envelope.method == "hub.shutdown" && self.behavior.exit_on_shutdown {
            self.exit(Some(0));
        }
        Ok(())
    }

    fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
        self.exit(None);
    }
}

/// Spawner producing [`FakeWorker`]s; keeps the latest one per agent name.
pub struct FakeSpawner {
    behavior: Behavior,
    workers: Mutex<HashMap<String, Arc<FakeWorker>>>,
    spawns: Mutex<Vec<SpawnSpec>>,
}

impl FakeSpawner {
    pub fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            workers: Mutex::new(HashMap::new()),
            spawns: Mutex::new(Vec::new()),
        })
    }

    pub fn worker(&self, agent: &str) -> Arc<FakeWorker> {
        self.workers
            .lock()
            .unwrap()
            .get(agent)
            .cloned()
            .unwrap_or_else(|| panic!("agent {agent} was never spawned"))
    }

    pub fn spawns(&self) -> Vec<SpawnSpec> {
        self.spawns.lock().unwrap().clone()
    }
}

impl WorkerSpawner for FakeSpawner {
    fn spawn(&self, spec: &SpawnSpec) -> io::Result<SpawnedWorker> {
        let (tx, rx) = unbounded_channel();
        let worker = Arc::new(FakeWorker {
            agent_id: spec.agent.agent_id.clone(),
            behavior: self.behavior,
            sent: Mutex::new(Vec::new()),
            killed: AtomicBool::new(false),
            events: Mutex::new(Some(tx)),
        });
        if self.behavior.register {
            worker.push_json(json!({
                "jsonrpc": "2.0",
                "method": "agent.register",
                "params": {
                    "agentId": spec.agent.agent_id,
                    "agentName": spec.agent.name,
                    "teamName": spec.team_name,
                    "model": spec.agent.model,
                    "role": spec.agent.role,
                }
            }));
        }
        self.workers
            .lock()
            .unwrap()
            .insert(spec.agent.name.clone(), worker.clone());
        self.spawns.lock().unwrap().push(spec.clone());
        Ok(SpawnedWorker {
            handle: worker,
            events: rx,
        })
    }
}

pub fn test_config(data_dir: &Path, registration_ms: u64, shutdown_ms: u64) -> AppConfig {
    AppConfig {
        data_dir: data_dir.to_path_buf(),
        default_model: "test-model".to_string(),
        default_provider: "local".to_string(),
        registration_timeout_ms: registration_ms,
        shutdown_timeout_ms: shutdown_ms,
        worker_program: Some(PathBuf::from("agent-crew")),
        task_command: None,
    }
}

pub fn manager_with(
    data_dir: &Path,
    spawner: Arc<dyn WorkerSpawner>,
    registration_ms: u64,
    shutdown_ms: u64,
) -> TeamManager {
    TeamManager::new(
        test_config(data_dir, registration_ms, shutdown_ms),
        spawner,
        EventHub::new(),
    )
}

pub fn team(names: &[&str]) -> CreateTeamOptions {
    CreateTeamOptions {
        description: None,
        agents: names
            .iter()
            .map(|n| AgentSpec::new(*n, "test-model", "local"))
            .collect(),
    }
}

/// Let pump tasks drain queued worker events.
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(25)).await;
}
