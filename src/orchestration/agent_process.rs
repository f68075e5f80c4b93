//! Coordinator-side handle to exactly one worker.
//!
//! [`AgentProcess`] owns the full lifecycle of the worker bound to one
//! [`AgentConfig`]: spawn and registration handshake, cooperative stop with a
//! forced fallback, restart, outbound messages, and status tracking.
//!
//! **Event pump:** every spawn gets a pump task that drains the worker's
//! event stream in arrival order. Each spawn bumps a generation counter, and
//! the pump only touches shared state while its generation is current, so a
//! late event from a replaced worker can never clobber the new one.
//!
//! **Locking:** runtime state sits behind a `std::sync::Mutex` that is never
//! held across an await or while calling out to subscribers. Lifecycle calls
//! (`start`/`stop`/`restart`) are serialized by an async mutex.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;

use super::events::{EventHub, TeamEvent};
use super::protocol::{
    AgentMessage, Envelope, HubMessage, ShutdownParams, TaskAssignParams, TaskUpdateStatus,
};
use super::spawner::{SpawnSpec, SpawnedWorker, WorkerEvent, WorkerHandle, WorkerSpawner};
use super::status::{AgentStatus, Rejected, StatusInput, StatusMachine};
use super::types::{AgentConfig, AgentState};
use crate::error::{SpawnError, TeamError};

/// How long to wait for the exit event after a forced kill.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Per-agent process settings, derived from the app config.
#[derive(Clone, Debug)]
pub struct ProcessSettings {
    /// Worker executable (normally the current binary).
    pub program: PathBuf,
    pub registration_timeout: Duration,
    pub shutdown_timeout: Duration,
    /// Reserved out-of-band socket path handed to the worker.
    pub socket_path: PathBuf,
}

/// Callback invoked for every validated inbound message.
pub type MessageCallback = Arc<dyn Fn(&AgentMessage) + Send + Sync>;

/// Handle returned by [`AgentProcess::on_message`].
#[must_use = "keep the subscription to be able to unsubscribe"]
pub struct MessageSubscription {
    id: u64,
    inner: Weak<Inner>,
}

impl MessageSubscription {
    pub fn unsubscribe(self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.subscribers.lock().unwrap().retain(|(id, _)| *id != self.id);
        }
    }
}

struct Runtime {
    machine: StatusMachine,
    worker: Option<Arc<dyn WorkerHandle>>,
    generation: u64,
    /// Flips to `true` once the current worker's pump has seen it exit.
    exited: Option<watch::Receiver<bool>>,
}

struct Inner {
    config: AgentConfig,
    team_name: String,
    runtime: Mutex<Runtime>,
    subscribers: Mutex<Vec<(u64, MessageCallback)>>,
    next_subscriber_id: AtomicU64,
    next_message_id: AtomicU64,
    events: EventHub,
}

type RegistrationResult = Result<(), String>;

/// Coordinator-side owner of one worker.
pub struct AgentProcess {
    inner: Arc<Inner>,
    settings: ProcessSettings,
    spawner: Arc<dyn WorkerSpawner>,
    /// Cancelled when the owning manager shuts down.
    closed: CancellationToken,
    lifecycle: tokio::sync::Mutex<()>,
}

impl AgentProcess {
    pub fn new(
        team_name: impl Into<String>,
        config: AgentConfig,
        settings: ProcessSettings,
        spawner: Arc<dyn WorkerSpawner>,
        events: EventHub,
        closed: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                team_name: team_name.into(),
                runtime: Mutex::new(Runtime {
                    machine: StatusMachine::new(),
                    worker: None,
                    generation: 0,
                    exited: None,
                }),
                subscribers: Mutex::new(Vec::new()),
                next_subscriber_id: AtomicU64::new(0),
                next_message_id: AtomicU64::new(0),
                events,
            }),
            settings,
            spawner,
            closed,
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    pub fn team_name(&self) -> &str {
        &self.inner.team_name
    }

    /// Snapshot of the agent's runtime view.
    pub fn state(&self) -> AgentState {
        let rt = self.inner.runtime.lock().unwrap();
        AgentState {
            config: self.inner.config.clone(),
            status: rt.machine.status(),
            current_task_id: rt.machine.current_task_id().map(str::to_string),
        }
    }

    pub fn status(&self) -> AgentStatus {
        self.inner.runtime.lock().unwrap().machine.status()
    }

    pub fn current_task_id(&self) -> Option<String> {
        self.inner
            .runtime
            .lock()
            .unwrap()
            .machine
            .current_task_id()
            .map(str::to_string)
    }

    /// Whether a worker is attached and has not exited.
    pub fn is_alive(&self) -> bool {
        self.inner.runtime.lock().unwrap().worker.is_some()
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner
            .runtime
            .lock()
            .unwrap()
            .worker
            .as_ref()
            .and_then(|w| w.pid())
    }

    /// Spawn the worker and wait for its `agent.register`.
    ///
    /// Fails if the worker exits first or the registration timeout elapses;
    /// the worker is killed in both cases. A no-op when already running.
    pub async fn start(&self) -> Result<(), SpawnError> {
        let _lifecycle = self.lifecycle.lock().await;
        self.start_locked().await
    }

    /// Ask the worker to shut down, killing it if it outlives the timeout.
    ///
    /// Never fails. Afterwards [`Self::is_alive`] is false.
    pub async fn stop(&self) {
        self.stop_with_reason("stop requested").await;
    }

    pub async fn stop_with_reason(&self, reason: &str) {
        let _lifecycle = self.lifecycle.lock().await;
        self.stop_locked(reason).await;
    }

    /// Full respawn: stop, then start with fresh status.
    pub async fn restart(&self) -> Result<(), SpawnError> {
        let _lifecycle = self.lifecycle.lock().await;
        self.stop_locked("restart").await;
        self.start_locked().await
    }

    /// Send a message to the worker.
    ///
    /// Returns the assigned message id, or `None` (logged) when no worker is
    /// connected or the write fails.
    pub fn send_ipc(&self, message: &HubMessage) -> Option<u64> {
        let agent = &self.inner.config.name;
        let worker = self.inner.runtime.lock().unwrap().worker.clone();
        let Some(worker) = worker.filter(|w| w.is_connected()) else {
            tracing::warn!(agent = %agent, method = message.method(), "Worker not connected; message not sent");
            return None;
        };

        let id = self.inner.next_message_id.fetch_add(1, Ordering::Relaxed) + 1;
        let envelope = match message.to_envelope() {
            Ok(envelope) => envelope.with_id(id),
            Err(e) => {
                tracing::error!(agent = %agent, method = message.method(), error = %e, "Failed to encode message");
                return None;
            }
        };
        match worker.send(&envelope) {
            Ok(()) => {
                tracing::debug!(agent = %agent, method = message.method(), id, "Sent message to worker");
                Some(id)
            }
            Err(e) => {
                tracing::warn!(agent = %agent, method = message.method(), error = %e, "Failed to send message to worker");
                None
            }
        }
    }

    /// Record the task as current, then send `hub.taskAssign`.
    ///
    /// The agent must be running and idle.
    pub fn assign_task(&self, task_id: &str, subject: &str, description: &str) -> Result<u64, TeamError> {
        let agent = &self.inner.config.name;
        if !self.is_alive() {
            return Err(TeamError::NotRunning(agent.clone()));
        }

        self.inner
            .transition(None, StatusInput::TaskAssigned(task_id.to_string()), None)
            .map_err(|rejected| TeamError::InvalidTransition {
                agent: agent.clone(),
                status: rejected.status,
                input: rejected.input,
            })?;

        let message = HubMessage::TaskAssign(TaskAssignParams {
            task_id: task_id.to_string(),
            subject: subject.to_string(),
            description: description.to_string(),
        });
        match self.send_ipc(&message) {
            Some(id) => {
                tracing::info!(agent = %agent, task_id, subject, "Task assigned");
                Ok(id)
            }
            None => {
                // Undo the optimistic assignment; nothing will ever finish it.
                let _ = self.inner.transition(
                    None,
                    StatusInput::TaskFinished(task_id.to_string()),
                    Some("assignment not delivered".to_string()),
                );
                Err(TeamError::NotRunning(agent.clone()))
            }
        }
    }

    /// Subscribe to every validated inbound message from the worker.
    ///
    /// Callbacks run on the pump task; a panicking callback is logged and
    /// does not affect other subscribers. Callbacks must not call back into
    /// lifecycle methods synchronously.
    pub fn on_message<F>(&self, callback: F) -> MessageSubscription
    where
        F: Fn(&AgentMessage) + Send + Sync + 'static,
    {
        let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .lock()
            .unwrap()
            .push((id, Arc::new(callback)));
        MessageSubscription {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    async fn start_locked(&self) -> Result<(), SpawnError> {
        let agent = self.inner.config.name.clone();
        if self.closed.is_cancelled() {
            return Err(SpawnError::new(&agent, "team manager has been shut down"));
        }
        if self.is_alive() {
            tracing::debug!(agent = %agent, "Worker already running; start is a no-op");
            return Ok(());
        }

        let spec = SpawnSpec::for_agent(
            &self.inner.team_name,
            &self.inner.config,
            self.settings.program.clone(),
            self.settings.socket_path.clone(),
        );
        let SpawnedWorker { handle, events } = self
            .spawner
            .spawn(&spec)
            .map_err(|e| SpawnError::new(&agent, format!("spawn failed: {e}")))?;

        let (registered_tx, registered_rx) = oneshot::channel::<RegistrationResult>();
        let (exited_tx, exited_rx) = watch::channel(false);
        let (generation, previous) = {
            let mut rt = self.inner.runtime.lock().unwrap();
            let previous = rt.machine.status();
            rt.generation += 1;
            rt.machine = StatusMachine::new();
            rt.worker = Some(handle.clone());
            rt.exited = Some(exited_rx);
            (rt.generation, previous)
        };
        if previous != AgentStatus::Idle {
            self.inner.emit_status(previous, AgentStatus::Idle, None, Some("respawned".into()));
        }

        tokio::spawn(pump(
            self.inner.clone(),
            generation,
            events,
            registered_tx,
            exited_tx,
        ));

        let timeout = self.settings.registration_timeout;
        let outcome = tokio::select! {
            result = registered_rx => result
                .unwrap_or_else(|_| Err("worker channel closed before registering".to_string())),
            _ = tokio::time::sleep(timeout) => {
                Err(format!("registration timed out after {}ms", timeout.as_millis()))
            }
        };

        match outcome {
            Ok(()) => {
                let pid = handle.pid();
                tracing::info!(agent = %agent, team = %self.inner.team_name, ?pid, "Agent registered");
                self.inner.events.emit(TeamEvent::AgentSpawned {
                    team: self.inner.team_name.clone(),
                    agent_name: agent,
                    agent_id: self.inner.config.agent_id.clone(),
                    pid,
                });
                Ok(())
            }
            Err(reason) => {
                tracing::warn!(agent = %agent, reason = %reason, "Worker failed to register; killing it");
                handle.kill();
                self.inner.detach(generation, Some(reason.clone()));
                Err(SpawnError::new(agent, reason))
            }
        }
    }

    async fn stop_locked(&self, reason: &str) {
        let agent = &self.inner.config.name;
        let (worker, exited, generation) = {
            let rt = self.inner.runtime.lock().unwrap();
            (rt.worker.clone(), rt.exited.clone(), rt.generation)
        };
        let Some(worker) = worker else {
            tracing::debug!(agent = %agent, "Stop on agent with no worker");
            return;
        };

        self.send_ipc(&HubMessage::Shutdown(ShutdownParams {
            reason: reason.to_string(),
        }));

        let exited_in_time = match exited.clone() {
            Some(rx) => wait_for_exit(rx, self.settings.shutdown_timeout).await,
            None => false,
        };

        if exited_in_time {
            tracing::info!(agent = %agent, "Worker exited cleanly");
        } else {
            tracing::warn!(
                agent = %agent,
                timeout_ms = self.settings.shutdown_timeout.as_millis() as u64,
                "Worker did not exit in time; killing it"
            );
            worker.kill();
            if let Some(rx) = exited {
                wait_for_exit(rx, KILL_GRACE).await;
            }
        }

        self.inner.detach(generation, None);
    }
}

async fn wait_for_exit(mut rx: watch::Receiver<bool>, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, rx.wait_for(|exited| *exited)).await,
        Ok(Ok(_))
    )
}

impl Inner {
    fn is_current(&self, generation: u64) -> bool {
        self.runtime.lock().unwrap().generation == generation
    }

    /// Apply a status input, emitting a change event if the status moved.
    ///
    /// With `Some(generation)`, inputs from a replaced worker are ignored.
    fn transition(
        &self,
        generation: Option<u64>,
        input: StatusInput,
        detail: Option<String>,
    ) -> Result<(), Rejected> {
        let (transition, task_id) = {
            let mut rt = self.runtime.lock().unwrap();
            if generation.is_some_and(|g| g != rt.generation) {
                tracing::debug!(agent = %self.config.name, ?input, "Ignoring input from replaced worker");
                return Ok(());
            }
            let task_id = match &input {
                StatusInput::TaskAssigned(t)
                | StatusInput::TaskStarted(t)
                | StatusInput::TaskFinished(t) => Some(t.clone()),
                _ => rt.machine.current_task_id().map(str::to_string),
            };
            (rt.machine.apply(input)?, task_id)
        };

        if transition.changed() {
            self.emit_status(transition.from, transition.to, task_id, detail);
        }
        Ok(())
    }

    fn emit_status(
        &self,
        from: AgentStatus,
        to: AgentStatus,
        task_id: Option<String>,
        detail: Option<String>,
    ) {
        tracing::info!(agent = %self.config.name, %from, %to, task_id = ?task_id, "Agent status changed");
        self.events.emit(TeamEvent::AgentStatusChanged {
            team: self.team_name.clone(),
            agent_name: self.config.name.clone(),
            agent_id: self.config.agent_id.clone(),
            from,
            to,
            task_id,
            detail,
        });
    }

    /// Clear the worker handle and mark the agent shut down.
    fn detach(&self, generation: u64, detail: Option<String>) {
        {
            let mut rt = self.runtime.lock().unwrap();
            if rt.generation != generation {
                return;
            }
            rt.worker = None;
        }
        // ProcessExited is accepted from every state.
        let _ = self.transition(Some(generation), StatusInput::ProcessExited, detail);
    }

    fn handle_message(
        &self,
        generation: u64,
        value: Value,
        registered: &mut Option<oneshot::Sender<RegistrationResult>>,
    ) {
        let agent = &self.config.name;
        let envelope = match Envelope::from_value(value) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(agent = %agent, error = %e, "Dropping malformed message from worker");
                return;
            }
        };
        let message = match AgentMessage::from_envelope(&envelope) {
            Ok(Some(message)) => message,
            Ok(None) => {
                tracing::debug!(agent = %agent, method = %envelope.method, "Ignoring unknown method");
                return;
            }
            Err(e) => {
                tracing::warn!(agent = %agent, error = %e, "Dropping malformed message from worker");
                return;
            }
        };
        if message.agent_id() != self.config.agent_id {
            tracing::warn!(
                agent = %agent,
                claimed = %message.agent_id(),
                method = message.method(),
                "Dropping message with foreign agentId"
            );
            return;
        }
        if !self.is_current(generation) {
            return;
        }

        match &message {
            AgentMessage::Register(_) => match registered.take() {
                Some(tx) => {
                    let _ = tx.send(Ok(()));
                }
                None => {
                    tracing::debug!(agent = %agent, "Ignoring duplicate registration");
                    return;
                }
            },
            AgentMessage::TaskUpdate(update) => {
                let input = match update.status {
                    TaskUpdateStatus::InProgress => StatusInput::TaskStarted(update.task_id.clone()),
                    TaskUpdateStatus::Completed | TaskUpdateStatus::Failed => {
                        StatusInput::TaskFinished(update.task_id.clone())
                    }
                };
                if let Err(rejected) = self.transition(Some(generation), input, update.error.clone()) {
                    tracing::warn!(
                        agent = %agent,
                        task_id = %update.task_id,
                        status = %rejected.status,
                        input = ?rejected.input,
                        "Rejected status transition"
                    );
                }
            }
            AgentMessage::StreamChunk(_) => {}
        }

        self.notify(&message);
    }

    fn notify(&self, message: &AgentMessage) {
        let subscribers: Vec<MessageCallback> = self
            .subscribers
            .lock()
            .unwrap()
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for callback in subscribers {
            if catch_unwind(AssertUnwindSafe(|| callback(message))).is_err() {
                tracing::error!(agent = %self.config.name, method = message.method(), "Message subscriber panicked");
            }
        }
    }
}

/// Drain one worker's events in arrival order.
async fn pump(
    inner: Arc<Inner>,
    generation: u64,
    mut events: UnboundedReceiver<WorkerEvent>,
    registered_tx: oneshot::Sender<RegistrationResult>,
    exited_tx: watch::Sender<bool>,
) {
    let mut registered = Some(registered_tx);
    let mut exit_detail = None;

    while let Some(event) = events.recv().await {
        match event {
            WorkerEvent::Message(value) => inner.handle_message(generation, value, &mut registered),
            WorkerEvent::Error(reason) => {
                tracing::warn!(agent = %inner.config.name, reason = %reason, "Worker channel error");
                if let Err(rejected) = inner.transition(Some(generation), StatusInput::ProcessError, Some(reason)) {
                    tracing::debug!(agent = %inner.config.name, status = %rejected.status, "Error after shutdown ignored");
                }
            }
            WorkerEvent::Exited(code) => {
                tracing::info!(agent = %inner.config.name, ?code, "Worker exited");
                exit_detail = Some(match code {
                    Some(code) => format!("exited with code {code}"),
                    None => "terminated".to_string(),
                });
                break;
            }
        }
    }

    if let Some(tx) = registered.take() {
        let reason = exit_detail
            .clone()
            .map(|d| format!("worker {d} before registering"))
            .unwrap_or_else(|| "worker channel closed before registering".to_string());
        let _ = tx.send(Err(reason));
    }
    inner.detach(generation, exit_detail);
    let _ = exited_tx.send(true);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::events::EventKind;
    use serde_json::json;
    use std::io;
    use std::sync::atomic::AtomicBool;
    use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};

    /// Worker controlled directly by the test.
    #[derive(Default)]
    struct ScriptedHandle {
        sent: Mutex<Vec<Envelope>>,
        killed: AtomicBool,
        events: Mutex<Option<UnboundedSender<WorkerEvent>>>,
    }

    impl WorkerHandle for ScriptedHandle {
        fn pid(&self) -> Option<u32> {
            Some(4242)
        }

        fn is_connected(&self) -> bool {
            !self.killed.load(Ordering::SeqCst)
        }

        fn send(&self, envelope: &Envelope) -> io::Result<()> {
            self.sent.lock().unwrap().push(envelope.clone());
            Ok(())
        }

        fn kill(&self) {
            self.killed.store(true, Ordering::SeqCst);
            if let Some(tx) = self.events.lock().unwrap().take() {
                let _ = tx.send(WorkerEvent::Exited(None));
            }
        }
    }

    impl ScriptedHandle {
        fn push(&self, event: WorkerEvent) {
            if let Some(tx) = self.events.lock().unwrap().as_ref() {
                let _ = tx.send(event);
            }
        }

        fn methods(&self) -> Vec<String> {
            self.sent.lock().unwrap().iter().map(|e| e.method.clone()).collect()
        }
    }

    /// Spawner handing out one scripted worker per spawn.
    struct ScriptedSpawner {
        register: bool,
        spawned: Mutex<Vec<Arc<ScriptedHandle>>>,
    }

    impl ScriptedSpawner {
        fn new(register: bool) -> Arc<Self> {
            Arc::new(Self {
                register,
                spawned: Mutex::new(Vec::new()),
            })
        }

        fn last(&self) -> Arc<ScriptedHandle> {
            self.spawned.lock().unwrap().last().cloned().unwrap()
        }
    }

    impl WorkerSpawner for ScriptedSpawner {
        fn spawn(&self, spec: &SpawnSpec) -> io::Result<SpawnedWorker> {
            let (tx, rx) = unbounded_channel();
            if self.register {
                let _ = tx.send(WorkerEvent::Message(json!({
                    "jsonrpc": "2.0",
                    "method": "agent.register",
                    "params": {
                        "agentId": spec.agent.agent_id,
                        "agentName": spec.agent.name,
                        "teamName": spec.team_name,
                        "model": spec.agent.model,
                        "role": spec.agent.role,
                    }
                })));
            }
            let handle = Arc::new(ScriptedHandle::default());
            *handle.events.lock().unwrap() = Some(tx);
            self.spawned.lock().unwrap().push(handle.clone());
            Ok(SpawnedWorker { handle, events: rx })
        }
    }

    fn config() -> AgentConfig {
        AgentConfig {
            name: "A".into(),
            agent_id: "id-a".into(),
            agent_type: "general-purpose".into(),
            model: "m".into(),
            provider: "local".into(),
            role: "worker".into(),
        }
    }

    fn process(spawner: Arc<ScriptedSpawner>, events: EventHub) -> AgentProcess {
        AgentProcess::new(
            "alpha",
            config(),
            ProcessSettings {
                program: PathBuf::from("agent-crew"),
                registration_timeout: Duration::from_millis(200),
                shutdown_timeout: Duration::from_millis(200),
                socket_path: PathBuf::from("/tmp/alpha/A.sock"),
            },
            spawner,
            events,
            CancellationToken::new(),
        )
    }

    fn update(task_id: &str, status: &str) -> WorkerEvent {
        WorkerEvent::Message(json!({
            "jsonrpc": "2.0",
            "method": "agent.taskUpdate",
            "params": {"agentId": "id-a", "taskId": task_id, "status": status}
        }))
    }

    /// Let the pump task drain queued events.
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn start_registers_and_task_cycle_tracks_status() {
        let spawner = ScriptedSpawner::new(true);
        let agent = process(spawner.clone(), EventHub::new());
        agent.start().await.unwrap();
        assert!(agent.is_alive());
        assert_eq!(agent.pid(), Some(4242));
        assert_eq!(agent.status(), AgentStatus::Idle);

        let id = agent.assign_task("t1", "Fix", "fix it").unwrap();
        assert_eq!(id, 1);
        assert_eq!(agent.current_task_id().as_deref(), Some("t1"));
        assert_eq!(agent.status(), AgentStatus::Active);

        let worker = spawner.last();
        worker.push(update("t1", "in_progress"));
        worker.push(update("t1", "completed"));
        settle().await;

        let state = agent.state();
        assert_eq!(state.status, AgentStatus::Idle);
        assert_eq!(state.current_task_id, None);
        assert_eq!(worker.methods(), vec!["hub.taskAssign"]);
    }

    #[tokio::test]
    async fn registration_timeout_kills_worker() {
        let spawner = ScriptedSpawner::new(false);
        let agent = process(spawner.clone(), EventHub::new());

        let err = agent.start().await.unwrap_err();
        assert_eq!(err.agent, "A");
        assert!(err.reason.contains("timed out"), "{}", err.reason);
        assert!(spawner.last().killed.load(Ordering::SeqCst));
        assert!(!agent.is_alive());
        assert_eq!(agent.status(), AgentStatus::Shutdown);
    }

    #[tokio::test]
    async fn malformed_and_foreign_messages_change_nothing() {
        let spawner = ScriptedSpawner::new(true);
        let agent = process(spawner.clone(), EventHub::new());
        agent.start().await.unwrap();

        let calls = Arc::new(AtomicU64::new(0));
        let c = calls.clone();
        let _sub = agent.on_message(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        let worker = spawner.last();
        worker.push(WorkerEvent::Message(json!({"method": "agent.taskUpdate", "params": {}})));
        worker.push(WorkerEvent::Message(json!({"jsonrpc": "2.0", "method": 7})));
        worker.push(WorkerEvent::Message(json!({"jsonrpc": "2.0", "method": "agent.taskUpdate", "params": [1]})));
        worker.push(WorkerEvent::Message(json!({
            "jsonrpc": "2.0",
            "method": "agent.taskUpdate",
            "params": {"agentId": "someone-else", "taskId": "t1", "status": "in_progress"}
        })));
        settle().await;

        assert_eq!(agent.status(), AgentStatus::Idle);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn second_registration_is_ignored() {
        let spawner = ScriptedSpawner::new(true);
        let events = EventHub::new();
        let agent = process(spawner.clone(), events.clone());
        agent.start().await.unwrap();
        agent.assign_task("t1", "Fix", "fix it").unwrap();

        let (_events_sub, mut seen_events) = events.channel();
        let calls = Arc::new(AtomicU64::new(0));
        let c = calls.clone();
        let _sub = agent.on_message(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        spawner.last().push(WorkerEvent::Message(json!({
            "jsonrpc": "2.0",
            "method": "agent.register",
            "params": {
                "agentId": "id-a",
                "agentName": "A",
                "teamName": "alpha",
                "model": "m",
                "role": "worker",
            }
        })));
        settle().await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(seen_events.try_recv().is_err());
        let state = agent.state();
        assert_eq!(state.status, AgentStatus::Active);
        assert_eq!(state.current_task_id.as_deref(), Some("t1"));
        assert!(agent.is_alive());
    }

    #[tokio::test]
    async fn subscriber_panics_are_contained() {
        let spawner = ScriptedSpawner::new(true);
        let agent = process(spawner.clone(), EventHub::new());
        agent.start().await.unwrap();

        let _bad = agent.on_message(|_| panic!("subscriber bug"));
        let seen = Arc::new(AtomicU64::new(0));
        let s = seen.clone();
        let sub = agent.on_message(move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });

        spawner.last().push(update("t5", "in_progress"));
        settle().await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(agent.current_task_id().as_deref(), Some("t5"));

        sub.unsubscribe();
        spawner.last().push(update("t5", "completed"));
        settle().await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(agent.status(), AgentStatus::Idle);
    }

    #[tokio::test]
    async fn channel_error_sets_error_without_killing() {
        let spawner = ScriptedSpawner::new(true);
        let agent = process(spawner.clone(), EventHub::new());
        agent.start().await.unwrap();

        spawner.last().push(WorkerEvent::Error("read failed".into()));
        settle().await;
        assert_eq!(agent.status(), AgentStatus::Error);
        assert!(agent.is_alive());
        assert!(!spawner.last().killed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn unexpected_exit_is_terminal_until_restart() {
        let spawner = ScriptedSpawner::new(true);
        let events = EventHub::new();
        let (_sub, mut rx) = events.channel();
        let agent = process(spawner.clone(), events);
        agent.start().await.unwrap();

        spawner.last().push(WorkerEvent::Exited(Some(1)));
        settle().await;
        assert_eq!(agent.status(), AgentStatus::Shutdown);
        assert!(!agent.is_alive());
        assert!(agent.assign_task("t1", "s", "d").is_err());

        agent.restart().await.unwrap();
        assert_eq!(agent.status(), AgentStatus::Idle);
        assert_eq!(spawner.spawned.lock().unwrap().len(), 2);

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.kind());
        }
        assert_eq!(
            kinds,
            vec![
                EventKind::AgentSpawned,
                EventKind::AgentStatusChanged,
                EventKind::AgentStatusChanged,
                EventKind::AgentSpawned,
            ]
        );
    }

    #[tokio::test]
    async fn stop_kills_unresponsive_worker_and_never_fails() {
        let spawner = ScriptedSpawner::new(true);
        let agent = process(spawner.clone(), EventHub::new());
        agent.start().await.unwrap();

        agent.stop().await;
        let worker = spawner.last();
        assert_eq!(worker.methods(), vec!["hub.shutdown"]);
        assert!(worker.killed.load(Ordering::SeqCst));
        assert!(!agent.is_alive());
        assert_eq!(agent.status(), AgentStatus::Shutdown);

        // Stopping again is harmless.
        agent.stop().await;
    }

    #[tokio::test]
    async fn busy_agent_rejects_second_assignment() {
        let spawner = ScriptedSpawner::new(true);
        let agent = process(spawner, EventHub::new());
        agent.start().await.unwrap();

        agent.assign_task("t1", "s", "d").unwrap();
        let err = agent.assign_task("t2", "s", "d").unwrap_err();
        assert!(matches!(err, TeamError::InvalidTransition { status: AgentStatus::Active, .. }));
        assert_eq!(agent.current_task_id().as_deref(), Some("t1"));
    }

    #[tokio::test]
    async fn closed_manager_refuses_start() {
        let spawner = ScriptedSpawner::new(true);
        let closed = CancellationToken::new();
        closed.cancel();
        let agent = AgentProcess::new(
            "alpha",
            config(),
            ProcessSettings {
                program: PathBuf::from("agent-crew"),
                registration_timeout: Duration::from_millis(200),
                shutdown_timeout: Duration::from_millis(200),
                socket_path: PathBuf::new(),
            },
            spawner.clone(),
            EventHub::new(),
            closed,
        );
        let err = agent.start().await.unwrap_err();
        assert!(err.reason.contains("shut down"));
        assert!(spawner.spawned.lock().unwrap().is_empty());
    }

    #[test]
    fn send_without_worker_returns_none() {
        let agent = process(ScriptedSpawner::new(true), EventHub::new());
        let sent = agent.send_ipc(&HubMessage::Shutdown(ShutdownParams {
            reason: "x".into(),
        }));
        assert_eq!(sent, None);
    }
}
