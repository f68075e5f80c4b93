//! Worker runtime: the code that runs inside each spawned agent process.
//!
//! On launch the worker announces itself with `agent.register`, then reacts
//! only to inbound channel messages and termination signals:
//!
//! - `hub.taskAssign` runs the task on its own tokio task, bracketed by an
//!   `in_progress` update and exactly one terminal (`completed`/`failed`)
//!   update for the same task id.
//! - `hub.shutdown`, a signal, or EOF on the channel cancel any running task
//!   (which still reports its terminal update) and end the runtime.

pub mod executor;

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::orchestration::protocol::{
    AgentMessage, Envelope, HubMessage, RegisterParams, StreamChunkParams, TaskAssignParams,
    TaskUpdateParams, TaskUpdateStatus,
};
use crate::orchestration::spawner::env;
use crate::orchestration::transport::{FrameReader, encode_line, write_line};
use crate::orchestration::types::AgentConfig;
use executor::TaskExecutor;

/// Grace period for a cancelled task to emit its terminal update.
const CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Who this worker is, as announced in `agent.register`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerIdentity {
    pub team_name: String,
    pub agent_name: String,
    pub agent_id: String,
    pub model: String,
    pub role: String,
    pub socket_path: Option<PathBuf>,
}

/// Identity values supplied on the command line.
#[derive(Clone, Debug, Default)]
pub struct IdentityFlags {
    pub team: Option<String>,
    pub name: Option<String>,
    pub model: Option<String>,
    pub role: Option<String>,
    pub agent_id: Option<String>,
}

impl WorkerIdentity {
    pub fn from_agent(team_name: &str, agent: &AgentConfig) -> Self {
        Self {
            team_name: team_name.to_string(),
            agent_name: agent.name.clone(),
            agent_id: agent.agent_id.clone(),
            model: agent.model.clone(),
            role: agent.role.clone(),
            socket_path: None,
        }
    }

    /// Resolve identity from flags, falling back to the environment.
    ///
    /// `lookup` is the environment accessor (injected for tests). Team and
    /// agent name are required; the model falls back to `default_model`, the
    /// role to `worker`, and a missing agent id is generated.
    pub fn resolve<F>(flags: &IdentityFlags, lookup: F, default_model: &str) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let pick = |flag: &Option<String>, var: &str| {
            flag.clone()
                .or_else(|| lookup(var))
                .filter(|v| !v.trim().is_empty())
        };

        let team_name = pick(&flags.team, env::TEAM)
            .ok_or_else(|| anyhow::anyhow!("agent mode requires --team or {}", env::TEAM))?;
        let agent_name = pick(&flags.name, env::AGENT_NAME)
            .ok_or_else(|| anyhow::anyhow!("agent mode requires --name or {}", env::AGENT_NAME))?;
        let model = pick(&flags.model, env::MODEL).unwrap_or_else(|| default_model.to_string());
        let role = pick(&flags.role, env::ROLE).unwrap_or_else(|| "worker".to_string());
        let agent_id = pick(&flags.agent_id, env::AGENT_ID).unwrap_or_else(|| {
            let id = Uuid::new_v4().to_string();
            tracing::warn!(agent = %agent_name, agent_id = %id, "No agent id supplied; generated one");
            id
        });
        let socket_path = lookup(env::SOCKET_PATH).map(PathBuf::from);

        Ok(Self {
            team_name,
            agent_name,
            agent_id,
            model,
            role,
            socket_path,
        })
    }
}

/// Whether the process should run as a worker.
pub fn agent_mode_requested<F>(flag: bool, lookup: F) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    flag || lookup(env::AGENT_MODE).is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

/// Why the runtime stopped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExitReason {
    /// `hub.shutdown` with the coordinator's reason.
    Shutdown(String),
    /// Interrupt or terminate signal.
    Signal,
    /// The coordinator side of the channel went away.
    ChannelClosed,
}

/// Handle given to executors for streaming output and observing cancellation.
#[derive(Clone)]
pub struct TaskContext {
    agent_id: String,
    task_id: String,
    model: String,
    outbox: UnboundedSender<AgentMessage>,
    cancel: CancellationToken,
}

impl TaskContext {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Emit an `agent.streamChunk` for this task.
    pub fn chunk(&self, content: impl Into<String>) {
        let _ = self.outbox.send(AgentMessage::StreamChunk(StreamChunkParams {
            agent_id: self.agent_id.clone(),
            task_id: self.task_id.clone(),
            model: self.model.clone(),
            content: content.into(),
        }));
    }

    /// Cancelled when the worker is shutting down.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    fn update(&self, status: TaskUpdateStatus, error: Option<String>) {
        let _ = self.outbox.send(AgentMessage::TaskUpdate(TaskUpdateParams {
            agent_id: self.agent_id.clone(),
            task_id: self.task_id.clone(),
            status,
            error,
        }));
    }
}

struct RunningTask {
    task_id: String,
    cancel: CancellationToken,
    /// Cleared by the task itself just before its terminal update is queued.
    busy: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl RunningTask {
    fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    async fn cancel_and_wait(self) {
        if self.handle.is_finished() {
            return;
        }
        tracing::info!(task_id = %self.task_id, "Cancelling running task");
        self.cancel.cancel();
        if tokio::time::timeout(CANCEL_GRACE, self.handle).await.is_err() {
            tracing::warn!(task_id = %self.task_id, "Task did not finish after cancellation");
        }
    }
}

/// The worker side of one agent.
pub struct WorkerRuntime {
    identity: WorkerIdentity,
    executor: Arc<dyn TaskExecutor>,
}

impl WorkerRuntime {
    pub fn new(identity: WorkerIdentity, executor: Arc<dyn TaskExecutor>) -> Self {
        Self { identity, executor }
    }

    pub fn identity(&self) -> &WorkerIdentity {
        &self.identity
    }

    /// Register, then serve the channel until shutdown, signal, or EOF.
    ///
    /// `reader`/`writer` carry the channel; `shutdown_signal` resolves on an
    /// OS termination signal (pass `std::future::pending()` to disable).
    pub async fn run<R, W, S>(self, reader: R, writer: W, shutdown_signal: S) -> anyhow::Result<ExitReason>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send + 'static,
        S: Future<Output = ()> + Send,
    {
        let agent = self.identity.agent_name.clone();
        let (outbox, writer_task) = spawn_writer(writer, agent.clone());

        let _ = outbox.send(AgentMessage::Register(RegisterParams {
            agent_id: self.identity.agent_id.clone(),
            agent_name: self.identity.agent_name.clone(),
            team_name: self.identity.team_name.clone(),
            model: self.identity.model.clone(),
            role: self.identity.role.clone(),
        }));
        tracing::info!(agent = %agent, team = %self.identity.team_name, "Worker registered");

        let mut frames = FrameReader::new(reader);
        let mut current: Option<RunningTask> = None;
        // Tasks are cancelled if this future is dropped before finishing.
        let tasks_root = CancellationToken::new();
        let _cancel_tasks = tasks_root.clone().drop_guard();
        tokio::pin!(shutdown_signal);

        let reason = loop {
            tokio::select! {
                frame = frames.next_frame() => {
                    let line = match frame {
                        Ok(Some(line)) => line,
                        Ok(None) => break ExitReason::ChannelClosed,
                        Err(e) => {
                            tracing::warn!(agent = %agent, error = %e, "Channel read failed");
                            break ExitReason::ChannelClosed;
                        }
                    };
                    match decode_hub(&line) {
                        Some(HubMessage::TaskAssign(task)) => {
                            if let Some(running) = current.as_ref().filter(|t| t.is_busy()) {
                                tracing::warn!(
                                    agent = %agent,
                                    busy_with = %running.task_id,
                                    task_id = %task.task_id,
                                    "Rejecting task while busy"
                                );
                                self.context(&task.task_id, &outbox, CancellationToken::new())
                                    .update(TaskUpdateStatus::Failed, Some(format!("agent busy with task {}", running.task_id)));
                                continue;
                            }
                            current = Some(self.start_task(task, &outbox, tasks_root.child_token()));
                        }
                        Some(HubMessage::Shutdown(params)) => {
                            tracing::info!(agent = %agent, reason = %params.reason, "Shutdown requested");
                            break ExitReason::Shutdown(params.reason);
                        }
                        None => {}
                    }
                }
                _ = &mut shutdown_signal => {
                    tracing::info!(agent = %agent, "Termination signal received");
                    break ExitReason::Signal;
                }
            }
        };

        if let Some(task) = current.take() {
            task.cancel_and_wait().await;
        }

        // Closing the outbox lets the writer flush everything queued and stop.
        drop(outbox);
        if let Err(e) = writer_task.await {
            tracing::warn!(agent = %agent, error = %e, "Writer task failed");
        }

        Ok(reason)
    }

    fn context(
        &self,
        task_id: &str,
        outbox: &UnboundedSender<AgentMessage>,
        cancel: CancellationToken,
    ) -> TaskContext {
        TaskContext {
            agent_id: self.identity.agent_id.clone(),
            task_id: task_id.to_string(),
            model: self.identity.model.clone(),
            outbox: outbox.clone(),
            cancel,
        }
    }

    fn start_task(
        &self,
        task: TaskAssignParams,
        outbox: &UnboundedSender<AgentMessage>,
        cancel: CancellationToken,
    ) -> RunningTask {
        let ctx = self.context(&task.task_id, outbox, cancel.clone());
        let executor = self.executor.clone();
        let task_id = task.task_id.clone();

        tracing::info!(agent = %self.identity.agent_name, task_id = %task_id, subject = %task.subject, "Task assigned");

        let busy = Arc::new(AtomicBool::new(true));
        let task_busy = busy.clone();
        let handle = tokio::spawn(async move {
            ctx.update(TaskUpdateStatus::InProgress, None);
            let result = tokio::select! {
                result = executor.execute(&task, &ctx) => result,
                _ = ctx.cancellation().cancelled() => Err(anyhow::anyhow!("cancelled by shutdown")),
            };
            // The coordinator may reassign as soon as it sees the terminal update.
            task_busy.store(false, Ordering::SeqCst);
            match result {
                Ok(()) => {
                    tracing::info!(task_id = %task.task_id, "Task completed");
                    ctx.update(TaskUpdateStatus::Completed, None);
                }
                Err(e) => {
                    tracing::warn!(task_id = %task.task_id, error = %e, "Task failed");
                    ctx.update(TaskUpdateStatus::Failed, Some(format!("{e:#}")));
                }
            }
        });

        RunningTask {
            task_id,
            cancel,
            busy,
            handle,
        }
    }
}

/// Decode one inbound line, logging and dropping anything that is not a hub message.
fn decode_hub(line: &str) -> Option<HubMessage> {
    let envelope = match Envelope::parse_line(line) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!(error = %e, "Dropping malformed message from coordinator");
            return None;
        }
    };
    match HubMessage::from_envelope(&envelope) {
        Ok(Some(message)) => Some(message),
        Ok(None) => {
            tracing::debug!(method = %envelope.method, "Ignoring unknown method");
            None
        }
        Err(e) => {
            tracing::warn!(error = %e, "Dropping malformed message from coordinator");
            None
        }
    }
}

/// Serialize outbound messages onto the channel in order.
fn spawn_writer<W>(mut writer: W, agent: String) -> (UnboundedSender<AgentMessage>, JoinHandle<()>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = unbounded_channel::<AgentMessage>();
    let handle = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let line = match message.to_envelope().and_then(|env| encode_line(&env)) {
                Ok(line) => line,
                Err(e) => {
                    tracing::error!(agent = %agent, error = %e, "Failed to encode message");
                    continue;
                }
            };
            if let Err(e) = write_line(&mut writer, &line).await {
                tracing::warn!(agent = %agent, error = %e, "Channel write failed");
                break;
            }
        }
    });
    (tx, handle)
}

/// Run the worker over this process's stdin/stdout until it should exit.
pub async fn run_stdio(identity: WorkerIdentity, executor: Arc<dyn TaskExecutor>) -> anyhow::Result<ExitReason> {
    WorkerRuntime::new(identity, executor)
        .run(tokio::io::stdin(), tokio::io::stdout(), termination_signal())
        .await
}

/// Resolves on SIGINT or SIGTERM.
async fn termination_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}
