//! Worker handles and the backends that create them.
//!
//! An [`super::agent_process::AgentProcess`] never touches an OS process
//! directly. It asks a [`WorkerSpawner`] for a [`SpawnedWorker`]: a
//! [`WorkerHandle`] for outbound traffic and forced termination, plus an
//! ordered stream of [`WorkerEvent`]s. `Exited` is always the last event.
//!
//! Two backends ship with the crate:
//! - [`ProcessSpawner`] spawns the worker binary as a tokio child in its own
//!   process group, with stdin/stdout carrying the channel and stderr
//!   forwarded to the coordinator's log.
//! - [`InProcessSpawner`] runs the worker runtime on a tokio task wired through
//!   in-memory pipes.

use std::future;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::protocol::Envelope;
use super::transport::{FrameReader, encode_line, next_lossy_line, write_line};
use super::types::AgentConfig;
use crate::worker::executor::TaskExecutor;
use crate::worker::{WorkerIdentity, WorkerRuntime};

/// Environment variables of the spawn contract.
pub mod env {
    /// Set to `1` to run the binary in agent mode.
    pub const AGENT_MODE: &str = "AGENT_CREW_AGENT";
    pub const TEAM: &str = "AGENT_CREW_TEAM";
    pub const AGENT_ID: &str = "AGENT_CREW_AGENT_ID";
    pub const AGENT_NAME: &str = "AGENT_CREW_AGENT_NAME";
    pub const MODEL: &str = "AGENT_CREW_MODEL";
    pub const ROLE: &str = "AGENT_CREW_ROLE";
    /// Reserved for an out-of-band socket; passed through but never bound.
    pub const SOCKET_PATH: &str = "AGENT_CREW_SOCKET_PATH";
    /// Overrides the worker's configured task command.
    pub const TASK_COMMAND: &str = "AGENT_CREW_TASK_COMMAND";
}

/// How long the monitor waits for buffered stdout after the worker exits.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Everything needed to launch one worker.
#[derive(Clone, Debug)]
pub struct SpawnSpec {
    pub team_name: String,
    pub agent: AgentConfig,
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Layered over the coordinator's own environment.
    pub env: Vec<(String, String)>,
    pub socket_path: PathBuf,
}

impl SpawnSpec {
    /// Build the argument list and environment of the spawn contract.
    pub fn for_agent(
        team_name: &str,
        agent: &AgentConfig,
        program: PathBuf,
        socket_path: PathBuf,
    ) -> Self {
        let args = vec![
            "--agent".to_string(),
            "--team".to_string(),
            team_name.to_string(),
            "--name".to_string(),
            agent.name.clone(),
            "--model".to_string(),
            agent.model.clone(),
            "--role".to_string(),
            agent.role.clone(),
        ];
        let env = vec![
            (env::AGENT_MODE.to_string(), "1".to_string()),
            (env::TEAM.to_string(), team_name.to_string()),
            (env::AGENT_ID.to_string(), agent.agent_id.clone()),
            (env::AGENT_NAME.to_string(), agent.name.clone()),
            (
                env::SOCKET_PATH.to_string(),
                socket_path.to_string_lossy().into_owned(),
            ),
        ];
        Self {
            team_name: team_name.to_string(),
            agent: agent.clone(),
            program,
            args,
            env,
            socket_path,
        }
    }
}

/// Inbound traffic and lifecycle signals from one worker, in arrival order.
#[derive(Clone, Debug, PartialEq)]
pub enum WorkerEvent {
    /// A JSON value read from the channel (not yet validated as an envelope).
    Message(Value),
    /// The channel failed; the process may still be running.
    Error(String),
    /// The worker exited. Always the final event.
    Exited(Option<i32>),
}

/// Coordinator-side handle to a running worker.
pub trait WorkerHandle: Send + Sync {
    fn pid(&self) -> Option<u32>;
    /// Whether outbound messages can still be delivered.
    fn is_connected(&self) -> bool;
    fn send(&self, envelope: &Envelope) -> io::Result<()>;
    /// Forced termination. A no-op once the worker has exited.
    fn kill(&self);
}

/// A freshly spawned worker: its handle and its inbound event stream.
pub struct SpawnedWorker {
    pub handle: Arc<dyn WorkerHandle>,
    pub events: UnboundedReceiver<WorkerEvent>,
}

/// Creates workers. Implementations must be cheap to call repeatedly (restarts).
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, spec: &SpawnSpec) -> io::Result<SpawnedWorker>;
}

/// [`WorkerHandle`] over a line channel plus a kill token observed by a monitor task.
pub struct ChannelHandle {
    pid: Option<u32>,
    outbound: UnboundedSender<String>,
    connected: Arc<AtomicBool>,
    kill: CancellationToken,
}

impl WorkerHandle for ChannelHandle {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.outbound.is_closed()
    }

    fn send(&self, envelope: &Envelope) -> io::Result<()> {
        let line = encode_line(envelope).map_err(io::Error::other)?;
        self.outbound
            .send(line)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "worker channel closed"))
    }

    fn kill(&self) {
        self.kill.cancel();
    }
}

/// Wire a duplex byte stream into the event stream.
///
/// Spawns a writer task draining the returned sender into `writer`, and a
/// reader task turning each frame of `reader` into a [`WorkerEvent::Message`].
/// Non-JSON frames are logged and dropped. I/O failures on either side are
/// reported as [`WorkerEvent::Error`] and mark the channel disconnected.
fn attach_channel<R, W>(
    agent: &str,
    reader: R,
    mut writer: W,
    events: UnboundedSender<WorkerEvent>,
    connected: Arc<AtomicBool>,
) -> (UnboundedSender<String>, JoinHandle<()>)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (outbound_tx, mut outbound_rx) = unbounded_channel::<String>();

    let writer_events = events.clone();
    let writer_connected = connected.clone();
    let writer_agent = agent.to_string();
    tokio::spawn(async move {
        while let Some(line) = outbound_rx.recv().await {
            if let Err(e) = write_line(&mut writer, &line).await {
                tracing::warn!(agent = %writer_agent, error = %e, "Write to worker failed");
                writer_connected.store(false, Ordering::SeqCst);
                let _ = writer_events.send(WorkerEvent::Error(format!("write failed: {e}")));
                break;
            }
        }
    });

    let reader_agent = agent.to_string();
    let reader_task = tokio::spawn(async move {
        let mut frames = FrameReader::new(reader);
        loop {
            match frames.next_frame().await {
                Ok(Some(frame)) => match serde_json::from_str::<Value>(&frame) {
                    Ok(value) => {
                        let _ = events.send(WorkerEvent::Message(value));
                    }
                    Err(_) => {
                        tracing::warn!(agent = %reader_agent, line = %frame, "Dropping non-JSON line from worker");
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    connected.store(false, Ordering::SeqCst);
                    let _ = events.send(WorkerEvent::Error(format!("read failed: {e}")));
                    break;
                }
            }
        }
    });

    (outbound_tx, reader_task)
}

/// SIGKILL an entire process group.
pub(crate) fn kill_process_group(pid: u32) {
    let pgid = nix::unistd::Pid::from_raw(pid as i32);
    if let Err(e) = nix::sys::signal::killpg(pgid, nix::sys::signal::Signal::SIGKILL) {
        tracing::debug!(pid, error = %e, "killpg failed (process likely gone)");
    }
}

/// Spawns each worker as an OS process running `spec.program`.
#[derive(Clone, Debug, Default)]
pub struct ProcessSpawner {
    extra_env: Vec<(String, String)>,
}

impl ProcessSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a variable to every worker's environment.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_env.push((key.into(), value.into()));
        self
    }
}

impl WorkerSpawner for ProcessSpawner {
    fn spawn(&self, spec: &SpawnSpec) -> io::Result<SpawnedWorker> {
        let agent = spec.agent.name.clone();

        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .envs(self.extra_env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .process_group(0)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let pid = child.id();
        let missing = |what: &str| io::Error::other(format!("failed to capture worker {what}"));
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        let (events_tx, events_rx) = unbounded_channel();
        let connected = Arc::new(AtomicBool::new(true));
        let (outbound, reader_task) =
            attach_channel(&agent, stdout, stdin, events_tx.clone(), connected.clone());

        // Worker diagnostics go to our log, never into the channel.
        let stderr_agent = agent.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut buf = Vec::new();
            while let Some(line) = next_lossy_line(&mut reader, &mut buf).await {
                tracing::debug!(agent = %stderr_agent, "[worker] {line}");
            }
        });

        let kill = CancellationToken::new();
        let monitor_kill = kill.clone();
        let monitor_connected = connected.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = monitor_kill.cancelled() => {
                    if let Some(pid) = pid {
                        kill_process_group(pid);
                    }
                    // Reap the child to prevent zombies.
                    child.wait().await
                }
            };
            monitor_connected.store(false, Ordering::SeqCst);

            // Deliver everything the worker wrote before announcing the exit.
            if tokio::time::timeout(READER_DRAIN_TIMEOUT, reader_task).await.is_err() {
                tracing::debug!(agent = %agent, "Worker stdout still open after exit");
            }

            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    tracing::warn!(agent = %agent, error = %e, "Waiting on worker failed");
                    None
                }
            };
            tracing::debug!(agent = %agent, ?code, "Worker process exited");
            let _ = events_tx.send(WorkerEvent::Exited(code));
        });

        Ok(SpawnedWorker {
            handle: Arc::new(ChannelHandle {
                pid,
                outbound,
                connected,
                kill,
            }),
            events: events_rx,
        })
    }
}

/// Runs each worker on a tokio task inside the coordinator.
///
/// The worker speaks the same line protocol over in-memory pipes, so the
/// coordinator cannot tell the difference. Killing the handle drops the
/// worker future mid-flight, like a forced termination.
#[derive(Clone)]
pub struct InProcessSpawner {
    executor: Arc<dyn TaskExecutor>,
}

/// Capacity of each in-memory pipe direction.
const PIPE_CAPACITY: usize = 64 * 1024;

impl InProcessSpawner {
    pub fn new(executor: Arc<dyn TaskExecutor>) -> Self {
        Self { executor }
    }
}

impl WorkerSpawner for InProcessSpawner {
    fn spawn(&self, spec: &SpawnSpec) -> io::Result<SpawnedWorker> {
        let agent = spec.agent.name.clone();
        let (coordinator_side, worker_side) = tokio::io::duplex(PIPE_CAPACITY);
        let (coord_read, coord_write) = tokio::io::split(coordinator_side);
        let (worker_read, worker_write) = tokio::io::split(worker_side);

        let (events_tx, events_rx) = unbounded_channel();
        let connected = Arc::new(AtomicBool::new(true));
        let (outbound, reader_task) =
            attach_channel(&agent, coord_read, coord_write, events_tx.clone(), connected.clone());

        let mut identity = WorkerIdentity::from_agent(&spec.team_name, &spec.agent);
        identity.socket_path = Some(spec.socket_path.clone());
        let runtime = WorkerRuntime::new(identity, self.executor.clone());

        let kill = CancellationToken::new();
        let monitor_kill = kill.clone();
        let monitor_connected = connected.clone();
        tokio::spawn(async move {
            let code = tokio::select! {
                outcome = runtime.run(worker_read, worker_write, future::pending::<()>()) => {
                    match outcome {
                        Ok(reason) => {
                            tracing::debug!(agent = %agent, ?reason, "In-process worker finished");
                            Some(0)
                        }
                        Err(e) => {
                            tracing::warn!(agent = %agent, error = %e, "In-process worker failed");
                            Some(1)
                        }
                    }
                }
                _ = monitor_kill.cancelled() => None,
            };
            monitor_connected.store(false, Ordering::SeqCst);
            let _ = tokio::time::timeout(READER_DRAIN_TIMEOUT, reader_task).await;
            let _ = events_tx.send(WorkerEvent::Exited(code));
        });

        Ok(SpawnedWorker {
            handle: Arc::new(ChannelHandle {
                pid: None,
                outbound,
                connected,
                kill,
            }),
            events: events_rx,
        })
    }
}
