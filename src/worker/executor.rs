//! Task executors: what a worker actually does with an assigned task.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, BufReader};
use tokio::process::Command;

use super::TaskContext;
use crate::orchestration::protocol::TaskAssignParams;
use crate::orchestration::spawner::kill_process_group;
use crate::orchestration::transport::next_lossy_line;

/// Environment handed to task commands.
pub mod task_env {
    pub const TASK_ID: &str = "AGENT_CREW_TASK_ID";
    pub const SUBJECT: &str = "AGENT_CREW_TASK_SUBJECT";
    pub const DESCRIPTION: &str = "AGENT_CREW_TASK_DESCRIPTION";
}

/// Maximum stderr kept for a failed command's error message.
const STDERR_TAIL: usize = 2000;

/// Runs one task to completion.
///
/// Output goes through [`TaskContext::chunk`]; `Ok` reports `completed`,
/// `Err` reports `failed` with the error text. Implementations should return
/// promptly once [`TaskContext::cancellation`] fires.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: &TaskAssignParams, ctx: &TaskContext) -> anyhow::Result<()>;
}

/// Streams the task back as a single chunk.
#[derive(Clone, Copy, Debug, Default)]
pub struct EchoExecutor;

#[async_trait]
impl TaskExecutor for EchoExecutor {
    async fn execute(&self, task: &TaskAssignParams, ctx: &TaskContext) -> anyhow::Result<()> {
        ctx.chunk(format!("[{}] {}: {}", ctx.model(), task.subject, task.description));
        Ok(())
    }
}

/// Runs a shell command per task, streaming each stdout line as a chunk.
#[derive(Clone, Debug)]
pub struct CommandExecutor {
    command: String,
}

impl CommandExecutor {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl TaskExecutor for CommandExecutor {
    async fn execute(&self, task: &TaskAssignParams, ctx: &TaskContext) -> anyhow::Result<()> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env(task_env::TASK_ID, &task.task_id)
            .env(task_env::SUBJECT, &task.subject)
            .env(task_env::DESCRIPTION, &task.description)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()?;

        let pid = child.id();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("task command has no stdout"))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow::anyhow!("task command has no stderr"))?;

        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf).await;
            String::from_utf8_lossy(&buf).into_owned()
        });

        let mut stdout = BufReader::new(stdout);
        let mut buf = Vec::new();
        loop {
            tokio::select! {
                line = next_lossy_line(&mut stdout, &mut buf) => match line {
                    Some(line) => ctx.chunk(line),
                    None => break,
                },
                _ = ctx.cancellation().cancelled() => {
                    if let Some(pid) = pid {
                        kill_process_group(pid);
                    }
                    anyhow::bail!("cancelled by shutdown");
                }
            }
        }

        let status = child.wait().await?;
        let stderr = stderr_task.await.unwrap_or_default();
        if status.success() {
            return Ok(());
        }

        let stderr = stderr.trim();
        let tail = if stderr.len() > STDERR_TAIL {
            let mut start = stderr.len() - STDERR_TAIL;
            while !stderr.is_char_boundary(start) {
                start += 1;
            }
            &stderr[start..]
        } else {
            stderr
        };
        match status.code() {
            Some(code) if tail.is_empty() => anyhow::bail!("task command exited with code {code}"),
            Some(code) => anyhow::bail!("task command exited with code {code}: {tail}"),
            None => anyhow::bail!("task command terminated by signal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::protocol::AgentMessage;
    use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};
    use tokio_util::sync::CancellationToken;

    fn task(description: &str) -> TaskAssignParams {
        TaskAssignParams {
            task_id: "t1".into(),
            subject: "Build".into(),
            description: description.into(),
        }
    }

    fn context() -> (TaskContext, UnboundedReceiver<AgentMessage>) {
        let (outbox, rx) = unbounded_channel();
        let ctx = TaskContext {
            agent_id: "id-a".into(),
            task_id: "t1".into(),
            model: "m".into(),
            outbox,
            cancel: CancellationToken::new(),
        };
        (ctx, rx)
    }

    fn chunks(rx: &mut UnboundedReceiver<AgentMessage>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            if let AgentMessage::StreamChunk(chunk) = message {
                out.push(chunk.content);
            }
        }
        out
    }

    #[tokio::test]
    async fn echo_emits_one_chunk() {
        let (ctx, mut rx) = context();
        EchoExecutor.execute(&task("hi"), &ctx).await.unwrap();
        assert_eq!(chunks(&mut rx), vec!["[m] Build: hi"]);
    }

    #[tokio::test]
    async fn command_streams_stdout_lines_with_task_env() {
        let (ctx, mut rx) = context();
        let exec = CommandExecutor::new("echo \"$AGENT_CREW_TASK_ID\"; echo \"$AGENT_CREW_TASK_DESCRIPTION\"");
        exec.execute(&task("compile it"), &ctx).await.unwrap();
        assert_eq!(chunks(&mut rx), vec!["t1", "compile it"]);
    }

    #[tokio::test]
    async fn command_failure_carries_exit_code_and_stderr() {
        let (ctx, _rx) = context();
        let err = CommandExecutor::new("echo broken >&2; exit 4")
            .execute(&task(""), &ctx)
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("code 4"), "{message}");
        assert!(message.contains("broken"), "{message}");
    }

    #[tokio::test]
    async fn command_output_with_bad_bytes_is_kept_lossily() {
        let (ctx, mut rx) = context();
        let err = CommandExecutor::new(r"printf 'a\377b\nok\n'; printf '\377oops' >&2; exit 1")
            .execute(&task(""), &ctx)
            .await
            .unwrap_err();
        assert_eq!(chunks(&mut rx), vec!["a\u{FFFD}b", "ok"]);
        assert!(err.to_string().contains("oops"), "{err}");
    }

    #[tokio::test]
    async fn command_stops_on_cancellation() {
        let (ctx, mut rx) = context();
        let cancel = ctx.cancellation().clone();
        let exec = CommandExecutor::new("echo started; sleep 30");

        let run = tokio::spawn(async move { exec.execute(&task(""), &ctx).await });
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        cancel.cancel();

        let err = tokio::time::timeout(std::time::Duration::from_secs(5), run)
            .await
            .expect("executor did not stop")
            .unwrap()
            .unwrap_err();
        assert!(err.to_string().contains("cancelled"));
        assert_eq!(chunks(&mut rx), vec!["started"]);
    }
}
