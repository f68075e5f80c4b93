use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::worker::IdentityFlags;

#[derive(Parser, Debug)]
#[command(name = "agent-crew", version, about = "Spawn and coordinate teams of worker agents")]
pub struct Cli {
    /// Path to config file (overrides ./agent-crew.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory holding team records, task stores and logs
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(flatten)]
    pub worker: WorkerArgs,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Flags of the worker spawn contract. Only meaningful with `--agent`.
#[derive(Args, Debug, Default, Clone)]
pub struct WorkerArgs {
    /// Run as a team worker (normally set by the coordinator)
    #[arg(long)]
    pub agent: bool,

    /// Team this worker belongs to
    #[arg(long)]
    pub team: Option<String>,

    /// Agent name within the team
    #[arg(long)]
    pub name: Option<String>,

    /// Model the agent is bound to
    #[arg(long)]
    pub model: Option<String>,

    /// Agent role
    #[arg(long)]
    pub role: Option<String>,

    /// Agent id (normally passed through the environment)
    #[arg(long)]
    pub agent_id: Option<String>,
}

impl WorkerArgs {
    pub fn identity_flags(&self) -> IdentityFlags {
        IdentityFlags {
            team: self.team.clone(),
            name: self.name.clone(),
            model: self.model.clone(),
            role: self.role.clone(),
            agent_id: self.agent_id.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a team and persist its record
    Create(TeamArgs),
    /// List persisted teams
    List,
    /// Show one team's record
    Show {
        /// Team name
        team: String,
    },
    /// Delete a team's record and task store (idempotent)
    Delete {
        /// Team name
        team: String,
    },
    /// Create a team, run tasks on it, print outcomes, then delete it
    Run {
        #[command(flatten)]
        team: TeamArgs,

        /// Task as "subject::description" (repeatable)
        #[arg(short, long = "task", required = true)]
        tasks: Vec<String>,

        /// Shell command each worker runs per task (default: echo the task)
        #[arg(long)]
        task_command: Option<String>,

        /// Run workers as tokio tasks instead of child processes
        #[arg(long)]
        in_process: bool,
    },
}

#[derive(Args, Debug, Clone)]
pub struct TeamArgs {
    /// Team name (letters, digits, '_' and '-')
    pub team: String,

    /// Member as "name:model:role[:provider]" (repeatable)
    #[arg(short, long = "member", required = true)]
    pub members: Vec<String>,

    /// Free-form team description
    #[arg(short, long)]
    pub description: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_worker_mode_contract() {
        let cli = Cli::parse_from([
            "agent-crew", "--agent", "--team", "alpha", "--name", "A", "--model", "m", "--role", "coder",
        ]);
        assert!(cli.worker.agent);
        assert!(cli.command.is_none());
        let flags = cli.worker.identity_flags();
        assert_eq!(flags.team.as_deref(), Some("alpha"));
        assert_eq!(flags.role.as_deref(), Some("coder"));
    }

    #[test]
    fn parses_run_with_tasks() {
        let cli = Cli::parse_from([
            "agent-crew",
            "--data-dir",
            "/tmp/crew",
            "run",
            "alpha",
            "-m",
            "A:m:coder",
            "-m",
            "B:m:reviewer",
            "--task",
            "Fix::fix the build",
            "--in-process",
        ]);
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/crew")));
        match cli.command {
            Some(Commands::Run {
                team,
                tasks,
                in_process,
                ..
            }) => {
                assert_eq!(team.team, "alpha");
                assert_eq!(team.members.len(), 2);
                assert_eq!(tasks, vec!["Fix::fix the build"]);
                assert!(in_process);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
