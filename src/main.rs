use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use agent_crew::cli::{Cli, Commands, TeamArgs};
use agent_crew::config::{self, AppConfig};
use agent_crew::logging::{self, EventLog};
use agent_crew::orchestration::dispatcher::{self, OutcomeStatus, TaskRequest};
use agent_crew::orchestration::events::EventHub;
use agent_crew::orchestration::spawner::{InProcessSpawner, ProcessSpawner, WorkerSpawner, env};
use agent_crew::orchestration::team_manager::TeamManager;
use agent_crew::orchestration::types::{AgentSpec, CreateTeamOptions, TeamConfig};
use agent_crew::worker::executor::{CommandExecutor, EchoExecutor, TaskExecutor};
use agent_crew::worker::{self, ExitReason, WorkerIdentity};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; in agent mode stdout is the IPC channel.
    logging::init_tracing();

    let cli = Cli::parse();
    let config = config::load_config(&cli);

    if worker::agent_mode_requested(cli.worker.agent, |k| std::env::var(k).ok()) {
        let code = match run_worker(&cli, &config).await {
            Ok(reason) => {
                tracing::info!(?reason, "Worker exiting");
                0
            }
            Err(e) => {
                tracing::error!("Worker failed: {e:#}");
                1
            }
        };
        // The runtime's stdin reader can block shutdown; exit explicitly.
        std::process::exit(code);
    }

    tracing::debug!(data_dir = %config.data_dir.display(), "Config loaded");

    let Some(command) = cli.command else {
        anyhow::bail!("no command given (try `agent-crew --help`)");
    };

    match command {
        Commands::Create(args) => {
            let manager = coordinator(&config, false, EventHub::new());
            let team = create_from_args(&manager, &config, &args).await?;
            print_team(&team);
        }
        Commands::List => {
            let manager = coordinator(&config, false, EventHub::new());
            let teams = manager.list_teams().await?;
            if teams.is_empty() {
                println!("No teams.");
            }
            for team in teams {
                println!(
                    "{}\t{}\t{} member(s)\tcreated {}",
                    team.team_name,
                    team.status,
                    team.members.len(),
                    team.created_at.to_rfc3339()
                );
            }
        }
        Commands::Show { team } => {
            let manager = coordinator(&config, false, EventHub::new());
            match manager.get_team(&team).await? {
                Some(team) => print_team(&team),
                None => anyhow::bail!("team `{team}` not found"),
            }
        }
        Commands::Delete { team } => {
            let manager = coordinator(&config, false, EventHub::new());
            manager.delete_team(&team).await?;
            println!("Deleted team `{team}`.");
        }
        Commands::Run {
            team,
            tasks,
            task_command: _,
            in_process,
        } => run_team(&config, &team, &tasks, in_process).await?,
    }

    Ok(())
}

async fn run_worker(cli: &Cli, config: &AppConfig) -> anyhow::Result<ExitReason> {
    let identity = WorkerIdentity::resolve(
        &cli.worker.identity_flags(),
        |k| std::env::var(k).ok(),
        &config.default_model,
    )?;
    tracing::info!(
        team = %identity.team_name,
        agent = %identity.agent_name,
        model = %identity.model,
        "Starting worker"
    );
    let mut config = config.clone();
    if let Ok(command) = std::env::var(env::TASK_COMMAND) {
        config.task_command = Some(command).filter(|c| !c.trim().is_empty());
    }
    worker::run_stdio(identity, executor_for(&config)).await
}

fn executor_for(config: &AppConfig) -> Arc<dyn TaskExecutor> {
    match &config.task_command {
        Some(command) => Arc::new(CommandExecutor::new(command.clone())),
        None => Arc::new(EchoExecutor),
    }
}

fn coordinator(config: &AppConfig, in_process: bool, events: EventHub) -> TeamManager {
    let spawner: Arc<dyn WorkerSpawner> = if in_process {
        Arc::new(InProcessSpawner::new(executor_for(config)))
    } else {
        match &config.task_command {
            Some(command) => Arc::new(ProcessSpawner::new().with_env(env::TASK_COMMAND, command)),
            None => Arc::new(ProcessSpawner::new()),
        }
    };
    TeamManager::new(config.clone(), spawner, events)
}

async fn create_from_args(
    manager: &TeamManager,
    config: &AppConfig,
    args: &TeamArgs,
) -> anyhow::Result<TeamConfig> {
    let agents = args
        .members
        .iter()
        .map(|m| AgentSpec::parse(m, &config.default_provider))
        .collect::<Result<Vec<_>, _>>()
        .map_err(anyhow::Error::msg)?;
    let options = CreateTeamOptions {
        description: args.description.clone(),
        agents,
    };
    manager
        .create_team(&args.team, options)
        .await
        .with_context(|| format!("Failed to create team `{}`", args.team))
}

async fn run_team(
    config: &AppConfig,
    args: &TeamArgs,
    tasks: &[String],
    in_process: bool,
) -> anyhow::Result<()> {
    let requests = tasks
        .iter()
        .map(|t| TaskRequest::parse(t))
        .collect::<Result<Vec<_>, _>>()
        .map_err(anyhow::Error::msg)?;

    let events = EventHub::new();
    let event_log = Arc::new(EventLog::create(&config.logs_dir()).context("Failed to open event log")?);
    let _log_subscription = event_log.attach(&events);
    tracing::info!(path = %event_log.log_path().display(), "Recording lifecycle events");

    let manager = coordinator(config, in_process, events);
    create_from_args(&manager, config, args).await?;

    let interrupt = manager.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted; shutting down all teams");
            interrupt.shutdown_all().await;
        }
    });

    manager.start_agents(&args.team).await?;
    for state in manager.get_agent_states(&args.team) {
        println!("agent {:<12} {}", state.config.name, state.status);
    }

    let outcomes = dispatcher::dispatch_tasks(&manager, &args.team, requests).await;
    manager.shutdown_all().await;
    ctrl_c.abort();

    let outcomes = outcomes?;
    let mut failures = 0;
    for outcome in &outcomes {
        println!(
            "[{}] {} ({})",
            outcome.status,
            outcome.subject,
            outcome.agent.as_deref().unwrap_or("-")
        );
        for line in &outcome.output {
            println!("    {line}");
        }
        if let Some(error) = &outcome.error {
            println!("    error: {error}");
        }
        if outcome.status != OutcomeStatus::Completed {
            failures += 1;
        }
    }

    if failures > 0 {
        anyhow::bail!("{failures} of {} task(s) did not complete", outcomes.len());
    }
    Ok(())
}

fn print_team(team: &TeamConfig) {
    println!("Team: {} ({})", team.team_name, team.status);
    if let Some(description) = &team.description {
        println!("  {description}");
    }
    println!("  created {}", team.created_at.to_rfc3339());
    for member in &team.members {
        println!(
            "  - {} [{}] model={} provider={} id={}",
            member.name, member.role, member.model, member.provider, member.agent_id
        );
    }
}
