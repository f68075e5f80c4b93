//! Runs the real `agent-crew` binary as the worker process.

mod support;

use std::path::PathBuf;
use std::sync::Arc;

use agent_crew::orchestration::dispatcher::{OutcomeStatus, TaskRequest, dispatch_tasks};
use agent_crew::orchestration::events::{EventHub, TeamEvent};
use agent_crew::orchestration::spawner::{ProcessSpawner, env};
use agent_crew::orchestration::status::AgentStatus;
use agent_crew::orchestration::team_manager::TeamManager;
use support::{team, test_config};

fn binary_manager(data_dir: &std::path::Path, task_command: &str, events: EventHub) -> TeamManager {
    let mut config = test_config(data_dir, 10_000, 5_000);
    config.worker_program = Some(PathBuf::from(env!("CARGO_BIN_EXE_agent-crew")));
    let spawner = ProcessSpawner::new().with_env(env::TASK_COMMAND, task_command);
    TeamManager::new(config, Arc::new(spawner), events)
}

// ============================================================
// Full lifecycle over stdio
// ============================================================

#[tokio::test]
async fn test_binary_worker_runs_task_and_exits_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let events = EventHub::new();
    let (_sub, mut rx) = events.channel();
    let mgr = binary_manager(
        dir.path(),
        "echo \"done: $AGENT_CREW_TASK_SUBJECT\"",
        events,
    );

    mgr.create_team("alpha", team(&["A"])).await.unwrap();
    mgr.start_agents("alpha").await.unwrap();
    let agent = mgr.get_agent("alpha", "A").unwrap();
    assert!(agent.is_alive());
    assert!(agent.pid().is_some());

    let outcomes = dispatch_tasks(&mgr, "alpha", vec![TaskRequest::new("build", "make it")])
        .await
        .unwrap();
    assert_eq!(outcomes[0].status, OutcomeStatus::Completed, "{:?}", outcomes[0]);
    assert_eq!(outcomes[0].output, vec!["done: build".to_string()]);

    mgr.delete_team("alpha").await.unwrap();
    assert!(!agent.is_alive());
    assert_eq!(agent.status(), AgentStatus::Shutdown);
    assert!(!dir.path().join("teams/alpha").exists());
    assert!(!dir.path().join("tasks/alpha").exists());

    let mut exit_detail = None;
    while let Ok(event) = rx.try_recv() {
        if let TeamEvent::AgentStatusChanged { to: AgentStatus::Shutdown, detail, .. } = event {
            exit_detail = detail;
        }
    }
    assert_eq!(exit_detail.as_deref(), Some("exited with code 0"));
}

#[tokio::test]
async fn test_binary_worker_reports_command_failure() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = binary_manager(dir.path(), "echo nope >&2; exit 5", EventHub::new());

    mgr.create_team("alpha", team(&["A"])).await.unwrap();
    mgr.start_agents("alpha").await.unwrap();

    let outcomes = dispatch_tasks(&mgr, "alpha", vec![TaskRequest::new("t", "d")])
        .await
        .unwrap();
    assert_eq!(outcomes[0].status, OutcomeStatus::Failed);
    let error = outcomes[0].error.as_deref().unwrap();
    assert!(error.contains("exited with code 5"), "{error}");
    assert!(error.contains("nope"), "{error}");
    // The worker survives a failed task.
    assert_eq!(mgr.get_agent_state("alpha", "A").unwrap().status, AgentStatus::Idle);

    mgr.shutdown_all().await;
}
