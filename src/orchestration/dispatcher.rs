//! Runs a batch of tasks across a started team.
//!
//! Tasks are recorded in the team's task store, handed to idle agents as they
//! free up, and tracked until each one gets its terminal update. Agents that
//! shut down or error are skipped; tasks still pending once no live agent
//! remains are reported as not run.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc::unbounded_channel;

use super::collaborators::{TaskRecord, TaskState, TaskStore};
use super::protocol::{AgentMessage, TaskUpdateStatus};
use super::status::AgentStatus;
use super::team_manager::TeamManager;
use crate::error::TeamError;

/// How often in-flight agents are checked for having died silently.
const LIVENESS_INTERVAL: Duration = Duration::from_millis(250);

/// A task to run, before it has an id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskRequest {
    pub subject: String,
    pub description: String,
}

impl TaskRequest {
    pub fn new(subject: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            description: description.into(),
        }
    }

    /// Parse `subject::description`. Without a separator the whole text is
    /// used as both subject and description.
    pub fn parse(text: &str) -> Result<Self, String> {
        let (subject, description) = match text.split_once("::") {
            Some((subject, description)) => (subject.trim(), description.trim()),
            None => (text.trim(), text.trim()),
        };
        if subject.is_empty() {
            return Err(format!("invalid task `{text}`: subject is empty"));
        }
        Ok(Self::new(subject, description))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Completed,
    Failed,
    NotRun,
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OutcomeStatus::Completed => "completed",
            OutcomeStatus::Failed => "failed",
            OutcomeStatus::NotRun => "not run",
        })
    }
}

/// Final result of one dispatched task.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOutcome {
    pub task_id: String,
    pub subject: String,
    pub agent: Option<String>,
    pub status: OutcomeStatus,
    /// Streamed chunks, in arrival order.
    pub output: Vec<String>,
    pub error: Option<String>,
}

struct InFlight {
    agent: String,
    record: TaskRecord,
    output: Vec<String>,
}

/// Run `tasks` on the agents of an active, started team.
///
/// Returns one outcome per task, in request order.
pub async fn dispatch_tasks(
    manager: &TeamManager,
    team: &str,
    tasks: Vec<TaskRequest>,
) -> Result<Vec<TaskOutcome>, TeamError> {
    let store = manager
        .get_task_store(team)
        .ok_or_else(|| TeamError::NotActive(team.to_string()))?;
    let agents = manager.agents(team);

    let mut order = Vec::with_capacity(tasks.len());
    let mut pending = VecDeque::with_capacity(tasks.len());
    for task in tasks {
        let record = store
            .create(&task.subject, &task.description)
            .map_err(|e| TeamError::io(store.dir(), e))?;
        order.push(record.id.clone());
        pending.push_back(record);
    }

    let (tx, mut rx) = unbounded_channel::<(String, AgentMessage)>();
    let subscriptions: Vec<_> = agents
        .iter()
        .map(|agent| {
            let tx = tx.clone();
            let name = agent.config().name.clone();
            agent.on_message(move |message| {
                let _ = tx.send((name.clone(), message.clone()));
            })
        })
        .collect();
    drop(tx);

    let mut in_flight: HashMap<String, InFlight> = HashMap::new();
    let mut outcomes: HashMap<String, TaskOutcome> = HashMap::new();
    let mut ticker = tokio::time::interval(LIVENESS_INTERVAL);

    loop {
        // Hand pending tasks to idle agents with nothing in flight.
        for agent in &agents {
            let name = &agent.config().name;
            if pending.is_empty() {
                break;
            }
            if in_flight.values().any(|f| &f.agent == name)
                || !agent.is_alive()
                || agent.status() != AgentStatus::Idle
            {
                continue;
            }
            let Some(record) = pending.pop_front() else {
                break;
            };
            match agent.assign_task(&record.id, &record.subject, &record.description) {
                Ok(_) => {
                    update_store(store.as_ref(), &record.id, TaskState::InProgress, Some(name));
                    in_flight.insert(
                        record.id.clone(),
                        InFlight {
                            agent: name.clone(),
                            record,
                            output: Vec::new(),
                        },
                    );
                }
                Err(e) => {
                    tracing::warn!(team, agent = %name, task_id = %record.id, error = %e, "Could not assign task");
                    pending.push_front(record);
                }
            }
        }

        if in_flight.is_empty() {
            if !pending.is_empty() {
                tracing::warn!(team, remaining = pending.len(), "No live agent left for pending tasks");
            }
            break;
        }

        tokio::select! {
            received = rx.recv() => {
                let Some((agent, message)) = received else { break };
                handle_message(store.as_ref(), &agent, message, &mut in_flight, &mut outcomes);
                while let Ok((agent, message)) = rx.try_recv() {
                    handle_message(store.as_ref(), &agent, message, &mut in_flight, &mut outcomes);
                }
            }
            _ = ticker.tick() => {
                // Anything the agent sent before dying is already queued.
                while let Ok((agent, message)) = rx.try_recv() {
                    handle_message(store.as_ref(), &agent, message, &mut in_flight, &mut outcomes);
                }
                reap_dead_agents(manager, team, store.as_ref(), &mut in_flight, &mut outcomes);
            }
        }
    }

    for subscription in subscriptions {
        subscription.unsubscribe();
    }

    for flight in in_flight.into_values() {
        outcomes.insert(
            flight.record.id.clone(),
            failed(flight, "dispatch ended before the task finished".to_string()),
        );
    }
    for record in pending {
        outcomes.insert(
            record.id.clone(),
            TaskOutcome {
                task_id: record.id,
                subject: record.subject,
                agent: None,
                status: OutcomeStatus::NotRun,
                output: Vec::new(),
                error: None,
            },
        );
    }

    Ok(order
        .into_iter()
        .filter_map(|id| outcomes.remove(&id))
        .collect())
}

fn handle_message(
    store: &dyn TaskStore,
    agent: &str,
    message: AgentMessage,
    in_flight: &mut HashMap<String, InFlight>,
    outcomes: &mut HashMap<String, TaskOutcome>,
) {
    match message {
        AgentMessage::StreamChunk(chunk) => {
            if let Some(flight) = in_flight.get_mut(&chunk.task_id) {
                flight.output.push(chunk.content);
            }
        }
        AgentMessage::TaskUpdate(update) if update.status.is_terminal() => {
            let Some(flight) = in_flight.remove(&update.task_id) else {
                return;
            };
            let outcome = if update.status == TaskUpdateStatus::Completed {
                update_store(store, &update.task_id, TaskState::Completed, None);
                tracing::info!(agent, task_id = %update.task_id, "Task completed");
                TaskOutcome {
                    task_id: flight.record.id,
                    subject: flight.record.subject,
                    agent: Some(flight.agent),
                    status: OutcomeStatus::Completed,
                    output: flight.output,
                    error: None,
                }
            } else {
                let error = update.error.unwrap_or_else(|| "task failed".to_string());
                update_store(store, &update.task_id, TaskState::Failed, None);
                tracing::warn!(agent, task_id = %update.task_id, error = %error, "Task failed");
                failed(flight, error)
            };
            outcomes.insert(update.task_id, outcome);
        }
        _ => {}
    }
}

fn reap_dead_agents(
    manager: &TeamManager,
    team: &str,
    store: &dyn TaskStore,
    in_flight: &mut HashMap<String, InFlight>,
    outcomes: &mut HashMap<String, TaskOutcome>,
) {
    let dead: Vec<(String, AgentStatus)> = in_flight
        .iter()
        .filter_map(|(task_id, flight)| {
            let status = manager
                .get_agent_state(team, &flight.agent)
                .map(|s| s.status)
                .unwrap_or(AgentStatus::Shutdown);
            matches!(status, AgentStatus::Shutdown | AgentStatus::Error)
                .then(|| (task_id.clone(), status))
        })
        .collect();

    for (task_id, status) in dead {
        if let Some(flight) = in_flight.remove(&task_id) {
            tracing::warn!(team, agent = %flight.agent, task_id = %task_id, %status, "Agent lost with task in flight");
            update_store(store, &task_id, TaskState::Failed, None);
            let error = format!("agent {} went {status} before finishing", flight.agent);
            outcomes.insert(task_id, failed(flight, error));
        }
    }
}

fn failed(flight: InFlight, error: String) -> TaskOutcome {
    TaskOutcome {
        task_id: flight.record.id,
        subject: flight.record.subject,
        agent: Some(flight.agent),
        status: OutcomeStatus::Failed,
        output: flight.output,
        error: Some(error),
    }
}

fn update_store(store: &dyn TaskStore, task_id: &str, state: TaskState, owner: Option<&str>) {
    if let Err(e) = store.update(task_id, state, owner) {
        tracing::warn!(task_id, error = %e, "Failed to update task store");
    }
}
