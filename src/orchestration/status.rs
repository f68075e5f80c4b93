//! Agent status state machine.
//!
//! Every inbound worker event and every coordinator-side assignment is mapped
//! to a [`StatusInput`] and run through [`StatusMachine::apply`]. Inputs that
//! have no entry in the transition table are rejected and leave the state
//! untouched, so a stray or reordered message can never silently overwrite the
//! agent's status.
//!
//! | From        | Input             | To          |
//! |-------------|-------------------|-------------|
//! | idle        | TaskAssigned(t)   | active(t)   |
//! | idle        | TaskStarted(t)    | active(t)   |
//! | active(t)   | TaskStarted(t)    | active(t)   |
//! | active(t)   | TaskFinished(t)   | idle        |
//! | not shutdown| ProcessError      | error       |
//! | any         | ProcessExited     | shutdown    |

use std::fmt;

use serde::{Deserialize, Serialize};

/// Coarse lifecycle status reported to observers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Idle,
    Active,
    Error,
    /// Terminal: the worker is gone and the handle has been cleared.
    Shutdown,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Active => "active",
            AgentStatus::Error => "error",
            AgentStatus::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// An event that may move the state machine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StatusInput {
    /// The coordinator handed the agent a task (optimistic, before any ack).
    TaskAssigned(String),
    /// The worker reported `in_progress` for a task.
    TaskStarted(String),
    /// The worker reported a terminal update (`completed` or `failed`).
    TaskFinished(String),
    /// The channel to the worker failed.
    ProcessError,
    /// The worker process exited.
    ProcessExited,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Active { task_id: String },
    Error,
    Shutdown,
}

/// Result of an accepted input.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transition {
    pub from: AgentStatus,
    pub to: AgentStatus,
}

impl Transition {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

/// Input that has no entry in the transition table for the current state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rejected {
    pub status: AgentStatus,
    pub input: StatusInput,
}

/// Tagged state of one agent; owns `currentTaskId` so it exists only while active.
#[derive(Clone, Debug)]
pub struct StatusMachine {
    phase: Phase,
}

impl Default for StatusMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusMachine {
    pub fn new() -> Self {
        Self { phase: Phase::Idle }
    }

    pub fn status(&self) -> AgentStatus {
        match self.phase {
            Phase::Idle => AgentStatus::Idle,
            Phase::Active { .. } => AgentStatus::Active,
            Phase::Error => AgentStatus::Error,
            Phase::Shutdown => AgentStatus::Shutdown,
        }
    }

    pub fn current_task_id(&self) -> Option<&str> {
        match &self.phase {
            Phase::Active { task_id } => Some(task_id),
            _ => None,
        }
    }

    /// Check an input without applying it.
    pub fn accepts(&self, input: &StatusInput) -> bool {
        self.next_phase(input).is_some()
    }

    /// Apply an input, returning the transition or the rejection.
    pub fn apply(&mut self, input: StatusInput) -> Result<Transition, Rejected> {
        let from = self.status();
        match self.next_phase(&input) {
            Some(next) => {
                self.phase = next;
                Ok(Transition {
                    from,
                    to: self.status(),
                })
            }
            None => Err(Rejected {
                status: from,
                input,
            }),
        }
    }

    fn next_phase(&self, input: &StatusInput) -> Option<Phase> {
        match (&self.phase, input) {
            (_, StatusInput::ProcessExited) => Some(Phase::Shutdown),
            (Phase::Shutdown, _) => None,
            (_, StatusInput::ProcessError) => Some(Phase::Error),
            (Phase::Idle, StatusInput::TaskAssigned(t) | StatusInput::TaskStarted(t)) => {
                Some(Phase::Active {
                    task_id: t.clone(),
                })
            }
            (Phase::Active { task_id }, StatusInput::TaskStarted(t)) if task_id == t => {
                Some(self.phase.clone())
            }
            (Phase::Active { task_id }, StatusInput::TaskFinished(t)) if task_id == t => {
                Some(Phase::Idle)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(machine: &mut StatusMachine, task: &str) {
        machine
            .apply(StatusInput::TaskAssigned(task.to_string()))
            .unwrap();
    }

    #[test]
    fn assignment_activates_and_completion_returns_to_idle() {
        let mut m = StatusMachine::new();
        started(&mut m, "t1");
        assert_eq!(m.status(), AgentStatus::Active);
        assert_eq!(m.current_task_id(), Some("t1"));

        let confirm = m.apply(StatusInput::TaskStarted("t1".into())).unwrap();
        assert!(!confirm.changed());

        let done = m.apply(StatusInput::TaskFinished("t1".into())).unwrap();
        assert_eq!(done.from, AgentStatus::Active);
        assert_eq!(done.to, AgentStatus::Idle);
        assert_eq!(m.current_task_id(), None);
    }

    #[test]
    fn worker_initiated_progress_activates_idle_agent() {
        let mut m = StatusMachine::new();
        m.apply(StatusInput::TaskStarted("t9".into())).unwrap();
        assert_eq!(m.current_task_id(), Some("t9"));
    }

    #[test]
    fn finishing_a_different_task_is_rejected() {
        let mut m = StatusMachine::new();
        started(&mut m, "t1");
        let err = m.apply(StatusInput::TaskFinished("t2".into())).unwrap_err();
        assert_eq!(err.status, AgentStatus::Active);
        assert_eq!(m.current_task_id(), Some("t1"));
    }

    #[test]
    fn double_assignment_is_rejected() {
        let mut m = StatusMachine::new();
        started(&mut m, "t1");
        assert!(!m.accepts(&StatusInput::TaskAssigned("t2".into())));
        assert!(m.apply(StatusInput::TaskAssigned("t2".into())).is_err());
    }

    #[test]
    fn completion_while_idle_is_rejected() {
        let mut m = StatusMachine::new();
        assert!(m.apply(StatusInput::TaskFinished("t1".into())).is_err());
        assert_eq!(m.status(), AgentStatus::Idle);
    }

    #[test]
    fn process_error_clears_task_and_blocks_new_work() {
        let mut m = StatusMachine::new();
        started(&mut m, "t1");
        m.apply(StatusInput::ProcessError).unwrap();
        assert_eq!(m.status(), AgentStatus::Error);
        assert_eq!(m.current_task_id(), None);
        assert!(m.apply(StatusInput::TaskAssigned("t2".into())).is_err());
        assert!(m.apply(StatusInput::TaskFinished("t1".into())).is_err());
    }

    #[test]
    fn shutdown_is_terminal() {
        let mut m = StatusMachine::new();
        m.apply(StatusInput::ProcessExited).unwrap();
        assert_eq!(m.status(), AgentStatus::Shutdown);
        for input in [
            StatusInput::TaskAssigned("t".into()),
            StatusInput::TaskStarted("t".into()),
            StatusInput::ProcessError,
        ] {
            assert!(m.apply(input).is_err());
        }
        // A repeated exit notification is harmless.
        assert!(!m.apply(StatusInput::ProcessExited).unwrap().changed());
    }
}
