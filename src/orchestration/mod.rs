//! Team orchestration subsystem.
//!
//! The [`team_manager::TeamManager`] owns live teams; each team is a set of
//! [`agent_process::AgentProcess`] handles, one per worker. Workers are
//! created through a [`spawner::WorkerSpawner`] and speak the line-delimited
//! JSON-RPC catalog in [`protocol`] over [`transport`]. Lifecycle
//! notifications go out on an [`events::EventHub`].

pub mod agent_process;
pub mod collaborators;
pub mod dispatcher;
pub mod events;
pub mod protocol;
pub mod spawner;
pub mod status;
pub mod team_manager;
pub mod transport;
pub mod types;
