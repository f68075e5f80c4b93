//! IPC envelope and method catalog shared by the coordinator and workers.
//!
//! Every message is a JSON-RPC 2.0 shaped notification:
//! `{"jsonrpc":"2.0","method":...,"params":{...},"id":N}`. The `id` is
//! assigned by the coordinator per agent and is informational only; nothing
//! waits for a reply keyed by it.
//!
//! Inbound values are validated in two stages: [`Envelope::from_value`] checks
//! the generic shape, then [`HubMessage::from_envelope`] /
//! [`AgentMessage::from_envelope`] decode the typed payload of known methods.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProtocolError;

pub const JSONRPC_VERSION: &str = "2.0";

/// Method names on the wire.
pub mod method {
    /// Coordinator -> worker: run a task.
    pub const TASK_ASSIGN: &str = "hub.taskAssign";
    /// Coordinator -> worker: exit cleanly.
    pub const SHUTDOWN: &str = "hub.shutdown";
    /// Worker -> coordinator: ready to receive tasks.
    pub const REGISTER: &str = "agent.register";
    /// Worker -> coordinator: task progress / terminal result.
    pub const TASK_UPDATE: &str = "agent.taskUpdate";
    /// Worker -> coordinator: incremental task output.
    pub const STREAM_CHUNK: &str = "agent.streamChunk";

    pub const ALL: [&str; 5] = [TASK_ASSIGN, SHUTDOWN, REGISTER, TASK_UPDATE, STREAM_CHUNK];
}

/// A validated message on the channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub jsonrpc: String,
    pub method: String,
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
}

impl Envelope {
    /// Build an envelope from a method name and a serializable payload.
    pub fn from_payload<P: Serialize>(method: &str, params: &P) -> Result<Self, serde_json::Error> {
        Ok(Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params: serde_json::to_value(params)?,
            id: None,
        })
    }

    pub fn with_id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }

    /// Validate an arbitrary JSON value received from the channel.
    ///
    /// Rejects anything that is not an object with `jsonrpc == "2.0"` and a
    /// string `method`. Known methods must carry object `params`; unknown
    /// methods may omit them (an empty object is substituted).
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let Value::Object(mut map) = value else {
            return Err(ProtocolError::NotAnObject);
        };

        match map.get("jsonrpc") {
            Some(Value::String(v)) if v == JSONRPC_VERSION => {}
            Some(other) => return Err(ProtocolError::BadVersion(other.to_string())),
            None => return Err(ProtocolError::BadVersion("missing".to_string())),
        }

        let method = match map.get("method") {
            Some(Value::String(m)) => m.clone(),
            _ => return Err(ProtocolError::BadMethod),
        };

        let params = match map.remove("params") {
            Some(p @ Value::Object(_)) => p,
            None if !method::ALL.contains(&method.as_str()) => Value::Object(Map::new()),
            _ => return Err(ProtocolError::BadParams { method }),
        };

        let id = map.get("id").and_then(Value::as_u64);

        Ok(Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method,
            params,
            id,
        })
    }

    /// Parse and validate one line of channel text.
    pub fn parse_line(line: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(line).map_err(|e| ProtocolError::NotJson(e.to_string()))?;
        Self::from_value(value)
    }

    fn decode<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_value(self.params.clone()).map_err(|e| ProtocolError::BadPayload {
            method: self.method.clone(),
            message: e.to_string(),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAssignParams {
    pub task_id: String,
    pub subject: String,
    pub description: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownParams {
    pub reason: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterParams {
    pub agent_id: String,
    pub agent_name: String,
    pub team_name: String,
    pub model: String,
    pub role: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskUpdateStatus {
    InProgress,
    Completed,
    Failed,
}

impl TaskUpdateStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskUpdateStatus::InProgress)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskUpdateParams {
    pub agent_id: String,
    pub task_id: String,
    pub status: TaskUpdateStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamChunkParams {
    pub agent_id: String,
    pub task_id: String,
    pub model: String,
    pub content: String,
}

/// Coordinator -> worker messages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HubMessage {
    TaskAssign(TaskAssignParams),
    Shutdown(ShutdownParams),
}

impl HubMessage {
    pub fn method(&self) -> &'static str {
        match self {
            HubMessage::TaskAssign(_) => method::TASK_ASSIGN,
            HubMessage::Shutdown(_) => method::SHUTDOWN,
        }
    }

    pub fn to_envelope(&self) -> Result<Envelope, serde_json::Error> {
        match self {
            HubMessage::TaskAssign(p) => Envelope::from_payload(self.method(), p),
            HubMessage::Shutdown(p) => Envelope::from_payload(self.method(), p),
        }
    }

    /// Decode a validated envelope. `Ok(None)` for methods outside the hub catalog.
    pub fn from_envelope(env: &Envelope) -> Result<Option<Self>, ProtocolError> {
        Ok(match env.method.as_str() {
            method::TASK_ASSIGN => Some(HubMessage::TaskAssign(env.decode()?)),
            method::SHUTDOWN => Some(HubMessage::Shutdown(env.decode()?)),
            _ => None,
        })
    }
}

/// Worker -> coordinator messages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AgentMessage {
    Register(RegisterParams),
    TaskUpdate(TaskUpdateParams),
    StreamChunk(StreamChunkParams),
}

impl AgentMessage {
    pub fn method(&self) -> &'static str {
        match self {
            AgentMessage::Register(_) => method::REGISTER,
            AgentMessage::TaskUpdate(_) => method::TASK_UPDATE,
            AgentMessage::StreamChunk(_) => method::STREAM_CHUNK,
        }
    }

    /// The agent id the worker claims to speak for.
    pub fn agent_id(&self) -> &str {
        match self {
            AgentMessage::Register(p) => &p.agent_id,
            AgentMessage::TaskUpdate(p) => &p.agent_id,
            AgentMessage::StreamChunk(p) => &p.agent_id,
        }
    }

    pub fn to_envelope(&self) -> Result<Envelope, serde_json::Error> {
        match self {
            AgentMessage::Register(p) => Envelope::from_payload(self.method(), p),
            AgentMessage::TaskUpdate(p) => Envelope::from_payload(self.method(), p),
            AgentMessage::StreamChunk(p) => Envelope::from_payload(self.method(), p),
        }
    }

    /// Decode a validated envelope. `Ok(None)` for methods outside the agent catalog.
    pub fn from_envelope(env: &Envelope) -> Result<Option<Self>, ProtocolError> {
        Ok(match env.method.as_str() {
            method::REGISTER => Some(AgentMessage::Register(env.decode()?)),
            method::TASK_UPDATE => Some(AgentMessage::TaskUpdate(env.decode()?)),
            method::STREAM_CHUNK => Some(AgentMessage::StreamChunk(env.decode()?)),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rejects_non_objects_and_bad_versions() {
        assert_eq!(
            Envelope::from_value(json!([1, 2])),
            Err(ProtocolError::NotAnObject)
        );
        assert!(matches!(
            Envelope::from_value(json!({"method": "agent.register", "params": {}})),
            Err(ProtocolError::BadVersion(_))
        ));
        assert!(matches!(
            Envelope::from_value(json!({"jsonrpc": "1.0", "method": "x"})),
            Err(ProtocolError::BadVersion(_))
        ));
    }

    #[test]
    fn rejects_non_string_method() {
        assert_eq!(
            Envelope::from_value(json!({"jsonrpc": "2.0", "method": 7, "params": {}})),
            Err(ProtocolError::BadMethod)
        );
    }

    #[test]
    fn known_methods_require_object_params() {
        let err = Envelope::from_value(json!({"jsonrpc": "2.0", "method": "agent.taskUpdate"}));
        assert!(matches!(err, Err(ProtocolError::BadParams { .. })));

        let err = Envelope::from_value(
            json!({"jsonrpc": "2.0", "method": "agent.taskUpdate", "params": "done"}),
        );
        assert!(matches!(err, Err(ProtocolError::BadParams { .. })));
    }

    #[test]
    fn unknown_methods_may_omit_params() {
        let env = Envelope::from_value(json!({"jsonrpc": "2.0", "method": "agent.ping", "id": 4}))
            .unwrap();
        assert_eq!(env.params, json!({}));
        assert_eq!(env.id, Some(4));
        assert_eq!(AgentMessage::from_envelope(&env), Ok(None));
    }

    #[test]
    fn decodes_task_update_payload() {
        let env = Envelope::parse_line(
            r#"{"jsonrpc":"2.0","method":"agent.taskUpdate","params":{"agentId":"a1","taskId":"t1","status":"in_progress"}}"#,
        )
        .unwrap();
        let msg = AgentMessage::from_envelope(&env).unwrap().unwrap();
        assert_eq!(
            msg,
            AgentMessage::TaskUpdate(TaskUpdateParams {
                agent_id: "a1".into(),
                task_id: "t1".into(),
                status: TaskUpdateStatus::InProgress,
                error: None,
            })
        );
        assert_eq!(msg.agent_id(), "a1");
    }

    #[test]
    fn bad_payload_for_known_method_is_an_error() {
        let env = Envelope::from_value(json!({
            "jsonrpc": "2.0",
            "method": "agent.taskUpdate",
            "params": {"agentId": "a1", "status": "exploded"}
        }))
        .unwrap();
        assert!(matches!(
            AgentMessage::from_envelope(&env),
            Err(ProtocolError::BadPayload { .. })
        ));
    }

    #[test]
    fn hub_message_serializes_with_id() {
        let env = HubMessage::TaskAssign(TaskAssignParams {
            task_id: "t1".into(),
            subject: "Fix".into(),
            description: "Fix the build".into(),
        })
        .to_envelope()
        .unwrap()
        .with_id(3);

        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(
            value,
            json!({
                "jsonrpc": "2.0",
                "method": "hub.taskAssign",
                "params": {"taskId": "t1", "subject": "Fix", "description": "Fix the build"},
                "id": 3
            })
        );
    }

    #[test]
    fn non_json_line_is_rejected() {
        assert!(matches!(
            Envelope::parse_line("Compiling agent-crew v0.1.0"),
            Err(ProtocolError::NotJson(_))
        ));
    }
}
