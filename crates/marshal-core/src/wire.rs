//! Wire frames for the persistent worker connection. Workers initiate the
//! connection and speak three kinds of traffic over it: event stream,
//! command/response, and heartbeats.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::command::{CommandResult, CommandSpec, CommandStatus};
use crate::ids::{CommandId, NodeId, SessionId};
use crate::resources::ResourceSnapshot;

/// Frames a worker sends to the supervisor.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum WorkerFrame {
    /// Must be the first frame on a new connection.
    Register {
        identity: String,
        hostname: String,
        #[serde(default)]
        projects: Vec<String>,
        #[serde(default)]
        capabilities: Vec<String>,
    },
    Heartbeat {
        #[serde(default)]
        resources: ResourceSnapshot,
    },
    Event {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
        kind: String,
        #[serde(default)]
        fields: Map<String, Value>,
    },
    Result {
        command_id: CommandId,
        status: CommandStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default)]
        duration_ms: u64,
    },
}

/// Frames the supervisor sends to a worker.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum ServerFrame {
    Registered {
        node_id: NodeId,
        heartbeat_interval_secs: u64,
    },
    HeartbeatAck,
    /// Supervisor-side ping; heartbeats are bidirectional.
    Heartbeat,
    Command {
        command_id: CommandId,
        spec: CommandSpec,
    },
    Error {
        message: String,
    },
}

impl WorkerFrame {
    /// Convert a `Result` frame into the dispatcher's result type.
    pub fn into_command_result(self) -> Option<(CommandId, CommandResult)> {
        match self {
            Self::Result { command_id, status, output, error, duration_ms } => Some((
                command_id,
                CommandResult { status, output, error, duration_ms },
            )),
            _ => None,
        }
    }
}
