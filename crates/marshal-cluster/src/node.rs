use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use marshal_core::ids::NodeId;
use marshal_core::resources::ResourceSnapshot;
use marshal_core::status::NodeStatus;

/// One registered worker. The NodeId is stable across reconnects as long
/// as the worker presents the same identity string.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub identity: String,
    pub hostname: String,
    pub projects: Vec<String>,
    pub capabilities: Vec<String>,
    pub resources: ResourceSnapshot,
    pub status: NodeStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub connected_at: DateTime<Utc>,
}

impl Node {
    pub fn hosts_project(&self, project: &str) -> bool {
        self.projects.iter().any(|p| p == project)
    }
}
