use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use marshal_core::ids::{NodeId, SessionId};
use marshal_core::status::SessionStatus;
use marshal_core::usage::TokenUsage;

/// The supervisor's unified record of one remote agent session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrackedSession {
    pub id: SessionId,
    pub node_id: NodeId,
    pub project: String,
    pub status: SessionStatus,
    pub tokens: TokenUsage,
    pub compactions: u32,
    pub cost_usd: f64,
    pub model: Option<String>,
    pub last_activity: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
}

impl TrackedSession {
    pub fn new(id: SessionId, node_id: NodeId, project: impl Into<String>, model: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            node_id,
            project: project.into(),
            status: SessionStatus::Running,
            tokens: TokenUsage::default(),
            compactions: 0,
            cost_usd: 0.0,
            model,
            last_activity: now,
            started_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Filter for session queries. Empty filter matches everything non-terminal.
#[derive(Clone, Debug, Default)]
pub struct SessionFilter {
    pub project: Option<String>,
    pub node_id: Option<NodeId>,
    pub status: Option<SessionStatus>,
}

impl SessionFilter {
    pub fn matches(&self, session: &TrackedSession) -> bool {
        if let Some(project) = &self.project {
            if &session.project != project {
                return false;
            }
        }
        if let Some(node_id) = &self.node_id {
            if &session.node_id != node_id {
                return false;
            }
        }
        match self.status {
            Some(status) => session.status == status,
            // Terminal sessions only show up when asked for explicitly
            None => !session.is_terminal(),
        }
    }
}
