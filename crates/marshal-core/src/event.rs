//! Worker events as seen by the supervisor: session lifecycle signals,
//! tool executions, and supervisor-synthesized policy events, forwarded
//! verbatim with node/session correlation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::{EventId, NodeId, SessionId};

/// One inbound (or synthesized) event with correlation identifiers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerEvent {
    pub event_id: EventId,
    pub node_id: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    /// Dotted event kind, e.g. `session.idle`, `session.compacted`.
    pub kind: String,
    #[serde(default)]
    pub fields: Map<String, Value>,
    pub received_at: DateTime<Utc>,
}

impl WorkerEvent {
    pub fn new(
        node_id: NodeId,
        session_id: Option<SessionId>,
        kind: impl Into<String>,
        fields: Map<String, Value>,
    ) -> Self {
        Self {
            event_id: EventId::new(),
            node_id,
            session_id,
            kind: kind.into(),
            fields,
            received_at: Utc::now(),
        }
    }

    /// Look up a field by dotted path (`cost.daily` descends nested objects).
    pub fn field(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let first = parts.next()?;
        let mut current = self.fields.get(first)?;
        for part in parts {
            current = current.get(part)?;
        }
        Some(current)
    }

    pub fn field_num(&self, path: &str) -> Option<f64> {
        self.field(path).and_then(Value::as_f64)
    }

    pub fn field_str(&self, path: &str) -> Option<&str> {
        self.field(path).and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(kind: &str, fields: Value) -> WorkerEvent {
        let map = match fields {
            Value::Object(m) => m,
            _ => Map::new(),
        };
        WorkerEvent::new(NodeId::from_raw("node_1"), Some(SessionId::from_raw("sess_1")), kind, map)
    }

    #[test]
    fn field_lookup_flat() {
        let e = event("session.idle", json!({"stuck": 320}));
        assert_eq!(e.field_num("stuck"), Some(320.0));
        assert_eq!(e.field_num("missing"), None);
    }

    #[test]
    fn field_lookup_nested() {
        let e = event("cost.report", json!({"cost": {"daily": 21.5}}));
        assert_eq!(e.field_num("cost.daily"), Some(21.5));
    }

    #[test]
    fn field_str_lookup() {
        let e = event("session.status", json!({"status": "running"}));
        assert_eq!(e.field_str("status"), Some("running"));
        assert_eq!(e.field_str("stuck"), None);
    }

    #[test]
    fn serde_roundtrip() {
        let e = event("session.error", json!({"message": "oom"}));
        let json = serde_json::to_string(&e).unwrap();
        let parsed: WorkerEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.kind, "session.error");
        assert_eq!(parsed.field_str("message"), Some("oom"));
    }
}
