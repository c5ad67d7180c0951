use chrono::Utc;

use marshal_core::event::WorkerEvent;
use marshal_core::ids::SessionId;
use marshal_core::status::SessionStatus;
use marshal_core::usage::TokenUsage;

use crate::cluster::Cluster;
use crate::error::ClusterError;
use crate::session::{SessionFilter, TrackedSession};

/// Session-tracking surface of the cluster. The session map shares the
/// node map's lock, so everything here sees node status consistently.
impl Cluster {
    pub fn add_session(&self, session: TrackedSession) -> Result<(), ClusterError> {
        let mut inner = self.inner.write();
        if !inner.nodes.contains_key(&session.node_id) {
            return Err(ClusterError::UnknownNode(session.node_id.clone()));
        }
        if inner.sessions.contains_key(&session.id) {
            return Err(ClusterError::DuplicateSession {
                node_id: session.node_id.clone(),
                session_id: session.id.clone(),
            });
        }
        tracing::info!(session_id = %session.id, node_id = %session.node_id, project = %session.project, "session tracked");
        inner.sessions.insert(session.id.clone(), session);
        Ok(())
    }

    /// Reported status changes. Unreachable is derived from node liveness
    /// and is rejected here; killed sessions stay killed.
    pub fn update_status(
        &self,
        session_id: &SessionId,
        status: SessionStatus,
    ) -> Result<(), ClusterError> {
        if status == SessionStatus::Unreachable {
            return Err(ClusterError::DerivedStatus);
        }
        let mut inner = self.inner.write();
        let session = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| ClusterError::SessionNotFound(session_id.clone()))?;
        if session.is_terminal() {
            return Ok(());
        }
        session.status = status;
        session.last_activity = Utc::now();
        Ok(())
    }

    pub fn record_token_usage(
        &self,
        session_id: &SessionId,
        usage: TokenUsage,
    ) -> Result<(), ClusterError> {
        let mut inner = self.inner.write();
        let session = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| ClusterError::SessionNotFound(session_id.clone()))?;
        if session.is_terminal() {
            return Ok(());
        }
        session.tokens.add(&usage);
        session.last_activity = Utc::now();
        Ok(())
    }

    pub fn add_cost(&self, session_id: &SessionId, amount_usd: f64) -> Result<(), ClusterError> {
        let mut inner = self.inner.write();
        let session = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| ClusterError::SessionNotFound(session_id.clone()))?;
        if session.is_terminal() {
            return Ok(());
        }
        session.cost_usd += amount_usd;
        Ok(())
    }

    /// Fold a worker event into the tracked session. Unknown sessions are
    /// ignored (workers may emit for sessions started out of band); returns
    /// whether anything was applied.
    ///
    /// A `session.status` report is the only path that brings a session
    /// back from unreachable; other events just refresh activity.
    pub fn apply_event(&self, event: &WorkerEvent) -> bool {
        let Some(session_id) = &event.session_id else {
            return false;
        };
        let mut inner = self.inner.write();
        let Some(session) = inner.sessions.get_mut(session_id) else {
            return false;
        };
        if session.is_terminal() {
            return false;
        }
        session.last_activity = event.received_at;

        let usage = TokenUsage {
            input_tokens: event.field_num("input_tokens").unwrap_or(0.0) as u64,
            output_tokens: event.field_num("output_tokens").unwrap_or(0.0) as u64,
        };
        if usage.total() > 0 {
            session.tokens.add(&usage);
        }
        if let Some(cost) = event.field_num("cost_usd") {
            session.cost_usd += cost;
        }

        match event.kind.as_str() {
            "session.compacted" => {
                session.compactions += 1;
                true
            }
            "session.status" => {
                if let Some(status) = event.field_str("status").and_then(|s| s.parse().ok()) {
                    if status != SessionStatus::Unreachable {
                        session.status = status;
                    }
                }
                true
            }
            kind => {
                // Liveness-bearing events do not override unreachable; a
                // full status report is required after a node comes back.
                if session.status != SessionStatus::Unreachable {
                    match kind {
                        "session.idle" => session.status = SessionStatus::Idle,
                        "session.error" => session.status = SessionStatus::Error,
                        "session.started" | "session.resumed" => {
                            session.status = SessionStatus::Running
                        }
                        _ => {}
                    }
                }
                true
            }
        }
    }

    /// Worker-side status report after reconnect: the authoritative word
    /// on what the session is doing now.
    pub fn restore_from_report(
        &self,
        session_id: &SessionId,
        status: SessionStatus,
    ) -> Result<(), ClusterError> {
        if status == SessionStatus::Unreachable {
            return Err(ClusterError::DerivedStatus);
        }
        let mut inner = self.inner.write();
        let session = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| ClusterError::SessionNotFound(session_id.clone()))?;
        tracing::info!(session_id = %session_id, from = %session.status, to = %status, "session restored from report");
        session.status = status;
        session.last_activity = Utc::now();
        Ok(())
    }

    pub fn mark_killed(&self, session_id: &SessionId) -> Result<(), ClusterError> {
        let mut inner = self.inner.write();
        let session = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| ClusterError::SessionNotFound(session_id.clone()))?;
        session.status = SessionStatus::Killed;
        session.last_activity = Utc::now();
        Ok(())
    }

    pub fn remove_session(&self, session_id: &SessionId) -> Result<TrackedSession, ClusterError> {
        self.inner
            .write()
            .sessions
            .remove(session_id)
            .ok_or_else(|| ClusterError::SessionNotFound(session_id.clone()))
    }

    pub fn get_session(&self, session_id: &SessionId) -> Result<TrackedSession, ClusterError> {
        self.inner
            .read()
            .sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| ClusterError::SessionNotFound(session_id.clone()))
    }

    pub fn list_sessions(&self, filter: &SessionFilter) -> Vec<TrackedSession> {
        let mut sessions: Vec<TrackedSession> = self
            .inner
            .read()
            .sessions
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        sessions
    }

    /// Consistent point-in-time copy for policy evaluation.
    pub fn snapshot(&self) -> Vec<TrackedSession> {
        self.inner.read().sessions.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marshal_core::config::HeartbeatConfig;
    use marshal_core::ids::{EventId, NodeId};
    use marshal_core::resources::DegradedThresholds;

    fn cluster_with_node() -> (Cluster, NodeId) {
        let c = Cluster::new(HeartbeatConfig::default(), DegradedThresholds::default());
        let id = c.register("worker-a", "host1", vec!["api".into()], vec![]);
        (c, id)
    }

    fn tracked(node_id: &NodeId, sid: &str) -> TrackedSession {
        TrackedSession::new(SessionId::from_raw(sid), node_id.clone(), "api", None)
    }

    fn event(sid: &str, kind: &str, fields: serde_json::Value) -> WorkerEvent {
        WorkerEvent {
            event_id: EventId::new(),
            node_id: NodeId::from_raw("node_1"),
            session_id: Some(SessionId::from_raw(sid)),
            kind: kind.to_string(),
            fields: fields.as_object().cloned().unwrap_or_default(),
            received_at: Utc::now(),
        }
    }

    #[test]
    fn add_session_requires_known_node() {
        let c = Cluster::new(HeartbeatConfig::default(), DegradedThresholds::default());
        let err = c.add_session(tracked(&NodeId::from_raw("node_x"), "sess_1"));
        assert!(matches!(err, Err(ClusterError::UnknownNode(_))));
    }

    #[test]
    fn duplicate_session_rejected() {
        let (c, node) = cluster_with_node();
        c.add_session(tracked(&node, "sess_1")).unwrap();
        let err = c.add_session(tracked(&node, "sess_1"));
        assert!(matches!(err, Err(ClusterError::DuplicateSession { .. })));
    }

    #[test]
    fn update_status_rejects_unreachable() {
        let (c, node) = cluster_with_node();
        c.add_session(tracked(&node, "sess_1")).unwrap();
        let err = c.update_status(&SessionId::from_raw("sess_1"), SessionStatus::Unreachable);
        assert_eq!(err, Err(ClusterError::DerivedStatus));
    }

    #[test]
    fn killed_is_sticky() {
        let (c, node) = cluster_with_node();
        let sid = SessionId::from_raw("sess_1");
        c.add_session(tracked(&node, "sess_1")).unwrap();
        c.mark_killed(&sid).unwrap();
        c.update_status(&sid, SessionStatus::Running).unwrap();
        assert_eq!(c.get_session(&sid).unwrap().status, SessionStatus::Killed);
    }

    #[test]
    fn killed_session_stops_accumulating() {
        let (c, node) = cluster_with_node();
        let sid = SessionId::from_raw("sess_1");
        c.add_session(tracked(&node, "sess_1")).unwrap();
        c.mark_killed(&sid).unwrap();
        c.record_token_usage(&sid, TokenUsage { input_tokens: 150, output_tokens: 0 }).unwrap();
        c.add_cost(&sid, 5.0).unwrap();
        let s = c.get_session(&sid).unwrap();
        assert_eq!(s.tokens.total(), 0);
        assert_eq!(s.cost_usd, 0.0);
    }

    #[test]
    fn token_usage_accumulates() {
        let (c, node) = cluster_with_node();
        let sid = SessionId::from_raw("sess_1");
        c.add_session(tracked(&node, "sess_1")).unwrap();
        c.record_token_usage(&sid, TokenUsage { input_tokens: 100, output_tokens: 20 }).unwrap();
        c.record_token_usage(&sid, TokenUsage { input_tokens: 50, output_tokens: 5 }).unwrap();
        let s = c.get_session(&sid).unwrap();
        assert_eq!(s.tokens.input_tokens, 150);
        assert_eq!(s.tokens.output_tokens, 25);
        assert_eq!(s.tokens.total(), 175);
    }

    #[test]
    fn idle_event_flips_status() {
        let (c, node) = cluster_with_node();
        c.add_session(tracked(&node, "sess_1")).unwrap();
        assert!(c.apply_event(&event("sess_1", "session.idle", serde_json::json!({}))));
        let s = c.get_session(&SessionId::from_raw("sess_1")).unwrap();
        assert_eq!(s.status, SessionStatus::Idle);
    }

    #[test]
    fn compaction_event_increments_count() {
        let (c, node) = cluster_with_node();
        c.add_session(tracked(&node, "sess_1")).unwrap();
        for _ in 0..3 {
            c.apply_event(&event("sess_1", "session.compacted", serde_json::json!({})));
        }
        assert_eq!(c.get_session(&SessionId::from_raw("sess_1")).unwrap().compactions, 3);
    }

    #[test]
    fn event_with_tokens_accumulates_usage() {
        let (c, node) = cluster_with_node();
        c.add_session(tracked(&node, "sess_1")).unwrap();
        c.apply_event(&event(
            "sess_1",
            "session.message",
            serde_json::json!({"input_tokens": 1200, "output_tokens": 340, "cost_usd": 0.25}),
        ));
        let s = c.get_session(&SessionId::from_raw("sess_1")).unwrap();
        assert_eq!(s.tokens.input_tokens, 1200);
        assert_eq!(s.tokens.output_tokens, 340);
        assert!((s.cost_usd - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn events_for_unknown_sessions_are_ignored() {
        let (c, _) = cluster_with_node();
        assert!(!c.apply_event(&event("sess_ghost", "session.idle", serde_json::json!({}))));
    }

    #[test]
    fn liveness_events_do_not_clear_unreachable() {
        let (c, node) = cluster_with_node();
        c.add_session(tracked(&node, "sess_1")).unwrap();
        c.mark_offline(&node).unwrap();
        c.register("worker-a", "host1", vec!["api".into()], vec![]);

        c.apply_event(&event("sess_1", "session.idle", serde_json::json!({})));
        let sid = SessionId::from_raw("sess_1");
        assert_eq!(c.get_session(&sid).unwrap().status, SessionStatus::Unreachable);

        // Only an explicit status report restores it
        c.apply_event(&event("sess_1", "session.status", serde_json::json!({"status": "idle"})));
        assert_eq!(c.get_session(&sid).unwrap().status, SessionStatus::Idle);
    }

    #[test]
    fn restore_from_report_overrides_unreachable() {
        let (c, node) = cluster_with_node();
        let sid = SessionId::from_raw("sess_1");
        c.add_session(tracked(&node, "sess_1")).unwrap();
        c.mark_offline(&node).unwrap();
        assert_eq!(c.get_session(&sid).unwrap().status, SessionStatus::Unreachable);
        c.restore_from_report(&sid, SessionStatus::Running).unwrap();
        assert_eq!(c.get_session(&sid).unwrap().status, SessionStatus::Running);
    }

    #[test]
    fn list_sessions_filters_by_node() {
        let (c, node_a) = cluster_with_node();
        let node_b = c.register("worker-b", "host2", vec!["web".into()], vec![]);
        c.add_session(tracked(&node_a, "sess_1")).unwrap();
        c.add_session(TrackedSession::new(
            SessionId::from_raw("sess_2"),
            node_b.clone(),
            "web",
            None,
        ))
        .unwrap();

        let filter = SessionFilter { node_id: Some(node_b.clone()), ..Default::default() };
        let listed = c.list_sessions(&filter);
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, SessionId::from_raw("sess_2"));
    }

    #[test]
    fn remove_session_returns_record() {
        let (c, node) = cluster_with_node();
        c.add_session(tracked(&node, "sess_1")).unwrap();
        let removed = c.remove_session(&SessionId::from_raw("sess_1")).unwrap();
        assert_eq!(removed.project, "api");
        assert!(c.get_session(&SessionId::from_raw("sess_1")).is_err());
    }
}
