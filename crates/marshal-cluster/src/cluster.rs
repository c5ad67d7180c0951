use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::broadcast;

use marshal_core::config::HeartbeatConfig;
use marshal_core::ids::{NodeId, SessionId};
use marshal_core::resources::{DegradedThresholds, ResourceSnapshot};
use marshal_core::status::{NodeStatus, SessionStatus};

use crate::error::ClusterError;
use crate::node::Node;
use crate::session::TrackedSession;

/// Status-change notifications for subscribers (event router, server).
#[derive(Clone, Debug)]
pub enum ClusterChange {
    NodeOnline {
        node_id: NodeId,
        reconnected: bool,
    },
    NodeDegraded {
        node_id: NodeId,
    },
    NodeOffline {
        node_id: NodeId,
        unreachable: Vec<SessionId>,
    },
    NodeDeregistered {
        node_id: NodeId,
        removed_sessions: Vec<SessionId>,
    },
}

pub(crate) struct ClusterInner {
    pub(crate) nodes: HashMap<NodeId, Node>,
    pub(crate) identities: HashMap<String, NodeId>,
    pub(crate) sessions: HashMap<SessionId, TrackedSession>,
}

/// Shared live state for the whole fleet. One RwLock guards both the node
/// map and the session map, which is what makes the offline cascade a
/// single atomic step: no reader can observe an offline node whose
/// sessions are still marked reachable.
pub struct Cluster {
    pub(crate) inner: RwLock<ClusterInner>,
    changes: broadcast::Sender<ClusterChange>,
    heartbeat: HeartbeatConfig,
    thresholds: DegradedThresholds,
}

impl Cluster {
    pub fn new(heartbeat: HeartbeatConfig, thresholds: DegradedThresholds) -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            inner: RwLock::new(ClusterInner {
                nodes: HashMap::new(),
                identities: HashMap::new(),
                sessions: HashMap::new(),
            }),
            changes,
            heartbeat,
            thresholds,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClusterChange> {
        self.changes.subscribe()
    }

    pub fn heartbeat_interval_secs(&self) -> u64 {
        self.heartbeat.interval_secs
    }

    fn emit(&self, change: ClusterChange) {
        // Nobody listening is fine (tests, early startup)
        let _ = self.changes.send(change);
    }

    /// Admit a worker. A known identity reuses its NodeId and replaces the
    /// descriptive fields; sessions previously marked unreachable stay that
    /// way until a fresh status report arrives.
    pub fn register(
        &self,
        identity: &str,
        hostname: &str,
        projects: Vec<String>,
        capabilities: Vec<String>,
    ) -> NodeId {
        let now = Utc::now();
        let (node_id, reconnected) = {
            let mut inner = self.inner.write();
            match inner.identities.get(identity).cloned() {
                Some(id) => {
                    let node = inner
                        .nodes
                        .get_mut(&id)
                        .unwrap_or_else(|| unreachable!("identity index points at live node"));
                    node.hostname = hostname.to_string();
                    node.projects = projects;
                    node.capabilities = capabilities;
                    node.status = NodeStatus::Online;
                    node.last_heartbeat = now;
                    node.connected_at = now;
                    (id, true)
                }
                None => {
                    let id = NodeId::new();
                    inner.identities.insert(identity.to_string(), id.clone());
                    inner.nodes.insert(
                        id.clone(),
                        Node {
                            id: id.clone(),
                            identity: identity.to_string(),
                            hostname: hostname.to_string(),
                            projects,
                            capabilities,
                            resources: ResourceSnapshot::default(),
                            status: NodeStatus::Online,
                            last_heartbeat: now,
                            connected_at: now,
                        },
                    );
                    (id, false)
                }
            }
        };

        tracing::info!(node_id = %node_id, identity, reconnected, "node registered");
        self.emit(ClusterChange::NodeOnline { node_id: node_id.clone(), reconnected });
        node_id
    }

    /// Record a heartbeat. Degraded is entered/left on resource threshold
    /// crossings without touching session status.
    pub fn heartbeat(
        &self,
        node_id: &NodeId,
        resources: ResourceSnapshot,
    ) -> Result<NodeStatus, ClusterError> {
        let change = {
            let mut inner = self.inner.write();
            let node = inner
                .nodes
                .get_mut(node_id)
                .ok_or_else(|| ClusterError::UnknownNode(node_id.clone()))?;
            node.last_heartbeat = Utc::now();
            node.resources = resources;

            let exceeded = self.thresholds.exceeded_by(&resources);
            match (node.status, exceeded) {
                (NodeStatus::Online, true) => {
                    node.status = NodeStatus::Degraded;
                    Some(ClusterChange::NodeDegraded { node_id: node_id.clone() })
                }
                (NodeStatus::Degraded, false) => {
                    node.status = NodeStatus::Online;
                    Some(ClusterChange::NodeOnline { node_id: node_id.clone(), reconnected: false })
                }
                // A heartbeat from a node we swept offline proves the
                // transport is alive again; sessions still wait for reports.
                (NodeStatus::Offline, _) => {
                    node.status = if exceeded { NodeStatus::Degraded } else { NodeStatus::Online };
                    Some(ClusterChange::NodeOnline { node_id: node_id.clone(), reconnected: true })
                }
                _ => None,
            }
        };
        if let Some(change) = change {
            self.emit(change);
        }
        let inner = self.inner.read();
        inner
            .nodes
            .get(node_id)
            .map(|n| n.status)
            .ok_or_else(|| ClusterError::UnknownNode(node_id.clone()))
    }

    /// Mark every node whose heartbeat window has expired as offline,
    /// cascading to its sessions. Returns the affected node ids.
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<NodeId> {
        let timeout = chrono::Duration::from_std(self.heartbeat.timeout())
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let mut offline = Vec::new();
        {
            let mut inner = self.inner.write();
            let expired: Vec<NodeId> = inner
                .nodes
                .values()
                .filter(|n| n.status.is_connected() && now - n.last_heartbeat > timeout)
                .map(|n| n.id.clone())
                .collect();
            for node_id in expired {
                let unreachable = offline_cascade(&mut inner, &node_id);
                offline.push((node_id, unreachable));
            }
        }
        let mut swept = Vec::new();
        for (node_id, unreachable) in offline {
            tracing::warn!(node_id = %node_id, sessions = unreachable.len(), "heartbeat timeout, node offline");
            swept.push(node_id.clone());
            self.emit(ClusterChange::NodeOffline { node_id, unreachable });
        }
        swept
    }

    /// Explicit offline transition (transport closed). The cascade runs in
    /// the same write section as the status change.
    pub fn mark_offline(&self, node_id: &NodeId) -> Result<Vec<SessionId>, ClusterError> {
        let unreachable = {
            let mut inner = self.inner.write();
            if !inner.nodes.contains_key(node_id) {
                return Err(ClusterError::UnknownNode(node_id.clone()));
            }
            offline_cascade(&mut inner, node_id)
        };
        tracing::info!(node_id = %node_id, sessions = unreachable.len(), "node offline");
        self.emit(ClusterChange::NodeOffline {
            node_id: node_id.clone(),
            unreachable: unreachable.clone(),
        });
        Ok(unreachable)
    }

    /// Explicit eviction: the only way a node entry is ever destroyed.
    /// Its sessions are removed as part of the cleanup.
    pub fn deregister(&self, node_id: &NodeId) -> Result<Vec<SessionId>, ClusterError> {
        let removed_sessions = {
            let mut inner = self.inner.write();
            let node = inner
                .nodes
                .remove(node_id)
                .ok_or_else(|| ClusterError::UnknownNode(node_id.clone()))?;
            inner.identities.remove(&node.identity);
            let removed: Vec<SessionId> = inner
                .sessions
                .values()
                .filter(|s| &s.node_id == node_id)
                .map(|s| s.id.clone())
                .collect();
            for id in &removed {
                inner.sessions.remove(id);
            }
            removed
        };
        tracing::info!(node_id = %node_id, sessions = removed_sessions.len(), "node deregistered");
        self.emit(ClusterChange::NodeDeregistered {
            node_id: node_id.clone(),
            removed_sessions: removed_sessions.clone(),
        });
        Ok(removed_sessions)
    }

    pub fn get_node(&self, node_id: &NodeId) -> Result<Node, ClusterError> {
        self.inner
            .read()
            .nodes
            .get(node_id)
            .cloned()
            .ok_or_else(|| ClusterError::UnknownNode(node_id.clone()))
    }

    pub fn list_nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.inner.read().nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.identity.cmp(&b.identity));
        nodes
    }

    pub fn node_count(&self) -> usize {
        self.inner.read().nodes.len()
    }

    /// Reload durable projections at startup. Nodes come back offline and
    /// their non-terminal sessions unreachable until the workers reconnect
    /// and report; terminal sessions keep their recorded status.
    pub fn hydrate(&self, nodes: Vec<Node>, sessions: Vec<TrackedSession>) {
        let mut inner = self.inner.write();
        for mut node in nodes {
            node.status = NodeStatus::Offline;
            inner.identities.insert(node.identity.clone(), node.id.clone());
            inner.nodes.insert(node.id.clone(), node);
        }
        for mut session in sessions {
            if !session.status.is_terminal() {
                session.status = SessionStatus::Unreachable;
            }
            inner.sessions.insert(session.id.clone(), session);
        }
        tracing::info!(
            nodes = inner.nodes.len(),
            sessions = inner.sessions.len(),
            "cluster state hydrated from store"
        );
    }

    /// Resolve a project to the node currently hosting it. Only connected
    /// nodes qualify; resolution happens at dispatch time, never before.
    pub fn resolve_project(&self, project: &str) -> Option<NodeId> {
        let inner = self.inner.read();
        inner
            .nodes
            .values()
            .find(|n| n.status.is_connected() && n.hosts_project(project))
            .map(|n| n.id.clone())
    }
}

/// Must run with the write lock held: flips the node offline and forces
/// every owned non-terminal session to unreachable in the same step.
fn offline_cascade(inner: &mut ClusterInner, node_id: &NodeId) -> Vec<SessionId> {
    if let Some(node) = inner.nodes.get_mut(node_id) {
        node.status = NodeStatus::Offline;
    }
    let mut unreachable = Vec::new();
    for session in inner.sessions.values_mut() {
        if &session.node_id == node_id
            && !session.status.is_terminal()
            && session.status != SessionStatus::Unreachable
        {
            session.status = SessionStatus::Unreachable;
            unreachable.push(session.id.clone());
        }
    }
    unreachable
}
