use marshal_core::ids::{NodeId, SessionId};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClusterError {
    #[error("unknown node: {0}")]
    UnknownNode(NodeId),

    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("duplicate session {session_id} on node {node_id}")]
    DuplicateSession {
        node_id: NodeId,
        session_id: SessionId,
    },

    #[error("unreachable is derived from node liveness and cannot be set directly")]
    DerivedStatus,
}
