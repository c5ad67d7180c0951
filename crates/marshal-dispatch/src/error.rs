use marshal_cluster::ClusterError;
use marshal_core::command::ValidationError;
use marshal_core::ids::{CommandId, NodeId};
use marshal_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("no online node hosts project: {0}")]
    NoNodeForProject(String),

    #[error("node {0} has no live transport")]
    NoTransport(NodeId),

    #[error("transport to node {0} closed mid-dispatch")]
    TransportClosed(NodeId),

    #[error("idempotency key {key} already in flight as {command_id}")]
    DuplicateInFlight { key: String, command_id: CommandId },

    #[error("dispatch of {0} cancelled before a result arrived")]
    Cancelled(CommandId),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl DispatchError {
    /// Whether a caller may retry the same request verbatim. Validation
    /// failures and in-flight duplicates never are; routing and transport
    /// failures are, once the fleet recovers.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NoNodeForProject(_)
                | Self::NoTransport(_)
                | Self::TransportClosed(_)
                | Self::Cancelled(_)
        )
    }
}
