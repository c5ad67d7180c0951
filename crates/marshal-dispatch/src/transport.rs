use dashmap::DashMap;
use tokio::sync::mpsc;

use marshal_core::ids::NodeId;
use marshal_core::wire::ServerFrame;

use crate::error::DispatchError;

/// Live outbound channels, one per connected worker. The server attaches a
/// sender when a socket finishes its handshake and detaches it on close; a
/// reconnect simply replaces the entry.
#[derive(Default)]
pub struct TransportRegistry {
    senders: DashMap<NodeId, mpsc::Sender<ServerFrame>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, node_id: NodeId, sender: mpsc::Sender<ServerFrame>) {
        if self.senders.insert(node_id.clone(), sender).is_some() {
            tracing::debug!(node_id = %node_id, "replaced existing transport");
        }
    }

    /// Detach only if `sender` is still the registered one, so a stale
    /// close racing a reconnect cannot tear down the fresh transport.
    /// Returns whether anything was removed.
    pub fn detach(&self, node_id: &NodeId, sender: &mpsc::Sender<ServerFrame>) -> bool {
        self.senders
            .remove_if(node_id, |_, current| current.same_channel(sender))
            .is_some()
    }

    pub fn is_attached(&self, node_id: &NodeId) -> bool {
        self.senders.contains_key(node_id)
    }

    pub async fn send(&self, node_id: &NodeId, frame: ServerFrame) -> Result<(), DispatchError> {
        let sender = self
            .senders
            .get(node_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| DispatchError::NoTransport(node_id.clone()))?;
        sender
            .send(frame)
            .await
            .map_err(|_| DispatchError::TransportClosed(node_id.clone()))
    }
}
