//! The live view of the fleet: node registry with heartbeat-based failure
//! detection and the cross-node session tracker. Both live behind one
//! writer-serialized state so the offline cascade is atomic with respect
//! to every reader.

mod cluster;
mod error;
mod node;
mod session;
mod sweep;
mod tracker;

pub use cluster::{Cluster, ClusterChange};
pub use error::ClusterError;
pub use node::Node;
pub use session::{SessionFilter, TrackedSession};
pub use sweep::spawn_sweeper;
