//! Openraft integration for partition replication groups.

pub mod network;
pub mod store;

use std::io::Cursor;
use std::sync::Arc;

use openraft::metrics::RaftMetrics;
use openraft::{BasicNode, Config};

pub use network::{GroupRegistry, LatticeNetworkFactory, registry, reset_registry};
pub use store::{
    LatticeSnapshotBuilder, LatticeStateMachine, LatticeStore, PartitionLogStore, PersistenceError,
};

openraft::declare_raft_types!(
    /// Openraft type configuration for partition groups.
    ///
    /// Log payloads are JSON-encoded command envelopes. Responses do not
    /// travel on the log; the node that originated a command claims its
    /// result from the pending-op table when the entry applies.
    pub LatticeRaftConfig:
        D = Vec<u8>,
        R = (),
);

/// Convenience alias for the Openraft handle parameterised with
/// [`LatticeRaftConfig`].
pub type LatticeRaft = openraft::Raft<LatticeRaftConfig>;

/// Build a default Openraft configuration tuned for in-process partition
/// groups.
pub fn default_raft_config() -> Arc<Config> {
    let config = Config {
        enable_tick: true,
        ..Config::default()
    };
    Arc::new(
        config
            .validate()
            .expect("default Raft config should validate"),
    )
}

/// Surface Raft metrics for one group member, for debugging and tests.
pub async fn collect_metrics(group_id: &str, node_id: u64) -> Option<RaftMetrics<u64, BasicNode>> {
    registry().get(group_id, node_id).await.and_then(|entry| {
        entry
            .raft
            .as_ref()
            .map(|raft| raft.metrics().borrow().clone())
    })
}
