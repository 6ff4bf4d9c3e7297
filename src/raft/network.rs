use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use tokio::sync::RwLock;

use openraft::BasicNode;
use openraft::error::{
    Infallible, InstallSnapshotError, RPCError, RaftError, RemoteError, Unreachable,
};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};

use super::{LatticeRaft, LatticeRaftConfig};

/// Shared singleton routing table forwarding Raft RPCs between in-process
/// group members. Keyed by (group id, node id) so every partition group has
/// its own namespace.
static GLOBAL_REGISTRY: Lazy<Arc<GroupRegistry>> = Lazy::new(|| Arc::new(GroupRegistry::default()));

/// Expose the global registry so node construction can share the same
/// routing table.
pub fn registry() -> Arc<GroupRegistry> {
    GLOBAL_REGISTRY.clone()
}

/// Helper to wipe the registry between integration tests.
pub async fn reset_registry() {
    GLOBAL_REGISTRY.clear().await;
}

/// Representation of a group member registered with the in-memory router.
#[derive(Clone)]
pub(crate) struct NodeEntry {
    pub(crate) raft: Option<LatticeRaft>,
    pub(crate) node: Option<BasicNode>,
}

impl NodeEntry {
    fn new(raft: Option<LatticeRaft>, node: Option<BasicNode>) -> Self {
        Self { raft, node }
    }
}

#[derive(Default)]
pub struct GroupRegistry {
    nodes: RwLock<HashMap<(String, u64), NodeEntry>>,
}

impl GroupRegistry {
    pub async fn register(&self, group: &str, node_id: u64, raft: LatticeRaft, node: BasicNode) {
        self.nodes
            .write()
            .await
            .insert((group.to_string(), node_id), NodeEntry::new(Some(raft), Some(node)));
    }

    pub async fn unregister(&self, group: &str, node_id: u64) {
        self.nodes
            .write()
            .await
            .remove(&(group.to_string(), node_id));
    }

    pub async fn set_node_info(&self, group: &str, node_id: u64, node: BasicNode) {
        let mut guard = self.nodes.write().await;
        guard
            .entry((group.to_string(), node_id))
            .and_modify(|entry| entry.node = Some(node.clone()))
            .or_insert_with(|| NodeEntry::new(None, Some(node)));
    }

    pub(crate) async fn get(&self, group: &str, node_id: u64) -> Option<NodeEntry> {
        self.nodes
            .read()
            .await
            .get(&(group.to_string(), node_id))
            .cloned()
    }

    /// Advertised address of one group member, if known.
    pub async fn node_address(&self, group: &str, node_id: u64) -> Option<String> {
        self.get(group, node_id)
            .await
            .and_then(|entry| entry.node.map(|node| node.addr))
    }

    pub async fn clear(&self) {
        self.nodes.write().await.clear();
    }
}

/// Network factory handing out client transports backed by the in-memory
/// registry; one factory per partition group.
#[derive(Clone)]
pub struct LatticeNetworkFactory {
    group: String,
    registry: Arc<GroupRegistry>,
}

impl LatticeNetworkFactory {
    pub fn new(group: impl Into<String>, registry: Arc<GroupRegistry>) -> Self {
        Self {
            group: group.into(),
            registry,
        }
    }
}

#[derive(Clone)]
pub struct LatticeNetwork {
    group: String,
    registry: Arc<GroupRegistry>,
    target: u64,
}

impl RaftNetworkFactory<LatticeRaftConfig> for LatticeNetworkFactory {
    type Network = LatticeNetwork;

    async fn new_client(&mut self, target: u64, node: &BasicNode) -> Self::Network {
        self.registry
            .set_node_info(&self.group, target, node.clone())
            .await;
        LatticeNetwork {
            group: self.group.clone(),
            registry: self.registry.clone(),
            target,
        }
    }
}

impl RaftNetwork<LatticeRaftConfig> for LatticeNetwork {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<LatticeRaftConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<u64>, RPCError<u64, BasicNode, RaftError<u64>>> {
        let entry = self
            .registry
            .get(&self.group, self.target)
            .await
            .ok_or_else(|| unreachable_error::<Infallible>(&self.group, self.target))?;
        let node_info = entry.node.clone();
        let raft = entry
            .raft
            .clone()
            .ok_or_else(|| unreachable_error::<Infallible>(&self.group, self.target))?;

        match raft.append_entries(rpc).await {
            Ok(resp) => Ok(resp),
            Err(err) => {
                let remote = match node_info {
                    Some(node) => RemoteError::new_with_node(self.target, node, err),
                    None => RemoteError::new(self.target, err),
                };
                Err(RPCError::from(remote))
            }
        }
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<LatticeRaftConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<u64>,
        RPCError<u64, BasicNode, RaftError<u64, InstallSnapshotError>>,
    > {
        let entry = self
            .registry
            .get(&self.group, self.target)
            .await
            .ok_or_else(|| unreachable_error::<InstallSnapshotError>(&self.group, self.target))?;
        let node_info = entry.node.clone();
        let raft = entry
            .raft
            .clone()
            .ok_or_else(|| unreachable_error::<InstallSnapshotError>(&self.group, self.target))?;

        match raft.install_snapshot(rpc).await {
            Ok(resp) => Ok(resp),
            Err(err) => {
                let remote = match node_info {
                    Some(node) => RemoteError::new_with_node(self.target, node, err),
                    None => RemoteError::new(self.target, err),
                };
                Err(RPCError::from(remote))
            }
        }
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<u64>,
        _option: RPCOption,
    ) -> Result<VoteResponse<u64>, RPCError<u64, BasicNode, RaftError<u64>>> {
        let entry = self
            .registry
            .get(&self.group, self.target)
            .await
            .ok_or_else(|| unreachable_error::<Infallible>(&self.group, self.target))?;
        let node_info = entry.node.clone();
        let raft = entry
            .raft
            .clone()
            .ok_or_else(|| unreachable_error::<Infallible>(&self.group, self.target))?;

        match raft.vote(rpc).await {
            Ok(resp) => Ok(resp),
            Err(err) => {
                let remote = match node_info {
                    Some(node) => RemoteError::new_with_node(self.target, node, err),
                    None => RemoteError::new(self.target, err),
                };
                Err(RPCError::from(remote))
            }
        }
    }
}

/// Build an `Unreachable` error for missing peers.
fn unreachable_error<E>(group: &str, target: u64) -> RPCError<u64, BasicNode, RaftError<u64, E>>
where
    E: std::error::Error + Send + Sync + 'static,
{
    let err = std::io::Error::new(
        std::io::ErrorKind::NotFound,
        format!("Raft peer {target} of group {group} is not registered"),
    );
    RPCError::Unreachable(Unreachable::new(&err))
}
