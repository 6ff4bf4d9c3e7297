//! Node composition: configuration, transaction manager, hosted tables.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use openraft::BasicNode;
use thiserror::Error;
use tracing::info;

use crate::config::LatticeConfig;
use crate::partition::{Partition, PartitionApplier, PartitionRegistry, PendingOps};
use crate::raft::{
    LatticeNetworkFactory, LatticeStore, PersistenceError, default_raft_config, registry,
};
use crate::storage::memory::MemoryRowStorage;
use crate::storage::store::VersionedRowStore;
use crate::table::Table;
use crate::tx::context::TxContext;
use crate::tx::lock::LockManager;
use crate::tx::manager::{FinishDispatcher, TxError, TxFinishRequest, TxManager};
use crate::types::{NodeId, partition_group_id};

/// Process-wide address → transaction manager directory, letting in-process
/// nodes deliver finish requests to each other without sockets.
static NODE_DIRECTORY: Lazy<RwLock<HashMap<String, Weak<TxManager>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

fn register_node(address: &str, manager: &Arc<TxManager>) {
    NODE_DIRECTORY
        .write()
        .expect("node directory poisoned")
        .insert(address.to_string(), Arc::downgrade(manager));
}

fn lookup_node(address: &str) -> Option<Arc<TxManager>> {
    NODE_DIRECTORY
        .read()
        .expect("node directory poisoned")
        .get(address)
        .and_then(Weak::upgrade)
}

/// Delivers finish requests through the in-process node directory.
struct LoopbackDispatcher;

#[async_trait]
impl FinishDispatcher for LoopbackDispatcher {
    async fn dispatch(&self, target: &str, request: TxFinishRequest) -> Result<(), TxError> {
        let manager =
            lookup_node(target).ok_or_else(|| TxError::Unreachable(target.to_string()))?;
        manager.handle_finish(request).await.map(|_| ())
    }
}

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("raft bootstrap failed for {group}: {message}")]
    Raft { group: String, message: String },
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("table {0} already exists")]
    TableExists(String),
}

struct NodeShared {
    config: LatticeConfig,
    locks: Arc<LockManager>,
    tx_manager: Arc<TxManager>,
    partitions: Arc<PartitionRegistry>,
    tables: RwLock<HashMap<String, Table>>,
    hosted: Mutex<Vec<Arc<Partition>>>,
}

/// A node hosting partitioned tables; clones share the same node.
#[derive(Clone)]
pub struct LatticeNode {
    inner: Arc<NodeShared>,
}

impl LatticeNode {
    pub async fn start(config: LatticeConfig) -> Result<Self, NodeError> {
        let locks = Arc::new(LockManager::new());
        let partitions = Arc::new(PartitionRegistry::default());
        let tx_manager = Arc::new(TxManager::new(
            config.node_id,
            config.listen_addr.clone(),
            partitions.clone(),
        ));
        tx_manager.set_dispatcher(Arc::new(LoopbackDispatcher));
        register_node(&config.listen_addr, &tx_manager);

        info!(node_id = config.node_id, addr = %config.listen_addr, "node started");
        Ok(Self {
            inner: Arc::new(NodeShared {
                config,
                locks,
                tx_manager,
                partitions,
                tables: RwLock::new(HashMap::new()),
                hosted: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn config(&self) -> &LatticeConfig {
        &self.inner.config
    }

    pub fn tx_manager(&self) -> &Arc<TxManager> {
        &self.inner.tx_manager
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.inner.locks
    }

    /// Starts an explicit transaction on this node.
    pub fn begin(&self) -> TxContext {
        self.inner.tx_manager.begin()
    }

    pub fn transactions(&self) -> Transactions {
        Transactions {
            manager: self.inner.tx_manager.clone(),
        }
    }

    /// Hosted partition for a group id, if this node carries it.
    pub fn partition(&self, group_id: &str) -> Option<Arc<Partition>> {
        self.inner.partitions.get(group_id)
    }

    pub fn table(&self, name: &str) -> Option<Table> {
        self.inner
            .tables
            .read()
            .expect("table map poisoned")
            .get(name)
            .cloned()
    }

    /// Creates a table hosted entirely on this node, with single-member
    /// partition groups.
    pub async fn create_table(&self, name: &str) -> Result<Table, NodeError> {
        let mut members = BTreeMap::new();
        members.insert(
            self.inner.config.node_id,
            self.inner.config.listen_addr.clone(),
        );
        self.host_table(name, members, true).await
    }

    /// Hosts this node's replicas of a table whose partition groups span
    /// `members`. Every member must call this; `initialize` is passed as
    /// true on exactly one of them to bootstrap the groups.
    pub async fn host_table(
        &self,
        name: &str,
        members: BTreeMap<NodeId, String>,
        initialize: bool,
    ) -> Result<Table, NodeError> {
        if self
            .inner
            .tables
            .read()
            .expect("table map poisoned")
            .contains_key(name)
        {
            return Err(NodeError::TableExists(name.to_string()));
        }

        let config = &self.inner.config;
        let member_nodes: BTreeMap<u64, BasicNode> = members
            .iter()
            .map(|(id, addr)| (*id, BasicNode::new(addr.clone())))
            .collect();

        let mut hosted = Vec::new();
        for index in 0..config.partition_count_per_table {
            let group = partition_group_id(name, index);
            let store = VersionedRowStore::new(
                group.clone(),
                Arc::new(MemoryRowStorage::new()),
                self.inner.locks.clone(),
                self.inner.tx_manager.clone(),
            );
            let applier = Arc::new(PartitionApplier::new(store.clone()));
            let pending = Arc::new(PendingOps::default());
            let data_dir = config
                .data_dir
                .as_ref()
                .map(|dir| dir.join(format!("{group}-n{}", config.node_id)));

            let (log_store, state_machine) =
                LatticeStore::handles(applier.clone(), pending.clone(), store, index, data_dir)
                    .await?;
            let network = LatticeNetworkFactory::new(group.clone(), registry());
            let raft = openraft::Raft::new(
                config.node_id,
                default_raft_config(),
                network,
                log_store,
                state_machine,
            )
            .await
            .map_err(|err| NodeError::Raft {
                group: group.clone(),
                message: err.to_string(),
            })?;

            registry()
                .register(
                    &group,
                    config.node_id,
                    raft.clone(),
                    BasicNode::new(config.listen_addr.clone()),
                )
                .await;

            if initialize {
                let initialized = raft.is_initialized().await.map_err(|err| NodeError::Raft {
                    group: group.clone(),
                    message: err.to_string(),
                })?;
                if !initialized {
                    raft.initialize(member_nodes.clone())
                        .await
                        .map_err(|err| NodeError::Raft {
                            group: group.clone(),
                            message: err.to_string(),
                        })?;
                }
                // Commands are accepted only once the group has a leader.
                raft.wait(Some(Duration::from_secs(10)))
                    .metrics(|metrics| metrics.current_leader.is_some(), "leader elected")
                    .await
                    .map_err(|err| NodeError::Raft {
                        group: group.clone(),
                        message: err.to_string(),
                    })?;
            }

            let partition = Arc::new(Partition::new(
                group,
                index,
                config.node_id,
                raft,
                applier,
                pending,
            ));
            self.inner.partitions.register(&partition);
            hosted.push(partition);
        }

        let table = Table::new(
            name,
            hosted.clone(),
            self.inner.tx_manager.clone(),
            config.listen_addr.clone(),
            Duration::from_millis(config.default_query_timeout_ms),
        );
        self.inner
            .hosted
            .lock()
            .expect("hosted partition list poisoned")
            .extend(hosted);
        self.inner
            .tables
            .write()
            .expect("table map poisoned")
            .insert(name.to_string(), table.clone());
        Ok(table)
    }

    /// Removes this node's partitions from the routing registries. Used by
    /// restart tests before bringing the node back with the same address.
    pub async fn shutdown(&self) {
        let hosted: Vec<Arc<Partition>> = self
            .inner
            .hosted
            .lock()
            .expect("hosted partition list poisoned")
            .drain(..)
            .collect();
        for partition in hosted {
            registry()
                .unregister(partition.group_id(), self.inner.config.node_id)
                .await;
            self.inner.partitions.unregister(partition.group_id());
        }
        self.inner
            .tables
            .write()
            .expect("table map poisoned")
            .clear();
    }
}

/// Entry point for beginning transactions, mirroring the table API's
/// optional-context surface.
pub struct Transactions {
    manager: Arc<TxManager>,
}

impl Transactions {
    pub fn begin(&self) -> TxContext {
        self.manager.begin()
    }

    pub async fn begin_async(&self) -> TxContext {
        self.manager.begin()
    }
}
