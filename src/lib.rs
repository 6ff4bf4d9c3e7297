//! Core crate exports for LatticeDB.
//!
//! The modules exposed here define the boundaries between the lock manager,
//! the versioned row store, transaction coordination, partition state
//! machines, Raft replication, and the RPC surface.

pub mod client;
pub mod config;
pub mod node;
pub mod partition;
pub mod raft;
pub mod rpc;
pub mod storage;
pub mod table;
pub mod tx;
pub mod types;

pub use client::{ClientConfig, ClientError, ClientTable, ClientTransaction, LatticeClient};
pub use config::LatticeConfig;
pub use node::{LatticeNode, NodeError, Transactions};
pub use partition::{
    Command, CommandEnvelope, CommandResponse, OpId, Partition, PartitionApplier, PartitionError,
    PartitionRegistry, PendingOps,
};
pub use raft::{
    LatticeNetworkFactory, LatticeRaft, LatticeRaftConfig, LatticeStateMachine, LatticeStore,
    collect_metrics, default_raft_config, registry, reset_registry,
};
pub use rpc::server::LatticeKvService;
pub use rpc::service::lattice_kv_client::LatticeKvClient;
pub use rpc::service::lattice_kv_server::{LatticeKv, LatticeKvServer};
pub use storage::{
    MemoryRowStorage, RowStorage, SnapshotError, SnapshotHeader, StoreContents, StoreError,
    VersionedRowStore, decode_snapshot, encode_snapshot,
};
pub use table::{Table, TableError, TxTable};
pub use tx::{
    FinishDispatcher, LockError, LockManager, TxContext, TxError, TxFinishRequest, TxManager,
    TxState, WaiterView,
};
pub use types::{Key, NodeId, Row, TxId, Value, affinity_partition, partition_group_id};
