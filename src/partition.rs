//! Partition: a replicated slice of one table.
//!
//! Each partition pairs a versioned row store with a Raft group. Reads are
//! served on the leader after a linearizability check; writes are appended
//! to the group's log and applied by the partition state machine on every
//! replica. The submitting node parks a responder in the pending-op table;
//! the applier completes it when the entry's operation settles.

pub mod applier;
pub mod command;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

use crate::raft::network::registry;
use crate::raft::LatticeRaft;
use crate::storage::store::{StoreError, VersionedRowStore};
use crate::types::{NodeId, TxId};

pub use applier::{PartitionApplier, Responder};
pub use command::{
    CodecError, Command, CommandEnvelope, CommandResponse, OpId, decode_envelope, encode_envelope,
};

/// Errors surfaced when submitting commands to a partition.
#[derive(Debug, Error)]
pub enum PartitionError {
    #[error("group {group} cannot serve linearizable reads here: {message}")]
    NotLeader { group: String, message: String },
    #[error("consensus write failed on {group}: {message}")]
    Replication { group: String, message: String },
    #[error("command response channel dropped")]
    Canceled,
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Responders for operations this node originated, keyed by op id. The
/// state machine claims a responder when it applies the matching entry;
/// replicas that did not originate the op find nothing and apply silently.
#[derive(Default)]
pub struct PendingOps {
    map: Mutex<HashMap<OpId, Responder>>,
}

impl PendingOps {
    pub fn register(&self, op_id: OpId) -> oneshot::Receiver<Result<CommandResponse, StoreError>> {
        let (sender, receiver) = oneshot::channel();
        self.map
            .lock()
            .expect("pending op table poisoned")
            .insert(op_id, sender);
        receiver
    }

    pub fn take(&self, op_id: OpId) -> Option<Responder> {
        self.map
            .lock()
            .expect("pending op table poisoned")
            .remove(&op_id)
    }

    pub fn discard(&self, op_id: OpId) {
        self.map
            .lock()
            .expect("pending op table poisoned")
            .remove(&op_id);
    }
}

/// One partition of one table hosted on this node.
pub struct Partition {
    group_id: String,
    index: u32,
    node_id: NodeId,
    raft: LatticeRaft,
    applier: Arc<PartitionApplier>,
    pending: Arc<PendingOps>,
    op_seq: AtomicU64,
}

impl Partition {
    pub fn new(
        group_id: String,
        index: u32,
        node_id: NodeId,
        raft: LatticeRaft,
        applier: Arc<PartitionApplier>,
        pending: Arc<PendingOps>,
    ) -> Self {
        Self {
            group_id,
            index,
            node_id,
            raft,
            applier,
            pending,
            op_seq: AtomicU64::new(0),
        }
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn store(&self) -> &VersionedRowStore {
        self.applier.store()
    }

    pub fn raft(&self) -> &LatticeRaft {
        &self.raft
    }

    /// Address of the group's current leader, resolved through the routing
    /// registry.
    pub async fn leader_address(&self) -> Option<String> {
        let leader = self.raft.metrics().borrow().current_leader?;
        registry().node_address(&self.group_id, leader).await
    }

    fn next_op(&self) -> OpId {
        OpId {
            node: self.node_id,
            seq: self.op_seq.fetch_add(1, Ordering::SeqCst) + 1,
        }
    }

    /// Routes one command: reads run leader-side without a log append,
    /// writes and finishes replicate through the group's log.
    pub async fn submit(
        &self,
        tx_id: TxId,
        implicit: bool,
        command: Command,
    ) -> Result<CommandResponse, PartitionError> {
        let envelope = CommandEnvelope {
            op_id: self.next_op(),
            tx_id,
            implicit,
            command,
        };

        if envelope.command.is_read() {
            if let Err(err) = self.raft.ensure_linearizable().await {
                return Err(PartitionError::NotLeader {
                    group: self.group_id.clone(),
                    message: err.to_string(),
                });
            }
            return Ok(self.applier.execute_read(&envelope).await?);
        }

        let payload = encode_envelope(&envelope)?;
        let receiver = self.pending.register(envelope.op_id);
        if let Err(err) = self.raft.client_write(payload).await {
            self.pending.discard(envelope.op_id);
            return Err(PartitionError::Replication {
                group: self.group_id.clone(),
                message: err.to_string(),
            });
        }
        match receiver.await {
            Ok(result) => Ok(result?),
            Err(_) => Err(PartitionError::Canceled),
        }
    }

    /// Replicates the commit/rollback decision for `tx_id` on this
    /// partition.
    pub async fn submit_finish(&self, tx_id: TxId, commit: bool) -> Result<(), PartitionError> {
        let command = if commit {
            Command::Commit
        } else {
            Command::Rollback
        };
        debug!(group = %self.group_id, %tx_id, commit, "submitting finish command");
        self.submit(tx_id, false, command).await.map(|_| ())
    }
}

/// Node-wide lookup from group id to hosted partition. Holds weak handles;
/// the node keeps partitions alive.
#[derive(Default)]
pub struct PartitionRegistry {
    groups: RwLock<HashMap<String, Weak<Partition>>>,
}

impl PartitionRegistry {
    pub fn register(&self, partition: &Arc<Partition>) {
        self.groups
            .write()
            .expect("partition registry poisoned")
            .insert(partition.group_id().to_string(), Arc::downgrade(partition));
    }

    pub fn get(&self, group_id: &str) -> Option<Arc<Partition>> {
        self.groups
            .read()
            .expect("partition registry poisoned")
            .get(group_id)
            .and_then(Weak::upgrade)
    }

    pub fn unregister(&self, group_id: &str) {
        self.groups
            .write()
            .expect("partition registry poisoned")
            .remove(group_id);
    }
}
