use std::io::Cursor;
use std::sync::Arc;

use openraft::storage::{RaftSnapshotBuilder, RaftStateMachine};
use openraft::{
    BasicNode, Entry, EntryPayload, LogId, OptionalSend, Snapshot, SnapshotMeta,
    StorageError as RaftStorageError, StorageIOError, StoredMembership,
};
use tokio::sync::RwLock;

use crate::partition::{PartitionApplier, PendingOps, decode_envelope};
use crate::raft::LatticeRaftConfig;
use crate::storage::snapshot::{SnapshotHeader, decode_snapshot, encode_snapshot};
use crate::storage::store::VersionedRowStore;

use super::state::{GroupState, StoredSnapshot};

/// Partition state machine: hands committed command envelopes to the
/// applier, keeps the applied command tail for restart replay, and turns the
/// row store's contents into snapshots.
#[derive(Clone)]
pub struct LatticeStateMachine {
    pub(super) state: Arc<RwLock<GroupState>>,
    pub(super) applier: Arc<PartitionApplier>,
    pub(super) pending: Arc<PendingOps>,
    pub(super) store: VersionedRowStore,
    pub(super) partition_id: u32,
}

pub struct LatticeSnapshotBuilder {
    pub(super) state: Arc<RwLock<GroupState>>,
    pub(super) store: VersionedRowStore,
    pub(super) partition_id: u32,
}

impl RaftStateMachine<LatticeRaftConfig> for LatticeStateMachine {
    type SnapshotBuilder = LatticeSnapshotBuilder;

    async fn applied_state(
        &mut self,
    ) -> Result<(Option<LogId<u64>>, StoredMembership<u64, BasicNode>), RaftStorageError<u64>> {
        let state = self.state.read().await;
        Ok((state.data.last_applied, state.data.last_membership.clone()))
    }

    async fn apply<I>(&mut self, entries: I) -> Result<Vec<()>, RaftStorageError<u64>>
    where
        I: IntoIterator<Item = Entry<LatticeRaftConfig>> + OptionalSend,
        I::IntoIter: OptionalSend,
    {
        let mut responses = Vec::new();

        for entry in entries {
            let log_id = entry.log_id;

            match entry.payload {
                EntryPayload::Blank => {
                    let mut state = self.state.write().await;
                    state.data.last_applied = Some(log_id);
                    state.save().map_err(|err| RaftStorageError::IO {
                        source: StorageIOError::apply(log_id, &err),
                    })?;
                }
                EntryPayload::Normal(data) => {
                    let envelope = decode_envelope(&data)
                        .map_err(|err| map_apply_error(log_id, err.to_string()))?;
                    // The applier must not block this task; it enqueues the
                    // command's lock waiters and finishes staging on its own.
                    let responder = self.pending.take(envelope.op_id);
                    self.applier.apply(envelope, responder);

                    let mut state = self.state.write().await;
                    state.data.last_applied = Some(log_id);
                    state.data.applied_commands.push(data);
                    state.save().map_err(|err| RaftStorageError::IO {
                        source: StorageIOError::apply(log_id, &err),
                    })?;
                }
                EntryPayload::Membership(membership) => {
                    let mut state = self.state.write().await;
                    state.data.last_membership = StoredMembership::new(Some(log_id), membership);
                    state.data.last_applied = Some(log_id);
                    state.save().map_err(|err| RaftStorageError::IO {
                        source: StorageIOError::apply(log_id, &err),
                    })?;
                }
            }

            responses.push(());
        }

        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        LatticeSnapshotBuilder {
            state: self.state.clone(),
            store: self.store.clone(),
            partition_id: self.partition_id,
        }
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<
        Box<<LatticeRaftConfig as openraft::RaftTypeConfig>::SnapshotData>,
        RaftStorageError<u64>,
    > {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<u64, BasicNode>,
        snapshot: Box<<LatticeRaftConfig as openraft::RaftTypeConfig>::SnapshotData>,
    ) -> Result<(), RaftStorageError<u64>> {
        let data = snapshot.into_inner();
        let (_, contents) = decode_snapshot(&data).map_err(|err| RaftStorageError::IO {
            source: StorageIOError::write_snapshot(None, &err),
        })?;
        // Discard in-memory state before loading the stream.
        self.store.import(contents);

        let mut state = self.state.write().await;
        state.data.snapshot = Some(StoredSnapshot {
            meta: meta.clone(),
            data,
        });
        state.data.last_applied = meta.last_log_id;
        state.data.last_membership = meta.last_membership.clone();
        state.data.applied_commands.clear();
        state.save().map_err(|err| RaftStorageError::IO {
            source: StorageIOError::write_snapshot(None, &err),
        })?;
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<LatticeRaftConfig>>, RaftStorageError<u64>> {
        let state = self.state.read().await;
        Ok(state.data.snapshot.as_ref().map(|stored| Snapshot {
            meta: stored.meta.clone(),
            snapshot: Box::new(Cursor::new(stored.data.clone())),
        }))
    }
}

impl RaftSnapshotBuilder<LatticeRaftConfig> for LatticeSnapshotBuilder {
    async fn build_snapshot(&mut self) -> Result<Snapshot<LatticeRaftConfig>, RaftStorageError<u64>> {
        let mut state = self.state.write().await;
        state.data.snapshot_seq += 1;
        let snapshot_id = format!("lattice-snapshot-{}", state.data.snapshot_seq);
        let meta = SnapshotMeta {
            last_log_id: state.data.last_applied,
            last_membership: state.data.last_membership.clone(),
            snapshot_id,
        };

        let header = SnapshotHeader {
            partition_id: self.partition_id,
            last_applied_index: state
                .data
                .last_applied
                .map(|log_id| log_id.index)
                .unwrap_or(0),
        };
        let data = encode_snapshot(header, &self.store.export());

        state.data.snapshot = Some(StoredSnapshot {
            meta: meta.clone(),
            data: data.clone(),
        });
        // The snapshot covers the applied tail.
        state.data.applied_commands.clear();
        state.save().map_err(|err| RaftStorageError::IO {
            source: StorageIOError::write_snapshot(None, &err),
        })?;
        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

fn map_apply_error(log_id: LogId<u64>, message: impl Into<String>) -> RaftStorageError<u64> {
    let io_error = std::io::Error::other(message.into());
    RaftStorageError::IO {
        source: StorageIOError::apply(log_id, &io_error),
    }
}
