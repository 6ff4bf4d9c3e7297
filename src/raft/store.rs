use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::partition::{PartitionApplier, PendingOps, decode_envelope};
use crate::storage::snapshot::decode_snapshot;
use crate::storage::store::VersionedRowStore;

mod state;
mod state_machine;

pub use self::state::{PartitionLogStore, PersistenceError};
pub use self::state_machine::{LatticeSnapshotBuilder, LatticeStateMachine};

use self::state::GroupState;

pub struct LatticeStore;

impl LatticeStore {
    /// Builds the log-store and state-machine handles for one partition
    /// group. When a data dir is configured, persisted state is restored:
    /// the newest snapshot is installed into the row store and the applied
    /// command tail is replayed through the applier.
    pub async fn handles(
        applier: Arc<PartitionApplier>,
        pending: Arc<PendingOps>,
        store: VersionedRowStore,
        partition_id: u32,
        data_dir: Option<PathBuf>,
    ) -> Result<(PartitionLogStore, LatticeStateMachine), PersistenceError> {
        let state = GroupState::load(data_dir)?;

        if let Some(stored) = &state.data.snapshot {
            let (_, contents) = decode_snapshot(&stored.data)?;
            for record in &contents.pending {
                store.tx_manager().observe(record.tx_id);
            }
            store.import(contents);
        }
        for bytes in &state.data.applied_commands {
            let envelope = decode_envelope(bytes)?;
            // Replayed ids must never be reissued by this node's clock.
            store.tx_manager().observe(envelope.tx_id);
            applier.apply(envelope, None);
        }

        let state = Arc::new(RwLock::new(state));
        Ok((
            PartitionLogStore::new(state.clone()),
            LatticeStateMachine {
                state,
                applier,
                pending,
                store,
                partition_id,
            },
        ))
    }
}
