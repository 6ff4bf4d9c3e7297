//! Durable per-group state and the log storage built on it.
//!
//! Everything one partition group must remember across restarts lives in a
//! single [`GroupState`]: vote, log entries keyed by index, the applied
//! command tail, and the newest snapshot. The log store and the state
//! machine share it behind one lock, and every mutation is written out as
//! one atomic file replace, so a crash leaves either the old state or the
//! new one, never a mix.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::fs;
use std::ops::RangeBounds;
use std::path::PathBuf;
use std::sync::Arc;

use openraft::storage::{LogFlushed, RaftLogReader, RaftLogStorage};
use openraft::{
    BasicNode, Entry, LogId, LogState, OptionalSend, SnapshotMeta,
    StorageError as RaftStorageError, StorageIOError, StoredMembership, Vote,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::partition::CodecError;
use crate::raft::LatticeRaftConfig;
use crate::storage::snapshot::SnapshotError;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Complete durable state of one partition group member.
#[derive(Clone, Default, Serialize, Deserialize)]
pub(crate) struct GroupStateData {
    pub(crate) vote: Option<Vote<u64>>,
    pub(crate) committed: Option<LogId<u64>>,
    /// Log entries keyed by index; reappending an index supersedes it and
    /// its whole suffix.
    pub(crate) log: BTreeMap<u64, Entry<LatticeRaftConfig>>,
    pub(crate) last_purged: Option<LogId<u64>>,
    pub(crate) last_applied: Option<LogId<u64>>,
    pub(crate) last_membership: StoredMembership<u64, BasicNode>,
    /// Command payloads applied since the last snapshot, replayed through
    /// the applier on restart.
    pub(crate) applied_commands: Vec<Vec<u8>>,
    pub(crate) snapshot: Option<StoredSnapshot>,
    pub(crate) snapshot_seq: u64,
}

#[derive(Clone, Serialize, Deserialize)]
pub(crate) struct StoredSnapshot {
    pub(crate) meta: SnapshotMeta<u64, BasicNode>,
    pub(crate) data: Vec<u8>,
}

/// Group state plus its optional backing file. Without a data dir the
/// state is volatile and `save` is a no-op.
pub(crate) struct GroupState {
    pub(crate) data: GroupStateData,
    state_path: Option<PathBuf>,
}

impl GroupState {
    pub(crate) fn load(data_dir: Option<PathBuf>) -> Result<Self, PersistenceError> {
        let Some(dir) = data_dir else {
            return Ok(Self {
                data: GroupStateData::default(),
                state_path: None,
            });
        };
        fs::create_dir_all(&dir)?;
        let path = dir.join("group_state.json");
        let data = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => GroupStateData::default(),
            Err(err) => return Err(PersistenceError::Io(err)),
        };
        Ok(Self {
            data,
            state_path: Some(path),
        })
    }

    /// Writes the whole group state as one atomic file replace.
    pub(crate) fn save(&self) -> Result<(), PersistenceError> {
        let Some(path) = &self.state_path else {
            return Ok(());
        };
        let serialized = serde_json::to_vec(&self.data)?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, serialized)?;
        fs::rename(tmp, path)?;
        Ok(())
    }

    pub(crate) fn last_log_id(&self) -> Option<LogId<u64>> {
        self.data
            .log
            .values()
            .next_back()
            .map(|entry| entry.log_id)
            .or(self.data.last_purged)
    }
}

/// Raft log storage for one partition group. Reader and writer are the same
/// handle; clones share the group state.
#[derive(Clone)]
pub struct PartitionLogStore {
    state: Arc<RwLock<GroupState>>,
}

impl PartitionLogStore {
    pub(crate) fn new(state: Arc<RwLock<GroupState>>) -> Self {
        Self { state }
    }
}

fn log_io(err: PersistenceError) -> RaftStorageError<u64> {
    RaftStorageError::IO {
        source: StorageIOError::write_logs(&err),
    }
}

fn vote_io(err: PersistenceError) -> RaftStorageError<u64> {
    RaftStorageError::IO {
        source: StorageIOError::write_vote(&err),
    }
}

impl RaftLogReader<LatticeRaftConfig> for PartitionLogStore {
    async fn try_get_log_entries<RB>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<LatticeRaftConfig>>, RaftStorageError<u64>>
    where
        RB: RangeBounds<u64> + Clone + Debug + OptionalSend,
    {
        let state = self.state.read().await;
        Ok(state
            .data
            .log
            .range(range)
            .map(|(_, entry)| entry.clone())
            .collect())
    }
}

impl RaftLogStorage<LatticeRaftConfig> for PartitionLogStore {
    type LogReader = Self;

    async fn get_log_state(&mut self) -> Result<LogState<LatticeRaftConfig>, RaftStorageError<u64>> {
        let state = self.state.read().await;
        Ok(LogState {
            last_purged_log_id: state.data.last_purged,
            last_log_id: state.last_log_id(),
        })
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }

    async fn save_vote(&mut self, vote: &Vote<u64>) -> Result<(), RaftStorageError<u64>> {
        let mut state = self.state.write().await;
        state.data.vote = Some(*vote);
        state.save().map_err(vote_io)
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<u64>>, RaftStorageError<u64>> {
        Ok(self.state.read().await.data.vote)
    }

    async fn save_committed(
        &mut self,
        committed: Option<LogId<u64>>,
    ) -> Result<(), RaftStorageError<u64>> {
        let mut state = self.state.write().await;
        state.data.committed = committed;
        state.save().map_err(log_io)
    }

    async fn read_committed(&mut self) -> Result<Option<LogId<u64>>, RaftStorageError<u64>> {
        Ok(self.state.read().await.data.committed)
    }

    async fn append<I>(
        &mut self,
        entries: I,
        callback: LogFlushed<LatticeRaftConfig>,
    ) -> Result<(), RaftStorageError<u64>>
    where
        I: IntoIterator<Item = Entry<LatticeRaftConfig>> + OptionalSend,
        I::IntoIter: OptionalSend,
    {
        let mut state = self.state.write().await;
        for entry in entries {
            let index = entry.log_id.index;
            // Reappend at an existing index replaces that suffix.
            state.data.log.split_off(&index);
            state.data.log.insert(index, entry);
        }
        state.save().map_err(log_io)?;
        callback.log_io_completed(Ok(()));
        Ok(())
    }

    async fn truncate(&mut self, log_id: LogId<u64>) -> Result<(), RaftStorageError<u64>> {
        let mut state = self.state.write().await;
        state.data.log.split_off(&log_id.index);
        state.save().map_err(log_io)
    }

    async fn purge(&mut self, log_id: LogId<u64>) -> Result<(), RaftStorageError<u64>> {
        let mut state = self.state.write().await;
        state.data.log = state.data.log.split_off(&(log_id.index + 1));
        state.data.last_purged = Some(log_id);
        state.save().map_err(log_io)
    }
}
