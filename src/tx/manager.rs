//! Transaction timestamps, state tracking, and finish fan-out.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::partition::PartitionRegistry;
use crate::tx::context::TxContext;
use crate::types::{NodeId, TxId};

/// How many finished transactions keep their terminal state queryable.
/// Beyond this window a late `state()` lookup returns `None`.
const RETAINED_TERMINAL_STATES: usize = 8192;

/// Lifecycle of a transaction. `Pending` is entered implicitly when the
/// timestamp is issued; the terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxState {
    Pending,
    Committed,
    Aborted,
}

impl TxState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TxState::Committed | TxState::Aborted)
    }
}

/// Commit/rollback fan-out message sent to every enlisted node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxFinishRequest {
    pub tx_id: TxId,
    pub commit: bool,
    pub partitions: BTreeSet<String>,
}

/// Errors surfaced by transaction coordination.
#[derive(Debug, Error)]
pub enum TxError {
    #[error("transaction {0} is already aborted")]
    Aborted(TxId),
    #[error("no route to node {0}")]
    Unreachable(String),
    #[error("finish failed on partition {partition}: {message}")]
    Finish { partition: String, message: String },
    #[error("remote finish failed on {target}: {message}")]
    Remote { target: String, message: String },
}

/// Transport used to deliver [`TxFinishRequest`]s to other nodes.
#[async_trait]
pub trait FinishDispatcher: Send + Sync {
    async fn dispatch(&self, target: &str, request: TxFinishRequest) -> Result<(), TxError>;
}

struct StateTable {
    states: HashMap<TxId, TxState>,
    terminal: VecDeque<TxId>,
}

/// Issues transaction timestamps and owns the node-global TxId → TxState
/// map. Also drives the finish protocol: local partitions get `Commit` /
/// `Rollback` commands through their replication groups, remote nodes get a
/// [`TxFinishRequest`] through the dispatcher.
pub struct TxManager {
    node_id: NodeId,
    local_address: String,
    clock: AtomicU64,
    table: Mutex<StateTable>,
    partitions: Arc<PartitionRegistry>,
    dispatcher: RwLock<Option<Arc<dyn FinishDispatcher>>>,
}

impl TxManager {
    pub fn new(
        node_id: NodeId,
        local_address: impl Into<String>,
        partitions: Arc<PartitionRegistry>,
    ) -> Self {
        Self {
            node_id,
            local_address: local_address.into(),
            clock: AtomicU64::new(0),
            table: Mutex::new(StateTable {
                states: HashMap::new(),
                terminal: VecDeque::new(),
            }),
            partitions,
            dispatcher: RwLock::new(None),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn local_address(&self) -> &str {
        &self.local_address
    }

    pub fn set_dispatcher(&self, dispatcher: Arc<dyn FinishDispatcher>) {
        *self.dispatcher.write().expect("dispatcher slot poisoned") = Some(dispatcher);
    }

    /// Starts an explicit transaction owned by the caller.
    pub fn begin(self: &Arc<Self>) -> TxContext {
        let tx_id = self.issue();
        TxContext::new(self.clone(), tx_id, self.local_address.clone())
    }

    /// Mints a timestamp for an operation issued without a transaction. The
    /// id is registered like any other so replicated replay stays
    /// deterministic.
    pub(crate) fn begin_implicit(&self) -> TxId {
        self.issue()
    }

    /// Ensures future timestamps sort after an id replayed from a log.
    pub(crate) fn observe(&self, tx_id: TxId) {
        if tx_id.node == self.node_id {
            self.clock.fetch_max(tx_id.ts, Ordering::SeqCst);
        }
    }

    fn issue(&self) -> TxId {
        let ts = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
        let tx_id = TxId::new(ts, self.node_id);
        self.table
            .lock()
            .expect("tx state table poisoned")
            .states
            .insert(tx_id, TxState::Pending);
        tx_id
    }

    pub fn state(&self, tx_id: TxId) -> Option<TxState> {
        self.table
            .lock()
            .expect("tx state table poisoned")
            .states
            .get(&tx_id)
            .copied()
    }

    /// Compare-and-set state transition; returns the state the transaction
    /// is in afterwards. A transaction this node has never seen counts as
    /// `Pending`, since remote finish may be its first contact here.
    pub fn change_state(&self, tx_id: TxId, from: TxState, to: TxState) -> TxState {
        let mut table = self.table.lock().expect("tx state table poisoned");
        let current = table
            .states
            .get(&tx_id)
            .copied()
            .unwrap_or(TxState::Pending);
        if current != from {
            return current;
        }
        table.states.insert(tx_id, to);
        if to.is_terminal() {
            table.terminal.push_back(tx_id);
            while table.terminal.len() > RETAINED_TERMINAL_STATES {
                if let Some(evicted) = table.terminal.pop_front() {
                    table.states.remove(&evicted);
                }
            }
        }
        to
    }

    /// Coordinator-side finish: transitions the local state, then fans the
    /// decision out to every enlisted address. The returned state is the
    /// terminal state the transaction ended in, which may differ from the
    /// requested one if the transaction was already finished the other way.
    pub(crate) async fn finish(
        &self,
        tx_id: TxId,
        commit: bool,
        enlisted: HashMap<String, BTreeSet<String>>,
    ) -> Result<TxState, TxError> {
        let desired = if commit {
            TxState::Committed
        } else {
            TxState::Aborted
        };
        let reached = self.change_state(tx_id, TxState::Pending, desired);
        if reached != desired {
            debug!(%tx_id, ?reached, "finish on already terminal transaction");
            return Ok(reached);
        }

        let mut errors = Vec::new();
        for (address, partitions) in enlisted {
            if address == self.local_address {
                errors.extend(self.finish_partitions(tx_id, commit, &partitions).await);
            } else {
                let request = TxFinishRequest {
                    tx_id,
                    commit,
                    partitions,
                };
                if let Err(err) = self.dispatch_remote(&address, request).await {
                    errors.push(err);
                }
            }
        }

        match errors.into_iter().next() {
            None => Ok(desired),
            Some(first) => {
                // The terminal state stands; delivery to the failed
                // partition is the replication layer's problem now.
                warn!(%tx_id, error = %first, "transaction finish partially failed");
                Err(first)
            }
        }
    }

    /// Remote-side finish handler: transition, then drive every named local
    /// partition group.
    pub async fn handle_finish(&self, request: TxFinishRequest) -> Result<TxState, TxError> {
        let desired = if request.commit {
            TxState::Committed
        } else {
            TxState::Aborted
        };
        let reached = self.change_state(request.tx_id, TxState::Pending, desired);
        if reached != desired {
            return Ok(reached);
        }
        let errors = self
            .finish_partitions(request.tx_id, request.commit, &request.partitions)
            .await;
        match errors.into_iter().next() {
            None => Ok(desired),
            Some(first) => Err(first),
        }
    }

    async fn finish_partitions(
        &self,
        tx_id: TxId,
        commit: bool,
        partitions: &BTreeSet<String>,
    ) -> Vec<TxError> {
        let mut errors = Vec::new();
        for group in partitions {
            match self.partitions.get(group) {
                None => errors.push(TxError::Finish {
                    partition: group.clone(),
                    message: "partition group is not hosted on this node".into(),
                }),
                Some(partition) => {
                    if let Err(err) = partition.submit_finish(tx_id, commit).await {
                        errors.push(TxError::Finish {
                            partition: group.clone(),
                            message: err.to_string(),
                        });
                    }
                }
            }
        }
        errors
    }

    async fn dispatch_remote(
        &self,
        address: &str,
        request: TxFinishRequest,
    ) -> Result<(), TxError> {
        let dispatcher = self
            .dispatcher
            .read()
            .expect("dispatcher slot poisoned")
            .clone();
        match dispatcher {
            None => Err(TxError::Unreachable(address.to_string())),
            Some(dispatcher) => dispatcher.dispatch(address, request).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> Arc<TxManager> {
        Arc::new(TxManager::new(
            1,
            "127.0.0.1:1",
            Arc::new(PartitionRegistry::default()),
        ))
    }

    #[test]
    fn timestamps_are_monotonic() {
        let manager = manager();
        let first = manager.begin_implicit();
        let second = manager.begin_implicit();
        assert!(first < second);
        assert_eq!(manager.state(first), Some(TxState::Pending));
    }

    #[test]
    fn change_state_is_idempotent_cas() {
        let manager = manager();
        let tx = manager.begin_implicit();

        assert_eq!(
            manager.change_state(tx, TxState::Pending, TxState::Committed),
            TxState::Committed
        );
        // A second commit is a no-op reporting the terminal state.
        assert_eq!(
            manager.change_state(tx, TxState::Pending, TxState::Committed),
            TxState::Committed
        );
        // Rollback after commit reports the existing terminal state.
        assert_eq!(
            manager.change_state(tx, TxState::Pending, TxState::Aborted),
            TxState::Committed
        );
    }

    #[tokio::test]
    async fn finish_with_no_enlistment_transitions_locally() {
        let manager = manager();
        let tx = manager.begin_implicit();
        let state = manager.finish(tx, false, HashMap::new()).await.unwrap();
        assert_eq!(state, TxState::Aborted);
        assert_eq!(manager.state(tx), Some(TxState::Aborted));
    }

    #[tokio::test]
    async fn finish_of_unknown_remote_tx_starts_from_pending() {
        let manager = manager();
        let request = TxFinishRequest {
            tx_id: TxId::new(99, 7),
            commit: true,
            partitions: BTreeSet::new(),
        };
        let state = manager.handle_finish(request).await.unwrap();
        assert_eq!(state, TxState::Committed);
    }
}
