use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::table::{Table, TxTable};
use crate::tx::manager::{TxError, TxManager, TxState};
use crate::types::TxId;

/// Handle to an in-flight transaction.
///
/// The context records which (node, partition group) pairs the transaction
/// touched; commit and rollback consult that map to drive the finish
/// protocol. Clones share the same record; the transaction manager is the
/// owner of transaction state, the context is a view onto it.
#[derive(Clone)]
pub struct TxContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    tx_id: TxId,
    origin: String,
    manager: Arc<TxManager>,
    enlisted: Mutex<HashMap<String, BTreeSet<String>>>,
    failed: AtomicBool,
    worker: Mutex<Option<String>>,
}

impl TxContext {
    pub(crate) fn new(manager: Arc<TxManager>, tx_id: TxId, origin: String) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                tx_id,
                origin,
                manager,
                enlisted: Mutex::new(HashMap::new()),
                failed: AtomicBool::new(false),
                worker: Mutex::new(None),
            }),
        }
    }

    pub fn tx_id(&self) -> TxId {
        self.inner.tx_id
    }

    /// Address of the node that began this transaction.
    pub fn origin(&self) -> &str {
        &self.inner.origin
    }

    pub fn state(&self) -> Option<TxState> {
        self.inner.manager.state(self.inner.tx_id)
    }

    /// Records that an operation targeted `group` on `address`. Returns true
    /// on first-time enlistment of that pair.
    pub fn enlist(&self, address: &str, group: &str) -> bool {
        self.inner
            .enlisted
            .lock()
            .expect("enlistment map poisoned")
            .entry(address.to_string())
            .or_default()
            .insert(group.to_string())
    }

    /// Snapshot of the enlisted (address → partition groups) map.
    pub fn enlisted(&self) -> HashMap<String, BTreeSet<String>> {
        self.inner
            .enlisted
            .lock()
            .expect("enlistment map poisoned")
            .clone()
    }

    /// Marks the transaction as failed; set when an operation under it
    /// errored. A failed transaction can only roll back.
    pub(crate) fn mark_failed(&self) {
        self.inner.failed.store(true, Ordering::SeqCst);
    }

    pub fn failed(&self) -> bool {
        self.inner.failed.load(Ordering::SeqCst)
    }

    /// Commits across every enlisted partition. Returns the terminal state
    /// reached, which is `Aborted` if the transaction was already rolled
    /// back or an operation under it failed (commit then degrades to
    /// rollback).
    pub async fn commit(&self) -> Result<TxState, TxError> {
        self.finish(!self.failed()).await
    }

    pub async fn rollback(&self) -> Result<TxState, TxError> {
        self.finish(false).await
    }

    async fn finish(&self, commit: bool) -> Result<TxState, TxError> {
        self.inner
            .manager
            .finish(self.inner.tx_id, commit, self.enlisted())
            .await
    }

    /// Binds the table view to this transaction so every operation issued
    /// through the view carries it implicitly.
    pub fn wrap(&self, table: &Table) -> TxTable {
        TxTable::new(table.clone(), self.clone())
    }

    /// Tags the context with the worker that is driving it; a debug hook for
    /// ordering-sensitive investigations.
    pub fn bind_worker(&self, name: impl Into<String>) {
        *self.inner.worker.lock().expect("worker tag poisoned") = Some(name.into());
    }

    pub fn worker(&self) -> Option<String> {
        self.inner.worker.lock().expect("worker tag poisoned").clone()
    }
}
