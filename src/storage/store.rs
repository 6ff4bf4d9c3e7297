//! Versioned row store: committed rows plus per-transaction staged writes.
//!
//! Every operation acquires its locks through the node's lock manager before
//! touching a slot. A key has at most one pending writer at a time (the
//! exclusive lock enforces it); the writer reads its own staged value, every
//! other reader sees the committed one. Commit promotes staged values,
//! rollback discards them; both release the transaction's locks.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::debug;

use crate::storage::backend::RowStorage;
use crate::storage::snapshot::{PendingTxRecord, StoreContents};
use crate::tx::context::TxContext;
use crate::tx::lock::{LockError, LockManager, LockWait};
use crate::tx::manager::{TxManager, TxState};
use crate::types::{Key, Row, TxId, Value};

/// Errors surfaced by row store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("transaction {0} is aborted")]
    TransactionAborted(TxId),
    #[error("row store invariant violated: {0}")]
    Internal(String),
}

struct PendingWrite {
    value: Option<Value>,
    writer: TxId,
}

#[derive(Default)]
struct TxKeys {
    read: BTreeSet<Key>,
    written: BTreeSet<Key>,
}

struct StoreInner {
    /// Lock namespace of this store; one lock manager serves the whole node.
    scope: Vec<u8>,
    committed: Arc<dyn RowStorage>,
    pending: Mutex<HashMap<Key, PendingWrite>>,
    tx_keys: Mutex<HashMap<TxId, TxKeys>>,
    locks: Arc<LockManager>,
    tx_manager: Arc<TxManager>,
}

impl StoreInner {
    fn lock_key(&self, key: &Key) -> Key {
        let mut scoped = Vec::with_capacity(self.scope.len() + key.len());
        scoped.extend_from_slice(&self.scope);
        scoped.extend_from_slice(key);
        scoped
    }

    /// Value an operation of `tx_id` observes for `key`. Must only be called
    /// with the key's lock held.
    fn visible(&self, key: &Key, tx_id: TxId) -> Option<Value> {
        let pending = self.pending.lock().expect("pending map poisoned");
        match pending.get(key) {
            Some(write) if write.writer == tx_id => write.value.clone(),
            _ => self.committed.read(key),
        }
    }

    fn note_read(&self, tx_id: TxId, key: &Key) {
        self.tx_keys
            .lock()
            .expect("tx key sets poisoned")
            .entry(tx_id)
            .or_default()
            .read
            .insert(key.clone());
    }

    fn note_write(&self, tx_id: TxId, key: &Key) {
        self.tx_keys
            .lock()
            .expect("tx key sets poisoned")
            .entry(tx_id)
            .or_default()
            .written
            .insert(key.clone());
    }

    /// Stages a value for the transaction. Fails when the transaction was
    /// swept by a concurrent rollback between lock grant and staging.
    fn stage(&self, tx_id: TxId, key: Key, value: Option<Value>) -> Result<(), StoreError> {
        let tracked = self
            .tx_keys
            .lock()
            .expect("tx key sets poisoned")
            .get(&tx_id)
            .is_some_and(|keys| keys.written.contains(&key));
        if !tracked {
            return Err(StoreError::TransactionAborted(tx_id));
        }
        self.pending
            .lock()
            .expect("pending map poisoned")
            .insert(key, PendingWrite { value, writer: tx_id });
        Ok(())
    }

    fn take_tx_keys(&self, tx_id: TxId) -> Option<TxKeys> {
        self.tx_keys
            .lock()
            .expect("tx key sets poisoned")
            .remove(&tx_id)
    }

    fn release_all(&self, tx_id: TxId, keys: &TxKeys) {
        for key in &keys.written {
            if let Err(err) = self.locks.release_exclusive(&self.lock_key(key), tx_id) {
                debug!(%tx_id, error = %err, "write lock already released");
            }
        }
        for key in keys.read.difference(&keys.written) {
            if let Err(err) = self.locks.release_shared(&self.lock_key(key), tx_id) {
                debug!(%tx_id, error = %err, "read lock already released");
            }
        }
    }
}

/// Handle to a partition's row store; clones share state.
#[derive(Clone)]
pub struct VersionedRowStore {
    inner: Arc<StoreInner>,
}

impl VersionedRowStore {
    pub fn new(
        scope: impl Into<String>,
        committed: Arc<dyn RowStorage>,
        locks: Arc<LockManager>,
        tx_manager: Arc<TxManager>,
    ) -> Self {
        let mut scope = scope.into().into_bytes();
        scope.push(0);
        Self {
            inner: Arc::new(StoreInner {
                scope,
                committed,
                pending: Mutex::new(HashMap::new()),
                tx_keys: Mutex::new(HashMap::new()),
                locks,
                tx_manager,
            }),
        }
    }

    pub(crate) fn tx_manager(&self) -> &Arc<TxManager> {
        &self.inner.tx_manager
    }

    fn ensure_active(&self, tx_id: TxId) -> Result<(), StoreError> {
        if self.inner.tx_manager.state(tx_id) == Some(TxState::Aborted) {
            return Err(StoreError::TransactionAborted(tx_id));
        }
        Ok(())
    }

    /// Enqueues a shared lock request; the waiter is queued before return so
    /// replicated initiation order equals lock queue order.
    fn prepare_read(&self, key: &Key, tx_id: TxId) -> Result<LockWait, StoreError> {
        self.ensure_active(tx_id)?;
        let wait = self.inner.locks.enqueue_shared(&self.inner.lock_key(key), tx_id);
        self.inner.note_read(tx_id, key);
        Ok(wait)
    }

    fn prepare_write(&self, key: &Key, tx_id: TxId) -> Result<LockWait, StoreError> {
        self.ensure_active(tx_id)?;
        let wait = self
            .inner
            .locks
            .enqueue_exclusive(&self.inner.lock_key(key), tx_id);
        self.inner.note_write(tx_id, key);
        Ok(wait)
    }

    /// Batch enqueue in byte-lexicographic key order, which keeps the
    /// wound-wait property across multi-key operations.
    fn prepare_batch<'a>(
        &self,
        keys: impl Iterator<Item = &'a Key>,
        tx_id: TxId,
        write: bool,
    ) -> Result<Vec<LockWait>, StoreError> {
        self.ensure_active(tx_id)?;
        let mut unique: Vec<&Key> = keys.collect();
        unique.sort();
        unique.dedup();
        Ok(unique
            .into_iter()
            .map(|key| {
                let scoped = self.inner.lock_key(key);
                if write {
                    let wait = self.inner.locks.enqueue_exclusive(&scoped, tx_id);
                    self.inner.note_write(tx_id, key);
                    wait
                } else {
                    let wait = self.inner.locks.enqueue_shared(&scoped, tx_id);
                    self.inner.note_read(tx_id, key);
                    wait
                }
            })
            .collect())
    }

    // ---- by-id operations, used by the partition applier ----

    pub(crate) fn get_tx(
        &self,
        key: Key,
        tx_id: TxId,
    ) -> impl Future<Output = Result<Option<Value>, StoreError>> + Send + 'static {
        let pre = self.prepare_read(&key, tx_id);
        let inner = self.inner.clone();
        async move {
            pre?.await?;
            Ok(inner.visible(&key, tx_id))
        }
    }

    pub(crate) fn get_all_tx(
        &self,
        keys: Vec<Key>,
        tx_id: TxId,
    ) -> impl Future<Output = Result<Vec<Option<Value>>, StoreError>> + Send + 'static {
        let pre = self.prepare_batch(keys.iter(), tx_id, false);
        let inner = self.inner.clone();
        async move {
            for wait in pre? {
                wait.await?;
            }
            Ok(keys.iter().map(|key| inner.visible(key, tx_id)).collect())
        }
    }

    pub(crate) fn upsert_tx(
        &self,
        row: Row,
        tx_id: TxId,
    ) -> impl Future<Output = Result<(), StoreError>> + Send + 'static {
        let pre = self.prepare_write(&row.key, tx_id);
        let inner = self.inner.clone();
        async move {
            pre?.await?;
            inner.stage(tx_id, row.key, Some(row.value))
        }
    }

    pub(crate) fn upsert_all_tx(
        &self,
        rows: Vec<Row>,
        tx_id: TxId,
    ) -> impl Future<Output = Result<(), StoreError>> + Send + 'static {
        let pre = self.prepare_batch(rows.iter().map(|row| &row.key), tx_id, true);
        let inner = self.inner.clone();
        async move {
            for wait in pre? {
                wait.await?;
            }
            for row in rows {
                inner.stage(tx_id, row.key, Some(row.value))?;
            }
            Ok(())
        }
    }

    pub(crate) fn insert_tx(
        &self,
        row: Row,
        tx_id: TxId,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send + 'static {
        let pre = self.prepare_write(&row.key, tx_id);
        let inner = self.inner.clone();
        async move {
            pre?.await?;
            if inner.visible(&row.key, tx_id).is_some() {
                return Ok(false);
            }
            inner.stage(tx_id, row.key, Some(row.value))?;
            Ok(true)
        }
    }

    pub(crate) fn insert_all_tx(
        &self,
        rows: Vec<Row>,
        tx_id: TxId,
    ) -> impl Future<Output = Result<Vec<bool>, StoreError>> + Send + 'static {
        let pre = self.prepare_batch(rows.iter().map(|row| &row.key), tx_id, true);
        let inner = self.inner.clone();
        async move {
            for wait in pre? {
                wait.await?;
            }
            let mut applied = Vec::with_capacity(rows.len());
            for row in rows {
                if inner.visible(&row.key, tx_id).is_some() {
                    applied.push(false);
                } else {
                    inner.stage(tx_id, row.key, Some(row.value))?;
                    applied.push(true);
                }
            }
            Ok(applied)
        }
    }

    /// Stages the new value only when the current visible value matches
    /// `old` byte-for-byte.
    pub(crate) fn replace_exact_tx(
        &self,
        old: Row,
        new: Row,
        tx_id: TxId,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send + 'static {
        let pre = if old.key == new.key {
            self.prepare_write(&old.key, tx_id)
        } else {
            Err(StoreError::Internal(
                "replace expects the old and new rows to share a key".into(),
            ))
        };
        let inner = self.inner.clone();
        async move {
            pre?.await?;
            if inner.visible(&old.key, tx_id).as_deref() != Some(old.value.as_slice()) {
                return Ok(false);
            }
            inner.stage(tx_id, new.key, Some(new.value))?;
            Ok(true)
        }
    }

    /// Stages the row only when a visible value already exists.
    pub(crate) fn replace_if_exists_tx(
        &self,
        row: Row,
        tx_id: TxId,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send + 'static {
        let pre = self.prepare_write(&row.key, tx_id);
        let inner = self.inner.clone();
        async move {
            pre?.await?;
            if inner.visible(&row.key, tx_id).is_none() {
                return Ok(false);
            }
            inner.stage(tx_id, row.key, Some(row.value))?;
            Ok(true)
        }
    }

    pub(crate) fn delete_tx(
        &self,
        key: Key,
        tx_id: TxId,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send + 'static {
        let pre = self.prepare_write(&key, tx_id);
        let inner = self.inner.clone();
        async move {
            pre?.await?;
            if inner.visible(&key, tx_id).is_none() {
                return Ok(false);
            }
            inner.stage(tx_id, key, None)?;
            Ok(true)
        }
    }

    pub(crate) fn delete_all_tx(
        &self,
        keys: Vec<Key>,
        tx_id: TxId,
    ) -> impl Future<Output = Result<Vec<bool>, StoreError>> + Send + 'static {
        let pre = self.prepare_batch(keys.iter(), tx_id, true);
        let inner = self.inner.clone();
        async move {
            for wait in pre? {
                wait.await?;
            }
            let mut applied = Vec::with_capacity(keys.len());
            for key in keys {
                if inner.visible(&key, tx_id).is_none() {
                    applied.push(false);
                } else {
                    inner.stage(tx_id, key, None)?;
                    applied.push(true);
                }
            }
            Ok(applied)
        }
    }

    pub(crate) fn delete_exact_tx(
        &self,
        row: Row,
        tx_id: TxId,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send + 'static {
        let pre = self.prepare_write(&row.key, tx_id);
        let inner = self.inner.clone();
        async move {
            pre?.await?;
            if inner.visible(&row.key, tx_id).as_deref() != Some(row.value.as_slice()) {
                return Ok(false);
            }
            inner.stage(tx_id, row.key, None)?;
            Ok(true)
        }
    }

    pub(crate) fn delete_exact_all_tx(
        &self,
        rows: Vec<Row>,
        tx_id: TxId,
    ) -> impl Future<Output = Result<Vec<bool>, StoreError>> + Send + 'static {
        let pre = self.prepare_batch(rows.iter().map(|row| &row.key), tx_id, true);
        let inner = self.inner.clone();
        async move {
            for wait in pre? {
                wait.await?;
            }
            let mut applied = Vec::with_capacity(rows.len());
            for row in rows {
                if inner.visible(&row.key, tx_id).as_deref() == Some(row.value.as_slice()) {
                    inner.stage(tx_id, row.key, None)?;
                    applied.push(true);
                } else {
                    applied.push(false);
                }
            }
            Ok(applied)
        }
    }

    pub(crate) fn get_and_upsert_tx(
        &self,
        row: Row,
        tx_id: TxId,
    ) -> impl Future<Output = Result<Option<Value>, StoreError>> + Send + 'static {
        let pre = self.prepare_write(&row.key, tx_id);
        let inner = self.inner.clone();
        async move {
            pre?.await?;
            let previous = inner.visible(&row.key, tx_id);
            inner.stage(tx_id, row.key, Some(row.value))?;
            Ok(previous)
        }
    }

    pub(crate) fn get_and_replace_tx(
        &self,
        row: Row,
        tx_id: TxId,
    ) -> impl Future<Output = Result<Option<Value>, StoreError>> + Send + 'static {
        let pre = self.prepare_write(&row.key, tx_id);
        let inner = self.inner.clone();
        async move {
            pre?.await?;
            let previous = inner.visible(&row.key, tx_id);
            if previous.is_some() {
                inner.stage(tx_id, row.key, Some(row.value))?;
            }
            Ok(previous)
        }
    }

    pub(crate) fn get_and_delete_tx(
        &self,
        key: Key,
        tx_id: TxId,
    ) -> impl Future<Output = Result<Option<Value>, StoreError>> + Send + 'static {
        let pre = self.prepare_write(&key, tx_id);
        let inner = self.inner.clone();
        async move {
            pre?.await?;
            let previous = inner.visible(&key, tx_id);
            if previous.is_some() {
                inner.stage(tx_id, key, None)?;
            }
            Ok(previous)
        }
    }

    // ---- optional-transaction surface ----

    pub async fn get(&self, key: &Key, tx: Option<&TxContext>) -> Result<Option<Value>, StoreError> {
        match tx {
            Some(tx) => self.get_tx(key.clone(), tx.tx_id()).await,
            None => {
                self.run_implicit(|tx_id| self.get_tx(key.clone(), tx_id))
                    .await
            }
        }
    }

    pub async fn get_all(
        &self,
        keys: &[Key],
        tx: Option<&TxContext>,
    ) -> Result<Vec<Option<Value>>, StoreError> {
        match tx {
            Some(tx) => self.get_all_tx(keys.to_vec(), tx.tx_id()).await,
            None => {
                self.run_implicit(|tx_id| self.get_all_tx(keys.to_vec(), tx_id))
                    .await
            }
        }
    }

    pub async fn upsert(&self, row: Row, tx: Option<&TxContext>) -> Result<(), StoreError> {
        match tx {
            Some(tx) => self.upsert_tx(row, tx.tx_id()).await,
            None => {
                self.run_implicit(|tx_id| self.upsert_tx(row.clone(), tx_id))
                    .await
            }
        }
    }

    pub async fn upsert_all(&self, rows: Vec<Row>, tx: Option<&TxContext>) -> Result<(), StoreError> {
        match tx {
            Some(tx) => self.upsert_all_tx(rows, tx.tx_id()).await,
            None => {
                self.run_implicit(|tx_id| self.upsert_all_tx(rows.clone(), tx_id))
                    .await
            }
        }
    }

    pub async fn insert(&self, row: Row, tx: Option<&TxContext>) -> Result<bool, StoreError> {
        match tx {
            Some(tx) => self.insert_tx(row, tx.tx_id()).await,
            None => {
                self.run_implicit(|tx_id| self.insert_tx(row.clone(), tx_id))
                    .await
            }
        }
    }

    pub async fn insert_all(
        &self,
        rows: Vec<Row>,
        tx: Option<&TxContext>,
    ) -> Result<Vec<bool>, StoreError> {
        match tx {
            Some(tx) => self.insert_all_tx(rows, tx.tx_id()).await,
            None => {
                self.run_implicit(|tx_id| self.insert_all_tx(rows.clone(), tx_id))
                    .await
            }
        }
    }

    pub async fn replace(&self, row: Row, tx: Option<&TxContext>) -> Result<bool, StoreError> {
        match tx {
            Some(tx) => self.replace_if_exists_tx(row, tx.tx_id()).await,
            None => {
                self.run_implicit(|tx_id| self.replace_if_exists_tx(row.clone(), tx_id))
                    .await
            }
        }
    }

    pub async fn replace_exact(
        &self,
        old: Row,
        new: Row,
        tx: Option<&TxContext>,
    ) -> Result<bool, StoreError> {
        match tx {
            Some(tx) => self.replace_exact_tx(old, new, tx.tx_id()).await,
            None => {
                self.run_implicit(|tx_id| self.replace_exact_tx(old.clone(), new.clone(), tx_id))
                    .await
            }
        }
    }

    pub async fn delete(&self, key: &Key, tx: Option<&TxContext>) -> Result<bool, StoreError> {
        match tx {
            Some(tx) => self.delete_tx(key.clone(), tx.tx_id()).await,
            None => {
                self.run_implicit(|tx_id| self.delete_tx(key.clone(), tx_id))
                    .await
            }
        }
    }

    pub async fn delete_all(
        &self,
        keys: &[Key],
        tx: Option<&TxContext>,
    ) -> Result<Vec<bool>, StoreError> {
        match tx {
            Some(tx) => self.delete_all_tx(keys.to_vec(), tx.tx_id()).await,
            None => {
                self.run_implicit(|tx_id| self.delete_all_tx(keys.to_vec(), tx_id))
                    .await
            }
        }
    }

    pub async fn delete_exact(&self, row: Row, tx: Option<&TxContext>) -> Result<bool, StoreError> {
        match tx {
            Some(tx) => self.delete_exact_tx(row, tx.tx_id()).await,
            None => {
                self.run_implicit(|tx_id| self.delete_exact_tx(row.clone(), tx_id))
                    .await
            }
        }
    }

    pub async fn delete_exact_all(
        &self,
        rows: Vec<Row>,
        tx: Option<&TxContext>,
    ) -> Result<Vec<bool>, StoreError> {
        match tx {
            Some(tx) => self.delete_exact_all_tx(rows, tx.tx_id()).await,
            None => {
                self.run_implicit(|tx_id| self.delete_exact_all_tx(rows.clone(), tx_id))
                    .await
            }
        }
    }

    pub async fn get_and_upsert(
        &self,
        row: Row,
        tx: Option<&TxContext>,
    ) -> Result<Option<Value>, StoreError> {
        match tx {
            Some(tx) => self.get_and_upsert_tx(row, tx.tx_id()).await,
            None => {
                self.run_implicit(|tx_id| self.get_and_upsert_tx(row.clone(), tx_id))
                    .await
            }
        }
    }

    pub async fn get_and_replace(
        &self,
        row: Row,
        tx: Option<&TxContext>,
    ) -> Result<Option<Value>, StoreError> {
        match tx {
            Some(tx) => self.get_and_replace_tx(row, tx.tx_id()).await,
            None => {
                self.run_implicit(|tx_id| self.get_and_replace_tx(row.clone(), tx_id))
                    .await
            }
        }
    }

    pub async fn get_and_delete(
        &self,
        key: &Key,
        tx: Option<&TxContext>,
    ) -> Result<Option<Value>, StoreError> {
        match tx {
            Some(tx) => self.get_and_delete_tx(key.clone(), tx.tx_id()).await,
            None => {
                self.run_implicit(|tx_id| self.get_and_delete_tx(key.clone(), tx_id))
                    .await
            }
        }
    }

    async fn run_implicit<T, F, Fut>(&self, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(TxId) -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let tx_id = self.inner.tx_manager.begin_implicit();
        let result = op(tx_id).await;
        self.finish_tx(tx_id, result.is_ok());
        result
    }

    // ---- finish ----

    /// Transitions the transaction and applies the store-side effect of the
    /// terminal state it actually reached. Idempotent.
    pub(crate) fn finish_tx(&self, tx_id: TxId, commit: bool) -> TxState {
        let desired = if commit {
            TxState::Committed
        } else {
            TxState::Aborted
        };
        let reached = self
            .inner
            .tx_manager
            .change_state(tx_id, TxState::Pending, desired);
        match reached {
            TxState::Committed => self.commit_tx(tx_id),
            TxState::Aborted => self.rollback_tx(tx_id),
            TxState::Pending => {}
        }
        reached
    }

    /// Promotes everything the transaction staged in this store and releases
    /// its locks. A pending `None` erases the committed entry.
    pub(crate) fn commit_tx(&self, tx_id: TxId) {
        let Some(keys) = self.inner.take_tx_keys(tx_id) else {
            return;
        };
        {
            let mut pending = self.inner.pending.lock().expect("pending map poisoned");
            for key in &keys.written {
                let staged_here = pending.get(key).is_some_and(|write| write.writer == tx_id);
                if !staged_here {
                    continue;
                }
                if let Some(write) = pending.remove(key) {
                    match write.value {
                        Some(value) => self.inner.committed.write(key.clone(), value),
                        None => self.inner.committed.erase(key),
                    }
                }
            }
        }
        self.inner.release_all(tx_id, &keys);
    }

    /// Discards staged values and releases locks; pending lock waiters are
    /// cancelled first so in-flight operations resolve with a conflict.
    pub(crate) fn rollback_tx(&self, tx_id: TxId) {
        let Some(keys) = self.inner.take_tx_keys(tx_id) else {
            return;
        };
        self.inner.release_all(tx_id, &keys);
        let mut pending = self.inner.pending.lock().expect("pending map poisoned");
        for key in &keys.written {
            if pending.get(key).is_some_and(|write| write.writer == tx_id) {
                pending.remove(key);
            }
        }
    }

    // ---- snapshot surface ----

    /// Serialisable view of the store: committed rows in key order plus the
    /// staged writes of every in-flight transaction.
    pub fn export(&self) -> StoreContents {
        let committed = self.inner.committed.scan();
        let mut staged: BTreeMap<TxId, BTreeMap<Key, Option<Value>>> = BTreeMap::new();
        {
            let pending = self.inner.pending.lock().expect("pending map poisoned");
            for (key, write) in pending.iter() {
                staged
                    .entry(write.writer)
                    .or_default()
                    .insert(key.clone(), write.value.clone());
            }
        }
        let pending = staged
            .into_iter()
            .map(|(tx_id, entries)| PendingTxRecord {
                tx_id,
                entries: entries.into_iter().collect(),
            })
            .collect();
        StoreContents { committed, pending }
    }

    /// Replaces the in-memory state with the snapshot contents. Pending
    /// writers get their exclusive locks re-established so later conflicts
    /// and finish commands behave as on the original replica.
    pub fn import(&self, contents: StoreContents) {
        self.inner.committed.clear();
        self.inner
            .pending
            .lock()
            .expect("pending map poisoned")
            .clear();
        self.inner
            .tx_keys
            .lock()
            .expect("tx key sets poisoned")
            .clear();

        for (key, value) in contents.committed {
            self.inner.committed.write(key, value);
        }
        for record in contents.pending {
            for (key, value) in record.entries {
                // Fresh queues grant immediately; a snapshot can only carry
                // one writer per key.
                let _granted = self
                    .inner
                    .locks
                    .enqueue_exclusive(&self.inner.lock_key(&key), record.tx_id);
                self.inner.note_write(record.tx_id, &key);
                self.inner
                    .pending
                    .lock()
                    .expect("pending map poisoned")
                    .insert(
                        key,
                        PendingWrite {
                            value,
                            writer: record.tx_id,
                        },
                    );
            }
        }
    }

    /// Lock queue on a key of this store, oldest first. Test hook.
    pub fn lock_queue(&self, key: &Key) -> Vec<TxId> {
        self.inner.locks.queue(&self.inner.lock_key(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::PartitionRegistry;
    use crate::storage::memory::MemoryRowStorage;

    fn fixture() -> (VersionedRowStore, Arc<TxManager>, Arc<LockManager>) {
        let registry = Arc::new(PartitionRegistry::default());
        let manager = Arc::new(TxManager::new(0, "127.0.0.1:0", registry));
        let locks = Arc::new(LockManager::new());
        let store = VersionedRowStore::new(
            "accounts-part-0",
            Arc::new(MemoryRowStorage::new()),
            locks.clone(),
            manager.clone(),
        );
        (store, manager, locks)
    }

    fn key(name: &str) -> Key {
        name.as_bytes().to_vec()
    }

    fn row(name: &str, value: &str) -> Row {
        Row::new(name.as_bytes().to_vec(), value.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn implicit_upsert_then_get() {
        let (store, _, locks) = fixture();
        store.upsert(row("k", "100"), None).await.unwrap();
        let value = store.get(&key("k"), None).await.unwrap();
        assert_eq!(value, Some(b"100".to_vec()));
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn commit_promotes_staged_value() {
        let (store, manager, locks) = fixture();
        store.upsert(row("k", "100"), None).await.unwrap();

        let tx = manager.begin();
        let seen = store.get(&key("k"), Some(&tx)).await.unwrap();
        assert_eq!(seen, Some(b"100".to_vec()));
        store.upsert(row("k", "200"), Some(&tx)).await.unwrap();
        store.finish_tx(tx.tx_id(), true);

        assert_eq!(manager.state(tx.tx_id()), Some(TxState::Committed));
        assert_eq!(store.get(&key("k"), None).await.unwrap(), Some(b"200".to_vec()));
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn rollback_discards_staged_value() {
        let (store, manager, locks) = fixture();
        store.upsert(row("k", "100"), None).await.unwrap();

        let tx = manager.begin();
        store.upsert(row("k", "200"), Some(&tx)).await.unwrap();
        store.finish_tx(tx.tx_id(), false);

        assert_eq!(manager.state(tx.tx_id()), Some(TxState::Aborted));
        assert_eq!(store.get(&key("k"), None).await.unwrap(), Some(b"100".to_vec()));
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn insert_sees_own_staged_write() {
        let (store, manager, _) = fixture();
        let tx = manager.begin();
        assert!(store.insert(row("k", "200"), Some(&tx)).await.unwrap());
        assert!(!store.insert(row("k", "201"), Some(&tx)).await.unwrap());
        store.finish_tx(tx.tx_id(), true);
        assert_eq!(store.get(&key("k"), None).await.unwrap(), Some(b"200".to_vec()));
    }

    #[tokio::test]
    async fn delete_commits_a_tombstone() {
        let (store, manager, _) = fixture();
        store.upsert(row("k", "1"), None).await.unwrap();

        let tx = manager.begin();
        assert!(store.delete(&key("k"), Some(&tx)).await.unwrap());
        // The writer observes its own pending delete.
        assert_eq!(store.get(&key("k"), Some(&tx)).await.unwrap(), None);
        store.finish_tx(tx.tx_id(), true);
        assert_eq!(store.get(&key("k"), None).await.unwrap(), None);
    }

    #[tokio::test]
    async fn conditional_operations_compare_bytes() {
        let (store, manager, _) = fixture();
        store.upsert(row("k", "1"), None).await.unwrap();

        let tx = manager.begin();
        assert!(
            !store
                .replace_exact(row("k", "2"), row("k", "9"), Some(&tx))
                .await
                .unwrap()
        );
        assert!(
            store
                .replace_exact(row("k", "1"), row("k", "9"), Some(&tx))
                .await
                .unwrap()
        );
        assert!(!store.delete_exact(row("k", "1"), Some(&tx)).await.unwrap());
        assert!(store.delete_exact(row("k", "9"), Some(&tx)).await.unwrap());
        store.finish_tx(tx.tx_id(), true);
        assert_eq!(store.get(&key("k"), None).await.unwrap(), None);
    }

    #[tokio::test]
    async fn replace_requires_existing_row() {
        let (store, _, _) = fixture();
        assert!(!store.replace(row("k", "1"), None).await.unwrap());
        store.upsert(row("k", "1"), None).await.unwrap();
        assert!(store.replace(row("k", "2"), None).await.unwrap());
        assert_eq!(store.get(&key("k"), None).await.unwrap(), Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn wound_wait_rejects_older_writer() {
        let (store, manager, _) = fixture();
        store.upsert(row("k", "100"), None).await.unwrap();

        let older = manager.begin();
        let younger = manager.begin();

        store.upsert(row("k", "101"), Some(&younger)).await.unwrap();
        let err = store.upsert(row("k", "101"), Some(&older)).await.unwrap_err();
        assert!(matches!(err, StoreError::Lock(LockError::Conflict { .. })));

        store.finish_tx(younger.tx_id(), true);
        assert_eq!(store.get(&key("k"), None).await.unwrap(), Some(b"101".to_vec()));
    }

    #[tokio::test]
    async fn operations_under_aborted_tx_fail() {
        let (store, manager, _) = fixture();
        let tx = manager.begin();
        store.finish_tx(tx.tx_id(), false);

        let err = store.upsert(row("k", "1"), Some(&tx)).await.unwrap_err();
        assert!(matches!(err, StoreError::TransactionAborted(_)));
    }

    #[tokio::test]
    async fn batch_results_follow_input_order() {
        let (store, manager, _) = fixture();
        store.upsert(row("b", "2"), None).await.unwrap();

        let tx = manager.begin();
        let values = store
            .get_all(&[key("c"), key("b"), key("a")], Some(&tx))
            .await
            .unwrap();
        assert_eq!(values, vec![None, Some(b"2".to_vec()), None]);

        let applied = store
            .insert_all(vec![row("c", "3"), row("b", "9")], Some(&tx))
            .await
            .unwrap();
        assert_eq!(applied, vec![true, false]);
        store.finish_tx(tx.tx_id(), true);

        assert_eq!(store.get(&key("c"), None).await.unwrap(), Some(b"3".to_vec()));
        assert_eq!(store.get(&key("b"), None).await.unwrap(), Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn export_import_round_trips_pending_state() {
        let (store, manager, _) = fixture();
        store.upsert(row("a", "1"), None).await.unwrap();
        let tx = manager.begin();
        store.upsert(row("a", "2"), Some(&tx)).await.unwrap();
        store.delete(&key("a"), Some(&tx)).await.ok();

        let contents = store.export();

        let (other, other_manager, _) = fixture();
        other.import(contents.clone());
        assert_eq!(other.export(), contents);

        // Finishing the restored transaction applies its staged writes.
        other_manager.change_state(tx.tx_id(), TxState::Pending, TxState::Committed);
        other.commit_tx(tx.tx_id());
        assert_eq!(other.get(&key("a"), None).await.unwrap(), None);
    }
}
