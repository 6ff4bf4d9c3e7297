//! Table surface and partition router.
//!
//! A table owns one partition per affinity bucket. Single-key operations go
//! straight to the owning partition; batches are grouped per partition,
//! issued in parallel, and reassembled in input order. Before any operation
//! under an explicit transaction is issued, the responsible (leader address,
//! partition group) pair is enlisted into the transaction so commit knows
//! where to fan out.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinSet;
use tracing::warn;

use crate::partition::{Command, CommandResponse, Partition, PartitionError};
use crate::tx::context::TxContext;
use crate::tx::manager::{TxError, TxManager};
use crate::types::{Key, Row, TxId, Value, affinity_partition};

/// Errors surfaced by table operations.
#[derive(Debug, Error)]
pub enum TableError {
    #[error(transparent)]
    Partition(#[from] PartitionError),
    #[error(transparent)]
    Tx(#[from] TxError),
    #[error("operation timed out after {0:?}; the transaction was rolled back")]
    TimedOut(Duration),
    #[error("unexpected response shape for {0}")]
    Response(&'static str),
}

struct InternalTable {
    name: String,
    partitions: Vec<Arc<Partition>>,
    tx_manager: Arc<TxManager>,
    local_address: String,
    op_timeout: Duration,
}

impl InternalTable {
    fn partition_index(&self, key: &Key) -> usize {
        affinity_partition(key, self.partitions.len() as u32) as usize
    }
}

/// Handle to one table; clones share the partition set.
#[derive(Clone)]
pub struct Table {
    inner: Arc<InternalTable>,
}

impl Table {
    pub(crate) fn new(
        name: impl Into<String>,
        partitions: Vec<Arc<Partition>>,
        tx_manager: Arc<TxManager>,
        local_address: impl Into<String>,
        op_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(InternalTable {
                name: name.into(),
                partitions,
                tx_manager,
                local_address: local_address.into(),
                op_timeout,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn partition_count(&self) -> u32 {
        self.inner.partitions.len() as u32
    }

    // ---- typed operations ----

    pub async fn get(&self, key: &Key, tx: Option<&TxContext>) -> Result<Option<Value>, TableError> {
        match self.execute(Command::Get { key: key.clone() }, tx).await? {
            CommandResponse::Row(value) => Ok(value),
            _ => Err(TableError::Response("get")),
        }
    }

    pub async fn get_all(
        &self,
        keys: &[Key],
        tx: Option<&TxContext>,
    ) -> Result<Vec<Option<Value>>, TableError> {
        match self.execute(Command::GetAll { keys: keys.to_vec() }, tx).await? {
            CommandResponse::Rows(rows) => Ok(rows),
            _ => Err(TableError::Response("get_all")),
        }
    }

    pub async fn upsert(&self, row: Row, tx: Option<&TxContext>) -> Result<(), TableError> {
        match self.execute(Command::Upsert { row }, tx).await? {
            CommandResponse::None => Ok(()),
            _ => Err(TableError::Response("upsert")),
        }
    }

    pub async fn upsert_all(&self, rows: Vec<Row>, tx: Option<&TxContext>) -> Result<(), TableError> {
        match self.execute(Command::UpsertAll { rows }, tx).await? {
            CommandResponse::None => Ok(()),
            _ => Err(TableError::Response("upsert_all")),
        }
    }

    pub async fn insert(&self, row: Row, tx: Option<&TxContext>) -> Result<bool, TableError> {
        match self.execute(Command::Insert { row }, tx).await? {
            CommandResponse::Applied(applied) => Ok(applied),
            _ => Err(TableError::Response("insert")),
        }
    }

    pub async fn insert_all(
        &self,
        rows: Vec<Row>,
        tx: Option<&TxContext>,
    ) -> Result<Vec<bool>, TableError> {
        match self.execute(Command::InsertAll { rows }, tx).await? {
            CommandResponse::AppliedAll(applied) => Ok(applied),
            _ => Err(TableError::Response("insert_all")),
        }
    }

    /// Replaces the row only when a value already exists for its key.
    pub async fn replace(&self, row: Row, tx: Option<&TxContext>) -> Result<bool, TableError> {
        match self.execute(Command::ReplaceIfExists { row }, tx).await? {
            CommandResponse::Applied(applied) => Ok(applied),
            _ => Err(TableError::Response("replace")),
        }
    }

    /// Replaces only when the stored value equals `old` byte-for-byte.
    pub async fn replace_exact(
        &self,
        old: Row,
        new: Row,
        tx: Option<&TxContext>,
    ) -> Result<bool, TableError> {
        match self.execute(Command::Replace { old, new }, tx).await? {
            CommandResponse::Applied(applied) => Ok(applied),
            _ => Err(TableError::Response("replace_exact")),
        }
    }

    pub async fn delete(&self, key: &Key, tx: Option<&TxContext>) -> Result<bool, TableError> {
        match self.execute(Command::Delete { key: key.clone() }, tx).await? {
            CommandResponse::Applied(applied) => Ok(applied),
            _ => Err(TableError::Response("delete")),
        }
    }

    pub async fn delete_all(
        &self,
        keys: &[Key],
        tx: Option<&TxContext>,
    ) -> Result<Vec<bool>, TableError> {
        match self.execute(Command::DeleteAll { keys: keys.to_vec() }, tx).await? {
            CommandResponse::AppliedAll(applied) => Ok(applied),
            _ => Err(TableError::Response("delete_all")),
        }
    }

    pub async fn delete_exact(&self, row: Row, tx: Option<&TxContext>) -> Result<bool, TableError> {
        match self.execute(Command::DeleteExact { row }, tx).await? {
            CommandResponse::Applied(applied) => Ok(applied),
            _ => Err(TableError::Response("delete_exact")),
        }
    }

    pub async fn delete_exact_all(
        &self,
        rows: Vec<Row>,
        tx: Option<&TxContext>,
    ) -> Result<Vec<bool>, TableError> {
        match self.execute(Command::DeleteExactAll { rows }, tx).await? {
            CommandResponse::AppliedAll(applied) => Ok(applied),
            _ => Err(TableError::Response("delete_exact_all")),
        }
    }

    pub async fn get_and_upsert(
        &self,
        row: Row,
        tx: Option<&TxContext>,
    ) -> Result<Option<Value>, TableError> {
        match self.execute(Command::GetAndUpsert { row }, tx).await? {
            CommandResponse::Row(value) => Ok(value),
            _ => Err(TableError::Response("get_and_upsert")),
        }
    }

    pub async fn get_and_replace(
        &self,
        row: Row,
        tx: Option<&TxContext>,
    ) -> Result<Option<Value>, TableError> {
        match self.execute(Command::GetAndReplace { row }, tx).await? {
            CommandResponse::Row(value) => Ok(value),
            _ => Err(TableError::Response("get_and_replace")),
        }
    }

    pub async fn get_and_delete(
        &self,
        key: &Key,
        tx: Option<&TxContext>,
    ) -> Result<Option<Value>, TableError> {
        match self.execute(Command::GetAndDelete { key: key.clone() }, tx).await? {
            CommandResponse::Row(value) => Ok(value),
            _ => Err(TableError::Response("get_and_delete")),
        }
    }

    // ---- generic routing ----

    /// Routes any command through the partition layer. Single-key commands
    /// go to the key's partition, batches are split per partition and
    /// reassembled in input order.
    pub async fn execute(
        &self,
        command: Command,
        tx: Option<&TxContext>,
    ) -> Result<CommandResponse, TableError> {
        match command {
            Command::Get { ref key }
            | Command::Delete { ref key }
            | Command::GetAndDelete { ref key } => {
                let affinity = key.clone();
                self.submit_single(&affinity, command, tx).await
            }
            Command::Upsert { ref row }
            | Command::Insert { ref row }
            | Command::ReplaceIfExists { ref row }
            | Command::DeleteExact { ref row }
            | Command::GetAndUpsert { ref row }
            | Command::GetAndReplace { ref row } => {
                let affinity = row.key.clone();
                self.submit_single(&affinity, command, tx).await
            }
            Command::Replace { ref old, .. } => {
                let affinity = old.key.clone();
                self.submit_single(&affinity, command, tx).await
            }
            Command::GetAll { keys } => {
                if keys.is_empty() {
                    return Ok(CommandResponse::Rows(Vec::new()));
                }
                let total = keys.len();
                let groups = self.group_keys(keys, |chunk| Command::GetAll { keys: chunk });
                let parts = self.submit_batch(groups, tx).await?;
                let mut out = vec![None; total];
                scatter_rows(parts, &mut out, "get_all")?;
                Ok(CommandResponse::Rows(out))
            }
            Command::DeleteAll { keys } => {
                if keys.is_empty() {
                    return Ok(CommandResponse::AppliedAll(Vec::new()));
                }
                let total = keys.len();
                let groups = self.group_keys(keys, |chunk| Command::DeleteAll { keys: chunk });
                let parts = self.submit_batch(groups, tx).await?;
                let mut out = vec![false; total];
                scatter_bools(parts, &mut out, "delete_all")?;
                Ok(CommandResponse::AppliedAll(out))
            }
            Command::UpsertAll { rows } => {
                if rows.is_empty() {
                    return Ok(CommandResponse::None);
                }
                let groups = self.group_rows(rows, |chunk| Command::UpsertAll { rows: chunk });
                self.submit_batch(groups, tx).await?;
                Ok(CommandResponse::None)
            }
            Command::InsertAll { rows } => {
                if rows.is_empty() {
                    return Ok(CommandResponse::AppliedAll(Vec::new()));
                }
                let total = rows.len();
                let groups = self.group_rows(rows, |chunk| Command::InsertAll { rows: chunk });
                let parts = self.submit_batch(groups, tx).await?;
                let mut out = vec![false; total];
                scatter_bools(parts, &mut out, "insert_all")?;
                Ok(CommandResponse::AppliedAll(out))
            }
            Command::DeleteExactAll { rows } => {
                if rows.is_empty() {
                    return Ok(CommandResponse::AppliedAll(Vec::new()));
                }
                let total = rows.len();
                let groups =
                    self.group_rows(rows, |chunk| Command::DeleteExactAll { rows: chunk });
                let parts = self.submit_batch(groups, tx).await?;
                let mut out = vec![false; total];
                scatter_bools(parts, &mut out, "delete_exact_all")?;
                Ok(CommandResponse::AppliedAll(out))
            }
            Command::Commit | Command::Rollback => Err(TableError::Response(
                "finish commands are driven by the transaction manager",
            )),
        }
    }

    // ---- routing internals ----

    async fn submit_single(
        &self,
        affinity: &Key,
        command: Command,
        tx: Option<&TxContext>,
    ) -> Result<CommandResponse, TableError> {
        let partition = self.inner.partitions[self.inner.partition_index(affinity)].clone();
        match tx {
            Some(tx) => {
                self.enlist(tx, &partition).await;
                let submitted = partition.submit(tx.tx_id(), false, command);
                self.await_with_timeout(submitted, Some(tx)).await
            }
            None => {
                let tx_id = self.inner.tx_manager.begin_implicit();
                let group = partition.group_id().to_string();
                let submitted = partition.submit(tx_id, true, command);
                match tokio::time::timeout(self.inner.op_timeout, submitted).await {
                    Ok(result) => Ok(result?),
                    Err(_) => {
                        self.abort_implicit(tx_id, [group]).await;
                        Err(TableError::TimedOut(self.inner.op_timeout))
                    }
                }
            }
        }
    }

    /// Issues grouped per-partition commands in parallel and returns each
    /// group's response with the input positions it covers.
    async fn submit_batch(
        &self,
        groups: Vec<(Arc<Partition>, Command, Vec<usize>)>,
        tx: Option<&TxContext>,
    ) -> Result<Vec<(Vec<usize>, CommandResponse)>, TableError> {
        match tx {
            Some(tx) => {
                for (partition, _, _) in &groups {
                    self.enlist(tx, partition).await;
                }
                self.run_batch(groups, tx.tx_id(), false, Some(tx)).await
            }
            None if groups.len() == 1 => {
                let tx_id = self.inner.tx_manager.begin_implicit();
                let group_ids: Vec<String> = groups
                    .iter()
                    .map(|(partition, _, _)| partition.group_id().to_string())
                    .collect();
                match self.run_batch(groups, tx_id, true, None).await {
                    Ok(parts) => Ok(parts),
                    Err(TableError::TimedOut(elapsed)) => {
                        self.abort_implicit(tx_id, group_ids).await;
                        Err(TableError::TimedOut(elapsed))
                    }
                    Err(other) => Err(other),
                }
            }
            None => {
                // A batch spanning partitions cannot commit inline per
                // partition and stay atomic; run it under an internal
                // transaction with a full finish round.
                let tx = self.inner.tx_manager.begin();
                for (partition, _, _) in &groups {
                    self.enlist(&tx, partition).await;
                }
                let result = self.run_batch(groups, tx.tx_id(), false, Some(&tx)).await;
                match &result {
                    Ok(_) => {
                        tx.commit().await?;
                    }
                    Err(_) => {
                        if let Err(err) = tx.rollback().await {
                            warn!(error = %err, "rollback of internal batch transaction failed");
                        }
                    }
                }
                result
            }
        }
    }

    async fn run_batch(
        &self,
        groups: Vec<(Arc<Partition>, Command, Vec<usize>)>,
        tx_id: TxId,
        implicit: bool,
        tx: Option<&TxContext>,
    ) -> Result<Vec<(Vec<usize>, CommandResponse)>, TableError> {
        let mut set = JoinSet::new();
        for (partition, command, positions) in groups {
            set.spawn(async move {
                let outcome = partition.submit(tx_id, implicit, command).await;
                (positions, outcome)
            });
        }

        let collected = tokio::time::timeout(self.inner.op_timeout, async {
            let mut parts = Vec::new();
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok((positions, Ok(response))) => parts.push((positions, response)),
                    Ok((_, Err(err))) => {
                        if let Some(tx) = tx {
                            tx.mark_failed();
                        }
                        return Err(TableError::from(err));
                    }
                    Err(_) => return Err(TableError::from(PartitionError::Canceled)),
                }
            }
            Ok(parts)
        })
        .await;

        match collected {
            Ok(result) => result,
            Err(_) => {
                if let Some(tx) = tx {
                    if let Err(err) = tx.rollback().await {
                        warn!(error = %err, "rollback after batch timeout failed");
                    }
                }
                Err(TableError::TimedOut(self.inner.op_timeout))
            }
        }
    }

    async fn await_with_timeout<F>(
        &self,
        submitted: F,
        tx: Option<&TxContext>,
    ) -> Result<CommandResponse, TableError>
    where
        F: Future<Output = Result<CommandResponse, PartitionError>>,
    {
        match tokio::time::timeout(self.inner.op_timeout, submitted).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(err)) => {
                // A failed operation pins the transaction to rollback.
                if let Some(tx) = tx {
                    tx.mark_failed();
                }
                Err(err.into())
            }
            Err(_) => {
                if let Some(tx) = tx {
                    if let Err(err) = tx.rollback().await {
                        warn!(error = %err, "rollback after operation timeout failed");
                    }
                }
                Err(TableError::TimedOut(self.inner.op_timeout))
            }
        }
    }

    async fn enlist(&self, tx: &TxContext, partition: &Arc<Partition>) {
        let address = partition
            .leader_address()
            .await
            .unwrap_or_else(|| self.inner.local_address.clone());
        tx.enlist(&address, partition.group_id());
    }

    async fn abort_implicit(&self, tx_id: TxId, groups: impl IntoIterator<Item = String>) {
        let mut enlisted = HashMap::new();
        enlisted.insert(
            self.inner.local_address.clone(),
            groups.into_iter().collect::<BTreeSet<_>>(),
        );
        if let Err(err) = self.inner.tx_manager.finish(tx_id, false, enlisted).await {
            warn!(%tx_id, error = %err, "rollback of implicit operation failed");
        }
    }

    fn group_keys(
        &self,
        keys: Vec<Key>,
        make: impl Fn(Vec<Key>) -> Command,
    ) -> Vec<(Arc<Partition>, Command, Vec<usize>)> {
        let mut buckets: BTreeMap<usize, (Vec<Key>, Vec<usize>)> = BTreeMap::new();
        for (position, key) in keys.into_iter().enumerate() {
            let index = self.inner.partition_index(&key);
            let bucket = buckets.entry(index).or_default();
            bucket.0.push(key);
            bucket.1.push(position);
        }
        buckets
            .into_iter()
            .map(|(index, (chunk, positions))| {
                (self.inner.partitions[index].clone(), make(chunk), positions)
            })
            .collect()
    }

    fn group_rows(
        &self,
        rows: Vec<Row>,
        make: impl Fn(Vec<Row>) -> Command,
    ) -> Vec<(Arc<Partition>, Command, Vec<usize>)> {
        let mut buckets: BTreeMap<usize, (Vec<Row>, Vec<usize>)> = BTreeMap::new();
        for (position, row) in rows.into_iter().enumerate() {
            let index = self.inner.partition_index(&row.key);
            let bucket = buckets.entry(index).or_default();
            bucket.0.push(row);
            bucket.1.push(position);
        }
        buckets
            .into_iter()
            .map(|(index, (chunk, positions))| {
                (self.inner.partitions[index].clone(), make(chunk), positions)
            })
            .collect()
    }
}

fn scatter_rows(
    parts: Vec<(Vec<usize>, CommandResponse)>,
    out: &mut [Option<Value>],
    operation: &'static str,
) -> Result<(), TableError> {
    for (positions, response) in parts {
        let CommandResponse::Rows(rows) = response else {
            return Err(TableError::Response(operation));
        };
        if rows.len() != positions.len() {
            return Err(TableError::Response(operation));
        }
        for (position, row) in positions.into_iter().zip(rows) {
            out[position] = row;
        }
    }
    Ok(())
}

fn scatter_bools(
    parts: Vec<(Vec<usize>, CommandResponse)>,
    out: &mut [bool],
    operation: &'static str,
) -> Result<(), TableError> {
    for (positions, response) in parts {
        let CommandResponse::AppliedAll(values) = response else {
            return Err(TableError::Response(operation));
        };
        if values.len() != positions.len() {
            return Err(TableError::Response(operation));
        }
        for (position, value) in positions.into_iter().zip(values) {
            out[position] = value;
        }
    }
    Ok(())
}

/// Table view bound to one transaction; every operation issued through it
/// carries the transaction implicitly.
#[derive(Clone)]
pub struct TxTable {
    table: Table,
    tx: TxContext,
}

impl TxTable {
    pub(crate) fn new(table: Table, tx: TxContext) -> Self {
        Self { table, tx }
    }

    pub fn context(&self) -> &TxContext {
        &self.tx
    }

    pub async fn get(&self, key: &Key) -> Result<Option<Value>, TableError> {
        self.table.get(key, Some(&self.tx)).await
    }

    pub async fn get_all(&self, keys: &[Key]) -> Result<Vec<Option<Value>>, TableError> {
        self.table.get_all(keys, Some(&self.tx)).await
    }

    pub async fn upsert(&self, row: Row) -> Result<(), TableError> {
        self.table.upsert(row, Some(&self.tx)).await
    }

    pub async fn upsert_all(&self, rows: Vec<Row>) -> Result<(), TableError> {
        self.table.upsert_all(rows, Some(&self.tx)).await
    }

    pub async fn insert(&self, row: Row) -> Result<bool, TableError> {
        self.table.insert(row, Some(&self.tx)).await
    }

    pub async fn insert_all(&self, rows: Vec<Row>) -> Result<Vec<bool>, TableError> {
        self.table.insert_all(rows, Some(&self.tx)).await
    }

    pub async fn replace(&self, row: Row) -> Result<bool, TableError> {
        self.table.replace(row, Some(&self.tx)).await
    }

    pub async fn replace_exact(&self, old: Row, new: Row) -> Result<bool, TableError> {
        self.table.replace_exact(old, new, Some(&self.tx)).await
    }

    pub async fn delete(&self, key: &Key) -> Result<bool, TableError> {
        self.table.delete(key, Some(&self.tx)).await
    }

    pub async fn delete_all(&self, keys: &[Key]) -> Result<Vec<bool>, TableError> {
        self.table.delete_all(keys, Some(&self.tx)).await
    }

    pub async fn delete_exact(&self, row: Row) -> Result<bool, TableError> {
        self.table.delete_exact(row, Some(&self.tx)).await
    }

    pub async fn delete_exact_all(&self, rows: Vec<Row>) -> Result<Vec<bool>, TableError> {
        self.table.delete_exact_all(rows, Some(&self.tx)).await
    }

    pub async fn get_and_upsert(&self, row: Row) -> Result<Option<Value>, TableError> {
        self.table.get_and_upsert(row, Some(&self.tx)).await
    }

    pub async fn get_and_replace(&self, row: Row) -> Result<Option<Value>, TableError> {
        self.table.get_and_replace(row, Some(&self.tx)).await
    }

    pub async fn get_and_delete(&self, key: &Key) -> Result<Option<Value>, TableError> {
        self.table.get_and_delete(key, Some(&self.tx)).await
    }
}
