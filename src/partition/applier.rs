//! Deterministic command applier over a partition's row store.
//!
//! The applier is driven in replicated-log order on every replica. It must
//! never block the applying thread: write commands enqueue their lock
//! waiters synchronously (so queue order mirrors log order everywhere) and
//! complete staging in a spawned task once the grant fires. Responses reach
//! only the replica that originated the command, through the responder
//! handed in by its pending-op table.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::partition::command::{Command, CommandEnvelope, CommandResponse};
use crate::storage::store::{StoreError, VersionedRowStore};
use crate::types::TxId;

type CommandFuture = Pin<Box<dyn Future<Output = Result<CommandResponse, StoreError>> + Send>>;

pub type Responder = oneshot::Sender<Result<CommandResponse, StoreError>>;

pub struct PartitionApplier {
    store: VersionedRowStore,
    /// In-flight operation tasks per explicit transaction; a finish command
    /// waits for them before promoting or discarding staged values.
    tasks: Mutex<HashMap<TxId, Vec<JoinHandle<()>>>>,
}

impl PartitionApplier {
    pub fn new(store: VersionedRowStore) -> Self {
        Self {
            store,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &VersionedRowStore {
        &self.store
    }

    /// Serves a read command in the calling task. Only reachable on the
    /// leader; reads never enter the log.
    pub async fn execute_read(
        &self,
        envelope: &CommandEnvelope,
    ) -> Result<CommandResponse, StoreError> {
        let result = match &envelope.command {
            Command::Get { key } => self
                .store
                .get_tx(key.clone(), envelope.tx_id)
                .await
                .map(CommandResponse::Row),
            Command::GetAll { keys } => self
                .store
                .get_all_tx(keys.clone(), envelope.tx_id)
                .await
                .map(CommandResponse::Rows),
            other => Err(StoreError::Internal(format!(
                "{} is not a read command",
                other.tag()
            ))),
        };
        if envelope.implicit {
            self.store.finish_tx(envelope.tx_id, result.is_ok());
        }
        result
    }

    /// Applies one committed log entry. Returns without waiting for lock
    /// grants; the responder (present only on the originating replica) fires
    /// when the operation settles.
    pub fn apply(&self, envelope: CommandEnvelope, responder: Option<Responder>) {
        match envelope.command {
            Command::Commit => self.apply_finish(envelope.tx_id, true, responder),
            Command::Rollback => self.apply_finish(envelope.tx_id, false, responder),
            _ => self.apply_operation(envelope, responder),
        }
    }

    fn apply_operation(&self, envelope: CommandEnvelope, responder: Option<Responder>) {
        let tx_id = envelope.tx_id;
        let implicit = envelope.implicit;
        // Lock enqueue happens here, inside the applier turn.
        let operation = self.dispatch(envelope.command, tx_id);
        let store = self.store.clone();
        let handle = tokio::spawn(async move {
            let result = operation.await;
            if implicit {
                store.finish_tx(tx_id, result.is_ok());
            }
            if let Some(responder) = responder {
                let _ = responder.send(result);
            }
        });
        if !implicit {
            self.tasks
                .lock()
                .expect("task table poisoned")
                .entry(tx_id)
                .or_default()
                .push(handle);
        }
    }

    fn apply_finish(&self, tx_id: TxId, commit: bool, responder: Option<Responder>) {
        let handles = self
            .tasks
            .lock()
            .expect("task table poisoned")
            .remove(&tx_id)
            .unwrap_or_default();
        let store = self.store.clone();
        tokio::spawn(async move {
            if commit {
                // Every operation of a committing transaction has its locks
                // granted by now; wait for staging to settle, then promote.
                for handle in handles {
                    let _ = handle.await;
                }
                store.finish_tx(tx_id, true);
            } else {
                // Cancel first: pending lock waiters resolve with a conflict
                // and in-flight tasks observe the swept transaction.
                store.finish_tx(tx_id, false);
                for handle in handles {
                    let _ = handle.await;
                }
            }
            debug!(%tx_id, commit, "transaction finished on partition");
            if let Some(responder) = responder {
                let _ = responder.send(Ok(CommandResponse::None));
            }
        });
    }

    fn dispatch(&self, command: Command, tx_id: TxId) -> CommandFuture {
        match command {
            Command::Get { key } => {
                let op = self.store.get_tx(key, tx_id);
                Box::pin(async move { op.await.map(CommandResponse::Row) })
            }
            Command::GetAll { keys } => {
                let op = self.store.get_all_tx(keys, tx_id);
                Box::pin(async move { op.await.map(CommandResponse::Rows) })
            }
            Command::Upsert { row } => {
                let op = self.store.upsert_tx(row, tx_id);
                Box::pin(async move { op.await.map(|()| CommandResponse::None) })
            }
            Command::UpsertAll { rows } => {
                let op = self.store.upsert_all_tx(rows, tx_id);
                Box::pin(async move { op.await.map(|()| CommandResponse::None) })
            }
            Command::Insert { row } => {
                let op = self.store.insert_tx(row, tx_id);
                Box::pin(async move { op.await.map(CommandResponse::Applied) })
            }
            Command::InsertAll { rows } => {
                let op = self.store.insert_all_tx(rows, tx_id);
                Box::pin(async move { op.await.map(CommandResponse::AppliedAll) })
            }
            Command::Replace { old, new } => {
                let op = self.store.replace_exact_tx(old, new, tx_id);
                Box::pin(async move { op.await.map(CommandResponse::Applied) })
            }
            Command::ReplaceIfExists { row } => {
                let op = self.store.replace_if_exists_tx(row, tx_id);
                Box::pin(async move { op.await.map(CommandResponse::Applied) })
            }
            Command::Delete { key } => {
                let op = self.store.delete_tx(key, tx_id);
                Box::pin(async move { op.await.map(CommandResponse::Applied) })
            }
            Command::DeleteAll { keys } => {
                let op = self.store.delete_all_tx(keys, tx_id);
                Box::pin(async move { op.await.map(CommandResponse::AppliedAll) })
            }
            Command::DeleteExact { row } => {
                let op = self.store.delete_exact_tx(row, tx_id);
                Box::pin(async move { op.await.map(CommandResponse::Applied) })
            }
            Command::DeleteExactAll { rows } => {
                let op = self.store.delete_exact_all_tx(rows, tx_id);
                Box::pin(async move { op.await.map(CommandResponse::AppliedAll) })
            }
            Command::GetAndUpsert { row } => {
                let op = self.store.get_and_upsert_tx(row, tx_id);
                Box::pin(async move { op.await.map(CommandResponse::Row) })
            }
            Command::GetAndReplace { row } => {
                let op = self.store.get_and_replace_tx(row, tx_id);
                Box::pin(async move { op.await.map(CommandResponse::Row) })
            }
            Command::GetAndDelete { key } => {
                let op = self.store.get_and_delete_tx(key, tx_id);
                Box::pin(async move { op.await.map(CommandResponse::Row) })
            }
            Command::Commit | Command::Rollback => Box::pin(async {
                Err(StoreError::Internal(
                    "finish commands are not dispatched as operations".into(),
                ))
            }),
        }
    }
}
