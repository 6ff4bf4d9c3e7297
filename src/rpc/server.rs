//! gRPC service bridging network clients onto the table and transaction
//! surfaces.

use std::collections::HashMap;
use std::sync::Mutex;

use tonic::{Request, Response, Status};
use tracing::debug;

use crate::node::LatticeNode;
use crate::partition::{Command, CommandResponse, PartitionError};
use crate::storage::store::StoreError;
use crate::table::TableError;
use crate::tx::context::TxContext;
use crate::tx::lock::LockError;
use crate::tx::manager::{TxError, TxFinishRequest};
use crate::types::TxId;

use super::service::lattice_kv_server::LatticeKv;
use super::service::{
    BeginTransactionRequest, BeginTransactionResponse, BoolsResult, Empty, ErrorCode, ErrorInfo,
    ExecuteRequest, ExecuteResponse, ExecuteSuccess, FinishRequest, FinishResponse, RowResult,
    RowsResult, TxId as WireTxId, execute_response, execute_success, finish_response,
};

/// gRPC surface of one node: begin/execute/finish.
pub struct LatticeKvService {
    node: LatticeNode,
    sessions: Mutex<HashMap<TxId, TxContext>>,
    staged_bytes: Mutex<HashMap<TxId, u64>>,
}

impl LatticeKvService {
    const INVALID_TX_ID_MESSAGE: &'static str = "unknown or invalid transaction id";

    pub fn new(node: LatticeNode) -> Self {
        Self {
            node,
            sessions: Mutex::new(HashMap::new()),
            staged_bytes: Mutex::new(HashMap::new()),
        }
    }

    fn store_session(&self, tx: TxContext) {
        self.sessions
            .lock()
            .expect("session map poisoned")
            .insert(tx.tx_id(), tx);
    }

    fn session(&self, tx_id: TxId) -> Option<TxContext> {
        self.sessions
            .lock()
            .expect("session map poisoned")
            .get(&tx_id)
            .cloned()
    }

    fn take_session(&self, tx_id: TxId) -> Option<TxContext> {
        self.sessions
            .lock()
            .expect("session map poisoned")
            .remove(&tx_id)
    }

    /// Session memory quota: bounds the bytes a transaction may stage
    /// through this session before it must finish.
    #[allow(clippy::result_large_err)]
    fn charge_quota(&self, tx_id: TxId, command: &Command) -> Result<(), Status> {
        let added = staged_value_bytes(command);
        if added == 0 {
            return Ok(());
        }
        let quota = self.node.config().session_memory_quota_bytes;
        let mut staged = self.staged_bytes.lock().expect("quota map poisoned");
        let used = staged.entry(tx_id).or_insert(0);
        if used.saturating_add(added) > quota {
            return Err(Status::resource_exhausted(format!(
                "transaction {tx_id} exceeds the session memory quota of {quota} bytes"
            )));
        }
        *used += added;
        Ok(())
    }

    fn release_quota(&self, tx_id: TxId) {
        self.staged_bytes
            .lock()
            .expect("quota map poisoned")
            .remove(&tx_id);
    }
}

#[tonic::async_trait]
impl LatticeKv for LatticeKvService {
    async fn begin_transaction(
        &self,
        request: Request<BeginTransactionRequest>,
    ) -> Result<Response<BeginTransactionResponse>, Status> {
        let client_id = request.into_inner().client_id;
        let tx = self.node.begin();
        debug!(%client_id, tx_id = %tx.tx_id(), "transaction started over rpc");
        let wire = encode_tx(tx.tx_id());
        self.store_session(tx);
        Ok(Response::new(BeginTransactionResponse {
            tx_id: Some(wire),
        }))
    }

    async fn execute(
        &self,
        request: Request<ExecuteRequest>,
    ) -> Result<Response<ExecuteResponse>, Status> {
        let req = request.into_inner();
        let table = self
            .node
            .table(&req.table)
            .ok_or_else(|| Status::not_found(format!("table {} does not exist", req.table)))?;

        let command: Command = serde_json::from_slice(&req.payload)
            .map_err(|err| Status::invalid_argument(format!("malformed command payload: {err}")))?;
        if !req.operation_tag.is_empty() && req.operation_tag != command.tag() {
            return Err(Status::invalid_argument(format!(
                "operation tag {} does not match payload {}",
                req.operation_tag,
                command.tag()
            )));
        }

        let tx = match req.tx_id {
            Some(wire) => {
                let tx_id = decode_tx(wire);
                let tx = self
                    .session(tx_id)
                    .ok_or_else(|| Status::invalid_argument(Self::INVALID_TX_ID_MESSAGE))?;
                self.charge_quota(tx_id, &command)?;
                Some(tx)
            }
            None => None,
        };

        let outcome = match table.execute(command, tx.as_ref()).await {
            Ok(response) => execute_response::Outcome::Success(to_wire_success(response)),
            Err(err) => execute_response::Outcome::Error(table_error_info(&err)),
        };
        Ok(Response::new(ExecuteResponse {
            outcome: Some(outcome),
        }))
    }

    async fn finish(
        &self,
        request: Request<FinishRequest>,
    ) -> Result<Response<FinishResponse>, Status> {
        let req = request.into_inner();
        let tx_id = decode_tx(
            req.tx_id
                .ok_or_else(|| Status::invalid_argument("finish requires a transaction id"))?,
        );

        // A session transaction finishes through its context so the
        // enlistment map drives the fan-out; everything else is a remote
        // coordinator's request with an explicit partition set.
        let result = match self.take_session(tx_id) {
            Some(tx) => {
                if req.commit {
                    tx.commit().await.map(|_| ())
                } else {
                    tx.rollback().await.map(|_| ())
                }
            }
            None => self
                .node
                .tx_manager()
                .handle_finish(TxFinishRequest {
                    tx_id,
                    commit: req.commit,
                    partitions: req.partitions.into_iter().collect(),
                })
                .await
                .map(|_| ()),
        };
        self.release_quota(tx_id);

        let outcome = match result {
            Ok(()) => finish_response::Outcome::Success(Empty {}),
            Err(err) => finish_response::Outcome::Error(tx_error_info(&err)),
        };
        Ok(Response::new(FinishResponse {
            outcome: Some(outcome),
        }))
    }
}

fn encode_tx(tx_id: TxId) -> WireTxId {
    WireTxId {
        ts: tx_id.ts,
        node: tx_id.node,
    }
}

fn decode_tx(wire: WireTxId) -> TxId {
    TxId::new(wire.ts, wire.node)
}

fn row_result(value: Option<Vec<u8>>) -> RowResult {
    match value {
        Some(value) => RowResult { found: true, value },
        None => RowResult {
            found: false,
            value: Vec::new(),
        },
    }
}

fn to_wire_success(response: CommandResponse) -> ExecuteSuccess {
    use execute_success::Result as WireResult;

    let result = match response {
        CommandResponse::Row(value) => WireResult::Row(row_result(value)),
        CommandResponse::Rows(values) => WireResult::Rows(RowsResult {
            rows: values.into_iter().map(row_result).collect(),
        }),
        CommandResponse::Applied(applied) => WireResult::Applied(applied),
        CommandResponse::AppliedAll(values) => WireResult::AppliedAll(BoolsResult { values }),
        CommandResponse::None => WireResult::None(Empty {}),
    };
    ExecuteSuccess {
        result: Some(result),
    }
}

fn table_error_info(err: &TableError) -> ErrorInfo {
    let (code, conflicting) = match err {
        TableError::Partition(PartitionError::Store(StoreError::Lock(LockError::Conflict {
            conflicting,
        }))) => (ErrorCode::LockConflict, Some(*conflicting)),
        TableError::Partition(PartitionError::Store(StoreError::TransactionAborted(_))) => {
            (ErrorCode::TransactionAborted, None)
        }
        TableError::Partition(
            PartitionError::Replication { .. } | PartitionError::NotLeader { .. },
        ) => (ErrorCode::Replication, None),
        TableError::Tx(TxError::Aborted(_)) => (ErrorCode::TransactionAborted, None),
        TableError::TimedOut(_) => (ErrorCode::Timeout, None),
        _ => (ErrorCode::Internal, None),
    };
    ErrorInfo {
        code: code as i32,
        message: err.to_string(),
        conflicting_tx: conflicting.map(encode_tx),
    }
}

fn tx_error_info(err: &TxError) -> ErrorInfo {
    let code = match err {
        TxError::Aborted(_) => ErrorCode::TransactionAborted,
        TxError::Finish { .. } | TxError::Remote { .. } | TxError::Unreachable(_) => {
            ErrorCode::Replication
        }
    };
    ErrorInfo {
        code: code as i32,
        message: err.to_string(),
        conflicting_tx: None,
    }
}

fn staged_value_bytes(command: &Command) -> u64 {
    match command {
        Command::Upsert { row }
        | Command::Insert { row }
        | Command::ReplaceIfExists { row }
        | Command::GetAndUpsert { row }
        | Command::GetAndReplace { row } => row.value.len() as u64,
        Command::Replace { new, .. } => new.value.len() as u64,
        Command::UpsertAll { rows } | Command::InsertAll { rows } => {
            rows.iter().map(|row| row.value.len() as u64).sum()
        }
        _ => 0,
    }
}
