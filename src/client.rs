//! Asynchronous client library over the gRPC surface.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tonic::transport::Channel;

use crate::partition::{Command, CommandResponse};
use crate::rpc::service::lattice_kv_client::LatticeKvClient;
use crate::rpc::service::{
    BeginTransactionRequest, ErrorCode, ErrorInfo, ExecuteRequest, FinishRequest,
    TxId as WireTxId, execute_response, execute_success, finish_response,
};
use crate::tx::manager::{FinishDispatcher, TxError, TxFinishRequest};
use crate::types::{Key, Row, TxId, Value};

/// Configuration for establishing a client connection to a node.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub endpoint: String,
}

impl ClientConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }
}

/// Errors surfaced by the client library.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
    #[error("rpc error: {0}")]
    Rpc(#[from] tonic::Status),
    #[error("{operation} failed ({code:?}): {message}")]
    OperationFailed {
        operation: &'static str,
        code: ErrorCode,
        message: String,
        conflicting_tx: Option<TxId>,
    },
    #[error("malformed {0} response from server")]
    MalformedResponse(&'static str),
    #[error("failed to encode command: {0}")]
    Codec(#[from] serde_json::Error),
}

#[derive(Clone)]
pub struct LatticeClient {
    inner: Arc<LatticeKvClient<Channel>>,
}

impl LatticeClient {
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let client = LatticeKvClient::connect(config.endpoint.clone()).await?;
        Ok(Self {
            inner: Arc::new(client),
        })
    }

    pub fn table(&self, name: impl Into<String>) -> ClientTable {
        ClientTable {
            client: self.clone(),
            name: name.into(),
        }
    }

    pub async fn begin_transaction(
        &self,
        client_id: impl Into<String>,
    ) -> Result<ClientTransaction, ClientError> {
        let mut client = self.inner.as_ref().clone();
        let response = client
            .begin_transaction(BeginTransactionRequest {
                client_id: client_id.into(),
            })
            .await?
            .into_inner();
        let tx_id = response
            .tx_id
            .map(decode_tx)
            .ok_or(ClientError::MalformedResponse("begin_transaction"))?;
        Ok(ClientTransaction {
            client: self.clone(),
            tx_id,
        })
    }

    async fn finish(&self, tx_id: TxId, commit: bool) -> Result<(), ClientError> {
        let mut client = self.inner.as_ref().clone();
        let response = client
            .finish(FinishRequest {
                tx_id: Some(encode_tx(tx_id)),
                commit,
                partitions: Vec::new(),
            })
            .await?
            .into_inner();
        match response.outcome {
            Some(finish_response::Outcome::Success(_)) => Ok(()),
            Some(finish_response::Outcome::Error(info)) => Err(operation_failed(
                if commit { "commit" } else { "rollback" },
                info,
            )),
            None => Err(ClientError::MalformedResponse("finish")),
        }
    }
}

/// Client-side handle to one table.
#[derive(Clone)]
pub struct ClientTable {
    client: LatticeClient,
    name: String,
}

impl ClientTable {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sends any command; the typed helpers below cover the common cases.
    pub async fn execute(
        &self,
        command: Command,
        tx: Option<&ClientTransaction>,
    ) -> Result<CommandResponse, ClientError> {
        let operation = command.tag();
        let payload = serde_json::to_vec(&command)?;
        let request = ExecuteRequest {
            table: self.name.clone(),
            tx_id: tx.map(|tx| encode_tx(tx.tx_id)),
            operation_tag: operation.to_string(),
            payload,
        };
        let mut client = self.client.inner.as_ref().clone();
        let response = client.execute(request).await?.into_inner();
        match response.outcome {
            Some(execute_response::Outcome::Success(success)) => {
                from_wire_success(success, operation)
            }
            Some(execute_response::Outcome::Error(info)) => Err(operation_failed(operation, info)),
            None => Err(ClientError::MalformedResponse("execute")),
        }
    }

    pub async fn get(
        &self,
        key: impl Into<Key>,
        tx: Option<&ClientTransaction>,
    ) -> Result<Option<Value>, ClientError> {
        match self.execute(Command::Get { key: key.into() }, tx).await? {
            CommandResponse::Row(value) => Ok(value),
            _ => Err(ClientError::MalformedResponse("get")),
        }
    }

    pub async fn get_all(
        &self,
        keys: Vec<Key>,
        tx: Option<&ClientTransaction>,
    ) -> Result<Vec<Option<Value>>, ClientError> {
        match self.execute(Command::GetAll { keys }, tx).await? {
            CommandResponse::Rows(rows) => Ok(rows),
            _ => Err(ClientError::MalformedResponse("get_all")),
        }
    }

    pub async fn upsert(&self, row: Row, tx: Option<&ClientTransaction>) -> Result<(), ClientError> {
        match self.execute(Command::Upsert { row }, tx).await? {
            CommandResponse::None => Ok(()),
            _ => Err(ClientError::MalformedResponse("upsert")),
        }
    }

    pub async fn insert(
        &self,
        row: Row,
        tx: Option<&ClientTransaction>,
    ) -> Result<bool, ClientError> {
        match self.execute(Command::Insert { row }, tx).await? {
            CommandResponse::Applied(applied) => Ok(applied),
            _ => Err(ClientError::MalformedResponse("insert")),
        }
    }

    pub async fn delete(
        &self,
        key: impl Into<Key>,
        tx: Option<&ClientTransaction>,
    ) -> Result<bool, ClientError> {
        match self.execute(Command::Delete { key: key.into() }, tx).await? {
            CommandResponse::Applied(applied) => Ok(applied),
            _ => Err(ClientError::MalformedResponse("delete")),
        }
    }
}

/// Client-side representation of an active transaction.
#[derive(Clone)]
pub struct ClientTransaction {
    client: LatticeClient,
    tx_id: TxId,
}

impl ClientTransaction {
    pub fn tx_id(&self) -> TxId {
        self.tx_id
    }

    pub async fn commit(self) -> Result<(), ClientError> {
        self.client.finish(self.tx_id, true).await
    }

    pub async fn rollback(self) -> Result<(), ClientError> {
        self.client.finish(self.tx_id, false).await
    }
}

/// Dispatches finish requests to remote nodes over their gRPC endpoint.
/// Used instead of the in-process loopback when nodes run in separate
/// processes.
pub struct GrpcFinishDispatcher;

#[async_trait]
impl FinishDispatcher for GrpcFinishDispatcher {
    async fn dispatch(&self, target: &str, request: TxFinishRequest) -> Result<(), TxError> {
        let endpoint = format!("http://{target}");
        let mut client =
            LatticeKvClient::connect(endpoint)
                .await
                .map_err(|err| TxError::Remote {
                    target: target.to_string(),
                    message: err.to_string(),
                })?;
        let response = client
            .finish(FinishRequest {
                tx_id: Some(encode_tx(request.tx_id)),
                commit: request.commit,
                partitions: request.partitions.into_iter().collect(),
            })
            .await
            .map_err(|err| TxError::Remote {
                target: target.to_string(),
                message: err.to_string(),
            })?
            .into_inner();
        match response.outcome {
            Some(finish_response::Outcome::Success(_)) => Ok(()),
            Some(finish_response::Outcome::Error(info)) => Err(TxError::Remote {
                target: target.to_string(),
                message: info.message,
            }),
            None => Err(TxError::Remote {
                target: target.to_string(),
                message: "malformed finish response".into(),
            }),
        }
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

fn operation_failed(operation: &'static str, info: ErrorInfo) -> ClientError {
    ClientError::OperationFailed {
        operation,
        code: ErrorCode::try_from(info.code).unwrap_or(ErrorCode::Unspecified),
        message: info.message,
        conflicting_tx: info.conflicting_tx.map(decode_tx),
    }
}

fn from_wire_success(
    success: crate::rpc::service::ExecuteSuccess,
    operation: &'static str,
) -> Result<CommandResponse, ClientError> {
    use execute_success::Result as WireResult;

    let result = success
        .result
        .ok_or(ClientError::MalformedResponse(operation))?;
    Ok(match result {
        WireResult::Row(row) => CommandResponse::Row(row.found.then_some(row.value)),
        WireResult::Rows(rows) => CommandResponse::Rows(
            rows.rows
                .into_iter()
                .map(|row| row.found.then_some(row.value))
                .collect(),
        ),
        WireResult::Applied(applied) => CommandResponse::Applied(applied),
        WireResult::AppliedAll(values) => CommandResponse::AppliedAll(values.values),
        WireResult::None(_) => CommandResponse::None,
    })
}
