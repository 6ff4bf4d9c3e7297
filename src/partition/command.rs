//! Command taxonomy applied by partition state machines.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Key, NodeId, Row, TxId, Value};

/// Identifies one submitted operation so the originating node can claim the
/// response when the command is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpId {
    pub node: NodeId,
    pub seq: u64,
}

/// Operations a partition understands. Reads are served leader-side without
/// a log append; writes replicate; finish commands close out a transaction
/// on this partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    Get { key: Key },
    GetAll { keys: Vec<Key> },
    Upsert { row: Row },
    UpsertAll { rows: Vec<Row> },
    Insert { row: Row },
    InsertAll { rows: Vec<Row> },
    Replace { old: Row, new: Row },
    ReplaceIfExists { row: Row },
    Delete { key: Key },
    DeleteAll { keys: Vec<Key> },
    DeleteExact { row: Row },
    DeleteExactAll { rows: Vec<Row> },
    GetAndUpsert { row: Row },
    GetAndReplace { row: Row },
    GetAndDelete { key: Key },
    Commit,
    Rollback,
}

impl Command {
    pub fn is_read(&self) -> bool {
        matches!(self, Command::Get { .. } | Command::GetAll { .. })
    }

    pub fn is_finish(&self) -> bool {
        matches!(self, Command::Commit | Command::Rollback)
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Command::Get { .. } => "get",
            Command::GetAll { .. } => "get_all",
            Command::Upsert { .. } => "upsert",
            Command::UpsertAll { .. } => "upsert_all",
            Command::Insert { .. } => "insert",
            Command::InsertAll { .. } => "insert_all",
            Command::Replace { .. } => "replace",
            Command::ReplaceIfExists { .. } => "replace_if_exists",
            Command::Delete { .. } => "delete",
            Command::DeleteAll { .. } => "delete_all",
            Command::DeleteExact { .. } => "delete_exact",
            Command::DeleteExactAll { .. } => "delete_exact_all",
            Command::GetAndUpsert { .. } => "get_and_upsert",
            Command::GetAndReplace { .. } => "get_and_replace",
            Command::GetAndDelete { .. } => "get_and_delete",
            Command::Commit => "commit",
            Command::Rollback => "rollback",
        }
    }
}

/// Typed response mirroring the command families.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommandResponse {
    /// Single-row result.
    Row(Option<Value>),
    /// Multi-row result aligned with the input key order.
    Rows(Vec<Option<Value>>),
    /// Result of one conditional operation.
    Applied(bool),
    /// Results of a batch of conditional operations, in input order.
    AppliedAll(Vec<bool>),
    /// No payload (upserts and finish commands).
    None,
}

/// What actually travels on the replicated log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub op_id: OpId,
    pub tx_id: TxId,
    /// Set when the operation runs outside a client transaction; the applier
    /// finishes the transaction inline after the operation.
    pub implicit: bool,
    pub command: Command,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed command payload: {0}")]
    Payload(#[from] serde_json::Error),
}

pub fn encode_envelope(envelope: &CommandEnvelope) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(envelope)?)
}

pub fn decode_envelope(bytes: &[u8]) -> Result<CommandEnvelope, CodecError> {
    Ok(serde_json::from_slice(bytes)?)
}
