use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Key bytes as produced by the marshalling layer. The core never interprets
/// them.
pub type Key = Vec<u8>;
/// Raw value payload stored per key. Compared byte-for-byte by the
/// conditional operations.
pub type Value = Vec<u8>;
/// Stable identifier of a node within the cluster.
pub type NodeId = u64;

/// Globally ordered transaction identifier.
///
/// The timestamp half is issued monotonically by the originating node; the
/// node half breaks ties so the order is strict across the cluster. This
/// order is the wound-wait priority: a smaller `TxId` is the older
/// transaction.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct TxId {
    pub ts: u64,
    pub node: NodeId,
}

impl TxId {
    pub fn new(ts: u64, node: NodeId) -> Self {
        Self { ts, node }
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ts, self.node)
    }
}

/// A full row: key plus value bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    pub key: Key,
    pub value: Value,
}

impl Row {
    pub fn new(key: impl Into<Key>, value: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Replication group identifier for one partition of one table.
pub fn partition_group_id(table: &str, partition: u32) -> String {
    format!("{table}-part-{partition}")
}

/// Maps affinity key bytes onto a partition index with a hash that is stable
/// for the lifetime of the process group.
pub fn affinity_partition(key: &[u8], partitions: u32) -> u32 {
    assert!(partitions > 0, "table must have at least one partition");
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % u64::from(partitions)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tx_id_orders_by_timestamp_then_node() {
        let older = TxId::new(1, 9);
        let younger = TxId::new(2, 0);
        assert!(older < younger);

        let left = TxId::new(5, 1);
        let right = TxId::new(5, 2);
        assert!(left < right);
    }

    #[test]
    fn affinity_is_stable_and_in_range() {
        let key = b"account-17".to_vec();
        let first = affinity_partition(&key, 8);
        let second = affinity_partition(&key, 8);
        assert_eq!(first, second);
        assert!(first < 8);
    }
}
