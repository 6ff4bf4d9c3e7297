use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Node-wide configuration loaded at startup.
///
/// The tuning knobs that reach the transactional core are exactly the ones
/// listed here; everything else configures the outer layers (RPC endpoint,
/// peer wiring, persistence location).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LatticeConfig {
    /// Stable identifier for the node within the cluster.
    pub node_id: u64,
    /// Address the RPC server will bind to (e.g. `127.0.0.1:50051`).
    pub listen_addr: String,
    /// Peer endpoints used when establishing replicated partition groups.
    pub peers: Vec<String>,
    /// Optional on-disk path for persisting Raft state between restarts.
    pub data_dir: Option<PathBuf>,
    /// Ceiling on the time a single table operation may take before the
    /// enclosing transaction is rolled back.
    pub default_query_timeout_ms: u64,
    /// Budget for uncommitted bytes staged by one session transaction.
    pub session_memory_quota_bytes: u64,
    /// Number of partitions created for each table.
    pub partition_count_per_table: u32,
    /// Number of replicas each partition group is created with.
    pub replication_factor_per_table: u32,
    /// Column names forwarded to the marshalling layer when it derives
    /// affinity key bytes; the core itself hashes whole keys.
    pub affinity_columns: Vec<String>,
}

impl LatticeConfig {
    pub fn new(node_id: u64, listen_addr: impl Into<String>) -> Self {
        Self {
            node_id,
            listen_addr: listen_addr.into(),
            ..Self::default()
        }
    }

    pub fn with_partitions(mut self, count: u32) -> Self {
        self.partition_count_per_table = count;
        self
    }

    pub fn with_query_timeout_ms(mut self, millis: u64) -> Self {
        self.default_query_timeout_ms = millis;
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }
}

impl Default for LatticeConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            listen_addr: "127.0.0.1:50051".into(),
            peers: Vec::new(),
            data_dir: None,
            default_query_timeout_ms: 10_000,
            session_memory_quota_bytes: 64 * 1024 * 1024,
            partition_count_per_table: 4,
            replication_factor_per_table: 1,
            affinity_columns: Vec::new(),
        }
    }
}
