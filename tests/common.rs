use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use latticedb::{Key, LatticeConfig, LatticeNode, Row, Table, Value};

static NEXT_NODE: AtomicU64 = AtomicU64::new(1);
static NEXT_TABLE: AtomicU64 = AtomicU64::new(1);

/// Allocates a unique node id and loopback address so suites sharing the
/// process-global routing registries do not collide.
#[allow(dead_code)]
pub fn unique_config() -> LatticeConfig {
    let id = NEXT_NODE.fetch_add(1, Ordering::SeqCst);
    LatticeConfig::new(id, format!("127.0.0.1:{}", 40_000 + id)).with_partitions(2)
}

#[allow(dead_code)]
pub fn unique_table_name(prefix: &str) -> String {
    format!("{prefix}-{}", NEXT_TABLE.fetch_add(1, Ordering::SeqCst))
}

#[allow(dead_code)]
pub async fn start_node() -> LatticeNode {
    LatticeNode::start(unique_config()).await.expect("node start")
}

#[allow(dead_code)]
pub async fn node_with_table() -> (LatticeNode, Table) {
    let node = start_node().await;
    let table = node
        .create_table(&unique_table_name("kv"))
        .await
        .expect("create table");
    (node, table)
}

#[allow(dead_code)]
pub fn key(name: &str) -> Key {
    name.as_bytes().to_vec()
}

#[allow(dead_code)]
pub fn value(data: &str) -> Value {
    data.as_bytes().to_vec()
}

#[allow(dead_code)]
pub fn row(name: &str, data: &str) -> Row {
    Row::new(key(name), value(data))
}

/// Polls `probe` until it returns true or the deadline passes. Used where a
/// restarted Raft group needs a few ticks to re-elect itself.
#[allow(dead_code)]
pub async fn wait_until<F, Fut>(timeout: Duration, mut probe: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if probe().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
