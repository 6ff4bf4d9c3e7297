#[path = "common.rs"]
mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use common::{key, node_with_table, row, value};
use latticedb::{LockError, PartitionError, StoreError, TableError};

fn is_lock_conflict(err: &TableError) -> bool {
    matches!(
        err,
        TableError::Partition(PartitionError::Store(StoreError::Lock(LockError::Conflict {
            ..
        })))
    )
}

/// A younger reader's upgrade is invalidated when the oldest reader's
/// upgrade wins and later releases its exclusive lock.
#[tokio::test]
async fn younger_upgrade_is_invalidated_by_older_upgrade() {
    let (node, table) = node_with_table().await;
    table.upsert(row("1", "base"), None).await.unwrap();

    let older = node.begin();
    let younger = node.begin();

    assert_eq!(
        table.get(&key("1"), Some(&older)).await.unwrap(),
        Some(value("base"))
    );
    assert_eq!(
        table.get(&key("1"), Some(&younger)).await.unwrap(),
        Some(value("base"))
    );

    // The younger reader upgrades first; it relinquishes its read lock and
    // waits behind the older one.
    let younger_upgrade = tokio::spawn({
        let table = table.clone();
        let younger = younger.clone();
        async move { table.upsert(row("1", "young"), Some(&younger)).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The older reader's upgrade wins immediately.
    table.upsert(row("1", "old"), Some(&older)).await.unwrap();
    older.commit().await.unwrap();

    // Releasing the exclusive lock fails the younger upgrade.
    let err = younger_upgrade.await.unwrap().unwrap_err();
    assert!(is_lock_conflict(&err), "unexpected error: {err}");
    younger.rollback().await.unwrap();

    assert_eq!(table.get(&key("1"), None).await.unwrap(), Some(value("old")));
    assert!(node.lock_manager().is_empty());
}

/// No lost updates: every successful commit of a read-modify-write cycle is
/// reflected in the final counter, and the lock queues drain completely.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_read_modify_write_loses_no_update() {
    let (node, table) = node_with_table().await;
    table.upsert(row("counter", "0"), None).await.unwrap();

    let committed = Arc::new(AtomicU64::new(0));
    let mut workers = Vec::new();
    for _ in 0..8 {
        let node = node.clone();
        let table = table.clone();
        let committed = committed.clone();
        workers.push(tokio::spawn(async move {
            for _ in 0..5 {
                let tx = node.begin();
                let outcome = async {
                    let current = table
                        .get(&key("counter"), Some(&tx))
                        .await?
                        .and_then(|bytes| String::from_utf8(bytes).ok())
                        .and_then(|text| text.parse::<u64>().ok())
                        .unwrap_or(0);
                    table
                        .upsert(
                            latticedb::Row::new(key("counter"), (current + 1).to_string()),
                            Some(&tx),
                        )
                        .await?;
                    Ok::<(), TableError>(())
                }
                .await;
                match outcome {
                    Ok(()) => {
                        if tx.commit().await.is_ok() {
                            committed.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                    Err(_) => {
                        let _ = tx.rollback().await;
                    }
                }
            }
        }));
    }
    for worker in workers {
        worker.await.unwrap();
    }

    let final_value = table
        .get(&key("counter"), None)
        .await
        .unwrap()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .and_then(|text| text.parse::<u64>().ok())
        .unwrap();
    assert_eq!(final_value, committed.load(Ordering::SeqCst));
    assert!(node.lock_manager().is_empty());
}

/// Reentrancy: one transaction may take shared and exclusive locks on the
/// same key repeatedly without ever conflicting with itself.
#[tokio::test]
async fn reentrant_locking_within_one_transaction() {
    let (node, table) = node_with_table().await;
    table.upsert(row("k", "0"), None).await.unwrap();

    let tx = node.begin();
    for round in 1..=3 {
        assert!(table.get(&key("k"), Some(&tx)).await.unwrap().is_some());
        table
            .upsert(
                latticedb::Row::new(key("k"), round.to_string()),
                Some(&tx),
            )
            .await
            .unwrap();
    }
    tx.commit().await.unwrap();

    assert_eq!(table.get(&key("k"), None).await.unwrap(), Some(value("3")));
    assert!(node.lock_manager().is_empty());
}
