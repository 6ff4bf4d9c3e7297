#[path = "common.rs"]
mod common;

use std::collections::BTreeMap;
use std::time::Duration;

use common::{key, node_with_table, row, start_node, unique_config, unique_table_name, value};
use latticedb::{LatticeNode, TableError, TxState};

#[tokio::test]
async fn cross_partition_commit_drains_all_queues() {
    let node = start_node().await;
    let accounts = node
        .create_table(&unique_table_name("accounts"))
        .await
        .unwrap();
    let customers = node
        .create_table(&unique_table_name("customers"))
        .await
        .unwrap();

    accounts.upsert(row("1", "500"), None).await.unwrap();
    customers.upsert(row("1", "500"), None).await.unwrap();

    let tx = node.begin();
    assert_eq!(
        accounts.get(&key("1"), Some(&tx)).await.unwrap(),
        Some(value("500"))
    );
    assert_eq!(
        customers.get(&key("1"), Some(&tx)).await.unwrap(),
        Some(value("500"))
    );
    accounts.upsert(row("1", "400"), Some(&tx)).await.unwrap();
    customers.upsert(row("1", "600"), Some(&tx)).await.unwrap();
    assert_eq!(tx.commit().await.unwrap(), TxState::Committed);

    assert_eq!(accounts.get(&key("1"), None).await.unwrap(), Some(value("400")));
    assert_eq!(
        customers.get(&key("1"), None).await.unwrap(),
        Some(value("600"))
    );
    assert!(node.lock_manager().is_empty());
}

#[tokio::test]
async fn transaction_spanning_two_nodes_commits_everywhere() {
    let node_a = start_node().await;
    let node_b = start_node().await;
    let table_a = node_a
        .create_table(&unique_table_name("ledger"))
        .await
        .unwrap();
    let table_b = node_b
        .create_table(&unique_table_name("ledger"))
        .await
        .unwrap();

    table_a.upsert(row("1", "500"), None).await.unwrap();
    table_b.upsert(row("1", "500"), None).await.unwrap();

    let tx = node_a.begin();
    table_a.upsert(row("1", "400"), Some(&tx)).await.unwrap();
    table_b.upsert(row("1", "600"), Some(&tx)).await.unwrap();

    // Both addresses are enlisted before commit fans out.
    let enlisted = tx.enlisted();
    assert!(enlisted.contains_key(node_a.config().listen_addr.as_str()));
    assert!(enlisted.contains_key(node_b.config().listen_addr.as_str()));

    assert_eq!(tx.commit().await.unwrap(), TxState::Committed);

    assert_eq!(table_a.get(&key("1"), None).await.unwrap(), Some(value("400")));
    assert_eq!(table_b.get(&key("1"), None).await.unwrap(), Some(value("600")));
    assert_eq!(
        node_b.tx_manager().state(tx.tx_id()),
        Some(TxState::Committed)
    );
    assert!(node_a.lock_manager().is_empty());
    assert!(node_b.lock_manager().is_empty());
}

#[tokio::test]
async fn batch_results_keep_input_order_across_partitions() {
    let (node, table) = node_with_table().await;

    let rows: Vec<_> = (0..8).map(|i| row(&format!("k{i}"), &format!("v{i}"))).collect();
    table.upsert_all(rows, None).await.unwrap();

    let keys: Vec<_> = (0..10).rev().map(|i| key(&format!("k{i}"))).collect();
    let values = table.get_all(&keys, None).await.unwrap();
    assert_eq!(values.len(), 10);
    // k9 and k8 were never written.
    assert_eq!(values[0], None);
    assert_eq!(values[1], None);
    for (offset, index) in (0..8).rev().enumerate() {
        assert_eq!(values[offset + 2], Some(value(&format!("v{index}"))));
    }

    let inserted = table
        .insert_all(vec![row("k0", "x"), row("fresh", "y")], None)
        .await
        .unwrap();
    assert_eq!(inserted, vec![false, true]);

    let deleted = table
        .delete_all(&[key("k0"), key("missing"), key("fresh")], None)
        .await
        .unwrap();
    assert_eq!(deleted, vec![true, false, true]);
    assert!(node.lock_manager().is_empty());
}

#[tokio::test]
async fn delete_exact_all_matches_byte_for_byte() {
    let (_, table) = node_with_table().await;
    table.upsert(row("a", "1"), None).await.unwrap();
    table.upsert(row("b", "2"), None).await.unwrap();

    let applied = table
        .delete_exact_all(vec![row("a", "wrong"), row("b", "2")], None)
        .await
        .unwrap();
    assert_eq!(applied, vec![false, true]);
    assert_eq!(table.get(&key("a"), None).await.unwrap(), Some(value("1")));
    assert_eq!(table.get(&key("b"), None).await.unwrap(), None);
}

#[tokio::test]
async fn wrapped_view_carries_the_transaction() {
    let (node, table) = node_with_table().await;
    table.upsert(row("k", "1"), None).await.unwrap();

    let tx = node.begin();
    let view = tx.wrap(&table);
    assert_eq!(view.get(&key("k")).await.unwrap(), Some(value("1")));
    view.upsert(row("k", "2")).await.unwrap();
    assert!(view.replace_exact(row("k", "2"), row("k", "3")).await.unwrap());
    view.context().commit().await.unwrap();

    assert_eq!(table.get(&key("k"), None).await.unwrap(), Some(value("3")));
}

#[tokio::test]
async fn blocked_operation_times_out_and_rolls_back() {
    let config = unique_config().with_query_timeout_ms(200);
    let node = LatticeNode::start(config).await.unwrap();
    let table = node
        .create_table(&unique_table_name("slow"))
        .await
        .unwrap();
    table.upsert(row("k", "1"), None).await.unwrap();

    let holder = node.begin();
    table.upsert(row("k", "2"), Some(&holder)).await.unwrap();

    // A younger writer queues behind the held exclusive lock and hits the
    // session timeout instead of waiting forever.
    let blocked = node.begin();
    let err = table
        .upsert(row("k", "3"), Some(&blocked))
        .await
        .unwrap_err();
    assert!(matches!(err, TableError::TimedOut(_)), "got {err}");
    assert_eq!(
        node.tx_manager().state(blocked.tx_id()),
        Some(TxState::Aborted)
    );

    holder.commit().await.unwrap();
    assert_eq!(table.get(&key("k"), None).await.unwrap(), Some(value("2")));
    assert!(node.lock_manager().is_empty());
}

#[tokio::test]
async fn replicated_table_applies_on_the_follower() {
    let leader_config = unique_config();
    let follower_config = unique_config();
    let mut members = BTreeMap::new();
    members.insert(leader_config.node_id, leader_config.listen_addr.clone());
    members.insert(follower_config.node_id, follower_config.listen_addr.clone());

    let leader = LatticeNode::start(leader_config).await.unwrap();
    let follower = LatticeNode::start(follower_config).await.unwrap();

    let name = unique_table_name("replicated");
    // The follower hosts its replicas first so the initializer can reach
    // them.
    let follower_table = follower
        .host_table(&name, members.clone(), false)
        .await
        .unwrap();
    let leader_table = leader.host_table(&name, members, true).await.unwrap();

    leader_table.upsert(row("k", "1"), None).await.unwrap();
    assert_eq!(
        leader_table.get(&key("k"), None).await.unwrap(),
        Some(value("1"))
    );

    // The follower's store converges once the entry replicates.
    let group = latticedb::partition_group_id(
        &name,
        latticedb::affinity_partition(&key("k"), follower_table.partition_count()),
    );
    let converged = common::wait_until(Duration::from_secs(5), || {
        let follower = follower.clone();
        let group = group.clone();
        async move {
            let Some(partition) = follower.partition(&group) else {
                return false;
            };
            partition
                .store()
                .export()
                .committed
                .iter()
                .any(|(k, v)| k == &key("k") && v == &value("1"))
        }
    })
    .await;
    assert!(converged, "follower never applied the replicated write");
}
