#[path = "common.rs"]
mod common;

use common::{key, row, start_node, unique_table_name, value};
use latticedb::rpc::service::ErrorCode;
use latticedb::{
    ClientConfig, ClientError, LatticeClient, LatticeKvServer, LatticeKvService, LatticeNode, Table,
};
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;

async fn serve(node: LatticeNode) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind loopback listener");
    let addr = listener.local_addr().expect("local addr");
    let service = LatticeKvService::new(node);
    tokio::spawn(
        Server::builder()
            .add_service(LatticeKvServer::new(service))
            .serve_with_incoming(TcpListenerStream::new(listener)),
    );
    format!("http://{addr}")
}

async fn client_fixture() -> (LatticeNode, Table, LatticeClient, String) {
    let node = start_node().await;
    let table_name = unique_table_name("kv");
    let table = node.create_table(&table_name).await.unwrap();
    let endpoint = serve(node.clone()).await;
    let client = LatticeClient::connect(ClientConfig::new(endpoint))
        .await
        .expect("client connect");
    (node, table, client, table_name)
}

#[tokio::test]
async fn client_round_trips_implicit_operations() {
    let (_node, _table, client, table_name) = client_fixture().await;
    let table = client.table(table_name);

    table.upsert(row("k", "1"), None).await.unwrap();
    assert_eq!(table.get(key("k"), None).await.unwrap(), Some(value("1")));
    assert!(table.insert(row("k2", "2"), None).await.unwrap());
    assert!(!table.insert(row("k2", "other"), None).await.unwrap());

    let values = table
        .get_all(vec![key("k2"), key("missing"), key("k")], None)
        .await
        .unwrap();
    assert_eq!(values, vec![Some(value("2")), None, Some(value("1"))]);

    assert!(table.delete(key("k2"), None).await.unwrap());
    assert_eq!(table.get(key("k2"), None).await.unwrap(), None);
}

#[tokio::test]
async fn client_transaction_commit_and_rollback() {
    let (_node, server_table, client, table_name) = client_fixture().await;
    let table = client.table(table_name);
    table.upsert(row("k", "100"), None).await.unwrap();

    let tx = client.begin_transaction("suite").await.unwrap();
    assert_eq!(
        table.get(key("k"), Some(&tx)).await.unwrap(),
        Some(value("100"))
    );
    table.upsert(row("k", "200"), Some(&tx)).await.unwrap();
    tx.commit().await.unwrap();
    assert_eq!(
        server_table.get(&key("k"), None).await.unwrap(),
        Some(value("200"))
    );

    let tx = client.begin_transaction("suite").await.unwrap();
    table.upsert(row("k", "999"), Some(&tx)).await.unwrap();
    tx.rollback().await.unwrap();
    assert_eq!(table.get(key("k"), None).await.unwrap(), Some(value("200")));
}

#[tokio::test]
async fn client_sees_lock_conflicts_with_the_winning_tx() {
    let (_node, _table, client, table_name) = client_fixture().await;
    let table = client.table(table_name);
    table.upsert(row("k", "base"), None).await.unwrap();

    let older = client.begin_transaction("older").await.unwrap();
    let younger = client.begin_transaction("younger").await.unwrap();

    table.upsert(row("k", "young"), Some(&younger)).await.unwrap();
    let err = table
        .upsert(row("k", "old"), Some(&older))
        .await
        .unwrap_err();
    match err {
        ClientError::OperationFailed {
            code,
            conflicting_tx,
            ..
        } => {
            assert_eq!(code, ErrorCode::LockConflict);
            assert_eq!(conflicting_tx, Some(younger.tx_id()));
        }
        other => panic!("expected an operation failure, got {other}"),
    }

    older.rollback().await.unwrap();
    younger.commit().await.unwrap();
    assert_eq!(table.get(key("k"), None).await.unwrap(), Some(value("young")));
}

#[tokio::test]
async fn unknown_transaction_id_is_rejected() {
    let (_node, _table, client, table_name) = client_fixture().await;
    let table = client.table(table_name);

    let tx = client.begin_transaction("ghost").await.unwrap();
    tx.clone().rollback().await.unwrap();

    // The session was consumed by the rollback; reusing the id is refused.
    let err = table.get(key("k"), Some(&tx)).await.unwrap_err();
    assert!(matches!(err, ClientError::Rpc(_)), "got {err}");
}
