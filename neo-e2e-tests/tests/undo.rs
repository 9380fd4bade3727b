//! Undo scenarios: reverting an object creation and the history and
//! transaction-log surfaces that support the undo UI.

use neo_client::{AppTransaction, NoResolver};
use neo_common::Tid;
use neo_e2e_tests::TestCluster;
use neo_errors::NeoError;

#[tokio::test]
async fn undoing_a_creation_removes_the_object() {
    let cluster = TestCluster::start(1, 0, 1).await;
    let client = cluster.client().await;

    let create = AppTransaction::new(1);
    client.tpc_begin(&create, None).await.unwrap();
    let oid = client.new_oid().await.unwrap();
    client
        .store(oid, Tid::ZERO, b"created", "", &create)
        .await
        .unwrap();
    client.tpc_vote(&create, &NoResolver).await.unwrap();
    let created_at = client.tpc_finish(&create).await.unwrap();

    let undo = AppTransaction::new(2);
    let undo_tid = client.tpc_begin(&undo, None).await.unwrap();
    let (tid, oids) = client.undo(created_at, &undo, &NoResolver).await.unwrap();
    assert_eq!(tid, undo_tid);
    assert_eq!(oids, vec![oid]);
    client.tpc_vote(&undo, &NoResolver).await.unwrap();
    client.tpc_finish(&undo).await.unwrap();

    match client.load(oid).await {
        Err(NeoError::NotFound(_)) => {}
        other => panic!("expected the object gone, got {other:?}"),
    }
}

#[tokio::test]
async fn undo_of_a_transaction_modified_since_needs_the_resolver() {
    let cluster = TestCluster::start(1, 0, 1).await;
    let client = cluster.client().await;

    let create = AppTransaction::new(1);
    client.tpc_begin(&create, None).await.unwrap();
    let oid = client.new_oid().await.unwrap();
    client
        .store(oid, Tid::ZERO, b"v1", "", &create)
        .await
        .unwrap();
    client.tpc_vote(&create, &NoResolver).await.unwrap();
    let t1 = client.tpc_finish(&create).await.unwrap();

    let update = AppTransaction::new(2);
    client.tpc_begin(&update, None).await.unwrap();
    client.store(oid, t1, b"v2", "", &update).await.unwrap();
    client.tpc_vote(&update, &NoResolver).await.unwrap();
    client.tpc_finish(&update).await.unwrap();

    // undoing t1 now requires merging, and the resolver refuses
    let undo = AppTransaction::new(3);
    client.tpc_begin(&undo, None).await.unwrap();
    match client.undo(t1, &undo, &NoResolver).await {
        Err(NeoError::Undo { oid: blocked, .. }) => assert_eq!(blocked, oid.get()),
        other => panic!("expected an undo error, got {other:?}"),
    }
    client.tpc_abort(&undo).await.unwrap();
}

#[tokio::test]
async fn history_and_undo_log_list_commits_newest_first() {
    let cluster = TestCluster::start(1, 0, 1).await;
    let client = cluster.client().await;

    let mut first = AppTransaction::new(1);
    first.user = "alice".into();
    client.tpc_begin(&first, None).await.unwrap();
    let oid = client.new_oid().await.unwrap();
    client
        .store(oid, Tid::ZERO, b"one", "", &first)
        .await
        .unwrap();
    client.tpc_vote(&first, &NoResolver).await.unwrap();
    let t1 = client.tpc_finish(&first).await.unwrap();

    let mut second = AppTransaction::new(2);
    second.user = "bob".into();
    client.tpc_begin(&second, None).await.unwrap();
    client.store(oid, t1, b"two!", "", &second).await.unwrap();
    client.tpc_vote(&second, &NoResolver).await.unwrap();
    let t2 = client.tpc_finish(&second).await.unwrap();

    let history = client.history(oid, 10).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].tid, t2);
    assert_eq!(history[0].user, "bob");
    assert_eq!(history[0].size, 4);
    assert_eq!(history[1].tid, t1);
    assert_eq!(history[1].user, "alice");

    let log = client.undo_log(0, 10).await.unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].tid, t2);
    assert_eq!(log[1].tid, t1);
    assert_eq!(log[1].oids, vec![oid]);

    assert_eq!(client.get_serial(oid).await.unwrap(), t2);
}
