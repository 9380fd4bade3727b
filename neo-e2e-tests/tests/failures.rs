//! Failure scenarios: replica loss mid-commit, corrupted replica answers,
//! the operational gate, and cache coherence across clients.

use std::time::Duration;

use neo_client::{AppTransaction, NoResolver};
use neo_common::Tid;
use neo_e2e_tests::{wait_until, TestCluster};
use neo_errors::NeoError;
use neo_storage::database::StoredObject;

#[tokio::test]
async fn commit_survives_losing_one_replica_during_vote() {
    let cluster = TestCluster::start(1, 1, 2).await;
    let client = cluster.client().await;

    let txn = AppTransaction::new(1);
    client.tpc_begin(&txn, None).await.unwrap();
    let oid = client.new_oid().await.unwrap();
    client
        .store(oid, Tid::ZERO, b"replicated", "", &txn)
        .await
        .unwrap();
    // let both replicas acknowledge the store before one goes away
    tokio::time::sleep(Duration::from_millis(200)).await;

    cluster.storages[0].shutdown();
    let master = &cluster.master.master;
    wait_until(Duration::from_secs(5), || master.operational()).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    client.tpc_vote(&txn, &NoResolver).await.unwrap();
    let tid = client.tpc_finish(&txn).await.unwrap();

    let reader = cluster.client().await;
    let (data, serial) = reader.load(oid).await.unwrap();
    assert_eq!(&data[..], b"replicated");
    assert_eq!(serial, tid);
}

#[tokio::test]
async fn corrupted_replica_answers_are_retried_on_the_other_replica() {
    let cluster = TestCluster::start(1, 1, 2).await;
    let client = cluster.client().await;

    let txn = AppTransaction::new(1);
    client.tpc_begin(&txn, None).await.unwrap();
    let oid = client.new_oid().await.unwrap();
    client
        .store(oid, Tid::ZERO, b"intact", "", &txn)
        .await
        .unwrap();
    client.tpc_vote(&txn, &NoResolver).await.unwrap();
    let tid = client.tpc_finish(&txn).await.unwrap();

    // corrupt the revision on one replica: its announced checksum no
    // longer matches the payload
    {
        let mut db = cluster.storages[0].storage.database();
        let revision = db.load(oid, None, None).expect("revision committed");
        db.commit_object(oid, revision.serial, StoredObject {
            compression: revision.object.compression,
            checksum: [0; 20],
            data: revision.object.data,
        });
    }

    // fresh clients pick replicas at random; every read must still verify
    for _ in 0..6 {
        let reader = cluster.client().await;
        let (data, serial) = reader.load(oid).await.unwrap();
        assert_eq!(&data[..], b"intact");
        assert_eq!(serial, tid);
    }
}

#[tokio::test]
async fn begin_is_refused_once_the_cluster_loses_a_partition() {
    let cluster = TestCluster::start(1, 0, 1).await;
    let client = cluster.client().await;

    cluster.storages[0].shutdown();
    let master = &cluster.master.master;
    wait_until(Duration::from_secs(5), || !master.operational()).await;

    let txn = AppTransaction::new(1);
    match client.tpc_begin(&txn, None).await {
        Err(NeoError::NodeNotReady(_)) => {}
        other => panic!("expected not-ready, got {other:?}"),
    }
}

#[tokio::test]
async fn invalidations_keep_other_clients_coherent() {
    let cluster = TestCluster::start(1, 0, 1).await;
    let writer = cluster.client().await;
    let reader = cluster.client().await;

    let setup = AppTransaction::new(1);
    writer.tpc_begin(&setup, None).await.unwrap();
    let oid = writer.new_oid().await.unwrap();
    writer
        .store(oid, Tid::ZERO, b"old", "", &setup)
        .await
        .unwrap();
    writer.tpc_vote(&setup, &NoResolver).await.unwrap();
    let t1 = writer.tpc_finish(&setup).await.unwrap();

    // warm the reader's cache
    let (data, serial) = reader.load(oid).await.unwrap();
    assert_eq!(&data[..], b"old");
    assert_eq!(serial, t1);

    let update = AppTransaction::new(2);
    writer.tpc_begin(&update, None).await.unwrap();
    writer.store(oid, t1, b"new", "", &update).await.unwrap();
    writer.tpc_vote(&update, &NoResolver).await.unwrap();
    let t2 = writer.tpc_finish(&update).await.unwrap();

    // the invalidation reaches the reader and the next load observes the
    // new revision
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let (data, serial) = reader.load(oid).await.unwrap();
        if serial >= t2 {
            assert_eq!(&data[..], b"new");
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "reader never observed the invalidation"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn load_before_walks_revision_boundaries() {
    let cluster = TestCluster::start(1, 0, 1).await;
    let client = cluster.client().await;

    let first = AppTransaction::new(1);
    client.tpc_begin(&first, None).await.unwrap();
    let oid = client.new_oid().await.unwrap();
    client.store(oid, Tid::ZERO, b"v1", "", &first).await.unwrap();
    client.tpc_vote(&first, &NoResolver).await.unwrap();
    let t1 = client.tpc_finish(&first).await.unwrap();

    let second = AppTransaction::new(2);
    client.tpc_begin(&second, None).await.unwrap();
    client.store(oid, t1, b"v2", "", &second).await.unwrap();
    client.tpc_vote(&second, &NoResolver).await.unwrap();
    let t2 = client.tpc_finish(&second).await.unwrap();

    let (data, start, end) = client.load_before(oid, t2).await.unwrap().unwrap();
    assert_eq!(&data[..], b"v1");
    assert_eq!(start, t1);
    assert_eq!(end, Some(t2));

    // nothing exists before the first revision
    assert!(client.load_before(oid, t1).await.unwrap().is_none());

    // and the exact revision is reachable by serial
    assert_eq!(&client.load_serial(oid, t1).await.unwrap()[..], b"v1");
}
