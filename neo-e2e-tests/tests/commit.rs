//! Commit-path scenarios: plain commits, conflicts with and without
//! resolution, and the transaction-handle fast paths.

use neo_client::{AppTransaction, ConflictResolver, NoResolver};
use neo_common::{Oid, Tid};
use neo_e2e_tests::TestCluster;
use neo_errors::NeoError;

/// Resolver that settles every conflict with a fixed payload.
struct MergeTo(Vec<u8>);

impl ConflictResolver for MergeTo {
    fn resolve(&self, _oid: Oid, _committed: Tid, _base: Tid, _data: &[u8]) -> Option<Vec<u8>> {
        Some(self.0.clone())
    }
}

#[tokio::test]
async fn single_commit_and_load_back() {
    let cluster = TestCluster::start(1, 0, 1).await;
    let client = cluster.client().await;

    let txn = AppTransaction::new(1);
    let tid = client.tpc_begin(&txn, None).await.unwrap();
    let oid = client.new_oid().await.unwrap();
    client
        .store(oid, Tid::ZERO, b"hello", "", &txn)
        .await
        .unwrap();
    let resolved = client.tpc_vote(&txn, &NoResolver).await.unwrap();
    assert!(resolved.is_empty());
    let committed = client.tpc_finish(&txn).await.unwrap();
    assert_eq!(committed, tid);

    // a fresh client reads through the storage, not the commit cache
    let reader = cluster.client().await;
    let (data, serial) = reader.load(oid).await.unwrap();
    assert_eq!(&data[..], b"hello");
    assert_eq!(serial, tid);
}

#[tokio::test]
async fn tids_are_strictly_monotonic_across_commits() {
    let cluster = TestCluster::start(3, 0, 1).await;
    let client = cluster.client().await;

    let mut last = Tid::ZERO;
    for id in 1..=3 {
        let txn = AppTransaction::new(id);
        let tid = client.tpc_begin(&txn, None).await.unwrap();
        assert!(tid > last, "tid {tid} not beyond {last}");
        last = tid;
        let oid = client.new_oid().await.unwrap();
        client
            .store(oid, Tid::ZERO, b"payload", "", &txn)
            .await
            .unwrap();
        client.tpc_vote(&txn, &NoResolver).await.unwrap();
        client.tpc_finish(&txn).await.unwrap();
    }
}

#[tokio::test]
async fn unresolved_conflict_fails_the_vote() {
    let cluster = TestCluster::start(1, 0, 1).await;
    let writer = cluster.client().await;
    let other = cluster.client().await;

    let setup = AppTransaction::new(1);
    writer.tpc_begin(&setup, None).await.unwrap();
    let oid = writer.new_oid().await.unwrap();
    writer
        .store(oid, Tid::ZERO, b"first", "", &setup)
        .await
        .unwrap();
    writer.tpc_vote(&setup, &NoResolver).await.unwrap();
    let committed = writer.tpc_finish(&setup).await.unwrap();

    // the second writer stores against the now-stale base serial
    let stale = AppTransaction::new(2);
    other.tpc_begin(&stale, None).await.unwrap();
    other
        .store(oid, Tid::ZERO, b"second", "", &stale)
        .await
        .unwrap();
    match other.tpc_vote(&stale, &NoResolver).await {
        Err(NeoError::Conflict { oid: conflicted, serial, base, .. }) => {
            assert_eq!(conflicted, oid.get());
            assert_eq!(serial, committed.get());
            assert_eq!(base, Tid::ZERO.get());
        }
        other => panic!("expected a conflict, got {other:?}"),
    }
    other.tpc_abort(&stale).await.unwrap();
}

#[tokio::test]
async fn resolved_conflict_converges_to_the_merged_value() {
    let cluster = TestCluster::start(1, 0, 1).await;
    let base_writer = cluster.client().await;
    let incrementer = cluster.client().await;
    let racer = cluster.client().await;

    // counter at 0
    let setup = AppTransaction::new(1);
    base_writer.tpc_begin(&setup, None).await.unwrap();
    let oid = base_writer.new_oid().await.unwrap();
    base_writer
        .store(oid, Tid::ZERO, b"0", "", &setup)
        .await
        .unwrap();
    base_writer.tpc_vote(&setup, &NoResolver).await.unwrap();
    let t0 = base_writer.tpc_finish(&setup).await.unwrap();

    // +1 commits first
    let add_one = AppTransaction::new(2);
    incrementer.tpc_begin(&add_one, None).await.unwrap();
    incrementer.store(oid, t0, b"1", "", &add_one).await.unwrap();
    incrementer.tpc_vote(&add_one, &NoResolver).await.unwrap();
    incrementer.tpc_finish(&add_one).await.unwrap();

    // +2 based on the same t0 conflicts and resolves to 3
    let add_two = AppTransaction::new(3);
    racer.tpc_begin(&add_two, None).await.unwrap();
    racer.store(oid, t0, b"2", "", &add_two).await.unwrap();
    let resolved = racer
        .tpc_vote(&add_two, &MergeTo(b"3".to_vec()))
        .await
        .unwrap();
    assert_eq!(resolved, vec![oid]);
    let final_tid = racer.tpc_finish(&add_two).await.unwrap();

    let reader = cluster.client().await;
    let (data, serial) = reader.load(oid).await.unwrap();
    assert_eq!(&data[..], b"3");
    assert_eq!(serial, final_tid);
}

#[tokio::test]
async fn begin_is_idempotent_and_foreign_abort_is_a_no_op() {
    let cluster = TestCluster::start(1, 0, 1).await;
    let client = cluster.client().await;

    let txn = AppTransaction::new(1);
    let first = client.tpc_begin(&txn, None).await.unwrap();
    let second = client.tpc_begin(&txn, None).await.unwrap();
    assert_eq!(first, second);

    // aborting a handle that never began changes nothing
    let foreign = AppTransaction::new(99);
    client.tpc_abort(&foreign).await.unwrap();
    assert_eq!(client.tpc_begin(&txn, None).await.unwrap(), first);

    // a different handle cannot begin while the first is active
    let other = AppTransaction::new(2);
    assert!(client.tpc_begin(&other, None).await.is_err());

    client.tpc_abort(&txn).await.unwrap();
}

#[tokio::test]
async fn abort_releases_locks_for_the_next_writer() {
    let cluster = TestCluster::start(1, 0, 1).await;
    let client = cluster.client().await;

    let abandoned = AppTransaction::new(1);
    client.tpc_begin(&abandoned, None).await.unwrap();
    let oid = client.new_oid().await.unwrap();
    client
        .store(oid, Tid::ZERO, b"never", "", &abandoned)
        .await
        .unwrap();
    client.tpc_abort(&abandoned).await.unwrap();

    let committed = AppTransaction::new(2);
    client.tpc_begin(&committed, None).await.unwrap();
    client
        .store(oid, Tid::ZERO, b"kept", "", &committed)
        .await
        .unwrap();
    client.tpc_vote(&committed, &NoResolver).await.unwrap();
    let tid = client.tpc_finish(&committed).await.unwrap();

    let reader = cluster.client().await;
    let (data, serial) = reader.load(oid).await.unwrap();
    assert_eq!(&data[..], b"kept");
    assert_eq!(serial, tid);
}

#[tokio::test]
async fn store_against_a_foreign_transaction_is_refused() {
    let cluster = TestCluster::start(1, 0, 1).await;
    let client = cluster.client().await;

    let txn = AppTransaction::new(1);
    client.tpc_begin(&txn, None).await.unwrap();
    let oid = client.new_oid().await.unwrap();
    let foreign = AppTransaction::new(2);
    match client.store(oid, Tid::ZERO, b"x", "", &foreign).await {
        Err(NeoError::StorageTransaction) => {}
        other => panic!("expected a transaction mismatch, got {other:?}"),
    }
    client.tpc_abort(&txn).await.unwrap();
}
