//! Storage-side transaction state: per-OID write locks, pending data
//! waiting for the master's unlock, and the queue of stores delayed behind
//! a foreign lock.

use std::collections::{HashMap, VecDeque};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use neo_common::{Oid, Tid};
use neo_protocol::{Packet, TransactionInfo};

use crate::database::{MemoryDatabase, StoredObject};

/// Outcome of one store attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum StoreOutcome {
    /// Locked and staged; answer success.
    Stored,
    /// The base serial is stale; answer the committed serial.
    Conflict(Tid),
    /// Another transaction holds the lock; the answer is delayed until it
    /// releases.
    Delayed,
}

/// A store waiting behind a foreign lock, answered on release.
#[derive(Debug)]
pub struct QueuedStore {
    /// Storing transaction.
    pub tid: Tid,
    /// The object.
    pub oid: Oid,
    /// Base serial of the attempt.
    pub serial: Tid,
    /// Payload to stage.
    pub object: StoredObject,
    /// Where the delayed answer goes.
    pub reply_tx: mpsc::UnboundedSender<Packet>,
    /// Correlation id of the delayed answer.
    pub reply_msg_id: u32,
}

/// Everything one transaction staged on this storage.
#[derive(Debug, Default)]
pub struct PendingTransaction {
    /// Object payloads staged by stores, keyed by OID, with base serials.
    pub objects: HashMap<Oid, (Tid, StoredObject)>,
    /// Undo reverts staged for this transaction.
    pub reverts: HashMap<Oid, StoredObject>,
    /// Transaction metadata, present on TID-partition storages after the
    /// vote.
    pub meta: Option<TransactionInfo>,
    /// Whether the master asked for the lock.
    pub locked: bool,
}

/// The lock table and pending-transaction store.
#[derive(Debug, Default)]
pub struct StorageTransactions {
    pending: HashMap<Tid, PendingTransaction>,
    locks: HashMap<Oid, Tid>,
    delayed: HashMap<Oid, VecDeque<QueuedStore>>,
}

impl StorageTransactions {
    /// Empty state.
    pub fn new() -> Self {
        StorageTransactions::default()
    }

    /// Who holds the write lock on `oid`.
    pub fn lock_holder(&self, oid: Oid) -> Option<Tid> {
        self.locks.get(&oid).copied()
    }

    /// Attempt to stage one store under `tid`'s write lock.
    pub fn store_object(
        &mut self,
        db: &MemoryDatabase,
        tid: Tid,
        oid: Oid,
        serial: Tid,
        object: StoredObject,
    ) -> StoreOutcome {
        match self.locks.get(&oid) {
            Some(holder) if *holder == tid => {
                // conflict resolution re-store replaces the staged payload
                let pending = self.pending.entry(tid).or_default();
                pending.objects.insert(oid, (serial, object));
                StoreOutcome::Stored
            }
            Some(_) => StoreOutcome::Delayed,
            None => {
                let committed = db.current_serial(oid).unwrap_or(Tid::ZERO);
                if committed != serial {
                    debug!(%oid, %serial, %committed, "store conflict");
                    return StoreOutcome::Conflict(committed);
                }
                self.locks.insert(oid, tid);
                let pending = self.pending.entry(tid).or_default();
                pending.objects.insert(oid, (serial, object));
                StoreOutcome::Stored
            }
        }
    }

    /// Park a store delayed behind a foreign lock.
    pub fn delay(&mut self, queued: QueuedStore) {
        self.delayed.entry(queued.oid).or_default().push_back(queued);
    }

    /// Stage undo reverts: for each OID, lock it for `tid` and remember the
    /// revision it reverts to.
    pub fn stage_revert(&mut self, tid: Tid, oid: Oid, target: StoredObject) {
        self.locks.insert(oid, tid);
        self.pending.entry(tid).or_default().reverts.insert(oid, target);
    }

    /// Record transaction metadata from the vote.
    pub fn store_meta(&mut self, info: TransactionInfo) {
        let tid = info.tid;
        self.pending.entry(tid).or_default().meta = Some(info);
    }

    /// The master asked to lock `tid`. Idempotent.
    pub fn lock(&mut self, tid: Tid) {
        self.pending.entry(tid).or_default().locked = true;
    }

    /// The master released `tid`: commit everything staged, free the locks,
    /// and hand back the stores that were waiting on them.
    pub fn unlock(&mut self, db: &mut MemoryDatabase, tid: Tid) -> Vec<QueuedStore> {
        let Some(pending) = self.pending.remove(&tid) else {
            warn!(%tid, "unlock for an unknown transaction");
            return Vec::new();
        };
        if !pending.locked {
            warn!(%tid, "unlock for a transaction never locked");
        }
        for (oid, (_, object)) in &pending.objects {
            db.commit_object(*oid, tid, object.clone());
        }
        for (oid, target) in &pending.reverts {
            db.commit_object(*oid, tid, target.clone());
        }
        if let Some(meta) = pending.meta {
            db.commit_transaction(meta);
        }
        self.release_locks(tid, &pending.objects, &pending.reverts)
    }

    /// Drop everything `tid` staged and free its locks, handing back the
    /// delayed stores to retry.
    pub fn abort(&mut self, tid: Tid) -> Vec<QueuedStore> {
        let Some(pending) = self.pending.remove(&tid) else {
            return Vec::new();
        };
        debug!(%tid, "dropping staged transaction");
        self.release_locks(tid, &pending.objects, &pending.reverts)
    }

    /// TIDs with pending state.
    pub fn unfinished(&self) -> Vec<Tid> {
        self.pending.keys().copied().collect()
    }

    fn release_locks(
        &mut self,
        tid: Tid,
        objects: &HashMap<Oid, (Tid, StoredObject)>,
        reverts: &HashMap<Oid, StoredObject>,
    ) -> Vec<QueuedStore> {
        let mut released = Vec::new();
        for oid in objects.keys().chain(reverts.keys()) {
            if self.locks.get(oid) == Some(&tid) {
                self.locks.remove(oid);
            }
            if let Some(mut queue) = self.delayed.remove(oid) {
                released.extend(queue.drain(..));
            }
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use crate::database::StoredObject;

    fn payload(byte: u8) -> StoredObject {
        let data = Bytes::from(vec![byte; 3]);
        StoredObject {
            compression: 0,
            checksum: crate::payload_digest(&data),
            data,
        }
    }

    #[test]
    fn first_store_locks_and_stages() {
        let db = MemoryDatabase::new();
        let mut txns = StorageTransactions::new();
        let outcome = txns.store_object(&db, Tid::new(5), Oid::new(1), Tid::ZERO, payload(1));
        assert_eq!(outcome, StoreOutcome::Stored);
        assert_eq!(txns.lock_holder(Oid::new(1)), Some(Tid::new(5)));
    }

    #[test]
    fn stale_base_serial_is_a_conflict() {
        let mut db = MemoryDatabase::new();
        db.commit_object(Oid::new(1), Tid::new(3), payload(1));
        let mut txns = StorageTransactions::new();
        let outcome = txns.store_object(&db, Tid::new(5), Oid::new(1), Tid::ZERO, payload(2));
        assert_eq!(outcome, StoreOutcome::Conflict(Tid::new(3)));
        // no lock was taken
        assert_eq!(txns.lock_holder(Oid::new(1)), None);
    }

    #[test]
    fn foreign_lock_delays_the_store() {
        let db = MemoryDatabase::new();
        let mut txns = StorageTransactions::new();
        txns.store_object(&db, Tid::new(5), Oid::new(1), Tid::ZERO, payload(1));
        let outcome = txns.store_object(&db, Tid::new(6), Oid::new(1), Tid::ZERO, payload(2));
        assert_eq!(outcome, StoreOutcome::Delayed);
    }

    #[test]
    fn unlock_commits_and_releases_delayed_stores() {
        let mut db = MemoryDatabase::new();
        let mut txns = StorageTransactions::new();
        let tid = Tid::new(5);
        txns.store_object(&db, tid, Oid::new(1), Tid::ZERO, payload(1));
        txns.store_meta(TransactionInfo {
            tid,
            user: "u".into(),
            description: String::new(),
            extension: Bytes::new(),
            oids: vec![Oid::new(1)],
        });
        let (reply_tx, _reply_rx) = mpsc::unbounded_channel();
        txns.delay(QueuedStore {
            tid: Tid::new(6),
            oid: Oid::new(1),
            serial: Tid::ZERO,
            object: payload(2),
            reply_tx,
            reply_msg_id: 9,
        });
        txns.lock(tid);
        let released = txns.unlock(&mut db, tid);
        assert_eq!(released.len(), 1);
        assert_eq!(txns.lock_holder(Oid::new(1)), None);
        assert_eq!(db.current_serial(Oid::new(1)), Some(tid));
        assert!(db.transaction_info(tid).is_some());
        // the released store now conflicts against the committed revision
        let outcome = txns.store_object(&db, Tid::new(6), Oid::new(1), Tid::ZERO, payload(2));
        assert_eq!(outcome, StoreOutcome::Conflict(tid));
    }

    #[test]
    fn abort_releases_without_committing() {
        let mut db = MemoryDatabase::new();
        let mut txns = StorageTransactions::new();
        let tid = Tid::new(5);
        txns.store_object(&db, tid, Oid::new(1), Tid::ZERO, payload(1));
        let released = txns.abort(tid);
        assert!(released.is_empty());
        assert_eq!(txns.lock_holder(Oid::new(1)), None);
        assert_eq!(db.current_serial(Oid::new(1)), None);
    }

    #[test]
    fn undo_revert_is_committed_on_unlock() {
        let mut db = MemoryDatabase::new();
        let mut txns = StorageTransactions::new();
        db.commit_object(Oid::new(1), Tid::new(2), payload(1));
        let undo_tid = Tid::new(7);
        txns.stage_revert(undo_tid, Oid::new(1), StoredObject::absent());
        txns.lock(undo_tid);
        txns.unlock(&mut db, undo_tid);
        let latest = db.load(Oid::new(1), None, None).unwrap();
        assert_eq!(latest.serial, undo_tid);
        assert!(latest.object.data.is_empty());
    }
}
