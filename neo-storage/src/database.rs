//! The in-memory database manager.
//!
//! Object revisions are kept per OID in TID order, payloads exactly as they
//! travel (compression flag, checksum and wire bytes), so reads serve them
//! back without touching the content. An empty payload marks an object that
//! does not exist at that revision: a deletion, or a creation that was
//! undone.

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;

use neo_common::{Oid, Tid};
use neo_protocol::TransactionInfo;

/// One stored revision payload, as received on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredObject {
    /// 0 = raw, 1 = deflate.
    pub compression: u8,
    /// Digest over `data`.
    pub checksum: [u8; 20],
    /// The wire payload; empty marks absence.
    pub data: Bytes,
}

impl StoredObject {
    /// The payload marking a non-existing object.
    pub fn absent() -> Self {
        StoredObject {
            compression: 0,
            checksum: crate::payload_digest(&[]),
            data: Bytes::new(),
        }
    }
}

/// A revision lookup result.
#[derive(Clone, Debug)]
pub struct RevisionAt {
    /// The revision's own serial.
    pub serial: Tid,
    /// The serial of the next revision, when one exists.
    pub next_serial: Option<Tid>,
    /// The payload.
    pub object: StoredObject,
}

/// Committed state of one storage node.
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    objects: HashMap<Oid, BTreeMap<Tid, StoredObject>>,
    transactions: BTreeMap<Tid, TransactionInfo>,
}

impl MemoryDatabase {
    /// An empty database.
    pub fn new() -> Self {
        MemoryDatabase::default()
    }

    /// The committed serial of `oid`, absence-markers included.
    pub fn current_serial(&self, oid: Oid) -> Option<Tid> {
        self.objects
            .get(&oid)
            .and_then(|revs| revs.keys().next_back())
            .copied()
    }

    /// Commit one revision.
    pub fn commit_object(&mut self, oid: Oid, tid: Tid, object: StoredObject) {
        self.objects.entry(oid).or_default().insert(tid, object);
    }

    /// Record the metadata of a committed transaction. Only storages owning
    /// the TID partition receive metadata.
    pub fn commit_transaction(&mut self, info: TransactionInfo) {
        self.transactions.insert(info.tid, info);
    }

    /// Find a revision of `oid`: at `serial` exactly, the newest strictly
    /// before `before`, or the newest overall.
    pub fn load(&self, oid: Oid, serial: Option<Tid>, before: Option<Tid>) -> Option<RevisionAt> {
        let revs = self.objects.get(&oid)?;
        let (found_serial, object) = match (serial, before) {
            (Some(serial), _) => revs.get_key_value(&serial)?,
            (None, Some(before)) => revs.range(..before).next_back()?,
            (None, None) => revs.iter().next_back()?,
        };
        let next_serial = revs
            .range((
                std::ops::Bound::Excluded(*found_serial),
                std::ops::Bound::Unbounded,
            ))
            .next()
            .map(|(tid, _)| *tid);
        Some(RevisionAt {
            serial: *found_serial,
            next_serial,
            object: object.clone(),
        })
    }

    /// The revision of `oid` an undo of `undone` reverts to: the newest one
    /// before `undone`, or the absence marker for an undone creation.
    pub fn revert_target(&self, oid: Oid, undone: Tid) -> StoredObject {
        self.objects
            .get(&oid)
            .and_then(|revs| revs.range(..undone).next_back())
            .map(|(_, object)| object.clone())
            .unwrap_or_else(StoredObject::absent)
    }

    /// OIDs this storage holds a revision of at exactly `tid`.
    pub fn oids_at(&self, tid: Tid) -> Vec<Oid> {
        self.objects
            .iter()
            .filter(|(_, revs)| revs.contains_key(&tid))
            .map(|(oid, _)| *oid)
            .collect()
    }

    /// Revision list of `oid`, newest first, skipping `first` entries and
    /// returning at most `last - first`.
    pub fn history(&self, oid: Oid, first: u64, last: u64) -> Option<Vec<(Tid, u32)>> {
        let revs = self.objects.get(&oid)?;
        Some(
            revs.iter()
                .rev()
                .skip(first as usize)
                .take(last.saturating_sub(first) as usize)
                .map(|(tid, object)| (*tid, object.data.len() as u32))
                .collect(),
        )
    }

    /// Transaction metadata, when this storage holds it.
    pub fn transaction_info(&self, tid: Tid) -> Option<&TransactionInfo> {
        self.transactions.get(&tid)
    }

    /// Committed TIDs known here, newest first, the `[first, last)` window,
    /// optionally restricted to one partition of `num_partitions`.
    pub fn tids(
        &self,
        first: u64,
        last: u64,
        partition: Option<u32>,
        num_partitions: u32,
    ) -> Vec<Tid> {
        self.transactions
            .keys()
            .rev()
            .filter(|tid| match partition {
                Some(p) => num_partitions != 0 && (tid.get() % u64::from(num_partitions)) as u32 == p,
                None => true,
            })
            .skip(first as usize)
            .take(last.saturating_sub(first) as usize)
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(byte: u8) -> StoredObject {
        let data = Bytes::from(vec![byte; 4]);
        StoredObject {
            compression: 0,
            checksum: crate::payload_digest(&data),
            data,
        }
    }

    #[test]
    fn load_latest_exact_and_before() {
        let mut db = MemoryDatabase::new();
        let oid = Oid::new(1);
        db.commit_object(oid, Tid::new(2), obj(1));
        db.commit_object(oid, Tid::new(5), obj(2));

        let latest = db.load(oid, None, None).unwrap();
        assert_eq!(latest.serial, Tid::new(5));
        assert_eq!(latest.next_serial, None);

        let exact = db.load(oid, Some(Tid::new(2)), None).unwrap();
        assert_eq!(exact.serial, Tid::new(2));
        assert_eq!(exact.next_serial, Some(Tid::new(5)));

        let before = db.load(oid, None, Some(Tid::new(5))).unwrap();
        assert_eq!(before.serial, Tid::new(2));

        assert!(db.load(oid, None, Some(Tid::new(2))).is_none());
        assert!(db.load(Oid::new(9), None, None).is_none());
    }

    #[test]
    fn revert_target_falls_back_to_absence() {
        let mut db = MemoryDatabase::new();
        let oid = Oid::new(1);
        db.commit_object(oid, Tid::new(3), obj(1));
        assert!(db.revert_target(oid, Tid::new(3)).data.is_empty());

        db.commit_object(oid, Tid::new(7), obj(2));
        assert_eq!(db.revert_target(oid, Tid::new(7)), obj(1));
    }

    #[test]
    fn history_is_newest_first_with_window() {
        let mut db = MemoryDatabase::new();
        let oid = Oid::new(1);
        for tid in 1..=4 {
            db.commit_object(oid, Tid::new(tid), obj(tid as u8));
        }
        let all = db.history(oid, 0, 10).unwrap();
        assert_eq!(
            all.iter().map(|(t, _)| t.get()).collect::<Vec<_>>(),
            vec![4, 3, 2, 1]
        );
        let window = db.history(oid, 1, 3).unwrap();
        assert_eq!(
            window.iter().map(|(t, _)| t.get()).collect::<Vec<_>>(),
            vec![3, 2]
        );
    }

    #[test]
    fn tids_filter_by_partition() {
        let mut db = MemoryDatabase::new();
        for tid in 1..=6u64 {
            db.commit_transaction(TransactionInfo {
                tid: Tid::new(tid),
                user: String::new(),
                description: String::new(),
                extension: Bytes::new(),
                oids: vec![],
            });
        }
        assert_eq!(
            db.tids(0, 10, None, 3)
                .iter()
                .map(|t| t.get())
                .collect::<Vec<_>>(),
            vec![6, 5, 4, 3, 2, 1]
        );
        assert_eq!(
            db.tids(0, 10, Some(0), 3)
                .iter()
                .map(|t| t.get())
                .collect::<Vec<_>>(),
            vec![6, 3]
        );
    }

    #[test]
    fn oids_at_finds_the_transactions_objects() {
        let mut db = MemoryDatabase::new();
        db.commit_object(Oid::new(1), Tid::new(3), obj(1));
        db.commit_object(Oid::new(2), Tid::new(3), obj(2));
        db.commit_object(Oid::new(3), Tid::new(4), obj(3));
        let mut found = db.oids_at(Tid::new(3));
        found.sort();
        assert_eq!(found, vec![Oid::new(1), Oid::new(2)]);
    }
}
