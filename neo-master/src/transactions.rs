//! The master-side transaction manager: TID and OID allocation and the
//! per-TID lock collection that gates the finish fan-out.

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use neo_common::{NodeId, Oid, Tid};

/// A transaction between `AskBeginTransaction` and its finish fan-out.
#[derive(Debug)]
pub struct FinishingTransaction {
    /// Connection of the initiating client.
    pub initiator: u64,
    /// Correlation id of its `AskFinishTransaction`, set when it arrives.
    pub msg_id: Option<u32>,
    /// Objects the transaction wrote.
    pub oids: Vec<Oid>,
    /// Storages that must lock before the commit is durable.
    pub expected: HashSet<NodeId>,
    /// Storages that reported locked.
    pub locked: HashSet<NodeId>,
}

impl FinishingTransaction {
    fn new(initiator: u64) -> Self {
        FinishingTransaction {
            initiator,
            msg_id: None,
            oids: Vec::new(),
            expected: HashSet::new(),
            locked: HashSet::new(),
        }
    }

    /// Record a lock report; reports from unexpected storages are ignored.
    pub fn add_locked(&mut self, node: NodeId) {
        if self.expected.contains(&node) {
            self.locked.insert(node);
        }
    }

    /// Whether the finish phase has started and every expected storage has
    /// locked.
    pub fn all_locked(&self) -> bool {
        self.msg_id.is_some() && self.locked.is_superset(&self.expected)
    }
}

/// Allocation state and the finishing-transaction table.
#[derive(Debug)]
pub struct TransactionManager {
    last_tid: Tid,
    last_oid: Oid,
    txns: HashMap<Tid, FinishingTransaction>,
}

impl TransactionManager {
    /// A manager with nothing allocated yet.
    pub fn new() -> Self {
        TransactionManager {
            last_tid: Tid::ZERO,
            last_oid: Oid::ZERO,
            txns: HashMap::new(),
        }
    }

    /// The highest TID handed out.
    pub fn last_tid(&self) -> Tid {
        self.last_tid
    }

    /// The highest OID handed out.
    pub fn last_oid(&self) -> Oid {
        self.last_oid
    }

    /// Begin a transaction for the client on `initiator`. A caller-supplied
    /// TID is honored only when it moves the clock forward; otherwise a
    /// fresh TID is allocated.
    pub fn begin(&mut self, initiator: u64, requested: Option<Tid>) -> Tid {
        let tid = match requested {
            Some(tid) if tid > self.last_tid => tid,
            _ => self.last_tid.next(),
        };
        self.last_tid = tid;
        self.txns.insert(tid, FinishingTransaction::new(initiator));
        debug!(%tid, initiator, "transaction allocated");
        tid
    }

    /// Allocate `count` fresh OIDs, ascending.
    pub fn new_oids(&mut self, count: u32) -> Vec<Oid> {
        (0..count)
            .map(|_| {
                self.last_oid = self.last_oid.next();
                self.last_oid
            })
            .collect()
    }

    /// Whether `tid` was allocated by this master.
    pub fn known(&self, tid: Tid) -> bool {
        tid <= self.last_tid
    }

    /// Start the finish phase: record the OID list, the expected lock set
    /// and the answer correlation id. Returns false for an unknown TID.
    pub fn start_finish(
        &mut self,
        tid: Tid,
        msg_id: u32,
        oids: Vec<Oid>,
        expected: HashSet<NodeId>,
    ) -> bool {
        match self.txns.get_mut(&tid) {
            Some(txn) => {
                txn.msg_id = Some(msg_id);
                txn.oids = oids;
                txn.expected = expected;
                true
            }
            None => {
                warn!(%tid, "finish for an unknown transaction");
                false
            }
        }
    }

    /// Record a lock report. Returns the completed record once the last
    /// expected storage locked, leaving the table clean.
    pub fn locked(&mut self, tid: Tid, node: NodeId) -> Option<FinishingTransaction> {
        let txn = self.txns.get_mut(&tid)?;
        txn.add_locked(node);
        if txn.all_locked() {
            return self.txns.remove(&tid);
        }
        None
    }

    /// Drop `tid`, keeping nothing.
    pub fn abort(&mut self, tid: Tid) {
        if self.txns.remove(&tid).is_some() {
            debug!(%tid, "transaction aborted");
        } else {
            warn!(%tid, "abort for an unknown transaction");
        }
    }

    /// Drop every transaction initiated on `conn`. Used when a client
    /// connection goes away.
    pub fn drop_initiator(&mut self, conn: u64) {
        self.txns.retain(|tid, txn| {
            if txn.initiator == conn {
                debug!(%tid, conn, "dropping transaction of a lost client");
                false
            } else {
                true
            }
        });
    }

    /// A storage left the cluster: it can no longer be expected to lock.
    /// Returns the records its departure completed.
    pub fn drop_storage(&mut self, node: NodeId) -> Vec<(Tid, FinishingTransaction)> {
        let mut completed = Vec::new();
        let affected: Vec<Tid> = self
            .txns
            .iter()
            .filter(|(_, txn)| txn.expected.contains(&node))
            .map(|(tid, _)| *tid)
            .collect();
        for tid in affected {
            let txn = self.txns.get_mut(&tid).expect("tid collected above");
            txn.expected.remove(&node);
            txn.locked.remove(&node);
            if txn.all_locked() {
                let txn = self.txns.remove(&tid).expect("tid collected above");
                completed.push((tid, txn));
            }
        }
        completed
    }

    /// TIDs still being finished.
    pub fn unfinished(&self) -> Vec<Tid> {
        self.txns.keys().copied().collect()
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        TransactionManager::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tids_are_strictly_monotonic() {
        let mut tm = TransactionManager::new();
        let a = tm.begin(1, None);
        let b = tm.begin(1, None);
        assert!(b > a);
    }

    #[test]
    fn caller_tids_only_move_the_clock_forward() {
        let mut tm = TransactionManager::new();
        let a = tm.begin(1, Some(Tid::new(10)));
        assert_eq!(a, Tid::new(10));
        // a stale caller TID is replaced by a fresh allocation
        let b = tm.begin(1, Some(Tid::new(5)));
        assert_eq!(b, Tid::new(11));
    }

    #[test]
    fn finish_waits_for_every_expected_lock() {
        let mut tm = TransactionManager::new();
        let (a, b) = (NodeId::random(), NodeId::random());
        let tid = tm.begin(1, None);
        assert!(tm.start_finish(tid, 7, vec![Oid::new(1)], HashSet::from([a, b])));

        assert!(tm.locked(tid, a).is_none());
        // replayed lock reports change nothing
        assert!(tm.locked(tid, a).is_none());
        let done = tm.locked(tid, b).expect("all locked");
        assert_eq!(done.msg_id, Some(7));
        assert_eq!(done.oids, vec![Oid::new(1)]);
        // the record is gone
        assert!(tm.locked(tid, b).is_none());
    }

    #[test]
    fn unexpected_lock_reports_are_ignored() {
        let mut tm = TransactionManager::new();
        let a = NodeId::random();
        let tid = tm.begin(1, None);
        tm.start_finish(tid, 7, vec![], HashSet::from([a]));
        assert!(tm.locked(tid, NodeId::random()).is_none());
        assert!(tm.locked(tid, a).is_some());
    }

    #[test]
    fn lock_reports_before_finish_do_not_complete() {
        let mut tm = TransactionManager::new();
        let a = NodeId::random();
        let tid = tm.begin(1, None);
        // no start_finish yet: the lock set is empty but msg_id is unset
        assert!(tm.locked(tid, a).is_none());
        assert!(tm.unfinished().contains(&tid));
    }

    #[test]
    fn storage_loss_completes_waiting_records() {
        let mut tm = TransactionManager::new();
        let (a, b) = (NodeId::random(), NodeId::random());
        let tid = tm.begin(1, None);
        tm.start_finish(tid, 7, vec![], HashSet::from([a, b]));
        tm.locked(tid, a);
        let completed = tm.drop_storage(b);
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].0, tid);
    }

    #[test]
    fn abort_and_client_loss_drop_records() {
        let mut tm = TransactionManager::new();
        let t1 = tm.begin(1, None);
        let t2 = tm.begin(2, None);
        tm.abort(t1);
        tm.drop_initiator(2);
        assert!(tm.unfinished().is_empty());
        let _ = t2;
    }

    #[test]
    fn oid_allocation_is_dense_and_monotonic() {
        let mut tm = TransactionManager::new();
        let first = tm.new_oids(3);
        assert_eq!(
            first,
            vec![Oid::new(1), Oid::new(2), Oid::new(3)]
        );
        assert_eq!(tm.new_oids(1), vec![Oid::new(4)]);
        assert_eq!(tm.last_oid(), Oid::new(4));
    }
}
