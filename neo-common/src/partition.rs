//! The partition table: which storage nodes hold which slice of the OID and
//! TID keyspace.
//!
//! The table is a plain value. Processes that share it across tasks wrap it
//! in a [`PartitionTableHandle`], which swaps a fresh `Arc` on every change;
//! readers snapshot the pointer and never block writers.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use neo_errors::{internal, NeoResult};

use crate::{NodeId, NodeMap, NodeState, Ptid};

/// The replication state of one cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CellState {
    /// Serves reads and writes.
    UpToDate,
    /// Catching up; writable only.
    OutOfDate,
    /// Readable donor of a replica move.
    Feeding,
    /// Removal marker; physically dropped at apply time.
    Discarded,
}

impl CellState {
    /// Wire encoding.
    pub fn code(self) -> u8 {
        match self {
            CellState::UpToDate => 1,
            CellState::OutOfDate => 2,
            CellState::Feeding => 3,
            CellState::Discarded => 4,
        }
    }

    /// Decode the wire form.
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => CellState::UpToDate,
            2 => CellState::OutOfDate,
            3 => CellState::Feeding,
            4 => CellState::Discarded,
            _ => return None,
        })
    }
}

/// One (storage node, state) assignment within a partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cell {
    /// The storage node holding the cell.
    pub node: NodeId,
    /// Its replication state.
    pub state: CellState,
}

impl Cell {
    /// Whether the cell may serve reads.
    pub fn is_readable(&self) -> bool {
        matches!(self.state, CellState::UpToDate | CellState::Feeding)
    }

    /// Whether the cell must receive writes.
    pub fn is_writable(&self) -> bool {
        !matches!(self.state, CellState::Discarded)
    }
}

/// A changed cell, as carried by `NotifyPartitionChanges`.
pub type CellChange = (u32, NodeId, CellState);

/// The partition table value.
#[derive(Clone, Debug)]
pub struct PartitionTable {
    ptid: Ptid,
    num_partitions: u32,
    num_replicas: u32,
    rows: Vec<Vec<Cell>>,
    // per-node count of non-feeding cells, used for replication planning
    counts: HashMap<NodeId, usize>,
}

impl PartitionTable {
    /// An empty table of `num_partitions` partitions with `num_replicas`
    /// extra copies per partition.
    pub fn new(num_partitions: u32, num_replicas: u32) -> Self {
        PartitionTable {
            ptid: Ptid::ZERO,
            num_partitions,
            num_replicas,
            rows: (0..num_partitions).map(|_| Vec::new()).collect(),
            counts: HashMap::new(),
        }
    }

    /// The current version.
    pub fn ptid(&self) -> Ptid {
        self.ptid
    }

    /// Bump and return the next version. Master side only.
    pub fn next_ptid(&mut self) -> Ptid {
        self.ptid = self.ptid.next();
        self.ptid
    }

    /// Number of partitions (P).
    pub fn num_partitions(&self) -> u32 {
        self.num_partitions
    }

    /// Number of extra replicas per partition (R).
    pub fn num_replicas(&self) -> u32 {
        self.num_replicas
    }

    /// `partition(id) = id mod P`, identically for OIDs and TIDs.
    pub fn partition_of(&self, id: u64) -> u32 {
        (id % u64::from(self.num_partitions)) as u32
    }

    /// The raw cells of one partition.
    pub fn cells(&self, offset: u32) -> &[Cell] {
        self.rows
            .get(offset as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// The cells of the partition owning `id`, filtered by the caller's
    /// requirement: readable excludes discarded and out-of-date cells,
    /// writable excludes only discarded ones.
    pub fn cells_for_id(&self, id: u64, readable: bool, writable: bool) -> Vec<Cell> {
        self.cells(self.partition_of(id))
            .iter()
            .filter(|c| (!readable || c.is_readable()) && (!writable || c.is_writable()))
            .copied()
            .collect()
    }

    /// Place `node` in partition `offset` with `state`, replacing any prior
    /// cell of the same node. A discarded state removes the cell; broken and
    /// down nodes are rejected.
    pub fn set_cell(&mut self, offset: u32, node: NodeId, node_state: NodeState, state: CellState) {
        if state == CellState::Discarded {
            self.remove_cell(offset, node);
            return;
        }
        if matches!(node_state, NodeState::Broken | NodeState::Down) {
            warn!(%node, ?node_state, "refusing cell for unusable node");
            return;
        }
        self.remove_cell(offset, node);
        let Some(row) = self.rows.get_mut(offset as usize) else {
            warn!(offset, "cell for unknown partition");
            return;
        };
        row.push(Cell { node, state });
        // feeding cells do not pin the node for replication planning
        if state != CellState::Feeding {
            *self.counts.entry(node).or_insert(0) += 1;
        }
    }

    /// Remove `node`'s cell from partition `offset`, if present.
    pub fn remove_cell(&mut self, offset: u32, node: NodeId) {
        let Some(row) = self.rows.get_mut(offset as usize) else {
            return;
        };
        if let Some(pos) = row.iter().position(|c| c.node == node) {
            let cell = row.remove(pos);
            if cell.state != CellState::Feeding {
                if let Some(count) = self.counts.get_mut(&node) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        self.counts.remove(&node);
                    }
                }
            }
        }
    }

    /// Replace the table content with rows received at version `ptid`. A
    /// full table may arrive split over several packets sharing one PTID;
    /// each row may be loaded only once per version.
    pub fn load(&mut self, ptid: Ptid, rows: &[(u32, Vec<(NodeId, CellState)>)]) -> NeoResult<()> {
        if ptid != self.ptid {
            self.clear();
            self.ptid = ptid;
        }
        for (offset, row) in rows {
            if *offset >= self.num_partitions {
                internal!("partition {offset} out of range (P={})", self.num_partitions);
            }
            if !self.cells(*offset).is_empty() {
                internal!("partition {offset} loaded twice at ptid {ptid}");
            }
            for (node, state) in row {
                self.set_cell(*offset, *node, NodeState::Running, *state);
            }
        }
        Ok(())
    }

    /// Apply an incremental diff at version `ptid`; deltas at or below the
    /// current version are dropped.
    pub fn update(&mut self, ptid: Ptid, changes: &[CellChange], nodes: &NodeMap) {
        if ptid <= self.ptid {
            warn!(%ptid, current = %self.ptid, "ignoring stale partition changes");
            return;
        }
        self.ptid = ptid;
        for (offset, node, state) in changes {
            let node_state = nodes
                .get(*node)
                .map(|n| n.state)
                .unwrap_or(NodeState::Unknown);
            self.set_cell(*offset, *node, node_state, *state);
        }
        debug!(%ptid, "partition table updated");
    }

    /// Drop all content, keeping the dimensions.
    pub fn clear(&mut self) {
        self.ptid = Ptid::ZERO;
        for row in &mut self.rows {
            row.clear();
        }
        self.counts.clear();
    }

    /// Whether every partition has at least one cell.
    pub fn filled(&self) -> bool {
        self.rows.iter().all(|row| !row.is_empty())
    }

    /// Whether every partition has at least one readable cell on a running
    /// node. A non-operational table refuses new transactions.
    pub fn operational(&self, nodes: &NodeMap) -> bool {
        self.filled()
            && self.rows.iter().all(|row| {
                row.iter().any(|cell| {
                    cell.is_readable()
                        && nodes.get(cell.node).map(|n| n.state) == Some(NodeState::Running)
                })
            })
    }

    /// Distinct nodes holding at least one non-feeding cell.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.counts.keys().copied().collect()
    }

    /// One partition as `(node, state)` pairs, for bootstrap serving.
    pub fn row(&self, offset: u32) -> Vec<(NodeId, CellState)> {
        self.cells(offset).iter().map(|c| (c.node, c.state)).collect()
    }

    /// Assign `node` to every partition still short of `R + 1` copies, with
    /// `state`. Returns the changed cells for broadcast. Master side only.
    pub fn add_node(&mut self, node: NodeId, state: CellState) -> Vec<CellChange> {
        let target = self.num_replicas as usize + 1;
        let mut changes = Vec::new();
        for offset in 0..self.num_partitions {
            let row = self.cells(offset);
            if row.len() >= target || row.iter().any(|c| c.node == node) {
                continue;
            }
            self.set_cell(offset, node, NodeState::Running, state);
            changes.push((offset, node, state));
        }
        changes
    }

    /// Remove `node` from every partition. Returns the discarded cells for
    /// broadcast. Master side only.
    pub fn drop_node(&mut self, node: NodeId) -> Vec<CellChange> {
        let mut changes = Vec::new();
        for offset in 0..self.num_partitions {
            if self.cells(offset).iter().any(|c| c.node == node) {
                self.remove_cell(offset, node);
                changes.push((offset, node, CellState::Discarded));
            }
        }
        changes
    }
}

/// Shared, snapshot-swapped access to a partition table. `None` until the
/// first table arrives from the master.
#[derive(Debug, Default)]
pub struct PartitionTableHandle {
    inner: RwLock<Option<Arc<PartitionTable>>>,
}

impl PartitionTableHandle {
    /// An empty handle.
    pub fn new() -> Self {
        PartitionTableHandle::default()
    }

    /// The current snapshot, if any table has been installed.
    pub fn snapshot(&self) -> Option<Arc<PartitionTable>> {
        self.inner.read().clone()
    }

    /// Install a full replacement table.
    pub fn install(&self, table: PartitionTable) {
        *self.inner.write() = Some(Arc::new(table));
    }

    /// Clone the current table, apply `f`, and swap the result in. Returns
    /// `None` when no table is installed yet.
    pub fn mutate<R>(&self, f: impl FnOnce(&mut PartitionTable) -> R) -> Option<R> {
        let mut guard = self.inner.write();
        let current = guard.as_ref()?;
        let mut next = PartitionTable::clone(current);
        let result = f(&mut next);
        *guard = Some(Arc::new(next));
        Some(result)
    }

    /// Drop the installed table.
    pub fn clear(&self) {
        *self.inner.write() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Node, NodeType};

    fn running(nodes: &NodeMap) -> NodeId {
        let id = NodeId::random();
        nodes.insert(Node::running(id, NodeType::Storage, None));
        id
    }

    #[test]
    fn partition_mapping_is_mod_p() {
        let pt = PartitionTable::new(3, 0);
        assert_eq!(pt.partition_of(1), 1);
        assert_eq!(pt.partition_of(2), 2);
        assert_eq!(pt.partition_of(3), 0);
    }

    #[test]
    fn readable_and_writable_filters() {
        let nodes = NodeMap::new();
        let (a, b, c) = (running(&nodes), running(&nodes), running(&nodes));
        let mut pt = PartitionTable::new(1, 2);
        pt.set_cell(0, a, NodeState::Running, CellState::UpToDate);
        pt.set_cell(0, b, NodeState::Running, CellState::OutOfDate);
        pt.set_cell(0, c, NodeState::Running, CellState::Feeding);

        let readable = pt.cells_for_id(7, true, false);
        assert_eq!(readable.iter().map(|c| c.node).collect::<Vec<_>>(), vec![a, c]);

        let writable = pt.cells_for_id(7, false, true);
        assert_eq!(writable.len(), 3);
    }

    #[test]
    fn set_cell_replaces_and_discard_removes() {
        let nodes = NodeMap::new();
        let a = running(&nodes);
        let mut pt = PartitionTable::new(1, 0);
        pt.set_cell(0, a, NodeState::Running, CellState::OutOfDate);
        pt.set_cell(0, a, NodeState::Running, CellState::UpToDate);
        assert_eq!(pt.cells(0).len(), 1);
        assert_eq!(pt.cells(0)[0].state, CellState::UpToDate);

        pt.set_cell(0, a, NodeState::Running, CellState::Discarded);
        assert!(pt.cells(0).is_empty());
        assert!(pt.node_ids().is_empty());
    }

    #[test]
    fn broken_nodes_are_rejected() {
        let mut pt = PartitionTable::new(1, 0);
        let a = NodeId::random();
        pt.set_cell(0, a, NodeState::Broken, CellState::UpToDate);
        assert!(pt.cells(0).is_empty());
    }

    #[test]
    fn feeding_cells_do_not_count() {
        let mut pt = PartitionTable::new(2, 1);
        let a = NodeId::random();
        pt.set_cell(0, a, NodeState::Running, CellState::Feeding);
        assert!(pt.node_ids().is_empty());
        pt.set_cell(1, a, NodeState::Running, CellState::UpToDate);
        assert_eq!(pt.node_ids(), vec![a]);
    }

    #[test]
    fn load_rejects_duplicate_rows_at_same_ptid() {
        let a = NodeId::random();
        let mut pt = PartitionTable::new(2, 0);
        pt.load(Ptid::new(1), &[(0, vec![(a, CellState::UpToDate)])])
            .unwrap();
        assert!(pt
            .load(Ptid::new(1), &[(0, vec![(a, CellState::UpToDate)])])
            .is_err());
        // a different ptid starts over
        pt.load(Ptid::new(2), &[(0, vec![(a, CellState::UpToDate)])])
            .unwrap();
        assert_eq!(pt.ptid(), Ptid::new(2));
    }

    #[test]
    fn update_ignores_stale_ptid() {
        let nodes = NodeMap::new();
        let a = running(&nodes);
        let mut pt = PartitionTable::new(1, 0);
        pt.update(Ptid::new(5), &[(0, a, CellState::UpToDate)], &nodes);
        pt.update(Ptid::new(4), &[(0, a, CellState::Discarded)], &nodes);
        assert_eq!(pt.cells(0).len(), 1);
        assert_eq!(pt.ptid(), Ptid::new(5));
    }

    #[test]
    fn operational_requires_running_readable_cell_everywhere() {
        let nodes = NodeMap::new();
        let a = running(&nodes);
        let mut pt = PartitionTable::new(2, 0);
        pt.set_cell(0, a, NodeState::Running, CellState::UpToDate);
        assert!(!pt.operational(&nodes)); // partition 1 empty

        pt.set_cell(1, a, NodeState::Running, CellState::OutOfDate);
        assert!(!pt.operational(&nodes)); // out-of-date is not readable

        pt.set_cell(1, a, NodeState::Running, CellState::UpToDate);
        assert!(pt.operational(&nodes));

        nodes.set_state(a, NodeState::TemporarilyDown);
        assert!(!pt.operational(&nodes));
    }

    #[test]
    fn add_and_drop_node_report_changes() {
        let mut pt = PartitionTable::new(3, 0);
        let a = NodeId::random();
        let changes = pt.add_node(a, CellState::UpToDate);
        assert_eq!(changes.len(), 3);
        // already at R+1 copies everywhere
        assert!(pt.add_node(NodeId::random(), CellState::UpToDate).is_empty());

        let dropped = pt.drop_node(a);
        assert_eq!(dropped.len(), 3);
        assert!(dropped.iter().all(|(_, n, s)| *n == a && *s == CellState::Discarded));
        assert!(!pt.filled());
    }

    #[test]
    fn handle_snapshots_are_stable_across_mutation() {
        let handle = PartitionTableHandle::new();
        assert!(handle.snapshot().is_none());
        handle.install(PartitionTable::new(1, 0));
        let before = handle.snapshot().unwrap();
        let a = NodeId::random();
        handle.mutate(|pt| pt.set_cell(0, a, NodeState::Running, CellState::UpToDate));
        assert!(before.cells(0).is_empty());
        assert_eq!(handle.snapshot().unwrap().cells(0).len(), 1);
    }
}
