//! Identifiers, the node roster and the partition table shared by every NEO
//! crate.

mod ids;
pub mod node;
pub mod partition;

pub use ids::{NodeId, Oid, Ptid, Tid};
pub use node::{Address, Node, NodeInfo, NodeMap, NodeState, NodeType};
pub use partition::{Cell, CellState, PartitionTable, PartitionTableHandle};
