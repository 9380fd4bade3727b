//! The node roster: every master, storage, client and admin process the
//! cluster knows about, with its identity, address and state.
//!
//! The primary master owns the authoritative roster and broadcasts changes
//! with `NotifyNodeInformation`; every other process mirrors it into a
//! [`NodeMap`].

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use parking_lot::RwLock;
use tracing::debug;

use crate::NodeId;

/// The role a node plays in the cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeType {
    /// Owns cluster state; exactly one is primary at a time.
    Master,
    /// Holds a range of the OID keyspace.
    Storage,
    /// Initiates transactions.
    Client,
    /// Administrative peer.
    Admin,
}

impl NodeType {
    /// Wire encoding.
    pub fn code(self) -> u8 {
        match self {
            NodeType::Master => 1,
            NodeType::Storage => 2,
            NodeType::Client => 3,
            NodeType::Admin => 4,
        }
    }

    /// Decode the wire form.
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => NodeType::Master,
            2 => NodeType::Storage,
            3 => NodeType::Client,
            4 => NodeType::Admin,
            _ => return None,
        })
    }
}

/// The liveness state of a node, as decided by the primary master.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeState {
    /// Identified and serving.
    Running,
    /// Lost its connection; expected back.
    TemporarilyDown,
    /// Gone; its cells are dropped.
    Down,
    /// Misbehaved; refused on reconnect.
    Broken,
    /// Administratively removed from service.
    Hidden,
    /// Identified but not yet serving.
    Pending,
    /// Never heard from.
    Unknown,
}

impl NodeState {
    /// Wire encoding.
    pub fn code(self) -> u8 {
        match self {
            NodeState::Running => 1,
            NodeState::TemporarilyDown => 2,
            NodeState::Down => 3,
            NodeState::Broken => 4,
            NodeState::Hidden => 5,
            NodeState::Pending => 6,
            NodeState::Unknown => 7,
        }
    }

    /// Decode the wire form.
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => NodeState::Running,
            2 => NodeState::TemporarilyDown,
            3 => NodeState::Down,
            4 => NodeState::Broken,
            5 => NodeState::Hidden,
            6 => NodeState::Pending,
            7 => NodeState::Unknown,
            _ => return None,
        })
    }
}

/// A dialable `host:port` pair. Hosts stay strings on the wire so the
/// cluster can name peers it has never resolved.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Address {
    /// Host name or IP literal.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Address {
    /// Build an address from parts.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Address {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Address {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("missing port in address {s:?}"))?;
        let port = port
            .parse()
            .map_err(|e| format!("bad port in address {s:?}: {e}"))?;
        Ok(Address::new(host, port))
    }
}

/// One node as the roster sees it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Node {
    /// Persistent identity.
    pub id: NodeId,
    /// Role.
    pub node_type: NodeType,
    /// Listen address; servers only, clients have none.
    pub addr: Option<Address>,
    /// Current state.
    pub state: NodeState,
}

impl Node {
    /// A node in `Running` state.
    pub fn running(id: NodeId, node_type: NodeType, addr: Option<Address>) -> Self {
        Node {
            id,
            node_type,
            addr,
            state: NodeState::Running,
        }
    }
}

/// One row of a `NotifyNodeInformation` packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeInfo {
    /// Role.
    pub node_type: NodeType,
    /// Listen address, if any.
    pub addr: Option<Address>,
    /// Identity.
    pub id: NodeId,
    /// State as decided by the master.
    pub state: NodeState,
}

impl From<&Node> for NodeInfo {
    fn from(node: &Node) -> Self {
        NodeInfo {
            node_type: node.node_type,
            addr: node.addr.clone(),
            id: node.id,
            state: node.state,
        }
    }
}

/// Thread-safe registry of known nodes, indexed by identity and address.
#[derive(Debug, Default)]
pub struct NodeMap {
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    by_id: HashMap<NodeId, Node>,
    by_addr: HashMap<Address, NodeId>,
}

impl NodeMap {
    /// An empty roster.
    pub fn new() -> Self {
        NodeMap::default()
    }

    /// Insert or replace a node. A node moving to a new address releases its
    /// old address entry.
    pub fn insert(&self, node: Node) {
        let mut inner = self.inner.write();
        if let Some(prev) = inner.by_id.get(&node.id) {
            if let Some(addr) = prev.addr.clone() {
                if prev.addr != node.addr {
                    inner.by_addr.remove(&addr);
                }
            }
        }
        if let Some(addr) = node.addr.clone() {
            inner.by_addr.insert(addr, node.id);
        }
        inner.by_id.insert(node.id, node);
    }

    /// Look up by identity.
    pub fn get(&self, id: NodeId) -> Option<Node> {
        self.inner.read().by_id.get(&id).cloned()
    }

    /// Look up by listen address.
    pub fn get_by_addr(&self, addr: &Address) -> Option<Node> {
        let inner = self.inner.read();
        let id = inner.by_addr.get(addr)?;
        inner.by_id.get(id).cloned()
    }

    /// Remove a node entirely.
    pub fn remove(&self, id: NodeId) -> Option<Node> {
        let mut inner = self.inner.write();
        let node = inner.by_id.remove(&id)?;
        if let Some(addr) = &node.addr {
            inner.by_addr.remove(addr);
        }
        Some(node)
    }

    /// Set a node's state; no-op for unknown nodes.
    pub fn set_state(&self, id: NodeId, state: NodeState) {
        if let Some(node) = self.inner.write().by_id.get_mut(&id) {
            node.state = state;
        }
    }

    /// All nodes of a given type.
    pub fn of_type(&self, node_type: NodeType) -> Vec<Node> {
        self.inner
            .read()
            .by_id
            .values()
            .filter(|n| n.node_type == node_type)
            .cloned()
            .collect()
    }

    /// Every known node.
    pub fn all(&self) -> Vec<Node> {
        self.inner.read().by_id.values().cloned().collect()
    }

    /// Number of known nodes.
    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    /// Whether the roster is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.read().by_id.is_empty()
    }

    /// Mirror a `NotifyNodeInformation` batch from the master. Rows about
    /// this process itself are left to the caller to interpret.
    pub fn apply(&self, rows: &[NodeInfo]) {
        for info in rows {
            debug!(id = %info.id, state = ?info.state, "roster update");
            self.insert(Node {
                id: info.id,
                node_type: info.node_type,
                addr: info.addr.clone(),
                state: info.state,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> Address {
        Address::new("127.0.0.1", port)
    }

    #[test]
    fn insert_and_lookup_by_both_keys() {
        let nm = NodeMap::new();
        let id = NodeId::random();
        nm.insert(Node::running(id, NodeType::Storage, Some(addr(4000))));
        assert_eq!(nm.get(id).unwrap().id, id);
        assert_eq!(nm.get_by_addr(&addr(4000)).unwrap().id, id);
    }

    #[test]
    fn readdressing_releases_the_old_address() {
        let nm = NodeMap::new();
        let id = NodeId::random();
        nm.insert(Node::running(id, NodeType::Storage, Some(addr(4000))));
        nm.insert(Node::running(id, NodeType::Storage, Some(addr(4001))));
        assert!(nm.get_by_addr(&addr(4000)).is_none());
        assert_eq!(nm.get_by_addr(&addr(4001)).unwrap().id, id);
        assert_eq!(nm.len(), 1);
    }

    #[test]
    fn apply_mirrors_master_rows() {
        let nm = NodeMap::new();
        let id = NodeId::random();
        nm.apply(&[NodeInfo {
            node_type: NodeType::Storage,
            addr: Some(addr(4002)),
            id,
            state: NodeState::TemporarilyDown,
        }]);
        assert_eq!(nm.get(id).unwrap().state, NodeState::TemporarilyDown);
    }

    #[test]
    fn address_parses_host_and_port() {
        let a: Address = "db.internal:10100".parse().unwrap();
        assert_eq!(a.host, "db.internal");
        assert_eq!(a.port, 10100);
        assert!("no-port".parse::<Address>().is_err());
    }
}
