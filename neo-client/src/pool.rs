//! The pool of connections to storage nodes.
//!
//! A bounded map from storage identity to its connection. Dials are lazy and
//! serialized per node, the identification handshake runs before a
//! connection is handed out, and idle connections are evicted first-in when
//! the pool overflows.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex as SyncMutex, RwLock};
use rand::seq::SliceRandom;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use neo_common::{Cell, Node, NodeId, NodeState, NodeType};
use neo_errors::{NeoError, NeoResult};
use neo_protocol::Message;

use crate::conn::ClientConn;
use crate::ClientServices;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Default)]
struct PoolMap {
    conns: HashMap<NodeId, Arc<ClientConn>>,
    // insertion order, oldest first, for eviction
    order: VecDeque<NodeId>,
}

/// LRU-bounded storage connection pool.
#[derive(Debug)]
pub struct ConnectionPool {
    services: Arc<ClientServices>,
    inner: Mutex<PoolMap>,
    // sync mirror of the pooled identities, for candidate ordering
    connected: RwLock<HashSet<NodeId>>,
    // per-node dial serialization
    dialing: SyncMutex<HashMap<NodeId, Arc<Mutex<()>>>>,
    closed_tx: mpsc::UnboundedSender<u64>,
}

impl ConnectionPool {
    /// Build the pool and spawn the reaper that forgets connections whose
    /// peer went away.
    pub fn new(services: Arc<ClientServices>) -> Arc<Self> {
        let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
        let pool = Arc::new(ConnectionPool {
            services,
            inner: Mutex::new(PoolMap::default()),
            connected: RwLock::new(HashSet::new()),
            dialing: SyncMutex::new(HashMap::new()),
            closed_tx,
        });
        let reaper = Arc::clone(&pool);
        tokio::spawn(async move {
            while let Some(conn_id) = closed_rx.recv().await {
                reaper.remove_by_conn(conn_id).await;
            }
        });
        pool
    }

    /// A connection to `node`, dialing if needed. `Ok(None)` means the node
    /// cannot serve this request right now (not running, no address, dial
    /// failed, or still initializing); the caller moves on to another cell.
    pub async fn get_for_node(&self, node: &Node) -> NeoResult<Option<Arc<ClientConn>>> {
        if node.state != NodeState::Running {
            return Ok(None);
        }
        let Some(addr) = node.addr.clone() else {
            return Ok(None);
        };

        if let Some(conn) = self.lookup(node.id).await {
            return Ok(Some(conn));
        }

        // serialize dialing per node so concurrent requests share one
        // connection instead of racing dials
        let dial_lock = Arc::clone(
            self.dialing
                .lock()
                .entry(node.id)
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        );
        let _dialing = dial_lock.lock().await;
        if let Some(conn) = self.lookup(node.id).await {
            return Ok(Some(conn));
        }

        info!(node = %node.id, %addr, "connecting to storage node");
        let conn = match ClientConn::open(
            &addr,
            Arc::clone(&self.services.dispatcher),
            None,
            Some(self.closed_tx.clone()),
        )
        .await
        {
            Ok(conn) => conn,
            Err(error) => {
                warn!(node = %node.id, %addr, %error, "storage connection failed");
                return Ok(None);
            }
        };

        match self.identify(&conn).await {
            Ok(()) => {}
            Err(NeoError::NodeNotReady(message)) => {
                info!(node = %node.id, message, "storage node not ready");
                conn.close();
                return Ok(None);
            }
            Err(error) => {
                conn.close();
                return Err(error);
            }
        }
        conn.set_node(node.id);

        let mut inner = self.inner.lock().await;
        self.evict_idle(&mut inner);
        inner.conns.insert(node.id, Arc::clone(&conn));
        inner.order.push_back(node.id);
        self.connected.write().insert(node.id);
        Ok(Some(conn))
    }

    /// Drop the pooled connection of `node`, if any. Called from the storage
    /// event path on connection loss.
    pub async fn remove(&self, node: NodeId) {
        let mut inner = self.inner.lock().await;
        if let Some(conn) = inner.conns.remove(&node) {
            conn.close();
        }
        inner.order.retain(|n| *n != node);
        self.connected.write().remove(&node);
    }

    /// Whether a live connection to `node` is pooled.
    pub fn contains(&self, node: NodeId) -> bool {
        self.connected.read().contains(&node)
    }

    /// Order read candidates: shuffle for load spreading, then promote
    /// storages we already hold a connection to. The sort is stable, so the
    /// shuffle decides among equals.
    pub fn order_candidates(&self, cells: &mut [Cell]) {
        cells.shuffle(&mut rand::rng());
        cells.sort_by_key(|cell| !self.contains(cell.node));
    }

    async fn lookup(&self, node: NodeId) -> Option<Arc<ClientConn>> {
        let mut inner = self.inner.lock().await;
        let conn = inner.conns.get(&node).map(Arc::clone)?;
        if !conn.is_closed() {
            return Some(conn);
        }
        inner.conns.remove(&node);
        inner.order.retain(|n| *n != node);
        self.connected.write().remove(&node);
        None
    }

    async fn remove_by_conn(&self, conn_id: u64) {
        let mut inner = self.inner.lock().await;
        let Some(node) = inner
            .conns
            .iter()
            .find(|(_, c)| c.id() == conn_id)
            .map(|(n, _)| *n)
        else {
            return;
        };
        debug!(%node, "reaping closed storage connection");
        inner.conns.remove(&node);
        inner.order.retain(|n| *n != node);
        self.connected.write().remove(&node);
    }

    /// Identification handshake with a freshly dialed storage. The storage
    /// must follow the same primary master we do.
    async fn identify(&self, conn: &Arc<ClientConn>) -> NeoResult<()> {
        let pending = conn.ask(Message::RequestIdentification {
            node_type: NodeType::Client,
            id: *self.services.id.read(),
            addr: None,
            cluster: self.services.config.cluster.clone(),
        })?;
        let answer = tokio::time::timeout(HANDSHAKE_TIMEOUT, pending.wait())
            .await
            .map_err(|_| NeoError::NodeNotReady("identification timed out".into()))??;
        match answer {
            Message::AcceptIdentification {
                node_type: NodeType::Storage,
                primary,
                ..
            } => {
                let followed = self.services.primary.read().clone();
                if let (Some(theirs), Some(ours)) = (&primary, &followed) {
                    if theirs != ours {
                        return Err(NeoError::Protocol(format!(
                            "storage follows primary {theirs}, we follow {ours}"
                        )));
                    }
                }
                Ok(())
            }
            other => Err(NeoError::Protocol(format!(
                "unexpected identification answer {}",
                other.name()
            ))),
        }
    }

    /// Evict idle connections, oldest first, until the pool fits. Busy
    /// connections (registered waiters) are never evicted.
    fn evict_idle(&self, inner: &mut PoolMap) {
        let max = self.services.config.max_pool_size;
        if inner.conns.len() < max {
            return;
        }
        let candidates: Vec<NodeId> = inner.order.iter().copied().collect();
        for node in candidates {
            if inner.conns.len() < max {
                break;
            }
            let Some(conn) = inner.conns.get(&node) else {
                inner.order.retain(|n| *n != node);
                continue;
            };
            if self.services.dispatcher.has_waiters(conn.id()) {
                continue;
            }
            debug!(%node, "evicting idle storage connection");
            conn.close();
            inner.conns.remove(&node);
            inner.order.retain(|n| *n != node);
            self.connected.write().remove(&node);
        }
    }
}
