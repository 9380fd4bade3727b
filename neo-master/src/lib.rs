//! The NEO primary master.
//!
//! Owns the authoritative cluster state: the node roster, the partition
//! table, TID/OID allocation and per-transaction lock collection. Every
//! peer (client, storage, admin) identifies on connect; the master
//! broadcasts roster and table changes and coordinates the commit fan-out.
//!
//! Leader election is out of scope: a started master is the primary.

mod transactions;

pub use transactions::{FinishingTransaction, TransactionManager};

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use neo_common::{
    Address, CellState, Node, NodeId, NodeInfo, NodeMap, NodeState, NodeType, Oid, PartitionTable,
    Tid,
};
use neo_errors::{NeoError, NeoResult};
use neo_protocol::{framed, ErrorCode, Message, Packet};

/// Roster rows per `NotifyNodeInformation` chunk during bootstrap dumps.
const NODE_CHUNK: usize = 1000;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Master configuration.
#[derive(Clone, Debug)]
pub struct MasterConfig {
    /// Address to listen on; port 0 binds an ephemeral port.
    pub bind: Address,
    /// The cluster this master owns.
    pub cluster: String,
    /// Partition count (P), fixed at cluster creation.
    pub partitions: u32,
    /// Extra replicas per partition (R), fixed at cluster creation.
    pub replicas: u32,
}

/// One identified peer connection.
#[derive(Clone, Debug)]
struct Peer {
    node: NodeId,
    node_type: NodeType,
    tx: mpsc::UnboundedSender<Packet>,
}

/// The primary master.
pub struct Master {
    config: MasterConfig,
    id: NodeId,
    addr: Address,
    nodes: NodeMap,
    pt: Mutex<PartitionTable>,
    tm: Mutex<TransactionManager>,
    peers: Mutex<std::collections::HashMap<u64, Peer>>,
    // set once the table first becomes operational; later-joining storages
    // start out-of-date and must catch up
    started: AtomicBool,
}

/// A running master and its accept loop.
pub struct MasterHandle {
    /// The master state, shared with the accept loop.
    pub master: Arc<Master>,
    task: JoinHandle<()>,
}

impl MasterHandle {
    /// The address the master actually listens on.
    pub fn addr(&self) -> &Address {
        &self.master.addr
    }

    /// Stop accepting connections.
    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for MasterHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl Master {
    /// Bind and start serving.
    pub async fn start(config: MasterConfig) -> NeoResult<MasterHandle> {
        let listener =
            TcpListener::bind((config.bind.host.as_str(), config.bind.port)).await?;
        let addr = Address::new(config.bind.host.clone(), listener.local_addr()?.port());
        let id = NodeId::random();
        let master = Arc::new(Master {
            pt: Mutex::new(PartitionTable::new(config.partitions, config.replicas)),
            config,
            id,
            addr: addr.clone(),
            nodes: NodeMap::new(),
            tm: Mutex::new(TransactionManager::new()),
            peers: Mutex::new(std::collections::HashMap::new()),
            started: AtomicBool::new(false),
        });
        master
            .nodes
            .insert(Node::running(id, NodeType::Master, Some(addr.clone())));
        info!(%addr, id = %id, "master listening");

        let accept = Arc::clone(&master);
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!(%peer, "incoming connection");
                        tokio::spawn(serve_conn(Arc::clone(&accept), stream));
                    }
                    Err(error) => {
                        error!(%error, "accept failed");
                        break;
                    }
                }
            }
        });
        Ok(MasterHandle { master, task })
    }

    /// The master's own identity.
    pub fn node_id(&self) -> NodeId {
        self.id
    }

    /// Whether the partition table currently accepts transactions.
    pub fn operational(&self) -> bool {
        self.pt.lock().operational(&self.nodes)
    }

    /// Whether every partition has its full replica count readable on
    /// running nodes.
    pub fn fully_replicated(&self) -> bool {
        let pt = self.pt.lock();
        let target = self.config.replicas as usize + 1;
        (0..pt.num_partitions()).all(|offset| {
            pt.cells(offset)
                .iter()
                .filter(|cell| {
                    cell.is_readable()
                        && self.nodes.get(cell.node).map(|n| n.state) == Some(NodeState::Running)
                })
                .count()
                >= target
        })
    }

    /// Send `msg` as a notification to every identified peer matching
    /// `filter`.
    fn broadcast(&self, msg: &Message, filter: impl Fn(&Peer) -> bool) {
        let peers = self.peers.lock();
        for peer in peers.values().filter(|p| filter(p)) {
            let _ = peer.tx.send(Packet::new(0, msg.clone()));
        }
    }

    fn broadcast_node(&self, node: &Node) {
        debug!(id = %node.id, state = ?node.state, "broadcasting node information");
        self.broadcast(
            &Message::NotifyNodeInformation {
                nodes: vec![NodeInfo::from(node)],
            },
            |_| true,
        );
    }

    /// Dispatch one packet from `conn_id`. Returns an error when the
    /// connection must be dropped.
    fn handle_packet(
        self: &Arc<Self>,
        conn_id: u64,
        tx: &mpsc::UnboundedSender<Packet>,
        ident: &mut Option<(NodeId, NodeType)>,
        packet: Packet,
    ) -> NeoResult<()> {
        let Packet { msg_id, msg } = packet;
        match msg {
            Message::RequestIdentification {
                node_type,
                id,
                addr,
                cluster,
            } => self.identify(conn_id, tx, ident, msg_id, node_type, id, addr, cluster),
            // which master is primary may be asked before identification
            Message::AskPrimary => {
                send(tx, msg_id, Message::AnswerPrimary {
                    primary: self.addr.clone(),
                });
                Ok(())
            }
            msg => {
                let Some((node, node_type)) = *ident else {
                    send_error(tx, msg_id, ErrorCode::ProtocolError, "identify first");
                    return Err(NeoError::Protocol("packet before identification".into()));
                };
                self.handle_identified(conn_id, tx, node, node_type, msg_id, msg)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn identify(
        self: &Arc<Self>,
        conn_id: u64,
        tx: &mpsc::UnboundedSender<Packet>,
        ident: &mut Option<(NodeId, NodeType)>,
        msg_id: u32,
        node_type: NodeType,
        requested: Option<NodeId>,
        addr: Option<Address>,
        cluster: String,
    ) -> NeoResult<()> {
        if cluster != self.config.cluster {
            send_error(tx, msg_id, ErrorCode::ProtocolError, "unexpected cluster name");
            return Err(NeoError::Protocol(format!(
                "peer names cluster {cluster:?}, this is {:?}",
                self.config.cluster
            )));
        }
        if node_type == NodeType::Master {
            send_error(tx, msg_id, ErrorCode::ProtocolError, "only one master here");
            return Err(NeoError::Protocol("secondary master tried to join".into()));
        }
        if node_type == NodeType::Storage && addr.is_none() {
            send_error(tx, msg_id, ErrorCode::ProtocolError, "storage without an address");
            return Err(NeoError::Protocol("storage without an address".into()));
        }

        // a claimed identity is honored unless a live peer already uses it
        let id = match requested {
            Some(id) => {
                let in_use = self.peers.lock().values().any(|p| p.node == id);
                if in_use {
                    send_error(tx, msg_id, ErrorCode::ProtocolError, "identity in use");
                    return Ok(());
                }
                id
            }
            None => loop {
                let id = NodeId::random();
                if self.nodes.get(id).is_none() {
                    break id;
                }
            },
        };

        let node = Node::running(id, node_type, addr);
        self.nodes.insert(node.clone());
        self.broadcast_node(&node);
        self.peers.lock().insert(
            conn_id,
            Peer {
                node: id,
                node_type,
                tx: tx.clone(),
            },
        );
        *ident = Some((id, node_type));
        info!(id = %id, ?node_type, "peer identified");

        if node_type == NodeType::Storage {
            self.admit_storage(id);
        }

        send(tx, msg_id, Message::AcceptIdentification {
            node_type: NodeType::Master,
            id: self.id,
            num_partitions: self.config.partitions,
            num_replicas: self.config.replicas,
            your_id: id,
            primary: Some(self.addr.clone()),
        });

        if node_type == NodeType::Storage {
            // the new storage needs the current table before it may serve
            let (ptid, rows) = {
                let pt = self.pt.lock();
                let rows = (0..pt.num_partitions()).map(|o| (o, pt.row(o))).collect();
                (pt.ptid(), rows)
            };
            let _ = tx.send(Packet::new(0, Message::SendPartitionTable { ptid, rows }));
            let _ = tx.send(Packet::new(0, Message::StartOperation));
        }
        Ok(())
    }

    /// Assign partitions to a freshly identified storage. Before the first
    /// operational moment cells start up-to-date; afterwards they start
    /// out-of-date and the storage announces its catch-up.
    fn admit_storage(&self, id: NodeId) {
        let state = if self.started.load(Ordering::SeqCst) {
            CellState::OutOfDate
        } else {
            CellState::UpToDate
        };
        let mut pt = self.pt.lock();
        let changes = pt.add_node(id, state);
        if !changes.is_empty() {
            let ptid = pt.next_ptid();
            info!(%id, cells = changes.len(), %ptid, "storage added to the partition table");
            drop(pt);
            self.broadcast(
                &Message::NotifyPartitionChanges { ptid, changes },
                |_| true,
            );
        } else {
            drop(pt);
        }
        if self.operational() {
            self.started.store(true, Ordering::SeqCst);
        }
    }

    fn handle_identified(
        self: &Arc<Self>,
        conn_id: u64,
        tx: &mpsc::UnboundedSender<Packet>,
        node: NodeId,
        node_type: NodeType,
        msg_id: u32,
        msg: Message,
    ) -> NeoResult<()> {
        match msg {
            Message::AskNodeInformation => {
                let all = self.nodes.all();
                for chunk in all.chunks(NODE_CHUNK) {
                    let _ = tx.send(Packet::new(0, Message::NotifyNodeInformation {
                        nodes: chunk.iter().map(NodeInfo::from).collect(),
                    }));
                }
                send(tx, msg_id, Message::AnswerNodeInformation);
            }
            Message::AskPartitionTable => {
                let pt = self.pt.lock();
                let rows = (0..pt.num_partitions()).map(|o| (o, pt.row(o))).collect();
                send(tx, msg_id, Message::AnswerPartitionTable {
                    ptid: pt.ptid(),
                    rows,
                });
            }
            Message::AskBeginTransaction { tid } => {
                if node_type != NodeType::Client {
                    send_error(tx, msg_id, ErrorCode::ProtocolError, "clients begin transactions");
                    return Err(NeoError::Protocol("begin from a non-client".into()));
                }
                if !self.operational() {
                    send_error(tx, msg_id, ErrorCode::NotReady, "cluster is not operational");
                    return Ok(());
                }
                let tid = self.tm.lock().begin(conn_id, tid);
                send(tx, msg_id, Message::AnswerBeginTransaction { tid });
            }
            Message::AskNewOids { count } => {
                if node_type != NodeType::Client {
                    send_error(tx, msg_id, ErrorCode::ProtocolError, "clients allocate oids");
                    return Err(NeoError::Protocol("oid allocation from a non-client".into()));
                }
                let (oids, last) = {
                    let mut tm = self.tm.lock();
                    let oids = tm.new_oids(count);
                    (oids, tm.last_oid())
                };
                // storages refuse stores past the watermark
                self.broadcast(&Message::NotifyLastOid { oid: last }, |p| {
                    p.node_type == NodeType::Storage
                });
                send(tx, msg_id, Message::AnswerNewOids { oids });
            }
            Message::AskFinishTransaction { tid, oids } => {
                self.start_finish(conn_id, tx, node_type, msg_id, tid, oids)?;
            }
            Message::AnswerInformationLocked { tid } => {
                if node_type != NodeType::Storage {
                    return Err(NeoError::Protocol("lock report from a non-storage".into()));
                }
                if tid > self.tm.lock().last_tid() {
                    return Err(NeoError::Protocol(format!(
                        "lock report for unallocated tid {tid}"
                    )));
                }
                let completed = self.tm.lock().locked(tid, node);
                if let Some(txn) = completed {
                    self.finish_fanout(tid, txn);
                }
            }
            Message::AbortTransaction { tid } => {
                self.tm.lock().abort(tid);
            }
            Message::AskLastIds => {
                let (loid, ltid) = {
                    let tm = self.tm.lock();
                    (tm.last_oid(), tm.last_tid())
                };
                let lptid = self.pt.lock().ptid();
                send(tx, msg_id, Message::AnswerLastIds { loid, ltid, lptid });
            }
            Message::AskUnfinishedTransactions => {
                send(tx, msg_id, Message::AnswerUnfinishedTransactions {
                    tids: self.tm.lock().unfinished(),
                });
            }
            Message::NotifyNodeInformation { nodes } => {
                self.peer_reported_nodes(&nodes);
            }
            Message::NotifyPartitionChanges { changes, .. } => {
                if node_type != NodeType::Storage {
                    return Err(NeoError::Protocol(
                        "partition changes from a non-storage".into(),
                    ));
                }
                self.storage_cells_caught_up(node, &changes);
            }
            other => {
                send_error(tx, msg_id, ErrorCode::ProtocolError, "unexpected packet");
                return Err(NeoError::Protocol(format!(
                    "unexpected {} from {node_type:?}",
                    other.name()
                )));
            }
        }
        Ok(())
    }

    /// `AskFinishTransaction`: collect the expected lock set and fan
    /// `LockInformation` out to it.
    fn start_finish(
        self: &Arc<Self>,
        conn_id: u64,
        tx: &mpsc::UnboundedSender<Packet>,
        node_type: NodeType,
        msg_id: u32,
        tid: Tid,
        oids: Vec<Oid>,
    ) -> NeoResult<()> {
        if node_type != NodeType::Client {
            send_error(tx, msg_id, ErrorCode::ProtocolError, "clients finish transactions");
            return Err(NeoError::Protocol("finish from a non-client".into()));
        }
        if !self.tm.lock().known(tid) {
            send_error(tx, msg_id, ErrorCode::ProtocolError, "unallocated tid");
            return Err(NeoError::Protocol(format!(
                "finish for unallocated tid {tid}"
            )));
        }

        // writable cells of the tid partition and of every stored oid
        let uuid_set: HashSet<NodeId> = {
            let pt = self.pt.lock();
            let mut partitions = HashSet::new();
            partitions.insert(pt.partition_of(tid.get()));
            partitions.extend(oids.iter().map(|oid| pt.partition_of(oid.get())));
            partitions
                .into_iter()
                .flat_map(|p| {
                    pt.cells(p)
                        .iter()
                        .filter(|c| c.is_writable())
                        .map(|c| c.node)
                        .collect::<Vec<_>>()
                })
                .collect()
        };

        // only storages actually connected can be expected to lock
        let expected: HashSet<NodeId> = {
            let peers = self.peers.lock();
            let live: HashSet<NodeId> = peers
                .values()
                .filter(|p| p.node_type == NodeType::Storage)
                .map(|p| p.node)
                .collect();
            uuid_set.intersection(&live).copied().collect()
        };
        if expected.len() < uuid_set.len() {
            warn!(%tid, missing = uuid_set.len() - expected.len(), "expected storages not connected");
        }

        debug!(%tid, expected = expected.len(), "collecting locks");
        if !self
            .tm
            .lock()
            .start_finish(tid, msg_id, oids, expected.clone())
        {
            send_error(tx, msg_id, ErrorCode::ProtocolError, "unknown transaction");
            return Ok(());
        }
        {
            let peers = self.peers.lock();
            for peer in peers.values() {
                if expected.contains(&peer.node) && peer.node_type == NodeType::Storage {
                    let _ = peer
                        .tx
                        .send(Packet::new(0, Message::LockInformation { tid }));
                }
            }
        }
        // an empty lock set (all expected storages just left) finishes now
        if expected.is_empty() {
            if let Some(txn) = self.tm.lock().locked_noop(tid) {
                self.finish_fanout(tid, txn);
            }
        }
        Ok(())
    }

    /// Every expected storage locked: answer the initiator, invalidate the
    /// other clients, release the storages, forget the record.
    fn finish_fanout(&self, tid: Tid, txn: FinishingTransaction) {
        info!(%tid, oids = txn.oids.len(), "transaction finished");
        let peers = self.peers.lock();
        let answer_id = txn.msg_id.unwrap_or(0);
        for (conn_id, peer) in peers.iter() {
            match peer.node_type {
                NodeType::Client => {
                    if *conn_id == txn.initiator {
                        let _ = peer.tx.send(Packet::new(
                            answer_id,
                            Message::AnswerTransactionFinished { tid },
                        ));
                    } else {
                        let _ = peer.tx.send(Packet::new(0, Message::InvalidateObjects {
                            tid,
                            oids: txn.oids.clone(),
                        }));
                    }
                }
                NodeType::Storage => {
                    if txn.expected.contains(&peer.node) {
                        let _ = peer
                            .tx
                            .send(Packet::new(0, Message::NotifyUnlockInformation { tid }));
                    }
                }
                _ => {}
            }
        }
    }

    /// A peer reported node failures (typically a client that lost a
    /// storage connection).
    fn peer_reported_nodes(&self, reported: &[NodeInfo]) {
        for info in reported {
            let Some(known) = self.nodes.get(info.id) else {
                continue;
            };
            if info.state == known.state || info.state == NodeState::Running {
                continue;
            }
            warn!(id = %info.id, state = ?info.state, "peer reported a node failure");
            // cut our connection to it, if any
            {
                let mut peers = self.peers.lock();
                peers.retain(|_, p| p.node != info.id);
            }
            self.nodes.set_state(info.id, info.state);
            if let Some(node) = self.nodes.get(info.id) {
                self.broadcast_node(&node);
            }
            if known.node_type == NodeType::Storage {
                for (tid, txn) in self.tm.lock().drop_storage(info.id) {
                    self.finish_fanout(tid, txn);
                }
                if !self.operational() {
                    error!("cluster lost its last replica of some partition");
                }
            }
        }
    }

    /// A storage finished catching a partition up and claims up-to-date.
    fn storage_cells_caught_up(&self, sender: NodeId, changes: &[(u32, NodeId, CellState)]) {
        let mut accepted = Vec::new();
        {
            let mut pt = self.pt.lock();
            for (offset, node, state) in changes {
                if *state != CellState::UpToDate {
                    warn!(%sender, "only up-to-date announcements are accepted");
                    continue;
                }
                if *node != sender {
                    warn!(%sender, "a cell may only announce itself");
                    continue;
                }
                let valid = pt.cells(*offset).iter().any(|c| {
                    c.node == sender
                        && matches!(c.state, CellState::OutOfDate | CellState::UpToDate)
                });
                if !valid {
                    warn!(%sender, offset, "announcement for a cell the storage does not hold");
                    continue;
                }
                pt.set_cell(*offset, sender, NodeState::Running, CellState::UpToDate);
                accepted.push((*offset, sender, CellState::UpToDate));
                // the feeding donor of this partition is done
                let feeding: Vec<NodeId> = pt
                    .cells(*offset)
                    .iter()
                    .filter(|c| c.state == CellState::Feeding)
                    .map(|c| c.node)
                    .collect();
                for donor in feeding {
                    pt.remove_cell(*offset, donor);
                    accepted.push((*offset, donor, CellState::Discarded));
                }
            }
            if !accepted.is_empty() {
                let ptid = pt.next_ptid();
                drop(pt);
                self.broadcast(
                    &Message::NotifyPartitionChanges {
                        ptid,
                        changes: accepted,
                    },
                    |_| true,
                );
            }
        }
        if self.operational() {
            self.started.store(true, Ordering::SeqCst);
        }
    }

    /// A peer connection went away.
    fn disconnect(&self, conn_id: u64, ident: Option<(NodeId, NodeType)>) {
        self.peers.lock().remove(&conn_id);
        let Some((node, node_type)) = ident else {
            return;
        };
        info!(id = %node, ?node_type, "peer disconnected");
        match node_type {
            NodeType::Client => {
                self.nodes.set_state(node, NodeState::TemporarilyDown);
                if let Some(n) = self.nodes.get(node) {
                    self.broadcast_node(&n);
                }
                // clients are forgotten entirely, along with their pending
                // transactions
                self.nodes.remove(node);
                self.tm.lock().drop_initiator(conn_id);
            }
            NodeType::Storage => {
                self.nodes.set_state(node, NodeState::TemporarilyDown);
                if let Some(n) = self.nodes.get(node) {
                    self.broadcast_node(&n);
                }
                for (tid, txn) in self.tm.lock().drop_storage(node) {
                    self.finish_fanout(tid, txn);
                }
                if !self.operational() {
                    error!("cluster lost its last replica of some partition");
                }
            }
            NodeType::Admin => {
                self.nodes.remove(node);
            }
            NodeType::Master => {}
        }
    }
}

impl TransactionManager {
    /// Complete a record whose expected set is empty. Split out so the
    /// master can finish immediately when no storage needs locking.
    fn locked_noop(&mut self, tid: Tid) -> Option<FinishingTransaction> {
        // any node id works: the expected set is empty
        self.locked(tid, NodeId::random())
    }
}

async fn serve_conn(master: Arc<Master>, stream: tokio::net::TcpStream) {
    let conn_id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
    let (mut sink, mut source) = framed(stream).split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Packet>();
    let writer = tokio::spawn(async move {
        while let Some(packet) = rx.recv().await {
            if sink.send(packet).await.is_err() {
                break;
            }
        }
    });

    let mut ident = None;
    while let Some(result) = source.next().await {
        let packet = match result {
            Ok(packet) => packet,
            Err(error) => {
                warn!(conn_id, %error, "bad frame, dropping peer");
                break;
            }
        };
        if let Err(error) = master.handle_packet(conn_id, &tx, &mut ident, packet) {
            warn!(conn_id, %error, "protocol error, dropping peer");
            break;
        }
    }
    master.disconnect(conn_id, ident);
    drop(tx);
    let _ = writer.await;
}

fn send(tx: &mpsc::UnboundedSender<Packet>, msg_id: u32, msg: Message) {
    let _ = tx.send(Packet::new(msg_id, msg));
}

fn send_error(tx: &mpsc::UnboundedSender<Packet>, msg_id: u32, code: ErrorCode, message: &str) {
    send(tx, msg_id, Message::Error {
        code,
        message: message.into(),
    });
}
