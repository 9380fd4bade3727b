//! The NEO storage node.
//!
//! Holds object revisions for the partitions the master assigns it. The
//! control-plane surface is complete: identification, store with conflict
//! detection and write locks, the master's lock/unlock cycle, reads at any
//! revision, history, TID listings, undo staging and lock probing. The
//! database manager is in-memory; a persistent engine is out of scope.

pub mod database;
pub mod transactions;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use sha1::{Digest, Sha1};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use neo_common::{
    Address, CellState, NodeId, NodeMap, Oid, PartitionTable, PartitionTableHandle, Tid, NodeType,
};
use neo_errors::{NeoError, NeoResult};
use neo_protocol::{connect, framed, ErrorCode, Message, Packet, TransactionInfo};

use crate::database::{MemoryDatabase, StoredObject};
use crate::transactions::{QueuedStore, StorageTransactions, StoreOutcome};

/// Digest helper shared with the database manager.
pub(crate) fn payload_digest(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Storage node configuration.
#[derive(Clone, Debug)]
pub struct StorageConfig {
    /// Address to listen on for clients; port 0 binds an ephemeral port.
    pub bind: Address,
    /// Master addresses.
    pub masters: Vec<Address>,
    /// The cluster to join.
    pub cluster: String,
    /// Persistent identity; generated when absent.
    pub id: Option<NodeId>,
}

/// The storage node state.
pub struct StorageNode {
    config: StorageConfig,
    id: NodeId,
    addr: Address,
    db: Mutex<MemoryDatabase>,
    txns: Mutex<StorageTransactions>,
    nodes: NodeMap,
    pt: PartitionTableHandle,
    dims: RwLock<Option<(u32, u32)>>,
    primary: RwLock<Option<Address>>,
    last_oid: AtomicU64,
    operational: AtomicBool,
    master_tx: Mutex<Option<mpsc::UnboundedSender<Packet>>>,
    client_tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// A running storage node and its service tasks.
pub struct StorageHandle {
    /// The node state, shared with the tasks.
    pub storage: Arc<StorageNode>,
    accept: JoinHandle<()>,
    master: JoinHandle<()>,
}

impl StorageHandle {
    /// The address clients dial.
    pub fn addr(&self) -> &Address {
        &self.storage.addr
    }

    /// The node's identity.
    pub fn node_id(&self) -> NodeId {
        self.storage.id
    }

    /// Stop serving: clients get EOF, the master session winds down.
    pub fn shutdown(&self) {
        self.accept.abort();
        self.master.abort();
        self.storage.master_tx.lock().take();
        for task in self.storage.client_tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for StorageHandle {
    fn drop(&mut self) {
        self.accept.abort();
        self.master.abort();
    }
}

impl StorageNode {
    /// Bind, join the cluster and start serving.
    pub async fn start(config: StorageConfig) -> NeoResult<StorageHandle> {
        let listener =
            TcpListener::bind((config.bind.host.as_str(), config.bind.port)).await?;
        let addr = Address::new(config.bind.host.clone(), listener.local_addr()?.port());
        let id = config.id.unwrap_or_else(NodeId::random);
        let storage = Arc::new(StorageNode {
            config,
            id,
            addr: addr.clone(),
            db: Mutex::new(MemoryDatabase::new()),
            txns: Mutex::new(StorageTransactions::new()),
            nodes: NodeMap::new(),
            pt: PartitionTableHandle::new(),
            dims: RwLock::new(None),
            primary: RwLock::new(None),
            last_oid: AtomicU64::new(0),
            operational: AtomicBool::new(false),
            master_tx: Mutex::new(None),
            client_tasks: Mutex::new(Vec::new()),
        });
        info!(%addr, id = %id, "storage listening");

        let accept = {
            let storage = Arc::clone(&storage);
            tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, peer)) => {
                            debug!(%peer, "incoming client connection");
                            let task = tokio::spawn(serve_client(Arc::clone(&storage), stream));
                            storage.client_tasks.lock().push(task);
                        }
                        Err(error) => {
                            error!(%error, "accept failed");
                            break;
                        }
                    }
                }
            })
        };
        let master = {
            let storage = Arc::clone(&storage);
            tokio::spawn(master_session(storage))
        };
        Ok(StorageHandle {
            storage,
            accept,
            master,
        })
    }

    /// Whether the node may serve clients: identified, table installed,
    /// operation started.
    pub fn ready(&self) -> bool {
        self.operational.load(Ordering::SeqCst)
            && self.dims.read().is_some()
            && self.pt.snapshot().is_some()
    }

    /// Direct access to the database manager. This is the boundary a
    /// persistent engine would implement; tests use it to inspect and
    /// corrupt stored revisions.
    pub fn database(&self) -> parking_lot::MutexGuard<'_, MemoryDatabase> {
        self.db.lock()
    }

    /// Stage one store, parking it when a foreign lock holds the OID. The
    /// parked store is answered once the lock releases; parking happens
    /// under the same lock session that observed the holder, so a release
    /// cannot slip in between and strand the request.
    fn store_or_park(&self, queued: QueuedStore) {
        let answer = {
            let db = self.db.lock();
            let mut txns = self.txns.lock();
            match txns.store_object(&db, queued.tid, queued.oid, queued.serial, queued.object.clone())
            {
                StoreOutcome::Stored => Message::AnswerStoreObject {
                    conflict: Tid::ZERO,
                    oid: queued.oid,
                    serial: queued.serial,
                },
                StoreOutcome::Conflict(committed) => Message::AnswerStoreObject {
                    conflict: committed,
                    oid: queued.oid,
                    serial: queued.serial,
                },
                StoreOutcome::Delayed => {
                    debug!(oid = %queued.oid, tid = %queued.tid, "store parked behind a foreign lock");
                    txns.delay(queued);
                    return;
                }
            }
        };
        let _ = queued
            .reply_tx
            .send(Packet::new(queued.reply_msg_id, answer));
    }

    /// Commit an unlocked transaction and retry the stores its locks held
    /// back.
    fn unlock(&self, tid: Tid) {
        let released = {
            let mut db = self.db.lock();
            let mut txns = self.txns.lock();
            txns.unlock(&mut db, tid)
        };
        info!(%tid, "transaction unlocked and committed");
        for queued in released {
            self.store_or_park(queued);
        }
    }

    /// Drop a transaction's staged state and retry the stores it blocked.
    fn abort(&self, tid: Tid) {
        let released = self.txns.lock().abort(tid);
        for queued in released {
            self.store_or_park(queued);
        }
    }

    /// Announce catch-up for every out-of-date cell assigned to this node.
    /// A fresh in-memory store has nothing to pull, so assignment is
    /// immediately final; replication transfer between storages is out of
    /// scope here.
    fn announce_catch_up(&self) {
        let Some(pt) = self.pt.snapshot() else {
            return;
        };
        let mut changes = Vec::new();
        for offset in 0..pt.num_partitions() {
            if pt
                .cells(offset)
                .iter()
                .any(|c| c.node == self.id && c.state == CellState::OutOfDate)
            {
                changes.push((offset, self.id, CellState::UpToDate));
            }
        }
        if changes.is_empty() {
            return;
        }
        let Some(tx) = self.master_tx.lock().clone() else {
            return;
        };
        info!(cells = changes.len(), "announcing caught-up cells");
        let _ = tx.send(Packet::new(0, Message::NotifyPartitionChanges {
            ptid: pt.ptid(),
            changes,
        }));
    }
}

/// Maintain the session with the primary master, reconnecting on loss.
async fn master_session(storage: Arc<StorageNode>) {
    loop {
        for addr in storage.config.masters.clone() {
            match run_master_session(&storage, &addr).await {
                Ok(()) => {}
                Err(error) => {
                    warn!(master = %addr, %error, "master session ended");
                }
            }
            storage.operational.store(false, Ordering::SeqCst);
            storage.master_tx.lock().take();
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }
}

async fn run_master_session(storage: &Arc<StorageNode>, addr: &Address) -> NeoResult<()> {
    let stream = connect(addr).await?;
    let (mut sink, mut source) = stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Packet>();
    let writer = tokio::spawn(async move {
        while let Some(packet) = rx.recv().await {
            if sink.send(packet).await.is_err() {
                break;
            }
        }
    });
    *storage.master_tx.lock() = Some(tx.clone());

    // identification; roster broadcasts may interleave ahead of the answer
    let _ = tx.send(Packet::new(1, Message::RequestIdentification {
        node_type: NodeType::Storage,
        id: Some(storage.id),
        addr: Some(storage.addr.clone()),
        cluster: storage.config.cluster.clone(),
    }));
    loop {
        let Some(result) = source.next().await else {
            writer.abort();
            return Err(NeoError::ConnectionClosed);
        };
        match result? {
            Packet {
                msg:
                    Message::AcceptIdentification {
                        num_partitions,
                        num_replicas,
                        your_id,
                        primary,
                        ..
                    },
                ..
            } => {
                if your_id != storage.id {
                    warn!(assigned = %your_id, "master reassigned our identity");
                }
                *storage.dims.write() = Some((num_partitions, num_replicas));
                *storage.primary.write() = primary.or_else(|| Some(addr.clone()));
                if storage.pt.snapshot().is_none() {
                    storage
                        .pt
                        .install(PartitionTable::new(num_partitions, num_replicas));
                }
                info!(master = %addr, "identified with master");
                break;
            }
            Packet {
                msg: Message::Error { code, message },
                ..
            } => {
                writer.abort();
                return Err(match code {
                    ErrorCode::NotReady => NeoError::NodeNotReady(message),
                    _ => NeoError::Protocol(message),
                });
            }
            Packet {
                msg: Message::NotifyNodeInformation { nodes },
                ..
            } => storage.nodes.apply(&nodes),
            Packet { msg, .. } => {
                debug!(msg = msg.name(), "ignoring pre-identification packet");
            }
        }
    }

    while let Some(result) = source.next().await {
        let packet = result?;
        handle_master_packet(storage, &tx, packet);
    }
    writer.abort();
    Err(NeoError::ConnectionClosed)
}

fn handle_master_packet(
    storage: &Arc<StorageNode>,
    tx: &mpsc::UnboundedSender<Packet>,
    packet: Packet,
) {
    let Packet { msg_id, msg } = packet;
    match msg {
        Message::SendPartitionTable { ptid, rows } => {
            match storage.pt.mutate(|pt| pt.load(ptid, &rows)) {
                Some(Err(error)) => warn!(%error, "dropping bad partition table push"),
                Some(Ok(())) => storage.announce_catch_up(),
                None => warn!("partition table push before identification"),
            }
        }
        Message::NotifyPartitionChanges { ptid, changes } => {
            storage
                .pt
                .mutate(|pt| pt.update(ptid, &changes, &storage.nodes));
            storage.announce_catch_up();
        }
        Message::NotifyNodeInformation { nodes } => storage.nodes.apply(&nodes),
        Message::NotifyLastOid { oid } => {
            storage.last_oid.store(oid.get(), Ordering::SeqCst);
        }
        Message::StartOperation => {
            info!("operation started");
            storage.operational.store(true, Ordering::SeqCst);
        }
        Message::StopOperation => {
            warn!("operation stopped");
            storage.operational.store(false, Ordering::SeqCst);
        }
        Message::LockInformation { tid } => {
            storage.txns.lock().lock(tid);
            debug!(%tid, "transaction locked");
            let _ = tx.send(Packet::new(msg_id, Message::AnswerInformationLocked { tid }));
        }
        Message::NotifyUnlockInformation { tid } => {
            storage.unlock(tid);
        }
        other => {
            debug!(msg = other.name(), "ignoring master packet");
        }
    }
}

async fn serve_client(storage: Arc<StorageNode>, stream: tokio::net::TcpStream) {
    let (mut sink, mut source) = framed(stream).split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Packet>();
    let writer = tokio::spawn(async move {
        while let Some(packet) = rx.recv().await {
            if sink.send(packet).await.is_err() {
                break;
            }
        }
    });

    let mut identified = false;
    while let Some(result) = source.next().await {
        let packet = match result {
            Ok(packet) => packet,
            Err(error) => {
                warn!(%error, "bad frame from client");
                break;
            }
        };
        if let Err(error) = handle_client_packet(&storage, &tx, &mut identified, packet) {
            warn!(%error, "dropping client connection");
            break;
        }
    }
    drop(tx);
    let _ = writer.await;
}

fn handle_client_packet(
    storage: &Arc<StorageNode>,
    tx: &mpsc::UnboundedSender<Packet>,
    identified: &mut bool,
    packet: Packet,
) -> NeoResult<()> {
    let Packet { msg_id, msg } = packet;

    match msg {
        Message::RequestIdentification {
            node_type,
            id,
            cluster,
            ..
        } => {
            if cluster != storage.config.cluster {
                send_error(tx, msg_id, ErrorCode::ProtocolError, "unexpected cluster name");
                return Err(NeoError::Protocol(format!(
                    "peer names cluster {cluster:?}"
                )));
            }
            if node_type != NodeType::Client && node_type != NodeType::Admin {
                send_error(tx, msg_id, ErrorCode::ProtocolError, "unexpected peer role");
                return Err(NeoError::Protocol("non-client identified to storage".into()));
            }
            if !storage.ready() {
                send_error(tx, msg_id, ErrorCode::NotReady, "operation not started");
                return Ok(());
            }
            let (num_partitions, num_replicas) =
                storage.dims.read().expect("ready() checked dims");
            send(tx, msg_id, Message::AcceptIdentification {
                node_type: NodeType::Storage,
                id: storage.id,
                num_partitions,
                num_replicas,
                your_id: id.unwrap_or_else(NodeId::random),
                primary: storage.primary.read().clone(),
            });
            *identified = true;
        }
        _ if !*identified => {
            send_error(tx, msg_id, ErrorCode::ProtocolError, "identify first");
            return Err(NeoError::Protocol("packet before identification".into()));
        }
        Message::AskStoreObject {
            oid,
            serial,
            compression,
            checksum,
            data,
            tid,
        } => {
            if !storage.operational.load(Ordering::SeqCst) {
                send_error(tx, msg_id, ErrorCode::NotReady, "operation stopped");
                return Ok(());
            }
            let watermark = storage.last_oid.load(Ordering::SeqCst);
            if oid != Oid::ZERO && oid.get() > watermark {
                send_error(tx, msg_id, ErrorCode::Internal, "oid past allocation watermark");
                return Ok(());
            }
            storage.store_or_park(QueuedStore {
                tid,
                oid,
                serial,
                object: StoredObject {
                    compression,
                    checksum,
                    data,
                },
                reply_tx: tx.clone(),
                reply_msg_id: msg_id,
            });
        }
        Message::AskStoreTransaction {
            tid,
            user,
            description,
            extension,
            oids,
        } => {
            storage.txns.lock().store_meta(TransactionInfo {
                tid,
                user,
                description,
                extension,
                oids,
            });
            send(tx, msg_id, Message::AnswerStoreTransaction { tid });
        }
        Message::AskObject { oid, serial, tid } => {
            let found = storage.db.lock().load(oid, serial, tid);
            match found {
                Some(rev) => send(tx, msg_id, Message::AnswerObject {
                    oid,
                    serial: rev.serial,
                    next_serial: rev.next_serial,
                    compression: rev.object.compression,
                    checksum: rev.object.checksum,
                    data: rev.object.data,
                }),
                None => send_error(tx, msg_id, ErrorCode::OidNotFound, "no matching revision"),
            }
        }
        Message::AskTransactionInformation { tid } => {
            let found = storage.db.lock().transaction_info(tid).cloned();
            match found {
                Some(info) => send(tx, msg_id, Message::AnswerTransactionInformation(info)),
                None => send_error(tx, msg_id, ErrorCode::TidNotFound, "unknown transaction"),
            }
        }
        Message::AskObjectHistory { oid, first, last } => {
            let found = storage.db.lock().history(oid, first, last);
            match found {
                Some(history) => {
                    send(tx, msg_id, Message::AnswerObjectHistory { oid, history })
                }
                None => send_error(tx, msg_id, ErrorCode::OidNotFound, "unknown object"),
            }
        }
        Message::AskTids {
            first,
            last,
            partition,
        } => {
            let num_partitions = storage
                .dims
                .read()
                .map(|(p, _)| p)
                .unwrap_or(1);
            let tids = storage.db.lock().tids(first, last, partition, num_partitions);
            send(tx, msg_id, Message::AnswerTids { tids });
        }
        Message::AskUndoTransaction { tid, undone_tid } => {
            let mut conflict_oids = Vec::new();
            let mut error_oids = Vec::new();
            {
                let db = storage.db.lock();
                let mut txns = storage.txns.lock();
                for oid in db.oids_at(undone_tid) {
                    match txns.lock_holder(oid) {
                        Some(holder) if holder != tid => {
                            conflict_oids.push(oid);
                            continue;
                        }
                        _ => {}
                    }
                    let current = db
                        .current_serial(oid)
                        .expect("oids_at only lists stored objects");
                    if current != undone_tid {
                        error_oids.push(oid);
                        continue;
                    }
                    let target = db.revert_target(oid, undone_tid);
                    txns.stage_revert(tid, oid, target);
                }
            }
            send(tx, msg_id, Message::AnswerUndoTransaction {
                conflict_oids,
                error_oids,
            });
        }
        Message::AskHasLock { tid, oid } => {
            let state = match storage.txns.lock().lock_holder(oid) {
                None => neo_protocol::LockState::NotLocked,
                Some(holder) if holder == tid => neo_protocol::LockState::Locked,
                Some(_) => neo_protocol::LockState::LockedByOther,
            };
            send(tx, msg_id, Message::AnswerHasLock { oid, state });
        }
        Message::AbortTransaction { tid } => {
            storage.abort(tid);
        }
        Message::AskLastIds => {
            let loid = Oid::new(storage.last_oid.load(Ordering::SeqCst));
            let ltid = storage
                .db
                .lock()
                .tids(0, 1, None, 1)
                .first()
                .copied()
                .unwrap_or(Tid::ZERO);
            let lptid = storage
                .pt
                .snapshot()
                .map(|pt| pt.ptid())
                .unwrap_or_default();
            send(tx, msg_id, Message::AnswerLastIds { loid, ltid, lptid });
        }
        other => {
            send_error(tx, msg_id, ErrorCode::ProtocolError, "unexpected packet");
            return Err(NeoError::Protocol(format!(
                "unexpected {} from a client",
                other.name()
            )));
        }
    }
    Ok(())
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
