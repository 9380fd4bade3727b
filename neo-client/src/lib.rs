//! Client bindings for the NEO object store.
//!
//! A [`Client`] speaks to the primary master for transaction control and to
//! the storage nodes holding the partitions its objects live in. Reads go
//! through a byte-budgeted LRU cache kept coherent by master
//! invalidations; writes run the two-phase-commit protocol in [`txn`].

mod cache;
mod conn;
mod dispatcher;
mod master_conn;
mod payload;
mod pool;
mod txn;

pub use dispatcher::{Dispatcher, Reply};

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex as SyncMutex, RwLock};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use neo_common::{Address, Cell, NodeMap, Oid, PartitionTable, PartitionTableHandle, Tid};
use neo_errors::{NeoError, NeoResult};
use neo_protocol::{Message, TransactionInfo};

use crate::cache::ClientCache;
use crate::conn::ClientConn;
use crate::pool::ConnectionPool;
use crate::txn::ActiveTxn;

/// How many OIDs one `AskNewOIDs` round trip buffers.
const OID_REFILL: u32 = 100;

/// Client library configuration.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Master addresses to try when hunting for the primary.
    pub masters: Vec<Address>,
    /// Cluster name; identification to a different cluster is refused.
    pub cluster: String,
    /// Deflate payloads when it shrinks them.
    pub compress: bool,
    /// Refuse mutating calls.
    pub read_only: bool,
    /// Object cache budget in payload bytes.
    pub cache_size: usize,
    /// Bound on pooled storage connections.
    pub max_pool_size: usize,
    /// Generic request timeout.
    pub request_timeout: Duration,
    /// Per-object store answer timeout.
    pub store_timeout: Duration,
}

impl ClientConfig {
    /// A configuration with the default tuning.
    pub fn new(masters: Vec<Address>, cluster: impl Into<String>) -> Self {
        ClientConfig {
            masters,
            cluster: cluster.into(),
            compress: true,
            read_only: false,
            cache_size: 16 << 20,
            max_pool_size: 25,
            request_timeout: Duration::from_secs(30),
            store_timeout: Duration::from_secs(20),
        }
    }
}

/// An application transaction handle. Identity (the `id` field) decides
/// which client-side transaction a call belongs to; the metadata travels in
/// `AskStoreTransaction`.
#[derive(Clone, Debug, Default)]
pub struct AppTransaction {
    /// Identity of this handle.
    pub id: u64,
    /// Committing user.
    pub user: String,
    /// Free-form description.
    pub description: String,
    /// Opaque extension payload.
    pub extension: Vec<u8>,
}

impl AppTransaction {
    /// A handle with empty metadata.
    pub fn new(id: u64) -> Self {
        AppTransaction {
            id,
            ..Default::default()
        }
    }
}

/// Application-supplied write-write conflict resolution.
pub trait ConflictResolver: Send + Sync {
    /// Merge `data` (based on `base`) with the revision committed at
    /// `committed`. `None` leaves the conflict unresolved and fails the
    /// transaction.
    fn resolve(&self, oid: Oid, committed: Tid, base: Tid, data: &[u8]) -> Option<Vec<u8>>;

    /// Merge for undo: the object is at `current`, the undo reverts
    /// `undone`. `None` fails the undo for this OID.
    fn resolve_undo(
        &self,
        _oid: Oid,
        _current: Tid,
        _undone: Tid,
        _undo_data: &[u8],
        _current_data: &[u8],
    ) -> Option<Vec<u8>> {
        None
    }
}

/// A resolver that never resolves anything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoResolver;

impl ConflictResolver for NoResolver {
    fn resolve(&self, _oid: Oid, _committed: Tid, _base: Tid, _data: &[u8]) -> Option<Vec<u8>> {
        None
    }
}

/// One entry of an object's revision history.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HistoryEntry {
    /// The committing transaction.
    pub tid: Tid,
    /// Its user.
    pub user: String,
    /// Its description.
    pub description: String,
    /// Stored payload size at that revision.
    pub size: u32,
}

/// Everything the client's components share, passed to each of them at
/// construction. Components never reach back into the whole client.
pub(crate) struct ClientServices {
    pub config: ClientConfig,
    pub dispatcher: Arc<Dispatcher>,
    pub nodes: NodeMap,
    pub pt: PartitionTableHandle,
    pub cache: SyncMutex<ClientCache>,
    pub id: RwLock<Option<neo_common::NodeId>>,
    pub primary: RwLock<Option<Address>>,
    pub notify_tx: mpsc::UnboundedSender<Message>,
}

impl std::fmt::Debug for ClientServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientServices")
            .field("cluster", &self.config.cluster)
            .field("id", &*self.id.read())
            .finish()
    }
}

/// The client application.
pub struct Client {
    pub(crate) services: Arc<ClientServices>,
    pub(crate) pool: Arc<ConnectionPool>,
    pub(crate) master: Mutex<Option<Arc<ClientConn>>>,
    pub(crate) txn: Mutex<Option<ActiveTxn>>,
    pub(crate) load_lock: Mutex<()>,
    oid_buffer: Mutex<Vec<Oid>>,
    notifications: JoinHandle<()>,
}

impl Client {
    /// Connect to the cluster: find the primary master, identify, and wait
    /// for the partition table to become operational.
    pub async fn connect(config: ClientConfig) -> NeoResult<Client> {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let cache_size = config.cache_size;
        let services = Arc::new(ClientServices {
            config,
            dispatcher: Arc::new(Dispatcher::new()),
            nodes: NodeMap::new(),
            pt: PartitionTableHandle::new(),
            cache: SyncMutex::new(ClientCache::new(cache_size)),
            id: RwLock::new(None),
            primary: RwLock::new(None),
            notify_tx,
        });
        let pool = ConnectionPool::new(Arc::clone(&services));
        let notifications = tokio::spawn(master_conn::notification_task(
            Arc::clone(&services),
            Arc::clone(&pool),
            notify_rx,
        ));
        let client = Client {
            services,
            pool,
            master: Mutex::new(None),
            txn: Mutex::new(None),
            load_lock: Mutex::new(()),
            oid_buffer: Mutex::new(Vec::new()),
            notifications,
        };
        client.master_link().await?;
        Ok(client)
    }

    /// The identity the master assigned to this client.
    pub fn node_id(&self) -> Option<neo_common::NodeId> {
        *self.services.id.read()
    }

    /// Load the current revision of `oid`, returning `(data, serial)`.
    pub async fn load(&self, oid: Oid) -> NeoResult<(Bytes, Tid)> {
        let _guard = self.load_lock.lock().await;
        if let Some((tid, data)) = self.services.cache.lock().get(oid) {
            debug!(%oid, "cache hit");
            return Ok((data, tid));
        }
        let (data, serial, _) = self.fetch_object(oid, None, None).await?;
        self.services
            .cache
            .lock()
            .store(oid, serial, data.clone());
        Ok((data, serial))
    }

    /// Load the revision of `oid` committed exactly at `serial`. Bypasses
    /// the cache, which only tracks current revisions.
    pub async fn load_serial(&self, oid: Oid, serial: Tid) -> NeoResult<Bytes> {
        let (data, _, _) = self.fetch_object(oid, Some(serial), None).await?;
        Ok(data)
    }

    /// Load the newest revision of `oid` older than `tid`, returning
    /// `(data, start, end)`. `Ok(None)` when no such revision exists.
    pub async fn load_before(
        &self,
        oid: Oid,
        tid: Tid,
    ) -> NeoResult<Option<(Bytes, Tid, Option<Tid>)>> {
        match self.fetch_object(oid, None, Some(tid)).await {
            Ok(result) => Ok(Some(result)),
            Err(NeoError::NotFound(_)) => Ok(None),
            Err(error) => Err(error),
        }
    }

    /// The current serial of `oid`: the cached one when fresh, otherwise
    /// the newest history entry.
    pub async fn get_serial(&self, oid: Oid) -> NeoResult<Tid> {
        if let Some(tid) = self.services.cache.lock().serial(oid) {
            return Ok(tid);
        }
        let history = self.history(oid, 1).await?;
        history
            .first()
            .map(|entry| entry.tid)
            .ok_or_else(|| NeoError::NotFound(format!("oid {oid} has no history")))
    }

    /// Allocate a fresh OID, refilling the client-side buffer from the
    /// master in batches.
    pub async fn new_oid(&self) -> NeoResult<Oid> {
        if self.services.config.read_only {
            return Err(NeoError::ReadOnly);
        }
        let mut buffer = self.oid_buffer.lock().await;
        if buffer.is_empty() {
            let answer = self
                .ask_master(Message::AskNewOids { count: OID_REFILL })
                .await?;
            let Message::AnswerNewOids { oids } = answer else {
                return Err(NeoError::Protocol(format!(
                    "unexpected new-oid answer {}",
                    answer.name()
                )));
            };
            if oids.is_empty() {
                return Err(NeoError::Storage("master allocated no oids".into()));
            }
            *buffer = oids;
        }
        Ok(buffer.pop().expect("buffer refilled above"))
    }

    /// Revision history of `oid`, newest first, at most `length` entries.
    /// Transaction metadata is fetched per revision, recomputing the cell
    /// set for each TID.
    pub async fn history(&self, oid: Oid, length: u64) -> NeoResult<Vec<HistoryEntry>> {
        let cells = self.ordered_readable_cells(oid.get())?;
        if cells.is_empty() {
            return Err(NeoError::NotFound(format!("no readable cell for oid {oid}")));
        }
        let mut revisions = None;
        for cell in cells {
            let Some(conn) = self.storage_conn(cell).await? else {
                continue;
            };
            let Ok(pending) = conn.ask(Message::AskObjectHistory {
                oid,
                first: 0,
                last: length,
            }) else {
                continue;
            };
            match timeout(self.services.config.request_timeout, pending.wait()).await {
                Ok(Ok(Message::AnswerObjectHistory { oid: answered, history })) => {
                    if answered != oid {
                        return Err(NeoError::Storage(format!(
                            "asked history of oid {oid}, got {answered}"
                        )));
                    }
                    revisions = Some(history);
                    break;
                }
                Ok(Ok(other)) => {
                    return Err(NeoError::Protocol(format!(
                        "unexpected history answer {}",
                        other.name()
                    )))
                }
                Ok(Err(NeoError::NotFound(_))) => continue,
                Ok(Err(error)) => {
                    warn!(%oid, %error, "history request failed");
                    continue;
                }
                Err(_) => continue,
            }
        }
        let Some(revisions) = revisions else {
            return Err(NeoError::NotFound(format!("oid {oid} has no history")));
        };

        let mut entries = Vec::with_capacity(revisions.len());
        for (serial, size) in revisions {
            let info = self.transaction_info(serial).await?;
            entries.push(HistoryEntry {
                tid: serial,
                user: info.user,
                description: info.description,
                size,
            });
        }
        Ok(entries)
    }

    /// Committed transactions visible across the cluster, newest first,
    /// for the `[first, last)` window.
    pub async fn undo_log(&self, first: u64, last: u64) -> NeoResult<Vec<TransactionInfo>> {
        let snapshot = self.pt_snapshot()?;
        let mut pending = Vec::new();
        for node_id in snapshot.node_ids() {
            let Some(node) = self.services.nodes.get(node_id) else {
                continue;
            };
            let Some(conn) = self.pool.get_for_node(&node).await? else {
                continue;
            };
            if let Ok(reply) = conn.ask(Message::AskTids {
                first,
                last,
                partition: None,
            }) {
                pending.push(reply);
            }
        }

        let mut tids = std::collections::BTreeSet::new();
        for reply in pending {
            match timeout(self.services.config.request_timeout, reply.wait()).await {
                Ok(Ok(Message::AnswerTids { tids: answered })) => tids.extend(answered),
                Ok(Ok(other)) => {
                    return Err(NeoError::Protocol(format!(
                        "unexpected tids answer {}",
                        other.name()
                    )))
                }
                Ok(Err(error)) => warn!(%error, "tid listing failed"),
                Err(_) => warn!("tid listing timed out"),
            }
        }

        let limit = last.saturating_sub(first) as usize;
        let mut log = Vec::new();
        for tid in tids.into_iter().rev() {
            if log.len() >= limit {
                break;
            }
            log.push(self.transaction_info(tid).await?);
        }
        Ok(log)
    }

    /// Let queued notifications settle.
    pub async fn sync(&self) {
        tokio::task::yield_now().await;
    }

    /// Report a storage this client found dead to the primary master.
    pub async fn notify_dead_node(&self, node: neo_common::NodeId) -> NeoResult<()> {
        let Some(found) = self.services.nodes.get(node) else {
            return Ok(());
        };
        let mut info = neo_common::NodeInfo::from(&found);
        info.state = neo_common::NodeState::TemporarilyDown;
        self.notify_master(Message::NotifyNodeInformation { nodes: vec![info] })
            .await
    }

    /// Shut the client down: stop notification processing and drop the
    /// master session.
    pub async fn close(&self) {
        self.notifications.abort();
        self.invalidate_master_link().await;
    }

    // --- internals ---------------------------------------------------------

    /// Metadata of the transaction committed at `tid`, from any readable
    /// cell of its partition.
    pub(crate) async fn transaction_info(&self, tid: Tid) -> NeoResult<TransactionInfo> {
        let cells = self.ordered_readable_cells(tid.get())?;
        for cell in cells {
            let Some(conn) = self.storage_conn(cell).await? else {
                continue;
            };
            let Ok(pending) = conn.ask(Message::AskTransactionInformation { tid }) else {
                continue;
            };
            match timeout(self.services.config.request_timeout, pending.wait()).await {
                Ok(Ok(Message::AnswerTransactionInformation(info))) => {
                    if info.tid != tid {
                        return Err(NeoError::Storage(format!(
                            "asked info of tid {tid}, got {}",
                            info.tid
                        )));
                    }
                    return Ok(info);
                }
                Ok(Ok(other)) => {
                    return Err(NeoError::Protocol(format!(
                        "unexpected transaction info answer {}",
                        other.name()
                    )))
                }
                Ok(Err(NeoError::NotFound(_))) => continue,
                Ok(Err(error)) => {
                    warn!(%tid, %error, "transaction info failed");
                    continue;
                }
                Err(_) => continue,
            }
        }
        Err(NeoError::Storage(format!(
            "transaction info for tid {tid} not found on any replica"
        )))
    }

    /// Read one revision, walking replicas until one returns a payload
    /// whose checksum verifies.
    async fn fetch_object(
        &self,
        oid: Oid,
        serial: Option<Tid>,
        before: Option<Tid>,
    ) -> NeoResult<(Bytes, Tid, Option<Tid>)> {
        let cells = self.ordered_readable_cells(oid.get())?;
        if cells.is_empty() {
            return Err(NeoError::NotFound(format!("no readable cell for oid {oid}")));
        }
        for cell in cells {
            let Some(conn) = self.storage_conn(cell).await? else {
                continue;
            };
            let Ok(pending) = conn.ask(Message::AskObject {
                oid,
                serial,
                tid: before,
            }) else {
                continue;
            };
            let msg_id = pending.msg_id;
            let answer = match timeout(self.services.config.request_timeout, pending.wait()).await
            {
                Ok(Ok(msg)) => msg,
                // a replica that should hold the object and does not is
                // authoritative: the revision does not exist
                Ok(Err(NeoError::NotFound(message))) => return Err(NeoError::NotFound(message)),
                Ok(Err(NeoError::DoesNotExist(message))) => {
                    return Err(NeoError::DoesNotExist(message))
                }
                Ok(Err(error)) => {
                    debug!(%oid, node = %cell.node, %error, "replica read failed, trying next");
                    continue;
                }
                Err(_) => {
                    conn.forget(msg_id);
                    continue;
                }
            };
            let Message::AnswerObject {
                oid: answered,
                serial: start,
                next_serial,
                compression,
                checksum,
                data,
            } = answer
            else {
                warn!(%oid, answer = answer.name(), "unexpected object answer");
                continue;
            };
            if answered != oid {
                warn!(%oid, %answered, node = %cell.node, "storage answered the wrong oid");
                continue;
            }
            if payload::digest(&data) != checksum {
                warn!(%oid, node = %cell.node, "checksum mismatch, trying another replica");
                continue;
            }
            let data = match payload::unpack(compression, data) {
                Ok(data) => data,
                Err(error) => {
                    warn!(%oid, node = %cell.node, %error, "bad payload, trying another replica");
                    continue;
                }
            };
            if data.is_empty() {
                // deletion tombstone
                return Err(NeoError::NotFound(format!("oid {oid} is deleted")));
            }
            return Ok((data, start, next_serial));
        }
        Err(NeoError::NotFound(format!(
            "oid {oid} unavailable on every replica"
        )))
    }

    /// Readable cells of the partition owning `id`, shuffled and sorted to
    /// prefer storages with a warm connection.
    fn ordered_readable_cells(&self, id: u64) -> NeoResult<Vec<Cell>> {
        let snapshot = self.pt_snapshot()?;
        let mut cells = snapshot.cells_for_id(id, true, false);
        self.pool.order_candidates(&mut cells);
        Ok(cells)
    }

    /// Writable cells of the partition owning `id`.
    pub(crate) fn writable_cells(&self, id: u64) -> NeoResult<Vec<Cell>> {
        Ok(self.pt_snapshot()?.cells_for_id(id, false, true))
    }

    /// The current partition table, which exists once bootstrapped.
    pub(crate) fn pt_snapshot(&self) -> NeoResult<Arc<PartitionTable>> {
        self.services
            .pt
            .snapshot()
            .ok_or_else(|| NeoError::Storage("partition table not loaded".into()))
    }

    /// A pooled connection for the storage holding `cell`.
    pub(crate) async fn storage_conn(&self, cell: Cell) -> NeoResult<Option<Arc<ClientConn>>> {
        let Some(node) = self.services.nodes.get(cell.node) else {
            return Ok(None);
        };
        self.pool.get_for_node(&node).await
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.notifications.abort();
    }
}
