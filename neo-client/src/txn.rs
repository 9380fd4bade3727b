//! The two-phase-commit engine: per-object store fan-out, conflict
//! detection and resolution, voting, finishing, abort and undo.

use std::collections::{BTreeSet, HashMap, HashSet};

use bytes::Bytes;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use neo_common::{NodeId, Oid, Tid};
use neo_errors::{NeoError, NeoResult};
use neo_protocol::Message;

use crate::conn::{ClientConn, PendingReply};
use crate::payload;
use crate::{AppTransaction, Client, ConflictResolver};

/// One store request still waiting for its answer.
pub(crate) struct PendingStore {
    oid: Oid,
    node: NodeId,
    reply: PendingReply,
    conn: std::sync::Arc<ClientConn>,
}

/// The state of the one transaction a client may run at a time. Created by
/// `tpc_begin`, threaded through every commit step, destroyed by
/// `tpc_finish` or `tpc_abort`.
pub(crate) struct ActiveTxn {
    /// Identity of the application transaction handle.
    pub handle: u64,
    /// The TID the master issued.
    pub tid: Tid,
    /// Pending payload per OID, uncompressed.
    pub data: HashMap<Oid, Bytes>,
    /// Base serial each store was issued against.
    pub base: HashMap<Oid, Tid>,
    /// Storages that acknowledged each OID, per answered serial.
    pub stored: HashMap<Oid, HashMap<Tid, HashSet<NodeId>>>,
    /// Conflict serials reported and not yet resolved.
    pub conflicts: HashMap<Oid, BTreeSet<Tid>>,
    /// Conflict serials the application already resolved.
    pub resolved: HashMap<Oid, BTreeSet<Tid>>,
    /// OIDs whose conflicts were resolved, for the vote report.
    pub resolved_report: BTreeSet<Oid>,
    /// Storages involved in this transaction, kept for abort.
    pub involved: HashSet<NodeId>,
    /// OIDs whose undo is staged storage-side.
    pub undo_staged: BTreeSet<Oid>,
    /// Store answers still outstanding.
    pub pending: Vec<PendingStore>,
    /// Whether the vote completed.
    pub voted: bool,
}

impl ActiveTxn {
    fn new(handle: u64, tid: Tid) -> Self {
        ActiveTxn {
            handle,
            tid,
            data: HashMap::new(),
            base: HashMap::new(),
            stored: HashMap::new(),
            conflicts: HashMap::new(),
            resolved: HashMap::new(),
            resolved_report: BTreeSet::new(),
            involved: HashSet::new(),
            undo_staged: BTreeSet::new(),
            pending: Vec::new(),
            voted: false,
        }
    }

    /// Every OID the commit covers, stores and staged undos alike.
    fn oid_list(&self) -> Vec<Oid> {
        let mut oids: BTreeSet<Oid> = self.base.keys().copied().collect();
        oids.extend(self.undo_staged.iter().copied());
        oids.into_iter().collect()
    }
}

impl Client {
    /// Begin a transaction. Idempotent for the transaction already active;
    /// any other concurrent transaction on this client fails the call.
    /// The master echoes `tid` when given and still allocatable, otherwise
    /// it allocates a fresh one.
    pub async fn tpc_begin(&self, txn: &AppTransaction, tid: Option<Tid>) -> NeoResult<Tid> {
        let mut slot = self.txn.lock().await;
        if let Some(active) = slot.as_ref() {
            if active.handle == txn.id {
                return Ok(active.tid);
            }
            return Err(NeoError::Storage(
                "another transaction is already active on this client".into(),
            ));
        }
        if self.services.config.read_only {
            return Err(NeoError::ReadOnly);
        }
        let answer = self
            .ask_master(Message::AskBeginTransaction { tid })
            .await?;
        let Message::AnswerBeginTransaction { tid } = answer else {
            return Err(NeoError::Protocol(format!(
                "unexpected begin answer {}",
                answer.name()
            )));
        };
        debug!(%tid, "transaction began");
        *slot = Some(ActiveTxn::new(txn.id, tid));
        Ok(tid)
    }

    /// Store one object revision. Fans the write out to every writable cell
    /// of the object's partition and returns without waiting for the
    /// answers; they are collected during `tpc_vote`. `version` must be
    /// empty, versioning is not supported.
    pub async fn store(
        &self,
        oid: Oid,
        serial: Tid,
        data: &[u8],
        version: &str,
        txn: &AppTransaction,
    ) -> NeoResult<()> {
        if !version.is_empty() {
            return Err(NeoError::Storage("versions are not supported".into()));
        }
        if self.services.config.read_only {
            return Err(NeoError::ReadOnly);
        }
        let mut slot = self.txn.lock().await;
        let active = active_for(&mut slot, txn)?;
        debug!(%oid, base = %serial, "storing object");
        self.send_store(active, oid, serial, Bytes::copy_from_slice(data))
            .await?;
        // surface fast-arriving conflicts before the vote
        drain_ready(active)?;
        Ok(())
    }

    /// Run the store/conflict-resolution loop to quiescence, then store the
    /// transaction metadata on the TID partition. Returns the OIDs whose
    /// conflicts the resolver settled.
    pub async fn tpc_vote(
        &self,
        txn: &AppTransaction,
        resolver: &dyn ConflictResolver,
    ) -> NeoResult<Vec<Oid>> {
        let mut slot = self.txn.lock().await;
        let active = active_for(&mut slot, txn)?;

        self.wait_store_responses(active, resolver).await?;

        // every stored object needs at least one confirming storage
        for oid in active.base.keys() {
            let confirmed = active
                .stored
                .get(oid)
                .is_some_and(|by_serial| by_serial.values().any(|set| !set.is_empty()));
            if !confirmed {
                return Err(NeoError::Storage(format!(
                    "store of oid {oid} confirmed by no storage"
                )));
            }
        }

        let tid = active.tid;
        let oids = active.oid_list();
        let cells = self.writable_cells(tid.get())?;
        let mut acks = 0;
        for cell in cells {
            let Some(node) = self.services.nodes.get(cell.node) else {
                continue;
            };
            let Some(conn) = self.pool.get_for_node(&node).await? else {
                continue;
            };
            let pending = match conn.ask(Message::AskStoreTransaction {
                tid,
                user: txn.user.clone(),
                description: txn.description.clone(),
                extension: Bytes::from(txn.extension.clone()),
                oids: oids.clone(),
            }) {
                Ok(pending) => pending,
                Err(_) => continue,
            };
            match timeout(self.services.config.request_timeout, pending.wait()).await {
                Ok(Ok(Message::AnswerStoreTransaction { .. })) => {
                    active.involved.insert(node.id);
                    acks += 1;
                }
                Ok(Ok(other)) => {
                    return Err(NeoError::Protocol(format!(
                        "unexpected vote answer {}",
                        other.name()
                    )))
                }
                Ok(Err(error)) => warn!(node = %node.id, %error, "vote refused"),
                Err(_) => warn!(node = %node.id, "vote timed out"),
            }
        }
        if acks == 0 {
            return Err(NeoError::Storage("tpc_vote failed: no storage accepted".into()));
        }

        // probe the master now so a dead session fails here, not in finish
        self.master_link().await?;
        active.voted = true;
        Ok(active.resolved_report.iter().copied().collect())
    }

    /// Finish the transaction and return the committed TID.
    pub async fn tpc_finish(&self, txn: &AppTransaction) -> NeoResult<Tid> {
        self.tpc_finish_with(txn, |_| {}).await
    }

    /// Finish the transaction, invoking `callback` with the TID right
    /// before the commit request goes out. Runs under the load lock so
    /// concurrent loads cannot straddle the commit boundary.
    pub async fn tpc_finish_with(
        &self,
        txn: &AppTransaction,
        callback: impl FnOnce(Tid),
    ) -> NeoResult<Tid> {
        let mut slot = self.txn.lock().await;
        let active = active_for(&mut slot, txn)?;
        let _load_guard = self.load_lock.lock().await;

        let tid = active.tid;
        callback(tid);
        let answer = self
            .ask_master(Message::AskFinishTransaction {
                tid,
                oids: active.oid_list(),
            })
            .await?;
        match answer {
            Message::AnswerTransactionFinished { tid: answered } if answered == tid => {}
            Message::AnswerTransactionFinished { tid: answered } => {
                return Err(NeoError::Protocol(format!(
                    "finish answered for tid {answered}, expected {tid}"
                )))
            }
            other => {
                return Err(NeoError::Protocol(format!(
                    "unexpected finish answer {}",
                    other.name()
                )))
            }
        }

        // post-commit: cache maintenance failures must not undo a durable
        // commit, and the cache itself cannot fail here
        {
            let mut cache = self.services.cache.lock();
            for (oid, data) in &active.data {
                if data.is_empty() {
                    cache.remove(*oid);
                } else {
                    cache.store_committed(*oid, tid, data.clone());
                }
            }
            for oid in &active.undo_staged {
                cache.remove(*oid);
            }
        }
        info!(%tid, "transaction finished");
        *slot = None;
        Ok(tid)
    }

    /// Abort the active transaction. A foreign handle is a no-op. Storages
    /// and master are notified best-effort; they finalize the rollback on
    /// their side.
    pub async fn tpc_abort(&self, txn: &AppTransaction) -> NeoResult<()> {
        let mut slot = self.txn.lock().await;
        let Some(active) = slot.as_mut() else {
            return Ok(());
        };
        if active.handle != txn.id {
            return Ok(());
        }
        let tid = active.tid;
        info!(%tid, "aborting transaction");

        for pending in active.pending.drain(..) {
            pending.conn.forget(pending.reply.msg_id);
        }
        for node_id in active.involved.clone() {
            let Some(node) = self.services.nodes.get(node_id) else {
                continue;
            };
            if let Ok(Some(conn)) = self.pool.get_for_node(&node).await {
                let _ = conn.notify(Message::AbortTransaction { tid });
            }
        }
        if let Err(error) = self.notify_master(Message::AbortTransaction { tid }).await {
            warn!(%error, "could not notify master of abort");
        }
        *slot = None;
        Ok(())
    }

    /// Undo `undone_tid` inside the active transaction. OIDs modified since
    /// are merged through the resolver; OIDs locked by concurrent
    /// transactions fail the undo. Returns the TID and the OIDs affected.
    pub async fn undo(
        &self,
        undone_tid: Tid,
        txn: &AppTransaction,
        resolver: &dyn ConflictResolver,
    ) -> NeoResult<(Tid, Vec<Oid>)> {
        if self.services.config.read_only {
            return Err(NeoError::ReadOnly);
        }
        let mut slot = self.txn.lock().await;
        let active = active_for(&mut slot, txn)?;
        let tid = active.tid;

        let info = self.transaction_info(undone_tid).await?;

        let snapshot = self.pt_snapshot()?;
        let mut conflict_oids = BTreeSet::new();
        let mut error_oids = BTreeSet::new();
        let mut answered = 0;
        for node_id in snapshot.node_ids() {
            let Some(node) = self.services.nodes.get(node_id) else {
                continue;
            };
            let Some(conn) = self.pool.get_for_node(&node).await? else {
                continue;
            };
            let Ok(pending) = conn.ask(Message::AskUndoTransaction { tid, undone_tid }) else {
                continue;
            };
            match timeout(self.services.config.request_timeout, pending.wait()).await {
                Ok(Ok(Message::AnswerUndoTransaction {
                    conflict_oids: conflicts,
                    error_oids: errors,
                })) => {
                    answered += 1;
                    active.involved.insert(node_id);
                    conflict_oids.extend(conflicts);
                    error_oids.extend(errors);
                }
                Ok(Ok(other)) => {
                    return Err(NeoError::Protocol(format!(
                        "unexpected undo answer {}",
                        other.name()
                    )))
                }
                Ok(Err(error)) => warn!(node = %node_id, %error, "undo refused"),
                Err(_) => warn!(node = %node_id, "undo timed out"),
            }
        }
        if answered == 0 {
            return Err(NeoError::Storage("undo failed: no storage answered".into()));
        }
        if let Some(oid) = conflict_oids.into_iter().next() {
            return Err(NeoError::Undo {
                oid: oid.get(),
                reason: "object locked by a concurrent transaction".into(),
            });
        }

        // objects modified after the undone transaction go through the
        // application resolver and are re-stored
        for oid in &error_oids {
            let (current_data, current_serial) = self.load(*oid).await?;
            let undo_data = self.load_serial(*oid, undone_tid).await?;
            match resolver.resolve_undo(*oid, current_serial, undone_tid, &undo_data, &current_data)
            {
                Some(merged) => {
                    self.send_store(active, *oid, current_serial, Bytes::from(merged))
                        .await?;
                }
                None => {
                    return Err(NeoError::Undo {
                        oid: oid.get(),
                        reason: "modified by a later transaction".into(),
                    })
                }
            }
        }

        for oid in &info.oids {
            if !error_oids.contains(oid) {
                active.undo_staged.insert(*oid);
            }
        }
        Ok((tid, info.oids))
    }

    /// Fan one store out to the writable cells of the object's partition
    /// and record the outstanding answers.
    pub(crate) async fn send_store(
        &self,
        active: &mut ActiveTxn,
        oid: Oid,
        base_serial: Tid,
        data: Bytes,
    ) -> NeoResult<()> {
        let (compression, wire) = payload::pack(&data, self.services.config.compress);
        let checksum = payload::digest(&wire);
        let cells = self.writable_cells(oid.get())?;
        if cells.is_empty() {
            return Err(NeoError::Storage(format!("no writable cell for oid {oid}")));
        }
        let tid = active.tid;
        let mut asked = 0;
        for cell in cells {
            let Some(node) = self.services.nodes.get(cell.node) else {
                continue;
            };
            let Some(conn) = self.pool.get_for_node(&node).await? else {
                continue;
            };
            let pending = match conn.ask(Message::AskStoreObject {
                oid,
                serial: base_serial,
                compression,
                checksum,
                data: wire.clone(),
                tid,
            }) {
                Ok(pending) => pending,
                Err(_) => continue,
            };
            active.pending.push(PendingStore {
                oid,
                node: node.id,
                reply: pending,
                conn,
            });
            active.involved.insert(node.id);
            asked += 1;
        }
        if asked == 0 {
            return Err(NeoError::Storage(format!(
                "no storage reachable to store oid {oid}"
            )));
        }
        active.data.insert(oid, data);
        active.base.insert(oid, base_serial);
        Ok(())
    }

    /// Collect store answers and loop conflict resolution until no answer
    /// is outstanding and no conflict is pending.
    async fn wait_store_responses(
        &self,
        active: &mut ActiveTxn,
        resolver: &dyn ConflictResolver,
    ) -> NeoResult<()> {
        loop {
            self.wait_responses(active).await?;
            if active.conflicts.is_empty() {
                return Ok(());
            }
            let conflicts: Vec<(Oid, BTreeSet<Tid>)> = active.conflicts.drain().collect();
            for (oid, serials) in conflicts {
                let serial = *serials.iter().next_back().expect("non-empty conflict set");
                let base = active.base.get(&oid).copied().unwrap_or(Tid::ZERO);
                let data = active.data.get(&oid).cloned().unwrap_or_default();
                if serial <= active.tid {
                    if let Some(merged) = resolver.resolve(oid, serial, base, &data) {
                        info!(%oid, %serial, "conflict resolved, restoring");
                        active.resolved.entry(oid).or_default().extend(serials);
                        active.resolved_report.insert(oid);
                        self.send_store(active, oid, serial, Bytes::from(merged))
                            .await?;
                        continue;
                    }
                }
                return Err(NeoError::Conflict {
                    oid: oid.get(),
                    serial: serial.get(),
                    base: base.get(),
                    data: data.to_vec(),
                });
            }
        }
    }

    /// Wait for every outstanding store answer. Timed-out requests are
    /// forgotten and diagnosed with a short `AskHasLock` probe so a stalled
    /// storage cannot wedge the client.
    async fn wait_responses(&self, active: &mut ActiveTxn) -> NeoResult<()> {
        let store_timeout = self.services.config.store_timeout;
        while let Some(pending) = active.pending.pop() {
            let PendingStore {
                oid,
                node,
                reply,
                conn,
            } = pending;
            let msg_id = reply.msg_id;
            match timeout(store_timeout, reply.wait()).await {
                Ok(Ok(msg)) => handle_store_answer(active, node, msg)?,
                Ok(Err(NeoError::Protocol(message))) => {
                    return Err(NeoError::Protocol(message));
                }
                Ok(Err(error)) => {
                    warn!(%oid, %node, %error, "store not acknowledged");
                }
                Err(_) => {
                    warn!(%oid, %node, "store timed out, probing the lock");
                    conn.forget(msg_id);
                    self.probe_lock(&conn, active.tid, oid).await;
                }
            }
        }
        Ok(())
    }

    /// Best-effort diagnostic for a storage that stopped answering stores.
    async fn probe_lock(&self, conn: &std::sync::Arc<ClientConn>, tid: Tid, oid: Oid) {
        let Ok(pending) = conn.ask(Message::AskHasLock { tid, oid }) else {
            return;
        };
        let msg_id = pending.msg_id;
        match timeout(std::time::Duration::from_secs(5), pending.wait()).await {
            Ok(Ok(Message::AnswerHasLock { state, .. })) => {
                warn!(%oid, ?state, "stalled storage lock state");
            }
            Ok(_) => {}
            Err(_) => conn.forget(msg_id),
        }
    }
}

/// The active transaction for `txn`, or the API-misuse error.
fn active_for<'a>(
    slot: &'a mut Option<ActiveTxn>,
    txn: &AppTransaction,
) -> NeoResult<&'a mut ActiveTxn> {
    match slot.as_mut() {
        Some(active) if active.handle == txn.id => Ok(active),
        _ => Err(NeoError::StorageTransaction),
    }
}

/// Process store answers that already arrived, without blocking.
fn drain_ready(active: &mut ActiveTxn) -> NeoResult<()> {
    let mut index = 0;
    while index < active.pending.len() {
        match active.pending[index].reply.poll_now() {
            Ok(Some(msg)) => {
                let pending = active.pending.swap_remove(index);
                handle_store_answer(active, pending.node, msg)?;
            }
            Ok(None) => index += 1,
            Err(error) => {
                let pending = active.pending.swap_remove(index);
                debug!(oid = %pending.oid, node = %pending.node, %error, "early store failure");
            }
        }
    }
    Ok(())
}

/// Account one `AnswerStoreObject`. Success and conflict answers for the
/// same OID at the same serial cannot coexist; that would mean storages
/// disagree about committed history.
fn handle_store_answer(active: &mut ActiveTxn, node: NodeId, msg: Message) -> NeoResult<()> {
    let Message::AnswerStoreObject {
        conflict,
        oid,
        serial,
    } = msg
    else {
        // late lock-probe answers can land here; nothing to account
        debug!(msg = msg.name(), "ignoring non-store answer");
        return Ok(());
    };

    if conflict == Tid::ZERO {
        if active
            .conflicts
            .get(&oid)
            .is_some_and(|set| set.contains(&serial))
        {
            return Err(NeoError::Protocol(format!(
                "storage {node} accepted oid {oid} at serial {serial} another reported in conflict"
            )));
        }
        active
            .stored
            .entry(oid)
            .or_default()
            .entry(serial)
            .or_default()
            .insert(node);
        return Ok(());
    }

    if conflict == active.tid {
        return Err(NeoError::Protocol(format!(
            "storage {node} reports a conflict for oid {oid} at our own tid {conflict}"
        )));
    }
    if active
        .resolved
        .get(&oid)
        .is_some_and(|set| set.contains(&conflict))
    {
        debug!(%oid, %conflict, "conflict already resolved, ignoring");
        return Ok(());
    }
    if active
        .stored
        .get(&oid)
        .and_then(|by_serial| by_serial.get(&conflict))
        .is_some_and(|set| !set.is_empty())
    {
        return Err(NeoError::Protocol(format!(
            "storages accepted oid {oid} at serial {conflict} but {node} reports a conflict"
        )));
    }
    info!(%oid, %conflict, %node, "store conflict reported");
    active.conflicts.entry(oid).or_default().insert(conflict);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txn_with_tid(tid: u64) -> ActiveTxn {
        ActiveTxn::new(1, Tid::new(tid))
    }

    #[test]
    fn success_answers_accumulate_per_serial() {
        let mut active = txn_with_tid(9);
        let (a, b) = (NodeId::random(), NodeId::random());
        for node in [a, b] {
            handle_store_answer(
                &mut active,
                node,
                Message::AnswerStoreObject {
                    conflict: Tid::ZERO,
                    oid: Oid::new(1),
                    serial: Tid::new(4),
                },
            )
            .unwrap();
        }
        let set = &active.stored[&Oid::new(1)][&Tid::new(4)];
        assert_eq!(set.len(), 2);
        assert!(active.conflicts.is_empty());
    }

    #[test]
    fn conflicts_collect_until_resolved() {
        let mut active = txn_with_tid(9);
        handle_store_answer(
            &mut active,
            NodeId::random(),
            Message::AnswerStoreObject {
                conflict: Tid::new(5),
                oid: Oid::new(1),
                serial: Tid::new(4),
            },
        )
        .unwrap();
        assert!(active.conflicts[&Oid::new(1)].contains(&Tid::new(5)));

        // once resolved, a replica repeating the same conflict is ignored
        active.conflicts.clear();
        active
            .resolved
            .entry(Oid::new(1))
            .or_default()
            .insert(Tid::new(5));
        handle_store_answer(
            &mut active,
            NodeId::random(),
            Message::AnswerStoreObject {
                conflict: Tid::new(5),
                oid: Oid::new(1),
                serial: Tid::new(4),
            },
        )
        .unwrap();
        assert!(active.conflicts.is_empty());
    }

    #[test]
    fn success_and_conflict_at_same_serial_is_fatal() {
        let mut active = txn_with_tid(9);
        handle_store_answer(
            &mut active,
            NodeId::random(),
            Message::AnswerStoreObject {
                conflict: Tid::ZERO,
                oid: Oid::new(1),
                serial: Tid::new(5),
            },
        )
        .unwrap();
        let result = handle_store_answer(
            &mut active,
            NodeId::random(),
            Message::AnswerStoreObject {
                conflict: Tid::new(5),
                oid: Oid::new(1),
                serial: Tid::new(4),
            },
        );
        assert!(matches!(result, Err(NeoError::Protocol(_))));
    }

    #[test]
    fn conflict_at_own_tid_is_fatal() {
        let mut active = txn_with_tid(9);
        let result = handle_store_answer(
            &mut active,
            NodeId::random(),
            Message::AnswerStoreObject {
                conflict: Tid::new(9),
                oid: Oid::new(1),
                serial: Tid::new(4),
            },
        );
        assert!(matches!(result, Err(NeoError::Protocol(_))));
    }

    #[test]
    fn oid_list_merges_stores_and_staged_undos() {
        let mut active = txn_with_tid(9);
        active.base.insert(Oid::new(2), Tid::ZERO);
        active.undo_staged.insert(Oid::new(7));
        active.undo_staged.insert(Oid::new(2));
        assert_eq!(active.oid_list(), vec![Oid::new(2), Oid::new(7)]);
    }
}
