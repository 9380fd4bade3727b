//! The typed packet bodies and the opcode registry.

use bytes::Bytes;

use neo_common::{Address, CellState, NodeId, NodeInfo, NodeType, Oid, Ptid, Tid};

use crate::RESPONSE_MASK;

/// Error codes carried by [`Message::Error`] answers. These travel instead
/// of a regular answer when the peer cannot serve the request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    /// The peer is still initializing; the caller should skip it.
    NotReady,
    /// No revision of the OID matched the request.
    OidNotFound,
    /// The TID is unknown to this peer.
    TidNotFound,
    /// The OID definitively does not exist.
    OidDoesNotExist,
    /// The request violated the protocol; the connection is poisoned.
    ProtocolError,
    /// The peer refuses mutations.
    ReadOnly,
    /// The peer failed internally.
    Internal,
}

impl ErrorCode {
    /// Wire encoding.
    pub fn code(self) -> u8 {
        match self {
            ErrorCode::NotReady => 1,
            ErrorCode::OidNotFound => 2,
            ErrorCode::TidNotFound => 3,
            ErrorCode::OidDoesNotExist => 4,
            ErrorCode::ProtocolError => 5,
            ErrorCode::ReadOnly => 6,
            ErrorCode::Internal => 7,
        }
    }

    /// Decode the wire form.
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => ErrorCode::NotReady,
            2 => ErrorCode::OidNotFound,
            3 => ErrorCode::TidNotFound,
            4 => ErrorCode::OidDoesNotExist,
            5 => ErrorCode::ProtocolError,
            6 => ErrorCode::ReadOnly,
            7 => ErrorCode::Internal,
            _ => return None,
        })
    }
}

/// Answer to `AskHasLock`: who holds the write lock on the probed OID.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockState {
    /// Nobody holds the lock.
    NotLocked,
    /// The asking transaction holds it.
    Locked,
    /// Another transaction holds it.
    LockedByOther,
}

impl LockState {
    /// Wire encoding.
    pub fn code(self) -> u8 {
        match self {
            LockState::NotLocked => 0,
            LockState::Locked => 1,
            LockState::LockedByOther => 2,
        }
    }

    /// Decode the wire form.
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => LockState::NotLocked,
            1 => LockState::Locked,
            2 => LockState::LockedByOther,
            _ => return None,
        })
    }
}

/// Metadata of one committed transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionInfo {
    /// The transaction.
    pub tid: Tid,
    /// Committing user.
    pub user: String,
    /// Free-form description.
    pub description: String,
    /// Opaque application extension payload.
    pub extension: Bytes,
    /// Objects the transaction wrote.
    pub oids: Vec<Oid>,
}

/// One partition row as carried by table packets.
pub type PartitionRow = (u32, Vec<(NodeId, CellState)>);

/// Every packet body the cluster speaks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    // --- bootstrap ---------------------------------------------------------
    /// Role negotiation, first packet on every connection.
    RequestIdentification {
        /// The dialing node's role.
        node_type: NodeType,
        /// Its identity; `None` asks the master to assign one.
        id: Option<NodeId>,
        /// Its listen address; servers only.
        addr: Option<Address>,
        /// The cluster it believes it is joining.
        cluster: String,
    },
    /// Identification accepted.
    AcceptIdentification {
        /// The answering peer's role.
        node_type: NodeType,
        /// The answering peer's identity.
        id: NodeId,
        /// Cluster partition count (P).
        num_partitions: u32,
        /// Extra replicas per partition (R).
        num_replicas: u32,
        /// The identity assigned to the dialing node.
        your_id: NodeId,
        /// The primary master the peer follows, when the peer is a storage.
        primary: Option<Address>,
    },
    /// Which master is primary?
    AskPrimary,
    /// Names the primary master.
    AnswerPrimary {
        /// Address of the primary.
        primary: Address,
    },
    /// Request the full roster; rows arrive as `NotifyNodeInformation`
    /// before the (empty) answer.
    AskNodeInformation,
    /// Terminates a roster dump.
    AnswerNodeInformation,
    /// Request the partition table.
    AskPartitionTable,
    /// The full partition table.
    AnswerPartitionTable {
        /// Table version.
        ptid: Ptid,
        /// All rows.
        rows: Vec<PartitionRow>,
    },

    // --- transaction -------------------------------------------------------
    /// Begin a transaction; the master echoes the caller's TID when given
    /// and acceptable, or allocates a fresh one.
    AskBeginTransaction {
        /// Caller-provided TID, accepted only if beyond the master's last.
        tid: Option<Tid>,
    },
    /// The TID in force for the new transaction.
    AnswerBeginTransaction {
        /// Allocated or echoed TID.
        tid: Tid,
    },
    /// Allocate fresh OIDs.
    AskNewOids {
        /// How many.
        count: u32,
    },
    /// Freshly allocated OIDs.
    AnswerNewOids {
        /// The allocation, descending pop order.
        oids: Vec<Oid>,
    },
    /// Store one object revision under the transaction's write lock.
    AskStoreObject {
        /// The object.
        oid: Oid,
        /// The revision the caller based its change on.
        serial: Tid,
        /// 0 = raw, 1 = deflate.
        compression: u8,
        /// Digest over `data` as it appears on the wire.
        checksum: [u8; 20],
        /// The (possibly compressed) payload.
        data: Bytes,
        /// The storing transaction.
        tid: Tid,
    },
    /// Store outcome; `conflict` is zero on success, otherwise the committed
    /// serial the store collided with.
    AnswerStoreObject {
        /// Zero or the conflicting committed serial.
        conflict: Tid,
        /// The object.
        oid: Oid,
        /// The base serial the store was attempted against.
        serial: Tid,
    },
    /// Store the transaction metadata ahead of the vote.
    AskStoreTransaction {
        /// The transaction.
        tid: Tid,
        /// Committing user.
        user: String,
        /// Description.
        description: String,
        /// Opaque extension payload.
        extension: Bytes,
        /// Objects written.
        oids: Vec<Oid>,
    },
    /// Transaction metadata accepted.
    AnswerStoreTransaction {
        /// The transaction.
        tid: Tid,
    },
    /// Ask the master to commit.
    AskFinishTransaction {
        /// The transaction.
        tid: Tid,
        /// Objects written.
        oids: Vec<Oid>,
    },
    /// The commit is durable.
    AnswerTransactionFinished {
        /// The committed transaction.
        tid: Tid,
    },
    /// Drop a transaction; notification, no answer.
    AbortTransaction {
        /// The transaction.
        tid: Tid,
    },
    /// Probe the write lock on an OID; used to diagnose a stalled store.
    AskHasLock {
        /// The probing transaction.
        tid: Tid,
        /// The object.
        oid: Oid,
    },
    /// Lock probe result.
    AnswerHasLock {
        /// The object.
        oid: Oid,
        /// Who holds the lock.
        state: LockState,
    },

    // --- master <-> storage ------------------------------------------------
    /// Master asks a storage to lock a transaction's data.
    LockInformation {
        /// The transaction.
        tid: Tid,
    },
    /// Storage reports the transaction locked.
    AnswerInformationLocked {
        /// The transaction.
        tid: Tid,
    },
    /// Master releases a locked transaction; the storage makes it durable.
    NotifyUnlockInformation {
        /// The transaction.
        tid: Tid,
    },
    /// Master tells a storage to start serving.
    StartOperation,
    /// Master tells a storage to stop serving.
    StopOperation,
    /// New OID allocation watermark; storages refuse stores past it.
    NotifyLastOid {
        /// Highest allocated OID.
        oid: Oid,
    },

    // --- invalidation and roster -------------------------------------------
    /// Objects committed by another client; drop them from caches.
    InvalidateObjects {
        /// The committing transaction.
        tid: Tid,
        /// The objects it wrote.
        oids: Vec<Oid>,
    },
    /// Roster rows from the master.
    NotifyNodeInformation {
        /// Changed or dumped nodes.
        nodes: Vec<NodeInfo>,
    },
    /// Incremental partition table diff.
    NotifyPartitionChanges {
        /// New table version.
        ptid: Ptid,
        /// Changed cells.
        changes: Vec<(u32, NodeId, CellState)>,
    },
    /// Unsolicited full partition table.
    SendPartitionTable {
        /// Table version.
        ptid: Ptid,
        /// All rows.
        rows: Vec<PartitionRow>,
    },

    // --- read and undo -----------------------------------------------------
    /// Read one object revision: at an exact serial, before a TID, or the
    /// latest when both are `None`.
    AskObject {
        /// The object.
        oid: Oid,
        /// Exact revision wanted.
        serial: Option<Tid>,
        /// Upper bound (exclusive) on the revision wanted.
        tid: Option<Tid>,
    },
    /// One object revision.
    AnswerObject {
        /// The object.
        oid: Oid,
        /// Revision serial.
        serial: Tid,
        /// Serial of the next revision, if one exists.
        next_serial: Option<Tid>,
        /// 0 = raw, 1 = deflate.
        compression: u8,
        /// Digest over `data` as it appears on the wire.
        checksum: [u8; 20],
        /// The (possibly compressed) payload.
        data: Bytes,
    },
    /// Revision list of one object, newest first.
    AskObjectHistory {
        /// The object.
        oid: Oid,
        /// Skip this many newest revisions.
        first: u64,
        /// Stop before this index.
        last: u64,
    },
    /// Revision list answer.
    AnswerObjectHistory {
        /// The object.
        oid: Oid,
        /// `(serial, payload size)` pairs, newest first.
        history: Vec<(Tid, u32)>,
    },
    /// Committed TIDs held by the peer, newest first.
    AskTids {
        /// Skip this many newest TIDs.
        first: u64,
        /// Stop before this index.
        last: u64,
        /// Restrict to one partition, or all when `None`.
        partition: Option<u32>,
    },
    /// Committed TID list.
    AnswerTids {
        /// The TIDs.
        tids: Vec<Tid>,
    },
    /// Metadata of one committed transaction.
    AskTransactionInformation {
        /// The transaction.
        tid: Tid,
    },
    /// Transaction metadata.
    AnswerTransactionInformation(TransactionInfo),
    /// Stage the undo of `undone_tid` under transaction `tid`.
    AskUndoTransaction {
        /// The undoing transaction.
        tid: Tid,
        /// The transaction being undone.
        undone_tid: Tid,
    },
    /// Undo staging outcome per OID class.
    AnswerUndoTransaction {
        /// OIDs locked by other transactions; the undo cannot proceed.
        conflict_oids: Vec<Oid>,
        /// OIDs modified after the undone transaction; the application
        /// resolver must merge them.
        error_oids: Vec<Oid>,
    },
    /// Last allocated identifiers.
    AskLastIds,
    /// Last allocated identifiers.
    AnswerLastIds {
        /// Last OID.
        loid: Oid,
        /// Last TID.
        ltid: Tid,
        /// Last partition table version.
        lptid: Ptid,
    },
    /// Transactions still being finished.
    AskUnfinishedTransactions,
    /// Transactions still being finished.
    AnswerUnfinishedTransactions {
        /// Their TIDs.
        tids: Vec<Tid>,
    },

    /// Error answer standing in for any regular answer.
    Error {
        /// What went wrong.
        code: ErrorCode,
        /// Human-readable detail.
        message: String,
    },
}

impl Message {
    /// The wire code, answer bit included.
    pub fn code(&self) -> u16 {
        use Message::*;
        match self {
            Error { .. } => RESPONSE_MASK,
            RequestIdentification { .. } => 1,
            AcceptIdentification { .. } => 1 | RESPONSE_MASK,
            AskPrimary => 2,
            AnswerPrimary { .. } => 2 | RESPONSE_MASK,
            AskNodeInformation => 3,
            AnswerNodeInformation => 3 | RESPONSE_MASK,
            AskPartitionTable => 4,
            AnswerPartitionTable { .. } => 4 | RESPONSE_MASK,
            AskBeginTransaction { .. } => 5,
            AnswerBeginTransaction { .. } => 5 | RESPONSE_MASK,
            AskNewOids { .. } => 6,
            AnswerNewOids { .. } => 6 | RESPONSE_MASK,
            AskStoreObject { .. } => 7,
            AnswerStoreObject { .. } => 7 | RESPONSE_MASK,
            AskStoreTransaction { .. } => 8,
            AnswerStoreTransaction { .. } => 8 | RESPONSE_MASK,
            AskFinishTransaction { .. } => 9,
            AnswerTransactionFinished { .. } => 9 | RESPONSE_MASK,
            AbortTransaction { .. } => 10,
            AskHasLock { .. } => 11,
            AnswerHasLock { .. } => 11 | RESPONSE_MASK,
            LockInformation { .. } => 12,
            AnswerInformationLocked { .. } => 12 | RESPONSE_MASK,
            NotifyUnlockInformation { .. } => 13,
            StartOperation => 14,
            StopOperation => 15,
            NotifyLastOid { .. } => 16,
            InvalidateObjects { .. } => 17,
            NotifyNodeInformation { .. } => 18,
            NotifyPartitionChanges { .. } => 19,
            SendPartitionTable { .. } => 20,
            AskObject { .. } => 21,
            AnswerObject { .. } => 21 | RESPONSE_MASK,
            AskObjectHistory { .. } => 22,
            AnswerObjectHistory { .. } => 22 | RESPONSE_MASK,
            AskTids { .. } => 23,
            AnswerTids { .. } => 23 | RESPONSE_MASK,
            AskTransactionInformation { .. } => 24,
            AnswerTransactionInformation(_) => 24 | RESPONSE_MASK,
            AskUndoTransaction { .. } => 25,
            AnswerUndoTransaction { .. } => 25 | RESPONSE_MASK,
            AskLastIds => 26,
            AnswerLastIds { .. } => 26 | RESPONSE_MASK,
            AskUnfinishedTransactions => 27,
            AnswerUnfinishedTransactions { .. } => 27 | RESPONSE_MASK,
        }
    }

    /// Whether this packet answers a request.
    pub fn is_answer(&self) -> bool {
        self.code() & RESPONSE_MASK != 0
    }

    /// Short name for log lines.
    pub fn name(&self) -> &'static str {
        use Message::*;
        match self {
            RequestIdentification { .. } => "RequestIdentification",
            AcceptIdentification { .. } => "AcceptIdentification",
            AskPrimary => "AskPrimary",
            AnswerPrimary { .. } => "AnswerPrimary",
            AskNodeInformation => "AskNodeInformation",
            AnswerNodeInformation => "AnswerNodeInformation",
            AskPartitionTable => "AskPartitionTable",
            AnswerPartitionTable { .. } => "AnswerPartitionTable",
            AskBeginTransaction { .. } => "AskBeginTransaction",
            AnswerBeginTransaction { .. } => "AnswerBeginTransaction",
            AskNewOids { .. } => "AskNewOids",
            AnswerNewOids { .. } => "AnswerNewOids",
            AskStoreObject { .. } => "AskStoreObject",
            AnswerStoreObject { .. } => "AnswerStoreObject",
            AskStoreTransaction { .. } => "AskStoreTransaction",
            AnswerStoreTransaction { .. } => "AnswerStoreTransaction",
            AskFinishTransaction { .. } => "AskFinishTransaction",
            AnswerTransactionFinished { .. } => "AnswerTransactionFinished",
            AbortTransaction { .. } => "AbortTransaction",
            AskHasLock { .. } => "AskHasLock",
            AnswerHasLock { .. } => "AnswerHasLock",
            LockInformation { .. } => "LockInformation",
            AnswerInformationLocked { .. } => "AnswerInformationLocked",
            NotifyUnlockInformation { .. } => "NotifyUnlockInformation",
            StartOperation => "StartOperation",
            StopOperation => "StopOperation",
            NotifyLastOid { .. } => "NotifyLastOid",
            InvalidateObjects { .. } => "InvalidateObjects",
            NotifyNodeInformation { .. } => "NotifyNodeInformation",
            NotifyPartitionChanges { .. } => "NotifyPartitionChanges",
            SendPartitionTable { .. } => "SendPartitionTable",
            AskObject { .. } => "AskObject",
            AnswerObject { .. } => "AnswerObject",
            AskObjectHistory { .. } => "AskObjectHistory",
            AnswerObjectHistory { .. } => "AnswerObjectHistory",
            AskTids { .. } => "AskTids",
            AnswerTids { .. } => "AnswerTids",
            AskTransactionInformation { .. } => "AskTransactionInformation",
            AnswerTransactionInformation(_) => "AnswerTransactionInformation",
            AskUndoTransaction { .. } => "AskUndoTransaction",
            AnswerUndoTransaction { .. } => "AnswerUndoTransaction",
            AskLastIds => "AskLastIds",
            AnswerLastIds { .. } => "AnswerLastIds",
            AskUnfinishedTransactions => "AskUnfinishedTransactions",
            AnswerUnfinishedTransactions { .. } => "AnswerUnfinishedTransactions",
            Error { .. } => "Error",
        }
    }
}
