//! Framing and body (de)serialization.
//!
//! All integers are big-endian. Byte strings and strings carry a `u32`
//! length prefix. Optional identifiers use reserved sentinel values: an
//! all-ones u64 for TIDs/OIDs, an all-zero identity for node ids, an empty
//! host with port zero for addresses, and an all-ones u32 for partition
//! indexes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use neo_common::{Address, CellState, NodeId, NodeInfo, NodeState, NodeType, Oid, Ptid, Tid};
use neo_errors::{protocol_err, NeoError, NeoResult};

use crate::message::{ErrorCode, LockState, Message, PartitionRow, TransactionInfo};
use crate::{Packet, HEADER_LEN, RESPONSE_MASK};

/// Refuse frames larger than this; a peer announcing more is broken.
pub const MAX_PACKET_SIZE: usize = 64 << 20;

const NONE_U64: u64 = u64::MAX;
const NONE_U32: u32 = u32::MAX;
const NONE_NODE_ID: [u8; 16] = [0; 16];

/// Codec implementing the `msg_id | code | length | body` frame.
#[derive(Debug, Default)]
pub struct NeoCodec;

impl Encoder<Packet> for NeoCodec {
    type Error = NeoError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> NeoResult<()> {
        let start = dst.len();
        dst.reserve(HEADER_LEN);
        dst.put_u32(packet.msg_id);
        dst.put_u16(packet.msg.code());
        dst.put_u32(0); // patched below
        let body_start = dst.len();
        encode_body(&packet.msg, dst);
        let body_len = dst.len() - body_start;
        if body_len > MAX_PACKET_SIZE {
            protocol_err!("outgoing {} packet of {body_len} bytes", packet.msg.name());
        }
        dst[start + 6..start + 10].copy_from_slice(&(body_len as u32).to_be_bytes());
        Ok(())
    }
}

impl Decoder for NeoCodec {
    type Item = Packet;
    type Error = NeoError;

    fn decode(&mut self, src: &mut BytesMut) -> NeoResult<Option<Packet>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let body_len = u32::from_be_bytes([src[6], src[7], src[8], src[9]]) as usize;
        if body_len > MAX_PACKET_SIZE {
            protocol_err!("incoming packet announces {body_len} bytes");
        }
        let frame_len = HEADER_LEN + body_len;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }
        let mut frame = src.split_to(frame_len).freeze();
        let msg_id = frame.get_u32();
        let code = frame.get_u16();
        let _announced = frame.get_u32();
        let msg = decode_body(code, &mut frame)?;
        if frame.has_remaining() {
            protocol_err!(
                "{} bytes trailing a {} packet",
                frame.remaining(),
                msg.name()
            );
        }
        Ok(Some(Packet { msg_id, msg }))
    }
}

// --- body writers ----------------------------------------------------------

fn put_bytes(dst: &mut BytesMut, data: &[u8]) {
    dst.put_u32(data.len() as u32);
    dst.put_slice(data);
}

fn put_str(dst: &mut BytesMut, s: &str) {
    put_bytes(dst, s.as_bytes());
}

fn put_opt_tid(dst: &mut BytesMut, tid: Option<Tid>) {
    dst.put_u64(tid.map(Tid::get).unwrap_or(NONE_U64));
}

fn put_node_id(dst: &mut BytesMut, id: NodeId) {
    dst.put_slice(id.as_bytes());
}

fn put_opt_node_id(dst: &mut BytesMut, id: Option<NodeId>) {
    dst.put_slice(id.map(|i| i.0).unwrap_or(NONE_NODE_ID).as_slice());
}

fn put_addr(dst: &mut BytesMut, addr: &Address) {
    put_str(dst, &addr.host);
    dst.put_u16(addr.port);
}

fn put_opt_addr(dst: &mut BytesMut, addr: Option<&Address>) {
    match addr {
        Some(addr) => put_addr(dst, addr),
        None => {
            put_str(dst, "");
            dst.put_u16(0);
        }
    }
}

fn put_oids(dst: &mut BytesMut, oids: &[Oid]) {
    dst.put_u32(oids.len() as u32);
    for oid in oids {
        dst.put_u64(oid.get());
    }
}

fn put_tids(dst: &mut BytesMut, tids: &[Tid]) {
    dst.put_u32(tids.len() as u32);
    for tid in tids {
        dst.put_u64(tid.get());
    }
}

fn put_rows(dst: &mut BytesMut, rows: &[PartitionRow]) {
    dst.put_u32(rows.len() as u32);
    for (offset, cells) in rows {
        dst.put_u32(*offset);
        dst.put_u32(cells.len() as u32);
        for (node, state) in cells {
            put_node_id(dst, *node);
            dst.put_u8(state.code());
        }
    }
}

fn encode_body(msg: &Message, dst: &mut BytesMut) {
    use Message::*;
    match msg {
        RequestIdentification {
            node_type,
            id,
            addr,
            cluster,
        } => {
            dst.put_u8(node_type.code());
            put_opt_node_id(dst, *id);
            put_opt_addr(dst, addr.as_ref());
            put_str(dst, cluster);
        }
        AcceptIdentification {
            node_type,
            id,
            num_partitions,
            num_replicas,
            your_id,
            primary,
        } => {
            dst.put_u8(node_type.code());
            put_node_id(dst, *id);
            dst.put_u32(*num_partitions);
            dst.put_u32(*num_replicas);
            put_node_id(dst, *your_id);
            put_opt_addr(dst, primary.as_ref());
        }
        AskPrimary | AskNodeInformation | AnswerNodeInformation | AskPartitionTable
        | StartOperation | StopOperation | AskLastIds | AskUnfinishedTransactions => {}
        AnswerPrimary { primary } => put_addr(dst, primary),
        AnswerPartitionTable { ptid, rows } | SendPartitionTable { ptid, rows } => {
            dst.put_u64(ptid.get());
            put_rows(dst, rows);
        }
        AskBeginTransaction { tid } => put_opt_tid(dst, *tid),
        AnswerBeginTransaction { tid }
        | AnswerStoreTransaction { tid }
        | AnswerTransactionFinished { tid }
        | AbortTransaction { tid }
        | LockInformation { tid }
        | AnswerInformationLocked { tid }
        | NotifyUnlockInformation { tid }
        | AskTransactionInformation { tid } => dst.put_u64(tid.get()),
        AskNewOids { count } => dst.put_u32(*count),
        AnswerNewOids { oids } => put_oids(dst, oids),
        AskStoreObject {
            oid,
            serial,
            compression,
            checksum,
            data,
            tid,
        } => {
            dst.put_u64(oid.get());
            dst.put_u64(serial.get());
            dst.put_u8(*compression);
            dst.put_slice(checksum);
            put_bytes(dst, data);
            dst.put_u64(tid.get());
        }
        AnswerStoreObject {
            conflict,
            oid,
            serial,
        } => {
            dst.put_u64(conflict.get());
            dst.put_u64(oid.get());
            dst.put_u64(serial.get());
        }
        AskStoreTransaction {
            tid,
            user,
            description,
            extension,
            oids,
        } => {
            dst.put_u64(tid.get());
            put_str(dst, user);
            put_str(dst, description);
            put_bytes(dst, extension);
            put_oids(dst, oids);
        }
        AskFinishTransaction { tid, oids } => {
            dst.put_u64(tid.get());
            put_oids(dst, oids);
        }
        AskHasLock { tid, oid } => {
            dst.put_u64(tid.get());
            dst.put_u64(oid.get());
        }
        AnswerHasLock { oid, state } => {
            dst.put_u64(oid.get());
            dst.put_u8(state.code());
        }
        NotifyLastOid { oid } => dst.put_u64(oid.get()),
        InvalidateObjects { tid, oids } => {
            dst.put_u64(tid.get());
            put_oids(dst, oids);
        }
        NotifyNodeInformation { nodes } => {
            dst.put_u32(nodes.len() as u32);
            for info in nodes {
                dst.put_u8(info.node_type.code());
                put_opt_addr(dst, info.addr.as_ref());
                put_node_id(dst, info.id);
                dst.put_u8(info.state.code());
            }
        }
        NotifyPartitionChanges { ptid, changes } => {
            dst.put_u64(ptid.get());
            dst.put_u32(changes.len() as u32);
            for (offset, node, state) in changes {
                dst.put_u32(*offset);
                put_node_id(dst, *node);
                dst.put_u8(state.code());
            }
        }
        AskObject { oid, serial, tid } => {
            dst.put_u64(oid.get());
            put_opt_tid(dst, *serial);
            put_opt_tid(dst, *tid);
        }
        AnswerObject {
            oid,
            serial,
            next_serial,
            compression,
            checksum,
            data,
        } => {
            dst.put_u64(oid.get());
            dst.put_u64(serial.get());
            put_opt_tid(dst, *next_serial);
            dst.put_u8(*compression);
            dst.put_slice(checksum);
            put_bytes(dst, data);
        }
        AskObjectHistory { oid, first, last } => {
            dst.put_u64(oid.get());
            dst.put_u64(*first);
            dst.put_u64(*last);
        }
        AnswerObjectHistory { oid, history } => {
            dst.put_u64(oid.get());
            dst.put_u32(history.len() as u32);
            for (serial, size) in history {
                dst.put_u64(serial.get());
                dst.put_u32(*size);
            }
        }
        AskTids {
            first,
            last,
            partition,
        } => {
            dst.put_u64(*first);
            dst.put_u64(*last);
            dst.put_u32(partition.unwrap_or(NONE_U32));
        }
        AnswerTids { tids } | AnswerUnfinishedTransactions { tids } => put_tids(dst, tids),
        AnswerTransactionInformation(info) => {
            dst.put_u64(info.tid.get());
            put_str(dst, &info.user);
            put_str(dst, &info.description);
            put_bytes(dst, &info.extension);
            put_oids(dst, &info.oids);
        }
        AskUndoTransaction { tid, undone_tid } => {
            dst.put_u64(tid.get());
            dst.put_u64(undone_tid.get());
        }
        AnswerUndoTransaction {
            conflict_oids,
            error_oids,
        } => {
            put_oids(dst, conflict_oids);
            put_oids(dst, error_oids);
        }
        AnswerLastIds { loid, ltid, lptid } => {
            dst.put_u64(loid.get());
            dst.put_u64(ltid.get());
            dst.put_u64(lptid.get());
        }
        Error { code, message } => {
            dst.put_u8(code.code());
            put_str(dst, message);
        }
    }
}

// --- body readers ----------------------------------------------------------

fn need(src: &Bytes, n: usize) -> NeoResult<()> {
    if src.remaining() < n {
        protocol_err!("truncated packet body: need {n} bytes, have {}", src.remaining());
    }
    Ok(())
}

fn get_u8(src: &mut Bytes) -> NeoResult<u8> {
    need(src, 1)?;
    Ok(src.get_u8())
}

fn get_u16(src: &mut Bytes) -> NeoResult<u16> {
    need(src, 2)?;
    Ok(src.get_u16())
}

fn get_u32(src: &mut Bytes) -> NeoResult<u32> {
    need(src, 4)?;
    Ok(src.get_u32())
}

fn get_u64(src: &mut Bytes) -> NeoResult<u64> {
    need(src, 8)?;
    Ok(src.get_u64())
}

fn get_bytes(src: &mut Bytes) -> NeoResult<Bytes> {
    let len = get_u32(src)? as usize;
    need(src, len)?;
    Ok(src.split_to(len))
}

fn get_str(src: &mut Bytes) -> NeoResult<String> {
    let raw = get_bytes(src)?;
    String::from_utf8(raw.to_vec()).map_err(|e| NeoError::Protocol(format!("bad utf-8: {e}")))
}

fn get_oid(src: &mut Bytes) -> NeoResult<Oid> {
    Ok(Oid::new(get_u64(src)?))
}

fn get_tid(src: &mut Bytes) -> NeoResult<Tid> {
    Ok(Tid::new(get_u64(src)?))
}

fn get_opt_tid(src: &mut Bytes) -> NeoResult<Option<Tid>> {
    let raw = get_u64(src)?;
    Ok((raw != NONE_U64).then(|| Tid::new(raw)))
}

fn get_node_id(src: &mut Bytes) -> NeoResult<NodeId> {
    need(src, 16)?;
    let mut raw = [0; 16];
    src.copy_to_slice(&mut raw);
    Ok(NodeId(raw))
}

fn get_opt_node_id(src: &mut Bytes) -> NeoResult<Option<NodeId>> {
    let id = get_node_id(src)?;
    Ok((id.0 != NONE_NODE_ID).then_some(id))
}

fn get_checksum(src: &mut Bytes) -> NeoResult<[u8; 20]> {
    need(src, 20)?;
    let mut raw = [0; 20];
    src.copy_to_slice(&mut raw);
    Ok(raw)
}

fn get_opt_addr(src: &mut Bytes) -> NeoResult<Option<Address>> {
    let host = get_str(src)?;
    let port = get_u16(src)?;
    Ok((!host.is_empty() || port != 0).then(|| Address::new(host, port)))
}

fn get_addr(src: &mut Bytes) -> NeoResult<Address> {
    match get_opt_addr(src)? {
        Some(addr) => Ok(addr),
        None => protocol_err!("empty address where one is required"),
    }
}

fn get_count(src: &mut Bytes, elem_size: usize) -> NeoResult<usize> {
    let count = get_u32(src)? as usize;
    // cheap sanity bound before allocating
    need(src, count.saturating_mul(elem_size))?;
    Ok(count)
}

fn get_oids(src: &mut Bytes) -> NeoResult<Vec<Oid>> {
    let count = get_count(src, 8)?;
    (0..count).map(|_| get_oid(src)).collect()
}

fn get_tids(src: &mut Bytes) -> NeoResult<Vec<Tid>> {
    let count = get_count(src, 8)?;
    (0..count).map(|_| get_tid(src)).collect()
}

fn get_cell_state(src: &mut Bytes) -> NeoResult<CellState> {
    let code = get_u8(src)?;
    match CellState::from_code(code) {
        Some(state) => Ok(state),
        None => protocol_err!("unknown cell state {code}"),
    }
}

fn get_rows(src: &mut Bytes) -> NeoResult<Vec<PartitionRow>> {
    let count = get_count(src, 8)?;
    let mut rows = Vec::with_capacity(count);
    for _ in 0..count {
        let offset = get_u32(src)?;
        let cells = get_count(src, 17)?;
        let mut row = Vec::with_capacity(cells);
        for _ in 0..cells {
            let node = get_node_id(src)?;
            let state = get_cell_state(src)?;
            row.push((node, state));
        }
        rows.push((offset, row));
    }
    Ok(rows)
}

fn decode_body(code: u16, src: &mut Bytes) -> NeoResult<Message> {
    use Message::*;
    Ok(match code {
        c if c == RESPONSE_MASK => {
            let raw = get_u8(src)?;
            let Some(code) = ErrorCode::from_code(raw) else {
                protocol_err!("unknown error code {raw}");
            };
            Error {
                code,
                message: get_str(src)?,
            }
        }
        1 => {
            let raw = get_u8(src)?;
            let Some(node_type) = NodeType::from_code(raw) else {
                protocol_err!("unknown node type {raw}");
            };
            RequestIdentification {
                node_type,
                id: get_opt_node_id(src)?,
                addr: get_opt_addr(src)?,
                cluster: get_str(src)?,
            }
        }
        0x8001 => {
            let raw = get_u8(src)?;
            let Some(node_type) = NodeType::from_code(raw) else {
                protocol_err!("unknown node type {raw}");
            };
            AcceptIdentification {
                node_type,
                id: get_node_id(src)?,
                num_partitions: get_u32(src)?,
                num_replicas: get_u32(src)?,
                your_id: get_node_id(src)?,
                primary: get_opt_addr(src)?,
            }
        }
        2 => AskPrimary,
        0x8002 => AnswerPrimary {
            primary: get_addr(src)?,
        },
        3 => AskNodeInformation,
        0x8003 => AnswerNodeInformation,
        4 => AskPartitionTable,
        0x8004 => AnswerPartitionTable {
            ptid: Ptid::new(get_u64(src)?),
            rows: get_rows(src)?,
        },
        5 => AskBeginTransaction {
            tid: get_opt_tid(src)?,
        },
        0x8005 => AnswerBeginTransaction {
            tid: get_tid(src)?,
        },
        6 => AskNewOids {
            count: get_u32(src)?,
        },
        0x8006 => AnswerNewOids {
            oids: get_oids(src)?,
        },
        7 => AskStoreObject {
            oid: get_oid(src)?,
            serial: get_tid(src)?,
            compression: get_u8(src)?,
            checksum: get_checksum(src)?,
            data: get_bytes(src)?,
            tid: get_tid(src)?,
        },
        0x8007 => AnswerStoreObject {
            conflict: get_tid(src)?,
            oid: get_oid(src)?,
            serial: get_tid(src)?,
        },
        8 => AskStoreTransaction {
            tid: get_tid(src)?,
            user: get_str(src)?,
            description: get_str(src)?,
            extension: get_bytes(src)?,
            oids: get_oids(src)?,
        },
        0x8008 => AnswerStoreTransaction {
            tid: get_tid(src)?,
        },
        9 => AskFinishTransaction {
            tid: get_tid(src)?,
            oids: get_oids(src)?,
        },
        0x8009 => AnswerTransactionFinished {
            tid: get_tid(src)?,
        },
        10 => AbortTransaction {
            tid: get_tid(src)?,
        },
        11 => AskHasLock {
            tid: get_tid(src)?,
            oid: get_oid(src)?,
        },
        0x800b => {
            let oid = get_oid(src)?;
            let raw = get_u8(src)?;
            let Some(state) = LockState::from_code(raw) else {
                protocol_err!("unknown lock state {raw}");
            };
            AnswerHasLock { oid, state }
        }
        12 => LockInformation {
            tid: get_tid(src)?,
        },
        0x800c => AnswerInformationLocked {
            tid: get_tid(src)?,
        },
        13 => NotifyUnlockInformation {
            tid: get_tid(src)?,
        },
        14 => StartOperation,
        15 => StopOperation,
        16 => NotifyLastOid {
            oid: get_oid(src)?,
        },
        17 => InvalidateObjects {
            tid: get_tid(src)?,
            oids: get_oids(src)?,
        },
        18 => {
            let count = get_count(src, 24)?;
            let mut nodes = Vec::with_capacity(count);
            for _ in 0..count {
                let raw = get_u8(src)?;
                let Some(node_type) = NodeType::from_code(raw) else {
                    protocol_err!("unknown node type {raw}");
                };
                let addr = get_opt_addr(src)?;
                let id = get_node_id(src)?;
                let raw = get_u8(src)?;
                let Some(state) = NodeState::from_code(raw) else {
                    protocol_err!("unknown node state {raw}");
                };
                nodes.push(NodeInfo {
                    node_type,
                    addr,
                    id,
                    state,
                });
            }
            NotifyNodeInformation { nodes }
        }
        19 => {
            let ptid = Ptid::new(get_u64(src)?);
            let count = get_count(src, 21)?;
            let mut changes = Vec::with_capacity(count);
            for _ in 0..count {
                let offset = get_u32(src)?;
                let node = get_node_id(src)?;
                let state = get_cell_state(src)?;
                changes.push((offset, node, state));
            }
            NotifyPartitionChanges { ptid, changes }
        }
        20 => SendPartitionTable {
            ptid: Ptid::new(get_u64(src)?),
            rows: get_rows(src)?,
        },
        21 => AskObject {
            oid: get_oid(src)?,
            serial: get_opt_tid(src)?,
            tid: get_opt_tid(src)?,
        },
        0x8015 => AnswerObject {
            oid: get_oid(src)?,
            serial: get_tid(src)?,
            next_serial: get_opt_tid(src)?,
            compression: get_u8(src)?,
            checksum: get_checksum(src)?,
            data: get_bytes(src)?,
        },
        22 => AskObjectHistory {
            oid: get_oid(src)?,
            first: get_u64(src)?,
            last: get_u64(src)?,
        },
        0x8016 => {
            let oid = get_oid(src)?;
            let count = get_count(src, 12)?;
            let mut history = Vec::with_capacity(count);
            for _ in 0..count {
                let serial = get_tid(src)?;
                let size = get_u32(src)?;
                history.push((serial, size));
            }
            AnswerObjectHistory { oid, history }
        }
        23 => {
            let first = get_u64(src)?;
            let last = get_u64(src)?;
            let raw = get_u32(src)?;
            AskTids {
                first,
                last,
                partition: (raw != NONE_U32).then_some(raw),
            }
        }
        0x8017 => AnswerTids {
            tids: get_tids(src)?,
        },
        24 => AskTransactionInformation {
            tid: get_tid(src)?,
        },
        0x8018 => AnswerTransactionInformation(TransactionInfo {
            tid: get_tid(src)?,
            user: get_str(src)?,
            description: get_str(src)?,
            extension: get_bytes(src)?,
            oids: get_oids(src)?,
        }),
        25 => AskUndoTransaction {
            tid: get_tid(src)?,
            undone_tid: get_tid(src)?,
        },
        0x8019 => AnswerUndoTransaction {
            conflict_oids: get_oids(src)?,
            error_oids: get_oids(src)?,
        },
        26 => AskLastIds,
        0x801a => AnswerLastIds {
            loid: get_oid(src)?,
            ltid: get_tid(src)?,
            lptid: Ptid::new(get_u64(src)?),
        },
        27 => AskUnfinishedTransactions,
        0x801b => AnswerUnfinishedTransactions {
            tids: get_tids(src)?,
        },
        other => protocol_err!("unknown packet code {other:#06x}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: Message) -> Packet {
        let mut codec = NeoCodec;
        let mut buf = BytesMut::new();
        let sent = Packet::new(42, msg);
        codec.encode(sent.clone(), &mut buf).unwrap();
        let got = codec.decode(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty());
        assert_eq!(got, sent);
        got
    }

    #[test]
    fn store_object_round_trip() {
        round_trip(Message::AskStoreObject {
            oid: Oid::new(1),
            serial: Tid::ZERO,
            compression: 1,
            checksum: [7; 20],
            data: Bytes::from_static(b"hello"),
            tid: Tid::new(9),
        });
    }

    #[test]
    fn identification_round_trip_with_options() {
        round_trip(Message::RequestIdentification {
            node_type: NodeType::Client,
            id: None,
            addr: None,
            cluster: "main".into(),
        });
        round_trip(Message::AcceptIdentification {
            node_type: NodeType::Storage,
            id: NodeId::random(),
            num_partitions: 12,
            num_replicas: 1,
            your_id: NodeId::random(),
            primary: Some(Address::new("127.0.0.1", 10100)),
        });
    }

    #[test]
    fn partition_table_round_trip() {
        let node = NodeId::random();
        round_trip(Message::AnswerPartitionTable {
            ptid: Ptid::new(3),
            rows: vec![
                (0, vec![(node, CellState::UpToDate)]),
                (1, vec![(node, CellState::Feeding), (node, CellState::OutOfDate)]),
            ],
        });
    }

    #[test]
    fn object_answer_round_trip_with_none_next_serial() {
        round_trip(Message::AnswerObject {
            oid: Oid::new(5),
            serial: Tid::new(2),
            next_serial: None,
            compression: 0,
            checksum: [0; 20],
            data: Bytes::new(),
        });
    }

    #[test]
    fn answer_bit_matches_variant() {
        assert!(Message::AnswerBeginTransaction { tid: Tid::new(1) }.is_answer());
        assert!(!Message::AskBeginTransaction { tid: None }.is_answer());
        assert!(Message::Error {
            code: ErrorCode::NotReady,
            message: String::new(),
        }
        .is_answer());
    }

    #[test]
    fn partial_frames_wait_for_more_input() {
        let mut codec = NeoCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(
                Packet::new(1, Message::AskBeginTransaction { tid: None }),
                &mut buf,
            )
            .unwrap();
        let full = buf.clone();
        let mut partial = BytesMut::from(&full[..full.len() - 3]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&full[full.len() - 3..]);
        assert!(codec.decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn unknown_code_is_a_protocol_error() {
        let mut codec = NeoCodec;
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u16(0x7fff);
        buf.put_u32(0);
        match codec.decode(&mut buf) {
            Err(NeoError::Protocol(_)) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn truncated_body_is_a_protocol_error() {
        let mut codec = NeoCodec;
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u16(5); // AskBeginTransaction wants 8 body bytes
        buf.put_u32(4);
        buf.put_u32(0xdead);
        match codec.decode(&mut buf) {
            Err(NeoError::Protocol(_)) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn oversized_announcement_is_refused() {
        let mut codec = NeoCodec;
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u16(7);
        buf.put_u32((MAX_PACKET_SIZE + 1) as u32);
        assert!(codec.decode(&mut buf).is_err());
    }
}
