//! The NEO wire protocol.
//!
//! Every packet is framed as `msg_id: u32 | code: u16 | length: u32 | body`,
//! big-endian. The high bit of the code distinguishes answers from requests
//! and notifications; a request and its answer share the same `msg_id`.
//! Bodies are code-specific tuples of primitive fields, hand-coded in
//! [`codec`].

mod codec;
mod message;

pub use codec::{NeoCodec, MAX_PACKET_SIZE};
pub use message::{ErrorCode, LockState, Message, TransactionInfo};

use neo_common::Address;
use neo_errors::NeoResult;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

/// Set on the code of every answer packet.
pub const RESPONSE_MASK: u16 = 0x8000;

/// Frame header length: msg_id (4) + code (2) + body length (4).
pub const HEADER_LEN: usize = 10;

/// One framed packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    /// Request/answer correlation id, scoped to one connection.
    pub msg_id: u32,
    /// The decoded body.
    pub msg: Message,
}

impl Packet {
    /// Pair a message with its correlation id.
    pub fn new(msg_id: u32, msg: Message) -> Self {
        Packet { msg_id, msg }
    }
}

/// A framed TCP connection speaking the NEO protocol.
pub type NeoStream = Framed<TcpStream, NeoCodec>;

/// Dial `addr` and frame the stream with the NEO codec.
pub async fn connect(addr: &Address) -> NeoResult<NeoStream> {
    let stream = TcpStream::connect((addr.host.as_str(), addr.port)).await?;
    stream.set_nodelay(true)?;
    Ok(Framed::new(stream, NeoCodec::default()))
}

/// Frame an accepted stream with the NEO codec.
pub fn framed(stream: TcpStream) -> NeoStream {
    let _ = stream.set_nodelay(true);
    Framed::new(stream, NeoCodec::default())
}
