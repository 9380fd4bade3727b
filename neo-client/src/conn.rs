//! One client-side connection: a writer task draining an outgoing queue and
//! a reader task routing answers through the [`Dispatcher`].
//!
//! Callers never touch the socket. They enqueue packets and wait on the
//! oneshot the dispatcher hands them; per-connection FIFO order is preserved
//! by the single writer task.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use neo_common::{Address, NodeId};
use neo_errors::{NeoError, NeoResult};
use neo_protocol::{connect, Message, Packet};

use crate::dispatcher::{Dispatcher, Reply};

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// A request in flight; await [`PendingReply::wait`] for the answer.
#[derive(Debug)]
pub struct PendingReply {
    /// The connection the request went out on.
    pub conn: u64,
    /// Its correlation id.
    pub msg_id: u32,
    rx: oneshot::Receiver<Reply>,
}

impl PendingReply {
    /// Wait for the answer, mapping closures and error packets onto the
    /// error taxonomy.
    pub async fn wait(self) -> NeoResult<Message> {
        match self.rx.await {
            Ok(reply) => reply.into_result(),
            Err(_) => Err(NeoError::ConnectionClosed),
        }
    }

    /// Take the answer if it already arrived; `Ok(None)` while it has not.
    pub fn poll_now(&mut self) -> NeoResult<Option<Message>> {
        match self.rx.try_recv() {
            Ok(reply) => reply.into_result().map(Some),
            Err(oneshot::error::TryRecvError::Empty) => Ok(None),
            Err(oneshot::error::TryRecvError::Closed) => Err(NeoError::ConnectionClosed),
        }
    }
}

/// A live connection to a master or storage node.
#[derive(Debug)]
pub struct ClientConn {
    id: u64,
    peer: Address,
    node: OnceLock<NodeId>,
    // dropped on close so the writer task winds down
    out: Mutex<Option<mpsc::UnboundedSender<Packet>>>,
    next_msg_id: AtomicU32,
    closed: AtomicBool,
    dispatcher: Arc<Dispatcher>,
}

impl ClientConn {
    /// Dial `addr` and spawn the reader and writer tasks. Unsolicited
    /// (non-answer) packets go to `notifications` when given, and are logged
    /// and dropped otherwise. `closed_tx` learns the connection id when the
    /// peer goes away.
    pub async fn open(
        addr: &Address,
        dispatcher: Arc<Dispatcher>,
        notifications: Option<mpsc::UnboundedSender<Message>>,
        closed_tx: Option<mpsc::UnboundedSender<u64>>,
    ) -> NeoResult<Arc<ClientConn>> {
        let stream = connect(addr).await?;
        let (mut sink, mut source) = stream.split();
        let (out, mut out_rx) = mpsc::unbounded_channel::<Packet>();

        let conn = Arc::new(ClientConn {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            peer: addr.clone(),
            node: OnceLock::new(),
            out: Mutex::new(Some(out)),
            next_msg_id: AtomicU32::new(1),
            closed: AtomicBool::new(false),
            dispatcher,
        });

        let writer = {
            let conn = Arc::clone(&conn);
            async move {
                while let Some(packet) = out_rx.recv().await {
                    trace!(conn = conn.id, msg = packet.msg.name(), "send");
                    if let Err(error) = sink.send(packet).await {
                        warn!(conn = conn.id, peer = %conn.peer, %error, "write failed");
                        break;
                    }
                }
            }
        };
        tokio::spawn(writer);

        let reader = {
            let conn = Arc::clone(&conn);
            async move {
                while let Some(result) = source.next().await {
                    let packet = match result {
                        Ok(packet) => packet,
                        Err(error) => {
                            warn!(conn = conn.id, peer = %conn.peer, %error, "read failed");
                            break;
                        }
                    };
                    trace!(conn = conn.id, msg = packet.msg.name(), "recv");
                    if packet.msg.is_answer() {
                        conn.dispatcher.dispatch(conn.id, packet.msg_id, packet.msg);
                    } else if let Some(tx) = &notifications {
                        if tx.send(packet.msg).is_err() {
                            break;
                        }
                    } else {
                        warn!(
                            conn = conn.id,
                            msg = packet.msg.name(),
                            "unsolicited packet on a request-only connection"
                        );
                    }
                }
                conn.close();
                conn.dispatcher.close_connection(conn.id);
                debug!(conn = conn.id, peer = %conn.peer, "connection closed");
                if let Some(tx) = closed_tx {
                    let _ = tx.send(conn.id);
                }
            }
        };
        tokio::spawn(reader);

        Ok(conn)
    }

    /// The connection id, unique within this process.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The dialed address.
    pub fn peer(&self) -> &Address {
        &self.peer
    }

    /// Bind the peer's node identity once identification completes.
    pub fn set_node(&self, node: NodeId) {
        let _ = self.node.set(node);
    }

    /// The peer's node identity, if identified.
    pub fn node(&self) -> Option<NodeId> {
        self.node.get().copied()
    }

    /// Whether the peer is gone.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Send a request and register its waiter.
    pub fn ask(&self, msg: Message) -> NeoResult<PendingReply> {
        let sender = self.sender()?;
        let msg_id = self.next_msg_id.fetch_add(1, Ordering::Relaxed);
        let rx = self.dispatcher.register(self.id, msg_id);
        if sender.send(Packet::new(msg_id, msg)).is_err() {
            self.dispatcher.forget(self.id, msg_id);
            return Err(NeoError::ConnectionClosed);
        }
        Ok(PendingReply {
            conn: self.id,
            msg_id,
            rx,
        })
    }

    /// Send a notification; no answer is expected.
    pub fn notify(&self, msg: Message) -> NeoResult<()> {
        self.sender()?
            .send(Packet::new(0, msg))
            .map_err(|_| NeoError::ConnectionClosed)
    }

    /// Cancel an in-flight request without closing the connection.
    pub fn forget(&self, msg_id: u32) {
        self.dispatcher.forget(self.id, msg_id);
    }

    /// Stop writing and let the peer observe EOF. Pending waiters complete
    /// with `Closed` once the reader winds down.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.out.lock().take();
    }

    fn sender(&self) -> NeoResult<mpsc::UnboundedSender<Packet>> {
        if self.is_closed() {
            return Err(NeoError::ConnectionClosed);
        }
        self.out
            .lock()
            .clone()
            .ok_or(NeoError::ConnectionClosed)
    }
}
