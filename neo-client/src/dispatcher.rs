//! Routes answer packets back to the caller waiting for them.
//!
//! Every outgoing request registers a `(connection, msg_id)` entry before it
//! is sent; the connection's reader task completes the entry when the
//! matching answer arrives. Closing a connection completes every entry it
//! still owns with [`Reply::Closed`]. A reply is a sum, never a sentinel
//! packet.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use neo_errors::{NeoError, NeoResult};
use neo_protocol::{ErrorCode, Message};

/// What a waiter receives.
#[derive(Debug)]
pub enum Reply {
    /// The matching answer packet.
    Answer(Message),
    /// The connection closed before the answer arrived.
    Closed,
}

impl Reply {
    /// Unwrap the answer, mapping `Closed` and error packets onto the error
    /// taxonomy.
    pub fn into_result(self) -> NeoResult<Message> {
        match self {
            Reply::Closed => Err(NeoError::ConnectionClosed),
            Reply::Answer(Message::Error { code, message }) => Err(match code {
                ErrorCode::NotReady => NeoError::NodeNotReady(message),
                ErrorCode::OidNotFound | ErrorCode::TidNotFound => NeoError::NotFound(message),
                ErrorCode::OidDoesNotExist => NeoError::DoesNotExist(message),
                ErrorCode::ReadOnly => NeoError::ReadOnly,
                ErrorCode::ProtocolError => NeoError::Protocol(message),
                ErrorCode::Internal => NeoError::Storage(message),
            }),
            Reply::Answer(msg) => Ok(msg),
        }
    }
}

/// The registry of waiters, shared by every client connection.
#[derive(Debug, Default)]
pub struct Dispatcher {
    pending: Mutex<HashMap<(u64, u32), oneshot::Sender<Reply>>>,
}

impl Dispatcher {
    /// An empty dispatcher.
    pub fn new() -> Self {
        Dispatcher::default()
    }

    /// Register a waiter for `(conn, msg_id)`. Must happen before the
    /// request is sent, or a fast answer races the registration.
    pub fn register(&self, conn: u64, msg_id: u32) -> oneshot::Receiver<Reply> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert((conn, msg_id), tx);
        rx
    }

    /// Route an answer to its waiter. Answers nobody waits for (forgotten
    /// after a timeout) are dropped.
    pub fn dispatch(&self, conn: u64, msg_id: u32, msg: Message) {
        match self.pending.lock().remove(&(conn, msg_id)) {
            Some(tx) => {
                // the waiter may have given up between lookup and send
                let _ = tx.send(Reply::Answer(msg));
            }
            None => debug!(conn, msg_id, "dropping answer nobody waits for"),
        }
    }

    /// Cancel a waiter without closing the connection; a late answer will be
    /// dropped by [`Dispatcher::dispatch`].
    pub fn forget(&self, conn: u64, msg_id: u32) {
        self.pending.lock().remove(&(conn, msg_id));
    }

    /// Complete every waiter of `conn` with [`Reply::Closed`].
    pub fn close_connection(&self, conn: u64) {
        let mut pending = self.pending.lock();
        let keys: Vec<_> = pending
            .keys()
            .filter(|(c, _)| *c == conn)
            .copied()
            .collect();
        for key in keys {
            if let Some(tx) = pending.remove(&key) {
                let _ = tx.send(Reply::Closed);
            }
        }
    }

    /// Whether `conn` still has registered waiters. Used by the pool to keep
    /// busy connections out of eviction.
    pub fn has_waiters(&self, conn: u64) -> bool {
        self.pending.lock().keys().any(|(c, _)| *c == conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use neo_common::Tid;

    #[test]
    fn dispatch_reaches_the_registered_waiter() {
        let d = Dispatcher::new();
        let mut rx = d.register(1, 7);
        d.dispatch(1, 7, Message::AnswerBeginTransaction { tid: Tid::new(3) });
        match rx.try_recv().unwrap() {
            Reply::Answer(Message::AnswerBeginTransaction { tid }) => {
                assert_eq!(tid, Tid::new(3))
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(!d.has_waiters(1));
    }

    #[test]
    fn forgotten_waiters_never_complete() {
        let d = Dispatcher::new();
        let mut rx = d.register(1, 7);
        d.forget(1, 7);
        d.dispatch(1, 7, Message::AnswerNodeInformation);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn close_completes_only_that_connection() {
        let d = Dispatcher::new();
        let mut a = d.register(1, 1);
        let mut b = d.register(2, 1);
        d.close_connection(1);
        assert!(matches!(a.try_recv().unwrap(), Reply::Closed));
        assert!(b.try_recv().is_err());
        assert!(d.has_waiters(2));
    }

    #[test]
    fn error_packets_map_onto_the_taxonomy() {
        let reply = Reply::Answer(Message::Error {
            code: ErrorCode::NotReady,
            message: "starting".into(),
        });
        assert!(matches!(reply.into_result(), Err(NeoError::NodeNotReady(_))));
        assert!(matches!(
            Reply::Closed.into_result(),
            Err(NeoError::ConnectionClosed)
        ));
    }
}
