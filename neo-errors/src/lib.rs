//! Error types for the NEO object store.
//!
//! Every fallible API in the workspace returns [`NeoResult`]. The variants
//! mirror the failure classes a caller can meaningfully distinguish: transient
//! per-storage failures that the engine retries on another replica, terminal
//! commit failures, and protocol violations that poison a connection.

use std::io;

use thiserror::Error;

/// Result type alias for all NEO operations.
pub type NeoResult<T> = Result<T, NeoError>;

/// An error produced by the NEO client, master or storage control plane.
#[derive(Debug, Error)]
pub enum NeoError {
    /// Generic storage-level failure: peer mis-reply, unreachable cluster,
    /// empty cell set.
    #[error("storage error: {0}")]
    Storage(String),

    /// The OID or TID is not present at any queried replica.
    #[error("not found: {0}")]
    NotFound(String),

    /// The OID is definitively absent, as opposed to transiently unavailable.
    #[error("object does not exist: {0}")]
    DoesNotExist(String),

    /// Unresolved write-write conflict surfaced during vote.
    #[error("conflict on oid {oid:016x}: committed serial {serial:016x}, base serial {base:016x}")]
    Conflict {
        /// The conflicting object.
        oid: u64,
        /// The committed serial the store collided with.
        serial: u64,
        /// The serial the failed store was based on.
        base: u64,
        /// The payload the transaction tried to store.
        data: Vec<u8>,
    },

    /// The undo target cannot be materialized.
    #[error("cannot undo oid {oid:016x}: {reason}")]
    Undo {
        /// The object blocking the undo.
        oid: u64,
        /// Why the undo cannot proceed.
        reason: String,
    },

    /// A mutating call was issued against a read-only mount.
    #[error("read-only storage")]
    ReadOnly,

    /// API misuse: the transaction handle does not match the active one.
    #[error("operation on a transaction that is not the active one")]
    StorageTransaction,

    /// The peer dropped the connection mid-request. Reads recover by retrying
    /// another replica; writes surface this to the caller.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// The peer answered while still initializing; the caller skips it.
    #[error("node not ready: {0}")]
    NodeNotReady(String),

    /// Wire-format or invariant violation. Fatal for the connection it
    /// occurred on.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Invariant violation inside this process.
    #[error("internal error: {0}")]
    Internal(String),

    /// Transport-level I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl NeoError {
    /// Whether retrying the same request against another replica can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            NeoError::ConnectionClosed | NeoError::NodeNotReady(_) | NeoError::Io(_)
        )
    }
}

/// Return early with [`NeoError::Internal`], formatted like `format!`.
#[macro_export]
macro_rules! internal {
    ($($tt:tt)*) => {
        return Err($crate::internal_err!($($tt)*).into())
    };
}

/// Build a [`NeoError::Internal`] value, formatted like `format!`.
#[macro_export]
macro_rules! internal_err {
    ($($tt:tt)*) => {
        $crate::NeoError::Internal(format!($($tt)*))
    };
}

/// Return early with [`NeoError::Protocol`], formatted like `format!`.
#[macro_export]
macro_rules! protocol_err {
    ($($tt:tt)*) => {
        return Err($crate::NeoError::Protocol(format!($($tt)*)).into())
    };
}

/// Assert an invariant, returning [`NeoError::Internal`] when it does not
/// hold.
#[macro_export]
macro_rules! invariant {
    ($cond:expr, $($tt:tt)*) => {
        if !$cond {
            $crate::internal!($($tt)*);
        }
    };
}

/// Assert that two expressions are equal, returning [`NeoError::Internal`]
/// with both values when they are not.
#[macro_export]
macro_rules! invariant_eq {
    ($a:expr, $b:expr) => {{
        let (a, b) = (&$a, &$b);
        if a != b {
            $crate::internal!(
                "invariant failed: {} == {} ({:?} != {:?})",
                stringify!($a),
                stringify!($b),
                a,
                b
            );
        }
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fails() -> NeoResult<()> {
        invariant!(1 + 1 == 3, "arithmetic broke: {}", 2);
        Ok(())
    }

    #[test]
    fn invariant_returns_internal() {
        match fails() {
            Err(NeoError::Internal(msg)) => assert!(msg.contains("arithmetic broke")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn transient_classification() {
        assert!(NeoError::ConnectionClosed.is_transient());
        assert!(!NeoError::ReadOnly.is_transient());
        assert!(!internal_err!("x").is_transient());
    }
}
