//! The 8-byte identifiers of the object store and the 16-byte node identity.
//!
//! OIDs, TIDs and PTIDs all travel as big-endian `u64`s on the wire and
//! display as 16 hex digits, which is how they appear in every log line.

use std::fmt;

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(transparent)]
        pub struct $name(u64);

        impl $name {
            /// The reserved all-zero identifier.
            pub const ZERO: $name = $name(0);
            /// The greatest representable identifier.
            pub const MAX: $name = $name(u64::MAX);

            /// Wrap a raw value.
            pub const fn new(raw: u64) -> Self {
                $name(raw)
            }

            /// The raw value.
            pub const fn get(self) -> u64 {
                self.0
            }

            /// Big-endian wire form.
            pub const fn to_be_bytes(self) -> [u8; 8] {
                self.0.to_be_bytes()
            }

            /// Parse the big-endian wire form.
            pub const fn from_be_bytes(bytes: [u8; 8]) -> Self {
                $name(u64::from_be_bytes(bytes))
            }

            /// The identifier one past this one.
            pub const fn next(self) -> Self {
                $name(self.0 + 1)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:016x}", self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({:016x})"), self.0)
            }
        }

        impl From<u64> for $name {
            fn from(raw: u64) -> Self {
                $name(raw)
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> u64 {
                id.0
            }
        }
    };
}

id_type! {
    /// An 8-byte object identifier. `Oid::ZERO` is the database root.
    Oid
}

id_type! {
    /// An 8-byte transaction identifier, strictly monotonic across the
    /// cluster lifetime. `Tid::ZERO` sorts before every real TID.
    Tid
}

id_type! {
    /// An 8-byte partition-table version, strictly monotonic.
    Ptid
}

/// The persistent identity of a node: 16 random bytes, stable across
/// reconnects of the same node.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub [u8; 16]);

impl NodeId {
    /// Generate a fresh random identity.
    pub fn random() -> Self {
        NodeId(rand::random())
    }

    /// The wire form.
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_round_trip() {
        let tid = Tid::new(0x0102030405060708);
        assert_eq!(tid.to_be_bytes(), [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(Tid::from_be_bytes(tid.to_be_bytes()), tid);
    }

    #[test]
    fn display_is_zero_padded_hex() {
        assert_eq!(Oid::new(1).to_string(), "0000000000000001");
        assert_eq!(Tid::MAX.to_string(), "ffffffffffffffff");
    }

    #[test]
    fn ordering_matches_raw() {
        assert!(Tid::ZERO < Tid::new(1));
        assert!(Tid::new(1) < Tid::MAX);
    }

    #[test]
    fn node_ids_are_distinct() {
        assert_ne!(NodeId::random(), NodeId::random());
    }
}
