//! Node, object and instance identifiers.
//!
//! Node and object identifiers are 128-bit random values (UUID v4); the zero
//! value is reserved as "none" and, in handshake replies, "refused".
//! Instance identifiers are node-local 32-bit counters with a handful of
//! reserved values at the top of the range.

use std::fmt;

use bytes::BufMut;
use uuid::Uuid;

use crate::error::Result;
use crate::wire::{WireDecode, WireEncode};

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub u128);

        impl $name {
            /// The reserved all-zero identifier.
            pub const ZERO: Self = Self(0);

            /// Generate a fresh random identifier.
            pub fn generate() -> Self {
                Self(Uuid::new_v4().as_u128())
            }

            /// Whether this identifier was generated (is not [`Self::ZERO`]).
            pub fn is_generated(self) -> bool {
                self.0 != 0
            }

            /// Raw 128-bit value.
            pub fn as_u128(self) -> u128 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", Uuid::from_u128(self.0).hyphenated())
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid.as_u128())
            }
        }

        impl WireEncode for $name {
            fn encode<B: BufMut>(&self, buf: &mut B) {
                self.0.encode(buf);
            }
        }

        impl WireDecode for $name {
            fn decode(buf: &mut &[u8]) -> Result<Self> {
                u128::decode(buf).map(Self)
            }
        }
    };
}

uuid_id! {
    /// Identity of a node (process) in the network.
    NodeId
}

uuid_id! {
    /// Globally unique identity of a distributed object.
    ObjectId
}

/// Node-local identifier of one attachment of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(pub u32);

impl InstanceId {
    /// Largest identifier handed out to a concrete attachment.
    pub const MAX: Self = Self(u32::MAX - 3);
    /// Deliver only if a local instance exists; used for cache feeding.
    pub const NONE: Self = Self(u32::MAX - 2);
    /// Deliver to every local instance of the object.
    pub const ALL: Self = Self(u32::MAX - 1);
    /// The object is not attached.
    pub const INVALID: Self = Self(u32::MAX);

    /// Whether this names one concrete attachment.
    pub fn is_concrete(self) -> bool {
        self <= Self::MAX
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::NONE => f.write_str("NONE"),
            Self::ALL => f.write_str("ALL"),
            Self::INVALID => f.write_str("INVALID"),
            Self(id) => write!(f, "{id}"),
        }
    }
}

impl WireEncode for InstanceId {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        self.0.encode(buf);
    }
}

impl WireDecode for InstanceId {
    fn decode(buf: &mut &[u8]) -> Result<Self> {
        u32::decode(buf).map(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_distinct() {
        let a = NodeId::generate();
        let b = NodeId::generate();
        assert_ne!(a, b);
        assert!(a.is_generated());
        assert!(!NodeId::ZERO.is_generated());
    }

    #[test]
    fn test_display_is_hyphenated_uuid() {
        let id = ObjectId(0x0123_4567_89ab_cdef_0123_4567_89ab_cdef);
        assert_eq!(id.to_string(), "01234567-89ab-cdef-0123-456789abcdef");
    }

    #[test]
    fn test_instance_sentinels() {
        assert!(InstanceId(0).is_concrete());
        assert!(InstanceId::MAX.is_concrete());
        assert!(!InstanceId::NONE.is_concrete());
        assert!(!InstanceId::ALL.is_concrete());
        assert!(!InstanceId::INVALID.is_concrete());
        assert_eq!(InstanceId::default(), InstanceId::INVALID);
        assert_eq!(InstanceId::ALL.to_string(), "ALL");
    }
}
