//! 128-bit object versions.
//!
//! The low half counts commits on the master; the high half is zero for
//! master versions. A small band at the very top of the range is reserved for
//! sentinels that are requests rather than versions (`NEXT`, `HEAD`, ...).

use std::fmt;

use bytes::BufMut;

use crate::error::Result;
use crate::id::ObjectId;
use crate::wire::{WireDecode, WireEncode};

/// A version of a distributed object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Version {
    /// High 64 bits; zero for master-assigned versions.
    pub high: u64,
    /// Low 64 bits; the commit counter.
    pub low: u64,
}

impl Version {
    /// Unset / no version.
    pub const NONE: Self = Self::new(0, 0);
    /// The first committed version of a master.
    pub const FIRST: Self = Self::new(0, 1);
    /// Sync request: advance by exactly one version.
    pub const NEXT: Self = Self::new(u64::MAX, u64::MAX - 1);
    /// Invalid version.
    pub const INVALID: Self = Self::new(u64::MAX, u64::MAX - 2);
    /// Map request: the oldest version the master still retains.
    pub const OLDEST: Self = Self::new(u64::MAX, u64::MAX - 3);
    /// Sync request: the latest version received so far.
    pub const HEAD: Self = Self::new(u64::MAX, u64::MAX - 4);

    /// Build a version from its two halves.
    pub const fn new(high: u64, low: u64) -> Self {
        Self { high, low }
    }

    /// Build a master version from its commit counter.
    pub const fn from_low(low: u64) -> Self {
        Self { high: 0, low }
    }

    /// Whether this is one of the reserved request values.
    pub fn is_sentinel(self) -> bool {
        self.high == u64::MAX && self.low >= u64::MAX - 4
    }

    /// The following version, carrying into the high half.
    pub fn next(self) -> Self {
        match self.low.checked_add(1) {
            Some(low) => Self::new(self.high, low),
            None => Self::new(self.high.wrapping_add(1), 0),
        }
    }

    /// The preceding version, borrowing from the high half.
    pub fn prev(self) -> Self {
        match self.low.checked_sub(1) {
            Some(low) => Self::new(self.high, low),
            None => Self::new(self.high.wrapping_sub(1), u64::MAX),
        }
    }

    /// Full 128-bit value.
    pub fn as_u128(self) -> u128 {
        (u128::from(self.high) << 64) | u128::from(self.low)
    }
}

impl From<u64> for Version {
    fn from(low: u64) -> Self {
        Self::from_low(low)
    }
}

impl From<u128> for Version {
    fn from(value: u128) -> Self {
        Self::new((value >> 64) as u64, value as u64)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::NONE => f.write_str("NONE"),
            Self::NEXT => f.write_str("NEXT"),
            Self::INVALID => f.write_str("INVALID"),
            Self::OLDEST => f.write_str("OLDEST"),
            Self::HEAD => f.write_str("HEAD"),
            Self { high: 0, low } => write!(f, "{low}"),
            Self { high, low } => write!(f, "{high:x}:{low:x}"),
        }
    }
}

impl WireEncode for Version {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        self.high.encode(buf);
        self.low.encode(buf);
    }
}

impl WireDecode for Version {
    fn decode(buf: &mut &[u8]) -> Result<Self> {
        let high = u64::decode(buf)?;
        let low = u64::decode(buf)?;
        Ok(Self { high, low })
    }
}

/// An object identity together with one of its versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ObjectVersion {
    /// The object identity.
    pub id: ObjectId,
    /// The version of that object.
    pub version: Version,
}

impl ObjectVersion {
    /// Pair an object with a version.
    pub fn new(id: ObjectId, version: Version) -> Self {
        Self { id, version }
    }
}

impl fmt::Display for ObjectVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} v{}", self.id, self.version)
    }
}

impl WireEncode for ObjectVersion {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        self.id.encode(buf);
        self.version.encode(buf);
    }
}

impl WireDecode for ObjectVersion {
    fn decode(buf: &mut &[u8]) -> Result<Self> {
        Ok(Self {
            id: ObjectId::decode(buf)?,
            version: Version::decode(buf)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinels_sort_above_master_versions() {
        let big = Version::from_low(u64::MAX - 10);
        assert!(Version::HEAD > big);
        assert!(Version::NEXT > Version::OLDEST);
        assert!(Version::FIRST > Version::NONE);
        assert!(Version::HEAD.is_sentinel());
        assert!(!Version::FIRST.is_sentinel());
        assert!(!Version::NONE.is_sentinel());
    }

    #[test]
    fn test_next_carries() {
        assert_eq!(Version::NONE.next(), Version::FIRST);
        assert_eq!(
            Version::new(0, u64::MAX).next(),
            Version::new(1, 0)
        );
        assert_eq!(Version::new(1, 0).prev(), Version::new(0, u64::MAX));
    }

    #[test]
    fn test_display() {
        assert_eq!(Version::from_low(42).to_string(), "42");
        assert_eq!(Version::HEAD.to_string(), "HEAD");
        assert_eq!(Version::new(1, 2).to_string(), "1:2");
    }

    #[test]
    fn test_u128_conversion() {
        let v = Version::new(3, 9);
        assert_eq!(Version::from(v.as_u128()), v);
    }
}
