//! Little-endian value encoding.
//!
//! Every value on the wire is written little-endian. Strings and vectors
//! carry a `u64` element count in front of their contents. The same encoding
//! is used for packet bodies and for the contents of object data streams.

use bytes::BufMut;

use crate::error::{ProtocolError, Result};

/// A value that can be appended to a byte buffer.
pub trait WireEncode {
    /// Append the encoded value to `buf`.
    fn encode<B: BufMut>(&self, buf: &mut B);

    /// Encode into a fresh vector.
    fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(&mut out);
        out
    }
}

/// A value that can be read from the front of a byte slice.
///
/// The slice is advanced past the consumed bytes.
pub trait WireDecode: Sized {
    /// Decode one value and advance `buf`.
    fn decode(buf: &mut &[u8]) -> Result<Self>;
}

/// Split `n` bytes off the front of `buf`.
pub fn take<'a>(buf: &mut &'a [u8], n: usize) -> Result<&'a [u8]> {
    if buf.len() < n {
        return Err(ProtocolError::Truncated {
            needed: n,
            available: buf.len(),
        });
    }
    let (head, tail) = buf.split_at(n);
    *buf = tail;
    Ok(head)
}

/// Read a `u64` length prefix and check it against the remaining bytes.
///
/// `unit` is the minimal encoded size of one element; it keeps a corrupt
/// length from triggering a huge allocation.
fn take_len(buf: &mut &[u8], unit: usize) -> Result<usize> {
    let len = u64::decode(buf)?;
    let needed = (len as usize).saturating_mul(unit.max(1));
    if len > usize::MAX as u64 || needed > buf.len() {
        return Err(ProtocolError::Truncated {
            needed,
            available: buf.len(),
        });
    }
    Ok(len as usize)
}

macro_rules! wire_int {
    ($($ty:ty => $put:ident),* $(,)?) => {$(
        impl WireEncode for $ty {
            fn encode<B: BufMut>(&self, buf: &mut B) {
                buf.$put(*self);
            }
        }

        impl WireDecode for $ty {
            fn decode(buf: &mut &[u8]) -> Result<Self> {
                let raw = take(buf, std::mem::size_of::<$ty>())?;
                let mut bytes = [0u8; std::mem::size_of::<$ty>()];
                bytes.copy_from_slice(raw);
                Ok(<$ty>::from_le_bytes(bytes))
            }
        }
    )*};
}

wire_int! {
    u8 => put_u8,
    i8 => put_i8,
    u16 => put_u16_le,
    i16 => put_i16_le,
    u32 => put_u32_le,
    i32 => put_i32_le,
    u64 => put_u64_le,
    i64 => put_i64_le,
    u128 => put_u128_le,
    i128 => put_i128_le,
    f32 => put_f32_le,
    f64 => put_f64_le,
}

impl WireEncode for bool {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(u8::from(*self));
    }
}

impl WireDecode for bool {
    fn decode(buf: &mut &[u8]) -> Result<Self> {
        match u8::decode(buf)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(ProtocolError::InvalidValue {
                field: "bool",
                value: u64::from(other),
            }),
        }
    }
}

impl WireEncode for str {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        (self.len() as u64).encode(buf);
        buf.put_slice(self.as_bytes());
    }
}

impl WireEncode for String {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        self.as_str().encode(buf);
    }
}

impl WireDecode for String {
    fn decode(buf: &mut &[u8]) -> Result<Self> {
        let len = take_len(buf, 1)?;
        let raw = take(buf, len)?;
        Ok(String::from_utf8(raw.to_vec())?)
    }
}

impl<T: WireEncode> WireEncode for [T] {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        (self.len() as u64).encode(buf);
        for item in self {
            item.encode(buf);
        }
    }
}

impl<T: WireEncode> WireEncode for Vec<T> {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        self.as_slice().encode(buf);
    }
}

impl<T: WireDecode> WireDecode for Vec<T> {
    fn decode(buf: &mut &[u8]) -> Result<Self> {
        let len = take_len(buf, 1)?;
        let mut out = Vec::with_capacity(len);
        for _ in 0..len {
            out.push(T::decode(buf)?);
        }
        Ok(out)
    }
}

impl<T: WireEncode> WireEncode for Option<T> {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        match self {
            Some(value) => {
                true.encode(buf);
                value.encode(buf);
            }
            None => false.encode(buf),
        }
    }
}

impl<T: WireDecode> WireDecode for Option<T> {
    fn decode(buf: &mut &[u8]) -> Result<Self> {
        if bool::decode(buf)? {
            Ok(Some(T::decode(buf)?))
        } else {
            Ok(None)
        }
    }
}

impl<A: WireEncode, B2: WireEncode> WireEncode for (A, B2) {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        self.0.encode(buf);
        self.1.encode(buf);
    }
}

impl<A: WireDecode, B2: WireDecode> WireDecode for (A, B2) {
    fn decode(buf: &mut &[u8]) -> Result<Self> {
        Ok((A::decode(buf)?, B2::decode(buf)?))
    }
}

/// Raw byte blobs are written as a `u64` length followed by the bytes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Blob(pub Vec<u8>);

impl WireEncode for Blob {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        (self.0.len() as u64).encode(buf);
        buf.put_slice(&self.0);
    }
}

impl WireDecode for Blob {
    fn decode(buf: &mut &[u8]) -> Result<Self> {
        let len = take_len(buf, 1)?;
        Ok(Self(take(buf, len)?.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integers_are_little_endian() {
        assert_eq!(0x0102_0304u32.to_wire(), vec![4, 3, 2, 1]);
        assert_eq!(1u64.to_wire(), vec![1, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_string_has_u64_prefix() {
        let bytes = "hi".to_wire();
        assert_eq!(bytes, vec![2, 0, 0, 0, 0, 0, 0, 0, b'h', b'i']);
        let mut slice = bytes.as_slice();
        assert_eq!(String::decode(&mut slice).unwrap(), "hi");
        assert!(slice.is_empty());
    }

    #[test]
    fn test_truncated_input_is_an_error() {
        let mut slice: &[u8] = &[1, 2, 3];
        match u32::decode(&mut slice) {
            Err(ProtocolError::Truncated { needed, available }) => {
                assert_eq!(needed, 4);
                assert_eq!(available, 3);
            }
            other => panic!("expected truncation, got {other:?}"),
        }
    }

    #[test]
    fn test_corrupt_length_does_not_allocate() {
        let mut bytes = u64::MAX.to_wire();
        bytes.extend_from_slice(b"abc");
        let mut slice = bytes.as_slice();
        assert!(Vec::<u64>::decode(&mut slice).is_err());
    }

    #[test]
    fn test_option_and_vec() {
        let value: Vec<Option<u16>> = vec![Some(7), None, Some(9)];
        let bytes = value.to_wire();
        let mut slice = bytes.as_slice();
        assert_eq!(Vec::<Option<u16>>::decode(&mut slice).unwrap(), value);
    }

    #[test]
    fn test_invalid_bool() {
        let mut slice: &[u8] = &[2];
        assert!(matches!(
            bool::decode(&mut slice),
            Err(ProtocolError::InvalidValue { field: "bool", .. })
        ));
    }
}
