//! Byte compressors for object data.
//!
//! A compressor turns one buffer into one or more chunks and back. The name
//! travels in every data packet so the receiver can pick the matching
//! decompressor. Name zero means "not compressed".

use std::fmt;

use crate::error::{ProtocolError, Result};

pub mod rle;
#[cfg(feature = "zstd")]
pub mod zstd;

/// Registered compressor names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
#[repr(u32)]
pub enum CompressorName {
    /// Data is sent as is.
    #[default]
    None = 0,
    /// Byte run-length encoding.
    Rle = 1,
    /// Zstandard; needs the `zstd` feature.
    Zstd = 2,
}

impl CompressorName {
    /// Parse the raw wire value.
    pub fn from_u32(raw: u32) -> Result<Self> {
        match raw {
            0 => Ok(Self::None),
            1 => Ok(Self::Rle),
            2 => Ok(Self::Zstd),
            other => Err(ProtocolError::UnknownCompressor(other)),
        }
    }
}

impl fmt::Display for CompressorName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Rle => "rle",
            Self::Zstd => "zstd",
        })
    }
}

/// A stateless byte compressor.
pub trait Compressor: Send + Sync {
    /// The name written into data packets.
    fn name(&self) -> CompressorName;

    /// Compress `input` into one or more chunks.
    ///
    /// An error makes the caller send the input uncompressed.
    fn compress(&self, input: &[u8]) -> Result<Vec<Vec<u8>>>;

    /// Restore `out_len` bytes from the chunks produced by [`compress`].
    ///
    /// [`compress`]: Compressor::compress
    fn decompress(&self, chunks: &[&[u8]], out_len: usize) -> Result<Vec<u8>>;
}

static RLE: rle::RleCompressor = rle::RleCompressor;

#[cfg(feature = "zstd")]
static ZSTD: zstd::ZstdCompressor = zstd::ZstdCompressor::DEFAULT;

/// Find the compressor registered under `name`.
///
/// Returns `Ok(None)` for [`CompressorName::None`] and an error for names
/// this build cannot handle.
pub fn lookup(name: CompressorName) -> Result<Option<&'static dyn Compressor>> {
    match name {
        CompressorName::None => Ok(None),
        CompressorName::Rle => Ok(Some(&RLE)),
        #[cfg(feature = "zstd")]
        CompressorName::Zstd => Ok(Some(&ZSTD)),
        #[cfg(not(feature = "zstd"))]
        CompressorName::Zstd => Err(ProtocolError::UnknownCompressor(name as u32)),
    }
}

/// Decompress a data packet payload.
///
/// Uncompressed payloads are concatenated.
pub fn decompress_chunks(compressor: u32, chunks: &[&[u8]], out_len: usize) -> Result<Vec<u8>> {
    match lookup(CompressorName::from_u32(compressor)?)? {
        Some(compressor) => {
            let out = compressor.decompress(chunks, out_len)?;
            if out.len() != out_len {
                return Err(ProtocolError::Decompress(format!(
                    "expected {out_len} bytes, got {}",
                    out.len()
                )));
            }
            Ok(out)
        }
        None => {
            let mut out = Vec::with_capacity(out_len);
            for chunk in chunks {
                out.extend_from_slice(chunk);
            }
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup() {
        assert!(lookup(CompressorName::None).unwrap().is_none());
        assert_eq!(
            lookup(CompressorName::Rle).unwrap().map(|c| c.name()),
            Some(CompressorName::Rle)
        );
        assert!(CompressorName::from_u32(99).is_err());
    }

    #[cfg(not(feature = "zstd"))]
    #[test]
    fn test_zstd_unavailable_without_feature() {
        assert!(matches!(
            lookup(CompressorName::Zstd),
            Err(ProtocolError::UnknownCompressor(2))
        ));
    }

    #[test]
    fn test_decompress_uncompressed_concatenates() {
        let out = decompress_chunks(0, &[&b"ab"[..], &b"cd"[..]], 4).unwrap();
        assert_eq!(out, b"abcd");
    }

    #[test]
    fn test_decompress_checks_length() {
        let chunks = RLE.compress(b"aaaa").unwrap();
        let refs: Vec<&[u8]> = chunks.iter().map(Vec::as_slice).collect();
        assert!(decompress_chunks(1, &refs, 5).is_err());
        assert_eq!(decompress_chunks(1, &refs, 4).unwrap(), b"aaaa");
    }
}
