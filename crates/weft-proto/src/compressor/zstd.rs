//! Zstandard compressor backed by the `zstd` crate.

use super::{Compressor, CompressorName};
use crate::error::{ProtocolError, Result};

/// Zstandard compressor at a fixed level.
#[derive(Debug, Clone, Copy)]
pub struct ZstdCompressor {
    level: i32,
}

impl ZstdCompressor {
    /// Level 3, the zstd default.
    pub const DEFAULT: Self = Self { level: 3 };

    /// A compressor at `level`.
    pub const fn with_level(level: i32) -> Self {
        Self { level }
    }
}

impl Compressor for ZstdCompressor {
    fn name(&self) -> CompressorName {
        CompressorName::Zstd
    }

    fn compress(&self, input: &[u8]) -> Result<Vec<Vec<u8>>> {
        ::zstd::bulk::compress(input, self.level)
            .map(|out| vec![out])
            .map_err(|e| ProtocolError::Decompress(e.to_string()))
    }

    fn decompress(&self, chunks: &[&[u8]], out_len: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(out_len);
        for chunk in chunks {
            let remaining = out_len.saturating_sub(out.len());
            let part = ::zstd::bulk::decompress(chunk, remaining)
                .map_err(|e| ProtocolError::Decompress(e.to_string()))?;
            out.extend_from_slice(&part);
        }
        Ok(out)
    }
}
