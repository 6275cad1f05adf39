//! Byte run-length encoding.
//!
//! Output is a sequence of control bytes, each followed by data:
//!
//! - `0..=127`: a literal run of `n + 1` bytes follows;
//! - `128..=255`: the next byte repeats `n - 126` times (2 to 129).

use super::{Compressor, CompressorName};
use crate::error::{ProtocolError, Result};

const MAX_LITERAL: usize = 128;
const MAX_REPEAT: usize = 129;

/// Run-length compressor.
#[derive(Debug, Clone, Copy, Default)]
pub struct RleCompressor;

impl RleCompressor {
    /// Encode `input` into a single buffer.
    pub fn encode(input: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(input.len() / 2 + 2);
        let mut literal_start = 0;
        let mut i = 0;

        while i < input.len() {
            let byte = input[i];
            let mut run = 1;
            while i + run < input.len() && input[i + run] == byte && run < MAX_REPEAT {
                run += 1;
            }

            if run >= 2 {
                flush_literals(&mut out, &input[literal_start..i]);
                out.push((run + 126) as u8);
                out.push(byte);
                i += run;
                literal_start = i;
            } else {
                i += 1;
            }
        }
        flush_literals(&mut out, &input[literal_start..]);
        out
    }

    /// Decode a buffer produced by [`RleCompressor::encode`].
    pub fn decode(input: &[u8], out: &mut Vec<u8>) -> Result<()> {
        let mut i = 0;
        while i < input.len() {
            let control = input[i] as usize;
            i += 1;
            if control < 128 {
                let len = control + 1;
                let literal = input.get(i..i + len).ok_or_else(|| {
                    ProtocolError::Decompress(format!("literal run of {len} bytes past end"))
                })?;
                out.extend_from_slice(literal);
                i += len;
            } else {
                let byte = *input.get(i).ok_or_else(|| {
                    ProtocolError::Decompress("repeat run without a value".to_string())
                })?;
                out.resize(out.len() + control - 126, byte);
                i += 1;
            }
        }
        Ok(())
    }
}

fn flush_literals(out: &mut Vec<u8>, mut literals: &[u8]) {
    while !literals.is_empty() {
        let len = literals.len().min(MAX_LITERAL);
        out.push((len - 1) as u8);
        out.extend_from_slice(&literals[..len]);
        literals = &literals[len..];
    }
}

impl Compressor for RleCompressor {
    fn name(&self) -> CompressorName {
        CompressorName::Rle
    }

    fn compress(&self, input: &[u8]) -> Result<Vec<Vec<u8>>> {
        Ok(vec![Self::encode(input)])
    }

    fn decompress(&self, chunks: &[&[u8]], out_len: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(out_len);
        for chunk in chunks {
            Self::decode(chunk, &mut out)?;
        }
        Ok(out)
    }
}
