//! Frame codec for tokio.
//!
//! Splits a byte stream into whole packets using the size field at the
//! front of each packet header. Frames are yielded undecoded; the receiver
//! copies them into pooled command buffers before parsing.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{ProtocolError, Result};
use crate::packet::HEADER_SIZE;

/// Default upper bound for a single frame.
pub const DEFAULT_MAX_FRAME: usize = 256 * 1024 * 1024;

/// Tokio codec yielding whole packet frames.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame: usize,
}

impl FrameCodec {
    /// Create a codec with the default frame limit.
    pub fn new() -> Self {
        Self {
            max_frame: DEFAULT_MAX_FRAME,
        }
    }

    /// Create a codec with a custom frame limit.
    pub fn with_max_frame(max_frame: usize) -> Self {
        Self {
            max_frame: max_frame.max(HEADER_SIZE),
        }
    }

    /// The frame limit.
    pub fn max_frame(&self) -> usize {
        self.max_frame
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>> {
        if src.len() < 8 {
            return Ok(None);
        }
        let mut size_bytes = [0u8; 8];
        size_bytes.copy_from_slice(&src[..8]);
        let size = u64::from_le_bytes(size_bytes);

        if size < HEADER_SIZE as u64 {
            return Err(ProtocolError::FrameTooShort { size });
        }
        if size > self.max_frame as u64 {
            return Err(ProtocolError::FrameTooLarge {
                size,
                limit: self.max_frame,
            });
        }

        let size = size as usize;
        if src.len() < size {
            src.reserve(size - src.len());
            return Ok(None);
        }
        Ok(Some(src.split_to(size)))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Bytes, dst: &mut BytesMut) -> Result<()> {
        if frame.len() > self.max_frame {
            return Err(ProtocolError::FrameTooLarge {
                size: frame.len() as u64,
                limit: self.max_frame,
            });
        }
        dst.reserve(frame.len());
        dst.extend_from_slice(frame.chunk());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Packet;
    use crate::packet::node::{DisconnectPacket, PingPacket};

    #[test]
    fn test_decode_waits_for_whole_frame() {
        let frame = PingPacket { time: 99 }.to_frame();
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&frame[..frame.len() - 1]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&frame[frame.len() - 1..]);
        let out = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&out[..], &frame[..]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_back_to_back_frames() {
        let a = PingPacket { time: 1 }.to_frame();
        let b = DisconnectPacket { request_id: 2 }.to_frame();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&a);
        buf.extend_from_slice(&b);

        let mut codec = FrameCodec::new();
        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(PingPacket::from_frame(&first).unwrap().time, 1);
        assert_eq!(DisconnectPacket::from_frame(&second).unwrap().request_id, 2);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_oversized_frame() {
        let mut codec = FrameCodec::with_max_frame(32);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&64u64.to_le_bytes());
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::FrameTooLarge { size: 64, limit: 32 })
        ));
    }

    #[test]
    fn test_undersized_frame() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&3u64.to_le_bytes());
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::FrameTooShort { size: 3 })
        ));
    }

    #[test]
    fn test_encode_copies_frame() {
        let frame = PingPacket { time: 5 }.to_frame();
        let mut codec = FrameCodec::new();
        let mut dst = BytesMut::new();
        codec.encode(frame.clone(), &mut dst).unwrap();
        assert_eq!(&dst[..], &frame[..]);
    }
}
