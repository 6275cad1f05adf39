//! Input stream over received data fragments.

use std::collections::VecDeque;

use weft_proto::compressor::decompress_chunks;
use weft_proto::packet::object::ObjectDataPacket;
use weft_proto::{ProtocolError, WireDecode};

use crate::command::Command;

enum Fragment {
    Ready(Vec<u8>),
    /// A data packet, decompressed when first read.
    Packet(Command),
}

impl Fragment {
    fn into_bytes(self) -> Result<Vec<u8>, ProtocolError> {
        match self {
            Self::Ready(bytes) => Ok(bytes),
            Self::Packet(command) => {
                let frame = command.frame();
                let packet = ObjectDataPacket::parse(&frame)?;
                decompress_chunks(
                    packet.header.compressor,
                    &packet.chunks,
                    packet.header.data_size as usize,
                )
            }
        }
    }
}

/// Reads values back from the fragments of one stream.
///
/// Values are decoded in the order they were written. Fragments are
/// decompressed lazily, one at a time, as the reader reaches them.
pub struct DataIStream {
    fragments: VecDeque<Fragment>,
    current: Vec<u8>,
    position: usize,
}

impl DataIStream {
    /// A stream over a single in-memory buffer.
    pub fn new(data: Vec<u8>) -> Self {
        Self::from_fragments(vec![data])
    }

    pub(crate) fn from_fragments(fragments: Vec<Vec<u8>>) -> Self {
        Self {
            fragments: fragments.into_iter().map(Fragment::Ready).collect(),
            current: Vec::new(),
            position: 0,
        }
    }

    pub(crate) fn from_packets(packets: Vec<Command>) -> Self {
        Self {
            fragments: packets.into_iter().map(Fragment::Packet).collect(),
            current: Vec::new(),
            position: 0,
        }
    }

    /// Move the next fragment behind the unread bytes.
    fn load_next(&mut self) -> Result<bool, ProtocolError> {
        let Some(fragment) = self.fragments.pop_front() else {
            return Ok(false);
        };
        let bytes = fragment.into_bytes()?;
        if self.position >= self.current.len() {
            self.current = bytes;
        } else {
            self.current.drain(..self.position);
            self.current.extend_from_slice(&bytes);
        }
        self.position = 0;
        Ok(true)
    }

    /// Read the next value.
    ///
    /// # Panics
    ///
    /// Panics when the stream holds no complete value of type `T`.
    pub fn read<T: WireDecode>(&mut self) -> T {
        match self.try_read() {
            Ok(value) => value,
            Err(e) => panic!("read past end of data stream: {e}"),
        }
    }

    /// Read the next value, reporting truncation as an error.
    pub fn try_read<T: WireDecode>(&mut self) -> Result<T, ProtocolError> {
        loop {
            let mut slice = &self.current[self.position..];
            let available = slice.len();
            match T::decode(&mut slice) {
                Ok(value) => {
                    self.position += available - slice.len();
                    return Ok(value);
                }
                Err(e @ ProtocolError::Truncated { .. }) => {
                    if !self.load_next()? {
                        return Err(e);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Read `len` raw bytes.
    ///
    /// # Panics
    ///
    /// Panics if fewer bytes remain.
    pub fn read_bytes(&mut self, len: usize) -> Vec<u8> {
        while self.current.len() - self.position < len {
            match self.load_next() {
                Ok(true) => {}
                Ok(false) => panic!(
                    "read past end of data stream: {len} bytes wanted, {} left",
                    self.current.len() - self.position
                ),
                Err(e) => panic!("undecodable data fragment: {e}"),
            }
        }
        let out = self.current[self.position..self.position + len].to_vec();
        self.position += len;
        out
    }

    /// Unread bytes, decompressing whatever is left.
    pub fn remaining(&mut self) -> usize {
        while let Ok(true) = self.load_next() {}
        self.current.len() - self.position
    }

    pub fn has_data(&mut self) -> bool {
        if self.position < self.current.len() {
            return true;
        }
        self.remaining() > 0
    }
}
