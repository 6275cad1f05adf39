//! Packet header and bodies.
//!
//! Every frame on the wire is one packet:
//!
//! ```text
//! [size: u64][type: u32][command: u32][body ...]
//! ```
//!
//! `size` counts the whole frame, itself included. The body layout depends
//! on the packet type and command and is described by the types in
//! [`node`] and [`object`].

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ProtocolError, Result};
use crate::wire::{WireDecode, WireEncode};

/// Declare a packet struct with wire encoding in field order.
macro_rules! packet {
    (
        $(#[$meta:meta])*
        pub struct $name:ident ($kind:ident, $command:expr) {
            $( $(#[$fmeta:meta])* $field:ident : $fty:ty ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Default)]
        pub struct $name {
            $( $(#[$fmeta])* pub $field: $fty, )*
        }

        impl $crate::wire::WireEncode for $name {
            #[allow(unused_variables)]
            fn encode<B: bytes::BufMut>(&self, buf: &mut B) {
                $( $crate::wire::WireEncode::encode(&self.$field, buf); )*
            }
        }

        impl $crate::wire::WireDecode for $name {
            #[allow(unused_variables)]
            fn decode(buf: &mut &[u8]) -> $crate::error::Result<Self> {
                Ok(Self {
                    $( $field: <$fty as $crate::wire::WireDecode>::decode(buf)?, )*
                })
            }
        }

        impl $crate::packet::Packet for $name {
            const TYPE: $crate::packet::PacketType = $crate::packet::PacketType::$kind;
            const COMMAND: u32 = $command;
        }
    };
}

pub mod command;
pub mod node;
pub mod object;

pub use self::command::{NodeCommand, ObjectCommand};

/// Size of the fixed packet header.
pub const HEADER_SIZE: usize = 16;

/// Smallest buffer handed out for a packet; also the split point between
/// the small and big command pools.
pub const MIN_PACKET_SIZE: usize = 4096;

/// Packet families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PacketType {
    /// Addressed to the local node.
    Node = 0,
    /// Addressed to an object instance; the body starts with an
    /// [`object::ObjectAddress`].
    Object = 1,
}

impl PacketType {
    /// Parse the raw type field.
    pub fn from_u32(raw: u32) -> Result<Self> {
        match raw {
            0 => Ok(Self::Node),
            1 => Ok(Self::Object),
            other => Err(ProtocolError::UnknownPacketType(other)),
        }
    }

    /// Stable name for logs and metric labels.
    pub fn name(self) -> &'static str {
        match self {
            Self::Node => "node",
            Self::Object => "object",
        }
    }
}

/// The fixed header at the front of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Total frame size in bytes.
    pub size: u64,
    /// Raw packet type; see [`PacketType`].
    pub packet_type: u32,
    /// Command id within the packet type.
    pub command: u32,
}

impl PacketHeader {
    /// Read the header from the front of a frame.
    pub fn parse(frame: &[u8]) -> Result<Self> {
        let mut buf = frame;
        let size = u64::decode(&mut buf)?;
        let packet_type = u32::decode(&mut buf)?;
        let command = u32::decode(&mut buf)?;
        if size < HEADER_SIZE as u64 {
            return Err(ProtocolError::FrameTooShort { size });
        }
        Ok(Self {
            size,
            packet_type,
            command,
        })
    }

    /// The packet family.
    pub fn kind(&self) -> Result<PacketType> {
        PacketType::from_u32(self.packet_type)
    }

    /// Body bytes following the header.
    pub fn body(frame: &[u8]) -> &[u8] {
        frame.get(HEADER_SIZE..).unwrap_or(&[])
    }
}

/// Encode a frame for an arbitrary type/command pair.
pub fn encode_frame<T: WireEncode + ?Sized>(packet_type: PacketType, command: u32, body: &T) -> Bytes {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_u64_le(0);
    buf.put_u32_le(packet_type as u32);
    buf.put_u32_le(command);
    body.encode(&mut buf);
    patch_size(buf)
}

/// Encode a frame whose body is already serialized.
pub fn encode_raw_frame(packet_type: PacketType, command: u32, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + body.len());
    buf.put_u64_le(0);
    buf.put_u32_le(packet_type as u32);
    buf.put_u32_le(command);
    buf.put_slice(body);
    patch_size(buf)
}

fn patch_size(mut buf: BytesMut) -> Bytes {
    let size = buf.len() as u64;
    buf[..8].copy_from_slice(&size.to_le_bytes());
    buf.freeze()
}

/// A packet with a fixed type and command.
pub trait Packet: WireEncode + WireDecode {
    /// The packet family.
    const TYPE: PacketType;
    /// The command id.
    const COMMAND: u32;

    /// Encode as a complete frame.
    fn to_frame(&self) -> Bytes {
        encode_frame(Self::TYPE, Self::COMMAND, self)
    }

    /// Decode from a complete frame, checking type and command.
    fn from_frame(frame: &[u8]) -> Result<Self> {
        let header = PacketHeader::parse(frame)?;
        if header.packet_type != Self::TYPE as u32 || header.command != Self::COMMAND {
            return Err(ProtocolError::UnexpectedCommand {
                packet_type: header.packet_type,
                command: header.command,
            });
        }
        let mut body = PacketHeader::body(frame);
        Self::decode(&mut body)
    }
}
