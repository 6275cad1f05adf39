//! # weft-proto
//!
//! Wire-level building blocks for the weft distributed-object runtime.
//!
//! ## Features
//!
//! - 128-bit node/object identifiers and 32-bit instance identifiers
//! - 128-bit object versions with the reserved sentinel values
//! - Little-endian value encoding shared by packets and object data streams
//! - Length-prefixed packet framing with a Tokio codec
//! - Pluggable byte compressors (run-length built in, zstd optional)
//!
//! ## Quick Start
//!
//! ```rust
//! use weft_proto::packet::{Packet, node::PingPacket};
//! use weft_proto::packet::PacketHeader;
//!
//! let frame = PingPacket { time: 7 }.to_frame();
//! let header = PacketHeader::parse(&frame).unwrap();
//! assert_eq!(header.size as usize, frame.len());
//! assert_eq!(header.command, PingPacket::COMMAND);
//! ```

#![deny(clippy::all)]
#![warn(missing_docs)]

pub mod compressor;
pub mod description;
pub mod error;
pub mod id;
pub mod packet;
pub mod version;
pub mod wire;

#[cfg(feature = "tokio")]
pub mod codec;

pub use self::compressor::{Compressor, CompressorName};
pub use self::description::{ConnectionDescription, ConnectionType};
pub use self::error::ProtocolError;
pub use self::id::{InstanceId, NodeId, ObjectId};
pub use self::packet::{Packet, PacketHeader, PacketType};
pub use self::version::{ObjectVersion, Version};
pub use self::wire::{WireDecode, WireEncode};

#[cfg(feature = "tokio")]
pub use self::codec::FrameCodec;
