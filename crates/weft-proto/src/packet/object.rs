//! Object-level packets.
//!
//! Every object packet body starts with an [`ObjectAddress`] naming the
//! object and the instance it is for. Instance and delta data travel as
//! [`ObjectDataPacket`]s; the remaining commands are small fixed packets.

use bytes::{BufMut, Bytes, BytesMut};
use smallvec::SmallVec;

use super::command::ObjectCommand;
use super::{HEADER_SIZE, PacketHeader, PacketType};
use crate::error::{ProtocolError, Result};
use crate::id::{InstanceId, NodeId, ObjectId};
use crate::version::Version;
use crate::wire::{WireDecode, WireEncode, take};

/// Object and instance a packet is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ObjectAddress {
    /// Target object.
    pub object_id: ObjectId,
    /// Target instance, or one of the routing sentinels.
    pub instance_id: InstanceId,
}

impl ObjectAddress {
    /// Address one instance of an object.
    pub fn new(object_id: ObjectId, instance_id: InstanceId) -> Self {
        Self {
            object_id,
            instance_id,
        }
    }

    /// Read the address of an object frame without decoding the rest.
    pub fn peek(frame: &[u8]) -> Result<Self> {
        let mut body = PacketHeader::body(frame);
        Self::decode(&mut body)
    }

    /// Rewrite the instance id of an encoded object frame in place.
    ///
    /// Used when one incoming packet is dispatched to several local
    /// instances.
    pub fn patch_instance(frame: &mut [u8], instance_id: InstanceId) {
        let offset = HEADER_SIZE + 16;
        if let Some(slot) = frame.get_mut(offset..offset + 4) {
            slot.copy_from_slice(&instance_id.0.to_le_bytes());
        }
    }
}

impl WireEncode for ObjectAddress {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        self.object_id.encode(buf);
        self.instance_id.encode(buf);
    }
}

impl WireDecode for ObjectAddress {
    fn decode(buf: &mut &[u8]) -> Result<Self> {
        Ok(Self {
            object_id: ObjectId::decode(buf)?,
            instance_id: InstanceId::decode(buf)?,
        })
    }
}

/// Fixed fields of an object data packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ObjectDataHeader {
    /// Target object and instance.
    pub address: ObjectAddress,
    /// Destination node for instance data sent to one slave; zero for
    /// broadcasts.
    pub node_id: NodeId,
    /// Instance id of the master object on `node_id`.
    pub master_instance_id: InstanceId,
    /// Version the data belongs to.
    pub version: Version,
    /// Uncompressed size of this packet's payload.
    pub data_size: u64,
    /// Fragment number within the stream, starting at zero.
    pub sequence: u32,
    /// Compressor name; zero for uncompressed data.
    pub compressor: u32,
    /// Number of chunks that follow.
    pub n_chunks: u32,
    /// Whether this is the final fragment of the stream.
    pub last: bool,
}

impl WireEncode for ObjectDataHeader {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        self.address.encode(buf);
        self.node_id.encode(buf);
        self.master_instance_id.encode(buf);
        self.version.encode(buf);
        self.data_size.encode(buf);
        self.sequence.encode(buf);
        self.compressor.encode(buf);
        self.n_chunks.encode(buf);
        self.last.encode(buf);
    }
}

impl WireDecode for ObjectDataHeader {
    fn decode(buf: &mut &[u8]) -> Result<Self> {
        Ok(Self {
            address: ObjectAddress::decode(buf)?,
            node_id: NodeId::decode(buf)?,
            master_instance_id: InstanceId::decode(buf)?,
            version: Version::decode(buf)?,
            data_size: u64::decode(buf)?,
            sequence: u32::decode(buf)?,
            compressor: u32::decode(buf)?,
            n_chunks: u32::decode(buf)?,
            last: bool::decode(buf)?,
        })
    }
}

/// One fragment of an object data stream, borrowing its chunks from the
/// frame it was parsed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectDataPacket<'a> {
    /// One of [`ObjectCommand::Instance`], [`ObjectCommand::Delta`] or
    /// [`ObjectCommand::SlaveDelta`].
    pub command: u32,
    /// Fixed fields.
    pub header: ObjectDataHeader,
    /// Payload chunks, compressed when `header.compressor` is non-zero.
    pub chunks: SmallVec<[&'a [u8]; 4]>,
}

impl<'a> ObjectDataPacket<'a> {
    /// Parse a complete object data frame.
    pub fn parse(frame: &'a [u8]) -> Result<Self> {
        let packet_header = PacketHeader::parse(frame)?;
        if packet_header.packet_type != PacketType::Object as u32 {
            return Err(ProtocolError::UnexpectedCommand {
                packet_type: packet_header.packet_type,
                command: packet_header.command,
            });
        }
        let mut body = PacketHeader::body(frame);
        let header = ObjectDataHeader::decode(&mut body)?;
        let mut chunks = SmallVec::with_capacity(header.n_chunks as usize);
        for _ in 0..header.n_chunks {
            let len = u64::decode(&mut body)?;
            let len = usize::try_from(len).map_err(|_| ProtocolError::Truncated {
                needed: usize::MAX,
                available: body.len(),
            })?;
            chunks.push(take(&mut body, len)?);
        }
        Ok(Self {
            command: packet_header.command,
            header,
            chunks,
        })
    }

    /// Total payload bytes carried, as sent.
    pub fn wire_size(&self) -> usize {
        self.chunks.iter().map(|c| c.len()).sum()
    }
}

/// Encode an object data frame from its parts.
///
/// `header.n_chunks` is taken from `chunks`.
pub fn encode_data_frame<C: AsRef<[u8]>>(
    command: ObjectCommand,
    header: &ObjectDataHeader,
    chunks: &[C],
) -> Bytes {
    let payload: usize = chunks.iter().map(|c| c.as_ref().len() + 8).sum();
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + 96 + payload);
    buf.put_u64_le(0);
    buf.put_u32_le(PacketType::Object as u32);
    buf.put_u32_le(command as u32);
    let header = ObjectDataHeader {
        n_chunks: chunks.len() as u32,
        ..*header
    };
    header.encode(&mut buf);
    for chunk in chunks {
        let chunk = chunk.as_ref();
        (chunk.len() as u64).encode(&mut buf);
        buf.put_slice(chunk);
    }
    let size = buf.len() as u64;
    buf[..8].copy_from_slice(&size.to_le_bytes());
    buf.freeze()
}

packet! {
    /// Announces the newest version a slave can absorb without lagging.
    pub struct MaxVersionPacket(Object, ObjectCommand::MaxVersion as u32) {
        address: ObjectAddress,
        version: u64,
        slave_instance_id: InstanceId,
    }
}

packet! {
    /// Barrier participant arrives at `version`.
    pub struct BarrierEnterPacket(Object, ObjectCommand::CUSTOM) {
        address: ObjectAddress,
        version: Version,
        incarnation: u32,
        timeout: u32,
    }
}

packet! {
    /// Barrier master releases a participant.
    pub struct BarrierEnterReplyPacket(Object, ObjectCommand::CUSTOM + 1) {
        address: ObjectAddress,
        version: Version,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Packet;

    fn sample_header() -> ObjectDataHeader {
        ObjectDataHeader {
            address: ObjectAddress::new(ObjectId(5), InstanceId(2)),
            node_id: NodeId(9),
            master_instance_id: InstanceId(1),
            version: Version::from_low(4),
            data_size: 6,
            sequence: 0,
            compressor: 0,
            n_chunks: 0,
            last: true,
        }
    }

    #[test]
    fn test_data_frame_layout() {
        let frame = encode_data_frame(ObjectCommand::Instance, &sample_header(), &[b"abc", b"def"]);
        let parsed = ObjectDataPacket::parse(&frame).unwrap();
        assert_eq!(parsed.command, ObjectCommand::Instance as u32);
        assert_eq!(parsed.header.n_chunks, 2);
        assert_eq!(parsed.chunks.as_slice(), &[&b"abc"[..], &b"def"[..]]);
        assert_eq!(parsed.wire_size(), 6);
        assert_eq!(PacketHeader::parse(&frame).unwrap().size as usize, frame.len());
    }

    #[test]
    fn test_truncated_chunk_is_rejected() {
        let frame = encode_data_frame(ObjectCommand::Delta, &sample_header(), &[b"abcdef"]);
        let cut = &frame[..frame.len() - 2];
        assert!(matches!(
            ObjectDataPacket::parse(cut),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn test_patch_instance() {
        let frame = encode_data_frame(ObjectCommand::Instance, &sample_header(), &[b"x"]);
        let mut raw = frame.to_vec();
        ObjectAddress::patch_instance(&mut raw, InstanceId(77));
        assert_eq!(ObjectAddress::peek(&raw).unwrap().instance_id, InstanceId(77));
        assert_eq!(ObjectAddress::peek(&raw).unwrap().object_id, ObjectId(5));
    }

    #[test]
    fn test_barrier_commands_are_custom() {
        assert_eq!(BarrierEnterPacket::COMMAND, ObjectCommand::CUSTOM);
        assert_eq!(BarrierEnterReplyPacket::COMMAND, ObjectCommand::CUSTOM + 1);
        let frame = BarrierEnterPacket {
            address: ObjectAddress::new(ObjectId(1), InstanceId(0)),
            version: Version::from_low(3),
            incarnation: 2,
            timeout: u32::MAX,
        }
        .to_frame();
        assert_eq!(ObjectAddress::peek(&frame).unwrap().object_id, ObjectId(1));
    }
}
