//! Reassembly of one object version from data packets.

use weft_proto::packet::ObjectCommand;
use weft_proto::packet::object::ObjectDataPacket;
use weft_proto::{ProtocolError, Version};

use super::DataIStream;
use crate::command::Command;

/// The data packets of one object version.
///
/// Packets are added in fragment order as they arrive; the stream is ready
/// once the final fragment is in. Clones share the packets.
#[derive(Debug, Clone, Default)]
pub struct ObjectDataIStream {
    commands: Vec<Command>,
    version: Version,
    data_size: usize,
    ready: bool,
    instance_data: bool,
}

impl ObjectDataIStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the next fragment.
    ///
    /// # Panics
    ///
    /// Panics if the fragment is out of order or the stream is complete.
    pub fn add_data_packet(&mut self, command: Command) -> Result<(), ProtocolError> {
        let header = {
            let frame = command.frame();
            ObjectDataPacket::parse(&frame)?.header
        };
        assert!(
            !self.ready,
            "data packet for {} added to a complete stream",
            header.version
        );
        assert_eq!(
            header.sequence as usize,
            self.commands.len(),
            "out-of-order data fragment for v{}",
            header.version
        );

        if self.commands.is_empty() {
            self.version = header.version;
            self.instance_data = command.command() == ObjectCommand::Instance as u32;
        }
        self.data_size += command.len();
        self.ready = header.last;
        self.commands.push(command);
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Version of the data, known once the first fragment arrived.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Bytes held by the packets.
    pub fn data_size(&self) -> usize {
        self.data_size
    }

    /// Whether this is a full snapshot rather than a delta.
    pub fn has_instance_data(&self) -> bool {
        self.instance_data
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Fragments received so far.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// A fresh reader positioned at the start of the data.
    pub fn reader(&self) -> DataIStream {
        DataIStream::from_packets(self.commands.clone())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::command::CommandCache;
    use weft_proto::packet::object::{ObjectAddress, ObjectDataHeader, encode_data_frame};
    use weft_proto::{InstanceId, NodeId, ObjectId, WireEncode};

    /// Frames of one version, `data` split into `parts` raw fragments.
    pub(crate) fn data_frames(
        command: ObjectCommand,
        version: Version,
        data: &[u8],
        parts: usize,
    ) -> Vec<bytes::Bytes> {
        let chunk = data.len().div_ceil(parts).max(1);
        let pieces: Vec<&[u8]> = if data.is_empty() {
            vec![&[]]
        } else {
            data.chunks(chunk).collect()
        };
        let n = pieces.len();
        pieces
            .into_iter()
            .enumerate()
            .map(|(i, piece)| {
                let header = ObjectDataHeader {
                    address: ObjectAddress::new(ObjectId(1), InstanceId(0)),
                    node_id: NodeId::ZERO,
                    master_instance_id: InstanceId(0),
                    version,
                    data_size: piece.len() as u64,
                    sequence: i as u32,
                    compressor: 0,
                    n_chunks: 0,
                    last: i + 1 == n,
                };
                encode_data_frame(command, &header, &[piece])
            })
            .collect()
    }

    #[test]
    fn test_fragments_reassemble() {
        let cache = CommandCache::new();
        let data = (42u64, String::from("forty-two")).to_wire();
        let mut stream = ObjectDataIStream::new();
        for frame in data_frames(ObjectCommand::Instance, Version::from_low(3), &data, 3) {
            assert!(!stream.is_ready());
            stream.add_data_packet(cache.alloc_frame(None, &frame)).unwrap();
        }
        assert!(stream.is_ready());
        assert!(stream.has_instance_data());
        assert_eq!(stream.version(), Version::from_low(3));
        assert_eq!(stream.len(), 3);

        let mut is = stream.reader();
        assert_eq!(is.read::<u64>(), 42);
        assert_eq!(is.read::<String>(), "forty-two");
        // Readers are independent.
        assert_eq!(stream.clone().reader().read::<u64>(), 42);
    }

    #[test]
    #[should_panic(expected = "out-of-order data fragment")]
    fn test_gap_panics() {
        let cache = CommandCache::new();
        let frames = data_frames(ObjectCommand::Delta, Version::from_low(1), &[1, 2, 3, 4], 2);
        let mut stream = ObjectDataIStream::new();
        stream.add_data_packet(cache.alloc_frame(None, &frames[1])).unwrap();
    }
}
