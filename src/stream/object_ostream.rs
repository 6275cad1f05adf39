//! Object data packets as a stream sink.

use weft_proto::packet::ObjectCommand;
use weft_proto::packet::object::{ObjectAddress, ObjectDataHeader, encode_data_frame};
use weft_proto::{InstanceId, NodeId, Version};

use super::{DataOStream, DataPacket, DataSink};
use crate::network::Connection;

/// Encodes stream packets as object data frames.
#[derive(Debug, Clone)]
pub struct ObjectSink {
    command: ObjectCommand,
    header: ObjectDataHeader,
}

impl ObjectSink {
    pub fn new(command: ObjectCommand, header: ObjectDataHeader) -> Self {
        Self { command, header }
    }

    pub fn command(&self) -> ObjectCommand {
        self.command
    }

    pub fn header(&self) -> &ObjectDataHeader {
        &self.header
    }
}

impl DataSink for ObjectSink {
    fn send_data(&mut self, connections: &[Connection], packet: DataPacket<'_>) {
        let header = ObjectDataHeader {
            sequence: packet.sequence,
            compressor: packet.compressor,
            data_size: packet.data_size,
            last: packet.last,
            ..self.header
        };
        let frame = encode_data_frame(self.command, &header, packet.chunks);
        for connection in connections {
            if connection.send(frame.clone()) {
                crate::metrics::record_bytes_sent(frame.len());
            }
        }
    }
}

impl DataOStream<ObjectSink> {
    /// A stream of `command` packets addressed to `address`.
    pub fn for_object(
        command: ObjectCommand,
        address: ObjectAddress,
        master_instance_id: InstanceId,
        buffer_size: usize,
        compressor: Option<&'static dyn weft_proto::Compressor>,
    ) -> Self {
        let header = ObjectDataHeader {
            address,
            master_instance_id,
            ..ObjectDataHeader::default()
        };
        Self::new(ObjectSink::new(command, header), buffer_size, compressor)
    }

    pub fn version(&self) -> Version {
        self.sink().header.version
    }

    pub fn set_version(&mut self, version: Version) {
        self.sink_mut().header.version = version;
    }

    /// Target instance on the receiving node.
    pub fn set_instance_id(&mut self, instance_id: InstanceId) {
        self.sink_mut().header.address.instance_id = instance_id;
    }

    /// Receiving node for data sent to one slave; zero for broadcasts.
    pub fn set_node_id(&mut self, node_id: NodeId) {
        self.sink_mut().header.node_id = node_id;
    }

    pub fn set_command(&mut self, command: ObjectCommand) {
        self.sink_mut().command = command;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandCache;
    use crate::network::{ConnectionEvent, pipe_pair};
    use crate::stream::ObjectDataIStream;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use weft_proto::ObjectId;

    #[tokio::test]
    async fn test_object_stream_reaches_peer_as_data_packets() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (a, _b) = pipe_pair(tx, Duration::from_secs(1));

        let address = ObjectAddress::new(ObjectId(9), InstanceId::ALL);
        let mut os = DataOStream::for_object(ObjectCommand::Delta, address, InstanceId(4), 8, None);
        os.set_version(Version::from_low(6));
        os.enable(vec![a]);
        for i in 0..6u32 {
            os.write(&i);
        }
        os.disable();

        let cache = CommandCache::new();
        let mut stream = ObjectDataIStream::new();
        while !stream.is_ready() {
            match rx.recv().await {
                Some(ConnectionEvent::Data(_, frame)) => {
                    stream.add_data_packet(cache.alloc_frame(None, &frame)).unwrap();
                }
                Some(_) => {}
                None => panic!("event channel closed"),
            }
        }
        assert_eq!(stream.version(), Version::from_low(6));
        assert!(!stream.has_instance_data());
        assert!(stream.len() > 1);
        let mut is = stream.reader();
        for i in 0..6u32 {
            assert_eq!(is.read::<u32>(), i);
        }
    }
}
