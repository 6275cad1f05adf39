//! Master that sends deltas and keeps snapshots for new slaves.

use std::sync::Arc;

use tracing::debug;
use weft_proto::packet::ObjectCommand;
use weft_proto::packet::node::MapObjectPacket;
use weft_proto::{InstanceId, NodeId, Version};

use super::full_master::FullMasterCm;
use super::{ChangeManager, MapResult};
use crate::command::Command;
use crate::network::Node;
use crate::object::ObjectApi;
use crate::stream::ObjectDataIStream;
use crate::util::{Monitor, MtQueue};

/// Slaves receive `pack` output on commit. The full instance data of each
/// version is still retained so late slaves can be mapped.
pub(crate) struct DeltaMasterCm {
    full: FullMasterCm,
}

impl DeltaMasterCm {
    pub fn new(auto_obsolete: u32) -> Self {
        Self {
            full: FullMasterCm::new(auto_obsolete),
        }
    }
}

impl ChangeManager for DeltaMasterCm {
    fn is_master(&self) -> bool {
        true
    }

    fn version(&self) -> Version {
        self.full.version()
    }

    fn oldest_version(&self) -> Version {
        self.full.oldest_version()
    }

    fn auto_obsolete(&self) -> u32 {
        self.full.auto_obsolete()
    }

    fn set_auto_obsolete(&mut self, count: u32) {
        self.full.set_auto_obsolete(count);
    }

    fn init(&mut self, obj: &dyn ObjectApi) {
        self.full.init(obj);
    }

    fn commit(&mut self, obj: &dyn ObjectApi, incarnation: u32) -> Version {
        let full = &mut self.full;
        full.advance_commit_count(incarnation);
        if !obj.is_dirty() {
            full.obsolete();
            return full.core.version;
        }

        let next = full.core.version.next();
        let mut delta = obj.core().ostream(obj, ObjectCommand::Delta, InstanceId::ALL);
        delta.set_version(next);
        delta.enable(full.core.slave_connections());
        obj.pack(&mut delta);
        delta.disable();
        if !delta.has_sent_data() {
            full.obsolete();
            return full.core.version;
        }

        let snapshot = obj.core().snapshot(obj, next);
        full.retain(snapshot);
        full.core.version = next;
        full.obsolete();
        crate::metrics::record_commit();
        debug!(object = %obj.core().id(), version = %next, "Committed delta");
        next
    }

    fn add_slave(&mut self, obj: &dyn ObjectApi, node: &Arc<Node>, packet: &MapObjectPacket) -> MapResult {
        self.full.map_from_history(obj, node, packet)
    }

    fn remove_slave(&mut self, node_id: NodeId, instance_id: InstanceId) {
        self.full.remove_slave(node_id, instance_id);
    }

    fn remove_slaves(&mut self, node_id: NodeId) {
        self.full.remove_slaves(node_id);
    }

    fn slave_nodes(&self) -> Vec<Arc<Node>> {
        self.full.slave_nodes()
    }

    fn send_instance_data(&mut self, _obj: &dyn ObjectApi, nodes: &[Arc<Node>]) {
        self.full.send_head(nodes);
    }

    fn ready_queue(&self) -> Option<Arc<MtQueue<ObjectDataIStream>>> {
        self.full.ready_queue()
    }

    fn max_version_gate(&self) -> Option<Arc<Monitor<u64>>> {
        self.full.max_version_gate()
    }

    fn commands(&self) -> &'static [ObjectCommand] {
        self.full.commands()
    }

    fn handle_command(&mut self, obj: &dyn ObjectApi, command: &Command) -> bool {
        self.full.handle_command(obj, command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{ConnectionEvent, pipe_pair};
    use crate::object::ChangeType;
    use crate::object::tests::standalone_master;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use weft_proto::ObjectId;
    use weft_proto::packet::object::ObjectDataPacket;

    async fn next_data(rx: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> (u32, Version) {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("object data")
                .expect("event");
            if let ConnectionEvent::Data(_, frame) = event {
                let packet = ObjectDataPacket::parse(&frame).unwrap();
                return (packet.command, packet.header.version);
            }
        }
    }

    #[tokio::test]
    async fn test_slaves_receive_snapshot_then_deltas() {
        let object = standalone_master(ChangeType::Delta, 5);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (a, _b) = pipe_pair(tx, Duration::from_secs(1));
        let slave = Arc::new(Node::new(NodeId(9), 1, Vec::new()));
        slave.set_connection(Some(a));

        let api = object.api();
        let packet = MapObjectPacket {
            requested_version: Version::NONE,
            min_cached_version: Version::NONE,
            max_cached_version: Version::NONE,
            object_id: ObjectId(1),
            request_id: 1,
            instance_id: InstanceId(3),
            master_instance_id: InstanceId::INVALID,
            use_cache: false,
        };
        let result = api.core().cm.write().add_slave(&*api, &slave, &packet);
        assert_eq!(result, MapResult::uncached(Version::FIRST));
        assert_eq!(
            next_data(&mut rx).await,
            (ObjectCommand::Instance as u32, Version::FIRST)
        );

        object.write().value = 6;
        assert_eq!(object.commit().await, Version::from_low(2));
        assert_eq!(
            next_data(&mut rx).await,
            (ObjectCommand::Delta as u32, Version::from_low(2))
        );
    }

    #[tokio::test]
    async fn test_clean_object_commits_nothing() {
        let object = standalone_master(ChangeType::Delta, 5);
        object.write().dirty = false;
        assert_eq!(object.commit().await, Version::FIRST);
        assert_eq!(object.oldest_version(), Version::FIRST);
    }
}
