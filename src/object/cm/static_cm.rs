//! Change managers of objects that never change after registration.

use std::sync::Arc;

use tracing::warn;
use weft_proto::packet::ObjectCommand;
use weft_proto::packet::node::MapObjectPacket;
use weft_proto::{InstanceId, NodeId, Version};

use super::{ChangeManager, MapResult, MasterCore, SlaveCore};
use crate::command::Command;
use crate::network::Node;
use crate::object::ObjectApi;
use crate::stream::{DataOStream, ObjectDataIStream, gather_connections};

pub(crate) struct StaticMasterCm {
    core: MasterCore,
    snapshot: Option<DataOStream>,
}

impl StaticMasterCm {
    pub fn new() -> Self {
        Self {
            core: MasterCore::new(),
            snapshot: None,
        }
    }
}

impl ChangeManager for StaticMasterCm {
    fn is_master(&self) -> bool {
        true
    }

    fn version(&self) -> Version {
        self.core.version
    }

    fn init(&mut self, obj: &dyn ObjectApi) {
        self.core.version = Version::FIRST;
        self.snapshot = Some(obj.core().snapshot(obj, Version::FIRST));
    }

    fn commit(&mut self, obj: &dyn ObjectApi, _incarnation: u32) -> Version {
        warn!(object = %obj.core().id(), "Commit of a static object");
        self.core.version
    }

    fn add_slave(&mut self, _obj: &dyn ObjectApi, node: &Arc<Node>, packet: &MapObjectPacket) -> MapResult {
        self.core.add_slave(node, packet.instance_id);
        let (Some(os), Some(connection)) = (self.snapshot.as_mut(), node.connection()) else {
            warn!(node = %node.id(), "Cannot send static instance data");
            return MapResult::uncached(self.core.version);
        };
        os.set_instance_id(packet.instance_id);
        os.set_node_id(node.id());
        os.resend(vec![connection]);
        os.set_instance_id(InstanceId::ALL);
        os.set_node_id(NodeId::ZERO);
        MapResult::uncached(self.core.version)
    }

    fn remove_slave(&mut self, node_id: NodeId, instance_id: InstanceId) {
        self.core.remove_slave(node_id, instance_id);
    }

    fn remove_slaves(&mut self, node_id: NodeId) {
        self.core.remove_slaves(node_id);
    }

    fn slave_nodes(&self) -> Vec<Arc<Node>> {
        self.core.slave_nodes()
    }

    fn send_instance_data(&mut self, _obj: &dyn ObjectApi, nodes: &[Arc<Node>]) {
        if let Some(os) = self.snapshot.as_mut() {
            os.set_instance_id(InstanceId::NONE);
            os.resend(gather_connections(nodes));
            os.set_instance_id(InstanceId::ALL);
        }
    }
}

pub(crate) struct StaticSlaveCm {
    core: SlaveCore,
}

impl StaticSlaveCm {
    pub fn new(master_instance_id: InstanceId) -> Self {
        Self {
            core: SlaveCore::new(master_instance_id),
        }
    }
}

impl ChangeManager for StaticSlaveCm {
    fn is_master(&self) -> bool {
        false
    }

    fn version(&self) -> Version {
        self.core.version
    }

    fn master_instance_id(&self) -> InstanceId {
        self.core.master_instance_id
    }

    fn commit(&mut self, obj: &dyn ObjectApi, _incarnation: u32) -> Version {
        warn!(object = %obj.core().id(), "Commit of a static slave");
        Version::NONE
    }

    fn add_slave(&mut self, obj: &dyn ObjectApi, node: &Arc<Node>, _packet: &MapObjectPacket) -> MapResult {
        warn!(object = %obj.core().id(), node = %node.id(), "Map request sent to a slave copy");
        MapResult::uncached(Version::INVALID)
    }

    fn set_master_node(&mut self, node_id: NodeId) {
        self.core.master_node = Some(node_id);
    }

    fn master_node(&self) -> Option<NodeId> {
        self.core.master_node
    }

    fn add_instance_datas(&mut self, cache: &[ObjectDataIStream], start: Version) {
        self.core.add_instance_datas(cache, start);
    }

    fn apply_map_data(&mut self, obj: &dyn ObjectApi, version: Version) {
        let Some(stream) = self.core.pop_map_data(obj, version) else {
            warn!(object = %obj.core().id(), %version, "Static instance data missing");
            return;
        };
        obj.apply_instance_data(&mut stream.reader());
        self.core.version = version;
        obj.notify_new_version();
    }

    fn commands(&self) -> &'static [ObjectCommand] {
        &[ObjectCommand::Instance]
    }

    fn handle_command(&mut self, obj: &dyn ObjectApi, command: &Command) -> bool {
        self.core.add_data_packet(obj, command)
    }
}
