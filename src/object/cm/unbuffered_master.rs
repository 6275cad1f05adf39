//! Delta master without history.

use std::sync::Arc;

use tracing::{debug, warn};
use weft_proto::packet::ObjectCommand;
use weft_proto::packet::node::MapObjectPacket;
use weft_proto::{InstanceId, NodeId, Version};

use super::{ChangeManager, MASTER_COMMANDS, MapResult, MasterCore};
use crate::command::Command;
use crate::network::Node;
use crate::object::ObjectApi;
use crate::stream::{ObjectDataIStream, gather_connections};
use crate::util::{Monitor, MtQueue};

/// Commits send `pack` output only. New slaves always start at the head,
/// from a snapshot taken when they map.
pub(crate) struct UnbufferedMasterCm {
    core: MasterCore,
}

impl UnbufferedMasterCm {
    pub fn new() -> Self {
        Self {
            core: MasterCore::new(),
        }
    }
}

impl ChangeManager for UnbufferedMasterCm {
    fn is_master(&self) -> bool {
        true
    }

    fn version(&self) -> Version {
        self.core.version
    }

    fn init(&mut self, _obj: &dyn ObjectApi) {
        self.core.version = Version::FIRST;
    }

    fn commit(&mut self, obj: &dyn ObjectApi, _incarnation: u32) -> Version {
        if !obj.is_dirty() {
            return self.core.version;
        }
        let next = self.core.version.next();
        let mut delta = obj.core().ostream(obj, ObjectCommand::Delta, InstanceId::ALL);
        delta.set_version(next);
        delta.enable(self.core.slave_connections());
        obj.pack(&mut delta);
        delta.disable();
        if !delta.has_sent_data() {
            return self.core.version;
        }

        self.core.version = next;
        crate::metrics::record_commit();
        debug!(object = %obj.core().id(), version = %next, "Committed delta");
        next
    }

    fn add_slave(&mut self, obj: &dyn ObjectApi, node: &Arc<Node>, packet: &MapObjectPacket) -> MapResult {
        self.core.add_slave(node, packet.instance_id);
        let head = self.core.version;
        let Some(connection) = node.connection() else {
            warn!(node = %node.id(), "Slave has no connection, cannot send map data");
            return MapResult::uncached(head);
        };
        let mut os = obj.core().snapshot(obj, head);
        os.set_instance_id(packet.instance_id);
        os.set_node_id(node.id());
        os.resend(vec![connection]);
        MapResult::uncached(head)
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

    fn send_instance_data(&mut self, obj: &dyn ObjectApi, nodes: &[Arc<Node>]) {
        let mut os = obj.core().snapshot(obj, self.core.version);
        os.set_instance_id(InstanceId::NONE);
        os.resend(gather_connections(nodes));
    }

    fn ready_queue(&self) -> Option<Arc<MtQueue<ObjectDataIStream>>> {
        Some(self.core.slave_commits())
    }

    fn max_version_gate(&self) -> Option<Arc<Monitor<u64>>> {
        Some(self.core.gate())
    }

    fn commands(&self) -> &'static [ObjectCommand] {
        MASTER_COMMANDS
    }

    fn handle_command(&mut self, obj: &dyn ObjectApi, command: &Command) -> bool {
        self.core.handle_command(obj, command)
    }
}
