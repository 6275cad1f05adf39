//! Slave of any versioned master.

use std::sync::Arc;

use tracing::{debug, warn};
use weft_proto::packet::ObjectCommand;
use weft_proto::packet::node::MapObjectPacket;
use weft_proto::{InstanceId, NodeId, Version};

use super::{ChangeManager, MapResult, SlaveCore};
use crate::command::Command;
use crate::network::Node;
use crate::object::ObjectApi;
use crate::stream::ObjectDataIStream;
use crate::util::MtQueue;

/// Queues received versions and applies them strictly in order. Commits
/// send the packed changes back to the master.
pub(crate) struct VersionedSlaveCm {
    core: SlaveCore,
}

impl VersionedSlaveCm {
    pub fn new(master_instance_id: InstanceId) -> Self {
        Self {
            core: SlaveCore::new(master_instance_id),
        }
    }

    fn finish_apply(&mut self, obj: &dyn ObjectApi, version: Version) {
        self.core.version = version;
        self.core.send_max_version(obj);
        obj.notify_new_version();
    }
}

/// Versions of slave commits: random, with the top bit set so they never
/// collide with master versions.
fn slave_commit_version() -> Version {
    let mut high = rand::random::<u64>() | (1 << 63);
    if high == u64::MAX {
        high -= 1;
    }
    Version::new(high, rand::random())
}

impl ChangeManager for VersionedSlaveCm {
    fn is_master(&self) -> bool {
        false
    }

    fn version(&self) -> Version {
        self.core.version
    }

    fn head_version(&self) -> Version {
        self.core
            .queue()
            .back()
            .map(|stream| stream.version())
            .unwrap_or(self.core.version)
    }

    fn master_instance_id(&self) -> InstanceId {
        self.core.master_instance_id
    }

    fn commit(&mut self, obj: &dyn ObjectApi, _incarnation: u32) -> Version {
        let Some(connection) = self.core.master(obj).and_then(|master| master.connection()) else {
            warn!(object = %obj.core().id(), "Slave commit without a connected master");
            return Version::NONE;
        };
        let version = slave_commit_version();
        let mut os = obj
            .core()
            .ostream(obj, ObjectCommand::SlaveDelta, self.core.master_instance_id);
        os.set_version(version);
        os.enable(vec![connection]);
        obj.pack(&mut os);
        os.disable();
        if !os.has_sent_data() {
            return Version::NONE;
        }
        debug!(object = %obj.core().id(), %version, "Committed slave changes");
        version
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

    fn ready_queue(&self) -> Option<Arc<MtQueue<ObjectDataIStream>>> {
        Some(self.core.queue())
    }

    /// # Panics
    ///
    /// Panics if `stream` is not the version after the current one.
    fn apply(&mut self, obj: &dyn ObjectApi, stream: &ObjectDataIStream) {
        let expected = self.core.version.next();
        assert!(
            stream.version() == expected,
            "object {} applies version {} but expected {}",
            obj.core().id(),
            stream.version(),
            expected
        );
        let mut reader = stream.reader();
        if stream.has_instance_data() {
            obj.apply_instance_data(&mut reader);
        } else {
            obj.unpack(&mut reader);
        }
        self.finish_apply(obj, stream.version());
    }

    fn apply_map_data(&mut self, obj: &dyn ObjectApi, version: Version) {
        let Some(stream) = self.core.pop_map_data(obj, version) else {
            warn!(object = %obj.core().id(), %version, "Mapped version was not received");
            return;
        };
        obj.apply_instance_data(&mut stream.reader());
        self.finish_apply(obj, version);
    }

    fn commands(&self) -> &'static [ObjectCommand] {
        &[ObjectCommand::Instance, ObjectCommand::Delta]
    }

    fn handle_command(&mut self, obj: &dyn ObjectApi, command: &Command) -> bool {
        self.core.add_data_packet(obj, command)
    }
}
