//! Master that keeps full snapshots of recent versions.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, warn};
use weft_proto::packet::ObjectCommand;
use weft_proto::packet::node::MapObjectPacket;
use weft_proto::{InstanceId, NodeId, Version};

use super::{ChangeManager, MASTER_COMMANDS, MapResult, MasterCore};
use crate::command::Command;
use crate::network::Node;
use crate::object::{COMMIT_NEXT, ObjectApi};
use crate::stream::{DataOStream, ObjectDataIStream, gather_connections};
use crate::util::{Monitor, MtQueue};

/// One retained version.
pub(crate) struct InstanceData {
    pub os: DataOStream,
    pub commit_count: u32,
}

/// Sends the complete instance data on every commit and keeps a bounded
/// history of snapshots for slaves that map an older version.
pub(crate) struct FullMasterCm {
    pub(super) core: MasterCore,
    pub(super) instance_datas: VecDeque<InstanceData>,
    pub(super) commit_count: u32,
    pub(super) n_versions: u32,
}

impl FullMasterCm {
    pub fn new(auto_obsolete: u32) -> Self {
        Self {
            core: MasterCore::new(),
            instance_datas: VecDeque::new(),
            commit_count: 0,
            n_versions: auto_obsolete,
        }
    }

    pub(super) fn advance_commit_count(&mut self, incarnation: u32) {
        self.commit_count = if incarnation == COMMIT_NEXT {
            self.commit_count.saturating_add(1)
        } else {
            incarnation
        };
    }

    pub(super) fn retain(&mut self, os: DataOStream) {
        self.instance_datas.push_back(InstanceData {
            os,
            commit_count: self.commit_count,
        });
    }

    /// Drop snapshots older than the retained commit incarnations.
    pub(super) fn obsolete(&mut self) {
        if self.commit_count <= self.n_versions {
            return;
        }
        let min_commit = self.commit_count - self.n_versions;
        while self.instance_datas.len() > 1
            && self
                .instance_datas
                .front()
                .is_some_and(|data| data.commit_count < min_commit)
        {
            self.instance_datas.pop_front();
        }
    }

    /// Resend the snapshots `start..=end` to one slave instance.
    pub(super) fn send_range(&mut self, node: &Arc<Node>, instance_id: InstanceId, start: Version, end: Version) {
        let Some(connection) = node.connection() else {
            warn!(node = %node.id(), "Slave has no connection, cannot send map data");
            return;
        };
        for data in self.instance_datas.iter_mut() {
            let version = data.os.version();
            if version < start || version > end {
                continue;
            }
            data.os.set_instance_id(instance_id);
            data.os.set_node_id(node.id());
            data.os.resend(vec![connection.clone()]);
            data.os.set_instance_id(InstanceId::ALL);
            data.os.set_node_id(NodeId::ZERO);
        }
    }

    /// Subscribe a slave and replay the history it asked for, minus the
    /// versions it already holds in its instance cache.
    pub(super) fn map_from_history(
        &mut self,
        obj: &dyn ObjectApi,
        node: &Arc<Node>,
        packet: &MapObjectPacket,
    ) -> MapResult {
        self.core.add_slave(node, packet.instance_id);
        let head = self.core.version;
        let requested = packet.requested_version;
        if requested == Version::NONE {
            self.send_range(node, packet.instance_id, head, head);
            return MapResult::uncached(head);
        }

        let oldest = self.oldest_version();
        let start = if requested == Version::OLDEST || requested < oldest {
            oldest
        } else {
            requested
        };
        let mut first = start;
        let mut end = head;
        let use_cache = packet.use_cache && packet.master_instance_id == obj.core().instance_id();
        if use_cache {
            if packet.min_cached_version <= start && packet.max_cached_version >= start {
                first = packet.max_cached_version.next();
            } else if packet.max_cached_version == end {
                end = start.max(packet.min_cached_version.prev());
            }
        }

        debug!(
            object = %obj.core().id(),
            node = %node.id(),
            %start,
            sending = %format_args!("{first}..{end}"),
            "Mapping slave"
        );
        self.send_range(node, packet.instance_id, first, end);
        MapResult {
            version: start,
            cached_version: if use_cache { start } else { Version::INVALID },
            use_cache,
        }
    }

    pub(super) fn send_head(&mut self, nodes: &[Arc<Node>]) {
        let connections = gather_connections(nodes);
        if let Some(head) = self.instance_datas.back_mut() {
            head.os.set_instance_id(InstanceId::NONE);
            head.os.resend(connections);
            head.os.set_instance_id(InstanceId::ALL);
        }
    }
}

impl ChangeManager for FullMasterCm {
    fn is_master(&self) -> bool {
        true
    }

    fn version(&self) -> Version {
        self.core.version
    }

    fn oldest_version(&self) -> Version {
        self.instance_datas
            .front()
            .map(|data| data.os.version())
            .unwrap_or(self.core.version)
    }

    fn auto_obsolete(&self) -> u32 {
        self.n_versions
    }

    fn set_auto_obsolete(&mut self, count: u32) {
        self.n_versions = count;
        self.obsolete();
    }

    fn init(&mut self, obj: &dyn ObjectApi) {
        self.core.version = Version::FIRST;
        self.commit_count = 1;
        self.instance_datas.clear();
        let os = obj.core().snapshot(obj, Version::FIRST);
        self.retain(os);
    }

    fn commit(&mut self, obj: &dyn ObjectApi, incarnation: u32) -> Version {
        self.advance_commit_count(incarnation);
        if !obj.is_dirty() {
            self.obsolete();
            return self.core.version;
        }

        let next = self.core.version.next();
        let mut os = obj.core().snapshot(obj, next);
        if self
            .instance_datas
            .back()
            .is_some_and(|head| head.os.buffer() == os.buffer())
        {
            self.obsolete();
            return self.core.version;
        }

        os.resend(self.core.slave_connections());
        self.retain(os);
        self.core.version = next;
        self.obsolete();
        crate::metrics::record_commit();
        debug!(object = %obj.core().id(), version = %next, "Committed");
        next
    }

    fn add_slave(&mut self, obj: &dyn ObjectApi, node: &Arc<Node>, packet: &MapObjectPacket) -> MapResult {
        self.map_from_history(obj, node, packet)
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
        self.send_head(nodes);
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
