//! Change managers.
//!
//! Every attached object owns exactly one change manager, chosen by its
//! [`ChangeType`] and by whether it is the master or a slave. Change
//! managers are swapped as a whole, never shared.
//!
//! All methods run with the object's change manager lock held; the object
//! is passed in by argument.

mod delta_master;
mod full_master;
mod null;
mod static_cm;
mod unbuffered_master;
mod versioned_slave;

pub(crate) use delta_master::DeltaMasterCm;
pub(crate) use full_master::FullMasterCm;
pub(crate) use null::NullCm;
pub(crate) use static_cm::{StaticMasterCm, StaticSlaveCm};
pub(crate) use unbuffered_master::UnbufferedMasterCm;
pub(crate) use versioned_slave::VersionedSlaveCm;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};
use weft_proto::packet::ObjectCommand;
use weft_proto::packet::node::MapObjectPacket;
use weft_proto::packet::object::{MaxVersionPacket, ObjectAddress, ObjectDataPacket};
use weft_proto::{InstanceId, NodeId, Version};

use super::{ChangeType, ObjectApi};
use crate::command::Command;
use crate::network::{Connection, Node};
use crate::stream::{ObjectDataIStream, gather_connections};
use crate::util::{Monitor, MtQueue};

/// Slaves with more queued versions than this trigger a warning.
const QUEUED_VERSIONS_WARN: usize = 100;

/// Outcome of subscribing a slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MapResult {
    /// The version the slave starts at.
    pub version: Version,
    /// First version the slave takes from its instance cache, or
    /// [`Version::INVALID`].
    pub cached_version: Version,
    pub use_cache: bool,
}

impl MapResult {
    pub(crate) fn uncached(version: Version) -> Self {
        Self {
            version,
            cached_version: Version::INVALID,
            use_cache: false,
        }
    }
}

/// The versioning state machine of one object.
pub(crate) trait ChangeManager: Send + Sync {
    fn is_master(&self) -> bool;

    /// The version currently applied (slaves) or committed (masters).
    fn version(&self) -> Version;

    fn head_version(&self) -> Version {
        self.version()
    }

    fn oldest_version(&self) -> Version {
        self.version()
    }

    fn master_instance_id(&self) -> InstanceId {
        InstanceId::INVALID
    }

    fn auto_obsolete(&self) -> u32 {
        0
    }

    fn set_auto_obsolete(&mut self, _count: u32) {}

    /// Capture the initial state of a newly registered master.
    fn init(&mut self, _obj: &dyn ObjectApi) {}

    fn commit(&mut self, obj: &dyn ObjectApi, incarnation: u32) -> Version;

    /// Subscribe `node` and send it the data it asked for.
    fn add_slave(&mut self, obj: &dyn ObjectApi, node: &Arc<Node>, packet: &MapObjectPacket) -> MapResult;

    fn remove_slave(&mut self, _node_id: NodeId, _instance_id: InstanceId) {}

    /// Drop every subscription of `node_id`.
    fn remove_slaves(&mut self, _node_id: NodeId) {}

    fn slave_nodes(&self) -> Vec<Arc<Node>> {
        Vec::new()
    }

    /// Broadcast the head version for caching only.
    fn send_instance_data(&mut self, _obj: &dyn ObjectApi, _nodes: &[Arc<Node>]) {}

    fn set_master_node(&mut self, _node_id: NodeId) {}

    fn master_node(&self) -> Option<NodeId> {
        None
    }

    /// Queue versions taken from the instance cache.
    fn add_instance_datas(&mut self, _cache: &[ObjectDataIStream], _start: Version) {}

    /// Completed versions waiting to be applied.
    fn ready_queue(&self) -> Option<Arc<MtQueue<ObjectDataIStream>>> {
        None
    }

    /// Apply one queued version.
    fn apply(&mut self, _obj: &dyn ObjectApi, _stream: &ObjectDataIStream) {}

    /// Apply the version the object was mapped at, skipping older ones.
    fn apply_map_data(&mut self, _obj: &dyn ObjectApi, _version: Version) {}

    /// Upper bound on the versions a master may commit.
    fn max_version_gate(&self) -> Option<Arc<Monitor<u64>>> {
        None
    }

    /// Object commands routed to this change manager.
    fn commands(&self) -> &'static [ObjectCommand] {
        &[]
    }

    fn handle_command(&mut self, _obj: &dyn ObjectApi, _command: &Command) -> bool {
        true
    }
}

/// The change manager variants.
pub(crate) enum ObjectCm {
    Null(NullCm),
    StaticMaster(StaticMasterCm),
    StaticSlave(StaticSlaveCm),
    FullMaster(FullMasterCm),
    DeltaMaster(DeltaMasterCm),
    UnbufferedMaster(UnbufferedMasterCm),
    VersionedSlave(VersionedSlaveCm),
}

impl ObjectCm {
    /// Master change manager for `change_type`.
    pub(crate) fn master(change_type: ChangeType, auto_obsolete: u32) -> Self {
        match change_type {
            ChangeType::None => Self::Null(NullCm),
            ChangeType::Static => Self::StaticMaster(StaticMasterCm::new()),
            ChangeType::Instance => Self::FullMaster(FullMasterCm::new(auto_obsolete)),
            ChangeType::Delta => Self::DeltaMaster(DeltaMasterCm::new(auto_obsolete)),
            ChangeType::Unbuffered => Self::UnbufferedMaster(UnbufferedMasterCm::new()),
        }
    }

    /// Slave change manager for a master of `change_type`.
    pub(crate) fn slave(change_type: ChangeType, master_instance_id: InstanceId) -> Self {
        match change_type {
            ChangeType::None => Self::Null(NullCm),
            ChangeType::Static => Self::StaticSlave(StaticSlaveCm::new(master_instance_id)),
            ChangeType::Instance | ChangeType::Delta | ChangeType::Unbuffered => {
                Self::VersionedSlave(VersionedSlaveCm::new(master_instance_id))
            }
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Null(_) => "null",
            Self::StaticMaster(_) => "static_master",
            Self::StaticSlave(_) => "static_slave",
            Self::FullMaster(_) => "full_master",
            Self::DeltaMaster(_) => "delta_master",
            Self::UnbufferedMaster(_) => "unbuffered_master",
            Self::VersionedSlave(_) => "versioned_slave",
        }
    }
}

macro_rules! delegate {
    ($self:ident, $cm:ident => $call:expr) => {
        match $self {
            ObjectCm::Null($cm) => $call,
            ObjectCm::StaticMaster($cm) => $call,
            ObjectCm::StaticSlave($cm) => $call,
            ObjectCm::FullMaster($cm) => $call,
            ObjectCm::DeltaMaster($cm) => $call,
            ObjectCm::UnbufferedMaster($cm) => $call,
            ObjectCm::VersionedSlave($cm) => $call,
        }
    };
}

impl ChangeManager for ObjectCm {
    fn is_master(&self) -> bool {
        delegate!(self, cm => cm.is_master())
    }

    fn version(&self) -> Version {
        delegate!(self, cm => cm.version())
    }

    fn head_version(&self) -> Version {
        delegate!(self, cm => cm.head_version())
    }

    fn oldest_version(&self) -> Version {
        delegate!(self, cm => cm.oldest_version())
    }

    fn master_instance_id(&self) -> InstanceId {
        delegate!(self, cm => cm.master_instance_id())
    }

    fn auto_obsolete(&self) -> u32 {
        delegate!(self, cm => cm.auto_obsolete())
    }

    fn set_auto_obsolete(&mut self, count: u32) {
        delegate!(self, cm => cm.set_auto_obsolete(count))
    }

    fn init(&mut self, obj: &dyn ObjectApi) {
        delegate!(self, cm => cm.init(obj))
    }

    fn commit(&mut self, obj: &dyn ObjectApi, incarnation: u32) -> Version {
        delegate!(self, cm => cm.commit(obj, incarnation))
    }

    fn add_slave(&mut self, obj: &dyn ObjectApi, node: &Arc<Node>, packet: &MapObjectPacket) -> MapResult {
        delegate!(self, cm => cm.add_slave(obj, node, packet))
    }

    fn remove_slave(&mut self, node_id: NodeId, instance_id: InstanceId) {
        delegate!(self, cm => cm.remove_slave(node_id, instance_id))
    }

    fn remove_slaves(&mut self, node_id: NodeId) {
        delegate!(self, cm => cm.remove_slaves(node_id))
    }

    fn slave_nodes(&self) -> Vec<Arc<Node>> {
        delegate!(self, cm => cm.slave_nodes())
    }

    fn send_instance_data(&mut self, obj: &dyn ObjectApi, nodes: &[Arc<Node>]) {
        delegate!(self, cm => cm.send_instance_data(obj, nodes))
    }

    fn set_master_node(&mut self, node_id: NodeId) {
        delegate!(self, cm => cm.set_master_node(node_id))
    }

    fn master_node(&self) -> Option<NodeId> {
        delegate!(self, cm => cm.master_node())
    }

    fn add_instance_datas(&mut self, cache: &[ObjectDataIStream], start: Version) {
        delegate!(self, cm => cm.add_instance_datas(cache, start))
    }

    fn ready_queue(&self) -> Option<Arc<MtQueue<ObjectDataIStream>>> {
        delegate!(self, cm => cm.ready_queue())
    }

    fn apply(&mut self, obj: &dyn ObjectApi, stream: &ObjectDataIStream) {
        delegate!(self, cm => cm.apply(obj, stream))
    }

    fn apply_map_data(&mut self, obj: &dyn ObjectApi, version: Version) {
        delegate!(self, cm => cm.apply_map_data(obj, version))
    }

    fn max_version_gate(&self) -> Option<Arc<Monitor<u64>>> {
        delegate!(self, cm => cm.max_version_gate())
    }

    fn commands(&self) -> &'static [ObjectCommand] {
        delegate!(self, cm => cm.commands())
    }

    fn handle_command(&mut self, obj: &dyn ObjectApi, command: &Command) -> bool {
        delegate!(self, cm => cm.handle_command(obj, command))
    }
}

// ============================================================================
// Master bookkeeping
// ============================================================================

pub(crate) const MASTER_COMMANDS: &[ObjectCommand] =
    &[ObjectCommand::SlaveDelta, ObjectCommand::MaxVersion];

struct Slave {
    node: Arc<Node>,
    instance_id: InstanceId,
}

/// Slave subscriptions, the lag gate and incoming slave commits, shared by
/// every master variant.
pub(crate) struct MasterCore {
    pub version: Version,
    slaves: Vec<Slave>,
    max_versions: HashMap<(NodeId, InstanceId), u64>,
    gate: Arc<Monitor<u64>>,
    slave_commits: Arc<MtQueue<ObjectDataIStream>>,
    pending_commits: HashMap<Version, ObjectDataIStream>,
}

impl MasterCore {
    pub fn new() -> Self {
        Self {
            version: Version::NONE,
            slaves: Vec::new(),
            max_versions: HashMap::new(),
            gate: Arc::new(Monitor::new(u64::MAX)),
            slave_commits: Arc::new(MtQueue::new()),
            pending_commits: HashMap::new(),
        }
    }

    pub fn add_slave(&mut self, node: &Arc<Node>, instance_id: InstanceId) {
        self.slaves.push(Slave {
            node: Arc::clone(node),
            instance_id,
        });
    }

    pub fn remove_slave(&mut self, node_id: NodeId, instance_id: InstanceId) {
        self.slaves
            .retain(|s| !(s.node.id() == node_id && s.instance_id == instance_id));
        self.max_versions.remove(&(node_id, instance_id));
        self.update_gate();
    }

    pub fn remove_slaves(&mut self, node_id: NodeId) {
        self.slaves.retain(|s| s.node.id() != node_id);
        self.max_versions.retain(|(node, _), _| *node != node_id);
        self.update_gate();
    }

    /// Subscribed nodes, each once.
    pub fn slave_nodes(&self) -> Vec<Arc<Node>> {
        let mut nodes: Vec<Arc<Node>> = Vec::with_capacity(self.slaves.len());
        for slave in &self.slaves {
            if !nodes.iter().any(|n| n.id() == slave.node.id()) {
                nodes.push(Arc::clone(&slave.node));
            }
        }
        nodes
    }

    pub fn slave_connections(&self) -> Vec<Connection> {
        gather_connections(&self.slave_nodes())
    }

    pub fn gate(&self) -> Arc<Monitor<u64>> {
        Arc::clone(&self.gate)
    }

    pub fn slave_commits(&self) -> Arc<MtQueue<ObjectDataIStream>> {
        Arc::clone(&self.slave_commits)
    }

    fn update_gate(&self) {
        let min = self.max_versions.values().copied().min().unwrap_or(u64::MAX);
        self.gate.set(min);
    }

    pub fn handle_command(&mut self, obj: &dyn ObjectApi, command: &Command) -> bool {
        match ObjectCommand::from_u32(command.command()) {
            Some(ObjectCommand::MaxVersion) => self.cmd_max_version(obj, command),
            Some(ObjectCommand::SlaveDelta) => self.cmd_slave_delta(obj, command),
            _ => {
                warn!(object = %obj.core().id(), command = command.command(), "Master got slave command");
                true
            }
        }
    }

    fn cmd_max_version(&mut self, obj: &dyn ObjectApi, command: &Command) -> bool {
        let (packet, Some(node)) = (command.packet::<MaxVersionPacket>(), command.node()) else {
            return true;
        };
        let packet = match packet {
            Ok(packet) => packet,
            Err(e) => {
                warn!(object = %obj.core().id(), error = %e, "Malformed max version packet");
                return true;
            }
        };
        let key = (node.id(), packet.slave_instance_id);
        if !self
            .slaves
            .iter()
            .any(|s| s.node.id() == key.0 && s.instance_id == key.1)
        {
            debug!(object = %obj.core().id(), node = %key.0, "Max version from unknown slave");
            return true;
        }
        self.max_versions.insert(key, packet.version);
        self.update_gate();
        true
    }

    fn cmd_slave_delta(&mut self, obj: &dyn ObjectApi, command: &Command) -> bool {
        let version = {
            let frame = command.frame();
            match ObjectDataPacket::parse(&frame) {
                Ok(packet) => packet.header.version,
                Err(e) => {
                    warn!(object = %obj.core().id(), error = %e, "Malformed slave commit");
                    return true;
                }
            }
        };
        let mut stream = self.pending_commits.remove(&version).unwrap_or_default();
        if let Err(e) = stream.add_data_packet(command.clone()) {
            warn!(object = %obj.core().id(), error = %e, "Dropping slave commit");
            return true;
        }
        if stream.is_ready() {
            self.slave_commits.push(stream);
            obj.notify_new_head_version(version);
        } else {
            self.pending_commits.insert(version, stream);
        }
        true
    }
}

// ============================================================================
// Slave bookkeeping
// ============================================================================

/// Reassembly and queueing of received versions, shared by the slave
/// variants.
pub(crate) struct SlaveCore {
    pub version: Version,
    pub master_node: Option<NodeId>,
    pub master_instance_id: InstanceId,
    queue: Arc<MtQueue<ObjectDataIStream>>,
    pending: Option<ObjectDataIStream>,
}

impl SlaveCore {
    pub fn new(master_instance_id: InstanceId) -> Self {
        Self {
            version: Version::NONE,
            master_node: None,
            master_instance_id,
            queue: Arc::new(MtQueue::new()),
            pending: None,
        }
    }

    pub fn queue(&self) -> Arc<MtQueue<ObjectDataIStream>> {
        Arc::clone(&self.queue)
    }

    /// Add one received data packet; queue the version once complete.
    pub fn add_data_packet(&mut self, obj: &dyn ObjectApi, command: &Command) -> bool {
        let mut stream = self.pending.take().unwrap_or_default();
        if let Err(e) = stream.add_data_packet(command.clone()) {
            warn!(object = %obj.core().id(), error = %e, "Dropping malformed object data");
            return true;
        }
        if !stream.is_ready() {
            self.pending = Some(stream);
            return true;
        }

        let version = stream.version();
        self.queue.push(stream);
        let queued = self.queue.len();
        if queued > QUEUED_VERSIONS_WARN {
            warn!(object = %obj.core().id(), queued, "Slave is falling behind its master");
        }
        obj.notify_new_head_version(version);
        true
    }

    /// Merge cached versions from `start` on into the queue, ahead of or
    /// behind what the master sent.
    pub fn add_instance_datas(&mut self, cache: &[ObjectDataIStream], start: Version) {
        let oldest = self.queue.front().map(|s| s.version()).unwrap_or(Version::NONE);
        let newest = self.queue.back().map(|s| s.version()).unwrap_or(Version::NONE);

        let mut head = Vec::new();
        for stream in cache {
            let version = stream.version();
            if version < start {
                continue;
            }
            if !stream.is_ready() {
                break;
            }
            if version < oldest {
                head.push(stream.clone());
            } else if version > newest {
                self.queue.push(stream.clone());
            }
        }
        for stream in head.into_iter().rev() {
            self.queue.push_front(stream);
        }
    }

    /// Pop queued versions up to `version`, returning that one.
    pub fn pop_map_data(&mut self, obj: &dyn ObjectApi, version: Version) -> Option<ObjectDataIStream> {
        while let Some(stream) = self.queue.try_pop() {
            if stream.version() == version {
                return Some(stream);
            }
            debug!(
                object = %obj.core().id(),
                skipped = %stream.version(),
                mapped = %version,
                "Skipping version older than the mapped one"
            );
        }
        None
    }

    /// Tell the master how far it may run ahead.
    pub fn send_max_version(&self, obj: &dyn ObjectApi) {
        let max_versions = obj.max_versions();
        if max_versions == u64::MAX {
            return;
        }
        let Some(master) = self.master(obj) else {
            return;
        };
        let core = obj.core();
        master.send_packet(&MaxVersionPacket {
            address: ObjectAddress::new(core.id(), self.master_instance_id),
            version: self.version.low.saturating_add(max_versions),
            slave_instance_id: core.instance_id(),
        });
    }

    /// The master's node entry, if still known.
    pub fn master(&self, obj: &dyn ObjectApi) -> Option<Arc<Node>> {
        let node_id = self.master_node?;
        obj.core().local_node()?.get_node(node_id)
    }
}
