//! Distributed barrier.
//!
//! A barrier is a delta object holding its height and the node running
//! the master copy. Participants send ENTER to the master, which releases
//! all of them once `height` participants entered the same version.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};
use weft_proto::packet::Packet;
use weft_proto::packet::object::{BarrierEnterPacket, BarrierEnterReplyPacket, ObjectAddress};
use weft_proto::{InstanceId, NodeId, Version};

use super::{ChangeType, Distributed, Object};
use crate::command::{Command, Handler};
use crate::error::{NodeError, NodeResult, TimeoutKind};
use crate::network::local_node::LocalNodeInner;
use crate::network::{LocalNode, Node};
use crate::stream::{DataIStream, DataOStream};
use crate::util::Monitor;

/// ENTER timeout meaning "wait forever".
const TIMEOUT_INDEFINITE: u32 = u32::MAX;

/// Distributed state of a [`Barrier`].
#[derive(Debug)]
pub struct BarrierData {
    height: u32,
    master_id: NodeId,
    /// Releases seen by local participants.
    leave: Arc<Monitor<u32>>,
}

impl BarrierData {
    fn new(master_id: NodeId, height: u32) -> Self {
        Self {
            height,
            master_id,
            leave: Arc::new(Monitor::new(0)),
        }
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn master_id(&self) -> NodeId {
        self.master_id
    }
}

impl Distributed for BarrierData {
    fn change_type(&self) -> ChangeType {
        ChangeType::Delta
    }

    fn get_instance_data(&self, os: &mut DataOStream) {
        os.write(&self.height);
        os.write(&self.master_id);
        self.leave.set(0);
    }

    fn apply_instance_data(&mut self, is: &mut DataIStream) {
        self.height = is.read();
        self.master_id = is.read();
        self.leave.set(0);
    }

    fn pack(&mut self, os: &mut DataOStream) {
        os.write(&self.height);
        self.leave.set(0);
    }

    fn unpack(&mut self, is: &mut DataIStream) {
        self.height = is.read();
        self.leave.set(0);
    }
}

// ============================================================================
// Master bookkeeping
// ============================================================================

/// Participants of one barrier version.
struct EnterRecord {
    nodes: Vec<Arc<Node>>,
    /// Local-node time of the last ENTER, in milliseconds.
    time: u64,
    incarnation: u32,
    timeout: u32,
}

/// Participants to notify for `version`.
#[derive(Debug, Default)]
struct Release {
    version: Version,
    nodes: Vec<Arc<Node>>,
}

/// One ENTER as seen by the master.
struct Enter {
    version: Version,
    incarnation: u32,
    timeout: u32,
    node: Arc<Node>,
    time: u64,
}

/// Per-version ENTER records kept by the master copy.
#[derive(Default)]
struct EnterRecords {
    records: BTreeMap<Version, EnterRecord>,
}

impl EnterRecords {
    /// Record an ENTER against the master at `current` with `height`
    /// participants. Returns who to release, if anybody.
    ///
    /// An ENTER for a version the master has not reached yet stays
    /// recorded until another ENTER for that version arrives after the
    /// master synced to it.
    fn enter(&mut self, enter: Enter, current: Version, height: u32, default_timeout: Duration) -> Release {
        let Enter {
            version,
            incarnation,
            timeout,
            node,
            time,
        } = enter;

        let record = self.records.entry(version).or_insert_with(|| EnterRecord {
            nodes: Vec::new(),
            time,
            incarnation,
            timeout,
        });
        record.time = time;

        if record.nodes.is_empty() {
            record.incarnation = incarnation;
            record.timeout = timeout;
        } else if record.timeout != TIMEOUT_INDEFINITE {
            if record.incarnation < incarnation {
                // The record belongs to an older, timed out round.
                return Release {
                    version,
                    nodes: vec![node],
                };
            }
            if record.incarnation != incarnation {
                record.nodes.clear();
                record.incarnation = incarnation;
                record.timeout = timeout;
            }
        }
        record.nodes.push(Arc::clone(&node));
        let record_timeout = record.timeout;

        if record_timeout != TIMEOUT_INDEFINITE {
            self.cleanup(time, default_timeout);
        }

        if version > current {
            debug!(%version, %current, "Barrier entered ahead of master version");
            return Release::default();
        }
        // The entering node is answered at once; its record stays until
        // cleanup drops it.
        if timeout != TIMEOUT_INDEFINITE && version < current {
            return Release {
                version,
                nodes: vec![node],
            };
        }

        let Some(record) = self.records.get(&version) else {
            return Release::default();
        };
        if record.nodes.len() < height as usize {
            return Release::default();
        }

        let Some(mut record) = self.records.remove(&version) else {
            return Release::default();
        };
        record.nodes.sort_by_key(|node| node.id());
        record.nodes.dedup_by_key(|node| node.id());
        debug!(%version, participants = record.nodes.len(), "Barrier reached");
        Release {
            version,
            nodes: record.nodes,
        }
    }

    /// Drop one stale timed record, if several are outstanding.
    fn cleanup(&mut self, time: u64, default_timeout: Duration) {
        if self.records.len() < 2 {
            return;
        }
        let stale = self.records.iter().find_map(|(version, record)| {
            if record.timeout == TIMEOUT_INDEFINITE {
                return None;
            }
            let timeout = if record.timeout == 0 {
                default_timeout.as_millis() as u64
            } else {
                u64::from(record.timeout)
            };
            (time > record.time + timeout).then_some(*version)
        });
        if let Some(version) = stale {
            debug!(%version, "Dropping stale barrier record");
            self.records.remove(&version);
        }
    }

    fn len(&self) -> usize {
        self.records.len()
    }
}

// ============================================================================
// Barrier
// ============================================================================

/// A barrier shared by `height` participants.
///
/// Create it with the master node and height, [`register`](Self::register)
/// it there and [`map`](Self::map) it on every other participating node.
#[derive(Clone)]
pub struct Barrier {
    object: Object<BarrierData>,
    records: Arc<Mutex<EnterRecords>>,
    handlers: Arc<AtomicBool>,
}

impl Barrier {
    pub fn new(master_id: NodeId, height: u32) -> Self {
        assert!(height > 0, "barrier height must be positive");
        Self {
            object: Object::new(BarrierData::new(master_id, height)),
            records: Arc::new(Mutex::new(EnterRecords::default())),
            handlers: Arc::new(AtomicBool::new(false)),
        }
    }

    /// An unmapped barrier, to be filled by [`map`](Self::map).
    pub fn unmapped() -> Self {
        let barrier = Self::new(NodeId::ZERO, 1);
        barrier.object.write().height = 0;
        barrier
    }

    pub fn object(&self) -> &Object<BarrierData> {
        &self.object
    }

    pub fn height(&self) -> u32 {
        self.object.read().height
    }

    /// Change the height; takes effect with the next commit.
    pub fn set_height(&self, height: u32) {
        self.object.write().height = height;
    }

    pub fn master_id(&self) -> NodeId {
        self.object.read().master_id
    }

    pub fn version(&self) -> Version {
        self.object.version()
    }

    pub async fn commit(&self) -> Version {
        self.object.commit().await
    }

    pub async fn sync(&self, version: Version) -> Version {
        self.object.sync(version).await
    }

    /// Make this the master copy on `node`.
    pub fn register(&self, node: &LocalNode) -> bool {
        self.install_handlers(node.inner());
        node.register_object(&self.object)
    }

    /// Map the barrier `id` at the master's oldest version.
    pub async fn map(&self, node: &LocalNode, id: weft_proto::ObjectId) -> bool {
        self.install_handlers(node.inner());
        node.map_object(&self.object, id, Version::OLDEST).await
    }

    fn install_handlers(&self, local: &Arc<LocalNodeInner>) {
        if self.handlers.swap(true, Ordering::AcqRel) {
            return;
        }
        let queue = Some(local.command_queue());

        let weak = self.object.downgrade();
        let records = Arc::clone(&self.records);
        let enter: Handler = Arc::new(move |command: &Command| {
            if let Some(object) = Object::upgrade(&weak) {
                cmd_enter(&object, &records, command);
            }
            true
        });

        let weak = self.object.downgrade();
        let reply: Handler = Arc::new(move |command: &Command| {
            if let Some(object) = Object::upgrade(&weak) {
                cmd_enter_reply(&object, command);
            }
            true
        });

        for (command, handler) in [
            (BarrierEnterPacket::COMMAND, enter),
            (BarrierEnterReplyPacket::COMMAND, reply),
        ] {
            if let Err(e) = self.object.register_command(command, handler, queue.clone()) {
                warn!(command, error = %e, "Cannot register barrier handler");
            }
        }
    }

    /// Wait until `height` participants entered this version.
    ///
    /// `None` waits forever. Fails with a barrier timeout when the wait
    /// runs out, or when the master node cannot be reached.
    pub async fn enter(&self, timeout: Option<Duration>) -> NodeResult<()> {
        let (height, master_id, leave) = {
            let data = self.object.read();
            (data.height, data.master_id, Arc::clone(&data.leave))
        };
        assert!(height > 0, "enter of an unmapped barrier");
        if height == 1 {
            return Ok(());
        }

        let Some(local) = self.object.local_node() else {
            warn!(barrier = %self.object.id(), "Barrier is not attached to a node");
            return Err(NodeError::NotListening);
        };
        let Some(master) = local.connect(master_id).await else {
            warn!(barrier = %self.object.id(), master = %master_id, "Cannot connect barrier master");
            return Err(NodeError::NotFound(master_id));
        };

        let version = self.object.version();
        let incarnation = leave.get();
        let target = incarnation + 1;
        let packet = BarrierEnterPacket {
            address: ObjectAddress::new(self.object.id(), self.object.master_instance_id()),
            version,
            incarnation,
            timeout: timeout
                .map(|t| u32::try_from(t.as_millis()).unwrap_or(TIMEOUT_INDEFINITE - 1).max(1))
                .unwrap_or(TIMEOUT_INDEFINITE),
        };
        debug!(barrier = %self.object.id(), %version, height, "Entering barrier");
        if !master.send_packet(&packet) {
            return Err(NodeError::Closed);
        }

        match timeout {
            None => {
                leave.wait_ge(target).await;
            }
            Some(timeout) => {
                if leave.timed_wait_ge(target, timeout).await.is_none() {
                    let err = NodeError::Timeout(TimeoutKind::Barrier);
                    crate::metrics::record_error(err.error_code());
                    return Err(err);
                }
            }
        }
        debug!(barrier = %self.object.id(), %version, "Left barrier");
        Ok(())
    }

    /// Outstanding ENTER records on the master copy.
    pub fn pending_records(&self) -> usize {
        self.records.lock().len()
    }
}

fn cmd_enter(object: &Object<BarrierData>, records: &Mutex<EnterRecords>, command: &Command) {
    let packet = match command.packet::<BarrierEnterPacket>() {
        Ok(packet) => packet,
        Err(e) => {
            warn!(error = %e, "Malformed barrier enter");
            return;
        }
    };
    let Some(node) = command.node() else {
        return;
    };
    let Some(local) = object.local_node() else {
        return;
    };

    let (height, leave) = {
        let data = object.read();
        (data.height, Arc::clone(&data.leave))
    };
    let current = object.version();
    let release = records.lock().enter(
        Enter {
            version: packet.version,
            incarnation: packet.incarnation,
            timeout: packet.timeout,
            node,
            time: local.get_time(),
        },
        current,
        height,
        local.config().timeouts.default_timeout(),
    );

    for node in release.nodes {
        if node.is_local() {
            if release.version == current {
                leave.increment();
            }
            continue;
        }
        debug!(barrier = %object.id(), node = %node.id(), "Releasing participant");
        node.send_packet(&BarrierEnterReplyPacket {
            address: ObjectAddress::new(object.id(), InstanceId::ALL),
            version: release.version,
        });
    }
}

fn cmd_enter_reply(object: &Object<BarrierData>, command: &Command) {
    let packet = match command.packet::<BarrierEnterReplyPacket>() {
        Ok(packet) => packet,
        Err(e) => {
            warn!(error = %e, "Malformed barrier reply");
            return;
        }
    };
    if packet.version == object.version() {
        let leave = Arc::clone(&object.read().leave);
        leave.increment();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_proto::ObjectId;
    use weft_proto::packet::ObjectCommand;

    fn node(id: u128) -> Arc<Node> {
        Arc::new(Node::new(NodeId(id), 1, Vec::new()))
    }

    fn enter(version: u64, node: Arc<Node>, timeout: u32, incarnation: u32, time: u64) -> Enter {
        Enter {
            version: Version::from_low(version),
            incarnation,
            timeout,
            node,
            time,
        }
    }

    const DEFAULT: Duration = Duration::from_secs(1);

    // ========================================================================
    // Enter records
    // ========================================================================

    #[test]
    fn test_release_when_height_reached() {
        let mut records = EnterRecords::default();
        let v1 = Version::FIRST;
        for id in [3, 1] {
            let release = records.enter(enter(1, node(id), TIMEOUT_INDEFINITE, 0, 0), v1, 3, DEFAULT);
            assert!(release.nodes.is_empty());
        }
        let release = records.enter(enter(1, node(2), TIMEOUT_INDEFINITE, 0, 0), v1, 3, DEFAULT);
        let ids: Vec<NodeId> = release.nodes.iter().map(|n| n.id()).collect();
        assert_eq!(ids, vec![NodeId(1), NodeId(2), NodeId(3)]);
        assert_eq!(release.version, v1);
        assert_eq!(records.len(), 0);
    }

    #[test]
    fn test_duplicate_participants_are_released_once() {
        let mut records = EnterRecords::default();
        let a = node(1);
        records.enter(enter(1, Arc::clone(&a), TIMEOUT_INDEFINITE, 0, 0), Version::FIRST, 2, DEFAULT);
        let release = records.enter(enter(1, a, TIMEOUT_INDEFINITE, 0, 0), Version::FIRST, 2, DEFAULT);
        assert_eq!(release.nodes.len(), 1);
    }

    /// ENTERs for a version the master has not synced to are only
    /// evaluated when a later ENTER for that version arrives. A group whose
    /// last participant entered early waits until somebody enters again.
    #[test]
    fn test_early_enter_is_deferred() {
        let mut records = EnterRecords::default();
        let v2 = Version::from_low(2);
        records.enter(enter(2, node(1), TIMEOUT_INDEFINITE, 0, 0), Version::FIRST, 2, DEFAULT);
        let release = records.enter(enter(2, node(2), TIMEOUT_INDEFINITE, 0, 0), Version::FIRST, 2, DEFAULT);
        assert!(release.nodes.is_empty(), "released before the master reached the version");
        assert_eq!(records.len(), 1);

        let release = records.enter(enter(2, node(3), TIMEOUT_INDEFINITE, 0, 0), v2, 2, DEFAULT);
        assert_eq!(release.nodes.len(), 3);
    }

    #[test]
    fn test_old_version_with_timeout_is_released_at_once() {
        let mut records = EnterRecords::default();
        let release = records.enter(enter(1, node(1), 500, 0, 0), Version::from_low(3), 4, DEFAULT);
        assert_eq!(release.version, Version::FIRST);
        assert_eq!(release.nodes.len(), 1);
        assert_eq!(release.nodes[0].id(), NodeId(1));
        assert_eq!(records.len(), 1, "record kept for cleanup");

        // A second late participant is answered alone.
        let release = records.enter(enter(1, node(2), 500, 0, 10), Version::from_low(3), 4, DEFAULT);
        assert_eq!(release.nodes.len(), 1);
        assert_eq!(release.nodes[0].id(), NodeId(2));
        assert_eq!(records.records[&Version::FIRST].nodes.len(), 2);
    }

    #[test]
    fn test_new_incarnation_resets_timed_record() {
        let mut records = EnterRecords::default();
        records.enter(enter(1, node(1), 500, 1, 0), Version::FIRST, 2, DEFAULT);
        // A different incarnation restarts the round.
        let release = records.enter(enter(1, node(2), 500, 0, 10), Version::FIRST, 2, DEFAULT);
        assert_eq!(release.nodes.len(), 0);

        let mut records = EnterRecords::default();
        records.enter(enter(1, node(1), 500, 0, 0), Version::FIRST, 3, DEFAULT);
        let release = records.enter(enter(1, node(2), 500, 1, 10), Version::FIRST, 3, DEFAULT);
        assert_eq!(release.nodes.len(), 1, "stale round answered directly");
    }

    #[test]
    fn test_cleanup_drops_stale_timed_record() {
        let mut records = EnterRecords::default();
        records.enter(enter(1, node(1), 100, 0, 0), Version::from_low(5), 2, DEFAULT);
        records.enter(enter(5, node(2), 100, 0, 1_000), Version::from_low(5), 2, DEFAULT);
        assert_eq!(records.len(), 1);
    }

    // ========================================================================
    // Barrier object
    // ========================================================================

    #[tokio::test]
    async fn test_height_one_returns_at_once() {
        let barrier = Barrier::new(NodeId(1), 1);
        barrier.enter(Some(Duration::from_millis(1))).await.unwrap();
    }

    #[test]
    fn test_pack_carries_height_only() {
        let barrier = Barrier::new(NodeId(9), 4);
        let mut os = DataOStream::for_object(
            ObjectCommand::Delta,
            ObjectAddress::new(ObjectId(1), InstanceId::ALL),
            InstanceId(0),
            1024,
            None,
        );
        os.enable_save();
        os.enable(Vec::new());
        barrier.object.write().pack(&mut os);
        os.disable();
        let mut is = DataIStream::new(os.buffer().to_vec());
        assert_eq!(is.read::<u32>(), 4);
        assert!(!is.has_data());
    }
}
