//! Peer nodes.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::RwLock;
use weft_proto::packet::Packet;
use weft_proto::{ConnectionDescription, ConnectionType, NodeId};

use super::connection::{Connection, ConnectionState};

/// Connectivity of a node; shares its states with connections.
pub type NodeState = ConnectionState;

/// A process in the network, as seen from the local node.
///
/// Nodes are shared as `Arc<Node>` and owned by the local node's node
/// table. The local node keeps one entry for itself, reached through a
/// loopback connection.
pub struct Node {
    id: NodeId,
    node_type: u32,
    local: bool,
    state: RwLock<NodeState>,
    connection: RwLock<Option<Connection>>,
    multicast: RwLock<Option<Connection>>,
    descriptions: RwLock<Vec<ConnectionDescription>>,
    last_receive: AtomicU64,
}

impl Node {
    /// A remote node, not yet connected.
    pub fn new(id: NodeId, node_type: u32, descriptions: Vec<ConnectionDescription>) -> Self {
        Self {
            id,
            node_type,
            local: false,
            state: RwLock::new(NodeState::Closed),
            connection: RwLock::new(None),
            multicast: RwLock::new(None),
            descriptions: RwLock::new(descriptions),
            last_receive: AtomicU64::new(0),
        }
    }

    pub(crate) fn new_local(id: NodeId, node_type: u32) -> Self {
        Self {
            local: true,
            ..Self::new(id, node_type, Vec::new())
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn node_type(&self) -> u32 {
        self.node_type
    }

    /// Whether this is the local node's own entry.
    pub fn is_local(&self) -> bool {
        self.local
    }

    pub fn state(&self) -> NodeState {
        *self.state.read()
    }

    pub(crate) fn set_state(&self, state: NodeState) {
        *self.state.write() = state;
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state(), NodeState::Connected | NodeState::Listening)
    }

    pub fn is_closed(&self) -> bool {
        self.state() == NodeState::Closed
    }

    pub fn connection(&self) -> Option<Connection> {
        self.connection.read().clone()
    }

    pub(crate) fn set_connection(&self, connection: Option<Connection>) {
        *self.connection.write() = connection;
    }

    pub fn multicast(&self) -> Option<Connection> {
        self.multicast.read().clone()
    }

    pub(crate) fn set_multicast(&self, connection: Option<Connection>) {
        *self.multicast.write() = connection;
    }

    pub fn descriptions(&self) -> Vec<ConnectionDescription> {
        self.descriptions.read().clone()
    }

    pub(crate) fn set_descriptions(&self, descriptions: Vec<ConnectionDescription>) {
        *self.descriptions.write() = descriptions;
    }

    /// Descriptions that can be dialed directly.
    pub fn connectable_descriptions(&self) -> Vec<ConnectionDescription> {
        self.descriptions
            .read()
            .iter()
            .filter(|d| d.connection_type != ConnectionType::Multicast)
            .cloned()
            .collect()
    }

    /// Record a receive at local-node time `time` (milliseconds).
    pub(crate) fn touch(&self, time: u64) {
        self.last_receive.store(time, Ordering::Relaxed);
    }

    /// Local-node time of the last receive from this node.
    pub fn last_receive(&self) -> u64 {
        self.last_receive.load(Ordering::Relaxed)
    }

    /// Queue a frame on the primary connection.
    pub fn send(&self, frame: Bytes) -> bool {
        match self.connection() {
            Some(connection) => connection.send(frame),
            None => false,
        }
    }

    pub fn send_packet<P: Packet>(&self, packet: &P) -> bool {
        self.send(packet.to_frame())
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id.to_string())
            .field("type", &self.node_type)
            .field("state", &self.state())
            .field("local", &self.local)
            .finish()
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}
