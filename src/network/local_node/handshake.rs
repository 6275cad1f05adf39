//! Connection handshake, node data lookups and orderly disconnects.
//!
//! The initiator sends CONNECT on a fresh connection, the acceptor answers
//! with CONNECT_REPLY carrying its own identity (or a zero id to refuse),
//! and the initiator closes the exchange with CONNECT_ACK. Both CONNECT
//! and CONNECT_REPLY arrive on connections that are not mapped to a node
//! yet, so the receiver hands them here together with the connection.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use weft_proto::packet::Packet;
use weft_proto::packet::node::{
    ConnectAckPacket, ConnectPacket, ConnectReplyPacket, DisconnectPacket, GetNodeDataPacket,
    GetNodeDataReplyPacket,
};
use weft_proto::{ConnectionDescription, NodeId};

use super::LocalNodeInner;
use crate::command::Command;
use crate::error::{NodeError, NodeResult};
use crate::network::{Connection, Node, NodeState, RequestValue};

/// Connect attempts per peer before giving up on it.
const MAX_CONNECT_TRIES: usize = 10;

/// How one connect attempt ended.
enum Attempt {
    Connected(Arc<Node>),
    /// Refused, or both sides connected at once.
    TryAgain,
    /// No description of the node could be reached.
    Unreachable,
    Failed(NodeError),
}

impl LocalNodeInner {
    /// Connect to `id`, asking the connected peers for its descriptions.
    pub(crate) async fn connect(self: &Arc<Self>, id: NodeId) -> Option<Arc<Node>> {
        if let Some(node) = self.get_node(id).filter(|n| n.is_connected()) {
            return Some(node);
        }
        if !self.is_listening() {
            return None;
        }

        let _guard = self.connect_lock.lock().await;
        if let Some(node) = self.get_node(id).filter(|n| n.is_connected()) {
            return Some(node);
        }

        for peer in self.connected_nodes() {
            let Some(node) = self.get_node_data(&peer, id).await else {
                continue;
            };
            if node.is_connected() {
                return Some(node);
            }

            for _ in 0..MAX_CONNECT_TRIES {
                match self.connect_node(&node).await {
                    Attempt::Connected(node) => return Some(node),
                    Attempt::TryAgain => backoff().await,
                    Attempt::Unreachable => break,
                    Attempt::Failed(e) => {
                        warn!(node = %id, error = %e, "Connect failed");
                        return None;
                    }
                }
                // The peer may have connected to us meanwhile.
                if let Some(node) = self.get_node(id).filter(|n| n.is_connected()) {
                    return Some(node);
                }
            }
            if let Some(node) = self.get_node(id).filter(|n| n.is_connected()) {
                return Some(node);
            }
        }

        let node = self.get_node(id).filter(|n| n.is_connected());
        if node.is_none() {
            warn!(node = %id, "Node could not be reached");
        }
        node
    }

    /// Connect to whatever node listens at `description`.
    pub(crate) async fn connect_to(self: &Arc<Self>, description: &ConnectionDescription) -> NodeResult<Arc<Node>> {
        if !self.is_listening() {
            return Err(NodeError::NotListening);
        }
        let _guard = self.connect_lock.lock().await;
        for _ in 0..MAX_CONNECT_TRIES {
            let connection = Connection::connect(
                description,
                self.events.clone(),
                self.config.timeouts.default_timeout(),
            )
            .await?;
            match self.handshake(connection, None).await {
                Attempt::Connected(node) => return Ok(node),
                Attempt::TryAgain => backoff().await,
                Attempt::Unreachable => break,
                Attempt::Failed(e) => return Err(e),
            }
        }
        Err(NodeError::Refused(NodeId::ZERO))
    }

    async fn connect_node(self: &Arc<Self>, node: &Arc<Node>) -> Attempt {
        let descriptions = node.connectable_descriptions();
        if descriptions.is_empty() {
            debug!(node = %node.id(), "Node has no connectable description");
            return Attempt::Unreachable;
        }
        node.set_state(NodeState::Connecting);
        for description in &descriptions {
            match Connection::connect(
                description,
                self.events.clone(),
                self.config.timeouts.default_timeout(),
            )
            .await
            {
                Ok(connection) => {
                    let attempt = self.handshake(connection, Some(Arc::clone(node))).await;
                    if !matches!(attempt, Attempt::Connected(_)) {
                        node.set_state(NodeState::Closed);
                    }
                    return attempt;
                }
                Err(e) => debug!(node = %node.id(), remote = %description, error = %e, "Description unreachable"),
            }
        }
        node.set_state(NodeState::Closed);
        Attempt::Unreachable
    }

    async fn handshake(self: &Arc<Self>, connection: Connection, node: Option<Arc<Node>>) -> Attempt {
        let data = node.map(|n| n as Arc<dyn Any + Send + Sync>);
        let request_id = self.requests.register_request(data);
        let packet = ConnectPacket {
            request_id,
            node_id: self.id,
            node_type: self.node_type,
            node_data: self.self_node.descriptions(),
        };
        if !connection.send(packet.to_frame()) {
            self.requests.unregister_request(request_id);
            return Attempt::Failed(NodeError::Closed);
        }

        match self.requests.wait_request(request_id, self.config.timeouts.handshake()).await {
            Ok(RequestValue::Node(node)) => Attempt::Connected(node),
            Ok(_) => {
                connection.close();
                Attempt::TryAgain
            }
            Err(e) => {
                connection.close();
                Attempt::Failed(e)
            }
        }
    }

    async fn get_node_data(&self, peer: &Node, id: NodeId) -> Option<Arc<Node>> {
        let request_id = self.requests.register_request(None);
        if !peer.send_packet(&GetNodeDataPacket { node_id: id, request_id }) {
            self.requests.unregister_request(request_id);
            return None;
        }
        match self
            .requests
            .wait_request(request_id, self.config.timeouts.default_timeout())
            .await
        {
            Ok(value) => value.as_node(),
            Err(e) => {
                debug!(peer = %peer.id(), node = %id, error = %e, "No node data");
                None
            }
        }
    }

    pub(crate) async fn disconnect(&self, node: &Arc<Node>) -> bool {
        if node.is_local() || !node.is_connected() {
            return false;
        }
        let request_id = self
            .requests
            .register_request(Some(Arc::clone(node) as Arc<dyn Any + Send + Sync>));
        if !self.self_node.send_packet(&DisconnectPacket { request_id }) {
            self.requests.unregister_request(request_id);
            return false;
        }
        self.requests
            .wait_request(request_id, self.config.timeouts.default_timeout())
            .await
            .is_ok()
    }
}

async fn backoff() {
    let ms = rand::random::<u8>();
    tokio::time::sleep(Duration::from_millis(u64::from(ms))).await;
}

// ============================================================================
// Receiver-side handlers
// ============================================================================

pub(super) fn on_connect(local: &Arc<LocalNodeInner>, connection: &Connection, command: &Command) {
    let packet = match command.packet::<ConnectPacket>() {
        Ok(packet) => packet,
        Err(e) => {
            warn!(error = %e, "Malformed connect, closing connection");
            connection.close();
            return;
        }
    };

    let known = local.get_node(packet.node_id).is_some_and(|n| n.is_connected());
    if known || packet.node_id == local.id || packet.node_id == NodeId::ZERO {
        info!(node = %packet.node_id, "Refusing connection from connected node");
        connection.send(
            ConnectReplyPacket {
                request_id: packet.request_id,
                node_id: NodeId::ZERO,
                node_type: 0,
                node_data: Vec::new(),
            }
            .to_frame(),
        );
        return;
    }

    let node = Arc::new(Node::new(packet.node_id, packet.node_type, packet.node_data));
    node.set_connection(Some(connection.clone()));
    node.set_state(NodeState::Connected);
    local.add_node(&node, connection);

    connection.send(
        ConnectReplyPacket {
            request_id: packet.request_id,
            node_id: local.id,
            node_type: local.node_type,
            node_data: local.self_node.descriptions(),
        }
        .to_frame(),
    );
    info!(node = %node.id(), "Peer connected");
}

pub(super) fn on_connect_reply(local: &Arc<LocalNodeInner>, connection: &Connection, command: &Command) {
    let packet = match command.packet::<ConnectReplyPacket>() {
        Ok(packet) => packet,
        Err(e) => {
            warn!(error = %e, "Malformed connect reply, closing connection");
            connection.close();
            return;
        }
    };
    let requests = local.requests();

    if packet.node_id == NodeId::ZERO {
        debug!("Connection refused");
        connection.close();
        requests.serve_request(packet.request_id, RequestValue::Bool(false));
        return;
    }

    if let Some(existing) = local.get_node(packet.node_id).filter(|n| n.is_connected()) {
        // Both sides connected at once; drop both links and let the
        // initiators retry after their back-off.
        info!(node = %packet.node_id, "Simultaneous connect, retrying");
        connection.close();
        if let Some(other) = existing.connection() {
            local.remove_connection(&other);
            other.close();
        }
        requests.serve_request(packet.request_id, RequestValue::Bool(false));
        return;
    }

    let node = requests
        .get_request_data::<Node>(packet.request_id)
        .filter(|n| n.id() == packet.node_id)
        .unwrap_or_else(|| Arc::new(Node::new(packet.node_id, packet.node_type, Vec::new())));
    node.set_descriptions(packet.node_data);
    node.set_connection(Some(connection.clone()));
    node.set_state(NodeState::Connected);
    local.add_node(&node, connection);
    connection.send(ConnectAckPacket {}.to_frame());

    if !requests.serve_request(packet.request_id, RequestValue::Node(Arc::clone(&node))) {
        warn!(node = %node.id(), "Handshake finished after its caller gave up");
        local.remove_connection(connection);
        connection.close();
        return;
    }
    info!(node = %node.id(), "Connected to peer");
}

pub(super) fn cmd_connect_ack(local: &Arc<LocalNodeInner>, command: &Command) -> bool {
    let Some(node) = command.node() else {
        return true;
    };
    debug!(node = %node.id(), "Handshake acknowledged");
    let own = local.self_node.descriptions();
    let shared = node
        .descriptions()
        .iter()
        .any(|theirs| own.iter().any(|ours| ours.same_group(theirs)));
    if shared && node.multicast().is_none() {
        debug!(node = %node.id(), "Shared multicast group; using the unicast connection");
    }
    true
}

pub(super) fn cmd_disconnect(local: &Arc<LocalNodeInner>, command: &Command) -> bool {
    let Ok(packet) = command.packet::<DisconnectPacket>() else {
        return true;
    };
    let Some(node) = local.requests().get_request_data::<Node>(packet.request_id) else {
        warn!(request = packet.request_id, "Disconnect without a node");
        return true;
    };
    if let Some(connection) = node.connection() {
        local.remove_connection(&connection);
        connection.close();
    }
    info!(node = %node.id(), "Disconnected");
    local.requests().serve_request(packet.request_id, RequestValue::None);
    true
}

pub(super) fn cmd_get_node_data(local: &Arc<LocalNodeInner>, command: &Command) -> bool {
    let Ok(packet) = command.packet::<GetNodeDataPacket>() else {
        return true;
    };
    let Some(requester) = command.node() else {
        return true;
    };
    let reply = match local.get_node(packet.node_id) {
        Some(node) => GetNodeDataReplyPacket {
            node_id: packet.node_id,
            request_id: packet.request_id,
            node_type: node.node_type(),
            node_data: node.descriptions(),
        },
        None => GetNodeDataReplyPacket {
            node_id: packet.node_id,
            request_id: packet.request_id,
            node_type: 0,
            node_data: Vec::new(),
        },
    };
    debug!(node = %packet.node_id, known = reply.node_type != 0, "Answering node data request");
    requester.send_packet(&reply);
    true
}

pub(super) fn cmd_get_node_data_reply(local: &Arc<LocalNodeInner>, command: &Command) -> bool {
    let Ok(packet) = command.packet::<GetNodeDataReplyPacket>() else {
        return true;
    };
    let value = match local.get_node(packet.node_id) {
        Some(node) => RequestValue::Node(node),
        None if packet.node_type == 0 => RequestValue::None,
        None => RequestValue::Node(Arc::new(Node::new(
            packet.node_id,
            packet.node_type,
            packet.node_data,
        ))),
    };
    local.requests().serve_request(packet.request_id, value);
    true
}
