//! Node-level packets.
//!
//! These carry no object address; they are dispatched by the receiving
//! node's own command table.

use super::command::NodeCommand;
use crate::description::ConnectionDescription;
use crate::id::{InstanceId, NodeId, ObjectId};
use crate::version::Version;
use crate::wire::Blob;

packet! {
    /// Tells the receiver task to shut down.
    pub struct StopRcvPacket(Node, NodeCommand::StopRcv as u32) {}
}

packet! {
    /// Tells the command task to shut down.
    pub struct StopCmdPacket(Node, NodeCommand::StopCmd as u32) {}
}

packet! {
    /// First handshake message, sent by the connecting side.
    pub struct ConnectPacket(Node, NodeCommand::Connect as u32) {
        request_id: u32,
        node_id: NodeId,
        node_type: u32,
        node_data: Vec<ConnectionDescription>,
    }
}

packet! {
    /// Handshake answer. A zero `node_id` refuses the connection.
    pub struct ConnectReplyPacket(Node, NodeCommand::ConnectReply as u32) {
        request_id: u32,
        node_id: NodeId,
        node_type: u32,
        node_data: Vec<ConnectionDescription>,
    }
}

packet! {
    /// Final handshake message from the connecting side.
    pub struct ConnectAckPacket(Node, NodeCommand::ConnectAck as u32) {}
}

packet! {
    /// Orderly disconnect request.
    pub struct DisconnectPacket(Node, NodeCommand::Disconnect as u32) {
        request_id: u32,
    }
}

packet! {
    /// Ask for the connection data of `node_id`.
    pub struct GetNodeDataPacket(Node, NodeCommand::GetNodeData as u32) {
        node_id: NodeId,
        request_id: u32,
    }
}

packet! {
    /// Connection data of a node; a zero `node_type` means unknown.
    pub struct GetNodeDataReplyPacket(Node, NodeCommand::GetNodeDataReply as u32) {
        node_id: NodeId,
        request_id: u32,
        node_type: u32,
        node_data: Vec<ConnectionDescription>,
    }
}

packet! {
    /// Request the peer's send token.
    pub struct AcquireSendTokenPacket(Node, NodeCommand::AcquireSendToken as u32) {
        request_id: u32,
        time: u64,
    }
}

packet! {
    /// Grants the send token.
    pub struct AcquireSendTokenReplyPacket(Node, NodeCommand::AcquireSendTokenReply as u32) {
        request_id: u32,
    }
}

packet! {
    /// Returns the send token to its owner.
    pub struct ReleaseSendTokenPacket(Node, NodeCommand::ReleaseSendToken as u32) {}
}

packet! {
    /// Keepalive carrying the sender's clock.
    pub struct PingPacket(Node, NodeCommand::Ping as u32) {
        time: u64,
    }
}

packet! {
    /// Acknowledge a request without a payload.
    pub struct AckRequestPacket(Node, NodeCommand::AckRequest as u32) {
        request_id: u32,
    }
}

packet! {
    /// Ask whether the receiver holds the master of `object_id`.
    pub struct FindMasterNodeIdPacket(Node, NodeCommand::FindMasterNodeId as u32) {
        object_id: ObjectId,
        request_id: u32,
    }
}

packet! {
    /// The master node of the queried object, or zero.
    pub struct FindMasterNodeIdReplyPacket(Node, NodeCommand::FindMasterNodeIdReply as u32) {
        master_node_id: NodeId,
        request_id: u32,
    }
}

packet! {
    /// Subscribe `instance_id` on the sender to the master object.
    ///
    /// `min_cached_version..=max_cached_version` is the range of versions the
    /// slave already holds in its instance cache; the master skips sending
    /// those when `use_cache` is set.
    pub struct MapObjectPacket(Node, NodeCommand::MapObject as u32) {
        requested_version: Version,
        min_cached_version: Version,
        max_cached_version: Version,
        object_id: ObjectId,
        request_id: u32,
        instance_id: InstanceId,
        master_instance_id: InstanceId,
        use_cache: bool,
    }
}

packet! {
    /// The master accepted a subscription.
    pub struct MapObjectSuccessPacket(Node, NodeCommand::MapObjectSuccess as u32) {
        node_id: NodeId,
        object_id: ObjectId,
        request_id: u32,
        instance_id: InstanceId,
        change_type: u32,
        master_instance_id: InstanceId,
    }
}

packet! {
    /// The master finished a subscription request.
    pub struct MapObjectReplyPacket(Node, NodeCommand::MapObjectReply as u32) {
        node_id: NodeId,
        object_id: ObjectId,
        version: Version,
        cached_version: Version,
        request_id: u32,
        result: bool,
        use_cache: bool,
    }
}

packet! {
    /// The master was deregistered.
    pub struct UnmapObjectPacket(Node, NodeCommand::UnmapObject as u32) {
        object_id: ObjectId,
    }
}

packet! {
    /// A slave leaves its master.
    pub struct UnsubscribeObjectPacket(Node, NodeCommand::UnsubscribeObject as u32) {
        object_id: ObjectId,
        request_id: u32,
        master_instance_id: InstanceId,
        slave_instance_id: InstanceId,
    }
}

packet! {
    /// The master confirms an unsubscription.
    pub struct DetachObjectPacket(Node, NodeCommand::DetachObject as u32) {
        object_id: ObjectId,
        request_id: u32,
        instance_id: InstanceId,
    }
}

packet! {
    /// A peer disconnected; drop everything it owned.
    pub struct RemoveNodePacket(Node, NodeCommand::RemoveNode as u32) {
        node_id: NodeId,
        request_id: u32,
    }
}

packet! {
    /// Stop broadcasting newly registered objects.
    pub struct DisableSendOnRegisterPacket(Node, NodeCommand::DisableSendOnRegister as u32) {
        request_id: u32,
    }
}

packet! {
    /// Unsolicited instance data for the receiver's push handler.
    pub struct ObjectPushPacket(Node, NodeCommand::ObjectPush as u32) {
        object_id: ObjectId,
        group_id: u128,
        type_id: u128,
        compressor: u32,
        data_size: u64,
        chunks: Vec<Blob>,
    }
}
