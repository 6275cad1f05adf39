//! Command identifiers.
//!
//! Node commands live in `0..NodeCommand::CUSTOM`; applications register
//! their own node commands at or above [`NodeCommand::CUSTOM`]. Object
//! commands follow the same layout with [`ObjectCommand::CUSTOM`].

/// Built-in node-level commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum NodeCommand {
    /// Stop the receiver task (local only).
    StopRcv = 0,
    /// Stop the command task (local only).
    StopCmd = 1,
    /// Handshake request.
    Connect = 2,
    /// Handshake reply.
    ConnectReply = 3,
    /// Handshake acknowledgement.
    ConnectAck = 4,
    /// Orderly disconnect.
    Disconnect = 5,
    /// Ask a peer for the connection data of a third node.
    GetNodeData = 6,
    /// Reply to [`NodeCommand::GetNodeData`].
    GetNodeDataReply = 7,
    /// Ask a peer for its send token.
    AcquireSendToken = 8,
    /// The send token was granted.
    AcquireSendTokenReply = 9,
    /// Give the send token back.
    ReleaseSendToken = 10,
    /// Keepalive.
    Ping = 11,
    /// Generic request acknowledgement.
    AckRequest = 12,
    /// Ask which node holds the master of an object.
    FindMasterNodeId = 13,
    /// Reply to [`NodeCommand::FindMasterNodeId`].
    FindMasterNodeIdReply = 14,
    /// Subscribe a slave to a master object.
    MapObject = 15,
    /// The master accepted a subscription; sent before the instance data.
    MapObjectSuccess = 16,
    /// The master finished a subscription request.
    MapObjectReply = 17,
    /// The master was deregistered; slaves must detach.
    UnmapObject = 18,
    /// A slave unsubscribes from its master.
    UnsubscribeObject = 19,
    /// The master confirms an unsubscription.
    DetachObject = 20,
    /// A peer went away (local only).
    RemoveNode = 21,
    /// Stop broadcasting newly registered objects (local only).
    DisableSendOnRegister = 22,
    /// Unsolicited instance data.
    ObjectPush = 23,
}

impl NodeCommand {
    /// First application-defined node command.
    pub const CUSTOM: u32 = 50;

    const ALL: [Self; 24] = [
        Self::StopRcv,
        Self::StopCmd,
        Self::Connect,
        Self::ConnectReply,
        Self::ConnectAck,
        Self::Disconnect,
        Self::GetNodeData,
        Self::GetNodeDataReply,
        Self::AcquireSendToken,
        Self::AcquireSendTokenReply,
        Self::ReleaseSendToken,
        Self::Ping,
        Self::AckRequest,
        Self::FindMasterNodeId,
        Self::FindMasterNodeIdReply,
        Self::MapObject,
        Self::MapObjectSuccess,
        Self::MapObjectReply,
        Self::UnmapObject,
        Self::UnsubscribeObject,
        Self::DetachObject,
        Self::RemoveNode,
        Self::DisableSendOnRegister,
        Self::ObjectPush,
    ];

    /// Look up a built-in command.
    pub fn from_u32(raw: u32) -> Option<Self> {
        Self::ALL.get(raw as usize).copied()
    }

    /// Every built-in node command, in id order.
    pub fn all() -> &'static [Self] {
        &Self::ALL
    }

    /// Stable name for logs and metric labels.
    pub fn name(self) -> &'static str {
        match self {
            Self::StopRcv => "stop_rcv",
            Self::StopCmd => "stop_cmd",
            Self::Connect => "connect",
            Self::ConnectReply => "connect_reply",
            Self::ConnectAck => "connect_ack",
            Self::Disconnect => "disconnect",
            Self::GetNodeData => "get_node_data",
            Self::GetNodeDataReply => "get_node_data_reply",
            Self::AcquireSendToken => "acquire_send_token",
            Self::AcquireSendTokenReply => "acquire_send_token_reply",
            Self::ReleaseSendToken => "release_send_token",
            Self::Ping => "ping",
            Self::AckRequest => "ack_request",
            Self::FindMasterNodeId => "find_master_node_id",
            Self::FindMasterNodeIdReply => "find_master_node_id_reply",
            Self::MapObject => "map_object",
            Self::MapObjectSuccess => "map_object_success",
            Self::MapObjectReply => "map_object_reply",
            Self::UnmapObject => "unmap_object",
            Self::UnsubscribeObject => "unsubscribe_object",
            Self::DetachObject => "detach_object",
            Self::RemoveNode => "remove_node",
            Self::DisableSendOnRegister => "disable_send_on_register",
            Self::ObjectPush => "object_push",
        }
    }
}

impl From<NodeCommand> for u32 {
    fn from(command: NodeCommand) -> Self {
        command as u32
    }
}

/// Built-in object-level commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ObjectCommand {
    /// Full instance data for one version.
    Instance = 0,
    /// Delta data for one version.
    Delta = 1,
    /// Delta committed by a slave, applied by the master.
    SlaveDelta = 2,
    /// A slave announces the newest version it can absorb.
    MaxVersion = 3,
}

impl ObjectCommand {
    /// First application-defined object command.
    pub const CUSTOM: u32 = 10;

    /// Look up a built-in command.
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Instance),
            1 => Some(Self::Delta),
            2 => Some(Self::SlaveDelta),
            3 => Some(Self::MaxVersion),
            _ => None,
        }
    }

    /// Stable name for logs and metric labels.
    pub fn name(self) -> &'static str {
        match self {
            Self::Instance => "instance",
            Self::Delta => "delta",
            Self::SlaveDelta => "slave_delta",
            Self::MaxVersion => "max_version",
        }
    }
}

impl From<ObjectCommand> for u32 {
    fn from(command: ObjectCommand) -> Self {
        command as u32
    }
}
