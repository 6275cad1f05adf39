//! weft - peer-to-peer distributed objects.
//!
//! Processes run a [`LocalNode`], connect to each other and share
//! versioned [`Object`]s: a master commits new versions, slaves mapped on
//! other nodes sync to them. Wire types live in [`weft_proto`].

pub mod command;
pub mod config;
pub mod error;
pub mod http;
pub mod metrics;
pub mod network;
pub mod object;
pub mod stream;
pub mod telemetry;
pub mod util;

pub use command::{Command, CommandCache, CommandQueue, Dispatcher, Handler};
pub use config::Config;
pub use error::{DispatchError, NodeError, NodeResult, TimeoutKind};
pub use network::{LocalNode, Node, NodeState, SendToken};
pub use object::{Barrier, BarrierData, ChangeType, Distributed, Object, PushHandler};
pub use stream::{DataIStream, DataOStream};
pub use weft_proto::{ConnectionDescription, InstanceId, NodeId, ObjectId, Version};
