//! Network module.
//!
//! Contains connections and listeners, the peer node table entries, the
//! request table and the [`LocalNode`] that ties them together.

mod connection;
pub mod local_node;
mod node;
mod request;

pub use connection::{
    Connection, ConnectionEvent, ConnectionState, ConnectionStream, EventSender, Listener,
    pipe_pair,
};
pub use local_node::{LocalNode, SendToken};
pub use node::{Node, NodeState};
pub use request::{RequestHandler, RequestValue};
