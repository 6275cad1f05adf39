//! Integration test common infrastructure.
//!
//! Starts LocalNodes on 127.0.0.1 with ephemeral ports and provides a small
//! distributed counter to share between them.

pub mod node;

#[allow(unused_imports)]
pub use node::{Counter, TestNode, connected_pair, eventually};
