//! Synchronization helpers shared by the command pipeline and objects.

pub mod monitor;
pub mod mt_queue;

pub use monitor::Monitor;
pub use mt_queue::MtQueue;
