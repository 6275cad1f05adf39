//! Unified error handling for weft.
//!
//! Recoverable failures travel as these enums; contract violations such as
//! out-of-order version application panic at the call site instead.

use std::fmt;

use thiserror::Error;
use weft_proto::{NodeId, ProtocolError};

// ============================================================================
// Timeouts
// ============================================================================

/// Which wait ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutKind {
    /// A connection write did not complete.
    Write,
    /// A connection read did not complete.
    Read,
    /// A barrier was not released.
    Barrier,
    /// A command queue stayed empty.
    QueuePop,
    /// A request was not served.
    Request,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Write => "write",
            Self::Read => "read",
            Self::Barrier => "barrier",
            Self::QueuePop => "queue pop",
            Self::Request => "request",
        })
    }
}

// ============================================================================
// Node Errors (network and object operations)
// ============================================================================

/// Errors raised by node, connection and object operations.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("{0} timeout")]
    Timeout(TimeoutKind),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("connection refused by {0}")]
    Refused(NodeId),

    #[error("node {0} not found")]
    NotFound(NodeId),

    #[error("local node is not listening")]
    NotListening,

    #[error("connection closed")]
    Closed,

    #[error("unsupported transport: {0}")]
    Unsupported(String),
}

impl NodeError {
    /// Get a static error code string for metrics labeling.
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Timeout(TimeoutKind::Write) => "timeout_write",
            Self::Timeout(TimeoutKind::Read) => "timeout_read",
            Self::Timeout(TimeoutKind::Barrier) => "timeout_barrier",
            Self::Timeout(TimeoutKind::QueuePop) => "timeout_queue_pop",
            Self::Timeout(TimeoutKind::Request) => "timeout_request",
            Self::Io(_) => "io",
            Self::Protocol(e) => e.error_code(),
            Self::Refused(_) => "refused",
            Self::NotFound(_) => "not_found",
            Self::NotListening => "not_listening",
            Self::Closed => "closed",
            Self::Unsupported(_) => "unsupported",
        }
    }

    /// Whether this is a timeout of the given kind.
    pub fn is_timeout(&self, kind: TimeoutKind) -> bool {
        matches!(self, Self::Timeout(k) if *k == kind)
    }
}

/// Result type for node operations.
pub type NodeResult<T> = Result<T, NodeError>;

// ============================================================================
// Dispatch Errors (command registration)
// ============================================================================

/// Command table configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("command {0} is already registered")]
    Collision(u32),

    #[error("command {0} is reserved for built-in commands")]
    Reserved(u32),
}

impl DispatchError {
    /// Get a static error code string for metrics labeling.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Collision(_) => "collision",
            Self::Reserved(_) => "reserved",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_error_codes() {
        assert_eq!(NodeError::Timeout(TimeoutKind::Barrier).error_code(), "timeout_barrier");
        assert_eq!(NodeError::NotListening.error_code(), "not_listening");
        let proto = NodeError::from(ProtocolError::UnknownPacketType(9));
        assert_eq!(proto.error_code(), "unknown_packet_type");
    }

    #[test]
    fn test_timeout_display() {
        assert_eq!(NodeError::Timeout(TimeoutKind::QueuePop).to_string(), "queue pop timeout");
        assert!(NodeError::Timeout(TimeoutKind::Request).is_timeout(TimeoutKind::Request));
        assert!(!NodeError::Closed.is_timeout(TimeoutKind::Request));
    }

    #[test]
    fn test_dispatch_error_codes() {
        assert_eq!(DispatchError::Collision(3).error_code(), "collision");
        assert_eq!(DispatchError::Collision(3).to_string(), "command 3 is already registered");
    }
}
