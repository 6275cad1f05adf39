//! Telemetry utilities: subscriber setup and standard spans.

use tracing_subscriber::EnvFilter;

use crate::config::LogFormat;

/// Install the global tracing subscriber.
///
/// The filter comes from `RUST_LOG` and defaults to `info`.
pub fn init_subscriber(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    let result = match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    };
    if let Err(e) = result {
        tracing::debug!(error = %e, "Tracing subscriber already installed");
    }
}

/// Standardized span constructors for runtime observability.
pub mod spans {
    use tracing::{Span, debug_span, info_span};
    use weft_proto::{InstanceId, NodeId, ObjectId};

    /// Span for one command dispatch.
    pub fn command(packet_type: &str, command: u32, node: Option<NodeId>) -> Span {
        match node {
            Some(node) => debug_span!("command", packet_type, command, node = %node),
            None => debug_span!("command", packet_type, command),
        }
    }

    /// Span for work on one object instance.
    pub fn object(id: ObjectId, instance: InstanceId) -> Span {
        debug_span!("object", id = %id, instance = %instance)
    }

    /// Span for a local node's tasks.
    pub fn node(id: NodeId) -> Span {
        info_span!("node", id = %id)
    }
}

pub use spans::{command as command_span, node as node_span, object as object_span};
