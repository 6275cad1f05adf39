//! Change manager of objects that are not attached.

use std::sync::Arc;

use tracing::error;
use weft_proto::Version;
use weft_proto::packet::node::MapObjectPacket;

use super::{ChangeManager, MapResult};
use crate::network::Node;
use crate::object::ObjectApi;
use crate::stream::ObjectDataIStream;

/// Rejects every versioning operation.
#[derive(Debug, Default)]
pub(crate) struct NullCm;

impl ChangeManager for NullCm {
    fn is_master(&self) -> bool {
        false
    }

    fn version(&self) -> Version {
        Version::NONE
    }

    fn commit(&mut self, obj: &dyn ObjectApi, _incarnation: u32) -> Version {
        error!(object = %obj.core().id(), "Commit of an object that is not registered");
        Version::NONE
    }

    fn add_slave(&mut self, obj: &dyn ObjectApi, node: &Arc<Node>, _packet: &MapObjectPacket) -> MapResult {
        error!(object = %obj.core().id(), node = %node.id(), "Map of an object without change manager");
        MapResult::uncached(Version::INVALID)
    }

    fn send_instance_data(&mut self, obj: &dyn ObjectApi, _nodes: &[Arc<Node>]) {
        error!(object = %obj.core().id(), "Instance data requested from an unattached object");
    }

    fn add_instance_datas(&mut self, _cache: &[ObjectDataIStream], _start: Version) {
        error!("Cached instance data offered to an unattached object");
    }

    fn apply(&mut self, obj: &dyn ObjectApi, stream: &ObjectDataIStream) {
        error!(object = %obj.core().id(), version = %stream.version(), "Apply on an unattached object");
    }

    fn apply_map_data(&mut self, obj: &dyn ObjectApi, version: Version) {
        error!(object = %obj.core().id(), %version, "Map data for an unattached object");
    }
}
