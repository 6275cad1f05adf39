//! Per-node registry of attached objects and the object protocol handlers.
//!
//! Masters are registered here; slaves are mapped through the
//! MAP_OBJECT / MAP_OBJECT_SUCCESS / MAP_OBJECT_REPLY exchange with the
//! master's node. Incoming object packets are routed to the addressed
//! instances, and every instance data packet is fed to the instance cache.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};
use weft_proto::compressor;
use weft_proto::packet::NodeCommand;
use weft_proto::packet::node::{
    AckRequestPacket, DetachObjectPacket, DisableSendOnRegisterPacket, FindMasterNodeIdPacket,
    FindMasterNodeIdReplyPacket, MapObjectPacket, MapObjectReplyPacket, MapObjectSuccessPacket,
    ObjectPushPacket, RemoveNodePacket, UnmapObjectPacket, UnsubscribeObjectPacket,
};
use weft_proto::packet::object::{ObjectAddress, ObjectDataPacket};
use weft_proto::{InstanceId, NodeId, ObjectId, ObjectVersion, Version};

use super::cm::{ChangeManager, NullCm, ObjectCm};
use super::instance_cache::InstanceCache;
use super::{ChangeType, ObjectApi, notify_slaves_detach};
use crate::command::{Command, Handler};
use crate::network::local_node::LocalNodeInner;
use crate::network::{Node, RequestValue};
use crate::stream::DataIStream;

/// Receives objects pushed by other nodes: `(group_id, type_id, object_id,
/// instance data)`.
pub type PushHandler = Arc<dyn Fn(u128, u128, ObjectId, DataIStream) + Send + Sync>;

/// Data attached to an outstanding map request.
struct MapRequest {
    object: Arc<dyn ObjectApi>,
    /// Whether the instance cache entry of the object is pinned for us.
    pinned: AtomicBool,
}

impl MapRequest {
    fn release_pin(&self, store: &ObjectStore, id: ObjectId) {
        if self.pinned.swap(false, Ordering::AcqRel)
            && let Some(cache) = store.instance_cache()
        {
            cache.release(id, 1);
        }
    }
}

struct Entry {
    instance_id: InstanceId,
    object: Weak<dyn ObjectApi>,
}

struct SendQueueItem {
    object: Weak<dyn ObjectApi>,
    expires: Option<Instant>,
}

type StoreHandler = fn(&ObjectStore, &Arc<LocalNodeInner>, &Command) -> bool;

/// Node commands owned by the store: `(command, handler, queued)`.
/// Queued handlers run on the command task.
const HANDLERS: &[(NodeCommand, StoreHandler, bool)] = &[
    (NodeCommand::AckRequest, ObjectStore::cmd_ack_request, false),
    (NodeCommand::FindMasterNodeId, ObjectStore::cmd_find_master_node_id, true),
    (NodeCommand::FindMasterNodeIdReply, ObjectStore::cmd_find_master_node_id_reply, false),
    (NodeCommand::MapObject, ObjectStore::cmd_map_object, true),
    (NodeCommand::MapObjectSuccess, ObjectStore::cmd_map_object_success, false),
    (NodeCommand::MapObjectReply, ObjectStore::cmd_map_object_reply, true),
    (NodeCommand::UnmapObject, ObjectStore::cmd_unmap_object, false),
    (NodeCommand::UnsubscribeObject, ObjectStore::cmd_unsubscribe_object, true),
    (NodeCommand::DetachObject, ObjectStore::cmd_detach_object, false),
    (NodeCommand::RemoveNode, ObjectStore::cmd_remove_node, true),
    (NodeCommand::DisableSendOnRegister, ObjectStore::cmd_disable_send_on_register, true),
    (NodeCommand::ObjectPush, ObjectStore::cmd_object_push, true),
];

/// Attached objects of one local node.
///
/// Lock order is `objects` before any object's change manager. Object
/// handles are collected under the lock and used after releasing it.
pub(crate) struct ObjectStore {
    objects: RwLock<HashMap<ObjectId, Vec<Entry>>>,
    next_instance_id: AtomicU32,
    instance_cache: RwLock<Option<Arc<InstanceCache>>>,
    send_queue: Mutex<VecDeque<SendQueueItem>>,
    send_queue_size: usize,
    send_queue_age: Option<Duration>,
    send_on_register: AtomicI32,
    push_handlers: RwLock<HashMap<u128, PushHandler>>,
}

impl ObjectStore {
    pub(crate) fn new(config: &crate::config::Config) -> Self {
        let cache_size = config.cache.instance_cache_size;
        let age = config.cache.send_queue_age_ms;
        Self {
            objects: RwLock::new(HashMap::new()),
            next_instance_id: AtomicU32::new(0),
            instance_cache: RwLock::new(
                (cache_size > 0).then(|| Arc::new(InstanceCache::new(cache_size as u64))),
            ),
            send_queue: Mutex::new(VecDeque::new()),
            send_queue_size: config.cache.send_queue_size,
            send_queue_age: (age > 0).then(|| Duration::from_millis(age)),
            send_on_register: AtomicI32::new(1),
            push_handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Route the store's node commands to it.
    pub(crate) fn register_handlers(local: &Arc<LocalNodeInner>) {
        for &(command, handler, queued) in HANDLERS {
            let weak = Arc::downgrade(local);
            let f: Handler = Arc::new(move |cmd: &Command| match weak.upgrade() {
                Some(local) => handler(local.store(), &local, cmd),
                None => true,
            });
            let queue = queued.then(|| local.command_queue());
            if let Err(e) = local.dispatcher().register_command(command as u32, f, queue) {
                error!(command = command.name(), error = %e, "Cannot register object store handler");
            }
        }
    }

    fn gen_instance_id(&self) -> InstanceId {
        loop {
            let id = InstanceId(self.next_instance_id.fetch_add(1, Ordering::Relaxed));
            if id.is_concrete() {
                return id;
            }
        }
    }

    /// Live attached instances of `id`.
    fn instances(&self, id: ObjectId) -> Vec<Arc<dyn ObjectApi>> {
        self.objects
            .read()
            .get(&id)
            .map(|entries| entries.iter().filter_map(|e| e.object.upgrade()).collect())
            .unwrap_or_default()
    }

    fn find_instance(&self, id: ObjectId, instance_id: InstanceId) -> Option<Arc<dyn ObjectApi>> {
        self.objects
            .read()
            .get(&id)?
            .iter()
            .find(|e| e.instance_id == instance_id)?
            .object
            .upgrade()
    }

    fn find_master(&self, id: ObjectId) -> Option<Arc<dyn ObjectApi>> {
        self.instances(id)
            .into_iter()
            .find(|obj| obj.core().cm.read().is_master())
    }

    pub(crate) fn instance_cache(&self) -> Option<Arc<InstanceCache>> {
        self.instance_cache.read().clone()
    }

    /// Number of attached instances.
    pub(crate) fn len(&self) -> usize {
        self.objects.read().values().map(Vec::len).sum()
    }

    /// Forget an instance whose object is gone.
    pub(crate) fn forget_instance(&self, id: ObjectId, instance_id: InstanceId) {
        let mut objects = self.objects.write();
        if let Some(entries) = objects.get_mut(&id) {
            entries.retain(|e| e.instance_id != instance_id);
            if entries.is_empty() {
                objects.remove(&id);
            }
        }
    }

    // ========================================================================
    // Attach / detach
    // ========================================================================

    /// Attach `obj` under `id`, generating an instance id for
    /// [`InstanceId::INVALID`].
    pub(crate) fn attach_object(
        &self,
        local: &Arc<LocalNodeInner>,
        obj: &Arc<dyn ObjectApi>,
        id: ObjectId,
        instance_id: InstanceId,
    ) -> InstanceId {
        let instance_id = if instance_id == InstanceId::INVALID {
            self.gen_instance_id()
        } else {
            instance_id
        };
        obj.core().attach(id, instance_id, local);
        self.objects.write().entry(id).or_default().push(Entry {
            instance_id,
            object: Arc::downgrade(obj),
        });
        debug!(object = %id, instance = %instance_id, "Attached");
        instance_id
    }

    /// Remove `obj` from the dispatch table and mark it detached.
    pub(crate) fn detach_object(&self, obj: &dyn ObjectApi) {
        let core = obj.core();
        if !core.is_attached() {
            return;
        }
        let (id, instance_id) = (core.id(), core.instance_id());
        self.forget_instance(id, instance_id);
        core.detach();
        debug!(object = %id, instance = %instance_id, "Detached");
    }

    /// Replace `old` by `new` in the dispatch table, moving the change
    /// manager and the attachment.
    pub(crate) fn swap_object(
        &self,
        local: &Arc<LocalNodeInner>,
        old: &Arc<dyn ObjectApi>,
        new: &Arc<dyn ObjectApi>,
    ) {
        let core = old.core();
        if !core.is_attached() {
            return;
        }
        let (id, instance_id) = (core.id(), core.instance_id());
        {
            let mut objects = self.objects.write();
            let Some(entry) = objects
                .get_mut(&id)
                .and_then(|entries| entries.iter_mut().find(|e| e.instance_id == instance_id))
            else {
                return;
            };
            entry.object = Arc::downgrade(new);
        }

        let cm = core.set_cm(ObjectCm::Null(NullCm));
        core.detach();
        new.core().attach(id, instance_id, local);
        new.core().set_cm(cm);
        debug!(object = %id, instance = %instance_id, "Swapped object");
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Make `obj` the master of its id on this node.
    pub(crate) fn register_object(&self, local: &Arc<LocalNodeInner>, obj: &Arc<dyn ObjectApi>) -> bool {
        let core = obj.core();
        if core.is_attached() {
            warn!(object = %core.id(), "Object is already attached");
            return false;
        }
        let change_type = obj.change_type();
        // Attach first: snapshots carry the master instance id.
        let instance_id = self.attach_object(local, obj, core.id(), InstanceId::INVALID);
        core.set_cm(ObjectCm::master(change_type, local.config().object.auto_obsolete));
        core.cm.write().init(&**obj);
        self.queue_send_on_register(obj);
        obj.notify_attached();
        local.flush_commands();
        info!(object = %core.id(), instance = %instance_id, %change_type, "Registered object");
        true
    }

    /// Detach a master, unmapping its slaves.
    pub(crate) fn deregister_object(&self, obj: &Arc<dyn ObjectApi>) {
        let core = obj.core();
        if !core.is_attached() {
            return;
        }
        let id = core.id();
        notify_slaves_detach(&**obj);
        self.send_queue
            .lock()
            .retain(|item| !std::ptr::addr_eq(item.object.as_ptr(), Arc::as_ptr(obj)));
        self.detach_object(&**obj);
        core.set_cm(ObjectCm::Null(NullCm));
        if let Some(cache) = self.instance_cache() {
            cache.erase(id);
        }
        obj.notify_detached();
        info!(object = %id, "Deregistered object");
    }

    // ========================================================================
    // Mapping
    // ========================================================================

    /// The node holding the master of `id`, or [`NodeId::ZERO`].
    pub(crate) async fn find_master_node_id(&self, local: &Arc<LocalNodeInner>, id: ObjectId) -> NodeId {
        let known = self.local_master_node_id(local, id);
        if known != NodeId::ZERO {
            return known;
        }

        let timeout = local.config().timeouts.default_timeout();
        for node in local.connected_nodes() {
            let request_id = local.requests().register_request(None);
            if !node.send_packet(&FindMasterNodeIdPacket {
                object_id: id,
                request_id,
            }) {
                local.requests().unregister_request(request_id);
                continue;
            }
            match local.requests().wait_request(request_id, timeout).await {
                Ok(value) => {
                    let master = value.as_node_id().unwrap_or(NodeId::ZERO);
                    debug!(object = %id, node = %node.id(), %master, "Master lookup");
                    if master != NodeId::ZERO {
                        return master;
                    }
                }
                Err(e) => warn!(object = %id, node = %node.id(), error = %e, "Master lookup failed"),
            }
        }
        NodeId::ZERO
    }

    fn local_master_node_id(&self, local: &LocalNodeInner, id: ObjectId) -> NodeId {
        for obj in self.instances(id) {
            let cm = obj.core().cm.read();
            let master = if cm.is_master() {
                local.id()
            } else {
                cm.master_node().unwrap_or(NodeId::ZERO)
            };
            if master != NodeId::ZERO {
                return master;
            }
        }
        NodeId::ZERO
    }

    async fn connect_master(&self, local: &Arc<LocalNodeInner>, id: ObjectId) -> Option<Arc<Node>> {
        let master_id = self.find_master_node_id(local, id).await;
        if master_id == NodeId::ZERO {
            warn!(object = %id, "Cannot find master node");
            return None;
        }
        if master_id == local.id() {
            return Some(local.self_node());
        }
        match local.connect(master_id).await {
            Some(node) if !node.is_closed() => Some(node),
            _ => {
                warn!(object = %id, master = %master_id, "Cannot connect master node");
                None
            }
        }
    }

    /// Start mapping `obj` to the master of `id`. Returns the request to
    /// pass to [`map_object_sync`](Self::map_object_sync).
    pub(crate) async fn map_object_nb(
        &self,
        local: &Arc<LocalNodeInner>,
        obj: &Arc<dyn ObjectApi>,
        id: ObjectId,
        version: Version,
    ) -> Option<u32> {
        if obj.core().is_attached() {
            warn!(object = %id, "Cannot map an attached object");
            return None;
        }
        if !id.is_generated() {
            warn!(object = %id, "Cannot map an unset object id");
            return None;
        }
        let master = self.connect_master(local, id).await?;

        let mut packet = MapObjectPacket {
            requested_version: version,
            min_cached_version: Version::HEAD,
            max_cached_version: Version::NONE,
            object_id: id,
            request_id: 0,
            instance_id: self.gen_instance_id(),
            master_instance_id: InstanceId::INVALID,
            use_cache: false,
        };
        let cached = self.instance_cache().and_then(|cache| cache.get(id));
        if let Some(cached) = &cached
            && let (Some(first), Some(last)) = (cached.versions.first(), cached.versions.last())
        {
            packet.use_cache = true;
            packet.master_instance_id = cached.master_instance_id;
            packet.min_cached_version = first.version();
            packet.max_cached_version = last.version();
            debug!(
                object = %id,
                cached = %format_args!("{}..{}", packet.min_cached_version, packet.max_cached_version),
                "Mapping with cached versions"
            );
        }

        let request = Arc::new(MapRequest {
            object: Arc::clone(obj),
            pinned: AtomicBool::new(cached.is_some()),
        });
        packet.request_id = local.requests().register_request(Some(request.clone()));
        if !master.send_packet(&packet) {
            warn!(object = %id, master = %master.id(), "Cannot send map request");
            request.release_pin(self, id);
            local.requests().unregister_request(packet.request_id);
            return None;
        }
        Some(packet.request_id)
    }

    /// Finish a map request: wait for the reply and apply the mapped
    /// version. On failure the object is left detached.
    pub(crate) async fn map_object_sync(&self, local: &Arc<LocalNodeInner>, request_id: u32) -> bool {
        let Some(request) = local.requests().get_request_data::<MapRequest>(request_id) else {
            warn!(request = request_id, "Unknown map request");
            return false;
        };
        let obj = Arc::clone(&request.object);
        let timeout = local.config().timeouts.default_timeout();
        let version = match local.requests().wait_request(request_id, timeout).await {
            Ok(value) => value.as_version().unwrap_or(Version::INVALID),
            Err(e) => {
                warn!(object = %obj.core().id(), error = %e, "Map request failed");
                Version::INVALID
            }
        };
        let id = obj.core().id();
        request.release_pin(self, id);

        if version == Version::INVALID || !obj.core().is_attached() {
            self.detach_object(&*obj);
            obj.core().set_cm(ObjectCm::Null(NullCm));
            return false;
        }

        {
            let _span = crate::telemetry::object_span(id, obj.core().instance_id()).entered();
            obj.core().cm.write().apply_map_data(&*obj, version);
        }
        obj.notify_attached();
        info!(object = %id, %version, "Mapped object");
        true
    }

    /// Unsubscribe a slave from its master and detach it.
    pub(crate) async fn unmap_object(&self, local: &Arc<LocalNodeInner>, obj: &Arc<dyn ObjectApi>) {
        let core = obj.core();
        if !core.is_attached() {
            return;
        }
        let id = core.id();
        notify_slaves_detach(&**obj);

        let (master_instance_id, master_node) = {
            let cm = core.cm.read();
            (cm.master_instance_id(), cm.master_node())
        };
        if master_instance_id != InstanceId::INVALID
            && let Some(master) = master_node.and_then(|node_id| local.get_node(node_id))
            && master.is_connected()
        {
            let request_id = local.requests().register_request(None);
            let sent = master.send_packet(&UnsubscribeObjectPacket {
                object_id: id,
                request_id,
                master_instance_id,
                slave_instance_id: core.instance_id(),
            });
            if sent {
                let timeout = local.config().timeouts.default_timeout();
                match local.requests().wait_request(request_id, timeout).await {
                    Ok(_) => {
                        obj.notify_detached();
                        return;
                    }
                    Err(e) => warn!(object = %id, error = %e, "Unsubscribe was not confirmed"),
                }
            } else {
                local.requests().unregister_request(request_id);
            }
        } else if master_instance_id != InstanceId::INVALID {
            error!(object = %id, "Master node of object is not connected");
        }

        self.detach_object(&**obj);
        core.set_cm(ObjectCm::Null(NullCm));
        obj.notify_detached();
    }

    // ========================================================================
    // Instance cache and send-on-register
    // ========================================================================

    pub(crate) fn expire_instance_data(&self, age: Duration) {
        if let Some(cache) = self.instance_cache() {
            cache.expire(age);
        }
    }

    pub(crate) fn disable_instance_cache(&self) {
        *self.instance_cache.write() = None;
    }

    fn queue_send_on_register(&self, obj: &Arc<dyn ObjectApi>) {
        if self.send_queue_size == 0 || self.send_on_register.load(Ordering::Acquire) <= 0 {
            return;
        }
        let mut queue = self.send_queue.lock();
        queue.push_back(SendQueueItem {
            object: Arc::downgrade(obj),
            expires: self.send_queue_age.map(|age| Instant::now() + age),
        });
        while queue.len() > self.send_queue_size {
            queue.pop_front();
        }
    }

    pub(crate) fn enable_send_on_register(&self) {
        self.send_on_register.fetch_add(1, Ordering::AcqRel);
    }

    /// Stop broadcasting newly registered objects once every enable has been
    /// matched. Waits until the command task dropped the queued objects.
    pub(crate) async fn disable_send_on_register(&self, local: &Arc<LocalNodeInner>) {
        if self.send_on_register.fetch_sub(1, Ordering::AcqRel) > 1 {
            return;
        }
        let request_id = local.requests().register_request(None);
        if !local.self_node().send_packet(&DisableSendOnRegisterPacket { request_id }) {
            local.requests().unregister_request(request_id);
            self.send_queue.lock().clear();
            return;
        }
        let timeout = local.config().timeouts.default_timeout();
        if let Err(e) = local.requests().wait_request(request_id, timeout).await {
            warn!(error = %e, "Send-on-register was not flushed");
        }
    }

    /// Broadcast one queued object. Returns whether more are queued.
    pub(crate) fn notify_command_task_idle(&self, local: &Arc<LocalNodeInner>) -> bool {
        let Some(item) = self.send_queue.lock().pop_front() else {
            return false;
        };
        let fresh = item.expires.is_none_or(|expires| expires > Instant::now());
        if fresh
            && let Some(obj) = item.object.upgrade()
            && obj.core().is_attached()
        {
            let nodes = local.connected_nodes();
            if !nodes.is_empty() {
                debug!(object = %obj.core().id(), nodes = nodes.len(), "Sending on register");
                obj.core().cm.write().send_instance_data(&*obj, &nodes);
            }
        }
        !self.send_queue.lock().is_empty()
    }

    pub(crate) fn register_push_handler(&self, group_id: u128, handler: PushHandler) {
        self.push_handlers.write().insert(group_id, handler);
    }

    /// Drop every subscription and cached instance data of `node_id`.
    pub(crate) fn remove_node(&self, node_id: NodeId) {
        let all: Vec<Arc<dyn ObjectApi>> = self
            .objects
            .read()
            .values()
            .flatten()
            .filter_map(|e| e.object.upgrade())
            .collect();
        for obj in all {
            obj.core().cm.write().remove_slaves(node_id);
        }
        if let Some(cache) = self.instance_cache() {
            cache.remove(node_id);
        }
    }

    // ========================================================================
    // Object packet routing
    // ========================================================================

    /// Route an object packet to the addressed instances.
    ///
    /// Returns false when a concrete instance is not attached yet; the
    /// caller retries later.
    pub(crate) fn dispatch_object_command(&self, local: &LocalNodeInner, command: &Command) -> bool {
        let address = {
            let frame = command.frame();
            match ObjectAddress::peek(&frame) {
                Ok(address) => address,
                Err(e) => {
                    warn!(error = %e, "Dropping malformed object packet");
                    return true;
                }
            }
        };

        if address.instance_id.is_concrete() {
            return match self.find_instance(address.object_id, address.instance_id) {
                Some(obj) => obj.core().dispatch(command),
                None => {
                    debug!(object = %address.object_id, instance = %address.instance_id, "Instance not attached yet");
                    false
                }
            };
        }

        let targets: Vec<Arc<dyn ObjectApi>> = self
            .instances(address.object_id)
            .into_iter()
            .filter(|obj| !obj.core().cm.read().is_master())
            .collect();
        let mut first = true;
        for obj in targets {
            let handled = if first {
                obj.core().dispatch(command)
            } else {
                obj.core().dispatch(&local.command_cache().clone_command(command))
            };
            first = false;
            if !handled {
                warn!(object = %address.object_id, "Broadcast object command not handled");
            }
        }
        true
    }

    /// Instance data: deliver it as appropriate and record it in the
    /// instance cache.
    ///
    /// - addressed to this node (map reply): dispatched, cached as used
    /// - broadcast to `ALL` (master commit): dispatched to local slaves
    /// - `NONE` (send-on-register) or addressed to another node: cached only
    pub(crate) fn cmd_instance(&self, local: &LocalNodeInner, command: &Command) -> bool {
        let header = {
            let frame = command.frame();
            match ObjectDataPacket::parse(&frame) {
                Ok(packet) => packet.header,
                Err(e) => {
                    warn!(error = %e, "Dropping malformed instance data");
                    return true;
                }
            }
        };

        let (usage, result) = if header.node_id == local.id() {
            (1, self.dispatch_object_command(local, command))
        } else if header.address.instance_id == InstanceId::NONE || header.node_id != NodeId::ZERO {
            (0, true)
        } else {
            (0, self.dispatch_object_command(local, command))
        };

        if result && let Some(cache) = self.instance_cache() {
            let rev = ObjectVersion::new(header.address.object_id, header.version);
            cache.add(rev, header.master_instance_id, command, usage);
        }
        result
    }

    // ========================================================================
    // Node command handlers
    // ========================================================================

    fn cmd_ack_request(&self, local: &Arc<LocalNodeInner>, command: &Command) -> bool {
        if let Ok(packet) = command.packet::<AckRequestPacket>() {
            local.requests().serve_request(packet.request_id, RequestValue::None);
        }
        true
    }

    fn cmd_find_master_node_id(&self, local: &Arc<LocalNodeInner>, command: &Command) -> bool {
        let (Ok(packet), Some(node)) = (command.packet::<FindMasterNodeIdPacket>(), command.node()) else {
            return true;
        };
        let master_node_id = self.local_master_node_id(local, packet.object_id);
        debug!(object = %packet.object_id, master = %master_node_id, "Answering master lookup");
        node.send_packet(&FindMasterNodeIdReplyPacket {
            master_node_id,
            request_id: packet.request_id,
        });
        true
    }

    fn cmd_find_master_node_id_reply(&self, local: &Arc<LocalNodeInner>, command: &Command) -> bool {
        if let Ok(packet) = command.packet::<FindMasterNodeIdReplyPacket>() {
            local
                .requests()
                .serve_request(packet.request_id, RequestValue::NodeId(packet.master_node_id));
        }
        true
    }

    fn cmd_map_object(&self, _local: &Arc<LocalNodeInner>, command: &Command) -> bool {
        let (Ok(packet), Some(node)) = (command.packet::<MapObjectPacket>(), command.node()) else {
            return true;
        };
        let id = packet.object_id;
        let mut reply = MapObjectReplyPacket {
            node_id: node.id(),
            object_id: id,
            version: packet.requested_version,
            cached_version: Version::INVALID,
            request_id: packet.request_id,
            result: false,
            use_cache: false,
        };

        match self.find_master(id) {
            None => warn!(object = %id, "No master object to map"),
            Some(master) => {
                let requested = packet.requested_version;
                let mut cm = master.core().cm.write();
                let (oldest, head) = (cm.oldest_version(), cm.version());
                let available = requested == Version::OLDEST
                    || requested == Version::NONE
                    || (oldest <= requested && requested <= head);
                if available {
                    node.send_packet(&MapObjectSuccessPacket {
                        node_id: node.id(),
                        object_id: id,
                        request_id: packet.request_id,
                        instance_id: packet.instance_id,
                        change_type: master.change_type() as u32,
                        master_instance_id: master.core().instance_id(),
                    });
                    let result = cm.add_slave(&*master, &node, &packet);
                    reply.result = true;
                    reply.version = result.version;
                    reply.cached_version = result.cached_version;
                    reply.use_cache = result.use_cache;
                } else {
                    warn!(
                        object = %id,
                        version = %requested,
                        available = %format_args!("{oldest}..{head}"),
                        auto_obsolete = cm.auto_obsolete(),
                        "Requested version is not available"
                    );
                }
            }
        }
        node.send_packet(&reply);
        true
    }

    fn cmd_map_object_success(&self, local: &Arc<LocalNodeInner>, command: &Command) -> bool {
        let Ok(packet) = command.packet::<MapObjectSuccessPacket>() else {
            return true;
        };
        if packet.node_id != local.id() {
            return true;
        }
        let Some(request) = local.requests().get_request_data::<MapRequest>(packet.request_id) else {
            warn!(object = %packet.object_id, request = packet.request_id, "Map success for unknown request");
            return true;
        };
        let Some(change_type) = ChangeType::from_u32(packet.change_type) else {
            warn!(object = %packet.object_id, change_type = packet.change_type, "Unknown change type");
            return true;
        };
        let obj = &request.object;
        self.attach_object(local, obj, packet.object_id, packet.instance_id);
        obj.core()
            .set_cm(ObjectCm::slave(change_type, packet.master_instance_id));
        true
    }

    fn cmd_map_object_reply(&self, local: &Arc<LocalNodeInner>, command: &Command) -> bool {
        let Ok(packet) = command.packet::<MapObjectReplyPacket>() else {
            return true;
        };
        if packet.node_id != local.id() {
            return true;
        }
        let id = packet.object_id;
        let Some(request) = local.requests().get_request_data::<MapRequest>(packet.request_id) else {
            return true;
        };

        if packet.result {
            let obj = &request.object;
            let mut cm = obj.core().cm.write();
            if let Some(node) = command.node() {
                cm.set_master_node(node.id());
            }
            if packet.use_cache
                && packet.cached_version != Version::INVALID
                && let Some(cache) = self.instance_cache()
                && let Some(cached) = cache.get(id)
            {
                cm.add_instance_datas(&cached.versions, packet.cached_version);
                let pins = if request.pinned.swap(false, Ordering::AcqRel) { 2 } else { 1 };
                cache.release(id, pins);
            }
        } else {
            warn!(object = %id, "Could not map object");
        }
        request.release_pin(self, id);

        let version = if packet.result {
            packet.version
        } else {
            Version::INVALID
        };
        local
            .requests()
            .serve_request(packet.request_id, RequestValue::Version(version));
        true
    }

    fn cmd_unmap_object(&self, _local: &Arc<LocalNodeInner>, command: &Command) -> bool {
        let Ok(packet) = command.packet::<UnmapObjectPacket>() else {
            return true;
        };
        let id = packet.object_id;
        if let Some(cache) = self.instance_cache() {
            cache.erase(id);
        }
        let Some(entries) = self.objects.write().remove(&id) else {
            return true;
        };
        let objects: Vec<Arc<dyn ObjectApi>> = entries.iter().filter_map(|e| e.object.upgrade()).collect();
        for obj in objects {
            debug!(object = %id, instance = %obj.core().instance_id(), "Master went away, detaching");
            obj.core().detach();
            obj.core().set_cm(ObjectCm::Null(NullCm));
            obj.notify_detached();
        }
        true
    }

    fn cmd_unsubscribe_object(&self, _local: &Arc<LocalNodeInner>, command: &Command) -> bool {
        let (Ok(packet), Some(node)) = (command.packet::<UnsubscribeObjectPacket>(), command.node()) else {
            return true;
        };
        if let Some(master) = self.find_instance(packet.object_id, packet.master_instance_id)
            && master.core().cm.read().is_master()
        {
            master
                .core()
                .cm
                .write()
                .remove_slave(node.id(), packet.slave_instance_id);
        }
        node.send_packet(&DetachObjectPacket {
            object_id: packet.object_id,
            request_id: packet.request_id,
            instance_id: packet.slave_instance_id,
        });
        true
    }

    fn cmd_detach_object(&self, local: &Arc<LocalNodeInner>, command: &Command) -> bool {
        let Ok(packet) = command.packet::<DetachObjectPacket>() else {
            return true;
        };
        if let Some(obj) = self.find_instance(packet.object_id, packet.instance_id) {
            self.detach_object(&*obj);
            obj.core().set_cm(ObjectCm::Null(NullCm));
        }
        local.requests().serve_request(packet.request_id, RequestValue::None);
        true
    }

    fn cmd_remove_node(&self, local: &Arc<LocalNodeInner>, command: &Command) -> bool {
        let Ok(packet) = command.packet::<RemoveNodePacket>() else {
            return true;
        };
        debug!(node = %packet.node_id, "Removing node from objects");
        self.remove_node(packet.node_id);
        if packet.request_id != 0 {
            local.requests().serve_request(packet.request_id, RequestValue::None);
        }
        true
    }

    fn cmd_disable_send_on_register(&self, local: &Arc<LocalNodeInner>, command: &Command) -> bool {
        let Ok(packet) = command.packet::<DisableSendOnRegisterPacket>() else {
            return true;
        };
        self.send_queue.lock().clear();
        local.requests().serve_request(packet.request_id, RequestValue::None);
        true
    }

    fn cmd_object_push(&self, _local: &Arc<LocalNodeInner>, command: &Command) -> bool {
        let packet = match command.packet::<ObjectPushPacket>() {
            Ok(packet) => packet,
            Err(e) => {
                warn!(error = %e, "Dropping malformed object push");
                return true;
            }
        };
        let handler = self.push_handlers.read().get(&packet.group_id).cloned();
        let Some(handler) = handler else {
            warn!(group = packet.group_id, object = %packet.object_id, "No push handler for group");
            return true;
        };

        let chunks: Vec<&[u8]> = packet.chunks.iter().map(|c| c.0.as_slice()).collect();
        let data = if packet.compressor == 0 {
            chunks.concat()
        } else {
            match compressor::decompress_chunks(packet.compressor, &chunks, packet.data_size as usize) {
                Ok(data) => data,
                Err(e) => {
                    warn!(object = %packet.object_id, error = %e, "Cannot decompress pushed object");
                    return true;
                }
            }
        };
        handler(packet.group_id, packet.type_id, packet.object_id, DataIStream::new(data));
        true
    }
}
