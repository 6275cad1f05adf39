//! Distributed objects.
//!
//! An [`Object`] wraps user data implementing [`Distributed`]. Registering
//! it with a [`LocalNode`](crate::network::LocalNode) makes it a master;
//! mapping an object id on another node creates a slave copy. Masters
//! [`commit`](Object::commit) new versions, slaves [`sync`](Object::sync)
//! to them.
//!
//! The versioning logic lives in the change manager owned by each object
//! (see [`cm`]). The object itself only holds the user data, the
//! attachment state and the per-object command dispatcher.

mod barrier;
pub(crate) mod cm;
mod instance_cache;
mod store;

pub use barrier::{Barrier, BarrierData};
pub use instance_cache::{CachedData, InstanceCache};
pub use store::PushHandler;
pub(crate) use store::ObjectStore;

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, error, warn};
use weft_proto::compressor;
use weft_proto::packet::ObjectCommand;
use weft_proto::packet::node::UnmapObjectPacket;
use weft_proto::packet::object::ObjectAddress;
use weft_proto::wire::Blob;
use weft_proto::{CompressorName, InstanceId, ObjectId, Version};

use self::cm::{ChangeManager, NullCm, ObjectCm};
use crate::command::{Command, CommandQueue, Dispatcher, Handler};
use crate::config::defaults;
use crate::error::DispatchError;
use crate::network::Node;
use crate::network::local_node::LocalNodeInner;
use crate::stream::{DataIStream, DataOStream, ObjectDataIStream};

/// Incarnation value meaning "the commit after the previous one".
pub const COMMIT_NEXT: u32 = u32::MAX;

/// Builtin object commands owned by the change manager.
const CM_COMMANDS: [ObjectCommand; 4] = [
    ObjectCommand::Instance,
    ObjectCommand::Delta,
    ObjectCommand::SlaveDelta,
    ObjectCommand::MaxVersion,
];

// ============================================================================
// Change types
// ============================================================================

/// How an object distributes changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ChangeType {
    /// Not distributed.
    None = 0,
    /// Never changes after registration.
    Static = 1,
    /// Every commit sends the full instance data.
    Instance = 2,
    /// Commits send deltas; full snapshots are kept for new slaves.
    Delta = 3,
    /// Commits send deltas; no history.
    Unbuffered = 4,
}

impl ChangeType {
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::None),
            1 => Some(Self::Static),
            2 => Some(Self::Instance),
            3 => Some(Self::Delta),
            4 => Some(Self::Unbuffered),
            _ => None,
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Static => "static",
            Self::Instance => "instance",
            Self::Delta => "delta",
            Self::Unbuffered => "unbuffered",
        })
    }
}

// ============================================================================
// User data contract
// ============================================================================

/// Data that can be distributed as an [`Object`].
///
/// `get_instance_data`/`apply_instance_data` move the complete state;
/// `pack`/`unpack` move the changes since the last commit and default to
/// the full state.
///
/// The notification hooks run with the object's change manager locked and
/// must not call back into the object.
pub trait Distributed: Send + Sync + 'static {
    fn change_type(&self) -> ChangeType;

    fn get_instance_data(&self, os: &mut DataOStream);

    fn apply_instance_data(&mut self, is: &mut DataIStream);

    fn pack(&mut self, os: &mut DataOStream) {
        self.get_instance_data(os);
    }

    fn unpack(&mut self, is: &mut DataIStream) {
        self.apply_instance_data(is);
    }

    /// Whether a commit has anything to send.
    fn is_dirty(&self) -> bool {
        true
    }

    /// Compressor for this object's data; `None` uses the node default.
    fn compressor(&self) -> Option<CompressorName> {
        None
    }

    /// How many versions a slave may fall behind its master.
    fn max_versions(&self) -> u64 {
        u64::MAX
    }

    /// A slave received a complete new version.
    fn notify_new_head_version(&self, _version: Version) {}

    /// A new version was applied.
    fn notify_new_version(&mut self) {}

    fn notify_attached(&mut self) {}

    fn notify_detached(&mut self) {}
}

// ============================================================================
// Type-erased object access
// ============================================================================

/// What the store and the change managers need from an object, whatever
/// its data type. Data locks are taken per call.
pub(crate) trait ObjectApi: Send + Sync {
    fn core(&self) -> &ObjectCore;
    fn change_type(&self) -> ChangeType;
    fn get_instance_data(&self, os: &mut DataOStream);
    fn apply_instance_data(&self, is: &mut DataIStream);
    fn pack(&self, os: &mut DataOStream);
    fn unpack(&self, is: &mut DataIStream);
    fn is_dirty(&self) -> bool;
    fn compressor(&self) -> Option<CompressorName>;
    fn max_versions(&self) -> u64;
    fn notify_new_head_version(&self, version: Version);
    fn notify_new_version(&self);
    fn notify_attached(&self);
    fn notify_detached(&self);
}

/// Attachment state, change manager and dispatcher of one object.
///
/// Lock order is `cm` before the user data.
pub(crate) struct ObjectCore {
    id: RwLock<ObjectId>,
    instance_id: AtomicU32,
    local: RwLock<Weak<LocalNodeInner>>,
    pub(crate) cm: RwLock<ObjectCm>,
    dispatcher: Dispatcher,
    this: Weak<dyn ObjectApi>,
}

impl ObjectCore {
    fn new(this: Weak<dyn ObjectApi>) -> Self {
        Self {
            id: RwLock::new(ObjectId::generate()),
            instance_id: AtomicU32::new(InstanceId::INVALID.0),
            local: RwLock::new(Weak::new()),
            cm: RwLock::new(ObjectCm::Null(NullCm)),
            dispatcher: Dispatcher::new("object"),
            this,
        }
    }

    pub(crate) fn id(&self) -> ObjectId {
        *self.id.read()
    }

    pub(crate) fn instance_id(&self) -> InstanceId {
        InstanceId(self.instance_id.load(Ordering::Acquire))
    }

    pub(crate) fn is_attached(&self) -> bool {
        self.instance_id() != InstanceId::INVALID
    }

    pub(crate) fn address(&self) -> ObjectAddress {
        ObjectAddress::new(self.id(), self.instance_id())
    }

    pub(crate) fn local_node(&self) -> Option<Arc<LocalNodeInner>> {
        self.local.read().upgrade()
    }

    pub(crate) fn this(&self) -> Option<Arc<dyn ObjectApi>> {
        self.this.upgrade()
    }

    pub(crate) fn attach(&self, id: ObjectId, instance_id: InstanceId, local: &Arc<LocalNodeInner>) {
        assert!(instance_id.is_concrete(), "attach with reserved instance id {instance_id}");
        *self.id.write() = id;
        *self.local.write() = Arc::downgrade(local);
        self.instance_id.store(instance_id.0, Ordering::Release);
    }

    pub(crate) fn detach(&self) {
        self.instance_id.store(InstanceId::INVALID.0, Ordering::Release);
    }

    pub(crate) fn set_local_node(&self, local: &Arc<LocalNodeInner>) {
        *self.local.write() = Arc::downgrade(local);
    }

    pub(crate) fn dispatch(&self, command: &Command) -> bool {
        self.dispatcher.dispatch_command(command)
    }

    pub(crate) fn register_command(
        &self,
        command: u32,
        handler: Handler,
        queue: Option<Arc<CommandQueue>>,
    ) -> Result<(), DispatchError> {
        self.dispatcher.register_command(command, handler, queue)
    }

    /// Install `cm` and route its commands to it. Returns the previous one.
    pub(crate) fn set_cm(&self, cm: ObjectCm) -> ObjectCm {
        for command in CM_COMMANDS {
            self.dispatcher.unregister_command(command as u32);
        }
        let commands = cm.commands();
        let previous = std::mem::replace(&mut *self.cm.write(), cm);

        for &command in commands {
            let this = self.this.clone();
            let handler: Handler = Arc::new(move |cmd: &Command| {
                let Some(object) = this.upgrade() else {
                    return true;
                };
                let mut cm = object.core().cm.write();
                cm.handle_command(&*object, cmd)
            });
            if let Err(e) = self.dispatcher.register_command(command as u32, handler, None) {
                error!(error = %e, command = command.name(), "Cannot route change manager command");
            }
        }
        previous
    }

    pub(crate) fn config_timeout(&self) -> Duration {
        match self.local_node() {
            Some(local) => local.config().timeouts.default_timeout(),
            None => Duration::from_millis(defaults::default_timeout_ms()),
        }
    }

    /// A data stream addressed to `instance_id` of this object.
    pub(crate) fn ostream(
        &self,
        obj: &dyn ObjectApi,
        command: ObjectCommand,
        instance_id: InstanceId,
    ) -> DataOStream {
        let (buffer_size, default_compressor) = match self.local_node() {
            Some(local) => (local.config().object.buffer_size, local.config().object.compressor),
            None => (defaults::default_object_buffer_size(), CompressorName::None),
        };
        let compressor = lookup_compressor(obj.compressor().unwrap_or(default_compressor));
        DataOStream::for_object(
            command,
            ObjectAddress::new(self.id(), instance_id),
            self.instance_id(),
            buffer_size,
            compressor,
        )
    }

    /// Serialize the full instance data into a saving stream that has not
    /// been sent anywhere yet.
    pub(crate) fn snapshot(&self, obj: &dyn ObjectApi, version: Version) -> DataOStream {
        let mut os = self.ostream(obj, ObjectCommand::Instance, InstanceId::ALL);
        os.set_version(version);
        os.enable_save();
        os.enable(Vec::new());
        obj.get_instance_data(&mut os);
        os.disable();
        os
    }
}

fn lookup_compressor(name: CompressorName) -> Option<&'static dyn weft_proto::Compressor> {
    match compressor::lookup(name) {
        Ok(found) => found,
        Err(e) => {
            warn!(compressor = %name, error = %e, "Compressor unavailable, sending uncompressed");
            None
        }
    }
}

pub(crate) struct ObjectInner<T> {
    data: RwLock<T>,
    core: ObjectCore,
}

impl<T: Distributed> ObjectApi for ObjectInner<T> {
    fn core(&self) -> &ObjectCore {
        &self.core
    }

    fn change_type(&self) -> ChangeType {
        self.data.read().change_type()
    }

    fn get_instance_data(&self, os: &mut DataOStream) {
        self.data.read().get_instance_data(os);
    }

    fn apply_instance_data(&self, is: &mut DataIStream) {
        self.data.write().apply_instance_data(is);
    }

    fn pack(&self, os: &mut DataOStream) {
        self.data.write().pack(os);
    }

    fn unpack(&self, is: &mut DataIStream) {
        self.data.write().unpack(is);
    }

    fn is_dirty(&self) -> bool {
        self.data.read().is_dirty()
    }

    fn compressor(&self) -> Option<CompressorName> {
        self.data.read().compressor()
    }

    fn max_versions(&self) -> u64 {
        self.data.read().max_versions()
    }

    fn notify_new_head_version(&self, version: Version) {
        self.data.read().notify_new_head_version(version);
    }

    fn notify_new_version(&self) {
        self.data.write().notify_new_version();
    }

    fn notify_attached(&self) {
        self.data.write().notify_attached();
    }

    fn notify_detached(&self) {
        self.data.write().notify_detached();
    }
}

impl<T> Drop for ObjectInner<T> {
    fn drop(&mut self) {
        if !self.core.is_attached() {
            return;
        }
        let (id, instance_id) = (self.core.id(), self.core.instance_id());
        warn!(object = %id, instance = %instance_id, "Object dropped while attached");
        if let Some(local) = self.core.local_node() {
            local.store().forget_instance(id, instance_id);
        }
    }
}

// ============================================================================
// Object
// ============================================================================

/// A distributed object holding user data of type `T`.
///
/// Clones are handles to the same object. Data guards returned by
/// [`read`](Self::read) and [`write`](Self::write) must be dropped before
/// calling [`commit`](Self::commit) or [`sync`](Self::sync).
pub struct Object<T: Distributed> {
    inner: Arc<ObjectInner<T>>,
}

impl<T: Distributed> Object<T> {
    /// A standalone object with a fresh id.
    pub fn new(data: T) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<ObjectInner<T>>| {
            let this: Weak<dyn ObjectApi> = weak.clone();
            ObjectInner {
                data: RwLock::new(data),
                core: ObjectCore::new(this),
            }
        });
        Self { inner }
    }

    pub(crate) fn api(&self) -> Arc<dyn ObjectApi> {
        self.inner.clone()
    }

    /// A handle that does not keep the object alive, for handlers the
    /// object's own dispatcher owns.
    pub(crate) fn downgrade(&self) -> Weak<ObjectInner<T>> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<ObjectInner<T>>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub(crate) fn local_node(&self) -> Option<Arc<LocalNodeInner>> {
        self.inner.core.local_node()
    }

    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.inner.data.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.inner.data.write()
    }

    pub fn id(&self) -> ObjectId {
        self.inner.core.id()
    }

    pub fn instance_id(&self) -> InstanceId {
        self.inner.core.instance_id()
    }

    pub fn is_attached(&self) -> bool {
        self.inner.core.is_attached()
    }

    pub fn is_master(&self) -> bool {
        self.inner.core.cm.read().is_master()
    }

    pub fn change_type(&self) -> ChangeType {
        self.inner.data.read().change_type()
    }

    /// The version currently applied.
    pub fn version(&self) -> Version {
        self.inner.core.cm.read().version()
    }

    /// The newest version known locally.
    pub fn head_version(&self) -> Version {
        self.inner.core.cm.read().head_version()
    }

    /// The oldest version a master can still map slaves at.
    pub fn oldest_version(&self) -> Version {
        self.inner.core.cm.read().oldest_version()
    }

    /// Instance id of the master copy; a master's own instance id.
    pub fn master_instance_id(&self) -> InstanceId {
        let cm = self.inner.core.cm.read();
        if cm.is_master() {
            return self.inner.core.instance_id();
        }
        cm.master_instance_id()
    }

    /// Retain `count` commit incarnations of history.
    pub fn set_auto_obsolete(&self, count: u32) {
        self.inner.core.cm.write().set_auto_obsolete(count);
    }

    pub fn auto_obsolete(&self) -> u32 {
        self.inner.core.cm.read().auto_obsolete()
    }

    pub fn max_versions(&self) -> u64 {
        self.inner.data.read().max_versions()
    }

    /// Commit the current state as the next incarnation.
    pub async fn commit(&self) -> Version {
        self.commit_incarnation(COMMIT_NEXT).await
    }

    /// Commit the current state.
    ///
    /// Returns the new version if something changed, the previous one
    /// otherwise.
    pub async fn commit_incarnation(&self, incarnation: u32) -> Version {
        commit_object(&*self.inner, incarnation).await
    }

    /// Bring the object to `version`.
    ///
    /// [`Version::NEXT`] applies one more version, [`Version::HEAD`]
    /// applies everything already received without waiting, and a concrete
    /// version waits until it has been applied.
    pub async fn sync(&self, version: Version) -> Version {
        sync_object(&*self.inner, version).await
    }

    /// Send the instance data unsolicited to `nodes`.
    ///
    /// The data arrives at the push handler registered for `group_id` on
    /// each receiving node.
    pub fn push(&self, group_id: u128, type_id: u128, nodes: &[Arc<Node>]) -> bool {
        let obj: &dyn ObjectApi = &*self.inner;
        let mut os = self.inner.core.ostream(obj, ObjectCommand::Instance, InstanceId::NONE);
        os.enable_save();
        os.enable(Vec::new());
        obj.get_instance_data(&mut os);
        os.disable();

        let data = os.buffer();
        let name = obj
            .compressor()
            .or_else(|| self.inner.core.local_node().map(|l| l.config().object.compressor))
            .unwrap_or_default();
        let (compressor, chunks) = compress_blob(name, data);
        let packet = weft_proto::packet::node::ObjectPushPacket {
            object_id: self.id(),
            group_id,
            type_id,
            compressor,
            data_size: data.len() as u64,
            chunks,
        };

        let mut sent = true;
        for node in nodes {
            sent &= node.send_packet(&packet);
        }
        sent
    }

    /// Register a handler for a custom object command (id ≥ 10).
    pub fn register_command(
        &self,
        command: u32,
        handler: Handler,
        queue: Option<Arc<CommandQueue>>,
    ) -> Result<(), DispatchError> {
        if command < ObjectCommand::CUSTOM {
            return Err(DispatchError::Reserved(command));
        }
        self.inner.core.register_command(command, handler, queue)
    }

    /// Tell every slave that this master goes away.
    pub fn notify_detach(&self) {
        notify_slaves_detach(&*self.inner);
    }
}

impl<T: Distributed> Clone for Object<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Distributed> fmt::Debug for Object<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Object")
            .field("id", &self.id())
            .field("instance", &self.instance_id())
            .field("version", &self.version())
            .finish()
    }
}

fn compress_blob(name: CompressorName, data: &[u8]) -> (u32, Vec<Blob>) {
    if let Some(compressor) = lookup_compressor(name)
        && !data.is_empty()
        && let Ok(chunks) = compressor.compress(data)
        && chunks.iter().map(Vec::len).sum::<usize>() < data.len()
    {
        return (name as u32, chunks.into_iter().map(Blob).collect());
    }
    (0, vec![Blob(data.to_vec())])
}

// ============================================================================
// Commit and sync
// ============================================================================

pub(crate) async fn commit_object(obj: &dyn ObjectApi, incarnation: u32) -> Version {
    let core = obj.core();
    let gate = core.cm.read().max_version_gate();
    if let Some(gate) = gate {
        let wanted = core.cm.read().version().low.saturating_add(1);
        if gate.timed_wait_ge(wanted, core.config_timeout()).await.is_none() {
            warn!(
                object = %core.id(),
                wanted,
                allowed = gate.get(),
                "Slaves lag behind, committing anyway"
            );
        }
    }

    let _span = crate::telemetry::object_span(core.id(), core.instance_id()).entered();
    core.cm.write().commit(obj, incarnation)
}

pub(crate) async fn sync_object(obj: &dyn ObjectApi, requested: Version) -> Version {
    let core = obj.core();
    let (is_master, queue, current) = {
        let cm = core.cm.read();
        if matches!(*cm, ObjectCm::Null(_)) {
            error!(object = %core.id(), "Sync of an object without change manager");
            return cm.version();
        }
        (cm.is_master(), cm.ready_queue(), cm.version())
    };
    let Some(queue) = queue else {
        return current;
    };
    if is_master {
        return sync_master(obj, &queue, requested).await;
    }

    if requested == Version::HEAD {
        while let Some(stream) = queue.try_pop() {
            apply_stream(obj, &stream);
        }
        return core.cm.read().version();
    }

    let target = if requested == Version::NEXT {
        current.next()
    } else {
        requested
    };
    let timeout = core.config_timeout();
    loop {
        let current = core.cm.read().version();
        if current >= target {
            return current;
        }
        match queue.pop(timeout).await {
            Ok(stream) => apply_stream(obj, &stream),
            Err(e) => {
                warn!(object = %core.id(), %current, %target, error = %e, "Sync gave up");
                return current;
            }
        }
    }
}

fn apply_stream(obj: &dyn ObjectApi, stream: &ObjectDataIStream) {
    let _span = crate::telemetry::object_span(obj.core().id(), obj.core().instance_id()).entered();
    obj.core().cm.write().apply(obj, stream);
}

/// Apply slave commits on a master.
async fn sync_master(
    obj: &dyn ObjectApi,
    queue: &crate::util::MtQueue<ObjectDataIStream>,
    requested: Version,
) -> Version {
    let core = obj.core();
    let unpack = |stream: &ObjectDataIStream| {
        obj.unpack(&mut stream.reader());
        obj.notify_new_version();
    };

    if requested == Version::HEAD {
        while let Some(stream) = queue.try_pop() {
            unpack(&stream);
        }
    } else if requested == Version::NEXT {
        match queue.pop(core.config_timeout()).await {
            Ok(stream) => unpack(&stream),
            Err(e) => warn!(object = %core.id(), error = %e, "No slave commit arrived"),
        }
    } else if requested.high != 0 && !requested.is_sentinel() {
        // Slave commits carry random versions with the high half set.
        loop {
            match queue.pop(core.config_timeout()).await {
                Ok(stream) => {
                    unpack(&stream);
                    if stream.version() == requested {
                        break;
                    }
                }
                Err(e) => {
                    warn!(object = %core.id(), version = %requested, error = %e, "Slave commit did not arrive");
                    break;
                }
            }
        }
    } else {
        let oldest = core.cm.read().oldest_version();
        if requested < oldest {
            warn!(
                object = %core.id(),
                version = %requested,
                %oldest,
                "Sync to a version no longer retained"
            );
            return oldest;
        }
    }
    core.cm.read().version()
}

pub(crate) fn notify_slaves_detach(obj: &dyn ObjectApi) {
    let core = obj.core();
    let slaves = core.cm.read().slave_nodes();
    let packet = UnmapObjectPacket {
        object_id: core.id(),
    };
    for node in slaves {
        debug!(object = %core.id(), node = %node.id(), "Unmapping slave");
        node.send_packet(&packet);
    }
}
