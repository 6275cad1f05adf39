//! The command pipeline.
//!
//! Every packet that arrives at a [`LocalNode`](crate::network::LocalNode)
//! becomes a [`Command`]: a pooled, reference-counted envelope around the
//! packet bytes. Commands are allocated from a [`CommandCache`], routed by a
//! [`Dispatcher`] and, when the handler wants to run off the receiver task,
//! handed over through a [`CommandQueue`].

mod cache;
mod dispatcher;
mod queue;

pub use cache::CommandCache;
pub use dispatcher::{Dispatcher, Handler};
pub use queue::CommandQueue;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use parking_lot::{MappedRwLockReadGuard, MappedRwLockWriteGuard, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use weft_proto::packet::{HEADER_SIZE, Packet, PacketHeader, PacketType};
use weft_proto::ProtocolError;

use crate::network::Node;

// ============================================================================
// Slot
// ============================================================================

/// Storage behind a [`Command`]. Owned by the cache and reused.
pub(crate) struct CommandSlot {
    refs: AtomicUsize,
    free: AtomicBool,
    buffer: RwLock<Vec<u8>>,
    len: AtomicUsize,
    packet_type: AtomicU32,
    command: AtomicU32,
    node: RwLock<Option<Arc<Node>>>,
    /// Set for clones; keeps the command owning the buffer alive.
    master: Mutex<Option<Command>>,
    dispatch: Mutex<Option<Handler>>,
    pool_free: Arc<AtomicUsize>,
}

impl CommandSlot {
    pub(crate) fn new(pool_free: Arc<AtomicUsize>) -> Self {
        Self {
            refs: AtomicUsize::new(0),
            free: AtomicBool::new(true),
            buffer: RwLock::new(Vec::new()),
            len: AtomicUsize::new(0),
            packet_type: AtomicU32::new(0),
            command: AtomicU32::new(0),
            node: RwLock::new(None),
            master: Mutex::new(None),
            dispatch: Mutex::new(None),
            pool_free,
        }
    }

    pub(crate) fn is_free(&self) -> bool {
        self.free.load(Ordering::Acquire)
    }

    /// Take ownership of a free slot. Returns false if another thread won.
    pub(crate) fn claim(&self) -> bool {
        if self
            .free
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.refs.store(1, Ordering::Release);
        self.pool_free.fetch_sub(1, Ordering::AcqRel);
        true
    }

    pub(crate) fn capacity(&self) -> usize {
        self.buffer.read().capacity()
    }

    /// Make room for `size` bytes. Returns true if the buffer had to grow.
    pub(crate) fn reserve(&self, size: usize) -> bool {
        let mut buffer = self.buffer.write();
        buffer.clear();
        if buffer.capacity() >= size {
            return false;
        }
        buffer.reserve_exact(size);
        true
    }

    fn release(&self) {
        // Clear everything before the slot becomes claimable again.
        let master = self.master.lock().take();
        *self.node.write() = None;
        *self.dispatch.lock() = None;
        self.len.store(0, Ordering::Release);
        self.pool_free.fetch_add(1, Ordering::AcqRel);
        self.free.store(true, Ordering::Release);
        drop(master);
    }
}

// ============================================================================
// Command
// ============================================================================

/// A handle to one received packet.
///
/// Cloning a handle retains the command; dropping the last handle returns
/// its slot to the cache. Clones made through
/// [`CommandCache::clone_command`] share the buffer of their master.
pub struct Command {
    slot: Arc<CommandSlot>,
    data: Arc<CommandSlot>,
}

impl Command {
    pub(crate) fn from_claimed(slot: Arc<CommandSlot>) -> Self {
        Self {
            data: Arc::clone(&slot),
            slot,
        }
    }

    /// Bind a freshly claimed slot to the buffer of `master`.
    pub(crate) fn clone_of(slot: Arc<CommandSlot>, master: &Command) -> Self {
        *slot.node.write() = master.node();
        slot.len.store(master.len(), Ordering::Release);
        slot.packet_type
            .store(master.slot.packet_type.load(Ordering::Acquire), Ordering::Release);
        slot.command
            .store(master.slot.command.load(Ordering::Acquire), Ordering::Release);
        *slot.master.lock() = Some(master.clone());
        Self {
            data: Arc::clone(&master.data),
            slot,
        }
    }

    pub(crate) fn set_node(&self, node: Option<Arc<Node>>) {
        *self.slot.node.write() = node;
    }

    /// Copy a complete frame into the command buffer.
    ///
    /// # Panics
    ///
    /// Panics when called on a clone, which owns no buffer.
    pub fn write_frame(&self, frame: &[u8]) {
        assert!(
            Arc::ptr_eq(&self.slot, &self.data),
            "cannot write into a cloned command"
        );
        let mut buffer = self.data.buffer.write();
        buffer.clear();
        buffer.extend_from_slice(frame);
        self.slot.len.store(frame.len(), Ordering::Release);
        self.refresh_header(&buffer);
    }

    fn refresh_header(&self, frame: &[u8]) {
        let (packet_type, command) = match PacketHeader::parse(frame) {
            Ok(h) => (h.packet_type, h.command),
            Err(_) => (u32::MAX, u32::MAX),
        };
        self.slot.packet_type.store(packet_type, Ordering::Release);
        self.slot.command.store(command, Ordering::Release);
    }

    /// The frame bytes, header included.
    pub fn frame(&self) -> MappedRwLockReadGuard<'_, [u8]> {
        let len = self.len();
        RwLockReadGuard::map(self.data.buffer.read(), move |b| &b[..len.min(b.len())])
    }

    /// Mutable frame bytes, for in-place rerouting.
    pub fn frame_mut(&self) -> MappedRwLockWriteGuard<'_, [u8]> {
        let len = self.len();
        RwLockWriteGuard::map(self.data.buffer.write(), move |b| {
            let end = len.min(b.len());
            &mut b[..end]
        })
    }

    pub fn len(&self) -> usize {
        self.slot.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() <= HEADER_SIZE
    }

    /// Raw packet type from the header; `u32::MAX` for unparseable frames.
    pub fn packet_type(&self) -> u32 {
        self.slot.packet_type.load(Ordering::Acquire)
    }

    pub fn kind(&self) -> Option<PacketType> {
        PacketType::from_u32(self.packet_type()).ok()
    }

    pub fn command(&self) -> u32 {
        self.slot.command.load(Ordering::Acquire)
    }

    /// Rewrite the command id so the packet dispatches to another handler.
    pub fn set_command(&self, command: u32) {
        {
            let mut frame = self.frame_mut();
            if let Some(slot) = frame.get_mut(12..16) {
                slot.copy_from_slice(&command.to_le_bytes());
            }
        }
        self.slot.command.store(command, Ordering::Release);
    }

    /// The node this command was received from.
    pub fn node(&self) -> Option<Arc<Node>> {
        self.slot.node.read().clone()
    }

    /// Decode the frame as a typed packet.
    pub fn packet<P: Packet>(&self) -> Result<P, ProtocolError> {
        P::from_frame(&self.frame())
    }

    /// Another handle to the same command.
    pub fn retain(&self) -> Self {
        self.clone()
    }

    pub fn ref_count(&self) -> usize {
        self.slot.refs.load(Ordering::Acquire)
    }

    /// Whether this handle shares another command's buffer.
    pub fn is_clone(&self) -> bool {
        !Arc::ptr_eq(&self.slot, &self.data)
    }

    /// Attach the handler that [`invoke`](Self::invoke) will run.
    ///
    /// # Panics
    ///
    /// Panics if a dispatch function is already set.
    pub fn set_dispatch_function(&self, handler: Handler) {
        let mut dispatch = self.slot.dispatch.lock();
        assert!(
            dispatch.is_none(),
            "command {} already has a dispatch function",
            self.command()
        );
        *dispatch = Some(handler);
    }

    /// Run and clear the dispatch function.
    ///
    /// # Panics
    ///
    /// Panics if no dispatch function is set, including on a second call.
    pub fn invoke(&self) -> bool {
        let handler = self.slot.dispatch.lock().take();
        match handler {
            Some(handler) => handler(self),
            None => panic!("command {} invoked without dispatch function", self.command()),
        }
    }
}

impl Clone for Command {
    fn clone(&self) -> Self {
        self.slot.refs.fetch_add(1, Ordering::AcqRel);
        Self {
            slot: Arc::clone(&self.slot),
            data: Arc::clone(&self.data),
        }
    }
}

impl Drop for Command {
    fn drop(&mut self) {
        if self.slot.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.slot.release();
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("type", &self.packet_type())
            .field("command", &self.command())
            .field("len", &self.len())
            .field("refs", &self.ref_count())
            .field("clone", &self.is_clone())
            .finish()
    }
}
