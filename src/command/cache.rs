//! Freelist allocator for commands.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use weft_proto::packet::MIN_PACKET_SIZE;

use super::{Command, CommandSlot};
use crate::network::Node;

/// Free slots kept in the small-command pool.
const MIN_FREE_SMALL: usize = 200;
/// Free slots kept in the big-command pool.
const MIN_FREE_BIG: usize = 20;

struct Pool {
    slots: Vec<Arc<CommandSlot>>,
    position: usize,
    free: Arc<AtomicUsize>,
    min_free: usize,
    max_free: usize,
}

impl Pool {
    fn new(min_free: usize) -> Self {
        let free = Arc::new(AtomicUsize::new(0));
        let mut pool = Self {
            slots: Vec::new(),
            position: 0,
            free,
            min_free,
            max_free: min_free,
        };
        pool.grow(1);
        pool
    }

    fn grow(&mut self, add: usize) {
        for _ in 0..add {
            self.slots.push(Arc::new(CommandSlot::new(Arc::clone(&self.free))));
        }
        self.free.fetch_add(add, Ordering::AcqRel);
        self.max_free = self.min_free.max(self.slots.len() >> 1);
        self.position = 0;
    }

    /// Drop free slots until half of `max_free` remain.
    fn compact(&mut self) {
        let mut current = self.free.load(Ordering::Acquire);
        if current <= self.max_free {
            return;
        }
        let target = self.max_free >> 1;
        let mut i = 0;
        while i < self.slots.len() && current > target {
            // A free slot with no outside Arc can be dropped safely.
            if self.slots[i].is_free() && Arc::strong_count(&self.slots[i]) == 1 {
                self.slots.swap_remove(i);
                current = self.free.fetch_sub(1, Ordering::AcqRel) - 1;
            } else {
                i += 1;
            }
        }
        self.max_free = self.min_free.max(self.slots.len() >> 1);
        self.position = 0;
    }

    /// Find a free slot, scanning from just after the last hit.
    fn claim(&mut self) -> Arc<CommandSlot> {
        self.compact();

        let len = self.slots.len();
        if self.free.load(Ordering::Acquire) > 0 && len > 0 {
            for step in 1..=len {
                let i = (self.position + step) % len;
                if self.slots[i].claim() {
                    self.position = i;
                    return Arc::clone(&self.slots[i]);
                }
            }
        }

        let add = (len >> 3) + 1;
        self.grow(add);
        let last = self.slots.len() - 1;
        let slot = Arc::clone(&self.slots[last]);
        let claimed = slot.claim();
        debug_assert!(claimed, "fresh slot must be claimable");
        self.position = last;
        slot
    }

    fn flush(&mut self) {
        let before = self.slots.len();
        self.slots
            .retain(|slot| !(slot.is_free() && Arc::strong_count(slot) == 1));
        let dropped = before - self.slots.len();
        self.free.fetch_sub(dropped, Ordering::AcqRel);
        self.max_free = self.min_free;
        self.position = 0;
        if self.slots.is_empty() {
            self.grow(1);
        }
    }
}

/// Pooled allocator for [`Command`]s.
///
/// Small and big commands are kept in separate pools so that a burst of
/// large object packets does not pin memory for every small node packet.
pub struct CommandCache {
    small: Mutex<Pool>,
    big: Mutex<Pool>,
    allocations: AtomicU64,
}

impl CommandCache {
    pub fn new() -> Self {
        Self {
            small: Mutex::new(Pool::new(MIN_FREE_SMALL)),
            big: Mutex::new(Pool::new(MIN_FREE_BIG)),
            allocations: AtomicU64::new(0),
        }
    }

    fn pool(&self, size: usize) -> &Mutex<Pool> {
        if size > MIN_PACKET_SIZE {
            &self.big
        } else {
            &self.small
        }
    }

    /// Get a command whose buffer holds at least `size` bytes.
    pub fn alloc(&self, node: Option<Arc<Node>>, size: usize) -> Command {
        let slot = self.pool(size).lock().claim();
        if slot.reserve(size) {
            self.allocations.fetch_add(1, Ordering::Relaxed);
            crate::metrics::record_command_allocation();
        }
        let command = Command::from_claimed(slot);
        command.set_node(node);
        command
    }

    /// Allocate a command holding a copy of `frame`.
    pub fn alloc_frame(&self, node: Option<Arc<Node>>, frame: &[u8]) -> Command {
        let command = self.alloc(node, frame.len());
        command.write_frame(frame);
        command
    }

    /// Get a command sharing the buffer of `from`.
    ///
    /// The clone owns no buffer; dropping it releases its hold on `from`.
    pub fn clone_command(&self, from: &Command) -> Command {
        let slot = self.pool(from.len()).lock().claim();
        Command::clone_of(slot, from)
    }

    /// Drop every free slot.
    pub fn flush(&self) {
        self.small.lock().flush();
        self.big.lock().flush();
    }

    /// Number of buffer allocations made so far.
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Slots held by the small and big pools.
    pub fn pool_sizes(&self) -> (usize, usize) {
        (self.small.lock().slots.len(), self.big.lock().slots.len())
    }

    /// Free slots in the small and big pools.
    pub fn free_counts(&self) -> (usize, usize) {
        (
            self.small.lock().free.load(Ordering::Acquire),
            self.big.lock().free.load(Ordering::Acquire),
        )
    }
}

impl Default for CommandCache {
    fn default() -> Self {
        Self::new()
    }
}
