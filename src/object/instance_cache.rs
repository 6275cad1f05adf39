//! Cache of instance data seen on the wire.
//!
//! Every received instance data packet is recorded here, keyed by object
//! id. When an object is mapped later, the versions already cached are fed
//! to the new slave and the master skips resending them.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};
use weft_proto::packet::object::ObjectDataPacket;
use weft_proto::{InstanceId, NodeId, ObjectId, ObjectVersion, Version};

use crate::command::Command;
use crate::stream::ObjectDataIStream;

/// Fraction of the budget eviction shrinks the cache to.
const EVICTION_TARGET: f64 = 0.8;

/// Cached versions of one object, as returned by [`InstanceCache::get`].
#[derive(Debug, Clone)]
pub struct CachedData {
    pub master_instance_id: InstanceId,
    /// Complete versions, oldest first and contiguous.
    pub versions: Vec<ObjectDataIStream>,
}

struct CachedStream {
    stream: ObjectDataIStream,
    added: Instant,
}

struct Item {
    streams: VecDeque<CachedStream>,
    master_instance_id: InstanceId,
    from: NodeId,
    /// Outstanding pins from `get`.
    access: u32,
    used: u32,
}

impl Item {
    fn new(master_instance_id: InstanceId, from: NodeId, used: u32) -> Self {
        Self {
            streams: VecDeque::new(),
            master_instance_id,
            from,
            access: 0,
            used,
        }
    }
}

#[derive(Default)]
struct CacheState {
    items: HashMap<ObjectId, Item>,
    size: u64,
    hits: u64,
}

impl CacheState {
    /// Drop every stream of `item`.
    fn release_streams(&mut self, id: ObjectId) {
        let Some(item) = self.items.get_mut(&id) else {
            return;
        };
        for cached in item.streams.drain(..) {
            if cached.stream.is_ready() {
                self.size -= cached.stream.data_size() as u64;
            }
        }
    }

    /// Drop the oldest stream of `id` if it is complete.
    fn release_first_stream(&mut self, id: ObjectId) -> bool {
        let Some(item) = self.items.get_mut(&id) else {
            return false;
        };
        if !item.streams.front().is_some_and(|c| c.stream.is_ready()) {
            return false;
        }
        if let Some(cached) = item.streams.pop_front() {
            self.size -= cached.stream.data_size() as u64;
            crate::metrics::record_cache_eviction();
        }
        true
    }

    fn evictable(&self, min_usage: u32) -> Vec<ObjectId> {
        self.items
            .iter()
            .filter(|(_, item)| item.access == 0 && item.used >= min_usage)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Evict oldest streams round-robin until the size is under the target.
    fn release_items(&mut self, max_size: u64, min_usage: u32) {
        if self.size <= max_size {
            return;
        }
        let target = (max_size as f64 * EVICTION_TARGET) as u64;
        let candidates = self.evictable(min_usage);

        let mut progress = true;
        while progress && self.size > target {
            progress = false;
            for &id in &candidates {
                if self.size <= target {
                    break;
                }
                progress |= self.release_first_stream(id);
            }
        }

        for id in candidates {
            if self.items.get(&id).is_some_and(|item| item.streams.is_empty()) {
                self.items.remove(&id);
            }
        }
        if self.size > target && min_usage == 0 {
            warn!(
                size = self.size,
                target, "Instance cache still over budget, all remaining entries are pinned"
            );
        }
    }
}

/// Bounded cache of received instance data.
pub struct InstanceCache {
    max_size: u64,
    state: Mutex<CacheState>,
}

impl InstanceCache {
    /// A cache holding at most `max_size` bytes of complete versions.
    pub fn new(max_size: u64) -> Self {
        Self {
            max_size,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Bytes held by complete versions.
    pub fn size(&self) -> u64 {
        self.state.lock().size
    }

    /// Number of objects with cached data.
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Lookups answered with cached data.
    pub fn hits(&self) -> u64 {
        self.state.lock().hits
    }

    /// Complete versions cached for `id`, without pinning them.
    pub fn versions(&self, id: ObjectId) -> Vec<Version> {
        self.state
            .lock()
            .items
            .get(&id)
            .map(|item| {
                item.streams
                    .iter()
                    .filter(|c| c.stream.is_ready())
                    .map(|c| c.stream.version())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Record one instance data packet of `rev`.
    ///
    /// `usage` raises the entry's usage count; entries used by a mapping are
    /// evicted last. Returns `false` if the packet was not cached.
    pub fn add(
        &self,
        rev: ObjectVersion,
        master_instance_id: InstanceId,
        command: &Command,
        usage: u32,
    ) -> bool {
        let sequence = {
            let frame = command.frame();
            match ObjectDataPacket::parse(&frame) {
                Ok(packet) => packet.header.sequence as usize,
                Err(e) => {
                    debug!(error = %e, "Not caching malformed instance data");
                    return false;
                }
            }
        };
        let from = command.node().map(|n| n.id()).unwrap_or(NodeId::ZERO);
        let id = rev.id;
        let version = rev.version;

        let mut guard = self.state.lock();
        let state = &mut *guard;
        let item = state
            .items
            .entry(id)
            .or_insert_with(|| Item::new(master_instance_id, from, usage));

        if item.master_instance_id != master_instance_id || item.from != from {
            if item.access != 0 {
                return false;
            }
            // Data of another master mapping.
            state.release_streams(id);
            let Some(item) = state.items.get_mut(&id) else {
                return false;
            };
            item.master_instance_id = master_instance_id;
            item.from = from;
            item.used = usage;
        } else {
            item.used = item.used.max(usage);
        }

        let Some(item) = state.items.get_mut(&id) else {
            return false;
        };
        // A pending stream that lost a fragment never completes.
        if item
            .streams
            .back()
            .is_some_and(|c| !c.stream.is_ready() && (c.stream.version() != version || c.stream.len() < sequence))
        {
            item.streams.pop_back();
        }
        // Repeated fragment of the pending stream.
        if item
            .streams
            .back()
            .is_some_and(|c| !c.stream.is_ready() && c.stream.version() == version && c.stream.len() > sequence)
        {
            return false;
        }

        let append = match item.streams.back() {
            Some(back) if back.stream.version() == version => {
                if back.stream.is_ready() {
                    return false;
                }
                true
            }
            Some(back) => {
                let previous = back.stream.version();
                if previous > version {
                    return false;
                }
                if previous.next() != version {
                    if item.access != 0 {
                        return false;
                    }
                    state.release_streams(id);
                }
                false
            }
            None => false,
        };

        let Some(item) = state.items.get_mut(&id) else {
            return false;
        };
        if !append {
            if sequence != 0 {
                if item.streams.is_empty() {
                    state.items.remove(&id);
                }
                return false;
            }
            item.streams.push_back(CachedStream {
                stream: ObjectDataIStream::new(),
                added: Instant::now(),
            });
        }

        let Some(cached) = item.streams.back_mut() else {
            return false;
        };
        if let Err(e) = cached.stream.add_data_packet(command.clone()) {
            debug!(error = %e, "Not caching malformed instance data");
            item.streams.pop_back();
            return false;
        }
        if cached.stream.is_ready() {
            state.size += cached.stream.data_size() as u64;
        }

        state.release_items(self.max_size, 1);
        state.release_items(self.max_size, 0);
        true
    }

    /// The complete cached versions of `id`, pinning the entry.
    ///
    /// Every `Some` must be balanced by a [`release`](Self::release).
    pub fn get(&self, id: ObjectId) -> Option<CachedData> {
        let mut state = self.state.lock();
        let Some(item) = state.items.get_mut(&id) else {
            crate::metrics::record_cache_miss();
            return None;
        };
        let versions: Vec<ObjectDataIStream> = item
            .streams
            .iter()
            .filter(|c| c.stream.is_ready())
            .map(|c| c.stream.clone())
            .collect();
        if versions.is_empty() {
            crate::metrics::record_cache_miss();
            return None;
        }
        item.access += 1;
        item.used += 1;
        let master_instance_id = item.master_instance_id;
        state.hits += 1;
        crate::metrics::record_cache_hit();
        Some(CachedData {
            master_instance_id,
            versions,
        })
    }

    /// Unpin `count` earlier [`get`](Self::get)s of `id`.
    pub fn release(&self, id: ObjectId, count: u32) -> bool {
        let mut state = self.state.lock();
        let Some(item) = state.items.get_mut(&id) else {
            return false;
        };
        debug_assert!(item.access >= count, "instance cache released more than pinned");
        item.access = item.access.saturating_sub(count);
        state.release_items(self.max_size, 1);
        true
    }

    /// Drop all data of `id`. Fails while the entry is pinned.
    pub fn erase(&self, id: ObjectId) -> bool {
        let mut state = self.state.lock();
        if state.items.get(&id).is_none_or(|item| item.access != 0) {
            return false;
        }
        state.release_streams(id);
        state.items.remove(&id);
        true
    }

    /// Drop unpinned versions cached longer than `age` ago.
    pub fn expire(&self, age: Duration) {
        let Some(cutoff) = Instant::now().checked_sub(age) else {
            return;
        };
        let mut state = self.state.lock();
        let ids: Vec<ObjectId> = state
            .items
            .iter()
            .filter(|(_, item)| item.access == 0)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            while state
                .items
                .get(&id)
                .and_then(|item| item.streams.front())
                .is_some_and(|c| c.added <= cutoff)
            {
                if !state.release_first_stream(id) {
                    break;
                }
            }
            if state.items.get(&id).is_some_and(|item| item.streams.is_empty()) {
                state.items.remove(&id);
            }
        }
    }

    /// Drop unpinned data received from `node`.
    pub fn remove(&self, node: NodeId) {
        let mut state = self.state.lock();
        let ids: Vec<ObjectId> = state
            .items
            .iter()
            .filter(|(_, item)| item.from == node && item.access == 0)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            state.release_streams(id);
            state.items.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandCache;
    use crate::stream::data_frames;
    use weft_proto::packet::ObjectCommand;

    fn feed(cache: &InstanceCache, commands: &CommandCache, id: u128, version: u64, size: usize) -> bool {
        let data = vec![version as u8; size];
        let mut cached = true;
        for frame in data_frames(ObjectCommand::Instance, Version::from_low(version), &data, 1) {
            let cmd = commands.alloc_frame(None, &frame);
            cached &= cache.add(
                ObjectVersion::new(ObjectId(id), Version::from_low(version)),
                InstanceId(0),
                &cmd,
                0,
            );
        }
        cached
    }

    // ========================================================================
    // Adding
    // ========================================================================

    #[test]
    fn test_contiguous_versions_are_kept() {
        let cache = InstanceCache::new(1 << 20);
        let commands = CommandCache::new();
        for v in 1..=3 {
            assert!(feed(&cache, &commands, 1, v, 16));
        }
        let data = cache.get(ObjectId(1)).unwrap();
        let versions: Vec<u64> = data.versions.iter().map(|s| s.version().low).collect();
        assert_eq!(versions, vec![1, 2, 3]);
        assert_eq!(data.master_instance_id, InstanceId(0));
        assert!(cache.release(ObjectId(1), 1));
    }

    #[test]
    fn test_duplicate_and_old_versions_are_rejected() {
        let cache = InstanceCache::new(1 << 20);
        let commands = CommandCache::new();
        assert!(feed(&cache, &commands, 1, 2, 16));
        assert!(!feed(&cache, &commands, 1, 2, 16));
        assert!(!feed(&cache, &commands, 1, 1, 16));
    }

    #[test]
    fn test_gap_restarts_unpinned_entry() {
        let cache = InstanceCache::new(1 << 20);
        let commands = CommandCache::new();
        assert!(feed(&cache, &commands, 1, 1, 16));
        assert!(feed(&cache, &commands, 1, 5, 16));
        let data = cache.get(ObjectId(1)).unwrap();
        assert_eq!(data.versions.len(), 1);
        assert_eq!(data.versions[0].version(), Version::from_low(5));

        // Pinned now: a gap must not disturb the reader.
        assert!(!feed(&cache, &commands, 1, 9, 16));
        assert!(cache.release(ObjectId(1), 1));
    }

    // ========================================================================
    // Eviction
    // ========================================================================

    #[test]
    fn test_flood_stays_under_target_and_pinned_entry_survives() {
        let budget = 4096;
        let target = (budget as f64 * EVICTION_TARGET) as u64;
        let cache = InstanceCache::new(budget);
        let commands = CommandCache::new();
        assert!(feed(&cache, &commands, 99, 1, 256));
        let pinned = cache.get(ObjectId(99)).unwrap();

        let mut evictions = 0;
        for id in 0..64 {
            for v in 1..=3 {
                let before = cache.size();
                assert!(feed(&cache, &commands, id, v, 256));
                let after = cache.size();
                if after < before + 256 {
                    evictions += 1;
                    assert!(after <= target, "evicted down to {after}, target is {target}");
                }
                assert!(after <= budget);
            }
        }
        assert!(evictions > 0);
        assert_eq!(cache.versions(ObjectId(99)), vec![Version::FIRST]);
        assert!(cache.get(ObjectId(99)).is_some());
        assert_eq!(pinned.versions.len(), 1);
        cache.release(ObjectId(99), 2);
    }

    #[test]
    fn test_pinned_entry_above_target_is_kept() {
        let budget = 1000;
        let cache = InstanceCache::new(budget);
        let commands = CommandCache::new();
        assert!(feed(&cache, &commands, 99, 1, 900));
        let _pin = cache.get(ObjectId(99)).unwrap();

        let mut evictions = 0;
        for id in 0..8 {
            let before = cache.size();
            assert!(feed(&cache, &commands, id, 1, 100));
            let after = cache.size();
            if after < before + 100 {
                evictions += 1;
                // Only the pinned entry is left.
                assert_eq!(after, 900);
                assert_eq!(cache.len(), 1);
            }
            assert!(after <= budget);
        }
        assert!(evictions > 0);
        assert_eq!(cache.versions(ObjectId(99)), vec![Version::FIRST]);
        cache.release(ObjectId(99), 1);
    }

    #[test]
    fn test_erase_fails_while_pinned() {
        let cache = InstanceCache::new(1 << 20);
        let commands = CommandCache::new();
        feed(&cache, &commands, 1, 1, 16);
        let _pin = cache.get(ObjectId(1)).unwrap();
        assert!(!cache.erase(ObjectId(1)));
        cache.release(ObjectId(1), 1);
        assert!(cache.erase(ObjectId(1)));
        assert_eq!(cache.size(), 0);
        assert!(cache.get(ObjectId(1)).is_none());
    }

    #[test]
    fn test_expire_and_remove() {
        let cache = InstanceCache::new(1 << 20);
        let commands = CommandCache::new();
        feed(&cache, &commands, 1, 1, 16);
        feed(&cache, &commands, 2, 1, 16);

        cache.expire(Duration::from_secs(3600));
        assert_eq!(cache.len(), 2);
        cache.expire(Duration::ZERO);
        assert!(cache.is_empty());
        assert_eq!(cache.size(), 0);

        feed(&cache, &commands, 3, 1, 16);
        cache.remove(NodeId(5));
        assert_eq!(cache.len(), 1);
        // Commands without a node are recorded as coming from ZERO.
        cache.remove(NodeId::ZERO);
        assert!(cache.is_empty());
    }
}
