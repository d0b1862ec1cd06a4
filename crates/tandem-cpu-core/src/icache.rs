//! Decoded-trace cache keyed by physical address and fetch mode, plus direct
//! links between consecutive traces.
//!
//! Links are validated lazily: each carries the `link_stamp` it was recorded
//! under, and bumping the stamp drops every link at once without touching the
//! traces themselves.

use std::collections::HashMap;

use tracing::debug;

use crate::mode::FetchMode;

/// Maximum instructions per trace.
pub const MAX_TRACE_LENGTH: usize = 32;
/// Traces kept before the cache is flushed wholesale.
pub const ICACHE_ENTRIES: usize = 64 * 1024;
/// Maximum links followed in one dispatch before falling back to a lookup.
pub const MAX_LINK_DEPTH: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraceKey {
    pub paddr: u64,
    pub mode: FetchMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraceId(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TraceLink {
    target: TraceId,
    target_rip: u64,
    stamp: u32,
}

#[derive(Debug, Clone)]
pub struct Trace<T> {
    pub key: TraceKey,
    insts: Vec<T>,
    link: Option<TraceLink>,
}

impl<T> Trace<T> {
    pub fn insts(&self) -> &[T] {
        &self.insts
    }

    pub fn len(&self) -> usize {
        self.insts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insts.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ICacheStats {
    pub lookups: u64,
    pub misses: u64,
    pub prefetches: u64,
    pub flushes: u64,
    pub links_recorded: u64,
    pub links_followed: u64,
    pub max_link_depth: u32,
}

#[derive(Debug, Clone)]
pub struct ICache<T> {
    traces: Vec<Trace<T>>,
    index: HashMap<TraceKey, TraceId>,
    capacity: usize,
    link_stamp: u32,
    generation: u32,
    stats: ICacheStats,
}

impl<T> Default for ICache<T> {
    fn default() -> Self {
        Self::with_capacity(ICACHE_ENTRIES)
    }
}

impl<T> ICache<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            traces: Vec::new(),
            index: HashMap::new(),
            capacity: capacity.max(1),
            link_stamp: 0,
            generation: 0,
            stats: ICacheStats::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.traces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.traces.is_empty()
    }

    /// Bumped by every flush; a [`TraceId`] is only valid within one generation.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn stats(&self) -> &ICacheStats {
        &self.stats
    }

    pub(crate) fn stats_mut(&mut self) -> &mut ICacheStats {
        &mut self.stats
    }

    pub fn lookup(&mut self, key: TraceKey) -> Option<TraceId> {
        self.stats.lookups += 1;
        let hit = self.index.get(&key).copied();
        if hit.is_none() {
            self.stats.misses += 1;
        }
        hit
    }

    /// Inserts a freshly decoded trace, flushing first when full.
    pub fn insert(&mut self, key: TraceKey, insts: Vec<T>) -> TraceId {
        debug_assert!(insts.len() <= MAX_TRACE_LENGTH);
        if self.traces.len() >= self.capacity {
            debug!(entries = self.traces.len(), "instruction cache full");
            self.flush();
        }
        let id = TraceId(self.traces.len() as u32);
        self.traces.push(Trace {
            key,
            insts,
            link: None,
        });
        self.index.insert(key, id);
        id
    }

    pub fn trace(&self, id: TraceId) -> &Trace<T> {
        &self.traces[id.0 as usize]
    }

    /// The linked successor of `from`, if one was recorded under the current
    /// stamp for the trace starting at `rip`.
    pub fn linked_successor(&self, from: TraceId, rip: u64) -> Option<TraceId> {
        let link = self.traces[from.0 as usize].link?;
        (link.stamp == self.link_stamp && link.target_rip == rip).then_some(link.target)
    }

    pub fn link(&mut self, from: TraceId, to: TraceId, to_rip: u64) {
        self.traces[from.0 as usize].link = Some(TraceLink {
            target: to,
            target_rip: to_rip,
            stamp: self.link_stamp,
        });
        self.stats.links_recorded += 1;
    }

    /// Drops every link without discarding decoded traces.
    pub fn invalidate_links(&mut self) {
        self.link_stamp = self.link_stamp.wrapping_add(1);
    }

    pub fn flush(&mut self) {
        self.traces.clear();
        self.index.clear();
        self.generation = self.generation.wrapping_add(1);
        self.invalidate_links();
        self.stats.flushes += 1;
    }
}

/// Depth of the current chain of followed links.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkDepth(u32);

impl LinkDepth {
    /// Counts one more link. Returns `false` (and resets) past the bound.
    pub fn enter(&mut self) -> bool {
        self.0 += 1;
        if self.0 > MAX_LINK_DEPTH {
            self.0 = 0;
            return false;
        }
        true
    }

    pub fn reset(&mut self) {
        self.0 = 0;
    }

    pub fn get(&self) -> u32 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(paddr: u64) -> TraceKey {
        TraceKey {
            paddr,
            mode: FetchMode::IS_32,
        }
    }

    #[test]
    fn lookup_distinguishes_fetch_mode() {
        let mut cache = ICache::default();
        let id = cache.insert(key(0x1000), vec![1u8, 2, 3]);
        assert_eq!(cache.lookup(key(0x1000)), Some(id));
        let other_mode = TraceKey {
            paddr: 0x1000,
            mode: FetchMode::IS_64 | FetchMode::IS_32,
        };
        assert_eq!(cache.lookup(other_mode), None);
        assert_eq!(cache.stats().lookups, 2);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn links_die_with_stamp() {
        let mut cache = ICache::default();
        let a = cache.insert(key(0x1000), vec![0u8]);
        let b = cache.insert(key(0x2000), vec![0u8]);
        cache.link(a, b, 0x2000);
        assert_eq!(cache.linked_successor(a, 0x2000), Some(b));
        assert_eq!(cache.linked_successor(a, 0x3000), None);
        cache.invalidate_links();
        assert_eq!(cache.linked_successor(a, 0x2000), None);
    }

    #[test]
    fn full_cache_flushes() {
        let mut cache = ICache::with_capacity(2);
        cache.insert(key(0x1000), vec![0u8]);
        cache.insert(key(0x2000), vec![0u8]);
        let generation = cache.generation();
        cache.insert(key(0x3000), vec![0u8]);
        assert_eq!(cache.len(), 1);
        assert_ne!(cache.generation(), generation);
        assert_eq!(cache.lookup(key(0x1000)), None);
    }

    #[test]
    fn link_depth_is_bounded() {
        let mut depth = LinkDepth::default();
        for _ in 0..MAX_LINK_DEPTH {
            assert!(depth.enter());
        }
        assert!(!depth.enter());
        assert_eq!(depth.get(), 0);
    }
}
