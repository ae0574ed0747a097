//! Byte-bounded LRU cache of intermediate results.
//!
//! Entries are keyed by graph nodes, so any structurally equal subtree built
//! later (by another task, or another merge) finds the stored tensor. All
//! access goes through one mutex; the cache is shared by every worker of a
//! merge and survives across merges until cleared.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use tracing::debug;

use crate::graph::NodeRef;
use crate::{Device, Dtype, Tensor};

/// Upper bound on any cache budget: 8192 MiB.
pub const MAX_CACHE_BYTES: usize = 8192 * 1024 * 1024;

/// Counters since construction or the last [`ResultCache::clear`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups that returned a tensor.
    pub hits: u64,
    /// Lookups that found nothing.
    pub misses: u64,
    /// New entries stored.
    pub inserts: u64,
    /// Entries dropped to stay under capacity.
    pub evictions: u64,
}

impl CacheStats {
    /// Fraction of lookups that hit, or 0 with no lookups.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Entry {
    tensor: Tensor,
    bytes: usize,
    tick: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<NodeRef, Entry>,
    recency: BTreeMap<u64, NodeRef>,
    footprint: usize,
    tick: u64,
    stats: CacheStats,
}

impl Inner {
    fn touch(&mut self, node: &NodeRef) {
        self.tick += 1;
        let tick = self.tick;
        if let Some(entry) = self.entries.get_mut(node) {
            self.recency.remove(&entry.tick);
            entry.tick = tick;
            self.recency.insert(tick, node.clone());
        }
    }

    fn evict_to(&mut self, capacity: usize) {
        while self.footprint > capacity {
            let Some((_, oldest)) = self.recency.pop_first() else {
                break;
            };
            if let Some(entry) = self.entries.remove(&oldest) {
                self.footprint -= entry.bytes;
                self.stats.evictions += 1;
                debug!(
                    "Evicted {} '{}' ({} bytes) from result cache",
                    oldest.op().name(),
                    oldest.key(),
                    entry.bytes
                );
            }
        }
    }
}

/// LRU store from graph node to computed tensor.
pub struct ResultCache {
    capacity: usize,
    target: Option<(Device, Dtype)>,
    inner: Mutex<Inner>,
}

impl ResultCache {
    /// Create a cache holding at most `budget_bytes`, clamped to
    /// [`MAX_CACHE_BYTES`]. A budget of 0 disables caching.
    pub fn new(budget_bytes: usize) -> Self {
        Self {
            capacity: budget_bytes.min(MAX_CACHE_BYTES),
            target: None,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Normalize every returned tensor to `device` and `dtype`.
    pub fn with_target(mut self, device: Device, dtype: Dtype) -> Self {
        self.target = Some((device, dtype));
        self
    }

    /// Effective capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether the cache stores anything at all.
    pub fn is_enabled(&self) -> bool {
        self.capacity > 0
    }

    /// Look up `node`, refreshing its recency. Returns an independent copy.
    pub fn get(&self, node: &NodeRef) -> Option<Tensor> {
        if !self.is_enabled() {
            return None;
        }
        let mut inner = self.inner.lock();
        let tensor = match inner.entries.get(node) {
            Some(entry) => entry.tensor.clone(),
            None => {
                inner.stats.misses += 1;
                return None;
            }
        };
        inner.stats.hits += 1;
        inner.touch(node);
        drop(inner);

        Some(match self.target {
            Some((device, dtype)) => tensor.into_device(device, dtype),
            None => tensor,
        })
    }

    /// Store a copy of `tensor` under `node`, evicting least-recently-used
    /// entries while over capacity. An existing entry only has its recency
    /// refreshed.
    pub fn put(&self, node: &NodeRef, tensor: &Tensor) {
        if !self.is_enabled() {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.entries.contains_key(node) {
            inner.touch(node);
            return;
        }
        inner.tick += 1;
        let tick = inner.tick;
        let bytes = tensor.nbytes();
        inner.entries.insert(
            node.clone(),
            Entry {
                tensor: tensor.clone(),
                bytes,
                tick,
            },
        );
        inner.recency.insert(tick, node.clone());
        inner.footprint += bytes;
        inner.stats.inserts += 1;
        inner.evict_to(self.capacity);
    }

    /// Drop every entry and reset the footprint and counters.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        let dropped = inner.entries.len();
        *inner = Inner::default();
        if dropped > 0 {
            debug!("Cleared {} result cache entries", dropped);
        }
    }

    /// Bytes currently held.
    pub fn footprint(&self) -> usize {
        self.inner.lock().footprint
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats
    }
}

impl std::fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ResultCache")
            .field("capacity", &self.capacity)
            .field("footprint", &inner.footprint)
            .field("entries", &inner.entries.len())
            .finish()
    }
}
