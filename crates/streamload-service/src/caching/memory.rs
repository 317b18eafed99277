use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::intention::CacheKey;

use super::{DiskCache, IrrecoverableFailures, OngoingRequests};

/// The memory pressure reported by the client when asking caches to shrink.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum MemoryPressure {
    Normal,
    Warning,
    Full,
}

impl MemoryPressure {
    fn as_str(self) -> &'static str {
        match self {
            MemoryPressure::Normal => "normal",
            MemoryPressure::Warning => "warning",
            MemoryPressure::Full => "full",
        }
    }
}

struct CacheItem<A> {
    asset: A,
    ref_count: usize,
    last_used: Instant,
}

/// A reference counted in-memory cache of loaded assets.
pub struct StreamableCache<A> {
    name: &'static str,
    entries: Mutex<HashMap<CacheKey, CacheItem<A>>>,
    ongoing: OngoingRequests<A>,
    failures: IrrecoverableFailures,
    disk: Option<Arc<DiskCache>>,
}

impl<A: Clone + Send + Sync + 'static> StreamableCache<A> {
    /// Creates an empty cache, `name` is used in logs and metrics.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: Mutex::new(HashMap::new()),
            ongoing: OngoingRequests::new(),
            failures: IrrecoverableFailures::default(),
            disk: None,
        }
    }

    /// Backs this cache with payloads stored on disk.
    pub fn with_disk_cache(mut self, disk: DiskCache) -> Self {
        self.disk = Some(Arc::new(disk));
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Looks up a loaded asset without taking a reference to it.
    pub fn try_get(&self, key: &CacheKey) -> Option<A> {
        metric!(counter("caches.access") += 1, "cache" => self.name);

        let mut entries = self.entries.lock().unwrap();
        let item = entries.get_mut(key)?;
        item.last_used = Instant::now();

        metric!(counter("caches.memory.hit") += 1, "cache" => self.name);
        Some(item.asset.clone())
    }

    /// Inserts or overwrites `key`, holding at least one reference to it.
    pub fn add(&self, key: CacheKey, asset: A) {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();
        entries
            .entry(key)
            .and_modify(|item| {
                item.asset = asset.clone();
                item.ref_count = item.ref_count.max(1);
                item.last_used = now;
            })
            .or_insert_with(|| CacheItem {
                asset,
                ref_count: 1,
                last_used: now,
            });
    }

    /// Takes another reference to `key`.
    ///
    /// If the entry was evicted in the meantime, it is inserted again with `asset`.
    pub fn add_reference(&self, key: &CacheKey, asset: A) {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();
        match entries.get_mut(key) {
            Some(item) => {
                item.ref_count += 1;
                item.last_used = now;
            }
            None => {
                entries.insert(
                    key.clone(),
                    CacheItem {
                        asset,
                        ref_count: 1,
                        last_used: now,
                    },
                );
            }
        }
    }

    /// Gives up one reference to `key` and returns the remaining count.
    pub fn release(&self, key: &CacheKey) -> Option<usize> {
        let mut entries = self.entries.lock().unwrap();
        let item = entries.get_mut(key)?;
        item.ref_count = item.ref_count.saturating_sub(1);
        Some(item.ref_count)
    }

    /// Evicts up to `max_count` unreferenced entries, least recently used first.
    ///
    /// Referenced entries are never evicted. Returns the number of evicted entries.
    pub fn unload(&self, pressure: MemoryPressure, max_count: usize) -> usize {
        let evicted: Vec<A> = {
            let mut entries = self.entries.lock().unwrap();

            let mut candidates: Vec<_> = entries
                .iter()
                .filter(|(_, item)| item.ref_count == 0)
                .map(|(key, item)| (item.last_used, key.clone()))
                .collect();
            candidates.sort();

            candidates
                .into_iter()
                .take(max_count)
                .filter_map(|(_, key)| entries.remove(&key))
                .map(|item| item.asset)
                .collect()
        };

        // assets are dropped outside of the lock
        let count = evicted.len();
        drop(evicted);

        tracing::debug!(
            cache = self.name,
            pressure = pressure.as_str(),
            "Unloaded {count} entries",
        );
        metric!(
            counter("caches.unload.evicted") += count as i64,
            "cache" => self.name,
            "pressure" => pressure.as_str(),
        );

        count
    }

    /// The reference count of `key`, if it is loaded.
    pub fn ref_count(&self, key: &CacheKey) -> Option<usize> {
        let entries = self.entries.lock().unwrap();
        entries.get(key).map(|item| item.ref_count)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The single-flight table of this cache.
    pub fn ongoing_requests(&self) -> &OngoingRequests<A> {
        &self.ongoing
    }

    /// The memoized failures of this cache.
    pub fn irrecoverable_failures(&self) -> &IrrecoverableFailures {
        &self.failures
    }

    /// The on-disk tier, if this cache has one.
    pub fn disk_cache(&self) -> Option<&Arc<DiskCache>> {
        self.disk.as_ref()
    }
}

impl<A> fmt::Debug for StreamableCache<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.lock().map(|e| e.len()).unwrap_or_default();
        f.debug_struct("StreamableCache")
            .field("name", &self.name)
            .field("entries", &entries)
            .field("disk", &self.disk)
            .finish()
    }
}
