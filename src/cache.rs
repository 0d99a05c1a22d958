//! Sharded, reference-counted LRU cache of built indexes.
//!
//! Keys are hashed onto independent shards, each guarded by its own mutex and
//! keeping its own recency order. A successful [`IndexCache::lookup`] returns a
//! [`CacheHandle`] lease; entries with an outstanding lease are skipped by
//! eviction. Evicting or replacing an entry only drops the cache's own
//! [`IndexRef`], so an index stays alive for as long as anyone holds it.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::handle::{IndexHandle, IndexRef};
use crate::{IndexError, StateError};

const DEFAULT_NUM_SHARDS: usize = 16;
const DEFAULT_SHARD_BYTES: usize = 256 * 1024 * 1024;

/// Per-shard budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheCapacity {
    /// At most this many entries per shard.
    Entries(usize),
    /// At most this many bytes of [`IndexHandle::memory_usage`] per shard.
    Bytes(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexCacheConfig {
    pub num_shards: usize,
    pub capacity: CacheCapacity,
}

impl Default for IndexCacheConfig {
    fn default() -> Self {
        Self {
            num_shards: DEFAULT_NUM_SHARDS,
            capacity: CacheCapacity::Bytes(DEFAULT_SHARD_BYTES),
        }
    }
}

/// Counters accumulated since the cache was created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
    /// Charge currently held by each shard.
    pub shard_usage: Vec<usize>,
}

struct CacheEntry {
    value: IndexRef,
    leases: Arc<AtomicUsize>,
    charge: usize,
}

impl CacheEntry {
    fn is_leased(&self) -> bool {
        self.leases.load(Ordering::Acquire) > 0
    }
}

struct Shard {
    entries: LruCache<String, CacheEntry>,
    usage: usize,
    capacity: usize,
}

impl Shard {
    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.pop(key)?;
        self.usage -= entry.charge;
        Some(entry)
    }

    /// Drop idle entries, least recently used first, until `incoming` more
    /// units fit or nothing idle is left. Returns the number of evictions.
    fn make_room(&mut self, incoming: usize) -> u64 {
        if self.usage + incoming <= self.capacity {
            return 0;
        }
        let mut needed = self.usage + incoming - self.capacity;
        let mut victims = Vec::new();
        for (key, entry) in self.entries.iter().rev() {
            if needed == 0 {
                break;
            }
            if entry.is_leased() {
                continue;
            }
            needed = needed.saturating_sub(entry.charge.max(1));
            victims.push(key.clone());
        }
        for key in &victims {
            self.remove(key);
            tracing::debug!(key = %key, "evicted index from cache");
        }
        victims.len() as u64
    }

    /// Drop every idle entry.
    fn prune(&mut self) -> u64 {
        let idle: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| !entry.is_leased())
            .map(|(key, _)| key.clone())
            .collect();
        for key in &idle {
            self.remove(key);
        }
        idle.len() as u64
    }
}

/// A lease on a cached index. The entry it was taken from cannot be evicted
/// until the lease is dropped.
pub struct CacheHandle {
    key: String,
    value: IndexRef,
    leases: Arc<AtomicUsize>,
}

impl CacheHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn index(&self) -> &IndexHandle {
        &self.value
    }

    /// A shared reference that outlives the lease. Holding it keeps the index
    /// alive but does not protect the cache entry from eviction.
    pub fn index_ref(&self) -> IndexRef {
        Arc::clone(&self.value)
    }
}

impl std::fmt::Debug for CacheHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheHandle")
            .field("key", &self.key)
            .field("index_type", &self.value.index_type())
            .finish()
    }
}

impl Drop for CacheHandle {
    fn drop(&mut self) {
        self.leases.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct IndexCache {
    shards: Box<[Mutex<Shard>]>,
    charge_bytes: bool,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

static GLOBAL_CACHE: OnceLock<Arc<IndexCache>> = OnceLock::new();

impl IndexCache {
    pub fn new(config: IndexCacheConfig) -> Self {
        let num_shards = config.num_shards.max(1);
        let (capacity, charge_bytes) = match config.capacity {
            CacheCapacity::Entries(n) => (n, false),
            CacheCapacity::Bytes(n) => (n, true),
        };
        let shards = (0..num_shards)
            .map(|_| {
                Mutex::new(Shard {
                    entries: LruCache::unbounded(),
                    usage: 0,
                    capacity,
                })
            })
            .collect();
        Self {
            shards,
            charge_bytes,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// The process-wide cache, created with the default configuration on
    /// first use unless [`IndexCache::init_global`] ran earlier.
    pub fn global() -> Arc<IndexCache> {
        Arc::clone(GLOBAL_CACHE.get_or_init(|| Arc::new(IndexCache::new(IndexCacheConfig::default()))))
    }

    /// Configure the process-wide cache. Fails once it exists.
    pub fn init_global(config: IndexCacheConfig) -> Result<Arc<IndexCache>, IndexError> {
        let mut created = false;
        let cache = GLOBAL_CACHE.get_or_init(|| {
            created = true;
            Arc::new(IndexCache::new(config))
        });
        if !created {
            return Err(StateError::AlreadyInitialized("global index cache").into());
        }
        Ok(Arc::clone(cache))
    }

    fn shard(&self, key: &str) -> &Mutex<Shard> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() % self.shards.len() as u64) as usize;
        &self.shards[idx]
    }

    fn charge_of(&self, handle: &IndexHandle) -> usize {
        if self.charge_bytes {
            handle.memory_usage()
        } else {
            1
        }
    }

    /// Lease the entry for `key`, marking it most recently used.
    pub fn lookup(&self, key: &str) -> Option<CacheHandle> {
        let mut shard = self.shard(key).lock();
        match shard.entries.get(key) {
            Some(entry) => {
                entry.leases.fetch_add(1, Ordering::AcqRel);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(CacheHandle {
                    key: key.to_string(),
                    value: Arc::clone(&entry.value),
                    leases: Arc::clone(&entry.leases),
                })
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert or replace the entry for `key`.
    pub fn insert(&self, key: &str, value: IndexRef) {
        let charge = self.charge_of(&value);
        self.insert_with_charge(key, value, charge);
    }

    /// Insert with an explicit charge instead of the one derived from the
    /// handle.
    pub fn insert_with_charge(&self, key: &str, value: IndexRef, charge: usize) {
        let mut shard = self.shard(key).lock();
        self.insert_locked(&mut shard, key, value, charge);
    }

    /// Insert and lease the new entry in one step, so no eviction can run in
    /// between.
    pub fn insert_and_lease(&self, key: &str, value: IndexRef) -> CacheHandle {
        let charge = self.charge_of(&value);
        let mut shard = self.shard(key).lock();
        let leases = self.insert_locked(&mut shard, key, Arc::clone(&value), charge);
        leases.fetch_add(1, Ordering::AcqRel);
        CacheHandle {
            key: key.to_string(),
            value,
            leases,
        }
    }

    fn insert_locked(&self, shard: &mut Shard, key: &str, value: IndexRef, charge: usize) -> Arc<AtomicUsize> {
        if shard.remove(key).is_some() {
            tracing::debug!(key, "replacing cached index");
        }
        let evicted = shard.make_room(charge);
        if evicted > 0 {
            self.evictions.fetch_add(evicted, Ordering::Relaxed);
        }
        if shard.usage + charge > shard.capacity {
            tracing::warn!(
                key,
                charge,
                usage = shard.usage,
                capacity = shard.capacity,
                "cache shard over budget, every other entry is leased"
            );
        }
        let leases = Arc::new(AtomicUsize::new(0));
        shard.entries.push(
            key.to_string(),
            CacheEntry {
                value,
                leases: Arc::clone(&leases),
                charge,
            },
        );
        shard.usage += charge;
        leases
    }

    /// Remove the entry for `key` regardless of leases. Outstanding leases
    /// keep their index alive.
    pub fn erase(&self, key: &str) -> bool {
        self.shard(key).lock().remove(key).is_some()
    }

    /// Evict every entry that is not currently leased.
    pub fn prune(&self) {
        for shard in self.shards.iter() {
            let evicted = shard.lock().prune();
            if evicted > 0 {
                self.evictions.fetch_add(evicted, Ordering::Relaxed);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        self.shard(key).lock().entries.contains(key)
    }

    pub fn stats(&self) -> CacheStats {
        let shard_usage: Vec<usize> = self.shards.iter().map(|s| s.lock().usage).collect();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.len(),
            shard_usage,
        }
    }
}

impl Default for IndexCache {
    fn default() -> Self {
        Self::new(IndexCacheConfig::default())
    }
}
