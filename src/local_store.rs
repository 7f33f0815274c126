//! Local Store.
//!
//! A capacity-bounded, sharded mapping from key to [`LocalEntry`]. Each
//! shard is an independent LRU so a single operation touches at most one
//! lock, matching the fast-path contract: the local tier is a side cache,
//! never the only copy of the truth, so approximate (segmented) LRU is
//! sufficient.

use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;

use chrono::Utc;
use lru::LruCache;
use parking_lot::Mutex;

use crate::model::LocalEntry;

const SHARD_COUNT: usize = 16;

/// Outcome of a lookup against the local tier.
pub enum Lookup {
    /// A fresh, non-expired entry was found.
    Hit(LocalEntry),
    /// No entry, or an entry that expired and was evicted on the way out.
    Miss,
}

/// The process-local cache tier. `capacity == 0` disables the tier
/// entirely: every operation becomes a no-op, so correctness never
/// depends on this component being enabled.
pub struct LocalStore {
    shards: Option<Vec<Mutex<LruCache<Vec<u8>, LocalEntry>>>>,
}

impl LocalStore {
    /// Build a local store with the given total capacity, spread evenly
    /// across shards. `0` disables the local tier.
    pub fn new(capacity: u64) -> Self {
        if capacity == 0 {
            return Self { shards: None };
        }
        let per_shard = ((capacity as usize).max(SHARD_COUNT) / SHARD_COUNT).max(1);
        let cap = NonZeroUsize::new(per_shard).expect("per_shard is at least 1");
        let shards = (0..SHARD_COUNT)
            .map(|_| Mutex::new(LruCache::new(cap)))
            .collect();
        Self {
            shards: Some(shards),
        }
    }

    /// Whether the local tier is enabled.
    pub fn is_enabled(&self) -> bool {
        self.shards.is_some()
    }

    fn shard_for(&self, key: &[u8]) -> Option<&Mutex<LruCache<Vec<u8>, LocalEntry>>> {
        let shards = self.shards.as_ref()?;
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() as usize) % shards.len();
        Some(&shards[index])
    }

    /// Look up a key, evicting it in place if it has expired.
    pub fn lookup(&self, key: &[u8]) -> Lookup {
        let Some(shard) = self.shard_for(key) else {
            return Lookup::Miss;
        };
        let mut guard = shard.lock();
        match guard.get(key) {
            Some(entry) if entry.is_expired_at(Utc::now()) => {
                guard.pop(key);
                Lookup::Miss
            }
            Some(entry) => Lookup::Hit(entry.clone()),
            None => Lookup::Miss,
        }
    }

    /// Install an entry, rejecting it if a current entry has a version
    /// greater than or equal to it. A local entry's version never
    /// decreases across updates.
    pub fn install(&self, key: Vec<u8>, entry: LocalEntry) {
        let Some(shard) = self.shard_for(&key) else {
            return;
        };
        let mut guard = shard.lock();
        if let Some(existing) = guard.peek(&key) {
            if existing.version >= entry.version {
                return;
            }
        }
        guard.put(key, entry);
    }

    /// Look up a key regardless of expiry, without evicting it. Used only
    /// by the facade's `serve_stale_on_error` fallback, where a value past
    /// its TTL is still preferable to propagating a backend error.
    pub fn peek_stale(&self, key: &[u8]) -> Option<LocalEntry> {
        let shard = self.shard_for(key)?;
        shard.lock().peek(key).cloned()
    }

    /// Remove a key's local entry unconditionally.
    pub fn invalidate(&self, key: &[u8]) {
        let Some(shard) = self.shard_for(key) else {
            return;
        };
        shard.lock().pop(key);
    }

    /// Remove every local entry. Used on listener resync.
    pub fn clear(&self) {
        let Some(shards) = &self.shards else {
            return;
        };
        for shard in shards {
            shard.lock().clear();
        }
    }

    /// Sweep every shard for expired entries. Intended to run on a timer
    /// (`reaper_interval`) so TTLs are enforced even without reads.
    pub fn reap_expired(&self) -> usize {
        let Some(shards) = &self.shards else {
            return 0;
        };
        let now = Utc::now();
        let mut removed = 0;
        for shard in shards {
            let mut guard = shard.lock();
            let expired: Vec<Vec<u8>> = guard
                .iter()
                .filter(|(_, v)| v.is_expired_at(now))
                .map(|(k, _)| k.clone())
                .collect();
            for key in expired {
                guard.pop(&key);
                removed += 1;
            }
        }
        removed
    }

    /// Total number of entries currently resident across all shards.
    pub fn len(&self) -> usize {
        match &self.shards {
            Some(shards) => shards.iter().map(|s| s.lock().len()).sum(),
            None => 0,
        }
    }

    /// Whether the store currently holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
