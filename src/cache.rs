//! Sharded cache wrapper and the pinned-handle surface.
//!
//! [`ShardedLruCache`] owns `2^num_shard_bits` independent shards, each
//! behind its own `parking_lot::Mutex` on its own cache line. Operations
//! route by the *high* bits of the caller-supplied 32-bit hash, so the
//! same hash always lands on the same shard and the low bits remain free
//! for the shard's own bucket indexing. There is no global lock and no
//! cross-shard state; aggregate figures are sums of per-shard snapshots.
//!
//! ```text
//!  Client ──► ShardedLruCache (routes by hash >> (32 - bits))
//!               │
//!               ├── CacheAligned<Mutex<LruShard>>   shard 0
//!               ├── CacheAligned<Mutex<LruShard>>   shard 1
//!               │        ...
//!               └── CacheAligned<Mutex<LruShard>>   shard N-1
//! ```
//!
//! ## Handles
//!
//! Pinned entries surface as [`CacheHandle`] tokens. A token is minted by
//! `lookup`, `insert_pinned` and `ref_handle`, and consumed by `release`;
//! each token is one reference. Tokens are not clonable; duplicating one
//! without taking a reference would let the entry be freed while still
//! reachable.
//!
//! Handle construction and deleter execution deliberately happen outside
//! the shard mutex: an expensive user deleter never blocks concurrent
//! lookups on the same shard.

use crate::arena::HandleId;
use crate::error::CacheFullError;
use crate::handle::{Deleter, LruHandle, Priority};
use crate::monitor::{CacheMonitor, NoopMonitor};
use crate::shard::{LruShard, VictimList};
use parking_lot::Mutex;
use std::fmt::Write as _;

/// Keeps each shard's mutex and hot fields on their own cache line.
#[repr(align(64))]
struct CacheAligned<T>(T);

/// A reference to a pinned cache entry.
///
/// Holding a `CacheHandle` keeps the entry alive and off the LRU list; it
/// cannot be evicted until every token for it has been passed back through
/// [`ShardedLruCache::release`]. Dropping a token without releasing it pins
/// the entry for the lifetime of the cache.
#[must_use = "a CacheHandle pins its entry until passed to release()"]
#[derive(Debug)]
pub struct CacheHandle {
    shard: usize,
    id: HandleId,
    hash: u32,
    charge: usize,
}

impl CacheHandle {
    /// The entry's 32-bit hash as supplied at insert.
    pub fn hash(&self) -> u32 {
        self.hash
    }

    /// The byte cost attributed to the entry.
    pub fn charge(&self) -> usize {
        self.charge
    }
}

/// Sharded, reference-counted LRU cache with a two-tier admission policy.
///
/// `T` is the cached value type; `M` selects the per-shard monitor at
/// compile time and defaults to the zero-cost [`NoopMonitor`]. Construct
/// through [`LruCacheBuilder`](crate::builder::LruCacheBuilder) or the
/// [`new_lru_cache`](crate::builder::new_lru_cache) /
/// [`new_diagnosable_lru_cache`](crate::builder::new_diagnosable_lru_cache)
/// factories, which validate the configuration.
pub struct ShardedLruCache<T, M: CacheMonitor = NoopMonitor> {
    shards: Box<[CacheAligned<Mutex<LruShard<T, M>>>]>,
    num_shard_bits: u32,
}

impl<T, M: CacheMonitor> std::fmt::Debug for ShardedLruCache<T, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedLruCache")
            .field("num_shard_bits", &self.num_shard_bits)
            .finish()
    }
}

impl<T, M: CacheMonitor> ShardedLruCache<T, M> {
    /// Builds the shard array. Callers must have validated the parameters;
    /// the builder is the only way in from outside the crate.
    pub(crate) fn new(
        capacity: usize,
        num_shard_bits: u32,
        strict_capacity_limit: bool,
        high_pri_pool_ratio: f64,
        topk: usize,
    ) -> Self {
        let num_shards = 1usize << num_shard_bits;
        let per_shard = capacity.div_ceil(num_shards);
        let shards = (0..num_shards)
            .map(|_| {
                CacheAligned(Mutex::new(LruShard::new(
                    per_shard,
                    strict_capacity_limit,
                    high_pri_pool_ratio,
                    topk,
                )))
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            shards,
            num_shard_bits,
        }
    }

    /// The cache implementation name: `"LRUCache"`, or
    /// `"DiagnosableLRUCache"` for the diagnostic monitor.
    pub fn name(&self) -> &'static str {
        M::CACHE_NAME
    }

    /// Number of independent shards.
    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    fn shard_index(&self, hash: u32) -> usize {
        if self.num_shard_bits == 0 {
            0
        } else {
            (hash >> (32 - self.num_shard_bits)) as usize
        }
    }

    fn shard(&self, hash: u32) -> &Mutex<LruShard<T, M>> {
        &self.shards[self.shard_index(hash)].0
    }

    /// Inserts an entry without keeping a reference to it.
    ///
    /// Never fails: when even eviction cannot make room, the entry behaves
    /// as if it was inserted and immediately evicted; its deleter runs and
    /// the call returns normally. The `charge` counts against the owning
    /// shard's capacity; the key bytes are copied.
    pub fn insert(
        &self,
        key: &[u8],
        hash: u32,
        value: T,
        charge: usize,
        deleter: Deleter<T>,
        priority: Priority,
    ) {
        // Record construction (key copy included) happens before the lock.
        let record = LruHandle::new(key, hash, value, charge, deleter, priority, 1);
        let mut victims = VictimList::new();
        {
            let mut shard = self.shard(hash).lock();
            let result = shard.insert(record, false, &mut victims);
            debug_assert!(result.is_ok());
        }
        for rec in victims {
            rec.free();
        }
    }

    /// Inserts an entry and returns a pinned handle to it.
    ///
    /// With a strict capacity limit, fails with [`CacheFullError`] when
    /// eviction cannot make room (the value is disposed through its
    /// deleter). Without the strict limit the insert always succeeds and
    /// the shard may transiently exceed its capacity.
    pub fn insert_pinned(
        &self,
        key: &[u8],
        hash: u32,
        value: T,
        charge: usize,
        deleter: Deleter<T>,
        priority: Priority,
    ) -> Result<CacheHandle, CacheFullError> {
        let record = LruHandle::new(key, hash, value, charge, deleter, priority, 2);
        let shard_index = self.shard_index(hash);
        let mut victims = VictimList::new();
        let result = {
            let mut shard = self.shards[shard_index].0.lock();
            shard.insert(record, true, &mut victims)
        };
        for rec in victims {
            rec.free();
        }
        match result {
            Ok(Some(id)) => Ok(CacheHandle {
                shard: shard_index,
                id,
                hash,
                charge,
            }),
            Ok(None) => {
                debug_assert!(false, "pinned insert must return an id on success");
                Err(CacheFullError)
            }
            Err(err) => Err(err),
        }
    }

    /// Looks up `(key, hash)` and pins the entry on a hit.
    ///
    /// The returned handle must be passed back through
    /// [`release`](Self::release). A hit also marks the entry, biasing its
    /// next LRU re-admission toward the high-priority pool.
    pub fn lookup(&self, key: &[u8], hash: u32) -> Option<CacheHandle> {
        let shard_index = self.shard_index(hash);
        let mut shard = self.shards[shard_index].0.lock();
        let id = shard.lookup(key, hash)?;
        let charge = shard.charge_of(id)?;
        Some(CacheHandle {
            shard: shard_index,
            id,
            hash,
            charge,
        })
    }

    /// Takes an additional reference on a pinned entry, minting a second
    /// handle that must be released independently.
    pub fn ref_handle(&self, handle: &CacheHandle) -> CacheHandle {
        let referenced = {
            let mut shard = self.shards[handle.shard].0.lock();
            shard.ref_handle(handle.id)
        };
        debug_assert!(referenced, "ref_handle on a dead handle");
        CacheHandle {
            shard: handle.shard,
            id: handle.id,
            hash: handle.hash,
            charge: handle.charge,
        }
    }

    /// Releases one reference. Returns `true` when this was the last
    /// reference and the entry's deleter ran.
    ///
    /// With `force_erase`, an entry whose only other reference is the
    /// cache's is erased instead of being parked on the LRU list. The same
    /// happens without `force_erase` whenever the shard is over capacity.
    pub fn release(&self, handle: CacheHandle, force_erase: bool) -> bool {
        let mut victims = VictimList::new();
        let last = {
            let mut shard = self.shards[handle.shard].0.lock();
            shard.release(handle.id, force_erase, &mut victims)
        };
        for rec in victims {
            rec.free();
        }
        last
    }

    /// Runs `f` on the pinned entry's value under the shard lock.
    ///
    /// Returns `None` only if the handle no longer names a live entry,
    /// which a correctly reference-counted caller never observes.
    pub fn value_with<R>(&self, handle: &CacheHandle, f: impl FnOnce(&T) -> R) -> Option<R> {
        let shard = self.shards[handle.shard].0.lock();
        shard.with_value(handle.id, f)
    }

    /// Removes `(key, hash)` if present. Unpinned entries are freed before
    /// this returns; pinned entries become unreachable and are freed by
    /// their final [`release`](Self::release).
    pub fn erase(&self, key: &[u8], hash: u32) {
        let mut victims = VictimList::new();
        {
            let mut shard = self.shard(hash).lock();
            shard.erase(key, hash, &mut victims);
        }
        for rec in victims {
            rec.free();
        }
    }

    /// Drops every unpinned entry from every shard.
    pub fn erase_unref_entries(&self) {
        for shard in self.shards.iter() {
            let mut victims = VictimList::new();
            {
                let mut shard = shard.0.lock();
                shard.erase_unref_entries(&mut victims);
            }
            for rec in victims {
                rec.free();
            }
        }
    }

    /// Updates the total capacity; each shard gets an equal slice and
    /// evicts down to it immediately.
    pub fn set_capacity(&self, capacity: usize) {
        let per_shard = capacity.div_ceil(self.shards.len());
        for shard in self.shards.iter() {
            let mut victims = VictimList::new();
            {
                let mut shard = shard.0.lock();
                shard.set_capacity(per_shard, &mut victims);
            }
            for rec in victims {
                rec.free();
            }
        }
    }

    /// Toggles strict capacity enforcement for subsequent pinned inserts.
    pub fn set_strict_capacity_limit(&self, strict: bool) {
        for shard in self.shards.iter() {
            shard.0.lock().set_strict_capacity_limit(strict);
        }
    }

    /// Updates the high-priority pool ratio; each shard demotes through its
    /// pivot until the pool fits the new size. The factories validate the
    /// `[0, 1]` range at construction; runtime callers pass a ratio they
    /// have already validated.
    pub fn set_high_pri_pool_ratio(&self, ratio: f64) {
        for shard in self.shards.iter() {
            shard.0.lock().set_high_pri_pool_ratio(ratio);
        }
    }

    /// The configured high-priority pool ratio.
    pub fn high_pri_pool_ratio(&self) -> f64 {
        self.shards
            .first()
            .map(|s| s.0.lock().high_pri_pool_ratio())
            .unwrap_or(0.0)
    }

    /// Total charge held across all shards, pinned entries included.
    ///
    /// A sum of per-shard snapshots: consistent per shard, not a single
    /// atomic point across the cache.
    pub fn usage(&self) -> usize {
        self.shards.iter().map(|s| s.0.lock().usage()).sum()
    }

    /// Charge of pinned entries across all shards.
    pub fn pinned_usage(&self) -> usize {
        self.shards.iter().map(|s| s.0.lock().pinned_usage()).sum()
    }

    /// Visits every cached entry once with `(value, charge)`, holding each
    /// shard's lock for the duration of its visit.
    pub fn apply_to_all_entries(&self, mut f: impl FnMut(&T, usize)) {
        for shard in self.shards.iter() {
            shard.0.lock().apply_to_all(&mut f);
        }
    }

    /// Renders the cache summary and per-shard diagnostic sections.
    pub fn dump_statistics(&self) -> String {
        let mut out = String::new();
        out.push_str("Cache Summary:\n");
        let _ = writeln!(
            out,
            "usage: {}, pinned_usage: {}",
            self.usage(),
            self.pinned_usage()
        );
        for (i, shard) in self.shards.iter().enumerate() {
            let _ = writeln!(out, "shard_{i}:");
            let shard = shard.0.lock();
            out.push_str(&shard.printable_options());
            out.push_str(&shard.monitor_report());
        }
        out
    }

    /// Forgets the shard array without freeing entries or running
    /// deleters, for fast process exit. The cache must not be used
    /// afterwards.
    pub fn disown_data(&mut self) {
        let shards = std::mem::take(&mut self.shards);
        std::mem::forget(shards);
        self.num_shard_bits = 0;
    }

    // -- Test / debug introspection ----------------------------------------

    #[doc(hidden)]
    pub fn debug_validate_invariants(&self) {
        for shard in self.shards.iter() {
            shard.0.lock().debug_validate_invariants();
        }
    }

    #[doc(hidden)]
    pub fn lru_len(&self) -> usize {
        self.shards.iter().map(|s| s.0.lock().lru_len()).sum()
    }
}
