//! One cache shard: handle table + two-pool LRU list + accounting.
//!
//! The shard is not thread-safe on its own;
//! [`ShardedLruCache`](crate::ShardedLruCache) wraps each shard in a
//! `parking_lot::Mutex` and serializes every call here. Two things
//! deliberately happen *outside* that mutex, at the caller's side: fresh
//! records are built before the lock is taken, and records that reached
//! their last reference are freed (deleter run) after it is released. Every mutating operation therefore takes a
//! `victims` list and appends the records it retired.
//!
//! ## LRU list
//!
//! The list is intrusive through the handle records and split into two
//! pools by a movable pivot:
//!
//! ```text
//!   head                     lru_low_pri                      tail
//!    │                            │                             │
//!    ▼   low-priority pool        ▼     high-priority pool      ▼
//!   [l1] ◄──► [l2] ◄──► ... ◄──► [lk] ◄──► [h1] ◄──► ... ◄──► [hn]
//!    ▲                                                         ▲
//!   next eviction victim                          most recently used
//! ```
//!
//! `lru_low_pri` names the last low-priority node (`None` when the
//! low-priority prefix is empty). Demoting the oldest high-priority entry is
//! a pivot advance plus a flag clear; no node moves. New low-priority
//! entries splice in immediately after the pivot; high-priority entries (and
//! anything that has ever served a hit) go to the tail when a high-priority
//! pool is configured.
//!
//! ## Handle lifecycle
//!
//! An entry is on the LRU list exactly when `in_cache && refs == 1`: the
//! cache's own reference is the only one left. Lookup and re-reference pull
//! it off the list (pinning it); the release that brings `refs` back to 1
//! parks it again, or retires it at once when the shard is over capacity or
//! the caller asked for an erase. A record is freed only when `refs == 0`
//! with `in_cache` clear, at which point it is unreachable from both the
//! table and the list.

use crate::arena::{HandleArena, HandleId};
use crate::error::CacheFullError;
use crate::handle::LruHandle;
use crate::monitor::CacheMonitor;
use crate::table::HandleTable;

/// Records retired under the mutex, to be freed by the caller after it.
pub(crate) type VictimList<T> = Vec<LruHandle<T>>;

pub(crate) struct LruShard<T, M> {
    capacity: usize,
    strict_capacity_limit: bool,
    /// Fraction of capacity reserved for the high-priority pool.
    high_pri_pool_ratio: f64,
    /// `capacity * high_pri_pool_ratio`, recomputed on either change.
    high_pri_pool_capacity: usize,

    /// Charge of every record the shard still accounts for: table-resident
    /// entries plus detached-but-pinned ones awaiting their final release.
    usage: usize,
    /// Charge of the records currently parked on the LRU list.
    lru_usage: usize,
    /// Charge of the LRU records inside the high-priority pool.
    high_pri_pool_usage: usize,

    arena: HandleArena<T>,
    table: HandleTable,
    /// Eviction end of the list.
    lru_head: Option<HandleId>,
    /// MRU end of the list.
    lru_tail: Option<HandleId>,
    /// Last low-priority node; `None` when the low-priority prefix is empty.
    lru_low_pri: Option<HandleId>,

    monitor: M,
}

impl<T, M: CacheMonitor> LruShard<T, M> {
    pub(crate) fn new(
        capacity: usize,
        strict_capacity_limit: bool,
        high_pri_pool_ratio: f64,
        topk: usize,
    ) -> Self {
        let mut shard = Self {
            capacity: 0,
            strict_capacity_limit,
            high_pri_pool_ratio,
            high_pri_pool_capacity: 0,
            usage: 0,
            lru_usage: 0,
            high_pri_pool_usage: 0,
            arena: HandleArena::new(),
            table: HandleTable::new(),
            lru_head: None,
            lru_tail: None,
            lru_low_pri: None,
            monitor: M::new(topk),
        };
        let mut victims = VictimList::new();
        shard.set_capacity(capacity, &mut victims);
        debug_assert!(victims.is_empty());
        shard
    }

    fn unref(h: &mut LruHandle<T>) -> bool {
        debug_assert!(h.refs > 0);
        h.refs -= 1;
        h.refs == 0
    }

    // -- LRU list ----------------------------------------------------------

    /// Unlinks a parked record. The pivot retreats to the predecessor when
    /// the pivot node itself is removed.
    fn lru_remove(&mut self, id: HandleId) {
        let (prev, next, charge, in_hp) = match self.arena.get(id) {
            Some(h) => (h.prev, h.next, h.charge, h.in_high_pri_pool()),
            None => return,
        };
        if self.lru_low_pri == Some(id) {
            self.lru_low_pri = prev;
        }
        match prev {
            Some(p) => {
                if let Some(ph) = self.arena.get_mut(p) {
                    ph.next = next;
                }
            }
            None => self.lru_head = next,
        }
        match next {
            Some(n) => {
                if let Some(nh) = self.arena.get_mut(n) {
                    nh.prev = prev;
                }
            }
            None => self.lru_tail = prev,
        }
        if let Some(h) = self.arena.get_mut(id) {
            h.prev = None;
            h.next = None;
        }
        debug_assert!(self.lru_usage >= charge);
        self.lru_usage -= charge;
        if in_hp {
            debug_assert!(self.high_pri_pool_usage >= charge);
            self.high_pri_pool_usage -= charge;
        }
    }

    /// Parks a record whose only remaining reference is the cache's.
    ///
    /// High-priority entries (and anything that has served a hit) go to
    /// the MRU tail inside the high-priority pool when one is configured;
    /// everything else splices in right after the pivot, which then advances
    /// onto the new node.
    fn lru_insert(&mut self, id: HandleId) {
        let (charge, protected) = match self.arena.get(id) {
            Some(h) => {
                debug_assert!(h.prev.is_none() && h.next.is_none());
                (h.charge, h.is_high_pri() || h.has_hit())
            }
            None => return,
        };
        if self.high_pri_pool_ratio > 0.0 && protected {
            let tail = self.lru_tail;
            if let Some(h) = self.arena.get_mut(id) {
                h.prev = tail;
                h.next = None;
                h.set_in_high_pri_pool(true);
            }
            match tail {
                Some(t) => {
                    if let Some(th) = self.arena.get_mut(t) {
                        th.next = Some(id);
                    }
                }
                None => self.lru_head = Some(id),
            }
            self.lru_tail = Some(id);
            self.high_pri_pool_usage += charge;
            self.maintain_pool_size();
        } else {
            let pivot = self.lru_low_pri;
            let next = match pivot {
                Some(p) => self.arena.get(p).and_then(|h| h.next),
                None => self.lru_head,
            };
            if let Some(h) = self.arena.get_mut(id) {
                h.prev = pivot;
                h.next = next;
                h.set_in_high_pri_pool(false);
            }
            match pivot {
                Some(p) => {
                    if let Some(ph) = self.arena.get_mut(p) {
                        ph.next = Some(id);
                    }
                }
                None => self.lru_head = Some(id),
            }
            match next {
                Some(n) => {
                    if let Some(nh) = self.arena.get_mut(n) {
                        nh.prev = Some(id);
                    }
                }
                None => self.lru_tail = Some(id),
            }
            self.lru_low_pri = Some(id);
        }
        self.lru_usage += charge;
    }

    /// Demotes the oldest high-priority entries until the pool fits its
    /// capacity again. Only the pivot moves; no node is relinked.
    fn maintain_pool_size(&mut self) {
        while self.high_pri_pool_usage > self.high_pri_pool_capacity {
            let next = match self.lru_low_pri {
                Some(p) => self.arena.get(p).and_then(|h| h.next),
                None => self.lru_head,
            };
            let id = match next {
                Some(id) => id,
                None => {
                    debug_assert!(false, "high-pri pool usage with no node past the pivot");
                    break;
                }
            };
            self.lru_low_pri = Some(id);
            if let Some(h) = self.arena.get_mut(id) {
                h.set_in_high_pri_pool(false);
                let charge = h.charge;
                debug_assert!(self.high_pri_pool_usage >= charge);
                self.high_pri_pool_usage -= charge;
            }
        }
    }

    /// Retires LRU entries until `usage + extra_charge` fits the capacity or
    /// the list runs dry. Victims land on `victims` for freeing outside the
    /// mutex.
    fn evict_from_lru(&mut self, extra_charge: usize, victims: &mut VictimList<T>) {
        while self.usage + extra_charge > self.capacity {
            let old = match self.lru_head {
                Some(id) => id,
                None => break,
            };
            self.lru_remove(old);
            self.table.remove_id(old, &mut self.arena);
            if let Some(h) = self.arena.get_mut(old) {
                debug_assert!(h.in_cache());
                debug_assert_eq!(h.refs, 1);
                h.set_in_cache(false);
                let last = Self::unref(h);
                debug_assert!(last);
                let charge = h.charge;
                self.monitor.on_entry_removed(h.key(), charge);
                self.usage -= charge;
            }
            if let Some(rec) = self.arena.remove(old) {
                victims.push(rec);
            }
        }
    }

    // -- Public contract ---------------------------------------------------

    /// Looks up `(key, hash)`. A hit pins the entry: it leaves the LRU list
    /// if it was parked, gains a reference, and keeps a sticky hit bit that
    /// biases its next re-admission toward the high-priority pool.
    pub(crate) fn lookup(&mut self, key: &[u8], hash: u32) -> Option<HandleId> {
        let id = self.table.lookup(key, hash, &self.arena)?;
        let parked = match self.arena.get(id) {
            Some(h) => {
                debug_assert!(h.in_cache());
                h.refs == 1
            }
            None => return None,
        };
        if parked {
            self.lru_remove(id);
        }
        if let Some(h) = self.arena.get_mut(id) {
            h.refs += 1;
            h.set_hit();
        }
        Some(id)
    }

    /// Takes an additional reference on a live handle.
    pub(crate) fn ref_handle(&mut self, id: HandleId) -> bool {
        let parked = match self.arena.get(id) {
            Some(h) => h.in_cache() && h.refs == 1,
            None => return false,
        };
        if parked {
            self.lru_remove(id);
        }
        if let Some(h) = self.arena.get_mut(id) {
            h.refs += 1;
            true
        } else {
            false
        }
    }

    /// Drops one reference. Returns `true` when this was the last reference
    /// and the record moved to `victims`.
    ///
    /// When the drop leaves only the cache's reference, the entry either
    /// parks on the LRU list or, if the shard is over capacity or
    /// `force_erase` is set, is retired on the spot.
    pub(crate) fn release(
        &mut self,
        id: HandleId,
        force_erase: bool,
        victims: &mut VictimList<T>,
    ) -> bool {
        let (mut last_reference, refs_after, in_cache, charge) = match self.arena.get_mut(id) {
            Some(h) => {
                let last = Self::unref(h);
                (last, h.refs, h.in_cache(), h.charge)
            }
            None => return false,
        };
        if last_reference {
            debug_assert!(self.usage >= charge);
            self.usage -= charge;
        }
        if !last_reference && refs_after == 1 && in_cache {
            // The cache holds the only remaining reference.
            if self.usage > self.capacity || force_erase {
                self.table.remove_id(id, &mut self.arena);
                if let Some(h) = self.arena.get_mut(id) {
                    h.set_in_cache(false);
                    let last = Self::unref(h);
                    debug_assert!(last);
                    self.monitor.on_entry_removed(h.key(), charge);
                }
                debug_assert!(self.usage >= charge);
                self.usage -= charge;
                last_reference = true;
            } else {
                self.lru_insert(id);
            }
        }
        if last_reference {
            if let Some(rec) = self.arena.remove(id) {
                victims.push(rec);
            }
        }
        last_reference
    }

    /// Inserts a record built outside the mutex. Returns the pinned id when
    /// `want_pinned` (the record must carry `refs == 2`), `None` otherwise
    /// (`refs == 1`).
    ///
    /// Eviction runs first. If even then the pinned residue plus the new
    /// charge exceeds capacity: a fire-and-forget insert is treated as
    /// inserted-then-immediately-evicted, and a pinned insert under a strict
    /// limit is rejected with [`CacheFullError`]; in both cases the record
    /// goes to `victims` so its deleter runs. Otherwise the insert proceeds,
    /// displacing any prior entry with the same key, and a loose-mode shard
    /// may transiently exceed its capacity.
    pub(crate) fn insert(
        &mut self,
        handle: LruHandle<T>,
        want_pinned: bool,
        victims: &mut VictimList<T>,
    ) -> Result<Option<HandleId>, CacheFullError> {
        debug_assert_eq!(handle.refs, if want_pinned { 2 } else { 1 });
        let charge = handle.charge;

        self.evict_from_lru(charge, victims);

        if self.usage - self.lru_usage + charge > self.capacity
            && (self.strict_capacity_limit || !want_pinned)
        {
            victims.push(handle);
            return if want_pinned {
                Err(CacheFullError)
            } else {
                // As if the entry was inserted and evicted right away.
                Ok(None)
            };
        }

        let id = self.arena.insert(handle);
        let old = self.table.insert(id, &mut self.arena);
        self.usage += charge;

        if let Some(old_id) = old {
            let (last, old_charge) = match self.arena.get_mut(old_id) {
                Some(oh) => {
                    oh.set_in_cache(false);
                    let last = Self::unref(oh);
                    let old_charge = oh.charge;
                    self.monitor.on_entry_removed(oh.key(), old_charge);
                    (last, old_charge)
                }
                None => (false, 0),
            };
            if last {
                // The displaced entry was necessarily parked: in cache with
                // its reference count just dropped from 1.
                debug_assert!(self.usage >= old_charge);
                self.usage -= old_charge;
                self.lru_remove(old_id);
                if let Some(rec) = self.arena.remove(old_id) {
                    victims.push(rec);
                }
            }
        }

        // The monitor learns about the new entry only after any displaced
        // duplicate with the same key has been removed from it.
        if let Some(h) = self.arena.get(id) {
            self.monitor.on_entry_added(h.key(), charge);
        }

        if want_pinned {
            Ok(Some(id))
        } else {
            self.lru_insert(id);
            Ok(None)
        }
    }

    /// Removes `(key, hash)` from the table if present. Pinned entries stay
    /// alive until their holders release them; unpinned ones retire now.
    pub(crate) fn erase(&mut self, key: &[u8], hash: u32, victims: &mut VictimList<T>) {
        let id = match self.table.remove(key, hash, &mut self.arena) {
            Some(id) => id,
            None => return,
        };
        let (last, in_cache, charge) = match self.arena.get_mut(id) {
            Some(h) => {
                let last = Self::unref(h);
                let in_cache = h.in_cache();
                h.set_in_cache(false);
                (last, in_cache, h.charge)
            }
            None => return,
        };
        self.monitor.on_entry_removed(key, charge);
        if last && in_cache {
            self.lru_remove(id);
        }
        if last {
            debug_assert!(self.usage >= charge);
            self.usage -= charge;
            if let Some(rec) = self.arena.remove(id) {
                victims.push(rec);
            }
        }
    }

    /// Drains the whole LRU list; every parked entry retires. Pinned entries
    /// are untouched.
    pub(crate) fn erase_unref_entries(&mut self, victims: &mut VictimList<T>) {
        while let Some(old) = self.lru_head {
            self.lru_remove(old);
            self.table.remove_id(old, &mut self.arena);
            if let Some(h) = self.arena.get_mut(old) {
                debug_assert!(h.in_cache());
                debug_assert_eq!(h.refs, 1);
                h.set_in_cache(false);
                let last = Self::unref(h);
                debug_assert!(last);
                let charge = h.charge;
                self.monitor.on_entry_removed(h.key(), charge);
                self.usage -= charge;
            }
            if let Some(rec) = self.arena.remove(old) {
                victims.push(rec);
            }
        }
    }

    pub(crate) fn set_capacity(&mut self, capacity: usize, victims: &mut VictimList<T>) {
        self.capacity = capacity;
        self.high_pri_pool_capacity = (capacity as f64 * self.high_pri_pool_ratio) as usize;
        self.evict_from_lru(0, victims);
    }

    pub(crate) fn set_strict_capacity_limit(&mut self, strict: bool) {
        self.strict_capacity_limit = strict;
    }

    /// Updates the pool ratio and demotes through the pivot until the pool
    /// fits the new capacity. Factories validate the range; the runtime
    /// setter, like the rest of the shard, trusts its caller.
    pub(crate) fn set_high_pri_pool_ratio(&mut self, ratio: f64) {
        self.high_pri_pool_ratio = ratio;
        self.high_pri_pool_capacity = (self.capacity as f64 * ratio) as usize;
        self.maintain_pool_size();
    }

    pub(crate) fn high_pri_pool_ratio(&self) -> f64 {
        self.high_pri_pool_ratio
    }

    pub(crate) fn usage(&self) -> usize {
        self.usage
    }

    pub(crate) fn pinned_usage(&self) -> usize {
        debug_assert!(self.usage >= self.lru_usage);
        self.usage - self.lru_usage
    }

    /// Runs `f` on the value of a live handle.
    pub(crate) fn with_value<R>(&self, id: HandleId, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.arena.get(id).map(|h| f(h.value()))
    }

    pub(crate) fn charge_of(&self, id: HandleId) -> Option<usize> {
        self.arena.get(id).map(|h| h.charge)
    }

    /// Visits every table-resident entry once with `(value, charge)`.
    pub(crate) fn apply_to_all(&self, mut f: impl FnMut(&T, usize)) {
        self.table
            .apply_to_all(&self.arena, |h| f(h.value(), h.charge));
    }

    pub(crate) fn printable_options(&self) -> String {
        format!("    high_pri_pool_ratio: {:.3}\n", self.high_pri_pool_ratio)
    }

    pub(crate) fn monitor_report(&self) -> String {
        self.monitor.report()
    }

    // -- Test / debug introspection ----------------------------------------

    pub(crate) fn lru_len(&self) -> usize {
        let mut len = 0;
        let mut cur = self.lru_head;
        while let Some(id) = cur {
            len += 1;
            cur = self.arena.get(id).and_then(|h| h.next);
        }
        len
    }

    pub(crate) fn debug_validate_invariants(&self) {
        self.arena.debug_validate_invariants();
        self.table.debug_validate_invariants(&self.arena);

        // usage covers exactly the records the shard still owns: table
        // residents plus detached-but-pinned ones.
        let arena_charge: usize = self.arena.iter().map(|(_, h)| h.charge).sum();
        assert_eq!(self.usage, arena_charge);
        assert_eq!(self.arena.iter().count(), self.arena.len());
        assert_eq!(self.arena.is_empty(), self.arena.len() == 0);
        let in_cache_count = self.arena.iter().filter(|(_, h)| h.in_cache()).count();
        assert_eq!(self.table.len(), in_cache_count);

        // Walk the list: low-priority prefix first, ending at the pivot,
        // then the high-priority suffix.
        let mut on_list = std::collections::HashSet::new();
        let mut list_charge = 0usize;
        let mut hp_charge = 0usize;
        let mut last_low_pri = None;
        let mut seen_high = false;
        let mut prev = None;
        let mut cur = self.lru_head;
        while let Some(id) = cur {
            let h = self.arena.get(id).expect("list node must be live");
            assert!(on_list.insert(id), "node linked twice");
            assert_eq!(h.prev, prev);
            assert!(h.in_cache(), "parked node must be in cache");
            assert_eq!(h.refs, 1, "parked node must hold only the cache ref");
            list_charge += h.charge;
            if h.in_high_pri_pool() {
                seen_high = true;
                hp_charge += h.charge;
            } else {
                assert!(!seen_high, "low-pri node after the high-pri suffix");
                last_low_pri = Some(id);
            }
            prev = cur;
            cur = h.next;
        }
        assert_eq!(self.lru_tail, prev);
        assert_eq!(self.lru_low_pri, last_low_pri);
        assert_eq!(self.lru_usage, list_charge);
        assert_eq!(self.high_pri_pool_usage, hp_charge);
        assert!(self.lru_usage <= self.usage);
        assert!(self.high_pri_pool_usage <= self.lru_usage);

        // Parked exactly when the cache holds the only reference.
        for (id, h) in self.arena.iter() {
            let parked = on_list.contains(&id);
            assert_eq!(parked, h.in_cache() && h.refs == 1);
            if !parked {
                assert!(h.prev.is_none() && h.next.is_none());
            }
            if h.in_cache() {
                assert_eq!(
                    self.table.lookup(h.key(), h.hash, &self.arena),
                    Some(id),
                    "in-cache handle must be reachable from the table"
                );
            }
        }
    }
}

impl<T, M> Drop for LruShard<T, M> {
    fn drop(&mut self) {
        // Run every outstanding deleter at teardown, parked and pinned
        // alike. Dropping the records without their deleters would strand
        // resources the callbacks own.
        for rec in self.arena.drain() {
            rec.free();
        }
    }
}
