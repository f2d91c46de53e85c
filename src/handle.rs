//! Per-entry handle records.
//!
//! One [`LruHandle`] exists for every entry the cache knows about, whether it
//! is table-resident, parked on the LRU list, or detached but still pinned by
//! a caller. The record carries everything the shard needs to operate without
//! re-reading the key from the caller:
//!
//! - the key bytes, copied once at insert and never resized,
//! - the caller-supplied 32-bit hash, reused for rehashing and shard routing,
//! - the value and its deleter, consumed together exactly once,
//! - the charge, reference count, and packed state bits,
//! - the intrusive links for the bucket chain (`next_hash`) and the LRU list
//!   (`prev`/`next`), expressed as [`HandleId`]s into the shard's arena.
//!
//! ## State bits
//!
//! ```text
//!   IN_CACHE          set while the handle is reachable from the table
//!   IS_HIGH_PRI       caller-declared priority at insert
//!   IN_HIGH_PRI_POOL  set while parked in the high-priority LRU suffix
//!   HAS_HIT           sticky; set on first lookup hit, biases re-admission
//! ```
//!
//! Reference counts are plain integers: every mutation happens under the
//! owning shard's mutex, so no atomics are involved.

use crate::arena::HandleId;

/// Cleanup callback for an entry, invoked with the key bytes and the owned
/// value exactly once, outside the shard mutex.
///
/// The callback carries whatever allocator or pool the value came from; the
/// cache itself never inspects the value.
pub type Deleter<T> = Box<dyn FnOnce(&[u8], T) + Send>;

/// Admission priority declared by the caller at insert.
///
/// `High` entries (and any entry that has seen a lookup hit) are parked in
/// the high-priority suffix of the LRU list when a high-priority pool is
/// configured, where one-off low-priority traffic cannot push them out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Evictable ahead of the high-priority pool; the default for data
    /// blocks.
    Low,
    /// Protected by the high-priority pool; used for index and filter
    /// blocks.
    High,
}

const IN_CACHE: u8 = 1 << 0;
const IS_HIGH_PRI: u8 = 1 << 1;
const IN_HIGH_PRI_POOL: u8 = 1 << 2;
const HAS_HIT: u8 = 1 << 3;

/// One cached entry: key, value, accounting, and intrusive links.
///
/// Lives in the shard's [`HandleArena`](crate::arena::HandleArena) from
/// insert until the last reference drops with `IN_CACHE` clear, at which
/// point the record is removed from the arena and [`LruHandle::free`] runs
/// the deleter outside the mutex.
pub(crate) struct LruHandle<T> {
    key: Box<[u8]>,
    pub(crate) hash: u32,
    value: T,
    deleter: Option<Deleter<T>>,
    pub(crate) charge: usize,
    /// Reference count; the cache itself holds one while `IN_CACHE` is set.
    pub(crate) refs: u32,
    flags: u8,
    /// Successor in the bucket chain.
    pub(crate) next_hash: Option<HandleId>,
    /// LRU list links; `Some` only while parked on the list.
    pub(crate) prev: Option<HandleId>,
    pub(crate) next: Option<HandleId>,
}

impl<T> LruHandle<T> {
    /// Builds a fresh record. `refs` is 1 for a fire-and-forget insert and 2
    /// when the caller wants a pinned handle back (one reference for the
    /// cache, one for the caller).
    pub(crate) fn new(
        key: &[u8],
        hash: u32,
        value: T,
        charge: usize,
        deleter: Deleter<T>,
        priority: Priority,
        refs: u32,
    ) -> Self {
        let mut flags = IN_CACHE;
        if priority == Priority::High {
            flags |= IS_HIGH_PRI;
        }
        Self {
            key: key.into(),
            hash,
            value,
            deleter: Some(deleter),
            charge,
            refs,
            flags,
            next_hash: None,
            prev: None,
            next: None,
        }
    }

    /// Borrows the key bytes.
    pub(crate) fn key(&self) -> &[u8] {
        &self.key
    }

    /// Borrows the value.
    pub(crate) fn value(&self) -> &T {
        &self.value
    }

    pub(crate) fn in_cache(&self) -> bool {
        self.flags & IN_CACHE != 0
    }

    pub(crate) fn set_in_cache(&mut self, in_cache: bool) {
        if in_cache {
            self.flags |= IN_CACHE;
        } else {
            self.flags &= !IN_CACHE;
        }
    }

    pub(crate) fn is_high_pri(&self) -> bool {
        self.flags & IS_HIGH_PRI != 0
    }

    pub(crate) fn in_high_pri_pool(&self) -> bool {
        self.flags & IN_HIGH_PRI_POOL != 0
    }

    pub(crate) fn set_in_high_pri_pool(&mut self, in_pool: bool) {
        if in_pool {
            self.flags |= IN_HIGH_PRI_POOL;
        } else {
            self.flags &= !IN_HIGH_PRI_POOL;
        }
    }

    pub(crate) fn has_hit(&self) -> bool {
        self.flags & HAS_HIT != 0
    }

    /// Marks the entry as having served a lookup hit. Sticky: the bit
    /// survives the entry leaving and re-entering the LRU list, so a
    /// once-hit entry re-enters through the high-priority pool.
    pub(crate) fn set_hit(&mut self) {
        self.flags |= HAS_HIT;
    }

    /// Runs the deleter with the key and the owned value.
    ///
    /// Must only be called once the record has left the arena with
    /// `refs == 0` and `IN_CACHE` clear, and never under a shard mutex.
    pub(crate) fn free(self) {
        let LruHandle {
            key,
            value,
            deleter,
            ..
        } = self;
        if let Some(deleter) = deleter {
            deleter(&key, value);
        }
    }
}

impl<T> std::fmt::Debug for LruHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LruHandle")
            .field("key_len", &self.key.len())
            .field("hash", &self.hash)
            .field("charge", &self.charge)
            .field("refs", &self.refs)
            .field("in_cache", &self.in_cache())
            .field("is_high_pri", &self.is_high_pri())
            .field("in_high_pri_pool", &self.in_high_pri_pool())
            .field("has_hit", &self.has_hit())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_deleter() -> Deleter<u64> {
        Box::new(|_, _| {})
    }

    #[test]
    fn new_handle_starts_in_cache() {
        let h = LruHandle::new(b"k", 7, 42u64, 10, noop_deleter(), Priority::Low, 1);
        assert!(h.in_cache());
        assert!(!h.is_high_pri());
        assert!(!h.in_high_pri_pool());
        assert!(!h.has_hit());
        assert_eq!(h.refs, 1);
        assert_eq!(h.key(), b"k");
        assert_eq!(*h.value(), 42);
    }

    #[test]
    fn priority_sets_high_pri_bit() {
        let h = LruHandle::new(b"k", 7, 0u64, 10, noop_deleter(), Priority::High, 2);
        assert!(h.is_high_pri());
        assert_eq!(h.refs, 2);
    }

    #[test]
    fn flag_bits_are_independent() {
        let mut h = LruHandle::new(b"k", 7, 0u64, 10, noop_deleter(), Priority::High, 1);
        h.set_in_high_pri_pool(true);
        h.set_hit();
        h.set_in_cache(false);
        assert!(!h.in_cache());
        assert!(h.is_high_pri());
        assert!(h.in_high_pri_pool());
        assert!(h.has_hit());

        h.set_in_high_pri_pool(false);
        assert!(!h.in_high_pri_pool());
        assert!(h.has_hit());
    }

    #[test]
    fn free_hands_key_and_value_to_deleter() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let deleter: Deleter<u64> = Box::new(move |key, value| {
            assert_eq!(key, b"the-key");
            assert_eq!(value, 99);
            seen.fetch_add(1, Ordering::SeqCst);
        });
        let h = LruHandle::new(b"the-key", 1, 99u64, 5, deleter, Priority::Low, 1);
        h.free();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
