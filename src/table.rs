//! Separate-chained hash table of handle ids.
//!
//! The table maps `(hash, key bytes)` to a [`HandleId`]; the chain links
//! live inside the handle records themselves (`next_hash`), so the table
//! proper is just a power-of-two bucket array plus an element count.
//!
//! ```text
//!   buckets: Vec<Option<HandleId>>        (len = power of two)
//!
//!   bucket = hash & (len - 1)
//!
//!   [0] ─► id_4 ─► id_1
//!   [1] ─► (empty)
//!   [2] ─► id_9
//!   [3] ─► id_2 ─► id_7 ─► id_3
//! ```
//!
//! Cache entries are fairly large, so the table grows whenever the element
//! count exceeds the bucket count, keeping the average chain length at one
//! or below. Growth doubles the bucket array until it reaches 1.5× the
//! element count and relinks every record in place; it never shrinks.
//!
//! Every operation resolves ids through the shard's arena and runs under the
//! shard mutex; the table has no locking of its own.

use crate::arena::{HandleArena, HandleId};
use crate::handle::LruHandle;

const MIN_BUCKETS: usize = 16;

/// Bucket array for one shard.
pub(crate) struct HandleTable {
    buckets: Vec<Option<HandleId>>,
    elems: usize,
}

impl HandleTable {
    /// Creates an empty table with the minimum bucket count.
    pub(crate) fn new() -> Self {
        Self {
            buckets: vec![None; MIN_BUCKETS],
            elems: 0,
        }
    }

    /// Returns the number of entries in the table.
    pub(crate) fn len(&self) -> usize {
        self.elems
    }

    fn bucket(&self, hash: u32) -> usize {
        hash as usize & (self.buckets.len() - 1)
    }

    /// Walks the bucket chain for `(key, hash)` and returns the matching id.
    pub(crate) fn lookup<T>(
        &self,
        key: &[u8],
        hash: u32,
        arena: &HandleArena<T>,
    ) -> Option<HandleId> {
        let mut cur = self.buckets[self.bucket(hash)];
        while let Some(id) = cur {
            let h = arena.get(id)?;
            if h.hash == hash && h.key() == key {
                return Some(id);
            }
            cur = h.next_hash;
        }
        None
    }

    /// Links `id` at the head of its bucket. If an entry with the same
    /// `(hash, key)` already exists it is unlinked first and returned; the
    /// caller owns its displacement (reference drop, eviction accounting).
    ///
    /// Grows the bucket array when the element count exceeds it.
    pub(crate) fn insert<T>(
        &mut self,
        id: HandleId,
        arena: &mut HandleArena<T>,
    ) -> Option<HandleId> {
        let hash = match arena.get(id) {
            Some(h) => h.hash,
            None => return None,
        };
        let old = self.unlink_duplicate_of(id, hash, arena);
        let bucket = self.bucket(hash);
        let head = self.buckets[bucket];
        if let Some(h) = arena.get_mut(id) {
            h.next_hash = head;
        }
        self.buckets[bucket] = Some(id);
        self.elems += 1;
        if self.elems > self.buckets.len() {
            self.grow(arena);
        }
        old
    }

    /// Unlinks and returns the entry matching `(key, hash)`; no-op if
    /// absent.
    pub(crate) fn remove<T>(
        &mut self,
        key: &[u8],
        hash: u32,
        arena: &mut HandleArena<T>,
    ) -> Option<HandleId> {
        self.find_and_unlink(key, hash, arena)
    }

    /// Unlinks a known id from its chain. Used by the eviction and release
    /// paths, which already hold the id and must not re-borrow the key out
    /// of the arena they are mutating.
    pub(crate) fn remove_id<T>(&mut self, id: HandleId, arena: &mut HandleArena<T>) -> bool {
        let hash = match arena.get(id) {
            Some(h) => h.hash,
            None => return false,
        };
        let bucket = self.bucket(hash);
        let mut prev: Option<HandleId> = None;
        let mut cur = self.buckets[bucket];
        while let Some(cid) = cur {
            let next = match arena.get(cid) {
                Some(h) => h.next_hash,
                None => return false,
            };
            if cid == id {
                match prev {
                    None => self.buckets[bucket] = next,
                    Some(p) => {
                        if let Some(h) = arena.get_mut(p) {
                            h.next_hash = next;
                        }
                    }
                }
                if let Some(h) = arena.get_mut(id) {
                    h.next_hash = None;
                }
                self.elems -= 1;
                return true;
            }
            prev = cur;
            cur = next;
        }
        false
    }

    /// Visits every entry in the table exactly once.
    pub(crate) fn apply_to_all<T>(
        &self,
        arena: &HandleArena<T>,
        mut f: impl FnMut(&LruHandle<T>),
    ) {
        for &head in &self.buckets {
            let mut cur = head;
            while let Some(id) = cur {
                match arena.get(id) {
                    Some(h) => {
                        f(h);
                        cur = h.next_hash;
                    }
                    None => break,
                }
            }
        }
    }

    /// Unlinks the entry whose `(hash, key)` equals that of `target`, if
    /// one is chained. Used by [`insert`](Self::insert) to displace a
    /// duplicate before linking the new record.
    fn unlink_duplicate_of<T>(
        &mut self,
        target: HandleId,
        hash: u32,
        arena: &mut HandleArena<T>,
    ) -> Option<HandleId> {
        let bucket = self.bucket(hash);
        let mut prev: Option<HandleId> = None;
        let mut cur = self.buckets[bucket];
        while let Some(id) = cur {
            let (matches, next) = {
                let cand = arena.get(id)?;
                let fresh = arena.get(target)?;
                (
                    cand.hash == hash && cand.key() == fresh.key(),
                    cand.next_hash,
                )
            };
            if matches {
                match prev {
                    None => self.buckets[bucket] = next,
                    Some(p) => {
                        if let Some(h) = arena.get_mut(p) {
                            h.next_hash = next;
                        }
                    }
                }
                if let Some(h) = arena.get_mut(id) {
                    h.next_hash = None;
                }
                self.elems -= 1;
                return Some(id);
            }
            prev = cur;
            cur = next;
        }
        None
    }

    /// Splices the matching entry out of its chain and clears its
    /// `next_hash`.
    fn find_and_unlink<T>(
        &mut self,
        key: &[u8],
        hash: u32,
        arena: &mut HandleArena<T>,
    ) -> Option<HandleId> {
        let bucket = self.bucket(hash);
        let mut prev: Option<HandleId> = None;
        let mut cur = self.buckets[bucket];
        while let Some(id) = cur {
            let (matches, next) = {
                let h = arena.get(id)?;
                (h.hash == hash && h.key() == key, h.next_hash)
            };
            if matches {
                match prev {
                    None => self.buckets[bucket] = next,
                    Some(p) => {
                        if let Some(h) = arena.get_mut(p) {
                            h.next_hash = next;
                        }
                    }
                }
                if let Some(h) = arena.get_mut(id) {
                    h.next_hash = None;
                }
                self.elems -= 1;
                return Some(id);
            }
            prev = cur;
            cur = next;
        }
        None
    }

    /// Doubles the bucket array until it covers 1.5× the element count,
    /// then relinks every record. Chain order may reverse; it carries no
    /// meaning.
    fn grow<T>(&mut self, arena: &mut HandleArena<T>) {
        let mut new_len = MIN_BUCKETS;
        while new_len * 2 < self.elems * 3 {
            new_len *= 2;
        }
        let mut new_buckets: Vec<Option<HandleId>> = vec![None; new_len];
        let mut relinked = 0usize;
        for &head in &self.buckets {
            let mut cur = head;
            while let Some(id) = cur {
                let (hash, next) = {
                    let h = arena.get(id).expect("chained handle must be live");
                    (h.hash, h.next_hash)
                };
                let bucket = hash as usize & (new_len - 1);
                if let Some(h) = arena.get_mut(id) {
                    h.next_hash = new_buckets[bucket];
                }
                new_buckets[bucket] = Some(id);
                cur = next;
                relinked += 1;
            }
        }
        debug_assert_eq!(relinked, self.elems);
        self.buckets = new_buckets;
    }

    pub(crate) fn debug_validate_invariants<T>(&self, arena: &HandleArena<T>) {
        assert!(self.buckets.len().is_power_of_two());
        assert!(self.buckets.len() >= MIN_BUCKETS);

        let mut seen = std::collections::HashSet::new();
        let mask = self.buckets.len() - 1;
        for (bucket, &head) in self.buckets.iter().enumerate() {
            let mut cur = head;
            while let Some(id) = cur {
                assert!(seen.insert(id), "handle chained twice");
                let h = arena.get(id).expect("chained handle must be live");
                assert_eq!(h.hash as usize & mask, bucket, "handle in wrong bucket");
                cur = h.next_hash;
            }
        }
        assert_eq!(seen.len(), self.elems);
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{Deleter, Priority};

    fn insert_entry(
        table: &mut HandleTable,
        arena: &mut HandleArena<u64>,
        key: &[u8],
        hash: u32,
        value: u64,
    ) -> (HandleId, Option<HandleId>) {
        let deleter: Deleter<u64> = Box::new(|_, _| {});
        let id = arena.insert(LruHandle::new(key, hash, value, 1, deleter, Priority::Low, 1));
        let old = table.insert(id, arena);
        (id, old)
    }

    #[test]
    fn lookup_finds_inserted_entry() {
        let mut arena = HandleArena::new();
        let mut table = HandleTable::new();
        let (id, old) = insert_entry(&mut table, &mut arena, b"a", 17, 1);
        assert!(old.is_none());
        assert_eq!(table.lookup(b"a", 17, &arena), Some(id));
        assert_eq!(table.lookup(b"missing", 17, &arena), None);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn same_hash_different_keys_share_bucket() {
        let mut arena = HandleArena::new();
        let mut table = HandleTable::new();
        let (a, _) = insert_entry(&mut table, &mut arena, b"a", 5, 1);
        let (b, _) = insert_entry(&mut table, &mut arena, b"b", 5, 2);
        let (c, _) = insert_entry(&mut table, &mut arena, b"c", 5, 3);
        assert_eq!(table.lookup(b"a", 5, &arena), Some(a));
        assert_eq!(table.lookup(b"b", 5, &arena), Some(b));
        assert_eq!(table.lookup(b"c", 5, &arena), Some(c));
        assert_eq!(table.len(), 3);
        table.debug_validate_invariants(&arena);
    }

    #[test]
    fn duplicate_insert_displaces_prior_entry() {
        let mut arena = HandleArena::new();
        let mut table = HandleTable::new();
        let (first, _) = insert_entry(&mut table, &mut arena, b"a", 17, 1);
        let (second, old) = insert_entry(&mut table, &mut arena, b"a", 17, 2);
        assert_eq!(old, Some(first));
        assert_eq!(table.lookup(b"a", 17, &arena), Some(second));
        assert_eq!(table.len(), 1);
        // displaced record is still live in the arena; its chain link is
        // cleared
        assert!(arena.get(first).unwrap().next_hash.is_none());
    }

    #[test]
    fn remove_unlinks_from_middle_of_chain() {
        let mut arena = HandleArena::new();
        let mut table = HandleTable::new();
        let (a, _) = insert_entry(&mut table, &mut arena, b"a", 5, 1);
        let (b, _) = insert_entry(&mut table, &mut arena, b"b", 5, 2);
        let (c, _) = insert_entry(&mut table, &mut arena, b"c", 5, 3);

        assert_eq!(table.remove(b"b", 5, &mut arena), Some(b));
        assert_eq!(table.lookup(b"a", 5, &arena), Some(a));
        assert_eq!(table.lookup(b"b", 5, &arena), None);
        assert_eq!(table.lookup(b"c", 5, &arena), Some(c));
        assert_eq!(table.len(), 2);

        assert_eq!(table.remove(b"b", 5, &mut arena), None);
        table.debug_validate_invariants(&arena);
    }

    #[test]
    fn growth_preserves_every_entry() {
        let mut arena = HandleArena::new();
        let mut table = HandleTable::new();
        let mut ids = Vec::new();
        for i in 0..200u32 {
            let key = i.to_be_bytes();
            let (id, _) = insert_entry(&mut table, &mut arena, &key, i.wrapping_mul(2654435761), i as u64);
            ids.push((key, i.wrapping_mul(2654435761), id));
        }
        assert_eq!(table.len(), 200);
        table.debug_validate_invariants(&arena);
        for (key, hash, id) in ids {
            assert_eq!(table.lookup(&key, hash, &arena), Some(id));
        }
    }

    #[test]
    fn apply_to_all_visits_each_entry_once() {
        let mut arena = HandleArena::new();
        let mut table = HandleTable::new();
        for i in 0..50u32 {
            insert_entry(&mut table, &mut arena, &i.to_be_bytes(), i, i as u64);
        }
        let mut visited = std::collections::HashSet::new();
        table.apply_to_all(&arena, |h| {
            assert!(visited.insert(h.key().to_vec()));
        });
        assert_eq!(visited.len(), 50);
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use crate::handle::{Deleter, Priority};
    use proptest::prelude::*;
    use std::collections::HashMap;

    fn fill(
        ops: &[(u8, u8)],
        table: &mut HandleTable,
        arena: &mut HandleArena<u64>,
        model: &mut HashMap<Vec<u8>, u64>,
    ) {
        for (i, &(key_byte, action)) in ops.iter().enumerate() {
            let key = vec![key_byte];
            // Deliberately weak hash to force chain collisions.
            let hash = (key_byte % 8) as u32;
            if action % 3 == 0 {
                // remove
                let removed = table.remove(&key, hash, arena);
                assert_eq!(removed.is_some(), model.remove(&key).is_some());
                if let Some(id) = removed {
                    arena.remove(id);
                }
            } else {
                let deleter: Deleter<u64> = Box::new(|_, _| {});
                let id = arena.insert(LruHandle::new(
                    &key,
                    hash,
                    i as u64,
                    1,
                    deleter,
                    Priority::Low,
                    1,
                ));
                if let Some(old) = table.insert(id, arena) {
                    arena.remove(old);
                }
                model.insert(key, i as u64);
            }
        }
    }

    proptest! {
        /// Property: the table agrees with a HashMap model under random
        /// insert/replace/remove churn, including collision-heavy hashes.
        #[cfg_attr(miri, ignore)]
        #[test]
        fn prop_matches_hashmap_model(ops in prop::collection::vec((any::<u8>(), any::<u8>()), 0..200)) {
            let mut arena = HandleArena::new();
            let mut table = HandleTable::new();
            let mut model = HashMap::new();

            fill(&ops, &mut table, &mut arena, &mut model);

            table.debug_validate_invariants(&arena);
            prop_assert_eq!(table.len(), model.len());
            for (key, value) in &model {
                let hash = (key[0] % 8) as u32;
                let id = table.lookup(key, hash, &arena);
                prop_assert!(id.is_some());
                prop_assert_eq!(*arena.get(id.unwrap()).unwrap().value(), *value);
            }
        }
    }
}
