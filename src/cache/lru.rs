// Reference-counted LRU cache shard.
//
// Entries live in a slab and are linked three ways: into a chained bucket
// array by key hash, and into exactly one of two intrusive lists — the
// in-use list (an external handle is out) or the evictable list (only the
// cache's own reference remains). Eviction only ever takes from the
// evictable list, so pinned entries can never be dropped under a caller.
//
// Reference discipline: a resident entry carries one baseline reference
// owned by the cache. `refs == 1` ⇔ the entry is on the evictable list.
// `insert` returns a handle with `refs == 2`, already visible on the
// in-use list; every handle must be released exactly once.

use crate::util::hash::hash32;
use parking_lot::Mutex;
use std::sync::Arc;

/// Default per-entry charge.
pub const DEFAULT_CHARGE: usize = 8;

/// Default charge ceiling for a standalone cache.
pub const DEFAULT_TOTAL_CHARGE: usize = 1000 * DEFAULT_CHARGE;

const INITIAL_BUCKETS: usize = 2;
const DEFAULT_EXPAND_RATIO: f64 = 0.8;
const DEFAULT_EXPAND_FACTOR: usize = 2;
const HASH_SEED: u32 = 0;

/// Pinned reference to a cache entry. Must be given back through
/// `release` exactly once; dropping it without releasing leaks the pin.
#[must_use]
pub struct CacheHandle<V> {
    value: Arc<V>,
    hash: u32,
    slot: usize,
}

impl<V> CacheHandle<V> {
    pub fn value(&self) -> &V {
        &self.value
    }

    pub(crate) fn hash(&self) -> u32 {
        self.hash
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListId {
    InUse,
    Evictable,
}

struct Entry<V> {
    key: Vec<u8>,
    hash: u32,
    value: Arc<V>,
    charge: usize,
    refs: usize,
    /// False once erased or displaced; the slot lingers until refs == 0.
    resident: bool,
    list: ListId,
    bucket_next: Option<usize>,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Default, Clone, Copy)]
struct LinkedList {
    head: Option<usize>,
    tail: Option<usize>,
}

struct State<V> {
    slots: Vec<Option<Entry<V>>>,
    free_slots: Vec<usize>,
    buckets: Vec<Option<usize>>,
    in_use: LinkedList,
    evictable: LinkedList,
    /// Resident entry count.
    size: usize,
    usage: usize,
    total_charge: usize,
    expand_ratio: f64,
    expand_factor: usize,
}

pub struct LruCache<V> {
    state: Mutex<State<V>>,
}

impl<V> LruCache<V> {
    pub fn new(total_charge: usize) -> Self {
        Self::with_expansion(total_charge, DEFAULT_EXPAND_RATIO, DEFAULT_EXPAND_FACTOR)
    }

    pub fn with_expansion(total_charge: usize, ratio: f64, factor: usize) -> Self {
        assert!(total_charge > 0);
        assert!(ratio > 0.0 && ratio <= 1.0);
        assert!(factor >= 2);
        Self {
            state: Mutex::new(State {
                slots: Vec::new(),
                free_slots: Vec::new(),
                buckets: vec![None; INITIAL_BUCKETS],
                in_use: LinkedList::default(),
                evictable: LinkedList::default(),
                size: 0,
                usage: 0,
                total_charge,
                expand_ratio: ratio,
                expand_factor: factor,
            }),
        }
    }

    /// Inserts `value` under `key`, displacing any existing entry and
    /// evicting from the evictable list while over the ceiling. Returns
    /// `None` when the charge alone exceeds the ceiling (or is zero); the
    /// cache is left untouched in that case.
    pub fn insert(&self, key: &[u8], value: V, charge: usize) -> Option<CacheHandle<V>> {
        let hash = hash32(key, HASH_SEED);
        self.insert_with_hash(key, hash, value, charge)
    }

    pub(crate) fn insert_with_hash(
        &self,
        key: &[u8],
        hash: u32,
        value: V,
        charge: usize,
    ) -> Option<CacheHandle<V>> {
        let mut state = self.state.lock();
        if charge == 0 || charge > state.total_charge {
            return None;
        }

        if state.needs_expand() {
            state.expand();
        }

        if let Some(existing) = state.find(key, hash) {
            state.remove_resident(existing);
        }

        while state.usage + charge > state.total_charge {
            match state.evictable.head {
                Some(victim) => state.remove_resident(victim),
                None => break,
            }
        }

        let value = Arc::new(value);
        let slot = state.alloc_slot(Entry {
            key: key.to_vec(),
            hash,
            value: Arc::clone(&value),
            charge,
            refs: 1,
            resident: true,
            list: ListId::InUse,
            bucket_next: None,
            prev: None,
            next: None,
        });
        state.bucket_insert(slot);
        state.push_back(ListId::InUse, slot);
        state.usage += charge;
        state.size += 1;

        // One external reference for the caller.
        state.entry_mut(slot).refs = 2;
        Some(CacheHandle { value, hash, slot })
    }

    pub fn lookup(&self, key: &[u8]) -> Option<CacheHandle<V>> {
        let hash = hash32(key, HASH_SEED);
        let mut state = self.state.lock();
        let slot = state.find(key, hash)?;
        let refs = {
            let entry = state.entry_mut(slot);
            entry.refs += 1;
            entry.refs
        };
        if refs == 2 {
            // Only the cache held it: move off the evictable list.
            state.unlink(slot);
            state.push_back(ListId::InUse, slot);
        }
        let value = Arc::clone(&state.entry(slot).value);
        Some(CacheHandle { value, hash, slot })
    }

    /// Drops one external reference. The last external release of a
    /// resident entry moves it to the evictable tail; a non-resident entry
    /// is freed once its references run out.
    pub fn release(&self, handle: CacheHandle<V>) {
        let mut state = self.state.lock();
        state.release_slot(handle.slot);
    }

    /// Removes the key from the cache. The entry's memory survives until
    /// outstanding handles are released.
    pub fn erase(&self, key: &[u8]) -> bool {
        let hash = hash32(key, HASH_SEED);
        let mut state = self.state.lock();
        match state.find(key, hash) {
            Some(slot) => {
                state.remove_resident(slot);
                true
            }
            None => false,
        }
    }

    /// Drains the evictable list.
    pub fn prune(&self) {
        let mut state = self.state.lock();
        while let Some(slot) = state.evictable.head {
            state.remove_resident(slot);
        }
    }

    pub fn total_usage(&self) -> usize {
        self.state.lock().usage
    }

    pub fn total_charge(&self) -> usize {
        self.state.lock().total_charge
    }

    pub fn set_total_charge(&self, total_charge: usize) {
        assert!(total_charge > 0);
        self.state.lock().total_charge = total_charge;
    }

    pub fn len(&self) -> usize {
        self.state.lock().size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        let hash = hash32(key, HASH_SEED);
        self.state.lock().find(key, hash).is_some()
    }

    /// Asserts the shard's bookkeeping invariants. Test support.
    #[doc(hidden)]
    pub fn check_invariants(&self) {
        let state = self.state.lock();

        let mut charge_sum = 0;
        let mut resident = 0;
        for slot in state.slots.iter().flatten() {
            if slot.resident {
                resident += 1;
                charge_sum += slot.charge;
                assert!(slot.refs >= 1);
                assert_eq!(
                    slot.refs == 1,
                    slot.list == ListId::Evictable,
                    "refs == 1 must coincide with evictable membership"
                );
            }
        }
        assert_eq!(charge_sum, state.usage);
        assert_eq!(resident, state.size);

        let walk = |list: &LinkedList, id: ListId| {
            let mut n = 0;
            let mut cur = list.head;
            let mut prev = None;
            while let Some(slot) = cur {
                let entry = state.entry(slot);
                assert!(entry.resident);
                assert_eq!(entry.list, id);
                assert_eq!(entry.prev, prev);
                prev = cur;
                cur = entry.next;
                n += 1;
            }
            assert_eq!(list.tail, prev);
            n
        };
        let on_lists = walk(&state.in_use, ListId::InUse) + walk(&state.evictable, ListId::Evictable);
        assert_eq!(on_lists, state.size);
    }
}

impl<V> State<V> {
    fn entry(&self, slot: usize) -> &Entry<V> {
        self.slots[slot].as_ref().expect("live cache slot")
    }

    fn entry_mut(&mut self, slot: usize) -> &mut Entry<V> {
        self.slots[slot].as_mut().expect("live cache slot")
    }

    fn alloc_slot(&mut self, entry: Entry<V>) -> usize {
        match self.free_slots.pop() {
            Some(slot) => {
                self.slots[slot] = Some(entry);
                slot
            }
            None => {
                self.slots.push(Some(entry));
                self.slots.len() - 1
            }
        }
    }

    fn free_slot(&mut self, slot: usize) {
        self.slots[slot] = None;
        self.free_slots.push(slot);
    }

    fn bucket_of(&self, hash: u32) -> usize {
        hash as usize % self.buckets.len()
    }

    fn find(&self, key: &[u8], hash: u32) -> Option<usize> {
        let mut cur = self.buckets[self.bucket_of(hash)];
        while let Some(slot) = cur {
            let entry = self.entry(slot);
            if entry.hash == hash && entry.key == key {
                return Some(slot);
            }
            cur = entry.bucket_next;
        }
        None
    }

    fn bucket_insert(&mut self, slot: usize) {
        let bucket = self.bucket_of(self.entry(slot).hash);
        let head = self.buckets[bucket];
        self.entry_mut(slot).bucket_next = head;
        self.buckets[bucket] = Some(slot);
    }

    fn bucket_remove(&mut self, slot: usize) {
        let bucket = self.bucket_of(self.entry(slot).hash);
        let mut cur = self.buckets[bucket];
        let mut prev: Option<usize> = None;
        while let Some(s) = cur {
            if s == slot {
                let next = self.entry(slot).bucket_next;
                match prev {
                    Some(p) => self.entry_mut(p).bucket_next = next,
                    None => self.buckets[bucket] = next,
                }
                self.entry_mut(slot).bucket_next = None;
                return;
            }
            prev = cur;
            cur = self.entry(s).bucket_next;
        }
        unreachable!("entry missing from its bucket chain");
    }

    fn list_mut(&mut self, id: ListId) -> &mut LinkedList {
        match id {
            ListId::InUse => &mut self.in_use,
            ListId::Evictable => &mut self.evictable,
        }
    }

    fn push_back(&mut self, id: ListId, slot: usize) {
        let old_tail = self.list_mut(id).tail;
        {
            let entry = self.entry_mut(slot);
            entry.list = id;
            entry.prev = old_tail;
            entry.next = None;
        }
        match old_tail {
            Some(t) => self.entry_mut(t).next = Some(slot),
            None => self.list_mut(id).head = Some(slot),
        }
        self.list_mut(id).tail = Some(slot);
    }

    fn unlink(&mut self, slot: usize) {
        let (id, prev, next) = {
            let entry = self.entry(slot);
            (entry.list, entry.prev, entry.next)
        };
        match prev {
            Some(p) => self.entry_mut(p).next = next,
            None => self.list_mut(id).head = next,
        }
        match next {
            Some(n) => self.entry_mut(n).prev = prev,
            None => self.list_mut(id).tail = prev,
        }
        let entry = self.entry_mut(slot);
        entry.prev = None;
        entry.next = None;
    }

    /// Unlinks a resident entry from the bucket and its list and drops the
    /// cache's baseline reference. Frees the slot when no handle is out.
    fn remove_resident(&mut self, slot: usize) {
        debug_assert!(self.entry(slot).resident);
        self.bucket_remove(slot);
        self.unlink(slot);
        let charge = self.entry(slot).charge;
        self.usage -= charge;
        self.size -= 1;
        let refs = {
            let entry = self.entry_mut(slot);
            entry.resident = false;
            entry.refs -= 1;
            entry.refs
        };
        if refs == 0 {
            self.free_slot(slot);
        }
    }

    fn release_slot(&mut self, slot: usize) {
        let (refs, resident) = {
            let entry = self.entry_mut(slot);
            assert!(entry.refs >= 1, "cache handle released twice");
            entry.refs -= 1;
            (entry.refs, entry.resident)
        };
        if resident {
            if refs == 1 {
                self.unlink(slot);
                self.push_back(ListId::Evictable, slot);
            }
        } else if refs == 0 {
            self.free_slot(slot);
        }
    }

    fn needs_expand(&self) -> bool {
        (self.buckets.len() as f64) * self.expand_ratio < self.size as f64
    }

    /// Grow-only rehash: the bucket array doubles and never shrinks.
    fn expand(&mut self) {
        let new_cap = self.buckets.len() * self.expand_factor;
        let resident: Vec<usize> = {
            let mut all = Vec::with_capacity(self.size);
            for bucket in &self.buckets {
                let mut cur = *bucket;
                while let Some(slot) = cur {
                    all.push(slot);
                    cur = self.entry(slot).bucket_next;
                }
            }
            all
        };
        self.buckets = vec![None; new_cap];
        for slot in resident {
            self.entry_mut(slot).bucket_next = None;
            self.bucket_insert(slot);
        }
    }
}
