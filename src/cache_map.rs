//! Hash map with a small direct-mapped cache in front.
//!
//! Entries live in a slot arena indexed by a `HashMap<K, usize>`. A fixed
//! array of `N` cache lines sits in front; line `hash(key) % N` remembers the
//! arena slot of the key most recently inserted or looked up in that bucket.
//! A repeated lookup of a hot key then costs one hash and one key compare.
//!
//! Invariants:
//! - A non-empty cache line always names a live arena slot whose key hashes
//!   to that line. Erase and clear invalidate lines before slots are reused.
//! - One entry per line; colliding keys evict each other. With `N == 1`
//!   every key contends for the same line, which only costs misses.
//! - The miss counter is cumulative for the map's lifetime; `clear` keeps it.
//!
//! Not thread-safe: wrap in a mutex for shared use.

use crate::error::{Error, Result};
use std::borrow::Borrow;
use std::collections::HashMap;
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash};

/// Default number of cache lines.
pub const DEFAULT_CACHE_SIZE: usize = 64;

/// Hash map fronted by an `N`-line direct-mapped cache.
pub struct CachingMap<K, V, const N: usize = DEFAULT_CACHE_SIZE, S = RandomState> {
    index: HashMap<K, usize, S>,
    slots: Vec<Option<(K, V)>>,
    free: Vec<usize>,
    cache: [Option<usize>; N],
    misses: u64,
}

impl<K, V, const N: usize> CachingMap<K, V, N, RandomState>
where
    K: Hash + Eq + Clone,
{
    pub fn new() -> Self {
        Self::with_hasher(RandomState::new())
    }
}

impl<K, V, const N: usize, S> CachingMap<K, V, N, S>
where
    K: Hash + Eq + Clone,
    S: BuildHasher,
{
    /// Create an empty map that hashes with `hasher`. The cache uses the
    /// same hasher as the backing map.
    pub fn with_hasher(hasher: S) -> Self {
        const { assert!(N > 0, "cache size must be nonzero") };
        Self {
            index: HashMap::with_hasher(hasher),
            slots: Vec::new(),
            free: Vec::new(),
            cache: [None; N],
            misses: 0,
        }
    }

    /// Number of cache lines.
    pub const fn cache_size(&self) -> usize {
        N
    }

    #[inline]
    fn line<Q>(&self, key: &Q) -> usize
    where
        Q: Hash + ?Sized,
    {
        (self.index.hasher().hash_one(key) % N as u64) as usize
    }

    #[inline]
    fn slot_key(&self, slot: usize) -> Option<&K> {
        self.slots.get(slot)?.as_ref().map(|(k, _)| k)
    }

    /// Arena slot of `key`, going through the cache. Refreshes the line on
    /// a miss that hits the backing map.
    fn lookup<Q>(&mut self, key: &Q) -> Option<usize>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let line = self.line(key);
        if let Some(slot) = self.cache[line] {
            if self.slot_key(slot).is_some_and(|k| k.borrow() == key) {
                return Some(slot);
            }
        }
        self.misses += 1;
        let slot = *self.index.get(key)?;
        self.cache[line] = Some(slot);
        Some(slot)
    }

    /// Store a key known to be absent; returns its arena slot.
    fn insert_new(&mut self, key: K, value: V) -> Result<usize> {
        self.index
            .try_reserve(1)
            .map_err(|_| Error::AllocationFailure {
                size: core::mem::size_of::<(K, usize)>(),
            })?;
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some((key.clone(), value));
                slot
            }
            None => {
                self.slots
                    .try_reserve(1)
                    .map_err(|_| Error::AllocationFailure {
                        size: core::mem::size_of::<Option<(K, V)>>(),
                    })?;
                self.slots.push(Some((key.clone(), value)));
                self.slots.len() - 1
            }
        };
        let line = self.line(&key);
        self.index.insert(key, slot);
        self.cache[line] = Some(slot);
        Ok(slot)
    }

    /// Insert a new entry. Never overwrites: an existing key fails with
    /// [`Error::AlreadyPresent`] and leaves the map unchanged.
    pub fn insert(&mut self, key: K, value: V) -> Result<()> {
        if self.index.contains_key(&key) {
            return Err(Error::AlreadyPresent);
        }
        self.insert_new(key, value).map(|_| ())
    }

    /// Look up `key`, checking the cache first.
    pub fn find<Q>(&mut self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let slot = self.lookup(key)?;
        self.slots[slot].as_ref().map(|(_, v)| v)
    }

    pub fn find_mut<Q>(&mut self, key: &Q) -> Option<&mut V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let slot = self.lookup(key)?;
        self.slots[slot].as_mut().map(|(_, v)| v)
    }

    /// `find(key).is_some()`; counts toward misses the same way.
    pub fn contains<Q>(&mut self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.lookup(key).is_some()
    }

    /// Value for `key`, inserting `V::default()` first if absent.
    pub fn get_or_insert_default(&mut self, key: K) -> Result<&mut V>
    where
        V: Default,
    {
        let slot = match self.lookup(&key) {
            Some(slot) => slot,
            None => self.insert_new(key, V::default())?,
        };
        match &mut self.slots[slot] {
            Some((_, value)) => Ok(value),
            None => unreachable!("indexed slot {slot} is vacant"),
        }
    }

    /// Remove `key`, returning its value. Clears the key's cache line if the
    /// line points at it.
    pub fn erase<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let slot = self.index.remove(key)?;
        let line = self.line(key);
        if self.cache[line] == Some(slot) {
            self.cache[line] = None;
        }
        let (_, value) = self.slots[slot].take()?;
        self.free.push(slot);
        Some(value)
    }

    /// Remove every entry and empty the cache. The miss counter is kept.
    pub fn clear(&mut self) {
        self.cache = [None; N];
        self.index.clear();
        self.slots.clear();
        self.free.clear();
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Lookups that had to consult the backing map.
    pub fn cache_misses(&self) -> u64 {
        self.misses
    }

    /// Entries in arbitrary order. Does not touch the cache.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.slots.iter().filter_map(|s| s.as_ref().map(|(k, v)| (k, v)))
    }
}

impl<K, V, const N: usize, S> Default for CachingMap<K, V, N, S>
where
    K: Hash + Eq + Clone,
    S: BuildHasher + Default,
{
    fn default() -> Self {
        Self::with_hasher(S::default())
    }
}

impl<K, V, const N: usize, S> core::fmt::Debug for CachingMap<K, V, N, S>
where
    K: Hash + Eq + Clone + core::fmt::Debug,
    V: core::fmt::Debug,
    S: BuildHasher,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}
