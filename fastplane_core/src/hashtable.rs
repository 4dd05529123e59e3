//! Immutable open-addressing hash table with bounded-probe construction
//!
//! Tables are built once from a full entry set and never modified. A key
//! lives in the first free-or-equal slot of the `chunk_size` slots starting
//! at `hash(key) & mask`, wrapping at the end of the array. When a key finds
//! no room in its window the builder throws the whole table away, doubles the
//! capacity and starts again.

use crate::arena::{ArenaSlice, MemoryArena};
use crate::config::BuildLimits;
use crate::constants::{HT_DEFAULT_CHUNK, HT_LOAD_FACTOR, HT_MIN_KEYS};
use crate::errors::{Error, Result};
use crate::helpers::{pow2_at_least, FnvBuildHasher};
use crate::types::{LimitItem, SocketId, Zeroable};
use log::{debug, info, warn};
#[cfg(feature = "trace")]
use log::trace;
use metrics::{counter, histogram};
use std::hash::{BuildHasher, Hash};

#[derive(Clone, Copy)]
#[repr(C)]
pub struct Slot<K, V> {
    key: K,
    value: V,
    valid: u8,
}

unsafe impl<K: Zeroable, V: Zeroable> Zeroable for Slot<K, V> {}

/// Statistics of the successful build attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildStats {
    pub capacity: usize,
    pub chunk_size: usize,
    /// Distinct keys stored.
    pub keys: usize,
    /// Inputs that replaced the value of an earlier equal key.
    pub rewrites: usize,
    /// Inserts that found no room in this attempt.
    pub insert_failed: usize,
    /// Longest probe distance of any stored key, in slots.
    pub longest_chain: usize,
    /// `keys_in_chunks[n]` = aligned windows holding exactly `n` keys.
    pub keys_in_chunks: Vec<u64>,
    pub attempts: u32,
}

pub struct HashTable<K: Zeroable, V: Zeroable, S = FnvBuildHasher> {
    name: String,
    socket_id: SocketId,
    slots: ArenaSlice<Slot<K, V>>,
    mask: usize,
    chunk_size: usize,
    hasher: S,
    stats: BuildStats,
}

impl<K, V, S> HashTable<K, V, S>
where
    K: Zeroable + Hash + Eq,
    V: Zeroable,
    S: BuildHasher,
{
    #[inline]
    pub fn lookup(&self, key: &K) -> Option<&V> {
        let start = self.hasher.hash_one(key) as usize & self.mask;
        for i in 0..self.chunk_size {
            let slot = &self.slots[(start + i) & self.mask];
            if slot.valid == 0 {
                return None;
            }
            if slot.key == *key {
                return Some(&slot.value);
            }
        }
        None
    }

    pub fn contains(&self, key: &K) -> bool {
        self.lookup(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> + '_ {
        self.slots
            .iter()
            .filter(|s| s.valid != 0)
            .map(|s| (&s.key, &s.value))
    }

    pub fn len(&self) -> usize {
        self.stats.keys
    }

    pub fn is_empty(&self) -> bool {
        self.stats.keys == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn socket_id(&self) -> SocketId {
        self.socket_id
    }

    pub fn stats(&self) -> &BuildStats {
        &self.stats
    }

    /// Append `<name>.keys` and `<name>.longest_collision`.
    pub fn limits(&self, out: &mut Vec<LimitItem>) {
        out.push(LimitItem::new(
            format!("{}.keys", self.name),
            Some(self.socket_id),
            self.stats.keys as u64,
            self.capacity() as u64,
        ));
        out.push(LimitItem::new(
            format!("{}.longest_collision", self.name),
            Some(self.socket_id),
            self.stats.longest_chain as u64,
            self.chunk_size as u64,
        ));
    }
}

impl<K: Zeroable, V: Zeroable, S> std::fmt::Debug for HashTable<K, V, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashTable")
            .field("name", &self.name)
            .field("socket_id", &self.socket_id)
            .field("capacity", &self.slots.len())
            .field("keys", &self.stats.keys)
            .finish()
    }
}

pub struct HashTableBuilder<'a, S = FnvBuildHasher> {
    arena: &'a MemoryArena,
    name: String,
    socket_id: SocketId,
    chunk_size: usize,
    limits: BuildLimits,
    hasher: S,
}

impl<'a> HashTableBuilder<'a> {
    pub fn new(arena: &'a MemoryArena, name: impl Into<String>, socket_id: SocketId) -> Self {
        Self {
            arena,
            name: name.into(),
            socket_id,
            chunk_size: HT_DEFAULT_CHUNK,
            limits: BuildLimits::default(),
            hasher: FnvBuildHasher,
        }
    }
}

impl<'a, S: BuildHasher + Clone> HashTableBuilder<'a, S> {
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn limits(mut self, limits: BuildLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_hasher<H: BuildHasher + Clone>(self, hasher: H) -> HashTableBuilder<'a, H> {
        HashTableBuilder {
            arena: self.arena,
            name: self.name,
            socket_id: self.socket_id,
            chunk_size: self.chunk_size,
            limits: self.limits,
            hasher,
        }
    }

    fn initial_capacity(&self, keys: usize) -> usize {
        pow2_at_least(HT_MIN_KEYS.max(keys.saturating_mul(HT_LOAD_FACTOR))).max(self.chunk_size)
    }

    pub fn build<K, V>(&self, entries: &[(K, V)]) -> Result<HashTable<K, V, S>>
    where
        K: Zeroable + Hash + Eq,
        V: Zeroable,
    {
        if !self.chunk_size.is_power_of_two() {
            return Err(Error::Config(format!(
                "{}: chunk size {} is not a power of two",
                self.name, self.chunk_size
            )));
        }

        let mut capacity = self.initial_capacity(entries.len());
        let mut attempts = 0u32;

        while attempts < self.limits.max_attempts && capacity <= self.limits.max_capacity {
            attempts += 1;
            let mut slots = self
                .arena
                .create_zeroed_slice::<Slot<K, V>>(&self.name, self.socket_id, capacity)?;
            match self.fill(&mut slots, entries) {
                Ok(mut stats) => {
                    stats.attempts = attempts;
                    counter!("fastplane_table_builds_total").increment(1);
                    histogram!("fastplane_table_build_attempts").record(attempts as f64);
                    info!(
                        "[HT] {} socket={} keys={} capacity={} longest_chain={} attempts={}",
                        self.name, self.socket_id, stats.keys, capacity, stats.longest_chain, attempts
                    );
                    return Ok(HashTable {
                        name: self.name.clone(),
                        socket_id: self.socket_id,
                        mask: capacity - 1,
                        chunk_size: self.chunk_size,
                        slots,
                        hasher: self.hasher.clone(),
                        stats,
                    });
                }
                Err(failed_at) => {
                    counter!("fastplane_table_insert_failures_total").increment(1);
                    warn!(
                        "[HT] {} socket={} window full at entry {} with capacity {}; doubling",
                        self.name, self.socket_id, failed_at, capacity
                    );
                    drop(slots);
                    capacity = capacity.saturating_mul(2);
                }
            }
        }

        counter!("fastplane_table_overflows_total").increment(1);
        Err(Error::CapacityOverflow {
            name: self.name.clone(),
            socket_id: self.socket_id,
            capacity,
            attempts,
        })
    }

    /// Insert every entry; `Err(index)` names the first entry that found no room.
    fn fill<K, V>(
        &self,
        slots: &mut ArenaSlice<Slot<K, V>>,
        entries: &[(K, V)],
    ) -> std::result::Result<BuildStats, usize>
    where
        K: Zeroable + Hash + Eq,
        V: Zeroable,
    {
        let mask = slots.len() - 1;
        let mut stats = BuildStats {
            capacity: slots.len(),
            chunk_size: self.chunk_size,
            ..BuildStats::default()
        };

        'entries: for (idx, (key, value)) in entries.iter().enumerate() {
            let start = self.hasher.hash_one(key) as usize & mask;
            for i in 0..self.chunk_size {
                let slot = &mut slots[(start + i) & mask];
                if slot.valid == 0 {
                    slot.key = *key;
                    slot.value = *value;
                    slot.valid = 1;
                    stats.keys += 1;
                    stats.longest_chain = stats.longest_chain.max(i + 1);
                    #[cfg(feature = "trace")]
                    trace!("[HT] {} entry {} -> slot {}", self.name, idx, (start + i) & mask);
                    continue 'entries;
                }
                if slot.key == *key {
                    slot.value = *value;
                    stats.rewrites += 1;
                    continue 'entries;
                }
            }
            return Err(idx);
        }

        let mut hist = vec![0u64; self.chunk_size + 1];
        for window in slots.chunks(self.chunk_size) {
            let n = window.iter().filter(|s| s.valid != 0).count();
            hist[n] += 1;
        }
        stats.keys_in_chunks = hist;
        debug!(
            "[HT] {} filled {} keys, {} rewrites",
            self.name, stats.keys, stats.rewrites
        );
        Ok(stats)
    }
}
