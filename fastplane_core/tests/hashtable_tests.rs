use fastplane_core::arena::MemoryArena;
use fastplane_core::config::{ArenaConfig, BuildLimits};
use fastplane_core::errors::Error;
use fastplane_core::hashtable::HashTableBuilder;
use proptest::collection::hash_set;
use proptest::prelude::*;
use std::hash::{BuildHasherDefault, Hasher};

/// Hash = the key itself, so tests can place keys exactly.
#[derive(Default)]
struct IdentityHasher(u64);

impl Hasher for IdentityHasher {
    fn write(&mut self, bytes: &[u8]) {
        for &b in bytes.iter().rev() {
            self.0 = (self.0 << 8) | b as u64;
        }
    }

    fn write_u64(&mut self, n: u64) {
        self.0 = n;
    }

    fn finish(&self) -> u64 {
        self.0
    }
}

type Identity = BuildHasherDefault<IdentityHasher>;

fn arena() -> MemoryArena {
    MemoryArena::new(&ArenaConfig::default())
}

#[test]
fn forced_overflow_doubles_until_everything_fits() {
    let arena = arena();
    // 40 keys that all land on slot 0 of a 256-slot table
    let entries: Vec<(u64, u32)> = (0..40u64).map(|i| (i * 256, i as u32)).collect();
    let table = HashTableBuilder::new(&arena, "test.collide", 0)
        .chunk_size(16)
        .with_hasher(Identity::default())
        .build(&entries)
        .unwrap();

    let stats = table.stats();
    assert_eq!(stats.capacity, 1024);
    assert!(stats.capacity > 256);
    assert_eq!(stats.attempts, 3);
    assert_eq!(stats.insert_failed, 0);
    assert_eq!(stats.keys, 40);
    assert_eq!(stats.longest_chain, 10);
    for (k, v) in &entries {
        assert_eq!(table.lookup(k), Some(v));
    }
    assert_eq!(table.lookup(&(40 * 256)), None);
}

#[test]
fn capped_growth_reports_capacity_overflow() {
    let arena = arena();
    let entries: Vec<(u64, u32)> = (0..40u64).map(|i| (i * 256, 0)).collect();
    let err = HashTableBuilder::new(&arena, "test.cap", 0)
        .chunk_size(16)
        .with_hasher(Identity::default())
        .limits(BuildLimits {
            max_capacity: 512,
            max_attempts: 16,
        })
        .build(&entries)
        .unwrap_err();
    assert!(matches!(err, Error::CapacityOverflow { attempts: 2, .. }));

    let err = HashTableBuilder::new(&arena, "test.cap", 0)
        .chunk_size(16)
        .with_hasher(Identity::default())
        .limits(BuildLimits {
            max_capacity: 1 << 20,
            max_attempts: 1,
        })
        .build(&entries)
        .unwrap_err();
    assert!(matches!(err, Error::CapacityOverflow { attempts: 1, .. }));
    // discarded attempts returned their memory
    assert_eq!(arena.usage(0), 0);
}

#[test]
fn probe_wraps_at_the_end_of_the_array() {
    let arena = arena();
    // keys hashing to the last slot spill over into slot 0..
    let entries: Vec<(u64, u32)> = (0..4u64).map(|i| (127 + i * 128, i as u32)).collect();
    let table = HashTableBuilder::new(&arena, "test.wrap", 0)
        .chunk_size(4)
        .with_hasher(Identity::default())
        .build(&entries)
        .unwrap();
    assert_eq!(table.capacity(), 128);
    assert_eq!(table.stats().longest_chain, 4);
    for (k, v) in &entries {
        assert_eq!(table.lookup(k), Some(v));
    }
}

#[test]
fn limits_rows_and_iteration() {
    let arena = arena();
    let entries: Vec<(u32, u32)> = (0..100).map(|i| (i, i * 2)).collect();
    let table = HashTableBuilder::new(&arena, "acl.total.ht", 0)
        .with_hasher(Identity::default())
        .build(&entries)
        .unwrap();
    let mut rows = Vec::new();
    table.limits(&mut rows);
    assert_eq!(rows[0].name, "acl.total.ht.keys");
    assert_eq!((rows[0].current, rows[0].maximum), (100, 512));
    assert_eq!(rows[1].name, "acl.total.ht.longest_collision");
    assert_eq!((rows[1].current, rows[1].maximum), (1, 16));
    assert_eq!(rows[0].socket_id, Some(0));

    let mut seen: Vec<(u32, u32)> = table.iter().map(|(k, v)| (*k, *v)).collect();
    seen.sort();
    assert_eq!(seen, entries);
    assert_eq!(table.stats().keys_in_chunks.iter().sum::<u64>(), 512 / 16);
}

#[test]
fn empty_input_builds_minimum_table() {
    let arena = arena();
    let table = HashTableBuilder::new(&arena, "test.empty", 0)
        .build::<u64, u64>(&[])
        .unwrap();
    assert!(table.is_empty());
    assert_eq!(table.capacity(), 128);
    assert_eq!(table.lookup(&0), None);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn no_false_misses(keys in hash_set(any::<u64>(), 0..2048)) {
        let arena = arena();
        let entries: Vec<(u64, u64)> = keys.iter().map(|&k| (k, k.rotate_left(7))).collect();
        let table = HashTableBuilder::new(&arena, "test.prop", 0).build(&entries).unwrap();
        prop_assert!(entries.len() <= table.capacity() / 4);
        prop_assert_eq!(table.len(), entries.len());
        for (k, v) in &entries {
            prop_assert_eq!(table.lookup(k), Some(v));
        }
    }
}
