use fastplane_core::arena::MemoryArena;
use fastplane_core::config::ArenaConfig;
use fastplane_core::errors::Error;
use fastplane_core::lpm::{ChunkSlot, Lpm4Builder, SourceChunk, SourceTree};
use fastplane_core::types::GroupId;
use ipnet::Ipv4Net;
use proptest::prelude::*;
use std::net::Ipv4Addr;

const EMPTY: SourceChunk = [ChunkSlot::Group(0); 256];

fn arena() -> MemoryArena {
    MemoryArena::new(&ArenaConfig::default())
}

fn ip(s: &str) -> Ipv4Addr {
    s.parse().unwrap()
}

/// Two root entries share one level-1 chunk; its level-2 chunk points at
/// two leaf chunks with identical content.
fn shared_tree() -> SourceTree {
    let mut chunks = vec![EMPTY; 5];
    chunks[0][1] = ChunkSlot::Chunk(1);
    chunks[0][2] = ChunkSlot::Chunk(1);
    chunks[0][3] = ChunkSlot::Group(7);
    chunks[1][0] = ChunkSlot::Chunk(2);
    chunks[2][0] = ChunkSlot::Chunk(3);
    chunks[2][1] = ChunkSlot::Chunk(4);
    for leaf in [3, 4] {
        for (i, slot) in chunks[leaf].iter_mut().enumerate() {
            *slot = ChunkSlot::Group(if i < 128 { 5 } else { 6 });
        }
    }
    SourceTree::from_chunks(chunks)
}

#[test]
fn shared_leaves_take_one_extended_chunk() {
    let arena = arena();
    let lpm = Lpm4Builder::new(&arena, "test.lpm", 0)
        .build(&shared_tree())
        .unwrap();

    let stats = lpm.stats();
    assert_eq!(stats.extended_used, 1);
    assert_eq!(stats.shared_by_content, 1);
    assert_eq!(stats.shared_by_source, 2);
    assert_eq!(stats.attempts, 1);

    assert_eq!(lpm.lookup_ip(ip("1.0.0.7")), 5);
    assert_eq!(lpm.lookup_ip(ip("1.0.1.200")), 6);
    assert_eq!(lpm.lookup_ip(ip("2.0.0.127")), 5);
    assert_eq!(lpm.lookup_ip(ip("2.0.1.128")), 6);
    assert_eq!(lpm.lookup_ip(ip("1.0.2.0")), 0);
    assert_eq!(lpm.lookup_ip(ip("1.1.0.0")), 0);
    assert_eq!(lpm.lookup_ip(ip("3.200.10.1")), 7);
    assert_eq!(lpm.lookup_ip(ip("0.0.0.0")), 0);
    assert_eq!(lpm.lookup_ip(ip("255.255.255.255")), 0);
}

#[test]
fn uniform_leaves_are_written_into_the_root() {
    let arena = arena();
    let rules: Vec<(Ipv4Net, GroupId)> = vec![
        ("192.168.1.0/24".parse().unwrap(), 3),
        ("192.168.1.0/25".parse().unwrap(), 3),
        ("192.168.1.128/25".parse().unwrap(), 3),
    ];
    let tree = SourceTree::from_prefixes(&rules).unwrap();
    let lpm = Lpm4Builder::new(&arena, "test.uniform", 0).build(&tree).unwrap();
    assert_eq!(lpm.stats().extended_used, 0);
    assert_eq!(lpm.lookup_ip(ip("192.168.1.77")), 3);
    assert_eq!(lpm.lookup_ip(ip("192.168.2.77")), 0);
}

#[test]
fn empty_tree_classifies_everything_to_zero() {
    let arena = arena();
    for tree in [SourceTree::default(), SourceTree::from_prefixes(&[]).unwrap()] {
        let lpm = Lpm4Builder::new(&arena, "test.empty", 0).build(&tree).unwrap();
        assert_eq!(lpm.stats().extended_used, 0);
        assert_eq!(lpm.lookup(0), 0);
        assert_eq!(lpm.lookup(0x0a00_0001), 0);
        assert_eq!(lpm.lookup(u32::MAX), 0);
    }
}

#[test]
fn malformed_trees_are_structural_errors() {
    let arena = arena();
    let builder = Lpm4Builder::new(&arena, "test.bad", 0);

    let mut dangling = vec![EMPTY; 1];
    dangling[0][4] = ChunkSlot::Chunk(9);

    let mut to_root = vec![EMPTY; 2];
    to_root[0][4] = ChunkSlot::Chunk(1);
    to_root[1][0] = ChunkSlot::Chunk(0);

    let mut high_bit = vec![EMPTY; 1];
    high_bit[0][0] = ChunkSlot::Group(0x8000_0001);

    let mut too_deep = vec![EMPTY; 5];
    too_deep[0][0] = ChunkSlot::Chunk(1);
    too_deep[1][0] = ChunkSlot::Chunk(2);
    too_deep[2][0] = ChunkSlot::Chunk(3);
    too_deep[3][0] = ChunkSlot::Chunk(4);

    for chunks in [dangling, to_root, high_bit, too_deep] {
        let err = builder.build(&SourceTree::from_chunks(chunks)).unwrap_err();
        assert!(matches!(err, Error::StructuralInconsistency(_)), "{err}");
    }
    assert_eq!(arena.usage(0), 0);

    let bad_group = SourceTree::from_prefixes(&[("10.0.0.0/8".parse().unwrap(), 0x8000_0000)]);
    assert!(matches!(bad_group, Err(Error::StructuralInconsistency(_))));
}

fn distinct_leaves(n: u32) -> SourceTree {
    let rules: Vec<(Ipv4Net, GroupId)> = (0..n)
        .map(|i| (Ipv4Net::new(Ipv4Addr::new(10, 0, i as u8, 0), 25).unwrap(), i + 1))
        .collect();
    SourceTree::from_prefixes(&rules).unwrap()
}

#[test]
fn extended_pool_doubles_until_it_fits() {
    let arena = arena();
    let lpm = Lpm4Builder::new(&arena, "test.grow", 0)
        .extended(1, 1 << 10)
        .build(&distinct_leaves(8))
        .unwrap();
    let stats = lpm.stats();
    assert_eq!(stats.extended_used, 8);
    assert_eq!(stats.extended_capacity, 8);
    assert_eq!(stats.attempts, 2);
    for i in 0..8u8 {
        assert_eq!(lpm.lookup_ip(Ipv4Addr::new(10, 0, i, 1)), i as u32 + 1);
        assert_eq!(lpm.lookup_ip(Ipv4Addr::new(10, 0, i, 200)), 0);
    }

    let mut rows = Vec::new();
    lpm.limits(&mut rows);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].name, "test.grow.extended_chunks");
    assert_eq!((rows[0].current, rows[0].maximum), (8, 8));
}

#[test]
fn extended_pool_cap_is_an_overflow() {
    let arena = arena();
    let err = Lpm4Builder::new(&arena, "test.cap", 0)
        .extended(1, 4)
        .build(&distinct_leaves(8))
        .unwrap_err();
    assert!(matches!(err, Error::CapacityOverflow { attempts: 1, .. }));
    assert_eq!(arena.usage(0), 0);
}

#[test]
fn root_allocation_failure_is_reported() {
    let arena = arena();
    arena.set_socket_capacity(0, Some(1 << 20)).unwrap();
    let err = Lpm4Builder::new(&arena, "test.small", 0)
        .build(&distinct_leaves(1))
        .unwrap_err();
    assert!(matches!(err, Error::Allocation(_)));
}

fn naive(rules: &[(Ipv4Net, GroupId)], addr: Ipv4Addr) -> GroupId {
    let mut best: Option<(u8, GroupId)> = None;
    for (net, group) in rules {
        if net.contains(&addr) && best.map_or(true, |(len, _)| net.prefix_len() >= len) {
            best = Some((net.prefix_len(), *group));
        }
    }
    best.map_or(0, |(_, g)| g)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn matches_naive_longest_prefix(
        raw in proptest::collection::vec((any::<u32>(), 8u8..=32, 1u32..1000), 1..40),
        probes in proptest::collection::vec(any::<u32>(), 64),
    ) {
        let rules: Vec<(Ipv4Net, GroupId)> = raw
            .iter()
            .map(|&(a, len, g)| (Ipv4Net::new(Ipv4Addr::from(a), len).unwrap().trunc(), g))
            .collect();
        let arena = arena();
        let tree = SourceTree::from_prefixes(&rules).unwrap();
        let lpm = Lpm4Builder::new(&arena, "test.prop", 0).build(&tree).unwrap();

        // rule addresses and their neighbours exercise every boundary
        let mut addrs: Vec<u32> = probes;
        for &(a, _, _) in &raw {
            addrs.extend([a, a.wrapping_sub(1), a.wrapping_add(1), a | 0xff]);
        }
        for a in addrs {
            let addr = Ipv4Addr::from(a);
            prop_assert_eq!(lpm.lookup_ip(addr), naive(&rules, addr), "{}", addr);
        }
    }
}
