use fastplane_core::arena::{LimitGroup, MemoryArena};
use fastplane_core::config::ArenaConfig;
use fastplane_core::errors::AllocationError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};

fn arena_with(limits: LimitGroup) -> MemoryArena {
    MemoryArena::new(&ArenaConfig {
        sockets: vec![0, 1],
        limits,
        ..ArenaConfig::default()
    })
}

fn acl_limits() -> LimitGroup {
    LimitGroup::root(None).with_child(
        LimitGroup::new("acl", Some(10_000)).with_child(LimitGroup::new("acl.transport", Some(3_000))),
    )
}

#[test]
fn available_count_subtracts_other_names_only() {
    let arena = arena_with(acl_limits());
    let _a = arena.allocate("acl.total.ht", 0, 4_000).unwrap();

    // another member of the group sees the 4000 bytes as taken
    assert_eq!(arena.available_count::<u8>("acl.values", 0), Some(6_000));
    // the name itself would be replaced, so its own blocks do not count
    assert_eq!(arena.available_count::<u64>("acl.total.ht", 0), Some(10_000 / 8));
    // the tighter child wins
    assert_eq!(arena.available_count::<u8>("acl.transport.ht", 0), Some(3_000));
    // limits are per socket
    assert_eq!(arena.available_count::<u8>("acl.values", 1), Some(10_000));
    // outside every bounded group
    assert_eq!(arena.available_count::<u8>("neighbor.ht", 0), None);
}

#[test]
fn group_limit_rejects_oversized_allocation() {
    let arena = arena_with(acl_limits());
    let err = arena.allocate("acl.transport.ht", 0, 3_001).unwrap_err();
    assert!(matches!(err, AllocationError::Exhausted { available: 3_000, .. }));
    assert_eq!(arena.usage(0), 0);

    let _ok = arena.allocate("acl.transport.ht", 0, 3_000).unwrap();
    assert!(arena.allocate("acl.transport.ht", 0, 1).is_err());
    // unrelated names are not bound by the group
    assert!(arena.allocate("neighbor.ht", 0, 1 << 20).is_ok());
}

#[test]
fn concurrent_writers_share_one_group_ceiling() {
    let arena = arena_with(LimitGroup::root(None).with_child(LimitGroup::new("acl", Some(4 * 4_096))));
    let threads = num_cpus::get().clamp(4, 16);

    for _ in 0..20 {
        let barrier = Arc::new(Barrier::new(threads));
        let handles: Vec<_> = (0..threads)
            .map(|i| {
                let arena = arena.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let name = if i % 2 == 0 { "acl.total.ht" } else { "acl.transport.ht" };
                    barrier.wait();
                    arena.allocate(name, 0, 4_096).ok()
                })
            })
            .collect();
        let granted: Vec<_> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(granted.len(), 4);
        assert_eq!(arena.usage(0), 4 * 4_096);
        drop(granted);
        assert_eq!(arena.usage(0), 0);
    }
}

#[test]
fn socket_capacity_is_enforced_and_adjustable() {
    let arena = arena_with(LimitGroup::root(None));
    arena.set_socket_capacity(0, Some(8_192)).unwrap();
    let a = arena.allocate("x", 0, 8_000).unwrap();
    assert!(matches!(
        arena.allocate("y", 0, 500),
        Err(AllocationError::Exhausted { socket_id: 0, .. })
    ));
    // the other socket has its own pool
    assert!(arena.allocate("y", 1, 500).is_ok());

    arena.release(a);
    assert!(arena.allocate("y", 0, 500).is_ok());

    arena.set_socket_capacity(0, None).unwrap();
    assert!(arena.allocate("z", 0, 1 << 20).is_ok());
    assert!(arena.set_socket_capacity(7, None).is_err());
}

#[test]
fn bad_requests_are_rejected() {
    let arena = arena_with(LimitGroup::root(None));
    assert_eq!(
        arena.allocate("x", 9, 64).unwrap_err(),
        AllocationError::UnknownSocket(9)
    );
    assert!(matches!(
        arena.allocate("x", 0, 0).unwrap_err(),
        AllocationError::ZeroSize(_)
    ));
}

#[test]
fn release_callback_runs_once_on_drop() {
    let arena = arena_with(LimitGroup::root(None));
    let released = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&released);
    let block = arena
        .allocate_with_release("cb", 0, 128, move || flag.store(true, Ordering::SeqCst))
        .unwrap();
    assert_eq!(block.len(), 128);
    assert!(block.as_slice().iter().all(|&b| b == 0));
    assert!(!released.load(Ordering::SeqCst));
    drop(block);
    assert!(released.load(Ordering::SeqCst));
    assert_eq!(arena.usage(0), 0);
}

#[test]
fn typed_slices_construct_and_destroy_elements() {
    let arena = arena_with(LimitGroup::root(None));
    let shared = Arc::new(());
    {
        let slice = arena
            .create_slice_with("objs", 1, 100, |_| Arc::clone(&shared))
            .unwrap();
        assert_eq!(slice.len(), 100);
        assert_eq!(Arc::strong_count(&shared), 101);
        assert_eq!(slice.socket_id(), Some(1));
    }
    assert_eq!(Arc::strong_count(&shared), 1);
    assert_eq!(arena.usage(1), 0);

    let mut zeroed = arena.create_zeroed_slice::<u32>("ints", 0, 1_000).unwrap();
    assert!(zeroed.iter().all(|&v| v == 0));
    zeroed[999] = 7;
    assert_eq!(zeroed[999], 7);
}

#[test]
fn report_groups_by_name_and_socket() {
    let arena = arena_with(LimitGroup::root(None));
    let _a = arena.allocate("b.table", 1, 10).unwrap();
    let _b = arena.allocate("a.table", 0, 20).unwrap();
    let _c = arena.allocate("a.table", 0, 30).unwrap();
    let report = arena.report();
    assert_eq!(report.len(), 2);
    assert_eq!(report[0].name, "a.table");
    assert_eq!((report[0].bytes, report[0].blocks), (50, 2));
    assert_eq!((report[1].socket_id, report[1].bytes), (1, 10));
    arena.debug(0);
}

#[test]
fn update_limits_applies_to_new_allocations() {
    let arena = arena_with(LimitGroup::root(None));
    let _a = arena.allocate("acl.total.ht", 0, 5_000).unwrap();
    arena.update_limits(LimitGroup::root(Some(6_000)));
    assert_eq!(arena.group_available("anything", 0), Some(1_000));
    assert!(arena.allocate("acl.values", 0, 2_000).is_err());
    assert!(arena.allocate("acl.values", 0, 1_000).is_ok());
}
