use fastplane_core::generation::{GenerationManager, SwitchState};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

#[test]
fn reader_finishes_on_the_generation_it_started_with() {
    let gm = GenerationManager::new(vec![1u64; 64]);
    let before = gm.snapshot();

    {
        let mut next = gm.next_lock();
        next.iter_mut().for_each(|v| *v = 2);
        next.switch_generation();
    }

    // the old reader still sees only generation-1 data
    assert!(before.iter().all(|&v| v == 1));
    assert!(gm.snapshot().iter().all(|&v| v == 2));
    drop(before);
    assert_eq!(gm.generation_id(), 1);
}

#[test]
fn dropped_dirty_guard_restores_next() {
    let gm = GenerationManager::new(vec![1u32, 2, 3]);
    {
        let mut next = gm.next_lock();
        next.push(4);
        assert!(next.is_dirty());
        // dropped without switching
    }
    assert_eq!(gm.state(), SwitchState::Idle);
    let next = gm.next_lock();
    assert_eq!(*next, vec![1, 2, 3]);
    assert_eq!(*gm.snapshot(), vec![1, 2, 3]);
    assert_eq!(gm.generation_id(), 0);
}

#[test]
fn update_publishes_on_ok_and_aborts_on_err() {
    let gm = GenerationManager::new(10u32);
    let r: Result<(), &str> = gm.update(|v| {
        *v = 99;
        Err("boom")
    });
    assert!(r.is_err());
    assert_eq!(*gm.snapshot(), 10);
    assert_eq!(*gm.next_lock(), 10);

    gm.update(|v| {
        *v += 1;
        Ok::<(), ()>(())
    })
    .unwrap();
    assert_eq!(*gm.snapshot(), 11);
    assert_eq!(gm.current_clone(), 11);
}

#[test]
fn switch_without_gc_publishes_too() {
    let gm = GenerationManager::new(String::from("a"));
    {
        let mut next = gm.next_lock();
        next.push('b');
        next.switch_generation_without_gc();
    }
    assert_eq!(&*gm.snapshot(), "ab");
}

#[test]
fn switch_without_gc_keeps_next_as_the_write_target() {
    let gm = GenerationManager::new(vec![1u32]);
    let held = gm.snapshot();

    let mut next = gm.next_lock();
    next.push(2);
    next.switch_generation_without_gc();
    assert!(!next.is_dirty());
    // next already matches the published instance
    assert_eq!(*next, vec![1, 2]);
    next.push(3);
    next.switch_generation_without_gc();
    drop(next);

    assert_eq!(*gm.snapshot(), vec![1, 2, 3]);
    assert_eq!(gm.generation_id(), 2);
    // the retired instance stays readable for a reader that pinned it
    assert_eq!(*held, vec![1]);
}

#[test]
fn init_runs_once_per_instance() {
    let calls = AtomicUsize::new(0);
    let gm = GenerationManager::try_with_init(|| {
        Ok::<_, ()>(calls.fetch_add(1, Ordering::SeqCst))
    })
    .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(*gm.snapshot(), 0);
    assert_eq!(*gm.next_lock(), 1);

    let err = GenerationManager::<u32>::try_with_init(|| Err("no memory"));
    assert!(err.is_err());
}

#[test]
fn current_lock_holds_off_a_switch() {
    let gm = Arc::new(GenerationManager::new(0u32));
    let guard = gm.current_lock();
    let writer = {
        let gm = Arc::clone(&gm);
        thread::spawn(move || {
            let mut next = gm.next_lock();
            *next = 1;
            next.switch_generation();
        })
    };
    thread::sleep(Duration::from_millis(50));
    assert_eq!(gm.generation_id(), 0);
    assert_eq!(*guard, 0);
    drop(guard);
    writer.join().unwrap();
    assert_eq!(*gm.snapshot(), 1);
}

#[test]
fn concurrent_readers_never_see_a_torn_generation() {
    let gm = Arc::new(GenerationManager::new(vec![0u64; 256]));
    let readers = num_cpus::get().clamp(2, 8);
    let stop = Arc::new(AtomicBool::new(false));
    let start = Arc::new(Barrier::new(readers + 1));

    let handles: Vec<_> = (0..readers)
        .map(|_| {
            let gm = Arc::clone(&gm);
            let stop = Arc::clone(&stop);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                let mut reads = 0u64;
                while !stop.load(Ordering::Relaxed) {
                    let snap = gm.snapshot();
                    let first = snap[0];
                    assert!(snap.iter().all(|&v| v == first), "torn read");
                    reads += 1;
                }
                reads
            })
        })
        .collect();

    start.wait();
    for g in 1..=200u64 {
        let mut next = gm.next_lock();
        next.iter_mut().for_each(|v| *v = g);
        next.switch_generation();
    }
    stop.store(true, Ordering::Relaxed);

    for h in handles {
        assert!(h.join().unwrap() > 0);
    }
    assert_eq!(gm.generation_id(), 200);
    assert!(gm.snapshot().iter().all(|&v| v == 200));
}
