//! Double-buffered generations with epoch-based reclamation
//!
//! A `GenerationManager` owns a *current* instance that readers observe and
//! a *next* instance the control plane mutates. Publishing swaps a copy of
//! next into current; the previous current is retired through
//! `crossbeam-epoch`, so it is freed only after every reader that could
//! have seen it has unpinned.
//!
//! Writers are serialized by the next lock. Readers never block: they pin
//! the epoch and dereference whatever current is at that moment.

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned};
use log::{debug, trace};
use metrics::counter;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SwitchState {
    Idle = 0,
    NextLocked = 1,
    Switching = 2,
}

impl SwitchState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => SwitchState::NextLocked,
            2 => SwitchState::Switching,
            _ => SwitchState::Idle,
        }
    }
}

pub struct GenerationManager<T: Clone + Send + Sync + 'static> {
    current: Atomic<T>,
    next: Mutex<T>,
    /// Held shared by `current_lock`, exclusive during the swap.
    current_lock: RwLock<()>,
    state: AtomicU8,
    generation: AtomicU64,
}

impl<T: Clone + Send + Sync + 'static> GenerationManager<T> {
    /// Both instances start as copies of `value`.
    pub fn new(value: T) -> Self {
        Self::from_pair(value.clone(), value)
    }

    /// Build current and next independently with `init`.
    pub fn try_with_init<E>(mut init: impl FnMut() -> Result<T, E>) -> Result<Self, E> {
        let current = init()?;
        let next = init()?;
        Ok(Self::from_pair(current, next))
    }

    fn from_pair(current: T, next: T) -> Self {
        Self {
            current: Atomic::new(current),
            next: Mutex::new(next),
            current_lock: RwLock::new(()),
            state: AtomicU8::new(SwitchState::Idle as u8),
            generation: AtomicU64::new(0),
        }
    }

    /// Exclusive access to the next instance. Blocks other writers.
    pub fn next_lock(&self) -> NextGuard<'_, T> {
        let next = self.next.lock().unwrap_or_else(|p| p.into_inner());
        self.set_state(SwitchState::NextLocked);
        trace!("[GEN] next locked at generation {}", self.generation_id());
        NextGuard {
            manager: self,
            next,
            dirty: false,
        }
    }

    /// Lock-free view of current, valid while the snapshot is alive.
    pub fn snapshot(&self) -> Snapshot<'_, T> {
        let guard = epoch::pin();
        let ptr = self.current.load(Ordering::Acquire, &guard).as_raw();
        Snapshot {
            _guard: guard,
            ptr,
            _marker: PhantomData,
        }
    }

    /// View of current that also holds publication off until dropped.
    pub fn current_lock(&self) -> CurrentGuard<'_, T> {
        let read = self.current_lock.read().unwrap_or_else(|p| p.into_inner());
        CurrentGuard {
            snapshot: self.snapshot(),
            _read: read,
        }
    }

    pub fn current_clone(&self) -> T {
        (*self.snapshot()).clone()
    }

    pub fn state(&self) -> SwitchState {
        SwitchState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Number of publications so far.
    pub fn generation_id(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Lock next, apply `f`, publish on success and restore next on error.
    pub fn update<R, E>(&self, f: impl FnOnce(&mut T) -> Result<R, E>) -> Result<R, E> {
        let mut next = self.next_lock();
        match f(&mut *next) {
            Ok(r) => {
                next.switch_generation();
                Ok(r)
            }
            Err(e) => {
                next.abort();
                Err(e)
            }
        }
    }

    fn set_state(&self, s: SwitchState) {
        self.state.store(s as u8, Ordering::Release);
    }

    fn publish(&self, value: T, flush: bool) {
        self.set_state(SwitchState::Switching);
        {
            let _write = self.current_lock.write().unwrap_or_else(|p| p.into_inner());
            let guard = epoch::pin();
            let old = self.current.swap(Owned::new(value), Ordering::AcqRel, &guard);
            // SAFETY: `old` is unreachable from `current` now; readers pinned
            // before the swap keep it alive until they unpin.
            unsafe { guard.defer_destroy(old) };
            let id = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
            if flush {
                guard.flush();
            }
            debug!("[GEN] switched to generation {}", id);
        }
        counter!("fastplane_generation_switches_total").increment(1);
        self.set_state(SwitchState::NextLocked);
    }

    fn load_current_into(&self, next: &mut T) {
        let guard = epoch::pin();
        let cur = self.current.load(Ordering::Acquire, &guard);
        // SAFETY: current is never null after construction and stays alive
        // while `guard` is pinned.
        if let Some(cur) = unsafe { cur.as_ref() } {
            *next = cur.clone();
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Drop for GenerationManager<T> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` means no snapshot or guard borrows us.
        unsafe {
            let guard = epoch::unprotected();
            let cur = self.current.swap(epoch::Shared::null(), Ordering::AcqRel, guard);
            if !cur.is_null() {
                drop(cur.into_owned());
            }
        }
    }
}

impl<T: Clone + Send + Sync + std::fmt::Debug + 'static> std::fmt::Debug for GenerationManager<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationManager")
            .field("generation", &self.generation_id())
            .field("state", &self.state())
            .finish()
    }
}

/// Writer handle on the next instance.
///
/// Mutating through it marks next dirty; a dirty guard dropped without a
/// switch restores next from current.
pub struct NextGuard<'a, T: Clone + Send + Sync + 'static> {
    manager: &'a GenerationManager<T>,
    next: MutexGuard<'a, T>,
    dirty: bool,
}

impl<T: Clone + Send + Sync + 'static> NextGuard<'_, T> {
    /// Publish next and let the epoch collector reclaim the old current.
    pub fn switch_generation(&mut self) {
        self.manager.publish((*self.next).clone(), true);
        self.dirty = false;
    }

    /// Publish next without flushing the collector.
    ///
    /// Next stays in place as the following write target and already equals
    /// what was published, so further edits continue from it without a
    /// rebuild. The retired current is not handed back: readers may still
    /// hold it, and it is released whenever the collector next advances.
    pub fn switch_generation_without_gc(&mut self) {
        self.manager.publish((*self.next).clone(), false);
        self.dirty = false;
    }

    /// Discard pending edits: next becomes a copy of current again.
    pub fn abort(&mut self) {
        self.manager.load_current_into(&mut self.next);
        self.dirty = false;
        debug!("[GEN] pending edits discarded");
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

impl<T: Clone + Send + Sync + 'static> Deref for NextGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.next
    }
}

impl<T: Clone + Send + Sync + 'static> DerefMut for NextGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.dirty = true;
        &mut self.next
    }
}

impl<T: Clone + Send + Sync + 'static> Drop for NextGuard<'_, T> {
    fn drop(&mut self) {
        if self.dirty {
            self.abort();
        }
        self.manager.set_state(SwitchState::Idle);
    }
}

/// Pinned reference to a published instance.
pub struct Snapshot<'a, T> {
    _guard: Guard,
    ptr: *const T,
    _marker: PhantomData<&'a T>,
}

impl<T> Deref for Snapshot<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: `ptr` was loaded under `_guard`, which is still pinned, and
        // current is never null while the manager is borrowed.
        unsafe { &*self.ptr }
    }
}

pub struct CurrentGuard<'a, T> {
    snapshot: Snapshot<'a, T>,
    _read: RwLockReadGuard<'a, ()>,
}

impl<T> Deref for CurrentGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.snapshot
    }
}
