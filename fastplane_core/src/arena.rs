//! NUMA-aware memory arena
//!
//! Every block is a private anonymous mapping, optionally bound to the NUMA
//! node of its socket. The arena keeps a registry of live blocks keyed by
//! address, so usage can be reported per name and per socket, and enforces
//! two kinds of bounds:
//!
//! * a per-socket pool capacity (`set_socket_capacity`), and
//! * a tree of named [`LimitGroup`]s, evaluated per socket.
//!
//! Blocks release themselves on drop. A block may carry a release callback
//! that runs right before the memory is returned.

use crate::config::ArenaConfig;
use crate::constants::PAGE_SIZE;
use crate::errors::AllocationError;
use crate::helpers::align_up;
use crate::platform;
use crate::types::{SocketId, Zeroable};
use log::{debug, error, info, warn};
use metrics::{counter, gauge};
use std::collections::{BTreeMap, HashMap};
use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard};

/// Named allocation budget. A group covers allocation `N` when `N` equals the
/// group name or starts with `name.`; the unnamed root covers everything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitGroup {
    pub name: String,
    /// Bytes allowed per socket for everything the group covers.
    pub limit: Option<u64>,
    pub children: Vec<LimitGroup>,
}

impl LimitGroup {
    pub fn root(limit: Option<u64>) -> Self {
        Self {
            name: String::new(),
            limit,
            children: Vec::new(),
        }
    }

    pub fn new(name: impl Into<String>, limit: Option<u64>) -> Self {
        Self {
            name: name.into(),
            limit,
            children: Vec::new(),
        }
    }

    pub fn with_child(mut self, child: LimitGroup) -> Self {
        self.children.push(child);
        self
    }

    pub fn covers(&self, name: &str) -> bool {
        if self.name.is_empty() || self.name == name {
            return true;
        }
        name.strip_prefix(self.name.as_str())
            .is_some_and(|rest| rest.starts_with('.'))
    }
}

/// Aggregated usage of one allocation name on one socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryUsage {
    pub name: String,
    pub socket_id: SocketId,
    pub bytes: u64,
    pub blocks: u64,
}

#[derive(Debug, Clone)]
struct BlockRecord {
    name: String,
    socket_id: SocketId,
    size: u64,
}

#[derive(Debug, Default)]
struct SocketPool {
    capacity: Option<u64>,
    used: u64,
}

#[derive(Debug)]
struct ArenaState {
    sockets: BTreeMap<SocketId, SocketPool>,
    blocks: HashMap<usize, BlockRecord>,
    /// Granted but not yet mapped, keyed by reservation ticket.
    reserved: HashMap<u64, BlockRecord>,
    next_ticket: u64,
    limits: LimitGroup,
}

impl ArenaState {
    /// Live and reserved blocks; both count against limits.
    fn records(&self) -> impl Iterator<Item = &BlockRecord> {
        self.blocks.values().chain(self.reserved.values())
    }

    /// Bytes still grantable to `name` on `socket_id` under the limit tree.
    fn group_headroom(&self, name: &str, socket_id: SocketId) -> Option<u64> {
        let mut best: Option<u64> = None;
        self.walk_groups(&self.limits, name, socket_id, &mut best, true);
        best
    }

    fn walk_groups(
        &self,
        group: &LimitGroup,
        name: &str,
        socket_id: SocketId,
        best: &mut Option<u64>,
        count_self: bool,
    ) {
        if !group.covers(name) {
            return;
        }
        if let Some(limit) = group.limit {
            let used: u64 = self
                .records()
                .filter(|b| b.socket_id == socket_id && group.covers(&b.name))
                .filter(|b| count_self || b.name != name)
                .map(|b| b.size)
                .sum();
            let room = limit.saturating_sub(used);
            *best = Some(best.map_or(room, |b| b.min(room)));
        }
        for child in &group.children {
            self.walk_groups(child, name, socket_id, best, count_self);
        }
    }

    fn headroom(&self, name: &str, socket_id: SocketId, count_self: bool) -> Option<u64> {
        let pool = self.sockets.get(&socket_id)?;
        let mut best = pool.capacity.map(|cap| {
            let own: u64 = if count_self {
                0
            } else {
                self.records()
                    .filter(|b| b.socket_id == socket_id && b.name == name)
                    .map(|b| b.size)
                    .sum()
            };
            cap.saturating_sub(pool.used - own)
        });
        let mut groups = None;
        self.walk_groups(&self.limits, name, socket_id, &mut groups, count_self);
        if let Some(g) = groups {
            best = Some(best.map_or(g, |b| b.min(g)));
        }
        best
    }
}

struct ArenaInner {
    numa_bind: bool,
    populate: bool,
    state: Mutex<ArenaState>,
}

impl ArenaInner {
    fn state(&self) -> MutexGuard<'_, ArenaState> {
        // registry stays consistent even if a holder panicked
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn forget(&self, addr: usize) {
        let mut st = self.state();
        if let Some(rec) = st.blocks.remove(&addr) {
            if let Some(pool) = st.sockets.get_mut(&rec.socket_id) {
                pool.used = pool.used.saturating_sub(rec.size);
                gauge!("fastplane_arena_bytes", "socket" => rec.socket_id.to_string())
                    .set(pool.used as f64);
            }
            debug!(
                "[ARENA] free name={} socket={} size={}",
                rec.name, rec.socket_id, rec.size
            );
        }
    }
}

#[derive(Clone)]
pub struct MemoryArena {
    inner: Arc<ArenaInner>,
}

impl std::fmt::Debug for MemoryArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.inner.state();
        f.debug_struct("MemoryArena")
            .field("numa_bind", &self.inner.numa_bind)
            .field("sockets", &st.sockets.keys().collect::<Vec<_>>())
            .field("blocks", &st.blocks.len())
            .finish()
    }
}

impl MemoryArena {
    pub fn new(config: &ArenaConfig) -> Self {
        let sockets = config
            .sockets
            .iter()
            .map(|&s| {
                (
                    s,
                    SocketPool {
                        capacity: config.socket_capacity,
                        used: 0,
                    },
                )
            })
            .collect();
        info!(
            "[ARENA] sockets={:?} numa_bind={} capacity={:?}",
            config.sockets, config.numa_bind, config.socket_capacity
        );
        Self {
            inner: Arc::new(ArenaInner {
                numa_bind: config.numa_bind,
                populate: config.populate,
                state: Mutex::new(ArenaState {
                    sockets,
                    blocks: HashMap::new(),
                    reserved: HashMap::new(),
                    next_ticket: 0,
                    limits: config.limits.clone(),
                }),
            }),
        }
    }

    pub fn sockets(&self) -> Vec<SocketId> {
        self.inner.state().sockets.keys().copied().collect()
    }

    pub fn allocate(
        &self,
        name: &str,
        socket_id: SocketId,
        size: usize,
    ) -> Result<MemoryBlock, AllocationError> {
        self.allocate_inner(name, socket_id, size, None)
    }

    /// Like `allocate`, with `release` run when the block is returned.
    pub fn allocate_with_release(
        &self,
        name: &str,
        socket_id: SocketId,
        size: usize,
        release: impl FnOnce() + Send + 'static,
    ) -> Result<MemoryBlock, AllocationError> {
        self.allocate_inner(name, socket_id, size, Some(Box::new(release)))
    }

    fn allocate_inner(
        &self,
        name: &str,
        socket_id: SocketId,
        size: usize,
        release: Option<Box<dyn FnOnce() + Send>>,
    ) -> Result<MemoryBlock, AllocationError> {
        if size == 0 {
            return Err(AllocationError::ZeroSize(name.to_string()));
        }
        let requested = size as u64;

        // reserve under the lock, map outside of it
        let ticket = {
            let mut st = self.inner.state();
            if !st.sockets.contains_key(&socket_id) {
                return Err(AllocationError::UnknownSocket(socket_id));
            }
            if let Some(available) = st.headroom(name, socket_id, true) {
                if requested > available {
                    drop(st);
                    counter!("fastplane_arena_failures_total").increment(1);
                    error!(
                        "[ARENA] exhausted name={} socket={} requested={} available={}",
                        name, socket_id, requested, available
                    );
                    self.debug(socket_id);
                    return Err(AllocationError::Exhausted {
                        name: name.to_string(),
                        socket_id,
                        requested,
                        available,
                    });
                }
            }
            if let Some(pool) = st.sockets.get_mut(&socket_id) {
                pool.used += requested;
            }
            let ticket = st.next_ticket;
            st.next_ticket += 1;
            st.reserved.insert(
                ticket,
                BlockRecord {
                    name: name.to_string(),
                    socket_id,
                    size: requested,
                },
            );
            ticket
        };

        let mapped = align_up(size, PAGE_SIZE);
        let ptr = match platform::map_anonymous(mapped, self.inner.populate) {
            Ok(p) => p,
            Err(reason) => {
                self.unreserve(ticket);
                counter!("fastplane_arena_failures_total").increment(1);
                error!("[ARENA] map failed name={} size={}: {}", name, size, reason);
                self.debug(socket_id);
                return Err(AllocationError::Map {
                    name: name.to_string(),
                    size: requested,
                    reason,
                });
            }
        };

        if self.inner.numa_bind {
            if let Err(reason) = platform::bind_to_node(ptr, mapped, socket_id) {
                unsafe { platform::unmap(ptr, mapped) };
                self.unreserve(ticket);
                counter!("fastplane_arena_failures_total").increment(1);
                error!(
                    "[ARENA] bind failed name={} socket={}: {}",
                    name, socket_id, reason
                );
                return Err(AllocationError::NumaBind {
                    name: name.to_string(),
                    socket_id,
                    reason,
                });
            }
        }

        let used = {
            let mut st = self.inner.state();
            if let Some(rec) = st.reserved.remove(&ticket) {
                st.blocks.insert(ptr.as_ptr() as usize, rec);
            }
            st.sockets.get(&socket_id).map_or(0, |p| p.used)
        };
        counter!("fastplane_arena_allocations_total").increment(1);
        gauge!("fastplane_arena_bytes", "socket" => socket_id.to_string()).set(used as f64);
        debug!(
            "[ARENA] alloc name={} socket={} size={} addr={:p}",
            name, socket_id, size, ptr
        );

        Ok(MemoryBlock {
            ptr,
            size,
            mapped,
            socket_id,
            name: name.to_string(),
            arena: Arc::clone(&self.inner),
            release,
        })
    }

    fn unreserve(&self, ticket: u64) {
        let mut st = self.inner.state();
        if let Some(rec) = st.reserved.remove(&ticket) {
            if let Some(pool) = st.sockets.get_mut(&rec.socket_id) {
                pool.used = pool.used.saturating_sub(rec.size);
            }
        }
    }

    /// Return a block now instead of at end of scope.
    pub fn release(&self, block: MemoryBlock) {
        drop(block);
    }

    /// Slice of `len` zero-valued elements.
    pub fn create_zeroed_slice<T: Zeroable>(
        &self,
        name: &str,
        socket_id: SocketId,
        len: usize,
    ) -> Result<ArenaSlice<T>, AllocationError> {
        let block = self.slice_block::<T>(name, socket_id, len)?;
        Ok(ArenaSlice {
            block,
            len,
            _marker: PhantomData,
        })
    }

    /// Slice whose elements are built by `init(index)`; dropped with the slice.
    pub fn create_slice_with<T: Send + Sync>(
        &self,
        name: &str,
        socket_id: SocketId,
        len: usize,
        mut init: impl FnMut(usize) -> T,
    ) -> Result<ArenaSlice<T>, AllocationError> {
        let block = self.slice_block::<T>(name, socket_id, len)?;
        if let Some(b) = &block {
            let base = b.ptr.as_ptr() as *mut T;
            for i in 0..len {
                unsafe { base.add(i).write(init(i)) };
            }
        }
        Ok(ArenaSlice {
            block,
            len,
            _marker: PhantomData,
        })
    }

    fn slice_block<T>(
        &self,
        name: &str,
        socket_id: SocketId,
        len: usize,
    ) -> Result<Option<MemoryBlock>, AllocationError> {
        debug_assert!(align_of::<T>() <= PAGE_SIZE);
        let bytes = len
            .checked_mul(size_of::<T>())
            .ok_or_else(|| AllocationError::Map {
                name: name.to_string(),
                size: u64::MAX,
                reason: "size overflow".into(),
            })?;
        if len == 0 {
            // empty slices still validate the socket
            if !self.inner.state().sockets.contains_key(&socket_id) {
                return Err(AllocationError::UnknownSocket(socket_id));
            }
            return Ok(None);
        }
        self.allocate(name, socket_id, bytes).map(Some)
    }

    /// How many `T` a fresh allocation named `name` could hold on
    /// `socket_id`, assuming it replaces every live block of the same name.
    /// `None` means unbounded.
    pub fn available_count<T>(&self, name: &str, socket_id: SocketId) -> Option<usize> {
        let st = self.inner.state();
        st.headroom(name, socket_id, false)
            .map(|bytes| (bytes / size_of::<T>().max(1) as u64) as usize)
    }

    /// Bytes the limit tree still grants to `name` on `socket_id`.
    pub fn group_available(&self, name: &str, socket_id: SocketId) -> Option<u64> {
        self.inner.state().group_headroom(name, socket_id)
    }

    pub fn set_socket_capacity(
        &self,
        socket_id: SocketId,
        capacity: Option<u64>,
    ) -> Result<(), AllocationError> {
        let mut st = self.inner.state();
        let pool = st
            .sockets
            .get_mut(&socket_id)
            .ok_or(AllocationError::UnknownSocket(socket_id))?;
        if let Some(cap) = capacity {
            if cap < pool.used {
                warn!(
                    "[ARENA] socket {} capacity {} is below current usage {}",
                    socket_id, cap, pool.used
                );
            }
        }
        pool.capacity = capacity;
        info!("[ARENA] socket {} capacity={:?}", socket_id, capacity);
        Ok(())
    }

    /// Replace the limit tree. Live blocks are kept even if they now exceed it.
    pub fn update_limits(&self, limits: LimitGroup) {
        info!("[ARENA] limit tree replaced");
        self.inner.state().limits = limits;
    }

    pub fn usage(&self, socket_id: SocketId) -> u64 {
        self.inner
            .state()
            .sockets
            .get(&socket_id)
            .map_or(0, |p| p.used)
    }

    pub fn capacity(&self, socket_id: SocketId) -> Option<u64> {
        self.inner
            .state()
            .sockets
            .get(&socket_id)
            .and_then(|p| p.capacity)
    }

    /// Live usage grouped by `(name, socket)`, sorted.
    pub fn report(&self) -> Vec<MemoryUsage> {
        let st = self.inner.state();
        let mut agg: BTreeMap<(String, SocketId), (u64, u64)> = BTreeMap::new();
        for rec in st.blocks.values() {
            let e = agg.entry((rec.name.clone(), rec.socket_id)).or_default();
            e.0 += rec.size;
            e.1 += 1;
        }
        agg.into_iter()
            .map(|((name, socket_id), (bytes, blocks))| MemoryUsage {
                name,
                socket_id,
                bytes,
                blocks,
            })
            .collect()
    }

    /// Log every outstanding allocation on `socket_id`.
    pub fn debug(&self, socket_id: SocketId) {
        let rows: Vec<MemoryUsage> = self
            .report()
            .into_iter()
            .filter(|u| u.socket_id == socket_id)
            .collect();
        let (used, cap) = {
            let st = self.inner.state();
            st.sockets
                .get(&socket_id)
                .map_or((0, None), |p| (p.used, p.capacity))
        };
        info!(
            "[ARENA] socket {} used={} capacity={:?} names={}",
            socket_id,
            used,
            cap,
            rows.len()
        );
        for u in rows {
            info!("[ARENA]   {} bytes={} blocks={}", u.name, u.bytes, u.blocks);
        }
    }
}

/// One arena allocation. Returned to the arena on drop.
pub struct MemoryBlock {
    ptr: NonNull<u8>,
    size: usize,
    mapped: usize,
    socket_id: SocketId,
    name: String,
    arena: Arc<ArenaInner>,
    release: Option<Box<dyn FnOnce() + Send>>,
}

// The block owns its mapping exclusively; the release callback is only
// touched from `drop`.
unsafe impl Send for MemoryBlock {}
unsafe impl Sync for MemoryBlock {}

impl MemoryBlock {
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn socket_id(&self) -> SocketId {
        self.socket_id
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) }
    }
}

impl std::fmt::Debug for MemoryBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBlock")
            .field("name", &self.name)
            .field("socket_id", &self.socket_id)
            .field("size", &self.size)
            .finish()
    }
}

impl Drop for MemoryBlock {
    fn drop(&mut self) {
        if let Some(cb) = self.release.take() {
            cb();
        }
        self.arena.forget(self.ptr.as_ptr() as usize);
        unsafe { platform::unmap(self.ptr, self.mapped) };
    }
}

/// Typed view over an arena block.
pub struct ArenaSlice<T> {
    block: Option<MemoryBlock>,
    len: usize,
    _marker: PhantomData<T>,
}

unsafe impl<T: Send> Send for ArenaSlice<T> {}
unsafe impl<T: Sync> Sync for ArenaSlice<T> {}

impl<T> ArenaSlice<T> {
    pub fn socket_id(&self) -> Option<SocketId> {
        self.block.as_ref().map(|b| b.socket_id)
    }

    pub fn name(&self) -> Option<&str> {
        self.block.as_ref().map(|b| b.name())
    }

    pub fn bytes(&self) -> usize {
        self.len * size_of::<T>()
    }
}

impl<T> Deref for ArenaSlice<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        match &self.block {
            Some(b) => unsafe { std::slice::from_raw_parts(b.ptr.as_ptr() as *const T, self.len) },
            None => &[],
        }
    }
}

impl<T> DerefMut for ArenaSlice<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        match &self.block {
            Some(b) => unsafe { std::slice::from_raw_parts_mut(b.ptr.as_ptr() as *mut T, self.len) },
            None => &mut [],
        }
    }
}

impl<T> Drop for ArenaSlice<T> {
    fn drop(&mut self) {
        if std::mem::needs_drop::<T>() {
            unsafe { std::ptr::drop_in_place(self.deref_mut() as *mut [T]) };
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for ArenaSlice<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArenaSlice")
            .field("name", &self.name())
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena() -> MemoryArena {
        MemoryArena::new(&ArenaConfig {
            sockets: vec![0, 1],
            ..ArenaConfig::default()
        })
    }

    #[test]
    fn group_membership_is_dot_separated() {
        let g = LimitGroup::new("acl", None);
        assert!(g.covers("acl"));
        assert!(g.covers("acl.total.ht"));
        assert!(!g.covers("aclx"));
        assert!(LimitGroup::root(None).covers("anything"));
    }

    #[test]
    fn registry_tracks_blocks() {
        let a = arena();
        let b1 = a.allocate("t.a", 0, 100).unwrap();
        let _b2 = a.allocate("t.a", 0, 50).unwrap();
        let _b3 = a.allocate("t.b", 1, 10).unwrap();
        assert_eq!(a.usage(0), 150);
        assert_eq!(a.usage(1), 10);
        let rep = a.report();
        assert_eq!(rep[0], MemoryUsage { name: "t.a".into(), socket_id: 0, bytes: 150, blocks: 2 });
        a.release(b1);
        assert_eq!(a.usage(0), 50);
    }

    #[test]
    fn empty_slice_needs_no_block() {
        let a = arena();
        let s: ArenaSlice<u64> = a.create_zeroed_slice("empty", 0, 0).unwrap();
        assert!(s.is_empty());
        assert_eq!(a.usage(0), 0);
        assert!(a.create_zeroed_slice::<u64>("empty", 9, 0).is_err());
    }
}
