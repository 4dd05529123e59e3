//! Neighbor (L3 -> L2) resolution module
//!
//! Entries live in a `BTreeMap` inside the generation; every write rebuilds
//! the per-socket lookup tables from it and switches once. All writers
//! (operator commands, link-layer learns, resolution sweeps) go through the
//! same generation lock.
//!
//! Entry lifecycle:
//!
//! ```text
//! Unresolved --sweep--> Resolving --learn--> Resolved(dynamic)
//!      ^                    |
//!      +----probe failed----+
//! insert --> Resolved(static)   (only `remove` or `update_interfaces` drop it)
//! ```

use crate::arena::MemoryArena;
use crate::config::NeighborConfig;
use crate::constants::{NEIGHBOR_FLAG_IPV6, NEIGHBOR_FLAG_STATIC};
use crate::errors::{Error, Result};
use crate::generation::{GenerationManager, NextGuard};
use crate::hashtable::{HashTable, HashTableBuilder};
use crate::helpers::{bytes_to_ip, ip_to_bytes};
use crate::resolver::Resolver;
use crate::types::{InterfaceId, LimitItem, MacAddress, SocketId, Zeroable};
use crossbeam_queue::SegQueue;
use dashmap::DashMap;
use log::{debug, error, info, warn};
use metrics::counter;
use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

pub const TABLE_NEIGHBOR: &str = "neighbor.ht";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(C)]
pub struct NeighborKey {
    pub interface_id: InterfaceId,
    /// Address family bit.
    pub flags: u16,
    pub address: [u8; 16],
}

unsafe impl Zeroable for NeighborKey {}

impl NeighborKey {
    pub fn new(interface_id: InterfaceId, address: IpAddr) -> Self {
        Self {
            interface_id,
            flags: family_flag(address),
            address: ip_to_bytes(address),
        }
    }

    pub fn ip(&self) -> IpAddr {
        bytes_to_ip(self.address, self.flags & NEIGHBOR_FLAG_IPV6 != 0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct NeighborValue {
    pub mac: MacAddress,
    pub flags: u16,
    /// Seconds since the module started.
    pub last_update: u32,
}

unsafe impl Zeroable for NeighborValue {}

impl NeighborValue {
    pub fn is_static(&self) -> bool {
        self.flags & NEIGHBOR_FLAG_STATIC != 0
    }
}

fn family_flag(address: IpAddr) -> u16 {
    if address.is_ipv6() {
        NEIGHBOR_FLAG_IPV6
    } else {
        0
    }
}

pub type NeighborTable = HashTable<NeighborKey, NeighborValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeighborState {
    Unresolved,
    Resolving,
    ResolvedDynamic,
    ResolvedStatic,
}

/// Interface ids known to the module, with their route and interface names.
#[derive(Debug, Clone, Default)]
pub struct InterfaceMap {
    by_id: BTreeMap<InterfaceId, (String, String)>,
}

impl InterfaceMap {
    pub fn find(&self, route_name: &str, interface_name: &str) -> Option<InterfaceId> {
        self.by_id
            .iter()
            .find(|(_, (r, i))| r == route_name && i == interface_name)
            .map(|(id, _)| *id)
    }

    pub fn find_by_interface(&self, interface_name: &str) -> Option<InterfaceId> {
        self.by_id
            .iter()
            .find(|(_, (_, i))| i == interface_name)
            .map(|(id, _)| *id)
    }

    pub fn names(&self, id: InterfaceId) -> Option<(&str, &str)> {
        self.by_id.get(&id).map(|(r, i)| (r.as_str(), i.as_str()))
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct NeighborGeneration {
    interfaces: InterfaceMap,
    entries: BTreeMap<NeighborKey, NeighborValue>,
    tables: BTreeMap<SocketId, Arc<NeighborTable>>,
}

impl NeighborGeneration {
    pub fn table(&self, socket_id: SocketId) -> Option<&Arc<NeighborTable>> {
        self.tables.get(&socket_id)
    }

    pub fn interfaces(&self) -> &InterfaceMap {
        &self.interfaces
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NeighborQuery {
    pub route_name: Option<String>,
    pub interface_name: Option<String>,
    pub address: Option<IpAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborRow {
    pub route_name: String,
    pub interface_name: String,
    pub address: IpAddr,
    pub mac_address: MacAddress,
    /// Time since the last update; static entries have none.
    pub age: Option<Duration>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NeighborStats {
    pub hashtable_insert_success: u64,
    pub hashtable_insert_error: u64,
    pub hashtable_remove_success: u64,
    pub hashtable_remove_error: u64,
    pub netlink_neighbor_update: u64,
    pub resolve: u64,
}

#[derive(Debug, Default)]
struct Counters {
    insert_success: AtomicU64,
    insert_error: AtomicU64,
    remove_success: AtomicU64,
    remove_error: AtomicU64,
    netlink_neighbor_update: AtomicU64,
    resolve: AtomicU64,
}

impl Counters {
    fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

#[derive(Debug)]
struct Learned {
    interface_name: String,
    address: IpAddr,
    mac: MacAddress,
}

/// Outcome of one resolution sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub learned: usize,
    pub attempted: usize,
    pub failed: usize,
}

pub struct NeighborModule {
    arena: MemoryArena,
    config: NeighborConfig,
    generation: GenerationManager<NeighborGeneration>,
    /// One marker per distinct missed key, drained by `sweep`.
    pending: DashMap<NeighborKey, ()>,
    learned: SegQueue<Learned>,
    /// Probes sent and not yet answered, with the send time.
    inflight: DashMap<NeighborKey, Instant>,
    counters: Counters,
    started: Instant,
}

impl NeighborModule {
    pub fn new(arena: MemoryArena, config: NeighborConfig) -> Self {
        Self {
            arena,
            config,
            generation: GenerationManager::new(NeighborGeneration::default()),
            pending: DashMap::new(),
            learned: SegQueue::new(),
            inflight: DashMap::new(),
            counters: Counters::default(),
            started: Instant::now(),
        }
    }

    fn now(&self) -> u32 {
        self.started.elapsed().as_secs().min(u32::MAX as u64) as u32
    }

    pub fn generation_id(&self) -> u64 {
        self.generation.generation_id()
    }

    fn rebuild_tables(&self, next: &mut NeighborGeneration) -> Result<()> {
        let entries: Vec<(NeighborKey, NeighborValue)> =
            next.entries.iter().map(|(k, v)| (*k, *v)).collect();
        for socket_id in self.arena.sockets() {
            let table = HashTableBuilder::new(&self.arena, TABLE_NEIGHBOR, socket_id)
                .chunk_size(self.config.chunk_size)
                .limits(self.config.tables)
                .build(&entries)?;
            next.tables.insert(socket_id, Arc::new(table));
        }
        Ok(())
    }

    /// Rebuild and switch a dirty next, or discard it on failure.
    fn commit(&self, next: &mut NextGuard<'_, NeighborGeneration>, changed: u64) -> Result<()> {
        match self.rebuild_tables(next) {
            Ok(()) => {
                next.switch_generation();
                Counters::add(&self.counters.insert_success, changed);
                Ok(())
            }
            Err(e) => {
                next.abort();
                Counters::add(&self.counters.insert_error, changed.max(1));
                error!("[NEIGH] table rebuild failed, current generation kept: {}", e);
                Err(e)
            }
        }
    }

    fn unknown_interface(route_name: &str, interface_name: &str) -> Error {
        Error::InvalidReference(format!("unknown interface {route_name}:{interface_name}"))
    }

    // ---- operator commands ------------------------------------------------

    pub fn show(&self, query: &NeighborQuery) -> Vec<NeighborRow> {
        let current = self.generation.current_lock();
        let now = self.now();
        let mut rows = Vec::new();
        for (key, value) in &current.entries {
            let Some((route, iface)) = current.interfaces.names(key.interface_id) else {
                continue;
            };
            let address = key.ip();
            if query.route_name.as_deref().is_some_and(|r| r != route)
                || query.interface_name.as_deref().is_some_and(|i| i != iface)
                || query.address.is_some_and(|a| a != address)
            {
                continue;
            }
            rows.push(NeighborRow {
                route_name: route.to_string(),
                interface_name: iface.to_string(),
                address,
                mac_address: value.mac,
                age: (!value.is_static())
                    .then(|| Duration::from_secs(now.saturating_sub(value.last_update) as u64)),
            });
        }
        rows
    }

    /// Add or replace a static entry.
    pub fn insert(
        &self,
        route_name: &str,
        interface_name: &str,
        address: IpAddr,
        mac: MacAddress,
    ) -> Result<()> {
        let mut next = self.generation.next_lock();
        let id = next
            .interfaces
            .find(route_name, interface_name)
            .ok_or_else(|| Self::unknown_interface(route_name, interface_name))?;
        let key = NeighborKey::new(id, address);
        next.entries.insert(
            key,
            NeighborValue {
                mac,
                flags: family_flag(address) | NEIGHBOR_FLAG_STATIC,
                last_update: self.now(),
            },
        );
        self.commit(&mut next, 1)?;
        self.inflight.remove(&key);
        info!("[NEIGH] static {} {}:{} -> {}", address, route_name, interface_name, mac);
        Ok(())
    }

    /// Drop an entry. Removing a missing entry succeeds and changes nothing.
    pub fn remove(&self, route_name: &str, interface_name: &str, address: IpAddr) -> Result<()> {
        let mut next = self.generation.next_lock();
        let id = next
            .interfaces
            .find(route_name, interface_name)
            .ok_or_else(|| Self::unknown_interface(route_name, interface_name))?;
        let key = NeighborKey::new(id, address);
        if !next.entries.contains_key(&key) {
            Counters::add(&self.counters.remove_error, 1);
            debug!("[NEIGH] remove: no entry for {} on {}", address, interface_name);
            return Ok(());
        }
        next.entries.remove(&key);
        self.commit(&mut next, 0)?;
        Counters::add(&self.counters.remove_success, 1);
        info!("[NEIGH] removed {} {}:{}", address, route_name, interface_name);
        Ok(())
    }

    /// Drop every dynamic entry; static entries stay.
    pub fn clear(&self) -> Result<()> {
        let mut next = self.generation.next_lock();
        let dynamic = next.entries.values().filter(|v| !v.is_static()).count();
        if dynamic == 0 {
            return Ok(());
        }
        next.entries.retain(|_, v| v.is_static());
        self.commit(&mut next, 0)?;
        Counters::add(&self.counters.remove_success, dynamic as u64);
        self.inflight.clear();
        info!("[NEIGH] cleared {} dynamic entries", dynamic);
        Ok(())
    }

    /// Replace the interface map. Entries of interfaces that disappear are
    /// dropped, static ones included.
    pub fn update_interfaces(&self, interfaces: &[(InterfaceId, String, String)]) -> Result<()> {
        let mut by_id = BTreeMap::new();
        for (id, route, iface) in interfaces {
            by_id.insert(*id, (route.clone(), iface.clone()));
        }
        let mut next = self.generation.next_lock();
        next.interfaces = InterfaceMap { by_id };
        let before = next.entries.len();
        let known: HashSet<InterfaceId> = next.interfaces.by_id.keys().copied().collect();
        next.entries.retain(|k, _| known.contains(&k.interface_id));
        let pruned = before - next.entries.len();
        self.commit(&mut next, 0)?;
        Counters::add(&self.counters.remove_success, pruned as u64);
        info!(
            "[NEIGH] {} interfaces, {} entries pruned",
            interfaces.len(),
            pruned
        );
        Ok(())
    }

    pub fn stats(&self) -> NeighborStats {
        let c = &self.counters;
        NeighborStats {
            hashtable_insert_success: c.insert_success.load(Ordering::Relaxed),
            hashtable_insert_error: c.insert_error.load(Ordering::Relaxed),
            hashtable_remove_success: c.remove_success.load(Ordering::Relaxed),
            hashtable_remove_error: c.remove_error.load(Ordering::Relaxed),
            netlink_neighbor_update: c.netlink_neighbor_update.load(Ordering::Relaxed),
            resolve: c.resolve.load(Ordering::Relaxed),
        }
    }

    pub fn state(&self, interface_id: InterfaceId, address: IpAddr) -> NeighborState {
        let key = NeighborKey::new(interface_id, address);
        match self.generation.snapshot().entries.get(&key) {
            Some(v) if v.is_static() => NeighborState::ResolvedStatic,
            Some(_) => NeighborState::ResolvedDynamic,
            None if self.inflight.contains_key(&key) => NeighborState::Resolving,
            None => NeighborState::Unresolved,
        }
    }

    // ---- fast path --------------------------------------------------------

    /// Look up a MAC; a miss marks the key for the next sweep.
    #[inline]
    pub fn lookup(&self, socket_id: SocketId, interface_id: InterfaceId, address: IpAddr) -> Option<MacAddress> {
        let key = NeighborKey::new(interface_id, address);
        let hit = self
            .generation
            .snapshot()
            .tables
            .get(&socket_id)
            .and_then(|t| t.lookup(&key).map(|v| v.mac));
        if hit.is_none() {
            self.mark_miss(key);
        }
        hit
    }

    /// Mark `key` as awaiting resolution. Keys already marked or with a
    /// probe outstanding are left alone; past `max_pending` the miss is
    /// dropped.
    #[inline]
    pub fn mark_miss(&self, key: NeighborKey) {
        if self.pending.contains_key(&key) || self.probe_outstanding(&key) {
            return;
        }
        if self.pending.len() >= self.config.max_pending {
            counter!("fastplane_neighbor_misses_dropped_total").increment(1);
            return;
        }
        self.pending.insert(key, ());
    }

    fn probe_outstanding(&self, key: &NeighborKey) -> bool {
        self.inflight
            .get(key)
            .is_some_and(|sent| sent.elapsed() < self.config.probe_timeout)
    }

    /// Distinct keys waiting for the next sweep.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Link-layer monitor callback: queue an observed mapping.
    pub fn on_link_layer_update(&self, interface_name: &str, address: IpAddr, mac: MacAddress) {
        Counters::add(&self.counters.netlink_neighbor_update, 1);
        counter!("fastplane_neighbor_learns_total").increment(1);
        self.learned.push(Learned {
            interface_name: interface_name.to_string(),
            address,
            mac,
        });
    }

    // ---- background -------------------------------------------------------

    /// Apply queued link-layer learns as dynamic entries.
    pub fn flush_learned(&self) -> Result<usize> {
        let mut batch = Vec::new();
        while let Some(l) = self.learned.pop() {
            batch.push(l);
        }
        if batch.is_empty() {
            return Ok(0);
        }

        let mut next = self.generation.next_lock();
        let now = self.now();
        let mut applied = 0usize;
        for l in batch {
            let Some(id) = next.interfaces.find_by_interface(&l.interface_name) else {
                debug!("[NEIGH] learn on unknown interface {} ignored", l.interface_name);
                continue;
            };
            let key = NeighborKey::new(id, l.address);
            self.inflight.remove(&key);
            if next.entries.get(&key).is_some_and(|v| v.is_static()) {
                debug!("[NEIGH] learn for static {} ignored", l.address);
                continue;
            }
            next.entries.insert(
                key,
                NeighborValue {
                    mac: l.mac,
                    flags: family_flag(l.address),
                    last_update: now,
                },
            );
            applied += 1;
        }
        if applied == 0 {
            return Ok(0);
        }
        self.commit(&mut next, applied as u64)?;
        debug!("[NEIGH] {} learned entries applied", applied);
        Ok(applied)
    }

    /// Apply learns, then send one probe per marked key. Keys whose probe
    /// is younger than `probe_timeout` wait; failed probes are marked again.
    pub fn sweep(&self, resolver: &dyn Resolver) -> SweepReport {
        let mut report = SweepReport::default();
        match self.flush_learned() {
            Ok(n) => report.learned = n,
            Err(e) => warn!("[NEIGH] learned entries not applied: {}", e),
        }

        let mut keys = Vec::new();
        self.pending.retain(|k, _| {
            keys.push(*k);
            false
        });
        if keys.is_empty() {
            return report;
        }
        keys.retain(|k| !self.probe_outstanding(k));

        let targets: Vec<(NeighborKey, String)> = {
            let current = self.generation.snapshot();
            keys.into_iter()
                .filter(|k| !current.entries.contains_key(k))
                .filter_map(|k| match current.interfaces.names(k.interface_id) {
                    Some((_, iface)) => Some((k, iface.to_string())),
                    None => {
                        debug!("[NEIGH] miss on unknown interface id {}", k.interface_id);
                        None
                    }
                })
                .collect()
        };

        for (key, iface) in targets {
            self.inflight.insert(key, Instant::now());
            Counters::add(&self.counters.resolve, 1);
            report.attempted += 1;
            if let Err(e) = resolver.resolve(&iface, key.ip()) {
                warn!("[NEIGH] resolve {} on {} failed: {}", key.ip(), iface, e);
                report.failed += 1;
                self.inflight.remove(&key);
                self.pending.insert(key, ());
            }
        }
        counter!("fastplane_neighbor_probes_total").increment(report.attempted as u64);
        report
    }

    /// Run `sweep` every `interval` on a background thread.
    pub fn spawn_resolver(
        self: &Arc<Self>,
        resolver: Arc<dyn Resolver>,
        interval: Duration,
    ) -> Result<ResolverHandle> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let module = Arc::clone(self);
        let thread = std::thread::Builder::new()
            .name("fastplane-resolver".into())
            .spawn(move || {
                info!("[NEIGH] resolver started, interval={:?}", interval);
                while !flag.load(Ordering::Acquire) {
                    module.sweep(resolver.as_ref());
                    std::thread::park_timeout(interval);
                }
                info!("[NEIGH] resolver stopped");
            })
            .map_err(|e| Error::Resolve(format!("cannot spawn resolver thread: {e}")))?;
        Ok(ResolverHandle {
            stop,
            thread: Some(thread),
        })
    }

    pub fn update_worker_base(&self, socket_id: SocketId, table: &mut Option<Arc<NeighborTable>>) -> bool {
        let current = self.generation.snapshot();
        let published = current.tables.get(&socket_id);
        let changed = match (published, table.as_ref()) {
            (Some(p), Some(t)) => !Arc::ptr_eq(p, t),
            (None, None) => false,
            _ => true,
        };
        if changed {
            *table = published.cloned();
        }
        changed
    }

    pub fn limits(&self, out: &mut Vec<LimitItem>) {
        let current = self.generation.current_lock();
        for table in current.tables.values() {
            table.limits(out);
        }
    }
}

impl std::fmt::Debug for NeighborModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NeighborModule")
            .field("generation", &self.generation.generation_id())
            .field("stats", &self.stats())
            .finish()
    }
}

/// Stops and joins the resolver thread when dropped.
#[derive(Debug)]
pub struct ResolverHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ResolverHandle {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(t) = self.thread.take() {
            t.thread().unpark();
            if t.join().is_err() {
                error!("[NEIGH] resolver thread panicked");
            }
        }
    }
}

impl Drop for ResolverHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
