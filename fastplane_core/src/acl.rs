//! ACL orchestrator
//!
//! An ACL base is the per-socket bundle of classification tables:
//!
//! ```text
//! source ip      -> network source group       (v4 trie / v6 exact table)
//! destination ip -> network destination group  (v4 trie / v6 exact table)
//! (src group, dst group, proto, ports) -> transport id
//! (acl id, transport id)               -> value index
//! value index                          -> AclValue
//! ```
//!
//! `AclModule::apply` rebuilds every table a delta carries, on every socket,
//! inside the next generation and switches once. Any failure leaves the
//! published bases untouched.

use crate::arena::{ArenaSlice, MemoryArena};
use crate::config::AclConfig;
use crate::errors::{Error, Result};
use crate::generation::GenerationManager;
use crate::hashtable::{HashTable, HashTableBuilder};
use crate::helpers::v6_to_u128;
use crate::lpm::{Lpm4, Lpm4Builder, SourceTree};
use crate::types::{GroupId, LimitItem, SocketId, Zeroable};
use ipnet::Ipv4Net;
use log::{debug, error, info};
use metrics::counter;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv6Addr};
use std::sync::Arc;

pub const TABLE_NETWORK_V4_SOURCE: &str = "acl.network.v4.source.lpm";
pub const TABLE_NETWORK_V4_DESTINATION: &str = "acl.network.v4.destination.lpm";
pub const TABLE_NETWORK_V6_SOURCE: &str = "acl.network.v6.source.ht";
pub const TABLE_NETWORK_V6_DESTINATION: &str = "acl.network.v6.destination.ht";
pub const TABLE_TRANSPORT: &str = "acl.transport.ht";
pub const TABLE_TOTAL: &str = "acl.total.ht";
pub const TABLE_VALUES: &str = "acl.values";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(C)]
pub struct TransportKey {
    pub network_source: GroupId,
    pub network_destination: GroupId,
    pub source_port: u16,
    pub destination_port: u16,
    pub protocol: u8,
}

unsafe impl Zeroable for TransportKey {}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(C)]
pub struct TotalKey {
    pub acl_id: u32,
    pub transport_id: u32,
}

unsafe impl Zeroable for TotalKey {}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u32)]
pub enum AclAction {
    #[default]
    Deny = 0,
    Allow = 1,
    Log = 2,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct AclValue {
    pub action: AclAction,
    pub counter_id: u32,
}

/// Network rules of one direction. IPv4 matches by longest prefix, IPv6 by
/// exact address.
#[derive(Debug, Clone, Default)]
pub struct NetworkRules {
    pub ipv4: Vec<(Ipv4Net, GroupId)>,
    pub ipv6: Vec<(Ipv6Addr, GroupId)>,
}

/// One ACL update. Every `Some` field fully replaces its table(s).
#[derive(Debug, Clone, Default)]
pub struct AclDelta {
    pub network_source: Option<NetworkRules>,
    pub network_destination: Option<NetworkRules>,
    pub transport: Option<Vec<(TransportKey, u32)>>,
    pub total: Option<Vec<(TotalKey, u32)>>,
    pub values: Option<Vec<AclValue>>,
}

impl AclDelta {
    pub fn is_empty(&self) -> bool {
        self.network_source.is_none()
            && self.network_destination.is_none()
            && self.transport.is_none()
            && self.total.is_none()
            && self.values.is_none()
    }
}

/// Header fields the fast path extracted from a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AclFields {
    pub source: IpAddr,
    pub destination: IpAddr,
    pub protocol: u8,
    pub source_port: u16,
    pub destination_port: u16,
}

/// Every intermediate result of one classification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Classification {
    pub network_source: GroupId,
    pub network_destination: GroupId,
    pub transport_id: u32,
    pub value_index: u32,
    pub value: AclValue,
}

/// The classification tables of one socket. Absent tables classify to 0.
#[derive(Debug, Clone)]
pub struct AclBase {
    socket_id: SocketId,
    network_v4_source: Option<Arc<Lpm4>>,
    network_v4_destination: Option<Arc<Lpm4>>,
    network_v6_source: Option<Arc<HashTable<u128, GroupId>>>,
    network_v6_destination: Option<Arc<HashTable<u128, GroupId>>>,
    transport: Option<Arc<HashTable<TransportKey, u32>>>,
    total: Option<Arc<HashTable<TotalKey, u32>>>,
    values: Option<Arc<ArenaSlice<AclValue>>>,
}

impl AclBase {
    pub fn empty(socket_id: SocketId) -> Self {
        Self {
            socket_id,
            network_v4_source: None,
            network_v4_destination: None,
            network_v6_source: None,
            network_v6_destination: None,
            transport: None,
            total: None,
            values: None,
        }
    }

    pub fn socket_id(&self) -> SocketId {
        self.socket_id
    }

    #[inline]
    fn network(
        v4: &Option<Arc<Lpm4>>,
        v6: &Option<Arc<HashTable<u128, GroupId>>>,
        addr: IpAddr,
    ) -> GroupId {
        match addr {
            IpAddr::V4(a) => v4.as_ref().map_or(0, |t| t.lookup_ip(a)),
            IpAddr::V6(a) => v6
                .as_ref()
                .and_then(|t| t.lookup(&v6_to_u128(a)).copied())
                .unwrap_or(0),
        }
    }

    pub fn classify(&self, acl_id: u32, fields: &AclFields) -> Classification {
        let network_source = Self::network(&self.network_v4_source, &self.network_v6_source, fields.source);
        let network_destination = Self::network(
            &self.network_v4_destination,
            &self.network_v6_destination,
            fields.destination,
        );
        let transport_key = TransportKey {
            network_source,
            network_destination,
            source_port: fields.source_port,
            destination_port: fields.destination_port,
            protocol: fields.protocol,
        };
        let transport_id = self
            .transport
            .as_ref()
            .and_then(|t| t.lookup(&transport_key).copied())
            .unwrap_or(0);
        let value_index = self
            .total
            .as_ref()
            .and_then(|t| t.lookup(&TotalKey { acl_id, transport_id }).copied())
            .unwrap_or(0);
        let value = self
            .values
            .as_ref()
            .and_then(|v| v.get(value_index as usize).copied())
            .unwrap_or_default();
        Classification {
            network_source,
            network_destination,
            transport_id,
            value_index,
            value,
        }
    }

    pub fn values_len(&self) -> usize {
        self.values.as_ref().map_or(0, |v| v.len())
    }

    pub fn limits(&self, out: &mut Vec<LimitItem>) {
        if let Some(t) = &self.network_v4_source {
            t.limits(out);
        }
        if let Some(t) = &self.network_v4_destination {
            t.limits(out);
        }
        if let Some(t) = &self.network_v6_source {
            t.limits(out);
        }
        if let Some(t) = &self.network_v6_destination {
            t.limits(out);
        }
        if let Some(t) = &self.transport {
            t.limits(out);
        }
        if let Some(t) = &self.total {
            t.limits(out);
        }
    }

    /// Tables this base shares with `other` (same instance, not just equal).
    fn same_tables(&self, other: &AclBase) -> bool {
        fn same<T>(a: &Option<Arc<T>>, b: &Option<Arc<T>>) -> bool {
            match (a, b) {
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                (None, None) => true,
                _ => false,
            }
        }
        same(&self.network_v4_source, &other.network_v4_source)
            && same(&self.network_v4_destination, &other.network_v4_destination)
            && same(&self.network_v6_source, &other.network_v6_source)
            && same(&self.network_v6_destination, &other.network_v6_destination)
            && same(&self.transport, &other.transport)
            && same(&self.total, &other.total)
            && same(&self.values, &other.values)
    }
}

#[derive(Debug, Clone, Default)]
pub struct AclGeneration {
    bases: BTreeMap<SocketId, AclBase>,
}

impl AclGeneration {
    pub fn base(&self, socket_id: SocketId) -> Option<&AclBase> {
        self.bases.get(&socket_id)
    }
}

/// Per-table row of `AclModule::report`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclTableReport {
    pub name: String,
    pub socket_id: SocketId,
    pub entries: usize,
    pub capacity: usize,
}

pub struct AclModule {
    arena: MemoryArena,
    config: AclConfig,
    generation: GenerationManager<AclGeneration>,
}

impl AclModule {
    pub fn new(arena: MemoryArena, config: AclConfig) -> Self {
        let bases = arena
            .sockets()
            .into_iter()
            .map(|s| (s, AclBase::empty(s)))
            .collect();
        Self {
            arena,
            config,
            generation: GenerationManager::new(AclGeneration { bases }),
        }
    }

    pub fn generation_id(&self) -> u64 {
        self.generation.generation_id()
    }

    /// Rebuild every table the delta carries and publish them together.
    pub fn apply(&self, delta: &AclDelta) -> Result<()> {
        if delta.is_empty() {
            debug!("[ACL] empty delta, nothing to switch");
            return Ok(());
        }
        let result = self.generation.update(|next| self.rebuild(next, delta));
        match &result {
            Ok(()) => {
                counter!("fastplane_acl_updates_total", "result" => "ok").increment(1);
                info!("[ACL] switched to generation {}", self.generation.generation_id());
            }
            Err(e) => {
                counter!("fastplane_acl_updates_total", "result" => "error").increment(1);
                error!("[ACL] update rejected, current generation kept: {}", e);
            }
        }
        result
    }

    fn rebuild(&self, next: &mut AclGeneration, delta: &AclDelta) -> Result<()> {
        // trees are socket independent: compile once
        let source_tree = delta
            .network_source
            .as_ref()
            .filter(|r| !r.ipv4.is_empty())
            .map(|r| SourceTree::from_prefixes(&r.ipv4))
            .transpose()?;
        let destination_tree = delta
            .network_destination
            .as_ref()
            .filter(|r| !r.ipv4.is_empty())
            .map(|r| SourceTree::from_prefixes(&r.ipv4))
            .transpose()?;

        for (&socket_id, base) in next.bases.iter_mut() {
            if let Some(values) = &delta.values {
                base.values = if values.is_empty() {
                    None
                } else {
                    let slice = self.arena.create_slice_with(
                        TABLE_VALUES,
                        socket_id,
                        values.len(),
                        |i| values[i],
                    )?;
                    Some(Arc::new(slice))
                };
            }
            Self::check_total(delta, base)?;

            if let Some(rules) = &delta.network_source {
                base.network_v4_source = match &source_tree {
                    Some(tree) => Some(Arc::new(self.build_lpm(TABLE_NETWORK_V4_SOURCE, socket_id, tree)?)),
                    None => None,
                };
                base.network_v6_source = self.build_v6(TABLE_NETWORK_V6_SOURCE, socket_id, &rules.ipv6)?;
            }
            if let Some(rules) = &delta.network_destination {
                base.network_v4_destination = match &destination_tree {
                    Some(tree) => Some(Arc::new(self.build_lpm(TABLE_NETWORK_V4_DESTINATION, socket_id, tree)?)),
                    None => None,
                };
                base.network_v6_destination =
                    self.build_v6(TABLE_NETWORK_V6_DESTINATION, socket_id, &rules.ipv6)?;
            }
            if let Some(rules) = &delta.transport {
                let table = HashTableBuilder::new(&self.arena, TABLE_TRANSPORT, socket_id)
                    .chunk_size(self.config.transport_chunk)
                    .limits(self.config.tables)
                    .build(rules)?;
                base.transport = Some(Arc::new(table));
            }
            if let Some(rules) = &delta.total {
                let table = HashTableBuilder::new(&self.arena, TABLE_TOTAL, socket_id)
                    .chunk_size(self.config.total_chunk)
                    .limits(self.config.tables)
                    .build(rules)?;
                base.total = Some(Arc::new(table));
            }
            debug!("[ACL] socket {} rebuilt", socket_id);
        }
        Ok(())
    }

    /// Total rules may only point at existing values; index 0 is the
    /// no-match default and always allowed. A delta without total rules is
    /// checked against the published total table.
    fn check_total(delta: &AclDelta, base: &AclBase) -> Result<()> {
        let values = base.values_len();
        let dangling = match (&delta.total, &base.total) {
            (Some(rules), _) => rules
                .iter()
                .map(|(key, idx)| (*key, *idx))
                .find(|(_, idx)| *idx != 0 && *idx as usize >= values),
            (None, Some(table)) => table
                .iter()
                .map(|(key, idx)| (*key, *idx))
                .find(|(_, idx)| *idx != 0 && *idx as usize >= values),
            (None, None) => None,
        };
        match dangling {
            Some((key, idx)) => Err(Error::InvalidReference(format!(
                "total rule acl {} transport {} points at value {} of {}",
                key.acl_id, key.transport_id, idx, values
            ))),
            None => Ok(()),
        }
    }

    fn build_lpm(&self, name: &str, socket_id: SocketId, tree: &SourceTree) -> Result<Lpm4> {
        Lpm4Builder::new(&self.arena, name, socket_id)
            .extended(self.config.lpm_initial_extended, self.config.lpm_max_extended)
            .build(tree)
    }

    fn build_v6(
        &self,
        name: &str,
        socket_id: SocketId,
        rules: &[(Ipv6Addr, GroupId)],
    ) -> Result<Option<Arc<HashTable<u128, GroupId>>>> {
        if rules.is_empty() {
            return Ok(None);
        }
        let entries: Vec<(u128, GroupId)> = rules.iter().map(|(a, g)| (v6_to_u128(*a), *g)).collect();
        let table = HashTableBuilder::new(&self.arena, name, socket_id)
            .chunk_size(self.config.network_v6_chunk)
            .limits(self.config.tables)
            .build(&entries)?;
        Ok(Some(Arc::new(table)))
    }

    /// Fast-path classification against the published generation.
    pub fn classify(&self, socket_id: SocketId, acl_id: u32, fields: &AclFields) -> Option<Classification> {
        let current = self.generation.snapshot();
        current.base(socket_id).map(|b| b.classify(acl_id, fields))
    }

    /// Point a worker's base at the published tables of its socket.
    /// Returns whether anything changed.
    pub fn update_worker_base(&self, base: &mut AclBase) -> bool {
        let current = self.generation.snapshot();
        match current.base(base.socket_id) {
            Some(published) if !published.same_tables(base) => {
                *base = published.clone();
                true
            }
            _ => false,
        }
    }

    pub fn worker_base(&self, socket_id: SocketId) -> Option<AclBase> {
        self.generation.snapshot().base(socket_id).cloned()
    }

    pub fn limits(&self, out: &mut Vec<LimitItem>) {
        let current = self.generation.current_lock();
        for base in current.bases.values() {
            base.limits(out);
        }
    }

    pub fn report(&self) -> Vec<AclTableReport> {
        let current = self.generation.current_lock();
        let mut rows = Vec::new();
        for (&socket_id, base) in &current.bases {
            let mut push = |name: &str, entries: usize, capacity: usize| {
                rows.push(AclTableReport {
                    name: name.to_string(),
                    socket_id,
                    entries,
                    capacity,
                })
            };
            if let Some(t) = &base.network_v4_source {
                push(t.name(), t.stats().extended_used, t.stats().extended_capacity);
            }
            if let Some(t) = &base.network_v4_destination {
                push(t.name(), t.stats().extended_used, t.stats().extended_capacity);
            }
            if let Some(t) = &base.network_v6_source {
                push(t.name(), t.len(), t.capacity());
            }
            if let Some(t) = &base.network_v6_destination {
                push(t.name(), t.len(), t.capacity());
            }
            if let Some(t) = &base.transport {
                push(t.name(), t.len(), t.capacity());
            }
            if let Some(t) = &base.total {
                push(t.name(), t.len(), t.capacity());
            }
            if let Some(v) = &base.values {
                push(TABLE_VALUES, v.len(), v.len());
            }
        }
        rows
    }
}

impl std::fmt::Debug for AclModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AclModule")
            .field("generation", &self.generation.generation_id())
            .finish()
    }
}
