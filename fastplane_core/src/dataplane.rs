//! Composition root: one arena shared by the ACL and neighbor modules

use crate::acl::{AclBase, AclFields, AclModule, Classification};
use crate::arena::{LimitGroup, MemoryArena, MemoryUsage};
use crate::config::DataplaneConfig;
use crate::errors::{Error, Result};
use crate::neighbor::{NeighborModule, NeighborTable, ResolverHandle};
use crate::resolver::Resolver;
use crate::types::{InterfaceId, Limits, MacAddress, SocketId};
use log::info;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

/// What one worker reads on the fast path. Refreshed only through
/// `Dataplane::update_worker_base`; never written by the worker itself.
#[derive(Debug, Clone)]
pub struct WorkerBase {
    socket_id: SocketId,
    acl: AclBase,
    neighbor: Option<Arc<NeighborTable>>,
}

impl WorkerBase {
    pub fn socket_id(&self) -> SocketId {
        self.socket_id
    }

    #[inline]
    pub fn classify(&self, acl_id: u32, fields: &AclFields) -> Classification {
        self.acl.classify(acl_id, fields)
    }

    /// Table-only lookup; the caller reports misses with
    /// `Dataplane::neighbor_miss`.
    #[inline]
    pub fn neighbor(&self, interface_id: InterfaceId, address: IpAddr) -> Option<MacAddress> {
        let key = crate::neighbor::NeighborKey::new(interface_id, address);
        self.neighbor
            .as_ref()
            .and_then(|t| t.lookup(&key))
            .map(|v| v.mac)
    }
}

pub struct Dataplane {
    config: DataplaneConfig,
    arena: MemoryArena,
    acl: AclModule,
    neighbor: Arc<NeighborModule>,
    resolver: Mutex<Option<ResolverHandle>>,
}

impl Dataplane {
    pub fn new(config: DataplaneConfig) -> Result<Self> {
        crate::ensure_logging();
        crate::telemetry::init();
        config.validate()?;

        let arena = MemoryArena::new(&config.arena);
        let acl = AclModule::new(arena.clone(), config.acl.clone());
        let neighbor = Arc::new(NeighborModule::new(arena.clone(), config.neighbor.clone()));
        info!(
            "[DATAPLANE] ready on sockets {:?} (numa_bind={})",
            config.arena.sockets, config.arena.numa_bind
        );
        Ok(Self {
            config,
            arena,
            acl,
            neighbor,
            resolver: Mutex::new(None),
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(DataplaneConfig::from_env()?)
    }

    pub fn config(&self) -> &DataplaneConfig {
        &self.config
    }

    pub fn arena(&self) -> &MemoryArena {
        &self.arena
    }

    pub fn acl(&self) -> &AclModule {
        &self.acl
    }

    pub fn neighbor(&self) -> &Arc<NeighborModule> {
        &self.neighbor
    }

    pub fn sockets(&self) -> Vec<SocketId> {
        self.arena.sockets()
    }

    fn check_socket(&self, socket_id: SocketId) -> Result<()> {
        if self.config.arena.sockets.contains(&socket_id) {
            Ok(())
        } else {
            Err(Error::InvalidReference(format!("unknown socket {socket_id}")))
        }
    }

    /// A worker view bound to `socket_id`, filled from the published tables.
    pub fn worker_base(&self, socket_id: SocketId) -> Result<WorkerBase> {
        self.check_socket(socket_id)?;
        let mut base = WorkerBase {
            socket_id,
            acl: AclBase::empty(socket_id),
            neighbor: None,
        };
        self.update_worker_base(&mut base);
        Ok(base)
    }

    /// Re-point `base` at the latest published tables. Returns whether
    /// anything changed.
    pub fn update_worker_base(&self, base: &mut WorkerBase) -> bool {
        let acl = self.acl.update_worker_base(&mut base.acl);
        let neighbor = self
            .neighbor
            .update_worker_base(base.socket_id, &mut base.neighbor);
        acl || neighbor
    }

    pub fn neighbor_miss(&self, interface_id: InterfaceId, address: IpAddr) {
        self.neighbor
            .mark_miss(crate::neighbor::NeighborKey::new(interface_id, address));
    }

    /// Start the periodic resolution sweep; replaces a running one.
    pub fn start_resolver(&self, resolver: Arc<dyn Resolver>) -> Result<()> {
        let handle = self
            .neighbor
            .spawn_resolver(resolver, self.config.neighbor.resolve_interval)?;
        let mut slot = self.resolver.lock().unwrap_or_else(|p| p.into_inner());
        *slot = Some(handle);
        Ok(())
    }

    pub fn stop_resolver(&self) {
        let handle = self
            .resolver
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(h) = handle {
            h.stop();
        }
    }

    /// `(name, socket, current, maximum)` rows of every published table.
    pub fn limits(&self) -> Limits {
        let mut out = Vec::new();
        self.acl.limits(&mut out);
        self.neighbor.limits(&mut out);
        out
    }

    pub fn memory_report(&self) -> Vec<MemoryUsage> {
        self.arena.report()
    }

    /// Runtime memory-manager update: new limit tree and per-socket capacity.
    pub fn update_memory(&self, limits: LimitGroup, socket_capacity: Option<u64>) -> Result<()> {
        self.arena.update_limits(limits);
        for socket_id in self.arena.sockets() {
            self.arena.set_socket_capacity(socket_id, socket_capacity)?;
        }
        Ok(())
    }
}

impl Drop for Dataplane {
    fn drop(&mut self) {
        self.stop_resolver();
    }
}

impl std::fmt::Debug for Dataplane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dataplane")
            .field("arena", &self.arena)
            .field("acl", &self.acl)
            .field("neighbor", &self.neighbor)
            .finish()
    }
}
