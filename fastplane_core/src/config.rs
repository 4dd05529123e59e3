//! Runtime configuration for a dataplane instance
//!
//! Every knob has a default in `constants.rs`; `DataplaneConfig::from_env`
//! overlays `FASTPLANE_*` variables on top of those defaults.

use crate::arena::LimitGroup;
use crate::constants::*;
use crate::errors::{Error, Result};
use crate::platform;
use crate::types::SocketId;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ArenaConfig {
    /// Sockets tables are replicated on. Ids are validated on every allocation.
    pub sockets: Vec<SocketId>,
    /// Bind every block to its socket's NUMA node. A failed bind is an error.
    pub numa_bind: bool,
    /// Pre-fault pages at allocation time.
    pub populate: bool,
    /// Per-socket pool size in bytes; `None` means bounded only by the OS.
    pub socket_capacity: Option<u64>,
    pub limits: LimitGroup,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            sockets: vec![0],
            numa_bind: false,
            populate: false,
            socket_capacity: None,
            limits: LimitGroup::root(None),
        }
    }
}

impl ArenaConfig {
    /// One socket per online NUMA node, with strict binding.
    pub fn detect() -> Self {
        Self {
            sockets: platform::online_nodes(),
            numa_bind: true,
            ..Self::default()
        }
    }
}

/// Shared knobs of the hash table and trie builders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildLimits {
    pub max_capacity: usize,
    pub max_attempts: u32,
}

impl Default for BuildLimits {
    fn default() -> Self {
        Self {
            max_capacity: HT_DEFAULT_MAX_CAPACITY,
            max_attempts: DEFAULT_MAX_BUILD_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AclConfig {
    pub transport_chunk: usize,
    pub total_chunk: usize,
    pub network_v6_chunk: usize,
    pub tables: BuildLimits,
    pub lpm_initial_extended: usize,
    pub lpm_max_extended: usize,
}

impl Default for AclConfig {
    fn default() -> Self {
        Self {
            transport_chunk: ACL_TRANSPORT_CHUNK,
            total_chunk: ACL_TOTAL_CHUNK,
            network_v6_chunk: ACL_NETWORK_V6_CHUNK,
            tables: BuildLimits::default(),
            lpm_initial_extended: LPM_DEFAULT_EXTENDED,
            lpm_max_extended: LPM_DEFAULT_MAX_EXTENDED,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NeighborConfig {
    pub chunk_size: usize,
    pub tables: BuildLimits,
    pub resolve_interval: Duration,
    /// Distinct unresolved keys kept for the next sweep; further misses
    /// are dropped until it runs.
    pub max_pending: usize,
    /// An unanswered probe is sent again after this long.
    pub probe_timeout: Duration,
}

impl Default for NeighborConfig {
    fn default() -> Self {
        Self {
            chunk_size: NEIGHBOR_CHUNK,
            tables: BuildLimits::default(),
            resolve_interval: Duration::from_millis(DEFAULT_RESOLVE_INTERVAL_MS),
            max_pending: NEIGHBOR_MAX_PENDING,
            probe_timeout: Duration::from_millis(NEIGHBOR_PROBE_TIMEOUT_MS),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DataplaneConfig {
    pub arena: ArenaConfig,
    pub acl: AclConfig,
    pub neighbor: NeighborConfig,
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>> {
    let name = format!("{ENV_PREFIX}{key}");
    match lookup(&name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{name}: cannot parse '{raw}'"))),
    }
}

impl DataplaneConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Same as `from_env` but reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut cfg = Self::default();

        if let Some(list) = parse_var::<String>(&lookup, "SOCKETS")? {
            cfg.arena.sockets = platform::parse_node_list(&list)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| Error::Config(format!("{ENV_PREFIX}SOCKETS: bad list '{list}'")))?;
        }
        if let Some(v) = parse_var::<u8>(&lookup, "NUMA_BIND")? {
            cfg.arena.numa_bind = v != 0;
        }
        if let Some(v) = parse_var::<u8>(&lookup, "POPULATE")? {
            cfg.arena.populate = v != 0;
        }
        cfg.arena.socket_capacity = parse_var(&lookup, "SOCKET_CAPACITY")?;
        if let Some(v) = parse_var::<usize>(&lookup, "MAX_TABLE_CAPACITY")? {
            cfg.acl.tables.max_capacity = v;
            cfg.neighbor.tables.max_capacity = v;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "RESOLVE_INTERVAL_MS")? {
            cfg.neighbor.resolve_interval = Duration::from_millis(ms);
        }
        if let Some(n) = parse_var::<usize>(&lookup, "MAX_PENDING_RESOLVES")? {
            cfg.neighbor.max_pending = n;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "PROBE_TIMEOUT_MS")? {
            cfg.neighbor.probe_timeout = Duration::from_millis(ms);
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.arena.sockets.is_empty() {
            return Err(Error::Config("at least one socket is required".into()));
        }
        for (what, chunk) in [
            ("acl.transport_chunk", self.acl.transport_chunk),
            ("acl.total_chunk", self.acl.total_chunk),
            ("acl.network_v6_chunk", self.acl.network_v6_chunk),
            ("neighbor.chunk_size", self.neighbor.chunk_size),
        ] {
            if !chunk.is_power_of_two() {
                return Err(Error::Config(format!("{what} must be a power of two, got {chunk}")));
            }
        }
        if self.acl.lpm_initial_extended == 0 {
            return Err(Error::Config("acl.lpm_initial_extended must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn env_overrides_defaults() {
        let cfg = DataplaneConfig::from_lookup(lookup(&[
            ("FASTPLANE_SOCKETS", "0-1"),
            ("FASTPLANE_SOCKET_CAPACITY", "1048576"),
            ("FASTPLANE_RESOLVE_INTERVAL_MS", "250"),
            ("FASTPLANE_MAX_PENDING_RESOLVES", "64"),
        ]))
        .unwrap();
        assert_eq!(cfg.arena.sockets, vec![0, 1]);
        assert_eq!(cfg.arena.socket_capacity, Some(1 << 20));
        assert_eq!(cfg.neighbor.resolve_interval, Duration::from_millis(250));
        assert_eq!(cfg.neighbor.max_pending, 64);
        assert_eq!(cfg.neighbor.probe_timeout, Duration::from_millis(NEIGHBOR_PROBE_TIMEOUT_MS));
        assert!(!cfg.arena.numa_bind);
    }

    #[test]
    fn bad_values_are_config_errors() {
        let err = DataplaneConfig::from_lookup(lookup(&[("FASTPLANE_SOCKETS", "a-b")])).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        let err = DataplaneConfig::from_lookup(lookup(&[("FASTPLANE_POPULATE", "yes")])).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn chunk_sizes_must_be_powers_of_two() {
        let mut cfg = DataplaneConfig::default();
        cfg.acl.transport_chunk = 12;
        assert!(cfg.validate().is_err());
    }
}
