pub mod acl;
pub mod arena;
pub mod config;
pub mod constants;
pub mod dataplane;
pub mod errors;
pub mod generation;
pub mod handle_registry;
pub mod hashtable;
pub mod helpers;
pub mod lpm;
pub mod neighbor;
pub mod platform;
pub mod public_api;
pub mod resolver;
pub mod telemetry;
pub mod types;

use once_cell::sync::OnceCell;

pub use acl::{AclAction, AclDelta, AclFields, AclModule, AclValue, NetworkRules, TotalKey, TransportKey};
pub use arena::{ArenaSlice, LimitGroup, MemoryArena, MemoryBlock};
pub use config::{AclConfig, ArenaConfig, BuildLimits, DataplaneConfig, NeighborConfig};
pub use dataplane::{Dataplane, WorkerBase};
pub use errors::{AllocationError, Error, ErrorCode, Result};
pub use generation::{GenerationManager, SwitchState};
pub use hashtable::{BuildStats, HashTable, HashTableBuilder};
pub use lpm::{ChunkSlot, Lpm4, Lpm4Builder, SourceTree};
pub use neighbor::{NeighborModule, NeighborQuery, NeighborRow, NeighborState, NeighborStats};
pub use resolver::{PingResolver, Resolver};
pub use types::{GroupId, InterfaceId, LimitItem, Limits, MacAddress, SocketId, Zeroable};

/// Install `env_logger` once per process. Safe to call from every entry point.
pub fn ensure_logging() {
    static INIT: OnceCell<()> = OnceCell::new();
    INIT.get_or_init(|| {
        // Fallback: simple env_logger with timestamps off.
        let _ = env_logger::builder()
            .format_timestamp(None)
            .is_test(std::env::var("RUST_TEST_THREADS").is_ok())
            .try_init();
    });
}
