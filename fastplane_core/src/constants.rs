//! Constants and default tunables for the fastplane tables

pub const FNV_OFFSET: u64 = 0xcbf29ce484222325;
pub const FNV_PRIME: u64 = 0x100000001b3;

pub const PAGE_SIZE: usize = 4096;

// ---- hash tables --------------------------------------------------------
/// Smallest key count a table is sized for.
pub const HT_MIN_KEYS: usize = 128;
/// Slots reserved per key when choosing the initial capacity.
pub const HT_LOAD_FACTOR: usize = 4;
pub const HT_DEFAULT_CHUNK: usize = 16;
pub const HT_DEFAULT_MAX_CAPACITY: usize = 1 << 26;
pub const DEFAULT_MAX_BUILD_ATTEMPTS: u32 = 16;

// ---- 24/8 prefix trie ---------------------------------------------------
pub const LPM_ROOT_BITS: u32 = 24;
pub const LPM_ROOT_SIZE: usize = 1 << LPM_ROOT_BITS;
pub const LPM_CHUNK_SIZE: usize = 256;
/// Root entry flag: the low 31 bits index an extended chunk.
pub const LPM_EXTENDED_FLAG: u32 = 1 << 31;
pub const LPM_DEFAULT_EXTENDED: usize = 64;
pub const LPM_DEFAULT_MAX_EXTENDED: usize = 1 << 20;
/// Source tree depth: three fan-out levels above the leaf level.
pub const LPM_SOURCE_LEVELS: u8 = 4;

// ---- ACL ----------------------------------------------------------------
pub const ACL_TRANSPORT_CHUNK: usize = 16;
pub const ACL_TOTAL_CHUNK: usize = 16;
pub const ACL_NETWORK_V6_CHUNK: usize = 1;

// ---- neighbor -----------------------------------------------------------
pub const NEIGHBOR_CHUNK: usize = 16;
pub const NEIGHBOR_FLAG_IPV6: u16 = 1 << 0;
pub const NEIGHBOR_FLAG_STATIC: u16 = 1 << 1;
pub const DEFAULT_RESOLVE_INTERVAL_MS: u64 = 1000;
pub const NEIGHBOR_MAX_PENDING: usize = 4096;
pub const NEIGHBOR_PROBE_TIMEOUT_MS: u64 = 5000;

pub const ENV_PREFIX: &str = "FASTPLANE_";
pub const NUMA_ONLINE_PATH: &str = "/sys/devices/system/node/online";
