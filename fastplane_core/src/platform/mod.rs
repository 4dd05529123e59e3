//! Platform-specific memory mapping for the arena

#[cfg(unix)]
pub mod unix;
#[cfg(unix)]
pub use unix::{bind_to_node, map_anonymous, unmap};

#[cfg(not(unix))]
pub mod fallback;
#[cfg(not(unix))]
pub use fallback::{bind_to_node, map_anonymous, unmap};

use crate::constants::NUMA_ONLINE_PATH;
use crate::types::SocketId;

/// Parse a kernel node list such as `0-1,3`.
pub fn parse_node_list(list: &str) -> Option<Vec<SocketId>> {
    let mut out = Vec::new();
    for part in list.trim().split(',').filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: SocketId = lo.trim().parse().ok()?;
                let hi: SocketId = hi.trim().parse().ok()?;
                if hi < lo {
                    return None;
                }
                out.extend(lo..=hi);
            }
            None => out.push(part.trim().parse().ok()?),
        }
    }
    Some(out)
}

/// Online NUMA nodes, or `[0]` where the kernel does not expose them.
pub fn online_nodes() -> Vec<SocketId> {
    std::fs::read_to_string(NUMA_ONLINE_PATH)
        .ok()
        .and_then(|s| parse_node_list(&s))
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| vec![0])
}
