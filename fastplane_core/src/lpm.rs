//! 24/8 prefix trie for IPv4 network classification
//!
//! The control plane describes a classification as a [`SourceTree`]: a flat
//! list of 256-slot chunks, four levels deep, one level per address octet.
//! [`Lpm4Builder`] compiles it into the packed fast-path form:
//!
//! * a root array of 2^24 entries indexed by the top three octets, each
//!   either a group id or, with the high bit set, an extended chunk index;
//! * a pool of 256-entry extended chunks indexed by the last octet.
//!
//! Extended chunks are shared between every root entry whose leaf chunk has
//! the same source id or the same content.

use crate::arena::{ArenaSlice, MemoryArena};
use crate::constants::{
    LPM_CHUNK_SIZE, LPM_DEFAULT_EXTENDED, LPM_DEFAULT_MAX_EXTENDED, LPM_EXTENDED_FLAG,
    LPM_SOURCE_LEVELS,
};
use crate::errors::{Error, Result};
use crate::helpers::{pow2_at_least, v4_to_u32};
use crate::types::{GroupId, LimitItem, SocketId};
use ipnet::Ipv4Net;
use log::{debug, info, warn};
use metrics::counter;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkSlot {
    Group(GroupId),
    Chunk(u32),
}

impl Default for ChunkSlot {
    fn default() -> Self {
        ChunkSlot::Group(0)
    }
}

pub type SourceChunk = [ChunkSlot; LPM_CHUNK_SIZE];

/// Chunked description of an IPv4 classification. Chunk 0 is the root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceTree {
    chunks: Vec<SourceChunk>,
}

impl SourceTree {
    pub fn from_chunks(chunks: Vec<SourceChunk>) -> Self {
        Self { chunks }
    }

    /// Longest-prefix-wins tree over `rules`. Among equal prefixes the last
    /// rule wins.
    pub fn from_prefixes(rules: &[(Ipv4Net, GroupId)]) -> Result<Self> {
        let mut sorted: Vec<(Ipv4Net, GroupId)> =
            rules.iter().map(|(net, g)| (net.trunc(), *g)).collect();
        // stable: equal lengths keep input order
        sorted.sort_by_key(|(net, _)| net.prefix_len());

        let mut tree = Self {
            chunks: vec![[ChunkSlot::Group(0); LPM_CHUNK_SIZE]],
        };
        for (net, group) in sorted {
            if group & LPM_EXTENDED_FLAG != 0 {
                return Err(Error::StructuralInconsistency(format!(
                    "group {group:#x} for {net} uses the reserved high bit"
                )));
            }
            tree.paint(v4_to_u32(net.addr()), net.prefix_len(), group);
        }
        Ok(tree)
    }

    fn paint(&mut self, addr: u32, len: u8, group: GroupId) {
        let mut chunk = 0usize;
        let mut level = 0u8;
        loop {
            let shift = 24 - 8 * level as u32;
            let octet = ((addr >> shift) & 0xff) as usize;
            let level_end = 8 * (level + 1);
            if len <= level_end {
                // rules arrive shortest first, so nothing below is more specific
                let span = 1usize << (level_end - len);
                let start = octet & !(span - 1);
                for slot in &mut self.chunks[chunk][start..start + span] {
                    *slot = ChunkSlot::Group(group);
                }
                return;
            }
            chunk = match self.chunks[chunk][octet] {
                ChunkSlot::Chunk(c) => c as usize,
                ChunkSlot::Group(inherited) => {
                    let id = self.chunks.len();
                    self.chunks.push([ChunkSlot::Group(inherited); LPM_CHUNK_SIZE]);
                    self.chunks[chunk][octet] = ChunkSlot::Chunk(id as u32);
                    id
                }
            };
            level += 1;
        }
    }

    pub fn chunks(&self) -> &[SourceChunk] {
        &self.chunks
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Reference-check every chunk reachable from the root.
    pub fn validate(&self) -> Result<()> {
        if self.chunks.is_empty() {
            return Ok(());
        }
        let mut seen = HashSet::new();
        self.validate_chunk(0, 0, &mut seen)
    }

    fn validate_chunk(&self, id: u32, level: u8, seen: &mut HashSet<(u32, u8)>) -> Result<()> {
        if !seen.insert((id, level)) {
            return Ok(());
        }
        for (i, slot) in self.chunks[id as usize].iter().enumerate() {
            match *slot {
                ChunkSlot::Group(g) if g & LPM_EXTENDED_FLAG != 0 => {
                    return Err(Error::StructuralInconsistency(format!(
                        "chunk {id} slot {i}: group {g:#x} uses the reserved high bit"
                    )));
                }
                ChunkSlot::Group(_) => {}
                ChunkSlot::Chunk(_) if level + 1 >= LPM_SOURCE_LEVELS => {
                    return Err(Error::StructuralInconsistency(format!(
                        "leaf chunk {id} slot {i} references another chunk"
                    )));
                }
                ChunkSlot::Chunk(0) => {
                    return Err(Error::StructuralInconsistency(format!(
                        "chunk {id} slot {i} references the root"
                    )));
                }
                ChunkSlot::Chunk(c) if c as usize >= self.chunks.len() => {
                    return Err(Error::StructuralInconsistency(format!(
                        "chunk {id} slot {i} references missing chunk {c} of {}",
                        self.chunks.len()
                    )));
                }
                ChunkSlot::Chunk(c) => self.validate_chunk(c, level + 1, seen)?,
            }
        }
        Ok(())
    }

    /// Distinct leaf chunks referenced from level 2.
    fn leaf_refs(&self) -> usize {
        let mut leaves = HashSet::new();
        let mut level1 = HashSet::new();
        let mut level2 = HashSet::new();
        let Some(root) = self.chunks.first() else {
            return 0;
        };
        for slot in root {
            if let ChunkSlot::Chunk(c) = slot {
                level1.insert(*c);
            }
        }
        for c in level1 {
            for slot in &self.chunks[c as usize] {
                if let ChunkSlot::Chunk(c2) = slot {
                    level2.insert(*c2);
                }
            }
        }
        for c in level2 {
            for slot in &self.chunks[c as usize] {
                if let ChunkSlot::Chunk(c3) = slot {
                    leaves.insert(*c3);
                }
            }
        }
        leaves.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LpmStats {
    pub extended_used: usize,
    pub extended_capacity: usize,
    /// Leaf references served by an already interned source chunk.
    pub shared_by_source: usize,
    /// Leaf chunks folded into an identical extended chunk.
    pub shared_by_content: usize,
    /// Leaf chunks holding one group, written straight into the root.
    pub uniform_leaves: usize,
    pub attempts: u32,
}

pub struct Lpm4 {
    name: String,
    socket_id: SocketId,
    root: ArenaSlice<u32>,
    extended: ArenaSlice<[u32; LPM_CHUNK_SIZE]>,
    stats: LpmStats,
}

impl Lpm4 {
    #[inline]
    pub fn lookup(&self, addr: u32) -> GroupId {
        let entry = self.root[(addr >> 8) as usize];
        if entry & LPM_EXTENDED_FLAG != 0 {
            self.extended[(entry & !LPM_EXTENDED_FLAG) as usize][(addr & 0xff) as usize]
        } else {
            entry
        }
    }

    pub fn lookup_ip(&self, addr: Ipv4Addr) -> GroupId {
        self.lookup(v4_to_u32(addr))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn socket_id(&self) -> SocketId {
        self.socket_id
    }

    pub fn stats(&self) -> &LpmStats {
        &self.stats
    }

    /// Append `<name>.extended_chunks`.
    pub fn limits(&self, out: &mut Vec<LimitItem>) {
        out.push(LimitItem::new(
            format!("{}.extended_chunks", self.name),
            Some(self.socket_id),
            self.stats.extended_used as u64,
            self.stats.extended_capacity as u64,
        ));
    }
}

impl std::fmt::Debug for Lpm4 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lpm4")
            .field("name", &self.name)
            .field("socket_id", &self.socket_id)
            .field("stats", &self.stats)
            .finish()
    }
}

pub struct Lpm4Builder<'a> {
    arena: &'a MemoryArena,
    name: String,
    socket_id: SocketId,
    initial_extended: usize,
    max_extended: usize,
}

/// Extended pool ran out during a compile pass.
struct PoolFull;

impl<'a> Lpm4Builder<'a> {
    pub fn new(arena: &'a MemoryArena, name: impl Into<String>, socket_id: SocketId) -> Self {
        Self {
            arena,
            name: name.into(),
            socket_id,
            initial_extended: LPM_DEFAULT_EXTENDED,
            max_extended: LPM_DEFAULT_MAX_EXTENDED,
        }
    }

    pub fn extended(mut self, initial: usize, max: usize) -> Self {
        self.initial_extended = initial.max(1);
        self.max_extended = max;
        self
    }

    pub fn build(&self, tree: &SourceTree) -> Result<Lpm4> {
        tree.validate()?;

        let mut root = self.arena.create_zeroed_slice::<u32>(
            &format!("{}.root", self.name),
            self.socket_id,
            crate::constants::LPM_ROOT_SIZE,
        )?;
        let ext_name = format!("{}.extended", self.name);
        let mut capacity = pow2_at_least(self.initial_extended.max(tree.leaf_refs() / 2));
        let mut attempts = 0u32;

        while capacity <= self.max_extended {
            attempts += 1;
            let mut extended = self.arena.create_zeroed_slice::<[u32; LPM_CHUNK_SIZE]>(
                &ext_name,
                self.socket_id,
                capacity,
            )?;
            let mut stats = LpmStats {
                extended_capacity: capacity,
                attempts,
                ..LpmStats::default()
            };
            match compile(tree, &mut root, &mut extended, &mut stats) {
                Ok(()) => {
                    counter!("fastplane_lpm_builds_total").increment(1);
                    info!(
                        "[LPM] {} socket={} extended={}/{} shared_src={} shared_content={} attempts={}",
                        self.name,
                        self.socket_id,
                        stats.extended_used,
                        capacity,
                        stats.shared_by_source,
                        stats.shared_by_content,
                        attempts
                    );
                    return Ok(Lpm4 {
                        name: self.name.clone(),
                        socket_id: self.socket_id,
                        root,
                        extended,
                        stats,
                    });
                }
                Err(PoolFull) => {
                    warn!(
                        "[LPM] {} socket={} extended pool of {} full; doubling",
                        self.name, self.socket_id, capacity
                    );
                    drop(extended);
                    capacity = capacity.saturating_mul(2);
                }
            }
        }

        counter!("fastplane_table_overflows_total").increment(1);
        Err(Error::CapacityOverflow {
            name: self.name.clone(),
            socket_id: self.socket_id,
            capacity,
            attempts,
        })
    }
}

fn fill(root: &mut [u32], base: usize, span: usize, group: GroupId) {
    // fresh roots are zero; a retry rewrites the same positions with the
    // same values
    if group != 0 {
        root[base..base + span].fill(group);
    }
}

/// One pass over a validated tree. Deterministic, so a retry on a larger
/// pool rewrites every root entry the failed pass touched.
fn compile(
    tree: &SourceTree,
    root: &mut [u32],
    extended: &mut [[u32; LPM_CHUNK_SIZE]],
    stats: &mut LpmStats,
) -> std::result::Result<(), PoolFull> {
    let Some(top) = tree.chunks.first() else {
        return Ok(());
    };
    let mut by_source: HashMap<u32, u32> = HashMap::new();
    let mut by_content: HashMap<[u32; LPM_CHUNK_SIZE], u32> = HashMap::new();

    for (i, s0) in top.iter().enumerate() {
        let base0 = i << 16;
        let c1 = match *s0 {
            ChunkSlot::Group(g) => {
                fill(root, base0, 1 << 16, g);
                continue;
            }
            ChunkSlot::Chunk(c) => c,
        };
        for (j, s1) in tree.chunks[c1 as usize].iter().enumerate() {
            let base1 = base0 | (j << 8);
            let c2 = match *s1 {
                ChunkSlot::Group(g) => {
                    fill(root, base1, 1 << 8, g);
                    continue;
                }
                ChunkSlot::Chunk(c) => c,
            };
            for (k, s2) in tree.chunks[c2 as usize].iter().enumerate() {
                let idx = base1 | k;
                match *s2 {
                    ChunkSlot::Group(g) => fill(root, idx, 1, g),
                    ChunkSlot::Chunk(leaf) => {
                        root[idx] = intern(tree, leaf, extended, stats, &mut by_source, &mut by_content)?;
                    }
                }
            }
        }
    }
    debug!(
        "[LPM] compiled {} source chunks into {} extended",
        tree.chunks.len(),
        stats.extended_used
    );
    Ok(())
}

/// Root entry for leaf chunk `leaf`: a direct group when uniform, otherwise
/// a flagged index into the (deduplicated) extended pool.
fn intern(
    tree: &SourceTree,
    leaf: u32,
    extended: &mut [[u32; LPM_CHUNK_SIZE]],
    stats: &mut LpmStats,
    by_source: &mut HashMap<u32, u32>,
    by_content: &mut HashMap<[u32; LPM_CHUNK_SIZE], u32>,
) -> std::result::Result<u32, PoolFull> {
    if let Some(&entry) = by_source.get(&leaf) {
        stats.shared_by_source += 1;
        return Ok(entry);
    }

    let mut content = [0u32; LPM_CHUNK_SIZE];
    for (dst, slot) in content.iter_mut().zip(tree.chunks[leaf as usize].iter()) {
        // validated: leaves hold groups only
        if let ChunkSlot::Group(g) = slot {
            *dst = *g;
        }
    }

    let entry = if content.iter().all(|&g| g == content[0]) {
        stats.uniform_leaves += 1;
        content[0]
    } else if let Some(&idx) = by_content.get(&content) {
        stats.shared_by_content += 1;
        idx | LPM_EXTENDED_FLAG
    } else {
        if stats.extended_used == extended.len() {
            return Err(PoolFull);
        }
        let idx = stats.extended_used as u32;
        extended[idx as usize] = content;
        by_content.insert(content, idx);
        stats.extended_used += 1;
        idx | LPM_EXTENDED_FLAG
    };
    by_source.insert(leaf, entry);
    Ok(entry)
}
