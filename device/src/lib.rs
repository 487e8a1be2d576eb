//! Contract between the filesystem core and the co-designed SSD.
//!
//! This crate is the only escape hatch to hardware: 4 KiB block I/O plus the
//! four vendor metadata commands (path lookup, file-mapping search, journal
//! tail update, journal head query). Everything else — caching, allocation,
//! journaling, locking — lives in the `hscfs` core crate and talks to
//! hardware exclusively through the [`Device`] trait.

use anyhow::Result;

pub mod memory;
pub mod types;
pub mod wire;

pub use types::*;

/// Long-command tid, assigned by the host and polled via a follow-up admin
/// command on real hardware. The in-process [`memory::MemoryDevice`]
/// resolves these synchronously so the tid is never actually exchanged, but
/// the type exists so a real transport can multiplex outstanding long
/// commands without changing this trait.
pub type Tid = u16;

/// Result of an offloaded directory walk (`path_lookup`).
#[derive(Debug, Clone, Default)]
pub struct PathLookupResult {
    /// ino resolved at each path component, root-to-leaf.
    pub per_level_inos: Vec<u64>,
    /// Block index of the terminal dentry, if the full path resolved.
    pub dentry_blk_idx: Option<u32>,
    /// Bit position of the terminal dentry within its block's bitmap.
    pub dentry_bitpos: Option<u32>,
    /// Candidate create position, returned when the terminal dentry is absent.
    pub create_hint: Option<(u32, u32)>,
}

/// Result of an offloaded index-tree walk (`filemapping_search`).
#[derive(Debug, Clone, Default)]
pub struct FileMappingResult {
    /// Remaining node chain from the first missed nid down to the leaf,
    /// each entry already carrying its parent nid so host-side parent
    /// pinning can be established in order.
    pub node_pages: Vec<NodePage>,
}

/// One raw 4 KiB node block plus the metadata the host needs to place it
/// in the node cache.
#[derive(Clone)]
pub struct NodePage {
    pub nid: Nid,
    pub parent_nid: Nid,
    pub offset_within_tree: u32,
    pub lpa: Lpa,
    pub data: Box<[u8; BLOCK_SIZE]>,
}

impl std::fmt::Debug for NodePage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodePage")
            .field("nid", &self.nid)
            .field("parent_nid", &self.parent_nid)
            .field("offset_within_tree", &self.offset_within_tree)
            .field("lpa", &self.lpa)
            .finish()
    }
}

/// The device contract. Every method that touches hardware is synchronous
/// from the caller's point of view — on real hardware an async variant
/// would be layered underneath and the caller would suspend on CQE
/// polling, but that transport plumbing is explicitly out of scope for the
/// core; callers here simply block.
pub trait Device: Send + Sync {
    /// Read one 4 KiB block.
    fn read_block(&self, lpa: Lpa, buf: &mut [u8; BLOCK_SIZE]) -> Result<()>;

    /// Write one 4 KiB block.
    fn write_block(&self, lpa: Lpa, buf: &[u8; BLOCK_SIZE]) -> Result<()>;

    /// Offloaded directory walk: resolve `path` starting at `start_ino`,
    /// descending at most `depth` components.
    fn path_lookup(&self, start_ino: u64, path: &str, depth: u32) -> Result<PathLookupResult>;

    /// Offloaded index-tree walk: resolve the node chain for `blkno` within
    /// `ino`, starting the search at `start_nid` (the first node already
    /// missing from the host cache). `return_all_levels` mirrors the wire
    /// command's flag; the core always passes `true`.
    fn filemapping_search(
        &self,
        ino: u64,
        start_nid: Nid,
        blkno: u64,
        return_all_levels: bool,
    ) -> Result<FileMappingResult>;

    /// Hand ownership of `nblocks` starting at `origin_lpa` to the SSD's
    /// apply pipeline.
    fn update_metajournal_tail(&self, origin_lpa: Lpa, nblocks: u32) -> Result<()>;

    /// The SSD's current apply position in the meta-journal ring.
    fn get_metajournal_head(&self) -> Result<u64>;

    /// Lifecycle control used by mkfs/init shims, not by the core proper.
    fn fs_module_init(&self) -> Result<()>;
    fn fs_db_init(&self) -> Result<()>;
    fn fs_recover_from_db(&self) -> Result<()>;
    fn clear_metajournal(&self) -> Result<()>;
    fn start_apply_journal(&self) -> Result<()>;
    fn stop_apply_journal(&self) -> Result<()>;
}
