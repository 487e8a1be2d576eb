//! Shared address types. These cross the core/device boundary so they live
//! here rather than in the core crate.

/// 4 KiB logical page address.
pub type Lpa = u32;
/// Node id: identifies an inode or index node uniquely in NAT.
pub type Nid = u32;
/// Segment id.
pub type SegId = u32;

pub const BLOCK_SIZE: usize = 4096;
pub const BLOCKS_PER_SEGMENT: usize = 512;
pub const SEGMENT_SIZE: usize = BLOCK_SIZE * BLOCKS_PER_SEGMENT;

pub const INVALID_LPA: Lpa = 0;
pub const INVALID_NID: Nid = 0;
pub const INVALID_SEGID: SegId = 0;

pub const HSCFS_MAGIC_NUMBER: u32 = 0x48_53_43_46; // "HSCF"
