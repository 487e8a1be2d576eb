//! Super block state, the SIT/NAT caches, and the nid/LPA/segment allocator
//! built on top of them. Everything in here runs under
//! `fs_meta_lock`; callers never reach `device` directly for allocation
//! decisions, only for the block I/O the allocator or a cache miss decides
//! it needs.

use crate::cache::sit_nat::{NatCache, SitCache};
use crate::error::{CoreError, CoreResult};
use device::wire::*;
use device::{Device, Lpa, Nid, SegId, BLOCK_SIZE, INVALID_LPA, INVALID_NID, INVALID_SEGID};
use std::sync::Arc;

/// Which append cursor a newly allocated block belongs to. Node blocks and
/// data blocks are written to separate active segments so GC can reclaim
/// the two populations independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocKind {
    Node,
    Data,
}

pub struct SuperManager {
    device: Arc<dyn Device>,
    sb: SuperBlockOnDisk,
    sb_dirty: bool,
    super_journal: Vec<(u32, u32)>,
    uncommit_node_segs: Vec<SegId>,
    uncommit_data_segs: Vec<SegId>,
    pub sit: SitCache,
    pub nat: NatCache,
}

impl SuperManager {
    /// Reads the super block at lpa 0 and starts with empty SIT/NAT caches;
    /// entries are pulled in lazily as nids/segids are touched.
    pub fn mount(device: Arc<dyn Device>, meta_cache_size: usize) -> CoreResult<Self> {
        let mut buf = [0u8; BLOCK_SIZE];
        device.read_block(0, &mut buf).map_err(CoreError::IoError)?;
        use zerocopy::FromBytes;
        let sb = SuperBlockOnDisk::read_from(&buf[..std::mem::size_of::<SuperBlockOnDisk>()])
            .expect("super block slice sized correctly");
        if !sb.magic_matched() {
            return Err(CoreError::IoError(anyhow::anyhow!("super block magic mismatch")));
        }
        Ok(Self {
            device,
            sb,
            sb_dirty: false,
            super_journal: vec![],
            uncommit_node_segs: vec![],
            uncommit_data_segs: vec![],
            sit: SitCache::new(meta_cache_size),
            nat: NatCache::new(meta_cache_size),
        })
    }

    pub fn sb(&self) -> &SuperBlockOnDisk {
        &self.sb
    }

    pub fn sb_dirty(&self) -> bool {
        self.sb_dirty
    }

    pub fn write_back_super(&mut self) -> CoreResult<()> {
        if !self.sb_dirty {
            return Ok(());
        }
        let mut buf = [0u8; BLOCK_SIZE];
        use zerocopy::AsBytes;
        buf[..std::mem::size_of::<SuperBlockOnDisk>()].copy_from_slice(self.sb.as_bytes());
        self.device.write_block(0, &buf).map_err(CoreError::IoError)?;
        self.sb_dirty = false;
        Ok(())
    }

    /// Drains the SUPER journal entries accumulated by allocator mutations
    /// since the last commit, for `commit_pending` to fold into the
    /// transaction's [`crate::journal::JournalContainer`].
    pub fn take_super_journal(&mut self) -> Vec<(u32, u32)> {
        std::mem::take(&mut self.super_journal)
    }

    pub fn take_uncommit_node_segs(&mut self) -> Vec<SegId> {
        std::mem::take(&mut self.uncommit_node_segs)
    }

    pub fn take_uncommit_data_segs(&mut self) -> Vec<SegId> {
        std::mem::take(&mut self.uncommit_data_segs)
    }

    /// Records a mutated super-block cursor both in memory and as a
    /// `(offset_within_super, new_value)` SUPER journal entry.
    fn journal_super(&mut self, offset: u32, value: u32) {
        self.super_journal.push((offset, value));
        self.sb_dirty = true;
    }

    fn segid_of_lpa(&self, lpa: Lpa) -> SegId {
        (lpa - self.sb.main_start_lpa) / device::BLOCKS_PER_SEGMENT as u32 + 1
    }

    fn offset_in_segment(&self, lpa: Lpa) -> usize {
        ((lpa - self.sb.main_start_lpa) % device::BLOCKS_PER_SEGMENT as u32) as usize
    }

    fn lpa_of(&self, segid: SegId, blkoff: u32) -> Lpa {
        self.sb.main_start_lpa + (segid - 1) * device::BLOCKS_PER_SEGMENT as u32 + blkoff
    }

    fn ensure_sit_loaded(&mut self, segid: SegId) -> CoreResult<()> {
        if self.sit.get(&segid).is_some() {
            return Ok(());
        }
        let (lpa, idx) = sit_lpa_for_segid(self.sb.sit_start_lpa, segid);
        let mut buf = [0u8; BLOCK_SIZE];
        self.device.read_block(lpa, &mut buf).map_err(CoreError::IoError)?;
        self.sit.load(segid, read_sit_entry(&buf, idx));
        Ok(())
    }

    fn ensure_nat_loaded(&mut self, nid: Nid) -> CoreResult<()> {
        if self.nat.get(&nid).is_some() {
            return Ok(());
        }
        let (lpa, idx) = nat_lpa_for_nid(self.sb.nat_start_lpa, nid);
        let mut buf = [0u8; BLOCK_SIZE];
        self.device.read_block(lpa, &mut buf).map_err(CoreError::IoError)?;
        self.nat.load(nid, read_nat_entry(&buf, idx));
        Ok(())
    }

    /// Pops the head of the on-disk free-nid list.
    pub fn alloc_nid(&mut self) -> CoreResult<Nid> {
        let nid = self.sb.next_free_nid;
        if nid == INVALID_NID {
            return Err(CoreError::NoFreeNid);
        }
        self.ensure_nat_loaded(nid)?;
        let next = self.nat.get(&nid).unwrap().block_addr;
        self.sb.next_free_nid = next;
        self.journal_super(SUPER_NEXT_FREE_NID_OFFSET, next);
        self.nat.update(&nid, |e| {
            e.ino = nid; // marks allocated: is_free() is false once ino != INVALID_NID
            e.block_addr = INVALID_LPA;
        });
        Ok(nid)
    }

    /// Returns `nid` to the free list head. Used when an allocation that
    /// consumed a nid fails partway through and must be unwound.
    pub fn free_nid(&mut self, nid: Nid) -> CoreResult<()> {
        self.ensure_nat_loaded(nid)?;
        let old_head = self.sb.next_free_nid;
        self.nat.update(&nid, |e| {
            e.ino = INVALID_NID;
            e.block_addr = old_head;
        });
        self.sb.next_free_nid = nid;
        self.journal_super(SUPER_NEXT_FREE_NID_OFFSET, nid);
        Ok(())
    }

    /// Records `nid`'s current node block address, as either an inode
    /// (`owner == nid`) or an index node owned by `owner`.
    pub fn set_nat_block_addr(&mut self, nid: Nid, owner: Nid, lpa: Lpa) -> CoreResult<()> {
        self.ensure_nat_loaded(nid)?;
        self.nat.update(&nid, |e| {
            e.ino = owner;
            e.block_addr = lpa;
        });
        Ok(())
    }

    pub fn nat_block_addr(&mut self, nid: Nid) -> CoreResult<Lpa> {
        self.ensure_nat_loaded(nid)?;
        Ok(self.nat.get(&nid).unwrap().block_addr)
    }

    /// Pops a free segment off the SIT free-segment chain and makes it the
    /// active append segment for `kind`, threading the segment it replaces
    /// onto that kind's segment list.
    fn alloc_new_segment(&mut self, kind: AllocKind) -> CoreResult<SegId> {
        let segid = self.sb.first_free_segment_id;
        if segid == INVALID_SEGID {
            return Err(CoreError::NoFreeSegment);
        }
        self.ensure_sit_loaded(segid)?;
        let next = self.sit.get(&segid).unwrap().next_seg();
        self.sb.first_free_segment_id = next;
        self.journal_super(SUPER_FIRST_FREE_SEGMENT_ID_OFFSET, next);
        self.sb.free_segment_count -= 1;
        self.journal_super(SUPER_FREE_SEGMENT_COUNT_OFFSET, self.sb.free_segment_count);
        self.sit.update(&segid, |e| e.set_next_seg(INVALID_SEGID));
        match kind {
            AllocKind::Node => self.add_to_node_segment_list(segid)?,
            AllocKind::Data => self.add_to_data_segment_list(segid)?,
        }
        Ok(segid)
    }

    /// Appends `segid` to the node segment list: the previously active node
    /// segment (now full) has its SIT `next_seg` threaded to `segid` and is
    /// pushed onto `uncommit_node_segs` for the replace-protect manager to
    /// replay into the list on SSD apply; `segid` becomes the new active
    /// node segment.
    fn add_to_node_segment_list(&mut self, segid: SegId) -> CoreResult<()> {
        let prev = self.sb.current_node_segment_id;
        if prev != INVALID_SEGID {
            self.ensure_sit_loaded(prev)?;
            self.sit.update(&prev, |e| e.set_next_seg(segid));
            self.uncommit_node_segs.push(prev);
        } else {
            self.sb.first_node_segment_id = segid;
            self.journal_super(SUPER_FIRST_NODE_SEGMENT_ID_OFFSET, segid);
        }
        self.sb.current_node_segment_id = segid;
        self.journal_super(SUPER_CURRENT_NODE_SEGMENT_ID_OFFSET, segid);
        self.sb.current_node_segment_blkoff = 0;
        self.journal_super(SUPER_CURRENT_NODE_SEGMENT_BLKOFF_OFFSET, 0);
        Ok(())
    }

    /// Data-segment-list counterpart of [`Self::add_to_node_segment_list`].
    fn add_to_data_segment_list(&mut self, segid: SegId) -> CoreResult<()> {
        let prev = self.sb.current_data_segment_id;
        if prev != INVALID_SEGID {
            self.ensure_sit_loaded(prev)?;
            self.sit.update(&prev, |e| e.set_next_seg(segid));
            self.uncommit_data_segs.push(prev);
        } else {
            self.sb.first_data_segment_id = segid;
            self.journal_super(SUPER_FIRST_DATA_SEGMENT_ID_OFFSET, segid);
        }
        self.sb.current_data_segment_id = segid;
        self.journal_super(SUPER_CURRENT_DATA_SEGMENT_ID_OFFSET, segid);
        self.sb.current_data_segment_blkoff = 0;
        self.journal_super(SUPER_CURRENT_DATA_SEGMENT_BLKOFF_OFFSET, 0);
        Ok(())
    }

    /// Allocates the next append-log block for `kind`, rolling to a fresh
    /// segment first if the active one is exhausted, and marks the block
    /// valid in its segment's SIT bitmap.
    pub fn alloc_block(&mut self, kind: AllocKind) -> CoreResult<Lpa> {
        let (segid, blkoff) = match kind {
            AllocKind::Node => (self.sb.current_node_segment_id, self.sb.current_node_segment_blkoff),
            AllocKind::Data => (self.sb.current_data_segment_id, self.sb.current_data_segment_blkoff),
        };
        let segid = if segid == INVALID_SEGID || blkoff as usize >= device::BLOCKS_PER_SEGMENT {
            self.alloc_new_segment(kind)?
        } else {
            segid
        };
        let blkoff = match kind {
            AllocKind::Node => self.sb.current_node_segment_blkoff,
            AllocKind::Data => self.sb.current_data_segment_blkoff,
        };
        let lpa = self.lpa_of(segid, blkoff);
        self.ensure_sit_loaded(segid)?;
        self.sit.update(&segid, |e| {
            e.set_bit(blkoff as usize);
            e.set_vblocks(e.vblocks() + 1);
        });
        match kind {
            AllocKind::Node => {
                self.sb.current_node_segment_blkoff += 1;
                self.journal_super(SUPER_CURRENT_NODE_SEGMENT_BLKOFF_OFFSET, self.sb.current_node_segment_blkoff);
            }
            AllocKind::Data => {
                self.sb.current_data_segment_blkoff += 1;
                self.journal_super(SUPER_CURRENT_DATA_SEGMENT_BLKOFF_OFFSET, self.sb.current_data_segment_blkoff);
            }
        }
        Ok(lpa)
    }

    /// Marks a previously valid block as invalid (its out-of-place
    /// successor has already been allocated elsewhere). Used on every
    /// rewrite and on truncate/delete.
    pub fn invalidate_lpa(&mut self, lpa: Lpa) -> CoreResult<()> {
        if lpa == INVALID_LPA {
            return Ok(());
        }
        let segid = self.segid_of_lpa(lpa);
        let off = self.offset_in_segment(lpa);
        self.ensure_sit_loaded(segid)?;
        self.sit.update(&segid, |e| {
            if e.bit(off) {
                e.clear_bit(off);
                e.set_vblocks(e.vblocks().saturating_sub(1));
            }
        });
        Ok(())
    }

    pub fn read_block(&self, lpa: Lpa) -> CoreResult<Box<[u8; BLOCK_SIZE]>> {
        let mut buf = Box::new([0u8; BLOCK_SIZE]);
        self.device.read_block(lpa, &mut buf).map_err(CoreError::IoError)?;
        Ok(buf)
    }

    pub fn write_block(&self, lpa: Lpa, buf: &[u8; BLOCK_SIZE]) -> CoreResult<()> {
        self.device.write_block(lpa, buf).map_err(CoreError::IoError)
    }

    /// Flushes every dirty SIT/NAT entry plus the super block itself to
    /// their home blocks, read-modify-write since several entries share a
    /// block. Called from the full-writeback path, never the hot path.
    pub fn write_back_all_dirty(&mut self) -> CoreResult<()> {
        for segid in self.sit.dirty_segids() {
            if !self.sit.is_dirty(&segid) {
                continue;
            }
            let (lpa, idx) = sit_lpa_for_segid(self.sb.sit_start_lpa, segid);
            let mut buf = self.read_block(lpa)?;
            write_sit_entry(&mut buf, idx, &self.sit.get(&segid).unwrap());
            self.write_block(lpa, &buf)?;
            self.sit.clear_dirty(&segid);
        }
        for nid in self.nat.dirty_nids() {
            if !self.nat.is_dirty(&nid) {
                continue;
            }
            let (lpa, idx) = nat_lpa_for_nid(self.sb.nat_start_lpa, nid);
            let mut buf = self.read_block(lpa)?;
            write_nat_entry(&mut buf, idx, &self.nat.get(&nid).unwrap());
            self.write_block(lpa, &buf)?;
            self.nat.clear_dirty(&nid);
        }
        self.write_back_super()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use device::memory::MemoryDevice;

    fn mounted(segments: u32, nids: u32) -> SuperManager {
        let dev: Arc<dyn Device> = Arc::new(MemoryDevice::format(segments, nids));
        SuperManager::mount(dev, 64).unwrap()
    }

    #[test]
    fn alloc_nid_consumes_the_free_list_in_order() {
        let mut sm = mounted(4, 4);
        assert_eq!(sm.alloc_nid().unwrap(), 1);
        assert_eq!(sm.alloc_nid().unwrap(), 2);
        assert_eq!(sm.alloc_nid().unwrap(), 3);
        assert_eq!(sm.alloc_nid().unwrap(), 4);
        assert!(matches!(sm.alloc_nid(), Err(CoreError::NoFreeNid)));
    }

    #[test]
    fn free_nid_returns_to_head_for_reuse() {
        let mut sm = mounted(4, 4);
        let a = sm.alloc_nid().unwrap();
        sm.free_nid(a).unwrap();
        assert_eq!(sm.alloc_nid().unwrap(), a);
    }

    #[test]
    fn alloc_block_rolls_segments_when_exhausted() {
        let mut sm = mounted(2, 4);
        let per_seg = device::BLOCKS_PER_SEGMENT as u32;
        let first = sm.alloc_block(AllocKind::Data).unwrap();
        for _ in 1..per_seg {
            sm.alloc_block(AllocKind::Data).unwrap();
        }
        let rolled = sm.alloc_block(AllocKind::Data).unwrap();
        assert_ne!(sm.segid_of_lpa(first), sm.segid_of_lpa(rolled));
    }

    #[test]
    fn invalidate_lpa_decrements_vblocks() {
        let mut sm = mounted(2, 4);
        let lpa = sm.alloc_block(AllocKind::Node).unwrap();
        let segid = sm.segid_of_lpa(lpa);
        assert_eq!(sm.sit.get(&segid).unwrap().vblocks(), 1);
        sm.invalidate_lpa(lpa).unwrap();
        assert_eq!(sm.sit.get(&segid).unwrap().vblocks(), 0);
    }

    #[test]
    fn node_segment_list_threads_through_sit_next_seg_and_is_acyclic() {
        let mut sm = mounted(4, 4);
        let per_seg = device::BLOCKS_PER_SEGMENT as u32;
        let first_lpa = sm.alloc_block(AllocKind::Node).unwrap();
        let first_seg = sm.segid_of_lpa(first_lpa);
        for _ in 1..per_seg {
            sm.alloc_block(AllocKind::Node).unwrap();
        }
        let second_lpa = sm.alloc_block(AllocKind::Node).unwrap();
        let second_seg = sm.segid_of_lpa(second_lpa);
        assert_ne!(first_seg, second_seg);
        assert_eq!(sm.sb().first_node_segment_id, first_seg);
        assert_eq!(sm.sb().current_node_segment_id, second_seg);
        assert_eq!(sm.sit.get(&first_seg).unwrap().next_seg(), second_seg);
        assert_eq!(sm.sit.get(&second_seg).unwrap().next_seg(), INVALID_SEGID);

        // walk the list from the head; a cycle would loop forever
        let mut seen = vec![];
        let mut cur = sm.sb().first_node_segment_id;
        while cur != INVALID_SEGID {
            assert!(!seen.contains(&cur), "node segment list must be acyclic");
            seen.push(cur);
            cur = sm.sit.get(&cur).unwrap().next_seg();
        }
        assert_eq!(seen, vec![first_seg, second_seg]);
        assert_eq!(sm.take_uncommit_node_segs(), vec![first_seg]);
    }

    #[test]
    fn alloc_journals_super_cursor_mutations() {
        let mut sm = mounted(4, 4);
        sm.alloc_nid().unwrap();
        let journal = sm.take_super_journal();
        assert!(journal.contains(&(SUPER_NEXT_FREE_NID_OFFSET, sm.sb().next_free_nid)));
    }
}
