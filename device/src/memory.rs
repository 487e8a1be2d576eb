//! In-process software emulation of the vendor SSD, backing every
//! core-level test the way `MemoryDiskDriver`/`FileDiskDriver` backed the
//! ext2-style driver this crate's test suite grew out of.
//! `update_metajournal_tail` applies the handed-off journal range
//! synchronously — there is no real async latency to emulate here — so
//! `get_metajournal_head` always observes an up-to-date head.

use crate::types::*;
use crate::wire::*;
use crate::{Device, FileMappingResult, NodePage, PathLookupResult};
use anyhow::{anyhow, Result};
use std::sync::Mutex;

#[derive(Clone, Copy)]
struct Geometry {
    block_count: u32,
    sit_start_lpa: Lpa,
    nat_start_lpa: Lpa,
    journal_start_lpa: Lpa,
    journal_block_count: u32,
    srmap_start_lpa: Lpa,
    main_start_lpa: Lpa,
}

struct Inner {
    blocks: Vec<[u8; BLOCK_SIZE]>,
    geometry: Geometry,
    head_lpa: Lpa,
}

pub struct MemoryDevice {
    inner: Mutex<Inner>,
}

fn ceil_div(a: usize, b: usize) -> usize {
    (a + b - 1) / b
}

impl MemoryDevice {
    /// Formats a fresh in-memory filesystem: `segment_count` main-area
    /// segments, all free, threaded into one free-segment list, and
    /// `nat_entries` free nids threaded into one free-nid list. This plays
    /// the role mkfs plays for real hardware; it is test scaffolding, not
    /// part of the core.
    pub fn format(segment_count: u32, nat_entries: u32) -> Self {
        assert!(segment_count >= 1 && nat_entries >= 1);
        let sit_blocks = ceil_div(segment_count as usize, SIT_ENTRIES_PER_BLOCK) as u32;
        let nat_blocks = ceil_div(nat_entries as usize, NAT_ENTRIES_PER_BLOCK) as u32;
        let journal_block_count = 64u32;
        let srmap_blocks = segment_count; // reserved, not populated: no named SRMAP operation in scope
        let sit_start_lpa = 1;
        let nat_start_lpa = sit_start_lpa + sit_blocks;
        let journal_start_lpa = nat_start_lpa + nat_blocks;
        let srmap_start_lpa = journal_start_lpa + journal_block_count;
        let main_start_lpa = srmap_start_lpa + srmap_blocks;
        let block_count = main_start_lpa + segment_count * BLOCKS_PER_SEGMENT as u32;

        let geometry = Geometry {
            block_count,
            sit_start_lpa,
            nat_start_lpa,
            journal_start_lpa,
            journal_block_count,
            srmap_start_lpa,
            main_start_lpa,
        };

        let mut blocks = vec![[0u8; BLOCK_SIZE]; block_count as usize];

        for segid in 1..=segment_count {
            let (lpa, idx) = sit_lpa_for_segid(sit_start_lpa, segid);
            let mut entry = SitEntryOnDisk::default();
            entry.set_vblocks(0);
            entry.set_next_seg(if segid < segment_count { segid + 1 } else { INVALID_SEGID });
            write_sit_entry(&mut blocks[lpa as usize], idx, &entry);
        }
        for nid in 1..=nat_entries {
            let (lpa, idx) = nat_lpa_for_nid(nat_start_lpa, nid);
            let entry = NatEntryOnDisk {
                ino: INVALID_NID,
                block_addr: if nid < nat_entries { nid + 1 } else { INVALID_NID },
            };
            write_nat_entry(&mut blocks[lpa as usize], idx, &entry);
        }

        let sb = SuperBlockOnDisk {
            magic: HSCFS_MAGIC_NUMBER,
            block_count,
            segment_count,
            sit_start_lpa,
            nat_start_lpa,
            srmap_start_lpa,
            journal_start_lpa,
            journal_block_count,
            main_start_lpa,
            nat_count: nat_entries,
            first_free_segment_id: 1,
            first_node_segment_id: INVALID_SEGID,
            first_data_segment_id: INVALID_SEGID,
            current_node_segment_id: INVALID_SEGID,
            current_data_segment_id: INVALID_SEGID,
            current_node_segment_blkoff: BLOCKS_PER_SEGMENT as u32,
            current_data_segment_blkoff: BLOCKS_PER_SEGMENT as u32,
            meta_journal_start_blkoff: 0,
            meta_journal_end_blkoff: 0,
            free_segment_count: segment_count,
            next_free_nid: 1,
        };
        use zerocopy::AsBytes;
        blocks[0][..std::mem::size_of::<SuperBlockOnDisk>()].copy_from_slice(sb.as_bytes());

        Self { inner: Mutex::new(Inner { blocks, geometry, head_lpa: journal_start_lpa }) }
    }

    /// Applies every journal record found in `[origin_lpa, origin_lpa +
    /// nblocks)` directly to the SIT/NAT/super regions of the backing
    /// store, exactly as real SSD firmware would against its own metadata.
    fn apply_journal_range(inner: &mut Inner, origin_lpa: Lpa, nblocks: u32) -> Result<()> {
        let g = inner.geometry;
        let region_blocks = g.journal_block_count;
        for i in 0..nblocks {
            let lpa = g.journal_start_lpa + (origin_lpa - g.journal_start_lpa + i) % region_blocks;
            let block = inner.blocks[lpa as usize];
            let (records, _end) = decode_records(&block, 0);
            for rec in records {
                match rec.kind {
                    JournalRecordType::Sit => {
                        let (segid, entry) = unpack_sit_payload(&rec.payload);
                        let (sit_lpa, idx) = sit_lpa_for_segid(g.sit_start_lpa, segid);
                        write_sit_entry(&mut inner.blocks[sit_lpa as usize], idx, &entry);
                    }
                    JournalRecordType::Nat => {
                        let (nid, entry) = unpack_nat_payload(&rec.payload);
                        let (nat_lpa, idx) = nat_lpa_for_nid(g.nat_start_lpa, nid);
                        write_nat_entry(&mut inner.blocks[nat_lpa as usize], idx, &entry);
                    }
                    JournalRecordType::Super => {
                        let (offset, value) = unpack_super_payload(&rec.payload);
                        inner.blocks[0][offset as usize..offset as usize + 4].copy_from_slice(&value.to_le_bytes());
                    }
                    JournalRecordType::Nop | JournalRecordType::End => {}
                }
            }
        }
        Ok(())
    }

    fn root_inode_block(inner: &Inner, ino: u64) -> Result<[u8; BLOCK_SIZE]> {
        let g = inner.geometry;
        let (nat_lpa, idx) = nat_lpa_for_nid(g.nat_start_lpa, ino as Nid);
        let nat_entry = read_nat_entry(&inner.blocks[nat_lpa as usize], idx);
        if nat_entry.block_addr == INVALID_LPA {
            return Err(anyhow!("ino {} has no node block", ino));
        }
        Ok(inner.blocks[nat_entry.block_addr as usize])
    }
}

impl Device for MemoryDevice {
    fn read_block(&self, lpa: Lpa, buf: &mut [u8; BLOCK_SIZE]) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        let block = inner.blocks.get(lpa as usize).ok_or_else(|| anyhow!("lpa {} out of range", lpa))?;
        buf.copy_from_slice(block);
        Ok(())
    }

    fn write_block(&self, lpa: Lpa, buf: &[u8; BLOCK_SIZE]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let len = inner.blocks.len();
        let block = inner.blocks.get_mut(lpa as usize).ok_or_else(|| anyhow!("lpa {} out of range (len {})", lpa, len))?;
        block.copy_from_slice(buf);
        Ok(())
    }

    fn path_lookup(&self, start_ino: u64, path: &str, depth: u32) -> Result<PathLookupResult> {
        let inner = self.inner.lock().unwrap();
        let mut cur_ino = start_ino;
        let mut per_level_inos = vec![];
        let components: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut result = PathLookupResult::default();
        for (i, name) in components.iter().enumerate().take(depth as usize) {
            let dir_block = Self::root_inode_block(&inner, cur_ino)?;
            let mut found = None;
            for &direct in (0..INODE_DIRECT_COUNT).collect::<Vec<_>>().iter() {
                let lpa = read_direct_ptr(&dir_block, direct);
                if lpa == INVALID_LPA {
                    continue;
                }
                let data_block = inner.blocks[lpa as usize];
                for slot in 0..DENTRY_SLOTS {
                    if !dentry_bit(&data_block, slot) {
                        continue;
                    }
                    let e = read_dir_entry(&data_block, slot);
                    let width = dentry_slot_width(e.namelen as usize);
                    let raw = read_filename(&data_block, slot, width);
                    if &raw[..e.namelen as usize] == name.as_bytes() {
                        found = Some((e.ino as u64, direct as u32, slot as u32));
                        break;
                    }
                }
                if found.is_some() {
                    break;
                }
            }
            match found {
                Some((ino, blk_idx, bitpos)) => {
                    cur_ino = ino;
                    per_level_inos.push(ino);
                    if i + 1 == components.len() {
                        result.dentry_blk_idx = Some(blk_idx);
                        result.dentry_bitpos = Some(bitpos);
                    }
                }
                None => {
                    if i + 1 == components.len() {
                        result.create_hint = Some((0, 0));
                    }
                    break;
                }
            }
        }
        result.per_level_inos = per_level_inos;
        Ok(result)
    }

    fn filemapping_search(&self, ino: u64, start_nid: Nid, blkno: u64, _return_all_levels: bool) -> Result<FileMappingResult> {
        let inner = self.inner.lock().unwrap();
        let mut chain = vec![];
        let step = match locate_block(blkno) {
            None => return Ok(FileMappingResult { node_pages: vec![] }),
            Some(s) => s,
        };

        // Resolve from the inode's sub-nid slot down, starting the walk at
        // `start_nid` (the first node the host didn't already have cached).
        let inode_block = Self::root_inode_block(&inner, ino)?;
        let mut cur_nid = read_sub_nid(&inode_block, step.sub_nid_slot);
        if cur_nid == INVALID_NID {
            return Ok(FileMappingResult { node_pages: vec![] });
        }
        let mut parent_nid = ino as Nid;
        let t = block_range_thresholds();
        let l = INDEX_ENTRIES as u64;
        let base = match step.sub_nid_slot {
            SUBNID_DIRECT1 => t[1],
            SUBNID_DIRECT2 => t[1] + l,
            SUBNID_INDIRECT1 => t[2],
            SUBNID_INDIRECT2 => t[2] + l * l,
            _ => t[3],
        };
        let mut remaining = blkno - base;
        let mut resolving = cur_nid != start_nid && start_nid != INVALID_NID;
        // When start_nid already equals the first hop the host has it
        // cached; we still must walk through the remaining lower levels.
        let g = inner.geometry;
        for level in (0..step.index_levels).rev() {
            let (nat_lpa, idx) = nat_lpa_for_nid(g.nat_start_lpa, cur_nid);
            let nat_entry = read_nat_entry(&inner.blocks[nat_lpa as usize], idx);
            if nat_entry.block_addr == INVALID_LPA {
                break;
            }
            let block = inner.blocks[nat_entry.block_addr as usize];
            if resolving || cur_nid != start_nid {
                chain.push(NodePage {
                    nid: cur_nid,
                    parent_nid,
                    offset_within_tree: read_node_footer(&block).offset_within_tree,
                    lpa: nat_entry.block_addr,
                    data: Box::new(block),
                });
            }
            resolving = true;
            if level == 0 {
                break;
            }
            let entry_idx = entry_index(remaining, level);
            remaining %= l.pow(level);
            parent_nid = cur_nid;
            cur_nid = read_index_entry(&block, entry_idx);
            if cur_nid == INVALID_NID {
                return Ok(FileMappingResult { node_pages: chain });
            }
        }
        Ok(FileMappingResult { node_pages: chain })
    }

    fn update_metajournal_tail(&self, origin_lpa: Lpa, nblocks: u32) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::apply_journal_range(&mut inner, origin_lpa, nblocks)?;
        let region = inner.geometry.journal_block_count;
        let start = inner.geometry.journal_start_lpa;
        inner.head_lpa = start + (origin_lpa - start + nblocks) % region;
        Ok(())
    }

    fn get_metajournal_head(&self) -> Result<u64> {
        Ok(self.inner.lock().unwrap().head_lpa as u64)
    }

    fn fs_module_init(&self) -> Result<()> {
        Ok(())
    }
    fn fs_db_init(&self) -> Result<()> {
        Ok(())
    }
    fn fs_recover_from_db(&self) -> Result<()> {
        Ok(())
    }
    fn clear_metajournal(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let start = inner.geometry.journal_start_lpa;
        inner.head_lpa = start;
        Ok(())
    }
    fn start_apply_journal(&self) -> Result<()> {
        Ok(())
    }
    fn stop_apply_journal(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::FromBytes;

    #[test]
    fn format_writes_a_readable_super_block() {
        let dev = MemoryDevice::format(8, 64);
        let mut buf = [0u8; BLOCK_SIZE];
        dev.read_block(0, &mut buf).unwrap();
        let sb = SuperBlockOnDisk::read_from(&buf[..std::mem::size_of::<SuperBlockOnDisk>()]).unwrap();
        assert!(sb.magic_matched());
        assert_eq!(sb.segment_count, 8);
        assert_eq!(sb.free_segment_count, 8);
        assert_eq!(sb.next_free_nid, 1);
    }

    #[test]
    fn free_segment_list_is_acyclic_and_terminated() {
        let dev = MemoryDevice::format(4, 16);
        let inner = dev.inner.lock().unwrap();
        let g = inner.geometry;
        let mut seg = 1u32;
        let mut seen = std::collections::HashSet::new();
        loop {
            assert!(seen.insert(seg), "cycle in free segment list");
            let (lpa, idx) = sit_lpa_for_segid(g.sit_start_lpa, seg);
            let e = read_sit_entry(&inner.blocks[lpa as usize], idx);
            if e.next_seg() == INVALID_SEGID {
                break;
            }
            seg = e.next_seg();
        }
        assert_eq!(seen.len(), 4);
    }
}
