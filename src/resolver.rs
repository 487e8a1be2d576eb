//! File-mapping resolver and file resizer. Builds on the node
//! cache: `locate` walks the 4-level index tree, offloading to the vendor
//! `filemapping_search` command on the first miss along the path; `reduce`
//! walks the same tree backward to release blocks above a new, smaller size.

use crate::cache::node::NodeCache;
use crate::error::{CoreError, CoreResult};
use crate::super_mgr::SuperManager;
use device::wire::*;
use device::{Device, Lpa, Nid, BLOCK_SIZE, INVALID_LPA, INVALID_NID};

/// Where block `blkno` of a file lives: the node holding its direct
/// pointer, and the slot within that node. `None` means the block is a
/// hole — no node in the path has been allocated for it yet.
#[derive(Debug, Clone, Copy)]
pub struct Located {
    pub leaf_nid: Nid,
    pub offset_in_leaf: usize,
}

pub(crate) fn ensure_inode_loaded(nodes: &mut NodeCache, sm: &mut SuperManager, device: &dyn Device, ino: Nid) -> CoreResult<()> {
    if nodes.contains(&ino) {
        return Ok(());
    }
    let lpa = sm.nat_block_addr(ino)?;
    if lpa == INVALID_LPA {
        return Err(CoreError::IoError(anyhow::anyhow!("ino {} has no node block", ino)));
    }
    let mut buf = Box::new([0u8; BLOCK_SIZE]);
    device.read_block(lpa, &mut buf).map_err(CoreError::IoError)?;
    nodes.insert(ino, buf, INVALID_NID, 0);
    Ok(())
}

fn tree_base(step: TreeStep) -> u64 {
    let t = block_range_thresholds();
    let l = INDEX_ENTRIES as u64;
    match step.sub_nid_slot {
        SUBNID_DIRECT1 => t[1],
        SUBNID_DIRECT2 => t[1] + l,
        SUBNID_INDIRECT1 => t[2],
        SUBNID_INDIRECT2 => t[2] + l * l,
        _ => t[3],
    }
}

/// Resolves `(ino, blkno)` to the node holding its direct pointer, loading
/// every node on the path into the cache (offloading to the SSD on the
/// first miss). Returns `None` for a hole: some node on the path has never
/// been allocated.
pub fn locate(
    nodes: &mut NodeCache,
    sm: &mut SuperManager,
    device: &dyn Device,
    ino: Nid,
    blkno: u64,
) -> CoreResult<Option<Located>> {
    ensure_inode_loaded(nodes, sm, device, ino)?;

    let step = match locate_block(blkno) {
        None => return Ok(Some(Located { leaf_nid: ino, offset_in_leaf: blkno as usize })),
        Some(s) => s,
    };

    let sub_nid = read_sub_nid(&nodes.get(&ino).unwrap().data, step.sub_nid_slot);
    if sub_nid == INVALID_NID {
        return Ok(None);
    }

    let remaining = blkno - tree_base(step);
    let mut cur_nid = sub_nid;
    let mut level_from_leaf = step.index_levels - 1;

    loop {
        if !nodes.contains(&cur_nid) {
            let result = device
                .filemapping_search(ino as u64, cur_nid, blkno, true)
                .map_err(CoreError::IoError)?;
            for page in result.node_pages {
                if !nodes.contains(&page.nid) {
                    nodes.insert(page.nid, page.data, page.parent_nid, page.offset_within_tree);
                }
            }
            if !nodes.contains(&cur_nid) {
                // The SSD has no record of this nid either: a hole below
                // what the host already resolved locally.
                return Ok(None);
            }
        }

        if level_from_leaf == 0 {
            let idx = entry_index(remaining, 0);
            return Ok(Some(Located { leaf_nid: cur_nid, offset_in_leaf: idx }));
        }

        let idx = entry_index(remaining, level_from_leaf);
        let child_nid = read_index_entry(&nodes.get(&cur_nid).unwrap().data, idx);
        if child_nid == INVALID_NID {
            return Ok(None);
        }
        cur_nid = child_nid;
        level_from_leaf -= 1;
    }
}

/// Reads the data LPA at `blkno`, or `INVALID_LPA` for a hole.
pub fn read_lpa(nodes: &mut NodeCache, sm: &mut SuperManager, device: &dyn Device, ino: Nid, blkno: u64) -> CoreResult<Lpa> {
    match locate(nodes, sm, device, ino, blkno)? {
        None => Ok(INVALID_LPA),
        Some(loc) if loc.leaf_nid == ino && locate_block(blkno).is_none() => {
            Ok(read_direct_ptr(&nodes.get(&ino).unwrap().data, loc.offset_in_leaf))
        }
        Some(loc) => Ok(read_index_entry(&nodes.get(&loc.leaf_nid).unwrap().data, loc.offset_in_leaf)),
    }
}

/// Writes a data LPA at `blkno`, allocating a fresh leaf/index-node chain
/// when the path is a hole. Marks every touched node dirty.
pub fn write_lpa(
    nodes: &mut NodeCache,
    sm: &mut SuperManager,
    device: &dyn Device,
    ino: Nid,
    blkno: u64,
    lpa: Lpa,
) -> CoreResult<()> {
    ensure_inode_loaded(nodes, sm, device, ino)?;

    let step = match locate_block(blkno) {
        None => {
            let entry = nodes.get_mut_dirty(&ino).unwrap();
            write_direct_ptr(&mut entry.data, blkno as usize, lpa);
            return Ok(());
        }
        Some(s) => s,
    };

    let remaining = blkno - tree_base(step);
    let mut sub_nid = read_sub_nid(&nodes.get(&ino).unwrap().data, step.sub_nid_slot);
    let mut parent_nid = ino;
    let mut parent_slot = step.sub_nid_slot;

    if sub_nid == INVALID_NID {
        sub_nid = alloc_index_node(nodes, sm, device, ino, step.sub_nid_slot as u32)?;
        write_sub_nid(&mut nodes.get_mut_dirty(&ino).unwrap().data, step.sub_nid_slot, sub_nid);
    }

    let mut cur_nid = sub_nid;
    let mut level_from_leaf = step.index_levels - 1;
    loop {
        if !nodes.contains(&cur_nid) {
            let lpa_cur = sm.nat_block_addr(cur_nid)?;
            let mut buf = Box::new([0u8; BLOCK_SIZE]);
            device.read_block(lpa_cur, &mut buf).map_err(CoreError::IoError)?;
            nodes.insert(cur_nid, buf, parent_nid, parent_slot as u32);
        }

        if level_from_leaf == 0 {
            let idx = entry_index(remaining, 0);
            write_index_entry(&mut nodes.get_mut_dirty(&cur_nid).unwrap().data, idx, lpa);
            return Ok(());
        }

        let idx = entry_index(remaining, level_from_leaf);
        let mut child_nid = read_index_entry(&nodes.get(&cur_nid).unwrap().data, idx);
        if child_nid == INVALID_NID {
            child_nid = alloc_index_node(nodes, sm, device, cur_nid, idx as u32)?;
            write_index_entry(&mut nodes.get_mut_dirty(&cur_nid).unwrap().data, idx, child_nid);
        }
        parent_nid = cur_nid;
        parent_slot = idx;
        cur_nid = child_nid;
        level_from_leaf -= 1;
    }
}

fn alloc_index_node(nodes: &mut NodeCache, sm: &mut SuperManager, device: &dyn Device, parent_nid: Nid, offset_within_tree: u32) -> CoreResult<Nid> {
    let nid = sm.alloc_nid()?;
    let lpa = sm.alloc_block(crate::super_mgr::AllocKind::Node)?;
    let mut buf = Box::new([0u8; BLOCK_SIZE]);
    let footer = NodeFooter { nid, ino: INVALID_NID, offset_within_tree, next_blkaddr_unused: 0 };
    write_node_footer(&mut buf, &footer);
    device.write_block(lpa, &buf).map_err(CoreError::IoError)?;
    sm.set_nat_block_addr(nid, parent_nid, lpa)?;
    nodes.insert(nid, buf, parent_nid, offset_within_tree);
    Ok(nid)
}

/// Releases blocks in `(tar_size/4096, ceil(old_size/4096)]` by clearing
/// their direct pointers, and frees any index node left with no valid
/// entries, cascading upward. Does not invalidate data LPAs — the caller
/// must have invalidated each one via `super_mgr::invalidate_lpa` first,
/// keeping a single owner of SIT-entry mutation.
pub fn reduce(nodes: &mut NodeCache, sm: &mut SuperManager, device: &dyn Device, ino: Nid, tar_size: u64, old_size: u64) -> CoreResult<()> {
    if old_size == 0 {
        return Ok(());
    }
    let tar_blk = tar_size / BLOCK_SIZE as u64;
    let old_last_blk = (old_size - 1) / BLOCK_SIZE as u64;
    assert!(old_last_blk >= tar_blk, "reduce requires old_size's last block, not an arbitrary one");

    for blkno in (tar_blk..=old_last_blk).rev() {
        if blkno * BLOCK_SIZE as u64 <= tar_size && blkno == tar_blk && tar_size % BLOCK_SIZE as u64 != 0 {
            continue; // the partially-retained block at tar_size is not released
        }
        reduce_one_block(nodes, sm, device, ino, blkno)?;
    }
    Ok(())
}

fn reduce_one_block(nodes: &mut NodeCache, sm: &mut SuperManager, device: &dyn Device, ino: Nid, blkno: u64) -> CoreResult<()> {
    ensure_inode_loaded(nodes, sm, device, ino)?;
    if locate_block(blkno).is_none() {
        let entry = nodes.get_mut_dirty(&ino).unwrap();
        write_direct_ptr(&mut entry.data, blkno as usize, INVALID_LPA);
        return Ok(());
    }

    let located = match locate(nodes, sm, device, ino, blkno)? {
        None => return Ok(()), // already a hole
        Some(l) => l,
    };
    {
        let entry = nodes.get_mut_dirty(&located.leaf_nid).unwrap();
        write_index_entry(&mut entry.data, located.offset_in_leaf, INVALID_LPA);
    }
    free_if_empty(nodes, sm, device, ino, located.leaf_nid)
}

fn node_is_empty(data: &[u8; BLOCK_SIZE]) -> bool {
    (0..INDEX_ENTRIES).all(|i| read_index_entry(data, i) == INVALID_LPA)
}

/// If `nid`'s index node has no remaining valid entries, clears its
/// parent's pointer to it, frees its nid, and checks the parent in turn.
/// Never frees `ino` itself — the cascade always stops once it reaches
/// the inode's sub-nid slot.
fn free_if_empty(nodes: &mut NodeCache, sm: &mut SuperManager, device: &dyn Device, ino: Nid, nid: Nid) -> CoreResult<()> {
    let (parent_nid, offset_within_tree, empty) = {
        let entry = nodes.get(&nid).unwrap();
        (entry.parent_nid, entry.offset_within_tree, node_is_empty(&entry.data))
    };
    if !empty {
        return Ok(());
    }
    let own_lpa = sm.nat_block_addr(nid)?;
    sm.invalidate_lpa(own_lpa)?;
    sm.free_nid(nid)?;
    nodes.clear_dirty(&nid);
    nodes.evict_clean(&nid);

    let parent_is_inode = parent_nid == ino;
    let entry = nodes.get_mut_dirty(&parent_nid).unwrap();
    if parent_is_inode {
        write_sub_nid(&mut entry.data, offset_within_tree as usize, INVALID_NID);
        Ok(())
    } else {
        write_index_entry(&mut entry.data, offset_within_tree as usize, INVALID_NID);
        free_if_empty(nodes, sm, device, ino, parent_nid)
    }
}

/// `expand(ino, tar_size)` only ever updates `i_size`: new blocks are holes
/// until written, so there is no tree work to do here. Kept as a named
/// entry point for symmetry with `reduce` and because a future caller
/// (e.g. `fallocate`) may need to pre-populate the range.
pub fn expand_is_size_only() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::node::NodeCache;
    use crate::super_mgr::SuperManager;
    use device::memory::MemoryDevice;
    use std::sync::Arc;

    fn fresh() -> (Arc<MemoryDevice>, SuperManager, NodeCache, Nid) {
        let dev = Arc::new(MemoryDevice::format(8, 64));
        let mut sm = SuperManager::mount(dev.clone(), 64).unwrap();
        let mut nodes = NodeCache::new(64);
        let ino = sm.alloc_nid().unwrap();
        let lpa = sm.alloc_block(crate::super_mgr::AllocKind::Node).unwrap();
        let buf = Box::new([0u8; BLOCK_SIZE]);
        dev.write_block(lpa, &buf).unwrap();
        sm.set_nat_block_addr(ino, ino, lpa).unwrap();
        nodes.insert(ino, buf, INVALID_NID, 0);
        (dev, sm, nodes, ino)
    }

    #[test]
    fn direct_block_write_then_read_round_trips() {
        let (dev, mut sm, mut nodes, ino) = fresh();
        write_lpa(&mut nodes, &mut sm, dev.as_ref(), ino, 5, 999).unwrap();
        assert_eq!(read_lpa(&mut nodes, &mut sm, dev.as_ref(), ino, 5).unwrap(), 999);
    }

    #[test]
    fn hole_reads_as_invalid_lpa() {
        let (dev, mut sm, mut nodes, ino) = fresh();
        assert_eq!(read_lpa(&mut nodes, &mut sm, dev.as_ref(), ino, 5).unwrap(), INVALID_LPA);
    }

    #[test]
    fn indirect_block_allocates_index_node_and_round_trips() {
        let (dev, mut sm, mut nodes, ino) = fresh();
        let blkno = INODE_DIRECT_COUNT as u64 + 3;
        write_lpa(&mut nodes, &mut sm, dev.as_ref(), ino, blkno, 777).unwrap();
        assert_eq!(read_lpa(&mut nodes, &mut sm, dev.as_ref(), ino, blkno).unwrap(), 777);
    }

    #[test]
    fn reduce_clears_direct_pointer() {
        let (dev, mut sm, mut nodes, ino) = fresh();
        write_lpa(&mut nodes, &mut sm, dev.as_ref(), ino, 2, 42).unwrap();
        reduce(&mut nodes, &mut sm, dev.as_ref(), ino, 0, 3 * BLOCK_SIZE as u64).unwrap();
        assert_eq!(read_lpa(&mut nodes, &mut sm, dev.as_ref(), ino, 2).unwrap(), INVALID_LPA);
    }
}
