//! Directory layer: the TEA-derived name hash, extendible-hash bucket
//! arithmetic, and `lookup`/`create`/`remove`. `lookup` checks
//! the dentry cache first, then the offloaded `path_lookup` command;
//! `create`/`remove` work directly against dir-data blocks since they must
//! mutate bitmap/slot state the SSD cannot do on the host's behalf.

use crate::cache::dentry::DentryCache;
use crate::cache::dirdata::DirDataCache;
use crate::cache::node::NodeCache;
use crate::error::{CoreError, CoreResult};
use crate::resolver;
use crate::super_mgr::{AllocKind, SuperManager};
use device::wire::*;
use device::{Device, Nid, BLOCK_SIZE, INVALID_LPA, INVALID_NID};

/// Blocks making up one hash bucket. Kept constant across levels so bucket
/// placement is a pure function of level and index, at the cost of bucket
/// capacity not growing with level the way a production layout might.
pub const BLOCKS_PER_BUCKET: u32 = 2;

pub fn buckets_per_level(level: u32) -> u32 {
    1u32 << level
}

/// First block index (within the directory's data blocks) of bucket `idx`
/// at hash level `level`. Levels are laid out contiguously, lowest first.
pub fn bucket_start_block(level: u32, idx: u32) -> u64 {
    let blocks_before: u64 = (0..level).map(|l| buckets_per_level(l) as u64 * BLOCKS_PER_BUCKET as u64).sum();
    blocks_before + idx as u64 * BLOCKS_PER_BUCKET as u64
}

/// The lightweight TEA-derived hash (spec GLOSSARY) used to pick a name's
/// bucket. Not cryptographic; only needs to spread names across buckets.
pub fn tea_hash(name: &[u8]) -> u32 {
    const DELTA: u32 = 0x9E3779B9;
    let mut buf = [0x67452301u32, 0xEFCDAB89u32];
    let mut padded = name.to_vec();
    while padded.len() % 16 != 0 {
        padded.push(0);
    }
    if padded.is_empty() {
        padded = vec![0u8; 16];
    }
    for chunk in padded.chunks(16) {
        let mut input = [0u32; 4];
        for i in 0..4 {
            input[i] = u32::from_le_bytes(chunk[i * 4..i * 4 + 4].try_into().unwrap());
        }
        let (mut b0, mut b1) = (buf[0], buf[1]);
        let (a, b, c, d) = (input[0], input[1], input[2], input[3]);
        let mut sum = 0u32;
        for _ in 0..16 {
            sum = sum.wrapping_add(DELTA);
            b0 = b0.wrapping_add(
                (b1.wrapping_shl(4).wrapping_add(a)) ^ (b1.wrapping_add(sum)) ^ (b1.wrapping_shr(5).wrapping_add(b)),
            );
            b1 = b1.wrapping_add(
                (b0.wrapping_shl(4).wrapping_add(c)) ^ (b0.wrapping_add(sum)) ^ (b0.wrapping_shr(5).wrapping_add(d)),
            );
        }
        buf[0] = buf[0].wrapping_add(b0);
        buf[1] = buf[1].wrapping_add(b1);
    }
    buf[0]
}

pub struct DirLookup {
    pub ino: Nid,
    pub blk_idx: u32,
    pub bitpos: u32,
}

fn ensure_dir_block(
    dirdata: &mut DirDataCache,
    nodes: &mut NodeCache,
    sm: &mut SuperManager,
    device: &dyn Device,
    dir_ino: Nid,
    blkno: u64,
) -> CoreResult<bool> {
    let key = (dir_ino, blkno as u32);
    if dirdata.contains(&key) {
        return Ok(true);
    }
    let lpa = resolver::read_lpa(nodes, sm, device, dir_ino, blkno)?;
    if lpa == INVALID_LPA {
        return Ok(false);
    }
    let mut buf = Box::new([0u8; BLOCK_SIZE]);
    device.read_block(lpa, &mut buf).map_err(CoreError::IoError)?;
    dirdata.insert(key, buf);
    Ok(true)
}

/// Scans `name` across every populated level's bucket, cache-first via
/// `dentry_cache`. Real multi-component path resolution is expected to go
/// through the offloaded `path_lookup` command (see `FileSystemManager`);
/// this is the single-component primitive `create`/`remove` build on.
pub fn lookup(
    dentry_cache: &mut DentryCache,
    dirdata: &mut DirDataCache,
    nodes: &mut NodeCache,
    sm: &mut SuperManager,
    device: &dyn Device,
    dir_ino: Nid,
    dir_depth: u32,
    name: &str,
) -> CoreResult<Option<DirLookup>> {
    if let Some(cached) = dentry_cache.lookup(dir_ino, name) {
        return Ok(cached.ino.map(|ino| {
            let (blk, bit) = cached.location.unwrap();
            DirLookup { ino, blk_idx: blk, bitpos: bit }
        }));
    }

    let hash = tea_hash(name.as_bytes());
    let width = dentry_slot_width(name.len());
    for level in 0..=dir_depth {
        let idx = hash % buckets_per_level(level);
        let start_blk = bucket_start_block(level, idx);
        for b in 0..BLOCKS_PER_BUCKET as u64 {
            let blkno = start_blk + b;
            if !ensure_dir_block(dirdata, nodes, sm, device, dir_ino, blkno)? {
                continue;
            }
            let key = (dir_ino, blkno as u32);
            let block = &dirdata.get(&key).unwrap().data;
            for slot in 0..DENTRY_SLOTS {
                if !dentry_bit(block, slot) {
                    continue;
                }
                let e = read_dir_entry(block, slot);
                if e.namelen as usize != name.len() {
                    continue;
                }
                let raw = read_filename(block, slot, width);
                if &raw[..name.len()] == name.as_bytes() {
                    dentry_cache.insert_positive(dir_ino, name, e.ino, (blkno as u32, slot as u32));
                    return Ok(Some(DirLookup { ino: e.ino, blk_idx: blkno as u32, bitpos: slot as u32 }));
                }
            }
        }
    }
    dentry_cache.insert_negative(dir_ino, name);
    Ok(None)
}

/// Finds `width` contiguous free bits in one of `level`'s buckets,
/// allocating and zeroing any not-yet-materialized block in that bucket.
/// Returns `None` when the whole level's buckets are full.
fn find_free_slot(
    dirdata: &mut DirDataCache,
    nodes: &mut NodeCache,
    sm: &mut SuperManager,
    device: &dyn Device,
    dir_ino: Nid,
    level: u32,
    width: usize,
) -> CoreResult<Option<(u32, usize)>> {
    let hash_bucket_count = buckets_per_level(level);
    for idx in 0..hash_bucket_count {
        let start_blk = bucket_start_block(level, idx);
        for b in 0..BLOCKS_PER_BUCKET as u64 {
            let blkno = start_blk + b;
            if !ensure_dir_block(dirdata, nodes, sm, device, dir_ino, blkno)? {
                let lpa = sm.alloc_block(AllocKind::Data)?;
                let buf = Box::new([0u8; BLOCK_SIZE]);
                device.write_block(lpa, &buf).map_err(CoreError::IoError)?;
                resolver::write_lpa(nodes, sm, device, dir_ino, blkno, lpa)?;
                dirdata.insert((dir_ino, blkno as u32), buf);
            }
            let key = (dir_ino, blkno as u32);
            let block = &dirdata.get(&key).unwrap().data;
            let mut run = 0usize;
            for slot in 0..DENTRY_SLOTS {
                if dentry_bit(block, slot) {
                    run = 0;
                    continue;
                }
                run += 1;
                if run == width {
                    return Ok(Some((blkno as u32, slot + 1 - width)));
                }
            }
        }
    }
    Ok(None)
}

/// Creates `name` under `dir_ino`, growing the hash table by one level if
/// every bucket at the current depth is full. Returns the new file's nid
/// and, if the hash level grew, the new depth.
pub fn create(
    dentry_cache: &mut DentryCache,
    dirdata: &mut DirDataCache,
    nodes: &mut NodeCache,
    sm: &mut SuperManager,
    device: &dyn Device,
    dir_ino: Nid,
    dir_depth: u32,
    name: &str,
    file_type: u8,
) -> CoreResult<(Nid, u32)> {
    let width = dentry_slot_width(name.len());
    let (blk_idx, slot, new_depth) = match find_free_slot(dirdata, nodes, sm, device, dir_ino, dir_depth, width)? {
        Some((b, s)) => (b, s, dir_depth),
        None => {
            let grown = dir_depth + 1;
            let (b, s) = find_free_slot(dirdata, nodes, sm, device, dir_ino, grown, width)?
                .ok_or(CoreError::NoFreeSegment)?;
            (b, s, grown)
        }
    };

    let ino = sm.alloc_nid()?;
    let node_lpa = sm.alloc_block(AllocKind::Node)?;
    let mut node_buf = Box::new([0u8; BLOCK_SIZE]);
    let is_dir = file_type == FILE_TYPE_DIR;
    write_inode_header(
        &mut node_buf,
        &InodeHeader { size: 0, atime: 0, mtime: 0, nlink: 1, is_dir: is_dir as u32, dir_depth: 0, dentry_num: 0 },
    );
    write_node_footer(&mut node_buf, &NodeFooter { nid: ino, ino, offset_within_tree: 0, next_blkaddr_unused: 0 });
    device.write_block(node_lpa, &node_buf).map_err(CoreError::IoError)?;
    sm.set_nat_block_addr(ino, ino, node_lpa)?;
    nodes.insert(ino, node_buf, INVALID_NID, 0);

    {
        let key = (dir_ino, blk_idx);
        let entry = dirdata.get_mut_dirty(&key).unwrap();
        for i in 0..width {
            dentry_set_bit(&mut entry.data, slot + i);
        }
        write_dir_entry(
            &mut entry.data,
            slot,
            &DirEntryOnDisk { hash: tea_hash(name.as_bytes()), ino, namelen: name.len() as u16, file_type },
        );
        write_filename(&mut entry.data, slot, name.as_bytes());
    }
    dentry_cache.insert_positive(dir_ino, name, ino, (blk_idx, slot as u32));
    Ok((ino, new_depth))
}

pub const FILE_TYPE_REGULAR: u8 = 1;
pub const FILE_TYPE_DIR: u8 = 2;

/// Clears the bitmap run for an existing dentry and invalidates the
/// dentry-cache entry. Does not touch the target inode's nlink or
/// lifetime — that is `FileSystemManager::unlink`'s job.
pub fn remove(dentry_cache: &mut DentryCache, dirdata: &mut DirDataCache, dir_ino: Nid, name: &str, loc: DirLookup) -> CoreResult<()> {
    let width = dentry_slot_width(name.len());
    let key = (dir_ino, loc.blk_idx);
    let entry = dirdata.get_mut_dirty(&key).ok_or(CoreError::UserPathInvalid)?;
    for i in 0..width {
        dentry_clear_bit(&mut entry.data, loc.bitpos as usize + i);
    }
    dentry_cache.invalidate(dir_ino, name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use device::memory::MemoryDevice;
    use std::sync::Arc;

    fn fresh_dir() -> (Arc<MemoryDevice>, SuperManager, NodeCache, DirDataCache, DentryCache, Nid) {
        let dev = Arc::new(MemoryDevice::format(8, 64));
        let mut sm = SuperManager::mount(dev.clone(), 64).unwrap();
        let mut nodes = NodeCache::new(64);
        let ino = sm.alloc_nid().unwrap();
        let lpa = sm.alloc_block(AllocKind::Node).unwrap();
        let mut buf = Box::new([0u8; BLOCK_SIZE]);
        write_inode_header(&mut buf, &InodeHeader { is_dir: 1, nlink: 2, ..Default::default() });
        dev.write_block(lpa, &buf).unwrap();
        sm.set_nat_block_addr(ino, ino, lpa).unwrap();
        nodes.insert(ino, buf, INVALID_NID, 0);
        (dev, sm, nodes, DirDataCache::new(64), DentryCache::new(64), ino)
    }

    #[test]
    fn create_then_lookup_finds_entry() {
        let (dev, mut sm, mut nodes, mut dirdata, mut dentry_cache, dir_ino) = fresh_dir();
        let (ino, depth) = create(&mut dentry_cache, &mut dirdata, &mut nodes, &mut sm, dev.as_ref(), dir_ino, 0, "hello.txt", FILE_TYPE_REGULAR).unwrap();
        assert_eq!(depth, 0);
        let found = lookup(&mut dentry_cache, &mut dirdata, &mut nodes, &mut sm, dev.as_ref(), dir_ino, depth, "hello.txt").unwrap();
        assert_eq!(found.unwrap().ino, ino);
    }

    #[test]
    fn lookup_missing_name_is_negative() {
        let (dev, mut sm, mut nodes, mut dirdata, mut dentry_cache, dir_ino) = fresh_dir();
        let found = lookup(&mut dentry_cache, &mut dirdata, &mut nodes, &mut sm, dev.as_ref(), dir_ino, 0, "missing").unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn remove_clears_bitmap_and_dentry_cache() {
        let (dev, mut sm, mut nodes, mut dirdata, mut dentry_cache, dir_ino) = fresh_dir();
        let (ino, depth) = create(&mut dentry_cache, &mut dirdata, &mut nodes, &mut sm, dev.as_ref(), dir_ino, 0, "a", FILE_TYPE_REGULAR).unwrap();
        let loc = lookup(&mut dentry_cache, &mut dirdata, &mut nodes, &mut sm, dev.as_ref(), dir_ino, depth, "a").unwrap().unwrap();
        assert_eq!(loc.ino, ino);
        remove(&mut dentry_cache, &mut dirdata, dir_ino, "a", loc).unwrap();
        let found = lookup(&mut dentry_cache, &mut dirdata, &mut nodes, &mut sm, dev.as_ref(), dir_ino, depth, "a").unwrap();
        assert!(found.is_none());
    }
}
