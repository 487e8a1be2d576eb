//! File object read/write/truncate. Callers already hold the
//! file's `op_lock` (shared for read/write, exclusive for truncate); the
//! `nodes`/`sm`/`device` triple here stands in for "caller holds
//! `fs_meta_lock`", taken only on a page-cache miss.

use crate::cache::file_obj::FileObject;
use crate::cache::node::NodeCache;
use crate::error::{CoreError, CoreResult};
use crate::resolver;
use crate::super_mgr::{AllocKind, SuperManager};
use device::{Device, Nid, BLOCK_SIZE, INVALID_LPA};

/// Ensures `blkoff` is resident and clean-or-dirty-readable in the file's
/// page cache, filling holes with zeroes.
fn prepare_page(file: &FileObject, nodes: &mut NodeCache, sm: &mut SuperManager, device: &dyn Device, blkoff: u64) -> CoreResult<()> {
    let mut pages = file.pages.lock().unwrap();
    if pages.contains(blkoff) {
        return Ok(());
    }
    let size = file.meta.lock().unwrap().size;
    let size_in_blocks = (size + BLOCK_SIZE as u64 - 1) / BLOCK_SIZE as u64;
    if blkoff >= size_in_blocks {
        pages.insert(blkoff, Box::new([0u8; BLOCK_SIZE]));
        return Ok(());
    }
    let lpa = resolver::read_lpa(nodes, sm, device, file.ino, blkoff)?;
    let mut buf = Box::new([0u8; BLOCK_SIZE]);
    if lpa != INVALID_LPA {
        device.read_block(lpa, &mut buf).map_err(CoreError::IoError)?;
    }
    pages.insert(blkoff, buf);
    Ok(())
}

/// Reads up to `buf.len()` bytes starting at `pos`, clamped to the file's
/// current size. Updates atime. Hand-over-hand page locking is modeled by
/// the page cache's per-miss `fs_meta_lock` reacquisition rather than an
/// explicit lock chain, since this in-process cache never blocks a second
/// reader on I/O the way the real page `reading` state does.
pub fn read(file: &FileObject, nodes: &mut NodeCache, sm: &mut SuperManager, device: &dyn Device, buf: &mut [u8], pos: u64) -> CoreResult<usize> {
    let size = file.meta.lock().unwrap().size;
    if pos >= size {
        return Ok(0);
    }
    let n = std::cmp::min(buf.len() as u64, size - pos) as usize;
    let mut done = 0usize;
    while done < n {
        let abs = pos + done as u64;
        let blkoff = abs / BLOCK_SIZE as u64;
        let in_blk = (abs % BLOCK_SIZE as u64) as usize;
        prepare_page(file, nodes, sm, device, blkoff)?;
        let mut pages = file.pages.lock().unwrap();
        let page = pages.get(blkoff).unwrap();
        let take = std::cmp::min(BLOCK_SIZE - in_blk, n - done);
        buf[done..done + take].copy_from_slice(&page.data[in_blk..in_blk + take]);
        done += take;
    }
    file.meta.lock().unwrap().atime = now_placeholder();
    Ok(done)
}

/// Writes `buf` at `pos` (or at the current end-of-file when `append` is
/// set, snapshotting size atomically under the caller's exclusive op-lock
/// promotion — modeled here simply as reading `size` once up front since
/// the op-lock discipline itself lives in `FileSystemManager`). Grows
/// `size` to cover the write and marks every touched page dirty.
pub fn write(file: &FileObject, nodes: &mut NodeCache, sm: &mut SuperManager, device: &dyn Device, buf: &[u8], pos: u64, append: bool) -> CoreResult<usize> {
    let start = if append { file.meta.lock().unwrap().size } else { pos };
    let mut done = 0usize;
    while done < buf.len() {
        let abs = start + done as u64;
        let blkoff = abs / BLOCK_SIZE as u64;
        let in_blk = (abs % BLOCK_SIZE as u64) as usize;
        prepare_page(file, nodes, sm, device, blkoff)?;
        if resolver::read_lpa(nodes, sm, device, file.ino, blkoff)? == INVALID_LPA {
            let lpa = sm.alloc_block(AllocKind::Data)?;
            resolver::write_lpa(nodes, sm, device, file.ino, blkoff, lpa)?;
        }
        let mut pages = file.pages.lock().unwrap();
        let page = pages.get_mut_dirty(blkoff).unwrap();
        let take = std::cmp::min(BLOCK_SIZE - in_blk, buf.len() - done);
        page.data[in_blk..in_blk + take].copy_from_slice(&buf[done..done + take]);
        done += take;
    }
    let mut meta = file.meta.lock().unwrap();
    meta.size = std::cmp::max(meta.size, start + done as u64);
    meta.mtime = now_placeholder();
    meta.atime = meta.mtime;
    Ok(done)
}

/// Shrinks the file to `tar_size`: invalidates the data LPA of every page
/// strictly beyond the new size (the resizer's contract.3), then
/// calls the resizer to release the now-unused index-tree nodes, and
/// finally drops the corresponding pages from the page cache.
pub fn truncate(file: &FileObject, nodes: &mut NodeCache, sm: &mut SuperManager, device: &dyn Device, tar_size: u64) -> CoreResult<()> {
    let old_size = file.meta.lock().unwrap().size;
    if tar_size >= old_size {
        file.meta.lock().unwrap().size = tar_size;
        return Ok(());
    }
    let tar_blk = tar_size / BLOCK_SIZE as u64;
    let old_last_blk = if old_size == 0 { 0 } else { (old_size - 1) / BLOCK_SIZE as u64 };
    let mut blk = tar_blk + if tar_size % BLOCK_SIZE as u64 == 0 { 0 } else { 1 };
    while blk <= old_last_blk {
        let lpa = resolver::read_lpa(nodes, sm, device, file.ino, blk)?;
        sm.invalidate_lpa(lpa)?;
        blk += 1;
    }
    resolver::reduce(nodes, sm, device, file.ino, tar_size, old_size)?;

    let mut pages = file.pages.lock().unwrap();
    let from = tar_blk + if tar_size % BLOCK_SIZE as u64 == 0 { 0 } else { 1 };
    pages.drop_from(from);
    drop(pages);

    let mut meta = file.meta.lock().unwrap();
    meta.size = tar_size;
    meta.mtime = now_placeholder();
    Ok(())
}

/// Timestamps come from the caller's wall clock in the real shim; the core
/// itself never calls the OS clock (so that tests stay deterministic),
/// hence this fixed placeholder rather than `SystemTime::now()`.
fn now_placeholder() -> u32 {
    0
}

#[allow(dead_code)]
pub fn nid_of(file: &FileObject) -> Nid {
    file.ino
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::file_obj::FileMeta;
    use crate::super_mgr::SuperManager;
    use device::memory::MemoryDevice;
    use device::wire::{write_inode_header, write_node_footer, InodeHeader, NodeFooter};
    use device::INVALID_NID;
    use std::sync::Arc;

    fn fresh_file() -> (Arc<MemoryDevice>, SuperManager, NodeCache, FileObject) {
        let dev = Arc::new(MemoryDevice::format(8, 64));
        let mut sm = SuperManager::mount(dev.clone(), 64).unwrap();
        let mut nodes = NodeCache::new(64);
        let ino = sm.alloc_nid().unwrap();
        let lpa = sm.alloc_block(AllocKind::Node).unwrap();
        let mut buf = Box::new([0u8; BLOCK_SIZE]);
        write_inode_header(&mut buf, &InodeHeader::default());
        write_node_footer(&mut buf, &NodeFooter { nid: ino, ino, offset_within_tree: 0, next_blkaddr_unused: 0 });
        dev.write_block(lpa, &buf).unwrap();
        sm.set_nat_block_addr(ino, ino, lpa).unwrap();
        nodes.insert(ino, buf, INVALID_NID, 0);
        let file = FileObject::new(ino, false, FileMeta::default(), 16);
        (dev, sm, nodes, file)
    }

    #[test]
    fn write_then_read_round_trips() {
        let (dev, mut sm, mut nodes, file) = fresh_file();
        let n = write(&file, &mut nodes, &mut sm, dev.as_ref(), b"hello hscfs!", 0, false).unwrap();
        assert_eq!(n, 12);
        let mut buf = [0u8; 32];
        let r = read(&file, &mut nodes, &mut sm, dev.as_ref(), &mut buf, 0).unwrap();
        assert_eq!(r, 12);
        assert_eq!(&buf[..12], b"hello hscfs!");
    }

    #[test]
    fn truncate_to_zero_then_read_returns_nothing() {
        let (dev, mut sm, mut nodes, file) = fresh_file();
        write(&file, &mut nodes, &mut sm, dev.as_ref(), b"hello hscfs!", 0, false).unwrap();
        truncate(&file, &mut nodes, &mut sm, dev.as_ref(), 0).unwrap();
        let mut buf = [0u8; 32];
        let r = read(&file, &mut nodes, &mut sm, dev.as_ref(), &mut buf, 0).unwrap();
        assert_eq!(r, 0);
    }

    #[test]
    fn append_write_starts_at_current_size() {
        let (dev, mut sm, mut nodes, file) = fresh_file();
        write(&file, &mut nodes, &mut sm, dev.as_ref(), b"abc", 0, false).unwrap();
        write(&file, &mut nodes, &mut sm, dev.as_ref(), b"def", 0, true).unwrap();
        let mut buf = [0u8; 8];
        let r = read(&file, &mut nodes, &mut sm, dev.as_ref(), &mut buf, 0).unwrap();
        assert_eq!(&buf[..r], b"abcdef");
    }
}
