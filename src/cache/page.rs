//! Per-file page cache: regular file data blocks keyed by block index within
//! the file. Each entry carries its own `page_lock`, a leaf below
//! `file_meta_lock`, so a writeback in progress on one page never blocks a
//! reader touching a different page of the same file.

use super::Cache;
use device::BLOCK_SIZE;
use std::sync::{Condvar, Mutex};

/// Write-in-progress state for one page, guarded independently of the page's
/// cache slot so a writer holding the page's bytes can still be waited on by
/// a concurrent reader without contending the whole file cache.
#[derive(Default)]
pub struct PageLock {
    writing: Mutex<bool>,
    cond: Condvar,
}

impl PageLock {
    pub fn begin_write(&self) {
        let mut w = self.writing.lock().unwrap();
        while *w {
            w = self.cond.wait(w).unwrap();
        }
        *w = true;
    }

    pub fn end_write(&self) {
        let mut w = self.writing.lock().unwrap();
        *w = false;
        self.cond.notify_all();
    }
}

pub struct PageEntry {
    pub data: Box<[u8; BLOCK_SIZE]>,
    pub dirty: bool,
    pub lock: PageLock,
}

pub struct PageCache {
    inner: Cache<u64, PageEntry>,
}

impl PageCache {
    pub fn new(expect_size: usize) -> Self {
        Self { inner: Cache::new(expect_size) }
    }

    pub fn contains(&self, blkno: u64) -> bool {
        self.inner.contains(&blkno)
    }

    pub fn insert(&mut self, blkno: u64, data: Box<[u8; BLOCK_SIZE]>) {
        self.inner.add(blkno, PageEntry { data, dirty: false, lock: PageLock::default() });
    }

    pub fn get(&mut self, blkno: u64) -> Option<&PageEntry> {
        self.inner.access(&blkno);
        self.inner.get(&blkno)
    }

    pub fn get_mut_dirty(&mut self, blkno: u64) -> Option<&mut PageEntry> {
        self.inner.access(&blkno);
        let e = self.inner.get_mut(&blkno)?;
        e.dirty = true;
        Some(e)
    }

    pub fn is_dirty(&self, blkno: u64) -> bool {
        self.inner.get(&blkno).map(|e| e.dirty).unwrap_or(false)
    }

    pub fn clear_dirty(&mut self, blkno: u64) {
        if let Some(e) = self.inner.get_mut(&blkno) {
            e.dirty = false;
        }
    }

    pub fn dirty_blocks(&self) -> Vec<u64> {
        self.inner
            .lru_keys()
            .chain(self.inner.pinned_keys())
            .copied()
            .filter(|b| self.is_dirty(*b))
            .collect()
    }

    pub fn pin(&mut self, blkno: u64) {
        self.inner.inc_ref(&blkno);
    }

    pub fn unpin(&mut self, blkno: u64) {
        self.inner.dec_ref(&blkno);
    }

    /// Drops every cached page for a truncated-away or deleted file. Callers
    /// must have written back dirty pages first; this discards unconditionally.
    pub fn drop_all(&mut self) {
        let keys: Vec<u64> = self.inner.lru_keys().chain(self.inner.pinned_keys()).copied().collect();
        for k in keys {
            self.inner.force_remove(&k);
        }
    }

    /// Drops cached pages at or past `from_blkno`, for a shrinking truncate.
    pub fn drop_from(&mut self, from_blkno: u64) {
        let keys: Vec<u64> = self
            .inner
            .lru_keys()
            .chain(self.inner.pinned_keys())
            .copied()
            .filter(|b| *b >= from_blkno)
            .collect();
        for k in keys {
            self.inner.force_remove(&k);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_from_keeps_earlier_blocks() {
        let mut c = PageCache::new(8);
        c.insert(0, Box::new([0u8; BLOCK_SIZE]));
        c.insert(5, Box::new([0u8; BLOCK_SIZE]));
        c.drop_from(3);
        assert!(c.contains(0));
        assert!(!c.contains(5));
    }

    #[test]
    fn page_lock_round_trips() {
        let e = PageEntry { data: Box::new([0u8; BLOCK_SIZE]), dirty: false, lock: PageLock::default() };
        e.lock.begin_write();
        e.lock.end_write();
    }
}
