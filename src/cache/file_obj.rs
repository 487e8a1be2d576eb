//! File object cache: one entry per open inode, keyed by nid/ino. Each
//! object bundles the lightweight `file_meta_lock` and this file's page
//! cache, so the read/write hot path only ever has to reach `fs_meta_lock`
//! on a cache miss.

use super::page::PageCache;
use super::Cache;
use crate::locks::OpLock;
use device::Nid;
use std::sync::{Arc, Mutex, RwLock};

/// Fields mutated on every read/write without touching `fs_meta_lock`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileMeta {
    pub size: u64,
    pub atime: u32,
    pub mtime: u32,
    pub nlink: u32,
}

pub struct FileObject {
    pub ino: Nid,
    pub is_dir: bool,
    pub meta: Mutex<FileMeta>,
    pub op_lock: OpLock,
    pub pages: Mutex<PageCache>,
}

impl FileObject {
    pub fn new(ino: Nid, is_dir: bool, meta: FileMeta, page_cache_size: usize) -> Self {
        Self {
            ino,
            is_dir,
            meta: Mutex::new(meta),
            op_lock: RwLock::new(()),
            pages: Mutex::new(PageCache::new(page_cache_size)),
        }
    }
}

/// Open-file table: refcount here tracks distinct fds/handles referencing
/// the same inode, not bytes read/written. An inode reaching refcount 0
/// becomes eviction-eligible but is not dropped until the cache is under
/// pressure, so a close-then-reopen burst doesn't thrash the page cache
/// underneath it.
pub struct FileObjectCache {
    inner: Cache<Nid, Arc<FileObject>>,
}

impl FileObjectCache {
    pub fn new(expect_size: usize) -> Self {
        Self { inner: Cache::new(expect_size) }
    }

    pub fn open(&mut self, ino: Nid, make: impl FnOnce() -> FileObject) -> Arc<FileObject> {
        if !self.inner.contains(&ino) {
            self.inner.add(ino, Arc::new(make()));
        }
        self.inner.access(&ino);
        self.inner.inc_ref(&ino);
        self.inner.get(&ino).unwrap().clone()
    }

    pub fn close(&mut self, ino: &Nid) {
        self.inner.dec_ref(ino);
    }

    pub fn get(&self, ino: &Nid) -> Option<Arc<FileObject>> {
        self.inner.get(ino).cloned()
    }

    pub fn contains(&self, ino: &Nid) -> bool {
        self.inner.contains(ino)
    }

    /// Removes the cached object outright, e.g. when an inode's nlink
    /// drops to 0 and the last fd closes. Caller must have already
    /// dropped refcount to 0 and flushed pages.
    pub fn purge(&mut self, ino: &Nid) {
        if self.inner.refcount(ino) == 0 {
            self.inner.force_remove(ino);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_twice_shares_object_and_bumps_refcount() {
        let mut c = FileObjectCache::new(4);
        let a = c.open(1, || FileObject::new(1, false, FileMeta::default(), 4));
        let b = c.open(1, || panic!("should reuse cached object"));
        assert!(Arc::ptr_eq(&a, &b));
        c.close(&1);
        c.close(&1);
        c.purge(&1);
        assert!(!c.contains(&1));
    }
}
