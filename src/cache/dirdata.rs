//! Directory data cache: raw 4 KiB directory content blocks, keyed by
//! `(dir_ino, block_index)`. This is what `dir.rs` actually reads/mutates
//! through the dentry-block accessors in `device::wire`; [`super::dentry`]
//! sits above it as a resolved-name fast path, not a second copy of the
//! block bytes.

use super::Cache;
use device::{Nid, BLOCK_SIZE};

pub type DirBlockKey = (Nid, u32);

pub struct DirBlockEntry {
    pub data: Box<[u8; BLOCK_SIZE]>,
    pub dirty: bool,
}

pub struct DirDataCache {
    inner: Cache<DirBlockKey, DirBlockEntry>,
}

impl DirDataCache {
    pub fn new(expect_size: usize) -> Self {
        Self { inner: Cache::new(expect_size) }
    }

    pub fn contains(&self, key: &DirBlockKey) -> bool {
        self.inner.contains(key)
    }

    pub fn insert(&mut self, key: DirBlockKey, data: Box<[u8; BLOCK_SIZE]>) {
        self.inner.add(key, DirBlockEntry { data, dirty: false });
    }

    pub fn get(&mut self, key: &DirBlockKey) -> Option<&DirBlockEntry> {
        self.inner.access(key);
        self.inner.get(key)
    }

    pub fn get_mut_dirty(&mut self, key: &DirBlockKey) -> Option<&mut DirBlockEntry> {
        self.inner.access(key);
        let e = self.inner.get_mut(key)?;
        e.dirty = true;
        Some(e)
    }

    pub fn is_dirty(&self, key: &DirBlockKey) -> bool {
        self.inner.get(key).map(|e| e.dirty).unwrap_or(false)
    }

    pub fn clear_dirty(&mut self, key: &DirBlockKey) {
        if let Some(e) = self.inner.get_mut(key) {
            e.dirty = false;
        }
    }

    pub fn dirty_keys(&self) -> Vec<DirBlockKey> {
        self.inner
            .lru_keys()
            .chain(self.inner.pinned_keys())
            .copied()
            .filter(|k| self.is_dirty(k))
            .collect()
    }

    pub fn pin(&mut self, key: &DirBlockKey) {
        self.inner.inc_ref(key);
    }

    pub fn unpin(&mut self, key: &DirBlockKey) {
        self.inner.dec_ref(key);
    }

    /// Drops every block belonging to `ino`, e.g. on directory removal.
    /// All must be clean and unpinned; callers write back first.
    pub fn drop_inode(&mut self, ino: Nid) {
        let keys: Vec<DirBlockKey> = self
            .inner
            .lru_keys()
            .chain(self.inner.pinned_keys())
            .copied()
            .filter(|(i, _)| *i == ino)
            .collect();
        for k in keys {
            debug_assert!(!self.is_dirty(&k));
            self.inner.force_remove(&k);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_inode_removes_only_that_inode_blocks() {
        let mut c = DirDataCache::new(8);
        c.insert((1, 0), Box::new([0u8; BLOCK_SIZE]));
        c.insert((2, 0), Box::new([0u8; BLOCK_SIZE]));
        c.drop_inode(1);
        assert!(!c.contains(&(1, 0)));
        assert!(c.contains(&(2, 0)));
    }
}
