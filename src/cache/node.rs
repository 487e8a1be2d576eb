//! Node cache: inode and index node blocks, keyed by nid. Holds the raw 4
//! KiB block plus its parent nid and tree offset (mirrors [`device::NodePage`],
//! since entries populated by a `filemapping_search` offload arrive in that
//! shape) so a child can pin its parent without a second lookup.

use super::Cache;
use device::{Nid, BLOCK_SIZE};

pub struct NodeEntry {
    pub data: Box<[u8; BLOCK_SIZE]>,
    pub parent_nid: Nid,
    pub offset_within_tree: u32,
    pub dirty: bool,
}

pub struct NodeCache {
    inner: Cache<Nid, NodeEntry>,
}

impl NodeCache {
    pub fn new(expect_size: usize) -> Self {
        Self { inner: Cache::new(expect_size) }
    }

    pub fn contains(&self, nid: &Nid) -> bool {
        self.inner.contains(nid)
    }

    pub fn insert(&mut self, nid: Nid, data: Box<[u8; BLOCK_SIZE]>, parent_nid: Nid, offset_within_tree: u32) {
        self.inner.add(nid, NodeEntry { data, parent_nid, offset_within_tree, dirty: false });
    }

    pub fn get(&mut self, nid: &Nid) -> Option<&NodeEntry> {
        self.inner.access(nid);
        self.inner.get(nid)
    }

    pub fn get_mut_dirty(&mut self, nid: &Nid) -> Option<&mut NodeEntry> {
        self.inner.access(nid);
        let entry = self.inner.get_mut(nid)?;
        entry.dirty = true;
        Some(entry)
    }

    pub fn is_dirty(&self, nid: &Nid) -> bool {
        self.inner.get(nid).map(|e| e.dirty).unwrap_or(false)
    }

    pub fn clear_dirty(&mut self, nid: &Nid) {
        if let Some(e) = self.inner.get_mut(nid) {
            e.dirty = false;
        }
    }

    pub fn dirty_nids(&self) -> Vec<Nid> {
        self.inner
            .lru_keys()
            .chain(self.inner.pinned_keys())
            .copied()
            .filter(|n| self.is_dirty(n))
            .collect()
    }

    /// Pins `nid`, incrementing refcount; used while a handle to this node
    /// is held (e.g. mid-traversal, or a directory block's parent index node).
    pub fn pin(&mut self, nid: &Nid) {
        self.inner.inc_ref(nid);
    }

    pub fn unpin(&mut self, nid: &Nid) {
        self.inner.dec_ref(nid);
    }

    /// Evicts `nid` outright after it has been written back; caller must
    /// ensure it is clean and unpinned first.
    pub fn evict_clean(&mut self, nid: &Nid) {
        debug_assert!(!self.is_dirty(nid));
        debug_assert_eq!(self.inner.refcount(nid), 0);
        self.inner.force_remove(nid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_mut_dirty_marks_and_persists() {
        let mut c = NodeCache::new(4);
        c.insert(1, Box::new([0u8; BLOCK_SIZE]), 0, 0);
        assert!(!c.is_dirty(&1));
        c.get_mut_dirty(&1).unwrap().data[0] = 7;
        assert!(c.is_dirty(&1));
        assert_eq!(c.get(&1).unwrap().data[0], 7);
    }

    #[test]
    fn pinned_node_survives_pressure() {
        let mut c = NodeCache::new(1);
        c.insert(1, Box::new([0u8; BLOCK_SIZE]), 0, 0);
        c.pin(&1);
        c.insert(2, Box::new([0u8; BLOCK_SIZE]), 0, 0);
        assert!(c.contains(&1));
    }
}
