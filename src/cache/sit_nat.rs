//! SIT (segment info table) and NAT (node address table) caches. Both hold
//! fixed-size on-disk entries, so unlike the node/dentry caches
//! there is no separate "raw block" representation to reconcile — an entry
//! read once from its SIT/NAT block is cached in decoded form directly.

use super::Cache;
use device::wire::{NatEntryOnDisk, SitEntryOnDisk};
use device::{Nid, SegId};

struct SitSlot {
    entry: SitEntryOnDisk,
    dirty: bool,
}

/// Segment info table cache: vblocks count + valid-block bitmap + next_seg
/// link per segment, keyed by segment id.
pub struct SitCache {
    inner: Cache<SegId, SitSlot>,
}

impl SitCache {
    pub fn new(expect_size: usize) -> Self {
        Self { inner: Cache::new(expect_size) }
    }

    pub fn load(&mut self, segid: SegId, entry: SitEntryOnDisk) {
        if !self.inner.contains(&segid) {
            self.inner.add(segid, SitSlot { entry, dirty: false });
        }
    }

    pub fn get(&mut self, segid: &SegId) -> Option<SitEntryOnDisk> {
        self.inner.access(segid);
        self.inner.get(segid).map(|s| s.entry)
    }

    /// Applies `f` to the cached entry and marks it dirty. Panics if
    /// `segid` is not resident — callers must `load` first.
    pub fn update(&mut self, segid: &SegId, f: impl FnOnce(&mut SitEntryOnDisk)) {
        self.inner.access(segid);
        let slot = self.inner.get_mut(segid).expect("sit entry not resident");
        f(&mut slot.entry);
        slot.dirty = true;
    }

    pub fn is_dirty(&self, segid: &SegId) -> bool {
        self.inner.get(segid).map(|s| s.dirty).unwrap_or(false)
    }

    pub fn clear_dirty(&mut self, segid: &SegId) {
        if let Some(s) = self.inner.get_mut(segid) {
            s.dirty = false;
        }
    }

    pub fn dirty_segids(&self) -> Vec<SegId> {
        self.inner
            .lru_keys()
            .chain(self.inner.pinned_keys())
            .copied()
            .filter(|s| self.is_dirty(s))
            .collect()
    }

    pub fn pin(&mut self, segid: &SegId) {
        self.inner.inc_ref(segid);
    }

    pub fn unpin(&mut self, segid: &SegId) {
        self.inner.dec_ref(segid);
    }
}

struct NatSlot {
    entry: NatEntryOnDisk,
    dirty: bool,
}

/// Node address table cache: ino (repurposed as a validity flag, per
/// `NatEntryOnDisk::is_free`) and block address, keyed by nid.
pub struct NatCache {
    inner: Cache<Nid, NatSlot>,
}

impl NatCache {
    pub fn new(expect_size: usize) -> Self {
        Self { inner: Cache::new(expect_size) }
    }

    pub fn load(&mut self, nid: Nid, entry: NatEntryOnDisk) {
        if !self.inner.contains(&nid) {
            self.inner.add(nid, NatSlot { entry, dirty: false });
        }
    }

    pub fn get(&mut self, nid: &Nid) -> Option<NatEntryOnDisk> {
        self.inner.access(nid);
        self.inner.get(nid).map(|s| s.entry)
    }

    pub fn update(&mut self, nid: &Nid, f: impl FnOnce(&mut NatEntryOnDisk)) {
        self.inner.access(nid);
        let slot = self.inner.get_mut(nid).expect("nat entry not resident");
        f(&mut slot.entry);
        slot.dirty = true;
    }

    pub fn is_dirty(&self, nid: &Nid) -> bool {
        self.inner.get(nid).map(|s| s.dirty).unwrap_or(false)
    }

    pub fn clear_dirty(&mut self, nid: &Nid) {
        if let Some(s) = self.inner.get_mut(nid) {
            s.dirty = false;
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

    pub fn pin(&mut self, nid: &Nid) {
        self.inner.inc_ref(nid);
    }

    pub fn unpin(&mut self, nid: &Nid) {
        self.inner.dec_ref(nid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sit_update_marks_dirty_and_pin_survives_pressure() {
        let mut c = SitCache::new(1);
        c.load(1, SitEntryOnDisk::default());
        c.pin(&1);
        c.update(&1, |e| e.set_vblocks(3));
        c.load(2, SitEntryOnDisk::default()); // would evict 1 if it weren't pinned
        assert!(c.is_dirty(&1));
        assert_eq!(c.get(&1).unwrap().vblocks(), 3);
    }

    #[test]
    fn nat_entries_start_clean() {
        let mut c = NatCache::new(4);
        c.load(1, NatEntryOnDisk::default());
        assert!(!c.is_dirty(&1));
    }
}
