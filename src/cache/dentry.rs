//! Dentry cache: resolved `(parent_ino, name) -> ino` lookups, positive and
//! negative, so repeated lookups under the same directory (stat-heavy
//! workloads walking one directory) skip re-deriving the hash bucket and
//! rescanning [`super::dirdata`] blocks. This cache holds no block bytes —
//! it is a pure fast path in front of the dir-data cache and the offloaded
//! `path_lookup` command.

use super::Cache;
use device::Nid;

pub type DentryKey = (Nid, String);

/// `Some((dentry_blk_idx, bitpos))` for a positive hit, `None` for a
/// confirmed negative (the name does not exist under this parent).
pub type DentryLocation = Option<(u32, u32)>;

pub struct DentryEntry {
    pub ino: Option<Nid>,
    pub location: DentryLocation,
}

pub struct DentryCache {
    inner: Cache<DentryKey, DentryEntry>,
    /// Keys touched since the last [`Self::take_touched`] drain, for
    /// `commit_pending` to thread into the transaction's replace-protect
    /// record.
    touched: Vec<DentryKey>,
}

impl DentryCache {
    pub fn new(expect_size: usize) -> Self {
        Self { inner: Cache::new(expect_size), touched: vec![] }
    }

    pub fn lookup(&mut self, parent: Nid, name: &str) -> Option<&DentryEntry> {
        let key = (parent, name.to_string());
        self.inner.access(&key);
        self.inner.get(&key)
    }

    pub fn insert_positive(&mut self, parent: Nid, name: &str, ino: Nid, location: (u32, u32)) {
        let key = (parent, name.to_string());
        if self.inner.contains(&key) {
            self.inner.force_remove(&key);
        }
        self.touched.push(key.clone());
        self.inner.add(key, DentryEntry { ino: Some(ino), location: Some(location) });
    }

    pub fn insert_negative(&mut self, parent: Nid, name: &str) {
        let key = (parent, name.to_string());
        if self.inner.contains(&key) {
            self.inner.force_remove(&key);
        }
        self.touched.push(key.clone());
        self.inner.add(key, DentryEntry { ino: None, location: None });
    }

    pub fn invalidate(&mut self, parent: Nid, name: &str) {
        let key = (parent, name.to_string());
        self.touched.push(key.clone());
        self.inner.force_remove(&key);
    }

    /// Drains the keys touched since the last drain.
    pub fn take_touched(&mut self) -> Vec<DentryKey> {
        std::mem::take(&mut self.touched)
    }

    /// Invalidates every cached entry under `parent`, e.g. after a rename
    /// that moves slots around and might stale other names' `location`.
    pub fn invalidate_dir(&mut self, parent: Nid) {
        let keys: Vec<DentryKey> = self
            .inner
            .lru_keys()
            .chain(self.inner.pinned_keys())
            .filter(|(p, _)| *p == parent)
            .cloned()
            .collect();
        for k in keys {
            self.touched.push(k.clone());
            self.inner.force_remove(&k);
        }
    }

    /// Pins `(parent, name)`, incrementing refcount; used to hold a dentry
    /// resident while its transaction is committed but not yet SSD-applied.
    pub fn pin(&mut self, parent: Nid, name: &str) {
        self.inner.inc_ref(&(parent, name.to_string()));
    }

    pub fn unpin(&mut self, parent: Nid, name: &str) {
        self.inner.dec_ref(&(parent, name.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_hit_then_invalidate() {
        let mut c = DentryCache::new(4);
        c.insert_negative(1, "missing");
        assert!(c.lookup(1, "missing").unwrap().ino.is_none());
        c.invalidate(1, "missing");
        assert!(c.lookup(1, "missing").is_none());
    }

    #[test]
    fn invalidate_dir_clears_only_that_parent() {
        let mut c = DentryCache::new(4);
        c.insert_positive(1, "a", 10, (0, 0));
        c.insert_positive(2, "a", 20, (0, 0));
        c.invalidate_dir(1);
        assert!(c.lookup(1, "a").is_none());
        assert!(c.lookup(2, "a").is_some());
    }
}
