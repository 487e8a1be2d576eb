//! Replace-protect manager. Holds one record per
//! committed-but-not-yet-SSD-applied transaction, keeping every SIT/NAT
//! entry it touched pinned so the host never evicts a block the SSD might
//! still need to reconcile against. The apply worker notifies this manager
//! as the SSD's apply pointer advances past each transaction.

use crate::cache::dentry::DentryKey;
use crate::fsm::MetaLock;
use crate::journal::CompactedJournal;
use device::{Nid, SegId};
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

pub struct TxReplaceProtect {
    pub tx_id: u64,
    pub journal: CompactedJournal,
    pub uncommit_node_segs: Vec<SegId>,
    pub uncommit_data_segs: Vec<SegId>,
    pub dirty_nodes: Vec<Nid>,
    pub dirty_dentries: Vec<DentryKey>,
}

#[derive(Default)]
struct Inner {
    records: VecDeque<TxReplaceProtect>,
}

pub struct ReplaceProtectManager {
    inner: Mutex<Inner>,
    drained: Condvar,
}

impl Default for ReplaceProtectManager {
    fn default() -> Self {
        Self { inner: Mutex::new(Inner::default()), drained: Condvar::new() }
    }
}

impl ReplaceProtectManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a freshly committed transaction, pinning every SIT/NAT
    /// entry, dirty node handle, and dirty dentry handle it touched via the
    /// host-version bump (§4.2): the host must not evict a block the SSD
    /// hasn't applied the matching journal to yet, since eviction would
    /// drop the host's more-current in-memory state.
    pub fn push(&self, meta: &mut MetaLock, record: TxReplaceProtect) {
        for &(segid, _) in &record.journal.sit {
            meta.sm.sit.pin(&segid);
        }
        for &(nid, _) in &record.journal.nat {
            meta.sm.nat.pin(&nid);
        }
        for &nid in &record.dirty_nodes {
            meta.nodes.pin(&nid);
        }
        for (parent, name) in &record.dirty_dentries {
            meta.dentry.pin(*parent, name);
        }
        self.inner.lock().unwrap().records.push_back(record);
    }

    /// Called by the apply worker once it observes the SSD's head has
    /// passed `tx_id`'s range. SSD applies in submission order, so this
    /// must be the front of the queue.
    pub fn on_applied(&self, meta: &mut MetaLock, tx_id: u64) -> Option<TxReplaceProtect> {
        let mut inner = self.inner.lock().unwrap();
        let front_matches = matches!(inner.records.front(), Some(r) if r.tx_id == tx_id);
        if !front_matches {
            return None;
        }
        let record = inner.records.pop_front().unwrap();
        for &(segid, _) in &record.journal.sit {
            meta.sm.sit.unpin(&segid);
        }
        for &(nid, _) in &record.journal.nat {
            meta.sm.nat.unpin(&nid);
        }
        for &nid in &record.dirty_nodes {
            meta.nodes.unpin(&nid);
        }
        for (parent, name) in &record.dirty_dentries {
            meta.dentry.unpin(*parent, name);
        }
        if inner.records.is_empty() {
            self.drained.notify_all();
        }
        Some(record)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().records.is_empty()
    }

    /// Blocks until every outstanding record has been applied. Used on
    /// shutdown quiesce.
    pub fn wait_all_protect_task_cplt(&self) {
        let inner = self.inner.lock().unwrap();
        let _guard = self.drained.wait_while(inner, |i| !i.records.is_empty()).unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::CompactedJournal;
    use crate::super_mgr::SuperManager;
    use device::memory::MemoryDevice;
    use std::sync::Arc;

    fn empty_journal() -> CompactedJournal {
        CompactedJournal { sit: vec![], nat: vec![], super_: vec![] }
    }

    fn record(tx_id: u64) -> TxReplaceProtect {
        TxReplaceProtect {
            tx_id,
            journal: empty_journal(),
            uncommit_node_segs: vec![],
            uncommit_data_segs: vec![],
            dirty_nodes: vec![],
            dirty_dentries: vec![],
        }
    }

    fn fresh_meta() -> MetaLock {
        let dev: Arc<dyn device::Device> = Arc::new(MemoryDevice::format(4, 16));
        MetaLock {
            sm: SuperManager::mount(dev, 16).unwrap(),
            nodes: crate::cache::node::NodeCache::new(16),
            dirdata: crate::cache::dirdata::DirDataCache::new(16),
            dentry: crate::cache::dentry::DentryCache::new(16),
        }
    }

    #[test]
    fn on_applied_refuses_out_of_order_pop() {
        let mut meta = fresh_meta();
        let rp = ReplaceProtectManager::new();
        rp.push(&mut meta, record(1));
        rp.push(&mut meta, record(2));
        assert!(rp.on_applied(&mut meta, 2).is_none());
        assert!(rp.on_applied(&mut meta, 1).is_some());
        assert!(rp.on_applied(&mut meta, 2).is_some());
        assert!(rp.is_empty());
    }
}
