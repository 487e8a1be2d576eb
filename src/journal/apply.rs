//! Apply worker: drains the commit queue, packs each
//! transaction into the journal ring's wire format, hands the blocks to the
//! SSD, then polls the SSD's apply pointer to learn which transactions have
//! actually landed so their replace-protect pins can be released.

use crate::fsm::MetaLock;
use crate::journal::commit::CommitQueue;
use crate::journal::{compact, pack};
use crate::replace_protect::{ReplaceProtectManager, TxReplaceProtect};
use device::{Device, Lpa};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One packed-and-submitted transaction awaiting SSD application.
struct InFlight {
    tx_id: u64,
    start_lpa: Lpa,
    nblocks: u32,
}

struct Ring {
    /// LPA of the first not-yet-applied block, mirrored from the SSD.
    head_lpa: Lpa,
    /// LPA the next write will land at.
    tail_lpa: Lpa,
    region_start: Lpa,
    region_blocks: u32,
    in_flight: Vec<InFlight>,
}

impl Ring {
    fn available(&self) -> u32 {
        let used = (self.tail_lpa + self.region_blocks - self.head_lpa) % self.region_blocks;
        self.region_blocks - used
    }

    fn advance_tail(&mut self, nblocks: u32) {
        self.tail_lpa = self.region_start + (self.tail_lpa - self.region_start + nblocks) % self.region_blocks;
    }
}

/// Drives one commit-queue container through submission and applies polling.
/// `sm` and `rp` are taken as locked handles so the worker can run on its
/// own thread alongside API-serving threads that also touch the super
/// manager under `fs_meta_lock` (modeled here as the passed-in mutex).
pub struct ApplyWorker {
    queue: Arc<CommitQueue>,
    device: Arc<dyn Device>,
    meta: Arc<Mutex<MetaLock>>,
    rp: Arc<ReplaceProtectManager>,
    ring: Mutex<Ring>,
    poll_interval: Duration,
}

impl ApplyWorker {
    pub fn new(
        queue: Arc<CommitQueue>,
        device: Arc<dyn Device>,
        meta: Arc<Mutex<MetaLock>>,
        rp: Arc<ReplaceProtectManager>,
        poll_interval: Duration,
    ) -> Self {
        let (region_start, region_blocks, head_lpa) = {
            let guard = meta.lock().unwrap();
            let sb = guard.sm.sb();
            (sb.journal_start_lpa, sb.journal_block_count, sb.journal_start_lpa)
        };
        let head_lpa = device.get_metajournal_head().unwrap_or(head_lpa as u64) as u32;
        Self {
            queue,
            device,
            meta,
            rp,
            ring: Mutex::new(Ring { head_lpa, tail_lpa: head_lpa, region_start, region_blocks, in_flight: vec![] }),
            poll_interval,
        }
    }

    /// Submits one transaction: compacts, packs, and writes it to the
    /// journal ring, provided enough space is free. Returns `false` (and
    /// leaves the container for a later retry by the caller) if the ring
    /// has no room yet — the caller should drain applied transactions via
    /// [`Self::poll_applied`] and retry.
    pub fn submit_one(&self, tx_id: u64, journal: &crate::journal::CompactedJournal) -> anyhow::Result<bool> {
        let blocks = pack(journal);
        let mut ring = self.ring.lock().unwrap();
        if ring.available() < blocks.len() as u32 {
            return Ok(false);
        }
        let start_lpa = ring.tail_lpa;
        for (i, block) in blocks.iter().enumerate() {
            let lpa = ring.region_start + (start_lpa - ring.region_start + i as u32) % ring.region_blocks;
            self.device.write_block(lpa, block)?;
        }
        self.device.update_metajournal_tail(start_lpa, blocks.len() as u32)?;
        ring.advance_tail(blocks.len() as u32);
        ring.in_flight.push(InFlight { tx_id, start_lpa, nblocks: blocks.len() as u32 });
        Ok(true)
    }

    /// Polls the SSD's apply pointer and notifies the replace-protect
    /// manager for every in-flight transaction the SSD has now applied.
    /// Transactions apply in submission order, so a single head comparison
    /// per in-flight entry, front to back, is sufficient.
    pub fn poll_applied(&self) -> anyhow::Result<()> {
        let head = self.device.get_metajournal_head()? as u32;
        let mut ring = self.ring.lock().unwrap();
        ring.head_lpa = head;
        while let Some(first) = ring.in_flight.first() {
            let end = ring.region_start + (first.start_lpa - ring.region_start + first.nblocks) % ring.region_blocks;
            if !lpa_has_passed(ring.region_start, ring.region_blocks, first.start_lpa, end, head) {
                break;
            }
            let applied = ring.in_flight.remove(0);
            let mut meta = self.meta.lock().unwrap();
            self.rp.on_applied(&mut meta, applied.tx_id);
        }
        Ok(())
    }

    /// Runs forever: waits for commit-queue work, submits it (retrying
    /// after a poll if the ring is momentarily full), then polls on a
    /// timer while anything remains in flight. Intended to run on its own
    /// thread (spawned by `FileSystemManager`); `run_once` below is the
    /// step used directly by tests.
    pub fn run_forever(&self, shutdown: &std::sync::atomic::AtomicBool) {
        use std::sync::atomic::Ordering;
        while !shutdown.load(Ordering::SeqCst) {
            if let Some(container) = self.queue.try_pop() {
                self.run_one(container);
            } else {
                std::thread::sleep(self.poll_interval);
                let _ = self.poll_applied();
            }
        }
        while let Some(container) = self.queue.try_pop() {
            self.run_one(container);
        }
        while !self.rp.is_empty() {
            std::thread::sleep(self.poll_interval);
            let _ = self.poll_applied();
        }
    }

    /// Compacts, registers the replace-protect record (pinning its
    /// handles), submits, and polls once to pick up whatever the device
    /// already applied synchronously.
    fn run_one(&self, container: crate::journal::JournalContainer) {
        let tx_id = container.tx_id;
        let compacted = compact(&container);
        {
            let mut meta = self.meta.lock().unwrap();
            self.rp.push(
                &mut meta,
                TxReplaceProtect {
                    tx_id,
                    journal: crate::journal::CompactedJournal {
                        sit: compacted.sit.clone(),
                        nat: compacted.nat.clone(),
                        super_: compacted.super_.clone(),
                    },
                    uncommit_node_segs: container.uncommit_node_segs,
                    uncommit_data_segs: container.uncommit_data_segs,
                    dirty_nodes: container.dirty_nodes,
                    dirty_dentries: container.dirty_dentries,
                },
            );
        }
        loop {
            match self.submit_one(tx_id, &compacted) {
                Ok(true) => break,
                Ok(false) => {
                    std::thread::sleep(self.poll_interval);
                    let _ = self.poll_applied();
                }
                Err(_) => break,
            }
        }
        let _ = self.poll_applied();
    }
}

/// Whether the SSD's apply head has advanced past `[start, end)` within a
/// wrapping ring of `region_blocks` slots starting at `region_start`.
fn lpa_has_passed(region_start: Lpa, region_blocks: u32, start: Lpa, end: Lpa, head: Lpa) -> bool {
    let norm = |lpa: Lpa| (lpa + region_blocks - region_start) % region_blocks;
    let head_off = norm(head);
    let end_off = norm(end);
    let start_off = norm(start);
    if end_off == start_off {
        return true; // zero-length submission
    }
    if start_off < end_off {
        head_off >= end_off || head_off < start_off
    } else {
        head_off >= end_off && head_off < start_off
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::JournalContainer;
    use crate::super_mgr::SuperManager;
    use device::memory::MemoryDevice;
    use device::wire::SitEntryOnDisk;

    fn fresh() -> (Arc<dyn Device>, Arc<Mutex<MetaLock>>, Arc<CommitQueue>, Arc<ReplaceProtectManager>) {
        let dev: Arc<dyn Device> = Arc::new(MemoryDevice::format(4, 16));
        let sm = SuperManager::mount(dev.clone(), 16).unwrap();
        let meta = Arc::new(Mutex::new(MetaLock {
            sm,
            nodes: crate::cache::node::NodeCache::new(16),
            dirdata: crate::cache::dirdata::DirDataCache::new(16),
            dentry: crate::cache::dentry::DentryCache::new(16),
        }));
        (dev, meta, Arc::new(CommitQueue::new()), Arc::new(ReplaceProtectManager::new()))
    }

    #[test]
    fn submit_then_poll_releases_replace_protect() {
        let (dev, meta, queue, rp) = fresh();
        let worker = ApplyWorker::new(queue.clone(), dev, meta, rp.clone(), Duration::from_millis(1));
        let mut c = JournalContainer::default();
        c.push_sit(1, SitEntryOnDisk::default());
        let tx_id = queue.commit(c);
        let container = queue.wait_pop();
        assert_eq!(container.tx_id, tx_id);
        worker.run_one(container);
        assert!(rp.is_empty(), "in-process device applies synchronously, so one poll should drain it");
    }

    #[test]
    fn multiple_transactions_apply_in_order() {
        let (dev, meta, queue, rp) = fresh();
        let worker = ApplyWorker::new(queue.clone(), dev, meta, rp.clone(), Duration::from_millis(1));
        for _ in 0..3 {
            let mut c = JournalContainer::default();
            c.push_sit(1, SitEntryOnDisk::default());
            queue.commit(c);
        }
        while let Some(container) = queue.try_pop() {
            worker.run_one(container);
        }
        assert!(rp.is_empty());
    }
}
