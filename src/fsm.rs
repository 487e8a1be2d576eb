//! The filesystem core root. Owns every cache/allocator
//! behind one `fs_meta_lock`, the freeze lock gating background writeback,
//! the open-file table, and the background apply/server threads. Every
//! public method here is one API call in the lock hierarchy's sense:
//! freeze (shared) → per-file op lock → `fs_meta_lock`.

use crate::cache::dentry::DentryCache;
use crate::cache::dirdata::DirDataCache;
use crate::cache::file_obj::{FileMeta, FileObject, FileObjectCache};
use crate::cache::node::NodeCache;
use crate::config::Config;
use crate::dir;
use crate::error::{CoreError, CoreResult};
use crate::file;
use crate::journal::apply::ApplyWorker;
use crate::journal::commit::CommitQueue;
use crate::locks::FreezeLock;
use crate::replace_protect::ReplaceProtectManager;
use crate::resolver;
use crate::server::ServerThread;
use crate::super_mgr::{AllocKind, SuperManager};
use device::wire::{read_inode_header, write_inode_header, write_node_footer, InodeHeader, NodeFooter};
use device::{Device, Nid, BLOCK_SIZE, INVALID_NID};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;

/// nid 1 is always the first one the free-nid list hands out on a freshly
/// formatted device (see `MemoryDevice::format`), so the root directory
/// claims it once, at first mount, and every later mount finds it already
/// owned.
pub const ROOT_INO: Nid = 1;

/// Everything `fs_meta_lock` protects: the allocator/SIT/NAT state, the
/// node cache, and the two directory-layer caches. A single mutex around
/// one struct, rather than one mutex per field, is what makes this the
/// literal `fs_meta_lock` instead of an approximation of it.
pub struct MetaLock {
    pub sm: SuperManager,
    pub nodes: NodeCache,
    pub dirdata: DirDataCache,
    pub dentry: DentryCache,
}

pub struct FileSystemManager {
    freeze: FreezeLock,
    meta: Arc<Mutex<MetaLock>>,
    files: Mutex<FileObjectCache>,
    device: Arc<dyn Device>,
    commit_queue: Arc<CommitQueue>,
    replace_protect: Arc<ReplaceProtectManager>,
    apply_worker: Arc<ApplyWorker>,
    apply_thread: Mutex<Option<JoinHandle<()>>>,
    apply_shutdown: Arc<AtomicBool>,
    server: Arc<ServerThread>,
    server_thread: Mutex<Option<JoinHandle<()>>>,
    /// Latched once any error surfaces while `fs_meta_lock` was held;
    /// once set, every subsequent call fails fast with
    /// `CoreError::NotRecoverable` instead of touching shared state again.
    unrecoverable: AtomicBool,
    config: Config,
}

impl FileSystemManager {
    pub fn mount(device: Arc<dyn Device>, config: Config) -> CoreResult<Arc<Self>> {
        let mut sm = SuperManager::mount(device.clone(), config.meta_cache_size)?;
        let mut nodes = NodeCache::new(config.meta_cache_size);
        Self::bootstrap_root(&mut sm, &mut nodes, device.as_ref())?;

        let meta = Arc::new(Mutex::new(MetaLock {
            sm,
            nodes,
            dirdata: DirDataCache::new(config.meta_cache_size),
            dentry: DentryCache::new(config.meta_cache_size),
        }));

        let commit_queue = Arc::new(CommitQueue::new());
        let replace_protect = Arc::new(ReplaceProtectManager::new());
        let apply_worker = Arc::new(ApplyWorker::new(
            commit_queue.clone(),
            device.clone(),
            meta.clone(),
            replace_protect.clone(),
            config.apply_poll_interval(),
        ));
        let server = ServerThread::new();

        let this = Arc::new(Self {
            freeze: RwLock::new(()),
            meta,
            files: Mutex::new(FileObjectCache::new(config.file_cache_size)),
            device,
            commit_queue,
            replace_protect,
            apply_worker,
            apply_thread: Mutex::new(None),
            apply_shutdown: Arc::new(AtomicBool::new(false)),
            server,
            server_thread: Mutex::new(None),
            unrecoverable: AtomicBool::new(false),
            config,
        });

        let worker = this.apply_worker.clone();
        let shutdown = this.apply_shutdown.clone();
        *this.apply_thread.lock().unwrap() = Some(std::thread::spawn(move || worker.run_forever(&shutdown)));
        *this.server_thread.lock().unwrap() = Some(this.server.spawn());

        Ok(this)
    }

    /// Allocates nid 1 as the root directory on a freshly formatted device
    /// (detected via `next_free_nid == 1`, i.e. nothing has ever been
    /// allocated); on a later remount the root inode already exists there.
    fn bootstrap_root(sm: &mut SuperManager, nodes: &mut NodeCache, device: &dyn Device) -> CoreResult<()> {
        if sm.sb().next_free_nid != 1 {
            return Ok(());
        }
        let ino = sm.alloc_nid()?;
        debug_assert_eq!(ino, ROOT_INO, "root must be the first nid a fresh device ever hands out");
        let lpa = sm.alloc_block(AllocKind::Node)?;
        let mut buf = Box::new([0u8; BLOCK_SIZE]);
        write_inode_header(&mut buf, &InodeHeader { is_dir: 1, nlink: 1, dir_depth: 0, dentry_num: 0, ..Default::default() });
        write_node_footer(&mut buf, &NodeFooter { nid: ino, ino, offset_within_tree: 0, next_blkaddr_unused: 0 });
        device.write_block(lpa, &buf).map_err(CoreError::IoError)?;
        sm.set_nat_block_addr(ino, ino, lpa)?;
        nodes.insert(ino, buf, INVALID_NID, 0);
        Ok(())
    }

    /// Runs `f` under `fs_meta_lock`, latching the core unrecoverable if it
    /// returns a poisoning error, and otherwise committing
    /// whatever SIT/NAT entries the call left dirty.
    fn run_meta<R>(&self, f: impl FnOnce(&mut MetaLock, &dyn Device) -> CoreResult<R>) -> CoreResult<R> {
        if self.unrecoverable.load(Ordering::SeqCst) {
            return Err(CoreError::NotRecoverable);
        }
        let mut meta = self.meta.lock().unwrap();
        let result = f(&mut meta, self.device.as_ref());
        match &result {
            Ok(_) => self.commit_pending(&mut meta),
            Err(e) if e.poisons_core() => self.unrecoverable.store(true, Ordering::SeqCst),
            Err(_) => {}
        }
        result
    }

    /// Drains whatever SIT/NAT/SUPER entries are currently dirty into a
    /// journal container, along with the allocator's uncommitted segment
    /// links and the node/dentry handles this transaction touched, and
    /// hands it to the commit queue. The entries are considered persisted
    /// once journaled — a later full write-back (`write_back_all_dirty`)
    /// only has work left to do for entries touched after the last commit.
    fn commit_pending(&self, meta: &mut MetaLock) {
        let mut container = crate::journal::JournalContainer::default();
        for segid in meta.sm.sit.dirty_segids() {
            if let Some(e) = meta.sm.sit.get(&segid) {
                container.push_sit(segid, e);
                meta.sm.sit.clear_dirty(&segid);
            }
        }
        for nid in meta.sm.nat.dirty_nids() {
            if let Some(e) = meta.sm.nat.get(&nid) {
                container.push_nat(nid, e);
                meta.sm.nat.clear_dirty(&nid);
            }
        }
        for (offset, value) in meta.sm.take_super_journal() {
            container.push_super(offset, value);
        }
        container.uncommit_node_segs = meta.sm.take_uncommit_node_segs();
        container.uncommit_data_segs = meta.sm.take_uncommit_data_segs();
        container.dirty_nodes = meta.nodes.dirty_nids();
        container.dirty_dentries = meta.dentry.take_touched();
        if !container.is_empty() {
            self.commit_queue.commit(container);
        }
    }

    fn split_path(path: &str) -> CoreResult<Vec<&str>> {
        let trimmed = path.trim_start_matches('/');
        if trimmed.is_empty() {
            return Ok(vec![]);
        }
        let parts: Vec<&str> = trimmed.split('/').collect();
        if parts.iter().any(|p| p.is_empty() || *p == "." || *p == "..") {
            return Err(CoreError::UserPathInvalid);
        }
        Ok(parts)
    }

    fn split_parent(path: &str) -> CoreResult<(String, String)> {
        let parts = Self::split_path(path)?;
        let name = parts.last().ok_or(CoreError::UserPathInvalid)?.to_string();
        let parent = if parts.len() == 1 { "/".to_string() } else { format!("/{}", parts[..parts.len() - 1].join("/")) };
        Ok((parent, name))
    }

    fn resolve(meta: &mut MetaLock, device: &dyn Device, path: &str) -> CoreResult<Nid> {
        let parts = Self::split_path(path)?;
        let mut cur = ROOT_INO;
        for part in parts {
            let depth = Self::inode_dir_depth(meta, device, cur)?;
            let found = dir::lookup(&mut meta.dentry, &mut meta.dirdata, &mut meta.nodes, &mut meta.sm, device, cur, depth, part)?;
            cur = found.ok_or(CoreError::NotFound)?.ino;
        }
        Ok(cur)
    }

    fn inode_dir_depth(meta: &mut MetaLock, device: &dyn Device, ino: Nid) -> CoreResult<u32> {
        resolver::ensure_inode_loaded(&mut meta.nodes, &mut meta.sm, device, ino)?;
        Ok(read_inode_header(&meta.nodes.get(&ino).unwrap().data).dir_depth)
    }

    fn inode_header(meta: &mut MetaLock, device: &dyn Device, ino: Nid) -> CoreResult<InodeHeader> {
        resolver::ensure_inode_loaded(&mut meta.nodes, &mut meta.sm, device, ino)?;
        Ok(read_inode_header(&meta.nodes.get(&ino).unwrap().data))
    }

    fn write_header(meta: &mut MetaLock, ino: Nid, hdr: &InodeHeader) {
        let entry = meta.nodes.get_mut_dirty(&ino).unwrap();
        write_inode_header(&mut entry.data, hdr);
    }

    fn bump_dentry_num(meta: &mut MetaLock, device: &dyn Device, ino: Nid, delta: i32) -> CoreResult<()> {
        let mut hdr = Self::inode_header(meta, device, ino)?;
        hdr.dentry_num = (hdr.dentry_num as i64 + delta as i64).max(0) as u32;
        Self::write_header(meta, ino, &hdr);
        Ok(())
    }

    /// Resolves `path` to an inode without opening it.
    pub fn lookup_path(&self, path: &str) -> CoreResult<Nid> {
        let _freeze = self.freeze.read().unwrap();
        self.run_meta(|meta, device| Self::resolve(meta, device, path))
    }

    fn create_entry(&self, path: &str, file_type: u8) -> CoreResult<Nid> {
        let _freeze = self.freeze.read().unwrap();
        self.run_meta(|meta, device| {
            let (parent_path, name) = Self::split_parent(path)?;
            let parent_ino = Self::resolve(meta, device, &parent_path)?;
            let parent_depth = Self::inode_dir_depth(meta, device, parent_ino)?;
            let (ino, new_depth) =
                dir::create(&mut meta.dentry, &mut meta.dirdata, &mut meta.nodes, &mut meta.sm, device, parent_ino, parent_depth, &name, file_type)?;
            if new_depth != parent_depth {
                let mut hdr = Self::inode_header(meta, device, parent_ino)?;
                hdr.dir_depth = new_depth;
                Self::write_header(meta, parent_ino, &hdr);
            }
            Self::bump_dentry_num(meta, device, parent_ino, 1)?;
            Ok(ino)
        })
    }

    pub fn mkdir(&self, path: &str) -> CoreResult<Nid> {
        self.create_entry(path, dir::FILE_TYPE_DIR)
    }

    /// Opens `path` for I/O, creating a regular file if `create` is set
    /// and the path does not already resolve. Returns the inode number,
    /// used as the file descriptor by the shim layer.
    pub fn open(&self, path: &str, create: bool) -> CoreResult<Nid> {
        let _freeze = self.freeze.read().unwrap();
        let (ino, hdr) = self.run_meta(|meta, device| {
            let ino = match Self::resolve(meta, device, path) {
                Ok(ino) => ino,
                Err(CoreError::NotFound) if create => {
                    let (parent_path, name) = Self::split_parent(path)?;
                    let parent_ino = Self::resolve(meta, device, &parent_path)?;
                    let parent_depth = Self::inode_dir_depth(meta, device, parent_ino)?;
                    let (ino, new_depth) = dir::create(
                        &mut meta.dentry,
                        &mut meta.dirdata,
                        &mut meta.nodes,
                        &mut meta.sm,
                        device,
                        parent_ino,
                        parent_depth,
                        &name,
                        dir::FILE_TYPE_REGULAR,
                    )?;
                    if new_depth != parent_depth {
                        let mut phdr = Self::inode_header(meta, device, parent_ino)?;
                        phdr.dir_depth = new_depth;
                        Self::write_header(meta, parent_ino, &phdr);
                    }
                    Self::bump_dentry_num(meta, device, parent_ino, 1)?;
                    ino
                }
                Err(e) => return Err(e),
            };
            let hdr = Self::inode_header(meta, device, ino)?;
            Ok((ino, hdr))
        })?;

        if hdr.is_dir != 0 {
            return Err(CoreError::RwConflictsOpenFlag);
        }
        let page_cache_size = self.config.page_cache_size;
        let mut files = self.files.lock().unwrap();
        files.open(ino, || {
            FileObject::new(ino, false, FileMeta { size: hdr.size, atime: hdr.atime, mtime: hdr.mtime, nlink: hdr.nlink }, page_cache_size)
        });
        Ok(ino)
    }

    pub fn close(&self, ino: Nid) {
        self.files.lock().unwrap().close(&ino);
    }

    /// Current size of an open file, from the lightweight `file_meta_lock`
    /// rather than the inode header, since a dirty write may not have been
    /// journaled back to the header yet.
    pub fn file_size(&self, ino: Nid) -> CoreResult<u64> {
        let files = self.files.lock().unwrap();
        let file = files.get(&ino).ok_or(CoreError::InvalidFd)?;
        let size = file.meta.lock().unwrap().size;
        Ok(size)
    }

    pub fn read(&self, ino: Nid, buf: &mut [u8], pos: u64) -> CoreResult<usize> {
        let _freeze = self.freeze.read().unwrap();
        let file = self.files.lock().unwrap().get(&ino).ok_or(CoreError::InvalidFd)?;
        let _op = file.op_lock.read().unwrap();
        self.run_meta(|meta, device| file::read(&file, &mut meta.nodes, &mut meta.sm, device, buf, pos))
    }

    pub fn write(&self, ino: Nid, buf: &[u8], pos: u64, append: bool) -> CoreResult<usize> {
        let _freeze = self.freeze.read().unwrap();
        let file = self.files.lock().unwrap().get(&ino).ok_or(CoreError::InvalidFd)?;
        let _op = file.op_lock.read().unwrap();
        self.run_meta(|meta, device| file::write(&file, &mut meta.nodes, &mut meta.sm, device, buf, pos, append))
    }

    pub fn truncate(&self, ino: Nid, size: u64) -> CoreResult<()> {
        let _freeze = self.freeze.read().unwrap();
        let file = self.files.lock().unwrap().get(&ino).ok_or(CoreError::InvalidFd)?;
        let _op = file.op_lock.write().unwrap();
        self.run_meta(|meta, device| file::truncate(&file, &mut meta.nodes, &mut meta.sm, device, size))
    }

    pub fn unlink(&self, path: &str) -> CoreResult<()> {
        let _freeze = self.freeze.read().unwrap();
        self.run_meta(|meta, device| {
            if Self::split_path(path)?.is_empty() {
                return Err(CoreError::IsADirectory); // "/" is always a directory
            }
            let (parent_path, name) = Self::split_parent(path)?;
            let parent_ino = Self::resolve(meta, device, &parent_path)?;
            let depth = Self::inode_dir_depth(meta, device, parent_ino)?;
            let loc = dir::lookup(&mut meta.dentry, &mut meta.dirdata, &mut meta.nodes, &mut meta.sm, device, parent_ino, depth, &name)?
                .ok_or(CoreError::NotFound)?;
            let target_ino = loc.ino;
            let mut hdr = Self::inode_header(meta, device, target_ino)?;
            if hdr.is_dir != 0 {
                return Err(CoreError::IsADirectory);
            }
            hdr.nlink = hdr.nlink.saturating_sub(1);
            Self::write_header(meta, target_ino, &hdr);
            dir::remove(&mut meta.dentry, &mut meta.dirdata, parent_ino, &name, loc)?;
            Self::bump_dentry_num(meta, device, parent_ino, -1)?;
            if hdr.nlink == 0 {
                Self::free_inode(meta, device, target_ino, hdr.size)?;
            }
            Ok(())
        })
    }

    pub fn rmdir(&self, path: &str) -> CoreResult<()> {
        let _freeze = self.freeze.read().unwrap();
        self.run_meta(|meta, device| {
            let (parent_path, name) = Self::split_parent(path)?;
            let parent_ino = Self::resolve(meta, device, &parent_path)?;
            let depth = Self::inode_dir_depth(meta, device, parent_ino)?;
            let loc = dir::lookup(&mut meta.dentry, &mut meta.dirdata, &mut meta.nodes, &mut meta.sm, device, parent_ino, depth, &name)?
                .ok_or(CoreError::NotFound)?;
            let target_ino = loc.ino;
            let hdr = Self::inode_header(meta, device, target_ino)?;
            if hdr.is_dir == 0 {
                return Err(CoreError::RwConflictsOpenFlag);
            }
            if hdr.dentry_num != 0 {
                return Err(CoreError::RwConflictsOpenFlag);
            }
            meta.dirdata.drop_inode(target_ino);
            dir::remove(&mut meta.dentry, &mut meta.dirdata, parent_ino, &name, loc)?;
            Self::bump_dentry_num(meta, device, parent_ino, -1)?;
            Self::free_inode(meta, device, target_ino, hdr.size)?;
            Ok(())
        })
    }

    /// Releases every data/index block an about-to-be-freed inode owns,
    /// then its own inode block and nid. Called once nlink drops to 0
    /// (unlink) or a directory is confirmed empty (rmdir).
    fn free_inode(meta: &mut MetaLock, device: &dyn Device, ino: Nid, size: u64) -> CoreResult<()> {
        if size > 0 {
            let last_blk = (size - 1) / BLOCK_SIZE as u64;
            for blk in 0..=last_blk {
                let lpa = resolver::read_lpa(&mut meta.nodes, &mut meta.sm, device, ino, blk)?;
                meta.sm.invalidate_lpa(lpa)?;
            }
            resolver::reduce(&mut meta.nodes, &mut meta.sm, device, ino, 0, size)?;
        }
        let own_lpa = meta.sm.nat_block_addr(ino)?;
        meta.sm.invalidate_lpa(own_lpa)?;
        meta.nodes.clear_dirty(&ino);
        if meta.nodes.contains(&ino) {
            meta.nodes.evict_clean(&ino);
        }
        meta.sm.free_nid(ino)?;
        Ok(())
    }

    /// Two-phase shutdown: stop taking new freeze-shared work by
    /// holding it exclusive while flushing every dirty cache directly to
    /// its home blocks, drain the replace-protect backlog so every
    /// in-flight journal write is confirmed applied, then stop the
    /// background threads.
    pub fn shutdown(&self) {
        {
            let _freeze = self.freeze.write().unwrap();
            let mut meta = self.meta.lock().unwrap();
            let _ = meta.sm.write_back_all_dirty();
        }
        self.replace_protect.wait_all_protect_task_cplt();
        self.apply_shutdown.store(true, Ordering::SeqCst);
        if let Some(h) = self.apply_thread.lock().unwrap().take() {
            let _ = h.join();
        }
        self.server.request_shutdown();
        if let Some(h) = self.server_thread.lock().unwrap().take() {
            let _ = h.join();
        }
    }

    /// Blocks until every transaction committed so far has been confirmed
    /// applied by the SSD. Unlike `shutdown`, this
    /// leaves the background threads running and takes no freeze lock —
    /// it only waits out the commit queue and replace-protect backlog
    /// that already exist independent of the caller.
    pub fn sync(&self) {
        while !self.commit_queue.is_empty() {
            std::thread::yield_now();
        }
        self.replace_protect.wait_all_protect_task_cplt();
    }

    pub fn is_unrecoverable(&self) -> bool {
        self.unrecoverable.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use device::memory::MemoryDevice;

    fn fresh() -> Arc<FileSystemManager> {
        let dev: Arc<dyn Device> = Arc::new(MemoryDevice::format(8, 64));
        FileSystemManager::mount(dev, Config { apply_poll_micros: 50, ..Config::default() }).unwrap()
    }

    #[test]
    fn root_exists_and_is_a_directory() {
        let fsm = fresh();
        let ino = fsm.lookup_path("/").unwrap();
        assert_eq!(ino, ROOT_INO);
        fsm.shutdown();
    }

    #[test]
    fn create_write_read_roundtrips_through_a_path() {
        let fsm = fresh();
        let ino = fsm.open("/hello.txt", true).unwrap();
        let n = fsm.write(ino, b"hscfs", 0, false).unwrap();
        assert_eq!(n, 5);
        let mut buf = [0u8; 16];
        let r = fsm.read(ino, &mut buf, 0).unwrap();
        assert_eq!(&buf[..r], b"hscfs");
        fsm.close(ino);
        assert_eq!(fsm.lookup_path("/hello.txt").unwrap(), ino);
        fsm.shutdown();
    }

    #[test]
    fn mkdir_then_nested_file_resolves() {
        let fsm = fresh();
        fsm.mkdir("/sub").unwrap();
        let ino = fsm.open("/sub/leaf.txt", true).unwrap();
        assert_eq!(fsm.lookup_path("/sub/leaf.txt").unwrap(), ino);
        fsm.shutdown();
    }

    #[test]
    fn unlink_removes_the_dentry() {
        let fsm = fresh();
        let ino = fsm.open("/a.txt", true).unwrap();
        fsm.close(ino);
        fsm.unlink("/a.txt").unwrap();
        assert!(matches!(fsm.lookup_path("/a.txt"), Err(CoreError::NotFound)));
        fsm.shutdown();
    }

    #[test]
    fn unlink_on_missing_path_is_enoent() {
        let fsm = fresh();
        assert!(matches!(fsm.unlink("/missing"), Err(CoreError::NotFound)));
        fsm.shutdown();
    }

    #[test]
    fn unlink_root_is_eisdir() {
        let fsm = fresh();
        assert!(matches!(fsm.unlink("/"), Err(CoreError::IsADirectory)));
        fsm.shutdown();
    }

    #[test]
    fn rmdir_refuses_a_non_empty_directory() {
        let fsm = fresh();
        fsm.mkdir("/d").unwrap();
        let ino = fsm.open("/d/f.txt", true).unwrap();
        fsm.close(ino);
        assert!(matches!(fsm.rmdir("/d"), Err(CoreError::RwConflictsOpenFlag)));
        fsm.unlink("/d/f.txt").unwrap();
        fsm.rmdir("/d").unwrap();
        fsm.shutdown();
    }
}
