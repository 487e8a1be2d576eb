//! Thin POSIX-style surface over [`crate::fsm::FileSystemManager`] (spec
//! §11): small-integer fds with independent read/write offsets over the
//! core's inode-keyed handles, `O_*`/`SEEK_*` flag handling, and
//! `CoreError -> errno` mapping at the boundary.

use crate::error::{CoreError, CoreResult};
use crate::fsm::FileSystemManager;
use device::Nid;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

struct FdEntry {
    ino: Nid,
    offset: u64,
    append: bool,
}

pub struct PosixShim {
    fsm: Arc<FileSystemManager>,
    fds: Mutex<HashMap<i32, FdEntry>>,
    next_fd: AtomicI32,
}

impl PosixShim {
    pub fn new(fsm: Arc<FileSystemManager>) -> Self {
        Self { fsm, fds: Mutex::new(HashMap::new()), next_fd: AtomicI32::new(3) }
    }

    pub fn open(&self, path: &str, flags: i32) -> CoreResult<i32> {
        let create = flags & libc::O_CREAT != 0;
        let append = flags & libc::O_APPEND != 0;
        let ino = self.fsm.open(path, create)?;
        if flags & libc::O_TRUNC != 0 {
            self.fsm.truncate(ino, 0)?;
        }
        let fd = self.next_fd.fetch_add(1, Ordering::SeqCst);
        self.fds.lock().unwrap().insert(fd, FdEntry { ino, offset: 0, append });
        Ok(fd)
    }

    pub fn close(&self, fd: i32) -> CoreResult<()> {
        let entry = self.fds.lock().unwrap().remove(&fd).ok_or(CoreError::InvalidFd)?;
        self.fsm.close(entry.ino);
        Ok(())
    }

    pub fn read(&self, fd: i32, buf: &mut [u8]) -> CoreResult<usize> {
        let (ino, pos) = {
            let fds = self.fds.lock().unwrap();
            let e = fds.get(&fd).ok_or(CoreError::InvalidFd)?;
            (e.ino, e.offset)
        };
        let n = self.fsm.read(ino, buf, pos)?;
        self.fds.lock().unwrap().get_mut(&fd).unwrap().offset += n as u64;
        Ok(n)
    }

    pub fn write(&self, fd: i32, buf: &[u8]) -> CoreResult<usize> {
        let (ino, pos, append) = {
            let fds = self.fds.lock().unwrap();
            let e = fds.get(&fd).ok_or(CoreError::InvalidFd)?;
            (e.ino, e.offset, e.append)
        };
        let n = self.fsm.write(ino, buf, pos, append)?;
        let new_offset = if append { self.fsm.file_size(ino)? } else { pos + n as u64 };
        self.fds.lock().unwrap().get_mut(&fd).unwrap().offset = new_offset;
        Ok(n)
    }

    pub fn lseek(&self, fd: i32, offset: i64, whence: i32) -> CoreResult<u64> {
        let (ino, cur) = {
            let fds = self.fds.lock().unwrap();
            let e = fds.get(&fd).ok_or(CoreError::InvalidFd)?;
            (e.ino, e.offset)
        };
        let base: i64 = match whence {
            libc::SEEK_SET => 0,
            libc::SEEK_CUR => cur as i64,
            libc::SEEK_END => self.fsm.file_size(ino)? as i64,
            _ => return Err(CoreError::UserPathInvalid),
        };
        let new_pos = base + offset;
        if new_pos < 0 {
            return Err(CoreError::UserPathInvalid);
        }
        let mut fds = self.fds.lock().unwrap();
        let e = fds.get_mut(&fd).unwrap();
        e.offset = new_pos as u64;
        Ok(e.offset)
    }

    pub fn ftruncate(&self, fd: i32, size: u64) -> CoreResult<()> {
        let ino = self.fds.lock().unwrap().get(&fd).ok_or(CoreError::InvalidFd)?.ino;
        self.fsm.truncate(ino, size)
    }

    pub fn fsync(&self, fd: i32) -> CoreResult<()> {
        if !self.fds.lock().unwrap().contains_key(&fd) {
            return Err(CoreError::InvalidFd);
        }
        self.fsm.sync();
        Ok(())
    }

    pub fn mkdir(&self, path: &str) -> CoreResult<()> {
        self.fsm.mkdir(path).map(|_| ())
    }

    pub fn rmdir(&self, path: &str) -> CoreResult<()> {
        self.fsm.rmdir(path)
    }

    pub fn unlink(&self, path: &str) -> CoreResult<()> {
        self.fsm.unlink(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use device::memory::MemoryDevice;
    use device::Device;

    fn fresh() -> PosixShim {
        let dev: Arc<dyn Device> = Arc::new(MemoryDevice::format(8, 64));
        let fsm = FileSystemManager::mount(dev, Config { apply_poll_micros: 50, ..Config::default() }).unwrap();
        PosixShim::new(fsm)
    }

    #[test]
    fn open_write_seek_read_back() {
        let shim = fresh();
        let fd = shim.open("/a.txt", libc::O_CREAT).unwrap();
        shim.write(fd, b"0123456789").unwrap();
        shim.lseek(fd, 3, libc::SEEK_SET).unwrap();
        let mut buf = [0u8; 4];
        let n = shim.read(fd, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"3456");
        shim.close(fd).unwrap();
    }

    #[test]
    fn append_writes_ignore_seek_position() {
        let shim = fresh();
        let fd = shim.open("/b.txt", libc::O_CREAT).unwrap();
        shim.write(fd, b"abc").unwrap();
        let fd2 = shim.open("/b.txt", libc::O_CREAT | libc::O_APPEND).unwrap();
        shim.write(fd2, b"def").unwrap();
        let mut buf = [0u8; 8];
        let n = shim.read(fd, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"def");
        shim.close(fd).unwrap();
        shim.close(fd2).unwrap();
    }

    #[test]
    fn fsync_drains_the_commit_backlog() {
        let shim = fresh();
        let fd = shim.open("/d.txt", libc::O_CREAT).unwrap();
        shim.write(fd, b"payload").unwrap();
        shim.fsync(fd).unwrap();
        shim.close(fd).unwrap();
    }

    #[test]
    fn ftruncate_shrinks_the_open_file() {
        let shim = fresh();
        let fd = shim.open("/c.txt", libc::O_CREAT).unwrap();
        shim.write(fd, b"0123456789").unwrap();
        shim.ftruncate(fd, 4).unwrap();
        let mut buf = [0u8; 16];
        shim.lseek(fd, 0, libc::SEEK_SET).unwrap();
        let n = shim.read(fd, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"0123");
        shim.close(fd).unwrap();
    }
}
