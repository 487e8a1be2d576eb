//! The lock hierarchy. Acquire only in this order, release in
//! reverse:
//!
//! 1. [`FreezeLock`] — API calls take it shared; a full writeback takes it
//!    exclusive.
//! 2. a file's `file_op_lock` ([`OpLock`]) — read/write/append/fsync take
//!    it shared, truncate/delete take it exclusive.
//! 3. `fs_meta_lock` ([`crate::fsm::MetaLock`]) — the super/SIT/NAT/node/
//!    dentry/dir-data caches, the allocator, and the active journal
//!    container all live behind this one mutex.
//! 4. a page's `page_lock` (mutex + condvar, see [`crate::cache::page`]).
//! 5. a file's `file_meta_lock` — a lightweight mutex guarding
//!    `size`/`atime`/`mtime`/`nlink` so the read/write hot path doesn't
//!    have to take `fs_meta_lock` (see [`crate::cache::file_obj`]).
//! 6. intra-cache spinlock-equivalents (e.g. the dirty-file set) where a
//!    dirty-set is kept outside `fs_meta_lock` for lock-inversion avoidance.
//!
//! The standard library has no spinlock primitive; every "spinlock" in the
//! spec is modeled here as a plain [`std::sync::Mutex`] held only across a
//! handful of field assignments, which is the idiomatic stand-in.

use std::sync::RwLock;

/// Reader-writer lock gating the whole filesystem against background
/// writeback. Held shared by every API call, exclusive only during
/// `write_back_all_dirty_sync` and shutdown quiesce.
pub type FreezeLock = RwLock<()>;

/// Per-file reader-writer lock serializing ordinary I/O against
/// truncate/delete on that file.
pub type OpLock = RwLock<()>;
