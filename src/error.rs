//! Error taxonomy. Kinds map to errno at the POSIX shim boundary;
//! anything caught while `fs_meta_lock` is held latches the core
//! *unrecoverable* instead of unwinding cleanly — see
//! [`crate::fsm::FileSystemManager::unrecoverable`].

use std::fmt;

#[derive(Debug)]
pub enum CoreError {
    UserPathInvalid,
    NotFound,
    IsADirectory,
    InvalidFd,
    RwConflictsOpenFlag,
    NoFreeNid,
    NoFreeSegment,
    IoError(anyhow::Error),
    AllocError,
    TimerError,
    NotRecoverable,
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::UserPathInvalid => write!(f, "invalid path"),
            CoreError::NotFound => write!(f, "no such file or directory"),
            CoreError::IsADirectory => write!(f, "is a directory"),
            CoreError::InvalidFd => write!(f, "invalid file descriptor"),
            CoreError::RwConflictsOpenFlag => write!(f, "operation conflicts with open flags"),
            CoreError::NoFreeNid => write!(f, "no free nid"),
            CoreError::NoFreeSegment => write!(f, "no free segment"),
            CoreError::IoError(e) => write!(f, "device I/O error: {}", e),
            CoreError::AllocError => write!(f, "host allocation failure"),
            CoreError::TimerError => write!(f, "apply-worker timer error"),
            CoreError::NotRecoverable => write!(f, "filesystem core is unrecoverable"),
        }
    }
}

impl std::error::Error for CoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CoreError::IoError(e) => e.source(),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for CoreError {
    fn from(e: anyhow::Error) -> Self {
        CoreError::IoError(e)
    }
}

impl CoreError {
    /// Maps a core error kind to the errno the POSIX shim surfaces.
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            CoreError::UserPathInvalid => libc::EINVAL,
            CoreError::NotFound => libc::ENOENT,
            CoreError::IsADirectory => libc::EISDIR,
            CoreError::InvalidFd => libc::EBADF,
            CoreError::RwConflictsOpenFlag => libc::EINVAL,
            // Only reachable via shutdown draining; mid-transaction this
            // kind instead latches `NotRecoverable`.
            CoreError::NoFreeNid => libc::ENOSPC,
            CoreError::NoFreeSegment => libc::ENOSPC,
            CoreError::IoError(_) => libc::EIO,
            CoreError::AllocError => libc::ENOMEM,
            CoreError::TimerError => libc::ENOTRECOVERABLE,
            CoreError::NotRecoverable => libc::ENOTRECOVERABLE,
        }
    }

    /// Whether hitting this error while holding `fs_meta_lock` must latch
    /// the core unrecoverable: anything but the handful of
    /// purely-validating errors that can only arise before any metadata
    /// mutation has happened.
    pub fn poisons_core(&self) -> bool {
        !matches!(
            self,
            CoreError::UserPathInvalid
                | CoreError::NotFound
                | CoreError::IsADirectory
                | CoreError::InvalidFd
                | CoreError::RwConflictsOpenFlag
        )
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
