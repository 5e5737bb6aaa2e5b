//! Error handling and errno mapping for the passthrough engine.
//!
//! Host failures are carried as [`io::Error`] and surface to the kernel
//! with their original errno. The remaining variants cover the few
//! conditions the engine raises itself.

use std::io;
use thiserror::Error;

/// Errors returned by engine operations.
#[derive(Debug, Error)]
pub enum FsError {
    /// Host system call failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// No open file or directory under this handle id.
    #[error("Invalid file handle: {0}")]
    InvalidHandle(u64),

    /// Requested mode is not supported (e.g. fallocate flags).
    #[error("Operation not supported")]
    NotSupported,

    /// A zero-copy buffer descriptor could not be allocated.
    #[error("Out of memory preparing buffer")]
    OutOfMemory,

    /// Path or name contains an interior NUL byte.
    #[error("Invalid path")]
    InvalidPath,
}

impl FsError {
    /// Converts this error to a libc error code.
    pub fn to_errno(&self) -> i32 {
        match self {
            FsError::Io(e) => io_error_to_errno(e),
            FsError::InvalidHandle(_) => libc::EBADF,
            FsError::NotSupported => libc::EOPNOTSUPP,
            FsError::OutOfMemory => libc::ENOMEM,
            FsError::InvalidPath => libc::EINVAL,
        }
    }

    /// Builds an error from the calling thread's current errno.
    pub fn last_os_error() -> Self {
        FsError::Io(io::Error::last_os_error())
    }

    /// Builds an error from a raw errno value.
    pub fn from_errno(errno: i32) -> Self {
        FsError::Io(io::Error::from_raw_os_error(errno))
    }
}

/// Result type for engine operations.
pub type FsResult<T> = Result<T, FsError>;

/// Maps an io error to its errno, `EIO` when it carries none.
pub fn io_error_to_errno(e: &io::Error) -> i32 {
    e.raw_os_error().unwrap_or(libc::EIO)
}

/// Extension trait to convert errors to errno.
pub trait ToErrno {
    /// Converts this error to a libc error code.
    fn to_errno(&self) -> i32;
}

impl ToErrno for io::Error {
    fn to_errno(&self) -> i32 {
        io_error_to_errno(self)
    }
}

impl ToErrno for FsError {
    fn to_errno(&self) -> i32 {
        FsError::to_errno(self)
    }
}

/// Collapses a result into the integer convention of the kernel protocol:
/// the non-negative count on success, `-errno` on failure.
pub fn reply_code(result: &FsResult<usize>) -> i32 {
    match result {
        Ok(n) => i32::try_from(*n).unwrap_or(i32::MAX),
        Err(e) => -e.to_errno(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_passthrough() {
        for code in [
            libc::ENOENT,
            libc::EACCES,
            libc::EEXIST,
            libc::ENOTDIR,
            libc::EISDIR,
            libc::ENOSPC,
            libc::ENOTEMPTY,
            libc::EXDEV,
        ] {
            let e = FsError::from(io::Error::from_raw_os_error(code));
            assert_eq!(e.to_errno(), code, "errno {code} must pass through");
        }
    }

    #[test]
    fn test_io_error_without_os_code() {
        let e = FsError::Io(io::Error::other("custom"));
        assert_eq!(e.to_errno(), libc::EIO);
    }

    #[test]
    fn test_engine_variants() {
        assert_eq!(FsError::InvalidHandle(7).to_errno(), libc::EBADF);
        assert_eq!(FsError::NotSupported.to_errno(), libc::EOPNOTSUPP);
        assert_eq!(FsError::OutOfMemory.to_errno(), libc::ENOMEM);
        assert_eq!(FsError::InvalidPath.to_errno(), libc::EINVAL);
    }

    #[test]
    fn test_display_names_handle() {
        assert!(FsError::InvalidHandle(42).to_string().contains("42"));
    }

    #[test]
    fn test_reply_code() {
        assert_eq!(reply_code(&Ok(0)), 0);
        assert_eq!(reply_code(&Ok(4096)), 4096);
        assert_eq!(reply_code(&Err(FsError::from_errno(libc::ENOENT))), -libc::ENOENT);
        assert_eq!(reply_code(&Err(FsError::NotSupported)), -libc::EOPNOTSUPP);
    }

    #[test]
    fn test_to_errno_trait() {
        let e = io::Error::from_raw_os_error(libc::EPERM);
        assert_eq!(ToErrno::to_errno(&e), libc::EPERM);
    }
}
