//! Thin helpers over raw libc calls.

use std::ffi::{CString, OsStr};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use crate::error::{FsError, FsResult};

/// Invokes a libc function, turning a `-1` return into the current errno.
macro_rules! syscall {
    ($name:ident ( $($args:expr),* $(,)? )) => {
        match unsafe { libc::$name($($args),*) } {
            -1 => Err($crate::error::FsError::last_os_error()),
            ret => Ok(ret),
        }
    };
}

pub(crate) use syscall;

/// NUL-terminated copy of a path for libc.
pub(crate) fn cpath(path: &Path) -> FsResult<CString> {
    cstr(path.as_os_str())
}

/// NUL-terminated copy of an OS string for libc.
pub(crate) fn cstr(s: &OsStr) -> FsResult<CString> {
    CString::new(s.as_bytes()).map_err(|_| FsError::InvalidPath)
}

/// Length of a successful size-returning call.
#[inline]
pub(crate) fn len(ret: isize) -> usize {
    usize::try_from(ret).unwrap_or(0)
}

#[inline]
pub(crate) fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

#[inline]
pub(crate) fn clear_errno() {
    unsafe { *libc::__errno_location() = 0 };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpath_rejects_interior_nul() {
        let bad = OsStr::from_bytes(b"a\0b");
        assert!(matches!(cstr(bad), Err(FsError::InvalidPath)));
        assert_eq!(cpath(Path::new("/tmp/x")).unwrap().as_bytes(), b"/tmp/x");
    }

    #[test]
    fn test_syscall_maps_errno() {
        let missing = cpath(Path::new("/nonexistent/definitely/not/here")).unwrap();
        let res = syscall!(access(missing.as_ptr(), libc::F_OK));
        assert_eq!(res.unwrap_err().to_errno(), libc::ENOENT);
    }

    #[test]
    fn test_errno_roundtrip() {
        clear_errno();
        assert_eq!(errno(), 0);
    }
}
