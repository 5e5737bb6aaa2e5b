//! Offset-resumable directory cursor.
//!
//! A [`DirStream`] wraps a host `DIR*` plus the entry most recently fetched
//! but not yet accepted by the consumer, and the offset last served to the
//! kernel. The kernel resumes listings with the offset that accompanied the
//! last entry it accepted, so every entry is handed out together with the
//! stream position *after* it (`telldir` once the entry is consumed).
//!
//! When the consumer reports its buffer full, the rejected entry stays
//! buffered and the stored offset is left alone; the next call with the
//! same offset re-emits exactly that entry. Any other offset seeks the host
//! stream and discards the buffer.

use std::ffi::{CStr, OsStr, OsString};
use std::mem::MaybeUninit;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr::NonNull;

use tracing::trace;

use crate::attr::Attr;
use crate::error::{FsError, FsResult};
use crate::sys::{self, cpath, cstr};

/// One directory entry handed to a listing consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: OsString,
    /// Full attributes when prefetched, otherwise inode plus coarse type.
    pub attr: Attr,
    /// Offset that resumes the listing right after this entry.
    pub next_offset: i64,
    /// Whether `attr` came from a successful `fstatat`.
    pub prefetched: bool,
}

impl DirEntry {
    pub fn is_dot(&self) -> bool {
        matches!(self.name.as_bytes(), b"." | b"..")
    }
}

#[derive(Debug)]
struct RawEntry {
    name: OsString,
    ino: u64,
    d_type: u8,
}

/// Open host directory stream with resume state.
#[derive(Debug)]
pub struct DirStream {
    dir: NonNull<libc::DIR>,
    entry: Option<RawEntry>,
    offset: i64,
}

// The DIR* is only touched through `&mut self` and never shared between
// streams.
unsafe impl Send for DirStream {}

impl DirStream {
    /// Opens the host directory at `path`, positioned at offset 0.
    pub fn open(path: &Path) -> FsResult<Self> {
        let c_path = cpath(path)?;
        let dp = unsafe { libc::opendir(c_path.as_ptr()) };
        let dir = NonNull::new(dp).ok_or_else(FsError::last_os_error)?;
        Ok(Self {
            dir,
            entry: None,
            offset: 0,
        })
    }

    /// Offset the stream last served up to.
    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Feeds entries starting at `offset` into `filler` until the stream
    /// ends or `filler` returns `true` ("buffer full").
    ///
    /// With `plus`, each entry's attributes are fetched with `fstatat`;
    /// failures fall back silently to the minimal record. Returns the number
    /// of entries the consumer accepted. End of stream is not an error.
    pub fn read<F>(&mut self, offset: i64, plus: bool, mut filler: F) -> FsResult<usize>
    where
        F: FnMut(DirEntry) -> bool,
    {
        if offset != self.offset {
            trace!(from = self.offset, to = offset, "seekdir");
            unsafe { libc::seekdir(self.dir.as_ptr(), offset) };
            self.entry = None;
            self.offset = offset;
        }

        let mut accepted = 0;
        loop {
            if self.entry.is_none() {
                match self.next_raw()? {
                    Some(raw) => self.entry = Some(raw),
                    None => break,
                }
            }
            let Some(raw) = self.entry.as_ref() else {
                break;
            };

            let full_attr = if plus { self.stat_at(&raw.name) } else { None };
            let prefetched = full_attr.is_some();
            let attr = full_attr.unwrap_or_else(|| Attr::minimal(raw.ino, raw.d_type));
            let next_offset = self.tell();

            let entry = DirEntry {
                name: raw.name.clone(),
                attr,
                next_offset,
                prefetched,
            };
            if filler(entry) {
                break;
            }

            self.entry = None;
            self.offset = next_offset;
            accepted += 1;
        }
        Ok(accepted)
    }

    fn next_raw(&mut self) -> FsResult<Option<RawEntry>> {
        sys::clear_errno();
        let dp = unsafe { libc::readdir(self.dir.as_ptr()) };
        if dp.is_null() {
            return match sys::errno() {
                0 => Ok(None),
                errno => Err(FsError::from_errno(errno)),
            };
        }

        let raw = unsafe { &*dp };
        let name = unsafe { CStr::from_ptr(raw.d_name.as_ptr()) };
        Ok(Some(RawEntry {
            name: OsStr::from_bytes(name.to_bytes()).to_os_string(),
            ino: raw.d_ino,
            d_type: raw.d_type,
        }))
    }

    fn stat_at(&self, name: &OsStr) -> Option<Attr> {
        let c_name = cstr(name).ok()?;
        let mut st = MaybeUninit::<libc::stat>::uninit();
        let fd = unsafe { libc::dirfd(self.dir.as_ptr()) };
        let res = unsafe {
            libc::fstatat(
                fd,
                c_name.as_ptr(),
                st.as_mut_ptr(),
                libc::AT_SYMLINK_NOFOLLOW,
            )
        };
        if res == -1 {
            return None;
        }
        let st = unsafe { st.assume_init() };
        Some(Attr::from_stat(&st))
    }

    fn tell(&self) -> i64 {
        unsafe { libc::telldir(self.dir.as_ptr()) }
    }
}

impl Drop for DirStream {
    fn drop(&mut self) {
        unsafe {
            libc::closedir(self.dir.as_ptr());
        }
    }
}
