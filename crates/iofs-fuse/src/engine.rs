//! The instrumented passthrough engine.
//!
//! [`IoFs`] has one method per [`OpKind`]. Every method starts an
//! [`OpTimer`](iofs_metrics::OpTimer) before its first fallible step, resolves
//! the virtual path(s) against the source root, performs exactly one host
//! operation (or a short sequence on one descriptor) and returns. The timer
//! commits on every exit path, so each invocation is counted once whether it
//! succeeds or fails.
//!
//! Byte-oriented calls (`read`, `write`, `write_buf`) start at 0 units and
//! record the number of bytes actually transferred. Everything else counts
//! one unit per call.
//!
//! Host errors come back as [`FsError::Io`] carrying the original errno.
//! Nothing is retried.

use std::ffi::OsStr;
use std::fs::{self, DirBuilder, File, Permissions};
use std::os::fd::{AsRawFd, FromRawFd};
use std::os::unix::fs::{DirBuilderExt, FileExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use iofs_metrics::{Metrics, OpKind};
use nix::sys::statvfs::statvfs;
use tracing::{debug, info};

use crate::attr::{Attr, StatFs};
use crate::bufvec::BufVec;
use crate::config::ConnConfig;
use crate::dirstream::{DirEntry, DirStream};
use crate::error::{FsError, FsResult};
use crate::handles::{DirHandles, FileHandles};
use crate::path::resolve;
use crate::sys::{self, cpath, cstr, syscall};

/// Target time for `utimens`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeSpec {
    /// Leave the timestamp untouched.
    Omit,
    /// Set to the current time.
    Now,
    At(SystemTime),
}

impl TimeSpec {
    fn to_timespec(self) -> libc::timespec {
        match self {
            TimeSpec::Omit => libc::timespec {
                tv_sec: 0,
                tv_nsec: libc::UTIME_OMIT,
            },
            TimeSpec::Now => libc::timespec {
                tv_sec: 0,
                tv_nsec: libc::UTIME_NOW,
            },
            TimeSpec::At(t) => match t.duration_since(UNIX_EPOCH) {
                Ok(d) => libc::timespec {
                    tv_sec: libc::time_t::try_from(d.as_secs()).unwrap_or(libc::time_t::MAX),
                    tv_nsec: libc::c_long::from(d.subsec_nanos()),
                },
                Err(e) => {
                    let d = e.duration();
                    let mut secs = -libc::time_t::try_from(d.as_secs()).unwrap_or(libc::time_t::MAX);
                    let mut nanos = libc::c_long::from(d.subsec_nanos());
                    if nanos > 0 {
                        secs -= 1;
                        nanos = 1_000_000_000 - nanos;
                    }
                    libc::timespec {
                        tv_sec: secs,
                        tv_nsec: nanos,
                    }
                }
            },
        }
    }
}

/// Passthrough filesystem over a source directory.
///
/// `Send + Sync`; every method takes `&self` and may be called from any
/// number of threads at once. No lock is held across a host call on a
/// file; directory streams are serialized per handle.
#[derive(Debug)]
pub struct IoFs {
    root: PathBuf,
    metrics: Arc<Metrics>,
    files: FileHandles,
    dirs: DirHandles,
}

impl IoFs {
    /// Creates an engine mirroring `root`, recording into `metrics`.
    ///
    /// `root` is used as given; callers canonicalize it beforehand.
    pub fn new(root: impl Into<PathBuf>, metrics: Arc<Metrics>) -> Self {
        Self {
            root: root.into(),
            metrics,
            files: FileHandles::new(),
            dirs: DirHandles::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Number of open file handles.
    pub fn open_files(&self) -> usize {
        self.files.len()
    }

    /// Number of open directory handles.
    pub fn open_dirs(&self) -> usize {
        self.dirs.len()
    }

    #[inline]
    fn resolve(&self, path: &Path) -> PathBuf {
        resolve(&self.root, path)
    }

    fn file(&self, fh: u64) -> FsResult<Arc<File>> {
        self.files.get_cloned(fh)
    }

    // ==== Lifecycle ====

    /// Mount-time negotiation. Switches kernel auto-caching off so that
    /// repeated stats and reads keep reaching the engine and show up in the
    /// metrics.
    pub fn init(&self, conn: &mut ConnConfig) {
        conn.auto_cache = false;
        info!(
            root = %self.root.display(),
            auto_cache = conn.auto_cache,
            kernel_cache = conn.kernel_cache,
            direct_io = conn.direct_io,
            attr_timeout = ?conn.attr_timeout,
            entry_timeout = ?conn.entry_timeout,
            negative_timeout = ?conn.negative_timeout,
            flock = conn.flock,
            "iofs initialized"
        );
    }

    /// Unmount hook; open handles have already been released by then.
    pub fn destroy(&self) {
        info!(
            open_files = self.files.len(),
            open_dirs = self.dirs.len(),
            total_ops = self.metrics.total_ops(),
            "iofs destroyed"
        );
    }

    // ==== Attributes ====

    /// `lstat` on the resolved path.
    pub fn getattr(&self, path: &Path) -> FsResult<Attr> {
        let _timer = self.metrics.timer(OpKind::Getattr);
        let full = self.resolve(path);
        let md = fs::symlink_metadata(&full)?;
        Ok(Attr::from_metadata(&md))
    }

    pub fn chmod(&self, path: &Path, mode: u32) -> FsResult<()> {
        let _timer = self.metrics.timer(OpKind::Chmod);
        let full = self.resolve(path);
        fs::set_permissions(&full, Permissions::from_mode(mode))?;
        Ok(())
    }

    /// Changes ownership of the link itself, never its target. `None`
    /// leaves that id unchanged.
    pub fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> FsResult<()> {
        let _timer = self.metrics.timer(OpKind::Chown);
        let full = self.resolve(path);
        std::os::unix::fs::lchown(&full, uid, gid)?;
        Ok(())
    }

    pub fn truncate(&self, path: &Path, size: u64) -> FsResult<()> {
        let _timer = self.metrics.timer(OpKind::Truncate);
        let full = cpath(&self.resolve(path))?;
        let size = libc::off_t::try_from(size).map_err(|_| FsError::from_errno(libc::EFBIG))?;
        syscall!(truncate(full.as_ptr(), size))?;
        Ok(())
    }

    /// Updates access/modification times without following symlinks.
    pub fn utimens(&self, path: &Path, atime: TimeSpec, mtime: TimeSpec) -> FsResult<()> {
        let _timer = self.metrics.timer(OpKind::Utimens);
        let full = cpath(&self.resolve(path))?;
        let times = [atime.to_timespec(), mtime.to_timespec()];
        syscall!(utimensat(
            libc::AT_FDCWD,
            full.as_ptr(),
            times.as_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        ))?;
        Ok(())
    }

    pub fn access(&self, path: &Path, mask: i32) -> FsResult<()> {
        let _timer = self.metrics.timer(OpKind::Access);
        let full = cpath(&self.resolve(path))?;
        syscall!(access(full.as_ptr(), mask))?;
        Ok(())
    }

    pub fn statfs(&self, path: &Path) -> FsResult<StatFs> {
        let _timer = self.metrics.timer(OpKind::Statfs);
        let full = self.resolve(path);
        let st = statvfs(&full).map_err(|errno| FsError::from_errno(errno as i32))?;
        Ok(StatFs::from_statvfs(&st))
    }

    // ==== Namespace ====

    /// Reads the target of a symlink without following it.
    pub fn readlink(&self, path: &Path) -> FsResult<PathBuf> {
        let _timer = self.metrics.timer(OpKind::Readlink);
        let full = self.resolve(path);
        Ok(fs::read_link(&full)?)
    }

    pub fn mkdir(&self, path: &Path, mode: u32) -> FsResult<()> {
        let _timer = self.metrics.timer(OpKind::Mkdir);
        let full = self.resolve(path);
        DirBuilder::new().mode(mode).create(&full)?;
        Ok(())
    }

    pub fn unlink(&self, path: &Path) -> FsResult<()> {
        let _timer = self.metrics.timer(OpKind::Unlink);
        let full = self.resolve(path);
        fs::remove_file(&full)?;
        Ok(())
    }

    pub fn rmdir(&self, path: &Path) -> FsResult<()> {
        let _timer = self.metrics.timer(OpKind::Rmdir);
        let full = self.resolve(path);
        fs::remove_dir(&full)?;
        Ok(())
    }

    /// Creates a symlink at `link` whose content is `target`, stored
    /// verbatim.
    pub fn symlink(&self, target: &Path, link: &Path) -> FsResult<()> {
        let _timer = self.metrics.timer(OpKind::Symlink);
        let full = self.resolve(link);
        std::os::unix::fs::symlink(target, &full)?;
        Ok(())
    }

    /// `renameat2` with `flags` (`RENAME_NOREPLACE`, `RENAME_EXCHANGE`,
    /// `RENAME_WHITEOUT`) passed through unchanged.
    pub fn rename(&self, from: &Path, to: &Path, flags: u32) -> FsResult<()> {
        let _timer = self.metrics.timer(OpKind::Rename);
        let full_from = cpath(&self.resolve(from))?;
        let full_to = cpath(&self.resolve(to))?;
        syscall!(renameat2(
            libc::AT_FDCWD,
            full_from.as_ptr(),
            libc::AT_FDCWD,
            full_to.as_ptr(),
            flags,
        ))?;
        Ok(())
    }

    /// Hard link `to` pointing at the inode of `from`.
    pub fn link(&self, from: &Path, to: &Path) -> FsResult<()> {
        let _timer = self.metrics.timer(OpKind::Link);
        let full_from = self.resolve(from);
        let full_to = self.resolve(to);
        fs::hard_link(&full_from, &full_to)?;
        Ok(())
    }

    // ==== Extended attributes ====

    pub fn setxattr(&self, path: &Path, name: &OsStr, value: &[u8], flags: i32) -> FsResult<()> {
        let _timer = self.metrics.timer(OpKind::Setxattr);
        let full = cpath(&self.resolve(path))?;
        let name = cstr(name)?;
        syscall!(lsetxattr(
            full.as_ptr(),
            name.as_ptr(),
            value.as_ptr().cast(),
            value.len(),
            flags,
        ))?;
        Ok(())
    }

    /// Reads an attribute value into `buf`. With an empty `buf`, returns the
    /// size the value needs.
    pub fn getxattr(&self, path: &Path, name: &OsStr, buf: &mut [u8]) -> FsResult<usize> {
        let _timer = self.metrics.timer(OpKind::Getxattr);
        let full = cpath(&self.resolve(path))?;
        let name = cstr(name)?;
        let n = syscall!(lgetxattr(
            full.as_ptr(),
            name.as_ptr(),
            out_ptr(buf),
            buf.len(),
        ))?;
        Ok(sys::len(n))
    }

    /// Lists attribute names (NUL-separated) into `buf`. With an empty
    /// `buf`, returns the size the list needs.
    pub fn listxattr(&self, path: &Path, buf: &mut [u8]) -> FsResult<usize> {
        let _timer = self.metrics.timer(OpKind::Listxattr);
        let full = cpath(&self.resolve(path))?;
        let n = syscall!(llistxattr(full.as_ptr(), out_ptr(buf).cast(), buf.len()))?;
        Ok(sys::len(n))
    }

    pub fn removexattr(&self, path: &Path, name: &OsStr) -> FsResult<()> {
        let _timer = self.metrics.timer(OpKind::Removexattr);
        let full = cpath(&self.resolve(path))?;
        let name = cstr(name)?;
        syscall!(lremovexattr(full.as_ptr(), name.as_ptr()))?;
        Ok(())
    }

    // ==== Files ====

    /// Opens the resolved path with the protocol's `flags` and returns a
    /// handle id.
    pub fn open(&self, path: &Path, flags: i32) -> FsResult<u64> {
        let _timer = self.metrics.timer(OpKind::Open);
        let full = cpath(&self.resolve(path))?;
        let fd = syscall!(open(full.as_ptr(), flags))?;
        let file = unsafe { File::from_raw_fd(fd) };
        let fh = self.files.insert(Arc::new(file));
        debug!(fh, path = %path.display(), flags, "open");
        Ok(fh)
    }

    /// Creates and opens the resolved path.
    pub fn create(&self, path: &Path, mode: u32, flags: i32) -> FsResult<u64> {
        let _timer = self.metrics.timer(OpKind::Create);
        let full = cpath(&self.resolve(path))?;
        let fd = syscall!(open(full.as_ptr(), flags | libc::O_CREAT, mode))?;
        let file = unsafe { File::from_raw_fd(fd) };
        let fh = self.files.insert(Arc::new(file));
        debug!(fh, path = %path.display(), flags, mode, "create");
        Ok(fh)
    }

    /// `pread` into `buf`. Units are the bytes actually read.
    pub fn read(&self, fh: u64, buf: &mut [u8], offset: u64) -> FsResult<usize> {
        let mut timer = self.metrics.timer_with_units(OpKind::Read, 0);
        let file = self.file(fh)?;
        let n = file.read_at(buf, offset)?;
        timer.set_units(n as u64);
        Ok(n)
    }

    /// `pwrite` from `data`. Units are the bytes actually written.
    pub fn write(&self, fh: u64, data: &[u8], offset: u64) -> FsResult<usize> {
        let mut timer = self.metrics.timer_with_units(OpKind::Write, 0);
        let file = self.file(fh)?;
        let n = file.write_at(data, offset)?;
        timer.set_units(n as u64);
        Ok(n)
    }

    /// Called on every `close(2)` of a descriptor referring to this open
    /// file, possibly several times. Closes a duplicate so that filesystems
    /// flushing on close (NFS) get to do so, while the handle stays open.
    pub fn flush(&self, fh: u64) -> FsResult<()> {
        let _timer = self.metrics.timer(OpKind::Flush);
        let file = self.file(fh)?;
        let dup = syscall!(dup(file.as_raw_fd()))?;
        syscall!(close(dup))?;
        Ok(())
    }

    /// Drops the handle, closing the descriptor. Always succeeds.
    pub fn release(&self, fh: u64) -> FsResult<()> {
        let _timer = self.metrics.timer(OpKind::Release);
        if self.files.remove(fh).is_some() {
            debug!(fh, "release");
        } else {
            debug!(fh, "release of unknown handle");
        }
        Ok(())
    }

    pub fn fsync(&self, fh: u64, datasync: bool) -> FsResult<()> {
        let _timer = self.metrics.timer(OpKind::Fsync);
        let file = self.file(fh)?;
        if datasync {
            file.sync_data()?;
        } else {
            file.sync_all()?;
        }
        Ok(())
    }

    /// `flock(2)` on the open descriptor.
    pub fn flock(&self, fh: u64, op: i32) -> FsResult<()> {
        let _timer = self.metrics.timer(OpKind::Flock);
        let file = self.file(fh)?;
        syscall!(flock(file.as_raw_fd(), op))?;
        Ok(())
    }

    /// Preallocates `length` bytes at `offset`.
    ///
    /// Only mode 0 is supported; anything else fails with `EOPNOTSUPP`
    /// before the call is timed or reaches the host.
    pub fn fallocate(&self, fh: u64, mode: i32, offset: u64, length: u64) -> FsResult<()> {
        if mode != 0 {
            return Err(FsError::NotSupported);
        }
        let _timer = self.metrics.timer(OpKind::Fallocate);
        let file = self.file(fh)?;
        let offset = libc::off_t::try_from(offset).map_err(|_| FsError::from_errno(libc::EFBIG))?;
        let length = libc::off_t::try_from(length).map_err(|_| FsError::from_errno(libc::EFBIG))?;
        match unsafe { libc::posix_fallocate(file.as_raw_fd(), offset, length) } {
            0 => Ok(()),
            errno => Err(FsError::from_errno(errno)),
        }
    }

    // ==== Zero-copy ====

    /// Copies `buf` into the open file at `offset`. Units are the bytes
    /// copied.
    pub fn write_buf(&self, fh: u64, buf: &BufVec, offset: u64) -> FsResult<usize> {
        let mut timer = self.metrics.timer_with_units(OpKind::WriteBuf, 0);
        let file = self.file(fh)?;
        let n = buf.copy_to_fd(file.as_raw_fd(), offset)?;
        timer.set_units(n as u64);
        Ok(n)
    }

    /// Describes `size` bytes of the open file at `offset` without reading
    /// them. The returned vector borrows the handle's descriptor: consume
    /// it and hand it back with [`BufVec::release`] before releasing `fh`.
    /// Units are the described size, recorded once the vector exists.
    pub fn read_buf(&self, fh: u64, size: usize, offset: u64) -> FsResult<BufVec> {
        let mut timer = self.metrics.timer_with_units(OpKind::ReadBuf, 0);
        let file = self.file(fh)?;
        let buf = BufVec::try_alloc_fd(file.as_raw_fd(), offset, size)?;
        timer.set_units(size as u64);
        Ok(buf)
    }

    // ==== Directories ====

    /// Opens a directory stream and returns its handle id. A host failure
    /// installs nothing.
    pub fn opendir(&self, path: &Path) -> FsResult<u64> {
        let stream = {
            let _timer = self.metrics.timer(OpKind::Opendir);
            DirStream::open(&self.resolve(path))?
        };
        let fh = self.dirs.insert(Arc::new(Mutex::new(stream)));
        debug!(fh, path = %path.display(), "opendir");
        Ok(fh)
    }

    /// Lists entries from `offset` into `filler` until the stream ends or
    /// `filler` returns `true`. See [`DirStream::read`].
    pub fn readdir<F>(&self, fh: u64, offset: i64, plus: bool, filler: F) -> FsResult<usize>
    where
        F: FnMut(DirEntry) -> bool,
    {
        let _timer = self.metrics.timer(OpKind::Readdir);
        let stream = self.dirs.get_cloned(fh)?;
        let mut stream = stream.lock().unwrap_or_else(PoisonError::into_inner);
        stream.read(offset, plus, filler)
    }

    /// Drops the directory handle, closing the host stream.
    pub fn releasedir(&self, fh: u64) -> FsResult<()> {
        let _timer = self.metrics.timer(OpKind::Releasedir);
        if self.dirs.remove(fh).is_some() {
            debug!(fh, "releasedir");
        }
        Ok(())
    }
}

/// Output pointer for size-probing calls: null for an empty buffer.
fn out_ptr(buf: &mut [u8]) -> *mut libc::c_void {
    if buf.is_empty() {
        ptr::null_mut()
    } else {
        buf.as_mut_ptr().cast()
    }
}
