//! Buffer vectors for the zero-copy read/write path.
//!
//! A [`BufVec`] describes data either held in memory or still sitting in a
//! file descriptor. The write path copies a caller's vector straight into
//! the open file (`copy_file_range` for descriptor-backed parts); the read
//! path hands back a descriptor-backed vector instead of reading the bytes
//! itself.
//!
//! # Boundary contract
//!
//! Descriptor-backed vectors returned by the engine are created only by
//! [`BufVec::try_alloc_fd`] and must be given back through
//! [`BufVec::release`]. The descriptor inside is *borrowed* from the open
//! file handle: releasing the vector never closes it, and the vector must not
//! outlive the matching `release` of that handle.

use std::os::fd::RawFd;

use crate::error::{FsError, FsResult};
use crate::sys::{self, syscall};

/// Bounce buffer size when the kernel cannot copy between the descriptors.
const BOUNCE_SIZE: usize = 64 * 1024;

/// One segment of a [`BufVec`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Buf {
    /// Bytes held in memory.
    Mem(Vec<u8>),
    /// `size` bytes readable from `fd`, at `pos` or at the current position.
    Fd {
        fd: RawFd,
        pos: Option<u64>,
        size: usize,
    },
}

impl Buf {
    pub fn len(&self) -> usize {
        match self {
            Buf::Mem(data) => data.len(),
            Buf::Fd { size, .. } => *size,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Ordered list of buffer segments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufVec {
    bufs: Vec<Buf>,
}

impl BufVec {
    pub fn new(bufs: Vec<Buf>) -> Self {
        Self { bufs }
    }

    /// Vector with a single in-memory segment.
    pub fn from_mem(data: Vec<u8>) -> Self {
        Self {
            bufs: vec![Buf::Mem(data)],
        }
    }

    /// Allocates a vector describing `size` bytes of `fd` at `offset`.
    ///
    /// Fails with [`FsError::OutOfMemory`] if the descriptor cannot be
    /// allocated. Give the result back with [`BufVec::release`].
    pub fn try_alloc_fd(fd: RawFd, offset: u64, size: usize) -> FsResult<Self> {
        let mut bufs = Vec::new();
        bufs.try_reserve_exact(1)
            .map_err(|_| FsError::OutOfMemory)?;
        bufs.push(Buf::Fd {
            fd,
            pos: Some(offset),
            size,
        });
        Ok(Self { bufs })
    }

    /// Returns a vector obtained from [`BufVec::try_alloc_fd`].
    ///
    /// Borrowed descriptors are left open.
    pub fn release(self) {
        drop(self);
    }

    pub fn bufs(&self) -> &[Buf] {
        &self.bufs
    }

    /// Total bytes described by all segments.
    pub fn size(&self) -> usize {
        self.bufs.iter().map(Buf::len).sum()
    }

    /// Copies every segment into `dst` starting at `offset`.
    ///
    /// Stops at the first short transfer (e.g. the source hit EOF). Returns
    /// the number of bytes copied; an error is returned only when nothing
    /// was copied.
    pub fn copy_to_fd(&self, dst: RawFd, offset: u64) -> FsResult<usize> {
        let mut copied = 0usize;
        for buf in &self.bufs {
            let dst_pos = offset + copied as u64;
            let res = match buf {
                Buf::Mem(data) => write_all_at(dst, data, dst_pos),
                Buf::Fd { fd, pos, size } => copy_fd_range(*fd, *pos, dst, dst_pos, *size),
            };
            match res {
                Ok(n) => {
                    copied += n;
                    if n < buf.len() {
                        break;
                    }
                }
                Err(e) if copied == 0 => return Err(e),
                Err(_) => break,
            }
        }
        Ok(copied)
    }

    /// Reads every segment into memory.
    ///
    /// Descriptor-backed segments may come back short at end of file.
    pub fn read_to_vec(&self) -> FsResult<Vec<u8>> {
        let mut out = Vec::new();
        out.try_reserve(self.size())
            .map_err(|_| FsError::OutOfMemory)?;
        for buf in &self.bufs {
            match buf {
                Buf::Mem(data) => out.extend_from_slice(data),
                Buf::Fd { fd, pos, size } => {
                    let start = out.len();
                    out.resize(start + size, 0);
                    let n = read_fill(*fd, *pos, &mut out[start..])?;
                    out.truncate(start + n);
                    if n < *size {
                        break;
                    }
                }
            }
        }
        Ok(out)
    }
}

fn write_all_at(fd: RawFd, data: &[u8], offset: u64) -> FsResult<usize> {
    let mut written = 0usize;
    while written < data.len() {
        let rest = &data[written..];
        let n = syscall!(pwrite(
            fd,
            rest.as_ptr().cast(),
            rest.len(),
            to_off(offset + written as u64)?,
        ));
        match n {
            Ok(0) => break,
            Ok(n) => written += sys::len(n),
            Err(e) if written == 0 => return Err(e),
            Err(_) => break,
        }
    }
    Ok(written)
}

fn read_fill(fd: RawFd, pos: Option<u64>, buf: &mut [u8]) -> FsResult<usize> {
    let mut filled = 0usize;
    while filled < buf.len() {
        let rest = &mut buf[filled..];
        let n = match pos {
            Some(pos) => syscall!(pread(
                fd,
                rest.as_mut_ptr().cast(),
                rest.len(),
                to_off(pos + filled as u64)?,
            )),
            None => syscall!(read(fd, rest.as_mut_ptr().cast(), rest.len())),
        };
        match n {
            Ok(0) => break,
            Ok(n) => filled += sys::len(n),
            Err(e) if filled == 0 => return Err(e),
            Err(_) => break,
        }
    }
    Ok(filled)
}

/// Kernel-side copy between descriptors, bouncing through memory when the
/// pair is not supported by `copy_file_range`.
fn copy_fd_range(
    src: RawFd,
    src_pos: Option<u64>,
    dst: RawFd,
    dst_pos: u64,
    len: usize,
) -> FsResult<usize> {
    let mut off_in = match src_pos {
        Some(p) => Some(to_off(p)?),
        None => None,
    };
    let mut off_out = to_off(dst_pos)?;
    let mut copied = 0usize;

    while copied < len {
        let in_ptr = off_in
            .as_mut()
            .map_or(std::ptr::null_mut(), |o| std::ptr::from_mut(o));
        let res = syscall!(copy_file_range(
            src,
            in_ptr,
            dst,
            &raw mut off_out,
            len - copied,
            0,
        ));
        match res {
            Ok(0) => break,
            Ok(n) => copied += sys::len(n),
            Err(e) if copied == 0 && needs_bounce(e.to_errno()) => {
                return bounce_copy(src, src_pos, dst, dst_pos, len);
            }
            Err(e) if copied == 0 => return Err(e),
            Err(_) => break,
        }
    }
    Ok(copied)
}

fn needs_bounce(errno: i32) -> bool {
    matches!(
        errno,
        libc::ENOSYS | libc::EXDEV | libc::EINVAL | libc::EOPNOTSUPP | libc::EBADF
    )
}

fn bounce_copy(
    src: RawFd,
    src_pos: Option<u64>,
    dst: RawFd,
    dst_pos: u64,
    len: usize,
) -> FsResult<usize> {
    let mut chunk = vec![0u8; BOUNCE_SIZE.min(len.max(1))];
    let mut copied = 0usize;
    while copied < len {
        let want = chunk.len().min(len - copied);
        let pos = src_pos.map(|p| p + copied as u64);
        let n = match read_fill(src, pos, &mut chunk[..want]) {
            Ok(n) => n,
            Err(e) if copied == 0 => return Err(e),
            Err(_) => break,
        };
        if n == 0 {
            break;
        }
        let w = write_all_at(dst, &chunk[..n], dst_pos + copied as u64)?;
        copied += w;
        if w < n || n < want {
            break;
        }
    }
    Ok(copied)
}

fn to_off(pos: u64) -> FsResult<libc::off_t> {
    libc::off_t::try_from(pos).map_err(|_| FsError::from_errno(libc::EINVAL))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File, OpenOptions};
    use std::os::fd::AsRawFd;
    use tempfile::TempDir;

    fn rw(path: &std::path::Path) -> File {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .unwrap()
    }

    #[test]
    fn test_size_sums_segments() {
        let v = BufVec::new(vec![
            Buf::Mem(vec![1, 2, 3]),
            Buf::Fd {
                fd: 0,
                pos: Some(0),
                size: 10,
            },
        ]);
        assert_eq!(v.size(), 13);
        assert_eq!(BufVec::default().size(), 0);
    }

    #[test]
    fn test_alloc_fd_describes_range() {
        let v = BufVec::try_alloc_fd(7, 128, 64).unwrap();
        assert_eq!(
            v.bufs(),
            &[Buf::Fd {
                fd: 7,
                pos: Some(128),
                size: 64
            }]
        );
        v.release();
    }

    #[test]
    fn test_mem_copy_to_fd() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("dst");
        let dst = rw(&path);

        let n = BufVec::from_mem(b"hello".to_vec())
            .copy_to_fd(dst.as_raw_fd(), 3)
            .unwrap();
        assert_eq!(n, 5);
        assert_eq!(fs::read(&path).unwrap(), b"\0\0\0hello");
    }

    #[test]
    fn test_fd_copy_to_fd() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("src"), b"0123456789").unwrap();
        let src = File::open(tmp.path().join("src")).unwrap();
        let dst_path = tmp.path().join("dst");
        let dst = rw(&dst_path);

        let v = BufVec::try_alloc_fd(src.as_raw_fd(), 2, 5).unwrap();
        assert_eq!(v.copy_to_fd(dst.as_raw_fd(), 0).unwrap(), 5);
        assert_eq!(fs::read(&dst_path).unwrap(), b"23456");
    }

    #[test]
    fn test_fd_copy_short_at_eof() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("src"), b"abc").unwrap();
        let src = File::open(tmp.path().join("src")).unwrap();
        let dst = rw(&tmp.path().join("dst"));

        let v = BufVec::try_alloc_fd(src.as_raw_fd(), 1, 100).unwrap();
        assert_eq!(v.copy_to_fd(dst.as_raw_fd(), 0).unwrap(), 2);
    }

    #[test]
    fn test_bounce_copy_matches_kernel_copy() {
        let tmp = TempDir::new().unwrap();
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        fs::write(tmp.path().join("src"), &data).unwrap();
        let src = File::open(tmp.path().join("src")).unwrap();
        let dst_path = tmp.path().join("dst");
        let dst = rw(&dst_path);

        let n = bounce_copy(src.as_raw_fd(), Some(0), dst.as_raw_fd(), 0, data.len()).unwrap();
        assert_eq!(n, data.len());
        assert_eq!(fs::read(&dst_path).unwrap(), data);
    }

    #[test]
    fn test_read_to_vec() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("f"), b"abcdef").unwrap();
        let f = File::open(tmp.path().join("f")).unwrap();

        let v = BufVec::new(vec![
            Buf::Mem(b">".to_vec()),
            Buf::Fd {
                fd: f.as_raw_fd(),
                pos: Some(2),
                size: 3,
            },
        ]);
        assert_eq!(v.read_to_vec().unwrap(), b">cde");

        let past_end = BufVec::try_alloc_fd(f.as_raw_fd(), 4, 10).unwrap();
        assert_eq!(past_end.read_to_vec().unwrap(), b"ef");
    }

    #[test]
    fn test_bad_source_fd_fails() {
        let tmp = TempDir::new().unwrap();
        let dst = rw(&tmp.path().join("dst"));
        let v = BufVec::try_alloc_fd(-1, 0, 10).unwrap();
        assert_eq!(
            v.copy_to_fd(dst.as_raw_fd(), 0).unwrap_err().to_errno(),
            libc::EBADF
        );
    }
}
