//! Attribute records built from host `stat`/`statvfs` results.

use nix::sys::statvfs::Statvfs;
use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// File attributes as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attr {
    pub ino: u64,
    /// Type and permission bits (`st_mode`).
    pub mode: u32,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: u64,
    pub blocks: u64,
    pub blksize: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

impl Attr {
    /// Copies the fields of a host `stat`.
    pub fn from_stat(st: &libc::stat) -> Self {
        Self {
            ino: st.st_ino,
            mode: st.st_mode,
            nlink: u64::from(st.st_nlink),
            uid: st.st_uid,
            gid: st.st_gid,
            rdev: st.st_rdev,
            size: u64::try_from(st.st_size).unwrap_or(0),
            blocks: u64::try_from(st.st_blocks).unwrap_or(0),
            blksize: u32::try_from(st.st_blksize).unwrap_or(4096),
            atime: timespec_to_system_time(st.st_atime, st.st_atime_nsec),
            mtime: timespec_to_system_time(st.st_mtime, st.st_mtime_nsec),
            ctime: timespec_to_system_time(st.st_ctime, st.st_ctime_nsec),
        }
    }

    /// Copies the fields of std metadata (from `lstat` when obtained via
    /// `symlink_metadata`).
    pub fn from_metadata(md: &Metadata) -> Self {
        Self {
            ino: md.ino(),
            mode: md.mode(),
            nlink: md.nlink(),
            uid: md.uid(),
            gid: md.gid(),
            rdev: md.rdev(),
            size: md.size(),
            blocks: md.blocks(),
            blksize: u32::try_from(md.blksize()).unwrap_or(4096),
            atime: timespec_to_system_time(md.atime(), md.atime_nsec()),
            mtime: timespec_to_system_time(md.mtime(), md.mtime_nsec()),
            ctime: timespec_to_system_time(md.ctime(), md.ctime_nsec()),
        }
    }

    /// Placeholder record carrying only an inode number and the coarse
    /// type from a directory entry's `d_type`.
    pub fn minimal(ino: u64, d_type: u8) -> Self {
        Self {
            ino,
            mode: u32::from(d_type) << 12,
            nlink: 0,
            uid: 0,
            gid: 0,
            rdev: 0,
            size: 0,
            blocks: 0,
            blksize: 0,
            atime: UNIX_EPOCH,
            mtime: UNIX_EPOCH,
            ctime: UNIX_EPOCH,
        }
    }

    /// File type bits (`S_IFMT` part of the mode).
    #[inline]
    pub fn file_type(&self) -> u32 {
        self.mode & libc::S_IFMT
    }

    /// Permission bits including setuid/setgid/sticky.
    #[inline]
    pub fn perm(&self) -> u16 {
        (self.mode & 0o7777) as u16
    }

    pub fn is_dir(&self) -> bool {
        self.file_type() == libc::S_IFDIR
    }
}

/// Filesystem statistics as reported by `statvfs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatFs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

impl StatFs {
    pub fn from_statvfs(st: &Statvfs) -> Self {
        Self {
            blocks: u64::from(st.blocks()),
            bfree: u64::from(st.blocks_free()),
            bavail: u64::from(st.blocks_available()),
            files: u64::from(st.files()),
            ffree: u64::from(st.files_free()),
            bsize: u32::try_from(st.block_size()).unwrap_or(u32::MAX),
            namelen: u32::try_from(st.name_max()).unwrap_or(u32::MAX),
            frsize: u32::try_from(st.fragment_size()).unwrap_or(u32::MAX),
        }
    }
}

fn timespec_to_system_time(secs: i64, nsecs: i64) -> SystemTime {
    let nanos = u32::try_from(nsecs).unwrap_or(0);
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs.unsigned_abs(), nanos)
    } else {
        UNIX_EPOCH - Duration::new(secs.unsigned_abs(), 0) + Duration::from_nanos(u64::from(nanos))
    }
}
