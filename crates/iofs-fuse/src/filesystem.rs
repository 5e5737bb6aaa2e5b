//! FUSE protocol adapter.
//!
//! Implements the fuser `Filesystem` trait on top of the path-based
//! [`IoFs`] engine. The adapter owns the inode table; every request is
//! translated to virtual paths, handed to the engine and its result turned
//! into the matching reply.
//!
//! # Request Mapping
//!
//! | Request | Engine calls |
//! |---------|--------------|
//! | lookup/getattr | getattr |
//! | setattr | chmod, chown, truncate, utimens (each present field), then getattr |
//! | mkdir/symlink/link/create | the operation, then getattr |
//! | read/write | read/write, or read_buf/write_buf in zero-copy mode |
//! | readdir/readdirplus | readdir without/with attribute prefetch |
//! | setlk | flock |
//!
//! Everything else maps one to one.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyDirectoryPlus, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs,
    ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use libc::c_int;
use tracing::{debug, trace, warn};

use crate::attr::Attr;
use crate::bufvec::BufVec;
use crate::config::ConnConfig;
use crate::dirstream::DirEntry;
use crate::engine::{IoFs, TimeSpec};
use crate::error::FsResult;
use crate::inode::{InodeTable, ROOT_INODE};
use crate::path::child;

/// FUSE filesystem mirroring a source directory through [`IoFs`].
pub struct IoFsFuse {
    engine: Arc<IoFs>,
    inodes: InodeTable,
    conn: ConnConfig,
    zero_copy: bool,
}

impl IoFsFuse {
    /// Wraps `engine`. `conn` is the starting point for the negotiation in
    /// `init`.
    pub fn new(engine: Arc<IoFs>, conn: ConnConfig, zero_copy: bool) -> Self {
        Self {
            engine,
            inodes: InodeTable::new(),
            conn,
            zero_copy,
        }
    }

    pub fn engine(&self) -> &Arc<IoFs> {
        &self.engine
    }

    /// Connection settings as adjusted by the engine.
    pub fn conn(&self) -> &ConnConfig {
        &self.conn
    }

    fn attr_ttl(&self) -> Duration {
        self.conn.effective_attr_ttl()
    }

    fn entry_ttl(&self) -> Duration {
        self.conn.effective_entry_ttl()
    }

    fn open_flags(&self) -> u32 {
        if self.conn.keep_cache() {
            fuser::consts::FOPEN_KEEP_CACHE
        } else {
            0
        }
    }

    fn path_of(&self, ino: u64) -> Result<PathBuf, c_int> {
        self.inodes.path(ino).ok_or(libc::ENOENT)
    }

    fn child_of(&self, parent: u64, name: &OsStr) -> Result<PathBuf, c_int> {
        Ok(child(&self.path_of(parent)?, name))
    }

    fn parent_ino(&self, dir: &Path) -> u64 {
        dir.parent()
            .and_then(|parent| self.inodes.get_inode(parent))
            .unwrap_or(ROOT_INODE)
    }

    /// Stats `path` and replies with an entry counted as one lookup.
    fn reply_entry(&self, path: &Path, reply: ReplyEntry) {
        match self.engine.getattr(path) {
            Ok(attr) => {
                let ino = self.inodes.lookup(path);
                reply.entry(&self.entry_ttl(), &file_attr(ino, &attr), 0);
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }
}

/// Maps the type bits of a host mode to the protocol's file type.
pub fn file_type(mode: u32) -> FileType {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFLNK => FileType::Symlink,
        libc::S_IFCHR => FileType::CharDevice,
        libc::S_IFBLK => FileType::BlockDevice,
        libc::S_IFIFO => FileType::NamedPipe,
        libc::S_IFSOCK => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

/// Converts host attributes to a protocol record under inode `ino`.
pub fn file_attr(ino: u64, attr: &Attr) -> FileAttr {
    FileAttr {
        ino,
        size: attr.size,
        blocks: attr.blocks,
        atime: attr.atime,
        mtime: attr.mtime,
        ctime: attr.ctime,
        crtime: attr.ctime,
        kind: file_type(attr.mode),
        perm: attr.perm(),
        nlink: u32::try_from(attr.nlink).unwrap_or(u32::MAX),
        uid: attr.uid,
        gid: attr.gid,
        rdev: u32::try_from(attr.rdev).unwrap_or(0),
        blksize: attr.blksize,
        flags: 0,
    }
}

fn time_spec(time: Option<TimeOrNow>) -> TimeSpec {
    match time {
        None => TimeSpec::Omit,
        Some(TimeOrNow::Now) => TimeSpec::Now,
        Some(TimeOrNow::SpecificTime(t)) => TimeSpec::At(t),
    }
}

/// `setlk` lock type to a `flock(2)` operation.
fn flock_op(typ: i32, sleep: bool) -> Option<i32> {
    let op = match typ {
        libc::F_RDLCK => libc::LOCK_SH,
        libc::F_WRLCK => libc::LOCK_EX,
        libc::F_UNLCK => libc::LOCK_UN,
        _ => return None,
    };
    Some(if sleep { op } else { op | libc::LOCK_NB })
}

/// Inode reported for a plain `readdir` entry: the known inode if the kernel
/// already holds a reference to the path, otherwise the host inode. The
/// kernel does not use `d_ino` to instantiate inodes.
fn listing_ino(
    inodes: &InodeTable,
    dir: &Path,
    dir_ino: u64,
    parent_ino: u64,
    entry: &DirEntry,
) -> u64 {
    match entry.name.as_bytes() {
        b"." => dir_ino,
        b".." => parent_ino,
        _ => inodes
            .get_inode(&child(dir, &entry.name))
            .unwrap_or(entry.attr.ino),
    }
}

macro_rules! try_reply {
    ($reply:expr, $e:expr) => {
        match $e {
            Ok(v) => v,
            Err(errno) => {
                $reply.error(errno);
                return;
            }
        }
    };
}

impl Filesystem for IoFsFuse {
    fn init(&mut self, _req: &Request<'_>, config: &mut KernelConfig) -> Result<(), c_int> {
        self.engine.init(&mut self.conn);
        if self.conn.flock
            && config
                .add_capabilities(fuser::consts::FUSE_FLOCK_LOCKS)
                .is_err()
        {
            warn!("kernel does not support flock forwarding");
        }
        Ok(())
    }

    fn destroy(&mut self) {
        self.engine.destroy();
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        trace!(parent, name = ?name, "lookup");
        let path = try_reply!(reply, self.child_of(parent, name));
        self.reply_entry(&path, reply);
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        trace!(inode = ino, nlookup, "forget");
        self.inodes.forget(ino, nlookup);
    }

    fn batch_forget(&mut self, _req: &Request<'_>, nodes: &[fuser::fuse_forget_one]) {
        trace!(count = nodes.len(), "batch_forget");
        for node in nodes {
            self.inodes.forget(node.nodeid, node.nlookup);
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        trace!(inode = ino, "getattr");
        let path = try_reply!(reply, self.path_of(ino));
        match self.engine.getattr(&path) {
            Ok(attr) => reply.attr(&self.attr_ttl(), &file_attr(ino, &attr)),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        trace!(inode = ino, ?mode, ?uid, ?gid, ?size, "setattr");
        let path = try_reply!(reply, self.path_of(ino));
        let engine = &self.engine;
        let result = (|| -> FsResult<Attr> {
            if let Some(mode) = mode {
                engine.chmod(&path, mode)?;
            }
            if uid.is_some() || gid.is_some() {
                engine.chown(&path, uid, gid)?;
            }
            if let Some(size) = size {
                engine.truncate(&path, size)?;
            }
            if atime.is_some() || mtime.is_some() {
                engine.utimens(&path, time_spec(atime), time_spec(mtime))?;
            }
            engine.getattr(&path)
        })();
        match result {
            Ok(attr) => reply.attr(&self.attr_ttl(), &file_attr(ino, &attr)),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        trace!(inode = ino, "readlink");
        let path = try_reply!(reply, self.path_of(ino));
        match self.engine.readlink(&path) {
            Ok(target) => reply.data(target.as_os_str().as_bytes()),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        trace!(parent, name = ?name, mode, "mkdir");
        let path = try_reply!(reply, self.child_of(parent, name));
        match self.engine.mkdir(&path, mode & !umask) {
            Ok(()) => self.reply_entry(&path, reply),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        trace!(parent, name = ?name, "unlink");
        let path = try_reply!(reply, self.child_of(parent, name));
        match self.engine.unlink(&path) {
            Ok(()) => {
                self.inodes.invalidate_path(&path);
                reply.ok();
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        trace!(parent, name = ?name, "rmdir");
        let path = try_reply!(reply, self.child_of(parent, name));
        match self.engine.rmdir(&path) {
            Ok(()) => {
                self.inodes.invalidate_path(&path);
                reply.ok();
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        trace!(parent, name = ?link_name, target = %target.display(), "symlink");
        let path = try_reply!(reply, self.child_of(parent, link_name));
        match self.engine.symlink(target, &path) {
            Ok(()) => self.reply_entry(&path, reply),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        trace!(parent, name = ?name, newparent, newname = ?newname, flags, "rename");
        let from = try_reply!(reply, self.child_of(parent, name));
        let to = try_reply!(reply, self.child_of(newparent, newname));
        match self.engine.rename(&from, &to, flags) {
            Ok(()) => {
                if flags & libc::RENAME_EXCHANGE != 0 {
                    self.inodes.exchange(&from, &to);
                } else {
                    self.inodes.rename(&from, &to);
                }
                reply.ok();
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        trace!(inode = ino, newparent, newname = ?newname, "link");
        let from = try_reply!(reply, self.path_of(ino));
        let to = try_reply!(reply, self.child_of(newparent, newname));
        match self.engine.link(&from, &to) {
            Ok(()) => self.reply_entry(&to, reply),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        trace!(inode = ino, flags, "open");
        let path = try_reply!(reply, self.path_of(ino));
        match self.engine.open(&path, flags) {
            Ok(fh) => reply.opened(fh, self.open_flags()),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        trace!(inode = ino, fh, offset, size, "read");
        let Ok(offset) = u64::try_from(offset) else {
            reply.error(libc::EINVAL);
            return;
        };

        if self.zero_copy {
            match self.engine.read_buf(fh, size as usize, offset) {
                Ok(buf) => {
                    let data = buf.read_to_vec();
                    buf.release();
                    match data {
                        Ok(data) => reply.data(&data),
                        Err(e) => reply.error(e.to_errno()),
                    }
                }
                Err(e) => reply.error(e.to_errno()),
            }
            return;
        }

        let mut buf = vec![0u8; size as usize];
        match self.engine.read(fh, &mut buf, offset) {
            Ok(n) => reply.data(&buf[..n]),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        trace!(inode = ino, fh, offset, len = data.len(), "write");
        let Ok(offset) = u64::try_from(offset) else {
            reply.error(libc::EINVAL);
            return;
        };

        let result = if self.zero_copy {
            self.engine
                .write_buf(fh, &BufVec::from_mem(data.to_vec()), offset)
        } else {
            self.engine.write(fh, data, offset)
        };
        match result {
            Ok(n) => reply.written(u32::try_from(n).unwrap_or(u32::MAX)),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        trace!(inode = ino, fh, "flush");
        match self.engine.flush(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        trace!(inode = ino, fh, "release");
        match self.engine.release(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        trace!(inode = ino, fh, datasync, "fsync");
        match self.engine.fsync(fh, datasync) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        trace!(inode = ino, "opendir");
        let path = try_reply!(reply, self.path_of(ino));
        match self.engine.opendir(&path) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    /// Lists a directory. Entries returned here do not affect lookup
    /// counts and never allocate inodes.
    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        trace!(inode = ino, fh, offset, "readdir");
        let dir = try_reply!(reply, self.path_of(ino));
        let parent_ino = self.parent_ino(&dir);
        let inodes = &self.inodes;

        let result = self.engine.readdir(fh, offset, false, |entry| {
            let entry_ino = listing_ino(inodes, &dir, ino, parent_ino, &entry);
            // add() returns true once the reply buffer is full
            reply.add(
                entry_ino,
                entry.next_offset,
                file_type(entry.attr.mode),
                &entry.name,
            )
        });
        match result {
            Ok(count) => {
                trace!(inode = ino, count, "readdir done");
                reply.ok();
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    /// Lists a directory with attributes. Every accepted entry other than
    /// `.` and `..` counts as a lookup; rejected ones are forgotten again. Entries whose attributes could not
    /// be fetched go out with a zero TTL.
    fn readdirplus(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectoryPlus,
    ) {
        trace!(inode = ino, fh, offset, "readdirplus");
        let dir = try_reply!(reply, self.path_of(ino));
        let parent_ino = self.parent_ino(&dir);
        let attr_ttl = self.attr_ttl();
        let inodes = &self.inodes;

        let result = self.engine.readdir(fh, offset, true, |entry| {
            let dot = entry.is_dot();
            let entry_ino = match entry.name.as_bytes() {
                b"." => ino,
                b".." => parent_ino,
                _ => inodes.lookup(&child(&dir, &entry.name)),
            };
            let ttl = if entry.prefetched {
                attr_ttl
            } else {
                Duration::ZERO
            };
            let full = reply.add(
                entry_ino,
                entry.next_offset,
                &entry.name,
                &ttl,
                &file_attr(entry_ino, &entry.attr),
                0,
            );
            if full && !dot {
                // Rejected entries never reach the kernel, so no forget follows.
                inodes.forget(entry_ino, 1);
            }
            full
        });
        match result {
            Ok(count) => {
                trace!(inode = ino, count, "readdirplus done");
                reply.ok();
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn releasedir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        trace!(fh, "releasedir");
        match self.engine.releasedir(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        trace!(inode = ino, "statfs");
        let path = try_reply!(reply, self.path_of(ino));
        match self.engine.statfs(&path) {
            Ok(st) => reply.statfs(
                st.blocks, st.bfree, st.bavail, st.files, st.ffree, st.bsize, st.namelen,
                st.frsize,
            ),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        trace!(inode = ino, name = ?name, len = value.len(), flags, "setxattr");
        let path = try_reply!(reply, self.path_of(ino));
        match self.engine.setxattr(&path, name, value, flags) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn getxattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        trace!(inode = ino, name = ?name, size, "getxattr");
        let path = try_reply!(reply, self.path_of(ino));
        let mut buf = vec![0u8; size as usize];
        match self.engine.getxattr(&path, name, &mut buf) {
            Ok(n) if size == 0 => reply.size(u32::try_from(n).unwrap_or(u32::MAX)),
            Ok(n) => reply.data(&buf[..n]),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        trace!(inode = ino, size, "listxattr");
        let path = try_reply!(reply, self.path_of(ino));
        let mut buf = vec![0u8; size as usize];
        match self.engine.listxattr(&path, &mut buf) {
            Ok(n) if size == 0 => reply.size(u32::try_from(n).unwrap_or(u32::MAX)),
            Ok(n) => reply.data(&buf[..n]),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        trace!(inode = ino, name = ?name, "removexattr");
        let path = try_reply!(reply, self.path_of(ino));
        match self.engine.removexattr(&path, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        trace!(inode = ino, mask, "access");
        let path = try_reply!(reply, self.path_of(ino));
        match self.engine.access(&path, mask) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        trace!(parent, name = ?name, mode, flags, "create");
        let path = try_reply!(reply, self.child_of(parent, name));
        let fh = match self.engine.create(&path, mode & !umask, flags) {
            Ok(fh) => fh,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        match self.engine.getattr(&path) {
            Ok(attr) => {
                let ino = self.inodes.lookup(&path);
                reply.created(
                    &self.entry_ttl(),
                    &file_attr(ino, &attr),
                    0,
                    fh,
                    self.open_flags(),
                );
            }
            Err(e) => {
                debug!(fh, "create: stat failed, dropping handle");
                // The kernel never sees this handle, so release it here.
                let _ = self.engine.release(fh);
                reply.error(e.to_errno());
            }
        }
    }

    fn setlk(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _lock_owner: u64,
        _start: u64,
        _end: u64,
        typ: i32,
        _pid: u32,
        sleep: bool,
        reply: ReplyEmpty,
    ) {
        trace!(inode = ino, fh, typ, sleep, "setlk");
        let Some(op) = flock_op(typ, sleep) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.engine.flock(fh, op) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn fallocate(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        length: i64,
        mode: i32,
        reply: ReplyEmpty,
    ) {
        trace!(inode = ino, fh, offset, length, mode, "fallocate");
        let (Ok(offset), Ok(length)) = (u64::try_from(offset), u64::try_from(length)) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.engine.fallocate(fh, mode, offset, length) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }
}
