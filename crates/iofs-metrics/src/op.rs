//! Operation kinds dispatched by the filesystem engine.
//!
//! Every kind owns one slot in the metric table. The discriminants double as
//! array indices, so the order below is part of the exported format and must
//! never be rearranged; new kinds are appended at the end.

use std::fmt;

/// A dispatchable filesystem operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpKind {
    Getattr = 0,
    Readlink = 1,
    Mkdir = 2,
    Unlink = 3,
    Rmdir = 4,
    Symlink = 5,
    Rename = 6,
    Link = 7,
    Chmod = 8,
    Chown = 9,
    Truncate = 10,
    Open = 11,
    Read = 12,
    Write = 13,
    Statfs = 14,
    Flush = 15,
    Release = 16,
    Fsync = 17,
    Setxattr = 18,
    Getxattr = 19,
    Listxattr = 20,
    Removexattr = 21,
    Opendir = 22,
    Readdir = 23,
    Releasedir = 24,
    Access = 25,
    Create = 26,
    Utimens = 27,
    WriteBuf = 28,
    ReadBuf = 29,
    Flock = 30,
    Fallocate = 31,
}

impl OpKind {
    /// Number of operation kinds.
    pub const COUNT: usize = 32;

    /// All kinds in index order.
    pub const ALL: [OpKind; Self::COUNT] = [
        OpKind::Getattr,
        OpKind::Readlink,
        OpKind::Mkdir,
        OpKind::Unlink,
        OpKind::Rmdir,
        OpKind::Symlink,
        OpKind::Rename,
        OpKind::Link,
        OpKind::Chmod,
        OpKind::Chown,
        OpKind::Truncate,
        OpKind::Open,
        OpKind::Read,
        OpKind::Write,
        OpKind::Statfs,
        OpKind::Flush,
        OpKind::Release,
        OpKind::Fsync,
        OpKind::Setxattr,
        OpKind::Getxattr,
        OpKind::Listxattr,
        OpKind::Removexattr,
        OpKind::Opendir,
        OpKind::Readdir,
        OpKind::Releasedir,
        OpKind::Access,
        OpKind::Create,
        OpKind::Utimens,
        OpKind::WriteBuf,
        OpKind::ReadBuf,
        OpKind::Flock,
        OpKind::Fallocate,
    ];

    /// Index into the metric table.
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Get the kind stored at a table index.
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Label used in the exported `op` dimension.
    pub fn as_str(self) -> &'static str {
        match self {
            OpKind::Getattr => "getattr",
            OpKind::Readlink => "readlink",
            OpKind::Mkdir => "mkdir",
            OpKind::Unlink => "unlink",
            OpKind::Rmdir => "rmdir",
            OpKind::Symlink => "symlink",
            OpKind::Rename => "rename",
            OpKind::Link => "link",
            OpKind::Chmod => "chmod",
            OpKind::Chown => "chown",
            OpKind::Truncate => "truncate",
            OpKind::Open => "open",
            OpKind::Read => "read",
            OpKind::Write => "write",
            OpKind::Statfs => "statfs",
            OpKind::Flush => "flush",
            OpKind::Release => "release",
            OpKind::Fsync => "fsync",
            OpKind::Setxattr => "setxattr",
            OpKind::Getxattr => "getxattr",
            OpKind::Listxattr => "listxattr",
            OpKind::Removexattr => "removexattr",
            OpKind::Opendir => "opendir",
            OpKind::Readdir => "readdir",
            OpKind::Releasedir => "releasedir",
            OpKind::Access => "access",
            OpKind::Create => "create",
            OpKind::Utimens => "utimens",
            OpKind::WriteBuf => "write_buf",
            OpKind::ReadBuf => "read_buf",
            OpKind::Flock => "flock",
            OpKind::Fallocate => "fallocate",
        }
    }

    /// Whether the unit count of this kind is a byte count.
    pub fn counts_bytes(self) -> bool {
        matches!(
            self,
            OpKind::Read | OpKind::Write | OpKind::ReadBuf | OpKind::WriteBuf
        )
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_index_space_is_dense() {
        for (i, kind) in OpKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), i, "{kind} is out of place");
        }
        assert_eq!(OpKind::ALL.len(), OpKind::COUNT);
    }

    #[test]
    fn test_from_index_roundtrip() {
        for kind in OpKind::ALL {
            assert_eq!(OpKind::from_index(kind.index()), Some(kind));
        }
        assert_eq!(OpKind::from_index(OpKind::COUNT), None);
    }

    #[test]
    fn test_labels_are_unique() {
        let labels: HashSet<_> = OpKind::ALL.iter().map(|k| k.as_str()).collect();
        assert_eq!(labels.len(), OpKind::COUNT);
    }

    #[test]
    fn test_stable_positions() {
        // Exported dashboards index on these.
        assert_eq!(OpKind::Getattr.index(), 0);
        assert_eq!(OpKind::Read.index(), 12);
        assert_eq!(OpKind::Write.index(), 13);
        assert_eq!(OpKind::Fallocate.index(), 31);
    }

    #[test]
    fn test_byte_kinds() {
        assert!(OpKind::Read.counts_bytes());
        assert!(OpKind::WriteBuf.counts_bytes());
        assert!(!OpKind::Getattr.counts_bytes());
        assert!(!OpKind::Readdir.counts_bytes());
    }
}
