//! Instrumented FUSE passthrough filesystem.
//!
//! This crate mirrors a source directory at a mount point. Every operation
//! is forwarded to the host filesystem unchanged and timed on the way, so
//! the mount behaves exactly like the source tree while
//! [`iofs_metrics::Metrics`] accumulates per-operation counts, durations
//! and bytes.
//!
//! # Layers
//!
//! - [`engine`] - path-based passthrough engine, one method per operation
//! - [`filesystem`] - fuser adapter translating inodes to virtual paths
//! - [`backend`] - composition root: metrics, exporter, engine, session
//!
//! The engine has no FUSE dependency and can be driven directly, which is
//! what the integration tests do.
//!
//! # Usage
//!
//! ```ignore
//! use iofs_fuse::{mount, MountConfig};
//!
//! let handle = mount(source, mountpoint, MountConfig::default())?;
//! // ... the mount is live until the handle is dropped ...
//! handle.unmount();
//! ```

pub mod attr;
#[cfg(target_os = "linux")]
pub mod backend;
pub mod bufvec;
pub mod config;
pub mod dirstream;
pub mod engine;
pub mod error;
#[cfg(target_os = "linux")]
pub mod filesystem;
pub mod handles;
pub mod inode;
pub mod path;
mod sys;

pub use attr::{Attr, StatFs};
#[cfg(target_os = "linux")]
pub use backend::{mount, MountError, MountHandle};
pub use bufvec::{Buf, BufVec};
pub use config::{ConnConfig, MountConfig, SinkConfig};
pub use dirstream::{DirEntry, DirStream};
pub use engine::{IoFs, TimeSpec};
pub use error::{reply_code, FsError, FsResult, ToErrno};
#[cfg(target_os = "linux")]
pub use filesystem::IoFsFuse;
pub use handles::HandleTable;
pub use inode::{InodeEntry, InodeTable, ROOT_INODE};
