//! Mount composition root.
//!
//! [`mount`] wires the pieces together: one [`Metrics`] instance shared by
//! the engine and the exporter, the engine over the canonical source root,
//! the protocol adapter, and the background FUSE session. Dropping the
//! returned [`MountHandle`] unmounts.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use fuser::{BackgroundSession, MountOption};
use iofs_metrics::{spawn_exporter, ExporterHandle, Metrics};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::MountConfig;
use crate::engine::IoFs;
use crate::filesystem::IoFsFuse;

/// Mount type suffix shown as `fuse.iofs` in the mount table.
const SUBTYPE: &str = "iofs";

/// How long the mount syscall may block before giving up.
const MOUNT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for graceful session.join() before forcing unmount.
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors raised while setting up a mount.
#[derive(Debug, Error)]
pub enum MountError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The source directory is missing or unusable.
    #[error("source root {}: {source}", path.display())]
    SourceRoot {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The kernel mount failed.
    #[error("mount failed: {0}")]
    Mount(#[source] io::Error),
}

/// Handle to a mounted iofs filesystem.
///
/// Wraps the fuser `BackgroundSession` and the metrics exporter. Dropping
/// this handle triggers unmount and stops the exporter.
pub struct MountHandle {
    session: Option<BackgroundSession>,
    exporter: Option<ExporterHandle>,
    metrics: Arc<Metrics>,
    mountpoint: PathBuf,
}

impl MountHandle {
    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// Metrics recorded by this mount.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Address the exporter is listening on, if it is running.
    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.exporter.as_ref().map(ExporterHandle::addr)
    }

    /// Unmounts and waits for the session to finish.
    pub fn unmount(mut self) {
        info!(mountpoint = %self.mountpoint.display(), "unmounting");
        if let Some(session) = self.session.take() {
            session.join();
        }
        if let Some(exporter) = self.exporter.take() {
            exporter.shutdown();
        }
        info!(mountpoint = %self.mountpoint.display(), "unmount complete");
    }

    fn force_unmount(&self) {
        let _ = std::process::Command::new("fusermount")
            .args(["-uz"])
            .arg(&self.mountpoint)
            .output();
    }
}

impl Drop for MountHandle {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            debug!(mountpoint = %self.mountpoint.display(), "unmounting on drop");

            let (tx, rx) = mpsc::channel();
            std::thread::spawn(move || {
                session.join();
                let _ = tx.send(());
            });

            if rx.recv_timeout(JOIN_TIMEOUT).is_err() {
                warn!(
                    "session.join() timed out after {:?} for {}, forcing unmount",
                    JOIN_TIMEOUT,
                    self.mountpoint.display()
                );
                self.force_unmount();
            }
        }
        if let Some(exporter) = self.exporter.take() {
            exporter.shutdown();
        }
    }
}

/// Mount options for `config`.
fn mount_options(config: &MountConfig) -> Vec<MountOption> {
    let mut options = vec![
        MountOption::FSName(config.fsname.clone()),
        MountOption::Subtype(SUBTYPE.to_string()),
        MountOption::RW,
    ];
    if config.allow_other {
        options.push(MountOption::AllowOther);
        // Other users go through the kernel's mode-bit checks.
        options.push(MountOption::DefaultPermissions);
        options.push(MountOption::AutoUnmount);
    }
    options
}

/// Canonical form of `source`, which must be an accessible directory.
pub fn source_root(source: &Path) -> Result<PathBuf, MountError> {
    let source_err = |source_err: io::Error| MountError::SourceRoot {
        path: source.to_path_buf(),
        source: source_err,
    };
    let root = source.canonicalize().map_err(source_err)?;
    let md = std::fs::metadata(&root).map_err(source_err)?;
    if !md.is_dir() {
        return Err(source_err(io::Error::from_raw_os_error(libc::ENOTDIR)));
    }
    Ok(root)
}

/// Mounts `source` at `mountpoint`.
///
/// The metrics exporter is started first when configured. If it cannot
/// bind, the error is logged and the mount goes ahead without it.
pub fn mount(
    source: &Path,
    mountpoint: &Path,
    config: MountConfig,
) -> Result<MountHandle, MountError> {
    let root = source_root(source)?;
    if !std::fs::metadata(mountpoint)?.is_dir() {
        return Err(MountError::Mount(io::Error::from_raw_os_error(
            libc::ENOTDIR,
        )));
    }

    info!(
        source = %root.display(),
        mountpoint = %mountpoint.display(),
        zero_copy = config.zero_copy,
        allow_other = config.allow_other,
        "starting iofs mount"
    );

    let metrics = Arc::new(Metrics::new());
    let engine = Arc::new(IoFs::new(root, Arc::clone(&metrics)));
    let fs = IoFsFuse::new(engine, config.conn_config(), config.zero_copy);

    let exporter = config.metrics.clone().and_then(|exporter_config| {
        match spawn_exporter(Arc::clone(&metrics), exporter_config) {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(error = %e, "continuing without metrics endpoint");
                None
            }
        }
    });

    let options = mount_options(&config);
    let session = spawn_mount_with_timeout(fs, mountpoint, options)?;

    info!(mountpoint = %mountpoint.display(), "iofs mounted");
    Ok(MountHandle {
        session: Some(session),
        exporter,
        metrics,
        mountpoint: mountpoint.to_path_buf(),
    })
}

/// Runs `spawn_mount2` on a helper thread so a mount syscall blocked on a
/// stale mountpoint cannot hang the caller.
fn spawn_mount_with_timeout(
    fs: IoFsFuse,
    mountpoint: &Path,
    options: Vec<MountOption>,
) -> Result<BackgroundSession, MountError> {
    let mountpoint = mountpoint.to_path_buf();
    let (tx, rx) = mpsc::channel();

    std::thread::spawn(move || {
        let result = fuser::spawn_mount2(fs, &mountpoint, &options);
        let _ = tx.send(result);
    });

    match rx.recv_timeout(MOUNT_TIMEOUT) {
        Ok(Ok(session)) => Ok(session),
        Ok(Err(e)) => Err(MountError::Mount(e)),
        Err(mpsc::RecvTimeoutError::Timeout) => Err(MountError::Mount(io::Error::new(
            io::ErrorKind::TimedOut,
            "mount timed out; the mountpoint may be a stale FUSE mount",
        ))),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(MountError::Mount(io::Error::other(
            "mount thread terminated unexpectedly",
        ))),
    }
}
