//! End-to-end tests through a real kernel mount.
//!
//! Requires /dev/fuse and fusermount; tests skip themselves when mounting
//! is not possible.
//!
//! Run: `cargo nextest run -p iofs-fuse --features fuse-tests mount_tests`

#![cfg(all(target_os = "linux", feature = "fuse-tests"))]

use iofs_fuse::{mount, MountConfig, MountHandle};
use iofs_metrics::{ExporterConfig, OpKind};
use std::fs;
use std::io::{Read, Write};
use std::net::{Ipv4Addr, TcpStream};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// How long to wait for mount to become ready.
const MOUNT_READY_TIMEOUT: Duration = Duration::from_secs(5);

macro_rules! skip_if_no_fuse {
    () => {
        if !Path::new("/dev/fuse").exists() {
            eprintln!("Skipping test: FUSE not available on this system");
            return;
        }
    };
}

macro_rules! require_mount {
    ($mount_result:expr) => {
        match $mount_result {
            Ok(m) => m,
            Err(e) => {
                eprintln!("Skipping test: {}", e);
                return;
            }
        }
    };
}

/// A source tree mounted through iofs.
struct TestMount {
    handle: Option<MountHandle>,
    source: TempDir,
    mount_path: PathBuf,
    _temp_mount: TempDir,
}

impl TestMount {
    fn new(config: MountConfig) -> Result<Self, String> {
        let source = TempDir::new().map_err(|e| format!("Failed to create source dir: {e}"))?;
        let temp_mount = TempDir::new().map_err(|e| format!("Failed to create temp dir: {e}"))?;
        let mount_path = temp_mount.path().join("mnt");
        fs::create_dir(&mount_path).map_err(|e| format!("Failed to create mount point: {e}"))?;

        let handle = mount(source.path(), &mount_path, config.fsname("iofs-test"))
            .map_err(|e| format!("Failed to mount: {e}"))?;
        wait_for_mount(&mount_path)?;

        Ok(Self {
            handle: Some(handle),
            source,
            mount_path,
            _temp_mount: temp_mount,
        })
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.mount_path.join(rel)
    }

    fn source(&self, rel: &str) -> PathBuf {
        self.source.path().join(rel)
    }

    fn handle(&self) -> &MountHandle {
        self.handle.as_ref().expect("mounted")
    }

    fn count(&self, kind: OpKind) -> u64 {
        self.handle().metrics().snapshot(kind).count
    }
}

impl Drop for TestMount {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.unmount();
        }
    }
}

/// A mount is live once the mount point's device differs from its parent.
fn wait_for_mount(mount_path: &Path) -> Result<(), String> {
    let parent = mount_path.parent().ok_or("mount_path has no parent")?;
    let parent_dev = fs::metadata(parent)
        .map_err(|e| format!("Failed to stat parent: {e}"))?
        .dev();

    let deadline = Instant::now() + MOUNT_READY_TIMEOUT;
    while Instant::now() < deadline {
        if let Ok(md) = fs::metadata(mount_path)
            && md.dev() != parent_dev
        {
            return Ok(());
        }
        thread::sleep(Duration::from_millis(50));
    }
    Err(format!("Mount not ready after {MOUNT_READY_TIMEOUT:?}"))
}

fn no_metrics() -> MountConfig {
    MountConfig::default().metrics(None)
}

#[test]
fn test_write_through_mount_lands_in_source() {
    skip_if_no_fuse!();
    let m = require_mount!(TestMount::new(no_metrics()));

    fs::write(m.path("hello.txt"), b"through the mount").unwrap();
    assert_eq!(fs::read(m.source("hello.txt")).unwrap(), b"through the mount");
    assert_eq!(fs::read(m.path("hello.txt")).unwrap(), b"through the mount");

    assert!(m.count(OpKind::Create) >= 1);
    assert!(m.count(OpKind::Write) >= 1);
    assert!(m.count(OpKind::Read) >= 1);
}

#[test]
fn test_source_changes_visible() {
    skip_if_no_fuse!();
    let m = require_mount!(TestMount::new(no_metrics()));

    fs::create_dir(m.source("dir")).unwrap();
    fs::write(m.source("dir/inner"), b"x").unwrap();

    let mut listed: Vec<String> = fs::read_dir(m.path("dir"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    listed.sort();
    assert_eq!(listed, ["inner"]);
    assert!(m.count(OpKind::Readdir) >= 1);
}

#[test]
fn test_repeated_stat_reaches_engine() {
    skip_if_no_fuse!();
    let m = require_mount!(TestMount::new(no_metrics()));
    fs::write(m.source("f"), b"").unwrap();

    fs::metadata(m.path("f")).unwrap();
    let before = m.count(OpKind::Getattr);
    for _ in 0..5 {
        fs::metadata(m.path("f")).unwrap();
    }
    // Attribute caching is off, so every stat is seen.
    assert!(m.count(OpKind::Getattr) >= before + 5);
}

#[test]
fn test_rename_and_unlink() {
    skip_if_no_fuse!();
    let m = require_mount!(TestMount::new(no_metrics()));

    fs::write(m.path("a"), b"A").unwrap();
    fs::rename(m.path("a"), m.path("b")).unwrap();
    assert!(!m.source("a").exists());
    assert_eq!(fs::read(m.path("b")).unwrap(), b"A");

    fs::remove_file(m.path("b")).unwrap();
    assert!(!m.source("b").exists());
    assert_eq!(m.count(OpKind::Rename), 1);
    assert_eq!(m.count(OpKind::Unlink), 1);
}

#[test]
fn test_metrics_endpoint_serves_counters() {
    skip_if_no_fuse!();
    let config = MountConfig::default()
        .metrics(Some(ExporterConfig::with_port(0).bind_address(Ipv4Addr::LOCALHOST.into())));
    let m = require_mount!(TestMount::new(config));
    let Some(addr) = m.handle().metrics_addr() else {
        eprintln!("Skipping test: exporter did not start");
        return;
    };

    fs::write(m.path("f"), b"data").unwrap();

    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();

    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("iofs_ops_total{op=\"create\"}"));
    assert!(response.contains("iofs_units_total{op=\"write\"} 4"));
}
