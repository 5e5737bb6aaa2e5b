//! Shared fixture for engine-level integration tests.
//!
//! Provides `TestFs`, an [`IoFs`] engine over a fresh temporary source
//! directory with its own metrics table, plus helpers to seed the source
//! tree and read counters back.

// Not all tests use all helpers
#![allow(dead_code)]

use iofs_fuse::IoFs;
use iofs_metrics::{Metrics, MetricSnapshot, OpKind};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// An engine mirroring a temporary directory.
pub struct TestFs {
    pub fs: Arc<IoFs>,
    pub metrics: Arc<Metrics>,
    dir: TempDir,
}

impl TestFs {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("failed to create temp dir");
        let root = dir.path().canonicalize().expect("canonicalize temp dir");
        let metrics = Arc::new(Metrics::new());
        let fs = Arc::new(IoFs::new(root, Arc::clone(&metrics)));
        Self { fs, metrics, dir }
    }

    /// Host path of a virtual path.
    pub fn host(&self, virtual_path: &str) -> PathBuf {
        self.dir.path().join(virtual_path.trim_start_matches('/'))
    }

    /// Seeds a file directly in the source tree, bypassing the engine.
    pub fn seed_file(&self, virtual_path: &str, content: &[u8]) {
        let host = self.host(virtual_path);
        if let Some(parent) = host.parent() {
            fs::create_dir_all(parent).expect("seed parent dir");
        }
        fs::write(host, content).expect("seed file");
    }

    pub fn seed_dir(&self, virtual_path: &str) {
        fs::create_dir_all(self.host(virtual_path)).expect("seed dir");
    }

    pub fn snapshot(&self, kind: OpKind) -> MetricSnapshot {
        self.metrics.snapshot(kind)
    }

    pub fn count(&self, kind: OpKind) -> u64 {
        self.metrics.snapshot(kind).count
    }

    pub fn units(&self, kind: OpKind) -> u64 {
        self.metrics.snapshot(kind).units
    }
}

/// Virtual path helper.
pub fn vp(s: &str) -> &Path {
    Path::new(s)
}

/// Runs `op` and asserts it added exactly one invocation of `kind`.
pub fn assert_counted_once<T>(t: &TestFs, kind: OpKind, op: impl FnOnce() -> T) -> T {
    let before = t.count(kind);
    let out = op();
    assert_eq!(
        t.count(kind),
        before + 1,
        "{kind} should be counted exactly once"
    );
    out
}
