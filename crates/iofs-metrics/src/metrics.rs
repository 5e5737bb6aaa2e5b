//! Lock-free per-operation counter table.
//!
//! One [`MetricEntry`] per [`OpKind`], each holding three independent
//! monotonic counters. Recording is three relaxed `fetch_add`s; readers may
//! observe the fields of one entry at slightly different points in time,
//! which is fine for counters that only ever grow.
//!
//! # Usage
//!
//! ```
//! use iofs_metrics::{Metrics, OpKind};
//! use std::time::Duration;
//!
//! let metrics = Metrics::new();
//! metrics.record(OpKind::Read, Duration::from_micros(40), 4096);
//!
//! let snap = metrics.snapshot(OpKind::Read);
//! assert_eq!(snap.count, 1);
//! assert_eq!(snap.units, 4096);
//! assert!(metrics.render().contains("iofs_ops_total{op=\"read\"} 1"));
//! ```

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::op::OpKind;
use crate::timer::OpTimer;

/// Nanoseconds per second, for render-time conversion.
const NANOS_PER_SEC: f64 = 1.0e9;

/// Counters for a single operation kind.
#[derive(Debug, Default)]
pub struct MetricEntry {
    /// Number of invocations.
    count: AtomicU64,
    /// Cumulative units (bytes for I/O calls, 1 per call otherwise).
    total_units: AtomicU64,
    /// Cumulative wall time in nanoseconds.
    total_duration_ns: AtomicU64,
}

impl MetricEntry {
    #[inline]
    fn record(&self, duration_ns: u64, units: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_units.fetch_add(units, Ordering::Relaxed);
        self.total_duration_ns.fetch_add(duration_ns, Ordering::Relaxed);
    }

    fn snapshot(&self) -> MetricSnapshot {
        MetricSnapshot {
            count: self.count.load(Ordering::Relaxed),
            units: self.total_units.load(Ordering::Relaxed),
            duration_ns: self.total_duration_ns.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of one [`MetricEntry`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricSnapshot {
    /// Number of invocations.
    pub count: u64,
    /// Cumulative units.
    pub units: u64,
    /// Cumulative duration in nanoseconds.
    pub duration_ns: u64,
}

impl MetricSnapshot {
    /// Cumulative duration in fractional seconds.
    pub fn duration_secs(&self) -> f64 {
        self.duration_ns as f64 / NANOS_PER_SEC
    }
}

/// Process-wide table of operation metrics.
///
/// Constructed once by the composition root and shared through an `Arc`
/// with the filesystem engine and the exporter. Counters are never reset.
#[derive(Debug)]
pub struct Metrics {
    entries: [MetricEntry; OpKind::COUNT],
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Create a table with every counter at zero.
    pub fn new() -> Self {
        Self {
            entries: std::array::from_fn(|_| MetricEntry::default()),
        }
    }

    /// Record one invocation of `kind`.
    ///
    /// Safe to call from any number of threads at once.
    #[inline]
    pub fn record(&self, kind: OpKind, duration: Duration, units: u64) {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.entries[kind.index()].record(nanos, units);
    }

    /// Start a scoped timer for `kind` counting one unit.
    #[inline]
    pub fn timer(&self, kind: OpKind) -> OpTimer<'_> {
        OpTimer::new(self, kind, 1)
    }

    /// Start a scoped timer for `kind` with an explicit initial unit count.
    #[inline]
    pub fn timer_with_units(&self, kind: OpKind, units: u64) -> OpTimer<'_> {
        OpTimer::new(self, kind, units)
    }

    /// Snapshot the counters of one kind.
    pub fn snapshot(&self, kind: OpKind) -> MetricSnapshot {
        self.entries[kind.index()].snapshot()
    }

    /// Snapshot every kind, in index order.
    pub fn snapshot_all(&self) -> Vec<(OpKind, MetricSnapshot)> {
        OpKind::ALL
            .iter()
            .map(|&kind| (kind, self.snapshot(kind)))
            .collect()
    }

    /// Total invocations across all kinds.
    pub fn total_ops(&self) -> u64 {
        self.entries
            .iter()
            .map(|e| e.count.load(Ordering::Relaxed))
            .sum()
    }

    /// Render the table in the Prometheus text exposition format.
    ///
    /// Three counter families are emitted; within each, kinds whose value
    /// for that family is zero are left out.
    pub fn render(&self) -> String {
        let snapshots = self.snapshot_all();
        let mut out = String::with_capacity(4096);

        write_family(
            &mut out,
            "iofs_ops_total",
            "Total number of IO operations",
            snapshots.iter().filter(|(_, s)| s.count > 0),
            |s| s.count.to_string(),
        );
        out.push('\n');
        write_family(
            &mut out,
            "iofs_duration_seconds_total",
            "Total time spent in operations",
            snapshots.iter().filter(|(_, s)| s.duration_ns > 0),
            |s| s.duration_secs().to_string(),
        );
        out.push('\n');
        write_family(
            &mut out,
            "iofs_units_total",
            "Total units (bytes/entries) processed",
            snapshots.iter().filter(|(_, s)| s.units > 0),
            |s| s.units.to_string(),
        );

        out
    }
}

fn write_family<'a>(
    out: &mut String,
    name: &str,
    help: &str,
    series: impl Iterator<Item = &'a (OpKind, MetricSnapshot)>,
    value: impl Fn(&MetricSnapshot) -> String,
) {
    // Writing into a String cannot fail.
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} counter");
    for (kind, snap) in series {
        let _ = writeln!(out, "{name}{{op=\"{kind}\"}} {}", value(snap));
    }
}
