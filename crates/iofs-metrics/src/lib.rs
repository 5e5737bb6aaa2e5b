//! I/O telemetry for the iofs passthrough filesystem.
//!
//! This crate holds everything the filesystem engine needs to report its
//! work and everything an operator needs to read it back:
//!
//! - [`OpKind`] - the closed set of dispatchable operations
//! - [`Metrics`] - lock-free counter table, one entry per kind
//! - [`OpTimer`] - scoped timer committing into the table on drop
//! - [`exporter`] - HTTP endpoint serving the table in Prometheus text format
//!
//! # Example
//!
//! ```
//! use iofs_metrics::{Metrics, OpKind};
//!
//! let metrics = Metrics::new();
//! {
//!     let mut timer = metrics.timer_with_units(OpKind::Write, 0);
//!     // ... perform the write ...
//!     timer.set_units(128);
//! }
//! assert_eq!(metrics.snapshot(OpKind::Write).units, 128);
//! ```

pub mod exporter;
pub mod metrics;
mod op;
mod timer;

pub use exporter::{
    spawn_exporter, ExporterConfig, ExporterError, ExporterHandle, MetricsServer,
};
pub use metrics::{MetricEntry, MetricSnapshot, Metrics};
pub use op::OpKind;
pub use timer::OpTimer;
