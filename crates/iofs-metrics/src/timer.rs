//! Scoped operation timer.
//!
//! An [`OpTimer`] brackets one dispatched call. It is created before the
//! first fallible step of the call and commits `(kind, elapsed, units)` to
//! the [`Metrics`] table when dropped, so early returns and `?` propagation
//! are measured exactly like the success path.

use std::time::Instant;

use crate::metrics::Metrics;
use crate::op::OpKind;

/// Drop guard that records one invocation into a [`Metrics`] table.
#[must_use = "the measurement is committed when the timer is dropped"]
#[derive(Debug)]
pub struct OpTimer<'a> {
    metrics: &'a Metrics,
    kind: OpKind,
    units: u64,
    start: Instant,
}

impl<'a> OpTimer<'a> {
    /// Start timing `kind` with an initial unit count.
    ///
    /// Byte-oriented calls start at 0 and call [`set_units`](Self::set_units)
    /// once the transferred size is known.
    #[inline]
    pub fn new(metrics: &'a Metrics, kind: OpKind, units: u64) -> Self {
        Self {
            metrics,
            kind,
            units,
            start: Instant::now(),
        }
    }

    /// Overwrite the unit count committed on drop.
    #[inline]
    pub fn set_units(&mut self, units: u64) {
        self.units = units;
    }

    /// Kind being timed.
    pub fn kind(&self) -> OpKind {
        self.kind
    }
}

impl Drop for OpTimer<'_> {
    fn drop(&mut self) {
        self.metrics
            .record(self.kind, self.start.elapsed(), self.units);
    }
}
