//! Atomic capture counters, shared with progress reporters.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Per-slot and per-source counters updated by the capture loop.
#[derive(Debug, Default)]
pub struct CaptureMetrics {
    /// Packets written to slot 0.
    pub primary_written: AtomicU64,
    /// Packets written to slot 1.
    pub secondary_written: AtomicU64,
    /// Non-video packets discarded from the primary source.
    pub primary_dropped: AtomicU64,
    /// Non-video packets discarded from the secondary source.
    pub secondary_dropped: AtomicU64,
    /// Completed lockstep iterations (both reads succeeded).
    pub iterations: AtomicU64,
    /// Successful offset re-estimations inside the loop.
    pub re_estimations: AtomicU64,
    /// Most recent estimated offset, in secondary slot ticks.
    pub latest_delta_pts: AtomicI64,
}

impl CaptureMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            primary_written: self.primary_written.load(Ordering::Relaxed),
            secondary_written: self.secondary_written.load(Ordering::Relaxed),
            primary_dropped: self.primary_dropped.load(Ordering::Relaxed),
            secondary_dropped: self.secondary_dropped.load(Ordering::Relaxed),
            iterations: self.iterations.load(Ordering::Relaxed),
            re_estimations: self.re_estimations.load(Ordering::Relaxed),
            latest_delta_pts: self.latest_delta_pts.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`CaptureMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub primary_written: u64,
    pub secondary_written: u64,
    pub primary_dropped: u64,
    pub secondary_dropped: u64,
    pub iterations: u64,
    pub re_estimations: u64,
    pub latest_delta_pts: i64,
}
