//! Cross-source clock offset estimation.
//!
//! Each source reports an absolute-time anchor: the wall-clock instant of
//! its stream start, derived from the transport's real-time reference.  The
//! gap between the two anchors is how far the secondary stream's timeline
//! lags the primary's; expressed in secondary ticks it is the amount added
//! to every secondary timestamp.
//!
//! Anchors are cleared after each successful dual read.  The transport
//! refills them when a fresh reference arrives, which is what re-arms
//! estimation for drift tracking.

use serde::Deserialize;

use crate::media::SourceHandle;
use crate::time_base::{TimeBase, rescale};

/// Offset between the two sources' timelines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOffset {
    /// `secondary.anchor - primary.anchor`; positive when the secondary lags.
    pub delta_realtime_us: i64,
    /// `delta_realtime_us` in secondary output-slot ticks.
    pub delta_pts: i64,
}

/// Whether re-estimated offsets replace the one applied to packets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftPolicy {
    /// Re-estimate and report, but keep applying the initial offset.
    #[default]
    Frozen,
    /// Apply every re-estimated offset to subsequent packets.
    Apply,
}

/// Compute the offset from a pair of anchors, if both are known.
pub fn estimate(
    primary_anchor_us: Option<i64>,
    secondary_anchor_us: Option<i64>,
    secondary_time_base: TimeBase,
) -> Option<SyncOffset> {
    let (primary, secondary) = (primary_anchor_us?, secondary_anchor_us?);
    let delta_realtime_us = secondary.saturating_sub(primary);
    Some(SyncOffset {
        delta_realtime_us,
        delta_pts: rescale(delta_realtime_us, TimeBase::MICROSECONDS, secondary_time_base),
    })
}

/// Owned offset state threaded through the capture loop.
#[derive(Debug, Clone)]
pub struct ClockOffsetEstimator {
    secondary_time_base: TimeBase,
    policy: DriftPolicy,
    applied: SyncOffset,
    latest: SyncOffset,
    re_estimations: u64,
}

impl ClockOffsetEstimator {
    pub fn new(secondary_time_base: TimeBase, policy: DriftPolicy) -> Self {
        Self {
            secondary_time_base,
            policy,
            applied: SyncOffset::default(),
            latest: SyncOffset::default(),
            re_estimations: 0,
        }
    }

    /// Initial estimate from the anchors captured at connection time.
    ///
    /// Anchors are left in place: the first loop iteration reads them again
    /// and clears them.  With either anchor missing the offset stays zero.
    pub fn prime(&mut self, primary_anchor_us: Option<i64>, secondary_anchor_us: Option<i64>) {
        let offset = estimate(primary_anchor_us, secondary_anchor_us, self.secondary_time_base)
            .unwrap_or_default();
        tracing::info!(
            delta_realtime_us = offset.delta_realtime_us,
            delta_pts = offset.delta_pts,
            secondary_time_base = %self.secondary_time_base,
            anchors_known = primary_anchor_us.is_some() && secondary_anchor_us.is_some(),
            "Initial clock offset"
        );
        self.applied = offset;
        self.latest = offset;
    }

    /// Re-estimate if both sources currently report an anchor.
    ///
    /// On success both anchors are cleared and the new estimate is returned;
    /// otherwise nothing changes.
    pub fn observe(
        &mut self,
        primary: &mut dyn SourceHandle,
        secondary: &mut dyn SourceHandle,
    ) -> Option<SyncOffset> {
        let offset = estimate(
            primary.anchor_realtime(),
            secondary.anchor_realtime(),
            self.secondary_time_base,
        )?;
        primary.clear_anchor();
        secondary.clear_anchor();

        self.latest = offset;
        self.re_estimations += 1;
        if self.policy == DriftPolicy::Apply {
            self.applied = offset;
        }
        tracing::debug!(
            delta_realtime_us = offset.delta_realtime_us,
            delta_pts = offset.delta_pts,
            applied_delta_pts = self.applied.delta_pts,
            re_estimations = self.re_estimations,
            "Clock offset re-estimated"
        );
        Some(offset)
    }

    /// Offset added to secondary packets.
    pub fn applied(&self) -> SyncOffset {
        self.applied
    }

    /// Most recent estimate, applied or not.
    pub fn latest(&self) -> SyncOffset {
        self.latest
    }

    pub fn re_estimations(&self) -> u64 {
        self.re_estimations
    }

    pub fn policy(&self) -> DriftPolicy {
        self.policy
    }
}
