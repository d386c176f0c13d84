//! Scripted capture sessions over in-memory sources.
//!
//! Drives the real [`SynchronizedCapture`] loop with [`ReplaySource`]s and a
//! [`RecordingSink`], so offset handling and termination can be exercised
//! without cameras.

use twincap_core::error::{EngineError, Result};
use twincap_core::replay::{RecordingSink, ReplayPacket, ReplaySource, ReplaySourceBuilder};
use twincap_core::time_base::{Rational, TimeBase, rescale};

use crate::capture::{CaptureOptions, SynchronizedCapture};

/// Largest finite frame count a plan may script.  Scripted frames are held
/// in memory up front; longer runs use endless sources and a frame limit.
pub const MAX_SCRIPTED_FRAMES: u64 = 1_000_000;

/// Capture over replay sources and a recording sink.
pub type SimulatedCapture = SynchronizedCapture<ReplaySource, ReplaySource, RecordingSink>;

/// Shape of a simulated session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulationPlan {
    /// Video frames on the primary source; `None` never ends.
    pub primary_frames: Option<u64>,
    pub secondary_frames: Option<u64>,
    pub primary_time_base: TimeBase,
    pub secondary_time_base: TimeBase,
    pub frame_rate: Rational,
    /// Wall-clock instant of the primary stream start.
    pub primary_anchor_us: i64,
    /// How far the secondary anchor lags the primary one.
    pub offset_us: i64,
    /// Interleave one audio packet on the primary after every N video
    /// frames.
    pub audio_every: Option<u64>,
    /// Deliver fresh anchors on both sources every N frames.
    pub refresh_every: Option<u64>,
    /// Added to the secondary lag at each anchor refresh.
    pub drift_us_per_refresh: i64,
    /// Output slots report this time base after the header, as Matroska
    /// does with 1/1000.
    pub container_time_base: Option<TimeBase>,
    pub options: CaptureOptions,
}

impl Default for SimulationPlan {
    fn default() -> Self {
        Self {
            primary_frames: Some(250),
            secondary_frames: Some(250),
            primary_time_base: TimeBase::RTP_VIDEO,
            secondary_time_base: TimeBase::RTP_VIDEO,
            frame_rate: Rational::new(25, 1),
            primary_anchor_us: 1_700_000_000_000_000,
            offset_us: 0,
            audio_every: None,
            refresh_every: None,
            drift_us_per_refresh: 0,
            container_time_base: None,
            options: CaptureOptions::default(),
        }
    }
}

impl SimulationPlan {
    /// Build the sources and sink described by this plan.
    pub fn build(&self) -> Result<SimulatedCapture> {
        if !self.frame_rate.is_known() || self.frame_rate.num <= 0 {
            return Err(EngineError::Config(format!(
                "simulation frame rate must be positive, got {}",
                self.frame_rate
            )));
        }
        if self.refresh_every == Some(0) || self.audio_every == Some(0) {
            return Err(EngineError::Config(
                "simulation intervals must be at least 1".into(),
            ));
        }
        for (name, frames) in [
            ("primary", self.primary_frames),
            ("secondary", self.secondary_frames),
        ] {
            if frames.is_some_and(|count| count > MAX_SCRIPTED_FRAMES) {
                return Err(EngineError::Config(format!(
                    "{name} frame count exceeds {MAX_SCRIPTED_FRAMES}; use endless sources with a frame limit instead"
                )));
            }
        }

        let primary = self.source(
            "primary",
            self.primary_time_base,
            self.primary_frames,
            self.primary_anchor_us,
            0,
            self.audio_every,
        )?;
        let secondary = self.source(
            "secondary",
            self.secondary_time_base,
            self.secondary_frames,
            self.primary_anchor_us.saturating_add(self.offset_us),
            self.drift_us_per_refresh,
            None,
        )?;

        let mut sink = RecordingSink::new();
        if let Some(tb) = self.container_time_base {
            sink = sink.with_time_base_override(tb);
        }

        tracing::debug!(
            primary_frames = ?self.primary_frames,
            secondary_frames = ?self.secondary_frames,
            offset_us = self.offset_us,
            refresh_every = ?self.refresh_every,
            "Simulated session built"
        );
        Ok(SynchronizedCapture::new(primary, secondary, sink, self.options))
    }

    fn source(
        &self,
        name: &str,
        time_base: TimeBase,
        frames: Option<u64>,
        anchor_us: i64,
        drift_per_refresh: i64,
        audio_every: Option<u64>,
    ) -> Result<ReplaySource> {
        let frame_duration = TimeBase::new(self.frame_rate.den, self.frame_rate.num)?;
        let ticks = rescale(1, frame_duration, time_base).max(1);

        let mut builder = ReplaySource::builder(name)
            .video_stream(time_base, self.frame_rate)
            .anchor(Some(anchor_us));
        if audio_every.is_some() {
            builder = builder.audio_stream(TimeBase::new(1, 48_000)?);
        }

        let Some(total) = frames else {
            return Ok(builder.endless(0, ticks).build());
        };

        // Split the frames at every refresh and audio point.
        let mut breaks: Vec<u64> = Vec::new();
        for every in [self.refresh_every, audio_every].into_iter().flatten() {
            breaks.extend((1..=total / every).map(|k| k * every));
        }
        breaks.sort_unstable();
        breaks.dedup();

        let mut emitted = 0;
        let mut refreshes = 0i64;
        for point in breaks.into_iter().filter(|&p| p < total) {
            builder = builder.frames(0, point - emitted, ticks);
            emitted = point;
            if audio_every.is_some_and(|every| point.is_multiple_of(every)) {
                builder = audio_packet(builder, point);
            }
            if self.refresh_every.is_some_and(|every| point.is_multiple_of(every)) {
                refreshes += 1;
                builder = builder.refresh_anchor(
                    anchor_us.saturating_add(drift_per_refresh.saturating_mul(refreshes)),
                );
            }
        }
        Ok(builder.frames(0, total - emitted, ticks).build())
    }
}

fn audio_packet(builder: ReplaySourceBuilder, sequence: u64) -> ReplaySourceBuilder {
    let pts = sequence as i64 * 1_920;
    builder.packet(ReplayPacket {
        stream_index: 1,
        pts: Some(pts),
        dts: Some(pts),
        duration: 1_920,
        is_keyframe: true,
        payload: vec![0xA5; 8],
    })
}
