//! Synchronized dual-source capture loop.
//!
//! # States
//!
//! ```text
//! Init ──► Running ──► Draining ──► Closed
//!   │                                  ▲
//!   └──────── setup failure ───────────┘
//! ```
//!
//! # Lockstep
//!
//! Each iteration reads exactly one packet from the primary source, then one
//! from the secondary, then routes both.  Reading in fixed order keeps both
//! streams advancing at the same cadence, which is what lets one global
//! offset align them.  The price is head-of-line coupling: a stall on either
//! source stalls both.
//!
//! # Termination
//!
//! - A read that fails or hits end-of-stream ends the run normally.
//! - Either slot reaching the frame limit ends the run normally.
//! - A sink write failure ends the run, is still drained, then surfaced.
//!
//! Every run that gets past setup is drained: both sources are paused
//! (best effort) and the container trailer is written.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tracing::{debug, info, warn};

use twincap_core::clock::{ClockOffsetEstimator, DriftPolicy, SyncOffset};
use twincap_core::config::{DEFAULT_FRAME_LIMIT, SessionConfig};
use twincap_core::error::{EngineError, Result};
use twincap_core::media::{
    OutputSink, Packet, ReadOutcome, SourceHandle, StreamDescriptor, select_video_stream,
};
use twincap_core::time_base::{Rational, TimeBase};

use crate::metrics::CaptureMetrics;

// ─── Configuration ──────────────────────────────────────────────────────────

/// Knobs of the capture loop itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureOptions {
    /// Maximum packets written per output slot.
    pub frame_limit: u64,
    pub drift_policy: DriftPolicy,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            frame_limit: DEFAULT_FRAME_LIMIT,
            drift_policy: DriftPolicy::Frozen,
        }
    }
}

impl From<&SessionConfig> for CaptureOptions {
    fn from(config: &SessionConfig) -> Self {
        Self {
            frame_limit: config.frame_limit,
            drift_policy: config.drift_policy,
        }
    }
}

// ─── State and bookkeeping ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Init,
    Running,
    Draining,
    Closed,
}

impl CaptureState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Closed => "closed",
        }
    }

    fn can_enter(&self, next: CaptureState) -> bool {
        matches!(
            (self, next),
            (Self::Init, Self::Running)
                | (Self::Init, Self::Closed)
                | (Self::Running, Self::Draining)
                | (Self::Draining, Self::Closed)
        )
    }
}

/// Which of the two inputs a packet came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceRole {
    Primary,
    Secondary,
}

impl SourceRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        }
    }
}

/// Why the loop left `Running`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// A source returned end-of-stream (`error: None`) or a read error.
    SourceEnded {
        role: SourceRole,
        error: Option<String>,
    },
    /// A slot reached the frame limit.
    FrameLimit,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SourceEnded { error: None, .. } => "end_of_stream",
            Self::SourceEnded { error: Some(_), .. } => "read_error",
            Self::FrameLimit => "frame_limit",
        }
    }
}

/// Written-packet counters bounded by a shared limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameBudget {
    pub count_primary: u64,
    pub count_secondary: u64,
    pub limit: u64,
}

impl FrameBudget {
    pub fn new(limit: u64) -> Self {
        Self {
            count_primary: 0,
            count_secondary: 0,
            limit,
        }
    }

    /// Either slot has reached the limit.
    pub fn exhausted(&self) -> bool {
        self.count_primary >= self.limit || self.count_secondary >= self.limit
    }

    pub fn record(&mut self, role: SourceRole) {
        match role {
            SourceRole::Primary => self.count_primary += 1,
            SourceRole::Secondary => self.count_secondary += 1,
        }
    }
}

/// An output track, fixed once the header is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputSlot {
    pub index: usize,
    pub time_base: TimeBase,
    pub frame_rate: Rational,
}

/// Where packets from one source go.
#[derive(Debug, Clone, Copy)]
struct Route {
    role: SourceRole,
    source_index: usize,
    source_time_base: TimeBase,
    slot: OutputSlot,
}

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureReport {
    pub stop_reason: StopReason,
    pub budget: FrameBudget,
    pub iterations: u64,
    pub primary_stream: usize,
    pub secondary_stream: usize,
    pub slots: [OutputSlot; 2],
    /// Offset computed before the loop.
    pub initial_offset: SyncOffset,
    /// Offset that was being added to secondary packets when the loop ended.
    pub applied_offset: SyncOffset,
    /// Most recent estimate, whether applied or not.
    pub latest_offset: SyncOffset,
    pub re_estimations: u64,
    pub primary_dropped: u64,
    pub secondary_dropped: u64,
}

// ─── Capture loop ───────────────────────────────────────────────────────────

/// Owns both sources and the sink for the duration of one capture.
pub struct SynchronizedCapture<P, S, O> {
    primary: P,
    secondary: S,
    sink: O,
    options: CaptureOptions,
    state: CaptureState,
    metrics: Arc<CaptureMetrics>,
}

impl<P, S, O> SynchronizedCapture<P, S, O>
where
    P: SourceHandle,
    S: SourceHandle,
    O: OutputSink,
{
    pub fn new(primary: P, secondary: S, sink: O, options: CaptureOptions) -> Self {
        Self {
            primary,
            secondary,
            sink,
            options,
            state: CaptureState::Init,
            metrics: CaptureMetrics::new(),
        }
    }

    /// Shared counters; clone before `run` to observe progress from
    /// another thread.
    pub fn metrics(&self) -> Arc<CaptureMetrics> {
        self.metrics.clone()
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn options(&self) -> CaptureOptions {
        self.options
    }

    pub fn primary(&self) -> &P {
        &self.primary
    }

    pub fn secondary(&self) -> &S {
        &self.secondary
    }

    pub fn sink(&self) -> &O {
        &self.sink
    }

    pub fn into_parts(self) -> (P, S, O) {
        (self.primary, self.secondary, self.sink)
    }

    /// Run the capture to completion.
    ///
    /// Setup failures return before anything is written.  Every other
    /// outcome finalizes the output first.
    #[tracing::instrument(skip_all, name = "capture", fields(frame_limit = self.options.frame_limit))]
    pub fn run(&mut self) -> Result<CaptureReport> {
        if self.state != CaptureState::Init {
            return Err(EngineError::InvalidState {
                from: self.state.as_str(),
                to: CaptureState::Running.as_str(),
            });
        }

        let (primary, secondary, mut estimator) = match self.setup() {
            Ok(routes) => routes,
            Err(err) => {
                self.transition(CaptureState::Closed)?;
                return Err(err);
            }
        };
        let initial_offset = estimator.applied();

        self.transition(CaptureState::Running)?;
        let mut budget = FrameBudget::new(self.options.frame_limit);
        let mut iterations = 0u64;
        let outcome = self.capture(&primary, &secondary, &mut estimator, &mut budget, &mut iterations);

        self.transition(CaptureState::Draining)?;
        let drained = self.drain();
        self.transition(CaptureState::Closed)?;

        let stop_reason = outcome?;
        drained?;

        let metrics = self.metrics.snapshot();
        let report = CaptureReport {
            stop_reason,
            budget,
            iterations,
            primary_stream: primary.source_index,
            secondary_stream: secondary.source_index,
            slots: [primary.slot, secondary.slot],
            initial_offset,
            applied_offset: estimator.applied(),
            latest_offset: estimator.latest(),
            re_estimations: estimator.re_estimations(),
            primary_dropped: metrics.primary_dropped,
            secondary_dropped: metrics.secondary_dropped,
        };
        info!(
            stop = report.stop_reason.as_str(),
            primary_written = budget.count_primary,
            secondary_written = budget.count_secondary,
            iterations,
            re_estimations = report.re_estimations,
            "Capture finished"
        );
        Ok(report)
    }

    fn transition(&mut self, next: CaptureState) -> Result<()> {
        if !self.state.can_enter(next) {
            return Err(EngineError::InvalidState {
                from: self.state.as_str(),
                to: next.as_str(),
            });
        }
        debug!(from = self.state.as_str(), to = next.as_str(), "Capture state");
        self.state = next;
        Ok(())
    }

    /// Probe, pick video tracks, register slots, write the header and
    /// compute the initial offset.
    fn setup(&mut self) -> Result<(Route, Route, ClockOffsetEstimator)> {
        let primary_streams = self.primary.probe()?;
        let secondary_streams = self.secondary.probe()?;
        let primary_video = chosen_video(&primary_streams, self.primary.name())?;
        let secondary_video = chosen_video(&secondary_streams, self.secondary.name())?;

        let primary_slot = self.sink.register_stream(primary_video)?;
        let secondary_slot = self.sink.register_stream(secondary_video)?;
        self.sink.write_header()?;

        let primary = Route {
            role: SourceRole::Primary,
            source_index: primary_video.index,
            source_time_base: primary_video.time_base,
            slot: self.output_slot(primary_slot, primary_video)?,
        };
        let secondary = Route {
            role: SourceRole::Secondary,
            source_index: secondary_video.index,
            source_time_base: secondary_video.time_base,
            slot: self.output_slot(secondary_slot, secondary_video)?,
        };

        info!(
            primary_stream = primary.source_index,
            primary_time_base = %primary.source_time_base,
            primary_slot_time_base = %primary.slot.time_base,
            secondary_stream = secondary.source_index,
            secondary_time_base = %secondary.source_time_base,
            secondary_slot_time_base = %secondary.slot.time_base,
            "Output slots registered"
        );

        let mut estimator =
            ClockOffsetEstimator::new(secondary.slot.time_base, self.options.drift_policy);
        estimator.prime(
            self.primary.anchor_realtime(),
            self.secondary.anchor_realtime(),
        );
        self.metrics
            .latest_delta_pts
            .store(estimator.latest().delta_pts, Ordering::Relaxed);

        Ok((primary, secondary, estimator))
    }

    fn output_slot(&self, slot: usize, template: &StreamDescriptor) -> Result<OutputSlot> {
        let time_base = self.sink.slot_time_base(slot).ok_or_else(|| {
            EngineError::Mux(format!("sink reports no time base for slot {slot}"))
        })?;
        Ok(OutputSlot {
            index: slot,
            time_base,
            frame_rate: template.frame_rate,
        })
    }

    fn capture(
        &mut self,
        primary: &Route,
        secondary: &Route,
        estimator: &mut ClockOffsetEstimator,
        budget: &mut FrameBudget,
        iterations: &mut u64,
    ) -> Result<StopReason> {
        let mut packet_a = Packet::default();
        let mut packet_b = Packet::default();

        loop {
            if budget.exhausted() {
                return Ok(StopReason::FrameLimit);
            }
            if let Some(stop) = read_next(&mut self.primary, &mut packet_a, SourceRole::Primary) {
                return Ok(stop);
            }
            if let Some(stop) =
                read_next(&mut self.secondary, &mut packet_b, SourceRole::Secondary)
            {
                return Ok(stop);
            }
            *iterations += 1;
            self.metrics.iterations.fetch_add(1, Ordering::Relaxed);

            if let Some(offset) = estimator.observe(&mut self.primary, &mut self.secondary) {
                self.metrics.re_estimations.fetch_add(1, Ordering::Relaxed);
                self.metrics
                    .latest_delta_pts
                    .store(offset.delta_pts, Ordering::Relaxed);
            }

            self.route(&mut packet_a, primary, 0, budget)?;
            self.route(&mut packet_b, secondary, estimator.applied().delta_pts, budget)?;

            if (*iterations).is_multiple_of(100) {
                debug!(
                    iterations = *iterations,
                    primary_written = budget.count_primary,
                    secondary_written = budget.count_secondary,
                    "Capture progress"
                );
            }
        }
    }

    /// Forward a packet from its source's video track to its slot; discard
    /// anything else.
    fn route(
        &mut self,
        packet: &mut Packet,
        route: &Route,
        offset: i64,
        budget: &mut FrameBudget,
    ) -> Result<()> {
        if packet.stream_index != route.source_index {
            let dropped = match route.role {
                SourceRole::Primary => &self.metrics.primary_dropped,
                SourceRole::Secondary => &self.metrics.secondary_dropped,
            };
            dropped.fetch_add(1, Ordering::Relaxed);
            packet.recycle();
            return Ok(());
        }

        packet.stream_index = route.slot.index;
        packet.rescale_timestamps(route.source_time_base, route.slot.time_base, offset);
        self.sink.write_interleaved(packet)?;

        budget.record(route.role);
        let written = match route.role {
            SourceRole::Primary => &self.metrics.primary_written,
            SourceRole::Secondary => &self.metrics.secondary_written,
        };
        written.fetch_add(1, Ordering::Relaxed);
        packet.recycle();
        Ok(())
    }

    /// Pause both sources and finalize the container.
    fn drain(&mut self) -> Result<()> {
        for (role, result) in [
            (SourceRole::Primary, self.primary.pause()),
            (SourceRole::Secondary, self.secondary.pause()),
        ] {
            if let Err(err) = result {
                warn!(source = role.as_str(), error = %err, "Pause failed; continuing");
            }
        }

        let trailer = self.sink.write_trailer();
        let closed = self.sink.close();
        trailer.and(closed)
    }
}

fn chosen_video<'a>(streams: &'a [StreamDescriptor], name: &str) -> Result<&'a StreamDescriptor> {
    select_video_stream(streams).ok_or_else(|| EngineError::NoVideoStream(name.to_string()))
}

/// One blocking read.  `Some` means the loop must stop.
fn read_next(
    source: &mut dyn SourceHandle,
    packet: &mut Packet,
    role: SourceRole,
) -> Option<StopReason> {
    match source.read_packet(packet) {
        Ok(ReadOutcome::Ready) => None,
        Ok(ReadOutcome::EndOfStream) => {
            info!(source = role.as_str(), "Source reached end of stream");
            Some(StopReason::SourceEnded { role, error: None })
        }
        Err(err) => {
            if err.ends_stream_gracefully() {
                warn!(source = role.as_str(), error = %err, "Read failed; ending capture");
            } else {
                warn!(
                    source = role.as_str(),
                    error = %err,
                    code = err.error_code(),
                    "Unexpected source error; ending capture"
                );
            }
            Some(StopReason::SourceEnded {
                role,
                error: Some(err.to_string()),
            })
        }
    }
}
