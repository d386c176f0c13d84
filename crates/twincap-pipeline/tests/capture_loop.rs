use twincap_core::clock::DriftPolicy;
use twincap_core::error::EngineError;
use twincap_core::media::{OutputSink, Packet};
use twincap_core::replay::{RecordingSink, ReplayPacket, ReplaySource};
use twincap_core::time_base::{Rational, TimeBase};
use twincap_pipeline::{
    CaptureOptions, CaptureState, SourceRole, StopReason, SynchronizedCapture,
};

const FPS: Rational = Rational { num: 25, den: 1 };
const TICKS: i64 = 3_600;
const BASE_US: i64 = 1_700_000_000_000_000;

fn video(name: &str, frames: u64, anchor: Option<i64>) -> ReplaySource {
    ReplaySource::builder(name)
        .video_stream(TimeBase::RTP_VIDEO, FPS)
        .anchor(anchor)
        .frames(0, frames, TICKS)
        .build()
}

fn endless(name: &str, anchor: Option<i64>) -> ReplaySource {
    ReplaySource::builder(name)
        .video_stream(TimeBase::RTP_VIDEO, FPS)
        .anchor(anchor)
        .endless(0, TICKS)
        .build()
}

fn options(frame_limit: u64) -> CaptureOptions {
    CaptureOptions {
        frame_limit,
        drift_policy: DriftPolicy::Frozen,
    }
}

fn slot_pts(sink: &RecordingSink, slot: usize) -> Vec<Option<i64>> {
    sink.slot_packets(slot).map(|p| p.pts).collect()
}

#[test]
fn shorter_source_ends_capture_with_equal_counts() {
    let mut capture = SynchronizedCapture::new(
        video("primary", 3, None),
        video("secondary", 10, None),
        RecordingSink::new(),
        options(5000),
    );
    let report = capture.run().expect("graceful end");

    assert_eq!(report.budget.count_primary, 3);
    assert_eq!(report.budget.count_secondary, 3);
    assert_eq!(
        report.stop_reason,
        StopReason::SourceEnded {
            role: SourceRole::Primary,
            error: None
        }
    );
    // Primary hit EOF on its fourth read, so the secondary was not read again.
    assert_eq!(capture.primary().reads(), 4);
    assert_eq!(capture.secondary().reads(), 3);
    assert!(capture.sink().trailer_written());
    assert!(capture.sink().closed());
    assert_eq!(capture.state(), CaptureState::Closed);
}

#[test]
fn frame_limit_caps_both_slots_exactly() {
    let mut capture = SynchronizedCapture::new(
        endless("primary", None),
        endless("secondary", None),
        RecordingSink::new(),
        options(5),
    );
    let report = capture.run().expect("budget stop");

    assert_eq!(report.stop_reason, StopReason::FrameLimit);
    assert_eq!(report.budget.count_primary, 5);
    assert_eq!(report.budget.count_secondary, 5);
    assert_eq!(capture.sink().slot_packets(0).count(), 5);
    assert_eq!(capture.sink().slot_packets(1).count(), 5);
    // No reads are issued once the budget is spent.
    assert_eq!(capture.primary().reads(), 5);
    assert_eq!(capture.secondary().reads(), 5);
}

#[test]
fn two_second_lag_shifts_secondary_by_180000_ticks() {
    let mut capture = SynchronizedCapture::new(
        video("primary", 2, Some(BASE_US)),
        video("secondary", 2, Some(BASE_US + 2_000_000)),
        RecordingSink::new(),
        options(5000),
    );
    let report = capture.run().expect("run");

    assert_eq!(report.initial_offset.delta_realtime_us, 2_000_000);
    assert_eq!(report.initial_offset.delta_pts, 180_000);
    let sink = capture.sink();
    assert_eq!(slot_pts(sink, 0), vec![Some(0), Some(3_600)]);
    assert_eq!(slot_pts(sink, 1), vec![Some(180_000), Some(183_600)]);
    let dts: Vec<_> = sink.slot_packets(1).map(|p| p.dts).collect();
    assert_eq!(dts, vec![Some(180_000), Some(183_600)]);
}

#[test]
fn non_video_packets_are_dropped_without_counting() {
    let audio = |pts| ReplayPacket {
        stream_index: 1,
        pts: Some(pts),
        dts: Some(pts),
        duration: 1_024,
        is_keyframe: true,
        payload: vec![0; 4],
    };
    let primary = ReplaySource::builder("primary")
        .video_stream(TimeBase::RTP_VIDEO, FPS)
        .audio_stream(TimeBase::new(1, 48_000).expect("tb"))
        .frames(0, 1, TICKS)
        .packet(audio(0))
        .frames(0, 1, TICKS)
        .packet(audio(1_024))
        .frames(0, 1, TICKS)
        .build();
    let mut capture = SynchronizedCapture::new(
        primary,
        video("secondary", 10, None),
        RecordingSink::new(),
        options(5000),
    );
    let report = capture.run().expect("run");

    assert_eq!(report.budget.count_primary, 3);
    assert_eq!(report.budget.count_secondary, 5);
    assert_eq!(report.primary_dropped, 2);
    assert_eq!(report.secondary_dropped, 0);
    assert!(capture.sink().packets().iter().all(|p| p.stream_index <= 1));
    assert_eq!(capture.sink().templates().len(), 2);
}

#[test]
fn secondary_non_video_packets_are_dropped_without_counting() {
    let audio = |pts| ReplayPacket {
        stream_index: 0,
        pts: Some(pts),
        dts: Some(pts),
        duration: 1_024,
        is_keyframe: true,
        payload: vec![0; 4],
    };
    // Audio sits below the video track, so the video is source stream 1.
    let secondary = ReplaySource::builder("secondary")
        .audio_stream(TimeBase::new(1, 48_000).expect("tb"))
        .video_stream(TimeBase::RTP_VIDEO, FPS)
        .packet(audio(0))
        .frames(1, 3, TICKS)
        .packet(audio(1_024))
        .frames(1, 2, TICKS)
        .build();
    let mut capture = SynchronizedCapture::new(
        endless("primary", None),
        secondary,
        RecordingSink::new(),
        options(5000),
    );
    let report = capture.run().expect("run");

    assert_eq!(report.secondary_stream, 1);
    assert_eq!(report.budget.count_secondary, 5);
    assert_eq!(report.budget.count_primary, 7);
    assert_eq!(report.secondary_dropped, 2);
    assert_eq!(report.primary_dropped, 0);
    let sink = capture.sink();
    assert_eq!(sink.slot_packets(1).count(), 5);
    assert_eq!(
        slot_pts(sink, 1),
        vec![Some(0), Some(3_600), Some(7_200), Some(10_800), Some(14_400)]
    );
    assert!(sink.packets().iter().all(|p| p.payload != vec![0; 4]));
}

#[test]
fn last_video_stream_is_selected() {
    let primary = ReplaySource::builder("primary")
        .video_stream(TimeBase::RTP_VIDEO, FPS)
        .audio_stream(TimeBase::new(1, 48_000).expect("tb"))
        .video_stream(TimeBase::RTP_VIDEO, Rational::new(30, 1))
        .frames(0, 2, TICKS)
        .frames(2, 2, 3_000)
        .build();
    let mut capture = SynchronizedCapture::new(
        primary,
        video("secondary", 10, None),
        RecordingSink::new(),
        options(5000),
    );
    let report = capture.run().expect("run");

    assert_eq!(report.primary_stream, 2);
    assert_eq!(report.budget.count_primary, 2);
    assert_eq!(report.primary_dropped, 2);
    assert_eq!(capture.sink().templates()[0].frame_rate, Rational::new(30, 1));
}

#[test]
fn unknown_anchors_leave_offset_at_zero() {
    let mut capture = SynchronizedCapture::new(
        video("primary", 3, Some(BASE_US)),
        video("secondary", 3, None),
        RecordingSink::new(),
        options(5000),
    );
    let report = capture.run().expect("run");

    assert_eq!(report.initial_offset.delta_pts, 0);
    assert_eq!(report.applied_offset.delta_pts, 0);
    assert_eq!(report.re_estimations, 0);
    assert_eq!(slot_pts(capture.sink(), 1), vec![Some(0), Some(3_600), Some(7_200)]);
}

#[test]
fn first_iteration_consumes_connection_anchors() {
    let mut capture = SynchronizedCapture::new(
        video("primary", 3, Some(BASE_US)),
        video("secondary", 3, Some(BASE_US + 1_000_000)),
        RecordingSink::new(),
        options(5000),
    );
    let report = capture.run().expect("run");

    assert_eq!(report.re_estimations, 1);
    assert_eq!(report.latest_offset, report.initial_offset);
    assert_eq!(capture.metrics().snapshot().latest_delta_pts, 90_000);
}

fn drifting(policy: DriftPolicy) -> SynchronizedCapture<ReplaySource, ReplaySource, RecordingSink> {
    let primary = ReplaySource::builder("primary")
        .video_stream(TimeBase::RTP_VIDEO, FPS)
        .anchor(Some(BASE_US))
        .frames(0, 2, TICKS)
        .refresh_anchor(BASE_US)
        .frames(0, 2, TICKS)
        .build();
    let secondary = ReplaySource::builder("secondary")
        .video_stream(TimeBase::RTP_VIDEO, FPS)
        .anchor(Some(BASE_US + 1_000_000))
        .frames(0, 2, TICKS)
        .refresh_anchor(BASE_US + 1_500_000)
        .frames(0, 2, TICKS)
        .build();
    SynchronizedCapture::new(
        primary,
        secondary,
        RecordingSink::new(),
        CaptureOptions {
            frame_limit: 5000,
            drift_policy: policy,
        },
    )
}

#[test]
fn frozen_policy_keeps_initial_offset_after_reestimation() {
    let mut capture = drifting(DriftPolicy::Frozen);
    let report = capture.run().expect("run");

    assert_eq!(report.re_estimations, 2);
    assert_eq!(report.latest_offset.delta_pts, 135_000);
    assert_eq!(report.applied_offset.delta_pts, 90_000);
    assert_eq!(
        slot_pts(capture.sink(), 1),
        vec![Some(90_000), Some(93_600), Some(97_200), Some(100_800)]
    );
}

#[test]
fn apply_policy_uses_reestimated_offset() {
    let mut capture = drifting(DriftPolicy::Apply);
    let report = capture.run().expect("run");

    assert_eq!(report.applied_offset.delta_pts, 135_000);
    assert_eq!(
        slot_pts(capture.sink(), 1),
        vec![Some(90_000), Some(93_600), Some(142_200), Some(145_800)]
    );
}

#[test]
fn missing_video_stream_aborts_before_header() {
    let audio_only = ReplaySource::builder("secondary")
        .audio_stream(TimeBase::new(1, 48_000).expect("tb"))
        .build();
    let mut capture = SynchronizedCapture::new(
        video("primary", 3, None),
        audio_only,
        RecordingSink::new(),
        options(5000),
    );
    let err = capture.run().expect_err("no video");

    assert!(matches!(err, EngineError::NoVideoStream(ref name) if name == "secondary"));
    assert_eq!(err.error_code(), 302);
    assert!(!capture.sink().output_created());
    assert!(!capture.sink().header_written());
    assert!(!capture.sink().trailer_written());
    assert_eq!(capture.primary().reads(), 0);
    assert_eq!(capture.state(), CaptureState::Closed);
}

#[test]
fn probe_failure_is_fatal() {
    let broken = ReplaySource::builder("primary")
        .video_stream(TimeBase::RTP_VIDEO, FPS)
        .probe_error("no stream info")
        .build();
    let mut capture = SynchronizedCapture::new(
        broken,
        video("secondary", 3, None),
        RecordingSink::new(),
        options(5000),
    );
    assert!(matches!(capture.run(), Err(EngineError::Probe(_))));
    assert!(!capture.sink().output_created());
    assert!(!capture.sink().header_written());
    assert!(capture.sink().templates().is_empty());
}

#[test]
fn rejected_codec_fails_before_output_is_created() {
    let mut capture = SynchronizedCapture::new(
        video("primary", 3, None),
        video("secondary", 3, None),
        RecordingSink::new().rejecting_codec("h264"),
        options(5000),
    );
    let err = capture.run().expect_err("codec rejected");

    assert!(matches!(err, EngineError::Mux(ref msg) if msg.contains("h264")));
    assert!(!capture.sink().output_created());
    assert_eq!(capture.primary().reads(), 0);
    assert_eq!(capture.state(), CaptureState::Closed);
}

#[test]
fn read_error_ends_capture_gracefully() {
    let secondary = ReplaySource::builder("secondary")
        .video_stream(TimeBase::RTP_VIDEO, FPS)
        .frames(0, 2, TICKS)
        .fail_read("connection reset")
        .build();
    let mut capture = SynchronizedCapture::new(
        endless("primary", None),
        secondary,
        RecordingSink::new(),
        options(5000),
    );
    let report = capture.run().expect("read errors are not fatal");

    assert_eq!(report.stop_reason.as_str(), "read_error");
    assert!(matches!(
        report.stop_reason,
        StopReason::SourceEnded {
            role: SourceRole::Secondary,
            error: Some(_)
        }
    ));
    // The third primary packet was read but never written.
    assert_eq!(report.budget.count_primary, 2);
    assert_eq!(capture.primary().reads(), 3);
    assert!(capture.sink().trailer_written());
}

#[test]
fn write_failure_still_finalizes_and_surfaces_error() {
    let mut capture = SynchronizedCapture::new(
        endless("primary", None),
        endless("secondary", None),
        RecordingSink::new().fail_writes_after(3),
        options(5000),
    );
    let err = capture.run().expect_err("write failure");

    assert!(matches!(err, EngineError::Mux(_)));
    assert_eq!(capture.sink().packets().len(), 3);
    assert!(capture.sink().trailer_written());
    assert!(capture.sink().closed());
    assert!(capture.primary().paused());
    assert!(capture.secondary().paused());
    assert_eq!(capture.state(), CaptureState::Closed);
}

#[test]
fn pause_failures_do_not_block_finalization() {
    let primary = ReplaySource::builder("primary")
        .video_stream(TimeBase::RTP_VIDEO, FPS)
        .frames(0, 2, TICKS)
        .pause_error("PAUSE not supported")
        .build();
    let mut capture = SynchronizedCapture::new(
        primary,
        video("secondary", 2, None),
        RecordingSink::new(),
        options(5000),
    );
    capture.run().expect("pause errors are ignored");
    assert!(capture.secondary().paused());
    assert!(capture.sink().trailer_written());
}

#[test]
fn container_time_base_override_is_respected() {
    let mut capture = SynchronizedCapture::new(
        video("primary", 2, Some(BASE_US)),
        video("secondary", 2, Some(BASE_US + 2_000_000)),
        RecordingSink::new().with_time_base_override(TimeBase::new(1, 1_000).expect("tb")),
        options(5000),
    );
    let report = capture.run().expect("run");

    assert_eq!(report.slots[1].time_base, TimeBase::new(1, 1_000).expect("tb"));
    assert_eq!(report.initial_offset.delta_pts, 2_000);
    let sink = capture.sink();
    assert_eq!(slot_pts(sink, 0), vec![Some(0), Some(40)]);
    assert_eq!(slot_pts(sink, 1), vec![Some(2_000), Some(2_040)]);
    let durations: Vec<_> = sink.packets().iter().map(|p| p.duration).collect();
    assert_eq!(durations, vec![40, 40, 40, 40]);
}

#[test]
fn missing_timestamps_pass_through_without_offset() {
    let secondary = ReplaySource::builder("secondary")
        .video_stream(TimeBase::RTP_VIDEO, FPS)
        .anchor(Some(BASE_US + 1_000_000))
        .packet(ReplayPacket {
            stream_index: 0,
            pts: None,
            dts: Some(0),
            duration: TICKS,
            is_keyframe: true,
            payload: vec![1],
        })
        .build();
    let mut capture = SynchronizedCapture::new(
        video("primary", 1, Some(BASE_US)),
        secondary,
        RecordingSink::new(),
        options(5000),
    );
    capture.run().expect("run");

    let written: Vec<&Packet> = capture.sink().slot_packets(1).collect();
    assert_eq!(written.len(), 1);
    assert_eq!(written[0].pts, None);
    assert_eq!(written[0].dts, Some(90_000));
}

#[test]
fn second_run_is_rejected() {
    let mut capture = SynchronizedCapture::new(
        video("primary", 1, None),
        video("secondary", 1, None),
        RecordingSink::new(),
        options(5000),
    );
    capture.run().expect("first run");
    let err = capture.run().expect_err("second run");
    assert!(matches!(err, EngineError::InvalidState { from: "closed", .. }));
}

#[test]
fn metrics_match_report() {
    let mut capture = SynchronizedCapture::new(
        video("primary", 4, None),
        video("secondary", 4, None),
        RecordingSink::new(),
        options(3),
    );
    let metrics = capture.metrics();
    let report = capture.run().expect("run");
    let snapshot = metrics.snapshot();

    assert_eq!(snapshot.primary_written, report.budget.count_primary);
    assert_eq!(snapshot.secondary_written, 3);
    assert_eq!(snapshot.iterations, report.iterations);
    assert_eq!(snapshot.iterations, 3);
    let sink = capture.sink();
    assert_eq!(sink.slot_time_base(0), Some(TimeBase::RTP_VIDEO));
}
