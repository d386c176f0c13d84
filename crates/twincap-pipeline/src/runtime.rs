//! CLI/runtime bridge helpers.
//!
//! Keeps FFmpeg composition inside `twincap-pipeline` so callers only deal
//! with configuration and the capture loop.

use twincap_core::config::SessionConfig;
use twincap_core::error::Result;
use twincap_ffmpeg::{FfmpegMuxer, FfmpegSource};

use crate::capture::{CaptureOptions, SynchronizedCapture};

/// Capture over two live FFmpeg inputs into one container.
pub type LiveCapture = SynchronizedCapture<FfmpegSource, FfmpegSource, FfmpegMuxer>;

/// Whether live sessions can be opened in this build.
pub fn runtime_available() -> bool {
    twincap_ffmpeg::RUNTIME_AVAILABLE
}

/// Open the primary source, then the secondary, then prepare the output
/// container.
///
/// The output file is not created until the capture writes its header, so a
/// session that fails setup leaves nothing on disk.  Both inputs get the same
/// transport options.  The container format is the
/// configured one or, failing that, the one implied by the output extension.
pub fn open_session(config: &SessionConfig) -> Result<LiveCapture> {
    config.validate()?;
    let source_options = config.source_options();

    let primary = FfmpegSource::open("primary", &config.primary, &source_options)?;
    let secondary = FfmpegSource::open("secondary", &config.secondary, &source_options)?;

    let format = config.resolved_container_format();
    let sink = FfmpegMuxer::create(&config.output, format.as_deref())?;

    tracing::info!(
        primary = %config.primary,
        secondary = %config.secondary,
        output = %config.output.display(),
        format = format.as_deref().unwrap_or("guessed"),
        frame_limit = config.frame_limit,
        drift_policy = ?config.drift_policy,
        "Capture session opened"
    );
    Ok(SynchronizedCapture::new(
        primary,
        secondary,
        sink,
        CaptureOptions::from(config),
    ))
}
