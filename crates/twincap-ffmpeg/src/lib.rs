#![doc = include_str!("../README.md")]

/// Live input over libavformat (RTSP and friends).
#[cfg(feature = "ffmpeg-runtime")]
pub mod ffmpeg_source;
#[cfg(not(feature = "ffmpeg-runtime"))]
#[path = "ffmpeg_source_stub.rs"]
pub mod ffmpeg_source;
/// libavformat muxer writing both slots into one container.
#[cfg(feature = "ffmpeg-runtime")]
pub mod ffmpeg_muxer;
#[cfg(not(feature = "ffmpeg-runtime"))]
#[path = "ffmpeg_muxer_stub.rs"]
pub mod ffmpeg_muxer;
/// FFI helpers: error translation, option dictionaries, type conversions.
#[cfg(feature = "ffmpeg-runtime")]
pub mod ffmpeg_sys;

pub use ffmpeg_muxer::FfmpegMuxer;
pub use ffmpeg_source::FfmpegSource;

/// Whether this build links FFmpeg.
pub const RUNTIME_AVAILABLE: bool = cfg!(feature = "ffmpeg-runtime");

#[cfg(test)]
mod tests {
    #[test]
    fn capture_path_stays_at_packet_boundary() {
        let source = include_str!("ffmpeg_source.rs");
        let mux = include_str!("ffmpeg_muxer.rs");

        for forbidden in [
            "avcodec_send_packet",
            "avcodec_receive_frame",
            "avcodec_open2",
            "AVFrame",
            "sws_scale",
        ] {
            assert!(
                !source.contains(forbidden),
                "source path should not decode (`{forbidden}`)"
            );
            assert!(
                !mux.contains(forbidden),
                "mux path should not encode (`{forbidden}`)"
            );
        }
    }

    #[cfg(not(feature = "ffmpeg-runtime"))]
    #[test]
    fn stubs_fail_with_typed_errors() {
        use twincap_core::config::SourceOptions;
        use twincap_core::error::EngineError;

        use super::{FfmpegMuxer, FfmpegSource, RUNTIME_AVAILABLE};

        assert!(!RUNTIME_AVAILABLE);
        let err = FfmpegSource::open("primary", "rtsp://camera", &SourceOptions::default())
            .err()
            .expect("stub must refuse to connect");
        assert!(matches!(err, EngineError::Connect { .. }));
        let err = FfmpegMuxer::create(std::path::Path::new("out.mkv"), None)
            .err()
            .expect("stub must refuse to mux");
        assert!(matches!(err, EngineError::Mux(_)));
    }
}
