//! FFmpeg FFI helpers: error translation, string conversion, option
//! dictionaries, and conversions into `twincap-core` types.

use std::ffi::CString;
use std::fmt::{Display, Formatter};
use std::ptr;
use std::sync::Once;

use ffmpeg_sys_next::{AVDictionary, AVMediaType, AVRational, av_dict_free, av_dict_set};
use twincap_core::error::{EngineError, Result};
use twincap_core::media::MediaType;
use twincap_core::time_base::{Rational, TimeBase};

/// Structured FFmpeg error details for module-specific wrapping.
#[derive(Debug, Clone)]
pub struct FfmpegErrorDetail {
    /// Name of the FFmpeg call that failed (e.g. `"avformat_open_input"`).
    pub context: String,
    /// Raw FFmpeg error code (negative AVERROR value).
    pub code: i32,
    /// Human-readable error message from `av_strerror`.
    pub message: String,
}

impl Display for FfmpegErrorDetail {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} (code {})", self.context, self.message, self.code)
    }
}

impl std::error::Error for FfmpegErrorDetail {}

/// Translate an FFmpeg return code into a structured error.
///
/// On success (`ret >= 0`) this is a no-op. On failure, `av_strerror` is
/// called to produce a human-readable message.
pub fn check_ffmpeg(ret: i32, context: &str) -> std::result::Result<(), FfmpegErrorDetail> {
    if ret >= 0 {
        return Ok(());
    }

    let mut buf = [0 as std::ffi::c_char; 256];
    // SAFETY: buf is a valid mutable buffer of known length.
    unsafe {
        ffmpeg_sys_next::av_strerror(ret, buf.as_mut_ptr(), buf.len());
    }
    // SAFETY: av_strerror always NUL-terminates within the buffer.
    let msg = unsafe { std::ffi::CStr::from_ptr(buf.as_ptr()) }
        .to_str()
        .unwrap_or("unknown error")
        .to_string();

    Err(FfmpegErrorDetail {
        context: context.to_string(),
        code: ret,
        message: msg,
    })
}

/// Convert a Rust `&str` to a `CString`, mapping NUL bytes to an error.
pub fn to_cstring(s: &str) -> std::result::Result<CString, String> {
    CString::new(s).map_err(|e| format!("Invalid string {s:?}: {e}"))
}

/// Initialise libavformat networking once per process.
pub fn ensure_network_init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        // SAFETY: no preconditions; guarded to run once.
        let ret = unsafe { ffmpeg_sys_next::avformat_network_init() };
        if let Err(err) = check_ffmpeg(ret, "avformat_network_init") {
            tracing::warn!(error = %err, "FFmpeg network init failed");
        }
    });
}

/// Owned `AVDictionary` of demuxer options.
pub struct OptionsDict {
    dict: *mut AVDictionary,
}

impl OptionsDict {
    pub fn new() -> Self {
        Self {
            dict: ptr::null_mut(),
        }
    }

    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let c_key = to_cstring(key).map_err(EngineError::Config)?;
        let c_value = to_cstring(value).map_err(EngineError::Config)?;
        // SAFETY: both strings are valid for the call; av_dict_set copies them.
        let ret = unsafe { av_dict_set(&mut self.dict, c_key.as_ptr(), c_value.as_ptr(), 0) };
        check_ffmpeg(ret, "av_dict_set").map_err(|e| EngineError::Config(e.to_string()))
    }

    /// Pointer handed to FFmpeg calls that consume recognised entries and
    /// leave the unrecognised ones behind.
    pub fn as_mut_ptr(&mut self) -> *mut *mut AVDictionary {
        &mut self.dict
    }

    /// Number of entries FFmpeg did not consume.
    pub fn remaining(&self) -> i32 {
        // SAFETY: a null dictionary has count 0.
        unsafe { ffmpeg_sys_next::av_dict_count(self.dict) }
    }
}

impl Default for OptionsDict {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for OptionsDict {
    fn drop(&mut self) {
        // SAFETY: dict is null or was allocated by av_dict_set.
        unsafe { av_dict_free(&mut self.dict) };
    }
}

pub fn time_base_from_av(tb: AVRational) -> Result<TimeBase> {
    TimeBase::new(tb.num, tb.den)
}

pub fn time_base_to_av(tb: TimeBase) -> AVRational {
    AVRational {
        num: tb.num(),
        den: tb.den(),
    }
}

pub fn rational_from_av(r: AVRational) -> Rational {
    Rational::new(r.num, r.den)
}

pub fn rational_to_av(r: Rational) -> AVRational {
    AVRational { num: r.num, den: r.den }
}

pub fn media_type_from_av(kind: AVMediaType) -> MediaType {
    match kind {
        AVMediaType::AVMEDIA_TYPE_VIDEO => MediaType::Video,
        AVMediaType::AVMEDIA_TYPE_AUDIO => MediaType::Audio,
        AVMediaType::AVMEDIA_TYPE_DATA => MediaType::Data,
        AVMediaType::AVMEDIA_TYPE_SUBTITLE => MediaType::Subtitle,
        _ => MediaType::Unknown,
    }
}

/// Media type and time base of a source track.
///
/// Only video tracks need a usable time base.  Any other track with a
/// degenerate one comes back as [`MediaType::Unknown`] in microseconds so it
/// is dropped like the rest instead of failing the probe.
pub fn stream_timing(kind: AVMediaType, tb: AVRational) -> Result<(MediaType, TimeBase)> {
    let media_type = media_type_from_av(kind);
    match time_base_from_av(tb) {
        Ok(time_base) => Ok((media_type, time_base)),
        Err(err) if media_type == MediaType::Video => Err(err),
        Err(_) => Ok((MediaType::Unknown, TimeBase::MICROSECONDS)),
    }
}
