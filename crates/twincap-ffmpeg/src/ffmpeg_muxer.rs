//! FFmpeg-based container muxer, the [`OutputSink`] impl for MKV/MP4/MOV/TS.
//!
//! Each registered slot is a stream-copy video track whose codec parameters
//! come from the source's [`StreamDescriptor`].  The container format is
//! taken from the caller or guessed by libavformat from the file extension.

use std::ffi::CString;
use std::path::{Path, PathBuf};
use std::ptr;

use ffmpeg_sys_next::*;

use crate::ffmpeg_sys::{
    check_ffmpeg, rational_to_av, time_base_from_av, time_base_to_av, to_cstring,
};
use twincap_core::error::{EngineError, Result};
use twincap_core::media::{OutputSink, Packet, StreamDescriptor};
use twincap_core::time_base::TimeBase;

/// Muxes packets from both slots into one container file.
pub struct FfmpegMuxer {
    fmt_ctx: *mut AVFormatContext,
    streams: Vec<*mut AVStream>,
    pkt: *mut AVPacket,
    path: PathBuf,
    c_path: CString,
    /// Set once `avio_open` has created the output file.
    file_opened: bool,
    packet_counter: u64,
    header_written: bool,
    trailer_written: bool,
}

// SAFETY: All FFmpeg operations happen on the capture thread.
unsafe impl Send for FfmpegMuxer {}

impl FfmpegMuxer {
    /// Create the output context for `path`.
    ///
    /// `format` is a libavformat muxer short name (`"matroska"`, `"mp4"`);
    /// `None` lets FFmpeg guess from the extension.  The file itself is not
    /// created until [`OutputSink::write_header`].
    pub fn create(path: &Path, format: Option<&str>) -> Result<Self> {
        let path_str = path
            .to_str()
            .ok_or_else(|| EngineError::Mux("Non-UTF8 path".into()))?;
        let c_path = to_cstring(path_str).map_err(EngineError::Mux)?;
        let c_format = format
            .map(|f| to_cstring(f).map_err(EngineError::Mux))
            .transpose()?;

        // ── Create output format context ──
        let mut fmt_ctx: *mut AVFormatContext = ptr::null_mut();
        // SAFETY: all strings are NUL-terminated or null.
        let ret = unsafe {
            avformat_alloc_output_context2(
                &mut fmt_ctx,
                ptr::null(),
                c_format.as_ref().map_or(ptr::null(), |f| f.as_ptr()),
                c_path.as_ptr(),
            )
        };
        if ret < 0 || fmt_ctx.is_null() {
            return Err(EngineError::Mux(format!(
                "Failed to create output context for {} (format {})",
                path.display(),
                format.unwrap_or("guessed")
            )));
        }

        // ── Allocate packet ──
        // SAFETY: plain allocation.
        let pkt = unsafe { av_packet_alloc() };
        if pkt.is_null() {
            // SAFETY: fmt_ctx was allocated above and is not yet shared.
            unsafe { avformat_free_context(fmt_ctx) };
            return Err(EngineError::Mux("Failed to allocate AVPacket".into()));
        }

        tracing::info!(
            path = %path.display(),
            format = format.unwrap_or("guessed"),
            "FFmpeg muxer prepared"
        );

        Ok(Self {
            fmt_ctx,
            streams: Vec::with_capacity(2),
            pkt,
            path: path.to_path_buf(),
            c_path,
            file_opened: false,
            packet_counter: 0,
            header_written: false,
            trailer_written: false,
        })
    }

    /// Copy the template's codec description into a fresh output stream.
    fn configure_stream(stream: *mut AVStream, template: &StreamDescriptor) -> Result<()> {
        let c_codec = to_cstring(&template.codec.codec_name).map_err(EngineError::Mux)?;
        // SAFETY: c_codec is NUL-terminated; descriptors are static.
        let descriptor = unsafe { avcodec_descriptor_get_by_name(c_codec.as_ptr()) };
        if descriptor.is_null() {
            return Err(EngineError::Mux(format!(
                "Unknown codec '{}' on source stream {}",
                template.codec.codec_name, template.index
            )));
        }

        // SAFETY: stream and its codecpar were just created by
        // avformat_new_stream; descriptor is non-null.
        unsafe {
            let par = (*stream).codecpar;
            (*par).codec_type = AVMediaType::AVMEDIA_TYPE_VIDEO;
            (*par).codec_id = (*descriptor).id;
            (*par).codec_tag = 0;
            (*par).width = template.codec.width as i32;
            (*par).height = template.codec.height as i32;

            let extradata = &template.codec.extradata;
            if !extradata.is_empty() {
                let buf = av_mallocz(extradata.len() + AV_INPUT_BUFFER_PADDING_SIZE as usize)
                    as *mut u8;
                if buf.is_null() {
                    return Err(EngineError::Mux("Failed to allocate extradata".into()));
                }
                ptr::copy_nonoverlapping(extradata.as_ptr(), buf, extradata.len());
                (*par).extradata = buf;
                (*par).extradata_size = extradata.len() as i32;
            }

            (*stream).time_base = time_base_to_av(template.time_base);
            (*stream).r_frame_rate = rational_to_av(template.frame_rate);
            (*stream).avg_frame_rate = rational_to_av(template.frame_rate);
        }
        Ok(())
    }

    fn needs_file(&self) -> bool {
        // SAFETY: fmt_ctx and its oformat are valid until drop.
        unsafe { (*(*self.fmt_ctx).oformat).flags & AVFMT_NOFILE == 0 }
    }

    fn open_file(&mut self) -> Result<()> {
        if !self.needs_file() || self.file_opened {
            return Ok(());
        }
        // SAFETY: pb is an out-parameter on a valid context; c_path is
        // NUL-terminated.
        let ret =
            unsafe { avio_open(&mut (*self.fmt_ctx).pb, self.c_path.as_ptr(), AVIO_FLAG_WRITE) };
        check_ffmpeg(ret, "avio_open").map_err(|e| EngineError::Mux(format!("{e}")))?;
        self.file_opened = true;
        Ok(())
    }

    /// Close and delete a file whose header never made it out.
    fn discard_file(&mut self) {
        if !self.file_opened {
            return;
        }
        // SAFETY: pb was opened by open_file; avio_closep nulls it.
        unsafe { avio_closep(&mut (*self.fmt_ctx).pb) };
        self.file_opened = false;
        if let Err(err) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %err, "Failed to remove partial output");
        }
    }
}

impl OutputSink for FfmpegMuxer {
    fn register_stream(&mut self, template: &StreamDescriptor) -> Result<usize> {
        if self.header_written {
            return Err(EngineError::Mux("stream registered after header".into()));
        }
        // SAFETY: fmt_ctx is valid until drop.
        let stream = unsafe { avformat_new_stream(self.fmt_ctx, ptr::null()) };
        if stream.is_null() {
            return Err(EngineError::Mux("Failed to create output stream".into()));
        }
        Self::configure_stream(stream, template)?;
        self.streams.push(stream);
        let slot = self.streams.len() - 1;

        tracing::debug!(
            slot,
            codec = %template.codec.codec_name,
            width = template.codec.width,
            height = template.codec.height,
            time_base = %template.time_base,
            frame_rate = %template.frame_rate,
            "Output stream registered"
        );
        Ok(slot)
    }

    fn write_header(&mut self) -> Result<()> {
        if self.header_written {
            return Ok(());
        }
        if self.streams.is_empty() {
            return Err(EngineError::Mux("header written with no streams".into()));
        }
        self.open_file()?;
        // SAFETY: fmt_ctx is valid and all streams are configured.
        let ret = unsafe { avformat_write_header(self.fmt_ctx, ptr::null_mut()) };
        if let Err(e) = check_ffmpeg(ret, "avformat_write_header") {
            self.discard_file();
            return Err(EngineError::Mux(format!("{e}")));
        }
        self.header_written = true;

        for (slot, &stream) in self.streams.iter().enumerate() {
            // SAFETY: stream pointers live as long as fmt_ctx.
            let tb = unsafe { (*stream).time_base };
            tracing::debug!(
                slot,
                time_base_num = tb.num,
                time_base_den = tb.den,
                "Container header written"
            );
        }
        Ok(())
    }

    fn slot_time_base(&self, slot: usize) -> Option<TimeBase> {
        let stream = *self.streams.get(slot)?;
        // SAFETY: stream pointers live as long as fmt_ctx.
        time_base_from_av(unsafe { (*stream).time_base }).ok()
    }

    fn write_interleaved(&mut self, packet: &Packet) -> Result<()> {
        if !self.header_written {
            return Err(EngineError::Mux("packet written before header".into()));
        }
        if packet.stream_index >= self.streams.len() {
            return Err(EngineError::Mux(format!(
                "packet for unknown slot {}",
                packet.stream_index
            )));
        }

        // SAFETY: pkt is owned by self; av_new_packet allocates `size` bytes
        // which are then fully overwritten.
        unsafe {
            let ret = av_new_packet(self.pkt, packet.payload.len() as i32);
            check_ffmpeg(ret, "av_new_packet").map_err(|e| EngineError::Mux(format!("{e}")))?;
            ptr::copy_nonoverlapping(
                packet.payload.as_ptr(),
                (*self.pkt).data,
                packet.payload.len(),
            );

            (*self.pkt).pts = packet.pts.unwrap_or(AV_NOPTS_VALUE);
            (*self.pkt).dts = packet.dts.unwrap_or(AV_NOPTS_VALUE);
            (*self.pkt).duration = packet.duration;
            (*self.pkt).stream_index = packet.stream_index as i32;
            if packet.is_keyframe {
                (*self.pkt).flags |= AV_PKT_FLAG_KEY;
            }

            let ret = av_interleaved_write_frame(self.fmt_ctx, self.pkt);
            // av_interleaved_write_frame takes ownership and unrefs internally.
            check_ffmpeg(ret, "av_interleaved_write_frame")
                .map_err(|e| EngineError::Mux(format!("{e}")))?;
        }

        self.packet_counter += 1;
        if self.packet_counter.is_multiple_of(100) {
            tracing::debug!(packets = self.packet_counter, "Muxer progress");
        }
        Ok(())
    }

    fn write_trailer(&mut self) -> Result<()> {
        if !self.header_written || self.trailer_written {
            return Ok(());
        }
        // SAFETY: header was written on this context.
        let ret = unsafe { av_write_trailer(self.fmt_ctx) };
        check_ffmpeg(ret, "av_write_trailer").map_err(|e| EngineError::Mux(format!("{e}")))?;
        self.trailer_written = true;

        tracing::info!(
            path = %self.path.display(),
            packets = self.packet_counter,
            "Container finalized"
        );
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if !self.file_opened {
            return Ok(());
        }
        // SAFETY: pb was opened by open_file; avio_closep nulls it so Drop
        // will not close it twice.
        let ret = unsafe { avio_closep(&mut (*self.fmt_ctx).pb) };
        self.file_opened = false;
        check_ffmpeg(ret, "avio_closep").map_err(|e| EngineError::Mux(format!("{e}")))?;
        Ok(())
    }
}

impl Drop for FfmpegMuxer {
    fn drop(&mut self) {
        // SAFETY: pointers were allocated in `create` and are freed once.
        unsafe {
            av_packet_free(&mut self.pkt);

            if self.file_opened {
                avio_closep(&mut (*self.fmt_ctx).pb);
            }

            avformat_free_context(self.fmt_ctx);
            self.fmt_ctx = ptr::null_mut();
        }
        tracing::debug!("FFmpeg muxer destroyed");
    }
}
