//! FFmpeg-backed live input, the [`SourceHandle`] impl for RTSP and any other
//! libavformat-readable locator.
//!
//! The absolute-time anchor is libavformat's `start_time_realtime`, which
//! the RTSP demuxer fills from RTCP sender reports.  Clearing it to
//! `AV_NOPTS_VALUE` lets the next sender report be detected.

use std::ptr;

use ffmpeg_sys_next::*;

use crate::ffmpeg_sys::{
    OptionsDict, check_ffmpeg, ensure_network_init, rational_from_av, stream_timing, to_cstring,
};
use twincap_core::config::SourceOptions;
use twincap_core::error::{EngineError, Result};
use twincap_core::media::{
    CodecParameters, Packet, ReadOutcome, SourceHandle, StreamDescriptor,
};

/// A connected live source.
pub struct FfmpegSource {
    name: String,
    locator: String,
    fmt_ctx: *mut AVFormatContext,
    /// Packet reused for every `av_read_frame`.
    pkt: *mut AVPacket,
    probed: bool,
}

// SAFETY: the capture loop owns the source and drives it from one thread.
unsafe impl Send for FfmpegSource {}

impl FfmpegSource {
    /// Connect to `locator` with the given transport options.
    pub fn open(name: &str, locator: &str, options: &SourceOptions) -> Result<Self> {
        ensure_network_init();
        let connect_err = |message: String| EngineError::Connect {
            source_name: name.to_string(),
            message,
        };
        let c_locator = to_cstring(locator).map_err(connect_err)?;

        let mut opts = OptionsDict::new();
        opts.set("rtsp_transport", options.transport.as_option_value())?;
        opts.set("reorder_queue_size", &options.reorder_queue_size.to_string())?;

        // ── Connect ──
        let mut fmt_ctx: *mut AVFormatContext = ptr::null_mut();
        // SAFETY: c_locator is NUL-terminated; on failure FFmpeg frees fmt_ctx.
        let ret = unsafe {
            avformat_open_input(&mut fmt_ctx, c_locator.as_ptr(), ptr::null(), opts.as_mut_ptr())
        };
        check_ffmpeg(ret, "avformat_open_input").map_err(|e| connect_err(e.to_string()))?;

        if opts.remaining() > 0 {
            tracing::debug!(
                source = name,
                unused = opts.remaining(),
                "Input ignored some options (not an RTSP locator?)"
            );
        }

        // SAFETY: plain allocation.
        let pkt = unsafe { av_packet_alloc() };
        if pkt.is_null() {
            // SAFETY: fmt_ctx was opened above.
            unsafe { avformat_close_input(&mut fmt_ctx) };
            return Err(connect_err("Failed to allocate AVPacket".into()));
        }

        tracing::info!(
            source = name,
            locator,
            transport = options.transport.as_option_value(),
            reorder_queue_size = options.reorder_queue_size,
            "Source connected"
        );

        Ok(Self {
            name: name.to_string(),
            locator: locator.to_string(),
            fmt_ctx,
            pkt,
            probed: false,
        })
    }

    pub fn locator(&self) -> &str {
        &self.locator
    }

    fn describe_stream(stream: &AVStream) -> Result<StreamDescriptor> {
        // SAFETY: codecpar is always allocated for streams of an open context.
        let par = unsafe { &*stream.codecpar };
        // SAFETY: avcodec_get_name returns a static string for any id.
        let codec_name = unsafe { std::ffi::CStr::from_ptr(avcodec_get_name(par.codec_id)) }
            .to_string_lossy()
            .into_owned();
        let extradata = if par.extradata.is_null() || par.extradata_size <= 0 {
            Vec::new()
        } else {
            // SAFETY: extradata is valid for extradata_size bytes.
            unsafe { std::slice::from_raw_parts(par.extradata, par.extradata_size as usize) }
                .to_vec()
        };
        let (media_type, time_base) = stream_timing(par.codec_type, stream.time_base)
            .map_err(|e| EngineError::Probe(format!("video stream {}: {e}", stream.index)))?;

        Ok(StreamDescriptor {
            index: stream.index as usize,
            media_type,
            time_base,
            frame_rate: rational_from_av(stream.r_frame_rate),
            codec: CodecParameters {
                codec_name,
                width: par.width.max(0) as u32,
                height: par.height.max(0) as u32,
                extradata,
            },
        })
    }

    fn copy_packet(pkt: &AVPacket, packet: &mut Packet) -> Result<()> {
        packet.stream_index = pkt.stream_index.max(0) as usize;
        packet.pts = (pkt.pts != AV_NOPTS_VALUE).then_some(pkt.pts);
        packet.dts = (pkt.dts != AV_NOPTS_VALUE).then_some(pkt.dts);
        packet.duration = pkt.duration;
        packet.is_keyframe = (pkt.flags & AV_PKT_FLAG_KEY) != 0;
        packet.payload.clear();
        if pkt.size <= 0 {
            return Ok(());
        }
        if pkt.data.is_null() {
            return Err(EngineError::Read(
                "FFmpeg produced packet with null data pointer".into(),
            ));
        }
        // SAFETY: `pkt.data` is valid for `pkt.size` bytes when size > 0.
        packet
            .payload
            .extend_from_slice(unsafe { std::slice::from_raw_parts(pkt.data, pkt.size as usize) });
        Ok(())
    }
}

impl SourceHandle for FfmpegSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn probe(&mut self) -> Result<Vec<StreamDescriptor>> {
        if !self.probed {
            // SAFETY: fmt_ctx is open.
            let ret = unsafe { avformat_find_stream_info(self.fmt_ctx, ptr::null_mut()) };
            check_ffmpeg(ret, "avformat_find_stream_info")
                .map_err(|e| EngineError::Probe(format!("{}: {e}", self.name)))?;
            self.probed = true;
        }

        // SAFETY: streams holds nb_streams valid pointers.
        let streams = unsafe {
            let ctx = &*self.fmt_ctx;
            if ctx.streams.is_null() {
                &[][..]
            } else {
                std::slice::from_raw_parts(ctx.streams, ctx.nb_streams as usize)
            }
        };
        let descriptors = streams
            .iter()
            // SAFETY: each entry is a valid AVStream owned by fmt_ctx.
            .map(|&stream| Self::describe_stream(unsafe { &*stream }))
            .collect::<Result<Vec<_>>>()?;

        tracing::info!(
            source = %self.name,
            streams = descriptors.len(),
            anchor_us = ?self.anchor_realtime(),
            "Source probed"
        );
        Ok(descriptors)
    }

    fn read_packet(&mut self, packet: &mut Packet) -> Result<ReadOutcome> {
        // SAFETY: fmt_ctx and pkt are valid for the lifetime of self.
        let ret = unsafe { av_read_frame(self.fmt_ctx, self.pkt) };
        if ret == AVERROR_EOF {
            return Ok(ReadOutcome::EndOfStream);
        }
        check_ffmpeg(ret, "av_read_frame")
            .map_err(|e| EngineError::Read(format!("{}: {e}", self.name)))?;

        // SAFETY: av_read_frame succeeded, so pkt holds a packet.
        let copied = Self::copy_packet(unsafe { &*self.pkt }, packet);
        // SAFETY: pkt holds a reference we own.
        unsafe { av_packet_unref(self.pkt) };
        copied.map(|()| ReadOutcome::Ready)
    }

    fn anchor_realtime(&self) -> Option<i64> {
        // SAFETY: fmt_ctx is valid for the lifetime of self.
        let realtime = unsafe { (*self.fmt_ctx).start_time_realtime };
        (realtime != AV_NOPTS_VALUE).then_some(realtime)
    }

    fn clear_anchor(&mut self) {
        // SAFETY: fmt_ctx is valid; the demuxer overwrites this field when the
        // next sender report arrives.
        unsafe { (*self.fmt_ctx).start_time_realtime = AV_NOPTS_VALUE };
    }

    fn pause(&mut self) -> Result<()> {
        // SAFETY: fmt_ctx is valid.
        let ret = unsafe { av_read_pause(self.fmt_ctx) };
        check_ffmpeg(ret, "av_read_pause")
            .map_err(|e| EngineError::Read(format!("{}: {e}", self.name)))
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        // SAFETY: both were allocated in `open` and are freed exactly once.
        unsafe {
            av_packet_free(&mut self.pkt);
            if !self.fmt_ctx.is_null() {
                avformat_close_input(&mut self.fmt_ctx);
            }
        }
        tracing::debug!(source = %self.name, "Source closed");
    }
}
