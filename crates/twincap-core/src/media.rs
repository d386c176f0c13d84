//! Source and sink contracts shared across crate boundaries.
//!
//! The capture loop in `twincap-pipeline` only sees these traits; the FFmpeg
//! implementations live in `twincap-ffmpeg` and the in-memory doubles in
//! [`crate::replay`].

use crate::error::Result;
use crate::time_base::{Rational, TimeBase, rescale};

// ─── Stream description ──────────────────────────────────────────────────

/// Track type as reported by the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    Video,
    Audio,
    Data,
    Subtitle,
    Unknown,
}

/// Codec description a sink needs to register a stream-copy output track.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodecParameters {
    /// Short codec name, e.g. `"h264"` or `"hevc"`.
    pub codec_name: String,
    pub width: u32,
    pub height: u32,
    /// Out-of-band codec configuration (SPS/PPS, `avcC`, ...).
    pub extradata: Vec<u8>,
}

/// One track of a source, as returned by [`SourceHandle::probe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDescriptor {
    pub index: usize,
    pub media_type: MediaType,
    pub time_base: TimeBase,
    pub frame_rate: Rational,
    pub codec: CodecParameters,
}

/// Pick the video track the way a linear scan without `break` does: every
/// video stream overwrites the choice, so the last one in enumeration order
/// wins.
pub fn select_video_stream(streams: &[StreamDescriptor]) -> Option<&StreamDescriptor> {
    let mut chosen = None;
    for stream in streams {
        if stream.media_type == MediaType::Video {
            chosen = Some(stream);
        }
    }
    chosen
}

// ─── Packets ─────────────────────────────────────────────────────────────

/// A single compressed packet.
///
/// Timestamps are in the time base of whichever stream currently owns the
/// packet: the source stream after a read, the output slot after
/// [`Packet::rescale_timestamps`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Packet {
    pub stream_index: usize,
    /// Presentation timestamp; `None` when the source did not set one.
    pub pts: Option<i64>,
    /// Decode timestamp; `None` when the source did not set one.
    pub dts: Option<i64>,
    /// Duration in ticks, `0` if unknown.
    pub duration: i64,
    pub payload: Vec<u8>,
    pub is_keyframe: bool,
}

impl Packet {
    /// Map pts/dts/duration from `from` into `to`, then add `offset` ticks of
    /// `to` to the timestamps that are present.
    pub fn rescale_timestamps(&mut self, from: TimeBase, to: TimeBase, offset: i64) {
        self.pts = self
            .pts
            .map(|pts| rescale(pts, from, to).saturating_add(offset));
        self.dts = self
            .dts
            .map(|dts| rescale(dts, from, to).saturating_add(offset));
        self.duration = rescale(self.duration, from, to);
    }

    /// Reset for reuse, keeping the payload allocation.
    pub fn recycle(&mut self) {
        self.stream_index = 0;
        self.pts = None;
        self.dts = None;
        self.duration = 0;
        self.payload.clear();
        self.is_keyframe = false;
    }
}

/// Result of one blocking read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// The caller's packet now holds a fresh packet.
    Ready,
    /// The source has no more packets.
    EndOfStream,
}

// ─── Source (live input → capture loop) ──────────────────────────────────

/// A live packet source with an absolute-time anchor.
///
/// Implementations: FFmpeg/RTSP input, replay doubles.
pub trait SourceHandle {
    /// Short label used in logs and errors (`"primary"`, `"secondary"`).
    fn name(&self) -> &str;

    /// Enumerate the source's tracks.
    fn probe(&mut self) -> Result<Vec<StreamDescriptor>>;

    /// Block until the next packet arrives and write it into `packet`.
    fn read_packet(&mut self, packet: &mut Packet) -> Result<ReadOutcome>;

    /// Wall-clock time, in microseconds since the Unix epoch, matching the
    /// source's stream start.  `None` until the transport delivers a fresh
    /// real-time reference (an RTCP sender report, for RTSP).
    fn anchor_realtime(&self) -> Option<i64>;

    /// Forget the current anchor so the next delivered one can be detected.
    fn clear_anchor(&mut self);

    /// Ask the source to stop sending.
    fn pause(&mut self) -> Result<()>;
}

// ─── Sink (capture loop → container) ─────────────────────────────────────

/// Ordered, interleaving packet sink for a multi-track container.
pub trait OutputSink {
    /// Add an output track copying time base, frame rate and codec
    /// parameters from `template`.  Returns the new slot index.
    fn register_stream(&mut self, template: &StreamDescriptor) -> Result<usize>;

    /// Create the output and write the container header.  Must follow all
    /// registrations; nothing reaches the output before this call.
    fn write_header(&mut self) -> Result<()>;

    /// Effective time base of `slot`.  After the header is written this may
    /// differ from the template's: muxers are free to pick their own.
    fn slot_time_base(&self, slot: usize) -> Option<TimeBase>;

    /// Write one packet whose timestamps are already in the slot time base.
    fn write_interleaved(&mut self, packet: &Packet) -> Result<()>;

    /// Flush interleaving queues and write the container trailer.
    fn write_trailer(&mut self) -> Result<()>;

    /// Release the underlying output.
    fn close(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(index: usize, media_type: MediaType) -> StreamDescriptor {
        StreamDescriptor {
            index,
            media_type,
            time_base: TimeBase::RTP_VIDEO,
            frame_rate: Rational::new(25, 1),
            codec: CodecParameters::default(),
        }
    }

    #[test]
    fn last_video_stream_wins() {
        let streams = [
            descriptor(0, MediaType::Video),
            descriptor(1, MediaType::Audio),
            descriptor(2, MediaType::Video),
            descriptor(3, MediaType::Data),
        ];
        assert_eq!(select_video_stream(&streams).map(|s| s.index), Some(2));
    }

    #[test]
    fn no_video_stream_selects_nothing() {
        let streams = [descriptor(0, MediaType::Audio)];
        assert!(select_video_stream(&streams).is_none());
        assert!(select_video_stream(&[]).is_none());
    }

    #[test]
    fn rescale_adds_offset_only_to_present_timestamps() {
        let mut pkt = Packet {
            pts: Some(3_000),
            dts: None,
            duration: 3_000,
            ..Packet::default()
        };
        let ms = TimeBase::new(1, 1000).expect("valid");
        pkt.rescale_timestamps(TimeBase::RTP_VIDEO, ms, 2_000);
        assert_eq!(pkt.pts, Some(2_033));
        assert_eq!(pkt.dts, None);
        assert_eq!(pkt.duration, 33);
    }

    #[test]
    fn recycle_keeps_payload_capacity() {
        let mut pkt = Packet {
            stream_index: 3,
            pts: Some(1),
            dts: Some(1),
            duration: 1,
            payload: vec![0u8; 4096],
            is_keyframe: true,
        };
        pkt.recycle();
        assert_eq!(pkt, Packet::default());
        assert!(pkt.payload.capacity() >= 4096);
    }
}
