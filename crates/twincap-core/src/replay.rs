//! In-memory [`SourceHandle`] and [`OutputSink`] implementations.
//!
//! [`ReplaySource`] plays back a scripted sequence of packets, anchor
//! refreshes and read failures; [`RecordingSink`] keeps every written packet
//! and checks the header → packets → trailer → close ordering a real muxer
//! requires.  Both are used by the pipeline tests and by `twincap simulate`.

use std::collections::VecDeque;

use crate::error::{EngineError, Result};
use crate::media::{
    CodecParameters, MediaType, OutputSink, Packet, ReadOutcome, SourceHandle, StreamDescriptor,
};
use crate::time_base::{Rational, TimeBase};

/// One scripted packet.
#[derive(Debug, Clone)]
pub struct ReplayPacket {
    pub stream_index: usize,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub duration: i64,
    pub is_keyframe: bool,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
enum ReplayEvent {
    Packet(ReplayPacket),
    Anchor(i64),
    Fail(String),
}

#[derive(Debug, Clone, Copy)]
struct Endless {
    stream_index: usize,
    ticks_per_frame: i64,
    next_frame: i64,
}

/// Scripted live source.
#[derive(Debug)]
pub struct ReplaySource {
    name: String,
    streams: Vec<StreamDescriptor>,
    events: VecDeque<ReplayEvent>,
    endless: Option<Endless>,
    anchor: Option<i64>,
    probe_error: Option<String>,
    pause_error: Option<String>,
    reads: u64,
    paused: bool,
}

impl ReplaySource {
    pub fn builder(name: impl Into<String>) -> ReplaySourceBuilder {
        ReplaySourceBuilder {
            source: ReplaySource {
                name: name.into(),
                streams: Vec::new(),
                events: VecDeque::new(),
                endless: None,
                anchor: None,
                probe_error: None,
                pause_error: None,
                reads: 0,
                paused: false,
            },
        }
    }

    /// Number of `read_packet` calls made so far, including failed ones.
    pub fn reads(&self) -> u64 {
        self.reads
    }

    pub fn paused(&self) -> bool {
        self.paused
    }

    fn fill(packet: &mut Packet, scripted: &ReplayPacket) {
        packet.stream_index = scripted.stream_index;
        packet.pts = scripted.pts;
        packet.dts = scripted.dts;
        packet.duration = scripted.duration;
        packet.is_keyframe = scripted.is_keyframe;
        packet.payload.clear();
        packet.payload.extend_from_slice(&scripted.payload);
    }
}

impl SourceHandle for ReplaySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn probe(&mut self) -> Result<Vec<StreamDescriptor>> {
        if let Some(message) = &self.probe_error {
            return Err(EngineError::Probe(format!("{}: {message}", self.name)));
        }
        Ok(self.streams.clone())
    }

    fn read_packet(&mut self, packet: &mut Packet) -> Result<ReadOutcome> {
        self.reads += 1;
        loop {
            match self.events.pop_front() {
                Some(ReplayEvent::Anchor(anchor)) => {
                    self.anchor = Some(anchor);
                }
                Some(ReplayEvent::Fail(message)) => {
                    return Err(EngineError::Read(format!("{}: {message}", self.name)));
                }
                Some(ReplayEvent::Packet(scripted)) => {
                    Self::fill(packet, &scripted);
                    return Ok(ReadOutcome::Ready);
                }
                None => break,
            }
        }

        let Some(endless) = self.endless.as_mut() else {
            return Ok(ReadOutcome::EndOfStream);
        };
        let frame = endless.next_frame;
        endless.next_frame += 1;
        let ts = frame.saturating_mul(endless.ticks_per_frame);
        Self::fill(
            packet,
            &ReplayPacket {
                stream_index: endless.stream_index,
                pts: Some(ts),
                dts: Some(ts),
                duration: endless.ticks_per_frame,
                is_keyframe: frame % 25 == 0,
                payload: frame.to_le_bytes().to_vec(),
            },
        );
        Ok(ReadOutcome::Ready)
    }

    fn anchor_realtime(&self) -> Option<i64> {
        self.anchor
    }

    fn clear_anchor(&mut self) {
        self.anchor = None;
    }

    fn pause(&mut self) -> Result<()> {
        self.paused = true;
        match &self.pause_error {
            Some(message) => Err(EngineError::Read(format!("{}: {message}", self.name))),
            None => Ok(()),
        }
    }
}

/// Builder for [`ReplaySource`].
#[derive(Debug)]
pub struct ReplaySourceBuilder {
    source: ReplaySource,
}

impl ReplaySourceBuilder {
    /// Append a track; its index is its position.
    pub fn stream(mut self, media_type: MediaType, time_base: TimeBase, frame_rate: Rational) -> Self {
        let index = self.source.streams.len();
        let codec = match media_type {
            MediaType::Video => CodecParameters {
                codec_name: "h264".into(),
                width: 1280,
                height: 720,
                extradata: Vec::new(),
            },
            MediaType::Audio => CodecParameters {
                codec_name: "aac".into(),
                ..CodecParameters::default()
            },
            _ => CodecParameters::default(),
        };
        self.source.streams.push(StreamDescriptor {
            index,
            media_type,
            time_base,
            frame_rate,
            codec,
        });
        self
    }

    pub fn video_stream(self, time_base: TimeBase, frame_rate: Rational) -> Self {
        self.stream(MediaType::Video, time_base, frame_rate)
    }

    pub fn audio_stream(self, time_base: TimeBase) -> Self {
        self.stream(MediaType::Audio, time_base, Rational::UNKNOWN)
    }

    /// Anchor reported from connection time.
    pub fn anchor(mut self, anchor_us: Option<i64>) -> Self {
        self.source.anchor = anchor_us;
        self
    }

    pub fn packet(mut self, packet: ReplayPacket) -> Self {
        self.source.events.push_back(ReplayEvent::Packet(packet));
        self
    }

    /// Queue `count` consecutive frames on `stream_index`, starting at pts 0.
    pub fn frames(mut self, stream_index: usize, count: u64, ticks_per_frame: i64) -> Self {
        let start = self.next_pts(stream_index, ticks_per_frame);
        for i in 0..count {
            let ts = start + i as i64 * ticks_per_frame;
            self.source.events.push_back(ReplayEvent::Packet(ReplayPacket {
                stream_index,
                pts: Some(ts),
                dts: Some(ts),
                duration: ticks_per_frame,
                is_keyframe: i % 25 == 0,
                payload: vec![stream_index as u8; 16],
            }));
        }
        self
    }

    /// Deliver a fresh anchor just before the next queued packet.
    pub fn refresh_anchor(mut self, anchor_us: i64) -> Self {
        self.source.events.push_back(ReplayEvent::Anchor(anchor_us));
        self
    }

    /// Make the next read fail after the queued events.
    pub fn fail_read(mut self, message: impl Into<String>) -> Self {
        self.source.events.push_back(ReplayEvent::Fail(message.into()));
        self
    }

    /// Once the queue is exhausted, keep producing frames forever.
    pub fn endless(mut self, stream_index: usize, ticks_per_frame: i64) -> Self {
        self.source.endless = Some(Endless {
            stream_index,
            ticks_per_frame,
            next_frame: 0,
        });
        self
    }

    pub fn probe_error(mut self, message: impl Into<String>) -> Self {
        self.source.probe_error = Some(message.into());
        self
    }

    pub fn pause_error(mut self, message: impl Into<String>) -> Self {
        self.source.pause_error = Some(message.into());
        self
    }

    pub fn build(self) -> ReplaySource {
        self.source
    }

    fn next_pts(&self, stream_index: usize, ticks_per_frame: i64) -> i64 {
        self.source
            .events
            .iter()
            .rev()
            .find_map(|event| match event {
                ReplayEvent::Packet(p) if p.stream_index == stream_index => {
                    p.pts.map(|pts| pts + ticks_per_frame)
                }
                _ => None,
            })
            .unwrap_or(0)
    }
}

// ─── Recording sink ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SinkPhase {
    Registering,
    Writing,
    Finished,
    Closed,
}

/// Sink that keeps everything written to it.
#[derive(Debug)]
pub struct RecordingSink {
    templates: Vec<StreamDescriptor>,
    time_base_override: Option<TimeBase>,
    packets: Vec<Packet>,
    phase: SinkPhase,
    trailer_written: bool,
    output_created: bool,
    fail_after: Option<usize>,
    rejected_codec: Option<String>,
}

impl Default for RecordingSink {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingSink {
    pub fn new() -> Self {
        Self {
            templates: Vec::new(),
            time_base_override: None,
            packets: Vec::new(),
            phase: SinkPhase::Registering,
            trailer_written: false,
            output_created: false,
            fail_after: None,
            rejected_codec: None,
        }
    }

    /// Report `time_base` for every slot once the header is written, the way
    /// Matroska forces 1/1000.
    pub fn with_time_base_override(mut self, time_base: TimeBase) -> Self {
        self.time_base_override = Some(time_base);
        self
    }

    /// Reject every write after `count` successful ones.
    pub fn fail_writes_after(mut self, count: usize) -> Self {
        self.fail_after = Some(count);
        self
    }

    /// Refuse to register tracks carrying `codec_name`, as a muxer does for
    /// codecs its container cannot hold.
    pub fn rejecting_codec(mut self, codec_name: impl Into<String>) -> Self {
        self.rejected_codec = Some(codec_name.into());
        self
    }

    pub fn templates(&self) -> &[StreamDescriptor] {
        &self.templates
    }

    pub fn packets(&self) -> &[Packet] {
        &self.packets
    }

    /// Packets written to `slot`, in write order.
    pub fn slot_packets(&self, slot: usize) -> impl Iterator<Item = &Packet> {
        self.packets.iter().filter(move |p| p.stream_index == slot)
    }

    /// Whether anything reached the output.  A file-backed muxer creates its
    /// file at this point.
    pub fn output_created(&self) -> bool {
        self.output_created
    }

    pub fn header_written(&self) -> bool {
        self.phase != SinkPhase::Registering
    }

    pub fn trailer_written(&self) -> bool {
        self.trailer_written
    }

    pub fn closed(&self) -> bool {
        self.phase == SinkPhase::Closed
    }
}

impl OutputSink for RecordingSink {
    fn register_stream(&mut self, template: &StreamDescriptor) -> Result<usize> {
        if self.phase != SinkPhase::Registering {
            return Err(EngineError::Mux("stream registered after header".into()));
        }
        if self.rejected_codec.as_deref() == Some(template.codec.codec_name.as_str()) {
            return Err(EngineError::Mux(format!(
                "Unknown codec '{}' on source stream {}",
                template.codec.codec_name, template.index
            )));
        }
        self.templates.push(template.clone());
        Ok(self.templates.len() - 1)
    }

    fn write_header(&mut self) -> Result<()> {
        if self.phase != SinkPhase::Registering {
            return Err(EngineError::Mux("header written twice".into()));
        }
        if self.templates.is_empty() {
            return Err(EngineError::Mux("header written with no streams".into()));
        }
        self.output_created = true;
        self.phase = SinkPhase::Writing;
        Ok(())
    }

    fn slot_time_base(&self, slot: usize) -> Option<TimeBase> {
        let template = self.templates.get(slot)?;
        match (self.phase, self.time_base_override) {
            (SinkPhase::Registering, _) | (_, None) => Some(template.time_base),
            (_, Some(forced)) => Some(forced),
        }
    }

    fn write_interleaved(&mut self, packet: &Packet) -> Result<()> {
        if self.phase != SinkPhase::Writing {
            return Err(EngineError::Mux(format!(
                "packet written in phase {:?}",
                self.phase
            )));
        }
        if packet.stream_index >= self.templates.len() {
            return Err(EngineError::Mux(format!(
                "packet for unknown slot {}",
                packet.stream_index
            )));
        }
        if self.fail_after.is_some_and(|limit| self.packets.len() >= limit) {
            return Err(EngineError::Mux("scripted write failure".into()));
        }
        self.packets.push(packet.clone());
        Ok(())
    }

    fn write_trailer(&mut self) -> Result<()> {
        if self.phase != SinkPhase::Writing {
            return Err(EngineError::Mux(format!(
                "trailer written in phase {:?}",
                self.phase
            )));
        }
        self.phase = SinkPhase::Finished;
        self.trailer_written = true;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.phase = SinkPhase::Closed;
        Ok(())
    }
}
