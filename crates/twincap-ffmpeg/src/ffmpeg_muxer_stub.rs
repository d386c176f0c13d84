#![allow(missing_docs)]
//! Stub FFmpeg muxer for builds without FFmpeg runtime bindings.

use std::path::Path;

use twincap_core::error::{EngineError, Result};
use twincap_core::media::{OutputSink, Packet, StreamDescriptor};
use twincap_core::time_base::TimeBase;

const UNAVAILABLE: &str = "twincap-ffmpeg built without `ffmpeg-runtime`; container mux is unavailable";

/// Stub container muxer used when FFmpeg runtime support is disabled.
pub struct FfmpegMuxer;

impl FfmpegMuxer {
    pub fn create(path: &Path, format: Option<&str>) -> Result<Self> {
        let _ = (path, format);
        Err(EngineError::Mux(UNAVAILABLE.into()))
    }
}

impl OutputSink for FfmpegMuxer {
    fn register_stream(&mut self, _template: &StreamDescriptor) -> Result<usize> {
        Err(EngineError::Mux(UNAVAILABLE.into()))
    }

    fn write_header(&mut self) -> Result<()> {
        Err(EngineError::Mux(UNAVAILABLE.into()))
    }

    fn slot_time_base(&self, _slot: usize) -> Option<TimeBase> {
        None
    }

    fn write_interleaved(&mut self, _packet: &Packet) -> Result<()> {
        Err(EngineError::Mux(UNAVAILABLE.into()))
    }

    fn write_trailer(&mut self) -> Result<()> {
        Err(EngineError::Mux(UNAVAILABLE.into()))
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
