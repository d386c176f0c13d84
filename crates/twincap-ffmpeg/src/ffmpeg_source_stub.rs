#![allow(missing_docs)]
//! Stub live input for builds without FFmpeg runtime bindings.

use twincap_core::config::SourceOptions;
use twincap_core::error::{EngineError, Result};
use twincap_core::media::{Packet, ReadOutcome, SourceHandle, StreamDescriptor};

const UNAVAILABLE: &str = "twincap-ffmpeg built without `ffmpeg-runtime`; live input is unavailable";

/// Stub source used when FFmpeg runtime support is disabled.
pub struct FfmpegSource {
    name: String,
}

impl FfmpegSource {
    pub fn open(name: &str, locator: &str, options: &SourceOptions) -> Result<Self> {
        let _ = (locator, options);
        Err(EngineError::Connect {
            source_name: name.to_string(),
            message: UNAVAILABLE.into(),
        })
    }

    pub fn locator(&self) -> &str {
        ""
    }
}

impl SourceHandle for FfmpegSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn probe(&mut self) -> Result<Vec<StreamDescriptor>> {
        Err(EngineError::Probe(UNAVAILABLE.into()))
    }

    fn read_packet(&mut self, _packet: &mut Packet) -> Result<ReadOutcome> {
        Err(EngineError::Read(UNAVAILABLE.into()))
    }

    fn anchor_realtime(&self) -> Option<i64> {
        None
    }

    fn clear_anchor(&mut self) {}

    fn pause(&mut self) -> Result<()> {
        Ok(())
    }
}
