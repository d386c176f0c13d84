//! Capture session configuration.
//!
//! A [`SessionConfig`] can be loaded from a JSON file; every field has a
//! default so a file only needs to name what it changes.  The CLI applies
//! its flags on top of the loaded values.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::clock::DriftPolicy;
use crate::error::{EngineError, Result};

/// Default per-slot frame budget.
pub const DEFAULT_FRAME_LIMIT: u64 = 5000;

/// Default transport-level reorder buffer depth, in packets.
pub const DEFAULT_REORDER_QUEUE_SIZE: u32 = 1000;

/// Transport used to pull packets from the live sources.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    /// Interleaved over the control connection: reliable and ordered.
    #[default]
    Tcp,
    /// Separate datagram flows: lower latency, may drop or reorder.
    Udp,
}

impl Transport {
    /// Value understood by the RTSP demuxer's `rtsp_transport` option.
    pub fn as_option_value(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

/// Options applied when connecting a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceOptions {
    pub transport: Transport,
    pub reorder_queue_size: u32,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            transport: Transport::Tcp,
            reorder_queue_size: DEFAULT_REORDER_QUEUE_SIZE,
        }
    }
}

/// Everything needed to run one capture.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// Locator of the primary source (e.g. an `rtsp://` URL).
    pub primary: String,
    /// Locator of the secondary source.
    pub secondary: String,
    /// Output container path.
    pub output: PathBuf,
    pub transport: Transport,
    pub reorder_queue_size: u32,
    /// Maximum packets written per output slot.
    pub frame_limit: u64,
    /// Muxer short name; guessed from `output` when absent.
    pub container_format: Option<String>,
    pub drift_policy: DriftPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            primary: String::new(),
            secondary: String::new(),
            output: PathBuf::from("output.mkv"),
            transport: Transport::Tcp,
            reorder_queue_size: DEFAULT_REORDER_QUEUE_SIZE,
            frame_limit: DEFAULT_FRAME_LIMIT,
            container_format: None,
            drift_policy: DriftPolicy::Frozen,
        }
    }
}

impl SessionConfig {
    /// Load a JSON config file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|err| {
            EngineError::Config(format!("Failed to read config {}: {err}", path.display()))
        })?;
        Self::from_json(&data).map_err(|err| match err {
            EngineError::Config(msg) => EngineError::Config(format!("{}: {msg}", path.display())),
            other => other,
        })
    }

    pub fn from_json(data: &str) -> Result<Self> {
        serde_json::from_str(data)
            .map_err(|err| EngineError::Config(format!("invalid JSON: {err}")))
    }

    pub fn source_options(&self) -> SourceOptions {
        SourceOptions {
            transport: self.transport,
            reorder_queue_size: self.reorder_queue_size,
        }
    }

    /// Configured container format, or the one implied by the output path.
    pub fn resolved_container_format(&self) -> Option<String> {
        self.container_format
            .clone()
            .or_else(|| guess_container_format(&self.output).map(str::to_string))
    }

    pub fn validate(&self) -> Result<()> {
        if self.primary.trim().is_empty() {
            return Err(EngineError::Config("primary source locator is empty".into()));
        }
        if self.secondary.trim().is_empty() {
            return Err(EngineError::Config(
                "secondary source locator is empty".into(),
            ));
        }
        if self.frame_limit == 0 {
            return Err(EngineError::Config("frame_limit must be at least 1".into()));
        }
        if self.reorder_queue_size == 0 {
            return Err(EngineError::Config(
                "reorder_queue_size must be at least 1".into(),
            ));
        }
        if self.output.as_os_str().is_empty() {
            return Err(EngineError::Config("output path is empty".into()));
        }
        Ok(())
    }
}

/// Muxer short name for a file extension, matching libavformat's names.
pub fn guess_container_format(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    let name = match ext.as_str() {
        "mkv" => "matroska",
        "mp4" | "m4v" => "mp4",
        "mov" => "mov",
        "ts" | "m2ts" => "mpegts",
        "webm" => "webm",
        "avi" => "avi",
        "flv" => "flv",
        "nut" => "nut",
        _ => return None,
    };
    Some(name)
}
