//! Typed error hierarchy for the capture engine.
//!
//! Uses `thiserror` for library-grade errors.  Each variant maps to a stable
//! integer code via [`EngineError::error_code`], which the CLI also uses as
//! its process exit status.

/// All errors originating from twincap.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    // ── Configuration ────────────────────────────────────────────────
    #[error("Configuration error: {0}")]
    Config(String),

    // ── Timing ───────────────────────────────────────────────────────
    #[error("Invalid time base {num}/{den}: numerator and denominator must be positive")]
    InvalidTimeBase { num: i64, den: i64 },

    // ── Sources and sink ─────────────────────────────────────────────
    #[error("Connect error ({source_name}): {message}")]
    Connect {
        source_name: String,
        message: String,
    },

    #[error("Probe error: {0}")]
    Probe(String),

    #[error("No video stream found on {0} source")]
    NoVideoStream(String),

    #[error("Read error: {0}")]
    Read(String),

    #[error("Mux error: {0}")]
    Mux(String),

    // ── Pipeline ─────────────────────────────────────────────────────
    #[error("Pipeline error: {0}")]
    Pipeline(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidState {
        from: &'static str,
        to: &'static str,
    },
}

impl EngineError {
    /// Stable integer error code.
    ///
    /// Codes are grouped by category:
    /// - 1xx: configuration
    /// - 2xx: timing
    /// - 3xx: source/sink I/O
    /// - 4xx: pipeline
    pub fn error_code(&self) -> u32 {
        match self {
            Self::Config(_) => 100,
            Self::InvalidTimeBase { .. } => 200,
            Self::Connect { .. } => 300,
            Self::Probe(_) => 301,
            Self::NoVideoStream(_) => 302,
            Self::Read(_) => 303,
            Self::Mux(_) => 304,
            Self::Pipeline(_) => 400,
            Self::InvalidState { .. } => 401,
        }
    }

    /// Whether the capture loop treats this error as a normal end of stream.
    pub fn ends_stream_gracefully(&self) -> bool {
        matches!(self, Self::Read(_))
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::EngineError;

    #[test]
    fn codes_are_grouped_by_category() {
        assert_eq!(EngineError::Config("x".into()).error_code() / 100, 1);
        assert_eq!(
            EngineError::InvalidTimeBase { num: 0, den: 1 }.error_code() / 100,
            2
        );
        assert_eq!(EngineError::Mux("x".into()).error_code() / 100, 3);
        assert_eq!(EngineError::Pipeline("x".into()).error_code() / 100, 4);
    }

    #[test]
    fn only_read_errors_end_the_stream() {
        assert!(EngineError::Read("socket closed".into()).ends_stream_gracefully());
        assert!(!EngineError::Mux("disk full".into()).ends_stream_gracefully());
        assert!(!EngineError::Probe("no streams".into()).ends_stream_gracefully());
    }
}
