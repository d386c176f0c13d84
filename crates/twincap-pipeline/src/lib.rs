#![doc = include_str!("../README.md")]

pub mod capture;
pub mod metrics;
pub mod runtime;
pub mod simulation;

pub use capture::{
    CaptureOptions, CaptureReport, CaptureState, FrameBudget, OutputSlot, SourceRole,
    StopReason, SynchronizedCapture,
};
pub use metrics::{CaptureMetrics, MetricsSnapshot};
pub use simulation::{SimulatedCapture, SimulationPlan};
