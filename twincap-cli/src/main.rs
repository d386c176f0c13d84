//! twincap CLI entrypoint.
//!
//! ```bash
//! twincap capture --primary rtsp://cam-a/stream --secondary rtsp://cam-b/stream -o out.mkv
//! twincap capture --config session.json --frame-limit 1000 --progress jsonl
//! twincap simulate --offset-us 2000000 --frame-limit 50 --json
//! twincap offset --primary-anchor-us 1000000 --secondary-anchor-us 3000000
//! ```

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::{Value, json};

use twincap_core::clock::{DriftPolicy, SyncOffset, estimate};
use twincap_core::config::{DEFAULT_FRAME_LIMIT, SessionConfig, Transport};
use twincap_core::error::{EngineError, Result};
use twincap_core::media::{OutputSink, SourceHandle};
use twincap_core::time_base::{Rational, TimeBase};
use twincap_pipeline::runtime::{open_session, runtime_available};
use twincap_pipeline::{
    CaptureMetrics, CaptureOptions, CaptureReport, MetricsSnapshot, SimulationPlan, StopReason,
    SynchronizedCapture,
};

#[derive(Parser, Debug)]
#[command(
    name = "twincap",
    version,
    about = "Record two live video sources into one time-aligned container",
    arg_required_else_help = true,
    after_help = "Examples:\n  twincap capture --primary rtsp://cam-a/stream --secondary rtsp://cam-b/stream -o out.mkv\n  twincap capture --config session.json --dry-run --json\n  twincap simulate --offset-us 2000000 --frame-limit 50 --json\n  twincap offset --primary-anchor-us 0 --secondary-anchor-us 2000000"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Capture two live sources into one container.
    Capture(CaptureArgs),
    /// Run the capture loop against scripted in-memory sources.
    Simulate(SimulateArgs),
    /// Compute the clock offset for a pair of real-time anchors.
    Offset(OffsetArgs),
}

#[derive(Args, Debug, Clone)]
struct CaptureArgs {
    /// Primary source locator (e.g. rtsp://host/stream).
    #[arg(long = "primary")]
    primary: Option<String>,

    /// Secondary source locator.
    #[arg(long = "secondary")]
    secondary: Option<String>,

    /// Output container path.
    #[arg(short = 'o', long = "output")]
    output: Option<PathBuf>,

    /// JSON session config; flags override its values.
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// RTSP lower transport.
    #[arg(long = "transport", value_enum)]
    transport: Option<TransportArg>,

    /// Transport reorder buffer depth, in packets.
    #[arg(long = "reorder-queue-size")]
    reorder_queue_size: Option<u32>,

    /// Maximum packets written per output track.
    #[arg(long = "frame-limit")]
    frame_limit: Option<u64>,

    /// Container format short name (matroska, mp4, mpegts, ...).
    #[arg(long = "format")]
    format: Option<String>,

    /// Apply re-estimated clock offsets instead of keeping the initial one.
    #[arg(long = "apply-drift", default_value_t = false)]
    apply_drift: bool,

    /// Resolve and validate the session only; do not connect.
    #[arg(long = "dry-run", default_value_t = false)]
    dry_run: bool,

    /// Emit structured JSON output to stdout.
    #[arg(long = "json", default_value_t = false)]
    json: bool,

    /// Progress output mode to stderr: auto (TTY only), off, human, jsonl.
    #[arg(long = "progress", value_enum, default_value_t = ProgressArg::Auto)]
    progress: ProgressArg,
}

#[derive(Args, Debug, Clone)]
struct SimulateArgs {
    /// Video frames produced by the primary source.
    #[arg(long = "primary-frames", default_value_t = 250)]
    primary_frames: u64,

    /// Video frames produced by the secondary source.
    #[arg(long = "secondary-frames", default_value_t = 250)]
    secondary_frames: u64,

    /// Both sources produce frames until the frame limit stops the loop.
    #[arg(long = "endless", default_value_t = false)]
    endless: bool,

    /// Secondary anchor minus primary anchor, in microseconds.
    #[arg(long = "offset-us", default_value_t = 0, allow_negative_numbers = true)]
    offset_us: i64,

    /// Primary stream time base (NUM/DEN).
    #[arg(long = "primary-time-base", default_value = "1/90000")]
    primary_time_base: TimeBase,

    /// Secondary stream time base (NUM/DEN).
    #[arg(long = "secondary-time-base", default_value = "1/90000")]
    secondary_time_base: TimeBase,

    /// Time base the container imposes on both tracks (e.g. 1/1000 for mkv).
    #[arg(long = "container-time-base")]
    container_time_base: Option<TimeBase>,

    /// Frames per second of both sources.
    #[arg(long = "fps", default_value_t = 25)]
    fps: i32,

    /// Maximum packets written per output track.
    #[arg(long = "frame-limit", default_value_t = DEFAULT_FRAME_LIMIT)]
    frame_limit: u64,

    /// Insert one audio packet on the primary after every N video frames.
    #[arg(long = "audio-every")]
    audio_every: Option<u64>,

    /// Deliver fresh real-time anchors on both sources every N frames.
    #[arg(long = "refresh-every")]
    refresh_every: Option<u64>,

    /// Extra secondary lag added at each anchor refresh, in microseconds.
    #[arg(long = "drift-us", default_value_t = 0, allow_negative_numbers = true)]
    drift_us: i64,

    /// Apply re-estimated clock offsets instead of keeping the initial one.
    #[arg(long = "apply-drift", default_value_t = false)]
    apply_drift: bool,

    /// Emit structured JSON output to stdout.
    #[arg(long = "json", default_value_t = false)]
    json: bool,

    /// Progress output mode to stderr: auto (TTY only), off, human, jsonl.
    #[arg(long = "progress", value_enum, default_value_t = ProgressArg::Auto)]
    progress: ProgressArg,
}

#[derive(Args, Debug, Clone)]
struct OffsetArgs {
    /// Primary stream start, wall-clock microseconds.
    #[arg(long = "primary-anchor-us", allow_negative_numbers = true)]
    primary_anchor_us: i64,

    /// Secondary stream start, wall-clock microseconds.
    #[arg(long = "secondary-anchor-us", allow_negative_numbers = true)]
    secondary_anchor_us: i64,

    /// Secondary output time base (NUM/DEN).
    #[arg(long = "time-base", default_value = "1/90000")]
    time_base: TimeBase,

    /// Emit structured JSON output to stdout.
    #[arg(long = "json", default_value_t = false)]
    json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ProgressArg {
    Auto,
    Off,
    Human,
    Jsonl,
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
enum TransportArg {
    Tcp,
    Udp,
}

impl From<TransportArg> for Transport {
    fn from(arg: TransportArg) -> Self {
        match arg {
            TransportArg::Tcp => Transport::Tcp,
            TransportArg::Udp => Transport::Udp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProgressMode {
    Off,
    Human,
    Jsonl,
}

struct ProgressReporter {
    notify: Arc<tokio::sync::Notify>,
    handle: tokio::task::JoinHandle<()>,
}

impl ProgressReporter {
    async fn stop(self) {
        self.notify.notify_one();
        let _ = self.handle.await;
    }
}

const JSON_SCHEMA_VERSION: u32 = 1;

fn main() {
    init_tracing();

    let cli = Cli::parse();
    let json_error_command = match &cli.command {
        Commands::Capture(args) if args.json => Some("capture"),
        Commands::Simulate(args) if args.json => Some("simulate"),
        Commands::Offset(args) if args.json => Some("offset"),
        _ => None,
    };

    let result = match cli.command {
        Commands::Offset(args) => run_offset(args),
        Commands::Capture(args) => build_runtime().and_then(|rt| rt.block_on(run_capture(args))),
        Commands::Simulate(args) => {
            build_runtime().and_then(|rt| rt.block_on(run_simulate(args)))
        }
    };

    match result {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            if let Some(command) = json_error_command {
                println!("{}", command_error_json(command, &err));
            } else {
                tracing::error!(error = %err, code = err.error_code(), "Command failed");
            }
            std::process::exit(err.error_code() as i32);
        }
    }
}

fn init_tracing() {
    let ansi_enabled = std::env::var_os("NO_COLOR").is_none() && std::io::stderr().is_terminal();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_ansi(ansi_enabled)
        .init();
}

fn build_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| EngineError::Pipeline(format!("Failed to build tokio runtime: {err}")))
}

// ─── capture ────────────────────────────────────────────────────────────────

fn resolve_session_config(args: &CaptureArgs) -> Result<SessionConfig> {
    let mut config = match &args.config {
        Some(path) => SessionConfig::load(path)?,
        None => SessionConfig::default(),
    };
    if let Some(primary) = &args.primary {
        config.primary = primary.clone();
    }
    if let Some(secondary) = &args.secondary {
        config.secondary = secondary.clone();
    }
    if let Some(output) = &args.output {
        config.output = output.clone();
    }
    if let Some(transport) = args.transport {
        config.transport = transport.into();
    }
    if let Some(size) = args.reorder_queue_size {
        config.reorder_queue_size = size;
    }
    if let Some(limit) = args.frame_limit {
        config.frame_limit = limit;
    }
    if let Some(format) = &args.format {
        config.container_format = Some(format.clone());
    }
    if args.apply_drift {
        config.drift_policy = DriftPolicy::Apply;
    }
    config.validate()?;
    Ok(config)
}

async fn run_capture(args: CaptureArgs) -> Result<()> {
    let config = resolve_session_config(&args)?;
    let format = config.resolved_container_format();

    if args.dry_run {
        if args.json {
            println!("{}", session_json(&config, format.as_deref(), true));
        } else {
            println!(
                "dry-run: command=capture primary={} secondary={} output={} format={} transport={} frame_limit={} drift_policy={}",
                config.primary,
                config.secondary,
                config.output.display(),
                format.as_deref().unwrap_or("guessed"),
                config.transport.as_option_value(),
                config.frame_limit,
                drift_policy_label(config.drift_policy),
            );
        }
        return Ok(());
    }

    if !runtime_available() {
        tracing::warn!("Built without `ffmpeg-runtime`; live sources cannot be opened");
    }

    let wall_start = Instant::now();
    let session = config.clone();
    let capture = tokio::task::spawn_blocking(move || open_session(&session))
        .await
        .map_err(|err| EngineError::Pipeline(format!("session setup task failed: {err}")))??;

    let progress_mode = resolve_progress_mode(args.progress);
    let report = drive_capture("capture", capture, progress_mode).await?;
    let elapsed = wall_start.elapsed();

    if args.json {
        let mut value = report_json("capture", &report, elapsed);
        value["output"] = json!(config.output.display().to_string());
        value["format"] = json!(format);
        println!("{value}");
    } else {
        println!(
            "capture: ok output={} stop={} primary={} secondary={} delta_pts={} elapsed_s={:.3}",
            config.output.display(),
            report.stop_reason.as_str(),
            report.budget.count_primary,
            report.budget.count_secondary,
            report.applied_offset.delta_pts,
            elapsed.as_secs_f64(),
        );
    }
    Ok(())
}

/// Run a capture on a blocking worker while the progress reporter samples
/// its metrics.
async fn drive_capture<P, S, O>(
    command: &'static str,
    mut capture: SynchronizedCapture<P, S, O>,
    progress_mode: ProgressMode,
) -> Result<CaptureReport>
where
    P: SourceHandle + Send + 'static,
    S: SourceHandle + Send + 'static,
    O: OutputSink + Send + 'static,
{
    let progress = spawn_progress_reporter(command, capture.metrics(), progress_mode);
    let run_result = tokio::task::spawn_blocking(move || capture.run())
        .await
        .map_err(|err| EngineError::Pipeline(format!("capture task failed: {err}")));
    if let Some(progress) = progress {
        progress.stop().await;
    }
    run_result?
}

// ─── simulate ───────────────────────────────────────────────────────────────

fn simulation_plan(args: &SimulateArgs) -> SimulationPlan {
    let frames = |count| (!args.endless).then_some(count);
    SimulationPlan {
        primary_frames: frames(args.primary_frames),
        secondary_frames: frames(args.secondary_frames),
        primary_time_base: args.primary_time_base,
        secondary_time_base: args.secondary_time_base,
        frame_rate: Rational::new(args.fps, 1),
        offset_us: args.offset_us,
        audio_every: args.audio_every,
        refresh_every: args.refresh_every,
        drift_us_per_refresh: args.drift_us,
        container_time_base: args.container_time_base,
        options: CaptureOptions {
            frame_limit: args.frame_limit,
            drift_policy: if args.apply_drift {
                DriftPolicy::Apply
            } else {
                DriftPolicy::Frozen
            },
        },
        ..SimulationPlan::default()
    }
}

async fn run_simulate(args: SimulateArgs) -> Result<()> {
    if args.frame_limit == 0 {
        return Err(EngineError::Config("frame_limit must be at least 1".into()));
    }
    let plan = simulation_plan(&args);
    let capture = plan.build()?;

    let wall_start = Instant::now();
    let report = drive_capture("simulate", capture, resolve_progress_mode(args.progress)).await?;
    let elapsed = wall_start.elapsed();

    if args.json {
        println!("{}", report_json("simulate", &report, elapsed));
    } else {
        println!(
            "simulate: ok stop={} primary={} secondary={} dropped={} delta_pts={} latest_delta_pts={} re_estimations={}",
            report.stop_reason.as_str(),
            report.budget.count_primary,
            report.budget.count_secondary,
            report.primary_dropped + report.secondary_dropped,
            report.applied_offset.delta_pts,
            report.latest_offset.delta_pts,
            report.re_estimations,
        );
    }
    Ok(())
}

// ─── offset ─────────────────────────────────────────────────────────────────

fn run_offset(args: OffsetArgs) -> Result<()> {
    let offset = estimate(
        Some(args.primary_anchor_us),
        Some(args.secondary_anchor_us),
        args.time_base,
    )
    .unwrap_or_default();

    if args.json {
        println!(
            "{}",
            json!({
                "schema_version": JSON_SCHEMA_VERSION,
                "command": "offset",
                "ok": true,
                "time_base": args.time_base.to_string(),
                "delta_realtime_us": offset.delta_realtime_us,
                "delta_pts": offset.delta_pts,
            })
        );
    } else {
        println!(
            "offset: delta_realtime_us={} delta_pts={} time_base={}",
            offset.delta_realtime_us, offset.delta_pts, args.time_base
        );
    }
    Ok(())
}

// ─── progress ───────────────────────────────────────────────────────────────

fn resolve_progress_mode(progress: ProgressArg) -> ProgressMode {
    match progress {
        ProgressArg::Auto => {
            if std::io::stderr().is_terminal() {
                ProgressMode::Human
            } else {
                ProgressMode::Off
            }
        }
        ProgressArg::Off => ProgressMode::Off,
        ProgressArg::Human => ProgressMode::Human,
        ProgressArg::Jsonl => ProgressMode::Jsonl,
    }
}

fn progress_tick() -> Duration {
    std::env::var("TWINCAP_PROGRESS_TICK_MS")
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .filter(|&ms| ms > 0)
        .map(Duration::from_millis)
        .unwrap_or(Duration::from_secs(1))
}

fn emit_progress_line(
    command: &'static str,
    mode: ProgressMode,
    elapsed: Duration,
    snapshot: MetricsSnapshot,
    final_line: bool,
) {
    // Progress goes to stderr only; stdout carries the single result line.
    match mode {
        ProgressMode::Off => {}
        ProgressMode::Human => {
            eprintln!(
                "progress: command={} elapsed_s={:.3} primary={} secondary={} dropped={} delta_pts={} final={}",
                command,
                elapsed.as_secs_f64(),
                snapshot.primary_written,
                snapshot.secondary_written,
                snapshot.primary_dropped + snapshot.secondary_dropped,
                snapshot.latest_delta_pts,
                final_line
            );
        }
        ProgressMode::Jsonl => {
            eprintln!(
                "{}",
                json!({
                    "schema_version": JSON_SCHEMA_VERSION,
                    "type": "progress",
                    "command": command,
                    "elapsed_ms": elapsed.as_millis() as u64,
                    "frames": {
                        "primary": snapshot.primary_written,
                        "secondary": snapshot.secondary_written,
                    },
                    "dropped": snapshot.primary_dropped + snapshot.secondary_dropped,
                    "iterations": snapshot.iterations,
                    "latest_delta_pts": snapshot.latest_delta_pts,
                    "final": final_line,
                })
            );
        }
    }
}

fn spawn_progress_reporter(
    command: &'static str,
    metrics: Arc<CaptureMetrics>,
    mode: ProgressMode,
) -> Option<ProgressReporter> {
    if matches!(mode, ProgressMode::Off) {
        return None;
    }

    let tick = progress_tick();
    let notify = Arc::new(tokio::sync::Notify::new());
    let notify_task = notify.clone();
    let handle = tokio::spawn(async move {
        let start = Instant::now();
        let mut last = metrics.snapshot();
        loop {
            tokio::select! {
                _ = notify_task.notified() => {
                    emit_progress_line(command, mode, start.elapsed(), metrics.snapshot(), true);
                    break;
                }
                _ = tokio::time::sleep(tick) => {
                    let snapshot = metrics.snapshot();
                    if snapshot != last {
                        emit_progress_line(command, mode, start.elapsed(), snapshot, false);
                        last = snapshot;
                    }
                }
            }
        }
    });

    Some(ProgressReporter { notify, handle })
}

// ─── JSON ───────────────────────────────────────────────────────────────────

fn drift_policy_label(policy: DriftPolicy) -> &'static str {
    match policy {
        DriftPolicy::Frozen => "frozen",
        DriftPolicy::Apply => "apply",
    }
}

fn offset_json(offset: SyncOffset) -> Value {
    json!({
        "delta_realtime_us": offset.delta_realtime_us,
        "delta_pts": offset.delta_pts,
    })
}

fn report_json(command: &str, report: &CaptureReport, elapsed: Duration) -> Value {
    let (stop_source, stop_error) = match &report.stop_reason {
        StopReason::SourceEnded { role, error } => (Some(role.as_str()), error.clone()),
        StopReason::FrameLimit => (None, None),
    };
    json!({
        "schema_version": JSON_SCHEMA_VERSION,
        "command": command,
        "ok": true,
        "stop_reason": report.stop_reason.as_str(),
        "stop_source": stop_source,
        "stop_error": stop_error,
        "frames": {
            "primary": report.budget.count_primary,
            "secondary": report.budget.count_secondary,
            "limit": report.budget.limit,
        },
        "dropped": {
            "primary": report.primary_dropped,
            "secondary": report.secondary_dropped,
        },
        "iterations": report.iterations,
        "streams": {
            "primary": report.primary_stream,
            "secondary": report.secondary_stream,
        },
        "slots": report.slots.iter().map(|slot| json!({
            "index": slot.index,
            "time_base": slot.time_base.to_string(),
            "frame_rate": slot.frame_rate.to_string(),
        })).collect::<Vec<_>>(),
        "offset": {
            "initial": offset_json(report.initial_offset),
            "applied": offset_json(report.applied_offset),
            "latest": offset_json(report.latest_offset),
            "re_estimations": report.re_estimations,
        },
        "elapsed_ms": elapsed.as_millis() as u64,
    })
}

fn session_json(config: &SessionConfig, format: Option<&str>, dry_run: bool) -> Value {
    json!({
        "schema_version": JSON_SCHEMA_VERSION,
        "command": "capture",
        "ok": true,
        "dry_run": dry_run,
        "primary": config.primary,
        "secondary": config.secondary,
        "output": config.output.display().to_string(),
        "format": format,
        "transport": config.transport.as_option_value(),
        "reorder_queue_size": config.reorder_queue_size,
        "frame_limit": config.frame_limit,
        "drift_policy": drift_policy_label(config.drift_policy),
        "runtime_available": runtime_available(),
    })
}

fn command_error_json(command: &str, err: &EngineError) -> String {
    json!({
        "schema_version": JSON_SCHEMA_VERSION,
        "command": command,
        "ok": false,
        "error": err.to_string(),
        "code": err.error_code(),
    })
    .to_string()
}
