use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

fn unique_temp_dir(label: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let dir = std::env::temp_dir().join(format!(
        "twincap_cli_{label}_{}_{}",
        std::process::id(),
        nanos
    ));
    fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

fn twincap() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_twincap"));
    cmd.env("RUST_LOG", "off").env("TWINCAP_PROGRESS_TICK_MS", "10");
    cmd
}

fn nonempty_lines(s: &str) -> Vec<&str> {
    s.lines().filter(|line| !line.trim().is_empty()).collect()
}

fn single_stdout_json(output: &Output, command: &str, ok: bool) -> serde_json::Value {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let lines = nonempty_lines(&stdout);
    assert_eq!(
        lines.len(),
        1,
        "stdout must contain exactly one non-empty line, got {}:\n{}",
        lines.len(),
        stdout
    );
    let value: serde_json::Value = serde_json::from_str(lines[0])
        .unwrap_or_else(|e| panic!("stdout is not JSON: {e}\n{stdout}"));
    assert_eq!(
        value.get("schema_version").and_then(|v| v.as_u64()),
        Some(1),
        "missing schema_version=1 field"
    );
    assert_eq!(value.get("command").and_then(|v| v.as_str()), Some(command));
    assert_eq!(value.get("ok").and_then(|v| v.as_bool()), Some(ok));
    value
}

#[test]
fn help_lists_subcommands() {
    let output = twincap().arg("help").output().expect("run twincap help");

    assert!(
        output.status.success(),
        "twincap help failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("capture"), "missing capture in help output");
    assert!(stdout.contains("simulate"), "missing simulate in help output");
    assert!(stdout.contains("offset"), "missing offset in help output");
}

#[test]
fn capture_help_lists_session_flags() {
    let output = twincap()
        .args(["capture", "--help"])
        .output()
        .expect("run twincap capture --help");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for flag in [
        "--primary",
        "--secondary",
        "--config",
        "--transport",
        "--frame-limit",
        "--apply-drift",
        "--dry-run",
        "--progress",
    ] {
        assert!(stdout.contains(flag), "missing {flag} in capture help");
    }
}

#[test]
fn simulate_json_reports_exact_counts() {
    let output = twincap()
        .args([
            "simulate",
            "--primary-frames",
            "3",
            "--secondary-frames",
            "10",
            "--offset-us",
            "2000000",
            "--json",
            "--progress",
            "off",
        ])
        .output()
        .expect("run twincap simulate");

    assert!(
        output.status.success(),
        "simulate failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let value = single_stdout_json(&output, "simulate", true);
    assert_eq!(value["frames"]["primary"], 3);
    assert_eq!(value["frames"]["secondary"], 3);
    assert_eq!(value["stop_reason"], "end_of_stream");
    assert_eq!(value["stop_source"], "primary");
    assert_eq!(value["offset"]["applied"]["delta_pts"], 180_000);
}

#[test]
fn simulate_frame_limit_stops_endless_sources() {
    let output = twincap()
        .args([
            "simulate",
            "--endless",
            "--frame-limit",
            "5",
            "--json",
            "--progress",
            "off",
        ])
        .output()
        .expect("run twincap simulate");

    assert!(output.status.success());
    let value = single_stdout_json(&output, "simulate", true);
    assert_eq!(value["stop_reason"], "frame_limit");
    assert_eq!(value["frames"]["primary"], 5);
    assert_eq!(value["frames"]["secondary"], 5);
}

#[test]
fn simulate_apply_drift_changes_applied_offset() {
    let output = twincap()
        .args([
            "simulate",
            "--primary-frames",
            "20",
            "--secondary-frames",
            "20",
            "--offset-us",
            "1000000",
            "--refresh-every",
            "5",
            "--drift-us",
            "1000",
            "--apply-drift",
            "--json",
            "--progress",
            "off",
        ])
        .output()
        .expect("run twincap simulate");

    assert!(output.status.success());
    let value = single_stdout_json(&output, "simulate", true);
    assert_eq!(value["offset"]["initial"]["delta_pts"], 90_000);
    // Refreshes after frames 5, 10 and 15 add 1 ms (90 ticks) each.
    assert_eq!(value["offset"]["applied"]["delta_pts"], 90_270);
    assert_eq!(value["offset"]["re_estimations"], 4);
}

#[test]
fn simulate_rejects_oversized_scripted_runs() {
    let output = twincap()
        .args([
            "simulate",
            "--primary-frames",
            "100000000",
            "--json",
            "--progress",
            "off",
        ])
        .output()
        .expect("run twincap simulate");

    assert!(!output.status.success());
    let value = single_stdout_json(&output, "simulate", false);
    assert_eq!(value["code"], 100);
    assert!(
        value["error"].as_str().is_some_and(|e| e.contains("endless")),
        "error should point at endless sources: {value}"
    );
}

#[test]
fn simulate_jsonl_progress_stays_on_stderr() {
    let output = twincap()
        .args([
            "simulate",
            "--endless",
            "--frame-limit",
            "200",
            "--json",
            "--progress",
            "jsonl",
        ])
        .output()
        .expect("run twincap simulate");

    assert!(output.status.success());
    single_stdout_json(&output, "simulate", true);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let lines = nonempty_lines(&stderr);
    assert!(!lines.is_empty(), "stderr must carry progress records");
    for line in &lines {
        let value: serde_json::Value = serde_json::from_str(line)
            .unwrap_or_else(|e| panic!("stderr line is not JSONL progress: {e}\nline={line}"));
        assert_eq!(value["type"], "progress");
        assert_eq!(value["command"], "simulate");
    }
    let last: serde_json::Value = serde_json::from_str(lines[lines.len() - 1]).expect("json");
    assert_eq!(last["final"], true);
    assert_eq!(last["frames"]["primary"], 200);
}

#[test]
fn offset_json_reports_delta_pts() {
    let output = twincap()
        .args([
            "offset",
            "--primary-anchor-us",
            "1000000",
            "--secondary-anchor-us",
            "3000000",
            "--json",
        ])
        .output()
        .expect("run twincap offset");

    assert!(output.status.success());
    let value = single_stdout_json(&output, "offset", true);
    assert_eq!(value["delta_realtime_us"], 2_000_000);
    assert_eq!(value["delta_pts"], 180_000);
}

#[test]
fn offset_accepts_negative_lag_and_custom_time_base() {
    let output = twincap()
        .args([
            "offset",
            "--primary-anchor-us",
            "5000000",
            "--secondary-anchor-us",
            "4000000",
            "--time-base",
            "1/1000",
        ])
        .output()
        .expect("run twincap offset");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("delta_realtime_us=-1000000"), "{stdout}");
    assert!(stdout.contains("delta_pts=-1000"), "{stdout}");
}

#[test]
fn capture_dry_run_resolves_container_format() {
    let dir = unique_temp_dir("dry_run");
    let output_path = dir.join("session.mp4");
    let output = twincap()
        .args([
            "capture",
            "--primary",
            "rtsp://cam-a/stream",
            "--secondary",
            "rtsp://cam-b/stream",
            "-o",
            output_path.to_str().expect("utf8 path"),
            "--dry-run",
            "--json",
        ])
        .output()
        .expect("run twincap capture --dry-run");

    assert!(output.status.success());
    let value = single_stdout_json(&output, "capture", true);
    assert_eq!(value["format"], "mp4");
    assert_eq!(value["transport"], "tcp");
    assert_eq!(value["frame_limit"], 5000);
    assert_eq!(value["drift_policy"], "frozen");
    assert!(!output_path.exists(), "dry run must not create output");
}

#[test]
fn capture_config_file_is_overridden_by_flags() {
    let dir = unique_temp_dir("config");
    let config_path = dir.join("session.json");
    fs::write(
        &config_path,
        r#"{"primary":"rtsp://cam-a/stream","secondary":"rtsp://cam-b/stream","frame_limit":10,"transport":"udp"}"#,
    )
    .expect("write config");

    let output = twincap()
        .args([
            "capture",
            "--config",
            config_path.to_str().expect("utf8 path"),
            "--frame-limit",
            "42",
            "--dry-run",
            "--json",
        ])
        .output()
        .expect("run twincap capture --config");

    assert!(output.status.success());
    let value = single_stdout_json(&output, "capture", true);
    assert_eq!(value["frame_limit"], 42);
    assert_eq!(value["transport"], "udp");
    assert_eq!(value["format"], "matroska");
}

#[test]
fn capture_with_invalid_config_exits_nonzero() {
    let dir = unique_temp_dir("bad_config");
    let config_path = dir.join("session.json");
    fs::write(&config_path, r#"{"primary":"rtsp://a","frame_limit":0}"#).expect("write config");

    let output = twincap()
        .args([
            "capture",
            "--config",
            config_path.to_str().expect("utf8 path"),
            "--json",
        ])
        .output()
        .expect("run twincap capture");

    assert!(!output.status.success());
    let value = single_stdout_json(&output, "capture", false);
    assert_eq!(value["code"], 100);
}

#[test]
fn capture_with_unknown_config_field_exits_nonzero() {
    let dir = unique_temp_dir("unknown_field");
    let config_path = dir.join("session.json");
    fs::write(&config_path, r#"{"primary":"a","secondary":"b","fps":30}"#).expect("write config");

    let output = twincap()
        .args(["capture", "--config", config_path.to_str().expect("utf8 path")])
        .output()
        .expect("run twincap capture");

    assert!(!output.status.success());
}

#[cfg(not(feature = "ffmpeg-runtime"))]
#[test]
fn capture_without_ffmpeg_runtime_exits_nonzero() {
    let dir = unique_temp_dir("no_runtime");
    let output_path = dir.join("out.mkv");
    let output = twincap()
        .args([
            "capture",
            "--primary",
            "rtsp://127.0.0.1:1/a",
            "--secondary",
            "rtsp://127.0.0.1:1/b",
            "-o",
            output_path.to_str().expect("utf8 path"),
            "--json",
            "--progress",
            "off",
        ])
        .output()
        .expect("run twincap capture");

    assert!(!output.status.success());
    let value = single_stdout_json(&output, "capture", false);
    assert_eq!(value["code"], 300);
    assert!(
        value["error"]
            .as_str()
            .is_some_and(|e| e.contains("primary")),
        "error should name the failing source: {value}"
    );
}
