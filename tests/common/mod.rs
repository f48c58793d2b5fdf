#![allow(dead_code)]

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::{Value, json};

use remedy_engine::core::config::Config;
use remedy_engine::daemon::runner::Runner;

pub struct CmdResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub log_path: PathBuf,
}

/// Temp directory holding every file a cycle touches.
pub struct Fixture {
    pub dir: tempfile::TempDir,
    pub config: Config,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("create fixture dir");
        let root = dir.path();
        let mut config = Config::default();
        config.paths.config_file = root.join("config.toml");
        config.paths.incidents_log = root.join("incidents.jsonl");
        config.paths.metrics_log = root.join("metrics.jsonl");
        config.paths.heartbeat_log = root.join("heartbeat.jsonl");
        config.paths.state_file = root.join("policy-state.json");
        config.paths.alerts_file = root.join("alert-ledger.json");
        config.paths.lock_file = root.join("remedy.lock");
        config.paths.activity_log = root.join("activity.jsonl");
        Self { dir, config }
    }

    pub fn runner(&self) -> Runner {
        Runner::new(self.config.clone())
    }

    /// Append raw JSON lines to the incident log.
    pub fn append(&self, lines: &[Value]) {
        append_lines(&self.config.paths.incidents_log, lines);
    }

    pub fn append_raw(&self, line: &str) {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.config.paths.incidents_log)
            .expect("open incident log");
        writeln!(file, "{line}").expect("append raw line");
    }

    pub fn incident_lines(&self) -> Vec<Value> {
        read_lines(&self.config.paths.incidents_log)
    }

    pub fn metrics_lines(&self) -> Vec<Value> {
        read_lines(&self.config.paths.metrics_log)
    }

    pub fn heartbeat_lines(&self) -> Vec<Value> {
        read_lines(&self.config.paths.heartbeat_log)
    }

    pub fn state_json(&self) -> Value {
        let raw = fs::read_to_string(&self.config.paths.state_file).expect("read state");
        serde_json::from_str(&raw).expect("parse state")
    }

    /// Write a TOML config pointing every path into the fixture dir.
    pub fn write_config_file(&self, extra: &str) -> PathBuf {
        let p = &self.config.paths;
        let body = format!(
            r#"{extra}

[paths]
incidents_log = "{}"
metrics_log = "{}"
heartbeat_log = "{}"
state_file = "{}"
alerts_file = "{}"
lock_file = "{}"
activity_log = "{}"
"#,
            p.incidents_log.display(),
            p.metrics_log.display(),
            p.heartbeat_log.display(),
            p.state_file.display(),
            p.alerts_file.display(),
            p.lock_file.display(),
            p.activity_log.display(),
        );
        fs::write(&p.config_file, body).expect("write config file");
        p.config_file.clone()
    }
}

pub fn base_time() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-05-01T10:00:00Z")
        .expect("valid base time")
        .with_timezone(&Utc)
}

pub fn at_min(minutes: i64) -> DateTime<Utc> {
    base_time() + TimeDelta::minutes(minutes)
}

/// A critical incident from an external producer, without an id.
pub fn critical(kind: &str, job: &str, ts: DateTime<Utc>) -> Value {
    json!({
        "type": kind,
        "severity": "critical",
        "source": "watchdog",
        "jobId": job,
        "ts": ts.to_rfc3339(),
        "msg": format!("{kind} on {job}"),
    })
}

/// A failure report for `key`, as a remediation wrapper would append it.
pub fn failure_report(key: &str, ts: DateTime<Utc>) -> Value {
    json!({
        "type": "remediation_failed",
        "severity": "critical",
        "source": "wrapper",
        "ts": ts.to_rfc3339(),
        "detail": { "incident_key": key },
    })
}

pub fn append_lines(path: &Path, lines: &[Value]) {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .expect("open log for append");
    for line in lines {
        writeln!(file, "{line}").expect("append line");
    }
}

pub fn read_lines(path: &Path) -> Vec<Value> {
    match fs::read_to_string(path) {
        Ok(raw) => raw
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).expect("valid JSON line"))
            .collect(),
        Err(_) => Vec::new(),
    }
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis())
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn resolve_bin_path() -> PathBuf {
    if let Some(path) = option_env!("CARGO_BIN_EXE_remedy") {
        return PathBuf::from(path);
    }

    let exe_name = if cfg!(windows) { "remedy.exe" } else { "remedy" };
    let fallback = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(PathBuf::from))
        .and_then(|deps| deps.parent().map(PathBuf::from))
        .map(|debug_dir| debug_dir.join(exe_name));

    match fallback {
        Some(path) if path.exists() => path,
        _ => panic!("unable to resolve remedy binary path for integration test"),
    }
}

pub fn run_cli_case(case_name: &str, args: &[&str]) -> CmdResult {
    let root = std::env::temp_dir().join("remedy-test-logs");
    fs::create_dir_all(&root).expect("create temp test log dir");

    let log_path = root.join(format!("{}-{}.log", sanitize(case_name), now_millis()));
    let bin_path = resolve_bin_path();

    let output = Command::new(&bin_path)
        .args(args)
        .env("RUST_BACKTRACE", "1")
        .env_remove("REMEDY_OUTPUT_FORMAT")
        .env_remove("REMEDY_SAFE_AUTO_ENABLED")
        .output()
        .expect("execute remedy command");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    let mut log_content = String::new();
    log_content.push_str(&format!("case={case_name}\n"));
    log_content.push_str(&format!("bin={}\n", bin_path.display()));
    log_content.push_str(&format!("args={args:?}\n"));
    log_content.push_str(&format!("status={}\n", output.status));
    log_content.push_str("----- stdout -----\n");
    log_content.push_str(&stdout);
    log_content.push('\n');
    log_content.push_str("----- stderr -----\n");
    log_content.push_str(&stderr);
    log_content.push('\n');
    fs::write(&log_path, log_content).expect("write test log");

    CmdResult {
        status: output.status,
        stdout,
        stderr,
        log_path,
    }
}
