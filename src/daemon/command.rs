//! Timed external commands: the pre-action status probe and the remediation
//! executor used once automatic execution is enabled.
//!
//! Every child runs under an explicit deadline. Output pipes are drained on
//! helper threads that report back over a channel. Bytes past the capture
//! limit are read and discarded, so a chatty child never blocks on a full
//! pipe or dies of a closed one. A child past its deadline is killed and
//! reaped rather than waited on.

use std::collections::BTreeMap;
use std::io::{self, Read};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, bounded};
use serde::Serialize;

use crate::core::config::{Config, ProbeConfig};
use crate::core::errors::{RemedyError, Result};
use crate::incident::record::IncidentKey;
use crate::policy::classifier::ActionKind;

/// Captured output is truncated to this many bytes per stream.
const MAX_CAPTURE_BYTES: u64 = 64 * 1024;
const POLL_INTERVAL: Duration = Duration::from_millis(20);
/// How long to wait for pipes to drain after the child exited.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

// ──────────────────── timed command ────────────────────

/// Program, argv and deadline for one external call.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
}

impl CommandSpec {
    #[must_use]
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            env: Vec::new(),
            timeout,
        }
    }
}

/// How a timed command ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CommandOutcome {
    Exited {
        code: Option<i32>,
        success: bool,
        stdout: String,
        stderr: String,
        duration_ms: u64,
    },
    TimedOut {
        duration_ms: u64,
    },
}

/// Run `spec` to completion or until its deadline, whichever comes first.
///
/// Spawn failures are errors; non-zero exits and timeouts are outcomes.
pub fn run_with_timeout(spec: &CommandSpec) -> Result<CommandOutcome> {
    let started = Instant::now();
    let mut child = Command::new(&spec.program)
        .args(&spec.args)
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| RemedyError::CommandSpawn {
            program: spec.program.clone(),
            details: e.to_string(),
        })?;

    let stdout_rx = drain(child.stdout.take());
    let stderr_rx = drain(child.stderr.take());
    // `None` only for durations past what `Instant` can represent.
    let deadline = started.checked_add(spec.timeout);

    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {}
            Err(e) => {
                kill_and_reap(&mut child);
                return Err(RemedyError::Runtime {
                    details: format!("waiting on {}: {e}", spec.program),
                });
            }
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            kill_and_reap(&mut child);
            return Ok(CommandOutcome::TimedOut {
                duration_ms: elapsed_ms(started),
            });
        }
        thread::sleep(POLL_INTERVAL);
    };

    Ok(CommandOutcome::Exited {
        code: status.code(),
        success: status.success(),
        stdout: stdout_rx.recv_timeout(DRAIN_GRACE).unwrap_or_default(),
        stderr: stderr_rx.recv_timeout(DRAIN_GRACE).unwrap_or_default(),
        duration_ms: elapsed_ms(started),
    })
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Receiver<String> {
    let (tx, rx) = bounded(1);
    if let Some(pipe) = pipe {
        thread::spawn(move || {
            let mut pipe = pipe;
            let mut buf = Vec::new();
            let _ = (&mut pipe).take(MAX_CAPTURE_BYTES).read_to_end(&mut buf);
            // Keep the read end open until EOF.
            let _ = io::copy(&mut pipe, &mut io::sink());
            let _ = tx.send(String::from_utf8_lossy(&buf).into_owned());
        });
    }
    rx
}

fn kill_and_reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

// ──────────────────── probe ────────────────────

/// Answer from the pre-action status probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStatus {
    /// No probe configured.
    Skipped,
    Healthy,
    /// The probe answered but reported a problem; the action still runs.
    Unhealthy,
    /// No answer in time; the dependent action is deferred.
    TimedOut,
}

/// Run the configured status probe.
pub fn run_probe(probe: &ProbeConfig) -> Result<ProbeStatus> {
    let spec = CommandSpec::new(
        probe.program.clone(),
        probe.args.clone(),
        Duration::from_millis(probe.timeout_ms),
    );
    Ok(match run_with_timeout(&spec)? {
        CommandOutcome::Exited { success: true, .. } => ProbeStatus::Healthy,
        CommandOutcome::Exited { .. } => ProbeStatus::Unhealthy,
        CommandOutcome::TimedOut { .. } => ProbeStatus::TimedOut,
    })
}

// ──────────────────── executor ────────────────────

/// How one remediation attempt ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Succeeded { duration_ms: u64 },
    Failed { details: String },
    TimedOut { duration_ms: u64 },
    /// No command is configured for the action kind.
    NotConfigured,
}

impl ExecutionOutcome {
    /// Whether the attempt must be reported to the failure path.
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. } | Self::TimedOut { .. })
    }
}

/// Side-effecting seam between the runner and the host.
pub trait RemediationExecutor {
    /// Status probe run before each action.
    fn probe(&mut self) -> Result<ProbeStatus>;

    /// Carry out `kind` for `key`.
    fn execute(&mut self, kind: &ActionKind, key: &IncidentKey) -> Result<ExecutionOutcome>;
}

/// Runs the argv configured under `[actions.commands]`.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    commands: BTreeMap<String, Vec<String>>,
    timeout: Duration,
    probe: Option<ProbeConfig>,
}

impl CommandExecutor {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            commands: config.actions.commands.clone(),
            timeout: Duration::from_millis(config.actions.timeout_ms),
            probe: config.probe.clone(),
        }
    }
}

impl RemediationExecutor for CommandExecutor {
    fn probe(&mut self) -> Result<ProbeStatus> {
        self.probe.as_ref().map_or(Ok(ProbeStatus::Skipped), run_probe)
    }

    fn execute(&mut self, kind: &ActionKind, key: &IncidentKey) -> Result<ExecutionOutcome> {
        let Some((program, args)) = self
            .commands
            .get(kind.as_str())
            .and_then(|argv| argv.split_first())
        else {
            return Ok(ExecutionOutcome::NotConfigured);
        };
        let mut spec = CommandSpec::new(program.clone(), args.to_vec(), self.timeout);
        spec.env.push(("REMEDY_INCIDENT_KEY".to_string(), key.to_string()));
        spec.env.push(("REMEDY_ACTION".to_string(), kind.to_string()));

        Ok(match run_with_timeout(&spec) {
            Ok(CommandOutcome::Exited {
                success: true,
                duration_ms,
                ..
            }) => ExecutionOutcome::Succeeded { duration_ms },
            Ok(CommandOutcome::Exited { code, stderr, .. }) => ExecutionOutcome::Failed {
                details: format!(
                    "exit {}: {}",
                    code.map_or_else(|| "signal".to_string(), |c| c.to_string()),
                    stderr.trim()
                ),
            },
            Ok(CommandOutcome::TimedOut { duration_ms }) => {
                ExecutionOutcome::TimedOut { duration_ms }
            }
            Err(e) => ExecutionOutcome::Failed {
                details: e.to_string(),
            },
        })
    }
}
