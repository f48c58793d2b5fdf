//! Top-level CLI definition and dispatch.

use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;

use chrono::Utc;
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::{Shell as CompletionShell, generate};
use colored::{Colorize, control};
use serde_json::{Value, json};
use thiserror::Error;

use remedy_engine::core::clock::format_utc;
use remedy_engine::core::config::Config;
use remedy_engine::core::errors::RemedyError;
use remedy_engine::daemon::cutover::{CutoverDecision, evaluate_cutover};
use remedy_engine::daemon::runner::{CycleReport, CycleStatus, Mode, Runner};
use remedy_engine::incident::record::IncidentKey;
use remedy_engine::policy::state::PolicyStateStore;

/// Remedy: incident remediation policy engine.
#[derive(Debug, Parser)]
#[command(
    name = "remedy",
    author,
    version,
    about = "Incident remediation policy engine - guarded restarts, retry budgets, circuit breaking",
    long_about = None,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Override config file path.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Force JSON output mode.
    #[arg(long, global = true)]
    json: bool,
    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Run one plan-only cycle: evaluate and persist, never execute.
    Plan,
    /// Run one real-mode cycle, gated by `rollout.safe_auto_enabled`.
    Real,
    /// Recommend whether safe-auto execution can be switched on.
    EvaluateCutover,
    /// Inspect or poke the persisted policy state.
    State(StateArgs),
    /// View and validate configuration.
    Config(ConfigArgs),
    /// Generate shell completions.
    Completions(CompletionsArgs),
}

#[derive(Debug, Clone, Args)]
struct StateArgs {
    #[command(subcommand)]
    command: StateCommand,
}

#[derive(Debug, Clone, Subcommand)]
enum StateCommand {
    /// Print the policy state document.
    Show,
    /// Record a failed remediation for an incident key.
    RecordFailure(RecordFailureArgs),
}

#[derive(Debug, Clone, Args)]
struct RecordFailureArgs {
    /// Incident key the failed action was taken for.
    #[arg(long, value_name = "KEY")]
    key: String,
}

#[derive(Debug, Clone, Args)]
struct ConfigArgs {
    #[command(subcommand)]
    command: Option<ConfigCommand>,
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum ConfigCommand {
    /// Print the config file path in use.
    Path,
    /// Print the effective configuration.
    Show,
    /// Validate the configuration and print its hash.
    Validate,
}

#[derive(Debug, Clone, Args)]
struct CompletionsArgs {
    /// Shell to generate completions for.
    #[arg(value_enum)]
    shell: CompletionShell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Human,
    Json,
}

/// CLI error type with explicit exit-code mapping.
#[derive(Debug, Error)]
pub enum CliError {
    /// Invalid user input or configuration.
    #[error("{0}")]
    User(String),
    /// Environment/runtime failure: I/O, lock, corrupt state.
    #[error("{0}")]
    Runtime(String),
    /// Internal bug or invariant violation.
    #[error("{0}")]
    Internal(String),
    /// JSON serialization failed.
    #[error("failed to serialize output: {0}")]
    Json(#[from] serde_json::Error),
    /// Output write failed.
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
}

impl CliError {
    /// Process exit code contract for the CLI.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::User(_) => 1,
            Self::Runtime(_) | Self::Io(_) => 2,
            Self::Internal(_) | Self::Json(_) => 3,
        }
    }
}

impl From<RemedyError> for CliError {
    fn from(err: RemedyError) -> Self {
        match err {
            RemedyError::InvalidConfig { .. }
            | RemedyError::MissingConfig { .. }
            | RemedyError::ConfigParse { .. } => Self::User(err.to_string()),
            RemedyError::Serialization { .. } => Self::Internal(err.to_string()),
            _ => Self::Runtime(err.to_string()),
        }
    }
}

/// Dispatch CLI commands.
pub fn run(cli: &Cli) -> Result<(), CliError> {
    if cli.no_color {
        control::set_override(false);
    }

    match &cli.command {
        Command::Plan => run_cycle(cli, Mode::Plan),
        Command::Real => run_cycle(cli, Mode::Real),
        Command::EvaluateCutover => run_evaluate_cutover(cli),
        Command::State(args) => run_state(cli, args),
        Command::Config(args) => run_config(cli, args),
        Command::Completions(args) => {
            let mut command = Cli::command();
            let binary_name = command.get_name().to_string();
            generate(args.shell, &mut command, binary_name, &mut io::stdout());
            Ok(())
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config, CliError> {
    Ok(Config::load(cli.config.as_deref())?)
}

// ---------------------------------------------------------------------------
// Cycles
// ---------------------------------------------------------------------------

fn run_cycle(cli: &Cli, mode: Mode) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let mut runner = Runner::new(config);
    let report = runner.run(mode)?;

    match output_mode(cli) {
        OutputMode::Json => write_json_line(&cycle_summary(&report))?,
        OutputMode::Human => print_cycle_human(&report),
    }
    Ok(())
}

fn cycle_summary(report: &CycleReport) -> Value {
    let denied: Vec<Value> = report
        .evaluations
        .iter()
        .flat_map(|e| {
            e.plans.iter().filter(|p| !p.allowed).map(move |p| {
                json!({
                    "incident_key": e.key.as_ref().map(IncidentKey::as_str),
                    "action": p.kind.as_str(),
                    "reason": p.reason.map(|r| r.as_str()),
                    "retry_after": p.retry_after,
                })
            })
        })
        .collect();
    json!({
        "command": report.mode.as_str(),
        "status": report.status,
        "run_id": report.run_id,
        "lock_holder": report.lock_holder,
        "ingest": report.ingest,
        "evaluated": report.evaluations.len(),
        "allowed": report.allowed_count(),
        "denied": denied,
        "appended": report.appended.iter().map(|r| r.kind.as_str()).collect::<Vec<_>>(),
        "executions": report.executions,
        "fallback_action": report.fallback_action,
        "state_error": report.state_error,
        "heartbeat": report.heartbeat,
        "marker": report.marker,
        "metrics": report.metrics,
    })
}

fn print_cycle_human(report: &CycleReport) {
    if report.status == CycleStatus::Skipped {
        let holder = report.lock_holder.as_ref().map_or_else(
            || "an unreadable lock".to_string(),
            |h| format!("pid {} (run {})", h.pid, h.run_id),
        );
        println!(
            "{} {} cycle skipped: lock held by {holder}",
            "SKIP".yellow().bold(),
            report.mode
        );
        return;
    }

    let ingest = &report.ingest;
    println!(
        "{} {} cycle {}",
        "DONE".green().bold(),
        report.mode,
        report.run_id.as_deref().unwrap_or("-")
    );
    println!(
        "  Ingested: {} records, {} malformed, {} active, {} dedup-suppressed, {} failures applied",
        ingest.records, ingest.malformed, ingest.active, ingest.dedup_suppressed, ingest.failures_applied
    );
    println!(
        "  Decisions: {} evaluated, {} allowed",
        report.evaluations.len(),
        report.allowed_count()
    );
    for eval in &report.evaluations {
        let key = eval.key.as_ref().map_or("<invalid>", IncidentKey::as_str);
        for plan in &eval.plans {
            let verdict = if plan.allowed {
                "allow".green()
            } else {
                "deny".red()
            };
            let reason = plan.reason.map_or(String::new(), |r| format!(" ({r})"));
            println!("    {key} {} {verdict}{reason}", plan.kind);
        }
        if eval.plans.is_empty() {
            println!("    {key} {} ({})", "invalid input".red(), eval.incident_type);
        }
    }
    for exec in &report.executions {
        let outcome = exec
            .outcome
            .as_ref()
            .and_then(|o| serde_json::to_value(o).ok())
            .and_then(|v| v.get("status").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_else(|| "deferred".to_string());
        println!("  Executed: {} {} -> {outcome}", exec.incident_key, exec.action);
    }
    if !report.appended.is_empty() {
        let kinds: Vec<&str> = report.appended.iter().map(|r| r.kind.as_str()).collect();
        println!("  Appended: {}", kinds.join(", "));
    }
    if let Some(err) = &report.state_error {
        println!(
            "  {} state write failed, all actions denied: {err}",
            "WARN".red().bold()
        );
    }
    if report.heartbeat {
        println!("  Heartbeat written (no active incidents).");
    }
    if report.marker {
        println!("  Detection marker appended (safe-auto disabled).");
    }
}

// ---------------------------------------------------------------------------
// Cutover
// ---------------------------------------------------------------------------

fn run_evaluate_cutover(cli: &Cli) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let decision = evaluate_cutover(&config.paths.metrics_log, &config.rollout, Utc::now())?;

    match output_mode(cli) {
        OutputMode::Json => write_json_line(&serde_json::to_value(&decision)?)?,
        OutputMode::Human => print_cutover_human(&decision),
    }
    Ok(())
}

fn print_cutover_human(decision: &CutoverDecision) {
    let verdict = if decision.ok_to_enable_safe_auto {
        "OK to enable safe-auto".green().bold()
    } else {
        "NOT ready for safe-auto".yellow().bold()
    };
    println!("{verdict} (window {}s ending {})", decision.window_s, format_utc(decision.ts));
    let agg = &decision.agg;
    println!(
        "  Runs: {}  planned safe-auto: {}  planned risky: {}  executed: {}",
        agg.runs, agg.planned_safe_auto, agg.planned_risky, agg.executed
    );
    println!(
        "  state_write_failed: {}  restart_loop_blocked: {}  circuit_breaker_triggered: {}",
        agg.state_write_failed, agg.restart_loop_blocked, agg.circuit_breaker_triggered
    );
    for reason in &decision.reasons {
        println!("  - {reason}");
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

fn run_state(cli: &Cli, args: &StateArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    match &args.command {
        StateCommand::Show => {
            let store = PolicyStateStore::load(&config.paths.state_file)?;
            match output_mode(cli) {
                OutputMode::Json => write_json_line(&serde_json::to_value(&store)?)?,
                OutputMode::Human => {
                    println!("State: {}", config.paths.state_file.display());
                    println!(
                        "  Updated: {}",
                        store.updated_at.map_or_else(|| "never".to_string(), format_utc)
                    );
                    if store.is_empty() {
                        println!("  (no tracked incidents)");
                    }
                    for (key, state) in &store.incidents {
                        println!(
                            "  {key}: attempts={} failures={} restarts={} window_start={}",
                            state.attempts,
                            state.fail_events.len(),
                            state.restart_events.len(),
                            format_utc(state.window_start)
                        );
                    }
                }
            }
            Ok(())
        }
        StateCommand::RecordFailure(args) => {
            let key = args.key.trim();
            if key.is_empty() {
                return Err(CliError::User("--key must not be empty".to_string()));
            }
            let key = IncidentKey::from_raw(key);
            let mut runner = Runner::new(config);
            let recorded = runner.record_failure(&key, Utc::now())?;
            match output_mode(cli) {
                OutputMode::Json => write_json_line(&json!({
                    "command": "state record-failure",
                    "incident_key": key.as_str(),
                    "recorded": recorded,
                }))?,
                OutputMode::Human => {
                    if recorded {
                        println!("Recorded failure for {key}.");
                    } else {
                        println!("Failure for {key} already recorded; nothing changed.");
                    }
                }
            }
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

fn run_config(cli: &Cli, args: &ConfigArgs) -> Result<(), CliError> {
    match args.command {
        None | Some(ConfigCommand::Path) => {
            let path = cli.config.clone().unwrap_or_else(Config::default_path);
            let exists = path.exists();

            match output_mode(cli) {
                OutputMode::Human => {
                    println!("{}", path.display());
                    if !exists {
                        println!("  (file does not exist; defaults will be used)");
                    }
                }
                OutputMode::Json => {
                    let payload = json!({
                        "command": "config path",
                        "path": path.to_string_lossy(),
                        "exists": exists,
                    });
                    write_json_line(&payload)?;
                }
            }
            Ok(())
        }
        Some(ConfigCommand::Show) => {
            let config = load_config(cli)?;

            match output_mode(cli) {
                OutputMode::Human => {
                    let toml_str = toml::to_string_pretty(&config)
                        .map_err(|e| CliError::Internal(format!("serialize config: {e}")))?;
                    println!("{toml_str}");
                }
                OutputMode::Json => {
                    let payload = json!({
                        "command": "config show",
                        "config": serde_json::to_value(&config)?,
                    });
                    write_json_line(&payload)?;
                }
            }
            Ok(())
        }
        Some(ConfigCommand::Validate) => match Config::load(cli.config.as_deref()) {
            Ok(config) => {
                let hash = config.stable_hash()?;

                match output_mode(cli) {
                    OutputMode::Human => {
                        println!("Configuration is valid.");
                        println!("  Source: {}", config.paths.config_file.display());
                        println!("  Hash: {hash}");
                    }
                    OutputMode::Json => {
                        let payload = json!({
                            "command": "config validate",
                            "valid": true,
                            "path": config.paths.config_file.to_string_lossy(),
                            "hash": hash,
                        });
                        write_json_line(&payload)?;
                    }
                }
                Ok(())
            }
            Err(e) => {
                match output_mode(cli) {
                    OutputMode::Human => {
                        eprintln!("Configuration is INVALID: {e}");
                    }
                    OutputMode::Json => {
                        let payload = json!({
                            "command": "config validate",
                            "valid": false,
                            "error": e.to_string(),
                            "code": e.code(),
                        });
                        write_json_line(&payload)?;
                    }
                }
                Err(CliError::User(format!("invalid config: {e}")))
            }
        },
    }
}

// ---------------------------------------------------------------------------
// Output helpers
// ---------------------------------------------------------------------------

fn write_json_line(payload: &Value) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, payload)?;
    writeln!(stdout)?;
    Ok(())
}

fn output_mode(cli: &Cli) -> OutputMode {
    let env_mode = std::env::var("REMEDY_OUTPUT_FORMAT").ok();
    resolve_output_mode(cli.json, env_mode.as_deref(), io::stdout().is_terminal())
}

fn resolve_output_mode(json_flag: bool, env_mode: Option<&str>, stdout_is_tty: bool) -> OutputMode {
    if json_flag {
        return OutputMode::Json;
    }

    let fallback = if stdout_is_tty {
        OutputMode::Human
    } else {
        OutputMode::Json
    };

    match env_mode
        .map(str::trim)
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("json") => OutputMode::Json,
        Some("human") => OutputMode::Human,
        _ => fallback,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_command_shape() {
        let cases = vec![
            vec!["remedy", "plan"],
            vec!["remedy", "real", "--json"],
            vec!["remedy", "evaluate-cutover"],
            vec!["remedy", "state", "show"],
            vec!["remedy", "state", "record-failure", "--key", "gw1"],
            vec!["remedy", "config"],
            vec!["remedy", "config", "path"],
            vec!["remedy", "--config", "/tmp/remedy.toml", "config", "validate"],
            vec!["remedy", "--no-color", "config", "show"],
        ];

        for case in cases {
            let parsed = Cli::try_parse_from(case.clone());
            assert!(parsed.is_ok(), "failed to parse case: {case:?}");
        }
    }

    #[test]
    fn record_failure_requires_key() {
        assert!(Cli::try_parse_from(["remedy", "state", "record-failure"]).is_err());
        assert!(Cli::try_parse_from(["remedy", "state"]).is_err());
    }

    #[test]
    fn completions_support_bash_zsh_and_fish() {
        for shell in ["bash", "zsh", "fish"] {
            let parsed = Cli::try_parse_from(["remedy", "completions", shell]);
            assert!(parsed.is_ok(), "failed shell parse for {shell}");
        }
    }

    #[test]
    fn output_mode_resolution_honors_precedence() {
        assert_eq!(
            resolve_output_mode(true, Some("human"), true),
            OutputMode::Json
        );
        assert_eq!(
            resolve_output_mode(false, Some("json"), true),
            OutputMode::Json
        );
        assert_eq!(
            resolve_output_mode(false, Some("human"), false),
            OutputMode::Human
        );
        assert_eq!(
            resolve_output_mode(false, Some("auto"), true),
            OutputMode::Human
        );
        assert_eq!(resolve_output_mode(false, None, false), OutputMode::Json);
    }

    #[test]
    fn exit_codes_follow_contract() {
        let user: CliError = RemedyError::InvalidConfig {
            details: "x".to_string(),
        }
        .into();
        assert_eq!(user.exit_code(), 1);

        let runtime: CliError = RemedyError::StateLoadFailure {
            path: PathBuf::from("/tmp/state.json"),
            details: "corrupt".to_string(),
        }
        .into();
        assert_eq!(runtime.exit_code(), 2);

        let lock: CliError = RemedyError::LockIo {
            path: PathBuf::from("/tmp/remedy.lock"),
            details: "busy".to_string(),
        }
        .into();
        assert_eq!(lock.exit_code(), 2);

        let internal: CliError = RemedyError::Serialization {
            context: "json",
            details: "bad".to_string(),
        }
        .into();
        assert_eq!(internal.exit_code(), 3);
    }
}
