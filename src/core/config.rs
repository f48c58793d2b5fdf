//! Configuration system: TOML file + env var overrides + fixed defaults.
//!
//! Read once at process start; the resulting [`Config`] is handed to the
//! runner and engine by value. Nothing here is hot-reloaded.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::errors::{RemedyError, Result};

/// Full engine configuration model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// `source` stamped on every record the engine appends.
    pub source_label: String,
    pub guards: GuardPolicy,
    pub dedup: DedupConfig,
    pub alerting: AlertingConfig,
    pub ingest: IngestConfig,
    pub lock: LockConfig,
    pub rollout: RolloutConfig,
    pub probe: Option<ProbeConfig>,
    pub actions: ActionsConfig,
    pub paths: PathsConfig,
}

/// Static guard thresholds consulted by the decision engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GuardPolicy {
    pub restart_guard: RestartGuardPolicy,
    pub retry_budget: RetryBudgetPolicy,
    pub circuit_breaker: CircuitBreakerPolicy,
    /// Inactivity after which a key's persisted state is dropped.
    pub stale_ttl_s: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RestartGuardPolicy {
    pub max: usize,
    pub window_s: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryBudgetPolicy {
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CircuitBreakerPolicy {
    pub max_failures: usize,
    pub window_s: u64,
}

/// Suppression of repeated evaluation of the same unresolved occurrence.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DedupConfig {
    pub window_s: u64,
    /// Width of the timestamp bucket in the fallback dedup key.
    pub bucket_s: u64,
}

/// Rate limit on guard-tripped incidents appended per (type, key).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AlertingConfig {
    pub max_per_window: usize,
    pub window_s: u64,
}

/// How much of the incident log a cycle reads.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IngestConfig {
    pub plan_lookback_s: u64,
    pub real_lookback_s: u64,
    pub tail_bytes: u64,
    pub tail_lines: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LockConfig {
    pub ttl_s: u64,
}

/// Staged rollout gate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RolloutConfig {
    /// Phase two: let real mode execute allowed safe-auto actions.
    pub safe_auto_enabled: bool,
    /// Minimum runs inside the evaluation window before recommending cutover.
    pub min_runs: u64,
    pub evaluation_window_s: u64,
}

/// Optional status probe run before each real-mode action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProbeConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,
}

/// Remediation commands, keyed by action kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ActionsConfig {
    pub timeout_ms: u64,
    pub commands: BTreeMap<String, Vec<String>>,
}

/// Filesystem paths used by the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub config_file: PathBuf,
    pub incidents_log: PathBuf,
    pub metrics_log: PathBuf,
    pub heartbeat_log: PathBuf,
    pub state_file: PathBuf,
    pub alerts_file: PathBuf,
    pub lock_file: PathBuf,
    pub activity_log: PathBuf,
}

const fn default_probe_timeout_ms() -> u64 {
    5_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source_label: "mekhanik".to_string(),
            guards: GuardPolicy::default(),
            dedup: DedupConfig::default(),
            alerting: AlertingConfig::default(),
            ingest: IngestConfig::default(),
            lock: LockConfig::default(),
            rollout: RolloutConfig::default(),
            probe: None,
            actions: ActionsConfig::default(),
            paths: PathsConfig::default(),
        }
    }
}

impl Default for GuardPolicy {
    fn default() -> Self {
        Self {
            restart_guard: RestartGuardPolicy::default(),
            retry_budget: RetryBudgetPolicy::default(),
            circuit_breaker: CircuitBreakerPolicy::default(),
            stale_ttl_s: 24 * 3600,
        }
    }
}

impl Default for RestartGuardPolicy {
    fn default() -> Self {
        Self {
            max: 2,
            window_s: 30 * 60,
        }
    }
}

impl Default for RetryBudgetPolicy {
    fn default() -> Self {
        Self { max_attempts: 2 }
    }
}

impl Default for CircuitBreakerPolicy {
    fn default() -> Self {
        Self {
            max_failures: 3,
            window_s: 30 * 60,
        }
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window_s: 180 * 60,
            bucket_s: 60,
        }
    }
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            max_per_window: 1,
            window_s: 30 * 60,
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            plan_lookback_s: 6 * 3600,
            real_lookback_s: 4 * 3600,
            tail_bytes: 2_000_000,
            tail_lines: 6_000,
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self { ttl_s: 15 * 60 }
    }
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            safe_auto_enabled: false,
            // 30-minute cadence gives 48 runs a day; two missed slots are tolerated.
            min_runs: 46,
            evaluation_window_s: 24 * 3600,
        }
    }
}

impl Default for ActionsConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 60_000,
            commands: BTreeMap::new(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        let home_dir = env::var_os("HOME").map_or_else(
            || {
                eprintln!(
                    "[RMD-CONFIG] WARNING: HOME not set, falling back to /tmp for data paths"
                );
                PathBuf::from("/tmp")
            },
            PathBuf::from,
        );
        let cfg = home_dir.join(".config").join("remedy").join("config.toml");
        let data = home_dir.join(".local").join("share").join("remedy");
        Self {
            config_file: cfg,
            incidents_log: data.join("incidents.jsonl"),
            metrics_log: data.join("metrics.jsonl"),
            heartbeat_log: data.join("heartbeat.jsonl"),
            state_file: data.join("policy-state.json"),
            alerts_file: data.join("alert-ledger.json"),
            lock_file: data.join("remedy.lock"),
            activity_log: data.join("activity.jsonl"),
        }
    }
}

impl Config {
    /// Default configuration path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        PathsConfig::default().config_file
    }

    /// Load config from default or explicit path, then apply env overrides.
    ///
    /// Missing config file is not an error when loading from default path; defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, |name| env::var(name).ok())
    }

    /// Like [`Config::load`] with an injectable environment lookup.
    pub fn load_with_env<F>(path: Option<&Path>, lookup: F) -> Result<Self>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let path_buf = path.map_or_else(Self::default_path, Path::to_path_buf);
        let is_explicit_path = path.is_some();

        let mut cfg = if path_buf.exists() {
            let raw = fs::read_to_string(&path_buf).map_err(|source| RemedyError::Io {
                path: path_buf.clone(),
                source,
            })?;
            let parsed: Self = toml::from_str(&raw)?;
            parsed
        } else if is_explicit_path {
            return Err(RemedyError::MissingConfig { path: path_buf });
        } else {
            Self::default()
        };

        cfg.paths.config_file = path_buf;
        cfg.apply_env_overrides_from(lookup)?;
        cfg.normalize_paths();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Deterministic hash of the effective config for activity logging.
    ///
    /// FNV-1a over canonical JSON so the value is stable across processes.
    pub fn stable_hash(&self) -> Result<String> {
        let canonical = serde_json::to_string(self)?;
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in canonical.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        Ok(format!("{hash:016x}"))
    }

    fn apply_env_overrides_from<F>(&mut self, mut lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let mut var = |name: &str| lookup(name).filter(|raw| !raw.trim().is_empty());

        if let Some(raw) = var("REMEDY_SOURCE_LABEL") {
            self.source_label = raw;
        }

        if let Some(raw) = var("REMEDY_RESTART_GUARD_MAX") {
            self.guards.restart_guard.max = parse_env("REMEDY_RESTART_GUARD_MAX", &raw)?;
        }
        if let Some(raw) = var("REMEDY_RESTART_GUARD_WINDOW_S") {
            self.guards.restart_guard.window_s = parse_env("REMEDY_RESTART_GUARD_WINDOW_S", &raw)?;
        }
        if let Some(raw) = var("REMEDY_RETRY_BUDGET_MAX_ATTEMPTS") {
            self.guards.retry_budget.max_attempts =
                parse_env("REMEDY_RETRY_BUDGET_MAX_ATTEMPTS", &raw)?;
        }
        if let Some(raw) = var("REMEDY_CIRCUIT_BREAKER_MAX_FAILURES") {
            self.guards.circuit_breaker.max_failures =
                parse_env("REMEDY_CIRCUIT_BREAKER_MAX_FAILURES", &raw)?;
        }
        if let Some(raw) = var("REMEDY_CIRCUIT_BREAKER_WINDOW_S") {
            self.guards.circuit_breaker.window_s =
                parse_env("REMEDY_CIRCUIT_BREAKER_WINDOW_S", &raw)?;
        }
        if let Some(raw) = var("REMEDY_STALE_TTL_S") {
            self.guards.stale_ttl_s = parse_env("REMEDY_STALE_TTL_S", &raw)?;
        }

        if let Some(raw) = var("REMEDY_DEDUP_WINDOW_S") {
            self.dedup.window_s = parse_env("REMEDY_DEDUP_WINDOW_S", &raw)?;
        }
        if let Some(raw) = var("REMEDY_LOCK_TTL_S") {
            self.lock.ttl_s = parse_env("REMEDY_LOCK_TTL_S", &raw)?;
        }
        if let Some(raw) = var("REMEDY_SAFE_AUTO_ENABLED") {
            self.rollout.safe_auto_enabled = parse_env("REMEDY_SAFE_AUTO_ENABLED", &raw)?;
        }

        if let Some(raw) = var("REMEDY_INCIDENTS_LOG") {
            self.paths.incidents_log = PathBuf::from(raw);
        }
        if let Some(raw) = var("REMEDY_METRICS_LOG") {
            self.paths.metrics_log = PathBuf::from(raw);
        }
        if let Some(raw) = var("REMEDY_HEARTBEAT_LOG") {
            self.paths.heartbeat_log = PathBuf::from(raw);
        }
        if let Some(raw) = var("REMEDY_STATE_FILE") {
            self.paths.state_file = PathBuf::from(raw);
        }
        if let Some(raw) = var("REMEDY_ALERTS_FILE") {
            self.paths.alerts_file = PathBuf::from(raw);
        }
        if let Some(raw) = var("REMEDY_LOCK_FILE") {
            self.paths.lock_file = PathBuf::from(raw);
        }
        if let Some(raw) = var("REMEDY_ACTIVITY_LOG") {
            self.paths.activity_log = PathBuf::from(raw);
        }
        Ok(())
    }

    fn normalize_paths(&mut self) {
        for path in [
            &mut self.paths.incidents_log,
            &mut self.paths.metrics_log,
            &mut self.paths.heartbeat_log,
            &mut self.paths.state_file,
            &mut self.paths.alerts_file,
            &mut self.paths.lock_file,
            &mut self.paths.activity_log,
        ] {
            let s = path.to_string_lossy();
            if s.len() > 1
                && let Some(stripped) = s.strip_suffix('/')
            {
                *path = PathBuf::from(stripped);
            }
        }
    }

    /// Check thresholds and paths for values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.source_label.trim().is_empty() {
            return invalid("source_label must not be empty");
        }

        let guards = &self.guards;
        if guards.restart_guard.max == 0 {
            return invalid("guards.restart_guard.max must be >= 1");
        }
        if guards.retry_budget.max_attempts == 0 {
            return invalid("guards.retry_budget.max_attempts must be >= 1");
        }
        if guards.circuit_breaker.max_failures == 0 {
            return invalid("guards.circuit_breaker.max_failures must be >= 1");
        }
        for (name, value) in [
            ("guards.restart_guard.window_s", guards.restart_guard.window_s),
            ("guards.circuit_breaker.window_s", guards.circuit_breaker.window_s),
            ("guards.stale_ttl_s", guards.stale_ttl_s),
            ("dedup.window_s", self.dedup.window_s),
            ("dedup.bucket_s", self.dedup.bucket_s),
            ("alerting.window_s", self.alerting.window_s),
            ("ingest.plan_lookback_s", self.ingest.plan_lookback_s),
            ("ingest.real_lookback_s", self.ingest.real_lookback_s),
            ("lock.ttl_s", self.lock.ttl_s),
            ("rollout.evaluation_window_s", self.rollout.evaluation_window_s),
        ] {
            check_duration(name, value, MAX_DURATION_S)?;
        }
        check_duration("actions.timeout_ms", self.actions.timeout_ms, MAX_DURATION_S * 1_000)?;
        if self.ingest.tail_bytes == 0 {
            return invalid("ingest.tail_bytes must be > 0");
        }

        if self.dedup.bucket_s > self.dedup.window_s {
            return invalid(&format!(
                "dedup.bucket_s ({}) must be <= dedup.window_s ({})",
                self.dedup.bucket_s, self.dedup.window_s
            ));
        }
        if self.alerting.max_per_window == 0 {
            return invalid("alerting.max_per_window must be >= 1");
        }
        if self.ingest.tail_lines == 0 {
            return invalid("ingest.tail_lines must be >= 1");
        }

        if let Some(probe) = &self.probe {
            if probe.program.trim().is_empty() {
                return invalid("probe.program must not be empty");
            }
            check_duration("probe.timeout_ms", probe.timeout_ms, MAX_DURATION_S * 1_000)?;
        }

        for (kind, argv) in &self.actions.commands {
            if argv.first().is_none_or(|program| program.trim().is_empty()) {
                return invalid(&format!("actions.commands.{kind} needs a program"));
            }
        }

        Ok(())
    }
}

/// Upper bound for any configured window, TTL, or timeout (ten years).
/// Timestamp arithmetic past this would overflow.
pub const MAX_DURATION_S: u64 = 10 * 365 * 24 * 60 * 60;

fn check_duration(name: &str, value: u64, max: u64) -> Result<()> {
    if value == 0 {
        return invalid(&format!("{name} must be > 0"));
    }
    if value > max {
        return invalid(&format!("{name} ({value}) must be <= {max}"));
    }
    Ok(())
}

fn invalid(details: &str) -> Result<()> {
    Err(RemedyError::InvalidConfig {
        details: details.to_string(),
    })
}

fn parse_env<T>(name: &str, raw: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|error| RemedyError::ConfigParse {
            context: "env",
            details: format!("{name}={raw:?}: {error}"),
        })
}
