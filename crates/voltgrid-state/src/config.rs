//! Orchestrator configuration, parsed from the environment.
//!
//! Every duration is configured in seconds. Parsing goes through a lookup
//! closure so tests can supply values without touching the process
//! environment.

use std::time::Duration;

use crate::error::{ConfigError, ConfigResult};
use crate::types::LogLevel;

/// Tunables for the control loop, the planner, the lifecycle manager, the
/// safety valve, and the log sink.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    /// MIN_ACTIVE_GPUS — fleet floor.
    pub min_fleet: u32,
    /// MAX_ACTIVE_GPUS — fleet ceiling.
    pub max_fleet: u32,
    /// TASKS_PER_GPU_THRESHOLD — tasks one worker is expected to absorb.
    pub tasks_per_worker: u32,
    /// MACHINES_TO_KEEP_IDLE — idle buffer added to the desired count.
    pub machines_to_keep_idle: u32,
    /// GPU_IDLE_TIMEOUT_SEC — heartbeat staleness threshold.
    pub idle_timeout: Duration,
    /// TASK_STUCK_TIMEOUT_SEC — per-task stuck threshold.
    pub stuck_timeout: Duration,
    /// SPAWNING_TIMEOUT_SEC — max time in `spawning`.
    pub spawning_timeout: Duration,
    /// GRACEFUL_SHUTDOWN_TIMEOUT_SEC — drain deadline.
    pub graceful_shutdown_timeout: Duration,
    /// FAILSAFE_STALE_THRESHOLD_SEC — hard failsafe regardless of status.
    pub failsafe_stale_threshold: Duration,
    /// WORKER_GRACE_PERIOD_SEC — grace after promotion before health checks.
    pub worker_grace_period: Duration,
    /// SPAWNING_GRACE_PERIOD_SEC — minimum age before a surplus spawning
    /// worker may be cancelled.
    pub spawning_grace_period: Duration,
    /// ORCHESTRATOR_POLL_SEC — cycle interval.
    pub poll_interval: Duration,
    /// MAX_WORKER_FAILURE_RATE — safety-valve threshold.
    pub max_failure_rate: f64,
    /// FAILURE_WINDOW_MINUTES — safety-valve window.
    pub failure_window: Duration,
    /// MIN_WORKERS_FOR_RATE_CHECK — safety-valve minimum sample.
    pub min_workers_for_rate_check: u32,
    /// ENABLE_DB_LOGGING — start the log sink.
    pub enable_db_logging: bool,
    /// DB_LOG_LEVEL — minimum level shipped to the log store.
    pub db_log_level: LogLevel,
    /// DB_LOG_BATCH_SIZE.
    pub db_log_batch_size: usize,
    /// DB_LOG_FLUSH_INTERVAL (seconds).
    pub db_log_flush_interval: Duration,
    /// DB_LOGGING_REQUIRED — fail fast when the sink cannot start.
    pub db_logging_required: bool,
    /// ORCHESTRATOR_INSTANCE_ID — source_id for log records.
    pub instance_id: String,
    /// LOG_SINK_HEALTH_EVERY_CYCLES — sink health probe cadence.
    pub sink_health_every_cycles: u64,
    /// RECONCILE_EVERY_CYCLES — orphan-pod reconciliation cadence.
    pub reconcile_every_cycles: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            min_fleet: 2,
            max_fleet: 10,
            tasks_per_worker: 3,
            machines_to_keep_idle: 0,
            idle_timeout: Duration::from_secs(300),
            stuck_timeout: Duration::from_secs(300),
            spawning_timeout: Duration::from_secs(300),
            graceful_shutdown_timeout: Duration::from_secs(600),
            failsafe_stale_threshold: Duration::from_secs(900),
            worker_grace_period: Duration::from_secs(120),
            spawning_grace_period: Duration::from_secs(180),
            poll_interval: Duration::from_secs(30),
            max_failure_rate: 0.8,
            failure_window: Duration::from_secs(30 * 60),
            min_workers_for_rate_check: 5,
            enable_db_logging: false,
            db_log_level: LogLevel::Info,
            db_log_batch_size: 50,
            db_log_flush_interval: Duration::from_secs(5),
            db_logging_required: false,
            instance_id: default_instance_id(),
            sink_health_every_cycles: 10,
            reconcile_every_cycles: 10,
        }
    }
}

impl OrchestratorConfig {
    /// Build from the process environment.
    pub fn from_env() -> ConfigResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary lookup (tests pass closures over maps).
    pub fn from_lookup<F>(lookup: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let mut cfg = Self {
            min_fleet: parse_u32(&lookup, "MIN_ACTIVE_GPUS", defaults.min_fleet)?,
            max_fleet: parse_u32(&lookup, "MAX_ACTIVE_GPUS", defaults.max_fleet)?,
            tasks_per_worker: parse_u32(
                &lookup,
                "TASKS_PER_GPU_THRESHOLD",
                defaults.tasks_per_worker,
            )?,
            machines_to_keep_idle: parse_u32(
                &lookup,
                "MACHINES_TO_KEEP_IDLE",
                defaults.machines_to_keep_idle,
            )?,
            idle_timeout: parse_secs(&lookup, "GPU_IDLE_TIMEOUT_SEC", defaults.idle_timeout)?,
            stuck_timeout: parse_secs(&lookup, "TASK_STUCK_TIMEOUT_SEC", defaults.stuck_timeout)?,
            spawning_timeout: parse_secs(
                &lookup,
                "SPAWNING_TIMEOUT_SEC",
                defaults.spawning_timeout,
            )?,
            graceful_shutdown_timeout: parse_secs(
                &lookup,
                "GRACEFUL_SHUTDOWN_TIMEOUT_SEC",
                defaults.graceful_shutdown_timeout,
            )?,
            failsafe_stale_threshold: parse_secs(
                &lookup,
                "FAILSAFE_STALE_THRESHOLD_SEC",
                defaults.failsafe_stale_threshold,
            )?,
            worker_grace_period: parse_secs(
                &lookup,
                "WORKER_GRACE_PERIOD_SEC",
                defaults.worker_grace_period,
            )?,
            spawning_grace_period: parse_secs(
                &lookup,
                "SPAWNING_GRACE_PERIOD_SEC",
                defaults.spawning_grace_period,
            )?,
            poll_interval: parse_secs(&lookup, "ORCHESTRATOR_POLL_SEC", defaults.poll_interval)?,
            max_failure_rate: parse_f64(
                &lookup,
                "MAX_WORKER_FAILURE_RATE",
                defaults.max_failure_rate,
            )?,
            failure_window: parse_minutes(
                &lookup,
                "FAILURE_WINDOW_MINUTES",
                defaults.failure_window,
            )?,
            min_workers_for_rate_check: parse_u32(
                &lookup,
                "MIN_WORKERS_FOR_RATE_CHECK",
                defaults.min_workers_for_rate_check,
            )?,
            enable_db_logging: parse_bool(
                &lookup,
                "ENABLE_DB_LOGGING",
                defaults.enable_db_logging,
            )?,
            db_log_level: parse_level(&lookup, "DB_LOG_LEVEL", defaults.db_log_level)?,
            db_log_batch_size: parse_u32(
                &lookup,
                "DB_LOG_BATCH_SIZE",
                defaults.db_log_batch_size as u32,
            )? as usize,
            db_log_flush_interval: parse_secs(
                &lookup,
                "DB_LOG_FLUSH_INTERVAL",
                defaults.db_log_flush_interval,
            )?,
            db_logging_required: parse_bool(
                &lookup,
                "DB_LOGGING_REQUIRED",
                defaults.db_logging_required,
            )?,
            instance_id: lookup("ORCHESTRATOR_INSTANCE_ID").unwrap_or_else(default_instance_id),
            sink_health_every_cycles: parse_u64(
                &lookup,
                "LOG_SINK_HEALTH_EVERY_CYCLES",
                defaults.sink_health_every_cycles,
            )?,
            reconcile_every_cycles: parse_u64(
                &lookup,
                "RECONCILE_EVERY_CYCLES",
                defaults.reconcile_every_cycles,
            )?,
        };

        cfg.validate()?;
        Ok(cfg)
    }

    /// Clamp derived limits and reject inconsistent settings.
    fn validate(&mut self) -> ConfigResult<()> {
        if self.max_fleet == 0 {
            return Err(ConfigError::invalid("MAX_ACTIVE_GPUS", "must be at least 1"));
        }
        if self.min_fleet > self.max_fleet {
            return Err(ConfigError::invalid(
                "MIN_ACTIVE_GPUS",
                format!(
                    "min fleet {} exceeds max fleet {}",
                    self.min_fleet, self.max_fleet
                ),
            ));
        }
        if self.tasks_per_worker == 0 {
            return Err(ConfigError::invalid(
                "TASKS_PER_GPU_THRESHOLD",
                "must be at least 1",
            ));
        }
        if !(0.0..=1.0).contains(&self.max_failure_rate) {
            return Err(ConfigError::invalid(
                "MAX_WORKER_FAILURE_RATE",
                "must be within 0.0..=1.0",
            ));
        }
        if self.machines_to_keep_idle > self.max_fleet {
            tracing::warn!(
                requested = self.machines_to_keep_idle,
                max_fleet = self.max_fleet,
                "MACHINES_TO_KEEP_IDLE exceeds MAX_ACTIVE_GPUS, clamping"
            );
            self.machines_to_keep_idle = self.max_fleet;
        }
        Ok(())
    }
}

fn default_instance_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "local".to_string());
    format!("orchestrator-gpu-{host}")
}

// ── Parse helpers ──────────────────────────────────────────────────

fn parse_u32<F>(lookup: &F, var: &'static str, default: u32) -> ConfigResult<u32>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        Some(raw) => raw
            .trim()
            .parse::<u32>()
            .map_err(|e| ConfigError::invalid(var, e.to_string())),
        None => Ok(default),
    }
}

fn parse_u64<F>(lookup: &F, var: &'static str, default: u64) -> ConfigResult<u64>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map_err(|e| ConfigError::invalid(var, e.to_string())),
        None => Ok(default),
    }
}

fn parse_f64<F>(lookup: &F, var: &'static str, default: f64) -> ConfigResult<f64>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        Some(raw) => raw
            .trim()
            .parse::<f64>()
            .map_err(|e| ConfigError::invalid(var, e.to_string())),
        None => Ok(default),
    }
}

fn parse_secs<F>(lookup: &F, var: &'static str, default: Duration) -> ConfigResult<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(Duration::from_secs(parse_u64(
        lookup,
        var,
        default.as_secs(),
    )?))
}

fn parse_minutes<F>(lookup: &F, var: &'static str, default: Duration) -> ConfigResult<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(Duration::from_secs(
        parse_u64(lookup, var, default.as_secs() / 60)? * 60,
    ))
}

fn parse_bool<F>(lookup: &F, var: &'static str, default: bool) -> ConfigResult<bool>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            other => Err(ConfigError::invalid(
                var,
                format!("expected a boolean, got {other:?}"),
            )),
        },
        None => Ok(default),
    }
}

fn parse_level<F>(lookup: &F, var: &'static str, default: LogLevel) -> ConfigResult<LogLevel>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        Some(raw) => LogLevel::parse(raw.trim())
            .ok_or_else(|| ConfigError::invalid(var, format!("unknown log level {raw:?}"))),
        None => Ok(default),
    }
}
