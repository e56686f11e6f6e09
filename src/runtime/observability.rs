//! Structured logging setup and in-process metrics counters.
//!
//! All runtime logs use `durastate::*` targets and carry correlation fields:
//! - `instance_id` - Workflow instance id
//! - `workflow_type` - Workflow type of the instance
//! - `state` - State being executed
//! - `executor_id` - Executor row id of this process
//! - `worker_id` - Worker task index

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Log format options for structured logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Structured JSON output for log aggregators
    Json,
    /// Human-readable format for development (with all fields)
    Pretty,
    /// Compact single-line format
    #[default]
    Compact,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            other => Err(format!("unknown log format '{other}' (expected json, pretty or compact)")),
        }
    }
}

/// Logging configuration.
///
/// `RUST_LOG`, when set, replaces the filter derived from `level`.
///
/// # Example
///
/// ```rust,no_run
/// # use durastate::runtime::observability::{LogFormat, LoggingConfig, init_logging};
/// let config = LoggingConfig {
///     format: LogFormat::Json,
///     level: "debug".to_string(),
/// };
/// init_logging(&config).ok();
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// Level for `durastate` targets; everything else logs at `warn`.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Compact,
            level: "info".to_string(),
        }
    }
}

impl LoggingConfig {
    /// Defaults overlaid with `DURASTATE_LOG_FORMAT` and `DURASTATE_LOG_LEVEL`.
    pub fn from_env() -> Result<Self, String> {
        let mut config = Self::default();
        if let Ok(format) = std::env::var("DURASTATE_LOG_FORMAT") {
            config.format = format.parse().map_err(|e| format!("DURASTATE_LOG_FORMAT: {e}"))?;
        }
        if let Some(level) = std::env::var("DURASTATE_LOG_LEVEL").ok().filter(|l| !l.trim().is_empty()) {
            config.level = level.trim().to_string();
        }
        Ok(config)
    }
}

fn default_filter_expression(level: &str) -> String {
    format!("warn,durastate={level}")
}

/// Install the global tracing subscriber.
///
/// # Errors
///
/// Fails if a global subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<(), String> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter_expression(&config.level)));

    match config.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .map_err(|e| format!("Failed to initialize JSON logging: {e}"))?;
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .try_init()
                .map_err(|e| format!("Failed to initialize pretty logging: {e}"))?;
        }
        LogFormat::Compact => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().compact())
                .try_init()
                .map_err(|e| format!("Failed to initialize compact logging: {e}"))?;
        }
    }

    Ok(())
}

/// Snapshot of runtime counters for tests and diagnostics.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Committed state executions, successful or not.
    pub executions: u64,
    /// Executions whose handler failed or panicked.
    pub failures: u64,
    pub claims: u64,
    pub claim_races: u64,
    pub recovered_instances: u64,
    /// Instances rescheduled because their type or state is unknown here.
    pub unknown_reschedules: u64,
    pub busy_loop_breaks: u64,
    pub persist_failures: u64,
    /// In-flight executions reported as running past the stuck threshold.
    pub stuck_reports: u64,
}

/// Atomic counters shared by the dispatcher, workers and processor.
#[derive(Debug, Default)]
pub struct RuntimeMetrics {
    executions: AtomicU64,
    failures: AtomicU64,
    claims: AtomicU64,
    claim_races: AtomicU64,
    recovered_instances: AtomicU64,
    unknown_reschedules: AtomicU64,
    busy_loop_breaks: AtomicU64,
    persist_failures: AtomicU64,
    stuck_reports: AtomicU64,
}

impl RuntimeMetrics {
    #[inline]
    pub fn record_execution(&self, failed: bool) {
        self.executions.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_claims(&self, count: usize) {
        self.claims.fetch_add(count as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_claim_race(&self) {
        self.claim_races.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_recovered(&self, count: usize) {
        self.recovered_instances.fetch_add(count as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_unknown_reschedule(&self) {
        self.unknown_reschedules.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_busy_loop_break(&self) {
        self.busy_loop_breaks.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_persist_failure(&self) {
        self.persist_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_stuck(&self, count: usize) {
        self.stuck_reports.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            executions: self.executions.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            claims: self.claims.load(Ordering::Relaxed),
            claim_races: self.claim_races.load(Ordering::Relaxed),
            recovered_instances: self.recovered_instances.load(Ordering::Relaxed),
            unknown_reschedules: self.unknown_reschedules.load(Ordering::Relaxed),
            busy_loop_breaks: self.busy_loop_breaks.load(Ordering::Relaxed),
            persist_failures: self.persist_failures.load(Ordering::Relaxed),
            stuck_reports: self.stuck_reports.load(Ordering::Relaxed),
        }
    }
}
