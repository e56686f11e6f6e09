//! Runtime and per-workflow configuration.
//!
//! Both option structs have sensible defaults and can be overlaid from
//! `DURASTATE_*` environment variables:
//!
//! | Variable | Field |
//! |---|---|
//! | `DURASTATE_EXECUTOR_GROUP` | `RuntimeOptions::executor_group` |
//! | `DURASTATE_EXECUTOR_HOST` | `RuntimeOptions::executor_host` |
//! | `DURASTATE_HEARTBEAT_INTERVAL_MS` | `RuntimeOptions::heartbeat_interval` |
//! | `DURASTATE_EXECUTOR_TIMEOUT_MS` | `RuntimeOptions::executor_timeout` |
//! | `DURASTATE_POLL_INTERVAL_MS` | `RuntimeOptions::poll_interval` |
//! | `DURASTATE_WORKER_COUNT` | `RuntimeOptions::worker_count` |
//! | `DURASTATE_QUEUE_CAPACITY` | `RuntimeOptions::queue_capacity` |
//! | `DURASTATE_QUEUE_LOW_WATER_MARK` | `RuntimeOptions::queue_low_water_mark` |
//! | `DURASTATE_ERROR_BACKOFF_MS` | `RuntimeOptions::error_backoff` |
//! | `DURASTATE_ILLEGAL_TRANSITION_POLICY` | `RuntimeOptions::illegal_transition_policy` (`ignore`, `log`, `fail`) |
//! | `DURASTATE_UNKNOWN_WORKFLOW_RETRY_DELAY_MS` | `RuntimeOptions::unknown_workflow_retry_delay` |
//! | `DURASTATE_STUCK_THRESHOLD_MS` | `RuntimeOptions::stuck_threshold` |
//! | `DURASTATE_STUCK_CHECK_INTERVAL_MS` | `RuntimeOptions::stuck_check_interval` |
//! | `DURASTATE_SHUTDOWN_TIMEOUT_MS` | `RuntimeOptions::shutdown_timeout` |
//! | `DURASTATE_MAX_RETRIES` | `WorkflowSettings::max_retries` |
//! | `DURASTATE_MIN_ERROR_TRANSITION_DELAY_MS` | `WorkflowSettings::min_error_transition_delay` |
//! | `DURASTATE_MAX_ERROR_TRANSITION_DELAY_MS` | `WorkflowSettings::max_error_transition_delay` |
//! | `DURASTATE_SHORT_TRANSITION_DELAY_MS` | `WorkflowSettings::short_transition_delay` |
//! | `DURASTATE_MAX_SUBSEQUENT_STATE_EXECUTIONS` | `WorkflowSettings::max_subsequent_state_executions` |

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::DEFAULT_EXECUTOR_GROUP;

/// What the processor does when a handler requests a transition that the
/// definition does not permit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IllegalTransitionPolicy {
    /// Allow the transition without logging.
    Ignore,
    /// Log a warning and allow the transition.
    Log,
    /// Reroute the instance to the definition's error state.
    #[default]
    Fail,
}

impl IllegalTransitionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            IllegalTransitionPolicy::Ignore => "ignore",
            IllegalTransitionPolicy::Log => "log",
            IllegalTransitionPolicy::Fail => "fail",
        }
    }
}

impl fmt::Display for IllegalTransitionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IllegalTransitionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ignore" => Ok(IllegalTransitionPolicy::Ignore),
            "log" => Ok(IllegalTransitionPolicy::Log),
            "fail" => Ok(IllegalTransitionPolicy::Fail),
            other => Err(format!("unknown illegal transition policy '{other}' (expected ignore, log or fail)")),
        }
    }
}

/// Configuration for one executor process.
///
/// # Example
///
/// ```rust
/// use durastate::runtime::{IllegalTransitionPolicy, RuntimeOptions};
/// use std::time::Duration;
///
/// let options = RuntimeOptions {
///     executor_group: "billing".to_string(),
///     worker_count: 4,
///     poll_interval: Duration::from_millis(50),
///     illegal_transition_policy: IllegalTransitionPolicy::Log,
///     ..Default::default()
/// };
/// assert!(options.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Partition key; executors only compete for instances of their own group.
    pub executor_group: String,
    /// Host recorded in the executor row. Falls back to `$HOSTNAME`, then `localhost`.
    pub executor_host: Option<String>,
    /// How often the dispatcher refreshes this executor's expiry.
    pub heartbeat_interval: Duration,
    /// How long after the last heartbeat peers consider this executor dead.
    /// Must be at least twice `heartbeat_interval`.
    pub executor_timeout: Duration,
    /// Dispatcher sleep after an empty poll; also the upper bound of the
    /// randomized claim-race backoff.
    pub poll_interval: Duration,
    /// Number of worker tasks. Default: 2 x CPU count.
    pub worker_count: usize,
    /// Capacity of the claimed-instance queue between dispatcher and workers.
    pub queue_capacity: usize,
    /// The dispatcher waits until the queue drains to this length before polling again.
    pub queue_low_water_mark: usize,
    /// Dispatcher sleep after an unexpected store error.
    pub error_backoff: Duration,
    pub illegal_transition_policy: IllegalTransitionPolicy,
    /// Reschedule delay for instances whose type or state this process does not know.
    pub unknown_workflow_retry_delay: Duration,
    /// Processors running longer than this are reported as potentially stuck.
    pub stuck_threshold: Duration,
    pub stuck_check_interval: Duration,
    /// Maximum wait for in-flight processors during graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        let worker_count = (num_cpus::get() * 2).max(1);
        Self {
            executor_group: DEFAULT_EXECUTOR_GROUP.to_string(),
            executor_host: None,
            heartbeat_interval: Duration::from_secs(60),
            executor_timeout: Duration::from_secs(15 * 60),
            poll_interval: Duration::from_secs(1),
            worker_count,
            queue_capacity: worker_count * 2,
            queue_low_water_mark: (worker_count / 2).max(1),
            error_backoff: Duration::from_secs(1),
            illegal_transition_policy: IllegalTransitionPolicy::default(),
            unknown_workflow_retry_delay: Duration::from_secs(60 * 60),
            stuck_threshold: Duration::from_secs(60),
            stuck_check_interval: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

impl RuntimeOptions {
    /// Defaults overlaid with `DURASTATE_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns every unparseable variable, joined by `"; "`.
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`RuntimeOptions::from_env`] with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let mut options = Self::default();
        let mut errors = Vec::new();
        let mut env = EnvReader {
            lookup: &lookup,
            errors: &mut errors,
        };

        if let Some(group) = env.string("DURASTATE_EXECUTOR_GROUP") {
            options.executor_group = group;
        }
        if let Some(host) = env.string("DURASTATE_EXECUTOR_HOST") {
            options.executor_host = Some(host);
        }
        env.millis("DURASTATE_HEARTBEAT_INTERVAL_MS", &mut options.heartbeat_interval);
        env.millis("DURASTATE_EXECUTOR_TIMEOUT_MS", &mut options.executor_timeout);
        env.millis("DURASTATE_POLL_INTERVAL_MS", &mut options.poll_interval);

        // Queue sizing follows the worker count unless set explicitly
        let mut worker_count = options.worker_count;
        if env.parse("DURASTATE_WORKER_COUNT", &mut worker_count) {
            options.worker_count = worker_count;
            options.queue_capacity = worker_count * 2;
            options.queue_low_water_mark = (worker_count / 2).max(1);
        }
        env.parse("DURASTATE_QUEUE_CAPACITY", &mut options.queue_capacity);
        env.parse("DURASTATE_QUEUE_LOW_WATER_MARK", &mut options.queue_low_water_mark);
        env.millis("DURASTATE_ERROR_BACKOFF_MS", &mut options.error_backoff);
        env.parse("DURASTATE_ILLEGAL_TRANSITION_POLICY", &mut options.illegal_transition_policy);
        env.millis(
            "DURASTATE_UNKNOWN_WORKFLOW_RETRY_DELAY_MS",
            &mut options.unknown_workflow_retry_delay,
        );
        env.millis("DURASTATE_STUCK_THRESHOLD_MS", &mut options.stuck_threshold);
        env.millis("DURASTATE_STUCK_CHECK_INTERVAL_MS", &mut options.stuck_check_interval);
        env.millis("DURASTATE_SHUTDOWN_TIMEOUT_MS", &mut options.shutdown_timeout);

        if errors.is_empty() {
            Ok(options)
        } else {
            Err(errors.join("; "))
        }
    }

    /// Check option consistency.
    ///
    /// # Errors
    ///
    /// Returns every violated constraint, joined by `"; "`.
    pub fn validate(&self) -> Result<(), String> {
        let mut errors = Vec::new();
        if self.executor_group.trim().is_empty() {
            errors.push("executor_group must not be empty".to_string());
        }
        if self.heartbeat_interval.is_zero() {
            errors.push("heartbeat_interval must be greater than zero".to_string());
        }
        match self.heartbeat_interval.checked_mul(2) {
            None => errors.push(format!(
                "heartbeat_interval ({:?}) is too large",
                self.heartbeat_interval
            )),
            Some(two_beats) if self.executor_timeout < two_beats => errors.push(format!(
                "executor_timeout ({:?}) must be at least twice heartbeat_interval ({:?})",
                self.executor_timeout, self.heartbeat_interval
            )),
            Some(_) => {}
        }
        if self.poll_interval.is_zero() {
            errors.push("poll_interval must be greater than zero".to_string());
        }
        if self.worker_count == 0 {
            errors.push("worker_count must be at least 1".to_string());
        }
        if self.queue_capacity == 0 {
            errors.push("queue_capacity must be at least 1".to_string());
        }
        if self.queue_low_water_mark > self.queue_capacity {
            errors.push(format!(
                "queue_low_water_mark ({}) must not exceed queue_capacity ({})",
                self.queue_low_water_mark, self.queue_capacity
            ));
        }
        if self.stuck_check_interval.is_zero() {
            errors.push("stuck_check_interval must be greater than zero".to_string());
        }
        if errors.is_empty() { Ok(()) } else { Err(errors.join("; ")) }
    }

    /// Host name to record for this executor.
    pub fn resolved_host(&self) -> String {
        self.executor_host
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty()))
            .unwrap_or_else(|| "localhost".to_string())
    }
}

/// Retry, backoff and busy-loop settings of one workflow definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowSettings {
    /// Failed attempts allowed in one state before routing to the failure or error state.
    pub max_retries: u32,
    pub min_error_transition_delay: Duration,
    pub max_error_transition_delay: Duration,
    /// Delay forced on an instance that hit the busy-loop limit.
    pub short_transition_delay: Duration,
    /// Consecutive zero-delay executions before the busy-loop breaker kicks in.
    pub max_subsequent_state_executions: u32,
    /// Per-state overrides of `max_subsequent_state_executions`.
    pub max_subsequent_state_executions_per_state: HashMap<String, u32>,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            max_retries: 17,
            min_error_transition_delay: Duration::from_secs(60),
            max_error_transition_delay: Duration::from_secs(24 * 60 * 60),
            short_transition_delay: Duration::from_secs(30),
            max_subsequent_state_executions: 100,
            max_subsequent_state_executions_per_state: HashMap::new(),
        }
    }
}

impl WorkflowSettings {
    /// Defaults overlaid with `DURASTATE_*` environment variables.
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let mut settings = Self::default();
        let mut errors = Vec::new();
        let mut env = EnvReader {
            lookup: &lookup,
            errors: &mut errors,
        };
        env.parse("DURASTATE_MAX_RETRIES", &mut settings.max_retries);
        env.millis(
            "DURASTATE_MIN_ERROR_TRANSITION_DELAY_MS",
            &mut settings.min_error_transition_delay,
        );
        env.millis(
            "DURASTATE_MAX_ERROR_TRANSITION_DELAY_MS",
            &mut settings.max_error_transition_delay,
        );
        env.millis("DURASTATE_SHORT_TRANSITION_DELAY_MS", &mut settings.short_transition_delay);
        env.parse(
            "DURASTATE_MAX_SUBSEQUENT_STATE_EXECUTIONS",
            &mut settings.max_subsequent_state_executions,
        );
        if errors.is_empty() {
            Ok(settings)
        } else {
            Err(errors.join("; "))
        }
    }

    /// Busy-loop limit for `state`, honoring per-state overrides.
    pub fn max_subsequent_state_executions_for(&self, state: &str) -> u32 {
        self.max_subsequent_state_executions_per_state
            .get(state)
            .copied()
            .unwrap_or(self.max_subsequent_state_executions)
    }

    pub fn validate(&self) -> Result<(), String> {
        let mut errors = Vec::new();
        if self.min_error_transition_delay > self.max_error_transition_delay {
            errors.push(format!(
                "min_error_transition_delay ({:?}) must not exceed max_error_transition_delay ({:?})",
                self.min_error_transition_delay, self.max_error_transition_delay
            ));
        }
        if self.max_subsequent_state_executions == 0 {
            errors.push("max_subsequent_state_executions must be at least 1".to_string());
        }
        for (state, limit) in &self.max_subsequent_state_executions_per_state {
            if *limit == 0 {
                errors.push(format!("max_subsequent_state_executions for state '{state}' must be at least 1"));
            }
        }
        if errors.is_empty() { Ok(()) } else { Err(errors.join("; ")) }
    }
}

struct EnvReader<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
    errors: &'a mut Vec<String>,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<'_, F> {
    fn string(&mut self, key: &str) -> Option<String> {
        (self.lookup)(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    /// Overwrites `target` when the variable is present and valid; returns whether it did.
    fn parse<T>(&mut self, key: &str, target: &mut T) -> bool
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        let Some(raw) = self.string(key) else {
            return false;
        };
        match raw.parse::<T>() {
            Ok(value) => {
                *target = value;
                true
            }
            Err(e) => {
                self.errors.push(format!("{key}: invalid value '{raw}': {e}"));
                false
            }
        }
    }

    fn millis(&mut self, key: &str, target: &mut Duration) -> bool {
        let mut ms = target.as_millis() as u64;
        if self.parse(key, &mut ms) {
            *target = Duration::from_millis(ms);
            true
        } else {
            false
        }
    }
}
