//! # durastate
//!
//! A durable state machine workflow engine. Workflow instances live as rows in a
//! shared store; any number of executor processes poll that store, claim ready
//! instances with an atomic conditional update, and drive each claimed instance
//! through its state machine until it yields (schedules itself for later) or
//! finishes.
//!
//! ## Moving parts
//!
//! - [`providers::Provider`]: the store abstraction (claim, persist, wakeup,
//!   executor heartbeats). [`providers::sqlite::SqliteProvider`] implements it.
//! - [`runtime::WorkflowDefinition`]: the per-type state machine (states,
//!   permitted transitions, failure transitions, settings and handlers).
//! - [`runtime::Runtime`]: one executor process. It runs a dispatcher that
//!   claims work sized to free worker capacity and a pool of workers that run
//!   the per-instance state processor.
//! - [`Client`]: creates, inspects, wakes and externally updates instances.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use durastate::runtime::{NextAction, Runtime, RuntimeOptions, StateType, WorkflowDefinition, WorkflowRegistry};
//! use durastate::providers::sqlite::SqliteProvider;
//! use durastate::{Client, NewWorkflowInstance};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let definition = WorkflowDefinition::builder("greeting")
//!     .register_state("begin", StateType::Start)
//!     .register_state("done", StateType::End)
//!     .register_state("error", StateType::Manual)
//!     .initial_state("begin")
//!     .error_state("error")
//!     .permit("begin", "done")
//!     .on_state("begin", |ctx| async move {
//!         ctx.set_variable("greeting", "hello");
//!         Ok(NextAction::move_to_state("done", "Greeted"))
//!     })
//!     .build()?;
//! let workflows = WorkflowRegistry::builder().register(definition).build_result()?;
//!
//! let store = Arc::new(SqliteProvider::new_in_memory().await?);
//! let runtime = Runtime::start(store.clone(), workflows.clone(), RuntimeOptions::default()).await?;
//!
//! let client = Client::new(store).with_workflows(workflows);
//! let id = client.create_workflow(NewWorkflowInstance::new("greeting")).await?;
//! # let _ = id;
//! runtime.shutdown().await;
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod client;
pub mod providers;
pub mod runtime;

#[cfg(feature = "provider-test")]
pub mod provider_validation;
#[cfg(feature = "provider-test")]
pub mod provider_validations;

pub use client::Client;

/// Default executor group used when none is configured.
pub const DEFAULT_EXECUTOR_GROUP: &str = "default";

/// Current wall clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Execution status of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceStatus {
    /// Inserted, never executed.
    Created,
    /// Waiting for its next activation.
    InProgress,
    /// Owned by an executor that will run it again without releasing it.
    Executing,
    /// Parked in a manual state; needs an external change to continue.
    Manual,
    /// Reached an end state.
    Finished,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Created => "created",
            InstanceStatus::InProgress => "inProgress",
            InstanceStatus::Executing => "executing",
            InstanceStatus::Manual => "manual",
            InstanceStatus::Finished => "finished",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(InstanceStatus::Created),
            "inProgress" => Ok(InstanceStatus::InProgress),
            "executing" => Ok(InstanceStatus::Executing),
            "manual" => Ok(InstanceStatus::Manual),
            "finished" => Ok(InstanceStatus::Finished),
            other => Err(format!("unknown instance status: {other}")),
        }
    }
}

/// Kind of an audit row appended to an instance's action trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionType {
    StateExecution,
    StateExecutionFailed,
    ExternalChange,
    Recovery,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::StateExecution => "stateExecution",
            ActionType::StateExecutionFailed => "stateExecutionFailed",
            ActionType::ExternalChange => "externalChange",
            ActionType::Recovery => "recovery",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stateExecution" => Ok(ActionType::StateExecution),
            "stateExecutionFailed" => Ok(ActionType::StateExecutionFailed),
            "externalChange" => Ok(ActionType::ExternalChange),
            "recovery" => Ok(ActionType::Recovery),
            other => Err(format!("unknown action type: {other}")),
        }
    }
}

/// A persisted workflow instance row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: i64,
    pub workflow_type: String,
    pub external_id: String,
    pub business_key: Option<String>,
    pub executor_group: String,
    pub state: String,
    pub state_text: Option<String>,
    pub status: InstanceStatus,
    /// Owning executor; `Some` only while a processor holds the instance.
    pub executor_id: Option<i64>,
    /// `None` means the instance will never be activated again.
    pub next_activation: Option<u64>,
    pub retries: u32,
    pub parent_workflow_id: Option<i64>,
    pub parent_action_id: Option<i64>,
    pub priority: i32,
    pub state_variables: BTreeMap<String, String>,
    pub created: u64,
    pub modified: u64,
    pub started: Option<u64>,
}

impl WorkflowInstance {
    /// True when the instance is unclaimed and its activation time has passed.
    pub fn is_claimable_at(&self, now: u64) -> bool {
        self.executor_id.is_none() && self.next_activation.is_some_and(|at| at <= now)
    }
}

/// Write-once audit record of one state execution attempt or external event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowInstanceAction {
    pub id: i64,
    pub workflow_instance_id: i64,
    pub executor_id: Option<i64>,
    pub state: String,
    pub state_text: Option<String>,
    pub action_type: ActionType,
    pub retry_no: u32,
    pub execution_start: u64,
    pub execution_end: u64,
    /// Variables written during this attempt.
    pub updated_state_variables: BTreeMap<String, String>,
}

/// Action row as produced by the processor, before the store assigns an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewWorkflowAction {
    pub executor_id: Option<i64>,
    pub state: String,
    pub state_text: Option<String>,
    pub action_type: ActionType,
    pub retry_no: u32,
    pub execution_start: u64,
    pub execution_end: u64,
    pub updated_state_variables: BTreeMap<String, String>,
}

/// Request to insert a workflow instance.
///
/// `state` may be left empty when the caller resolves it later from the
/// workflow definition's initial state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NewWorkflowInstance {
    pub workflow_type: String,
    /// Generated when `None`.
    pub external_id: Option<String>,
    pub business_key: Option<String>,
    pub executor_group: Option<String>,
    pub state: Option<String>,
    pub state_text: Option<String>,
    /// Defaults to "now" when `None`.
    pub next_activation: Option<u64>,
    pub priority: i32,
    pub state_variables: BTreeMap<String, String>,
    pub parent_workflow_id: Option<i64>,
    pub parent_action_id: Option<i64>,
}

impl NewWorkflowInstance {
    pub fn new(workflow_type: impl Into<String>) -> Self {
        Self {
            workflow_type: workflow_type.into(),
            ..Default::default()
        }
    }

    pub fn with_external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = Some(external_id.into());
        self
    }

    pub fn with_business_key(mut self, business_key: impl Into<String>) -> Self {
        self.business_key = Some(business_key.into());
        self
    }

    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    pub fn with_next_activation(mut self, at_ms: u64) -> Self {
        self.next_activation = Some(at_ms);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.state_variables.insert(key.into(), value.into());
        self
    }
}

/// Registered executor process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorInfo {
    pub id: i64,
    pub host: String,
    pub pid: u32,
    pub executor_group: String,
    pub started: u64,
    /// Last heartbeat.
    pub active: u64,
    pub expires: u64,
    pub stopped: Option<u64>,
    pub recovered: Option<u64>,
}

impl ExecutorInfo {
    pub fn is_expired_at(&self, now: u64) -> bool {
        self.expires < now
    }
}

/// Change applied to an unclaimed instance from outside the processor
/// (operator action, API call). Recorded as an [`ActionType::ExternalChange`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExternalChange {
    /// New state; unchanged when `None`.
    pub state: Option<String>,
    pub state_text: Option<String>,
    /// New activation; `None` parks the instance.
    pub next_activation: Option<u64>,
    /// Status to record when no activation is set; defaults to the current one.
    pub status: Option<InstanceStatus>,
    /// Variables merged into the instance.
    pub state_variables: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_storage_names() {
        for status in [
            InstanceStatus::Created,
            InstanceStatus::InProgress,
            InstanceStatus::Executing,
            InstanceStatus::Manual,
            InstanceStatus::Finished,
        ] {
            assert_eq!(status.as_str().parse::<InstanceStatus>().unwrap(), status);
        }
        assert!("running".parse::<InstanceStatus>().is_err());
    }

    #[test]
    fn claimable_requires_no_owner_and_due_activation() {
        let mut instance = WorkflowInstance {
            id: 1,
            workflow_type: "t".into(),
            external_id: "e".into(),
            business_key: None,
            executor_group: DEFAULT_EXECUTOR_GROUP.into(),
            state: "begin".into(),
            state_text: None,
            status: InstanceStatus::Created,
            executor_id: None,
            next_activation: Some(100),
            retries: 0,
            parent_workflow_id: None,
            parent_action_id: None,
            priority: 0,
            state_variables: BTreeMap::new(),
            created: 0,
            modified: 0,
            started: None,
        };
        assert!(instance.is_claimable_at(100));
        assert!(!instance.is_claimable_at(99));

        instance.executor_id = Some(7);
        assert!(!instance.is_claimable_at(100));

        instance.executor_id = None;
        instance.next_activation = None;
        assert!(!instance.is_claimable_at(u64::MAX));
    }
}
