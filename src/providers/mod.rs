//! Store abstraction for workflow instances, their action trail and the
//! executor table.
//!
//! Every piece of cross-process coordination is a conditional update against
//! the store: claiming, releasing, persisting (only while still owned),
//! waking an idle instance and reclaiming instances from expired executors.
//! Providers must make each of those atomic; the runtime never holds an
//! in-memory lock across processes.

use crate::{
    ExecutorInfo, ExternalChange, InstanceStatus, NewWorkflowAction, NewWorkflowInstance, WorkflowInstance,
    WorkflowInstanceAction,
};
use std::collections::BTreeMap;
use std::time::Duration;

pub mod error;
pub mod sqlite;

pub use error::{ProviderError, ProviderErrorKind};

/// Everything one processor iteration writes, committed as a single unit.
///
/// The instance update only applies while `owner` still holds the instance.
/// The action row and any new instances are written in the same transaction;
/// new instances get `parent_action_id` set to the new action's id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionCommit {
    pub instance_id: i64,
    /// Executor that must still own the row for the update to apply.
    pub owner: i64,
    pub state: String,
    pub state_text: Option<String>,
    pub status: InstanceStatus,
    /// Ownership after the commit: `Some(owner)` keeps the claim.
    pub executor_id: Option<i64>,
    pub next_activation: Option<u64>,
    pub retries: u32,
    pub business_key: Option<String>,
    /// Full variable set after the iteration.
    pub state_variables: BTreeMap<String, String>,
    /// Stamped on the first execution only.
    pub started: Option<u64>,
    pub action: Option<NewWorkflowAction>,
    pub new_instances: Vec<NewWorkflowInstance>,
}

/// Store operations consumed by the runtime and the client.
#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    /// Short provider name for logs.
    fn name(&self) -> &str;

    /// Clock used for every "now" comparison against stored timestamps.
    fn now(&self) -> u64 {
        crate::now_millis()
    }

    // ===== Instances =====

    /// Insert an instance, or return the id of the existing instance with the
    /// same `(workflow_type, external_id, executor_group)`.
    ///
    /// `instance.state` must be resolved by the caller.
    async fn create_instance(&self, instance: NewWorkflowInstance) -> Result<i64, ProviderError>;

    /// Load an instance with its current variables.
    async fn load_instance(&self, id: i64) -> Result<Option<WorkflowInstance>, ProviderError>;

    /// Action trail of an instance, oldest first.
    async fn list_actions(&self, instance_id: i64) -> Result<Vec<WorkflowInstanceAction>, ProviderError>;

    /// Instances whose `parent_workflow_id` is `parent_id`.
    async fn list_children(&self, parent_id: i64) -> Result<Vec<WorkflowInstance>, ProviderError>;

    // ===== Claim protocol =====

    /// Ids of unclaimed instances in `group` whose activation is due,
    /// highest priority first, then earliest activation.
    async fn poll_claimable_ids(&self, group: &str, limit: usize) -> Result<Vec<i64>, ProviderError>;

    /// Conditionally take ownership of a due, unclaimed instance.
    ///
    /// Returns `true` only if exactly this call changed the row.
    async fn claim(&self, id: i64, executor_id: i64) -> Result<bool, ProviderError>;

    /// Give up ownership held by `executor_id` without changing anything else.
    async fn release(&self, id: i64, executor_id: i64) -> Result<bool, ProviderError>;

    /// Atomically update the instance, append the action and insert new
    /// instances. Fails with a permanent error if `commit.owner` no longer owns
    /// the instance. Returns the id of the appended action.
    async fn persist(&self, commit: ExecutionCommit) -> Result<Option<i64>, ProviderError>;

    /// Set `next_activation = now` if the instance is unclaimed, not already
    /// due, and (for a non-empty `expected_states`) in one of those states.
    async fn wakeup_if_idle(&self, id: i64, expected_states: &[String]) -> Result<bool, ProviderError>;

    /// Apply an external change to an unclaimed instance and append an
    /// `ExternalChange` action. Returns `false` when the instance is claimed
    /// or missing.
    async fn apply_external_change(&self, id: i64, change: ExternalChange) -> Result<bool, ProviderError>;

    // ===== Executors =====

    /// Insert an executor row and return its id.
    async fn register_executor(
        &self,
        group: &str,
        host: &str,
        pid: u32,
        timeout: Duration,
    ) -> Result<i64, ProviderError>;

    /// `active = now`, `expires = now + timeout`.
    async fn heartbeat_executor(&self, executor_id: i64, timeout: Duration) -> Result<(), ProviderError>;

    /// Stamp `stopped = now` at graceful shutdown. With `expire` the row also
    /// expires now so peers reclaim leftovers at once; without it the
    /// existing expiry stands, since work may still be running.
    async fn mark_executor_stopped(&self, executor_id: i64, expire: bool) -> Result<(), ProviderError>;

    /// Release every instance owned by an expired executor of `group` other
    /// than `self_id`, appending a `Recovery` action per instance, and stamp
    /// `recovered` on those executors. Returns the released instance ids.
    async fn recover_expired_executors(&self, group: &str, self_id: i64) -> Result<Vec<i64>, ProviderError>;

    /// Executors registered in `group`, oldest first.
    async fn list_executors(&self, group: &str) -> Result<Vec<ExecutorInfo>, ProviderError>;
}
