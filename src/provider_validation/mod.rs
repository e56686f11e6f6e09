//! Provider Validation Tests
//!
//! Suites that work against any provider through [`ProviderFactory`](crate::provider_validations::ProviderFactory).

pub mod claiming;
pub mod executors;
pub mod instance_creation;
pub mod persistence;
pub mod wakeup;

use crate::providers::{ExecutionCommit, Provider};
use crate::{ActionType, InstanceStatus, NewWorkflowAction, NewWorkflowInstance};
use std::collections::BTreeMap;

pub(crate) const TEST_TYPE: &str = "ValidationFlow";

/// A due instance of [`TEST_TYPE`] in state `begin`.
pub(crate) fn new_instance(external_id: &str) -> NewWorkflowInstance {
    NewWorkflowInstance::new(TEST_TYPE)
        .with_external_id(external_id)
        .with_state("begin")
}

/// Create and claim an instance, returning its id.
pub(crate) async fn create_claimed(provider: &dyn Provider, external_id: &str, owner: i64) -> i64 {
    let id = provider.create_instance(new_instance(external_id)).await.unwrap();
    assert!(provider.claim(id, owner).await.unwrap(), "fresh instance must be claimable");
    id
}

/// Commit moving `instance_id` to `state`, parking it and releasing the claim.
pub(crate) fn park_commit(instance_id: i64, owner: i64, state: &str) -> ExecutionCommit {
    ExecutionCommit {
        instance_id,
        owner,
        state: state.to_string(),
        state_text: Some(format!("moved to {state}")),
        status: InstanceStatus::InProgress,
        executor_id: None,
        next_activation: None,
        retries: 0,
        business_key: None,
        state_variables: BTreeMap::new(),
        started: None,
        action: None,
        new_instances: Vec::new(),
    }
}

pub(crate) fn execution_action(owner: i64, state: &str) -> NewWorkflowAction {
    NewWorkflowAction {
        executor_id: Some(owner),
        state: state.to_string(),
        state_text: None,
        action_type: ActionType::StateExecution,
        retry_no: 0,
        execution_start: 1,
        execution_end: 2,
        updated_state_variables: BTreeMap::new(),
    }
}
