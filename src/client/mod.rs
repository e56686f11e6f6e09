use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::providers::{Provider, ProviderError};
use crate::runtime::WorkflowRegistry;
use crate::{
    ExecutorInfo, ExternalChange, InstanceStatus, NewWorkflowInstance, WorkflowInstance, WorkflowInstanceAction,
};

/// Errors returned by [`Client`] operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    Provider(ProviderError),
    /// The request cannot be served as given (unknown type, missing state, ...).
    InvalidRequest(String),
    /// `wait_for_status` gave up.
    Timeout { instance_id: i64, last_status: Option<InstanceStatus> },
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Provider(e) => write!(f, "{e}"),
            ClientError::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
            ClientError::Timeout {
                instance_id,
                last_status,
            } => match last_status {
                Some(status) => write!(f, "timed out waiting for instance {instance_id} (last status {status})"),
                None => write!(f, "timed out waiting for instance {instance_id} (not found)"),
            },
        }
    }
}

impl std::error::Error for ClientError {}

impl From<ProviderError> for ClientError {
    fn from(e: ProviderError) -> Self {
        ClientError::Provider(e)
    }
}

/// Control-plane access to workflow instances.
///
/// The client talks only to the shared store; it never contacts a runtime.
/// Attach a [`WorkflowRegistry`] to let it resolve initial states and reject
/// unknown workflow types up front.
#[derive(Clone)]
pub struct Client {
    store: Arc<dyn Provider>,
    workflows: Option<WorkflowRegistry>,
}

impl Client {
    pub fn new(store: Arc<dyn Provider>) -> Self {
        Self { store, workflows: None }
    }

    pub fn with_workflows(mut self, workflows: WorkflowRegistry) -> Self {
        self.workflows = Some(workflows);
        self
    }

    /// Create a workflow instance, or return the id of the existing one with
    /// the same type, external id and executor group.
    ///
    /// Without an explicit state the definition's initial state is used.
    pub async fn create_workflow(&self, mut instance: NewWorkflowInstance) -> Result<i64, ClientError> {
        if let Some(workflows) = &self.workflows {
            let definition = workflows.get(&instance.workflow_type).ok_or_else(|| {
                ClientError::InvalidRequest(format!("unknown workflow type {}", instance.workflow_type))
            })?;
            match &instance.state {
                Some(state) if definition.state(state).is_none() => {
                    return Err(ClientError::InvalidRequest(format!(
                        "workflow type {} has no state {state}",
                        instance.workflow_type
                    )));
                }
                Some(_) => {}
                None => instance.state = Some(definition.initial_state().to_string()),
            }
        } else if instance.state.is_none() {
            return Err(ClientError::InvalidRequest(format!(
                "no initial state given for {} and no workflow registry attached",
                instance.workflow_type
            )));
        }

        let workflow_type = instance.workflow_type.clone();
        let id = self.store.create_instance(instance).await?;
        info!(target: "durastate::client", instance_id = id, workflow_type = %workflow_type, "Workflow created");
        Ok(id)
    }

    pub async fn get_workflow(&self, id: i64) -> Result<Option<WorkflowInstance>, ClientError> {
        Ok(self.store.load_instance(id).await?)
    }

    pub async fn list_actions(&self, id: i64) -> Result<Vec<WorkflowInstanceAction>, ClientError> {
        Ok(self.store.list_actions(id).await?)
    }

    pub async fn list_children(&self, id: i64) -> Result<Vec<WorkflowInstance>, ClientError> {
        Ok(self.store.list_children(id).await?)
    }

    pub async fn list_executors(&self, group: &str) -> Result<Vec<ExecutorInfo>, ClientError> {
        Ok(self.store.list_executors(group).await?)
    }

    /// Make an idle instance due now. An empty `expected_states` matches any state.
    ///
    /// Returns `false` if the instance is claimed, already due, missing, or in
    /// another state.
    pub async fn wakeup(&self, id: i64, expected_states: &[String]) -> Result<bool, ClientError> {
        let woken = self.store.wakeup_if_idle(id, expected_states).await?;
        debug!(target: "durastate::client", instance_id = id, woken, "Wakeup requested");
        Ok(woken)
    }

    /// Apply an external change to an instance no executor currently holds.
    ///
    /// Returns `false` if the instance is claimed or missing.
    pub async fn update_workflow(&self, id: i64, change: ExternalChange) -> Result<bool, ClientError> {
        if let (Some(workflows), Some(state)) = (&self.workflows, &change.state) {
            if let Some(instance) = self.store.load_instance(id).await? {
                let known = workflows
                    .get(&instance.workflow_type)
                    .is_some_and(|definition| definition.state(state).is_some());
                if !known {
                    return Err(ClientError::InvalidRequest(format!(
                        "workflow type {} has no state {state}",
                        instance.workflow_type
                    )));
                }
            }
        }
        let applied = self.store.apply_external_change(id, change).await?;
        info!(target: "durastate::client", instance_id = id, applied, "External change");
        Ok(applied)
    }

    /// Poll until the instance reaches one of `statuses`.
    pub async fn wait_for_status(
        &self,
        id: i64,
        statuses: &[InstanceStatus],
        timeout: Duration,
    ) -> Result<WorkflowInstance, ClientError> {
        let deadline = Instant::now() + timeout;
        let mut delay = Duration::from_millis(5);
        loop {
            let instance = self.store.load_instance(id).await?;
            if let Some(instance) = &instance {
                if statuses.contains(&instance.status) {
                    return Ok(instance.clone());
                }
            }
            if Instant::now() >= deadline {
                return Err(ClientError::Timeout {
                    instance_id: id,
                    last_status: instance.map(|i| i.status),
                });
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(Duration::from_millis(100));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::sqlite::SqliteProvider;
    use crate::runtime::{NextAction, StateType, WorkflowDefinition};

    fn registry() -> WorkflowRegistry {
        let definition = WorkflowDefinition::builder("order")
            .register_state("begin", StateType::Start)
            .register_state("done", StateType::End)
            .register_state("error", StateType::Manual)
            .initial_state("begin")
            .error_state("error")
            .permit("begin", "done")
            .on_state("begin", |_ctx| async move { Ok(NextAction::move_to_state("done", "ok")) })
            .build()
            .unwrap();
        WorkflowRegistry::builder().register(definition).build()
    }

    async fn client() -> Client {
        let store: Arc<dyn Provider> = Arc::new(SqliteProvider::new_in_memory().await.unwrap());
        Client::new(store).with_workflows(registry())
    }

    #[tokio::test]
    async fn test_create_resolves_initial_state() {
        let client = client().await;
        let id = client
            .create_workflow(NewWorkflowInstance::new("order").with_external_id("o-1"))
            .await
            .unwrap();
        let instance = client.get_workflow(id).await.unwrap().unwrap();
        assert_eq!(instance.state, "begin");
        assert_eq!(instance.status, InstanceStatus::Created);

        let again = client
            .create_workflow(NewWorkflowInstance::new("order").with_external_id("o-1"))
            .await
            .unwrap();
        assert_eq!(id, again);
    }

    #[tokio::test]
    async fn test_create_rejects_unknown_type_and_state() {
        let client = client().await;
        let err = client
            .create_workflow(NewWorkflowInstance::new("refund"))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidRequest(_)));

        let err = client
            .create_workflow(NewWorkflowInstance::new("order").with_state("shipping"))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_create_without_registry_needs_state() {
        let store: Arc<dyn Provider> = Arc::new(SqliteProvider::new_in_memory().await.unwrap());
        let client = Client::new(store);
        assert!(client.create_workflow(NewWorkflowInstance::new("order")).await.is_err());
        assert!(
            client
                .create_workflow(NewWorkflowInstance::new("order").with_state("begin"))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_update_workflow_records_external_change() {
        let client = client().await;
        let id = client.create_workflow(NewWorkflowInstance::new("order")).await.unwrap();
        let change = ExternalChange {
            state: Some("done".to_string()),
            state_text: Some("closed by operator".to_string()),
            ..Default::default()
        };
        assert!(client.update_workflow(id, change).await.unwrap());

        let instance = client.get_workflow(id).await.unwrap().unwrap();
        assert_eq!(instance.state, "done");
        let actions = client.list_actions(id).await.unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].action_type, crate::ActionType::ExternalChange);

        let bad = ExternalChange {
            state: Some("shipping".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            client.update_workflow(id, bad).await,
            Err(ClientError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_wait_for_status_times_out() {
        let client = client().await;
        let id = client.create_workflow(NewWorkflowInstance::new("order")).await.unwrap();
        let err = client
            .wait_for_status(id, &[InstanceStatus::Finished], Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ClientError::Timeout {
                instance_id: id,
                last_status: Some(InstanceStatus::Created)
            }
        );
    }
}
