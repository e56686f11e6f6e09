use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use super::definition::StateError;
use crate::{NewWorkflowInstance, WorkflowInstance};

/// Handler view of one state execution.
///
/// Cheap to clone; all clones share the same variables and side effects.
/// Reads see writes made earlier in the same execution.
#[derive(Clone)]
pub struct StateExecution {
    inner: Arc<Mutex<ExecutionInner>>,
}

struct ExecutionInner {
    instance: WorkflowInstance,
    executor_id: i64,
    variables: BTreeMap<String, String>,
    changed: BTreeMap<String, String>,
    business_key: Option<String>,
    new_workflows: Vec<NewWorkflowInstance>,
    wakeup_parent: Option<Vec<String>>,
    create_action: bool,
}

/// Side effects collected from a handler run.
#[derive(Debug, Clone, Default)]
pub(crate) struct ExecutionEffects {
    pub variables: BTreeMap<String, String>,
    pub changed: BTreeMap<String, String>,
    pub business_key: Option<String>,
    pub new_workflows: Vec<NewWorkflowInstance>,
    pub wakeup_parent: Option<Vec<String>>,
    pub create_action: bool,
}

impl StateExecution {
    pub(crate) fn new(instance: WorkflowInstance, executor_id: i64) -> Self {
        let variables = instance.state_variables.clone();
        let business_key = instance.business_key.clone();
        Self {
            inner: Arc::new(Mutex::new(ExecutionInner {
                instance,
                executor_id,
                variables,
                changed: BTreeMap::new(),
                business_key,
                new_workflows: Vec::new(),
                wakeup_parent: None,
                create_action: true,
            })),
        }
    }

    fn with_inner<R>(&self, f: impl FnOnce(&mut ExecutionInner) -> R) -> R {
        let mut inner = self.inner.lock().expect("Mutex should not be poisoned");
        f(&mut inner)
    }

    pub fn workflow_instance_id(&self) -> i64 {
        self.with_inner(|i| i.instance.id)
    }

    pub fn workflow_type(&self) -> String {
        self.with_inner(|i| i.instance.workflow_type.clone())
    }

    pub fn external_id(&self) -> String {
        self.with_inner(|i| i.instance.external_id.clone())
    }

    pub fn executor_group(&self) -> String {
        self.with_inner(|i| i.instance.executor_group.clone())
    }

    pub fn executor_id(&self) -> i64 {
        self.with_inner(|i| i.executor_id)
    }

    /// State being executed.
    pub fn current_state(&self) -> String {
        self.with_inner(|i| i.instance.state.clone())
    }

    /// Failed attempts so far in the current state.
    pub fn retries(&self) -> u32 {
        self.with_inner(|i| i.instance.retries)
    }

    pub fn is_retry(&self) -> bool {
        self.retries() > 0
    }

    pub fn parent_workflow_id(&self) -> Option<i64> {
        self.with_inner(|i| i.instance.parent_workflow_id)
    }

    pub fn business_key(&self) -> Option<String> {
        self.with_inner(|i| i.business_key.clone())
    }

    pub fn set_business_key(&self, business_key: impl Into<String>) {
        let business_key = business_key.into();
        self.with_inner(|i| i.business_key = Some(business_key));
    }

    pub fn get_variable(&self, key: &str) -> Option<String> {
        self.with_inner(|i| i.variables.get(key).cloned())
    }

    pub fn get_variable_or(&self, key: &str, default: impl Into<String>) -> String {
        self.get_variable(key).unwrap_or_else(|| default.into())
    }

    /// Deserialize a JSON-encoded variable.
    ///
    /// # Errors
    ///
    /// Permanent [`StateError`] when the stored value does not decode as `T`.
    pub fn get_variable_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StateError> {
        self.get_variable(key)
            .map(|raw| {
                serde_json::from_str(&raw)
                    .map_err(|e| StateError::permanent(format!("variable {key} does not decode: {e}")))
            })
            .transpose()
    }

    /// Set a variable. Writing the value it already has is not a change.
    pub fn set_variable(&self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        self.with_inner(|i| {
            if i.variables.get(&key) == Some(&value) {
                return;
            }
            i.variables.insert(key.clone(), value.clone());
            i.changed.insert(key, value);
        });
    }

    /// Store `value` as JSON.
    pub fn set_variable_as<T: Serialize + ?Sized>(&self, key: impl Into<String>, value: &T) -> Result<(), StateError> {
        let encoded =
            serde_json::to_string(value).map_err(|e| StateError::permanent(format!("variable does not encode: {e}")))?;
        self.set_variable(key, encoded);
        Ok(())
    }

    pub fn variables(&self) -> BTreeMap<String, String> {
        self.with_inner(|i| i.variables.clone())
    }

    /// Variables changed so far in this execution.
    pub fn changed_variables(&self) -> BTreeMap<String, String> {
        self.with_inner(|i| i.changed.clone())
    }

    /// Create a child workflow, committed together with this execution.
    ///
    /// The child inherits this instance's executor group unless one is set,
    /// and starts in its type's initial state unless `state` is set.
    pub fn add_child_workflow(&self, mut child: NewWorkflowInstance) {
        self.with_inner(|i| {
            child.parent_workflow_id = Some(i.instance.id);
            if child.executor_group.is_none() {
                child.executor_group = Some(i.instance.executor_group.clone());
            }
            i.new_workflows.push(child);
        });
    }

    /// Create an unrelated workflow, committed together with this execution.
    pub fn add_workflow(&self, mut workflow: NewWorkflowInstance) {
        self.with_inner(|i| {
            if workflow.executor_group.is_none() {
                workflow.executor_group = Some(i.instance.executor_group.clone());
            }
            i.new_workflows.push(workflow);
        });
    }

    /// After commit, wake the parent if it is idle and (when any are given)
    /// in one of `expected_states`.
    pub fn wakeup_parent_workflow<I, S>(&self, expected_states: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let states: Vec<String> = expected_states.into_iter().map(Into::into).collect();
        self.with_inner(|i| i.wakeup_parent = Some(states));
    }

    /// Skip the audit row for this execution. Variable changes, new
    /// workflows and failures still produce one.
    pub fn set_create_action(&self, create_action: bool) {
        self.with_inner(|i| i.create_action = create_action);
    }

    /// Whether the parent wakeup was requested.
    pub fn is_wakeup_parent_requested(&self) -> bool {
        self.with_inner(|i| i.wakeup_parent.is_some())
    }

    /// Move the collected side effects out. Later handler clones start from empty.
    pub(crate) fn take_effects(&self) -> ExecutionEffects {
        self.with_inner(|i| ExecutionEffects {
            variables: i.variables.clone(),
            changed: std::mem::take(&mut i.changed),
            business_key: i.business_key.clone(),
            new_workflows: std::mem::take(&mut i.new_workflows),
            wakeup_parent: i.wakeup_parent.take(),
            create_action: i.create_action,
        })
    }
}
