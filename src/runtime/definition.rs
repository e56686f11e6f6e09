//! Per-type state machine: registered states, the transition graph,
//! retry settings and the state -> handler table.
//!
//! Definitions are assembled with [`WorkflowDefinition::builder`] and checked
//! once in [`WorkflowDefinitionBuilder::build`]; the processor relies on the
//! resulting structure being consistent.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use super::context::StateExecution;
use super::options::WorkflowSettings;

/// Kind of a workflow state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateType {
    Start,
    Normal,
    /// Final until changed from outside.
    Manual,
    End,
}

impl StateType {
    /// Manual and end states are final: the processor stops there.
    pub fn is_final(&self) -> bool {
        matches!(self, StateType::Manual | StateType::End)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowState {
    pub name: String,
    pub state_type: StateType,
    pub description: Option<String>,
}

/// Error returned by a state handler.
///
/// Retryable errors go through the backoff policy; permanent ones skip
/// straight to the failure or error state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateError {
    pub message: String,
    pub retryable: bool,
}

impl StateError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for StateError {}

impl From<String> for StateError {
    fn from(message: String) -> Self {
        Self::retryable(message)
    }
}

impl From<&str> for StateError {
    fn from(message: &str) -> Self {
        Self::retryable(message)
    }
}

/// What a transition handler asks the processor to do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextAction {
    /// Move to `state`, activating at `activation` (now when `None`).
    MoveToState {
        state: String,
        reason: String,
        activation: Option<u64>,
    },
    /// Stay in the current state and run it again at `activation`.
    /// Counts as a retry.
    RetryAfter { activation: u64, reason: String },
    /// Move to `state` and never activate again.
    StopInState { state: String, reason: String },
}

impl NextAction {
    pub fn move_to_state(state: impl Into<String>, reason: impl Into<String>) -> Self {
        NextAction::MoveToState {
            state: state.into(),
            reason: reason.into(),
            activation: None,
        }
    }

    pub fn move_to_state_after(state: impl Into<String>, activation: u64, reason: impl Into<String>) -> Self {
        NextAction::MoveToState {
            state: state.into(),
            reason: reason.into(),
            activation: Some(activation),
        }
    }

    pub fn retry_after(activation: u64, reason: impl Into<String>) -> Self {
        NextAction::RetryAfter {
            activation,
            reason: reason.into(),
        }
    }

    pub fn stop_in_state(state: impl Into<String>, reason: impl Into<String>) -> Self {
        NextAction::StopInState {
            state: state.into(),
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            NextAction::MoveToState { reason, .. }
            | NextAction::RetryAfter { reason, .. }
            | NextAction::StopInState { reason, .. } => reason,
        }
    }

    /// Target state, if the action changes state.
    pub fn target_state(&self) -> Option<&str> {
        match self {
            NextAction::MoveToState { state, .. } | NextAction::StopInState { state, .. } => Some(state),
            NextAction::RetryAfter { .. } => None,
        }
    }
}

/// Handler of a non-final state.
#[async_trait]
pub trait TransitionHandler: Send + Sync {
    async fn execute(&self, ctx: StateExecution) -> Result<NextAction, StateError>;
}

/// Handler of a final state. Runs once on arrival; the instance stays there.
#[async_trait]
pub trait FinalHandler: Send + Sync {
    async fn execute(&self, ctx: StateExecution) -> Result<(), StateError>;
}

/// Function wrapper that implements `TransitionHandler`.
pub struct FnTransition<F, Fut>(pub F)
where
    F: Fn(StateExecution) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<NextAction, StateError>> + Send + 'static;

#[async_trait]
impl<F, Fut> TransitionHandler for FnTransition<F, Fut>
where
    F: Fn(StateExecution) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<NextAction, StateError>> + Send + 'static,
{
    async fn execute(&self, ctx: StateExecution) -> Result<NextAction, StateError> {
        (self.0)(ctx).await
    }
}

/// Function wrapper that implements `FinalHandler`.
pub struct FnFinal<F, Fut>(pub F)
where
    F: Fn(StateExecution) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), StateError>> + Send + 'static;

#[async_trait]
impl<F, Fut> FinalHandler for FnFinal<F, Fut>
where
    F: Fn(StateExecution) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), StateError>> + Send + 'static,
{
    async fn execute(&self, ctx: StateExecution) -> Result<(), StateError> {
        (self.0)(ctx).await
    }
}

#[derive(Clone)]
pub enum StateHandler {
    Transition(Arc<dyn TransitionHandler>),
    Final(Arc<dyn FinalHandler>),
}

impl StateHandler {
    pub fn is_final(&self) -> bool {
        matches!(self, StateHandler::Final(_))
    }
}

impl fmt::Debug for StateHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateHandler::Transition(_) => f.write_str("StateHandler::Transition"),
            StateHandler::Final(_) => f.write_str("StateHandler::Final"),
        }
    }
}

/// Immutable state machine of one workflow type.
pub struct WorkflowDefinition {
    workflow_type: String,
    description: Option<String>,
    initial_state: String,
    error_state: String,
    states: Vec<WorkflowState>,
    allowed_transitions: HashMap<String, Vec<String>>,
    failure_transitions: HashMap<String, String>,
    settings: WorkflowSettings,
    handlers: HashMap<String, StateHandler>,
}

impl fmt::Debug for WorkflowDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowDefinition")
            .field("workflow_type", &self.workflow_type)
            .field("initial_state", &self.initial_state)
            .field("error_state", &self.error_state)
            .field("states", &self.states)
            .field("allowed_transitions", &self.allowed_transitions)
            .field("failure_transitions", &self.failure_transitions)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl WorkflowDefinition {
    pub fn builder(workflow_type: impl Into<String>) -> WorkflowDefinitionBuilder {
        WorkflowDefinitionBuilder {
            workflow_type: workflow_type.into(),
            description: None,
            initial_state: None,
            error_state: None,
            states: Vec::new(),
            allowed_transitions: HashMap::new(),
            failure_transitions: HashMap::new(),
            settings: WorkflowSettings::default(),
            handlers: HashMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn workflow_type(&self) -> &str {
        &self.workflow_type
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn initial_state(&self) -> &str {
        &self.initial_state
    }

    pub fn error_state(&self) -> &str {
        &self.error_state
    }

    pub fn settings(&self) -> &WorkflowSettings {
        &self.settings
    }

    pub fn states(&self) -> &[WorkflowState] {
        &self.states
    }

    pub fn state(&self, name: &str) -> Option<&WorkflowState> {
        self.states.iter().find(|s| s.name == name)
    }

    /// Unknown states are treated as non-final.
    pub fn is_final(&self, name: &str) -> bool {
        self.state(name).is_some_and(|s| s.state_type.is_final())
    }

    pub fn allowed_transitions(&self, from: &str) -> &[String] {
        self.allowed_transitions.get(from).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn failure_state_of(&self, state: &str) -> Option<&str> {
        self.failure_transitions.get(state).map(String::as_str)
    }

    /// Whether a handler running in `current` may move the instance to `next`.
    pub fn is_allowed_next_action(&self, current: &str, next: &str) -> bool {
        next == current
            || self.allowed_transitions(current).iter().any(|s| s == next)
            || self.failure_state_of(current) == Some(next)
            || next == self.error_state
    }

    /// `None` is valid only for final states.
    pub fn handler(&self, state: &str) -> Option<&StateHandler> {
        self.handlers.get(state)
    }
}

/// Builder collecting registration errors; see [`WorkflowDefinitionBuilder::build`].
pub struct WorkflowDefinitionBuilder {
    workflow_type: String,
    description: Option<String>,
    initial_state: Option<String>,
    error_state: Option<String>,
    states: Vec<WorkflowState>,
    allowed_transitions: HashMap<String, Vec<String>>,
    failure_transitions: HashMap<String, String>,
    settings: WorkflowSettings,
    handlers: HashMap<String, StateHandler>,
    errors: Vec<String>,
}

impl WorkflowDefinitionBuilder {
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn register_state(self, name: impl Into<String>, state_type: StateType) -> Self {
        self.register_state_described(name, state_type, None::<String>)
    }

    pub fn register_state_described(
        mut self,
        name: impl Into<String>,
        state_type: StateType,
        description: Option<impl Into<String>>,
    ) -> Self {
        let name = name.into();
        if name.is_empty() {
            self.errors.push("state name must not be empty".to_string());
        } else if self.states.iter().any(|s| s.name == name) {
            self.errors.push(format!("duplicate state registration: {name}"));
        } else {
            self.states.push(WorkflowState {
                name,
                state_type,
                description: description.map(Into::into),
            });
        }
        self
    }

    pub fn initial_state(mut self, name: impl Into<String>) -> Self {
        self.initial_state = Some(name.into());
        self
    }

    pub fn error_state(mut self, name: impl Into<String>) -> Self {
        self.error_state = Some(name.into());
        self
    }

    pub fn permit(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        let targets = self.allowed_transitions.entry(from.into()).or_default();
        let to = to.into();
        if !targets.contains(&to) {
            targets.push(to);
        }
        self
    }

    /// Permit `from -> to` and route `from` to `on_failure` once its retries are exhausted.
    pub fn permit_with_failure(
        mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        on_failure: impl Into<String>,
    ) -> Self {
        let from = from.into();
        let on_failure = on_failure.into();
        match self.failure_transitions.get(&from) {
            Some(existing) if *existing != on_failure => {
                self.errors.push(format!(
                    "conflicting failure states for {from}: {existing} and {on_failure}"
                ));
            }
            _ => {
                self.failure_transitions.insert(from.clone(), on_failure);
            }
        }
        self.permit(from, to)
    }

    /// Replace the workflow settings. Per-state busy-loop limits set earlier
    /// with [`max_subsequent_executions`](Self::max_subsequent_executions)
    /// are kept unless `settings` names the same state.
    pub fn settings(mut self, mut settings: WorkflowSettings) -> Self {
        let earlier = std::mem::take(&mut self.settings.max_subsequent_state_executions_per_state);
        for (state, limit) in earlier {
            settings
                .max_subsequent_state_executions_per_state
                .entry(state)
                .or_insert(limit);
        }
        self.settings = settings;
        self
    }

    /// Per-state busy-loop limit.
    pub fn max_subsequent_executions(mut self, state: impl Into<String>, limit: u32) -> Self {
        self.settings
            .max_subsequent_state_executions_per_state
            .insert(state.into(), limit);
        self
    }

    pub fn on_state<F, Fut>(self, state: impl Into<String>, f: F) -> Self
    where
        F: Fn(StateExecution) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<NextAction, StateError>> + Send + 'static,
    {
        self.on_state_handler(state, Arc::new(FnTransition(f)))
    }

    pub fn on_state_handler(self, state: impl Into<String>, handler: Arc<dyn TransitionHandler>) -> Self {
        self.add_handler(state.into(), StateHandler::Transition(handler))
    }

    pub fn on_final_state<F, Fut>(self, state: impl Into<String>, f: F) -> Self
    where
        F: Fn(StateExecution) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), StateError>> + Send + 'static,
    {
        self.on_final_state_handler(state, Arc::new(FnFinal(f)))
    }

    pub fn on_final_state_handler(self, state: impl Into<String>, handler: Arc<dyn FinalHandler>) -> Self {
        self.add_handler(state.into(), StateHandler::Final(handler))
    }

    fn add_handler(mut self, state: String, handler: StateHandler) -> Self {
        if self.handlers.contains_key(&state) {
            self.errors.push(format!("duplicate handler for state: {state}"));
        } else {
            self.handlers.insert(state, handler);
        }
        self
    }

    /// Validate and freeze the definition.
    ///
    /// # Errors
    ///
    /// Returns every problem found, joined by `"; "`.
    pub fn build(self) -> Result<WorkflowDefinition, String> {
        let mut errors = self.errors;
        let prefix = &self.workflow_type;
        if prefix.is_empty() {
            errors.push("workflow type must not be empty".to_string());
        }

        let types: HashMap<&str, StateType> = self.states.iter().map(|s| (s.name.as_str(), s.state_type)).collect();
        let mut referenced: HashSet<&str> = HashSet::new();

        match self.initial_state.as_deref() {
            None => errors.push("initial state is not set".to_string()),
            Some(initial) => match types.get(initial) {
                None => errors.push(format!("initial state {initial} is not registered")),
                Some(t) if t.is_final() => errors.push(format!("initial state {initial} must not be final")),
                Some(_) => {}
            },
        }
        match self.error_state.as_deref() {
            None => errors.push("error state is not set".to_string()),
            Some(error) => {
                referenced.insert(error);
            }
        }

        for (from, targets) in &self.allowed_transitions {
            referenced.insert(from);
            referenced.extend(targets.iter().map(String::as_str));
        }
        for (from, to) in &self.failure_transitions {
            referenced.insert(from);
            referenced.insert(to);
        }
        referenced.extend(
            self.settings
                .max_subsequent_state_executions_per_state
                .keys()
                .map(String::as_str),
        );
        let mut unregistered: Vec<&str> = referenced.into_iter().filter(|s| !types.contains_key(s)).collect();
        unregistered.sort_unstable();
        for state in unregistered {
            errors.push(format!("state {state} is referenced but not registered"));
        }

        for state in &self.states {
            match (self.handlers.get(&state.name), state.state_type.is_final()) {
                (None, false) => errors.push(format!("non-final state {} has no handler", state.name)),
                (Some(StateHandler::Final(_)), false) => {
                    errors.push(format!("non-final state {} has a final handler", state.name))
                }
                (Some(StateHandler::Transition(_)), true) => {
                    errors.push(format!("final state {} has a transition handler", state.name))
                }
                _ => {}
            }
        }
        let mut orphan_handlers: Vec<&str> = self
            .handlers
            .keys()
            .map(String::as_str)
            .filter(|s| !types.contains_key(s))
            .collect();
        orphan_handlers.sort_unstable();
        for state in orphan_handlers {
            errors.push(format!("handler registered for unknown state {state}"));
        }

        if let Err(e) = self.settings.validate() {
            errors.push(e);
        }

        if !errors.is_empty() {
            return Err(format!("workflow {prefix}: {}", errors.join("; ")));
        }

        Ok(WorkflowDefinition {
            workflow_type: self.workflow_type,
            description: self.description,
            initial_state: self.initial_state.unwrap_or_default(),
            error_state: self.error_state.unwrap_or_default(),
            states: self.states,
            allowed_transitions: self.allowed_transitions,
            failure_transitions: self.failure_transitions,
            settings: self.settings,
            handlers: self.handlers,
        })
    }
}
