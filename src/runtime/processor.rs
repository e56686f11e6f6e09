//! Drives one claimed instance until it yields.
//!
//! Each iteration loads the instance, runs the handler of its current state,
//! decides the next state, activation and retry count, and commits all of it
//! (instance row, action row, new workflows) in one store call. While the
//! outcome is `Executing` the loop continues in-process without releasing the
//! claim; the busy-loop breaker bounds how long that can go on.

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};

use super::backoff::{self, RetryDecision};
use super::context::{ExecutionEffects, StateExecution};
use super::definition::{NextAction, StateError, StateHandler, StateType, WorkflowDefinition};
use super::listener::{ExecutionOutcome, ListenerChain, ListenerContext};
use super::observability::RuntimeMetrics;
use super::options::{IllegalTransitionPolicy, RuntimeOptions};
use super::registry::WorkflowRegistry;
use super::worker_pool::InFlightGuard;
use crate::providers::{ExecutionCommit, Provider, ProviderError};
use crate::{ActionType, InstanceStatus, NewWorkflowAction, NewWorkflowInstance, WorkflowInstance};

/// Why the processor stopped looping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Committed with a future activation or none at all; claim released.
    Yielded,
    /// Type or state unknown here; rescheduled and released.
    Rescheduled,
    /// Another executor owns the instance now (recovered while we were slow).
    NotOwned,
    /// The instance row no longer exists.
    Missing,
}

/// Status implied by the next activation and the type of the next state.
pub fn derive_status(next_activation: Option<u64>, state_type: Option<StateType>, now: u64) -> InstanceStatus {
    match next_activation {
        Some(at) if at <= now => InstanceStatus::Executing,
        Some(_) => InstanceStatus::InProgress,
        None => match state_type {
            Some(StateType::Manual) => InstanceStatus::Manual,
            Some(StateType::End) => InstanceStatus::Finished,
            _ => InstanceStatus::InProgress,
        },
    }
}

pub struct StateProcessor {
    store: Arc<dyn Provider>,
    workflows: WorkflowRegistry,
    options: Arc<RuntimeOptions>,
    listeners: ListenerChain,
    metrics: Arc<RuntimeMetrics>,
    shutting_down: Arc<AtomicBool>,
    executor_id: i64,
}

/// Decision for one execution, before commit.
struct Transition {
    state: String,
    state_text: Option<String>,
    next_activation: Option<u64>,
    retries: u32,
}

impl StateProcessor {
    pub fn new(
        store: Arc<dyn Provider>,
        workflows: WorkflowRegistry,
        options: Arc<RuntimeOptions>,
        listeners: ListenerChain,
        metrics: Arc<RuntimeMetrics>,
        shutting_down: Arc<AtomicBool>,
        executor_id: i64,
    ) -> Self {
        Self {
            store,
            workflows,
            options,
            listeners,
            metrics,
            shutting_down,
            executor_id,
        }
    }

    pub fn executor_id(&self) -> i64 {
        self.executor_id
    }

    /// Run `instance_id`, which this executor must have claimed, until it yields.
    ///
    /// # Errors
    ///
    /// Store failures. The claim may still be held when this returns an error.
    pub async fn process(&self, instance_id: i64, guard: &InFlightGuard) -> Result<ProcessOutcome, ProviderError> {
        let mut subsequent_executions = 0u32;
        loop {
            let Some(instance) = self.store.load_instance(instance_id).await? else {
                warn!(
                    target: "durastate::runtime::processor",
                    instance_id,
                    "Claimed instance no longer exists"
                );
                return Ok(ProcessOutcome::Missing);
            };
            if instance.executor_id != Some(self.executor_id) {
                warn!(
                    target: "durastate::runtime::processor",
                    instance_id,
                    executor_id = self.executor_id,
                    owner = ?instance.executor_id,
                    "Instance is no longer owned by this executor"
                );
                return Ok(ProcessOutcome::NotOwned);
            }
            guard.set_state(&instance.state);

            let Some(definition) = self.workflows.get(&instance.workflow_type) else {
                let text = format!("Unsupported workflow type {}", instance.workflow_type);
                self.reschedule_unknown(instance, text).await?;
                return Ok(ProcessOutcome::Rescheduled);
            };
            if definition.state(&instance.state).is_none() {
                let text = format!("Unsupported workflow state {}", instance.state);
                self.reschedule_unknown(instance, text).await?;
                return Ok(ProcessOutcome::Rescheduled);
            }

            let status = self
                .execute_state(&definition, instance, &mut subsequent_executions)
                .await?;
            if status != InstanceStatus::Executing {
                return Ok(ProcessOutcome::Yielded);
            }
        }
    }

    async fn reschedule_unknown(&self, instance: WorkflowInstance, text: String) -> Result<(), ProviderError> {
        let retry_at = self
            .store
            .now()
            .saturating_add(self.options.unknown_workflow_retry_delay.as_millis() as u64);
        warn!(
            target: "durastate::runtime::processor",
            instance_id = instance.id,
            workflow_type = %instance.workflow_type,
            state = %instance.state,
            retry_at,
            "{text}, rescheduling"
        );
        self.store
            .persist(ExecutionCommit {
                instance_id: instance.id,
                owner: self.executor_id,
                state: instance.state,
                state_text: Some(text),
                status: InstanceStatus::InProgress,
                executor_id: None,
                next_activation: Some(retry_at),
                retries: instance.retries,
                business_key: instance.business_key,
                state_variables: instance.state_variables,
                started: instance.started,
                action: None,
                new_instances: Vec::new(),
            })
            .await?;
        self.metrics.record_unknown_reschedule();
        Ok(())
    }

    /// One handler invocation plus its commit. Returns the committed status.
    async fn execute_state(
        &self,
        definition: &WorkflowDefinition,
        instance: WorkflowInstance,
        subsequent_executions: &mut u32,
    ) -> Result<InstanceStatus, ProviderError> {
        let execution_start = self.store.now();
        let executed_state = instance.state.clone();
        let retries_before = instance.retries;
        let listener_ctx = ListenerContext {
            instance: instance.clone(),
            executor_id: self.executor_id,
            execution_start,
        };
        self.listeners.before_processing(&listener_ctx);

        let ctx = StateExecution::new(instance.clone(), self.executor_id);
        let mut result = self.invoke_handler(definition, &executed_state, ctx.clone()).await;
        let mut effects = ctx.take_effects();

        if result.is_ok() {
            if let Err(e) = self.resolve_new_workflows(&mut effects.new_workflows) {
                result = Err(e);
            }
        }
        let failure = result.as_ref().err().cloned();
        if failure.is_some() {
            // A failed execution does not spawn workflows or wake its parent
            effects.new_workflows.clear();
            effects.wakeup_parent = None;
        }

        let now = self.store.now();
        let mut transition = match result {
            Err(err) => self.after_failure(definition, &instance, &err, now),
            Ok(Some(next)) => self.after_success(definition, &instance, next, now),
            Ok(None) => Transition {
                state: executed_state.clone(),
                state_text: instance.state_text.clone(),
                next_activation: None,
                retries: 0,
            },
        };

        // Busy-loop breaker
        let zero_delay = transition.next_activation.is_some_and(|at| at <= now);
        if zero_delay {
            *subsequent_executions += 1;
            let limit = definition
                .settings()
                .max_subsequent_state_executions_for(&executed_state);
            if *subsequent_executions >= limit {
                warn!(
                    target: "durastate::runtime::processor",
                    instance_id = instance.id,
                    workflow_type = %instance.workflow_type,
                    state = %executed_state,
                    executions = *subsequent_executions,
                    "Busy loop detected, delaying next activation"
                );
                transition.next_activation = Some(backoff::short_transition_activation(definition.settings(), now));
                *subsequent_executions = 0;
                self.metrics.record_busy_loop_break();
            }
        } else {
            *subsequent_executions = 0;
        }

        let next_type = definition.state(&transition.state).map(|s| s.state_type);
        let mut status = derive_status(transition.next_activation, next_type, now);
        if status == InstanceStatus::Executing && self.shutting_down.load(Ordering::Relaxed) {
            // Hand the instance back instead of continuing during shutdown
            status = InstanceStatus::InProgress;
        }

        let force_action = failure.is_some() || !effects.changed.is_empty() || !effects.new_workflows.is_empty();
        let action = (effects.create_action || force_action).then(|| NewWorkflowAction {
            executor_id: Some(self.executor_id),
            state: executed_state.clone(),
            state_text: transition.state_text.clone(),
            action_type: if failure.is_some() {
                ActionType::StateExecutionFailed
            } else {
                ActionType::StateExecution
            },
            retry_no: retries_before,
            execution_start,
            execution_end: now,
            updated_state_variables: effects.changed.clone(),
        });

        let ExecutionEffects {
            variables,
            business_key,
            new_workflows,
            wakeup_parent,
            ..
        } = effects;
        let new_count = new_workflows.len();
        let action_id = self
            .store
            .persist(ExecutionCommit {
                instance_id: instance.id,
                owner: self.executor_id,
                state: transition.state.clone(),
                state_text: transition.state_text.clone(),
                status,
                executor_id: (status == InstanceStatus::Executing).then_some(self.executor_id),
                next_activation: transition.next_activation,
                retries: transition.retries,
                business_key,
                state_variables: variables,
                started: Some(instance.started.unwrap_or(execution_start)),
                action,
                new_instances: new_workflows,
            })
            .await?;
        self.metrics.record_execution(failure.is_some());

        info!(
            target: "durastate::runtime::processor",
            instance_id = instance.id,
            workflow_type = %instance.workflow_type,
            executor_id = self.executor_id,
            state = %executed_state,
            next_state = %transition.state,
            status = %status,
            next_activation = ?transition.next_activation,
            retries = transition.retries,
            new_workflows = new_count,
            failed = failure.is_some(),
            "State executed"
        );

        if let (Some(expected_states), Some(parent_id)) = (wakeup_parent, instance.parent_workflow_id) {
            match self.store.wakeup_if_idle(parent_id, &expected_states).await {
                Ok(woken) => debug!(
                    target: "durastate::runtime::processor",
                    instance_id = instance.id,
                    parent_id,
                    woken,
                    "Parent wakeup"
                ),
                Err(e) => warn!(
                    target: "durastate::runtime::processor",
                    instance_id = instance.id,
                    parent_id,
                    error = %e,
                    "Parent wakeup failed"
                ),
            }
        }

        let outcome = ExecutionOutcome {
            state: transition.state,
            state_text: transition.state_text,
            status,
            next_activation: transition.next_activation,
            retries: transition.retries,
            action_id,
        };
        match &failure {
            Some(err) => self.listeners.after_failure(&listener_ctx, err, &outcome),
            None => self.listeners.after_processing(&listener_ctx, &outcome),
        }

        Ok(status)
    }

    /// `Ok(None)` when the state is final (with or without a final handler).
    async fn invoke_handler(
        &self,
        definition: &WorkflowDefinition,
        state: &str,
        ctx: StateExecution,
    ) -> Result<Option<NextAction>, StateError> {
        let invocation = match definition.handler(state) {
            Some(StateHandler::Transition(handler)) => {
                let handler = handler.clone();
                AssertUnwindSafe(async move { handler.execute(ctx).await.map(Some) })
                    .catch_unwind()
                    .await
            }
            Some(StateHandler::Final(handler)) => {
                let handler = handler.clone();
                AssertUnwindSafe(async move { handler.execute(ctx).await.map(|_| None) })
                    .catch_unwind()
                    .await
            }
            None => return Ok(None),
        };
        invocation.unwrap_or_else(|panic| {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(
                target: "durastate::runtime::processor",
                workflow_type = definition.workflow_type(),
                state,
                panic = %message,
                "State handler panicked"
            );
            Err(StateError::retryable(format!("handler panicked: {message}")))
        })
    }

    /// Fill in the initial state of new workflows created without one.
    fn resolve_new_workflows(&self, workflows: &mut [NewWorkflowInstance]) -> Result<(), StateError> {
        for workflow in workflows.iter_mut().filter(|w| w.state.is_none()) {
            let initial = self.workflows.initial_state_of(&workflow.workflow_type).ok_or_else(|| {
                StateError::retryable(format!(
                    "cannot resolve initial state of new workflow type {}",
                    workflow.workflow_type
                ))
            })?;
            workflow.state = Some(initial);
        }
        Ok(())
    }

    fn after_failure(
        &self,
        definition: &WorkflowDefinition,
        instance: &WorkflowInstance,
        err: &StateError,
        now: u64,
    ) -> Transition {
        warn!(
            target: "durastate::runtime::processor",
            instance_id = instance.id,
            workflow_type = %instance.workflow_type,
            state = %instance.state,
            retries = instance.retries,
            retryable = err.retryable,
            error = %err.message,
            "State handler failed"
        );
        let decision = if err.retryable {
            backoff::decide_retry(definition, &instance.state, instance.retries, None, now)
        } else {
            backoff::exhaustion_route(definition, &instance.state)
        };
        self.apply_retry_decision(definition, instance, decision, err.message.clone(), now)
    }

    fn after_success(
        &self,
        definition: &WorkflowDefinition,
        instance: &WorkflowInstance,
        next: NextAction,
        now: u64,
    ) -> Transition {
        match next {
            NextAction::MoveToState {
                state,
                reason,
                activation,
            } => {
                let (target, text) = self.validate_transition(definition, instance, state, reason);
                Transition {
                    next_activation: arrival_activation(definition, &target, activation, now),
                    state: target,
                    state_text: Some(text),
                    retries: 0,
                }
            }
            NextAction::RetryAfter { activation, reason } => {
                let decision =
                    backoff::decide_retry(definition, &instance.state, instance.retries, Some(activation), now);
                self.apply_retry_decision(definition, instance, decision, reason, now)
            }
            NextAction::StopInState { state, reason } => {
                let (target, text) = self.validate_transition(definition, instance, state, reason);
                Transition {
                    state: target,
                    state_text: Some(text),
                    next_activation: None,
                    retries: 0,
                }
            }
        }
    }

    fn apply_retry_decision(
        &self,
        definition: &WorkflowDefinition,
        instance: &WorkflowInstance,
        decision: RetryDecision,
        text: String,
        now: u64,
    ) -> Transition {
        match decision {
            RetryDecision::Retry { activation, retries } => Transition {
                state: instance.state.clone(),
                state_text: Some(text),
                next_activation: Some(activation),
                retries,
            },
            RetryDecision::FailureState(target) | RetryDecision::ErrorState(target) => {
                info!(
                    target: "durastate::runtime::processor",
                    instance_id = instance.id,
                    state = %instance.state,
                    next_state = %target,
                    "Retries exhausted"
                );
                Transition {
                    next_activation: arrival_activation(definition, &target, None, now),
                    state_text: Some(format!("Max retry count exceeded, going to {target}: {text}")),
                    state: target,
                    retries: 0,
                }
            }
            RetryDecision::Stop => {
                error!(
                    target: "durastate::runtime::processor",
                    instance_id = instance.id,
                    workflow_type = %instance.workflow_type,
                    state = %instance.state,
                    "Retries exhausted in error state, stopping"
                );
                Transition {
                    state: instance.state.clone(),
                    state_text: Some(format!("Max retry count exceeded in error state, stopping: {text}")),
                    next_activation: None,
                    retries: instance.retries,
                }
            }
        }
    }

    /// Apply the illegal transition policy. Returns the effective target and state text.
    fn validate_transition(
        &self,
        definition: &WorkflowDefinition,
        instance: &WorkflowInstance,
        target: String,
        reason: String,
    ) -> (String, String) {
        let current = &instance.state;
        if definition.state(&target).is_none() {
            error!(
                target: "durastate::runtime::processor",
                instance_id = instance.id,
                state = %current,
                next_state = %target,
                "Transition to unregistered state, going to error state"
            );
            let error_state = definition.error_state().to_string();
            let text = format!("{reason} [unregistered state {target} requested, moved to {error_state}]");
            return (error_state, text);
        }
        if definition.is_allowed_next_action(current, &target) {
            return (target, reason);
        }

        match self.options.illegal_transition_policy {
            IllegalTransitionPolicy::Ignore => {
                let text = format!("{reason} [illegal transition {current} -> {target} allowed]");
                (target, text)
            }
            IllegalTransitionPolicy::Log => {
                warn!(
                    target: "durastate::runtime::processor",
                    instance_id = instance.id,
                    state = %current,
                    next_state = %target,
                    "Illegal state transition"
                );
                let text = format!("{reason} [illegal transition {current} -> {target} allowed]");
                (target, text)
            }
            IllegalTransitionPolicy::Fail => {
                error!(
                    target: "durastate::runtime::processor",
                    instance_id = instance.id,
                    state = %current,
                    next_state = %target,
                    "Illegal state transition, going to error state"
                );
                let error_state = definition.error_state().to_string();
                let text = format!("{reason} [illegal transition {current} -> {target}, moved to {error_state}]");
                (error_state, text)
            }
        }
    }
}

/// Activation when entering `target`.
///
/// Final states without a handler end immediately. Everything else runs at
/// `requested`, or now.
fn arrival_activation(definition: &WorkflowDefinition, target: &str, requested: Option<u64>, now: u64) -> Option<u64> {
    if definition.is_final(target) && definition.handler(target).is_none() {
        None
    } else {
        Some(requested.unwrap_or(now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::sqlite::SqliteProvider;
    use crate::runtime::options::WorkflowSettings;
    use crate::runtime::worker_pool::InFlightRegistry;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[test]
    fn test_derive_status() {
        assert_eq!(derive_status(Some(5), Some(StateType::End), 5), InstanceStatus::Executing);
        assert_eq!(derive_status(Some(6), Some(StateType::Normal), 5), InstanceStatus::InProgress);
        assert_eq!(derive_status(None, Some(StateType::Manual), 5), InstanceStatus::Manual);
        assert_eq!(derive_status(None, Some(StateType::End), 5), InstanceStatus::Finished);
        assert_eq!(derive_status(None, Some(StateType::Normal), 5), InstanceStatus::InProgress);
        assert_eq!(derive_status(None, None, 5), InstanceStatus::InProgress);
    }

    struct Harness {
        store: Arc<SqliteProvider>,
        processor: StateProcessor,
        in_flight: Arc<InFlightRegistry>,
        metrics: Arc<RuntimeMetrics>,
    }

    impl Harness {
        async fn new(workflows: WorkflowRegistry, policy: IllegalTransitionPolicy) -> Self {
            let store = Arc::new(SqliteProvider::new_in_memory().await.unwrap());
            let metrics = Arc::new(RuntimeMetrics::default());
            let options = RuntimeOptions {
                illegal_transition_policy: policy,
                ..Default::default()
            };
            let processor = StateProcessor::new(
                store.clone(),
                workflows,
                Arc::new(options),
                ListenerChain::default(),
                metrics.clone(),
                Arc::new(AtomicBool::new(false)),
                1,
            );
            Self {
                store,
                processor,
                in_flight: Arc::new(InFlightRegistry::default()),
                metrics,
            }
        }

        async fn run(&self, instance: NewWorkflowInstance) -> (i64, ProcessOutcome) {
            let id = self.store.create_instance(instance).await.unwrap();
            assert!(self.store.claim(id, 1).await.unwrap());
            let guard = self.in_flight.begin(0, id);
            let outcome = self.processor.process(id, &guard).await.unwrap();
            (id, outcome)
        }
    }

    fn order_definition(settings: WorkflowSettings) -> WorkflowDefinition {
        WorkflowDefinition::builder("order")
            .register_state("begin", StateType::Start)
            .register_state("process", StateType::Normal)
            .register_state("done", StateType::End)
            .register_state("error", StateType::Manual)
            .initial_state("begin")
            .error_state("error")
            .permit("begin", "process")
            .permit("process", "done")
            .settings(settings)
            .on_state("begin", |ctx| async move {
                ctx.set_variable("seen", "begin");
                Ok(NextAction::move_to_state("process", "started"))
            })
            .on_state("process", |ctx| async move {
                match ctx.get_variable("mode").as_deref() {
                    Some("fail") => Err(StateError::retryable("downstream unavailable")),
                    Some("fatal") => Err(StateError::permanent("bad order")),
                    Some("illegal") => Ok(NextAction::move_to_state("begin", "back to start")),
                    Some("panic") => panic!("handler bug"),
                    Some("later") => Ok(NextAction::retry_after(u64::MAX / 2, "not yet")),
                    _ => Ok(NextAction::move_to_state("done", "processed")),
                }
            })
            .build()
            .unwrap()
    }

    fn registry(definition: WorkflowDefinition) -> WorkflowRegistry {
        WorkflowRegistry::builder().register(definition).build_result().unwrap()
    }

    #[tokio::test]
    async fn test_runs_to_end_state_in_process() {
        let h = Harness::new(
            registry(order_definition(WorkflowSettings::default())),
            IllegalTransitionPolicy::Fail,
        )
        .await;
        let (id, outcome) = h.run(NewWorkflowInstance::new("order").with_state("begin")).await;
        assert_eq!(outcome, ProcessOutcome::Yielded);

        let instance = h.store.load_instance(id).await.unwrap().unwrap();
        assert_eq!(instance.state, "done");
        assert_eq!(instance.status, InstanceStatus::Finished);
        assert_eq!(instance.next_activation, None);
        assert_eq!(instance.executor_id, None);
        assert_eq!(instance.retries, 0);
        assert!(instance.started.is_some());
        assert_eq!(instance.state_variables.get("seen").map(String::as_str), Some("begin"));

        let actions = h.store.list_actions(id).await.unwrap();
        let states: Vec<&str> = actions.iter().map(|a| a.state.as_str()).collect();
        assert_eq!(states, vec!["begin", "process"]);
        assert!(actions.iter().all(|a| a.action_type == ActionType::StateExecution));
        assert_eq!(h.metrics.snapshot().executions, 2);
        assert!(h.in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_retryable_failure_schedules_backoff() {
        let h = Harness::new(
            registry(order_definition(WorkflowSettings::default())),
            IllegalTransitionPolicy::Fail,
        )
        .await;
        let (id, _) = h
            .run(
                NewWorkflowInstance::new("order")
                    .with_state("process")
                    .with_variable("mode", "fail"),
            )
            .await;

        let instance = h.store.load_instance(id).await.unwrap().unwrap();
        assert_eq!(instance.state, "process");
        assert_eq!(instance.retries, 1);
        assert_eq!(instance.status, InstanceStatus::InProgress);
        assert_eq!(instance.executor_id, None);
        assert!(instance.next_activation.unwrap() > crate::now_millis());

        let actions = h.store.list_actions(id).await.unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].action_type, ActionType::StateExecutionFailed);
        assert_eq!(actions[0].retry_no, 0);
        assert_eq!(h.metrics.snapshot().failures, 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_goes_to_error_state() {
        let h = Harness::new(
            registry(order_definition(WorkflowSettings::default())),
            IllegalTransitionPolicy::Fail,
        )
        .await;
        let (id, _) = h
            .run(
                NewWorkflowInstance::new("order")
                    .with_state("process")
                    .with_variable("mode", "fatal"),
            )
            .await;

        let instance = h.store.load_instance(id).await.unwrap().unwrap();
        assert_eq!(instance.state, "error");
        assert_eq!(instance.status, InstanceStatus::Manual);
        assert_eq!(instance.next_activation, None);
        assert_eq!(instance.retries, 0);
    }

    #[tokio::test]
    async fn test_panic_counts_as_retryable_failure() {
        let h = Harness::new(
            registry(order_definition(WorkflowSettings::default())),
            IllegalTransitionPolicy::Fail,
        )
        .await;
        let (id, _) = h
            .run(
                NewWorkflowInstance::new("order")
                    .with_state("process")
                    .with_variable("mode", "panic"),
            )
            .await;

        let instance = h.store.load_instance(id).await.unwrap().unwrap();
        assert_eq!(instance.state, "process");
        assert_eq!(instance.retries, 1);
        let actions = h.store.list_actions(id).await.unwrap();
        assert!(actions[0].state_text.as_deref().unwrap().contains("handler bug"));
    }

    #[tokio::test]
    async fn test_illegal_transition_policies() {
        for (policy, expected_state) in [
            (IllegalTransitionPolicy::Fail, "error"),
            (IllegalTransitionPolicy::Log, "begin"),
            (IllegalTransitionPolicy::Ignore, "begin"),
        ] {
            let settings = WorkflowSettings {
                max_subsequent_state_executions: 1,
                ..Default::default()
            };
            let h = Harness::new(registry(order_definition(settings)), policy).await;
            let (id, _) = h
                .run(
                    NewWorkflowInstance::new("order")
                        .with_state("process")
                        .with_variable("mode", "illegal"),
                )
                .await;

            let actions = h.store.list_actions(id).await.unwrap();
            assert!(
                actions[0].state_text.as_deref().unwrap().contains("illegal transition"),
                "{policy}: {:?}",
                actions[0].state_text
            );
            let instance = h.store.load_instance(id).await.unwrap().unwrap();
            assert_eq!(instance.state, expected_state, "{policy}");
        }
    }

    #[tokio::test]
    async fn test_retry_after_keeps_state_and_counts_retry() {
        let h = Harness::new(
            registry(order_definition(WorkflowSettings::default())),
            IllegalTransitionPolicy::Fail,
        )
        .await;
        let (id, _) = h
            .run(
                NewWorkflowInstance::new("order")
                    .with_state("process")
                    .with_variable("mode", "later"),
            )
            .await;
        let instance = h.store.load_instance(id).await.unwrap().unwrap();
        assert_eq!(instance.state, "process");
        assert_eq!(instance.retries, 1);
        assert_eq!(instance.next_activation, Some(u64::MAX / 2));
        let actions = h.store.list_actions(id).await.unwrap();
        assert_eq!(actions[0].action_type, ActionType::StateExecution);
    }

    #[tokio::test]
    async fn test_unknown_type_is_rescheduled_without_action() {
        let h = Harness::new(WorkflowRegistry::default(), IllegalTransitionPolicy::Fail).await;
        let (id, outcome) = h.run(NewWorkflowInstance::new("mystery").with_state("begin")).await;
        assert_eq!(outcome, ProcessOutcome::Rescheduled);

        let instance = h.store.load_instance(id).await.unwrap().unwrap();
        assert_eq!(instance.executor_id, None);
        assert!(instance.state_text.as_deref().unwrap().contains("Unsupported workflow type"));
        let delay = instance.next_activation.unwrap() - instance.modified;
        assert!(delay >= Duration::from_secs(59 * 60).as_millis() as u64);
        assert!(h.store.list_actions(id).await.unwrap().is_empty());
        assert_eq!(h.metrics.snapshot().unknown_reschedules, 1);
    }

    #[tokio::test]
    async fn test_unknown_state_is_rescheduled() {
        let h = Harness::new(
            registry(order_definition(WorkflowSettings::default())),
            IllegalTransitionPolicy::Fail,
        )
        .await;
        let (id, outcome) = h.run(NewWorkflowInstance::new("order").with_state("vanished")).await;
        assert_eq!(outcome, ProcessOutcome::Rescheduled);
        let instance = h.store.load_instance(id).await.unwrap().unwrap();
        assert!(instance.state_text.as_deref().unwrap().contains("Unsupported workflow state"));
    }

    #[tokio::test]
    async fn test_busy_loop_breaker_forces_short_delay() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let definition = WorkflowDefinition::builder("spin")
            .register_state("spin", StateType::Start)
            .register_state("error", StateType::Manual)
            .initial_state("spin")
            .error_state("error")
            .permit("spin", "spin")
            .max_subsequent_executions("spin", 3)
            .on_state("spin", move |_ctx| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(NextAction::move_to_state("spin", "again"))
                }
            })
            .build()
            .unwrap();
        let h = Harness::new(registry(definition), IllegalTransitionPolicy::Fail).await;
        let (id, outcome) = h.run(NewWorkflowInstance::new("spin").with_state("spin")).await;
        assert_eq!(outcome, ProcessOutcome::Yielded);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let instance = h.store.load_instance(id).await.unwrap().unwrap();
        assert_eq!(instance.status, InstanceStatus::InProgress);
        assert_eq!(instance.executor_id, None);
        let short = WorkflowSettings::default().short_transition_delay.as_millis() as u64;
        assert!(instance.next_activation.unwrap() >= instance.modified + short - 1_000);
        assert_eq!(h.metrics.snapshot().busy_loop_breaks, 1);
    }

    #[tokio::test]
    async fn test_not_owned_instance_is_left_alone() {
        let h = Harness::new(
            registry(order_definition(WorkflowSettings::default())),
            IllegalTransitionPolicy::Fail,
        )
        .await;
        let id = h
            .store
            .create_instance(NewWorkflowInstance::new("order").with_state("begin"))
            .await
            .unwrap();
        assert!(h.store.claim(id, 2).await.unwrap());
        let guard = h.in_flight.begin(0, id);
        assert_eq!(
            h.processor.process(id, &guard).await.unwrap(),
            ProcessOutcome::NotOwned
        );
        assert!(h.store.list_actions(id).await.unwrap().is_empty());
    }
}
