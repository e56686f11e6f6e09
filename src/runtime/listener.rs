//! Hooks around each state execution.
//!
//! Listeners run in registration order. A listener returning an error or
//! panicking is logged and skipped; later listeners and the execution itself
//! are unaffected.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tracing::warn;

use super::definition::StateError;
use crate::{InstanceStatus, WorkflowInstance};

/// Execution being reported to listeners.
#[derive(Debug, Clone)]
pub struct ListenerContext {
    /// Instance as loaded before the handler ran.
    pub instance: WorkflowInstance,
    pub executor_id: i64,
    pub execution_start: u64,
}

/// Committed result of one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub state: String,
    pub state_text: Option<String>,
    pub status: InstanceStatus,
    pub next_activation: Option<u64>,
    pub retries: u32,
    pub action_id: Option<i64>,
}

pub trait ExecutionListener: Send + Sync {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn before_processing(&self, _ctx: &ListenerContext) -> Result<(), String> {
        Ok(())
    }

    /// Called after a successful execution has been committed.
    fn after_processing(&self, _ctx: &ListenerContext, _outcome: &ExecutionOutcome) -> Result<(), String> {
        Ok(())
    }

    /// Called after a failed execution has been committed.
    fn after_failure(
        &self,
        _ctx: &ListenerContext,
        _error: &StateError,
        _outcome: &ExecutionOutcome,
    ) -> Result<(), String> {
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct ListenerChain {
    listeners: Vec<Arc<dyn ExecutionListener>>,
}

impl ListenerChain {
    pub fn new(listeners: Vec<Arc<dyn ExecutionListener>>) -> Self {
        Self { listeners }
    }

    pub fn push(&mut self, listener: Arc<dyn ExecutionListener>) {
        self.listeners.push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn before_processing(&self, ctx: &ListenerContext) {
        self.each(ctx, "before_processing", |l| l.before_processing(ctx));
    }

    pub fn after_processing(&self, ctx: &ListenerContext, outcome: &ExecutionOutcome) {
        self.each(ctx, "after_processing", |l| l.after_processing(ctx, outcome));
    }

    pub fn after_failure(&self, ctx: &ListenerContext, error: &StateError, outcome: &ExecutionOutcome) {
        self.each(ctx, "after_failure", |l| l.after_failure(ctx, error, outcome));
    }

    fn each(
        &self,
        ctx: &ListenerContext,
        hook: &'static str,
        call: impl Fn(&dyn ExecutionListener) -> Result<(), String>,
    ) {
        for listener in &self.listeners {
            let result = catch_unwind(AssertUnwindSafe(|| call(listener.as_ref())))
                .unwrap_or_else(|_| Err("listener panicked".to_string()));
            if let Err(error) = result {
                warn!(
                    target: "durastate::runtime::listener",
                    listener = listener.name(),
                    hook,
                    instance_id = ctx.instance.id,
                    state = %ctx.instance.state,
                    error = %error,
                    "Execution listener failed"
                );
            }
        }
    }
}
