//! Store wrapper that fails chosen operations a set number of times.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::providers::sqlite::SqliteProvider;
use crate::providers::{ExecutionCommit, Provider, ProviderError};
use crate::{ExecutorInfo, ExternalChange, NewWorkflowInstance, WorkflowInstance, WorkflowInstanceAction};

pub(crate) struct FlakyStore {
    pub(crate) inner: SqliteProvider,
    failing_polls: AtomicUsize,
    pub(crate) polls: AtomicUsize,
    failing_persists: Mutex<Vec<ProviderError>>,
}

impl FlakyStore {
    pub(crate) async fn new() -> Self {
        Self {
            inner: SqliteProvider::new_in_memory().await.unwrap(),
            failing_polls: AtomicUsize::new(0),
            polls: AtomicUsize::new(0),
            failing_persists: Mutex::new(Vec::new()),
        }
    }

    /// The next `count` polls fail as unavailable.
    pub(crate) fn fail_polls(&self, count: usize) {
        self.failing_polls.store(count, Ordering::SeqCst);
    }

    pub(crate) fn remaining_poll_failures(&self) -> usize {
        self.failing_polls.load(Ordering::SeqCst)
    }

    /// The next persist fails with `error`.
    pub(crate) fn fail_next_persist(&self, error: ProviderError) {
        self.failing_persists.lock().unwrap().push(error);
    }
}

#[async_trait::async_trait]
impl Provider for FlakyStore {
    fn name(&self) -> &str {
        "flaky"
    }
    async fn create_instance(&self, i: NewWorkflowInstance) -> Result<i64, ProviderError> {
        self.inner.create_instance(i).await
    }
    async fn load_instance(&self, id: i64) -> Result<Option<WorkflowInstance>, ProviderError> {
        self.inner.load_instance(id).await
    }
    async fn list_actions(&self, id: i64) -> Result<Vec<WorkflowInstanceAction>, ProviderError> {
        self.inner.list_actions(id).await
    }
    async fn list_children(&self, id: i64) -> Result<Vec<WorkflowInstance>, ProviderError> {
        self.inner.list_children(id).await
    }
    async fn poll_claimable_ids(&self, group: &str, limit: usize) -> Result<Vec<i64>, ProviderError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_polls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ProviderError::unavailable("poll_claimable_ids", "database is locked"));
        }
        self.inner.poll_claimable_ids(group, limit).await
    }
    async fn claim(&self, id: i64, executor_id: i64) -> Result<bool, ProviderError> {
        self.inner.claim(id, executor_id).await
    }
    async fn release(&self, id: i64, executor_id: i64) -> Result<bool, ProviderError> {
        self.inner.release(id, executor_id).await
    }
    async fn persist(&self, c: ExecutionCommit) -> Result<Option<i64>, ProviderError> {
        if let Some(error) = self.failing_persists.lock().unwrap().pop() {
            return Err(error);
        }
        self.inner.persist(c).await
    }
    async fn wakeup_if_idle(&self, id: i64, s: &[String]) -> Result<bool, ProviderError> {
        self.inner.wakeup_if_idle(id, s).await
    }
    async fn apply_external_change(&self, id: i64, c: ExternalChange) -> Result<bool, ProviderError> {
        self.inner.apply_external_change(id, c).await
    }
    async fn register_executor(&self, g: &str, h: &str, p: u32, t: Duration) -> Result<i64, ProviderError> {
        self.inner.register_executor(g, h, p, t).await
    }
    async fn heartbeat_executor(&self, id: i64, t: Duration) -> Result<(), ProviderError> {
        self.inner.heartbeat_executor(id, t).await
    }
    async fn mark_executor_stopped(&self, id: i64, expire: bool) -> Result<(), ProviderError> {
        self.inner.mark_executor_stopped(id, expire).await
    }
    async fn recover_expired_executors(&self, g: &str, id: i64) -> Result<Vec<i64>, ProviderError> {
        self.inner.recover_expired_executors(g, id).await
    }
    async fn list_executors(&self, g: &str) -> Result<Vec<ExecutorInfo>, ProviderError> {
        self.inner.list_executors(g).await
    }
}
