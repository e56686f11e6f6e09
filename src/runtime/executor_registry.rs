use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::options::RuntimeOptions;
use crate::providers::{Provider, ProviderError};

/// This process's row in the executor table.
///
/// The row is inserted on the first call to [`ExecutorRegistry::executor_id`]
/// and the id is kept for the lifetime of the registry.
pub struct ExecutorRegistry {
    store: Arc<dyn Provider>,
    group: String,
    host: String,
    pid: u32,
    timeout: Duration,
    id: OnceCell<i64>,
}

impl ExecutorRegistry {
    pub fn new(store: Arc<dyn Provider>, options: &RuntimeOptions) -> Self {
        Self {
            store,
            group: options.executor_group.clone(),
            host: options.resolved_host(),
            pid: std::process::id(),
            timeout: options.executor_timeout,
            id: OnceCell::new(),
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Registered id, inserting the executor row on first use.
    pub async fn executor_id(&self) -> Result<i64, ProviderError> {
        self.id
            .get_or_try_init(|| async {
                let id = self
                    .store
                    .register_executor(&self.group, &self.host, self.pid, self.timeout)
                    .await?;
                info!(
                    target: "durastate::runtime::executor",
                    executor_id = id,
                    group = %self.group,
                    host = %self.host,
                    pid = self.pid,
                    "Executor registered"
                );
                Ok::<i64, ProviderError>(id)
            })
            .await
            .copied()
    }

    /// Id if already registered.
    pub fn cached_id(&self) -> Option<i64> {
        self.id.get().copied()
    }

    /// Push this executor's expiry `timeout` into the future.
    pub async fn heartbeat(&self) -> Result<(), ProviderError> {
        let id = self.executor_id().await?;
        self.store.heartbeat_executor(id, self.timeout).await?;
        debug!(target: "durastate::runtime::executor", executor_id = id, "Heartbeat");
        Ok(())
    }

    /// Release instances held by expired peers of the same group.
    pub async fn recover_dead_peers(&self) -> Result<Vec<i64>, ProviderError> {
        let id = self.executor_id().await?;
        let recovered = self.store.recover_expired_executors(&self.group, id).await?;
        if !recovered.is_empty() {
            info!(
                target: "durastate::runtime::executor",
                executor_id = id,
                group = %self.group,
                count = recovered.len(),
                instances = ?recovered,
                "Recovered instances from dead executors"
            );
        }
        Ok(recovered)
    }

    /// Stamp `stopped`. Only a `drained` executor expires right away; one that
    /// still runs handlers keeps its lease until heartbeats lapse.
    pub async fn mark_stopped(&self, drained: bool) -> Result<(), ProviderError> {
        if let Some(id) = self.cached_id() {
            self.store.mark_executor_stopped(id, drained).await?;
            info!(target: "durastate::runtime::executor", executor_id = id, drained, "Executor stopped");
        }
        Ok(())
    }
}
