//! Runtime for executing durable state machine workflows.
//!
//! A [`Runtime`] is one executor process: it registers itself in the store,
//! runs the dispatcher that claims due instances and a fixed pool of workers
//! that drive those instances through their [`WorkflowDefinition`].

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::providers::{Provider, ProviderError};

pub mod backoff;
pub mod claim;
pub mod context;
pub mod definition;
mod dispatcher;
pub mod executor_registry;
#[cfg(test)]
mod flaky_store;
pub mod listener;
pub mod observability;
pub mod options;
pub mod processor;
pub mod queue;
pub mod registry;
pub mod worker_pool;

pub use context::StateExecution;
pub use definition::{
    FinalHandler, NextAction, StateError, StateHandler, StateType, TransitionHandler, WorkflowDefinition,
    WorkflowDefinitionBuilder, WorkflowState,
};
pub use executor_registry::ExecutorRegistry;
pub use listener::{ExecutionListener, ExecutionOutcome, ListenerChain, ListenerContext};
pub use observability::{LogFormat, LoggingConfig, MetricsSnapshot, RuntimeMetrics, init_logging};
pub use options::{IllegalTransitionPolicy, RuntimeOptions, WorkflowSettings};
pub use processor::{ProcessOutcome, StateProcessor};
pub use registry::{WorkflowRegistry, WorkflowRegistryBuilder};
pub use worker_pool::{InFlightEntry, InFlightRegistry};

use dispatcher::Dispatcher;
use queue::BoundedWorkQueue;
use worker_pool::WorkerPool;

/// Failure to start a runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    InvalidOptions(String),
    Provider(ProviderError),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::InvalidOptions(msg) => write!(f, "invalid runtime options: {msg}"),
            RuntimeError::Provider(e) => write!(f, "runtime store error: {e}"),
        }
    }
}

impl std::error::Error for RuntimeError {}

impl From<ProviderError> for RuntimeError {
    fn from(e: ProviderError) -> Self {
        RuntimeError::Provider(e)
    }
}

/// One executor process.
pub struct Runtime {
    store: Arc<dyn Provider>,
    workflows: WorkflowRegistry,
    options: Arc<RuntimeOptions>,
    executor: Arc<ExecutorRegistry>,
    executor_id: i64,
    queue: Arc<BoundedWorkQueue<i64>>,
    in_flight: Arc<InFlightRegistry>,
    metrics: Arc<RuntimeMetrics>,
    paused: Arc<AtomicBool>,
    shutting_down: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    workers: Mutex<Option<WorkerPool>>,
}

impl Runtime {
    /// Register the executor and start the dispatcher and workers.
    ///
    /// # Errors
    ///
    /// Invalid options, or the executor row could not be written.
    pub async fn start(
        store: Arc<dyn Provider>,
        workflows: WorkflowRegistry,
        options: RuntimeOptions,
    ) -> Result<Arc<Self>, RuntimeError> {
        Self::start_with_listeners(store, workflows, options, ListenerChain::default()).await
    }

    pub async fn start_with_listeners(
        store: Arc<dyn Provider>,
        workflows: WorkflowRegistry,
        options: RuntimeOptions,
        listeners: ListenerChain,
    ) -> Result<Arc<Self>, RuntimeError> {
        // Install a default subscriber if none set (ok to call many times)
        if let Ok(config) = LoggingConfig::from_env() {
            let _ = init_logging(&config);
        }
        options.validate().map_err(RuntimeError::InvalidOptions)?;
        let options = Arc::new(options);

        let executor = Arc::new(ExecutorRegistry::new(store.clone(), &options));
        let executor_id = executor.executor_id().await?;

        let queue = Arc::new(BoundedWorkQueue::new(options.queue_capacity, options.queue_low_water_mark));
        let in_flight = Arc::new(InFlightRegistry::default());
        let metrics = Arc::new(RuntimeMetrics::default());
        let paused = Arc::new(AtomicBool::new(false));
        let shutting_down = Arc::new(AtomicBool::new(false));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let processor = Arc::new(StateProcessor::new(
            store.clone(),
            workflows.clone(),
            options.clone(),
            listeners,
            metrics.clone(),
            shutting_down.clone(),
            executor_id,
        ));
        let workers = WorkerPool::spawn(
            options.worker_count,
            queue.clone(),
            processor,
            in_flight.clone(),
            store.clone(),
            metrics.clone(),
        );
        let dispatcher = Dispatcher {
            store: store.clone(),
            executor: executor.clone(),
            executor_id,
            queue: queue.clone(),
            in_flight: in_flight.clone(),
            metrics: metrics.clone(),
            options: options.clone(),
            paused: paused.clone(),
            shutdown: shutdown_rx,
        };
        let dispatcher_handle = tokio::spawn(dispatcher.run());

        info!(
            target: "durastate::runtime",
            executor_id,
            group = %options.executor_group,
            workers = options.worker_count,
            workflow_types = ?workflows.list_types(),
            "Runtime started"
        );

        Ok(Arc::new(Self {
            store,
            workflows,
            options,
            executor,
            executor_id,
            queue,
            in_flight,
            metrics,
            paused,
            shutting_down,
            shutdown_tx,
            dispatcher: Mutex::new(Some(dispatcher_handle)),
            workers: Mutex::new(Some(workers)),
        }))
    }

    pub fn executor_id(&self) -> i64 {
        self.executor_id
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    pub fn workflows(&self) -> &WorkflowRegistry {
        &self.workflows
    }

    /// Stop claiming new work. Heartbeats and in-flight executions continue.
    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            info!(target: "durastate::runtime", executor_id = self.executor_id, "Runtime paused");
        }
    }

    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            info!(target: "durastate::runtime", executor_id = self.executor_id, "Runtime resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Executions running right now.
    pub fn in_flight(&self) -> Vec<InFlightEntry> {
        self.in_flight.snapshot()
    }

    /// Shut down with [`RuntimeOptions::shutdown_timeout`].
    pub async fn shutdown(&self) -> bool {
        self.shutdown_with_timeout(self.options.shutdown_timeout).await
    }

    /// Stop the dispatcher, release queued claims and wait up to `timeout`
    /// for running executions to commit.
    ///
    /// Returns `false` if workers were still busy when `timeout` elapsed.
    /// Calling it again is a no-op that returns `true`.
    pub async fn shutdown_with_timeout(&self, timeout: Duration) -> bool {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return true;
        }
        info!(target: "durastate::runtime", executor_id = self.executor_id, "Runtime shutting down");
        let _ = self.shutdown_tx.send(true);

        if let Some(handle) = self.dispatcher.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(target: "durastate::runtime", error = %e, "Dispatcher task failed");
            }
        }

        for id in self.queue.drain() {
            if let Err(e) = self.store.release(id, self.executor_id).await {
                warn!(
                    target: "durastate::runtime",
                    instance_id = id,
                    error = %e,
                    "Failed to release queued instance on shutdown"
                );
            }
        }
        self.queue.close();

        let drained = match self.workers.lock().await.take() {
            Some(workers) => workers.join(timeout).await,
            None => true,
        };
        if !drained {
            warn!(
                target: "durastate::runtime",
                executor_id = self.executor_id,
                in_flight = self.in_flight.len(),
                timeout_ms = timeout.as_millis() as u64,
                "Workers did not finish before shutdown timeout"
            );
        }

        if let Err(e) = self.executor.mark_stopped(drained).await {
            warn!(target: "durastate::runtime", error = %e, "Failed to mark executor stopped");
        }
        info!(target: "durastate::runtime", executor_id = self.executor_id, drained, "Runtime stopped");
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::sqlite::SqliteProvider;
    use crate::{InstanceStatus, NewWorkflowInstance};

    fn options() -> RuntimeOptions {
        RuntimeOptions {
            poll_interval: Duration::from_millis(20),
            worker_count: 2,
            queue_capacity: 4,
            queue_low_water_mark: 1,
            ..Default::default()
        }
    }

    fn workflows() -> WorkflowRegistry {
        let definition = WorkflowDefinition::builder("ping")
            .register_state("begin", StateType::Start)
            .register_state("done", StateType::End)
            .register_state("error", StateType::Manual)
            .initial_state("begin")
            .error_state("error")
            .permit("begin", "done")
            .on_state("begin", |_ctx| async move { Ok(NextAction::move_to_state("done", "pong")) })
            .build()
            .unwrap();
        WorkflowRegistry::builder().register(definition).build()
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_options() {
        let store: Arc<dyn Provider> = Arc::new(SqliteProvider::new_in_memory().await.unwrap());
        let bad = RuntimeOptions {
            worker_count: 0,
            ..options()
        };
        let err = Runtime::start(store, workflows(), bad).await.err().unwrap();
        assert!(matches!(err, RuntimeError::InvalidOptions(_)));
    }

    #[tokio::test]
    async fn test_runs_instance_and_shuts_down() {
        let store: Arc<dyn Provider> = Arc::new(SqliteProvider::new_in_memory().await.unwrap());
        let runtime = Runtime::start(store.clone(), workflows(), options()).await.unwrap();
        let id = store
            .create_instance(NewWorkflowInstance::new("ping").with_state("begin"))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let instance = store.load_instance(id).await.unwrap().unwrap();
                if instance.status == InstanceStatus::Finished {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert!(runtime.shutdown().await);
        assert!(runtime.shutdown().await);
        let executors = store.list_executors("default").await.unwrap();
        assert!(executors[0].stopped.is_some());
        assert!(runtime.metrics_snapshot().executions >= 1);
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let store: Arc<dyn Provider> = Arc::new(SqliteProvider::new_in_memory().await.unwrap());
        let runtime = Runtime::start(store.clone(), workflows(), options()).await.unwrap();
        runtime.pause();
        assert!(runtime.is_paused());
        // Let a claim pass that started before the pause finish
        tokio::time::sleep(Duration::from_millis(50)).await;

        let id = store
            .create_instance(NewWorkflowInstance::new("ping").with_state("begin"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(
            store.load_instance(id).await.unwrap().unwrap().status,
            InstanceStatus::Created
        );

        runtime.resume();
        tokio::time::timeout(Duration::from_secs(5), async {
            while store.load_instance(id).await.unwrap().unwrap().status != InstanceStatus::Finished {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        runtime.shutdown().await;
    }
}
