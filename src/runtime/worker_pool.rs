//! Fixed set of worker tasks draining the claimed-instance queue, plus the
//! registry of what each worker is running right now.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::observability::RuntimeMetrics;
use super::processor::StateProcessor;
use super::queue::BoundedWorkQueue;
use crate::providers::Provider;

/// One running state processor.
#[derive(Debug, Clone)]
pub struct InFlightEntry {
    pub worker_id: usize,
    pub instance_id: i64,
    /// State currently executing, once the instance is loaded.
    pub state: Option<String>,
    pub started: Instant,
}

impl InFlightEntry {
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Who is processing what. Entries live exactly as long as their [`InFlightGuard`].
#[derive(Debug, Default)]
pub struct InFlightRegistry {
    entries: Mutex<HashMap<usize, InFlightEntry>>,
}

impl InFlightRegistry {
    pub fn begin(self: &Arc<Self>, worker_id: usize, instance_id: i64) -> InFlightGuard {
        self.entries.lock().expect("Mutex should not be poisoned").insert(
            worker_id,
            InFlightEntry {
                worker_id,
                instance_id,
                state: None,
                started: Instant::now(),
            },
        );
        InFlightGuard {
            registry: self.clone(),
            worker_id,
        }
    }

    pub fn snapshot(&self) -> Vec<InFlightEntry> {
        let mut entries: Vec<InFlightEntry> = self
            .entries
            .lock()
            .expect("Mutex should not be poisoned")
            .values()
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.worker_id);
        entries
    }

    /// Entries running longer than `threshold`.
    pub fn stuck(&self, threshold: Duration) -> Vec<InFlightEntry> {
        self.snapshot()
            .into_iter()
            .filter(|e| e.elapsed() > threshold)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("Mutex should not be poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Removes its entry on drop.
pub struct InFlightGuard {
    registry: Arc<InFlightRegistry>,
    worker_id: usize,
}

impl InFlightGuard {
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    pub fn set_state(&self, state: &str) {
        if let Some(entry) = self
            .registry
            .entries
            .lock()
            .expect("Mutex should not be poisoned")
            .get_mut(&self.worker_id)
        {
            entry.state = Some(state.to_string());
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Ok(mut entries) = self.registry.entries.lock() {
            entries.remove(&self.worker_id);
        }
    }
}

pub(crate) struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub(crate) fn spawn(
        worker_count: usize,
        queue: Arc<BoundedWorkQueue<i64>>,
        processor: Arc<StateProcessor>,
        in_flight: Arc<InFlightRegistry>,
        store: Arc<dyn Provider>,
        metrics: Arc<RuntimeMetrics>,
    ) -> Self {
        let handles = (0..worker_count)
            .map(|worker_id| {
                let worker = Worker {
                    worker_id,
                    queue: queue.clone(),
                    processor: processor.clone(),
                    in_flight: in_flight.clone(),
                    store: store.clone(),
                    metrics: metrics.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();
        Self { handles }
    }

    /// Wait for every worker to exit (the queue must be closed).
    ///
    /// Returns `false` if `timeout` elapsed first; remaining workers keep
    /// running detached.
    pub(crate) async fn join(self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, futures::future::join_all(self.handles))
            .await
            .is_ok()
    }
}

struct Worker {
    worker_id: usize,
    queue: Arc<BoundedWorkQueue<i64>>,
    processor: Arc<StateProcessor>,
    in_flight: Arc<InFlightRegistry>,
    store: Arc<dyn Provider>,
    metrics: Arc<RuntimeMetrics>,
}

impl Worker {
    async fn run(self) {
        debug!(target: "durastate::runtime::worker", worker_id = self.worker_id, "Worker started");
        while let Some(instance_id) = self.queue.take().await {
            self.process(instance_id).await;
        }
        debug!(target: "durastate::runtime::worker", worker_id = self.worker_id, "Worker stopped");
    }

    async fn process(&self, instance_id: i64) {
        let guard = self.in_flight.begin(self.worker_id, instance_id);
        let executor_id = self.processor.executor_id();

        let Err(e) = self.processor.process(instance_id, &guard).await else {
            return;
        };
        self.metrics.record_persist_failure();
        error!(
            target: "durastate::runtime::worker",
            worker_id = self.worker_id,
            instance_id,
            executor_id,
            error = %e,
            retryable = e.is_retryable(),
            "State processing failed"
        );
        if e.is_not_owned() {
            return;
        }

        // If this fails too, the claim is only freed once this executor expires
        match self.store.release(instance_id, executor_id).await {
            Ok(true) => info!(
                target: "durastate::runtime::worker",
                worker_id = self.worker_id,
                instance_id,
                "Released claim after processing failure"
            ),
            Ok(false) => {}
            Err(release_err) => warn!(
                target: "durastate::runtime::worker",
                worker_id = self.worker_id,
                instance_id,
                error = %release_err,
                "Failed to release claim after processing failure"
            ),
        }
    }
}
