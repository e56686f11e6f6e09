//! The single poll loop of a runtime.
//!
//! Keeps the executor heartbeat alive, recovers instances of dead peers,
//! reports stuck workers, and refills the work queue with freshly claimed
//! instances whenever it drains below its low-water mark.

use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::claim::{self, ClaimError};
use super::executor_registry::ExecutorRegistry;
use super::observability::RuntimeMetrics;
use super::options::RuntimeOptions;
use super::queue::BoundedWorkQueue;
use super::worker_pool::InFlightRegistry;
use crate::providers::Provider;

pub(crate) struct Dispatcher {
    pub(crate) store: Arc<dyn Provider>,
    pub(crate) executor: Arc<ExecutorRegistry>,
    pub(crate) executor_id: i64,
    pub(crate) queue: Arc<BoundedWorkQueue<i64>>,
    pub(crate) in_flight: Arc<InFlightRegistry>,
    pub(crate) metrics: Arc<RuntimeMetrics>,
    pub(crate) options: Arc<RuntimeOptions>,
    pub(crate) paused: Arc<AtomicBool>,
    pub(crate) shutdown: watch::Receiver<bool>,
}

impl Dispatcher {
    pub(crate) async fn run(mut self) {
        info!(
            target: "durastate::runtime::dispatcher",
            executor_id = self.executor_id,
            group = %self.options.executor_group,
            workers = self.options.worker_count,
            "Dispatcher started"
        );
        let mut next_heartbeat = Instant::now();
        let mut next_stuck_check = Instant::now() + self.options.stuck_check_interval;

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let now = Instant::now();
            if now >= next_heartbeat {
                self.maintain_executor().await;
                next_heartbeat = now + self.options.heartbeat_interval;
            }
            if now >= next_stuck_check {
                self.report_stuck();
                next_stuck_check = now + self.options.stuck_check_interval;
            }
            let deadline = next_heartbeat.min(next_stuck_check);

            if self.paused.load(Ordering::Relaxed) {
                let wake = deadline.min(Instant::now() + self.options.poll_interval);
                if self.sleep_until(wake).await {
                    break;
                }
                continue;
            }

            let below_threshold = tokio::select! {
                reached = self.queue.wait_until_below_threshold(deadline) => reached,
                _ = self.shutdown.changed() => break,
            };
            if !below_threshold {
                continue;
            }

            let limit = self.queue.remaining_capacity();
            let delay = match claim::claim_batch(
                self.store.as_ref(),
                &self.options.executor_group,
                self.executor_id,
                limit,
            )
            .await
            {
                Ok(ids) if ids.is_empty() => Some(self.options.poll_interval),
                Ok(ids) => {
                    debug!(
                        target: "durastate::runtime::dispatcher",
                        executor_id = self.executor_id,
                        count = ids.len(),
                        "Claimed instances"
                    );
                    self.metrics.record_claims(ids.len());
                    self.enqueue(ids).await;
                    None
                }
                Err(ClaimError::Race { retained }) => {
                    self.metrics.record_claim_race();
                    self.enqueue(retained).await;
                    Some(race_backoff(self.options.poll_interval))
                }
                Err(ClaimError::Provider { error, retained }) => {
                    error!(
                        target: "durastate::runtime::dispatcher",
                        executor_id = self.executor_id,
                        error = %error,
                        retryable = error.is_retryable(),
                        "Polling for due instances failed"
                    );
                    self.enqueue(retained).await;
                    Some(self.options.error_backoff)
                }
            };

            if let Some(delay) = delay {
                if self.sleep_until(Instant::now() + delay).await {
                    break;
                }
            }
        }

        info!(
            target: "durastate::runtime::dispatcher",
            executor_id = self.executor_id,
            "Dispatcher stopped"
        );
    }

    /// Sleep until `deadline`. Returns `true` if shutdown was requested meanwhile.
    async fn sleep_until(&mut self, deadline: Instant) -> bool {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {}
            _ = self.shutdown.changed() => return true,
        }
        *self.shutdown.borrow()
    }

    async fn maintain_executor(&self) {
        if let Err(e) = self.executor.heartbeat().await {
            error!(
                target: "durastate::runtime::dispatcher",
                executor_id = self.executor_id,
                error = %e,
                "Executor heartbeat failed"
            );
        }
        match self.executor.recover_dead_peers().await {
            Ok(recovered) => self.metrics.record_recovered(recovered.len()),
            Err(e) => error!(
                target: "durastate::runtime::dispatcher",
                executor_id = self.executor_id,
                error = %e,
                "Recovering instances of dead executors failed"
            ),
        }
    }

    fn report_stuck(&self) {
        let stuck = self.in_flight.stuck(self.options.stuck_threshold);
        self.metrics.record_stuck(stuck.len());
        for entry in stuck {
            warn!(
                target: "durastate::runtime::dispatcher",
                worker_id = entry.worker_id,
                instance_id = entry.instance_id,
                state = entry.state.as_deref().unwrap_or("<loading>"),
                elapsed_ms = entry.elapsed().as_millis() as u64,
                "State processing appears stuck"
            );
        }
    }

    /// Hand claimed ids to the workers; ids that do not fit are released.
    async fn enqueue(&self, ids: Vec<i64>) {
        for id in ids {
            if self.queue.offer(id).is_ok() {
                continue;
            }
            warn!(
                target: "durastate::runtime::dispatcher",
                instance_id = id,
                "Work queue rejected claimed instance, releasing"
            );
            if let Err(e) = self.store.release(id, self.executor_id).await {
                error!(
                    target: "durastate::runtime::dispatcher",
                    instance_id = id,
                    error = %e,
                    "Failed to release rejected instance"
                );
            }
        }
    }
}

/// Random pause in `[1ms, poll_interval]` so racing executors spread out.
fn race_backoff(poll_interval: Duration) -> Duration {
    let max = (poll_interval.as_millis() as u64).max(1);
    Duration::from_millis(rand::thread_rng().gen_range(1..=max))
}
