//! Bounded FIFO between the dispatcher and the worker pool.
//!
//! `offer` never blocks; the dispatcher sizes its poll batch from
//! [`BoundedWorkQueue::remaining_capacity`] and parks on
//! [`BoundedWorkQueue::wait_until_below_threshold`] until workers catch up.

use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

pub struct BoundedWorkQueue<T> {
    state: Mutex<QueueState<T>>,
    capacity: usize,
    low_water_mark: usize,
    not_empty: Notify,
    below_threshold: Notify,
}

impl<T> BoundedWorkQueue<T> {
    /// `low_water_mark` is clamped to `capacity`.
    pub fn new(capacity: usize, low_water_mark: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            capacity,
            low_water_mark: low_water_mark.min(capacity),
            not_empty: Notify::new(),
            below_threshold: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn low_water_mark(&self) -> usize {
        self.low_water_mark
    }

    /// Append an item. Hands it back when the queue is full or closed.
    pub fn offer(&self, item: T) -> Result<(), T> {
        {
            let mut state = self.state.lock().expect("Mutex should not be poisoned");
            if state.closed || state.items.len() >= self.capacity {
                return Err(item);
            }
            state.items.push_back(item);
        }
        self.not_empty.notify_one();
        Ok(())
    }

    /// Wait for the next item. `None` once the queue is closed and empty.
    pub async fn take(&self) -> Option<T> {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().expect("Mutex should not be poisoned");
                if let Some(item) = state.items.pop_front() {
                    let more = !state.items.is_empty();
                    let len = state.items.len();
                    drop(state);
                    if more {
                        // Pass the wakeup on; offer() only notifies one waiter
                        self.not_empty.notify_one();
                    }
                    self.signal_dequeue(len);
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    pub fn try_take(&self) -> Option<T> {
        let mut state = self.state.lock().expect("Mutex should not be poisoned");
        let item = state.items.pop_front()?;
        let len = state.items.len();
        drop(state);
        self.signal_dequeue(len);
        Some(item)
    }

    /// Remove and return everything currently queued.
    pub fn drain(&self) -> Vec<T> {
        let items: Vec<T> = {
            let mut state = self.state.lock().expect("Mutex should not be poisoned");
            state.items.drain(..).collect()
        };
        self.below_threshold.notify_waiters();
        items
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("Mutex should not be poisoned").items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn remaining_capacity(&self) -> usize {
        self.capacity.saturating_sub(self.len())
    }

    /// Reject further offers and wake every waiting consumer. Queued items
    /// remain available to `take` until drained.
    pub fn close(&self) {
        self.state.lock().expect("Mutex should not be poisoned").closed = true;
        self.not_empty.notify_waiters();
        self.below_threshold.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().expect("Mutex should not be poisoned").closed
    }

    /// Resolve once `len() <= low_water_mark` or `deadline` passes.
    ///
    /// Returns `true` if the threshold was reached.
    pub async fn wait_until_below_threshold(&self, deadline: Instant) -> bool {
        loop {
            let notified = self.below_threshold.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.state.lock().expect("Mutex should not be poisoned");
                if state.items.len() <= self.low_water_mark {
                    return true;
                }
                if state.closed {
                    return false;
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.len() <= self.low_water_mark;
            }
        }
    }

    fn signal_dequeue(&self, len_after: usize) {
        if len_after <= self.low_water_mark {
            self.below_threshold.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_offer_rejects_when_full() {
        let queue = BoundedWorkQueue::new(2, 1);
        assert!(queue.offer(1).is_ok());
        assert!(queue.offer(2).is_ok());
        assert_eq!(queue.offer(3), Err(3));
        assert_eq!(queue.remaining_capacity(), 0);
        assert_eq!(queue.try_take(), Some(1));
        assert_eq!(queue.remaining_capacity(), 1);
    }

    #[test]
    fn test_fifo_and_drain() {
        let queue = BoundedWorkQueue::new(4, 2);
        for i in 0..4 {
            queue.offer(i).unwrap();
        }
        assert_eq!(queue.try_take(), Some(0));
        assert_eq!(queue.drain(), vec![1, 2, 3]);
        assert!(queue.is_empty());
        assert_eq!(queue.try_take(), None);
    }

    #[test]
    fn test_low_water_mark_clamped_to_capacity() {
        let queue: BoundedWorkQueue<u8> = BoundedWorkQueue::new(3, 10);
        assert_eq!(queue.low_water_mark(), 3);
    }

    #[tokio::test]
    async fn test_take_waits_for_offer() {
        let queue = Arc::new(BoundedWorkQueue::new(4, 1));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.take().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.offer(7).unwrap();
        assert_eq!(consumer.await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn test_close_wakes_consumers_after_remaining_items() {
        let queue = Arc::new(BoundedWorkQueue::new(4, 1));
        queue.offer(1).unwrap();
        queue.close();
        assert!(queue.offer(2).is_err());
        assert_eq!(queue.take().await, Some(1));
        assert_eq!(queue.take().await, None);

        let idle = Arc::new(BoundedWorkQueue::<u32>::new(4, 1));
        let waiter = {
            let idle = idle.clone();
            tokio::spawn(async move { idle.take().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        idle.close();
        assert_eq!(waiter.await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_wait_until_below_threshold_returns_immediately_when_low() {
        let queue = BoundedWorkQueue::new(4, 2);
        queue.offer(1).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        assert!(queue.wait_until_below_threshold(deadline).await);
    }

    #[tokio::test]
    async fn test_wait_until_below_threshold_times_out() {
        let queue = BoundedWorkQueue::new(2, 0);
        queue.offer(1).unwrap();
        let started = Instant::now();
        let reached = queue
            .wait_until_below_threshold(started + Duration::from_millis(50))
            .await;
        assert!(!reached);
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_wait_until_below_threshold_wakes_on_dequeue() {
        let queue = Arc::new(BoundedWorkQueue::new(3, 1));
        for i in 0..3 {
            queue.offer(i).unwrap();
        }
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .wait_until_below_threshold(Instant::now() + Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.try_take();
        queue.try_take();
        assert!(waiter.await.unwrap());
    }
}
