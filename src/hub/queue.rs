//! FIFO work queue with a bounded-wait pop and a scan hook.
//!
//! Channels would hide the queued items; the duplication check has to scan
//! pending work for matching identifiers, so the queue is a guarded deque
//! with a notifier. The timed pop is the only blocking wait the hub's hot
//! loops perform, keeping shutdown responsive.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

pub struct WorkQueue<T> {
    items: Mutex<VecDeque<T>>,
    notify: Notify,
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WorkQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    pub fn push(&self, item: T) {
        self.items.lock().push_back(item);
        self.notify.notify_one();
    }

    /// Pops the oldest item, waiting up to `timeout` for one to arrive.
    pub async fn pop(&self, timeout: Duration) -> Option<T> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register interest before checking, so a push between the
            // check and the wait cannot be missed
            let notified = self.notify.notified();
            if let Some(item) = self.items.lock().pop_front() {
                return Some(item);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    /// Non-blocking pop.
    pub fn try_pop(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    /// True when any queued item satisfies the predicate. Runs under the
    /// queue lock; keep predicates cheap.
    pub fn scan<F>(&self, predicate: F) -> bool
    where
        F: Fn(&T) -> bool,
    {
        self.items.lock().iter().any(|item| predicate(item))
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Removes and returns everything queued, oldest first.
    pub fn drain(&self) -> Vec<T> {
        self.items.lock().drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_push_pop_fifo() {
        let queue = WorkQueue::new();
        queue.push(1);
        queue.push(2);
        assert_eq!(queue.pop(Duration::from_millis(10)).await, Some(1));
        assert_eq!(queue.pop(Duration::from_millis(10)).await, Some(2));
    }

    #[tokio::test]
    async fn test_pop_times_out_when_empty() {
        let queue: WorkQueue<i32> = WorkQueue::new();
        let started = std::time::Instant::now();
        assert_eq!(queue.pop(Duration::from_millis(50)).await, None);
        assert!(started.elapsed() >= Duration::from_millis(45));
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let queue = std::sync::Arc::new(WorkQueue::new());
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(42);
        assert_eq!(consumer.await.unwrap(), Some(42));
    }

    #[tokio::test]
    async fn test_scan_sees_pending_items() {
        let queue = WorkQueue::new();
        queue.push("a".to_string());
        queue.push("b".to_string());
        assert!(queue.scan(|item| item == "b"));
        assert!(!queue.scan(|item| item == "c"));
    }

    #[tokio::test]
    async fn test_drain_empties_in_order() {
        let queue = WorkQueue::new();
        for i in 0..5 {
            queue.push(i);
        }
        assert_eq!(queue.drain(), vec![0, 1, 2, 3, 4]);
        assert!(queue.is_empty());
    }
}
