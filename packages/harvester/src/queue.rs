//! Shared channel work queue.
//!
//! Multi-producer, multi-consumer. Re-queued tasks go to the back. Besides
//! the items themselves the queue counts unfinished tasks (enqueued and not
//! yet marked done) so the driver can tell when all work, including work
//! re-queued late, has settled before it asks workers to stop.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::Notify;

use crate::types::ChannelTask;

/// What a worker gets from [`ChannelQueue::dequeue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueItem {
    Task(ChannelTask),
    /// Stop pulling work; exactly one is enqueued per worker
    Shutdown,
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<QueueItem>,
    unfinished: usize,
}

#[derive(Default)]
pub struct ChannelQueue {
    state: Mutex<QueueState>,
    item_ready: Notify,
    drained: Notify,
}

impl ChannelQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a queue pre-filled with tasks, in order.
    pub fn with_tasks(tasks: impl IntoIterator<Item = ChannelTask>) -> Self {
        let queue = Self::new();
        for task in tasks {
            queue.enqueue(task);
        }
        queue
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a task. Counts as unfinished until [`task_done`](Self::task_done).
    pub fn enqueue(&self, task: ChannelTask) {
        {
            let mut state = self.lock();
            state.items.push_back(QueueItem::Task(task));
            state.unfinished += 1;
        }
        self.item_ready.notify_one();
    }

    /// Wait for the next item.
    pub async fn dequeue(&self) -> QueueItem {
        loop {
            if let Some(item) = self.try_dequeue() {
                return item;
            }
            self.item_ready.notified().await;
        }
    }

    /// Next item, if one is available right now.
    pub fn try_dequeue(&self) -> Option<QueueItem> {
        self.lock().items.pop_front()
    }

    /// Mark one dequeued task as settled (completed, failed or re-queued).
    pub fn task_done(&self) {
        let drained = {
            let mut state = self.lock();
            state.unfinished = state.unfinished.saturating_sub(1);
            state.unfinished == 0
        };
        if drained {
            self.drained.notify_waiters();
        }
    }

    /// Resolve once no unfinished task remains.
    pub async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.unfinished() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Enqueue one shutdown signal per worker. Signals are not tasks and do
    /// not count as unfinished.
    pub fn request_shutdown(&self, workers: usize) {
        {
            let mut state = self.lock();
            for _ in 0..workers {
                state.items.push_back(QueueItem::Shutdown);
            }
        }
        for _ in 0..workers {
            self.item_ready.notify_one();
        }
    }

    /// Tasks enqueued and not yet marked done.
    pub fn unfinished(&self) -> usize {
        self.lock().unfinished
    }

    /// Items currently waiting in the queue (tasks and signals).
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tasks still waiting in the queue, in order.
    pub fn pending_tasks(&self) -> Vec<ChannelTask> {
        self.lock()
            .items
            .iter()
            .filter_map(|item| match item {
                QueueItem::Task(task) => Some(task.clone()),
                QueueItem::Shutdown => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChannelRef;
    use std::sync::Arc;
    use std::time::Duration;

    fn task(name: &str) -> ChannelTask {
        ChannelTask::new(ChannelRef::new(name, false))
    }

    #[tokio::test]
    async fn test_fifo_with_requeue_to_back() {
        let queue = ChannelQueue::with_tasks([task("a"), task("b")]);

        let QueueItem::Task(first) = queue.dequeue().await else {
            panic!("expected task");
        };
        assert_eq!(first.identity(), "a");
        queue.enqueue(first);
        queue.task_done();

        let order: Vec<String> = std::iter::from_fn(|| queue.try_dequeue())
            .filter_map(|item| match item {
                QueueItem::Task(t) => Some(t.channel.username),
                QueueItem::Shutdown => None,
            })
            .collect();
        assert_eq!(order, vec!["b", "a"]);
        assert_eq!(queue.unfinished(), 2);
    }

    #[tokio::test]
    async fn test_dequeue_waits_for_enqueue() {
        let queue = Arc::new(ChannelQueue::new());
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue(task("late"));

        let item = tokio::time::timeout(Duration::from_secs(2), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item, QueueItem::Task(task("late")));
    }

    #[tokio::test]
    async fn test_wait_drained_tracks_requeues() {
        let queue = Arc::new(ChannelQueue::with_tasks([task("a")]));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.wait_drained().await })
        };

        let QueueItem::Task(t) = queue.dequeue().await else {
            panic!("expected task");
        };
        // Re-queue before settling: never drained in between.
        queue.enqueue(t);
        queue.task_done();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        let _ = queue.dequeue().await;
        queue.task_done();

        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(queue.unfinished(), 0);
    }

    #[tokio::test]
    async fn test_wait_drained_on_empty_queue_returns() {
        let queue = ChannelQueue::new();
        tokio::time::timeout(Duration::from_secs(1), queue.wait_drained())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_one_shutdown_per_worker() {
        let queue = Arc::new(ChannelQueue::new());
        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.dequeue().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.request_shutdown(3);

        for consumer in consumers {
            let item = tokio::time::timeout(Duration::from_secs(2), consumer)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(item, QueueItem::Shutdown);
        }
        assert!(queue.is_empty());
        assert_eq!(queue.unfinished(), 0);
    }
}
