//! Async multi-producer, multi-consumer FIFO.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{NodeError, NodeResult, TimeoutKind};

/// A FIFO that consumers can await.
///
/// Producers never block. Each push wakes one waiting consumer.
#[derive(Debug)]
pub struct MtQueue<T> {
    items: Mutex<VecDeque<T>>,
    ready: Notify,
}

impl<T> MtQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            ready: Notify::new(),
        }
    }

    pub fn push(&self, item: T) {
        self.items.lock().push_back(item);
        self.ready.notify_one();
    }

    /// Insert at the head, ahead of everything queued.
    pub fn push_front(&self, item: T) {
        self.items.lock().push_front(item);
        self.ready.notify_one();
    }

    pub fn try_pop(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    /// Wait for an item without limit.
    pub async fn pop_wait(&self) -> T {
        loop {
            let notified = self.ready.notified();
            if let Some(item) = self.try_pop() {
                return item;
            }
            notified.await;
        }
    }

    /// Wait for an item for at most `timeout`.
    pub async fn pop(&self, timeout: Duration) -> NodeResult<T> {
        tokio::time::timeout(timeout, self.pop_wait())
            .await
            .map_err(|_| NodeError::Timeout(TimeoutKind::QueuePop))
    }

    /// Copy of the first item, if any.
    pub fn front(&self) -> Option<T>
    where
        T: Clone,
    {
        self.items.lock().front().cloned()
    }

    /// Copy of the last item, if any.
    pub fn back(&self) -> Option<T>
    where
        T: Clone,
    {
        self.items.lock().back().cloned()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Remove and return everything queued.
    pub fn drain(&self) -> Vec<T> {
        self.items.lock().drain(..).collect()
    }

    pub fn clear(&self) {
        self.items.lock().clear();
    }
}

impl<T> Default for MtQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_fifo_order_and_push_front() {
        let queue = MtQueue::new();
        queue.push(1);
        queue.push(2);
        queue.push_front(0);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.try_pop(), Some(0));
        assert_eq!(queue.try_pop(), Some(1));
        assert_eq!(queue.try_pop(), Some(2));
        assert_eq!(queue.try_pop(), None);
    }

    #[tokio::test]
    async fn test_pop_times_out() {
        let queue: MtQueue<u8> = MtQueue::new();
        let err = queue.pop(Duration::from_millis(10)).await.unwrap_err();
        assert!(err.is_timeout(TimeoutKind::QueuePop));
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let queue = Arc::new(MtQueue::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        queue.push("hello");
        assert_eq!(consumer.await.unwrap().unwrap(), "hello");
    }
}
