//! FIFO feeding the command task.

use std::time::Duration;

use super::Command;
use crate::error::NodeResult;
use crate::util::MtQueue;

/// Thread-safe command FIFO.
///
/// Commands pushed here already carry their dispatch function; the
/// consumer pops and [`invoke`](Command::invoke)s them.
#[derive(Debug, Default)]
pub struct CommandQueue {
    inner: MtQueue<Command>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, command: Command) {
        self.inner.push(command);
    }

    pub fn push_front(&self, command: Command) {
        self.inner.push_front(command);
    }

    /// Wait up to `timeout` for the next command.
    pub async fn pop(&self, timeout: Duration) -> NodeResult<Command> {
        self.inner.pop(timeout).await
    }

    /// Wait for the next command without limit.
    pub async fn pop_wait(&self) -> Command {
        self.inner.pop_wait().await
    }

    pub fn try_pop(&self) -> Option<Command> {
        self.inner.try_pop()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Drop everything queued.
    pub fn flush(&self) {
        self.inner.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandCache;
    use crate::error::TimeoutKind;

    #[tokio::test]
    async fn test_push_front_jumps_queue() {
        let cache = CommandCache::new();
        let queue = CommandQueue::new();
        let first = cache.alloc(None, 16);
        let urgent = cache.alloc(None, 16);
        queue.push(first);
        queue.push_front(urgent.clone());
        let popped = queue.pop(Duration::from_secs(1)).await.unwrap();
        assert_eq!(popped.ref_count(), 2);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_queue_times_out() {
        let queue = CommandQueue::new();
        let err = queue.pop(Duration::from_millis(5)).await.unwrap_err();
        assert!(err.is_timeout(TimeoutKind::QueuePop));
    }
}
