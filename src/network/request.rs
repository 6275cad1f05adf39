//! Request ids mapped to pending results.
//!
//! A caller registers a request, sends a packet carrying the id, and waits.
//! The reply handler serves the request with a [`RequestValue`], usually on
//! another task.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use weft_proto::{NodeId, Version};

use super::Node;
use crate::error::{NodeError, NodeResult, TimeoutKind};

/// The result a request is served with.
#[derive(Debug, Clone)]
pub enum RequestValue {
    None,
    Bool(bool),
    U32(u32),
    NodeId(NodeId),
    Node(Arc<Node>),
    Version(Version),
}

impl RequestValue {
    /// The boolean result; anything but `Bool(true)` is false.
    pub fn as_bool(&self) -> bool {
        matches!(self, Self::Bool(true))
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Self::U32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_node_id(&self) -> Option<NodeId> {
        match self {
            Self::NodeId(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_node(&self) -> Option<Arc<Node>> {
        match self {
            Self::Node(node) => Some(Arc::clone(node)),
            _ => None,
        }
    }

    pub fn as_version(&self) -> Option<Version> {
        match self {
            Self::Version(v) => Some(*v),
            _ => None,
        }
    }
}

type RequestData = Arc<dyn Any + Send + Sync>;

struct Pending {
    tx: Option<oneshot::Sender<RequestValue>>,
    rx: Option<oneshot::Receiver<RequestValue>>,
    data: Option<RequestData>,
}

/// Table of outstanding requests.
pub struct RequestHandler {
    next_id: AtomicU32,
    pending: DashMap<u32, Pending>,
}

impl RequestHandler {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU32::new(1),
            pending: DashMap::new(),
        }
    }

    /// Register a request, optionally carrying data for the reply handler.
    pub fn register_request(&self, data: Option<RequestData>) -> u32 {
        let (tx, rx) = oneshot::channel();
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            // Zero and u32::MAX mean "no request" on the wire.
            if id == 0 || id == u32::MAX {
                continue;
            }
            if self.pending.contains_key(&id) {
                continue;
            }
            self.pending.insert(
                id,
                Pending {
                    tx: Some(tx),
                    rx: Some(rx),
                    data,
                },
            );
            return id;
        }
    }

    /// Data attached at registration, if it has type `T`.
    pub fn get_request_data<T: Any + Send + Sync>(&self, id: u32) -> Option<Arc<T>> {
        let data = self.pending.get(&id)?.data.clone()?;
        data.downcast::<T>().ok()
    }

    /// Complete a request. Returns false if it is unknown or already served.
    pub fn serve_request(&self, id: u32, value: RequestValue) -> bool {
        let tx = match self.pending.get_mut(&id) {
            Some(mut pending) => pending.tx.take(),
            None => None,
        };
        match tx {
            Some(tx) => {
                // The waiter may have timed out and dropped its receiver.
                let _ = tx.send(value);
                true
            }
            None => {
                tracing::debug!(request = id, "Serve for unknown request");
                false
            }
        }
    }

    /// Wait for a request to be served, then forget it.
    pub async fn wait_request(&self, id: u32, timeout: Duration) -> NodeResult<RequestValue> {
        let rx = self.pending.get_mut(&id).and_then(|mut pending| pending.rx.take());
        let Some(rx) = rx else {
            panic!("request {id} is not registered or already waited on");
        };
        let result = tokio::time::timeout(timeout, rx).await;
        self.pending.remove(&id);
        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(NodeError::Closed),
            Err(_) => Err(NodeError::Timeout(TimeoutKind::Request)),
        }
    }

    /// Drop a request without waiting for it.
    pub fn unregister_request(&self, id: u32) {
        self.pending.remove(&id);
    }

    pub fn is_pending(&self, id: u32) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl Default for RequestHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_serve_then_wait() {
        let handler = RequestHandler::new();
        let id = handler.register_request(None);
        assert!(handler.serve_request(id, RequestValue::Bool(true)));
        assert!(!handler.serve_request(id, RequestValue::Bool(false)));
        let value = handler.wait_request(id, Duration::from_secs(1)).await.unwrap();
        assert!(value.as_bool());
        assert!(!handler.is_pending(id));
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let handler = RequestHandler::new();
        let id = handler.register_request(None);
        let err = handler
            .wait_request(id, Duration::from_millis(5))
            .await
            .unwrap_err();
        assert!(err.is_timeout(TimeoutKind::Request));
        assert!(handler.is_empty());
    }

    #[tokio::test]
    async fn test_served_from_another_task() {
        let handler = Arc::new(RequestHandler::new());
        let id = handler.register_request(None);
        let server = Arc::clone(&handler);
        tokio::spawn(async move {
            server.serve_request(id, RequestValue::Version(Version::from_low(3)));
        });
        let value = handler.wait_request(id, Duration::from_secs(1)).await.unwrap();
        assert_eq!(value.as_version(), Some(Version::from_low(3)));
    }

    #[test]
    fn test_request_data_downcasts() {
        let handler = RequestHandler::new();
        let id = handler.register_request(Some(Arc::new(42u64)));
        assert_eq!(handler.get_request_data::<u64>(id).as_deref(), Some(&42));
        assert!(handler.get_request_data::<String>(id).is_none());
        assert!(handler.get_request_data::<u64>(id + 1).is_none());
    }
}
