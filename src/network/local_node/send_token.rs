//! The send token.
//!
//! Every node owns one token. Peers acquire it before a burst of traffic
//! to that node and release it afterwards; requests that arrive while the
//! token is out are queued. A holder that keeps the token longer than the
//! default timeout loses it: the next request regenerates the token.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};
use weft_proto::packet::node::{
    AcquireSendTokenPacket, AcquireSendTokenReplyPacket, ReleaseSendTokenPacket,
};

use super::LocalNodeInner;
use crate::command::Command;
use crate::network::{Node, RequestValue};

/// A granted send token; give it back with
/// [`LocalNode::release_send_token`](super::LocalNode::release_send_token).
#[must_use = "a send token must be released"]
#[derive(Debug)]
pub struct SendToken {
    node: Arc<Node>,
}

impl SendToken {
    /// The node that granted the token.
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }
}

/// Owner side bookkeeping, generic over the queued request.
#[derive(Debug)]
struct TokenQueue<T> {
    available: bool,
    /// Time of the last grant or release, in node milliseconds.
    last: u64,
    waiting: VecDeque<T>,
}

impl<T> TokenQueue<T> {
    fn new() -> Self {
        Self {
            available: true,
            last: 0,
            waiting: VecDeque::new(),
        }
    }

    /// Returns the request back if the token is granted to it right away.
    fn acquire(&mut self, request: T, now: u64, timeout: u64) -> Option<T> {
        if !self.available {
            if now.saturating_sub(self.last) <= timeout {
                self.waiting.push_back(request);
                return None;
            }
            warn!(held_ms = now.saturating_sub(self.last), "Send token not released, regenerating");
            self.waiting.clear();
        }
        self.available = false;
        self.last = now;
        Some(request)
    }

    /// The next request to grant the token to, if any.
    fn release(&mut self, now: u64) -> Option<T> {
        self.last = now;
        if self.available {
            debug!("Send token released twice");
            return None;
        }
        let next = self.waiting.pop_front();
        if next.is_none() {
            self.available = true;
        }
        next
    }
}

pub(super) struct SendTokenState {
    queue: Mutex<TokenQueue<Command>>,
}

impl SendTokenState {
    pub(super) fn new() -> Self {
        Self {
            queue: Mutex::new(TokenQueue::new()),
        }
    }
}

fn grant(command: &Command) {
    let (Ok(packet), Some(node)) = (command.packet::<AcquireSendTokenPacket>(), command.node()) else {
        return;
    };
    node.send_packet(&AcquireSendTokenReplyPacket {
        request_id: packet.request_id,
    });
}

pub(super) fn cmd_acquire(local: &Arc<LocalNodeInner>, command: &Command) -> bool {
    let timeout = local.config().timeouts.default_timeout().as_millis() as u64;
    let granted = local
        .send_token
        .queue
        .lock()
        .acquire(command.clone(), local.get_time(), timeout);
    if let Some(command) = granted {
        grant(&command);
    }
    true
}

pub(super) fn cmd_acquire_reply(local: &Arc<LocalNodeInner>, command: &Command) -> bool {
    if let Ok(packet) = command.packet::<AcquireSendTokenReplyPacket>() {
        local
            .requests()
            .serve_request(packet.request_id, RequestValue::Bool(true));
    }
    true
}

pub(super) fn cmd_release(local: &Arc<LocalNodeInner>, _command: &Command) -> bool {
    let next = local.send_token.queue.lock().release(local.get_time());
    if let Some(command) = next {
        grant(&command);
    }
    true
}

impl LocalNodeInner {
    pub(crate) async fn acquire_send_token(&self, node: &Arc<Node>) -> Option<SendToken> {
        let request_id = self.requests().register_request(None);
        let packet = AcquireSendTokenPacket {
            request_id,
            time: self.get_time(),
        };
        if !node.send_packet(&packet) {
            self.requests().unregister_request(request_id);
            return None;
        }
        match self
            .requests()
            .wait_request(request_id, self.config().timeouts.default_timeout())
            .await
        {
            Ok(_) => Some(SendToken {
                node: Arc::clone(node),
            }),
            Err(e) => {
                warn!(node = %node.id(), error = %e, "Send token not granted");
                None
            }
        }
    }

    pub(crate) fn release_send_token(&self, token: SendToken) {
        token.node.send_packet(&ReleaseSendTokenPacket {});
    }
}
