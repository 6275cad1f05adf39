//! The receiver task.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use weft_proto::packet::{NodeCommand, PacketType};

use super::{LocalNodeInner, handshake};
use crate::command::Command;
use crate::network::connection::ConnectionEvent;
use crate::network::{Connection, NodeState};

/// Consecutive read errors after which a connection is dropped.
const MAX_ERRORS: u32 = 100;

/// Commands held back at most; the oldest is dropped beyond that.
const MAX_PENDING: usize = 200;

/// Commands whose handler could not run yet, in arrival order.
#[derive(Default)]
pub(super) struct PendingCommands {
    commands: VecDeque<Command>,
}

impl PendingCommands {
    pub(super) fn push(&mut self, command: Command) {
        if self.commands.len() >= MAX_PENDING
            && let Some(dropped) = self.commands.pop_front()
        {
            error!(command = ?dropped, "Too many pending commands, dropping the oldest");
        }
        self.commands.push_back(command);
    }

    /// Retry every held command once with `dispatch`, keeping the ones that
    /// still fail in their original order.
    pub(super) fn redispatch(&mut self, mut dispatch: impl FnMut(&Command) -> bool) {
        let held = std::mem::take(&mut self.commands);
        for command in held {
            if dispatch(&command) {
                crate::metrics::record_redispatch();
            } else {
                self.commands.push_back(command);
            }
        }
    }

    pub(super) fn len(&self) -> usize {
        self.commands.len()
    }
}

pub(super) async fn run(local: Arc<LocalNodeInner>, mut events: mpsc::UnboundedReceiver<ConnectionEvent>) {
    let mut pending = PendingCommands::default();
    let mut errors: HashMap<usize, u32> = HashMap::new();
    let mut tick = tokio::time::interval(local.config().timeouts.select());
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    debug!("Receiver started");
    while local.is_listening() {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                handle_event(&local, event, &mut pending, &mut errors);
            }
            _ = tick.tick() => {
                local.ping_idle_peers();
                pending.redispatch(|cmd| local.dispatch(cmd));
            }
        }
    }

    if pending.len() > 0 {
        warn!(count = pending.len(), "Receiver stopped with pending commands");
    }
    debug!("Receiver stopped");
}

fn handle_event(
    local: &Arc<LocalNodeInner>,
    event: ConnectionEvent,
    pending: &mut PendingCommands,
    errors: &mut HashMap<usize, u32>,
) {
    match event {
        ConnectionEvent::Connect(connection) => {
            debug!(connection = ?connection, "Incoming connection");
        }
        ConnectionEvent::Data(connection, frame) => {
            errors.remove(&connection.id());
            handle_data(local, &connection, &frame, pending);
        }
        ConnectionEvent::Disconnect(connection) => {
            errors.remove(&connection.id());
            debug!(connection = ?connection, "Connection closed");
            local.remove_connection(&connection);
            pending.redispatch(|cmd| local.dispatch(cmd));
        }
        ConnectionEvent::Error(connection, e) => {
            crate::metrics::record_error(e.error_code());
            let count = errors.entry(connection.id()).or_insert(0);
            *count += 1;
            if *count > MAX_ERRORS {
                warn!(connection = ?connection, error = %e, "Too many errors, closing connection");
                errors.remove(&connection.id());
                connection.close();
            }
        }
        ConnectionEvent::Interrupt => {
            pending.redispatch(|cmd| local.dispatch(cmd));
        }
    }
}

fn handle_data(
    local: &Arc<LocalNodeInner>,
    connection: &Connection,
    frame: &[u8],
    pending: &mut PendingCommands,
) {
    let node = local
        .connection_nodes
        .get(&connection.id())
        .map(|n| Arc::clone(n.value()));
    if let Some(node) = &node {
        node.touch(local.get_time());
    }

    let command = local.command_cache().alloc_frame(node.clone(), frame);
    if command.kind() == Some(PacketType::Node) {
        match NodeCommand::from_u32(command.command()) {
            Some(NodeCommand::Connect) => {
                handshake::on_connect(local, connection, &command);
                return;
            }
            Some(NodeCommand::ConnectReply) => {
                handshake::on_connect_reply(local, connection, &command);
                return;
            }
            _ => {}
        }
    }
    if node.is_none() {
        warn!(connection = ?connection, command = ?command, "Dropping command from unknown peer");
        return;
    }
    if local.state() == NodeState::Closed {
        return;
    }

    if local.dispatch(&command) {
        pending.redispatch(|cmd| local.dispatch(cmd));
    } else {
        pending.redispatch(|cmd| local.dispatch(cmd));
        pending.push(command);
    }
}
