//! The command task: runs queued handlers one at a time.

use std::sync::Arc;

use tracing::{debug, error};

use super::LocalNodeInner;
use crate::network::NodeState;

pub(super) async fn run(local: Arc<LocalNodeInner>) {
    let queue = local.command_queue();
    debug!("Command task started");
    while local.state() != NodeState::Closed {
        let command = match queue.try_pop() {
            Some(command) => command,
            None => {
                if local.store().notify_command_task_idle(&local) {
                    continue;
                }
                queue.pop_wait().await
            }
        };
        if !command.invoke() {
            error!(command = ?command, "Queued command failed");
        }
    }
    debug!("Command task stopped");
}
