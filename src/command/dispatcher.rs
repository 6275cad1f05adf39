//! Command id to handler routing.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use super::{Command, CommandQueue};
use crate::error::DispatchError;

/// A command handler. Returns false when the command cannot be handled
/// yet and must be retried later.
pub type Handler = Arc<dyn Fn(&Command) -> bool + Send + Sync>;

#[derive(Clone)]
struct Entry {
    handler: Handler,
    queue: Option<Arc<CommandQueue>>,
}

/// Routes commands of one packet family to handlers.
///
/// Handlers registered without a queue run inline on the receiving task;
/// with a queue, the command is tagged with its handler and queued.
pub struct Dispatcher {
    name: &'static str,
    entries: RwLock<HashMap<u32, Entry>>,
}

impl Dispatcher {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Register `handler` for `command`.
    pub fn register_command(
        &self,
        command: u32,
        handler: Handler,
        queue: Option<Arc<CommandQueue>>,
    ) -> Result<(), DispatchError> {
        let mut entries = self.entries.write();
        if entries.contains_key(&command) {
            return Err(DispatchError::Collision(command));
        }
        entries.insert(command, Entry { handler, queue });
        Ok(())
    }

    /// Remove the handler for `command`. Returns whether one was registered.
    pub fn unregister_command(&self, command: u32) -> bool {
        self.entries.write().remove(&command).is_some()
    }

    pub fn is_registered(&self, command: u32) -> bool {
        self.entries.read().contains_key(&command)
    }

    /// Drop every registration.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Route a command to its handler.
    ///
    /// Returns false if the handler could not process the command yet.
    pub fn dispatch_command(&self, command: &Command) -> bool {
        let id = command.command();
        let entry = self.entries.read().get(&id).cloned();
        let Some(entry) = entry else {
            return self.unknown_command(command);
        };

        match entry.queue {
            None => (entry.handler)(command),
            Some(queue) => {
                command.set_dispatch_function(entry.handler);
                queue.push(command.clone());
                true
            }
        }
    }

    fn unknown_command(&self, command: &Command) -> bool {
        tracing::error!(
            dispatcher = self.name,
            packet_type = command.packet_type(),
            command = command.command(),
            "Unknown command"
        );
        crate::metrics::record_unknown_command();
        true
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<u32> = self.entries.read().keys().copied().collect();
        ids.sort_unstable();
        f.debug_struct("Dispatcher")
            .field("name", &self.name)
            .field("commands", &ids)
            .finish()
    }
}
