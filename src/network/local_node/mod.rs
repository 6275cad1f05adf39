//! The local node.
//!
//! A [`LocalNode`] owns the listening endpoints, the table of connected
//! peers, the node command dispatcher and the object store. Two tasks run
//! while it listens:
//!
//! - the receiver task reads every connection event, runs handshake and
//!   inline handlers and keeps commands that cannot be dispatched yet;
//! - the command task runs queued handlers in arrival order.
//!
//! The node talks to itself through an in-process pipe, so local commands
//! (stop, disconnect, send-on-register) take the same path as remote ones.

mod command_task;
mod handshake;
mod receiver;
mod send_token;

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};
use weft_proto::packet::node::{PingPacket, RemoveNodePacket, StopRcvPacket};
use weft_proto::packet::{NodeCommand, ObjectCommand, Packet, PacketType};
use weft_proto::{ConnectionDescription, ConnectionType, NodeId, ObjectId, Version};

use super::connection::{ConnectionEvent, EventSender, Listener, pipe_pair};
use super::{Connection, Node, NodeState, RequestHandler};
use crate::command::{Command, CommandCache, CommandQueue, Dispatcher, Handler};
use crate::config::Config;
use crate::error::{DispatchError, NodeError, NodeResult};
use crate::object::{Distributed, InstanceCache, Object, ObjectApi, ObjectStore, PushHandler};

pub use send_token::SendToken;

type NodeHandler = fn(&Arc<LocalNodeInner>, &Command) -> bool;

/// Built-in node commands: `(command, handler, queued)`.
///
/// CONNECT and CONNECT_REPLY are missing on purpose: they arrive before the
/// sending node is known and are handled by the receiver directly.
const HANDLERS: &[(NodeCommand, NodeHandler, bool)] = &[
    (NodeCommand::StopRcv, LocalNodeInner::cmd_stop_rcv, false),
    (NodeCommand::StopCmd, LocalNodeInner::cmd_stop_cmd, true),
    (NodeCommand::ConnectAck, handshake::cmd_connect_ack, false),
    (NodeCommand::Disconnect, handshake::cmd_disconnect, false),
    (NodeCommand::GetNodeData, handshake::cmd_get_node_data, true),
    (NodeCommand::GetNodeDataReply, handshake::cmd_get_node_data_reply, false),
    (NodeCommand::AcquireSendToken, send_token::cmd_acquire, true),
    (NodeCommand::AcquireSendTokenReply, send_token::cmd_acquire_reply, false),
    (NodeCommand::ReleaseSendToken, send_token::cmd_release, true),
    (NodeCommand::Ping, LocalNodeInner::cmd_ping, true),
];

/// Shared state of a [`LocalNode`].
pub(crate) struct LocalNodeInner {
    id: NodeId,
    node_type: u32,
    config: Arc<Config>,
    self_node: Arc<Node>,
    /// Connected peers and the local node, by id.
    nodes: DashMap<NodeId, Arc<Node>>,
    /// Nodes by the id of the connection their frames arrive on.
    connection_nodes: DashMap<usize, Arc<Node>>,
    requests: RequestHandler,
    command_cache: CommandCache,
    command_queue: Arc<CommandQueue>,
    dispatcher: Dispatcher,
    store: ObjectStore,
    events: EventSender,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ConnectionEvent>>>,
    cancel: CancellationToken,
    /// Serializes outgoing connects so one peer is never dialed twice.
    connect_lock: tokio::sync::Mutex<()>,
    send_token: send_token::SendTokenState,
    start: Instant,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LocalNodeInner {
    fn new(config: Arc<Config>) -> Arc<Self> {
        let id = config.node_id();
        let node_type = config.node.node_type;
        let (events, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Self {
            id,
            node_type,
            self_node: Arc::new(Node::new_local(id, node_type)),
            nodes: DashMap::new(),
            connection_nodes: DashMap::new(),
            requests: RequestHandler::new(),
            command_cache: CommandCache::new(),
            command_queue: Arc::new(CommandQueue::new()),
            dispatcher: Dispatcher::new("node"),
            store: ObjectStore::new(&config),
            events,
            events_rx: Mutex::new(Some(events_rx)),
            cancel: CancellationToken::new(),
            connect_lock: tokio::sync::Mutex::new(()),
            send_token: send_token::SendTokenState::new(),
            start: Instant::now(),
            tasks: Mutex::new(Vec::new()),
            config,
        });
        inner.register_handlers();
        ObjectStore::register_handlers(&inner);
        inner
    }

    fn register_handlers(self: &Arc<Self>) {
        for &(command, handler, queued) in HANDLERS {
            let weak = Arc::downgrade(self);
            let f: Handler = Arc::new(move |cmd: &Command| match weak.upgrade() {
                Some(local) => handler(&local, cmd),
                None => true,
            });
            let queue = queued.then(|| self.command_queue());
            if let Err(e) = self.dispatcher.register_command(command as u32, f, queue) {
                error!(command = command.name(), error = %e, "Cannot register node handler");
            }
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub(crate) fn id(&self) -> NodeId {
        self.id
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn requests(&self) -> &RequestHandler {
        &self.requests
    }

    pub(crate) fn command_queue(&self) -> Arc<CommandQueue> {
        Arc::clone(&self.command_queue)
    }

    pub(crate) fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub(crate) fn command_cache(&self) -> &CommandCache {
        &self.command_cache
    }

    pub(crate) fn store(&self) -> &ObjectStore {
        &self.store
    }

    pub(crate) fn self_node(&self) -> Arc<Node> {
        Arc::clone(&self.self_node)
    }

    pub(crate) fn state(&self) -> NodeState {
        self.self_node.state()
    }

    fn set_state(&self, state: NodeState) {
        self.self_node.set_state(state);
    }

    pub(crate) fn is_listening(&self) -> bool {
        self.state() == NodeState::Listening
    }

    /// A node of the peer table, the local node included.
    pub(crate) fn get_node(&self, id: NodeId) -> Option<Arc<Node>> {
        self.nodes.get(&id).map(|n| Arc::clone(n.value()))
    }

    /// Connected peers, without the local node.
    pub(crate) fn connected_nodes(&self) -> Vec<Arc<Node>> {
        self.nodes
            .iter()
            .filter(|n| !n.is_local() && n.is_connected())
            .map(|n| Arc::clone(n.value()))
            .collect()
    }

    /// Milliseconds since the node was created.
    pub(crate) fn get_time(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Wake the receiver so it retries its pending commands.
    pub(crate) fn flush_commands(&self) {
        let _ = self.events.send(ConnectionEvent::Interrupt);
    }

    // ========================================================================
    // Peer table
    // ========================================================================

    fn add_node(&self, node: &Arc<Node>, connection: &Connection) {
        self.nodes.insert(node.id(), Arc::clone(node));
        self.connection_nodes.insert(connection.id(), Arc::clone(node));
        crate::metrics::set_connected_nodes(self.connected_nodes().len());
    }

    /// Forget the peer reached through `connection` and tell the object
    /// store about it. Returns false if the connection was not mapped.
    fn remove_connection(&self, connection: &Connection) -> bool {
        let Some((_, node)) = self.connection_nodes.remove(&connection.id()) else {
            return false;
        };
        if node.is_local() {
            return true;
        }
        self.nodes.remove_if(&node.id(), |_, n| Arc::ptr_eq(n, &node));
        if node.connection().as_ref() == Some(connection) {
            node.set_connection(None);
            node.set_state(NodeState::Closed);
        }
        info!(node = %node.id(), "Peer removed");

        let frame = RemoveNodePacket {
            node_id: node.id(),
            request_id: 0,
        }
        .to_frame();
        let command = self.command_cache.alloc_frame(Some(node), &frame);
        self.dispatch(&command);
        crate::metrics::set_connected_nodes(self.connected_nodes().len());
        true
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Route a received command. False means the command must be retried
    /// later.
    pub(crate) fn dispatch(&self, command: &Command) -> bool {
        match command.kind() {
            Some(PacketType::Node) => self.dispatcher.dispatch_command(command),
            Some(PacketType::Object) if command.command() == ObjectCommand::Instance as u32 => {
                self.store.cmd_instance(self, command)
            }
            Some(PacketType::Object) => self.store.dispatch_object_command(self, command),
            None => {
                warn!(packet_type = command.packet_type(), "Dropping command of unknown type");
                true
            }
        }
    }

    // ========================================================================
    // Built-in handlers
    // ========================================================================

    fn cmd_stop_rcv(self: &Arc<Self>, command: &Command) -> bool {
        debug!("Receiver stopping");
        self.set_state(NodeState::Closing);
        command.set_command(NodeCommand::StopCmd as u32);
        self.dispatcher.dispatch_command(command)
    }

    fn cmd_stop_cmd(self: &Arc<Self>, _command: &Command) -> bool {
        debug!("Command task stopping");
        self.set_state(NodeState::Closed);
        true
    }

    fn cmd_ping(self: &Arc<Self>, command: &Command) -> bool {
        if let Some(node) = command.node() {
            debug!(node = %node.id(), "Ping");
        }
        true
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    fn listen(self: &Arc<Self>) -> NodeResult<()> {
        if self.state() != NodeState::Closed {
            warn!(state = ?self.state(), "Listen on a node that is not closed");
            return Err(NodeError::NotListening);
        }
        let Some(events_rx) = self.events_rx.lock().take() else {
            return Err(NodeError::Closed);
        };

        let write_timeout = self.config.timeouts.default_timeout();
        let (to_self, from_self) = pipe_pair(self.events.clone(), write_timeout);
        self.self_node.set_connection(Some(to_self));
        self.nodes.insert(self.id, self.self_node());
        self.connection_nodes.insert(from_self.id(), self.self_node());

        let mut descriptions = Vec::new();
        let mut tasks = Vec::new();
        for description in &self.config.listen {
            if description.connection_type == ConnectionType::Pipe {
                // The loopback pipe above already serves in-process traffic.
                continue;
            }
            let listener = match Listener::bind(description) {
                Ok(listener) => listener,
                Err(e) => {
                    self.cancel.cancel();
                    return Err(e);
                }
            };
            descriptions.push(listener.description().clone());
            tasks.push(listener.spawn(self.events.clone(), write_timeout, self.cancel.child_token()));
        }
        self.self_node.set_descriptions(descriptions);
        self.set_state(NodeState::Listening);

        let span = crate::telemetry::node_span(self.id);
        tasks.push(tokio::spawn(
            receiver::run(Arc::clone(self), events_rx).instrument(span.clone()),
        ));
        tasks.push(tokio::spawn(command_task::run(Arc::clone(self)).instrument(span)));
        self.tasks.lock().extend(tasks);

        info!(node = %self.id, endpoints = self.self_node.descriptions().len(), "Node listening");
        Ok(())
    }

    async fn close(self: &Arc<Self>) -> NodeResult<()> {
        if !self.is_listening() {
            return Err(NodeError::NotListening);
        }
        self.self_node.send_packet(&StopRcvPacket {});
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        self.cancel.cancel();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Node task failed");
            }
        }

        for entry in self.connection_nodes.iter() {
            if let Some(connection) = entry.connection() {
                connection.close();
            }
        }
        self.connection_nodes.clear();
        self.nodes.clear();
        self.self_node.set_connection(None);
        self.set_state(NodeState::Closed);
        self.command_queue.flush();
        self.command_cache.flush();
        crate::metrics::set_connected_nodes(0);
        info!(node = %self.id, "Node closed");
        Ok(())
    }

    fn ping_idle_peers(&self) {
        let now = self.get_time();
        let keepalive = self.config.timeouts.keepalive().as_millis() as u64;
        for node in self.connected_nodes() {
            if now.saturating_sub(node.last_receive()) > keepalive {
                node.send_packet(&PingPacket { time: now });
            }
        }
    }
}

/// A node of the cluster, as seen from this process.
///
/// Cloning is cheap; clones share one node. [`close`](Self::close) must be
/// called to stop the node's tasks.
#[derive(Clone)]
pub struct LocalNode {
    inner: Arc<LocalNodeInner>,
}

impl LocalNode {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            inner: LocalNodeInner::new(config),
        }
    }

    pub(crate) fn inner(&self) -> &Arc<LocalNodeInner> {
        &self.inner
    }

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    pub fn node_type(&self) -> u32 {
        self.inner.node_type
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn state(&self) -> NodeState {
        self.inner.state()
    }

    pub fn is_listening(&self) -> bool {
        self.inner.is_listening()
    }

    /// Bind the configured endpoints and start the node's tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn listen(&self) -> NodeResult<()> {
        self.inner.listen()
    }

    /// Stop the tasks and drop every connection. A closed node cannot
    /// listen again.
    pub async fn close(&self) -> NodeResult<()> {
        self.inner.close().await
    }

    /// The endpoints this node listens on, with the ports actually bound.
    pub fn descriptions(&self) -> Vec<ConnectionDescription> {
        self.inner.self_node.descriptions()
    }

    /// Milliseconds since the node was created.
    pub fn get_time(&self) -> u64 {
        self.inner.get_time()
    }

    // ========================================================================
    // Peers
    // ========================================================================

    /// Connect to a node known to one of the connected peers.
    pub async fn connect(&self, id: NodeId) -> Option<Arc<Node>> {
        self.inner.connect(id).await
    }

    /// Connect to the node listening at `description`.
    pub async fn connect_to(&self, description: &ConnectionDescription) -> NodeResult<Arc<Node>> {
        self.inner.connect_to(description).await
    }

    /// Orderly disconnect from a peer.
    pub async fn disconnect(&self, node: &Arc<Node>) -> bool {
        self.inner.disconnect(node).await
    }

    pub fn get_node(&self, id: NodeId) -> Option<Arc<Node>> {
        self.inner.get_node(id)
    }

    /// Connected peers, without the local node.
    pub fn get_nodes(&self) -> Vec<Arc<Node>> {
        self.inner.connected_nodes()
    }

    pub fn ping(&self, node: &Node) -> bool {
        node.send_packet(&PingPacket {
            time: self.inner.get_time(),
        })
    }

    /// Retry commands the receiver is holding back.
    pub fn flush_commands(&self) {
        self.inner.flush_commands();
    }

    /// Queue for handlers that must run on the command task.
    pub fn command_queue(&self) -> Arc<CommandQueue> {
        self.inner.command_queue()
    }

    /// Register an application node command.
    ///
    /// Commands below [`NodeCommand::CUSTOM`] are reserved. With a queue,
    /// the handler runs when the command is popped from it.
    pub fn register_command_handler(
        &self,
        command: u32,
        handler: Handler,
        queue: Option<Arc<CommandQueue>>,
    ) -> Result<(), DispatchError> {
        if command < NodeCommand::CUSTOM {
            return Err(DispatchError::Reserved(command));
        }
        self.inner.dispatcher.register_command(command, handler, queue)
    }

    /// Ask `node` for its send token. Blocks until the token is granted or
    /// the default timeout expires.
    pub async fn acquire_send_token(&self, node: &Arc<Node>) -> Option<SendToken> {
        self.inner.acquire_send_token(node).await
    }

    pub fn release_send_token(&self, token: SendToken) {
        self.inner.release_send_token(token);
    }

    // ========================================================================
    // Objects
    // ========================================================================

    /// Register `object` as the master of a new identifier.
    pub fn register_object<T: Distributed>(&self, object: &Object<T>) -> bool {
        self.inner.store.register_object(&self.inner, &object.api())
    }

    pub fn deregister_object<T: Distributed>(&self, object: &Object<T>) {
        self.inner.store.deregister_object(&object.api());
    }

    /// Map `object` as a slave of the master `id` and wait for the
    /// instance data of `version`.
    pub async fn map_object<T: Distributed>(&self, object: &Object<T>, id: ObjectId, version: Version) -> bool {
        match self.map_object_nb(object, id, version).await {
            Some(request_id) => self.map_object_sync(request_id).await,
            None => false,
        }
    }

    /// Start mapping `object`; finish with [`map_object_sync`](Self::map_object_sync).
    pub async fn map_object_nb<T: Distributed>(
        &self,
        object: &Object<T>,
        id: ObjectId,
        version: Version,
    ) -> Option<u32> {
        self.inner
            .store
            .map_object_nb(&self.inner, &object.api(), id, version)
            .await
    }

    pub async fn map_object_sync(&self, request_id: u32) -> bool {
        self.inner.store.map_object_sync(&self.inner, request_id).await
    }

    pub async fn unmap_object<T: Distributed>(&self, object: &Object<T>) {
        self.inner.store.unmap_object(&self.inner, &object.api()).await;
    }

    /// Put `new` in place of the attached `old`, which ends up detached.
    pub fn swap_object<T: Distributed>(&self, old: &Object<T>, new: &Object<T>) {
        let (old, new): (Arc<dyn ObjectApi>, Arc<dyn ObjectApi>) = (old.api(), new.api());
        self.inner.store.swap_object(&self.inner, &old, &new);
    }

    /// The node holding the master of `id`, or [`NodeId::ZERO`].
    pub async fn find_master_node_id(&self, id: ObjectId) -> NodeId {
        self.inner.store.find_master_node_id(&self.inner, id).await
    }

    /// Receive objects pushed with `group_id`.
    pub fn register_push_handler(&self, group_id: u128, handler: PushHandler) {
        self.inner.store.register_push_handler(group_id, handler);
    }

    /// Drop cached instance data older than `age`.
    pub fn expire_instance_data(&self, age: Duration) {
        self.inner.store.expire_instance_data(age);
    }

    pub fn disable_instance_cache(&self) {
        self.inner.store.disable_instance_cache();
    }

    /// The instance data cache, unless disabled.
    pub fn instance_cache(&self) -> Option<Arc<InstanceCache>> {
        self.inner.store.instance_cache()
    }

    /// Broadcast the instance data of newly registered masters to the
    /// connected peers.
    pub fn enable_send_on_register(&self) {
        self.inner.store.enable_send_on_register();
    }

    /// Undo one [`enable_send_on_register`](Self::enable_send_on_register);
    /// the last call waits until the send queue is dropped.
    pub async fn disable_send_on_register(&self) {
        self.inner.store.disable_send_on_register(&self.inner).await;
    }

    /// Number of attached object instances.
    pub fn object_count(&self) -> usize {
        self.inner.store.len()
    }
}

impl std::fmt::Debug for LocalNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalNode")
            .field("id", &self.inner.id)
            .field("state", &self.inner.state())
            .field("peers", &self.inner.connected_nodes().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use weft_proto::packet::node::AckRequestPacket;

    fn config() -> Arc<Config> {
        let mut config = Config::default();
        config.listen = vec![ConnectionDescription::tcp("127.0.0.1", 0)];
        Arc::new(config)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    #[tokio::test]
    async fn test_listen_then_close() {
        let node = LocalNode::new(config());
        assert_eq!(node.state(), NodeState::Closed);
        node.listen().unwrap();
        assert!(node.is_listening());
        assert_ne!(node.descriptions()[0].port, 0);
        assert!(node.get_node(node.id()).is_some());
        assert!(node.get_nodes().is_empty());

        node.close().await.unwrap();
        assert_eq!(node.state(), NodeState::Closed);
        assert!(node.get_node(node.id()).is_none());
    }

    #[tokio::test]
    async fn test_double_listen_fails() {
        let node = LocalNode::new(config());
        node.listen().unwrap();
        assert!(node.listen().is_err());
        node.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_without_listen_fails() {
        let node = LocalNode::new(config());
        assert!(matches!(node.close().await, Err(NodeError::NotListening)));
    }

    // ========================================================================
    // Commands
    // ========================================================================

    #[test]
    fn test_reserved_commands_are_rejected() {
        let node = LocalNode::new(config());
        let handler: Handler = Arc::new(|_| true);
        assert!(matches!(
            node.register_command_handler(NodeCommand::Ping as u32, handler.clone(), None),
            Err(DispatchError::Reserved(_))
        ));
        assert!(node.register_command_handler(NodeCommand::CUSTOM, handler, None).is_ok());
    }

    #[tokio::test]
    async fn test_local_commands_loop_back() {
        let node = LocalNode::new(config());
        node.listen().unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let handler: Handler = Arc::new(move |cmd| {
            assert_eq!(cmd.command(), NodeCommand::AckRequest as u32);
            counter.fetch_add(1, Ordering::SeqCst);
            true
        });
        // Replace the store's handler to observe the loopback.
        node.inner().dispatcher().unregister_command(NodeCommand::AckRequest as u32);
        node.inner()
            .dispatcher()
            .register_command(NodeCommand::AckRequest as u32, handler, None)
            .unwrap();

        let self_node = node.get_node(node.id()).unwrap();
        assert!(self_node.send_packet(&AckRequestPacket { request_id: 7 }));
        for _ in 0..100 {
            if seen.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        node.close().await.unwrap();
    }

    // ========================================================================
    // Instance data feed
    // ========================================================================

    #[tokio::test]
    async fn test_unaddressed_instance_data_is_cached_not_applied() {
        use crate::object::tests::Counter;
        use crate::object::ChangeType;
        use weft_proto::InstanceId;

        let a = LocalNode::new(config());
        let b = LocalNode::new(config());
        a.listen().unwrap();
        b.listen().unwrap();
        let peer = a.connect_to(&b.descriptions()[0]).await.unwrap();

        let master = Object::new(Counter::new(ChangeType::Instance, 1));
        assert!(a.register_object(&master));
        let slave = Object::new(Counter::new(ChangeType::Instance, 0));
        assert!(b.map_object(&slave, master.id(), Version::OLDEST).await);
        assert_eq!(slave.read().value, 1);

        // Uncommitted data for v2, sent to nobody in particular.
        let v2 = Version::from_low(2);
        master.write().value = 7;
        let api = master.api();
        let mut os = api.core().ostream(&*api, ObjectCommand::Instance, InstanceId::NONE);
        os.set_version(v2);
        os.enable(vec![peer.connection().unwrap()]);
        api.get_instance_data(&mut os);
        os.disable();

        let cache = b.instance_cache().unwrap();
        for _ in 0..200 {
            if cache.versions(master.id()).contains(&v2) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let cached = cache.versions(master.id());
        assert!(cached.contains(&v2), "cached {cached:?}");
        assert_eq!(slave.head_version(), Version::FIRST);
        assert_eq!(slave.version(), Version::FIRST);
        assert_eq!(slave.read().value, 1);

        a.close().await.unwrap();
        b.close().await.unwrap();
    }

    #[test]
    fn test_time_is_monotonic() {
        let node = LocalNode::new(config());
        let a = node.get_time();
        let b = node.get_time();
        assert!(b >= a);
    }
}
