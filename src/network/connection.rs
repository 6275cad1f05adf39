//! Byte-stream connections between nodes.
//!
//! A [`Connection`] owns two tasks: a reader that splits the stream into
//! frames and reports them as [`ConnectionEvent`]s, and a writer that drains
//! an unbounded queue of outgoing frames. Every connection of a local node
//! reports into the same event channel, which the receiver task selects on.

use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use weft_proto::{ConnectionDescription, ConnectionType, FrameCodec, ProtocolError};

use crate::error::{NodeError, NodeResult, TimeoutKind};

/// Capacity of each direction of an in-process pipe.
const PIPE_CAPACITY: usize = 256 * 1024;
/// Pending connections kept by the kernel per listener.
const LISTEN_BACKLOG: i32 = 1024;
const TCP_KEEPALIVE: Duration = Duration::from_secs(60);

// ============================================================================
// Stream
// ============================================================================

/// The transports a connection can run over.
pub enum ConnectionStream {
    /// TCP socket.
    Tcp(TcpStream),
    /// One end of an in-process pipe.
    Pipe(DuplexStream),
}

impl AsyncRead for ConnectionStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ConnectionStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            ConnectionStream::Pipe(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ConnectionStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ConnectionStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            ConnectionStream::Pipe(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ConnectionStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            ConnectionStream::Pipe(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ConnectionStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            ConnectionStream::Pipe(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

// ============================================================================
// Events
// ============================================================================

/// What a connection reports to the receiver task.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A listener accepted a new connection.
    Connect(Connection),
    /// One complete frame arrived.
    Data(Connection, BytesMut),
    /// The connection is gone.
    Disconnect(Connection),
    /// The stream produced an undecodable frame.
    Error(Connection, ProtocolError),
    /// Wake the receiver without data, e.g. to redispatch pending commands.
    Interrupt,
}

/// Sending side of a local node's event channel.
pub type EventSender = mpsc::UnboundedSender<ConnectionEvent>;

// ============================================================================
// Connection
// ============================================================================

/// Lifecycle of a connection or node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Connected,
    Listening,
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Listening => "listening",
            Self::Closing => "closing",
        })
    }
}

struct ConnectionInner {
    description: ConnectionDescription,
    outgoing: mpsc::UnboundedSender<Bytes>,
    cancel: CancellationToken,
    state: Mutex<ConnectionState>,
    bytes_sent: AtomicU64,
}

/// A handle to one open connection. Clones share the connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Start the reader and writer tasks for `stream`.
    ///
    /// With `announce`, a [`ConnectionEvent::Connect`] is queued before the
    /// first frame can arrive.
    pub(crate) fn spawn(
        stream: ConnectionStream,
        description: ConnectionDescription,
        events: EventSender,
        write_timeout: Duration,
        announce: bool,
    ) -> Self {
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let connection = Self {
            inner: Arc::new(ConnectionInner {
                description,
                outgoing,
                cancel: CancellationToken::new(),
                state: Mutex::new(ConnectionState::Connected),
                bytes_sent: AtomicU64::new(0),
            }),
        };
        if announce {
            let _ = events.send(ConnectionEvent::Connect(connection.clone()));
        }

        let (read_half, write_half) = tokio::io::split(stream);
        tokio::spawn(read_loop(
            connection.clone(),
            FramedRead::new(read_half, FrameCodec::new()),
            events,
        ));
        tokio::spawn(write_loop(
            connection.clone(),
            FramedWrite::new(write_half, FrameCodec::new()),
            outgoing_rx,
            write_timeout,
        ));
        connection
    }

    /// Open an outgoing connection.
    pub async fn connect(
        description: &ConnectionDescription,
        events: EventSender,
        write_timeout: Duration,
    ) -> NodeResult<Self> {
        match description.connection_type {
            ConnectionType::Tcp => {
                let stream = TcpStream::connect(description.socket_address()).await?;
                configure_stream(&stream);
                debug!(remote = %description, "Connected");
                Ok(Self::spawn(
                    ConnectionStream::Tcp(stream),
                    description.clone(),
                    events,
                    write_timeout,
                    false,
                ))
            }
            other => Err(NodeError::Unsupported(other.to_string())),
        }
    }

    /// Identity of this connection while it is alive.
    pub fn id(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    pub fn description(&self) -> &ConnectionDescription {
        &self.inner.description
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Queue a frame for writing. Returns false once the connection closed.
    pub fn send(&self, frame: Bytes) -> bool {
        if self.is_closed() {
            return false;
        }
        let len = frame.len() as u64;
        if self.inner.outgoing.send(frame).is_err() {
            return false;
        }
        self.inner.bytes_sent.fetch_add(len, Ordering::Relaxed);
        true
    }

    /// Bytes queued for writing so far.
    pub fn bytes_sent(&self) -> u64 {
        self.inner.bytes_sent.load(Ordering::Relaxed)
    }

    /// Close the connection. Frames already queued are still written.
    pub fn close(&self) {
        {
            let mut state = self.inner.state.lock();
            if *state == ConnectionState::Closed {
                return;
            }
            *state = ConnectionState::Closing;
        }
        self.inner.cancel.cancel();
    }

    fn set_state(&self, state: ConnectionState) {
        *self.inner.state.lock() = state;
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Connection {}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &format_args!("{:#x}", self.id()))
            .field("description", &self.inner.description.to_string())
            .field("state", &self.state())
            .finish()
    }
}

async fn read_loop(
    connection: Connection,
    mut reader: FramedRead<ReadHalf<ConnectionStream>, FrameCodec>,
    events: EventSender,
) {
    loop {
        tokio::select! {
            _ = connection.inner.cancel.cancelled() => break,
            frame = reader.next() => match frame {
                Some(Ok(frame)) => {
                    if events.send(ConnectionEvent::Data(connection.clone(), frame)).is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    debug!(error = %e, "Read error");
                    let fatal = e.is_fatal();
                    let _ = events.send(ConnectionEvent::Error(connection.clone(), e));
                    if fatal {
                        break;
                    }
                }
                None => break,
            },
        }
    }
    connection.inner.cancel.cancel();
    connection.set_state(ConnectionState::Closed);
    let _ = events.send(ConnectionEvent::Disconnect(connection));
}

async fn write_loop(
    connection: Connection,
    mut writer: FramedWrite<WriteHalf<ConnectionStream>, FrameCodec>,
    mut outgoing: mpsc::UnboundedReceiver<Bytes>,
    write_timeout: Duration,
) {
    loop {
        tokio::select! {
            biased;
            frame = outgoing.recv() => {
                let Some(frame) = frame else { break };
                if !write_frame(&mut writer, frame, write_timeout).await {
                    break;
                }
            }
            _ = connection.inner.cancel.cancelled() => {
                // Flush what was queued before the close.
                while let Ok(frame) = outgoing.try_recv() {
                    if !write_frame(&mut writer, frame, write_timeout).await {
                        break;
                    }
                }
                break;
            }
        }
    }
    let _ = writer.close().await;
    connection.inner.cancel.cancel();
}

async fn write_frame(
    writer: &mut FramedWrite<WriteHalf<ConnectionStream>, FrameCodec>,
    frame: Bytes,
    write_timeout: Duration,
) -> bool {
    match tokio::time::timeout(write_timeout, writer.send(frame)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!(error = %e, "Write error");
            crate::metrics::record_error(e.error_code());
            false
        }
        Err(_) => {
            let err = NodeError::Timeout(TimeoutKind::Write);
            warn!(error = %err, "Write stalled");
            crate::metrics::record_error(err.error_code());
            false
        }
    }
}

fn configure_stream(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "Failed to set TCP_NODELAY");
    }
    let keepalive = TcpKeepalive::new().with_time(TCP_KEEPALIVE);
    if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        debug!(error = %e, "Failed to set TCP keepalive");
    }
}

/// Two connected in-process connections.
///
/// Frames sent on one end arrive as [`ConnectionEvent::Data`] for the
/// other end.
pub fn pipe_pair(events: EventSender, write_timeout: Duration) -> (Connection, Connection) {
    let (a, b) = tokio::io::duplex(PIPE_CAPACITY);
    let a = Connection::spawn(
        ConnectionStream::Pipe(a),
        ConnectionDescription::pipe(),
        events.clone(),
        write_timeout,
        false,
    );
    let b = Connection::spawn(
        ConnectionStream::Pipe(b),
        ConnectionDescription::pipe(),
        events,
        write_timeout,
        false,
    );
    (a, b)
}

// ============================================================================
// Listener
// ============================================================================

/// A bound TCP endpoint.
pub struct Listener {
    listener: TcpListener,
    description: ConnectionDescription,
}

impl Listener {
    /// Bind the endpoint named by `description`.
    ///
    /// Port zero binds an ephemeral port; [`description`](Self::description)
    /// reports the port actually bound.
    pub fn bind(description: &ConnectionDescription) -> NodeResult<Self> {
        if description.connection_type != ConnectionType::Tcp {
            return Err(NodeError::Unsupported(description.connection_type.to_string()));
        }
        let addr = resolve(description)?;
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(LISTEN_BACKLOG)?;
        let listener = TcpListener::from_std(std::net::TcpListener::from(socket))?;

        let local = listener.local_addr()?;
        let mut description = description.clone();
        description.port = local.port();
        info!(address = %local, "Listener bound");
        Ok(Self {
            listener,
            description,
        })
    }

    /// The bound endpoint, with the actual port.
    pub fn description(&self) -> &ConnectionDescription {
        &self.description
    }

    pub fn local_addr(&self) -> NodeResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `cancel` fires.
    pub fn spawn(
        self,
        events: EventSender,
        write_timeout: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = self.listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            configure_stream(&stream);
                            debug!(%peer, "Accepted connection");
                            let description = ConnectionDescription::tcp(peer.ip().to_string(), peer.port());
                            Connection::spawn(
                                ConnectionStream::Tcp(stream),
                                description,
                                events.clone(),
                                write_timeout,
                                true,
                            );
                        }
                        Err(e) => {
                            warn!(error = %e, "Accept failed");
                            crate::metrics::record_error("io");
                        }
                    },
                }
            }
            debug!(endpoint = %self.description, "Listener stopped");
        })
    }
}

fn resolve(description: &ConnectionDescription) -> NodeResult<SocketAddr> {
    description
        .socket_address()
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| {
            NodeError::Io(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("cannot resolve {}", description.socket_address()),
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_proto::packet::Packet;
    use weft_proto::packet::node::PingPacket;

    async fn next_data(rx: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> (Connection, BytesMut) {
        loop {
            match rx.recv().await {
                Some(ConnectionEvent::Data(conn, frame)) => return (conn, frame),
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    }

    #[tokio::test]
    async fn test_pipe_pair_delivers_frames() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (a, b) = pipe_pair(tx, Duration::from_secs(1));
        assert!(a.send(PingPacket { time: 5 }.to_frame()));
        let (conn, frame) = next_data(&mut rx).await;
        assert_eq!(conn, b);
        assert_eq!(PingPacket::from_frame(&frame).unwrap().time, 5);
        assert!(a.bytes_sent() > 0);
    }

    #[tokio::test]
    async fn test_close_reports_disconnect() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (a, _b) = pipe_pair(tx, Duration::from_secs(1));
        a.close();
        assert!(!a.send(PingPacket { time: 1 }.to_frame()));
        loop {
            match rx.recv().await {
                Some(ConnectionEvent::Disconnect(conn)) if conn == a => break,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
        assert_eq!(a.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_tcp_listener_accepts() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let listener = Listener::bind(&ConnectionDescription::tcp("127.0.0.1", 0)).unwrap();
        let description = listener.description().clone();
        assert_ne!(description.port, 0);
        let cancel = CancellationToken::new();
        let handle = listener.spawn(tx.clone(), Duration::from_secs(1), cancel.clone());

        let client = Connection::connect(&description, tx, Duration::from_secs(1))
            .await
            .unwrap();
        let accepted = loop {
            match rx.recv().await {
                Some(ConnectionEvent::Connect(conn)) => break conn,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        };
        client.send(PingPacket { time: 77 }.to_frame());
        let (conn, frame) = next_data(&mut rx).await;
        assert_eq!(conn, accepted);
        assert_eq!(PingPacket::from_frame(&frame).unwrap().time, 77);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_multicast_is_unsupported() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut description = ConnectionDescription::tcp("239.0.0.1", 1);
        description.connection_type = ConnectionType::Multicast;
        let err = Connection::connect(&description, tx, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "unsupported");
        assert!(Listener::bind(&description).is_err());
    }
}
