//! Connection handling for meshbus
//!
//! Manages one framed TCP stream to exactly one remote peer, including:
//! - The one-time handshake header exchange
//! - Length-prefixed framing of sends and receives
//! - Automatic reconnection with backoff when configured
//! - Thread-safe inbound/outbound queues and state-change notification

use bytes::BytesMut;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::protocol::{
    decode_frame, encode_frame, DeserializedMessage, NodeId, SerializedMessage, WireHeader,
    WIRE_HEADER_SIZE,
};

/// Outbound queue depth per connection
const OUTBOUND_QUEUE_SIZE: usize = 256;

/// State of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Socket is up but the handshake has not completed yet
    Connecting = 0,
    /// Handshake complete, ready for message traffic
    Connected = 1,
    /// A failure occurred and a reconnect attempt is pending
    DisconnectReconnectPending = 2,
    /// Terminal state; the connection will never carry traffic again
    Disconnected = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Connected,
            2 => ConnectionState::DisconnectReconnectPending,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// Process-unique identifier for one Connection object, used to correlate
/// state events in transport bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A state-change notification, emitted exactly once per transition
#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    pub id: ConnectionId,
    pub endpoint: SocketAddr,
    /// Remote node id at the time of the transition (None until handshake)
    pub node_id: Option<NodeId>,
    pub state: ConnectionState,
}

/// State shared between a Connection, its handles, and its I/O task
#[derive(Debug)]
struct Shared {
    state: AtomicU8,
    remote_node_id: StdMutex<Option<NodeId>>,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    closed_at: StdMutex<Option<Instant>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            remote_node_id: StdMutex::new(None),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            closed_at: StdMutex::new(None),
        }
    }

    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn swap_state(&self, state: ConnectionState) -> ConnectionState {
        ConnectionState::from_u8(self.state.swap(state as u8, Ordering::SeqCst))
    }

    fn remote_node_id(&self) -> Option<NodeId> {
        *self
            .remote_node_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn set_remote_node_id(&self, node_id: Option<NodeId>) {
        *self
            .remote_node_id
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = node_id;
    }

    fn mark_closed(&self) {
        *self.closed_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
    }
}

/// A cloneable, non-owning handle for sending messages to a connection.
///
/// This is what the transport's node map and broadcast list store; the
/// Connection object itself stays exclusively owned by the transport's
/// run loop.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    endpoint: SocketAddr,
    outbound_tx: mpsc::Sender<Arc<SerializedMessage>>,
    shared: Arc<Shared>,
}

impl ConnectionHandle {
    /// Enqueue a message for transmission.
    ///
    /// Returns false with no side effect unless the connection is in the
    /// `Connected` state. Never blocks on network I/O.
    pub fn send(&self, message: Arc<SerializedMessage>) -> bool {
        if self.shared.state() != ConnectionState::Connected {
            return false;
        }
        self.outbound_tx.try_send(message).is_ok()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.state() == ConnectionState::Connected
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn remote_node_id(&self) -> Option<NodeId> {
        self.shared.remote_node_id()
    }
}

/// A connection to one remote meshbus peer
pub struct Connection {
    id: ConnectionId,
    remote_endpoint: SocketAddr,
    local_node_id: NodeId,
    retry_delay: Duration,
    shared: Arc<Shared>,
    outbound_tx: mpsc::Sender<Arc<SerializedMessage>>,
    outbound_rx: Option<mpsc::Receiver<Arc<SerializedMessage>>>,
    inbound_tx: mpsc::UnboundedSender<(DeserializedMessage, NodeId)>,
    inbound_rx: mpsc::UnboundedReceiver<(DeserializedMessage, NodeId)>,
    event_tx: Option<mpsc::UnboundedSender<ConnectionEvent>>,
    stream: Option<TcpStream>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    shutdown_rx: Option<mpsc::Receiver<()>>,
    task: Option<JoinHandle<()>>,
    opened_at: Instant,
}

impl Connection {
    /// Wrap an established TCP stream.
    ///
    /// Used both for proactively-dialed outbound sockets and for
    /// listener-accepted inbound sockets; the latter are created with a
    /// zero retry delay since the dialing side owns reconnection.
    pub fn new(
        stream: TcpStream,
        remote_endpoint: SocketAddr,
        local_node_id: NodeId,
        retry_delay: Duration,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_SIZE);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        Self {
            id: ConnectionId::next(),
            remote_endpoint,
            local_node_id,
            retry_delay,
            shared: Arc::new(Shared::new()),
            outbound_tx,
            outbound_rx: Some(outbound_rx),
            inbound_tx,
            inbound_rx,
            event_tx: None,
            stream: Some(stream),
            shutdown_tx: Some(shutdown_tx),
            shutdown_rx: Some(shutdown_rx),
            task: None,
            opened_at: Instant::now(),
        }
    }

    /// Register the state-change notification channel.
    ///
    /// Must be called before `start` for transitions to be observable.
    pub fn set_event_sender(&mut self, event_tx: mpsc::UnboundedSender<ConnectionEvent>) {
        self.event_tx = Some(event_tx);
    }

    /// Spawn the dedicated send/receive task.
    ///
    /// Errors surface only through state transitions, never as return
    /// values. Calling start twice is a no-op.
    pub fn start(&mut self) {
        if self.task.is_some() {
            tracing::warn!("{} already started", self.id);
            return;
        }
        let (Some(stream), Some(outbound_rx), Some(shutdown_rx)) = (
            self.stream.take(),
            self.outbound_rx.take(),
            self.shutdown_rx.take(),
        ) else {
            tracing::warn!("{} cannot start after close", self.id);
            return;
        };

        let actor = ConnectionActor {
            id: self.id,
            endpoint: self.remote_endpoint,
            local_node_id: self.local_node_id,
            retry_delay: self.retry_delay,
            shared: Arc::clone(&self.shared),
            outbound_rx,
            inbound_tx: self.inbound_tx.clone(),
            event_tx: self.event_tx.clone(),
            shutdown_rx,
            handshake_received: false,
            read_buf: BytesMut::with_capacity(4096),
        };

        self.task = Some(tokio::spawn(actor.run(stream)));
    }

    /// Enqueue a message for transmission; false unless `Connected`
    pub fn send(&self, message: Arc<SerializedMessage>) -> bool {
        if self.shared.state() != ConnectionState::Connected {
            return false;
        }
        self.outbound_tx.try_send(message).is_ok()
    }

    /// Non-blocking dequeue of the next inbound message and its sender
    pub fn receive(&mut self) -> Option<(DeserializedMessage, NodeId)> {
        self.inbound_rx.try_recv().ok()
    }

    /// Orderly shutdown: signal the task, drop the socket, join. Idempotent.
    pub async fn close(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        if self.stream.take().is_some() {
            // Never started; settle the state machine directly
            self.shared.set_remote_node_id(None);
            self.shared.swap_state(ConnectionState::Disconnected);
            self.shared.mark_closed();
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Unknown until the handshake completes
    pub fn remote_node_id(&self) -> Option<NodeId> {
        self.shared.remote_node_id()
    }

    pub fn remote_endpoint(&self) -> SocketAddr {
        self.remote_endpoint
    }

    /// A cloneable send handle for the transport's node map
    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            id: self.id,
            endpoint: self.remote_endpoint,
            outbound_tx: self.outbound_tx.clone(),
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn bytes_sent(&self) -> u64 {
        self.shared.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.shared.bytes_received.load(Ordering::Relaxed)
    }

    pub fn uptime(&self) -> Duration {
        self.opened_at.elapsed()
    }

    /// When the connection reached `Disconnected`, if it has
    pub fn closed_at(&self) -> Option<Instant> {
        *self.shared.closed_at.lock().unwrap_or_else(|e| e.into_inner())
    }
}

enum LoopExit {
    /// Orderly stop was requested
    Shutdown,
    /// The socket failed; retry-or-terminate applies
    Failed,
}

/// The send/receive loop state, moved onto the connection's own task
struct ConnectionActor {
    id: ConnectionId,
    endpoint: SocketAddr,
    local_node_id: NodeId,
    retry_delay: Duration,
    shared: Arc<Shared>,
    outbound_rx: mpsc::Receiver<Arc<SerializedMessage>>,
    inbound_tx: mpsc::UnboundedSender<(DeserializedMessage, NodeId)>,
    event_tx: Option<mpsc::UnboundedSender<ConnectionEvent>>,
    shutdown_rx: mpsc::Receiver<()>,
    handshake_received: bool,
    read_buf: BytesMut,
}

impl ConnectionActor {
    async fn run(mut self, stream: TcpStream) {
        let mut stream = stream;
        loop {
            match self.drive(&mut stream).await {
                LoopExit::Shutdown => break,
                LoopExit::Failed => {
                    if self.retry_delay.is_zero() {
                        break;
                    }
                    self.shared.set_remote_node_id(None);
                    self.transition(ConnectionState::DisconnectReconnectPending);

                    // Intentional backoff; interruptible by close()
                    tokio::select! {
                        _ = tokio::time::sleep(self.retry_delay) => {}
                        _ = self.shutdown_rx.recv() => break,
                    }

                    match TcpStream::connect(self.endpoint).await {
                        Ok(fresh) => {
                            tracing::info!("{} reconnected to {}", self.id, self.endpoint);
                            stream = fresh;
                            self.handshake_received = false;
                            self.read_buf.clear();
                            self.transition(ConnectionState::Connecting);
                        }
                        Err(e) => {
                            tracing::warn!(
                                "{} reconnect to {} failed: {}",
                                self.id,
                                self.endpoint,
                                e
                            );
                            break;
                        }
                    }
                }
            }
        }

        self.shared.set_remote_node_id(None);
        self.transition(ConnectionState::Disconnected);
        self.shared.mark_closed();
        // Dropping the event sender breaks the reference back to the owner
        self.event_tx = None;
    }

    /// One connected-socket session: handshake first, then framed traffic
    /// until a failure or a shutdown request
    async fn drive(&mut self, stream: &mut TcpStream) -> LoopExit {
        // Our header goes out before any payload frame
        let mut header_buf = BytesMut::with_capacity(WIRE_HEADER_SIZE);
        WireHeader::new(self.local_node_id).encode(&mut header_buf);
        if let Err(e) = stream.write_all(&header_buf).await {
            tracing::debug!("{} handshake send failed: {}", self.id, e);
            return LoopExit::Failed;
        }
        self.shared
            .bytes_sent
            .fetch_add(WIRE_HEADER_SIZE as u64, Ordering::Relaxed);

        let mut write_buf = BytesMut::with_capacity(4096);
        loop {
            tokio::select! {
                result = stream.read_buf(&mut self.read_buf) => {
                    match result {
                        Ok(0) => {
                            tracing::debug!("{} peer {} closed the stream", self.id, self.endpoint);
                            return LoopExit::Failed;
                        }
                        Ok(n) => {
                            self.shared.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                            if !self.process_inbound() {
                                return LoopExit::Failed;
                            }
                        }
                        Err(e) => {
                            tracing::debug!("{} read error: {}", self.id, e);
                            return LoopExit::Failed;
                        }
                    }
                }
                maybe = self.outbound_rx.recv() => {
                    let Some(message) = maybe else {
                        // Owner dropped without close(); stop quietly
                        return LoopExit::Shutdown;
                    };
                    write_buf.clear();
                    match encode_frame(message.payload(), &mut write_buf) {
                        Ok(()) => {
                            if let Err(e) = stream.write_all(&write_buf).await {
                                tracing::debug!("{} write error: {}", self.id, e);
                                return LoopExit::Failed;
                            }
                            self.shared.bytes_sent.fetch_add(write_buf.len() as u64, Ordering::Relaxed);
                        }
                        Err(e) => {
                            // Scoped to this one message, not the connection
                            tracing::warn!("{} dropping outbound message: {}", self.id, e);
                        }
                    }
                }
                _ = self.shutdown_rx.recv() => {
                    return LoopExit::Shutdown;
                }
            }
        }
    }

    /// Consume buffered bytes: handshake header first, then complete frames.
    ///
    /// Returns false on a fatal protocol error (invalid handshake); a frame
    /// whose envelope fails to decode is dropped alone and the stream
    /// continues.
    fn process_inbound(&mut self) -> bool {
        if !self.handshake_received {
            match WireHeader::decode(&mut self.read_buf) {
                None => return true, // wait for more data
                Some(header) => {
                    if !header.is_valid() {
                        tracing::warn!(
                            "{} invalid handshake from {} (magic {:#x}, version {})",
                            self.id,
                            self.endpoint,
                            header.magic,
                            header.version
                        );
                        return false;
                    }
                    self.handshake_received = true;
                    self.shared.set_remote_node_id(Some(header.node_id));
                    self.transition(ConnectionState::Connected);
                    tracing::info!(
                        "{} handshake complete with {} ({})",
                        self.id,
                        header.node_id,
                        self.endpoint
                    );
                }
            }
        }

        let Some(sender) = self.shared.remote_node_id() else {
            return true;
        };
        while let Some(frame) = decode_frame(&mut self.read_buf) {
            match DeserializedMessage::decode(frame) {
                Ok(message) => {
                    let _ = self.inbound_tx.send((message, sender));
                }
                Err(e) => {
                    tracing::warn!("{} dropping undecodable frame from {}: {}", self.id, sender, e);
                }
            }
        }
        true
    }

    /// Store the new state and notify, exactly once per transition
    fn transition(&self, state: ConnectionState) {
        let previous = self.shared.swap_state(state);
        if previous == state {
            return;
        }
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(ConnectionEvent {
                id: self.id,
                endpoint: self.endpoint,
                node_id: self.shared.remote_node_id(),
                state,
            });
        }
    }
}
