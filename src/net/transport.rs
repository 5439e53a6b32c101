//! The TCP message transport
//!
//! Owns the listening socket (if any) and the set of peer connections,
//! routes outbound messages to the right subset of connections, drains
//! every connection's inbound queue once per tick, and surfaces node
//! discovery/loss events to the bus bridge.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;

use super::connection::{Connection, ConnectionEvent, ConnectionHandle, ConnectionId, ConnectionState};
use crate::config::TransportConfig;
use crate::protocol::{DeserializedMessage, NodeId, SerializedMessage, MAX_FRAME_PAYLOAD, MAX_RECIPIENTS};

/// Run loop tick while any connection is active
const ACTIVE_TICK: Duration = Duration::from_millis(5);

/// Run loop tick while the transport is idle, to avoid busy-spinning
const IDLE_TICK: Duration = Duration::from_millis(100);

/// Bridge-facing event queue depth
const EVENT_QUEUE_SIZE: usize = 256;

/// Events surfaced to the bus bridge
#[derive(Debug)]
pub enum TransportEvent {
    /// A message arrived from a remote node
    MessageReceived {
        message: DeserializedMessage,
        sender: NodeId,
    },
    /// A handshake completed with a node never seen before
    NodeDiscovered { node_id: NodeId },
    /// A previously-discovered node's connection went away
    NodeLost { node_id: NodeId },
}

/// Node map maintenance, produced by the run loop and applied lazily on the
/// send path
enum NodeMapUpdate {
    Add(NodeId, ConnectionHandle),
    Remove(NodeId),
}

/// Peer-to-peer TCP transport for addressed, serialized messages.
///
/// One instance per process per transport technology; created at module
/// startup and destroyed at module shutdown.
pub struct TcpTransport {
    config: TransportConfig,
    node_id: NodeId,
    event_tx: mpsc::Sender<TransportEvent>,
    event_rx: Option<mpsc::Receiver<TransportEvent>>,
    pending_tx: mpsc::UnboundedSender<Connection>,
    pending_rx: Option<mpsc::UnboundedReceiver<Connection>>,
    removal_tx: mpsc::UnboundedSender<SocketAddr>,
    removal_rx: Option<mpsc::UnboundedReceiver<SocketAddr>>,
    conn_event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    conn_event_rx: Option<mpsc::UnboundedReceiver<ConnectionEvent>>,
    map_update_tx: mpsc::UnboundedSender<NodeMapUpdate>,
    map_update_rx: Mutex<mpsc::UnboundedReceiver<NodeMapUpdate>>,
    node_map: Mutex<HashMap<NodeId, ConnectionHandle>>,
    handles: Arc<RwLock<Vec<ConnectionHandle>>>,
    stopping: Arc<AtomicBool>,
    listen_addr: Option<SocketAddr>,
    listener_shutdown_tx: Option<mpsc::Sender<()>>,
    listener_task: Option<JoinHandle<()>>,
    run_task: Option<JoinHandle<()>>,
}

impl TcpTransport {
    pub fn new(config: TransportConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_SIZE);
        let (pending_tx, pending_rx) = mpsc::unbounded_channel();
        let (removal_tx, removal_rx) = mpsc::unbounded_channel();
        let (conn_event_tx, conn_event_rx) = mpsc::unbounded_channel();
        let (map_update_tx, map_update_rx) = mpsc::unbounded_channel();

        Self {
            config,
            node_id: NodeId::generate(),
            event_tx,
            event_rx: Some(event_rx),
            pending_tx,
            pending_rx: Some(pending_rx),
            removal_tx,
            removal_rx: Some(removal_rx),
            conn_event_tx,
            conn_event_rx: Some(conn_event_rx),
            map_update_tx,
            map_update_rx: Mutex::new(map_update_rx),
            node_map: Mutex::new(HashMap::new()),
            handles: Arc::new(RwLock::new(Vec::new())),
            stopping: Arc::new(AtomicBool::new(false)),
            listen_addr: None,
            listener_shutdown_tx: None,
            listener_task: None,
            run_task: None,
        }
    }

    /// This endpoint's identity, exchanged with every peer at handshake
    pub fn local_node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn is_running(&self) -> bool {
        self.run_task.is_some()
    }

    /// The actual bound listen address, if listening (useful when the
    /// configured port is 0)
    pub fn local_listen_addr(&self) -> Option<SocketAddr> {
        self.listen_addr
    }

    /// Take the bridge-facing event receiver (can only be called once per
    /// start/stop cycle)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.event_rx.take()
    }

    /// Start the listener (if configured), the run loop, and the configured
    /// outgoing connections.
    ///
    /// A listener bind failure is tolerated: the transport keeps running
    /// without accepting inbound connections. Returns false only when
    /// already running.
    pub async fn start_transport(&mut self) -> bool {
        if self.run_task.is_some() {
            tracing::warn!("Transport already running");
            return false;
        }
        let (Some(pending_rx), Some(removal_rx), Some(conn_event_rx)) = (
            self.pending_rx.take(),
            self.removal_rx.take(),
            self.conn_event_rx.take(),
        ) else {
            tracing::warn!("Transport already running");
            return false;
        };
        self.stopping.store(false, Ordering::SeqCst);

        match self.config.listen_addr() {
            Ok(Some(addr)) => self.start_listener(addr).await,
            Ok(None) => tracing::info!("No listen endpoint configured; not accepting inbound"),
            Err(e) => tracing::error!("Bad listen endpoint, not accepting inbound: {}", e),
        }

        let run_loop = RunLoop {
            pending_rx,
            removal_rx,
            conn_event_rx,
            conn_event_tx: self.conn_event_tx.clone(),
            map_update_tx: self.map_update_tx.clone(),
            event_tx: self.event_tx.clone(),
            handles: Arc::clone(&self.handles),
            stopping: Arc::clone(&self.stopping),
            active: Vec::new(),
            discovered: HashMap::new(),
        };
        self.run_task = Some(tokio::spawn(run_loop.run()));

        for endpoint in self.config.connect_to.clone() {
            match super::resolve_endpoint(&endpoint).await {
                Ok(addr) => self.add_outgoing_connection(addr).await,
                Err(e) => tracing::error!("Skipping outgoing endpoint {}: {}", endpoint, e),
            }
        }

        tracing::info!("Transport started as node {}", self.node_id);
        true
    }

    async fn start_listener(&mut self, addr: SocketAddr) {
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                // Non-fatal: outgoing connections still function
                tracing::error!("Failed to bind listener on {}: {}", addr, e);
                return;
            }
        };
        self.listen_addr = listener.local_addr().ok();
        tracing::info!("Listening on {}", self.listen_addr.unwrap_or(addr));

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        self.listener_shutdown_tx = Some(shutdown_tx);

        let pending_tx = self.pending_tx.clone();
        let node_id = self.node_id;
        self.listener_task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, peer_addr)) => {
                                tracing::info!("Accepted inbound connection from {}", peer_addr);
                                // The dialing side owns reconnection
                                let conn =
                                    Connection::new(stream, peer_addr, node_id, Duration::ZERO);
                                let _ = pending_tx.send(conn);
                            }
                            Err(e) => {
                                tracing::error!("Accept error: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Listener shutting down");
                        break;
                    }
                }
            }
        }));
    }

    /// Stop the transport: shut the listener down, then the run loop, which
    /// closes (and joins) every active connection before exiting.
    pub async fn stop_transport(&mut self) {
        self.stopping.store(true, Ordering::SeqCst);

        if let Some(tx) = self.listener_shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
        if let Some(task) = self.listener_task.take() {
            let _ = task.await;
        }
        if let Some(task) = self.run_task.take() {
            let _ = task.await;
        }
        self.listen_addr = None;
        self.node_map.lock().await.clear();
        self.reset_channels();
        tracing::info!("Transport stopped");
    }

    /// Recreate the internal queues so the transport can be started again
    fn reset_channels(&mut self) {
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_SIZE);
        let (pending_tx, pending_rx) = mpsc::unbounded_channel();
        let (removal_tx, removal_rx) = mpsc::unbounded_channel();
        let (conn_event_tx, conn_event_rx) = mpsc::unbounded_channel();
        let (map_update_tx, map_update_rx) = mpsc::unbounded_channel();

        self.event_tx = event_tx;
        self.event_rx = Some(event_rx);
        self.pending_tx = pending_tx;
        self.pending_rx = Some(pending_rx);
        self.removal_tx = removal_tx;
        self.removal_rx = Some(removal_rx);
        self.conn_event_tx = conn_event_tx;
        self.conn_event_rx = Some(conn_event_rx);
        self.map_update_tx = map_update_tx;
        self.map_update_rx = Mutex::new(map_update_rx);
    }

    /// Open a client socket to `endpoint` (best-effort, synchronous) and
    /// queue the resulting connection for pickup by the run loop. A failed
    /// connect is logged and discarded.
    pub async fn add_outgoing_connection(&self, endpoint: SocketAddr) {
        match TcpStream::connect(endpoint).await {
            Ok(stream) => {
                let conn = Connection::new(stream, endpoint, self.node_id, self.config.retry_delay());
                let _ = self.pending_tx.send(conn);
            }
            Err(e) => {
                tracing::warn!("Failed to connect to {}: {}", endpoint, e);
            }
        }
    }

    /// Request removal of the active connection matching `endpoint`; the
    /// run loop closes the first match.
    pub fn remove_outgoing_connection(&self, endpoint: SocketAddr) {
        let _ = self.removal_tx.send(endpoint);
    }

    /// Route one serialized message body to the given recipients, or to
    /// every connected peer when `recipients` is empty.
    ///
    /// Fails fast (false, no side effect) on more than 1024 explicit
    /// recipients, an oversized body, or an empty resolved target set.
    /// Recipients whose node id has never completed a handshake are
    /// silently skipped - there is no unicast delivery to unknown nodes.
    /// The fan-out itself runs on a background task, racing freely across
    /// targets.
    pub async fn transport_message(&self, body: Bytes, recipients: &[NodeId]) -> bool {
        if recipients.len() > MAX_RECIPIENTS {
            tracing::warn!("Rejecting message with {} explicit recipients", recipients.len());
            return false;
        }
        if body.len() > MAX_FRAME_PAYLOAD {
            tracing::warn!("Rejecting oversized message body ({} bytes)", body.len());
            return false;
        }

        self.apply_node_map_updates().await;

        let targets: Vec<ConnectionHandle> = if recipients.is_empty() {
            // Broadcast to all connected peers
            self.handles
                .read()
                .await
                .iter()
                .filter(|handle| handle.is_connected())
                .cloned()
                .collect()
        } else {
            let map = self.node_map.lock().await;
            let mut seen: HashSet<ConnectionId> = HashSet::new();
            let mut targets = Vec::new();
            for recipient in recipients {
                if let Some(handle) = map.get(recipient) {
                    if seen.insert(handle.id()) {
                        targets.push(handle.clone());
                    }
                }
            }
            targets
        };

        if targets.is_empty() {
            return false;
        }

        let message = SerializedMessage::new(body, recipients.to_vec());
        tokio::spawn(async move {
            for target in targets {
                if !target.send(Arc::clone(&message)) {
                    tracing::debug!("Dropped outbound message for {}", target.endpoint());
                }
            }
        });
        true
    }

    /// Drain pending node-map additions/removals produced by the run loop
    async fn apply_node_map_updates(&self) {
        let mut updates = self.map_update_rx.lock().await;
        let mut map = self.node_map.lock().await;
        while let Ok(update) = updates.try_recv() {
            match update {
                NodeMapUpdate::Add(node_id, handle) => {
                    map.insert(node_id, handle);
                }
                NodeMapUpdate::Remove(node_id) => {
                    map.remove(&node_id);
                }
            }
        }
    }
}

/// The transport's dedicated run loop: sole owner of the active connection
/// list and of discovery bookkeeping. All cross-thread handoff into it goes
/// through the MPSC queues.
struct RunLoop {
    pending_rx: mpsc::UnboundedReceiver<Connection>,
    removal_rx: mpsc::UnboundedReceiver<SocketAddr>,
    conn_event_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    conn_event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    map_update_tx: mpsc::UnboundedSender<NodeMapUpdate>,
    event_tx: mpsc::Sender<TransportEvent>,
    handles: Arc<RwLock<Vec<ConnectionHandle>>>,
    stopping: Arc<AtomicBool>,
    active: Vec<Connection>,
    /// Last known valid remote node per connection, for loss notification
    discovered: HashMap<ConnectionId, NodeId>,
}

impl RunLoop {
    async fn run(mut self) {
        while !self.stopping.load(Ordering::SeqCst) {
            self.admit_pending().await;
            self.process_removals().await;
            self.process_connection_events().await;
            let connected = self.sweep().await;
            self.drain_inbound().await;

            let tick = if connected > 0 { ACTIVE_TICK } else { IDLE_TICK };
            tokio::time::sleep(tick).await;
        }

        for mut conn in self.active.drain(..) {
            conn.close().await;
        }
        self.handles.write().await.clear();
        tracing::debug!("Transport run loop exited");
    }

    /// Start newly-queued connections and add them to the active set
    async fn admit_pending(&mut self) {
        while let Ok(mut conn) = self.pending_rx.try_recv() {
            conn.set_event_sender(self.conn_event_tx.clone());
            conn.start();
            self.handles.write().await.push(conn.handle());
            self.active.push(conn);
        }
    }

    /// Close the first active connection matching each requested endpoint
    async fn process_removals(&mut self) {
        while let Ok(endpoint) = self.removal_rx.try_recv() {
            if let Some(conn) = self
                .active
                .iter_mut()
                .find(|conn| conn.remote_endpoint() == endpoint)
            {
                tracing::info!("Closing connection to {} on request", endpoint);
                conn.close().await;
            } else {
                tracing::debug!("No active connection to {} to remove", endpoint);
            }
        }
    }

    /// Translate connection state changes into discovery/loss events and
    /// node-map updates
    async fn process_connection_events(&mut self) {
        while let Ok(event) = self.conn_event_rx.try_recv() {
            match event.state {
                ConnectionState::Connected => {
                    let Some(node_id) = event.node_id.filter(NodeId::is_valid) else {
                        continue;
                    };
                    let Some(handle) = self
                        .active
                        .iter()
                        .find(|conn| conn.id() == event.id)
                        .map(Connection::handle)
                    else {
                        continue;
                    };

                    let never_seen = !self.discovered.values().any(|known| *known == node_id);
                    self.discovered.insert(event.id, node_id);
                    let _ = self.map_update_tx.send(NodeMapUpdate::Add(node_id, handle));
                    if never_seen {
                        tracing::info!("Discovered node {} at {}", node_id, event.endpoint);
                        self.emit(TransportEvent::NodeDiscovered { node_id }).await;
                    }
                }
                _ => {
                    if let Some(node_id) = self.discovered.remove(&event.id) {
                        let _ = self.map_update_tx.send(NodeMapUpdate::Remove(node_id));
                        tracing::info!("Lost node {} ({})", node_id, event.endpoint);
                        self.emit(TransportEvent::NodeLost { node_id }).await;
                    }
                }
            }
        }
    }

    /// Remove terminally-disconnected connections and mirror the surviving
    /// handles for the send path. Returns the number of connected peers.
    async fn sweep(&mut self) -> usize {
        let before = self.active.len();
        let mut connected = 0;
        let mut i = 0;
        while i < self.active.len() {
            match self.active[i].state() {
                ConnectionState::Disconnected => {
                    // Order is not significant
                    let conn = self.active.swap_remove(i);
                    tracing::debug!("Dropping dead connection to {}", conn.remote_endpoint());
                }
                ConnectionState::Connected => {
                    connected += 1;
                    i += 1;
                }
                _ => i += 1,
            }
        }

        if self.active.len() != before {
            let mut handles = self.handles.write().await;
            handles.clear();
            handles.extend(self.active.iter().map(Connection::handle));
        }
        connected
    }

    /// Forward everything queued on every connection's inbound queue
    async fn drain_inbound(&mut self) {
        for i in 0..self.active.len() {
            while let Some((message, sender)) = self.active[i].receive() {
                self.emit(TransportEvent::MessageReceived { message, sender }).await;
            }
        }
    }

    /// Push one event to the bridge channel without ever parking the run
    /// loop on a stalled bridge: back off while the queue is full and give
    /// up as soon as the stopping flag is set, so `stop_transport` can
    /// always join this task.
    async fn emit(&self, mut event: TransportEvent) {
        loop {
            if self.stopping.load(Ordering::SeqCst) {
                return;
            }
            match self.event_tx.try_send(event) {
                Ok(()) => return,
                Err(mpsc::error::TrySendError::Full(returned)) => {
                    event = returned;
                    tokio::time::sleep(ACTIVE_TICK).await;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{now_micros, Scope};
    use std::collections::HashMap as StdHashMap;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn listen_config() -> TransportConfig {
        TransportConfig {
            listen_endpoint: "127.0.0.1:0".to_string(),
            ..TransportConfig::default()
        }
    }

    fn envelope(sender: NodeId, recipients: Vec<NodeId>) -> Bytes {
        DeserializedMessage {
            type_name: "test.Event".to_string(),
            sender,
            recipients,
            scope: Scope::Network,
            time_sent: now_micros(),
            expiration: 0,
            annotations: StdHashMap::new(),
            body: Bytes::from_static(b"payload"),
        }
        .encode()
        .unwrap()
    }

    async fn next_event(rx: &mut mpsc::Receiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for transport event")
            .expect("event channel closed")
    }

    async fn wait_discovered(rx: &mut mpsc::Receiver<TransportEvent>) -> NodeId {
        loop {
            if let TransportEvent::NodeDiscovered { node_id } = next_event(rx).await {
                return node_id;
            }
        }
    }

    async fn wait_message(rx: &mut mpsc::Receiver<TransportEvent>) -> (DeserializedMessage, NodeId) {
        loop {
            if let TransportEvent::MessageReceived { message, sender } = next_event(rx).await {
                return (message, sender);
            }
        }
    }

    async fn send_until_delivered(
        from: &TcpTransport,
        rx: &mut mpsc::Receiver<TransportEvent>,
        body: Bytes,
        recipients: &[NodeId],
    ) -> (DeserializedMessage, NodeId) {
        // Discovery fires as soon as the handshake lands; give the map a
        // moment to catch up on the send path
        for _ in 0..100 {
            if from.transport_message(body.clone(), recipients).await {
                return wait_message(rx).await;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("message was never accepted for delivery");
    }

    #[tokio::test]
    async fn test_unicast_to_unknown_node_is_noop() {
        let transport = TcpTransport::new(TransportConfig::default());
        let body = envelope(transport.local_node_id(), Vec::new());
        let unknown = NodeId::generate();

        assert!(!transport.transport_message(body, &[unknown]).await);
    }

    #[tokio::test]
    async fn test_recipient_cap_is_rejected() {
        let transport = TcpTransport::new(TransportConfig::default());
        let body = envelope(transport.local_node_id(), Vec::new());
        let recipients: Vec<NodeId> = (0..=MAX_RECIPIENTS).map(|_| NodeId::generate()).collect();

        assert_eq!(recipients.len(), MAX_RECIPIENTS + 1);
        assert!(!transport.transport_message(body, &recipients).await);
    }

    #[tokio::test]
    async fn test_oversized_body_is_rejected() {
        let transport = TcpTransport::new(TransportConfig::default());
        let body = Bytes::from(vec![0u8; MAX_FRAME_PAYLOAD + 1]);

        assert!(!transport.transport_message(body, &[]).await);
    }

    #[tokio::test]
    async fn test_broadcast_with_no_connections_fails() {
        let transport = TcpTransport::new(TransportConfig::default());
        let body = envelope(transport.local_node_id(), Vec::new());

        assert!(!transport.transport_message(body, &[]).await);
    }

    #[tokio::test]
    async fn test_start_twice_returns_false() {
        let mut transport = TcpTransport::new(TransportConfig::default());
        assert!(transport.start_transport().await);
        assert!(!transport.start_transport().await);
        transport.stop_transport().await;
    }

    #[tokio::test]
    async fn test_end_to_end_discovery_and_broadcast() {
        init_tracing();
        let mut a = TcpTransport::new(listen_config());
        let mut a_events = a.take_event_receiver().unwrap();
        assert!(a.start_transport().await);
        let a_addr = a.local_listen_addr().expect("listener should be bound");

        let mut b = TcpTransport::new(TransportConfig::default());
        let mut b_events = b.take_event_receiver().unwrap();
        assert!(b.start_transport().await);
        b.add_outgoing_connection(a_addr).await;

        // Discovery fires on both sides with the opposite node id
        assert_eq!(wait_discovered(&mut a_events).await, b.local_node_id());
        assert_eq!(wait_discovered(&mut b_events).await, a.local_node_id());

        // Broadcast from B lands at A with B as the sender
        let body = envelope(b.local_node_id(), Vec::new());
        let (message, sender) =
            send_until_delivered(&b, &mut a_events, body, &[]).await;
        assert_eq!(sender, b.local_node_id());
        assert_eq!(message.type_name, "test.Event");
        assert_eq!(&message.body[..], b"payload");

        b.stop_transport().await;
        a.stop_transport().await;
        assert!(!a.is_running());
    }

    #[tokio::test]
    async fn test_unicast_reaches_exactly_the_addressed_subset() {
        init_tracing();
        let mut a = TcpTransport::new(listen_config());
        let mut a_events = a.take_event_receiver().unwrap();
        assert!(a.start_transport().await);
        let a_addr = a.local_listen_addr().unwrap();

        let mut b = TcpTransport::new(TransportConfig::default());
        let mut b_events = b.take_event_receiver().unwrap();
        assert!(b.start_transport().await);
        b.add_outgoing_connection(a_addr).await;

        let mut c = TcpTransport::new(TransportConfig::default());
        let mut c_events = c.take_event_receiver().unwrap();
        assert!(c.start_transport().await);
        c.add_outgoing_connection(a_addr).await;

        let b_id = wait_discovered(&mut b_events).await;
        assert_eq!(b_id, a.local_node_id());
        let c_id = wait_discovered(&mut c_events).await;
        assert_eq!(c_id, a.local_node_id());

        // A sees both peers
        let first = wait_discovered(&mut a_events).await;
        let second = wait_discovered(&mut a_events).await;
        let discovered: HashSet<NodeId> = [first, second].into_iter().collect();
        assert!(discovered.contains(&b.local_node_id()));
        assert!(discovered.contains(&c.local_node_id()));

        // Unicast from A to B only
        let body = envelope(a.local_node_id(), vec![b.local_node_id()]);
        let (_, sender) =
            send_until_delivered(&a, &mut b_events, body, &[b.local_node_id()]).await;
        assert_eq!(sender, a.local_node_id());

        // C must see nothing in the same window
        let nothing = tokio::time::timeout(Duration::from_millis(300), async {
            loop {
                if let Some(TransportEvent::MessageReceived { .. }) = c_events.recv().await {
                    break;
                }
            }
        })
        .await;
        assert!(nothing.is_err(), "unicast to B leaked to C");

        // Broadcast from A reaches both
        let body = envelope(a.local_node_id(), Vec::new());
        assert!(a.transport_message(body, &[]).await);
        wait_message(&mut b_events).await;
        wait_message(&mut c_events).await;

        c.stop_transport().await;
        b.stop_transport().await;
        a.stop_transport().await;
    }

    #[tokio::test]
    async fn test_hostname_connect_endpoint_is_resolved() {
        init_tracing();
        let mut a = TcpTransport::new(listen_config());
        let mut a_events = a.take_event_receiver().unwrap();
        assert!(a.start_transport().await);
        let a_addr = a.local_listen_addr().unwrap();

        // Dial by hostname; startup resolves it to A's listener
        let mut b = TcpTransport::new(TransportConfig {
            connect_to: vec![format!("localhost:{}", a_addr.port())],
            ..TransportConfig::default()
        });
        let mut b_events = b.take_event_receiver().unwrap();
        assert!(b.start_transport().await);

        assert_eq!(wait_discovered(&mut a_events).await, b.local_node_id());
        assert_eq!(wait_discovered(&mut b_events).await, a.local_node_id());

        b.stop_transport().await;
        a.stop_transport().await;
    }

    #[tokio::test]
    async fn test_stop_completes_with_untaken_event_receiver() {
        init_tracing();
        // A's bridge channel is never drained; flooding it must not wedge
        // the run loop past the point where stop can join it
        let mut a = TcpTransport::new(listen_config());
        assert!(a.start_transport().await);
        let a_addr = a.local_listen_addr().unwrap();

        let mut b = TcpTransport::new(TransportConfig::default());
        let mut b_events = b.take_event_receiver().unwrap();
        assert!(b.start_transport().await);
        b.add_outgoing_connection(a_addr).await;
        assert_eq!(wait_discovered(&mut b_events).await, a.local_node_id());

        let body = envelope(b.local_node_id(), Vec::new());
        for _ in 0..100 {
            if b.transport_message(body.clone(), &[]).await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        for _ in 0..2 * EVENT_QUEUE_SIZE {
            b.transport_message(body.clone(), &[]).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        tokio::time::timeout(Duration::from_secs(5), a.stop_transport())
            .await
            .expect("stop_transport hung on a full bridge channel");
        b.stop_transport().await;
    }

    #[tokio::test]
    async fn test_remove_outgoing_connection_raises_node_lost() {
        init_tracing();
        let mut a = TcpTransport::new(listen_config());
        let mut a_events = a.take_event_receiver().unwrap();
        assert!(a.start_transport().await);
        let a_addr = a.local_listen_addr().unwrap();

        let mut b = TcpTransport::new(TransportConfig::default());
        let mut b_events = b.take_event_receiver().unwrap();
        assert!(b.start_transport().await);
        b.add_outgoing_connection(a_addr).await;

        wait_discovered(&mut a_events).await;
        assert_eq!(wait_discovered(&mut b_events).await, a.local_node_id());

        b.remove_outgoing_connection(a_addr);

        let lost = loop {
            if let TransportEvent::NodeLost { node_id } = next_event(&mut b_events).await {
                break node_id;
            }
        };
        assert_eq!(lost, a.local_node_id());

        b.stop_transport().await;
        a.stop_transport().await;
    }
}
