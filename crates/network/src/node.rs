//! Peer registry and connection manager.
//!
//! A [`MessengerNode`] owns every live peer connection, inbound and outbound.
//! The registry map is the only shared mutable structure; it sits behind one
//! `RwLock` and the lock is held only for map lookups, inserts and removals,
//! never across socket I/O. Each established peer gets a dedicated read loop
//! and a dedicated writer task; the socket halves are owned exclusively by
//! those two tasks, and everyone else reaches the peer through its ID.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use messenger_crypto::{verify_signature, RsaKeyPair, SessionCipher};
use messenger_types::{Message, MessageBody, PeerId, PeerSummary, SessionState};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Notify, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::codec::{read_frame, write_frame};
use crate::error::{FrameError, HandshakeError, NetworkError, NetworkResult};
use crate::handshake::{run_handshake, Role, SessionOutcome, HANDSHAKE_TIMEOUT};
use crate::heartbeat::{HeartbeatEvent, HeartbeatMonitor, HEARTBEAT_INTERVAL};
use crate::queue::MessageQueue;
use crate::wire::Envelope;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Notifications the node emits for its consumers (console, history,
/// reconnection driver). An explicit channel rather than callbacks, so
/// subscribers decide their own threading.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    Connected(PeerSummary),
    Disconnected(PeerSummary),
    MessageReceived { peer_id: PeerId, message: Message },
}

/// Address book entry for a peer we could dial again.
#[derive(Debug, Clone)]
struct KnownPeer {
    host: String,
    port: u16,
}

/// Registry entry for one established connection. Everything a caller needs
/// is cloned out under the read lock; the socket itself lives in the peer's
/// read/writer tasks.
struct PeerHandle {
    summary: PeerSummary,
    /// Distinguishes this connection from an earlier one under the same ID,
    /// so a stale read loop cannot tear down its replacement.
    epoch: u64,
    write_tx: mpsc::UnboundedSender<Envelope>,
    cipher: Arc<SessionCipher>,
    peer_public_key: Arc<Vec<u8>>,
    closed: Arc<Notify>,
}

/// Cloning a node hands out another lightweight handle to the same shared
/// state, which is how the background loops capture it.
#[derive(Clone)]
pub struct MessengerNode {
    local_id: PeerId,
    display_name: String,
    keys: Arc<RsaKeyPair>,
    peers: Arc<RwLock<HashMap<PeerId, PeerHandle>>>,
    known_peers: Arc<Mutex<HashMap<PeerId, KnownPeer>>>,
    queue: MessageQueue,
    event_tx: mpsc::UnboundedSender<PeerEvent>,
    heartbeat: Arc<HeartbeatMonitor>,
    shutdown_tx: watch::Sender<bool>,
    epoch_counter: Arc<AtomicU64>,
}

impl MessengerNode {
    /// Create a node with a fresh identity and RSA key pair, and start its
    /// background loops (heartbeat sweep, heartbeat sender, outgoing pump).
    /// The returned receiver carries every [`PeerEvent`] the node emits.
    pub fn new(
        display_name: impl Into<String>,
    ) -> NetworkResult<(Self, mpsc::UnboundedReceiver<PeerEvent>)> {
        let local_id = PeerId::random();
        let keys = Arc::new(RsaKeyPair::generate()?);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (heartbeat_tx, heartbeat_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);

        let node = Self {
            local_id: local_id.clone(),
            display_name: display_name.into(),
            keys,
            peers: Arc::new(RwLock::new(HashMap::new())),
            known_peers: Arc::new(Mutex::new(HashMap::new())),
            queue: MessageQueue::new(),
            event_tx,
            heartbeat: Arc::new(HeartbeatMonitor::new(heartbeat_tx)),
            shutdown_tx,
            epoch_counter: Arc::new(AtomicU64::new(0)),
        };

        Arc::clone(&node.heartbeat).spawn(node.shutdown_signal());
        node.spawn_heartbeat_consumer(heartbeat_rx);
        node.spawn_heartbeat_sender();
        node.spawn_outgoing_pump();

        info!("node {} ({}) initialized", local_id, node.display_name);
        Ok((node, event_rx))
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// The incoming/outgoing queue pair this node reads and feeds.
    pub fn queue(&self) -> &MessageQueue {
        &self.queue
    }

    pub fn public_key_der(&self) -> NetworkResult<Vec<u8>> {
        Ok(self.keys.public_key_der()?)
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Start accepting inbound connections. Returns the bound port (useful
    /// when asked to listen on port 0). Bind failure is fatal to the caller;
    /// per-connection failures are not.
    pub async fn listen(&self, port: u16) -> NetworkResult<u16> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|e| NetworkError::BindFailed {
                addr: format!("0.0.0.0:{}", port),
                source: e,
            })?;
        let local_port = listener
            .local_addr()
            .map_err(|e| NetworkError::BindFailed {
                addr: format!("0.0.0.0:{}", port),
                source: e,
            })?
            .port();

        info!("listening for peer connections on port {}", local_port);

        let node = self.clone();
        let mut shutdown = self.shutdown_signal();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer_addr)) => {
                            let node = node.clone();
                            tokio::spawn(async move {
                                match node.establish(stream, peer_addr, Role::Responder).await {
                                    Ok(peer_id) => {
                                        info!("peer {} connected from {}", peer_id, peer_addr)
                                    }
                                    Err(e) => warn!("inbound connection from {} failed: {}", peer_addr, e),
                                }
                            });
                        }
                        Err(e) => error!("failed to accept connection: {}", e),
                    },
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            debug!("accept loop stopping");
                            break;
                        }
                    }
                }
            }
        });

        Ok(local_port)
    }

    /// Open an outbound connection, run the handshake as initiator, and
    /// register the peer. On any failure the socket is closed and the peer
    /// never becomes visible to other components.
    pub async fn connect(&self, host: &str, port: u16) -> NetworkResult<PeerId> {
        if *self.shutdown_tx.borrow() {
            return Err(NetworkError::Shutdown);
        }

        let addr = format!("{}:{}", host, port);
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| NetworkError::ConnectTimeout { addr: addr.clone() })?
            .map_err(|e| NetworkError::Connect {
                addr: addr.clone(),
                source: e,
            })?;
        let peer_addr = stream.peer_addr().map_err(|e| NetworkError::Connect {
            addr: addr.clone(),
            source: e,
        })?;

        let peer_id = self.establish(stream, peer_addr, Role::Initiator).await?;

        // Remember the dialed address so the reconnection policy can retry.
        self.known_peers
            .lock()
            .expect("known peers lock poisoned")
            .insert(
                peer_id.clone(),
                KnownPeer {
                    host: host.to_string(),
                    port,
                },
            );

        info!("connected to peer {} at {}", peer_id, addr);
        Ok(peer_id)
    }

    /// Run the handshake on a fresh socket and, only on success, insert the
    /// peer into the registry and start its read/writer tasks.
    async fn establish(
        &self,
        mut stream: TcpStream,
        peer_addr: SocketAddr,
        role: Role,
    ) -> NetworkResult<PeerId> {
        let outcome = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            run_handshake(&mut stream, self.local_id.clone(), Arc::clone(&self.keys), role),
        )
        .await
        .unwrap_or(Err(HandshakeError::Timeout))
        .map_err(|e| NetworkError::Handshake {
            addr: peer_addr.to_string(),
            source: e,
        })?;

        self.register(stream, peer_addr, outcome).await
    }

    async fn register(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
        outcome: SessionOutcome,
    ) -> NetworkResult<PeerId> {
        let peer_id = outcome.peer_id;
        let cipher = Arc::new(SessionCipher::new(&outcome.session_key)?);
        let peer_public_key = Arc::new(outcome.peer_public_key);

        // A peer reconnecting under the same ID replaces its old entry; tear
        // the old connection down first so it gets its disconnect event.
        self.disconnect(&peer_id).await;

        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(Notify::new());
        let epoch = self.epoch_counter.fetch_add(1, Ordering::SeqCst);
        let summary = PeerSummary {
            id: peer_id.clone(),
            address: peer_addr.ip(),
            port: peer_addr.port(),
            state: SessionState::Established,
            connected_at: Utc::now(),
        };

        let handle = PeerHandle {
            summary: summary.clone(),
            epoch,
            write_tx,
            cipher: Arc::clone(&cipher),
            peer_public_key: Arc::clone(&peer_public_key),
            closed: Arc::clone(&closed),
        };

        {
            let mut peers = self.peers.write().await;
            peers.insert(peer_id.clone(), handle);
        }
        self.heartbeat.start_monitoring(peer_id.clone());

        let (read_half, write_half) = stream.into_split();
        self.spawn_writer(peer_id.clone(), epoch, write_half, write_rx);
        self.spawn_reader(peer_id.clone(), epoch, read_half, cipher, peer_public_key, closed);

        let _ = self.event_tx.send(PeerEvent::Connected(summary));
        Ok(peer_id)
    }

    fn spawn_writer(
        &self,
        peer_id: PeerId,
        epoch: u64,
        mut write_half: OwnedWriteHalf,
        mut write_rx: mpsc::UnboundedReceiver<Envelope>,
    ) {
        let node = self.clone();
        tokio::spawn(async move {
            while let Some(envelope) = write_rx.recv().await {
                if let Err(e) = write_frame(&mut write_half, &envelope).await {
                    warn!("write to peer {} failed: {}", peer_id, e);
                    node.disconnect_instance(&peer_id, Some(epoch)).await;
                    break;
                }
            }
            // Dropping the write half closes our side of the socket.
        });
    }

    fn spawn_reader(
        &self,
        peer_id: PeerId,
        epoch: u64,
        mut read_half: OwnedReadHalf,
        cipher: Arc<SessionCipher>,
        peer_public_key: Arc<Vec<u8>>,
        closed: Arc<Notify>,
    ) {
        let node = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = closed.notified() => break,
                    frame = read_frame(&mut read_half) => match frame {
                        Ok(envelope) => {
                            if !node.handle_frame(&peer_id, &cipher, &peer_public_key, envelope) {
                                break;
                            }
                        }
                        Err(FrameError::Closed) => {
                            debug!("peer {} closed the connection", peer_id);
                            break;
                        }
                        Err(e) => {
                            warn!("read from peer {} failed: {}", peer_id, e);
                            break;
                        }
                    },
                }
            }
            // Whatever ended the loop, the peer comes out of the registry.
            node.disconnect_instance(&peer_id, Some(epoch)).await;
        });
    }

    /// Process one inbound frame from an established peer. Returns false
    /// when the connection must be dropped.
    fn handle_frame(
        &self,
        peer_id: &PeerId,
        cipher: &SessionCipher,
        peer_public_key: &[u8],
        envelope: Envelope,
    ) -> bool {
        match envelope {
            Envelope::Heartbeat { .. } => {
                self.heartbeat.record_heartbeat(peer_id);
                true
            }
            Envelope::Chat(message) => {
                match &message.signature {
                    Some(signature) => {
                        if !verify_signature(peer_public_key, &message.signing_bytes(), signature) {
                            warn!(
                                "invalid signature on message {} from peer {}, dropping",
                                message.id, peer_id
                            );
                            return true;
                        }
                    }
                    None => debug!("unsigned message {} from peer {}", message.id, peer_id),
                }

                let message = match message.body {
                    MessageBody::Encrypted(blob) => match cipher.decrypt(&blob) {
                        Ok(text) => Message {
                            id: message.id,
                            sender: message.sender,
                            body: MessageBody::Plain(text),
                            timestamp: message.timestamp,
                            signature: message.signature,
                        },
                        Err(e) => {
                            warn!("cannot decrypt message from peer {}: {}", peer_id, e);
                            return true;
                        }
                    },
                    MessageBody::Plain(_) => message,
                };

                if self.queue.enqueue_incoming(message.clone()).is_err() {
                    // Queue already completed; the node is shutting down.
                    return false;
                }
                let _ = self.event_tx.send(PeerEvent::MessageReceived {
                    peer_id: peer_id.clone(),
                    message,
                });
                true
            }
            Envelope::PublicKey(_) | Envelope::SessionKey(_) => {
                warn!(
                    "peer {} sent a handshake frame after establishment, disconnecting",
                    peer_id
                );
                false
            }
        }
    }

    /// Send a message to one peer, encrypted under its session key and
    /// signed with our private key.
    pub async fn send_to(&self, peer_id: &PeerId, content: &str) -> NetworkResult<()> {
        let (write_tx, cipher) = {
            let peers = self.peers.read().await;
            let handle = peers
                .get(peer_id)
                .ok_or_else(|| NetworkError::PeerNotFound {
                    peer_id: peer_id.clone(),
                })?;
            (handle.write_tx.clone(), Arc::clone(&handle.cipher))
        };

        let message = self.seal(&cipher, content, Uuid::new_v4());
        write_tx
            .send(Envelope::Chat(message))
            .map_err(|_| NetworkError::SendFailed {
                peer_id: peer_id.clone(),
            })
    }

    /// Send a message to every established peer. Each peer gets the payload
    /// encrypted under its own session key; the message ID is shared.
    /// Returns how many peers the message was handed to.
    pub async fn broadcast(&self, content: &str) -> usize {
        let targets: Vec<(PeerId, mpsc::UnboundedSender<Envelope>, Arc<SessionCipher>)> = {
            let peers = self.peers.read().await;
            peers
                .iter()
                .map(|(id, handle)| {
                    (id.clone(), handle.write_tx.clone(), Arc::clone(&handle.cipher))
                })
                .collect()
        };

        let message_id = Uuid::new_v4();
        let mut delivered = 0;
        for (peer_id, write_tx, cipher) in targets {
            let message = self.seal(&cipher, content, message_id);
            match write_tx.send(Envelope::Chat(message)) {
                Ok(()) => delivered += 1,
                // A dead writer means the connection is already tearing down.
                Err(_) => debug!("skipping peer {} with closed writer", peer_id),
            }
        }
        delivered
    }

    fn seal(&self, cipher: &SessionCipher, content: &str, id: Uuid) -> Message {
        let mut message = Message {
            id,
            sender: self.display_name.clone(),
            body: MessageBody::Encrypted(cipher.encrypt(content)),
            timestamp: Utc::now(),
            signature: None,
        };
        message.signature = Some(self.keys.sign(&message.signing_bytes()));
        message
    }

    /// Remove a peer and clean up its connection. Idempotent: disconnecting
    /// an absent peer is a no-op, and under concurrent calls only the one
    /// that wins the registry removal emits the disconnect event.
    pub async fn disconnect(&self, peer_id: &PeerId) -> bool {
        self.disconnect_instance(peer_id, None).await
    }

    async fn disconnect_instance(&self, peer_id: &PeerId, epoch: Option<u64>) -> bool {
        let removed = {
            let mut peers = self.peers.write().await;
            let matches = peers
                .get(peer_id)
                .is_some_and(|handle| epoch.map_or(true, |e| handle.epoch == e));
            if matches {
                peers.remove(peer_id)
            } else {
                None
            }
        };

        let Some(handle) = removed else {
            return false;
        };

        // Only the winner of the removal gets here.
        handle.closed.notify_one();
        self.heartbeat.stop_monitoring(peer_id);

        let mut summary = handle.summary;
        summary.state = SessionState::Disconnected;
        info!("peer {} disconnected", peer_id);
        let _ = self.event_tx.send(PeerEvent::Disconnected(summary));
        true
    }

    pub async fn list_peers(&self) -> Vec<PeerSummary> {
        let peers = self.peers.read().await;
        peers.values().map(|handle| handle.summary.clone()).collect()
    }

    pub async fn connected_count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Entry point for the discovery collaborator: record a peer announced
    /// on the local network so it can be dialed or redialed later.
    pub fn register_discovered_peer(&self, peer_id: PeerId, host: String, port: u16) {
        if peer_id == self.local_id {
            return;
        }
        let mut known = self.known_peers.lock().expect("known peers lock poisoned");
        if known
            .insert(peer_id.clone(), KnownPeer { host, port })
            .is_none()
        {
            debug!("discovered peer {}", peer_id);
        }
    }

    /// Last known dialable address for a peer, if any.
    pub fn known_peer_addr(&self, peer_id: &PeerId) -> Option<(String, u16)> {
        let known = self.known_peers.lock().expect("known peers lock poisoned");
        known.get(peer_id).map(|peer| (peer.host.clone(), peer.port))
    }

    /// Stop every loop, drop every peer, and complete the queues. All
    /// background tasks observe the signal within one polling interval.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);

        let ids: Vec<PeerId> = {
            let peers = self.peers.read().await;
            peers.keys().cloned().collect()
        };
        for peer_id in &ids {
            self.disconnect(peer_id).await;
        }

        self.queue.mark_complete();
        info!("node {} shut down", self.local_id);
    }

    /// Translate heartbeat timeouts into disconnects.
    fn spawn_heartbeat_consumer(&self, mut heartbeat_rx: mpsc::UnboundedReceiver<HeartbeatEvent>) {
        let node = self.clone();
        let mut shutdown = self.shutdown_signal();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = heartbeat_rx.recv() => match event {
                        Some(HeartbeatEvent::Failed(peer_id)) => {
                            warn!("peer {} failed heartbeat monitoring", peer_id);
                            node.disconnect(&peer_id).await;
                        }
                        Some(HeartbeatEvent::Received(peer_id)) => {
                            debug!("heartbeat from peer {}", peer_id);
                        }
                        None => break,
                    },
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Announce our own liveness to every peer on the expected cadence.
    fn spawn_heartbeat_sender(&self) {
        let node = self.clone();
        let mut shutdown = self.shutdown_signal();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let targets: Vec<mpsc::UnboundedSender<Envelope>> = {
                            let peers = node.peers.read().await;
                            peers.values().map(|handle| handle.write_tx.clone()).collect()
                        };
                        for write_tx in targets {
                            let _ = write_tx.send(Envelope::Heartbeat {
                                sender: node.local_id.clone(),
                            });
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Drain the outgoing queue into broadcasts. Ends when the queue
    /// completes at shutdown.
    fn spawn_outgoing_pump(&self) {
        let node = self.clone();
        tokio::spawn(async move {
            while let Some(message) = node.queue.dequeue_outgoing().await {
                if let Some(content) = message.content() {
                    node.broadcast(content).await;
                }
            }
            debug!("outgoing pump stopped");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fresh_node_has_no_peers() {
        let (node, _events) = MessengerNode::new("tester").unwrap();
        assert!(node.list_peers().await.is_empty());
        assert_eq!(node.connected_count().await, 0);
    }

    #[tokio::test]
    async fn test_discovery_registration_skips_self() {
        let (node, _events) = MessengerNode::new("tester").unwrap();
        let self_id = node.local_id().clone();

        node.register_discovered_peer(self_id.clone(), "127.0.0.1".into(), 9000);
        assert!(node.known_peer_addr(&self_id).is_none());

        let other = PeerId::from("aabbccdd");
        node.register_discovered_peer(other.clone(), "127.0.0.1".into(), 9001);
        assert_eq!(
            node.known_peer_addr(&other),
            Some(("127.0.0.1".to_string(), 9001))
        );
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer_is_an_error() {
        let (node, _events) = MessengerNode::new("tester").unwrap();
        let err = node
            .send_to(&PeerId::from("missing1"), "hello")
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::PeerNotFound { .. }));
    }

    #[tokio::test]
    async fn test_disconnecting_an_absent_peer_is_a_noop() {
        let (node, _events) = MessengerNode::new("tester").unwrap();
        assert!(!node.disconnect(&PeerId::from("missing1")).await);
    }
}
