//! UDP broadcast peer discovery.
//!
//! Every node announces `PEER:<peerId>:<tcpPort>` on the discovery port
//! every 5 seconds and listens for the announcements of others. Discovered
//! peers are handed to the node's address book; peers silent for 30 seconds
//! are forgotten.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use messenger_types::PeerId;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{NetworkError, NetworkResult};
use crate::node::MessengerNode;

pub const DISCOVERY_INTERVAL: Duration = Duration::from_secs(5);
pub const DISCOVERY_EXPIRY: Duration = Duration::from_secs(30);

/// Parse one `PEER:<peerId>:<tcpPort>` announcement.
pub fn parse_announcement(text: &str) -> Option<(PeerId, u16)> {
    let rest = text.trim().strip_prefix("PEER:")?;
    let (id, port) = rest.split_once(':')?;
    if id.is_empty() {
        return None;
    }
    Some((PeerId::from(id), port.parse().ok()?))
}

pub struct PeerDiscovery {
    node: MessengerNode,
    broadcast_port: u16,
    tcp_port: u16,
}

impl PeerDiscovery {
    /// `tcp_port` is the port other peers should dial us on; the broadcast
    /// port carries only the discovery datagrams.
    pub fn new(node: MessengerNode, broadcast_port: u16, tcp_port: u16) -> Self {
        Self {
            node,
            broadcast_port,
            tcp_port,
        }
    }

    /// Bind the discovery socket and run the announce/listen/expiry loop
    /// until node shutdown.
    pub async fn spawn(self) -> NetworkResult<JoinHandle<()>> {
        let socket = UdpSocket::bind(("0.0.0.0", self.broadcast_port))
            .await
            .map_err(|e| NetworkError::BindFailed {
                addr: format!("0.0.0.0:{}", self.broadcast_port),
                source: e,
            })?;
        socket
            .set_broadcast(true)
            .map_err(|e| NetworkError::BindFailed {
                addr: format!("0.0.0.0:{}", self.broadcast_port),
                source: e,
            })?;

        info!("peer discovery active on UDP port {}", self.broadcast_port);
        Ok(tokio::spawn(async move { self.run(socket).await }))
    }

    async fn run(self, socket: UdpSocket) {
        let announcement = format!("PEER:{}:{}", self.node.local_id(), self.tcp_port);
        let target = (Ipv4Addr::BROADCAST, self.broadcast_port);

        let mut shutdown = self.node.shutdown_signal();
        let mut ticker = tokio::time::interval(DISCOVERY_INTERVAL);
        let mut last_seen: HashMap<PeerId, Instant> = HashMap::new();
        let mut buf = [0u8; 256];

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    // Broadcast errors are expected on networks that filter
                    // them; keep announcing.
                    if let Err(e) = socket.send_to(announcement.as_bytes(), target).await {
                        debug!("discovery broadcast failed: {}", e);
                    }

                    last_seen.retain(|peer_id, seen| {
                        let alive = seen.elapsed() < DISCOVERY_EXPIRY;
                        if !alive {
                            info!("lost sight of peer {}", peer_id);
                        }
                        alive
                    });
                }
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, source)) => {
                        let Ok(text) = std::str::from_utf8(&buf[..len]) else {
                            continue;
                        };
                        let Some((peer_id, port)) = parse_announcement(text) else {
                            continue;
                        };
                        if &peer_id == self.node.local_id() {
                            continue;
                        }
                        if last_seen.insert(peer_id.clone(), Instant::now()).is_none() {
                            info!("discovered peer {} at {}:{}", peer_id, source.ip(), port);
                        }
                        self.node
                            .register_discovered_peer(peer_id, source.ip().to_string(), port);
                    }
                    Err(e) => debug!("discovery receive failed: {}", e),
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("discovery loop stopping");
                        break;
                    }
                }
            }
        }
    }
}
