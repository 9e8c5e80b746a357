use std::sync::Arc;

use messenger_network::discovery::PeerDiscovery;
use messenger_network::node::{MessengerNode, PeerEvent};
use messenger_network::reconnect::{ReconnectEvent, ReconnectPolicy};
use messenger_types::Message;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::console::{self, Command};
use crate::history::MessageHistory;

/// Wires the peer session core to its collaborators: console input, message
/// display, history persistence, discovery and reconnection.
pub struct MessengerApp {
    config: AppConfig,
    node: MessengerNode,
    events: mpsc::UnboundedReceiver<PeerEvent>,
    history: Arc<MessageHistory>,
}

impl MessengerApp {
    pub fn new(config: AppConfig) -> anyhow::Result<Self> {
        config.validate()?;

        info!("initializing node as '{}'", config.node.display_name);
        let (node, events) = MessengerNode::new(config.node.display_name.clone())?;
        let history = Arc::new(MessageHistory::new(&config.history.file));

        Ok(Self {
            config,
            node,
            events,
            history,
        })
    }

    pub fn node(&self) -> &MessengerNode {
        &self.node
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let Self {
            config,
            node,
            mut events,
            history,
        } = self;

        let listen_port = node.listen(config.node.listen_port).await?;
        console::display_system(&format!(
            "node {} listening on port {}",
            node.local_id(),
            listen_port
        ));

        if config.network.enable_discovery {
            let discovery =
                PeerDiscovery::new(node.clone(), config.network.discovery_port, listen_port);
            if let Err(e) = discovery.spawn().await {
                warn!("peer discovery disabled: {}", e);
            }
        }

        for (host, port) in config.bootstrap_peers()? {
            match node.connect(&host, port).await {
                Ok(peer_id) => info!("connected to bootstrap peer {} at {}:{}", peer_id, host, port),
                Err(e) => warn!("failed to connect to bootstrap {}:{}: {}", host, port, e),
            }
        }

        let reconnect = spawn_reconnect_logger();

        // Peer events drive connection notices and the reconnection policy.
        {
            let node = node.clone();
            let reconnect = Arc::clone(&reconnect);
            let shutdown = node.shutdown_signal();
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    match event {
                        PeerEvent::Connected(summary) => console::display_system(&format!(
                            "peer {} connected ({}:{})",
                            summary.id, summary.address, summary.port
                        )),
                        PeerEvent::Disconnected(summary) => {
                            console::display_system(&format!("peer {} disconnected", summary.id));
                            let dialable = node.known_peer_addr(&summary.id).is_some();
                            if dialable && !*shutdown.borrow() {
                                let node = node.clone();
                                let reconnect = Arc::clone(&reconnect);
                                tokio::spawn(async move {
                                    reconnect.try_reconnect(&node, &summary.id).await;
                                });
                            }
                        }
                        // Inbound messages are displayed by the queue consumer.
                        PeerEvent::MessageReceived { .. } => {}
                    }
                }
            });
        }

        // Processing loop: display and persist every accepted inbound message.
        {
            let queue = node.queue().clone();
            let history = Arc::clone(&history);
            tokio::spawn(async move {
                while let Some(message) = queue.dequeue_incoming().await {
                    console::display_message(&message);
                    if let Err(e) = history.save(&message) {
                        warn!("failed to persist message: {}", e);
                    }
                }
            });
        }

        console::display_system("type /help for available commands");

        let stdin = BufReader::new(tokio::io::stdin());
        let mut lines = stdin.lines();
        while let Some(line) = lines.next_line().await? {
            let Some(command) = console::parse_command(&line) else {
                continue;
            };
            match command {
                Command::Connect { host, port } => match node.connect(&host, port).await {
                    Ok(peer_id) => {
                        console::display_system(&format!("connected to peer {}", peer_id))
                    }
                    Err(e) => console::display_system(&format!("connect failed: {}", e)),
                },
                Command::Listen { port } => match node.listen(port).await {
                    Ok(port) => {
                        console::display_system(&format!("also listening on port {}", port))
                    }
                    Err(e) => console::display_system(&format!("listen failed: {}", e)),
                },
                Command::ListPeers => {
                    let peers = node.list_peers().await;
                    if peers.is_empty() {
                        console::display_system("no peers connected");
                    }
                    for peer in peers {
                        console::display_system(&peer.to_string());
                    }
                }
                Command::History => {
                    for message in history.recent(config.history.display_limit) {
                        console::display_message(&message);
                    }
                }
                Command::Help => console::show_help(),
                Command::Quit => break,
                Command::Say(text) => {
                    let message = Message::plain(config.node.display_name.clone(), text);
                    if let Err(e) = node.queue().enqueue_outgoing(message) {
                        console::display_system(&format!("cannot send: {}", e));
                    }
                }
                Command::Unknown(reason) => {
                    console::display_system(&reason);
                    console::display_system("type /help for available commands");
                }
            }
        }

        console::display_system("shutting down");
        node.shutdown().await;
        Ok(())
    }
}

fn spawn_reconnect_logger() -> Arc<ReconnectPolicy> {
    let (reconnect_tx, mut reconnect_rx) = mpsc::unbounded_channel();
    let reconnect = Arc::new(ReconnectPolicy::new(reconnect_tx));
    tokio::spawn(async move {
        while let Some(event) = reconnect_rx.recv().await {
            match event {
                ReconnectEvent::Attempt(peer_id, attempt) => {
                    info!("reconnect attempt {} for peer {}", attempt, peer_id)
                }
                ReconnectEvent::Success(peer_id) => {
                    console::display_system(&format!("reconnected to peer {}", peer_id))
                }
                ReconnectEvent::Failed(peer_id) => {
                    console::display_system(&format!("giving up on peer {}", peer_id))
                }
            }
        }
    });
    reconnect
}
