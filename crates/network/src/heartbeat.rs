//! Per-peer liveness tracking.
//!
//! Peers send a heartbeat frame every [`HEARTBEAT_INTERVAL`]; a peer silent
//! for longer than [`HEARTBEAT_TIMEOUT`] is reported failed by a background
//! sweep that runs every second. The check-and-remove in the sweep happens
//! under the same lock acquisition that `record_heartbeat` takes, so a
//! heartbeat racing a timeout can never leave a peer half-removed.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use messenger_types::PeerId;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// How often every peer is expected to announce liveness.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Silence longer than this marks a peer failed.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(15);

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatEvent {
    Received(PeerId),
    /// The peer exceeded the timeout and has been dropped from monitoring.
    Failed(PeerId),
}

pub struct HeartbeatMonitor {
    last_seen: Mutex<HashMap<PeerId, Instant>>,
    event_tx: mpsc::UnboundedSender<HeartbeatEvent>,
}

impl HeartbeatMonitor {
    pub fn new(event_tx: mpsc::UnboundedSender<HeartbeatEvent>) -> Self {
        Self {
            last_seen: Mutex::new(HashMap::new()),
            event_tx,
        }
    }

    /// Begin tracking a peer, seeding its last-seen time with now.
    pub fn start_monitoring(&self, peer_id: PeerId) {
        let mut last_seen = self.last_seen.lock().expect("heartbeat lock poisoned");
        last_seen.insert(peer_id, Instant::now());
    }

    /// Record a heartbeat. Only refreshes peers still under monitoring; a
    /// heartbeat from a peer already timed out does not resurrect it.
    pub fn record_heartbeat(&self, peer_id: &PeerId) {
        let refreshed = {
            let mut last_seen = self.last_seen.lock().expect("heartbeat lock poisoned");
            match last_seen.get_mut(peer_id) {
                Some(seen) => {
                    *seen = Instant::now();
                    true
                }
                None => false,
            }
        };
        if refreshed {
            let _ = self.event_tx.send(HeartbeatEvent::Received(peer_id.clone()));
        }
    }

    pub fn stop_monitoring(&self, peer_id: &PeerId) {
        let mut last_seen = self.last_seen.lock().expect("heartbeat lock poisoned");
        last_seen.remove(peer_id);
    }

    pub fn is_alive(&self, peer_id: &PeerId) -> bool {
        let last_seen = self.last_seen.lock().expect("heartbeat lock poisoned");
        last_seen
            .get(peer_id)
            .is_some_and(|seen| seen.elapsed() < HEARTBEAT_TIMEOUT)
    }

    /// One pass over every tracked peer: remove and return the timed-out
    /// ones. Removal happens under the same lock as the staleness check.
    fn sweep(&self) -> Vec<PeerId> {
        let mut last_seen = self.last_seen.lock().expect("heartbeat lock poisoned");
        let expired: Vec<PeerId> = last_seen
            .iter()
            .filter(|(_, seen)| seen.elapsed() > HEARTBEAT_TIMEOUT)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            last_seen.remove(id);
        }
        expired
    }

    /// Run the sweep loop until the shutdown signal flips.
    pub fn spawn(
        self: std::sync::Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for peer_id in self.sweep() {
                            warn!("peer {} missed heartbeats for over {:?}", peer_id, HEARTBEAT_TIMEOUT);
                            let _ = self.event_tx.send(HeartbeatEvent::Failed(peer_id));
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            debug!("heartbeat sweep stopping");
                            break;
                        }
                    }
                }
            }
        })
    }
}
