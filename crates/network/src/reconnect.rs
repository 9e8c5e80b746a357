//! Exponential-backoff reconnection.
//!
//! The backoff math lives in [`delay_for`] as a pure function; the driver
//! only performs the suspensions, so the schedule can be tested without real
//! time passing. One attempt sequence runs per peer at a time.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use messenger_types::PeerId;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::node::MessengerNode;

/// Attempts per reconnection sequence before giving up.
pub const MAX_ATTEMPTS: u32 = 5;

const INITIAL_DELAY: Duration = Duration::from_millis(1000);
const MAX_DELAY: Duration = Duration::from_millis(30_000);

/// Delay before attempt `n`: the first attempt is immediate, every following
/// attempt doubles the wait, capped at 30 seconds.
pub fn delay_for(attempt: u32) -> Duration {
    if attempt <= 1 {
        return Duration::ZERO;
    }
    let doublings = attempt - 2;
    INITIAL_DELAY
        .checked_mul(1u32 << doublings.min(31))
        .map_or(MAX_DELAY, |delay| delay.min(MAX_DELAY))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectEvent {
    Attempt(PeerId, u32),
    Success(PeerId),
    Failed(PeerId),
}

#[derive(Default)]
struct RetryState {
    attempts: u32,
    in_flight: bool,
}

pub struct ReconnectPolicy {
    state: Mutex<HashMap<PeerId, RetryState>>,
    event_tx: mpsc::UnboundedSender<ReconnectEvent>,
}

impl ReconnectPolicy {
    pub fn new(event_tx: mpsc::UnboundedSender<ReconnectEvent>) -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
            event_tx,
        }
    }

    /// Attempts for a peer so far: 0 if never tried, [`MAX_ATTEMPTS`] if the
    /// last sequence ran to exhaustion.
    pub fn attempt_count(&self, peer_id: &PeerId) -> u32 {
        let state = self.state.lock().expect("reconnect lock poisoned");
        state.get(peer_id).map_or(0, |retry| retry.attempts)
    }

    /// Drive one full reconnection sequence for a peer whose outbound
    /// connection dropped. Returns true once a connection is re-established.
    ///
    /// If a sequence for this peer is already in flight, or the peer has no
    /// recorded address, returns false immediately. The inter-attempt delay
    /// is cancelled by node shutdown.
    pub async fn try_reconnect(&self, node: &MessengerNode, peer_id: &PeerId) -> bool {
        let Some((host, port)) = node.known_peer_addr(peer_id) else {
            warn!("no recorded address for peer {}, cannot reconnect", peer_id);
            return false;
        };

        if !self.begin(peer_id) {
            return false;
        }

        let mut shutdown = node.shutdown_signal();
        for attempt in 1..=MAX_ATTEMPTS {
            self.record_attempt(peer_id, attempt);
            let _ = self
                .event_tx
                .send(ReconnectEvent::Attempt(peer_id.clone(), attempt));

            let delay = delay_for(attempt);
            if !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            self.finish(peer_id, false);
                            return false;
                        }
                    }
                }
            }

            info!(
                "reconnect attempt {}/{} to peer {} at {}:{}",
                attempt, MAX_ATTEMPTS, peer_id, host, port
            );
            match node.connect(&host, port).await {
                Ok(new_id) => {
                    info!("reconnected to {}:{} as peer {}", host, port, new_id);
                    self.reset(peer_id);
                    let _ = self.event_tx.send(ReconnectEvent::Success(peer_id.clone()));
                    return true;
                }
                Err(e) => {
                    warn!("reconnect attempt {} to {} failed: {}", attempt, peer_id, e);
                }
            }
        }

        // Leave the counter at its ceiling so callers can tell an exhausted
        // sequence from one that never ran.
        self.finish(peer_id, true);
        let _ = self.event_tx.send(ReconnectEvent::Failed(peer_id.clone()));
        false
    }

    /// Clear a peer's attempt counter after a successful connection.
    pub fn reset(&self, peer_id: &PeerId) {
        let mut state = self.state.lock().expect("reconnect lock poisoned");
        state.remove(peer_id);
    }

    fn begin(&self, peer_id: &PeerId) -> bool {
        let mut state = self.state.lock().expect("reconnect lock poisoned");
        let retry = state.entry(peer_id.clone()).or_default();
        if retry.in_flight {
            return false;
        }
        retry.in_flight = true;
        retry.attempts = 0;
        true
    }

    fn record_attempt(&self, peer_id: &PeerId, attempt: u32) {
        let mut state = self.state.lock().expect("reconnect lock poisoned");
        if let Some(retry) = state.get_mut(peer_id) {
            retry.attempts = attempt;
        }
    }

    fn finish(&self, peer_id: &PeerId, exhausted: bool) {
        let mut state = self.state.lock().expect("reconnect lock poisoned");
        if let Some(retry) = state.get_mut(peer_id) {
            retry.in_flight = false;
            if exhausted {
                retry.attempts = MAX_ATTEMPTS;
            }
        }
    }
}
