//! Per-connection key exchange.
//!
//! Protocol: both sides announce their RSA-2048 public key as soon as the
//! socket opens (the exchange is order-independent). The side that opened
//! the outbound connection is always the initiator; it generates the AES-256
//! session key, wraps it with OAEP/SHA-256 under the responder's announced
//! key, sends it, and is established. The responder unwraps with its private
//! key and is established. Nothing about the session key ever crosses the
//! wire in cleartext.
//!
//! Any out-of-state frame, unparseable key, or failed unwrap aborts the
//! exchange; the caller closes the socket and the peer is never registered.

use std::sync::Arc;
use std::time::Duration;

use messenger_crypto::{RsaKeyPair, SESSION_KEY_LEN};
use messenger_types::{PeerId, SessionState};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::codec::{read_frame, write_frame};
use crate::error::{FrameError, HandshakeError};
use crate::wire::{Envelope, PublicKeyAnnounce, SessionKeyExchange};

/// Upper bound on the whole exchange.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The side that opened the outbound connection; sends the session key.
    Initiator,
    /// The accepting side; receives the session key.
    Responder,
}

/// Everything the registry needs to record an established peer.
pub struct SessionOutcome {
    pub peer_id: PeerId,
    pub peer_public_key: Vec<u8>,
    pub session_key: [u8; SESSION_KEY_LEN],
}

/// The handshake state machine, kept free of socket I/O so the transitions
/// can be exercised directly.
pub struct Handshake {
    state: SessionState,
    role: Role,
    local_id: PeerId,
    keys: Arc<RsaKeyPair>,
    peer_id: Option<PeerId>,
    peer_public_key: Option<Vec<u8>>,
    session_key: Option<[u8; SESSION_KEY_LEN]>,
}

impl Handshake {
    pub fn new(local_id: PeerId, keys: Arc<RsaKeyPair>, role: Role) -> Self {
        Self {
            state: SessionState::Disconnected,
            role,
            local_id,
            keys,
            peer_id: None,
            peer_public_key: None,
            session_key: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Produce our public-key announcement. Valid exactly once, at the start.
    pub fn announce(&mut self) -> Result<Envelope, HandshakeError> {
        if self.state != SessionState::Disconnected {
            return Err(self.fail("public_key"));
        }
        self.state = SessionState::SendingPublicKey;
        let key = self.keys.public_key_der()?;
        Ok(Envelope::PublicKey(PublicKeyAnnounce {
            sender: self.local_id.clone(),
            key,
        }))
    }

    /// The announcement reached the wire; wait for the counterpart's key.
    pub fn announce_sent(&mut self) {
        if self.state == SessionState::SendingPublicKey {
            self.state = SessionState::AwaitingPeerKey;
        }
    }

    /// Accept the peer's public key. The exchange is bidirectional and
    /// concurrent, so this is valid whether or not our own announcement has
    /// gone out yet - but never after keys are already exchanged.
    pub fn on_public_key(&mut self, announce: PublicKeyAnnounce) -> Result<(), HandshakeError> {
        match self.state {
            SessionState::Disconnected
            | SessionState::SendingPublicKey
            | SessionState::AwaitingPeerKey => {
                self.peer_id = Some(announce.sender);
                self.peer_public_key = Some(announce.key);
                self.state = SessionState::AwaitingSessionKey;
                Ok(())
            }
            _ => Err(self.fail("public_key")),
        }
    }

    /// Initiator only: generate the session key, wrap it for the peer, and
    /// become established.
    pub fn wrap_session_key(&mut self) -> Result<Envelope, HandshakeError> {
        if self.role != Role::Initiator || self.state != SessionState::AwaitingSessionKey {
            return Err(self.fail("session_key"));
        }
        let peer_key = self
            .peer_public_key
            .as_deref()
            .expect("peer key present in AwaitingSessionKey");

        let session_key = messenger_crypto::SessionCipher::generate_key();
        let wrapped = match self.keys.encrypt_session_key(&session_key, peer_key) {
            Ok(wrapped) => wrapped,
            Err(e) => {
                self.state = SessionState::Disconnected;
                return Err(HandshakeError::BadKeyMaterial(e));
            }
        };

        self.session_key = Some(session_key);
        self.state = SessionState::Established;
        Ok(Envelope::SessionKey(SessionKeyExchange {
            sender: self.local_id.clone(),
            wrapped_key: wrapped,
        }))
    }

    /// Responder only: unwrap the session key and become established.
    pub fn on_session_key(&mut self, exchange: SessionKeyExchange) -> Result<(), HandshakeError> {
        if self.role != Role::Responder || self.state != SessionState::AwaitingSessionKey {
            return Err(self.fail("session_key"));
        }

        let unwrapped = match self.keys.decrypt_session_key(&exchange.wrapped_key) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.state = SessionState::Disconnected;
                return Err(HandshakeError::BadKeyMaterial(e));
            }
        };
        let session_key: [u8; SESSION_KEY_LEN] = match unwrapped.as_slice().try_into() {
            Ok(key) => key,
            Err(_) => {
                self.state = SessionState::Disconnected;
                return Err(HandshakeError::BadKeyMaterial(
                    messenger_crypto::CryptoError::InvalidKey(format!(
                        "session key must be {} bytes, got {}",
                        SESSION_KEY_LEN,
                        unwrapped.len()
                    )),
                ));
            }
        };

        self.session_key = Some(session_key);
        self.state = SessionState::Established;
        Ok(())
    }

    /// Consume the machine once established.
    pub fn into_outcome(self) -> Result<SessionOutcome, HandshakeError> {
        if self.state != SessionState::Established {
            return Err(HandshakeError::UnexpectedFrame {
                state: self.state,
                frame: "none",
            });
        }
        Ok(SessionOutcome {
            peer_id: self.peer_id.expect("peer id recorded before establishment"),
            peer_public_key: self
                .peer_public_key
                .expect("peer key recorded before establishment"),
            session_key: self.session_key.expect("session key set on establishment"),
        })
    }

    fn fail(&mut self, frame: &'static str) -> HandshakeError {
        let state = self.state;
        self.state = SessionState::Disconnected;
        HandshakeError::UnexpectedFrame { state, frame }
    }
}

/// Drive the state machine over a socket until both sides are established.
/// The caller is expected to wrap this in a timeout and to close the socket
/// on any error.
pub async fn run_handshake<S>(
    stream: &mut S,
    local_id: PeerId,
    keys: Arc<RsaKeyPair>,
    role: Role,
) -> Result<SessionOutcome, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut handshake = Handshake::new(local_id, keys, role);

    // Both sides announce first; the frames cross on the wire.
    let announce = handshake.announce()?;
    write_frame(stream, &announce).await?;
    handshake.announce_sent();

    loop {
        match handshake.state() {
            SessionState::Established => return handshake.into_outcome(),
            SessionState::AwaitingSessionKey if role == Role::Initiator => {
                let exchange = handshake.wrap_session_key()?;
                write_frame(stream, &exchange).await?;
            }
            _ => match read_next(stream).await? {
                Envelope::PublicKey(announce) => {
                    debug!("received public key from {}", announce.sender);
                    handshake.on_public_key(announce)?;
                }
                Envelope::SessionKey(exchange) => handshake.on_session_key(exchange)?,
                other => {
                    return Err(HandshakeError::UnexpectedFrame {
                        state: handshake.state(),
                        frame: other.kind(),
                    })
                }
            },
        }
    }
}

async fn read_next<S>(stream: &mut S) -> Result<Envelope, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match read_frame(stream).await {
        Ok(envelope) => Ok(envelope),
        Err(FrameError::Closed | FrameError::Truncated) => Err(HandshakeError::PeerClosed),
        Err(e) => Err(HandshakeError::Frame(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::OnceLock;

    fn keys() -> Arc<RsaKeyPair> {
        static KEYS: OnceLock<Arc<RsaKeyPair>> = OnceLock::new();
        Arc::clone(KEYS.get_or_init(|| Arc::new(RsaKeyPair::generate().unwrap())))
    }

    fn other_keys() -> Arc<RsaKeyPair> {
        static KEYS: OnceLock<Arc<RsaKeyPair>> = OnceLock::new();
        Arc::clone(KEYS.get_or_init(|| Arc::new(RsaKeyPair::generate().unwrap())))
    }

    #[test]
    fn test_state_machine_happy_path_initiator() {
        let mut hs = Handshake::new(PeerId::from("init0001"), keys(), Role::Initiator);
        assert_eq!(hs.state(), SessionState::Disconnected);

        hs.announce().unwrap();
        assert_eq!(hs.state(), SessionState::SendingPublicKey);
        hs.announce_sent();
        assert_eq!(hs.state(), SessionState::AwaitingPeerKey);

        hs.on_public_key(PublicKeyAnnounce {
            sender: PeerId::from("resp0001"),
            key: other_keys().public_key_der().unwrap(),
        })
        .unwrap();
        assert_eq!(hs.state(), SessionState::AwaitingSessionKey);

        hs.wrap_session_key().unwrap();
        assert_eq!(hs.state(), SessionState::Established);

        let outcome = hs.into_outcome().unwrap();
        assert_eq!(outcome.peer_id, PeerId::from("resp0001"));
    }

    #[test]
    fn test_peer_key_accepted_before_local_announce() {
        // Concurrent exchange: the peer's key can arrive before ours is out.
        let mut hs = Handshake::new(PeerId::from("resp0001"), keys(), Role::Responder);
        hs.on_public_key(PublicKeyAnnounce {
            sender: PeerId::from("init0001"),
            key: other_keys().public_key_der().unwrap(),
        })
        .unwrap();
        assert_eq!(hs.state(), SessionState::AwaitingSessionKey);
    }

    #[test]
    fn test_out_of_state_frames_fail_closed() {
        // A session key before any public key exchange.
        let mut hs = Handshake::new(PeerId::from("resp0001"), keys(), Role::Responder);
        let err = hs
            .on_session_key(SessionKeyExchange {
                sender: PeerId::from("init0001"),
                wrapped_key: vec![0u8; 256],
            })
            .unwrap_err();
        assert!(matches!(err, HandshakeError::UnexpectedFrame { .. }));
        assert_eq!(hs.state(), SessionState::Disconnected);

        // A duplicate public key after establishment.
        let mut hs = Handshake::new(PeerId::from("init0001"), keys(), Role::Initiator);
        hs.announce().unwrap();
        hs.announce_sent();
        let peer_key = PublicKeyAnnounce {
            sender: PeerId::from("resp0001"),
            key: other_keys().public_key_der().unwrap(),
        };
        hs.on_public_key(peer_key.clone()).unwrap();
        hs.wrap_session_key().unwrap();
        assert!(hs.on_public_key(peer_key).is_err());
        assert_eq!(hs.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_initiator_never_accepts_a_session_key() {
        let mut hs = Handshake::new(PeerId::from("init0001"), keys(), Role::Initiator);
        hs.announce().unwrap();
        hs.announce_sent();
        hs.on_public_key(PublicKeyAnnounce {
            sender: PeerId::from("resp0001"),
            key: other_keys().public_key_der().unwrap(),
        })
        .unwrap();

        let err = hs
            .on_session_key(SessionKeyExchange {
                sender: PeerId::from("resp0001"),
                wrapped_key: vec![0u8; 256],
            })
            .unwrap_err();
        assert!(matches!(err, HandshakeError::UnexpectedFrame { .. }));
    }

    #[test]
    fn test_garbage_wrapped_key_fails_closed() {
        let mut hs = Handshake::new(PeerId::from("resp0001"), keys(), Role::Responder);
        hs.announce().unwrap();
        hs.announce_sent();
        hs.on_public_key(PublicKeyAnnounce {
            sender: PeerId::from("init0001"),
            key: other_keys().public_key_der().unwrap(),
        })
        .unwrap();

        let err = hs
            .on_session_key(SessionKeyExchange {
                sender: PeerId::from("init0001"),
                wrapped_key: vec![0xAB; 256],
            })
            .unwrap_err();
        assert!(matches!(err, HandshakeError::BadKeyMaterial(_)));
        assert_eq!(hs.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_both_sides_derive_the_same_key_over_a_socket() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);

        let initiator = tokio::spawn(async move {
            run_handshake(
                &mut client,
                PeerId::from("init0001"),
                keys(),
                Role::Initiator,
            )
            .await
        });
        let responder = tokio::spawn(async move {
            run_handshake(
                &mut server,
                PeerId::from("resp0001"),
                other_keys(),
                Role::Responder,
            )
            .await
        });

        let initiated = initiator.await.unwrap().unwrap();
        let responded = responder.await.unwrap().unwrap();

        assert_eq!(initiated.session_key, responded.session_key);
        assert_eq!(initiated.peer_id, PeerId::from("resp0001"));
        assert_eq!(responded.peer_id, PeerId::from("init0001"));
    }

    #[tokio::test]
    async fn test_session_key_never_crosses_in_cleartext() {
        // Run the initiator against a scripted responder and capture the raw
        // bytes it sends.
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);

        let initiator = tokio::spawn(async move {
            run_handshake(
                &mut client,
                PeerId::from("init0001"),
                keys(),
                Role::Initiator,
            )
            .await
        });

        let responder_keys = other_keys();
        let announce = Envelope::PublicKey(PublicKeyAnnounce {
            sender: PeerId::from("resp0001"),
            key: responder_keys.public_key_der().unwrap(),
        });
        write_frame(&mut server, &announce).await.unwrap();

        // The initiator's announcement, then its wrapped session key.
        let _their_announce = read_frame(&mut server).await.unwrap();
        let exchange = match read_frame(&mut server).await.unwrap() {
            Envelope::SessionKey(exchange) => exchange,
            other => panic!("expected session key frame, got {}", other.kind()),
        };

        let outcome = initiator.await.unwrap().unwrap();
        let key = outcome.session_key;

        // The wrapped blob must not contain the key bytes.
        assert!(!exchange
            .wrapped_key
            .windows(key.len())
            .any(|window| window == key));

        // And the responder's private key recovers exactly it.
        let unwrapped = responder_keys.decrypt_session_key(&exchange.wrapped_key).unwrap();
        assert_eq!(unwrapped.as_slice(), key.as_slice());
    }
}
