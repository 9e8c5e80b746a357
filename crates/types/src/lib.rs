use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum MessengerError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("History error: {0}")]
    HistoryError(String),

    #[error("Network error: {0}")]
    NetworkError(String),
}

/// Short opaque peer identifier, stable for the lifetime of a connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct PeerId(pub String);

impl PeerId {
    /// Generate a fresh 8-character identifier.
    pub fn random() -> Self {
        PeerId(Uuid::new_v4().simple().to_string()[..8].to_string())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        PeerId(s)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        PeerId(s.to_string())
    }
}

/// Message payload. A message is either plaintext-signed or carries an
/// AES-encrypted blob, never both.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageBody {
    Plain(String),
    Encrypted(Vec<u8>),
}

impl MessageBody {
    /// Raw payload bytes, the input to signing.
    pub fn payload_bytes(&self) -> &[u8] {
        match self {
            MessageBody::Plain(text) => text.as_bytes(),
            MessageBody::Encrypted(blob) => blob,
        }
    }
}

/// A chat message as exchanged on the wire and surfaced to consumers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: Uuid,
    pub sender: String,
    pub body: MessageBody,
    pub timestamp: DateTime<Utc>,
    pub signature: Option<Vec<u8>>,
}

impl Message {
    pub fn plain(sender: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender: sender.into(),
            body: MessageBody::Plain(content.into()),
            timestamp: Utc::now(),
            signature: None,
        }
    }

    /// The bytes covered by the signature: identity fields plus payload, so
    /// tampering with any of them invalidates the signature.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(self.id.as_bytes());
        bytes.extend_from_slice(self.sender.as_bytes());
        bytes.push(b'|');
        bytes.extend_from_slice(self.body.payload_bytes());
        bytes
    }

    pub fn content(&self) -> Option<&str> {
        match &self.body {
            MessageBody::Plain(text) => Some(text),
            MessageBody::Encrypted(_) => None,
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.body {
            MessageBody::Plain(text) => {
                write!(f, "[{}] {}: {}", self.timestamp.format("%H:%M:%S"), self.sender, text)
            }
            MessageBody::Encrypted(_) => {
                write!(f, "[{}] {}: <encrypted>", self.timestamp.format("%H:%M:%S"), self.sender)
            }
        }
    }
}

/// Handshake progress for one peer session. `Disconnected` is reachable from
/// every state; all other transitions are one-directional.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    SendingPublicKey,
    AwaitingPeerKey,
    AwaitingSessionKey,
    Established,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "disconnected"),
            SessionState::SendingPublicKey => write!(f, "sending_public_key"),
            SessionState::AwaitingPeerKey => write!(f, "awaiting_peer_key"),
            SessionState::AwaitingSessionKey => write!(f, "awaiting_session_key"),
            SessionState::Established => write!(f, "established"),
        }
    }
}

/// Snapshot of a registered peer, safe to hand to other components. Holds no
/// socket handle; callers go back through the registry by ID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSummary {
    pub id: PeerId,
    pub address: IpAddr,
    pub port: u16,
    pub state: SessionState,
    pub connected_at: DateTime<Utc>,
}

impl fmt::Display for PeerSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{}) - {}", self.id, self.address, self.port, self.state)
    }
}

pub type Result<T> = std::result::Result<T, MessengerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_is_short_and_unique() {
        let a = PeerId::random();
        let b = PeerId::random();
        assert_eq!(a.0.len(), 8);
        assert_ne!(a, b);
    }

    #[test]
    fn test_message_body_is_exclusive_on_the_wire() {
        let plain = Message::plain("alice", "hi");
        let json = serde_json::to_value(&plain).unwrap();
        assert_eq!(json["body"]["plain"], "hi");
        assert!(json["body"].get("encrypted").is_none());
    }

    #[test]
    fn test_signing_bytes_cover_sender_and_payload() {
        let mut msg = Message::plain("alice", "hi");
        let original = msg.signing_bytes();

        msg.sender = "mallory".to_string();
        assert_ne!(original, msg.signing_bytes());

        msg.sender = "alice".to_string();
        msg.body = MessageBody::Plain("bye".to_string());
        assert_ne!(original, msg.signing_bytes());
    }
}
