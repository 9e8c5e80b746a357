//! Wire envelope: every frame payload is one of these, distinguished by a
//! `type` tag in the JSON.

use messenger_types::{Message, PeerId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// First handshake frame: announce identity and RSA public key.
    PublicKey(PublicKeyAnnounce),
    /// Second handshake frame (initiator only): the wrapped session key.
    SessionKey(SessionKeyExchange),
    /// Periodic liveness signal.
    Heartbeat { sender: PeerId },
    /// An application message.
    Chat(Message),
}

impl Envelope {
    /// Frame kind for logs and error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::PublicKey(_) => "public_key",
            Envelope::SessionKey(_) => "session_key",
            Envelope::Heartbeat { .. } => "heartbeat",
            Envelope::Chat(_) => "chat",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicKeyAnnounce {
    pub sender: PeerId,
    /// PKCS#1 DER encoding of the announcing side's RSA public key.
    pub key: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionKeyExchange {
    pub sender: PeerId,
    /// AES-256 session key, OAEP-encrypted under the receiver's public key.
    pub wrapped_key: Vec<u8>,
}
