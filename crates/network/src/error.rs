//! Error types for the peer session layer.

use messenger_crypto::CryptoError;
use messenger_types::{PeerId, SessionState};
use std::io;
use thiserror::Error;

/// Errors produced while reading or writing one wire frame. Fatal to the
/// affected peer's read loop, never to the process.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The stream closed cleanly on a frame boundary.
    #[error("stream closed")]
    Closed,

    /// The stream closed with a partial frame on the wire.
    #[error("stream closed mid-frame")]
    Truncated,

    /// Declared length exceeds the allocation cap.
    #[error("declared frame length {len} exceeds maximum {max}")]
    Oversized { len: u32, max: u32 },

    /// A frame cannot be empty.
    #[error("frame declared a zero-length payload")]
    Empty,

    /// Payload was not valid JSON for the envelope schema.
    #[error("malformed frame payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("frame I/O failed: {0}")]
    Io(#[from] io::Error),
}

/// Errors during session establishment. Always fail closed: the socket is
/// dropped and the peer is never registered.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("unexpected {frame} frame in state {state}")]
    UnexpectedFrame {
        state: SessionState,
        frame: &'static str,
    },

    #[error("peer closed the connection during the handshake")]
    PeerClosed,

    #[error("handshake did not complete within the deadline")]
    Timeout,

    #[error("bad key material: {0}")]
    BadKeyMaterial(#[from] CryptoError),

    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Errors that can occur during network operations.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Failed to reach a peer (refused, unreachable, DNS failure).
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Connection attempt did not complete in time.
    #[error("connection attempt to {addr} timed out")]
    ConnectTimeout { addr: String },

    /// Listener bind failed. Fatal to startup.
    #[error("failed to bind listener on {addr}: {source}")]
    BindFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Session establishment with a peer failed.
    #[error("handshake with {addr} failed: {source}")]
    Handshake {
        addr: String,
        #[source]
        source: HandshakeError,
    },

    /// Peer not found in the registry.
    #[error("peer {peer_id} not found in registry")]
    PeerNotFound { peer_id: PeerId },

    /// The peer's writer is gone; the connection is being torn down.
    #[error("send to peer {peer_id} failed: connection closed")]
    SendFailed { peer_id: PeerId },

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Enqueue after shutdown.
    #[error("message queue is closed")]
    QueueClosed,

    /// The node is shutting down and accepts no new work.
    #[error("node is shutting down")]
    Shutdown,
}

/// Result type for network operations.
pub type NetworkResult<T> = Result<T, NetworkError>;
