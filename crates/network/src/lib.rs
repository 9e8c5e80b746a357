pub mod codec;
pub mod discovery;
pub mod error;
pub mod handshake;
pub mod heartbeat;
pub mod node;
pub mod queue;
pub mod reconnect;
pub mod wire;

pub use discovery::PeerDiscovery;
pub use error::{FrameError, HandshakeError, NetworkError, NetworkResult};
pub use heartbeat::{HeartbeatEvent, HeartbeatMonitor};
pub use node::{MessengerNode, PeerEvent};
pub use queue::MessageQueue;
pub use reconnect::{ReconnectEvent, ReconnectPolicy};
pub use wire::Envelope;
