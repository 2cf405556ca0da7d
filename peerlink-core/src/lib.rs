//! Peerlink Core Library
//!
//! End-to-end encrypted messaging between two identities, either relayed
//! through a central server ("CS" mode) or sent directly over UDP ("P2P"
//! mode), with runtime mode switching by mutual consent.
//!
//! All payload encryption uses AES-256-GCM via the audited `ring` crate;
//! session keys are wrapped for the peer's long-term X25519 key.

pub mod api;
pub mod crypto;
pub mod network;
pub mod session;

pub use api::{
    CallbackHandler, ClientConfig, ClientError, ClientEvent, ClientResult, EventHandler,
    MessageContent, Messenger,
};
pub use crypto::{IdentityKeyPair, SessionKey};
pub use network::{
    CipherEnvelope, ClientFrame, ConnectionState, FriendInfo, HandshakeStep, MockPeerTransport,
    MockRelayTransport, NetworkError, PayloadKind, PeerFrame, PeerTransport, PresenceStatus,
    RelayTransport, ResponseAction, ResponseStatus, ServerFrame, TcpRelayTransport,
    TransportConfig, UdpPeerTransport, WireMode,
};
pub use session::{ChatMode, HandshakePhase, KeyError, PeerSessions, SessionKeyManager};
