//! Session State
//!
//! Two registries, one per concern: [`PeerSessions`] tracks the transport
//! mode and handshake progress for each remote identity, while
//! [`SessionKeyManager`] owns the symmetric keys and the buffer of
//! ciphertexts that arrived before their key did. The engine ties their
//! lifecycles together.

pub mod keys;
pub mod peer;

pub use keys::{InboundPayload, KeyError, SessionKeyManager};
pub use peer::{ChatMode, HandshakePhase, HandshakeState, PeerSession, PeerSessions};
