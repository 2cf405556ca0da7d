//! Network + Transport Layer
//!
//! Wire frames, stream framing, datagram fragmentation, and the transport
//! abstractions used by the messenger engine.
//!
//! # Architecture
//!
//! - **Wire frames** (`message`): the `{type, payload}` records exchanged
//!   with the relay and directly between peers
//! - **Framing** (`framing`): newline-delimited JSON with partial-read
//!   buffering for the reliable stream
//! - **Fragmentation** (`fragment`): splitting and reassembling datagrams
//!   that exceed the safe single-packet size
//! - **Transports**: `RelayTransport` (reliable stream to the server) and
//!   `PeerTransport` (datagram socket for direct traffic), with TCP/UDP
//!   implementations and scriptable mocks

mod error;
mod fragment;
mod framing;
mod message;
mod mock;
mod tcp;
mod transport;
mod udp;

pub use error::NetworkError;
pub use fragment::{split_frame, FragmentAssembler, FragmentLimits};
pub use framing::{decode_frame, encode_frame, LineDecoder, MAX_LINE_BYTES};
pub use message::{
    unix_timestamp, CipherEnvelope, ClientFrame, FriendInfo, HandshakeStep, PayloadKind,
    PeerFrame, PresenceStatus, ResponseAction, ResponseStatus, ServerFrame, WireMode,
};
pub use mock::{MockPeerTransport, MockRelayTransport};
pub use tcp::TcpRelayTransport;
pub use transport::{
    ConnectionState, PeerTransport, RelayTransport, TransportConfig, TransportResult,
};
pub use udp::UdpPeerTransport;
