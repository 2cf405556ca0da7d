//! Transport Traits
//!
//! The engine is written against two seams: a reliable stream to the relay
//! server and an unreliable datagram socket for direct peer traffic. Both
//! are polled; `receive` returns `Ok(None)` when nothing complete is
//! available yet, so callers can drive several transports from one loop
//! without threads.

use std::net::SocketAddr;

use super::error::NetworkError;
use super::message::{ClientFrame, PeerFrame, ServerFrame};

pub type TransportResult<T> = Result<T, NetworkError>;

/// Connection state of the reliable relay stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Socket-level settings shared by both transports.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Relay server address (`host:port`).
    pub server_addr: String,
    /// UDP port to bind for direct peer traffic (0 picks an ephemeral port).
    pub p2p_bind_port: u16,
    /// Stream connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Poll timeout for non-blocking receives in milliseconds.
    pub read_timeout_ms: u64,
    /// Serialized datagrams above this size are fragmented.
    pub max_datagram_bytes: usize,
    /// Raw bytes carried per fragment before base64 expansion.
    pub fragment_chunk_bytes: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            server_addr: "127.0.0.1:7600".to_string(),
            p2p_bind_port: 0,
            connect_timeout_ms: 10_000,
            read_timeout_ms: 50,
            max_datagram_bytes: 4096,
            fragment_chunk_bytes: 2048,
        }
    }
}

/// Reliable ordered stream to the relay server.
pub trait RelayTransport: Send {
    fn connect(&mut self, config: &TransportConfig) -> TransportResult<()>;

    fn disconnect(&mut self) -> TransportResult<()>;

    fn state(&self) -> ConnectionState;

    fn send(&mut self, frame: &ClientFrame) -> TransportResult<()>;

    /// Next complete server frame, or `Ok(None)` when none has fully
    /// arrived. Malformed records are dropped internally and never surface
    /// here.
    fn receive(&mut self) -> TransportResult<Option<ServerFrame>>;

    /// True if a complete frame is already buffered locally.
    fn has_pending(&self) -> bool;
}

/// Unreliable datagram socket for direct peer traffic.
///
/// Implementations handle fragmentation transparently: `send_to` splits
/// oversized frames and `receive` only ever yields whole reassembled frames,
/// paired with the source address they arrived from.
pub trait PeerTransport: Send {
    fn bind(&mut self, config: &TransportConfig) -> TransportResult<()>;

    fn close(&mut self) -> TransportResult<()>;

    /// Locally bound UDP port, once bound.
    fn local_port(&self) -> Option<u16>;

    fn send_to(&mut self, frame: &PeerFrame, addr: SocketAddr) -> TransportResult<()>;

    fn receive(&mut self) -> TransportResult<Option<(PeerFrame, SocketAddr)>>;

    fn has_pending(&self) -> bool;
}
