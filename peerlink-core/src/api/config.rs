//! Client Configuration

use std::time::Duration;

use crate::network::TransportConfig;

/// Default UDP port for direct peer traffic.
pub const DEFAULT_P2P_PORT: u16 = 54321;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay server address (`host:port`).
    pub server_addr: String,
    /// UDP port to bind for direct peer traffic (0 picks an ephemeral
    /// port, which is then reported to the relay at login).
    pub p2p_port: u16,
    /// How long the consent and offer-wait phases of a switch may take.
    pub consent_timeout: Duration,
    /// How long an OFFER may wait for its ACK.
    pub handshake_timeout: Duration,
    /// Serialized datagrams above this size are fragmented.
    pub max_datagram_bytes: usize,
    /// Raw bytes carried per fragment before base64 expansion.
    pub fragment_chunk_bytes: usize,
    /// Relay stream connect timeout.
    pub connect_timeout: Duration,
    /// Socket poll timeout; bounds how long one `poll` call may block.
    pub read_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            server_addr: "127.0.0.1:7600".to_string(),
            p2p_port: DEFAULT_P2P_PORT,
            consent_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            max_datagram_bytes: 4096,
            fragment_chunk_bytes: 2048,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_millis(50),
        }
    }
}

impl ClientConfig {
    /// The transport-layer view of this configuration.
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            server_addr: self.server_addr.clone(),
            p2p_bind_port: self.p2p_port,
            connect_timeout_ms: self.connect_timeout.as_millis() as u64,
            read_timeout_ms: self.read_timeout.as_millis() as u64,
            max_datagram_bytes: self.max_datagram_bytes,
            fragment_chunk_bytes: self.fragment_chunk_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.p2p_port, DEFAULT_P2P_PORT);
        assert!(config.consent_timeout > config.handshake_timeout);
    }

    #[test]
    fn test_transport_config_mirrors_fields() {
        let config = ClientConfig {
            server_addr: "relay.example.net:7600".to_string(),
            p2p_port: 0,
            read_timeout: Duration::from_millis(25),
            ..ClientConfig::default()
        };
        let tc = config.transport_config();
        assert_eq!(tc.server_addr, "relay.example.net:7600");
        assert_eq!(tc.p2p_bind_port, 0);
        assert_eq!(tc.read_timeout_ms, 25);
        assert_eq!(tc.max_datagram_bytes, config.max_datagram_bytes);
    }
}
