//! UDP Peer Transport
//!
//! Datagram socket for direct peer traffic. Frames that serialize beyond the
//! configured ceiling are fragmented on send and reassembled on receive, so
//! callers only ever see whole frames. The source address of each datagram
//! is surfaced to the caller; the handshake uses it to learn where a peer
//! actually is, NAT rewrites included.

use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::time::Duration;

use super::error::NetworkError;
use super::fragment::{split_frame, FragmentAssembler, FragmentLimits};
use super::message::PeerFrame;
use super::transport::{PeerTransport, TransportConfig, TransportResult};

/// Largest datagram we will ever try to parse.
const RECV_BUFFER_BYTES: usize = 65_536;

pub struct UdpPeerTransport {
    socket: Option<UdpSocket>,
    assembler: FragmentAssembler,
    max_datagram_bytes: usize,
    fragment_chunk_bytes: usize,
    recv_buf: Vec<u8>,
}

impl Default for UdpPeerTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl UdpPeerTransport {
    pub fn new() -> Self {
        UdpPeerTransport {
            socket: None,
            assembler: FragmentAssembler::new(FragmentLimits::default()),
            max_datagram_bytes: 4096,
            fragment_chunk_bytes: 2048,
            recv_buf: vec![0u8; RECV_BUFFER_BYTES],
        }
    }

    fn send_datagram(&self, bytes: &[u8], addr: SocketAddr) -> TransportResult<()> {
        let socket = self.socket.as_ref().ok_or(NetworkError::NotBound)?;
        let sent = socket
            .send_to(bytes, addr)
            .map_err(|e| NetworkError::SendFailed(e.to_string()))?;
        if sent != bytes.len() {
            return Err(NetworkError::SendFailed(format!(
                "short datagram write: {sent} of {} bytes",
                bytes.len()
            )));
        }
        Ok(())
    }
}

impl PeerTransport for UdpPeerTransport {
    fn bind(&mut self, config: &TransportConfig) -> TransportResult<()> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, config.p2p_bind_port))
            .map_err(|e| NetworkError::ConnectionFailed(e.to_string()))?;
        socket
            .set_read_timeout(Some(Duration::from_millis(config.read_timeout_ms.max(1))))
            .map_err(|e| NetworkError::ConnectionFailed(e.to_string()))?;
        self.max_datagram_bytes = config.max_datagram_bytes;
        self.fragment_chunk_bytes = config.fragment_chunk_bytes;
        if let Ok(addr) = socket.local_addr() {
            log::debug!("peer socket bound on udp port {}", addr.port());
        }
        self.socket = Some(socket);
        Ok(())
    }

    fn close(&mut self) -> TransportResult<()> {
        self.socket = None;
        Ok(())
    }

    fn local_port(&self) -> Option<u16> {
        self.socket
            .as_ref()
            .and_then(|s| s.local_addr().ok())
            .map(|a| a.port())
    }

    fn send_to(&mut self, frame: &PeerFrame, addr: SocketAddr) -> TransportResult<()> {
        let raw =
            serde_json::to_vec(frame).map_err(|e| NetworkError::MalformedFrame(e.to_string()))?;
        if raw.len() <= self.max_datagram_bytes {
            return self.send_datagram(&raw, addr);
        }

        let fragments = split_frame(&raw, self.fragment_chunk_bytes);
        log::debug!(
            "fragmenting {} byte frame into {} datagrams",
            raw.len(),
            fragments.len()
        );
        for fragment in &fragments {
            let bytes = serde_json::to_vec(fragment)
                .map_err(|e| NetworkError::MalformedFrame(e.to_string()))?;
            self.send_datagram(&bytes, addr)?;
        }
        Ok(())
    }

    fn receive(&mut self) -> TransportResult<Option<(PeerFrame, SocketAddr)>> {
        loop {
            let socket = self.socket.as_ref().ok_or(NetworkError::NotBound)?;
            let (len, source) = match socket.recv_from(&mut self.recv_buf) {
                Ok(pair) => pair,
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                    self.assembler.sweep_expired();
                    return Ok(None);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(NetworkError::ReceiveFailed(e.to_string())),
            };

            let frame: PeerFrame = match serde_json::from_slice(&self.recv_buf[..len]) {
                Ok(frame) => frame,
                Err(e) => {
                    log::warn!("dropping malformed datagram from {source}: {e}");
                    continue;
                }
            };

            match frame {
                PeerFrame::Fragment {
                    id,
                    index,
                    total,
                    data,
                } => match self.assembler.accept(source, &id, index, total, &data) {
                    Ok(Some(raw)) => match serde_json::from_slice::<PeerFrame>(&raw) {
                        Ok(PeerFrame::Fragment { .. }) => {
                            log::warn!("dropping nested fragment from {source}");
                        }
                        Ok(inner) => return Ok(Some((inner, source))),
                        Err(e) => {
                            log::warn!("dropping unparseable reassembled frame from {source}: {e}");
                        }
                    },
                    Ok(None) => {}
                    Err(e) => {
                        log::warn!("dropping fragment from {source}: {e}");
                    }
                },
                other => return Ok(Some((other, source))),
            }
        }
    }

    fn has_pending(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::message::HandshakeStep;

    fn bound_transport() -> UdpPeerTransport {
        let mut transport = UdpPeerTransport::new();
        let config = TransportConfig {
            p2p_bind_port: 0,
            read_timeout_ms: 50,
            ..TransportConfig::default()
        };
        transport.bind(&config).unwrap();
        transport
    }

    fn loopback(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_unbound_socket_errors() {
        let mut transport = UdpPeerTransport::new();
        let frame = PeerFrame::P2pHandshake {
            from: "a".to_string(),
            step: HandshakeStep::Offer,
        };
        assert_eq!(
            transport.send_to(&frame, loopback(1)),
            Err(NetworkError::NotBound)
        );
        assert!(transport.receive().is_err());
        assert!(transport.local_port().is_none());
    }

    #[test]
    fn test_small_frame_roundtrip() {
        let mut a = bound_transport();
        let mut b = bound_transport();
        let b_port = b.local_port().unwrap();

        let frame = PeerFrame::P2pHandshake {
            from: "alice".to_string(),
            step: HandshakeStep::Ack,
        };
        a.send_to(&frame, loopback(b_port)).unwrap();

        let mut got = None;
        for _ in 0..50 {
            if let Some(pair) = b.receive().unwrap() {
                got = Some(pair);
                break;
            }
        }
        let (received, source) = got.expect("datagram not delivered");
        assert_eq!(received, frame);
        assert_eq!(source.port(), a.local_port().unwrap());
    }

    #[test]
    fn test_oversized_frame_fragments_and_reassembles() {
        let mut a = bound_transport();
        let mut b = bound_transport();
        let b_port = b.local_port().unwrap();

        // ~20 KiB of ciphertext, far past the 4 KiB ceiling.
        let frame = PeerFrame::ReceiveMessage {
            from: "alice".to_string(),
            message: crate::network::message::CipherEnvelope {
                content: "Q".repeat(20_000),
                timestamp: 1,
                kind: crate::network::message::PayloadKind::Image,
            },
        };
        a.send_to(&frame, loopback(b_port)).unwrap();

        let mut got = None;
        for _ in 0..100 {
            if let Some(pair) = b.receive().unwrap() {
                got = Some(pair);
                break;
            }
        }
        let (received, _) = got.expect("fragmented frame not delivered");
        assert_eq!(received, frame);
    }

    #[test]
    fn test_malformed_datagram_skipped() {
        let mut receiver = bound_transport();
        let port = receiver.local_port().unwrap();

        let raw = UdpSocket::bind("127.0.0.1:0").unwrap();
        raw.send_to(b"this is not json", loopback(port)).unwrap();

        // Poll a few times; the garbage must be swallowed without error.
        for _ in 0..5 {
            assert!(receiver.receive().unwrap().is_none());
        }
    }
}
