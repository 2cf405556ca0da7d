//! TCP Relay Transport
//!
//! Blocking std TCP with a short read timeout, so `receive` behaves as a
//! poll: it drains whatever the socket has, returns a complete frame if one
//! is buffered, and otherwise reports `None` after the timeout.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

use super::error::NetworkError;
use super::framing::{decode_frame, encode_frame, LineDecoder};
use super::message::{ClientFrame, ServerFrame};
use super::transport::{ConnectionState, RelayTransport, TransportConfig, TransportResult};

pub struct TcpRelayTransport {
    stream: Option<TcpStream>,
    state: ConnectionState,
    decoder: LineDecoder,
}

impl Default for TcpRelayTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpRelayTransport {
    pub fn new() -> Self {
        TcpRelayTransport {
            stream: None,
            state: ConnectionState::Disconnected,
            decoder: LineDecoder::new(),
        }
    }

    fn drop_stream(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.state = ConnectionState::Disconnected;
    }
}

impl RelayTransport for TcpRelayTransport {
    fn connect(&mut self, config: &TransportConfig) -> TransportResult<()> {
        self.drop_stream();
        self.state = ConnectionState::Connecting;

        let addr = config
            .server_addr
            .to_socket_addrs()
            .map_err(|e| {
                self.state = ConnectionState::Disconnected;
                NetworkError::ConnectionFailed(e.to_string())
            })?
            .next()
            .ok_or_else(|| {
                self.state = ConnectionState::Disconnected;
                NetworkError::ConnectionFailed(format!(
                    "no address resolved for {}",
                    config.server_addr
                ))
            })?;

        let stream =
            TcpStream::connect_timeout(&addr, Duration::from_millis(config.connect_timeout_ms))
                .map_err(|e| {
                    self.state = ConnectionState::Disconnected;
                    NetworkError::ConnectionFailed(e.to_string())
                })?;
        stream
            .set_read_timeout(Some(Duration::from_millis(config.read_timeout_ms.max(1))))
            .map_err(|e| {
                self.state = ConnectionState::Disconnected;
                NetworkError::ConnectionFailed(e.to_string())
            })?;
        let _ = stream.set_nodelay(true);

        self.stream = Some(stream);
        self.state = ConnectionState::Connected;
        self.decoder = LineDecoder::new();
        log::debug!("connected to relay at {addr}");
        Ok(())
    }

    fn disconnect(&mut self) -> TransportResult<()> {
        self.drop_stream();
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    fn send(&mut self, frame: &ClientFrame) -> TransportResult<()> {
        let line = encode_frame(frame)?;
        let stream = self.stream.as_mut().ok_or(NetworkError::NotConnected)?;
        if let Err(e) = stream.write_all(&line) {
            self.drop_stream();
            return Err(NetworkError::SendFailed(e.to_string()));
        }
        Ok(())
    }

    fn receive(&mut self) -> TransportResult<Option<ServerFrame>> {
        loop {
            while let Some(line) = self.decoder.next_line() {
                match decode_frame::<ServerFrame>(&line) {
                    Ok(frame) => return Ok(Some(frame)),
                    Err(e) => {
                        log::warn!("dropping malformed server record: {e}");
                    }
                }
            }

            let stream = self.stream.as_mut().ok_or(NetworkError::NotConnected)?;
            let mut buf = [0u8; 4096];
            match stream.read(&mut buf) {
                Ok(0) => {
                    self.drop_stream();
                    return Err(NetworkError::ConnectionClosed);
                }
                Ok(n) => self.decoder.extend(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                    return Ok(None);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.drop_stream();
                    return Err(NetworkError::ReceiveFailed(e.to_string()));
                }
            }
        }
    }

    fn has_pending(&self) -> bool {
        self.decoder.has_complete_line()
    }
}
