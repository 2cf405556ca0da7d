//! Mock Transports
//!
//! Scriptable in-memory implementations of both transport traits. Tests
//! inspect what the engine sent, queue inbound frames, and inject failures
//! without touching a socket.

use std::collections::VecDeque;
use std::net::SocketAddr;

use super::error::NetworkError;
use super::message::{ClientFrame, PeerFrame, ServerFrame};
use super::transport::{
    ConnectionState, PeerTransport, RelayTransport, TransportConfig, TransportResult,
};

/// Mock of the reliable relay stream.
pub struct MockRelayTransport {
    state: ConnectionState,
    sent_frames: Vec<ClientFrame>,
    receive_queue: VecDeque<ServerFrame>,
    inject_error: Option<NetworkError>,
}

impl Default for MockRelayTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRelayTransport {
    pub fn new() -> Self {
        MockRelayTransport {
            state: ConnectionState::Disconnected,
            sent_frames: Vec::new(),
            receive_queue: VecDeque::new(),
            inject_error: None,
        }
    }

    /// Queues a frame for the next `receive` call.
    pub fn queue_receive(&mut self, frame: ServerFrame) {
        self.receive_queue.push_back(frame);
    }

    /// Everything the engine has sent, oldest first.
    pub fn sent_frames(&self) -> &[ClientFrame] {
        &self.sent_frames
    }

    /// Takes the sent frames, clearing the record.
    pub fn drain_sent(&mut self) -> Vec<ClientFrame> {
        std::mem::take(&mut self.sent_frames)
    }

    /// Fails the next transport call with `error`.
    pub fn inject_error(&mut self, error: NetworkError) {
        self.inject_error = Some(error);
    }

    pub fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
    }

    fn check_error(&mut self) -> TransportResult<()> {
        match self.inject_error.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl RelayTransport for MockRelayTransport {
    fn connect(&mut self, _config: &TransportConfig) -> TransportResult<()> {
        self.check_error()?;
        self.state = ConnectionState::Connected;
        Ok(())
    }

    fn disconnect(&mut self) -> TransportResult<()> {
        self.state = ConnectionState::Disconnected;
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    fn send(&mut self, frame: &ClientFrame) -> TransportResult<()> {
        self.check_error()?;
        if self.state != ConnectionState::Connected {
            return Err(NetworkError::NotConnected);
        }
        self.sent_frames.push(frame.clone());
        Ok(())
    }

    fn receive(&mut self) -> TransportResult<Option<ServerFrame>> {
        self.check_error()?;
        Ok(self.receive_queue.pop_front())
    }

    fn has_pending(&self) -> bool {
        !self.receive_queue.is_empty()
    }
}

/// Mock of the peer datagram socket.
pub struct MockPeerTransport {
    bound_port: Option<u16>,
    sent_datagrams: Vec<(PeerFrame, SocketAddr)>,
    receive_queue: VecDeque<(PeerFrame, SocketAddr)>,
    inject_error: Option<NetworkError>,
    fail_next_sends: u32,
}

impl Default for MockPeerTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPeerTransport {
    pub fn new() -> Self {
        MockPeerTransport {
            bound_port: None,
            sent_datagrams: Vec::new(),
            receive_queue: VecDeque::new(),
            inject_error: None,
            fail_next_sends: 0,
        }
    }

    /// Queues an inbound datagram with the address it "arrived" from.
    pub fn queue_receive(&mut self, frame: PeerFrame, source: SocketAddr) {
        self.receive_queue.push_back((frame, source));
    }

    pub fn sent_datagrams(&self) -> &[(PeerFrame, SocketAddr)] {
        &self.sent_datagrams
    }

    pub fn drain_sent(&mut self) -> Vec<(PeerFrame, SocketAddr)> {
        std::mem::take(&mut self.sent_datagrams)
    }

    pub fn inject_error(&mut self, error: NetworkError) {
        self.inject_error = Some(error);
    }

    /// Makes the next `count` sends fail, for exercising retry paths.
    pub fn fail_next_sends(&mut self, count: u32) {
        self.fail_next_sends = count;
    }

    fn check_error(&mut self) -> TransportResult<()> {
        match self.inject_error.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl PeerTransport for MockPeerTransport {
    fn bind(&mut self, config: &TransportConfig) -> TransportResult<()> {
        self.check_error()?;
        self.bound_port = Some(config.p2p_bind_port);
        Ok(())
    }

    fn close(&mut self) -> TransportResult<()> {
        self.bound_port = None;
        Ok(())
    }

    fn local_port(&self) -> Option<u16> {
        self.bound_port
    }

    fn send_to(&mut self, frame: &PeerFrame, addr: SocketAddr) -> TransportResult<()> {
        self.check_error()?;
        if self.fail_next_sends > 0 {
            self.fail_next_sends -= 1;
            return Err(NetworkError::SendFailed("injected failure".to_string()));
        }
        if self.bound_port.is_none() {
            return Err(NetworkError::NotBound);
        }
        self.sent_datagrams.push((frame.clone(), addr));
        Ok(())
    }

    fn receive(&mut self) -> TransportResult<Option<(PeerFrame, SocketAddr)>> {
        self.check_error()?;
        Ok(self.receive_queue.pop_front())
    }

    fn has_pending(&self) -> bool {
        !self.receive_queue.is_empty()
    }
}
