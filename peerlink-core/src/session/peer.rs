//! Per-Peer Session State
//!
//! The mode state machine for each remote identity. Transitions are driven
//! by the engine; this registry enforces the structural rules: at most one
//! in-flight handshake per peer, endpoints only while in P2P, and handshake
//! records destroyed on every terminal transition.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use crate::network::WireMode;

/// Transport mode for a peer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatMode {
    /// Relayed through the server. The default for every peer.
    Cs,
    /// Direct datagram path established.
    P2p,
    /// Switch negotiation in progress.
    P2pConnecting,
    /// Last direct attempt failed or was declined; traffic uses the relay.
    P2pFailed,
}

impl ChatMode {
    /// True when outbound messages for this peer go through the relay.
    pub fn uses_relay(&self) -> bool {
        !matches!(self, ChatMode::P2p)
    }
}

/// Progress of an in-flight switch negotiation, seen from this side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    /// Consent request sent through the relay; waiting for the answer.
    RequestSent,
    /// Consent granted locally; waiting for the initiator's OFFER datagram.
    AwaitingOffer,
    /// OFFER sent; waiting for the peer's ACK.
    OfferSent,
}

/// One in-flight handshake. ACK and CONFIRM are terminal: the record is
/// destroyed rather than given a phase.
#[derive(Debug, Clone)]
pub struct HandshakeState {
    pub phase: HandshakePhase,
    pub request_id: String,
    pub requested_mode: WireMode,
    pub deadline: Instant,
}

/// State for one remote identity.
#[derive(Debug)]
pub struct PeerSession {
    pub remote_id: String,
    pub mode: ChatMode,
    pub remote_endpoint: Option<SocketAddr>,
    pub handshake: Option<HandshakeState>,
}

impl PeerSession {
    fn new(remote_id: String) -> Self {
        PeerSession {
            remote_id,
            mode: ChatMode::Cs,
            remote_endpoint: None,
            handshake: None,
        }
    }
}

/// Registry of peer sessions, created lazily on first touch.
#[derive(Debug, Default)]
pub struct PeerSessions {
    sessions: HashMap<String, PeerSession>,
}

impl PeerSessions {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&mut self, peer: &str) -> &mut PeerSession {
        self.sessions
            .entry(peer.to_string())
            .or_insert_with(|| PeerSession::new(peer.to_string()))
    }

    /// Current mode for `peer`; unknown peers are in CS.
    pub fn mode(&self, peer: &str) -> ChatMode {
        self.sessions.get(peer).map_or(ChatMode::Cs, |s| s.mode)
    }

    /// Datagram endpoint for `peer`, present only in P2P.
    pub fn endpoint(&self, peer: &str) -> Option<SocketAddr> {
        self.sessions.get(peer).and_then(|s| s.remote_endpoint)
    }

    pub fn handshake(&self, peer: &str) -> Option<&HandshakeState> {
        self.sessions.get(peer).and_then(|s| s.handshake.as_ref())
    }

    /// Starts an outbound switch negotiation. Returns false (changing
    /// nothing) when a handshake for this peer is already pending.
    pub fn begin_request(
        &mut self,
        peer: &str,
        request_id: String,
        requested_mode: WireMode,
        deadline: Instant,
    ) -> bool {
        let session = self.entry(peer);
        if session.handshake.is_some() {
            return false;
        }
        session.mode = ChatMode::P2pConnecting;
        session.handshake = Some(HandshakeState {
            phase: HandshakePhase::RequestSent,
            request_id,
            requested_mode,
            deadline,
        });
        true
    }

    /// Accepting side: consent granted, wait for the peer's OFFER datagram.
    /// Same exclusivity rule as [`begin_request`](Self::begin_request).
    pub fn begin_awaiting_offer(
        &mut self,
        peer: &str,
        request_id: String,
        requested_mode: WireMode,
        deadline: Instant,
    ) -> bool {
        let session = self.entry(peer);
        if session.handshake.is_some() {
            return false;
        }
        session.mode = ChatMode::P2pConnecting;
        session.handshake = Some(HandshakeState {
            phase: HandshakePhase::AwaitingOffer,
            request_id,
            requested_mode,
            deadline,
        });
        true
    }

    /// Initiator: consent arrived, the OFFER is going out. Replaces the
    /// deadline with the (shorter) datagram-phase bound.
    pub fn mark_offer_sent(&mut self, peer: &str, deadline: Instant) -> bool {
        match self.sessions.get_mut(peer).and_then(|s| s.handshake.as_mut()) {
            Some(handshake) => {
                handshake.phase = HandshakePhase::OfferSent;
                handshake.deadline = deadline;
                true
            }
            None => false,
        }
    }

    /// Terminal: the direct path is up. Destroys the handshake record,
    /// which also cancels its deadline.
    pub fn establish_p2p(&mut self, peer: &str, endpoint: SocketAddr) {
        let session = self.entry(peer);
        session.mode = ChatMode::P2p;
        session.remote_endpoint = Some(endpoint);
        session.handshake = None;
    }

    /// Terminal: negotiation failed or was declined.
    pub fn fail_handshake(&mut self, peer: &str) {
        let session = self.entry(peer);
        session.mode = ChatMode::P2pFailed;
        session.remote_endpoint = None;
        session.handshake = None;
    }

    /// Drops an in-flight handshake without recording a failure, reverting
    /// a connecting mode to CS. Used when the consent request itself could
    /// not be sent.
    pub fn abort_handshake(&mut self, peer: &str) {
        if let Some(session) = self.sessions.get_mut(peer) {
            session.handshake = None;
            if session.mode == ChatMode::P2pConnecting {
                session.mode = ChatMode::Cs;
            }
        }
    }

    /// Voluntary or notified switch back to the relay. Returns false when
    /// the peer was already in CS, so callers can keep the operation
    /// idempotent and skip re-notifying.
    pub fn switch_to_cs(&mut self, peer: &str) -> bool {
        let session = self.entry(peer);
        if session.mode == ChatMode::Cs {
            return false;
        }
        session.mode = ChatMode::Cs;
        session.remote_endpoint = None;
        session.handshake = None;
        true
    }

    /// Remote went offline: silent reset, no notification or failure mark.
    pub fn reset_on_offline(&mut self, peer: &str) {
        if let Some(session) = self.sessions.get_mut(peer) {
            session.mode = ChatMode::Cs;
            session.remote_endpoint = None;
            session.handshake = None;
        }
    }

    /// Fails and collects every handshake whose deadline has passed.
    pub fn take_expired(&mut self, now: Instant) -> Vec<String> {
        let mut expired = Vec::new();
        for session in self.sessions.values_mut() {
            let due = session
                .handshake
                .as_ref()
                .is_some_and(|h| now >= h.deadline);
            if due {
                session.handshake = None;
                session.mode = ChatMode::P2pFailed;
                session.remote_endpoint = None;
                expired.push(session.remote_id.clone());
            }
        }
        expired
    }

    pub fn remove(&mut self, peer: &str) {
        self.sessions.remove(peer);
    }

    pub fn clear(&mut self) {
        self.sessions.clear();
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
