//! Messenger Engine
//!
//! Single-threaded, poll-driven client: embedders call operations, then
//! call [`Messenger::poll`] regularly to drain both transports and fire
//! handshake deadlines. All outcomes surface as [`ClientEvent`]s.
//!
//! Routing rule: a message goes directly to the peer only while the session
//! is in P2P mode. A failed direct send is retried once and then falls back
//! to the relay for that one message; the mode itself only changes through
//! negotiation, never as a side effect of a send.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use crate::crypto::{keywrap, IdentityKeyPair, SessionKey};
use crate::network::{
    CipherEnvelope, ClientFrame, HandshakeStep, MockPeerTransport, MockRelayTransport,
    PayloadKind, PeerFrame, PeerTransport, PresenceStatus, RelayTransport, ResponseAction,
    ResponseStatus, ServerFrame, WireMode,
};
use crate::session::{ChatMode, HandshakePhase, InboundPayload, PeerSessions, SessionKeyManager};

use super::config::ClientConfig;
use super::error::{ClientError, ClientResult};
use super::events::{ClientEvent, EventDispatcher, EventHandler, MessageContent};
use crate::network::FriendInfo;

pub struct Messenger<R: RelayTransport, P: PeerTransport> {
    config: ClientConfig,
    relay: R,
    peer_net: P,
    identity: IdentityKeyPair,
    username: Option<String>,
    pending_login: Option<String>,
    friends: HashMap<String, FriendInfo>,
    sessions: PeerSessions,
    keys: SessionKeyManager,
    events: EventDispatcher,
    /// Peers with a public-key fetch in flight. The flag records whether the
    /// resulting key replaces an existing one (forced re-key) or only fills
    /// a gap.
    key_requests: HashMap<String, bool>,
}

impl Messenger<MockRelayTransport, MockPeerTransport> {
    /// A messenger wired to in-memory mock transports, for tests and
    /// examples.
    pub fn with_mocks(config: ClientConfig) -> Self {
        Self::with_transports(config, MockRelayTransport::new(), MockPeerTransport::new())
    }
}

impl<R: RelayTransport, P: PeerTransport> Messenger<R, P> {
    pub fn with_transports(config: ClientConfig, relay: R, peer_net: P) -> Self {
        Self::with_identity(config, relay, peer_net, IdentityKeyPair::generate())
    }

    /// Like [`with_transports`](Self::with_transports) but with a restored
    /// identity key pair instead of a fresh one.
    pub fn with_identity(
        config: ClientConfig,
        relay: R,
        peer_net: P,
        identity: IdentityKeyPair,
    ) -> Self {
        Messenger {
            config,
            relay,
            peer_net,
            identity,
            username: None,
            pending_login: None,
            friends: HashMap::new(),
            sessions: PeerSessions::new(),
            keys: SessionKeyManager::new(),
            events: EventDispatcher::new(),
            key_requests: HashMap::new(),
        }
    }

    pub fn add_event_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.events.add_handler(handler);
    }

    /// The long-term identity key pair, e.g. for showing a fingerprint to
    /// verify out of band.
    pub fn identity(&self) -> &IdentityKeyPair {
        &self.identity
    }

    /// Mutable access to the relay transport, mainly for tests and
    /// embedders that manage socket lifecycles themselves.
    pub fn relay_mut(&mut self) -> &mut R {
        &mut self.relay
    }

    /// Mutable access to the peer datagram transport.
    pub fn peer_net_mut(&mut self) -> &mut P {
        &mut self.peer_net
    }

    // ===== Connection & account =====

    /// Connects the relay stream and binds the peer datagram socket.
    pub fn connect(&mut self) -> ClientResult<()> {
        let transport_config = self.config.transport_config();
        self.relay.connect(&transport_config)?;
        self.peer_net.bind(&transport_config)?;
        log::debug!(
            "connected; identity fingerprint {}",
            self.identity.fingerprint()
        );
        Ok(())
    }

    pub fn disconnect(&mut self) -> ClientResult<()> {
        self.relay.disconnect()?;
        self.peer_net.close()?;
        Ok(())
    }

    pub fn request_verification_code(&mut self, email: &str) -> ClientResult<()> {
        self.relay.send(&ClientFrame::RequestVerificationCode {
            email: email.to_string(),
        })?;
        Ok(())
    }

    pub fn register(
        &mut self,
        username: &str,
        password: &str,
        email: &str,
        code: &str,
    ) -> ClientResult<()> {
        self.relay.send(&ClientFrame::Register {
            username: username.to_string(),
            password: password.to_string(),
            email: email.to_string(),
            code: code.to_string(),
            public_key: self.identity.public_base64(),
        })?;
        Ok(())
    }

    pub fn login(&mut self, username: &str, password: &str) -> ClientResult<()> {
        let p2p_port = self
            .peer_net
            .local_port()
            .unwrap_or(self.config.p2p_port);
        self.relay.send(&ClientFrame::Login {
            username: username.to_string(),
            password: password.to_string(),
            p2p_port,
            public_key: self.identity.public_base64(),
        })?;
        self.pending_login = Some(username.to_string());
        Ok(())
    }

    /// Local teardown is unconditional; the logout frame itself is
    /// fire-and-forget.
    pub fn logout(&mut self) -> ClientResult<()> {
        if self.username.is_none() {
            return Err(ClientError::NotLoggedIn);
        }
        if let Err(e) = self.relay.send(&ClientFrame::Logout {}) {
            log::debug!("logout frame not delivered: {e}");
        }
        self.teardown();
        self.events.dispatch(ClientEvent::LoggedOut);
        Ok(())
    }

    fn teardown(&mut self) {
        self.username = None;
        self.pending_login = None;
        self.friends.clear();
        self.sessions.clear();
        self.keys.clear();
        self.key_requests.clear();
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    fn sender_name(&self) -> ClientResult<String> {
        self.username.clone().ok_or(ClientError::NotLoggedIn)
    }

    // ===== Friends =====

    pub fn request_friends(&mut self) -> ClientResult<()> {
        self.sender_name()?;
        self.relay.send(&ClientFrame::GetFriends {})?;
        Ok(())
    }

    pub fn add_friend(&mut self, username: &str) -> ClientResult<()> {
        self.sender_name()?;
        self.relay.send(&ClientFrame::AddFriend {
            username: username.to_string(),
        })?;
        Ok(())
    }

    pub fn delete_friend(&mut self, username: &str) -> ClientResult<()> {
        self.sender_name()?;
        self.relay.send(&ClientFrame::DeleteFriend {
            username: username.to_string(),
        })?;
        Ok(())
    }

    pub fn friend(&self, username: &str) -> Option<&FriendInfo> {
        self.friends.get(username)
    }

    /// Current friend snapshot, sorted by username.
    pub fn friends(&self) -> Vec<FriendInfo> {
        let mut friends: Vec<FriendInfo> = self.friends.values().cloned().collect();
        friends.sort_by(|a, b| a.username.cmp(&b.username));
        friends
    }

    // ===== Session keys =====

    /// Starts a key exchange with `peer` unless a key is already installed
    /// or a fetch is in flight. Completion surfaces as
    /// [`ClientEvent::SessionEstablished`].
    pub fn ensure_session(&mut self, peer: &str) -> ClientResult<()> {
        self.sender_name()?;
        if self.keys.has_key(peer) || self.key_requests.contains_key(peer) {
            return Ok(());
        }
        self.key_requests.insert(peer.to_string(), false);
        self.relay.send(&ClientFrame::GetPublicKey {
            username: peer.to_string(),
        })?;
        Ok(())
    }

    pub fn has_session_key(&self, peer: &str) -> bool {
        self.keys.has_key(peer)
    }

    /// Forces a fresh key exchange, replacing any installed key when the
    /// response arrives.
    fn begin_rekey(&mut self, peer: &str) -> ClientResult<()> {
        self.key_requests.insert(peer.to_string(), true);
        self.relay.send(&ClientFrame::GetPublicKey {
            username: peer.to_string(),
        })?;
        Ok(())
    }

    // ===== Messaging =====

    pub fn send_text(&mut self, to: &str, text: &str) -> ClientResult<()> {
        self.send_content(to, PayloadKind::Text, text.as_bytes())
    }

    pub fn send_file(&mut self, to: &str, filename: &str, data: &[u8]) -> ClientResult<()> {
        self.send_content(
            to,
            PayloadKind::File {
                filename: filename.to_string(),
            },
            data,
        )
    }

    pub fn send_image(&mut self, to: &str, data: &[u8]) -> ClientResult<()> {
        self.send_content(to, PayloadKind::Image, data)
    }

    fn send_content(&mut self, to: &str, kind: PayloadKind, plaintext: &[u8]) -> ClientResult<()> {
        let from = self.sender_name()?;
        let content = self.keys.encrypt(to, plaintext)?;
        let envelope = CipherEnvelope::new(content, kind);
        self.route_envelope(&from, to, envelope)
    }

    fn route_envelope(&mut self, from: &str, to: &str, envelope: CipherEnvelope) -> ClientResult<()> {
        if self.sessions.mode(to) == ChatMode::P2p {
            if let Some(endpoint) = self.sessions.endpoint(to) {
                let frame = PeerFrame::ReceiveMessage {
                    from: from.to_string(),
                    message: envelope.clone(),
                };
                match self.peer_net.send_to(&frame, endpoint) {
                    Ok(()) => return Ok(()),
                    Err(first) => {
                        log::debug!("direct send to {to} failed ({first}); retrying once");
                        match self.peer_net.send_to(&frame, endpoint) {
                            Ok(()) => return Ok(()),
                            Err(second) => log::warn!(
                                "direct send to {to} failed twice ({second}); relaying this message"
                            ),
                        }
                    }
                }
            }
        }
        self.relay.send(&ClientFrame::RelayMessage {
            to: to.to_string(),
            message: envelope,
        })?;
        Ok(())
    }

    fn send_wrapped_key(&mut self, from: &str, to: &str, wrapped: String) -> ClientResult<()> {
        if self.sessions.mode(to) == ChatMode::P2p {
            if let Some(endpoint) = self.sessions.endpoint(to) {
                let frame = PeerFrame::ReceiveSessionKey {
                    from: from.to_string(),
                    wrapped_key: wrapped.clone(),
                };
                match self.peer_net.send_to(&frame, endpoint) {
                    Ok(()) => return Ok(()),
                    Err(first) => {
                        log::debug!("direct key send to {to} failed ({first}); retrying once");
                        match self.peer_net.send_to(&frame, endpoint) {
                            Ok(()) => return Ok(()),
                            Err(second) => log::warn!(
                                "direct key send to {to} failed twice ({second}); relaying it"
                            ),
                        }
                    }
                }
            }
        }
        self.relay.send(&ClientFrame::RelaySessionKey {
            to: to.to_string(),
            wrapped_key: wrapped,
        })?;
        Ok(())
    }

    // ===== Mode switching =====

    pub fn mode_of(&self, peer: &str) -> ChatMode {
        self.sessions.mode(peer)
    }

    pub fn endpoint_of(&self, peer: &str) -> Option<SocketAddr> {
        self.sessions.endpoint(peer)
    }

    /// Asks to switch the session with `peer` to `mode`.
    ///
    /// CS is unilateral and always succeeds locally. P2P needs the peer's
    /// consent and a reachable datagram path; progress and outcome surface
    /// as [`ClientEvent::ModeChanged`].
    pub fn request_mode_change(&mut self, peer: &str, mode: WireMode) -> ClientResult<()> {
        self.sender_name()?;
        match mode {
            WireMode::Cs => self.switch_to_cs(peer),
            WireMode::P2p => self.request_p2p(peer),
        }
    }

    fn request_p2p(&mut self, peer: &str) -> ClientResult<()> {
        let friend = self
            .friends
            .get(peer)
            .ok_or_else(|| ClientError::UnknownPeer(peer.to_string()))?;
        if !friend.is_online() {
            return Err(ClientError::PeerOffline(peer.to_string()));
        }

        let request_id = uuid::Uuid::new_v4().to_string();
        let deadline = Instant::now() + self.config.consent_timeout;
        if !self
            .sessions
            .begin_request(peer, request_id.clone(), WireMode::P2p, deadline)
        {
            // Refused before any frame leaves this process.
            return Err(ClientError::HandshakePending(peer.to_string()));
        }

        if let Err(e) = self.relay.send(&ClientFrame::ModeChangeRequest {
            target: peer.to_string(),
            requested_mode: WireMode::P2p,
            request_id,
        }) {
            self.sessions.abort_handshake(peer);
            return Err(e.into());
        }
        self.events.dispatch(ClientEvent::ModeChanged {
            peer: peer.to_string(),
            mode: ChatMode::P2pConnecting,
        });
        Ok(())
    }

    fn switch_to_cs(&mut self, peer: &str) -> ClientResult<()> {
        if !self.sessions.switch_to_cs(peer) {
            // Already in CS: idempotent, no duplicate notification.
            return Ok(());
        }
        self.events.dispatch(ClientEvent::ModeChanged {
            peer: peer.to_string(),
            mode: ChatMode::Cs,
        });
        if let Err(e) = self.relay.send(&ClientFrame::ModeChangeNotification {
            to: peer.to_string(),
            mode: WireMode::Cs,
        }) {
            log::debug!("mode change notification to {peer} not delivered: {e}");
        }
        Ok(())
    }

    /// Answers a [`ClientEvent::ModeChangeRequested`] from `peer`.
    pub fn respond_to_mode_change(
        &mut self,
        peer: &str,
        request_id: &str,
        requested_mode: WireMode,
        accepted: bool,
    ) -> ClientResult<()> {
        self.sender_name()?;
        if accepted {
            let deadline = Instant::now() + self.config.consent_timeout;
            if !self.sessions.begin_awaiting_offer(
                peer,
                request_id.to_string(),
                requested_mode,
                deadline,
            ) {
                return Err(ClientError::HandshakePending(peer.to_string()));
            }
            self.events.dispatch(ClientEvent::ModeChanged {
                peer: peer.to_string(),
                mode: ChatMode::P2pConnecting,
            });
        }
        if let Err(e) = self.relay.send(&ClientFrame::ModeChangeResponse {
            to: peer.to_string(),
            request_id: request_id.to_string(),
            accepted,
            requested_mode,
        }) {
            if accepted {
                self.sessions.abort_handshake(peer);
            }
            return Err(e.into());
        }
        Ok(())
    }

    // ===== Polling =====

    /// Drains both transports and fires any due handshake deadlines.
    /// Call this regularly; one call never blocks longer than the
    /// configured read timeout per transport.
    pub fn poll(&mut self) -> ClientResult<()> {
        self.poll_relay()?;
        self.poll_peer_net();
        self.fire_expired_handshakes();
        Ok(())
    }

    fn poll_relay(&mut self) -> ClientResult<()> {
        loop {
            match self.relay.receive() {
                Ok(Some(frame)) => {
                    if let Err(e) = self.handle_server_frame(frame) {
                        log::warn!("server frame handling failed: {e}");
                        self.events.dispatch(ClientEvent::Error {
                            message: e.to_string(),
                        });
                    }
                }
                Ok(None) => return Ok(()),
                Err(e) => {
                    self.events.dispatch(ClientEvent::Disconnected {
                        reason: e.to_string(),
                    });
                    return Err(e.into());
                }
            }
        }
    }

    fn poll_peer_net(&mut self) {
        loop {
            match self.peer_net.receive() {
                Ok(Some((frame, source))) => {
                    if let Err(e) = self.handle_peer_frame(frame, source) {
                        log::warn!("peer frame handling failed: {e}");
                        self.events.dispatch(ClientEvent::Error {
                            message: e.to_string(),
                        });
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    // Datagram socket errors are not fatal to the client.
                    log::warn!("datagram receive failed: {e}");
                    return;
                }
            }
        }
    }

    fn fire_expired_handshakes(&mut self) {
        for peer in self.sessions.take_expired(Instant::now()) {
            log::debug!("handshake with {peer} timed out");
            self.events.dispatch(ClientEvent::ModeChanged {
                peer,
                mode: ChatMode::P2pFailed,
            });
        }
    }

    // ===== Server frames =====

    fn handle_server_frame(&mut self, frame: ServerFrame) -> ClientResult<()> {
        match frame {
            ServerFrame::Response {
                action,
                status,
                message,
                user,
            } => self.handle_response(action, status, message, user),
            ServerFrame::PublicKeyResponse {
                username,
                public_key,
            } => self.complete_key_exchange(&username, &public_key),
            ServerFrame::AllFriendsList { friends } => {
                self.apply_friends_list(friends);
                Ok(())
            }
            ServerFrame::FriendStatusUpdate {
                username,
                status,
                ip,
                port,
            } => {
                self.apply_status_update(username, status, ip, port);
                Ok(())
            }
            ServerFrame::FriendRemoved { username } => {
                self.friends.remove(&username);
                self.end_peer_session(&username);
                self.events
                    .dispatch(ClientEvent::FriendRemoved { username });
                Ok(())
            }
            ServerFrame::ReceiveMessage { from, message } => {
                self.handle_cipher_envelope(&from, message);
                Ok(())
            }
            ServerFrame::ReceiveSessionKey { from, wrapped_key } => {
                self.install_wrapped_key(&from, &wrapped_key)
            }
            ServerFrame::ModeChangeRequest {
                from,
                requested_mode,
                request_id,
            } => {
                self.events.dispatch(ClientEvent::ModeChangeRequested {
                    from,
                    requested_mode,
                    request_id,
                });
                Ok(())
            }
            ServerFrame::ModeChangeResponse {
                from,
                request_id,
                accepted,
                requested_mode: _,
            } => self.handle_consent_answer(&from, &request_id, accepted),
            ServerFrame::ModeChangeNotification { from, mode } => {
                match mode {
                    WireMode::Cs => {
                        if self.sessions.switch_to_cs(&from) {
                            self.events.dispatch(ClientEvent::ModeChanged {
                                peer: from,
                                mode: ChatMode::Cs,
                            });
                        }
                    }
                    WireMode::P2p => {
                        log::debug!("ignoring p2p notification from {from}; switches to p2p are negotiated");
                    }
                }
                Ok(())
            }
            ServerFrame::LogoutResponse {} => {
                log::debug!("logout acknowledged by relay");
                Ok(())
            }
        }
    }

    fn handle_response(
        &mut self,
        action: ResponseAction,
        status: ResponseStatus,
        message: String,
        user: Option<String>,
    ) -> ClientResult<()> {
        match (action, status) {
            (ResponseAction::Register, ResponseStatus::Success) => {
                self.events
                    .dispatch(ClientEvent::RegistrationCompleted { message });
            }
            (ResponseAction::Register, ResponseStatus::Error) => {
                self.events
                    .dispatch(ClientEvent::RegistrationFailed { message });
            }
            (ResponseAction::Login, ResponseStatus::Success) => {
                match self.pending_login.take() {
                    Some(username) => {
                        self.username = Some(username.clone());
                        self.events
                            .dispatch(ClientEvent::LoginCompleted { username });
                        self.request_friends()?;
                    }
                    None => log::warn!("login success with no login in flight"),
                }
            }
            (ResponseAction::Login, ResponseStatus::Error) => {
                self.pending_login = None;
                self.events.dispatch(ClientEvent::LoginFailed { message });
            }
            (ResponseAction::RequestVerificationCode, ResponseStatus::Success) => {
                self.events
                    .dispatch(ClientEvent::VerificationCodeRequested { message });
            }
            (_, ResponseStatus::Error) => {
                if action == ResponseAction::GetPublicKey {
                    // The exchange this answered is dead.
                    if let Some(peer) = &user {
                        self.key_requests.remove(peer);
                    }
                }
                self.events.dispatch(ClientEvent::ServerError {
                    action,
                    message,
                    user,
                });
            }
            (_, ResponseStatus::Success) => {
                log::debug!("{action:?} acknowledged: {message}");
            }
        }
        Ok(())
    }

    fn complete_key_exchange(&mut self, peer: &str, public_key: &str) -> ClientResult<()> {
        let Some(replace) = self.key_requests.remove(peer) else {
            log::debug!("unsolicited public key for {peer}; ignoring");
            return Ok(());
        };
        if !replace && self.keys.has_key(peer) {
            return Ok(());
        }

        let from = self.sender_name()?;
        let their_public = keywrap::decode_public_key(public_key)?;
        let key = SessionKey::generate();
        let wrapped = keywrap::wrap_session_key(&their_public, &key)?;

        let drained = self.keys.install(peer, key);
        self.events.dispatch(ClientEvent::SessionEstablished {
            peer: peer.to_string(),
        });
        for envelope in drained {
            self.handle_cipher_envelope(peer, envelope);
        }
        self.send_wrapped_key(&from, peer, wrapped)
    }

    fn install_wrapped_key(&mut self, from: &str, wrapped: &str) -> ClientResult<()> {
        let key = keywrap::unwrap_session_key(&self.identity, wrapped)?;
        let drained = self.keys.install(from, key);
        self.events.dispatch(ClientEvent::SessionEstablished {
            peer: from.to_string(),
        });
        for envelope in drained {
            self.handle_cipher_envelope(from, envelope);
        }
        Ok(())
    }

    fn handle_cipher_envelope(&mut self, from: &str, envelope: CipherEnvelope) {
        match self.keys.decrypt_or_buffer(from, envelope) {
            Ok(InboundPayload::Ready {
                envelope,
                plaintext,
            }) => match content_from_parts(envelope.kind, plaintext) {
                Ok(content) => {
                    self.events.dispatch(ClientEvent::MessageReceived {
                        from: from.to_string(),
                        content,
                        timestamp: envelope.timestamp,
                        mode: self.sessions.mode(from),
                    });
                }
                Err(e) => {
                    self.events.dispatch(ClientEvent::MessageUndecryptable {
                        from: from.to_string(),
                        reason: e.to_string(),
                    });
                }
            },
            Ok(InboundPayload::Buffered) => {
                log::debug!("holding message from {from} until its session key arrives");
            }
            Err(e) => {
                log::warn!("dropping undecryptable message from {from}: {e}");
                self.events.dispatch(ClientEvent::MessageUndecryptable {
                    from: from.to_string(),
                    reason: e.to_string(),
                });
            }
        }
    }

    fn apply_friends_list(&mut self, friends: Vec<FriendInfo>) {
        self.friends = friends
            .iter()
            .map(|f| (f.username.clone(), f.clone()))
            .collect();
        // The list is authoritative: tear down state for anyone it reports
        // offline, in case a status update was missed.
        for friend in &friends {
            if !friend.is_online() {
                self.end_peer_session(&friend.username);
            }
        }
        self.events.dispatch(ClientEvent::FriendsListed { friends });
    }

    fn apply_status_update(
        &mut self,
        username: String,
        status: PresenceStatus,
        ip: Option<std::net::IpAddr>,
        port: Option<u16>,
    ) {
        let friend = FriendInfo {
            username: username.clone(),
            status,
            ip,
            port,
        };
        self.friends.insert(username.clone(), friend.clone());
        if status == PresenceStatus::Offline {
            self.end_peer_session(&username);
        }
        self.events
            .dispatch(ClientEvent::FriendStatusChanged { friend });
    }

    /// Destroys the session with `peer`: key gone, mode silently back to
    /// CS. Buffered inbound ciphertexts survive for a future key.
    fn end_peer_session(&mut self, peer: &str) {
        let had_key = self.keys.has_key(peer);
        let mode = self.sessions.mode(peer);
        self.keys.remove_key(peer);
        self.sessions.reset_on_offline(peer);
        self.key_requests.remove(peer);

        if had_key {
            self.events.dispatch(ClientEvent::SessionEnded {
                peer: peer.to_string(),
            });
        }
        if mode != ChatMode::Cs {
            self.events.dispatch(ClientEvent::ModeChanged {
                peer: peer.to_string(),
                mode: ChatMode::Cs,
            });
        }
    }

    fn handle_consent_answer(
        &mut self,
        from: &str,
        request_id: &str,
        accepted: bool,
    ) -> ClientResult<()> {
        let valid = self
            .sessions
            .handshake(from)
            .is_some_and(|h| h.phase == HandshakePhase::RequestSent && h.request_id == request_id);
        if !valid {
            log::debug!("stale or unexpected consent answer from {from}");
            return Ok(());
        }

        if !accepted {
            self.sessions.fail_handshake(from);
            self.events.dispatch(ClientEvent::ModeChanged {
                peer: from.to_string(),
                mode: ChatMode::P2pFailed,
            });
            return Ok(());
        }

        let endpoint = self.friends.get(from).and_then(|f| match (f.ip, f.port) {
            (Some(ip), Some(port)) => Some(SocketAddr::new(ip, port)),
            _ => None,
        });
        let Some(endpoint) = endpoint else {
            log::warn!("consent from {from} but no advertised endpoint; abandoning switch");
            self.sessions.fail_handshake(from);
            self.events.dispatch(ClientEvent::ModeChanged {
                peer: from.to_string(),
                mode: ChatMode::P2pFailed,
            });
            return Ok(());
        };

        let me = self.sender_name()?;
        let deadline = Instant::now() + self.config.handshake_timeout;
        self.sessions.mark_offer_sent(from, deadline);
        let offer = PeerFrame::P2pHandshake {
            from: me,
            step: HandshakeStep::Offer,
        };
        if let Err(e) = self.peer_net.send_to(&offer, endpoint) {
            log::warn!("could not send offer to {from} at {endpoint}: {e}");
            self.sessions.fail_handshake(from);
            self.events.dispatch(ClientEvent::ModeChanged {
                peer: from.to_string(),
                mode: ChatMode::P2pFailed,
            });
        }
        Ok(())
    }

    // ===== Peer frames =====

    fn handle_peer_frame(&mut self, frame: PeerFrame, source: SocketAddr) -> ClientResult<()> {
        match frame {
            PeerFrame::P2pHandshake { from, step } => self.handle_handshake(&from, step, source),
            PeerFrame::ReceiveMessage { from, message } => {
                self.handle_cipher_envelope(&from, message);
                Ok(())
            }
            PeerFrame::ReceiveSessionKey { from, wrapped_key } => {
                self.install_wrapped_key(&from, &wrapped_key)
            }
            PeerFrame::Fragment { .. } => {
                // Transports reassemble before handing frames up.
                log::warn!("fragment frame leaked past reassembly; dropping");
                Ok(())
            }
        }
    }

    fn handle_handshake(
        &mut self,
        from: &str,
        step: HandshakeStep,
        source: SocketAddr,
    ) -> ClientResult<()> {
        let phase = self.sessions.handshake(from).map(|h| h.phase);
        match (step, phase) {
            (HandshakeStep::Offer, Some(HandshakePhase::AwaitingOffer)) => {
                let me = self.sender_name()?;
                let ack = PeerFrame::P2pHandshake {
                    from: me,
                    step: HandshakeStep::Ack,
                };
                self.peer_net.send_to(&ack, source)?;
                Ok(())
            }
            (HandshakeStep::Ack, Some(HandshakePhase::OfferSent)) => {
                // The ACK's source address is where the peer really is.
                self.sessions.establish_p2p(from, source);
                self.events.dispatch(ClientEvent::ModeChanged {
                    peer: from.to_string(),
                    mode: ChatMode::P2p,
                });
                let me = self.sender_name()?;
                let confirm = PeerFrame::P2pHandshake {
                    from: me,
                    step: HandshakeStep::Confirm,
                };
                if let Err(e) = self.peer_net.send_to(&confirm, source) {
                    log::warn!("confirm to {from} not delivered: {e}");
                }
                // Initiator forces a fresh key for the new path.
                self.begin_rekey(from)?;
                Ok(())
            }
            (HandshakeStep::Confirm, Some(HandshakePhase::AwaitingOffer)) => {
                self.sessions.establish_p2p(from, source);
                self.events.dispatch(ClientEvent::ModeChanged {
                    peer: from.to_string(),
                    mode: ChatMode::P2p,
                });
                Ok(())
            }
            (step, phase) => {
                log::debug!(
                    "ignoring {step:?} from {from} at {source} (phase {phase:?})"
                );
                Ok(())
            }
        }
    }
}

fn content_from_parts(
    kind: PayloadKind,
    data: Vec<u8>,
) -> Result<MessageContent, std::string::FromUtf8Error> {
    match kind {
        PayloadKind::Text => Ok(MessageContent::Text(String::from_utf8(data)?)),
        PayloadKind::File { filename } => Ok(MessageContent::File { filename, data }),
        PayloadKind::Image => Ok(MessageContent::Image(data)),
    }
}
