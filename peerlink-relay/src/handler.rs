//! Client Connection Handler
//!
//! Each connection gets a read loop plus a write task fed through an
//! unbounded queue; the queue sender doubles as the delivery handle other
//! connections use to push frames at this client. Relayed payloads are
//! rewritten before forwarding: the addressing field is dropped and the
//! authenticated sender is injected, so a client can never spoof `from`.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

use peerlink_core::network::{decode_frame, encode_frame};
use peerlink_core::{
    CipherEnvelope, ClientFrame, FriendInfo, PresenceStatus, ResponseAction, ResponseStatus,
    ServerFrame, WireMode,
};

use crate::presence::PresenceEntry;
use crate::RelayState;

pub async fn handle_connection(state: Arc<RelayState>, stream: TcpStream, addr: SocketAddr) {
    let conn_id = state.next_conn_id();
    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(write_loop(write_half, rx));

    let mut connection = Connection {
        conn_id,
        addr,
        state,
        tx,
        user: None,
    };
    connection.read_loop(read_half).await;
    connection.logout_cleanup();
}

async fn write_loop(mut write_half: OwnedWriteHalf, mut rx: UnboundedReceiver<ServerFrame>) {
    while let Some(frame) = rx.recv().await {
        let bytes = match encode_frame(&frame) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("dropping unencodable frame: {e}");
                continue;
            }
        };
        if write_half.write_all(&bytes).await.is_err() {
            break;
        }
    }
    let _ = write_half.shutdown().await;
}

struct Connection {
    conn_id: u64,
    addr: SocketAddr,
    state: Arc<RelayState>,
    tx: UnboundedSender<ServerFrame>,
    user: Option<String>,
}

impl Connection {
    async fn read_loop(&mut self, read_half: OwnedReadHalf) {
        let max_line = self.state.config.max_line_bytes;
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => return,
                Ok(n) => {
                    if n > max_line {
                        warn!("dropping oversized {n}-byte frame from {}", self.addr);
                        continue;
                    }
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match decode_frame::<ClientFrame>(trimmed.as_bytes()) {
                        Ok(frame) => self.dispatch(frame),
                        Err(e) => warn!("malformed frame from {}: {e}", self.addr),
                    }
                }
                Err(e) => {
                    debug!("read error from {}: {e}", self.addr);
                    return;
                }
            }
        }
    }

    fn dispatch(&mut self, frame: ClientFrame) {
        match frame {
            ClientFrame::Register {
                username,
                password,
                email,
                code,
                public_key,
            } => self.handle_register(&username, &password, &email, &code, &public_key),
            ClientFrame::Login {
                username,
                password,
                p2p_port,
                public_key,
            } => self.handle_login(&username, &password, p2p_port, &public_key),
            ClientFrame::RequestVerificationCode { email } => self.handle_request_code(&email),
            frame => {
                // Everything else requires a live, non-evicted login.
                let Some(user) = self.authenticated_user() else {
                    self.respond_err(action_of(&frame), "Not logged in".to_string(), None);
                    return;
                };
                self.dispatch_authenticated(&user, frame);
            }
        }
    }

    fn dispatch_authenticated(&mut self, user: &str, frame: ClientFrame) {
        match frame {
            ClientFrame::GetPublicKey { username } => match self.state.directory.public_key_of(&username) {
                Ok(public_key) => self.send(ServerFrame::PublicKeyResponse {
                    username,
                    public_key,
                }),
                Err(e) => {
                    self.respond_err(ResponseAction::GetPublicKey, e.to_string(), Some(username))
                }
            },
            ClientFrame::GetFriends {} => {
                self.send(ServerFrame::AllFriendsList {
                    friends: self.friend_list(user),
                });
            }
            ClientFrame::AddFriend { username } => self.handle_add_friend(user, &username),
            ClientFrame::DeleteFriend { username } => self.handle_delete_friend(user, &username),
            ClientFrame::RelayMessage { to, message } => self.handle_relay_message(user, to, message),
            ClientFrame::RelaySessionKey { to, wrapped_key } => {
                self.relay_or_error(
                    &to,
                    ServerFrame::ReceiveSessionKey {
                        from: user.to_string(),
                        wrapped_key,
                    },
                    ResponseAction::RelaySessionKey,
                );
            }
            ClientFrame::ModeChangeRequest {
                target,
                requested_mode,
                request_id,
            } => self.handle_mode_request(user, target, requested_mode, request_id),
            ClientFrame::ModeChangeResponse {
                to,
                request_id,
                accepted,
                requested_mode,
            } => {
                // Responses and notifications to a vanished peer are dropped:
                // the requester's own deadline handles the dead end.
                self.relay_or_drop(
                    user,
                    &to,
                    ServerFrame::ModeChangeResponse {
                        from: user.to_string(),
                        request_id,
                        accepted,
                        requested_mode,
                    },
                );
            }
            ClientFrame::ModeChangeNotification { to, mode } => {
                self.relay_or_drop(
                    user,
                    &to,
                    ServerFrame::ModeChangeNotification {
                        from: user.to_string(),
                        mode,
                    },
                );
            }
            ClientFrame::Logout {} => {
                self.send(ServerFrame::LogoutResponse {});
                self.logout_cleanup();
            }
            // Pre-auth frames never reach this point.
            ClientFrame::Register { .. }
            | ClientFrame::Login { .. }
            | ClientFrame::RequestVerificationCode { .. } => {}
        }
    }

    // ===== Account handling =====

    fn handle_register(&self, username: &str, password: &str, email: &str, code: &str, public_key: &str) {
        match self
            .state
            .directory
            .register(username, password, email, code, public_key)
        {
            Ok(()) => {
                info!("registered new user {username}");
                self.respond_ok(ResponseAction::Register, "Registration successful");
            }
            Err(e) => self.respond_err(ResponseAction::Register, e.to_string(), None),
        }
    }

    fn handle_request_code(&self, email: &str) {
        match self.state.directory.issue_code(email) {
            Ok(()) => self.respond_ok(
                ResponseAction::RequestVerificationCode,
                "Verification code sent",
            ),
            Err(e) => self.respond_err(ResponseAction::RequestVerificationCode, e.to_string(), None),
        }
    }

    fn handle_login(&mut self, username: &str, password: &str, p2p_port: u16, public_key: &str) {
        if self.authenticated_user().is_some() {
            self.respond_err(ResponseAction::Login, "Already logged in".to_string(), None);
            return;
        }
        if let Err(e) = self.state.directory.login(username, password, public_key) {
            self.respond_err(ResponseAction::Login, e.to_string(), None);
            return;
        }

        let entry = PresenceEntry {
            conn_id: self.conn_id,
            sender: self.tx.clone(),
            ip: self.addr.ip(),
            p2p_port,
        };
        if self.state.presence.add_or_replace(username, entry).is_some() {
            info!("{username} logged in again; previous connection loses the session");
        }
        self.user = Some(username.to_string());
        info!("{username} logged in from {}", self.addr);
        self.respond_ok(ResponseAction::Login, "Login successful");
        self.broadcast_presence(username, PresenceStatus::Online);
    }

    /// The username this connection may act for. A connection whose login
    /// was taken over by a newer one is treated as logged out.
    fn authenticated_user(&mut self) -> Option<String> {
        let user = self.user.clone()?;
        let owns = self
            .state
            .presence
            .lookup(&user)
            .is_some_and(|e| e.conn_id == self.conn_id);
        if !owns {
            debug!("connection {} lost ownership of {user}", self.conn_id);
            self.user = None;
            return None;
        }
        Some(user)
    }

    fn logout_cleanup(&mut self) {
        if let Some(user) = self.user.take() {
            if self.state.presence.remove_if_owner(&user, self.conn_id) {
                info!("{user} logged out");
                self.broadcast_presence(&user, PresenceStatus::Offline);
            }
        }
    }

    // ===== Friends =====

    fn friend_list(&self, user: &str) -> Vec<FriendInfo> {
        self.state
            .directory
            .friends_of(user)
            .into_iter()
            .map(|name| match self.state.presence.lookup(&name) {
                Some(entry) => FriendInfo::online(name, entry.ip, entry.p2p_port),
                None => FriendInfo::offline(name),
            })
            .collect()
    }

    fn handle_add_friend(&self, user: &str, target: &str) {
        match self.state.directory.add_friend(user, target) {
            Ok(()) => {
                self.respond_ok(ResponseAction::AddFriend, format!("'{target}' added"));
                self.push_friend_list(user);
                self.push_friend_list(target);
            }
            Err(e) => self.respond_err(ResponseAction::AddFriend, e.to_string(), None),
        }
    }

    fn handle_delete_friend(&self, user: &str, target: &str) {
        match self.state.directory.remove_friend(user, target) {
            Ok(()) => {
                self.respond_ok(ResponseAction::DeleteFriend, format!("'{target}' removed"));
                self.push_friend_list(user);
                if let Some(entry) = self.state.presence.lookup(target) {
                    let _ = entry.sender.send(ServerFrame::FriendRemoved {
                        username: user.to_string(),
                    });
                }
            }
            Err(e) => self.respond_err(ResponseAction::DeleteFriend, e.to_string(), None),
        }
    }

    /// Pushes a fresh friends list so both ends see graph changes without
    /// asking.
    fn push_friend_list(&self, user: &str) {
        if let Some(entry) = self.state.presence.lookup(user) {
            let _ = entry.sender.send(ServerFrame::AllFriendsList {
                friends: self.friend_list(user),
            });
        }
    }

    fn broadcast_presence(&self, username: &str, status: PresenceStatus) {
        let (ip, port) = match self.state.presence.lookup(username) {
            Some(entry) if status == PresenceStatus::Online => {
                (Some(entry.ip), Some(entry.p2p_port))
            }
            _ => (None, None),
        };
        for friend in self.state.directory.friends_of(username) {
            if let Some(entry) = self.state.presence.lookup(&friend) {
                let _ = entry.sender.send(ServerFrame::FriendStatusUpdate {
                    username: username.to_string(),
                    status,
                    ip,
                    port,
                });
            }
        }
    }

    // ===== Forwarding =====

    fn handle_relay_message(&self, user: &str, to: String, message: CipherEnvelope) {
        self.relay_or_error(
            &to,
            ServerFrame::ReceiveMessage {
                from: user.to_string(),
                message,
            },
            ResponseAction::RelayMessage,
        );
    }

    fn handle_mode_request(
        &self,
        user: &str,
        target: String,
        requested_mode: WireMode,
        request_id: String,
    ) {
        if !self.state.directory.are_friends(user, &target) {
            self.respond_err(
                ResponseAction::ModeChange,
                format!("'{target}' is not in your friends list"),
                Some(target),
            );
            return;
        }
        self.relay_or_error(
            &target,
            ServerFrame::ModeChangeRequest {
                from: user.to_string(),
                requested_mode,
                request_id,
            },
            ResponseAction::ModeChange,
        );
    }

    /// Delivers `frame` to `recipient`, answering the sender with a
    /// structured error naming the recipient when delivery is impossible.
    fn relay_or_error(&self, recipient: &str, frame: ServerFrame, action: ResponseAction) {
        let delivered = self
            .state
            .presence
            .lookup(recipient)
            .is_some_and(|entry| entry.sender.send(frame).is_ok());
        if !delivered {
            self.respond_err(
                action,
                format!("User '{recipient}' is offline"),
                Some(recipient.to_string()),
            );
        }
    }

    fn relay_or_drop(&self, user: &str, recipient: &str, frame: ServerFrame) {
        if !self.state.directory.are_friends(user, recipient) {
            debug!("dropping frame from {user} for non-friend {recipient}");
            return;
        }
        let delivered = self
            .state
            .presence
            .lookup(recipient)
            .is_some_and(|entry| entry.sender.send(frame).is_ok());
        if !delivered {
            debug!("dropping frame from {user} for offline {recipient}");
        }
    }

    // ===== Wire helpers =====

    fn send(&self, frame: ServerFrame) {
        // A closed queue means the write task is gone; the read loop will
        // notice on its own.
        let _ = self.tx.send(frame);
    }

    fn respond_ok(&self, action: ResponseAction, message: impl Into<String>) {
        self.send(ServerFrame::Response {
            action,
            status: ResponseStatus::Success,
            message: message.into(),
            user: None,
        });
    }

    fn respond_err(&self, action: ResponseAction, message: String, user: Option<String>) {
        self.send(ServerFrame::Response {
            action,
            status: ResponseStatus::Error,
            message,
            user,
        });
    }
}

fn action_of(frame: &ClientFrame) -> ResponseAction {
    match frame {
        ClientFrame::Register { .. } => ResponseAction::Register,
        ClientFrame::Login { .. } => ResponseAction::Login,
        ClientFrame::RequestVerificationCode { .. } => ResponseAction::RequestVerificationCode,
        ClientFrame::GetPublicKey { .. } => ResponseAction::GetPublicKey,
        ClientFrame::GetFriends {} => ResponseAction::GetFriends,
        ClientFrame::AddFriend { .. } => ResponseAction::AddFriend,
        ClientFrame::DeleteFriend { .. } => ResponseAction::DeleteFriend,
        ClientFrame::RelayMessage { .. } => ResponseAction::RelayMessage,
        ClientFrame::RelaySessionKey { .. } => ResponseAction::RelaySessionKey,
        ClientFrame::ModeChangeRequest { .. }
        | ClientFrame::ModeChangeResponse { .. }
        | ClientFrame::ModeChangeNotification { .. } => ResponseAction::ModeChange,
        ClientFrame::Logout {} => ResponseAction::Logout,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::directory::{Directory, MemoryDirectory};
    use peerlink_core::PayloadKind;
    use std::time::Duration;

    fn test_state() -> Arc<RelayState> {
        let directory = MemoryDirectory::new(Duration::from_secs(600));
        directory.seed_user("alice", "pw-a", "a@example.com", "PK_ALICE");
        directory.seed_user("bob", "pw-b", "b@example.com", "PK_BOB");
        directory.seed_user("charlie", "pw-c", "c@example.com", "PK_CHARLIE");
        directory.add_friend("alice", "bob").unwrap();
        Arc::new(RelayState::new(RelayConfig::default(), Arc::new(directory)))
    }

    fn connection(
        state: &Arc<RelayState>,
        port: u16,
    ) -> (Connection, UnboundedReceiver<ServerFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Connection {
            conn_id: state.next_conn_id(),
            addr: format!("10.7.0.{port}:{port}").parse().unwrap(),
            state: state.clone(),
            tx,
            user: None,
        };
        (conn, rx)
    }

    fn login(conn: &mut Connection, rx: &mut UnboundedReceiver<ServerFrame>, name: &str, pw: &str) {
        conn.dispatch(ClientFrame::Login {
            username: name.to_string(),
            password: pw.to_string(),
            p2p_port: 4100,
            public_key: format!("PK_{}", name.to_uppercase()),
        });
        match rx.try_recv().unwrap() {
            ServerFrame::Response {
                action: ResponseAction::Login,
                status: ResponseStatus::Success,
                ..
            } => {}
            other => panic!("login failed: {other:?}"),
        }
    }

    fn drain(rx: &mut UnboundedReceiver<ServerFrame>) -> Vec<ServerFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    fn envelope(text: &str) -> CipherEnvelope {
        CipherEnvelope {
            content: text.to_string(),
            timestamp: 1,
            kind: PayloadKind::Text,
        }
    }

    #[test]
    fn test_unauthenticated_requests_rejected() {
        let state = test_state();
        let (mut conn, mut rx) = connection(&state, 1);
        conn.dispatch(ClientFrame::GetFriends {});
        match rx.try_recv().unwrap() {
            ServerFrame::Response {
                action: ResponseAction::GetFriends,
                status: ResponseStatus::Error,
                message,
                ..
            } => assert_eq!(message, "Not logged in"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_login_rejects_bad_credentials() {
        let state = test_state();
        let (mut conn, mut rx) = connection(&state, 1);
        conn.dispatch(ClientFrame::Login {
            username: "alice".to_string(),
            password: "wrong".to_string(),
            p2p_port: 4100,
            public_key: "PK".to_string(),
        });
        assert!(matches!(
            rx.try_recv().unwrap(),
            ServerFrame::Response {
                action: ResponseAction::Login,
                status: ResponseStatus::Error,
                ..
            }
        ));
        assert!(!state.presence.is_online("alice"));
    }

    #[test]
    fn test_login_broadcasts_presence_to_online_friends() {
        let state = test_state();
        let (mut bob_conn, mut bob_rx) = connection(&state, 2);
        login(&mut bob_conn, &mut bob_rx, "bob", "pw-b");

        let (mut alice_conn, mut alice_rx) = connection(&state, 1);
        login(&mut alice_conn, &mut alice_rx, "alice", "pw-a");

        let update = drain(&mut bob_rx)
            .into_iter()
            .find_map(|f| match f {
                ServerFrame::FriendStatusUpdate {
                    username,
                    status,
                    ip,
                    port,
                } => Some((username, status, ip, port)),
                _ => None,
            })
            .unwrap();
        assert_eq!(update.0, "alice");
        assert_eq!(update.1, PresenceStatus::Online);
        assert_eq!(update.2, Some(alice_conn.addr.ip()));
        assert_eq!(update.3, Some(4100));
        assert!(state.presence.is_online("alice"));
    }

    #[test]
    fn test_relay_injects_authenticated_sender() {
        let state = test_state();
        let (mut alice_conn, mut alice_rx) = connection(&state, 1);
        let (mut bob_conn, mut bob_rx) = connection(&state, 2);
        login(&mut alice_conn, &mut alice_rx, "alice", "pw-a");
        login(&mut bob_conn, &mut bob_rx, "bob", "pw-b");
        drain(&mut bob_rx);

        alice_conn.dispatch(ClientFrame::RelayMessage {
            to: "bob".to_string(),
            message: envelope("ciphertext"),
        });

        match bob_rx.try_recv().unwrap() {
            ServerFrame::ReceiveMessage { from, message } => {
                assert_eq!(from, "alice");
                assert_eq!(message.content, "ciphertext");
            }
            other => panic!("unexpected {other:?}"),
        }
        // No error came back to the sender.
        assert!(drain(&mut alice_rx).is_empty());
    }

    #[test]
    fn test_relay_to_offline_names_recipient() {
        let state = test_state();
        let (mut alice_conn, mut alice_rx) = connection(&state, 1);
        login(&mut alice_conn, &mut alice_rx, "alice", "pw-a");

        alice_conn.dispatch(ClientFrame::RelayMessage {
            to: "bob".to_string(),
            message: envelope("x"),
        });
        match alice_rx.try_recv().unwrap() {
            ServerFrame::Response {
                action: ResponseAction::RelayMessage,
                status: ResponseStatus::Error,
                user,
                ..
            } => assert_eq!(user.as_deref(), Some("bob")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_relogin_evicts_previous_connection() {
        let state = test_state();
        let (mut first, mut first_rx) = connection(&state, 1);
        login(&mut first, &mut first_rx, "alice", "pw-a");
        let first_id = first.conn_id;

        let (mut second, mut second_rx) = connection(&state, 3);
        login(&mut second, &mut second_rx, "alice", "pw-a");
        assert_ne!(state.presence.lookup("alice").unwrap().conn_id, first_id);

        // The evicted connection has lost its authority.
        first.dispatch(ClientFrame::GetFriends {});
        assert!(matches!(
            first_rx.try_recv().unwrap(),
            ServerFrame::Response {
                status: ResponseStatus::Error,
                ..
            }
        ));

        // Its teardown must not log out the successor.
        first.logout_cleanup();
        assert!(state.presence.is_online("alice"));
    }

    #[test]
    fn test_get_friends_reflects_presence() {
        let state = test_state();
        let (mut alice_conn, mut alice_rx) = connection(&state, 1);
        login(&mut alice_conn, &mut alice_rx, "alice", "pw-a");

        alice_conn.dispatch(ClientFrame::GetFriends {});
        match alice_rx.try_recv().unwrap() {
            ServerFrame::AllFriendsList { friends } => {
                assert_eq!(friends.len(), 1);
                assert_eq!(friends[0].username, "bob");
                assert!(!friends[0].is_online());
            }
            other => panic!("unexpected {other:?}"),
        }

        let (mut bob_conn, mut bob_rx) = connection(&state, 2);
        login(&mut bob_conn, &mut bob_rx, "bob", "pw-b");
        alice_conn.dispatch(ClientFrame::GetFriends {});
        let frames = drain(&mut alice_rx);
        let listed = frames
            .iter()
            .find_map(|f| match f {
                ServerFrame::AllFriendsList { friends } => Some(friends.clone()),
                _ => None,
            })
            .unwrap();
        assert!(listed[0].is_online());
        assert_eq!(listed[0].port, Some(4100));
    }

    #[test]
    fn test_add_friend_pushes_lists_to_both() {
        let state = test_state();
        let (mut alice_conn, mut alice_rx) = connection(&state, 1);
        let (mut charlie_conn, mut charlie_rx) = connection(&state, 4);
        login(&mut alice_conn, &mut alice_rx, "alice", "pw-a");
        login(&mut charlie_conn, &mut charlie_rx, "charlie", "pw-c");

        alice_conn.dispatch(ClientFrame::AddFriend {
            username: "charlie".to_string(),
        });

        let alice_frames = drain(&mut alice_rx);
        assert!(alice_frames.iter().any(|f| matches!(
            f,
            ServerFrame::Response {
                action: ResponseAction::AddFriend,
                status: ResponseStatus::Success,
                ..
            }
        )));
        assert!(alice_frames
            .iter()
            .any(|f| matches!(f, ServerFrame::AllFriendsList { .. })));
        assert!(drain(&mut charlie_rx)
            .iter()
            .any(|f| matches!(f, ServerFrame::AllFriendsList { .. })));
    }

    #[test]
    fn test_delete_friend_notifies_target() {
        let state = test_state();
        let (mut alice_conn, mut alice_rx) = connection(&state, 1);
        let (mut bob_conn, mut bob_rx) = connection(&state, 2);
        login(&mut alice_conn, &mut alice_rx, "alice", "pw-a");
        login(&mut bob_conn, &mut bob_rx, "bob", "pw-b");
        drain(&mut bob_rx);

        alice_conn.dispatch(ClientFrame::DeleteFriend {
            username: "bob".to_string(),
        });
        assert!(drain(&mut bob_rx).iter().any(|f| matches!(
            f,
            ServerFrame::FriendRemoved { username } if username == "alice"
        )));
        assert!(!state.directory.are_friends("alice", "bob"));
    }

    #[test]
    fn test_mode_request_requires_friendship() {
        let state = test_state();
        let (mut alice_conn, mut alice_rx) = connection(&state, 1);
        let (mut charlie_conn, mut charlie_rx) = connection(&state, 4);
        login(&mut alice_conn, &mut alice_rx, "alice", "pw-a");
        login(&mut charlie_conn, &mut charlie_rx, "charlie", "pw-c");

        alice_conn.dispatch(ClientFrame::ModeChangeRequest {
            target: "charlie".to_string(),
            requested_mode: WireMode::P2p,
            request_id: "r1".to_string(),
        });
        assert!(matches!(
            alice_rx.try_recv().unwrap(),
            ServerFrame::Response {
                action: ResponseAction::ModeChange,
                status: ResponseStatus::Error,
                ..
            }
        ));
        assert!(drain(&mut charlie_rx).is_empty());
    }

    #[test]
    fn test_mode_request_forwards_with_sender() {
        let state = test_state();
        let (mut alice_conn, mut alice_rx) = connection(&state, 1);
        let (mut bob_conn, mut bob_rx) = connection(&state, 2);
        login(&mut alice_conn, &mut alice_rx, "alice", "pw-a");
        login(&mut bob_conn, &mut bob_rx, "bob", "pw-b");
        drain(&mut bob_rx);

        alice_conn.dispatch(ClientFrame::ModeChangeRequest {
            target: "bob".to_string(),
            requested_mode: WireMode::P2p,
            request_id: "r42".to_string(),
        });
        match bob_rx.try_recv().unwrap() {
            ServerFrame::ModeChangeRequest {
                from,
                requested_mode,
                request_id,
            } => {
                assert_eq!(from, "alice");
                assert_eq!(requested_mode, WireMode::P2p);
                assert_eq!(request_id, "r42");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_mode_response_to_offline_is_silent() {
        let state = test_state();
        let (mut alice_conn, mut alice_rx) = connection(&state, 1);
        login(&mut alice_conn, &mut alice_rx, "alice", "pw-a");

        alice_conn.dispatch(ClientFrame::ModeChangeResponse {
            to: "bob".to_string(),
            request_id: "r1".to_string(),
            accepted: true,
            requested_mode: WireMode::P2p,
        });
        alice_conn.dispatch(ClientFrame::ModeChangeNotification {
            to: "bob".to_string(),
            mode: WireMode::Cs,
        });
        assert!(drain(&mut alice_rx).is_empty());
    }

    #[test]
    fn test_logout_broadcasts_offline_without_endpoint() {
        let state = test_state();
        let (mut alice_conn, mut alice_rx) = connection(&state, 1);
        let (mut bob_conn, mut bob_rx) = connection(&state, 2);
        login(&mut alice_conn, &mut alice_rx, "alice", "pw-a");
        login(&mut bob_conn, &mut bob_rx, "bob", "pw-b");
        drain(&mut bob_rx);

        alice_conn.dispatch(ClientFrame::Logout {});
        assert!(matches!(
            alice_rx.try_recv().unwrap(),
            ServerFrame::LogoutResponse {}
        ));
        assert!(!state.presence.is_online("alice"));
        match drain(&mut bob_rx).pop().unwrap() {
            ServerFrame::FriendStatusUpdate {
                username,
                status,
                ip,
                port,
            } => {
                assert_eq!(username, "alice");
                assert_eq!(status, PresenceStatus::Offline);
                assert_eq!(ip, None);
                assert_eq!(port, None);
            }
            other => panic!("unexpected {other:?}"),
        }

        // The connection can log in again on the same socket.
        login(&mut alice_conn, &mut alice_rx, "alice", "pw-a");
        assert!(state.presence.is_online("alice"));
    }
}
