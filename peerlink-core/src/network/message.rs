//! Wire Message Types
//!
//! Every record on the wire is a single JSON object with a `type` tag and a
//! `payload` object. Three frame families exist: client-to-server
//! ([`ClientFrame`]), server-to-client ([`ServerFrame`]), and direct
//! peer-to-peer datagrams ([`PeerFrame`]).
//!
//! Encrypted message bodies travel as a [`CipherEnvelope`]: base64 ciphertext
//! plus plaintext routing metadata (timestamp and payload kind). The relay
//! never sees inside the envelope.

use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Transport mode identifier as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireMode {
    Cs,
    P2p,
}

/// Step tag of a direct connection handshake datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeStep {
    Offer,
    Ack,
    Confirm,
}

/// Presence of an identity as reported by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Offline,
}

/// Kind of plaintext carried inside a [`CipherEnvelope`].
///
/// Serialized flat into the envelope, so a file message reads
/// `{"kind": "file", "filename": "notes.pdf", ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PayloadKind {
    Text,
    File { filename: String },
    Image,
}

/// An end-to-end encrypted message body.
///
/// `content` is the base64 AEAD blob (`nonce || ciphertext || tag`); the
/// remaining fields are plaintext metadata the receiving side needs before
/// it can decrypt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CipherEnvelope {
    /// Base64-encoded ciphertext blob.
    pub content: String,
    /// Sender clock, seconds since the Unix epoch.
    pub timestamp: u64,
    #[serde(flatten)]
    pub kind: PayloadKind,
}

impl CipherEnvelope {
    /// Wraps already-encrypted content with the current time.
    pub fn new(content: String, kind: PayloadKind) -> Self {
        CipherEnvelope {
            content,
            timestamp: unix_timestamp(),
            kind,
        }
    }
}

/// Seconds since the Unix epoch.
pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// One friend as reported by the relay. Address fields are present only
/// while the friend is online.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FriendInfo {
    pub username: String,
    pub status: PresenceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl FriendInfo {
    pub fn online(username: impl Into<String>, ip: IpAddr, port: u16) -> Self {
        FriendInfo {
            username: username.into(),
            status: PresenceStatus::Online,
            ip: Some(ip),
            port: Some(port),
        }
    }

    pub fn offline(username: impl Into<String>) -> Self {
        FriendInfo {
            username: username.into(),
            status: PresenceStatus::Offline,
            ip: None,
            port: None,
        }
    }

    pub fn is_online(&self) -> bool {
        self.status == PresenceStatus::Online
    }
}

/// Which client request a [`ServerFrame::Response`] answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseAction {
    Register,
    Login,
    RequestVerificationCode,
    GetPublicKey,
    GetFriends,
    AddFriend,
    DeleteFriend,
    RelayMessage,
    RelaySessionKey,
    ModeChange,
    Logout,
    #[serde(other)]
    Unknown,
}

/// Outcome tag of a [`ServerFrame::Response`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Success,
    Error,
}

/// Client-to-server frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientFrame {
    Register {
        username: String,
        password: String,
        email: String,
        code: String,
        /// Base64 X25519 public key stored by the directory.
        public_key: String,
    },
    Login {
        username: String,
        password: String,
        /// UDP port this client listens on for direct peer traffic.
        p2p_port: u16,
        /// Refreshes the stored public key for this identity.
        public_key: String,
    },
    RequestVerificationCode {
        email: String,
    },
    GetPublicKey {
        username: String,
    },
    GetFriends {},
    AddFriend {
        username: String,
    },
    DeleteFriend {
        username: String,
    },
    RelayMessage {
        to: String,
        message: CipherEnvelope,
    },
    RelaySessionKey {
        to: String,
        /// Base64 session key wrapped for the recipient's public key.
        wrapped_key: String,
    },
    ModeChangeRequest {
        target: String,
        requested_mode: WireMode,
        request_id: String,
    },
    ModeChangeResponse {
        to: String,
        request_id: String,
        accepted: bool,
        requested_mode: WireMode,
    },
    ModeChangeNotification {
        to: String,
        mode: WireMode,
    },
    Logout {},
}

/// Server-to-client frames.
///
/// Relayed traffic is rewritten on the way through: the server strips the
/// `to` field and injects the authenticated sender as `from`, so recipients
/// never trust a sender-claimed identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerFrame {
    Response {
        action: ResponseAction,
        status: ResponseStatus,
        message: String,
        /// Remote identity a routing error refers to, when one does.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user: Option<String>,
    },
    PublicKeyResponse {
        username: String,
        public_key: String,
    },
    AllFriendsList {
        friends: Vec<FriendInfo>,
    },
    FriendStatusUpdate {
        username: String,
        status: PresenceStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ip: Option<IpAddr>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
    },
    FriendRemoved {
        username: String,
    },
    ReceiveMessage {
        from: String,
        message: CipherEnvelope,
    },
    ReceiveSessionKey {
        from: String,
        wrapped_key: String,
    },
    ModeChangeRequest {
        from: String,
        requested_mode: WireMode,
        request_id: String,
    },
    ModeChangeResponse {
        from: String,
        request_id: String,
        accepted: bool,
        requested_mode: WireMode,
    },
    ModeChangeNotification {
        from: String,
        mode: WireMode,
    },
    LogoutResponse {},
}

/// Direct peer-to-peer datagram frames.
///
/// `from` is self-reported here; direct frames only carry ciphertext that
/// the session key already authenticates, so a forged `from` cannot decrypt
/// into anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum PeerFrame {
    P2pHandshake {
        from: String,
        step: HandshakeStep,
    },
    ReceiveMessage {
        from: String,
        message: CipherEnvelope,
    },
    ReceiveSessionKey {
        from: String,
        wrapped_key: String,
    },
    /// One piece of an oversized datagram; `data` is base64 raw bytes.
    Fragment {
        id: String,
        index: u32,
        total: u32,
        data: String,
    },
}
