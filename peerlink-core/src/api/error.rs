//! Client Error Types

use thiserror::Error;

use crate::crypto::CryptoError;
use crate::network::NetworkError;
use crate::session::KeyError;

pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by [`Messenger`](super::Messenger) operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Cryptography error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Session key error: {0}")]
    SessionKey(#[from] KeyError),

    #[error("Not logged in")]
    NotLoggedIn,

    #[error("'{0}' is not in the friends list")]
    UnknownPeer(String),

    #[error("'{0}' is offline")]
    PeerOffline(String),

    #[error("A mode switch with '{0}' is already pending")]
    HandshakePending(String),

    #[error("Received payload is not valid for its kind: {0}")]
    InvalidPayload(String),
}
