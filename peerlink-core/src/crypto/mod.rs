//! Cryptographic Primitives
//!
//! AES-256-GCM message encryption under per-peer session keys, HKDF-SHA256
//! key derivation, and X25519-based wrapping for moving session keys to a
//! peer. Session keys are symmetric and short-lived; losing one to an
//! attacker exposes every message it protected, past and future, because no
//! ratchet runs underneath.

pub mod encryption;
pub mod kdf;
pub mod keywrap;

use thiserror::Error;

pub use encryption::{decrypt, encrypt, SessionKey};
pub use kdf::HKDF;
pub use keywrap::{decode_public_key, unwrap_session_key, wrap_session_key, IdentityKeyPair};

/// Errors raised by the crypto layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: data may be corrupted or key mismatch")]
    DecryptionFailed,

    #[error("Ciphertext too short")]
    CiphertextTooShort,

    #[error("Invalid public key encoding")]
    InvalidPublicKey,

    #[error("Session key unwrap failed")]
    UnwrapFailed,

    #[error("Random generation failed")]
    RandomFailed,
}
