//! Session Key Wrapping
//!
//! Carries a session key to a peer using only their long-term X25519 public
//! key: a fresh ephemeral key pair, Diffie-Hellman against the recipient's
//! static key, HKDF-SHA256 to a key-encryption key, then AES-256-GCM over
//! the session key bytes.
//!
//! Wire blob (base64): `ephemeral_pub (32) || nonce (12) || ciphertext+tag`.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::rngs::OsRng;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::digest;
use ring::rand::{SecureRandom, SystemRandom};
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};
use zeroize::Zeroize;

use super::encryption::{SessionKey, KEY_SIZE};
use super::kdf::HKDF;
use super::CryptoError;

const WRAP_INFO: &[u8] = b"peerlink session key wrap v1";
const PUBLIC_KEY_SIZE: usize = 32;

/// Long-term X25519 identity key pair.
///
/// The public half is registered with the relay directory; peers fetch it
/// to wrap session keys for us.
#[derive(Clone)]
pub struct IdentityKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl IdentityKeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        IdentityKeyPair { secret, public }
    }

    /// Restores a key pair from stored secret bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        IdentityKeyPair { secret, public }
    }

    pub fn public_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        self.public.as_bytes()
    }

    /// Base64 form of the public key, as stored in the directory.
    pub fn public_base64(&self) -> String {
        BASE64.encode(self.public.as_bytes())
    }

    /// Secret bytes for persistence by the caller.
    pub fn secret_bytes(&self) -> [u8; KEY_SIZE] {
        self.secret.to_bytes()
    }

    /// Short hex fingerprint of the public key, for logs and UIs.
    pub fn fingerprint(&self) -> String {
        let hash = digest::digest(&digest::SHA256, self.public.as_bytes());
        hex::encode(&hash.as_ref()[..8])
    }
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

/// Decodes a base64 public key fetched from the directory.
pub fn decode_public_key(encoded: &str) -> Result<[u8; PUBLIC_KEY_SIZE], CryptoError> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|_| CryptoError::InvalidPublicKey)?;
    bytes.try_into().map_err(|_| CryptoError::InvalidPublicKey)
}

/// Wraps `key` so only the holder of `their_public` can recover it.
pub fn wrap_session_key(
    their_public: &[u8; PUBLIC_KEY_SIZE],
    key: &SessionKey,
) -> Result<String, CryptoError> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&PublicKey::from(*their_public));
    let mut kek = HKDF::derive_key(None, shared.as_bytes(), WRAP_INFO);

    let rng = SystemRandom::new();
    let mut nonce_bytes = [0u8; NONCE_LEN];
    if rng.fill(&mut nonce_bytes).is_err() {
        kek.zeroize();
        return Err(CryptoError::RandomFailed);
    }

    let unbound = match UnboundKey::new(&AES_256_GCM, &kek) {
        Ok(k) => k,
        Err(_) => {
            kek.zeroize();
            return Err(CryptoError::EncryptionFailed);
        }
    };
    kek.zeroize();
    let sealing = LessSafeKey::new(unbound);

    let mut in_out = key.as_bytes().to_vec();
    sealing
        .seal_in_place_append_tag(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::empty(),
            &mut in_out,
        )
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut blob = Vec::with_capacity(PUBLIC_KEY_SIZE + NONCE_LEN + in_out.len());
    blob.extend_from_slice(ephemeral_public.as_bytes());
    blob.extend_from_slice(&nonce_bytes);
    blob.extend_from_slice(&in_out);
    Ok(BASE64.encode(blob))
}

/// Recovers a session key wrapped for our identity key.
pub fn unwrap_session_key(
    identity: &IdentityKeyPair,
    wrapped: &str,
) -> Result<SessionKey, CryptoError> {
    let blob = BASE64.decode(wrapped).map_err(|_| CryptoError::UnwrapFailed)?;
    if blob.len() < PUBLIC_KEY_SIZE + NONCE_LEN + AES_256_GCM.tag_len() {
        return Err(CryptoError::UnwrapFailed);
    }

    let ephemeral_public: [u8; PUBLIC_KEY_SIZE] = blob[..PUBLIC_KEY_SIZE]
        .try_into()
        .map_err(|_| CryptoError::UnwrapFailed)?;
    let nonce_bytes: [u8; NONCE_LEN] = blob[PUBLIC_KEY_SIZE..PUBLIC_KEY_SIZE + NONCE_LEN]
        .try_into()
        .map_err(|_| CryptoError::UnwrapFailed)?;

    let shared = identity
        .secret
        .diffie_hellman(&PublicKey::from(ephemeral_public));
    let mut kek = HKDF::derive_key(None, shared.as_bytes(), WRAP_INFO);

    let unbound = match UnboundKey::new(&AES_256_GCM, &kek) {
        Ok(k) => k,
        Err(_) => {
            kek.zeroize();
            return Err(CryptoError::UnwrapFailed);
        }
    };
    kek.zeroize();
    let opening = LessSafeKey::new(unbound);

    let nonce = Nonce::assume_unique_for_key(nonce_bytes);
    let mut buffer = blob[PUBLIC_KEY_SIZE + NONCE_LEN..].to_vec();
    let plain = opening
        .open_in_place(nonce, Aad::empty(), &mut buffer)
        .map_err(|_| CryptoError::UnwrapFailed)?;

    if plain.len() != KEY_SIZE {
        return Err(CryptoError::UnwrapFailed);
    }
    let mut key_bytes = [0u8; KEY_SIZE];
    key_bytes.copy_from_slice(plain);
    Ok(SessionKey::from_bytes(key_bytes))
}
