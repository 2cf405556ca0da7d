//! Key Derivation
//!
//! HKDF-SHA256 (RFC 5869) built on ring's HMAC. Used to turn raw
//! Diffie-Hellman shared secrets into uniform AES keys.

use ring::hmac;

/// Output length of the underlying hash in bytes.
const HASH_LEN: usize = 32;

pub struct HKDF;

impl HKDF {
    /// Extract step: `PRK = HMAC-SHA256(salt, ikm)`.
    pub fn extract(salt: Option<&[u8]>, ikm: &[u8]) -> [u8; HASH_LEN] {
        let salt_bytes = salt.unwrap_or(&[0u8; HASH_LEN]);
        let key = hmac::Key::new(hmac::HMAC_SHA256, salt_bytes);
        let tag = hmac::sign(&key, ikm);
        let mut prk = [0u8; HASH_LEN];
        prk.copy_from_slice(tag.as_ref());
        prk
    }

    /// Expand step: grows the PRK into `length` output bytes bound to `info`.
    ///
    /// `length` must not exceed 255 * 32 bytes; callers here stay far below.
    pub fn expand(prk: &[u8; HASH_LEN], info: &[u8], length: usize) -> Vec<u8> {
        debug_assert!(length <= 255 * HASH_LEN);
        let key = hmac::Key::new(hmac::HMAC_SHA256, prk);
        let rounds = length.div_ceil(HASH_LEN);
        let mut okm = Vec::with_capacity(rounds * HASH_LEN);
        let mut previous: Vec<u8> = Vec::new();

        for round in 1..=rounds {
            let mut data = Vec::with_capacity(previous.len() + info.len() + 1);
            data.extend_from_slice(&previous);
            data.extend_from_slice(info);
            data.push(round as u8);
            let tag = hmac::sign(&key, &data);
            previous = tag.as_ref().to_vec();
            okm.extend_from_slice(&previous);
        }

        okm.truncate(length);
        okm
    }

    /// Extract-then-expand into a 32-byte key.
    pub fn derive_key(salt: Option<&[u8]>, ikm: &[u8], info: &[u8]) -> [u8; HASH_LEN] {
        let prk = Self::extract(salt, ikm);
        let okm = Self::expand(&prk, info, HASH_LEN);
        let mut key = [0u8; HASH_LEN];
        key.copy_from_slice(&okm);
        key
    }
}
