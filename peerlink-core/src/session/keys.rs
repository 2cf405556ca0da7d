//! Session Key Management
//!
//! Per-peer symmetric keys plus the early-arrival buffer: ciphertexts that
//! land before their key does are held back, in arrival order, and released
//! the moment a key is installed.

use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use thiserror::Error;

use crate::crypto::{self, CryptoError, SessionKey};
use crate::network::CipherEnvelope;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("No session key established with '{0}'")]
    Missing(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Outcome of feeding one inbound envelope through the key manager.
#[derive(Debug)]
pub enum InboundPayload {
    /// Key present and authentication passed.
    Ready {
        envelope: CipherEnvelope,
        plaintext: Vec<u8>,
    },
    /// No key yet; the envelope is buffered until one is installed.
    Buffered,
}

#[derive(Debug, Default)]
pub struct SessionKeyManager {
    keys: HashMap<String, SessionKey>,
    pending: HashMap<String, Vec<CipherEnvelope>>,
}

impl SessionKeyManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_key(&self, peer: &str) -> bool {
        self.keys.contains_key(peer)
    }

    /// Installs (or replaces) the key for `peer` and hands back every
    /// envelope buffered while waiting, in arrival order.
    pub fn install(&mut self, peer: &str, key: SessionKey) -> Vec<CipherEnvelope> {
        self.keys.insert(peer.to_string(), key);
        self.pending.remove(peer).unwrap_or_default()
    }

    /// Encrypts plaintext for `peer`, returning the base64 blob for a
    /// [`CipherEnvelope`].
    pub fn encrypt(&self, peer: &str, plaintext: &[u8]) -> Result<String, KeyError> {
        let key = self
            .keys
            .get(peer)
            .ok_or_else(|| KeyError::Missing(peer.to_string()))?;
        let blob = crypto::encrypt(key, plaintext)?;
        Ok(BASE64.encode(blob))
    }

    /// Decrypts an inbound envelope, or buffers it when no key is present.
    ///
    /// With a key installed, any authentication failure is a hard error for
    /// this envelope; it is never buffered for a retry.
    pub fn decrypt_or_buffer(
        &mut self,
        peer: &str,
        envelope: CipherEnvelope,
    ) -> Result<InboundPayload, KeyError> {
        let Some(key) = self.keys.get(peer) else {
            self.pending
                .entry(peer.to_string())
                .or_default()
                .push(envelope);
            return Ok(InboundPayload::Buffered);
        };
        let blob = BASE64
            .decode(&envelope.content)
            .map_err(|_| KeyError::Crypto(CryptoError::DecryptionFailed))?;
        let plaintext = crypto::decrypt(key, &blob)?;
        Ok(InboundPayload::Ready {
            envelope,
            plaintext,
        })
    }

    pub fn pending_count(&self, peer: &str) -> usize {
        self.pending.get(peer).map_or(0, |queue| queue.len())
    }

    /// Drops the key for `peer`. Buffered ciphertexts stay; they drain when
    /// a new key arrives.
    pub fn remove_key(&mut self, peer: &str) {
        self.keys.remove(peer);
    }

    /// Drops every key and every buffered envelope.
    pub fn clear(&mut self) {
        self.keys.clear();
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::PayloadKind;

    fn envelope_for(manager_with_key: &SessionKeyManager, peer: &str, text: &str) -> CipherEnvelope {
        let content = manager_with_key.encrypt(peer, text.as_bytes()).unwrap();
        CipherEnvelope {
            content,
            timestamp: 1,
            kind: PayloadKind::Text,
        }
    }

    #[test]
    fn test_encrypt_without_key_fails() {
        let manager = SessionKeyManager::new();
        assert_eq!(
            manager.encrypt("bob", b"hi"),
            Err(KeyError::Missing("bob".to_string()))
        );
    }

    #[test]
    fn test_early_envelopes_buffer_and_drain_in_order() {
        // Sender side has the key already.
        let mut sender = SessionKeyManager::new();
        let key = SessionKey::generate();
        sender.install("receiver", key.clone());

        let first = envelope_for(&sender, "receiver", "first");
        let second = envelope_for(&sender, "receiver", "second");
        let third = envelope_for(&sender, "receiver", "third");

        // Receiver has no key yet: everything buffers.
        let mut receiver = SessionKeyManager::new();
        for envelope in [first, second, third] {
            match receiver.decrypt_or_buffer("sender", envelope).unwrap() {
                InboundPayload::Buffered => {}
                other => panic!("expected buffering, got {other:?}"),
            }
        }
        assert_eq!(receiver.pending_count("sender"), 3);

        // Key arrives: drained envelopes decrypt in arrival order.
        let drained = receiver.install("sender", key);
        assert_eq!(drained.len(), 3);
        assert_eq!(receiver.pending_count("sender"), 0);

        let mut texts = Vec::new();
        for envelope in drained {
            match receiver.decrypt_or_buffer("sender", envelope).unwrap() {
                InboundPayload::Ready { plaintext, .. } => {
                    texts.push(String::from_utf8(plaintext).unwrap());
                }
                other => panic!("expected ready, got {other:?}"),
            }
        }
        assert_eq!(texts, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_wrong_key_is_hard_error_not_buffered() {
        let mut sender = SessionKeyManager::new();
        sender.install("receiver", SessionKey::generate());
        let envelope = envelope_for(&sender, "receiver", "hello");

        let mut receiver = SessionKeyManager::new();
        receiver.install("sender", SessionKey::generate());
        let result = receiver.decrypt_or_buffer("sender", envelope);
        assert_eq!(
            result.unwrap_err(),
            KeyError::Crypto(CryptoError::DecryptionFailed)
        );
        assert_eq!(receiver.pending_count("sender"), 0);
    }

    #[test]
    fn test_remove_key_keeps_pending() {
        let mut manager = SessionKeyManager::new();
        manager
            .decrypt_or_buffer(
                "bob",
                CipherEnvelope {
                    content: BASE64.encode(b"opaque"),
                    timestamp: 1,
                    kind: PayloadKind::Text,
                },
            )
            .unwrap();
        manager.install("bob", SessionKey::generate());
        // install drained the one pending envelope
        assert_eq!(manager.pending_count("bob"), 0);

        manager
            .decrypt_or_buffer(
                "carol",
                CipherEnvelope {
                    content: BASE64.encode(b"opaque"),
                    timestamp: 1,
                    kind: PayloadKind::Text,
                },
            )
            .unwrap();
        manager.remove_key("carol");
        assert_eq!(manager.pending_count("carol"), 1);
        assert!(!manager.has_key("carol"));
    }

    #[test]
    fn test_install_replaces_key() {
        let mut sender = SessionKeyManager::new();
        let old_key = SessionKey::generate();
        let new_key = SessionKey::generate();
        sender.install("receiver", old_key);
        let stale = envelope_for(&sender, "receiver", "stale");
        sender.install("receiver", new_key.clone());
        let fresh = envelope_for(&sender, "receiver", "fresh");

        let mut receiver = SessionKeyManager::new();
        receiver.install("sender", new_key);
        assert!(receiver.decrypt_or_buffer("sender", stale).is_err());
        match receiver.decrypt_or_buffer("sender", fresh).unwrap() {
            InboundPayload::Ready { plaintext, .. } => assert_eq!(plaintext, b"fresh"),
            other => panic!("expected ready, got {other:?}"),
        }
    }

    #[test]
    fn test_clear_drops_everything() {
        let mut manager = SessionKeyManager::new();
        manager.install("bob", SessionKey::generate());
        manager
            .decrypt_or_buffer(
                "carol",
                CipherEnvelope {
                    content: BASE64.encode(b"x"),
                    timestamp: 1,
                    kind: PayloadKind::Text,
                },
            )
            .unwrap();
        manager.clear();
        assert!(!manager.has_key("bob"));
        assert_eq!(manager.pending_count("carol"), 0);
    }
}
