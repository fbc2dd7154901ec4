//! # Challenge/Response Authentication Primitives
//!
//! One side proves key possession by correctly decrypting and echoing a
//! random value chosen by the other side. Two shapes exist on the wire:
//!
//! - **Salted**: a 4096-byte challenge plus an 8-byte salt, encrypted as one
//!   blob with pre-shared key material; the client echoes the challenge and
//!   keeps the salt as a session attribute.
//! - **Keyed**: a 501-byte challenge encrypted to the peer's public key
//!   material (512 bytes under the classic length-preserving cipher).
//!
//! The cipher itself is pluggable via [`ChallengeCipher`]; the shipped
//! [`SecretCipher`] is ChaCha20-Poly1305 under a SHA-256-derived key, which
//! adds nonce and tag framing around the fixed plaintext sizes. Echo
//! comparison is constant-time.

use std::collections::HashMap;
use std::sync::Arc;

use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::{ProtocolError, Result};

/// Challenge plaintext length in the salted exchange.
pub const CHALLENGE_LEN: usize = 4096;

/// Salt length appended to the salted challenge before encryption.
pub const SALT_LEN: usize = 8;

/// Challenge plaintext length in the keyed exchange.
pub const KEYED_CHALLENGE_LEN: usize = 501;

/// Ciphertext length of the keyed challenge under a length-preserving
/// 4096-bit cipher. Informational: AEAD ciphers produce longer blobs.
pub const KEYED_CIPHERTEXT_LEN: usize = 512;

const NONCE_LEN: usize = 12;

/// Encrypt/decrypt functions bound to one peer's key material.
pub trait ChallengeCipher: Send + Sync {
    fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>>;
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>>;
}

/// Resolves a claimed peer id to its key material. A miss is a fatal
/// unknown-id authentication failure.
pub trait CipherDirectory: Send + Sync {
    fn cipher_for(&self, peer_id: &str) -> Option<Arc<dyn ChallengeCipher>>;
}

impl CipherDirectory for HashMap<String, Arc<dyn ChallengeCipher>> {
    fn cipher_for(&self, peer_id: &str) -> Option<Arc<dyn ChallengeCipher>> {
        self.get(peer_id).cloned()
    }
}

/// ChaCha20-Poly1305 challenge cipher keyed from a shared secret.
///
/// Ciphertext layout: `nonce(12) || aead_ciphertext`.
pub struct SecretCipher {
    cipher: ChaCha20Poly1305,
}

impl SecretCipher {
    /// Derive the cipher key as SHA-256 of the shared secret.
    pub fn new(secret: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(secret);
        let key: [u8; 32] = hasher.finalize().into();
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&key)),
        }
    }
}

impl ChallengeCipher for SecretCipher {
    fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plain)
            .map_err(|_| {
                ProtocolError::AuthenticationFailed("challenge encryption failed".into())
            })?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() <= NONCE_LEN {
            return Err(ProtocolError::AuthenticationFailed(
                "challenge ciphertext too short".into(),
            ));
        }
        let (nonce, body) = ciphertext.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), body)
            .map_err(|_| ProtocolError::AuthenticationFailed("challenge decryption failed".into()))
    }
}

/// A fresh random challenge of the given length.
pub fn generate_challenge(len: usize) -> Vec<u8> {
    let mut challenge = vec![0u8; len];
    OsRng.fill_bytes(&mut challenge);
    challenge
}

/// A fresh random salt.
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Constant-time comparison of the echoed challenge against the original.
pub fn echo_matches(expected: &[u8], echoed: &[u8]) -> bool {
    expected.ct_eq(echoed).into()
}
