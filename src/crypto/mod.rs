//! AEAD primitives and key derivation
//!
//! Two derivation steps feed each connection: the passphrase becomes a master
//! key once at startup (EVP_BytesToKey with MD5, for compatibility with
//! existing clients), and each direction of each connection derives its own
//! sub-key from the master key and a fresh random salt via HKDF-SHA1 with the
//! info string `ss-subkey`. Nonces are 12-byte little-endian counters starting
//! at zero per sub-key.

use crate::{Error, Result};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use chacha20poly1305::ChaCha20Poly1305;
use hkdf::Hkdf;
use md5::{Digest, Md5};
use sha1::Sha1;

/// AEAD nonce size in bytes, shared by both supported methods
pub const NONCE_SIZE: usize = 12;

/// AEAD cipher method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherKind {
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl CipherKind {
    pub fn key_size(&self) -> usize {
        32
    }

    pub fn salt_size(&self) -> usize {
        self.key_size()
    }

    pub fn tag_size(&self) -> usize {
        16
    }

    pub fn nonce_size(&self) -> usize {
        NONCE_SIZE
    }

    pub fn name(&self) -> &'static str {
        match self {
            CipherKind::Aes256Gcm => "aes-256-gcm",
            CipherKind::ChaCha20Poly1305 => "chacha20-poly1305",
        }
    }
}

impl TryFrom<&str> for CipherKind {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "aes-256-gcm" => Ok(CipherKind::Aes256Gcm),
            "chacha20-poly1305" => Ok(CipherKind::ChaCha20Poly1305),
            _ => Err(Error::unsupported(format!("cipher method: {}", s))),
        }
    }
}

/// Derive the master key from a passphrase using EVP_BytesToKey (MD5, no salt)
pub fn derive_key(password: &str, key_size: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(key_size);
    let mut prev: Vec<u8> = Vec::new();

    while key.len() < key_size {
        let mut hasher = Md5::new();
        hasher.update(&prev);
        hasher.update(password.as_bytes());
        let digest = hasher.finalize();
        prev = digest.to_vec();
        key.extend_from_slice(&prev);
    }

    key.truncate(key_size);
    key
}

/// Derive a per-direction sub-key from the master key and a salt (HKDF-SHA1)
pub fn derive_subkey(key: &[u8], salt: &[u8]) -> Vec<u8> {
    let hk = Hkdf::<Sha1>::new(Some(salt), key);
    let mut subkey = vec![0u8; key.len()];
    hk.expand(b"ss-subkey", &mut subkey)
        .expect("sub-key length is valid for HKDF-SHA1");
    subkey
}

/// Generate a fresh random salt for one direction of a connection
pub fn generate_salt(kind: CipherKind) -> Result<Vec<u8>> {
    let mut salt = vec![0u8; kind.salt_size()];
    getrandom::getrandom(&mut salt).map_err(|e| Error::crypto(e.to_string()))?;
    Ok(salt)
}

/// Increment a counter nonce (little-endian)
fn increment_nonce(nonce: &mut [u8; NONCE_SIZE]) {
    for byte in nonce.iter_mut() {
        *byte = byte.wrapping_add(1);
        if *byte != 0 {
            break;
        }
    }
}

enum AeadImpl {
    Aes256Gcm(Aes256Gcm),
    ChaCha20Poly1305(ChaCha20Poly1305),
}

/// One directional AEAD context: a sub-key bound cipher and its counter nonce
pub struct SessionCipher {
    cipher: AeadImpl,
    nonce: [u8; NONCE_SIZE],
}

impl SessionCipher {
    pub fn new(kind: CipherKind, subkey: &[u8]) -> Result<Self> {
        let cipher = match kind {
            CipherKind::Aes256Gcm => AeadImpl::Aes256Gcm(
                Aes256Gcm::new_from_slice(subkey).map_err(|e| Error::crypto(e.to_string()))?,
            ),
            CipherKind::ChaCha20Poly1305 => AeadImpl::ChaCha20Poly1305(
                ChaCha20Poly1305::new_from_slice(subkey)
                    .map_err(|e| Error::crypto(e.to_string()))?,
            ),
        };

        Ok(SessionCipher {
            cipher,
            nonce: [0u8; NONCE_SIZE],
        })
    }

    /// Seal one frame; the returned ciphertext carries the auth tag.
    /// The nonce advances unconditionally.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce_arr = self.nonce;
        let sealed = match &self.cipher {
            AeadImpl::Aes256Gcm(c) => c.encrypt(&Nonce::from(nonce_arr), plaintext),
            AeadImpl::ChaCha20Poly1305(c) => c.encrypt(&Nonce::from(nonce_arr), plaintext),
        }
        .map_err(|e| Error::crypto(e.to_string()))?;

        increment_nonce(&mut self.nonce);
        Ok(sealed)
    }

    /// Open one frame (ciphertext with trailing auth tag). The nonce advances
    /// only when the tag verifies, so a failed context stays out of sync and
    /// the connection must be torn down.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let nonce_arr = self.nonce;
        let opened = match &self.cipher {
            AeadImpl::Aes256Gcm(c) => c.decrypt(&Nonce::from(nonce_arr), ciphertext),
            AeadImpl::ChaCha20Poly1305(c) => c.decrypt(&Nonce::from(nonce_arr), ciphertext),
        }
        .map_err(|_| Error::crypto("authentication failed"))?;

        increment_nonce(&mut self.nonce);
        Ok(opened)
    }
}
