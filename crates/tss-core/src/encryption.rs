//! Versioned symmetric encryption for relay message bodies.
//!
//! Every session carries a hex-encoded 256-bit pre-shared secret (embedded in
//! the QR payload). The actual cipher key is the SHA-256 of the raw secret,
//! the nonce is prepended to the ciphertext and the whole blob travels
//! base64-encoded. Two suites are supported: AES-256-GCM for current sessions
//! and ChaCha20-Poly1305 for sessions negotiated by older releases.

use crate::{Error, Result};
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chacha20poly1305::ChaCha20Poly1305;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// Cipher suite negotiated for a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CipherSuite {
    #[default]
    AesGcm,
    /// Legacy suite kept for sessions issued by older peers
    ChaCha20Poly1305,
}

/// Hex-encoded 256-bit pre-shared session secret
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EncryptionKey(String);

impl EncryptionKey {
    /// Generate a fresh random secret.
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut raw = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut raw);
        let key = Self(hex::encode(raw));
        raw.zeroize();
        key
    }

    /// Accepts only a 64-character hex string.
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let raw = hex::decode(hex_str)
            .map_err(|e| Error::Encryption(format!("invalid key hex: {e}")))?;
        if raw.len() != KEY_LEN {
            return Err(Error::Encryption(format!(
                "key must be {KEY_LEN} bytes, got {}",
                raw.len()
            )));
        }
        Ok(Self(hex_str.to_string()))
    }

    pub fn as_hex(&self) -> &str {
        &self.0
    }
}

/// Symmetric cipher bound to one session's secret and suite
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionCipher {
    key: [u8; KEY_LEN],
    #[zeroize(skip)]
    suite: CipherSuite,
}

impl SessionCipher {
    pub fn new(key: &EncryptionKey, suite: CipherSuite) -> Result<Self> {
        let raw = hex::decode(key.as_hex())
            .map_err(|e| Error::Encryption(format!("invalid key hex: {e}")))?;
        if raw.len() != KEY_LEN {
            return Err(Error::Encryption(format!(
                "key must be {KEY_LEN} bytes, got {}",
                raw.len()
            )));
        }
        // cipher key is SHA-256 of the raw pre-shared secret
        let digest = Sha256::digest(&raw);
        let mut key_bytes = [0u8; KEY_LEN];
        key_bytes.copy_from_slice(&digest);
        Ok(Self {
            key: key_bytes,
            suite,
        })
    }

    pub fn suite(&self) -> CipherSuite {
        self.suite
    }

    /// Encrypt and return base64(nonce || ciphertext).
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String> {
        let sealed = match self.suite {
            CipherSuite::AesGcm => {
                let cipher = Aes256Gcm::new_from_slice(&self.key)
                    .map_err(|e| Error::Encryption(e.to_string()))?;
                let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
                let mut out = nonce.to_vec();
                let ct = cipher
                    .encrypt(&nonce, plaintext)
                    .map_err(|e| Error::Encryption(e.to_string()))?;
                out.extend_from_slice(&ct);
                out
            }
            CipherSuite::ChaCha20Poly1305 => {
                let cipher = ChaCha20Poly1305::new_from_slice(&self.key)
                    .map_err(|e| Error::Encryption(e.to_string()))?;
                let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
                let mut out = nonce.to_vec();
                let ct = cipher
                    .encrypt(&nonce, plaintext)
                    .map_err(|e| Error::Encryption(e.to_string()))?;
                out.extend_from_slice(&ct);
                out
            }
        };
        Ok(BASE64.encode(sealed))
    }

    /// Decrypt base64(nonce || ciphertext).
    pub fn decrypt(&self, body: &str) -> Result<Vec<u8>> {
        let sealed = BASE64
            .decode(body)
            .map_err(|e| Error::Encryption(format!("invalid base64 body: {e}")))?;
        if sealed.len() <= NONCE_LEN {
            return Err(Error::Encryption("ciphertext too short".into()));
        }
        let (nonce, ct) = sealed.split_at(NONCE_LEN);
        match self.suite {
            CipherSuite::AesGcm => {
                let cipher = Aes256Gcm::new_from_slice(&self.key)
                    .map_err(|e| Error::Encryption(e.to_string()))?;
                cipher
                    .decrypt(nonce.into(), ct)
                    .map_err(|_| Error::Encryption("decryption failed".into()))
            }
            CipherSuite::ChaCha20Poly1305 => {
                let cipher = ChaCha20Poly1305::new_from_slice(&self.key)
                    .map_err(|e| Error::Encryption(e.to_string()))?;
                cipher
                    .decrypt(nonce.into(), ct)
                    .map_err(|_| Error::Encryption("decryption failed".into()))
            }
        }
    }
}
