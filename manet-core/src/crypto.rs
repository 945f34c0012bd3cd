//! Payload cipher hook applied to encoded packets before framing.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};

const NONCE_LEN: usize = 12;

/// Encrypt/decrypt hook. The default is [`PassThrough`].
pub trait PayloadCipher: Send {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError>;
    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CipherError>;
}

/// Leaves bytes untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThrough;

impl PayloadCipher for PassThrough {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CipherError> {
        Ok(data.to_vec())
    }
}

/// ChaCha20-Poly1305 under a key derived from a shared passphrase. Output is
/// `nonce (12 bytes) | ciphertext`; nonces are random since broadcast has no per-peer counter.
pub struct PassphraseCipher {
    key: [u8; 32],
}

impl PassphraseCipher {
    pub fn new(passphrase: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"manet-payload-v1");
        hasher.update(passphrase.as_bytes());
        Self {
            key: hasher.finalize().into(),
        }
    }

    fn cipher(&self) -> Result<ChaCha20Poly1305, CipherError> {
        ChaCha20Poly1305::new_from_slice(&self.key).map_err(|_| CipherError::Key)
    }
}

impl PayloadCipher for PassphraseCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let sealed = self
            .cipher()?
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CipherError::Encrypt)?;
        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CipherError> {
        if data.len() < NONCE_LEN {
            return Err(CipherError::Truncated);
        }
        let (nonce, sealed) = data.split_at(NONCE_LEN);
        self.cipher()?
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| CipherError::Decrypt)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CipherError {
    #[error("invalid key")]
    Key,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
    #[error("ciphertext truncated")]
    Truncated,
}
