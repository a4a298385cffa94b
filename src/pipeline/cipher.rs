//! Block encryption
//!
//! AES-256-GCM with the block ID as associated data, so a ciphertext only
//! opens under the identity it was sealed for. Sealed layout is
//! nonce (12 bytes) || ciphertext || tag (16 bytes).

use std::path::Path;

use aes_gcm::aead::{Aead, AeadInPlace, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::CryptoError;
use crate::model::BlockId;

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

const KEY_INFO: &[u8] = b"peerkeep-block-cipher-v1";

/// Process-wide master key material.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct BlockKey([u8; 32]);

impl BlockKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_hex(text: &str) -> Result<Self, CryptoError> {
        let raw = hex::decode(text.trim()).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let bytes: [u8; 32] = raw
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKey(format!("expected 32 bytes, got {}", raw.len())))?;
        Ok(Self(bytes))
    }

    /// Read the hex key file, creating it with fresh material when absent.
    pub fn load_or_generate(path: &Path) -> Result<Self, CryptoError> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_hex(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let key = Self::generate();
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| CryptoError::KeyFile(e.to_string()))?;
                }
                std::fs::write(path, hex::encode(key.0))
                    .map_err(|e| CryptoError::KeyFile(e.to_string()))?;
                log::info!("Generated new block key at {}", path.display());
                Ok(key)
            }
            Err(e) => Err(CryptoError::KeyFile(e.to_string())),
        }
    }
}

impl std::fmt::Debug for BlockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BlockKey(..)")
    }
}

#[derive(Clone)]
pub struct BlockCipher {
    cipher: Aes256Gcm,
}

impl BlockCipher {
    pub fn new(key: &BlockKey) -> Result<Self, CryptoError> {
        let hk = Hkdf::<Sha256>::new(None, &key.0);
        let mut okm = [0u8; 32];
        hk.expand(KEY_INFO, &mut okm)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let cipher =
            Aes256Gcm::new_from_slice(&okm).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        okm.zeroize();
        Ok(Self { cipher })
    }

    /// Size of the sealed output for a plaintext of `plaintext_len` bytes.
    pub fn sealed_len(plaintext_len: usize) -> usize {
        NONCE_LEN + plaintext_len + TAG_LEN
    }

    /// Seal a block into a buffer sized by `sealed_len`.
    pub fn encrypt(&self, id: &BlockId, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut sealed = vec![0u8; Self::sealed_len(plaintext.len())];
        let written = self.encrypt_into(id, plaintext, &mut sealed)?;
        sealed.truncate(written);
        Ok(sealed)
    }

    /// Seal into a caller-provided buffer, returning the bytes written. An
    /// undersized buffer is rejected, never truncated.
    pub fn encrypt_into(
        &self,
        id: &BlockId,
        plaintext: &[u8],
        out: &mut [u8],
    ) -> Result<usize, CryptoError> {
        let needed = Self::sealed_len(plaintext.len());
        if out.len() < needed {
            return Err(CryptoError::BufferTooSmall {
                needed,
                available: out.len(),
            });
        }

        let (nonce_out, rest) = out.split_at_mut(NONCE_LEN);
        rand::thread_rng().fill_bytes(nonce_out);
        let nonce = *Nonce::from_slice(nonce_out);

        let (body, rest) = rest.split_at_mut(plaintext.len());
        body.copy_from_slice(plaintext);
        let tag = self
            .cipher
            .encrypt_in_place_detached(&nonce, id.as_bytes(), body)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        rest[..TAG_LEN].copy_from_slice(&tag);
        Ok(needed)
    }

    /// Open a sealed block. Any tampering, a different block ID or a
    /// different key fails with `CryptoError::Integrity`.
    pub fn decrypt(&self, id: &BlockId, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::Integrity(format!(
                "sealed block {} too short ({} bytes)",
                id,
                sealed.len()
            )));
        }
        let nonce = Nonce::from_slice(&sealed[..NONCE_LEN]);
        self.cipher
            .decrypt(
                nonce,
                Payload {
                    msg: &sealed[NONCE_LEN..],
                    aad: id.as_bytes(),
                },
            )
            .map_err(|_| CryptoError::Integrity(format!("block {} failed authentication", id)))
    }
}
