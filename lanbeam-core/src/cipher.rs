//! Chunk cipher: per-transfer AES-256-GCM key, base IV, per-chunk IV derivation.

use std::fmt;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Symmetric key length in bytes (AES-256).
pub const KEY_LEN: usize = 32;

/// IV length in bytes (96-bit GCM nonce).
pub const IV_LEN: usize = 12;

/// Byte offset in the IV where the chunk index is written.
const INDEX_OFFSET: usize = 8;

/// 256-bit transfer key. Fresh per transfer; sent once inside `file-metadata`.
/// Serialized as a plain byte array, as the metadata message carries it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionKey([u8; KEY_LEN]);

impl SessionKey {
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        SessionKey(key)
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        SessionKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// 96-bit random IV prefix, single use per transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseIv([u8; IV_LEN]);

impl BaseIv {
    pub fn generate() -> Self {
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);
        BaseIv(iv)
    }

    pub fn from_bytes(bytes: [u8; IV_LEN]) -> Self {
        BaseIv(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; IV_LEN] {
        &self.0
    }
}

/// Per-chunk IV: the base IV with bytes [8..12) replaced by `index` (u32 LE).
pub fn derive_iv(base: &BaseIv, index: u32) -> [u8; IV_LEN] {
    let mut iv = base.0;
    iv[INDEX_OFFSET..IV_LEN].copy_from_slice(&index.to_le_bytes());
    iv
}

/// AEAD bound to one transfer's key and base IV. Cheap to clone; a clone is
/// handed to each crypto worker.
#[derive(Clone)]
pub struct ChunkCipher {
    cipher: Aes256Gcm,
    base_iv: BaseIv,
}

impl ChunkCipher {
    pub fn new(key: &SessionKey, base_iv: BaseIv) -> Self {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
        Self { cipher, base_iv }
    }

    /// Fresh key and base IV for a new outbound transfer.
    pub fn generate() -> (Self, SessionKey, BaseIv) {
        let key = SessionKey::generate();
        let base_iv = BaseIv::generate();
        (Self::new(&key, base_iv), key, base_iv)
    }

    pub fn base_iv(&self) -> &BaseIv {
        &self.base_iv
    }

    /// Encrypt one chunk. Output is ciphertext with the 16-byte tag appended.
    pub fn encrypt_chunk(&self, index: u32, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let iv = derive_iv(&self.base_iv, index);
        self.cipher
            .encrypt(Nonce::from_slice(&iv), plaintext)
            .map_err(|_| CryptoError::Encrypt { index })
    }

    /// Decrypt one chunk. A tag mismatch only affects this chunk.
    pub fn decrypt_chunk(&self, index: u32, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let iv = derive_iv(&self.base_iv, index);
        self.cipher
            .decrypt(Nonce::from_slice(&iv), ciphertext)
            .map_err(|_| CryptoError::Authentication { index })
    }
}

impl fmt::Debug for ChunkCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkCipher")
            .field("base_iv", &self.base_iv)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("encryption failed for chunk {index}")]
    Encrypt { index: u32 },
    #[error("chunk {index} failed authentication")]
    Authentication { index: u32 },
}

impl CryptoError {
    pub fn chunk_index(&self) -> u32 {
        match self {
            CryptoError::Encrypt { index } | CryptoError::Authentication { index } => *index,
        }
    }
}
