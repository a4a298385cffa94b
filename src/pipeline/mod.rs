//! Chunk & encrypt pipeline
//!
//! Files become fixed-size plaintext chunks, each hashed and sealed with
//! AES-256-GCM under the block's ID as associated data. Metadata records
//! (file versions, catalog snapshots) travel through the same cipher.

pub mod chunker;
pub mod cipher;
pub mod mac;
pub mod records;

pub use chunker::{Chunk, FileChunker, DEFAULT_CHUNK_SIZE};
pub use cipher::{BlockCipher, BlockKey};
pub use mac::{compute_mac, new_mac, verify_mac};
pub use records::{classify, BlockContent};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Chunk size must be positive")]
    InvalidChunkSize,

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Not a {expected} record")]
    WrongRecordType { expected: &'static str },

    #[error("Unsupported record format version {0}")]
    UnsupportedFormat(u8),
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::IoError(err.to_string())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CryptoError {
    /// Authentication failed: tampered bytes, wrong associated data, wrong
    /// key, or a MAC/hash that does not match. Never carries plaintext.
    #[error("Integrity violation: {0}")]
    Integrity(String),

    #[error("Output buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Key file error: {0}")]
    KeyFile(String),
}

impl CryptoError {
    pub fn is_integrity(&self) -> bool {
        matches!(self, CryptoError::Integrity(_))
    }
}
