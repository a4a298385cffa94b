//! Shared block data model
//!
//! Plain data read and written by every engine: blocks, their remote
//! locations, verification secrets, restore bookkeeping and the file
//! version records carried inside metadata blocks. Relations are by ID;
//! the arena that holds them lives in `crate::store`.

pub mod block;
pub mod restore;
pub mod verification;
pub mod version;

pub use block::{
    stale_timestamp, Block, BlockId, BlockKind, BlockLocation, BlockMac, CloudCopy, ContentHash,
    PeerId, CATALOG_PREFIX,
};
pub use restore::{RecoveryState, RestorePath, RestoreReason, RestoreTask};
pub use verification::{proof_of_storage, ActiveChallenge, ChallengeId, ProofDigest, VerificationSecret};
pub use version::{CatalogSnapshot, FileKey, VersionContent, VersionEntry, VersionRecord};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    /// A block's content hash is immutable once set.
    #[error("Block {block} already has hash {existing}, refusing {offered}")]
    HashConflict {
        block: String,
        existing: String,
        offered: String,
    },

    #[error("Malformed block ID: {0:?}")]
    MalformedBlockId(String),

    #[error("Invalid proof digest length: {0}")]
    InvalidDigest(usize),
}
