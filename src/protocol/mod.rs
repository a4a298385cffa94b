//! Peer protocol
//!
//! `PeerMessage` is the closed set of messages exchanged between nodes. Each
//! engine implements `MessageHandler`, handles the variants it owns and
//! passes everything else down the chain.

pub mod frame;

pub use frame::{decode_frame, encode_frame, FrameDecoder, MAX_FRAME_LEN, WIRE_VERSION};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{BlockId, ChallengeId, PeerId, ProofDigest};

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Frame of {size} bytes exceeds limit of {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Unsupported wire version {0}")]
    UnsupportedVersion(u8),

    #[error("Truncated frame")]
    Truncated,

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// How a `BACKUP` carries the ciphertext.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DownloadRef {
    Inline {
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
    /// Time-limited URL of a cloud copy.
    Shared { url: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupFailReason {
    NotAllowed,
    AlreadyStoredDifferentMac,
    NotFound,
    WrongMac,
    General,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MissingReason {
    Missing,
    General,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RestorePurpose {
    Restore,
    Redistribution,
    Verification,
    Recover,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PeerMessage {
    /// First frame on a fresh connection.
    Hello { peer_id: PeerId },

    Backup {
        id: BlockId,
        download_ref: DownloadRef,
        mac: [u8; 32],
        mac_secret: [u8; 32],
    },
    BackupOk { id: BlockId },
    BackupFail { id: BlockId, reason: BackupFailReason },

    Delete { ids: Vec<BlockId> },
    DeleteOk { ids: Vec<BlockId> },

    Verify { id: BlockId, challenge_id: ChallengeId },
    VerifyOk {
        id: BlockId,
        challenge_id: ChallengeId,
        hash: ProofDigest,
    },
    VerifyFail { id: BlockId, reason: MissingReason },

    RestoreRequest {
        ids: Vec<BlockId>,
        purpose: RestorePurpose,
    },
    RestoreResponse {
        id: BlockId,
        purpose: RestorePurpose,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
    RestoreFail { id: BlockId, reason: MissingReason },

    CatalogRequest,
    CatalogInventory { block_ids: Vec<BlockId> },
    CatalogSnapshot {
        snapshot_id: BlockId,
        #[serde(with = "serde_bytes")]
        snapshot_bytes: Vec<u8>,
    },
}

impl PeerMessage {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::Hello { .. } => "HELLO",
            PeerMessage::Backup { .. } => "BACKUP",
            PeerMessage::BackupOk { .. } => "BACKUP_OK",
            PeerMessage::BackupFail { .. } => "BACKUP_FAIL",
            PeerMessage::Delete { .. } => "DELETE",
            PeerMessage::DeleteOk { .. } => "DELETE_OK",
            PeerMessage::Verify { .. } => "VERIFY",
            PeerMessage::VerifyOk { .. } => "VERIFY_OK",
            PeerMessage::VerifyFail { .. } => "VERIFY_FAIL",
            PeerMessage::RestoreRequest { .. } => "RESTORE_REQUEST",
            PeerMessage::RestoreResponse { .. } => "RESTORE_RESPONSE",
            PeerMessage::RestoreFail { .. } => "RESTORE_FAIL",
            PeerMessage::CatalogRequest => "CATALOG_REQUEST",
            PeerMessage::CatalogInventory { .. } => "CATALOG_INVENTORY",
            PeerMessage::CatalogSnapshot { .. } => "CATALOG_SNAPSHOT",
        }
    }
}

/// A message together with the peer it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub from: PeerId,
    pub message: PeerMessage,
}

impl Inbound {
    pub fn new(from: PeerId, message: PeerMessage) -> Self {
        Self { from, message }
    }
}

/// Result of offering a message to one handler.
#[derive(Debug)]
pub enum Dispatch {
    Handled,
    /// Not this handler's message; try the next one.
    Pass(Inbound),
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, inbound: Inbound) -> Dispatch;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        assert_eq!(PeerMessage::CatalogRequest.kind(), "CATALOG_REQUEST");
        assert_eq!(
            PeerMessage::DeleteOk { ids: vec![] }.kind(),
            "DELETE_OK"
        );
    }
}
