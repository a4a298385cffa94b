//! File versions and catalog snapshots
//!
//! These are the structured payloads of metadata blocks. Their byte
//! encoding lives in `crate::pipeline::records`.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{BlockId, ContentHash};

/// What a path looked like at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum VersionContent {
    /// The file was removed from the backup root.
    Deleted,
    File {
        hash: ContentHash,
        size: u64,
        /// Data blocks in file order.
        blocks: Vec<BlockId>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionRecord {
    /// Name of the backup root.
    pub directory: String,
    /// `/`-separated path below the root.
    pub relative_path: String,
    pub timestamp: DateTime<Utc>,
    pub content: VersionContent,
}

impl VersionRecord {
    pub fn key(&self) -> FileKey {
        FileKey::new(&self.directory, &self.relative_path)
    }

    pub fn file_hash(&self) -> Option<&ContentHash> {
        match &self.content {
            VersionContent::File { hash, .. } => Some(hash),
            VersionContent::Deleted => None,
        }
    }

    pub fn data_blocks(&self) -> &[BlockId] {
        match &self.content {
            VersionContent::File { blocks, .. } => blocks,
            VersionContent::Deleted => &[],
        }
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self.content, VersionContent::Deleted)
    }
}

/// A version record together with the block that carries it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionEntry {
    pub record: VersionRecord,
    pub block_id: BlockId,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileKey {
    pub directory: String,
    pub relative_path: String,
}

impl FileKey {
    pub fn new(directory: &str, relative_path: &str) -> Self {
        Self {
            directory: directory.to_string(),
            relative_path: relative_path.to_string(),
        }
    }
}

/// Everything needed to find the rest of the catalog again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogSnapshot {
    pub created_at: DateTime<Utc>,
    /// Names of the backed-up top-level directories.
    pub directories: BTreeSet<String>,
    pub version_blocks: Vec<BlockId>,
}
