//! Restore and recovery bookkeeping

use std::collections::BTreeSet;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::BlockId;

/// Why a block is wanted back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestoreReason {
    /// Needed to rebuild a file.
    Restore,
    /// Needed to rebuild the catalog.
    Recover,
    /// Both: a version block named by the selected catalog.
    RecoverAndRestore,
}

impl RestoreReason {
    /// Two wants for the same block collapse into one task.
    pub fn merge(self, other: RestoreReason) -> RestoreReason {
        use RestoreReason::*;
        match (self, other) {
            (a, b) if a == b => a,
            _ => RecoverAndRestore,
        }
    }

    /// Whether the arriving block feeds file restoration.
    pub fn restores_file(self) -> bool {
        matches!(self, RestoreReason::Restore | RestoreReason::RecoverAndRestore)
    }

    /// Priority tasks drain before bulk catalog recovery.
    pub fn is_priority(self) -> bool {
        self.restores_file()
    }
}

/// One still-missing block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreTask {
    pub block_id: BlockId,
    pub reason: RestoreReason,
    pub created_at: DateTime<Utc>,
    /// When a peer or store was last asked for it.
    pub last_requested: Option<DateTime<Utc>>,
}

impl RestoreTask {
    pub fn new(block_id: BlockId, reason: RestoreReason, now: DateTime<Utc>) -> Self {
        Self {
            block_id,
            reason,
            created_at: now,
            last_requested: None,
        }
    }

    /// Unrequested tasks are always due; requested ones wait out the retry interval.
    pub fn is_due(&self, now: DateTime<Utc>, retry: chrono::Duration) -> bool {
        match self.last_requested {
            None => true,
            Some(at) => now - at >= retry,
        }
    }
}

/// A file waiting to be rebuilt from cached blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestorePath {
    pub target: PathBuf,
    pub directory: String,
    pub relative_path: String,
    /// Timestamp of the chosen version.
    pub version_at: DateTime<Utc>,
    pub version_block: BlockId,
    /// Data blocks in file order. A block may repeat.
    pub blocks: Vec<BlockId>,
    pub missing: BTreeSet<BlockId>,
}

impl RestorePath {
    pub fn is_ready(&self) -> bool {
        self.missing.is_empty()
    }

    /// Returns whether the block was one this path still waited for.
    pub fn mark_available(&mut self, id: &BlockId) -> bool {
        self.missing.remove(id)
    }
}

/// Process-wide recovery progress. Absent (`None` in the store) means
/// normal operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryState {
    /// Recovery requested; waiting for a catalog to be selected.
    Initialized,
    /// Fetching version blocks and file data.
    RecoverData,
    /// Fetching the remaining known blocks.
    RecoverMetadata,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_merge() {
        use RestoreReason::*;
        assert_eq!(Restore.merge(Restore), Restore);
        assert_eq!(Recover.merge(Recover), Recover);
        assert_eq!(Restore.merge(Recover), RecoverAndRestore);
        assert_eq!(Recover.merge(RecoverAndRestore), RecoverAndRestore);
        assert!(!Recover.is_priority());
        assert!(RecoverAndRestore.restores_file());
    }

    #[test]
    fn test_task_retry_window() {
        let now = Utc::now();
        let retry = chrono::Duration::minutes(5);
        let mut task = RestoreTask::new(BlockId::new_random(), RestoreReason::Restore, now);
        assert!(task.is_due(now, retry));

        task.last_requested = Some(now);
        assert!(!task.is_due(now + chrono::Duration::minutes(4), retry));
        assert!(task.is_due(now + chrono::Duration::minutes(5), retry));
    }

    #[test]
    fn test_restore_path_readiness_with_repeated_block() {
        let a = BlockId::new_random();
        let b = BlockId::new_random();
        let mut path = RestorePath {
            target: PathBuf::from("/tmp/out"),
            directory: "docs".into(),
            relative_path: "a.txt".into(),
            version_at: Utc::now(),
            version_block: BlockId::new_random(),
            blocks: vec![a.clone(), b.clone(), a.clone()],
            missing: [a.clone(), b.clone()].into_iter().collect(),
        };

        assert!(path.mark_available(&a));
        assert!(!path.mark_available(&a));
        assert!(!path.is_ready());
        path.mark_available(&b);
        assert!(path.is_ready());
    }
}
