//! Block files on local disk
//!
//! Used twice: the staging area keeps encrypted safety copies until enough
//! peers hold verified replicas, and the restore cache keeps decrypted
//! blocks until their files can be rebuilt.

use std::path::{Path, PathBuf};

use super::StoreError;
use crate::model::BlockId;

#[derive(Debug, Clone)]
pub struct BlockFiles {
    root: PathBuf,
}

impl BlockFiles {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<first two chars>/<id>`, keeping directories small.
    pub fn path(&self, id: &BlockId) -> PathBuf {
        let name = id.as_str();
        let shard = name.get(..2).unwrap_or(name);
        self.root.join(shard).join(name)
    }

    pub async fn put(&self, id: &BlockId, data: &[u8]) -> Result<PathBuf, StoreError> {
        let path = self.path(id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::IoError(e.to_string()))?;
        }
        let tmp = path.with_extension("partial");
        tokio::fs::write(&tmp, data)
            .await
            .map_err(|e| StoreError::IoError(e.to_string()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| StoreError::IoError(e.to_string()))?;
        Ok(path)
    }

    pub async fn get(&self, id: &BlockId) -> Result<Option<Vec<u8>>, StoreError> {
        match tokio::fs::read(self.path(id)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::IoError(e.to_string())),
        }
    }

    pub async fn contains(&self, id: &BlockId) -> bool {
        tokio::fs::metadata(self.path(id)).await.is_ok()
    }

    /// Blocking existence check for use inside store transactions.
    pub fn contains_sync(&self, id: &BlockId) -> bool {
        self.path(id).is_file()
    }

    /// Removing a missing file succeeds.
    pub async fn remove(&self, id: &BlockId) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::IoError(e.to_string())),
        }
    }
}
