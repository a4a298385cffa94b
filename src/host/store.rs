//! Blocks held on behalf of other owners
//!
//! `<root>/<owner>/blocks/..` holds the ciphertext, `<root>/<owner>/index.json`
//! the MAC each block arrived with.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::HostError;
use crate::model::{BlockId, PeerId};
use crate::store::BlockFiles;

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct OwnerIndex {
    /// Block ID -> hex MAC.
    macs: BTreeMap<BlockId, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Stored,
    /// Same block with the same MAC was already here.
    AlreadyStored,
}

pub struct HostedBlockStore {
    root: PathBuf,
    indexes: Mutex<HashMap<PeerId, OwnerIndex>>,
}

impl HostedBlockStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            indexes: Mutex::new(HashMap::new()),
        }
    }

    fn owner_dir(&self, owner: &PeerId) -> PathBuf {
        self.root.join(owner.to_string())
    }

    fn files(&self, owner: &PeerId) -> BlockFiles {
        BlockFiles::new(self.owner_dir(owner).join("blocks"))
    }

    fn index_path(&self, owner: &PeerId) -> PathBuf {
        self.owner_dir(owner).join("index.json")
    }

    async fn load_index(&self, owner: &PeerId) -> Result<OwnerIndex, HostError> {
        match tokio::fs::read(self.index_path(owner)).await {
            Ok(data) => serde_json::from_slice(&data)
                .map_err(|e| HostError::PersistenceError(format!("Failed to parse index: {}", e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(OwnerIndex::default()),
            Err(e) => Err(HostError::IoError(e.to_string())),
        }
    }

    async fn save_index(&self, owner: &PeerId, index: &OwnerIndex) -> Result<(), HostError> {
        let dir = self.owner_dir(owner);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| HostError::IoError(e.to_string()))?;
        let data = serde_json::to_vec_pretty(index)
            .map_err(|e| HostError::PersistenceError(e.to_string()))?;
        let tmp = dir.join("index.json.tmp");
        tokio::fs::write(&tmp, data)
            .await
            .map_err(|e| HostError::IoError(e.to_string()))?;
        tokio::fs::rename(&tmp, self.index_path(owner))
            .await
            .map_err(|e| HostError::IoError(e.to_string()))
    }

    /// Run `f` against the owner's index, loading it on first use.
    async fn with_index<R>(
        &self,
        owner: &PeerId,
        f: impl FnOnce(&mut OwnerIndex) -> R,
    ) -> Result<R, HostError> {
        let mut indexes = self.indexes.lock().await;
        if !indexes.contains_key(owner) {
            let loaded = self.load_index(owner).await?;
            indexes.insert(*owner, loaded);
        }
        let index = indexes
            .get_mut(owner)
            .ok_or_else(|| HostError::PersistenceError("index vanished".into()))?;
        Ok(f(index))
    }

    pub async fn stored_mac(&self, owner: &PeerId, id: &BlockId) -> Result<Option<[u8; 32]>, HostError> {
        let hex_mac = self.with_index(owner, |i| i.macs.get(id).cloned()).await?;
        Ok(hex_mac.and_then(|h| hex::decode(h).ok()?.try_into().ok()))
    }

    pub async fn put(
        &self,
        owner: &PeerId,
        id: &BlockId,
        data: &[u8],
        mac: &[u8; 32],
    ) -> Result<PutOutcome, HostError> {
        if !id.is_well_formed() {
            return Err(HostError::InvalidBlockId(id.to_string()));
        }
        match self.stored_mac(owner, id).await? {
            Some(existing) if &existing == mac => return Ok(PutOutcome::AlreadyStored),
            Some(_) => return Err(HostError::DifferentMac(id.to_string())),
            None => {}
        }

        self.files(owner)
            .put(id, data)
            .await
            .map_err(|e| HostError::IoError(e.to_string()))?;
        let index = self
            .with_index(owner, |i| {
                i.macs.insert(id.clone(), hex::encode(mac));
                i.clone()
            })
            .await?;
        self.save_index(owner, &index).await?;
        Ok(PutOutcome::Stored)
    }

    pub async fn get(&self, owner: &PeerId, id: &BlockId) -> Result<Option<Vec<u8>>, HostError> {
        if !id.is_well_formed() {
            return Ok(None);
        }
        self.files(owner)
            .get(id)
            .await
            .map_err(|e| HostError::IoError(e.to_string()))
    }

    pub async fn delete(&self, owner: &PeerId, id: &BlockId) -> Result<(), HostError> {
        if !id.is_well_formed() {
            return Ok(());
        }
        self.files(owner)
            .remove(id)
            .await
            .map_err(|e| HostError::IoError(e.to_string()))?;
        let index = self
            .with_index(owner, |i| {
                i.macs.remove(id);
                i.clone()
            })
            .await?;
        self.save_index(owner, &index).await
    }

    pub async fn inventory(&self, owner: &PeerId) -> Result<Vec<BlockId>, HostError> {
        self.with_index(owner, |i| i.macs.keys().cloned().collect())
            .await
    }

    /// The owner's newest catalog snapshot ID.
    pub async fn latest_catalog(&self, owner: &PeerId) -> Result<Option<BlockId>, HostError> {
        self.with_index(owner, |i| {
            i.macs.keys().filter(|id| id.is_catalog()).max().cloned()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_put_is_idempotent_per_mac() {
        let dir = tempfile::tempdir().unwrap();
        let store = HostedBlockStore::new(dir.path());
        let owner = Uuid::new_v4();
        let id = BlockId::new_random();

        assert_eq!(
            store.put(&owner, &id, b"ct", &[1u8; 32]).await.unwrap(),
            PutOutcome::Stored
        );
        assert_eq!(
            store.put(&owner, &id, b"ct", &[1u8; 32]).await.unwrap(),
            PutOutcome::AlreadyStored
        );
        assert!(matches!(
            store.put(&owner, &id, b"ct", &[2u8; 32]).await,
            Err(HostError::DifferentMac(_))
        ));
        assert_eq!(store.get(&owner, &id).await.unwrap().unwrap(), b"ct");
    }

    #[tokio::test]
    async fn test_index_survives_restart_and_owners_are_separate() {
        let dir = tempfile::tempdir().unwrap();
        let owner = Uuid::new_v4();
        let other = Uuid::new_v4();
        let old_catalog = BlockId::new_catalog(Utc::now() - chrono::Duration::days(1));
        let new_catalog = BlockId::new_catalog(Utc::now());

        {
            let store = HostedBlockStore::new(dir.path());
            store.put(&owner, &old_catalog, b"a", &[0u8; 32]).await.unwrap();
            store.put(&owner, &new_catalog, b"b", &[0u8; 32]).await.unwrap();
        }

        let store = HostedBlockStore::new(dir.path());
        assert_eq!(store.inventory(&owner).await.unwrap().len(), 2);
        assert_eq!(store.latest_catalog(&owner).await.unwrap(), Some(new_catalog.clone()));
        assert!(store.inventory(&other).await.unwrap().is_empty());
        assert!(store.get(&other, &new_catalog).await.unwrap().is_none());

        store.delete(&owner, &new_catalog).await.unwrap();
        assert_eq!(store.latest_catalog(&owner).await.unwrap(), Some(old_catalog));
    }
}
