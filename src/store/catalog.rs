//! The metadata arena
//!
//! Entities reference each other by ID only. Locations are keyed by
//! (block, peer), secret pools and the active challenge by block, versions by
//! (directory, path) and then timestamp.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::StoreError;
use crate::model::{
    ActiveChallenge, Block, BlockId, BlockLocation, CatalogSnapshot, ContentHash, FileKey, PeerId,
    RecoveryState, RestorePath, RestoreReason, RestoreTask, VerificationSecret, VersionEntry,
};

#[derive(Debug, Default)]
pub struct Catalog {
    blocks: BTreeMap<BlockId, Block>,
    by_hash: HashMap<ContentHash, BlockId>,
    locations: BTreeMap<BlockId, BTreeMap<PeerId, BlockLocation>>,
    secrets: HashMap<BlockId, Vec<VerificationSecret>>,
    challenges: HashMap<BlockId, ActiveChallenge>,
    tasks: BTreeMap<BlockId, RestoreTask>,
    restore_paths: BTreeMap<PathBuf, RestorePath>,
    versions: BTreeMap<FileKey, BTreeMap<DateTime<Utc>, VersionEntry>>,
    recovery: Option<RecoveryState>,
    recovered_catalogs: BTreeMap<BlockId, CatalogSnapshot>,
    directory_bindings: BTreeMap<String, PathBuf>,
    selected_catalog: Option<BlockId>,
}

/// On-disk mirror: flat lists, rebuilt into maps on load.
#[derive(Serialize, Deserialize, Default)]
pub(crate) struct CatalogFile {
    blocks: Vec<Block>,
    locations: Vec<BlockLocation>,
    secrets: Vec<(BlockId, Vec<VerificationSecret>)>,
    challenges: Vec<ActiveChallenge>,
    tasks: Vec<RestoreTask>,
    restore_paths: Vec<RestorePath>,
    versions: Vec<VersionEntry>,
    recovery: Option<RecoveryState>,
    recovered_catalogs: Vec<(BlockId, CatalogSnapshot)>,
    directory_bindings: BTreeMap<String, PathBuf>,
    selected_catalog: Option<BlockId>,
}

impl CatalogFile {
    pub(crate) fn to_json(&self) -> Result<Vec<u8>, StoreError> {
        serde_json::to_vec(self).map_err(|e| {
            StoreError::PersistenceError(format!("Failed to serialize metadata: {}", e))
        })
    }
}

impl Catalog {
    pub(crate) fn from_json(data: &[u8]) -> Result<Self, StoreError> {
        let file: CatalogFile = serde_json::from_slice(data).map_err(|e| {
            StoreError::PersistenceError(format!("Failed to parse metadata: {}", e))
        })?;

        let mut catalog = Catalog {
            recovery: file.recovery,
            directory_bindings: file.directory_bindings,
            selected_catalog: file.selected_catalog,
            ..Default::default()
        };
        for block in file.blocks {
            catalog.insert_block(block);
        }
        for location in file.locations {
            catalog.upsert_location(location);
        }
        catalog.secrets = file.secrets.into_iter().collect();
        catalog.challenges = file
            .challenges
            .into_iter()
            .map(|c| (c.block_id.clone(), c))
            .collect();
        catalog.tasks = file
            .tasks
            .into_iter()
            .map(|t| (t.block_id.clone(), t))
            .collect();
        catalog.restore_paths = file
            .restore_paths
            .into_iter()
            .map(|p| (p.target.clone(), p))
            .collect();
        for entry in file.versions {
            catalog.add_version(entry);
        }
        catalog.recovered_catalogs = file.recovered_catalogs.into_iter().collect();
        Ok(catalog)
    }

    pub(crate) fn to_json(&self) -> Result<Vec<u8>, StoreError> {
        self.to_file().to_json()
    }

    /// Owned copy of the persisted tables, detached from the arena.
    pub(crate) fn to_file(&self) -> CatalogFile {
        CatalogFile {
            blocks: self.blocks.values().cloned().collect(),
            locations: self.all_locations().cloned().collect(),
            secrets: self
                .secrets
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            challenges: self.challenges.values().cloned().collect(),
            tasks: self.tasks.values().cloned().collect(),
            restore_paths: self.restore_paths.values().cloned().collect(),
            versions: self
                .versions
                .values()
                .flat_map(|history| history.values().cloned())
                .collect(),
            recovery: self.recovery,
            recovered_catalogs: self
                .recovered_catalogs
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            directory_bindings: self.directory_bindings.clone(),
            selected_catalog: self.selected_catalog.clone(),
        }
    }

    // ===== Blocks =====

    pub fn block(&self, id: &BlockId) -> Option<&Block> {
        self.blocks.get(id)
    }

    pub fn block_mut(&mut self, id: &BlockId) -> Option<&mut Block> {
        self.blocks.get_mut(id)
    }

    pub fn contains_block(&self, id: &BlockId) -> bool {
        self.blocks.contains_key(id)
    }

    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.values()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn block_by_hash(&self, hash: &ContentHash) -> Option<&Block> {
        self.by_hash.get(hash).and_then(|id| self.blocks.get(id))
    }

    /// Insert or replace a block, keeping the hash index in step.
    pub fn insert_block(&mut self, block: Block) {
        if let Some(hash) = block.hash() {
            self.by_hash.entry(*hash).or_insert_with(|| block.id.clone());
        }
        self.blocks.insert(block.id.clone(), block);
    }

    /// Create a placeholder unless the block is already known. Returns
    /// whether one was created.
    pub fn ensure_placeholder(&mut self, id: &BlockId, now: DateTime<Utc>) -> bool {
        if self.blocks.contains_key(id) {
            return false;
        }
        self.blocks
            .insert(id.clone(), Block::placeholder(id.clone(), now));
        true
    }

    /// Set a block's content hash (immutable once set).
    pub fn assign_hash(&mut self, id: &BlockId, hash: ContentHash) -> Result<bool, StoreError> {
        let block = self
            .blocks
            .get_mut(id)
            .ok_or_else(|| StoreError::UnknownBlock(id.to_string()))?;
        let newly_set = block.assign_hash(hash)?;
        if newly_set {
            self.by_hash.entry(hash).or_insert_with(|| id.clone());
        }
        Ok(newly_set)
    }

    // ===== Locations =====

    pub fn locations(&self, id: &BlockId) -> impl Iterator<Item = &BlockLocation> {
        self.locations.get(id).into_iter().flat_map(|m| m.values())
    }

    pub fn all_locations(&self) -> impl Iterator<Item = &BlockLocation> {
        self.locations.values().flat_map(|m| m.values())
    }

    pub fn location(&self, id: &BlockId, peer: &PeerId) -> Option<&BlockLocation> {
        self.locations.get(id).and_then(|m| m.get(peer))
    }

    pub fn location_mut(&mut self, id: &BlockId, peer: &PeerId) -> Option<&mut BlockLocation> {
        self.locations.get_mut(id).and_then(|m| m.get_mut(peer))
    }

    pub fn upsert_location(&mut self, location: BlockLocation) {
        self.locations
            .entry(location.block_id.clone())
            .or_default()
            .insert(location.peer_id, location);
    }

    /// Create the location if it is missing; an existing one keeps its age.
    pub fn ensure_location(&mut self, location: BlockLocation) -> bool {
        let peers = self.locations.entry(location.block_id.clone()).or_default();
        if peers.contains_key(&location.peer_id) {
            return false;
        }
        peers.insert(location.peer_id, location);
        true
    }

    /// Mark `peer` as holding a verified copy right now.
    pub fn record_verified(&mut self, id: &BlockId, peer: PeerId, now: DateTime<Utc>) {
        match self.location_mut(id, &peer) {
            Some(location) => location.mark_verified(now),
            None => self.upsert_location(BlockLocation::verified(id.clone(), peer, now)),
        }
    }

    pub fn remove_location(&mut self, id: &BlockId, peer: &PeerId) -> Option<BlockLocation> {
        let peers = self.locations.get_mut(id)?;
        let removed = peers.remove(peer);
        if peers.is_empty() {
            self.locations.remove(id);
        }
        removed
    }

    /// Peers recorded as holding the block, demoted ones excluded.
    pub fn holders(&self, id: &BlockId) -> Vec<PeerId> {
        self.locations(id)
            .filter(|l| !l.delete_requested)
            .map(|l| l.peer_id)
            .collect()
    }

    pub fn verified_count(&self, id: &BlockId, now: DateTime<Utc>, valid: Duration) -> usize {
        self.locations(id)
            .filter(|l| l.is_verified(now, valid))
            .count()
    }

    // ===== Verification secrets =====

    pub fn secret_count(&self, id: &BlockId) -> usize {
        self.secrets.get(id).map_or(0, Vec::len)
    }

    pub fn add_secrets(&mut self, id: &BlockId, secrets: Vec<VerificationSecret>) {
        if secrets.is_empty() {
            return;
        }
        self.secrets.entry(id.clone()).or_default().extend(secrets);
    }

    /// Remove one secret from the pool.
    pub fn take_secret(&mut self, id: &BlockId) -> Option<VerificationSecret> {
        let pool = self.secrets.get_mut(id)?;
        let secret = pool.pop();
        if pool.is_empty() {
            self.secrets.remove(id);
        }
        secret
    }

    pub fn active_challenge(&self, id: &BlockId) -> Option<&ActiveChallenge> {
        self.challenges.get(id)
    }

    /// Install a new active challenge, retiring any previous one.
    pub fn activate_challenge(&mut self, challenge: ActiveChallenge) -> Option<ActiveChallenge> {
        let retired = self.challenges.remove(&challenge.block_id);
        self.challenges.insert(challenge.block_id.clone(), challenge);
        retired
    }

    pub fn retire_challenge(&mut self, id: &BlockId) -> Option<ActiveChallenge> {
        self.challenges.remove(id)
    }

    pub fn active_challenge_count(&self) -> usize {
        self.challenges.len()
    }

    // ===== Restore tasks =====

    pub fn task(&self, id: &BlockId) -> Option<&RestoreTask> {
        self.tasks.get(id)
    }

    pub fn task_mut(&mut self, id: &BlockId) -> Option<&mut RestoreTask> {
        self.tasks.get_mut(id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &RestoreTask> {
        self.tasks.values()
    }

    /// Add a task, or widen the reason of an existing one.
    pub fn upsert_task(&mut self, id: &BlockId, reason: RestoreReason, now: DateTime<Utc>) {
        match self.tasks.get_mut(id) {
            Some(task) => task.reason = task.reason.merge(reason),
            None => {
                self.tasks
                    .insert(id.clone(), RestoreTask::new(id.clone(), reason, now));
            }
        }
    }

    pub fn remove_task(&mut self, id: &BlockId) -> Option<RestoreTask> {
        self.tasks.remove(id)
    }

    pub fn has_priority_tasks(&self) -> bool {
        self.tasks.values().any(|t| t.reason.is_priority())
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    // ===== Restore paths =====

    pub fn restore_path(&self, target: &Path) -> Option<&RestorePath> {
        self.restore_paths.get(target)
    }

    pub fn restore_paths(&self) -> impl Iterator<Item = &RestorePath> {
        self.restore_paths.values()
    }

    pub fn remove_restore_path(&mut self, target: &Path) -> Option<RestorePath> {
        self.restore_paths.remove(target)
    }

    /// Drop the path for `target` along with the file-restore tasks that no
    /// other path still waits on. Returns how many tasks went with it.
    pub fn drop_restore_path(&mut self, target: &Path) -> usize {
        match self.restore_paths.remove(target) {
            Some(old) => self.forget_unwanted_tasks(&old),
            None => 0,
        }
    }

    /// Put `path` in place of any pending path for the same target. Tasks
    /// only the replaced path waited on are dropped and counted.
    pub fn replace_restore_path(&mut self, path: RestorePath) -> usize {
        match self.restore_paths.insert(path.target.clone(), path) {
            Some(old) => self.forget_unwanted_tasks(&old),
            None => 0,
        }
    }

    fn forget_unwanted_tasks(&mut self, old: &RestorePath) -> usize {
        let mut dropped = 0;
        for id in &old.missing {
            let still_wanted = self.restore_paths.values().any(|p| p.missing.contains(id));
            let file_only = self
                .tasks
                .get(id)
                .map(|t| t.reason == RestoreReason::Restore)
                .unwrap_or(false);
            if !still_wanted && file_only {
                self.tasks.remove(id);
                dropped += 1;
            }
        }
        dropped
    }

    /// A block reached the restore cache; strike it from every path.
    pub fn mark_block_available(&mut self, id: &BlockId) -> usize {
        self.restore_paths
            .values_mut()
            .map(|p| p.mark_available(id))
            .filter(|&removed| removed)
            .count()
    }

    pub fn ready_paths(&self) -> Vec<RestorePath> {
        self.restore_paths
            .values()
            .filter(|p| p.is_ready())
            .cloned()
            .collect()
    }

    /// Whether any pending path still waits for this block.
    pub fn is_wanted_for_restore(&self, id: &BlockId) -> bool {
        self.restore_paths.values().any(|p| p.missing.contains(id))
    }

    // ===== Versions =====

    /// Record a version. Returns false when that timestamp was already
    /// known for the path.
    pub fn add_version(&mut self, entry: VersionEntry) -> bool {
        let history = self.versions.entry(entry.record.key()).or_default();
        if history.contains_key(&entry.record.timestamp) {
            return false;
        }
        history.insert(entry.record.timestamp, entry);
        true
    }

    pub fn latest_version(&self, key: &FileKey) -> Option<&VersionEntry> {
        self.versions
            .get(key)
            .and_then(|h| h.values().next_back())
    }

    /// Newest version at or before `at`.
    pub fn version_at(&self, key: &FileKey, at: DateTime<Utc>) -> Option<&VersionEntry> {
        self.versions
            .get(key)
            .and_then(|h| h.range(..=at).next_back().map(|(_, v)| v))
    }

    pub fn version_count(&self, key: &FileKey) -> usize {
        self.versions.get(key).map_or(0, BTreeMap::len)
    }

    pub fn file_keys(&self, directory: &str) -> Vec<FileKey> {
        self.versions
            .keys()
            .filter(|k| k.directory == directory)
            .cloned()
            .collect()
    }

    pub fn directories(&self) -> BTreeSet<String> {
        self.versions.keys().map(|k| k.directory.clone()).collect()
    }

    pub fn version_block_ids(&self) -> Vec<BlockId> {
        self.versions
            .values()
            .flat_map(|h| h.values().map(|v| v.block_id.clone()))
            .collect()
    }

    // ===== Recovery =====

    pub fn recovery_state(&self) -> Option<RecoveryState> {
        self.recovery
    }

    pub fn is_recovering(&self) -> bool {
        self.recovery.is_some()
    }

    pub fn set_recovery_state(&mut self, state: Option<RecoveryState>) {
        self.recovery = state;
    }

    /// Returns false when this snapshot was already recorded.
    pub fn add_recovered_catalog(&mut self, id: BlockId, snapshot: CatalogSnapshot) -> bool {
        if self.recovered_catalogs.contains_key(&id) {
            return false;
        }
        self.recovered_catalogs.insert(id, snapshot);
        true
    }

    pub fn recovered_catalog(&self, id: &BlockId) -> Option<&CatalogSnapshot> {
        self.recovered_catalogs.get(id)
    }

    pub fn recovered_catalogs(&self) -> impl Iterator<Item = (&BlockId, &CatalogSnapshot)> {
        self.recovered_catalogs.iter()
    }

    pub fn bind_directory(&mut self, name: &str, target: PathBuf) {
        self.directory_bindings.insert(name.to_string(), target);
    }

    pub fn directory_binding(&self, name: &str) -> Option<&PathBuf> {
        self.directory_bindings.get(name)
    }

    pub fn selected_catalog(&self) -> Option<&BlockId> {
        self.selected_catalog.as_ref()
    }

    pub fn set_selected_catalog(&mut self, id: Option<BlockId>) {
        self.selected_catalog = id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{VersionContent, VersionRecord};
    use uuid::Uuid;

    fn entry(dir: &str, path: &str, at: DateTime<Utc>) -> VersionEntry {
        VersionEntry {
            record: VersionRecord {
                directory: dir.into(),
                relative_path: path.into(),
                timestamp: at,
                content: VersionContent::Deleted,
            },
            block_id: BlockId::new_random(),
        }
    }

    #[test]
    fn test_one_location_per_block_and_peer() {
        let mut catalog = Catalog::default();
        let id = BlockId::new_random();
        let peer = Uuid::new_v4();
        let now = Utc::now();

        catalog.upsert_location(BlockLocation::verified(id.clone(), peer, now));
        catalog.upsert_location(BlockLocation::verified(id.clone(), peer, now));
        assert_eq!(catalog.locations(&id).count(), 1);

        assert!(!catalog.ensure_location(BlockLocation::provisional(
            id.clone(),
            peer,
            now,
            Duration::days(21)
        )));
        assert_eq!(catalog.verified_count(&id, now, Duration::days(21)), 1);

        catalog.remove_location(&id, &peer);
        assert_eq!(catalog.locations(&id).count(), 0);
        assert!(catalog.holders(&id).is_empty());
    }

    #[test]
    fn test_at_most_one_active_challenge_per_block() {
        let mut catalog = Catalog::default();
        let id = BlockId::new_random();
        let now = Utc::now();
        catalog.add_secrets(&id, VerificationSecret::generate_batch(b"ct", 3));

        let first = catalog.take_secret(&id).unwrap();
        let first_id = first.challenge;
        assert!(catalog
            .activate_challenge(ActiveChallenge::new(id.clone(), first, now, Duration::hours(1)))
            .is_none());

        let second = catalog.take_secret(&id).unwrap();
        let retired = catalog
            .activate_challenge(ActiveChallenge::new(id.clone(), second, now, Duration::hours(1)))
            .unwrap();
        assert_eq!(retired.challenge_id(), first_id);
        assert_eq!(catalog.active_challenge_count(), 1);
        assert_eq!(catalog.secret_count(&id), 1);
        assert_ne!(
            catalog.active_challenge(&id).unwrap().challenge_id(),
            first_id
        );
    }

    #[test]
    fn test_version_lookup_by_time() {
        let mut catalog = Catalog::default();
        let t0 = Utc::now();
        let key = FileKey::new("docs", "a.txt");

        assert!(catalog.add_version(entry("docs", "a.txt", t0)));
        assert!(catalog.add_version(entry("docs", "a.txt", t0 + Duration::hours(1))));
        assert!(!catalog.add_version(entry("docs", "a.txt", t0)));

        assert_eq!(catalog.version_count(&key), 2);
        assert_eq!(
            catalog.version_at(&key, t0 + Duration::minutes(30)).unwrap().record.timestamp,
            t0
        );
        assert_eq!(
            catalog.latest_version(&key).unwrap().record.timestamp,
            t0 + Duration::hours(1)
        );
        assert!(catalog.version_at(&key, t0 - Duration::seconds(1)).is_none());
    }

    #[test]
    fn test_task_reasons_merge() {
        let mut catalog = Catalog::default();
        let id = BlockId::new_random();
        let now = Utc::now();

        catalog.upsert_task(&id, RestoreReason::Recover, now);
        assert!(!catalog.has_priority_tasks());
        catalog.upsert_task(&id, RestoreReason::Restore, now);
        assert_eq!(catalog.task(&id).unwrap().reason, RestoreReason::RecoverAndRestore);
        assert_eq!(catalog.task_count(), 1);
        assert!(catalog.has_priority_tasks());
    }

    #[test]
    fn test_hash_index_follows_assignment() {
        let mut catalog = Catalog::default();
        let id = BlockId::new_random();
        let now = Utc::now();
        let hash = ContentHash::of(b"abc");

        catalog.ensure_placeholder(&id, now);
        assert!(catalog.block_by_hash(&hash).is_none());
        assert!(catalog.assign_hash(&id, hash).unwrap());
        assert_eq!(catalog.block_by_hash(&hash).unwrap().id, id);
        assert!(catalog.assign_hash(&id, ContentHash::of(b"xyz")).is_err());
        assert!(matches!(
            catalog.assign_hash(&BlockId::new_random(), hash),
            Err(StoreError::UnknownBlock(_))
        ));
    }

    #[test]
    fn test_json_round_trip_keeps_relations() {
        let mut catalog = Catalog::default();
        let now = Utc::now();
        let id = BlockId::new_random();
        let peer = Uuid::new_v4();
        catalog.insert_block(Block::data(id.clone(), ContentHash::of(b"x"), 1, now));
        catalog.upsert_location(BlockLocation::verified(id.clone(), peer, now));
        catalog.add_secrets(&id, VerificationSecret::generate_batch(b"x", 2));
        catalog.add_version(entry("docs", "b.txt", now));
        catalog.bind_directory("docs", PathBuf::from("/restore/docs"));

        let restored = Catalog::from_json(&catalog.to_json().unwrap()).unwrap();
        assert_eq!(restored.holders(&id), vec![peer]);
        assert_eq!(restored.secret_count(&id), 2);
        assert_eq!(restored.version_count(&FileKey::new("docs", "b.txt")), 1);
        assert_eq!(
            restored.directory_binding("docs"),
            Some(&PathBuf::from("/restore/docs"))
        );
        assert!(restored.block_by_hash(&ContentHash::of(b"x")).is_some());
    }

    #[test]
    fn test_replaced_restore_path_drops_only_its_own_tasks() {
        let mut catalog = Catalog::default();
        let now = Utc::now();
        let [own, other_file, metadata] = [(); 3].map(|_| BlockId::new_random());
        let path = |target: &str, missing: Vec<BlockId>| RestorePath {
            target: PathBuf::from(target),
            directory: "docs".into(),
            relative_path: target.into(),
            version_at: now,
            version_block: BlockId::new_random(),
            blocks: missing.clone(),
            missing: missing.into_iter().collect(),
        };
        for id in [&own, &other_file] {
            catalog.upsert_task(id, RestoreReason::Restore, now);
        }
        catalog.upsert_task(&metadata, RestoreReason::RecoverAndRestore, now);
        catalog.replace_restore_path(path("a", vec![own.clone(), other_file.clone(), metadata.clone()]));
        catalog.replace_restore_path(path("b", vec![other_file.clone()]));

        assert_eq!(catalog.replace_restore_path(path("a", vec![])), 1);
        assert!(catalog.task(&own).is_none());
        assert!(catalog.task(&other_file).is_some());
        assert!(catalog.task(&metadata).is_some());

        assert_eq!(catalog.drop_restore_path(Path::new("b")), 1);
        assert_eq!(catalog.drop_restore_path(Path::new("b")), 0);
        assert_eq!(catalog.task_count(), 1);
    }
}
