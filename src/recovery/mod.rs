//! Recovery and restore
//!
//! Recovery rebuilds a lost catalog from what peers (or object stores) still
//! hold. Peers answer a catalog request with their inventory for us and our
//! newest catalog snapshot; once the operator picks a snapshot and binds each
//! of its directories to a local target, every version block it names is
//! fetched with priority, the files they describe are rebuilt, and the rest of
//! the known blocks are fetched afterwards to restore the remaining metadata.
//!
//! Plain restores of a single file share the same task and materialization
//! machinery outside of recovery.

pub mod materialize;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::cloud::CloudError;
use crate::model::{
    BlockId, BlockKind, CloudCopy, ContentHash, FileKey, ModelError, PeerId, RecoveryState,
    RestorePath, RestoreReason, VersionContent, VersionEntry, VersionRecord,
};
use crate::network::selection::choose_one;
use crate::node::context::NodeContext;
use crate::pipeline::records::decode_catalog;
use crate::pipeline::{classify, BlockContent, CryptoError, PipelineError};
use crate::protocol::{Dispatch, Inbound, MessageHandler, MissingReason, PeerMessage, RestorePurpose};
use crate::store::StoreError;
use crate::verification::replenish_secrets;

#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Cloud error: {0}")]
    Cloud(#[from] CloudError),

    #[error("Recovery is not in the expected state: {0}")]
    InvalidState(String),

    #[error("Unknown catalog snapshot: {0}")]
    UnknownCatalog(String),

    #[error("No target bound for directory: {0}")]
    UnboundDirectory(String),

    #[error("No restorable version of {0}")]
    NoSuchVersion(String),

    #[error("Materialization failed: {0}")]
    Materialize(String),
}

/// Outcome of offering one block's ciphertext to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accepted {
    Catalog,
    Version,
    Data,
    /// Failed decryption or hash check; the source was not trusted.
    Rejected,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct RestoreSweep {
    pub state: Option<RecoveryState>,
    pub loaded_locally: usize,
    pub requested: usize,
    pub unavailable: usize,
    pub materialized: usize,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct CloudRecovery {
    pub objects: usize,
    pub accepted: usize,
    pub rejected: usize,
}

/// Where a block's ciphertext came from.
#[derive(Debug, Clone, Copy)]
enum Source {
    Local,
    Peer(PeerId),
}

pub struct RecoveryEngine {
    ctx: Arc<NodeContext>,
}

impl RecoveryEngine {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }

    pub fn state(&self) -> Result<Option<RecoveryState>, RecoveryError> {
        Ok(self.ctx.store.read(|c| c.recovery_state())?)
    }

    /// Enter recovery and ask every online peer for its inventory and our
    /// newest catalog snapshot. Returns how many peers were asked.
    pub async fn start(&self) -> Result<usize, RecoveryError> {
        self.ctx.store.transaction(|c| match c.recovery_state() {
            None | Some(RecoveryState::Initialized) => {
                c.set_recovery_state(Some(RecoveryState::Initialized));
                Ok(())
            }
            Some(other) => Err(RecoveryError::InvalidState(format!(
                "recovery already past catalog selection ({:?})",
                other
            ))),
        })?;
        let asked = self.ctx.registry.broadcast(&PeerMessage::CatalogRequest).await;
        log::info!("Recovery started; asked {} peers for their catalog", asked);
        Ok(asked)
    }

    pub fn bind_directory(&self, name: &str, target: impl Into<PathBuf>) -> Result<(), RecoveryError> {
        let target = target.into();
        self.ctx.store.transaction(|c| {
            c.bind_directory(name, target);
            Ok::<_, StoreError>(())
        })?;
        Ok(())
    }

    /// Recovered snapshots, newest first.
    pub fn recovered_catalogs(&self) -> Result<Vec<BlockId>, RecoveryError> {
        let mut ids: Vec<BlockId> = self
            .ctx
            .store
            .read(|c| c.recovered_catalogs().map(|(id, _)| id.clone()).collect())?;
        ids.sort_by(|a, b| b.cmp(a));
        Ok(ids)
    }

    /// Pick the snapshot to recover from. Every directory it names must be
    /// bound to a target first.
    pub async fn select_catalog(&self, id: &BlockId) -> Result<usize, RecoveryError> {
        let (state, snapshot, candidates) = self.ctx.store.read(|c| {
            // Catalogs were consumed on arrival; classified blocks are already
            // recovered.
            let candidates: Vec<BlockId> = c
                .blocks()
                .filter(|b| b.kind == BlockKind::Unclassified)
                .map(|b| b.id.clone())
                .collect();
            (c.recovery_state(), c.recovered_catalog(id).cloned(), candidates)
        })?;
        if state != Some(RecoveryState::Initialized) {
            return Err(RecoveryError::InvalidState(format!(
                "catalog selection needs an initialized recovery, found {:?}",
                state
            )));
        }
        let snapshot = snapshot.ok_or_else(|| RecoveryError::UnknownCatalog(id.to_string()))?;

        let unbound = self.ctx.store.read(|c| {
            snapshot
                .directories
                .iter()
                .find(|d| c.directory_binding(d).is_none())
                .cloned()
        })?;
        if let Some(directory) = unbound {
            return Err(RecoveryError::UnboundDirectory(directory));
        }

        // Blocks already sitting in the restore cache need no task.
        let mut cached = HashSet::new();
        for block in snapshot.version_blocks.iter().chain(candidates.iter()) {
            if self.ctx.restore_cache.contains(block).await {
                cached.insert(block.clone());
            }
        }

        let now = self.ctx.now();
        let created = self.ctx.store.transaction(|c| {
            if c.recovery_state() != Some(RecoveryState::Initialized) {
                return Err(RecoveryError::InvalidState(
                    "recovery state changed during catalog selection".into(),
                ));
            }
            let version_blocks: HashSet<&BlockId> = snapshot.version_blocks.iter().collect();
            let mut created = 0;
            for block in &snapshot.version_blocks {
                if cached.contains(block) {
                    continue;
                }
                c.ensure_placeholder(block, now);
                c.upsert_task(block, RestoreReason::RecoverAndRestore, now);
                created += 1;
            }
            for block in &candidates {
                if version_blocks.contains(block) || cached.contains(block) {
                    continue;
                }
                c.upsert_task(block, RestoreReason::Recover, now);
                created += 1;
            }
            c.set_selected_catalog(Some(id.clone()));
            c.set_recovery_state(Some(RecoveryState::RecoverData));
            Ok(created)
        })?;

        log::info!("Recovering from catalog {}: {} blocks to fetch", id, created);
        Ok(created)
    }

    /// Restore one file as it was at `at` into `target`.
    pub async fn request_restore(
        &self,
        directory: &str,
        relative_path: &str,
        at: DateTime<Utc>,
        target: impl Into<PathBuf>,
    ) -> Result<usize, RecoveryError> {
        let target = target.into();
        let key = FileKey::new(directory, relative_path);
        let entry = self
            .ctx
            .store
            .read(|c| c.version_at(&key, at).cloned())?
            .ok_or_else(|| RecoveryError::NoSuchVersion(format!("{}/{}", directory, relative_path)))?;
        let VersionContent::File { blocks, .. } = &entry.record.content else {
            return Err(RecoveryError::NoSuchVersion(format!(
                "{}/{} (deleted at that time)",
                directory, relative_path
            )));
        };

        let mut missing = std::collections::BTreeSet::new();
        for id in blocks {
            if self.ctx.restore_cache.contains(id).await || self.load_staged(id).await? {
                continue;
            }
            missing.insert(id.clone());
        }

        let pending = missing.len();
        let now = self.ctx.now();
        let path = RestorePath {
            target,
            directory: directory.to_string(),
            relative_path: relative_path.to_string(),
            version_at: entry.record.timestamp,
            version_block: entry.block_id.clone(),
            blocks: blocks.clone(),
            missing,
        };
        self.ctx.store.transaction(|c| {
            for id in &path.missing {
                c.upsert_task(id, RestoreReason::Restore, now);
            }
            c.replace_restore_path(path);
            Ok::<_, StoreError>(())
        })?;

        self.materialize_ready().await?;
        Ok(pending)
    }

    /// Decrypt a still-staged block straight into the restore cache.
    async fn load_staged(&self, id: &BlockId) -> Result<bool, RecoveryError> {
        let staged = self.ctx.store.read(|c| c.block(id).map(|b| b.staged).unwrap_or(false))?;
        if !staged {
            return Ok(false);
        }
        let Some(ciphertext) = self.ctx.staging.get(id).await? else {
            return Ok(false);
        };
        let plaintext = self.ctx.cipher.decrypt(id, &ciphertext)?;
        self.ctx.restore_cache.put(id, &plaintext).await?;
        Ok(true)
    }

    /// Advance the state machine, fetch due task blocks and rebuild every
    /// file whose blocks are all cached.
    pub async fn restore_sweep(&self) -> Result<RestoreSweep, RecoveryError> {
        let mut sweep = RestoreSweep::default();
        let state = self.advance_state()?;

        let now = self.ctx.now();
        let retry = self.ctx.config.scheduler.restore_retry();
        let batch = self.ctx.config.scheduler.restore_batch_size;
        let mut due: Vec<(BlockId, RestoreReason)> = self.ctx.store.read(|c| {
            c.tasks()
                .filter(|t| t.is_due(now, retry))
                .filter(|t| state != Some(RecoveryState::RecoverData) || t.reason.is_priority())
                .map(|t| (t.block_id.clone(), t.reason))
                .collect()
        })?;
        due.sort_by_key(|(_, reason)| !reason.is_priority());
        due.truncate(batch);

        let online: HashSet<PeerId> = self.ctx.registry.online_peers().await.into_iter().collect();
        let mut requests: HashMap<(PeerId, RestorePurpose), Vec<BlockId>> = HashMap::new();

        for (id, reason) in due {
            if self.load_from_own_copies(&id).await? {
                sweep.loaded_locally += 1;
                continue;
            }
            let holders: Vec<PeerId> = self.ctx.store.read(|c| {
                c.holders(&id).into_iter().filter(|p| online.contains(p)).collect()
            })?;
            match choose_one(&holders) {
                Some(peer) => {
                    let purpose = if reason == RestoreReason::Recover {
                        RestorePurpose::Recover
                    } else {
                        RestorePurpose::Restore
                    };
                    requests.entry((peer, purpose)).or_default().push(id);
                }
                None => {
                    log::debug!("No online holder for {}", id);
                    sweep.unavailable += 1;
                }
            }
        }

        for ((peer, purpose), ids) in requests {
            let message = PeerMessage::RestoreRequest {
                ids: ids.clone(),
                purpose,
            };
            if self.ctx.registry.deliver(&peer, &message).await {
                sweep.requested += ids.len();
                self.ctx.store.transaction(|c| {
                    for id in &ids {
                        if let Some(task) = c.task_mut(id) {
                            task.last_requested = Some(now);
                        }
                    }
                    Ok::<_, StoreError>(())
                })?;
            }
        }

        sweep.materialized = self.materialize_ready().await?;
        sweep.state = self.advance_state()?;
        log::debug!("Restore sweep: {:?}", sweep);
        Ok(sweep)
    }

    /// Staging first, then object stores.
    async fn load_from_own_copies(&self, id: &BlockId) -> Result<bool, RecoveryError> {
        let block = self.ctx.store.read(|c| c.block(id).cloned())?;
        let Some(block) = block else {
            return Ok(false);
        };
        if block.staged {
            if let Some(data) = self.ctx.staging.get(id).await? {
                if self.accept_block(Source::Local, id, &data).await? != Accepted::Rejected {
                    return Ok(true);
                }
            }
        }
        for copy in &block.cloud {
            let Some(store) = self.ctx.object_store(&copy.store) else {
                continue;
            };
            match store.download(&copy.object).await {
                Ok(data) => {
                    if self.accept_block(Source::Local, id, &data).await? != Accepted::Rejected {
                        return Ok(true);
                    }
                }
                Err(e) => log::warn!("Download of {} from {} failed: {}", id, copy.store, e),
            }
        }
        Ok(false)
    }

    fn advance_state(&self) -> Result<Option<RecoveryState>, RecoveryError> {
        let (before, after) = self.ctx.store.transaction(|c| {
            let before = c.recovery_state();
            let mut state = before;
            if state == Some(RecoveryState::RecoverData) && !c.has_priority_tasks() {
                state = Some(RecoveryState::RecoverMetadata);
            }
            if state == Some(RecoveryState::RecoverMetadata) && c.task_count() == 0 {
                state = None;
                c.set_selected_catalog(None);
            }
            if state != before {
                c.set_recovery_state(state);
            }
            Ok::<_, StoreError>((before, state))
        })?;
        if before != after {
            log::info!("Recovery state {:?} -> {:?}", before, after);
        }
        Ok(after)
    }

    /// Rebuild every ready file. A failed write leaves its path for the next
    /// sweep.
    pub async fn materialize_ready(&self) -> Result<usize, RecoveryError> {
        let ready = self.ctx.store.read(|c| c.ready_paths())?;
        let mut done = 0;
        for path in ready {
            match materialize::write_file(&self.ctx.restore_cache, &path).await {
                Ok(bytes) => {
                    log::info!("Restored {} ({} bytes)", path.target.display(), bytes);
                    let unused: Vec<BlockId> = self.ctx.store.transaction(|c| {
                        c.remove_restore_path(&path.target);
                        let unused = path
                            .blocks
                            .iter()
                            .filter(|id| !c.restore_paths().any(|p| p.blocks.contains(id)))
                            .cloned()
                            .collect();
                        Ok::<_, StoreError>(unused)
                    })?;
                    for id in unused {
                        self.ctx.restore_cache.remove(&id).await?;
                    }
                    done += 1;
                }
                Err(e) => log::warn!("Could not restore {}: {}", path.target.display(), e),
            }
        }
        Ok(done)
    }

    /// Decrypt and classify one block, feeding its content into the catalog.
    async fn accept_block(
        &self,
        source: Source,
        id: &BlockId,
        ciphertext: &[u8],
    ) -> Result<Accepted, RecoveryError> {
        let plaintext = match self.ctx.cipher.decrypt(id, ciphertext) {
            Ok(plaintext) => plaintext,
            Err(e) if e.is_integrity() => {
                self.reject(source, id, &e.to_string()).await?;
                return Ok(Accepted::Rejected);
            }
            Err(e) => return Err(e.into()),
        };

        let accepted = match classify(id, &plaintext) {
            BlockContent::Catalog => Accepted::Catalog,
            BlockContent::Version(record) => {
                self.ingest_version(id, record).await?;
                Accepted::Version
            }
            BlockContent::Data => {
                let hash = ContentHash::of(&plaintext);
                let now = self.ctx.now();
                let assigned = self.ctx.store.transaction(|c| {
                    c.ensure_placeholder(id, now);
                    c.assign_hash(id, hash)?;
                    if let Some(block) = c.block_mut(id) {
                        if block.kind == BlockKind::Unclassified {
                            block.kind = BlockKind::Data;
                        }
                        block.size.get_or_insert(plaintext.len() as u64);
                    }
                    Ok::<_, StoreError>(c.is_wanted_for_restore(id))
                });
                let wanted = match assigned {
                    Ok(wanted) => wanted,
                    Err(StoreError::Model(conflict @ ModelError::HashConflict { .. })) => {
                        self.reject(source, id, &conflict.to_string()).await?;
                        return Ok(Accepted::Rejected);
                    }
                    Err(e) => return Err(e.into()),
                };
                if wanted {
                    self.ctx.restore_cache.put(id, &plaintext).await?;
                    self.ctx.store.transaction(|c| {
                        c.mark_block_available(id);
                        Ok::<_, StoreError>(())
                    })?;
                }
                Accepted::Data
            }
        };

        let now = self.ctx.now();
        self.ctx.store.transaction(|c| {
            c.ensure_placeholder(id, now);
            if accepted == Accepted::Catalog {
                if let Some(block) = c.block_mut(id) {
                    block.kind = BlockKind::Catalog;
                }
            }
            if let Source::Peer(peer) = source {
                c.record_verified(id, peer, now);
            }
            c.remove_task(id);
            Ok::<_, StoreError>(())
        })?;
        replenish_secrets(&self.ctx, id, ciphertext)?;
        Ok(accepted)
    }

    async fn reject(&self, source: Source, id: &BlockId, why: &str) -> Result<(), RecoveryError> {
        match source {
            Source::Peer(peer) => {
                log::warn!("{} sent a bad copy of {}: {}", peer, id, why);
                self.ctx.demote_and_delete(id, peer).await?;
            }
            Source::Local => log::warn!("Local copy of {} is unusable: {}", id, why),
        }
        Ok(())
    }

    /// Record a version. When its block was wanted for file restoration and
    /// it is the newest version of its path, set up that file's restore.
    async fn ingest_version(&self, id: &BlockId, record: VersionRecord) -> Result<(), RecoveryError> {
        let mut cached = HashSet::new();
        for block in record.data_blocks() {
            if self.ctx.restore_cache.contains(block).await {
                cached.insert(block.clone());
            }
        }

        let now = self.ctx.now();
        let key = record.key();
        let entry = VersionEntry {
            record,
            block_id: id.clone(),
        };
        self.ctx.store.transaction(|c| {
            if let Some(block) = c.block_mut(id) {
                block.kind = BlockKind::Version;
            }
            if c.add_version(entry.clone()) {
                for block in entry.record.data_blocks() {
                    c.ensure_placeholder(block, now);
                }
            }

            let restores_file = c.task(id).map(|t| t.reason.restores_file()).unwrap_or(false);
            let newest = c.latest_version(&key).map(|v| &v.block_id == id).unwrap_or(false);
            if !restores_file || !newest {
                return Ok::<_, StoreError>(());
            }
            let Some(root) = c.directory_binding(&key.directory).cloned() else {
                log::warn!("No target bound for {}; skipping {}", key.directory, key.relative_path);
                return Ok(());
            };
            let target = root.join(&key.relative_path);

            match &entry.record.content {
                VersionContent::Deleted => {
                    c.drop_restore_path(&target);
                }
                VersionContent::File { blocks, .. } => {
                    if c.restore_path(&target).map(|p| &p.version_block == id).unwrap_or(false) {
                        return Ok(());
                    }
                    let missing: std::collections::BTreeSet<BlockId> =
                        blocks.iter().filter(|b| !cached.contains(*b)).cloned().collect();
                    for block in &missing {
                        c.upsert_task(block, RestoreReason::Restore, now);
                    }
                    let dropped = c.replace_restore_path(RestorePath {
                        target,
                        directory: key.directory.clone(),
                        relative_path: key.relative_path.clone(),
                        version_at: entry.record.timestamp,
                        version_block: id.clone(),
                        blocks: blocks.clone(),
                        missing,
                    });
                    if dropped > 0 {
                        log::debug!("{} superseded; dropped {} restore tasks", key.relative_path, dropped);
                    }
                }
            }
            Ok(())
        })?;
        Ok(())
    }

    /// Inventory reply: every listed block is believed held by the sender.
    fn on_inventory(&self, from: PeerId, block_ids: Vec<BlockId>) -> Result<(), RecoveryError> {
        let now = self.ctx.now();
        let window = self.ctx.valid_window();
        let (blocks, locations) = self.ctx.store.transaction(|c| {
            if !c.is_recovering() {
                return Ok::<_, StoreError>((0, 0));
            }
            let mut blocks = 0;
            let mut locations = 0;
            for id in block_ids.iter().filter(|id| id.is_well_formed()) {
                if c.ensure_placeholder(id, now) {
                    blocks += 1;
                }
                let location = crate::model::BlockLocation::provisional(id.clone(), from, now, window);
                if c.ensure_location(location) {
                    locations += 1;
                }
            }
            Ok((blocks, locations))
        })?;
        log::info!(
            "Inventory from {}: {} new blocks, {} new locations",
            from,
            blocks,
            locations
        );
        Ok(())
    }

    /// A catalog snapshot from a peer or an object store.
    async fn ingest_snapshot(
        &self,
        source: Source,
        snapshot_id: &BlockId,
        ciphertext: &[u8],
    ) -> Result<Accepted, RecoveryError> {
        let plaintext = match self.ctx.cipher.decrypt(snapshot_id, ciphertext) {
            Ok(plaintext) => plaintext,
            Err(e) if e.is_integrity() => {
                self.reject(source, snapshot_id, &e.to_string()).await?;
                return Ok(Accepted::Rejected);
            }
            Err(e) => return Err(e.into()),
        };
        let snapshot = decode_catalog(&plaintext)?;

        let now = self.ctx.now();
        let added = self.ctx.store.transaction(|c| {
            c.ensure_placeholder(snapshot_id, now);
            if let Some(block) = c.block_mut(snapshot_id) {
                block.kind = BlockKind::Catalog;
            }
            for id in &snapshot.version_blocks {
                c.ensure_placeholder(id, now);
            }
            if let Source::Peer(peer) = source {
                c.record_verified(snapshot_id, peer, now);
            }
            Ok::<_, StoreError>(c.add_recovered_catalog(snapshot_id.clone(), snapshot.clone()))
        })?;
        replenish_secrets(&self.ctx, snapshot_id, ciphertext)?;
        if added {
            log::info!(
                "Recovered catalog {}: {} directories, {} versions",
                snapshot_id,
                snapshot.directories.len(),
                snapshot.version_blocks.len()
            );
        }
        Ok(Accepted::Catalog)
    }

    /// Rebuild from object stores alone: every object is decrypted and
    /// classified exactly as a peer-supplied block would be.
    pub async fn recover_from_cloud(&self) -> Result<CloudRecovery, RecoveryError> {
        self.ctx.store.transaction(|c| {
            if !c.is_recovering() {
                c.set_recovery_state(Some(RecoveryState::Initialized));
            }
            Ok::<_, StoreError>(())
        })?;

        let mut summary = CloudRecovery::default();
        for store in &self.ctx.object_stores {
            for object in store.list().await? {
                let Ok(id) = BlockId::parse(&object) else {
                    log::debug!("Skipping foreign object {} in {}", object, store.name());
                    continue;
                };
                summary.objects += 1;
                let data = match store.download(&object).await {
                    Ok(data) => data,
                    Err(e) => {
                        log::warn!("Download of {} from {} failed: {}", object, store.name(), e);
                        continue;
                    }
                };
                let url = store.share(&object).await.ok();
                let now = self.ctx.now();
                let name = store.name().to_string();
                self.ctx.store.transaction(|c| {
                    c.ensure_placeholder(&id, now);
                    if let Some(block) = c.block_mut(&id) {
                        if block.cloud_copy_mut(&name).is_none() {
                            block.cloud.push(CloudCopy {
                                store: name.clone(),
                                object: object.clone(),
                                url,
                                needs_reupload: false,
                            });
                        }
                    }
                    Ok::<_, StoreError>(())
                })?;

                let accepted = if id.is_catalog() {
                    self.ingest_snapshot(Source::Local, &id, &data).await?
                } else {
                    self.accept_block(Source::Local, &id, &data).await?
                };
                if accepted == Accepted::Rejected {
                    summary.rejected += 1;
                } else {
                    summary.accepted += 1;
                }
            }
        }
        log::info!("Cloud recovery: {:?}", summary);
        Ok(summary)
    }

    async fn on_restore_response(&self, from: PeerId, id: BlockId, data: Vec<u8>) -> Result<(), RecoveryError> {
        if !self.ctx.store.read(|c| c.contains_block(&id))? {
            log::debug!("Ignoring unsolicited block {} from {}", id, from);
            return Ok(());
        }
        self.accept_block(Source::Peer(from), &id, &data).await?;
        Ok(())
    }

    fn on_restore_fail(&self, from: PeerId, id: BlockId, reason: MissingReason) -> Result<(), RecoveryError> {
        match reason {
            MissingReason::Missing => {
                log::info!("{} no longer holds {}", from, id);
                self.ctx.store.transaction(|c| {
                    c.remove_location(&id, &from);
                    Ok::<_, StoreError>(())
                })?;
            }
            MissingReason::General => log::warn!("{} could not return {}", from, id),
        }
        Ok(())
    }
}

fn log_failure(kind: &str, result: Result<(), RecoveryError>) {
    if let Err(e) = result {
        log::error!("Handling {} failed: {}", kind, e);
    }
}

#[async_trait]
impl MessageHandler for RecoveryEngine {
    async fn handle(&self, inbound: Inbound) -> Dispatch {
        let from = inbound.from;
        match inbound.message {
            PeerMessage::CatalogInventory { block_ids } => {
                log_failure("CATALOG_INVENTORY", self.on_inventory(from, block_ids))
            }
            PeerMessage::CatalogSnapshot {
                snapshot_id,
                snapshot_bytes,
            } => {
                let recovering = self.ctx.is_recovering().unwrap_or(false);
                if recovering {
                    let result = self
                        .ingest_snapshot(Source::Peer(from), &snapshot_id, &snapshot_bytes)
                        .await
                        .map(|_| ());
                    log_failure("CATALOG_SNAPSHOT", result);
                }
            }
            PeerMessage::RestoreResponse {
                id,
                purpose: RestorePurpose::Restore | RestorePurpose::Recover,
                data,
            } => log_failure(
                "RESTORE_RESPONSE",
                self.on_restore_response(from, id, data).await,
            ),
            PeerMessage::RestoreFail { id, reason } => {
                log_failure("RESTORE_FAIL", self.on_restore_fail(from, id, reason))
            }
            message => return Dispatch::Pass(Inbound::new(from, message)),
        }
        Dispatch::Handled
    }
}
