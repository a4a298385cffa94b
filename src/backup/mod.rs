//! Backup engine
//!
//! Turns files under the configured backup roots into blocks. Each chunk is
//! deduplicated by content hash; new chunks are encrypted, staged as local
//! safety copies and given a pool of verification secrets. A version block
//! records which blocks make up the file, and a catalog snapshot after each
//! run that changed anything lists every version block so the catalog can
//! be rebuilt from peers.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use crate::config::BackupRoot;
use crate::model::{
    Block, BlockId, BlockKind, CatalogSnapshot, ContentHash, FileKey, VersionContent,
    VersionEntry, VersionRecord, VerificationSecret,
};
use crate::node::context::NodeContext;
use crate::pipeline::records::{encode_catalog, encode_version};
use crate::pipeline::{new_mac, Chunk, CryptoError, FileChunker, PipelineError};
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Backups are suspended while recovering")]
    Recovering,

    #[error("Unknown backup root: {0}")]
    UnknownRoot(String),

    #[error("{0} is not below its backup root")]
    OutsideRoot(String),
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct FileBackup {
    pub new_blocks: usize,
    pub reused_blocks: usize,
    /// `None` when the file was unchanged since its last version.
    pub version_block: Option<BlockId>,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct RootBackup {
    pub files: usize,
    pub changed: usize,
    pub deleted: usize,
    pub failed: usize,
    pub new_blocks: usize,
    /// Catalog snapshot written by this run, if one was needed.
    pub catalog_block: Option<BlockId>,
}

pub struct BackupEngine {
    ctx: Arc<NodeContext>,
}

impl BackupEngine {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }

    fn ensure_not_recovering(&self) -> Result<(), BackupError> {
        if self.ctx.is_recovering()? {
            return Err(BackupError::Recovering);
        }
        Ok(())
    }

    pub async fn backup_file(&self, root: &BackupRoot, path: &Path) -> Result<FileBackup, BackupError> {
        self.ensure_not_recovering()?;
        let relative = relative_path(&root.path, path)?;
        let mut result = FileBackup::default();

        let source = path.to_path_buf();
        let chunk_size = self.ctx.config.chunk_size;
        let mut chunker = tokio::task::spawn_blocking(move || FileChunker::open(&source, chunk_size))
            .await
            .map_err(reader_failed)??;
        let mut blocks = Vec::new();
        loop {
            let (returned, next) = next_chunk(chunker).await?;
            chunker = returned;
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk?;
            let (id, created) = self.store_chunk(&chunk.data, chunk.hash).await?;
            if created {
                result.new_blocks += 1;
            } else {
                result.reused_blocks += 1;
            }
            blocks.push(id);
        }
        let (hash, size) = chunker.finish();

        let key = FileKey::new(&root.name, &relative);
        let unchanged = self.ctx.store.read(|c| {
            c.latest_version(&key)
                .and_then(|v| v.record.file_hash())
                .map_or(false, |h| *h == hash)
        })?;
        if unchanged {
            log::debug!("{}/{} unchanged", root.name, relative);
            return Ok(result);
        }

        let record = VersionRecord {
            directory: root.name.clone(),
            relative_path: relative,
            timestamp: self.ctx.now(),
            content: VersionContent::File { hash, size, blocks },
        };
        result.version_block = Some(self.write_version(record).await?);
        log::info!(
            "Backed up {} ({} bytes, {} new blocks)",
            path.display(),
            size,
            result.new_blocks
        );
        Ok(result)
    }

    /// Returns the block holding this content and whether it was new.
    async fn store_chunk(&self, data: &[u8], hash: ContentHash) -> Result<(BlockId, bool), BackupError> {
        if let Some(existing) = self.ctx.store.read(|c| c.block_by_hash(&hash).map(|b| b.id.clone()))? {
            return Ok((existing, false));
        }

        let id = BlockId::new_random();
        let (ciphertext, mac) = self.stage(&id, data).await?;
        let secrets = VerificationSecret::generate_batch(
            &ciphertext,
            self.ctx.config.verification.secrets_per_block,
        );
        let now = self.ctx.now();
        let size = data.len() as u64;
        let winner = self.ctx.store.transaction(|c| {
            if let Some(existing) = c.block_by_hash(&hash) {
                return Ok::<_, StoreError>(Some(existing.id.clone()));
            }
            let mut block = Block::data(id.clone(), hash, size, now);
            block.staged = true;
            block.mac = Some(mac);
            c.insert_block(block);
            c.add_secrets(&id, secrets);
            Ok(None)
        })?;

        match winner {
            Some(existing) => {
                // Same content was stored concurrently; keep that block.
                self.ctx.staging.remove(&id).await?;
                Ok((existing, false))
            }
            None => Ok((id, true)),
        }
    }

    async fn stage(&self, id: &BlockId, plaintext: &[u8]) -> Result<(Vec<u8>, crate::model::BlockMac), BackupError> {
        let ciphertext = self.ctx.cipher.encrypt(id, plaintext)?;
        let mac = new_mac(&ciphertext)?;
        self.ctx.staging.put(id, &ciphertext).await?;
        Ok((ciphertext, mac))
    }

    /// Encrypt, stage and register a version or catalog block.
    async fn write_metadata_block(
        &self,
        id: BlockId,
        kind: BlockKind,
        plaintext: &[u8],
    ) -> Result<BlockId, BackupError> {
        let (ciphertext, mac) = self.stage(&id, plaintext).await?;
        let secrets = VerificationSecret::generate_batch(
            &ciphertext,
            self.ctx.config.verification.secrets_per_block,
        );
        let now = self.ctx.now();
        self.ctx.store.transaction(|c| {
            let mut block = Block::metadata(id.clone(), kind, plaintext.len() as u64, now);
            block.staged = true;
            block.mac = Some(mac);
            c.insert_block(block);
            c.add_secrets(&id, secrets);
            Ok::<_, StoreError>(())
        })?;
        Ok(id)
    }

    async fn write_version(&self, record: VersionRecord) -> Result<BlockId, BackupError> {
        let encoded = encode_version(&record)?;
        let id = self
            .write_metadata_block(BlockId::new_random(), BlockKind::Version, &encoded)
            .await?;
        let entry = VersionEntry {
            record,
            block_id: id.clone(),
        };
        let added = self.ctx.store.transaction(|c| Ok::<_, StoreError>(c.add_version(entry)))?;
        if !added {
            log::warn!("A version with the same timestamp already exists; {} not indexed", id);
        }
        Ok(id)
    }

    /// Snapshot of every known version block and directory name.
    pub async fn write_catalog_snapshot(&self) -> Result<BlockId, BackupError> {
        self.ensure_not_recovering()?;
        let now = self.ctx.now();
        let snapshot = self.ctx.store.read(|c| {
            let mut directories = c.directories();
            directories.extend(self.ctx.config.backup_roots.iter().map(|r| r.name.clone()));
            CatalogSnapshot {
                created_at: now,
                directories,
                version_blocks: c.version_block_ids(),
            }
        })?;
        let encoded = encode_catalog(&snapshot)?;
        let id = self
            .write_metadata_block(BlockId::new_catalog(now), BlockKind::Catalog, &encoded)
            .await?;
        log::info!(
            "Wrote catalog snapshot {} ({} versions)",
            id,
            snapshot.version_blocks.len()
        );
        Ok(id)
    }

    /// Back up every file below the root, mark vanished files as deleted
    /// and write a catalog snapshot.
    pub async fn backup_root(&self, name: &str) -> Result<RootBackup, BackupError> {
        let mut summary = self.backup_tree(name).await?;
        summary.catalog_block = self.snapshot_if_changed(&summary).await?;
        Ok(summary)
    }

    /// Every configured root, followed by a single catalog snapshot.
    pub async fn backup_all(&self) -> Result<RootBackup, BackupError> {
        let mut total = RootBackup::default();
        for root in &self.ctx.config.backup_roots {
            let summary = self.backup_tree(&root.name).await?;
            total.files += summary.files;
            total.changed += summary.changed;
            total.deleted += summary.deleted;
            total.failed += summary.failed;
            total.new_blocks += summary.new_blocks;
        }
        total.catalog_block = self.snapshot_if_changed(&total).await?;
        Ok(total)
    }

    /// A run that recorded no new version needs no new snapshot, as long as
    /// one exists already.
    async fn snapshot_if_changed(&self, summary: &RootBackup) -> Result<Option<BlockId>, BackupError> {
        let have_snapshot = self
            .ctx
            .store
            .read(|c| c.blocks().any(|b| b.kind == BlockKind::Catalog))?;
        if summary.changed + summary.deleted == 0 && have_snapshot {
            log::debug!("No version changes; keeping the current catalog snapshot");
            return Ok(None);
        }
        Ok(Some(self.write_catalog_snapshot().await?))
    }

    async fn backup_tree(&self, name: &str) -> Result<RootBackup, BackupError> {
        self.ensure_not_recovering()?;
        let root = self
            .ctx
            .config
            .backup_root(name)
            .cloned()
            .ok_or_else(|| BackupError::UnknownRoot(name.to_string()))?;

        let mut summary = RootBackup::default();
        let mut seen = HashSet::new();
        for file in walk_files(&root.path).await? {
            summary.files += 1;
            match self.backup_file(&root, &file).await {
                Ok(result) => {
                    summary.new_blocks += result.new_blocks;
                    if result.version_block.is_some() {
                        summary.changed += 1;
                    }
                    seen.insert(relative_path(&root.path, &file)?);
                }
                Err(BackupError::Recovering) => return Err(BackupError::Recovering),
                Err(e) => {
                    log::warn!("Skipping {}: {}", file.display(), e);
                    summary.failed += 1;
                    // An unreadable file is not a deleted one.
                    seen.insert(relative_path(&root.path, &file)?);
                }
            }
        }

        let vanished: Vec<FileKey> = self.ctx.store.read(|c| {
            c.file_keys(&root.name)
                .into_iter()
                .filter(|k| !seen.contains(&k.relative_path))
                .filter(|k| c.latest_version(k).map_or(false, |v| !v.record.is_deleted()))
                .collect()
        })?;
        for key in vanished {
            let record = VersionRecord {
                directory: key.directory,
                relative_path: key.relative_path,
                timestamp: self.ctx.now(),
                content: VersionContent::Deleted,
            };
            log::info!("{}/{} was deleted", record.directory, record.relative_path);
            self.write_version(record).await?;
            summary.deleted += 1;
        }

        log::info!("Backup of {}: {:?}", root.name, summary);
        Ok(summary)
    }
}

/// Read the next chunk on the blocking pool, handing the chunker back.
async fn next_chunk(
    mut chunker: FileChunker,
) -> Result<(FileChunker, Option<Result<Chunk, PipelineError>>), BackupError> {
    tokio::task::spawn_blocking(move || {
        let next = chunker.next();
        (chunker, next)
    })
    .await
    .map_err(reader_failed)
}

fn reader_failed(e: tokio::task::JoinError) -> BackupError {
    BackupError::IoError(format!("file reader failed: {}", e))
}

/// `/`-separated path of `path` below `root`.
fn relative_path(root: &Path, path: &Path) -> Result<String, BackupError> {
    let relative = path
        .strip_prefix(root)
        .map_err(|_| BackupError::OutsideRoot(path.display().to_string()))?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        return Err(BackupError::OutsideRoot(path.display().to_string()));
    }
    Ok(parts.join("/"))
}

/// Regular files below `root`, sorted. Symlinks are not followed.
async fn walk_files(root: &Path) -> Result<Vec<PathBuf>, BackupError> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| BackupError::IoError(format!("{}: {}", dir.display(), e)))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| BackupError::IoError(e.to_string()))?
        {
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| BackupError::IoError(e.to_string()))?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                files.push(entry.path());
            }
        }
    }
    files.sort();
    Ok(files)
}
