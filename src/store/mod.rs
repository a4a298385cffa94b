//! Local metadata store
//!
//! A single `Catalog` arena behind one lock. Every mutation goes through
//! `MetadataStore::transaction`, which runs the closure against the arena
//! and marks it dirty; nothing touches disk while the lock is held.
//! `flush` writes a dirty arena out as JSON on the blocking pool. Closures
//! validate before they mutate, so a closure returning `Err` normally leaves
//! the arena as it found it; whatever it did change is still flushed, so
//! memory and disk never disagree after the next flush.

pub mod catalog;
pub mod files;

pub use catalog::Catalog;
pub use files::BlockFiles;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use thiserror::Error;

use crate::model::ModelError;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Persistence error: {0}")]
    PersistenceError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Unknown block: {0}")]
    UnknownBlock(String),

    #[error("Store lock poisoned")]
    Poisoned,

    #[error(transparent)]
    Model(#[from] ModelError),
}

#[derive(Debug)]
pub struct MetadataStore {
    catalog: Mutex<Catalog>,
    path: Option<PathBuf>,
    dirty: AtomicBool,
    /// Serializes writers of the metadata file.
    flushing: tokio::sync::Mutex<()>,
}

impl MetadataStore {
    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self::with_catalog(Catalog::default(), None)
    }

    fn with_catalog(catalog: Catalog, path: Option<PathBuf>) -> Self {
        Self {
            catalog: Mutex::new(catalog),
            path,
            dirty: AtomicBool::new(false),
            flushing: tokio::sync::Mutex::new(()),
        }
    }

    pub fn load_or_create(path: PathBuf) -> Result<Self, StoreError> {
        let catalog = if path.exists() {
            let data = std::fs::read(&path).map_err(|e| {
                StoreError::PersistenceError(format!("Failed to read metadata: {}", e))
            })?;
            Catalog::from_json(&data)?
        } else {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::PersistenceError(format!("Failed to create metadata dir: {}", e))
                })?;
            }
            Catalog::default()
        };
        Ok(Self::with_catalog(catalog, Some(path)))
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Read-only query.
    pub fn read<R>(&self, f: impl FnOnce(&Catalog) -> R) -> Result<R, StoreError> {
        let guard = self.lock()?;
        Ok(f(&*guard))
    }

    /// One read-modify-write under the arena lock.
    pub fn transaction<R, E, F>(&self, f: F) -> Result<R, E>
    where
        F: FnOnce(&mut Catalog) -> Result<R, E>,
        E: From<StoreError>,
    {
        let mut guard = self.lock()?;
        let result = f(&mut *guard);
        self.dirty.store(true, Ordering::SeqCst);
        result
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Write the arena out if anything changed since the last flush.
    /// Returns whether a write happened.
    pub async fn flush(&self) -> Result<bool, StoreError> {
        let Some(path) = self.path.clone() else {
            self.dirty.store(false, Ordering::SeqCst);
            return Ok(false);
        };
        let _writer = self.flushing.lock().await;
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(false);
        }

        let file = self.read(|c| c.to_file())?;
        let written = tokio::task::spawn_blocking(move || {
            let data = file.to_json()?;
            let tmp = path.with_extension("json.tmp");
            std::fs::write(&tmp, data).map_err(|e| {
                StoreError::PersistenceError(format!("Failed to write metadata: {}", e))
            })?;
            std::fs::rename(&tmp, &path).map_err(|e| {
                StoreError::PersistenceError(format!("Failed to replace metadata: {}", e))
            })
        })
        .await
        .map_err(|e| StoreError::PersistenceError(format!("Metadata writer failed: {}", e)))
        .and_then(|r| r);

        if let Err(e) = written {
            self.dirty.store(true, Ordering::SeqCst);
            return Err(e);
        }
        Ok(true)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Catalog>, StoreError> {
        self.catalog.lock().map_err(|_| StoreError::Poisoned)
    }
}
