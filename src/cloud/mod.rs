//! Object storage fallback
//!
//! Staged blocks may also be uploaded to object stores so peers can pull
//! them by URL and so a node can recover with no peers online. Stores only
//! ever see ciphertext, named by block ID.

pub mod fetch;
pub mod local_dir;

pub use fetch::{BlobFetcher, UrlBlobFetcher};
pub use local_dir::LocalDirObjectStore;

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CloudError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("Unsupported URL: {0}")]
    UnsupportedUrl(String),
}

/// Every operation is safe to retry. Deleting a missing object succeeds.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn name(&self) -> &str;

    /// Upload a local file under its file name; returns the object name.
    async fn upload(&self, local_path: &Path) -> Result<String, CloudError>;

    /// A download URL for the object.
    async fn share(&self, object: &str) -> Result<String, CloudError>;

    async fn delete(&self, object: &str) -> Result<(), CloudError>;

    async fn list(&self) -> Result<Vec<String>, CloudError>;

    async fn download(&self, object: &str) -> Result<Vec<u8>, CloudError>;
}
