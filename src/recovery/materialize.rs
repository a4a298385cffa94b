//! Rebuilding files from the restore cache

use tokio::io::AsyncWriteExt;

use super::RecoveryError;
use crate::model::RestorePath;
use crate::store::BlockFiles;

/// Write `path.target` as the concatenation of its cached blocks. A failed
/// write removes whatever was written.
pub async fn write_file(cache: &BlockFiles, path: &RestorePath) -> Result<u64, RecoveryError> {
    if let Some(parent) = path.target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| RecoveryError::Materialize(format!("{}: {}", parent.display(), e)))?;
    }

    match concatenate(cache, path).await {
        Ok(written) => Ok(written),
        Err(e) => {
            if let Err(cleanup) = tokio::fs::remove_file(&path.target).await {
                if cleanup.kind() != std::io::ErrorKind::NotFound {
                    log::warn!(
                        "Could not remove partial file {}: {}",
                        path.target.display(),
                        cleanup
                    );
                }
            }
            Err(e)
        }
    }
}

async fn concatenate(cache: &BlockFiles, path: &RestorePath) -> Result<u64, RecoveryError> {
    let target = path.target.display();
    let mut file = tokio::fs::File::create(&path.target)
        .await
        .map_err(|e| RecoveryError::Materialize(format!("{}: {}", target, e)))?;

    let mut written = 0u64;
    for id in &path.blocks {
        let data = cache
            .get(id)
            .await?
            .ok_or_else(|| RecoveryError::Materialize(format!("{}: block {} not cached", target, id)))?;
        file.write_all(&data)
            .await
            .map_err(|e| RecoveryError::Materialize(format!("{}: {}", target, e)))?;
        written += data.len() as u64;
    }
    file.flush()
        .await
        .map_err(|e| RecoveryError::Materialize(format!("{}: {}", target, e)))?;
    Ok(written)
}
