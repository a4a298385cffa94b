//! Directory-backed object store.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::{CloudError, ObjectStore};

#[derive(Debug, Clone)]
pub struct LocalDirObjectStore {
    name: String,
    dir: PathBuf,
}

impl LocalDirObjectStore {
    pub fn new(name: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            dir: dir.into(),
        }
    }

    fn object_path(&self, object: &str) -> Result<PathBuf, CloudError> {
        if object.is_empty() || object.contains(['/', '\\']) || object.starts_with('.') {
            return Err(CloudError::NotFound(object.to_string()));
        }
        Ok(self.dir.join(object))
    }
}

fn io_error(e: std::io::Error, object: &str) -> CloudError {
    if e.kind() == std::io::ErrorKind::NotFound {
        CloudError::NotFound(object.to_string())
    } else {
        CloudError::IoError(e.to_string())
    }
}

#[async_trait]
impl ObjectStore for LocalDirObjectStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn upload(&self, local_path: &Path) -> Result<String, CloudError> {
        let object = local_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| CloudError::IoError(format!("no file name in {}", local_path.display())))?
            .to_string();
        let dest = self.object_path(&object)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| CloudError::IoError(e.to_string()))?;
        let tmp = self.dir.join(format!(".{}.upload", object));
        tokio::fs::copy(local_path, &tmp)
            .await
            .map_err(|e| io_error(e, &object))?;
        tokio::fs::rename(&tmp, &dest)
            .await
            .map_err(|e| CloudError::IoError(e.to_string()))?;
        log::debug!("Uploaded {} to store {}", object, self.name);
        Ok(object)
    }

    async fn share(&self, object: &str) -> Result<String, CloudError> {
        let path = self.object_path(object)?;
        let path = tokio::fs::canonicalize(&path)
            .await
            .map_err(|e| io_error(e, object))?;
        Ok(format!("file://{}", path.display()))
    }

    async fn delete(&self, object: &str) -> Result<(), CloudError> {
        let path = self.object_path(object)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CloudError::IoError(e.to_string())),
        }
    }

    async fn list(&self) -> Result<Vec<String>, CloudError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CloudError::IoError(e.to_string())),
        };
        let mut objects = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CloudError::IoError(e.to_string()))?
        {
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with('.') {
                    objects.push(name.to_string());
                }
            }
        }
        objects.sort();
        Ok(objects)
    }

    async fn download(&self, object: &str) -> Result<Vec<u8>, CloudError> {
        let path = self.object_path(object)?;
        tokio::fs::read(&path).await.map_err(|e| io_error(e, object))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upload_share_list_delete() {
        let src = tempfile::tempdir().unwrap();
        let bucket = tempfile::tempdir().unwrap();
        let store = LocalDirObjectStore::new("local", bucket.path());

        let file = src.path().join("abc123");
        std::fs::write(&file, b"ciphertext").unwrap();

        assert_eq!(store.upload(&file).await.unwrap(), "abc123");
        assert_eq!(store.list().await.unwrap(), vec!["abc123".to_string()]);
        assert!(store.share("abc123").await.unwrap().starts_with("file://"));
        assert_eq!(store.download("abc123").await.unwrap(), b"ciphertext");

        store.delete("abc123").await.unwrap();
        store.delete("abc123").await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
        assert!(matches!(
            store.download("abc123").await,
            Err(CloudError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_directory_lists_empty() {
        let root = tempfile::tempdir().unwrap();
        let store = LocalDirObjectStore::new("local", root.path().join("absent"));
        assert!(store.list().await.unwrap().is_empty());
        assert!(store.download("../escape").await.is_err());
    }
}
