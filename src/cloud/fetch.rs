//! Downloading shared block URLs
//!
//! A peer receiving `BACKUP` with a shared URL pulls the ciphertext itself.

use std::time::Duration;

use async_trait::async_trait;

use super::CloudError;

#[async_trait]
pub trait BlobFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, CloudError>;
}

/// `file://` URLs are read from disk, `http(s)://` URLs with reqwest.
#[derive(Debug, Clone)]
pub struct UrlBlobFetcher {
    client: reqwest::Client,
}

impl UrlBlobFetcher {
    pub fn new() -> Result<Self, CloudError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .user_agent(concat!("peerkeep/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CloudError::HttpError(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl BlobFetcher for UrlBlobFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, CloudError> {
        if let Some(path) = url.strip_prefix("file://") {
            return tokio::fs::read(path).await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    CloudError::NotFound(url.to_string())
                } else {
                    CloudError::IoError(e.to_string())
                }
            });
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(CloudError::UnsupportedUrl(url.to_string()));
        }

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| CloudError::HttpError(e.to_string()))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(CloudError::NotFound(url.to_string()));
        }
        let response = response
            .error_for_status()
            .map_err(|e| CloudError::HttpError(e.to_string()))?;
        let body = response
            .bytes()
            .await
            .map_err(|e| CloudError::HttpError(e.to_string()))?;
        Ok(body.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_urls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        std::fs::write(&path, b"bytes").unwrap();
        let fetcher = UrlBlobFetcher::new().unwrap();

        let url = format!("file://{}", path.display());
        assert_eq!(fetcher.fetch(&url).await.unwrap(), b"bytes");

        let missing = format!("file://{}", dir.path().join("nope").display());
        assert!(matches!(
            fetcher.fetch(&missing).await,
            Err(CloudError::NotFound(_))
        ));
        assert!(matches!(
            fetcher.fetch("ftp://example/blob").await,
            Err(CloudError::UnsupportedUrl(_))
        ));
    }
}
