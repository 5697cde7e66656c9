//! Read-through for artifacts published by other services.
//!
//! Trainers hand back adapter URLs on their own storage. Objects the wrapped store does not
//! serve are downloaded when the URL is plain HTTP(S).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, error};

use super::{ArtifactError, ArtifactStore, WriteMode};

pub struct HttpFallbackStore {
    inner: Arc<dyn ArtifactStore>,
    client: Client,
}

impl HttpFallbackStore {
    pub fn new(inner: Arc<dyn ArtifactStore>, timeout: Duration) -> Result<Self, ArtifactError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ArtifactError::Download(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { inner, client })
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, ArtifactError> {
        debug!("Downloading foreign artifact {}", url);
        let response = self.client.get(url).send().await.map_err(|e| {
            error!("Artifact download failed for {}: {}", url, e);
            ArtifactError::Download(format!("{}: {}", url, e))
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ArtifactError::NotFound(url.to_string()));
        }
        if !status.is_success() {
            return Err(ArtifactError::Download(format!("{} returned {}", url, status)));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ArtifactError::Download(format!("{}: {}", url, e)))?;
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl ArtifactStore for HttpFallbackStore {
    async fn put(&self, bytes: Vec<u8>, logical_path: &str, mode: WriteMode) -> Result<String, ArtifactError> {
        self.inner.put(bytes, logical_path, mode).await
    }

    async fn get(&self, url: &str) -> Result<Vec<u8>, ArtifactError> {
        match self.inner.get(url).await {
            Err(ArtifactError::ForeignUrl(_)) if url.starts_with("http://") || url.starts_with("https://") => {
                self.download(url).await
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::MemoryArtifactStore;

    fn store() -> HttpFallbackStore {
        HttpFallbackStore::new(Arc::new(MemoryArtifactStore::new()), Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn own_urls_use_the_wrapped_store() {
        let store = store();
        let url = store
            .put(b"weights".to_vec(), "org/v0/adapter.bin", WriteMode::CreateNew)
            .await
            .unwrap();
        assert_eq!(store.get(&url).await.unwrap(), b"weights");
        assert!(matches!(
            store.get("mem://org/v0/missing.bin").await,
            Err(ArtifactError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn non_http_foreign_urls_are_rejected() {
        assert!(matches!(
            store().get("s3://bucket/org/v0/adapter.bin").await,
            Err(ArtifactError::ForeignUrl(_))
        ));
    }

    #[tokio::test]
    async fn unreachable_http_urls_are_download_errors() {
        assert!(matches!(
            store().get("http://127.0.0.1:1/adapter.bin").await,
            Err(ArtifactError::Download(_))
        ));
    }
}
