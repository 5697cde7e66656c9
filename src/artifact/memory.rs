use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{check_logical_path, ArtifactError, ArtifactStore, WriteMode};

const SCHEME: &str = "mem://";

/// Artifact store held in process memory. URLs take the form `mem://<logical path>`.
#[derive(Default)]
pub struct MemoryArtifactStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn url_for(logical_path: &str) -> String {
        format!("{}{}", SCHEME, logical_path)
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put(&self, bytes: Vec<u8>, logical_path: &str, mode: WriteMode) -> Result<String, ArtifactError> {
        check_logical_path(logical_path)?;
        let url = Self::url_for(logical_path);
        let mut objects = self.objects.write().await;
        if mode == WriteMode::CreateNew && objects.contains_key(logical_path) {
            return Err(ArtifactError::AlreadyExists { url });
        }
        objects.insert(logical_path.to_string(), bytes);
        Ok(url)
    }

    async fn get(&self, url: &str) -> Result<Vec<u8>, ArtifactError> {
        let path = url
            .strip_prefix(SCHEME)
            .ok_or_else(|| ArtifactError::ForeignUrl(url.to_string()))?;
        self.objects
            .read()
            .await
            .get(path)
            .cloned()
            .ok_or_else(|| ArtifactError::NotFound(url.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_new_refuses_collision() {
        let store = MemoryArtifactStore::new();
        let url = store.put(b"a".to_vec(), "o/v/dataset.jsonl", WriteMode::CreateNew).await.unwrap();
        assert_eq!(url, "mem://o/v/dataset.jsonl");

        let err = store
            .put(b"b".to_vec(), "o/v/dataset.jsonl", WriteMode::CreateNew)
            .await
            .unwrap_err();
        assert!(matches!(err, ArtifactError::AlreadyExists { .. }));
        assert_eq!(store.get(&url).await.unwrap(), b"a");

        store.put(b"c".to_vec(), "o/v/dataset.jsonl", WriteMode::Overwrite).await.unwrap();
        assert_eq!(store.get(&url).await.unwrap(), b"c");
    }

    #[tokio::test]
    async fn foreign_urls_are_rejected() {
        let store = MemoryArtifactStore::new();
        assert!(matches!(
            store.get("https://example.com/x").await,
            Err(ArtifactError::ForeignUrl(_))
        ));
        assert!(matches!(store.get("mem://missing").await, Err(ArtifactError::NotFound(_))));
    }
}
