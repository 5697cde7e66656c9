//! Content storage for curated datasets and trained adapters.

use async_trait::async_trait;
use thiserror::Error;

pub mod http;
pub mod local;
pub mod memory;

pub use http::HttpFallbackStore;
pub use local::LocalArtifactStore;
pub use memory::MemoryArtifactStore;

/// How `put` treats an object already present at the logical path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Fail with [`ArtifactError::AlreadyExists`].
    CreateNew,
    /// Replace the existing object.
    Overwrite,
}

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("artifact already exists at {url}")]
    AlreadyExists { url: String },

    #[error("artifact not found: {0}")]
    NotFound(String),

    #[error("invalid artifact path: {0}")]
    InvalidPath(String),

    #[error("url is not served by this store: {0}")]
    ForeignUrl(String),

    #[error("artifact download failed: {0}")]
    Download(String),

    #[error("artifact IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store `bytes` under `logical_path` and return the retrieval URL.
    async fn put(&self, bytes: Vec<u8>, logical_path: &str, mode: WriteMode) -> Result<String, ArtifactError>;

    async fn get(&self, url: &str) -> Result<Vec<u8>, ArtifactError>;
}

/// Reject absolute paths, empty segments and parent traversal.
pub fn check_logical_path(logical_path: &str) -> Result<(), ArtifactError> {
    let bad = logical_path.is_empty()
        || logical_path.starts_with('/')
        || logical_path.contains('\\')
        || logical_path
            .split('/')
            .any(|seg| seg.is_empty() || seg == "." || seg == "..");
    if bad {
        return Err(ArtifactError::InvalidPath(logical_path.to_string()));
    }
    Ok(())
}
