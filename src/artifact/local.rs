use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use super::{check_logical_path, ArtifactError, ArtifactStore, WriteMode};

/// Artifact store rooted at a local directory.
///
/// URLs are `file://` paths unless a public base URL is configured, in which case
/// they are `<base>/<logical path>` (for a directory served by a static file host).
pub struct LocalArtifactStore {
    root: PathBuf,
    public_base: Option<String>,
}

impl LocalArtifactStore {
    pub async fn open(root: impl AsRef<Path>, public_base: Option<String>) -> Result<Self, ArtifactError> {
        fs::create_dir_all(root.as_ref()).await?;
        let root = fs::canonicalize(root.as_ref()).await?;
        Ok(Self {
            root,
            public_base: public_base.map(|b| b.trim_end_matches('/').to_string()),
        })
    }

    fn url_for(&self, logical_path: &str) -> String {
        match &self.public_base {
            Some(base) => format!("{}/{}", base, logical_path),
            None => format!("file://{}", self.root.join(logical_path).display()),
        }
    }

    fn logical_path_of<'a>(&self, url: &'a str) -> Result<&'a str, ArtifactError> {
        let foreign = || ArtifactError::ForeignUrl(url.to_string());
        let logical = match &self.public_base {
            Some(base) => url
                .strip_prefix(base.as_str())
                .and_then(|rest| rest.strip_prefix('/'))
                .ok_or_else(foreign)?,
            None => {
                let root = format!("file://{}/", self.root.display());
                url.strip_prefix(root.as_str()).ok_or_else(foreign)?
            }
        };
        check_logical_path(logical)?;
        Ok(logical)
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn put(&self, bytes: Vec<u8>, logical_path: &str, mode: WriteMode) -> Result<String, ArtifactError> {
        check_logical_path(logical_path)?;
        let target = self.root.join(logical_path);
        let url = self.url_for(logical_path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }

        match mode {
            WriteMode::CreateNew => {
                let mut file = match OpenOptions::new().write(true).create_new(true).open(&target).await {
                    Ok(file) => file,
                    Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                        return Err(ArtifactError::AlreadyExists { url });
                    }
                    Err(e) => return Err(e.into()),
                };
                file.write_all(&bytes).await?;
                file.sync_all().await?;
            }
            WriteMode::Overwrite => {
                let staging = target.with_extension(format!("tmp-{}", Uuid::new_v4().simple()));
                fs::write(&staging, &bytes).await?;
                fs::rename(&staging, &target).await?;
            }
        }

        debug!("Stored {} bytes at {}", bytes.len(), url);
        Ok(url)
    }

    async fn get(&self, url: &str) -> Result<Vec<u8>, ArtifactError> {
        let logical = self.logical_path_of(url)?;
        match fs::read(self.root.join(logical)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(ArtifactError::NotFound(url.to_string())),
            Err(e) => Err(e.into()),
        }
    }
}
