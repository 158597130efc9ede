//! Filesystem archive: objects live at `{root}/{bucket}/{key}`.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use super::ArchiveStore;
use crate::error::ArchiveError;

#[derive(Debug, Clone)]
pub struct FsArchive {
    bucket_dir: PathBuf,
}

impl FsArchive {
    pub fn new(root: impl AsRef<Path>, bucket: &str) -> Self {
        Self {
            bucket_dir: root.as_ref().join(bucket),
        }
    }

    /// Map a key onto a path inside the bucket directory.
    fn path_for(&self, key: &str) -> Result<PathBuf, ArchiveError> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(ArchiveError::InvalidKey(key.to_string()));
        }
        Ok(self.bucket_dir.join(relative))
    }
}

#[async_trait]
impl ArchiveStore for FsArchive {
    async fn get(&self, key: &str) -> Result<Vec<u8>, ArchiveError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                debug!(key, bytes = bytes.len(), "Archive object read");
                Ok(bytes)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Err(ArchiveError::NotFound {
                key: key.to_string(),
            }),
            Err(e) => Err(ArchiveError::Unavailable {
                key: key.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}
