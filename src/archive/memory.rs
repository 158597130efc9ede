//! In-memory archive.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::ArchiveStore;
use crate::error::ArchiveError;

#[derive(Debug, Default)]
pub struct MemoryArchive {
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put(&self, key: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.objects.write().await.insert(key.into(), bytes.into());
    }
}

#[async_trait]
impl ArchiveStore for MemoryArchive {
    async fn get(&self, key: &str) -> Result<Vec<u8>, ArchiveError> {
        self.objects
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| ArchiveError::NotFound {
                key: key.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get() {
        let archive = MemoryArchive::new();
        archive.put("inbound/a", b"raw".to_vec()).await;
        assert_eq!(archive.get("inbound/a").await.unwrap(), b"raw");
        assert!(matches!(
            archive.get("inbound/b").await,
            Err(ArchiveError::NotFound { .. })
        ));
    }
}
