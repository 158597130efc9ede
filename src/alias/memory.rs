//! In-memory alias store, loaded once from pairs.

use std::collections::HashMap;

use async_trait::async_trait;

use super::AliasStore;
use crate::error::AliasError;

#[derive(Debug, Default, Clone)]
pub struct MemoryAliasStore {
    records: HashMap<String, String>,
}

impl MemoryAliasStore {
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self {
            records: pairs
                .into_iter()
                .map(|(alias, destination)| (alias.trim().to_lowercase(), destination.trim().to_string()))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl AliasStore for MemoryAliasStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, AliasError> {
        Ok(self.records.get(&key.to_lowercase()).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn keys_are_normalized() {
        let store = MemoryAliasStore::from_pairs([(" Sales ", "sales@realmail.example")]);
        assert_eq!(store.len(), 1);
        assert_eq!(
            store.get("SALES").await.unwrap().as_deref(),
            Some("sales@realmail.example")
        );
        assert_eq!(store.get("support").await.unwrap(), None);
    }
}
