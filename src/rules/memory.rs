//! In-memory rule-set service.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{RuleSet, RuleSetService};
use crate::error::ControlError;

#[derive(Debug, Default)]
pub struct MemoryRuleSets {
    rule_sets: RwLock<HashMap<String, RuleSet>>,
    active: RwLock<Option<String>>,
    activation_calls: AtomicU32,
}

impl MemoryRuleSets {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, name: &str) -> Option<RuleSet> {
        self.rule_sets.read().await.get(name).cloned()
    }

    /// Number of `set_active_rule_set` calls received.
    pub fn activation_calls(&self) -> u32 {
        self.activation_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RuleSetService for MemoryRuleSets {
    async fn put_rule_set(&self, rule_set: &RuleSet) -> Result<(), ControlError> {
        self.rule_sets
            .write()
            .await
            .insert(rule_set.name.clone(), rule_set.clone());
        Ok(())
    }

    async fn set_active_rule_set(&self, name: &str) -> Result<(), ControlError> {
        self.activation_calls.fetch_add(1, Ordering::SeqCst);
        if !self.rule_sets.read().await.contains_key(name) {
            return Err(ControlError::RuleSetNotFound {
                name: name.to_string(),
            });
        }
        *self.active.write().await = Some(name.to_string());
        Ok(())
    }

    async fn active_rule_set(&self) -> Result<Option<String>, ControlError> {
        Ok(self.active.read().await.clone())
    }
}
