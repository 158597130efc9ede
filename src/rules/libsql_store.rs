//! Rule sets persisted in the proxy's libSQL database.

use async_trait::async_trait;
use libsql::{Connection, params};
use tracing::debug;

use super::{RuleSet, RuleSetService};
use crate::error::{ControlError, DatabaseError};

/// Stores definitions in `rule_sets` and the active name in the single-row
/// `active_rule_set` table.
pub struct LibSqlRuleSets {
    conn: Connection,
}

impl LibSqlRuleSets {
    /// Expects the schema from [`crate::store::migrations`].
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    pub async fn get_rule_set(&self, name: &str) -> Result<Option<RuleSet>, ControlError> {
        let mut rows = self
            .conn
            .query(
                "SELECT definition FROM rule_sets WHERE name = ?1",
                params![name],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to load rule set: {e}")))?;

        let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to read rule set: {e}")))?
        else {
            return Ok(None);
        };

        let definition: String = row
            .get(0)
            .map_err(|e| DatabaseError::Query(format!("Failed to read definition: {e}")))?;
        let rule_set = serde_json::from_str(&definition)
            .map_err(|e| DatabaseError::Serialization(format!("Corrupt rule set {name}: {e}")))?;
        Ok(Some(rule_set))
    }
}

#[async_trait]
impl RuleSetService for LibSqlRuleSets {
    async fn put_rule_set(&self, rule_set: &RuleSet) -> Result<(), ControlError> {
        let definition = serde_json::to_string(rule_set)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        self.conn
            .execute(
                "INSERT INTO rule_sets (name, definition) VALUES (?1, ?2)
                 ON CONFLICT(name) DO UPDATE SET
                    definition = excluded.definition,
                    updated_at = datetime('now')",
                params![rule_set.name.as_str(), definition],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to store rule set: {e}")))?;
        Ok(())
    }

    async fn set_active_rule_set(&self, name: &str) -> Result<(), ControlError> {
        if self.get_rule_set(name).await?.is_none() {
            return Err(ControlError::RuleSetNotFound {
                name: name.to_string(),
            });
        }

        let changed = self
            .conn
            .execute(
                "INSERT INTO active_rule_set (slot, name) VALUES (1, ?1)
                 ON CONFLICT(slot) DO UPDATE SET
                    name = excluded.name,
                    activated_at = datetime('now')
                 WHERE active_rule_set.name <> excluded.name",
                params![name],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to activate rule set: {e}")))?;

        debug!(rule_set = name, changed, "Active rule set written");
        Ok(())
    }

    async fn active_rule_set(&self) -> Result<Option<String>, ControlError> {
        let mut rows = self
            .conn
            .query("SELECT name FROM active_rule_set WHERE slot = 1", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to query active rule set: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to read active rule set: {e}")))?
        {
            Some(row) => Ok(Some(row.get::<String>(0).map_err(|e| {
                DatabaseError::Query(format!("Failed to read active rule set: {e}"))
            })?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{DEFAULT_RULE_NAME, ReceiptRule, RuleAction, RuleSetActivator};
    use crate::store::Store;
    use std::sync::Arc;

    fn rule_set(name: &str, prefix: &str) -> RuleSet {
        RuleSet {
            name: name.into(),
            rules: vec![ReceiptRule {
                name: DEFAULT_RULE_NAME.into(),
                enabled: true,
                scan_enabled: true,
                recipients: vec!["proxy.example".into()],
                actions: vec![RuleAction::Archive {
                    bucket: "mail-archive".into(),
                    prefix: prefix.into(),
                }],
            }],
        }
    }

    async fn service() -> LibSqlRuleSets {
        let store = Store::open_memory().await.unwrap();
        LibSqlRuleSets::new(store.connection())
    }

    #[tokio::test]
    async fn put_is_create_or_update() {
        let rules = service().await;
        rules.put_rule_set(&rule_set("main", "v1")).await.unwrap();
        rules.put_rule_set(&rule_set("main", "v2")).await.unwrap();

        let stored = rules.get_rule_set("main").await.unwrap().unwrap();
        assert_eq!(stored, rule_set("main", "v2"));
        assert!(rules.get_rule_set("other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn activation_is_idempotent_and_exclusive() {
        let rules = Arc::new(service().await);
        rules.put_rule_set(&rule_set("a", "x")).await.unwrap();
        rules.put_rule_set(&rule_set("b", "x")).await.unwrap();
        let activator = RuleSetActivator::new(rules.clone());

        assert_eq!(rules.active_rule_set().await.unwrap(), None);
        activator.ensure_active("a").await.unwrap();
        activator.ensure_active("a").await.unwrap();
        assert_eq!(rules.active_rule_set().await.unwrap().as_deref(), Some("a"));

        activator.ensure_active("b").await.unwrap();
        assert_eq!(rules.active_rule_set().await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn unknown_rule_set_cannot_be_activated() {
        let rules = service().await;
        let err = rules.set_active_rule_set("ghost").await.unwrap_err();
        assert!(matches!(err, ControlError::RuleSetNotFound { .. }));
    }
}
