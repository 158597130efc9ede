//! Alias table in the proxy's libSQL database.

use async_trait::async_trait;
use libsql::{Connection, params};
use tracing::info;

use super::AliasStore;
use crate::error::{AliasError, DatabaseError};
use crate::store::is_sql_identifier;

/// Reads alias records from `{table}(alias, destination)`.
pub struct LibSqlAliasStore {
    conn: Connection,
    table: String,
    select_sql: String,
}

impl LibSqlAliasStore {
    /// Open the alias table, creating it if missing.
    pub async fn open(conn: Connection, table: &str) -> Result<Self, DatabaseError> {
        if !is_sql_identifier(table) {
            return Err(DatabaseError::Query(format!(
                "Invalid alias table name: {table:?}"
            )));
        }

        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    alias TEXT PRIMARY KEY COLLATE NOCASE,
                    destination TEXT NOT NULL
                )"
            ),
            (),
        )
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to create alias table: {e}")))?;

        info!(table, "Alias table ready");
        Ok(Self {
            conn,
            select_sql: format!("SELECT destination FROM {table} WHERE alias = ?1"),
            table: table.to_string(),
        })
    }

    /// Create or replace one record. Used by operators and tests; the
    /// forwarder never writes.
    pub async fn upsert(&self, alias: &str, destination: &str) -> Result<(), DatabaseError> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO {} (alias, destination) VALUES (?1, ?2)
                     ON CONFLICT(alias) DO UPDATE SET destination = excluded.destination",
                    self.table
                ),
                params![alias.trim().to_lowercase(), destination.trim()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to upsert alias: {e}")))?;
        Ok(())
    }

    fn backend_error(&self, e: impl std::fmt::Display) -> AliasError {
        AliasError::Backend {
            store: format!("libsql:{}", self.table),
            reason: e.to_string(),
        }
    }
}

#[async_trait]
impl AliasStore for LibSqlAliasStore {
    fn name(&self) -> &str {
        "libsql"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, AliasError> {
        let mut rows = self
            .conn
            .query(&self.select_sql, params![key.to_lowercase()])
            .await
            .map_err(|e| self.backend_error(e))?;

        match rows.next().await.map_err(|e| self.backend_error(e))? {
            Some(row) => Ok(Some(row.get::<String>(0).map_err(|e| self.backend_error(e))?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    #[tokio::test]
    async fn lookup_is_case_insensitive() {
        let store = Store::open_memory().await.unwrap();
        let aliases = LibSqlAliasStore::open(store.connection(), "aliases")
            .await
            .unwrap();
        aliases.upsert("Billing", "ops@realmail.example").await.unwrap();

        assert_eq!(
            aliases.get("billing").await.unwrap().as_deref(),
            Some("ops@realmail.example")
        );
        assert_eq!(
            aliases.get("BILLING").await.unwrap().as_deref(),
            Some("ops@realmail.example")
        );
        assert_eq!(aliases.get("support").await.unwrap(), None);
    }

    #[tokio::test]
    async fn upsert_replaces_destination() {
        let store = Store::open_memory().await.unwrap();
        let aliases = LibSqlAliasStore::open(store.connection(), "proxy_aliases")
            .await
            .unwrap();
        aliases.upsert("sales", "old@realmail.example").await.unwrap();
        aliases.upsert("sales", "new@realmail.example").await.unwrap();

        assert_eq!(
            aliases.get("sales").await.unwrap().as_deref(),
            Some("new@realmail.example")
        );
    }

    #[tokio::test]
    async fn rejects_unsafe_table_name() {
        let store = Store::open_memory().await.unwrap();
        let result = LibSqlAliasStore::open(store.connection(), "aliases; DROP TABLE rule_sets").await;
        assert!(matches!(result, Err(DatabaseError::Query(_))));
    }
}
