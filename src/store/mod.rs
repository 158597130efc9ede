//! Persistence layer: a libSQL database shared by the alias table and the
//! rule-set control plane.

pub mod migrations;

use std::path::Path;
use std::sync::Arc;

use libsql::{Connection, Database};
use tracing::info;

use crate::error::DatabaseError;

/// Handle to the proxy's database.
///
/// Holds a single connection that is cloned into every component.
/// `libsql::Connection` is `Send + Sync` and an in-memory database only lives
/// as long as the connection that created it, so all components share one.
#[derive(Clone)]
pub struct Store {
    #[allow(dead_code)]
    db: Arc<Database>,
    conn: Connection,
}

impl Store {
    /// Open (or create) a local database file and run migrations.
    pub async fn open_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn open_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: Database) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    /// A handle to the shared connection.
    pub fn connection(&self) -> Connection {
        self.conn.clone()
    }
}

/// Whether `name` can be spliced into SQL as a bare identifier.
pub fn is_sql_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers() {
        assert!(is_sql_identifier("aliases"));
        assert!(is_sql_identifier("_proxy_aliases2"));
        assert!(!is_sql_identifier(""));
        assert!(!is_sql_identifier("2aliases"));
        assert!(!is_sql_identifier("aliases; DROP TABLE x"));
        assert!(!is_sql_identifier("my-aliases"));
    }

    #[tokio::test]
    async fn local_file_is_created_with_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/proxy.db");
        let store = Store::open_local(&path).await.unwrap();
        assert!(path.exists());

        let mut rows = store
            .connection()
            .query("SELECT COUNT(*) FROM _migrations", ())
            .await
            .unwrap();
        let count: i64 = rows.next().await.unwrap().unwrap().get(0).unwrap();
        assert!(count >= 1);
    }
}
