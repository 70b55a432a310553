//! libSQL backend — async `Store` trait implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::info;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{AccountLink, PostbackToken, Store};

/// libSQL store backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Connection(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Connection(format!("Failed to open database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Connection(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        store.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Connection(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Connection(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        store.run_migrations().await?;
        Ok(store)
    }
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

#[async_trait]
impl Store for LibSqlStore {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(&self.conn).await
    }

    async fn get_account_link(&self, user_id: &str) -> Result<Option<AccountLink>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT user_id, auth_code, created_at FROM account_links WHERE user_id = ?1",
                params![user_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to query account link: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to read account link: {e}")))?;

        match row {
            Some(row) => {
                let user_id: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(e.to_string()))?;
                let auth_code: String = row
                    .get(1)
                    .map_err(|e| DatabaseError::Query(e.to_string()))?;
                let created_at: String = row
                    .get(2)
                    .map_err(|e| DatabaseError::Query(e.to_string()))?;
                Ok(Some(AccountLink {
                    user_id,
                    auth_code,
                    created_at: parse_datetime(&created_at),
                }))
            }
            None => Ok(None),
        }
    }

    async fn create_account_link(
        &self,
        user_id: &str,
        auth_code: &str,
    ) -> Result<(), DatabaseError> {
        // Atomic upsert: repeating a link for the same user keeps one row.
        self.conn
            .execute(
                "INSERT INTO account_links (user_id, auth_code, created_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_id) DO UPDATE SET auth_code = excluded.auth_code",
                params![user_id, auth_code, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to create account link: {e}")))?;
        Ok(())
    }

    async fn delete_account_link(&self, user_id: &str) -> Result<bool, DatabaseError> {
        let affected = self
            .conn
            .execute(
                "DELETE FROM account_links WHERE user_id = ?1",
                params![user_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to delete account link: {e}")))?;
        Ok(affected > 0)
    }

    async fn issue_postback_token(&self) -> Result<String, DatabaseError> {
        let value = Uuid::new_v4().simple().to_string();
        self.conn
            .execute(
                "INSERT INTO postback_tokens (value, issue_dt) VALUES (?1, ?2)",
                params![value.as_str(), Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to issue postback token: {e}")))?;
        Ok(value)
    }

    async fn close_postback_token(&self, value: &str) -> Result<bool, DatabaseError> {
        // Single conditional UPDATE so the open → closed transition is
        // atomic even under near-simultaneous webhook deliveries.
        let affected = self
            .conn
            .execute(
                "UPDATE postback_tokens SET close_dt = ?1
                 WHERE value = ?2 AND close_dt IS NULL",
                params![Utc::now().to_rfc3339(), value],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to close postback token: {e}")))?;
        Ok(affected > 0)
    }

    async fn get_postback_token(
        &self,
        value: &str,
    ) -> Result<Option<PostbackToken>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT value, issue_dt, close_dt FROM postback_tokens WHERE value = ?1",
                params![value],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to query postback token: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to read postback token: {e}")))?;

        match row {
            Some(row) => {
                let value: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(e.to_string()))?;
                let issue_dt: String = row
                    .get(1)
                    .map_err(|e| DatabaseError::Query(e.to_string()))?;
                let close_dt: Option<String> = row
                    .get(2)
                    .map_err(|e| DatabaseError::Query(e.to_string()))?;
                Ok(Some(PostbackToken {
                    value,
                    issue_dt: parse_datetime(&issue_dt),
                    close_dt: close_dt.as_deref().map(parse_datetime),
                }))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> LibSqlStore {
        LibSqlStore::new_memory().await.unwrap()
    }

    #[tokio::test]
    async fn account_link_roundtrip() {
        let store = test_store().await;

        assert!(store.get_account_link("u1").await.unwrap().is_none());

        store.create_account_link("u1", "auth123").await.unwrap();
        let link = store.get_account_link("u1").await.unwrap().unwrap();
        assert_eq!(link.user_id, "u1");
        assert_eq!(link.auth_code, "auth123");

        assert!(store.delete_account_link("u1").await.unwrap());
        assert!(store.get_account_link("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn account_link_create_is_idempotent() {
        let store = test_store().await;

        store.create_account_link("u1", "first").await.unwrap();
        store.create_account_link("u1", "second").await.unwrap();

        // Still exactly one row, carrying the latest code.
        let link = store.get_account_link("u1").await.unwrap().unwrap();
        assert_eq!(link.auth_code, "second");

        assert!(store.delete_account_link("u1").await.unwrap());
        assert!(!store.delete_account_link("u1").await.unwrap());
    }

    #[tokio::test]
    async fn delete_missing_account_link_is_false() {
        let store = test_store().await;
        assert!(!store.delete_account_link("nobody").await.unwrap());
    }

    #[tokio::test]
    async fn postback_token_closes_exactly_once() {
        let store = test_store().await;

        let value = store.issue_postback_token().await.unwrap();
        let token = store.get_postback_token(&value).await.unwrap().unwrap();
        assert!(token.close_dt.is_none());

        assert!(store.close_postback_token(&value).await.unwrap());
        let token = store.get_postback_token(&value).await.unwrap().unwrap();
        assert!(token.close_dt.is_some());

        // Second consume attempt is rejected.
        assert!(!store.close_postback_token(&value).await.unwrap());
    }

    #[tokio::test]
    async fn closing_unknown_token_is_false() {
        let store = test_store().await;
        assert!(!store.close_postback_token("no-such-token").await.unwrap());
    }

    #[tokio::test]
    async fn issued_tokens_are_distinct() {
        let store = test_store().await;
        let a = store.issue_postback_token().await.unwrap();
        let b = store.issue_postback_token().await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn local_file_store_persists() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("bridge.db");

        {
            let store = LibSqlStore::new_local(&path).await.unwrap();
            store.create_account_link("u1", "auth").await.unwrap();
        }

        let store = LibSqlStore::new_local(&path).await.unwrap();
        assert!(store.get_account_link("u1").await.unwrap().is_some());
    }
}
