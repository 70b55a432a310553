//! Backend-agnostic `Store` trait for bridge persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;

/// Association between a messaging user and an external authenticated
/// identity. At most one row per user id (primary key).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountLink {
    pub user_id: String,
    pub auth_code: String,
    pub created_at: DateTime<Utc>,
}

/// A one-shot token embedded in a button/quick-reply payload.
///
/// A token is closed (consumed) at most once; a second attempt to consume
/// it must be rejected.
#[derive(Debug, Clone)]
pub struct PostbackToken {
    pub value: String,
    pub issue_dt: DateTime<Utc>,
    pub close_dt: Option<DateTime<Utc>>,
}

/// Async persistence interface for account links and postback tokens.
#[async_trait]
pub trait Store: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Account links ───────────────────────────────────────────────

    /// Look up the account link for a user, if any.
    async fn get_account_link(&self, user_id: &str) -> Result<Option<AccountLink>, DatabaseError>;

    /// Create (or refresh) the account link for a user. Idempotent: a
    /// repeated link for the same user never creates a second row.
    async fn create_account_link(
        &self,
        user_id: &str,
        auth_code: &str,
    ) -> Result<(), DatabaseError>;

    /// Delete the account link for a user. Returns whether a row existed.
    async fn delete_account_link(&self, user_id: &str) -> Result<bool, DatabaseError>;

    // ── Postback tokens ─────────────────────────────────────────────

    /// Issue a fresh open token and return its value.
    async fn issue_postback_token(&self) -> Result<String, DatabaseError>;

    /// Consume a token: the open → closed transition happens at most once.
    /// Returns `true` only for the call that actually closed it; a missing
    /// or already-closed token returns `false`.
    async fn close_postback_token(&self, value: &str) -> Result<bool, DatabaseError>;

    /// Look up a token by value (diagnostics and tests).
    async fn get_postback_token(
        &self,
        value: &str,
    ) -> Result<Option<PostbackToken>, DatabaseError>;
}
