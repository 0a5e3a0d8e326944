//! Metadata Store (spec §4.A): durable record of friends, sessions, audit
//! log, and rate-limit counters, backed by a single embedded SQLite file.

mod audit;
mod friend;
mod rate;
mod session;

pub use audit::{AuditEntry, Direction};
pub use friend::{Friend, FriendUpdate};
pub use rate::RateDecision;
pub use session::Session;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;

use crate::error::{AppError, Result};

/// Permission tier ordering: admin > trusted > normal > blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Permission {
    Blocked,
    Normal,
    Trusted,
    Admin,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Admin => "admin",
            Permission::Trusted => "trusted",
            Permission::Normal => "normal",
            Permission::Blocked => "blocked",
        }
    }
}

impl FromStr for Permission {
    type Err = AppError;

    /// Unknown tokens default to `normal`, per spec §3.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "admin" => Permission::Admin,
            "trusted" => Permission::Trusted,
            "blocked" => Permission::Blocked,
            _ => Permission::Normal,
        })
    }
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Now, re-exported so callers timestamp consistently with the store's own
/// notion of "now" and so tests can reason about it without a live clock.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if absent) the embedded SQLite database at `path` and
    /// run idempotent schema creation.
    pub async fn open(path: &str) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    AppError::StoreError(sqlx::Error::Io(e))
                })?;
            }
        }

        let options = SqliteConnectOptions::from_str(path)
            .map_err(AppError::StoreError)?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.create_schema().await?;
        Ok(store)
    }

    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self> {
        Self::open(":memory:").await
    }

    async fn create_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS friends (
                wxid TEXT PRIMARY KEY,
                nickname TEXT NOT NULL,
                remark_name TEXT,
                permission TEXT NOT NULL CHECK (permission IN ('admin','trusted','normal','blocked')),
                added_at TEXT NOT NULL,
                added_by TEXT,
                notes TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                wxid TEXT NOT NULL REFERENCES friends(wxid),
                claude_session TEXT,
                created_at TEXT NOT NULL,
                last_active TEXT NOT NULL,
                message_count INTEGER NOT NULL DEFAULT 0 CHECK (message_count >= 0)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sessions_wxid ON sessions(wxid)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                wxid TEXT NOT NULL,
                nickname TEXT NOT NULL,
                direction TEXT NOT NULL CHECK (direction IN ('in','out')),
                message TEXT,
                claude_session TEXT,
                timestamp TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_audit_wxid ON audit_log(wxid)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_log(timestamp DESC)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rate_counters (
                wxid TEXT NOT NULL,
                window_start TEXT NOT NULL,
                request_count INTEGER NOT NULL CHECK (request_count >= 1),
                PRIMARY KEY (wxid, window_start)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
