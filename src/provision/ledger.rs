//! Credential ledger of a provisioning agent
//!
//! One row per issued credential. The short id column carries a UNIQUE index;
//! nothing checks for collisions before insertion, so a duplicate surfaces as
//! `LedgerError::DuplicateShortId` from `insert`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("short id {0} is already issued")]
    DuplicateShortId(String),

    #[error("corrupt ledger row: {0}")]
    Corrupt(String),
}

/// One issued credential
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManagedCredential {
    pub id: i64,
    pub owner_id: String,
    pub client_id: String,
    pub short_id: String,
    pub server_name: String,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
}

/// Fields of a credential before the ledger assigns its id
#[derive(Debug, Clone)]
pub struct NewCredential {
    pub owner_id: String,
    pub client_id: String,
    pub short_id: String,
    pub server_name: String,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
}

/// Storage of issued credentials
#[async_trait]
pub trait CredentialLedger: Send + Sync {
    async fn insert(&self, credential: NewCredential) -> Result<ManagedCredential, LedgerError>;

    async fn get(&self, id: i64) -> Result<Option<ManagedCredential>, LedgerError>;

    /// Credentials of one owner, ordered by id
    async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<ManagedCredential>, LedgerError>;

    async fn count_by_owner(&self, owner_id: &str) -> Result<u64, LedgerError>;

    /// Returns whether a row was deleted
    async fn delete(&self, id: i64) -> Result<bool, LedgerError>;
}

/// SQLite-backed credential ledger
pub struct SqliteCredentialLedger {
    pool: SqlitePool,
}

impl SqliteCredentialLedger {
    /// Open (creating if needed) the ledger database at `path`
    pub async fn open(path: &str) -> Result<Self, LedgerError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    /// Private in-memory database (single connection so every query sees it)
    pub async fn in_memory() -> Result<Self, LedgerError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(SqliteConnectOptions::from_str("sqlite::memory:")?)
            .await?;
        Self::with_pool(pool).await
    }

    pub async fn with_pool(pool: SqlitePool) -> Result<Self, LedgerError> {
        let ledger = Self { pool };
        ledger.initialize().await?;
        Ok(ledger)
    }

    async fn initialize(&self) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS keys (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                uuid TEXT NOT NULL,
                short_id TEXT NOT NULL,
                server_name TEXT NOT NULL,
                key_name TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_keys_user_id ON keys(user_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE UNIQUE INDEX IF NOT EXISTS idx_keys_short_id ON keys(short_id)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ManagedCredential, LedgerError> {
        let created_at: String = row.try_get("created_at")?;
        let created_at = DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| LedgerError::Corrupt(format!("created_at {:?}: {}", created_at, e)))?
            .with_timezone(&Utc);

        Ok(ManagedCredential {
            id: row.try_get("id")?,
            owner_id: row.try_get("user_id")?,
            client_id: row.try_get("uuid")?,
            short_id: row.try_get("short_id")?,
            server_name: row.try_get("server_name")?,
            display_name: row.try_get("key_name")?,
            created_at,
        })
    }
}

#[async_trait]
impl CredentialLedger for SqliteCredentialLedger {
    async fn insert(&self, credential: NewCredential) -> Result<ManagedCredential, LedgerError> {
        let result = sqlx::query(
            r#"
            INSERT INTO keys (user_id, uuid, short_id, server_name, key_name, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&credential.owner_id)
        .bind(&credential.client_id)
        .bind(&credential.short_id)
        .bind(&credential.server_name)
        .bind(&credential.display_name)
        .bind(credential.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                LedgerError::DuplicateShortId(credential.short_id.clone())
            }
            other => LedgerError::Database(other),
        })?;

        Ok(ManagedCredential {
            id: result.last_insert_rowid(),
            owner_id: credential.owner_id,
            client_id: credential.client_id,
            short_id: credential.short_id,
            server_name: credential.server_name,
            display_name: credential.display_name,
            created_at: credential.created_at,
        })
    }

    async fn get(&self, id: i64) -> Result<Option<ManagedCredential>, LedgerError> {
        let row = sqlx::query("SELECT * FROM keys WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::from_row).transpose()
    }

    async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<ManagedCredential>, LedgerError> {
        let rows = sqlx::query("SELECT * FROM keys WHERE user_id = ? ORDER BY id")
            .bind(owner_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::from_row).collect()
    }

    async fn count_by_owner(&self, owner_id: &str) -> Result<u64, LedgerError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM keys WHERE user_id = ?")
            .bind(owner_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn delete(&self, id: i64) -> Result<bool, LedgerError> {
        let result = sqlx::query("DELETE FROM keys WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn new_credential(owner: &str, short_id: &str) -> NewCredential {
        NewCredential {
            owner_id: owner.to_string(),
            client_id: uuid::Uuid::new_v4().to_string(),
            short_id: short_id.to_string(),
            server_name: "Frankfurt".to_string(),
            display_name: "Frankfurt_1".to_string(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_insert_assigns_increasing_ids() {
        let ledger = SqliteCredentialLedger::in_memory().await.unwrap();

        let first = ledger.insert(new_credential("42", "0011223344556677")).await.unwrap();
        let second = ledger.insert(new_credential("42", "8899aabbccddeeff")).await.unwrap();

        assert!(second.id > first.id);
        assert_eq!(ledger.get(first.id).await.unwrap().unwrap(), first);
    }

    #[tokio::test]
    async fn test_duplicate_short_id_is_rejected() {
        let ledger = SqliteCredentialLedger::in_memory().await.unwrap();
        ledger.insert(new_credential("1", "deadbeefdeadbeef")).await.unwrap();

        let err = ledger
            .insert(new_credential("2", "deadbeefdeadbeef"))
            .await
            .unwrap_err();

        assert!(matches!(err, LedgerError::DuplicateShortId(ref sid) if sid == "deadbeefdeadbeef"));
        assert_eq!(ledger.count_by_owner("2").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_list_and_count_by_owner() {
        let ledger = SqliteCredentialLedger::in_memory().await.unwrap();
        ledger.insert(new_credential("a", "0000000000000001")).await.unwrap();
        ledger.insert(new_credential("b", "0000000000000002")).await.unwrap();
        ledger.insert(new_credential("a", "0000000000000003")).await.unwrap();

        let keys = ledger.list_by_owner("a").await.unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys[0].id < keys[1].id);
        assert_eq!(ledger.count_by_owner("a").await.unwrap(), 2);
        assert_eq!(ledger.count_by_owner("nobody").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_reports_whether_row_existed() {
        let ledger = SqliteCredentialLedger::in_memory().await.unwrap();
        let key = ledger.insert(new_credential("a", "0000000000000001")).await.unwrap();

        assert!(ledger.delete(key.id).await.unwrap());
        assert!(!ledger.delete(key.id).await.unwrap());
        assert!(ledger.get(key.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_open_file_ledger_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.db");
        let path = path.to_str().unwrap();

        let id = {
            let ledger = SqliteCredentialLedger::open(path).await.unwrap();
            ledger.insert(new_credential("a", "0000000000000001")).await.unwrap().id
        };

        let reopened = SqliteCredentialLedger::open(path).await.unwrap();
        assert!(reopened.get(id).await.unwrap().is_some());
    }
}
